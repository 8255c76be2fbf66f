//! Internal balance ledger
//!
//! Every balance mutation inserts exactly one row into `ledger_transactions`
//! and updates `users.balance_sats` inside the same database transaction, so
//! `SUM(amount_sats)` per user always equals the stored balance. Concurrent
//! operations on the same user are serialized by the connection.

use crate::db::{Database, LedgerEntryType, HOUSE_ACCOUNT};
use crate::{CoordinatorError, CoordResult};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

/// One leg of a ledger operation
struct Entry<'a> {
    user_id: i64,
    entry_type: LedgerEntryType,
    /// Signed satoshis; negative amounts require sufficient balance
    amount_sats: i64,
    fee_sats: i64,
    description: &'a str,
    related_session_id: Option<&'a str>,
}

/// The internal balance ledger
#[derive(Clone)]
pub struct Ledger {
    db: Database,
}

impl Ledger {
    /// Create a ledger over the shared database
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Credit a user's balance
    pub async fn credit(
        &self,
        user_id: i64,
        amount_sats: u64,
        entry_type: LedgerEntryType,
        description: &str,
        related_session_id: Option<&str>,
    ) -> CoordResult<i64> {
        if amount_sats == 0 {
            return Err(CoordinatorError::Validation(
                "Credit amount must be positive".to_string(),
            ));
        }
        let balance = self
            .apply(&[Entry {
                user_id,
                entry_type,
                amount_sats: amount_sats as i64,
                fee_sats: 0,
                description,
                related_session_id,
            }])
            .await?;
        info!(
            "Ledger: credited user={} amount={} type={} balance={}",
            user_id,
            amount_sats,
            entry_type.as_str(),
            balance
        );
        Ok(balance)
    }

    /// Debit a user's balance; fails when the balance does not cover it
    pub async fn debit(
        &self,
        user_id: i64,
        amount_sats: u64,
        entry_type: LedgerEntryType,
        description: &str,
        related_session_id: Option<&str>,
    ) -> CoordResult<i64> {
        if amount_sats == 0 {
            return Err(CoordinatorError::Validation(
                "Debit amount must be positive".to_string(),
            ));
        }
        let balance = self
            .apply(&[Entry {
                user_id,
                entry_type,
                amount_sats: -(amount_sats as i64),
                fee_sats: 0,
                description,
                related_session_id,
            }])
            .await?;
        info!(
            "Ledger: debited user={} amount={} type={} balance={}",
            user_id,
            amount_sats,
            entry_type.as_str(),
            balance
        );
        Ok(balance)
    }

    /// Atomic debit plus two credits: payee receives `amount - fee`, the
    /// house account receives `fee`. All-or-nothing.
    #[allow(clippy::too_many_arguments)]
    pub async fn transfer(
        &self,
        from_user: i64,
        to_user: i64,
        amount_sats: u64,
        fee_sats: u64,
        type_out: LedgerEntryType,
        type_in: LedgerEntryType,
        description: &str,
        related_session_id: Option<&str>,
    ) -> CoordResult<()> {
        if amount_sats == 0 || fee_sats > amount_sats {
            return Err(CoordinatorError::Validation(
                "Transfer amount must be positive and cover the fee".to_string(),
            ));
        }
        let house = self.house_account_id().await?;
        let mut entries = vec![
            Entry {
                user_id: from_user,
                entry_type: type_out,
                amount_sats: -(amount_sats as i64),
                fee_sats: fee_sats as i64,
                description,
                related_session_id,
            },
            Entry {
                user_id: to_user,
                entry_type: type_in,
                amount_sats: (amount_sats - fee_sats) as i64,
                fee_sats: 0,
                description,
                related_session_id,
            },
        ];
        if fee_sats > 0 {
            entries.push(Entry {
                user_id: house,
                entry_type: LedgerEntryType::Commission,
                amount_sats: fee_sats as i64,
                fee_sats: 0,
                description,
                related_session_id,
            });
        }
        self.apply(&entries).await?;
        info!(
            "Ledger: transferred {} sats from user={} to user={} (fee={})",
            amount_sats, from_user, to_user, fee_sats
        );
        Ok(())
    }

    /// Settlement credits for a finished session: the node owner's earning
    /// and the house commission, atomically.
    pub async fn settle_session(
        &self,
        owner_user_id: i64,
        earning_sats: u64,
        commission_sats: u64,
        session_id: &str,
    ) -> CoordResult<()> {
        let house = self.house_account_id().await?;
        let description = format!("Settlement for session {session_id}");
        let mut entries = Vec::new();
        if earning_sats > 0 {
            entries.push(Entry {
                user_id: owner_user_id,
                entry_type: LedgerEntryType::NodeEarning,
                amount_sats: earning_sats as i64,
                fee_sats: 0,
                description: &description,
                related_session_id: Some(session_id),
            });
        }
        if commission_sats > 0 {
            entries.push(Entry {
                user_id: house,
                entry_type: LedgerEntryType::Commission,
                amount_sats: commission_sats as i64,
                fee_sats: 0,
                description: &description,
                related_session_id: Some(session_id),
            });
        }
        if entries.is_empty() {
            return Ok(());
        }
        self.apply(&entries).await?;
        info!(
            "Ledger: settled session={} earning={} commission={}",
            session_id, earning_sats, commission_sats
        );
        Ok(())
    }

    /// Current balance; authoritative only within the ledger itself
    pub async fn balance(&self, user_id: i64) -> CoordResult<i64> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.query_row(
            "SELECT balance_sats FROM users WHERE id = ?1",
            [user_id],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                CoordinatorError::NotFound(format!("user {user_id}"))
            }
            e => CoordinatorError::Database(e.to_string()),
        })
    }

    /// Amount of an existing entry of the given type for a session, if any.
    ///
    /// Used to make settlement and refund effects idempotent across crashes:
    /// an entry that already exists is never written again.
    pub async fn session_entry_amount(
        &self,
        session_id: &str,
        entry_type: LedgerEntryType,
    ) -> CoordResult<Option<i64>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let amount: Option<i64> = conn
            .query_row(
                "SELECT amount_sats FROM ledger_transactions
                 WHERE related_session_id = ?1 AND type = ?2 LIMIT 1",
                rusqlite::params![session_id, entry_type.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| CoordinatorError::Database(e.to_string()))?;
        Ok(amount)
    }

    /// Resolve the house account's user id
    pub async fn house_account_id(&self) -> CoordResult<i64> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.query_row(
            "SELECT id FROM users WHERE username = ?1",
            [HOUSE_ACCOUNT],
            |row| row.get(0),
        )
        .map_err(|e| CoordinatorError::Database(format!("house account missing: {e}")))
    }

    /// Apply a batch of entries in one database transaction.
    ///
    /// Returns the final balance of the first entry's user. Any leg that
    /// would push a balance negative aborts the whole batch.
    async fn apply(&self, entries: &[Entry<'_>]) -> CoordResult<i64> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| CoordinatorError::Database(e.to_string()))?;

        let mut first_balance = 0;
        for (i, entry) in entries.iter().enumerate() {
            let balance = apply_entry(&tx, entry)?;
            if i == 0 {
                first_balance = balance;
            }
        }

        tx.commit()
            .map_err(|e| CoordinatorError::Database(e.to_string()))?;
        Ok(first_balance)
    }
}

/// Apply one entry inside an open transaction; returns the new balance
fn apply_entry(tx: &Connection, entry: &Entry<'_>) -> CoordResult<i64> {
    let balance: i64 = tx
        .query_row(
            "SELECT balance_sats FROM users WHERE id = ?1",
            [entry.user_id],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                CoordinatorError::NotFound(format!("user {}", entry.user_id))
            }
            e => CoordinatorError::Database(e.to_string()),
        })?;

    let new_balance = balance + entry.amount_sats;
    if new_balance < 0 {
        debug!(
            "Ledger: insufficient funds for user={}: balance={}, requested={}",
            entry.user_id, balance, entry.amount_sats
        );
        return Err(CoordinatorError::InsufficientFunds(format!(
            "balance {} sats does not cover {} sats",
            balance,
            entry.amount_sats.unsigned_abs()
        )));
    }

    tx.execute(
        "UPDATE users SET balance_sats = ?1 WHERE id = ?2",
        rusqlite::params![new_balance, entry.user_id],
    )
    .map_err(|e| CoordinatorError::Database(e.to_string()))?;

    tx.execute(
        r#"
        INSERT INTO ledger_transactions (user_id, type, amount_sats, fee_sats, description,
                                         related_session_id, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        rusqlite::params![
            entry.user_id,
            entry.entry_type.as_str(),
            entry.amount_sats,
            entry.fee_sats,
            entry.description,
            entry.related_session_id,
            Utc::now(),
        ],
    )
    .map_err(|e| CoordinatorError::Database(e.to_string()))?;

    Ok(new_balance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::UserQueries;

    async fn setup() -> (Database, Ledger, i64) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let user = UserQueries::new(&db).create("alice", "digest").await.unwrap();
        let ledger = Ledger::new(db.clone());
        (db, ledger, user.id)
    }

    /// Every user's stored balance must equal the sum of their ledger rows.
    async fn assert_conservation(db: &Database) {
        let conn = db.conn();
        let conn = conn.lock().await;
        let mismatches: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM users u
                 WHERE u.balance_sats != COALESCE(
                     (SELECT SUM(amount_sats) FROM ledger_transactions t WHERE t.user_id = u.id), 0)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(mismatches, 0, "balance does not match ledger sum");
    }

    #[tokio::test]
    async fn credit_and_debit_update_balance() {
        let (db, ledger, user) = setup().await;

        let balance = ledger
            .credit(user, 1_000, LedgerEntryType::Deposit, "deposit", None)
            .await
            .unwrap();
        assert_eq!(balance, 1_000);

        let balance = ledger
            .debit(user, 400, LedgerEntryType::SessionPayment, "session", Some("s1"))
            .await
            .unwrap();
        assert_eq!(balance, 600);

        assert_eq!(ledger.balance(user).await.unwrap(), 600);
        assert_conservation(&db).await;
    }

    #[tokio::test]
    async fn debit_rejects_overdraft() {
        let (db, ledger, user) = setup().await;
        ledger
            .credit(user, 100, LedgerEntryType::Deposit, "deposit", None)
            .await
            .unwrap();

        let err = ledger
            .debit(user, 101, LedgerEntryType::SessionPayment, "session", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InsufficientFunds(_)));

        // The failed debit left no row and no balance change behind
        assert_eq!(ledger.balance(user).await.unwrap(), 100);
        assert_conservation(&db).await;
    }

    #[tokio::test]
    async fn zero_amounts_are_rejected() {
        let (_db, ledger, user) = setup().await;
        assert!(ledger
            .credit(user, 0, LedgerEntryType::Deposit, "nothing", None)
            .await
            .is_err());
        assert!(ledger
            .debit(user, 0, LedgerEntryType::Withdrawal, "nothing", None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn transfer_is_all_or_nothing() {
        let (db, ledger, alice) = setup().await;
        let bob = UserQueries::new(&db).create("bob", "digest").await.unwrap().id;

        // Alice cannot cover the transfer: nothing moves
        let err = ledger
            .transfer(
                alice,
                bob,
                500,
                50,
                LedgerEntryType::SessionPayment,
                LedgerEntryType::NodeEarning,
                "session s1",
                Some("s1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InsufficientFunds(_)));
        assert_eq!(ledger.balance(alice).await.unwrap(), 0);
        assert_eq!(ledger.balance(bob).await.unwrap(), 0);

        ledger
            .credit(alice, 1_000, LedgerEntryType::Deposit, "deposit", None)
            .await
            .unwrap();
        ledger
            .transfer(
                alice,
                bob,
                500,
                50,
                LedgerEntryType::SessionPayment,
                LedgerEntryType::NodeEarning,
                "session s1",
                Some("s1"),
            )
            .await
            .unwrap();

        let house = ledger.house_account_id().await.unwrap();
        assert_eq!(ledger.balance(alice).await.unwrap(), 500);
        assert_eq!(ledger.balance(bob).await.unwrap(), 450);
        assert_eq!(ledger.balance(house).await.unwrap(), 50);
        assert_conservation(&db).await;
    }

    #[tokio::test]
    async fn settlement_credits_owner_and_house() {
        let (db, ledger, owner) = setup().await;
        ledger.settle_session(owner, 450, 50, "s1").await.unwrap();

        let house = ledger.house_account_id().await.unwrap();
        assert_eq!(ledger.balance(owner).await.unwrap(), 450);
        assert_eq!(ledger.balance(house).await.unwrap(), 50);
        assert_conservation(&db).await;

        // A zero-amount settlement is a no-op, not an error
        ledger.settle_session(owner, 0, 0, "s2").await.unwrap();
        assert_eq!(ledger.balance(owner).await.unwrap(), 450);
    }

    #[tokio::test]
    async fn concurrent_debits_never_overdraw() {
        let (db, ledger, user) = setup().await;
        ledger
            .credit(user, 500, LedgerEntryType::Deposit, "deposit", None)
            .await
            .unwrap();

        // Ten tasks race to debit 100 sats each; only five can win
        let mut handles = Vec::new();
        for i in 0..10 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .debit(
                        user,
                        100,
                        LedgerEntryType::SessionPayment,
                        &format!("race {i}"),
                        None,
                    )
                    .await
                    .is_ok()
            }));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 5);
        assert_eq!(ledger.balance(user).await.unwrap(), 0);
        assert_conservation(&db).await;
    }
}
