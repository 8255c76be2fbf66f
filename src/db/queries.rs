//! Database queries

use super::{
    Database, HardwareDescriptor, InvoiceModel, InvoicePurpose, InvoiceStatus, LedgerEntryType,
    ModelDescriptor, NodeModel, PaymentMethod, SessionModel, SessionState, UserModel,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use tracing::info;

/// User queries
pub struct UserQueries<'a> {
    db: &'a Database,
}

impl<'a> UserQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new user; fails on duplicate username
    pub async fn create(&self, username: &str, password_hash: &str) -> Result<UserModel> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO users (username, password_hash, is_admin, balance_sats, created_at)
             VALUES (?1, ?2, 0, 0, ?3)",
            rusqlite::params![username, password_hash, created_at],
        )?;
        let id = conn.last_insert_rowid();
        info!("DB: Created user: id={}, username={}", id, username);
        Ok(UserModel {
            id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            is_admin: false,
            balance_sats: 0,
            created_at,
        })
    }

    /// Get a user by ID
    pub async fn get_by_id(&self, id: i64) -> Result<Option<UserModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                "SELECT id, username, password_hash, is_admin, balance_sats, created_at
                 FROM users WHERE id = ?1",
                [id],
                row_to_user,
            )
            .optional()?;
        Ok(result)
    }

    /// Get a user by username
    pub async fn get_by_username(&self, username: &str) -> Result<Option<UserModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                "SELECT id, username, password_hash, is_admin, balance_sats, created_at
                 FROM users WHERE username = ?1",
                [username],
                row_to_user,
            )
            .optional()?;
        Ok(result)
    }

    /// Store a bearer token for a user
    pub async fn insert_token(
        &self,
        token: &str,
        user_id: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT INTO auth_tokens (token, user_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![token, user_id, Utc::now(), expires_at],
        )?;
        Ok(())
    }

    /// Resolve a bearer token to a user id, honoring expiry
    pub async fn resolve_token(&self, token: &str) -> Result<Option<i64>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result: Option<(i64, DateTime<Utc>)> = conn
            .query_row(
                "SELECT user_id, expires_at FROM auth_tokens WHERE token = ?1",
                [token],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match result {
            Some((user_id, expires_at)) if expires_at > Utc::now() => Ok(Some(user_id)),
            _ => Ok(None),
        }
    }

    /// Drop tokens past their expiry
    pub async fn delete_expired_tokens(&self) -> Result<usize> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM auth_tokens WHERE expires_at <= ?1",
            rusqlite::params![Utc::now()],
        )?;
        Ok(deleted)
    }
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<UserModel> {
    Ok(UserModel {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        is_admin: row.get(3)?,
        balance_sats: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Node queries
pub struct NodeQueries<'a> {
    db: &'a Database,
}

impl<'a> NodeQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a registered node
    pub async fn insert(&self, node: &NodeModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO nodes (id, name, owner_user_id, price_per_minute_sats, endpoint, hardware,
                               models, hw_fingerprint, payment_address, registered_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            rusqlite::params![
                node.id,
                node.name,
                node.owner_user_id,
                node.price_per_minute_sats,
                node.endpoint,
                serde_json::to_string(&node.hardware)?,
                serde_json::to_string(&node.models)?,
                node.hw_fingerprint,
                node.payment_address.as_deref(),
                node.registered_at,
            ],
        )?;
        info!(
            "DB: Inserted node: id={}, owner={}, price={} sat/min",
            node.id, node.owner_user_id, node.price_per_minute_sats
        );
        Ok(())
    }

    /// Get a node by ID
    pub async fn get_by_id(&self, id: &str) -> Result<Option<NodeModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let row: Option<NodeRow> = conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
                [id],
                row_to_node_raw,
            )
            .optional()?;
        row.map(NodeRow::decode).transpose()
    }

    /// List all registered nodes
    pub async fn list_all(&self) -> Result<Vec<NodeModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes ORDER BY registered_at"
        ))?;
        let rows = stmt.query_map([], row_to_node_raw)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?.decode()?);
        }
        Ok(nodes)
    }

    /// List nodes owned by a user
    pub async fn list_by_owner(&self, owner_user_id: i64) -> Result<Vec<NodeModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE owner_user_id = ?1 ORDER BY registered_at"
        ))?;
        let rows = stmt.query_map([owner_user_id], row_to_node_raw)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?.decode()?);
        }
        Ok(nodes)
    }

    /// Check whether an owner already registered this hardware
    pub async fn fingerprint_exists(&self, owner_user_id: i64, fingerprint: &str) -> Result<bool> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE owner_user_id = ?1 AND hw_fingerprint = ?2",
            rusqlite::params![owner_user_id, fingerprint],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Update the offered models and hardware after a heartbeat
    pub async fn update_capabilities(
        &self,
        id: &str,
        hardware: &HardwareDescriptor,
        models: &[ModelDescriptor],
    ) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE nodes SET hardware = ?1, models = ?2 WHERE id = ?3",
            rusqlite::params![
                serde_json::to_string(hardware)?,
                serde_json::to_string(models)?,
                id
            ],
        )?;
        Ok(())
    }

    /// Record a finished session on the node's lifetime counters
    pub async fn record_outcome(&self, id: &str, completed: bool, earned_sats: i64) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        if completed {
            conn.execute(
                "UPDATE nodes SET total_sessions = total_sessions + 1,
                                  completed_sessions = completed_sessions + 1,
                                  total_earned_sats = total_earned_sats + ?1
                 WHERE id = ?2",
                rusqlite::params![earned_sats, id],
            )?;
        } else {
            conn.execute(
                "UPDATE nodes SET total_sessions = total_sessions + 1,
                                  failed_sessions = failed_sessions + 1
                 WHERE id = ?1",
                rusqlite::params![id],
            )?;
        }
        Ok(())
    }
}

const NODE_COLUMNS: &str = "id, name, owner_user_id, price_per_minute_sats, endpoint, hardware, \
                            models, hw_fingerprint, payment_address, registered_at, \
                            total_sessions, completed_sessions, failed_sessions, total_earned_sats";

/// Raw node row before the JSON columns are decoded
struct NodeRow {
    id: String,
    name: String,
    owner_user_id: i64,
    price_per_minute_sats: i64,
    endpoint: String,
    hardware: String,
    models: String,
    hw_fingerprint: String,
    payment_address: Option<String>,
    registered_at: DateTime<Utc>,
    total_sessions: i64,
    completed_sessions: i64,
    failed_sessions: i64,
    total_earned_sats: i64,
}

impl NodeRow {
    fn decode(self) -> Result<NodeModel> {
        Ok(NodeModel {
            hardware: serde_json::from_str(&self.hardware)?,
            models: serde_json::from_str(&self.models)?,
            id: self.id,
            name: self.name,
            owner_user_id: self.owner_user_id,
            price_per_minute_sats: self.price_per_minute_sats,
            endpoint: self.endpoint,
            hw_fingerprint: self.hw_fingerprint,
            payment_address: self.payment_address,
            registered_at: self.registered_at,
            total_sessions: self.total_sessions,
            completed_sessions: self.completed_sessions,
            failed_sessions: self.failed_sessions,
            total_earned_sats: self.total_earned_sats,
        })
    }
}

fn row_to_node_raw(row: &Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        id: row.get(0)?,
        name: row.get(1)?,
        owner_user_id: row.get(2)?,
        price_per_minute_sats: row.get(3)?,
        endpoint: row.get(4)?,
        hardware: row.get(5)?,
        models: row.get(6)?,
        hw_fingerprint: row.get(7)?,
        payment_address: row.get(8)?,
        registered_at: row.get(9)?,
        total_sessions: row.get(10)?,
        completed_sessions: row.get(11)?,
        failed_sessions: row.get(12)?,
        total_earned_sats: row.get(13)?,
    })
}

/// Session queries
pub struct SessionQueries<'a> {
    db: &'a Database,
}

impl<'a> SessionQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new session
    pub async fn insert(&self, session: &SessionModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO sessions (id, user_id, node_id, model, hf_repo, context_length,
                                  minutes_purchased, amount_sats, state, payment_method,
                                  payment_reference, refund_sats, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            rusqlite::params![
                session.id,
                session.user_id,
                session.node_id,
                session.model,
                session.hf_repo.as_deref(),
                session.context_length,
                session.minutes_purchased,
                session.amount_sats,
                session.state.as_str(),
                session.payment_method.as_str(),
                session.payment_reference.as_deref(),
                session.refund_sats,
                session.created_at,
            ],
        )?;
        info!(
            "DB: Inserted session: id={}, user={}, node={}, model={}, minutes={}, amount={}",
            session.id,
            session.user_id,
            session.node_id,
            session.model,
            session.minutes_purchased,
            session.amount_sats
        );
        Ok(())
    }

    /// Get a session by ID
    pub async fn get_by_id(&self, id: &str) -> Result<Option<SessionModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let row: Option<SessionRow> = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                [id],
                row_to_session_raw,
            )
            .optional()?;
        row.map(SessionRow::decode).transpose()
    }

    /// List sessions in a given state
    pub async fn list_by_state(&self, state: SessionState) -> Result<Vec<SessionModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE state = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map([state.as_str()], row_to_session_raw)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?.decode()?);
        }
        Ok(sessions)
    }

    /// List every session that has not reached a terminal state
    pub async fn list_non_terminal(&self) -> Result<Vec<SessionModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE state != 'ended' ORDER BY created_at"
        ))?;
        let rows = stmt.query_map([], row_to_session_raw)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?.decode()?);
        }
        Ok(sessions)
    }

    /// Observe a payment exactly once.
    ///
    /// The `paid_at IS NULL` precondition makes duplicate observations
    /// (invoice reported settled twice, poll racing a client check) no-ops.
    pub async fn mark_paid(&self, id: &str, paid_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let updated = conn.execute(
            "UPDATE sessions SET state = 'starting', paid_at = ?1
             WHERE id = ?2 AND paid_at IS NULL AND state = 'pending_payment'",
            rusqlite::params![paid_at, id],
        )?;
        Ok(updated > 0)
    }

    /// Activate a session exactly once; sets the immutable expiry
    pub async fn mark_active(
        &self,
        id: &str,
        started_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let updated = conn.execute(
            "UPDATE sessions SET state = 'active', started_at = ?1, expires_at = ?2
             WHERE id = ?3 AND state = 'starting' AND started_at IS NULL",
            rusqlite::params![started_at, expires_at, id],
        )?;
        Ok(updated > 0)
    }

    /// Guarded state transition; returns false when the guard did not hold
    pub async fn transition(
        &self,
        id: &str,
        from: SessionState,
        to: SessionState,
    ) -> Result<bool> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let updated = conn.execute(
            "UPDATE sessions SET state = ?1 WHERE id = ?2 AND state = ?3",
            rusqlite::params![to.as_str(), id, from.as_str()],
        )?;
        Ok(updated > 0)
    }

    /// Terminate a session exactly once, recording any refund
    pub async fn mark_ended(
        &self,
        id: &str,
        from: SessionState,
        refund_sats: i64,
        ended_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let updated = conn.execute(
            "UPDATE sessions SET state = 'ended', refund_sats = ?1, ended_at = ?2
             WHERE id = ?3 AND state = ?4",
            rusqlite::params![refund_sats, ended_at, id, from.as_str()],
        )?;
        Ok(updated > 0)
    }

    /// Active sessions whose expiry has passed
    pub async fn list_expired_active(&self, now: DateTime<Utc>) -> Result<Vec<SessionModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE state = 'active' AND expires_at IS NOT NULL AND expires_at <= ?1"
        ))?;
        let rows = stmt.query_map(rusqlite::params![now], row_to_session_raw)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?.decode()?);
        }
        Ok(sessions)
    }

    /// The non-ended session currently referencing a node, if any
    pub async fn open_session_for_node(&self, node_id: &str) -> Result<Option<SessionModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let row: Option<SessionRow> = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE node_id = ?1 AND state IN ('starting', 'active')
                     ORDER BY created_at DESC LIMIT 1"
                ),
                [node_id],
                row_to_session_raw,
            )
            .optional()?;
        row.map(SessionRow::decode).transpose()
    }
}

const SESSION_COLUMNS: &str = "id, user_id, node_id, model, hf_repo, context_length, \
                               minutes_purchased, amount_sats, state, payment_method, \
                               payment_reference, refund_sats, created_at, paid_at, started_at, \
                               expires_at, ended_at";

/// Raw session row before the enum columns are decoded
struct SessionRow {
    id: String,
    user_id: i64,
    node_id: String,
    model: String,
    hf_repo: Option<String>,
    context_length: u32,
    minutes_purchased: u32,
    amount_sats: i64,
    state: String,
    payment_method: String,
    payment_reference: Option<String>,
    refund_sats: i64,
    created_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl SessionRow {
    fn decode(self) -> Result<SessionModel> {
        let state = SessionState::parse(&self.state)
            .ok_or_else(|| anyhow!("unknown session state: {}", self.state))?;
        let payment_method = PaymentMethod::parse(&self.payment_method)
            .ok_or_else(|| anyhow!("unknown payment method: {}", self.payment_method))?;
        Ok(SessionModel {
            id: self.id,
            user_id: self.user_id,
            node_id: self.node_id,
            model: self.model,
            hf_repo: self.hf_repo,
            context_length: self.context_length,
            minutes_purchased: self.minutes_purchased,
            amount_sats: self.amount_sats,
            state,
            payment_method,
            payment_reference: self.payment_reference,
            refund_sats: self.refund_sats,
            created_at: self.created_at,
            paid_at: self.paid_at,
            started_at: self.started_at,
            expires_at: self.expires_at,
            ended_at: self.ended_at,
        })
    }
}

fn row_to_session_raw(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        node_id: row.get(2)?,
        model: row.get(3)?,
        hf_repo: row.get(4)?,
        context_length: row.get(5)?,
        minutes_purchased: row.get(6)?,
        amount_sats: row.get(7)?,
        state: row.get(8)?,
        payment_method: row.get(9)?,
        payment_reference: row.get(10)?,
        refund_sats: row.get(11)?,
        created_at: row.get(12)?,
        paid_at: row.get(13)?,
        started_at: row.get(14)?,
        expires_at: row.get(15)?,
        ended_at: row.get(16)?,
    })
}

/// Invoice queries
pub struct InvoiceQueries<'a> {
    db: &'a Database,
}

impl<'a> InvoiceQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new invoice
    pub async fn insert(&self, invoice: &InvoiceModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO invoices (payment_hash, bolt11, amount_sats, purpose, related_id,
                                  status, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            rusqlite::params![
                invoice.payment_hash,
                invoice.bolt11,
                invoice.amount_sats,
                invoice.purpose.as_str(),
                invoice.related_id,
                invoice.status.as_str(),
                invoice.created_at,
                invoice.expires_at,
            ],
        )?;
        info!(
            "DB: Inserted invoice: hash={}, purpose={}, related={}, amount={}",
            invoice.payment_hash,
            invoice.purpose.as_str(),
            invoice.related_id,
            invoice.amount_sats
        );
        Ok(())
    }

    /// Get an invoice by payment hash
    pub async fn get_by_hash(&self, payment_hash: &str) -> Result<Option<InvoiceModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let row: Option<InvoiceRow> = conn
            .query_row(
                &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE payment_hash = ?1"),
                [payment_hash],
                row_to_invoice_raw,
            )
            .optional()?;
        row.map(InvoiceRow::decode).transpose()
    }

    /// Flip an invoice to paid exactly once, after daemon confirmation
    pub async fn mark_paid(&self, payment_hash: &str, paid_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let updated = conn.execute(
            "UPDATE invoices SET status = 'paid', paid_at = ?1
             WHERE payment_hash = ?2 AND status = 'pending'",
            rusqlite::params![paid_at, payment_hash],
        )?;
        Ok(updated > 0)
    }

    /// Flip an invoice to expired
    pub async fn mark_expired(&self, payment_hash: &str) -> Result<bool> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let updated = conn.execute(
            "UPDATE invoices SET status = 'expired'
             WHERE payment_hash = ?1 AND status = 'pending'",
            [payment_hash],
        )?;
        Ok(updated > 0)
    }

    /// List pending invoices, optionally restricted by purpose
    pub async fn list_pending(&self, purpose: Option<InvoicePurpose>) -> Result<Vec<InvoiceModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut invoices = Vec::new();
        match purpose {
            Some(purpose) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {INVOICE_COLUMNS} FROM invoices
                     WHERE status = 'pending' AND purpose = ?1 ORDER BY created_at"
                ))?;
                let rows = stmt.query_map([purpose.as_str()], row_to_invoice_raw)?;
                for row in rows {
                    invoices.push(row?.decode()?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {INVOICE_COLUMNS} FROM invoices
                     WHERE status = 'pending' ORDER BY created_at"
                ))?;
                let rows = stmt.query_map([], row_to_invoice_raw)?;
                for row in rows {
                    invoices.push(row?.decode()?);
                }
            }
        }
        Ok(invoices)
    }

    /// Delete unpaid invoices that expired more than the grace period ago
    pub async fn delete_garbage(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM invoices WHERE status != 'paid' AND expires_at < ?1",
            rusqlite::params![cutoff],
        )?;
        if deleted > 0 {
            info!("DB: Garbage-collected {} expired invoices", deleted);
        }
        Ok(deleted)
    }
}

const INVOICE_COLUMNS: &str =
    "payment_hash, bolt11, amount_sats, purpose, related_id, status, created_at, expires_at, paid_at";

/// Raw invoice row before the enum columns are decoded
struct InvoiceRow {
    payment_hash: String,
    bolt11: String,
    amount_sats: i64,
    purpose: String,
    related_id: String,
    status: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
}

impl InvoiceRow {
    fn decode(self) -> Result<InvoiceModel> {
        let purpose = InvoicePurpose::parse(&self.purpose)
            .ok_or_else(|| anyhow!("unknown invoice purpose: {}", self.purpose))?;
        let status = InvoiceStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("unknown invoice status: {}", self.status))?;
        Ok(InvoiceModel {
            payment_hash: self.payment_hash,
            bolt11: self.bolt11,
            amount_sats: self.amount_sats,
            purpose,
            related_id: self.related_id,
            status,
            created_at: self.created_at,
            expires_at: self.expires_at,
            paid_at: self.paid_at,
        })
    }
}

fn row_to_invoice_raw(row: &Row<'_>) -> rusqlite::Result<InvoiceRow> {
    Ok(InvoiceRow {
        payment_hash: row.get(0)?,
        bolt11: row.get(1)?,
        amount_sats: row.get(2)?,
        purpose: row.get(3)?,
        related_id: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
        expires_at: row.get(7)?,
        paid_at: row.get(8)?,
    })
}

/// Ledger history queries (mutations live in [`crate::ledger`])
pub struct LedgerQueries<'a> {
    db: &'a Database,
}

impl<'a> LedgerQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Paginated transaction history, newest first
    pub async fn list_for_user(
        &self,
        user_id: i64,
        page: u32,
        size: u32,
    ) -> Result<(Vec<super::LedgerEntryModel>, u64)> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ledger_transactions WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        let offset = (page.saturating_sub(1) as i64) * size as i64;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, type, amount_sats, fee_sats, description, related_session_id, created_at
             FROM ledger_transactions WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![user_id, size as i64, offset],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, DateTime<Utc>>(7)?,
                ))
            },
        )?;
        let mut entries = Vec::new();
        for row in rows {
            let (id, user_id, entry_type, amount_sats, fee_sats, description, related, created_at) =
                row?;
            let entry_type = LedgerEntryType::parse(&entry_type)
                .ok_or_else(|| anyhow!("unknown ledger entry type: {}", entry_type))?;
            entries.push(super::LedgerEntryModel {
                id,
                user_id,
                entry_type,
                amount_sats,
                fee_sats,
                description,
                related_session_id: related,
                created_at,
            });
        }
        Ok((entries, total as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn test_db() -> Database {
        Database::connect("sqlite::memory:").await.unwrap()
    }

    /// Insert the user and node rows that `sample_session` references, so
    /// FK-constrained session inserts succeed.
    async fn seed_session_fixtures(db: &Database) {
        let user = UserQueries::new(db).create("alice", "digest").await.unwrap();
        let node = NodeModel {
            id: "node-1".to_string(),
            name: "rig".to_string(),
            owner_user_id: user.id,
            price_per_minute_sats: 100,
            endpoint: "http://10.0.0.1:9000".to_string(),
            hardware: HardwareDescriptor::default(),
            models: vec![],
            hw_fingerprint: "fp-1".to_string(),
            payment_address: None,
            registered_at: Utc::now(),
            total_sessions: 0,
            completed_sessions: 0,
            failed_sessions: 0,
            total_earned_sats: 0,
        };
        NodeQueries::new(db).insert(&node).await.unwrap();
    }

    fn sample_session(id: &str, state: SessionState) -> SessionModel {
        SessionModel {
            id: id.to_string(),
            user_id: 1,
            node_id: "node-1".to_string(),
            model: "tiny".to_string(),
            hf_repo: None,
            context_length: 4096,
            minutes_purchased: 5,
            amount_sats: 500,
            state,
            payment_method: PaymentMethod::Lightning,
            payment_reference: Some("hash-1".to_string()),
            refund_sats: 0,
            created_at: Utc::now(),
            paid_at: None,
            started_at: None,
            expires_at: None,
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn user_create_and_lookup() {
        let db = test_db().await;
        let users = UserQueries::new(&db);
        let user = users.create("alice", "digest").await.unwrap();
        assert_eq!(user.balance_sats, 0);

        let found = users.get_by_username("alice").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert!(users.get_by_username("bob").await.unwrap().is_none());

        // Duplicate username is rejected by the unique index
        assert!(users.create("alice", "digest").await.is_err());
    }

    #[tokio::test]
    async fn token_resolution_honors_expiry() {
        let db = test_db().await;
        let users = UserQueries::new(&db);
        let user = users.create("alice", "digest").await.unwrap();

        users
            .insert_token("tok-live", user.id, Utc::now() + chrono::Duration::hours(24))
            .await
            .unwrap();
        users
            .insert_token("tok-dead", user.id, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(users.resolve_token("tok-live").await.unwrap(), Some(user.id));
        assert_eq!(users.resolve_token("tok-dead").await.unwrap(), None);
        assert_eq!(users.resolve_token("tok-none").await.unwrap(), None);

        assert_eq!(users.delete_expired_tokens().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn session_paid_exactly_once() {
        let db = test_db().await;
        seed_session_fixtures(&db).await;
        let sessions = SessionQueries::new(&db);
        sessions
            .insert(&sample_session("s1", SessionState::PendingPayment))
            .await
            .unwrap();

        let now = Utc::now();
        assert!(sessions.mark_paid("s1", now).await.unwrap());
        // A duplicate observation is a no-op
        assert!(!sessions.mark_paid("s1", now).await.unwrap());

        let session = sessions.get_by_id("s1").await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Starting);
        assert!(session.paid_at.is_some());
    }

    #[tokio::test]
    async fn session_activation_sets_expiry_once() {
        let db = test_db().await;
        seed_session_fixtures(&db).await;
        let sessions = SessionQueries::new(&db);
        sessions
            .insert(&sample_session("s1", SessionState::PendingPayment))
            .await
            .unwrap();
        let now = Utc::now();
        sessions.mark_paid("s1", now).await.unwrap();

        let expires = now + chrono::Duration::minutes(5);
        assert!(sessions.mark_active("s1", now, expires).await.unwrap());
        assert!(!sessions.mark_active("s1", now, expires).await.unwrap());

        let session = sessions.get_by_id("s1").await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Active);
        assert!(session.expires_at.is_some());
    }

    #[tokio::test]
    async fn guarded_transition_rejects_wrong_source() {
        let db = test_db().await;
        seed_session_fixtures(&db).await;
        let sessions = SessionQueries::new(&db);
        sessions
            .insert(&sample_session("s1", SessionState::PendingPayment))
            .await
            .unwrap();

        // Session is pending_payment, so active -> settling does not apply
        assert!(!sessions
            .transition("s1", SessionState::Active, SessionState::Settling)
            .await
            .unwrap());
        assert!(sessions
            .transition("s1", SessionState::PendingPayment, SessionState::Ended)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_active_listing() {
        let db = test_db().await;
        seed_session_fixtures(&db).await;
        let sessions = SessionQueries::new(&db);
        sessions
            .insert(&sample_session("s1", SessionState::PendingPayment))
            .await
            .unwrap();
        let started = Utc::now() - chrono::Duration::minutes(10);
        sessions.mark_paid("s1", started).await.unwrap();
        sessions
            .mark_active("s1", started, started + chrono::Duration::minutes(5))
            .await
            .unwrap();

        let expired = sessions.list_expired_active(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "s1");
    }

    #[tokio::test]
    async fn invoice_paid_exactly_once() {
        let db = test_db().await;
        let invoices = InvoiceQueries::new(&db);
        let now = Utc::now();
        invoices
            .insert(&InvoiceModel {
                payment_hash: "hash-1".to_string(),
                bolt11: "lnbc1...".to_string(),
                amount_sats: 500,
                purpose: InvoicePurpose::Session,
                related_id: "s1".to_string(),
                status: InvoiceStatus::Pending,
                created_at: now,
                expires_at: now + chrono::Duration::hours(1),
                paid_at: None,
            })
            .await
            .unwrap();

        assert!(invoices.mark_paid("hash-1", now).await.unwrap());
        assert!(!invoices.mark_paid("hash-1", now).await.unwrap());
        // A paid invoice can no longer expire
        assert!(!invoices.mark_expired("hash-1").await.unwrap());

        let invoice = invoices.get_by_hash("hash-1").await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn invoice_garbage_collection_spares_paid() {
        let db = test_db().await;
        let invoices = InvoiceQueries::new(&db);
        let old = Utc::now() - chrono::Duration::days(3);
        for (hash, status) in [("h-pending", InvoiceStatus::Pending), ("h-paid", InvoiceStatus::Paid)]
        {
            invoices
                .insert(&InvoiceModel {
                    payment_hash: hash.to_string(),
                    bolt11: "lnbc1...".to_string(),
                    amount_sats: 100,
                    purpose: InvoicePurpose::Deposit,
                    related_id: "1".to_string(),
                    status: InvoiceStatus::Pending,
                    created_at: old,
                    expires_at: old + chrono::Duration::hours(1),
                    paid_at: None,
                })
                .await
                .unwrap();
            if status == InvoiceStatus::Paid {
                invoices.mark_paid(hash, old).await.unwrap();
            }
        }

        let deleted = invoices
            .delete_garbage(Utc::now() - chrono::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(invoices.get_by_hash("h-paid").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn pending_invoices_filter_by_purpose() {
        let db = test_db().await;
        let invoices = InvoiceQueries::new(&db);
        let now = Utc::now();
        invoices
            .insert(&InvoiceModel {
                payment_hash: "h-dep".to_string(),
                bolt11: "lnbc1...".to_string(),
                amount_sats: 100,
                purpose: InvoicePurpose::Deposit,
                related_id: "1".to_string(),
                status: InvoiceStatus::Pending,
                created_at: now,
                expires_at: now + chrono::Duration::hours(1),
                paid_at: None,
            })
            .await
            .unwrap();

        assert_eq!(invoices.list_pending(None).await.unwrap().len(), 1);
        assert_eq!(
            invoices
                .list_pending(Some(InvoicePurpose::Deposit))
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(invoices
            .list_pending(Some(InvoicePurpose::Session))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn node_fingerprint_uniqueness() {
        let db = test_db().await;
        let nodes = NodeQueries::new(&db);
        let node = NodeModel {
            id: "node-1".to_string(),
            name: "rig".to_string(),
            owner_user_id: 1,
            price_per_minute_sats: 100,
            endpoint: "http://10.0.0.1:9000".to_string(),
            hardware: HardwareDescriptor::default(),
            models: vec![],
            hw_fingerprint: "fp-1".to_string(),
            payment_address: None,
            registered_at: Utc::now(),
            total_sessions: 0,
            completed_sessions: 0,
            failed_sessions: 0,
            total_earned_sats: 0,
        };
        nodes.insert(&node).await.unwrap();

        assert!(nodes.fingerprint_exists(1, "fp-1").await.unwrap());
        assert!(!nodes.fingerprint_exists(2, "fp-1").await.unwrap());

        let mut dup = node.clone();
        dup.id = "node-2".to_string();
        assert!(nodes.insert(&dup).await.is_err());
    }
}
