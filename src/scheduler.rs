//! Expiry, heartbeat and invoice-poll scheduler
//!
//! One component owns every clock in the system:
//!
//! - an expiry scan fires `ExpiryTick` for active sessions past their
//!   `expires_at` and `StartingDeadline` for stuck loads; scanning the
//!   database makes the ticks idempotent and re-armed for free after a
//!   restart,
//! - a liveness sweep marks silent nodes offline and fails the sessions
//!   they were serving,
//! - an invoice poll drives pending invoices to settled or expired, crediting
//!   deposits and posting `PaymentObserved` for session invoices,
//! - an hourly housekeeping pass garbage-collects dead invoices and tokens.
//!
//! Every loop body tolerates being re-run over the same rows.

use crate::config::Config;
use crate::db::{
    Database, InvoiceModel, InvoicePurpose, InvoiceQueries, InvoiceStatus, LedgerEntryType,
    SessionQueries, SessionState, UserQueries,
};
use crate::ledger::Ledger;
use crate::lightning::{LightningGateway, LookupStatus};
use crate::registry::NodeRegistry;
use crate::session::{SessionEvent, SessionOrchestrator};
use crate::{CoordinatorError, CoordResult};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Interval of the expiry scan (seconds)
const EXPIRY_SCAN_SECS: u64 = 1;

/// Interval of the housekeeping pass (seconds)
const HOUSEKEEPING_SECS: u64 = 3_600;

/// Grace period before an expired invoice row is deleted (hours)
const INVOICE_GC_GRACE_HOURS: i64 = 24;

/// The scheduler
pub struct Scheduler {
    config: Arc<Config>,
    db: Database,
    ledger: Ledger,
    registry: Arc<NodeRegistry>,
    orchestrator: Arc<SessionOrchestrator>,
    lightning: Arc<LightningGateway>,
}

impl Scheduler {
    /// Create the scheduler
    pub fn new(
        config: Arc<Config>,
        db: Database,
        ledger: Ledger,
        registry: Arc<NodeRegistry>,
        orchestrator: Arc<SessionOrchestrator>,
        lightning: Arc<LightningGateway>,
    ) -> Self {
        Self {
            config,
            db,
            ledger,
            registry,
            orchestrator,
            lightning,
        }
    }

    /// Spawn all scheduler loops; they run for the process lifetime
    pub fn start(self: Arc<Self>) {
        info!(
            "Scheduler: starting (expiry {}s, liveness {}s, invoices {}s)",
            EXPIRY_SCAN_SECS,
            self.config.nodes.heartbeat_poll_secs,
            self.config.nodes.invoice_poll_secs
        );

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_secs(EXPIRY_SCAN_SECS));
            loop {
                tick.tick().await;
                if let Err(e) = scheduler.expiry_pass().await {
                    error!("Scheduler: expiry pass failed: {}", e);
                }
            }
        });

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(
                scheduler.config.nodes.heartbeat_poll_secs,
            ));
            loop {
                tick.tick().await;
                scheduler.liveness_pass().await;
            }
        });

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(
                scheduler.config.nodes.invoice_poll_secs,
            ));
            loop {
                tick.tick().await;
                if let Err(e) = scheduler.invoice_pass().await {
                    error!("Scheduler: invoice pass failed: {}", e);
                }
            }
        });

        let scheduler = self;
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_secs(HOUSEKEEPING_SECS));
            loop {
                tick.tick().await;
                scheduler.housekeeping_pass().await;
            }
        });
    }

    /// Fire expiry ticks and starting deadlines
    async fn expiry_pass(&self) -> CoordResult<()> {
        let now = Utc::now();
        let queries = SessionQueries::new(&self.db);

        let expired = queries
            .list_expired_active(now)
            .await
            .map_err(|e| CoordinatorError::Database(e.to_string()))?;
        for session in expired {
            debug!("Scheduler: expiry tick for session {}", session.id);
            self.orchestrator
                .post(&session.id, SessionEvent::ExpiryTick)
                .await;
        }

        // A session stuck in starting past its deadline is refunded; this is
        // also the recovery path after a coordinator crash mid-starting
        let starting = queries
            .list_by_state(SessionState::Starting)
            .await
            .map_err(|e| CoordinatorError::Database(e.to_string()))?;
        for session in starting {
            let timeout = self.config.starting_timeout_secs(session.needs_download());
            let anchor = session.paid_at.unwrap_or(session.created_at);
            if now > anchor + chrono::Duration::seconds(timeout as i64) {
                warn!(
                    "Scheduler: starting deadline elapsed for session {}",
                    session.id
                );
                self.orchestrator
                    .post(&session.id, SessionEvent::StartingDeadline)
                    .await;
            }
        }
        Ok(())
    }

    /// Sweep silent nodes offline and fail their sessions
    async fn liveness_pass(&self) {
        for (node_id, held_session) in self.registry.sweep_offline().await {
            if let Some(session_id) = held_session {
                warn!(
                    "Scheduler: node {} went offline while serving session {}",
                    node_id, session_id
                );
                self.orchestrator
                    .post(&session_id, SessionEvent::NodeFailed)
                    .await;
            }
        }
    }

    /// Poll pending invoices against the daemon
    async fn invoice_pass(&self) -> CoordResult<()> {
        let invoices = InvoiceQueries::new(&self.db)
            .list_pending(None)
            .await
            .map_err(|e| CoordinatorError::Database(e.to_string()))?;

        for invoice in invoices {
            match self.check_invoice(&invoice).await {
                Ok(_) => {}
                // Daemon outages are retried on the next tick, within the TTL
                Err(CoordinatorError::LightningUnavailable(e)) => {
                    debug!("Scheduler: invoice poll deferred: {}", e);
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        "Scheduler: invoice {} check failed: {}",
                        invoice.payment_hash, e
                    );
                }
            }
        }
        Ok(())
    }

    /// Drive one pending invoice forward; shared with the deposit-check
    /// endpoint. Returns the invoice's resulting status.
    pub async fn check_invoice(&self, invoice: &InvoiceModel) -> CoordResult<InvoiceStatus> {
        if invoice.status != InvoiceStatus::Pending {
            return Ok(invoice.status);
        }

        let now = Utc::now();
        let queries = InvoiceQueries::new(&self.db);

        // Local expiry first; no need to bother the daemon for a dead invoice
        if now >= invoice.expires_at {
            let flipped = queries
                .mark_expired(&invoice.payment_hash)
                .await
                .map_err(|e| CoordinatorError::Database(e.to_string()))?;
            if flipped && invoice.purpose == InvoicePurpose::Session {
                self.orchestrator
                    .post(&invoice.related_id, SessionEvent::InvoiceExpired)
                    .await;
            }
            return Ok(InvoiceStatus::Expired);
        }

        let lookup = self.lightning.lookup_invoice(&invoice.payment_hash).await?;
        match lookup.status {
            LookupStatus::Settled => {
                let settled_at = lookup.settled_at.unwrap_or(now);
                // The guarded flip is what makes settlement exactly-once:
                // only the winner applies the effects below
                let flipped = queries
                    .mark_paid(&invoice.payment_hash, settled_at)
                    .await
                    .map_err(|e| CoordinatorError::Database(e.to_string()))?;
                if flipped {
                    info!(
                        "Scheduler: invoice {} settled ({})",
                        invoice.payment_hash,
                        invoice.purpose.as_str()
                    );
                    match invoice.purpose {
                        InvoicePurpose::Deposit => {
                            let user_id = invoice.related_id.parse::<i64>().map_err(|_| {
                                CoordinatorError::Internal(format!(
                                    "deposit invoice {} has bad user id",
                                    invoice.payment_hash
                                ))
                            })?;
                            self.ledger
                                .credit(
                                    user_id,
                                    invoice.amount_sats as u64,
                                    LedgerEntryType::Deposit,
                                    "Wallet deposit",
                                    None,
                                )
                                .await?;
                        }
                        InvoicePurpose::Session => {
                            // A payment landing after the session already
                            // closed is credited to the wallet rather than
                            // silently absorbed
                            let session = SessionQueries::new(&self.db)
                                .get_by_id(&invoice.related_id)
                                .await
                                .map_err(|e| CoordinatorError::Database(e.to_string()))?;
                            match session {
                                Some(session) if !session.state.is_terminal() => {
                                    self.orchestrator
                                        .post(&invoice.related_id, SessionEvent::PaymentObserved)
                                        .await;
                                }
                                Some(session) => {
                                    warn!(
                                        "Scheduler: late payment for closed session {}, crediting wallet",
                                        session.id
                                    );
                                    self.ledger
                                        .credit(
                                            session.user_id,
                                            invoice.amount_sats as u64,
                                            LedgerEntryType::Deposit,
                                            &format!("Late payment for session {}", session.id),
                                            None,
                                        )
                                        .await?;
                                }
                                None => {
                                    warn!(
                                        "Scheduler: settled invoice {} references unknown session {}",
                                        invoice.payment_hash, invoice.related_id
                                    );
                                }
                            }
                        }
                    }
                }
                Ok(InvoiceStatus::Paid)
            }
            LookupStatus::Canceled => {
                let flipped = queries
                    .mark_expired(&invoice.payment_hash)
                    .await
                    .map_err(|e| CoordinatorError::Database(e.to_string()))?;
                if flipped && invoice.purpose == InvoicePurpose::Session {
                    self.orchestrator
                        .post(&invoice.related_id, SessionEvent::InvoiceExpired)
                        .await;
                }
                Ok(InvoiceStatus::Expired)
            }
            LookupStatus::Pending => Ok(InvoiceStatus::Pending),
        }
    }

    /// Hourly cleanup of dead invoices and tokens
    async fn housekeeping_pass(&self) {
        let cutoff = Utc::now() - chrono::Duration::hours(INVOICE_GC_GRACE_HOURS);
        if let Err(e) = InvoiceQueries::new(&self.db).delete_garbage(cutoff).await {
            error!("Scheduler: invoice garbage collection failed: {}", e);
        }
        if let Err(e) = UserQueries::new(&self.db).delete_expired_tokens().await {
            error!("Scheduler: token cleanup failed: {}", e);
        }
    }
}
