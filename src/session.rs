//! Session orchestrator
//!
//! The state machine that turns (user, node, model, minutes) into a paid,
//! exclusive, time-bounded chat session:
//!
//! ```text
//! pending_payment -> starting -> active -> settling  -> ended
//!        |              |                  refunding  -> ended
//!        +--------------+----------------------^
//! ```
//!
//! Events for one session are linearized through a per-session mailbox: a
//! dedicated task consumes them in arrival order, so duplicated callbacks
//! (an invoice reported settled twice, a ready report racing a deadline)
//! resolve against guarded database transitions and leave the system
//! unchanged. Settlement and refund legs are additionally keyed on existing
//! ledger rows, so a crash between the transition and its effects cannot
//! credit anyone twice.

use crate::bridge::{PushHub, ServerFrame};
use crate::config::Config;
use crate::db::{
    Database, InvoiceModel, InvoicePurpose, InvoiceQueries, InvoiceStatus, LedgerEntryType,
    PaymentMethod, SessionModel, SessionQueries, SessionState,
};
use crate::ledger::Ledger;
use crate::lightning::{LightningGateway, LookupStatus};
use crate::noderpc::{ModelLoadStatus, NodeRpcClient};
use crate::registry::NodeRegistry;
use crate::{CoordinatorError, CoordResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// Events a session mailbox consumes
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Invoice settled or wallet debit succeeded
    PaymentObserved,
    /// User abandoned a pending session
    CancelRequested,
    /// Invoice passed its expiry unsettled
    InvoiceExpired,
    /// Node reported the model ready
    NodeReady,
    /// Node reported or caused a load failure
    NodeLoadFailed(String),
    /// The starting deadline elapsed
    StartingDeadline,
    /// The session's expiry timestamp passed
    ExpiryTick,
    /// User ended the session early
    EndRequested,
    /// The serving node went silent mid-session
    NodeFailed,
    /// Restart recovery for a session caught in `settling`
    ResumeSettlement,
    /// Restart recovery for a session caught in `refunding`
    ResumeRefund,
}

/// A HuggingFace repo coordinate `owner/name[:quant]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HfRepoSpec {
    /// Repo owner
    pub owner: String,
    /// Repo name
    pub name: String,
    /// Requested quantization, if any
    pub quant: Option<String>,
}

impl HfRepoSpec {
    /// Parse a coordinate like `TheBloke/Mistral-7B-GGUF:Q4_K_M`
    pub fn parse(spec: &str) -> Option<Self> {
        let (coordinate, quant) = match spec.split_once(':') {
            Some((c, q)) if !q.is_empty() => (c, Some(q.to_string())),
            Some(_) => return None,
            None => (spec, None),
        };

        let (owner, name) = coordinate.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        let valid = |s: &str| {
            s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if !valid(owner) || !valid(name) || !quant.as_deref().map(valid).unwrap_or(true) {
            return None;
        }

        Some(Self {
            owner: owner.to_string(),
            name: name.to_string(),
            quant,
        })
    }

    /// Short model label derived from the repo name
    pub fn alias(&self) -> String {
        self.name
            .to_lowercase()
            .trim_end_matches("-gguf")
            .trim_end_matches("_gguf")
            .to_string()
    }

    /// Canonical string form
    pub fn coordinate(&self) -> String {
        match &self.quant {
            Some(quant) => format!("{}/{}:{}", self.owner, self.name, quant),
            None => format!("{}/{}", self.owner, self.name),
        }
    }
}

/// Input for a new session
#[derive(Debug, Clone)]
pub struct NewSessionRequest {
    /// Target node
    pub node_id: String,
    /// Preloaded model id; ignored when `hf_repo` is given
    pub model: Option<String>,
    /// HuggingFace repo coordinate for dynamic loading
    pub hf_repo: Option<String>,
    /// Session length in minutes
    pub minutes: u32,
    /// Requested context length
    pub context_length: Option<u32>,
    /// How the session is paid (defaults to lightning)
    pub payment_method: PaymentMethod,
}

/// Invoice handed back to the buyer
#[derive(Debug, Clone, Serialize)]
pub struct SessionInvoice {
    /// BOLT11 payment request
    pub bolt11: String,
    /// Payment hash (hex)
    pub payment_hash: String,
    /// Invoice expiry
    pub expires_at: DateTime<Utc>,
}

/// Result of creating a session
#[derive(Debug, Clone, Serialize)]
pub struct NewSessionOutcome {
    /// Session id
    pub session_id: String,
    /// Invoice to pay, for lightning sessions
    pub invoice: Option<SessionInvoice>,
    /// Total price in satoshis
    pub amount_sats: u64,
    /// The node's per-minute price
    pub price_per_minute_sats: u64,
}

/// Per-mailbox loop state
struct MailboxState {
    /// Whether the load RPC was dispatched for this process lifetime
    load_dispatched: bool,
}

/// The session orchestrator
pub struct SessionOrchestrator {
    config: Arc<Config>,
    db: Database,
    ledger: Ledger,
    registry: Arc<NodeRegistry>,
    lightning: Arc<LightningGateway>,
    rpc: NodeRpcClient,
    hub: Arc<PushHub>,
    mailboxes: RwLock<HashMap<String, mpsc::UnboundedSender<SessionEvent>>>,
    /// Self-handle for the tasks this component spawns
    weak: std::sync::Weak<SessionOrchestrator>,
}

impl SessionOrchestrator {
    /// Create the orchestrator
    pub fn new(
        config: Arc<Config>,
        db: Database,
        ledger: Ledger,
        registry: Arc<NodeRegistry>,
        lightning: Arc<LightningGateway>,
        rpc: NodeRpcClient,
        hub: Arc<PushHub>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            db,
            ledger,
            registry,
            lightning,
            rpc,
            hub,
            mailboxes: RwLock::new(HashMap::new()),
            weak: weak.clone(),
        })
    }

    /// Create a new session: reserve the node, price the request, create the
    /// invoice (lightning) or pre-check the balance (wallet), persist.
    ///
    /// The reservation is taken first and released on every failure path, so
    /// a losing racer sees `NodeBusy` before any payment is charged and no
    /// failure leaves a reserved node behind.
    pub async fn new_session(
        &self,
        user_id: i64,
        request: NewSessionRequest,
    ) -> CoordResult<NewSessionOutcome> {
        let pricing = &self.config.pricing;
        if request.minutes < pricing.min_session_minutes
            || request.minutes > pricing.max_session_minutes
        {
            return Err(CoordinatorError::Validation(format!(
                "Minutes must be between {} and {}",
                pricing.min_session_minutes, pricing.max_session_minutes
            )));
        }

        let node = self
            .registry
            .get(&request.node_id)
            .await
            .ok_or_else(|| CoordinatorError::NotFound(format!("node {}", request.node_id)))?;

        // Resolve the model before money is involved
        let (model_label, hf_repo, context_length) = match &request.hf_repo {
            Some(raw) => {
                let spec = HfRepoSpec::parse(raw).ok_or_else(|| {
                    CoordinatorError::Validation(format!("Invalid HuggingFace repo: {raw}"))
                })?;
                (
                    spec.alias(),
                    Some(spec.coordinate()),
                    request.context_length.unwrap_or(4_096),
                )
            }
            None => {
                let model_id = request.model.as_deref().ok_or_else(|| {
                    CoordinatorError::Validation("Either model or hf_repo is required".to_string())
                })?;
                let descriptor = node.find_model(model_id).ok_or_else(|| {
                    CoordinatorError::Validation(format!(
                        "Node does not offer model {model_id}"
                    ))
                })?;
                let context_length = request.context_length.unwrap_or(descriptor.context_length);
                if context_length > descriptor.context_length {
                    return Err(CoordinatorError::Validation(format!(
                        "Context length {} exceeds the node's limit of {}",
                        context_length, descriptor.context_length
                    )));
                }
                (model_id.to_string(), None, context_length)
            }
        };

        let price_per_minute = node.node.price_per_minute_sats as u64;
        let amount_sats = self.config.session_price(price_per_minute, request.minutes);
        let session_id = uuid::Uuid::new_v4().to_string();

        // Reservation comes first; both racers cannot get past this line
        self.registry.try_reserve(&request.node_id, &session_id).await?;

        match self
            .create_pending_session(
                user_id,
                &session_id,
                &request,
                &node.node.id,
                model_label,
                hf_repo,
                context_length,
                amount_sats,
                price_per_minute,
            )
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Scoped cleanup: nothing paid yet, just hand the node back
                self.registry.release(&request.node_id, &session_id).await;
                Err(e)
            }
        }
    }

    /// Invoice/balance work plus persistence for `new_session`
    #[allow(clippy::too_many_arguments)]
    async fn create_pending_session(
        &self,
        user_id: i64,
        session_id: &str,
        request: &NewSessionRequest,
        node_id: &str,
        model_label: String,
        hf_repo: Option<String>,
        context_length: u32,
        amount_sats: u64,
        price_per_minute: u64,
    ) -> CoordResult<NewSessionOutcome> {
        let mut invoice_out = None;
        let mut payment_reference = None;

        match request.payment_method {
            PaymentMethod::Lightning => {
                let memo = format!(
                    "AI access: {} for {} minutes",
                    model_label, request.minutes
                );
                let created = self
                    .lightning
                    .create_invoice(amount_sats, &memo, self.config.sessions.invoice_expiry_secs)
                    .await?;
                payment_reference = Some(created.payment_hash.clone());
                invoice_out = Some(SessionInvoice {
                    bolt11: created.bolt11,
                    payment_hash: created.payment_hash,
                    expires_at: created.expires_at,
                });
            }
            PaymentMethod::Wallet => {
                // Pre-check only; the debit happens on pay_session
                let balance = self.ledger.balance(user_id).await?;
                if balance < amount_sats as i64 {
                    return Err(CoordinatorError::InsufficientFunds(format!(
                        "balance {} sats does not cover {} sats",
                        balance, amount_sats
                    )));
                }
            }
        }

        let session = SessionModel {
            id: session_id.to_string(),
            user_id,
            node_id: node_id.to_string(),
            model: model_label,
            hf_repo,
            context_length,
            minutes_purchased: request.minutes,
            amount_sats: amount_sats as i64,
            state: SessionState::PendingPayment,
            payment_method: request.payment_method,
            payment_reference: payment_reference.clone(),
            refund_sats: 0,
            created_at: Utc::now(),
            paid_at: None,
            started_at: None,
            expires_at: None,
            ended_at: None,
        };

        SessionQueries::new(&self.db)
            .insert(&session)
            .await
            .map_err(|e| CoordinatorError::Database(e.to_string()))?;

        if let Some(invoice) = &invoice_out {
            InvoiceQueries::new(&self.db)
                .insert(&InvoiceModel {
                    payment_hash: invoice.payment_hash.clone(),
                    bolt11: invoice.bolt11.clone(),
                    amount_sats: amount_sats as i64,
                    purpose: InvoicePurpose::Session,
                    related_id: session_id.to_string(),
                    status: InvoiceStatus::Pending,
                    created_at: Utc::now(),
                    expires_at: invoice.expires_at,
                    paid_at: None,
                })
                .await
                .map_err(|e| CoordinatorError::Database(e.to_string()))?;
        }

        self.ensure_mailbox(session_id).await;

        info!(
            "Orchestrator: session {} created: user={}, node={}, amount={} sats ({})",
            session_id,
            user_id,
            node_id,
            amount_sats,
            request.payment_method.as_str()
        );

        Ok(NewSessionOutcome {
            session_id: session_id.to_string(),
            invoice: invoice_out,
            amount_sats,
            price_per_minute_sats: price_per_minute,
        })
    }

    /// Check (and actively poll) payment for a pending session.
    ///
    /// The lookup consults the daemon; a settled invoice flips the invoice
    /// row first and then posts `PaymentObserved` to the mailbox.
    pub async fn check_payment(&self, session_id: &str, user_id: i64) -> CoordResult<bool> {
        let session = self.load_owned_session(session_id, user_id).await?;

        if session.state != SessionState::PendingPayment {
            return Ok(session.paid_at.is_some());
        }
        if session.payment_method != PaymentMethod::Lightning {
            return Ok(false);
        }
        let Some(payment_hash) = &session.payment_reference else {
            return Ok(false);
        };

        match self.lightning.lookup_invoice(payment_hash).await {
            Ok(lookup) => match lookup.status {
                LookupStatus::Settled => {
                    let settled_at = lookup.settled_at.unwrap_or_else(Utc::now);
                    InvoiceQueries::new(&self.db)
                        .mark_paid(payment_hash, settled_at)
                        .await
                        .map_err(|e| CoordinatorError::Database(e.to_string()))?;
                    self.post(session_id, SessionEvent::PaymentObserved).await;
                    Ok(true)
                }
                LookupStatus::Canceled => {
                    InvoiceQueries::new(&self.db)
                        .mark_expired(payment_hash)
                        .await
                        .map_err(|e| CoordinatorError::Database(e.to_string()))?;
                    self.post(session_id, SessionEvent::InvoiceExpired).await;
                    Ok(false)
                }
                LookupStatus::Pending => Ok(false),
            },
            // A daemon outage is retryable; the poller keeps trying
            Err(CoordinatorError::LightningUnavailable(e)) => {
                debug!("Orchestrator: payment check deferred for {}: {}", session_id, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Pay a pending wallet session from the balance.
    ///
    /// The debit and the paid-transition pair exactly once: a racer that
    /// loses the guarded update gets its debit refunded.
    pub async fn pay_with_wallet(
        &self,
        session_id: &str,
        user_id: i64,
    ) -> CoordResult<(u64, i64)> {
        let session = self.load_owned_session(session_id, user_id).await?;

        if session.payment_method != PaymentMethod::Wallet {
            return Err(CoordinatorError::Validation(
                "Session is not wallet-paid".to_string(),
            ));
        }
        if session.state != SessionState::PendingPayment {
            return Err(CoordinatorError::Validation(
                "Session is not awaiting payment".to_string(),
            ));
        }

        let amount = session.amount_sats as u64;
        let new_balance = self
            .ledger
            .debit(
                user_id,
                amount,
                LedgerEntryType::SessionPayment,
                &format!("Session {}: {} for {} minutes", session_id, session.model, session.minutes_purchased),
                Some(session_id),
            )
            .await?;

        let won = SessionQueries::new(&self.db)
            .mark_paid(session_id, Utc::now())
            .await
            .map_err(|e| CoordinatorError::Database(e.to_string()))?;

        if !won {
            // Someone else already paid; undo this debit. Deliberately not
            // linked to the session: the linked refund row is reserved for
            // settlement-time refunds and keyed on for idempotency.
            self.ledger
                .credit(
                    user_id,
                    amount,
                    LedgerEntryType::Refund,
                    &format!("Duplicate payment for session {session_id}"),
                    None,
                )
                .await?;
            return Err(CoordinatorError::Validation(
                "Session was already paid".to_string(),
            ));
        }

        self.post(session_id, SessionEvent::PaymentObserved).await;
        Ok((amount, new_balance))
    }

    /// Post an event to a session's mailbox, spawning it if needed
    pub async fn post(&self, session_id: &str, event: SessionEvent) {
        let sender = self.ensure_mailbox(session_id).await;
        if sender.send(event.clone()).is_err() {
            debug!(
                "Orchestrator: mailbox for {} closed, dropping {:?}",
                session_id, event
            );
        }
    }

    /// Recover non-terminal sessions after a restart.
    ///
    /// Mirrors the states back into running mailboxes: reservations are
    /// restored, `starting` sessions re-dispatch their load, interrupted
    /// settlements and refunds are re-driven through their idempotent legs.
    pub async fn recover(&self) -> CoordResult<()> {
        let sessions = SessionQueries::new(&self.db)
            .list_non_terminal()
            .await
            .map_err(|e| CoordinatorError::Database(e.to_string()))?;

        if sessions.is_empty() {
            info!("Orchestrator: no sessions to recover");
            return Ok(());
        }

        info!("Orchestrator: recovering {} sessions", sessions.len());
        let mut recovered = 0;
        for session in sessions {
            recovered += 1;
            match session.state {
                SessionState::PendingPayment => {
                    // The invoice poller picks these up again
                    self.ensure_mailbox(&session.id).await;
                }
                SessionState::Starting => {
                    self.registry
                        .restore_reservation(&session.node_id, &session.id)
                        .await;
                    self.ensure_mailbox(&session.id).await;
                    self.post(&session.id, SessionEvent::PaymentObserved).await;
                }
                SessionState::Active => {
                    self.registry
                        .restore_reservation(&session.node_id, &session.id)
                        .await;
                    // The scheduler re-arms expiry by scanning active rows
                    self.ensure_mailbox(&session.id).await;
                }
                SessionState::Settling => {
                    self.ensure_mailbox(&session.id).await;
                    self.post(&session.id, SessionEvent::ResumeSettlement).await;
                }
                SessionState::Refunding => {
                    self.ensure_mailbox(&session.id).await;
                    self.post(&session.id, SessionEvent::ResumeRefund).await;
                }
                SessionState::Ended => {}
            }
        }
        info!("Orchestrator: recovery complete ({} sessions)", recovered);
        Ok(())
    }

    /// Load a session and verify ownership
    pub async fn load_owned_session(
        &self,
        session_id: &str,
        user_id: i64,
    ) -> CoordResult<SessionModel> {
        let session = SessionQueries::new(&self.db)
            .get_by_id(session_id)
            .await
            .map_err(|e| CoordinatorError::Database(e.to_string()))?
            .ok_or_else(|| CoordinatorError::NotFound(format!("session {session_id}")))?;
        if session.user_id != user_id {
            return Err(CoordinatorError::Forbidden);
        }
        Ok(session)
    }

    /// Get or spawn the mailbox task for a session
    fn ensure_mailbox<'a>(
        &'a self,
        session_id: &'a str,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = mpsc::UnboundedSender<SessionEvent>> + Send + 'a>,
    > {
        Box::pin(async move {
            {
                let mailboxes = self.mailboxes.read().await;
                if let Some(sender) = mailboxes.get(session_id) {
                    return sender.clone();
                }
            }

            let mut mailboxes = self.mailboxes.write().await;
            if let Some(sender) = mailboxes.get(session_id) {
                return sender.clone();
            }

            let (tx, rx) = mpsc::unbounded_channel();
            mailboxes.insert(session_id.to_string(), tx.clone());
            if let Some(orchestrator) = self.weak.upgrade() {
                let session_id = session_id.to_string();
                let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
                    Box::pin(async move {
                        orchestrator.run_mailbox(session_id, rx).await;
                    });
                tokio::spawn(fut);
            }
            tx
        })
    }

    /// Serial event loop for one session
    async fn run_mailbox(
        self: Arc<Self>,
        session_id: String,
        mut rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        debug!("Orchestrator: mailbox open for {}", session_id);
        let mut state = MailboxState {
            load_dispatched: false,
        };

        while let Some(event) = rx.recv().await {
            let terminal = match self.handle_event(&session_id, &event, &mut state).await {
                Ok(terminal) => terminal,
                Err(e) => {
                    error!(
                        "Orchestrator: event {:?} failed for {}: {}",
                        event, session_id, e
                    );
                    false
                }
            };
            if terminal {
                break;
            }
        }

        self.mailboxes.write().await.remove(&session_id);
        debug!("Orchestrator: mailbox closed for {}", session_id);
    }

    /// Process one event against the session's current row.
    ///
    /// Returns true once the session is terminal.
    async fn handle_event(
        &self,
        session_id: &str,
        event: &SessionEvent,
        state: &mut MailboxState,
    ) -> CoordResult<bool> {
        let queries = SessionQueries::new(&self.db);
        let Some(session) = queries
            .get_by_id(session_id)
            .await
            .map_err(|e| CoordinatorError::Database(e.to_string()))?
        else {
            warn!("Orchestrator: event for unknown session {}", session_id);
            return Ok(true);
        };

        match (session.state, event) {
            (SessionState::PendingPayment, SessionEvent::PaymentObserved) => {
                if queries
                    .mark_paid(session_id, Utc::now())
                    .await
                    .map_err(|e| CoordinatorError::Database(e.to_string()))?
                {
                    info!("Orchestrator: session {} paid, loading model", session_id);
                    self.dispatch_load(&session, state).await;
                }
                Ok(false)
            }

            // Wallet payments flip the row before the event arrives
            (SessionState::Starting, SessionEvent::PaymentObserved) => {
                self.dispatch_load(&session, state).await;
                Ok(false)
            }

            (
                SessionState::PendingPayment,
                SessionEvent::CancelRequested | SessionEvent::InvoiceExpired,
            ) => {
                // A settled invoice beats a racing cancel: let the queued
                // PaymentObserved take the session forward instead
                if let Some(hash) = &session.payment_reference {
                    let invoices = InvoiceQueries::new(&self.db);
                    if let Ok(Some(invoice)) = invoices.get_by_hash(hash).await {
                        if invoice.status == InvoiceStatus::Paid {
                            debug!(
                                "Orchestrator: ignoring cancel for {}, invoice already paid",
                                session_id
                            );
                            return Ok(false);
                        }
                    }
                    // Stop the invoice poller promptly; no refund is due for
                    // an unpaid session
                    let _ = invoices.mark_expired(hash).await;
                }
                let ended = queries
                    .mark_ended(session_id, SessionState::PendingPayment, 0, Utc::now())
                    .await
                    .map_err(|e| CoordinatorError::Database(e.to_string()))?;
                if ended {
                    self.registry.release(&session.node_id, session_id).await;
                    info!("Orchestrator: pending session {} closed", session_id);
                    self.push_ended(&session).await;
                }
                Ok(ended)
            }

            (SessionState::Starting, SessionEvent::NodeReady) => {
                let started_at = Utc::now();
                let expires_at =
                    started_at + chrono::Duration::seconds(session.minutes_purchased as i64 * 60);
                let activated = queries
                    .mark_active(session_id, started_at, expires_at)
                    .await
                    .map_err(|e| CoordinatorError::Database(e.to_string()))?;
                if activated {
                    info!(
                        "Orchestrator: session {} active until {}",
                        session_id, expires_at
                    );
                    self.hub
                        .push(
                            session.user_id,
                            ServerFrame::SessionStarted {
                                session_id: session_id.to_string(),
                                node_id: session.node_id.clone(),
                                expires_at,
                            },
                        )
                        .await;
                    self.hub
                        .push(
                            session.user_id,
                            ServerFrame::SessionReady {
                                session_id: session_id.to_string(),
                            },
                        )
                        .await;
                }
                Ok(false)
            }

            (
                SessionState::Starting,
                SessionEvent::NodeLoadFailed(_)
                | SessionEvent::StartingDeadline
                | SessionEvent::NodeFailed,
            ) => {
                if let SessionEvent::NodeLoadFailed(reason) = event {
                    warn!("Orchestrator: load failed for {}: {}", session_id, reason);
                } else {
                    warn!("Orchestrator: session {} failed while starting ({:?})", session_id, event);
                }
                let moved = queries
                    .transition(session_id, SessionState::Starting, SessionState::Refunding)
                    .await
                    .map_err(|e| CoordinatorError::Database(e.to_string()))?;
                if moved {
                    self.hub
                        .push(
                            session.user_id,
                            ServerFrame::Error {
                                message: "Model failed to start; payment refunded".to_string(),
                            },
                        )
                        .await;
                    self.finish(&session, SessionState::Refunding, 0, session.amount_sats as u64, false)
                        .await?;
                }
                Ok(moved)
            }

            (SessionState::Active, SessionEvent::ExpiryTick) => {
                let now = Utc::now();
                if !session.is_expired(now) {
                    // Re-armed tick fired early; the scheduler will come back
                    return Ok(false);
                }
                let moved = queries
                    .transition(session_id, SessionState::Active, SessionState::Settling)
                    .await
                    .map_err(|e| CoordinatorError::Database(e.to_string()))?;
                if moved {
                    info!("Orchestrator: session {} expired, settling", session_id);
                    self.stop_model(&session).await;
                    self.finish(&session, SessionState::Settling, session.amount_sats as u64, 0, true)
                        .await?;
                }
                Ok(moved)
            }

            (SessionState::Active, SessionEvent::EndRequested) => {
                let moved = queries
                    .transition(session_id, SessionState::Active, SessionState::Settling)
                    .await
                    .map_err(|e| CoordinatorError::Database(e.to_string()))?;
                if moved {
                    let (charge, refund) = prorate(&session, Utc::now());
                    info!(
                        "Orchestrator: session {} ended early: charge={}, refund={}",
                        session_id, charge, refund
                    );
                    self.stop_model(&session).await;
                    self.finish(&session, SessionState::Settling, charge, refund, true)
                        .await?;
                }
                Ok(moved)
            }

            (SessionState::Active, SessionEvent::NodeFailed) => {
                let moved = queries
                    .transition(session_id, SessionState::Active, SessionState::Refunding)
                    .await
                    .map_err(|e| CoordinatorError::Database(e.to_string()))?;
                if moved {
                    warn!(
                        "Orchestrator: node {} failed mid-session, refunding {}",
                        session.node_id, session_id
                    );
                    self.hub
                        .push(
                            session.user_id,
                            ServerFrame::Error {
                                message: "Node went offline; payment refunded".to_string(),
                            },
                        )
                        .await;
                    self.finish(&session, SessionState::Refunding, 0, session.amount_sats as u64, false)
                        .await?;
                }
                Ok(moved)
            }

            (SessionState::Settling, SessionEvent::ResumeSettlement) => {
                // Charge whatever was not already refunded before the crash
                let refunded = self
                    .ledger
                    .session_entry_amount(session_id, LedgerEntryType::Refund)
                    .await?
                    .unwrap_or(0)
                    .max(0) as u64;
                let charge = (session.amount_sats as u64).saturating_sub(refunded);
                self.finish(&session, SessionState::Settling, charge, refunded, true)
                    .await?;
                Ok(true)
            }

            (SessionState::Refunding, SessionEvent::ResumeRefund) => {
                self.finish(&session, SessionState::Refunding, 0, session.amount_sats as u64, false)
                    .await?;
                Ok(true)
            }

            (SessionState::Ended, _) => Ok(true),

            // Anything else is a duplicate or a stale event
            (current, stale) => {
                debug!(
                    "Orchestrator: ignoring {:?} for {} in state {:?}",
                    stale, session_id, current
                );
                Ok(false)
            }
        }
    }

    /// Dispatch the load RPC and start the readiness watcher, once
    async fn dispatch_load(&self, session: &SessionModel, state: &mut MailboxState) {
        if state.load_dispatched {
            return;
        }
        state.load_dispatched = true;

        let Some(node) = self.registry.get(&session.node_id).await else {
            let err = CoordinatorError::ModelLoadFailed("node vanished before load".to_string());
            self.post(&session.id, SessionEvent::NodeLoadFailed(err.to_string()))
                .await;
            return;
        };

        let Some(orchestrator) = self.weak.upgrade() else {
            return;
        };
        let session = session.clone();
        let endpoint = node.endpoint;
        let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
            Box::pin(async move {
                orchestrator.drive_model_load(session, endpoint).await;
            });
        tokio::spawn(fut);
    }

    /// Issue the load call and poll for readiness until the deadline
    async fn drive_model_load(self: Arc<Self>, session: SessionModel, endpoint: String) {
        if let Err(e) = self
            .rpc
            .load_model(
                &endpoint,
                &session.id,
                &session.model,
                session.hf_repo.as_deref(),
                session.context_length,
            )
            .await
        {
            self.post(&session.id, SessionEvent::NodeLoadFailed(e.to_string()))
                .await;
            return;
        }

        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_secs(
                self.config.starting_timeout_secs(session.needs_download()),
            );
        let mut last_status: Option<ModelLoadStatus> = None;
        let mut consecutive_failures = 0u32;

        loop {
            if tokio::time::Instant::now() >= deadline {
                self.post(&session.id, SessionEvent::StartingDeadline).await;
                return;
            }
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;

            // Stop watching once the session moved on (cancel, deadline, ...)
            match SessionQueries::new(&self.db).get_by_id(&session.id).await {
                Ok(Some(current)) if current.state == SessionState::Starting => {}
                _ => return,
            }

            match self.rpc.model_status(&endpoint, &session.id).await {
                Ok(report) => {
                    consecutive_failures = 0;
                    match report.status {
                        ModelLoadStatus::Ready => {
                            self.post(&session.id, SessionEvent::NodeReady).await;
                            return;
                        }
                        ModelLoadStatus::Failed => {
                            self.post(
                                &session.id,
                                SessionEvent::NodeLoadFailed(report.message),
                            )
                            .await;
                            return;
                        }
                        status => {
                            if last_status != Some(status) {
                                last_status = Some(status);
                                let label = match status {
                                    ModelLoadStatus::Downloading => "downloading",
                                    _ => "loading",
                                };
                                self.hub
                                    .push(
                                        session.user_id,
                                        ServerFrame::ModelStatus {
                                            session_id: session.id.clone(),
                                            status: label.to_string(),
                                            message: report.message,
                                        },
                                    )
                                    .await;
                            }
                        }
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    debug!(
                        "Orchestrator: status poll failed for {} ({}/5): {}",
                        session.id, consecutive_failures, e
                    );
                    if consecutive_failures >= 5 {
                        self.post(
                            &session.id,
                            SessionEvent::NodeLoadFailed("node stopped responding".to_string()),
                        )
                        .await;
                        return;
                    }
                }
            }
        }
    }

    /// Best-effort model stop; failures only shorten the node's idle time
    async fn stop_model(&self, session: &SessionModel) {
        if let Some(node) = self.registry.get(&session.node_id).await {
            if let Err(e) = self.rpc.stop_session(&node.endpoint, &session.id).await {
                warn!(
                    "Orchestrator: stop_session failed for {}: {}",
                    session.id, e
                );
            }
        }
    }

    /// Common tail of every terminal path: refund leg, settlement legs,
    /// node release, terminal flip, stats, push frames.
    ///
    /// Each money leg is keyed on an existing ledger row, and the terminal
    /// flip is a guarded update, so the whole tail is idempotent.
    async fn finish(
        &self,
        session: &SessionModel,
        from: SessionState,
        charge_sats: u64,
        refund_sats: u64,
        completed: bool,
    ) -> CoordResult<()> {
        let session_id = &session.id;

        if refund_sats > 0
            && self
                .ledger
                .session_entry_amount(session_id, LedgerEntryType::Refund)
                .await?
                .is_none()
        {
            self.ledger
                .credit(
                    session.user_id,
                    refund_sats,
                    LedgerEntryType::Refund,
                    &format!("Refund for session {session_id}"),
                    Some(session_id),
                )
                .await?;
        }

        let (earning, commission) = self.config.settlement_split(charge_sats);
        if charge_sats > 0
            && self
                .ledger
                .session_entry_amount(session_id, LedgerEntryType::NodeEarning)
                .await?
                .is_none()
        {
            let owner = match self.registry.get(&session.node_id).await {
                Some(node) => node.node.owner_user_id,
                None => {
                    return Err(CoordinatorError::Internal(format!(
                        "node {} missing during settlement",
                        session.node_id
                    )))
                }
            };
            self.ledger
                .settle_session(owner, earning, commission, session_id)
                .await?;
        }

        self.registry.release(&session.node_id, session_id).await;

        let ended = SessionQueries::new(&self.db)
            .mark_ended(session_id, from, refund_sats as i64, Utc::now())
            .await
            .map_err(|e| CoordinatorError::Database(e.to_string()))?;

        if ended {
            // Sessions that never collected payment do not count against the node
            if session.paid_at.is_some() {
                self.registry
                    .record_outcome(&session.node_id, completed, earning as i64)
                    .await?;
            }
            info!(
                "Orchestrator: session {} ended (charge={}, refund={})",
                session_id, charge_sats, refund_sats
            );
            self.push_ended(session).await;
        }
        Ok(())
    }

    async fn push_ended(&self, session: &SessionModel) {
        self.hub
            .push(
                session.user_id,
                ServerFrame::SessionEnded {
                    session_id: session.id.clone(),
                },
            )
            .await;
        self.hub
            .push(
                session.user_id,
                ServerFrame::NodeFreed {
                    node_id: session.node_id.clone(),
                },
            )
            .await;
    }
}

/// Split an early-ended session into (charge, refund) at integer-minute
/// ceiling granularity
fn prorate(session: &SessionModel, now: DateTime<Utc>) -> (u64, u64) {
    let amount = session.amount_sats as u64;
    let Some(started_at) = session.started_at else {
        return (amount, 0);
    };
    let elapsed_secs = (now - started_at).num_seconds().max(0) as u64;
    let used_minutes = (elapsed_secs.div_ceil(60)).max(1).min(session.minutes_purchased as u64);
    let price_per_minute = amount / session.minutes_purchased.max(1) as u64;
    let charge = used_minutes * price_per_minute;
    (charge, amount - charge)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hf_repo_spec_parses_coordinates() {
        let spec = HfRepoSpec::parse("TheBloke/Mistral-7B-GGUF:Q4_K_M").unwrap();
        assert_eq!(spec.owner, "TheBloke");
        assert_eq!(spec.name, "Mistral-7B-GGUF");
        assert_eq!(spec.quant.as_deref(), Some("Q4_K_M"));
        assert_eq!(spec.alias(), "mistral-7b");
        assert_eq!(spec.coordinate(), "TheBloke/Mistral-7B-GGUF:Q4_K_M");

        let spec = HfRepoSpec::parse("meta-llama/Llama-3.1-8B").unwrap();
        assert!(spec.quant.is_none());
        assert_eq!(spec.alias(), "llama-3.1-8b");
    }

    #[test]
    fn hf_repo_spec_rejects_malformed_input() {
        assert!(HfRepoSpec::parse("no-slash").is_none());
        assert!(HfRepoSpec::parse("/leading").is_none());
        assert!(HfRepoSpec::parse("trailing/").is_none());
        assert!(HfRepoSpec::parse("a/b/c").is_none());
        assert!(HfRepoSpec::parse("owner/name:").is_none());
        assert!(HfRepoSpec::parse("owner/na me").is_none());
    }

    fn active_session(minutes: u32, amount: i64, started_secs_ago: i64) -> SessionModel {
        let started_at = Utc::now() - chrono::Duration::seconds(started_secs_ago);
        SessionModel {
            id: "s1".into(),
            user_id: 1,
            node_id: "n1".into(),
            model: "tiny".into(),
            hf_repo: None,
            context_length: 4_096,
            minutes_purchased: minutes,
            amount_sats: amount,
            state: SessionState::Active,
            payment_method: PaymentMethod::Wallet,
            payment_reference: None,
            refund_sats: 0,
            created_at: started_at,
            paid_at: Some(started_at),
            started_at: Some(started_at),
            expires_at: Some(started_at + chrono::Duration::minutes(minutes as i64)),
            ended_at: None,
        }
    }

    #[test]
    fn proration_charges_ceiling_minutes() {
        // Ended 2m30s into an 8 minute session at 100 sat/min: 3 minutes used
        let session = active_session(8, 800, 150);
        let (charge, refund) = prorate(&session, Utc::now());
        assert_eq!(charge, 300);
        assert_eq!(refund, 500);
    }

    #[test]
    fn proration_charges_at_least_one_minute() {
        let session = active_session(5, 500, 1);
        let (charge, refund) = prorate(&session, Utc::now());
        assert_eq!(charge, 100);
        assert_eq!(refund, 400);
    }

    #[test]
    fn proration_never_exceeds_purchase() {
        // Clock ran past the purchased window
        let session = active_session(5, 500, 600);
        let (charge, refund) = prorate(&session, Utc::now());
        assert_eq!(charge, 500);
        assert_eq!(refund, 0);
    }

    // ---- end-to-end orchestrator tests against an in-memory database ----
    //
    // The Lightning gateway runs in test mode; the node endpoint points at
    // a closed port, so load RPCs fail fast and exercise the refund paths.

    use crate::config::LndConfig;
    use crate::db::{GpuDescriptor, HardwareDescriptor, ModelDescriptor, UserQueries};
    use crate::registry::NodeCapabilities;

    struct Harness {
        db: Database,
        ledger: Ledger,
        registry: Arc<NodeRegistry>,
        orchestrator: Arc<SessionOrchestrator>,
        buyer: i64,
        owner: i64,
        node_id: String,
    }

    async fn harness() -> Harness {
        let config = Arc::new(Config::default());
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let ledger = Ledger::new(db.clone());

        let users = UserQueries::new(&db);
        let buyer = users.create("buyer", "digest").await.unwrap().id;
        let owner = users.create("owner", "digest").await.unwrap().id;
        ledger
            .credit(owner, 10_000, LedgerEntryType::Deposit, "seed", None)
            .await
            .unwrap();

        let registry = Arc::new(NodeRegistry::new(db.clone(), ledger.clone(), config.clone()));
        let (node_id, _) = registry
            .register(
                owner,
                NodeCapabilities {
                    name: "rig".to_string(),
                    // Closed port: every node RPC fails with connection refused
                    endpoint: "http://127.0.0.1:9".to_string(),
                    price_per_minute_sats: 100,
                    hardware: HardwareDescriptor {
                        cpu: "EPYC 7313".to_string(),
                        ram_mb: 65_536,
                        gpus: vec![GpuDescriptor {
                            model: "RTX 4090".to_string(),
                            vram_mb: 24_576,
                        }],
                        disk_free_gb: 500,
                    },
                    models: vec![ModelDescriptor {
                        id: "tiny".to_string(),
                        name: "Tiny 3B".to_string(),
                        architecture: "llama".to_string(),
                        parameters_b: 3.0,
                        quantization: "Q4_K_M".to_string(),
                        context_length: 4_096,
                        min_vram_mb: 4_096,
                    }],
                    payment_address: None,
                },
            )
            .await
            .unwrap();

        let lnd = LndConfig {
            test_mode: true,
            ..LndConfig::default()
        };
        let lightning = Arc::new(LightningGateway::connect(&lnd).await.unwrap());
        let rpc = NodeRpcClient::new(2).unwrap();
        let hub = Arc::new(PushHub::new(64));
        let orchestrator = SessionOrchestrator::new(
            config,
            db.clone(),
            ledger.clone(),
            registry.clone(),
            lightning,
            rpc,
            hub,
        );

        Harness {
            db,
            ledger,
            registry,
            orchestrator,
            buyer,
            owner,
            node_id,
        }
    }

    fn lightning_request(h: &Harness, minutes: u32) -> NewSessionRequest {
        NewSessionRequest {
            node_id: h.node_id.clone(),
            model: Some("tiny".to_string()),
            hf_repo: None,
            minutes,
            context_length: None,
            payment_method: PaymentMethod::Lightning,
        }
    }

    async fn wait_for_state(db: &Database, session_id: &str, state: SessionState) -> SessionModel {
        let queries = SessionQueries::new(db);
        for _ in 0..200 {
            if let Some(session) = queries.get_by_id(session_id).await.unwrap() {
                if session.state == state {
                    return session;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        panic!("session {session_id} never reached {state:?}");
    }

    #[tokio::test]
    async fn new_session_returns_invoice_and_reserves_node() {
        let h = harness().await;
        let outcome = h
            .orchestrator
            .new_session(h.buyer, lightning_request(&h, 5))
            .await
            .unwrap();

        assert_eq!(outcome.amount_sats, 500);
        assert_eq!(outcome.price_per_minute_sats, 100);
        let invoice = outcome.invoice.expect("lightning session carries invoice");
        assert_eq!(invoice.payment_hash.len(), 64);

        // The loser of the race sees NodeBusy before any payment is charged
        let err = h
            .orchestrator
            .new_session(h.buyer, lightning_request(&h, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::NodeBusy(_)));
    }

    #[tokio::test]
    async fn rejected_session_releases_the_node() {
        let h = harness().await;
        // Wallet purchase with an empty balance fails the pre-check
        let err = h
            .orchestrator
            .new_session(
                h.buyer,
                NewSessionRequest {
                    payment_method: PaymentMethod::Wallet,
                    ..lightning_request(&h, 5)
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InsufficientFunds(_)));

        // The reservation was rolled back; a lightning purchase still works
        h.orchestrator
            .new_session(h.buyer, lightning_request(&h, 5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_model_is_rejected_before_reservation() {
        let h = harness().await;
        let err = h
            .orchestrator
            .new_session(
                h.buyer,
                NewSessionRequest {
                    model: Some("gpt-99".to_string()),
                    ..lightning_request(&h, 5)
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));

        // Node untouched
        use crate::registry::NodeStatus;
        assert_eq!(
            h.registry.get(&h.node_id).await.unwrap().status,
            NodeStatus::Online
        );
    }

    #[tokio::test]
    async fn wallet_payment_with_dead_node_refunds_in_full() {
        let h = harness().await;
        h.ledger
            .credit(h.buyer, 10_000, LedgerEntryType::Deposit, "seed", None)
            .await
            .unwrap();

        let outcome = h
            .orchestrator
            .new_session(
                h.buyer,
                NewSessionRequest {
                    payment_method: PaymentMethod::Wallet,
                    ..lightning_request(&h, 5)
                },
            )
            .await
            .unwrap();
        assert!(outcome.invoice.is_none());

        let (paid, balance) = h
            .orchestrator
            .pay_with_wallet(&outcome.session_id, h.buyer)
            .await
            .unwrap();
        assert_eq!(paid, 500);
        assert_eq!(balance, 9_500);

        // Paying twice is rejected and leaves the balance intact
        let err = h
            .orchestrator
            .pay_with_wallet(&outcome.session_id, h.buyer)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));

        // The node endpoint is dead, so the load fails and the session is
        // refunded in full: no charge without service
        let session = wait_for_state(&h.db, &outcome.session_id, SessionState::Ended).await;
        assert_eq!(session.refund_sats, 500);
        assert_eq!(h.ledger.balance(h.buyer).await.unwrap(), 10_000);

        // Node owner earned nothing and the node is free again
        assert_eq!(h.ledger.balance(h.owner).await.unwrap(), 9_000);
        use crate::registry::NodeStatus;
        assert_eq!(
            h.registry.get(&h.node_id).await.unwrap().status,
            NodeStatus::Online
        );
    }

    /// Drive a session into `active` without a live node: pay, flip the row,
    /// and restore the reservation the way recovery does.
    async fn force_active(h: &Harness, minutes: u32, started_secs_ago: i64) -> String {
        let outcome = h
            .orchestrator
            .new_session(
                h.buyer,
                NewSessionRequest {
                    payment_method: PaymentMethod::Wallet,
                    ..lightning_request(&h, minutes)
                },
            )
            .await
            .unwrap();

        h.ledger
            .debit(
                h.buyer,
                outcome.amount_sats,
                LedgerEntryType::SessionPayment,
                "test payment",
                Some(&outcome.session_id),
            )
            .await
            .unwrap();

        let queries = SessionQueries::new(&h.db);
        let started = Utc::now() - chrono::Duration::seconds(started_secs_ago);
        assert!(queries.mark_paid(&outcome.session_id, started).await.unwrap());
        assert!(queries
            .mark_active(
                &outcome.session_id,
                started,
                started + chrono::Duration::minutes(minutes as i64),
            )
            .await
            .unwrap());
        outcome.session_id
    }

    #[tokio::test]
    async fn expiry_settles_with_commission_split() {
        let h = harness().await;
        h.ledger
            .credit(h.buyer, 1_000, LedgerEntryType::Deposit, "seed", None)
            .await
            .unwrap();

        // 5 minutes purchased, started 6 minutes ago: already expired
        let session_id = force_active(&h, 5, 360).await;
        h.orchestrator.post(&session_id, SessionEvent::ExpiryTick).await;

        let session = wait_for_state(&h.db, &session_id, SessionState::Ended).await;
        assert_eq!(session.refund_sats, 0);

        // 500 sats split 90/10 between owner and house
        assert_eq!(h.ledger.balance(h.owner).await.unwrap(), 9_000 + 450);
        let house = h.ledger.house_account_id().await.unwrap();
        assert_eq!(h.ledger.balance(house).await.unwrap(), 50);
        assert_eq!(h.ledger.balance(h.buyer).await.unwrap(), 500);

        // A duplicated tick after settlement changes nothing
        h.orchestrator.post(&session_id, SessionEvent::ExpiryTick).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(h.ledger.balance(h.owner).await.unwrap(), 9_450);
        assert_eq!(h.ledger.balance(house).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn early_end_prorates_at_minute_ceiling() {
        let h = harness().await;
        h.ledger
            .credit(h.buyer, 1_000, LedgerEntryType::Deposit, "seed", None)
            .await
            .unwrap();

        // 8 minutes purchased at 100 sat/min, ended 2m30s in: 3 minutes due
        let session_id = force_active(&h, 8, 150).await;
        h.orchestrator.post(&session_id, SessionEvent::EndRequested).await;

        let session = wait_for_state(&h.db, &session_id, SessionState::Ended).await;
        assert_eq!(session.refund_sats, 500);

        // Buyer paid 800, got 500 back; owner +270, house +30
        assert_eq!(h.ledger.balance(h.buyer).await.unwrap(), 1_000 - 300);
        assert_eq!(h.ledger.balance(h.owner).await.unwrap(), 9_000 + 270);
        let house = h.ledger.house_account_id().await.unwrap();
        assert_eq!(h.ledger.balance(house).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn node_failure_mid_session_refunds_in_full() {
        let h = harness().await;
        h.ledger
            .credit(h.buyer, 1_000, LedgerEntryType::Deposit, "seed", None)
            .await
            .unwrap();

        let session_id = force_active(&h, 5, 60).await;
        h.orchestrator.post(&session_id, SessionEvent::NodeFailed).await;

        let session = wait_for_state(&h.db, &session_id, SessionState::Ended).await;
        assert_eq!(session.refund_sats, 500);
        assert_eq!(h.ledger.balance(h.buyer).await.unwrap(), 1_000);
        // The failed node earned nothing
        assert_eq!(h.ledger.balance(h.owner).await.unwrap(), 9_000);
    }

    #[tokio::test]
    async fn recovery_restores_reservations_and_settles_interrupted_sessions() {
        let h = harness().await;
        h.ledger
            .credit(h.buyer, 1_000, LedgerEntryType::Deposit, "seed", None)
            .await
            .unwrap();

        let session_id = force_active(&h, 5, 60).await;
        // Simulate a crash: the registry forgets the reservation
        h.registry.release(&h.node_id, &session_id).await;

        h.orchestrator.recover().await.unwrap();

        use crate::registry::NodeStatus;
        let node = h.registry.get(&h.node_id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Busy);
        assert_eq!(node.current_session_id.as_deref(), Some(session_id.as_str()));

        // A session interrupted mid-settlement completes exactly once
        let queries = SessionQueries::new(&h.db);
        assert!(queries
            .transition(&session_id, SessionState::Active, SessionState::Settling)
            .await
            .unwrap());
        h.orchestrator.recover().await.unwrap();

        wait_for_state(&h.db, &session_id, SessionState::Ended).await;
        assert_eq!(h.ledger.balance(h.owner).await.unwrap(), 9_000 + 450);
        let house = h.ledger.house_account_id().await.unwrap();
        assert_eq!(h.ledger.balance(house).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn check_payment_in_test_mode_observes_settlement() {
        let h = harness().await;
        let outcome = h
            .orchestrator
            .new_session(h.buyer, lightning_request(&h, 5))
            .await
            .unwrap();

        // Test-mode invoices settle instantly; checking must be idempotent
        assert!(h
            .orchestrator
            .check_payment(&outcome.session_id, h.buyer)
            .await
            .unwrap());

        // Another user cannot probe someone else's session
        let err = h
            .orchestrator
            .check_payment(&outcome.session_id, h.owner)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Forbidden));
    }
}
