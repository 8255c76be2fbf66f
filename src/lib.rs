//! lncompute: a coordinator for a Lightning-settled LLM inference marketplace
//!
//! The coordinator brokers time-limited, exclusive chat sessions between
//! users holding satoshi balances and registered compute nodes running a
//! local LLM runtime:
//!
//! - **Session brokering**: a per-session state machine drives each session
//!   from pending payment through starting and active to settlement
//! - **Node registry**: capabilities, pricing, liveness and exclusive
//!   reservations for every registered node
//! - **Dual-ledger payments**: external Lightning invoices (via an LND
//!   daemon) and an internal satoshi ledger gate session activation
//! - **Streaming bridge**: prompts in, token frames out, over a per-user
//!   push channel
//!
//! # Architecture
//!
//! The HTTP API and push channel translate external calls into operations on
//! the orchestrator; the scheduler owns every clock (session expiry, node
//! liveness, invoice polling); the ledger and registry are the single
//! authorities over balances and node reservations respectively.
//!
#![warn(missing_docs)]

pub mod api;
pub mod bridge;
pub mod config;
pub mod db;
pub mod ledger;
pub mod lightning;
pub mod noderpc;
pub mod ratelimit;
pub mod registry;
pub mod scheduler;
pub mod session;

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use bridge::{PushHub, StreamingBridge};
pub use config::Config;
use db::Database;
use ledger::Ledger;
use lightning::LightningGateway;
use noderpc::NodeRpcClient;
use registry::NodeRegistry;
use scheduler::Scheduler;
use session::SessionOrchestrator;

/// The main coordinator application state
#[derive(Clone)]
pub struct CoordinatorApp {
    /// Application configuration
    pub config: Arc<Config>,
    /// Database connection
    pub db: Database,
    /// Internal balance ledger
    pub ledger: Ledger,
    /// Lightning gateway
    pub lightning: Arc<LightningGateway>,
    /// Node registry
    pub registry: Arc<NodeRegistry>,
    /// Session orchestrator
    pub orchestrator: Arc<SessionOrchestrator>,
    /// Streaming bridge
    pub bridge: Arc<StreamingBridge>,
    /// Expiry/heartbeat/invoice scheduler
    pub scheduler: Arc<Scheduler>,
}

impl CoordinatorApp {
    /// Create a new coordinator instance
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing coordinator...");

        let config = Arc::new(config);

        let db_url = config.resolve_database_url();
        info!("Connecting to database at: {}", db_url);
        let db = Database::connect(&db_url).await?;

        let ledger = Ledger::new(db.clone());

        let lightning = Arc::new(LightningGateway::connect(&config.lnd).await?);

        let registry = Arc::new(NodeRegistry::new(db.clone(), ledger.clone(), config.clone()));

        let rpc = NodeRpcClient::new(config.nodes.node_rpc_timeout_secs)?;
        let hub = Arc::new(PushHub::new(config.sessions.token_buffer_size));

        let orchestrator = SessionOrchestrator::new(
            config.clone(),
            db.clone(),
            ledger.clone(),
            registry.clone(),
            lightning.clone(),
            rpc.clone(),
            hub.clone(),
        );

        let bridge = Arc::new(StreamingBridge::new(
            config.clone(),
            db.clone(),
            rpc,
            hub,
        ));

        let scheduler = Arc::new(Scheduler::new(
            config.clone(),
            db.clone(),
            ledger.clone(),
            registry.clone(),
            orchestrator.clone(),
            lightning.clone(),
        ));

        info!("Coordinator initialized successfully");

        Ok(Self {
            config,
            db,
            ledger,
            lightning,
            registry,
            orchestrator,
            bridge,
            scheduler,
        })
    }

    /// Start the coordinator
    pub async fn run(&self) -> Result<()> {
        self.run_with_shutdown(tokio::sync::oneshot::channel().1).await
    }

    /// Start the coordinator with a shutdown signal
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        info!("Starting coordinator...");

        // A daemon outage must not keep the coordinator down; pending
        // invoices are simply retried once it is back
        match self.lightning.get_info().await {
            Ok(daemon) => info!(
                "Lightning daemon reachable: pubkey={}, synced={}",
                daemon.identity_pubkey, daemon.synced_to_chain
            ),
            Err(e) => warn!("Lightning daemon not reachable at startup: {}", e),
        }

        let known_nodes = self.registry.load_from_db().await?;
        info!("Node registry primed with {} nodes", known_nodes);

        // Re-arm every non-terminal session before accepting traffic
        self.orchestrator.recover().await?;

        self.scheduler.clone().start();

        info!(
            "Coordinator running. API available at http://{}",
            self.config.api_bind_address()
        );

        api::serve_with_shutdown(self.clone(), shutdown_rx).await?;

        Ok(())
    }

    /// Shutdown the coordinator gracefully
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down coordinator...");
        self.db.close().await;
        info!("Coordinator shutdown complete");
        Ok(())
    }
}

/// Error types for coordinator operations
#[derive(thiserror::Error, Debug)]
pub enum CoordinatorError {
    /// Missing or invalid credentials
    #[error("Unauthenticated")]
    Unauthenticated,

    /// Authenticated but not allowed
    #[error("Forbidden")]
    Forbidden,

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request rejected before any effect
    #[error("Validation error: {0}")]
    Validation(String),

    /// Balance does not cover the request
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// The node is serving another session
    #[error("Node busy: {0}")]
    NodeBusy(String),

    /// The node is offline or unreachable
    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    /// The Lightning daemon is unreachable; retryable
    #[error("Lightning unavailable: {0}")]
    LightningUnavailable(String),

    /// The daemon rejected an invoice or payment; terminal
    #[error("Invalid invoice: {0}")]
    InvalidInvoice(String),

    /// The node failed to load the requested model
    #[error("Model load failed: {0}")]
    ModelLoadFailed(String),

    /// Too many requests
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for coordinator operations
pub type CoordResult<T> = std::result::Result<T, CoordinatorError>;
