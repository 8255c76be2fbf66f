//! Node registry and liveness tracker
//!
//! The registry is the single authority over a node's runtime state. Durable
//! registration data lives in the `nodes` table; liveness (heartbeats, busy
//! status, the current occupant session) lives in an in-memory map and is
//! rebuilt from heartbeats after a restart.
//!
//! `try_reserve` / `release` are the only paths that move a node in and out
//! of `busy`, implemented as a compare-and-set under the write lock, so at
//! most one non-ended session can ever hold a node.

use crate::config::Config;
use crate::db::{
    Database, HardwareDescriptor, LedgerEntryType, ModelDescriptor, NodeModel, NodeQueries,
};
use crate::ledger::Ledger;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{CoordinatorError, CoordResult};

/// Runtime status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Heartbeating and idle
    Online,
    /// Heartbeating and serving a session
    Busy,
    /// Silent past the heartbeat timeout
    Offline,
}

/// Registration request capabilities
#[derive(Debug, Clone, Deserialize)]
pub struct NodeCapabilities {
    /// Human readable node name
    pub name: String,
    /// Base URL of the node agent (e.g. `http://1.2.3.4:9000`)
    pub endpoint: String,
    /// Price per session minute in satoshis
    pub price_per_minute_sats: u64,
    /// Hardware descriptor
    pub hardware: HardwareDescriptor,
    /// Offered models
    pub models: Vec<ModelDescriptor>,
    /// Lightning address for direct payouts, if any
    #[serde(default)]
    pub payment_address: Option<String>,
}

/// In-memory node entry: durable row plus runtime liveness
#[derive(Debug, Clone)]
struct NodeEntry {
    node: NodeModel,
    endpoint: String,
    status: NodeStatus,
    last_heartbeat_at: Option<DateTime<Utc>>,
    current_session_id: Option<String>,
    load: f64,
}

/// Read-only snapshot of a node handed out to callers
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    /// Durable registration data
    pub node: NodeModel,
    /// Node agent base URL
    pub endpoint: String,
    /// Runtime status
    pub status: NodeStatus,
    /// Last heartbeat, if any since startup
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Occupying session, if busy
    pub current_session_id: Option<String>,
    /// Load reported by the node
    pub load: f64,
}

impl NodeSnapshot {
    /// Find an offered model by id
    pub fn find_model(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.node.models.iter().find(|m| m.id == model_id)
    }
}

/// The node registry
pub struct NodeRegistry {
    db: Database,
    ledger: Ledger,
    config: Arc<Config>,
    nodes: RwLock<HashMap<String, NodeEntry>>,
}

impl NodeRegistry {
    /// Create a registry over the shared database
    pub fn new(db: Database, ledger: Ledger, config: Arc<Config>) -> Self {
        Self {
            db,
            ledger,
            config,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Load persisted nodes; all start offline until their next heartbeat
    pub async fn load_from_db(&self) -> CoordResult<usize> {
        let queries = NodeQueries::new(&self.db);
        let persisted = queries
            .list_all()
            .await
            .map_err(|e| CoordinatorError::Database(e.to_string()))?;

        let mut nodes = self.nodes.write().await;
        let count = persisted.len();
        for node in persisted {
            let endpoint = node.endpoint.clone();
            nodes.insert(
                node.id.clone(),
                NodeEntry {
                    node,
                    endpoint,
                    status: NodeStatus::Offline,
                    last_heartbeat_at: None,
                    current_session_id: None,
                    load: 0.0,
                },
            );
        }
        info!("Registry: loaded {} persisted nodes (all offline until heartbeat)", count);
        Ok(count)
    }

    /// Register a new node, debiting the registration fee from the owner.
    ///
    /// Duplicate hardware fingerprints from the same owner are rejected
    /// before any money moves. A failed insert refunds the fee.
    pub async fn register(
        &self,
        owner_user_id: i64,
        capabilities: NodeCapabilities,
    ) -> CoordResult<(String, u64)> {
        if capabilities.models.is_empty() {
            return Err(CoordinatorError::Validation(
                "A node must offer at least one model".to_string(),
            ));
        }
        if capabilities.price_per_minute_sats == 0 {
            return Err(CoordinatorError::Validation(
                "Price per minute must be positive".to_string(),
            ));
        }
        if !capabilities.endpoint.starts_with("http://")
            && !capabilities.endpoint.starts_with("https://")
        {
            return Err(CoordinatorError::Validation(
                "Node endpoint must be an http(s) URL".to_string(),
            ));
        }

        let fingerprint = hardware_fingerprint(&capabilities.hardware);
        let queries = NodeQueries::new(&self.db);
        if queries
            .fingerprint_exists(owner_user_id, &fingerprint)
            .await
            .map_err(|e| CoordinatorError::Database(e.to_string()))?
        {
            return Err(CoordinatorError::Validation(
                "This hardware is already registered by you".to_string(),
            ));
        }

        let fee = self.config.pricing.node_registration_fee_sats;
        self.ledger
            .debit(
                owner_user_id,
                fee,
                LedgerEntryType::Withdrawal,
                "Node registration fee",
                None,
            )
            .await?;

        let node_id = format!("node-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let mut models = capabilities.models;
        models.sort_by(|a, b| a.id.cmp(&b.id));

        let node = NodeModel {
            id: node_id.clone(),
            name: capabilities.name,
            owner_user_id,
            price_per_minute_sats: capabilities.price_per_minute_sats as i64,
            endpoint: capabilities.endpoint,
            hardware: capabilities.hardware,
            models,
            hw_fingerprint: fingerprint,
            payment_address: capabilities.payment_address,
            registered_at: Utc::now(),
            total_sessions: 0,
            completed_sessions: 0,
            failed_sessions: 0,
            total_earned_sats: 0,
        };

        if let Err(e) = queries.insert(&node).await {
            // Undo the fee so a lost race on the fingerprint costs nothing
            warn!("Registry: node insert failed, refunding fee: {}", e);
            self.ledger
                .credit(
                    owner_user_id,
                    fee,
                    LedgerEntryType::Refund,
                    "Node registration failed",
                    None,
                )
                .await?;
            return Err(CoordinatorError::Database(e.to_string()));
        }

        let endpoint = node.endpoint.clone();
        self.nodes.write().await.insert(
            node_id.clone(),
            NodeEntry {
                node,
                endpoint,
                status: NodeStatus::Online,
                last_heartbeat_at: Some(Utc::now()),
                current_session_id: None,
                load: 0.0,
            },
        );

        info!(
            "Registry: registered node {} for owner {} (fee {} sats)",
            node_id, owner_user_id, fee
        );
        Ok((node_id, fee))
    }

    /// Process a heartbeat; re-admits an offline node as online
    pub async fn heartbeat(
        &self,
        node_id: &str,
        load: f64,
        hardware: Option<HardwareDescriptor>,
        models: Option<Vec<ModelDescriptor>>,
    ) -> CoordResult<()> {
        let mut nodes = self.nodes.write().await;
        let entry = nodes
            .get_mut(node_id)
            .ok_or_else(|| CoordinatorError::NotFound(format!("node {node_id}")))?;

        entry.last_heartbeat_at = Some(Utc::now());
        entry.load = load;
        if entry.status == NodeStatus::Offline {
            debug!("Registry: node {} re-admitted as online", node_id);
            entry.status = NodeStatus::Online;
        }

        if let Some(hardware) = hardware {
            entry.node.hardware = hardware;
        }
        if let Some(mut models) = models {
            models.sort_by(|a, b| a.id.cmp(&b.id));
            entry.node.models = models;
        }
        let hardware = entry.node.hardware.clone();
        let models = entry.node.models.clone();
        drop(nodes);

        // Persist the refreshed capability set outside the map lock
        NodeQueries::new(&self.db)
            .update_capabilities(node_id, &hardware, &models)
            .await
            .map_err(|e| CoordinatorError::Database(e.to_string()))?;
        Ok(())
    }

    /// Snapshot of one node
    pub async fn get(&self, node_id: &str) -> Option<NodeSnapshot> {
        self.nodes.read().await.get(node_id).map(snapshot)
    }

    /// Snapshot of every known node
    pub async fn list_all(&self) -> Vec<NodeSnapshot> {
        self.nodes.read().await.values().map(snapshot).collect()
    }

    /// Atomically reserve an online idle node for a session.
    ///
    /// The only path into `busy`. The loser of a race observes `NodeBusy`
    /// before any payment is attempted.
    pub async fn try_reserve(&self, node_id: &str, session_id: &str) -> CoordResult<()> {
        let mut nodes = self.nodes.write().await;
        let entry = nodes
            .get_mut(node_id)
            .ok_or_else(|| CoordinatorError::NotFound(format!("node {node_id}")))?;

        match entry.status {
            NodeStatus::Online => {
                entry.status = NodeStatus::Busy;
                entry.current_session_id = Some(session_id.to_string());
                info!("Registry: reserved node {} for session {}", node_id, session_id);
                Ok(())
            }
            NodeStatus::Busy => Err(CoordinatorError::NodeBusy(format!(
                "node {node_id} is serving another session"
            ))),
            NodeStatus::Offline => Err(CoordinatorError::NodeUnavailable(format!(
                "node {node_id} is offline"
            ))),
        }
    }

    /// Re-attach a reservation after a restart.
    ///
    /// Recovery calls this for every session that was holding a node when
    /// the coordinator went down, so the node cannot be handed to someone
    /// else once it heartbeats back in.
    pub async fn restore_reservation(&self, node_id: &str, session_id: &str) {
        let mut nodes = self.nodes.write().await;
        if let Some(entry) = nodes.get_mut(node_id) {
            entry.status = NodeStatus::Busy;
            entry.current_session_id = Some(session_id.to_string());
            // Grace window: the node gets a full heartbeat timeout to report
            // in before the sweep declares it dead and fails the session
            if entry.last_heartbeat_at.is_none() {
                entry.last_heartbeat_at = Some(Utc::now());
            }
            info!(
                "Registry: restored reservation of node {} by session {}",
                node_id, session_id
            );
        }
    }

    /// Release a reservation. A no-op unless `session_id` currently holds
    /// the node, so duplicated cleanup paths are safe.
    pub async fn release(&self, node_id: &str, session_id: &str) {
        let mut nodes = self.nodes.write().await;
        let Some(entry) = nodes.get_mut(node_id) else {
            return;
        };
        if entry.current_session_id.as_deref() != Some(session_id) {
            return;
        }

        entry.current_session_id = None;
        let timeout = chrono::Duration::seconds(self.config.nodes.heartbeat_timeout_secs as i64);
        let fresh = entry
            .last_heartbeat_at
            .map(|t| Utc::now() - t <= timeout)
            .unwrap_or(false);
        entry.status = if fresh {
            NodeStatus::Online
        } else {
            NodeStatus::Offline
        };
        info!(
            "Registry: released node {} from session {} (now {:?})",
            node_id, session_id, entry.status
        );
    }

    /// Mark nodes silent past the heartbeat timeout as offline.
    ///
    /// Returns the affected nodes together with the session each one held,
    /// so the caller can fail those sessions.
    pub async fn sweep_offline(&self) -> Vec<(String, Option<String>)> {
        let timeout = chrono::Duration::seconds(self.config.nodes.heartbeat_timeout_secs as i64);
        let now = Utc::now();
        let mut swept = Vec::new();

        let mut nodes = self.nodes.write().await;
        for (id, entry) in nodes.iter_mut() {
            if entry.status == NodeStatus::Offline {
                continue;
            }
            let stale = entry
                .last_heartbeat_at
                .map(|t| now - t > timeout)
                .unwrap_or(true);
            if stale {
                warn!("Registry: node {} went silent, marking offline", id);
                entry.status = NodeStatus::Offline;
                swept.push((id.clone(), entry.current_session_id.take()));
            }
        }
        swept
    }

    /// Record a finished session on the node's lifetime counters
    pub async fn record_outcome(
        &self,
        node_id: &str,
        completed: bool,
        earned_sats: i64,
    ) -> CoordResult<()> {
        NodeQueries::new(&self.db)
            .record_outcome(node_id, completed, earned_sats)
            .await
            .map_err(|e| CoordinatorError::Database(e.to_string()))?;

        let mut nodes = self.nodes.write().await;
        if let Some(entry) = nodes.get_mut(node_id) {
            entry.node.total_sessions += 1;
            if completed {
                entry.node.completed_sessions += 1;
                entry.node.total_earned_sats += earned_sats;
            } else {
                entry.node.failed_sessions += 1;
            }
        }
        Ok(())
    }
}

fn snapshot(entry: &NodeEntry) -> NodeSnapshot {
    NodeSnapshot {
        node: entry.node.clone(),
        endpoint: entry.endpoint.clone(),
        status: entry.status,
        last_heartbeat_at: entry.last_heartbeat_at,
        current_session_id: entry.current_session_id.clone(),
        load: entry.load,
    }
}

/// Stable fingerprint over the hardware descriptor
fn hardware_fingerprint(hardware: &HardwareDescriptor) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hardware.cpu.as_bytes());
    hasher.update(hardware.ram_mb.to_le_bytes());
    for gpu in &hardware.gpus {
        hasher.update(gpu.model.as_bytes());
        hasher.update(gpu.vram_mb.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{GpuDescriptor, UserQueries};

    fn capabilities(endpoint: &str) -> NodeCapabilities {
        NodeCapabilities {
            name: "rig".to_string(),
            endpoint: endpoint.to_string(),
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
        }
    }

    async fn setup() -> (Database, Arc<NodeRegistry>, i64) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let owner = UserQueries::new(&db).create("owner", "digest").await.unwrap();
        let ledger = Ledger::new(db.clone());
        ledger
            .credit(owner.id, 10_000, LedgerEntryType::Deposit, "seed", None)
            .await
            .unwrap();
        let registry = Arc::new(NodeRegistry::new(
            db.clone(),
            ledger,
            Arc::new(Config::default()),
        ));
        (db, registry, owner.id)
    }

    #[tokio::test]
    async fn registration_debits_fee_and_goes_online() {
        let (db, registry, owner) = setup().await;
        let (node_id, fee) = registry
            .register(owner, capabilities("http://10.0.0.1:9000"))
            .await
            .unwrap();
        assert_eq!(fee, 1_000);

        let snapshot = registry.get(&node_id).await.unwrap();
        assert_eq!(snapshot.status, NodeStatus::Online);
        assert!(snapshot.find_model("tiny").is_some());

        let balance = Ledger::new(db).balance(owner).await.unwrap();
        assert_eq!(balance, 9_000);
    }

    #[tokio::test]
    async fn duplicate_hardware_is_rejected_without_charge() {
        let (db, registry, owner) = setup().await;
        registry
            .register(owner, capabilities("http://10.0.0.1:9000"))
            .await
            .unwrap();

        let err = registry
            .register(owner, capabilities("http://10.0.0.2:9000"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));

        // Only one fee was taken
        let balance = Ledger::new(db).balance(owner).await.unwrap();
        assert_eq!(balance, 9_000);
    }

    #[tokio::test]
    async fn reserve_is_exclusive() {
        let (_db, registry, owner) = setup().await;
        let (node_id, _) = registry
            .register(owner, capabilities("http://10.0.0.1:9000"))
            .await
            .unwrap();

        registry.try_reserve(&node_id, "s1").await.unwrap();
        let err = registry.try_reserve(&node_id, "s2").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NodeBusy(_)));

        // Release by the wrong session is a no-op
        registry.release(&node_id, "s2").await;
        assert_eq!(registry.get(&node_id).await.unwrap().status, NodeStatus::Busy);

        registry.release(&node_id, "s1").await;
        assert_eq!(registry.get(&node_id).await.unwrap().status, NodeStatus::Online);
        registry.try_reserve(&node_id, "s2").await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_reservations_have_one_winner() {
        let (_db, registry, owner) = setup().await;
        let (node_id, _) = registry
            .register(owner, capabilities("http://10.0.0.1:9000"))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            let node_id = node_id.clone();
            handles.push(tokio::spawn(async move {
                registry.try_reserve(&node_id, &format!("s{i}")).await.is_ok()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn sweep_marks_silent_nodes_offline() {
        let (_db, registry, owner) = setup().await;
        let (node_id, _) = registry
            .register(owner, capabilities("http://10.0.0.1:9000"))
            .await
            .unwrap();
        registry.try_reserve(&node_id, "s1").await.unwrap();

        // Backdate the heartbeat past the timeout
        {
            let mut nodes = registry.nodes.write().await;
            nodes.get_mut(&node_id).unwrap().last_heartbeat_at =
                Some(Utc::now() - chrono::Duration::seconds(120));
        }

        let swept = registry.sweep_offline().await;
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].0, node_id);
        assert_eq!(swept[0].1.as_deref(), Some("s1"));
        assert_eq!(registry.get(&node_id).await.unwrap().status, NodeStatus::Offline);

        // A heartbeat re-admits the node
        registry.heartbeat(&node_id, 0.0, None, None).await.unwrap();
        assert_eq!(registry.get(&node_id).await.unwrap().status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn reserve_rejects_offline_node() {
        let (_db, registry, owner) = setup().await;
        let (node_id, _) = registry
            .register(owner, capabilities("http://10.0.0.1:9000"))
            .await
            .unwrap();
        {
            let mut nodes = registry.nodes.write().await;
            nodes.get_mut(&node_id).unwrap().last_heartbeat_at =
                Some(Utc::now() - chrono::Duration::seconds(120));
        }
        registry.sweep_offline().await;

        let err = registry.try_reserve(&node_id, "s1").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NodeUnavailable(_)));
    }
}
