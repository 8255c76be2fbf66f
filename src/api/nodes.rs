//! Node endpoints: registration, heartbeats, public listings

use super::{error_response, ApiResponse, ApiState};
use crate::db::{HardwareDescriptor, ModelDescriptor, SessionQueries};
use crate::registry::{NodeCapabilities, NodeSnapshot, NodeStatus};
use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Node registration request
#[derive(Debug, Deserialize)]
pub struct RegisterNodeRequest {
    /// Node capabilities
    pub capabilities: NodeCapabilities,
}

/// Node registration response
#[derive(Debug, Serialize)]
pub struct RegisterNodeResponse {
    /// Assigned node id
    pub node_id: String,
    /// Fee debited from the owner's balance (satoshis)
    pub registration_fee: u64,
}

/// Register a node owned by the authenticated user
pub async fn register_node(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<RegisterNodeRequest>,
) -> impl IntoResponse {
    let user = match super::authenticate(&state, &headers).await {
        Ok(user) => user,
        Err(e) => return error_response(e).into_response(),
    };

    match state.app.registry.register(user.id, req.capabilities).await {
        Ok((node_id, registration_fee)) => {
            info!("API: node {} registered by user {}", node_id, user.id);
            Json(ApiResponse::ok(RegisterNodeResponse {
                node_id,
                registration_fee,
            }))
            .into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

/// Heartbeat request from a node agent
#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    /// Node id assigned at registration
    pub node_id: String,
    /// Current load (0.0 idle .. 1.0 saturated)
    #[serde(default)]
    pub load: f64,
    /// Refreshed hardware descriptor, if changed
    #[serde(default)]
    pub hardware: Option<HardwareDescriptor>,
    /// Refreshed model list, if changed
    #[serde(default)]
    pub models: Option<Vec<ModelDescriptor>>,
}

/// Heartbeat acknowledgement
#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    /// Always true on success
    pub ok: bool,
}

/// Node liveness heartbeat. The node id is the credential here; agents do
/// not hold their owner's bearer token.
pub async fn node_heartbeat(
    State(state): State<ApiState>,
    Json(req): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    match state
        .app
        .registry
        .heartbeat(&req.node_id, req.load, req.hardware, req.models)
        .await
    {
        Ok(()) => Json(ApiResponse::ok(HeartbeatResponse { ok: true })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// Public node listing entry
#[derive(Debug, Serialize)]
pub struct NodeListing {
    /// Node id
    pub node_id: String,
    /// Human readable name
    pub name: String,
    /// Price per minute in satoshis
    pub price_per_minute_sats: i64,
    /// Runtime status
    pub status: NodeStatus,
    /// Load reported on the last heartbeat (0.0 idle .. 1.0 saturated)
    pub load: f64,
    /// Hardware descriptor
    pub hardware: HardwareDescriptor,
    /// Offered models
    pub models: Vec<ModelDescriptor>,
    /// When the current session ends, for busy nodes (ISO 8601)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub busy_until: Option<String>,
    /// Lifetime completed sessions
    pub completed_sessions: i64,
    /// Lifetime earnings in satoshis
    pub total_earned_sats: i64,
}

async fn listing_for(state: &ApiState, snapshot: &NodeSnapshot) -> NodeListing {
    // Busy nodes expose when they free up; mid-transition sessions have no
    // expiry yet and simply show as busy
    let busy_until = if snapshot.status == NodeStatus::Busy {
        match SessionQueries::new(&state.app.db)
            .open_session_for_node(&snapshot.node.id)
            .await
        {
            Ok(Some(session)) => session.expires_at.map(|e| e.to_rfc3339()),
            _ => None,
        }
    } else {
        None
    };

    NodeListing {
        node_id: snapshot.node.id.clone(),
        name: snapshot.node.name.clone(),
        price_per_minute_sats: snapshot.node.price_per_minute_sats,
        status: snapshot.status,
        load: snapshot.load,
        hardware: snapshot.node.hardware.clone(),
        models: snapshot.node.models.clone(),
        busy_until,
        completed_sessions: snapshot.node.completed_sessions,
        total_earned_sats: snapshot.node.total_earned_sats,
    }
}

/// Public listing of online and busy nodes
pub async fn nodes_online(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshots = state.app.registry.list_all().await;
    let mut nodes = Vec::new();
    for snapshot in snapshots
        .iter()
        .filter(|s| s.status != NodeStatus::Offline)
    {
        nodes.push(listing_for(&state, snapshot).await);
    }
    nodes.sort_by(|a, b| a.price_per_minute_sats.cmp(&b.price_per_minute_sats));
    Json(ApiResponse::ok(nodes)).into_response()
}

/// Model availability summary
#[derive(Debug, Serialize)]
pub struct ModelsAvailableResponse {
    /// Models servable right now on an idle node
    pub models: Vec<AvailableModel>,
    /// Models only present on busy nodes
    pub busy_models: Vec<AvailableModel>,
    /// Number of nodes currently heartbeating
    pub total_nodes_online: usize,
}

/// One model in the availability summary
#[derive(Debug, Serialize)]
pub struct AvailableModel {
    /// Model id
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Cheapest per-minute price across nodes offering it (satoshis)
    pub min_price_per_minute_sats: i64,
    /// Number of nodes offering it
    pub node_count: usize,
}

/// Public model availability across the fleet
pub async fn models_available(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshots = state.app.registry.list_all().await;

    let mut idle: BTreeMap<String, AvailableModel> = BTreeMap::new();
    let mut busy: BTreeMap<String, AvailableModel> = BTreeMap::new();
    let mut online = 0usize;

    for snapshot in &snapshots {
        let bucket = match snapshot.status {
            NodeStatus::Online => {
                online += 1;
                &mut idle
            }
            NodeStatus::Busy => {
                online += 1;
                &mut busy
            }
            NodeStatus::Offline => continue,
        };
        for model in &snapshot.node.models {
            let price = snapshot.node.price_per_minute_sats;
            bucket
                .entry(model.id.clone())
                .and_modify(|m| {
                    m.node_count += 1;
                    if price < m.min_price_per_minute_sats {
                        m.min_price_per_minute_sats = price;
                    }
                })
                .or_insert_with(|| AvailableModel {
                    id: model.id.clone(),
                    name: model.name.clone(),
                    min_price_per_minute_sats: price,
                    node_count: 1,
                });
        }
    }

    // A model with an idle node is servable; drop it from the busy bucket
    let busy_models: Vec<AvailableModel> = busy
        .into_iter()
        .filter(|(id, _)| !idle.contains_key(id))
        .map(|(_, m)| m)
        .collect();

    Json(ApiResponse::ok(ModelsAvailableResponse {
        models: idle.into_values().collect(),
        busy_models,
        total_nodes_online: online,
    }))
    .into_response()
}

/// The authenticated owner's nodes with lifetime stats
pub async fn nodes_mine(State(state): State<ApiState>, headers: HeaderMap) -> impl IntoResponse {
    let user = match super::authenticate(&state, &headers).await {
        Ok(user) => user,
        Err(e) => return error_response(e).into_response(),
    };

    let snapshots = state.app.registry.list_all().await;
    let mut nodes = Vec::new();
    for snapshot in snapshots
        .iter()
        .filter(|s| s.node.owner_user_id == user.id)
    {
        nodes.push(listing_for(&state, snapshot).await);
    }

    // An owner with no nodes gets an empty list, not a 404
    Json(ApiResponse::ok(nodes)).into_response()
}
