//! Session endpoints: purchase and payment checks

use super::{check_rate, client_key, error_response, ApiResponse, ApiState};
use crate::db::PaymentMethod;
use crate::session::{NewSessionRequest, SessionInvoice};
use axum::{
    extract::{ConnectInfo, Path, State},
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::info;

/// New session request body
#[derive(Debug, Deserialize)]
pub struct NewSessionBody {
    /// Target node
    pub node_id: String,
    /// Preloaded model id on that node
    #[serde(default)]
    pub model: Option<String>,
    /// HuggingFace repo coordinate `owner/name[:quant]` for dynamic loading
    #[serde(default)]
    pub hf_repo: Option<String>,
    /// Session length in minutes
    pub minutes: u32,
    /// Requested context length
    #[serde(default)]
    pub context_length: Option<u32>,
    /// `lightning` (default) or `wallet`
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
}

/// New session response
#[derive(Debug, Serialize)]
pub struct NewSessionResponse {
    /// Session id
    pub session_id: String,
    /// Invoice to pay, for lightning sessions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<SessionInvoice>,
    /// Total price in satoshis
    pub amount_sats: u64,
    /// Per-minute price of the chosen node
    pub price_per_minute_sats: u64,
}

/// Purchase a session on a node
pub async fn new_session(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<NewSessionBody>,
) -> impl IntoResponse {
    let user = match super::authenticate(&state, &headers).await {
        Ok(user) => user,
        Err(e) => return error_response(e).into_response(),
    };
    if let Err(e) = check_rate(
        &state.limits.new_session,
        &client_key(Some(user.id), &addr),
    ) {
        return error_response(e).into_response();
    }

    let request = NewSessionRequest {
        node_id: body.node_id,
        model: body.model,
        hf_repo: body.hf_repo,
        minutes: body.minutes,
        context_length: body.context_length,
        payment_method: body.payment_method.unwrap_or(PaymentMethod::Lightning),
    };

    match state.app.orchestrator.new_session(user.id, request).await {
        Ok(outcome) => {
            info!(
                "API: session {} created for user {} ({} sats)",
                outcome.session_id, user.id, outcome.amount_sats
            );
            Json(ApiResponse::ok(NewSessionResponse {
                session_id: outcome.session_id,
                invoice: outcome.invoice,
                amount_sats: outcome.amount_sats,
                price_per_minute_sats: outcome.price_per_minute_sats,
            }))
            .into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

/// Payment check response
#[derive(Debug, Serialize)]
pub struct CheckPaymentResponse {
    /// Whether the session's payment has been observed
    pub paid: bool,
}

/// Check (and actively poll) payment for a session
pub async fn check_payment(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let user = match super::authenticate(&state, &headers).await {
        Ok(user) => user,
        Err(e) => return error_response(e).into_response(),
    };

    match state.app.orchestrator.check_payment(&session_id, user.id).await {
        Ok(paid) => Json(ApiResponse::ok(CheckPaymentResponse { paid })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}
