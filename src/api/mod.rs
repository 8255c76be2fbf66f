//! HTTP API for the coordinator
//!
//! This module provides the public request/response surface:
//! - Account registration, login, profile
//! - Public node and model listings
//! - Node registration and heartbeats
//! - Session purchase and payment checks
//! - Wallet deposits, withdrawals and history
//! - The per-user push channel (WebSocket)

use crate::ratelimit::RateLimiter;
use crate::{CoordinatorApp, CoordinatorError};
use axum::{
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

mod auth;
mod nodes;
mod sessions;
mod wallet;
mod ws;

pub use auth::*;
pub use nodes::*;
pub use sessions::*;
pub use wallet::*;
pub use ws::*;

/// Per-endpoint rate limiters
pub struct RateLimits {
    /// `POST /api/register`
    pub register: RateLimiter,
    /// `POST /api/login`
    pub login: RateLimiter,
    /// `POST /api/new_session`
    pub new_session: RateLimiter,
}

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    /// The coordinator application
    pub app: CoordinatorApp,
    /// Per-endpoint rate limiters
    pub limits: Arc<RateLimits>,
}

/// Build the API router
fn build_router(app: CoordinatorApp) -> Router {
    let limits = Arc::new(RateLimits {
        register: RateLimiter::new(app.config.api.register_rate_per_minute),
        login: RateLimiter::new(app.config.api.login_rate_per_minute),
        new_session: RateLimiter::new(app.config.api.new_session_rate_per_minute),
    });
    let state = ApiState { app, limits };

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Account endpoints
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .route("/api/me", get(me))
        // Public listings
        .route("/api/models/available", get(models_available))
        .route("/api/nodes/online", get(nodes_online))
        // Node owner endpoints
        .route("/api/register_node", post(register_node))
        .route("/api/node_heartbeat", post(node_heartbeat))
        .route("/api/nodes/mine", get(nodes_mine))
        // Session endpoints
        .route("/api/new_session", post(new_session))
        .route("/api/session/:session_id/check_payment", get(check_payment))
        // Wallet endpoints
        .route("/api/wallet/deposit", post(wallet_deposit))
        .route("/api/wallet/deposit/check/:payment_hash", get(wallet_deposit_check))
        .route("/api/wallet/pay_session", post(wallet_pay_session))
        .route("/api/wallet/withdraw", post(wallet_withdraw))
        .route("/api/wallet/transactions", get(wallet_transactions))
        // Push channel
        .route("/ws", get(ws_handler))
        // Add state
        .with_state(state)
}

/// Start the HTTP API server
pub async fn serve(app: CoordinatorApp) -> anyhow::Result<()> {
    serve_with_shutdown(app, tokio::sync::oneshot::channel().1).await
}

/// Start the HTTP API server with graceful shutdown
pub async fn serve_with_shutdown(
    app: CoordinatorApp,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let config = app.config.clone();

    // Build the router
    let router = build_router(app);

    // Add CORS if enabled
    let router = if config.api.enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };

    // Parse bind address
    let addr: SocketAddr = config
        .api
        .bind_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

    info!("Starting HTTP API server on {}", addr);

    // Start the server with graceful shutdown; connect info feeds the
    // per-IP rate limits on unauthenticated endpoints
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
        info!("Received shutdown signal, stopping API server...");
    })
    .await?;

    info!("API server stopped gracefully");
    Ok(())
}

/// Envelope every JSON endpoint answers with.
///
/// Exactly one of `data` and `error` is present; `ok` tells clients which
/// without probing for the field.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// True when `data` carries the result
    pub ok: bool,
    /// The endpoint's result, on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// What went wrong, on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Wrap a result
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// Wrap a failure message
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Convert CoordinatorError to HTTP status code
pub fn error_to_status_code(err: &CoordinatorError) -> StatusCode {
    match err {
        CoordinatorError::Unauthenticated => StatusCode::UNAUTHORIZED,
        CoordinatorError::Forbidden => StatusCode::FORBIDDEN,
        CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
        CoordinatorError::Validation(_) => StatusCode::BAD_REQUEST,
        CoordinatorError::InsufficientFunds(_) => StatusCode::PAYMENT_REQUIRED,
        CoordinatorError::NodeBusy(_) => StatusCode::CONFLICT,
        CoordinatorError::NodeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::LightningUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::InvalidInvoice(_) => StatusCode::BAD_REQUEST,
        CoordinatorError::ModelLoadFailed(_) => StatusCode::BAD_GATEWAY,
        CoordinatorError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        CoordinatorError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        CoordinatorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Render an error as (status, body), hiding internal detail.
///
/// Internal failures are logged with a correlation id; the client only sees
/// the id, never the underlying message.
pub fn error_response(err: CoordinatorError) -> (StatusCode, Json<ApiResponse<()>>) {
    let status = error_to_status_code(&err);
    let message = match &err {
        CoordinatorError::Database(detail) | CoordinatorError::Internal(detail) => {
            let correlation_id = uuid::Uuid::new_v4();
            error!("Internal error [{}]: {}", correlation_id, detail);
            format!("Internal error (ref {correlation_id})")
        }
        other => other.to_string(),
    };
    (status, Json(ApiResponse::err(message)))
}

/// Resolve the bearer token to a user
pub async fn authenticate(
    state: &ApiState,
    headers: &HeaderMap,
) -> Result<crate::db::UserModel, CoordinatorError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(CoordinatorError::Unauthenticated)?;

    resolve_token(state, token).await
}

/// Resolve a bearer token string to a user
pub async fn resolve_token(
    state: &ApiState,
    token: &str,
) -> Result<crate::db::UserModel, CoordinatorError> {
    let users = crate::db::UserQueries::new(&state.app.db);
    let user_id = users
        .resolve_token(token)
        .await
        .map_err(|e| CoordinatorError::Database(e.to_string()))?
        .ok_or(CoordinatorError::Unauthenticated)?;
    users
        .get_by_id(user_id)
        .await
        .map_err(|e| CoordinatorError::Database(e.to_string()))?
        .ok_or(CoordinatorError::Unauthenticated)
}

/// Rate-limit key: the authenticated user when known, otherwise the caller IP
pub fn client_key(user: Option<i64>, addr: &SocketAddr) -> String {
    match user {
        Some(id) => format!("user:{id}"),
        None => format!("ip:{}", addr.ip()),
    }
}

/// Check a limiter, mapping exhaustion to `RateLimited`
pub fn check_rate(limiter: &RateLimiter, key: &str) -> Result<(), CoordinatorError> {
    if limiter.check(key) {
        Ok(())
    } else {
        Err(CoordinatorError::RateLimited(
            "Too many requests, slow down".to_string(),
        ))
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Crate version
    pub version: String,
}

/// Health check endpoint
pub async fn health_check() -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::ok(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

/// Largest listing window a client may request
pub const MAX_PAGE_SIZE: u32 = 100;

/// Window parameters accepted by the history listings
#[derive(Debug, Deserialize)]
pub struct ListingQuery {
    /// 1-based page number
    #[serde(default = "first_page")]
    pub page: u32,
    /// Rows per page, clamped to [`MAX_PAGE_SIZE`]
    #[serde(default = "default_page_size")]
    pub size: u32,
}

fn first_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    25
}

impl ListingQuery {
    /// The effective (page, size) after clamping client excesses
    pub fn clamped(&self) -> (u32, u32) {
        (self.page.max(1), self.size.clamp(1, MAX_PAGE_SIZE))
    }
}

/// One page of a listing, with enough context to fetch the next
#[derive(Debug, Serialize)]
pub struct ListingPage<T> {
    /// Rows of this page
    pub items: Vec<T>,
    /// Echoed page number
    pub page: u32,
    /// Echoed page size
    pub size: u32,
    /// Total rows across all pages
    pub total: u64,
    /// Whether another page follows this one
    pub has_more: bool,
}

impl<T> ListingPage<T> {
    /// Assemble a page; `has_more` is derived from the window and the total
    pub fn new(items: Vec<T>, page: u32, size: u32, total: u64) -> Self {
        let has_more = (page as u64).saturating_mul(size as u64) < total;
        Self {
            items,
            page,
            size,
            total,
            has_more,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_contract() {
        assert_eq!(
            error_to_status_code(&CoordinatorError::InsufficientFunds("x".into())),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            error_to_status_code(&CoordinatorError::NodeBusy("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_to_status_code(&CoordinatorError::RateLimited("x".into())),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            error_to_status_code(&CoordinatorError::Unauthenticated),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn internal_errors_are_masked() {
        let (status, Json(body)) =
            error_response(CoordinatorError::Database("secret detail".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.ok);
        let message = body.error.unwrap();
        assert!(!message.contains("secret detail"));
        assert!(message.starts_with("Internal error"));
    }

    #[test]
    fn listing_page_knows_when_more_follows() {
        let page: ListingPage<u32> = ListingPage::new(vec![1, 2, 3], 1, 20, 45);
        assert!(page.has_more);
        let page: ListingPage<u32> = ListingPage::new(vec![1, 2, 3], 3, 20, 45);
        assert!(!page.has_more);
        let empty: ListingPage<u32> = ListingPage::new(vec![], 1, 20, 0);
        assert!(!empty.has_more);
    }

    #[test]
    fn listing_query_clamps_excess() {
        let query = ListingQuery { page: 0, size: 10_000 };
        assert_eq!(query.clamped(), (1, MAX_PAGE_SIZE));
        let query = ListingQuery { page: 2, size: 25 };
        assert_eq!(query.clamped(), (2, 25));
    }
}
