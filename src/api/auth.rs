//! Account endpoints: register, login, profile
//!
//! Authentication is an opaque bearer token with 24 hour validity, resolved
//! against the `auth_tokens` table on every request. Passwords are stored as
//! salted SHA-256 digests in `salt$hex` form.

use super::{check_rate, client_key, error_response, ApiResponse, ApiState};
use crate::db::UserQueries;
use crate::CoordinatorError;
use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use tracing::info;

/// Token validity window
const TOKEN_VALIDITY_HOURS: i64 = 24;

/// Hash a password with a fresh random salt
pub fn hash_password(password: &str) -> String {
    let salt = uuid::Uuid::new_v4().simple().to_string();
    let digest = salted_digest(&salt, password);
    format!("{salt}${digest}")
}

/// Verify a password against a stored `salt$hex` digest
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    salted_digest(salt, password) == digest
}

fn salted_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Registration request
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    /// Desired username
    pub username: String,
    /// Password
    pub password: String,
}

/// Registration response
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    /// Assigned user id
    pub user_id: i64,
}

/// Register a new user
pub async fn register(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_rate(&state.limits.register, &client_key(None, &addr)) {
        return error_response(e).into_response();
    }

    let username = req.username.trim();
    if username.len() < 3 || username.len() > 64 {
        return error_response(CoordinatorError::Validation(
            "Username must be 3-64 characters".to_string(),
        ))
        .into_response();
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return error_response(CoordinatorError::Validation(
            "Username may only contain letters, digits, - and _".to_string(),
        ))
        .into_response();
    }
    if req.password.len() < 8 {
        return error_response(CoordinatorError::Validation(
            "Password must be at least 8 characters".to_string(),
        ))
        .into_response();
    }

    let users = UserQueries::new(&state.app.db);
    match users.get_by_username(username).await {
        Ok(Some(_)) => {
            return error_response(CoordinatorError::Validation(
                "Username already taken".to_string(),
            ))
            .into_response();
        }
        Ok(None) => {}
        Err(e) => return error_response(CoordinatorError::Database(e.to_string())).into_response(),
    }

    match users.create(username, &hash_password(&req.password)).await {
        Ok(user) => {
            info!("API: registered user {} ({})", user.username, user.id);
            Json(ApiResponse::ok(RegisterResponse { user_id: user.id })).into_response()
        }
        Err(e) => error_response(CoordinatorError::Database(e.to_string())).into_response(),
    }
}

/// Login request
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

/// Login response
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    /// Bearer token for subsequent requests
    pub access_token: String,
    /// Token expiry (ISO 8601)
    pub expires_at: String,
}

/// Log in and obtain a bearer token
pub async fn login(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_rate(&state.limits.login, &client_key(None, &addr)) {
        return error_response(e).into_response();
    }

    let users = UserQueries::new(&state.app.db);
    let user = match users.get_by_username(req.username.trim()).await {
        Ok(Some(user)) if verify_password(&req.password, &user.password_hash) => user,
        Ok(_) => return error_response(CoordinatorError::Unauthenticated).into_response(),
        Err(e) => return error_response(CoordinatorError::Database(e.to_string())).into_response(),
    };

    let token = uuid::Uuid::new_v4().simple().to_string();
    let expires_at = Utc::now() + chrono::Duration::hours(TOKEN_VALIDITY_HOURS);
    if let Err(e) = users.insert_token(&token, user.id, expires_at).await {
        return error_response(CoordinatorError::Database(e.to_string())).into_response();
    }

    info!("API: user {} logged in", user.username);
    Json(ApiResponse::ok(LoginResponse {
        access_token: token,
        expires_at: expires_at.to_rfc3339(),
    }))
    .into_response()
}

/// Profile response
#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    /// User id
    pub user_id: i64,
    /// Username
    pub username: String,
    /// Wallet balance in satoshis
    pub balance_sats: i64,
    /// Whether the user is an administrator
    pub is_admin: bool,
    /// Account creation time (ISO 8601)
    pub created_at: String,
}

/// Current user's profile and balance
pub async fn me(State(state): State<ApiState>, headers: HeaderMap) -> impl IntoResponse {
    let user = match super::authenticate(&state, &headers).await {
        Ok(user) => user,
        Err(e) => return error_response(e).into_response(),
    };

    Json(ApiResponse::ok(ProfileResponse {
        user_id: user.id,
        username: user.username,
        balance_sats: user.balance_sats,
        is_admin: user.is_admin,
        created_at: user.created_at.to_rfc3339(),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_roundtrip() {
        let stored = hash_password("hunter22");
        assert!(verify_password("hunter22", &stored));
        assert!(!verify_password("hunter23", &stored));
        // Salted: two hashes of the same password differ
        assert_ne!(stored, hash_password("hunter22"));
    }

    #[test]
    fn malformed_stored_hash_never_verifies() {
        assert!(!verify_password("anything", "no-separator"));
        assert!(!verify_password("anything", ""));
        // The house account's sentinel hash must not be loginable
        assert!(!verify_password("anything", "!"));
    }
}
