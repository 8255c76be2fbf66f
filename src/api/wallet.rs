//! Wallet endpoints: deposits, session payments, withdrawals, history

use super::{error_response, ApiResponse, ApiState, ListingPage, ListingQuery};
use crate::db::{
    InvoiceModel, InvoicePurpose, InvoiceQueries, InvoiceStatus, LedgerEntryType, LedgerQueries,
};
use crate::CoordinatorError;
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Smallest accepted deposit (satoshis); dust below this is rejected
const MIN_DEPOSIT_SATS: u64 = 10;

/// Deposit request
#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    /// Amount to deposit in satoshis
    pub amount: u64,
}

/// Deposit response
#[derive(Debug, Serialize)]
pub struct DepositResponse {
    /// BOLT11 invoice to pay
    pub invoice: String,
    /// Payment hash for status checks
    pub payment_hash: String,
    /// Amount in satoshis
    pub amount: u64,
    /// Invoice expiry (ISO 8601)
    pub expires_at: String,
}

/// Create a deposit invoice for the authenticated user
pub async fn wallet_deposit(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<DepositRequest>,
) -> impl IntoResponse {
    let user = match super::authenticate(&state, &headers).await {
        Ok(user) => user,
        Err(e) => return error_response(e).into_response(),
    };

    if req.amount < MIN_DEPOSIT_SATS {
        return error_response(CoordinatorError::Validation(format!(
            "Minimum deposit is {MIN_DEPOSIT_SATS} sats"
        )))
        .into_response();
    }

    let created = match state
        .app
        .lightning
        .create_invoice(
            req.amount,
            &format!("Wallet deposit for {}", user.username),
            state.app.config.sessions.invoice_expiry_secs,
        )
        .await
    {
        Ok(created) => created,
        Err(e) => return error_response(e).into_response(),
    };

    let invoice = InvoiceModel {
        payment_hash: created.payment_hash.clone(),
        bolt11: created.bolt11.clone(),
        amount_sats: req.amount as i64,
        purpose: InvoicePurpose::Deposit,
        related_id: user.id.to_string(),
        status: InvoiceStatus::Pending,
        created_at: Utc::now(),
        expires_at: created.expires_at,
        paid_at: None,
    };
    if let Err(e) = InvoiceQueries::new(&state.app.db).insert(&invoice).await {
        return error_response(CoordinatorError::Database(e.to_string())).into_response();
    }

    info!(
        "API: deposit invoice {} created for user {} ({} sats)",
        created.payment_hash, user.id, req.amount
    );
    Json(ApiResponse::ok(DepositResponse {
        invoice: created.bolt11,
        payment_hash: created.payment_hash,
        amount: req.amount,
        expires_at: created.expires_at.to_rfc3339(),
    }))
    .into_response()
}

/// Deposit status response
#[derive(Debug, Serialize)]
pub struct DepositCheckResponse {
    /// `pending`, `paid` or `expired`
    pub status: InvoiceStatus,
    /// Balance after crediting, once paid
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_balance: Option<i64>,
}

/// Check a deposit invoice; drives settlement through the scheduler's
/// guarded path so polling and checking cannot double-credit
pub async fn wallet_deposit_check(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(payment_hash): Path<String>,
) -> impl IntoResponse {
    let user = match super::authenticate(&state, &headers).await {
        Ok(user) => user,
        Err(e) => return error_response(e).into_response(),
    };

    let invoice = match InvoiceQueries::new(&state.app.db)
        .get_by_hash(&payment_hash)
        .await
    {
        Ok(Some(invoice)) => invoice,
        Ok(None) => {
            return error_response(CoordinatorError::NotFound(format!(
                "invoice {payment_hash}"
            )))
            .into_response()
        }
        Err(e) => return error_response(CoordinatorError::Database(e.to_string())).into_response(),
    };

    if invoice.purpose != InvoicePurpose::Deposit
        || invoice.related_id != user.id.to_string()
    {
        return error_response(CoordinatorError::NotFound(format!(
            "invoice {payment_hash}"
        )))
        .into_response();
    }

    let status = match state.app.scheduler.check_invoice(&invoice).await {
        Ok(status) => status,
        Err(e) => return error_response(e).into_response(),
    };

    let new_balance = if status == InvoiceStatus::Paid {
        state.app.ledger.balance(user.id).await.ok()
    } else {
        None
    };

    Json(ApiResponse::ok(DepositCheckResponse {
        status,
        new_balance,
    }))
    .into_response()
}

/// Wallet session payment request
#[derive(Debug, Deserialize)]
pub struct PaySessionRequest {
    /// Session to pay
    pub session_id: String,
}

/// Wallet session payment response
#[derive(Debug, Serialize)]
pub struct PaySessionResponse {
    /// Amount debited in satoshis
    pub amount_paid: u64,
    /// Balance after the debit
    pub new_balance: i64,
}

/// Pay a pending session from the wallet balance
pub async fn wallet_pay_session(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<PaySessionRequest>,
) -> impl IntoResponse {
    let user = match super::authenticate(&state, &headers).await {
        Ok(user) => user,
        Err(e) => return error_response(e).into_response(),
    };

    match state
        .app
        .orchestrator
        .pay_with_wallet(&req.session_id, user.id)
        .await
    {
        Ok((amount_paid, new_balance)) => {
            info!(
                "API: session {} paid from wallet by user {} ({} sats)",
                req.session_id, user.id, amount_paid
            );
            Json(ApiResponse::ok(PaySessionResponse {
                amount_paid,
                new_balance,
            }))
            .into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

/// Withdrawal request
#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    /// BOLT11 invoice to pay out to
    pub bolt11: String,
    /// Invoice amount in satoshis
    pub amount_sats: u64,
    /// Maximum routing fee the user accepts (satoshis)
    #[serde(default)]
    pub max_fee_sats: u64,
}

/// Withdrawal response
#[derive(Debug, Serialize)]
pub struct WithdrawResponse {
    /// Amount paid out in satoshis
    pub amount_sats: u64,
    /// Routing fee actually paid
    pub fee_paid_sats: u64,
    /// Balance after the withdrawal
    pub new_balance: i64,
}

/// Withdraw balance over Lightning.
///
/// The debit covers amount plus the fee ceiling up front; the unused fee
/// headroom is returned after the payment settles, and a failed payment
/// rolls the whole debit back.
pub async fn wallet_withdraw(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<WithdrawRequest>,
) -> impl IntoResponse {
    let user = match super::authenticate(&state, &headers).await {
        Ok(user) => user,
        Err(e) => return error_response(e).into_response(),
    };

    if req.amount_sats == 0 {
        return error_response(CoordinatorError::Validation(
            "Withdrawal amount must be positive".to_string(),
        ))
        .into_response();
    }

    let reserved = req.amount_sats + req.max_fee_sats;
    if let Err(e) = state
        .app
        .ledger
        .debit(
            user.id,
            reserved,
            LedgerEntryType::Withdrawal,
            &format!("Withdrawal of {} sats", req.amount_sats),
            None,
        )
        .await
    {
        return error_response(e).into_response();
    }

    match state
        .app
        .lightning
        .pay_invoice(&req.bolt11, req.max_fee_sats)
        .await
    {
        Ok(outcome) => {
            // Return the fee headroom that was not consumed
            let unused_fee = req.max_fee_sats.saturating_sub(outcome.fee_paid_sats);
            if unused_fee > 0 {
                if let Err(e) = state
                    .app
                    .ledger
                    .credit(
                        user.id,
                        unused_fee,
                        LedgerEntryType::Refund,
                        "Unused withdrawal fee reserve",
                        None,
                    )
                    .await
                {
                    warn!("API: failed to return fee reserve for user {}: {}", user.id, e);
                }
            }
            let new_balance = state.app.ledger.balance(user.id).await.unwrap_or(0);
            info!(
                "API: user {} withdrew {} sats (fee {})",
                user.id, req.amount_sats, outcome.fee_paid_sats
            );
            Json(ApiResponse::ok(WithdrawResponse {
                amount_sats: req.amount_sats,
                fee_paid_sats: outcome.fee_paid_sats,
                new_balance,
            }))
            .into_response()
        }
        Err(e) => {
            // The daemon did not pay; give everything back
            if let Err(refund_err) = state
                .app
                .ledger
                .credit(
                    user.id,
                    reserved,
                    LedgerEntryType::Refund,
                    "Failed withdrawal",
                    None,
                )
                .await
            {
                warn!(
                    "API: failed to roll back withdrawal for user {}: {}",
                    user.id, refund_err
                );
            }
            error_response(e).into_response()
        }
    }
}

/// One transaction in the history listing
#[derive(Debug, Serialize)]
pub struct TransactionEntry {
    /// Transaction id
    pub id: i64,
    /// Transaction type
    #[serde(rename = "type")]
    pub entry_type: LedgerEntryType,
    /// Signed amount in satoshis
    pub amount_sats: i64,
    /// Fee charged on top
    pub fee_sats: i64,
    /// Description
    pub description: String,
    /// Related session, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_session_id: Option<String>,
    /// Creation time (ISO 8601)
    pub created_at: String,
}

/// Paginated transaction history for the authenticated user
pub async fn wallet_transactions(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListingQuery>,
) -> impl IntoResponse {
    let user = match super::authenticate(&state, &headers).await {
        Ok(user) => user,
        Err(e) => return error_response(e).into_response(),
    };

    let (page, size) = query.clamped();

    match LedgerQueries::new(&state.app.db)
        .list_for_user(user.id, page, size)
        .await
    {
        Ok((entries, total)) => {
            let items: Vec<TransactionEntry> = entries
                .into_iter()
                .map(|e| TransactionEntry {
                    id: e.id,
                    entry_type: e.entry_type,
                    amount_sats: e.amount_sats,
                    fee_sats: e.fee_sats,
                    description: e.description,
                    related_session_id: e.related_session_id,
                    created_at: e.created_at.to_rfc3339(),
                })
                .collect();
            Json(ApiResponse::ok(ListingPage::new(items, page, size, total))).into_response()
        }
        Err(e) => error_response(CoordinatorError::Database(e.to_string())).into_response(),
    }
}
