//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserModel {
    /// User ID
    pub id: i64,
    /// Username
    pub username: String,
    /// Password digest (salt:hex)
    pub password_hash: String,
    /// Whether the user is an administrator
    pub is_admin: bool,
    /// Wallet balance in satoshis
    pub balance_sats: i64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Hardware descriptor reported by a node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareDescriptor {
    /// CPU model string
    pub cpu: String,
    /// System RAM in megabytes
    pub ram_mb: u64,
    /// Installed GPUs
    #[serde(default)]
    pub gpus: Vec<GpuDescriptor>,
    /// Free disk space in gigabytes
    pub disk_free_gb: u64,
}

/// Single GPU descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDescriptor {
    /// GPU model string
    pub model: String,
    /// VRAM in megabytes
    pub vram_mb: u64,
}

/// A model a node offers for sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model identifier used in session requests
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Model architecture (llama, mistral, ...)
    pub architecture: String,
    /// Parameter count in billions
    pub parameters_b: f64,
    /// Quantization (Q4_K_M, Q8_0, ...)
    pub quantization: String,
    /// Maximum context length the node serves for this model
    pub context_length: u32,
    /// Minimum VRAM required to load (megabytes)
    pub min_vram_mb: u64,
}

/// Node database model (durable registration; liveness is in-memory)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeModel {
    /// Node ID
    pub id: String,
    /// Human readable node name
    pub name: String,
    /// Owner user ID
    pub owner_user_id: i64,
    /// Price per session minute in satoshis
    pub price_per_minute_sats: i64,
    /// Base URL of the node agent
    pub endpoint: String,
    /// Hardware descriptor
    pub hardware: HardwareDescriptor,
    /// Offered models, sorted by id
    pub models: Vec<ModelDescriptor>,
    /// Hardware fingerprint used for duplicate detection
    pub hw_fingerprint: String,
    /// Lightning address for direct payouts, if any
    pub payment_address: Option<String>,
    /// Registration time
    pub registered_at: DateTime<Utc>,
    /// Lifetime session count
    pub total_sessions: i64,
    /// Sessions that ran to settlement
    pub completed_sessions: i64,
    /// Sessions that ended in a refund
    pub failed_sessions: i64,
    /// Lifetime earnings in satoshis
    pub total_earned_sats: i64,
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, waiting for the invoice or wallet debit
    PendingPayment,
    /// Paid, node is loading the model
    Starting,
    /// Model ready, chat is open
    Active,
    /// Closing down, node owner payout in progress
    Settling,
    /// Closing down, user refund in progress
    Refunding,
    /// Terminal
    Ended,
}

impl SessionState {
    /// Stable string used in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::PendingPayment => "pending_payment",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Settling => "settling",
            SessionState::Refunding => "refunding",
            SessionState::Ended => "ended",
        }
    }

    /// Parse the database representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_payment" => Some(SessionState::PendingPayment),
            "starting" => Some(SessionState::Starting),
            "active" => Some(SessionState::Active),
            "settling" => Some(SessionState::Settling),
            "refunding" => Some(SessionState::Refunding),
            "ended" => Some(SessionState::Ended),
            _ => None,
        }
    }

    /// True once a session can never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended)
    }
}

/// How a session is paid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// External Lightning invoice
    Lightning,
    /// Internal wallet balance
    Wallet,
}

impl PaymentMethod {
    /// Stable string used in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Lightning => "lightning",
            PaymentMethod::Wallet => "wallet",
        }
    }

    /// Parse the database representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lightning" => Some(PaymentMethod::Lightning),
            "wallet" => Some(PaymentMethod::Wallet),
            _ => None,
        }
    }
}

/// Session database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionModel {
    /// Session ID
    pub id: String,
    /// Buying user
    pub user_id: i64,
    /// Serving node
    pub node_id: String,
    /// Model identifier (preloaded id, or derived alias for hf_repo)
    pub model: String,
    /// HuggingFace repo coordinate for dynamic loading
    pub hf_repo: Option<String>,
    /// Requested context length
    pub context_length: u32,
    /// Purchased minutes
    pub minutes_purchased: u32,
    /// Total price in satoshis
    pub amount_sats: i64,
    /// Lifecycle state
    pub state: SessionState,
    /// Payment method
    pub payment_method: PaymentMethod,
    /// Invoice payment hash, if paid over Lightning
    pub payment_reference: Option<String>,
    /// Satoshis refunded to the user, if any
    pub refund_sats: i64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Payment observation time
    pub paid_at: Option<DateTime<Utc>>,
    /// Activation time
    pub started_at: Option<DateTime<Utc>>,
    /// Hard expiry; immutable once set
    pub expires_at: Option<DateTime<Utc>>,
    /// Termination time
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionModel {
    /// True once the wall clock passed the expiry timestamp
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| now >= e).unwrap_or(false)
    }

    /// True when the node must download the model before loading
    pub fn needs_download(&self) -> bool {
        self.hf_repo.is_some()
    }
}

/// Invoice status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Created, not yet settled
    Pending,
    /// Settlement confirmed by the daemon
    Paid,
    /// Past expiry without settlement
    Expired,
}

impl InvoiceStatus {
    /// Stable string used in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Expired => "expired",
        }
    }

    /// Parse the database representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InvoiceStatus::Pending),
            "paid" => Some(InvoiceStatus::Paid),
            "expired" => Some(InvoiceStatus::Expired),
            _ => None,
        }
    }
}

/// What an invoice pays for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoicePurpose {
    /// Wallet top-up; related_id is the user id
    Deposit,
    /// Session payment; related_id is the session id
    Session,
}

impl InvoicePurpose {
    /// Stable string used in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoicePurpose::Deposit => "deposit",
            InvoicePurpose::Session => "session",
        }
    }

    /// Parse the database representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deposit" => Some(InvoicePurpose::Deposit),
            "session" => Some(InvoicePurpose::Session),
            _ => None,
        }
    }
}

/// Invoice database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceModel {
    /// Payment hash (hex)
    pub payment_hash: String,
    /// BOLT11 payment request
    pub bolt11: String,
    /// Amount in satoshis
    pub amount_sats: i64,
    /// What the invoice pays for
    pub purpose: InvoicePurpose,
    /// Related row id (user or session)
    pub related_id: String,
    /// Status; flipped to paid only after daemon confirmation
    pub status: InvoiceStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry time
    pub expires_at: DateTime<Utc>,
    /// Settlement time
    pub paid_at: Option<DateTime<Utc>>,
}

/// Ledger transaction type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    /// External sats entering a wallet
    Deposit,
    /// Wallet debit paying for a session
    SessionPayment,
    /// Node owner's share of a settled session
    NodeEarning,
    /// House share of a settled session
    Commission,
    /// External sats leaving a wallet
    Withdrawal,
    /// Returned session payment
    Refund,
}

impl LedgerEntryType {
    /// Stable string used in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryType::Deposit => "deposit",
            LedgerEntryType::SessionPayment => "session_payment",
            LedgerEntryType::NodeEarning => "node_earning",
            LedgerEntryType::Commission => "commission",
            LedgerEntryType::Withdrawal => "withdrawal",
            LedgerEntryType::Refund => "refund",
        }
    }

    /// Parse the database representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deposit" => Some(LedgerEntryType::Deposit),
            "session_payment" => Some(LedgerEntryType::SessionPayment),
            "node_earning" => Some(LedgerEntryType::NodeEarning),
            "commission" => Some(LedgerEntryType::Commission),
            "withdrawal" => Some(LedgerEntryType::Withdrawal),
            "refund" => Some(LedgerEntryType::Refund),
            _ => None,
        }
    }
}

/// Ledger transaction database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntryModel {
    /// Transaction ID
    pub id: i64,
    /// Affected user
    pub user_id: i64,
    /// Transaction type
    pub entry_type: LedgerEntryType,
    /// Signed amount in satoshis
    pub amount_sats: i64,
    /// Fee charged on top, if any
    pub fee_sats: i64,
    /// Human readable description
    pub description: String,
    /// Related session, if any
    pub related_session_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_roundtrip() {
        for state in [
            SessionState::PendingPayment,
            SessionState::Starting,
            SessionState::Active,
            SessionState::Settling,
            SessionState::Refunding,
            SessionState::Ended,
        ] {
            assert_eq!(SessionState::parse(state.as_str()), Some(state));
        }
        assert_eq!(SessionState::parse("paused"), None);
        assert!(SessionState::Ended.is_terminal());
        assert!(!SessionState::Active.is_terminal());
    }

    #[test]
    fn ledger_type_roundtrip() {
        for t in [
            LedgerEntryType::Deposit,
            LedgerEntryType::SessionPayment,
            LedgerEntryType::NodeEarning,
            LedgerEntryType::Commission,
            LedgerEntryType::Withdrawal,
            LedgerEntryType::Refund,
        ] {
            assert_eq!(LedgerEntryType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn session_expiry_check() {
        let now = Utc::now();
        let session = SessionModel {
            id: "s1".into(),
            user_id: 1,
            node_id: "n1".into(),
            model: "tiny".into(),
            hf_repo: None,
            context_length: 4096,
            minutes_purchased: 5,
            amount_sats: 500,
            state: SessionState::Active,
            payment_method: PaymentMethod::Lightning,
            payment_reference: None,
            refund_sats: 0,
            created_at: now,
            paid_at: Some(now),
            started_at: Some(now),
            expires_at: Some(now + chrono::Duration::minutes(5)),
            ended_at: None,
        };
        assert!(!session.is_expired(now));
        assert!(session.is_expired(now + chrono::Duration::minutes(5)));
        assert!(!session.needs_download());
    }
}
