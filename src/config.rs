//! Configuration management for the coordinator
//!
//! Configuration is loaded from TOML files and environment variables.
//!
//! # Example Configuration File
//!
//! ```toml
//! [coordinator]
//! data_dir = "/var/lib/lncompute"
//! network = "mainnet"
//!
//! [lnd]
//! rest_url = "https://127.0.0.1:8080"
//! macaroon_path = "/home/ubuntu/.lnd/data/chain/bitcoin/mainnet/admin.macaroon"
//!
//! [pricing]
//! commission_rate = 0.10
//! node_registration_fee_sats = 1000
//!
//! [api]
//! bind_address = "0.0.0.0:8080"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Coordinator identity configuration
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// LND connection configuration
    #[serde(default)]
    pub lnd: LndConfig,

    /// Pricing and commission configuration
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Session lifecycle configuration
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Node liveness configuration
    #[serde(default)]
    pub nodes: NodeLivenessConfig,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordinator identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Data directory for storing coordinator state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Network to run on (mainnet, testnet, signet, regtest)
    #[serde(default = "default_network")]
    pub network: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            network: default_network(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("lncompute"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

fn default_network() -> String {
    "regtest".to_string()
}

/// LND REST connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LndConfig {
    /// LND REST endpoint URL
    #[serde(default = "default_lnd_rest_url")]
    pub rest_url: String,

    /// Path to the admin macaroon
    pub macaroon_path: Option<PathBuf>,

    /// Path to the TLS certificate (self-signed certs are accepted when unset)
    pub tls_certificate: Option<PathBuf>,

    /// Request timeout in seconds
    #[serde(default = "default_lnd_timeout")]
    pub timeout_seconds: u64,

    /// Fabricate invoices locally and report them settled immediately.
    /// For tests and daemon-less development only.
    #[serde(default)]
    pub test_mode: bool,
}

impl Default for LndConfig {
    fn default() -> Self {
        Self {
            rest_url: default_lnd_rest_url(),
            macaroon_path: None,
            tls_certificate: None,
            timeout_seconds: default_lnd_timeout(),
            test_mode: false,
        }
    }
}

fn default_lnd_rest_url() -> String {
    "https://127.0.0.1:8080".to_string()
}

fn default_lnd_timeout() -> u64 {
    30
}

/// Pricing and commission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Fraction of every session payment retained by the coordinator
    #[serde(default = "default_commission_rate")]
    pub commission_rate: f64,

    /// One-time fee debited when registering a node (satoshis)
    #[serde(default = "default_registration_fee")]
    pub node_registration_fee_sats: u64,

    /// Minimum purchasable session length (minutes)
    #[serde(default = "default_min_minutes")]
    pub min_session_minutes: u32,

    /// Maximum purchasable session length (minutes)
    #[serde(default = "default_max_minutes")]
    pub max_session_minutes: u32,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            commission_rate: default_commission_rate(),
            node_registration_fee_sats: default_registration_fee(),
            min_session_minutes: default_min_minutes(),
            max_session_minutes: default_max_minutes(),
        }
    }
}

fn default_commission_rate() -> f64 {
    0.10
}

fn default_registration_fee() -> u64 {
    1_000
}

fn default_min_minutes() -> u32 {
    1
}

fn default_max_minutes() -> u32 {
    120
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session invoice validity (seconds)
    #[serde(default = "default_invoice_expiry")]
    pub invoice_expiry_secs: u64,

    /// Deadline for a node to report a preloaded model ready (seconds)
    #[serde(default = "default_starting_timeout")]
    pub starting_timeout_secs: u64,

    /// Deadline when the node must first download the model (seconds)
    #[serde(default = "default_hf_starting_timeout")]
    pub hf_starting_timeout_secs: u64,

    /// Abort a generation that produced no token for this long (seconds)
    #[serde(default = "default_token_idle_timeout")]
    pub token_idle_timeout_secs: u64,

    /// Outbound token queue capacity per session before the generation
    /// is cancelled for backpressure
    #[serde(default = "default_token_buffer")]
    pub token_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            invoice_expiry_secs: default_invoice_expiry(),
            starting_timeout_secs: default_starting_timeout(),
            hf_starting_timeout_secs: default_hf_starting_timeout(),
            token_idle_timeout_secs: default_token_idle_timeout(),
            token_buffer_size: default_token_buffer(),
        }
    }
}

fn default_invoice_expiry() -> u64 {
    3_600
}

fn default_starting_timeout() -> u64 {
    600
}

fn default_hf_starting_timeout() -> u64 {
    1_800
}

fn default_token_idle_timeout() -> u64 {
    180
}

fn default_token_buffer() -> usize {
    256
}

/// Node liveness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeLivenessConfig {
    /// A node silent for longer than this is offline (seconds)
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Offline-sweep interval (seconds)
    #[serde(default = "default_heartbeat_poll")]
    pub heartbeat_poll_secs: u64,

    /// Pending-invoice poll interval (seconds)
    #[serde(default = "default_invoice_poll")]
    pub invoice_poll_secs: u64,

    /// Per-request timeout for node agent RPC (seconds)
    #[serde(default = "default_node_rpc_timeout")]
    pub node_rpc_timeout_secs: u64,
}

impl Default for NodeLivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            heartbeat_poll_secs: default_heartbeat_poll(),
            invoice_poll_secs: default_invoice_poll(),
            node_rpc_timeout_secs: default_node_rpc_timeout(),
        }
    }
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_heartbeat_poll() -> u64 {
    5
}

fn default_invoice_poll() -> u64 {
    3
}

fn default_node_rpc_timeout() -> u64 {
    10
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the API server to
    #[serde(default = "default_api_bind")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,

    /// Registration attempts per minute per client
    #[serde(default = "default_register_rate")]
    pub register_rate_per_minute: u32,

    /// Login attempts per minute per client
    #[serde(default = "default_login_rate")]
    pub login_rate_per_minute: u32,

    /// Session creations per minute per client
    #[serde(default = "default_new_session_rate")]
    pub new_session_rate_per_minute: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_bind(),
            enable_cors: true,
            register_rate_per_minute: default_register_rate(),
            login_rate_per_minute: default_login_rate(),
            new_session_rate_per_minute: default_new_session_rate(),
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_register_rate() -> u32 {
    5
}

fn default_login_rate() -> u32 {
    10
}

fn default_new_session_rate() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL or path
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:lncompute.db".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Resolve the database URL, making it relative to data_dir if needed
    pub fn resolve_database_url(&self) -> String {
        let url = &self.database.url;

        // If it's already an absolute path or :memory:, use as-is
        if url.starts_with("sqlite:/") || url == "sqlite::memory:" {
            return url.clone();
        }

        // Extract the path part
        let path = if url.starts_with("sqlite:") {
            url.strip_prefix("sqlite:").unwrap_or(url)
        } else {
            url
        };

        // If it's already absolute, use as-is
        if std::path::Path::new(path).is_absolute() {
            return url.clone();
        }

        // Make it relative to data_dir
        let db_path = self.coordinator.data_dir.join(path);
        format!("sqlite:{}", db_path.display())
    }

    /// Get the API bind address
    pub fn api_bind_address(&self) -> String {
        self.api.bind_address.clone()
    }

    /// Check if running on mainnet
    pub fn is_mainnet(&self) -> bool {
        self.coordinator.network == "mainnet"
    }

    /// Total price for a session (satoshis)
    pub fn session_price(&self, price_per_minute_sats: u64, minutes: u32) -> u64 {
        price_per_minute_sats.saturating_mul(minutes as u64)
    }

    /// Split an amount into (node earning, commission)
    pub fn settlement_split(&self, amount_sats: u64) -> (u64, u64) {
        let commission = (amount_sats as f64 * self.pricing.commission_rate).floor() as u64;
        (amount_sats - commission, commission)
    }

    /// Starting deadline for a session, longer when the node must download first
    pub fn starting_timeout_secs(&self, dynamic_download: bool) -> u64 {
        if dynamic_download {
            self.sessions.hf_starting_timeout_secs
        } else {
            self.sessions.starting_timeout_secs
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.pricing.commission_rate) {
            return Err("Commission rate must be within [0, 1]".to_string());
        }

        if self.pricing.min_session_minutes == 0 {
            return Err("Minimum session length cannot be 0 minutes".to_string());
        }

        if self.pricing.min_session_minutes > self.pricing.max_session_minutes {
            return Err(
                "Minimum session length must not exceed maximum session length".to_string(),
            );
        }

        let valid_networks = ["mainnet", "testnet", "signet", "regtest"];
        if !valid_networks.contains(&self.coordinator.network.as_str()) {
            return Err(format!(
                "Invalid network: {}. Must be one of: {:?}",
                self.coordinator.network, valid_networks
            ));
        }

        if self.api.register_rate_per_minute == 0
            || self.api.login_rate_per_minute == 0
            || self.api.new_session_rate_per_minute == 0
        {
            return Err("Rate limits cannot be 0".to_string());
        }

        if self.nodes.heartbeat_timeout_secs < self.nodes.heartbeat_poll_secs {
            return Err("Heartbeat timeout must not be shorter than the poll interval".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settlement_split() {
        let config = Config::default();
        // 10% commission: 500 sats -> 450 to the node owner, 50 to the house
        assert_eq!(config.settlement_split(500), (450, 50));
        assert_eq!(config.settlement_split(999), (900, 99));
        assert_eq!(config.settlement_split(0), (0, 0));
    }

    #[test]
    fn test_session_price() {
        let config = Config::default();
        assert_eq!(config.session_price(100, 5), 500);
        assert_eq!(config.session_price(u64::MAX, 2), u64::MAX);
    }

    #[test]
    fn test_validate_config() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        // Invalid: commission above 100%
        config.pricing.commission_rate = 1.5;
        assert!(config.validate().is_err());

        // Reset and test invalid session bounds
        config.pricing.commission_rate = 0.10;
        config.pricing.min_session_minutes = 200;
        assert!(config.validate().is_err());

        config.pricing.min_session_minutes = 1;
        config.coordinator.network = "lightning".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_starting_timeout_selection() {
        let config = Config::default();
        assert_eq!(config.starting_timeout_secs(false), 600);
        assert_eq!(config.starting_timeout_secs(true), 1_800);
    }
}
