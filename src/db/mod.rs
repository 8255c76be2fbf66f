//! Database module for the coordinator
//!
//! This module handles persistent storage for:
//! - Users and bearer tokens
//! - Registered nodes
//! - Sessions and their lifecycle state
//! - Invoices
//! - Ledger transactions

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

mod models;
mod queries;

pub use models::*;
pub use queries::*;

/// Username of the system account that collects commissions.
pub const HOUSE_ACCOUNT: &str = "__house__";

/// Database connection pool
#[derive(Clone)]
pub struct Database {
    /// SQLite connection (wrapped in Arc<Mutex> for thread safety)
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Connect to the database
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to database at {}", database_url);

        // Parse the database URL
        let path = if database_url.starts_with("sqlite:") {
            database_url.strip_prefix("sqlite:").unwrap_or(database_url)
        } else {
            database_url
        };

        // Ensure the directory exists for file-based databases
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Open the connection
        let conn = Connection::open(path)?;

        // Run migrations
        Self::run_migrations(&conn)?;

        info!("Database connected successfully");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run database migrations
    fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
        debug!("Running database migrations...");

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                is_admin BOOLEAN NOT NULL DEFAULT 0,
                balance_sats INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS auth_tokens (
                token TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                expires_at DATETIME NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner_user_id INTEGER NOT NULL,
                price_per_minute_sats INTEGER NOT NULL,
                endpoint TEXT NOT NULL,
                hardware TEXT NOT NULL,
                models TEXT NOT NULL,
                hw_fingerprint TEXT NOT NULL,
                payment_address TEXT,
                registered_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                total_sessions INTEGER NOT NULL DEFAULT 0,
                completed_sessions INTEGER NOT NULL DEFAULT 0,
                failed_sessions INTEGER NOT NULL DEFAULT 0,
                total_earned_sats INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (owner_user_id) REFERENCES users(id)
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                node_id TEXT NOT NULL,
                model TEXT NOT NULL,
                hf_repo TEXT,
                context_length INTEGER NOT NULL,
                minutes_purchased INTEGER NOT NULL,
                amount_sats INTEGER NOT NULL,
                state TEXT NOT NULL,
                payment_method TEXT NOT NULL,
                payment_reference TEXT,
                refund_sats INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                paid_at DATETIME,
                started_at DATETIME,
                expires_at DATETIME,
                ended_at DATETIME,
                FOREIGN KEY (user_id) REFERENCES users(id),
                FOREIGN KEY (node_id) REFERENCES nodes(id)
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS invoices (
                payment_hash TEXT PRIMARY KEY,
                bolt11 TEXT NOT NULL,
                amount_sats INTEGER NOT NULL,
                purpose TEXT NOT NULL,
                related_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                expires_at DATETIME NOT NULL,
                paid_at DATETIME
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                type TEXT NOT NULL,
                amount_sats INTEGER NOT NULL,
                fee_sats INTEGER NOT NULL DEFAULT 0,
                description TEXT NOT NULL,
                related_session_id TEXT,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (user_id) REFERENCES users(id)
            )
            "#,
            [],
        )?;

        // Create indexes
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_owner_fingerprint ON nodes(owner_user_id, hw_fingerprint)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_state ON sessions(state)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_node_id ON sessions(node_id)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_invoices_status ON invoices(status)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ledger_user_id ON ledger_transactions(user_id)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tokens_user_id ON auth_tokens(user_id)",
            [],
        )?;

        // Seed the house account that collects commissions. The password hash
        // is no valid digest, so the account cannot be logged into.
        conn.execute(
            "INSERT OR IGNORE INTO users (username, password_hash, is_admin) VALUES (?1, '!', 0)",
            [HOUSE_ACCOUNT],
        )?;

        debug!("Database migrations completed");
        Ok(())
    }

    /// Get the database connection
    pub fn conn(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Close the database connection
    pub async fn close(&self) {
        info!("Closing database connection...");
        // The connection will be closed when the Arc is dropped
        info!("Database connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_connect() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let conn_lock = db.conn();
        let conn = conn_lock.lock().await;
        let count: i64 = conn.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_house_account_seeded() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let conn_lock = db.conn();
        let conn = conn_lock.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM users WHERE username = ?1",
                [HOUSE_ACCOUNT],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
