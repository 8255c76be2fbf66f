use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracing::{error, info};

use lncompute::{Config, CoordinatorApp};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = resolve_config().await?;
    let app = CoordinatorApp::new(config).await?;

    // The signal watcher only flips the switch; teardown happens below once
    // the API server has drained its connections.
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, draining...");
                let _ = stop_tx.send(());
            }
            Err(e) => error!("Cannot listen for shutdown signal: {}", e),
        }
    });

    app.run_with_shutdown(stop_rx).await?;
    app.shutdown().await?;

    info!("Coordinator stopped");
    Ok(())
}

/// Locate, parse and validate the configuration.
///
/// Tried in order: `$LNCOMPUTE_CONFIG`, `./lncompute.toml`,
/// `/etc/lncompute/lncompute.toml`, the user config directory. Without a
/// file the built-in defaults apply.
async fn resolve_config() -> Result<Config> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(overridden) = std::env::var("LNCOMPUTE_CONFIG") {
        candidates.push(PathBuf::from(overridden));
    }
    candidates.push(PathBuf::from("lncompute.toml"));
    candidates.push(PathBuf::from("/etc/lncompute/lncompute.toml"));
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("lncompute/lncompute.toml"));
    }

    let config = match candidates.into_iter().find(|p| p.exists()) {
        Some(path) => {
            info!("Using configuration file {}", path.display());
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => {
            info!("No configuration file found, running with defaults");
            Config::default()
        }
    };

    if let Err(reason) = config.validate() {
        bail!("invalid configuration: {reason}");
    }
    Ok(config)
}
