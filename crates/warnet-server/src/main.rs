//! # Warnet Server
//!
//! Loads configuration, picks a backend and serves the control API.
//!
//! ## Environment
//!
//! - `WARNET_CONFIG` - path to a TOML config file
//! - `WARNET_LOG` - tracing filter, default `info`
//! - `WARNET_LOG_JSON` - emit JSON log lines when set
//! - `WARNET_*` - per-field overrides, see `WarnetConfig::apply_env`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warnet_core::adapters::{backend_from_config, executor_from_config, TokioCommandRunner};
use warnet_core::WarnetConfig;
use warnet_server::{ControlService, ServerState};

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_env("WARNET_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if std::env::var_os("WARNET_LOG_JSON").is_some() {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let config_path = std::env::var_os("WARNET_CONFIG").map(PathBuf::from);
    let config = WarnetConfig::load(config_path.as_deref()).context("loading configuration")?;
    info!(
        network = %config.network.name,
        backend = ?config.backend.kind,
        addr = %config.server.addr(),
        "starting warnet server"
    );

    let runner = Arc::new(TokioCommandRunner::new());
    let backend = backend_from_config(&config, runner.clone());
    let executor = executor_from_config(&config, runner);
    let state = Arc::new(ServerState::new(config, backend, executor));

    ControlService::new(state)
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
        })
        .await
        .context("control server failed")?;

    Ok(())
}
