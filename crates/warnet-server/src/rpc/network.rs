//! `network_*` methods: lifecycle of the loaded network.

use crate::error::{ApiError, ApiResult};
use crate::state::ServerState;
use base64::Engine;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use warnet_core::domain::TankStatus;
use warnet_core::service::warnet::GRAPH_FILE;
use warnet_core::service::{NetworkInfo, ScheduleReport};
use warnet_core::Warnet;

/// Directory under the network dir that `network_export` writes to
const EXPORT_DIR: &str = "simln";

pub struct NetworkRpc {
    state: Arc<ServerState>,
}

/// Wait for every tank, then impair links and dial P2P edges.
async fn wire_network(warnet: Arc<Warnet>) {
    if let Err(e) = warnet.wait_for_healthy().await {
        warn!(network = %warnet.name(), error = %e, "network never became healthy, skipping wiring");
        return;
    }
    match warnet.apply_network_conditions().await {
        Ok(applied) if applied > 0 => info!(applied, "network conditions applied"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "network conditions not fully applied"),
    }
    match warnet.connect_edges().await {
        Ok(()) => info!(network = %warnet.name(), "network wired"),
        Err(e) => warn!(error = %e, "some p2p edges failed to connect"),
    }
}

impl NetworkRpc {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    fn spawn_wiring(&self, warnet: Arc<Warnet>) {
        tokio::spawn(wire_network(warnet));
    }

    /// network_up - redeploy the persisted network
    #[instrument(skip(self))]
    pub async fn up(&self) -> ApiResult<String> {
        let warnet = self.state.warnet().await?;
        warnet.deploy().await?;
        self.spawn_wiring(Arc::clone(&warnet));
        Ok(format!("Starting warnet network named '{}'", warnet.name()))
    }

    /// network_from_file - load a base64 topology, persist it and deploy it.
    /// A network already loaded or persisted is torn down first.
    #[instrument(skip(self, encoded))]
    pub async fn from_file(&self, encoded: &str, force: bool) -> ApiResult<NetworkInfo> {
        let graph = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ApiError::invalid_params(format!("graph is not valid base64: {e}")))?;

        let config = self.state.config();
        let existing = config.network.network_dir().join(GRAPH_FILE);
        let persisted = tokio::fs::try_exists(&existing).await.unwrap_or(false);
        if !force && persisted {
            return Err(ApiError::invalid_request(format!(
                "network '{}' already exists, pass force to overwrite it",
                config.network.name
            )));
        }

        let warnet = Warnet::from_graph_file(&graph, config.clone(), Arc::clone(self.state.backend()))?;
        let previous = match self.state.loaded().await {
            Some(previous) => Some(previous),
            None if persisted => self.state.warnet().await.ok(),
            None => None,
        };
        if let Some(previous) = previous {
            if let Err(e) = previous.teardown().await {
                warn!(network = %previous.name(), error = %e, "previous network not fully torn down");
            }
        }
        warnet.deploy().await?;
        let warnet = self.state.set_warnet(warnet).await;
        self.spawn_wiring(Arc::clone(&warnet));
        Ok(warnet.info())
    }

    /// network_down - tear down every resource of the network
    #[instrument(skip(self))]
    pub async fn down(&self) -> ApiResult<String> {
        let warnet = self.state.warnet().await?;
        let result = warnet.teardown().await;
        self.state.clear_warnet().await;
        result?;
        Ok(format!("Stopping warnet network named '{}'", warnet.name()))
    }

    /// network_info - shape of the loaded topology
    #[instrument(skip(self))]
    pub async fn info(&self) -> ApiResult<NetworkInfo> {
        Ok(self.state.warnet().await?.info())
    }

    /// network_status - live status of every tank
    #[instrument(skip(self))]
    pub async fn status(&self) -> ApiResult<Vec<TankStatus>> {
        Ok(self.state.warnet().await?.status().await?)
    }

    /// network_connected - whether every tank holds its manual peers
    #[instrument(skip(self))]
    pub async fn connected(&self) -> ApiResult<bool> {
        Ok(self.state.warnet().await?.network_connected().await)
    }

    /// network_export - LN credentials and sim.json, bundled as a tarball
    #[instrument(skip(self))]
    pub async fn export(&self, dir: Option<PathBuf>) -> ApiResult<String> {
        let warnet = self.state.warnet().await?;
        let dir = dir.unwrap_or_else(|| warnet.config().network.network_dir().join(EXPORT_DIR));
        let bundle = warnet.export(&dir).await?;
        Ok(bundle.display().to_string())
    }

    /// network_ln_init - open every declared channel at its declared position
    #[instrument(skip(self))]
    pub async fn ln_init(&self) -> ApiResult<ScheduleReport> {
        Ok(self.state.warnet().await?.ln_init().await?)
    }
}
