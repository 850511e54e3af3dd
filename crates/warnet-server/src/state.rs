//! Shared server state: configuration, the backend, the scenario runner and
//! the currently loaded network.

use crate::error::{ApiError, ApiResult};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use warnet_core::service::warnet::GRAPH_FILE;
use warnet_core::{Backend, ScenarioExecutor, ScenarioRunner, Warnet, WarnetConfig, WarnetError};

pub struct ServerState {
    config: WarnetConfig,
    backend: Arc<dyn Backend>,
    scenarios: ScenarioRunner,
    warnet: RwLock<Option<Arc<Warnet>>>,
}

impl ServerState {
    pub fn new(config: WarnetConfig, backend: Arc<dyn Backend>, executor: Arc<dyn ScenarioExecutor>) -> Self {
        let scenarios = ScenarioRunner::new(executor, config.scenarios.dir.clone(), config.network.name.clone());
        Self {
            config,
            backend,
            scenarios,
            warnet: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &WarnetConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn scenarios(&self) -> &ScenarioRunner {
        &self.scenarios
    }

    /// The loaded network, rebuilt from disk on first use.
    pub async fn warnet(&self) -> ApiResult<Arc<Warnet>> {
        if let Some(warnet) = self.warnet.read().await.as_ref() {
            return Ok(Arc::clone(warnet));
        }
        let mut slot = self.warnet.write().await;
        if let Some(warnet) = slot.as_ref() {
            return Ok(Arc::clone(warnet));
        }
        let warnet = match Warnet::from_network(self.config.clone(), Arc::clone(&self.backend)).await {
            Ok(warnet) => Arc::new(warnet),
            Err(WarnetError::Io { path, .. }) if path.ends_with(GRAPH_FILE) => {
                return Err(ApiError::resource_not_found(format!(
                    "network {} (no {GRAPH_FILE})",
                    self.config.network.name
                )))
            }
            Err(e) => return Err(e.into()),
        };
        info!(network = %warnet.name(), tanks = warnet.tanks().len(), "loaded network from disk");
        *slot = Some(Arc::clone(&warnet));
        Ok(warnet)
    }

    /// The network held in memory, without falling back to disk.
    pub async fn loaded(&self) -> Option<Arc<Warnet>> {
        self.warnet.read().await.clone()
    }

    /// Replace the loaded network.
    pub async fn set_warnet(&self, warnet: Warnet) -> Arc<Warnet> {
        let warnet = Arc::new(warnet);
        if self.warnet.write().await.replace(Arc::clone(&warnet)).is_some() {
            warn!(network = %warnet.name(), "replaced loaded network");
        }
        warnet
    }

    /// Forget the loaded network, e.g. after teardown.
    pub async fn clear_warnet(&self) {
        self.warnet.write().await.take();
    }
}
