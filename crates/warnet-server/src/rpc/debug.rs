//! Deployment rendering, raw container exec and log search.

use crate::error::ApiResult;
use crate::state::ServerState;
use std::sync::Arc;
use tracing::instrument;
use warnet_core::domain::ServiceType;
use warnet_core::ports::{LogMatch, LogScope};

pub struct DebugRpc {
    state: Arc<ServerState>,
}

impl DebugRpc {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// generate_deployment - manifests or compose file for the loaded network
    #[instrument(skip(self))]
    pub async fn generate_deployment(&self) -> ApiResult<String> {
        Ok(self.state.warnet().await?.generate_deployment()?)
    }

    /// exec_run - shell command in one of a tank's containers
    #[instrument(skip(self, cmd))]
    pub async fn exec_run(&self, index: usize, service: ServiceType, cmd: &str) -> ApiResult<String> {
        let warnet = self.state.warnet().await?;
        Ok(warnet.tank(index)?.exec(service, cmd).await?)
    }

    /// logs_grep - container log lines matching `pattern`
    #[instrument(skip(self))]
    pub async fn logs_grep(&self, pattern: &str, scope: LogScope) -> ApiResult<Vec<LogMatch>> {
        let warnet = self.state.warnet().await?;
        Ok(warnet.logs_grep(pattern, scope).await?)
    }
}
