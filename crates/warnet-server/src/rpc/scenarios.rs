//! `scenarios_*` methods.

use crate::error::{ApiError, ApiResult};
use crate::state::ServerState;
use base64::Engine;
use std::sync::Arc;
use tracing::instrument;
use warnet_core::domain::ScenarioRun;
use warnet_core::service::ScenarioInfo;

pub struct ScenarioRpc {
    state: Arc<ServerState>,
}

impl ScenarioRpc {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// scenarios_available - bundled scenarios and their descriptions
    #[instrument(skip(self))]
    pub async fn available(&self) -> ApiResult<Vec<ScenarioInfo>> {
        Ok(self.state.scenarios().available().await?)
    }

    /// scenarios_run - start a bundled scenario against the loaded network
    #[instrument(skip(self))]
    pub async fn run(&self, name: &str, args: &[String]) -> ApiResult<ScenarioRun> {
        let snapshot = self.state.warnet().await?.snapshot().await;
        Ok(self.state.scenarios().run(name, args, snapshot).await?)
    }

    /// scenarios_run_file - start an uploaded, base64 encoded script
    #[instrument(skip(self, encoded))]
    pub async fn run_file(&self, encoded: &str, name: &str, args: &[String]) -> ApiResult<ScenarioRun> {
        let script = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ApiError::invalid_params(format!("scenario is not valid base64: {e}")))?;
        let snapshot = self.state.warnet().await?.snapshot().await;
        Ok(self.state.scenarios().run_file(script, name, args, snapshot).await?)
    }

    /// scenarios_stop - stop a run by job id
    #[instrument(skip(self))]
    pub async fn stop(&self, job_id: &str) -> ApiResult<String> {
        self.state.scenarios().stop(job_id).await?;
        Ok(format!("Stopped scenario with PID {job_id}"))
    }

    /// scenarios_list_running - tracked runs and their status
    #[instrument(skip(self))]
    pub async fn list_running(&self) -> ApiResult<Vec<ScenarioRun>> {
        Ok(self.state.scenarios().list().await?)
    }
}
