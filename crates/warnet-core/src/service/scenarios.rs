//! Scenario runner: launches scenario scripts as jobs and tracks them.
//!
//! The runner keeps its own set of launched runs and reconciles it with the
//! executor on every listing. A run leaves the set once a listing has shown
//! it in a terminal state, or once it was stopped.

use crate::domain::scenario::{CommanderJob, ScenarioRun, ScenarioStatus, TankSnapshot};
use crate::error::{BackendError, WarnetError, WarnetResult};
use crate::ports::outbound::{JobStatus, ScenarioExecutor};
use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

const SCENARIO_EXTENSION: &str = "py";

/// A bundled scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioInfo {
    pub name: String,
    pub description: String,
}

pub struct ScenarioRunner {
    executor: Arc<dyn ScenarioExecutor>,
    scenarios_dir: PathBuf,
    network: String,
    running: DashMap<String, ScenarioRun>,
}

/// First line of the module docstring, if the script opens with one
fn docstring_summary(source: &str) -> String {
    let body = source.trim_start();
    let body = body
        .strip_prefix("#!")
        .map(|rest| rest.split_once('\n').map_or("", |(_, tail)| tail).trim_start())
        .unwrap_or(body);
    for quote in ["\"\"\"", "'''"] {
        if let Some(rest) = body.strip_prefix(quote) {
            return rest
                .lines()
                .map(|l| l.trim().trim_end_matches(quote).trim())
                .find(|l| !l.is_empty())
                .unwrap_or_default()
                .to_string();
        }
    }
    String::new()
}

impl ScenarioRunner {
    pub fn new(executor: Arc<dyn ScenarioExecutor>, scenarios_dir: impl Into<PathBuf>, network: impl Into<String>) -> Self {
        Self {
            executor,
            scenarios_dir: scenarios_dir.into(),
            network: network.into(),
            running: DashMap::new(),
        }
    }

    fn script_path(&self, name: &str) -> PathBuf {
        self.scenarios_dir.join(format!("{name}.{SCENARIO_EXTENSION}"))
    }

    /// Bundled scenarios, sorted by name
    pub async fn available(&self) -> WarnetResult<Vec<ScenarioInfo>> {
        let dir = &self.scenarios_dir;
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| WarnetError::io(dir, e))?;
        let mut scenarios = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| WarnetError::io(dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SCENARIO_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with('_') {
                continue;
            }
            let source = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| WarnetError::io(&path, e))?;
            scenarios.push(ScenarioInfo {
                name: name.to_string(),
                description: docstring_summary(&source),
            });
        }
        scenarios.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(scenarios)
    }

    /// Run a bundled scenario by name.
    pub async fn run(&self, name: &str, args: &[String], snapshot: Vec<TankSnapshot>) -> WarnetResult<ScenarioRun> {
        let path = self.script_path(name);
        let script = match tokio::fs::read(&path).await {
            Ok(script) => script,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WarnetError::ScenarioNotFound(name.to_string()))
            }
            Err(e) => return Err(WarnetError::io(&path, e)),
        };
        self.run_file(script, name, args, snapshot).await
    }

    /// Run an uploaded script under `name`.
    #[instrument(skip(self, script, snapshot), fields(network = %self.network, tanks = snapshot.len()))]
    pub async fn run_file(
        &self,
        script: Vec<u8>,
        name: &str,
        args: &[String],
        snapshot: Vec<TankSnapshot>,
    ) -> WarnetResult<ScenarioRun> {
        let job = CommanderJob {
            name: name.to_string(),
            network: self.network.clone(),
            script,
            snapshot,
            args: args.to_vec(),
        };
        let job_id = self.executor.launch(&job).await?;
        let mut cmd = vec![format!("{name}.{SCENARIO_EXTENSION}")];
        cmd.extend(job.script_args());
        let run = ScenarioRun {
            name: job.name,
            job_id: job_id.clone(),
            status: ScenarioStatus::Running,
            network: job.network,
            cmd: cmd.join(" "),
            return_code: None,
        };
        self.running.insert(job_id.clone(), run.clone());
        info!(%job_id, scenario = name, "scenario launched");
        Ok(run)
    }

    fn apply(run: &mut ScenarioRun, job: &JobStatus) {
        run.status = job.status;
        run.return_code = job.return_code;
    }

    /// Every tracked run with its current status, plus jobs the executor
    /// reports that this runner did not launch.
    pub async fn list(&self) -> WarnetResult<Vec<ScenarioRun>> {
        let jobs = self.executor.list().await?;
        let mut listed = Vec::new();

        for job in &jobs {
            match self.running.get_mut(&job.job_id) {
                Some(mut run) => Self::apply(&mut run, job),
                None => listed.push(ScenarioRun {
                    name: job.name.clone(),
                    job_id: job.job_id.clone(),
                    status: job.status,
                    network: self.network.clone(),
                    cmd: job.name.clone(),
                    return_code: job.return_code,
                }),
            }
        }

        // runs the executor no longer reports keep their last known status
        listed.extend(self.running.iter().map(|entry| entry.value().clone()));
        self.running.retain(|job_id, run| {
            let keep = !run.status.is_terminal();
            if !keep {
                debug!(%job_id, status = %run.status, "scenario finished");
            }
            keep
        });
        listed.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(listed)
    }

    /// Stop a run. It leaves the running set once the executor accepts the
    /// stop; a refused stop keeps it listed.
    #[instrument(skip(self))]
    pub async fn stop(&self, job_id: &str) -> WarnetResult<()> {
        let tracked = self.running.contains_key(job_id);
        if !tracked && self.executor.status(job_id).await?.is_none() {
            return Err(WarnetError::ScenarioNotRunning(job_id.to_string()));
        }
        match self.executor.stop(job_id).await {
            Ok(()) => {}
            // already gone on the executor side
            Err(BackendError::NotFound { .. }) if tracked => {
                debug!(job_id, "job vanished before stop");
            }
            Err(e) => return Err(e.into()),
        }
        self.running.remove(job_id);
        info!(job_id, "scenario stopped");
        Ok(())
    }

    pub fn scenarios_dir(&self) -> &Path {
        &self.scenarios_dir
    }
}
