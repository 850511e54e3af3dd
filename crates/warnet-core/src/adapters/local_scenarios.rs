//! Scenario jobs as local interpreter processes.
//!
//! Each run gets its own directory under the run dir holding `scenario.py`,
//! the `warnet.json` snapshot and `output.log`, and the process runs with
//! that directory as its working directory. Job ids are PIDs.

use crate::domain::scenario::{CommanderJob, ScenarioStatus};
use crate::error::{BackendError, BackendResult, TimeoutError};
use crate::polling::{retry_with_backoff, Backoff};
use crate::ports::outbound::{JobStatus, ScenarioExecutor};
use async_trait::async_trait;
use dashmap::DashMap;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::process::{Child, Command};
use tracing::{info, instrument, warn};

/// How long a SIGKILLed process gets to be reaped
const KILL_GRACE: Duration = Duration::from_secs(5);

struct LocalJob {
    name: String,
    child: Mutex<Child>,
    exit: Mutex<Option<i32>>,
}

impl LocalJob {
    /// Exit code once the process is gone
    fn poll_exit(&self) -> Option<i32> {
        let mut exit = self.exit.lock();
        if exit.is_none() {
            if let Ok(Some(status)) = self.child.lock().try_wait() {
                *exit = Some(status.code().unwrap_or(-1));
            }
        }
        *exit
    }

    fn status(&self, job_id: &str) -> JobStatus {
        let return_code = self.poll_exit();
        let status = match return_code {
            None => ScenarioStatus::Running,
            Some(0) => ScenarioStatus::Succeeded,
            Some(_) => ScenarioStatus::Failed,
        };
        JobStatus {
            job_id: job_id.to_string(),
            name: self.name.clone(),
            status,
            return_code,
        }
    }
}

pub struct LocalScenarioExecutor {
    python: String,
    run_dir: PathBuf,
    stop_backoff: Backoff,
    jobs: DashMap<String, LocalJob>,
}

impl LocalScenarioExecutor {
    pub fn new(python: impl Into<String>, run_dir: impl Into<PathBuf>, stop_backoff: Backoff) -> Self {
        Self {
            python: python.into(),
            run_dir: run_dir.into(),
            stop_backoff,
            jobs: DashMap::new(),
        }
    }

    fn restore(&self, job_id: String, name: String, child: Child) {
        self.jobs.insert(
            job_id,
            LocalJob {
                name,
                child: Mutex::new(child),
                exit: Mutex::new(None),
            },
        );
    }

    async fn prepare(&self, job: &CommanderJob) -> BackendResult<PathBuf> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let dir = self.run_dir.join(format!("{}-{millis}", job.name));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BackendError::io(&dir, e))?;

        let snapshot = serde_json::to_vec_pretty(&job.snapshot)
            .map_err(|e| BackendError::parse("scenario snapshot", e))?;
        for (file, contents) in [("warnet.json", snapshot.as_slice()), ("scenario.py", job.script.as_slice())] {
            let path = dir.join(file);
            tokio::fs::write(&path, contents)
                .await
                .map_err(|e| BackendError::io(&path, e))?;
        }
        Ok(dir)
    }
}

#[async_trait]
impl ScenarioExecutor for LocalScenarioExecutor {
    #[instrument(skip(self, job), fields(scenario = %job.name))]
    async fn launch(&self, job: &CommanderJob) -> BackendResult<String> {
        let dir = self.prepare(job).await?;
        let log_path = dir.join("output.log");
        let log = std::fs::File::create(&log_path).map_err(|e| BackendError::io(&log_path, e))?;
        let log_err = log.try_clone().map_err(|e| BackendError::io(&log_path, e))?;

        let child = Command::new(&self.python)
            .arg("scenario.py")
            .args(job.script_args())
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| BackendError::Spawn {
                program: self.python.clone(),
                reason: e.to_string(),
            })?;
        let pid = child.id().ok_or_else(|| BackendError::Spawn {
            program: self.python.clone(),
            reason: "process exited before reporting a pid".to_string(),
        })?;

        let job_id = pid.to_string();
        self.jobs.insert(
            job_id.clone(),
            LocalJob {
                name: job.name.clone(),
                child: Mutex::new(child),
                exit: Mutex::new(None),
            },
        );
        info!(pid, dir = %dir.display(), "scenario started");
        Ok(job_id)
    }

    async fn status(&self, job_id: &str) -> BackendResult<Option<JobStatus>> {
        Ok(self.jobs.get(job_id).map(|job| job.status(job_id)))
    }

    async fn list(&self) -> BackendResult<Vec<JobStatus>> {
        Ok(self
            .jobs
            .iter()
            .map(|entry| entry.value().status(entry.key()))
            .collect())
    }

    /// SIGTERM, wait under backoff, then SIGKILL and reap. A process that
    /// survives the kill grace period goes back into the job table.
    #[instrument(skip(self))]
    async fn stop(&self, job_id: &str) -> BackendResult<()> {
        let pid: i32 = job_id
            .parse()
            .map_err(|e| BackendError::parse(format!("pid {job_id}"), e))?;
        let Some((job_id, job)) = self.jobs.remove(job_id) else {
            return Err(BackendError::NotFound {
                resource: format!("scenario process {job_id}"),
            });
        };
        if let Some(code) = job.poll_exit() {
            info!(pid, code, "scenario already exited");
            return Ok(());
        }

        let terminated = match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                let job = &job;
                retry_with_backoff(&self.stop_backoff, "scenario exit", || async move {
                    match job.poll_exit() {
                        Some(_) => Ok(()),
                        None => Err(format!("process {pid} still running")),
                    }
                })
                .await
                .is_ok()
            }
            Err(Errno::ESRCH) => true,
            Err(e) => {
                warn!(pid, error = %e, "SIGTERM failed");
                false
            }
        };
        if terminated {
            info!(pid, code = ?job.poll_exit(), "scenario stopped");
            return Ok(());
        }

        warn!(pid, "scenario still running, killing");
        let LocalJob { name, child, .. } = job;
        let mut child = child.into_inner();
        if let Err(e) = child.start_kill() {
            self.restore(job_id, name, child);
            return Err(BackendError::io(format!("/proc/{pid}"), e));
        }
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid, code = ?status.code(), "scenario killed");
                Ok(())
            }
            Ok(Err(e)) => {
                self.restore(job_id, name, child);
                Err(BackendError::io(format!("/proc/{pid}"), e))
            }
            Err(_) => {
                self.restore(job_id, name, child);
                Err(TimeoutError::new(format!("process {pid} to exit after SIGKILL"), KILL_GRACE).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::scenario::TankSnapshot;

    fn job(script: &str) -> CommanderJob {
        CommanderJob {
            name: "miner".into(),
            network: "warnet".into(),
            script: script.as_bytes().to_vec(),
            snapshot: vec![TankSnapshot {
                tank: "warnet-tank-000000".into(),
                chain: "regtest".into(),
                rpc_host: "10.0.0.2".into(),
                rpc_port: 18443,
                rpc_user: "warnet_user".into(),
                rpc_password: "2themoon".into(),
                init_peers: vec![],
            }],
            args: vec![],
        }
    }

    fn executor(dir: &std::path::Path) -> LocalScenarioExecutor {
        LocalScenarioExecutor::new(
            "sh",
            dir,
            Backoff {
                max_retries: 3,
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(200),
            },
        )
    }

    #[tokio::test]
    async fn test_completed_process_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let id = executor.launch(&job("test -f warnet.json && exit 3")).await.unwrap();

        let mut status = executor.status(&id).await.unwrap().unwrap();
        for _ in 0..50 {
            if status.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            status = executor.status(&id).await.unwrap().unwrap();
        }
        assert_eq!(status.status, ScenarioStatus::Failed);
        assert_eq!(status.return_code, Some(3));
    }

    #[tokio::test]
    async fn test_stop_terminates_and_forgets() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let id = executor.launch(&job("sleep 30")).await.unwrap();
        executor.stop(&id).await.unwrap();
        assert!(executor.status(&id).await.unwrap().is_none());
        assert!(executor.stop(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_kills_process_ignoring_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let id = executor
            .launch(&job("trap '' TERM; touch trapped; exec sleep 30"))
            .await
            .unwrap();

        let trapped = || {
            std::fs::read_dir(dir.path())
                .unwrap()
                .filter_map(Result::ok)
                .any(|entry| entry.path().join("trapped").exists())
        };
        for _ in 0..100 {
            if trapped() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(trapped(), "script never installed its trap");

        executor.stop(&id).await.unwrap();
        assert!(executor.status(&id).await.unwrap().is_none());
        let pid = Pid::from_raw(id.parse().unwrap());
        assert_eq!(kill(pid, None), Err(Errno::ESRCH));
    }
}
