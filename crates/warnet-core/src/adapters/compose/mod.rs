//! Docker Compose adapter, driven through the `docker` CLI.

pub mod backend;
pub mod compose_file;

pub use backend::{container_status, ComposeBackend};
pub use compose_file::ComposeFile;

use crate::error::{BackendResult, CommandError};
use crate::ports::outbound::{CommandOutput, CommandRunner};
use serde_json::Value;
use std::sync::Arc;

/// Thin wrapper over `docker`
#[derive(Clone)]
pub struct Docker {
    runner: Arc<dyn CommandRunner>,
    binary: String,
}

impl Docker {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }

    pub async fn run(&self, args: &[&str]) -> BackendResult<CommandOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner.run(&self.binary, &args, None).await
    }

    /// `inspect <name>`, None when no such container exists
    pub async fn inspect(&self, name: &str) -> BackendResult<Option<Value>> {
        let out = self.run(&["inspect", name]).await?;
        if !out.success() {
            if out.combined().contains("No such") {
                return Ok(None);
            }
            return Err(CommandError {
                exit_code: out.exit_code,
                output: out.combined(),
            }
            .into());
        }
        let parsed: Value = serde_json::from_str(&out.stdout)
            .map_err(|e| crate::error::BackendError::parse(format!("inspect {name}"), e))?;
        Ok(parsed.as_array().and_then(|a| a.first()).cloned())
    }

    /// `exec <name> /bin/sh -c <cmd>`, stdout on success
    pub async fn exec(&self, name: &str, cmd: &str) -> BackendResult<String> {
        Ok(self.run(&["exec", name, "/bin/sh", "-c", cmd]).await?.into_stdout()?)
    }

    /// Container logs; docker replays container stderr on its own stderr
    pub async fn logs(&self, name: &str) -> BackendResult<String> {
        let out = self.run(&["logs", "--timestamps", name]).await?;
        if out.success() {
            Ok(out.combined())
        } else {
            Err(CommandError {
                exit_code: out.exit_code,
                output: out.combined(),
            }
            .into())
        }
    }
}
