//! Kubernetes adapters, driven through the `kubectl` CLI.

pub mod backend;
pub mod commander;
pub mod manifests;

pub use backend::KubernetesBackend;
pub use commander::KubernetesScenarioExecutor;

use crate::error::{BackendError, BackendResult, CommandError};
use crate::ports::outbound::{CommandOutput, CommandRunner};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Thin namespaced wrapper over `kubectl`
#[derive(Clone)]
pub struct Kubectl {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    namespace: String,
}

impl Kubectl {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Run `kubectl --namespace <ns> <args>`
    pub async fn run(&self, args: &[&str], stdin: Option<Vec<u8>>) -> BackendResult<CommandOutput> {
        let mut full = vec!["--namespace".to_string(), self.namespace.clone()];
        full.extend(args.iter().map(|a| a.to_string()));
        self.runner.run(&self.binary, &full, stdin).await
    }

    async fn checked(&self, args: &[&str], stdin: Option<Vec<u8>>) -> BackendResult<String> {
        Ok(self.run(args, stdin).await?.into_stdout()?)
    }

    /// `get <kind> <name> -o json`, None when the object does not exist
    pub async fn get(&self, kind: &str, name: &str) -> BackendResult<Option<Value>> {
        let out = self.run(&["get", kind, name, "-o", "json"], None).await?;
        if !out.success() {
            if out.stderr.contains("NotFound") {
                return Ok(None);
            }
            return Err(CommandError {
                exit_code: out.exit_code,
                output: out.combined(),
            }
            .into());
        }
        serde_json::from_str(&out.stdout)
            .map(Some)
            .map_err(|e| BackendError::parse(format!("{kind}/{name}"), e))
    }

    /// `get <kind> -l <selector> -o json`, returning the items
    pub async fn list(&self, kind: &str, selector: &str) -> BackendResult<Vec<Value>> {
        let stdout = self.checked(&["get", kind, "-l", selector, "-o", "json"], None).await?;
        let list: Value = serde_json::from_str(&stdout)
            .map_err(|e| BackendError::parse(format!("{kind} list"), e))?;
        Ok(list["items"].as_array().cloned().unwrap_or_default())
    }

    pub async fn apply(&self, manifest: &Value) -> BackendResult<()> {
        let body = serde_json::to_vec(manifest).map_err(|e| BackendError::parse("manifest", e))?;
        let stdout = self.checked(&["apply", "-f", "-"], Some(body)).await?;
        debug!(output = stdout.trim(), "applied");
        Ok(())
    }

    /// Delete objects, treating absent ones as deleted
    pub async fn delete(&self, kind: &str, names: &[&str], extra: &[&str]) -> BackendResult<()> {
        let mut args = vec!["delete", kind];
        args.extend_from_slice(names);
        args.push("--ignore-not-found");
        args.extend_from_slice(extra);
        self.checked(&args, None).await?;
        Ok(())
    }

    /// Run a shell command inside a container
    pub async fn exec(&self, pod: &str, container: &str, cmd: &str) -> BackendResult<String> {
        self.checked(&["exec", pod, "-c", container, "--", "/bin/sh", "-c", cmd], None)
            .await
    }

    pub async fn logs(&self, pod: &str, container: &str) -> BackendResult<String> {
        self.checked(&["logs", pod, "-c", container, "--timestamps"], None).await
    }
}
