//! Adapters implementing the outbound ports.
//!
//! - `process`: host command execution
//! - `kubernetes`, `compose`: orchestrator backends
//! - `lightning`, `bitcoin_cli`: RPC over in-container CLIs
//! - `local_scenarios`: scenario jobs as local processes
//! - `mock`: in-memory implementations for tests and dry runs

pub mod bitcoin_cli;
pub mod compose;
pub mod image;
pub mod kubernetes;
pub mod lightning;
pub mod local_scenarios;
pub mod mock;
pub mod process;

pub use bitcoin_cli::BitcoinCliClient;
pub use compose::ComposeBackend;
pub use kubernetes::{KubernetesBackend, KubernetesScenarioExecutor};
pub use lightning::{lightning_node, ClnNode, LndNode};
pub use local_scenarios::LocalScenarioExecutor;
pub use process::TokioCommandRunner;

use crate::config::{BackendKind, WarnetConfig};
use crate::ports::outbound::{Backend, CommandRunner, ScenarioExecutor};
use std::sync::Arc;

/// Backend selected by `config.backend.kind`
pub fn backend_from_config(config: &WarnetConfig, runner: Arc<dyn CommandRunner>) -> Arc<dyn Backend> {
    match config.backend.kind {
        BackendKind::Kubernetes => Arc::new(KubernetesBackend::new(
            runner,
            config.backend.clone(),
            config.network.name.clone(),
        )),
        BackendKind::Compose => Arc::new(ComposeBackend::new(runner, config.backend.clone(), &config.network)),
    }
}

/// Scenario executor matching the backend: commander pods on a cluster,
/// local processes otherwise
pub fn executor_from_config(config: &WarnetConfig, runner: Arc<dyn CommandRunner>) -> Arc<dyn ScenarioExecutor> {
    match config.backend.kind {
        BackendKind::Kubernetes => Arc::new(KubernetesScenarioExecutor::new(
            runner,
            config.backend.kubectl.clone(),
            config.backend.namespace.clone(),
            config.scenarios.commander_image.clone(),
        )),
        BackendKind::Compose => Arc::new(LocalScenarioExecutor::new(
            config.scenarios.python.clone(),
            config.scenarios.run_dir.clone(),
            config.scenarios.stop_backoff,
        )),
    }
}
