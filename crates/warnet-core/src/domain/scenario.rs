//! Scenario runs and the topology snapshot they execute against.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Label value identifying scenario jobs
pub const COMMANDER_ROLE: &str = "commander";

/// Lifecycle of a scenario job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ScenarioStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScenarioStatus::Succeeded | ScenarioStatus::Failed)
    }

    /// Map an orchestrator pod phase. An unrecognized phase is not terminal.
    pub fn from_phase(phase: &str) -> Self {
        match phase {
            "Running" => ScenarioStatus::Running,
            "Succeeded" => ScenarioStatus::Succeeded,
            "Failed" => ScenarioStatus::Failed,
            _ => ScenarioStatus::Pending,
        }
    }
}

impl fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScenarioStatus::Pending => "pending",
            ScenarioStatus::Running => "running",
            ScenarioStatus::Succeeded => "succeeded",
            ScenarioStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A launched scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioRun {
    pub name: String,
    /// Pod name on a cluster, PID for local runs
    pub job_id: String,
    pub status: ScenarioStatus,
    pub network: String,
    /// Command line the scenario was started with
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
}

/// One entry of the snapshot mounted into a scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TankSnapshot {
    pub tank: String,
    pub chain: String,
    pub rpc_host: String,
    pub rpc_port: u16,
    pub rpc_user: String,
    pub rpc_password: String,
    pub init_peers: Vec<usize>,
}

/// Everything an executor needs to start one scenario
#[derive(Debug, Clone)]
pub struct CommanderJob {
    pub name: String,
    pub network: String,
    pub script: Vec<u8>,
    pub snapshot: Vec<TankSnapshot>,
    pub args: Vec<String>,
}

impl CommanderJob {
    /// Arguments passed to the scenario script
    pub fn script_args(&self) -> Vec<String> {
        let mut args = vec![format!("--network={}", self.network)];
        args.extend(self.args.iter().cloned());
        args
    }
}
