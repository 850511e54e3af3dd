//! Service keys and the derived liveness state of a backing resource.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which container of a tank an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Bitcoin,
    Lightning,
}

impl ServiceType {
    /// Container name inside the tank's pod or compose service
    pub fn container_name(self) -> &'static str {
        match self {
            ServiceType::Bitcoin => "bitcoin",
            ServiceType::Lightning => "ln",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.container_name())
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bitcoin" | "bitcoind" | "0" => Ok(ServiceType::Bitcoin),
            "lightning" | "ln" | "1" => Ok(ServiceType::Lightning),
            other => Err(format!("unknown service type: {other}")),
        }
    }
}

/// Liveness of a tank's backing resource, always re-derived from the backend.
///
/// ```text
/// absent ──────────────────────────→ STOPPED
/// present, not every container ready → PENDING
/// present, every container ready ────→ RUNNING
/// terminated with non-zero exit ─────→ FAILED
/// unrecognized orchestrator phase ───→ UNKNOWN
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningStatus {
    Stopped,
    Pending,
    Running,
    Failed,
    Unknown,
}

impl RunningStatus {
    pub fn is_running(self) -> bool {
        matches!(self, RunningStatus::Running)
    }
}

impl fmt::Display for RunningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunningStatus::Stopped => "stopped",
            RunningStatus::Pending => "pending",
            RunningStatus::Running => "running",
            RunningStatus::Failed => "failed",
            RunningStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One row of the network status table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TankStatus {
    pub tank_index: usize,
    pub bitcoin_status: RunningStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lightning_status: Option<RunningStatus>,
}
