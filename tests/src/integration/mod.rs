//! Cross-crate integration flows.

pub mod control_api;
pub mod deployment_flows;
pub mod scheduler_flows;
