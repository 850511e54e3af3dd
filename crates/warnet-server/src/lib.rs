//! # Warnet Control Server
//!
//! JSON-RPC 2.0 front end over `warnet-core`.
//!
//! ```text
//! client ──HTTP POST──→ service::route_method ──→ rpc::* ──→ ServerState
//!                                                              ├── Warnet (loaded network)
//!                                                              ├── ScenarioRunner
//!                                                              └── Backend
//! ```
//!
//! ## Namespaces
//!
//! - `tank_*` - bitcoin-cli / lncli passthrough, logs, message capture
//! - `network_*` - deploy, teardown, status, export, channel opening
//! - `scenarios_*` - launch, list and stop scenario jobs
//! - `generate_deployment`, `exec_run`, `logs_grep`

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod error;
pub mod rpc;
pub mod service;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use rpc::RpcHandlers;
pub use service::ControlService;
pub use state::ServerState;
