//! # Warnet Core
//!
//! Deploys a declared network of Bitcoin nodes (optionally paired with
//! Lightning nodes) onto Kubernetes or Docker Compose, opens Lightning
//! channels at pre-declared short channel ids, and runs user scenarios
//! against the live network.
//!
//! ## Module Structure (Hexagonal Architecture)
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      OUTER LAYER                                │
//! │  adapters/kubernetes - kubectl-driven pods, services, jobs      │
//! │  adapters/compose    - compose file + docker CLI                │
//! │  adapters/lightning  - LND / CLN over their CLIs                │
//! │  adapters/mock       - in-memory backend, chain, LN, executor   │
//! └─────────────────────────────────────────────────────────────────┘
//!                          ↑ implements ↑
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      MIDDLE LAYER                               │
//! │  ports/outbound.rs - Backend, LightningNode, ChainClient,       │
//! │                      ScenarioExecutor, CommandRunner            │
//! └─────────────────────────────────────────────────────────────────┘
//!                          ↑ uses ↑
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      INNER LAYER                                │
//! │  domain/graph.rs  - TopologyGraph, channel ids and policies     │
//! │  domain/tank.rs   - TankSpec derived from a graph node          │
//! │  service/         - Warnet, Tank, ChannelOpenScheduler,         │
//! │                     ScenarioRunner                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Channel Placement
//!
//! A channel declared at `(block, index)` confirms as transaction `index`
//! of block `block`. See [`service::scheduler`].

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod polling;
pub mod ports;
pub mod service;

pub use config::WarnetConfig;
pub use domain::{ChannelEdge, ChannelId, ChannelPolicy, TankSpec, TopologyGraph};
pub use error::{BackendError, GraphError, SchedulerError, WarnetError, WarnetResult};
pub use ports::{Backend, LightningNode, ScenarioExecutor};
pub use service::{ChannelOpenScheduler, ScenarioRunner, Tank, Warnet};
