//! Ports Layer
//!
//! Driven ports only: the engine is driven directly through its services.

pub mod outbound;

pub use outbound::{
    Backend, ChainClient, CommandOutput, CommandRunner, ConnectOutcome, JobStatus, LightningNode,
    LogMatch, LogScope, OpenChannelRequest, ScenarioExecutor,
};
