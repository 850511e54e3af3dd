//! Error types for the Warnet engine.
//!
//! The taxonomy separates import-time topology failures, in-container command
//! failures, poll-loop timeouts, and channel scheduling invariant violations.
//! Bulk operations collect per-item failures into a single error.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A poll loop exceeded its budget.
#[derive(Debug, Clone, Error)]
#[error("timed out after {waited:?} waiting for {predicate}")]
pub struct TimeoutError {
    /// Name of the predicate or operation that never became true
    pub predicate: String,
    /// Time spent before giving up
    pub waited: Duration,
}

impl TimeoutError {
    pub fn new(predicate: impl Into<String>, waited: Duration) -> Self {
        Self {
            predicate: predicate.into(),
            waited,
        }
    }
}

/// An in-container command exited non-zero.
#[derive(Debug, Clone, Error)]
#[error("command exited with code {exit_code}: {output}")]
pub struct CommandError {
    pub exit_code: i32,
    /// Combined stdout/stderr of the failed command
    pub output: String,
}

/// Topology import errors
#[derive(Debug, Error)]
pub enum GraphError {
    /// The document is not valid JSON
    #[error("malformed topology document: {0}")]
    Parse(String),

    /// An attribute name or type is outside the recognized schema
    #[error("schema error: {0}")]
    Schema(String),

    /// The graph violates a structural invariant
    #[error("topology error: {0}")]
    Topology(String),

    /// A node's attributes are contradictory or unsupported
    #[error("invalid configuration for node {index}: {reason}")]
    Config { index: usize, reason: String },
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Orchestrator backend errors
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The requested resource does not exist
    #[error("resource not found: {resource}")]
    NotFound { resource: String },

    /// The orchestrator binary could not be launched
    #[error("failed to run {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// Orchestrator output could not be decoded
    #[error("failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },

    /// Several items of a bulk operation failed
    #[error("{operation} failed for {} resource(s): {}", failures.len(), failures.join("; "))]
    Bulk {
        operation: String,
        failures: Vec<String>,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BackendError {
    pub fn parse(what: impl Into<String>, reason: impl ToString) -> Self {
        Self::Parse {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Channel open scheduling errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A funding transaction did not land at its declared position
    #[error(
        "scheduling invariant violated in block {block}: expected {expected} at index {index}, found {}",
        observed.as_deref().unwrap_or("nothing")
    )]
    SchedulingInvariant {
        block: u64,
        index: u32,
        expected: String,
        observed: Option<String>,
    },

    /// Too many channels for the fee range of one block
    #[error("fee rate {fee_rate} for channel {block}x{index} is below the floor {floor}")]
    FeeFloor {
        block: u64,
        index: u32,
        fee_rate: u64,
        floor: u64,
    },

    /// The chain is already past the block a group must confirm in
    #[error("chain height {height} is past the block before target {target}")]
    Overshoot { target: u64, height: u64 },

    /// Channel indices within a block are not consecutive from 1
    #[error("channel indices in block {block} are not consecutive: expected {expected}, found {found}")]
    IndexGap { block: u64, expected: u32, found: u32 },

    /// A channel endpoint has no Lightning node
    #[error("tank {index} has no lightning node")]
    MissingLightning { index: usize },

    /// Peer connection failed with a non-retryable error
    #[error("failed to connect LN node {from} to {to}: {reason}")]
    PeerConnect {
        from: usize,
        to: usize,
        reason: String,
    },

    /// Graph gossip did not converge within the retry budget
    #[error("gossip incomplete on nodes: {}", nodes.join(", "))]
    GossipIncomplete { nodes: Vec<String> },

    /// Observed channel policies never matched the declared ones
    #[error("channel policies did not converge: {}", mismatches.join("; "))]
    PolicyMismatch { mismatches: Vec<String> },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// A stage task panicked or was cancelled
    #[error("stage task failed: {0}")]
    Task(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Top-level engine errors
#[derive(Debug, Error)]
pub enum WarnetError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("tank {0} does not exist")]
    TankNotFound(usize),

    #[error("tank {0} has no lightning node")]
    NoLightning(usize),

    #[error("scenario not found: {0}")]
    ScenarioNotFound(String),

    #[error("no running scenario with id {0}")]
    ScenarioNotRunning(String),

    #[error("invalid log pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WarnetError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<TimeoutError> for WarnetError {
    fn from(e: TimeoutError) -> Self {
        Self::Backend(BackendError::Timeout(e))
    }
}

impl From<CommandError> for WarnetError {
    fn from(e: CommandError) -> Self {
        Self::Backend(BackendError::Command(e))
    }
}

pub type WarnetResult<T> = Result<T, WarnetError>;
