//! Lightning node adapters speaking each implementation's CLI inside the LN container.

pub mod cln;
pub mod lnd;

pub use cln::ClnNode;
pub use lnd::LndNode;

use crate::domain::graph::LnImpl;
use crate::domain::tank::TankSpec;
use crate::error::{BackendError, BackendResult};
use crate::polling::Backoff;
use crate::ports::outbound::{Backend, ConnectOutcome, LightningNode};
use serde_json::Value;
use std::sync::Arc;

/// Errors that mean one side of a connection is still coming up
const NOT_READY_MARKERS: &[&str] = &[
    "server is still in the process of starting",
    "not yet ready",
    "connection refused",
    "no such host",
    "i/o timeout",
    "still syncing",
    "connection establishment",
    "unable to connect",
];

/// Build the adapter matching a tank's declared implementation.
pub fn lightning_node(
    backend: Arc<dyn Backend>,
    tank: &TankSpec,
    backoff: Backoff,
) -> Option<Arc<dyn LightningNode>> {
    let ln = tank.ln.as_ref()?;
    let node: Arc<dyn LightningNode> = match ln.implementation {
        LnImpl::Lnd => Arc::new(LndNode::new(backend, tank.index, backoff)),
        LnImpl::Cln => Arc::new(ClnNode::new(backend, tank.index, backoff)),
    };
    Some(node)
}

pub(crate) fn parse_json(command: &str, output: &str) -> BackendResult<Value> {
    if output.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(output).map_err(|e| BackendError::parse(format!("output of `{command}`"), e))
}

/// Interpret the result of a connect call.
pub(crate) fn connect_outcome(result: BackendResult<Value>) -> BackendResult<ConnectOutcome> {
    match result {
        Ok(_) => Ok(ConnectOutcome::Connected),
        Err(BackendError::Command(e)) => {
            let output = e.output.to_ascii_lowercase();
            if output.contains("already connected") {
                Ok(ConnectOutcome::AlreadyConnected)
            } else if NOT_READY_MARKERS.iter().any(|m| output.contains(m)) {
                Ok(ConnectOutcome::NotReady(e.output))
            } else {
                Err(BackendError::Command(e))
            }
        }
        Err(e) => Err(e),
    }
}

/// Numbers arrive as JSON numbers or decimal strings depending on the implementation
pub(crate) fn lenient_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim_end_matches("msat").parse().ok(),
        _ => None,
    }
}

pub(crate) fn field_u64(value: &Value, key: &str) -> BackendResult<u64> {
    lenient_u64(&value[key]).ok_or_else(|| BackendError::parse(key, format!("missing or non-numeric in {value}")))
}

pub(crate) fn field_str<'a>(value: &'a Value, key: &str) -> BackendResult<&'a str> {
    value[key]
        .as_str()
        .ok_or_else(|| BackendError::parse(key, format!("missing in {value}")))
}
