//! RPC method handlers grouped by namespace.

pub mod debug;
pub mod network;
pub mod scenarios;
pub mod tank;

pub use debug::DebugRpc;
pub use network::NetworkRpc;
pub use scenarios::ScenarioRpc;
pub use tank::TankRpc;

use crate::state::ServerState;
use std::sync::Arc;

/// All RPC handlers
pub struct RpcHandlers {
    pub tank: TankRpc,
    pub network: NetworkRpc,
    pub scenarios: ScenarioRpc,
    pub debug: DebugRpc,
}

impl RpcHandlers {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self {
            tank: TankRpc::new(Arc::clone(&state)),
            network: NetworkRpc::new(Arc::clone(&state)),
            scenarios: ScenarioRpc::new(Arc::clone(&state)),
            debug: DebugRpc::new(state),
        }
    }
}
