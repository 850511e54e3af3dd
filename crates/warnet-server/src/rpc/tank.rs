//! `tank_*` methods: direct access to one tank's nodes.

use crate::error::ApiResult;
use crate::state::ServerState;
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;
use warnet_core::domain::MessageRecord;
use warnet_core::Tank;

pub struct TankRpc {
    state: Arc<ServerState>,
}

impl TankRpc {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// tank_bcli - bitcoin-cli `method` with raw params on tank `index`
    #[instrument(skip(self, params))]
    pub async fn bcli(&self, index: usize, method: &str, params: &[Value]) -> ApiResult<String> {
        let warnet = self.state.warnet().await?;
        let tank = warnet.tank(index)?;
        Ok(tank.rpc_command(method, &Tank::cli_params(params)).await?)
    }

    /// tank_lncli - Lightning CLI command on tank `index`
    #[instrument(skip(self))]
    pub async fn lncli(&self, index: usize, command: &str) -> ApiResult<Value> {
        let warnet = self.state.warnet().await?;
        Ok(warnet.tank(index)?.lncli(command).await?)
    }

    /// tank_debug_log - bitcoind debug.log of tank `index`
    #[instrument(skip(self))]
    pub async fn debug_log(&self, index: usize) -> ApiResult<String> {
        let warnet = self.state.warnet().await?;
        Ok(warnet.tank(index)?.debug_log().await?)
    }

    /// tank_messages - P2P messages exchanged between tanks `a` and `b`
    #[instrument(skip(self))]
    pub async fn messages(&self, a: usize, b: usize) -> ApiResult<Vec<MessageRecord>> {
        let warnet = self.state.warnet().await?;
        Ok(warnet.messages(a, b).await?)
    }

    /// tank_ln_pub_key - identity pubkey of tank `index`'s Lightning node
    #[instrument(skip(self))]
    pub async fn ln_pub_key(&self, index: usize) -> ApiResult<String> {
        let warnet = self.state.warnet().await?;
        Ok(warnet.ln_pub_key(index).await?)
    }
}
