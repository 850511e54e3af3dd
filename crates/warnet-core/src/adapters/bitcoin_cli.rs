//! Chain client running `bitcoin-cli` inside a tank's bitcoin container.

use crate::domain::status::ServiceType;
use crate::domain::tank::TankSpec;
use crate::error::{BackendError, BackendResult};
use crate::ports::outbound::{Backend, ChainClient};
use async_trait::async_trait;
use bitcoin::{Amount, Denomination};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Wallet mining rewards are paid to
pub const MINER_WALLET: &str = "miner";

pub struct BitcoinCliClient {
    backend: Arc<dyn Backend>,
    tank: TankSpec,
}

impl BitcoinCliClient {
    pub fn new(backend: Arc<dyn Backend>, tank: TankSpec) -> Self {
        Self { backend, tank }
    }

    async fn call(&self, method: &str, args: &[String]) -> BackendResult<String> {
        let cmd = self.tank.cli_command(method, args);
        let out = self.backend.exec(self.tank.index, ServiceType::Bitcoin, &cmd).await?;
        Ok(out.trim().to_string())
    }

    async fn wallet_call(&self, method: &str, args: &[String]) -> BackendResult<String> {
        self.call(&format!("-rpcwallet={MINER_WALLET} {method}"), args).await
    }

    fn json(method: &str, out: &str) -> BackendResult<Value> {
        serde_json::from_str(out).map_err(|e| BackendError::parse(format!("{method} output"), e))
    }
}

fn parse_btc(s: &str) -> BackendResult<u64> {
    Amount::from_str_in(s.trim(), Denomination::Bitcoin)
        .map(Amount::to_sat)
        .map_err(|e| BackendError::parse("bitcoin amount", e))
}

/// `sendmany` amounts object, values in BTC
fn amounts_json(outputs: &[(String, u64)]) -> String {
    let entries: Vec<String> = outputs
        .iter()
        .map(|(addr, sats)| {
            format!(
                "\"{addr}\":{}",
                Amount::from_sat(*sats).to_string_in(Denomination::Bitcoin)
            )
        })
        .collect();
    format!("{{{}}}", entries.join(","))
}

#[async_trait]
impl ChainClient for BitcoinCliClient {
    async fn ensure_wallet(&self) -> BackendResult<()> {
        match self.call("createwallet", &[MINER_WALLET.to_string()]).await {
            Ok(_) => {
                info!(index = self.tank.index, "created miner wallet");
                Ok(())
            }
            Err(BackendError::Command(e)) if e.output.contains("already exists") => {
                match self.call("loadwallet", &[MINER_WALLET.to_string()]).await {
                    Err(BackendError::Command(e)) if !e.output.contains("already loaded") => {
                        Err(BackendError::Command(e))
                    }
                    Err(BackendError::Command(_)) | Ok(_) => {
                        debug!(index = self.tank.index, "miner wallet loaded");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn block_count(&self) -> BackendResult<u64> {
        let out = self.call("getblockcount", &[]).await?;
        out.parse().map_err(|e| BackendError::parse("getblockcount", e))
    }

    async fn new_address(&self) -> BackendResult<String> {
        self.wallet_call("getnewaddress", &[]).await
    }

    async fn mine(&self, blocks: u64, address: &str) -> BackendResult<Vec<String>> {
        let out = self
            .call("generatetoaddress", &[blocks.to_string(), address.to_string()])
            .await?;
        let hashes = Self::json("generatetoaddress", &out)?;
        Ok(hashes
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|h| h.as_str().map(str::to_string))
            .collect())
    }

    async fn mempool_size(&self) -> BackendResult<usize> {
        let out = self.call("getmempoolinfo", &[]).await?;
        let info = Self::json("getmempoolinfo", &out)?;
        info["size"]
            .as_u64()
            .map(|s| s as usize)
            .ok_or_else(|| BackendError::parse("getmempoolinfo", "missing size"))
    }

    async fn block_txids(&self, height: u64) -> BackendResult<Vec<String>> {
        let hash = self.call("getblockhash", &[height.to_string()]).await?;
        let out = self.call("getblock", &[hash, "1".to_string()]).await?;
        let block = Self::json("getblock", &out)?;
        Ok(block["tx"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|t| t.as_str().map(str::to_string))
            .collect())
    }

    async fn balance_sat(&self) -> BackendResult<u64> {
        parse_btc(&self.wallet_call("getbalance", &[]).await?)
    }

    async fn send_many(&self, outputs: &[(String, u64)]) -> BackendResult<String> {
        self.wallet_call("sendmany", &[String::new(), amounts_json(outputs)])
            .await
    }
}
