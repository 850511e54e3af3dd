//! Core Lightning over `lightning-cli`.

use super::{connect_outcome, field_str, field_u64, lenient_u64, parse_json};
use crate::domain::channel::{ChannelPoint, LnChannel};
use crate::domain::graph::{ChannelPolicy, LnImpl};
use crate::domain::lightning::LN_RPC_PORT;
use crate::domain::status::ServiceType;
use crate::error::{BackendError, BackendResult};
use crate::polling::{retry_with_backoff, Backoff};
use crate::ports::outbound::{Backend, ConnectOutcome, LightningNode, OpenChannelRequest};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument};

const CLN_DATA_DIR: &str = "/root/.lightning/regtest";

pub struct ClnNode {
    backend: Arc<dyn Backend>,
    index: usize,
    backoff: Backoff,
}

impl ClnNode {
    pub fn new(backend: Arc<dyn Backend>, index: usize, backoff: Backoff) -> Self {
        Self {
            backend,
            index,
            backoff,
        }
    }

    async fn cli_retrying(&self, command: &str) -> BackendResult<Value> {
        retry_with_backoff(&self.backoff, command, || self.cli(command)).await
    }
}

fn policy_from_json(direction: &Value) -> ChannelPolicy {
    ChannelPolicy {
        base_fee_msat: lenient_u64(&direction["base_fee_millisatoshi"]),
        fee_rate_ppm: lenient_u64(&direction["fee_per_millionth"]),
        cltv_expiry_delta: lenient_u64(&direction["delay"]).and_then(|d| u32::try_from(d).ok()),
        min_htlc_msat: lenient_u64(&direction["htlc_minimum_msat"]),
        max_htlc_msat: lenient_u64(&direction["htlc_maximum_msat"]),
    }
}

/// Merge `listchannels` output, which lists every channel once per direction.
pub fn channels_from_listing(listing: &[Value]) -> BackendResult<Vec<LnChannel>> {
    let mut by_scid: BTreeMap<&str, Vec<&Value>> = BTreeMap::new();
    for direction in listing {
        by_scid
            .entry(field_str(direction, "short_channel_id")?)
            .or_default()
            .push(direction);
    }

    let mut channels = Vec::with_capacity(by_scid.len());
    for (scid, directions) in by_scid {
        let first = directions[0];
        let source = field_str(first, "source")?;
        let destination = field_str(first, "destination")?;
        // Only one direction is known until the peer's update propagates
        let reverse = directions
            .iter()
            .find(|d| d["source"].as_str() == Some(destination))
            .map(|d| policy_from_json(d));
        channels.push(LnChannel::new(
            source.to_string(),
            destination.to_string(),
            field_u64(first, "amount_msat")?,
            scid.to_string(),
            Some(policy_from_json(first)),
            reverse,
        ));
    }
    Ok(channels)
}

#[async_trait]
impl LightningNode for ClnNode {
    fn implementation(&self) -> LnImpl {
        LnImpl::Cln
    }

    async fn cli(&self, command: &str) -> BackendResult<Value> {
        let cmd = format!("{} {command}", LnImpl::Cln.cli());
        let output = self.backend.exec(self.index, ServiceType::Lightning, &cmd).await?;
        parse_json(command, &output)
    }

    async fn new_address(&self) -> BackendResult<String> {
        let res = self.cli_retrying("newaddr").await?;
        Ok(field_str(&res, "bech32")?.to_string())
    }

    async fn pub_key(&self) -> BackendResult<String> {
        let info = self.cli_retrying("getinfo").await?;
        Ok(field_str(&info, "id")?.to_string())
    }

    async fn uri(&self) -> BackendResult<Option<String>> {
        let info = self.cli_retrying("getinfo").await?;
        let id = field_str(&info, "id")?;
        let address = &info["address"][0];
        if address.is_null() {
            return Ok(None);
        }
        Ok(Some(format!(
            "{id}@{}:{}",
            field_str(address, "address")?,
            field_u64(address, "port")?
        )))
    }

    async fn wallet_balance(&self) -> BackendResult<u64> {
        let funds = self.cli_retrying("listfunds").await?;
        let msat: u64 = funds["outputs"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|o| lenient_u64(&o["amount_msat"]))
            .sum();
        Ok(msat / 1000)
    }

    async fn connect(&self, uri: &str) -> BackendResult<ConnectOutcome> {
        connect_outcome(self.cli(&format!("connect {uri}")).await)
    }

    #[instrument(skip(self), fields(index = self.index))]
    async fn open_channel_to(&self, request: &OpenChannelRequest) -> BackendResult<ChannelPoint> {
        let (pubkey, _) = request.peer()?;
        let res = self
            .cli(&format!(
                "fundchannel id={pubkey} amount={} push_msat={} feerate={}perkb",
                request.capacity_sat,
                request.push_sat * 1000,
                request.fee_rate * 1000
            ))
            .await?;
        let output = field_u64(&res, "outnum")?;
        Ok(ChannelPoint {
            txid: field_str(&res, "txid")?.to_string(),
            output: u32::try_from(output).map_err(|e| BackendError::parse("outnum", e))?,
        })
    }

    /// CLN advertises one CLTV delta for all channels, so it cannot be set here.
    fn effective_policy(&self, declared: &ChannelPolicy) -> ChannelPolicy {
        ChannelPolicy {
            cltv_expiry_delta: None,
            ..*declared
        }
    }

    async fn update_channel_policy(
        &self,
        _point: &ChannelPoint,
        short_chan_id: &str,
        policy: &ChannelPolicy,
    ) -> BackendResult<()> {
        let mut cmd = format!("setchannel id={short_chan_id}");
        if let Some(base) = policy.base_fee_msat {
            cmd.push_str(&format!(" feebase={base}"));
        }
        if let Some(ppm) = policy.fee_rate_ppm {
            cmd.push_str(&format!(" feeppm={ppm}"));
        }
        if let Some(min) = policy.min_htlc_msat {
            cmd.push_str(&format!(" htlcmin={min}"));
        }
        if let Some(max) = policy.max_htlc_msat {
            cmd.push_str(&format!(" htlcmax={max}"));
        }
        self.cli(&cmd).await?;
        Ok(())
    }

    async fn graph_nodes(&self) -> BackendResult<Vec<String>> {
        let res = self.cli("listnodes").await?;
        Ok(res["nodes"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|n| n["nodeid"].as_str().map(str::to_string))
            .collect())
    }

    async fn graph_channels(&self) -> BackendResult<Vec<LnChannel>> {
        let res = self.cli("listchannels").await?;
        let listing = res["channels"].as_array().cloned().unwrap_or_default();
        channels_from_listing(&listing)
    }

    async fn peers(&self) -> BackendResult<Vec<String>> {
        let res = self.cli("listpeers").await?;
        Ok(res["peers"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|p| p["id"].as_str().map(str::to_string))
            .collect())
    }

    async fn export(&self, id: &str, host: &str, dir: &Path) -> BackendResult<Value> {
        let mut entry = json!({
            "id": id,
            "address": format!("https://{host}:{LN_RPC_PORT}"),
        });
        for (source, key) in [
            ("ca.pem", "ca_cert"),
            ("client.pem", "client_cert"),
            ("client-key.pem", "client_key"),
        ] {
            let data = self
                .backend
                .get_file(self.index, ServiceType::Lightning, &format!("{CLN_DATA_DIR}/{source}"))
                .await?;
            let name = format!("{id}_{key}.pem");
            let target = dir.join(&name);
            tokio::fs::write(&target, data)
                .await
                .map_err(|e| BackendError::io(&target, e))?;
            debug!(index = self.index, file = %target.display(), "exported credential");
            entry[key] = Value::String(format!("/simln/{name}"));
        }
        Ok(entry)
    }
}
