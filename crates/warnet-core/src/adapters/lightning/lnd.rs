//! LND over `lncli`.

use super::{connect_outcome, field_str, field_u64, lenient_u64, parse_json};
use crate::domain::channel::{lnd_to_cln_scid, ChannelPoint, LnChannel};
use crate::domain::graph::{ChannelPolicy, LnImpl};
use crate::domain::lightning::{LND_MOUNT_PATH, LN_RPC_PORT};
use crate::domain::status::ServiceType;
use crate::error::{BackendError, BackendResult};
use crate::polling::{retry_with_backoff, Backoff};
use crate::ports::outbound::{Backend, ConnectOutcome, LightningNode, OpenChannelRequest};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Defaults `updatechanpolicy` needs when a declared policy leaves them unset
const DEFAULT_BASE_FEE_MSAT: u64 = 1000;
const DEFAULT_FEE_RATE_PPM: u64 = 1;
const DEFAULT_TIME_LOCK_DELTA: u32 = 80;

pub struct LndNode {
    backend: Arc<dyn Backend>,
    index: usize,
    backoff: Backoff,
}

impl LndNode {
    pub fn new(backend: Arc<dyn Backend>, index: usize, backoff: Backoff) -> Self {
        Self {
            backend,
            index,
            backoff,
        }
    }

    /// `cli` retried under backoff, for calls made while the daemon may still be starting
    async fn cli_retrying(&self, command: &str) -> BackendResult<Value> {
        retry_with_backoff(&self.backoff, command, || self.cli(command)).await
    }

    async fn getinfo(&self) -> BackendResult<Value> {
        self.cli_retrying("getinfo").await
    }
}

fn policy_from_json(policy: &Value) -> Option<ChannelPolicy> {
    if policy.is_null() {
        return None;
    }
    Some(ChannelPolicy {
        base_fee_msat: lenient_u64(&policy["fee_base_msat"]),
        fee_rate_ppm: lenient_u64(&policy["fee_rate_milli_msat"]),
        cltv_expiry_delta: lenient_u64(&policy["time_lock_delta"]).and_then(|d| u32::try_from(d).ok()),
        min_htlc_msat: lenient_u64(&policy["min_htlc"]),
        max_htlc_msat: lenient_u64(&policy["max_htlc_msat"]),
    })
}

/// Convert one `describegraph` edge
pub fn channel_from_edge(edge: &Value) -> BackendResult<LnChannel> {
    Ok(LnChannel::new(
        field_str(edge, "node1_pub")?.to_string(),
        field_str(edge, "node2_pub")?.to_string(),
        field_u64(edge, "capacity")? * 1000,
        lnd_to_cln_scid(field_u64(edge, "channel_id")?),
        policy_from_json(&edge["node1_policy"]),
        policy_from_json(&edge["node2_policy"]),
    ))
}

/// `updatechanpolicy` flags for a declared policy
fn policy_flags(policy: &ChannelPolicy) -> String {
    let mut flags = format!(
        "--base_fee_msat={} --fee_rate_ppm={} --time_lock_delta={}",
        policy.base_fee_msat.unwrap_or(DEFAULT_BASE_FEE_MSAT),
        policy.fee_rate_ppm.unwrap_or(DEFAULT_FEE_RATE_PPM),
        policy.cltv_expiry_delta.unwrap_or(DEFAULT_TIME_LOCK_DELTA),
    );
    if let Some(min) = policy.min_htlc_msat {
        flags.push_str(&format!(" --min_htlc_msat={min}"));
    }
    if let Some(max) = policy.max_htlc_msat {
        flags.push_str(&format!(" --max_htlc_msat={max}"));
    }
    flags
}

#[async_trait]
impl LightningNode for LndNode {
    fn implementation(&self) -> LnImpl {
        LnImpl::Lnd
    }

    async fn cli(&self, command: &str) -> BackendResult<Value> {
        let cmd = format!("{} {command}", LnImpl::Lnd.cli());
        let output = self.backend.exec(self.index, ServiceType::Lightning, &cmd).await?;
        parse_json(command, &output)
    }

    async fn new_address(&self) -> BackendResult<String> {
        let res = self.cli_retrying("newaddress p2wkh").await?;
        Ok(field_str(&res, "address")?.to_string())
    }

    async fn pub_key(&self) -> BackendResult<String> {
        let info = self.getinfo().await?;
        Ok(field_str(&info, "identity_pubkey")?.to_string())
    }

    async fn uri(&self) -> BackendResult<Option<String>> {
        let info = self.getinfo().await?;
        Ok(info["uris"][0].as_str().map(str::to_string))
    }

    async fn wallet_balance(&self) -> BackendResult<u64> {
        let res = self.cli_retrying("walletbalance").await?;
        field_u64(&res, "confirmed_balance")
    }

    async fn connect(&self, uri: &str) -> BackendResult<ConnectOutcome> {
        connect_outcome(self.cli(&format!("connect {uri}")).await)
    }

    #[instrument(skip(self), fields(index = self.index))]
    async fn open_channel_to(&self, request: &OpenChannelRequest) -> BackendResult<ChannelPoint> {
        let (pubkey, host) = request.peer()?;
        let res = self
            .cli(&format!(
                "openchannel --node_key={pubkey} --connect={host} --local_amt={} --push_amt={} --sat_per_vbyte={}",
                request.capacity_sat, request.push_sat, request.fee_rate
            ))
            .await?;
        let txid = field_str(&res, "funding_txid")?.to_string();

        // openchannel only reports the txid; the output index comes from the pending list
        let pending = self.cli("pendingchannels").await?;
        pending["pending_open_channels"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|c| c["channel"]["channel_point"].as_str())
            .find(|point| point.starts_with(&txid))
            .and_then(ChannelPoint::parse)
            .ok_or_else(|| BackendError::NotFound {
                resource: format!("pending channel with funding txid {txid}"),
            })
    }

    async fn update_channel_policy(
        &self,
        point: &ChannelPoint,
        _short_chan_id: &str,
        policy: &ChannelPolicy,
    ) -> BackendResult<()> {
        let res = self
            .cli(&format!("updatechanpolicy --chan_point={point} {}", policy_flags(policy)))
            .await?;
        match res["failed_updates"].as_array() {
            Some(failed) if !failed.is_empty() => Err(BackendError::parse(
                "updatechanpolicy",
                format!("failed updates for {point}: {}", Value::Array(failed.clone())),
            )),
            _ => Ok(()),
        }
    }

    async fn graph_nodes(&self) -> BackendResult<Vec<String>> {
        let graph = self.cli("describegraph").await?;
        Ok(graph["nodes"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|n| n["pub_key"].as_str().map(str::to_string))
            .collect())
    }

    async fn graph_channels(&self) -> BackendResult<Vec<LnChannel>> {
        let graph = self.cli("describegraph").await?;
        graph["edges"]
            .as_array()
            .into_iter()
            .flatten()
            .map(channel_from_edge)
            .collect()
    }

    async fn peers(&self) -> BackendResult<Vec<String>> {
        let res = self.cli("listpeers").await?;
        Ok(res["peers"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|p| p["pub_key"].as_str().map(str::to_string))
            .collect())
    }

    async fn export(&self, id: &str, host: &str, dir: &Path) -> BackendResult<Value> {
        let macaroon_file = format!("{id}_admin.macaroon");
        let cert_file = format!("{id}_tls.cert");
        let files = [
            (
                format!("{LND_MOUNT_PATH}/data/chain/bitcoin/regtest/admin.macaroon"),
                &macaroon_file,
            ),
            (format!("{LND_MOUNT_PATH}/tls.cert"), &cert_file),
        ];
        for (source, name) in files {
            let data = self
                .backend
                .get_file(self.index, ServiceType::Lightning, &source)
                .await?;
            let target = dir.join(name);
            tokio::fs::write(&target, data)
                .await
                .map_err(|e| BackendError::io(&target, e))?;
            debug!(index = self.index, file = %target.display(), "exported credential");
        }
        Ok(json!({
            "id": id,
            "address": format!("https://{host}:{LN_RPC_PORT}"),
            "macaroon": format!("/simln/{macaroon_file}"),
            "cert": format!("/simln/{cert_file}"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describegraph_edge_conversion() {
        let edge = json!({
            "channel_id": (300u64 << 40 | 1 << 16).to_string(),
            "node1_pub": "03bb",
            "node2_pub": "02aa",
            "capacity": "100000",
            "node1_policy": {
                "time_lock_delta": 40,
                "min_htlc": "1000",
                "fee_base_msat": "2",
                "fee_rate_milli_msat": "10",
                "max_htlc_msat": "99000000"
            },
            "node2_policy": null
        });
        let chan = channel_from_edge(&edge).unwrap();
        assert_eq!(chan.short_chan_id, "300x1x0");
        assert_eq!(chan.capacity_msat, 100_000_000);
        // endpoints swap so node1 is the lower key
        assert_eq!(chan.node1_pub, "02aa");
        assert!(chan.node1_policy.is_none());
        let policy = chan.policy_of("03bb").unwrap();
        assert_eq!(policy.base_fee_msat, Some(2));
        assert_eq!(policy.cltv_expiry_delta, Some(40));
    }

    #[test]
    fn test_policy_flags_fill_required_defaults() {
        let flags = policy_flags(&ChannelPolicy {
            fee_rate_ppm: Some(500),
            max_htlc_msat: Some(10_000),
            ..Default::default()
        });
        assert_eq!(
            flags,
            "--base_fee_msat=1000 --fee_rate_ppm=500 --time_lock_delta=80 --max_htlc_msat=10000"
        );
    }
}
