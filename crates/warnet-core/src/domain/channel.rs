//! Lightning channels as observed in a node's graph view.
//!
//! Both implementations report channels in their own shape; adapters convert
//! them into `LnChannel`, which always orders endpoints so that `node1` has
//! the lower pubkey. Declared and observed policies are compared only after
//! both went through [`normalize_policy`].

use crate::domain::graph::ChannelPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest CLTV expiry delta an implementation will advertise
pub const MIN_CLTV_EXPIRY_DELTA: u32 = 18;

/// Smallest HTLC an implementation will advertise, in msat
pub const MIN_HTLC_MSAT: u64 = 1;

/// Funding outpoint of a channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelPoint {
    pub txid: String,
    pub output: u32,
}

impl ChannelPoint {
    /// Parse `txid:output`
    pub fn parse(s: &str) -> Option<Self> {
        let (txid, output) = s.rsplit_once(':')?;
        Some(Self {
            txid: txid.to_string(),
            output: output.parse().ok()?,
        })
    }
}

impl fmt::Display for ChannelPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.output)
    }
}

/// A channel from one node's graph view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LnChannel {
    pub node1_pub: String,
    pub node2_pub: String,
    pub capacity_msat: u64,
    /// `BxTxO` form
    pub short_chan_id: String,
    pub node1_policy: Option<ChannelPolicy>,
    pub node2_policy: Option<ChannelPolicy>,
}

impl LnChannel {
    /// Build a channel, swapping endpoints (and their policies) so that
    /// `node1_pub` is the lexicographically lower key.
    pub fn new(
        node1_pub: String,
        node2_pub: String,
        capacity_msat: u64,
        short_chan_id: String,
        node1_policy: Option<ChannelPolicy>,
        node2_policy: Option<ChannelPolicy>,
    ) -> Self {
        if node1_pub > node2_pub {
            Self {
                node1_pub: node2_pub,
                node2_pub: node1_pub,
                capacity_msat,
                short_chan_id,
                node1_policy: node2_policy,
                node2_policy: node1_policy,
            }
        } else {
            Self {
                node1_pub,
                node2_pub,
                capacity_msat,
                short_chan_id,
                node1_policy,
                node2_policy,
            }
        }
    }

    /// Policy advertised by the endpoint with `pubkey`
    pub fn policy_of(&self, pubkey: &str) -> Option<&ChannelPolicy> {
        if pubkey == self.node1_pub {
            self.node1_policy.as_ref()
        } else if pubkey == self.node2_pub {
            self.node2_policy.as_ref()
        } else {
            None
        }
    }
}

/// Canonical form of a policy: protocol floors applied to CLTV delta and
/// minimum HTLC. Unset fields stay unset.
pub fn normalize_policy(policy: &ChannelPolicy) -> ChannelPolicy {
    ChannelPolicy {
        cltv_expiry_delta: policy
            .cltv_expiry_delta
            .map(|d| d.max(MIN_CLTV_EXPIRY_DELTA)),
        min_htlc_msat: policy.min_htlc_msat.map(|m| m.max(MIN_HTLC_MSAT)),
        ..*policy
    }
}

/// Whether `observed` satisfies every field `declared` sets, after both are normalized.
pub fn policy_satisfies(observed: &ChannelPolicy, declared: &ChannelPolicy) -> bool {
    let observed = normalize_policy(observed);
    let declared = normalize_policy(declared);
    fn field<T: PartialEq>(declared: Option<T>, observed: Option<T>) -> bool {
        match declared {
            Some(d) => observed == Some(d),
            None => true,
        }
    }
    field(declared.base_fee_msat, observed.base_fee_msat)
        && field(declared.fee_rate_ppm, observed.fee_rate_ppm)
        && field(declared.cltv_expiry_delta, observed.cltv_expiry_delta)
        && field(declared.min_htlc_msat, observed.min_htlc_msat)
        && field(declared.max_htlc_msat, observed.max_htlc_msat)
}

/// LND's integer channel id to `BxTxO`
pub fn lnd_to_cln_scid(id: u64) -> String {
    let block = id >> 40;
    let tx = (id >> 16) & 0xFF_FFFF;
    let output = id & 0xFFFF;
    format!("{block}x{tx}x{output}")
}

/// `BxTxO` to LND's integer channel id
pub fn cln_to_lnd_scid(scid: &str) -> Option<u64> {
    let mut parts = scid.split('x').map(|p| p.parse::<u64>().ok());
    let (block, tx, output) = (parts.next()??, parts.next()??, parts.next()??);
    if parts.next().is_some() || block >= 1 << 24 || tx >= 1 << 24 || output >= 1 << 16 {
        return None;
    }
    Some(block << 40 | tx << 16 | output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base: u64, ppm: u64, cltv: u32, min_htlc: u64) -> ChannelPolicy {
        ChannelPolicy {
            base_fee_msat: Some(base),
            fee_rate_ppm: Some(ppm),
            cltv_expiry_delta: Some(cltv),
            min_htlc_msat: Some(min_htlc),
            max_htlc_msat: None,
        }
    }

    #[test]
    fn test_endpoints_ordered_by_pubkey() {
        let a = policy(1, 1, 40, 1);
        let b = policy(2, 2, 40, 1);
        let chan = LnChannel::new("03bb".into(), "02aa".into(), 1000, "300x1x0".into(), Some(a), Some(b));
        assert_eq!(chan.node1_pub, "02aa");
        assert_eq!(chan.node1_policy, Some(b));
        assert_eq!(chan.policy_of("03bb"), Some(&a));
    }

    #[test]
    fn test_normalization_applies_floors() {
        let raw = policy(0, 0, 9, 0);
        let normalized = normalize_policy(&raw);
        assert_eq!(normalized.cltv_expiry_delta, Some(MIN_CLTV_EXPIRY_DELTA));
        assert_eq!(normalized.min_htlc_msat, Some(MIN_HTLC_MSAT));
        assert_eq!(normalized.base_fee_msat, Some(0));
    }

    #[test]
    fn test_policy_satisfies_after_floor() {
        let declared = policy(5, 10, 10, 0);
        let observed = policy(5, 10, 18, 1);
        assert!(policy_satisfies(&observed, &declared));
        assert!(!policy_satisfies(&policy(6, 10, 18, 1), &declared));
    }

    #[test]
    fn test_unset_declared_fields_are_ignored() {
        let declared = ChannelPolicy {
            fee_rate_ppm: Some(500),
            ..Default::default()
        };
        assert!(policy_satisfies(&policy(1000, 500, 80, 1000), &declared));
    }

    #[test]
    fn test_scid_conversion() {
        let id = cln_to_lnd_scid("300x1x0").unwrap();
        assert_eq!(id, 300u64 << 40 | 1 << 16);
        assert_eq!(lnd_to_cln_scid(id), "300x1x0");
        assert_eq!(cln_to_lnd_scid("300x1"), None);
        assert_eq!(cln_to_lnd_scid("ax1x0"), None);
    }

    #[test]
    fn test_channel_point_parse() {
        let point = ChannelPoint::parse("abcd:1").unwrap();
        assert_eq!(point.output, 1);
        assert_eq!(point.to_string(), "abcd:1");
        assert!(ChannelPoint::parse("abcd").is_none());
    }
}
