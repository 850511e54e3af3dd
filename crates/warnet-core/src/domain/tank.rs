//! Desired state of one tank, projected from a graph node.
//!
//! `TankSpec` holds everything known before anything is deployed: resolved
//! version or image, bitcoind options, RPC credentials and `init_peers`.
//! Runtime state (address, live status) lives on the service-level `Tank`.

use crate::domain::graph::{LnSpec, NodeSpec, TopologyGraph};
use crate::domain::status::ServiceType;
use crate::error::{GraphError, GraphResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::OnceLock;
use tracing::warn;

/// Version used when a node declares neither `version` nor `image`
pub const DEFAULT_VERSION: &str = "27.0";

/// Prebuilt release tags
pub const SUPPORTED_VERSIONS: &[&str] = &["27.0", "26.0", "25.1", "24.2", "23.2", "22.2"];

pub const DEFAULT_IMAGE_REPO: &str = "bitcoindevproject/bitcoin";
pub const DEFAULT_RPC_USER: &str = "warnet_user";
pub const DEFAULT_RPC_PASSWORD: &str = "2themoon";
pub const RPC_PORT: u16 = 18443;
pub const P2P_PORT: u16 = 18444;
pub const ZMQ_BLOCK_PORT: u16 = 28332;
pub const ZMQ_TX_PORT: u16 = 28333;
pub const METRICS_PORT: u16 = 9332;

/// bitcoind options every tank starts with
const BASE_BITCOIN_OPTIONS: &[(&str, &str)] = &[
    ("regtest", "1"),
    ("checkmempool", "0"),
    ("acceptnonstdtxn", "1"),
    ("debuglogfile", "0"),
    ("logips", "1"),
    ("logtimemicros", "1"),
    ("capturemessages", "1"),
    ("rpcallowip", "0.0.0.0/0"),
    ("rpcbind", "0.0.0.0"),
    ("fallbackfee", "0.00001000"),
    ("listen", "1"),
];

/// RPC credentials of a tank's bitcoind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCredentials {
    pub user: String,
    pub password: String,
    pub port: u16,
}

impl Default for RpcCredentials {
    fn default() -> Self {
        Self {
            user: DEFAULT_RPC_USER.to_string(),
            password: DEFAULT_RPC_PASSWORD.to_string(),
            port: RPC_PORT,
        }
    }
}

/// Source build of a `repo#branch` version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBuild {
    pub repo: String,
    pub branch: String,
    pub build_args: Option<String>,
}

impl SourceBuild {
    /// Local image tag the build produces
    pub fn image_tag(&self) -> String {
        let repo = self.repo.replace(['/', ':', '.'], "-").to_ascii_lowercase();
        let branch = self.branch.replace(['/', ':'], "-").to_ascii_lowercase();
        format!("warnet/bitcoin-{repo}:{branch}")
    }
}

/// Desired state of one tank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TankSpec {
    pub index: usize,
    pub network_name: String,
    pub version: String,
    /// Declared image, overrides the version-derived one
    pub image: Option<String>,
    pub build: Option<SourceBuild>,
    pub bitcoin_options: Vec<(String, String)>,
    /// Sanitized tc-netem command, if one was declared and accepted
    pub netem: Option<String>,
    pub exporter: bool,
    pub collect_logs: bool,
    pub rpc: RpcCredentials,
    pub init_peers: Vec<usize>,
    pub ln: Option<LnSpec>,
}

impl TankSpec {
    /// Project a graph node into a tank.
    pub fn from_node(node: &NodeSpec, graph: &TopologyGraph, network_name: &str) -> GraphResult<Self> {
        let config_error = |reason: String| GraphError::Config {
            index: node.index,
            reason,
        };

        let (version, build) = match (&node.version, &node.image) {
            (Some(_), Some(_)) => {
                return Err(config_error(
                    "`version` and `image` are mutually exclusive".to_string(),
                ))
            }
            (None, _) => (DEFAULT_VERSION.to_string(), None),
            (Some(version), None) => match version.split_once('#') {
                Some((repo, branch)) if !repo.is_empty() && !branch.is_empty() => (
                    version.clone(),
                    Some(SourceBuild {
                        repo: repo.to_string(),
                        branch: branch.to_string(),
                        build_args: node.build_args.clone(),
                    }),
                ),
                Some(_) => return Err(config_error(format!("malformed source version {version:?}"))),
                None if SUPPORTED_VERSIONS.contains(&version.as_str()) => (version.clone(), None),
                None => {
                    return Err(config_error(format!(
                        "unsupported version {version:?}, expected one of {SUPPORTED_VERSIONS:?} or repo#branch"
                    )))
                }
            },
        };

        let netem = node.tc_netem.as_deref().and_then(|cmd| {
            if sanitize_tc_netem(cmd) {
                Some(cmd.trim().to_string())
            } else {
                warn!(index = node.index, command = cmd, "dropping unsafe tc-netem command");
                None
            }
        });

        Ok(Self {
            index: node.index,
            network_name: network_name.to_string(),
            version,
            image: node.image.clone(),
            build,
            bitcoin_options: node
                .bitcoin_config
                .as_deref()
                .map(parse_bitcoin_config)
                .unwrap_or_default(),
            netem,
            exporter: node.exporter,
            collect_logs: node.collect_logs,
            rpc: RpcCredentials::default(),
            init_peers: graph.init_peers(node.index),
            ln: node.ln.clone(),
        })
    }

    /// Stable resource name for the given service of this tank
    pub fn resource_name(&self, service: ServiceType) -> String {
        resource_name(&self.network_name, self.index, service)
    }

    /// Service fronting the given container
    pub fn service_name(&self, service: ServiceType) -> String {
        format!("{}-service", self.resource_name(service))
    }

    /// Image the bitcoin container runs
    pub fn bitcoin_image(&self) -> String {
        if let Some(image) = &self.image {
            return image.clone();
        }
        match &self.build {
            Some(build) => build.image_tag(),
            None => format!("{DEFAULT_IMAGE_REPO}:{}", self.version),
        }
    }

    /// Full bitcoind command line: base options, declared options, credentials,
    /// ZMQ endpoints and one `-addnode` per peer address.
    pub fn bitcoin_args(&self, peers: &[String]) -> String {
        let mut options: Vec<(String, String)> = BASE_BITCOIN_OPTIONS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        options.extend(self.bitcoin_options.iter().cloned());
        options.push(("rpcuser".into(), self.rpc.user.clone()));
        options.push(("rpcpassword".into(), self.rpc.password.clone()));
        options.push(("rpcport".into(), self.rpc.port.to_string()));
        options.push((
            "zmqpubrawblock".into(),
            format!("tcp://0.0.0.0:{ZMQ_BLOCK_PORT}"),
        ));
        options.push(("zmqpubrawtx".into(), format!("tcp://0.0.0.0:{ZMQ_TX_PORT}")));
        options.push(("uacomment".into(), format!("w{}", self.index)));
        for peer in peers {
            options.push(("addnode".into(), peer.clone()));
        }
        options
            .iter()
            .map(|(k, v)| format!("-{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// `bitcoin-cli` invocation for `method` with raw arguments
    pub fn cli_command(&self, method: &str, args: &[String]) -> String {
        let mut cmd = format!(
            "bitcoin-cli -regtest -rpcuser={} -rpcpassword={} -rpcport={} {}",
            self.rpc.user, self.rpc.password, self.rpc.port, method
        );
        for arg in args {
            cmd.push(' ');
            cmd.push_str(&shell_quote(arg));
        }
        cmd
    }
}

/// `{network}-tank-{index:06}` for bitcoin, `{network}-tank-ln-{index:06}` for lightning
pub fn resource_name(network: &str, index: usize, service: ServiceType) -> String {
    match service {
        ServiceType::Bitcoin => format!("{network}-tank-{index:06}"),
        ServiceType::Lightning => format!("{network}-tank-ln-{index:06}"),
    }
}

/// Quote one argument for `/bin/sh -c`
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_=.,:/@+%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Parse `key=value,flag,...` into option pairs. A bare key means `key=1`.
pub fn parse_bitcoin_config(config: &str) -> Vec<(String, String)> {
    config
        .split(',')
        .map(str::trim)
        .filter(|option| !option.is_empty())
        .map(|option| {
            let option = option.trim_start_matches('-');
            match option.split_once('=') {
                Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
                None => (option.to_string(), "1".to_string()),
            }
        })
        .collect()
}

const NETEM_PREFIX: &str = "tc qdisc add dev eth0 root netem";

/// Recognized netem parameters: name, value pattern, and how many
/// whitespace separated tokens the value may span.
fn netem_patterns() -> &'static [(&'static str, Regex, usize)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex, usize)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                "delay",
                r"^\d+ms(\s\d+ms)?(\sdistribution\s(normal|pareto|paretonormal|uniform))?$",
                4,
            ),
            ("loss", r"^\d+(\.\d+)?%$", 1),
            ("duplicate", r"^\d+(\.\d+)?%$", 1),
            ("corrupt", r"^\d+(\.\d+)?%$", 1),
            ("reorder", r"^\d+(\.\d+)?%\s\d+(\.\d+)?%$", 2),
            ("rate", r"^\d+(kbit|mbit|gbit)$", 1),
        ]
        .into_iter()
        .filter_map(|(name, pattern, width)| Regex::new(pattern).ok().map(|re| (name, re, width)))
        .collect()
    })
}

/// Accept only `tc qdisc add dev eth0 root netem` followed by known
/// parameters with well-formed values.
pub fn sanitize_tc_netem(command: &str) -> bool {
    let Some(rest) = command.trim().strip_prefix(NETEM_PREFIX) else {
        return false;
    };
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return false;
    }
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let mut i = 0;
    while i < tokens.len() {
        let Some((_, re, width)) = netem_patterns().iter().find(|(name, _, _)| *name == tokens[i])
        else {
            return false;
        };
        // Longest run of following tokens that forms a valid value
        let taken = (1..=*width)
            .rev()
            .filter(|n| i + 1 + n <= tokens.len())
            .find(|n| re.is_match(&tokens[i + 1..i + 1 + n].join(" ")));
        match taken {
            Some(n) => i += 1 + n,
            None => return false,
        }
    }
    true
}

/// Numeric version comparison; a non-numeric version such as a source build
/// counts as newer than any release.
pub fn version_ge(version: &str, threshold: &str) -> bool {
    fn parts(v: &str) -> Option<Vec<u64>> {
        v.trim_start_matches('v')
            .split('.')
            .map(|p| p.parse::<u64>().ok())
            .collect()
    }
    let (Some(a), Some(b)) = (parts(version), parts(threshold)) else {
        return true;
    };
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => {}
        }
    }
    true
}
