//! Engine configuration with validation.
//!
//! Loading order: built-in defaults, then an optional TOML file, then
//! `WARNET_*` environment overrides.

use crate::domain::ip_pool::Subnet;
use crate::error::{WarnetError, WarnetResult};
use crate::polling::Backoff;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WarnetConfig {
    pub network: NetworkConfig,
    pub backend: BackendConfig,
    pub polling: PollingConfig,
    pub scheduler: SchedulerConfig,
    pub scenarios: ScenarioConfig,
    pub server: ServerConfig,
}

impl WarnetConfig {
    /// Load defaults, the optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> WarnetResult<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| WarnetError::io(path, e))?;
                let config: WarnetConfig = toml::from_str(&text)
                    .map_err(|e| WarnetError::Config(format!("{}: {e}", path.display())))?;
                info!(path = %path.display(), "loaded configuration file");
                config
            }
            None => WarnetConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `WARNET_*` overrides from `lookup`. Unparseable values are
    /// ignored with a warning.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Option<T> {
            let parsed = value.parse().ok();
            if parsed.is_none() {
                warn!(key, value = %value, "ignoring unparseable override");
            }
            parsed
        }

        if let Some(v) = lookup("WARNET_NETWORK") {
            self.network.name = v;
        }
        if let Some(v) = lookup("WARNET_CONFIG_DIR") {
            self.network.config_dir = PathBuf::from(v);
        }
        if let Some(subnet) = lookup("WARNET_SUBNET").and_then(|v| parsed("WARNET_SUBNET", v)) {
            self.network.subnet = subnet;
        }
        if let Some(kind) = lookup("WARNET_BACKEND").and_then(|v| parsed("WARNET_BACKEND", v)) {
            self.backend.kind = kind;
        }
        if let Some(v) = lookup("WARNET_NAMESPACE") {
            self.backend.namespace = v;
        }
        if let Some(v) = lookup("WARNET_SCENARIOS_DIR") {
            self.scenarios.dir = PathBuf::from(v);
        }
        if let Some(host) = lookup("WARNET_RPC_HOST").and_then(|v| parsed("WARNET_RPC_HOST", v)) {
            self.server.host = host;
        }
        if let Some(port) = lookup("WARNET_RPC_PORT").and_then(|v| parsed("WARNET_RPC_PORT", v)) {
            self.server.port = port;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> WarnetResult<()> {
        let invalid = |msg: &str| Err(WarnetError::Config(msg.to_string()));

        if self.network.name.is_empty()
            || !self
                .network
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return invalid("network name must be non-empty lowercase alphanumerics or '-'");
        }
        if self.polling.interval.is_zero() {
            return invalid("polling interval cannot be 0");
        }
        if self.polling.healthy_timeout < self.polling.interval {
            return invalid("healthy timeout must be at least one polling interval");
        }
        if self.scheduler.fee_step == 0 {
            return invalid("fee_step cannot be 0");
        }
        if self.scheduler.fee_floor == 0 || self.scheduler.fee_floor > self.scheduler.fee_ceiling {
            return invalid("fee_floor must be between 1 and fee_ceiling");
        }
        if self.server.port == 0 {
            return invalid("server port cannot be 0");
        }
        Ok(())
    }
}

/// Network identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub name: String,
    pub bitcoin_network: String,
    pub subnet: Subnet,
    /// Per-network state (persisted graph, compose file, exports)
    pub config_dir: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: "warnet".to_string(),
            bitcoin_network: "regtest".to_string(),
            subnet: Subnet::default(),
            config_dir: PathBuf::from(".warnet"),
        }
    }
}

impl NetworkConfig {
    /// Directory holding this network's persisted state
    pub fn network_dir(&self) -> PathBuf {
        self.config_dir.join(&self.name)
    }
}

/// Which orchestrator realizes the tanks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Kubernetes,
    Compose,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(BackendKind::Kubernetes),
            "compose" | "docker" => Ok(BackendKind::Compose),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// Orchestrator access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub namespace: String,
    /// kubectl binary
    pub kubectl: String,
    /// docker binary
    pub docker: String,
    /// Build context for source builds of bitcoind
    pub images_dir: PathBuf,
    /// Image of the LN pod's wait-for-bitcoin init container
    pub helper_image: String,
    pub prometheus_exporter_image: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Kubernetes,
            namespace: "warnet".to_string(),
            kubectl: "kubectl".to_string(),
            docker: "docker".to_string(),
            images_dir: PathBuf::from("resources/images/bitcoin"),
            helper_image: "busybox:1.36".to_string(),
            prometheus_exporter_image: "jvstein/bitcoin-prometheus-exporter:latest".to_string(),
        }
    }
}

/// Poll loop budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub healthy_timeout: Duration,
    /// Interval between address lookups during reconciliation
    #[serde(with = "humantime_serde")]
    pub address_interval: Duration,
    pub address_attempts: u32,
    pub lightning_rpc: Backoff,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            healthy_timeout: Duration::from_secs(600),
            address_interval: Duration::from_secs(3),
            address_attempts: 20,
            lightning_rpc: Backoff::lightning_rpc(),
        }
    }
}

/// Channel open scheduler parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fee rate (sat/vB) of the first channel in a block
    pub fee_ceiling: u64,
    /// Decrement per channel in submission order
    pub fee_step: u64,
    /// Lowest fee rate a channel may be assigned
    pub fee_floor: u64,
    /// Start offset between peer connection tasks
    #[serde(with = "humantime_serde")]
    pub connect_stagger: Duration,
    pub connect_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub mempool_timeout: Duration,
    pub gossip_attempts: u32,
    pub policy_attempts: u32,
    /// Fund LN wallets from the miner before opening channels
    pub fund_wallets: bool,
    /// Blocks mined to the miner for spendable coinbase outputs
    pub maturity_blocks: u64,
    #[serde(with = "humantime_serde")]
    pub funding_timeout: Duration,
    /// Tank whose bitcoind mines and observes the mempool
    pub miner_tank: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fee_ceiling: 5006,
            fee_step: 5,
            fee_floor: 1,
            connect_stagger: Duration::from_millis(250),
            connect_attempts: 60,
            poll_interval: Duration::from_secs(5),
            mempool_timeout: Duration::from_secs(120),
            gossip_attempts: 120,
            policy_attempts: 120,
            fund_wallets: true,
            maturity_blocks: 297,
            funding_timeout: Duration::from_secs(300),
            miner_tank: 0,
        }
    }
}

/// Scenario runner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Directory of bundled scenario scripts
    pub dir: PathBuf,
    pub commander_image: String,
    /// Interpreter for local runs
    pub python: String,
    /// Working directory for local runs
    pub run_dir: PathBuf,
    /// Wait budget between SIGTERM and SIGKILL
    pub stop_backoff: Backoff,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("resources/scenarios"),
            commander_image: "bitcoindevproject/warnet-commander:latest".to_string(),
            python: "python3".to_string(),
            run_dir: PathBuf::from(".warnet/scenarios"),
            stop_backoff: Backoff {
                max_retries: 5,
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(5),
            },
        }
    }
}

/// Control API server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 9276,
            request_timeout: Duration::from_secs(3600),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
