//! Outbound ports (SPI) of the engine.
//!
//! Everything that leaves the process goes through one of these traits:
//! orchestrator calls ([`Backend`] over a [`CommandRunner`]), Lightning and
//! bitcoind RPC ([`LightningNode`], [`ChainClient`]) and scenario jobs
//! ([`ScenarioExecutor`]). Services only ever hold `Arc<dyn _>` handles.

use crate::config::BackendKind;
use crate::domain::channel::{ChannelPoint, LnChannel};
use crate::domain::graph::{ChannelPolicy, LnImpl};
use crate::domain::messages::{parse_capture, MessageRecord};
use crate::domain::scenario::{CommanderJob, ScenarioStatus};
use crate::domain::status::{RunningStatus, ServiceType};
use crate::domain::tank::TankSpec;
use crate::error::{BackendError, BackendResult, CommandError};
use crate::polling::poll_until;
use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Directory bitcoind writes `-capturemessages` output to
pub const MESSAGE_CAPTURE_DIR: &str = "/root/.bitcoin/regtest/message_capture";

// =============================================================================
// PROCESS EXECUTION
// =============================================================================

/// Output of one external command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    /// stdout on success, `CommandError` otherwise
    pub fn into_stdout(self) -> Result<String, CommandError> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(CommandError {
                exit_code: self.exit_code,
                output: self.combined().trim().to_string(),
            })
        }
    }
}

/// Runs orchestrator CLIs (`kubectl`, `docker`) on the host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion. A non-zero exit is reported in the output,
    /// not as an error; only failure to spawn is an `Err`.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> BackendResult<CommandOutput>;
}

// =============================================================================
// BACKEND
// =============================================================================

/// Which containers a log search covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogScope {
    Bitcoin,
    Lightning,
    All,
}

impl LogScope {
    fn services(self) -> &'static [ServiceType] {
        match self {
            LogScope::Bitcoin => &[ServiceType::Bitcoin],
            LogScope::Lightning => &[ServiceType::Lightning],
            LogScope::All => &[ServiceType::Bitcoin, ServiceType::Lightning],
        }
    }
}

/// One log line matching a search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMatch {
    pub tank: usize,
    pub service: ServiceType,
    pub line: String,
}

/// The only component that talks to the orchestrator.
///
/// Every operation is keyed by `(tank index, service)`. Bulk lifecycle calls
/// take the full tank list and must tolerate a partially deployed network.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn network_name(&self) -> &str;

    /// Prepare images. Returns true when anything was built.
    async fn build(&self, tanks: &[TankSpec]) -> BackendResult<bool>;

    /// Create all resources, bitcoin before lightning.
    async fn up(&self, tanks: &[TankSpec]) -> BackendResult<()>;

    /// Remove all resources, collecting failures.
    async fn down(&self, tanks: &[TankSpec]) -> BackendResult<()>;

    /// Live status, never cached.
    async fn get_status(&self, index: usize, service: ServiceType) -> BackendResult<RunningStatus>;

    /// Run a shell command in the container. A non-zero exit is a `CommandError`.
    async fn exec(&self, index: usize, service: ServiceType, cmd: &str) -> BackendResult<String>;

    /// Container stdout/stderr with timestamps
    async fn logs(&self, index: usize, service: ServiceType) -> BackendResult<String>;

    /// Observed address of the tank's bitcoin container, if it has one yet
    async fn tank_ipv4(&self, index: usize) -> BackendResult<Option<Ipv4Addr>>;

    /// Host other containers use to reach the tank's lightning node
    fn lightning_host(&self, tank: &TankSpec) -> String;

    /// Rendered deployment description (manifests or compose file)
    fn generate_deployment(&self, tanks: &[TankSpec]) -> BackendResult<String>;

    /// Read a file out of a container.
    async fn get_file(&self, index: usize, service: ServiceType, path: &str) -> BackendResult<Vec<u8>> {
        let cmd = format!("cat {} | base64 | tr -d '\\n'", crate::domain::tank::shell_quote(path));
        let encoded = self.exec(index, service, &cmd).await?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| BackendError::parse(format!("base64 contents of {path}"), e))
    }

    /// P2P messages tank `index` exchanged with the peer at `peer`, sorted by time.
    async fn get_messages(&self, index: usize, peer: Ipv4Addr) -> BackendResult<Vec<MessageRecord>> {
        let listing = self
            .exec(index, ServiceType::Bitcoin, &format!("ls {MESSAGE_CAPTURE_DIR}"))
            .await?;
        let peer = peer.to_string();
        let Some(dir) = listing
            .split_whitespace()
            .find(|name| name.split(['_', ':']).next() == Some(peer.as_str()))
        else {
            debug!(index, peer = %peer, "no message capture for peer");
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for (file, outbound) in [("msgs_recv.dat", false), ("msgs_sent.dat", true)] {
            let path = format!("{MESSAGE_CAPTURE_DIR}/{dir}/{file}");
            match self.get_file(index, ServiceType::Bitcoin, &path).await {
                Ok(data) => records.extend(parse_capture(&data, outbound)),
                Err(BackendError::Command(e)) => debug!(path, error = %e, "capture file unavailable"),
                Err(e) => return Err(e),
            }
        }
        records.sort_by_key(|r| r.time);
        Ok(records)
    }

    /// Search container logs of `tanks` for `pattern`.
    ///
    /// Containers whose logs cannot be read are skipped with a warning.
    async fn logs_grep(
        &self,
        tanks: &[TankSpec],
        pattern: &Regex,
        scope: LogScope,
    ) -> BackendResult<Vec<LogMatch>> {
        let mut matches = Vec::new();
        for tank in tanks {
            for service in scope.services() {
                if *service == ServiceType::Lightning && tank.ln.is_none() {
                    continue;
                }
                let logs = match self.logs(tank.index, *service).await {
                    Ok(logs) => logs,
                    Err(e) => {
                        warn!(index = tank.index, %service, error = %e, "skipping unreadable logs");
                        continue;
                    }
                };
                matches.extend(logs.lines().filter(|l| pattern.is_match(l)).map(|line| LogMatch {
                    tank: tank.index,
                    service: *service,
                    line: line.to_string(),
                }));
            }
        }
        Ok(matches)
    }

    /// Poll until every tank's Bitcoin container is running. Lightning
    /// readiness is left to the channel scheduler's own polling.
    async fn wait_for_healthy(
        &self,
        tanks: &[TankSpec],
        interval: Duration,
        timeout: Duration,
    ) -> BackendResult<()> {
        poll_until("all tanks running", interval, timeout, || async move {
            for tank in tanks {
                match self.get_status(tank.index, ServiceType::Bitcoin).await {
                    Ok(status) if status.is_running() => {}
                    Ok(status) => {
                        debug!(index = tank.index, %status, "not healthy yet");
                        return false;
                    }
                    Err(e) => {
                        debug!(index = tank.index, error = %e, "status query failed");
                        return false;
                    }
                }
            }
            true
        })
        .await?;
        Ok(())
    }
}

// =============================================================================
// LIGHTNING
// =============================================================================

/// Result of asking a node to connect to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    AlreadyConnected,
    /// Either side is still starting; worth retrying
    NotReady(String),
}

/// Parameters of one channel open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenChannelRequest {
    /// `pubkey@host:port` of the remote node
    pub peer_uri: String,
    pub capacity_sat: u64,
    pub push_sat: u64,
    /// Funding transaction fee rate in sat/vB
    pub fee_rate: u64,
}

impl OpenChannelRequest {
    /// Split the URI into pubkey and address
    pub fn peer(&self) -> BackendResult<(&str, &str)> {
        self.peer_uri
            .split_once('@')
            .ok_or_else(|| BackendError::parse("peer uri", format!("{:?} has no '@'", self.peer_uri)))
    }
}

/// Operations on one Lightning node, independent of implementation.
#[async_trait]
pub trait LightningNode: Send + Sync {
    fn implementation(&self) -> LnImpl;

    /// Raw CLI call, e.g. `getinfo`, returning its JSON output
    async fn cli(&self, command: &str) -> BackendResult<Value>;

    async fn new_address(&self) -> BackendResult<String>;

    async fn pub_key(&self) -> BackendResult<String>;

    /// Advertised `pubkey@host:port`, None until the node announces one
    async fn uri(&self) -> BackendResult<Option<String>>;

    /// Confirmed on-chain balance in sats
    async fn wallet_balance(&self) -> BackendResult<u64>;

    async fn connect(&self, uri: &str) -> BackendResult<ConnectOutcome>;

    /// Broadcast a funding transaction, returning its outpoint.
    async fn open_channel_to(&self, request: &OpenChannelRequest) -> BackendResult<ChannelPoint>;

    /// Set this node's side of a channel's forwarding policy.
    async fn update_channel_policy(
        &self,
        point: &ChannelPoint,
        short_chan_id: &str,
        policy: &ChannelPolicy,
    ) -> BackendResult<()>;

    /// The part of `declared` this implementation can set per channel
    fn effective_policy(&self, declared: &ChannelPolicy) -> ChannelPolicy {
        *declared
    }

    /// Pubkeys of every node in this node's graph view
    async fn graph_nodes(&self) -> BackendResult<Vec<String>>;

    /// Every channel in this node's graph view, one entry per channel
    async fn graph_channels(&self) -> BackendResult<Vec<LnChannel>>;

    /// Pubkeys of connected peers
    async fn peers(&self) -> BackendResult<Vec<String>>;

    /// Copy credentials into `dir` and return this node's SimLN entry.
    async fn export(&self, id: &str, host: &str, dir: &Path) -> BackendResult<Value>;
}

// =============================================================================
// CHAIN
// =============================================================================

/// Wallet and chain queries against one bitcoind.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Create or load the wallet used for mining and funding
    async fn ensure_wallet(&self) -> BackendResult<()>;

    async fn block_count(&self) -> BackendResult<u64>;

    async fn new_address(&self) -> BackendResult<String>;

    /// Mine `blocks` to `address`, returning the block hashes.
    async fn mine(&self, blocks: u64, address: &str) -> BackendResult<Vec<String>>;

    /// Transactions currently in the mempool
    async fn mempool_size(&self) -> BackendResult<usize>;

    /// Txids of the block at `height`, coinbase first
    async fn block_txids(&self, height: u64) -> BackendResult<Vec<String>>;

    /// Spendable wallet balance in sats
    async fn balance_sat(&self) -> BackendResult<u64>;

    /// Pay every `(address, sats)` in one transaction, returning its txid.
    async fn send_many(&self, outputs: &[(String, u64)]) -> BackendResult<String>;
}

// =============================================================================
// SCENARIOS
// =============================================================================

/// Status of one job as reported by an executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub job_id: String,
    pub name: String,
    pub status: ScenarioStatus,
    pub return_code: Option<i32>,
}

/// Schedules and inspects ephemeral scenario jobs.
#[async_trait]
pub trait ScenarioExecutor: Send + Sync {
    /// Start `job`, returning its id.
    async fn launch(&self, job: &CommanderJob) -> BackendResult<String>;

    /// None once the job no longer exists
    async fn status(&self, job_id: &str) -> BackendResult<Option<JobStatus>>;

    /// Every job this executor knows about
    async fn list(&self) -> BackendResult<Vec<JobStatus>>;

    async fn stop(&self, job_id: &str) -> BackendResult<()>;
}
