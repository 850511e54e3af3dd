//! In-memory implementations of the outbound ports.
//!
//! [`ScriptedRunner`] answers orchestrator CLI calls from canned outputs.
//! [`MockBackend`] stands in for a whole orchestrator. [`MockNetwork`] is a
//! small regtest simulation shared by [`MockChain`] and [`MockLightning`]:
//! blocks order mempool transactions by fee rate, funding transactions turn
//! into channels when mined, and policy updates show up in every graph view.

use crate::config::BackendKind;
use crate::domain::channel::{ChannelPoint, LnChannel};
use crate::domain::graph::{ChannelPolicy, LnImpl};
use crate::domain::lightning::LN_P2P_PORT;
use crate::domain::scenario::{CommanderJob, ScenarioStatus};
use crate::domain::status::{RunningStatus, ServiceType};
use crate::domain::tank::{resource_name, TankSpec};
use crate::error::{BackendError, BackendResult, CommandError};
use crate::ports::outbound::{
    Backend, ChainClient, CommandOutput, CommandRunner, ConnectOutcome, JobStatus, LightningNode,
    OpenChannelRequest, ScenarioExecutor,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

const SATS_PER_BLOCK_REWARD: u64 = 50 * 100_000_000;
const COINBASE_MATURITY: u64 = 100;
/// Fee rate of wallet sends made through the mock chain
const SEND_FEE_RATE: u64 = 10;

// =============================================================================
// SCRIPTED COMMAND RUNNER
// =============================================================================

/// Command runner answering from registered `(pattern, output)` rules.
///
/// A call matches a rule when `"program arg arg ..."` contains the pattern.
/// The first registered match wins; unmatched calls succeed with no output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, CommandOutput)>>,
    calls: Mutex<Vec<String>>,
    stdin: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, pattern: impl Into<String>, output: CommandOutput) {
        self.rules.lock().push((pattern.into(), output));
    }

    /// Every command line run so far
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn invoked(&self, pattern: &str) -> bool {
        self.calls.lock().iter().any(|c| c.contains(pattern))
    }

    /// Bodies passed on stdin, in call order
    pub fn stdin_log(&self) -> Vec<Vec<u8>> {
        self.stdin.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> BackendResult<CommandOutput> {
        let line = format!("{program} {}", args.join(" "));
        self.calls.lock().push(line.clone());
        if let Some(body) = stdin {
            self.stdin.lock().push(body);
        }
        let rules = self.rules.lock();
        Ok(rules
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }
}

// =============================================================================
// MOCK BACKEND
// =============================================================================

#[derive(Default)]
struct BackendState {
    deployed: BTreeSet<usize>,
    lightning: BTreeSet<usize>,
    status_polls: HashMap<(usize, ServiceType), u32>,
    failed: HashSet<(usize, ServiceType)>,
    refuse_up: HashSet<usize>,
    unreachable: HashSet<usize>,
    exec_rules: Vec<(String, Result<String, CommandError>)>,
    exec_log: Vec<(usize, ServiceType, String)>,
    ips: HashMap<usize, Ipv4Addr>,
    ip_polls: HashMap<usize, u32>,
    logs: HashMap<(usize, ServiceType), String>,
    up_calls: usize,
    down_calls: usize,
}

/// Orchestrator stand-in tracking deployed tanks in memory.
///
/// Containers report PENDING for `ready_after` status polls after `up`,
/// then RUNNING. Addresses appear after `ip_delay` queries.
pub struct MockBackend {
    kind: BackendKind,
    network: String,
    ready_after: u32,
    ip_delay: u32,
    state: Mutex<BackendState>,
}

impl MockBackend {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            kind: BackendKind::Kubernetes,
            network: network.into(),
            ready_after: 0,
            ip_delay: 0,
            state: Mutex::new(BackendState::default()),
        }
    }

    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_ready_after(mut self, polls: u32) -> Self {
        self.ready_after = polls;
        self
    }

    pub fn with_ip_delay(mut self, queries: u32) -> Self {
        self.ip_delay = queries;
        self
    }

    /// Mark a container as crashed
    pub fn fail(&self, index: usize, service: ServiceType) {
        self.state.lock().failed.insert((index, service));
    }

    /// Make status queries for one tank's containers error out
    pub fn unreachable(&self, index: usize) {
        self.state.lock().unreachable.insert(index);
    }

    /// Make `up` fail for one tank
    pub fn refuse_up(&self, index: usize) {
        self.state.lock().refuse_up.insert(index);
    }

    /// Answer exec commands containing `pattern` with `stdout`
    pub fn respond_exec(&self, pattern: impl Into<String>, stdout: impl Into<String>) {
        self.state.lock().exec_rules.push((pattern.into(), Ok(stdout.into())));
    }

    /// Fail exec commands containing `pattern`
    pub fn fail_exec(&self, pattern: impl Into<String>, exit_code: i32, output: impl Into<String>) {
        self.state.lock().exec_rules.push((
            pattern.into(),
            Err(CommandError {
                exit_code,
                output: output.into(),
            }),
        ));
    }

    pub fn set_ip(&self, index: usize, addr: Ipv4Addr) {
        self.state.lock().ips.insert(index, addr);
    }

    pub fn set_logs(&self, index: usize, service: ServiceType, logs: impl Into<String>) {
        self.state.lock().logs.insert((index, service), logs.into());
    }

    pub fn exec_log(&self) -> Vec<(usize, ServiceType, String)> {
        self.state.lock().exec_log.clone()
    }

    pub fn deployed(&self) -> Vec<usize> {
        self.state.lock().deployed.iter().copied().collect()
    }

    pub fn up_calls(&self) -> usize {
        self.state.lock().up_calls
    }

    pub fn down_calls(&self) -> usize {
        self.state.lock().down_calls
    }

    fn is_deployed(state: &BackendState, index: usize, service: ServiceType) -> bool {
        match service {
            ServiceType::Bitcoin => state.deployed.contains(&index),
            ServiceType::Lightning => state.lightning.contains(&index),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn network_name(&self) -> &str {
        &self.network
    }

    async fn build(&self, tanks: &[TankSpec]) -> BackendResult<bool> {
        Ok(tanks.iter().any(|t| t.build.is_some()))
    }

    async fn up(&self, tanks: &[TankSpec]) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.up_calls += 1;
        let mut failures = Vec::new();
        for tank in tanks {
            if state.refuse_up.contains(&tank.index) {
                failures.push(format!("{}: refused", tank.resource_name(ServiceType::Bitcoin)));
                continue;
            }
            state.deployed.insert(tank.index);
            if tank.ln.is_some() {
                state.lightning.insert(tank.index);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(BackendError::Bulk {
                operation: "up".to_string(),
                failures,
            })
        }
    }

    async fn down(&self, _tanks: &[TankSpec]) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.down_calls += 1;
        state.deployed.clear();
        state.lightning.clear();
        state.status_polls.clear();
        state.ip_polls.clear();
        Ok(())
    }

    async fn get_status(&self, index: usize, service: ServiceType) -> BackendResult<RunningStatus> {
        let mut state = self.state.lock();
        if state.unreachable.contains(&index) {
            return Err(BackendError::NotFound {
                resource: resource_name(&self.network, index, service),
            });
        }
        if !Self::is_deployed(&state, index, service) {
            return Ok(RunningStatus::Stopped);
        }
        if state.failed.contains(&(index, service)) {
            return Ok(RunningStatus::Failed);
        }
        let polls = state.status_polls.entry((index, service)).or_insert(0);
        *polls += 1;
        if *polls > self.ready_after {
            Ok(RunningStatus::Running)
        } else {
            Ok(RunningStatus::Pending)
        }
    }

    async fn exec(&self, index: usize, service: ServiceType, cmd: &str) -> BackendResult<String> {
        let mut state = self.state.lock();
        if !Self::is_deployed(&state, index, service) {
            return Err(BackendError::NotFound {
                resource: resource_name(&self.network, index, service),
            });
        }
        state.exec_log.push((index, service, cmd.to_string()));
        let answer = state
            .exec_rules
            .iter()
            .find(|(pattern, _)| cmd.contains(pattern.as_str()))
            .map(|(_, result)| result.clone());
        match answer {
            Some(Ok(stdout)) => Ok(stdout),
            Some(Err(e)) => Err(e.into()),
            None => Ok(String::new()),
        }
    }

    async fn logs(&self, index: usize, service: ServiceType) -> BackendResult<String> {
        let state = self.state.lock();
        if !Self::is_deployed(&state, index, service) {
            return Err(BackendError::NotFound {
                resource: resource_name(&self.network, index, service),
            });
        }
        Ok(state.logs.get(&(index, service)).cloned().unwrap_or_default())
    }

    async fn tank_ipv4(&self, index: usize) -> BackendResult<Option<Ipv4Addr>> {
        let mut state = self.state.lock();
        if !state.deployed.contains(&index) {
            return Ok(None);
        }
        let polls = state.ip_polls.entry(index).or_insert(0);
        *polls += 1;
        if *polls <= self.ip_delay {
            return Ok(None);
        }
        let fallback = u8::try_from(index % 250).map(|i| Ipv4Addr::new(10, 0, 0, i + 2)).ok();
        Ok(state.ips.get(&index).copied().or(fallback))
    }

    fn lightning_host(&self, tank: &TankSpec) -> String {
        tank.resource_name(ServiceType::Lightning)
    }

    fn generate_deployment(&self, tanks: &[TankSpec]) -> BackendResult<String> {
        let names: Vec<String> = tanks.iter().map(|t| t.resource_name(ServiceType::Bitcoin)).collect();
        Ok(json!({ "tanks": names }).to_string())
    }
}

// =============================================================================
// SIMULATED REGTEST NETWORK
// =============================================================================

struct PendingTx {
    txid: String,
    fee_rate: u64,
    outputs: Vec<(String, u64)>,
    funding: Option<(usize, usize, u64)>,
}

struct SimNode {
    pubkey: String,
    implementation: LnImpl,
    not_ready: u32,
    peers: BTreeSet<usize>,
    addresses: u32,
    spent: u64,
    frozen_policy: bool,
    graph_queries: u32,
}

struct SimChannel {
    scid: String,
    point: ChannelPoint,
    nodes: (usize, usize),
    capacity_sat: u64,
    policies: HashMap<usize, ChannelPolicy>,
}

struct SimState {
    blocks: Vec<Vec<String>>,
    mempool: Vec<PendingTx>,
    next_tx: u64,
    miner_spent: u64,
    credited: HashMap<String, u64>,
    nodes: Vec<SimNode>,
    channels: Vec<SimChannel>,
    opens: usize,
    gossip_delay: u32,
}

/// Shared state of a simulated regtest chain and its Lightning nodes.
pub struct MockNetwork {
    state: Mutex<SimState>,
}

fn default_policy(implementation: LnImpl, capacity_sat: u64) -> ChannelPolicy {
    let cltv = match implementation {
        LnImpl::Lnd => 80,
        LnImpl::Cln => 6,
    };
    ChannelPolicy {
        base_fee_msat: Some(1000),
        fee_rate_ppm: Some(1),
        cltv_expiry_delta: Some(cltv),
        min_htlc_msat: Some(1000),
        max_htlc_msat: Some(capacity_sat * 990),
    }
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState {
                blocks: vec![vec!["genesis".to_string()]],
                mempool: Vec::new(),
                next_tx: 0,
                miner_spent: 0,
                credited: HashMap::new(),
                nodes: Vec::new(),
                channels: Vec::new(),
                opens: 0,
                gossip_delay: 0,
            }),
        })
    }

    /// Add a Lightning node; ids are assigned in call order from 0.
    pub fn add_node(self: &Arc<Self>, implementation: LnImpl) -> Arc<MockLightning> {
        let mut state = self.state.lock();
        let id = state.nodes.len();
        state.nodes.push(SimNode {
            pubkey: format!("02{:064x}", id + 1),
            implementation,
            not_ready: 0,
            peers: BTreeSet::new(),
            addresses: 0,
            spent: 0,
            frozen_policy: false,
            graph_queries: 0,
        });
        Arc::new(MockLightning {
            network: Arc::clone(self),
            id,
            implementation,
        })
    }

    pub fn chain(self: &Arc<Self>) -> Arc<MockChain> {
        Arc::new(MockChain {
            network: Arc::clone(self),
        })
    }

    /// Answer the next `attempts` connects to or from `node` with NotReady
    pub fn set_not_ready(&self, node: usize, attempts: u32) {
        if let Some(n) = self.state.lock().nodes.get_mut(node) {
            n.not_ready = attempts;
        }
    }

    /// Number of graph queries each node answers before it sees confirmed channels
    pub fn set_gossip_delay(&self, queries: u32) {
        self.state.lock().gossip_delay = queries;
    }

    /// Silently ignore policy updates made by `node`
    pub fn freeze_policy(&self, node: usize) {
        if let Some(n) = self.state.lock().nodes.get_mut(node) {
            n.frozen_policy = true;
        }
    }

    pub fn height(&self) -> u64 {
        (self.state.lock().blocks.len() - 1) as u64
    }

    pub fn block(&self, height: u64) -> Option<Vec<String>> {
        usize::try_from(height)
            .ok()
            .and_then(|h| self.state.lock().blocks.get(h).cloned())
    }

    /// Funding transactions broadcast so far
    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub fn mempool_len(&self) -> usize {
        self.state.lock().mempool.len()
    }

    /// Confirmed channels as every node sees them
    pub fn channels(&self) -> Vec<LnChannel> {
        let state = self.state.lock();
        Self::channel_views(&state)
    }

    /// Mine `count` blocks, returning their hashes.
    pub fn mine_blocks(&self, count: u64) -> Vec<String> {
        let mut state = self.state.lock();
        (0..count).map(|_| Self::mine_one(&mut state)).collect()
    }

    /// Put a transaction from outside the scheduler into the mempool.
    pub fn inject_tx(&self, fee_rate: u64) -> String {
        let mut state = self.state.lock();
        let txid = Self::next_txid(&mut state);
        state.mempool.push(PendingTx {
            txid: txid.clone(),
            fee_rate,
            outputs: Vec::new(),
            funding: None,
        });
        txid
    }

    fn next_txid(state: &mut SimState) -> String {
        state.next_tx += 1;
        format!("{:064x}", state.next_tx)
    }

    fn mine_one(state: &mut SimState) -> String {
        let height = state.blocks.len();
        let mut pending = std::mem::take(&mut state.mempool);
        // stable, so equal fee rates keep broadcast order
        pending.sort_by(|a, b| b.fee_rate.cmp(&a.fee_rate));

        let mut txids = vec![format!("coinbase-{height}")];
        for (position, tx) in pending.into_iter().enumerate() {
            for (address, sats) in &tx.outputs {
                *state.credited.entry(address.clone()).or_insert(0) += sats;
            }
            if let Some((from, to, capacity_sat)) = tx.funding {
                state.channels.push(SimChannel {
                    scid: format!("{height}x{}x0", position + 1),
                    point: ChannelPoint {
                        txid: tx.txid.clone(),
                        output: 0,
                    },
                    nodes: (from, to),
                    capacity_sat,
                    policies: HashMap::new(),
                });
            }
            txids.push(tx.txid);
        }
        state.blocks.push(txids);
        format!("blockhash-{height}")
    }

    fn miner_balance(state: &SimState) -> u64 {
        let height = (state.blocks.len() - 1) as u64;
        (height.saturating_sub(COINBASE_MATURITY) * SATS_PER_BLOCK_REWARD).saturating_sub(state.miner_spent)
    }

    fn node_balance(state: &SimState, id: usize) -> u64 {
        let node = &state.nodes[id];
        let prefix = format!("bcrt1q{}-", node.pubkey);
        let received: u64 = state
            .credited
            .iter()
            .filter(|(address, _)| address.starts_with(&prefix))
            .map(|(_, sats)| sats)
            .sum();
        received.saturating_sub(node.spent)
    }

    fn channel_views(state: &SimState) -> Vec<LnChannel> {
        state
            .channels
            .iter()
            .map(|c| {
                let (a, b) = c.nodes;
                let policy = |n: usize| {
                    c.policies
                        .get(&n)
                        .copied()
                        .unwrap_or_else(|| default_policy(state.nodes[n].implementation, c.capacity_sat))
                };
                LnChannel::new(
                    state.nodes[a].pubkey.clone(),
                    state.nodes[b].pubkey.clone(),
                    c.capacity_sat * 1000,
                    c.scid.clone(),
                    Some(policy(a)),
                    Some(policy(b)),
                )
            })
            .collect()
    }

    fn node_by_pubkey(state: &SimState, pubkey: &str) -> BackendResult<usize> {
        state
            .nodes
            .iter()
            .position(|n| n.pubkey == pubkey)
            .ok_or_else(|| BackendError::NotFound {
                resource: format!("node {pubkey}"),
            })
    }
}

// =============================================================================
// MOCK CHAIN CLIENT
// =============================================================================

/// Miner wallet of the simulated chain
pub struct MockChain {
    network: Arc<MockNetwork>,
}

#[async_trait]
impl ChainClient for MockChain {
    async fn ensure_wallet(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn block_count(&self) -> BackendResult<u64> {
        Ok(self.network.height())
    }

    async fn new_address(&self) -> BackendResult<String> {
        Ok("bcrt1qminer".to_string())
    }

    async fn mine(&self, blocks: u64, _address: &str) -> BackendResult<Vec<String>> {
        Ok(self.network.mine_blocks(blocks))
    }

    async fn mempool_size(&self) -> BackendResult<usize> {
        Ok(self.network.mempool_len())
    }

    async fn block_txids(&self, height: u64) -> BackendResult<Vec<String>> {
        self.network.block(height).ok_or_else(|| BackendError::NotFound {
            resource: format!("block {height}"),
        })
    }

    async fn balance_sat(&self) -> BackendResult<u64> {
        Ok(MockNetwork::miner_balance(&self.network.state.lock()))
    }

    async fn send_many(&self, outputs: &[(String, u64)]) -> BackendResult<String> {
        let mut state = self.network.state.lock();
        let total: u64 = outputs.iter().map(|(_, sats)| sats).sum();
        if MockNetwork::miner_balance(&state) < total {
            return Err(CommandError {
                exit_code: 6,
                output: "error code: -6\nInsufficient funds".to_string(),
            }
            .into());
        }
        state.miner_spent += total;
        let txid = MockNetwork::next_txid(&mut state);
        state.mempool.push(PendingTx {
            txid: txid.clone(),
            fee_rate: SEND_FEE_RATE,
            outputs: outputs.to_vec(),
            funding: None,
        });
        Ok(txid)
    }
}

// =============================================================================
// MOCK LIGHTNING NODE
// =============================================================================

/// One Lightning node of a [`MockNetwork`]
pub struct MockLightning {
    network: Arc<MockNetwork>,
    id: usize,
    implementation: LnImpl,
}

impl MockLightning {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pubkey(&self) -> String {
        self.network.state.lock().nodes[self.id].pubkey.clone()
    }
}

#[async_trait]
impl LightningNode for MockLightning {
    fn implementation(&self) -> LnImpl {
        self.implementation
    }

    async fn cli(&self, command: &str) -> BackendResult<Value> {
        match command {
            "getinfo" => Ok(json!({ "identity_pubkey": self.pubkey() })),
            other => Err(CommandError {
                exit_code: 1,
                output: format!("unknown command {other}"),
            }
            .into()),
        }
    }

    async fn new_address(&self) -> BackendResult<String> {
        let mut state = self.network.state.lock();
        let node = &mut state.nodes[self.id];
        node.addresses += 1;
        Ok(format!("bcrt1q{}-{}", node.pubkey, node.addresses))
    }

    async fn pub_key(&self) -> BackendResult<String> {
        Ok(self.pubkey())
    }

    async fn uri(&self) -> BackendResult<Option<String>> {
        Ok(Some(format!("{}@ln-{}:{LN_P2P_PORT}", self.pubkey(), self.id)))
    }

    async fn wallet_balance(&self) -> BackendResult<u64> {
        Ok(MockNetwork::node_balance(&self.network.state.lock(), self.id))
    }

    async fn connect(&self, uri: &str) -> BackendResult<ConnectOutcome> {
        let mut state = self.network.state.lock();
        let pubkey = uri.split('@').next().unwrap_or_default();
        let peer = MockNetwork::node_by_pubkey(&state, pubkey)?;
        for side in [self.id, peer] {
            let node = &mut state.nodes[side];
            if node.not_ready > 0 {
                node.not_ready -= 1;
                return Ok(ConnectOutcome::NotReady(
                    "server is still in the process of starting".to_string(),
                ));
            }
        }
        if !state.nodes[self.id].peers.insert(peer) {
            return Ok(ConnectOutcome::AlreadyConnected);
        }
        state.nodes[peer].peers.insert(self.id);
        Ok(ConnectOutcome::Connected)
    }

    async fn open_channel_to(&self, request: &OpenChannelRequest) -> BackendResult<ChannelPoint> {
        let (pubkey, _) = request.peer()?;
        let mut state = self.network.state.lock();
        let peer = MockNetwork::node_by_pubkey(&state, pubkey)?;
        if MockNetwork::node_balance(&state, self.id) < request.capacity_sat {
            return Err(CommandError {
                exit_code: 1,
                output: "insufficient funds available to construct transaction".to_string(),
            }
            .into());
        }
        state.nodes[self.id].spent += request.capacity_sat;
        state.opens += 1;
        let txid = MockNetwork::next_txid(&mut state);
        state.mempool.push(PendingTx {
            txid: txid.clone(),
            fee_rate: request.fee_rate,
            outputs: Vec::new(),
            funding: Some((self.id, peer, request.capacity_sat)),
        });
        Ok(ChannelPoint { txid, output: 0 })
    }

    async fn update_channel_policy(
        &self,
        point: &ChannelPoint,
        short_chan_id: &str,
        policy: &ChannelPolicy,
    ) -> BackendResult<()> {
        let mut state = self.network.state.lock();
        if state.nodes[self.id].frozen_policy {
            return Ok(());
        }
        let implementation = self.implementation;
        let channel = state
            .channels
            .iter_mut()
            .find(|c| c.point == *point || c.scid == short_chan_id)
            .ok_or_else(|| BackendError::NotFound {
                resource: format!("channel {point}"),
            })?;
        let current = channel
            .policies
            .get(&self.id)
            .copied()
            .unwrap_or_else(|| default_policy(implementation, channel.capacity_sat));
        let mut updated = ChannelPolicy {
            base_fee_msat: policy.base_fee_msat.or(current.base_fee_msat),
            fee_rate_ppm: policy.fee_rate_ppm.or(current.fee_rate_ppm),
            cltv_expiry_delta: policy.cltv_expiry_delta.or(current.cltv_expiry_delta),
            min_htlc_msat: policy.min_htlc_msat.or(current.min_htlc_msat),
            max_htlc_msat: policy.max_htlc_msat.or(current.max_htlc_msat),
        };
        if implementation == LnImpl::Cln {
            updated.cltv_expiry_delta = current.cltv_expiry_delta;
        }
        channel.policies.insert(self.id, updated);
        Ok(())
    }

    fn effective_policy(&self, declared: &ChannelPolicy) -> ChannelPolicy {
        match self.implementation {
            LnImpl::Lnd => *declared,
            LnImpl::Cln => ChannelPolicy {
                cltv_expiry_delta: None,
                ..*declared
            },
        }
    }

    async fn graph_nodes(&self) -> BackendResult<Vec<String>> {
        let state = self.network.state.lock();
        Ok(state.nodes.iter().map(|n| n.pubkey.clone()).collect())
    }

    async fn graph_channels(&self) -> BackendResult<Vec<LnChannel>> {
        let mut state = self.network.state.lock();
        let delay = state.gossip_delay;
        let node = &mut state.nodes[self.id];
        node.graph_queries += 1;
        if node.graph_queries <= delay {
            return Ok(Vec::new());
        }
        Ok(MockNetwork::channel_views(&state))
    }

    async fn peers(&self) -> BackendResult<Vec<String>> {
        let state = self.network.state.lock();
        Ok(state.nodes[self.id]
            .peers
            .iter()
            .map(|p| state.nodes[*p].pubkey.clone())
            .collect())
    }

    async fn export(&self, id: &str, host: &str, _dir: &Path) -> BackendResult<Value> {
        Ok(json!({ "id": id, "address": format!("https://{host}:10009") }))
    }
}

// =============================================================================
// MOCK SCENARIO EXECUTOR
// =============================================================================

#[derive(Default)]
struct ExecutorState {
    next_id: u64,
    jobs: BTreeMap<String, JobStatus>,
    launched: Vec<CommanderJob>,
    stopped: Vec<String>,
    stubborn: HashSet<String>,
}

/// Executor keeping jobs in memory; tests drive them to completion.
#[derive(Default)]
pub struct MockExecutor {
    state: Mutex<ExecutorState>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a job to a final status
    pub fn finish(&self, job_id: &str, status: ScenarioStatus, return_code: i32) {
        if let Some(job) = self.state.lock().jobs.get_mut(job_id) {
            job.status = status;
            job.return_code = Some(return_code);
        }
    }

    /// Drop a job as if the orchestrator garbage-collected it
    pub fn forget(&self, job_id: &str) {
        self.state.lock().jobs.remove(job_id);
    }

    /// Make `stop` fail for a job that keeps running
    pub fn stubborn(&self, job_id: &str) {
        self.state.lock().stubborn.insert(job_id.to_string());
    }

    pub fn launched(&self) -> Vec<CommanderJob> {
        self.state.lock().launched.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().stopped.clone()
    }
}

#[async_trait]
impl ScenarioExecutor for MockExecutor {
    async fn launch(&self, job: &CommanderJob) -> BackendResult<String> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let job_id = format!("{}-{}", job.name, state.next_id);
        state.jobs.insert(
            job_id.clone(),
            JobStatus {
                job_id: job_id.clone(),
                name: job.name.clone(),
                status: ScenarioStatus::Running,
                return_code: None,
            },
        );
        state.launched.push(job.clone());
        Ok(job_id)
    }

    async fn status(&self, job_id: &str) -> BackendResult<Option<JobStatus>> {
        Ok(self.state.lock().jobs.get(job_id).cloned())
    }

    async fn list(&self) -> BackendResult<Vec<JobStatus>> {
        Ok(self.state.lock().jobs.values().cloned().collect())
    }

    async fn stop(&self, job_id: &str) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.stubborn.contains(job_id) {
            return Err(BackendError::Command(CommandError {
                exit_code: 1,
                output: format!("job {job_id} did not terminate"),
            }));
        }
        if state.jobs.remove(job_id).is_none() {
            return Err(BackendError::NotFound {
                resource: format!("job {job_id}"),
            });
        }
        state.stopped.push(job_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_runner_first_match_wins() {
        let runner = ScriptedRunner::new();
        runner.respond(
            "get pod",
            CommandOutput {
                exit_code: 1,
                ..Default::default()
            },
        );
        runner.respond("get", CommandOutput::default());
        let out = runner.run("kubectl", &["get".into(), "pod".into()], None).await.unwrap();
        assert_eq!(out.exit_code, 1);
        let out = runner.run("kubectl", &["get".into(), "svc".into()], None).await.unwrap();
        assert!(out.success());
        assert!(runner.invoked("kubectl get svc"));
    }

    #[tokio::test]
    async fn test_blocks_order_by_fee_rate() {
        let network = MockNetwork::new();
        let chain = network.chain();
        let a = network.add_node(LnImpl::Lnd);
        let b = network.add_node(LnImpl::Lnd);
        network.mine_blocks(101);
        let addr = a.new_address().await.unwrap();
        chain.send_many(&[(addr, 1_000_000)]).await.unwrap();
        network.mine_blocks(1);

        let uri = b.uri().await.unwrap().unwrap();
        let slow = a
            .open_channel_to(&OpenChannelRequest {
                peer_uri: uri.clone(),
                capacity_sat: 100_000,
                push_sat: 0,
                fee_rate: 5,
            })
            .await
            .unwrap();
        let fast = a
            .open_channel_to(&OpenChannelRequest {
                peer_uri: uri,
                capacity_sat: 100_000,
                push_sat: 0,
                fee_rate: 9,
            })
            .await
            .unwrap();
        network.mine_blocks(1);
        let block = network.block(103).unwrap();
        assert_eq!(block[1], fast.txid);
        assert_eq!(block[2], slow.txid);
        assert_eq!(network.channels().len(), 2);
    }

    #[tokio::test]
    async fn test_not_ready_then_connected() {
        let network = MockNetwork::new();
        let a = network.add_node(LnImpl::Cln);
        let b = network.add_node(LnImpl::Lnd);
        network.set_not_ready(1, 1);
        let uri = b.uri().await.unwrap().unwrap();
        assert!(matches!(a.connect(&uri).await.unwrap(), ConnectOutcome::NotReady(_)));
        assert_eq!(a.connect(&uri).await.unwrap(), ConnectOutcome::Connected);
        assert_eq!(a.connect(&uri).await.unwrap(), ConnectOutcome::AlreadyConnected);
        assert_eq!(b.peers().await.unwrap(), vec![a.pubkey()]);
    }
}
