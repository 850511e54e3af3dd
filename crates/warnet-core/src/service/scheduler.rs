//! Channel open scheduler.
//!
//! Opens every declared channel so that its funding transaction confirms at
//! the declared `(block, index)`, which fixes its short channel id ahead of
//! time. Miners order a block by fee rate, so channels of one block get
//! strictly decreasing fee rates in index order:
//!
//! ```text
//!   index:     1      2      3    ...
//!   fee rate:  5006   5001   4996 ...   (ceiling - step * (index - 1))
//!   block:     [coinbase, tx1, tx2, tx3, ...]
//! ```
//!
//! Stages run strictly one after another; inside a stage work fans out on a
//! `JoinSet` that is drained before the next stage starts.
//!
//! ```text
//! plan ─→ fund ─→ connect peers ─→ per block: mine to H-1, open, confirm ─→ gossip ─→ policies
//! ```

use crate::config::SchedulerConfig;
use crate::domain::channel::{policy_satisfies, ChannelPoint};
use crate::domain::graph::{ChannelEdge, ChannelId, ChannelPolicy};
use crate::error::{SchedulerError, SchedulerResult};
use crate::polling::{poll_attempts, poll_until};
use crate::ports::outbound::{ChainClient, ConnectOutcome, LightningNode, OpenChannelRequest};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// A channel that confirmed at its declared position
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenedChannel {
    pub source: usize,
    pub target: usize,
    pub id: ChannelId,
    pub point: ChannelPoint,
    pub short_chan_id: String,
    pub fee_rate: u64,
}

/// Outcome of a full scheduling run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleReport {
    pub channels: Vec<OpenedChannel>,
    pub policies_applied: usize,
}

/// One channel of the validated plan
#[derive(Debug, Clone)]
struct PlannedChannel {
    edge: ChannelEdge,
    fee_rate: u64,
}

pub struct ChannelOpenScheduler {
    config: SchedulerConfig,
    miner: Arc<dyn ChainClient>,
    nodes: BTreeMap<usize, Arc<dyn LightningNode>>,
}

async fn drain<T: 'static>(set: &mut JoinSet<SchedulerResult<T>>) -> SchedulerResult<Vec<T>> {
    let mut results = Vec::with_capacity(set.len());
    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(value)) => results.push(value),
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(SchedulerError::Task(e.to_string()));
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

impl ChannelOpenScheduler {
    pub fn new(
        config: SchedulerConfig,
        miner: Arc<dyn ChainClient>,
        nodes: BTreeMap<usize, Arc<dyn LightningNode>>,
    ) -> Self {
        Self { config, miner, nodes }
    }

    /// Fee rate of the channel with 1-based `index` in its block
    pub fn fee_rate_for(&self, index: u32) -> Option<u64> {
        let steps = u64::from(index.checked_sub(1)?);
        self.config
            .fee_ceiling
            .checked_sub(self.config.fee_step.checked_mul(steps)?)
            .filter(|fee| *fee >= self.config.fee_floor)
    }

    fn node(&self, index: usize) -> SchedulerResult<Arc<dyn LightningNode>> {
        self.nodes
            .get(&index)
            .cloned()
            .ok_or(SchedulerError::MissingLightning { index })
    }

    /// Group channels by block and assign fee rates, failing before anything
    /// is broadcast if the plan cannot be realized.
    fn plan(&self, edges: &[ChannelEdge]) -> SchedulerResult<BTreeMap<u64, Vec<PlannedChannel>>> {
        let mut by_block: BTreeMap<u64, Vec<&ChannelEdge>> = BTreeMap::new();
        for edge in edges {
            self.node(edge.source)?;
            self.node(edge.target)?;
            by_block.entry(edge.id.block).or_default().push(edge);
        }

        let mut plan = BTreeMap::new();
        for (block, mut group) in by_block {
            group.sort_by_key(|e| e.id.index);
            let mut planned = Vec::with_capacity(group.len());
            for (position, edge) in group.into_iter().enumerate() {
                let expected = position as u32 + 1;
                if edge.id.index != expected {
                    return Err(SchedulerError::IndexGap {
                        block,
                        expected,
                        found: edge.id.index,
                    });
                }
                let fee_rate = self.fee_rate_for(edge.id.index).ok_or_else(|| SchedulerError::FeeFloor {
                    block,
                    index: edge.id.index,
                    fee_rate: self
                        .config
                        .fee_ceiling
                        .saturating_sub(self.config.fee_step.saturating_mul(u64::from(edge.id.index - 1))),
                    floor: self.config.fee_floor,
                })?;
                planned.push(PlannedChannel {
                    edge: edge.clone(),
                    fee_rate,
                });
            }
            plan.insert(block, planned);
        }
        Ok(plan)
    }

    /// Run every stage for `edges`.
    #[instrument(skip(self, edges), fields(channels = edges.len(), nodes = self.nodes.len()))]
    pub async fn run(&self, edges: &[ChannelEdge]) -> SchedulerResult<ScheduleReport> {
        let plan = self.plan(edges)?;
        if plan.is_empty() {
            info!("no channels declared");
            return Ok(ScheduleReport::default());
        }

        self.miner.ensure_wallet().await?;
        if self.config.fund_wallets {
            self.fund_wallets().await?;
        }
        let pubkeys = self.connect_peers(edges).await?;

        let mut report = ScheduleReport::default();
        for (block, group) in &plan {
            let opened = self.open_block(*block, group).await?;
            report.channels.extend(opened);
        }

        self.wait_for_gossip(report.channels.len()).await?;
        report.policies_applied = self.apply_policies(&report.channels, edges, &pubkeys).await?;
        info!(channels = report.channels.len(), "all channels open at their declared positions");
        Ok(report)
    }

    // =========================================================================
    // FUNDING
    // =========================================================================

    /// Mine spendable coinbase, split it across every LN wallet and wait for
    /// nodes to see their funds and announce an address.
    async fn fund_wallets(&self) -> SchedulerResult<()> {
        let address = self.miner.new_address().await?;
        let height = self.miner.block_count().await?;
        if height < self.config.maturity_blocks {
            self.miner.mine(self.config.maturity_blocks - height, &address).await?;
        }

        let mut set = JoinSet::new();
        for (index, node) in &self.nodes {
            let (index, node) = (*index, Arc::clone(node));
            set.spawn(async move { Ok::<_, SchedulerError>((index, node.new_address().await?)) });
        }
        let addresses = drain(&mut set).await?;

        let balance = self.miner.balance_sat().await?;
        // one share stays with the miner for fees
        let share = balance / (addresses.len() as u64 + 1);
        let outputs: Vec<(String, u64)> = addresses.iter().map(|(_, a)| (a.clone(), share)).collect();
        let txid = self.miner.send_many(&outputs).await?;
        self.miner.mine(1, &address).await?;
        info!(%txid, share, wallets = outputs.len(), "funded lightning wallets");

        let mut set = JoinSet::new();
        for (index, node) in &self.nodes {
            let (index, node) = (*index, Arc::clone(node));
            let (interval, timeout) = (self.config.poll_interval, self.config.funding_timeout);
            set.spawn(async move {
                let predicate = format!("tank {index} confirmed balance and uri");
                poll_until(&predicate, interval, timeout, || {
                    let node = Arc::clone(&node);
                    async move {
                        let funded = matches!(node.wallet_balance().await, Ok(b) if b > 0);
                        funded && matches!(node.uri().await, Ok(Some(_)))
                    }
                })
                .await?;
                Ok::<_, SchedulerError>(())
            });
        }
        drain(&mut set).await?;
        Ok(())
    }

    // =========================================================================
    // PEER CONNECTION
    // =========================================================================

    /// Ring over all LN nodes plus every channel edge, one unordered pair each
    fn peer_pairs(&self, edges: &[ChannelEdge]) -> Vec<(usize, usize)> {
        let indices: Vec<usize> = self.nodes.keys().copied().collect();
        let mut seen = BTreeSet::new();
        let mut pairs = Vec::new();
        let mut add = |a: usize, b: usize| {
            if a != b && seen.insert((a.min(b), a.max(b))) {
                pairs.push((a, b));
            }
        };
        if indices.len() > 1 {
            for (i, from) in indices.iter().enumerate() {
                add(*from, indices[(i + 1) % indices.len()]);
            }
        }
        for edge in edges {
            add(edge.source, edge.target);
        }
        pairs
    }

    /// Connect every pair; returns each node's pubkey.
    async fn connect_peers(&self, edges: &[ChannelEdge]) -> SchedulerResult<BTreeMap<usize, String>> {
        let pairs = self.peer_pairs(edges);
        let mut set = JoinSet::new();
        for (slot, (from, to)) in pairs.iter().copied().enumerate() {
            let source = self.node(from)?;
            let target = self.node(to)?;
            let delay = self.config.connect_stagger.saturating_mul(slot as u32);
            let attempts = self.config.connect_attempts.max(1);
            let interval = self.config.poll_interval;
            set.spawn(async move {
                tokio::time::sleep(delay).await;
                connect_pair(source, target, from, to, attempts, interval).await
            });
        }
        drain(&mut set).await?;
        info!(pairs = pairs.len(), "lightning peers connected");

        let mut set = JoinSet::new();
        for (index, node) in &self.nodes {
            let (index, node) = (*index, Arc::clone(node));
            set.spawn(async move { Ok::<_, SchedulerError>((index, node.pub_key().await?)) });
        }
        Ok(drain(&mut set).await?.into_iter().collect())
    }

    // =========================================================================
    // OPEN AND CONFIRM
    // =========================================================================

    /// Open one block's channels and confirm them at their indices.
    #[instrument(skip(self, group), fields(channels = group.len()))]
    async fn open_block(&self, block: u64, group: &[PlannedChannel]) -> SchedulerResult<Vec<OpenedChannel>> {
        let height = self.miner.block_count().await?;
        let before = block.saturating_sub(1);
        if height > before {
            return Err(SchedulerError::Overshoot { target: block, height });
        }
        if height < before {
            let address = self.miner.new_address().await?;
            self.miner.mine(before - height, &address).await?;
            debug!(from = height, to = before, "mined up to the block before target");
        }

        let mut set = JoinSet::new();
        for planned in group {
            let source = self.node(planned.edge.source)?;
            let target = self.node(planned.edge.target)?;
            let planned = planned.clone();
            set.spawn(async move {
                let peer_uri = target.uri().await?.ok_or(SchedulerError::PeerConnect {
                    from: planned.edge.source,
                    to: planned.edge.target,
                    reason: "peer has no advertised uri".to_string(),
                })?;
                let point = source
                    .open_channel_to(&OpenChannelRequest {
                        peer_uri,
                        capacity_sat: planned.edge.capacity_sat,
                        push_sat: planned.edge.push_amt_sat,
                        fee_rate: planned.fee_rate,
                    })
                    .await?;
                debug!(id = %planned.edge.id, %point, fee_rate = planned.fee_rate, "funding broadcast");
                Ok::<_, SchedulerError>((planned, point))
            });
        }
        let mut broadcast = drain(&mut set).await?;
        broadcast.sort_by_key(|(planned, _)| planned.edge.id.index);

        let expected = group.len();
        let miner = Arc::clone(&self.miner);
        poll_until(
            &format!("{expected} funding transactions in mempool"),
            self.config.poll_interval,
            self.config.mempool_timeout,
            || {
                let miner = Arc::clone(&miner);
                async move { matches!(miner.mempool_size().await, Ok(size) if size >= expected) }
            },
        )
        .await?;
        let address = self.miner.new_address().await?;
        self.miner.mine(1, &address).await?;

        let txids = self.miner.block_txids(block).await?;
        let mut opened = Vec::with_capacity(broadcast.len());
        for (planned, point) in broadcast {
            let index = planned.edge.id.index;
            let observed = txids.get(index as usize);
            if observed != Some(&point.txid) {
                return Err(SchedulerError::SchedulingInvariant {
                    block,
                    index,
                    expected: point.txid,
                    observed: observed.cloned(),
                });
            }
            opened.push(OpenedChannel {
                source: planned.edge.source,
                target: planned.edge.target,
                short_chan_id: planned.edge.id.short_channel_id(point.output),
                id: planned.edge.id,
                point,
                fee_rate: planned.fee_rate,
            });
        }
        info!(block, channels = opened.len(), "block confirmed with channels in order");
        Ok(opened)
    }

    // =========================================================================
    // GOSSIP
    // =========================================================================

    async fn wait_for_gossip(&self, channels: usize) -> SchedulerResult<()> {
        let node_count = self.nodes.len();
        let mut set = JoinSet::new();
        for (index, node) in &self.nodes {
            let (index, node) = (*index, Arc::clone(node));
            let (interval, attempts) = (self.config.poll_interval, self.config.gossip_attempts);
            set.spawn(async move {
                let converged = poll_attempts("gossip", interval, attempts, || {
                    let node = Arc::clone(&node);
                    async move {
                        let edges = node.graph_channels().await.ok()?.len();
                        let nodes = node.graph_nodes().await.ok()?.len();
                        debug!(index, edges, nodes, "graph view");
                        (edges == channels && nodes == node_count).then_some(())
                    }
                })
                .await;
                Ok::<_, SchedulerError>((index, converged.is_ok()))
            });
        }
        let incomplete: Vec<String> = drain(&mut set)
            .await?
            .into_iter()
            .filter(|(_, done)| !done)
            .map(|(index, _)| format!("tank {index}"))
            .collect();
        if incomplete.is_empty() {
            info!(channels, nodes = node_count, "gossip converged");
            Ok(())
        } else {
            Err(SchedulerError::GossipIncomplete { nodes: incomplete })
        }
    }

    // =========================================================================
    // POLICIES
    // =========================================================================

    /// Push declared policies, then wait until every node's graph shows them.
    async fn apply_policies(
        &self,
        opened: &[OpenedChannel],
        edges: &[ChannelEdge],
        pubkeys: &BTreeMap<usize, String>,
    ) -> SchedulerResult<usize> {
        let declared: BTreeMap<ChannelId, &ChannelEdge> = edges.iter().map(|e| (e.id, e)).collect();

        // (setter, channel, policy)
        let mut updates: Vec<(usize, &OpenedChannel, ChannelPolicy)> = Vec::new();
        for channel in opened {
            let Some(edge) = declared.get(&channel.id) else {
                continue;
            };
            if let Some(policy) = edge.source_policy {
                updates.push((channel.source, channel, policy));
            }
            if let Some(policy) = edge.target_policy {
                updates.push((channel.target, channel, policy));
            }
        }
        if updates.is_empty() {
            return Ok(0);
        }

        let mut set = JoinSet::new();
        for (setter, channel, policy) in &updates {
            let node = self.node(*setter)?;
            let (point, scid, policy) = (channel.point.clone(), channel.short_chan_id.clone(), *policy);
            set.spawn(async move {
                node.update_channel_policy(&point, &scid, &policy).await?;
                Ok::<_, SchedulerError>(())
            });
        }
        drain(&mut set).await?;

        // what each setter can actually advertise
        let mut expectations = Vec::with_capacity(updates.len());
        for (setter, channel, policy) in &updates {
            let pubkey = pubkeys.get(setter).cloned().unwrap_or_default();
            let effective = self.node(*setter)?.effective_policy(policy);
            expectations.push((channel.short_chan_id.clone(), pubkey, effective));
        }
        let expectations = Arc::new(expectations);

        let mut set = JoinSet::new();
        for (index, node) in &self.nodes {
            let (index, node) = (*index, Arc::clone(node));
            let expectations = Arc::clone(&expectations);
            let (interval, attempts) = (self.config.poll_interval, self.config.policy_attempts);
            set.spawn(async move {
                let outcome = poll_attempts("policies", interval, attempts, || {
                    let node = Arc::clone(&node);
                    let expectations = Arc::clone(&expectations);
                    async move {
                        let graph = node.graph_channels().await.ok()?;
                        policy_mismatches(&graph, &expectations).is_empty().then_some(())
                    }
                })
                .await;
                if outcome.is_ok() {
                    return Ok::<_, SchedulerError>(Vec::new());
                }
                let graph = node.graph_channels().await.unwrap_or_default();
                Ok(policy_mismatches(&graph, &expectations)
                    .into_iter()
                    .map(|m| format!("tank {index}: {m}"))
                    .collect::<Vec<_>>())
            });
        }
        let mismatches: Vec<String> = drain(&mut set).await?.into_iter().flatten().collect();
        if mismatches.is_empty() {
            info!(updates = updates.len(), "channel policies converged");
            Ok(updates.len())
        } else {
            Err(SchedulerError::PolicyMismatch { mismatches })
        }
    }
}

/// Expectations `(scid, setter pubkey, policy)` not satisfied by `graph`
fn policy_mismatches(
    graph: &[crate::domain::channel::LnChannel],
    expectations: &[(String, String, ChannelPolicy)],
) -> Vec<String> {
    expectations
        .iter()
        .filter(|(scid, pubkey, declared)| {
            // policy_of resolves the direction by pubkey, so swapped endpoints still match
            let observed = graph
                .iter()
                .find(|c| &c.short_chan_id == scid)
                .and_then(|c| c.policy_of(pubkey));
            !observed.is_some_and(|o| policy_satisfies(o, declared))
        })
        .map(|(scid, pubkey, _)| format!("{scid} from {pubkey}"))
        .collect()
}

/// Connect `source` to `target`, retrying while either side is still starting.
async fn connect_pair(
    source: Arc<dyn LightningNode>,
    target: Arc<dyn LightningNode>,
    from: usize,
    to: usize,
    attempts: u32,
    interval: Duration,
) -> SchedulerResult<()> {
    let mut last = String::new();
    for attempt in 1..=attempts {
        let uri = match target.uri().await {
            Ok(Some(uri)) => uri,
            Ok(None) => {
                last = "peer has no advertised uri yet".to_string();
                tokio::time::sleep(interval).await;
                continue;
            }
            Err(e) => {
                last = e.to_string();
                tokio::time::sleep(interval).await;
                continue;
            }
        };
        match source.connect(&uri).await {
            Ok(ConnectOutcome::Connected) | Ok(ConnectOutcome::AlreadyConnected) => {
                debug!(from, to, attempt, "peers connected");
                return Ok(());
            }
            Ok(ConnectOutcome::NotReady(reason)) => {
                debug!(from, to, attempt, %reason, "peer not ready");
                last = reason;
                tokio::time::sleep(interval).await;
            }
            Err(e) => {
                return Err(SchedulerError::PeerConnect {
                    from,
                    to,
                    reason: e.to_string(),
                })
            }
        }
    }
    warn!(from, to, attempts, "giving up on peer connection");
    Err(SchedulerError::PeerConnect {
        from,
        to,
        reason: format!("not ready after {attempts} attempts: {last}"),
    })
}
