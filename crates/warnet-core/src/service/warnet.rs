//! The Warnet aggregate: one topology, its tanks, and the backend they run on.
//!
//! ```text
//!                    ┌──────────────────────────┐
//!   graph.json ────→ │ Warnet                   │
//!                    │  graph ── tanks[0..n] ───┼──→ Arc<dyn Backend>
//!                    │            │             │
//!                    │            └─ LN nodes ──┼──→ ChannelOpenScheduler
//!                    └──────────────────────────┘
//! ```
//!
//! Constructing a Warnet from a graph never touches the backend. Everything
//! that does is a method here, and bulk methods collect per-tank failures
//! into one `BackendError::Bulk`.

use crate::config::WarnetConfig;
use crate::domain::graph::TopologyGraph;
use crate::domain::messages::MessageRecord;
use crate::domain::scenario::TankSnapshot;
use crate::domain::status::{ServiceType, TankStatus};
use crate::domain::tank::TankSpec;
use crate::error::{BackendError, WarnetError, WarnetResult};
use crate::polling::poll_attempts;
use crate::ports::outbound::{Backend, LightningNode, LogMatch, LogScope};
use crate::service::scheduler::{ChannelOpenScheduler, ScheduleReport};
use crate::service::tank::Tank;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// File the topology is persisted to inside the network directory
pub const GRAPH_FILE: &str = "graph.json";

/// File SimLN reads its node list from
pub const SIM_FILE: &str = "sim.json";

/// Most peers bitcoind will hold as manual connections
const MAX_MANUAL_PEERS: usize = 8;

/// Summary returned by `network_info`
#[derive(Debug, Clone, Serialize)]
pub struct NetworkInfo {
    pub name: String,
    pub backend: String,
    pub tanks: usize,
    pub lightning_nodes: usize,
    pub p2p_edges: usize,
    pub channels: usize,
    pub services: Vec<String>,
}

pub struct Warnet {
    config: WarnetConfig,
    graph: TopologyGraph,
    tanks: Vec<Arc<Tank>>,
    backend: Arc<dyn Backend>,
}

impl Warnet {
    // =========================================================================
    // CONSTRUCTION
    // =========================================================================

    /// Parse and validate a topology document and build its tanks.
    pub fn from_graph_file(source: &[u8], config: WarnetConfig, backend: Arc<dyn Backend>) -> WarnetResult<Self> {
        let graph = TopologyGraph::parse(source)?;
        let backoff = config.polling.lightning_rpc;
        Self::from_graph_with(graph, config, backend, |spec, backend| Tank::new(spec, backend, backoff))
    }

    /// Build tanks through `factory`, which decides how each tank reaches its nodes.
    pub fn from_graph_with<F>(
        graph: TopologyGraph,
        config: WarnetConfig,
        backend: Arc<dyn Backend>,
        mut factory: F,
    ) -> WarnetResult<Self>
    where
        F: FnMut(TankSpec, Arc<dyn Backend>) -> Tank,
    {
        let tanks = graph
            .nodes()
            .iter()
            .map(|node| {
                let spec = TankSpec::from_node(node, &graph, &config.network.name)?;
                Ok(Arc::new(factory(spec, Arc::clone(&backend))))
            })
            .collect::<WarnetResult<Vec<_>>>()?;
        debug!(network = %config.network.name, tanks = tanks.len(), "built warnet from graph");
        Ok(Self {
            config,
            graph,
            tanks,
            backend,
        })
    }

    /// Rebuild a deployed network from its persisted graph and observe
    /// every tank's address.
    ///
    /// A tank whose address does not show up within the polling budget is
    /// logged and left unresolved; it is queried again on next use.
    #[instrument(skip(config, backend), fields(network = %config.network.name))]
    pub async fn from_network(config: WarnetConfig, backend: Arc<dyn Backend>) -> WarnetResult<Self> {
        let path = config.network.network_dir().join(GRAPH_FILE);
        let source = tokio::fs::read(&path).await.map_err(|e| WarnetError::io(&path, e))?;
        let warnet = Self::from_graph_file(&source, config, backend)?;

        let (interval, attempts) = (
            warnet.config.polling.address_interval,
            warnet.config.polling.address_attempts,
        );
        for tank in &warnet.tanks {
            let tank = tank.as_ref();
            let resolved = poll_attempts(&format!("address of {}", tank.name()), interval, attempts, || async move {
                tank.ipv4().await.ok().flatten()
            })
            .await;
            match resolved {
                Ok(addr) => debug!(index = tank.index(), %addr, "tank address"),
                Err(e) => warn!(index = tank.index(), error = %e, "tank address unresolved"),
            }
        }
        Ok(warnet)
    }

    /// Write the topology to the network directory.
    pub async fn persist(&self) -> WarnetResult<PathBuf> {
        let dir = self.config.network.network_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| WarnetError::io(&dir, e))?;
        let path = dir.join(GRAPH_FILE);
        tokio::fs::write(&path, self.graph.to_json()?)
            .await
            .map_err(|e| WarnetError::io(&path, e))?;
        Ok(path)
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.config.network.name
    }

    pub fn config(&self) -> &WarnetConfig {
        &self.config
    }

    pub fn graph(&self) -> &TopologyGraph {
        &self.graph
    }

    pub fn tanks(&self) -> &[Arc<Tank>] {
        &self.tanks
    }

    pub fn tank(&self, index: usize) -> WarnetResult<&Arc<Tank>> {
        self.tanks.get(index).ok_or(WarnetError::TankNotFound(index))
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    fn specs(&self) -> Vec<TankSpec> {
        self.tanks.iter().map(|t| t.spec().clone()).collect()
    }

    pub fn info(&self) -> NetworkInfo {
        NetworkInfo {
            name: self.name().to_string(),
            backend: format!("{:?}", self.backend.kind()).to_lowercase(),
            tanks: self.tanks.len(),
            lightning_nodes: self.tanks.iter().filter(|t| t.lightning().is_some()).count(),
            p2p_edges: self.graph.p2p_edges().len(),
            channels: self.graph.channel_edges().len(),
            services: self.graph.services().to_vec(),
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Build images for tanks that need them.
    pub async fn build(&self) -> WarnetResult<bool> {
        Ok(self.backend.build(&self.specs()).await?)
    }

    /// Persist, build and bring the whole network up. Safe to re-run.
    #[instrument(skip(self), fields(network = %self.name()))]
    pub async fn deploy(&self) -> WarnetResult<()> {
        self.persist().await?;
        let specs = self.specs();
        if self.backend.build(&specs).await? {
            info!("built custom images");
        }
        self.backend.up(&specs).await?;
        info!(tanks = specs.len(), "network deployed");
        Ok(())
    }

    /// Remove every resource; failures are collected by the backend.
    #[instrument(skip(self), fields(network = %self.name()))]
    pub async fn teardown(&self) -> WarnetResult<()> {
        self.backend.down(&self.specs()).await?;
        info!("network torn down");
        Ok(())
    }

    pub async fn wait_for_healthy(&self) -> WarnetResult<()> {
        let polling = &self.config.polling;
        self.backend
            .wait_for_healthy(&self.specs(), polling.interval, polling.healthy_timeout)
            .await?;
        Ok(())
    }

    /// Live status of every tank, by index. Every tank is queried; failures
    /// come back together as one `BackendError::Bulk`.
    pub async fn status(&self) -> WarnetResult<Vec<TankStatus>> {
        let mut set = JoinSet::new();
        for tank in &self.tanks {
            let tank = Arc::clone(tank);
            set.spawn(async move {
                let index = tank.index();
                tank.status().await.map_err(|e| format!("tank {index}: {e}"))
            });
        }
        let mut statuses = Vec::with_capacity(self.tanks.len());
        let mut failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(status)) => statuses.push(status),
                Ok(Err(failure)) => failures.push(failure),
                Err(e) => failures.push(e.to_string()),
            }
        }
        if !failures.is_empty() {
            failures.sort();
            warn!(operation = "status", failed = failures.len(), "bulk operation had failures");
            return Err(BackendError::Bulk {
                operation: "status".to_string(),
                failures,
            }
            .into());
        }
        statuses.sort_by_key(|s| s.tank_index);
        Ok(statuses)
    }

    // =========================================================================
    // P2P WIRING
    // =========================================================================

    /// Whether every tank holds as many manual peers as it was told to dial
    /// (capped at what bitcoind keeps).
    pub async fn network_connected(&self) -> bool {
        let mut set = JoinSet::new();
        for tank in &self.tanks {
            let tank = Arc::clone(tank);
            set.spawn(async move {
                let wanted = tank.spec().init_peers.len().min(MAX_MANUAL_PEERS);
                match tank.manual_peer_count().await {
                    Ok(count) => {
                        debug!(index = tank.index(), count, wanted, "manual peers");
                        count >= wanted
                    }
                    Err(e) => {
                        debug!(index = tank.index(), error = %e, "peer query failed");
                        false
                    }
                }
            });
        }
        let mut connected = true;
        while let Some(joined) = set.join_next().await {
            connected &= joined.unwrap_or(false);
        }
        connected
    }

    /// Dial every P2P edge of the topology.
    #[instrument(skip(self), fields(edges = self.graph.p2p_edges().len()))]
    pub async fn connect_edges(&self) -> WarnetResult<()> {
        let mut set = JoinSet::new();
        for edge in self.graph.p2p_edges() {
            let source = Arc::clone(self.tank(edge.source)?);
            let target = Arc::clone(self.tank(edge.target)?);
            set.spawn(async move {
                let label = format!("{} -> {}", source.name(), target.name());
                let addr = match target.ipv4().await {
                    Ok(Some(addr)) => addr,
                    Ok(None) => return Err(format!("{label}: target has no address")),
                    Err(e) => return Err(format!("{label}: {e}")),
                };
                source.connect_to(addr).await.map_err(|e| format!("{label}: {e}"))
            });
        }
        collect_failures("connect edges", &mut set).await?;
        info!("p2p edges dialed");
        Ok(())
    }

    /// Apply declared tc-netem impairments, returning how many tanks got one.
    pub async fn apply_network_conditions(&self) -> WarnetResult<usize> {
        let mut applied = 0;
        let mut failures = Vec::new();
        for tank in &self.tanks {
            match tank.apply_network_conditions().await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => failures.push(format!("{}: {e}", tank.name())),
            }
        }
        if !failures.is_empty() {
            return Err(BackendError::Bulk {
                operation: "apply network conditions".to_string(),
                failures,
            }
            .into());
        }
        Ok(applied)
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    /// Connection details handed to scenarios
    pub async fn snapshot(&self) -> Vec<TankSnapshot> {
        let chain = &self.config.network.bitcoin_network;
        let mut entries = Vec::with_capacity(self.tanks.len());
        for tank in &self.tanks {
            entries.push(tank.snapshot(chain).await);
        }
        entries
    }

    pub fn generate_deployment(&self) -> WarnetResult<String> {
        Ok(self.backend.generate_deployment(&self.specs())?)
    }

    /// P2P messages tank `a` exchanged with tank `b`
    pub async fn messages(&self, a: usize, b: usize) -> WarnetResult<Vec<MessageRecord>> {
        self.tank(a)?;
        let peer = self
            .tank(b)?
            .ipv4()
            .await?
            .ok_or_else(|| BackendError::NotFound {
                resource: format!("address of tank {b}"),
            })?;
        Ok(self.backend.get_messages(a, peer).await?)
    }

    pub async fn logs_grep(&self, pattern: &str, scope: LogScope) -> WarnetResult<Vec<LogMatch>> {
        let pattern = Regex::new(pattern)?;
        Ok(self.backend.logs_grep(&self.specs(), &pattern, scope).await?)
    }

    /// Copy LN credentials into `dir`, write the SimLN node list and bundle
    /// the directory as `<dir>.tar`.
    #[instrument(skip(self))]
    pub async fn export(&self, dir: &Path) -> WarnetResult<PathBuf> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| WarnetError::io(dir, e))?;

        let mut nodes = Vec::new();
        for tank in &self.tanks {
            let Some(ln) = tank.lightning() else {
                continue;
            };
            let host = self.backend.lightning_host(tank.spec());
            let id = tank.spec().resource_name(ServiceType::Lightning);
            nodes.push(ln.export(&id, &host, dir).await?);
        }
        let sim = serde_json::to_vec_pretty(&json!({ "nodes": nodes }))
            .map_err(|e| BackendError::parse("sim.json", e))?;
        let sim_path = dir.join(SIM_FILE);
        tokio::fs::write(&sim_path, sim)
            .await
            .map_err(|e| WarnetError::io(&sim_path, e))?;

        let bundle = dir.with_extension("tar");
        let (source, target) = (dir.to_path_buf(), bundle.clone());
        tokio::task::spawn_blocking(move || bundle_dir(&source, &target))
            .await
            .map_err(|e| BackendError::parse("export task", e))?
            .map_err(|e| WarnetError::io(&bundle, e))?;
        info!(nodes = nodes.len(), bundle = %bundle.display(), "exported lightning credentials");
        Ok(bundle)
    }

    // =========================================================================
    // LIGHTNING
    // =========================================================================

    fn lightning_nodes(&self) -> BTreeMap<usize, Arc<dyn LightningNode>> {
        self.tanks
            .iter()
            .filter_map(|t| t.lightning().map(|ln| (t.index(), Arc::clone(ln))))
            .collect()
    }

    /// Scheduler over every LN node, mining on the configured miner tank
    pub fn scheduler(&self) -> WarnetResult<ChannelOpenScheduler> {
        let miner = self.tank(self.config.scheduler.miner_tank)?;
        Ok(ChannelOpenScheduler::new(
            self.config.scheduler.clone(),
            Arc::clone(miner.chain()),
            self.lightning_nodes(),
        ))
    }

    /// Open every declared channel at its declared position.
    pub async fn ln_init(&self) -> WarnetResult<ScheduleReport> {
        Ok(self.scheduler()?.run(self.graph.channel_edges()).await?)
    }

    /// Pubkey of tank `index`'s Lightning node
    pub async fn ln_pub_key(&self, index: usize) -> WarnetResult<String> {
        Ok(self.tank(index)?.require_lightning()?.pub_key().await?)
    }
}

impl std::fmt::Debug for Warnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Warnet")
            .field("name", &self.config.network.name)
            .field("tanks", &self.tanks.len())
            .finish()
    }
}

async fn collect_failures(operation: &str, set: &mut JoinSet<Result<(), String>>) -> Result<(), BackendError> {
    let mut failures = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(failure)) => failures.push(failure),
            Err(e) => failures.push(e.to_string()),
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        warn!(operation, failed = failures.len(), "bulk operation had failures");
        Err(BackendError::Bulk {
            operation: operation.to_string(),
            failures,
        })
    }
}

fn bundle_dir(source: &Path, target: &Path) -> std::io::Result<()> {
    let file = std::fs::File::create(target)?;
    let mut builder = tar::Builder::new(file);
    builder.append_dir_all(".", source)?;
    builder.into_inner()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::{MockBackend, MockNetwork};
    use crate::domain::status::RunningStatus;
    use serde_json::Value;
    use std::time::Duration;

    const RING: &str = r#"{"nodes": [{"id": 0}, {"id": 1}, {"id": 2}],
        "edges": [{"source": 0, "target": 1}, {"source": 1, "target": 2}, {"source": 2, "target": 0}]}"#;

    const LN: &str = r#"{"nodes": [{"id": 0, "ln": "lnd"}, {"id": 1, "ln": "cln"}, {"id": 2, "ln": "lnd"}],
        "edges": [{"source": 0, "target": 1},
                  {"source": 0, "target": 1, "channel": {"block": 300, "index": 1, "capacity": 100000, "push_amt": 50000}},
                  {"source": 1, "target": 2, "channel": {"block": 300, "index": 2, "capacity": 100000}},
                  {"source": 2, "target": 0, "channel": {"block": 301, "index": 1, "capacity": 200000}}]}"#;

    fn test_config(dir: &Path) -> WarnetConfig {
        let mut config = WarnetConfig::default();
        config.network.config_dir = dir.to_path_buf();
        config.polling.interval = Duration::from_millis(1);
        config.polling.healthy_timeout = Duration::from_millis(100);
        config.polling.address_interval = Duration::from_millis(1);
        config.polling.address_attempts = 3;
        config.scheduler.connect_stagger = Duration::from_millis(1);
        config.scheduler.poll_interval = Duration::from_millis(1);
        config.scheduler.mempool_timeout = Duration::from_millis(200);
        config.scheduler.funding_timeout = Duration::from_millis(200);
        config.scheduler.gossip_attempts = 5;
        config.scheduler.policy_attempts = 5;
        config
    }

    fn ring(dir: &Path) -> (Warnet, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new("warnet"));
        let warnet = Warnet::from_graph_file(RING.as_bytes(), test_config(dir), backend.clone()).unwrap();
        (warnet, backend)
    }

    #[test]
    fn test_from_graph_file_never_touches_backend() {
        let dir = tempfile::tempdir().unwrap();
        let (warnet, backend) = ring(dir.path());
        assert_eq!(warnet.tanks().len(), 3);
        assert_eq!(warnet.tank(1).unwrap().spec().init_peers, vec![2]);
        assert!(matches!(warnet.tank(3), Err(WarnetError::TankNotFound(3))));
        assert_eq!(backend.up_calls(), 0);
        assert!(backend.exec_log().is_empty());
    }

    #[tokio::test]
    async fn test_deploy_status_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new("warnet").with_ready_after(1));
        let warnet = Warnet::from_graph_file(RING.as_bytes(), test_config(dir.path()), backend.clone()).unwrap();

        let before = warnet.status().await.unwrap();
        assert!(before.iter().all(|s| s.bitcoin_status == RunningStatus::Stopped));

        warnet.deploy().await.unwrap();
        assert!(dir.path().join("warnet").join(GRAPH_FILE).exists());
        let first = warnet.status().await.unwrap();
        assert!(first.iter().all(|s| s.bitcoin_status == RunningStatus::Pending));
        warnet.wait_for_healthy().await.unwrap();

        warnet.teardown().await.unwrap();
        let after = warnet.status().await.unwrap();
        assert!(after.iter().all(|s| s.bitcoin_status == RunningStatus::Stopped));
    }

    #[tokio::test]
    async fn test_wait_for_healthy_times_out_on_crash() {
        let dir = tempfile::tempdir().unwrap();
        let (warnet, backend) = ring(dir.path());
        warnet.deploy().await.unwrap();
        backend.fail(2, ServiceType::Bitcoin);
        let err = warnet.wait_for_healthy().await.unwrap_err();
        assert!(matches!(err, WarnetError::Backend(BackendError::Timeout(_))), "{err}");
    }

    #[tokio::test]
    async fn test_status_reports_every_unreachable_tank() {
        let dir = tempfile::tempdir().unwrap();
        let (warnet, backend) = ring(dir.path());
        warnet.deploy().await.unwrap();
        backend.unreachable(0);
        backend.unreachable(2);

        match warnet.status().await.unwrap_err() {
            WarnetError::Backend(BackendError::Bulk { operation, failures }) => {
                assert_eq!(operation, "status");
                assert_eq!(failures.len(), 2);
                assert!(failures[0].starts_with("tank 0:"), "{failures:?}");
                assert!(failures[1].starts_with("tank 2:"), "{failures:?}");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn test_network_connected_flips_once_peers_are_manual() {
        let dir = tempfile::tempdir().unwrap();
        let (warnet, backend) = ring(dir.path());
        warnet.deploy().await.unwrap();
        assert!(!warnet.network_connected().await);

        backend.respond_exec("getpeerinfo", r#"[{"connection_type": "manual"}, {"connection_type": "inbound"}]"#);
        assert!(warnet.network_connected().await);
    }

    #[tokio::test]
    async fn test_connect_edges_dials_every_target() {
        let dir = tempfile::tempdir().unwrap();
        let (warnet, backend) = ring(dir.path());
        warnet.deploy().await.unwrap();
        warnet.connect_edges().await.unwrap();

        let dials: Vec<(usize, String)> = backend
            .exec_log()
            .into_iter()
            .filter(|(_, _, cmd)| cmd.contains("addpeeraddress"))
            .map(|(i, _, cmd)| (i, cmd))
            .collect();
        assert_eq!(dials.len(), 3);
        assert!(dials.iter().any(|(i, cmd)| *i == 0 && cmd.contains("10.0.0.3")));
    }

    #[tokio::test]
    async fn test_connect_edges_reports_every_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (warnet, backend) = ring(dir.path());
        warnet.deploy().await.unwrap();
        backend.fail_exec("addpeeraddress", 1, "error code: -1");
        match warnet.connect_edges().await.unwrap_err() {
            WarnetError::Backend(BackendError::Bulk { failures, .. }) => assert_eq!(failures.len(), 3),
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn test_from_network_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new("warnet").with_ip_delay(1));
        let config = test_config(dir.path());
        Warnet::from_graph_file(RING.as_bytes(), config.clone(), backend.clone())
            .unwrap()
            .deploy()
            .await
            .unwrap();

        let first = Warnet::from_network(config.clone(), backend.clone()).await.unwrap();
        let second = Warnet::from_network(config, backend.clone()).await.unwrap();
        for (a, b) in first.tanks().iter().zip(second.tanks()) {
            assert!(a.cached_ipv4().is_some());
            assert_eq!(a.cached_ipv4(), b.cached_ipv4());
        }
        assert_eq!(first.graph().p2p_edges(), second.graph().p2p_edges());
    }

    #[tokio::test]
    async fn test_from_network_tolerates_missing_address() {
        let dir = tempfile::tempdir().unwrap();
        let (warnet, backend) = ring(dir.path());
        warnet.persist().await.unwrap();
        // persisted but never deployed: no tank has an address
        let config = test_config(dir.path());
        let rebuilt = Warnet::from_network(config, backend).await.unwrap();
        assert!(rebuilt.tanks().iter().all(|t| t.cached_ipv4().is_none()));
    }

    #[tokio::test]
    async fn test_logs_grep_and_bad_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let (warnet, backend) = ring(dir.path());
        warnet.deploy().await.unwrap();
        backend.set_logs(1, ServiceType::Bitcoin, "2024 UpdateTip height=1\n2024 Misbehaving peer=3");
        let found = warnet.logs_grep("Misbehaving", LogScope::All).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tank, 1);
        assert!(matches!(
            warnet.logs_grep("(", LogScope::All).await,
            Err(WarnetError::Pattern(_))
        ));
    }

    fn lightning_warnet(dir: &Path, network: &Arc<MockNetwork>) -> (Warnet, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new("warnet"));
        let graph = TopologyGraph::parse(LN.as_bytes()).unwrap();
        let warnet = Warnet::from_graph_with(graph, test_config(dir), backend.clone(), |spec, backend| {
            let ln = spec.ln.as_ref().map(|ln| {
                network.add_node(ln.implementation) as Arc<dyn LightningNode>
            });
            Tank::with_clients(spec, backend, network.chain(), ln)
        })
        .unwrap();
        (warnet, backend)
    }

    #[tokio::test]
    async fn test_healthy_waits_on_bitcoin_only() {
        let dir = tempfile::tempdir().unwrap();
        let network = MockNetwork::new();
        let (warnet, backend) = lightning_warnet(dir.path(), &network);
        warnet.deploy().await.unwrap();
        backend.fail(1, ServiceType::Lightning);

        warnet.wait_for_healthy().await.unwrap();
        let status = warnet.status().await.unwrap();
        assert_eq!(status[1].bitcoin_status, RunningStatus::Running);
        assert_eq!(status[1].lightning_status, Some(RunningStatus::Failed));
    }

    #[tokio::test]
    async fn test_ln_init_opens_declared_channels() {
        let dir = tempfile::tempdir().unwrap();
        let network = MockNetwork::new();
        let (warnet, _) = lightning_warnet(dir.path(), &network);
        assert_eq!(warnet.info().lightning_nodes, 3);
        assert_eq!(warnet.info().channels, 3);

        let report = warnet.ln_init().await.unwrap();
        let scids: Vec<&str> = report.channels.iter().map(|c| c.short_chan_id.as_str()).collect();
        assert_eq!(scids, vec!["300x1x0", "300x2x0", "301x1x0"]);
        assert_eq!(network.height(), 301);
        assert_eq!(
            warnet.ln_pub_key(1).await.unwrap(),
            network.channels()[0].node2_pub.clone()
        );
    }

    #[tokio::test]
    async fn test_export_writes_sim_file_and_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let network = MockNetwork::new();
        let (warnet, _) = lightning_warnet(dir.path(), &network);
        let out = dir.path().join("export");
        let bundle = warnet.export(&out).await.unwrap();

        let sim: Value = serde_json::from_slice(&std::fs::read(out.join(SIM_FILE)).unwrap()).unwrap();
        assert_eq!(sim["nodes"].as_array().unwrap().len(), 3);
        assert_eq!(sim["nodes"][0]["id"], "warnet-tank-ln-000000");
        assert!(bundle.ends_with("export.tar"));
        assert!(bundle.exists());
    }
}
