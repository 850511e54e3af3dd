//! Runtime handle of one tank: its spec, the backend it lives on, and the
//! chain and Lightning clients that talk to its containers.

use crate::adapters::bitcoin_cli::BitcoinCliClient;
use crate::adapters::lightning::lightning_node;
use crate::domain::scenario::TankSnapshot;
use crate::domain::status::{ServiceType, TankStatus};
use crate::domain::tank::{version_ge, TankSpec, P2P_PORT};
use crate::error::{BackendError, BackendResult, WarnetError, WarnetResult};
use crate::polling::Backoff;
use crate::ports::outbound::{Backend, ChainClient, LightningNode};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEBUG_LOG: &str = "/root/.bitcoin/regtest/debug.log";

/// First release with `addpeeraddress`
const ADDPEERADDRESS_VERSION: &str = "0.21.0";

pub struct Tank {
    spec: TankSpec,
    backend: Arc<dyn Backend>,
    chain: Arc<dyn ChainClient>,
    lightning: Option<Arc<dyn LightningNode>>,
    /// Set once the backend reports an address; never reassigned
    ipv4: Mutex<Option<Ipv4Addr>>,
}

impl Tank {
    /// Tank with CLI-backed clients running inside its containers.
    pub fn new(spec: TankSpec, backend: Arc<dyn Backend>, lightning_backoff: Backoff) -> Self {
        let chain: Arc<dyn ChainClient> = Arc::new(BitcoinCliClient::new(Arc::clone(&backend), spec.clone()));
        let lightning = lightning_node(Arc::clone(&backend), &spec, lightning_backoff);
        Self::with_clients(spec, backend, chain, lightning)
    }

    pub fn with_clients(
        spec: TankSpec,
        backend: Arc<dyn Backend>,
        chain: Arc<dyn ChainClient>,
        lightning: Option<Arc<dyn LightningNode>>,
    ) -> Self {
        Self {
            spec,
            backend,
            chain,
            lightning,
            ipv4: Mutex::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.spec.index
    }

    pub fn spec(&self) -> &TankSpec {
        &self.spec
    }

    pub fn name(&self) -> String {
        self.spec.resource_name(ServiceType::Bitcoin)
    }

    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }

    pub fn lightning(&self) -> Option<&Arc<dyn LightningNode>> {
        self.lightning.as_ref()
    }

    pub fn require_lightning(&self) -> WarnetResult<&Arc<dyn LightningNode>> {
        self.lightning.as_ref().ok_or(WarnetError::NoLightning(self.spec.index))
    }

    /// Run `bitcoin-cli <method> <args>` in the bitcoin container.
    pub async fn rpc_command(&self, method: &str, args: &[String]) -> BackendResult<String> {
        let cmd = self.spec.cli_command(method, args);
        self.backend.exec(self.spec.index, ServiceType::Bitcoin, &cmd).await
    }

    /// Raw Lightning CLI call
    pub async fn lncli(&self, command: &str) -> WarnetResult<Value> {
        Ok(self.require_lightning()?.cli(command).await?)
    }

    /// Observed address, queried until the backend reports one and cached after.
    pub async fn ipv4(&self) -> BackendResult<Option<Ipv4Addr>> {
        if let Some(addr) = *self.ipv4.lock() {
            return Ok(Some(addr));
        }
        let observed = self.backend.tank_ipv4(self.spec.index).await?;
        if let Some(addr) = observed {
            let mut cached = self.ipv4.lock();
            // a concurrent lookup may have won; keep the first address
            return Ok(Some(*cached.get_or_insert(addr)));
        }
        Ok(None)
    }

    pub fn cached_ipv4(&self) -> Option<Ipv4Addr> {
        *self.ipv4.lock()
    }

    /// Live status of the tank's containers, never cached
    pub async fn status(&self) -> BackendResult<TankStatus> {
        let bitcoin_status = self.backend.get_status(self.spec.index, ServiceType::Bitcoin).await?;
        let lightning_status = match self.spec.ln {
            Some(_) => Some(self.backend.get_status(self.spec.index, ServiceType::Lightning).await?),
            None => None,
        };
        Ok(TankStatus {
            tank_index: self.spec.index,
            bitcoin_status,
            lightning_status,
        })
    }

    pub async fn debug_log(&self) -> BackendResult<String> {
        self.backend
            .exec(self.spec.index, ServiceType::Bitcoin, &format!("cat {DEBUG_LOG}"))
            .await
    }

    /// Apply the declared tc-netem impairment. Returns false when none is declared.
    pub async fn apply_network_conditions(&self) -> BackendResult<bool> {
        let Some(netem) = &self.spec.netem else {
            return Ok(false);
        };
        self.backend
            .exec(self.spec.index, ServiceType::Bitcoin, netem)
            .await?;
        info!(index = self.spec.index, command = %netem, "applied network conditions");
        Ok(true)
    }

    /// Peers this node connected to because it was told to
    pub async fn manual_peer_count(&self) -> BackendResult<usize> {
        let out = self.rpc_command("getpeerinfo", &[]).await?;
        let peers: Value =
            serde_json::from_str(&out).map_err(|e| BackendError::parse("getpeerinfo", e))?;
        Ok(peers
            .as_array()
            .into_iter()
            .flatten()
            .filter(|p| {
                p["connection_type"].as_str() == Some("manual") || p["addnode"].as_bool() == Some(true)
            })
            .count())
    }

    /// Dial a peer's P2P port with whichever RPC this node's version has.
    pub async fn connect_to(&self, peer: Ipv4Addr) -> BackendResult<()> {
        if version_ge(&self.spec.version, ADDPEERADDRESS_VERSION) {
            self.rpc_command("addpeeraddress", &[peer.to_string(), P2P_PORT.to_string()])
                .await?;
        } else {
            self.rpc_command("addnode", &[format!("{peer}:{P2P_PORT}"), "onetry".to_string()])
                .await?;
        }
        debug!(index = self.spec.index, %peer, "dialed peer");
        Ok(())
    }

    /// Entry of the topology snapshot handed to scenarios
    pub async fn snapshot(&self, chain: &str) -> TankSnapshot {
        let rpc_host = match self.ipv4().await {
            Ok(Some(addr)) => addr.to_string(),
            Ok(None) => self.spec.service_name(ServiceType::Bitcoin),
            Err(e) => {
                warn!(index = self.spec.index, error = %e, "no address for snapshot, using service name");
                self.spec.service_name(ServiceType::Bitcoin)
            }
        };
        TankSnapshot {
            tank: self.name(),
            chain: chain.to_string(),
            rpc_host,
            rpc_port: self.spec.rpc.port,
            rpc_user: self.spec.rpc.user.clone(),
            rpc_password: self.spec.rpc.password.clone(),
            init_peers: self.spec.init_peers.clone(),
        }
    }

    /// `exec` for arbitrary shell commands from the control API
    pub async fn exec(&self, service: ServiceType, cmd: &str) -> WarnetResult<String> {
        if service == ServiceType::Lightning && self.spec.ln.is_none() {
            return Err(WarnetError::NoLightning(self.spec.index));
        }
        Ok(self.backend.exec(self.spec.index, service, cmd).await?)
    }

    /// Quote a raw parameter list from the control API as CLI arguments
    pub fn cli_params(params: &[Value]) -> Vec<String> {
        params
            .iter()
            .map(|p| match p {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()
    }
}

impl std::fmt::Debug for Tank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tank")
            .field("index", &self.spec.index)
            .field("version", &self.spec.version)
            .field("ln", &self.spec.ln.as_ref().map(|l| l.implementation))
            .field("ipv4", &self.cached_ipv4())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::MockBackend;
    use crate::domain::graph::TopologyGraph;

    fn spec(doc: &str, index: usize) -> TankSpec {
        let graph = TopologyGraph::parse(doc.as_bytes()).unwrap();
        TankSpec::from_node(graph.node(index).unwrap(), &graph, "warnet").unwrap()
    }

    fn tank(doc: &str, index: usize, backend: Arc<MockBackend>) -> Tank {
        Tank::new(spec(doc, index), backend, Backoff::default())
    }

    async fn deployed(doc: &str, backend: &Arc<MockBackend>) {
        let graph = TopologyGraph::parse(doc.as_bytes()).unwrap();
        let specs: Vec<TankSpec> = graph
            .nodes()
            .iter()
            .map(|n| TankSpec::from_node(n, &graph, "warnet").unwrap())
            .collect();
        backend.up(&specs).await.unwrap();
    }

    const TWO: &str = r#"{"nodes": [{"id": 0}, {"id": 1}], "edges": []}"#;

    #[tokio::test]
    async fn test_ipv4_is_cached_once_observed() {
        let backend = Arc::new(MockBackend::new("warnet").with_ip_delay(1));
        deployed(TWO, &backend).await;
        let tank = tank(TWO, 0, Arc::clone(&backend));
        assert_eq!(tank.ipv4().await.unwrap(), None);
        let first = tank.ipv4().await.unwrap().unwrap();
        backend.set_ip(0, Ipv4Addr::new(10, 9, 9, 9));
        assert_eq!(tank.ipv4().await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_rpc_command_quotes_arguments() {
        let backend = Arc::new(MockBackend::new("warnet"));
        deployed(TWO, &backend).await;
        backend.respond_exec("getblockcount", "101\n");
        let tank = tank(TWO, 0, Arc::clone(&backend));
        assert_eq!(tank.rpc_command("getblockcount", &[]).await.unwrap(), "101\n");
        tank.rpc_command("echo", &["a b".into()]).await.unwrap();
        let (_, _, cmd) = backend.exec_log().pop().unwrap();
        assert!(cmd.ends_with("echo 'a b'"));
    }

    #[tokio::test]
    async fn test_rpc_failure_surfaces_command_error() {
        let backend = Arc::new(MockBackend::new("warnet"));
        deployed(TWO, &backend).await;
        backend.fail_exec("getblockhash", 8, "error code: -8\nBlock height out of range");
        let err = tank(TWO, 0, Arc::clone(&backend))
            .rpc_command("getblockhash", &["999".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Command(ref e) if e.exit_code == 8));
    }

    #[tokio::test]
    async fn test_connect_uses_version_appropriate_rpc() {
        let backend = Arc::new(MockBackend::new("warnet"));
        deployed(TWO, &backend).await;
        let peer = Ipv4Addr::new(100, 0, 0, 7);
        tank(TWO, 0, Arc::clone(&backend)).connect_to(peer).await.unwrap();
        let mut old = spec(TWO, 1);
        old.version = "0.20.1".to_string();
        Tank::new(old, Arc::clone(&backend) as Arc<dyn Backend>, Backoff::default())
            .connect_to(peer)
            .await
            .unwrap();
        let log = backend.exec_log();
        assert!(log[0].2.ends_with("addpeeraddress 100.0.0.7 18444"));
        assert!(log[1].2.ends_with("addnode 100.0.0.7:18444 onetry"));
    }

    #[tokio::test]
    async fn test_manual_peer_count() {
        let backend = Arc::new(MockBackend::new("warnet"));
        deployed(TWO, &backend).await;
        backend.respond_exec(
            "getpeerinfo",
            r#"[{"connection_type": "manual"}, {"connection_type": "inbound"}, {"connection_type": "manual"}]"#,
        );
        let tank = tank(TWO, 0, Arc::clone(&backend));
        assert_eq!(tank.manual_peer_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_lncli_without_lightning() {
        let backend = Arc::new(MockBackend::new("warnet"));
        let err = tank(TWO, 0, backend).lncli("getinfo").await.unwrap_err();
        assert!(matches!(err, WarnetError::NoLightning(0)));
    }
}
