//! Backend over a Docker Compose project: one container per tank service.
//!
//! Bitcoin containers get static addresses from the network's pool, so the
//! rendered file already names every peer by IP. The compose file is kept
//! under the network directory and reused by `down`.

use super::compose_file::{render, ComposeFile};
use super::Docker;
use crate::adapters::image::ImageBuilder;
use crate::config::{BackendConfig, BackendKind, NetworkConfig};
use crate::domain::ip_pool::Ipv4Pool;
use crate::domain::status::{RunningStatus, ServiceType};
use crate::domain::tank::{resource_name, TankSpec};
use crate::error::{BackendError, BackendResult};
use crate::ports::outbound::{Backend, CommandRunner};
use async_trait::async_trait;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub const COMPOSE_FILE_NAME: &str = "docker-compose.yml";

pub struct ComposeBackend {
    docker: Docker,
    images: ImageBuilder,
    config: BackendConfig,
    network: String,
    compose_path: PathBuf,
    pool: Ipv4Pool,
}

impl ComposeBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, config: BackendConfig, network: &NetworkConfig) -> Self {
        let backend = Self {
            docker: Docker::new(Arc::clone(&runner), config.docker.clone()),
            images: ImageBuilder::new(runner, config.docker.clone(), config.images_dir.clone()),
            compose_path: network.network_dir().join(COMPOSE_FILE_NAME),
            pool: Ipv4Pool::new(network.subnet),
            network: network.name.clone(),
            config,
        };
        backend.restore_addresses();
        backend
    }

    /// Claim the addresses of a previously written compose file so a
    /// re-rendered file keeps every tank where it was.
    fn restore_addresses(&self) {
        let Ok(text) = std::fs::read_to_string(&self.compose_path) else {
            return;
        };
        let file = match ComposeFile::from_yaml(&text) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.compose_path.display(), error = %e, "ignoring unreadable compose file");
                return;
            }
        };
        for service in file.services.values() {
            let index = service.labels.get("tank_index").and_then(|i| i.parse().ok());
            let addr = service.networks.get(&self.network).and_then(|n| n.ipv4_address);
            if let (Some(index), Some(addr)) = (index, addr) {
                if !self.pool.claim(index, addr) {
                    warn!(index, %addr, "address already claimed");
                }
            }
        }
        debug!(allocated = self.pool.allocated(), "restored tank addresses");
    }

    fn container(&self, index: usize, service: ServiceType) -> String {
        resource_name(&self.network, index, service)
    }

    fn compose_args<'a>(&'a self, path: &'a str, command: &[&'a str]) -> Vec<&'a str> {
        let mut args = vec!["compose", "-p", self.network.as_str(), "-f", path];
        args.extend_from_slice(command);
        args
    }

    async fn write_compose_file(&self, tanks: &[TankSpec]) -> BackendResult<()> {
        let yaml = self.generate_deployment(tanks)?;
        if let Some(dir) = self.compose_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| BackendError::io(dir, e))?;
        }
        tokio::fs::write(&self.compose_path, yaml)
            .await
            .map_err(|e| BackendError::io(&self.compose_path, e))?;
        info!(path = %self.compose_path.display(), "wrote compose file");
        Ok(())
    }

    /// Remove containers one by one when the project cannot be brought down as a whole
    async fn remove_containers(&self, tanks: &[TankSpec]) -> Vec<String> {
        let mut failures = Vec::new();
        for tank in tanks {
            let mut names = Vec::new();
            if tank.ln.is_some() {
                let ln = tank.resource_name(ServiceType::Lightning);
                names.push(format!("{ln}-cb"));
                names.push(ln);
            }
            let bitcoin = tank.resource_name(ServiceType::Bitcoin);
            names.push(format!("{bitcoin}-exporter"));
            names.push(bitcoin);
            for name in names {
                match self.docker.run(&["rm", "-f", &name]).await {
                    Ok(out) if out.success() || out.combined().contains("No such") => {}
                    Ok(out) => failures.push(format!("{name}: {}", out.combined().trim())),
                    Err(e) => failures.push(format!("{name}: {e}")),
                }
            }
        }
        failures
    }
}

/// Derive a tank status from the `State` object of `docker inspect`.
pub fn container_status(state: &Value) -> RunningStatus {
    match state["Status"].as_str() {
        Some("running") => match state["Health"]["Status"].as_str() {
            None | Some("healthy") => RunningStatus::Running,
            Some(_) => RunningStatus::Pending,
        },
        Some("exited") | Some("dead") => {
            if state["ExitCode"].as_i64().unwrap_or(0) == 0 {
                RunningStatus::Stopped
            } else {
                RunningStatus::Failed
            }
        }
        Some("created") | Some("restarting") | Some("paused") => RunningStatus::Pending,
        _ => RunningStatus::Unknown,
    }
}

#[async_trait]
impl Backend for ComposeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Compose
    }

    fn network_name(&self) -> &str {
        &self.network
    }

    async fn build(&self, tanks: &[TankSpec]) -> BackendResult<bool> {
        self.images.build_all(tanks).await
    }

    #[instrument(skip(self, tanks), fields(network = %self.network, tanks = tanks.len()))]
    async fn up(&self, tanks: &[TankSpec]) -> BackendResult<()> {
        self.write_compose_file(tanks).await?;
        let path = self.compose_path.display().to_string();
        // depends_on orders lightning after a healthy bitcoind
        self.docker
            .run(&self.compose_args(&path, &["up", "--detach"]))
            .await?
            .into_stdout()?;
        info!("compose project up");
        Ok(())
    }

    #[instrument(skip(self, tanks), fields(network = %self.network, tanks = tanks.len()))]
    async fn down(&self, tanks: &[TankSpec]) -> BackendResult<()> {
        if self.compose_path.exists() {
            let path = self.compose_path.display().to_string();
            match self.docker.run(&self.compose_args(&path, &["down", "--volumes"])).await {
                Ok(out) if out.success() => return Ok(()),
                Ok(out) => warn!(output = out.combined().trim(), "compose down failed, removing containers"),
                Err(e) => warn!(error = %e, "compose down failed, removing containers"),
            }
        }
        let failures = self.remove_containers(tanks).await;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(BackendError::Bulk {
                operation: "down".to_string(),
                failures,
            })
        }
    }

    async fn get_status(&self, index: usize, service: ServiceType) -> BackendResult<RunningStatus> {
        let container = self.docker.inspect(&self.container(index, service)).await?;
        Ok(container
            .map(|c| container_status(&c["State"]))
            .unwrap_or(RunningStatus::Stopped))
    }

    #[instrument(skip(self))]
    async fn exec(&self, index: usize, service: ServiceType, cmd: &str) -> BackendResult<String> {
        self.docker.exec(&self.container(index, service), cmd).await
    }

    async fn logs(&self, index: usize, service: ServiceType) -> BackendResult<String> {
        self.docker.logs(&self.container(index, service)).await
    }

    async fn tank_ipv4(&self, index: usize) -> BackendResult<Option<Ipv4Addr>> {
        let container = self.docker.inspect(&self.container(index, ServiceType::Bitcoin)).await?;
        let observed = container
            .as_ref()
            .and_then(|c| c["NetworkSettings"]["Networks"][&self.network]["IPAddress"].as_str())
            .filter(|ip| !ip.is_empty());
        match observed {
            Some(ip) => {
                let addr: Ipv4Addr = ip
                    .parse()
                    .map_err(|e| BackendError::parse(format!("address of tank {index}"), e))?;
                if !self.pool.claim(index, addr) {
                    warn!(index, %addr, "observed address differs from allocation");
                }
                Ok(Some(addr))
            }
            None => Ok(self.pool.address_for(index)),
        }
    }

    fn lightning_host(&self, tank: &TankSpec) -> String {
        tank.resource_name(ServiceType::Lightning)
    }

    fn generate_deployment(&self, tanks: &[TankSpec]) -> BackendResult<String> {
        render(tanks, &self.network, &self.pool, &self.config)?.to_yaml()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::ScriptedRunner;
    use crate::domain::graph::TopologyGraph;
    use crate::ports::outbound::CommandOutput;
    use serde_json::json;

    fn tanks(doc: &str) -> Vec<TankSpec> {
        let graph = TopologyGraph::parse(doc.as_bytes()).unwrap();
        graph
            .nodes()
            .iter()
            .map(|n| TankSpec::from_node(n, &graph, "warnet").unwrap())
            .collect()
    }

    fn network(dir: &std::path::Path) -> NetworkConfig {
        NetworkConfig {
            config_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_container_status_mapping() {
        let state = |status: &str, health: Option<&str>, code: i64| {
            let mut s = json!({ "Status": status, "ExitCode": code });
            if let Some(h) = health {
                s["Health"] = json!({ "Status": h });
            }
            s
        };
        assert_eq!(container_status(&state("running", None, 0)), RunningStatus::Running);
        assert_eq!(container_status(&state("running", Some("healthy"), 0)), RunningStatus::Running);
        assert_eq!(container_status(&state("running", Some("starting"), 0)), RunningStatus::Pending);
        assert_eq!(container_status(&state("exited", None, 0)), RunningStatus::Stopped);
        assert_eq!(container_status(&state("exited", None, 137)), RunningStatus::Failed);
        assert_eq!(container_status(&state("restarting", None, 0)), RunningStatus::Pending);
        assert_eq!(container_status(&state("removing", None, 0)), RunningStatus::Unknown);
    }

    #[tokio::test]
    async fn test_missing_container_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("inspect", failed("Error: No such object: warnet-tank-000000"));
        let backend = ComposeBackend::new(runner, BackendConfig::default(), &network(dir.path()));
        assert_eq!(
            backend.get_status(0, ServiceType::Bitcoin).await.unwrap(),
            RunningStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_up_writes_file_and_starts_project() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let backend = ComposeBackend::new(Arc::clone(&runner) as Arc<dyn CommandRunner>, BackendConfig::default(), &network(dir.path()));
        let tanks = tanks(r#"{"nodes": [{"id": 0}, {"id": 1}], "edges": [{"source": 0, "target": 1}]}"#);
        backend.up(&tanks).await.unwrap();

        let path = dir.path().join("warnet").join(COMPOSE_FILE_NAME);
        let file = ComposeFile::from_yaml(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(file.services.len(), 2);
        assert!(runner.invoked("docker compose -p warnet -f"));
        assert!(runner.invoked("up --detach"));
    }

    #[tokio::test]
    async fn test_addresses_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let tanks = tanks(r#"{"nodes": [{"id": 0}, {"id": 1}], "edges": []}"#);
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("inspect", failed("No such object"));
        let first = ComposeBackend::new(runner.clone(), BackendConfig::default(), &network(dir.path()));
        first.up(&tanks).await.unwrap();
        let before = first.tank_ipv4(1).await.unwrap();

        let second = ComposeBackend::new(runner, BackendConfig::default(), &network(dir.path()));
        assert_eq!(second.tank_ipv4(1).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_tank_ipv4_prefers_observed_address() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "inspect warnet-tank-000002",
            ok(&json!([{ "NetworkSettings": { "Networks": { "warnet": { "IPAddress": "100.1.2.3" } } } }]).to_string()),
        );
        let backend = ComposeBackend::new(runner, BackendConfig::default(), &network(dir.path()));
        assert_eq!(backend.tank_ipv4(2).await.unwrap(), Some(Ipv4Addr::new(100, 1, 2, 3)));
    }

    #[tokio::test]
    async fn test_down_falls_back_to_removing_containers() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("rm -f warnet-tank-000001-exporter", failed("permission denied"));
        let backend = ComposeBackend::new(runner.clone(), BackendConfig::default(), &network(dir.path()));
        let tanks = tanks(r#"{"nodes": [{"id": 0}, {"id": 1}], "edges": []}"#);
        let err = backend.down(&tanks).await.unwrap_err();
        match err {
            BackendError::Bulk { failures, .. } => assert_eq!(failures.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
        assert!(runner.invoked("rm -f warnet-tank-000000"));
    }
}
