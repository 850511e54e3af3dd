//! # Deployment Flows
//!
//! A `Warnet` driven through the real backend adapters, with every
//! orchestrator CLI call answered by a `ScriptedRunner`.
//!
//! ## Flow Tested:
//!
//! 1. **graph file → compose project**: deploy persists the graph, writes the
//!    compose file and starts the project
//! 2. **status and wiring**: container state maps to tank status, P2P edges
//!    dial statically allocated addresses
//! 3. **teardown**: the project is brought down with its volumes
//! 4. **kubernetes rendering**: one pod per service, nothing applied

#[cfg(test)]
mod tests {
    use serde_json::json;
    use std::path::Path;
    use std::sync::Arc;
    use warnet_core::adapters::mock::ScriptedRunner;
    use warnet_core::adapters::{ComposeBackend, KubernetesBackend};
    use warnet_core::config::BackendConfig;
    use warnet_core::domain::RunningStatus;
    use warnet_core::ports::{CommandOutput, CommandRunner};
    use warnet_core::service::warnet::GRAPH_FILE;
    use warnet_core::{Warnet, WarnetConfig};

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    const TRIANGLE: &str = r#"{"nodes": [{"id": 0}, {"id": 1, "ln": "lnd"}, {"id": 2}],
        "edges": [{"source": 0, "target": 1}, {"source": 1, "target": 2}, {"source": 2, "target": 0}]}"#;

    fn config(dir: &Path) -> WarnetConfig {
        let mut config = WarnetConfig::default();
        config.network.config_dir = dir.to_path_buf();
        config
    }

    fn running() -> CommandOutput {
        CommandOutput {
            exit_code: 0,
            stdout: json!([{ "State": { "Status": "running", "ExitCode": 0 } }]).to_string(),
            stderr: String::new(),
        }
    }

    fn compose_warnet(dir: &Path) -> (Warnet, Arc<ScriptedRunner>) {
        let runner = Arc::new(ScriptedRunner::new());
        let config = config(dir);
        let backend = Arc::new(ComposeBackend::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            config.backend.clone(),
            &config.network,
        ));
        let warnet = Warnet::from_graph_file(TRIANGLE.as_bytes(), config, backend).unwrap();
        (warnet, runner)
    }

    // =============================================================================
    // COMPOSE BACKEND
    // =============================================================================

    #[tokio::test]
    async fn test_compose_deploy_persists_graph_and_starts_project() {
        let dir = tempfile::tempdir().unwrap();
        let (warnet, runner) = compose_warnet(dir.path());

        warnet.deploy().await.unwrap();

        let network_dir = dir.path().join("warnet");
        assert!(network_dir.join(GRAPH_FILE).exists());
        assert!(network_dir.join("docker-compose.yml").exists());
        assert!(runner.invoked("compose -p warnet"));
        assert!(runner.invoked("up --detach"));
    }

    #[tokio::test]
    async fn test_compose_deployment_names_every_container() {
        let dir = tempfile::tempdir().unwrap();
        let (warnet, _) = compose_warnet(dir.path());

        let yaml = warnet.generate_deployment().unwrap();
        for name in ["warnet-tank-000000", "warnet-tank-000001", "warnet-tank-000002", "warnet-tank-ln-000001"] {
            assert!(yaml.contains(name), "{name} missing from compose file");
        }
        assert!(!yaml.contains("warnet-tank-ln-000000"));
    }

    #[tokio::test]
    async fn test_compose_status_follows_container_state() {
        let dir = tempfile::tempdir().unwrap();
        let (warnet, runner) = compose_warnet(dir.path());
        runner.respond("inspect", running());
        warnet.deploy().await.unwrap();

        let status = warnet.status().await.unwrap();
        assert_eq!(status.len(), 3);
        assert!(status.iter().all(|s| s.bitcoin_status == RunningStatus::Running));
        assert_eq!(status[1].lightning_status, Some(RunningStatus::Running));
        assert_eq!(status[0].lightning_status, None);
        warnet.wait_for_healthy().await.unwrap();
    }

    #[tokio::test]
    async fn test_compose_edges_dial_allocated_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let (warnet, runner) = compose_warnet(dir.path());
        runner.respond("inspect", running());
        warnet.deploy().await.unwrap();

        warnet.connect_edges().await.unwrap();

        let dials: Vec<String> = runner
            .calls()
            .into_iter()
            .filter(|c| c.contains("exec") && c.contains("addpeeraddress"))
            .collect();
        assert_eq!(dials.len(), 3);
        let target = warnet.tank(1).unwrap().ipv4().await.unwrap().unwrap();
        assert!(dials.iter().any(|c| c.contains("warnet-tank-000000") && c.contains(&target.to_string())));
    }

    #[tokio::test]
    async fn test_compose_teardown_removes_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let (warnet, runner) = compose_warnet(dir.path());
        warnet.deploy().await.unwrap();

        warnet.teardown().await.unwrap();
        assert!(runner.invoked("down --volumes"));
        assert!(!runner.invoked("rm -f"));
    }

    // =============================================================================
    // KUBERNETES BACKEND
    // =============================================================================

    #[test]
    fn test_kubernetes_deployment_renders_without_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let backend = Arc::new(KubernetesBackend::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            BackendConfig::default(),
            "warnet",
        ));
        let warnet = Warnet::from_graph_file(TRIANGLE.as_bytes(), config(dir.path()), backend).unwrap();

        let yaml = warnet.generate_deployment().unwrap();
        assert_eq!(yaml.matches("kind: Pod").count(), 4);
        assert!(yaml.contains("warnet-tank-ln-000001"));
        assert!(runner.calls().is_empty());
    }
}
