//! # Control API Flows
//!
//! JSON-RPC requests through the `warnet-server` router against a network of
//! mock tanks, covering the request path from HTTP body to core service.
//!
//! ## Flow Tested:
//!
//! 1. **network namespace**: info, status and channel opening on a loaded network
//! 2. **tank namespace**: bitcoin-cli passthrough and Lightning identity
//! 3. **scenarios namespace**: run, list and stop a bundled scenario
//! 4. **uploads**: a base64 graph deployed through `network_from_file`

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use base64::Engine;
    use serde_json::{json, Value};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use warnet_core::adapters::mock::{MockBackend, MockExecutor, MockLightning, MockNetwork};
    use warnet_core::{LightningNode, Tank, TopologyGraph, Warnet, WarnetConfig};
    use warnet_server::{ControlService, ServerState};

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    const LN: &str = r#"{"nodes": [{"id": 0, "ln": "lnd"}, {"id": 1, "ln": "cln"}, {"id": 2, "ln": "lnd"}],
        "edges": [{"source": 0, "target": 1},
                  {"source": 0, "target": 1, "channel": {"block": 300, "index": 1, "capacity": 100000}},
                  {"source": 1, "target": 2, "channel": {"block": 300, "index": 2, "capacity": 100000}}]}"#;

    struct Harness {
        router: Router,
        state: Arc<ServerState>,
        backend: Arc<MockBackend>,
        executor: Arc<MockExecutor>,
        network: Arc<MockNetwork>,
        nodes: Vec<Arc<MockLightning>>,
    }

    fn config(dir: &Path) -> WarnetConfig {
        let mut config = WarnetConfig::default();
        config.network.config_dir = dir.to_path_buf();
        config.scenarios.dir = dir.join("scenarios");
        config.polling.interval = Duration::from_millis(1);
        config.polling.healthy_timeout = Duration::from_millis(100);
        config.polling.address_interval = Duration::from_millis(1);
        config.polling.address_attempts = 2;
        config.scheduler.connect_stagger = Duration::from_millis(1);
        config.scheduler.poll_interval = Duration::from_millis(1);
        config.scheduler.mempool_timeout = Duration::from_millis(200);
        config.scheduler.funding_timeout = Duration::from_millis(200);
        config.scheduler.gossip_attempts = 5;
        config.scheduler.policy_attempts = 5;
        config
    }

    async fn harness(dir: &Path) -> Harness {
        std::fs::create_dir_all(dir.join("scenarios")).unwrap();
        std::fs::write(dir.join("scenarios").join("miner_std.py"), "\"\"\"Generate blocks.\"\"\"\n").unwrap();

        let config = config(dir);
        let backend = Arc::new(MockBackend::new("warnet"));
        let executor = Arc::new(MockExecutor::new());
        let state = Arc::new(ServerState::new(config.clone(), backend.clone(), executor.clone()));

        let network = MockNetwork::new();
        let mut nodes = Vec::new();
        let graph = TopologyGraph::parse(LN.as_bytes()).unwrap();
        let warnet = Warnet::from_graph_with(graph, config, backend.clone(), |spec, backend| {
            let ln = spec.ln.as_ref().map(|ln| {
                let node = network.add_node(ln.implementation);
                nodes.push(Arc::clone(&node));
                node as Arc<dyn LightningNode>
            });
            Tank::with_clients(spec, backend, network.chain(), ln)
        })
        .unwrap();
        state.set_warnet(warnet).await;

        Harness {
            router: ControlService::new(Arc::clone(&state)).router(),
            state,
            backend,
            executor,
            network,
            nodes,
        }
    }

    async fn rpc(router: &Router, method: &str, params: Value) -> Value {
        let body = json!({ "jsonrpc": "2.0", "id": 7, "method": method, "params": params });
        let response = router
            .clone()
            .oneshot(
                Request::post("/")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let reply: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply["id"], 7);
        reply
    }

    // =============================================================================
    // NETWORK NAMESPACE
    // =============================================================================

    #[tokio::test]
    async fn test_network_info_describes_loaded_graph() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path()).await;
        let reply = rpc(&h.router, "network_info", json!([])).await;
        assert_eq!(reply["result"]["tanks"], 3);
        assert_eq!(reply["result"]["lightning_nodes"], 3);
        assert_eq!(reply["result"]["channels"], 2);
    }

    #[tokio::test]
    async fn test_ln_init_opens_channels_over_rpc() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path()).await;

        let reply = rpc(&h.router, "network_ln_init", json!([])).await;
        let channels = reply["result"]["channels"].as_array().unwrap();
        let scids: Vec<&str> = channels.iter().filter_map(|c| c["short_chan_id"].as_str()).collect();
        assert_eq!(scids, vec!["300x1x0", "300x2x0"]);
        assert_eq!(h.network.height(), 300);

        let reply = rpc(&h.router, "tank_ln_pub_key", json!([1])).await;
        assert_eq!(reply["result"], h.nodes[1].pubkey());
    }

    #[tokio::test]
    async fn test_network_down_unloads_network() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path()).await;
        h.state.warnet().await.unwrap().deploy().await.unwrap();

        let reply = rpc(&h.router, "network_down", json!([])).await;
        assert!(reply["result"].as_str().unwrap().contains("warnet"));
        assert_eq!(h.backend.down_calls(), 1);

        // the deploy persisted graph.json, so the next request reloads it
        let reply = rpc(&h.router, "network_info", json!([])).await;
        assert_eq!(reply["result"]["tanks"], 3);
    }

    #[tokio::test]
    async fn test_network_from_file_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path()).await;
        let encoded = base64::engine::general_purpose::STANDARD.encode(LN);

        // the harness network is only in memory, yet still gets torn down
        let reply = rpc(&h.router, "network_from_file", json!({ "graph_file": encoded })).await;
        assert_eq!(reply["result"]["tanks"], 3);
        assert_eq!(h.backend.up_calls(), 1);
        assert_eq!(h.backend.down_calls(), 1);

        let reply = rpc(&h.router, "network_from_file", json!([encoded])).await;
        assert_eq!(reply["error"]["code"], -32600);
        assert_eq!(h.backend.down_calls(), 1);

        let reply = rpc(&h.router, "network_from_file", json!([encoded, true])).await;
        assert!(reply.get("error").is_none(), "{reply}");
        assert_eq!(h.backend.up_calls(), 2);
        assert_eq!(h.backend.down_calls(), 2);
    }

    #[tokio::test]
    async fn test_network_from_file_force_tears_down_persisted_network() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path()).await;
        h.state.warnet().await.unwrap().deploy().await.unwrap();
        h.state.clear_warnet().await;
        let encoded = base64::engine::general_purpose::STANDARD.encode(LN);

        let reply = rpc(&h.router, "network_from_file", json!([encoded, true])).await;
        assert!(reply.get("error").is_none(), "{reply}");
        assert_eq!(h.backend.down_calls(), 1);
        assert_eq!(h.backend.up_calls(), 2);
    }

    #[tokio::test]
    async fn test_network_from_file_rejects_bad_graph() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path()).await;
        let encoded = base64::engine::general_purpose::STANDARD.encode(r#"{"nodes": [{"id": 1}], "edges": []}"#);
        let reply = rpc(&h.router, "network_from_file", json!([encoded])).await;
        assert_eq!(reply["error"]["code"], -32602);
        assert_eq!(h.backend.up_calls(), 0);
    }

    // =============================================================================
    // TANK NAMESPACE
    // =============================================================================

    #[tokio::test]
    async fn test_bcli_passthrough_and_command_failure() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path()).await;
        h.state.warnet().await.unwrap().deploy().await.unwrap();
        h.backend.respond_exec("getblockcount", "301");
        h.backend.fail_exec("getbestblockhash", 28, "Loading block index");

        let reply = rpc(&h.router, "tank_bcli", json!([0, "getblockcount"])).await;
        assert_eq!(reply["result"].as_str().unwrap().trim(), "301");

        let reply = rpc(&h.router, "tank_bcli", json!({ "node": 2, "method": "getbestblockhash" })).await;
        assert_eq!(reply["error"]["code"], -32002);
        assert_eq!(reply["error"]["data"]["exit_code"], 28);

        let reply = rpc(&h.router, "tank_bcli", json!([9, "getblockcount"])).await;
        assert_eq!(reply["error"]["code"], -32001);
    }

    // =============================================================================
    // SCENARIOS NAMESPACE
    // =============================================================================

    #[tokio::test]
    async fn test_scenario_run_list_stop() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path()).await;

        let reply = rpc(&h.router, "scenarios_available", json!([])).await;
        assert_eq!(reply["result"][0]["name"], "miner_std");
        assert_eq!(reply["result"][0]["description"], "Generate blocks.");

        let reply = rpc(&h.router, "scenarios_run", json!(["miner_std", ["--allnodes"]])).await;
        let job_id = reply["result"]["job_id"].as_str().unwrap().to_string();
        let launched = h.executor.launched();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].snapshot.len(), 3);

        let reply = rpc(&h.router, "scenarios_list_running", json!([])).await;
        assert_eq!(reply["result"].as_array().unwrap().len(), 1);

        let reply = rpc(&h.router, "scenarios_stop", json!([job_id])).await;
        assert_eq!(reply["result"], format!("Stopped scenario with PID {job_id}"));
        let reply = rpc(&h.router, "scenarios_stop", json!([job_id])).await;
        assert_eq!(reply["error"]["code"], -32001);
    }

    #[tokio::test]
    async fn test_unknown_scenario_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path()).await;
        let reply = rpc(&h.router, "scenarios_run", json!(["nope"])).await;
        assert_eq!(reply["error"]["code"], -32001);
        assert!(h.executor.launched().is_empty());
    }
}
