//! Pod and Service manifests for one tank.
//!
//! ```text
//! {net}-tank-000001-service ──selects──→ {net}-tank-000001 (bitcoin, exporter)
//!        ▲ rpc / zmq
//!        │ (init container waits for rpc)
//! {net}-tank-ln-000001-service ──selects──→ {net}-tank-ln-000001 (ln, circuit breaker)
//! ```
//!
//! Manifests are plain JSON values applied with `kubectl apply -f -`.

use crate::config::BackendConfig;
use crate::domain::graph::LnSpec;
use crate::domain::lightning::{LND_MOUNT_PATH, LN_RPC_PORT};
use crate::domain::status::ServiceType;
use crate::domain::tank::{resource_name, TankSpec, METRICS_PORT, P2P_PORT, ZMQ_BLOCK_PORT, ZMQ_TX_PORT};
use serde_json::{json, Value};

/// Capabilities tanks need to apply tc-netem
fn security_context() -> Value {
    json!({
        "privileged": true,
        "capabilities": { "add": ["NET_ADMIN", "NET_RAW"] }
    })
}

fn metadata(tank: &TankSpec, name: &str, namespace: &str) -> Value {
    json!({
        "name": name,
        "namespace": namespace,
        "labels": {
            "app": name,
            "network": tank.network_name,
            "mission": "tank",
        }
    })
}

/// DNS name other pods use to reach the tank's lightning node
pub fn lightning_host(tank: &TankSpec, namespace: &str) -> String {
    format!("{}.{namespace}", tank.service_name(ServiceType::Lightning))
}

pub fn bitcoin_pod(tank: &TankSpec, config: &BackendConfig) -> Value {
    let name = tank.resource_name(ServiceType::Bitcoin);
    let peers: Vec<String> = tank
        .init_peers
        .iter()
        .map(|peer| format!("{}-service", resource_name(&tank.network_name, *peer, ServiceType::Bitcoin)))
        .collect();

    let mut containers = vec![json!({
        "name": ServiceType::Bitcoin.container_name(),
        "image": tank.bitcoin_image(),
        "env": [{ "name": "BITCOIN_ARGS", "value": tank.bitcoin_args(&peers) }],
        "livenessProbe": {
            "failureThreshold": 3,
            "initialDelaySeconds": 5,
            "periodSeconds": 5,
            "timeoutSeconds": 1,
            "exec": { "command": ["pidof", "bitcoind"] }
        },
        "readinessProbe": {
            "failureThreshold": 1,
            "initialDelaySeconds": 0,
            "periodSeconds": 1,
            "timeoutSeconds": 1,
            "tcpSocket": { "port": tank.rpc.port }
        },
        "securityContext": security_context(),
    })];

    if tank.exporter {
        containers.push(json!({
            "name": "prometheus",
            "image": config.prometheus_exporter_image,
            "env": [
                { "name": "BITCOIN_RPC_HOST", "value": "127.0.0.1" },
                { "name": "BITCOIN_RPC_PORT", "value": tank.rpc.port.to_string() },
                { "name": "BITCOIN_RPC_USER", "value": tank.rpc.user },
                { "name": "BITCOIN_RPC_PASSWORD", "value": tank.rpc.password },
            ]
        }));
    }

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": metadata(tank, &name, &config.namespace),
        "spec": {
            "restartPolicy": "OnFailure",
            "containers": containers,
        }
    })
}

pub fn bitcoin_service(tank: &TankSpec, config: &BackendConfig) -> Value {
    let pod = tank.resource_name(ServiceType::Bitcoin);
    let port = |name: &str, port: u16| json!({ "name": name, "port": port, "targetPort": port });
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": metadata(tank, &tank.service_name(ServiceType::Bitcoin), &config.namespace),
        "spec": {
            "selector": { "app": pod },
            "publishNotReadyAddresses": true,
            "ports": [
                port("p2p", P2P_PORT),
                port("rpc", tank.rpc.port),
                port("zmqblock", ZMQ_BLOCK_PORT),
                port("zmqtx", ZMQ_TX_PORT),
                port("prometheus-metrics", METRICS_PORT),
            ]
        }
    })
}

pub fn lightning_pod(tank: &TankSpec, ln: &LnSpec, config: &BackendConfig) -> Value {
    let name = tank.resource_name(ServiceType::Lightning);
    let bitcoin_host = format!("{}.{}", tank.service_name(ServiceType::Bitcoin), config.namespace);
    let ln_host = lightning_host(tank, &config.namespace);

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    let mut containers = Vec::new();
    if let (Some(cb_image), Some(cb_args)) = (&ln.cb_image, ln.circuit_breaker_args()) {
        let volume = format!("ln-cb-data-{}", tank.index);
        volumes.push(json!({ "name": volume, "emptyDir": {} }));
        mounts.push(json!({ "name": volume, "mountPath": LND_MOUNT_PATH }));
        containers.push(json!({
            "name": "circuitbreaker",
            "image": cb_image,
            "args": cb_args,
            "securityContext": security_context(),
            "volumeMounts": mounts,
        }));
    }
    containers.push(json!({
        "name": ServiceType::Lightning.container_name(),
        "image": ln.image(),
        "args": ln.node_args(tank, &ln_host, &bitcoin_host),
        "env": [{ "name": "LN_IMPL", "value": ln.implementation.to_string() }],
        "livenessProbe": {
            "failureThreshold": 3,
            "initialDelaySeconds": 10,
            "periodSeconds": 5,
            "timeoutSeconds": 1,
            "exec": { "command": ["pidof", ln.implementation.daemon()] }
        },
        "readinessProbe": {
            "failureThreshold": 1,
            "successThreshold": 3,
            "initialDelaySeconds": 10,
            "periodSeconds": 2,
            "timeoutSeconds": 2,
            "exec": { "command": ["/bin/sh", "-c", ln.ready_command()] }
        },
        "securityContext": security_context(),
        "volumeMounts": mounts,
    }));

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": metadata(tank, &name, &config.namespace),
        "spec": {
            "restartPolicy": "OnFailure",
            // The LN daemon must not start before its bitcoind answers RPC
            "initContainers": [{
                "name": "wait-for-bitcoind",
                "image": config.helper_image,
                "command": [
                    "sh",
                    "-c",
                    format!("until nc -z {bitcoin_host} {}; do sleep 1; done", tank.rpc.port),
                ]
            }],
            "containers": containers,
            "volumes": volumes,
        }
    })
}

pub fn lightning_service(tank: &TankSpec, config: &BackendConfig) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": metadata(tank, &tank.service_name(ServiceType::Lightning), &config.namespace),
        "spec": {
            "selector": { "app": tank.resource_name(ServiceType::Lightning) },
            "clusterIP": "None",
            "publishNotReadyAddresses": true,
            "ports": [{ "name": "rpc", "port": LN_RPC_PORT, "targetPort": LN_RPC_PORT }]
        }
    })
}

/// Bitcoin manifests of one tank, service first
pub fn bitcoin_manifests(tank: &TankSpec, config: &BackendConfig) -> Vec<Value> {
    vec![bitcoin_service(tank, config), bitcoin_pod(tank, config)]
}

/// Lightning manifests of one tank, empty when none is declared
pub fn lightning_manifests(tank: &TankSpec, config: &BackendConfig) -> Vec<Value> {
    match &tank.ln {
        Some(ln) => vec![lightning_service(tank, config), lightning_pod(tank, ln, config)],
        None => Vec::new(),
    }
}

/// Wrap manifests in a `v1/List`
pub fn manifest_list(items: Vec<Value>) -> Value {
    json!({ "apiVersion": "v1", "kind": "List", "items": items })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::TopologyGraph;

    fn tanks(doc: &str) -> Vec<TankSpec> {
        let graph = TopologyGraph::parse(doc.as_bytes()).unwrap();
        graph
            .nodes()
            .iter()
            .map(|n| TankSpec::from_node(n, &graph, "warnet").unwrap())
            .collect()
    }

    const TWO_NODES: &str = r#"{
        "nodes": [{"id": 0, "exporter": true}, {"id": 1, "ln": "lnd", "ln_cb_image": "cb:latest"}],
        "edges": [{"source": 0, "target": 1}]
    }"#;

    #[test]
    fn test_bitcoin_pod_dials_peer_services() {
        let tanks = tanks(TWO_NODES);
        let pod = bitcoin_pod(&tanks[0], &BackendConfig::default());
        assert_eq!(pod["metadata"]["name"], "warnet-tank-000000");
        assert_eq!(pod["metadata"]["labels"]["network"], "warnet");
        assert_eq!(pod["spec"]["restartPolicy"], "OnFailure");
        let args = pod["spec"]["containers"][0]["env"][0]["value"].as_str().unwrap();
        assert!(args.contains("-addnode=warnet-tank-000001-service"));
        assert_eq!(pod["spec"]["containers"][1]["name"], "prometheus");
        assert_eq!(
            pod["spec"]["containers"][0]["readinessProbe"]["tcpSocket"]["port"],
            18443
        );
    }

    #[test]
    fn test_bitcoin_service_named_ports() {
        let tanks = tanks(TWO_NODES);
        let svc = bitcoin_service(&tanks[0], &BackendConfig::default());
        let names: Vec<&str> = svc["spec"]["ports"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["p2p", "rpc", "zmqblock", "zmqtx", "prometheus-metrics"]);
        assert_eq!(svc["spec"]["publishNotReadyAddresses"], true);
    }

    #[test]
    fn test_lightning_pod_waits_for_bitcoind() {
        let tanks = tanks(TWO_NODES);
        let manifests = lightning_manifests(&tanks[1], &BackendConfig::default());
        assert_eq!(manifests.len(), 2);
        let pod = &manifests[1];
        let wait = pod["spec"]["initContainers"][0]["command"][2].as_str().unwrap();
        assert!(wait.contains("warnet-tank-000001-service.warnet 18443"));
        // circuit breaker first, then the daemon
        assert_eq!(pod["spec"]["containers"][0]["name"], "circuitbreaker");
        assert_eq!(pod["spec"]["containers"][1]["env"][0]["value"], "lnd");
        assert!(lightning_manifests(&tanks[0], &BackendConfig::default()).is_empty());
    }

    #[test]
    fn test_lightning_daemon_has_liveness_and_readiness_checks() {
        let tanks = tanks(TWO_NODES);
        let manifests = lightning_manifests(&tanks[1], &BackendConfig::default());
        let daemon = &manifests[1]["spec"]["containers"][1];
        assert_eq!(daemon["livenessProbe"]["exec"]["command"], json!(["pidof", "lnd"]));
        let ready = daemon["readinessProbe"]["exec"]["command"][2].as_str().unwrap();
        assert!(ready.starts_with("lncli"));
    }
}
