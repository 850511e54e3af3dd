//! Typed docker-compose file for a tank network.
//!
//! ```text
//! {net}-tank-000001 (bitcoin, static IP from the pool)
//!        ▲ depends_on: service_healthy
//! {net}-tank-ln-000001 ──shares volume──→ {net}-tank-ln-000001-cb
//! {net}-tank-000001-exporter ──rpc──→ {net}-tank-000001
//! ```

use crate::config::BackendConfig;
use crate::domain::graph::LnSpec;
use crate::domain::ip_pool::Ipv4Pool;
use crate::domain::lightning::LND_MOUNT_PATH;
use crate::domain::status::ServiceType;
use crate::domain::tank::TankSpec;
use crate::error::{BackendError, BackendResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeFile {
    pub services: BTreeMap<String, ComposeService>,
    pub networks: BTreeMap<String, ComposeNetwork>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeService {
    pub container_name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, ServiceNetwork>,
    /// `service:<name>` to share another container's network stack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub depends_on: BTreeMap<String, DependsOn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceNetwork {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Healthcheck {
    pub test: Vec<String>,
    pub interval: String,
    pub timeout: String,
    pub retries: u32,
    pub start_period: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependsOn {
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeNetwork {
    pub name: String,
    pub driver: String,
    pub ipam: Ipam,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ipam {
    pub config: Vec<IpamConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpamConfig {
    pub subnet: String,
    pub gateway: Ipv4Addr,
}

impl ComposeFile {
    pub fn to_yaml(&self) -> BackendResult<String> {
        serde_yaml::to_string(self).map_err(|e| BackendError::parse("compose file", e))
    }

    pub fn from_yaml(text: &str) -> BackendResult<Self> {
        serde_yaml::from_str(text).map_err(|e| BackendError::parse("compose file", e))
    }
}

fn labels(tank: &TankSpec) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("network".to_string(), tank.network_name.clone()),
        ("mission".to_string(), "tank".to_string()),
        ("tank_index".to_string(), tank.index.to_string()),
    ])
}

fn on_network(network: &str, addr: Option<Ipv4Addr>) -> BTreeMap<String, ServiceNetwork> {
    BTreeMap::from([(network.to_string(), ServiceNetwork { ipv4_address: addr })])
}

fn address(pool: &Ipv4Pool, index: usize) -> BackendResult<Ipv4Addr> {
    pool.address_for(index).ok_or_else(|| BackendError::NotFound {
        resource: format!("free address in {} for tank {index}", pool.subnet()),
    })
}

fn bitcoin_service(tank: &TankSpec, pool: &Ipv4Pool) -> BackendResult<ComposeService> {
    let peers = tank
        .init_peers
        .iter()
        .map(|peer| address(pool, *peer).map(|a| a.to_string()))
        .collect::<BackendResult<Vec<_>>>()?;
    Ok(ComposeService {
        container_name: tank.resource_name(ServiceType::Bitcoin),
        image: tank.bitcoin_image(),
        environment: BTreeMap::from([("BITCOIN_ARGS".to_string(), tank.bitcoin_args(&peers))]),
        networks: on_network(&tank.network_name, Some(address(pool, tank.index)?)),
        labels: labels(tank),
        privileged: true,
        cap_add: vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()],
        healthcheck: Some(Healthcheck {
            test: vec!["CMD-SHELL".to_string(), tank.cli_command("getblockcount", &[])],
            interval: "2s".to_string(),
            timeout: "2s".to_string(),
            retries: 3,
            start_period: "5s".to_string(),
        }),
        restart: Some("on-failure".to_string()),
        ..Default::default()
    })
}

fn exporter_service(tank: &TankSpec, config: &BackendConfig) -> ComposeService {
    ComposeService {
        container_name: format!("{}-exporter", tank.resource_name(ServiceType::Bitcoin)),
        image: config.prometheus_exporter_image.clone(),
        environment: BTreeMap::from([
            ("BITCOIN_RPC_HOST".to_string(), tank.resource_name(ServiceType::Bitcoin)),
            ("BITCOIN_RPC_PORT".to_string(), tank.rpc.port.to_string()),
            ("BITCOIN_RPC_USER".to_string(), tank.rpc.user.clone()),
            ("BITCOIN_RPC_PASSWORD".to_string(), tank.rpc.password.clone()),
        ]),
        networks: on_network(&tank.network_name, None),
        labels: labels(tank),
        ..Default::default()
    }
}

fn lightning_services(tank: &TankSpec, ln: &LnSpec, volumes: &mut BTreeMap<String, BTreeMap<String, String>>) -> Vec<ComposeService> {
    let bitcoin = tank.resource_name(ServiceType::Bitcoin);
    let name = tank.resource_name(ServiceType::Lightning);
    let mut node = ComposeService {
        container_name: name.clone(),
        image: ln.image().to_string(),
        command: ln.node_args(tank, &name, &bitcoin),
        environment: BTreeMap::from([("LN_IMPL".to_string(), ln.implementation.to_string())]),
        networks: on_network(&tank.network_name, None),
        labels: labels(tank),
        privileged: true,
        cap_add: vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()],
        healthcheck: Some(Healthcheck {
            test: vec!["CMD-SHELL".to_string(), ln.ready_command()],
            interval: "2s".to_string(),
            timeout: "2s".to_string(),
            retries: 3,
            start_period: "10s".to_string(),
        }),
        depends_on: BTreeMap::from([(
            bitcoin,
            DependsOn {
                condition: "service_healthy".to_string(),
            },
        )]),
        restart: Some("on-failure".to_string()),
        ..Default::default()
    };

    let mut services = Vec::new();
    if let (Some(cb_image), Some(cb_args)) = (&ln.cb_image, ln.circuit_breaker_args()) {
        let volume = format!("ln-cb-data-{}", tank.index);
        let mount = format!("{volume}:{LND_MOUNT_PATH}");
        volumes.insert(volume, BTreeMap::new());
        node.volumes.push(mount.clone());
        services.push(ComposeService {
            container_name: format!("{name}-cb"),
            image: cb_image.clone(),
            command: cb_args,
            network_mode: Some(format!("service:{name}")),
            labels: labels(tank),
            volumes: vec![mount],
            depends_on: BTreeMap::from([(
                name.clone(),
                DependsOn {
                    condition: "service_healthy".to_string(),
                },
            )]),
            restart: Some("on-failure".to_string()),
            ..Default::default()
        });
    }
    services.insert(0, node);
    services
}

/// Render the compose file for `tanks` on `network`, taking addresses from `pool`.
pub fn render(tanks: &[TankSpec], network: &str, pool: &Ipv4Pool, config: &BackendConfig) -> BackendResult<ComposeFile> {
    let mut services = BTreeMap::new();
    let mut volumes = BTreeMap::new();
    for tank in tanks {
        let mut tank_services = vec![bitcoin_service(tank, pool)?];
        if tank.exporter {
            tank_services.push(exporter_service(tank, config));
        }
        if let Some(ln) = &tank.ln {
            tank_services.extend(lightning_services(tank, ln, &mut volumes));
        }
        for service in tank_services {
            services.insert(service.container_name.clone(), service);
        }
    }

    let subnet = pool.subnet();
    let networks = BTreeMap::from([(
        network.to_string(),
        ComposeNetwork {
            name: network.to_string(),
            driver: "bridge".to_string(),
            ipam: Ipam {
                config: vec![IpamConfig {
                    subnet: subnet.to_string(),
                    gateway: subnet.gateway(),
                }],
            },
        },
    )]);

    Ok(ComposeFile {
        services,
        networks,
        volumes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::TopologyGraph;
    use crate::domain::ip_pool::Subnet;

    fn tanks(doc: &str) -> Vec<TankSpec> {
        let graph = TopologyGraph::parse(doc.as_bytes()).unwrap();
        graph
            .nodes()
            .iter()
            .map(|n| TankSpec::from_node(n, &graph, "warnet").unwrap())
            .collect()
    }

    #[test]
    fn test_peers_are_pool_addresses() {
        let pool = Ipv4Pool::new("100.0.0.0/16".parse::<Subnet>().unwrap());
        let tanks = tanks(r#"{"nodes": [{"id": 0}, {"id": 1}], "edges": [{"source": 0, "target": 1}]}"#);
        let file = render(&tanks, "warnet", &pool, &BackendConfig::default()).unwrap();

        let peer_ip = pool.address_for(1).unwrap();
        let tank0 = &file.services["warnet-tank-000000"];
        assert!(tank0.environment["BITCOIN_ARGS"].contains(&format!("-addnode={peer_ip}")));
        let tank1 = &file.services["warnet-tank-000001"];
        assert_eq!(tank1.networks["warnet"].ipv4_address, Some(peer_ip));
        assert_eq!(file.networks["warnet"].ipam.config[0].subnet, "100.0.0.0/16");
    }

    #[test]
    fn test_lightning_waits_for_healthy_bitcoin() {
        let pool = Ipv4Pool::new(Subnet::default());
        let tanks = tanks(r#"{"nodes": [{"id": 0, "ln": "lnd", "ln_cb_image": "cb:latest"}], "edges": []}"#);
        let file = render(&tanks, "warnet", &pool, &BackendConfig::default()).unwrap();

        let ln = &file.services["warnet-tank-ln-000000"];
        assert_eq!(ln.depends_on["warnet-tank-000000"].condition, "service_healthy");
        let cb = &file.services["warnet-tank-ln-000000-cb"];
        assert_eq!(cb.network_mode.as_deref(), Some("service:warnet-tank-ln-000000"));
        assert!(file.volumes.contains_key("ln-cb-data-0"));

        let yaml = file.to_yaml().unwrap();
        assert_eq!(ComposeFile::from_yaml(&yaml).unwrap(), file);
    }
}
