//! Backend over a Kubernetes namespace: one Pod and one Service per container group.

use super::manifests::{self, bitcoin_manifests, lightning_manifests, manifest_list};
use super::Kubectl;
use crate::adapters::image::ImageBuilder;
use crate::config::{BackendConfig, BackendKind};
use crate::domain::status::{RunningStatus, ServiceType};
use crate::domain::tank::{resource_name, TankSpec};
use crate::error::{BackendError, BackendResult};
use crate::ports::outbound::{Backend, CommandRunner};
use async_trait::async_trait;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub struct KubernetesBackend {
    kubectl: Kubectl,
    images: ImageBuilder,
    config: BackendConfig,
    network: String,
}

impl KubernetesBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, config: BackendConfig, network: impl Into<String>) -> Self {
        Self {
            kubectl: Kubectl::new(Arc::clone(&runner), config.kubectl.clone(), config.namespace.clone()),
            images: ImageBuilder::new(runner, config.docker.clone(), config.images_dir.clone()),
            config,
            network: network.into(),
        }
    }

    fn pod_name(&self, index: usize, service: ServiceType) -> String {
        resource_name(&self.network, index, service)
    }

    /// Apply a manifest unless it is a Pod that already exists. Pod specs are
    /// immutable, so re-running `up` leaves live pods alone.
    async fn ensure(&self, manifest: &Value) -> BackendResult<()> {
        let kind = manifest["kind"].as_str().unwrap_or_default();
        let name = manifest["metadata"]["name"].as_str().unwrap_or_default();
        if kind == "Pod" && self.kubectl.get("pod", name).await?.is_some() {
            debug!(pod = name, "pod exists, leaving it in place");
            return Ok(());
        }
        self.kubectl.apply(manifest).await
    }

    async fn ensure_all(&self, manifests: Vec<Value>, failures: &mut Vec<String>) {
        for manifest in &manifests {
            if let Err(e) = self.ensure(manifest).await {
                let name = manifest["metadata"]["name"].as_str().unwrap_or("?");
                warn!(resource = name, error = %e, "failed to create resource");
                failures.push(format!("{name}: {e}"));
            }
        }
    }
}

/// Derive a tank status from a pod object.
pub fn pod_status(pod: &Value) -> RunningStatus {
    match pod["status"]["phase"].as_str() {
        Some("Pending") => RunningStatus::Pending,
        Some("Running") => {
            let statuses = pod["status"]["containerStatuses"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            let failed = statuses.iter().any(|c| {
                ["state", "lastState"].iter().any(|key| {
                    c[key]["terminated"]["exitCode"]
                        .as_i64()
                        .is_some_and(|code| code != 0)
                }) && !c["ready"].as_bool().unwrap_or(false)
            });
            if failed {
                RunningStatus::Failed
            } else if !statuses.is_empty() && statuses.iter().all(|c| c["ready"].as_bool() == Some(true)) {
                RunningStatus::Running
            } else {
                RunningStatus::Pending
            }
        }
        Some("Succeeded") => RunningStatus::Stopped,
        Some("Failed") => RunningStatus::Failed,
        _ => RunningStatus::Unknown,
    }
}

#[async_trait]
impl Backend for KubernetesBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kubernetes
    }

    fn network_name(&self) -> &str {
        &self.network
    }

    async fn build(&self, tanks: &[TankSpec]) -> BackendResult<bool> {
        self.images.build_all(tanks).await
    }

    #[instrument(skip(self, tanks), fields(network = %self.network, tanks = tanks.len()))]
    async fn up(&self, tanks: &[TankSpec]) -> BackendResult<()> {
        let mut failures = Vec::new();
        for tank in tanks {
            self.ensure_all(bitcoin_manifests(tank, &self.config), &mut failures).await;
        }

        for tank in tanks.iter().filter(|t| t.ln.is_some()) {
            let service = tank.service_name(ServiceType::Bitcoin);
            match self.kubectl.get("service", &service).await {
                Ok(Some(_)) => self.ensure_all(lightning_manifests(tank, &self.config), &mut failures).await,
                Ok(None) => failures.push(format!(
                    "{}: bitcoin service {service} missing",
                    tank.resource_name(ServiceType::Lightning)
                )),
                Err(e) => failures.push(format!("{service}: {e}")),
            }
        }

        if failures.is_empty() {
            info!("all tank resources created");
            Ok(())
        } else {
            Err(BackendError::Bulk {
                operation: "up".to_string(),
                failures,
            })
        }
    }

    #[instrument(skip(self, tanks), fields(network = %self.network, tanks = tanks.len()))]
    async fn down(&self, tanks: &[TankSpec]) -> BackendResult<()> {
        let mut failures = Vec::new();
        for tank in tanks {
            let mut services = vec![ServiceType::Bitcoin];
            if tank.ln.is_some() {
                services.insert(0, ServiceType::Lightning);
            }
            for service in services {
                let pod = tank.resource_name(service);
                let svc = tank.service_name(service);
                if let Err(e) = self.kubectl.delete("pod", &[&pod], &["--wait=false"]).await {
                    failures.push(format!("{pod}: {e}"));
                }
                if let Err(e) = self.kubectl.delete("service", &[&svc], &[]).await {
                    failures.push(format!("{svc}: {e}"));
                }
            }
        }
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
        let pod = self.kubectl.get("pod", &self.pod_name(index, service)).await?;
        Ok(pod.as_ref().map(pod_status).unwrap_or(RunningStatus::Stopped))
    }

    #[instrument(skip(self))]
    async fn exec(&self, index: usize, service: ServiceType, cmd: &str) -> BackendResult<String> {
        self.kubectl
            .exec(&self.pod_name(index, service), service.container_name(), cmd)
            .await
    }

    async fn logs(&self, index: usize, service: ServiceType) -> BackendResult<String> {
        self.kubectl
            .logs(&self.pod_name(index, service), service.container_name())
            .await
    }

    async fn tank_ipv4(&self, index: usize) -> BackendResult<Option<Ipv4Addr>> {
        let Some(pod) = self.kubectl.get("pod", &self.pod_name(index, ServiceType::Bitcoin)).await? else {
            return Ok(None);
        };
        match pod["status"]["podIP"].as_str() {
            Some(ip) => ip
                .parse()
                .map(Some)
                .map_err(|e| BackendError::parse(format!("pod IP of tank {index}"), e)),
            None => Ok(None),
        }
    }

    fn lightning_host(&self, tank: &TankSpec) -> String {
        manifests::lightning_host(tank, &self.config.namespace)
    }

    fn generate_deployment(&self, tanks: &[TankSpec]) -> BackendResult<String> {
        let items: Vec<Value> = tanks
            .iter()
            .flat_map(|t| {
                let mut all = bitcoin_manifests(t, &self.config);
                all.extend(lightning_manifests(t, &self.config));
                all
            })
            .collect();
        serde_yaml::to_string(&manifest_list(items)).map_err(|e| BackendError::parse("deployment", e))
    }
}
