//! Scenario jobs as ephemeral commander pods.
//!
//! Each run gets two immutable ConfigMaps, `{pod}-warnetjson` holding the
//! topology snapshot and `{pod}-scenario` holding the script, both mounted
//! into a `restartPolicy: Never` pod labeled `mission: commander`.

use super::Kubectl;
use crate::domain::scenario::{CommanderJob, ScenarioStatus, COMMANDER_ROLE};
use crate::error::{BackendError, BackendResult};
use crate::ports::outbound::{CommandRunner, JobStatus, ScenarioExecutor};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, instrument};

const SHARED: &str = "/shared";
const SNAPSHOT_FILE: &str = "warnet.json";
const SCRIPT_FILE: &str = "scenario.py";

pub struct KubernetesScenarioExecutor {
    kubectl: Kubectl,
    image: String,
}

impl KubernetesScenarioExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        kubectl: impl Into<String>,
        namespace: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            kubectl: Kubectl::new(runner, kubectl, namespace),
            image: image.into(),
        }
    }

    fn config_map(&self, name: &str, pod: &str, file: &str, contents: &[u8]) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": name,
                "namespace": self.kubectl.namespace(),
                "labels": { "mission": COMMANDER_ROLE, "pod": pod },
            },
            "immutable": true,
            "binaryData": { file: base64::engine::general_purpose::STANDARD.encode(contents) },
        })
    }

    fn pod(&self, pod: &str, job: &CommanderJob) -> Value {
        let mut args = vec!["python3".to_string(), format!("{SHARED}/{SCRIPT_FILE}")];
        args.extend(job.script_args());
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": pod,
                "namespace": self.kubectl.namespace(),
                "labels": {
                    "mission": COMMANDER_ROLE,
                    "scenario": job.name,
                    "network": job.network,
                },
            },
            "spec": {
                "restartPolicy": "Never",
                "containers": [{
                    "name": COMMANDER_ROLE,
                    "image": self.image,
                    "args": args,
                    "volumeMounts": [
                        { "name": "warnetjson", "mountPath": format!("{SHARED}/{SNAPSHOT_FILE}"), "subPath": SNAPSHOT_FILE },
                        { "name": "scenario", "mountPath": format!("{SHARED}/{SCRIPT_FILE}"), "subPath": SCRIPT_FILE },
                    ],
                }],
                "volumes": [
                    { "name": "warnetjson", "configMap": { "name": format!("{pod}-warnetjson") } },
                    { "name": "scenario", "configMap": { "name": format!("{pod}-scenario") } },
                ],
            }
        })
    }
}

/// `commander-{name}-{unix seconds}` with the name made DNS-safe
pub fn commander_pod_name(scenario: &str, now_secs: u64) -> String {
    let name: String = scenario
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{COMMANDER_ROLE}-{}-{now_secs}", name.trim_matches('-'))
}

/// Status of a commander pod
pub fn job_status(pod: &Value) -> JobStatus {
    let status = ScenarioStatus::from_phase(pod["status"]["phase"].as_str().unwrap_or_default());
    let return_code = pod["status"]["containerStatuses"][0]["state"]["terminated"]["exitCode"]
        .as_i64()
        .and_then(|c| i32::try_from(c).ok());
    JobStatus {
        job_id: pod["metadata"]["name"].as_str().unwrap_or_default().to_string(),
        name: pod["metadata"]["labels"]["scenario"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        status,
        return_code,
    }
}

#[async_trait]
impl ScenarioExecutor for KubernetesScenarioExecutor {
    #[instrument(skip(self, job), fields(scenario = %job.name))]
    async fn launch(&self, job: &CommanderJob) -> BackendResult<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let pod = commander_pod_name(&job.name, now);
        let snapshot = serde_json::to_vec(&job.snapshot).map_err(|e| BackendError::parse("snapshot", e))?;

        self.kubectl
            .apply(&self.config_map(&format!("{pod}-warnetjson"), &pod, SNAPSHOT_FILE, &snapshot))
            .await?;
        self.kubectl
            .apply(&self.config_map(&format!("{pod}-scenario"), &pod, SCRIPT_FILE, &job.script))
            .await?;
        self.kubectl.apply(&self.pod(&pod, job)).await?;
        info!(pod = %pod, "commander scheduled");
        Ok(pod)
    }

    async fn status(&self, job_id: &str) -> BackendResult<Option<JobStatus>> {
        Ok(self.kubectl.get("pod", job_id).await?.as_ref().map(job_status))
    }

    async fn list(&self) -> BackendResult<Vec<JobStatus>> {
        let pods = self
            .kubectl
            .list("pods", &format!("mission={COMMANDER_ROLE}"))
            .await?;
        Ok(pods.iter().map(job_status).collect())
    }

    #[instrument(skip(self))]
    async fn stop(&self, job_id: &str) -> BackendResult<()> {
        self.kubectl
            .delete("pod", &[job_id], &["--grace-period=0", "--force"])
            .await?;
        let snapshot = format!("{job_id}-warnetjson");
        let script = format!("{job_id}-scenario");
        self.kubectl.delete("configmap", &[&snapshot, &script], &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::ScriptedRunner;
    use crate::ports::outbound::CommandOutput;

    fn job() -> CommanderJob {
        CommanderJob {
            name: "tx_flood".into(),
            network: "warnet".into(),
            script: b"print('hi')".to_vec(),
            snapshot: Vec::new(),
            args: vec!["--interval=5".into()],
        }
    }

    #[test]
    fn test_pod_name_is_dns_safe() {
        assert_eq!(commander_pod_name("tx_flood", 1700000000), "commander-tx-flood-1700000000");
        assert_eq!(commander_pod_name("Miner.Std", 1), "commander-miner-std-1");
    }

    #[tokio::test]
    async fn test_launch_creates_config_maps_then_pod() {
        let runner = Arc::new(ScriptedRunner::new());
        let executor = KubernetesScenarioExecutor::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            "kubectl",
            "warnet",
            "commander:latest",
        );
        let pod = executor.launch(&job()).await.unwrap();
        assert!(pod.starts_with("commander-tx-flood-"));

        let applied: Vec<Value> = runner
            .stdin_log()
            .iter()
            .map(|b| serde_json::from_slice(b).unwrap())
            .collect();
        assert_eq!(applied.len(), 3);
        assert_eq!(applied[0]["kind"], "ConfigMap");
        assert_eq!(applied[0]["immutable"], true);
        assert_eq!(applied[1]["metadata"]["name"], format!("{pod}-scenario"));
        let spec = &applied[2]["spec"];
        assert_eq!(spec["restartPolicy"], "Never");
        assert_eq!(applied[2]["metadata"]["labels"]["mission"], "commander");
        let args = spec["containers"][0]["args"].as_array().unwrap();
        assert_eq!(args[2], "--network=warnet");
        assert_eq!(args[3], "--interval=5");
    }

    #[tokio::test]
    async fn test_list_maps_phases() {
        let runner = Arc::new(ScriptedRunner::new());
        let pods = json!({ "items": [
            { "metadata": { "name": "commander-a-1", "labels": { "scenario": "a" } }, "status": { "phase": "Running" } },
            { "metadata": { "name": "commander-b-1", "labels": { "scenario": "b" } }, "status": {
                "phase": "Failed",
                "containerStatuses": [{ "state": { "terminated": { "exitCode": 1 } } }]
            } },
        ]});
        runner.respond(
            "get pods -l mission=commander",
            CommandOutput {
                exit_code: 0,
                stdout: pods.to_string(),
                stderr: String::new(),
            },
        );
        let executor = KubernetesScenarioExecutor::new(runner, "kubectl", "warnet", "img");
        let jobs = executor.list().await.unwrap();
        assert_eq!(jobs[0].status, ScenarioStatus::Running);
        assert_eq!(jobs[1].status, ScenarioStatus::Failed);
        assert_eq!(jobs[1].return_code, Some(1));
        assert_eq!(jobs[1].name, "b");
    }

    #[tokio::test]
    async fn test_stop_force_deletes_pod() {
        let runner = Arc::new(ScriptedRunner::new());
        let executor = KubernetesScenarioExecutor::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            "kubectl",
            "warnet",
            "img",
        );
        executor.stop("commander-a-1").await.unwrap();
        assert!(runner.invoked("delete pod commander-a-1 --ignore-not-found --grace-period=0 --force"));
        assert!(runner.invoked("delete configmap commander-a-1-warnetjson commander-a-1-scenario"));
    }
}
