//! Container-orchestrator backend (§4.4.a).
//!
//! Creates ephemeral compute units ("pods") labelled with
//! `cloud-instance=<id>`, `team`, `bot-package`, and per-tag prefixed
//! labels, with a restart policy of "never" (a failed unit transitions to
//! `terminated`, never retried). Finds an instance by label selector on
//! `cloud-instance=<id>`.

use crate::{
    error::{CloudControlError, CloudControlResult},
    models::{
        CloudInstance, CloudInstanceFilter, CommandResult, ConnectionInfo, ConnectionProtocol,
        DispatchRequest, InstanceState, Platform, ProviderKind,
    },
    provisioner::{CommandShell, Provisioner},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::RwLock;
use uuid::Uuid;

/// Observed phase of a pod, mirroring the orchestrator's own vocabulary
/// before §4.4.a's phase-to-state mapping is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    fn to_instance_state(self) -> InstanceState {
        match self {
            PodPhase::Pending => InstanceState::Provisioning,
            PodPhase::Running => InstanceState::Running,
            PodPhase::Succeeded | PodPhase::Failed => InstanceState::Terminated,
            PodPhase::Unknown => InstanceState::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PodSpec {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub image: String,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct PodRecord {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub phase: PodPhase,
    pub pod_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The seam to the real container orchestrator client. The default
/// `SimulatedContainerBackend` models boot timing and phase transitions
/// in-process; a real deployment would implement this against a live
/// cluster API.
#[async_trait]
pub trait ContainerBackendClient: Send + Sync {
    async fn create_pod(&self, spec: PodSpec) -> CloudControlResult<PodRecord>;
    async fn find_by_label(&self, namespace: &str, label_value: &str) -> CloudControlResult<Option<PodRecord>>;
    async fn list_pods(&self, namespace: &str) -> CloudControlResult<Vec<PodRecord>>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> CloudControlResult<()>;
    async fn exec(&self, namespace: &str, name: &str, command: &str) -> CloudControlResult<CommandResult>;
    async fn logs(&self, namespace: &str, name: &str, lines: usize) -> CloudControlResult<String>;
}

/// In-process simulated cluster: pods boot (`Pending` -> `Running`) after
/// `boot_delay` has elapsed since creation, and stay `Running` until
/// explicitly deleted.
pub struct SimulatedContainerBackend {
    boot_delay: chrono::Duration,
    pods: RwLock<BTreeMap<String, PodRecord>>,
}

impl SimulatedContainerBackend {
    pub fn new(boot_delay: chrono::Duration) -> Self {
        Self {
            boot_delay,
            pods: RwLock::new(BTreeMap::new()),
        }
    }

    fn observe(&self, record: &PodRecord) -> PodRecord {
        let mut observed = record.clone();
        if observed.phase == PodPhase::Pending && Utc::now() - observed.created_at >= self.boot_delay {
            observed.phase = PodPhase::Running;
            observed.pod_ip = Some("10.42.0.7".to_string());
        }
        observed
    }
}

impl Default for SimulatedContainerBackend {
    fn default() -> Self {
        Self::new(chrono::Duration::zero())
    }
}

#[async_trait]
impl ContainerBackendClient for SimulatedContainerBackend {
    async fn create_pod(&self, spec: PodSpec) -> CloudControlResult<PodRecord> {
        let record = PodRecord {
            name: spec.name.clone(),
            namespace: spec.namespace,
            labels: spec.labels,
            phase: PodPhase::Pending,
            pod_ip: None,
            created_at: Utc::now(),
        };
        self.pods.write().unwrap().insert(spec.name, record.clone());
        Ok(record)
    }

    async fn find_by_label(&self, namespace: &str, label_value: &str) -> CloudControlResult<Option<PodRecord>> {
        let pods = self.pods.read().unwrap();
        Ok(pods
            .values()
            .find(|p| p.namespace == namespace && p.labels.get("cloud-instance").map(String::as_str) == Some(label_value))
            .map(|p| self.observe(p)))
    }

    async fn list_pods(&self, namespace: &str) -> CloudControlResult<Vec<PodRecord>> {
        let pods = self.pods.read().unwrap();
        Ok(pods.values().filter(|p| p.namespace == namespace).map(|p| self.observe(p)).collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> CloudControlResult<()> {
        let mut pods = self.pods.write().unwrap();
        if let Some(pod) = pods.get_mut(name) {
            if pod.namespace == namespace {
                pod.phase = PodPhase::Succeeded;
            }
        }
        Ok(())
    }

    async fn exec(&self, namespace: &str, name: &str, command: &str) -> CloudControlResult<CommandResult> {
        let pods = self.pods.read().unwrap();
        let pod = pods
            .get(name)
            .filter(|p| p.namespace == namespace)
            .ok_or_else(|| CloudControlError::Internal(format!("pod {name} not found")))?;
        let observed = self.observe(pod);

        if observed.phase != PodPhase::Running {
            return Ok(CommandResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: "pod is not running".to_string(),
            });
        }

        Ok(CommandResult {
            exit_code: 0,
            stdout: format!("simulated output for: {command}"),
            stderr: String::new(),
        })
    }

    async fn logs(&self, namespace: &str, name: &str, lines: usize) -> CloudControlResult<String> {
        let pods = self.pods.read().unwrap();
        pods.get(name)
            .filter(|p| p.namespace == namespace)
            .ok_or_else(|| CloudControlError::Internal(format!("pod {name} not found")))?;
        Ok((0..lines.min(10)).map(|i| format!("simulated log line {i}")).collect::<Vec<_>>().join("\n"))
    }
}

/// Container-orchestrator `Provisioner` (§4.4.a).
pub struct ContainerProvisioner {
    client: std::sync::Arc<dyn ContainerBackendClient>,
    namespace: String,
    default_image: String,
    service_account: String,
    control_plane_url: String,
    api_key: String,
}

impl ContainerProvisioner {
    pub fn new(
        client: std::sync::Arc<dyn ContainerBackendClient>,
        namespace: impl Into<String>,
        default_image: impl Into<String>,
        service_account: impl Into<String>,
        control_plane_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            default_image: default_image.into(),
            service_account: service_account.into(),
            control_plane_url: control_plane_url.into(),
            api_key: api_key.into(),
        }
    }

    fn label_selector(id: Uuid) -> String {
        id.to_string()
    }

    fn to_cloud_instance(&self, id: Uuid, record: &PodRecord, request: &DispatchRequest) -> CloudInstance {
        let now = Utc::now();
        let state = record.phase.to_instance_state();
        CloudInstance {
            id,
            instance_id: record.name.clone(),
            platform: request.platform,
            provider: ProviderKind::Container,
            region: "local".to_string(),
            instance_type: request.instance_type.clone().unwrap_or_else(|| "default".to_string()),
            image_id: self.default_image.clone(),
            state,
            bot_package: request.bot_package.clone(),
            bot_version: request.bot_version.clone(),
            team_id: request.team_id.clone(),
            agent_node_id: None,
            public_ip: None,
            private_ip: record.pod_ip.clone(),
            hourly_rate_cents: 0,
            accrued_cost_cents: 0,
            billing_tier: None,
            dedicated_host_id: None,
            connection_info: None,
            tags: request.tags.clone(),
            metadata: request.metadata.clone(),
            error_message: None,
            requested_at: now,
            provisioned_at: if state == InstanceState::Running { Some(now) } else { None },
            terminated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn find_record(&self, id: Uuid) -> CloudControlResult<PodRecord> {
        self.client
            .find_by_label(&self.namespace, &Self::label_selector(id))
            .await?
            .ok_or(CloudControlError::InstanceNotFound(id))
    }
}

#[async_trait]
impl Provisioner for ContainerProvisioner {
    fn name(&self) -> &'static str {
        "container"
    }

    fn supports(&self, platform: Platform) -> bool {
        platform == Platform::Linux
    }

    async fn create_instance(&self, request: DispatchRequest) -> CloudControlResult<CloudInstance> {
        let id = Uuid::now_v7();
        let pod_name = format!("bot-{id}");

        let mut labels = BTreeMap::new();
        labels.insert("cloud-instance".to_string(), id.to_string());
        labels.insert("team".to_string(), request.team_id.clone());
        labels.insert("bot-package".to_string(), request.bot_package.clone());
        for (k, v) in &request.tags {
            labels.insert(format!("tag-{k}"), v.clone());
        }

        let mut env = BTreeMap::new();
        env.insert("CONTROL_PLANE_URL".to_string(), self.control_plane_url.clone());
        env.insert("CONTROL_PLANE_API_KEY".to_string(), self.api_key.clone());
        env.insert("INSTANCE_ID".to_string(), id.to_string());
        env.insert("BOT_PACKAGE".to_string(), request.bot_package.clone());
        if let Some(version) = &request.bot_version {
            env.insert("BOT_VERSION".to_string(), version.clone());
        }

        let spec = PodSpec {
            name: pod_name,
            namespace: self.namespace.clone(),
            labels,
            image: self.default_image.clone(),
            env,
        };

        let record = self.client.create_pod(spec).await.map_err(|e| CloudControlError::ProvisioningFailed {
            instance_id: Some(id),
            platform: request.platform,
            provider: ProviderKind::Container,
            underlying: e.to_string(),
        })?;

        let _ = &self.service_account; // stamped via the pod spec's service account in a live cluster
        Ok(self.to_cloud_instance(id, &record, &request))
    }

    async fn get_instance(&self, id: Uuid) -> CloudControlResult<Option<CloudInstance>> {
        match self.client.find_by_label(&self.namespace, &Self::label_selector(id)).await? {
            Some(record) => {
                let request = DispatchRequest {
                    platform: Platform::Linux,
                    bot_package: record.labels.get("bot-package").cloned().unwrap_or_default(),
                    bot_version: None,
                    instance_type: None,
                    team_id: record.labels.get("team").cloned().unwrap_or_default(),
                    tags: BTreeMap::new(),
                    metadata: serde_json::Value::Null,
                    dedicated_host_id: None,
                    dedicated_host_provider_id: None,
                };
                Ok(Some(self.to_cloud_instance(id, &record, &request)))
            }
            None => Ok(None),
        }
    }

    async fn list_instances(&self, _filter: &CloudInstanceFilter) -> CloudControlResult<Vec<CloudInstance>> {
        let pods = self.client.list_pods(&self.namespace).await?;
        let mut out = Vec::with_capacity(pods.len());
        for pod in pods {
            if let Some(id_str) = pod.labels.get("cloud-instance") {
                if let Ok(id) = id_str.parse::<Uuid>() {
                    if let Some(instance) = self.get_instance(id).await? {
                        out.push(instance);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn start_instance(&self, _id: Uuid) -> CloudControlResult<CloudInstance> {
        Err(CloudControlError::InvalidState(
            "start is unsupported for the container-orchestrator backend".to_string(),
        ))
    }

    async fn stop_instance(&self, id: Uuid) -> CloudControlResult<CloudInstance> {
        // Equivalent to terminate on this backend (§4.4 "StopInstance on
        // such a backend is equivalent to terminate").
        self.terminate_instance(id).await
    }

    async fn terminate_instance(&self, id: Uuid) -> CloudControlResult<CloudInstance> {
        let record = self.find_record(id).await?;
        self.client.delete_pod(&self.namespace, &record.name).await?;
        let mut instance = self.get_instance(id).await?.ok_or(CloudControlError::InstanceNotFound(id))?;
        instance.state = InstanceState::Terminated;
        instance.terminated_at = Some(Utc::now());
        Ok(instance)
    }

    async fn get_connection_info(&self, id: Uuid) -> CloudControlResult<ConnectionInfo> {
        let record = self.find_record(id).await?;
        Ok(ConnectionInfo {
            protocol: ConnectionProtocol::Exec,
            host: record.pod_ip.unwrap_or_else(|| record.name.clone()),
            port: 0,
            username: None,
            password: None,
            key_data: None,
            extra: BTreeMap::new(),
        })
    }

    async fn execute_command(&self, id: Uuid, command: &str) -> CloudControlResult<CommandResult> {
        let record = self.find_record(id).await?;
        // Only Linux is served by this backend (`supports`), so the shell
        // is always `sh -c`; kept explicit rather than assumed.
        let invocation = CommandShell::Sh.wrap(command);
        self.client.exec(&self.namespace, &record.name, &invocation).await
    }

    async fn get_logs(&self, id: Uuid, lines: usize) -> CloudControlResult<String> {
        let record = self.find_record(id).await?;
        self.client.logs(&self.namespace, &record.name, lines).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn provisioner() -> ContainerProvisioner {
        let backend = Arc::new(SimulatedContainerBackend::default());
        ContainerProvisioner::new(
            backend,
            "bots",
            "registry.internal/bot-runtime:latest",
            "bot-runner",
            "https://control.example.com",
            "api-key-1",
        )
    }

    fn request(team_id: &str) -> DispatchRequest {
        DispatchRequest {
            platform: Platform::Linux,
            bot_package: "example-bot".to_string(),
            bot_version: Some("1.0.0".to_string()),
            instance_type: None,
            team_id: team_id.to_string(),
            tags: BTreeMap::new(),
            metadata: serde_json::Value::Null,
            dedicated_host_id: None,
            dedicated_host_provider_id: None,
        }
    }

    #[tokio::test]
    async fn create_instance_starts_provisioning_and_boots_to_running() {
        let provisioner = provisioner();
        let instance = provisioner.create_instance(request("team-1")).await.unwrap();
        assert_eq!(instance.state, InstanceState::Running);

        let fetched = provisioner.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(fetched.state, InstanceState::Running);
    }

    #[tokio::test]
    async fn start_instance_is_unsupported() {
        let provisioner = provisioner();
        let instance = provisioner.create_instance(request("team-1")).await.unwrap();
        let err = provisioner.start_instance(instance.id).await.unwrap_err();
        assert!(matches!(err, CloudControlError::InvalidState(_)));
    }

    #[tokio::test]
    async fn stop_is_equivalent_to_terminate() {
        let provisioner = provisioner();
        let instance = provisioner.create_instance(request("team-1")).await.unwrap();
        let stopped = provisioner.stop_instance(instance.id).await.unwrap();
        assert_eq!(stopped.state, InstanceState::Terminated);
    }

    #[tokio::test]
    async fn terminate_then_get_instance_returns_terminated() {
        let provisioner = provisioner();
        let instance = provisioner.create_instance(request("team-1")).await.unwrap();
        provisioner.terminate_instance(instance.id).await.unwrap();

        let fetched = provisioner.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(fetched.state, InstanceState::Terminated);
    }

    #[tokio::test]
    async fn get_instance_on_unknown_id_returns_none() {
        let provisioner = provisioner();
        let fetched = provisioner.get_instance(Uuid::now_v7()).await.unwrap();
        assert!(fetched.is_none());
    }
}
