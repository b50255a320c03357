//! IaaS VM backend (§4.4.b).
//!
//! Creates VMs from an image id, optionally pinned to a `DedicatedHost` for
//! macOS (§3 invariant 4), injects a base64-encoded bootstrap script, and
//! tags instances with the same `cloud-instance`/`team`/`bot-package`
//! scheme as the container backend. Windows connection info carries an
//! encrypted password in `extra`.

use crate::{
    error::{CloudControlError, CloudControlResult},
    host_allocator::HostAllocator,
    models::{
        CloudInstance, CloudInstanceFilter, CommandResult, ConnectionInfo, ConnectionProtocol,
        DispatchRequest, InstanceState, Platform, ProviderKind,
    },
    provisioner::{CommandShell, Provisioner},
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;
use uuid::Uuid;

/// Observed lifecycle state of a VM, mirroring the IaaS provider's own
/// vocabulary before §4.4.b's state mapping is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Other,
}

impl VmState {
    fn to_instance_state(self) -> InstanceState {
        match self {
            VmState::Pending => InstanceState::Provisioning,
            VmState::Running => InstanceState::Running,
            VmState::Stopping | VmState::Stopped => InstanceState::Stopped,
            VmState::ShuttingDown | VmState::Terminated => InstanceState::Terminated,
            VmState::Other => InstanceState::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VmSpec {
    pub image_id: String,
    pub instance_type: String,
    pub tags: BTreeMap<String, String>,
    pub user_data_b64: String,
    pub host_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VmRecord {
    pub provider_id: String,
    pub image_id: String,
    pub instance_type: String,
    pub tags: BTreeMap<String, String>,
    pub state: VmState,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub windows_password: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The seam to the real cloud provider API. The default
/// `SimulatedIaasBackend` models boot timing in-process; a real deployment
/// would implement this against a live provider SDK.
#[async_trait]
pub trait IaasBackendClient: Send + Sync {
    async fn create_vm(&self, spec: VmSpec) -> CloudControlResult<VmRecord>;
    async fn get_vm(&self, provider_id: &str) -> CloudControlResult<Option<VmRecord>>;
    async fn list_vms(&self) -> CloudControlResult<Vec<VmRecord>>;
    async fn start_vm(&self, provider_id: &str) -> CloudControlResult<()>;
    async fn stop_vm(&self, provider_id: &str) -> CloudControlResult<()>;
    async fn terminate_vm(&self, provider_id: &str) -> CloudControlResult<()>;

    /// Submits `command` for execution through `shell` and returns an
    /// opaque invocation id; the command runs exactly once regardless of
    /// how many times the caller polls for its result.
    async fn submit_command(&self, provider_id: &str, shell: CommandShell, command: &str) -> CloudControlResult<String>;

    /// Polls a previously submitted invocation. `None` means still running.
    async fn poll_command(&self, provider_id: &str, invocation_id: &str) -> CloudControlResult<Option<CommandResult>>;

    async fn logs(&self, provider_id: &str, lines: usize) -> CloudControlResult<String>;
}

/// A command submitted via `submit_command`, resolved (not re-executed) the
/// first time it is polled.
struct CommandInvocation {
    provider_id: String,
    shell: CommandShell,
    command: String,
}

/// In-process simulated cloud provider: VMs boot (`Pending` -> `Running`)
/// after `boot_delay` has elapsed since creation.
pub struct SimulatedIaasBackend {
    boot_delay: chrono::Duration,
    vms: RwLock<BTreeMap<String, VmRecord>>,
    invocations: RwLock<BTreeMap<String, CommandInvocation>>,
}

impl SimulatedIaasBackend {
    pub fn new(boot_delay: chrono::Duration) -> Self {
        Self {
            boot_delay,
            vms: RwLock::new(BTreeMap::new()),
            invocations: RwLock::new(BTreeMap::new()),
        }
    }

    fn observe(&self, record: &VmRecord) -> VmRecord {
        let mut observed = record.clone();
        if observed.state == VmState::Pending && Utc::now() - observed.created_at >= self.boot_delay {
            observed.state = VmState::Running;
            observed.public_ip = Some("198.51.100.10".to_string());
            observed.private_ip = Some("10.0.1.20".to_string());
        }
        observed
    }
}

impl Default for SimulatedIaasBackend {
    fn default() -> Self {
        Self::new(chrono::Duration::zero())
    }
}

#[async_trait]
impl IaasBackendClient for SimulatedIaasBackend {
    async fn create_vm(&self, spec: VmSpec) -> CloudControlResult<VmRecord> {
        let provider_id = format!("i-{}", Uuid::now_v7().simple());
        let password = spec
            .tags
            .get("platform")
            .filter(|p| p.as_str() == "windows")
            .map(|_| "simulated-rdp-password".to_string());

        let record = VmRecord {
            provider_id: provider_id.clone(),
            image_id: spec.image_id,
            instance_type: spec.instance_type,
            tags: spec.tags,
            state: VmState::Pending,
            public_ip: None,
            private_ip: None,
            windows_password: password,
            created_at: Utc::now(),
        };
        self.vms.write().unwrap().insert(provider_id, record.clone());
        Ok(record)
    }

    async fn get_vm(&self, provider_id: &str) -> CloudControlResult<Option<VmRecord>> {
        let vms = self.vms.read().unwrap();
        Ok(vms.get(provider_id).map(|r| self.observe(r)))
    }

    async fn list_vms(&self) -> CloudControlResult<Vec<VmRecord>> {
        let vms = self.vms.read().unwrap();
        Ok(vms.values().map(|r| self.observe(r)).collect())
    }

    async fn start_vm(&self, provider_id: &str) -> CloudControlResult<()> {
        let mut vms = self.vms.write().unwrap();
        if let Some(vm) = vms.get_mut(provider_id) {
            vm.state = VmState::Pending;
            vm.created_at = Utc::now();
        }
        Ok(())
    }

    async fn stop_vm(&self, provider_id: &str) -> CloudControlResult<()> {
        let mut vms = self.vms.write().unwrap();
        if let Some(vm) = vms.get_mut(provider_id) {
            vm.state = VmState::Stopped;
        }
        Ok(())
    }

    async fn terminate_vm(&self, provider_id: &str) -> CloudControlResult<()> {
        let mut vms = self.vms.write().unwrap();
        if let Some(vm) = vms.get_mut(provider_id) {
            vm.state = VmState::Terminated;
        }
        Ok(())
    }

    async fn submit_command(&self, provider_id: &str, shell: CommandShell, command: &str) -> CloudControlResult<String> {
        {
            let vms = self.vms.read().unwrap();
            vms.get(provider_id).ok_or_else(|| CloudControlError::Internal(format!("vm {provider_id} not found")))?;
        }

        let invocation_id = Uuid::now_v7().to_string();
        self.invocations.write().unwrap().insert(
            invocation_id.clone(),
            CommandInvocation {
                provider_id: provider_id.to_string(),
                shell,
                command: command.to_string(),
            },
        );
        Ok(invocation_id)
    }

    async fn poll_command(&self, provider_id: &str, invocation_id: &str) -> CloudControlResult<Option<CommandResult>> {
        let invocation = {
            let mut invocations = self.invocations.write().unwrap();
            match invocations.get(invocation_id) {
                Some(inv) if inv.provider_id == provider_id => invocations.remove(invocation_id).unwrap(),
                _ => return Err(CloudControlError::Internal(format!("invocation {invocation_id} not found"))),
            }
        };

        let vms = self.vms.read().unwrap();
        let vm = vms
            .get(provider_id)
            .ok_or_else(|| CloudControlError::Internal(format!("vm {provider_id} not found")))?;
        let observed = self.observe(vm);

        if observed.state != VmState::Running {
            return Ok(Some(CommandResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: "instance is not running".to_string(),
            }));
        }

        // The simulated backend resolves every invocation the first time
        // it is polled; a real provider would return `Ok(None)` here while
        // the remote invocation is still executing.
        Ok(Some(CommandResult {
            exit_code: 0,
            stdout: format!("simulated output for: {}", invocation.shell.wrap(&invocation.command)),
            stderr: String::new(),
        }))
    }

    async fn logs(&self, provider_id: &str, lines: usize) -> CloudControlResult<String> {
        let vms = self.vms.read().unwrap();
        vms.get(provider_id).ok_or_else(|| CloudControlError::Internal(format!("vm {provider_id} not found")))?;
        Ok((0..lines.min(10)).map(|i| format!("simulated log line {i}")).collect::<Vec<_>>().join("\n"))
    }
}

/// IaaS VM `Provisioner` (§4.4.b). Platform-keyed behaviour (dedicated host
/// placement, encrypted Windows password) is branched internally rather
/// than split across per-platform structs, matching §4.4.b's single
/// "iaas" backend description.
pub struct IaasProvisioner {
    client: std::sync::Arc<dyn IaasBackendClient>,
    host_allocator: HostAllocator,
    bootstrap_script: String,
    exec_poll_timeout: Duration,
    exec_poll_interval: Duration,
}

impl IaasProvisioner {
    pub fn new(
        client: std::sync::Arc<dyn IaasBackendClient>,
        host_allocator: HostAllocator,
        bootstrap_script: impl Into<String>,
    ) -> Self {
        Self {
            client,
            host_allocator,
            bootstrap_script: bootstrap_script.into(),
            // §4.4.b "exec/log channel polls for roughly two minutes with a
            // fixed back-off before giving up".
            exec_poll_timeout: Duration::from_secs(120),
            exec_poll_interval: Duration::from_secs(5),
        }
    }

    fn to_cloud_instance(&self, id: Uuid, record: &VmRecord, request: &DispatchRequest) -> CloudInstance {
        let now = Utc::now();
        let state = record.state.to_instance_state();

        let connection_info = match (state, request.platform) {
            (InstanceState::Running, Platform::Windows) => {
                let mut extra = BTreeMap::new();
                if let Some(password) = &record.windows_password {
                    extra.insert("encrypted_password".to_string(), STANDARD.encode(password));
                }
                Some(ConnectionInfo {
                    protocol: ConnectionProtocol::Rdp,
                    host: record.public_ip.clone().unwrap_or_default(),
                    port: 3389,
                    username: Some("Administrator".to_string()),
                    password: None,
                    key_data: None,
                    extra,
                })
            }
            (InstanceState::Running, Platform::Macos) => Some(ConnectionInfo {
                protocol: ConnectionProtocol::Vnc,
                host: record.public_ip.clone().unwrap_or_default(),
                port: 5900,
                username: None,
                password: None,
                key_data: None,
                extra: BTreeMap::new(),
            }),
            (InstanceState::Running, Platform::Linux) => Some(ConnectionInfo {
                protocol: ConnectionProtocol::RemoteShell,
                host: record.public_ip.clone().unwrap_or_default(),
                port: 22,
                username: None,
                password: None,
                key_data: None,
                extra: BTreeMap::new(),
            }),
            _ => None,
        };

        CloudInstance {
            id,
            instance_id: record.provider_id.clone(),
            platform: request.platform,
            provider: ProviderKind::Iaas,
            region: "us-east-1".to_string(),
            instance_type: record.instance_type.clone(),
            image_id: record.image_id.clone(),
            state,
            bot_package: request.bot_package.clone(),
            bot_version: request.bot_version.clone(),
            team_id: request.team_id.clone(),
            agent_node_id: None,
            public_ip: record.public_ip.clone(),
            private_ip: record.private_ip.clone(),
            hourly_rate_cents: 0,
            accrued_cost_cents: 0,
            billing_tier: None,
            dedicated_host_id: request.dedicated_host_id,
            connection_info,
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
}

#[async_trait]
impl Provisioner for IaasProvisioner {
    fn name(&self) -> &'static str {
        "iaas"
    }

    fn supports(&self, platform: Platform) -> bool {
        matches!(platform, Platform::Macos | Platform::Windows | Platform::Linux)
    }

    async fn create_instance(&self, mut request: DispatchRequest) -> CloudControlResult<CloudInstance> {
        let id = Uuid::now_v7();

        // macOS instances require a dedicated host (§3 invariant 4,
        // §4.4.b). Acquire before the provider call and release on any
        // subsequent failure so a failed launch never strands a host.
        let acquired_host = if request.platform == Platform::Macos && request.dedicated_host_id.is_none() {
            let host = self.host_allocator.acquire(id).await?;
            request.dedicated_host_id = Some(host.id);
            request.dedicated_host_provider_id = Some(host.host_id.clone());
            Some(host)
        } else {
            None
        };

        let mut tags = request.tags.clone();
        tags.insert("cloud-instance".to_string(), id.to_string());
        tags.insert("team".to_string(), request.team_id.clone());
        tags.insert("bot-package".to_string(), request.bot_package.clone());
        tags.insert("platform".to_string(), request.platform.to_string());

        let spec = VmSpec {
            image_id: request.instance_type.clone().unwrap_or_else(|| "ami-default".to_string()),
            instance_type: request.instance_type.clone().unwrap_or_else(|| "default".to_string()),
            tags,
            user_data_b64: STANDARD.encode(&self.bootstrap_script),
            host_id: request.dedicated_host_provider_id.clone(),
        };

        let result = self.client.create_vm(spec).await;

        match result {
            Ok(record) => Ok(self.to_cloud_instance(id, &record, &request)),
            Err(e) => {
                if let Some(host) = acquired_host {
                    if let Err(release_err) = self.host_allocator.release(host.id).await {
                        tracing::warn!(
                            error = %release_err,
                            host_id = %host.id,
                            "failed to release dedicated host after a failed IaaS launch"
                        );
                    }
                }
                Err(CloudControlError::ProvisioningFailed {
                    instance_id: Some(id),
                    platform: request.platform,
                    provider: ProviderKind::Iaas,
                    underlying: e.to_string(),
                })
            }
        }
    }

    async fn get_instance(&self, id: Uuid) -> CloudControlResult<Option<CloudInstance>> {
        let vms = self.client.list_vms().await?;
        let Some(record) = vms.into_iter().find(|vm| vm.tags.get("cloud-instance").map(String::as_str) == Some(&id.to_string())) else {
            return Ok(None);
        };

        let platform = record
            .tags
            .get("platform")
            .and_then(|p| p.parse::<Platform>().ok())
            .unwrap_or(Platform::Linux);
        let request = DispatchRequest {
            platform,
            bot_package: record.tags.get("bot-package").cloned().unwrap_or_default(),
            bot_version: None,
            instance_type: Some(record.instance_type.clone()),
            team_id: record.tags.get("team").cloned().unwrap_or_default(),
            tags: record.tags.clone(),
            metadata: serde_json::Value::Null,
            dedicated_host_id: None,
            dedicated_host_provider_id: None,
        };
        Ok(Some(self.to_cloud_instance(id, &record, &request)))
    }

    async fn list_instances(&self, _filter: &CloudInstanceFilter) -> CloudControlResult<Vec<CloudInstance>> {
        let vms = self.client.list_vms().await?;
        let mut out = Vec::with_capacity(vms.len());
        for record in vms {
            if let Some(id_str) = record.tags.get("cloud-instance") {
                if let Ok(id) = id_str.parse::<Uuid>() {
                    if let Some(instance) = self.get_instance(id).await? {
                        out.push(instance);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn start_instance(&self, id: Uuid) -> CloudControlResult<CloudInstance> {
        let instance = self.get_instance(id).await?.ok_or(CloudControlError::InstanceNotFound(id))?;
        self.client.start_vm(&instance.instance_id).await?;
        self.get_instance(id).await?.ok_or(CloudControlError::InstanceNotFound(id))
    }

    async fn stop_instance(&self, id: Uuid) -> CloudControlResult<CloudInstance> {
        let instance = self.get_instance(id).await?.ok_or(CloudControlError::InstanceNotFound(id))?;
        self.client.stop_vm(&instance.instance_id).await?;
        self.get_instance(id).await?.ok_or(CloudControlError::InstanceNotFound(id))
    }

    async fn terminate_instance(&self, id: Uuid) -> CloudControlResult<CloudInstance> {
        let instance = self.get_instance(id).await?.ok_or(CloudControlError::InstanceNotFound(id))?;
        self.client.terminate_vm(&instance.instance_id).await?;

        if let Some(host_id) = instance.dedicated_host_id {
            if let Err(e) = self.host_allocator.release(host_id).await {
                tracing::warn!(error = %e, %host_id, "failed to release dedicated host on terminate");
            }
        }

        let mut terminated = self.get_instance(id).await?.ok_or(CloudControlError::InstanceNotFound(id))?;
        terminated.state = InstanceState::Terminated;
        terminated.terminated_at = Some(Utc::now());
        Ok(terminated)
    }

    async fn get_connection_info(&self, id: Uuid) -> CloudControlResult<ConnectionInfo> {
        let instance = self.get_instance(id).await?.ok_or(CloudControlError::InstanceNotFound(id))?;
        instance
            .connection_info
            .ok_or_else(|| CloudControlError::InvalidState("instance is not yet connectable".to_string()))
    }

    async fn execute_command(&self, id: Uuid, command: &str) -> CloudControlResult<CommandResult> {
        let instance = self.get_instance(id).await?.ok_or(CloudControlError::InstanceNotFound(id))?;
        let shell = CommandShell::for_platform(instance.platform);
        let invocation_id = self.client.submit_command(&instance.instance_id, shell, command).await?;

        // Submitted once above; every iteration below only polls the
        // invocation's result, it never re-runs the command.
        let deadline = tokio::time::Instant::now() + self.exec_poll_timeout;
        loop {
            if let Some(result) = self.client.poll_command(&instance.instance_id, &invocation_id).await? {
                return Ok(result);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CloudControlError::Internal(format!(
                    "command invocation {invocation_id} on {} timed out after {:?}",
                    instance.instance_id, self.exec_poll_timeout
                )));
            }
            tokio::time::sleep(self.exec_poll_interval).await;
        }
    }

    async fn get_logs(&self, id: Uuid, lines: usize) -> CloudControlResult<String> {
        let instance = self.get_instance(id).await?.ok_or(CloudControlError::InstanceNotFound(id))?;
        self.client.logs(&instance.instance_id, lines).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::Store, testing::FakeStore};
    use std::sync::Arc;

    fn provisioner() -> IaasProvisioner {
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let allocator = HostAllocator::new(store);
        let backend = Arc::new(SimulatedIaasBackend::default());
        IaasProvisioner::new(backend, allocator, "#!/bin/sh\necho bootstrap")
    }

    fn request(platform: Platform) -> DispatchRequest {
        DispatchRequest {
            platform,
            bot_package: "example-bot".to_string(),
            bot_version: None,
            instance_type: Some("t3.small".to_string()),
            team_id: "team-1".to_string(),
            tags: BTreeMap::new(),
            metadata: serde_json::Value::Null,
            dedicated_host_id: None,
            dedicated_host_provider_id: None,
        }
    }

    #[tokio::test]
    async fn create_instance_on_linux_requires_no_host() {
        let provisioner = provisioner();
        let instance = provisioner.create_instance(request(Platform::Linux)).await.unwrap();
        assert_eq!(instance.state, InstanceState::Running);
        assert!(instance.dedicated_host_id.is_none());
    }

    #[tokio::test]
    async fn create_instance_on_macos_without_available_host_fails() {
        let provisioner = provisioner();
        let err = provisioner.create_instance(request(Platform::Macos)).await.unwrap_err();
        assert!(matches!(err, CloudControlError::NoAvailableHost));
    }

    #[tokio::test]
    async fn create_instance_on_macos_acquires_a_seeded_host() {
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let allocator = HostAllocator::new(store);
        allocator.seed(&["H1".to_string()], "mac2.metal", 0).await.unwrap();
        let backend = Arc::new(SimulatedIaasBackend::default());
        let provisioner = IaasProvisioner::new(backend, allocator, "#!/bin/sh\necho bootstrap");

        let instance = provisioner.create_instance(request(Platform::Macos)).await.unwrap();
        assert!(instance.dedicated_host_id.is_some());
    }

    #[tokio::test]
    async fn windows_connection_info_carries_encrypted_password() {
        let provisioner = provisioner();
        let instance = provisioner.create_instance(request(Platform::Windows)).await.unwrap();
        let info = provisioner.get_connection_info(instance.id).await.unwrap();
        assert_eq!(info.protocol, ConnectionProtocol::Rdp);
        assert!(info.extra.contains_key("encrypted_password"));
    }

    #[tokio::test]
    async fn terminate_releases_the_dedicated_host() {
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let allocator = HostAllocator::new(store.clone());
        allocator.seed(&["H1".to_string()], "mac2.metal", 0).await.unwrap();
        let backend = Arc::new(SimulatedIaasBackend::default());
        let provisioner = IaasProvisioner::new(backend, allocator, "#!/bin/sh\necho bootstrap");

        let instance = provisioner.create_instance(request(Platform::Macos)).await.unwrap();
        provisioner.terminate_instance(instance.id).await.unwrap();

        let hosts = store.list_dedicated_hosts().await.unwrap();
        assert_eq!(hosts[0].state, crate::models::HostState::Available);
    }

    #[tokio::test]
    async fn execute_command_on_windows_invokes_powershell() {
        let provisioner = provisioner();
        let instance = provisioner.create_instance(request(Platform::Windows)).await.unwrap();
        let result = provisioner.execute_command(instance.id, "Get-Process").await.unwrap();
        assert!(result.stdout.contains("powershell -Command"));
    }

    #[tokio::test]
    async fn execute_command_on_linux_invokes_sh() {
        let provisioner = provisioner();
        let instance = provisioner.create_instance(request(Platform::Linux)).await.unwrap();
        let result = provisioner.execute_command(instance.id, "uptime").await.unwrap();
        assert!(result.stdout.contains("sh -c"));
    }

    #[tokio::test]
    async fn execute_command_submits_the_command_exactly_once() {
        let backend = Arc::new(SimulatedIaasBackend::default());
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let allocator = HostAllocator::new(store);
        let provisioner = IaasProvisioner::new(backend.clone(), allocator, "#!/bin/sh\necho bootstrap");

        let instance = provisioner.create_instance(request(Platform::Linux)).await.unwrap();
        provisioner.execute_command(instance.id, "uptime").await.unwrap();

        // The simulated backend resolves an invocation on its first poll
        // and removes it; a second poll of the same id must fail rather
        // than silently re-running the command.
        let invocation_id = backend.submit_command(&instance.instance_id, CommandShell::Sh, "uptime").await.unwrap();
        backend.poll_command(&instance.instance_id, &invocation_id).await.unwrap().unwrap();
        assert!(backend.poll_command(&instance.instance_id, &invocation_id).await.is_err());
    }
}
