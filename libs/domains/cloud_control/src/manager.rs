//! `CloudManager` (§4.6): the engine that ties `Store`, `BillingClient`,
//! the registered `Provisioner`s, `HostAllocator`, and `EventBus` together
//! behind the capability operations §4.6 defines.
//!
//! Follows this workspace's validate-then-delegate service shape,
//! generalized from "one repository" to "one provisioner per platform" plus
//! the cross-cutting billing/event concerns §4.6 adds.

use crate::{
    billing::BillingClient,
    error::{CloudControlError, CloudControlResult},
    event_bus::EventBus,
    host_allocator::HostAllocator,
    models::{
        CloudEvent, CloudEventType, CloudInstance, CloudInstanceFilter, CloudSummary, CommandResult,
        ConnectionInfo, DispatchRequest, InstanceState, Platform, ProvisionRequest,
    },
    provisioner::Provisioner,
    store::Store,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Per-team/platform instance cap (§3 invariant 6, §6 default 10).
const DEFAULT_MAX_INSTANCES_PER_TEAM: u32 = 10;

/// The cloud subsystem's core engine (§4.6). Cheap to clone: provisioners
/// are held behind an `Arc<RwLock<_>>` so a platform can be registered or
/// disabled at runtime without restarting the process.
#[derive(Clone)]
pub struct CloudManager {
    store: Arc<dyn Store>,
    billing: Arc<dyn BillingClient>,
    events: EventBus,
    host_allocator: Arc<HostAllocator>,
    provisioners: Arc<RwLock<BTreeMap<Platform, Arc<dyn Provisioner>>>>,
    enabled: bool,
    max_instances_per_team: u32,
}

impl CloudManager {
    pub fn new(
        store: Arc<dyn Store>,
        billing: Arc<dyn BillingClient>,
        events: EventBus,
        host_allocator: Arc<HostAllocator>,
        enabled: bool,
        max_instances_per_team: u32,
    ) -> Self {
        Self {
            store,
            billing,
            events,
            host_allocator,
            provisioners: Arc::new(RwLock::new(BTreeMap::new())),
            enabled,
            max_instances_per_team,
        }
    }

    pub fn with_default_cap(
        store: Arc<dyn Store>,
        billing: Arc<dyn BillingClient>,
        events: EventBus,
        host_allocator: Arc<HostAllocator>,
        enabled: bool,
    ) -> Self {
        Self::new(store, billing, events, host_allocator, enabled, DEFAULT_MAX_INSTANCES_PER_TEAM)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Registers (or replaces) the provisioner serving `platform`.
    pub async fn register_provisioner(&self, platform: Platform, provisioner: Arc<dyn Provisioner>) {
        self.provisioners.write().await.insert(platform, provisioner);
    }

    pub(crate) async fn provisioner_for(&self, platform: Platform) -> CloudControlResult<Arc<dyn Provisioner>> {
        self.provisioners
            .read()
            .await
            .get(&platform)
            .cloned()
            .ok_or(CloudControlError::InvalidPlatform(platform))
    }

    async fn emit(&self, event_type: CloudEventType, instance_id: Option<Uuid>, data: serde_json::Value) {
        self.events.publish(CloudEvent::new(event_type, instance_id, data)).await;
    }

    /// §4.6 Create: disabled check, team quota check, billing authorize,
    /// platform lookup, emit `instance.requested`, dispatch, stamp rate,
    /// persist, emit `instance.provisioning` — in that exact order.
    pub async fn create(&self, request: ProvisionRequest) -> CloudControlResult<CloudInstance> {
        if !self.enabled {
            return Err(CloudControlError::CloudDisabled);
        }

        let current = self.store.count_cloud_instances_by_team(&request.team_id).await?;
        if current as u32 >= self.max_instances_per_team {
            return Err(CloudControlError::MaxInstancesReached {
                team_id: request.team_id.clone(),
                cap: self.max_instances_per_team,
            });
        }

        let instance_type = request.instance_type.clone().unwrap_or_else(|| "default".to_string());
        let decision = self.billing.authorize(&request.team_id, request.platform, &instance_type).await?;
        if !decision.authorized {
            return Err(CloudControlError::BillingNotAuthorized(
                decision.reason.unwrap_or_else(|| "not authorized".to_string()),
            ));
        }

        let provisioner = self.provisioner_for(request.platform).await?;

        self.emit(
            CloudEventType::InstanceRequested,
            None,
            serde_json::json!({ "team_id": request.team_id, "platform": request.platform }),
        )
        .await;

        let dispatch = DispatchRequest {
            platform: request.platform,
            bot_package: request.bot_package,
            bot_version: request.bot_version,
            instance_type: request.instance_type,
            team_id: request.team_id,
            tags: request.tags,
            metadata: request.metadata,
            dedicated_host_id: None,
            dedicated_host_provider_id: None,
        };

        let mut instance = provisioner.create_instance(dispatch).await?;
        instance.hourly_rate_cents = decision.hourly_cents;
        instance.billing_tier = decision.tier;

        let persisted = self.store.create_cloud_instance(instance).await?;

        self.emit(CloudEventType::InstanceProvisioning, Some(persisted.id), serde_json::json!({})).await;

        Ok(persisted)
    }

    /// §4.6 Get: try the store first; on miss, scan registered provisioners,
    /// since backends retain their own authoritative state.
    pub async fn get(&self, id: Uuid) -> CloudControlResult<CloudInstance> {
        if let Some(instance) = self.store.get_cloud_instance(id).await? {
            return Ok(instance);
        }

        let provisioners: Vec<_> = self.provisioners.read().await.values().cloned().collect();
        for provisioner in provisioners {
            if let Ok(Some(instance)) = provisioner.get_instance(id).await {
                return Ok(instance);
            }
        }

        Err(CloudControlError::InstanceNotFound(id))
    }

    /// §4.6 List: the store is always configured in this deployment, so it
    /// is always preferred; the provisioner-aggregation fallback the
    /// contract describes for a storeless deployment has no reachable path
    /// here and is intentionally not implemented.
    pub async fn list(&self, filter: &CloudInstanceFilter) -> CloudControlResult<Vec<CloudInstance>> {
        self.store.list_cloud_instances(filter).await
    }

    /// §4.6 Summary: an in-process aggregate over the current instance and
    /// host population, not a persisted rollup.
    pub async fn summary(&self) -> CloudControlResult<CloudSummary> {
        let filter = CloudInstanceFilter {
            limit: usize::MAX,
            ..Default::default()
        };
        let instances = self.store.list_cloud_instances(&filter).await?;
        let hosts = self.store.list_dedicated_hosts().await?;

        let mut summary = CloudSummary::default();
        for instance in &instances {
            *summary.by_platform.entry(instance.platform).or_insert(0) += 1;
            *summary.by_state.entry(instance.state).or_insert(0) += 1;
            summary.total_accrued_cost_cents += instance.accrued_cost_cents;
            // §6: the current-hour estimate covers active (`running`) plus
            // `provisioning` instances, with a platform-default fallback
            // for any instance that hasn't been billing-stamped yet.
            if matches!(instance.state, InstanceState::Running | InstanceState::Provisioning) {
                let rate = if instance.hourly_rate_cents == 0 {
                    crate::billing::default_hourly_cents(instance.platform)
                } else {
                    instance.hourly_rate_cents
                };
                summary.estimated_current_hour_cost_cents += rate;
            }
        }
        summary.active_host_count =
            hosts.iter().filter(|h| h.state == crate::models::HostState::Allocated).count();

        Ok(summary)
    }

    pub async fn start(&self, id: Uuid) -> CloudControlResult<CloudInstance> {
        let current = self.get(id).await?;
        if !current.state.can_transition_to(InstanceState::Running) {
            return Err(CloudControlError::InvalidState(format!(
                "cannot start an instance in state {}",
                current.state
            )));
        }

        let provisioner = self.provisioner_for(current.platform).await?;
        let updated = provisioner.start_instance(id).await?;
        let persisted = self.store.update_cloud_instance(updated).await?;
        self.emit(CloudEventType::InstanceRunning, Some(id), serde_json::json!({})).await;
        Ok(persisted)
    }

    pub async fn stop(&self, id: Uuid) -> CloudControlResult<CloudInstance> {
        let current = self.get(id).await?;
        if !current.state.can_transition_to(InstanceState::Stopped) {
            return Err(CloudControlError::InvalidState(format!(
                "cannot stop an instance in state {}",
                current.state
            )));
        }

        let provisioner = self.provisioner_for(current.platform).await?;
        let updated = provisioner.stop_instance(id).await?;
        let persisted = self.store.update_cloud_instance(updated).await?;
        self.emit(CloudEventType::InstanceStopped, Some(id), serde_json::json!({})).await;
        Ok(persisted)
    }

    /// Irreversible (§3 invariant 2's terminal states). Reports final usage
    /// to billing on a best-effort basis before returning.
    pub async fn terminate(&self, id: Uuid) -> CloudControlResult<CloudInstance> {
        let current = self.get(id).await?;
        if current.state.is_terminal() {
            return Ok(current);
        }

        let provisioner = self.provisioner_for(current.platform).await?;
        let updated = provisioner.terminate_instance(id).await?;
        let persisted = self.store.update_cloud_instance(updated).await?;

        let hours = (persisted.updated_at - persisted.requested_at).num_seconds() as f64 / 3600.0;
        let _ = self
            .billing
            .report_usage(&persisted.instance_id, persisted.platform, hours.max(0.0), persisted.hourly_rate_cents)
            .await;

        self.emit(CloudEventType::InstanceTerminated, Some(id), serde_json::json!({})).await;
        Ok(persisted)
    }

    pub async fn get_connection_info(&self, id: Uuid) -> CloudControlResult<ConnectionInfo> {
        let current = self.get(id).await?;
        let provisioner = self.provisioner_for(current.platform).await?;
        let info = provisioner.get_connection_info(id).await?;
        self.emit(CloudEventType::InstanceConnected, Some(id), serde_json::json!({})).await;
        Ok(info)
    }

    pub async fn execute_command(&self, id: Uuid, command: &str) -> CloudControlResult<CommandResult> {
        let current = self.get(id).await?;
        let provisioner = self.provisioner_for(current.platform).await?;
        provisioner.execute_command(id, command).await
    }

    pub async fn get_logs(&self, id: Uuid, lines: usize) -> CloudControlResult<String> {
        let current = self.get(id).await?;
        let provisioner = self.provisioner_for(current.platform).await?;
        provisioner.get_logs(id, lines).await
    }

    pub async fn get_quota(&self, team_id: &str) -> CloudControlResult<crate::models::CloudQuota> {
        let mut quota = self.billing.get_team_quota(team_id).await?;
        quota.current_non_terminal_instances = self.store.count_cloud_instances_by_team(team_id).await?;
        Ok(quota)
    }

    pub fn host_allocator(&self) -> &HostAllocator {
        &self.host_allocator
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn billing(&self) -> &Arc<dyn BillingClient> {
        &self.billing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        provisioner::container::{ContainerProvisioner, SimulatedContainerBackend},
        testing::{FakeBillingClient, FakeStore},
    };

    async fn manager() -> CloudManager {
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let billing: Arc<dyn BillingClient> = Arc::new(FakeBillingClient::new(true, 5));
        let events = EventBus::new();
        let host_allocator = Arc::new(HostAllocator::new(store.clone()));
        let manager = CloudManager::with_default_cap(store, billing, events, host_allocator, true);

        let backend = Arc::new(SimulatedContainerBackend::default());
        let provisioner: Arc<dyn Provisioner> = Arc::new(ContainerProvisioner::new(
            backend,
            "bots",
            "registry.internal/bot-runtime:latest",
            "bot-runner",
            "https://control.example.com",
            "api-key-1",
        ));
        manager.register_provisioner(Platform::Linux, provisioner).await;
        manager
    }

    fn request() -> ProvisionRequest {
        ProvisionRequest {
            platform: Platform::Linux,
            bot_package: "example-bot".to_string(),
            bot_version: None,
            instance_type: None,
            team_id: "team-1".to_string(),
            tags: BTreeMap::new(),
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn create_persists_a_running_instance_with_billing_rate() {
        let manager = manager().await;
        let instance = manager.create(request()).await.unwrap();
        assert_eq!(instance.hourly_rate_cents, 5);
        assert_eq!(instance.team_id, "team-1");

        let fetched = manager.get(instance.id).await.unwrap();
        assert_eq!(fetched.id, instance.id);
    }

    #[tokio::test]
    async fn create_fails_when_disabled() {
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let billing: Arc<dyn BillingClient> = Arc::new(FakeBillingClient::new(true, 5));
        let host_allocator = Arc::new(HostAllocator::new(store.clone()));
        let manager = CloudManager::with_default_cap(store, billing, EventBus::new(), host_allocator, false);

        let err = manager.create(request()).await.unwrap_err();
        assert!(matches!(err, CloudControlError::CloudDisabled));
    }

    #[tokio::test]
    async fn create_fails_when_billing_denies() {
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let billing: Arc<dyn BillingClient> = Arc::new(FakeBillingClient::new(false, 5));
        let events = EventBus::new();
        let host_allocator = Arc::new(HostAllocator::new(store.clone()));
        let manager = CloudManager::with_default_cap(store, billing, events, host_allocator, true);
        let backend = Arc::new(SimulatedContainerBackend::default());
        let provisioner: Arc<dyn Provisioner> = Arc::new(ContainerProvisioner::new(
            backend,
            "bots",
            "registry.internal/bot-runtime:latest",
            "bot-runner",
            "https://control.example.com",
            "api-key-1",
        ));
        manager.register_provisioner(Platform::Linux, provisioner).await;

        let err = manager.create(request()).await.unwrap_err();
        assert!(matches!(err, CloudControlError::BillingNotAuthorized(_)));
    }

    #[tokio::test]
    async fn create_fails_when_team_cap_reached() {
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let billing: Arc<dyn BillingClient> = Arc::new(FakeBillingClient::new(true, 5));
        let events = EventBus::new();
        let host_allocator = Arc::new(HostAllocator::new(store.clone()));
        let manager = CloudManager::new(store, billing, events, host_allocator, true, 1);
        let backend = Arc::new(SimulatedContainerBackend::default());
        let provisioner: Arc<dyn Provisioner> = Arc::new(ContainerProvisioner::new(
            backend,
            "bots",
            "registry.internal/bot-runtime:latest",
            "bot-runner",
            "https://control.example.com",
            "api-key-1",
        ));
        manager.register_provisioner(Platform::Linux, provisioner).await;

        manager.create(request()).await.unwrap();
        let err = manager.create(request()).await.unwrap_err();
        assert!(matches!(err, CloudControlError::MaxInstancesReached { .. }));
    }

    #[tokio::test]
    async fn terminate_is_idempotent_on_already_terminal_instances() {
        let manager = manager().await;
        let instance = manager.create(request()).await.unwrap();
        let first = manager.terminate(instance.id).await.unwrap();
        let second = manager.terminate(instance.id).await.unwrap();
        assert_eq!(first.state, InstanceState::Terminated);
        assert_eq!(second.state, InstanceState::Terminated);
    }

    #[tokio::test]
    async fn summary_aggregates_by_platform_and_state() {
        let manager = manager().await;
        manager.create(request()).await.unwrap();
        manager.create(request()).await.unwrap();

        let summary = manager.summary().await.unwrap();
        assert_eq!(summary.by_platform.get(&Platform::Linux), Some(&2));
        assert_eq!(summary.by_state.get(&InstanceState::Running), Some(&2));
    }
}
