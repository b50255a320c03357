//! In-memory fakes for exercising `CloudManager`/`Monitor`/`HostAllocator`
//! without a live Postgres instance.
//!
//! The other domain crates (`tasks`, `items`, `events`, ...) unit-test their
//! repository layer with `#[cfg_attr(test, mockall::automock)]` on a narrow
//! single-method-call trait. `Store`/`BillingClient` are exercised here
//! across multi-step scenarios (provision, allocate a host, sweep, release)
//! that need state to persist and be queried back between calls, which is
//! what a stateful fake buys over a call-expectation mock — so this crate
//! keeps hand-rolled fakes rather than `mockall::automock`, now compiled
//! only under `#[cfg(test)]` so they never reach a release binary.

use crate::{
    billing::BillingClient,
    error::{CloudControlError, CloudControlResult},
    models::{AuthorizationDecision, CloudInstance, CloudInstanceFilter, CloudQuota, DedicatedHost, Platform},
    store::Store,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;
use uuid::Uuid;

/// In-memory `Store`, guarded by a single lock for simplicity — tests never
/// need the fine-grained concurrency a real `PgStore` would.
#[derive(Default)]
pub struct FakeStore {
    instances: RwLock<BTreeMap<Uuid, CloudInstance>>,
    hosts: RwLock<BTreeMap<Uuid, DedicatedHost>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn create_cloud_instance(&self, instance: CloudInstance) -> CloudControlResult<CloudInstance> {
        let mut instances = self.instances.write().unwrap();
        if instances.contains_key(&instance.id) {
            return Err(CloudControlError::InstanceAlreadyExists(instance.id.to_string()));
        }
        instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn get_cloud_instance(&self, id: Uuid) -> CloudControlResult<Option<CloudInstance>> {
        Ok(self.instances.read().unwrap().get(&id).cloned())
    }

    async fn get_cloud_instance_by_agent_node_id(
        &self,
        agent_node_id: &str,
    ) -> CloudControlResult<Option<CloudInstance>> {
        Ok(self
            .instances
            .read()
            .unwrap()
            .values()
            .find(|i| i.agent_node_id.as_deref() == Some(agent_node_id))
            .cloned())
    }

    async fn update_cloud_instance(&self, instance: CloudInstance) -> CloudControlResult<CloudInstance> {
        let mut instances = self.instances.write().unwrap();
        if !instances.contains_key(&instance.id) {
            return Err(CloudControlError::InstanceNotFound(instance.id));
        }
        instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn delete_cloud_instance(&self, id: Uuid) -> CloudControlResult<()> {
        self.instances.write().unwrap().remove(&id);
        Ok(())
    }

    async fn list_cloud_instances(&self, filter: &CloudInstanceFilter) -> CloudControlResult<Vec<CloudInstance>> {
        let instances = self.instances.read().unwrap();
        let mut matching: Vec<CloudInstance> = instances
            .values()
            .filter(|i| filter.platform.is_none_or(|p| p == i.platform))
            .filter(|i| filter.state.is_none_or(|s| s == i.state))
            .filter(|i| filter.team_id.as_deref().is_none_or(|t| t == i.team_id))
            .filter(|i| filter.provider.is_none_or(|p| p == i.provider))
            .cloned()
            .collect();
        matching.sort_by_key(|i| i.created_at);
        Ok(matching.into_iter().skip(filter.offset).take(filter.limit).collect())
    }

    async fn count_cloud_instances_by_team(&self, team_id: &str) -> CloudControlResult<usize> {
        Ok(self
            .instances
            .read()
            .unwrap()
            .values()
            .filter(|i| i.team_id == team_id && !i.state.is_terminal())
            .count())
    }

    async fn create_dedicated_host(&self, host: DedicatedHost) -> CloudControlResult<DedicatedHost> {
        self.hosts.write().unwrap().insert(host.id, host.clone());
        Ok(host)
    }

    async fn get_dedicated_host(&self, id: Uuid) -> CloudControlResult<Option<DedicatedHost>> {
        Ok(self.hosts.read().unwrap().get(&id).cloned())
    }

    async fn get_dedicated_host_by_host_id(&self, host_id: &str) -> CloudControlResult<Option<DedicatedHost>> {
        Ok(self.hosts.read().unwrap().values().find(|h| h.host_id == host_id).cloned())
    }

    async fn update_dedicated_host(&self, host: DedicatedHost) -> CloudControlResult<DedicatedHost> {
        let mut hosts = self.hosts.write().unwrap();
        if !hosts.contains_key(&host.id) {
            return Err(CloudControlError::NoAvailableHost);
        }
        hosts.insert(host.id, host.clone());
        Ok(host)
    }

    async fn list_dedicated_hosts(&self) -> CloudControlResult<Vec<DedicatedHost>> {
        Ok(self.hosts.read().unwrap().values().cloned().collect())
    }

    async fn get_available_dedicated_host(&self) -> CloudControlResult<Option<DedicatedHost>> {
        let hosts = self.hosts.read().unwrap();
        Ok(hosts
            .values()
            .filter(|h| h.state == crate::models::HostState::Available)
            .min_by_key(|h| h.updated_at)
            .cloned())
    }
}

/// Always authorizes, with configurable rates, and records every call for
/// assertions.
#[derive(Default)]
pub struct FakeBillingClient {
    pub authorized: bool,
    pub hourly_cents: i64,
    pub usage_reports: RwLock<Vec<(String, f64, i64)>>,
}

impl FakeBillingClient {
    pub fn new(authorized: bool, hourly_cents: i64) -> Self {
        Self {
            authorized,
            hourly_cents,
            usage_reports: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BillingClient for FakeBillingClient {
    async fn authorize(
        &self,
        _team_id: &str,
        _platform: Platform,
        _instance_type: &str,
    ) -> CloudControlResult<AuthorizationDecision> {
        Ok(AuthorizationDecision {
            authorized: self.authorized,
            tier: Some("test".to_string()),
            hourly_cents: self.hourly_cents,
            reason: if self.authorized { None } else { Some("quota exceeded".to_string()) },
        })
    }

    async fn report_usage(
        &self,
        instance_id: &str,
        _platform: Platform,
        hours: f64,
        hourly_cents: i64,
    ) -> CloudControlResult<()> {
        self.usage_reports.write().unwrap().push((instance_id.to_string(), hours, hourly_cents));
        Ok(())
    }

    async fn get_team_quota(&self, team_id: &str) -> CloudControlResult<CloudQuota> {
        Ok(CloudQuota {
            team_id: team_id.to_string(),
            platform_caps: BTreeMap::new(),
            compute_hour_cap: None,
            monthly_budget_cents_cap: None,
            current_non_terminal_instances: 0,
            current_month_cost_cents: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CloudInstance, InstanceState, ProviderKind};
    use chrono::Utc;

    fn instance(team_id: &str) -> CloudInstance {
        let now = Utc::now();
        CloudInstance {
            id: Uuid::now_v7(),
            instance_id: "i-1".to_string(),
            platform: Platform::Linux,
            provider: ProviderKind::Container,
            region: "local".to_string(),
            instance_type: "default".to_string(),
            image_id: "image".to_string(),
            state: InstanceState::Running,
            bot_package: "bot".to_string(),
            bot_version: None,
            team_id: team_id.to_string(),
            agent_node_id: None,
            public_ip: None,
            private_ip: None,
            hourly_rate_cents: 1,
            accrued_cost_cents: 0,
            billing_tier: None,
            dedicated_host_id: None,
            connection_info: None,
            tags: BTreeMap::new(),
            metadata: serde_json::Value::Null,
            error_message: None,
            requested_at: now,
            provisioned_at: None,
            terminated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn count_excludes_terminal_instances() {
        let store = FakeStore::new();
        let mut running = instance("team-1");
        store.create_cloud_instance(running.clone()).await.unwrap();

        let mut terminated = instance("team-1");
        terminated.state = InstanceState::Terminated;
        store.create_cloud_instance(terminated).await.unwrap();

        assert_eq!(store.count_cloud_instances_by_team("team-1").await.unwrap(), 1);

        running.state = InstanceState::Terminated;
        store.update_cloud_instance(running).await.unwrap();
        assert_eq!(store.count_cloud_instances_by_team("team-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_duplicate_id_fails() {
        let store = FakeStore::new();
        let instance = instance("team-1");
        store.create_cloud_instance(instance.clone()).await.unwrap();
        let err = store.create_cloud_instance(instance).await.unwrap_err();
        assert!(matches!(err, CloudControlError::InstanceAlreadyExists(_)));
    }
}
