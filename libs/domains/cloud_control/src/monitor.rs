//! `Monitor` (§4.7): the background sweep that reconciles provider-reported
//! state, accrues cost, expires stuck provisioning attempts, and releases
//! idle dedicated hosts.
//!
//! Grounded on `apps/cloud/pricing-collector`'s scheduled-collection loop,
//! adapted from `tokio_cron_scheduler` to a plain `tokio::time::interval`
//! since §4.7 calls for a fixed period rather than a cron expression, with
//! the `tokio::sync::watch` stop-signal idiom this workspace's long-running
//! workers already use for graceful shutdown.

use crate::{
    event_bus::EventBus,
    manager::CloudManager,
    models::{CloudEventType, CloudInstanceFilter, HostState, InstanceState, Platform},
};
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// §6 default: instances stuck in `provisioning` longer than this are
/// failed out.
const DEFAULT_PROVISIONING_TIMEOUT: Duration = Duration::from_secs(600);

/// §4.5/§6 default idle-host release threshold.
const DEFAULT_IDLE_HOST_RELEASE: Duration = Duration::from_secs(90_000);

pub struct MonitorConfig {
    pub interval: Duration,
    pub provisioning_timeout: Duration,
    pub idle_host_release: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            provisioning_timeout: DEFAULT_PROVISIONING_TIMEOUT,
            idle_host_release: DEFAULT_IDLE_HOST_RELEASE,
        }
    }
}

/// Owns the background sweep task; `stop()` signals it to exit after its
/// current pass completes.
pub struct Monitor {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Monitor {
    /// Spawns the sweep loop immediately (§4.7 "Start").
    pub fn start(manager: CloudManager, config: MonitorConfig) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let events = manager.events().clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_sweep(&manager, &events, &config).await;
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self { stop_tx, handle }
    }

    /// Signals the sweep loop to stop and waits for its current pass to
    /// finish (§4.7 "Stop").
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}

/// Runs all four passes once. Each pass is wrapped in its own timeout and
/// swallows per-entity errors (logged, not propagated) so one bad record
/// never stalls the sweep for everything else (§4.7).
async fn run_sweep(manager: &CloudManager, events: &EventBus, config: &MonitorConfig) {
    const PASS_TIMEOUT: Duration = Duration::from_secs(60);

    if tokio::time::timeout(PASS_TIMEOUT, expire_stale_provisioning(manager, events, config.provisioning_timeout))
        .await
        .is_err()
    {
        tracing::warn!("monitor: stale-provisioning pass timed out");
    }

    if tokio::time::timeout(PASS_TIMEOUT, sync_provider_state(manager, events)).await.is_err() {
        tracing::warn!("monitor: state-sync pass timed out");
    }

    if tokio::time::timeout(PASS_TIMEOUT, accrue_cost(manager, config.interval)).await.is_err() {
        tracing::warn!("monitor: cost-accrual pass timed out");
    }

    if tokio::time::timeout(PASS_TIMEOUT, release_idle_hosts(manager, events, config.idle_host_release))
        .await
        .is_err()
    {
        tracing::warn!("monitor: idle-host-release pass timed out");
    }
}

/// Pass 1: instances stuck in `provisioning` past the timeout are
/// terminated via their provisioner; only if that termination call itself
/// fails do we directly stamp the store record `failed`.
async fn expire_stale_provisioning(manager: &CloudManager, events: &EventBus, timeout: Duration) {
    let filter = CloudInstanceFilter {
        state: Some(InstanceState::Provisioning),
        limit: usize::MAX,
        ..Default::default()
    };

    let instances = match manager.list(&filter).await {
        Ok(instances) => instances,
        Err(e) => {
            tracing::error!(error = %e, "monitor: failed to list provisioning instances");
            return;
        }
    };

    for instance in instances {
        let elapsed = Utc::now() - instance.requested_at;
        if (elapsed.num_seconds() as u64) < timeout.as_secs() {
            continue;
        }

        if let Ok(provisioner) = manager.provisioner_for(instance.platform).await {
            if let Ok(mut terminated) = provisioner.terminate_instance(instance.id).await {
                terminated.state = InstanceState::Terminated;
                terminated.terminated_at = Some(Utc::now());
                terminated.updated_at = Utc::now();

                if let Err(e) = manager.store().update_cloud_instance(terminated.clone()).await {
                    tracing::error!(error = %e, instance_id = %terminated.id, "monitor: failed to persist stale-provisioning termination");
                } else {
                    events
                        .publish(crate::models::CloudEvent::new(
                            CloudEventType::InstanceTerminated,
                            Some(terminated.id),
                            serde_json::json!({ "reason": "provisioning_timeout" }),
                        ))
                        .await;
                }
                continue;
            }
        }

        let mut failed = instance;
        failed.state = InstanceState::Failed;
        failed.error_message = Some("provisioning timeout".to_string());
        failed.updated_at = Utc::now();

        if let Err(e) = manager.store().update_cloud_instance(failed.clone()).await {
            tracing::error!(error = %e, instance_id = %failed.id, "monitor: failed to mark instance as failed");
            continue;
        }
        events
            .publish(crate::models::CloudEvent::new(
                CloudEventType::InstanceFailed,
                Some(failed.id),
                serde_json::json!({ "reason": "provisioning_timeout" }),
            ))
            .await;
    }
}

/// Pass 2: reconcile every `running` instance against what its provisioner
/// actually reports, refreshing IPs and stamping the transition-specific
/// fields the store record accumulates.
async fn sync_provider_state(manager: &CloudManager, events: &EventBus) {
    let filter = CloudInstanceFilter {
        state: Some(InstanceState::Running),
        limit: usize::MAX,
        ..Default::default()
    };

    let instances = match manager.list(&filter).await {
        Ok(instances) => instances,
        Err(e) => {
            tracing::error!(error = %e, "monitor: failed to list running instances for state sync");
            return;
        }
    };

    for mut instance in instances {
        let provisioner = match manager.provisioner_for(instance.platform).await {
            Ok(provisioner) => provisioner,
            Err(e) => {
                tracing::warn!(error = %e, instance_id = %instance.id, "monitor: no provisioner for instance");
                continue;
            }
        };

        let observed = match provisioner.get_instance(instance.id).await {
            Ok(observed) => observed,
            Err(e) => {
                tracing::warn!(error = %e, instance_id = %instance.id, "monitor: failed to re-observe instance");
                continue;
            }
        };

        if observed.state == instance.state {
            continue;
        }

        let previous_state = instance.state;
        instance.state = observed.state;
        instance.public_ip = observed.public_ip;
        instance.private_ip = observed.private_ip;
        instance.updated_at = Utc::now();

        let event_type = match observed.state {
            InstanceState::Terminated => {
                instance.terminated_at = Some(Utc::now());
                Some(CloudEventType::InstanceTerminated)
            }
            InstanceState::Running if instance.provisioned_at.is_none() => {
                instance.provisioned_at = Some(Utc::now());
                Some(CloudEventType::InstanceRunning)
            }
            InstanceState::Failed => Some(CloudEventType::InstanceFailed),
            _ => None,
        };

        if let Err(e) = manager.store().update_cloud_instance(instance.clone()).await {
            tracing::error!(error = %e, instance_id = %instance.id, "monitor: failed to persist synced state");
            continue;
        }

        tracing::debug!(instance_id = %instance.id, from = %previous_state, to = %instance.state, "monitor: synced provider state");

        if let Some(event_type) = event_type {
            events.publish(crate::models::CloudEvent::new(event_type, Some(instance.id), serde_json::json!({}))).await;
        }
    }
}

/// Pass 3: accrue cost for every running instance at the configured hourly
/// rate, flooring each tick's addition to at least one cent (§4.7).
async fn accrue_cost(manager: &CloudManager, interval: Duration) {
    let filter = CloudInstanceFilter {
        state: Some(InstanceState::Running),
        limit: usize::MAX,
        ..Default::default()
    };

    let instances = match manager.list(&filter).await {
        Ok(instances) => instances,
        Err(e) => {
            tracing::error!(error = %e, "monitor: failed to list running instances for accrual");
            return;
        }
    };

    let interval_hours = interval.as_secs_f64() / 3600.0;
    for mut instance in instances {
        let added = instance.accrue(interval_hours);
        if let Err(e) = manager.store().update_cloud_instance(instance.clone()).await {
            tracing::error!(error = %e, instance_id = %instance.id, "monitor: failed to persist cost accrual");
            continue;
        }
        metrics::counter!("cloud_control_accrued_cost_cents_total").increment(added as u64);
    }
}

/// Pass 4: release dedicated hosts that have sat idle (allocated, but their
/// owning instance is terminal or gone) past the configured threshold.
async fn release_idle_hosts(manager: &CloudManager, events: &EventBus, idle_release: Duration) {
    let hosts = match manager.store().list_dedicated_hosts().await {
        Ok(hosts) => hosts,
        Err(e) => {
            tracing::error!(error = %e, "monitor: failed to list dedicated hosts");
            return;
        }
    };

    for host in hosts {
        if host.state != HostState::Allocated {
            continue;
        }

        let instance_is_terminal = match host.current_instance_id {
            Some(instance_id) => match manager.get(instance_id).await {
                Ok(instance) => instance.state.is_terminal(),
                Err(_) => true,
            },
            None => true,
        };

        if !instance_is_terminal {
            continue;
        }

        let idle_since = host.allocated_at.unwrap_or(host.updated_at);
        if (Utc::now() - idle_since).num_seconds() as u64 < idle_release.as_secs() {
            continue;
        }

        match manager.host_allocator().release(host.id).await {
            Ok(_) => {
                events
                    .publish(crate::models::CloudEvent::new(
                        CloudEventType::HostReleased,
                        None,
                        serde_json::json!({ "host_id": host.host_id }),
                    ))
                    .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, host_id = %host.host_id, "monitor: failed to release idle host");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        billing::BillingClient,
        host_allocator::HostAllocator,
        models::ProvisionRequest,
        provisioner::{
            container::{ContainerProvisioner, SimulatedContainerBackend},
            Provisioner,
        },
        store::Store,
        testing::{FakeBillingClient, FakeStore},
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;

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

    #[tokio::test]
    async fn accrue_cost_adds_at_least_one_cent_per_tick() {
        let manager = manager().await;
        let instance = manager
            .create(ProvisionRequest {
                platform: Platform::Linux,
                bot_package: "bot".to_string(),
                bot_version: None,
                instance_type: None,
                team_id: "team-1".to_string(),
                tags: BTreeMap::new(),
                metadata: serde_json::Value::Null,
            })
            .await
            .unwrap();

        accrue_cost(&manager, Duration::from_secs(1)).await;

        let refreshed = manager.get(instance.id).await.unwrap();
        assert!(refreshed.accrued_cost_cents >= 1);
    }

    #[tokio::test]
    async fn expire_stale_provisioning_fails_out_long_stuck_instances() {
        let manager = manager().await;
        let store = manager.store().clone();

        let mut instance = crate::models::CloudInstance {
            id: uuid::Uuid::now_v7(),
            instance_id: "i-stuck".to_string(),
            platform: Platform::Linux,
            provider: crate::models::ProviderKind::Container,
            region: "local".to_string(),
            instance_type: "default".to_string(),
            image_id: "image".to_string(),
            state: InstanceState::Provisioning,
            bot_package: "bot".to_string(),
            bot_version: None,
            team_id: "team-1".to_string(),
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
            requested_at: Utc::now() - chrono::Duration::seconds(1000),
            provisioned_at: None,
            terminated_at: None,
            created_at: Utc::now() - chrono::Duration::seconds(1000),
            updated_at: Utc::now() - chrono::Duration::seconds(1000),
        };
        instance = store.create_cloud_instance(instance).await.unwrap();

        expire_stale_provisioning(&manager, manager.events(), Duration::from_secs(600)).await;

        let refreshed = manager.get(instance.id).await.unwrap();
        assert_eq!(refreshed.state, InstanceState::Failed);
    }

    #[tokio::test]
    async fn expire_stale_provisioning_terminates_instances_the_provisioner_still_knows_about() {
        // boot_delay long enough that the instance is created and observed
        // as still `provisioning` by its backend, not instantly `running`.
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let billing: Arc<dyn BillingClient> = Arc::new(FakeBillingClient::new(true, 5));
        let events = EventBus::new();
        let host_allocator = Arc::new(HostAllocator::new(store.clone()));
        let manager = CloudManager::with_default_cap(store.clone(), billing, events, host_allocator, true);

        let backend = Arc::new(SimulatedContainerBackend::new(chrono::Duration::seconds(300)));
        let provisioner: Arc<dyn Provisioner> = Arc::new(ContainerProvisioner::new(
            backend,
            "bots",
            "registry.internal/bot-runtime:latest",
            "bot-runner",
            "https://control.example.com",
            "api-key-1",
        ));
        manager.register_provisioner(Platform::Linux, provisioner).await;

        let created = manager
            .create(ProvisionRequest {
                platform: Platform::Linux,
                bot_package: "bot".to_string(),
                bot_version: None,
                instance_type: None,
                team_id: "team-1".to_string(),
                tags: BTreeMap::new(),
                metadata: serde_json::Value::Null,
            })
            .await
            .unwrap();
        assert_eq!(created.state, InstanceState::Provisioning);

        let mut stale = created.clone();
        stale.requested_at = Utc::now() - chrono::Duration::seconds(1000);
        store.update_cloud_instance(stale).await.unwrap();

        let (_sub_id, mut rx) = manager.events().subscribe().await;

        expire_stale_provisioning(&manager, manager.events(), Duration::from_secs(600)).await;

        let refreshed = manager.get(created.id).await.unwrap();
        assert_eq!(refreshed.state, InstanceState::Terminated);
        assert!(refreshed.terminated_at.is_some());

        let event = rx.try_recv().expect("expected an instance.terminated event");
        assert_eq!(event.event_type, CloudEventType::InstanceTerminated);
        assert_eq!(event.instance_id, Some(created.id));
    }
}
