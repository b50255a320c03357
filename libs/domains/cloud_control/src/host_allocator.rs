//! Lifecycle management for tenancy-constrained physical hosts (§4.5).
//!
//! Follows this workspace's validate-then-delegate service shape,
//! with the optimistic claim-and-retry loop built on
//! `database::common::retry::retry_with_backoff`, the same bounded-attempt
//! primitive used elsewhere in this workspace for anything that can race.

use crate::{
    error::{CloudControlError, CloudControlResult},
    models::{DedicatedHost, HostState},
    store::Store,
};
use chrono::Utc;
use database::common::retry::{retry_with_backoff, RetryConfig};
use std::sync::Arc;
use uuid::Uuid;

/// §4.5: "a small bounded number of retries" for the optimistic claim loop.
const ACQUIRE_MAX_RETRIES: u32 = 5;

/// Allocates and releases dedicated hosts against the `Store`, enforcing
/// the minimum-allocation period (§4.5, §3 invariant 4).
pub struct HostAllocator {
    store: Arc<dyn Store>,
}

impl HostAllocator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Atomically finds an `available` host and marks it `allocated`.
    ///
    /// The store has no generic compare-and-swap primitive, so this
    /// performs an optimistic read-check-update: read the least-recently
    /// updated available host, verify it is still `available` and its
    /// `updated_at` hasn't moved (a concurrent allocator would have bumped
    /// it), and update. A conflict — another caller won the race — retries
    /// up to `ACQUIRE_MAX_RETRIES` times before surfacing
    /// `CloudControlError::NoAvailableHost`.
    pub async fn acquire(&self, instance_id: Uuid) -> CloudControlResult<DedicatedHost> {
        let store = self.store.clone();
        let config = RetryConfig::new()
            .with_max_retries(ACQUIRE_MAX_RETRIES)
            .with_initial_delay(10)
            .with_max_delay(200);

        retry_with_backoff(
            move || {
                let store = store.clone();
                async move { Self::try_claim(&*store, instance_id).await }
            },
            config,
        )
        .await
    }

    async fn try_claim(store: &dyn Store, instance_id: Uuid) -> CloudControlResult<DedicatedHost> {
        let candidate = store
            .get_available_dedicated_host()
            .await?
            .ok_or(CloudControlError::NoAvailableHost)?;

        let expected_updated_at = candidate.updated_at;
        let mut claimed = candidate;
        claimed.state = HostState::Allocated;
        claimed.current_instance_id = Some(instance_id);
        claimed.allocated_at = Some(Utc::now());
        claimed.released_at = None;
        claimed.updated_at = Utc::now();

        // Re-read immediately before writing to detect a racing claim; the
        // store's `Update` is last-writer-wins (§4.2), so this is the
        // application-level precondition check the spec calls for.
        let fresh = store
            .get_dedicated_host(claimed.id)
            .await?
            .ok_or(CloudControlError::NoAvailableHost)?;
        if fresh.state != HostState::Available || fresh.updated_at != expected_updated_at {
            return Err(CloudControlError::NoAvailableHost);
        }

        store.update_dedicated_host(claimed).await
    }

    /// Releases a host back to `available`, refusing if `min_allocation`
    /// has not yet elapsed (§4.5, §3 invariant 4).
    pub async fn release(&self, host_id: Uuid) -> CloudControlResult<DedicatedHost> {
        let mut host = self
            .store
            .get_dedicated_host(host_id)
            .await?
            .ok_or(CloudControlError::NoAvailableHost)?;

        let now = Utc::now();
        if !host.min_allocation_met(now) {
            return Err(CloudControlError::HostMinAllocation {
                host_id: host.host_id.clone(),
            });
        }

        host.state = HostState::Released;
        host.current_instance_id = None;
        host.released_at = Some(now);
        host.updated_at = now;

        // A released host becomes eligible for reallocation immediately;
        // the monitor's idle-release pass (§4.7 pass 4) is the only other
        // writer of `released_at`, and both converge on the same state.
        host.state = HostState::Available;
        self.store.update_dedicated_host(host).await
    }

    /// Idempotent: inserts an `available` host record for each configured
    /// id that isn't already present, via a keyed existence check per id
    /// rather than a full-list scan (§9 open question resolution).
    pub async fn seed(
        &self,
        host_ids: &[String],
        instance_type: &str,
        min_allocation_secs: i64,
    ) -> CloudControlResult<()> {
        for host_id in host_ids {
            if self.store.get_dedicated_host_by_host_id(host_id).await?.is_some() {
                continue;
            }

            let host = DedicatedHost::new(host_id.clone(), instance_type.to_string(), min_allocation_secs);
            self.store.create_dedicated_host(host).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeStore;

    #[tokio::test]
    async fn seed_is_idempotent() {
        let store = Arc::new(FakeStore::new());
        let allocator = HostAllocator::new(store.clone());

        allocator.seed(&["H1".to_string(), "H2".to_string()], "mac2.metal", 86400).await.unwrap();
        allocator.seed(&["H1".to_string(), "H2".to_string()], "mac2.metal", 86400).await.unwrap();

        let hosts = store.list_dedicated_hosts().await.unwrap();
        assert_eq!(hosts.len(), 2);
    }

    #[tokio::test]
    async fn acquire_allocates_then_exhausts_hosts() {
        let store = Arc::new(FakeStore::new());
        let allocator = HostAllocator::new(store.clone());
        allocator.seed(&["H1".to_string()], "mac2.metal", 86400).await.unwrap();

        let host = allocator.acquire(Uuid::now_v7()).await.unwrap();
        assert_eq!(host.state, HostState::Allocated);

        let err = allocator.acquire(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, CloudControlError::NoAvailableHost));
    }

    #[tokio::test]
    async fn release_before_min_allocation_is_refused() {
        let store = Arc::new(FakeStore::new());
        let allocator = HostAllocator::new(store.clone());
        allocator.seed(&["H1".to_string()], "mac2.metal", 86400).await.unwrap();

        let host = allocator.acquire(Uuid::now_v7()).await.unwrap();
        let err = allocator.release(host.id).await.unwrap_err();
        assert!(matches!(err, CloudControlError::HostMinAllocation { .. }));
    }

    #[tokio::test]
    async fn release_after_min_allocation_succeeds() {
        let store = Arc::new(FakeStore::new());
        let allocator = HostAllocator::new(store.clone());
        allocator.seed(&["H1".to_string()], "mac2.metal", 0).await.unwrap();

        let host = allocator.acquire(Uuid::now_v7()).await.unwrap();
        let released = allocator.release(host.id).await.unwrap();
        assert_eq!(released.state, HostState::Available);
        assert!(released.released_at.is_some());
    }
}
