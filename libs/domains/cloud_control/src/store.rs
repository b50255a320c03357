//! The `Store` capability (§4.2): durable persistence for `CloudInstance`
//! and `DedicatedHost` records, behind a trait so the core engine never
//! depends on a concrete persistence technology.

use crate::{
    error::CloudControlResult,
    models::{CloudInstance, CloudInstanceFilter, DedicatedHost},
};
use async_trait::async_trait;
use uuid::Uuid;

/// Durable persistence for cloud instances and dedicated hosts.
///
/// Implementations must honor §4.2's contracts: `Get*` returns
/// `CloudControlError::InstanceNotFound`/a host-not-found variant on miss,
/// composite fields round-trip losslessly, and `CountCloudInstancesByTeam`
/// excludes `terminated`/`failed` instances (§3 invariant 6).
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_cloud_instance(&self, instance: CloudInstance) -> CloudControlResult<CloudInstance>;

    async fn get_cloud_instance(&self, id: Uuid) -> CloudControlResult<Option<CloudInstance>>;

    async fn get_cloud_instance_by_agent_node_id(
        &self,
        agent_node_id: &str,
    ) -> CloudControlResult<Option<CloudInstance>>;

    async fn update_cloud_instance(&self, instance: CloudInstance) -> CloudControlResult<CloudInstance>;

    async fn delete_cloud_instance(&self, id: Uuid) -> CloudControlResult<()>;

    async fn list_cloud_instances(
        &self,
        filter: &CloudInstanceFilter,
    ) -> CloudControlResult<Vec<CloudInstance>>;

    /// Non-terminal instance count for a team, per §3 invariant 6.
    async fn count_cloud_instances_by_team(&self, team_id: &str) -> CloudControlResult<usize>;

    async fn create_dedicated_host(&self, host: DedicatedHost) -> CloudControlResult<DedicatedHost>;

    async fn get_dedicated_host(&self, id: Uuid) -> CloudControlResult<Option<DedicatedHost>>;

    async fn get_dedicated_host_by_host_id(
        &self,
        host_id: &str,
    ) -> CloudControlResult<Option<DedicatedHost>>;

    async fn update_dedicated_host(&self, host: DedicatedHost) -> CloudControlResult<DedicatedHost>;

    async fn list_dedicated_hosts(&self) -> CloudControlResult<Vec<DedicatedHost>>;

    /// The `available` host with the oldest `updated_at` (§4.2), or
    /// `Ok(None)` if none are free — `HostAllocator` maps the `None` case
    /// to `CloudControlError::NoAvailableHost`.
    async fn get_available_dedicated_host(&self) -> CloudControlResult<Option<DedicatedHost>>;
}
