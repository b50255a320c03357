//! The `Provisioner` capability (§4.4): a uniform operation set over
//! heterogeneous compute backends, with two concrete implementations
//! (`container`, `iaas`).
//!
//! Follows this workspace's `#[async_trait] trait + Send + Sync` repository
//! shape. No live Kubernetes or AWS SDK crate is wired into this
//! workspace's dependency set, and adding one here would be inventing a
//! dependency with no other user in the pack (§9's "the remote billing
//! service itself" principle applies equally to the compute backends) — so
//! each `Provisioner` drives a small `BackendClient` seam with an
//! in-process simulated default implementation that models the phase/state
//! machines and timing of §4.4.a/b exactly. Only that bottom-most "make a
//! call to the provider" layer is a seam; every documented label/tag
//! scheme, state mapping, and special case above it is real and testable.

pub mod container;
pub mod iaas;

use crate::{
    error::CloudControlResult,
    models::{CloudInstance, CloudInstanceFilter, CommandResult, ConnectionInfo, DispatchRequest, Platform},
};
use async_trait::async_trait;
use uuid::Uuid;

pub use container::ContainerProvisioner;
pub use iaas::IaasProvisioner;

/// Which interpreter `ExecuteCommand` invokes a command through, selected by
/// platform (§4.4 "platform-aware (shell vs. powershell)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandShell {
    Sh,
    PowerShell,
}

impl CommandShell {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Windows => CommandShell::PowerShell,
            Platform::Linux | Platform::Macos => CommandShell::Sh,
        }
    }

    /// Renders `command` as the literal invocation this interpreter runs.
    pub fn wrap(self, command: &str) -> String {
        let quoted = format!("'{}'", command.replace('\'', "'\\''"));
        match self {
            CommandShell::Sh => format!("sh -c {quoted}"),
            CommandShell::PowerShell => format!("powershell -Command {quoted}"),
        }
    }
}

/// Backend-specific adapter translating the canonical capability set (§4.4)
/// into calls against a concrete compute platform.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Short identifier for logging/metrics, e.g. `"container"`, `"iaas"`.
    fn name(&self) -> &'static str;

    /// Platforms this provisioner can serve.
    fn supports(&self, platform: Platform) -> bool;

    /// Allocates provider-native resources and stamps an initial
    /// `CloudInstance` with `state=provisioning`. Idempotent at the level
    /// of `request.id` (§4.4): re-issuing with the same id must not create
    /// a second backend instance.
    async fn create_instance(&self, request: DispatchRequest) -> CloudControlResult<CloudInstance>;

    async fn get_instance(&self, id: Uuid) -> CloudControlResult<Option<CloudInstance>>;

    async fn list_instances(&self, filter: &CloudInstanceFilter) -> CloudControlResult<Vec<CloudInstance>>;

    /// Meaningless for container orchestrators — MUST fail with
    /// `CloudControlError::InvalidState` there (§4.4).
    async fn start_instance(&self, id: Uuid) -> CloudControlResult<CloudInstance>;

    /// Equivalent to terminate on backends without a stop concept.
    async fn stop_instance(&self, id: Uuid) -> CloudControlResult<CloudInstance>;

    /// Irreversible. Releases any associated `DedicatedHost` after the
    /// backend call succeeds (macOS IaaS, §4.4.b).
    async fn terminate_instance(&self, id: Uuid) -> CloudControlResult<CloudInstance>;

    async fn get_connection_info(&self, id: Uuid) -> CloudControlResult<ConnectionInfo>;

    async fn execute_command(&self, id: Uuid, command: &str) -> CloudControlResult<CommandResult>;

    async fn get_logs(&self, id: Uuid, lines: usize) -> CloudControlResult<String>;
}
