use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Compute platform an instance runs on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Platform {
    Linux,
    Macos,
    Windows,
}

/// Backend a given instance was dispatched through.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProviderKind {
    Container,
    Iaas,
}

/// Canonical instance lifecycle state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString, Default, ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InstanceState {
    #[default]
    Requested,
    Provisioning,
    Running,
    Stopped,
    Terminated,
    Failed,
}

impl InstanceState {
    /// Whether `self -> next` is a transition §3 invariant 2 allows.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Requested, Provisioning)
                | (Provisioning, Running)
                | (Provisioning, Failed)
                | (Running, Stopped)
                | (Running, Terminated)
                | (Running, Failed)
                | (Stopped, Running)
                | (Stopped, Terminated)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Terminated | InstanceState::Failed)
    }
}

/// Dedicated host allocation state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default, ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HostState {
    #[default]
    Available,
    Allocated,
    Released,
}

/// Remote-access protocol a provisioner exposes, chosen by platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ToSchema)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionProtocol {
    Vnc,
    Rdp,
    Exec,
    RemoteShell,
}

/// How a caller reaches a provisioned instance.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConnectionInfo {
    pub protocol: ConnectionProtocol,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_data: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// Result of a single `ExecuteCommand` call.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The central provisioned-resource record (§3 CloudInstance).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CloudInstance {
    pub id: Uuid,
    pub instance_id: String,
    pub platform: Platform,
    pub provider: ProviderKind,
    pub region: String,
    pub instance_type: String,
    pub image_id: String,
    pub state: InstanceState,
    pub bot_package: String,
    pub bot_version: Option<String>,
    pub team_id: String,
    pub agent_node_id: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub hourly_rate_cents: i64,
    pub accrued_cost_cents: i64,
    pub billing_tier: Option<String>,
    pub dedicated_host_id: Option<Uuid>,
    pub connection_info: Option<ConnectionInfo>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub error_message: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CloudInstance {
    /// Stamp a transition's bookkeeping fields the way Monitor pass 2 requires.
    pub fn apply_state_sync(&mut self, new_state: InstanceState, public_ip: Option<String>, private_ip: Option<String>) {
        self.state = new_state;
        if public_ip.is_some() {
            self.public_ip = public_ip;
        }
        if private_ip.is_some() {
            self.private_ip = private_ip;
        }
        self.updated_at = Utc::now();
        match new_state {
            InstanceState::Terminated => self.terminated_at = Some(Utc::now()),
            InstanceState::Running if self.provisioned_at.is_none() => {
                self.provisioned_at = Some(Utc::now());
            }
            _ => {}
        }
    }

    /// Add accrued cost for one monitor tick, per §4.7 pass 3's floor rule.
    pub fn accrue(&mut self, interval_hours: f64) -> i64 {
        let raw = (self.hourly_rate_cents as f64 * interval_hours).round() as i64;
        let added = raw.max(1);
        self.accrued_cost_cents += added;
        self.updated_at = Utc::now();
        added
    }
}

/// A tenancy-constrained physical host for macOS instances (§3 DedicatedHost).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DedicatedHost {
    pub id: Uuid,
    pub host_id: String,
    pub instance_type: String,
    pub state: HostState,
    pub current_instance_id: Option<Uuid>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub min_allocation_secs: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DedicatedHost {
    pub fn new(host_id: String, instance_type: String, min_allocation_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            host_id,
            instance_type,
            state: HostState::Available,
            current_instance_id: None,
            allocated_at: None,
            released_at: None,
            min_allocation_secs,
            created_at: now,
            updated_at: now,
        }
    }

    /// §4.5 `Release`: true if `allocated_at + min_allocation <= now`.
    pub fn min_allocation_met(&self, now: DateTime<Utc>) -> bool {
        match self.allocated_at {
            Some(allocated_at) => {
                now.signed_duration_since(allocated_at).num_seconds() >= self.min_allocation_secs
            }
            None => true,
        }
    }
}

/// Event types published on the bus (§6 SSE stream list).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ToSchema)]
pub enum CloudEventType {
    #[strum(serialize = "instance.requested")]
    #[serde(rename = "instance.requested")]
    InstanceRequested,
    #[strum(serialize = "instance.provisioning")]
    #[serde(rename = "instance.provisioning")]
    InstanceProvisioning,
    #[strum(serialize = "instance.running")]
    #[serde(rename = "instance.running")]
    InstanceRunning,
    #[strum(serialize = "instance.stopped")]
    #[serde(rename = "instance.stopped")]
    InstanceStopped,
    #[strum(serialize = "instance.terminated")]
    #[serde(rename = "instance.terminated")]
    InstanceTerminated,
    #[strum(serialize = "instance.failed")]
    #[serde(rename = "instance.failed")]
    InstanceFailed,
    #[strum(serialize = "instance.connected")]
    #[serde(rename = "instance.connected")]
    InstanceConnected,
    #[strum(serialize = "host.allocated")]
    #[serde(rename = "host.allocated")]
    HostAllocated,
    #[strum(serialize = "host.released")]
    #[serde(rename = "host.released")]
    HostReleased,
}

/// A lifecycle notification (§3 CloudEvent). Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CloudEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: CloudEventType,
    pub instance_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl CloudEvent {
    pub fn new(event_type: CloudEventType, instance_id: Option<Uuid>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type,
            instance_id,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Inbound request to provision an instance (§6 `POST /cloud/instances`).
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ProvisionRequest {
    pub platform: Platform,
    #[validate(length(min = 1, max = 255))]
    pub bot_package: String,
    pub bot_version: Option<String>,
    pub instance_type: Option<String>,
    #[validate(length(min = 1))]
    pub team_id: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Query filters for `ListCloudInstances` (§4.2).
#[derive(Debug, Clone, Default, Deserialize, ToSchema, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CloudInstanceFilter {
    pub platform: Option<Platform>,
    pub state: Option<InstanceState>,
    pub team_id: Option<String>,
    pub provider: Option<ProviderKind>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

/// `GET /cloud/quota` response.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CloudQuota {
    pub team_id: String,
    pub platform_caps: BTreeMap<Platform, u32>,
    pub compute_hour_cap: Option<f64>,
    pub monthly_budget_cents_cap: Option<i64>,
    pub current_non_terminal_instances: usize,
    pub current_month_cost_cents: i64,
}

/// `CloudManager::Summary()` aggregate (§4.6 Read contracts).
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct CloudSummary {
    pub by_platform: BTreeMap<Platform, usize>,
    pub by_state: BTreeMap<InstanceState, usize>,
    pub total_accrued_cost_cents: i64,
    pub active_host_count: usize,
    pub estimated_current_hour_cost_cents: i64,
}

/// Result of a billing authorization decision (§4.3).
#[derive(Debug, Clone)]
pub struct AuthorizationDecision {
    pub authorized: bool,
    pub tier: Option<String>,
    pub hourly_cents: i64,
    pub reason: Option<String>,
}

/// Result envelope for `GET /cloud/instances`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ListInstancesResponse {
    pub instances: Vec<CloudInstance>,
    pub count: usize,
    pub filters: CloudInstanceFilter,
}

impl Serialize for CloudInstanceFilter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("CloudInstanceFilter", 6)?;
        s.serialize_field("platform", &self.platform)?;
        s.serialize_field("state", &self.state)?;
        s.serialize_field("team_id", &self.team_id)?;
        s.serialize_field("provider", &self.provider)?;
        s.serialize_field("limit", &self.limit)?;
        s.serialize_field("offset", &self.offset)?;
        s.end()
    }
}

/// Provider-facing request shape a `Provisioner::create_instance` consumes,
/// built by `CloudManager::create` from a `ProvisionRequest` plus the
/// billing authorization outcome.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub platform: Platform,
    pub bot_package: String,
    pub bot_version: Option<String>,
    pub instance_type: Option<String>,
    pub team_id: String,
    pub tags: BTreeMap<String, String>,
    pub metadata: serde_json::Value,
    pub dedicated_host_id: Option<Uuid>,
    pub dedicated_host_provider_id: Option<String>,
}
