use crate::models::{Platform, ProviderKind};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

pub type CloudControlResult<T> = Result<T, CloudControlError>;

/// Error taxonomy from §7, named by kind rather than by underlying cause.
#[derive(Debug, thiserror::Error)]
pub enum CloudControlError {
    #[error("cloud subsystem is disabled")]
    CloudDisabled,

    #[error("provisioner for platform {0} is disabled")]
    ProviderDisabled(Platform),

    #[error("no provisioner registered for platform {0}")]
    InvalidPlatform(Platform),

    #[error("team {team_id} has reached its instance cap of {cap}")]
    MaxInstancesReached { team_id: String, cap: u32 },

    #[error("no dedicated host is available")]
    NoAvailableHost,

    #[error("host {host_id} has not met its minimum allocation period")]
    HostMinAllocation { host_id: String },

    #[error("instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("instance already exists: {0}")]
    InstanceAlreadyExists(String),

    #[error("invalid state for this operation: {0}")]
    InvalidState(String),

    #[error("instance {0} exceeded the provisioning timeout")]
    ProvisioningTimeout(Uuid),

    #[error("billing denied the request: {0}")]
    BillingNotAuthorized(String),

    #[error("billing quota exceeded: {0}")]
    BillingQuotaExceeded(String),

    #[error("billing service is unavailable")]
    BillingServiceUnavailable,

    #[error("provisioning failed on {provider}/{platform} for instance {instance_id:?}: {underlying}")]
    ProvisioningFailed {
        instance_id: Option<Uuid>,
        platform: Platform,
        provider: ProviderKind,
        underlying: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for CloudControlError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::CloudDisabled | Self::ProviderDisabled(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            Self::MaxInstancesReached { .. } => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            Self::NoAvailableHost => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            Self::InvalidPlatform(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::BillingNotAuthorized(_) | Self::BillingQuotaExceeded(_) => {
                (StatusCode::PAYMENT_REQUIRED, self.to_string())
            }
            Self::BillingServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            Self::InstanceNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Self::HostMinAllocation { .. }
            | Self::InstanceAlreadyExists(_)
            | Self::InvalidState(_)
            | Self::ProvisioningTimeout(_)
            | Self::ProvisioningFailed { .. }
            | Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
