//! Billing authorization and usage reporting (§4.3).
//!
//! Two variants satisfy one `BillingClient` contract: a `RemoteBillingClient`
//! that calls out to the configured billing service over HTTP using a
//! `reqwest` client with an explicit timeout, and a `PermissiveBillingClient`
//! that always authorizes using the design-default hourly rates, used when
//! billing is disabled.

use crate::{
    error::{CloudControlError, CloudControlResult},
    models::{AuthorizationDecision, CloudQuota, Platform},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// §4.3 "single shared client with a 10-second timeout".
const BILLING_TIMEOUT: Duration = Duration::from_secs(10);

/// Default hourly rates (cents) used by the permissive authorizer (§4.3).
/// Design defaults only — production deployments should always configure a
/// real `RemoteBillingClient`.
pub fn default_hourly_cents(platform: Platform) -> i64 {
    match platform {
        Platform::Linux => 1,
        Platform::Windows => 10,
        Platform::Macos => 120,
    }
}

/// Remote authorization oracle and usage sink (§4.3).
#[async_trait]
pub trait BillingClient: Send + Sync {
    async fn authorize(
        &self,
        team_id: &str,
        platform: Platform,
        instance_type: &str,
    ) -> CloudControlResult<AuthorizationDecision>;

    /// Best-effort: callers must not roll back accrual on failure (§4.3,
    /// §7 "Local recovery").
    async fn report_usage(
        &self,
        instance_id: &str,
        platform: Platform,
        hours: f64,
        hourly_cents: i64,
    ) -> CloudControlResult<()>;

    async fn get_team_quota(&self, team_id: &str) -> CloudControlResult<CloudQuota>;
}

#[derive(Debug, Serialize)]
struct AuthorizeRequest<'a> {
    team_id: &'a str,
    platform: &'a str,
    instance_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthorizeResponse {
    authorized: bool,
    tier: Option<String>,
    hourly_cents: i64,
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReportUsageRequest<'a> {
    instance_id: &'a str,
    platform: &'a str,
    hours: f64,
    hourly_cents: i64,
}

/// Calls a remote billing service over HTTP with a bearer token.
pub struct RemoteBillingClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RemoteBillingClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(BILLING_TIMEOUT)
            .build()
            .expect("failed to build billing HTTP client");

        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl BillingClient for RemoteBillingClient {
    async fn authorize(
        &self,
        team_id: &str,
        platform: Platform,
        instance_type: &str,
    ) -> CloudControlResult<AuthorizationDecision> {
        let url = format!("{}/authorize", self.base_url);
        let body = AuthorizeRequest {
            team_id,
            platform: &platform.to_string(),
            instance_type,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "billing authorize call failed");
                CloudControlError::BillingServiceUnavailable
            })?;

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "billing authorize returned non-success");
            return Err(CloudControlError::BillingServiceUnavailable);
        }

        let parsed: AuthorizeResponse = response.json().await.map_err(|e| {
            tracing::warn!(error = %e, "billing authorize response was not valid JSON");
            CloudControlError::BillingServiceUnavailable
        })?;

        Ok(AuthorizationDecision {
            authorized: parsed.authorized,
            tier: parsed.tier,
            hourly_cents: parsed.hourly_cents,
            reason: parsed.reason,
        })
    }

    async fn report_usage(
        &self,
        instance_id: &str,
        platform: Platform,
        hours: f64,
        hourly_cents: i64,
    ) -> CloudControlResult<()> {
        let url = format!("{}/usage", self.base_url);
        let body = ReportUsageRequest {
            instance_id,
            platform: &platform.to_string(),
            hours,
            hourly_cents,
        };

        let result = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await;

        // Non-fatal per §4.3: log only, never propagate.
        match result {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(status = %response.status(), instance_id, "billing usage report rejected");
            }
            Err(e) => {
                tracing::warn!(error = %e, instance_id, "billing usage report failed");
            }
            _ => {}
        }

        Ok(())
    }

    async fn get_team_quota(&self, team_id: &str) -> CloudControlResult<CloudQuota> {
        let url = format!("{}/quota/{}", self.base_url, team_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "billing quota call failed");
                CloudControlError::BillingServiceUnavailable
            })?;

        response.json().await.map_err(|e| {
            tracing::warn!(error = %e, "billing quota response was not valid JSON");
            CloudControlError::BillingServiceUnavailable
        })
    }
}

/// Always authorizes using the design-default hourly rates. Used when
/// `billing.enabled=false`.
pub struct PermissiveBillingClient;

#[async_trait]
impl BillingClient for PermissiveBillingClient {
    async fn authorize(
        &self,
        _team_id: &str,
        platform: Platform,
        _instance_type: &str,
    ) -> CloudControlResult<AuthorizationDecision> {
        Ok(AuthorizationDecision {
            authorized: true,
            tier: Some("default".to_string()),
            hourly_cents: default_hourly_cents(platform),
            reason: None,
        })
    }

    async fn report_usage(
        &self,
        _instance_id: &str,
        _platform: Platform,
        _hours: f64,
        _hourly_cents: i64,
    ) -> CloudControlResult<()> {
        Ok(())
    }

    async fn get_team_quota(&self, team_id: &str) -> CloudControlResult<CloudQuota> {
        Ok(CloudQuota {
            team_id: team_id.to_string(),
            platform_caps: Default::default(),
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

    #[tokio::test]
    async fn permissive_client_always_authorizes_with_default_rates() {
        let client = PermissiveBillingClient;

        let decision = client.authorize("team-1", Platform::Macos, "mac2.metal").await.unwrap();
        assert!(decision.authorized);
        assert_eq!(decision.hourly_cents, 120);

        let decision = client.authorize("team-1", Platform::Linux, "t3.small").await.unwrap();
        assert_eq!(decision.hourly_cents, 1);

        let decision = client.authorize("team-1", Platform::Windows, "t3.small").await.unwrap();
        assert_eq!(decision.hourly_cents, 10);
    }

    #[tokio::test]
    async fn permissive_client_report_usage_never_fails() {
        let client = PermissiveBillingClient;
        let result = client.report_usage("i-123", Platform::Linux, 0.5, 1).await;
        assert!(result.is_ok());
    }
}
