//! Configuration for the cloud control subsystem (§6), loaded via
//! `core_config::FromEnv`. Durations are plain integer-seconds env vars
//! rather than duration-strings — this workspace has no duration-parsing
//! crate in its dependency set, and introducing one for a handful of
//! config keys would be exactly the kind of unneeded dependency the rest
//! of this domain avoids.

use core_config::{env_or_default, env_required, ConfigError, FromEnv};

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> Result<u32, ConfigError> {
    let raw = env_or_default(key, &default.to_string());
    raw.parse().map_err(|e| ConfigError::ParseError {
        key: key.to_string(),
        details: format!("{e}"),
    })
}

fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    let raw = env_or_default(key, &default.to_string());
    raw.parse().map_err(|e| ConfigError::ParseError {
        key: key.to_string(),
        details: format!("{e}"),
    })
}

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub enabled: bool,
    pub namespace: String,
    pub default_image: String,
    pub service_account: String,
}

#[derive(Debug, Clone)]
pub struct MacosIaasConfig {
    pub host_ids: Vec<String>,
    pub min_host_allocation_secs: i64,
    pub idle_host_release_secs: u64,
}

#[derive(Debug, Clone)]
pub struct WindowsIaasConfig {
    pub image_id: String,
}

#[derive(Debug, Clone)]
pub struct IaasConfig {
    pub enabled: bool,
    pub bootstrap_script: String,
    pub macos: MacosIaasConfig,
    pub windows: WindowsIaasConfig,
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: String,
}

/// Top-level cloud-control configuration (§6).
#[derive(Debug, Clone)]
pub struct CloudControlConfig {
    pub enabled: bool,
    pub max_instances_per_team: u32,
    pub provisioning_timeout_secs: u64,
    pub monitor_interval_secs: u64,
    pub control_plane_url: String,
    pub container: ContainerConfig,
    pub iaas: IaasConfig,
    pub billing: BillingConfig,
}

impl FromEnv for CloudControlConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let billing_enabled = env_flag("CLOUD_BILLING_ENABLED", false);

        Ok(Self {
            enabled: env_flag("CLOUD_ENABLED", true),
            max_instances_per_team: env_u32("CLOUD_MAX_INSTANCES_PER_TEAM", 10)?,
            provisioning_timeout_secs: env_u64("CLOUD_PROVISIONING_TIMEOUT_SECS", 600)?,
            monitor_interval_secs: env_u64("CLOUD_MONITOR_INTERVAL_SECS", 30)?,
            control_plane_url: env_or_default("CLOUD_CONTROL_PLANE_URL", "http://localhost:8080"),
            container: ContainerConfig {
                enabled: env_flag("CLOUD_CONTAINER_ENABLED", true),
                namespace: env_or_default("CLOUD_CONTAINER_NAMESPACE", "bots"),
                default_image: env_or_default(
                    "CLOUD_CONTAINER_DEFAULT_IMAGE",
                    "registry.internal/bot-runtime:latest",
                ),
                service_account: env_or_default("CLOUD_CONTAINER_SERVICE_ACCOUNT", "bot-runner"),
            },
            iaas: IaasConfig {
                enabled: env_flag("CLOUD_IAAS_ENABLED", true),
                bootstrap_script: env_or_default("CLOUD_IAAS_BOOTSTRAP_SCRIPT", "#!/bin/sh\necho bootstrap"),
                macos: MacosIaasConfig {
                    host_ids: env_or_default("CLOUD_IAAS_MACOS_HOST_IDS", "")
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                    // §6 default: 24h minimum allocation.
                    min_host_allocation_secs: env_u64("CLOUD_IAAS_MACOS_MIN_HOST_ALLOCATION_SECS", 86_400)? as i64,
                    // §6 default: 25h idle release.
                    idle_host_release_secs: env_u64("CLOUD_IAAS_MACOS_IDLE_HOST_RELEASE_SECS", 90_000)?,
                },
                windows: WindowsIaasConfig {
                    image_id: env_or_default("CLOUD_IAAS_WINDOWS_IMAGE_ID", "ami-windows-default"),
                },
            },
            billing: BillingConfig {
                enabled: billing_enabled,
                base_url: if billing_enabled {
                    env_required("CLOUD_BILLING_BASE_URL")?
                } else {
                    String::new()
                },
                api_key: if billing_enabled {
                    env_required("CLOUD_BILLING_API_KEY")?
                } else {
                    String::new()
                },
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        temp_env::with_vars_unset(
            [
                "CLOUD_ENABLED",
                "CLOUD_MAX_INSTANCES_PER_TEAM",
                "CLOUD_BILLING_ENABLED",
            ],
            || {
                let config = CloudControlConfig::from_env().unwrap();
                assert!(config.enabled);
                assert_eq!(config.max_instances_per_team, 10);
                assert!(!config.billing.enabled);
            },
        );
    }

    #[test]
    fn billing_requires_base_url_and_api_key_when_enabled() {
        temp_env::with_vars(
            [
                ("CLOUD_BILLING_ENABLED", Some("true")),
                ("CLOUD_BILLING_BASE_URL", None),
                ("CLOUD_BILLING_API_KEY", None),
            ],
            || {
                let result = CloudControlConfig::from_env();
                assert!(result.is_err());
            },
        );
    }

    #[test]
    fn billing_disabled_skips_required_vars() {
        temp_env::with_vars(
            [
                ("CLOUD_BILLING_ENABLED", Some("false")),
                ("CLOUD_BILLING_BASE_URL", None),
                ("CLOUD_BILLING_API_KEY", None),
            ],
            || {
                let config = CloudControlConfig::from_env().unwrap();
                assert!(!config.billing.enabled);
                assert_eq!(config.billing.base_url, "");
            },
        );
    }

    #[test]
    fn macos_host_ids_parse_from_comma_separated_list() {
        temp_env::with_var("CLOUD_IAAS_MACOS_HOST_IDS", Some("H1, H2,H3"), || {
            let config = CloudControlConfig::from_env().unwrap();
            assert_eq!(config.iaas.macos.host_ids, vec!["H1", "H2", "H3"]);
        });
    }

    #[test]
    fn invalid_integer_env_var_is_a_parse_error() {
        temp_env::with_var("CLOUD_MAX_INSTANCES_PER_TEAM", Some("not-a-number"), || {
            let result = CloudControlConfig::from_env();
            assert!(matches!(result, Err(ConfigError::ParseError { .. })));
        });
    }
}
