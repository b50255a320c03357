//! Cloud control domain
//!
//! Provisions and lifecycle-manages cloud compute instances that host bot
//! agents, across a container orchestrator (Linux) and a dedicated-host IaaS
//! backend (macOS, Windows).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │  Handlers   │  ← HTTP/SSE endpoints
//! └──────┬──────┘
//!        │
//! ┌──────▼──────┐
//! │CloudManager │  ← orchestration: billing, events, provisioner dispatch
//! └──┬───────┬──┘
//!    │       │
//! ┌──▼──┐ ┌──▼────────────┐
//! │Store│ │  Provisioner   │  ← container / IaaS backends
//! └─────┘ └───────┬────────┘
//!                 │
//!          ┌──────▼───────┐
//!          │ HostAllocator│  ← dedicated-host claim/release
//!          └──────────────┘
//! ```
//!
//! `Monitor` runs alongside as a background sweeper reconciling provider
//! state, accruing cost, and releasing idle hosts.

pub mod billing;
pub mod config;
pub mod entity;
pub mod error;
pub mod event_bus;
pub mod handlers;
pub mod host_allocator;
pub mod manager;
pub mod models;
pub mod monitor;
pub mod postgres;
pub mod provisioner;
pub mod store;
#[cfg(test)]
pub mod testing;

pub use billing::{BillingClient, PermissiveBillingClient, RemoteBillingClient};
pub use config::CloudControlConfig;
pub use error::{CloudControlError, CloudControlResult};
pub use event_bus::EventBus;
pub use host_allocator::HostAllocator;
pub use manager::CloudManager;
pub use models::{
    CloudEvent, CloudEventType, CloudInstance, CloudInstanceFilter, CloudQuota, CloudSummary, DedicatedHost,
    InstanceState, Platform, ProviderKind, ProvisionRequest,
};
pub use monitor::{Monitor, MonitorConfig};
pub use postgres::PgStore;
pub use store::Store;
