//! Control plane binary: provisions and lifecycle-manages cloud compute
//! instances that host bot agents, across a container orchestrator and a
//! dedicated-host IaaS backend.

use axum::{middleware as axum_middleware, routing::get, Router};
use axum_helpers::server::{create_production_app, create_router, HealthCheckFuture, run_health_checks};
use core_config::{tracing::init_tracing, Environment, FromEnv};
use database::postgres::PostgresConfig;
use domain_cloud_control::{
    billing::{PermissiveBillingClient, RemoteBillingClient},
    event_bus::EventBus,
    handlers::{self, ApiDoc},
    host_allocator::HostAllocator,
    manager::CloudManager,
    models::Platform,
    monitor::{Monitor, MonitorConfig},
    postgres::PgStore,
    provisioner::{
        container::{ContainerProvisioner, SimulatedContainerBackend},
        iaas::{IaasProvisioner, SimulatedIaasBackend},
    },
    CloudControlConfig,
};
use std::{sync::Arc, time::Duration};
use tracing::info;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let environment = Environment::from_env();
    init_tracing(&environment);

    observability::init_metrics();
    info!("Prometheus metrics initialized");

    let config = CloudControlConfig::from_env()?;
    let db_config = <PostgresConfig as FromEnv>::from_env()?;

    info!("Connecting to database...");
    let db = database::postgres::connect_from_config_with_retry(db_config, None)
        .await
        .map_err(|e| eyre::eyre!("database connection failed: {e}"))?;

    database::postgres::run_migrations::<migration::Migrator>(&db, "control-plane")
        .await
        .map_err(|e| eyre::eyre!("migrations failed: {e}"))?;

    let store: Arc<dyn domain_cloud_control::Store> = Arc::new(PgStore::new(db.clone()));

    let billing: Arc<dyn domain_cloud_control::BillingClient> = if config.billing.enabled {
        Arc::new(RemoteBillingClient::new(
            config.billing.base_url.clone(),
            config.billing.api_key.clone(),
        ))
    } else {
        info!("billing disabled, using permissive default-rate authorizer");
        Arc::new(PermissiveBillingClient)
    };

    let events = EventBus::new();
    let host_allocator = Arc::new(HostAllocator::new(store.clone()));

    host_allocator
        .seed(
            &config.iaas.macos.host_ids,
            "mac2.metal",
            config.iaas.macos.min_host_allocation_secs,
        )
        .await
        .map_err(|e| eyre::eyre!("failed to seed dedicated hosts: {e}"))?;

    let manager = CloudManager::new(
        store.clone(),
        billing,
        events.clone(),
        host_allocator.clone(),
        config.enabled,
        config.max_instances_per_team,
    );

    if config.container.enabled {
        let backend = Arc::new(SimulatedContainerBackend::default());
        let provisioner = Arc::new(ContainerProvisioner::new(
            backend,
            config.container.namespace.clone(),
            config.container.default_image.clone(),
            config.container.service_account.clone(),
            config.control_plane_url.clone(),
            config.billing.api_key.clone(),
        ));
        manager.register_provisioner(Platform::Linux, provisioner).await;
        info!("registered container provisioner for linux");
    }

    if config.iaas.enabled {
        let backend = Arc::new(SimulatedIaasBackend::default());
        let iaas_host_allocator = HostAllocator::new(store.clone());
        let provisioner = Arc::new(IaasProvisioner::new(
            backend,
            iaas_host_allocator,
            config.iaas.bootstrap_script.clone(),
        ));
        manager.register_provisioner(Platform::Macos, provisioner.clone()).await;
        manager.register_provisioner(Platform::Windows, provisioner).await;
        info!("registered iaas provisioner for macos, windows");
    }

    let monitor = Monitor::start(
        manager.clone(),
        MonitorConfig {
            interval: Duration::from_secs(config.monitor_interval_secs),
            provisioning_timeout: Duration::from_secs(config.provisioning_timeout_secs),
            idle_host_release: Duration::from_secs(config.iaas.macos.idle_host_release_secs),
        },
    );

    let cloud_routes = Router::new()
        .nest("/cloud", handlers::router(manager))
        .layer(axum_middleware::from_fn(observability::middleware::metrics_middleware));
    let router = create_router::<ApiDoc>(cloud_routes).await?;

    let metrics_router = Router::new().route("/metrics", get(observability::metrics_handler));
    let ready_router = {
        let db = db.clone();
        Router::new().route(
            "/ready",
            get(move || {
                let db = db.clone();
                async move {
                    let checks: Vec<(&str, HealthCheckFuture<'_>)> = vec![(
                        "database",
                        Box::pin(async { db.ping().await.map_err(|e| format!("database ping failed: {e}")) }),
                    )];

                    match run_health_checks(checks).await {
                        Ok((status, json)) => (status, json),
                        Err((status, json)) => (status, json),
                    }
                }
            }),
        )
    };

    let server_config = core_config::server::ServerConfig::from_env()?;

    let app = router.merge(ready_router).merge(metrics_router);

    info!("starting control plane with production-ready shutdown (30s timeout)");

    create_production_app(
        app,
        &server_config,
        Duration::from_secs(30),
        async move {
            info!("shutting down: stopping monitor and closing database connection");

            monitor.stop().await;

            match db.close().await {
                Ok(_) => info!("postgresql connection closed successfully"),
                Err(e) => tracing::error!("error closing postgresql: {e}"),
            }
        },
    )
    .await
    .map_err(|e| eyre::eyre!("server error: {e}"))?;

    info!("control plane shutdown complete");
    Ok(())
}
