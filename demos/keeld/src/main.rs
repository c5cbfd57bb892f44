mod config;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use keel::{Container, ContainerOptions};
use keel_security::checks::{BindAddrCheck, RootUserCheck, SecretStrengthCheck, UlimitCheck};
use keel_security::{Gate, Severity};
use keel_server::{HttpService, MonitorService, ObservabilityConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;

struct AlwaysHealthy;

#[async_trait::async_trait]
impl keel_health::HealthChecker for AlwaysHealthy {
    fn name(&self) -> &str {
        "self"
    }

    async fn check(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn api_router() -> Router {
    Router::new()
        .route("/", get(|| async { "keeld up\n" }))
        .route("/greet", get(|| async { "hello from keeld\n" }))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keeld=info,keel=info,keel_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from environment");

    let mut gate = Gate::new();
    gate.register(RootUserCheck::new(Severity::Warn));
    gate.register(BindAddrCheck::new(config.address.clone(), config.allow_public_bind));
    gate.register(UlimitCheck::new(4096, Severity::Warn));
    gate.register(SecretStrengthCheck::new("api_secret", config.api_secret.clone()));

    let mut container = Container::new(ContainerOptions {
        shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        ..Default::default()
    });
    container.set_security_gate(gate);
    container.set_config_snapshot(
        serde_json::to_value(&config).expect("config serializes to JSON"),
    );
    container.add_health_checker(AlwaysHealthy);
    container.add_shutdown_hook(|_deadline| async move {
        tracing::info!("Cleaning up resources");
        Ok(())
    });

    // Certificate manager when TLS material is configured.
    let cert_manager = if config.cert_file.is_empty() {
        None
    } else {
        let cert_config = keel_cert::Config {
            cert_file: config.cert_file.clone(),
            key_file: config.key_file.clone(),
            ..Default::default()
        };
        Some(Arc::new(keel_cert::Manager::new(cert_config, None)))
    };

    // Monitor service: health, metrics, profiling.
    let metrics_handle = keel_server::metrics::setup_metrics_recorder();
    let health = container.health_handler();
    container.register(MonitorService::new(
        &config.monitor_address,
        health,
        metrics_handle,
    ));

    // Main API service.
    let mut router = api_router();
    if let Some(manager) = &cert_manager {
        router = manager.http_challenge_router(router);
    }
    let mut api = HttpService::new("main-api", &config.address, router).with_observability(
        ObservabilityConfig {
            enabled: true,
            service_name: "keeld".into(),
            ..Default::default()
        },
    );
    if let Some(manager) = cert_manager {
        api = api.with_tls(manager);
        if config.enable_http3 {
            api = api.with_http3();
        }
    }
    container.register(api);

    if let Err(err) = container.run().await {
        tracing::error!(error = %err, "keeld exited with an error");
        std::process::exit(1);
    }
}
