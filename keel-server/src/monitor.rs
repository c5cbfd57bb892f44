//! Monitor service: `/healthz`, `/metrics`, `/debug/pprof`.

use std::convert::Infallible;

use axum::extract::Request;
use axum::response::IntoResponse;
use axum::routing::{get, Route};
use axum::Router;
use keel_health::HealthHandler;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::{Layer, Service};
use tracing::error;

use crate::pprof_routes;
use crate::HttpService;

/// Routes exposed by the monitor endpoint: aggregated health, Prometheus
/// text exposition, and CPU profiling.
pub fn monitor_router(health: HealthHandler, metrics: PrometheusHandle) -> Router {
    Router::new()
        .route(
            "/healthz",
            get(move || {
                let health = health.clone();
                async move { health.check_all().await }
            }),
        )
        .route(
            "/metrics",
            get(move || std::future::ready(metrics.render().into_response())),
        )
        .route("/debug/pprof", get(pprof_routes::handle_index))
        .route("/debug/pprof/", get(pprof_routes::handle_index))
        .route("/debug/pprof/profile", get(pprof_routes::handle_profile))
        .route(
            "/debug/pprof/flamegraph",
            get(pprof_routes::handle_flamegraph),
        )
}

/// Builders for the monitor [`HttpService`].
pub struct MonitorService;

impl MonitorService {
    /// Unprotected monitor service. Loud on purpose: profiling and
    /// metrics endpoints leak operational detail and must not face the
    /// public internet without a protective middleware.
    pub fn new(addr: &str, health: HealthHandler, metrics: PrometheusHandle) -> HttpService {
        error!("Monitor service at {addr} is unprotected!");
        error!("Endpoints /debug/pprof and /metrics are exposed to anyone who can reach {addr}.");
        error!("Add an authentication layer via MonitorService::protected().");
        HttpService::new("monitor", addr, monitor_router(health, metrics))
    }

    /// Monitor service with a protective layer (authentication, IP
    /// filtering) applied around every route.
    pub fn protected<L>(
        addr: &str,
        health: HealthHandler,
        metrics: PrometheusHandle,
        protection: L,
    ) -> HttpService
    where
        L: Layer<Route> + Clone + Send + Sync + 'static,
        L::Service: Service<Request> + Clone + Send + 'static,
        <L::Service as Service<Request>>::Response: IntoResponse + 'static,
        <L::Service as Service<Request>>::Error: Into<Infallible> + 'static,
        <L::Service as Service<Request>>::Future: Send + 'static,
    {
        let router = monitor_router(health, metrics).layer(protection);
        HttpService::new("monitor", addr, router)
    }
}
