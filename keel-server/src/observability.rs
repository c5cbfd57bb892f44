use std::any::Any;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Router;
use serde::Deserialize;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, Level};

#[derive(Clone, Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct TraceConfig {
    #[serde(default = "default_sample_ratio")]
    pub sample_ratio: f64,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            sample_ratio: default_sample_ratio(),
        }
    }
}

fn default_sample_ratio() -> f64 {
    1.0
}

#[derive(Clone, Debug, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

/// Request-path observability for an HTTP service. When `enabled`, the
/// handler is wrapped with tracing, request metrics, access logging, and
/// panic recovery; when disabled, only panic recovery is applied.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Apply the configured request-handler wrappers. Layer order, outermost
/// to innermost: tracing/access-log, metrics, panic recovery, handler.
pub(crate) fn wrap(cfg: &ObservabilityConfig, router: Router) -> Router {
    // Panic recovery is always present; a handler panic becomes a 500,
    // never a dead connection.
    let router = router.layer(CatchPanicLayer::custom(recover_panic));

    if !cfg.enabled {
        return router;
    }

    let router = if cfg.metrics.enabled {
        router.layer(axum::middleware::from_fn(crate::metrics::track_requests))
    } else {
        router
    };

    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

fn recover_panic(panic: Box<dyn Any + Send + 'static>) -> axum::response::Response {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    error!(panic = %message, "Request handler panicked");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tower::ServiceExt;

    async fn boom() -> &'static str {
        panic!("handler exploded")
    }

    #[tokio::test]
    async fn panics_become_500_when_observability_disabled() {
        let app = wrap(
            &ObservabilityConfig::default(),
            Router::new().route("/boom", get(boom)),
        );
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/boom")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn panics_become_500_when_observability_enabled() {
        let cfg = ObservabilityConfig {
            enabled: true,
            service_name: "test".into(),
            ..Default::default()
        };
        let app = wrap(&cfg, Router::new().route("/boom", get(boom)));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/boom")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
