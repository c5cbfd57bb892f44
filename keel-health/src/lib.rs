//! Aggregated health checking for container-managed services.
//!
//! A process is only fit to receive traffic if every dependency it relies
//! on (database, cache, downstream API, ...) answers a probe in time.
//! [`HealthHandler`] fans all registered checkers out concurrently and
//! combines their outcomes:
//!   - every checker passes within its per-check budget: healthy,
//!   - any checker fails or misses its deadline: unhealthy, reporting
//!     the first failure observed.
//!
//! One slow checker cannot starve the rest: each check runs under its own
//! deadline, and the aggregate is additionally capped by an overall
//! deadline. A check whose future is still pending at its deadline is
//! dropped, which cancels it.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::task::JoinSet;
use tracing::warn;

/// Total budget for one health evaluation.
pub const OVERALL_DEADLINE: Duration = Duration::from_secs(3);
/// Budget for a single checker within the overall evaluation.
pub const PER_CHECK_DEADLINE: Duration = Duration::from_secs(2);

/// A single probeable dependency. Implementations must be cheap to call
/// repeatedly and give up promptly when their future is dropped.
#[async_trait::async_trait]
pub trait HealthChecker: Send + Sync {
    /// Stable name used in failure messages, e.g. `db` or `redis`.
    fn name(&self) -> &str;

    /// Probe the dependency. `Ok(())` means healthy.
    async fn check(&self) -> anyhow::Result<()>;
}

/// Outcome of one aggregated evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    /// First failure observed, formatted as `[<checker>] <error>`.
    Unhealthy { detail: String },
}

impl IntoResponse for HealthOutcome {
    /// `200 OK` with body `OK`, or `503` with the failure detail.
    fn into_response(self) -> Response {
        match self {
            HealthOutcome::Healthy => (StatusCode::OK, "OK".to_string()),
            HealthOutcome::Unhealthy { detail } => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Health check failed: {detail}"),
            ),
        }
        .into_response()
    }
}

/// Cloneable aggregator over a fixed set of checkers. Usable directly as
/// the body of an axum handler (see the monitor service).
#[derive(Clone)]
pub struct HealthHandler {
    checkers: Arc<Vec<Arc<dyn HealthChecker>>>,
}

impl HealthHandler {
    pub fn new(checkers: Vec<Arc<dyn HealthChecker>>) -> Self {
        Self {
            checkers: Arc::new(checkers),
        }
    }

    /// Run every checker concurrently and combine the outcomes.
    ///
    /// Blocks the caller for at most [`OVERALL_DEADLINE`]. The first
    /// failure wins; remaining checks are aborted once the aggregate
    /// outcome is known.
    pub async fn check_all(&self) -> HealthOutcome {
        if self.checkers.is_empty() {
            return HealthOutcome::Healthy;
        }

        let mut set = JoinSet::new();
        for checker in self.checkers.iter() {
            let checker = checker.clone();
            set.spawn(async move {
                let name = checker.name().to_string();
                match tokio::time::timeout(PER_CHECK_DEADLINE, checker.check()).await {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(format!("[{name}] {err}")),
                    Err(_) => Some(format!("[{name}] deadline exceeded")),
                }
            });
        }

        let drain = async {
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(None) => continue,
                    Ok(Some(detail)) => return Some(detail),
                    Err(err) => return Some(format!("health checker panicked: {err}")),
                }
            }
            None
        };

        let outcome = match tokio::time::timeout(OVERALL_DEADLINE, drain).await {
            Ok(None) => HealthOutcome::Healthy,
            Ok(Some(detail)) => HealthOutcome::Unhealthy { detail },
            Err(_) => HealthOutcome::Unhealthy {
                detail: "deadline exceeded".to_string(),
            },
        };

        if let HealthOutcome::Unhealthy { detail } = &outcome {
            warn!(detail = %detail, "Health check failed");
        }
        set.abort_all();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::time::Instant;

    struct StaticChecker {
        name: &'static str,
        error: Option<&'static str>,
        delay: Duration,
    }

    impl StaticChecker {
        fn ok(name: &'static str) -> Arc<dyn HealthChecker> {
            Arc::new(Self {
                name,
                error: None,
                delay: Duration::ZERO,
            })
        }

        fn failing(name: &'static str, error: &'static str) -> Arc<dyn HealthChecker> {
            Arc::new(Self {
                name,
                error: Some(error),
                delay: Duration::ZERO,
            })
        }

        fn slow(name: &'static str, delay: Duration) -> Arc<dyn HealthChecker> {
            Arc::new(Self {
                name,
                error: None,
                delay,
            })
        }
    }

    #[async_trait::async_trait]
    impl HealthChecker for StaticChecker {
        fn name(&self) -> &str {
            self.name
        }

        async fn check(&self) -> anyhow::Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.error {
                None => Ok(()),
                Some(msg) => Err(anyhow::anyhow!(msg)),
            }
        }
    }

    #[tokio::test]
    async fn empty_registry_is_healthy() {
        let handler = HealthHandler::new(vec![]);
        assert_eq!(handler.check_all().await, HealthOutcome::Healthy);
    }

    #[tokio::test]
    async fn all_checkers_passing_yields_ok() {
        let handler = HealthHandler::new(vec![
            StaticChecker::ok("db"),
            StaticChecker::ok("redis"),
        ]);
        let response = handler.check_all().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn single_failure_names_the_checker() {
        let handler = HealthHandler::new(vec![
            StaticChecker::ok("db"),
            StaticChecker::failing("redis", "connection refused"),
        ]);
        match handler.check_all().await {
            HealthOutcome::Unhealthy { detail } => {
                assert!(detail.contains("redis"), "detail: {detail}");
                assert!(detail.contains("connection refused"), "detail: {detail}");
            }
            other => panic!("expected unhealthy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_response_is_503_with_detail() {
        let handler = HealthHandler::new(vec![StaticChecker::failing(
            "redis",
            "connection refused",
        )]);
        let response = handler.check_all().await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn slow_checker_hits_per_check_deadline() {
        let handler = HealthHandler::new(vec![StaticChecker::slow(
            "slow-api",
            Duration::from_secs(5),
        )]);
        let started = Instant::now();
        match handler.check_all().await {
            HealthOutcome::Unhealthy { detail } => {
                assert!(detail.contains("deadline exceeded"), "detail: {detail}");
            }
            other => panic!("expected unhealthy, got {other:?}"),
        }
        // Per-check deadline is 2s; well inside the 3.5s bound either way.
        assert!(started.elapsed() < Duration::from_millis(3500));
    }

    #[tokio::test]
    async fn slow_checker_does_not_mask_fast_failure() {
        let handler = HealthHandler::new(vec![
            StaticChecker::slow("slow-api", Duration::from_secs(5)),
            StaticChecker::failing("db", "no route to host"),
        ]);
        let started = Instant::now();
        match handler.check_all().await {
            HealthOutcome::Unhealthy { detail } => {
                assert!(detail.contains("db"), "detail: {detail}");
            }
            other => panic!("expected unhealthy, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
