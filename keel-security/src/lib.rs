//! Pre-flight security self-checks.
//!
//! A [`Gate`] runs a set of registered [`SecurityCheck`]s concurrently
//! before the container binds any port. Failures are classified by
//! [`Severity`]; a single `Fatal` aborts startup, `Warn` and `Info` are
//! logged and tolerated. The whole gate is bounded by a global deadline so
//! a wedged check cannot stall boot forever.

pub mod checks;

use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Upper bound on the whole gate run, shared by every check.
pub const GATE_DEADLINE: Duration = Duration::from_secs(5);

/// How bad a failed check is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    #[default]
    Info,
    Warn,
    /// Blocks startup.
    Fatal,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warn => write!(f, "WARN"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Outcome of one check.
#[derive(Debug)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub severity: Severity,
    pub message: String,
    pub error: Option<anyhow::Error>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            severity: Severity::Info,
            message: String::new(),
            error: None,
        }
    }

    pub fn skip(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            severity: Severity::Info,
            message: message.into(),
            error: None,
        }
    }

    pub fn fail(
        name: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            passed: false,
            severity,
            message: message.into(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: anyhow::Error) -> Self {
        self.error = Some(error);
        self
    }
}

/// A single pre-flight check. Implementations should be side-effect free
/// and finish well inside [`GATE_DEADLINE`].
#[async_trait::async_trait]
pub trait SecurityCheck: Send + Sync + 'static {
    fn name(&self) -> String;
    async fn check(&self) -> CheckResult;
}

/// Error returned when the gate blocks startup.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("security check failed: {fatal} fatal errors found")]
    Fatal { fatal: usize },
}

/// Runs registered checks concurrently and aggregates severities.
#[derive(Default)]
pub struct Gate {
    checks: Vec<std::sync::Arc<dyn SecurityCheck>>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a check. Order is irrelevant; all checks run concurrently.
    pub fn register(&mut self, check: impl SecurityCheck) {
        self.checks.push(std::sync::Arc::new(check));
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every registered check.
    ///
    /// Panicking checks are isolated by the task boundary and counted as
    /// Fatal. Checks still pending at [`GATE_DEADLINE`] are aborted and
    /// counted as Fatal, since they could not demonstrate a safe
    /// configuration. Every result is logged; passes at debug level.
    pub async fn run(&self) -> Result<(), GateError> {
        info!(checks = self.checks.len(), "Running security self-checks");

        let mut set: JoinSet<CheckResult> = JoinSet::new();
        for check in &self.checks {
            let check = check.clone();
            set.spawn(async move { check.check().await });
        }

        let mut fatal = 0usize;
        let mut warn_count = 0usize;

        let drain = async {
            while let Some(joined) = set.join_next().await {
                let result = match joined {
                    Ok(result) => result,
                    Err(err) if err.is_panic() => {
                        error!(error = %err, "Security checker panicked");
                        fatal += 1;
                        continue;
                    }
                    Err(err) => {
                        error!(error = %err, "Security checker task failed");
                        fatal += 1;
                        continue;
                    }
                };

                if result.passed {
                    debug!(check = %result.name, "Security check passed");
                    continue;
                }

                let error = result
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                match result.severity {
                    Severity::Info => {
                        info!(check = %result.name, error = %error, "Check failed: {}", result.message)
                    }
                    Severity::Warn => {
                        warn_count += 1;
                        warn!(check = %result.name, error = %error, "Check failed: {}", result.message)
                    }
                    Severity::Fatal => {
                        fatal += 1;
                        error!(check = %result.name, error = %error, "Check failed: {}", result.message)
                    }
                }
            }
        };

        if tokio::time::timeout(GATE_DEADLINE, drain).await.is_err() {
            let remaining = set.len();
            set.abort_all();
            error!(
                remaining = remaining,
                "Security checks exceeded the gate deadline"
            );
            fatal += remaining;
        }

        info!(fatal = fatal, warn = warn_count, "Security checks completed");

        if fatal > 0 {
            return Err(GateError::Fatal { fatal });
        }
        Ok(())
    }
}
