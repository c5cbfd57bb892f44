use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keel_health::{HealthChecker, HealthHandler};
use keel_security::{Gate, GateError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::service::{FatalReporter, Service};
use crate::{signals, snapshot};

type ShutdownHook =
    Box<dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

/// Extra slack given to a stop call after its deadline token fires, so a
/// service observing the cancellation still gets to return an error
/// instead of being abandoned mid-await.
const STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct ContainerOptions {
    /// Budget for the whole teardown: reverse-order stops plus hooks.
    pub shutdown_timeout: Duration,
    /// Budget for rolling back already-started services when a later
    /// service fails to start.
    pub rollback_timeout: Duration,
    /// Install SIGINT/SIGTERM handlers (off in tests).
    pub trap_signals: bool,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            rollback_timeout: Duration::from_secs(5),
            trap_signals: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// The security gate flagged at least one fatal finding; nothing was
    /// started.
    #[error(transparent)]
    SecurityCheck(#[from] GateError),

    /// A service failed to start; previously started services were
    /// rolled back.
    #[error("service {name} failed to start: {source}")]
    ServiceStart {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// A running service reported a fatal error; teardown completed.
    #[error(transparent)]
    Fatal(anyhow::Error),
}

/// Cloneable handle that requests a graceful shutdown, equivalent to
/// receiving a terminate signal.
#[derive(Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.token.cancel();
    }
}

/// The service container. Register services, hooks, and health checkers
/// up front, then hand control to [`Container::run`].
pub struct Container {
    options: ContainerOptions,
    services: Vec<Box<dyn Service>>,
    hooks: Vec<ShutdownHook>,
    checkers: Vec<Arc<dyn HealthChecker>>,
    gate: Option<Gate>,
    config: Option<serde_json::Value>,
    fatal_tx: mpsc::Sender<anyhow::Error>,
    fatal_rx: mpsc::Receiver<anyhow::Error>,
    in_shutdown: Arc<AtomicBool>,
    trigger: CancellationToken,
}

impl Default for Container {
    fn default() -> Self {
        Self::new(ContainerOptions::default())
    }
}

impl Container {
    pub fn new(options: ContainerOptions) -> Self {
        // Capacity 1: the first fatal report is the shutdown cause, every
        // later one degrades to a log line.
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        Self {
            options,
            services: Vec::new(),
            hooks: Vec::new(),
            checkers: Vec::new(),
            gate: None,
            config: None,
            fatal_tx,
            fatal_rx,
            in_shutdown: Arc::new(AtomicBool::new(false)),
            trigger: CancellationToken::new(),
        }
    }

    /// Attach a security gate, run once before any service binds a port.
    pub fn set_security_gate(&mut self, gate: Gate) {
        self.gate = Some(gate);
    }

    /// Attach a configuration snapshot, logged (redacted) at startup.
    pub fn set_config_snapshot(&mut self, config: serde_json::Value) {
        self.config = Some(config);
    }

    /// Register a service. Registration order determines start order and
    /// (reversed) stop order. The service's fatal reporter is wired here.
    pub fn register(&mut self, mut service: impl Service) {
        service.set_fatal_reporter(self.fatal_reporter());
        self.services.push(Box::new(service));
    }

    /// Append a shutdown hook, invoked after every service has stopped.
    pub fn add_shutdown_hook<F, Fut>(&mut self, hook: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.push(Box::new(move |token| Box::pin(hook(token))));
    }

    pub fn add_health_checker(&mut self, checker: impl HealthChecker + 'static) {
        self.checkers.push(Arc::new(checker));
    }

    /// Aggregated health evaluator over the registered checkers.
    pub fn health_handler(&self) -> HealthHandler {
        HealthHandler::new(self.checkers.clone())
    }

    /// Reporter handle for components managed outside the service list.
    pub fn fatal_reporter(&self) -> FatalReporter {
        FatalReporter::new(self.fatal_tx.clone(), self.in_shutdown.clone())
    }

    /// Handle for requesting a graceful shutdown programmatically.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.trigger.clone(),
        }
    }

    /// Run the container until a signal arrives or a service reports a
    /// fatal error. Returns `Ok(())` on signal-driven shutdown, the
    /// startup error when a service failed to start (after rollback), or
    /// the fatal error that caused shutdown.
    pub async fn run(mut self) -> Result<(), ContainerError> {
        if let Some(config) = &self.config {
            snapshot::log_config_snapshot(config);
        }

        if let Some(gate) = &self.gate {
            if let Err(err) = gate.run().await {
                error!(error = %err, "Security check failed");
                return Err(err.into());
            }
        }

        let root = CancellationToken::new();

        // Start in registration order. The first failure rolls the
        // started prefix back in reverse and aborts the run.
        let mut started = 0usize;
        let mut start_failure: Option<(String, anyhow::Error)> = None;
        for service in self.services.iter_mut() {
            match service.start(root.child_token()).await {
                Ok(()) => started += 1,
                Err(err) => {
                    error!(
                        error = %err,
                        service = %service.name(),
                        "Service failed to start, rolling back"
                    );
                    start_failure = Some((service.name().to_string(), err));
                    break;
                }
            }
        }

        if let Some((name, source)) = start_failure {
            root.cancel();
            let deadline = arm_deadline(self.options.rollback_timeout);
            let rollback_budget = self.options.rollback_timeout;
            for service in self.services[..started].iter_mut().rev() {
                if let Err(err) =
                    bounded_stop(service.as_mut(), rollback_budget, deadline.clone()).await
                {
                    error!(error = %err, service = %service.name(), "Rollback stop error");
                }
            }
            return Err(ContainerError::ServiceStart { name, source });
        }

        // Block on the multiplexed termination sources: signal, requested
        // shutdown, or the first fatal report.
        let mut fatal: Option<anyhow::Error> = None;
        let trigger = self.trigger.clone();
        tokio::select! {
            _ = signals::wait_for_shutdown_signal(), if self.options.trap_signals => {
                info!(reason = "signal", "Container shutting down");
            }
            _ = trigger.cancelled() => {
                info!(reason = "shutdown requested", "Container shutting down");
            }
            received = self.fatal_rx.recv() => {
                if let Some(err) = received {
                    error!(error = %err, reason = "fatal service error", "Container shutting down");
                    fatal = Some(err);
                }
            }
        }

        self.in_shutdown.store(true, Ordering::SeqCst);
        root.cancel();

        // Teardown: reverse order, shared deadline, errors logged but
        // never allowed to abort the loop.
        let deadline = arm_deadline(self.options.shutdown_timeout);
        let deadline_at = tokio::time::Instant::now() + self.options.shutdown_timeout;
        for service in self.services.iter_mut().rev() {
            info!(service = %service.name(), "Stopping service");
            let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
            if let Err(err) = bounded_stop(service.as_mut(), remaining, deadline.clone()).await {
                error!(error = %err, service = %service.name(), "Service stop error");
            }
        }

        for hook in self.hooks.drain(..) {
            let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining + STOP_GRACE, hook(deadline.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = %err, "Shutdown hook error"),
                Err(_) => error!("Shutdown hook timed out"),
            }
        }

        info!("Container stopped");
        match fatal {
            Some(err) => Err(ContainerError::Fatal(err)),
            None => Ok(()),
        }
    }
}

/// A token that cancels itself after `after`, handed to stop calls as
/// their deadline signal.
fn arm_deadline(after: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        trigger.cancel();
    });
    token
}

async fn bounded_stop(
    service: &mut dyn Service,
    remaining: Duration,
    deadline: CancellationToken,
) -> anyhow::Result<()> {
    match tokio::time::timeout(remaining + STOP_GRACE, service.stop(deadline)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "stop did not complete within {remaining:?}"
        )),
    }
}
