use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel::{Container, ContainerError, ContainerOptions, FatalReporter, Service};
use keel_security::{CheckResult, Gate, SecurityCheck, Severity};
use tokio_util::sync::CancellationToken;

fn test_options() -> ContainerOptions {
    ContainerOptions {
        shutdown_timeout: Duration::from_secs(5),
        rollback_timeout: Duration::from_secs(2),
        trap_signals: false,
    }
}

/// Scriptable service recording its lifecycle into a shared event log.
struct MockService {
    name: &'static str,
    start_error: Option<&'static str>,
    fatal_after: Option<(Duration, &'static str)>,
    events: Arc<Mutex<Vec<String>>>,
    reporter: Option<FatalReporter>,
}

impl MockService {
    fn new(name: &'static str, events: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name,
            start_error: None,
            fatal_after: None,
            events,
            reporter: None,
        }
    }

    fn failing_to_start(mut self, message: &'static str) -> Self {
        self.start_error = Some(message);
        self
    }

    fn reporting_fatal(mut self, after: Duration, message: &'static str) -> Self {
        self.fatal_after = Some((after, message));
        self
    }
}

#[async_trait::async_trait]
impl Service for MockService {
    fn name(&self) -> &str {
        self.name
    }

    async fn start(&mut self, _shutdown: CancellationToken) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("start:{}", self.name));
        if let Some(message) = self.start_error {
            return Err(anyhow::anyhow!(message));
        }
        if let Some((after, message)) = self.fatal_after {
            let reporter = self.reporter.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                if let Some(reporter) = reporter {
                    reporter.report(anyhow::anyhow!(message));
                }
            });
        }
        Ok(())
    }

    async fn stop(&mut self, _deadline: CancellationToken) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("stop:{}", self.name));
        Ok(())
    }

    fn set_fatal_reporter(&mut self, reporter: FatalReporter) {
        self.reporter = Some(reporter);
    }
}

#[tokio::test]
async fn rollback_on_start_failure_stops_started_prefix_once() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut container = Container::new(test_options());
    container.register(MockService::new("svc-a", events.clone()));
    container.register(MockService::new("svc-b", events.clone()).failing_to_start("port binding failed"));

    let err = container.run().await.unwrap_err();
    assert!(err.to_string().contains("port binding failed"), "err: {err}");
    assert!(matches!(err, ContainerError::ServiceStart { .. }));

    let events = events.lock().unwrap();
    let stops_a = events.iter().filter(|e| *e == "stop:svc-a").count();
    let stops_b = events.iter().filter(|e| *e == "stop:svc-b").count();
    assert_eq!(stops_a, 1, "rolled-back service must be stopped exactly once");
    assert_eq!(stops_b, 0, "failed service must not be stopped");
}

#[tokio::test]
async fn clean_shutdown_stops_in_reverse_order_then_runs_hooks_once() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut container = Container::new(test_options());
    container.register(MockService::new("svc-a", events.clone()));
    container.register(MockService::new("svc-b", events.clone()));

    {
        let events = events.clone();
        container.add_shutdown_hook(move |_deadline| async move {
            events.lock().unwrap().push("hook".to_string());
            Ok(())
        });
    }

    let handle = container.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.trigger();
    });

    container.run().await.unwrap();

    let events = events.lock().unwrap();
    let observed: Vec<&str> = events.iter().map(String::as_str).collect();
    assert_eq!(
        observed,
        [
            "start:svc-a",
            "start:svc-b",
            "stop:svc-b",
            "stop:svc-a",
            "hook"
        ]
    );
}

#[tokio::test]
async fn no_stop_is_invoked_while_startup_succeeds() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut container = Container::new(test_options());
    container.register(MockService::new("svc-a", events.clone()));
    container.register(MockService::new("svc-b", events.clone()));

    let handle = container.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.trigger();
    });
    container.run().await.unwrap();

    let events = events.lock().unwrap();
    // Both starts strictly precede any stop.
    let first_stop = events.iter().position(|e| e.starts_with("stop")).unwrap();
    assert_eq!(first_stop, 2);
}

#[tokio::test]
async fn first_fatal_report_wins_and_secondary_is_logged() {
    let (capture, _guard) = log_capture::install();

    let events = Arc::new(Mutex::new(Vec::new()));
    let mut container = Container::new(test_options());
    container.register(
        MockService::new("svc-a", events.clone())
            .reporting_fatal(Duration::from_millis(10), "error from A"),
    );
    container.register(
        MockService::new("svc-b", events.clone())
            .reporting_fatal(Duration::from_millis(60), "error from B"),
    );

    let err = container.run().await.unwrap_err();
    assert_eq!(err.to_string(), "error from A");

    // Give svc-b's late reporter time to hit the in-shutdown path.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let logs = capture.contents();
    assert!(
        logs.contains("Secondary fatal error occurred during shutdown"),
        "logs: {logs}"
    );
    assert!(logs.contains("error from B"), "logs: {logs}");
}

#[tokio::test]
async fn reporters_never_block() {
    let container = Container::new(test_options());
    let reporter = container.fatal_reporter();
    // Capacity is one; every further report must return immediately.
    for i in 0..16 {
        reporter.report(anyhow::anyhow!("report {i}"));
    }
}

struct FatalCheck;

#[async_trait::async_trait]
impl SecurityCheck for FatalCheck {
    fn name(&self) -> String {
        "fatal-check".to_string()
    }

    async fn check(&self) -> CheckResult {
        CheckResult::fail(self.name(), Severity::Fatal, "unsafe config")
    }
}

#[tokio::test]
async fn security_gate_fatal_aborts_before_any_start() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut gate = Gate::new();
    gate.register(FatalCheck);

    let mut container = Container::new(test_options());
    container.set_security_gate(gate);
    container.register(MockService::new("svc-a", events.clone()));

    let err = container.run().await.unwrap_err();
    assert!(err.to_string().contains("security check failed"), "err: {err}");
    assert!(events.lock().unwrap().is_empty(), "nothing may start after a gate failure");
}

#[tokio::test]
async fn health_handler_aggregates_registered_checkers() {
    struct Failing;

    #[async_trait::async_trait]
    impl keel_health::HealthChecker for Failing {
        fn name(&self) -> &str {
            "redis"
        }

        async fn check(&self) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    let mut container = Container::new(test_options());
    container.add_health_checker(Failing);
    let handler = container.health_handler();

    match handler.check_all().await {
        keel_health::HealthOutcome::Unhealthy { detail } => {
            assert!(detail.contains("redis"));
            assert!(detail.contains("connection refused"));
        }
        other => panic!("expected unhealthy, got {other:?}"),
    }
}

/// Minimal log capture for asserting on emitted diagnostics, in the
/// spirit of piping a JSON logger into a buffer.
mod log_capture {
    use std::io;
    use std::sync::{Arc, Mutex};

    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    pub struct Capture {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl Capture {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    pub fn install() -> (Capture, tracing::subscriber::DefaultGuard) {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }
}
