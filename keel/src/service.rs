use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// A component whose lifecycle is managed by the [`Container`](crate::Container):
/// an HTTP server, a gRPC server, a task runner, a consumer loop.
#[async_trait::async_trait]
pub trait Service: Send + 'static {
    /// Stable name used in logs.
    fn name(&self) -> &str;

    /// Start the service. Non-blocking by contract: bind resources, spawn
    /// the serve loops, return. Immediate failures (a port already in
    /// use) are returned; later failures go through the
    /// [`FatalReporter`]. `shutdown` is cancelled when the container
    /// begins teardown; internal tasks should select on it.
    async fn start(&mut self, shutdown: CancellationToken) -> anyhow::Result<()>;

    /// Stop the service. Blocks until quiesced or until `deadline` is
    /// cancelled; implementations must not outlive the deadline.
    async fn stop(&mut self, deadline: CancellationToken) -> anyhow::Result<()>;

    /// Called at registration for services that can discover a fatal
    /// error after `start` returned. Default: the service never reports.
    fn set_fatal_reporter(&mut self, reporter: FatalReporter) {
        let _ = reporter;
    }
}

/// Channel by which a running service signals the container to begin
/// shutdown. Cloneable and callable from any task; never blocks.
///
/// The reporter captures just enough container state (the capacity-1
/// channel and the in-shutdown flag) to guarantee that at most one cause
/// is recorded, that no reporter ever blocks, and that failures during
/// shutdown remain observable in the logs.
#[derive(Clone)]
pub struct FatalReporter {
    tx: mpsc::Sender<anyhow::Error>,
    in_shutdown: Arc<AtomicBool>,
}

impl FatalReporter {
    pub(crate) fn new(tx: mpsc::Sender<anyhow::Error>, in_shutdown: Arc<AtomicBool>) -> Self {
        Self { tx, in_shutdown }
    }

    /// Report a fatal error. The first report per container run wins and
    /// becomes the `run` return value; every other report is logged.
    pub fn report(&self, err: anyhow::Error) {
        if self.in_shutdown.load(Ordering::SeqCst) {
            error!(error = %err, "Secondary fatal error occurred during shutdown");
            return;
        }
        if let Err(rejected) = self.tx.try_send(err) {
            let err = rejected.into_inner();
            error!(error = %err, "Secondary fatal error occurred during shutdown");
        }
    }
}
