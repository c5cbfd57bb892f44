use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::error;

use crate::FatalReporter;

/// Spawn a service-owned task behind a panic recovery frame.
///
/// Every task spawned by a managed service must use this instead of a
/// bare `tokio::spawn`: a panic inside the future is caught at the task
/// boundary, logged with a captured stack, and converted into a fatal
/// report so the container can begin shutdown. No panic crosses a task
/// boundary unobserved.
pub fn spawn_guarded<F>(task: &str, reporter: Option<FatalReporter>, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = task.to_string();
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(future).catch_unwind().await {
            let message = panic_message(panic.as_ref());
            let stack = Backtrace::force_capture();
            error!(
                task = %task,
                panic = %message,
                stack = %stack,
                "Service task crashed with panic"
            );
            if let Some(reporter) = reporter {
                reporter.report(anyhow::anyhow!("service panic: {message}"));
            }
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
