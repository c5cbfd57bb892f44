use tracing::info;

/// Resolves when the process receives an interrupt or terminate signal.
#[cfg(unix)]
pub(crate) async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::SignalKind;

    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
pub(crate) async fn wait_for_shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received interrupt");
    }
}
