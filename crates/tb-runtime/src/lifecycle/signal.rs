use tokio_util::sync::CancellationToken;

/// Wait for Ctrl-C (SIGINT) or SIGTERM and cancel the engine. Returns early
/// if the engine cancels itself.
pub async fn wait_for_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        signal = shutdown_signal() => {
            tb_info!(sys, signal, "received signal, initiating graceful shutdown");
        }
    }
    cancel.cancel();
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        },
        Err(e) => {
            tb_warn!(sys, error = %e, "SIGTERM handler unavailable, listening for SIGINT only");
            ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tb_warn!(sys, error = %e, "Ctrl-C handler unavailable");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}
