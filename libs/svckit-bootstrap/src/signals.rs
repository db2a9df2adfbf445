use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Which signal ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

/// Wait for termination signals (Ctrl+C, SIGTERM).
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .inspect_err(|e| tracing::error!(%e, "Failed to install SIGTERM handler"))?;

    #[cfg(unix)]
    let received = tokio::select! {
        res = signal::ctrl_c() => res.map(|_| ShutdownSignal::Interrupt)?,
        _ = terminate.recv() => ShutdownSignal::Terminate,
    };

    #[cfg(not(unix))]
    let received = signal::ctrl_c().await.map(|_| ShutdownSignal::Interrupt)?;

    tracing::info!(signal = ?received, "Shutdown signal received, initiating graceful shutdown");
    Ok(received)
}

/// Cancel `token` on the first termination signal, or return early if it is
/// cancelled by someone else.
pub async fn cancel_on_shutdown(token: CancellationToken) -> Result<()> {
    tokio::select! {
        res = wait_for_shutdown() => {
            token.cancel();
            res.map(|_| ())
        }
        _ = token.cancelled() => Ok(()),
    }
}
