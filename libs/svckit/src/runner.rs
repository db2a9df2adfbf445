//! Svckit runtime runner.
//!
//! Phase order: **discover → build → listen → wait → drain**.
//! Shutdown can be driven by OS signals, an external `CancellationToken`,
//! or an arbitrary future.

use std::future::Future;
use std::pin::Pin;

use svckit_bootstrap::AppConfig;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::Orchestrator;
use crate::registry::Registry;

/// How the runtime should decide when to stop.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, we initiate shutdown.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

pub struct RunOptions {
    pub config: AppConfig,
    pub shutdown: ShutdownOptions,
}

/// Build the orchestrator from the compiled registry, serve every module and
/// return once all services have drained after shutdown.
pub async fn run(opts: RunOptions) -> anyhow::Result<()> {
    let cancel = match &opts.shutdown {
        ShutdownOptions::Token(t) => t.clone(),
        _ => CancellationToken::new(),
    };

    match opts.shutdown {
        ShutdownOptions::Signals => {
            let c = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = svckit_bootstrap::cancel_on_shutdown(c.clone()).await {
                    tracing::warn!(error = %e, "shutdown: signal waiter failed; falling back to ctrl_c()");
                    let _ = tokio::signal::ctrl_c().await;
                    c.cancel();
                }
            });
        }
        ShutdownOptions::Future(waiter) => {
            let c = cancel.clone();
            tokio::spawn(async move {
                waiter.await;
                tracing::info!("shutdown: external future completed");
                c.cancel();
            });
        }
        ShutdownOptions::Token(_) => {
            tracing::info!("shutdown: external token will control lifecycle");
        }
    }

    let registry = Registry::discover()?;
    tracing::info!(?registry, "registry discovered");

    let orchestrator = Orchestrator::build(opts.config, &registry).await?;
    let running = orchestrator.listen(cancel.clone()).await?;

    cancel.cancelled().await;
    tracing::info!(services = running.len(), "draining services");

    for service in running {
        match service.handle.await {
            Ok(Ok(())) => tracing::debug!(module = %service.module, "service stopped"),
            Ok(Err(e)) => tracing::warn!(module = %service.module, error = %e, "service stopped with an error"),
            Err(e) => tracing::warn!(module = %service.module, error = %e, "service task failed"),
        }
    }
    Ok(())
}
