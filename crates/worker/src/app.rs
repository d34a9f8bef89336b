//! Wires configuration into a running worker.

use std::sync::Arc;

use anyhow::Context;
use meteomap_core::JobDecomposer;
use meteomap_events::{AmqpPublisherFactory, ConnectionManager};
use meteomap_pipeline::{
    CommandRenderer, DeletionHandler, Orchestrator, Renderer, WarmupCoordinator, WorkerPool,
};
use meteomap_storage::S3ObjectStore;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;

/// Run the worker until a shutdown signal or a fatal broker error.
///
/// Returns `Ok(())` only after a requested shutdown has drained every
/// in-flight unit. A consumer the broker closes on its own is an error so
/// the supervisor restarts the process.
pub async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    // --- Object storage ---
    let store = Arc::new(
        S3ObjectStore::connect(&config.storage)
            .await
            .context("Object store unavailable")?,
    );
    tracing::info!(bucket = %store.bucket(), "Object store ready");

    // --- Renderer and pool ---
    let renderer: Arc<dyn Renderer> = Arc::new(
        CommandRenderer::from_command_line(&config.render_command)
            .context("RENDER_COMMAND is empty")?
            .with_timeout(config.render_timeout),
    );
    let pool = WorkerPool::new(
        Arc::clone(&renderer),
        store.clone(),
        config.worker_threads,
        &config.render_work_dir,
    );

    // --- Broker ---
    let manager = Arc::new(ConnectionManager::new(config.broker.clone()));
    let publishers = Arc::new(AmqpPublisherFactory::new(Arc::clone(&manager)));

    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator.clone(),
        JobDecomposer::new(config.parameters.clone(), config.regions.clone()),
        WarmupCoordinator::new(renderer),
        pool,
        DeletionHandler::new(store),
        publishers,
    ));

    let mut consumer = manager
        .open_consumer()
        .await
        .context("Failed to start consuming")?;

    // --- Shutdown ---
    let cancel = CancellationToken::new();
    let signal_task = tokio::spawn(shutdown_signal(cancel.clone()));

    let result = orchestrator.run(&mut consumer, cancel.clone()).await;
    signal_task.abort();

    match result {
        Err(e) => Err(e).context("Broker failure"),
        Ok(()) if cancel.is_cancelled() => {
            consumer.close().await;
            tracing::info!("Worker stopped");
            Ok(())
        }
        Ok(()) => anyhow::bail!("Broker closed the consumer"),
    }
}

/// Cancel `token` on SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }

    token.cancel();
}
