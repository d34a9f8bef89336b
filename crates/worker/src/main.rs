use anyhow::Context;

use meteomap_worker::{app, telemetry, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env().context("Invalid configuration")?;
    telemetry::init(config.log_format);

    tracing::info!(
        queue_layout = ?config.broker.layout,
        ack_mode = %config.orchestrator.ack_mode,
        workers = config.worker_threads,
        regions = config.regions.len(),
        parameters = config.parameters.len(),
        "Worker starting",
    );

    app::run(config).await
}
