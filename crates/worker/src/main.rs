use anyhow::{Context, Result};
use benchflow_core::telemetry::{init_telemetry, TelemetryConfig};
use benchflow_worker::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Flags win over RUST_LOG / LOG_LEVEL; LOG_FORMAT selects text or json
    let config = WorkerConfig::from_env();
    let telemetry = TelemetryConfig::from_env("benchflow-worker")
        .with_log_filter(config.log_level.clone());
    init_telemetry(&telemetry).context("Failed to initialize logging")?;

    tracing::info!(
        kinds = ?config.kinds,
        operations = ?config.operations(),
        workbench_executor = %config.workbench_executor,
        jupyterhub_executor = %config.jupyterhub_executor,
        durable_store = config.database_url.is_some(),
        "benchflow-worker starting"
    );

    benchflow_worker::serve(config).await?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
