use anyhow::Result;
use careserve_core::{clear_ready, init_tracing, load_config, mark_ready, PredictionGateway};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = load_config("prediction-gateway")?;
    init_tracing(&cfg.service_name, &cfg.log_level)?;
    info!(target: "prediction-gateway", store = ?cfg.store, "Starting prediction-gateway service");

    let gateway = Arc::new(PredictionGateway::from_config(&cfg)?);
    if let Some(seed) = &cfg.bootstrap_file {
        match gateway.bootstrap(seed).await {
            Ok(report) => info!(target: "prediction-gateway", ensembles = report.ensembles.len(), experiments = report.experiments.len(), skipped_ensembles = report.skipped_ensembles.len(), skipped_experiments = report.skipped_experiments.len(), "bootstrap complete"),
            Err(e) => warn!(target: "prediction-gateway", error = ?e, "bootstrap failed - continuing with existing state"),
        }
    }

    mark_ready();
    info!(target: "prediction-gateway", "ready");
    tokio::signal::ctrl_c().await?;
    clear_ready();
    info!(target: "prediction-gateway", "shutting down");
    Ok(())
}
