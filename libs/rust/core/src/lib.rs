//! Core engine for CareServe: ensemble model serving and controlled experiments.

use anyhow::Result;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }

/// Installs the global subscriber once. `RUST_LOG` wins over `default_level`;
/// `CARESERVE_JSON_LOG=1` switches to flattened JSON lines.
pub fn init_tracing(service: &str, default_level: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("CARESERVE_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let json_layer = json.then(|| fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false));
        let text_layer = (!json).then(|| fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true));
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        tracing_subscriber::registry().with(env_filter).with(json_layer).with(text_layer).try_init()?;
        Ok(())
    })?;
    info!(target: "careserve", service, "tracing initialized");
    Ok(())
}

pub mod allocation;
pub mod analysis;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod experiment;
pub mod gateway;
pub mod metrics;
pub mod model_registry;
pub mod serving;
pub mod store;

pub use allocation::{DrawMode, DrawSource, HashDraw, RandomDraw, TrafficAllocator};
pub use analysis::{Analysis, AnalysisReport, ExperimentResults, StatisticalAnalyzer, VariantMetrics, VariantResult};
pub use config::{load_config, ServingConfig, StoreBackend};
pub use ensemble::{CombinationType, EnsembleConfiguration, EnsembleEngine, EnsemblePrediction, EnsembleRequest, EnsembleResult, Features, RiskLevel, VotingStrategy};
pub use error::{ServingError, ServingResult, StoreError};
pub use experiment::{AllocationStrategy, Assignment, Experiment, ExperimentConfig, ExperimentRegistry, ExperimentStatus, Outcome, Variant, VariantSpec};
pub use gateway::{BootstrapReport, ExperimentPrediction, PredictionGateway};
pub use metrics::{ServingMetrics, SERVING_METRICS};
pub use model_registry::{InMemoryModelRegistry, ModelRegistry};
pub use serving::{HttpModelService, ModelServing};
pub use store::{MemoryStore, SledStore, Store};
