//! Prediction gateway: the single entry point the API layer talks to.
//!
//! Built once with its collaborators and shared behind an `Arc`. Holds no mutable
//! state of its own; everything durable goes through the `Store`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::allocation::{DrawSource, TrafficAllocator};
use crate::analysis::{ExperimentResults, StatisticalAnalyzer};
use crate::config::{ServingConfig, StoreBackend};
use crate::ensemble::{EnsembleEngine, EnsemblePrediction, EnsembleRequest, EnsembleResult, Features};
use crate::error::{ServingError, ServingResult};
use crate::experiment::{ExperimentConfig, ExperimentRegistry};
use crate::model_registry::ModelRegistry;
use crate::serving::{HttpModelService, ModelServing};
use crate::store::{MemoryStore, SledStore, Store};

/// Outcome of serving a subject through an experiment arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentPrediction {
    pub variant_id: String,
    pub model_id: String,
    /// None when the variant's model failed; no outcome is recorded in that case.
    pub score: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct BootstrapFile {
    #[serde(default)]
    ensembles: Vec<EnsembleRequest>,
    #[serde(default)]
    experiments: Vec<BootstrapExperiment>,
}

#[derive(Debug, Deserialize)]
struct BootstrapExperiment {
    config: ExperimentConfig,
    #[serde(default)]
    start: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BootstrapReport {
    pub ensembles: Vec<String>,
    pub experiments: Vec<String>,
    /// Ensembles with an explicit id that was already registered.
    pub skipped_ensembles: Vec<String>,
    /// Experiments with an explicit id that already exists, whatever their status.
    pub skipped_experiments: Vec<String>,
}

pub struct PredictionGateway {
    store: Arc<dyn Store>,
    serving: Arc<dyn ModelServing>,
    ensembles: EnsembleEngine,
    experiments: ExperimentRegistry,
    allocator: TrafficAllocator,
    analyzer: StatisticalAnalyzer,
}

impl PredictionGateway {
    pub fn new(registry: Arc<dyn ModelRegistry>, serving: Arc<dyn ModelServing>, store: Arc<dyn Store>, draw: Arc<dyn DrawSource>) -> Self {
        Self {
            ensembles: EnsembleEngine::new(registry, serving.clone(), store.clone()),
            experiments: ExperimentRegistry::new(store.clone()),
            allocator: TrafficAllocator::new(store.clone(), draw),
            analyzer: StatisticalAnalyzer::new(store.clone()),
            store,
            serving,
        }
    }

    /// Production wiring: configured store, remote model server as both registry and
    /// serving backend, configured draw mode.
    pub fn from_config(cfg: &ServingConfig) -> Result<Self> {
        let store: Arc<dyn Store> = match cfg.store {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Sled => Arc::new(SledStore::open(&cfg.store_path).with_context(|| format!("opening store at {}", cfg.store_path.display()))?),
        };
        let models = Arc::new(HttpModelService::new(&cfg.model_service_url, cfg.model_timeout())?);
        info!(store = ?cfg.store, model_service = %cfg.model_service_url, draw = ?cfg.assignment_draw, "gateway wired");
        Ok(Self::new(models.clone(), models, store, cfg.assignment_draw.source()))
    }

    pub fn store(&self) -> &Arc<dyn Store> { &self.store }

    pub async fn register_ensemble(&self, request: EnsembleRequest) -> ServingResult<String> {
        self.ensembles.register(request).await
    }

    pub async fn predict(&self, ensemble_id: &str, subject_id: &str, features: &Features) -> ServingResult<EnsembleResult> {
        self.ensembles.predict(ensemble_id, subject_id, features).await
    }

    pub async fn prediction_history(&self, subject_id: &str) -> ServingResult<Vec<EnsemblePrediction>> {
        self.ensembles.history(subject_id)
    }

    pub async fn create_experiment(&self, config: ExperimentConfig) -> ServingResult<String> {
        self.experiments.create(config)
    }

    pub async fn start_experiment(&self, experiment_id: &str) -> ServingResult<()> {
        self.experiments.start(experiment_id)
    }

    pub async fn stop_experiment(&self, experiment_id: &str) -> ServingResult<()> {
        self.experiments.stop(experiment_id)
    }

    pub async fn assign_variant(&self, experiment_id: &str, subject_id: &str) -> ServingResult<Option<String>> {
        self.allocator.assign_variant(experiment_id, subject_id)
    }

    pub async fn record_outcome(&self, experiment_id: &str, subject_id: &str, score: f64, ground_truth: Option<f64>) -> ServingResult<()> {
        self.allocator.record_outcome(experiment_id, subject_id, score, ground_truth)
    }

    pub async fn get_results(&self, experiment_id: &str) -> ServingResult<ExperimentResults> {
        self.analyzer.get_results(experiment_id)
    }

    /// Assigns the subject, scores it with the variant's model and records the score
    /// as the outcome. None when the subject gets no assignment.
    #[instrument(skip(self, features))]
    pub async fn predict_in_experiment(&self, experiment_id: &str, subject_id: &str, features: &Features) -> ServingResult<Option<ExperimentPrediction>> {
        let Some(variant_id) = self.allocator.assign_variant(experiment_id, subject_id)? else { return Ok(None) };
        let experiment = self.experiments.get(experiment_id)?;
        let model_id = experiment.variant(&variant_id)
            .map(|v| v.model_id.clone())
            .ok_or_else(|| ServingError::not_found("variant", variant_id.as_str()))?;

        let inputs: Vec<f64> = features.values().copied().collect();
        let score = match self.serving.predict(&model_id, &inputs).await {
            Ok(p) if p.is_finite() && (0.0..=1.0).contains(&p) => Some(p),
            Ok(p) => { warn!(model_id = %model_id, score = p, "variant model returned out-of-range score"); None }
            Err(e) => { warn!(model_id = %model_id, error = %e, "variant model failed"); None }
        };
        if let Some(score) = score {
            self.allocator.record_outcome(experiment_id, subject_id, score, None)?;
        }
        Ok(Some(ExperimentPrediction { variant_id, model_id, score }))
    }

    /// Registers ensembles and creates experiments listed in a YAML seed file.
    /// Entries with an explicit id that already exists are skipped, so a seed can be
    /// re-applied against a persistent store. Experiments without an id are created
    /// on every run.
    pub async fn bootstrap(&self, path: impl AsRef<Path>) -> Result<BootstrapReport> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading bootstrap file {}", path.display()))?;
        let seed: BootstrapFile = serde_yaml::from_str(&text).with_context(|| format!("parsing bootstrap file {}", path.display()))?;
        let mut report = BootstrapReport::default();

        for request in seed.ensembles {
            if let Some(id) = &request.ensemble_id {
                if self.store.get_ensemble(id)?.is_some() {
                    info!(ensemble_id = %id, "bootstrap ensemble already registered");
                    report.skipped_ensembles.push(id.clone());
                    continue;
                }
            }
            report.ensembles.push(self.register_ensemble(request).await?);
        }
        for entry in seed.experiments {
            if let Some(id) = &entry.config.experiment_id {
                if self.store.get_experiment(id)?.is_some() {
                    info!(experiment_id = %id, "bootstrap experiment already exists");
                    report.skipped_experiments.push(id.clone());
                    continue;
                }
            }
            let id = self.create_experiment(entry.config).await?;
            if entry.start { self.start_experiment(&id).await?; }
            report.experiments.push(id);
        }
        info!(ensembles = report.ensembles.len(), experiments = report.experiments.len(), "bootstrap applied");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::HashDraw;
    use crate::ensemble::CombinationType;
    use crate::experiment::{ExperimentStatus, VariantSpec};
    use crate::model_registry::InMemoryModelRegistry;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct StaticScores(HashMap<String, f64>);

    #[async_trait]
    impl ModelServing for StaticScores {
        async fn predict(&self, model_id: &str, _features: &[f64]) -> anyhow::Result<f64> {
            self.0.get(model_id).copied().ok_or_else(|| anyhow::anyhow!("model {model_id} down"))
        }
    }

    fn gateway() -> PredictionGateway {
        let registry = Arc::new(InMemoryModelRegistry::with_models(["m1", "m2", "broken"]));
        let serving = Arc::new(StaticScores(HashMap::from([("m1".to_string(), 0.8), ("m2".to_string(), 0.3)])));
        PredictionGateway::new(registry, serving, Arc::new(MemoryStore::new()), Arc::new(HashDraw))
    }

    #[tokio::test]
    async fn experiment_prediction_records_outcome() {
        let gw = gateway();
        let id = gw.create_experiment(ExperimentConfig::new("x", vec![VariantSpec::new("a", "m1").control()], 10)).await.unwrap();
        let features = Features::from([("age".to_string(), 71.0)]);
        assert_eq!(gw.predict_in_experiment(&id, "s1", &features).await.unwrap(), None);
        gw.start_experiment(&id).await.unwrap();
        let served = gw.predict_in_experiment(&id, "s1", &features).await.unwrap().unwrap();
        assert_eq!(served, ExperimentPrediction { variant_id: "a".into(), model_id: "m1".into(), score: Some(0.8) });
        let results = gw.get_results(&id).await.unwrap();
        assert_eq!(results.variants[0].metrics.sample_size, 1);
        assert_eq!(results.variants[0].assigned_count, 1);
    }

    #[tokio::test]
    async fn failed_variant_model_records_nothing() {
        let gw = gateway();
        let id = gw.create_experiment(ExperimentConfig::new("x", vec![VariantSpec::new("a", "broken")], 10)).await.unwrap();
        gw.start_experiment(&id).await.unwrap();
        let served = gw.predict_in_experiment(&id, "s1", &Features::new()).await.unwrap().unwrap();
        assert_eq!(served.score, None);
        assert!(gw.store().outcomes_for_experiment(&id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn bootstrap_reapply_skips_known_ids() {
        let gw = gateway();
        let path = std::env::temp_dir().join(format!("careserve-seed-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"
ensembles:
  - ensemble_id: readmission
    type: weighted_averaging
    model_ids: [m1, m2]
    weights: [1.0, 3.0]
experiments:
  - start: true
    config:
      experiment_id: sepsis-arms
      name: sepsis-arms
      target_sample_size: 50
      allocation: gradual
      variants:
        - { variant_id: control, model_id: m1, is_control: true }
        - { variant_id: challenger, model_id: m2 }
"#).unwrap();
        let first = gw.bootstrap(&path).await.unwrap();
        assert_eq!(first.ensembles, vec!["readmission".to_string()]);
        assert_eq!(first.experiments, vec!["sepsis-arms".to_string()]);
        let exp = gw.store().get_experiment("sepsis-arms").unwrap().unwrap();
        assert_eq!(exp.status, ExperimentStatus::Running);
        assert!((exp.variants[0].weight - 0.3).abs() < 1e-12);

        let again = gw.bootstrap(&path).await.unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(again.skipped_ensembles, vec!["readmission".to_string()]);
        assert!(again.ensembles.is_empty());
        assert_eq!(again.skipped_experiments, vec!["sepsis-arms".to_string()]);
        assert!(again.experiments.is_empty());
        // the seeded experiment keeps running and is not duplicated
        let exp = gw.store().get_experiment("sepsis-arms").unwrap().unwrap();
        assert_eq!(exp.status, ExperimentStatus::Running);

        let cfg = gw.store().get_ensemble("readmission").unwrap().unwrap();
        assert_eq!(cfg.combination, CombinationType::WeightedAveraging);
        assert_eq!(cfg.weights, Some(vec![0.25, 0.75]));
    }
}
