//! Experiment registry: lifecycle and per-variant weight computation.
//!
//! Status lattice (forward only):
//! - Draft -> Running
//! - Running -> Paused | Completed | Cancelled
//! - Paused -> Running | Completed | Cancelled
//!
//! Completed and Cancelled are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{ServingError, ServingResult};
use crate::store::Store;

/// Share of the remaining budget each non-final variant receives under gradual allocation.
pub const GRADUAL_SHARE: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus { Draft, Running, Paused, Completed, Cancelled }

impl ExperimentStatus {
    pub fn can_transition_to(&self, next: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self, next),
            (Draft, Running) | (Running, Paused) | (Running, Completed) | (Running, Cancelled)
                | (Paused, Running) | (Paused, Completed) | (Paused, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy { #[default] Equal, Gradual, Custom }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSpec {
    #[serde(default)]
    pub variant_id: Option<String>,
    pub model_id: String,
    #[serde(default)]
    pub is_control: bool,
}

impl VariantSpec {
    pub fn new(variant_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self { variant_id: Some(variant_id.into()), model_id: model_id.into(), is_control: false }
    }
    pub fn control(mut self) -> Self { self.is_control = true; self }
}

fn default_confidence_level() -> f64 { 0.95 }
fn default_effect_size() -> f64 { 0.05 }
fn default_primary_metric() -> String { "score".into() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Generated when absent. An explicit id that already exists is rejected.
    #[serde(default)]
    pub experiment_id: Option<String>,
    pub name: String,
    pub variants: Vec<VariantSpec>,
    #[serde(default)]
    pub allocation: AllocationStrategy,
    /// Only read for `custom` allocation. Variants missing here get weight 0.
    #[serde(default)]
    pub custom_weights: HashMap<String, f64>,
    pub target_sample_size: usize,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    #[serde(default = "default_effect_size")]
    pub effect_size: f64,
    #[serde(default = "default_primary_metric")]
    pub primary_metric: String,
}

impl ExperimentConfig {
    pub fn new(name: impl Into<String>, variants: Vec<VariantSpec>, target_sample_size: usize) -> Self {
        Self {
            experiment_id: None,
            name: name.into(),
            variants,
            allocation: AllocationStrategy::Equal,
            custom_weights: HashMap::new(),
            target_sample_size,
            confidence_level: default_confidence_level(),
            effect_size: default_effect_size(),
            primary_metric: default_primary_metric(),
        }
    }
    pub fn with_allocation(mut self, allocation: AllocationStrategy) -> Self { self.allocation = allocation; self }
    pub fn with_custom_weights(mut self, weights: HashMap<String, f64>) -> Self {
        self.allocation = AllocationStrategy::Custom;
        self.custom_weights = weights;
        self
    }
    pub fn with_effect_size(mut self, effect_size: f64) -> Self { self.effect_size = effect_size; self }
    pub fn with_id(mut self, id: impl Into<String>) -> Self { self.experiment_id = Some(id.into()); self }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub variant_id: String,
    pub model_id: String,
    pub weight: f64,
    pub is_control: bool,
    pub assigned_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub variants: Vec<Variant>,
    pub allocation: AllocationStrategy,
    pub target_sample_size: usize,
    pub confidence_level: f64,
    pub effect_size: f64,
    pub primary_metric: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Experiment {
    pub fn variant(&self, variant_id: &str) -> Option<&Variant> { self.variants.iter().find(|v| v.variant_id == variant_id) }
    pub fn control(&self) -> Option<&Variant> { self.variants.iter().find(|v| v.is_control) }
}

/// Sticky binding of a subject to a variant. Unique on (experiment_id, subject_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub experiment_id: String,
    pub subject_id: String,
    pub variant_id: String,
    pub assigned_at: DateTime<Utc>,
}

/// One slot per assignment; later writes replace earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub experiment_id: String,
    pub subject_id: String,
    pub variant_id: String,
    pub score: f64,
    pub ground_truth: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// Per-variant weights in variant order.
pub fn allocate_weights(strategy: AllocationStrategy, variant_ids: &[String], custom: &HashMap<String, f64>) -> Vec<f64> {
    let n = variant_ids.len();
    match strategy {
        AllocationStrategy::Equal => vec![1.0 / n as f64; n],
        AllocationStrategy::Gradual => {
            let mut remaining = 1.0;
            (0..n).map(|i| {
                if i + 1 == n { return remaining; }
                let w = remaining * GRADUAL_SHARE;
                remaining -= w;
                w
            }).collect()
        }
        AllocationStrategy::Custom => variant_ids.iter().map(|id| custom.get(id).copied().unwrap_or(0.0)).collect(),
    }
}

fn validate_config(config: &ExperimentConfig) -> ServingResult<Vec<String>> {
    if config.name.trim().is_empty() { return Err(ServingError::validation("experiment name is empty")); }
    if config.experiment_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
        return Err(ServingError::validation("experiment id is empty"));
    }
    if config.variants.is_empty() { return Err(ServingError::validation("experiment needs at least one variant")); }
    if !(config.confidence_level > 0.0 && config.confidence_level < 1.0) {
        return Err(ServingError::validation(format!("confidence_level {} outside (0,1)", config.confidence_level)));
    }
    if !config.effect_size.is_finite() || config.effect_size < 0.0 {
        return Err(ServingError::validation("effect_size must be finite and non-negative"));
    }
    let ids: Vec<String> = config.variants.iter().enumerate()
        .map(|(i, v)| v.variant_id.clone().unwrap_or_else(|| format!("variant_{i}")))
        .collect();
    let mut seen = HashSet::new();
    if let Some(dup) = ids.iter().find(|id| !seen.insert(id.as_str())) {
        return Err(ServingError::validation(format!("duplicate variant id: {dup}")));
    }
    if config.allocation == AllocationStrategy::Custom
        && config.custom_weights.values().any(|w| !w.is_finite() || !(0.0..=1.0).contains(w))
    {
        return Err(ServingError::validation("custom weights must lie in [0,1]"));
    }
    Ok(ids)
}

pub struct ExperimentRegistry {
    store: Arc<dyn Store>,
}

impl ExperimentRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self { Self { store } }

    /// Persists a new experiment in `Draft`.
    #[instrument(skip(self, config), fields(name = %config.name))]
    pub fn create(&self, config: ExperimentConfig) -> ServingResult<String> {
        let ids = validate_config(&config)?;
        let weights = allocate_weights(config.allocation, &ids, &config.custom_weights);
        let variants = config.variants.into_iter().zip(ids).zip(weights)
            .map(|((spec, variant_id), weight)| Variant { variant_id, model_id: spec.model_id, weight, is_control: spec.is_control, assigned_count: 0 })
            .collect();
        let experiment = Experiment {
            experiment_id: config.experiment_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: config.name,
            status: ExperimentStatus::Draft,
            variants,
            allocation: config.allocation,
            target_sample_size: config.target_sample_size,
            confidence_level: config.confidence_level,
            effect_size: config.effect_size,
            primary_metric: config.primary_metric,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        if !self.store.insert_experiment(&experiment)? {
            return Err(ServingError::validation(format!("experiment already exists: {}", experiment.experiment_id)));
        }
        info!(experiment_id = %experiment.experiment_id, variants = experiment.variants.len(), "experiment created");
        Ok(experiment.experiment_id)
    }

    pub fn get(&self, experiment_id: &str) -> ServingResult<Experiment> {
        self.store.get_experiment(experiment_id)?.ok_or_else(|| ServingError::not_found("experiment", experiment_id))
    }

    /// Draft -> Running. Any other source state is `InvalidState`.
    pub fn start(&self, experiment_id: &str) -> ServingResult<()> {
        let mut rejected = None;
        let updated = self.store.update_experiment(experiment_id, &mut |exp: &mut Experiment| {
            rejected = None;
            if exp.status != ExperimentStatus::Draft {
                rejected = Some(exp.status);
                return false;
            }
            exp.status = ExperimentStatus::Running;
            exp.started_at = Some(Utc::now());
            true
        })?;
        if updated.is_none() { return Err(ServingError::not_found("experiment", experiment_id)); }
        if let Some(status) = rejected {
            return Err(ServingError::InvalidState(format!("cannot start experiment in {status:?}")));
        }
        info!(experiment_id, "experiment started");
        Ok(())
    }

    /// Moves a running or paused experiment to `Completed`. Any other state is left
    /// untouched and still reported as ok.
    pub fn stop(&self, experiment_id: &str) -> ServingResult<()> {
        let updated = self.store.update_experiment(experiment_id, &mut |exp: &mut Experiment| {
            if !exp.status.can_transition_to(ExperimentStatus::Completed) { return false; }
            exp.status = ExperimentStatus::Completed;
            exp.ended_at = Some(Utc::now());
            true
        })?;
        match updated {
            None => Err(ServingError::not_found("experiment", experiment_id)),
            Some(exp) if exp.status == ExperimentStatus::Completed => { info!(experiment_id, "experiment stopped"); Ok(()) }
            Some(exp) => { warn!(experiment_id, status = ?exp.status, "stop ignored, experiment not active"); Ok(()) }
        }
    }
}
