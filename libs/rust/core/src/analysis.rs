//! Per-variant outcome statistics and the experiment recommendation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{ServingError, ServingResult};
use crate::experiment::{AllocationStrategy, Experiment, ExperimentStatus, Outcome};
use crate::store::Store;

/// Samples a variant needs before `minimum_sample_achieved` flips. Not tied to the
/// experiment's target sample size.
pub const MIN_SAMPLE_SIZE: usize = 100;
/// Two-sided 95% normal quantile.
pub const Z_95: f64 = 1.96;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantMetrics {
    pub variant_id: String,
    pub mean_score: f64,
    pub sample_size: usize,
    /// Population standard deviation (divides by n).
    pub std_dev: f64,
    pub confidence_interval: (f64, f64),
    pub minimum_sample_achieved: bool,
}

impl VariantMetrics {
    pub fn from_scores(variant_id: impl Into<String>, scores: &[f64]) -> Self {
        let n = scores.len();
        let mean = if n == 0 { 0.0 } else { scores.iter().sum::<f64>() / n as f64 };
        let std_dev = if n == 0 { 0.0 } else { (scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64).sqrt() };
        let confidence_interval = if n < 2 {
            (mean, mean)
        } else {
            let margin = Z_95 * std_dev / (n as f64).sqrt();
            (mean - margin, mean + margin)
        };
        Self { variant_id: variant_id.into(), mean_score: mean, sample_size: n, std_dev, confidence_interval, minimum_sample_achieved: n >= MIN_SAMPLE_SIZE }
    }

    pub fn has_data(&self) -> bool { self.sample_size > 0 }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub best_variant: String,
    pub best_mean: f64,
    pub comparison_variant: String,
    /// `best_mean - comparison mean`.
    pub improvement: f64,
    /// Improvement strictly exceeds the configured effect size.
    pub significant: bool,
    pub total_samples: usize,
    pub should_conclude: bool,
    pub recommendation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Analysis {
    /// Fewer than two variants have outcome data.
    InsufficientVariants { variants_with_data: usize },
    Complete(AnalysisReport),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantResult {
    pub variant_id: String,
    pub model_id: String,
    pub weight: f64,
    pub is_control: bool,
    pub assigned_count: u64,
    pub metrics: VariantMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub experiment_id: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub allocation: AllocationStrategy,
    pub target_sample_size: usize,
    pub confidence_level: f64,
    pub effect_size: f64,
    pub primary_metric: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub variants: Vec<VariantResult>,
    pub analysis: Analysis,
}

/// Metrics for every configured variant, in configured order.
pub fn variant_metrics(experiment: &Experiment, outcomes: &[Outcome]) -> Vec<VariantMetrics> {
    let mut by_variant: HashMap<&str, Vec<f64>> = HashMap::new();
    for o in outcomes.iter().filter(|o| o.score.is_finite()) {
        by_variant.entry(o.variant_id.as_str()).or_default().push(o.score);
    }
    experiment.variants.iter()
        .map(|v| VariantMetrics::from_scores(v.variant_id.clone(), by_variant.get(v.variant_id.as_str()).map(Vec::as_slice).unwrap_or(&[])))
        .collect()
}

/// Compares the best variant against the control, or against the first other
/// variant with data when the control has none or is itself the best.
pub fn analyze_metrics(experiment: &Experiment, metrics: &[VariantMetrics]) -> Analysis {
    let with_data: Vec<&VariantMetrics> = metrics.iter().filter(|m| m.has_data()).collect();
    if with_data.len() < 2 {
        return Analysis::InsufficientVariants { variants_with_data: with_data.len() };
    }
    let mut best = with_data[0];
    for m in &with_data[1..] {
        if m.mean_score > best.mean_score { best = m; }
    }
    let control = experiment.control()
        .and_then(|c| with_data.iter().copied().find(|m| m.variant_id == c.variant_id))
        .filter(|m| m.variant_id != best.variant_id);
    let comparison = match control {
        Some(c) => c,
        None => match with_data.iter().copied().find(|m| m.variant_id != best.variant_id) {
            Some(m) => m,
            None => return Analysis::InsufficientVariants { variants_with_data: with_data.len() },
        },
    };

    let improvement = best.mean_score - comparison.mean_score;
    let significant = improvement > experiment.effect_size;
    let total_samples: usize = metrics.iter().map(|m| m.sample_size).sum();
    let recommendation = if significant {
        format!("variant {} shows significant improvement", best.variant_id)
    } else {
        "inconclusive".to_string()
    };
    Analysis::Complete(AnalysisReport {
        best_variant: best.variant_id.clone(),
        best_mean: best.mean_score,
        comparison_variant: comparison.variant_id.clone(),
        improvement,
        significant,
        total_samples,
        should_conclude: total_samples >= experiment.target_sample_size,
        recommendation,
    })
}

pub struct StatisticalAnalyzer {
    store: Arc<dyn Store>,
}

impl StatisticalAnalyzer {
    pub fn new(store: Arc<dyn Store>) -> Self { Self { store } }

    fn load(&self, experiment_id: &str) -> ServingResult<(Experiment, Vec<VariantMetrics>)> {
        let experiment = self.store.get_experiment(experiment_id)?.ok_or_else(|| ServingError::not_found("experiment", experiment_id))?;
        let outcomes = self.store.outcomes_for_experiment(experiment_id)?;
        let metrics = variant_metrics(&experiment, &outcomes);
        Ok((experiment, metrics))
    }

    pub fn compute_variant_metrics(&self, experiment_id: &str) -> ServingResult<Vec<VariantMetrics>> {
        Ok(self.load(experiment_id)?.1)
    }

    pub fn analyze(&self, experiment_id: &str) -> ServingResult<Analysis> {
        let (experiment, metrics) = self.load(experiment_id)?;
        Ok(analyze_metrics(&experiment, &metrics))
    }

    #[instrument(skip(self))]
    pub fn get_results(&self, experiment_id: &str) -> ServingResult<ExperimentResults> {
        let (experiment, metrics) = self.load(experiment_id)?;
        let analysis = analyze_metrics(&experiment, &metrics);
        debug!(experiment_id, ?analysis, "experiment analyzed");
        let variants = experiment.variants.iter().zip(metrics)
            .map(|(v, metrics)| VariantResult {
                variant_id: v.variant_id.clone(),
                model_id: v.model_id.clone(),
                weight: v.weight,
                is_control: v.is_control,
                assigned_count: v.assigned_count,
                metrics,
            })
            .collect();
        Ok(ExperimentResults {
            experiment_id: experiment.experiment_id,
            name: experiment.name,
            status: experiment.status,
            allocation: experiment.allocation,
            target_sample_size: experiment.target_sample_size,
            confidence_level: experiment.confidence_level,
            effect_size: experiment.effect_size,
            primary_metric: experiment.primary_metric,
            started_at: experiment.started_at,
            ended_at: experiment.ended_at,
            variants,
            analysis,
        })
    }
}
