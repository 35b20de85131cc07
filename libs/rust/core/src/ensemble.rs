//! Ensemble combination engine.
//!
//! Combination types:
//! - averaging / soft voting: arithmetic mean of member scores
//! - weighted averaging / weighted voting: normalized weighted mean
//! - majority voting: members vote a risk class, classes map to representative values
//! - stacking: member scores + raw features fed to a meta-model
//! - boosting: members ranked by score, fixed decreasing weight schedule
//!
//! Member failures never abort a prediction. A failed member contributes
//! `DEFAULT_MEMBER_SCORE` and the result is flagged `degraded`.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{ServingError, ServingResult};
use crate::metrics::SERVING_METRICS;
use crate::model_registry::ModelRegistry;
use crate::serving::ModelServing;
use crate::store::Store;

pub const DEFAULT_MEMBER_SCORE: f64 = 0.5;
pub const MEDIUM_RISK_CUT: f64 = 0.3;
pub const HIGH_RISK_CUT: f64 = 0.7;
const BOOSTING_SCHEDULE: [f64; 2] = [0.5, 0.3];
const WEIGHT_TOLERANCE: f64 = 1e-9;

/// Named input features. Iteration order (by name) defines the vector sent to models.
pub type Features = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinationType { Averaging, WeightedAveraging, Voting, WeightedVoting, Stacking, Boosting }

impl CombinationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Averaging => "averaging",
            Self::WeightedAveraging => "weighted_averaging",
            Self::Voting => "voting",
            Self::WeightedVoting => "weighted_voting",
            Self::Stacking => "stacking",
            Self::Boosting => "boosting",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingStrategy { #[default] Soft, Majority }

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel { Low, Medium, High }

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= HIGH_RISK_CUT { Self::High } else if score >= MEDIUM_RISK_CUT { Self::Medium } else { Self::Low }
    }

    /// Value a class vote stands for in majority voting.
    pub fn representative(&self) -> f64 {
        match self { Self::Low => 0.2, Self::Medium => 0.5, Self::High => 0.8 }
    }
}

fn default_threshold() -> f64 { 0.5 }

/// Registration payload. `ensemble_id` is generated when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleRequest {
    #[serde(default)]
    pub ensemble_id: Option<String>,
    #[serde(rename = "type")]
    pub combination: CombinationType,
    pub model_ids: Vec<String>,
    #[serde(default)]
    pub weights: Option<Vec<f64>>,
    #[serde(default)]
    pub voting_strategy: VotingStrategy,
    #[serde(default)]
    pub meta_model_id: Option<String>,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl EnsembleRequest {
    pub fn new(combination: CombinationType, model_ids: Vec<String>) -> Self {
        Self { ensemble_id: None, combination, model_ids, weights: None, voting_strategy: VotingStrategy::Soft, meta_model_id: None, threshold: default_threshold() }
    }
    pub fn with_weights(mut self, weights: Vec<f64>) -> Self { self.weights = Some(weights); self }
    pub fn with_voting(mut self, strategy: VotingStrategy) -> Self { self.voting_strategy = strategy; self }
    pub fn with_meta_model(mut self, id: impl Into<String>) -> Self { self.meta_model_id = Some(id.into()); self }
    pub fn with_id(mut self, id: impl Into<String>) -> Self { self.ensemble_id = Some(id.into()); self }
}

/// Immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfiguration {
    pub ensemble_id: String,
    #[serde(rename = "type")]
    pub combination: CombinationType,
    pub model_ids: Vec<String>,
    /// Normalized to sum to 1 at registration.
    pub weights: Option<Vec<f64>>,
    pub voting_strategy: VotingStrategy,
    pub meta_model_id: Option<String>,
    pub threshold: f64,
    pub created_at: DateTime<Utc>,
}

/// Append-only record of one ensemble decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsemblePrediction {
    pub prediction_id: String,
    pub ensemble_id: String,
    pub subject_id: String,
    pub ensemble_score: f64,
    pub risk_level: RiskLevel,
    pub member_scores: BTreeMap<String, f64>,
    pub confidence: f64,
    pub degraded: bool,
    pub failed_members: Vec<String>,
    pub decision: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleResult {
    pub prediction_id: String,
    pub ensemble_score: f64,
    pub risk_level: RiskLevel,
    pub member_scores: BTreeMap<String, f64>,
    pub confidence: f64,
    /// True when at least one member (or the stacking meta-model) failed and was substituted.
    pub degraded: bool,
    pub failed_members: Vec<String>,
    /// `ensemble_score >= threshold`.
    pub decision: bool,
}

impl From<&EnsemblePrediction> for EnsembleResult {
    fn from(p: &EnsemblePrediction) -> Self {
        Self {
            prediction_id: p.prediction_id.clone(),
            ensemble_score: p.ensemble_score,
            risk_level: p.risk_level,
            member_scores: p.member_scores.clone(),
            confidence: p.confidence,
            degraded: p.degraded,
            failed_members: p.failed_members.clone(),
            decision: p.decision,
        }
    }
}

pub struct EnsembleEngine {
    registry: Arc<dyn ModelRegistry>,
    serving: Arc<dyn ModelServing>,
    store: Arc<dyn Store>,
}

impl EnsembleEngine {
    pub fn new(registry: Arc<dyn ModelRegistry>, serving: Arc<dyn ModelServing>, store: Arc<dyn Store>) -> Self {
        Self { registry, serving, store }
    }

    /// Validates and persists a configuration. Nothing is written on failure.
    #[instrument(skip(self, request), fields(combination = request.combination.as_str()))]
    pub async fn register(&self, request: EnsembleRequest) -> ServingResult<String> {
        let weights = validate_request(&request)?;
        let referenced = request.model_ids.iter().chain(request.meta_model_id.iter());
        for model_id in referenced {
            if !self.registry.exists(model_id).await {
                return Err(ServingError::validation(format!("unknown model: {model_id}")));
            }
        }
        let config = EnsembleConfiguration {
            ensemble_id: request.ensemble_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            combination: request.combination,
            model_ids: request.model_ids,
            weights,
            voting_strategy: request.voting_strategy,
            meta_model_id: request.meta_model_id,
            threshold: request.threshold,
            created_at: Utc::now(),
        };
        if !self.store.insert_ensemble(&config)? {
            return Err(ServingError::validation(format!("ensemble already exists: {}", config.ensemble_id)));
        }
        info!(ensemble_id = %config.ensemble_id, members = config.model_ids.len(), "ensemble registered");
        Ok(config.ensemble_id)
    }

    pub fn get(&self, ensemble_id: &str) -> ServingResult<EnsembleConfiguration> {
        self.store.get_ensemble(ensemble_id)?.ok_or_else(|| ServingError::not_found("ensemble", ensemble_id))
    }

    #[instrument(skip(self, features))]
    pub async fn predict(&self, ensemble_id: &str, subject_id: &str, features: &Features) -> ServingResult<EnsembleResult> {
        let start = Instant::now();
        let config = self.get(ensemble_id)?;
        let inputs: Vec<f64> = features.values().copied().collect();

        let calls = config.model_ids.iter().map(|id| self.serving.predict(id, &inputs));
        let responses = join_all(calls).await;
        let mut scores = Vec::with_capacity(config.model_ids.len());
        let mut failed_members = Vec::new();
        for (model_id, response) in config.model_ids.iter().zip(responses) {
            match response.and_then(checked_probability) {
                Ok(score) => scores.push(score),
                Err(e) => {
                    warn!(model_id = %model_id, error = %e, "member model failed, substituting neutral score");
                    SERVING_METRICS.member_failures_total.add(1, &[KeyValue::new("model_id", model_id.clone())]);
                    failed_members.push(model_id.clone());
                    scores.push(DEFAULT_MEMBER_SCORE);
                }
            }
        }
        if !failed_members.is_empty() && failed_members.len() == config.model_ids.len() {
            error!(ensemble_id, "every member model failed; result is fully defaulted");
        }

        let score = match config.combination {
            CombinationType::Stacking => match self.stack(&config, &scores, &inputs).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(ensemble_id, error = %e, "meta-model failed, falling back to averaging");
                    if let Some(meta) = &config.meta_model_id { failed_members.push(meta.clone()); }
                    average(&scores)
                }
            },
            _ => combine(&config, &scores),
        }.clamp(0.0, 1.0);

        let degraded = !failed_members.is_empty();
        let prediction = EnsemblePrediction {
            prediction_id: Uuid::new_v4().to_string(),
            ensemble_id: config.ensemble_id.clone(),
            subject_id: subject_id.to_string(),
            ensemble_score: score,
            risk_level: RiskLevel::from_score(score),
            member_scores: config.model_ids.iter().cloned().zip(scores.iter().copied()).collect(),
            confidence: confidence(&scores, score),
            degraded,
            failed_members,
            decision: score >= config.threshold,
            created_at: Utc::now(),
        };
        self.store.insert_prediction(&prediction)?;

        let labels = [KeyValue::new("combination", config.combination.as_str())];
        SERVING_METRICS.predictions_total.add(1, &labels);
        if degraded { SERVING_METRICS.degraded_predictions_total.add(1, &labels); }
        SERVING_METRICS.prediction_latency_ms.record(start.elapsed().as_secs_f64() * 1000.0, &labels);
        Ok(EnsembleResult::from(&prediction))
    }

    /// Persisted predictions for a subject, newest first.
    pub fn history(&self, subject_id: &str) -> ServingResult<Vec<EnsemblePrediction>> {
        let mut rows = self.store.predictions_for_subject(subject_id)?;
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn stack(&self, config: &EnsembleConfiguration, scores: &[f64], inputs: &[f64]) -> Result<f64> {
        let Some(meta) = &config.meta_model_id else { bail!("stacking ensemble without meta-model") };
        let mut stacked = Vec::with_capacity(scores.len() + inputs.len());
        stacked.extend_from_slice(scores);
        stacked.extend_from_slice(inputs);
        let out = self.serving.predict(meta, &stacked).await?;
        if !out.is_finite() { bail!("meta-model returned non-finite score"); }
        Ok(out.clamp(0.0, 1.0))
    }
}

/// Checks request shape and returns the normalized weight vector.
fn validate_request(request: &EnsembleRequest) -> ServingResult<Option<Vec<f64>>> {
    if request.model_ids.is_empty() { return Err(ServingError::validation("ensemble needs at least one member model")); }
    let mut seen = HashSet::new();
    if let Some(dup) = request.model_ids.iter().find(|id| !seen.insert(id.as_str())) {
        return Err(ServingError::validation(format!("duplicate member model: {dup}")));
    }
    if request.combination == CombinationType::Stacking && request.meta_model_id.is_none() {
        return Err(ServingError::validation("stacking requires meta_model_id"));
    }
    if !(0.0..=1.0).contains(&request.threshold) {
        return Err(ServingError::validation(format!("threshold {} outside [0,1]", request.threshold)));
    }
    let Some(weights) = &request.weights else { return Ok(None) };
    if weights.len() != request.model_ids.len() {
        return Err(ServingError::validation(format!("{} weights for {} models", weights.len(), request.model_ids.len())));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(ServingError::validation("weights must be finite and non-negative"));
    }
    let total: f64 = weights.iter().sum();
    if total <= WEIGHT_TOLERANCE { return Err(ServingError::validation("weights sum to zero")); }
    Ok(Some(weights.iter().map(|w| w / total).collect()))
}

fn checked_probability(p: f64) -> Result<f64> {
    if !p.is_finite() || !(0.0..=1.0).contains(&p) { bail!("score {p} outside [0,1]"); }
    Ok(p)
}

/// Every combination type except stacking, which needs the meta-model.
pub fn combine(config: &EnsembleConfiguration, scores: &[f64]) -> f64 {
    match config.combination {
        CombinationType::Averaging | CombinationType::Stacking => average(scores),
        CombinationType::WeightedAveraging | CombinationType::WeightedVoting => weighted_average(scores, config.weights.as_deref()),
        CombinationType::Voting => match config.voting_strategy {
            VotingStrategy::Soft => average(scores),
            VotingStrategy::Majority => majority_vote(scores),
        },
        CombinationType::Boosting => boosted(scores).unwrap_or_else(|| average(scores)),
    }
}

pub fn average(scores: &[f64]) -> f64 {
    if scores.is_empty() { return DEFAULT_MEMBER_SCORE; }
    scores.iter().sum::<f64>() / scores.len() as f64
}

pub fn weighted_average(scores: &[f64], weights: Option<&[f64]>) -> f64 {
    match weights {
        Some(w) if w.len() == scores.len() => {
            let total: f64 = w.iter().sum();
            if total <= WEIGHT_TOLERANCE { return average(scores); }
            scores.iter().zip(w).map(|(s, w)| s * w).sum::<f64>() / total
        }
        _ => average(scores),
    }
}

pub fn majority_vote(scores: &[f64]) -> f64 {
    let votes: Vec<f64> = scores.iter().map(|s| RiskLevel::from_score(*s).representative()).collect();
    average(&votes)
}

/// Highest score gets 0.5, next 0.3, the remaining budget goes to the next entries until spent.
pub fn boosted(scores: &[f64]) -> Option<f64> {
    if scores.is_empty() || scores.iter().any(|s| !s.is_finite()) { return None; }
    let mut ranked = scores.to_vec();
    ranked.sort_by(|a, b| b.total_cmp(a));
    let mut budget = 1.0_f64;
    let (mut weighted, mut total) = (0.0, 0.0);
    for (rank, score) in ranked.iter().enumerate() {
        let w = BOOSTING_SCHEDULE.get(rank).copied().unwrap_or(budget).min(budget);
        if w <= WEIGHT_TOLERANCE { break; }
        budget -= w;
        weighted += score * w;
        total += w;
    }
    (total > 0.0).then(|| weighted / total)
}

pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() { return 0.0; }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Mean of member agreement and distance from the 0.5 decision boundary.
pub fn confidence(scores: &[f64], ensemble_score: f64) -> f64 {
    let agreement = (1.0 - population_std_dev(scores)).max(0.0);
    let position = 1.0 - 2.0 * (ensemble_score - 0.5).abs();
    ((agreement + position) / 2.0).clamp(0.0, 1.0)
}
