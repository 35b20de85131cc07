//! Sticky weighted traffic allocation and outcome capture.
//!
//! Only a subject's first request for a running experiment draws a variant. The
//! draw is persisted through the store's insert-or-fetch, so racing first requests
//! converge on one row and every later request reads it back.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::ServingResult;
use crate::experiment::{Assignment, ExperimentStatus, Outcome, Variant};
use crate::metrics::SERVING_METRICS;
use crate::store::{increment_assigned, Store};

/// Source of the uniform number in [0,1) used for a first-time draw.
pub trait DrawSource: Send + Sync {
    fn unit(&self, experiment_id: &str, subject_id: &str) -> f64;
}

/// Thread-local RNG. The default draw.
pub struct RandomDraw;

impl DrawSource for RandomDraw {
    fn unit(&self, _experiment_id: &str, _subject_id: &str) -> f64 { rand::thread_rng().gen::<f64>() }
}

/// SHA-256 of `experiment_id:subject_id`, so the same pair always draws the same value.
pub struct HashDraw;

impl DrawSource for HashDraw {
    fn unit(&self, experiment_id: &str, subject_id: &str) -> f64 {
        let digest = Sha256::digest(format!("{experiment_id}:{subject_id}").as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        // top 53 bits -> [0,1)
        (u64::from_be_bytes(head) >> 11) as f64 / (1u64 << 53) as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrawMode { #[default] Random, Hash }

impl DrawMode {
    pub fn source(&self) -> Arc<dyn DrawSource> {
        match self { Self::Random => Arc::new(RandomDraw), Self::Hash => Arc::new(HashDraw) }
    }
}

/// Index of the variant whose cumulative weight band contains `u * total`.
/// Zero-weight variants own an empty band and are never returned.
pub fn select_variant(variants: &[Variant], u: f64) -> Option<usize> {
    let usable = |w: f64| w.is_finite() && w > 0.0;
    let total: f64 = variants.iter().map(|v| v.weight).filter(|w| usable(*w)).sum();
    if total <= 0.0 { return None; }
    let target = u.clamp(0.0, 1.0) * total;
    let mut cumulative = 0.0;
    let mut last = None;
    for (i, v) in variants.iter().enumerate() {
        if !usable(v.weight) { continue; }
        cumulative += v.weight;
        last = Some(i);
        if target < cumulative { return Some(i); }
    }
    last
}

pub struct TrafficAllocator {
    store: Arc<dyn Store>,
    draw: Arc<dyn DrawSource>,
}

impl TrafficAllocator {
    pub fn new(store: Arc<dyn Store>, draw: Arc<dyn DrawSource>) -> Self { Self { store, draw } }

    /// Variant for the subject, or None when the experiment is missing, not running,
    /// or has no drawable weight.
    pub fn assign_variant(&self, experiment_id: &str, subject_id: &str) -> ServingResult<Option<String>> {
        let Some(experiment) = self.store.get_experiment(experiment_id)? else {
            debug!(experiment_id, "assignment skipped, unknown experiment");
            return Ok(None);
        };
        if experiment.status != ExperimentStatus::Running {
            debug!(experiment_id, status = ?experiment.status, "assignment skipped, experiment not running");
            return Ok(None);
        }
        if let Some(existing) = self.store.get_assignment(experiment_id, subject_id)? {
            SERVING_METRICS.sticky_hits_total.add(1, &[]);
            return Ok(Some(existing.variant_id));
        }

        let u = self.draw.unit(experiment_id, subject_id);
        let Some(idx) = select_variant(&experiment.variants, u) else {
            warn!(experiment_id, "no variant carries positive weight");
            return Ok(None);
        };
        let candidate = Assignment {
            experiment_id: experiment_id.to_string(),
            subject_id: subject_id.to_string(),
            variant_id: experiment.variants[idx].variant_id.clone(),
            assigned_at: Utc::now(),
        };
        let upserted = self.store.insert_assignment_if_absent(candidate)?;
        if upserted.inserted {
            increment_assigned(self.store.as_ref(), experiment_id, &upserted.row.variant_id)?;
            SERVING_METRICS.assignments_total.add(1, &[]);
            info!(experiment_id, subject_id, variant_id = %upserted.row.variant_id, "subject assigned");
        } else {
            // lost a race with a concurrent first request
            SERVING_METRICS.sticky_hits_total.add(1, &[]);
        }
        Ok(Some(upserted.row.variant_id))
    }

    /// Attaches an outcome to an existing assignment. Without one this is a silent no-op,
    /// as is a score that is not a probability.
    pub fn record_outcome(&self, experiment_id: &str, subject_id: &str, score: f64, ground_truth: Option<f64>) -> ServingResult<()> {
        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            warn!(experiment_id, subject_id, score, "dropping outcome score outside [0,1]");
            SERVING_METRICS.outcomes_dropped_total.add(1, &[]);
            return Ok(());
        }
        let Some(assignment) = self.store.get_assignment(experiment_id, subject_id)? else {
            debug!(experiment_id, subject_id, "outcome ignored, subject has no assignment");
            SERVING_METRICS.outcomes_dropped_total.add(1, &[]);
            return Ok(());
        };
        self.store.upsert_outcome(Outcome {
            experiment_id: assignment.experiment_id,
            subject_id: assignment.subject_id,
            variant_id: assignment.variant_id,
            score,
            ground_truth,
            recorded_at: Utc::now(),
        })?;
        SERVING_METRICS.outcomes_total.add(1, &[]);
        Ok(())
    }
}
