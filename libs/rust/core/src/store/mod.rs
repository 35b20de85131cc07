//! Persistence contract for the engine plus in-memory and sled-backed stores.
//!
//! Assignment uniqueness on (experiment_id, subject_id) is enforced here, not by
//! callers: `insert_assignment_if_absent` either inserts or hands back the row
//! that won.

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use crate::ensemble::{EnsembleConfiguration, EnsemblePrediction};
use crate::error::StoreError;
use crate::experiment::{Assignment, Experiment, Outcome};

/// Result of an insert-or-fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted<T> {
    pub row: T,
    /// False when an existing row won and `row` is that row.
    pub inserted: bool,
}

pub trait Store: Send + Sync {
    /// Returns false (and writes nothing) when the id is taken.
    fn insert_ensemble(&self, config: &EnsembleConfiguration) -> Result<bool, StoreError>;
    fn get_ensemble(&self, ensemble_id: &str) -> Result<Option<EnsembleConfiguration>, StoreError>;
    fn insert_prediction(&self, prediction: &EnsemblePrediction) -> Result<(), StoreError>;
    fn predictions_for_subject(&self, subject_id: &str) -> Result<Vec<EnsemblePrediction>, StoreError>;

    /// Returns false (and writes nothing) when the id is taken.
    fn insert_experiment(&self, experiment: &Experiment) -> Result<bool, StoreError>;
    fn get_experiment(&self, experiment_id: &str) -> Result<Option<Experiment>, StoreError>;
    /// Atomic read-modify-write. `apply` returns false to leave the row unchanged and
    /// may run more than once under contention. Returns the row as stored afterwards,
    /// or None when the experiment does not exist.
    fn update_experiment(&self, experiment_id: &str, apply: &mut dyn FnMut(&mut Experiment) -> bool) -> Result<Option<Experiment>, StoreError>;

    fn insert_assignment_if_absent(&self, assignment: Assignment) -> Result<Upserted<Assignment>, StoreError>;
    fn get_assignment(&self, experiment_id: &str, subject_id: &str) -> Result<Option<Assignment>, StoreError>;

    /// Last write wins.
    fn upsert_outcome(&self, outcome: Outcome) -> Result<(), StoreError>;
    fn outcomes_for_experiment(&self, experiment_id: &str) -> Result<Vec<Outcome>, StoreError>;
}

/// Bumps a variant's assigned count. Unknown variants are left alone.
pub fn increment_assigned(store: &dyn Store, experiment_id: &str, variant_id: &str) -> Result<Option<Experiment>, StoreError> {
    store.update_experiment(experiment_id, &mut |exp: &mut Experiment| {
        match exp.variants.iter_mut().find(|v| v.variant_id == variant_id) {
            Some(v) => { v.assigned_count += 1; true }
            None => false,
        }
    })
}
