use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use super::{Store, Upserted};
use crate::ensemble::{EnsembleConfiguration, EnsemblePrediction};
use crate::error::StoreError;
use crate::experiment::{Assignment, Experiment, Outcome};

type SubjectKey = (String, String);

/// Process-local store. Each map sits behind its own lock; the assignment map's
/// write lock is what makes insert-or-fetch race free.
#[derive(Default)]
pub struct MemoryStore {
    ensembles: RwLock<HashMap<String, EnsembleConfiguration>>,
    predictions: RwLock<Vec<EnsemblePrediction>>,
    experiments: RwLock<HashMap<String, Experiment>>,
    assignments: RwLock<HashMap<SubjectKey, Assignment>>,
    outcomes: RwLock<HashMap<SubjectKey, Outcome>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
}

fn key(experiment_id: &str, subject_id: &str) -> SubjectKey { (experiment_id.to_string(), subject_id.to_string()) }

impl Store for MemoryStore {
    fn insert_ensemble(&self, config: &EnsembleConfiguration) -> Result<bool, StoreError> {
        match self.ensembles.write().entry(config.ensemble_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(v) => { v.insert(config.clone()); Ok(true) }
        }
    }

    fn get_ensemble(&self, ensemble_id: &str) -> Result<Option<EnsembleConfiguration>, StoreError> {
        Ok(self.ensembles.read().get(ensemble_id).cloned())
    }

    fn insert_prediction(&self, prediction: &EnsemblePrediction) -> Result<(), StoreError> {
        self.predictions.write().push(prediction.clone());
        Ok(())
    }

    fn predictions_for_subject(&self, subject_id: &str) -> Result<Vec<EnsemblePrediction>, StoreError> {
        Ok(self.predictions.read().iter().filter(|p| p.subject_id == subject_id).cloned().collect())
    }

    fn insert_experiment(&self, experiment: &Experiment) -> Result<bool, StoreError> {
        match self.experiments.write().entry(experiment.experiment_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(v) => { v.insert(experiment.clone()); Ok(true) }
        }
    }

    fn get_experiment(&self, experiment_id: &str) -> Result<Option<Experiment>, StoreError> {
        Ok(self.experiments.read().get(experiment_id).cloned())
    }

    fn update_experiment(&self, experiment_id: &str, apply: &mut dyn FnMut(&mut Experiment) -> bool) -> Result<Option<Experiment>, StoreError> {
        let mut map = self.experiments.write();
        let Some(current) = map.get_mut(experiment_id) else { return Ok(None) };
        let mut draft = current.clone();
        if apply(&mut draft) { *current = draft; }
        Ok(Some(current.clone()))
    }

    fn insert_assignment_if_absent(&self, assignment: Assignment) -> Result<Upserted<Assignment>, StoreError> {
        match self.assignments.write().entry(key(&assignment.experiment_id, &assignment.subject_id)) {
            Entry::Occupied(o) => Ok(Upserted { row: o.get().clone(), inserted: false }),
            Entry::Vacant(v) => Ok(Upserted { row: v.insert(assignment).clone(), inserted: true }),
        }
    }

    fn get_assignment(&self, experiment_id: &str, subject_id: &str) -> Result<Option<Assignment>, StoreError> {
        Ok(self.assignments.read().get(&key(experiment_id, subject_id)).cloned())
    }

    fn upsert_outcome(&self, outcome: Outcome) -> Result<(), StoreError> {
        self.outcomes.write().insert(key(&outcome.experiment_id, &outcome.subject_id), outcome);
        Ok(())
    }

    fn outcomes_for_experiment(&self, experiment_id: &str) -> Result<Vec<Outcome>, StoreError> {
        Ok(self.outcomes.read().values().filter(|o| o.experiment_id == experiment_id).cloned().collect())
    }
}
