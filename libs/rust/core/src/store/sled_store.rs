use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::info;

use super::{Store, Upserted};
use crate::ensemble::{EnsembleConfiguration, EnsemblePrediction};
use crate::error::StoreError;
use crate::experiment::{Assignment, Experiment, Outcome};

const SEP: char = '\u{1f}';

/// Durable store on sled. One tree per record kind, JSON values.
/// Keys: `ensemble_id`, `experiment_id`, `subject_id␟prediction_id`, `experiment_id␟subject_id`.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    ensembles: sled::Tree,
    predictions: sled::Tree,
    experiments: sled::Tree,
    assignments: sled::Tree,
    outcomes: sled::Tree,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> { Ok(serde_json::to_vec(value)?) }
fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> { Ok(serde_json::from_slice(bytes)?) }
fn pair_key(a: &str, b: &str) -> String { format!("{a}{SEP}{b}") }
fn prefix(a: &str) -> String { format!("{a}{SEP}") }

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "sled store opened");
        Self::from_db(db)
    }

    /// Throwaway database removed on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    /// Opens the engine's trees on an existing handle.
    pub fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            ensembles: db.open_tree("ensembles")?,
            predictions: db.open_tree("predictions")?,
            experiments: db.open_tree("experiments")?,
            assignments: db.open_tree("assignments")?,
            outcomes: db.open_tree("outcomes")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<(), StoreError> { self.db.flush()?; Ok(()) }

    fn scan<T: DeserializeOwned>(tree: &sled::Tree, key_prefix: &str) -> Result<Vec<T>, StoreError> {
        tree.scan_prefix(key_prefix.as_bytes())
            .map(|kv| { let (_, v) = kv?; decode(&v) })
            .collect()
    }

    fn get<T: DeserializeOwned>(tree: &sled::Tree, key: &str) -> Result<Option<T>, StoreError> {
        tree.get(key.as_bytes())?.map(|v| decode(&v)).transpose()
    }
}

impl Store for SledStore {
    fn insert_ensemble(&self, config: &EnsembleConfiguration) -> Result<bool, StoreError> {
        let swapped = self.ensembles.compare_and_swap(config.ensemble_id.as_bytes(), None::<&[u8]>, Some(encode(config)?))?;
        Ok(swapped.is_ok())
    }

    fn get_ensemble(&self, ensemble_id: &str) -> Result<Option<EnsembleConfiguration>, StoreError> {
        Self::get(&self.ensembles, ensemble_id)
    }

    fn insert_prediction(&self, prediction: &EnsemblePrediction) -> Result<(), StoreError> {
        self.predictions.insert(pair_key(&prediction.subject_id, &prediction.prediction_id).as_bytes(), encode(prediction)?)?;
        Ok(())
    }

    fn predictions_for_subject(&self, subject_id: &str) -> Result<Vec<EnsemblePrediction>, StoreError> {
        Self::scan(&self.predictions, &prefix(subject_id))
    }

    fn insert_experiment(&self, experiment: &Experiment) -> Result<bool, StoreError> {
        let swapped = self.experiments.compare_and_swap(experiment.experiment_id.as_bytes(), None::<&[u8]>, Some(encode(experiment)?))?;
        Ok(swapped.is_ok())
    }

    fn get_experiment(&self, experiment_id: &str) -> Result<Option<Experiment>, StoreError> {
        Self::get(&self.experiments, experiment_id)
    }

    fn update_experiment(&self, experiment_id: &str, apply: &mut dyn FnMut(&mut Experiment) -> bool) -> Result<Option<Experiment>, StoreError> {
        let stored = self.experiments.update_and_fetch(experiment_id.as_bytes(), |old| {
            let old = old?;
            let Ok(mut exp) = serde_json::from_slice::<Experiment>(old) else { return Some(old.to_vec()) };
            if !apply(&mut exp) { return Some(old.to_vec()); }
            Some(serde_json::to_vec(&exp).unwrap_or_else(|_| old.to_vec()))
        })?;
        stored.map(|v| decode(&v)).transpose()
    }

    fn insert_assignment_if_absent(&self, assignment: Assignment) -> Result<Upserted<Assignment>, StoreError> {
        let key = pair_key(&assignment.experiment_id, &assignment.subject_id);
        match self.assignments.compare_and_swap(key.as_bytes(), None::<&[u8]>, Some(encode(&assignment)?))? {
            Ok(()) => Ok(Upserted { row: assignment, inserted: true }),
            Err(conflict) => match conflict.current {
                Some(current) => Ok(Upserted { row: decode(&current)?, inserted: false }),
                // only reachable if the row vanished between the CAS attempt and now
                None => self.insert_assignment_if_absent(assignment),
            },
        }
    }

    fn get_assignment(&self, experiment_id: &str, subject_id: &str) -> Result<Option<Assignment>, StoreError> {
        Self::get(&self.assignments, &pair_key(experiment_id, subject_id))
    }

    fn upsert_outcome(&self, outcome: Outcome) -> Result<(), StoreError> {
        self.outcomes.insert(pair_key(&outcome.experiment_id, &outcome.subject_id).as_bytes(), encode(&outcome)?)?;
        Ok(())
    }

    fn outcomes_for_experiment(&self, experiment_id: &str) -> Result<Vec<Outcome>, StoreError> {
        Self::scan(&self.outcomes, &prefix(experiment_id))
    }
}
