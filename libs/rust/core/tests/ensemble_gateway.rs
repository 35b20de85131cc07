use async_trait::async_trait;
use careserve_core::{
    CombinationType, EnsembleRequest, Features, HashDraw, InMemoryModelRegistry, MemoryStore, ModelServing,
    PredictionGateway, RiskLevel, ServingError, SledStore, Store, VotingStrategy,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Fixed score per model id. Unknown ids fail; `echo` returns the first input.
struct FakeModels(HashMap<String, f64>);

#[async_trait]
impl ModelServing for FakeModels {
    async fn predict(&self, model_id: &str, features: &[f64]) -> anyhow::Result<f64> {
        if model_id == "echo" { return features.first().copied().ok_or_else(|| anyhow::anyhow!("no input")); }
        self.0.get(model_id).copied().ok_or_else(|| anyhow::anyhow!("{model_id} unavailable"))
    }
}

fn gateway_with(store: Arc<dyn Store>) -> PredictionGateway {
    let registry = Arc::new(InMemoryModelRegistry::with_models(["high", "low", "mid", "down", "down2", "wild", "echo"]));
    let models = Arc::new(FakeModels(HashMap::from([
        ("high".to_string(), 0.9),
        ("low".to_string(), 0.1),
        ("mid".to_string(), 0.5),
        ("wild".to_string(), 1.7),
    ])));
    PredictionGateway::new(registry, models, store, Arc::new(HashDraw))
}

fn gateway() -> PredictionGateway { gateway_with(Arc::new(MemoryStore::new())) }

fn features() -> Features { Features::from([("age".to_string(), 0.64), ("lactate".to_string(), 0.2)]) }

fn ids(ids: &[&str]) -> Vec<String> { ids.iter().map(|s| s.to_string()).collect() }

#[tokio::test]
async fn split_members_average_to_midpoint() {
    let gw = gateway();
    let id = gw.register_ensemble(EnsembleRequest::new(CombinationType::Averaging, ids(&["high", "low"]))).await.unwrap();
    let out = gw.predict(&id, "patient-1", &features()).await.unwrap();
    assert!((out.ensemble_score - 0.5).abs() < 1e-12);
    assert!((out.confidence - 0.8).abs() < 1e-12);
    assert_eq!(out.risk_level, RiskLevel::Medium);
    assert_eq!(out.member_scores.len(), 2);
    assert!(!out.degraded);
    assert!(out.decision);
}

#[tokio::test]
async fn weighted_voting_uses_normalized_weights() {
    let gw = gateway();
    let id = gw.register_ensemble(EnsembleRequest::new(CombinationType::WeightedVoting, ids(&["low", "high"])).with_weights(vec![1.0, 3.0])).await.unwrap();
    let cfg = gw.store().get_ensemble(&id).unwrap().unwrap();
    assert_eq!(cfg.weights, Some(vec![0.25, 0.75]));
    let out = gw.predict(&id, "patient-3", &features()).await.unwrap();
    assert!((out.ensemble_score - 0.7).abs() < 1e-12);
    assert!(!out.degraded);
}

#[tokio::test]
async fn boosting_ranks_members_by_score() {
    let gw = gateway();
    // listed out of rank order; boosting ranks by score
    let id = gw.register_ensemble(EnsembleRequest::new(CombinationType::Boosting, ids(&["low", "high", "mid"]))).await.unwrap();
    let out = gw.predict(&id, "patient-4", &features()).await.unwrap();
    let expected = 0.9 * 0.5 + 0.5 * 0.3 + 0.1 * 0.2;
    assert!((out.ensemble_score - expected).abs() < 1e-12);
    assert_eq!(out.member_scores.len(), 3);
    assert!(!out.degraded);
}

#[tokio::test]
async fn failed_members_are_substituted_and_flagged() {
    let gw = gateway();
    let id = gw.register_ensemble(EnsembleRequest::new(CombinationType::Averaging, ids(&["high", "down"]))).await.unwrap();
    let out = gw.predict(&id, "patient-1", &features()).await.unwrap();
    assert!((out.ensemble_score - 0.7).abs() < 1e-12);
    assert_eq!(out.member_scores["down"], 0.5);
    assert!(out.degraded);
    assert_eq!(out.failed_members, vec!["down".to_string()]);
}

#[tokio::test]
async fn total_outage_still_answers() {
    let gw = gateway();
    let id = gw.register_ensemble(EnsembleRequest::new(CombinationType::Voting, ids(&["down", "down2", "wild"])).with_voting(VotingStrategy::Majority)).await.unwrap();
    let out = gw.predict(&id, "patient-2", &features()).await.unwrap();
    assert!((out.ensemble_score - 0.5).abs() < 1e-12);
    assert_eq!(out.failed_members.len(), 3);
    assert!(out.degraded);
    assert!(out.member_scores.values().all(|s| *s == 0.5));
}

#[tokio::test]
async fn stacking_feeds_meta_model_and_falls_back() {
    let gw = gateway();
    // echo returns the first stacked input, i.e. the first member score
    let stacked = gw.register_ensemble(EnsembleRequest::new(CombinationType::Stacking, ids(&["low", "high"])).with_meta_model("echo")).await.unwrap();
    let out = gw.predict(&stacked, "p", &features()).await.unwrap();
    assert!((out.ensemble_score - 0.1).abs() < 1e-12);
    assert!(!out.degraded);

    let broken = gw.register_ensemble(EnsembleRequest::new(CombinationType::Stacking, ids(&["low", "high"])).with_meta_model("down")).await.unwrap();
    let out = gw.predict(&broken, "p", &features()).await.unwrap();
    assert!((out.ensemble_score - 0.5).abs() < 1e-12);
    assert!(out.degraded);
    assert_eq!(out.failed_members, vec!["down".to_string()]);
}

#[tokio::test]
async fn registration_validates_before_writing() {
    let gw = gateway();
    let unknown = EnsembleRequest::new(CombinationType::Averaging, ids(&["high", "ghost"])).with_id("ens-x");
    assert!(matches!(gw.register_ensemble(unknown).await, Err(ServingError::Validation(_))));
    assert!(gw.store().get_ensemble("ens-x").unwrap().is_none());

    let ok = EnsembleRequest::new(CombinationType::Boosting, ids(&["high", "mid", "low"])).with_id("ens-x");
    assert_eq!(gw.register_ensemble(ok.clone()).await.unwrap(), "ens-x");
    assert!(matches!(gw.register_ensemble(ok).await, Err(ServingError::Validation(_))));

    let missing = gw.predict("nope", "p", &features()).await.unwrap_err();
    assert!(missing.is_not_found());
}

#[tokio::test]
async fn history_is_newest_first_and_survives_reopen() {
    let db = sled::Config::new().temporary(true).open().unwrap();
    let gw = gateway_with(Arc::new(SledStore::from_db(db.clone()).unwrap()));
    let id = gw.register_ensemble(EnsembleRequest::new(CombinationType::WeightedAveraging, ids(&["low", "high"])).with_weights(vec![1.0, 3.0])).await.unwrap();
    let first = gw.predict(&id, "patient-9", &features()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = gw.predict(&id, "patient-9", &features()).await.unwrap();
    assert!((first.ensemble_score - 0.7).abs() < 1e-12);

    let reopened = gateway_with(Arc::new(SledStore::from_db(db).unwrap()));
    let history = reopened.prediction_history("patient-9").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].prediction_id, second.prediction_id);
    assert_eq!(history[1].prediction_id, first.prediction_id);
}
