use async_trait::async_trait;
use careserve_core::{
    AllocationStrategy, Analysis, ExperimentConfig, ExperimentStatus, InMemoryModelRegistry, MemoryStore,
    ModelServing, PredictionGateway, RandomDraw, ServingError, SledStore, Store, VariantSpec,
};
use std::collections::HashMap;
use std::sync::Arc;

struct NoModels;

#[async_trait]
impl ModelServing for NoModels {
    async fn predict(&self, model_id: &str, _features: &[f64]) -> anyhow::Result<f64> { anyhow::bail!("{model_id} not served") }
}

fn gateway(store: Arc<dyn Store>) -> PredictionGateway {
    PredictionGateway::new(Arc::new(InMemoryModelRegistry::new()), Arc::new(NoModels), store, Arc::new(RandomDraw))
}

fn two_arms() -> ExperimentConfig {
    ExperimentConfig::new("readmission-v3", vec![VariantSpec::new("control", "rf-v2").control(), VariantSpec::new("challenger", "gbm-v3")], 40)
}

#[tokio::test]
async fn full_experiment_flow() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let gw = gateway(store.clone());
    let id = gw.create_experiment(two_arms()).await.unwrap();
    assert_eq!(gw.assign_variant(&id, "p0").await.unwrap(), None);
    gw.start_experiment(&id).await.unwrap();
    assert!(matches!(gw.start_experiment(&id).await, Err(ServingError::InvalidState(_))));

    let mut assigned = HashMap::new();
    for i in 0..40 {
        let subject = format!("p{i}");
        let variant = gw.assign_variant(&id, &subject).await.unwrap().unwrap();
        assert_eq!(gw.assign_variant(&id, &subject).await.unwrap().as_deref(), Some(variant.as_str()));
        let score = if variant == "challenger" { 0.8 } else { 0.4 };
        gw.record_outcome(&id, &subject, score, Some(1.0)).await.unwrap();
        *assigned.entry(variant).or_insert(0u64) += 1;
    }
    // outcome without assignment is dropped
    gw.record_outcome(&id, "stranger", 0.99, None).await.unwrap();

    let results = gw.get_results(&id).await.unwrap();
    assert_eq!(results.variants.iter().map(|v| v.assigned_count).sum::<u64>(), 40);
    for v in &results.variants {
        assert_eq!(v.assigned_count, assigned.get(&v.variant_id).copied().unwrap_or(0));
        assert_eq!(v.metrics.sample_size as u64, v.assigned_count);
    }
    let both_arms = results.variants.iter().all(|v| v.metrics.sample_size > 0);
    match &results.analysis {
        Analysis::Complete(report) => {
            assert!(both_arms);
            assert_eq!(report.best_variant, "challenger");
            assert_eq!(report.comparison_variant, "control");
            assert!(report.significant);
            assert_eq!(report.total_samples, 40);
            assert!(report.should_conclude);
        }
        Analysis::InsufficientVariants { .. } => assert!(!both_arms),
    }

    gw.stop_experiment(&id).await.unwrap();
    let stopped = gw.get_results(&id).await.unwrap();
    assert_eq!(stopped.status, ExperimentStatus::Completed);
    assert!(stopped.ended_at.is_some());
    assert_eq!(gw.assign_variant(&id, "p0").await.unwrap(), None);
    assert!(gw.stop_experiment("missing").await.unwrap_err().is_not_found());
    assert!(gw.get_results("missing").await.unwrap_err().is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_first_assignments_agree() {
    let store: Arc<dyn Store> = Arc::new(SledStore::temporary().unwrap());
    let gw = Arc::new(gateway(store.clone()));
    let cfg = two_arms().with_allocation(AllocationStrategy::Gradual);
    let id = gw.create_experiment(cfg).await.unwrap();
    gw.start_experiment(&id).await.unwrap();

    let tasks: Vec<_> = (0..16).map(|_| {
        let gw = gw.clone();
        let id = id.clone();
        tokio::spawn(async move { gw.assign_variant(&id, "same-subject").await.unwrap().unwrap() })
    }).collect();
    let mut seen = Vec::new();
    for t in tasks { seen.push(t.await.unwrap()); }
    assert!(seen.windows(2).all(|w| w[0] == w[1]));

    let exp = store.get_experiment(&id).unwrap().unwrap();
    assert_eq!(exp.variants.iter().map(|v| v.assigned_count).sum::<u64>(), 1);
    assert_eq!(store.get_assignment(&id, "same-subject").unwrap().unwrap().variant_id, seen[0]);
}

#[tokio::test]
async fn custom_allocation_never_draws_omitted_arm() {
    let gw = gateway(Arc::new(MemoryStore::new()));
    let cfg = two_arms().with_custom_weights(HashMap::from([("control".to_string(), 1.0)]));
    let id = gw.create_experiment(cfg).await.unwrap();
    gw.start_experiment(&id).await.unwrap();
    for i in 0..200 {
        assert_eq!(gw.assign_variant(&id, &format!("s{i}")).await.unwrap().as_deref(), Some("control"));
    }
    let results = gw.get_results(&id).await.unwrap();
    assert_eq!(results.variants[1].assigned_count, 0);
    assert_eq!(results.variants[1].weight, 0.0);
}
