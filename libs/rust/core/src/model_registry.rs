//! Model registry contract plus an in-process registry of known model versions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Answers whether a model id can be served. Consulted before an ensemble is persisted.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn exists(&self, model_id: &str) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor { pub id: String, pub version: String, pub registered_at: DateTime<Utc> }

#[derive(Default)]
pub struct InMemoryModelRegistry {
    models: RwLock<HashMap<String, ModelDescriptor>>,
}

impl InMemoryModelRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn with_models<I, S>(ids: I) -> Self
    where I: IntoIterator<Item = S>, S: Into<String> {
        let reg = Self::new();
        for id in ids { reg.register(id, "1"); }
        reg
    }

    /// Registers (or re-versions) a model.
    pub fn register(&self, id: impl Into<String>, version: impl Into<String>) {
        let id = id.into();
        let desc = ModelDescriptor { id: id.clone(), version: version.into(), registered_at: Utc::now() };
        self.models.write().insert(id, desc);
    }

    pub fn get(&self, id: &str) -> Option<ModelDescriptor> { self.models.read().get(id).cloned() }
    pub fn list(&self) -> Vec<ModelDescriptor> {
        let mut out: Vec<_> = self.models.read().values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

#[async_trait]
impl ModelRegistry for InMemoryModelRegistry {
    async fn exists(&self, model_id: &str) -> bool { self.models.read().contains_key(model_id) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_models_exist() {
        let reg = InMemoryModelRegistry::with_models(["sepsis-v2", "readmit-v1"]);
        assert!(reg.exists("sepsis-v2").await);
        assert!(!reg.exists("unknown").await);
        reg.register("sepsis-v2", "3");
        assert_eq!(reg.get("sepsis-v2").unwrap().version, "3");
        assert_eq!(reg.list().len(), 2);
    }
}
