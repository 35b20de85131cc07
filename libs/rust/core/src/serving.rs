//! Model serving contract and the HTTP client used against the remote model server.
//!
//! The engine treats a model as a black box returning a probability. Implementations
//! may fail or be slow; callers degrade rather than abort (see `ensemble`).

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::model_registry::ModelRegistry;

#[async_trait]
pub trait ModelServing: Send + Sync {
    /// Probability in [0,1] for the given feature vector.
    async fn predict(&self, model_id: &str, features: &[f64]) -> Result<f64>;
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> { features: &'a [f64] }

#[derive(Debug, Deserialize)]
struct PredictResponse { probability: f64 }

/// Talks to a model server exposing `POST /models/{id}/predict` and `GET /models/{id}`.
/// The request timeout is owned here, not by the engine.
#[derive(Clone)]
pub struct HttpModelService {
    base_url: String,
    client: reqwest::Client,
}

impl HttpModelService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), client })
    }

    fn model_url(&self, model_id: &str) -> String { format!("{}/models/{}", self.base_url, model_id) }
    fn predict_url(&self, model_id: &str) -> String { format!("{}/predict", self.model_url(model_id)) }
}

#[async_trait]
impl ModelServing for HttpModelService {
    async fn predict(&self, model_id: &str, features: &[f64]) -> Result<f64> {
        let resp = self.client
            .post(self.predict_url(model_id))
            .json(&PredictRequest { features })
            .send().await?
            .error_for_status()?;
        let body: PredictResponse = resp.json().await?;
        if !body.probability.is_finite() { return Err(anyhow!("model {model_id} returned non-finite probability")); }
        Ok(body.probability)
    }
}

#[async_trait]
impl ModelRegistry for HttpModelService {
    async fn exists(&self, model_id: &str) -> bool {
        match self.client.get(self.model_url(model_id)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => { warn!(model_id, error = ?e, "model registry lookup failed"); false }
        }
    }
}
