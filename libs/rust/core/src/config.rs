//! Layered service configuration: defaults, then an optional file named by
//! `CARESERVE_CONFIG_FILE`, then `CARESERVE__*` environment overrides.

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::allocation::DrawMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend { #[default] Memory, Sled }

#[derive(Debug, Clone, Deserialize)]
pub struct ServingConfig {
    pub service_name: String,
    pub log_level: String,
    pub store: StoreBackend,
    pub store_path: PathBuf,
    pub model_service_url: String,
    pub model_timeout_ms: u64,
    pub assignment_draw: DrawMode,
    #[serde(default)]
    pub bootstrap_file: Option<PathBuf>,
}

impl ServingConfig {
    pub fn model_timeout(&self) -> Duration { Duration::from_millis(self.model_timeout_ms) }
}

pub fn load_config(service: &str) -> Result<ServingConfig> {
    let file = std::env::var("CARESERVE_CONFIG_FILE").ok();
    load_config_from(service, file.as_deref())
}

pub fn load_config_from(service: &str, file: Option<&str>) -> Result<ServingConfig> {
    let mut builder = config::Config::builder()
        .set_default("service_name", service)?
        .set_default("log_level", "info")?
        .set_default("store", "memory")?
        .set_default("store_path", "./data/careserve")?
        .set_default("model_service_url", "http://127.0.0.1:8501")?
        .set_default("model_timeout_ms", 2000)?
        .set_default("assignment_draw", "random")?;
    if let Some(file) = file {
        builder = builder.add_source(config::File::with_name(file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("CARESERVE").separator("__"));
    let cfg: ServingConfig = builder.build()?.try_deserialize()?;
    tracing::debug!(service = %cfg.service_name, store = ?cfg.store, draw = ?cfg.assignment_draw, "configuration loaded");
    Ok(cfg)
}
