//! Runtime configuration.
//!
//! Defaults, then an optional JSON file named by `ENGINE_CONFIG_PATH`, then
//! individual environment overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_RETRY_DELAY_MS: u64 = 150;
const DEFAULT_PERSIST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Fixed pause before the single batch-update retry.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Deadline for the timeout-bounded persist variant.
    #[serde(default = "default_persist_timeout_secs")]
    pub persist_timeout_secs: u64,
    /// PostgREST schema sent as `Accept-Profile` / `Content-Profile`.
    #[serde(default = "default_schema")]
    pub supabase_schema: String,
    #[serde(default = "default_line_items_table")]
    pub line_items_table: String,
    /// JSON file of `{ structure_id: [line items] }` used to seed the
    /// in-memory store when Supabase is not configured.
    #[serde(default)]
    pub seed_path: Option<PathBuf>,
}

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_string()
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_persist_timeout_secs() -> u64 {
    DEFAULT_PERSIST_TIMEOUT_SECS
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_line_items_table() -> String {
    "report_line_items".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            persist_timeout_secs: DEFAULT_PERSIST_TIMEOUT_SECS,
            supabase_schema: default_schema(),
            line_items_table: default_line_items_table(),
            seed_path: None,
        }
    }
}

impl EngineConfig {
    /// Load from `ENGINE_CONFIG_PATH` (if set) and apply env overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("ENGINE_CONFIG_PATH") {
            Ok(path) => Self::load_from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config: {:?}", path))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse engine config: {:?}", path))?;
        info!("Loaded engine config from {:?}", path);
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(addr) = lookup("BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(ms) = lookup("REORDER_RETRY_DELAY_MS") {
            self.retry_delay_ms = ms
                .parse()
                .with_context(|| format!("REORDER_RETRY_DELAY_MS is not a number: {}", ms))?;
        }
        if let Some(secs) = lookup("REORDER_PERSIST_TIMEOUT_SECS") {
            self.persist_timeout_secs = secs.parse().with_context(|| {
                format!("REORDER_PERSIST_TIMEOUT_SECS is not a number: {}", secs)
            })?;
        }
        if let Some(schema) = lookup("SUPABASE_SCHEMA") {
            self.supabase_schema = schema;
        }
        if let Some(path) = lookup("SEED_PATH") {
            self.seed_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_secs(self.persist_timeout_secs)
    }
}
