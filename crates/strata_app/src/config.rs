//! Session configuration.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Configuration for a demo session, read from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Worlds to create pools for. The first one becomes current.
    pub worlds: Vec<String>,
    /// Whether components replicate unless declared otherwise.
    pub replicate_components_by_default: bool,
    /// Whether events replicate unless declared otherwise.
    pub replicate_events_by_default: bool,
    /// Sector simulation delta bound while the sector is unloaded.
    pub sector_unloaded_max_delta: u64,
    /// Sector simulation delta bound while the sector is loaded.
    pub sector_loaded_max_delta: u64,
    /// Number of simulation ticks to run.
    pub ticks: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            worlds: vec!["overworld".to_string()],
            replicate_components_by_default: false,
            replicate_events_by_default: true,
            sector_unloaded_max_delta: 1_000,
            sector_loaded_max_delta: 50,
            ticks: 10,
        }
    }
}

impl AppConfig {
    /// Load from `path`, or the defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Parse from a JSON document. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Override the tick count.
    #[must_use]
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.ticks = ticks;
        self
    }
}
