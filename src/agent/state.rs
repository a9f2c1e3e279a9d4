//! Persisted learning state: per-regime parameter beliefs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::warn;

use crate::error::Result;

/// Gaussian belief over one tunable parameter, clamped to documented
/// bounds when sampled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDistribution {
    pub name: String,
    pub mean: f64,
    pub std_dev: f64,
    pub min_val: f64,
    pub max_val: f64,
    pub sample_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParameterDistribution>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl RegimeState {
    pub fn new(regime: &str) -> Self {
        Self {
            regime: regime.to_string(),
            params: BTreeMap::new(),
            last_updated: None,
        }
    }
}

/// The agent's full belief store, persisted as a single JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningState {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub regimes: BTreeMap<String, RegimeState>,
}

impl LearningState {
    /// Load from disk; a missing or unreadable file yields the default
    /// (readers tolerate absence, no implicit initialization on disk).
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
        {
            Ok(state) => state,
            Err(e) => {
                warn!("Could not load learning state from {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Persist atomically (tmp + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(self)?;
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// The learnable parameter table: (name, min, max, default).
pub const LEARNABLE_PARAMS: &[(&str, f64, f64, f64)] = &[
    ("width_pts", 5.0, 5000.0, 200.0),
    ("rebalance_threshold_pct", 0.01, 0.5, 0.05),
    ("spread_bps", 1.0, 500.0, 20.0),
    ("order_size", 0.01, 5.0, 0.1),
    ("refresh_interval_secs", 10.0, 300.0, 60.0),
];
