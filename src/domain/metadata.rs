use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::episode::ExecMode;
use crate::intel::cache::Quality;

/// Per-query freshness record captured at decision time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelSnapshotEntry {
    pub quality: Quality,
    #[serde(default)]
    pub age_seconds: Option<i64>,
    #[serde(default)]
    pub asof_timestamp: Option<String>,
}

/// Aggregate freshness summary derived from a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntelHygiene {
    pub total_queries: usize,
    pub fresh_count: usize,
    pub stale_count: usize,
    pub missing_or_too_old_count: usize,
    /// Percent in [0, 100], rounded to one decimal.
    pub fresh_percent: f64,
}

impl IntelHygiene {
    /// Derive the hygiene summary from a snapshot map.
    pub fn from_snapshot(snapshot: &BTreeMap<String, IntelSnapshotEntry>) -> Self {
        let total = snapshot.len();
        let fresh = snapshot
            .values()
            .filter(|e| e.quality == Quality::Fresh)
            .count();
        let stale = snapshot
            .values()
            .filter(|e| e.quality == Quality::Stale)
            .count();
        let missing_or_too_old = total - fresh - stale;
        let fresh_percent = if total > 0 {
            (1000.0 * fresh as f64 / total as f64).round() / 10.0
        } else {
            0.0
        };
        Self {
            total_queries: total,
            fresh_count: fresh,
            stale_count: stale,
            missing_or_too_old_count: missing_or_too_old,
            fresh_percent,
        }
    }
}

/// Provenance record present for every episode, written to `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeMetadata {
    pub episode_id: String,
    pub run_id: String,
    pub timestamp: String,

    pub config_hash: String,
    pub agent_version: String,
    pub exec_mode: ExecMode,

    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub regime_key: Option<String>,

    // Learning hygiene visibility
    #[serde(default)]
    pub learning_update_applied: bool,
    #[serde(default)]
    pub learning_update_reason: Option<String>,

    // Ops/debug
    #[serde(default)]
    pub gateway_health: Option<String>,
    #[serde(default)]
    pub gateway_latency_ms: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,

    /// Carries `intel_snapshot`, `intel_hygiene`, `intel_inputs`.
    #[serde(default)]
    pub extra: Map<String, Value>,
}
