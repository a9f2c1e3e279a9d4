//! Immutable episode artifact bundles.
//!
//! Handles episode folder creation and atomic writing of:
//! - proposal.json
//! - metadata.json (deep-merge on rewrite)
//! - result.json
//! - failure.json
//! - timings.json
//! - reward.json
//! - logs.jsonl (append-only)
//!
//! Every write lands via tmp file + rename within the episode directory,
//! so a crash mid-write leaves the previous version intact.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::warn;

use crate::domain::{
    EpisodeMetadata, EpisodeResult, ExecMode, Proposal, RewardBreakdown,
};
use crate::error::{LabError, Result};

static LOG_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Failure record written to `failure.json` on any per-episode error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureArtifact {
    pub stage: String,
    pub error: String,
    pub exit_code: i32,
    pub config_hash: String,
    pub agent_version: String,
    pub exec_mode: ExecMode,
    pub timestamp: String,
}

/// Writer for one episode's artifact directory under
/// `<base>/runs/<run_id>/episodes/<episode_id>/`.
pub struct EpisodeArtifacts {
    run_id: String,
    episode_id: String,
    episode_dir: PathBuf,
}

impl EpisodeArtifacts {
    pub fn new(base_dir: &Path, run_id: &str, episode_id: &str) -> Self {
        let episode_dir = base_dir
            .join("runs")
            .join(run_id)
            .join("episodes")
            .join(episode_id);
        Self {
            run_id: run_id.to_string(),
            episode_id: episode_id.to_string(),
            episode_dir,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn episode_id(&self) -> &str {
        &self.episode_id
    }

    pub fn episode_dir(&self) -> &Path {
        &self.episode_dir
    }

    /// Creates the episode directory if it doesn't exist.
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.episode_dir)?;
        Ok(())
    }

    /// Atomic JSON write: tmp file in the same directory, fsync, rename.
    fn write_json<T: Serialize>(&self, filename: &str, data: &T) -> Result<()> {
        let value =
            serde_json::to_value(data).map_err(|e| LabError::Schema(e.to_string()))?;
        self.write_value(filename, &value)
    }

    fn write_value(&self, filename: &str, value: &Value) -> Result<()> {
        let path = self.episode_dir.join(filename);
        let tmp_path = self.episode_dir.join(format!("{filename}.tmp"));

        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| LabError::Schema(e.to_string()))?;

        {
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn write_proposal(&self, proposal: &Proposal) -> Result<()> {
        self.ensure_directories()?;
        self.write_json("proposal.json", proposal)
    }

    /// Write metadata.json, optionally deep-merging with the existing
    /// file so earlier keys (e.g. a prior `extra.intel_snapshot`) survive.
    pub fn write_metadata(&self, metadata: &EpisodeMetadata, merge_existing: bool) -> Result<()> {
        self.ensure_directories()?;
        let mut value =
            serde_json::to_value(metadata).map_err(|e| LabError::Schema(e.to_string()))?;

        if merge_existing {
            let path = self.episode_dir.join("metadata.json");
            if path.exists() {
                match fs::read_to_string(&path)
                    .map_err(LabError::from)
                    .and_then(|s| {
                        serde_json::from_str::<Value>(&s)
                            .map_err(|e| LabError::Schema(e.to_string()))
                    }) {
                    Ok(existing) => {
                        value = deep_merge(existing, value);
                    }
                    Err(e) => {
                        warn!("Could not merge existing metadata.json: {}", e);
                    }
                }
            }
        }

        self.write_value("metadata.json", &value)
    }

    pub fn write_result(&self, result: &EpisodeResult) -> Result<()> {
        self.ensure_directories()?;
        self.write_json("result.json", result)
    }

    pub fn write_reward(&self, reward: &RewardBreakdown) -> Result<()> {
        self.ensure_directories()?;
        self.write_json("reward.json", reward)
    }

    pub fn write_timings(&self, timings: &BTreeMap<String, f64>) -> Result<()> {
        self.ensure_directories()?;
        self.write_json("timings.json", timings)
    }

    /// Writes failure.json. Called on any per-episode failure path.
    pub fn write_failure(&self, failure: &FailureArtifact) -> Result<()> {
        self.ensure_directories()?;
        self.write_json("failure.json", failure)
    }

    /// Append one `{event, payload}` line to logs.jsonl. Writes hold a
    /// process-local lock; a crash mid-line leaves the file parseable up
    /// to the last complete line.
    pub fn log_event(&self, event: &str, payload: Value) -> Result<()> {
        self.ensure_directories()?;
        let path = self.episode_dir.join("logs.jsonl");
        let entry = json!({ "event": event, "payload": payload });
        let line = serde_json::to_string(&entry)
            .map_err(|e| LabError::Schema(e.to_string()))?;

        let lock = LOG_LOCK.get_or_init(|| Mutex::new(()));
        let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());

        let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}

/// Append a line to the run-level campaign log.
pub fn append_campaign_log(base_dir: &Path, run_id: &str, line: &str) -> Result<()> {
    let run_dir = base_dir.join("runs").join(run_id);
    fs::create_dir_all(&run_dir)?;
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(run_dir.join("campaign.log"))?;
    writeln!(f, "{line}")?;
    Ok(())
}

/// Deep merge two JSON values: nested maps merge recursively, arrays are
/// replaced, scalars in `src` win at leaves.
pub fn deep_merge(dst: Value, src: Value) -> Value {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            let mut merged: Map<String, Value> = dst_map;
            for (k, v) in src_map {
                let entry = merged.remove(&k);
                let new_val = match entry {
                    Some(existing) => deep_merge(existing, v),
                    None => v,
                };
                merged.insert(k, new_val);
            }
            Value::Object(merged)
        }
        (_, src) => src,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExecMode;
    use serde_json::json;
    use tempfile::TempDir;

    fn metadata(episode_id: &str) -> EpisodeMetadata {
        EpisodeMetadata {
            episode_id: episode_id.to_string(),
            run_id: "run_20250101_000000".to_string(),
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            config_hash: "abcd1234".to_string(),
            agent_version: "v1.0".to_string(),
            exec_mode: ExecMode::Mock,
            seed: Some(42),
            regime_key: None,
            learning_update_applied: false,
            learning_update_reason: None,
            gateway_health: None,
            gateway_latency_ms: None,
            notes: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn deep_merge_prefers_src_at_leaves_and_merges_maps() {
        let dst = json!({
            "a": 1,
            "extra": { "intel_snapshot": { "gas_regime": { "quality": "fresh" } } }
        });
        let src = json!({
            "a": 2,
            "extra": { "intel_hygiene": { "total_queries": 7 } }
        });
        let merged = deep_merge(dst, src);
        assert_eq!(merged["a"], 2);
        assert_eq!(
            merged["extra"]["intel_snapshot"]["gas_regime"]["quality"],
            "fresh"
        );
        assert_eq!(merged["extra"]["intel_hygiene"]["total_queries"], 7);
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let merged = deep_merge(json!({ "xs": [1, 2, 3] }), json!({ "xs": [9] }));
        assert_eq!(merged["xs"], json!([9]));
    }

    #[test]
    fn metadata_merge_preserves_prior_extra_keys() {
        let tmp = TempDir::new().unwrap();
        let artifacts = EpisodeArtifacts::new(tmp.path(), "run_x", "ep_x");

        let mut first = metadata("ep_x");
        first.extra.insert(
            "intel_snapshot".to_string(),
            json!({ "gas_regime": { "quality": "missing" } }),
        );
        artifacts.write_metadata(&first, false).unwrap();

        let mut second = metadata("ep_x");
        second.notes = Some("harness pass".to_string());
        second
            .extra
            .insert("intel_hygiene".to_string(), json!({ "total_queries": 7 }));
        artifacts.write_metadata(&second, true).unwrap();

        let raw =
            fs::read_to_string(artifacts.episode_dir().join("metadata.json")).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["notes"], "harness pass");
        assert_eq!(
            value["extra"]["intel_snapshot"]["gas_regime"]["quality"],
            "missing"
        );
        assert_eq!(value["extra"]["intel_hygiene"]["total_queries"], 7);
    }

    #[test]
    fn atomic_write_leaves_no_tmp_file() {
        let tmp = TempDir::new().unwrap();
        let artifacts = EpisodeArtifacts::new(tmp.path(), "run_x", "ep_x");
        artifacts.write_metadata(&metadata("ep_x"), false).unwrap();

        assert!(artifacts.episode_dir().join("metadata.json").exists());
        assert!(!artifacts.episode_dir().join("metadata.json.tmp").exists());
    }

    #[test]
    fn stray_tmp_file_does_not_break_subsequent_writes() {
        let tmp = TempDir::new().unwrap();
        let artifacts = EpisodeArtifacts::new(tmp.path(), "run_x", "ep_x");
        artifacts.ensure_directories().unwrap();

        // Simulate a crash between tmp creation and rename.
        fs::write(
            artifacts.episode_dir().join("metadata.json.tmp"),
            b"{ partial",
        )
        .unwrap();

        artifacts.write_metadata(&metadata("ep_x"), false).unwrap();
        let raw =
            fs::read_to_string(artifacts.episode_dir().join("metadata.json")).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["config_hash"], "abcd1234");
    }

    #[test]
    fn log_events_append_parseable_lines() {
        let tmp = TempDir::new().unwrap();
        let artifacts = EpisodeArtifacts::new(tmp.path(), "run_x", "ep_x");

        artifacts
            .log_event("episode_start", json!({ "seed": 42 }))
            .unwrap();
        artifacts
            .log_event("episode_complete", json!({ "status": "success" }))
            .unwrap();

        let raw = fs::read_to_string(artifacts.episode_dir().join("logs.jsonl")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "episode_start");
        assert_eq!(first["payload"]["seed"], 42);
    }
}
