//! Quality-aware key-value cache with envelopes.
//!
//! The store is a single JSON file owned by the scheduler process
//! (single writer); episode-side readers open their own read-only view
//! and tolerate momentary absence. Writes are copy-on-write with an
//! atomic replace, so readers never observe a half-written file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::registry;
use crate::error::Result;

/// Freshness classification of a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Fresh,
    Stale,
    TooOld,
    Missing,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Fresh => "fresh",
            Quality::Stale => "stale",
            Quality::TooOld => "too_old",
            Quality::Missing => "missing",
        }
    }
}

/// Wrapper that accompanies cached data, carrying freshness metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEnvelope {
    pub ok: bool,
    pub data: Value,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
    pub ttl_seconds: i64,
    pub max_age_seconds: i64,
    #[serde(default)]
    pub error: Option<String>,
    /// Identifies the producer ("scheduler", "seed", "test", ...)
    pub source: String,
}

impl CacheEnvelope {
    pub fn ok(data: Value, ttl_seconds: i64, max_age_seconds: i64, source: &str) -> Self {
        Self {
            ok: true,
            data,
            fetched_at: Some(Utc::now()),
            ttl_seconds,
            max_age_seconds,
            error: None,
            source: source.to_string(),
        }
    }

    pub fn error(error: &str, ttl_seconds: i64, max_age_seconds: i64) -> Self {
        Self {
            ok: false,
            data: Value::Null,
            fetched_at: Some(Utc::now()),
            ttl_seconds,
            max_age_seconds,
            error: Some(error.to_string()),
            source: "error".to_string(),
        }
    }
}

/// Freshness record returned alongside cached data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRecord {
    pub quality: Quality,
    pub age_seconds: Option<i64>,
    pub asof_timestamp: Option<String>,
}

impl QualityRecord {
    pub fn missing() -> Self {
        Self {
            quality: Quality::Missing,
            age_seconds: None,
            asof_timestamp: None,
        }
    }
}

/// Compute quality and age for an envelope at wall time `now`.
pub fn compute_quality(
    envelope: &CacheEnvelope,
    ttl_seconds: i64,
    max_age_seconds: i64,
    now: DateTime<Utc>,
) -> QualityRecord {
    let Some(fetched_at) = envelope.fetched_at else {
        return QualityRecord::missing();
    };
    if !envelope.ok {
        return QualityRecord::missing();
    }

    let age = (now - fetched_at).num_seconds();
    let quality = if age <= ttl_seconds {
        Quality::Fresh
    } else if age <= max_age_seconds {
        Quality::Stale
    } else {
        Quality::TooOld
    };

    QualityRecord {
        quality,
        age_seconds: Some(age),
        asof_timestamp: Some(fetched_at.to_rfc3339()),
    }
}

/// Build the canonical cache key: `dune:<query_key>` followed by
/// `:<param>:<value>` pairs in sorted parameter order. Timestamps never
/// appear in keys; windowed queries use the fixed window labels.
pub fn build_key(query_key: &str, params: &[(&str, &str)]) -> String {
    let mut sorted: Vec<(&str, &str)> = params.to_vec();
    sorted.sort_by_key(|(k, _)| *k);

    let mut key = format!("dune:{query_key}");
    for (k, v) in sorted {
        key.push(':');
        key.push_str(k);
        key.push(':');
        key.push_str(v);
    }
    key
}

/// Map a lookback in minutes onto the fixed window vocabulary
/// (nearest-smaller label).
pub fn window_label_minutes(window_minutes: u32) -> &'static str {
    if window_minutes <= 60 {
        "1h"
    } else if window_minutes <= 360 {
        "6h"
    } else {
        "24h"
    }
}

/// Map a lookback in hours onto the fixed window vocabulary
/// (nearest-smaller label).
pub fn window_label_hours(lookback_hours: u32) -> &'static str {
    if lookback_hours <= 1 {
        "1h"
    } else if lookback_hours <= 6 {
        "6h"
    } else {
        "24h"
    }
}

/// Writer side of the cache. Single owner (the scheduler); keeps the map
/// in memory and persists the whole file on every write via tmp+rename.
pub struct QualityKv {
    path: PathBuf,
    entries: HashMap<String, CacheEnvelope>,
}

impl QualityKv {
    /// Open (or create) the cache file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let entries = read_entries(path).unwrap_or_else(|e| {
            warn!("Could not load cache from {}: {}", path.display(), e);
            HashMap::new()
        });
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&CacheEnvelope> {
        self.entries.get(key)
    }

    /// In-memory view of every entry (writer side only).
    pub fn entries(&self) -> &HashMap<String, CacheEnvelope> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store one envelope. Envelopes are monotonic per key in
    /// `fetched_at`: a write older than the stored one is ignored.
    pub fn set(&mut self, key: &str, envelope: CacheEnvelope) -> Result<()> {
        if self.superseded(key, &envelope) {
            debug!("Ignoring out-of-order envelope for {}", key);
            return Ok(());
        }
        self.entries.insert(key.to_string(), envelope);
        self.persist()
    }

    /// Batch write; persists once.
    pub fn set_many(&mut self, items: Vec<(String, CacheEnvelope)>) -> Result<()> {
        let mut changed = false;
        for (key, envelope) in items {
            if self.superseded(&key, &envelope) {
                debug!("Ignoring out-of-order envelope for {}", key);
                continue;
            }
            self.entries.insert(key, envelope);
            changed = true;
        }
        if changed {
            self.persist()?;
        }
        Ok(())
    }

    fn superseded(&self, key: &str, envelope: &CacheEnvelope) -> bool {
        match (self.entries.get(key).and_then(|e| e.fetched_at), envelope.fetched_at) {
            (Some(existing), Some(new)) => new < existing,
            _ => false,
        }
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&self.entries)?;
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Reader side of the cache. Reloads the on-disk snapshot on demand and
/// tolerates a missing or unreadable file by reporting `missing`.
pub struct QualityKvReader {
    path: PathBuf,
}

impl QualityKvReader {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Load the current snapshot; absent file means empty cache.
    pub fn snapshot(&self) -> HashMap<String, CacheEnvelope> {
        read_entries(&self.path).unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<CacheEnvelope> {
        self.snapshot().remove(key)
    }

    /// Cache-first read with quality metadata. Returns `default` (and
    /// `missing`/`too_old`) when the data is absent or past max age.
    /// TTL and max age come from the registry descriptor.
    pub fn get_with_quality(
        &self,
        query_key: &str,
        default: Value,
        params: &[(&str, &str)],
        now: DateTime<Utc>,
    ) -> (Value, QualityRecord) {
        let Some(descriptor) = registry::lookup(query_key) else {
            return (default, QualityRecord::missing());
        };

        let cache_key = build_key(query_key, params);
        let Some(envelope) = self.get(&cache_key) else {
            return (default, QualityRecord::missing());
        };

        let record = compute_quality(
            &envelope,
            descriptor.ttl_seconds,
            descriptor.max_age_seconds,
            now,
        );

        match record.quality {
            Quality::TooOld | Quality::Missing => (default, record),
            _ => (envelope.data, record),
        }
    }
}

fn read_entries(path: &Path) -> Result<HashMap<String, CacheEnvelope>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
