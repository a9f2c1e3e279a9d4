//! Event-driven refresh triggers.
//!
//! The trigger log is an append-only JSONL file: producers (intelligence,
//! operator tooling) append lines, the scheduler drains and truncates it
//! at tick boundaries. Crash-safe without an in-process message bus.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

use crate::error::Result;
use crate::intel::registry::{self, Priority, QueryScope};

/// One advisory refresh request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub query_key: Option<String>,
    #[serde(default)]
    pub pool_address: Option<String>,
    #[serde(default)]
    pub pair: Option<String>,
    pub priority: Priority,
}

/// Append trigger lines to the log.
pub fn append_triggers(path: &Path, triggers: &[Trigger]) -> Result<()> {
    if triggers.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    for trigger in triggers {
        let line = serde_json::to_string(trigger)?;
        writeln!(f, "{line}")?;
    }
    Ok(())
}

/// Append one trigger per enabled P0/P1 query touching the given
/// pool/pair (the default trigger fan-out used by the intel layer).
pub fn append_default_triggers(
    path: &Path,
    reason: &str,
    pool_address: Option<&str>,
    pair: Option<&str>,
) -> Result<()> {
    let now = Utc::now();
    let triggers: Vec<Trigger> = registry::enabled_queries()
        .filter(|q| matches!(q.priority, Priority::P0 | Priority::P1))
        .map(|q| {
            let (pool_param, pair_param) = match q.scope {
                QueryScope::Pool => (pool_address.map(str::to_string), None),
                QueryScope::Pair => (None, pair.map(str::to_string)),
                QueryScope::Windowed => (
                    pool_address.map(str::to_string),
                    pair.map(str::to_string),
                ),
                QueryScope::Global => (None, None),
            };
            Trigger {
                timestamp: now,
                reason: reason.to_string(),
                query_key: Some(q.key.to_string()),
                pool_address: pool_param,
                pair: pair_param,
                priority: q.priority,
            }
        })
        .collect();

    append_triggers(path, &triggers)?;
    info!(
        "Triggered refresh: {} ({} queries)",
        reason,
        triggers.len()
    );
    Ok(())
}

/// Read and clear the trigger log. Malformed lines are skipped without
/// aborting the tick; triggers past the horizon are discarded.
pub fn drain_triggers(path: &Path, horizon_secs: i64, now: DateTime<Utc>) -> Vec<Trigger> {
    if !path.exists() {
        return Vec::new();
    }

    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Failed to read trigger log: {}", e);
            return Vec::new();
        }
    };

    // Truncate: consumed at tick boundary.
    if let Err(e) = fs::write(path, b"") {
        warn!("Failed to truncate trigger log: {}", e);
    }

    let horizon = Duration::seconds(horizon_secs);
    let mut triggers = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Trigger>(line) {
            Ok(trigger) => {
                if now - trigger.timestamp <= horizon {
                    triggers.push(trigger);
                } else {
                    info!("Discarding expired trigger: {}", trigger.reason);
                }
            }
            Err(e) => {
                warn!("Invalid trigger line skipped: {}", e);
            }
        }
    }
    triggers
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn trigger(reason: &str, age_secs: i64) -> Trigger {
        Trigger {
            timestamp: Utc::now() - Duration::seconds(age_secs),
            reason: reason.to_string(),
            query_key: Some("gas_regime".to_string()),
            pool_address: None,
            pair: None,
            priority: Priority::P0,
        }
    }

    #[test]
    fn drain_returns_and_truncates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("triggers.jsonl");
        append_triggers(&path, &[trigger("out_of_range", 0)]).unwrap();

        let drained = drain_triggers(&path, 600, Utc::now());
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].reason, "out_of_range");

        // Log consumed; a second drain sees nothing.
        assert!(drain_triggers(&path, 600, Utc::now()).is_empty());
    }

    #[test]
    fn expired_triggers_are_discarded() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("triggers.jsonl");
        append_triggers(&path, &[trigger("old", 700), trigger("new", 10)]).unwrap();

        let drained = drain_triggers(&path, 600, Utc::now());
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].reason, "new");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("triggers.jsonl");
        append_triggers(&path, &[trigger("good", 0)]).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "{{ half written").unwrap();
        }
        append_triggers(&path, &[trigger("also_good", 0)]).unwrap();

        let drained = drain_triggers(&path, 600, Utc::now());
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn default_fan_out_covers_enabled_p0_p1_queries() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("triggers.jsonl");
        append_default_triggers(&path, "volatility_spike", Some("0xABC"), Some("WETH-USDC"))
            .unwrap();

        let drained = drain_triggers(&path, 600, Utc::now());
        let expected = registry::enabled_queries()
            .filter(|q| matches!(q.priority, Priority::P0 | Priority::P1))
            .count();
        assert_eq!(drained.len(), expected);
        assert!(drained
            .iter()
            .any(|t| t.query_key.as_deref() == Some("pool_metrics")));
    }
}
