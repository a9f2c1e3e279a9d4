//! Market intelligence layer — cache-first reads over the quality KV.
//!
//! All accessors read from the cache ONLY; the background scheduler
//! refreshes entries. Every access records quality metadata into an
//! in-instance snapshot that the harness embeds into episode metadata.
//! Accessors never issue a network call; missing data comes back as
//! defaults tagged `missing`. An accessor MAY append to the trigger log
//! to request a background refresh.

pub mod cache;
pub mod registry;

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::domain::{IntelHygiene, IntelSnapshotEntry};
use crate::scheduler::triggers;
use cache::{window_label_hours, window_label_minutes, QualityKvReader, QualityRecord};

/// Pool health summary combining cached metrics and swap-derived signals.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PoolHealth {
    pub volatility: f64,
    pub volume: f64,
    pub avg_liquidity: f64,
    pub tradeable: bool,
    pub reason: String,
    pub market_regime: String,
    pub timestamp: String,
}

/// Cache-first intelligence facade used synchronously by agent and
/// harness.
pub struct MarketIntel {
    reader: QualityKvReader,
    snapshot: Mutex<BTreeMap<String, IntelSnapshotEntry>>,
    trigger_file: Option<PathBuf>,
}

impl MarketIntel {
    pub fn new(cache_file: &Path) -> Self {
        Self {
            reader: QualityKvReader::new(cache_file),
            snapshot: Mutex::new(BTreeMap::new()),
            trigger_file: None,
        }
    }

    /// Enable trigger-file appends from `trigger_refresh`.
    pub fn with_trigger_file(mut self, trigger_file: &Path) -> Self {
        self.trigger_file = Some(trigger_file.to_path_buf());
        self
    }

    fn record(&self, key: &str, record: &QualityRecord) {
        let entry = IntelSnapshotEntry {
            quality: record.quality,
            age_seconds: record.age_seconds,
            asof_timestamp: record.asof_timestamp.clone(),
        };
        let mut snap = self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        snap.insert(key.to_string(), entry);
    }

    /// The harness calls this after its decision step to embed
    /// `metadata.extra["intel_snapshot"]`.
    pub fn snapshot(&self) -> BTreeMap<String, IntelSnapshotEntry> {
        self.snapshot
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Aggregate hygiene over the current snapshot.
    pub fn hygiene(&self) -> IntelHygiene {
        IntelHygiene::from_snapshot(&self.snapshot())
    }

    /// Annualized realized volatility from cached swap rows. Returns 0.0
    /// when fewer than 10 swaps are available.
    pub fn get_volatility(&self, pair: &str, window_minutes: u32) -> (f64, QualityRecord) {
        let label = window_label_minutes(window_minutes);
        let (rows, q) = self.reader.get_with_quality(
            "swaps_for_pair",
            json!([]),
            &[("pair", pair), ("window", label)],
            Utc::now(),
        );
        self.record(&format!("swaps_for_pair:{pair}:{label}"), &q);

        let swaps = dominant_pool_rows(rows);
        if swaps.len() < 10 {
            return (0.0, q);
        }

        let mut log_returns = Vec::with_capacity(swaps.len() - 1);
        for pair_of_rows in swaps.windows(2) {
            let s1 = num_field(&pair_of_rows[0], "sqrt_price_x96");
            let s2 = num_field(&pair_of_rows[1], "sqrt_price_x96");
            if s1 > 0.0 && s2 > 0.0 {
                log_returns.push(2.0 * (s2 / s1).ln());
            }
        }
        if log_returns.is_empty() {
            return (0.0, q);
        }

        let variance =
            log_returns.iter().map(|r| r * r).sum::<f64>() / log_returns.len() as f64;
        let std_dev = variance.sqrt();
        let periods_per_year = (365.0 * 24.0 * 60.0) / window_minutes.max(1) as f64;
        let annualized = std_dev * periods_per_year.sqrt();

        self.record(&format!("volatility:{pair}:{label}"), &q);
        (annualized, q)
    }

    /// Comprehensive pool health check. Reads pool metrics from the
    /// cache; when the metrics are empty, derives them from swap rows.
    pub fn get_pool_health(
        &self,
        pool_address: &str,
        pair: &str,
        lookback_hours: u32,
    ) -> PoolHealth {
        let label = window_label_hours(lookback_hours);
        let (metrics_value, qm) = self.reader.get_with_quality(
            "pool_metrics",
            json!({}),
            &[("pool_address", pool_address), ("window", label)],
            Utc::now(),
        );
        self.record(&format!("pool_metrics:{pool_address}:{label}"), &qm);

        let mut metrics = metrics_value;
        let metrics_empty = num_field(&metrics, "avg_liquidity") == 0.0
            && num_field(&metrics, "total_volume0") == 0.0;

        if metrics_empty {
            let (rows, swaps_q) = self.reader.get_with_quality(
                "swaps_for_pair",
                json!([]),
                &[
                    ("pair", pair),
                    ("pool_address", pool_address),
                    ("window", label),
                ],
                Utc::now(),
            );
            self.record(
                &format!("swaps_for_pair_pool:{pair}:{pool_address}:{label}"),
                &swaps_q,
            );

            let swaps = dominant_pool_rows(rows);
            if !swaps.is_empty() {
                metrics = derive_metrics_from_swaps(&swaps);
                self.record(
                    &format!("pool_metrics_fallback:{pool_address}:{label}"),
                    &swaps_q,
                );
            }
        }

        let minutes_label = window_label_minutes(lookback_hours * 60);
        let (volatility, vq) = self.get_volatility(pair, lookback_hours * 60);
        self.record(&format!("volatility:{pair}:{minutes_label}"), &vq);

        let volume = num_field(&metrics, "total_volume0");
        let avg_liquidity = num_field(&metrics, "avg_liquidity");
        let market_regime = classify_regime(volatility, avg_liquidity);

        let (tradeable, reason) = if volatility > 2.0 {
            (false, "Volatility too high".to_string())
        } else if avg_liquidity < 1e6 && volume < 1e5 {
            (false, "Liquidity & volume too low".to_string())
        } else if volume < 1e4 {
            (false, "Volume too low (dead pool)".to_string())
        } else {
            (true, "Market conditions favorable".to_string())
        };

        PoolHealth {
            volatility,
            volume,
            avg_liquidity,
            tradeable,
            reason,
            market_regime,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Gas optimization signal (cache-first).
    pub fn get_gas_regime(&self) -> Value {
        let (rows, q) =
            self.reader
                .get_with_quality("gas_regime", json!([]), &[], Utc::now());
        self.record("gas_regime", &q);
        first_row(rows)
    }

    /// MEV sandwich protection data (cache-first).
    pub fn get_mev_risk(&self, pool_address: &str) -> Value {
        let default = json!([{ "risk_level": "LOW", "reason": "No data" }]);
        let (rows, q) = self.reader.get_with_quality(
            "mev_risk",
            default,
            &[("pool_address", pool_address)],
            Utc::now(),
        );
        self.record(&format!("mev_risk:{pool_address}"), &q);
        first_row(rows)
    }

    /// Automated rebalancing signal (cache-first).
    pub fn get_range_hint(&self, pool_address: &str) -> Value {
        let (rows, q) = self.reader.get_with_quality(
            "rebalance_hint",
            json!([]),
            &[("pool_address", pool_address)],
            Utc::now(),
        );
        self.record(&format!("rebalance_hint:{pool_address}"), &q);
        first_row(rows)
    }

    /// Composite pool health score (cache-first).
    pub fn get_pool_health_score(&self, pool_address: &str) -> Value {
        let (rows, q) = self.reader.get_with_quality(
            "pool_health_score",
            json!([]),
            &[("pool_address", pool_address)],
            Utc::now(),
        );
        self.record(&format!("pool_health_score:{pool_address}"), &q);
        first_row(rows)
    }

    /// Liquidity depth heatmap rows (cache-first).
    pub fn get_liquidity_heatmap(&self, pool_address: &str) -> Vec<Value> {
        let (rows, q) = self.reader.get_with_quality(
            "liquidity_depth",
            json!([]),
            &[("pool_address", pool_address)],
            Utc::now(),
        );
        self.record(&format!("liquidity_depth:{pool_address}"), &q);
        rows.as_array().cloned().unwrap_or_default()
    }

    /// Institutional wallet tracking (cache-first).
    pub fn get_whale_sentiment(&self, pair: &str) -> Value {
        let (rows, q) = self.reader.get_with_quality(
            "whale_sentiment",
            json!([]),
            &[("pair", pair)],
            Utc::now(),
        );
        self.record(&format!("whale_sentiment:{pair}"), &q);
        first_row(rows)
    }

    /// Analytics-optimized strategy configuration (cache-first).
    pub fn get_dynamic_config(&self) -> Value {
        let (rows, q) =
            self.reader
                .get_with_quality("dynamic_config", json!([]), &[], Utc::now());
        self.record("dynamic_config", &q);
        first_row(rows)
    }

    /// Request a background refresh of P0/P1 queries touching the given
    /// pool/pair. Advisory: the scheduler picks the trigger up at its
    /// next tick boundary.
    pub fn trigger_refresh(&self, reason: &str, pool_address: Option<&str>, pair: Option<&str>) {
        let Some(path) = &self.trigger_file else {
            return;
        };
        if let Err(e) = triggers::append_default_triggers(path, reason, pool_address, pair) {
            warn!("Failed to write refresh triggers: {}", e);
        }
    }
}

fn first_row(rows: Value) -> Value {
    match rows {
        Value::Array(items) => items.into_iter().next().unwrap_or(json!({})),
        Value::Object(_) => rows,
        _ => json!({}),
    }
}

/// Numeric field access tolerating string-encoded numbers.
fn num_field(row: &Value, field: &str) -> f64 {
    match row.get(field) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Keep only rows from the dominant pool when rows carry a pool_id.
fn dominant_pool_rows(rows: Value) -> Vec<Value> {
    let Some(items) = rows.as_array() else {
        return Vec::new();
    };
    let items = items.clone();

    if !items.iter().any(|r| r.get("pool_id").is_some()) {
        return items;
    }

    let mut counts: HashMap<String, usize> = HashMap::new();
    for row in &items {
        if let Some(id) = row.get("pool_id").and_then(Value::as_str) {
            *counts.entry(id.to_string()).or_default() += 1;
        }
    }
    let Some((dominant, _)) = counts.into_iter().max_by_key(|(_, c)| *c) else {
        return items;
    };
    items
        .into_iter()
        .filter(|r| r.get("pool_id").and_then(Value::as_str) == Some(dominant.as_str()))
        .collect()
}

fn derive_metrics_from_swaps(swaps: &[Value]) -> Value {
    let mut total_volume = 0.0;
    let mut liquidity_values = Vec::new();

    for s in swaps {
        total_volume += num_field(s, "amount1").abs();
        if s.get("liquidity").is_some() {
            liquidity_values.push(num_field(s, "liquidity"));
        }
    }
    let avg_liquidity = if liquidity_values.is_empty() {
        0.0
    } else {
        liquidity_values.iter().sum::<f64>() / liquidity_values.len() as f64
    };

    let last_price = swaps.first().map_or(0.0, |s| {
        let a0 = num_field(s, "amount0").abs();
        let a1 = num_field(s, "amount1").abs();
        if a0 > 0.0 {
            a1 / a0
        } else {
            0.0
        }
    });

    json!({
        "avg_liquidity": avg_liquidity,
        "total_volume0": total_volume,
        "total_volume1": total_volume,
        "swap_count": swaps.len(),
        "price": last_price,
        "_derived_from_swaps": true,
    })
}

/// Classify the market regime from micro signals.
fn classify_regime(volatility: f64, liquidity: f64) -> String {
    let vol = if volatility > 1.0 { "high_vol" } else { "low_vol" };
    let liq = if liquidity > 1e7 {
        "high_liquidity"
    } else {
        "low_liquidity"
    };
    format!("{vol}_{liq}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intel::cache::{build_key, CacheEnvelope, Quality, QualityKv};
    use tempfile::TempDir;

    fn seed(store: &mut QualityKv, query_key: &str, params: &[(&str, &str)], data: Value) {
        let descriptor = registry::lookup(query_key).unwrap();
        let key = build_key(query_key, params);
        store
            .set(
                &key,
                CacheEnvelope::ok(
                    data,
                    descriptor.ttl_seconds,
                    descriptor.max_age_seconds,
                    "test",
                ),
            )
            .unwrap();
    }

    fn swap_rows(n: usize) -> Value {
        let rows: Vec<Value> = (0..n)
            .map(|i| {
                json!({
                    "sqrt_price_x96": format!("{}", 1_000_000_000u64 + (i as u64) * 1_000),
                    "amount0": "1.0",
                    "amount1": "2000.0",
                    "liquidity": "5000000",
                })
            })
            .collect();
        json!(rows)
    }

    #[test]
    fn cold_cache_decision_capture_records_seven_entries() {
        let tmp = TempDir::new().unwrap();
        let intel = MarketIntel::new(&tmp.path().join("cache.json"));
        let pool = "0x88e6A0c2dDD26FEEb64F039a2c41296FcB3f5640";

        intel.get_gas_regime();
        intel.get_pool_health(pool, "WETH-USDC", 1);
        intel.get_mev_risk(pool);
        intel.get_range_hint(pool);

        let snapshot = intel.snapshot();
        assert_eq!(snapshot.len(), 7);
        for entry in snapshot.values() {
            assert_eq!(entry.quality, Quality::Missing);
        }
        assert!(snapshot.contains_key("gas_regime"));
        assert!(snapshot.contains_key(&format!("pool_metrics:{pool}:1h")));
        assert!(snapshot.contains_key(&format!("swaps_for_pair_pool:WETH-USDC:{pool}:1h")));
        assert!(snapshot.contains_key("swaps_for_pair:WETH-USDC:1h"));
        assert!(snapshot.contains_key("volatility:WETH-USDC:1h"));
        assert!(snapshot.contains_key(&format!("mev_risk:{pool}")));
        assert!(snapshot.contains_key(&format!("rebalance_hint:{pool}")));

        let hygiene = intel.hygiene();
        assert_eq!(hygiene.total_queries, 7);
        assert_eq!(hygiene.missing_or_too_old_count, 7);
        assert_eq!(hygiene.fresh_percent, 0.0);
    }

    #[test]
    fn volatility_comes_from_cached_swaps() {
        let tmp = TempDir::new().unwrap();
        let cache_file = tmp.path().join("cache.json");
        let mut store = QualityKv::open(&cache_file).unwrap();
        seed(
            &mut store,
            "swaps_for_pair",
            &[("pair", "WETH-USDC"), ("window", "1h")],
            swap_rows(20),
        );

        let intel = MarketIntel::new(&cache_file);
        let (vol, record) = intel.get_volatility("WETH-USDC", 60);
        assert!(vol > 0.0);
        assert_eq!(record.quality, Quality::Fresh);
        assert!(intel.snapshot().contains_key("volatility:WETH-USDC:1h"));
    }

    #[test]
    fn too_few_swaps_yield_zero_volatility() {
        let tmp = TempDir::new().unwrap();
        let cache_file = tmp.path().join("cache.json");
        let mut store = QualityKv::open(&cache_file).unwrap();
        seed(
            &mut store,
            "swaps_for_pair",
            &[("pair", "WETH-USDC"), ("window", "1h")],
            swap_rows(3),
        );

        let intel = MarketIntel::new(&cache_file);
        let (vol, _) = intel.get_volatility("WETH-USDC", 60);
        assert_eq!(vol, 0.0);
    }

    #[test]
    fn pool_health_uses_metrics_when_present() {
        let tmp = TempDir::new().unwrap();
        let cache_file = tmp.path().join("cache.json");
        let pool = "0xpool";
        let mut store = QualityKv::open(&cache_file).unwrap();
        seed(
            &mut store,
            "pool_metrics",
            &[("pool_address", pool), ("window", "1h")],
            json!({ "avg_liquidity": 2e7, "total_volume0": 5e5 }),
        );

        let intel = MarketIntel::new(&cache_file);
        let health = intel.get_pool_health(pool, "WETH-USDC", 1);
        assert!(health.tradeable);
        assert_eq!(health.market_regime, "low_vol_high_liquidity");
        // Non-empty metrics: the swap-derived fallback is not consulted.
        assert!(!intel
            .snapshot()
            .contains_key(&format!("swaps_for_pair_pool:WETH-USDC:{pool}:1h")));
    }

    #[test]
    fn dead_pool_is_not_tradeable() {
        let tmp = TempDir::new().unwrap();
        let cache_file = tmp.path().join("cache.json");
        let pool = "0xpool";
        let mut store = QualityKv::open(&cache_file).unwrap();
        seed(
            &mut store,
            "pool_metrics",
            &[("pool_address", pool), ("window", "1h")],
            json!({ "avg_liquidity": 2e7, "total_volume0": 5e3 }),
        );

        let intel = MarketIntel::new(&cache_file);
        let health = intel.get_pool_health(pool, "WETH-USDC", 1);
        assert!(!health.tradeable);
        assert_eq!(health.reason, "Volume too low (dead pool)");
    }

    #[test]
    fn simple_accessors_return_first_row_and_record_quality() {
        let tmp = TempDir::new().unwrap();
        let cache_file = tmp.path().join("cache.json");
        let pool = "0xpool";
        let mut store = QualityKv::open(&cache_file).unwrap();
        seed(
            &mut store,
            "pool_health_score",
            &[("pool_address", pool)],
            json!([{ "score": 85, "status": "healthy" }]),
        );
        seed(
            &mut store,
            "liquidity_depth",
            &[("pool_address", pool)],
            json!([{ "tick": -60, "liquidity": "1000000" }, { "tick": 0, "liquidity": "2000000" }]),
        );

        let intel = MarketIntel::new(&cache_file);
        let score = intel.get_pool_health_score(pool);
        assert_eq!(score["score"], 85);

        let heatmap = intel.get_liquidity_heatmap(pool);
        assert_eq!(heatmap.len(), 2);

        // Not seeded: defaults plus a missing tag, never an error.
        let sentiment = intel.get_whale_sentiment("WETH-USDC");
        assert_eq!(sentiment, json!({}));
        let dyn_config = intel.get_dynamic_config();
        assert_eq!(dyn_config, json!({}));
        let mev = intel.get_mev_risk(pool);
        assert_eq!(mev["risk_level"], "LOW");

        let snapshot = intel.snapshot();
        assert_eq!(
            snapshot[&format!("pool_health_score:{pool}")].quality,
            Quality::Fresh
        );
        assert_eq!(
            snapshot[&format!("liquidity_depth:{pool}")].quality,
            Quality::Fresh
        );
        assert_eq!(
            snapshot["whale_sentiment:WETH-USDC"].quality,
            Quality::Missing
        );
        assert_eq!(snapshot["dynamic_config"].quality, Quality::Missing);
    }

    #[test]
    fn dominant_pool_filter_keeps_majority_rows() {
        let rows = json!([
            { "pool_id": "a", "sqrt_price_x96": "1" },
            { "pool_id": "a", "sqrt_price_x96": "2" },
            { "pool_id": "b", "sqrt_price_x96": "3" },
        ]);
        let kept = dominant_pool_rows(rows);
        assert_eq!(kept.len(), 2);
    }
}
