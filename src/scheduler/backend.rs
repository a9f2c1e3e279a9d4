//! External analytics backend callers.
//!
//! The backend is opaque to the rest of the system: a method name plus
//! parameters in, rows out. Timeouts and errors are the scheduler's
//! responsibility to convert into envelopes.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{LabError, Result};

#[async_trait]
pub trait AnalyticsBackend: Send + Sync {
    /// Identifies the producer in cache envelopes.
    fn name(&self) -> &str;

    /// Execute one query. Implementations block on the network; the
    /// scheduler wraps calls in a per-job timeout.
    async fn query(&self, method: &str, params: &BTreeMap<String, String>) -> Result<Value>;
}

/// Deterministic synthetic backend. Row shapes mirror the real provider
/// so the whole refresh path is exercisable offline; values are derived
/// from a stable hash of (method, params) so repeated queries agree.
pub struct MockAnalyticsBackend;

impl MockAnalyticsBackend {
    fn stable_hash(method: &str, params: &BTreeMap<String, String>) -> u64 {
        // FNV-1a over the canonical parameter string.
        let mut h: u64 = 0xcbf29ce484222325;
        let mut feed = |s: &str| {
            for b in s.bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
        };
        feed(method);
        for (k, v) in params {
            feed(k);
            feed(v);
        }
        h
    }
}

#[async_trait]
impl AnalyticsBackend for MockAnalyticsBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn query(&self, method: &str, params: &BTreeMap<String, String>) -> Result<Value> {
        let h = Self::stable_hash(method, params);
        debug!("Mock analytics query: {} {:?}", method, params);

        let rows = match method {
            "get_gas_regime" => json!([{
                "median_gwei": 10 + (h % 40),
                "fast_gwei": 20 + (h % 60),
                "regime": if h % 3 == 0 { "cheap" } else { "normal" },
            }]),
            "get_swaps_for_pair" => {
                let base = 1_000_000_000_000u64 + (h % 1_000_000);
                let rows: Vec<Value> = (0..30)
                    .map(|i| {
                        let drift = ((h >> (i % 32)) % 2_000) as i64 - 1_000;
                        json!({
                            "sqrt_price_x96": format!("{}", base as i64 + drift * (i as i64 + 1)),
                            "amount0": format!("{:.6}", 0.5 + (h % 100) as f64 / 100.0),
                            "amount1": format!("{:.2}", 1000.0 + (h % 2000) as f64),
                            "liquidity": format!("{}", 2_000_000 + (h % 8_000_000)),
                        })
                    })
                    .collect();
                json!(rows)
            }
            "get_pool_metrics" => json!({
                "avg_liquidity": 5_000_000.0 + (h % 20_000_000) as f64,
                "total_volume0": 200_000.0 + (h % 800_000) as f64,
                "total_volume1": 200_000.0 + (h % 800_000) as f64,
                "swap_count": 40 + (h % 400),
                "price": 1800.0 + (h % 600) as f64,
            }),
            "get_pool_health_score" => json!([{
                "score": 60 + (h % 40),
                "status": if h % 5 == 0 { "degraded" } else { "healthy" },
            }]),
            "get_rebalance_hint" => json!([{
                "action": if h % 4 == 0 { "rebalance" } else { "hold" },
                "drift_pct": (h % 100) as f64 / 10.0,
            }]),
            "get_mev_risk" => json!([{
                "risk_level": if h % 7 == 0 { "HIGH" } else { "LOW" },
                "sandwich_count_24h": h % 12,
            }]),
            "get_toxic_flow_index" => json!([{
                "toxic_percentage": (h % 300) as f64 / 10.0,
            }]),
            "get_jit_liquidity_monitor" => json!([{
                "jit_events_24h": h % 6,
            }]),
            "get_whale_sentiment" => json!([{
                "net_whale_flow_usd": (h % 2_000_000) as f64 - 1_000_000.0,
            }]),
            "get_dynamic_fee_analysis" | "get_fee_tier_optimization" => json!([{
                "best_fee_tier": if h % 2 == 0 { "500" } else { "3000" },
                "volume_share": (h % 100) as f64 / 100.0,
            }]),
            "get_liquidity_depth" | "get_liquidity_competition" => {
                let rows: Vec<Value> = (0..10)
                    .map(|i| {
                        json!({
                            "tick": (i as i64 - 5) * 60,
                            "liquidity": format!("{}", 1_000_000 + (h >> i) % 5_000_000),
                        })
                    })
                    .collect();
                json!(rows)
            }
            "get_dynamic_config" => json!([{
                "spread_bps": 10 + (h % 40),
                "refresh_interval": 30 + (h % 90),
            }]),
            _ => json!([]),
        };

        Ok(rows)
    }
}

/// HTTP caller for the hosted analytics provider. One POST per query;
/// the provider resolves the method name to a saved query server-side.
pub struct HttpAnalyticsBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpAnalyticsBackend {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl AnalyticsBackend for HttpAnalyticsBackend {
    fn name(&self) -> &str {
        "dune"
    }

    async fn query(&self, method: &str, params: &BTreeMap<String, String>) -> Result<Value> {
        let url = format!("{}/query/{}", self.base_url, method);
        let response = self
            .client
            .post(&url)
            .header("X-Api-Key", &self.api_key)
            .json(&json!({ "params": params }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(LabError::Backend {
                method: method.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let body: Value = response.json().await?;
        match body.get("rows") {
            Some(rows) => Ok(rows.clone()),
            None => Err(LabError::Backend {
                method: method.to_string(),
                reason: "response missing rows".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_backend_is_deterministic() {
        let backend = MockAnalyticsBackend;
        let mut params = BTreeMap::new();
        params.insert("pool_address".to_string(), "0xABC".to_string());
        params.insert("window".to_string(), "1h".to_string());

        let a = backend.query("get_pool_metrics", &params).await.unwrap();
        let b = backend.query("get_pool_metrics", &params).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn mock_backend_varies_by_params() {
        let backend = MockAnalyticsBackend;
        let mut p1 = BTreeMap::new();
        p1.insert("pool_address".to_string(), "0xAAA".to_string());
        let mut p2 = BTreeMap::new();
        p2.insert("pool_address".to_string(), "0xBBB".to_string());

        let a = backend.query("get_pool_metrics", &p1).await.unwrap();
        let b = backend.query("get_pool_metrics", &p2).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn mock_swaps_have_enough_rows_for_volatility() {
        let backend = MockAnalyticsBackend;
        let mut params = BTreeMap::new();
        params.insert("pair".to_string(), "WETH-USDC".to_string());
        params.insert("window".to_string(), "1h".to_string());

        let rows = backend.query("get_swaps_for_pair", &params).await.unwrap();
        assert!(rows.as_array().unwrap().len() >= 10);
    }

    #[tokio::test]
    async fn unknown_method_returns_empty_rows() {
        let backend = MockAnalyticsBackend;
        let rows = backend
            .query("get_nonexistent", &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(rows, json!([]));
    }
}
