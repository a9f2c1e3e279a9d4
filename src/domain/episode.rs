use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Execution mode for an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    Mock,
    Real,
}

impl ExecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Mock => "mock",
            ExecMode::Real => "real",
        }
    }
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of an episode. The variants are mutually exclusive:
/// `Skipped` means the episode was gated out cleanly, `Failed` means it
/// ran and broke, `Success` means it executed to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeStatus {
    Success,
    Failed,
    Skipped,
}

/// Quote/simulation envelope attached to a result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationEnvelope {
    pub success: bool,
    #[serde(default)]
    pub simulation_success: bool,
    #[serde(default)]
    pub amount_out: Option<u64>,
    #[serde(default)]
    pub gas_estimate: Option<u64>,
    #[serde(default)]
    pub latency_ms: f64,
    #[serde(default)]
    pub error: Option<String>,
    /// "mock" or "live"
    pub source: String,
    /// Per-step wall timings from the tick-path simulation, if any.
    #[serde(default)]
    pub step_timings_ms: Vec<f64>,
}

/// LP position snapshot after the episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionState {
    pub lower_price: f64,
    pub upper_price: f64,
    pub liquidity: f64,
    pub in_range: bool,
}

/// Result of one executed episode, written to `result.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeResult {
    pub episode_id: String,
    pub run_id: String,
    pub timestamp: String,

    pub status: EpisodeStatus,
    pub exec_mode: ExecMode,

    pub chain: String,
    pub network: String,
    #[serde(default)]
    pub pool_address: Option<String>,

    #[serde(default)]
    pub params_used: BTreeMap<String, f64>,

    #[serde(default)]
    pub simulation: Option<SimulationEnvelope>,

    // Outcome metrics
    #[serde(default)]
    pub pnl_usd: f64,
    #[serde(default)]
    pub fees_usd: f64,
    #[serde(default)]
    pub gas_cost_usd: f64,
    #[serde(default)]
    pub max_drawdown_usd: f64,
    #[serde(default)]
    pub out_of_range_pct: Option<f64>,
    #[serde(default)]
    pub trade_count: u32,

    #[serde(default)]
    pub position_after: Option<PositionState>,

    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,

    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub timings_ms: BTreeMap<String, f64>,
}

impl EpisodeResult {
    /// Minimal skeleton with the mandatory identity fields; callers fill
    /// in metrics and envelopes.
    pub fn skeleton(
        episode_id: &str,
        run_id: &str,
        status: EpisodeStatus,
        exec_mode: ExecMode,
        timestamp: String,
    ) -> Self {
        Self {
            episode_id: episode_id.to_string(),
            run_id: run_id.to_string(),
            timestamp,
            status,
            exec_mode,
            chain: "ethereum".to_string(),
            network: "mainnet".to_string(),
            pool_address: None,
            params_used: BTreeMap::new(),
            simulation: None,
            pnl_usd: 0.0,
            fees_usd: 0.0,
            gas_cost_usd: 0.0,
            max_drawdown_usd: 0.0,
            out_of_range_pct: None,
            trade_count: 0,
            position_after: None,
            error: None,
            errors: Vec::new(),
            latency_ms: None,
            timings_ms: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ExecMode::Mock).unwrap(), "\"mock\"");
        assert_eq!(serde_json::to_string(&ExecMode::Real).unwrap(), "\"real\"");
    }

    #[test]
    fn status_round_trips() {
        for s in [
            EpisodeStatus::Success,
            EpisodeStatus::Failed,
            EpisodeStatus::Skipped,
        ] {
            let json = serde_json::to_string(&s).unwrap();
            let back: EpisodeStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, s);
        }
    }

    #[test]
    fn result_skeleton_deserializes_with_defaults() {
        let json = r#"{
            "episode_id": "ep_20250101_000000_0",
            "run_id": "run_20250101_000000",
            "timestamp": "2025-01-01T00:00:00Z",
            "status": "success",
            "exec_mode": "mock",
            "chain": "ethereum",
            "network": "mainnet"
        }"#;
        let result: EpisodeResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.status, EpisodeStatus::Success);
        assert_eq!(result.trade_count, 0);
        assert!(result.simulation.is_none());
    }
}
