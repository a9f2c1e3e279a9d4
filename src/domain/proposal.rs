use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::metadata::EpisodeMetadata;

/// Whether the agent wants this episode executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Active,
    Skipped,
}

/// The tunable pool configuration for one episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalParams {
    /// Range width in price points around the current tick
    pub width_pts: f64,
    /// Rebalance when price drifts this fraction outside the range
    pub rebalance_threshold_pct: f64,
    /// Quoted spread in basis points
    pub spread_bps: f64,
    /// Order size in base-asset units
    pub order_size: f64,
    /// Quote refresh interval in seconds
    pub refresh_interval_secs: f64,
    /// Maximum position in base-asset units
    pub max_position: f64,
}

impl Default for ProposalParams {
    fn default() -> Self {
        Self {
            width_pts: 200.0,
            rebalance_threshold_pct: 0.05,
            spread_bps: 20.0,
            order_size: 0.1,
            refresh_interval_secs: 60.0,
            max_position: 1.0,
        }
    }
}

impl ProposalParams {
    /// Flatten into the `params_used` map carried on results.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let mut m = BTreeMap::new();
        m.insert("width_pts".to_string(), self.width_pts);
        m.insert(
            "rebalance_threshold_pct".to_string(),
            self.rebalance_threshold_pct,
        );
        m.insert("spread_bps".to_string(), self.spread_bps);
        m.insert("order_size".to_string(), self.order_size);
        m.insert(
            "refresh_interval_secs".to_string(),
            self.refresh_interval_secs,
        );
        m.insert("max_position".to_string(), self.max_position);
        m
    }
}

/// Why the agent decided what it decided: inputs observed, rule fired,
/// thresholds in force. Immutable audit record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionBasis {
    #[serde(default)]
    pub inputs: BTreeMap<String, f64>,
    #[serde(default)]
    pub rule: String,
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,
}

/// What to do for one episode. Immutable after write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub episode_id: String,
    pub generated_at: String,
    pub status: ProposalStatus,
    #[serde(default)]
    pub skip_reason: Option<String>,

    pub chain: String,
    pub network: String,
    #[serde(default)]
    pub pool_address: Option<String>,
    pub pair: String,

    pub params: ProposalParams,

    #[serde(default)]
    pub decision_basis: DecisionBasis,

    pub metadata: EpisodeMetadata,
}
