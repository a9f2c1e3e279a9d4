use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::episode::EpisodeResult;

/// Reward decomposition written to `reward.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub total: f64,
    pub components: BTreeMap<String, f64>,
}

impl RewardBreakdown {
    /// Compute the reward from an episode result. PnL and fees count
    /// positively, gas and time out of range are penalties.
    pub fn from_result(result: &EpisodeResult) -> Self {
        let mut components = BTreeMap::new();
        components.insert("pnl".to_string(), result.pnl_usd);
        components.insert("fees".to_string(), result.fees_usd);
        components.insert("gas_penalty".to_string(), -result.gas_cost_usd);
        if let Some(oor) = result.out_of_range_pct {
            components.insert("range_penalty".to_string(), -oor * 10.0);
        }

        let total = components.values().sum();
        Self { total, components }
    }
}
