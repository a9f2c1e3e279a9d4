//! Proposal agents.
//!
//! The pipeline only depends on the `ProposalAgent` trait: given an
//! episode and run id, produce a proposal (the orchestrator writes the
//! artifacts). `LearningAgent` is the bundled implementation: it keeps
//! per-regime Gaussian beliefs over the tunable parameters, updates them
//! from episode rewards with a windowed elite-mean rule, and samples the
//! next configuration from the beliefs for the sensed regime.

pub mod state;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::domain::{
    iso_utc_z, stable_hash64, DecisionBasis, EpisodeMetadata, ExecMode, Proposal,
    ProposalParams, ProposalStatus, RewardBreakdown,
};
use crate::error::Result;
use crate::intel::MarketIntel;
use state::{LearningState, ParameterDistribution, RegimeState, LEARNABLE_PARAMS};

/// Sliding window of recent episodes used for belief updates.
const UPDATE_WINDOW: usize = 20;
/// Fraction of the window treated as elites.
const ELITE_FRACTION: f64 = 0.25;
/// Smoothing factor between old and new belief moments.
const SMOOTH_ALPHA: f64 = 0.5;

/// External collaborator contract: emit a proposal for one episode and
/// absorb the outcome afterwards.
pub trait ProposalAgent: Send {
    fn version(&self) -> &str;

    fn config_hash(&self) -> &str;

    /// Produce the proposal for `(episode_id, run_id)`.
    fn propose(&mut self, episode_id: &str, run_id: &str) -> Result<Proposal>;

    /// Feed an episode outcome back into the agent's history.
    fn observe(&mut self, proposal: &Proposal, reward: &RewardBreakdown);
}

struct HistoryRecord {
    regime: String,
    params: BTreeMap<String, f64>,
    reward: f64,
}

/// Regime-aware learning agent with persisted beliefs.
pub struct LearningAgent {
    environment: String,
    learn_from_mock: bool,
    seed: u64,
    agent_version: String,
    config_hash: String,
    pool_address: Option<String>,
    pair: String,
    state_path: PathBuf,
    state: LearningState,
    history: Vec<HistoryRecord>,
    intel: MarketIntel,
}

impl LearningAgent {
    pub fn new(config: &AppConfig, seed: u64) -> Self {
        let state_path = Path::new(&config.pipeline.base_dir).join("learning_state.json");
        let state = LearningState::load(&state_path);
        let config_hash = crate::domain::short_hash(&format!(
            "{}|{}|{}|{}",
            config.pipeline.environment,
            config.pipeline.default_pair,
            config.pipeline.default_pool.as_deref().unwrap_or(""),
            config.intel.source,
        ));
        info!(
            "Learning agent initialized (state version {}, {} regimes)",
            state.version,
            state.regimes.len()
        );
        Self {
            environment: config.exec_environment().to_string(),
            learn_from_mock: config.pipeline.learn_from_mock,
            seed,
            agent_version: config.pipeline.agent_version.clone(),
            config_hash,
            pool_address: config.pipeline.default_pool.clone(),
            pair: config.pipeline.default_pair.clone(),
            state_path,
            state,
            history: Vec::new(),
            intel: MarketIntel::new(Path::new(&config.intel.cache_file)),
        }
    }

    fn exec_mode(&self) -> ExecMode {
        if self.environment == "real" {
            ExecMode::Real
        } else {
            ExecMode::Mock
        }
    }

    /// Windowed elite-mean update of the per-regime beliefs. Returns
    /// false when learning hygiene blocks the update.
    fn update_beliefs(&mut self) -> (bool, Option<String>) {
        if self.history.is_empty() {
            return (false, Some("no_history_available".to_string()));
        }
        if self.exec_mode() == ExecMode::Mock && !self.learn_from_mock {
            debug!("Skipping learning update (mock mode, learn_from_mock=false)");
            return (false, Some("mock_mode_learning_disabled".to_string()));
        }

        let mut by_regime: BTreeMap<&str, Vec<&HistoryRecord>> = BTreeMap::new();
        for record in &self.history {
            by_regime.entry(&record.regime).or_default().push(record);
        }

        let mut updates: Vec<(String, String, f64, f64, u64)> = Vec::new();
        for (regime, mut records) in by_regime {
            let start = records.len().saturating_sub(UPDATE_WINDOW);
            records = records.split_off(start);

            let n_elites = ((records.len() as f64 * ELITE_FRACTION).floor() as usize).max(1);
            records.sort_by(|a, b| {
                b.reward
                    .partial_cmp(&a.reward)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let elites = &records[..n_elites];

            for (name, min_val, max_val, _) in LEARNABLE_PARAMS {
                let values: Vec<f64> = elites
                    .iter()
                    .filter_map(|r| r.params.get(*name).copied())
                    .collect();
                if values.is_empty() {
                    continue;
                }
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                let min_std = (max_val - min_val) * 0.05;
                let std = if values.len() > 1 {
                    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                        / (values.len() - 1) as f64;
                    var.sqrt().max(min_std)
                } else {
                    min_std
                };
                updates.push((
                    regime.to_string(),
                    name.to_string(),
                    mean,
                    std,
                    values.len() as u64,
                ));
            }
        }

        for (regime, name, mean, std, count) in updates {
            let (min_val, max_val) = LEARNABLE_PARAMS
                .iter()
                .find(|entry| entry.0 == name)
                .map(|entry| (entry.1, entry.2))
                .expect("learnable param");
            let regime_state = self
                .state
                .regimes
                .entry(regime.clone())
                .or_insert_with(|| RegimeState::new(&regime));

            let dist = match regime_state.params.get(&name) {
                Some(old) => ParameterDistribution {
                    name: name.clone(),
                    mean: old.mean * (1.0 - SMOOTH_ALPHA) + mean * SMOOTH_ALPHA,
                    std_dev: old.std_dev * (1.0 - SMOOTH_ALPHA) + std * SMOOTH_ALPHA,
                    min_val,
                    max_val,
                    sample_count: old.sample_count + count,
                },
                None => ParameterDistribution {
                    name: name.clone(),
                    mean,
                    std_dev: std,
                    min_val,
                    max_val,
                    sample_count: count,
                },
            };
            regime_state.params.insert(name, dist);
            regime_state.last_updated = Some(Utc::now());
        }

        self.state.version += 1;
        if let Err(e) = self.state.save(&self.state_path) {
            tracing::warn!("Failed to persist learning state: {}", e);
        }
        (true, None)
    }

    /// Sample the proposal parameters from the beliefs for `regime`,
    /// clamped to the documented bounds. Deterministic per episode given
    /// the derived seed.
    fn sample_params(&self, regime: &str, episode_id: &str) -> ProposalParams {
        let mut sampled: BTreeMap<&str, f64> = LEARNABLE_PARAMS
            .iter()
            .map(|(name, _, _, default)| (*name, *default))
            .collect();

        if let Some(regime_state) = self.state.regimes.get(regime) {
            let mut rng =
                StdRng::seed_from_u64(self.seed ^ stable_hash64(episode_id));
            for (name, dist) in &regime_state.params {
                let normal = match Normal::new(dist.mean, dist.std_dev.max(1e-9)) {
                    Ok(n) => n,
                    Err(_) => continue,
                };
                let value: f64 = normal.sample(&mut rng);
                sampled.insert(
                    name.as_str(),
                    value.clamp(dist.min_val, dist.max_val),
                );
            }
        }

        ProposalParams {
            width_pts: sampled["width_pts"],
            rebalance_threshold_pct: sampled["rebalance_threshold_pct"],
            spread_bps: sampled["spread_bps"],
            order_size: sampled["order_size"],
            refresh_interval_secs: sampled["refresh_interval_secs"],
            max_position: 1.0,
        }
    }
}

impl ProposalAgent for LearningAgent {
    fn version(&self) -> &str {
        &self.agent_version
    }

    fn config_hash(&self) -> &str {
        &self.config_hash
    }

    fn propose(&mut self, episode_id: &str, run_id: &str) -> Result<Proposal> {
        // 1. Learn from accumulated history, hygiene permitting.
        let (learning_update_applied, learning_update_reason) = self.update_beliefs();

        // 2. Sense the current regime from cached intelligence.
        let pool = self.pool_address.clone().unwrap_or_else(|| "unknown".to_string());
        let pair = self.pair.clone();
        let health = self.intel.get_pool_health(&pool, &pair, 1);
        let regime = health.market_regime.clone();

        let mut inputs = BTreeMap::new();
        inputs.insert("volatility".to_string(), health.volatility);
        inputs.insert("avg_liquidity".to_string(), health.avg_liquidity);
        inputs.insert("volume".to_string(), health.volume);
        let mut thresholds = BTreeMap::new();
        thresholds.insert("vol_high".to_string(), 1.0);
        thresholds.insert("liquidity_high".to_string(), 1e7);

        let rule = if self.state.regimes.contains_key(&regime) {
            "sample_regime_beliefs"
        } else {
            "defaults_for_unseen_regime"
        };

        // 3. Sample the configuration.
        let params = self.sample_params(&regime, episode_id);

        // 4. Assemble the proposal.
        let metadata = EpisodeMetadata {
            episode_id: episode_id.to_string(),
            run_id: run_id.to_string(),
            timestamp: iso_utc_z(Utc::now()),
            config_hash: self.config_hash.clone(),
            agent_version: self.agent_version.clone(),
            exec_mode: self.exec_mode(),
            seed: Some(self.seed),
            regime_key: Some(regime.clone()),
            learning_update_applied,
            learning_update_reason,
            gateway_health: None,
            gateway_latency_ms: None,
            notes: None,
            extra: serde_json::Map::new(),
        };

        Ok(Proposal {
            episode_id: episode_id.to_string(),
            generated_at: iso_utc_z(Utc::now()),
            status: ProposalStatus::Active,
            skip_reason: None,
            chain: "ethereum".to_string(),
            network: "mainnet".to_string(),
            pool_address: self.pool_address.clone(),
            pair: self.pair.clone(),
            params,
            decision_basis: DecisionBasis {
                inputs,
                rule: rule.to_string(),
                thresholds,
            },
            metadata,
        })
    }

    fn observe(&mut self, proposal: &Proposal, reward: &RewardBreakdown) {
        let regime = proposal
            .metadata
            .regime_key
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        self.history.push(HistoryRecord {
            regime,
            params: proposal.params.to_map(),
            reward: reward.total,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.pipeline.base_dir = tmp.path().join("data").display().to_string();
        config.intel.cache_file = tmp.path().join("cache.json").display().to_string();
        config.pipeline.default_pool =
            Some("0x88e6A0c2dDD26FEEb64F039a2c41296FcB3f5640".to_string());
        config
    }

    #[test]
    fn proposal_carries_defaults_for_unseen_regime() {
        let tmp = TempDir::new().unwrap();
        let mut agent = LearningAgent::new(&config(&tmp), 42);

        let proposal = agent.propose("ep_20250101_000000_0", "run_20250101_000000").unwrap();
        assert_eq!(proposal.status, ProposalStatus::Active);
        assert_eq!(proposal.params.spread_bps, 20.0);
        assert_eq!(proposal.decision_basis.rule, "defaults_for_unseen_regime");
        assert_eq!(
            proposal.metadata.learning_update_reason.as_deref(),
            Some("no_history_available")
        );
        assert!(!proposal.metadata.learning_update_applied);
        assert!(proposal.metadata.regime_key.is_some());
    }

    #[test]
    fn mock_mode_blocks_learning_updates() {
        let tmp = TempDir::new().unwrap();
        let mut agent = LearningAgent::new(&config(&tmp), 42);

        let proposal = agent.propose("ep_a", "run_a").unwrap();
        let reward = RewardBreakdown {
            total: 10.0,
            components: BTreeMap::new(),
        };
        agent.observe(&proposal, &reward);

        let next = agent.propose("ep_b", "run_a").unwrap();
        assert!(!next.metadata.learning_update_applied);
        assert_eq!(
            next.metadata.learning_update_reason.as_deref(),
            Some("mock_mode_learning_disabled")
        );
    }

    #[test]
    fn learn_from_mock_enables_updates_and_persists_state() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp);
        cfg.pipeline.learn_from_mock = true;
        let mut agent = LearningAgent::new(&cfg, 42);

        for i in 0..5 {
            let proposal = agent.propose(&format!("ep_{i}"), "run_a").unwrap();
            let reward = RewardBreakdown {
                total: i as f64,
                components: BTreeMap::new(),
            };
            agent.observe(&proposal, &reward);
        }
        let proposal = agent.propose("ep_final", "run_a").unwrap();
        assert!(proposal.metadata.learning_update_applied);
        assert!(proposal.metadata.learning_update_reason.is_none());

        // Beliefs were written to disk and shape the next sample.
        let state = LearningState::load(
            &Path::new(&cfg.pipeline.base_dir).join("learning_state.json"),
        );
        assert!(!state.regimes.is_empty());
        assert_eq!(proposal.decision_basis.rule, "sample_regime_beliefs");
    }

    #[test]
    fn sampling_is_deterministic_per_episode() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp);
        cfg.pipeline.learn_from_mock = true;
        let mut agent = LearningAgent::new(&cfg, 42);

        for i in 0..4 {
            let proposal = agent.propose(&format!("ep_{i}"), "run_a").unwrap();
            agent.observe(
                &proposal,
                &RewardBreakdown {
                    total: i as f64,
                    components: BTreeMap::new(),
                },
            );
        }
        // Same derived seed, same beliefs: identical samples.
        let regime = "low_vol_low_liquidity";
        let a = agent.sample_params(regime, "ep_x");
        let b = agent.sample_params(regime, "ep_x");
        assert_eq!(a, b);
    }

    #[test]
    fn sampled_params_respect_bounds() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp);
        cfg.pipeline.learn_from_mock = true;
        let mut agent = LearningAgent::new(&cfg, 7);

        for i in 0..30 {
            let proposal = agent.propose(&format!("ep_{i}"), "run_a").unwrap();
            agent.observe(
                &proposal,
                &RewardBreakdown {
                    total: (i % 7) as f64,
                    components: BTreeMap::new(),
                },
            );
        }
        let proposal = agent.propose("ep_check", "run_a").unwrap();
        let p = &proposal.params;
        assert!((5.0..=5000.0).contains(&p.width_pts));
        assert!((0.01..=0.5).contains(&p.rebalance_threshold_pct));
        assert!((1.0..=500.0).contains(&p.spread_bps));
        assert!((0.01..=5.0).contains(&p.order_size));
        assert!((10.0..=300.0).contains(&p.refresh_interval_secs));
    }
}
