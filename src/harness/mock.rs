//! Deterministic mock executor.
//!
//! Generates a regime-parameterized stochastic tick path, simulates fee
//! accrual, rebalancing gas, and drawdown, and produces a full episode
//! result. Repeated invocation with identical `(seed, proposal, regime)`
//! produces identical outputs modulo wall-clock fields.

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::time::Instant;

use super::executor::ClmmExecutor;
use super::RunContext;
use crate::domain::{
    iso_utc_z, stable_hash64, EpisodeResult, EpisodeStatus, ExecMode, PositionState,
    Proposal, SimulationEnvelope,
};
use crate::error::Result;

const STEPS: usize = 120;
const INITIAL_PRICE: f64 = 2000.0;
const GAS_PER_REBALANCE_USD: f64 = 12.0;

/// Tick-path process selected by the proposal's regime key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickRegime {
    MeanRevert,
    Trend,
    Jumpy,
}

impl TickRegime {
    /// Map a market regime label onto a path generator. High-volatility
    /// regimes walk or jump; low-volatility regimes mean-revert.
    pub fn from_regime_key(key: Option<&str>) -> Self {
        match key {
            Some(k) if k.starts_with("high_vol") && k.ends_with("low_liquidity") => {
                TickRegime::Jumpy
            }
            Some(k) if k.starts_with("high_vol") => TickRegime::Trend,
            _ => TickRegime::MeanRevert,
        }
    }
}

pub struct MockExecutor {
    seed: u64,
}

impl MockExecutor {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn sim_seed(&self, proposal: &Proposal) -> u64 {
        let regime = proposal.metadata.regime_key.as_deref().unwrap_or("unknown");
        self.seed
            ^ stable_hash64(&proposal.episode_id)
            ^ stable_hash64(regime).rotate_left(17)
    }

    /// Generate the price path for one episode.
    fn tick_path(&self, rng: &mut StdRng, regime: TickRegime) -> Vec<f64> {
        let mut prices = Vec::with_capacity(STEPS + 1);
        let mut price = INITIAL_PRICE;
        prices.push(price);

        let noise = Normal::new(0.0, 1.0).expect("unit normal");

        for _ in 0..STEPS {
            let ret = match regime {
                TickRegime::MeanRevert => {
                    let pull = 0.05 * (INITIAL_PRICE - price) / INITIAL_PRICE;
                    pull + 0.002 * noise.sample(rng)
                }
                TickRegime::Trend => 0.0005 + 0.003 * noise.sample(rng),
                TickRegime::Jumpy => {
                    let mut r = 0.002 * noise.sample(rng);
                    if rng.gen::<f64>() < 0.02 {
                        r += 0.02 * noise.sample(rng);
                    }
                    r
                }
            };
            price *= 1.0 + ret;
            prices.push(price);
        }
        prices
    }
}

#[async_trait]
impl ClmmExecutor for MockExecutor {
    fn mode(&self) -> ExecMode {
        ExecMode::Mock
    }

    async fn execute_episode(
        &self,
        proposal: &Proposal,
        ctx: &RunContext,
    ) -> Result<EpisodeResult> {
        let started = Instant::now();
        let regime = TickRegime::from_regime_key(proposal.metadata.regime_key.as_deref());
        let mut rng = StdRng::seed_from_u64(self.sim_seed(proposal));

        let params = &proposal.params;
        let half_width = (params.width_pts * 1e-4).max(1e-4);
        let spread_fraction = params.spread_bps * 1e-4;
        let size = params.order_size.min(params.max_position);

        let prices = self.tick_path(&mut rng, regime);
        let entry_price = prices[0];
        let mut lower = entry_price * (1.0 - half_width);
        let mut upper = entry_price * (1.0 + half_width);

        let mut fees_usd = 0.0;
        let mut gas_cost_usd = 0.0;
        let mut trade_count: u32 = 0;
        let mut out_of_range_steps = 0usize;
        let mut equity_low: f64 = 0.0;
        let mut step_timings_ms = Vec::with_capacity(STEPS);

        for window in prices.windows(2) {
            let (prev, price) = (window[0], window[1]);
            let in_range = price >= lower && price <= upper;

            if in_range {
                // Fee accrual scales with traded-through volume.
                let activity = (price / prev - 1.0).abs();
                fees_usd += size * price * spread_fraction * activity * 50.0;
            } else {
                out_of_range_steps += 1;

                // Rebalance once the drift beyond the range exceeds the
                // threshold; recenter around the current price.
                let drift = if price < lower {
                    (lower - price) / lower
                } else {
                    (price - upper) / upper
                };
                if drift > params.rebalance_threshold_pct {
                    lower = price * (1.0 - half_width);
                    upper = price * (1.0 + half_width);
                    gas_cost_usd += GAS_PER_REBALANCE_USD;
                    trade_count += 1;
                }
            }

            let equity = size * (price - entry_price) + fees_usd - gas_cost_usd;
            equity_low = equity_low.min(equity);

            step_timings_ms.push(rng.gen_range(0.01..0.05));
        }

        let exit_price = *prices.last().expect("non-empty path");
        let pnl_usd = size * (exit_price - entry_price) + fees_usd - gas_cost_usd;
        let out_of_range_pct = out_of_range_steps as f64 / STEPS as f64;
        let final_in_range = exit_price >= lower && exit_price <= upper;

        let simulation = SimulationEnvelope {
            success: true,
            simulation_success: true,
            amount_out: Some((size * exit_price * 1e6) as u64),
            gas_estimate: Some(rng.gen_range(200_000..400_000)),
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            error: None,
            source: "mock".to_string(),
            step_timings_ms,
        };

        let mut result = EpisodeResult::skeleton(
            &proposal.episode_id,
            &ctx.run_id,
            EpisodeStatus::Success,
            ExecMode::Mock,
            iso_utc_z(Utc::now()),
        );
        result.chain = proposal.chain.clone();
        result.network = proposal.network.clone();
        result.pool_address = proposal.pool_address.clone();
        result.params_used = params.to_map();
        result.simulation = Some(simulation);
        result.pnl_usd = pnl_usd;
        result.fees_usd = fees_usd;
        result.gas_cost_usd = gas_cost_usd;
        result.max_drawdown_usd = -equity_low;
        result.out_of_range_pct = Some(out_of_range_pct);
        result.trade_count = trade_count;
        result.position_after = Some(PositionState {
            lower_price: lower,
            upper_price: upper,
            liquidity: size * exit_price,
            in_range: final_in_range,
        });
        result.latency_ms = Some(started.elapsed().as_secs_f64() * 1000.0);
        result
            .timings_ms
            .insert("simulate_ms".to_string(), started.elapsed().as_secs_f64() * 1000.0);

        Ok(result)
    }
}
