//! Live executor — quote-then-execute against the exchange gateway.
//!
//! A quote with simulate semantics must succeed (non-zero output, no
//! revert, gas within the configured ceiling) before any capital-moving
//! call is issued. Quote failures and bound violations surface as
//! `skipped`; gateway health failures surface as `failed`. In all cases
//! a result is produced rather than an error.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::time::Instant;

use super::executor::ClmmExecutor;
use super::gateway::GatewayClient;
use super::RunContext;
use crate::domain::{
    iso_utc_z, EpisodeResult, EpisodeStatus, ExecMode, PositionState, Proposal,
    SimulationEnvelope,
};
use crate::error::Result;

const WETH: &str = "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2";
const USDC: &str = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48";
const FEE_TIER: &str = "3000";

pub struct LiveExecutor {
    gateway: GatewayClient,
    gas_ceiling: u64,
}

impl LiveExecutor {
    pub fn new(gateway: GatewayClient, gas_ceiling: u64) -> Self {
        Self {
            gateway,
            gas_ceiling,
        }
    }

    fn base_result(proposal: &Proposal, ctx: &RunContext, status: EpisodeStatus) -> EpisodeResult {
        let mut result = EpisodeResult::skeleton(
            &proposal.episode_id,
            &ctx.run_id,
            status,
            ExecMode::Real,
            iso_utc_z(Utc::now()),
        );
        result.chain = proposal.chain.clone();
        result.network = proposal.network.clone();
        result.pool_address = proposal.pool_address.clone();
        result.params_used = proposal.params.to_map();
        result
    }

    fn num(data: &Value, field: &str) -> f64 {
        match data.get(field) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }
}

#[async_trait]
impl ClmmExecutor for LiveExecutor {
    fn mode(&self) -> ExecMode {
        ExecMode::Real
    }

    async fn execute_episode(
        &self,
        proposal: &Proposal,
        ctx: &RunContext,
    ) -> Result<EpisodeResult> {
        let started = Instant::now();
        let mut timings = std::collections::BTreeMap::new();

        // Health gate: a dead gateway is a failure, not a skip.
        let health = self.gateway.health_check().await;
        timings.insert("health_check_ms".to_string(), health.latency_ms);
        if !health.success {
            let mut result = Self::base_result(proposal, ctx, EpisodeStatus::Failed);
            result.error = Some("Gateway health check failed".to_string());
            result.errors = vec![format!(
                "Health check error: {}",
                health.error.as_deref().unwrap_or("unknown")
            )];
            result.timings_ms = timings;
            return Ok(result);
        }

        let pool_info = self
            .gateway
            .pool_info(
                &proposal.chain,
                &proposal.network,
                proposal.pool_address.as_deref().unwrap_or(""),
            )
            .await;
        timings.insert("pool_info_ms".to_string(), pool_info.latency_ms);
        if !pool_info.success {
            let mut result = Self::base_result(proposal, ctx, EpisodeStatus::Failed);
            result.error = Some("Failed to fetch pool info".to_string());
            result.errors = vec![format!(
                "Pool info error: {}",
                pool_info.error.as_deref().unwrap_or("unknown")
            )];
            result.timings_ms = timings;
            return Ok(result);
        }

        let price = Self::num(&pool_info.data, "price").max(1.0);
        let half_width = (proposal.params.width_pts * 1e-4).max(1e-4);
        let lower = price * (1.0 - half_width);
        let upper = price * (1.0 + half_width);
        let amount = proposal.params.order_size.min(proposal.params.max_position);

        // Quote gate: simulate the position before committing capital.
        let quote = self
            .gateway
            .quote_position(
                &proposal.chain,
                &proposal.network,
                WETH,
                USDC,
                FEE_TIER,
                lower,
                upper,
                amount,
            )
            .await;
        timings.insert("quote_ms".to_string(), quote.latency_ms);

        let amount_out = Self::num(&quote.data, "amount1") as u64;
        let gas_estimate = Self::num(&quote.data, "gasEstimate") as u64;

        let simulation = SimulationEnvelope {
            success: quote.success,
            simulation_success: quote.success && amount_out > 0,
            amount_out: Some(amount_out),
            gas_estimate: Some(gas_estimate),
            latency_ms: quote.latency_ms,
            error: quote.error.clone(),
            source: "live".to_string(),
            step_timings_ms: Vec::new(),
        };

        let skip_reason = if !quote.success {
            let err = quote.error.as_deref().unwrap_or("quote failed");
            Some(if err.to_lowercase().contains("revert") {
                format!("Quote reverted: {err}")
            } else {
                format!("Quote failed: {err}")
            })
        } else if amount_out == 0 {
            Some("Quote produced zero output".to_string())
        } else if gas_estimate > self.gas_ceiling {
            Some(format!(
                "Gas estimate {} above ceiling {}",
                gas_estimate, self.gas_ceiling
            ))
        } else {
            None
        };

        if let Some(reason) = skip_reason {
            let mut result = Self::base_result(proposal, ctx, EpisodeStatus::Skipped);
            result.error = Some(reason);
            result.simulation = Some(simulation);
            result.timings_ms = timings;
            return Ok(result);
        }

        // Execute: open the position, then close it at episode end.
        let open = self
            .gateway
            .open_position(
                &proposal.chain,
                &proposal.network,
                proposal.pool_address.as_deref().unwrap_or(""),
                WETH,
                USDC,
                FEE_TIER,
                lower,
                upper,
                amount,
            )
            .await;
        timings.insert("open_position_ms".to_string(), open.latency_ms);
        if !open.success {
            let mut result = Self::base_result(proposal, ctx, EpisodeStatus::Failed);
            result.error = Some("Open position failed".to_string());
            result.errors = vec![open.error.unwrap_or_else(|| "unknown".to_string())];
            result.simulation = Some(simulation);
            result.timings_ms = timings;
            return Ok(result);
        }

        let token_id = Self::num(&open.data, "tokenId") as u64;
        let open_gas = Self::num(&open.data, "gasUsed");

        let close = self
            .gateway
            .close_position(
                &proposal.chain,
                &proposal.network,
                proposal.pool_address.as_deref().unwrap_or(""),
                token_id,
            )
            .await;
        timings.insert("close_position_ms".to_string(), close.latency_ms);

        let mut result = Self::base_result(proposal, ctx, EpisodeStatus::Success);
        if !close.success {
            // The position opened but did not close cleanly; surface the
            // error while keeping the artifacts complete.
            result.status = EpisodeStatus::Failed;
            result.error = Some("Close position failed".to_string());
            result.errors = vec![close.error.clone().unwrap_or_else(|| "unknown".to_string())];
        }

        let close_gas = Self::num(&close.data, "gasUsed");
        let fees0 = Self::num(&close.data, "amount0");

        // Rough USD accounting from gateway units; refined analytics live
        // in the metrics pipeline, not here.
        result.fees_usd = fees0 * 1e-6;
        result.gas_cost_usd = (open_gas + close_gas) * 1e-9 * 30.0;
        result.pnl_usd = result.fees_usd - result.gas_cost_usd;
        result.trade_count = 2;
        result.simulation = Some(simulation);
        result.position_after = Some(PositionState {
            lower_price: lower,
            upper_price: upper,
            liquidity: 0.0,
            in_range: false,
        });
        result.latency_ms = Some(started.elapsed().as_secs_f64() * 1000.0);
        result.timings_ms = timings;
        Ok(result)
    }
}
