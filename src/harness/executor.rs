//! Executor trait and mode selection.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use super::gateway::GatewayClient;
use super::live::LiveExecutor;
use super::mock::MockExecutor;
use super::RunContext;
use crate::config::AppConfig;
use crate::domain::{EpisodeResult, ExecMode, Proposal};
use crate::error::{LabError, Result};

fn env_truthy(key: &str) -> bool {
    matches!(
        std::env::var(key)
            .ok()
            .as_deref()
            .map(str::trim)
            .map(str::to_ascii_lowercase)
            .as_deref(),
        Some("1" | "true" | "yes" | "y" | "on")
    )
}

/// Explicit risk acknowledgement for capital-at-risk execution. Real
/// mode refuses to build the live executor without it.
pub fn real_execution_allowed() -> bool {
    env_truthy("CLMM_LAB_ALLOW_REAL_EXECUTION")
}

/// One episode execution against either the simulator or the live
/// exchange gateway.
#[async_trait]
pub trait ClmmExecutor: Send + Sync {
    fn mode(&self) -> ExecMode;

    async fn execute_episode(
        &self,
        proposal: &Proposal,
        ctx: &RunContext,
    ) -> Result<EpisodeResult>;
}

/// Select the executor for this episode:
/// - force_mock always wins;
/// - in a real environment the live executor is used when the gateway is
///   healthy, else the mock only if the fallback switch permits;
/// - any other environment uses the mock.
///
/// The health probe outcome is recorded on the context for metadata.
pub async fn select_executor(
    config: &AppConfig,
    seed: u64,
    ctx: &mut RunContext,
) -> Result<Box<dyn ClmmExecutor>> {
    if config.pipeline.force_mock {
        info!("force_mock set, using mock executor");
        return Ok(Box::new(MockExecutor::new(seed)));
    }

    if config.pipeline.environment == "real" {
        if !real_execution_allowed() {
            return Err(LabError::SafetyBlock(
                "real execution requires CLMM_LAB_ALLOW_REAL_EXECUTION".to_string(),
            ));
        }
        let gateway = GatewayClient::new(&config.gateway.base_url, Duration::from_secs(10));
        let health = gateway.health_check().await;
        ctx.gateway_latency_ms = Some(health.latency_ms);
        ctx.gateway_health = Some(if health.success {
            "healthy".to_string()
        } else {
            format!("unhealthy: {}", health.error.as_deref().unwrap_or("unknown"))
        });

        if health.success {
            return Ok(Box::new(LiveExecutor::new(
                gateway,
                config.gateway.gas_ceiling,
            )));
        }
        if config.gateway.allow_mock_fallback {
            warn!("Gateway unhealthy, degrading to mock executor");
            return Ok(Box::new(MockExecutor::new(seed)));
        }
        return Err(LabError::GatewayUnavailable(
            health.error.unwrap_or_else(|| "health check failed".to_string()),
        ));
    }

    Ok(Box::new(MockExecutor::new(seed)))
}
