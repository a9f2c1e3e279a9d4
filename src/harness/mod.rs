//! Episode harness: capture decision-time intelligence, select an
//! executor, run the episode, and write the result bundle.

pub mod executor;
pub mod gateway;
pub mod live;
pub mod mock;

use chrono::Utc;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::artifacts::{EpisodeArtifacts, FailureArtifact};
use crate::config::AppConfig;
use crate::domain::{
    iso_utc_z, EpisodeMetadata, EpisodeResult, EpisodeStatus, ExecMode, Proposal,
    RewardBreakdown,
};
use crate::error::{LabError, Result};
use crate::intel::MarketIntel;
use executor::select_executor;

/// Hard ceiling on a single episode's execution.
const EPISODE_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-episode execution context shared across pipeline stages.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub episode_id: String,
    pub config_hash: String,
    pub agent_version: String,
    pub exec_mode: ExecMode,
    pub seed: u64,
    pub started_at: String,
    pub regime_key: Option<String>,
    pub gateway_health: Option<String>,
    pub gateway_latency_ms: Option<f64>,
}

impl RunContext {
    /// Initial metadata derived from the context.
    pub fn create_metadata(&self) -> EpisodeMetadata {
        EpisodeMetadata {
            episode_id: self.episode_id.clone(),
            run_id: self.run_id.clone(),
            timestamp: self.started_at.clone(),
            config_hash: self.config_hash.clone(),
            agent_version: self.agent_version.clone(),
            exec_mode: self.exec_mode,
            seed: Some(self.seed),
            regime_key: self.regime_key.clone(),
            learning_update_applied: false,
            learning_update_reason: None,
            gateway_health: self.gateway_health.clone(),
            gateway_latency_ms: self.gateway_latency_ms,
            notes: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Drives one episode from validated proposal to written artifacts.
pub struct EpisodeHarness {
    config: AppConfig,
}

impl EpisodeHarness {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Capture the intel snapshot at decision time and merge it into
    /// metadata.json. The set of accessors here defines the episode's
    /// decision audit; keep it in sync with what the agent consumes.
    fn capture_intel(
        &self,
        artifacts: &EpisodeArtifacts,
        proposal: &Proposal,
        ctx: &RunContext,
    ) -> Result<()> {
        let intel = MarketIntel::new(Path::new(&self.config.intel.cache_file))
            .with_trigger_file(Path::new(&self.config.intel.trigger_file));

        let pool = proposal
            .pool_address
            .clone()
            .or_else(|| self.config.pipeline.default_pool.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let pair = proposal.pair.clone();

        let _ = intel.get_gas_regime();
        let _ = intel.get_pool_health(&pool, &pair, 1);
        let _ = intel.get_mev_risk(&pool);
        let _ = intel.get_range_hint(&pool);

        let snapshot = intel.snapshot();
        let hygiene = intel.hygiene();
        info!("Intel snapshot captured: {} queries", snapshot.len());

        let mut metadata = proposal.metadata.clone();
        metadata.exec_mode = ctx.exec_mode;
        metadata.gateway_health = ctx.gateway_health.clone();
        metadata.gateway_latency_ms = ctx.gateway_latency_ms;
        metadata
            .extra
            .insert("intel_snapshot".to_string(), serde_json::to_value(&snapshot)?);
        metadata
            .extra
            .insert("intel_hygiene".to_string(), serde_json::to_value(&hygiene)?);
        metadata.extra.insert(
            "intel_inputs".to_string(),
            json!({
                "pool_address": pool,
                "pair": pair,
                "lookback_hours": 1,
            }),
        );

        artifacts.write_metadata(&metadata, true)
    }

    /// Execute one episode end to end. The returned result has already
    /// been written to disk along with timings, reward, and (on a
    /// failed status) failure.json.
    pub async fn run(
        &self,
        artifacts: &EpisodeArtifacts,
        proposal: &Proposal,
        ctx: &mut RunContext,
    ) -> Result<EpisodeResult> {
        let executor = select_executor(&self.config, ctx.seed, ctx).await?;
        ctx.exec_mode = executor.mode();

        // Best effort: a failed capture must not block execution.
        if let Err(e) = self.capture_intel(artifacts, proposal, ctx) {
            warn!("Failed to capture intel snapshot: {}", e);
        }

        artifacts.log_event(
            "episode_start",
            json!({
                "episode_id": ctx.episode_id,
                "run_id": ctx.run_id,
                "exec_mode": ctx.exec_mode.as_str(),
                "seed": ctx.seed,
            }),
        )?;

        info!(
            "Executing episode {} in {} mode",
            ctx.episode_id,
            ctx.exec_mode.as_str()
        );

        let result = match tokio::time::timeout(
            EPISODE_TIMEOUT,
            executor.execute_episode(proposal, ctx),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                let mut result = EpisodeResult::skeleton(
                    &ctx.episode_id,
                    &ctx.run_id,
                    EpisodeStatus::Failed,
                    ctx.exec_mode,
                    iso_utc_z(Utc::now()),
                );
                result.error = Some(e.to_string());
                result
            }
            Err(_) => {
                let e = LabError::ExecutorTimeout {
                    elapsed_ms: EPISODE_TIMEOUT.as_millis() as u64,
                };
                let mut result = EpisodeResult::skeleton(
                    &ctx.episode_id,
                    &ctx.run_id,
                    EpisodeStatus::Failed,
                    ctx.exec_mode,
                    iso_utc_z(Utc::now()),
                );
                result.error = Some(e.to_string());
                result
            }
        };

        artifacts.write_result(&result)?;
        if !result.timings_ms.is_empty() {
            artifacts.write_timings(&result.timings_ms)?;
        }
        let reward = RewardBreakdown::from_result(&result);
        artifacts.write_reward(&reward)?;

        // A failed episode gets failure.json; a clean skip does not.
        if result.status == EpisodeStatus::Failed {
            artifacts.write_failure(&FailureArtifact {
                stage: "harness".to_string(),
                error: result
                    .error
                    .clone()
                    .unwrap_or_else(|| "episode failed".to_string()),
                exit_code: 1,
                config_hash: ctx.config_hash.clone(),
                agent_version: ctx.agent_version.clone(),
                exec_mode: ctx.exec_mode,
                timestamp: iso_utc_z(Utc::now()),
            })?;
            warn!("Episode {} failed: {:?}", ctx.episode_id, result.error);
        }

        artifacts.log_event(
            "episode_complete",
            json!({
                "episode_id": ctx.episode_id,
                "status": result.status,
                "pnl_usd": result.pnl_usd,
                "reward": reward.total,
            }),
        )?;

        Ok(result)
    }
}
