//! Per-episode orchestrator.
//!
//! Drives agent -> validator -> harness for each episode and guarantees
//! the artifact contract on every path: `proposal.json` and
//! `metadata.json` always exist once the agent has produced a proposal,
//! and any failure writes `failure.json` before the loop moves on. No
//! single episode may abort the run.

use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::agent::ProposalAgent;
use crate::artifacts::{append_campaign_log, EpisodeArtifacts, FailureArtifact};
use crate::config::AppConfig;
use crate::domain::{
    iso_utc_z, run_id, EpisodeStatus, ExecMode, Proposal, ProposalStatus, RewardBreakdown,
};
use crate::error::LabError;
use crate::harness::{EpisodeHarness, RunContext};
use crate::intel::MarketIntel;
use crate::validator::validate_proposal;

/// Outcome summary for one episode, used for campaign reporting.
#[derive(Debug, Clone)]
pub struct EpisodeOutcome {
    pub episode_id: String,
    pub status: Option<EpisodeStatus>,
    pub failed_stage: Option<String>,
}

impl EpisodeOutcome {
    pub fn is_success(&self) -> bool {
        self.status == Some(EpisodeStatus::Success) && self.failed_stage.is_none()
    }
}

pub struct Orchestrator {
    config: AppConfig,
    run_id: String,
    /// Timestamp stem shared by the run id and its episode ids.
    run_stamp: String,
    seed: u64,
    base_dir: PathBuf,
    harness: EpisodeHarness,
}

impl Orchestrator {
    /// Create the orchestrator for one run. The run directory is created
    /// once and never re-opened by a later orchestrator.
    pub fn new(config: AppConfig, explicit_run_id: Option<String>) -> Self {
        let run_id = explicit_run_id.unwrap_or_else(|| run_id(Utc::now()));
        let run_stamp = run_id
            .strip_prefix("run_")
            .unwrap_or(&run_id)
            .to_string();
        let seed = config.pipeline.seed.unwrap_or_else(rand::random);
        let base_dir = PathBuf::from(&config.pipeline.base_dir);
        let harness = EpisodeHarness::new(config.clone());
        info!("Run {} starting (seed={})", run_id, seed);
        Self {
            config,
            run_id,
            run_stamp,
            seed,
            base_dir,
            harness,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn effective_mode(&self) -> ExecMode {
        if self.config.exec_environment() == "real" {
            ExecMode::Real
        } else {
            ExecMode::Mock
        }
    }

    /// Ensure metadata.json and failure.json exist for a failed episode.
    /// The intel snapshot is captured best-effort, and only when no
    /// earlier write put one there (snapshot fixity).
    fn write_failure_artifacts(
        &self,
        artifacts: &EpisodeArtifacts,
        ctx: &RunContext,
        stage: &str,
        error_text: &str,
        exit_code: i32,
    ) {
        let mut metadata = ctx.create_metadata();

        let metadata_path = artifacts.episode_dir().join("metadata.json");
        let has_snapshot = std::fs::read_to_string(&metadata_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .map(|v| v["extra"]["intel_snapshot"].is_object())
            .unwrap_or(false);

        if !has_snapshot {
            let intel = MarketIntel::new(Path::new(&self.config.intel.cache_file));
            let pool = self
                .config
                .pipeline
                .default_pool
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            let _ = intel.get_gas_regime();
            let _ = intel.get_pool_health(&pool, &self.config.pipeline.default_pair, 1);
            let _ = intel.get_mev_risk(&pool);
            let _ = intel.get_range_hint(&pool);
            if let (Ok(snapshot), Ok(hygiene)) = (
                serde_json::to_value(intel.snapshot()),
                serde_json::to_value(intel.hygiene()),
            ) {
                metadata.extra.insert("intel_snapshot".to_string(), snapshot);
                metadata.extra.insert("intel_hygiene".to_string(), hygiene);
            }
        }

        if let Err(e) = artifacts.write_metadata(&metadata, true) {
            error!("Could not write failure metadata: {}", e);
        }
        if let Err(e) = artifacts.write_failure(&FailureArtifact {
            stage: stage.to_string(),
            error: error_text.to_string(),
            exit_code,
            config_hash: ctx.config_hash.clone(),
            agent_version: ctx.agent_version.clone(),
            exec_mode: ctx.exec_mode,
            timestamp: iso_utc_z(Utc::now()),
        }) {
            error!("Could not write failure artifact: {}", e);
        }
    }

    /// Run one episode through the full state machine. Every error path
    /// ends in failure artifacts; the returned outcome never propagates
    /// an error to the campaign loop.
    pub async fn run_episode(
        &self,
        agent: &mut dyn ProposalAgent,
        index: usize,
    ) -> EpisodeOutcome {
        let ep_id = format!("ep_{}_{}", self.run_stamp, index);
        let artifacts = EpisodeArtifacts::new(&self.base_dir, &self.run_id, &ep_id);
        if let Err(e) = artifacts.ensure_directories() {
            error!("Cannot create episode directory: {}", e);
            return EpisodeOutcome {
                episode_id: ep_id,
                status: None,
                failed_stage: Some("artifacts".to_string()),
            };
        }

        let mut ctx = RunContext {
            run_id: self.run_id.clone(),
            episode_id: ep_id.clone(),
            config_hash: agent.config_hash().to_string(),
            agent_version: agent.version().to_string(),
            exec_mode: self.effective_mode(),
            seed: self.seed,
            started_at: iso_utc_z(Utc::now()),
            regime_key: None,
            gateway_health: None,
            gateway_latency_ms: None,
        };

        // Created -> Proposed
        let proposal: Proposal = match agent.propose(&ep_id, &self.run_id) {
            Ok(p) => p,
            Err(e) => {
                warn!("Agent failed for {}: {}", ep_id, e);
                self.write_failure_artifacts(&artifacts, &ctx, "agent", &e.to_string(), 1);
                return EpisodeOutcome {
                    episode_id: ep_id,
                    status: None,
                    failed_stage: Some("agent".to_string()),
                };
            }
        };
        ctx.regime_key = proposal.metadata.regime_key.clone();

        if let Err(e) = artifacts
            .write_proposal(&proposal)
            .and_then(|()| artifacts.write_metadata(&proposal.metadata, true))
        {
            error!("Artifact write failed for {}: {}", ep_id, e);
            self.write_failure_artifacts(&artifacts, &ctx, "artifacts", &e.to_string(), 1);
            return EpisodeOutcome {
                episode_id: ep_id,
                status: None,
                failed_stage: Some("artifacts".to_string()),
            };
        }

        // An agent may decline the episode outright.
        if proposal.status == ProposalStatus::Skipped {
            info!(
                "Episode {} skipped by agent: {}",
                ep_id,
                proposal.skip_reason.as_deref().unwrap_or("no reason")
            );
            return EpisodeOutcome {
                episode_id: ep_id,
                status: Some(EpisodeStatus::Skipped),
                failed_stage: None,
            };
        }

        // Proposed -> Validated (real mode only)
        if let Err(e) = validate_proposal(
            &proposal,
            ctx.exec_mode,
            self.config.gateway.disable_pool_validation,
        ) {
            warn!("Validation failed for {}: {}", ep_id, e);
            self.write_failure_artifacts(&artifacts, &ctx, "validation", &e.to_string(), 1);
            return EpisodeOutcome {
                episode_id: ep_id,
                status: None,
                failed_stage: Some("validation".to_string()),
            };
        }

        // Validated -> Executed -> Completed
        match self.harness.run(&artifacts, &proposal, &mut ctx).await {
            Ok(result) => {
                let reward = RewardBreakdown::from_result(&result);
                agent.observe(&proposal, &reward);
                EpisodeOutcome {
                    episode_id: ep_id,
                    status: Some(result.status),
                    failed_stage: None,
                }
            }
            Err(e) => {
                warn!("Harness failed for {}: {}", ep_id, e);
                let stage = match e {
                    LabError::Io(_) | LabError::Schema(_) | LabError::Json(_) => "artifacts",
                    _ => "harness",
                };
                self.write_failure_artifacts(&artifacts, &ctx, stage, &e.to_string(), 1);
                EpisodeOutcome {
                    episode_id: ep_id,
                    status: None,
                    failed_stage: Some(stage.to_string()),
                }
            }
        }
    }

    /// Run a campaign of sequential episodes. Per-episode failures are
    /// recorded and the loop continues; a process-level interrupt stops
    /// after the current episode.
    pub async fn run_campaign(
        &self,
        agent: &mut dyn ProposalAgent,
        episodes: usize,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Vec<EpisodeOutcome> {
        let mut outcomes = Vec::with_capacity(episodes);
        for index in 0..episodes {
            if let Some(rx) = &shutdown {
                if *rx.borrow() {
                    info!("Interrupt observed, stopping campaign after {} episodes", index);
                    break;
                }
            }

            let outcome = self.run_episode(agent, index).await;
            let line = format!(
                "{} episode={} status={} stage={}",
                iso_utc_z(Utc::now()),
                outcome.episode_id,
                outcome
                    .status
                    .map(|s| format!("{s:?}").to_lowercase())
                    .unwrap_or_else(|| "none".to_string()),
                outcome.failed_stage.as_deref().unwrap_or("-"),
            );
            if let Err(e) = append_campaign_log(&self.base_dir, &self.run_id, &line) {
                warn!("Could not append campaign log: {}", e);
            }
            outcomes.push(outcome);
        }
        outcomes
    }
}
