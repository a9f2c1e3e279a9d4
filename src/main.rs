use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clmm_lab::agent::LearningAgent;
use clmm_lab::config::AppConfig;
use clmm_lab::domain::Proposal;
use clmm_lab::error::{LabError, Result};
use clmm_lab::orchestrator::Orchestrator;
use clmm_lab::scheduler::backend::{
    AnalyticsBackend, HttpAnalyticsBackend, MockAnalyticsBackend,
};
use clmm_lab::scheduler::{shutdown_channel, triggers, RefreshScheduler};
use clmm_lab::validator::validate_proposal;

#[derive(Parser)]
#[command(name = "clmm-lab")]
#[command(version = "0.1.0")]
#[command(about = "Episode-based research pipeline for a CLMM market-making agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a campaign of sequential episodes
    Run {
        /// Number of episodes
        #[arg(long, default_value = "1")]
        episodes: usize,
        /// Explicit run id (default: derived from the clock)
        #[arg(long)]
        run_id: Option<String>,
        /// RNG seed override
        #[arg(long)]
        seed: Option<u64>,
        /// Force the mock executor regardless of environment
        #[arg(long)]
        force_mock: bool,
    },
    /// Run the background cache refresh scheduler until interrupted
    Scheduler,
    /// Process a single scheduler refresh tick and exit
    Tick,
    /// Append a refresh trigger for the scheduler's next tick
    Trigger {
        /// Trigger reason (e.g. out_of_range, volatility_spike)
        reason: String,
        #[arg(long)]
        pool: Option<String>,
        #[arg(long)]
        pair: Option<String>,
    },
    /// Validate a proposal file against the real-mode bounds
    Validate {
        /// Path to proposal.json
        proposal: String,
    },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn load_config(path: &str) -> Result<AppConfig> {
    let config = AppConfig::load_from(path).unwrap_or_else(|e| {
        warn!("Failed to load config from {}: {}, using defaults", path, e);
        AppConfig::default()
    });
    let problems = config.validate();
    if !problems.is_empty() {
        return Err(LabError::ConfigInvalid(problems.join("; ")));
    }
    Ok(config)
}

fn make_backend(config: &AppConfig) -> Arc<dyn AnalyticsBackend> {
    if config.intel.source == "dune" {
        let api_key = std::env::var("ANALYTICS_API_KEY").unwrap_or_default();
        if api_key.is_empty() {
            warn!("ANALYTICS_API_KEY not set; backend calls will be rejected upstream");
        }
        Arc::new(HttpAnalyticsBackend::new(&config.intel.backend_url, &api_key))
    } else {
        Arc::new(MockAnalyticsBackend)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Commands::Run {
            episodes,
            run_id,
            seed,
            force_mock,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(seed) = seed {
                config.pipeline.seed = Some(seed);
            }
            if force_mock {
                config.pipeline.force_mock = true;
            }

            let (shutdown_tx, shutdown_rx) = shutdown_channel();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, stopping after the current episode");
                    let _ = shutdown_tx.send(true);
                }
            });

            let orchestrator = Orchestrator::new(config.clone(), run_id);
            let mut agent = LearningAgent::new(&config, orchestrator.seed());
            let outcomes = orchestrator
                .run_campaign(&mut agent, episodes, Some(shutdown_rx))
                .await;

            let failures = outcomes.iter().filter(|o| !o.is_success()).count();
            info!(
                "Campaign {} finished: {}/{} episodes succeeded",
                orchestrator.run_id(),
                outcomes.len() - failures,
                outcomes.len()
            );
            for outcome in &outcomes {
                info!(
                    "  {} -> {}",
                    outcome.episode_id,
                    outcome
                        .failed_stage
                        .clone()
                        .map(|s| format!("failed at {s}"))
                        .or_else(|| outcome.status.map(|s| format!("{s:?}").to_lowercase()))
                        .unwrap_or_else(|| "unknown".to_string())
                );
            }

            // The exit code reports outcomes downstream; failures never
            // abort the campaign itself.
            if failures > 0 {
                std::process::exit(1);
            }
        }
        Commands::Scheduler => {
            let config = load_config(&cli.config)?;
            let backend = make_backend(&config);
            let mut scheduler = RefreshScheduler::new(&config, backend)?;

            let (shutdown_tx, shutdown_rx) = shutdown_channel();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, draining scheduler workers");
                    let _ = shutdown_tx.send(true);
                }
            });

            scheduler.run_forever(shutdown_rx).await;
        }
        Commands::Tick => {
            let config = load_config(&cli.config)?;
            let backend = make_backend(&config);
            let mut scheduler = RefreshScheduler::new(&config, backend)?;
            let stats = scheduler.tick().await;
            info!(
                "Tick: {} enqueued, {} ok, {} failed, {} deferred, {} dropped",
                stats.enqueued, stats.succeeded, stats.failed, stats.deferred, stats.dropped
            );
        }
        Commands::Trigger { reason, pool, pair } => {
            let config = load_config(&cli.config)?;
            triggers::append_default_triggers(
                Path::new(&config.intel.trigger_file),
                &reason,
                pool.as_deref(),
                pair.as_deref(),
            )?;
            info!("Trigger appended: {}", reason);
        }
        Commands::Validate { proposal } => {
            let raw = std::fs::read_to_string(&proposal)?;
            let parsed: Proposal = serde_json::from_str(&raw)
                .map_err(|e| LabError::Schema(e.to_string()))?;
            match validate_proposal(&parsed, clmm_lab::domain::ExecMode::Real, false) {
                Ok(()) => info!("Proposal {} is valid for real-mode execution", proposal),
                Err(e) => {
                    error!("Proposal {} is invalid: {}", proposal, e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
