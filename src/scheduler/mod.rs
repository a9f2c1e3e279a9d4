//! Background cache refresh scheduler.
//!
//! Implements stale-while-revalidate semantics:
//! - Episodes read from cache (never block)
//! - The scheduler refreshes stale entries in the background
//! - Bounded worker concurrency with per-job timeouts
//! - Active pool scoping (top N pools only)
//! - Event-driven triggers for P0/P1 queries

pub mod backend;
pub mod plan;
pub mod triggers;

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::Result;
use crate::intel::cache::{CacheEnvelope, QualityKv};
use crate::intel::registry::QueryDescriptor;
use backend::AnalyticsBackend;
use plan::{BudgetMode, WorkItem};

/// Queue capacity multiplier per worker; surplus plan items are dropped
/// and recomputed next tick so no unbounded backlog can form.
const QUEUE_FACTOR: usize = 32;

/// Outcome counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickStats {
    pub enqueued: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub deferred: usize,
    pub dropped: usize,
}

struct JobOutcome {
    descriptor: &'static QueryDescriptor,
    cache_key: String,
    result: std::result::Result<Value, String>,
}

/// Create the cooperative shutdown channel shared by the scheduler loop
/// and its workers.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Non-blocking analytics cache refresh scheduler. Owns the single
/// writer handle to the quality KV.
pub struct RefreshScheduler {
    worker_count: usize,
    pool_cap: usize,
    tick_interval: Duration,
    job_timeout: Duration,
    trigger_horizon_secs: i64,
    expensive_budget: usize,
    budget_mode: BudgetMode,
    configured_pools: Vec<String>,
    default_pair: String,
    base_dir: PathBuf,
    trigger_file: PathBuf,
    kv: QualityKv,
    backend: Arc<dyn AnalyticsBackend>,
}

impl RefreshScheduler {
    pub fn new(config: &AppConfig, backend: Arc<dyn AnalyticsBackend>) -> Result<Self> {
        let kv = QualityKv::open(Path::new(&config.intel.cache_file))?;
        info!(
            "Scheduler initialized (workers={}, pool_cap={}, backend={})",
            config.scheduler.worker_count,
            config.scheduler.pool_cap,
            backend.name()
        );
        Ok(Self {
            worker_count: config.scheduler.worker_count.max(1),
            pool_cap: config.scheduler.pool_cap.max(1),
            tick_interval: Duration::from_secs(config.scheduler.tick_interval_secs),
            job_timeout: Duration::from_secs(config.scheduler.job_timeout_secs),
            trigger_horizon_secs: config.scheduler.trigger_horizon_secs,
            expensive_budget: config.scheduler.expensive_budget,
            budget_mode: BudgetMode::parse(&config.scheduler.expensive_budget_mode),
            configured_pools: config.scheduler.active_pools.clone(),
            default_pair: config.pipeline.default_pair.clone(),
            base_dir: PathBuf::from(&config.pipeline.base_dir),
            trigger_file: PathBuf::from(&config.intel.trigger_file),
            kv,
            backend,
        })
    }

    pub fn kv(&self) -> &QualityKv {
        &self.kv
    }

    /// Compute the active pool set: explicit config wins, else the pools
    /// named by the most recent run's proposals. Capped at pool_cap; an
    /// empty result simply skips pool-scoped refreshes.
    fn active_pools(&self) -> Vec<String> {
        if !self.configured_pools.is_empty() {
            return self
                .configured_pools
                .iter()
                .take(self.pool_cap)
                .cloned()
                .collect();
        }
        self.pools_from_recent_run()
    }

    fn pools_from_recent_run(&self) -> Vec<String> {
        let runs_dir = self.base_dir.join("runs");
        let Ok(entries) = fs::read_dir(&runs_dir) else {
            return Vec::new();
        };

        // Run ids are timestamp-derived, so lexical max = most recent.
        let latest = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| e.path())
            .max();
        let Some(run_dir) = latest else {
            return Vec::new();
        };

        let mut pools: Vec<String> = Vec::new();
        let mut seen = BTreeSet::new();
        let Ok(episodes) = fs::read_dir(run_dir.join("episodes")) else {
            return Vec::new();
        };
        for episode in episodes.flatten() {
            if pools.len() >= self.pool_cap {
                break;
            }
            let proposal_path = episode.path().join("proposal.json");
            let Ok(raw) = fs::read_to_string(&proposal_path) else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<Value>(&raw) else {
                continue;
            };
            if let Some(pool) = value.get("pool_address").and_then(Value::as_str) {
                if seen.insert(pool.to_string()) {
                    pools.push(pool.to_string());
                }
            }
        }
        pools
    }

    /// Process one refresh cycle: drain triggers, enumerate the needed
    /// plan, order and budget it, dispatch to the worker pool, publish
    /// envelopes.
    pub async fn tick(&mut self) -> TickStats {
        self.tick_with_cancel(None).await
    }

    pub(crate) async fn tick_with_cancel(
        &mut self,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> TickStats {
        let now = Utc::now();
        let mut stats = TickStats::default();

        // 1. Trigger intake.
        let drained = triggers::drain_triggers(&self.trigger_file, self.trigger_horizon_secs, now);

        // 2. Active scope; triggered pools/pairs join for this tick.
        let mut pools = self.active_pools();
        let mut pairs = vec![self.default_pair.clone()];
        for trigger in &drained {
            if let Some(pool) = &trigger.pool_address {
                if !pools.contains(pool) && pools.len() < self.pool_cap {
                    pools.push(pool.clone());
                }
            }
            if let Some(pair) = &trigger.pair {
                if !pairs.contains(pair) {
                    pairs.push(pair.clone());
                }
            }
        }

        // 3-4. Needed plan plus forced trigger items, ordered and
        // filtered by the expensive budget.
        let mut items = plan::enumerate_plan(self.kv.entries(), &pools, &pairs, now);
        for trigger in &drained {
            items.extend(plan::items_for_trigger(
                trigger.query_key.as_deref(),
                trigger.pool_address.as_deref(),
                trigger.pair.as_deref(),
            ));
        }
        let items = plan::order_items(items);
        let (mut items, deferred) =
            plan::apply_expensive_budget(items, self.expensive_budget, self.budget_mode);
        stats.deferred = deferred;

        // 5. Bounded queue: surplus is dropped and recomputed next tick.
        let capacity = self.worker_count * QUEUE_FACTOR;
        if items.len() > capacity {
            stats.dropped = items.len() - capacity;
            warn!(
                "Refresh plan exceeds queue bound, dropping {} items until next tick",
                stats.dropped
            );
            items.truncate(capacity);
        }

        if items.is_empty() {
            debug!("No stale entries, skipping tick");
            return stats;
        }
        stats.enqueued = items.len();
        info!("Refreshing {} queries", items.len());

        let outcomes = self.dispatch(items, cancel).await;

        // Publish envelopes. Single writer: newest successful envelope
        // wins; a failure leaves a prior good envelope untouched.
        let mut updates: Vec<(String, CacheEnvelope)> = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(data) => {
                    stats.succeeded += 1;
                    updates.push((
                        outcome.cache_key,
                        CacheEnvelope::ok(
                            data,
                            outcome.descriptor.ttl_seconds,
                            outcome.descriptor.max_age_seconds,
                            self.backend.name(),
                        ),
                    ));
                }
                Err(reason) => {
                    stats.failed += 1;
                    warn!("Refresh failed for {}: {}", outcome.cache_key, reason);
                    let prior_good = self
                        .kv
                        .get(&outcome.cache_key)
                        .map(|e| e.ok)
                        .unwrap_or(false);
                    if !prior_good {
                        updates.push((
                            outcome.cache_key,
                            CacheEnvelope::error(
                                &reason,
                                outcome.descriptor.ttl_seconds,
                                outcome.descriptor.max_age_seconds,
                            ),
                        ));
                    }
                }
            }
        }
        if let Err(e) = self.kv.set_many(updates) {
            warn!("Failed to persist cache updates: {}", e);
        }

        info!(
            "Tick complete: {} ok, {} failed, {} deferred",
            stats.succeeded, stats.failed, stats.deferred
        );
        stats
    }

    async fn dispatch(
        &self,
        items: Vec<WorkItem>,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Vec<JobOutcome> {
        let count = items.len();
        let (job_tx, job_rx) = mpsc::channel::<WorkItem>(count);
        let (out_tx, mut out_rx) = mpsc::channel::<JobOutcome>(count);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));

        for item in items {
            // Capacity equals the item count, so this cannot block.
            let _ = job_tx.send(item).await;
        }
        drop(job_tx);

        let mut workers = JoinSet::new();
        for _ in 0..self.worker_count.min(count) {
            let job_rx = Arc::clone(&job_rx);
            let out_tx = out_tx.clone();
            let backend = Arc::clone(&self.backend);
            let job_timeout = self.job_timeout;
            let cancel = cancel.cloned();

            workers.spawn(async move {
                loop {
                    if let Some(c) = &cancel {
                        if *c.borrow() {
                            break;
                        }
                    }
                    let item = {
                        let mut rx = job_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(item) = item else { break };

                    let started = std::time::Instant::now();
                    let result = match tokio::time::timeout(
                        job_timeout,
                        backend.query(item.descriptor.method, &item.params),
                    )
                    .await
                    {
                        Ok(Ok(rows)) => Ok(rows),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!(
                            "timeout after {}ms",
                            started.elapsed().as_millis()
                        )),
                    };

                    let _ = out_tx
                        .send(JobOutcome {
                            descriptor: item.descriptor,
                            cache_key: item.cache_key,
                            result,
                        })
                        .await;
                }
            });
        }
        drop(out_tx);

        let mut outcomes = Vec::with_capacity(count);
        while let Some(outcome) = out_rx.recv().await {
            outcomes.push(outcome);
        }
        while workers.join_next().await.is_some() {}
        outcomes
    }

    /// Loop tick at the configured interval, observing the cooperative
    /// shutdown signal. In-flight workers complete or time out; no kill.
    pub async fn run_forever(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Scheduler loop starting (tick every {:?})",
            self.tick_interval
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let stats = self.tick_with_cancel(Some(&shutdown)).await;
            debug!("Tick stats: {:?}", stats);

            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Scheduler shut down cleanly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intel::cache::{build_key, Quality, QualityKvReader};
    use crate::scheduler::backend::MockAnalyticsBackend;
    use crate::scheduler::triggers::Trigger;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct FailingBackend;

    #[async_trait]
    impl AnalyticsBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }
        async fn query(
            &self,
            method: &str,
            _params: &BTreeMap<String, String>,
        ) -> Result<Value> {
            Err(crate::error::LabError::Backend {
                method: method.to_string(),
                reason: "synthetic outage".to_string(),
            })
        }
    }

    fn test_config(tmp: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.pipeline.base_dir = tmp.path().join("data").display().to_string();
        config.intel.cache_file = tmp.path().join("cache.json").display().to_string();
        config.intel.trigger_file = tmp.path().join("triggers.jsonl").display().to_string();
        config.scheduler.active_pools = vec!["0xAAA".to_string()];
        config
    }

    #[tokio::test]
    async fn tick_fills_cold_cache() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let mut scheduler =
            RefreshScheduler::new(&config, Arc::new(MockAnalyticsBackend)).unwrap();

        let stats = scheduler.tick().await;
        assert!(stats.enqueued > 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.succeeded, stats.enqueued);

        let reader = QualityKvReader::new(Path::new(&config.intel.cache_file));
        let (_, record) =
            reader.get_with_quality("gas_regime", json!([]), &[], Utc::now());
        assert_eq!(record.quality, Quality::Fresh);
    }

    #[tokio::test]
    async fn fresh_entries_drop_out_and_deferred_items_catch_up() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let mut scheduler =
            RefreshScheduler::new(&config, Arc::new(MockAnalyticsBackend)).unwrap();

        // First tick refreshes everything except the budget-deferred
        // expensive items; those drain one per tick afterwards.
        let first = scheduler.tick().await;
        assert!(first.enqueued > 0);
        assert_eq!(first.deferred, 1);

        let second = scheduler.tick().await;
        assert_eq!(second.enqueued, 1);
        assert_eq!(second.deferred, 0);

        let third = scheduler.tick().await;
        assert_eq!(third.enqueued, 0);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_prior_good_envelope() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        // Pre-seed a good but expired envelope for gas_regime.
        let cache_path = Path::new(&config.intel.cache_file);
        {
            let mut kv = QualityKv::open(cache_path).unwrap();
            let mut envelope =
                CacheEnvelope::ok(json!([{ "median_gwei": 25 }]), 300, 900, "seed");
            envelope.fetched_at = Some(Utc::now() - ChronoDuration::seconds(600));
            kv.set(&build_key("gas_regime", &[]), envelope).unwrap();
        }

        let mut scheduler = RefreshScheduler::new(&config, Arc::new(FailingBackend)).unwrap();
        let stats = scheduler.tick().await;
        assert!(stats.failed > 0);
        assert_eq!(stats.succeeded, 0);

        // Stale-while-revalidate: readers still see the last good value.
        let reader = QualityKvReader::new(cache_path);
        let (data, record) =
            reader.get_with_quality("gas_regime", json!([]), &[], Utc::now());
        assert_eq!(record.quality, Quality::Stale);
        assert_eq!(data, json!([{ "median_gwei": 25 }]));
        assert!(record.age_seconds.unwrap() >= 600);
    }

    #[tokio::test]
    async fn failed_refresh_without_prior_value_writes_error_envelope() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let mut scheduler = RefreshScheduler::new(&config, Arc::new(FailingBackend)).unwrap();
        scheduler.tick().await;

        let envelope = scheduler.kv().get(&build_key("gas_regime", &[])).unwrap();
        assert!(!envelope.ok);
        assert!(envelope.error.as_deref().unwrap().contains("synthetic outage"));
    }

    #[tokio::test]
    async fn trigger_forces_refresh_of_named_pool() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        config.scheduler.active_pools = Vec::new();

        triggers::append_triggers(
            Path::new(&config.intel.trigger_file),
            &[Trigger {
                timestamp: Utc::now(),
                reason: "out_of_range".to_string(),
                query_key: None,
                pool_address: Some("0xABC".to_string()),
                pair: None,
                priority: crate::intel::registry::Priority::P0,
            }],
        )
        .unwrap();

        let mut scheduler =
            RefreshScheduler::new(&config, Arc::new(MockAnalyticsBackend)).unwrap();
        scheduler.tick().await;

        let key = build_key(
            "pool_metrics",
            &[("pool_address", "0xABC"), ("window", "1h")],
        );
        let envelope = scheduler.kv().get(&key).unwrap();
        assert!(envelope.ok);
    }

    #[tokio::test]
    async fn run_forever_honours_shutdown() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        config.scheduler.tick_interval_secs = 3600;
        let mut scheduler =
            RefreshScheduler::new(&config, Arc::new(MockAnalyticsBackend)).unwrap();

        let (tx, rx) = shutdown_channel();
        let handle = tokio::spawn(async move {
            scheduler.run_forever(rx).await;
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler should stop after shutdown signal")
            .unwrap();
    }
}
