//! Scheduler behavior end to end: trigger-to-refresh bound, active-pool
//! discovery from recent runs, and budget pacing across ticks.

use chrono::Utc;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use clmm_lab::config::AppConfig;
use clmm_lab::intel::cache::{build_key, Quality, QualityKvReader};
use clmm_lab::intel::registry::Priority;
use clmm_lab::scheduler::backend::MockAnalyticsBackend;
use clmm_lab::scheduler::triggers::{self, Trigger};
use clmm_lab::scheduler::RefreshScheduler;

fn config_for(tmp: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.pipeline.base_dir = tmp.path().join("data").display().to_string();
    config.intel.cache_file = tmp.path().join("cache.json").display().to_string();
    config.intel.trigger_file = tmp.path().join("triggers.jsonl").display().to_string();
    config.scheduler.active_pools = vec![];
    config
}

/// Trigger latency bound at tick granularity: a trigger appended before a tick causes the
/// matching envelope to be refreshed during that tick.
#[tokio::test]
async fn trigger_refresh_lands_within_one_tick() {
    let tmp = TempDir::new().unwrap();
    let config = config_for(&tmp);

    triggers::append_triggers(
        Path::new(&config.intel.trigger_file),
        &[Trigger {
            timestamp: Utc::now(),
            reason: "out_of_range".to_string(),
            query_key: None,
            pool_address: Some("0xABC".to_string()),
            pair: None,
            priority: Priority::P0,
        }],
    )
    .unwrap();

    let before = Utc::now();
    let mut scheduler =
        RefreshScheduler::new(&config, Arc::new(MockAnalyticsBackend)).unwrap();
    let stats = scheduler.tick().await;
    assert!(stats.succeeded > 0);

    let reader = QualityKvReader::new(Path::new(&config.intel.cache_file));
    let envelope = reader
        .get(&build_key(
            "pool_metrics",
            &[("pool_address", "0xABC"), ("window", "1h")],
        ))
        .expect("trigger should have refreshed pool metrics");
    assert!(envelope.ok);
    assert!(envelope.fetched_at.unwrap() >= before);

    // A subsequent episode-side read sees the value fresh.
    let (_, record) = reader.get_with_quality(
        "pool_metrics",
        json!({}),
        &[("pool_address", "0xABC"), ("window", "1h")],
        Utc::now(),
    );
    assert_eq!(record.quality, Quality::Fresh);
}

/// A forced trigger refreshes even an already-fresh key.
#[tokio::test]
async fn forced_trigger_overrides_freshness() {
    let tmp = TempDir::new().unwrap();
    let config = config_for(&tmp);
    let mut scheduler =
        RefreshScheduler::new(&config, Arc::new(MockAnalyticsBackend)).unwrap();

    scheduler.tick().await;
    let key = build_key("gas_regime", &[]);
    let first_fetch = scheduler.kv().get(&key).unwrap().fetched_at.unwrap();

    triggers::append_triggers(
        Path::new(&config.intel.trigger_file),
        &[Trigger {
            timestamp: Utc::now(),
            reason: "gas_drop".to_string(),
            query_key: Some("gas_regime".to_string()),
            pool_address: None,
            pair: None,
            priority: Priority::P0,
        }],
    )
    .unwrap();

    let stats = scheduler.tick().await;
    assert!(stats.enqueued >= 1);
    let second_fetch = scheduler.kv().get(&key).unwrap().fetched_at.unwrap();
    assert!(second_fetch >= first_fetch);
}

/// A trigger naming an unknown query key is ignored without error.
#[tokio::test]
async fn unknown_trigger_key_is_ignored() {
    let tmp = TempDir::new().unwrap();
    let mut config = config_for(&tmp);
    config.scheduler.active_pools = vec![];

    triggers::append_triggers(
        Path::new(&config.intel.trigger_file),
        &[Trigger {
            timestamp: Utc::now(),
            reason: "noise".to_string(),
            query_key: Some("definitely_not_registered".to_string()),
            pool_address: None,
            pair: None,
            priority: Priority::P0,
        }],
    )
    .unwrap();

    let mut scheduler =
        RefreshScheduler::new(&config, Arc::new(MockAnalyticsBackend)).unwrap();
    let stats = scheduler.tick().await;
    // Only the regular plan ran; nothing crashed.
    assert_eq!(stats.failed, 0);
}

/// Active pools are discovered from the most recent run's proposals
/// when not configured explicitly.
#[tokio::test]
async fn active_pools_come_from_recent_run_proposals() {
    let tmp = TempDir::new().unwrap();
    let config = config_for(&tmp);

    // Lay down a prior run with one proposal naming a pool.
    let ep_dir = Path::new(&config.pipeline.base_dir)
        .join("runs")
        .join("run_20250101_000000")
        .join("episodes")
        .join("ep_20250101_000000_0");
    std::fs::create_dir_all(&ep_dir).unwrap();
    std::fs::write(
        ep_dir.join("proposal.json"),
        serde_json::to_vec_pretty(&json!({
            "episode_id": "ep_20250101_000000_0",
            "pool_address": "0xDDD26FEEb64F039a2c41296FcB3f564088e6A0c2",
        }))
        .unwrap(),
    )
    .unwrap();

    let mut scheduler =
        RefreshScheduler::new(&config, Arc::new(MockAnalyticsBackend)).unwrap();
    scheduler.tick().await;

    let key = build_key(
        "pool_health_score",
        &[("pool_address", "0xDDD26FEEb64F039a2c41296FcB3f564088e6A0c2")],
    );
    assert!(
        scheduler.kv().get(&key).is_some(),
        "pool-scoped query should have been refreshed for the discovered pool"
    );
}

/// With no active pools at all, pool-scoped queries are skipped and
/// the tick still succeeds for global ones.
#[tokio::test]
async fn empty_pool_set_refreshes_only_global_and_pair_scopes() {
    let tmp = TempDir::new().unwrap();
    let config = config_for(&tmp);
    let mut scheduler =
        RefreshScheduler::new(&config, Arc::new(MockAnalyticsBackend)).unwrap();

    let stats = scheduler.tick().await;
    assert!(stats.succeeded > 0);
    assert_eq!(stats.failed, 0);

    // Global query refreshed...
    assert!(scheduler.kv().get(&build_key("gas_regime", &[])).is_some());
    // ...but no pool-scoped entries exist.
    let has_pool_entry = scheduler
        .kv()
        .entries()
        .keys()
        .any(|k| k.contains("pool_address"));
    assert!(!has_pool_entry);
}

/// The expensive budget drains deferred items across consecutive ticks
/// rather than bursting them in one.
#[tokio::test]
async fn expensive_budget_paces_across_ticks() {
    let tmp = TempDir::new().unwrap();
    let mut config = config_for(&tmp);
    config.scheduler.active_pools = vec!["0xAAA".to_string(), "0xBBB".to_string()];
    // Two pools x two expensive queries = four expensive items.
    let mut scheduler =
        RefreshScheduler::new(&config, Arc::new(MockAnalyticsBackend)).unwrap();

    let first = scheduler.tick().await;
    assert_eq!(first.deferred, 3);
    let second = scheduler.tick().await;
    assert_eq!(second.deferred, 2);
    let third = scheduler.tick().await;
    assert_eq!(third.deferred, 1);
    let fourth = scheduler.tick().await;
    assert_eq!(fourth.deferred, 0);
}
