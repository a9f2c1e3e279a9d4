//! Per-tick refresh planning: enumerate needed work, order it, and apply
//! the expensive-query budget.

use chrono::DateTime;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};

use crate::intel::cache::{build_key, compute_quality, CacheEnvelope, Quality};
use crate::intel::registry::{
    self, CostClass, Priority, QueryDescriptor, QueryScope, WINDOWS,
};

/// One refresh job: a descriptor plus concrete parameters.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub descriptor: &'static QueryDescriptor,
    pub params: BTreeMap<String, String>,
    pub cache_key: String,
    /// Enqueued by a trigger regardless of freshness.
    pub forced: bool,
    /// Stale-while-revalidate refresh (prior value still servable).
    pub revalidate: bool,
}

impl WorkItem {
    fn new(descriptor: &'static QueryDescriptor, params: BTreeMap<String, String>) -> Self {
        let param_refs: Vec<(&str, &str)> = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let cache_key = build_key(descriptor.key, &param_refs);
        Self {
            descriptor,
            params,
            cache_key,
            forced: false,
            revalidate: false,
        }
    }

    fn forced(mut self) -> Self {
        self.forced = true;
        self
    }
}

/// Current freshness of a cache key given a store snapshot.
fn quality_of(
    snapshot: &HashMap<String, CacheEnvelope>,
    descriptor: &QueryDescriptor,
    cache_key: &str,
    now: DateTime<Utc>,
) -> Quality {
    match snapshot.get(cache_key) {
        Some(envelope) => {
            compute_quality(
                envelope,
                descriptor.ttl_seconds,
                descriptor.max_age_seconds,
                now,
            )
            .quality
        }
        None => Quality::Missing,
    }
}

/// Candidate parameter sets for one descriptor given the active scope.
/// An empty active-pool set simply yields no pool-scoped candidates.
fn candidate_params(
    descriptor: &'static QueryDescriptor,
    pools: &[String],
    pairs: &[String],
) -> Vec<BTreeMap<String, String>> {
    let mut out = Vec::new();
    match descriptor.scope {
        QueryScope::Global => out.push(BTreeMap::new()),
        QueryScope::Pool => {
            for pool in pools {
                let mut p = BTreeMap::new();
                p.insert("pool_address".to_string(), pool.clone());
                out.push(p);
            }
        }
        QueryScope::Pair => {
            for pair in pairs {
                let mut p = BTreeMap::new();
                p.insert("pair".to_string(), pair.clone());
                out.push(p);
            }
        }
        QueryScope::Windowed => {
            for window in WINDOWS {
                match descriptor.key {
                    // Swap history is tracked per pair, and additionally
                    // per (pair, pool) for the pool-scoped fallback read.
                    "swaps_for_pair" => {
                        for pair in pairs {
                            let mut p = BTreeMap::new();
                            p.insert("pair".to_string(), pair.clone());
                            p.insert("window".to_string(), window.to_string());
                            out.push(p);

                            for pool in pools {
                                let mut p = BTreeMap::new();
                                p.insert("pair".to_string(), pair.clone());
                                p.insert("pool_address".to_string(), pool.clone());
                                p.insert("window".to_string(), window.to_string());
                                out.push(p);
                            }
                        }
                    }
                    // Pool metrics are tracked per (pool, window).
                    "pool_metrics" => {
                        for pool in pools {
                            let mut p = BTreeMap::new();
                            p.insert("pool_address".to_string(), pool.clone());
                            p.insert("window".to_string(), window.to_string());
                            out.push(p);
                        }
                    }
                    _ => {
                        let mut p = BTreeMap::new();
                        p.insert("window".to_string(), window.to_string());
                        out.push(p);
                    }
                }
            }
        }
    }
    out
}

/// Enumerate the needed query plan: every enabled descriptor crossed
/// with the active scope, minus items whose envelope is fresh.
pub fn enumerate_plan(
    snapshot: &HashMap<String, CacheEnvelope>,
    pools: &[String],
    pairs: &[String],
    now: DateTime<Utc>,
) -> Vec<WorkItem> {
    let mut items = Vec::new();
    for descriptor in registry::enabled_queries() {
        for params in candidate_params(descriptor, pools, pairs) {
            let mut item = WorkItem::new(descriptor, params);
            match quality_of(snapshot, descriptor, &item.cache_key, now) {
                Quality::Fresh => continue,
                Quality::Stale => item.revalidate = true,
                Quality::Missing | Quality::TooOld => {}
            }
            items.push(item);
        }
    }
    items
}

/// Work items a single trigger fans out to. Unknown query keys are
/// ignored; pool/pair-scoped queries without a matching parameter are
/// skipped. Triggered items are forced (refreshed regardless of
/// freshness) and limited to P0/P1.
pub fn items_for_trigger(
    query_key: Option<&str>,
    pool: Option<&str>,
    pair: Option<&str>,
) -> Vec<WorkItem> {
    let descriptors: Vec<&'static QueryDescriptor> = match query_key {
        Some(key) => match registry::lookup(key) {
            Some(d) => vec![d],
            None => return Vec::new(),
        },
        None => registry::enabled_queries()
            .filter(|q| matches!(q.priority, Priority::P0 | Priority::P1))
            .collect(),
    };

    let mut items = Vec::new();
    for descriptor in descriptors {
        if !matches!(descriptor.priority, Priority::P0 | Priority::P1) {
            continue;
        }
        let pools: Vec<String> = pool.map(str::to_string).into_iter().collect();
        let pairs: Vec<String> = pair.map(str::to_string).into_iter().collect();
        for params in candidate_params(descriptor, &pools, &pairs) {
            items.push(WorkItem::new(descriptor, params).forced());
        }
    }
    items
}

/// Order: priority class ascending, cost class ascending within class,
/// dependency rank, then key lexical. Deduplicates by cache key (forced
/// wins over unforced).
pub fn order_items(mut items: Vec<WorkItem>) -> Vec<WorkItem> {
    items.sort_by(|a, b| {
        a.descriptor
            .priority
            .cmp(&b.descriptor.priority)
            .then(a.descriptor.cost.cmp(&b.descriptor.cost))
            .then(a.descriptor.depends_on.len().cmp(&b.descriptor.depends_on.len()))
            .then(a.cache_key.cmp(&b.cache_key))
    });

    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<WorkItem> = Vec::with_capacity(items.len());
    for item in items {
        match seen.get(&item.cache_key) {
            Some(&idx) => {
                if item.forced {
                    out[idx].forced = true;
                }
            }
            None => {
                seen.insert(item.cache_key.clone(), out.len());
                out.push(item);
            }
        }
    }
    out
}

/// How P0 items interact with the expensive budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetMode {
    /// P0 items are exempt from the expensive cap.
    Hard,
    /// P0 items consume budget first.
    Soft,
}

impl BudgetMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "soft" => BudgetMode::Soft,
            _ => BudgetMode::Hard,
        }
    }
}

/// Apply the per-tick cap on expensive-class items. Returns the kept
/// items and how many were deferred to a later tick.
pub fn apply_expensive_budget(
    items: Vec<WorkItem>,
    budget: usize,
    mode: BudgetMode,
) -> (Vec<WorkItem>, usize) {
    let mut spent = 0usize;
    let mut deferred = 0usize;
    let mut kept = Vec::with_capacity(items.len());

    for item in items {
        if item.descriptor.cost != CostClass::Expensive {
            kept.push(item);
            continue;
        }
        let exempt = mode == BudgetMode::Hard && item.descriptor.priority == Priority::P0;
        if exempt {
            kept.push(item);
            continue;
        }
        if spent < budget {
            spent += 1;
            kept.push(item);
        } else {
            deferred += 1;
        }
    }
    (kept, deferred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intel::cache::CacheEnvelope;
    use serde_json::json;

    fn fresh_snapshot_for(keys: &[&str]) -> HashMap<String, CacheEnvelope> {
        let mut map = HashMap::new();
        for key in keys {
            let descriptor = registry::lookup(key).unwrap();
            map.insert(
                build_key(key, &[]),
                CacheEnvelope::ok(
                    json!([]),
                    descriptor.ttl_seconds,
                    descriptor.max_age_seconds,
                    "test",
                ),
            );
        }
        map
    }

    #[test]
    fn empty_pool_set_skips_pool_scoped_queries() {
        let plan = enumerate_plan(&HashMap::new(), &[], &[], Utc::now());
        assert!(plan
            .iter()
            .all(|i| i.descriptor.scope != QueryScope::Pool));
        // Global queries still present.
        assert!(plan.iter().any(|i| i.descriptor.key == "gas_regime"));
    }

    #[test]
    fn fresh_entries_are_filtered_out() {
        let snapshot = fresh_snapshot_for(&["gas_regime"]);
        let plan = enumerate_plan(&snapshot, &[], &[], Utc::now());
        assert!(plan.iter().all(|i| i.descriptor.key != "gas_regime"));
    }

    #[test]
    fn pool_scope_fans_out_per_active_pool() {
        let pools = vec!["0xAAA".to_string(), "0xBBB".to_string()];
        let plan = enumerate_plan(&HashMap::new(), &pools, &[], Utc::now());
        let health_items: Vec<_> = plan
            .iter()
            .filter(|i| i.descriptor.key == "pool_health_score")
            .collect();
        assert_eq!(health_items.len(), 2);
    }

    #[test]
    fn windowed_scope_crosses_windows() {
        let pools = vec!["0xAAA".to_string()];
        let pairs = vec!["WETH-USDC".to_string()];
        let plan = enumerate_plan(&HashMap::new(), &pools, &pairs, Utc::now());

        let metric_items = plan
            .iter()
            .filter(|i| i.descriptor.key == "pool_metrics")
            .count();
        assert_eq!(metric_items, 3); // one pool x 3 windows

        let swap_items = plan
            .iter()
            .filter(|i| i.descriptor.key == "swaps_for_pair")
            .count();
        assert_eq!(swap_items, 6); // (pair + pair-pool) x 3 windows
    }

    #[test]
    fn ordering_puts_p0_first_and_cheap_before_expensive() {
        let pools = vec!["0xAAA".to_string()];
        let pairs = vec!["WETH-USDC".to_string()];
        let plan = order_items(enumerate_plan(&HashMap::new(), &pools, &pairs, Utc::now()));

        let priorities: Vec<Priority> =
            plan.iter().map(|i| i.descriptor.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort();
        assert_eq!(priorities, sorted);

        let first = plan.first().unwrap();
        assert_eq!(first.descriptor.priority, Priority::P0);
    }

    #[test]
    fn trigger_for_unknown_key_is_ignored() {
        let items = items_for_trigger(Some("not_a_query"), Some("0xABC"), None);
        assert!(items.is_empty());
    }

    #[test]
    fn trigger_fans_out_windowed_metrics_for_pool() {
        let items = items_for_trigger(None, Some("0xABC"), None);
        assert!(items
            .iter()
            .any(|i| i.descriptor.key == "pool_metrics"
                && i.params.get("window").map(String::as_str) == Some("1h")));
        assert!(items.iter().all(|i| i.forced));
        // P2/P3 queries are never triggered.
        assert!(items
            .iter()
            .all(|i| matches!(i.descriptor.priority, Priority::P0 | Priority::P1)));
    }

    #[test]
    fn hard_budget_exempts_p0_and_caps_the_rest() {
        let pools = vec!["0xAAA".to_string(), "0xBBB".to_string()];
        let plan = order_items(enumerate_plan(&HashMap::new(), &pools, &[], Utc::now()));
        let expensive_before = plan
            .iter()
            .filter(|i| i.descriptor.cost == CostClass::Expensive)
            .count();
        assert!(expensive_before > 1);

        let (kept, deferred) = apply_expensive_budget(plan, 1, BudgetMode::Hard);
        let expensive_after = kept
            .iter()
            .filter(|i| i.descriptor.cost == CostClass::Expensive)
            .count();
        assert_eq!(expensive_after, 1);
        assert_eq!(deferred, expensive_before - 1);
    }

    #[test]
    fn duplicate_cache_keys_collapse_with_forced_winning() {
        let normal = enumerate_plan(&HashMap::new(), &[], &[], Utc::now());
        let forced = items_for_trigger(Some("gas_regime"), None, None);
        let merged = order_items([normal, forced].concat());

        let gas: Vec<_> = merged
            .iter()
            .filter(|i| i.descriptor.key == "gas_regime")
            .collect();
        assert_eq!(gas.len(), 1);
        assert!(gas[0].forced);
    }
}
