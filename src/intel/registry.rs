//! Analytics query registry — single source of truth for every query the
//! scheduler may refresh.
//!
//! P0 = gating (required for decisions)
//! P1 = shaping (improves decisions)
//! P2 = risk (protects capital)
//! P3 = offline (analytics/backtesting)

use serde::{Deserialize, Serialize};

/// Parameter shape a query is refreshed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryScope {
    /// One item, no parameters
    Global,
    /// One item per active pool
    Pool,
    /// One item per active pair
    Pair,
    /// One item per (pool/pair, window label)
    Windowed,
}

/// Relative backend cost; orders cheap-first within a priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostClass {
    Cheap,
    Medium,
    Expensive,
}

/// Refresh priority class, P0 highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

/// Metadata for a single analytics query.
#[derive(Debug, Clone)]
pub struct QueryDescriptor {
    /// Unique identifier, also the cache key stem
    pub key: &'static str,
    /// Backend method name
    pub method: &'static str,
    pub scope: QueryScope,
    pub cost: CostClass,
    pub priority: Priority,
    /// How long the cache is fresh
    pub ttl_seconds: i64,
    /// Maximum age before the value is too old to serve
    pub max_age_seconds: i64,
    /// Advisory ordering hints: refresh these first within a tick
    pub depends_on: &'static [&'static str],
    pub enabled_default: bool,
    pub description: &'static str,
}

/// Enumerated window vocabulary for windowed queries.
pub const WINDOWS: [&str; 3] = ["1h", "6h", "24h"];

static REGISTRY: &[QueryDescriptor] = &[
    // ========== P0: Gating ==========
    QueryDescriptor {
        key: "gas_regime",
        method: "get_gas_regime",
        scope: QueryScope::Global,
        cost: CostClass::Cheap,
        priority: Priority::P0,
        ttl_seconds: 300,
        max_age_seconds: 900,
        depends_on: &[],
        enabled_default: true,
        description: "Current gas prices and optimal execution windows",
    },
    QueryDescriptor {
        key: "pool_health_score",
        method: "get_pool_health_score",
        scope: QueryScope::Pool,
        cost: CostClass::Cheap,
        priority: Priority::P0,
        ttl_seconds: 600,
        max_age_seconds: 1800,
        depends_on: &["pool_metrics"],
        enabled_default: true,
        description: "Composite pool health metric",
    },
    QueryDescriptor {
        key: "rebalance_hint",
        method: "get_rebalance_hint",
        scope: QueryScope::Pool,
        cost: CostClass::Cheap,
        priority: Priority::P0,
        ttl_seconds: 600,
        max_age_seconds: 1800,
        depends_on: &["pool_metrics"],
        enabled_default: true,
        description: "Automated rebalancing signal generator",
    },
    // ========== P1: Shaping ==========
    QueryDescriptor {
        key: "pool_metrics",
        method: "get_pool_metrics",
        scope: QueryScope::Windowed,
        cost: CostClass::Medium,
        priority: Priority::P1,
        ttl_seconds: 300,
        max_age_seconds: 1800,
        depends_on: &[],
        enabled_default: true,
        description: "Volume, liquidity, and price per pool and window",
    },
    QueryDescriptor {
        key: "swaps_for_pair",
        method: "get_swaps_for_pair",
        scope: QueryScope::Windowed,
        cost: CostClass::Medium,
        priority: Priority::P1,
        ttl_seconds: 300,
        max_age_seconds: 1800,
        depends_on: &[],
        enabled_default: true,
        description: "Raw swap rows per pair and window",
    },
    QueryDescriptor {
        key: "dynamic_fee_analysis",
        method: "get_dynamic_fee_analysis",
        scope: QueryScope::Pool,
        cost: CostClass::Medium,
        priority: Priority::P1,
        ttl_seconds: 1800,
        max_age_seconds: 7200,
        depends_on: &[],
        enabled_default: true,
        description: "Fee tier performance and volume patterns",
    },
    QueryDescriptor {
        key: "fee_tier_optimization",
        method: "get_fee_tier_optimization",
        scope: QueryScope::Pool,
        cost: CostClass::Medium,
        priority: Priority::P1,
        ttl_seconds: 3600,
        max_age_seconds: 14400,
        depends_on: &[],
        enabled_default: true,
        description: "Fee tier profitability comparison",
    },
    QueryDescriptor {
        key: "liquidity_depth",
        method: "get_liquidity_depth",
        scope: QueryScope::Pool,
        cost: CostClass::Expensive,
        priority: Priority::P1,
        ttl_seconds: 21600,
        max_age_seconds: 86400,
        depends_on: &[],
        enabled_default: true,
        description: "Tick-by-tick liquidity distribution heatmap",
    },
    QueryDescriptor {
        key: "liquidity_competition",
        method: "get_liquidity_competition",
        scope: QueryScope::Pool,
        cost: CostClass::Expensive,
        priority: Priority::P1,
        ttl_seconds: 21600,
        max_age_seconds: 86400,
        depends_on: &[],
        enabled_default: true,
        description: "LP concentration and competitive positioning",
    },
    // ========== P2: Risk ==========
    QueryDescriptor {
        key: "mev_risk",
        method: "get_mev_risk",
        scope: QueryScope::Pool,
        cost: CostClass::Medium,
        priority: Priority::P2,
        ttl_seconds: 3600,
        max_age_seconds: 14400,
        depends_on: &[],
        enabled_default: true,
        description: "MEV sandwich attack frequency and protection",
    },
    QueryDescriptor {
        key: "toxic_flow_index",
        method: "get_toxic_flow_index",
        scope: QueryScope::Pool,
        cost: CostClass::Medium,
        priority: Priority::P2,
        ttl_seconds: 7200,
        max_age_seconds: 28800,
        depends_on: &[],
        enabled_default: true,
        description: "Loss-versus-rebalancing (LVR) estimator",
    },
    QueryDescriptor {
        key: "jit_liquidity_monitor",
        method: "get_jit_liquidity_monitor",
        scope: QueryScope::Pool,
        cost: CostClass::Medium,
        priority: Priority::P2,
        ttl_seconds: 3600,
        max_age_seconds: 14400,
        depends_on: &[],
        enabled_default: true,
        description: "Just-in-time liquidity attack detection",
    },
    QueryDescriptor {
        key: "whale_sentiment",
        method: "get_whale_sentiment",
        scope: QueryScope::Pair,
        cost: CostClass::Medium,
        priority: Priority::P2,
        ttl_seconds: 3600,
        max_age_seconds: 14400,
        depends_on: &[],
        enabled_default: false,
        description: "Large wallet activity and whale trades",
    },
    // ========== P3: Offline ==========
    QueryDescriptor {
        key: "impermanent_loss_tracker",
        method: "get_impermanent_loss_tracker",
        scope: QueryScope::Pool,
        cost: CostClass::Expensive,
        priority: Priority::P3,
        ttl_seconds: 21600,
        max_age_seconds: 86400,
        depends_on: &[],
        enabled_default: false,
        description: "Real-time IL calculations and historical trends",
    },
    QueryDescriptor {
        key: "cross_dex_migration",
        method: "get_cross_dex_migration",
        scope: QueryScope::Pool,
        cost: CostClass::Expensive,
        priority: Priority::P3,
        ttl_seconds: 21600,
        max_age_seconds: 86400,
        depends_on: &[],
        enabled_default: false,
        description: "Liquidity flows between DEXs",
    },
    QueryDescriptor {
        key: "correlation_matrix",
        method: "get_correlation_matrix",
        scope: QueryScope::Pool,
        cost: CostClass::Expensive,
        priority: Priority::P3,
        ttl_seconds: 86400,
        max_age_seconds: 259200,
        depends_on: &[],
        enabled_default: false,
        description: "Asset correlation analysis for diversification",
    },
    QueryDescriptor {
        key: "dynamic_config",
        method: "get_dynamic_config",
        scope: QueryScope::Global,
        cost: CostClass::Cheap,
        priority: Priority::P3,
        ttl_seconds: 3600,
        max_age_seconds: 14400,
        depends_on: &[],
        enabled_default: false,
        description: "Analytics-optimized strategy configuration",
    },
];

/// The full registry; read-only at runtime.
pub fn registry() -> &'static [QueryDescriptor] {
    REGISTRY
}

/// Look up a descriptor by key.
pub fn lookup(key: &str) -> Option<&'static QueryDescriptor> {
    REGISTRY.iter().find(|q| q.key == key)
}

/// Queries enabled by default.
pub fn enabled_queries() -> impl Iterator<Item = &'static QueryDescriptor> {
    REGISTRY.iter().filter(|q| q.enabled_default)
}
