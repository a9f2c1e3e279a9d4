//! Real-mode proposal gate.
//!
//! Enforces hard bounds on chain/network, pool address shape, and the
//! numeric parameter ranges before any capital-adjacent execution. Mock
//! episodes bypass the gate entirely.

use tracing::warn;

use crate::domain::{ExecMode, Proposal};
use crate::error::{LabError, Result};

/// Recognized chain/network combinations.
const VALID_CHAINS: &[(&str, &[&str])] = &[
    ("ethereum", &["mainnet", "sepolia"]),
    ("arbitrum", &["mainnet"]),
    ("optimism", &["mainnet"]),
    ("polygon", &["mainnet"]),
    ("base", &["mainnet"]),
];

/// Documented parameter bounds; proposals outside these fail validation.
pub mod bounds {
    pub const WIDTH_PTS: (f64, f64) = (5.0, 5000.0);
    pub const REBALANCE_THRESHOLD_PCT: (f64, f64) = (0.01, 0.5);
    pub const SPREAD_BPS: (f64, f64) = (1.0, 500.0);
    pub const ORDER_SIZE: (f64, f64) = (0.01, 5.0);
    pub const REFRESH_INTERVAL_SECS: (f64, f64) = (10.0, 300.0);
}

fn check_range(name: &str, value: f64, (min, max): (f64, f64)) -> Result<()> {
    if !value.is_finite() {
        return Err(LabError::Validation(format!(
            "{name} must be a finite number, got {value}"
        )));
    }
    if value < min || value > max {
        return Err(LabError::Validation(format!(
            "{name} {value} outside [{min}, {max}]"
        )));
    }
    Ok(())
}

/// Validate a proposal before execution. Runs only when the effective
/// mode is real; `disable_validation` is a testing escape hatch.
pub fn validate_proposal(
    proposal: &Proposal,
    exec_mode: ExecMode,
    disable_validation: bool,
) -> Result<()> {
    if exec_mode == ExecMode::Mock {
        return Ok(());
    }
    if disable_validation {
        warn!("Pool validation disabled via config escape hatch");
        return Ok(());
    }

    // Chain / network
    let networks = VALID_CHAINS
        .iter()
        .find(|(chain, _)| *chain == proposal.chain)
        .map(|(_, networks)| *networks)
        .ok_or_else(|| {
            LabError::Validation(format!("Unrecognized chain: {}", proposal.chain))
        })?;
    if !networks.contains(&proposal.network.as_str()) {
        return Err(LabError::Validation(format!(
            "Invalid network '{}' for chain '{}'",
            proposal.network, proposal.chain
        )));
    }

    // Pool address: 0x + 40 hex chars
    let pool = proposal.pool_address.as_deref().ok_or_else(|| {
        LabError::Validation("Missing pool_address (required for real mode)".to_string())
    })?;
    let hex = pool.strip_prefix("0x").ok_or_else(|| {
        LabError::Validation(format!("Invalid pool_address format: {pool}"))
    })?;
    if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(LabError::Validation(format!(
            "Invalid pool_address: {pool} (expected 0x + 40 hex chars)"
        )));
    }

    // Numeric parameter bounds
    let p = &proposal.params;
    check_range("width_pts", p.width_pts, bounds::WIDTH_PTS)?;
    check_range(
        "rebalance_threshold_pct",
        p.rebalance_threshold_pct,
        bounds::REBALANCE_THRESHOLD_PCT,
    )?;
    check_range("spread_bps", p.spread_bps, bounds::SPREAD_BPS)?;
    check_range("order_size", p.order_size, bounds::ORDER_SIZE)?;
    check_range(
        "refresh_interval_secs",
        p.refresh_interval_secs,
        bounds::REFRESH_INTERVAL_SECS,
    )?;
    if !p.max_position.is_finite() || p.max_position <= 0.0 {
        return Err(LabError::Validation(format!(
            "max_position must be finite and > 0, got {}",
            p.max_position
        )));
    }

    Ok(())
}
