use chrono::{DateTime, Utc};

/// Build a run identifier: `run_<YYYYMMDD_HHMMSS>`.
pub fn run_id(now: DateTime<Utc>) -> String {
    format!("run_{}", now.format("%Y%m%d_%H%M%S"))
}

/// Build an episode identifier: `ep_<YYYYMMDD_HHMMSS>_<n>`.
pub fn episode_id(now: DateTime<Utc>, index: usize) -> String {
    format!("ep_{}_{}", now.format("%Y%m%d_%H%M%S"), index)
}

/// Current UTC timestamp in ISO-8601 with a trailing `Z`.
pub fn iso_utc_z(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Stable 64-bit FNV-1a hash. Used for config hashes and simulator seed
/// derivation, where the value must not change across builds.
pub fn stable_hash64(input: &str) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in input.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// Short hex content hash for configuration provenance.
pub fn short_hash(input: &str) -> String {
    format!("{:08x}", stable_hash64(input) as u32)
}
