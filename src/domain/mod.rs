//! Typed data model for episodes, proposals, and artifacts.

pub mod episode;
pub mod ids;
pub mod metadata;
pub mod proposal;
pub mod reward;

pub use episode::{
    EpisodeResult, EpisodeStatus, ExecMode, PositionState, SimulationEnvelope,
};
pub use ids::{episode_id, iso_utc_z, run_id, short_hash, stable_hash64};
pub use metadata::{EpisodeMetadata, IntelHygiene, IntelSnapshotEntry};
pub use proposal::{DecisionBasis, Proposal, ProposalParams, ProposalStatus};
pub use reward::RewardBreakdown;
