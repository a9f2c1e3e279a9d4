use thiserror::Error;

/// Main error type for the research pipeline
#[derive(Error, Debug)]
pub enum LabError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    // Proposal validation errors (real-mode gate)
    #[error("Validation failed: {0}")]
    Validation(String),

    // Executor errors
    #[error("Executor timeout after {elapsed_ms}ms")]
    ExecutorTimeout { elapsed_ms: u64 },

    #[error("Safety block: {0}")]
    SafetyBlock(String),

    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    // Artifact errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema error: {0}")]
    Schema(String),

    // Scheduler / analytics backend errors
    #[error("Backend failure: {method} - {reason}")]
    Backend { method: String, reason: String },

    #[error("Unknown query key: {0}")]
    UnknownQuery(String),

    // Network errors (live gateway, HTTP analytics caller)
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Agent errors
    #[error("Agent failure: {0}")]
    Agent(String),

    // Generic errors
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for LabError
pub type Result<T> = std::result::Result<T, LabError>;

impl LabError {
    /// Stage label used in failure artifacts.
    pub fn stage(&self) -> &'static str {
        match self {
            LabError::Agent(_) => "agent",
            LabError::Validation(_) => "validation",
            LabError::Io(_) | LabError::Schema(_) | LabError::Json(_) => "artifacts",
            _ => "harness",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_labels_match_failure_taxonomy() {
        assert_eq!(LabError::Agent("exit 1".into()).stage(), "agent");
        assert_eq!(LabError::Validation("spread".into()).stage(), "validation");
        assert_eq!(LabError::Schema("bad payload".into()).stage(), "artifacts");
        assert_eq!(
            LabError::ExecutorTimeout { elapsed_ms: 30_000 }.stage(),
            "harness"
        );
    }
}
