//! Error types for Pistis operations

/// Result type for Pistis operations
pub type Result<T> = std::result::Result<T, PistisError>;

/// Error types for the Pistis reliability-testing engine
#[derive(Debug, thiserror::Error)]
pub enum PistisError {
    /// Test id has not been registered with the runner
    #[error("Unknown test '{0}': register it with add_ground_truth before testing")]
    UnknownTest(String),

    /// A test layer was invoked before its prerequisite layer passed.
    ///
    /// This is a test-authoring bug, not a test outcome: no TestResult is
    /// produced or persisted when this error is raised.
    #[error(
        "Precondition not met for '{test_id}': the {missing} layer has not passed; \
         call {required_call} first"
    )]
    Precondition {
        /// Test id the caller tried to advance
        test_id: String,
        /// Name of the layer that has not passed yet
        missing: String,
        /// The runner method that must pass first
        required_call: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Agent or retrieval function error
    #[error("Agent error: {0}")]
    Agent(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for PistisError {
    fn from(s: String) -> Self {
        PistisError::Other(s)
    }
}

impl From<&str> for PistisError {
    fn from(s: &str) -> Self {
        PistisError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for PistisError {
    fn from(err: anyhow::Error) -> Self {
        PistisError::Other(err.to_string())
    }
}

impl From<rusqlite::Error> for PistisError {
    fn from(err: rusqlite::Error) -> Self {
        PistisError::Storage(err.to_string())
    }
}
