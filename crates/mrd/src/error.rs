//! Error types for MRD streaming operations

use thiserror::Error;

/// Result type alias for MRD operations
pub type Result<T> = std::result::Result<T, MrdError>;

/// Error types that can occur during an MRD streaming session
#[derive(Error, Debug)]
pub enum MrdError {
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capability '{name}' failed: {source}")]
    Capability {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Capability resolution failed: {0}")]
    ConfigResolution(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MrdError {
    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new capability error wrapping the handler's failure
    pub fn capability(name: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Capability {
            name: name.into(),
            source,
        }
    }

    /// Create a new dataset error
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error should end the session without failing the process
    ///
    /// Protocol and transport errors terminate the read loop but are reported
    /// over the outbound channel rather than propagated as fatal failures.
    pub fn is_session_local(&self) -> bool {
        matches!(
            self,
            MrdError::Transport(_) | MrdError::Protocol(_) | MrdError::Capability { .. }
        )
    }
}
