//! Eskka Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for eskka operations
pub type Result<T> = std::result::Result<T, Error>;

/// Eskka error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // Codec errors
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Unsupported state format version: {0}")]
    UnsupportedStateVersion(u8),

    // State errors
    #[error("Stale state: proposed version {proposed} <= current {current}")]
    StaleState { proposed: u64, current: u64 },

    #[error("State update failed: {0}")]
    StateApplication(String),

    #[error("State store has shut down")]
    StoreClosed,

    // Publish errors
    #[error("Quorum unavailable: {up}/{required} seed members up")]
    QuorumUnavailable { up: usize, required: usize },

    #[error("No local master on this node")]
    NoLocalMaster,

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Frame checksum mismatch")]
    FrameChecksum,

    // Membership errors
    #[error("Unknown member: {0}")]
    UnknownMember(String),

    #[error("Node was downed and may not rejoin without a restart")]
    DownedNode,

    // Lifecycle errors
    #[error("Discovery not started")]
    NotStarted,

    #[error("Timed out waiting to join the cluster")]
    StartupTimeout,

    #[error("Shutdown in progress")]
    ShuttingDown,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is transient and worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::QuorumUnavailable { .. }
        )
    }
}

/// Failure reported inside a publish acknowledgement.
///
/// Unlike [`Error`] this travels on the wire, so it carries strings
/// rather than source errors.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishError {
    #[error("quorum unavailable on recipient")]
    QuorumUnavailable,

    #[error("state decode failed: {0}")]
    Decode(String),

    #[error("state application failed: {0}")]
    Application(String),

    #[error("no acknowledgement before the publish deadline")]
    Timeout,
}

impl From<&Error> for PublishError {
    fn from(err: &Error) -> Self {
        match err {
            Error::QuorumUnavailable { .. } => PublishError::QuorumUnavailable,
            Error::Codec(e) => PublishError::Decode(e.to_string()),
            Error::UnsupportedStateVersion(v) => {
                PublishError::Decode(format!("unsupported state format version {v}"))
            }
            other => PublishError::Application(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("boom".into()).is_transient());
        assert!(Error::QuorumUnavailable { up: 1, required: 2 }.is_transient());
        assert!(!Error::NotStarted.is_transient());
        assert!(!Error::DownedNode.is_transient());
    }

    #[test]
    fn test_publish_error_from_error() {
        let err = Error::QuorumUnavailable { up: 1, required: 2 };
        assert_eq!(PublishError::from(&err), PublishError::QuorumUnavailable);

        let err = Error::StateApplication("bad".into());
        assert!(matches!(PublishError::from(&err), PublishError::Application(_)));
    }
}
