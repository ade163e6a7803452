//! Error types for the replication pump
//!
//! Classifies failures into the two classes the dispatch loop cares about:
//! transient network errors that are retried forever, and everything else,
//! which stops the pump.

use thiserror::Error;

/// Replication pump errors
#[derive(Error, Debug)]
pub enum Error {
    /// The upstream connection dropped mid-stream; the pump reconnects.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No candidate server accepted the connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// A transaction id that does not parse as `domain-server-sequence`.
    #[error("malformed GTID '{0}'")]
    MalformedGtid(String),

    /// The stream has already advanced past the checkpointed transaction.
    #[error("GTID '{observed}' is newer than '{target}', cannot continue conversion process")]
    ResumeImpossible { observed: String, target: String },

    /// A downstream sink rejected an open, an apply or a commit.
    #[error("apply error: {0}")]
    Apply(String),

    /// The checkpoint file could not be read or replaced.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[source] std::io::Error),

    /// Replication protocol violation or undecodable event.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn apply(msg: impl Into<String>) -> Self {
        Self::Apply(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(msg.into())
    }

    pub fn connection_refused(msg: impl Into<String>) -> Self {
        Self::ConnectionRefused(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether the dispatch loop may recover by dropping the session and
    /// reconnecting. Everything that is not transient stops the pump.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::ConnectionRefused(_))
    }
}

/// Result type for pump operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::connection_lost("reset by peer").is_transient());
        assert!(Error::connection_refused("10.0.0.1:3306").is_transient());

        assert!(!Error::apply("table open failed").is_transient());
        assert!(!Error::MalformedGtid("x".into()).is_transient());
        assert!(!Error::protocol("short packet").is_transient());
        assert!(!Error::config("no servers").is_transient());
        assert!(!Error::Checkpoint(std::io::Error::other("rename failed")).is_transient());
    }

    #[test]
    fn test_display() {
        let err = Error::ResumeImpossible {
            observed: "0-1-150".into(),
            target: "0-1-100".into(),
        };
        let text = err.to_string();
        assert!(text.contains("0-1-150"));
        assert!(text.contains("0-1-100"));
    }
}
