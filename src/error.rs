//! Error handling for the seeding agent
//!
//! Only transport termination and bearer-token problems end a session.
//! Everything else (execution failures, repair misses, protocol noise) is
//! absorbed into per-task or per-table outcome data and never becomes an
//! `AgentError` on the hot path.

use thiserror::Error;

/// Main error type for the agent library
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Stream status: {0}")]
    Status(#[from] tonic::Status),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl AgentError {
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Message without the variant prefix, for re-wrapping.
    pub fn detail(&self) -> String {
        match self {
            Self::Auth(m) | Self::Precondition(m) | Self::Protocol(m) | Self::Config(m) => m.clone(),
            other => other.to_string(),
        }
    }

    /// Whether this error should end the seeding session.
    pub fn is_session_ending(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Status(_) | Self::Auth(_))
    }
}

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

// ---------------------------------------------------------------------------
// Stream error classification
// ---------------------------------------------------------------------------

/// Coarse category of a transport termination message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    Network,
    Auth,
    Timeout,
    Internal,
    Unavailable,
    Unknown,
}

impl StreamErrorKind {
    /// Classify a stream error message. Patterns are checked in a fixed order,
    /// so a message matching several categories gets the first one.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();

        if lower.contains("rst_stream") || lower.contains("connection reset") {
            return Self::Network;
        }
        if lower.contains("internal_error") {
            return Self::Internal;
        }
        if lower.contains("unavailable") {
            return Self::Unavailable;
        }
        if lower.contains("deadline") || lower.contains("timeout") {
            return Self::Timeout;
        }
        if lower.contains("unauthenticated") || lower.contains("unauthorized") {
            return Self::Auth;
        }
        Self::Unknown
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Auth => "auth",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
            Self::Unknown => "unknown",
        }
    }

    /// Short user-facing description of what went wrong.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Network => "The connection to the seeding service was interrupted unexpectedly.",
            Self::Auth => "Authentication with the seeding service failed.",
            Self::Timeout => "The connection to the seeding service timed out.",
            Self::Internal => "An internal error occurred on the seeding service.",
            Self::Unavailable => "The seeding service is currently unavailable.",
            Self::Unknown => "The seeding session was interrupted.",
        }
    }

    /// What the user should do next.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::Auth => "Please log in again and retry",
            _ => "Please try running the seed again",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_stream_errors() {
        assert_eq!(
            StreamErrorKind::classify("Unknown: h2 protocol error: RST_STREAM"),
            StreamErrorKind::Network
        );
        assert_eq!(
            StreamErrorKind::classify("connection reset by peer"),
            StreamErrorKind::Network
        );
        assert_eq!(
            StreamErrorKind::classify("Internal: INTERNAL_ERROR"),
            StreamErrorKind::Internal
        );
        assert_eq!(
            StreamErrorKind::classify("Unavailable: service unavailable"),
            StreamErrorKind::Unavailable
        );
        assert_eq!(
            StreamErrorKind::classify("DeadlineExceeded: deadline has elapsed"),
            StreamErrorKind::Timeout
        );
        assert_eq!(
            StreamErrorKind::classify("Unauthenticated: invalid token"),
            StreamErrorKind::Auth
        );
        assert_eq!(
            StreamErrorKind::classify("something else"),
            StreamErrorKind::Unknown
        );
    }

    #[test]
    fn test_auth_hint_differs() {
        assert_ne!(StreamErrorKind::Auth.hint(), StreamErrorKind::Network.hint());
    }

    #[test]
    fn test_session_ending_errors() {
        assert!(AgentError::auth("expired").is_session_ending());
        assert!(AgentError::Status(tonic::Status::unavailable("down")).is_session_ending());
        assert!(!AgentError::precondition("db_name").is_session_ending());
        assert!(!AgentError::Protocol("unknown id".into()).is_session_ending());
    }
}
