use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for the failover service
#[derive(Error, Debug)]
pub enum PassError {
    // Subscription errors
    #[error("Subscription fetch failed: {0}")]
    SubscriptionFetch(String),

    #[error("Base64 decode failed: {0}")]
    Decode(String),

    #[error("Invalid proxy URL: {0}")]
    InvalidCandidate(String),

    #[error("Unsupported proxy scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Required executable not found: {}", .0.display())]
    MissingExecutable(PathBuf),

    // Candidate pool errors
    #[error("No server available")]
    NoCandidatesAvailable,

    // Process lifecycle errors
    #[error("Failed to spawn proxy process: {0}")]
    Spawn(String),

    // Health check errors
    #[error("Probe failed: {0}")]
    ProbeFailed(String),

    #[error("Health-check failed after {attempts} attempts")]
    HealthCheckFailed { attempts: u32 },

    #[error("Failed to build probe client: {0}")]
    ProbeClient(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for gfwpass operations
pub type Result<T> = std::result::Result<T, PassError>;

impl PassError {
    /// Network hiccups that are retried on the next tick or drive a rotation
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PassError::SubscriptionFetch(_)
                | PassError::ProbeFailed(_)
                | PassError::HealthCheckFailed { .. }
                | PassError::Spawn(_)
        )
    }

    /// Errors that terminate the service when they reach the top level
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PassError::NoCandidatesAvailable
                | PassError::MissingExecutable(_)
                | PassError::InvalidConfig(_)
                | PassError::ProbeClient(_)
                | PassError::Internal(_)
        )
    }

    /// Errors confined to a single candidate line; the batch carries on
    pub fn is_per_candidate(&self) -> bool {
        matches!(
            self,
            PassError::InvalidCandidate(_) | PassError::UnsupportedScheme(_) | PassError::Decode(_)
        )
    }
}

impl From<reqwest::Error> for PassError {
    fn from(err: reqwest::Error) -> Self {
        PassError::SubscriptionFetch(err.to_string())
    }
}

impl From<url::ParseError> for PassError {
    fn from(err: url::ParseError) -> Self {
        PassError::InvalidCandidate(err.to_string())
    }
}

impl From<base64::DecodeError> for PassError {
    fn from(err: base64::DecodeError) -> Self {
        PassError::Decode(err.to_string())
    }
}

impl From<serde_yaml::Error> for PassError {
    fn from(err: serde_yaml::Error) -> Self {
        PassError::InvalidConfig(err.to_string())
    }
}
