//! Path error types
//!
//! Errors returned to whoever resolves, reads or publishes a path.

use crate::config::Protocol;

/// Error type for path operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// No configuration entry (exact, pattern or catch-all) matches the name
    NotConfigured(String),
    /// Path was removed while the request was pending
    Removed(String),
    /// Push-only path without a connected publisher
    NoPublisher(String),
    /// Push-only path already has a publisher
    AlreadyPublishing(String),
    /// Path pulls from upstream and does not accept publishers
    NotPublishable(String),
    /// Requesting protocol is disabled in the configuration
    ProtocolDisabled(Protocol),
    /// Source failed or timed out before becoming ready
    StartFailed { path: String, reason: String },
    /// Always-on source is down and waiting to be restarted
    NotReady(String),
    /// Path manager has been closed
    Closed,
}

impl std::fmt::Display for PathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathError::NotConfigured(name) => write!(f, "Path not configured: {}", name),
            PathError::Removed(name) => write!(f, "Path removed: {}", name),
            PathError::NoPublisher(name) => write!(f, "No one is publishing to path: {}", name),
            PathError::AlreadyPublishing(name) => {
                write!(f, "Someone is already publishing to path: {}", name)
            }
            PathError::NotPublishable(name) => {
                write!(f, "Path has an upstream source and cannot be published to: {}", name)
            }
            PathError::ProtocolDisabled(protocol) => write!(f, "Protocol disabled: {}", protocol),
            PathError::StartFailed { path, reason } => {
                write!(f, "Source of path {} failed to start: {}", path, reason)
            }
            PathError::NotReady(name) => write!(f, "Source of path not ready: {}", name),
            PathError::Closed => write!(f, "Path manager closed"),
        }
    }
}

impl std::error::Error for PathError {}
