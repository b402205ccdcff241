//! Error types
//!
//! Each concern has its own error enum; [`Error`] wraps them for callers
//! that only want one type.

use std::fmt;
use std::time::Duration;

pub use crate::path::error::PathError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Configuration could not be loaded or is invalid
    Config(ConfigError),
    /// Malformed transport stream data
    Container(ContainerError),
    /// Upstream source failure
    Source(SourceError),
    /// Path resolution or attach failure
    Path(PathError),
    /// I/O error
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "config error: {}", e),
            Error::Container(e) => write!(f, "container error: {}", e),
            Error::Source(e) => write!(f, "source error: {}", e),
            Error::Path(e) => write!(f, "path error: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(e) => Some(e),
            Error::Container(e) => Some(e),
            Error::Source(e) => Some(e),
            Error::Path(e) => Some(e),
            Error::Io(e) => Some(e),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<ContainerError> for Error {
    fn from(e: ContainerError) -> Self {
        Error::Container(e)
    }
}

impl From<SourceError> for Error {
    fn from(e: SourceError) -> Self {
        Error::Source(e)
    }
}

impl From<PathError> for Error {
    fn from(e: PathError) -> Self {
        Error::Path(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    /// YAML syntax or type error
    Yaml(String),
    /// Unparseable duration value
    InvalidDuration(String),
    /// Unsupported or malformed `source` value
    InvalidSource { path: String, reason: String },
    /// Path name (or pattern) not acceptable
    InvalidPathName(String),
    /// Combination of options that cannot work together
    Conflict { path: String, reason: &'static str },
    /// Config file could not be read
    Io(std::io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Yaml(msg) => write!(f, "invalid YAML: {}", msg),
            ConfigError::InvalidDuration(v) => write!(f, "invalid duration: {:?}", v),
            ConfigError::InvalidSource { path, reason } => {
                write!(f, "path '{}': invalid source: {}", path, reason)
            }
            ConfigError::InvalidPathName(name) => write!(f, "invalid path name: {:?}", name),
            ConfigError::Conflict { path, reason } => write!(f, "path '{}': {}", path, reason),
            ConfigError::Io(e) => write!(f, "cannot read config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Transport stream parse errors
///
/// These are never fatal to a source: the offending packet or payload
/// unit is skipped and demuxing continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerError {
    /// Expected 0x47 at a packet boundary
    SyncLost { found: u8 },
    /// Packet or section shorter than its header claims
    Truncated(&'static str),
    /// Packet header, adaptation field, PSI section or PES header rejected
    Packet { pid: u16, reason: String },
    /// PES header inconsistent with its payload unit
    InvalidPes(&'static str),
    /// Continuity counter jumped; the partial payload unit was dropped
    Discontinuity { pid: u16, expected: u8, found: u8 },
}

impl fmt::Display for ContainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerError::SyncLost { found } => {
                write!(f, "sync byte missing (found 0x{:02x})", found)
            }
            ContainerError::Truncated(what) => write!(f, "truncated {}", what),
            ContainerError::Packet { pid, reason } => {
                write!(f, "invalid packet on PID {}: {}", pid, reason)
            }
            ContainerError::InvalidPes(reason) => write!(f, "invalid PES header: {}", reason),
            ContainerError::Discontinuity {
                pid,
                expected,
                found,
            } => write!(
                f,
                "continuity error on PID {}: expected {}, found {}",
                pid, expected, found
            ),
        }
    }
}

impl std::error::Error for ContainerError {}

/// Upstream source errors
#[derive(Debug, Clone)]
pub enum SourceError {
    /// Upstream unreachable (DNS, refused, reset, request timeout)
    Connect { url: String, reason: String },
    /// Upstream answered with a non-success status
    HttpStatus { url: String, status: u16 },
    /// Response body broke off or could not be decoded
    Read { url: String, reason: String },
    /// Playlist could not be parsed
    Playlist(String),
    /// Segment yielded parse errors and no usable payload
    MalformedSegment { url: String, errors: u64 },
    /// Upstream ended the stream (end of playlist, publisher gone)
    Terminated,
    /// No bootstrap parameter set within the start timeout
    StartTimeout(Duration),
    /// Consecutive failure streak reached the configured maximum
    TooManyFailures { count: u32, last: Box<SourceError> },
}

impl SourceError {
    /// Whether this error ends the source without implying a broken upstream
    pub fn is_termination(&self) -> bool {
        matches!(self, SourceError::Terminated)
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Connect { url, reason } => {
                write!(f, "cannot connect to {}: {}", url, reason)
            }
            SourceError::HttpStatus { url, status } => write!(f, "HTTP {} for {}", status, url),
            SourceError::Read { url, reason } => write!(f, "read error on {}: {}", url, reason),
            SourceError::Playlist(msg) => write!(f, "invalid playlist: {}", msg),
            SourceError::MalformedSegment { url, errors } => {
                write!(f, "malformed segment {} ({} parse errors)", url, errors)
            }
            SourceError::Terminated => write!(f, "upstream terminated"),
            SourceError::StartTimeout(after) => {
                write!(f, "source not ready after {:?}", after)
            }
            SourceError::TooManyFailures { count, last } => {
                write!(f, "{} consecutive failures, last: {}", count, last)
            }
        }
    }
}

impl std::error::Error for SourceError {}

impl SourceError {
    /// Classify an HTTP client failure for a request to `url`
    pub(crate) fn http(url: &str, e: reqwest::Error) -> Self {
        let url = e.url().map_or_else(|| url.to_string(), |u| u.to_string());
        if let Some(status) = e.status() {
            SourceError::HttpStatus {
                url,
                status: status.as_u16(),
            }
        } else if e.is_body() || e.is_decode() {
            SourceError::Read {
                url,
                reason: e.to_string(),
            }
        } else {
            SourceError::Connect {
                url,
                reason: e.to_string(),
            }
        }
    }
}
