//! Relay configuration
//!
//! Configuration is immutable once loaded. It comes either from YAML
//! (`RelayConfig::from_yaml` / `from_file`) or from the builder methods:
//!
//! ```yaml
//! readTimeout: 10s
//! hlsDisable: yes
//! paths:
//!   proxied:
//!     source: http://localhost:5780/stream.m3u8
//!     sourceOnDemand: yes
//!   ~^cam[0-9]+$:
//!     source: published
//!   all:
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use url::Url;

use crate::error::ConfigError;

/// Default per-reader queue capacity, in frames
pub const DEFAULT_READ_BUFFER_COUNT: usize = 512;

/// Default maximum RTP packet size (fits an unfragmented UDP datagram on Ethernet)
pub const DEFAULT_UDP_MAX_PAYLOAD_SIZE: usize = 1472;

/// Smallest RTP packet size we accept: header plus a FU-A fragment with a
/// meaningful payload
const MIN_UDP_MAX_PAYLOAD_SIZE: usize = 64;

/// Name of the catch-all path entry
pub const CATCH_ALL_PATH: &str = "all";

/// Downstream or upstream protocol that can be switched off process-wide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Rtsp,
    Rtmp,
    Hls,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Rtsp => write!(f, "RTSP"),
            Protocol::Rtmp => write!(f, "RTMP"),
            Protocol::Hls => write!(f, "HLS"),
        }
    }
}

/// Where a path's media comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    /// Pull an HLS media playlist over HTTP(S)
    Hls(Url),
    /// Wait for a publisher to push a transport stream
    Published,
}

impl SourceLocator {
    /// Parse a `source:` value
    pub fn parse(path: &str, value: &str) -> Result<Self, ConfigError> {
        let value = value.trim();
        match value {
            "" | "published" | "publisher" => Ok(SourceLocator::Published),
            v if v.starts_with("http://") || v.starts_with("https://") => Url::parse(v)
                .map(SourceLocator::Hls)
                .map_err(|e| ConfigError::InvalidSource {
                    path: path.to_string(),
                    reason: e.to_string(),
                }),
            other => Err(ConfigError::InvalidSource {
                path: path.to_string(),
                reason: format!("unsupported source {:?}", other),
            }),
        }
    }

    /// Whether this path is fed by a publisher
    pub fn is_published(&self) -> bool {
        matches!(self, SourceLocator::Published)
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::Hls(url) => write!(f, "{}", url),
            SourceLocator::Published => write!(f, "published"),
        }
    }
}

/// Configuration of one path entry
///
/// `name` is the key as written in the config: an exact path name, a
/// `~regex`, or `all`.
#[derive(Debug, Clone)]
pub struct PathConfig {
    /// Config key
    pub name: String,

    /// Upstream source
    pub source: SourceLocator,

    /// Start the source on first reader instead of at startup
    pub source_on_demand: bool,

    /// How long an on-demand attach waits for the source to become ready
    pub source_on_demand_start_timeout: Duration,

    /// How long an on-demand source keeps running with no readers
    pub source_on_demand_close_after: Duration,

    pattern: Option<Regex>,
}

impl PathConfig {
    /// Create a path entry with default timings
    pub fn new(name: impl Into<String>, source: SourceLocator) -> Self {
        let name = name.into();
        let pattern = name
            .strip_prefix('~')
            .and_then(|re| Regex::new(re).ok());

        Self {
            name,
            source,
            source_on_demand: false,
            source_on_demand_start_timeout: Duration::from_secs(10),
            source_on_demand_close_after: Duration::from_secs(10),
            pattern,
        }
    }

    /// Create a path pulling the given HLS playlist
    pub fn hls(name: impl Into<String>, url: &str) -> Result<Self, ConfigError> {
        let name = name.into();
        let source = SourceLocator::parse(&name, url)?;
        Ok(Self::new(name, source))
    }

    /// Create a path fed by a publisher
    pub fn published(name: impl Into<String>) -> Self {
        Self::new(name, SourceLocator::Published)
    }

    /// Set on-demand mode
    pub fn on_demand(mut self, on_demand: bool) -> Self {
        self.source_on_demand = on_demand;
        self
    }

    /// Set the on-demand start timeout
    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.source_on_demand_start_timeout = timeout;
        self
    }

    /// Set the on-demand idle timeout
    pub fn close_after(mut self, idle: Duration) -> Self {
        self.source_on_demand_close_after = idle;
        self
    }

    /// Whether this entry is a `~regex` pattern
    pub fn is_pattern(&self) -> bool {
        self.name.starts_with('~')
    }

    /// Whether this entry is the catch-all
    pub fn is_catch_all(&self) -> bool {
        self.name == CATCH_ALL_PATH
    }

    /// Whether a requested path name is served by this entry
    pub fn matches(&self, path: &str) -> bool {
        if self.is_catch_all() {
            return true;
        }
        match &self.pattern {
            Some(re) => re.is_match(path),
            None => !self.is_pattern() && self.name == path,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(re) = self.name.strip_prefix('~') {
            if let Err(e) = Regex::new(re) {
                return Err(ConfigError::InvalidPathName(format!("{} ({})", self.name, e)));
            }
        } else if !is_valid_path_name(&self.name) {
            return Err(ConfigError::InvalidPathName(self.name.clone()));
        }

        if self.source_on_demand && self.source.is_published() {
            return Err(ConfigError::Conflict {
                path: self.name.clone(),
                reason: "sourceOnDemand requires a pull source",
            });
        }

        Ok(())
    }
}

impl PartialEq for PathConfig {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.source == other.source
            && self.source_on_demand == other.source_on_demand
            && self.source_on_demand_start_timeout == other.source_on_demand_start_timeout
            && self.source_on_demand_close_after == other.source_on_demand_close_after
    }
}

fn is_valid_path_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.ends_with('/')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
}

/// Process-wide configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Disable the RTSP reader side
    pub rtsp_disable: bool,

    /// Disable RTMP publishing
    pub rtmp_disable: bool,

    /// Disable HLS serving
    pub hls_disable: bool,

    /// Timeout of every upstream HTTP request
    pub read_timeout: Duration,

    /// Per-reader queue capacity, in frames
    pub read_buffer_count: usize,

    /// Maximum RTP packet size in bytes
    pub udp_max_payload_size: usize,

    /// Pause after a failed pull attempt, and before restarting an always-on source
    pub source_retry_pause: Duration,

    /// Consecutive failures before a pull source gives up
    pub source_max_failures: u32,

    /// Lower bound of the playlist refresh interval
    pub source_poll_min: Duration,

    /// Upper bound of the playlist refresh interval
    pub source_poll_max: Duration,

    /// Path entries in declaration order
    pub paths: Vec<PathConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            rtsp_disable: false,
            rtmp_disable: false,
            hls_disable: false,
            read_timeout: Duration::from_secs(10),
            read_buffer_count: DEFAULT_READ_BUFFER_COUNT,
            udp_max_payload_size: DEFAULT_UDP_MAX_PAYLOAD_SIZE,
            source_retry_pause: Duration::from_secs(5),
            source_max_failures: 3,
            source_poll_min: Duration::from_millis(500),
            source_poll_max: Duration::from_secs(10),
            paths: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(input: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_yaml::from_str(input).map_err(|e| ConfigError::Yaml(e.to_string()))?;
        let config = raw.into_config()?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_yaml(&input)
    }

    /// Add a path entry, replacing one with the same key
    pub fn path(mut self, path: PathConfig) -> Self {
        match self.paths.iter_mut().find(|p| p.name == path.name) {
            Some(existing) => *existing = path,
            None => self.paths.push(path),
        }
        self
    }

    /// Disable a protocol
    pub fn disable(mut self, protocol: Protocol) -> Self {
        match protocol {
            Protocol::Rtsp => self.rtsp_disable = true,
            Protocol::Rtmp => self.rtmp_disable = true,
            Protocol::Hls => self.hls_disable = true,
        }
        self
    }

    /// Set the upstream request timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the per-reader queue capacity
    pub fn read_buffer_count(mut self, count: usize) -> Self {
        self.read_buffer_count = count;
        self
    }

    /// Set the maximum RTP packet size
    pub fn udp_max_payload_size(mut self, size: usize) -> Self {
        self.udp_max_payload_size = size;
        self
    }

    /// Set the pause between failed attempts
    pub fn source_retry_pause(mut self, pause: Duration) -> Self {
        self.source_retry_pause = pause;
        self
    }

    /// Set the failure streak that makes a pull source give up
    pub fn source_max_failures(mut self, count: u32) -> Self {
        self.source_max_failures = count;
        self
    }

    /// Set the playlist refresh clamp
    pub fn source_poll_interval(mut self, min: Duration, max: Duration) -> Self {
        self.source_poll_min = min;
        self.source_poll_max = max;
        self
    }

    /// Whether a protocol is enabled
    pub fn protocol_enabled(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Rtsp => !self.rtsp_disable,
            Protocol::Rtmp => !self.rtmp_disable,
            Protocol::Hls => !self.hls_disable,
        }
    }

    /// Find the entry serving a path name
    ///
    /// Exact names win over `~regex` patterns (first match in declaration
    /// order), which win over `all`.
    pub fn find_path(&self, name: &str) -> Option<&PathConfig> {
        self.paths
            .iter()
            .find(|p| !p.is_pattern() && !p.is_catch_all() && p.name == name)
            .or_else(|| self.paths.iter().find(|p| p.is_pattern() && p.matches(name)))
            .or_else(|| self.paths.iter().find(|p| p.is_catch_all()))
    }

    /// Check the whole configuration for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_buffer_count == 0 {
            return Err(ConfigError::Conflict {
                path: String::new(),
                reason: "readBufferCount must be at least 1",
            });
        }
        if self.udp_max_payload_size < MIN_UDP_MAX_PAYLOAD_SIZE {
            return Err(ConfigError::Conflict {
                path: String::new(),
                reason: "udpMaxPayloadSize is too small",
            });
        }
        if self.source_max_failures == 0 {
            return Err(ConfigError::Conflict {
                path: String::new(),
                reason: "sourceMaxFailures must be at least 1",
            });
        }
        if self.source_poll_min > self.source_poll_max {
            return Err(ConfigError::Conflict {
                path: String::new(),
                reason: "sourcePollMin exceeds sourcePollMax",
            });
        }
        for path in &self.paths {
            path.validate()?;
        }
        Ok(())
    }
}

/// Parse `500ms`, `10s`, `1.5m`, `1h` or bare seconds
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(value.to_string());
    let v = value.trim();

    let (number, unit) = match v.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&v[..i], &v[i..]),
        None => (v, "s"),
    };
    let n: f64 = number.trim().parse().map_err(|_| invalid())?;
    if !n.is_finite() || n < 0.0 {
        return Err(invalid());
    }

    let secs = match unit {
        "ms" => n / 1000.0,
        "s" => n,
        "m" => n * 60.0,
        "h" => n * 3600.0,
        _ => return Err(invalid()),
    };
    Duration::try_from_secs_f64(secs).map_err(|_| invalid())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" => Some(true),
        "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFlag {
    Bool(bool),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Fractional(f64),
    Text(String),
}

fn de_flag<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    match Option::<RawFlag>::deserialize(d)? {
        None => Ok(None),
        Some(RawFlag::Bool(b)) => Ok(Some(b)),
        Some(RawFlag::Text(s)) => parse_flag(&s)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid boolean {:?}", s))),
    }
}

fn de_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    match Option::<RawDuration>::deserialize(d)? {
        None => Ok(None),
        Some(RawDuration::Seconds(s)) => Ok(Some(Duration::from_secs(s))),
        Some(RawDuration::Fractional(s)) => Duration::try_from_secs_f64(s)
            .map(Some)
            .map_err(|_| D::Error::custom(ConfigError::InvalidDuration(s.to_string()))),
        Some(RawDuration::Text(s)) => parse_duration(&s).map(Some).map_err(D::Error::custom),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default, deserialize_with = "de_flag")]
    rtsp_disable: Option<bool>,
    #[serde(default, deserialize_with = "de_flag")]
    rtmp_disable: Option<bool>,
    #[serde(default, deserialize_with = "de_flag")]
    hls_disable: Option<bool>,
    #[serde(default, deserialize_with = "de_duration")]
    read_timeout: Option<Duration>,
    read_buffer_count: Option<usize>,
    udp_max_payload_size: Option<usize>,
    #[serde(default, deserialize_with = "de_duration")]
    source_retry_pause: Option<Duration>,
    source_max_failures: Option<u32>,
    #[serde(default, deserialize_with = "de_duration")]
    source_poll_min: Option<Duration>,
    #[serde(default, deserialize_with = "de_duration")]
    source_poll_max: Option<Duration>,
    #[serde(default)]
    paths: Option<serde_yaml::Mapping>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPathConfig {
    source: Option<String>,
    #[serde(default, deserialize_with = "de_flag")]
    source_on_demand: Option<bool>,
    #[serde(default, deserialize_with = "de_duration")]
    source_on_demand_start_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "de_duration")]
    source_on_demand_close_after: Option<Duration>,
}

impl RawConfig {
    fn into_config(self) -> Result<RelayConfig, ConfigError> {
        let defaults = RelayConfig::default();
        let mut config = RelayConfig {
            rtsp_disable: self.rtsp_disable.unwrap_or(defaults.rtsp_disable),
            rtmp_disable: self.rtmp_disable.unwrap_or(defaults.rtmp_disable),
            hls_disable: self.hls_disable.unwrap_or(defaults.hls_disable),
            read_timeout: self.read_timeout.unwrap_or(defaults.read_timeout),
            read_buffer_count: self.read_buffer_count.unwrap_or(defaults.read_buffer_count),
            udp_max_payload_size: self
                .udp_max_payload_size
                .unwrap_or(defaults.udp_max_payload_size),
            source_retry_pause: self.source_retry_pause.unwrap_or(defaults.source_retry_pause),
            source_max_failures: self
                .source_max_failures
                .unwrap_or(defaults.source_max_failures),
            source_poll_min: self.source_poll_min.unwrap_or(defaults.source_poll_min),
            source_poll_max: self.source_poll_max.unwrap_or(defaults.source_poll_max),
            paths: Vec::new(),
        };

        for (key, value) in self.paths.unwrap_or_default() {
            let name = match key {
                serde_yaml::Value::String(s) => s,
                other => {
                    return Err(ConfigError::InvalidPathName(format!("{:?}", other)));
                }
            };
            let raw: RawPathConfig = if value.is_null() {
                RawPathConfig::default()
            } else {
                serde_yaml::from_value(value)
                    .map_err(|e| ConfigError::Yaml(format!("path '{}': {}", name, e)))?
            };

            let source = SourceLocator::parse(&name, raw.source.as_deref().unwrap_or(""))?;
            let mut path = PathConfig::new(name, source)
                .on_demand(raw.source_on_demand.unwrap_or(false));
            if let Some(t) = raw.source_on_demand_start_timeout {
                path = path.start_timeout(t);
            }
            if let Some(t) = raw.source_on_demand_close_after {
                path = path.close_after(t);
            }
            config.paths.push(path);
        }

        Ok(config)
    }
}
