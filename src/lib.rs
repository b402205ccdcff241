//! relay-rs: media relay core
//!
//! Pulls H.264 over HLS (or accepts a pushed MPEG-TS stream), extracts
//! access units and republishes them as RTP packets to any number of
//! readers attached to a named path.
//!
//! # Example
//!
//! ```no_run
//! use relay_rs::{PathConfig, PathManager, Protocol, RelayConfig};
//!
//! # async fn run() -> relay_rs::Result<()> {
//! let config = RelayConfig::default().path(
//!     PathConfig::hls("cam1", "http://camera.local/stream.m3u8")?.on_demand(true),
//! );
//! let manager = PathManager::new(config)?;
//!
//! let mut reader = manager.read("cam1", Protocol::Rtsp).await?;
//! while let Some(frame) = reader.recv().await {
//!     println!("{} bytes at {}", frame.data.len(), frame.timestamp);
//! }
//!
//! manager.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod media;
pub mod path;
pub mod rtp;
pub mod source;
pub mod stats;

#[cfg(test)]
mod testutil;

pub use config::{PathConfig, Protocol, RelayConfig, SourceLocator};
pub use error::{ConfigError, ContainerError, Error, PathError, Result, SourceError};
pub use media::Track;
pub use path::{FrameKind, PathHandle, PathManager, PathState, PathStats, Reader, RtpFrame};
pub use source::Publisher;
pub use stats::SourceStats;
