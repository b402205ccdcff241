//! Media handling
//!
//! This module provides:
//! - MPEG-TS demultiplexing with PTS reconstruction
//! - H.264 Annex-B splitting and access-unit extraction

pub mod h264;
pub mod ts;

pub use h264::{AccessUnit, Extracted, Extractor, NaluType, Track};
pub use ts::{Demuxer, PesUnit, TimestampUnwrapper};
