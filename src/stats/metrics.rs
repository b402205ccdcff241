//! Statistics and metrics for sources

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Live counters updated by a running source
///
/// Shared between the source task and its path; every field is a relaxed
/// atomic since readers only need eventually consistent totals.
#[derive(Debug)]
pub struct SourceMetrics {
    started_at: Instant,
    playlists: AtomicU64,
    segments: AtomicU64,
    bytes_received: AtomicU64,
    access_units: AtomicU64,
    keyframes: AtomicU64,
    rtp_packets: AtomicU64,
    parse_errors: AtomicU64,
    fetch_errors: AtomicU64,
}

impl SourceMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            playlists: AtomicU64::new(0),
            segments: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            access_units: AtomicU64::new(0),
            keyframes: AtomicU64::new(0),
            rtp_packets: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            fetch_errors: AtomicU64::new(0),
        }
    }

    pub fn add_playlist(&self) {
        self.playlists.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_segment(&self) {
        self.segments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_access_unit(&self, keyframe: bool) {
        self.access_units.fetch_add(1, Ordering::Relaxed);
        if keyframe {
            self.keyframes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_rtp_packets(&self, n: usize) {
        self.rtp_packets.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> SourceStats {
        SourceStats {
            duration: self.started_at.elapsed(),
            playlists: self.playlists.load(Ordering::Relaxed),
            segments: self.segments.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            access_units: self.access_units.load(Ordering::Relaxed),
            keyframes: self.keyframes.load(Ordering::Relaxed),
            rtp_packets: self.rtp_packets.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for SourceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Source-level statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Time since the counters were created
    pub duration: Duration,
    /// Playlists fetched and parsed
    pub playlists: u64,
    /// Segments (or published chunks) fully ingested
    pub segments: u64,
    /// Transport stream bytes fed to the demuxer
    pub bytes_received: u64,
    /// Access units forwarded
    pub access_units: u64,
    /// Of which IDR
    pub keyframes: u64,
    /// RTP packets produced
    pub rtp_packets: u64,
    /// Container parse errors skipped
    pub parse_errors: u64,
    /// Failed playlist or segment fetches
    pub fetch_errors: u64,
}

impl SourceStats {
    /// Calculate bitrate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.duration.as_secs();
        if secs > 0 {
            (self.bytes_received * 8) / secs
        } else {
            0
        }
    }
}
