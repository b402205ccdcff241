//! H.264/AVC access-unit extraction
//!
//! Transport streams carry H.264 in Annex-B format: NAL units separated by
//! start codes.
//!
//! ```text
//! 00 00 00 01 | NAL | 00 00 01 | NAL | ...
//! ```
//!
//! NAL header byte:
//! ```text
//! +---+-------+-----------+
//! | F | NRI(2)| Type (5)  |
//! +---+-------+-----------+
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;

/// NAL unit type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    /// Non-IDR slice
    Slice = 1,
    /// Slice data partition A
    SlicePartA = 2,
    /// Slice data partition B
    SlicePartB = 3,
    /// Slice data partition C
    SlicePartC = 4,
    /// IDR slice (keyframe)
    Idr = 5,
    /// Supplemental enhancement information
    Sei = 6,
    /// Sequence parameter set
    Sps = 7,
    /// Picture parameter set
    Pps = 8,
    /// Access unit delimiter
    Aud = 9,
    /// End of sequence
    EndSeq = 10,
    /// End of stream
    EndStream = 11,
    /// Filler data
    Filler = 12,
}

impl NaluType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            1 => Some(NaluType::Slice),
            2 => Some(NaluType::SlicePartA),
            3 => Some(NaluType::SlicePartB),
            4 => Some(NaluType::SlicePartC),
            5 => Some(NaluType::Idr),
            6 => Some(NaluType::Sei),
            7 => Some(NaluType::Sps),
            8 => Some(NaluType::Pps),
            9 => Some(NaluType::Aud),
            10 => Some(NaluType::EndSeq),
            11 => Some(NaluType::EndStream),
            12 => Some(NaluType::Filler),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, NaluType::Idr)
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NaluType::Sps | NaluType::Pps)
    }

    /// Coded slice of a picture
    pub fn is_coded_frame(&self) -> bool {
        matches!(
            self,
            NaluType::Slice
                | NaluType::SlicePartA
                | NaluType::SlicePartB
                | NaluType::SlicePartC
                | NaluType::Idr
        )
    }
}

/// Split an Annex-B byte stream into NAL units
///
/// Bytes before the first start code are discarded, as are trailing zero
/// bytes (which belong to a following 4-byte start code or are stuffing).
pub fn split_annex_b(data: &Bytes) -> Vec<Bytes> {
    let mut nalus = Vec::new();
    let mut start: Option<usize> = None;
    let mut i = 0;

    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if let Some(s) = start {
                push_trimmed(data, s, i, &mut nalus);
            }
            i += 3;
            start = Some(i);
        } else {
            i += 1;
        }
    }

    if let Some(s) = start {
        push_trimmed(data, s, data.len(), &mut nalus);
    }

    nalus
}

fn push_trimmed(data: &Bytes, start: usize, mut end: usize, out: &mut Vec<Bytes>) {
    while end > start && data[end - 1] == 0 {
        end -= 1;
    }
    if end > start {
        out.push(data.slice(start..end));
    }
}

/// One coded picture's NAL units with its presentation timestamp
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// 90 kHz presentation timestamp
    pub pts: i64,
    /// Coded slice NAL units, in stream order
    pub nalus: Vec<Bytes>,
    /// Contains an IDR slice
    pub keyframe: bool,
}

/// Codec description derived from the stream's parameter sets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub sps: Bytes,
    pub pps: Bytes,
}

impl Track {
    /// SDP encoding name
    pub const CODEC: &'static str = "H264";
    /// RTP clock rate; equal to the PES clock so timestamps map 1:1
    pub const CLOCK_RATE: u32 = 90_000;
    /// Dynamic RTP payload type
    pub const PAYLOAD_TYPE: u8 = 96;

    pub fn new(sps: Bytes, pps: Bytes) -> Self {
        Self { sps, pps }
    }

    /// `profile-level-id` from SPS bytes 1..4, when the SPS is long enough
    pub fn profile_level_id(&self) -> Option<String> {
        let b = self.sps.get(1..4)?;
        Some(format!("{:02X}{:02X}{:02X}", b[0], b[1], b[2]))
    }

    /// `a=rtpmap` value
    pub fn rtpmap(&self) -> String {
        format!("{} {}/{}", Self::PAYLOAD_TYPE, Self::CODEC, Self::CLOCK_RATE)
    }

    /// `a=fmtp` value
    pub fn fmtp(&self) -> String {
        let mut fmtp = format!(
            "{} packetization-mode=1; sprop-parameter-sets={},{}",
            Self::PAYLOAD_TYPE,
            STANDARD.encode(&self.sps),
            STANDARD.encode(&self.pps)
        );
        if let Some(id) = self.profile_level_id() {
            fmtp.push_str("; profile-level-id=");
            fmtp.push_str(&id);
        }
        fmtp
    }
}

/// Output of one [`Extractor::push`]
#[derive(Debug, Default)]
pub struct Extracted {
    /// Set when the parameter sets were first completed or changed
    pub track: Option<Track>,
    /// Coded frame, once parameter sets are known
    pub unit: Option<AccessUnit>,
}

/// Turns PES payloads into access units and tracks parameter sets
///
/// Coded frames seen before both SPS and PPS are dropped, since no
/// reader could decode them.
#[derive(Debug, Default)]
pub struct Extractor {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    track: Option<Track>,
    dropped: u64,
}

impl Extractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current track, once both parameter sets have been seen
    pub fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    /// Frames dropped while waiting for parameter sets
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Process one PES payload
    pub fn push(&mut self, pts: i64, data: &Bytes) -> Extracted {
        let mut nalus = Vec::new();
        let mut keyframe = false;

        for nalu in split_annex_b(data) {
            match NaluType::from_byte(nalu[0]) {
                Some(NaluType::Sps) => self.sps = Some(nalu),
                Some(NaluType::Pps) => self.pps = Some(nalu),
                Some(t) if t.is_coded_frame() => {
                    keyframe |= t.is_keyframe();
                    nalus.push(nalu);
                }
                _ => {}
            }
        }

        let mut out = Extracted::default();

        if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
            let changed = self
                .track
                .as_ref()
                .map_or(true, |t| t.sps != *sps || t.pps != *pps);
            if changed {
                let track = Track::new(sps.clone(), pps.clone());
                tracing::debug!(
                    profile_level_id = ?track.profile_level_id(),
                    "H.264 parameter sets updated"
                );
                self.track = Some(track.clone());
                out.track = Some(track);
            }
        }

        if nalus.is_empty() {
            return out;
        }

        if self.track.is_none() {
            self.dropped += 1;
            tracing::trace!(pts, "Dropping frame before parameter sets");
            return out;
        }

        out.unit = Some(AccessUnit {
            pts,
            nalus,
            keyframe,
        });
        out
    }

    /// Forget the parameter sets (new upstream session)
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
