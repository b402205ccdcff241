//! RTP fixed header (RFC 3550 section 5.1)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// Length of the header without CSRCs or extension
pub const RTP_HEADER_SIZE: usize = 12;

const RTP_VERSION: u8 = 2;

/// Why a buffer is not a valid RTP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpParseError(pub &'static str);

impl fmt::Display for RtpParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid RTP packet: {}", self.0)
    }
}

impl std::error::Error for RtpParseError {}

/// An RTP packet with its header fields broken out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Serialize to wire format
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + self.payload.len());
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse wire format, skipping CSRCs, header extension and padding
    pub fn unmarshal(data: &Bytes) -> Result<Self, RtpParseError> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(RtpParseError("too short"));
        }
        if data[0] >> 6 != RTP_VERSION {
            return Err(RtpParseError("must be version 2"));
        }
        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = usize::from(data[0] & 0x0F);

        let mut payload_start = RTP_HEADER_SIZE + 4 * csrc_count;
        if has_extension {
            let ext = data
                .get(payload_start..payload_start + 4)
                .ok_or(RtpParseError("extension is after end of packet"))?;
            let words = usize::from(u16::from_be_bytes([ext[2], ext[3]]));
            payload_start += 4 + 4 * words;
        }
        if payload_start > data.len() {
            return Err(RtpParseError("payload start is after end of packet"));
        }

        let mut payload_end = data.len();
        if has_padding {
            let padding = usize::from(data[data.len() - 1]);
            if padding == 0 || payload_end - payload_start < padding {
                return Err(RtpParseError("bad padding"));
            }
            payload_end -= padding;
        }

        Ok(Self {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            sequence_number: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            payload: data.slice(payload_start..payload_end),
        })
    }
}
