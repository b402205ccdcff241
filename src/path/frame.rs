//! Frames delivered to readers
//!
//! Each frame is one wire-ready RTP packet. Cloning is cheap: the packet
//! bytes are reference counted and shared by every reader.

use bytes::Bytes;

use crate::rtp::{RtpPacket, RtpParseError};

/// What the packet carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// SPS or PPS; part of the bootstrap every reader receives first
    ParameterSet,
    /// Slice of an IDR picture
    Keyframe,
    /// Any other coded slice
    Frame,
}

/// One RTP packet produced by a source
#[derive(Debug, Clone)]
pub struct RtpFrame {
    pub kind: FrameKind,
    /// RTP sequence number, also present in `data`
    pub sequence_number: u16,
    /// RTP timestamp (90 kHz), also present in `data`
    pub timestamp: u32,
    /// Marshalled RTP packet
    pub data: Bytes,
}

impl RtpFrame {
    pub fn new(kind: FrameKind, packet: &RtpPacket) -> Self {
        Self {
            kind,
            sequence_number: packet.sequence_number,
            timestamp: packet.timestamp,
            data: packet.marshal(),
        }
    }

    pub fn is_parameter_set(&self) -> bool {
        self.kind == FrameKind::ParameterSet
    }

    pub fn is_keyframe(&self) -> bool {
        self.kind == FrameKind::Keyframe
    }

    /// Parse the packet back out, for consumers that need the header fields
    pub fn packet(&self) -> Result<RtpPacket, RtpParseError> {
        RtpPacket::unmarshal(&self.data)
    }
}
