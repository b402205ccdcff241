//! RTP wire format and H.264 packetization

pub mod packet;
pub mod packetizer;

pub use packet::{RtpPacket, RtpParseError, RTP_HEADER_SIZE};
pub use packetizer::H264Packetizer;
