//! H.264 RTP packetization (RFC 6184)
//!
//! NAL units that fit in one packet are sent as single NAL unit packets;
//! larger ones are split into FU-A fragments:
//!
//! ```text
//! FU indicator          FU header
//! +---+-----+------+    +---+---+---+------+
//! | F | NRI | 28   |    | S | E | R | Type |
//! +---+-----+------+    +---+---+---+------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::packet::{RtpPacket, RTP_HEADER_SIZE};

const FU_A: u8 = 28;
const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// Packetizes NAL units of one source session
///
/// The SSRC and the initial sequence number are random per session;
/// sequence numbers then increase by one per packet, wrapping at 2^16.
#[derive(Debug)]
pub struct H264Packetizer {
    payload_type: u8,
    ssrc: u32,
    sequence_number: u16,
    max_packet_size: usize,
}

impl H264Packetizer {
    /// `max_packet_size` bounds the marshalled packet (header included)
    pub fn new(payload_type: u8, max_packet_size: usize) -> Self {
        Self {
            payload_type,
            ssrc: rand::random(),
            sequence_number: rand::random(),
            max_packet_size: max_packet_size.max(RTP_HEADER_SIZE + 3),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next packet will carry
    pub fn next_sequence_number(&self) -> u16 {
        self.sequence_number
    }

    /// Packetize the NAL units of one access unit
    ///
    /// `marker` is set on the final packet when the units complete a picture.
    pub fn packetize(&mut self, nalus: &[Bytes], timestamp: u32, marker: bool) -> Vec<RtpPacket> {
        let mut packets = Vec::with_capacity(nalus.len());
        let count = nalus.len();

        for (i, nalu) in nalus.iter().enumerate() {
            if nalu.is_empty() {
                continue;
            }
            let last_nalu = marker && i == count - 1;
            self.packetize_nalu(nalu, timestamp, last_nalu, &mut packets);
        }

        packets
    }

    fn packetize_nalu(
        &mut self,
        nalu: &Bytes,
        timestamp: u32,
        last_nalu: bool,
        out: &mut Vec<RtpPacket>,
    ) {
        let max_payload = self.max_packet_size - RTP_HEADER_SIZE;

        if nalu.len() <= max_payload {
            let packet = self.packet(nalu.clone(), timestamp, last_nalu);
            out.push(packet);
            return;
        }

        let header = nalu[0];
        let fu_indicator = (header & 0xE0) | FU_A;
        let nalu_type = header & 0x1F;

        let body = nalu.slice(1..);
        let fragment_size = max_payload - 2;
        let fragments = body.len().div_ceil(fragment_size);

        for i in 0..fragments {
            let start = i * fragment_size;
            let end = (start + fragment_size).min(body.len());
            let last_fragment = i == fragments - 1;

            let mut fu_header = nalu_type;
            if i == 0 {
                fu_header |= FU_START;
            }
            if last_fragment {
                fu_header |= FU_END;
            }

            let mut payload = BytesMut::with_capacity(2 + end - start);
            payload.put_u8(fu_indicator);
            payload.put_u8(fu_header);
            payload.put_slice(&body[start..end]);

            let packet = self.packet(payload.freeze(), timestamp, last_nalu && last_fragment);
            out.push(packet);
        }
    }

    fn packet(&mut self, payload: Bytes, timestamp: u32, marker: bool) -> RtpPacket {
        let sequence_number = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        RtpPacket {
            marker,
            payload_type: self.payload_type,
            sequence_number,
            timestamp,
            ssrc: self.ssrc,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_nal_units() {
        let mut packetizer = H264Packetizer::new(96, 1472);
        let first_seq = packetizer.next_sequence_number();

        let nalus = [Bytes::from_static(&[0x67, 1, 2]), Bytes::from_static(&[0x05])];
        let packets = packetizer.packetize(&nalus, 180_000, true);

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].sequence_number, first_seq);
        assert_eq!(packets[1].sequence_number, first_seq.wrapping_add(1));
        assert!(!packets[0].marker);
        assert!(packets[1].marker);
        assert_eq!(&packets[1].payload[..], &[0x05]);
        assert!(packets.iter().all(|p| p.timestamp == 180_000));
        assert!(packets.iter().all(|p| p.ssrc == packetizer.ssrc()));
    }

    #[test]
    fn test_fu_a_fragmentation() {
        let max_packet = 64;
        let mut packetizer = H264Packetizer::new(96, max_packet);

        let mut nalu = vec![0x65];
        nalu.extend((0..200u32).map(|i| i as u8));
        let packets = packetizer.packetize(&[Bytes::from(nalu.clone())], 3_000, true);

        // 200 body bytes in 50-byte fragments
        assert_eq!(packets.len(), 4);
        assert!(packets.iter().all(|p| p.marshal().len() <= max_packet));

        assert_eq!(packets[0].payload[0], 0x60 | FU_A);
        assert_eq!(packets[0].payload[1], FU_START | 5);
        assert_eq!(packets[1].payload[1], 5);
        assert_eq!(packets[3].payload[1], FU_END | 5);

        assert!(packets[..3].iter().all(|p| !p.marker));
        assert!(packets[3].marker);

        // reassembles to the original NAL unit
        let mut rebuilt = vec![(packets[0].payload[0] & 0xE0) | (packets[0].payload[1] & 0x1F)];
        for p in &packets {
            rebuilt.extend_from_slice(&p.payload[2..]);
        }
        assert_eq!(rebuilt, nalu);
    }

    #[test]
    fn test_sequence_number_wraps() {
        let mut packetizer = H264Packetizer::new(96, 1472);
        packetizer.sequence_number = u16::MAX;

        let packets = packetizer.packetize(
            &[Bytes::from_static(&[0x41]), Bytes::from_static(&[0x41])],
            0,
            false,
        );
        assert_eq!(packets[0].sequence_number, u16::MAX);
        assert_eq!(packets[1].sequence_number, 0);
        assert!(packets.iter().all(|p| !p.marker));
    }
}
