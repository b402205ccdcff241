//! Minimal MPEG-TS muxing helpers for tests
//!
//! Produces just enough of a transport stream (PAT, PMT, H.264 PES) for
//! the demuxer and the HLS source to be exercised end to end. Compiled
//! into the unit tests and included by `tests/common`.

use std::collections::HashMap;

const TS_PACKET_SIZE: usize = 188;
const TS_SYNC_BYTE: u8 = 0x47;
const STREAM_TYPE_H264: u8 = 0x1B;
const PMT_PID: u16 = 0x1000;

/// CRC-32/MPEG-2 over a PSI section
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in data {
        crc ^= u32::from(b) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Pointer field, section, CRC
fn psi_payload(section: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(section.len() + 5);
    out.push(0x00);
    out.extend_from_slice(section);
    out.extend_from_slice(&crc32_mpeg2(section).to_be_bytes());
    out
}

/// Encode a 5-byte PTS/DTS field with the given 4-bit prefix
pub fn encode_timestamp(prefix: u8, ts: i64) -> [u8; 5] {
    [
        (prefix << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 1,
        (ts >> 22) as u8,
        (((ts >> 14) & 0xFE) as u8) | 1,
        (ts >> 7) as u8,
        (((ts << 1) & 0xFE) as u8) | 1,
    ]
}

/// Build one transport packet, stuffing the adaptation field so that
/// `payload` ends exactly at the packet boundary
pub fn ts_packet(pid: u16, unit_start: bool, cc: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= TS_PACKET_SIZE - 4);

    let mut packet = Vec::with_capacity(TS_PACKET_SIZE);
    packet.push(TS_SYNC_BYTE);
    packet.push(((unit_start as u8) << 6) | ((pid >> 8) as u8 & 0x1F));
    packet.push(pid as u8);

    let stuffing = TS_PACKET_SIZE - 4 - payload.len();
    if stuffing == 0 {
        packet.push(0x10 | (cc & 0x0F));
    } else {
        packet.push(0x30 | (cc & 0x0F));
        packet.push((stuffing - 1) as u8);
        if stuffing > 1 {
            packet.push(0x00);
            packet.extend(std::iter::repeat(0xFF).take(stuffing - 2));
        }
    }

    packet.extend_from_slice(payload);
    packet
}

/// Prefix each NAL unit with a 4-byte Annex-B start code
pub fn annex_b(nalus: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for nalu in nalus {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(nalu);
    }
    out
}

/// Writes a single-program stream carrying one H.264 elementary stream
#[derive(Debug)]
pub struct TsWriter {
    video_pid: u16,
    counters: HashMap<u16, u8>,
}

impl TsWriter {
    pub fn new(video_pid: u16) -> Self {
        Self {
            video_pid,
            counters: HashMap::new(),
        }
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let cc = self.counters.entry(pid).or_insert(0x0F);
        *cc = (*cc + 1) & 0x0F;
        *cc
    }

    /// PAT and PMT packets
    pub fn tables(&mut self) -> Vec<u8> {
        // section_length 13, tsid 1, version 0 current, program 1 -> PMT PID
        let pat = [
            0x00,
            0xB0,
            0x0D,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
            0x00,
            0x01,
            0xE0 | (PMT_PID >> 8) as u8,
            PMT_PID as u8,
        ];
        // section_length 18, program 1, PCR PID = video, no program info,
        // one H.264 stream
        let pmt = [
            0x02,
            0xB0,
            0x12,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
            0xE0 | (self.video_pid >> 8) as u8,
            self.video_pid as u8,
            0xF0,
            0x00,
            STREAM_TYPE_H264,
            0xE0 | (self.video_pid >> 8) as u8,
            self.video_pid as u8,
            0xF0,
            0x00,
        ];

        let mut out = Vec::with_capacity(2 * TS_PACKET_SIZE);
        let cc = self.next_cc(0);
        out.extend(ts_packet(0, true, cc, &psi_payload(&pat)));
        let cc = self.next_cc(PMT_PID);
        out.extend(ts_packet(PMT_PID, true, cc, &psi_payload(&pmt)));
        out
    }

    /// One video PES carrying `data`, split into transport packets
    ///
    /// `bounded` sets PES_packet_length; otherwise it is zero and the unit
    /// ends at the next unit start.
    pub fn pes(&mut self, pts: i64, data: &[u8], bounded: bool) -> Vec<u8> {
        let mut pes = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x80, 0x05];
        pes.extend_from_slice(&encode_timestamp(0x2, pts));
        pes.extend_from_slice(data);
        if bounded {
            let len = (pes.len() - 6) as u16;
            pes[4..6].copy_from_slice(&len.to_be_bytes());
        }
        self.packetize(&pes)
    }

    /// One bounded video PES without timestamps
    pub fn pes_without_pts(&mut self, data: &[u8]) -> Vec<u8> {
        let mut pes = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x00, 0x00];
        pes.extend_from_slice(data);
        let len = (pes.len() - 6) as u16;
        pes[4..6].copy_from_slice(&len.to_be_bytes());
        self.packetize(&pes)
    }

    fn packetize(&mut self, pes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, chunk) in pes.chunks(TS_PACKET_SIZE - 4).enumerate() {
            let cc = self.next_cc(self.video_pid);
            out.extend(ts_packet(self.video_pid, i == 0, cc, chunk));
        }
        out
    }
}
