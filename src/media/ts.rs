//! MPEG transport stream demultiplexing
//!
//! Packet headers, adaptation fields, PAT/PMT sections and PES headers are
//! decoded by the `mpeg2ts` packet reader. On top of it this module
//! recovers packet alignment on arbitrarily chunked input, decides which
//! packets to skip (transport errors, unannounced PIDs, duplicates,
//! continuity gaps), reassembles the PES units of the first H.264 stream
//! and puts their timestamps on a continuous timeline.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Buf, Bytes, BytesMut};
use mpeg2ts::es::StreamType;
use mpeg2ts::pes::PesHeader;
use mpeg2ts::ts::{ReadTsPacket, TsPacketReader, TsPayload};

use crate::error::ContainerError;

/// Size of one transport packet
pub const TS_PACKET_SIZE: usize = 188;

/// First byte of every transport packet
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Clock rate of PES timestamps
pub const PES_CLOCK_RATE: u32 = 90_000;

const PAT_PID: u16 = 0x0000;

/// PTS/DTS are 33-bit counters
const TIMESTAMP_WRAP: i64 = 1 << 33;

/// start code prefix, stream_id, PES_packet_length
const PES_FIXED_HEADER: usize = 6;

/// A reassembled PES payload of the video elementary stream
#[derive(Debug, Clone)]
pub struct PesUnit {
    /// Elementary stream PID
    pub pid: u16,
    /// PES stream id (0xE0..=0xEF for video)
    pub stream_id: u8,
    /// Unwrapped presentation timestamp, 90 kHz
    ///
    /// Units without a PTS inherit the previous one.
    pub pts: i64,
    /// Unwrapped decode timestamp, 90 kHz, when signalled
    pub dts: Option<i64>,
    /// Elementary stream bytes (Annex-B for H.264)
    pub data: Bytes,
}

impl PesUnit {
    /// Position in decode order: the DTS when signalled, else the PTS
    pub fn decode_time(&self) -> i64 {
        self.dts.unwrap_or(self.pts)
    }
}

/// Unwraps 33-bit timestamps onto a continuous 64-bit timeline
#[derive(Debug, Default)]
pub struct TimestampUnwrapper {
    last: Option<i64>,
    offset: i64,
}

impl TimestampUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a raw 33-bit value onto the continuous timeline
    pub fn unwrap(&mut self, raw: i64) -> i64 {
        let raw = raw & (TIMESTAMP_WRAP - 1);
        if let Some(last) = self.last {
            let diff = raw - last;
            if diff < -(TIMESTAMP_WRAP / 2) {
                self.offset += TIMESTAMP_WRAP;
            } else if diff > TIMESTAMP_WRAP / 2 {
                self.offset -= TIMESTAMP_WRAP;
            }
        }
        self.last = Some(raw);
        raw + self.offset
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.offset = 0;
    }
}

/// Holds the one packet the packet reader is allowed to consume
///
/// The reader keeps the PID table learned from PAT/PMT, so it lives as
/// long as the demuxer while packets are handed to it one at a time.
#[derive(Clone, Default)]
struct PacketSlot(Arc<Mutex<Bytes>>);

impl PacketSlot {
    fn lock(&self) -> MutexGuard<'_, Bytes> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load(&self, packet: Bytes) {
        *self.lock() = packet;
    }

    /// Drop whatever a failed read left behind
    fn clear(&self) {
        self.lock().clear();
    }
}

impl Read for PacketSlot {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut packet = self.lock();
        let n = buf.len().min(packet.len());
        buf[..n].copy_from_slice(&packet[..n]);
        packet.advance(n);
        Ok(n)
    }
}

/// Payload unit being reassembled
#[derive(Debug)]
struct PesAssembler {
    stream_id: u8,
    pts: Option<i64>,
    dts: Option<i64>,
    buf: BytesMut,
    /// Elementary stream bytes still to come when PES_packet_length is non-zero
    expected_len: Option<usize>,
}

impl PesAssembler {
    fn start(header: &PesHeader, expected_len: Option<usize>, data: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(expected_len.unwrap_or(4096));
        buf.extend_from_slice(data);
        Self {
            stream_id: header.stream_id.as_u8(),
            pts: header.pts.map(|t| t.as_u64() as i64),
            dts: header.dts.map(|t| t.as_u64() as i64),
            buf,
            expected_len,
        }
    }

    fn is_complete(&self) -> bool {
        matches!(self.expected_len, Some(n) if self.buf.len() >= n)
    }

    fn is_short(&self) -> bool {
        matches!(self.expected_len, Some(n) if self.buf.len() < n)
    }
}

/// Transport stream demultiplexer for the first H.264 stream of the first program
///
/// Input may be fed in arbitrary chunks; packet alignment is recovered
/// internally. Errors never stop demuxing: each is reported alongside the
/// units that could still be extracted.
pub struct Demuxer {
    pending: BytesMut,
    slot: PacketSlot,
    reader: TsPacketReader<PacketSlot>,
    /// PIDs announced by PAT/PMT; the reader rejects any other
    announced: HashSet<u16>,
    video_pid: Option<u16>,
    continuity: HashMap<u16, u8>,
    assembler: Option<PesAssembler>,
    pts: TimestampUnwrapper,
    last_pts: Option<i64>,
}

impl Demuxer {
    pub fn new() -> Self {
        let slot = PacketSlot::default();
        Self {
            pending: BytesMut::new(),
            reader: TsPacketReader::new(slot.clone()),
            slot,
            announced: HashSet::new(),
            video_pid: None,
            continuity: HashMap::new(),
            assembler: None,
            pts: TimestampUnwrapper::new(),
            last_pts: None,
        }
    }

    /// PID of the H.264 stream, once the PMT has been seen
    pub fn video_pid(&self) -> Option<u16> {
        self.video_pid
    }

    /// Feed bytes; returns completed units and per-packet errors in stream order
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<PesUnit, ContainerError>> {
        self.pending.extend_from_slice(data);
        let mut out = Vec::new();

        while self.pending.len() >= TS_PACKET_SIZE {
            if self.pending[0] != TS_SYNC_BYTE {
                let found = self.pending[0];
                match self.pending.iter().position(|&b| b == TS_SYNC_BYTE) {
                    Some(i) => self.pending.advance(i),
                    None => self.pending.clear(),
                }
                tracing::trace!(found, "Transport stream resync");
                out.push(Err(ContainerError::SyncLost { found }));
                continue;
            }

            let packet = self.pending.split_to(TS_PACKET_SIZE).freeze();
            self.process_packet(packet, &mut out);
        }

        out
    }

    /// Mark the end of a contiguous input (for example one HLS segment)
    ///
    /// Emits a pending unbounded payload unit and forgets continuity
    /// counters, since the next input may be muxed independently.
    pub fn flush(&mut self) -> Vec<Result<PesUnit, ContainerError>> {
        let mut out = Vec::new();

        if !self.pending.is_empty() {
            self.pending.clear();
            out.push(Err(ContainerError::Truncated("transport packet")));
        }

        if let (Some(assembler), Some(pid)) = (self.assembler.take(), self.video_pid) {
            if assembler.is_short() {
                out.push(Err(ContainerError::Truncated("PES payload")));
            } else {
                out.push(Ok(self.finish(pid, assembler)));
            }
        }

        self.continuity.clear();
        out
    }

    /// Abandon a partially received input
    ///
    /// Buffered bytes, the unit being reassembled and continuity counters
    /// are dropped. Program tables and the timestamp timeline are kept, so
    /// a re-fetch of the same input lands on the same timestamps.
    pub fn discard(&mut self) {
        self.pending.clear();
        self.assembler = None;
        self.continuity.clear();
    }

    /// Forget everything, including the program tables
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn process_packet(&mut self, packet: Bytes, out: &mut Vec<Result<PesUnit, ContainerError>>) {
        // transport_error_indicator
        if packet[1] & 0x80 != 0 {
            return;
        }
        let pid = (u16::from(packet[1] & 0x1F) << 8) | u16::from(packet[2]);
        if pid != PAT_PID && !self.announced.contains(&pid) {
            return;
        }

        self.slot.load(packet.clone());
        let parsed = self.reader.read_ts_packet();
        self.slot.clear();

        let ts = match parsed {
            Ok(Some(ts)) => ts,
            Ok(None) => return,
            Err(e) => {
                out.push(Err(ContainerError::Packet {
                    pid,
                    reason: first_line(&e.to_string()),
                }));
                return;
            }
        };

        if ts
            .adaptation_field
            .as_ref()
            .is_some_and(|af| af.discontinuity_indicator)
        {
            self.continuity.remove(&pid);
        }

        let Some(payload) = ts.payload else {
            return;
        };

        let counter = ts.header.continuity_counter.as_u8();
        if let Some(&last) = self.continuity.get(&pid) {
            if counter == last {
                // duplicate packet
                return;
            }
            let expected = (last + 1) & 0x0F;
            if counter != expected {
                if Some(pid) == self.video_pid {
                    self.assembler = None;
                }
                out.push(Err(ContainerError::Discontinuity {
                    pid,
                    expected,
                    found: counter,
                }));
            }
        }
        self.continuity.insert(pid, counter);

        match payload {
            TsPayload::Pat(pat) => {
                for program in &pat.table {
                    let pmt_pid = program.program_map_pid.as_u16();
                    if self.announced.insert(pmt_pid) {
                        tracing::trace!(pmt_pid, "PAT parsed");
                    }
                }
            }
            TsPayload::Pmt(pmt) => {
                for es in &pmt.es_info {
                    let es_pid = es.elementary_pid.as_u16();
                    self.announced.insert(es_pid);
                    if matches!(es.stream_type, StreamType::H264) {
                        self.on_video_stream(es_pid);
                    }
                }
            }
            TsPayload::Pes(pes) if Some(pid) == self.video_pid => {
                // header bytes the reader consumed ahead of the payload data
                let header_len = payload_len(&packet).saturating_sub(pes.data.len());
                self.start_unit(
                    pid,
                    &pes.header,
                    usize::from(pes.pes_packet_len),
                    header_len,
                    &pes.data[..],
                    out,
                );
            }
            TsPayload::Raw(data) if Some(pid) == self.video_pid => {
                match self.assembler.as_mut() {
                    Some(assembler) => assembler.buf.extend_from_slice(&data[..]),
                    // joined mid-unit
                    None => return,
                }
                self.emit_if_complete(pid, out);
            }
            _ => {}
        }
    }

    /// The first H.264 stream wins
    fn on_video_stream(&mut self, pid: u16) {
        if self.video_pid.is_none() {
            tracing::debug!(video_pid = pid, "H.264 elementary stream found");
            self.video_pid = Some(pid);
            self.assembler = None;
        }
    }

    fn start_unit(
        &mut self,
        pid: u16,
        header: &PesHeader,
        pes_packet_len: usize,
        header_len: usize,
        data: &[u8],
        out: &mut Vec<Result<PesUnit, ContainerError>>,
    ) {
        if let Some(previous) = self.assembler.take() {
            if previous.is_short() {
                out.push(Err(ContainerError::Truncated("PES payload")));
            } else {
                out.push(Ok(self.finish(pid, previous)));
            }
        }

        let expected_len = match pes_packet_len {
            0 => None,
            n => match (PES_FIXED_HEADER + n).checked_sub(header_len) {
                Some(len) => Some(len),
                None => {
                    out.push(Err(ContainerError::InvalidPes(
                        "header longer than PES_packet_length",
                    )));
                    return;
                }
            },
        };

        self.assembler = Some(PesAssembler::start(header, expected_len, data));
        self.emit_if_complete(pid, out);
    }

    fn emit_if_complete(&mut self, pid: u16, out: &mut Vec<Result<PesUnit, ContainerError>>) {
        if self.assembler.as_ref().is_some_and(PesAssembler::is_complete) {
            if let Some(assembler) = self.assembler.take() {
                out.push(Ok(self.finish(pid, assembler)));
            }
        }
    }

    fn finish(&mut self, pid: u16, assembler: PesAssembler) -> PesUnit {
        let mut data = assembler.buf.freeze();
        if let Some(n) = assembler.expected_len {
            data.truncate(n);
        }

        let pts = match assembler.pts {
            Some(raw) => {
                let pts = self.pts.unwrap(raw);
                self.last_pts = Some(pts);
                pts
            }
            None => self.last_pts.unwrap_or(0),
        };
        // DTS precedes PTS by less than half the wrap period
        let dts = match (assembler.pts, assembler.dts) {
            (Some(raw_pts), Some(raw_dts)) => {
                Some(pts - (raw_pts - raw_dts).rem_euclid(TIMESTAMP_WRAP))
            }
            _ => None,
        };

        PesUnit {
            pid,
            stream_id: assembler.stream_id,
            pts,
            dts,
            data,
        }
    }
}

impl Default for Demuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Demuxer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Demuxer")
            .field("pending", &self.pending.len())
            .field("announced", &self.announced)
            .field("video_pid", &self.video_pid)
            .field("assembler", &self.assembler)
            .field("last_pts", &self.last_pts)
            .finish()
    }
}

/// Bytes after the header and adaptation field of an accepted packet
fn payload_len(packet: &[u8]) -> usize {
    let adaptation = if packet[3] & 0x20 != 0 {
        1 + usize::from(packet[4])
    } else {
        0
    };
    (TS_PACKET_SIZE - 4).saturating_sub(adaptation)
}

fn first_line(message: &str) -> String {
    message.lines().next().unwrap_or_default().to_string()
}
