//! Demux → extract → packetize → fan-out pipeline shared by all sources

use crate::error::ContainerError;
use crate::media::{Demuxer, Extractor, PesUnit, Track};
use crate::path::{FrameKind, RtpFrame};
use crate::rtp::H264Packetizer;

use super::{SourceContext, SourceEvent};

/// Result of one contiguous input (a segment, or a publisher's stream)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentOutcome {
    /// Payload units demultiplexed
    pub units: u64,
    /// Container errors skipped
    pub errors: u64,
}

impl SegmentOutcome {
    /// Nothing usable came out of the input
    pub fn is_failure(&self) -> bool {
        self.units == 0 && self.errors > 0
    }
}

/// Per-session media pipeline
///
/// Parse errors never abort ingestion: they are counted, logged and the
/// offending data is skipped.
pub struct Ingest {
    ctx: SourceContext,
    demuxer: Demuxer,
    extractor: Extractor,
    packetizer: H264Packetizer,
    current: SegmentOutcome,
    /// Decode time of the last unit handed to the extractor
    last_delivered: Option<i64>,
    /// Set while a re-fetched input replays units readers already have
    replay_until: Option<i64>,
}

impl Ingest {
    pub(crate) fn new(ctx: SourceContext) -> Self {
        let packetizer = H264Packetizer::new(Track::PAYLOAD_TYPE, ctx.settings.max_packet_size);
        Self {
            ctx,
            demuxer: Demuxer::new(),
            extractor: Extractor::new(),
            packetizer,
            current: SegmentOutcome::default(),
            last_delivered: None,
            replay_until: None,
        }
    }

    pub(crate) fn context(&self) -> &SourceContext {
        &self.ctx
    }

    /// Feed transport stream bytes (any alignment)
    pub fn feed(&mut self, data: &[u8]) {
        self.ctx.metrics.add_bytes(data.len());
        let results = self.demuxer.feed(data);
        self.handle(results);
    }

    /// Mark the end of a contiguous input and return what it produced
    pub fn end_segment(&mut self) -> SegmentOutcome {
        let results = self.demuxer.flush();
        self.handle(results);
        self.ctx.metrics.add_segment();
        std::mem::take(&mut self.current)
    }

    /// Drop a partially received input; it will be fetched again
    ///
    /// Units of the re-fetched input up to the last one already delivered
    /// are skipped, so readers never see a frame twice.
    pub fn discard_segment(&mut self) {
        self.demuxer.discard();
        self.current = SegmentOutcome::default();
        self.replay_until = self.last_delivered;
    }

    fn handle(&mut self, results: Vec<Result<PesUnit, ContainerError>>) {
        for result in results {
            match result {
                Ok(unit) => self.on_unit(unit),
                Err(e) => {
                    self.current.errors += 1;
                    self.ctx.metrics.add_parse_error();
                    tracing::debug!(
                        path = %self.ctx.path,
                        error = %e,
                        "Skipping malformed transport stream data"
                    );
                }
            }
        }
    }

    fn on_unit(&mut self, unit: PesUnit) {
        self.current.units += 1;

        let decode_time = unit.decode_time();
        if let Some(until) = self.replay_until {
            if decode_time <= until {
                tracing::trace!(
                    path = %self.ctx.path,
                    pts = unit.pts,
                    "Skipping unit delivered before the retry"
                );
                return;
            }
            self.replay_until = None;
        }
        self.last_delivered = Some(decode_time);

        let extracted = self.extractor.push(unit.pts, &unit.data);
        // RTP timestamps are the 90 kHz PTS modulo 2^32
        let timestamp = unit.pts as u32;

        if let Some(track) = extracted.track {
            let packets = self.packetizer.packetize(
                &[track.sps.clone(), track.pps.clone()],
                timestamp,
                false,
            );
            self.ctx.metrics.add_rtp_packets(packets.len());
            let frames = packets
                .iter()
                .map(|p| RtpFrame::new(FrameKind::ParameterSet, p))
                .collect();
            self.ctx.fanout.set_bootstrap(frames);
            self.ctx.report(SourceEvent::Ready(track));
        }

        if let Some(au) = extracted.unit {
            let kind = if au.keyframe {
                FrameKind::Keyframe
            } else {
                FrameKind::Frame
            };
            let packets = self.packetizer.packetize(&au.nalus, timestamp, true);
            self.ctx.metrics.add_access_unit(au.keyframe);
            self.ctx.metrics.add_rtp_packets(packets.len());

            tracing::trace!(
                path = %self.ctx.path,
                pts = au.pts,
                keyframe = au.keyframe,
                packets = packets.len(),
                "Access unit"
            );

            for packet in &packets {
                self.ctx.fanout.publish(RtpFrame::new(kind, packet));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::path::{Command, Fanout};
    use crate::rtp::RtpPacket;
    use crate::source::SourceSettings;
    use crate::stats::SourceMetrics;
    use crate::media::ts::TS_PACKET_SIZE;
    use crate::testutil::{annex_b, TsWriter};

    fn ingest() -> (Ingest, Arc<Fanout>, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let fanout = Arc::new(Fanout::new(64));
        let ctx = SourceContext {
            path: "test".into(),
            session: 1,
            events: tx,
            fanout: Arc::clone(&fanout),
            metrics: Arc::new(SourceMetrics::new()),
            settings: SourceSettings::default(),
        };
        (Ingest::new(ctx), fanout, rx)
    }

    #[tokio::test]
    async fn test_parameter_sets_then_frame() {
        let (mut ingest, fanout, mut events) = ingest();
        let (mut rx, _) = fanout.subscribe();

        let mut ts = TsWriter::new(256);
        let mut segment = ts.tables();
        segment.extend(ts.pes(90_000, &annex_b(&[&[7, 1, 2, 3], &[8]]), false));
        segment.extend(ts.pes(180_000, &annex_b(&[&[5]]), false));

        ingest.feed(&segment);
        let outcome = ingest.end_segment();
        assert_eq!(outcome, SegmentOutcome { units: 2, errors: 0 });

        match events.recv().await {
            Some(Command::Source {
                session: 1,
                event: SourceEvent::Ready(track),
            }) => assert_eq!(&track.sps[..], &[7, 1, 2, 3]),
            _ => panic!("expected Ready"),
        }

        let sps = rx.recv().await.unwrap();
        let pps = rx.recv().await.unwrap();
        let idr = rx.recv().await.unwrap();
        assert!(sps.is_parameter_set() && pps.is_parameter_set());
        assert!(idr.is_keyframe());
        assert_eq!(fanout.bootstrap().len(), 2);

        let packet = RtpPacket::unmarshal(&idr.data).unwrap();
        assert_eq!(&packet.payload[..], &[0x05]);
        assert_eq!(packet.timestamp, 180_000);
        assert!(packet.marker);
        assert_eq!(idr.sequence_number, pps.sequence_number.wrapping_add(1));
    }

    #[tokio::test]
    async fn test_garbage_segment_is_a_failure() {
        let (mut ingest, fanout, _events) = ingest();

        let mut garbage = vec![0x47u8; 188];
        garbage[1] = 0x00;
        garbage[3] = 0x30;
        garbage[4] = 250;
        ingest.feed(&garbage);

        let outcome = ingest.end_segment();
        assert!(outcome.is_failure());
        assert_eq!(fanout.frames_published(), 0);

        // counters restart for the next segment
        assert_eq!(ingest.end_segment(), SegmentOutcome::default());
    }

    #[tokio::test]
    async fn test_refetched_segment_is_not_delivered_twice() {
        let (mut ingest, fanout, _events) = ingest();
        let (mut rx, _) = fanout.subscribe();

        let segment = |ts: &mut TsWriter| {
            let mut out = ts.tables();
            out.extend(ts.pes(180_000, &annex_b(&[&[7, 1, 2, 3], &[8], &[5]]), false));
            out.extend(ts.pes(183_000, &annex_b(&[&[0x41, 1]]), false));
            out.extend(ts.pes(186_000, &annex_b(&[&[0x41, 2]]), false));
            out
        };

        // the first download breaks off after the second unit has started
        let first = segment(&mut TsWriter::new(256));
        let cut = first.len() - TS_PACKET_SIZE;
        ingest.feed(&first[..cut]);
        ingest.discard_segment();

        ingest.feed(&segment(&mut TsWriter::new(256)));
        let outcome = ingest.end_segment();
        assert!(!outcome.is_failure());

        let mut timestamps = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if !frame.is_parameter_set() {
                timestamps.push(frame.timestamp);
            }
        }
        assert_eq!(timestamps, vec![180_000, 183_000, 186_000]);

        // a regular next segment is not affected
        let mut ts = TsWriter::new(256);
        let mut next = ts.tables();
        next.extend(ts.pes(189_000, &annex_b(&[&[0x41, 3]]), false));
        ingest.feed(&next);
        ingest.end_segment();
        assert_eq!(rx.try_recv().unwrap().timestamp, 189_000);
    }
}
