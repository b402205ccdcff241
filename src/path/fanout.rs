//! Per-path frame fan-out
//!
//! Frames are distributed with `tokio::sync::broadcast`: the channel holds
//! the last `read_buffer_count` frames and each reader has its own cursor
//! into it. A reader that falls behind loses the oldest frames it has not
//! yet received, while the producer and every other reader carry on
//! unaffected.
//!
//! The current SPS/PPS packets are cached as the bootstrap. Subscribing
//! takes the bootstrap snapshot and the receiver under the same lock that
//! publishing holds, so a reader always gets the parameter sets before any
//! coded frame that depends on them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;

use crate::media::Track;

use super::actor::Command;
use super::frame::RtpFrame;

struct FanoutInner {
    tx: broadcast::Sender<RtpFrame>,
    bootstrap: Vec<RtpFrame>,
}

/// Shared between a path's source (producer) and its readers
pub struct Fanout {
    inner: Mutex<FanoutInner>,
    capacity: usize,
    frames_published: AtomicU64,
    overruns: AtomicU64,
}

impl Fanout {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Mutex::new(FanoutInner {
                tx,
                bootstrap: Vec::new(),
            }),
            capacity,
            frames_published: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FanoutInner> {
        // frames are plain data; a panicked holder cannot leave them half-written
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a receiver; returns it with the bootstrap to deliver first
    pub fn subscribe(&self) -> (broadcast::Receiver<RtpFrame>, Vec<RtpFrame>) {
        let inner = self.lock();
        (inner.tx.subscribe(), inner.bootstrap.clone())
    }

    /// Replace the cached parameter sets and send them to current readers
    pub fn set_bootstrap(&self, frames: Vec<RtpFrame>) {
        let mut inner = self.lock();
        for frame in &frames {
            let _ = inner.tx.send(frame.clone());
        }
        self.frames_published
            .fetch_add(frames.len() as u64, Ordering::Relaxed);
        inner.bootstrap = frames;
    }

    /// Send a frame to every reader
    ///
    /// Returns the number of readers it was queued for.
    pub fn publish(&self, frame: RtpFrame) -> usize {
        let inner = self.lock();
        self.frames_published.fetch_add(1, Ordering::Relaxed);
        inner.tx.send(frame).unwrap_or(0)
    }

    /// Current bootstrap frames
    pub fn bootstrap(&self) -> Vec<RtpFrame> {
        self.lock().bootstrap.clone()
    }

    /// Close every current receiver and forget the bootstrap
    ///
    /// Readers drain what is already queued and then see the end of stream.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let (tx, _) = broadcast::channel(self.capacity.max(1));
        inner.tx = tx;
        inner.bootstrap.clear();
    }

    /// Receivers currently attached to the channel
    pub fn receiver_count(&self) -> usize {
        self.lock().tx.receiver_count()
    }

    pub fn frames_published(&self) -> u64 {
        self.frames_published.load(Ordering::Relaxed)
    }

    /// Frames lost by readers that fell behind, summed over all readers
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

/// A downstream consumer attached to a path
///
/// Frames come out in production order, bootstrap first. Dropping the
/// reader detaches it from the path.
pub struct Reader {
    id: u64,
    path: String,
    track: Option<Track>,
    rx: broadcast::Receiver<RtpFrame>,
    pending: VecDeque<RtpFrame>,
    fanout: Arc<Fanout>,
    overruns: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl Reader {
    pub(crate) fn new(
        id: u64,
        path: String,
        track: Option<Track>,
        subscription: (broadcast::Receiver<RtpFrame>, Vec<RtpFrame>),
        fanout: Arc<Fanout>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let (rx, bootstrap) = subscription;
        Self {
            id,
            path,
            track,
            rx,
            pending: bootstrap.into(),
            fanout,
            overruns: 0,
            commands,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path_name(&self) -> &str {
        &self.path
    }

    /// Track description at attach time
    pub fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    /// Frames this reader lost by falling behind
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Next frame; `None` once the path stopped or was removed
    pub async fn recv(&mut self) -> Option<RtpFrame> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }

            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(RecvError::Lagged(n)) => self.on_overrun(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next frame if one is ready, without waiting
    pub fn try_recv(&mut self) -> Option<RtpFrame> {
        use broadcast::error::TryRecvError;

        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }

            match self.rx.try_recv() {
                Ok(frame) => return Some(frame),
                Err(TryRecvError::Lagged(n)) => self.on_overrun(n),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    fn on_overrun(&mut self, n: u64) {
        self.overruns += n;
        self.fanout.overruns.fetch_add(n, Ordering::Relaxed);
        tracing::debug!(
            path = %self.path,
            reader_id = self.id,
            dropped = n,
            "Reader overrun, dropped oldest frames"
        );
        // frames after the gap may reference parameter sets that were lost
        self.pending.extend(self.fanout.bootstrap());
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Detach { id: self.id });
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("overruns", &self.overruns)
            .finish()
    }
}
