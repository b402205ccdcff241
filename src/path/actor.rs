//! Path lifecycle task
//!
//! Every path is owned by one task that serializes all state changes:
//! attaches, detaches, source events and timer expiries are messages
//! handled one at a time. Timers are deadlines re-checked when they fire,
//! so an attach that races an idle timeout is resolved by whichever
//! message is handled first.

use std::collections::HashSet;
use std::mem;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{PathConfig, SourceLocator};
use crate::error::SourceError;
use crate::media::Track;
use crate::source::{
    HlsSource, PublishedSource, Publisher, RunningSource, Source, SourceContext, SourceEvent,
    SourceSettings,
};
use crate::stats::SourceMetrics;

use super::entry::PathStats;
use super::error::PathError;
use super::fanout::{Fanout, Reader};
use super::frame::RtpFrame;
use super::state::PathState;

/// Messages handled by the path task
pub(crate) enum Command {
    Attach {
        reply: oneshot::Sender<Result<Reader, PathError>>,
    },
    Detach {
        id: u64,
    },
    Publish {
        reply: oneshot::Sender<Result<Publisher, PathError>>,
    },
    Source {
        session: u64,
        event: SourceEvent,
    },
    Stats {
        reply: oneshot::Sender<PathStats>,
    },
    Remove {
        reply: oneshot::Sender<()>,
    },
}

/// Attach request waiting for the source to become ready
struct Waiter {
    id: u64,
    reply: oneshot::Sender<Result<Reader, PathError>>,
    /// Taken once the source session the reader will follow has started
    subscription: Option<(broadcast::Receiver<RtpFrame>, Vec<RtpFrame>)>,
}

pub(crate) struct PathActor {
    name: String,
    config: PathConfig,
    settings: SourceSettings,
    state: PathState,
    state_tx: watch::Sender<PathState>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    fanout: Arc<Fanout>,
    metrics: Arc<SourceMetrics>,
    readers: HashSet<u64>,
    waiters: Vec<Waiter>,
    next_reader_id: u64,
    source: Option<RunningSource>,
    session: u64,
    track: Option<Track>,
    idle_deadline: Option<Instant>,
    start_deadline: Option<Instant>,
    retry_deadline: Option<Instant>,
    source_failures: u64,
    last_error: Option<SourceError>,
}

impl PathActor {
    pub(crate) fn new(
        name: String,
        config: PathConfig,
        settings: SourceSettings,
        state_tx: watch::Sender<PathState>,
        commands_tx: mpsc::UnboundedSender<Command>,
        commands: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) -> Self {
        let fanout = Arc::new(Fanout::new(settings.read_buffer_count));
        Self {
            name,
            config,
            settings,
            state: PathState::Idle,
            state_tx,
            commands_tx,
            commands,
            shutdown,
            fanout,
            metrics: Arc::new(SourceMetrics::new()),
            readers: HashSet::new(),
            waiters: Vec::new(),
            next_reader_id: 1,
            source: None,
            session: 0,
            track: None,
            idle_deadline: None,
            start_deadline: None,
            retry_deadline: None,
            source_failures: 0,
            last_error: None,
        }
    }

    fn is_always_on_pull(&self) -> bool {
        !self.config.source_on_demand && !self.config.source.is_published()
    }

    pub(crate) async fn run(mut self) {
        if self.is_always_on_pull() {
            self.start_pull_source();
        }

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Remove { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = sleep_until(deadline) => self.on_deadline(),
            }
        }

        self.teardown().await;
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Attach { reply } => self.on_attach(reply),
            Command::Detach { id } => self.on_detach(id),
            Command::Publish { reply } => self.on_publish(reply),
            Command::Source { session, event } => {
                if session == self.session {
                    self.on_source_event(event);
                }
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            // handled by the run loop
            Command::Remove { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn set_state(&mut self, next: PathState) {
        if self.state == next {
            return;
        }
        debug_assert!(self.state.can_transition(next), "{} -> {}", self.state, next);
        tracing::info!(
            path = %self.name,
            from = %self.state,
            to = %next,
            "Path state changed"
        );
        self.state = next;
        self.state_tx.send_replace(next);
    }

    fn next_reader_id(&mut self) -> u64 {
        let id = self.next_reader_id;
        self.next_reader_id += 1;
        id
    }

    fn new_reader(
        &mut self,
        id: u64,
        subscription: (broadcast::Receiver<RtpFrame>, Vec<RtpFrame>),
    ) -> Reader {
        self.readers.insert(id);
        self.idle_deadline = None;
        tracing::info!(
            path = %self.name,
            reader_id = id,
            readers = self.readers.len(),
            bootstrap_frames = subscription.1.len(),
            "Reader attached"
        );
        Reader::new(
            id,
            self.name.clone(),
            self.track.clone(),
            subscription,
            Arc::clone(&self.fanout),
            self.commands_tx.clone(),
        )
    }

    fn on_attach(&mut self, reply: oneshot::Sender<Result<Reader, PathError>>) {
        match self.state {
            PathState::Running => {
                let id = self.next_reader_id();
                let subscription = self.fanout.subscribe();
                let reader = self.new_reader(id, subscription);
                let _ = reply.send(Ok(reader));
            }
            PathState::Starting | PathState::Closing => self.enqueue(reply),
            PathState::Idle => match self.config.source {
                SourceLocator::Published => {
                    let _ = reply.send(Err(PathError::NoPublisher(self.name.clone())));
                }
                SourceLocator::Hls(_) if self.config.source_on_demand => {
                    self.enqueue(reply);
                    self.start_pull_source();
                }
                SourceLocator::Hls(_) => {
                    let _ = reply.send(Err(PathError::NotReady(self.name.clone())));
                }
            },
            PathState::Removed => {
                let _ = reply.send(Err(PathError::Removed(self.name.clone())));
            }
        }
    }

    fn enqueue(&mut self, reply: oneshot::Sender<Result<Reader, PathError>>) {
        let id = self.next_reader_id();
        // a closing session's frames must not reach the new reader
        let subscription = match self.state {
            PathState::Starting => Some(self.fanout.subscribe()),
            _ => None,
        };
        self.waiters.push(Waiter {
            id,
            reply,
            subscription,
        });
        if self.state == PathState::Starting && self.start_deadline.is_none() {
            self.start_deadline = Some(Instant::now() + self.config.source_on_demand_start_timeout);
        }
        tracing::debug!(
            path = %self.name,
            reader_id = id,
            state = %self.state,
            waiting = self.waiters.len(),
            "Reader waiting for source"
        );
    }

    fn on_detach(&mut self, id: u64) {
        if !self.readers.remove(&id) {
            return;
        }
        tracing::info!(
            path = %self.name,
            reader_id = id,
            readers = self.readers.len(),
            "Reader detached"
        );
        self.schedule_idle_close();
    }

    fn schedule_idle_close(&mut self) {
        if self.config.source_on_demand
            && self.state == PathState::Running
            && self.readers.is_empty()
            && self.waiters.is_empty()
        {
            let after = self.config.source_on_demand_close_after;
            tracing::debug!(path = %self.name, after = ?after, "No readers, idle timer armed");
            self.idle_deadline = Some(Instant::now() + after);
        }
    }

    fn on_publish(&mut self, reply: oneshot::Sender<Result<Publisher, PathError>>) {
        if !self.config.source.is_published() {
            let _ = reply.send(Err(PathError::NotPublishable(self.name.clone())));
            return;
        }
        match self.state {
            PathState::Idle => {
                let (publisher, source) =
                    PublishedSource::channel(self.name.clone(), self.settings.read_buffer_count);
                self.start_source(Source::Published(source));
                tracing::info!(path = %self.name, "Publisher connected");
                let _ = reply.send(Ok(publisher));
            }
            PathState::Removed => {
                let _ = reply.send(Err(PathError::Removed(self.name.clone())));
            }
            _ => {
                let _ = reply.send(Err(PathError::AlreadyPublishing(self.name.clone())));
            }
        }
    }

    fn start_pull_source(&mut self) {
        if let SourceLocator::Hls(url) = &self.config.source {
            let source = Source::Hls(HlsSource::new(url.clone()));
            self.start_source(source);
        }
    }

    fn start_source(&mut self, source: Source) {
        self.session += 1;
        self.retry_deadline = None;

        // fresh channel: nothing from a previous session reaches new readers
        self.fanout.reset();
        self.track = None;
        for waiter in &mut self.waiters {
            waiter.subscription = Some(self.fanout.subscribe());
        }
        if !self.waiters.is_empty() {
            self.start_deadline = Some(Instant::now() + self.config.source_on_demand_start_timeout);
        }

        let ctx = SourceContext {
            path: self.name.clone(),
            session: self.session,
            events: self.commands_tx.clone(),
            fanout: Arc::clone(&self.fanout),
            metrics: Arc::clone(&self.metrics),
            settings: self.settings.clone(),
        };
        tracing::info!(
            path = %self.name,
            source = %self.config.source,
            session = self.session,
            "Starting source"
        );
        self.source = Some(source.start(ctx));
        self.set_state(PathState::Starting);
    }

    /// Stop the running source in the background; `SourceEvent::Closed` follows
    fn begin_close(&mut self, reason: &'static str) {
        self.idle_deadline = None;
        self.start_deadline = None;

        tracing::info!(path = %self.name, reason, "Closing source");
        self.set_state(PathState::Closing);

        let Some(source) = self.source.take() else {
            self.on_source_closed();
            return;
        };

        let events = self.commands_tx.clone();
        let session = self.session;
        tokio::spawn(async move {
            source.stop().await;
            let _ = events.send(Command::Source {
                session,
                event: SourceEvent::Closed,
            });
        });
    }

    fn on_source_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Ready(track) => self.on_source_ready(track),
            SourceEvent::Failed(err) => self.on_source_failed(err),
            SourceEvent::Closed => self.on_source_closed(),
        }
    }

    fn on_source_ready(&mut self, track: Track) {
        tracing::info!(
            path = %self.name,
            codec = Track::CODEC,
            profile_level_id = ?track.profile_level_id(),
            "Source ready"
        );
        self.track = Some(track);

        if self.state != PathState::Starting {
            return;
        }

        self.set_state(PathState::Running);
        self.start_deadline = None;

        for waiter in mem::take(&mut self.waiters) {
            let subscription = waiter
                .subscription
                .unwrap_or_else(|| self.fanout.subscribe());
            let reader = self.new_reader(waiter.id, subscription);
            // a caller that gave up drops the reader, which detaches it
            let _ = waiter.reply.send(Ok(reader));
        }

        self.schedule_idle_close();
    }

    fn on_source_failed(&mut self, err: SourceError) {
        if !self.state.has_source() {
            return;
        }
        self.source = None;

        if err.is_termination() {
            tracing::info!(path = %self.name, "Upstream terminated");
        } else {
            self.source_failures += 1;
            tracing::error!(
                path = %self.name,
                error = %err,
                failures = self.source_failures,
                "Source failed"
            );
        }

        // close attached readers: their recv() returns None
        self.fanout.reset();
        if !self.readers.is_empty() {
            tracing::info!(
                path = %self.name,
                readers = self.readers.len(),
                "Detaching readers"
            );
            self.readers.clear();
        }

        self.fail_waiters(|name| PathError::StartFailed {
            path: name.to_string(),
            reason: err.to_string(),
        });
        self.last_error = Some(err);
        self.idle_deadline = None;
        self.start_deadline = None;
        self.track = None;

        if self.state == PathState::Running {
            self.set_state(PathState::Closing);
        }
        self.set_state(PathState::Idle);

        if self.is_always_on_pull() {
            let pause = self.settings.retry_pause;
            tracing::info!(path = %self.name, retry_in = ?pause, "Source restart scheduled");
            self.retry_deadline = Some(Instant::now() + pause);
        }
    }

    fn on_source_closed(&mut self) {
        if self.state != PathState::Closing {
            return;
        }
        self.fanout.reset();
        self.track = None;
        self.set_state(PathState::Idle);

        if !self.waiters.is_empty() {
            match self.config.source {
                SourceLocator::Hls(_) => self.start_pull_source(),
                SourceLocator::Published => {
                    self.fail_waiters(|name| PathError::NoPublisher(name.to_string()))
                }
            }
        }
    }

    fn fail_waiters(&mut self, err: impl Fn(&str) -> PathError) {
        for waiter in mem::take(&mut self.waiters) {
            let _ = waiter.reply.send(Err(err(&self.name)));
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.idle_deadline, self.start_deadline, self.retry_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();

        if self.idle_deadline.is_some_and(|d| d <= now) {
            self.idle_deadline = None;
            // an attach may have been handled after the timer was armed
            if self.state == PathState::Running
                && self.readers.is_empty()
                && self.waiters.is_empty()
            {
                self.begin_close("idle timeout");
            }
        }

        if self.start_deadline.is_some_and(|d| d <= now) {
            self.start_deadline = None;
            if self.state == PathState::Starting {
                let err = SourceError::StartTimeout(self.config.source_on_demand_start_timeout);
                tracing::warn!(path = %self.name, error = %err, "Source start timed out");
                self.fail_waiters(|name| PathError::StartFailed {
                    path: name.to_string(),
                    reason: err.to_string(),
                });
                self.last_error = Some(err);
                if self.config.source_on_demand {
                    self.begin_close("start timeout");
                }
            }
        }

        if self.retry_deadline.is_some_and(|d| d <= now) {
            self.retry_deadline = None;
            if self.state == PathState::Idle {
                self.start_pull_source();
            }
        }
    }

    fn stats(&self) -> PathStats {
        PathStats {
            name: self.name.clone(),
            state: self.state,
            readers: self.readers.len(),
            waiting: self.waiters.len(),
            track: self.track.clone(),
            frames_published: self.fanout.frames_published(),
            dropped_frames: self.fanout.overruns(),
            source_failures: self.source_failures,
            last_error: self.last_error.clone(),
            source: self.metrics.snapshot(),
        }
    }

    async fn teardown(&mut self) {
        self.fail_waiters(|name| PathError::Removed(name.to_string()));
        if let Some(source) = self.source.take() {
            source.stop().await;
        }
        self.fanout.reset();
        self.readers.clear();
        self.idle_deadline = None;
        self.start_deadline = None;
        self.retry_deadline = None;
        self.set_state(PathState::Removed);
        tracing::info!(path = %self.name, "Path removed");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
