//! Upstream sources
//!
//! A source runs as its own task, feeds the transport stream it receives
//! into an [`Ingest`] pipeline and reports to its path through
//! [`SourceEvent`] messages:
//!
//! - `Ready(track)` once the first parameter sets were extracted (and again
//!   whenever they change)
//! - `Failed(err)` when it gives up; `SourceError::Terminated` for a clean end
//!
//! Stopping is cooperative: [`RunningSource::stop`] cancels the task, which
//! aborts any in-flight request at its next suspension point.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::error::SourceError;
use crate::media::Track;
use crate::path::{Command, Fanout};
use crate::stats::SourceMetrics;

pub mod hls;
pub mod ingest;
pub mod published;

pub use hls::HlsSource;
pub use ingest::{Ingest, SegmentOutcome};
pub use published::{PublishedSource, Publisher};

/// Settings shared by every source of a relay
#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Timeout of each upstream request and of each read within a response
    pub read_timeout: Duration,
    /// Pause after a failed attempt
    pub retry_pause: Duration,
    /// Consecutive failures before a pull source gives up
    pub max_failures: u32,
    /// Playlist refresh interval clamp
    pub poll_min: Duration,
    pub poll_max: Duration,
    /// Maximum RTP packet size
    pub max_packet_size: usize,
    /// Per-reader queue capacity (and publisher queue capacity)
    pub read_buffer_count: usize,
}

impl From<&RelayConfig> for SourceSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            read_timeout: config.read_timeout,
            retry_pause: config.source_retry_pause,
            max_failures: config.source_max_failures,
            poll_min: config.source_poll_min,
            poll_max: config.source_poll_max,
            max_packet_size: config.udp_max_payload_size,
            read_buffer_count: config.read_buffer_count,
        }
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

/// Source notifications to the owning path
#[derive(Debug)]
pub enum SourceEvent {
    /// Parameter sets known; frames are flowing
    Ready(Track),
    /// Source ended on its own
    Failed(SourceError),
    /// Source stopped on request
    Closed,
}

/// Everything a source task needs from its path
pub(crate) struct SourceContext {
    pub path: String,
    pub session: u64,
    pub events: mpsc::UnboundedSender<Command>,
    pub fanout: Arc<Fanout>,
    pub metrics: Arc<SourceMetrics>,
    pub settings: SourceSettings,
}

impl SourceContext {
    pub fn report(&self, event: SourceEvent) {
        let _ = self.events.send(Command::Source {
            session: self.session,
            event,
        });
    }
}

/// Upstream source variants
#[derive(Debug)]
pub enum Source {
    /// Pull an HLS playlist
    Hls(HlsSource),
    /// Drain a publisher's pushed transport stream
    Published(PublishedSource),
}

impl Source {
    /// Spawn the source task
    pub(crate) fn start(self, ctx: SourceContext) -> RunningSource {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ingest = Ingest::new(ctx);

            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = self.run(&mut ingest) => result,
            };

            let err = match result {
                Ok(()) => SourceError::Terminated,
                Err(e) => e,
            };
            ingest.context().report(SourceEvent::Failed(err));
        });

        RunningSource { cancel, task }
    }

    async fn run(self, ingest: &mut Ingest) -> Result<(), SourceError> {
        match self {
            Source::Hls(source) => source.run(ingest).await,
            Source::Published(source) => source.run(ingest).await,
        }
    }
}

/// Handle to a source task
#[derive(Debug)]
pub struct RunningSource {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningSource {
    /// Cancel the task and wait until it has released its connections
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Source task ended abnormally");
        }
    }
}
