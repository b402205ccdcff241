//! Path handle and statistics
//!
//! A [`PathHandle`] is the cloneable-by-`Arc` front of one path task. All
//! operations are messages to that task; the lifecycle state is also
//! published on a watch channel so it can be read without a round trip.

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::PathConfig;
use crate::error::SourceError;
use crate::media::Track;
use crate::source::{Publisher, SourceSettings};
use crate::stats::SourceStats;

use super::actor::{Command, PathActor};
use super::error::PathError;
use super::fanout::Reader;
use super::state::PathState;

/// Statistics for a path
#[derive(Debug, Clone)]
pub struct PathStats {
    /// Path name as requested
    pub name: String,
    /// Current lifecycle state
    pub state: PathState,
    /// Attached readers
    pub readers: usize,
    /// Attach requests waiting for the source
    pub waiting: usize,
    /// Track of the running source
    pub track: Option<Track>,
    /// Frames handed to the fan-out
    pub frames_published: u64,
    /// Frames lost by readers that fell behind
    pub dropped_frames: u64,
    /// Source failures since the path was created
    pub source_failures: u64,
    /// Last error reported by a source
    pub last_error: Option<SourceError>,
    /// Source counters, accumulated over sessions
    pub source: SourceStats,
}

/// Handle to a running path
pub struct PathHandle {
    name: String,
    config: PathConfig,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<PathState>,
    shutdown: CancellationToken,
}

impl PathHandle {
    /// Spawn the path task
    ///
    /// Always-on pull paths start their source immediately.
    pub(crate) fn spawn(name: String, config: PathConfig, settings: SourceSettings) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PathState::Idle);
        let shutdown = CancellationToken::new();

        let actor = PathActor::new(
            name.clone(),
            config.clone(),
            settings,
            state_tx,
            commands_tx.clone(),
            commands_rx,
            shutdown.clone(),
        );
        tokio::spawn(actor.run());

        tracing::debug!(path = %name, config = %config.name, "Path created");

        Self {
            name,
            config,
            commands: commands_tx,
            state: state_rx,
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration entry this path was created from
    pub fn config(&self) -> &PathConfig {
        &self.config
    }

    /// Attach a reader
    ///
    /// On an idle on-demand path this starts the source and waits, at most
    /// `sourceOnDemandStartTimeout`, for it to become ready.
    pub async fn attach(&self) -> Result<Reader, PathError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Attach { reply })?;
        rx.await.map_err(|_| PathError::Removed(self.name.clone()))?
    }

    /// Become the publisher of a push-only path
    pub async fn publish(&self) -> Result<Publisher, PathError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Publish { reply })?;
        rx.await.map_err(|_| PathError::Removed(self.name.clone()))?
    }

    /// Current lifecycle state
    pub fn state(&self) -> PathState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes
    pub fn subscribe_state(&self) -> watch::Receiver<PathState> {
        self.state.clone()
    }

    /// Wait until the path reaches `target`
    pub async fn wait_for_state(&self, target: PathState) -> Result<(), PathError> {
        let mut rx = self.state.clone();
        let reached = match rx.wait_for(|s| *s == target || s.is_terminal()).await {
            Ok(state) => *state == target,
            Err(_) => false,
        };
        if reached {
            Ok(())
        } else {
            Err(PathError::Removed(self.name.clone()))
        }
    }

    /// Current statistics
    pub async fn stats(&self) -> Result<PathStats, PathError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        rx.await.map_err(|_| PathError::Removed(self.name.clone()))
    }

    /// Track of the running source, if any
    pub async fn track(&self) -> Option<Track> {
        self.stats().await.ok().and_then(|s| s.track)
    }

    /// Stop the source, close every reader and end the path task
    pub async fn remove(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Remove { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, cmd: Command) -> Result<(), PathError> {
        self.commands
            .send(cmd)
            .map_err(|_| PathError::Removed(self.name.clone()))
    }
}

impl Drop for PathHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for PathHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathHandle")
            .field("name", &self.name)
            .field("config", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}
