//! Path lifecycle state
//!
//! ```text
//!            attach (on-demand) / create (always-on) / publish
//!   ┌──────┐ ─────────────────────────────────────────► ┌──────────┐
//!   │ Idle │                                             │ Starting │
//!   └──────┘ ◄───────────── start failure ────────────── └──────────┘
//!      ▲                                                     │ track ready
//!      │ teardown done                                       ▼
//!   ┌─────────┐ ◄──── idle timeout / upstream ended ──── ┌─────────┐
//!   │ Closing │                                          │ Running │
//!   └─────────┘                                          └─────────┘
//!
//!   any state ── remove ──► Removed
//! ```

/// Lifecycle state of a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    /// No source running
    Idle,
    /// Source connecting, waiting for the first parameter sets
    Starting,
    /// Source producing frames
    Running,
    /// Source teardown in progress; attaches are queued
    Closing,
    /// Terminal
    Removed,
}

impl PathState {
    /// Whether a source task may exist in this state
    pub fn has_source(&self) -> bool {
        matches!(self, PathState::Starting | PathState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PathState::Removed)
    }

    /// Whether moving to `next` follows the lifecycle graph
    pub fn can_transition(&self, next: PathState) -> bool {
        use PathState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Idle)
                | (Starting, Closing)
                | (Running, Closing)
                | (Closing, Idle)
                | (Idle | Starting | Running | Closing, Removed)
        )
    }
}

impl std::fmt::Display for PathState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PathState::Idle => "idle",
            PathState::Starting => "starting",
            PathState::Running => "running",
            PathState::Closing => "closing",
            PathState::Removed => "removed",
        };
        f.write_str(s)
    }
}
