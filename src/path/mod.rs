//! Paths: named streams with a source and any number of readers
//!
//! # Architecture
//!
//! ```text
//!                          Arc<PathManager>
//!                     ┌─────────────────────────┐
//!                     │ paths: HashMap<Name,    │
//!                     │   Arc<PathHandle>>      │
//!                     └───────────┬─────────────┘
//!                                 │ commands
//!                                 ▼
//!                     ┌─────────────────────────┐
//!                     │ PathActor (one task)    │
//!                     │  state, readers,        │
//!                     │  timers, RunningSource  │
//!                     └───────────┬─────────────┘
//!                                 │ owns
//!         ┌───────────────────────┼───────────────────────┐
//!         ▼                       ▼                       ▼
//!    [Source task]           Arc<Fanout>             [Reader] ...
//!    demux → extract   ──►   broadcast::Tx    ──►    reader.recv()
//!    → packetize             + bootstrap
//! ```
//!
//! `bytes::Bytes` uses reference counting, so all readers share the same
//! packet allocation.

mod actor;
pub mod entry;
pub mod error;
pub mod fanout;
pub mod frame;
pub mod manager;
pub mod state;

pub(crate) use actor::Command;
pub use entry::{PathHandle, PathStats};
pub use error::PathError;
pub use fanout::{Fanout, Reader};
pub use frame::{FrameKind, RtpFrame};
pub use manager::PathManager;
pub use state::PathState;
