//! Push ("published") source
//!
//! The publishing protocol session holds a [`Publisher`] and writes the
//! transport stream it receives. Dropping the publisher ends the stream.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{PathError, SourceError};

use super::ingest::Ingest;

/// Write side of a published path
///
/// There is exactly one per publishing session, so the handle cannot be
/// duplicated:
///
/// ```compile_fail
/// fn shared<T: Clone>() {}
/// shared::<relay_rs::Publisher>();
/// ```
#[derive(Debug)]
pub struct Publisher {
    path: String,
    tx: mpsc::Sender<Bytes>,
}

impl Publisher {
    pub fn path_name(&self) -> &str {
        &self.path
    }

    /// Push transport stream bytes, waiting if the source is behind
    pub async fn write(&self, data: Bytes) -> Result<(), PathError> {
        self.tx
            .send(data)
            .await
            .map_err(|_| PathError::Removed(self.path.clone()))
    }

    /// Whether the path stopped accepting data
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read side, driven by the source task
#[derive(Debug)]
pub struct PublishedSource {
    path: String,
    rx: mpsc::Receiver<Bytes>,
}

impl PublishedSource {
    /// Create a connected publisher/source pair
    pub fn channel(path: String, capacity: usize) -> (Publisher, PublishedSource) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Publisher {
                path: path.clone(),
                tx,
            },
            PublishedSource { path, rx },
        )
    }

    pub(crate) async fn run(mut self, ingest: &mut Ingest) -> Result<(), SourceError> {
        while let Some(chunk) = self.rx.recv().await {
            ingest.feed(&chunk);
        }

        let outcome = ingest.end_segment();
        tracing::info!(
            path = %self.path,
            errors = outcome.errors,
            "Publisher disconnected"
        );
        Err(SourceError::Terminated)
    }
}
