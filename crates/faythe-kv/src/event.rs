//! Watch events and the stream handed to managers.

use tokio::sync::mpsc;

use crate::error::KvError;

/// What happened to a watched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The key was written for the first time.
    Create,
    /// An existing key was overwritten.
    Modify,
    /// The key was removed (explicitly or by lease expiry).
    Delete,
}

/// A single change observed on a watched prefix.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Value bytes; empty for deletes.
    pub value: Vec<u8>,
}

/// Item delivered by a watch: an event, or a terminal stream error.
pub type WatchItem = Result<WatchEvent, KvError>;

/// Receiving half of a prefix watch.
///
/// Dropping the stream tears down the underlying watcher.
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchItem>,
}

impl WatchStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<WatchItem>) -> Self {
        Self { rx }
    }

    /// Next item, or `None` once the watcher is gone.
    pub async fn recv(&mut self) -> Option<WatchItem> {
        self.rx.recv().await
    }
}
