//! Progress and error events published by the index engine.

use tokio::sync::broadcast;

use crate::error::IndexerError;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Something the engine wants observers to know about.
#[derive(Debug, Clone)]
pub enum IndexEvent {
    /// Block `height` is fully merged and covered by the watermark.
    BlockIndexed { height: u64 },
    /// The run loop hit an unrecoverable error and halted.
    Error { cause: IndexerError },
    /// The run loop exited after `stop()`.
    Stopped { watermark: Option<u64> },
}

/// Fan-out channel for [`IndexEvent`]s.
///
/// Emitting never blocks and never fails: with no subscribers the event is
/// dropped, and a slow subscriber sees `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IndexEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: IndexEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
