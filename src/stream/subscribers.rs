//! Live subscription fan-out.
//!
//! One broadcast channel per stream. Appends publish a wakeup carrying the
//! new next-offset; waiters re-read from their own cursor, so slow receivers
//! that miss wakeups (lagged broadcast) still catch up from the index.
//! Terminal events (`Closed`, `Deleted`) let long-polls and push
//! subscriptions end instead of blocking forever. Dropping a receiver
//! releases its slot immediately.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Capacity of each per-stream broadcast channel. Lagged receivers recover
/// by re-reading from their cursor, so overflow only costs a redundant read.
const CHANNEL_CAPACITY: usize = 64;

/// A wakeup event pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// New records are indexed past `next_offset`'s predecessor.
    Appended { next_offset: String },
    /// Stream is closed; caught-up waiters should terminate.
    Closed { next_offset: String },
    /// Stream was soft-deleted; subscribers must resubscribe after recreate.
    Deleted,
}

#[derive(Default)]
pub struct SubscriberRegistry {
    channels: Mutex<HashMap<String, broadcast::Sender<StreamEvent>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<StreamEvent>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to a stream's events, creating the channel on first use.
    pub fn subscribe(&self, stream_path: &str) -> broadcast::Receiver<StreamEvent> {
        let mut channels = self.channels();
        channels
            .entry(stream_path.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event to a stream's subscribers, if any are registered.
    /// Channels with no remaining receivers are dropped.
    pub fn publish(&self, stream_path: &str, event: StreamEvent) {
        let mut channels = self.channels();
        if let Some(sender) = channels.get(stream_path) {
            if sender.send(event).is_err() {
                // No live receivers left.
                channels.remove(stream_path);
            }
        }
    }

    /// Publish a terminal event and drop the channel entirely.
    pub fn publish_terminal(&self, stream_path: &str, event: StreamEvent) {
        let mut channels = self.channels();
        if let Some(sender) = channels.remove(stream_path) {
            let _ = sender.send(event);
        }
    }

    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }
}
