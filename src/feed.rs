// Live log fan-out for streaming consumers

use std::sync::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::process::LogEntry;

/// Queue depth per subscriber
pub const SUBSCRIBER_CAPACITY: usize = 256;

/// Best-effort broadcast of log entries.
///
/// Every subscriber gets its own bounded queue. Publishing never waits: when a
/// subscriber's queue is full the entry is dropped for that subscriber only,
/// and subscribers that went away are pruned on the next publish.
pub struct LogFeed {
    subscribers: Mutex<Vec<mpsc::Sender<LogEntry>>>,
    capacity: usize,
}

/// Read side of a live log subscription
pub struct LogSubscription {
    rx: mpsc::Receiver<LogEntry>,
}

impl LogSubscription {
    /// Wait for the next entry; `None` once the feed is gone
    pub async fn recv(&mut self) -> Option<LogEntry> {
        self.rx.recv().await
    }

    /// Next entry if one is already queued
    pub fn try_recv(&mut self) -> Option<LogEntry> {
        self.rx.try_recv().ok()
    }
}

impl LogFeed {
    pub fn new() -> Self {
        Self::with_capacity(SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> LogSubscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.lock().unwrap().push(tx);
        LogSubscription { rx }
    }

    pub fn publish(&self, entry: &LogEntry) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| match tx.try_send(entry.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl Default for LogFeed {
    fn default() -> Self {
        Self::new()
    }
}
