// Bounded history of captured proxy log lines

use crate::process::LogEntry;

/// Number of entries kept before a trim is triggered
pub const MAX_HISTORY_ENTRIES: usize = 2000;

/// How many of the oldest entries are dropped per trim
pub const TRIM_BATCH: usize = 500;

/// Append-only log history with amortized trimming.
///
/// Instead of evicting one entry per append, the oldest `TRIM_BATCH` entries
/// are dropped once the history grows past `MAX_HISTORY_ENTRIES`, so the
/// length never exceeds `MAX_HISTORY_ENTRIES + 1`.
#[derive(Debug, Clone)]
pub struct LogHistory {
    entries: Vec<LogEntry>,
    capacity: usize,
    trim_batch: usize,
}

impl LogHistory {
    pub fn new() -> Self {
        Self::with_limits(MAX_HISTORY_ENTRIES, TRIM_BATCH)
    }

    pub fn with_limits(capacity: usize, trim_batch: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity + 1),
            capacity,
            trim_batch: trim_batch.clamp(1, capacity.max(1)),
        }
    }

    /// Add a new entry, trimming a batch of old ones if we are over the limit
    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() > self.capacity {
            let drop = self.trim_batch.min(self.entries.len());
            self.entries.drain(..drop);
        }
        self.entries.push(entry);
    }

    /// Copy of the current entries, oldest first
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for LogHistory {
    fn default() -> Self {
        Self::new()
    }
}
