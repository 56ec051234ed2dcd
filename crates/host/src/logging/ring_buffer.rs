//! Bounded in-memory buffer for per-plugin log lines.

use std::collections::VecDeque;

use crate::types::{LogEntry, LogLevel, LogSource};

/// Fixed-capacity buffer that drops the oldest entry on overflow.
#[derive(Debug)]
pub struct LogRingBuffer {
    buffer: VecDeque<LogEntry>,
    max_size: usize,
}

impl LogRingBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    pub fn add_entry(&mut self, entry: LogEntry) {
        if self.buffer.len() >= self.max_size {
            self.buffer.pop_front();
        }
        self.buffer.push_back(entry);
    }

    /// The most recent `count` entries, oldest first.
    pub fn get_recent(&self, count: usize) -> Vec<LogEntry> {
        let start = self.buffer.len().saturating_sub(count);
        self.buffer.iter().skip(start).cloned().collect()
    }

    pub fn get_all(&self) -> Vec<LogEntry> {
        self.buffer.iter().cloned().collect()
    }

    pub fn get_by_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.buffer
            .iter()
            .filter(|entry| entry.level == level)
            .cloned()
            .collect()
    }

    pub fn get_by_source(&self, source: LogSource) -> Vec<LogEntry> {
        self.buffer
            .iter()
            .filter(|entry| entry.source == source)
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.max_size
    }
}

impl Default for LogRingBuffer {
    fn default() -> Self {
        Self::new(1000)
    }
}
