//! Console log keeping for front ends
//!
//! DUT console output and user-visible messages are stored as plain entries;
//! formatting is left to whoever displays them.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::protocol::link::DeviceCategory;

/// A log entry with timestamp and message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub message: String,
    pub level: LogLevel,
    /// Device the text came from; `None` for messages of the tool itself.
    pub source: Option<DeviceCategory>,
}

/// Log entry severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogEntry {
    pub fn new(message: String, level: LogLevel) -> Self {
        Self {
            timestamp: Local::now(),
            message,
            level,
            source: None,
        }
    }

    /// Raw text received from a device console.
    pub fn console(source: DeviceCategory, message: String) -> Self {
        Self {
            timestamp: Local::now(),
            message,
            level: LogLevel::Info,
            source: Some(source),
        }
    }

    pub fn info(message: String) -> Self {
        Self::new(message, LogLevel::Info)
    }

    pub fn warning(message: String) -> Self {
        Self::new(message, LogLevel::Warning)
    }

    pub fn error(message: String) -> Self {
        Self::new(message, LogLevel::Error)
    }
}

/// A bounded buffer of recent log entries
pub struct LogBuffer {
    entries: Vec<LogEntry>,
    max_entries: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);

        // Trim oldest entries if we exceed the max
        if self.entries.len() > self.max_entries {
            let excess = self.entries.len() - self.max_entries;
            self.entries.drain(0..excess);
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// The last `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> &[LogEntry] {
        let from = self.entries.len().saturating_sub(n);
        &self.entries[from..]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_drops_oldest_entries() {
        let mut buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(LogEntry::info(format!("line {i}")));
        }
        let messages: Vec<_> = buffer.entries().iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(buffer.tail(2)[0].message, "line 3");
        assert_eq!(buffer.tail(10).len(), 3);
    }

    #[test]
    fn console_entries_carry_their_source() {
        let entry = LogEntry::console(DeviceCategory::Dut, "start\n".to_string());
        assert_eq!(entry.source, Some(DeviceCategory::Dut));
        assert_eq!(entry.level, LogLevel::Info);
    }
}
