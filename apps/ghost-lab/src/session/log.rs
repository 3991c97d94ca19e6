use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use time::OffsetDateTime;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    Identity,
    Lifecycle,
    Inbound,
    Engine,
    Command,
    Protocol,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub category: LogCategory,
    pub message: String,
}

impl LogEntry {
    /// Wall-clock time as `HH:MM:SS`.
    pub fn clock(&self) -> String {
        format!(
            "{:02}:{:02}:{:02}",
            self.at.hour(),
            self.at.minute(),
            self.at.second()
        )
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.clock(), self.message)
    }
}

/// Bounded operator-facing trail; the oldest entry is evicted first.
#[derive(Debug)]
pub struct SessionLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl SessionLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&mut self, category: LogCategory, message: impl Into<String>) {
        self.record_at(OffsetDateTime::now_utc(), category, message);
    }

    pub fn record_at(
        &mut self,
        at: OffsetDateTime,
        category: LogCategory,
        message: impl Into<String>,
    ) {
        let message = message.into();
        info!(target: "ghost_lab::session_log", ?category, "{message}");
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            at,
            category,
            message,
        });
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn oldest_entries_are_evicted_first() {
        let mut log = SessionLog::new(3);
        for idx in 0..5 {
            log.record(LogCategory::Lifecycle, format!("entry {idx}"));
        }
        let messages: Vec<&str> = log.entries().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["entry 2", "entry 3", "entry 4"]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn zero_capacity_still_keeps_latest() {
        let mut log = SessionLog::new(0);
        log.record(LogCategory::Engine, "a");
        log.record(LogCategory::Engine, "b");
        assert_eq!(log.capacity(), 1);
        assert_eq!(log.to_vec()[0].message, "b");
    }

    #[test]
    fn entries_render_with_clock() {
        let mut log = SessionLog::new(15);
        log.record_at(
            datetime!(2024-03-01 09:05:07 UTC),
            LogCategory::Engine,
            "[ENGINE] Local engine booted",
        );
        let entry = log.entries().next().unwrap();
        assert_eq!(entry.clock(), "09:05:07");
        assert_eq!(entry.to_string(), "09:05:07 [ENGINE] Local engine booted");
    }

    #[test]
    fn entries_serialize_with_rfc3339_timestamps() {
        let mut log = SessionLog::new(15);
        log.record_at(
            datetime!(2024-03-01 09:05:07 UTC),
            LogCategory::Inbound,
            "[INCOMING] Request from A1",
        );
        let json = serde_json::to_value(log.to_vec()).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{
                "at": "2024-03-01T09:05:07Z",
                "category": "inbound",
                "message": "[INCOMING] Request from A1"
            }])
        );
    }
}
