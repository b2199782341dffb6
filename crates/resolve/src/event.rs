//! Deterministic resolution event log.
//!
//! This is a plain value returned to callers alongside results (the API
//! layer renders it for the operator); it is not wired into `tracing`, which
//! stays operational-only. Two resolver runs over the same inputs produce
//! identical logs.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEntry {
    pub level: EventLevel,
    /// What the entry is about, usually an object key or instance key.
    pub subject: String,
    pub message: String,
}

/// Append-only log with a verbosity floor: entries below it are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLog {
    level: EventLevel,
    entries: Vec<EventEntry>,
}

impl EventLog {
    pub fn new(level: EventLevel) -> EventLog {
        EventLog { level, entries: Vec::new() }
    }

    pub fn push(&mut self, level: EventLevel, subject: &str, message: impl Into<String>) {
        if level >= self.level {
            self.entries.push(EventEntry {
                level,
                subject: subject.to_string(),
                message: message.into(),
            });
        }
    }

    pub fn debug(&mut self, subject: &str, message: impl Into<String>) {
        self.push(EventLevel::Debug, subject, message);
    }

    pub fn info(&mut self, subject: &str, message: impl Into<String>) {
        self.push(EventLevel::Info, subject, message);
    }

    pub fn warn(&mut self, subject: &str, message: impl Into<String>) {
        self.push(EventLevel::Warn, subject, message);
    }

    pub fn error(&mut self, subject: &str, message: impl Into<String>) {
        self.push(EventLevel::Error, subject, message);
    }

    pub fn entries(&self) -> &[EventEntry] {
        &self.entries
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|e| e.message.contains(needle))
    }

    /// Stable one-entry-per-line rendering.
    pub fn as_text(&self) -> String {
        let mut out = String::new();
        for e in &self.entries {
            out.push_str(&format!("[{}] {}: {}\n", e.level, e.subject, e.message));
        }
        out
    }
}

impl Default for EventLog {
    fn default() -> EventLog {
        EventLog::new(EventLevel::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_floor_filters() {
        let mut log = EventLog::new(EventLevel::Info);
        log.debug("x", "hidden");
        log.info("x", "shown");
        log.warn("y", "also shown");
        assert_eq!(log.entries().len(), 2);
        assert!(!log.contains("hidden"));
        assert!(log.contains("shown"));
    }

    #[test]
    fn text_rendering_is_stable() {
        let mut log = EventLog::new(EventLevel::Debug);
        log.info("main/claim/web", "context-chosen: prod");
        log.warn("main/claim/api", "no matching context");
        assert_eq!(
            log.as_text(),
            "[info] main/claim/web: context-chosen: prod\n[warn] main/claim/api: no matching context\n"
        );
    }
}
