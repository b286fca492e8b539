use std::collections::VecDeque;
use std::sync::{LazyLock, Mutex};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::lock;

/// `[HH:MM:SS skill] message`
static ENTRY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(\d{2}:\d{2}:\d{2}) ([^\]]+)\] ?(.*)$").expect("entry line pattern")
});

/// One structured unit of subprocess output
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogEntry {
    /// `HH:MM:SS`, empty for unstructured lines
    pub timestamp: String,
    pub skill: String,
    pub summary: String,
    /// Supplementary multi-line content, e.g. full tool output
    pub detail: String,
}

impl LogEntry {
    pub fn new(
        timestamp: impl Into<String>,
        skill: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: timestamp.into(),
            skill: skill.into(),
            summary: summary.into(),
            detail: String::new(),
        }
    }

    pub fn is_structured(&self) -> bool {
        !self.timestamp.is_empty()
    }
}

/// Parse a display line. Lines that do not have the
/// `[HH:MM:SS skill] message` shape keep the raw text as the summary.
pub fn parse_line(line: &str) -> LogEntry {
    match ENTRY_LINE.captures(line) {
        Some(caps) => LogEntry::new(&caps[1], caps[2].trim(), &caps[3]),
        None => LogEntry::new("", "", line),
    }
}

/// Fixed-capacity store of parsed entries.
///
/// `total_evicted` only grows, so a consumer holding an index can rebase it
/// by subtracting the growth since it last looked.
#[derive(Debug)]
pub struct EntryBuffer {
    capacity: usize,
    inner: Mutex<Entries>,
}

#[derive(Debug, Default)]
struct Entries {
    entries: VecDeque<LogEntry>,
    total_evicted: u64,
}

impl EntryBuffer {
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Entries {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                total_evicted: 0,
            }),
        }
    }

    pub fn append(&self, entry: LogEntry) {
        let mut inner = lock(&self.inner);
        push_bounded(&mut inner, entry, self.capacity);
    }

    /// Parse and append a raw display line
    pub fn append_line(&self, line: &str) {
        self.append(parse_line(line));
    }

    /// Attach supplementary text to the newest entry.
    ///
    /// With no entry yet, the detail starts an unstructured one.
    pub fn append_detail(&self, text: &str) {
        let mut inner = lock(&self.inner);
        match inner.entries.back_mut() {
            Some(entry) => {
                if !entry.detail.is_empty() {
                    entry.detail.push('\n');
                }
                entry.detail.push_str(text);
            }
            None => {
                let mut entry = LogEntry::default();
                entry.detail.push_str(text);
                push_bounded(&mut inner, entry, self.capacity);
            }
        }
    }

    /// Snapshot, oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.inner).entries.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<LogEntry> {
        lock(&self.inner).entries.back().cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_evicted(&self) -> u64 {
        lock(&self.inner).total_evicted
    }
}

fn push_bounded(inner: &mut Entries, entry: LogEntry, capacity: usize) {
    if inner.entries.len() == capacity {
        inner.entries.pop_front();
        inner.total_evicted += 1;
    }
    inner.entries.push_back(entry);
}
