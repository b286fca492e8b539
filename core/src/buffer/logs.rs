use chrono::Local;

use super::entry::{EntryBuffer, LogEntry};
use super::ring::RingBuffer;
use crate::notify::ChangeNotifier;

/// The two log views of one run, fed from a single append stream.
///
/// Every display line lands in both buffers so they never disagree about
/// what the run printed; detail text only exists on entries.
#[derive(Debug)]
pub struct RunLogs {
    lines: RingBuffer,
    entries: EntryBuffer,
    notifier: ChangeNotifier,
}

impl RunLogs {
    pub fn new(line_capacity: usize, entry_capacity: usize, notifier: ChangeNotifier) -> Self {
        Self {
            lines: RingBuffer::new(line_capacity),
            entries: EntryBuffer::new(entry_capacity),
            notifier,
        }
    }

    /// Append one display line to both views
    pub fn push_line(&self, line: &str) {
        self.lines.append(line);
        self.entries.append_line(line);
        self.notifier.notify();
    }

    /// Attach detail text to the newest entry
    pub fn push_detail(&self, text: &str) {
        self.entries.append_detail(text);
        self.notifier.notify();
    }

    /// Append a line stamped with the local time and the given skill
    pub fn push_event(&self, skill: &str, message: &str) {
        let line = format_line(&Local::now().format("%H:%M:%S").to_string(), skill, message);
        self.push_line(&line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lines()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.entries()
    }

    pub fn total_evicted(&self) -> u64 {
        self.entries.total_evicted()
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.lines
    }

    pub fn entry_buffer(&self) -> &EntryBuffer {
        &self.entries
    }
}

/// Render `[HH:MM:SS skill] message`
pub fn format_line(timestamp: &str, skill: &str, message: &str) -> String {
    let skill = if skill.is_empty() { "agent" } else { skill };
    format!("[{} {}] {}", timestamp, skill, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_views_stay_consistent() {
        let logs = RunLogs::new(3, 3, ChangeNotifier::new());
        for i in 0..5 {
            logs.push_line(&format!("[12:00:0{} plan] step {}", i, i));
        }

        let lines = logs.lines();
        let entries = logs.entries();
        assert_eq!(lines.len(), entries.len());
        for (line, entry) in lines.iter().zip(entries.iter()) {
            assert!(line.ends_with(&entry.summary));
        }
        assert_eq!(logs.total_evicted(), 2);
    }

    #[test]
    fn test_push_event_is_structured() {
        let logs = RunLogs::new(10, 10, ChangeNotifier::new());
        logs.push_event("review", "Looking at diff");
        let entry = &logs.entries()[0];
        assert!(entry.is_structured());
        assert_eq!(entry.skill, "review");
        assert_eq!(entry.summary, "Looking at diff");
    }

    #[test]
    fn test_push_notifies() {
        let notifier = ChangeNotifier::new();
        let logs = RunLogs::new(10, 10, notifier.clone());
        logs.push_line("hello");
        logs.push_detail("more");
        assert_eq!(notifier.generation(), 2);
    }

    #[test]
    fn test_format_line_defaults_skill() {
        assert_eq!(format_line("01:02:03", "", "hi"), "[01:02:03 agent] hi");
    }
}
