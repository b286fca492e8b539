//! Output parsers for different agent runtimes

use agtop_core::run::AgentRuntime;

use crate::event::OutputEvent;

pub mod claude;
pub mod opencode;

pub use claude::ClaudeStreamParser;
pub use opencode::OpenCodeParser;

/// Trait for parsing agent stdout
pub trait OutputParser: Send {
    /// Turn one line of output into zero or more events, in order
    fn parse(&mut self, line: &str) -> Vec<OutputEvent>;
}

/// Create a parser for the given runtime
pub fn create_parser(runtime: &AgentRuntime) -> Box<dyn OutputParser> {
    match runtime {
        AgentRuntime::ClaudeCode => Box::new(ClaudeStreamParser::new()),
        AgentRuntime::OpenCode => Box::new(OpenCodeParser::new()),
        AgentRuntime::Custom { .. } => Box::new(PlainParser),
    }
}

/// Passes every line through untouched
pub struct PlainParser;

impl OutputParser for PlainParser {
    fn parse(&mut self, line: &str) -> Vec<OutputEvent> {
        vec![OutputEvent::Raw(line.to_string())]
    }
}

/// Shorten `s` to at most `max` characters, marking the cut with `...`
pub(crate) fn truncate(s: &str, max: usize) -> String {
    let single_line = s.lines().next().unwrap_or("");
    if single_line.chars().count() <= max && single_line.len() == s.trim_end().len() {
        return single_line.to_string();
    }
    let cut: String = single_line.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut)
}
