//! Parser for Claude Code `--output-format stream-json` output
//!
//! One JSON object per line. Assistant text and tool calls become entry
//! lines, tool results become detail for the preceding tool call, and the
//! final `result` object carries usage, cost and the completion signal.
//! Lines that are not JSON pass through unchanged.

use serde::Deserialize;
use serde_json::Value;

use super::{truncate, OutputParser};
use crate::event::OutputEvent;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamMessage {
    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        model: Option<String>,
    },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(default)]
        message: Value,
    },
    #[serde(rename = "user")]
    User {
        #[serde(default)]
        message: Value,
    },
    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default, rename = "result")]
        result_text: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

/// Parser for stream-json lines
#[derive(Debug, Default)]
pub struct ClaudeStreamParser;

impl ClaudeStreamParser {
    pub fn new() -> Self {
        Self
    }
}

impl OutputParser for ClaudeStreamParser {
    fn parse(&mut self, line: &str) -> Vec<OutputEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return vec![];
        }
        if !trimmed.starts_with('{') {
            return vec![OutputEvent::Raw(line.to_string())];
        }

        let msg = match serde_json::from_str::<StreamMessage>(trimmed) {
            Ok(msg) => msg,
            Err(_) => return vec![OutputEvent::Raw(line.to_string())],
        };

        match msg {
            StreamMessage::System { subtype, model } if subtype == "init" => {
                let model = model.unwrap_or_else(|| "unknown".to_string());
                vec![OutputEvent::Message(format!("session started (model: {})", model))]
            }
            StreamMessage::System { .. } | StreamMessage::Unknown => vec![],
            StreamMessage::Assistant { message } => assistant_events(&message),
            StreamMessage::User { message } => tool_result_events(&message),
            StreamMessage::Result {
                subtype,
                is_error,
                total_cost_usd,
                usage,
                result_text,
            } => {
                let usage = usage.unwrap_or_default();
                let success = !is_error && subtype == "success";
                let mut events = vec![OutputEvent::Usage {
                    tokens_in: usage.input_tokens
                        + usage.cache_creation_input_tokens
                        + usage.cache_read_input_tokens,
                    tokens_out: usage.output_tokens,
                    cost: total_cost_usd.unwrap_or(0.0),
                }];
                let summary = result_text.filter(|t| !t.trim().is_empty());
                let headline = if success {
                    "done".to_string()
                } else {
                    format!("failed ({})", subtype)
                };
                events.push(OutputEvent::Message(headline));
                if let Some(text) = &summary {
                    events.push(OutputEvent::Detail(text.clone()));
                }
                events.push(OutputEvent::Completed {
                    success,
                    summary: if success {
                        summary
                    } else {
                        Some(summary.unwrap_or_else(|| format!("agent reported {}", subtype)))
                    },
                });
                events
            }
        }
    }
}

fn assistant_events(message: &Value) -> Vec<OutputEvent> {
    let Some(content) = message["content"].as_array() else {
        return vec![];
    };

    let mut events = Vec::new();
    for block in content {
        match block["type"].as_str().unwrap_or("") {
            "text" => {
                let text = block["text"].as_str().unwrap_or("").trim();
                if text.is_empty() {
                    continue;
                }
                let mut lines = text.lines();
                if let Some(first) = lines.next() {
                    events.push(OutputEvent::Message(first.to_string()));
                }
                let rest: Vec<&str> = lines.collect();
                if !rest.is_empty() {
                    events.push(OutputEvent::Detail(rest.join("\n")));
                }
            }
            "tool_use" => events.push(OutputEvent::Message(tool_summary(block))),
            // thinking blocks are skipped
            _ => {}
        }
    }
    events
}

fn tool_summary(block: &Value) -> String {
    let name = block["name"].as_str().unwrap_or("tool");
    let input = &block["input"];
    let detail = match name {
        "Bash" => input["command"].as_str().unwrap_or(""),
        "Read" | "Write" | "Edit" | "MultiEdit" => input["file_path"].as_str().unwrap_or(""),
        "Glob" | "Grep" => input["pattern"].as_str().unwrap_or(""),
        "WebFetch" => input["url"].as_str().unwrap_or(""),
        "Task" => input["description"].as_str().unwrap_or(""),
        _ => "",
    };
    if detail.is_empty() {
        name.to_string()
    } else {
        format!("{}: {}", name, truncate(detail, 120))
    }
}

fn tool_result_events(message: &Value) -> Vec<OutputEvent> {
    let Some(content) = message["content"].as_array() else {
        return vec![];
    };

    content
        .iter()
        .filter(|block| block["type"].as_str() == Some("tool_result"))
        .filter_map(|block| {
            let text = match &block["content"] {
                Value::String(s) => s.clone(),
                Value::Array(parts) => parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => return None,
            };
            if text.trim().is_empty() {
                None
            } else {
                Some(OutputEvent::Detail(text))
            }
        })
        .collect()
}
