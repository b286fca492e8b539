use serde_json::Value;

use super::{truncate, OutputParser};
use crate::event::OutputEvent;

/// Parser for `opencode run --format json` output
pub struct OpenCodeParser;

impl OpenCodeParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OpenCodeParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputParser for OpenCodeParser {
    fn parse(&mut self, line: &str) -> Vec<OutputEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return vec![];
        }

        // Anything that is not a JSON object is human-readable output
        let event: Value = match serde_json::from_str(trimmed) {
            Ok(v @ Value::Object(_)) => v,
            _ => return vec![OutputEvent::Raw(line.to_string())],
        };
        let part = &event["part"];

        match event["type"].as_str().unwrap_or("") {
            "text" => {
                let text = part["text"].as_str().unwrap_or("").trim();
                let mut lines = text.lines();
                let mut events = Vec::new();
                if let Some(first) = lines.next() {
                    events.push(OutputEvent::Message(first.to_string()));
                }
                let rest: Vec<&str> = lines.collect();
                if !rest.is_empty() {
                    events.push(OutputEvent::Detail(rest.join("\n")));
                }
                events
            }
            "tool_use" => {
                let tool = part["tool"].as_str().unwrap_or("tool");
                let state = &part["state"];
                let input = &state["input"];
                let target = input["command"]
                    .as_str()
                    .or_else(|| input["filePath"].as_str())
                    .or_else(|| input["pattern"].as_str())
                    .or_else(|| state["title"].as_str())
                    .unwrap_or("");
                let mut events = vec![OutputEvent::Message(if target.is_empty() {
                    tool.to_string()
                } else {
                    format!("{}: {}", tool, truncate(target, 120))
                })];
                if let Some(output) = state["output"].as_str().filter(|o| !o.trim().is_empty()) {
                    events.push(OutputEvent::Detail(output.to_string()));
                }
                events
            }
            "step_finish" => {
                let tokens = &part["tokens"];
                let tokens_in = tokens["input"].as_u64().unwrap_or(0)
                    + tokens["cache"]["read"].as_u64().unwrap_or(0)
                    + tokens["cache"]["write"].as_u64().unwrap_or(0);
                let tokens_out =
                    tokens["output"].as_u64().unwrap_or(0) + tokens["reasoning"].as_u64().unwrap_or(0);
                let mut events = vec![OutputEvent::Usage {
                    tokens_in,
                    tokens_out,
                    cost: part["cost"].as_f64().unwrap_or(0.0),
                }];
                if part["reason"].as_str() == Some("stop") {
                    events.push(OutputEvent::Completed {
                        success: true,
                        summary: None,
                    });
                }
                events
            }
            "error" => {
                let error = &event["error"];
                let message = error["data"]["message"]
                    .as_str()
                    .or_else(|| error["message"].as_str())
                    .or_else(|| error["name"].as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                vec![
                    OutputEvent::Message(format!("error: {}", message)),
                    OutputEvent::Completed {
                        success: false,
                        summary: Some(message),
                    },
                ]
            }
            _ => vec![],
        }
    }
}
