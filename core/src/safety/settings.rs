//! Hook and permission settings consumed by the agent runtimes
//!
//! Only the parts agtop writes are typed; everything else in a user's
//! settings file rides along in `extra` so a merge never drops it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Hook event that fires before a tool runs
pub const PRE_TOOL_USE: &str = "PreToolUse";

/// `.claude/settings.json`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClaudeSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<ClaudePermissions>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: BTreeMap<String, Vec<HookMatcher>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClaudePermissions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HookMatcher {
    #[serde(default)]
    pub matcher: String,
    #[serde(default)]
    pub hooks: Vec<HookCommand>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookCommand {
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl HookCommand {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            kind: "command".to_string(),
            command: command.into(),
            timeout: None,
        }
    }
}

/// Settings that route every Bash tool call through the guard script
pub fn generate_settings(script_command: &str) -> ClaudeSettings {
    let mut hooks = BTreeMap::new();
    hooks.insert(
        PRE_TOOL_USE.to_string(),
        vec![HookMatcher {
            matcher: "Bash".to_string(),
            hooks: vec![HookCommand::command(script_command)],
        }],
    );

    ClaudeSettings {
        permissions: None,
        hooks,
        extra: Map::new(),
    }
}

/// Merge `ours` into `existing`.
///
/// Hook commands are deduplicated by command string within a matcher, and
/// permission rules by value, so merging twice is the same as merging once.
pub fn merge_settings(mut existing: ClaudeSettings, ours: &ClaudeSettings) -> ClaudeSettings {
    for (event, matchers) in &ours.hooks {
        let slot = existing.hooks.entry(event.clone()).or_default();
        for matcher in matchers {
            match slot.iter_mut().find(|m| m.matcher == matcher.matcher) {
                Some(current) => {
                    for hook in &matcher.hooks {
                        if !current.hooks.iter().any(|h| h.command == hook.command) {
                            current.hooks.push(hook.clone());
                        }
                    }
                }
                None => slot.push(matcher.clone()),
            }
        }
    }

    if let Some(perms) = &ours.permissions {
        let current = existing.permissions.get_or_insert_with(Default::default);
        for rule in &perms.allow {
            if !current.allow.contains(rule) {
                current.allow.push(rule.clone());
            }
        }
        for rule in &perms.deny {
            if !current.deny.contains(rule) {
                current.deny.push(rule.clone());
            }
        }
    }

    existing
}

/// `opencode.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenCodeSettings {
    #[serde(rename = "$schema")]
    pub schema: String,
    pub permission: OpenCodePermission,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenCodePermission {
    pub edit: String,
    /// Command glob to `allow` / `ask` / `deny`
    pub bash: BTreeMap<String, String>,
    pub webfetch: String,
}

/// Command globs OpenCode refuses outright. OpenCode matches bash
/// permissions by glob, not regex, so these mirror the default patterns.
const OPENCODE_DENY_GLOBS: [&str; 8] = [
    "rm -rf /*",
    "rm -rf ~*",
    "git push --force*",
    "git push -f*",
    "git reset --hard*",
    "mkfs*",
    "dd *of=/dev/*",
    "chmod -R 777 /*",
];

pub fn generate_opencode_settings() -> OpenCodeSettings {
    let mut bash = BTreeMap::new();
    bash.insert("*".to_string(), "allow".to_string());
    for glob in OPENCODE_DENY_GLOBS {
        bash.insert(glob.to_string(), "deny".to_string());
    }

    OpenCodeSettings {
        schema: "https://opencode.ai/config.json".to_string(),
        permission: OpenCodePermission {
            edit: "allow".to_string(),
            bash,
            webfetch: "allow".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_settings_shape() {
        let settings = generate_settings(".agtop/hooks/safety-guard.sh");
        let value = serde_json::to_value(&settings).unwrap();
        assert_eq!(
            value,
            json!({
                "hooks": {
                    "PreToolUse": [{
                        "matcher": "Bash",
                        "hooks": [{"type": "command", "command": ".agtop/hooks/safety-guard.sh"}]
                    }]
                }
            })
        );
    }

    #[test]
    fn test_merge_preserves_unknown_keys() {
        let existing: ClaudeSettings = serde_json::from_value(json!({
            "model": "opus",
            "permissions": {"allow": ["Bash(npm test)"], "defaultMode": "acceptEdits"},
            "hooks": {
                "PostToolUse": [{"matcher": "Edit", "hooks": [{"type": "command", "command": "fmt.sh"}]}]
            }
        }))
        .unwrap();

        let merged = merge_settings(existing, &generate_settings("guard.sh"));
        let value = serde_json::to_value(&merged).unwrap();

        assert_eq!(value["model"], "opus");
        assert_eq!(value["permissions"]["defaultMode"], "acceptEdits");
        assert_eq!(value["permissions"]["allow"][0], "Bash(npm test)");
        assert_eq!(value["hooks"]["PostToolUse"][0]["hooks"][0]["command"], "fmt.sh");
        assert_eq!(value["hooks"]["PreToolUse"][0]["hooks"][0]["command"], "guard.sh");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let ours = generate_settings("guard.sh");
        let once = merge_settings(ClaudeSettings::default(), &ours);
        let twice = merge_settings(once.clone(), &ours);
        assert_eq!(once, twice);
        assert_eq!(twice.hooks[PRE_TOOL_USE][0].hooks.len(), 1);
    }

    #[test]
    fn test_merge_appends_to_existing_matcher() {
        let existing = generate_settings("other-guard.sh");
        let merged = merge_settings(existing, &generate_settings("guard.sh"));
        let commands: Vec<_> = merged.hooks[PRE_TOOL_USE][0]
            .hooks
            .iter()
            .map(|h| h.command.as_str())
            .collect();
        assert_eq!(commands, vec!["other-guard.sh", "guard.sh"]);
    }

    #[test]
    fn test_opencode_settings() {
        let settings = generate_opencode_settings();
        let value = serde_json::to_value(&settings).unwrap();
        assert_eq!(value["$schema"], "https://opencode.ai/config.json");
        assert_eq!(value["permission"]["bash"]["*"], "allow");
        assert_eq!(value["permission"]["bash"]["git reset --hard*"], "deny");
    }
}
