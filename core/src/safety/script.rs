//! Standalone shell rendition of the guard
//!
//! The generated script is handed to the agent runtime as a pre-tool hook.
//! Patterns are interpolated into shell text, so only patterns that cannot
//! break out of their double-quoted argument are embedded; the in-process
//! [`SafetyGuard`](super::SafetyGuard) still evaluates every pattern.

use std::fmt::Write as _;

/// Exit status the script uses for a blocked command
pub const BLOCKED_EXIT_CODE: i32 = 2;

/// Exit status the script uses for an allowed command
pub const ALLOWED_EXIT_CODE: i32 = 0;

const SCRIPT_HEADER: &str = r##"#!/usr/bin/env bash
# agtop safety guard (generated, do not edit)
#
# Usage: safety-guard.sh [command...]
# Without arguments the command is read from the hook JSON on stdin
# (tool_input.command). Exit 2 blocks the command, exit 0 allows it.

if [ "$#" -gt 0 ]; then
  cmd="$*"
else
  input="$(cat)"
  cmd="$(printf '%s' "$input" | sed -n 's/.*"command"[[:space:]]*:[[:space:]]*"\(\([^"\\]\|\\.\)*\)".*/\1/p' | head -n 1)"
fi

if [ -z "$cmd" ]; then
  exit 0
fi

shopt -s nocasematch

block_if_match() {
  if [[ $cmd =~ $1 ]]; then
    printf 'Blocked by agtop safety guard (pattern: %s)\n' "$1" >&2
    exit 2
  fi
}

"##;

/// Whether `pattern` can be embedded verbatim inside a double-quoted shell
/// word without terminating it or triggering substitution.
pub fn is_script_safe(pattern: &str) -> bool {
    if pattern.is_empty()
        || pattern.contains('"')
        || pattern.contains('`')
        || pattern.contains("$(")
        || pattern.contains("]]")
        || pattern.contains('\n')
        || pattern.contains('\r')
    {
        return false;
    }
    !has_bare_semicolon(pattern)
}

/// A `;` not escaped by a preceding backslash
fn has_bare_semicolon(pattern: &str) -> bool {
    let mut escaped = false;
    for c in pattern.chars() {
        match c {
            '\\' => escaped = !escaped,
            ';' if !escaped => return true,
            _ => escaped = false,
        }
    }
    false
}

/// Escape the characters still special inside double quotes
fn quote(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('"');
    for c in pattern.chars() {
        if c == '\\' || c == '$' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Shell ERE has no inline flags; case folding comes from `nocasematch`.
fn strip_inline_flags(pattern: &str) -> &str {
    pattern.strip_prefix("(?i)").unwrap_or(pattern)
}

/// Split patterns into the embeddable subset and the dropped remainder
pub fn partition_patterns<'a, S: AsRef<str>>(patterns: &'a [S]) -> (Vec<&'a str>, Vec<&'a str>) {
    patterns
        .iter()
        .map(|p| p.as_ref())
        .partition(|p| is_script_safe(p))
}

/// Render the guard script for the script-safe subset of `patterns`
pub fn generate_script<S: AsRef<str>>(patterns: &[S]) -> String {
    let (safe, _dropped) = partition_patterns(patterns);

    let mut script = String::from(SCRIPT_HEADER);
    for pattern in safe {
        let _ = writeln!(script, "block_if_match {}", quote(strip_inline_flags(pattern)));
    }
    let _ = writeln!(script, "\nexit {}", ALLOWED_EXIT_CODE);
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::{SafetyGuard, DEFAULT_PATTERNS};

    const HOSTILE: [&str; 6] = [
        r#"rm" ; touch /tmp/pwned ; echo ""#,
        "`reboot`",
        "$(reboot)",
        r"x ]] && reboot && [[ y",
        "ls; reboot",
        "line\nbreak",
    ];

    fn pattern_lines(script: &str) -> Vec<&str> {
        script
            .lines()
            .filter(|l| l.starts_with("block_if_match "))
            .collect()
    }

    #[test]
    fn test_safe_patterns_are_embedded() {
        let script = generate_script(&[r"rm\s+-[rf]+\s+/", r"DROP\s+TABLE"]);
        assert!(script.starts_with("#!/usr/bin/env bash"));
        assert_eq!(
            pattern_lines(&script),
            vec![
                r#"block_if_match "rm\\s+-[rf]+\\s+/""#,
                r#"block_if_match "DROP\\s+TABLE""#,
            ]
        );
        assert!(script.trim_end().ends_with("exit 0"));
    }

    #[test]
    fn test_hostile_patterns_are_dropped() {
        let mut patterns: Vec<&str> = HOSTILE.to_vec();
        patterns.push("git reset --hard");
        let script = generate_script(&patterns);

        let lines = pattern_lines(&script);
        assert_eq!(lines, vec![r#"block_if_match "git reset --hard""#]);
        for hostile in HOSTILE {
            assert!(!script.contains(hostile), "{hostile:?} leaked into script");
        }
        for line in lines {
            let body = &line["block_if_match ".len()..];
            let inner = &body[1..body.len() - 1];
            assert!(!inner.contains('"'));
            assert!(!inner.contains('`'));
            assert!(!inner.contains("$("));
            assert!(!inner.contains("]]"));
            assert!(!inner.contains(';'));
        }
    }

    #[test]
    fn test_dropped_patterns_still_match_in_process() {
        let patterns = [r"ls;\s*reboot", r"rm\s+-rf"];
        let script = generate_script(&patterns);
        assert!(!script.contains("reboot"));

        let (guard, _) = SafetyGuard::compile(patterns);
        assert!(guard.check("ls; reboot").is_blocked());
    }

    #[test]
    fn test_escaped_semicolon_is_not_bare() {
        assert!(is_script_safe(r"foo\;bar"));
        assert!(!is_script_safe(r"foo\\;bar"));
        assert!(!is_script_safe("foo;bar"));
    }

    #[test]
    fn test_dollar_and_backslash_are_escaped() {
        let script = generate_script(&[r"^rm$", r"a\b"]);
        let lines = pattern_lines(&script);
        assert_eq!(lines[0], r#"block_if_match "^rm\$""#);
        assert_eq!(lines[1], r#"block_if_match "a\\b""#);
    }

    #[test]
    fn test_inline_case_flag_stripped() {
        let script = generate_script(&["(?i)drop table"]);
        assert_eq!(pattern_lines(&script), vec![r#"block_if_match "drop table""#]);
    }

    #[test]
    fn test_fork_bomb_default_is_not_embedded() {
        let (safe, dropped) = partition_patterns(DEFAULT_PATTERNS);
        assert_eq!(safe.len() + dropped.len(), DEFAULT_PATTERNS.len());
        assert!(dropped.iter().any(|p| p.contains(':')));
    }

    #[cfg(unix)]
    #[test]
    fn test_script_exit_codes() {
        use std::process::Command;

        if Command::new("bash").arg("--version").output().is_err() {
            return;
        }

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("guard.sh");
        std::fs::write(&path, generate_script(&[r"rm\s+-[rf]+\s+/", r"DROP\s+TABLE"])).unwrap();

        let run = |args: &[&str], stdin: &str| {
            use std::io::Write;
            let mut child = Command::new("bash")
                .arg(&path)
                .args(args)
                .stdin(std::process::Stdio::piped())
                .stderr(std::process::Stdio::null())
                .spawn()
                .unwrap();
            child.stdin.take().unwrap().write_all(stdin.as_bytes()).unwrap();
            child.wait().unwrap().code()
        };

        assert_eq!(run(&["rm -rf /home"], ""), Some(BLOCKED_EXIT_CODE));
        assert_eq!(run(&["ls -la"], ""), Some(ALLOWED_EXIT_CODE));
        assert_eq!(run(&["drop table users"], ""), Some(BLOCKED_EXIT_CODE));

        let hook = r#"{"tool_name":"Bash","tool_input":{"command":"rm -rf /"}}"#;
        assert_eq!(run(&[], hook), Some(BLOCKED_EXIT_CODE));
        let hook = r#"{"tool_name":"Bash","tool_input":{"command":"cargo test"}}"#;
        assert_eq!(run(&[], hook), Some(ALLOWED_EXIT_CODE));
    }
}
