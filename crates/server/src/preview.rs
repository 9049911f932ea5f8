//! One-line previews for tool invocations
//!
//! Tool inputs are opaque; these helpers only pick out the common fields
//! renderers like to show next to a tool name.

use serde_json::Value;

const COMMAND_PREVIEW_CHARS: usize = 60;
const PROMPT_PREVIEW_CHARS: usize = 50;

/// Create a human-readable summary for a tool call.
pub fn tool_summary(tool_name: &str, input: &Value) -> String {
    let str_field = |key: &str| input.get(key).and_then(Value::as_str);

    match tool_name.to_lowercase().as_str() {
        "read" | "write" | "notebookedit" => {
            if let Some(path) = str_field("file_path").or_else(|| str_field("notebook_path")) {
                return shorten_path(path);
            }
        }
        "edit" | "multiedit" => {
            if let Some(path) = str_field("file_path") {
                return shorten_path(path);
            }
            if let Some(patch) = str_field("patch") {
                for line in patch.lines() {
                    if let Some(path) = line
                        .strip_prefix("*** Add File:")
                        .or_else(|| line.strip_prefix("*** Update File:"))
                    {
                        return shorten_path(path.trim());
                    }
                }
            }
        }
        "bash" => {
            let command = input
                .get("command")
                .or_else(|| input.get("cmd"))
                .and_then(|c| match c {
                    Value::String(s) => Some(s.clone()),
                    Value::Array(parts) => Some(
                        parts
                            .iter()
                            .filter_map(Value::as_str)
                            .collect::<Vec<_>>()
                            .join(" "),
                    ),
                    _ => None,
                });
            if let Some(cmd) = command {
                return truncate(&cmd, COMMAND_PREVIEW_CHARS).replace('\n', " ");
            }
        }
        "glob" => {
            if let Some(pattern) = str_field("pattern") {
                return pattern.to_string();
            }
        }
        "grep" => {
            if let Some(pattern) = str_field("pattern") {
                return format!("Pattern: {}", pattern);
            }
        }
        "task" => {
            if let Some(text) = str_field("description").or_else(|| str_field("prompt")) {
                return truncate(text, PROMPT_PREVIEW_CHARS);
            }
        }
        "webfetch" => {
            if let Some(url) = str_field("url") {
                return url.to_string();
            }
        }
        _ => {}
    }

    tool_name.to_string()
}

/// Shorten a file path for display (show last 2 components with .../prefix).
pub fn shorten_path(path: &str) -> String {
    let components: Vec<&str> = path.split('/').collect();
    if components.len() > 3 {
        format!(".../{}", components[components.len() - 2..].join("/"))
    } else {
        path.to_string()
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shorten_path() {
        assert_eq!(shorten_path("/a/b/c/d/e.rs"), ".../d/e.rs");
        assert_eq!(shorten_path("a/b/c"), "a/b/c");
        assert_eq!(shorten_path("file.rs"), "file.rs");
    }

    #[test]
    fn test_summary_read() {
        let input = json!({"file_path": "/Users/me/project/src/main.rs"});
        assert_eq!(tool_summary("Read", &input), ".../src/main.rs");
    }

    #[test]
    fn test_summary_bash_truncates_on_char_boundary() {
        let input = json!({"command": "echo hello"});
        assert_eq!(tool_summary("Bash", &input), "echo hello");

        let long = "é".repeat(70);
        let summary = tool_summary("Bash", &json!({ "command": long }));
        assert_eq!(summary.chars().count(), COMMAND_PREVIEW_CHARS + 3);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn test_summary_edit_patch() {
        let input = json!({"patch": "*** Begin Patch\n*** Update File: /repo/src/lib/mod.rs\n"});
        assert_eq!(tool_summary("Edit", &input), ".../lib/mod.rs");
    }

    #[test]
    fn test_summary_grep_and_task() {
        assert_eq!(
            tool_summary("Grep", &json!({"pattern": "fn main"})),
            "Pattern: fn main"
        );
        assert_eq!(
            tool_summary("Task", &json!({"description": "Explore auth flow"})),
            "Explore auth flow"
        );
    }

    #[test]
    fn test_summary_falls_back_to_tool_name() {
        assert_eq!(tool_summary("Unknown", &Value::Null), "Unknown");
        assert_eq!(tool_summary("Read", &json!({})), "Read");
    }
}
