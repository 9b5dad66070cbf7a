//! Display text cleanup for transcript content
//!
//! Claude Code injects markup into user-visible content (system reminders,
//! slash-command envelopes, local command output). These helpers strip it
//! and pull out the slash commands and `@file` references a prompt mentions.

use regex::Regex;
use std::sync::LazyLock;

static INJECTED_MARKUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?s)<system-reminder>.*?</system-reminder>",
        r"|<teammate-message\b[^>]*>.*?</teammate-message>",
        r"|<local-command-caveat>.*?</local-command-caveat>",
        r"|<command-name>.*?</command-name>",
        r"|<command-message>.*?</command-message>",
        r"|<command-args>.*?</command-args>",
        r"|<local-command-stdout>.*?</local-command-stdout>",
    ))
    .unwrap()
});

static EXCESS_NEWLINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

static SLASH_COMMAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s|<command-name>)(/[a-zA-Z][\w-]*)").unwrap());

static FILE_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@((?:/|\.\.?/)[^\s,;]+|[a-zA-Z][\w./\\-]+\.\w+)").unwrap()
});

/// Remove injected markup and collapse the blank runs it leaves behind.
pub fn sanitize(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let stripped = INJECTED_MARKUP.replace_all(text, "");
    let collapsed = EXCESS_NEWLINES.replace_all(&stripped, "\n\n");
    collapsed.trim().to_string()
}

/// Slash commands mentioned in a prompt, e.g. `/compact`, including the
/// one named by a `<command-name>` envelope.
pub fn slash_commands(text: &str) -> Vec<String> {
    SLASH_COMMAND
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// `@`-mentioned file paths in a prompt, without the `@`.
pub fn file_references(text: &str) -> Vec<String> {
    FILE_REFERENCE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Collapse a tool result payload (string or list of text blocks) to text.
pub fn flatten_result_content(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) => Some(s.as_str()),
                other => other.get("text").and_then(|t| t.as_str()),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
