//! Message classification for Claude Code transcript records
//!
//! [`classify`] is a pure function from a [`RawRecord`] to a typed
//! [`Message`], or a skip for bookkeeping records with nothing to display.
//!
//! ## Record format
//!
//! ```json
//! {"type":"assistant","uuid":"...","timestamp":"2025-11-25T10:00:00Z",
//!  "message":{"role":"assistant","model":"claude-sonnet-4-5",
//!             "content":[{"type":"tool_use","id":"t1","name":"Read","input":{}}],
//!             "usage":{"input_tokens":10,"output_tokens":5}}}
//! ```
//!
//! Keyed on `type`:
//! - `user`: prompt, or tool results / meta input when flagged so
//! - `assistant`: model output
//! - `system` with `subtype: compact_boundary`: compaction boundary
//! - `summary`, `file-history-snapshot`, `queue-operation`: skipped
//! - anything else: a generic system message that keeps its discriminant

use super::stream::RawRecord;
use crate::content::flatten_result_content;
use crate::pricing;
use crate::types::{Message, MessageKind, Role, TokenUsage, ToolCall, ToolResult};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Record kinds that never carry displayable content.
const BOOKKEEPING_KINDS: &[&str] = &["summary", "file-history-snapshot", "queue-operation"];

/// Outcome of classifying one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Message(Box<Message>),
    Skip(SkipReason),
}

impl Classification {
    pub fn into_message(self) -> Option<Message> {
        match self {
            Classification::Message(m) => Some(*m),
            Classification::Skip(_) => None,
        }
    }
}

/// Why a record produced no message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Internal bookkeeping (summaries, snapshots, queue operations)
    Bookkeeping,
    /// A user/assistant record with nothing in it
    Empty,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Bookkeeping => "bookkeeping",
            SkipReason::Empty => "empty",
        }
    }
}

// ============================================
// Raw record shape
// ============================================

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawEntry {
    uuid: Option<String>,
    subtype: Option<String>,
    timestamp: Option<String>,
    is_meta: Option<bool>,
    is_sidechain: Option<bool>,
    message: Option<RawMessage>,
    /// System records carry their text at the top level
    content: Option<String>,
    compact_metadata: Option<RawCompactMetadata>,
    tokens_freed: Option<u64>,
    #[serde(rename = "costUSD")]
    cost_usd: Option<f64>,
    duration_ms: Option<f64>,
    tool_use_result: Option<serde_json::Value>,
    #[serde(rename = "parentToolUseID")]
    parent_tool_use_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawMessage {
    model: Option<String>,
    content: Option<RawContent>,
    usage: Option<RawUsage>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    // Images and anything newer carry nothing we display as text
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawCompactMetadata {
    pre_tokens: Option<u64>,
    post_tokens: Option<u64>,
    tokens_freed: Option<u64>,
}

/// Flattened view of `message.content`.
#[derive(Default)]
struct Extracted {
    text: Vec<String>,
    thinking: Vec<String>,
    calls: Vec<ToolCall>,
    results: Vec<ToolResult>,
}

// ============================================
// Classification
// ============================================

/// Classify one raw record. Deterministic and side-effect free.
pub fn classify(record: &RawRecord) -> Classification {
    let kind = record.kind.as_deref();

    // Compact summaries may arrive as `summary` records, so check before the skip list
    let compact_summary = record
        .payload
        .get("isCompactSummary")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if !compact_summary && kind.is_some_and(|k| BOOKKEEPING_KINDS.contains(&k)) {
        return Classification::Skip(SkipReason::Bookkeeping);
    }

    let entry = match RawEntry::deserialize(&record.payload) {
        Ok(entry) => entry,
        Err(e) => {
            return Classification::Message(Box::new(anomaly(
                record,
                kind,
                format!("unreadable {} record: {}", kind.unwrap_or("untyped"), e),
            )))
        }
    };

    let message = match kind {
        _ if compact_summary => compaction_summary(record, &entry),
        Some("user") => match user_message(record, &entry) {
            Some(m) => m,
            None => return Classification::Skip(SkipReason::Empty),
        },
        Some("assistant") => match assistant_message(record, &entry) {
            Some(m) => m,
            None => return Classification::Skip(SkipReason::Empty),
        },
        Some("system") if entry.subtype.as_deref() == Some("compact_boundary") => {
            compaction_boundary(record, &entry)
        }
        Some("system") => system_message(record, &entry),
        other => anomaly(
            record,
            other,
            entry_text(&entry).unwrap_or_else(|| format!("{} record", other.unwrap_or("untyped"))),
        ),
    };

    Classification::Message(Box::new(message))
}

fn base_message(record: &RawRecord, entry: &RawEntry, kind: MessageKind, role: Role) -> Message {
    Message {
        id: entry
            .uuid
            .clone()
            .unwrap_or_else(|| Message::line_id(record.span)),
        kind,
        role,
        timestamp: entry.timestamp.as_deref().and_then(parse_timestamp),
        content: String::new(),
        thinking: None,
        model: None,
        usage: TokenUsage::default(),
        cost_usd: entry.cost_usd.unwrap_or(0.0),
        duration_ms: entry.duration_ms.map(|d| d.max(0.0) as u64).unwrap_or(0),
        tool_calls: Vec::new(),
        tool_results: Vec::new(),
        parent_tool_use_id: entry.parent_tool_use_id.clone(),
        is_sidechain: entry.is_sidechain.unwrap_or(false),
        stop_reason: None,
        discriminant: None,
        tokens_freed: None,
        is_compact_summary: false,
        span: record.span,
    }
}

fn user_message(record: &RawRecord, entry: &RawEntry) -> Option<Message> {
    let extracted = extract(entry, agent_id(entry));
    let only_results = !extracted.results.is_empty() && extracted.text.is_empty();
    let kind = if only_results || entry.is_meta.unwrap_or(false) {
        MessageKind::ToolResult
    } else {
        MessageKind::User
    };

    if extracted.text.is_empty() && extracted.results.is_empty() {
        return None;
    }

    let mut message = base_message(record, entry, kind, Role::User);
    message.content = extracted.text.join("\n");
    message.tool_results = extracted.results;
    Some(message)
}

fn assistant_message(record: &RawRecord, entry: &RawEntry) -> Option<Message> {
    let raw = entry.message.as_ref();
    let extracted = extract(entry, None);
    let usage = raw.and_then(|m| m.usage.as_ref()).map(to_usage).unwrap_or_default();
    let model = raw.and_then(|m| m.model.clone());
    let stop_reason = raw.and_then(|m| m.stop_reason.clone());

    if extracted.text.is_empty()
        && extracted.thinking.is_empty()
        && extracted.calls.is_empty()
        && usage.is_zero()
        && stop_reason.is_none()
    {
        return None;
    }

    let mut message = base_message(record, entry, MessageKind::Assistant, Role::Assistant);
    message.content = extracted.text.join("\n\n");
    if !extracted.thinking.is_empty() {
        message.thinking = Some(extracted.thinking.join("\n\n"));
    }
    message.tool_calls = extracted.calls;
    message.usage = usage;
    if entry.cost_usd.is_none() {
        message.cost_usd = model
            .as_deref()
            .map(|m| pricing::estimate_cost(m, &usage))
            .unwrap_or(0.0);
    }
    message.model = model;
    message.stop_reason = stop_reason;
    Some(message)
}

fn compaction_boundary(record: &RawRecord, entry: &RawEntry) -> Message {
    let meta = entry.compact_metadata.as_ref();
    let tokens_freed = meta
        .and_then(|m| {
            m.tokens_freed.or_else(|| {
                m.pre_tokens
                    .map(|pre| pre.saturating_sub(m.post_tokens.unwrap_or(0)))
            })
        })
        .or(entry.tokens_freed)
        .unwrap_or(0);

    let mut message = base_message(record, entry, MessageKind::Compaction, Role::System);
    message.content = entry.content.clone().unwrap_or_default();
    message.discriminant = entry.subtype.clone();
    message.tokens_freed = Some(tokens_freed);
    message
}

fn compaction_summary(record: &RawRecord, entry: &RawEntry) -> Message {
    let text = entry_text(entry).unwrap_or_default();
    let mut message = base_message(record, entry, MessageKind::Compaction, Role::User);
    message.content = text;
    message.is_compact_summary = true;
    message
}

fn system_message(record: &RawRecord, entry: &RawEntry) -> Message {
    let mut message = base_message(record, entry, MessageKind::System, Role::System);
    message.content = entry_text(entry).unwrap_or_default();
    message.discriminant = entry.subtype.clone();
    message
}

/// Degrade an unknown or unreadable record to a generic system message.
fn anomaly(record: &RawRecord, kind: Option<&str>, content: String) -> Message {
    tracing::debug!(
        span = %record.span,
        kind = kind.unwrap_or("untyped"),
        "Unrecognized record kind, keeping as system event"
    );
    let id = record
        .payload
        .get("uuid")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Message::line_id(record.span));
    let timestamp = record
        .payload
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(parse_timestamp);

    Message {
        id,
        kind: MessageKind::System,
        role: Role::System,
        timestamp,
        content,
        thinking: None,
        model: None,
        usage: TokenUsage::default(),
        cost_usd: 0.0,
        duration_ms: 0,
        tool_calls: Vec::new(),
        tool_results: Vec::new(),
        parent_tool_use_id: None,
        is_sidechain: false,
        stop_reason: None,
        discriminant: Some(kind.unwrap_or("untyped").to_string()),
        tokens_freed: None,
        is_compact_summary: false,
        span: record.span,
    }
}

// ============================================
// Helpers
// ============================================

fn extract(entry: &RawEntry, agent_id: Option<String>) -> Extracted {
    let mut out = Extracted::default();
    let Some(content) = entry.message.as_ref().and_then(|m| m.content.as_ref()) else {
        return out;
    };

    match content {
        RawContent::Text(text) => {
            if !text.trim().is_empty() {
                out.text.push(text.clone());
            }
        }
        RawContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } if !text.trim().is_empty() => {
                        out.text.push(text.clone());
                    }
                    ContentBlock::Thinking { thinking } if !thinking.trim().is_empty() => {
                        out.thinking.push(thinking.clone());
                    }
                    ContentBlock::ToolUse { id, name, input } => out.calls.push(ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    }),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => out.results.push(ToolResult {
                        call_id: tool_use_id.clone(),
                        content: flatten_result_content(content),
                        is_error: is_error.unwrap_or(false),
                        agent_id: agent_id.clone(),
                    }),
                    _ => {}
                }
            }
        }
    }
    out
}

/// Text of a record: `message.content` text blocks, else top-level `content`.
fn entry_text(entry: &RawEntry) -> Option<String> {
    let extracted = extract(entry, None);
    if !extracted.text.is_empty() {
        return Some(extracted.text.join("\n"));
    }
    entry.content.clone()
}

/// `toolUseResult.agentId`, reported when a subagent finishes.
fn agent_id(entry: &RawEntry) -> Option<String> {
    entry
        .tool_use_result
        .as_ref()
        .and_then(|r| r.get("agentId"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn to_usage(raw: &RawUsage) -> TokenUsage {
    TokenUsage {
        input: raw.input_tokens.unwrap_or(0),
        output: raw.output_tokens.unwrap_or(0),
        cache_read: raw.cache_read_input_tokens.unwrap_or(0),
        cache_creation: raw.cache_creation_input_tokens.unwrap_or(0),
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ByteSpan;
    use serde_json::json;

    fn record(payload: serde_json::Value, start: u64) -> RawRecord {
        let len = payload.to_string().len() as u64 + 1;
        RawRecord {
            kind: payload
                .get("type")
                .and_then(|v| v.as_str())
                .map(String::from),
            payload,
            span: ByteSpan::new(start, start + len),
        }
    }

    fn message(payload: serde_json::Value) -> Message {
        classify(&record(payload, 0))
            .into_message()
            .expect("expected a message")
    }

    #[test]
    fn test_user_prompt() {
        let m = message(json!({
            "type": "user",
            "uuid": "u1",
            "timestamp": "2025-11-25T10:00:00Z",
            "message": {"role": "user", "content": "hi"}
        }));
        assert_eq!(m.kind, MessageKind::User);
        assert_eq!(m.id, "u1");
        assert_eq!(m.content, "hi");
        assert!(m.timestamp.is_some());
        assert_eq!(m.usage, TokenUsage::default());
        assert_eq!(m.cost_usd, 0.0);
    }

    #[test]
    fn test_assistant_with_tool_call_and_usage() {
        let m = message(json!({
            "type": "assistant",
            "uuid": "a1",
            "message": {
                "role": "assistant",
                "model": "claude-sonnet-4-5-20250929",
                "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "Reading"},
                    {"type": "tool_use", "id": "t1", "name": "Read", "input": {"file_path": "a.rs"}}
                ],
                "usage": {"input_tokens": 1000, "output_tokens": 100, "cache_read_input_tokens": 50},
                "stop_reason": "tool_use"
            }
        }));
        assert_eq!(m.kind, MessageKind::Assistant);
        assert_eq!(m.content, "Reading");
        assert_eq!(m.thinking.as_deref(), Some("hmm"));
        assert_eq!(m.tool_calls.len(), 1);
        assert_eq!(m.tool_calls[0].id, "t1");
        assert_eq!(m.usage.input, 1000);
        assert_eq!(m.usage.cache_read, 50);
        assert_eq!(m.usage.cache_creation, 0);
        assert!(m.cost_usd > 0.0);
        assert_eq!(m.stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn test_declared_cost_wins() {
        let m = message(json!({
            "type": "assistant",
            "costUSD": 0.25,
            "durationMs": 1200,
            "message": {"model": "claude-opus-4-6", "content": "done",
                        "usage": {"input_tokens": 10, "output_tokens": 10}}
        }));
        assert_eq!(m.cost_usd, 0.25);
        assert_eq!(m.duration_ms, 1200);
    }

    #[test]
    fn test_tool_result_record() {
        let m = message(json!({
            "type": "user",
            "uuid": "r1",
            "parentToolUseID": "task-1",
            "toolUseResult": {"agentId": "a4767a09"},
            "message": {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t1",
                 "content": [{"type": "text", "text": "file body"}], "is_error": true}
            ]}
        }));
        assert_eq!(m.kind, MessageKind::ToolResult);
        assert_eq!(m.tool_results.len(), 1);
        let r = &m.tool_results[0];
        assert_eq!(r.call_id, "t1");
        assert_eq!(r.content, "file body");
        assert!(r.is_error);
        assert_eq!(r.agent_id.as_deref(), Some("a4767a09"));
        assert_eq!(m.parent_tool_use_id.as_deref(), Some("task-1"));
    }

    #[test]
    fn test_meta_user_is_tool_result_kind() {
        let m = message(json!({
            "type": "user", "isMeta": true,
            "message": {"role": "user", "content": "Caveat: local command output"}
        }));
        assert_eq!(m.kind, MessageKind::ToolResult);
    }

    #[test]
    fn test_compaction_boundary_tokens() {
        let m = message(json!({
            "type": "system", "subtype": "compact_boundary", "uuid": "c1",
            "content": "Conversation compacted",
            "compactMetadata": {"trigger": "auto", "preTokens": 155000, "postTokens": 5000}
        }));
        assert_eq!(m.kind, MessageKind::Compaction);
        assert_eq!(m.tokens_freed, Some(150000));

        let m = message(json!({
            "type": "system", "subtype": "compact_boundary",
            "compactMetadata": {"preTokens": 42}
        }));
        assert_eq!(m.tokens_freed, Some(42));

        let m = message(json!({"type": "system", "subtype": "compact_boundary", "tokensFreed": 7}));
        assert_eq!(m.tokens_freed, Some(7));
    }

    #[test]
    fn test_compact_summary_even_when_typed_summary() {
        let m = message(json!({
            "type": "summary", "isCompactSummary": true,
            "message": {"role": "user", "content": "Summary of earlier work"}
        }));
        assert_eq!(m.kind, MessageKind::Compaction);
        assert!(m.is_compact_summary);
        assert_eq!(m.content, "Summary of earlier work");
    }

    #[test]
    fn test_bookkeeping_skipped() {
        for kind in ["summary", "file-history-snapshot", "queue-operation"] {
            let c = classify(&record(json!({"type": kind}), 0));
            assert_eq!(c, Classification::Skip(SkipReason::Bookkeeping));
        }
    }

    #[test]
    fn test_unknown_kind_degrades_to_system() {
        let m = message(json!({"type": "progress", "data": {"step": 1}}));
        assert_eq!(m.kind, MessageKind::System);
        assert_eq!(m.discriminant.as_deref(), Some("progress"));
        assert_eq!(m.id, "line@0");
    }

    #[test]
    fn test_unreadable_shape_degrades_to_system() {
        let m = message(json!({"type": "user", "isMeta": "yes"}));
        assert_eq!(m.kind, MessageKind::System);
        assert!(m.content.contains("unreadable user record"));
    }

    #[test]
    fn test_missing_uuid_uses_byte_offset() {
        let r = record(json!({"type": "user", "message": {"content": "x"}}), 512);
        let m = classify(&r).into_message().unwrap();
        assert_eq!(m.id, "line@512");
        assert_eq!(m.id, Message::line_id(r.span));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let r = record(
            json!({"type": "assistant", "message": {"content": "same", "model": "claude-haiku-4-5",
                   "usage": {"input_tokens": 3}}}),
            40,
        );
        assert_eq!(classify(&r), classify(&r));
    }
}
