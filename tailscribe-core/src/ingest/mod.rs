//! Transcript ingestion pipeline
//!
//! ```text
//! bytes ──► stream (RawRecord) ──► classify (Message) ──► chunks (Chunk)
//!                                                          ├── linker
//!                                                          └── subagents
//! ```
//!
//! [`SessionParseState`] is the per-session continuation of this pipeline:
//! the next byte offset plus the chunk builder with its open turn, pending
//! tool calls and active subagents. Feeding it consecutive byte ranges one
//! pass at a time yields the same chunks as a single pass over the whole
//! file.

pub mod agents;
pub mod chunks;
pub mod classify;
pub mod linker;
pub mod stream;
pub mod subagents;

pub use agents::AgentTranscript;
pub use chunks::ChunkBuilder;
pub use classify::{classify, Classification, SkipReason};
pub use stream::{parse_range, DecodeWarning, RawRecord, StreamParser, DEFAULT_MAX_LINE_BYTES};

use crate::error::Result;
use crate::types::{Chunk, Message};
use std::path::Path;
use std::sync::Arc;

/// Messages decoded from one byte range.
#[derive(Debug, Default)]
pub struct ParsedMessages {
    pub messages: Vec<Message>,
    pub warnings: Vec<DecodeWarning>,
    /// Records classified as bookkeeping or empty
    pub skipped: usize,
    pub end_offset: u64,
}

/// Decode and classify a byte range that begins at `start_offset`.
pub fn parse_messages(bytes: &[u8], start_offset: u64, max_line_bytes: usize) -> ParsedMessages {
    let range = parse_range(bytes, start_offset, max_line_bytes);
    let mut parsed = ParsedMessages {
        warnings: range.warnings,
        end_offset: range.end_offset,
        ..Default::default()
    };
    for record in &range.records {
        match classify(record) {
            Classification::Message(message) => parsed.messages.push(*message),
            Classification::Skip(reason) => {
                tracing::trace!(span = %record.span, reason = reason.as_str(), "Skipped record");
                parsed.skipped += 1;
            }
        }
    }
    parsed
}

/// Result of one incremental pass.
#[derive(Debug, Default)]
pub struct PassOutput {
    /// Chunks created or changed by this pass, in sequence order
    pub touched: Vec<Arc<Chunk>>,
    pub warnings: Vec<DecodeWarning>,
    /// Messages folded into chunks
    pub messages: usize,
    pub skipped: usize,
    pub from_offset: u64,
    pub to_offset: u64,
}

impl PassOutput {
    /// Whether the pass consumed any bytes.
    pub fn advanced(&self) -> bool {
        self.to_offset > self.from_offset
    }

    /// Fold in chunks changed after the byte range was consumed. A newer
    /// snapshot replaces an older one with the same id.
    pub fn extend_touched(&mut self, later: Vec<Arc<Chunk>>) {
        for chunk in later {
            match self.touched.iter_mut().find(|c| c.id == chunk.id) {
                Some(slot) => *slot = chunk,
                None => self.touched.push(chunk),
            }
        }
    }
}

/// Per-session parse continuation carried from one pass to the next.
#[derive(Debug, Clone)]
pub struct SessionParseState {
    offset: u64,
    builder: ChunkBuilder,
    warning_count: usize,
    max_line_bytes: usize,
}

impl Default for SessionParseState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl SessionParseState {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            offset: 0,
            builder: ChunkBuilder::new(),
            warning_count: 0,
            max_line_bytes,
        }
    }

    /// Start from a known offset with no chunk history, as when the offset
    /// comes from the cache.
    pub fn resume_at(offset: u64, max_line_bytes: usize) -> Self {
        Self {
            offset,
            ..Self::new(max_line_bytes)
        }
    }

    /// First byte not yet consumed.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn chunks(&self) -> &[Arc<Chunk>] {
        self.builder.chunks()
    }

    pub fn builder(&self) -> &ChunkBuilder {
        &self.builder
    }

    /// Undecodable lines seen over the session's lifetime.
    pub fn warning_count(&self) -> usize {
        self.warning_count
    }

    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    /// Consume `bytes`, which start at `start` in the source.
    ///
    /// Only complete lines are consumed; the offset advances to just past
    /// the last one.
    pub fn ingest(&mut self, bytes: &[u8], start: u64) -> PassOutput {
        if start != self.offset {
            tracing::debug!(expected = self.offset, start, "Ingesting from a moved offset");
        }

        let parsed = parse_messages(bytes, start, self.max_line_bytes);
        let messages = parsed.messages.len();
        for message in parsed.messages {
            self.builder.push(message);
        }
        self.offset = parsed.end_offset;
        self.warning_count += parsed.warnings.len();

        PassOutput {
            touched: self.builder.take_touched(),
            warnings: parsed.warnings,
            messages,
            skipped: parsed.skipped,
            from_offset: start,
            to_offset: parsed.end_offset,
        }
    }

    /// Whether a finished subagent is waiting for its own transcript file.
    pub fn awaits_transcripts(&self) -> bool {
        self.builder.awaits_transcripts()
    }

    /// Attach subagent transcripts and return the chunks that changed.
    pub fn attach_transcripts(&mut self, transcripts: Vec<AgentTranscript>) -> Vec<Arc<Chunk>> {
        self.warning_count += transcripts.iter().map(|t| t.warnings).sum::<usize>();
        self.builder.attach_transcripts(transcripts);
        self.builder.take_touched()
    }

    /// Move past bytes that cannot be parsed (an oversized line that
    /// filled a whole read).
    pub fn skip_to(&mut self, offset: u64) {
        if offset > self.offset {
            self.warning_count += 1;
            self.offset = offset;
        }
    }

    /// Forget everything and parse again from byte 0.
    pub fn reset(&mut self) {
        *self = Self::new(self.max_line_bytes);
    }
}

/// A transcript parsed in one cold pass.
#[derive(Debug)]
pub struct LoadedTranscript {
    pub chunks: Vec<Arc<Chunk>>,
    pub warnings: Vec<DecodeWarning>,
    pub end_offset: u64,
}

/// Parse a whole transcript file from byte 0, together with the agent
/// files of subagents it spawned.
pub fn load_file(path: &Path, max_line_bytes: usize) -> Result<LoadedTranscript> {
    let bytes = std::fs::read(path)?;
    let mut state = SessionParseState::new(max_line_bytes);
    let pass = state.ingest(&bytes, 0);
    if state.awaits_transcripts() {
        let transcripts = read_agent_files(path, max_line_bytes)?;
        state.attach_transcripts(transcripts);
    }
    if let Some(span) = chunks::covered_span(state.chunks()) {
        tracing::debug!(
            path = %path.display(),
            messages = pass.messages,
            chunks = state.chunks().len(),
            %span,
            "Loaded transcript"
        );
    }
    Ok(LoadedTranscript {
        chunks: state.chunks().to_vec(),
        warnings: pass.warnings,
        end_offset: state.offset(),
    })
}

fn read_agent_files(session_path: &Path, max_line_bytes: usize) -> Result<Vec<AgentTranscript>> {
    let mut transcripts = Vec::new();
    for agent_id in agents::list_agent_ids(session_path)? {
        let Some(path) = agents::agent_path(session_path, &agent_id) else {
            continue;
        };
        let bytes = std::fs::read(&path)?;
        transcripts.push(AgentTranscript::parse(&agent_id, &bytes, max_line_bytes));
    }
    Ok(transcripts)
}

/// JSONL line builders shared by the pipeline tests.
#[cfg(test)]
pub(crate) mod testing {
    use serde_json::{json, Value};

    pub fn jsonl(lines: &[String]) -> Vec<u8> {
        let mut out = String::new();
        for line in lines {
            out.push_str(line);
            out.push('\n');
        }
        out.into_bytes()
    }

    fn line(value: Value) -> String {
        value.to_string()
    }

    pub fn user(uuid: &str, text: &str) -> String {
        line(json!({
            "type": "user", "uuid": uuid, "timestamp": "2025-11-25T10:00:00Z",
            "message": {"role": "user", "content": text}
        }))
    }

    pub fn assistant_text(uuid: &str, text: &str) -> String {
        line(json!({
            "type": "assistant", "uuid": uuid, "timestamp": "2025-11-25T10:00:01Z",
            "message": {"role": "assistant", "model": "claude-sonnet-4-5",
                        "content": [{"type": "text", "text": text}],
                        "usage": {"input_tokens": 10, "output_tokens": 5}}
        }))
    }

    pub fn assistant_stop(uuid: &str, text: &str, stop_reason: &str) -> String {
        line(json!({
            "type": "assistant", "uuid": uuid,
            "message": {"role": "assistant", "content": [{"type": "text", "text": text}],
                        "stop_reason": stop_reason}
        }))
    }

    pub fn assistant_calls(uuid: &str, calls: &[(&str, &str)]) -> String {
        let blocks: Vec<Value> = calls
            .iter()
            .map(|(id, name)| {
                json!({"type": "tool_use", "id": id, "name": name,
                       "input": {"description": format!("run {id}")}})
            })
            .collect();
        line(json!({
            "type": "assistant", "uuid": uuid, "timestamp": "2025-11-25T10:00:02Z",
            "message": {"role": "assistant", "model": "claude-sonnet-4-5", "content": blocks,
                        "usage": {"input_tokens": 20, "output_tokens": 8}}
        }))
    }

    pub fn assistant_call(uuid: &str, call_id: &str, name: &str) -> String {
        assistant_calls(uuid, &[(call_id, name)])
    }

    pub fn tool_result(uuid: &str, call_id: &str, is_error: bool) -> String {
        line(json!({
            "type": "user", "uuid": uuid, "timestamp": "2025-11-25T10:00:03Z",
            "message": {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": call_id, "content": "ok", "is_error": is_error}
            ]}
        }))
    }

    /// A user record that returns a result and adds new prompt text.
    pub fn user_with_result(uuid: &str, call_id: &str, text: &str) -> String {
        line(json!({
            "type": "user", "uuid": uuid, "timestamp": "2025-11-25T10:00:04Z",
            "message": {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": call_id, "content": "ok"},
                {"type": "text", "text": text}
            ]}
        }))
    }

    pub fn tool_result_agent(uuid: &str, call_id: &str, agent_id: &str) -> String {
        line(json!({
            "type": "user", "uuid": uuid, "timestamp": "2025-11-25T10:00:09Z",
            "toolUseResult": {"agentId": agent_id},
            "message": {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": call_id, "content": "subagent report"}
            ]}
        }))
    }

    pub fn system(uuid: &str, subtype: &str, content: &str) -> String {
        line(json!({
            "type": "system", "uuid": uuid, "subtype": subtype, "content": content
        }))
    }

    pub fn compact_boundary(uuid: &str, pre_tokens: u64) -> String {
        line(json!({
            "type": "system", "subtype": "compact_boundary", "uuid": uuid,
            "content": "Conversation compacted",
            "compactMetadata": {"trigger": "auto", "preTokens": pre_tokens}
        }))
    }

    pub fn compact_summary(uuid: &str, text: &str) -> String {
        line(json!({
            "type": "user", "uuid": uuid, "isCompactSummary": true,
            "message": {"role": "user", "content": text}
        }))
    }

    /// First record of a subagent's own transcript file.
    pub fn agent_prompt(uuid: &str, text: &str) -> String {
        line(json!({
            "type": "user", "uuid": uuid, "isSidechain": true, "timestamp": "2025-11-25T10:00:05Z",
            "message": {"role": "user", "content": text}
        }))
    }

    pub fn sidechain_for(uuid: &str, parent_call: &str, text: &str) -> String {
        line(json!({
            "type": "assistant", "uuid": uuid, "isSidechain": true, "parentToolUseID": parent_call,
            "message": {"role": "assistant", "content": [{"type": "text", "text": text}],
                        "usage": {"input_tokens": 4, "output_tokens": 2}}
        }))
    }

    pub fn sidechain_call_for(uuid: &str, parent_call: &str, call_id: &str, name: &str) -> String {
        line(json!({
            "type": "assistant", "uuid": uuid, "isSidechain": true, "parentToolUseID": parent_call,
            "message": {"role": "assistant", "content": [
                {"type": "tool_use", "id": call_id, "name": name, "input": {"description": "nested"}}
            ]}
        }))
    }

    pub fn sidechain_result(uuid: &str, call_id: &str) -> String {
        line(json!({
            "type": "user", "uuid": uuid, "isSidechain": true,
            "message": {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": call_id, "content": "nested done"}
            ]}
        }))
    }
}
