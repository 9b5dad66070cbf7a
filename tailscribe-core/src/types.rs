//! Core domain types for tailscribe
//!
//! These types model the conversation structure built from a transcript:
//!
//! ```text
//! transcript line ──► Message ──► Chunk (UserTurn | AssistantTurn | SystemEvent | CompactionMarker)
//!                                    └── AssistantTurn
//!                                          ├── ToolExecution (call ↔ result)
//!                                          └── SubagentTree (arena of SubagentProcess)
//! ```
//!
//! Messages are immutable once classified. Chunks are extended in place as
//! later messages of the same logical turn arrive, and keep the id of the
//! message that opened them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::AddAssign;

// ============================================
// Identity
// ============================================

/// Identifier of a session (the transcript file stem for local sources).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Chunk identity: the id of the message that opened the chunk.
pub type ChunkId = String;

/// Half-open byte range `[start, end)` of a transcript line, newline included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ByteSpan {
    pub start: u64,
    pub end: u64,
}

impl ByteSpan {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest span covering both `self` and `other`.
    pub fn cover(&self, other: ByteSpan) -> ByteSpan {
        ByteSpan {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for ByteSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

// ============================================
// Messages
// ============================================

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

/// Display category of a classified message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Human-typed prompt; opens a UserTurn
    User,
    /// Model output (text, thinking, tool calls)
    Assistant,
    /// Tool results or other meta input fed back to the model
    ToolResult,
    /// System notice, or a record of an unrecognized kind
    System,
    /// Context compaction boundary or its summary
    Compaction,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::User => "user",
            MessageKind::Assistant => "assistant",
            MessageKind::ToolResult => "tool_result",
            MessageKind::System => "system",
            MessageKind::Compaction => "compaction",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageKind::User),
            "assistant" => Ok(MessageKind::Assistant),
            "tool_result" => Ok(MessageKind::ToolResult),
            "system" => Ok(MessageKind::System),
            "compaction" => Ok(MessageKind::Compaction),
            _ => Err(format!("unknown message kind: {}", s)),
        }
    }
}

/// Token counts reported for a model response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_creation
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input += rhs.input;
        self.output += rhs.output;
        self.cache_read += rhs.cache_read;
        self.cache_creation += rhs.cache_creation;
    }
}

/// Tool names that spawn a subagent.
pub const SUBAGENT_TOOLS: &[&str] = &["Task", "Agent"];

/// A tool invocation requested by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

impl ToolCall {
    /// Whether this call launches a nested subagent.
    pub fn is_subagent_spawn(&self) -> bool {
        SUBAGENT_TOOLS.contains(&self.name.as_str())
    }

    fn input_str(&self, key: &str) -> Option<String> {
        self.input
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Short description given to a spawned subagent.
    pub fn description(&self) -> Option<String> {
        self.input_str("description")
    }

    /// Subagent flavor (e.g. "Explore", "general-purpose").
    pub fn subagent_type(&self) -> Option<String> {
        self.input_str("subagent_type")
    }
}

/// The outcome of a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub content: String,
    pub is_error: bool,
    /// Agent id reported when the result completes a subagent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Immutable classified unit of a transcript.
///
/// Re-classifying the same byte range always yields an equal `Message`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    /// Declared uuid, or `line@<start offset>` when the record has none
    pub id: String,
    pub kind: MessageKind,
    pub role: Role,
    pub timestamp: Option<DateTime<Utc>>,
    pub content: String,
    /// Extended thinking blocks, joined
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
    /// Explicit attribution to the subagent spawned by this call id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    pub is_sidechain: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    /// Record discriminant or system subtype worth keeping for display
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discriminant: Option<String>,
    /// Compaction only: tokens reclaimed by the boundary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_freed: Option<u64>,
    /// Compaction only: this is the summary that follows a boundary
    pub is_compact_summary: bool,
    pub span: ByteSpan,
}

impl Message {
    /// Fallback id for records that carry no uuid.
    pub fn line_id(span: ByteSpan) -> String {
        format!("line@{}", span.start)
    }
}

// ============================================
// Tool executions
// ============================================

/// Pairing state of a tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Call seen, result not yet
    Pending,
    /// Call and result matched
    Completed,
    /// Result seen without a visible call
    Orphaned,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Completed => "completed",
            ExecutionState::Orphaned => "orphaned",
        }
    }
}

/// A tool call paired with its (eventual) result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolExecution {
    pub call_id: String,
    pub call: Option<ToolCall>,
    pub result: Option<ToolResult>,
    pub state: ExecutionState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl ToolExecution {
    /// A freshly seen call awaiting its result.
    pub fn pending(call: ToolCall, started_at: Option<DateTime<Utc>>) -> Self {
        Self {
            call_id: call.id.clone(),
            call: Some(call),
            result: None,
            state: ExecutionState::Pending,
            started_at,
            finished_at: None,
            duration_ms: None,
        }
    }

    /// A result whose call was never seen.
    pub fn orphaned(result: ToolResult, finished_at: Option<DateTime<Utc>>) -> Self {
        Self {
            call_id: result.call_id.clone(),
            call: None,
            result: Some(result),
            state: ExecutionState::Orphaned,
            started_at: None,
            finished_at,
            duration_ms: None,
        }
    }

    /// Attach a result. Only a pending execution can complete; returns
    /// `false` and leaves the execution untouched otherwise.
    pub fn complete(&mut self, result: ToolResult, finished_at: Option<DateTime<Utc>>) -> bool {
        if self.state != ExecutionState::Pending {
            return false;
        }
        self.duration_ms = match (self.started_at, finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0)),
            _ => None,
        };
        self.result = Some(result);
        self.finished_at = finished_at;
        self.state = ExecutionState::Completed;
        true
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.call.as_ref().map(|c| c.name.as_str())
    }

    pub fn is_pending(&self) -> bool {
        self.state == ExecutionState::Pending
    }

    /// Orphans always render as errors; completed executions report the
    /// result's own flag.
    pub fn is_error(&self) -> bool {
        match self.state {
            ExecutionState::Orphaned => true,
            ExecutionState::Completed => self.result.as_ref().is_some_and(|r| r.is_error),
            ExecutionState::Pending => false,
        }
    }
}

// ============================================
// Subagents
// ============================================

/// Lifecycle of a spawned subagent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentState {
    Running,
    Completed,
}

/// Aggregates for a turn or a subagent.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TurnMetrics {
    pub message_count: usize,
    pub tool_call_count: usize,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

impl TurnMetrics {
    /// Fold one message into the aggregates.
    pub fn record(&mut self, message: &Message) {
        self.message_count += 1;
        self.tool_call_count += message.tool_calls.len();
        self.usage += message.usage;
        self.cost_usd += message.cost_usd;
        self.duration_ms += message.duration_ms;
    }
}

/// A nested execution spawned by a subagent tool call.
///
/// Nodes live in a [`SubagentTree`] arena; `parent` and `children` are
/// indices into that arena.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubagentProcess {
    /// Call id of the spawning tool call
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subagent_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub state: SubagentState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub messages: Vec<Message>,
    pub executions: Vec<ToolExecution>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Ran concurrently with at least one sibling
    pub is_parallel: bool,
    pub metrics: TurnMetrics,
    /// Team membership announced by a teammate prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<TeamMember>,
}

/// A subagent working as a named member of an agent team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamMember {
    pub team_name: String,
    pub member_name: String,
}

/// Arena of subagent processes owned by one assistant turn.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SubagentTree {
    pub nodes: Vec<SubagentProcess>,
    /// Top-level subagents, in spawn order
    pub roots: Vec<usize>,
    #[serde(skip)]
    by_call: HashMap<String, usize>,
}

impl SubagentTree {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Add a node for a spawn call under `parent` (or as a root).
    pub fn spawn(&mut self, call: &ToolCall, parent: Option<usize>, at: Option<DateTime<Utc>>) -> usize {
        let idx = self.nodes.len();
        let parent = parent.filter(|&p| p < idx);
        self.nodes.push(SubagentProcess {
            call_id: call.id.clone(),
            description: call.description(),
            subagent_type: call.subagent_type(),
            agent_id: None,
            state: SubagentState::Running,
            started_at: at,
            finished_at: None,
            messages: Vec::new(),
            executions: Vec::new(),
            parent,
            children: Vec::new(),
            is_parallel: false,
            metrics: TurnMetrics::default(),
            team: None,
        });
        match parent.and_then(|p| self.nodes.get_mut(p)) {
            Some(parent_node) => parent_node.children.push(idx),
            None => self.roots.push(idx),
        }
        self.by_call.insert(call.id.clone(), idx);
        idx
    }

    pub fn get(&self, idx: usize) -> Option<&SubagentProcess> {
        self.nodes.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut SubagentProcess> {
        self.nodes.get_mut(idx)
    }

    /// Arena index of the node spawned by `call_id`.
    pub fn find(&self, call_id: &str) -> Option<usize> {
        self.by_call.get(call_id).copied()
    }

    /// Indices of the node's siblings (nodes sharing its parent).
    pub fn siblings(&self, idx: usize) -> &[usize] {
        match self
            .nodes
            .get(idx)
            .and_then(|n| n.parent)
            .and_then(|p| self.nodes.get(p))
        {
            Some(parent) => &parent.children,
            None => &self.roots,
        }
    }

    /// Pre-order walk yielding `(index, depth)`, using an explicit stack.
    pub fn walk(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<(usize, usize)> = self.roots.iter().rev().map(|&r| (r, 0)).collect();
        while let Some((idx, depth)) = stack.pop() {
            out.push((idx, depth));
            if let Some(node) = self.nodes.get(idx) {
                stack.extend(node.children.iter().rev().map(|&c| (c, depth + 1)));
            }
        }
        out
    }

    /// Deepest nesting level (1 for a single layer of subagents).
    pub fn depth(&self) -> usize {
        self.walk().iter().map(|&(_, d)| d + 1).max().unwrap_or(0)
    }
}

// ============================================
// Chunks
// ============================================

/// Whether a chunk can still be extended by later messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Open,
    Closed,
}

/// Display status of an assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    InProgress,
    Complete,
    Error,
    Interrupted,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::InProgress => "in_progress",
            TurnStatus::Complete => "complete",
            TurnStatus::Error => "error",
            TurnStatus::Interrupted => "interrupted",
        }
    }
}

/// A human prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserTurn {
    pub message: Message,
    /// Prompt text with injected markup removed
    pub text: String,
    /// Slash commands mentioned in the prompt
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    /// `@path` file references in the prompt
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_refs: Vec<String>,
}

/// Everything the assistant did in response to one prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantTurn {
    /// Top-level messages, in source order
    pub messages: Vec<Message>,
    /// Top-level tool executions, in call order
    pub executions: Vec<ToolExecution>,
    pub subagents: SubagentTree,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Aggregates across the turn, subagents included
    pub metrics: TurnMetrics,
    pub status: TurnStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl AssistantTurn {
    /// Concatenated assistant text of the top-level messages.
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.kind == MessageKind::Assistant && !m.content.is_empty())
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Iterate over every execution in the turn, subagents included.
    pub fn all_executions(&self) -> impl Iterator<Item = &ToolExecution> {
        self.executions
            .iter()
            .chain(self.subagents.nodes.iter().flat_map(|n| n.executions.iter()))
    }

    /// Look up an execution by call id anywhere in the turn.
    pub fn execution(&self, call_id: &str) -> Option<&ToolExecution> {
        self.all_executions().find(|e| e.call_id == call_id)
    }

    /// Recompute the status from executions and the last stop reason.
    ///
    /// Unresolved work only counts as in progress while the turn is open.
    /// Once `closed`, a call still waiting for its result or a subagent
    /// still running means the turn was cut short.
    pub fn refresh_status(&mut self, closed: bool) {
        let running_subagent = self
            .subagents
            .nodes
            .iter()
            .any(|n| n.state == SubagentState::Running);
        let unresolved = running_subagent || self.all_executions().any(|e| e.is_pending());
        let errored = self.all_executions().any(|e| e.is_error());
        let interrupted = self
            .messages
            .iter()
            .rev()
            .find_map(|m| m.stop_reason.as_deref())
            .is_some_and(|r| r == "max_tokens");

        self.status = if unresolved && !closed {
            TurnStatus::InProgress
        } else if unresolved {
            TurnStatus::Interrupted
        } else if errored {
            TurnStatus::Error
        } else if interrupted {
            TurnStatus::Interrupted
        } else {
            TurnStatus::Complete
        };
    }
}

/// A non-conversational system notice.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemEvent {
    pub message: Message,
}

/// A context compaction boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompactionMarker {
    pub tokens_freed: u64,
    /// 1 for the first compaction in the session, then 2, 3, ...
    pub phase: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Chunk payload variants.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkBody {
    UserTurn(UserTurn),
    AssistantTurn(AssistantTurn),
    SystemEvent(SystemEvent),
    CompactionMarker(CompactionMarker),
}

/// The display unit of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    /// Id of the first contributing message; stable across re-parses
    pub id: ChunkId,
    pub state: ChunkState,
    /// Bytes covered by the contributing messages
    pub span: ByteSpan,
    #[serde(flatten)]
    pub body: ChunkBody,
}

impl Chunk {
    pub fn kind_str(&self) -> &'static str {
        match self.body {
            ChunkBody::UserTurn(_) => "user_turn",
            ChunkBody::AssistantTurn(_) => "assistant_turn",
            ChunkBody::SystemEvent(_) => "system_event",
            ChunkBody::CompactionMarker(_) => "compaction_marker",
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == ChunkState::Open
    }

    pub fn as_assistant_turn(&self) -> Option<&AssistantTurn> {
        match &self.body {
            ChunkBody::AssistantTurn(turn) => Some(turn),
            _ => None,
        }
    }

    pub fn as_assistant_turn_mut(&mut self) -> Option<&mut AssistantTurn> {
        match &mut self.body {
            ChunkBody::AssistantTurn(turn) => Some(turn),
            _ => None,
        }
    }

    pub fn as_compaction(&self) -> Option<&CompactionMarker> {
        match &self.body {
            ChunkBody::CompactionMarker(marker) => Some(marker),
            _ => None,
        }
    }
}

// ============================================
// Liveness
// ============================================

/// Whether a session is still being written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Active,
    Inactive,
}

impl Liveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Active => "active",
            Liveness::Inactive => "inactive",
        }
    }

    /// Active iff the last data-bearing merge happened within `timeout` of `now`.
    pub fn from_last_activity(
        last_activity: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        timeout: std::time::Duration,
    ) -> Self {
        let Some(last) = last_activity else {
            return Liveness::Inactive;
        };
        let elapsed = now.signed_duration_since(last);
        match chrono::Duration::from_std(timeout) {
            Ok(limit) if elapsed <= limit => Liveness::Active,
            _ => Liveness::Inactive,
        }
    }
}

impl std::str::FromStr for Liveness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Liveness::Active),
            "inactive" => Ok(Liveness::Inactive),
            _ => Err(format!("unknown liveness: {}", s)),
        }
    }
}
