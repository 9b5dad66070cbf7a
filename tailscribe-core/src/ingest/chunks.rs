//! Chunk building
//!
//! Folds the classified message stream into display [`Chunk`]s:
//!
//! - a user message starts a `UserTurn`
//! - an assistant message extends the open `AssistantTurn`, or starts one
//! - a tool-result message attaches to the open turn (or opens one when
//!   tailing started mid-turn)
//! - a system message closes the open turn and emits a `SystemEvent`
//! - a compaction boundary closes the open turn and emits a
//!   `CompactionMarker` with the next phase number; a compact summary
//!   that directly follows the boundary is folded into it
//!
//! The builder owns the full chunk sequence together with the
//! [`ToolLinker`] and [`SubagentResolver`], so the open turn, pending calls
//! and running subagents carry over from one parse pass to the next.
//! Subagents that finish without any messages in the parent transcript
//! wait for [`ChunkBuilder::attach_transcripts`] to fill them from their
//! own agent files.
//! Chunks are held as `Arc`s and modified copy-on-write: a snapshot handed
//! to the view model is never mutated behind its back.

use super::agents::{self, AgentTranscript, Candidate};
use super::linker::{ExecLocation, ExecOwner, Resolution, ToolLinker};
use super::subagents::{ActiveSubagent, Attribution, SubagentResolver};
use crate::content;
use crate::types::{
    AssistantTurn, ByteSpan, Chunk, ChunkBody, ChunkState, CompactionMarker, Message, MessageKind,
    SubagentState, SubagentTree, SystemEvent, ToolCall, ToolExecution, ToolResult, TurnMetrics,
    TurnStatus, UserTurn,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Incremental message → chunk fold with its continuation state.
#[derive(Debug, Clone, Default)]
pub struct ChunkBuilder {
    chunks: Vec<Arc<Chunk>>,
    linker: ToolLinker,
    resolver: SubagentResolver,
    /// Index of the assistant turn still accepting messages
    open_turn: Option<usize>,
    /// Marker that a following compact summary may still extend
    last_marker: Option<usize>,
    phase: u32,
    /// Chunks changed since the last `take_touched`
    touched: BTreeSet<usize>,
    /// Turns whose status needs recomputing after the current message
    dirty: Vec<usize>,
    /// Finished subagents (chunk, node) with no messages of their own
    awaiting_transcripts: Vec<(usize, usize)>,
    /// Agent ids whose transcript is already attached
    linked_agents: HashSet<String>,
}

/// Subagents whose start times differ by at most this ran in parallel.
const PARALLEL_START_WINDOW_MS: i64 = 100;

impl ChunkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build chunks for a complete message sequence in one go.
    pub fn build(messages: impl IntoIterator<Item = Message>) -> Vec<Arc<Chunk>> {
        let mut builder = Self::new();
        for message in messages {
            builder.push(message);
        }
        builder.chunks
    }

    /// Every chunk built so far, in order.
    pub fn chunks(&self) -> &[Arc<Chunk>] {
        &self.chunks
    }

    pub fn linker(&self) -> &ToolLinker {
        &self.linker
    }

    pub fn resolver(&self) -> &SubagentResolver {
        &self.resolver
    }

    /// Number of compactions seen so far.
    pub fn phase(&self) -> u32 {
        self.phase
    }

    /// The assistant turn still accepting messages, if any.
    pub fn open_turn(&self) -> Option<&Chunk> {
        self.open_turn
            .and_then(|i| self.chunks.get(i))
            .map(|c| c.as_ref())
    }

    /// Whether some finished subagent still has no messages and may have
    /// a transcript file of its own.
    pub fn awaits_transcripts(&self) -> bool {
        !self.awaiting_transcripts.is_empty()
    }

    /// Agent ids whose transcripts are already attached.
    pub fn is_linked(&self, agent_id: &str) -> bool {
        self.linked_agents.contains(agents::normalize_agent_id(agent_id))
    }

    /// Fill waiting subagents from their own transcript files. Every
    /// waiting subagent is considered once: one left unmatched here is not
    /// offered later transcripts. Returns how many were attached.
    pub fn attach_transcripts(&mut self, transcripts: Vec<AgentTranscript>) -> usize {
        let waiting = std::mem::take(&mut self.awaiting_transcripts);
        let candidates: Vec<Candidate> = waiting
            .into_iter()
            .filter_map(|(chunk, node)| {
                let process = self.chunks.get(chunk)?.as_assistant_turn()?.subagents.get(node)?;
                process.messages.is_empty().then(|| Candidate {
                    chunk,
                    node,
                    agent_id: process.agent_id.clone(),
                    description: process.description.clone(),
                    started_at: process.started_at,
                })
            })
            .collect();
        let transcripts: Vec<AgentTranscript> = transcripts
            .into_iter()
            .filter(|t| !self.linked_agents.contains(&t.agent_id))
            .collect();

        let pairs = agents::match_transcripts(&candidates, &transcripts);
        let mut slots: Vec<Option<AgentTranscript>> = transcripts.into_iter().map(Some).collect();
        let mut attached = 0;
        for (ci, ti) in pairs {
            let (Some(candidate), Some(transcript)) = (candidates.get(ci), slots.get_mut(ti).and_then(Option::take))
            else {
                continue;
            };
            tracing::debug!(
                chunk = candidate.chunk,
                node = candidate.node,
                agent_id = %transcript.agent_id,
                messages = transcript.messages.len(),
                "Attached subagent transcript"
            );
            self.linked_agents.insert(transcript.agent_id.clone());
            self.attach_transcript(candidate.chunk, candidate.node, transcript);
            attached += 1;
        }
        self.refresh_dirty();
        attached
    }

    /// Chunks created or changed since the last call, in sequence order.
    pub fn take_touched(&mut self) -> Vec<Arc<Chunk>> {
        std::mem::take(&mut self.touched)
            .into_iter()
            .filter_map(|i| self.chunks.get(i).cloned())
            .collect()
    }

    /// Fold one message into the chunk sequence.
    pub fn push(&mut self, message: Message) {
        match self.resolver.attribute(&message) {
            Attribution::Subagent { chunk, node } => {
                self.last_marker = None;
                self.record(chunk, ExecOwner::Subagent(node), message);
            }
            Attribution::TopLevel => self.push_top_level(message),
        }
        self.refresh_dirty();
    }

    fn push_top_level(&mut self, message: Message) {
        match message.kind {
            MessageKind::User => {
                // Results sharing a record with new prompt text still
                // belong to the turn that made the calls
                if !message.tool_results.is_empty() {
                    let home = self.open_turn.map(|idx| (idx, ExecOwner::Turn));
                    self.resolve_results(home, &message.tool_results, message.timestamp);
                }
                self.close_turn(true);
                self.last_marker = None;
                self.push_user_turn(message);
            }
            MessageKind::Assistant | MessageKind::ToolResult => {
                self.last_marker = None;
                let idx = match self.open_turn {
                    Some(idx) => idx,
                    None => self.open_assistant_turn(&message),
                };
                self.record(idx, ExecOwner::Turn, message);
            }
            MessageKind::System => {
                self.close_turn(false);
                self.last_marker = None;
                self.append(Chunk {
                    id: message.id.clone(),
                    state: ChunkState::Closed,
                    span: message.span,
                    body: ChunkBody::SystemEvent(SystemEvent { message }),
                });
            }
            MessageKind::Compaction => self.push_compaction(message),
        }
    }

    // ============================================
    // Chunk creation
    // ============================================

    fn append(&mut self, chunk: Chunk) -> usize {
        let idx = self.chunks.len();
        self.chunks.push(Arc::new(chunk));
        self.touched.insert(idx);
        idx
    }

    fn push_user_turn(&mut self, message: Message) {
        let text = content::sanitize(&message.content);
        let commands = content::slash_commands(&message.content);
        let file_refs = content::file_references(&text);
        self.append(Chunk {
            id: message.id.clone(),
            state: ChunkState::Closed,
            span: message.span,
            body: ChunkBody::UserTurn(UserTurn {
                message,
                text,
                commands,
                file_refs,
            }),
        });
    }

    fn open_assistant_turn(&mut self, first: &Message) -> usize {
        let idx = self.append(Chunk {
            id: first.id.clone(),
            state: ChunkState::Open,
            span: first.span,
            body: ChunkBody::AssistantTurn(AssistantTurn {
                messages: Vec::new(),
                executions: Vec::new(),
                subagents: SubagentTree::default(),
                model: None,
                metrics: TurnMetrics::default(),
                status: TurnStatus::InProgress,
                started_at: first.timestamp,
                ended_at: first.timestamp,
            }),
        });
        self.open_turn = Some(idx);
        idx
    }

    fn push_compaction(&mut self, message: Message) {
        if message.is_compact_summary {
            if let Some(idx) = self.last_marker.take() {
                if let Some(chunk) = self.chunk_mut(idx) {
                    chunk.span = chunk.span.cover(message.span);
                    if let ChunkBody::CompactionMarker(marker) = &mut chunk.body {
                        marker.summary = Some(message.content);
                    }
                }
                return;
            }
        }

        self.close_turn(true);
        self.phase += 1;
        let is_boundary = !message.is_compact_summary;
        let idx = self.append(Chunk {
            id: message.id.clone(),
            state: ChunkState::Closed,
            span: message.span,
            body: ChunkBody::CompactionMarker(CompactionMarker {
                tokens_freed: message.tokens_freed.unwrap_or(0),
                phase: self.phase,
                summary: message.is_compact_summary.then(|| message.content.clone()),
                timestamp: message.timestamp,
            }),
        });
        self.last_marker = is_boundary.then_some(idx);
    }

    /// Close the open assistant turn. With `drain_subagents`, subagents
    /// still running in it stop receiving messages.
    fn close_turn(&mut self, drain_subagents: bool) {
        let Some(idx) = self.open_turn.take() else {
            return;
        };
        if drain_subagents {
            let stranded = self.resolver.close_chunk(idx);
            if !stranded.is_empty() {
                tracing::debug!(
                    chunk = idx,
                    count = stranded.len(),
                    "Turn closed with subagents still running"
                );
            }
        }
        if let Some(chunk) = self.chunk_mut(idx) {
            chunk.state = ChunkState::Closed;
        }
    }

    // ============================================
    // Turn extension
    // ============================================

    /// Copy-on-write access to a chunk; marks it touched.
    fn chunk_mut(&mut self, idx: usize) -> Option<&mut Chunk> {
        let chunk = self.chunks.get_mut(idx)?;
        self.touched.insert(idx);
        self.dirty.push(idx);
        Some(Arc::make_mut(chunk))
    }

    fn turn_mut(&mut self, idx: usize) -> Option<&mut AssistantTurn> {
        self.chunk_mut(idx)?.as_assistant_turn_mut()
    }

    /// Attach a message (and its tool traffic) to a turn or subagent.
    fn record(&mut self, chunk_idx: usize, owner: ExecOwner, message: Message) {
        let at = message.timestamp;

        self.resolve_results(Some((chunk_idx, owner)), &message.tool_results, at);

        for call in &message.tool_calls {
            let Some(location) =
                self.push_execution(chunk_idx, owner, ToolExecution::pending(call.clone(), at))
            else {
                continue;
            };
            self.linker.register_call(&call.id, location);
            if call.is_subagent_spawn() {
                self.spawn_subagent(location, call, at);
            }
        }

        let Some(chunk) = self.chunk_mut(chunk_idx) else {
            return;
        };
        chunk.span = chunk.span.cover(message.span);
        let ChunkBody::AssistantTurn(turn) = &mut chunk.body else {
            return;
        };
        turn.metrics.record(&message);
        if turn.model.is_none() {
            turn.model = message.model.clone();
        }
        if message.timestamp.is_some() {
            turn.ended_at = message.timestamp;
        }
        match owner {
            ExecOwner::Subagent(node) => match turn.subagents.get_mut(node) {
                Some(process) => {
                    process.metrics.record(&message);
                    process.messages.push(message);
                }
                None => turn.messages.push(message),
            },
            ExecOwner::Turn => turn.messages.push(message),
        }
    }

    /// Pair results with their calls. Orphans are kept in `home` when
    /// there is one, and only logged otherwise.
    fn resolve_results(
        &mut self,
        home: Option<(usize, ExecOwner)>,
        results: &[ToolResult],
        at: Option<DateTime<Utc>>,
    ) {
        for result in results {
            match self.linker.resolve(&result.call_id) {
                Resolution::Completes(location) => self.complete_execution(location, result, at),
                Resolution::Duplicate(_) => {}
                Resolution::Orphaned => {
                    tracing::warn!(
                        call_id = %result.call_id,
                        chunk = ?home.map(|(idx, _)| idx),
                        "Tool result without a visible call"
                    );
                    if let Some((chunk_idx, owner)) = home {
                        self.push_execution(chunk_idx, owner, ToolExecution::orphaned(result.clone(), at));
                    }
                }
            }
        }
    }

    /// Append an execution to its owner's list and return its address.
    fn push_execution(
        &mut self,
        chunk_idx: usize,
        owner: ExecOwner,
        execution: ToolExecution,
    ) -> Option<ExecLocation> {
        let turn = self.turn_mut(chunk_idx)?;
        let (owner, list) = match owner {
            ExecOwner::Subagent(node) if node < turn.subagents.len() => {
                let process = turn.subagents.get_mut(node)?;
                (owner, &mut process.executions)
            }
            _ => (ExecOwner::Turn, &mut turn.executions),
        };
        list.push(execution);
        Some(ExecLocation {
            chunk: chunk_idx,
            owner,
            slot: list.len() - 1,
        })
    }

    fn complete_execution(
        &mut self,
        location: ExecLocation,
        result: &ToolResult,
        at: Option<DateTime<Utc>>,
    ) {
        let Some(turn) = self.turn_mut(location.chunk) else {
            return;
        };
        let execution = match location.owner {
            ExecOwner::Turn => turn.executions.get_mut(location.slot),
            ExecOwner::Subagent(node) => turn
                .subagents
                .get_mut(node)
                .and_then(|p| p.executions.get_mut(location.slot)),
        };
        if let Some(execution) = execution {
            execution.complete(result.clone(), at);
        }

        let Some(node) = turn.subagents.find(&result.call_id) else {
            return;
        };
        let mut silent = false;
        if let Some(process) = turn.subagents.get_mut(node) {
            process.state = SubagentState::Completed;
            process.finished_at = at;
            process.agent_id = result.agent_id.clone();
            silent = process.messages.is_empty();
        }
        self.resolver.complete(&result.call_id);
        if silent {
            self.awaiting_transcripts.push((location.chunk, node));
        }
    }

    /// Replace a silent subagent's empty history with its own transcript.
    /// Calls and results inside the transcript pair among themselves.
    fn attach_transcript(&mut self, chunk_idx: usize, node: usize, transcript: AgentTranscript) {
        let started_at = transcript.started_at();
        let Some(turn) = self.turn_mut(chunk_idx) else {
            return;
        };

        let mut executions: Vec<ToolExecution> = Vec::new();
        let mut open: HashMap<String, usize> = HashMap::new();
        let mut metrics = TurnMetrics::default();
        for message in &transcript.messages {
            metrics.record(message);
            turn.metrics.record(message);
            for result in &message.tool_results {
                let slot = open.remove(&result.call_id);
                match slot.and_then(|i| executions.get_mut(i)) {
                    Some(execution) => {
                        execution.complete(result.clone(), message.timestamp);
                    }
                    None => executions.push(ToolExecution::orphaned(result.clone(), message.timestamp)),
                }
            }
            for call in &message.tool_calls {
                open.insert(call.id.clone(), executions.len());
                executions.push(ToolExecution::pending(call.clone(), message.timestamp));
            }
        }

        let Some(process) = turn.subagents.get_mut(node) else {
            return;
        };
        process.agent_id.get_or_insert_with(|| transcript.agent_id.clone());
        if process.description.is_none() {
            process.description = transcript.description;
        }
        process.team = transcript.team;
        process.started_at = started_at.or(process.started_at);
        process.messages = transcript.messages;
        process.executions = executions;
        process.metrics = metrics;

        // Siblings whose transcripts began together ran in parallel
        let Some(start) = started_at else {
            return;
        };
        let together: Vec<usize> = turn
            .subagents
            .siblings(node)
            .iter()
            .copied()
            .filter(|&s| s != node)
            .filter(|&s| {
                turn.subagents.get(s).is_some_and(|p| {
                    !p.messages.is_empty()
                        && p.started_at
                            .is_some_and(|t| (t - start).num_milliseconds().abs() <= PARALLEL_START_WINDOW_MS)
                })
            })
            .collect();
        if together.is_empty() {
            return;
        }
        for idx in together.into_iter().chain(std::iter::once(node)) {
            if let Some(process) = turn.subagents.get_mut(idx) {
                process.is_parallel = true;
            }
        }
    }

    fn spawn_subagent(&mut self, location: ExecLocation, call: &ToolCall, at: Option<DateTime<Utc>>) {
        let parent = match location.owner {
            ExecOwner::Subagent(node) => Some(node),
            ExecOwner::Turn => None,
        };
        let Some(turn) = self.turn_mut(location.chunk) else {
            return;
        };
        let node = turn.subagents.spawn(call, parent, at);

        let running = self.resolver.push(ActiveSubagent {
            call_id: call.id.clone(),
            chunk: location.chunk,
            node,
            parent,
        });
        if running.is_empty() {
            return;
        }
        if let Some(turn) = self.turn_mut(location.chunk) {
            for idx in running.into_iter().chain(std::iter::once(node)) {
                if let Some(process) = turn.subagents.get_mut(idx) {
                    process.is_parallel = true;
                }
            }
        }
    }

    fn refresh_dirty(&mut self) {
        let mut dirty = std::mem::take(&mut self.dirty);
        dirty.sort_unstable();
        dirty.dedup();
        for idx in dirty {
            let Some(chunk) = self.chunks.get_mut(idx) else {
                continue;
            };
            let chunk = Arc::make_mut(chunk);
            let closed = chunk.state == ChunkState::Closed;
            if let Some(turn) = chunk.as_assistant_turn_mut() {
                turn.refresh_status(closed);
            }
        }
    }
}

/// Span covered by a chunk sequence, useful for logging a pass.
pub fn covered_span(chunks: &[Arc<Chunk>]) -> Option<ByteSpan> {
    let first = chunks.first()?.span;
    Some(chunks.iter().fold(first, |acc, c| acc.cover(c.span)))
}
