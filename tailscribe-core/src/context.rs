//! Context window attribution
//!
//! Estimates what fills the model's context, chunk by chunk, split into
//! six categories. Totals accumulate within a compaction phase and start
//! over after each [`CompactionMarker`]. The marker's own entry reports the
//! size of the summary that replaced the phase, next to the totals of the
//! phase it closed.
//!
//! Sizes come from [`estimate_tokens`], not from reported usage, so they
//! are comparable across categories but only roughly match the real count.
//!
//! [`CompactionMarker`]: crate::types::CompactionMarker

use crate::pricing::estimate_tokens;
use crate::types::{AssistantTurn, Chunk, ChunkBody, ToolCall, ToolExecution, UserTurn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Reads of these files load project instructions into the context.
const INSTRUCTION_FILES: &[&str] = &[
    "CLAUDE.md",
    ".claude/settings.json",
    ".claude/settings.local.json",
    ".clauderc",
];

/// Tools that coordinate work rather than inspect or change the project.
const TASK_TOOLS: &[&str] = &[
    "Task",
    "TaskCreate",
    "TaskUpdate",
    "TaskList",
    "TaskGet",
    "TaskOutput",
    "Skill",
];

const SYSTEM_REMINDER: &str = "<system-reminder>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextCategory {
    /// Project instruction files and system reminders
    ClaudeMd,
    /// Files `@`-mentioned in the prompt
    MentionedFile,
    ToolOutput,
    ThinkingText,
    /// Subagent, task list and skill calls
    TaskCoordination,
    UserMessage,
}

impl ContextCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextCategory::ClaudeMd => "claude-md",
            ContextCategory::MentionedFile => "mentioned-file",
            ContextCategory::ToolOutput => "tool-output",
            ContextCategory::ThinkingText => "thinking-text",
            ContextCategory::TaskCoordination => "task-coordination",
            ContextCategory::UserMessage => "user-message",
        }
    }
}

/// Token split of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ToolTokens {
    pub input: u64,
    pub output: u64,
}

/// One thing a chunk added to the context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextInjection {
    pub category: ContextCategory,
    pub estimated_tokens: u64,
    /// Tool name, file name, or a short description
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolTokens>,
}

/// Context estimate as of one chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextStats {
    pub chunk_id: String,
    /// 1 until the first compaction, then 2, 3, ... A compaction marker
    /// carries the phase it closes.
    pub phase: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub new_injections: Vec<ContextInjection>,
    /// Running totals of the phase
    pub tokens_by_category: BTreeMap<ContextCategory, u64>,
    /// Sum of the phase so far, or the summary size for a compaction marker
    pub total_tokens: u64,
    /// Compaction markers only: phase total minus the summary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_freed: Option<u64>,
}

/// Attribute context to every chunk, in order. The result has one entry
/// per chunk.
pub fn analyze(chunks: &[Arc<Chunk>]) -> Vec<ContextStats> {
    let mut out = Vec::with_capacity(chunks.len());
    let mut phase = 1;
    let mut totals: BTreeMap<ContextCategory, u64> = BTreeMap::new();
    // Prompt whose mentions the next assistant turn has not yet claimed
    let mut prompt: Option<&UserTurn> = None;

    for chunk in chunks {
        let new_injections = match &chunk.body {
            ChunkBody::CompactionMarker(marker) => {
                let summary = marker.summary.as_deref().map_or(0, estimate_tokens);
                let closed = std::mem::take(&mut totals);
                let before: u64 = closed.values().sum();
                out.push(ContextStats {
                    chunk_id: chunk.id.clone(),
                    phase,
                    new_injections: Vec::new(),
                    tokens_by_category: closed,
                    total_tokens: summary,
                    estimated_freed: Some(before.saturating_sub(summary)),
                });
                phase += 1;
                continue;
            }
            ChunkBody::UserTurn(user) => {
                prompt = Some(user);
                prompt_injections(user)
            }
            ChunkBody::AssistantTurn(turn) => turn_injections(turn, prompt.take()),
            ChunkBody::SystemEvent(_) => Vec::new(),
        };

        for injection in &new_injections {
            *totals.entry(injection.category).or_default() += injection.estimated_tokens;
        }
        out.push(ContextStats {
            chunk_id: chunk.id.clone(),
            phase,
            new_injections,
            tokens_by_category: totals.clone(),
            total_tokens: totals.values().sum(),
            estimated_freed: None,
        });
    }
    out
}

fn prompt_injections(user: &UserTurn) -> Vec<ContextInjection> {
    let mut out = Vec::new();
    let tokens = estimate_tokens(&user.text);
    if tokens > 0 {
        out.push(ContextInjection {
            category: ContextCategory::UserMessage,
            estimated_tokens: tokens,
            label: "User message".to_string(),
            path: None,
            tool: None,
        });
    }
    // Reminders are stripped from the display text; the difference is theirs
    if user.message.content.contains(SYSTEM_REMINDER) {
        let reminders = estimate_tokens(&user.message.content).saturating_sub(tokens);
        if reminders > 0 {
            out.push(ContextInjection {
                category: ContextCategory::ClaudeMd,
                estimated_tokens: reminders,
                label: "System reminder".to_string(),
                path: None,
                tool: None,
            });
        }
    }
    out
}

fn turn_injections(turn: &AssistantTurn, prompt: Option<&UserTurn>) -> Vec<ContextInjection> {
    let mut out = Vec::new();

    for execution in &turn.executions {
        let Some(call) = &execution.call else {
            continue;
        };
        let output = result_tokens(execution);
        if let Some(path) = read_path(call).filter(|p| is_instruction_file(p)) {
            out.push(ContextInjection {
                category: ContextCategory::ClaudeMd,
                estimated_tokens: output,
                label: file_name(path).to_string(),
                path: Some(path.to_string()),
                tool: None,
            });
            continue;
        }

        let input = estimate_tokens(&call.input.to_string());
        let category = if TASK_TOOLS.contains(&call.name.as_str()) {
            ContextCategory::TaskCoordination
        } else {
            ContextCategory::ToolOutput
        };
        out.push(ContextInjection {
            category,
            estimated_tokens: input + output,
            label: call.name.clone(),
            path: None,
            tool: Some(ToolTokens { input, output }),
        });
    }

    for message in &turn.messages {
        if message.content.contains(SYSTEM_REMINDER) {
            out.push(ContextInjection {
                category: ContextCategory::ClaudeMd,
                estimated_tokens: estimate_tokens(&message.content),
                label: "System reminder".to_string(),
                path: None,
                tool: None,
            });
        }
        let thinking = message.thinking.as_deref().map_or(0, estimate_tokens);
        if thinking > 0 {
            out.push(ContextInjection {
                category: ContextCategory::ThinkingText,
                estimated_tokens: thinking,
                label: "Extended thinking".to_string(),
                path: None,
                tool: None,
            });
        }
    }

    for mention in prompt.map(|p| p.file_refs.as_slice()).unwrap_or_default() {
        // A matching read tells the real size; otherwise count the mention
        let read = turn
            .executions
            .iter()
            .filter_map(|e| Some((read_path(e.call.as_ref()?)?, e)))
            .find(|(path, _)| path.ends_with(mention.as_str()) || mention.ends_with(*path))
            .map(|(_, e)| result_tokens(e))
            .filter(|&tokens| tokens > 0);
        out.push(ContextInjection {
            category: ContextCategory::MentionedFile,
            estimated_tokens: read.unwrap_or_else(|| estimate_tokens(mention)),
            label: file_name(mention).to_string(),
            path: Some(mention.clone()),
            tool: None,
        });
    }

    out
}

fn read_path(call: &ToolCall) -> Option<&str> {
    if call.name != "Read" {
        return None;
    }
    call.input.get("file_path")?.as_str()
}

fn is_instruction_file(path: &str) -> bool {
    INSTRUCTION_FILES.iter().any(|suffix| path.ends_with(suffix))
}

fn result_tokens(execution: &ToolExecution) -> u64 {
    execution
        .result
        .as_ref()
        .map_or(0, |r| estimate_tokens(&r.content))
}

fn file_name(path: &str) -> &str {
    path.trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
}
