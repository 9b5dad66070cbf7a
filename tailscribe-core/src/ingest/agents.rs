//! Subagent transcript files
//!
//! Recent Claude Code versions write each subagent's conversation to a file
//! of its own next to the session transcript, leaving only the spawning
//! call and its result in the parent:
//!
//! ```text
//! projects/<project>/<session>.jsonl
//! projects/<project>/<session>/subagents/agent-<id>.jsonl
//! ```
//!
//! [`AgentTranscript`] is one such file, parsed. [`match_transcripts`]
//! pairs transcripts with the subagent nodes still waiting for one: first
//! by the `agentId` the spawn's result reported, then by description, then
//! by start order.

use super::parse_messages;
use crate::types::{Message, MessageKind, TeamMember};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// File name prefix of subagent transcripts.
pub const AGENT_FILE_PREFIX: &str = "agent-";

/// Directory, inside the per-session directory, holding agent files.
pub const SUBAGENT_DIR: &str = "subagents";

/// Compaction artifacts share the prefix but are not subagents.
const COMPACTION_ID_PREFIX: &str = "acompact";

/// Prompt text kept as a description when no teammate summary exists.
const DESCRIPTION_CHARS: usize = 200;

static TEAMMATE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<teammate-message\b([^>]*)>").unwrap());
static TAG_ATTR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).unwrap());

/// One subagent's own transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTranscript {
    pub agent_id: String,
    pub messages: Vec<Message>,
    /// Teammate summary, or the start of the first prompt
    pub description: Option<String>,
    pub team: Option<TeamMember>,
    /// Undecodable lines skipped
    pub warnings: usize,
}

impl AgentTranscript {
    /// Parse a whole agent file.
    pub fn parse(agent_id: &str, bytes: &[u8], max_line_bytes: usize) -> Self {
        let parsed = parse_messages(bytes, 0, max_line_bytes);
        let prompt = parsed
            .messages
            .iter()
            .find(|m| m.kind == MessageKind::User)
            .map(|m| m.content.as_str());

        let teammate = prompt.and_then(teammate_attrs);
        let description = teammate
            .as_ref()
            .and_then(|attrs| attr(attrs, "summary"))
            .map(String::from)
            .or_else(|| prompt.map(|p| p.chars().take(DESCRIPTION_CHARS).collect::<String>().trim().to_string()))
            .filter(|d| !d.is_empty());
        let team = teammate.as_ref().and_then(|attrs| {
            Some(TeamMember {
                team_name: attr(attrs, "team_name")?.to_string(),
                member_name: attr(attrs, "member_name")?.to_string(),
            })
        });

        Self {
            agent_id: normalize_agent_id(agent_id).to_string(),
            messages: parsed.messages,
            description,
            team,
            warnings: parsed.warnings.len(),
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.messages.iter().find_map(|m| m.timestamp)
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.messages.iter().rev().find_map(|m| m.timestamp)
    }
}

fn teammate_attrs(text: &str) -> Option<Vec<(String, String)>> {
    let tag = TEAMMATE_TAG.captures(text)?;
    let attrs = tag.get(1)?.as_str();
    Some(
        TAG_ATTR
            .captures_iter(attrs)
            .map(|c| (c[1].to_string(), c[2].to_string()))
            .collect(),
    )
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(key, value)| key == name && !value.is_empty())
        .map(|(_, value)| value.as_str())
}

/// Agent ids appear both bare and with the file prefix.
pub fn normalize_agent_id(id: &str) -> &str {
    id.strip_prefix(AGENT_FILE_PREFIX).unwrap_or(id)
}

/// Agent id for an agent file path, `None` for anything else.
pub fn agent_id_for(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let id = stem.strip_prefix(AGENT_FILE_PREFIX)?;
    if id.is_empty() || id.starts_with(COMPACTION_ID_PREFIX) {
        return None;
    }
    Some(id.to_string())
}

/// Whether a `.jsonl` path is a subagent's transcript rather than a session.
pub fn is_agent_file(path: &Path) -> bool {
    let stem_is_agent = path
        .file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.starts_with(AGENT_FILE_PREFIX));
    let in_subagent_dir = path
        .parent()
        .and_then(|p| p.file_name())
        .is_some_and(|n| n == SUBAGENT_DIR);
    stem_is_agent || in_subagent_dir
}

/// `<dir>/<session stem>/subagents` for a session transcript path.
pub fn agent_dir(session_path: &Path) -> Option<PathBuf> {
    let stem = session_path.file_stem()?;
    Some(session_path.with_file_name(stem).join(SUBAGENT_DIR))
}

pub fn agent_path(session_path: &Path, agent_id: &str) -> Option<PathBuf> {
    let id = normalize_agent_id(agent_id);
    Some(agent_dir(session_path)?.join(format!("{AGENT_FILE_PREFIX}{id}.jsonl")))
}

/// Ids of the agent files stored for a session, sorted. A session without
/// an agent directory has none.
pub fn list_agent_ids(session_path: &Path) -> io::Result<Vec<String>> {
    let Some(dir) = agent_dir(session_path) else {
        return Ok(Vec::new());
    };
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(id) = agent_id_for(&entry.path()) {
            ids.push(id);
        }
    }
    ids.sort();
    Ok(ids)
}

// ============================================
// Matching
// ============================================

/// A finished subagent node with no messages of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub chunk: usize,
    pub node: usize,
    /// `agentId` from the spawn's result
    pub agent_id: Option<String>,
    pub description: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Pair candidates with transcripts, returning `(candidate, transcript)`
/// index pairs. Each side is used at most once.
///
/// A candidate that names an agent id only ever takes that agent's file.
/// The description and start-order fallbacks apply to candidates whose
/// result carried no id.
pub fn match_transcripts(candidates: &[Candidate], transcripts: &[AgentTranscript]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    let mut taken = vec![false; transcripts.len()];
    let mut unmatched = Vec::new();

    for (ci, candidate) in candidates.iter().enumerate() {
        let Some(id) = candidate.agent_id.as_deref() else {
            unmatched.push(ci);
            continue;
        };
        let id = normalize_agent_id(id);
        if let Some(ti) = (0..transcripts.len()).find(|&ti| !taken[ti] && transcripts[ti].agent_id == id) {
            taken[ti] = true;
            pairs.push((ci, ti));
        }
    }

    // One description contained in the other, case-insensitively
    let mut positional = Vec::new();
    for ci in unmatched {
        let wanted = candidates[ci]
            .description
            .as_deref()
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty());
        let found = wanted.and_then(|wanted| {
            (0..transcripts.len()).find(|&ti| {
                !taken[ti]
                    && transcripts[ti]
                        .description
                        .as_deref()
                        .map(|d| d.trim().to_lowercase())
                        .is_some_and(|d| !d.is_empty() && (d.contains(&wanted) || wanted.contains(&d)))
            })
        });
        match found {
            Some(ti) => {
                taken[ti] = true;
                pairs.push((ci, ti));
            }
            None => positional.push(ci),
        }
    }

    let mut remaining: Vec<usize> = (0..transcripts.len()).filter(|&ti| !taken[ti]).collect();
    remaining.sort_by_key(|&ti| {
        let start = transcripts[ti].started_at();
        (start.is_none(), start)
    });
    positional.sort_by_key(|&ci| {
        let start = candidates[ci].started_at;
        (start.is_none(), start)
    });
    pairs.extend(positional.into_iter().zip(remaining));
    pairs
}
