//! Byte sources
//!
//! The orchestrator only needs one capability from wherever transcripts
//! live: "give me the bytes of session X from offset N, at most M of
//! them". [`LocalFileSource`] serves files on disk; [`MemorySource`] keeps
//! transcripts in memory and is handy for tests and replay. Sources may
//! also hold the separate transcripts of a session's subagents.

use crate::error::{Error, Result};
use crate::ingest::agents;
use crate::types::SessionId;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Glob (relative to the Claude root) matching session transcripts.
pub const CLAUDE_SESSION_PATTERN: &str = "projects/*/*.jsonl";

/// Bytes read from a source, plus what was known about it at read time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceRead {
    pub bytes: Vec<u8>,
    /// Source offset of `bytes[0]`
    pub start: u64,
    /// Source length at read time
    pub total_len: u64,
    pub modified_at: Option<DateTime<Utc>>,
    /// More bytes were available than the read limit allowed
    pub capped: bool,
}

impl SourceRead {
    /// Offset just past the returned bytes.
    pub fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }

    /// The source is shorter than the requested offset.
    pub fn is_truncated(&self) -> bool {
        self.total_len < self.start
    }
}

/// Bounded random-access reads of session transcripts.
pub trait ByteSource: Send + Sync {
    /// Read at most `max_bytes` starting at `offset`.
    ///
    /// An offset past the end is not an error: the read comes back empty
    /// with `total_len` telling the caller the source shrank.
    fn read_from(&self, session: &SessionId, offset: u64, max_bytes: u64) -> io::Result<SourceRead>;

    /// Where the session lives, when that means anything for this source.
    fn location(&self, _session: &SessionId) -> Option<PathBuf> {
        None
    }

    /// Ids of the subagent transcripts stored alongside the session, sorted.
    fn agent_ids(&self, _session: &SessionId) -> io::Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// The whole transcript of one of the session's subagents.
    fn read_agent(&self, session: &SessionId, agent_id: &str) -> io::Result<Vec<u8>> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no transcript for agent {} of session {}", agent_id, session),
        ))
    }
}

fn not_found(session: &SessionId) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no source registered for session {}", session),
    )
}

// ============================================
// Local files
// ============================================

/// Transcripts stored as local JSONL files.
#[derive(Debug, Default)]
pub struct LocalFileSource {
    paths: RwLock<HashMap<SessionId, PathBuf>>,
}

impl LocalFileSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a session id to a transcript file.
    pub fn register(&self, session: SessionId, path: impl Into<PathBuf>) {
        self.paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session, path.into());
    }

    /// Register a file under its stem and return the derived id.
    pub fn register_path(&self, path: &Path) -> Option<SessionId> {
        let id = session_id_for(path)?;
        self.register(id.clone(), path);
        Some(id)
    }

    /// Session id registered for a path, if any.
    pub fn session_for(&self, path: &Path) -> Option<SessionId> {
        self.paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(_, p)| p.as_path() == path)
            .map(|(id, _)| id.clone())
    }

    /// Find every session transcript under a Claude data root and register
    /// it. Returns the ids found, sorted.
    pub fn discover(&self, root: &Path) -> Result<Vec<SessionId>> {
        let pattern = root.join(CLAUDE_SESSION_PATTERN);
        let entries = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| Error::Config(format!("invalid glob pattern: {}", e)))?;

        let mut found = Vec::new();
        for path in entries.flatten() {
            if let Some(id) = self.register_path(&path) {
                found.push(id);
            }
        }
        found.sort();
        tracing::debug!(root = %root.display(), sessions = found.len(), "Discovered transcripts");
        Ok(found)
    }

    fn path_of(&self, session: &SessionId) -> Option<PathBuf> {
        self.paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session)
            .cloned()
    }
}

/// Session id for a transcript path: the file stem. Subagent transcripts
/// are not sessions.
pub fn session_id_for(path: &Path) -> Option<SessionId> {
    if agents::is_agent_file(path) {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(SessionId::from)
}

impl ByteSource for LocalFileSource {
    fn read_from(&self, session: &SessionId, offset: u64, max_bytes: u64) -> io::Result<SourceRead> {
        let path = self.path_of(session).ok_or_else(|| not_found(session))?;
        let mut file = File::open(&path)?;
        let metadata = file.metadata()?;
        let total_len = metadata.len();
        let modified_at = metadata.modified().ok().map(DateTime::<Utc>::from);

        let mut read = SourceRead {
            start: offset,
            total_len,
            modified_at,
            ..Default::default()
        };
        if offset >= total_len {
            return Ok(read);
        }

        let available = total_len - offset;
        let want = available.min(max_bytes);
        file.seek(SeekFrom::Start(offset))?;
        file.take(want).read_to_end(&mut read.bytes)?;
        read.capped = available > want;
        Ok(read)
    }

    fn location(&self, session: &SessionId) -> Option<PathBuf> {
        self.path_of(session)
    }

    fn agent_ids(&self, session: &SessionId) -> io::Result<Vec<String>> {
        let path = self.path_of(session).ok_or_else(|| not_found(session))?;
        agents::list_agent_ids(&path)
    }

    fn read_agent(&self, session: &SessionId, agent_id: &str) -> io::Result<Vec<u8>> {
        let path = self
            .path_of(session)
            .and_then(|p| agents::agent_path(&p, agent_id))
            .ok_or_else(|| not_found(session))?;
        std::fs::read(path)
    }
}

// ============================================
// In-memory
// ============================================

#[derive(Debug, Default, Clone)]
struct MemoryEntry {
    bytes: Vec<u8>,
    modified_at: Option<DateTime<Utc>>,
    agents: BTreeMap<String, Vec<u8>>,
}

/// Transcripts held in memory. Writers append or truncate; readers see
/// the state at the moment of the read.
#[derive(Debug, Default)]
pub struct MemorySource {
    entries: RwLock<HashMap<SessionId, MemoryEntry>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes, creating the session if needed.
    pub fn append(&self, session: &SessionId, bytes: &[u8]) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(session.clone())
            .or_default()
            .bytes
            .extend_from_slice(bytes);
    }

    /// Cut a session back to `len` bytes.
    pub fn truncate(&self, session: &SessionId, len: usize) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(session) {
            entry.bytes.truncate(len);
        }
    }

    /// Set the modification time reported by reads.
    pub fn set_modified(&self, session: &SessionId, at: DateTime<Utc>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.entry(session.clone()).or_default().modified_at = Some(at);
    }

    /// Store a subagent transcript for a session.
    pub fn add_agent(&self, session: &SessionId, agent_id: &str, bytes: &[u8]) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(session.clone())
            .or_default()
            .agents
            .insert(agents::normalize_agent_id(agent_id).to_string(), bytes.to_vec());
    }

    pub fn len(&self, session: &SessionId) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session)
            .map_or(0, |e| e.bytes.len())
    }
}

impl ByteSource for MemorySource {
    fn read_from(&self, session: &SessionId, offset: u64, max_bytes: u64) -> io::Result<SourceRead> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(session).ok_or_else(|| not_found(session))?;
        let total_len = entry.bytes.len() as u64;

        let mut read = SourceRead {
            start: offset,
            total_len,
            modified_at: entry.modified_at,
            ..Default::default()
        };
        if offset >= total_len {
            return Ok(read);
        }
        let available = total_len - offset;
        let want = available.min(max_bytes);
        let start = offset as usize;
        read.bytes = entry.bytes[start..start + want as usize].to_vec();
        read.capped = available > want;
        Ok(read)
    }

    fn agent_ids(&self, session: &SessionId) -> io::Result<Vec<String>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(session).ok_or_else(|| not_found(session))?;
        Ok(entry.agents.keys().cloned().collect())
    }

    fn read_agent(&self, session: &SessionId, agent_id: &str) -> io::Result<Vec<u8>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(session)
            .and_then(|e| e.agents.get(agents::normalize_agent_id(agent_id)))
            .cloned()
            .ok_or_else(|| not_found(session))
    }
}
