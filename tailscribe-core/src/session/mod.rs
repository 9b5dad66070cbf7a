//! Session orchestration
//!
//! The [`Orchestrator`] owns one slot per open session. A slot holds the
//! session's parse continuation, the last merged view, and its liveness
//! bookkeeping. External change sources call [`Orchestrator::handle_change`];
//! consumers read [`Orchestrator::current_window`] and listen on
//! [`Orchestrator::subscribe`].
//!
//! ## Pass lifecycle
//!
//! ```text
//! Idle ──change──► Parsing ──ok──► merge, revision += 1 (if anything changed) ──► Idle
//!                     │
//!                     └──I/O error──► ParseFailed event, offset unchanged ──► Idle
//! ```
//!
//! At most one pass per session runs at a time. A change that arrives
//! while a pass is in flight sets a re-run flag and returns immediately;
//! the running pass loops once more before going idle. Different sessions
//! never wait on each other beyond a registry lookup.
//!
//! The view sits behind its own lock and is written once per pass, after
//! the pass is fully computed, so window reads never see a partial merge
//! and never wait on source I/O.

pub mod liveness;
pub mod source;

pub use liveness::{Clock, ManualClock, SystemClock};
pub use source::{ByteSource, LocalFileSource, MemorySource, SourceRead};

use crate::config::Config;
use crate::context::{self, ContextStats};
use crate::db::OffsetCache;
use crate::error::{Error, Result};
use crate::ingest::{AgentTranscript, SessionParseState};
use crate::logging;
use crate::types::{Liveness, SessionId};
use crate::view::{ConversationView, MergeDiff, Window};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// ============================================
// Configuration and events
// ============================================

/// Tunables for an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub window_size: usize,
    /// A session is active while its last data-bearing merge is this recent
    pub liveness_timeout: Duration,
    pub max_line_bytes: usize,
    /// Upper bound on one source read
    pub max_read_bytes: u64,
    /// Move focus to the most recently active session automatically
    pub follow_active: bool,
    /// Buffered events per subscriber before the slowest one lags
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            window_size: config.view.window_size,
            liveness_timeout: config.liveness.timeout(),
            max_line_bytes: config.parser.max_line_bytes,
            max_read_bytes: config.parser.max_read_bytes,
            follow_active: config.liveness.follow_active,
            event_capacity: 256,
        }
    }
}

/// Notifications published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A pass changed the view
    Merged {
        session_id: SessionId,
        revision: u64,
        diff: MergeDiff,
    },
    /// A pass failed; the offset was not advanced
    ParseFailed { session_id: SessionId, error: String },
    LivenessChanged {
        session_id: SessionId,
        liveness: Liveness,
    },
    /// Follow mode moved focus to another session
    FocusRedirected {
        from: Option<SessionId>,
        to: SessionId,
    },
}

/// What a call to [`Orchestrator::handle_change`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOutcome {
    /// One or more passes ran and were merged
    Applied(PassReport),
    /// A pass was already in flight; it will run again to pick this up
    Coalesced,
    /// The session was closed while the pass ran; nothing was merged
    Discarded,
}

impl ChangeOutcome {
    pub fn report(&self) -> Option<&PassReport> {
        match self {
            ChangeOutcome::Applied(report) => Some(report),
            _ => None,
        }
    }
}

/// Summary of the passes run for one change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassReport {
    pub passes: usize,
    /// Revision after the last pass
    pub revision: u64,
    /// Combined diff of every pass
    pub diff: MergeDiff,
    /// Undecodable lines skipped
    pub warnings: usize,
    /// Offset after the last pass
    pub offset: u64,
}

/// Point-in-time facts about an open session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub revision: u64,
    pub offset: u64,
    pub liveness: Liveness,
    pub last_activity: Option<DateTime<Utc>>,
    pub chunk_count: usize,
    pub warning_count: usize,
    pub pending_calls: usize,
    pub active_subagents: usize,
}

// ============================================
// Session slots
// ============================================

#[derive(Debug, Default)]
struct SlotState {
    revision: u64,
    offset: u64,
    last_activity: Option<DateTime<Utc>>,
    liveness: Option<Liveness>,
    loaded: bool,
    chunk_count: usize,
    warning_count: usize,
    pending_calls: usize,
    active_subagents: usize,
}

struct SessionSlot {
    id: SessionId,
    parse: Mutex<SessionParseState>,
    view: RwLock<ConversationView>,
    state: Mutex<SlotState>,
    in_flight: AtomicBool,
    rerun: AtomicBool,
    closed: AtomicBool,
}

impl SessionSlot {
    fn new(id: SessionId, parse: SessionParseState, window_size: usize) -> Self {
        let state = SlotState {
            offset: parse.offset(),
            ..Default::default()
        };
        Self {
            id,
            parse: Mutex::new(parse),
            view: RwLock::new(ConversationView::new(window_size)),
            state: Mutex::new(state),
            in_flight: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of a single merged pass.
struct PassResult {
    diff: MergeDiff,
    revision: u64,
    warnings: usize,
    offset: u64,
    /// The read stopped at the size limit and the source has more bytes
    more: bool,
}

// ============================================
// Orchestrator
// ============================================

struct Inner {
    source: Arc<dyn ByteSource>,
    config: OrchestratorConfig,
    cache: Option<OffsetCache>,
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<SessionId, Arc<SessionSlot>>>,
    events: broadcast::Sender<SessionEvent>,
    followed: Mutex<Option<SessionId>>,
}

/// Builder for an [`Orchestrator`].
pub struct OrchestratorBuilder {
    source: Arc<dyn ByteSource>,
    config: OrchestratorConfig,
    cache: Option<OffsetCache>,
    clock: Arc<dyn Clock>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Seed new sessions from, and record offsets into, this cache.
    pub fn offset_cache(mut self, cache: OffsetCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Orchestrator {
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        Orchestrator {
            inner: Arc::new(Inner {
                source: self.source,
                config: self.config,
                cache: self.cache,
                clock: self.clock,
                sessions: Mutex::new(HashMap::new()),
                events,
                followed: Mutex::new(None),
            }),
        }
    }
}

/// Registry of open sessions and the driver of their parse passes.
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("sessions", &self.sessions())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder(source: Arc<dyn ByteSource>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            source,
            config: OrchestratorConfig::default(),
            cache: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Orchestrator with the system clock and no offset cache.
    pub fn new(source: Arc<dyn ByteSource>, config: OrchestratorConfig) -> Self {
        Self::builder(source).config(config).build()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    fn slot(&self, id: &SessionId) -> Result<Arc<SessionSlot>> {
        lock(&self.inner.sessions)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SessionNotOpen(id.to_string()))
    }

    fn slots(&self) -> Vec<Arc<SessionSlot>> {
        lock(&self.inner.sessions).values().cloned().collect()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Open ids, sorted.
    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = lock(&self.inner.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_open(&self, id: &SessionId) -> bool {
        lock(&self.inner.sessions).contains_key(id)
    }

    // ============================================
    // Lifecycle
    // ============================================

    /// Open a session and run its initial pass. Opening an open session
    /// just handles a change.
    pub fn open_session(&self, id: SessionId) -> Result<ChangeOutcome> {
        if !self.is_open(&id) {
            let parse = self.seed_state(&id);
            let offset = parse.offset();
            let slot = Arc::new(SessionSlot::new(
                id.clone(),
                parse,
                self.inner.config.window_size,
            ));
            let inserted = {
                let mut sessions = lock(&self.inner.sessions);
                match sessions.entry(id.clone()) {
                    std::collections::hash_map::Entry::Occupied(_) => false,
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(slot);
                        true
                    }
                }
            };
            if inserted {
                tracing::info!(session_id = %id, offset, "Session opened");
            }
        }
        self.handle_change(&id)
    }

    /// Evict a session. A pass still running for it finishes and is
    /// discarded. Returns whether the session was open.
    pub fn close_session(&self, id: &SessionId) -> bool {
        let Some(slot) = lock(&self.inner.sessions).remove(id) else {
            return false;
        };
        slot.closed.store(true, Ordering::SeqCst);
        let mut followed = lock(&self.inner.followed);
        if followed.as_ref() == Some(id) {
            *followed = None;
        }
        tracing::info!(session_id = %id, "Session closed");
        true
    }

    /// Initial parse state: resume from the cached offset when it is still
    /// valid for the source, else start cold.
    fn seed_state(&self, id: &SessionId) -> SessionParseState {
        let max_line_bytes = self.inner.config.max_line_bytes;
        let cold = SessionParseState::new(max_line_bytes);
        let Some(cache) = &self.inner.cache else {
            return cold;
        };

        let cached = match cache.load(id) {
            Ok(Some(cached)) => cached,
            Ok(None) => return cold,
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Offset cache lookup failed, parsing from start");
                return cold;
            }
        };

        match self.inner.source.read_from(id, cached.offset, 0) {
            Ok(read) if cached.is_valid_for(read.total_len) => {
                tracing::info!(session_id = %id, offset = cached.offset, "Resuming from cached offset");
                SessionParseState::resume_at(cached.offset, max_line_bytes)
            }
            Ok(read) => {
                tracing::warn!(
                    session_id = %id,
                    cached_offset = cached.offset,
                    cached_size = cached.file_size,
                    current_size = read.total_len,
                    "Cached offset is stale, parsing from start"
                );
                cold
            }
            Err(e) => {
                tracing::debug!(session_id = %id, error = %e, "Could not validate cached offset");
                cold
            }
        }
    }

    // ============================================
    // Parse passes
    // ============================================

    /// Re-check a session from its last offset and merge whatever is new.
    ///
    /// I/O failures leave the offset where it was, publish `ParseFailed`
    /// and return the error; the next change retries the same range.
    pub fn handle_change(&self, id: &SessionId) -> Result<ChangeOutcome> {
        let slot = self.slot(id)?;

        slot.rerun.store(true, Ordering::SeqCst);
        if slot.in_flight.swap(true, Ordering::SeqCst) {
            tracing::trace!(session_id = %id, "Pass in flight, change coalesced");
            return Ok(ChangeOutcome::Coalesced);
        }

        let mut report = PassReport::default();
        loop {
            slot.rerun.store(false, Ordering::SeqCst);
            let more = match self.run_pass(&slot) {
                Ok(Some(pass)) => {
                    report.passes += 1;
                    report.revision = pass.revision;
                    report.warnings += pass.warnings;
                    report.offset = pass.offset;
                    report.diff.absorb(pass.diff);
                    pass.more
                }
                Ok(None) => {
                    slot.in_flight.store(false, Ordering::SeqCst);
                    return Ok(ChangeOutcome::Discarded);
                }
                Err(e) => {
                    slot.in_flight.store(false, Ordering::SeqCst);
                    tracing::warn!(session_id = %id, error = %e, "Parse pass failed, offset unchanged");
                    self.emit(SessionEvent::ParseFailed {
                        session_id: id.clone(),
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            };

            if more || slot.rerun.load(Ordering::SeqCst) {
                continue;
            }
            slot.in_flight.store(false, Ordering::SeqCst);
            // A change that raced the release above must not be lost
            if slot.rerun.load(Ordering::SeqCst) && !slot.in_flight.swap(true, Ordering::SeqCst) {
                continue;
            }
            break;
        }

        if !report.diff.is_empty() {
            self.redirect_focus();
        }
        Ok(ChangeOutcome::Applied(report))
    }

    /// [`handle_change`](Self::handle_change) on the blocking pool, so
    /// several sessions can parse in parallel.
    pub async fn handle_change_async(&self, id: SessionId) -> Result<ChangeOutcome> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.handle_change(&id)).await?
    }

    fn read(&self, id: &SessionId, offset: u64) -> Result<SourceRead> {
        self.inner
            .source
            .read_from(id, offset, self.inner.config.max_read_bytes)
            .map_err(|e| Error::Source {
                session: id.to_string(),
                message: e.to_string(),
            })
    }

    /// One read → parse → merge cycle. `None` when the session was closed
    /// mid-pass and the result discarded.
    fn run_pass(&self, slot: &SessionSlot) -> Result<Option<PassResult>> {
        let id = &slot.id;
        let mut parse = lock(&slot.parse);
        let from = parse.offset();
        let _pass = logging::pass_span(id, from).entered();

        let mut read = self.read(id, from)?;
        let mut reset = false;
        if read.is_truncated() {
            let fresh = self.read(id, 0)?;
            tracing::warn!(
                len = read.total_len,
                "Source shrank below the parse offset, reparsing from the start"
            );
            parse.reset();
            read = fresh;
            reset = true;
        }

        let mut pass = parse.ingest(&read.bytes, read.start);
        if parse.awaits_transcripts() {
            let transcripts = self.agent_transcripts(id, &parse);
            pass.extend_touched(parse.attach_transcripts(transcripts));
        }
        if !pass.advanced() && read.capped {
            tracing::warn!(
                offset = read.start,
                limit = self.inner.config.max_read_bytes,
                "Line exceeds the read limit, skipping it"
            );
            parse.skip_to(read.end());
        }

        if slot.closed.load(Ordering::SeqCst) {
            tracing::debug!("Session closed mid-pass, discarding result");
            return Ok(None);
        }

        let diff = {
            let mut view = slot.view.write().unwrap_or_else(PoisonError::into_inner);
            if reset {
                view.reset(parse.chunks().to_vec())
            } else {
                view.merge(std::mem::take(&mut pass.touched))
            }
        };

        let now = self.inner.clock.now();
        let (revision, changed_liveness) = {
            let mut state = lock(&slot.state);
            if !diff.is_empty() {
                state.revision += 1;
                // The initial load reflects when the file was last written,
                // not when we happened to read it
                state.last_activity = Some(match (state.loaded, read.modified_at) {
                    (false, Some(modified)) => modified,
                    _ => now,
                });
            }
            state.loaded = true;
            state.offset = parse.offset();
            state.chunk_count = parse.chunks().len();
            state.warning_count = parse.warning_count();
            state.pending_calls = parse.builder().linker().pending_count();
            state.active_subagents = parse.builder().resolver().depth();

            let liveness = Liveness::from_last_activity(
                state.last_activity,
                now,
                self.inner.config.liveness_timeout,
            );
            let changed = state.liveness.replace(liveness) != Some(liveness);
            (state.revision, changed.then_some(liveness))
        };

        let to = parse.offset();
        drop(parse);

        if to != from || reset {
            self.store_offset(id, to, read.total_len);
        }

        tracing::debug!(
            to,
            revision,
            messages = pass.messages,
            appended = diff.appended.len(),
            updated = diff.updated.len(),
            "Pass merged"
        );

        if !diff.is_empty() {
            self.emit(SessionEvent::Merged {
                session_id: id.clone(),
                revision,
                diff: diff.clone(),
            });
        }
        if let Some(liveness) = changed_liveness {
            self.emit(SessionEvent::LivenessChanged {
                session_id: id.clone(),
                liveness,
            });
        }

        Ok(Some(PassResult {
            diff,
            revision,
            warnings: pass.warnings.len(),
            offset: to,
            more: read.capped && to != from,
        }))
    }

    /// Subagent transcripts the source holds for a session, minus those
    /// already attached. Unreadable ones are logged and left out.
    fn agent_transcripts(&self, id: &SessionId, parse: &SessionParseState) -> Vec<AgentTranscript> {
        let ids = match self.inner.source.agent_ids(id) {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list subagent transcripts");
                return Vec::new();
            }
        };
        ids.into_iter()
            .filter(|agent_id| !parse.builder().is_linked(agent_id))
            .filter_map(|agent_id| match self.inner.source.read_agent(id, &agent_id) {
                Ok(bytes) => Some(AgentTranscript::parse(&agent_id, &bytes, parse.max_line_bytes())),
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, error = %e, "Could not read subagent transcript");
                    None
                }
            })
            .collect()
    }

    fn store_offset(&self, id: &SessionId, offset: u64, file_size: u64) {
        let Some(cache) = &self.inner.cache else {
            return;
        };
        let location = self.inner.source.location(id);
        if let Err(e) = cache.store(id, offset, file_size, location.as_deref()) {
            tracing::warn!(session_id = %id, error = %e, "Failed to record offset");
        }
    }

    // ============================================
    // Consumer reads
    // ============================================

    /// The trailing window of the last merged snapshot. Never waits on a
    /// pass in progress beyond the instant of its merge.
    pub fn current_window(&self, id: &SessionId) -> Result<Window> {
        let slot = self.slot(id)?;
        let view = slot.view.read().unwrap_or_else(PoisonError::into_inner);
        Ok(view.current_window())
    }

    /// Context attribution over every merged chunk, not just the window.
    pub fn context_stats(&self, id: &SessionId) -> Result<Vec<ContextStats>> {
        let slot = self.slot(id)?;
        let view = slot.view.read().unwrap_or_else(PoisonError::into_inner);
        Ok(context::analyze(view.chunks()))
    }

    /// Grow a session's window by one page. Returns `false` when the window
    /// already covers everything.
    pub fn expand_window(&self, id: &SessionId) -> Result<bool> {
        let slot = self.slot(id)?;
        let mut view = slot.view.write().unwrap_or_else(PoisonError::into_inner);
        Ok(view.expand_window())
    }

    pub fn revision(&self, id: &SessionId) -> Result<u64> {
        Ok(lock(&self.slot(id)?.state).revision)
    }

    pub fn status(&self, id: &SessionId) -> Result<SessionStatus> {
        let slot = self.slot(id)?;
        let now = self.inner.clock.now();
        let state = lock(&slot.state);
        Ok(SessionStatus {
            session_id: slot.id.clone(),
            revision: state.revision,
            offset: state.offset,
            liveness: Liveness::from_last_activity(
                state.last_activity,
                now,
                self.inner.config.liveness_timeout,
            ),
            last_activity: state.last_activity,
            chunk_count: state.chunk_count,
            warning_count: state.warning_count,
            pending_calls: state.pending_calls,
            active_subagents: state.active_subagents,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    // ============================================
    // Liveness and focus
    // ============================================

    /// Liveness against the clock right now, whether or not the ticker has
    /// caught up.
    pub fn liveness(&self, id: &SessionId) -> Result<Liveness> {
        let slot = self.slot(id)?;
        let last = lock(&slot.state).last_activity;
        Ok(Liveness::from_last_activity(
            last,
            self.inner.clock.now(),
            self.inner.config.liveness_timeout,
        ))
    }

    /// Re-evaluate every session's liveness and publish the transitions.
    pub fn refresh_liveness(&self) -> Vec<(SessionId, Liveness)> {
        let now = self.inner.clock.now();
        let timeout = self.inner.config.liveness_timeout;
        let mut changed = Vec::new();

        for slot in self.slots() {
            let mut state = lock(&slot.state);
            if !state.loaded {
                continue;
            }
            let liveness = Liveness::from_last_activity(state.last_activity, now, timeout);
            if state.liveness.replace(liveness) != Some(liveness) {
                changed.push((slot.id.clone(), liveness));
            }
        }
        changed.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, liveness) in &changed {
            tracing::debug!(session_id = %id, liveness = liveness.as_str(), "Liveness changed");
            self.emit(SessionEvent::LivenessChanged {
                session_id: id.clone(),
                liveness: *liveness,
            });
        }
        self.redirect_focus();
        changed
    }

    /// The active session with the most recent data-bearing merge.
    pub fn most_recently_active(&self) -> Option<SessionId> {
        let now = self.inner.clock.now();
        let timeout = self.inner.config.liveness_timeout;
        self.slots()
            .into_iter()
            .filter_map(|slot| {
                let last = lock(&slot.state).last_activity?;
                (Liveness::from_last_activity(Some(last), now, timeout) == Liveness::Active)
                    .then(|| (last, slot.id.clone()))
            })
            .max()
            .map(|(_, id)| id)
    }

    /// Put focus on a session.
    pub fn follow(&self, id: SessionId) {
        *lock(&self.inner.followed) = Some(id);
    }

    pub fn followed(&self) -> Option<SessionId> {
        lock(&self.inner.followed).clone()
    }

    fn redirect_focus(&self) {
        if !self.inner.config.follow_active {
            return;
        }
        let Some(target) = self.most_recently_active() else {
            return;
        };
        let from = {
            let mut followed = lock(&self.inner.followed);
            if followed.as_ref() == Some(&target) {
                return;
            }
            followed.replace(target.clone())
        };
        tracing::info!(to = %target, "Following most recently active session");
        self.emit(SessionEvent::FocusRedirected { from, to: target });
    }

    /// Re-evaluate liveness every `period` on the current tokio runtime,
    /// independent of parse activity. Abort the handle to stop it.
    pub fn spawn_liveness_ticker(&self, period: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                this.refresh_liveness();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::testing::*;
    use crate::types::TurnStatus;

    fn setup(window_size: usize) -> (Orchestrator, Arc<MemorySource>, Arc<ManualClock>, SessionId) {
        let source = Arc::new(MemorySource::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = OrchestratorConfig {
            window_size,
            ..Default::default()
        };
        let orch = Orchestrator::builder(source.clone())
            .config(config)
            .clock(clock.clone())
            .build();
        (orch, source, clock, SessionId::new("s1"))
    }

    #[test]
    fn test_open_and_append() {
        let (orch, source, _clock, id) = setup(10);
        source.append(&id, &jsonl(&[user("u1", "hi"), assistant_call("a1", "t1", "Read")]));

        let outcome = orch.open_session(id.clone()).unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.diff.appended, vec!["u1", "a1"]);
        assert_eq!(report.revision, 1);

        source.append(&id, &jsonl(&[tool_result("r1", "t1", false)]));
        let report = orch.handle_change(&id).unwrap().report().cloned().unwrap();
        assert_eq!(report.diff.updated, vec!["a1"]);
        assert!(report.diff.appended.is_empty());
        assert_eq!(report.revision, 2);
        assert_eq!(orch.current_window(&id).unwrap().total, 2);
    }

    #[test]
    fn test_no_new_bytes_keeps_revision() {
        let (orch, source, _clock, id) = setup(10);
        source.append(&id, &jsonl(&[user("u1", "hi")]));
        orch.open_session(id.clone()).unwrap();

        let report = orch.handle_change(&id).unwrap().report().cloned().unwrap();
        assert!(report.diff.is_empty());
        assert_eq!(orch.revision(&id).unwrap(), 1);
    }

    #[test]
    fn test_unknown_session() {
        let (orch, _source, _clock, id) = setup(10);
        assert!(matches!(orch.handle_change(&id), Err(Error::SessionNotOpen(_))));
        assert!(orch.current_window(&id).is_err());
        assert!(!orch.close_session(&id));
    }

    #[test]
    fn test_liveness_decays_without_passes() {
        let (orch, source, clock, id) = setup(10);
        source.append(&id, &jsonl(&[user("u1", "hi")]));
        orch.open_session(id.clone()).unwrap();
        assert_eq!(orch.liveness(&id).unwrap(), Liveness::Active);

        let mut events = orch.subscribe();
        clock.advance(Duration::from_secs(31));
        assert_eq!(orch.liveness(&id).unwrap(), Liveness::Inactive);
        assert_eq!(
            orch.refresh_liveness(),
            vec![(id.clone(), Liveness::Inactive)]
        );
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::LivenessChanged {
                session_id: id.clone(),
                liveness: Liveness::Inactive
            }
        );
        // Only transitions are reported
        assert!(orch.refresh_liveness().is_empty());
    }

    #[test]
    fn test_initial_activity_comes_from_modification_time() {
        let (orch, source, clock, id) = setup(10);
        source.append(&id, &jsonl(&[user("u1", "hi")]));
        source.set_modified(&id, clock.now() - chrono::Duration::minutes(5));

        orch.open_session(id.clone()).unwrap();
        assert_eq!(orch.liveness(&id).unwrap(), Liveness::Inactive);
        assert_eq!(orch.most_recently_active(), None);

        source.append(&id, &jsonl(&[assistant_text("a1", "back again")]));
        orch.handle_change(&id).unwrap();
        assert_eq!(orch.liveness(&id).unwrap(), Liveness::Active);
        assert_eq!(orch.most_recently_active(), Some(id));
    }

    #[test]
    fn test_follow_mode_redirects_to_latest_activity() {
        let source = Arc::new(MemorySource::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let orch = Orchestrator::builder(source.clone())
            .config(OrchestratorConfig {
                follow_active: true,
                ..Default::default()
            })
            .clock(clock.clone())
            .build();

        let a = SessionId::new("a");
        let b = SessionId::new("b");
        source.append(&a, &jsonl(&[user("ua", "first")]));
        source.append(&b, &jsonl(&[user("ub", "second")]));

        orch.open_session(a.clone()).unwrap();
        assert_eq!(orch.followed(), Some(a.clone()));

        let mut events = orch.subscribe();
        clock.advance(Duration::from_secs(2));
        orch.open_session(b.clone()).unwrap();
        assert_eq!(orch.most_recently_active(), Some(b.clone()));
        assert_eq!(orch.followed(), Some(b.clone()));

        let redirected = std::iter::from_fn(|| events.try_recv().ok())
            .any(|e| e == SessionEvent::FocusRedirected { from: Some(a.clone()), to: b.clone() });
        assert!(redirected);
    }

    #[test]
    fn test_status_reports_parse_state() {
        let (orch, source, _clock, id) = setup(10);
        let bytes = jsonl(&[user("u1", "hi"), assistant_call("a1", "task-1", "Task")]);
        source.append(&id, &bytes);
        orch.open_session(id.clone()).unwrap();

        let status = orch.status(&id).unwrap();
        assert_eq!(status.offset, bytes.len() as u64);
        assert_eq!(status.chunk_count, 2);
        assert_eq!(status.pending_calls, 1);
        assert_eq!(status.active_subagents, 1);
    }

    #[test]
    fn test_subagent_transcript_attached_when_the_spawn_returns() {
        let (orch, source, _clock, id) = setup(10);
        source.append(&id, &jsonl(&[user("u1", "go"), assistant_call("a1", "task-1", "Task")]));
        source.add_agent(
            &id,
            "agent-x1",
            &jsonl(&[agent_prompt("p1", "look around"), assistant_text("s1", "found it")]),
        );
        orch.open_session(id.clone()).unwrap();

        source.append(&id, &jsonl(&[tool_result_agent("r1", "task-1", "x1")]));
        let report = orch.handle_change(&id).unwrap().report().cloned().unwrap();
        assert_eq!(report.diff.updated, vec!["a1"]);

        let window = orch.current_window(&id).unwrap();
        let turn = window.chunks[1].as_assistant_turn().unwrap();
        let process = &turn.subagents.nodes[0];
        assert_eq!(process.messages.len(), 2);
        assert_eq!(process.metrics.message_count, 2);
        assert_eq!(turn.status, TurnStatus::Complete);
    }

    #[test]
    fn test_capped_reads_continue_until_the_source_is_drained() {
        let lines = [
            user("u1", "first"),
            assistant_text("a1", "a reply long enough to need its own read"),
            user("u2", "second"),
        ];
        let longest = lines.iter().map(|l| l.len() + 1).max().unwrap() as u64;

        let source = Arc::new(MemorySource::new());
        let orch = Orchestrator::builder(source.clone())
            .config(OrchestratorConfig {
                max_read_bytes: longest + 10,
                ..Default::default()
            })
            .build();
        let id = SessionId::new("s1");
        let bytes = jsonl(&lines);
        source.append(&id, &bytes);

        let report = orch.open_session(id.clone()).unwrap().report().cloned().unwrap();
        assert!(report.passes > 1);
        assert_eq!(report.diff.appended, vec!["u1", "a1", "u2"]);
        assert_eq!(orch.current_window(&id).unwrap().total, 3);
        assert_eq!(orch.status(&id).unwrap().offset, bytes.len() as u64);
    }

    #[test]
    fn test_context_stats_cover_chunks_outside_the_window() {
        let (orch, source, _clock, id) = setup(1);
        source.append(
            &id,
            &jsonl(&[
                user("u1", &"q".repeat(40)),
                compact_boundary("c1", 9000),
                user("u2", "again"),
            ]),
        );
        orch.open_session(id.clone()).unwrap();
        assert_eq!(orch.current_window(&id).unwrap().chunks.len(), 1);

        let stats = orch.context_stats(&id).unwrap();
        let phases: Vec<u32> = stats.iter().map(|s| s.phase).collect();
        assert_eq!(phases, vec![1, 1, 2]);
        assert_eq!(stats[1].estimated_freed, Some(10));
        assert!(orch.context_stats(&SessionId::new("nope")).is_err());
    }
}
