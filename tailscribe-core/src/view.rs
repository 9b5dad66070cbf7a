//! Conversation view model
//!
//! Holds the chunk sequence a consumer renders, merges pass results into
//! it by chunk id, and exposes a trailing window that grows on demand.
//!
//! Merging is idempotent: re-applying chunks the view already holds
//! produces an empty diff, and every chunk keeps its position once it
//! has been appended.

use crate::types::{Chunk, ChunkId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Default number of trailing chunks in the first window.
pub const DEFAULT_WINDOW_SIZE: usize = 200;

/// The chunks a consumer should render right now.
#[derive(Debug, Clone, Serialize)]
pub struct Window {
    pub chunks: Vec<Arc<Chunk>>,
    /// Total chunks in the conversation
    pub total: usize,
    /// Older chunks exist outside the window
    pub more_available: bool,
    /// Position of `chunks[0]` in the full sequence
    pub first_index: usize,
}

/// What a merge changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeDiff {
    /// Existing chunk ids whose content changed
    pub updated: Vec<ChunkId>,
    /// New chunk ids, in sequence order
    pub appended: Vec<ChunkId>,
    /// The view was rebuilt from scratch (source truncated)
    pub reset: bool,
}

impl MergeDiff {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.appended.is_empty() && !self.reset
    }

    /// Fold a later diff into this one. An id appended earlier and updated
    /// later stays reported as appended.
    pub fn absorb(&mut self, later: MergeDiff) {
        if later.reset {
            *self = later;
            return;
        }
        for id in later.updated {
            if !self.appended.contains(&id) && !self.updated.contains(&id) {
                self.updated.push(id);
            }
        }
        self.appended.extend(later.appended);
    }
}

/// Ordered chunk sequence with a growing trailing window.
#[derive(Debug, Clone)]
pub struct ConversationView {
    chunks: Vec<Arc<Chunk>>,
    index: HashMap<ChunkId, usize>,
    window_size: usize,
    expansions: usize,
}

impl Default for ConversationView {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl ConversationView {
    pub fn new(window_size: usize) -> Self {
        Self {
            chunks: Vec::new(),
            index: HashMap::new(),
            window_size: window_size.max(1),
            expansions: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Arc<Chunk>] {
        &self.chunks
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Chunk>> {
        self.index.get(id).and_then(|&i| self.chunks.get(i))
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    fn window_limit(&self) -> usize {
        self.window_size.saturating_mul(self.expansions + 1)
    }

    /// The most recent chunks, up to the current window limit.
    pub fn current_window(&self) -> Window {
        let total = self.chunks.len();
        let first_index = total.saturating_sub(self.window_limit());
        Window {
            chunks: self.chunks[first_index..].to_vec(),
            total,
            more_available: first_index > 0,
            first_index,
        }
    }

    /// Grow the window by one page of older chunks. Returns `false` when
    /// the window already covers the whole conversation.
    pub fn expand_window(&mut self) -> bool {
        if self.window_limit() >= self.chunks.len() {
            return false;
        }
        self.expansions += 1;
        true
    }

    /// Merge chunks from a parse pass by id.
    ///
    /// Known ids are replaced in place when their content differs; unknown
    /// ids are appended. The input is expected in sequence order.
    pub fn merge(&mut self, incoming: Vec<Arc<Chunk>>) -> MergeDiff {
        let mut diff = MergeDiff::default();
        for chunk in incoming {
            match self.index.get(&chunk.id) {
                Some(&i) => {
                    let current = &self.chunks[i];
                    if Arc::ptr_eq(current, &chunk) || current.as_ref() == chunk.as_ref() {
                        continue;
                    }
                    diff.updated.push(chunk.id.clone());
                    self.chunks[i] = chunk;
                }
                None => {
                    self.index.insert(chunk.id.clone(), self.chunks.len());
                    diff.appended.push(chunk.id.clone());
                    self.chunks.push(chunk);
                }
            }
        }
        diff
    }

    /// Replace the whole sequence, as after a truncation. The window goes
    /// back to its initial size.
    pub fn reset(&mut self, chunks: Vec<Arc<Chunk>>) -> MergeDiff {
        self.chunks.clear();
        self.index.clear();
        self.expansions = 0;
        let mut diff = self.merge(chunks);
        diff.reset = true;
        diff
    }
}
