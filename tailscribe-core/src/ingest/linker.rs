//! Tool call ↔ result pairing
//!
//! The linker is a table from call id to the place its [`ToolExecution`]
//! lives in the chunk sequence. It lives in the session's parse state and
//! survives across passes, so a call seen in one pass pairs with a result
//! that arrives in a later one.
//!
//! [`ToolExecution`]: crate::types::ToolExecution

use std::collections::HashMap;

/// Which execution list inside a chunk holds an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecOwner {
    /// The assistant turn's own list
    Turn,
    /// A subagent node, by arena index
    Subagent(usize),
}

/// Address of an execution: chunk index, owning list, slot in that list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecLocation {
    pub chunk: usize,
    pub owner: ExecOwner,
    pub slot: usize,
}

/// What to do with an incoming tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The call is pending at this location; attach the result there
    Completes(ExecLocation),
    /// The call already has a result; ignore this one
    Duplicate(ExecLocation),
    /// No call with this id was ever seen
    Orphaned,
}

/// Pending/completed call table carried across parse passes.
#[derive(Debug, Clone, Default)]
pub struct ToolLinker {
    pending: HashMap<String, ExecLocation>,
    completed: HashMap<String, ExecLocation>,
}

impl ToolLinker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly seen call.
    pub fn register_call(&mut self, call_id: &str, at: ExecLocation) {
        if let Some(previous) = self.pending.insert(call_id.to_string(), at) {
            tracing::warn!(
                call_id,
                previous_chunk = previous.chunk,
                chunk = at.chunk,
                "Tool call id reused while still pending, tracking the newer call"
            );
        }
    }

    /// Look up a result's call and move it from pending to completed.
    ///
    /// A call only ever moves forward: a second result for a completed
    /// call yields [`Resolution::Duplicate`] and changes nothing.
    pub fn resolve(&mut self, call_id: &str) -> Resolution {
        if let Some(at) = self.pending.remove(call_id) {
            self.completed.insert(call_id.to_string(), at);
            return Resolution::Completes(at);
        }
        if let Some(at) = self.completed.get(call_id) {
            tracing::warn!(call_id, chunk = at.chunk, "Duplicate tool result ignored");
            return Resolution::Duplicate(*at);
        }
        Resolution::Orphaned
    }

    pub fn is_pending(&self, call_id: &str) -> bool {
        self.pending.contains_key(call_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Pending call ids, sorted for stable output.
    pub fn pending_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.pending.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(chunk: usize, slot: usize) -> ExecLocation {
        ExecLocation {
            chunk,
            owner: ExecOwner::Turn,
            slot,
        }
    }

    #[test]
    fn test_pending_then_completed() {
        let mut linker = ToolLinker::new();
        linker.register_call("t1", at(1, 0));
        assert!(linker.is_pending("t1"));

        assert_eq!(linker.resolve("t1"), Resolution::Completes(at(1, 0)));
        assert!(!linker.is_pending("t1"));
        assert_eq!(linker.pending_count(), 0);
    }

    #[test]
    fn test_unknown_result_is_orphaned() {
        let mut linker = ToolLinker::new();
        assert_eq!(linker.resolve("t2"), Resolution::Orphaned);
        // Still orphaned on a repeat; nothing was registered
        assert_eq!(linker.resolve("t2"), Resolution::Orphaned);
    }

    #[test]
    fn test_completed_never_reverts() {
        let mut linker = ToolLinker::new();
        linker.register_call("t1", at(3, 2));
        linker.resolve("t1");
        assert_eq!(linker.resolve("t1"), Resolution::Duplicate(at(3, 2)));
        assert!(!linker.is_pending("t1"));
    }

    #[test]
    fn test_table_survives_clone_across_passes() {
        let mut first_pass = ToolLinker::new();
        first_pass.register_call("a", at(0, 0));
        first_pass.register_call("b", at(0, 1));

        let mut second_pass = first_pass.clone();
        assert_eq!(second_pass.pending_ids(), vec!["a", "b"]);
        assert_eq!(second_pass.resolve("b"), Resolution::Completes(at(0, 1)));
    }
}
