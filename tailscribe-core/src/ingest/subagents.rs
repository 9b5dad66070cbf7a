//! Subagent attribution
//!
//! A tool call named `Task` or `Agent` spawns a subagent. Until its result
//! comes back, messages the subagent emits belong to it rather than to the
//! top-level turn. Several subagents can run at once and nest to any depth,
//! so the resolver keeps an explicit stack of active spawns instead of a
//! single cursor, and never recurses over the tree.
//!
//! ## Attribution order
//!
//! 1. A message carrying the result that completes an active subagent goes
//!    to that subagent's parent context (the spawn call lives there).
//! 2. A message whose `parentToolUseID` names an active subagent goes to it.
//! 3. A sidechain message goes to the innermost active subagent.
//! 4. Everything else is top-level.

use crate::types::Message;

/// Where a message belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    TopLevel,
    /// A subagent node in the tree of the assistant turn at `chunk`
    Subagent { chunk: usize, node: usize },
}

/// A spawned subagent that has not returned yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSubagent {
    pub call_id: String,
    /// Chunk index of the owning assistant turn
    pub chunk: usize,
    /// Arena index in that turn's subagent tree
    pub node: usize,
    /// Arena index of the enclosing subagent, if nested
    pub parent: Option<usize>,
}

impl ActiveSubagent {
    fn parent_context(&self) -> Attribution {
        match self.parent {
            Some(node) => Attribution::Subagent {
                chunk: self.chunk,
                node,
            },
            None => Attribution::TopLevel,
        }
    }
}

/// Active-subagent stack carried in the session's parse state.
#[derive(Debug, Clone, Default)]
pub struct SubagentResolver {
    active: Vec<ActiveSubagent>,
}

impl SubagentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide which context a message belongs to. Does not change state.
    pub fn attribute(&self, message: &Message) -> Attribution {
        for result in &message.tool_results {
            if let Some(active) = self.find(&result.call_id) {
                return active.parent_context();
            }
        }

        if let Some(active) = message
            .parent_tool_use_id
            .as_deref()
            .and_then(|id| self.find(id))
        {
            return Attribution::Subagent {
                chunk: active.chunk,
                node: active.node,
            };
        }

        if message.is_sidechain {
            if let Some(innermost) = self.active.last() {
                return Attribution::Subagent {
                    chunk: innermost.chunk,
                    node: innermost.node,
                };
            }
        }

        Attribution::TopLevel
    }

    /// Push a new spawn. Returns the nodes of siblings that are still
    /// running in the same context, which makes them all parallel.
    pub fn push(&mut self, spawn: ActiveSubagent) -> Vec<usize> {
        let running_siblings = self
            .active
            .iter()
            .filter(|a| a.chunk == spawn.chunk && a.parent == spawn.parent)
            .map(|a| a.node)
            .collect();
        self.active.push(spawn);
        running_siblings
    }

    /// Remove a completed spawn wherever it sits in the stack.
    pub fn complete(&mut self, call_id: &str) -> Option<ActiveSubagent> {
        let pos = self.active.iter().rposition(|a| a.call_id == call_id)?;
        Some(self.active.remove(pos))
    }

    /// Drop every active spawn owned by a chunk that just closed.
    pub fn close_chunk(&mut self, chunk: usize) -> Vec<ActiveSubagent> {
        let (closed, kept): (Vec<_>, Vec<_>) = self
            .active
            .drain(..)
            .partition(|a| a.chunk == chunk);
        self.active = kept;
        closed
    }

    pub fn is_active(&self, call_id: &str) -> bool {
        self.find(call_id).is_some()
    }

    /// Number of subagents currently running.
    pub fn depth(&self) -> usize {
        self.active.len()
    }

    pub fn active(&self) -> &[ActiveSubagent] {
        &self.active
    }

    fn find(&self, call_id: &str) -> Option<&ActiveSubagent> {
        self.active.iter().rev().find(|a| a.call_id == call_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ByteSpan, MessageKind, Role, TokenUsage, ToolResult};

    fn message(sidechain: bool, parent: Option<&str>, results: &[&str]) -> Message {
        Message {
            id: "m".to_string(),
            kind: if results.is_empty() {
                MessageKind::Assistant
            } else {
                MessageKind::ToolResult
            },
            role: Role::Assistant,
            timestamp: None,
            content: String::new(),
            thinking: None,
            model: None,
            usage: TokenUsage::default(),
            cost_usd: 0.0,
            duration_ms: 0,
            tool_calls: Vec::new(),
            tool_results: results
                .iter()
                .map(|id| ToolResult {
                    call_id: id.to_string(),
                    content: String::new(),
                    is_error: false,
                    agent_id: None,
                })
                .collect(),
            parent_tool_use_id: parent.map(String::from),
            is_sidechain: sidechain,
            stop_reason: None,
            discriminant: None,
            tokens_freed: None,
            is_compact_summary: false,
            span: ByteSpan::default(),
        }
    }

    fn spawn(call_id: &str, node: usize, parent: Option<usize>) -> ActiveSubagent {
        ActiveSubagent {
            call_id: call_id.to_string(),
            chunk: 1,
            node,
            parent,
        }
    }

    #[test]
    fn test_no_active_subagent_is_top_level() {
        let resolver = SubagentResolver::new();
        assert_eq!(
            resolver.attribute(&message(true, Some("x"), &[])),
            Attribution::TopLevel
        );
    }

    #[test]
    fn test_sidechain_goes_to_innermost() {
        let mut resolver = SubagentResolver::new();
        resolver.push(spawn("outer", 0, None));
        resolver.push(spawn("inner", 1, Some(0)));

        assert_eq!(
            resolver.attribute(&message(true, None, &[])),
            Attribution::Subagent { chunk: 1, node: 1 }
        );
        assert_eq!(
            resolver.attribute(&message(false, None, &[])),
            Attribution::TopLevel
        );
    }

    #[test]
    fn test_explicit_parent_beats_stack_order() {
        let mut resolver = SubagentResolver::new();
        resolver.push(spawn("a", 0, None));
        resolver.push(spawn("b", 1, None));

        assert_eq!(
            resolver.attribute(&message(true, Some("a"), &[])),
            Attribution::Subagent { chunk: 1, node: 0 }
        );
    }

    #[test]
    fn test_completion_attributes_to_parent_context() {
        let mut resolver = SubagentResolver::new();
        resolver.push(spawn("outer", 0, None));
        resolver.push(spawn("inner", 1, Some(0)));

        // inner's result belongs to outer, outer's result to the top level
        assert_eq!(
            resolver.attribute(&message(true, None, &["inner"])),
            Attribution::Subagent { chunk: 1, node: 0 }
        );
        assert_eq!(
            resolver.attribute(&message(false, None, &["outer"])),
            Attribution::TopLevel
        );
    }

    #[test]
    fn test_parallel_siblings_reported() {
        let mut resolver = SubagentResolver::new();
        assert!(resolver.push(spawn("a", 0, None)).is_empty());
        assert_eq!(resolver.push(spawn("b", 1, None)), vec![0]);
        // A nested spawn under `a` is not a sibling of `b`
        assert!(resolver.push(spawn("c", 2, Some(0))).is_empty());
    }

    #[test]
    fn test_complete_out_of_order() {
        let mut resolver = SubagentResolver::new();
        resolver.push(spawn("a", 0, None));
        resolver.push(spawn("b", 1, None));

        let done = resolver.complete("a").unwrap();
        assert_eq!(done.node, 0);
        assert!(!resolver.is_active("a"));
        assert!(resolver.is_active("b"));
        assert!(resolver.complete("a").is_none());
    }

    #[test]
    fn test_deep_nesting_uses_stack() {
        let mut resolver = SubagentResolver::new();
        for depth in 0usize..2_000 {
            let parent = depth.checked_sub(1);
            resolver.push(ActiveSubagent {
                call_id: format!("s{depth}"),
                chunk: 0,
                node: depth,
                parent,
            });
        }
        assert_eq!(resolver.depth(), 2_000);
        assert_eq!(
            resolver.attribute(&message(true, None, &[])),
            Attribution::Subagent { chunk: 0, node: 1_999 }
        );
    }

    #[test]
    fn test_close_chunk_drains_only_that_chunk() {
        let mut resolver = SubagentResolver::new();
        resolver.push(spawn("a", 0, None));
        resolver.push(ActiveSubagent {
            call_id: "z".to_string(),
            chunk: 7,
            node: 0,
            parent: None,
        });
        let closed = resolver.close_chunk(1);
        assert_eq!(closed.len(), 1);
        assert_eq!(resolver.active().len(), 1);
        assert!(resolver.is_active("z"));
    }
}
