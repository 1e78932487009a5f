// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wraps a `ChatHistory` with the token-budget bookkeeping `AgenticLoop`
//! needs: running approximate-token count, context fraction, and the
//! rollback checkpoint described in `spec.md` §4.7 step 4.

use switchboard_providers::{ChatHistory, ChatTurn};
use uuid::Uuid;

#[derive(Debug)]
pub struct AgentSession {
    pub id: String,
    pub history: ChatHistory,
    pub context_total: usize,
}

impl AgentSession {
    pub fn new(context_total: usize) -> Self {
        Self { id: Uuid::new_v4().to_string(), history: ChatHistory::new(), context_total }
    }

    pub fn push(&mut self, turn: ChatTurn) -> bool {
        self.history.push(turn)
    }

    /// Fraction of the context window consumed (0.0-1.0), the quantity
    /// `AgenticLoop` step 3 and `ContextCompactor` key off of.
    pub fn context_fraction(&self) -> f32 {
        if self.context_total == 0 {
            return 0.0;
        }
        (self.history.approx_tokens() as f32) / (self.context_total as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Checkpoint before generation (`spec.md` §4.7 step 4).
    pub fn checkpoint(&self) -> ChatHistory {
        self.history.snapshot()
    }

    /// Restore on `ROLLBACK` (`spec.md` §8: "After a ROLLBACK, chat_history
    /// ... equal the checkpoint taken just before generation").
    pub fn rollback(&mut self, checkpoint: ChatHistory) {
        self.history.restore(checkpoint);
    }

    /// Replace the history outright, used by compaction/rotation.
    pub fn replace_history(&mut self, history: ChatHistory) {
        self.history = history;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_has_unique_id() {
        let a = AgentSession::new(1000);
        let b = AgentSession::new(1000);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn new_session_starts_empty() {
        let s = AgentSession::new(1000);
        assert!(s.history.is_empty());
    }

    #[test]
    fn context_fraction_zero_when_empty() {
        let s = AgentSession::new(1000);
        assert_eq!(s.context_fraction(), 0.0);
    }

    #[test]
    fn context_fraction_zero_when_total_is_zero() {
        let s = AgentSession::new(0);
        assert_eq!(s.context_fraction(), 0.0);
    }

    #[test]
    fn context_fraction_increases_with_history() {
        let mut s = AgentSession::new(100);
        let before = s.context_fraction();
        s.push(ChatTurn::user("a reasonably long opening message from the user"));
        assert!(s.context_fraction() > before);
    }

    #[test]
    fn is_near_limit_true_once_over_threshold() {
        let mut s = AgentSession::new(4);
        s.push(ChatTurn::user("12345678901234567890"));
        assert!(s.is_near_limit(0.5));
    }

    #[test]
    fn checkpoint_and_rollback_restore_prior_state() {
        let mut s = AgentSession::new(1000);
        s.push(ChatTurn::user("first"));
        let checkpoint = s.checkpoint();
        s.push(ChatTurn::model_text("reply"));
        s.rollback(checkpoint);
        assert_eq!(s.history.len(), 1);
    }

    #[test]
    fn replace_history_swaps_contents() {
        let mut s = AgentSession::new(1000);
        s.push(ChatTurn::user("first"));
        let mut other = ChatHistory::new();
        other.push(ChatTurn::System("summary".into()));
        s.replace_history(other);
        assert_eq!(s.history.len(), 1);
        assert!(matches!(s.history.first(), Some(ChatTurn::System(_))));
    }
}
