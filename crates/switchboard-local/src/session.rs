// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The state `LocalEngine` owns for one loaded model: native handles,
//! the probed wrapper, and the KV-cache reuse metadata.

use switchboard_providers::ChatHistory;

/// Opaque, stable reference to a native object (model, context, sequence,
/// or chat) owned by the blocking thread that created it. The handle
/// itself never crosses the native library's "one exclusive owner" rule —
/// `LocalEngine` holds the real `llama_cpp_2` objects behind its own lock
/// and only ever touches them from within `spawn_blocking`; this id is
/// what the async side uses to tell "my handles" from "a handle issued
/// before the last reload".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

/// Opaque token-window metadata allowing KV-cache reuse on the next
/// generation. Invalidated whenever the history is mutated in a way
/// inconsistent with the cached prefix (`spec.md` §3 EvalCache).
#[derive(Debug, Clone)]
pub struct EvalCache {
    /// Number of tokens from the start of the cached chat history whose KV
    /// state is still valid.
    pub n_past: usize,
    /// Token count hashed so we can detect whether `n_past` tokens of the
    /// new prompt are a byte-for-byte prefix match of what was cached.
    pub prefix_fingerprint: u64,
}

impl EvalCache {
    pub fn empty() -> Self {
        Self { n_past: 0, prefix_fingerprint: 0 }
    }

    /// Checks the cached prefix against a freshly serialized prompt,
    /// returning the cache if and only if it is still a valid prefix.
    pub fn reuse_if_valid(&self, new_fingerprint: u64, new_len: usize) -> Option<usize> {
        if self.prefix_fingerprint == new_fingerprint && self.n_past <= new_len {
            Some(self.n_past)
        } else {
            None
        }
    }
}

/// `spec.md` §3 LocalSession: the bundle of handles plus session-level
/// metadata. All four handles share one exclusive owner (`LocalEngine`);
/// any handle here is assumed alive for as long as the containing
/// `LocalSession` value exists.
#[derive(Debug, Clone)]
pub struct LocalSession {
    pub model_handle: HandleId,
    pub context_handle: HandleId,
    pub sequence_handle: HandleId,
    pub chat_handle: HandleId,
    pub wrapper_name: String,
    pub flash_attention: bool,
    pub n_tokens: usize,
    pub context_size: usize,
    pub last_evaluation: Option<EvalCache>,
}

impl LocalSession {
    pub fn invalidate_cache(&mut self) {
        self.last_evaluation = None;
    }

    /// Fingerprints a chat history's serialized prompt for `EvalCache`
    /// prefix comparison. A cheap FNV-1a hash is enough here: this guards
    /// an optimization (skip re-decoding a shared prefix), not
    /// correctness, so collisions only cost a redundant decode.
    pub fn fingerprint(history: &ChatHistory) -> u64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        for turn in history.turns() {
            for byte in format!("{turn:?}").bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_providers::ChatTurn;

    fn sample_session() -> LocalSession {
        LocalSession {
            model_handle: HandleId(1),
            context_handle: HandleId(2),
            sequence_handle: HandleId(3),
            chat_handle: HandleId(4),
            wrapper_name: "chatml".into(),
            flash_attention: true,
            n_tokens: 10,
            context_size: 8192,
            last_evaluation: Some(EvalCache { n_past: 10, prefix_fingerprint: 42 }),
        }
    }

    #[test]
    fn invalidate_cache_clears_last_evaluation() {
        let mut session = sample_session();
        session.invalidate_cache();
        assert!(session.last_evaluation.is_none());
    }

    #[test]
    fn eval_cache_reuse_requires_matching_fingerprint() {
        let cache = EvalCache { n_past: 5, prefix_fingerprint: 7 };
        assert_eq!(cache.reuse_if_valid(7, 10), Some(5));
        assert_eq!(cache.reuse_if_valid(8, 10), None);
    }

    #[test]
    fn eval_cache_reuse_rejects_when_cached_longer_than_new() {
        let cache = EvalCache { n_past: 20, prefix_fingerprint: 7 };
        assert_eq!(cache.reuse_if_valid(7, 10), None);
    }

    #[test]
    fn fingerprint_is_stable_for_identical_history() {
        let mut h1 = ChatHistory::new();
        h1.push(ChatTurn::System("sys".into()));
        h1.push(ChatTurn::user("hi"));
        let mut h2 = ChatHistory::new();
        h2.push(ChatTurn::System("sys".into()));
        h2.push(ChatTurn::user("hi"));
        assert_eq!(LocalSession::fingerprint(&h1), LocalSession::fingerprint(&h2));
    }

    #[test]
    fn fingerprint_differs_for_different_history() {
        let mut h1 = ChatHistory::new();
        h1.push(ChatTurn::System("sys".into()));
        let mut h2 = ChatHistory::new();
        h2.push(ChatTurn::System("other".into()));
        assert_ne!(LocalSession::fingerprint(&h1), LocalSession::fingerprint(&h2));
    }

    #[test]
    fn empty_eval_cache_has_zero_n_past() {
        assert_eq!(EvalCache::empty().n_past, 0);
    }
}
