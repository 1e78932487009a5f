// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `spec.md` §4.11: turn-level cancellation. A new turn supersedes the
//! previous one by bumping `current_id`; every await checkpoint inside
//! `AgenticLoop`/`StreamDecoder` compares its own id against `current()`
//! and abandons on mismatch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct RequestGate {
    current_id: Arc<AtomicU64>,
    cancel_flag: Arc<AtomicBool>,
}

impl RequestGate {
    pub fn new() -> Self {
        Self { current_id: Arc::new(AtomicU64::new(0)), cancel_flag: Arc::new(AtomicBool::new(false)) }
    }

    pub fn current(&self) -> u64 {
        self.current_id.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, my_id: u64) -> bool {
        self.current() == my_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    /// Supersedes the previous turn: pre-increments `current_id`, sets
    /// `cancel_flag`, invokes `cancel_generation` (the caller's hook into
    /// the active HTTP/native stream), yields ~50ms so the old loop
    /// observes the flag, then clears it and returns the new id.
    pub async fn begin_turn(&self, cancel_generation: impl FnOnce()) -> u64 {
        let new_id = self.current_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.cancel_flag.store(true, Ordering::SeqCst);
        cancel_generation();
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.cancel_flag.store(false, Ordering::SeqCst);
        new_id
    }
}

impl Default for RequestGate {
    fn default() -> Self {
        Self::new()
    }
}
