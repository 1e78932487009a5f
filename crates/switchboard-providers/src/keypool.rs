// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-provider round-robin key pool with per-key cooldowns.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct ApiKey {
    value: String,
    cooldown_until: Instant,
}

#[derive(Debug, Default)]
struct PoolState {
    keys: Vec<ApiKey>,
    cursor: usize,
}

/// Status snapshot returned by `KeyPool::status`.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub per_key_remaining_s: Vec<f64>,
}

/// Round-robin key pool, one instance per provider set (keyed internally by
/// provider id so a single `KeyPool` can back the whole `CloudDispatcher`).
///
/// Invariants upheld: keys unique by string value per provider; cursor
/// always in `[0, len)`; `cooldown_until` only ever extended, never
/// shortened (`spec.md` §3 ApiKey).
#[derive(Debug, Default)]
pub struct KeyPool {
    pools: Mutex<HashMap<String, PoolState>>,
}

impl KeyPool {
    pub fn new() -> Self {
        Self { pools: Mutex::new(HashMap::new()) }
    }

    /// Adds a key to `provider`'s pool. Rejects exact-string duplicates.
    pub fn add(&self, provider: &str, key: impl Into<String>) {
        let key = key.into();
        let mut pools = self.pools.lock().unwrap();
        let state = pools.entry(provider.to_string()).or_default();
        if state.keys.iter().any(|k| k.value == key) {
            return;
        }
        state.keys.push(ApiKey { value: key, cooldown_until: Instant::now() });
    }

    /// Walks the pool from `cursor`, wrapping once, returning the first key
    /// whose cooldown has expired and advancing cursor past it.
    pub fn acquire(&self, provider: &str) -> Option<String> {
        let mut pools = self.pools.lock().unwrap();
        let state = pools.get_mut(provider)?;
        let len = state.keys.len();
        if len == 0 {
            return None;
        }
        let now = Instant::now();
        for step in 0..len {
            let idx = (state.cursor + step) % len;
            if state.keys[idx].cooldown_until <= now {
                state.cursor = (idx + 1) % len;
                return Some(state.keys[idx].value.clone());
            }
        }
        let shortest_wait = state
            .keys
            .iter()
            .map(|k| k.cooldown_until.saturating_duration_since(now))
            .min()
            .unwrap_or_default();
        debug!(provider, wait_s = shortest_wait.as_secs_f64(), "all keys cooling down");
        None
    }

    /// Extends `key`'s cooldown to at least `now + duration`; never
    /// shortens an existing cooldown.
    pub fn cool_down(&self, provider: &str, key: &str, duration: Duration) {
        let mut pools = self.pools.lock().unwrap();
        if let Some(state) = pools.get_mut(provider) {
            let target = Instant::now() + duration;
            for k in state.keys.iter_mut() {
                if k.value == key && target > k.cooldown_until {
                    k.cooldown_until = target;
                }
            }
        }
    }

    pub fn status(&self, provider: &str) -> PoolStatus {
        let pools = self.pools.lock().unwrap();
        let Some(state) = pools.get(provider) else {
            return PoolStatus { total: 0, available: 0, per_key_remaining_s: Vec::new() };
        };
        let now = Instant::now();
        let per_key_remaining_s = state
            .keys
            .iter()
            .map(|k| k.cooldown_until.saturating_duration_since(now).as_secs_f64())
            .collect::<Vec<_>>();
        let available = per_key_remaining_s.iter().filter(|s| **s <= 0.0).count();
        PoolStatus { total: state.keys.len(), available, per_key_remaining_s }
    }

    pub fn pool_size(&self, provider: &str) -> usize {
        self.pools.lock().unwrap().get(provider).map(|s| s.keys.len()).unwrap_or(0)
    }
}
