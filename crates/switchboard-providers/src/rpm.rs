// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sliding-window RPM budget per provider, learning limits from response
//! headers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(65);
const PACE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct ProviderState {
    log: Vec<Instant>,
    learned_rpm: Option<u32>,
}

/// Tracks request timestamps and learned rate limits per provider, and
/// computes how long the caller should wait before the next request.
#[derive(Debug, Default)]
pub struct RpmPacer {
    state: Mutex<HashMap<String, ProviderState>>,
}

impl RpmPacer {
    pub fn new() -> Self {
        Self { state: Mutex::new(HashMap::new()) }
    }

    /// Records a request at `now`, pruning entries older than 65s.
    pub fn record(&self, provider: &str, now: Instant) {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(provider.to_string()).or_default();
        entry.log.push(now);
        entry.log.retain(|t| now.saturating_duration_since(*t) <= WINDOW);
    }

    /// Inspects response headers for a rate-limit hint and stores it if it
    /// parses as an integer in `(0, 10000)`.
    pub fn learn(&self, provider: &str, headers: &HashMap<String, String>) {
        const HEADER_NAMES: &[&str] = &[
            "x-ratelimit-limit-requests",
            "ratelimit-limit",
            "x-ratelimit-limit-requests-minute",
        ];
        for name in HEADER_NAMES {
            if let Some(value) = headers.get(*name) {
                if let Ok(n) = value.trim().parse::<u32>() {
                    if n > 0 && n < 10_000 {
                        let mut state = self.state.lock().unwrap();
                        state.entry(provider.to_string()).or_default().learned_rpm = Some(n);
                        return;
                    }
                }
            }
        }
    }

    fn safe_rpm(&self, provider: &str, pool_size: usize, default_rpm_per_key: u32) -> u32 {
        let state = self.state.lock().unwrap();
        let per_key_rpm = state
            .get(provider)
            .and_then(|s| s.learned_rpm)
            .unwrap_or(default_rpm_per_key);
        let raw = (pool_size as f64) * (per_key_rpm as f64) * 0.85;
        (raw.floor() as u32).max(1)
    }

    /// Computes how long to wait before the next request to `provider`,
    /// given its current pool size and per-key RPM.
    pub fn pace(&self, provider: &str, pool_size: usize, default_rpm_per_key: u32, now: Instant) -> u64 {
        let safe_rpm = self.safe_rpm(provider, pool_size, default_rpm_per_key);
        let (recent_count, oldest) = {
            let mut state = self.state.lock().unwrap();
            let entry = state.entry(provider.to_string()).or_default();
            entry.log.retain(|t| now.saturating_duration_since(*t) <= PACE_WINDOW);
            (entry.log.len(), entry.log.first().copied())
        };
        let ratio = recent_count as f64 / safe_rpm as f64;

        if ratio < 0.5 {
            return 0;
        }
        if ratio >= 1.0 {
            return match oldest {
                Some(oldest) => {
                    let elapsed = now.saturating_duration_since(oldest);
                    let remaining = PACE_WINDOW.saturating_sub(elapsed);
                    (remaining.as_millis() as u64).clamp(200, 2000)
                }
                None => 2000,
            };
        }
        let base = (60_000f64 / safe_rpm as f64).ceil();
        (base * (ratio - 0.5) / 0.35).round() as u64
    }
}
