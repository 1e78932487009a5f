// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Ground-truth ledger of what actually happened during a turn, used to
//! contradict hallucinated claims in model output (`Hallucination`
//! failures) and to drive write-deferral/fabrication auto-correction.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default)]
pub struct DomainAttempts {
    pub attempts: u32,
    pub failures: u32,
}

/// `extend_gathered_data` caps `data_extracted` at this many entries,
/// evicting the oldest first. A multi-hour cloud session gathering data
/// the whole time would otherwise grow this `Vec` without bound.
const MAX_GATHERED_DATA_ENTRIES: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    pub urls_visited: Vec<String>,
    pub files_created: Vec<String>,
    pub files_edited: Vec<String>,
    /// Real data snippets gathered this turn (`gatheredWebData`), consulted
    /// by fabrication auto-correction and write-deferral messages. Capped
    /// at `MAX_GATHERED_DATA_ENTRIES`, oldest evicted first.
    pub data_extracted: Vec<String>,
    pub searches: Vec<String>,
    pub blocked_domains: HashSet<String>,
    pub domain_attempts: HashMap<String, DomainAttempts>,
    /// One-shot set per turn: files that fabrication auto-correction has
    /// already verified, so the same path is never re-checked twice.
    pub completeness_checked_files: HashSet<String>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_url_visit(&mut self, url: impl Into<String>) {
        self.urls_visited.push(url.into());
    }

    pub fn record_file_created(&mut self, path: impl Into<String>) {
        self.files_created.push(path.into());
    }

    pub fn record_file_edited(&mut self, path: impl Into<String>) {
        self.files_edited.push(path.into());
    }

    pub fn record_search(&mut self, query: impl Into<String>) {
        self.searches.push(query.into());
    }

    /// Appends real data gathered from a tool result (`gatheredWebData`),
    /// evicting the oldest entries past `MAX_GATHERED_DATA_ENTRIES`.
    pub fn extend_gathered_data(&mut self, snippets: impl IntoIterator<Item = String>) {
        self.data_extracted.extend(snippets);
        if self.data_extracted.len() > MAX_GATHERED_DATA_ENTRIES {
            let overflow = self.data_extracted.len() - MAX_GATHERED_DATA_ENTRIES;
            self.data_extracted.drain(0..overflow);
        }
    }

    pub fn record_domain_attempt(&mut self, domain: impl Into<String>, failed: bool) {
        let entry = self.domain_attempts.entry(domain.into()).or_default();
        entry.attempts += 1;
        if failed {
            entry.failures += 1;
        }
    }

    pub fn block_domain(&mut self, domain: impl Into<String>) {
        self.blocked_domains.insert(domain.into());
    }

    pub fn is_domain_blocked(&self, domain: &str) -> bool {
        self.blocked_domains.contains(domain)
    }

    /// Marks a file path checked by fabrication auto-correction this turn,
    /// returning whether it was already checked.
    pub fn mark_completeness_checked(&mut self, path: impl Into<String>) -> bool {
        !self.completeness_checked_files.insert(path.into())
    }

    /// True if `claimed_url` does not appear anywhere in this turn's
    /// visited-URL ledger — the `Hallucination` check of `spec.md` §7.
    pub fn contradicts_claimed_url(&self, claimed_url: &str) -> bool {
        !self.urls_visited.iter().any(|u| u == claimed_url)
    }

    /// Overlap check used by fabrication auto-correction: does any
    /// gathered-data snippet share a substring of length >= `min_len` with
    /// `content`? (`spec.md` §4.7: "overlap by substring of snippets of
    /// length >= 6".)
    pub fn has_data_overlap(&self, content: &str, min_len: usize) -> bool {
        self.data_extracted.iter().any(|snippet| substring_overlap(snippet, content, min_len))
    }
}

fn substring_overlap(snippet: &str, content: &str, min_len: usize) -> bool {
    if snippet.len() < min_len {
        return false;
    }
    let snippet_bytes = snippet.as_bytes();
    for window in snippet_bytes.windows(min_len) {
        if let Ok(needle) = std::str::from_utf8(window) {
            if content.contains(needle) {
                return true;
            }
        }
    }
    false
}
