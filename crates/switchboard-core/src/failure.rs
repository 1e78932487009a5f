// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The failure taxonomy of `spec.md` §7: one classification per observed
//! response shape, each carrying a severity and a concrete recovery
//! action `AgenticLoop` executes.

use switchboard_tools::ExecutionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Inject a correction prompt, up to 3 per turn.
    Nudge,
    /// Terminate the turn outright.
    Stop,
    /// Resolved silently; the caller never sees an error.
    Transparent,
    /// Surfaced to the UI with no fallback.
    Terminal,
    /// Recoverable via compaction/rotation.
    Recoverable,
    /// Abort the turn and ask the UI to reload.
    Fatal,
    /// Continue with reduced functionality.
    Degrade,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FailureKind {
    #[error("model returned an empty response")]
    Empty,
    #[error("model response is stuttering/repeating")]
    Repetition,
    #[error("model response is incoherent")]
    Incoherent,
    #[error("model described an action without emitting the tool call")]
    DescribedNotExecuted,
    #[error("model refused the request")]
    Refusal,
    #[error("model claimed a result for {claimed_url} that ExecutionState never recorded")]
    Hallucination { claimed_url: String },
    #[error("plan has outstanding steps but the model emitted no tool call")]
    NoToolsWhenExpected,
    #[error("provider rate limit hit")]
    RateLimit,
    #[error("provider quota exhausted")]
    QuotaExceeded,
    #[error("transient provider error")]
    Transient,
    #[error("context window overflow")]
    ContextOverflow,
    #[error("unrecoverable failure")]
    Fatal,
    #[error("all wrapper probes failed")]
    WrapperProbeAllFail,
}

impl FailureKind {
    pub fn severity(&self) -> Severity {
        match self {
            FailureKind::Empty => Severity::Nudge,
            FailureKind::Repetition => Severity::Stop,
            FailureKind::Incoherent => Severity::Stop,
            FailureKind::DescribedNotExecuted => Severity::Nudge,
            FailureKind::Refusal => Severity::Nudge,
            FailureKind::Hallucination { .. } => Severity::Nudge,
            FailureKind::NoToolsWhenExpected => Severity::Nudge,
            FailureKind::RateLimit => Severity::Transparent,
            FailureKind::QuotaExceeded => Severity::Terminal,
            FailureKind::Transient => Severity::Transparent,
            FailureKind::ContextOverflow => Severity::Recoverable,
            FailureKind::Fatal => Severity::Fatal,
            FailureKind::WrapperProbeAllFail => Severity::Degrade,
        }
    }

    /// The correction prompt text injected for `Severity::Nudge` cases.
    pub fn nudge_text(&self) -> Option<String> {
        match self {
            FailureKind::DescribedNotExecuted => Some("Output the JSON tool call NOW".to_string()),
            FailureKind::Refusal => Some("force-grammar: narrow the tool set to match user intent".to_string()),
            FailureKind::Hallucination { claimed_url } => {
                Some(format!("[VERIFICATION FAILURE] claimed result not found in ExecutionState: {claimed_url}"))
            }
            FailureKind::NoToolsWhenExpected => Some("plan has incomplete items; continue executing them".to_string()),
            FailureKind::Empty => Some("retry with KV cache disabled and thoughtTokenBudget=0".to_string()),
            _ => None,
        }
    }

    /// Only `Fatal` and `QuotaExceeded` should propagate as an error to the
    /// turn caller; everything else resolves in-loop (`spec.md` §7
    /// propagation policy).
    pub fn propagates_to_caller(&self) -> bool {
        matches!(self, FailureKind::Fatal | FailureKind::QuotaExceeded)
    }
}

/// Stutter-repetition detector: "≥3 stutter words per 6-word window or an
/// 80-char tail appears earlier ≥5x" (`spec.md` §7 `Repetition`).
pub fn detect_repetition(text: &str) -> bool {
    let words: Vec<&str> = text.split_whitespace().collect();
    for window in words.windows(6) {
        let mut counts = std::collections::HashMap::new();
        for w in window {
            *counts.entry(*w).or_insert(0u32) += 1;
        }
        if counts.values().any(|&c| c >= 3) {
            return true;
        }
    }
    if text.len() >= 80 {
        let tail = &text[text.len() - 80..];
        if text.matches(tail).count() >= 5 {
            return true;
        }
    }
    false
}

const REFUSAL_PHRASES: &[&str] = &[
    "i can't help with that",
    "i cannot help with that",
    "i'm not able to",
    "i am unable to",
    "i won't be able to",
    "as an ai language model, i cannot",
];

pub fn detect_refusal(text: &str) -> bool {
    let lower = text.to_lowercase();
    REFUSAL_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

const DATA_LIKE_FIELDS: &[&str] = &["price", "product", "listing", "sku", "quantity", "rating", "review"];

/// Whether a `write_file` success's content looks data-like enough to run
/// fabrication auto-correction against (`spec.md` §4.7).
pub fn looks_data_like(content: &str) -> bool {
    let lower = content.to_lowercase();
    DATA_LIKE_FIELDS.iter().any(|f| lower.contains(f))
}

/// Checks a claimed URL against the turn's `ExecutionState`, producing a
/// `Hallucination` classification when it was never actually visited.
pub fn check_hallucination(claimed_url: &str, state: &ExecutionState) -> Option<FailureKind> {
    if state.contradicts_claimed_url(claimed_url) {
        Some(FailureKind::Hallucination { claimed_url: claimed_url.to_string() })
    } else {
        None
    }
}

const CONTEXT_OVERFLOW_MARKERS: &[&str] = &["context", "too long", "compress", "disposed"];

pub fn classify_native_error(message: &str) -> Option<FailureKind> {
    let lower = message.to_lowercase();
    if lower.contains("model disposed") || lower.contains("model not loaded") {
        return Some(FailureKind::Fatal);
    }
    if CONTEXT_OVERFLOW_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(FailureKind::ContextOverflow);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping_matches_table() {
        assert_eq!(FailureKind::Empty.severity(), Severity::Nudge);
        assert_eq!(FailureKind::Repetition.severity(), Severity::Stop);
        assert_eq!(FailureKind::QuotaExceeded.severity(), Severity::Terminal);
        assert_eq!(FailureKind::Fatal.severity(), Severity::Fatal);
        assert_eq!(FailureKind::WrapperProbeAllFail.severity(), Severity::Degrade);
    }

    #[test]
    fn only_fatal_and_quota_exceeded_propagate() {
        assert!(FailureKind::Fatal.propagates_to_caller());
        assert!(FailureKind::QuotaExceeded.propagates_to_caller());
        assert!(!FailureKind::Transient.propagates_to_caller());
        assert!(!FailureKind::ContextOverflow.propagates_to_caller());
    }

    #[test]
    fn detect_repetition_flags_stutter_window() {
        assert!(detect_repetition("the the the cat sat down"));
    }

    #[test]
    fn detect_repetition_false_for_normal_text() {
        assert!(!detect_repetition("the quick brown fox jumps over the lazy dog"));
    }

    #[test]
    fn detect_repetition_flags_repeated_tail() {
        let tail = "x".repeat(80);
        let text = format!("{tail} prefix {tail} prefix {tail} prefix {tail} prefix {tail}");
        assert!(detect_repetition(&text));
    }

    #[test]
    fn detect_refusal_matches_known_phrase() {
        assert!(detect_refusal("I can't help with that request."));
    }

    #[test]
    fn detect_refusal_false_for_compliant_text() {
        assert!(!detect_refusal("Sure, here is the code you asked for."));
    }

    #[test]
    fn looks_data_like_detects_price_field() {
        assert!(looks_data_like("Product: Widget, Price: $9.99"));
    }

    #[test]
    fn looks_data_like_false_for_prose() {
        assert!(!looks_data_like("This is a design document describing the architecture."));
    }

    #[test]
    fn check_hallucination_flags_unvisited_url() {
        let state = ExecutionState::new();
        assert!(check_hallucination("https://example.com", &state).is_some());
    }

    #[test]
    fn check_hallucination_clears_when_visited() {
        let mut state = ExecutionState::new();
        state.record_url_visit("https://example.com");
        assert!(check_hallucination("https://example.com", &state).is_none());
    }

    #[test]
    fn classify_native_error_detects_fatal() {
        assert_eq!(classify_native_error("Model disposed"), Some(FailureKind::Fatal));
    }

    #[test]
    fn classify_native_error_detects_context_overflow() {
        assert_eq!(classify_native_error("context too long, please compress"), Some(FailureKind::ContextOverflow));
    }

    #[test]
    fn classify_native_error_none_for_unrelated_message() {
        assert_eq!(classify_native_error("connection reset"), None);
    }

    #[test]
    fn nudge_text_present_for_described_not_executed() {
        assert!(FailureKind::DescribedNotExecuted.nudge_text().is_some());
    }

    #[test]
    fn nudge_text_absent_for_stop_severity() {
        assert!(FailureKind::Repetition.nudge_text().is_none());
    }
}
