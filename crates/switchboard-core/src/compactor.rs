// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Percentage-of-context-window compaction ladder (`spec.md` §4.8). Each
//! phase is strictly more aggressive than the last and they apply
//! cumulatively as the ratio climbs; the system prompt and the original
//! user message are never dropped.

use regex::Regex;
use switchboard_providers::{ChatHistory, ChatTurn};

const PHASE1_THRESHOLD: f32 = 0.60;
const PHASE2_THRESHOLD: f32 = 0.70;
const PHASE3_THRESHOLD: f32 = 0.80;
const PHASE4_THRESHOLD: f32 = 0.85;

const SNIPPET_LEN: usize = 120;
const TOOL_RESULT_COMPRESS_THRESHOLD: usize = 400;
const PHASE2_TAIL_EXCHANGES: usize = 6;
const PHASE3_TAIL_EXCHANGES: usize = 2;

#[derive(Debug, Clone, Default)]
pub struct CompactionReport {
    pub phases_applied: Vec<u8>,
    pub tokens_before: usize,
    pub tokens_after: usize,
    /// `spec.md` §4.8 phase 4: past 85%, signal the caller should rotate
    /// to a fresh session (capped by the caller at 10 rotations/turn).
    pub should_rotate: bool,
}

pub struct ContextCompactor;

impl ContextCompactor {
    /// Runs every phase whose threshold the current ratio clears, in
    /// order, re-measuring the ratio after each phase since compaction
    /// itself lowers it.
    pub fn compact(history: &mut ChatHistory, context_total: usize) -> CompactionReport {
        let tokens_before = history.approx_tokens();
        let mut phases_applied = Vec::new();

        if ratio(history, context_total) > PHASE1_THRESHOLD {
            compress_tool_results(history);
            phases_applied.push(1);
        }
        if ratio(history, context_total) > PHASE2_THRESHOLD {
            prune_oldest_half_beyond_tail(history, PHASE2_TAIL_EXCHANGES);
            phases_applied.push(2);
        }
        if ratio(history, context_total) > PHASE3_THRESHOLD {
            aggressive_prune(history, PHASE3_TAIL_EXCHANGES);
            phases_applied.push(3);
        }
        let should_rotate = ratio(history, context_total) > PHASE4_THRESHOLD;

        CompactionReport { phases_applied, tokens_before, tokens_after: history.approx_tokens(), should_rotate }
    }
}

fn ratio(history: &ChatHistory, context_total: usize) -> f32 {
    if context_total == 0 {
        return 0.0;
    }
    history.approx_tokens() as f32 / context_total as f32
}

/// Groups turns into a leading `head` (all `System` turns, wherever they
/// appear) and a sequence of `exchanges`: each exchange starts at a `User`
/// turn and absorbs every following turn up to (not including) the next
/// `User` turn.
fn split_exchanges(turns: &[ChatTurn]) -> (Vec<ChatTurn>, Vec<Vec<ChatTurn>>) {
    let mut head = Vec::new();
    let mut exchanges: Vec<Vec<ChatTurn>> = Vec::new();
    for turn in turns {
        match turn {
            ChatTurn::System(_) => head.push(turn.clone()),
            ChatTurn::User { .. } => exchanges.push(vec![turn.clone()]),
            ChatTurn::Model(_) => match exchanges.last_mut() {
                Some(exchange) => exchange.push(turn.clone()),
                None => head.push(turn.clone()),
            },
        }
    }
    (head, exchanges)
}

fn join_exchanges(head: Vec<ChatTurn>, exchanges: Vec<Vec<ChatTurn>>) -> Vec<ChatTurn> {
    let mut out = head;
    out.extend(exchanges.into_iter().flatten());
    out
}

/// Phase 2 (>70%): keep the most recent `tail_len` exchanges untouched and
/// drop the oldest half of everything older than that, in full.
fn prune_oldest_half_beyond_tail(history: &mut ChatHistory, tail_len: usize) {
    let (head, exchanges) = split_exchanges(history.turns());
    if exchanges.len() <= tail_len {
        return;
    }
    let split = exchanges.len() - tail_len;
    let (older, tail) = exchanges.split_at(split);
    let drop_count = older.len() / 2;
    let mut kept: Vec<Vec<ChatTurn>> = older[drop_count..].to_vec();
    kept.extend(tail.to_vec());
    history.replace(join_exchanges(head, kept));
}

/// Phase 3 (>80%): shrink the untouched tail to `tail_len` and, for every
/// exchange older than that, drop every non-`User` turn (the assistant's
/// reply and any tool traffic), keeping only the user's original ask.
fn aggressive_prune(history: &mut ChatHistory, tail_len: usize) {
    let (head, exchanges) = split_exchanges(history.turns());
    if exchanges.len() <= tail_len {
        return;
    }
    let split = exchanges.len() - tail_len;
    let (older, tail) = exchanges.split_at(split);
    let mut kept: Vec<Vec<ChatTurn>> = older
        .iter()
        .map(|exchange| exchange.iter().filter(|t| matches!(t, ChatTurn::User { .. })).cloned().collect())
        .collect();
    kept.extend(tail.to_vec());
    history.replace(join_exchanges(head, kept));
}

fn tool_result_regex() -> Regex {
    Regex::new(r"(?s)<!--tool-result:([^:>]+):([^:>]+?)(:compressed)?-->\n?(.*?)<!--/tool-result-->").unwrap()
}

/// Phase 1 (>60%): replace each embedded tool-result block longer than
/// [`TOOL_RESULT_COMPRESS_THRESHOLD`] chars with a `{tool, status, snippet}`
/// placeholder. Marked `:compressed` so a later pass is a no-op.
fn compress_tool_results(history: &mut ChatHistory) {
    let re = tool_result_regex();
    let turns: Vec<ChatTurn> = history
        .turns()
        .iter()
        .map(|turn| match turn {
            ChatTurn::User { text, images } => ChatTurn::User { text: compress_text(&re, text), images: images.clone() },
            other => other.clone(),
        })
        .collect();
    history.replace(turns);
}

fn compress_text(re: &Regex, text: &str) -> String {
    re.replace_all(text, |caps: &regex::Captures| {
        let tool = &caps[1];
        let status = &caps[2];
        let already_compressed = caps.get(3).is_some();
        let content = &caps[4];
        if already_compressed || content.len() <= TOOL_RESULT_COMPRESS_THRESHOLD {
            caps[0].to_string()
        } else {
            let snippet: String = content.chars().take(SNIPPET_LEN).collect();
            format!("<!--tool-result:{tool}:{status}:compressed-->\n{snippet}...<!--/tool-result-->")
        }
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_block(tool: &str, status: &str, len: usize) -> String {
        format!("<!--tool-result:{tool}:{status}-->\n{}<!--/tool-result-->", "x".repeat(len))
    }

    #[test]
    fn compress_leaves_short_blocks_untouched() {
        let re = tool_result_regex();
        let text = tool_block("grep", "ok", 50);
        assert_eq!(compress_text(&re, &text), text);
    }

    #[test]
    fn compress_shrinks_long_blocks_and_marks_them() {
        let re = tool_result_regex();
        let text = tool_block("grep", "ok", 1000);
        let out = compress_text(&re, &text);
        assert!(out.contains(":compressed-->"));
        assert!(out.len() < text.len());
    }

    #[test]
    fn compress_is_idempotent_on_already_compressed_block() {
        let re = tool_result_regex();
        let once = compress_text(&re, &tool_block("grep", "ok", 1000));
        let twice = compress_text(&re, &once);
        assert_eq!(once, twice);
    }

    fn history_with_exchanges(n: usize) -> ChatHistory {
        let mut h = ChatHistory::new();
        h.push(ChatTurn::System("you are a helpful agent".into()));
        for i in 0..n {
            h.push(ChatTurn::user(format!("question {i}")));
            h.push(ChatTurn::model_text(format!("answer {i}")));
        }
        h
    }

    #[test]
    fn phase1_never_touches_system_or_model_turns() {
        let mut h = history_with_exchanges(1);
        h.push(ChatTurn::user(tool_block("grep", "ok", 1000)));
        compress_tool_results(&mut h);
        assert!(matches!(h.first(), Some(ChatTurn::System(_))));
    }

    #[test]
    fn phase2_keeps_tail_and_drops_oldest_half_of_older_exchanges() {
        let mut h = history_with_exchanges(10);
        prune_oldest_half_beyond_tail(&mut h, 6);
        let (_, exchanges) = split_exchanges(h.turns());
        // 4 older exchanges, oldest half (2) dropped, leaves 2 + 6 tail = 8
        assert_eq!(exchanges.len(), 8);
        assert!(matches!(&exchanges[0][0], ChatTurn::User { text, .. } if text == "question 2"));
    }

    #[test]
    fn phase2_is_noop_when_within_tail() {
        let mut h = history_with_exchanges(3);
        let before = h.len();
        prune_oldest_half_beyond_tail(&mut h, 6);
        assert_eq!(h.len(), before);
    }

    #[test]
    fn phase3_drops_model_turns_from_older_exchanges_but_keeps_user_text() {
        let mut h = history_with_exchanges(5);
        aggressive_prune(&mut h, 2);
        let (_, exchanges) = split_exchanges(h.turns());
        assert_eq!(exchanges.len(), 5);
        assert_eq!(exchanges[0].len(), 1);
        assert!(matches!(&exchanges[0][0], ChatTurn::User { .. }));
        // tail exchanges keep both turns
        assert_eq!(exchanges[4].len(), 2);
    }

    #[test]
    fn compact_never_drops_system_prompt() {
        let mut h = history_with_exchanges(40);
        ContextCompactor::compact(&mut h, 10);
        assert!(matches!(h.first(), Some(ChatTurn::System(_))));
    }

    #[test]
    fn compact_applies_no_phases_below_threshold() {
        let mut h = history_with_exchanges(1);
        let report = ContextCompactor::compact(&mut h, 1_000_000);
        assert!(report.phases_applied.is_empty());
        assert!(!report.should_rotate);
    }

    #[test]
    fn compact_signals_rotate_past_phase4_threshold() {
        let mut h = history_with_exchanges(100);
        let report = ContextCompactor::compact(&mut h, 10);
        assert!(report.should_rotate);
    }

    #[test]
    fn compact_reports_tokens_before_and_after() {
        let mut h = history_with_exchanges(40);
        let report = ContextCompactor::compact(&mut h, 50);
        assert!(report.tokens_before >= report.tokens_after);
    }
}
