// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Extractive, no-LLM-call session summary (`spec.md` §4.10): tracks the
//! original goal, plan items parsed from model prose, the tool-call
//! ledger, and key results, rendering a bounded-size digest for session
//! rotation and the compaction ladder's handoff message.

use regex::Regex;
use switchboard_providers::{ChatTurn, Segment, ToolCall};

#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub text: String,
    pub completed: bool,
}

#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool: String,
    pub params_summary: String,
}

#[derive(Debug, Clone, Default)]
pub struct Summarizer {
    goal: Option<String>,
    plan: Vec<PlanStep>,
    tool_log: Vec<ToolCallRecord>,
    key_results: Vec<String>,
}

const KEY_RESULT_MARKERS: &[&str] = &["success", "failed", "error", "http://", "https://", "/"];
const CHARS_PER_TOKEN: usize = 4;

impl Summarizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk a full history once, populating goal/plan/tool log/key results.
    /// Idempotent: intended to be called with the live history each time a
    /// summary is requested rather than incrementally maintained.
    pub fn observe(&mut self, turns: &[ChatTurn]) {
        self.goal = None;
        self.plan.clear();
        self.tool_log.clear();
        self.key_results.clear();

        for turn in turns {
            match turn {
                ChatTurn::User { text, .. } => {
                    if self.goal.is_none() {
                        self.goal = Some(text.clone());
                    }
                }
                ChatTurn::Model(segments) => {
                    for segment in segments {
                        match segment {
                            Segment::Text(text) => {
                                self.absorb_plan_items(text);
                                self.absorb_key_results(text);
                            }
                            Segment::ToolCall { name, params } => {
                                self.tool_log.push(ToolCallRecord {
                                    tool: name.clone(),
                                    params_summary: compress_params(params),
                                });
                            }
                            Segment::Thought(_) => {}
                        }
                    }
                }
                ChatTurn::System(_) => {}
            }
        }
    }

    pub fn record_tool_call(&mut self, call: &ToolCall) {
        self.tool_log.push(ToolCallRecord {
            tool: call.name.clone(),
            params_summary: compress_params(&serde_json::to_value(&call.params).unwrap_or_default()),
        });
    }

    fn absorb_plan_items(&mut self, text: &str) {
        let checklist = Regex::new(r"(?m)^\s*[-*]\s*\[( |x|X)\]\s*(.+)$").unwrap();
        for caps in checklist.captures_iter(text) {
            let completed = caps[1].eq_ignore_ascii_case("x");
            let item = caps[2].trim().to_string();
            if let Some(existing) = self.plan.iter_mut().find(|p| p.text == item) {
                existing.completed = existing.completed || completed;
            } else {
                self.plan.push(PlanStep { text: item, completed });
            }
        }
        let numbered = Regex::new(r"(?m)^\s*\d+[.)]\s+(.+)$").unwrap();
        for caps in numbered.captures_iter(text) {
            let item = caps[1].trim().to_string();
            if !self.plan.iter().any(|p| p.text == item) {
                self.plan.push(PlanStep { text: item, completed: false });
            }
        }
    }

    fn absorb_key_results(&mut self, text: &str) {
        for line in text.lines() {
            let lower = line.to_lowercase();
            if KEY_RESULT_MARKERS.iter().any(|m| lower.contains(m)) && !line.trim().is_empty() {
                self.key_results.push(line.trim().to_string());
            }
        }
    }

    /// A short digest (<=500 tokens) for frequent, cheap status checks.
    pub fn quick_summary(&self) -> String {
        self.generate_summary(500)
    }

    /// Renders the full digest, truncating from the least-essential
    /// section (key results, then tool log) until it fits `max_tokens`.
    pub fn generate_summary(&self, max_tokens: usize) -> String {
        let budget_chars = max_tokens * CHARS_PER_TOKEN;

        let mut sections = Vec::new();
        if let Some(goal) = &self.goal {
            sections.push(format!("Goal: {goal}"));
        }
        if !self.plan.is_empty() {
            let done = self.plan.iter().filter(|p| p.completed).count();
            sections.push(format!("Plan ({done}/{} complete):", self.plan.len()));
            for step in &self.plan {
                let mark = if step.completed { "x" } else { " " };
                sections.push(format!("  [{mark}] {}", step.text));
            }
        }
        if !self.tool_log.is_empty() {
            sections.push(format!("Tool calls ({}):", self.tool_log.len()));
            for record in self.tool_log.iter().rev().take(20).rev() {
                sections.push(format!("  {} {}", record.tool, record.params_summary));
            }
        }
        if !self.key_results.is_empty() {
            sections.push("Key results:".to_string());
            for result in &self.key_results {
                sections.push(format!("  {result}"));
            }
        }

        let mut text = sections.join("\n");
        while text.len() > budget_chars && !self.key_results.is_empty() {
            if let Some(pos) = text.rfind("Key results:") {
                text.truncate(pos);
            } else {
                break;
            }
        }
        if text.len() > budget_chars {
            text.truncate(budget_chars);
        }
        text
    }
}

fn compress_params(params: &serde_json::Value) -> String {
    let s = params.to_string();
    if s.len() > 80 {
        format!("{}...", &s[..80])
    } else {
        s
    }
}
