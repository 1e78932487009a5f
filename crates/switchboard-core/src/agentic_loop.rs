// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The per-turn orchestrator (`spec.md` §4.7): generate, classify,
//! execute tools, nudge, and repeat until the model produces a turn with
//! nothing left to do, the turn is cancelled, or a termination condition
//! fires.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use switchboard_providers::{ChatHistory, ChatTurn, GenerateRequest, ModelProvider, Segment, ToolCall, Usage};
use switchboard_tools::{ExecutionState, PipelineOptions, ToolExecutor, ToolPipeline};
use tracing::{debug, warn};

use crate::events::AgentEvent;
use crate::failure::{self, FailureKind, Severity};
use crate::session::AgentSession;
use crate::summarizer::Summarizer;

const NUDGE_BUDGET_PER_TURN: u8 = 3;
const ROLLBACK_RETRY_BUDGET: u8 = 3;
const STUCK_WINDOW: usize = 20;
const DATA_OVERLAP_MIN_LEN: usize = 6;
/// `spec.md` §4.8 phase 4: a turn that keeps tripping the rotation
/// threshold after rotating gives up rather than rotating forever.
const MAX_ROTATIONS_PER_TURN: u8 = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum TerminationReason {
    TaskComplete,
    Cancelled,
    MaxIterations,
    WallClockDeadline,
    Stuck,
    Cycle,
    Fatal(String),
}

pub struct AgenticLoopConfig {
    pub max_iterations: u32,
    pub wall_clock_deadline: Duration,
    pub system_prompt: String,
    pub provider_name: String,
    pub model: String,
}

impl AgenticLoopConfig {
    /// `spec.md` §4.7: 100 iterations for local GGUF backends, 500 for
    /// cloud providers; 30 minutes wall clock either way.
    pub fn for_local(system_prompt: impl Into<String>, provider_name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            max_iterations: 100,
            wall_clock_deadline: Duration::from_secs(30 * 60),
            system_prompt: system_prompt.into(),
            provider_name: provider_name.into(),
            model: model.into(),
        }
    }

    pub fn for_cloud(system_prompt: impl Into<String>, provider_name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            max_iterations: 500,
            wall_clock_deadline: Duration::from_secs(30 * 60),
            system_prompt: system_prompt.into(),
            provider_name: provider_name.into(),
            model: model.into(),
        }
    }
}

struct CollectedResponse {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Usage,
}

pub struct AgenticLoop {
    model: Arc<dyn ModelProvider>,
    executor: Arc<dyn ToolExecutor>,
    pipeline: ToolPipeline,
    config: AgenticLoopConfig,
}

impl AgenticLoop {
    pub fn new(model: Arc<dyn ModelProvider>, executor: Arc<dyn ToolExecutor>, pipeline_opts: PipelineOptions, config: AgenticLoopConfig) -> Self {
        Self { model, executor, pipeline: ToolPipeline::new(pipeline_opts), config }
    }

    /// Runs iterations until termination, appending every emitted
    /// `AgentEvent` to `events` and every (tool, params) call to `state`.
    pub async fn run_turn(&self, session: &mut AgentSession, state: &mut ExecutionState, events: &mut Vec<AgentEvent>) -> TerminationReason {
        let reason = self.run_turn_inner(session, state, events).await;
        // Post-loop safety sweep (`spec.md` §4.7, §8 scenario 3): a file
        // written early in the turn may only be contradicted by data
        // gathered later, so every written path gets one final check here
        // regardless of how the turn ended.
        self.correct_fabricated_files(state);
        reason
    }

    async fn run_turn_inner(&self, session: &mut AgentSession, state: &mut ExecutionState, events: &mut Vec<AgentEvent>) -> TerminationReason {
        let started = Instant::now();
        let mut nudges_used: u8 = 0;
        let mut stuck_window: Vec<u64> = Vec::new();
        let mut temperature = 0.7f32;
        let mut rotations: u8 = 0;

        for iteration in 0..self.config.max_iterations {
            if started.elapsed() > self.config.wall_clock_deadline {
                return TerminationReason::WallClockDeadline;
            }
            events.push(AgentEvent::AgenticProgress { iteration, max_iterations: self.config.max_iterations });
            events.push(AgentEvent::ContextUsage { used: session.history.approx_tokens(), total: session.context_total });

            if session.is_near_limit(0.60) {
                let report = crate::compactor::ContextCompactor::compact(&mut session.history, session.context_total);
                if !report.phases_applied.is_empty() {
                    events.push(AgentEvent::Status {
                        state: "compacting".to_string(),
                        message: format!("ran compaction phases {:?}", report.phases_applied),
                        progress: None,
                        model_info: None,
                    });
                }
                if report.should_rotate {
                    if rotations >= MAX_ROTATIONS_PER_TURN {
                        warn!(rotations, "exceeded max context rotations for this turn");
                        return TerminationReason::Fatal("exceeded max context rotations for this turn".to_string());
                    }
                    rotations += 1;

                    let mut summarizer = Summarizer::new();
                    summarizer.observe(session.history.turns());
                    let summary = summarizer.quick_summary();
                    debug!(rotations, "rotating context after compaction still over threshold");

                    let mut fresh = ChatHistory::new();
                    fresh.push(ChatTurn::System(self.config.system_prompt.clone()));
                    fresh.push(ChatTurn::user(format!("Summary of the conversation so far:\n{summary}")));
                    session.replace_history(fresh);

                    events.push(AgentEvent::Status {
                        state: "context-rotated".to_string(),
                        message: format!("rotated context (rotation {rotations}/{MAX_ROTATIONS_PER_TURN})"),
                        progress: None,
                        model_info: None,
                    });
                    continue;
                }
            }

            let checkpoint = session.checkpoint();

            let mut attempt_temperature = temperature;
            let mut committed_response = None;
            for _retry in 0..ROLLBACK_RETRY_BUDGET {
                let request = GenerateRequest {
                    provider: self.config.provider_name.clone(),
                    model: self.config.model.clone(),
                    system_prompt: self.config.system_prompt.clone(),
                    messages: session.history.snapshot(),
                    max_tokens: 4096,
                    temperature: attempt_temperature,
                    stream: true,
                };
                let response = match self.model.generate(request).await {
                    Ok(stream) => collect_response(stream).await,
                    Err(err) => match failure::classify_native_error(&err.to_string()) {
                        Some(kind) if kind.propagates_to_caller() => return TerminationReason::Fatal(err.to_string()),
                        _ => {
                            attempt_temperature = (attempt_temperature - 0.3).max(0.0);
                            continue;
                        }
                    },
                };

                match classify_generation(&response.text, &response.tool_calls) {
                    Some(kind) if matches!(kind.severity(), Severity::Stop) => {
                        session.rollback(checkpoint.clone());
                        attempt_temperature = (attempt_temperature - 0.3).max(0.0);
                        continue;
                    }
                    _ => {
                        committed_response = Some(response);
                        break;
                    }
                }
            }

            let response = match committed_response {
                Some(r) => r,
                None => {
                    // Retry budget exhausted: drop the bad response and move on.
                    events.push(AgentEvent::LlmReplaceLast(String::new()));
                    continue;
                }
            };

            for text_segment in response.text.split_inclusive('\n') {
                if !text_segment.is_empty() {
                    events.push(AgentEvent::LlmToken(text_segment.to_string()));
                }
            }

            let mut segments = Vec::new();
            if !response.text.is_empty() {
                segments.push(Segment::Text(response.text.clone()));
            }
            for call in &response.tool_calls {
                segments.push(Segment::ToolCall { name: call.name.clone(), params: params_value(call) });
            }
            session.push(ChatTurn::Model(segments));

            events.push(AgentEvent::TokenStats {
                session_tokens: session.history.approx_tokens() as u64,
                request_count: iteration + 1,
                last_request_tokens: response.usage,
            });

            if let Some(kind) = check_hallucination_claims(&response.text, state) {
                if let Some(nudge) = self.try_nudge(&kind, &mut nudges_used) {
                    session.push(ChatTurn::user(nudge));
                    continue;
                }
            }

            if response.tool_calls.is_empty() {
                if let Some(kind) = classify_generation(&response.text, &response.tool_calls) {
                    if let Some(nudge) = self.try_nudge(&kind, &mut nudges_used) {
                        session.push(ChatTurn::user(nudge));
                        continue;
                    }
                }
                return TerminationReason::TaskComplete;
            }

            for call in &response.tool_calls {
                stuck_window.push(signature_hash(call));
                if stuck_window.len() > STUCK_WINDOW {
                    stuck_window.remove(0);
                }
            }
            if detect_stuck(&stuck_window) {
                return TerminationReason::Stuck;
            }
            if detect_cycle(&stuck_window) {
                return TerminationReason::Cycle;
            }

            let outcome = self.pipeline.process(response.tool_calls.clone(), &response.text, self.executor.as_ref(), state).await;
            for event in outcome.events.clone() {
                events.push(event.into());
            }

            for (call, result) in outcome.calls.iter().zip(outcome.results.iter()) {
                if result.success {
                    if let Some(text) = result.payload.as_str() {
                        if failure::looks_data_like(text) && !state.has_data_overlap(text, DATA_OVERLAP_MIN_LEN) {
                            if call.name == "write_file" {
                                if let Some(path) = write_target_path(call) {
                                    self.overwrite_fabricated_file(&path, state);
                                }
                            }
                            if let Some(nudge) = self.try_nudge(&FailureKind::Hallucination { claimed_url: result.tool.clone() }, &mut nudges_used) {
                                session.push(ChatTurn::user(nudge));
                            }
                        }
                    }
                }
            }

            let mut feedback = String::new();
            if let Some(message) = &outcome.deferral_message {
                feedback.push_str(message);
                feedback.push('\n');
            }
            for result in &outcome.results {
                feedback.push_str(&format!("{}: {}\n", result.tool, if result.success { "ok" } else { "error" }));
            }
            if feedback.is_empty() {
                feedback.push_str("(no tool output)");
            }
            session.push(ChatTurn::user(feedback));
        }

        TerminationReason::MaxIterations
    }

    fn try_nudge(&self, kind: &FailureKind, nudges_used: &mut u8) -> Option<String> {
        if kind.severity() != Severity::Nudge || *nudges_used >= NUDGE_BUDGET_PER_TURN {
            return None;
        }
        *nudges_used += 1;
        debug!(kind = %kind, "issuing nudge");
        kind.nudge_text()
    }

    /// Overwrites `path` on disk with a structured report built from
    /// `state.data_extracted`, bypassing the tool pipeline entirely
    /// (`spec.md` §4.7: fabrication auto-correction). Marks `path` checked
    /// so the post-loop sweep does not redo this work.
    fn overwrite_fabricated_file(&self, path: &str, state: &mut ExecutionState) {
        let report = build_fabrication_report(state);
        match std::fs::write(path, &report) {
            Ok(()) => warn!(path, "overwrote fabricated write_file output with a gathered-data report"),
            Err(err) => warn!(path, error = %err, "failed to overwrite fabricated file"),
        }
        state.mark_completeness_checked(path.to_string());
    }

    /// Post-loop safety sweep: re-reads every file written this turn that
    /// the in-loop check hasn't already verified, and overwrites it if its
    /// on-disk content still looks data-like with zero overlap against
    /// gathered data.
    fn correct_fabricated_files(&self, state: &mut ExecutionState) {
        for path in state.files_created.clone() {
            if state.mark_completeness_checked(path.clone()) {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else { continue };
            if failure::looks_data_like(&content) && !state.has_data_overlap(&content, DATA_OVERLAP_MIN_LEN) {
                let report = build_fabrication_report(state);
                match std::fs::write(&path, &report) {
                    Ok(()) => warn!(path = %path, "post-loop sweep overwrote fabricated file"),
                    Err(err) => warn!(path = %path, error = %err, "post-loop sweep failed to overwrite fabricated file"),
                }
            }
        }
    }
}

/// Extracts the path a `write_file`/`edit_file` call targeted.
fn write_target_path(call: &ToolCall) -> Option<String> {
    call.params
        .get("path")
        .or_else(|| call.params.get("file_path"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Renders the structured Markdown report fabrication auto-correction
/// writes in place of hallucinated file content (`spec.md` §4.7).
fn build_fabrication_report(state: &ExecutionState) -> String {
    let mut report = String::from(
        "# Data report (auto-corrected)\n\nThe model's claimed file content did not overlap with any data gathered this turn, so it was replaced with the data actually gathered.\n\n",
    );
    if state.data_extracted.is_empty() {
        report.push_str("_No data was gathered this turn._\n");
        return report;
    }
    report.push_str("## Gathered data\n\n");
    for snippet in &state.data_extracted {
        report.push_str("- ");
        report.push_str(snippet);
        report.push('\n');
    }
    report
}

fn params_value(call: &ToolCall) -> serde_json::Value {
    serde_json::Value::Object(call.params.clone().into_iter().collect())
}

async fn collect_response(mut stream: switchboard_providers::ResponseStream) -> CollectedResponse {
    use switchboard_providers::Chunk;
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut usage = Usage::default();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(Chunk::Text(t)) => text.push_str(&t),
            Ok(Chunk::ToolCallDone { name, params, .. }) => {
                let params = params.as_object().map(|m| m.clone().into_iter().collect()).unwrap_or_default();
                tool_calls.push(ToolCall { name, params });
            }
            Ok(Chunk::Usage(u)) => usage = u,
            Ok(Chunk::End) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    CollectedResponse { text, tool_calls, usage }
}

fn classify_generation(text: &str, tool_calls: &[ToolCall]) -> Option<FailureKind> {
    if text.trim().is_empty() && tool_calls.is_empty() {
        return Some(FailureKind::Empty);
    }
    if failure::detect_repetition(text) {
        return Some(FailureKind::Repetition);
    }
    if failure::detect_refusal(text) {
        return Some(FailureKind::Refusal);
    }
    if tool_calls.is_empty() && looks_described_not_executed(text) {
        return Some(FailureKind::DescribedNotExecuted);
    }
    None
}

const INTENT_WITHOUT_ACTION_PHRASES: &[&str] = &["i will now", "i'll now", "let me", "i am going to", "i'm going to"];

fn looks_described_not_executed(text: &str) -> bool {
    let lower = text.to_lowercase();
    INTENT_WITHOUT_ACTION_PHRASES.iter().any(|p| lower.contains(p))
}

fn check_hallucination_claims(text: &str, state: &ExecutionState) -> Option<FailureKind> {
    let re = regex::Regex::new(r"https?://[^\s)\]]+").unwrap();
    for url in re.find_iter(text) {
        if let Some(kind) = failure::check_hallucination(url.as_str(), state) {
            return Some(kind);
        }
    }
    None
}

fn signature_hash(call: &ToolCall) -> u64 {
    let mut hasher = DefaultHasher::new();
    call.name.hash(&mut hasher);
    format!("{:?}", call.params).hash(&mut hasher);
    hasher.finish()
}

/// `spec.md` §4.7: the last entry repeats 3x in a row.
fn detect_stuck(window: &[u64]) -> bool {
    window.len() >= 3 && window[window.len() - 1] == window[window.len() - 2] && window[window.len() - 2] == window[window.len() - 3]
}

/// A 2-4 element subsequence repeating 3x consecutively at the tail.
fn detect_cycle(window: &[u64]) -> bool {
    for l in 2..=4usize {
        let needed = 3 * l;
        if window.len() >= needed {
            let tail = &window[window.len() - needed..];
            let pattern = &tail[..l];
            if tail.chunks(l).all(|chunk| chunk == pattern) {
                return true;
            }
        }
    }
    false
}
