// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The eight-stage pipeline that turns a model response (native tool
//! calls or fenced-JSON text) into executed `ToolResult`s: parse, repair,
//! normalise, dedup, browser-burst cap, write deferral, execute, and the
//! post-execute event/ledger update.

use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use switchboard_providers::{ToolCall, ToolResult};

use crate::events::ToolEvent;
use crate::execution_state::ExecutionState;
use crate::tool::ToolExecutor;

const BROWSER_STATE_CHANGING: &[&str] =
    &["navigate", "click", "type", "select", "press_key", "back", "fill_form", "drag", "file_upload"];
const WRITE_TOOLS: &[&str] = &["write_file", "edit_file"];

fn is_data_gathering(name: &str) -> bool {
    name == "web_search" || name == "fetch_webpage" || name.starts_with("browser_")
}

fn is_browser_state_changing(name: &str) -> bool {
    BROWSER_STATE_CHANGING.contains(&name)
}

fn is_write_tool(name: &str) -> bool {
    WRITE_TOOLS.contains(&name)
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub browser_burst_cap: usize,
    pub tool_pace_ms: u64,
    /// Tiny models (<=1B) cannot handle the deferral retry, so writes
    /// proceed immediately and rely on fabrication auto-correction.
    pub allow_writes_without_deferral: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self { browser_burst_cap: 2, tool_pace_ms: 0, allow_writes_without_deferral: false }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOutcome {
    pub calls: Vec<ToolCall>,
    pub results: Vec<ToolResult>,
    /// Browser-burst-capped calls, dropped before execution.
    pub capped: Vec<ToolCall>,
    /// Write calls deferred to the next turn because this response also
    /// batched data-gathering tools.
    pub skipped: Vec<ToolCall>,
    pub events: Vec<ToolEvent>,
    /// Present when writes were deferred; feed this back to the model.
    pub deferral_message: Option<String>,
}

pub struct ToolPipeline {
    opts: PipelineOptions,
}

impl ToolPipeline {
    pub fn new(opts: PipelineOptions) -> Self {
        Self { opts }
    }

    /// Stage 1 (text path). Finds every ` ```json|tool|tool_call ... ``` `
    /// fenced block containing a JSON object with a `tool` or `name` field.
    pub fn parse_fenced_calls(text: &str) -> Vec<ToolCall> {
        let re = Regex::new(r"(?s)```(?:json|tool|tool_call)\s*\n(.*?)```").unwrap();
        re.captures_iter(text)
            .filter_map(|cap| {
                let body = cap.get(1)?.as_str();
                let value: Value = serde_json::from_str(body).ok()?;
                parse_one_call(&value)
            })
            .collect()
    }

    /// Runs stages 2-8 given an already-assembled list of calls (either
    /// from `parse_fenced_calls` or native provider tool calls).
    pub async fn process(
        &self,
        calls: Vec<ToolCall>,
        response_text: &str,
        executor: &dyn ToolExecutor,
        state: &mut ExecutionState,
    ) -> PipelineOutcome {
        let calls = repair(calls, response_text);
        let calls = normalize(calls);
        let calls = dedup(calls);
        let (calls, capped) = self.cap_browser_bursts(calls);

        let has_data_gathering = calls.iter().any(|c| is_data_gathering(&c.name));
        let has_writes = calls.iter().any(|c| is_write_tool(&c.name));
        let defer = has_data_gathering && has_writes && !self.opts.allow_writes_without_deferral;

        let (to_execute, skipped, deferral_message) = if defer {
            let (writes, rest): (Vec<_>, Vec<_>) = calls.into_iter().partition(|c| is_write_tool(&c.name));
            tracing::debug!(count = writes.len(), "deferring write calls batched with data-gathering tools");
            let message = format!(
                "{} write call(s) deferred: gathered data this turn should be used directly; re-issue the write next turn.",
                writes.len()
            );
            (rest, writes, Some(message))
        } else {
            (calls, Vec::new(), None)
        };

        if !capped.is_empty() {
            tracing::debug!(count = capped.len(), "browser-burst cap dropped calls");
        }

        let mut results = Vec::with_capacity(to_execute.len());
        let mut events = Vec::with_capacity(to_execute.len() * 2);
        for (i, call) in to_execute.iter().enumerate() {
            events.push(ToolEvent::Executing { tool: call.name.clone(), params: params_to_value(&call.params) });
            let result = executor.execute(call).await;
            record_execution_state(state, call, &result);
            results.push(result);
            if self.opts.tool_pace_ms > 0 && i + 1 < to_execute.len() {
                tokio::time::sleep(Duration::from_millis(self.opts.tool_pace_ms)).await;
            }
        }
        events.push(ToolEvent::Results(results.clone()));

        PipelineOutcome { calls: to_execute, results, capped, skipped, events, deferral_message }
    }

    fn cap_browser_bursts(&self, calls: Vec<ToolCall>) -> (Vec<ToolCall>, Vec<ToolCall>) {
        let mut kept = Vec::with_capacity(calls.len());
        let mut capped = Vec::new();
        let mut browser_actions = 0usize;
        for call in calls {
            if is_browser_state_changing(&call.name) {
                if browser_actions >= self.opts.browser_burst_cap {
                    capped.push(call);
                    continue;
                }
                browser_actions += 1;
            }
            kept.push(call);
        }
        (kept, capped)
    }
}

fn parse_one_call(value: &Value) -> Option<ToolCall> {
    let obj = value.as_object()?;
    let name = obj.get("tool").or_else(|| obj.get("name"))?.as_str()?.to_string();
    let params_value = obj.get("params").or_else(|| obj.get("arguments")).cloned().unwrap_or(Value::Object(Default::default()));
    let params: BTreeMap<String, Value> = params_value.as_object().map(|m| m.clone().into_iter().collect()).unwrap_or_default();
    Some(ToolCall { name, params })
}

fn params_to_value(params: &BTreeMap<String, Value>) -> Value {
    Value::Object(params.clone().into_iter().collect())
}

/// Stage 2: recover empty `write_file.content` from an adjacent fenced
/// block; normalise bare-host URLs to `https://`.
fn repair(calls: Vec<ToolCall>, response_text: &str) -> Vec<ToolCall> {
    let fallback_block = find_first_code_block(response_text);
    calls
        .into_iter()
        .map(|mut call| {
            if call.name == "write_file" {
                let empty = call
                    .params
                    .get("content")
                    .map(|v| v.as_str().unwrap_or("").is_empty())
                    .unwrap_or(true);
                if empty {
                    if let Some(block) = &fallback_block {
                        call.params.insert("content".to_string(), Value::String(block.clone()));
                    }
                }
            }
            for key in ["url", "uri"] {
                if let Some(Value::String(url)) = call.params.get(key).cloned() {
                    if !url.is_empty() && !url.contains("://") {
                        call.params.insert(key.to_string(), Value::String(format!("https://{url}")));
                    }
                }
            }
            call
        })
        .collect()
}

fn find_first_code_block(text: &str) -> Option<String> {
    let re = Regex::new(r"(?s)```[a-zA-Z]*\n(.*?)```").unwrap();
    let result = re.captures_iter(text).map(|c| c[1].to_string()).find(|s| !s.trim().is_empty());
    result
}

/// Stage 3: scrub control characters 0x00-0x1F from path-like params.
fn normalize(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|mut call| {
            for key in ["path", "file_path", "target_file"] {
                if let Some(Value::String(path)) = call.params.get(key).cloned() {
                    let scrubbed: String = path.chars().filter(|c| !c.is_control()).collect();
                    call.params.insert(key.to_string(), Value::String(scrubbed));
                }
            }
            call
        })
        .collect()
}

/// Stage 4: drop identical `(tool, params)` signatures within one response.
fn dedup(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen = std::collections::HashSet::new();
    calls
        .into_iter()
        .filter(|call| {
            let signature = format!("{}:{:?}", call.name, call.params);
            seen.insert(signature)
        })
        .collect()
}

fn record_execution_state(state: &mut ExecutionState, call: &ToolCall, result: &ToolResult) {
    match call.name.as_str() {
        "write_file" => {
            if let Some(Value::String(path)) = call.params.get("path").or_else(|| call.params.get("file_path")) {
                state.record_file_created(path.clone());
            }
        }
        "edit_file" => {
            if let Some(Value::String(path)) = call.params.get("path").or_else(|| call.params.get("file_path")) {
                state.record_file_edited(path.clone());
            }
        }
        "web_search" => {
            if let Some(Value::String(query)) = call.params.get("query") {
                state.record_search(query.clone());
            }
        }
        name if is_data_gathering(name) => {
            if let Some(Value::String(url)) = call.params.get("url") {
                state.record_url_visit(url.clone());
            }
        }
        _ => {}
    }
    if result.success {
        if let Some(text) = result.payload.as_str() {
            state.extend_gathered_data(std::iter::once(text.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(&self, call: &ToolCall) -> ToolResult {
            ToolResult { tool: call.name.clone(), params: call.params.clone(), success: true, payload: json!("done"), error: None }
        }
    }

    fn call(name: &str, params: serde_json::Map<String, Value>) -> ToolCall {
        ToolCall { name: name.into(), params: params.into_iter().collect() }
    }

    #[test]
    fn parse_fenced_calls_extracts_tool_and_params() {
        let text = "here:\n```json\n{\"tool\": \"grep\", \"params\": {\"q\": \"x\"}}\n```\ndone";
        let calls = ToolPipeline::parse_fenced_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "grep");
    }

    #[test]
    fn parse_fenced_calls_accepts_multiple_blocks() {
        let text = "```json\n{\"name\": \"a\"}\n```\nmore\n```tool\n{\"name\": \"b\"}\n```";
        let calls = ToolPipeline::parse_fenced_calls(text);
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn parse_fenced_calls_accepts_arguments_key() {
        let text = "```json\n{\"name\": \"x\", \"arguments\": {\"k\": 1}}\n```";
        let calls = ToolPipeline::parse_fenced_calls(text);
        assert_eq!(calls[0].params.get("k"), Some(&json!(1)));
    }

    #[test]
    fn repair_recovers_empty_write_file_content_from_adjacent_block() {
        let text = "```markdown\nreal content here\n```\n```json\n{\"tool\": \"write_file\", \"params\": {\"content\": \"\"}}\n```";
        let calls = vec![call("write_file", serde_json::Map::from_iter([("content".into(), json!(""))]))];
        let repaired = repair(calls, text);
        assert_eq!(repaired[0].params.get("content").unwrap().as_str().unwrap().trim(), "real content here");
    }

    #[test]
    fn repair_adds_https_scheme() {
        let calls = vec![call("fetch_webpage", serde_json::Map::from_iter([("url".into(), json!("example.com"))]))];
        let repaired = repair(calls, "");
        assert_eq!(repaired[0].params.get("url").unwrap(), "https://example.com");
    }

    #[test]
    fn normalize_strips_control_chars_from_path() {
        let calls = vec![call("read_file", serde_json::Map::from_iter([("path".into(), json!("a\u{0007}b.rs"))]))];
        let normalized = normalize(calls);
        assert_eq!(normalized[0].params.get("path").unwrap(), "ab.rs");
    }

    #[test]
    fn dedup_drops_identical_signatures() {
        let calls = vec![
            call("x", serde_json::Map::from_iter([("a".into(), json!(1))])),
            call("x", serde_json::Map::from_iter([("a".into(), json!(1))])),
        ];
        assert_eq!(dedup(calls).len(), 1);
    }

    #[test]
    fn dedup_keeps_distinct_params() {
        let calls = vec![
            call("x", serde_json::Map::from_iter([("a".into(), json!(1))])),
            call("x", serde_json::Map::from_iter([("a".into(), json!(2))])),
        ];
        assert_eq!(dedup(calls).len(), 2);
    }

    #[test]
    fn browser_burst_cap_limits_state_changing_actions() {
        let pipeline = ToolPipeline::new(PipelineOptions { browser_burst_cap: 2, ..Default::default() });
        let calls = vec![call("click", Default::default()), call("click", Default::default()), call("click", Default::default())];
        let (kept, capped) = pipeline.cap_browser_bursts(calls);
        assert_eq!(kept.len(), 2);
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn browser_burst_cap_does_not_count_non_browser_tools() {
        let pipeline = ToolPipeline::new(PipelineOptions { browser_burst_cap: 1, ..Default::default() });
        let calls = vec![call("click", Default::default()), call("read_file", Default::default())];
        let (kept, capped) = pipeline.cap_browser_bursts(calls);
        assert_eq!(kept.len(), 2);
        assert!(capped.is_empty());
    }

    #[tokio::test]
    async fn process_defers_writes_when_batched_with_data_gathering() {
        let pipeline = ToolPipeline::new(PipelineOptions::default());
        let calls = vec![call("web_search", serde_json::Map::from_iter([("query".into(), json!("x"))])), call("write_file", Default::default())];
        let mut state = ExecutionState::new();
        let outcome = pipeline.process(calls, "", &EchoExecutor, &mut state).await;
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.calls.len(), 1);
        assert!(outcome.deferral_message.is_some());
    }

    #[tokio::test]
    async fn process_allows_writes_without_deferral_when_configured() {
        let pipeline = ToolPipeline::new(PipelineOptions { allow_writes_without_deferral: true, ..Default::default() });
        let calls = vec![call("web_search", Default::default()), call("write_file", Default::default())];
        let mut state = ExecutionState::new();
        let outcome = pipeline.process(calls, "", &EchoExecutor, &mut state).await;
        assert!(outcome.skipped.is_empty());
        assert_eq!(outcome.calls.len(), 2);
    }

    #[tokio::test]
    async fn process_executes_and_updates_execution_state() {
        let pipeline = ToolPipeline::new(PipelineOptions::default());
        let calls = vec![call("write_file", serde_json::Map::from_iter([("path".into(), json!("out.md"))]))];
        let mut state = ExecutionState::new();
        let outcome = pipeline.process(calls, "", &EchoExecutor, &mut state).await;
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(state.files_created, vec!["out.md".to_string()]);
    }

    #[tokio::test]
    async fn process_emits_executing_and_results_events() {
        let pipeline = ToolPipeline::new(PipelineOptions::default());
        let calls = vec![call("read_file", Default::default())];
        let mut state = ExecutionState::new();
        let outcome = pipeline.process(calls, "", &EchoExecutor, &mut state).await;
        assert_eq!(outcome.events.len(), 2);
        assert!(matches!(outcome.events[0], ToolEvent::Executing { .. }));
        assert!(matches!(outcome.events[1], ToolEvent::Results(_)));
    }
}
