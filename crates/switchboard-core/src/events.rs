// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The core → host IPC event set of `spec.md` §6, aggregating the
//! tool-level events emitted by `switchboard_tools::ToolEvent`.

use switchboard_providers::Usage;
use switchboard_tools::{TodoItem, ToolEvent};

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// `llm-token(text)`
    LlmToken(String),
    /// `llm-thinking-token(text)`
    LlmThinkingToken(String),
    /// `llm-replace-last(text)` — issued after a `ROLLBACK` clears a bad
    /// streamed response from the display buffer.
    LlmReplaceLast(String),
    /// `tool-executing({tool, params})`
    ToolExecuting { tool: String, params: serde_json::Value },
    /// `mcp-tool-results([ToolResult])`
    ToolResults(Vec<switchboard_providers::ToolResult>),
    /// `context-usage({used, total})`
    ContextUsage { used: usize, total: usize },
    /// `agentic-progress({iteration, maxIterations})`
    AgenticProgress { iteration: u32, max_iterations: u32 },
    /// `agentic-phase({phase, status, label})`
    AgenticPhase { phase: String, status: String, label: String },
    /// `todo-update([Todo])`
    TodoUpdate(Vec<TodoItem>),
    /// `token-stats({sessionTokens, requestCount, lastRequestTokens})`
    TokenStats { session_tokens: u64, request_count: u32, last_request_tokens: Usage },
    /// `agent-paused(bool)`
    AgentPaused(bool),
    /// `status({state, message, progress?, modelInfo?})`
    Status { state: String, message: String, progress: Option<f32>, model_info: Option<ModelInfo> },
}

impl From<ToolEvent> for AgentEvent {
    fn from(event: ToolEvent) -> Self {
        match event {
            ToolEvent::Executing { tool, params } => AgentEvent::ToolExecuting { tool, params },
            ToolEvent::Results(results) => AgentEvent::ToolResults(results),
            ToolEvent::TodoUpdate(items) => AgentEvent::TodoUpdate(items),
            ToolEvent::ModeChanged(mode) => AgentEvent::Status {
                state: "mode-changed".to_string(),
                message: mode.to_string(),
                progress: None,
                model_info: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_executing_converts_from_tool_event() {
        let event = ToolEvent::Executing { tool: "grep".into(), params: json!({}) };
        let agent_event: AgentEvent = event.into();
        assert!(matches!(agent_event, AgentEvent::ToolExecuting { .. }));
    }

    #[test]
    fn tool_results_converts_from_tool_event() {
        let event = ToolEvent::Results(vec![]);
        let agent_event: AgentEvent = event.into();
        assert!(matches!(agent_event, AgentEvent::ToolResults(v) if v.is_empty()));
    }
}
