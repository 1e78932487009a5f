// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use switchboard_config::AgentMode;

/// A structured todo item tracked across a turn; mirrors the `todo-update`
/// IPC event payload.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

/// Events emitted by the tool pipeline while executing one response's
/// calls. `switchboard-core` folds these into the broader host-facing
/// event stream alongside generation and dispatch events.
#[derive(Debug, Clone)]
pub enum ToolEvent {
    /// `tool-executing({tool, params})` — emitted just before dispatch.
    Executing { tool: String, params: serde_json::Value },
    /// `mcp-tool-results([ToolResult])` — emitted after the whole batch
    /// for this response has run.
    Results(Vec<switchboard_providers::ToolResult>),
    TodoUpdate(Vec<TodoItem>),
    ModeChanged(AgentMode),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn todo_status_round_trips_through_json() {
        let item = TodoItem { id: "1".into(), content: "do thing".into(), status: TodoStatus::InProgress };
        let json = serde_json::to_string(&item).unwrap();
        let back: TodoItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn todo_status_serializes_snake_case() {
        let json = serde_json::to_string(&TodoStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
