// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;
use switchboard_config::AgentMode;
use switchboard_providers::{ToolCall, ToolResult};

use crate::policy::ApprovalPolicy;

/// Describes the shape of a tool's text output for context-aware
/// truncation, consulted by `ContextCompactor` when a result exceeds the
/// configured token cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep the first 60 + last 40 lines so both
    /// the command preamble and the final result are visible.
    HeadTail,
    /// Ordered match list: keep the leading matches so the model sees the
    /// highest-relevance results first.
    MatchList,
    /// File content: keep a head and tail window with a separator.
    FileContent,
    /// Generic text: hard-truncate at the character boundary.
    #[default]
    Generic,
}

/// A single tool this process can run. `switchboard-tools` never bundles
/// concrete implementations (shell, filesystem, browser, …) — those are
/// an opaque external collaborator per the host integration. This trait
/// is the seam a host registers them through.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters, advertised to the model.
    fn parameters_schema(&self) -> Value;
    fn default_policy(&self) -> ApprovalPolicy;
    /// The agent modes in which this tool is offered to the model.
    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    async fn execute(&self, call: &ToolCall) -> ToolResult;
}

/// The seam `AgenticLoop` actually depends on: something that can run a
/// named tool call and hand back a `ToolResult`. `ToolRegistry` is the
/// in-process default implementer; a host may substitute an IPC-backed one
/// without `switchboard-core` knowing the difference.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall) -> ToolResult;
}
