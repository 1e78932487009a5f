// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation data model: `ChatTurn`, `ChatHistory`, tool calls/results,
//! and streaming response events.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A tool call extracted from a model response, either from a fenced JSON
/// block in generated text or from a grammar-constrained native output.
/// Both paths produce this same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub params: BTreeMap<String, serde_json::Value>,
}

/// The outcome of executing a `ToolCall` against the opaque `ToolExecutor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub params: BTreeMap<String, serde_json::Value>,
    pub success: bool,
    pub payload: serde_json::Value,
    pub error: Option<String>,
}

/// One segment of a `Model` turn's content: plain text, a chain-of-thought
/// segment, or a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Segment {
    Text(String),
    Thought(String),
    ToolCall { name: String, params: serde_json::Value },
}

/// An image attached to a `User` turn. Only meaningful for vision-capable
/// models (`spec.md` §3: "User turns may hold image blobs only for
/// vision-capable models").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBlob {
    /// Raw bytes, base64-encoded for wire transport.
    pub data_base64: String,
    pub mime_type: String,
}

/// A single turn in a conversation. Tagged variant per `spec.md` §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChatTurn {
    System(String),
    User {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<ImageBlob>,
    },
    Model(Vec<Segment>),
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        ChatTurn::User { text: text.into(), images: Vec::new() }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        ChatTurn::Model(vec![Segment::Text(text.into())])
    }

    /// 4-chars-per-token heuristic used before a real provider-reported
    /// count is available (`SPEC_FULL.md` §3 approx_tokens).
    pub fn approx_tokens(&self) -> usize {
        let text_tokens = |s: &str| s.len().div_ceil(4);
        match self {
            ChatTurn::System(s) => text_tokens(s),
            ChatTurn::User { text, images } => {
                text_tokens(text) + images.len() * 765
            }
            ChatTurn::Model(segments) => segments
                .iter()
                .map(|seg| match seg {
                    Segment::Text(s) | Segment::Thought(s) => text_tokens(s),
                    Segment::ToolCall { name, params } => {
                        text_tokens(name) + text_tokens(&params.to_string())
                    }
                })
                .sum(),
        }
    }

    pub fn is_model(&self) -> bool {
        matches!(self, ChatTurn::Model(_))
    }
}

/// Ordered sequence of `ChatTurn`. Invariant (`spec.md` §3, §8): never two
/// consecutive `Model` turns; a `User` turn must intervene.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatHistory {
    turns: Vec<ChatTurn>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self { turns: Vec::new() }
    }

    /// Push a turn, enforcing the adjacency invariant. Returns `false`
    /// (and does not push) if the invariant would be violated.
    pub fn push(&mut self, turn: ChatTurn) -> bool {
        if turn.is_model() && matches!(self.turns.last(), Some(t) if t.is_model()) {
            return false;
        }
        self.turns.push(turn);
        true
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn first(&self) -> Option<&ChatTurn> {
        self.turns.first()
    }

    pub fn last(&self) -> Option<&ChatTurn> {
        self.turns.last()
    }

    pub fn approx_tokens(&self) -> usize {
        self.turns.iter().map(ChatTurn::approx_tokens).sum()
    }

    /// Checkpoint for rollback (`spec.md` §4.7 step 4, §8: "After a
    /// ROLLBACK, chat_history and eval_cache equal the checkpoint taken
    /// just before generation").
    pub fn snapshot(&self) -> ChatHistory {
        self.clone()
    }

    pub fn restore(&mut self, snapshot: ChatHistory) {
        *self = snapshot;
    }

    pub fn truncate(&mut self, len: usize) {
        self.turns.truncate(len);
    }

    pub fn replace(&mut self, turns: Vec<ChatTurn>) {
        self.turns = turns;
    }
}

/// Token accounting for one completion call, extended with cache
/// read/write counts for providers that report them (Anthropic-style
/// prompt caching).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
}

/// A typed chunk emitted by `StreamDecoder` (`spec.md` §4.4).
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Text(String),
    Thought(String),
    ToolCallPartial { index: usize, name: Option<String>, params_partial: String },
    ToolCallDone { index: usize, name: String, params: serde_json::Value },
    Usage(Usage),
    End,
}
