// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! SSE/NDJSON decoding across the five wire dialects, producing a sequence
//! of typed `Chunk`s.

use crate::catalog::Dialect;
use crate::types::Chunk;
use serde_json::Value;

/// Accumulates raw bytes into lines and decodes them per `Dialect` into
/// `Chunk`s. Incomplete lines buffer across calls; malformed lines are
/// skipped silently (`spec.md` §4.4).
pub struct StreamDecoder {
    dialect: Dialect,
    buffer: String,
    tool_call_index: usize,
    /// Minimum gap enforced by the caller between successive apifreellm
    /// requests; not consulted here, but surfaced so `CloudDispatcher` can
    /// read it off the decoder's dialect.
    pub min_request_gap_secs: u64,
}

impl StreamDecoder {
    pub fn new(dialect: Dialect) -> Self {
        let min_request_gap_secs = if dialect == Dialect::ApiFreeLlm { 5 } else { 0 };
        Self { dialect, buffer: String::new(), tool_call_index: 0, min_request_gap_secs }
    }

    /// Feeds a chunk of raw bytes (already UTF-8 decoded), returning the
    /// `Chunk`s it produced. Call with an empty string plus `is_final` to
    /// flush.
    pub fn push(&mut self, bytes: &str) -> Vec<Chunk> {
        self.buffer.push_str(bytes);
        match self.dialect {
            Dialect::OpenAi | Dialect::Proxy => self.drain_sse_openai(),
            Dialect::Anthropic => self.drain_sse_anthropic(),
            Dialect::OllamaNdjson => self.drain_ndjson(),
            Dialect::ApiFreeLlm => Vec::new(), // non-streaming; see `decode_non_streaming`
        }
    }

    /// Splits `self.buffer` on newlines, leaving any trailing partial line
    /// buffered for the next `push`. Returns complete lines.
    fn take_complete_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);
            lines.push(line);
        }
        lines
    }

    fn drain_sse_openai(&mut self) -> Vec<Chunk> {
        let lines = self.take_complete_lines();
        let mut out = Vec::new();
        for line in lines {
            let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                out.push(Chunk::End);
                continue;
            }
            let Ok(json) = serde_json::from_str::<Value>(data) else { continue };
            let Some(delta) = json.pointer("/choices/0/delta") else { continue };
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    out.push(Chunk::Text(text.to_string()));
                }
            }
            let thought = delta
                .get("reasoning_content")
                .or_else(|| delta.get("reasoning"))
                .and_then(Value::as_str);
            if let Some(thought) = thought {
                if !thought.is_empty() {
                    out.push(Chunk::Thought(thought.to_string()));
                }
            }
            if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for tc in tool_calls {
                    let idx = tc.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                    let name = tc.pointer("/function/name").and_then(Value::as_str).map(String::from);
                    let args = tc
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    out.push(Chunk::ToolCallPartial { index: idx, name, params_partial: args });
                }
            }
        }
        out
    }

    fn drain_sse_anthropic(&mut self) -> Vec<Chunk> {
        let lines = self.take_complete_lines();
        let mut out = Vec::new();
        for line in lines {
            let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            let Ok(json) = serde_json::from_str::<Value>(data) else { continue };
            match json.get("type").and_then(Value::as_str) {
                Some("content_block_delta") => {
                    let Some(delta) = json.get("delta") else { continue };
                    match delta.get("type").and_then(Value::as_str) {
                        Some("thinking_delta") => {
                            if let Some(t) = delta.get("thinking").and_then(Value::as_str) {
                                out.push(Chunk::Thought(t.to_string()));
                            }
                        }
                        Some("input_json_delta") => {
                            if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                                out.push(Chunk::ToolCallPartial {
                                    index: self.tool_call_index,
                                    name: None,
                                    params_partial: partial.to_string(),
                                });
                            }
                        }
                        _ => {
                            if let Some(text) = delta.get("text").and_then(Value::as_str) {
                                out.push(Chunk::Text(text.to_string()));
                            }
                        }
                    }
                }
                Some("content_block_start") => {
                    if json.pointer("/content_block/type").and_then(Value::as_str) == Some("tool_use") {
                        self.tool_call_index += 1;
                        if let Some(name) = json.pointer("/content_block/name").and_then(Value::as_str) {
                            out.push(Chunk::ToolCallPartial {
                                index: self.tool_call_index,
                                name: Some(name.to_string()),
                                params_partial: String::new(),
                            });
                        }
                    }
                }
                Some("message_stop") => out.push(Chunk::End),
                _ => {}
            }
        }
        out
    }

    fn drain_ndjson(&mut self) -> Vec<Chunk> {
        let lines = self.take_complete_lines();
        let mut out = Vec::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(json) = serde_json::from_str::<Value>(line) else { continue };
            if let Some(text) = json.pointer("/message/content").and_then(Value::as_str) {
                if !text.is_empty() {
                    out.push(Chunk::Text(text.to_string()));
                }
            }
            if json.get("done").and_then(Value::as_bool) == Some(true) {
                out.push(Chunk::End);
            }
        }
        out
    }

    /// Decodes a complete, non-streaming `apifreellm` body: `{success,
    /// response}`, synthesising word-by-word chunks for UI continuity.
    pub fn decode_non_streaming(body: &str) -> Vec<Chunk> {
        let Ok(json) = serde_json::from_str::<Value>(body) else { return vec![Chunk::End] };
        if json.get("success").and_then(Value::as_bool) != Some(true) {
            return vec![Chunk::End];
        }
        let Some(response) = json.get("response").and_then(Value::as_str) else {
            return vec![Chunk::End];
        };
        let mut out: Vec<Chunk> = response
            .split_inclusive(' ')
            .filter(|w| !w.is_empty())
            .map(|w| Chunk::Text(w.to_string()))
            .collect();
        out.push(Chunk::End);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_dialect_extracts_text_delta() {
        let mut dec = StreamDecoder::new(Dialect::OpenAi);
        let chunks = dec.push("data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n");
        assert_eq!(chunks, vec![Chunk::Text("hi".into())]);
    }

    #[test]
    fn openai_dialect_done_sentinel_ends() {
        let mut dec = StreamDecoder::new(Dialect::OpenAi);
        let chunks = dec.push("data: [DONE]\n");
        assert_eq!(chunks, vec![Chunk::End]);
    }

    #[test]
    fn openai_dialect_extracts_reasoning_content() {
        let mut dec = StreamDecoder::new(Dialect::OpenAi);
        let chunks = dec.push("data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"thinking\"}}]}\n");
        assert_eq!(chunks, vec![Chunk::Thought("thinking".into())]);
    }

    #[test]
    fn malformed_line_is_skipped_silently() {
        let mut dec = StreamDecoder::new(Dialect::OpenAi);
        let chunks = dec.push("data: not json at all\n");
        assert!(chunks.is_empty());
    }

    #[test]
    fn incomplete_line_buffers_across_pushes() {
        let mut dec = StreamDecoder::new(Dialect::OpenAi);
        let chunks1 = dec.push("data: {\"choices\":[{\"delta\":{\"content\":\"hi\"");
        assert!(chunks1.is_empty());
        let chunks2 = dec.push("}}]}\n");
        assert_eq!(chunks2, vec![Chunk::Text("hi".into())]);
    }

    #[test]
    fn anthropic_thinking_delta_becomes_thought() {
        let mut dec = StreamDecoder::new(Dialect::Anthropic);
        let chunks = dec.push(
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"hmm\"}}\n",
        );
        assert_eq!(chunks, vec![Chunk::Thought("hmm".into())]);
    }

    #[test]
    fn anthropic_text_delta_becomes_text() {
        let mut dec = StreamDecoder::new(Dialect::Anthropic);
        let chunks = dec.push(
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n",
        );
        assert_eq!(chunks, vec![Chunk::Text("hi".into())]);
    }

    #[test]
    fn anthropic_message_stop_ends() {
        let mut dec = StreamDecoder::new(Dialect::Anthropic);
        let chunks = dec.push("data: {\"type\":\"message_stop\"}\n");
        assert_eq!(chunks, vec![Chunk::End]);
    }

    #[test]
    fn ndjson_content_and_done() {
        let mut dec = StreamDecoder::new(Dialect::OllamaNdjson);
        let chunks = dec.push("{\"message\":{\"content\":\"hi\"},\"done\":false}\n{\"done\":true}\n");
        assert_eq!(chunks, vec![Chunk::Text("hi".into()), Chunk::End]);
    }

    #[test]
    fn apifreellm_non_streaming_word_chunks() {
        let body = r#"{"success":true,"response":"hi there"}"#;
        let chunks = StreamDecoder::decode_non_streaming(body);
        assert_eq!(chunks.last(), Some(&Chunk::End));
        assert!(chunks.len() >= 2);
    }

    #[test]
    fn apifreellm_failure_yields_only_end() {
        let body = r#"{"success":false,"response":""}"#;
        let chunks = StreamDecoder::decode_non_streaming(body);
        assert_eq!(chunks, vec![Chunk::End]);
    }

    #[test]
    fn apifreellm_dialect_has_min_gap() {
        let dec = StreamDecoder::new(Dialect::ApiFreeLlm);
        assert_eq!(dec.min_request_gap_secs, 5);
    }

    #[test]
    fn other_dialects_have_no_min_gap() {
        let dec = StreamDecoder::new(Dialect::OpenAi);
        assert_eq!(dec.min_request_gap_secs, 0);
    }
}
