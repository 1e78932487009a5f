// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod agentic_loop;
mod compactor;
mod events;
mod failure;
mod gate;
mod session;
mod summarizer;

pub use agentic_loop::{AgenticLoop, AgenticLoopConfig, TerminationReason};
pub use compactor::{CompactionReport, ContextCompactor};
pub use events::{AgentEvent, ModelInfo};
pub use failure::{
    check_hallucination, classify_native_error, detect_refusal, detect_repetition, looks_data_like, FailureKind, Severity,
};
pub use gate::RequestGate;
pub use session::AgentSession;
pub use summarizer::{PlanStep, Summarizer, ToolCallRecord};
