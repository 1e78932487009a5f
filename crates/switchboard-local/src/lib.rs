// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Local GGUF inference: model load ladder, chat-wrapper probing, and the
//! `ModelProvider` adapter that lets the agentic loop dispatch to a local
//! model exactly like a cloud one.

pub mod engine;
pub mod session;
pub mod wrapper;

pub use engine::{
    exceeds_memory_budget, vram_padding_bytes, GpuMode, LoadState, LocalEngine, ResourceProbe,
    StatusEvent, SystemResourceProbe,
};
pub use session::{EvalCache, HandleId, LocalSession};
pub use wrapper::{WrapperFamily, WrapperProbeBackend, WrapperProber};
