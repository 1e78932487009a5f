// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider dispatch & key-pool scheduler: the catalog of remote
//! inference providers, their wire dialects, and the retry/failover
//! machinery that drives requests against them.

pub mod catalog;
pub mod dispatch;
pub mod http;
pub mod keypool;
pub mod provider;
pub mod proxy;
pub mod rpm;
pub mod stream;
pub mod types;

pub use catalog::{Dialect, ModelCatalogEntry, ProviderRecord, ProviderRegistry, PREFERRED_FALLBACK_CHAIN};
pub use dispatch::{CloudDispatcher, DispatchError, GenerateRequest};
pub use http::HttpClient;
pub use keypool::KeyPool;
pub use provider::{CloudModelProvider, ModelProvider, ResponseStream};
pub use rpm::RpmPacer;
pub use stream::StreamDecoder;
pub use types::{ChatHistory, ChatTurn, Chunk, ImageBlob, Segment, ToolCall, ToolResult, Usage};
