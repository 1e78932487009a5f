// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Backend-agnostic generation trait shared by `CloudDispatcher` and (from
//! the `switchboard-local` crate) `LocalEngine`, so `AgenticLoop` can
//! dispatch to either without knowing which.

use crate::catalog::ProviderRegistry;
use crate::dispatch::{CloudDispatcher, GenerateRequest};
use crate::types::Chunk;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Chunk>> + Send>>;

/// Common surface every generation backend exposes to `AgenticLoop`.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, req: GenerateRequest) -> anyhow::Result<ResponseStream>;

    fn context_window(&self, model: &str) -> Option<u32>;

    fn supports_images(&self, model: &str) -> bool;
}

/// Adapts `CloudDispatcher` to the `ModelProvider` trait.
pub struct CloudModelProvider {
    dispatcher: Arc<CloudDispatcher>,
    registry: Arc<ProviderRegistry>,
    name: String,
}

impl CloudModelProvider {
    pub fn new(dispatcher: Arc<CloudDispatcher>, registry: Arc<ProviderRegistry>, name: impl Into<String>) -> Self {
        Self { dispatcher, registry, name: name.into() }
    }
}

#[async_trait]
impl ModelProvider for CloudModelProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, req: GenerateRequest) -> anyhow::Result<ResponseStream> {
        let stream = self.dispatcher.generate(req).await.map_err(anyhow::Error::from)?;
        Ok(Box::pin(stream) as ResponseStream)
    }

    fn context_window(&self, model: &str) -> Option<u32> {
        self.registry.lookup_model(model).map(|m| m.context_window)
    }

    fn supports_images(&self, model: &str) -> bool {
        self.registry.lookup_model(model).map(|m| m.supports_images()).unwrap_or(false)
    }
}

/// Drains a `ResponseStream` into accumulated text and the final `Usage`,
/// used by callers that don't need incremental delivery (e.g. tests, the
/// non-streaming CLI path).
pub async fn collect_text(mut stream: ResponseStream) -> anyhow::Result<String> {
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            Chunk::Text(t) => text.push_str(&t),
            Chunk::End => break,
            _ => {}
        }
    }
    Ok(text)
}
