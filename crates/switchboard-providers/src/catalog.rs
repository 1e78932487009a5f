// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Static provider and model catalog.
//!
//! `ProviderRegistry` is the in-memory table of `{ host, path, dialect,
//! default_rpm_per_key, supports_vision, bundled }` records keyed by
//! provider id, bundled into the binary from `providers.yaml` the same way
//! the teacher embeds its model catalog with `include_str!`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wire-format family a provider speaks. Kept as a tagged enum rather than
/// one Rust type per vendor, per the explicit instruction that dialects are
/// variants, not subclasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    #[serde(rename = "apifreellm")]
    ApiFreeLlm,
    OllamaNdjson,
    Proxy,
}

/// Static per-provider record. `ProviderId` is just the map key (`String`);
/// no dedicated newtype is introduced since it never carries behaviour of
/// its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub host: String,
    pub path: String,
    pub dialect: Dialect,
    pub default_rpm_per_key: u32,
    #[serde(default)]
    pub supports_vision: Vec<String>,
    #[serde(default)]
    pub bundled: bool,
    /// Provider's preferred default model, used by the fallback chain.
    pub default_model: String,
}

impl ProviderRecord {
    pub fn supports_vision_for(&self, model: &str) -> bool {
        self.supports_vision.iter().any(|m| m == model)
    }

    pub fn endpoint_url(&self) -> String {
        format!("{}{}", self.host, self.path)
    }
}

/// A catalog entry describing one concrete model's limits, grounded on the
/// teacher's model-keyed catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalogEntry {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    #[serde(default)]
    pub input_modalities: Vec<String>,
}

impl ModelCatalogEntry {
    pub fn supports_images(&self) -> bool {
        self.input_modalities.iter().any(|m| m == "image")
    }
}

const EMBEDDED_PROVIDERS_YAML: &str = include_str!("../providers.yaml");

/// Registry of provider records and the model catalog, loaded once from the
/// embedded YAML document and shared (read-only) across the process.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderRecord>,
    models: Vec<ModelCatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    providers: HashMap<String, ProviderRecord>,
    #[serde(default)]
    models: Vec<ModelCatalogEntry>,
}

impl ProviderRegistry {
    /// Build the registry from the embedded `providers.yaml`.
    pub fn embedded() -> anyhow::Result<Self> {
        Self::from_yaml(EMBEDDED_PROVIDERS_YAML)
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let parsed: CatalogFile = serde_yaml::from_str(text)?;
        Ok(Self { providers: parsed.providers, models: parsed.models })
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderRecord> {
        self.providers.get(id)
    }

    pub fn provider_ids(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub fn lookup_model(&self, id: &str) -> Option<&ModelCatalogEntry> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn lookup_by_model_name(&self, name: &str) -> Option<&ModelCatalogEntry> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn models_for_provider(&self, provider: &str) -> Vec<&ModelCatalogEntry> {
        self.models.iter().filter(|m| m.provider == provider).collect()
    }

    pub fn insert_provider(&mut self, id: impl Into<String>, record: ProviderRecord) {
        self.providers.insert(id.into(), record);
    }
}

/// `spec.md` §4.3: the preferred cross-provider fallback chain, skipping
/// the originating provider and any currently-cooling provider.
pub const PREFERRED_FALLBACK_CHAIN: &[&str] = &[
    "cerebras",
    "sambanova",
    "openrouter",
    "groq",
    "google",
    "nvidia",
    "cohere",
    "mistral",
    "huggingface",
    "cloudflare",
    "together",
    "fireworks",
];
