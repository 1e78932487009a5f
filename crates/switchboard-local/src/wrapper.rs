// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Empirical selection of a chat-template formatter for a local model,
//! with an on-disk cache keyed by `path|size|mtime`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const PROBE_PROMPT: &str = "Reply with only the word: yes";
const PROBE_MAX_TOKENS: u32 = 20;

/// Filename/architecture family recognised by the name-matching candidate
/// stages. Kept as a closed enum per `spec.md` §4.6's fixed preference
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperFamily {
    Qwen,
    Llama31,
    Llama3,
    Mistral,
    DeepSeek,
    Gemma,
}

impl WrapperFamily {
    pub fn wrapper_name(self) -> &'static str {
        match self {
            WrapperFamily::Qwen => "qwen",
            WrapperFamily::Llama31 => "llama-3.1",
            WrapperFamily::Llama3 => "llama-3",
            WrapperFamily::Mistral => "mistral",
            WrapperFamily::DeepSeek => "deepseek",
            WrapperFamily::Gemma => "gemma",
        }
    }

    /// Fixed preference order shared by the filename-family and
    /// metadata-architecture candidate stages.
    pub const ORDER: [WrapperFamily; 6] = [
        WrapperFamily::Qwen,
        WrapperFamily::Llama31,
        WrapperFamily::Llama3,
        WrapperFamily::Mistral,
        WrapperFamily::DeepSeek,
        WrapperFamily::Gemma,
    ];

    pub fn match_filename(filename: &str) -> Option<Self> {
        let lower = filename.to_lowercase();
        for family in Self::ORDER {
            let needle = match family {
                WrapperFamily::Qwen => "qwen",
                WrapperFamily::Llama31 => "llama-3.1",
                WrapperFamily::Llama3 => "llama-3",
                WrapperFamily::Mistral => "mistral",
                WrapperFamily::DeepSeek => "deepseek",
                WrapperFamily::Gemma => "gemma",
            };
            if lower.contains(needle) {
                return Some(family);
            }
        }
        None
    }
}

/// Generic fallback wrappers in a fixed order, ending with a
/// general-purpose wrapper that always produces *something*.
const GENERIC_FALLBACKS: &[&str] = &["chatml", "llama-2", "alpaca", "vicuna", "general-purpose"];

/// Everything `WrapperProber` needs from the native inference layer,
/// abstracted so the probing algorithm can be unit tested without a real
/// GGUF file. `LocalEngine` provides the production implementation.
pub trait WrapperProbeBackend: Send + Sync {
    /// The library's auto-detected wrapper, found by constructing a
    /// throwaway chat with no explicit wrapper on a 512-token temp
    /// context.
    fn auto_detected_wrapper(&self, model_path: &Path) -> anyhow::Result<String>;

    /// The embedded Jinja chat template name, if the GGUF metadata
    /// carries one.
    fn embedded_jinja_wrapper(&self, model_path: &Path) -> Option<String>;

    /// Architecture family read from GGUF metadata, independent of
    /// filename.
    fn metadata_architecture_family(&self, model_path: &Path) -> Option<WrapperFamily>;

    /// Builds a 512-token temp context + sequence + chat using
    /// `wrapper_name`, generates ≤20 tokens against `PROBE_PROMPT`, and
    /// reports whether the output contains "yes" case-insensitively.
    fn test_candidate(&self, model_path: &Path, wrapper_name: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WrapperCacheFile {
    #[serde(flatten)]
    entries: HashMap<String, String>,
}

fn cache_key(path: &Path, size: u64, mtime: u64) -> String {
    format!("{}|{size}|{mtime}", path.display())
}

fn file_identity(path: &Path) -> anyhow::Result<(u64, u64)> {
    let meta = std::fs::metadata(path)?;
    let mtime = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    Ok((meta.len(), mtime))
}

/// `spec.md` §4.6. Cache is loaded lazily and persisted atomically
/// (temp file + rename) after every successful probe.
pub struct WrapperProber {
    cache_path: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl WrapperProber {
    pub fn new(cache_path: PathBuf) -> Self {
        let cache = Self::load_cache(&cache_path).unwrap_or_default();
        Self { cache_path, cache: Mutex::new(cache) }
    }

    fn load_cache(path: &Path) -> anyhow::Result<HashMap<String, String>> {
        let text = std::fs::read_to_string(path)?;
        let file: WrapperCacheFile = serde_json::from_str(&text)?;
        Ok(file.entries)
    }

    fn persist_cache(&self) -> anyhow::Result<()> {
        let entries = self.cache.lock().unwrap().clone();
        let file = WrapperCacheFile { entries };
        let json = serde_json::to_string_pretty(&file)?;
        let tmp = self.cache_path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.cache_path)?;
        Ok(())
    }

    /// Returns the cached wrapper for `model_path` without running any
    /// probe, or `None` on a cache miss.
    pub fn cached(&self, model_path: &Path) -> anyhow::Result<Option<String>> {
        let (size, mtime) = file_identity(model_path)?;
        let key = cache_key(model_path, size, mtime);
        Ok(self.cache.lock().unwrap().get(&key).cloned())
    }

    /// Runs the full candidate ladder and returns the confirmed wrapper
    /// name, caching the result. If every candidate fails the probe, the
    /// auto-detected wrapper is kept (`WrapperProbeAllFail`, `spec.md` §7:
    /// severity `degrade`).
    pub fn probe(&self, backend: &dyn WrapperProbeBackend, model_path: &Path) -> anyhow::Result<String> {
        if let Some(cached) = self.cached(model_path)? {
            return Ok(cached);
        }

        let auto_detected = backend.auto_detected_wrapper(model_path)?;
        let candidates = self.candidate_order(backend, model_path, &auto_detected);

        for candidate in &candidates {
            if backend.test_candidate(model_path, candidate).unwrap_or(false) {
                self.cache_result(model_path, candidate)?;
                return Ok(candidate.clone());
            }
        }

        // All candidates failed the "yes" probe: degrade to auto-detected.
        self.cache_result(model_path, &auto_detected)?;
        Ok(auto_detected)
    }

    fn candidate_order(
        &self,
        backend: &dyn WrapperProbeBackend,
        model_path: &Path,
        auto_detected: &str,
    ) -> Vec<String> {
        let mut candidates = vec![auto_detected.to_string()];

        if let Some(jinja) = backend.embedded_jinja_wrapper(model_path) {
            candidates.push(jinja);
        }

        let filename = model_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if let Some(family) = WrapperFamily::match_filename(filename) {
            candidates.push(family.wrapper_name().to_string());
        }

        if let Some(family) = backend.metadata_architecture_family(model_path) {
            candidates.push(family.wrapper_name().to_string());
        }

        for fallback in GENERIC_FALLBACKS {
            candidates.push(fallback.to_string());
        }

        // Deduplicate while preserving first-seen order.
        let mut seen = std::collections::HashSet::new();
        candidates.retain(|c| seen.insert(c.clone()));
        candidates
    }

    fn cache_result(&self, model_path: &Path, wrapper: &str) -> anyhow::Result<()> {
        let (size, mtime) = file_identity(model_path)?;
        let key = cache_key(model_path, size, mtime);
        self.cache.lock().unwrap().insert(key, wrapper.to_string());
        self.persist_cache()
    }
}

pub fn probe_prompt() -> &'static str {
    PROBE_PROMPT
}

pub fn probe_max_tokens() -> u32 {
    PROBE_MAX_TOKENS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct MockBackend {
        auto: String,
        jinja: Option<String>,
        arch_family: Option<WrapperFamily>,
        confirms: Vec<String>,
        probe_calls: AtomicUsize,
    }

    impl WrapperProbeBackend for MockBackend {
        fn auto_detected_wrapper(&self, _model_path: &Path) -> anyhow::Result<String> {
            Ok(self.auto.clone())
        }
        fn embedded_jinja_wrapper(&self, _model_path: &Path) -> Option<String> {
            self.jinja.clone()
        }
        fn metadata_architecture_family(&self, _model_path: &Path) -> Option<WrapperFamily> {
            self.arch_family
        }
        fn test_candidate(&self, _model_path: &Path, wrapper_name: &str) -> anyhow::Result<bool> {
            self.probe_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.confirms.iter().any(|c| c == wrapper_name))
        }
    }

    fn touch_model_file(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"gguf-stub").unwrap();
        path
    }

    #[test]
    fn probe_confirms_auto_detected_first() {
        let dir = tempdir().unwrap();
        let model = touch_model_file(dir.path(), "model.gguf");
        let prober = WrapperProber::new(dir.path().join("cache.json"));
        let backend = MockBackend {
            auto: "auto-wrapper".into(),
            jinja: None,
            arch_family: None,
            confirms: vec!["auto-wrapper".into()],
            probe_calls: AtomicUsize::new(0),
        };
        let result = prober.probe(&backend, &model).unwrap();
        assert_eq!(result, "auto-wrapper");
        assert_eq!(backend.probe_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn probe_falls_through_to_filename_family() {
        let dir = tempdir().unwrap();
        let model = touch_model_file(dir.path(), "qwen2.5-7b-instruct.gguf");
        let prober = WrapperProber::new(dir.path().join("cache.json"));
        let backend = MockBackend {
            auto: "auto-wrapper".into(),
            jinja: None,
            arch_family: None,
            confirms: vec!["qwen".into()],
            probe_calls: AtomicUsize::new(0),
        };
        let result = prober.probe(&backend, &model).unwrap();
        assert_eq!(result, "qwen");
    }

    #[test]
    fn probe_falls_back_to_generic_when_families_fail() {
        let dir = tempdir().unwrap();
        let model = touch_model_file(dir.path(), "mystery-model.gguf");
        let prober = WrapperProber::new(dir.path().join("cache.json"));
        let backend = MockBackend {
            auto: "auto-wrapper".into(),
            jinja: None,
            arch_family: None,
            confirms: vec!["alpaca".into()],
            probe_calls: AtomicUsize::new(0),
        };
        let result = prober.probe(&backend, &model).unwrap();
        assert_eq!(result, "alpaca");
    }

    #[test]
    fn probe_degrades_to_auto_detected_when_all_fail() {
        let dir = tempdir().unwrap();
        let model = touch_model_file(dir.path(), "mystery-model.gguf");
        let prober = WrapperProber::new(dir.path().join("cache.json"));
        let backend = MockBackend {
            auto: "auto-wrapper".into(),
            jinja: None,
            arch_family: None,
            confirms: vec![],
            probe_calls: AtomicUsize::new(0),
        };
        let result = prober.probe(&backend, &model).unwrap();
        assert_eq!(result, "auto-wrapper");
    }

    #[test]
    fn cache_hit_skips_probing_entirely() {
        let dir = tempdir().unwrap();
        let model = touch_model_file(dir.path(), "model.gguf");
        let prober = WrapperProber::new(dir.path().join("cache.json"));
        let backend = MockBackend {
            auto: "auto-wrapper".into(),
            jinja: None,
            arch_family: None,
            confirms: vec!["auto-wrapper".into()],
            probe_calls: AtomicUsize::new(0),
        };
        prober.probe(&backend, &model).unwrap();
        assert_eq!(backend.probe_calls.load(Ordering::SeqCst), 1);

        // Fresh backend instance that would fail every probe — if the
        // cache is consulted, probe() never calls test_candidate again.
        let backend2 = MockBackend {
            auto: "auto-wrapper".into(),
            jinja: None,
            arch_family: None,
            confirms: vec![],
            probe_calls: AtomicUsize::new(0),
        };
        let result = prober.probe(&backend2, &model).unwrap();
        assert_eq!(result, "auto-wrapper");
        assert_eq!(backend2.probe_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn candidate_order_is_deduplicated() {
        let dir = tempdir().unwrap();
        let model = touch_model_file(dir.path(), "llama-3-8b.gguf");
        let prober = WrapperProber::new(dir.path().join("cache.json"));
        let backend = MockBackend {
            auto: "llama-3".into(), // same as the filename-family match
            jinja: None,
            arch_family: None,
            confirms: vec![],
            probe_calls: AtomicUsize::new(0),
        };
        let candidates = prober.candidate_order(&backend, &model, "llama-3");
        let count_llama3 = candidates.iter().filter(|c| c.as_str() == "llama-3").count();
        assert_eq!(count_llama3, 1);
    }

    #[test]
    fn embedded_jinja_candidate_is_tried() {
        let dir = tempdir().unwrap();
        let model = touch_model_file(dir.path(), "model.gguf");
        let prober = WrapperProber::new(dir.path().join("cache.json"));
        let backend = MockBackend {
            auto: "auto-wrapper".into(),
            jinja: Some("embedded-jinja".into()),
            arch_family: None,
            confirms: vec!["embedded-jinja".into()],
            probe_calls: AtomicUsize::new(0),
        };
        let result = prober.probe(&backend, &model).unwrap();
        assert_eq!(result, "embedded-jinja");
    }

    #[test]
    fn filename_family_matches_in_preference_order() {
        assert_eq!(WrapperFamily::match_filename("Qwen2.5-Coder-7B.gguf"), Some(WrapperFamily::Qwen));
        assert_eq!(WrapperFamily::match_filename("Meta-Llama-3.1-8B.gguf"), Some(WrapperFamily::Llama31));
        assert_eq!(WrapperFamily::match_filename("Meta-Llama-3-8B.gguf"), Some(WrapperFamily::Llama3));
        assert_eq!(WrapperFamily::match_filename("totally-unknown-model.gguf"), None);
    }

    #[test]
    fn probe_prompt_is_the_yes_probe() {
        assert!(probe_prompt().to_lowercase().contains("yes"));
        assert_eq!(probe_max_tokens(), 20);
    }
}
