// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// One candidate config file and the tier it belongs to, for debug logging.
struct Layer {
    tier: &'static str,
    path: PathBuf,
}

/// Layers from lowest to highest priority. Later layers override earlier
/// ones on scalar conflicts; `SWITCHBOARD_CONFIG_DIR` lets a deployment add
/// a directory-based layer between the XDG and workspace tiers without a
/// full `--config` override.
fn layers() -> Vec<Layer> {
    let mut out = Vec::new();
    let push = |out: &mut Vec<Layer>, tier: &'static str, dir: PathBuf| {
        out.push(Layer { tier, path: dir.join("config.yaml") });
        out.push(Layer { tier, path: dir.join("config.yml") });
    };

    push(&mut out, "system", PathBuf::from("/etc/switchboard"));
    if let Some(home) = dirs::home_dir() {
        push(&mut out, "user", home.join(".config/switchboard"));
    }
    if let Some(cfg) = dirs::config_dir() {
        push(&mut out, "xdg", cfg.join("switchboard"));
    }
    if let Ok(extra_dir) = std::env::var("SWITCHBOARD_CONFIG_DIR") {
        push(&mut out, "env", PathBuf::from(extra_dir));
    }
    push(&mut out, "workspace", PathBuf::from(".switchboard"));
    out.push(Layer { tier: "workspace", path: PathBuf::from(".switchboard.yaml") });
    out.push(Layer { tier: "workspace", path: PathBuf::from(".switchboard.yml") });
    out.push(Layer { tier: "workspace", path: PathBuf::from("switchboard.yaml") });
    out.push(Layer { tier: "workspace", path: PathBuf::from("switchboard.yml") });
    out
}

fn read_yaml_layer(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Load configuration by merging every discovered YAML layer in priority
/// order, then an explicit `--config` path (e.g. CLI flag) on top.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    let mut layers_applied = 0usize;

    for layer in layers() {
        if !layer.path.is_file() {
            continue;
        }
        debug!(tier = layer.tier, path = %layer.path.display(), "applying config layer");
        merge_yaml(&mut merged, read_yaml_layer(&layer.path)?);
        layers_applied += 1;
    }

    if let Some(p) = extra {
        debug!(tier = "explicit", path = %p.display(), "applying config layer");
        merge_yaml(&mut merged, read_yaml_layer(p)?);
        layers_applied += 1;
    }

    if layers_applied == 0 {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_value(merged).unwrap_or_default())
}

/// Deep-merge `src` on top of `dst`. Mappings merge key-by-key; anything
/// else (scalars, sequences) is replaced wholesale by `src` — a YAML list
/// in a higher layer always supersedes the lower layer's list rather than
/// concatenating with it.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d.entry(k).or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        merge_yaml(&mut dst, val("x: 2"));
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        merge_yaml(&mut dst, val("b: 99"));
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("model:\n  provider: openai\n  name: gpt-4o");
        merge_yaml(&mut dst, val("model:\n  name: gpt-4o-mini"));
        assert_eq!(dst["model"]["provider"].as_str(), Some("openai"));
        assert_eq!(dst["model"]["name"].as_str(), Some("gpt-4o-mini"));
    }

    #[test]
    fn merge_list_replaces_rather_than_appends() {
        let mut dst = val("keys:\n  - a\n  - b");
        merge_yaml(&mut dst, val("keys:\n  - c"));
        let list: Vec<String> = dst["keys"].as_sequence().unwrap().iter().map(|v| v.as_str().unwrap().to_string()).collect();
        assert_eq!(list, vec!["c".to_string()]);
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/switchboard_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_with_no_extra_path_returns_defaults() {
        let cfg = load(None).unwrap();
        assert_eq!(cfg.model.provider, "openai");
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "model:\n  provider: anthropic\n  name: test-model").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.model.provider, "anthropic");
        assert_eq!(cfg.model.name, "test-model");
    }
}
