// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;
use switchboard_config::ToolsConfig;
use switchboard_providers::ToolCall;

/// Per-tool approval policy returned by [`ToolPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    /// Run without asking the host to confirm.
    Auto,
    /// Ask the host to confirm before `ToolPipeline` executes it.
    Ask,
    /// Never run; `ToolPipeline` reports it as skipped.
    Deny,
}

/// Gate in front of `ToolPipeline` stage 7 (execute): every `ToolCall`
/// destined for the opaque `ToolExecutor` is checked against glob patterns
/// compiled from `ToolsConfig` first. Deny patterns are checked before auto
/// patterns so a tightened deny rule always wins over a looser auto rule.
#[derive(Debug)]
pub struct ToolPolicy {
    auto_patterns: Vec<Regex>,
    deny_patterns: Vec<Regex>,
}

impl ToolPolicy {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        Self {
            auto_patterns: compile_patterns(&cfg.auto_approve_patterns),
            deny_patterns: compile_patterns(&cfg.deny_patterns),
        }
    }

    /// Decide the approval policy for a parsed tool call. Patterns match
    /// against a canonical signature `"<tool_name> <sorted key=value params>"`
    /// so a pattern can target either the tool alone (`"read_file *"`) or a
    /// specific argument (`"shell *command=rm*"`).
    pub fn decide(&self, call: &ToolCall) -> ApprovalPolicy {
        let signature = call_signature(call);
        if self.deny_patterns.iter().any(|re| re.is_match(&signature)) {
            return ApprovalPolicy::Deny;
        }
        if self.auto_patterns.iter().any(|re| re.is_match(&signature)) {
            return ApprovalPolicy::Auto;
        }
        ApprovalPolicy::Ask
    }
}

fn call_signature(call: &ToolCall) -> String {
    let mut sig = call.name.clone();
    for (k, v) in &call.params {
        sig.push(' ');
        sig.push_str(k);
        sig.push('=');
        sig.push_str(&v.to_string());
    }
    sig
}

fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
}

/// Convert a simple shell-glob pattern (`*` matches anything, `?` matches one
/// char) into an anchored [`Regex`] usable against a [`call_signature`].
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn call(name: &str, params: &[(&str, serde_json::Value)]) -> ToolCall {
        ToolCall {
            name: name.to_string(),
            params: params.iter().map(|(k, v)| (k.to_string(), v.clone())).collect::<BTreeMap<_, _>>(),
        }
    }

    fn policy_with(auto: &[&str], deny: &[&str]) -> ToolPolicy {
        ToolPolicy::from_config(&ToolsConfig {
            auto_approve_patterns: auto.iter().map(|s| s.to_string()).collect(),
            deny_patterns: deny.iter().map(|s| s.to_string()).collect(),
            ..ToolsConfig::default()
        })
    }

    #[test]
    fn deny_beats_auto_for_same_tool() {
        let p = policy_with(&["shell *"], &["shell *"]);
        assert_eq!(p.decide(&call("shell", &[("command", json!("rm -rf /tmp/x"))])), ApprovalPolicy::Deny);
    }

    #[test]
    fn deny_matches_argument_signature() {
        let p = policy_with(&[], &["shell *command=rm*"]);
        assert_eq!(p.decide(&call("shell", &[("command", json!("rm -rf /"))])), ApprovalPolicy::Deny);
    }

    #[test]
    fn deny_does_not_match_different_tool() {
        let p = policy_with(&[], &["shell *command=rm*"]);
        assert_ne!(p.decide(&call("read_file", &[("path", json!("x.rs"))])), ApprovalPolicy::Deny);
    }

    #[test]
    fn auto_approve_by_tool_name_alone() {
        let p = policy_with(&["read_file *"], &[]);
        assert_eq!(p.decide(&call("read_file", &[("path", json!("README.md"))])), ApprovalPolicy::Auto);
    }

    #[test]
    fn auto_approve_exact_no_params() {
        let p = policy_with(&["list_files"], &[]);
        assert_eq!(p.decide(&call("list_files", &[])), ApprovalPolicy::Auto);
    }

    #[test]
    fn unknown_tool_results_in_ask() {
        let p = policy_with(&["read_file *"], &["shell *command=rm*"]);
        assert_eq!(p.decide(&call("browser_navigate", &[("url", json!("https://example.com"))])), ApprovalPolicy::Ask);
    }

    #[test]
    fn empty_patterns_always_ask() {
        let p = policy_with(&[], &[]);
        assert_eq!(p.decide(&call("anything", &[])), ApprovalPolicy::Ask);
    }

    #[test]
    fn default_config_auto_approves_read_file() {
        let p = ToolPolicy::from_config(&ToolsConfig::default());
        assert_eq!(p.decide(&call("read_file", &[("path", json!("README.md"))])), ApprovalPolicy::Auto);
    }

    #[test]
    fn default_config_asks_for_shell() {
        let p = ToolPolicy::from_config(&ToolsConfig::default());
        assert_eq!(p.decide(&call("shell", &[("command", json!("cargo build"))])), ApprovalPolicy::Ask);
    }
}
