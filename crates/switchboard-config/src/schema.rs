// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Serde default helper — returns `true`.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Named provider configurations, keyed by an arbitrary alias.
    ///
    /// Define custom endpoints, local models, or additional accounts here
    /// and reference them by name with `--model <key>` or
    /// `--model <key>/<model>`.
    #[serde(default)]
    pub providers: HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier. Run `switchboard list-providers` for the full list.
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer `api_key_env` in config files to avoid
    /// secrets in version-controlled files.
    pub api_key: Option<String>,
    /// Additional keys for the same provider, added to the KeyPool in
    /// order after `api_key`/`api_key_env`. Used for round-robin rotation
    /// across multiple accounts (spec §4.1 KeyPool).
    #[serde(default)]
    pub extra_keys: Vec<String>,
    /// Base URL override. Useful for local proxies or Cloudflare gateways.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0-2.0).
    pub temperature: Option<f32>,

    /// Wire-format dialect override. When unset, the dialect is looked up
    /// from the static `ProviderRegistry` record for `provider`.
    pub dialect: Option<String>,

    /// Whether this provider is a bundled (shipped-with-the-product)
    /// credential routed through the proxy endpoint rather than a
    /// user-supplied key (spec §4.3 step 1, §6 Proxy routing).
    #[serde(default)]
    pub bundled: bool,

    /// Per-provider requests-per-minute override. When unset, the
    /// `ProviderRegistry` record's `default_rpm_per_key` is used.
    pub rpm_override: Option<u32>,

    // ── Azure OpenAI ─────────────────────────────────────────────────────
    pub azure_resource: Option<String>,
    pub azure_deployment: Option<String>,
    pub azure_api_version: Option<String>,

    // ── AWS Bedrock ──────────────────────────────────────────────────────
    pub aws_region: Option<String>,

    // ── Prompt caching (Anthropic) ───────────────────────────────────────
    /// Attach an explicit cache-control marker to the system message.
    /// No-op for providers that cache automatically (OpenAI, Google).
    #[serde(default = "default_true")]
    pub cache_system_prompt: bool,
    #[serde(default)]
    pub extended_cache_time: bool,
    #[serde(default = "default_true")]
    pub cache_tools: bool,
    #[serde(default = "default_true")]
    pub cache_conversation: bool,

    /// Free-form provider-specific options forwarded as-is to the driver.
    #[serde(default)]
    pub driver_options: serde_json::Value,

    // ── Local / GGUF ─────────────────────────────────────────────────────
    /// Path to a local GGUF model file. Only meaningful when
    /// `provider = "local"`.
    pub model_path: Option<String>,
    /// GPU mode: "auto" | "off". Drives the LocalEngine load ladder.
    #[serde(default = "default_gpu_mode")]
    pub gpu_mode: String,
}

fn default_gpu_mode() -> String {
    "auto".into()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            api_key_env: None,
            api_key: None,
            extra_keys: Vec::new(),
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            dialect: None,
            bundled: false,
            rpm_override: None,
            azure_resource: None,
            azure_deployment: None,
            azure_api_version: None,
            aws_region: None,
            cache_system_prompt: true,
            extended_cache_time: false,
            cache_tools: true,
            cache_conversation: true,
            driver_options: serde_json::Value::Null,
            model_path: None,
            gpu_mode: default_gpu_mode(),
        }
    }
}

fn default_agent_mode() -> AgentMode {
    AgentMode::Agent
}
fn default_max_iterations_cloud() -> u32 {
    500
}
fn default_max_iterations_local() -> u32 {
    100
}
fn default_compaction_threshold() -> f32 {
    0.85
}
fn default_nudge_budget() -> u32 {
    3
}
fn default_max_rotations() -> u32 {
    10
}
fn default_wall_clock_deadline_secs() -> u64 {
    30 * 60
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategy {
    #[default]
    Structured,
    Narrative,
}

impl std::fmt::Display for CompactionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactionStrategy::Structured => write!(f, "structured"),
            CompactionStrategy::Narrative => write!(f, "narrative"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Default mode when none is specified on the CLI.
    #[serde(default = "default_agent_mode")]
    pub default_mode: AgentMode,
    /// Max iterations for a cloud-backed turn (spec §4.7: default 500 cloud).
    #[serde(default = "default_max_iterations_cloud")]
    pub max_iterations_cloud: u32,
    /// Max iterations for a local-GGUF-backed turn (spec §4.7: default 100 local).
    #[serde(default = "default_max_iterations_local")]
    pub max_iterations_local: u32,
    /// Wall-clock deadline per turn in seconds (spec §4.7: 30 minutes).
    #[serde(default = "default_wall_clock_deadline_secs")]
    pub wall_clock_deadline_secs: u64,
    /// Token fraction at which proactive compaction triggers (phase 1 of
    /// ContextCompactor, spec §4.8 uses fixed 60/70/80/85% but this scales
    /// them together for model-specific tuning).
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,
    /// Compaction checkpoint format.
    #[serde(default)]
    pub compaction_strategy: CompactionStrategy,
    /// Nudges permitted per turn (spec §4.7: up to 3).
    #[serde(default = "default_nudge_budget")]
    pub nudge_budget: u32,
    /// Context rotations permitted per turn (spec §4.8 phase 4: max 10).
    #[serde(default = "default_max_rotations")]
    pub max_rotations: u32,
    /// System prompt override; leave `None` to use the built-in prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_mode: AgentMode::Agent,
            max_iterations_cloud: default_max_iterations_cloud(),
            max_iterations_local: default_max_iterations_local(),
            wall_clock_deadline_secs: default_wall_clock_deadline_secs(),
            compaction_threshold: default_compaction_threshold(),
            compaction_strategy: CompactionStrategy::Structured,
            nudge_budget: default_nudge_budget(),
            max_rotations: default_max_rotations(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// No tool calls offered, single generation.
    Chat,
    /// Full agentic tool-use loop.
    Agent,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Chat => write!(f, "chat"),
            AgentMode::Agent => write!(f, "agent"),
        }
    }
}

fn default_tool_pace_ms() -> u64 {
    0
}
fn default_browser_burst_cap() -> usize {
    2
}
fn default_tool_result_token_cap() -> usize {
    4000
}
fn default_tool_timeout_secs() -> u64 {
    30
}
fn default_auto_approve_patterns() -> Vec<String> {
    vec!["read_file *".to_string(), "list_files".to_string(), "list_files *".to_string()]
}
fn default_deny_patterns() -> Vec<String> {
    vec!["shell *command=rm -rf*".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Timeout in seconds for a single tool call.
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    /// Sleep between successive tool executions within one response
    /// (spec §4.9 stage 7: optional `tool_pace_ms`).
    #[serde(default = "default_tool_pace_ms")]
    pub tool_pace_ms: u64,
    /// Max state-changing browser actions per response (spec §4.7).
    #[serde(default = "default_browser_burst_cap")]
    pub browser_burst_cap: usize,
    /// Max tokens for a single tool result before deterministic truncation.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
    /// Glob patterns that auto-approve a shell-style tool command.
    #[serde(default = "default_auto_approve_patterns")]
    pub auto_approve_patterns: Vec<String>,
    /// Glob patterns that always deny a command, even if it also matches
    /// an auto-approve pattern.
    #[serde(default = "default_deny_patterns")]
    pub deny_patterns: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
            tool_pace_ms: default_tool_pace_ms(),
            browser_burst_cap: default_browser_burst_cap(),
            tool_result_token_cap: default_tool_result_token_cap(),
            auto_approve_patterns: default_auto_approve_patterns(),
            deny_patterns: default_deny_patterns(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
