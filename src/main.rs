// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use switchboard_config::{AgentMode, Config};
use switchboard_core::{AgentEvent, AgentSession, AgenticLoop, AgenticLoopConfig, RequestGate};
use switchboard_providers::{
    CloudDispatcher, CloudModelProvider, GenerateRequest, HttpClient, KeyPool, ModelProvider, ProviderRegistry,
};
use switchboard_tools::{ExecutionState, PipelineOptions, ToolExecutor, ToolRegistry};

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are switchboard, an agent that completes tasks by calling tools when needed and \
     answering directly when it isn't. Be precise, verify claims against tool output, and \
     never assert a URL was visited or a file was written unless a tool call actually did so.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        return match cmd {
            Commands::Completions { shell } => {
                cli::print_completions(*shell);
                Ok(())
            }
            Commands::ShowConfig => {
                let config = switchboard_config::load(cli.config.as_deref())?;
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                Ok(())
            }
            Commands::ListModels { provider, json } => {
                let config = switchboard_config::load(cli.config.as_deref())?;
                list_models_cmd(&config, provider.as_deref(), *json)
            }
            Commands::ListProviders { verbose, json } => list_providers_cmd(*verbose, *json),
        };
    }

    let mut config = switchboard_config::load(cli.config.as_deref())?;
    if let Some(model) = &cli.model {
        apply_model_override(&mut config, model);
    }

    let prompt = match cli.prompt {
        Some(p) => p,
        None => read_stdin_prompt()?,
    };
    if prompt.trim().is_empty() {
        anyhow::bail!("no prompt given: pass one as an argument or pipe it on stdin");
    }

    run_turn(&config, cli.mode, &prompt).await
}

fn read_stdin_prompt() -> anyhow::Result<String> {
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf).context("reading stdin")?;
    Ok(buf)
}

fn apply_model_override(config: &mut Config, model: &str) {
    if let Some((provider, name)) = model.split_once('/') {
        config.model.provider = provider.to_string();
        config.model.name = name.to_string();
    } else if let Some(named) = config.providers.get(model).cloned() {
        config.model = named;
    } else {
        config.model.name = model.to_string();
    }
}

/// Builds the `ModelProvider` this turn dispatches against, either the
/// local GGUF engine or a cloud provider wired through `CloudDispatcher`,
/// along with the model's context window.
async fn build_model_provider(config: &Config) -> anyhow::Result<(Arc<dyn ModelProvider>, usize)> {
    if config.model.provider == "local" {
        return build_local_provider(config).await;
    }

    let registry = Arc::new(ProviderRegistry::embedded()?);
    let http = Arc::new(HttpClient::new()?);
    let dispatcher = Arc::new(CloudDispatcher::new(registry.clone(), http));

    if let Some(key) = &config.model.api_key {
        dispatcher.key_pool().add(&config.model.provider, key.clone());
    }
    if let Some(env_var) = &config.model.api_key_env {
        if let Ok(key) = std::env::var(env_var) {
            dispatcher.key_pool().add(&config.model.provider, key);
        }
    }
    for key in &config.model.extra_keys {
        dispatcher.key_pool().add(&config.model.provider, key.clone());
    }

    let context_window = registry
        .lookup_by_model_name(&config.model.name)
        .map(|m| m.context_window as usize)
        .unwrap_or(128_000);

    let provider = CloudModelProvider::new(dispatcher, registry, config.model.provider.clone());
    Ok((Arc::new(provider), context_window))
}

async fn build_local_provider(config: &Config) -> anyhow::Result<(Arc<dyn ModelProvider>, usize)> {
    use llama_cpp_2::llama_backend::LlamaBackend;
    use switchboard_local::{LocalEngine, SystemResourceProbe, WrapperProber};

    let model_path = config
        .model
        .model_path
        .as_ref()
        .context("model.model_path must be set when model.provider = \"local\"")?;

    let backend = Arc::new(LlamaBackend::init().context("initializing llama.cpp backend")?);
    let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache")).join("switchboard/wrapper-probe.json");
    let wrapper_prober = Arc::new(WrapperProber::new(cache_dir));
    let resource_probe = Arc::new(SystemResourceProbe);

    let engine = Arc::new(LocalEngine::new(backend, wrapper_prober, resource_probe));
    engine.initialize(PathBuf::from(model_path)).await?;

    Ok((engine, 32_768))
}

async fn run_turn(config: &Config, mode: AgentMode, prompt: &str) -> anyhow::Result<()> {
    let (model, context_window) = build_model_provider(config).await?;
    let system_prompt = config.agent.system_prompt.clone().unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

    let mut session = AgentSession::new(context_window);
    session.push(switchboard_providers::ChatTurn::System(system_prompt.clone()));
    session.push(switchboard_providers::ChatTurn::user(prompt.to_string()));

    if mode == AgentMode::Chat {
        return run_single_generation(model.as_ref(), &config.model.provider, &config.model.name, &system_prompt, &session).await;
    }

    let executor: Arc<dyn ToolExecutor> = Arc::new(ToolRegistry::new());
    let pipeline_opts = PipelineOptions::default();
    let loop_config = if config.model.provider == "local" {
        AgenticLoopConfig::for_local(system_prompt, config.model.provider.clone(), config.model.name.clone())
    } else {
        AgenticLoopConfig::for_cloud(system_prompt, config.model.provider.clone(), config.model.name.clone())
    };
    let agentic_loop = AgenticLoop::new(model, executor, pipeline_opts, loop_config);

    let mut state = ExecutionState::new();
    let mut events = Vec::new();
    let reason = agentic_loop.run_turn(&mut session, &mut state, &mut events).await;

    for event in &events {
        print_event(event);
    }
    tracing::info!(?reason, "turn finished");
    Ok(())
}

async fn run_single_generation(
    model: &dyn ModelProvider,
    provider: &str,
    model_name: &str,
    system_prompt: &str,
    session: &AgentSession,
) -> anyhow::Result<()> {
    use futures::StreamExt;
    use switchboard_providers::Chunk;

    let request = GenerateRequest {
        provider: provider.to_string(),
        model: model_name.to_string(),
        system_prompt: system_prompt.to_string(),
        messages: session.history.snapshot(),
        max_tokens: 4096,
        temperature: 0.2,
        stream: true,
    };
    let mut stream = model.generate(request).await?;
    while let Some(chunk) = stream.next().await {
        if let Ok(Chunk::Text(text)) = chunk {
            print!("{text}");
        }
    }
    println!();
    Ok(())
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::LlmToken(text) => print!("{text}"),
        AgentEvent::LlmThinkingToken(_) => {}
        AgentEvent::ToolExecuting { tool, params } => tracing::info!(tool, %params, "executing tool"),
        AgentEvent::ToolResults(results) => {
            for r in results {
                tracing::info!(tool = %r.tool, success = r.success, "tool result");
            }
        }
        _ => {}
    }
}

fn list_models_cmd(config: &Config, provider_filter: Option<&str>, as_json: bool) -> anyhow::Result<()> {
    let registry = ProviderRegistry::embedded()?;
    if let Some(prov) = provider_filter {
        if registry.provider(prov).is_none() {
            eprintln!("Unknown provider: {prov:?}");
            anyhow::bail!("invalid provider: {prov}");
        }
    }

    let mut entries: Vec<_> = match provider_filter {
        Some(prov) => registry.models_for_provider(prov),
        None => registry.provider_ids().iter().flat_map(|p| registry.models_for_provider(p)).collect(),
    };
    entries.sort_by(|a, b| a.provider.cmp(&b.provider).then(a.id.cmp(&b.id)));

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No models found.");
        let _ = config;
        return Ok(());
    }

    let id_w = entries.iter().map(|e| e.id.len()).max().unwrap_or(10).max(10);
    let prov_w = entries.iter().map(|e| e.provider.len()).max().unwrap_or(8).max(8);
    println!("{:<id_w$}  {:<prov_w$}  {:>12}  {:>16}", "ID", "PROVIDER", "CTX WINDOW", "MAX OUT TOKENS", id_w = id_w, prov_w = prov_w);
    println!("{}", "-".repeat(id_w + prov_w + 34));
    for e in &entries {
        println!(
            "{:<id_w$}  {:<prov_w$}  {:>12}  {:>16}",
            e.id,
            e.provider,
            e.context_window,
            e.max_output_tokens,
            id_w = id_w,
            prov_w = prov_w
        );
    }
    println!("\nTotal: {} model(s)", entries.len());
    Ok(())
}

fn list_providers_cmd(verbose: bool, as_json: bool) -> anyhow::Result<()> {
    let registry = ProviderRegistry::embedded()?;
    let mut ids = registry.provider_ids();
    ids.sort();

    if as_json {
        #[derive(serde::Serialize)]
        struct ProviderJson<'a> {
            id: &'a str,
            host: &'a str,
            dialect: switchboard_providers::Dialect,
            bundled: bool,
        }
        let rows: Vec<_> = ids
            .iter()
            .filter_map(|id| registry.provider(id).map(|r| ProviderJson { id, host: &r.host, dialect: r.dialect, bundled: r.bundled }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("Supported Model Providers ({} total)\n", ids.len());
    for id in &ids {
        let Some(record) = registry.provider(id) else { continue };
        if verbose {
            println!("  {id} — {:?} dialect", record.dialect);
            println!("    host: {}", record.host);
            println!("    default model: {}", record.default_model);
            if record.bundled {
                println!("    bundled: yes (routed through the proxy endpoint)");
            }
            println!();
        } else {
            println!("{id:<20} {}", record.host);
        }
    }
    if !verbose {
        println!("\nUse `switchboard list-providers --verbose` for endpoint details.");
    }
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry().with(fmt::layer().with_target(false).with_writer(std::io::stderr)).with(filter).try_init();
}
