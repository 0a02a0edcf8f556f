// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use vane_config::ConfigStore;
use vane_memory::{BuildContextConfig, ContextAssembler};
use vane_model::{ChatMessage, ModelConfig, ModelRegistry, ProtocolClient};
use vane_orchestrator::{ModelPreference, ResponseCache, ResponseHandler, RouteRequest, TaskRouter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let store = vane_config::load_store(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::ShowConfig) {
        Commands::ShowConfig => show_config(&store),
        Commands::Models { json } => list_models(&store, json),
        Commands::Chat { prompt, task, priority, session, stream } => {
            run_chat(&store, prompt, task.into(), priority.into(), session, stream).await
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

fn show_config(store: &ConfigStore) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&store.redact_sensitive())?);
    for message in store.validate().messages() {
        eprintln!("{message}");
    }
    Ok(())
}

fn models_from_store(store: &ConfigStore) -> anyhow::Result<Vec<ModelConfig>> {
    let value = store.get("models").unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(value).context("parsing `models` array from config")
}

fn list_models(store: &ConfigStore, json: bool) -> anyhow::Result<()> {
    let models = models_from_store(store)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }
    for model in &models {
        println!(
            "{:<24} tasks={:<3} ctx={:<8} cost/1k={:<6} streaming={}",
            model.model_id,
            model.supported_tasks.len(),
            model.max_context_tokens,
            model.cost_per_1k_tokens,
            model.supports_streaming,
        );
    }
    if models.is_empty() {
        eprintln!("no models configured");
    }
    Ok(())
}

fn build_registry(models: Vec<ModelConfig>) -> Arc<ModelRegistry> {
    let registry = ModelRegistry::new();
    for model in models {
        registry.register(model, true);
    }
    registry
}

fn build_router(store: &ConfigStore, registry: Arc<ModelRegistry>) -> TaskRouter {
    let fallback = store.get_str("routing.fallback_model").unwrap_or_default();
    let mut router = TaskRouter::new(registry, fallback);

    if let Some(Value::Object(defaults)) = store.get("routing.default_model_per_task") {
        for (task_name, model_id) in defaults {
            if let (Ok(task), Some(model_id)) = (serde_json::from_value(Value::String(task_name)), model_id.as_str()) {
                router.set_default_model(task, model_id.to_string());
            }
        }
    }

    if let Some(Value::Object(table)) = store.get("routing.preferences") {
        for (task_name, prefs) in table {
            let Ok(task) = serde_json::from_value(Value::String(task_name)) else { continue };
            let Some(entries) = prefs.as_array() else { continue };
            let preferences: Vec<ModelPreference> = entries
                .iter()
                .filter_map(|entry| {
                    let model_id = entry.get("model_id")?.as_str()?.to_string();
                    let priority = entry.get("priority").and_then(Value::as_u64).unwrap_or(0) as u32;
                    let weight = entry.get("weight").and_then(Value::as_f64).unwrap_or(1.0) as f32;
                    Some(ModelPreference { model_id, priority, weight })
                })
                .collect();
            router.set_preferences(task, preferences);
        }
    }

    router
}

fn build_protocol_client(store: &ConfigStore) -> anyhow::Result<ProtocolClient> {
    let base_url = store.get_str("api.base_url").context("api.base_url is required")?;
    let api_key = store.get_str("api.api_key").context("api.api_key is required")?;
    let timeout_ms = store.get("api.default_timeout_ms").and_then(|v| v.as_u64()).unwrap_or(30_000);
    Ok(ProtocolClient::new(base_url, api_key, timeout_ms))
}

fn build_response_handler(store: &ConfigStore) -> ResponseHandler {
    let cache_enabled = store.get("cache.enabled").and_then(|v| v.as_bool()).unwrap_or(true);
    let cache_tool_calls = store.get("response_handler.cache_tool_calls").and_then(|v| v.as_bool()).unwrap_or(false);
    let temperature_threshold =
        store.get("response_handler.cache_temperature_threshold").and_then(|v| v.as_f64()).unwrap_or(0.01) as f32;
    let default_ttl_secs = store.get("cache.default_ttl_seconds").and_then(|v| v.as_u64()).unwrap_or(3_600);
    let max_entries = store.get("cache.max_entries").and_then(|v| v.as_u64()).unwrap_or(1_000) as usize;

    let cache = ResponseCache::with_limits(cache_enabled, std::time::Duration::from_secs(default_ttl_secs), max_entries);
    ResponseHandler::new(cache, cache_enabled).with_tool_call_caching(cache_tool_calls).with_temperature_threshold(temperature_threshold)
}

async fn run_chat(
    store: &ConfigStore,
    prompt: String,
    task: vane_model::TaskKind,
    priority: vane_model::TaskPriority,
    session: String,
    stream: bool,
) -> anyhow::Result<()> {
    let models = models_from_store(store)?;
    let registry = build_registry(models);
    let router = build_router(store, registry.clone());
    let client = build_protocol_client(store)?;
    let handler = build_response_handler(store);
    let assembler = ContextAssembler::new();

    let mut config = BuildContextConfig::new(task);
    config.include_conversation_history = true;
    config.max_history_messages = store.get("context.max_history_messages").and_then(|v| v.as_u64()).unwrap_or(20) as usize;
    config.max_tokens = store.get("context.max_context_tokens").and_then(|v| v.as_u64()).unwrap_or(8_000) as usize;

    let messages = assembler.build_context(&config, &prompt, &session, Vec::new());

    let mut route_request = RouteRequest::new(task);
    route_request.priority = priority;
    route_request.estimated_tokens = messages.iter().map(|m| m.approx_tokens() as u32).sum();
    let decision = router.route(&route_request);
    if !decision.is_valid() {
        anyhow::bail!("no model available to serve this request: {}", decision.reason);
    }
    debug!(model = %decision.model_id, confidence = decision.confidence, reason = %decision.reason, "routed request");

    let mut request = vane_model::ChatRequest::new(decision.model_id.clone(), messages);
    if let Some(model_config) = &decision.model_config {
        request.temperature = Some(model_config.default_temperature);
        request.max_tokens = Some(model_config.default_max_tokens);
    }
    request.stream = stream;

    let cleanup_interval_secs = store.get("cache.cleanup_interval_seconds").and_then(|v| v.as_u64()).unwrap_or(300);
    let cleanup = handler.cache_handle().spawn_cleanup(std::time::Duration::from_secs(cleanup_interval_secs));

    let outcome = run_request(store, &handler, &registry, &assembler, &client, &session, &prompt, task, priority, &decision.model_id, request).await;
    cleanup.stop().await;
    outcome
}

/// Issues the request (cache lookup, dispatch, registry health feedback) once
/// the route has been decided. Split out of [`run_chat`] so the background
/// cache-cleanup worker can be stopped on every exit path, including the
/// cache-hit shortcut.
#[allow(clippy::too_many_arguments)]
async fn run_request(
    store: &ConfigStore,
    handler: &ResponseHandler,
    registry: &Arc<ModelRegistry>,
    assembler: &ContextAssembler,
    client: &ProtocolClient,
    session: &str,
    prompt: &str,
    task: vane_model::TaskKind,
    priority: vane_model::TaskPriority,
    model_id: &str,
    request: vane_model::ChatRequest,
) -> anyhow::Result<()> {
    let stream = request.stream;

    if let Some(cached) = handler.check_cache(&request) {
        println!("{}", cached.content);
        assembler.add_message(session, ChatMessage::user(prompt));
        assembler.add_message(session, ChatMessage::assistant(&cached.content));
        return Ok(());
    }

    registry.increment_concurrency(model_id);
    let started = std::time::Instant::now();

    let response = if stream {
        let cancel = Arc::new(AtomicBool::new(false));
        let result = client.chat_stream(request.clone(), cancel, StdoutStreamCallbacks).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        registry.decrement_concurrency(model_id);
        registry.update_health(model_id, result.is_ok(), elapsed_ms);
        result?
    } else {
        let max_queue_size = store.get("request_manager.max_queue_size").and_then(|v| v.as_u64()).unwrap_or(1000) as usize;
        let max_global_concurrency = store.get("request_manager.max_global_concurrency").and_then(|v| v.as_u64()).unwrap_or(8) as u32;
        let scheduler_client = Arc::new(build_protocol_client(store)?);
        let scheduler = vane_scheduler::RequestScheduler::new(scheduler_client, max_queue_size, max_global_concurrency);
        scheduler.start();
        let receiver = scheduler.enqueue_request(request.clone(), task, priority, model_id.to_string());
        let result = receiver.await.context("scheduler dropped the response channel")?;
        scheduler.stop().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        registry.decrement_concurrency(model_id);
        registry.update_health(model_id, result.is_ok(), elapsed_ms);
        result?
    };

    if !stream {
        println!("{}", response.content);
    }
    handler.store_cache(&request, &response);
    assembler.add_message(session, ChatMessage::user(prompt));
    assembler.add_message(session, ChatMessage::assistant(&response.content));

    Ok(())
}

#[derive(Default)]
struct StdoutStreamCallbacks;

impl vane_model::StreamCallbacks for StdoutStreamCallbacks {
    fn on_text_delta(&mut self, text: &str) {
        use std::io::Write;
        print!("{text}");
        let _ = std::io::stdout().flush();
    }

    fn on_error(&mut self, error: &vane_model::ServiceError) {
        eprintln!("\nstream error: {error}");
    }

    fn on_complete(&mut self, _response: &vane_model::ChatResponse) {
        println!();
    }
}
