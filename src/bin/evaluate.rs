//! `evaluate` — command-line entry point for running a batch of catalog tasks against a
//! target service and model, then aggregating the results (§6.7).
//!
//! Exit code is 0 iff every scheduled run's pipeline reached a terminal state (success,
//! verification failure, or exhausted retries all count as "terminated"); a non-zero exit is
//! reserved for orchestrator-internal faults — bad configuration, an unreadable catalog, or a
//! catastrophic artefact-write failure — not for individual task outcomes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use evalforge::agent_runner::AgentLimits;
use evalforge::catalog::{self, TaskFilter};
use evalforge::client_wrapper::ClientWrapper;
use evalforge::clients::{claude, gemini, grok, openai};
use evalforge::event::EventHandler;
use evalforge::model::{Cancellation, RunContext, ServiceName};
use evalforge::pipeline::PipelineDeps;
use evalforge::registry::ServiceRegistry;
use evalforge::worker_pool::{ScheduledRun, WorkerPool, WorkerPoolConfig};
use evalforge::{aggregator, artefacts, state_managers};

#[derive(Parser, Debug)]
#[command(name = "evaluate", about = "Run agentic-LLM evaluations against a catalog of tasks")]
struct Args {
    /// Service to evaluate against (notion, github, filesystem, postgres, browser).
    #[arg(long)]
    service: ServiceName,

    /// Model identifier, e.g. `gpt-5.2`, `claude-opus-4-6`, `gemini-2.5-pro`, `grok-3`.
    #[arg(long)]
    model: String,

    /// Optional `category` or `category/name` filter; omit to run every task for the service.
    #[arg(long)]
    tasks: Option<String>,

    /// Number of repeated runs per task (the `k` in pass@k).
    #[arg(long, default_value_t = 1)]
    runs: u32,

    /// Global concurrency cap; per-service caps are layered on top (§4.8).
    #[arg(long, default_value_t = 4)]
    max_workers: usize,

    /// Catalog root to discover tasks from.
    #[arg(long, default_value = "catalog")]
    catalog_root: PathBuf,

    /// Per-run wall-clock deadline override, in seconds.
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Output root for run artefacts and the final `k_run_summary.json`.
    #[arg(long, default_value = "output")]
    output: PathBuf,

    /// Name recorded as `experiment_name` in `k_run_summary.json` (§6.6); defaults to
    /// `<service>__<model>` when omitted.
    #[arg(long)]
    experiment: Option<String>,
}

fn build_client(model: &str) -> Result<Arc<dyn ClientWrapper>, Box<dyn std::error::Error>> {
    let client: Arc<dyn ClientWrapper> = if model.starts_with("claude-") {
        let key = std::env::var("ANTHROPIC_KEY")?;
        Arc::new(claude::ClaudeClient::new_with_model_str(&key, model))
    } else if model.starts_with("gemini-") {
        let key = std::env::var("GEMINI_KEY")?;
        Arc::new(gemini::GeminiClient::new_with_model_string(&key, model))
    } else if model.starts_with("grok-") {
        let key = std::env::var("XAI_KEY")?;
        Arc::new(grok::GrokClient::new_with_model_str(&key, model))
    } else {
        let key = std::env::var("OPEN_AI_SECRET")?;
        Arc::new(openai::OpenAIClient::new_with_model_string(&key, model))
    };
    Ok(client)
}

fn build_state_manager(
    service: ServiceName,
    resolved: &evalforge::config::ResolvedConfig,
) -> Arc<dyn evalforge::state_manager::StateManager> {
    match service {
        ServiceName::Filesystem => {
            let cleanup = resolved
                .get("cleanup_on_exit")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            Arc::new(state_managers::filesystem::FilesystemStateManager::new(cleanup))
        }
        ServiceName::Notion => Arc::new(state_managers::notion::NotionStateManager::new(
            resolved.get_str("source_api_key").unwrap_or_default().to_string(),
            resolved.get_str("eval_api_key").unwrap_or_default().to_string(),
            resolved
                .get_str("eval_parent_page_title")
                .unwrap_or_default()
                .to_string(),
        )),
        ServiceName::Github => Arc::new(state_managers::github::GithubStateManager::new(
            resolved.get_str("api_key").unwrap_or_default().to_string(),
            resolved.get_str("eval_org").unwrap_or_default().to_string(),
            resolved.get_str("source_org").unwrap_or_default().to_string(),
        )),
        ServiceName::Postgres => Arc::new(state_managers::postgres::PostgresStateManager::new(
            resolved.get_str("host").unwrap_or("localhost").to_string(),
            resolved.get("port").and_then(|v| v.as_int()).unwrap_or(5432) as u16,
            resolved.get_str("database").unwrap_or_default().to_string(),
            resolved.get_str("username").unwrap_or_default().to_string(),
            resolved.get_str("password").unwrap_or_default().to_string(),
        )),
        ServiceName::Browser => {
            let storage_state_path = resolved
                .get_str("storage_state_path")
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string());
            Arc::new(state_managers::browser::BrowserStateManager::new(
                resolved
                    .get("playwright_headless")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true),
                resolved.get_str("playwright_browser").unwrap_or("firefox").to_string(),
                storage_state_path,
            ))
        }
    }
}

struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: &evalforge::event::EvalEvent) {
        log::debug!("evaluate: {event:?}");
    }
}

fn parse_task_filter(service: ServiceName, tasks: &Option<String>) -> TaskFilter {
    match tasks {
        None => TaskFilter::Service(service),
        Some(spec) => match spec.split_once('/') {
            Some((category, name)) => {
                TaskFilter::Exact(service, category.to_string(), name.to_string())
            }
            None => TaskFilter::Category(service, spec.clone()),
        },
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let registry = ServiceRegistry::default();
    let resolved = match registry.resolve(args.service, &HashMap::new()) {
        Ok(resolved) => resolved,
        Err(e) => {
            log::error!("evaluate: configuration invalid: {e}");
            std::process::exit(1);
        }
    };
    let definition = registry
        .get(args.service)
        .expect("service was just resolved against the registry");

    let base_credentials = match args.service {
        ServiceName::Notion => evalforge::registry::notion_credentials(&resolved),
        ServiceName::Github => evalforge::registry::github_credentials(&resolved),
        _ => evalforge::registry::CredentialBundle::default(),
    };

    let raw_tasks = match catalog::discover(&args.catalog_root) {
        Ok(tasks) => tasks,
        Err(e) => {
            log::error!("evaluate: failed to read catalog at {:?}: {e}", args.catalog_root);
            std::process::exit(1);
        }
    };
    let filter = parse_task_filter(args.service, &args.tasks);
    let selected = catalog::filter(&raw_tasks, &filter);
    if selected.is_empty() {
        log::warn!("evaluate: no catalog tasks matched filter {filter:?}");
    }

    let client = match build_client(&args.model) {
        Ok(client) => client,
        Err(e) => {
            log::error!("evaluate: failed to construct a client for model '{}': {e}", args.model);
            std::process::exit(1);
        }
    };
    let state_manager = build_state_manager(args.service, &resolved);
    let events: Arc<dyn EventHandler> = Arc::new(LoggingEventHandler);
    let cancel = Cancellation::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("evaluate: received interrupt, draining in-flight runs");
                cancel.cancel();
            }
        });
    }

    let limits = AgentLimits {
        wall_deadline: Duration::from_secs(args.timeout),
        ..AgentLimits::default()
    };

    let mut scheduled = Vec::new();
    for raw in &selected {
        for run_index in 0..args.runs {
            let task = catalog::materialize(raw);
            let ctx = RunContext {
                run_id: uuid::Uuid::new_v4(),
                task,
                model: args.model.clone(),
                run_index,
                k: args.runs,
                output_root: args.output.clone(),
            };
            let deps = PipelineDeps {
                state_manager: Arc::clone(&state_manager),
                client: Arc::clone(&client),
                launch: definition.launch.clone(),
                base_credentials: base_credentials.clone(),
                limits: limits.clone(),
                cancel: cancel.clone(),
                events: Arc::clone(&events),
            };
            scheduled.push(ScheduledRun { ctx, deps });
        }
    }

    log::info!(
        "evaluate: scheduling {} run(s) across {} task(s) for service={} model={}",
        scheduled.len(),
        selected.len(),
        args.service,
        args.model
    );

    let pool_config = WorkerPoolConfig {
        max_workers: args.max_workers,
        ..WorkerPoolConfig::default()
    };
    let pool = WorkerPool::new(pool_config, cancel.clone());
    let results = pool.run_all(scheduled).await;

    let experiment_name = args
        .experiment
        .clone()
        .unwrap_or_else(|| format!("{}__{}", args.service, args.model));
    let summary = aggregator::aggregate(&results, args.runs, &experiment_name);
    let summary_path = args.output.join("k_run_summary.json");
    match artefacts::write_atomic(&summary_path, &summary) {
        Ok(()) => log::info!("evaluate: wrote summary to {summary_path:?}"),
        Err(e) => {
            log::error!("evaluate: failed to write k_run_summary.json: {e}");
            std::process::exit(1);
        }
    }

    println!(
        "overall pass@1={:.4} pass@k={:.4} pass^k={:.4} avg@k={:.4} across {} group(s)",
        summary.overall_metrics.pass_at_1,
        summary.overall_metrics.pass_at_k,
        summary.overall_metrics.pass_hat_k,
        summary.overall_metrics.avg_at_k,
        summary.overall_metrics.group_count
    );

    Ok(())
}
