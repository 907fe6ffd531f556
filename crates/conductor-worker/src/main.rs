//! Conductor worker binary.
//!
//! Wires the runtime together and polls the queue until interrupted. The
//! default build runs against the in-memory queue and stores (single-node
//! mode); multi-worker deployments point the same wiring at shared backing
//! services.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use conductor_runtime::config::RuntimeConfig;
use conductor_runtime::events::TracingEventSink;
use conductor_runtime::gateway::LlmGateway;
use conductor_runtime::governance::{
    BreakerRegistry, BudgetLedger, MemoryGovernanceStore, RateLimiter,
};
use conductor_runtime::providers::{builtin_factories, ProviderSet};
use conductor_runtime::queue::InMemoryQueue;
use conductor_runtime::state::MemoryStateStore;
use conductor_runtime::tools::{ToolError, ToolOutcome, ToolRequest, ToolRuntime};
use conductor_runtime::{CompletionCache, StepExecutor, Worker};

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor step-execution worker", version)]
struct Cli {
    /// Path to the worker configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker loop until interrupted.
    Run,
    /// Parse and validate the configuration, then exit.
    ValidateConfig,
}

/// Stand-in used until a sandbox endpoint is wired in; rejects every tool.
struct UnconfiguredToolRuntime;

#[async_trait::async_trait]
impl ToolRuntime for UnconfiguredToolRuntime {
    async fn execute(&self, request: ToolRequest) -> Result<ToolOutcome, ToolError> {
        Err(ToolError::Unavailable(format!(
            "no tool runtime configured (requested tool '{}')",
            request.tool
        )))
    }

    fn name(&self) -> &str {
        "unconfigured"
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::from_yaml_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::ValidateConfig => {
            config.validate()?;
            println!("configuration is valid");
            Ok(())
        }
        Command::Run => run(config).await,
    }
}

async fn run(config: RuntimeConfig) -> anyhow::Result<()> {
    let governance = Arc::new(MemoryGovernanceStore::new());
    let state = Arc::new(MemoryStateStore::new());
    let queue = Arc::new(InMemoryQueue::new(config.queue.visibility_timeout));
    let events = Arc::new(TracingEventSink);

    let providers = ProviderSet::from_config(&config.gateway, &builtin_factories())
        .context("building provider set")?;
    tracing::info!(providers = ?providers.names(), "providers initialized");

    let gateway = Arc::new(LlmGateway::new(
        providers,
        BudgetLedger::new(Arc::clone(&governance) as _, config.gateway.budget.clone()),
        RateLimiter::new(
            Arc::clone(&governance) as _,
            config.gateway.rate_limit.clone(),
            config.gateway.budget.store_timeout,
        ),
        BreakerRegistry::new(
            Arc::clone(&governance) as _,
            config.gateway.circuit_breaker.clone(),
        ),
        CompletionCache::new(&config.gateway.cache),
        Arc::clone(&events) as _,
        config.gateway.clone(),
    ));

    let executor = Arc::new(StepExecutor::new(
        Arc::clone(&state) as _,
        gateway,
        Arc::new(UnconfiguredToolRuntime),
        Arc::clone(&queue) as _,
        Arc::clone(&events) as _,
        &config,
    ));

    let worker = Worker::new(Arc::clone(&queue) as _, executor, config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        tracing::info!("shutdown requested, draining in-flight steps");
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await;
    Ok(())
}
