//! Sluice host
//!
//! Loads pipeline definitions from a JSON file, runs them in a
//! [`PipelineModule`], hot-reloads the file when it changes and shuts the
//! pipelines down on Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use sluice_orchestrator::{
    ConfigWatcher, DefinitionSource, DistributedLock, InMemoryLock, JsonFileSource, ModuleConfig,
    PipelineModule,
};
use sluice_pipeline::{Registry, register_builtins};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sluice")]
#[command(about = "Sluice pipeline host", long_about = None)]
struct Cli {
    /// Pipeline definitions file
    #[arg(short, long, env = "SLUICE_PIPELINES")]
    pipelines: Option<PathBuf>,

    /// Identity of this node when holding singleton locks
    #[arg(long, env = "SLUICE_NODE_ID")]
    node_id: Option<String>,

    /// Do not watch the definitions file for changes
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "sluice=info,sluice_orchestrator=info,sluice_pipeline=info,sluice_pool=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    info!("Starting Sluice");

    let config = load_config(&cli)?;
    info!(
        "Loaded configuration: node_id={}, pipelines={}",
        config.node_id,
        config.pipelines_path.display()
    );

    let (source, module) = start_module(&config).await?;

    let watcher_token = CancellationToken::new();
    let watcher = if cli.no_watch {
        None
    } else {
        let watcher =
            ConfigWatcher::new(source.clone(), module.clone(), config.watch_interval).await;
        Some(tokio::spawn(watcher.run(watcher_token.clone())))
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    watcher_token.cancel();
    if let Some(handle) = watcher {
        if let Err(e) = handle.await {
            warn!("Watcher task panicked: {}", e);
        }
    }

    module.shutdown().await?;
    info!("Sluice stopped");
    Ok(())
}

/// Registers the builtins, loads the definitions and starts them.
/// Whatever was created is shut down again if a pipeline fails to start.
async fn start_module(config: &ModuleConfig) -> Result<(Arc<JsonFileSource>, PipelineModule)> {
    let mut registry = Registry::new();
    register_builtins(&mut registry)?;
    info!(
        "Registered processors: {}",
        registry.processor_names().join(", ")
    );

    let source = Arc::new(JsonFileSource::new(config.pipelines_path.clone()));
    let definitions = source
        .load()
        .await
        .context("Failed to load pipeline definitions")?;

    let lock: Arc<dyn DistributedLock> = Arc::new(InMemoryLock::new());
    let module = PipelineModule::new(config.clone(), registry, lock);

    if let Err(e) = module.start(definitions) {
        error!("Failed to start pipelines: {}", e);
        if let Err(e) = module.shutdown().await {
            warn!("Shutdown after failed start: {}", e);
        }
        return Err(e.into());
    }

    Ok((source, module))
}

/// Environment first, command line flags override
fn load_config(cli: &Cli) -> Result<ModuleConfig> {
    let mut config = ModuleConfig::from_env()?;

    if let Some(path) = &cli.pipelines {
        config.pipelines_path = path.clone();
    }

    if let Some(node_id) = &cli.node_id {
        config.node_id = node_id.clone();
    }

    config.validate()?;
    Ok(config)
}
