use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use wiretap::cli::Cli;
use wiretap::config::WiretapConfig;
use wiretap::events::EventBus;
use wiretap::plugin::{
    discover_plugins, recorder_manifest, DiscoveredPlugin, PluginContext, PluginEngine,
    PluginFactory, PluginRegistry, RecorderPlugin, RECORDER_PLUGIN_NAME,
};
use wiretap::queue::{batch_handler, BatchQueue, BatchQueueConfig};
use wiretap::runner;
use wiretap::storage::{JsonlStore, RecordStore};
use wiretap::stream::StreamSplitter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };

    // Logs go to stderr; stdout belongs to the wrapped tool.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(cli.verbose >= 2)
        .init();

    match run(cli).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(err) => {
            error!("Fatal error: {err:#}");
            eprintln!("Error: {err:#}");
            std::process::exit(1);
        }
    }
}

/// Build the pipeline, run the wrapped command under it, and tear
/// everything down in order: splitter, engine, queue.
async fn run(cli: Cli) -> Result<i32> {
    let mut config = WiretapConfig::load(cli.config.as_deref()).context("loading configuration")?;
    config.plugin_dirs.extend(cli.plugin_dirs);
    if let Some(store_path) = cli.store {
        config.store_path = store_path;
    }
    if config.session_id.is_empty() {
        config.session_id = Uuid::new_v4().to_string();
    }
    let config = Arc::new(config);

    let bus = Arc::new(EventBus::new());
    if let Some(size) = config.replay_buffer {
        bus.enable_replay(size);
    }

    let store: Arc<dyn RecordStore> = Arc::new(JsonlStore::new(config.store_path.clone()));

    let queue_store = store.clone();
    let queue = Arc::new(BatchQueue::with_hooks(
        BatchQueueConfig {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            max_concurrent: config.max_concurrent_flushes,
            retry_attempts: config.retry_attempts,
            retry_delay: config.retry_delay,
        },
        batch_handler(move |batch: Vec<Value>| {
            let store = queue_store.clone();
            async move { store.save_batch(&batch).await }
        }),
        None,
        Some(bus.clone()),
    ));

    let mut registry = PluginRegistry::new();
    let recorder_queue = queue.clone();
    let recorder_factory: PluginFactory =
        Arc::new(move || Arc::new(RecorderPlugin::new(recorder_queue.clone())));
    registry
        .register(RECORDER_PLUGIN_NAME, recorder_factory)
        .context("registering built-in plugins")?;

    let mut discovered = discover_plugins(&config.plugin_dirs, &registry).await;
    // The recorder activates without a manifest on disk, unless one
    // overrides it.
    if !discovered
        .iter()
        .any(|p| p.manifest.name == RECORDER_PLUGIN_NAME)
    {
        if let Some(instance) = registry.bind(RECORDER_PLUGIN_NAME) {
            discovered.push(DiscoveredPlugin {
                manifest: recorder_manifest(),
                instance,
            });
        }
    }

    let context = PluginContext::new(bus.clone(), store.clone(), config.clone());
    let engine = Arc::new(PluginEngine::new(context));
    let loaded = engine
        .load(discovered)
        .await
        .context("resolving plugin dependencies")?;
    info!(count = loaded, session = %config.session_id, "plugins loaded");

    for (name, err) in engine.initialize_all().await {
        warn!(plugin = %name, error = %err, "plugin failed to initialize and was disabled");
    }
    engine.attach(&bus);

    let mut splitter = StreamSplitter::new(bus.clone(), config.session_id.clone());
    splitter.setup_processing();

    let (program, args) = cli
        .command
        .split_first()
        .context("no command to wrap was given")?;
    let outcome = runner::run_wrapped(program, args, &splitter, tokio::io::stdout()).await?;

    splitter.cleanup().await;
    engine.shutdown().await;
    queue.stop().await;

    debug!(bytes = outcome.bytes_mirrored, "run complete");
    Ok(outcome.exit_code)
}
