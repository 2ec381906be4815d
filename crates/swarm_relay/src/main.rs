use std::{fs, io, path::PathBuf};

use clap::Parser;
use swarm_relay::{
    aggregator::{self, DEFAULT_TICK},
    feed, ConfigError, FeedError, FeedSink, Supervisor, SwarmConfig,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "swarm-relay")]
#[command(about = "Run a swarm of codex app-server workers and relay their events over WebSocket")]
struct Cli {
    /// TOML config file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Repository the workers operate in.
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Number of workers.
    #[arg(long)]
    count: Option<usize>,

    /// Prompt for a worker; repeat to give each worker its own.
    #[arg(long = "prompt")]
    prompts: Vec<String>,

    /// Feed listener port.
    #[arg(long)]
    port: Option<u16>,

    /// Feed listener host.
    #[arg(long)]
    host: Option<String>,

    /// First app-server port; worker `i` listens on base + i.
    #[arg(long)]
    app_server_base_port: Option<u16>,

    #[arg(long)]
    stagger_ms: Option<u64>,

    #[arg(long)]
    restart_delay_ms: Option<u64>,

    /// Restart each worker after its turn completes or its upstream drops.
    #[arg(long)]
    continuous: bool,

    /// Worker binary (default: `codex`).
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Also forward every raw upstream message to subscribers.
    #[arg(long)]
    forward_raw: bool,

    /// Log filter directive, e.g. `info` or `swarm_relay=debug`.
    #[arg(long)]
    log_level: Option<String>,

    /// Write the final run-state export (JSON) here on shutdown.
    #[arg(long)]
    export: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("failed to write export `{path}`: {source}")]
    Export {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize export: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to start runtime: {0}")]
    Runtime(#[source] io::Error),
}

fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let export = cli.export.clone();
    let config = resolve_config(cli)?;
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    runtime.block_on(run(config, export))
}

fn resolve_config(cli: Cli) -> Result<SwarmConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => SwarmConfig::load(path)?,
        None => SwarmConfig::default(),
    };

    if let Some(repo) = cli.repo {
        config.worker.current_dir = Some(repo);
    }
    if let Some(count) = cli.count {
        config.swarm.count = count;
    }
    if !cli.prompts.is_empty() {
        config.swarm.prompts = cli.prompts;
    }
    if let Some(port) = cli.port {
        config.feed.port = port;
    }
    if let Some(host) = cli.host {
        config.feed.host = host;
    }
    if let Some(port) = cli.app_server_base_port {
        config.swarm.app_server_base_port = port;
    }
    if let Some(stagger_ms) = cli.stagger_ms {
        config.swarm.stagger_ms = stagger_ms;
    }
    if let Some(delay_ms) = cli.restart_delay_ms {
        config.swarm.restart_delay_ms = delay_ms;
    }
    if let Some(binary) = cli.binary {
        config.worker.binary = binary;
    }
    config.swarm.continuous |= cli.continuous;
    config.feed.forward_raw |= cli.forward_raw;
    Ok(config)
}

async fn run(config: SwarmConfig, export: Option<PathBuf>) -> Result<(), CliError> {
    let sink = FeedSink::new(config.feed.capacity);
    let listener = feed::bind(&config.feed.addr()).await?;
    let (feed_stop_tx, feed_stop_rx) = watch::channel(false);
    let feed_task = tokio::spawn(feed::serve(listener, sink.clone(), feed_stop_rx));

    let (runs, aggregator_task) = aggregator::spawn(config.thresholds, DEFAULT_TICK, sink.clone());

    Supervisor::new(config, sink, runs.clone())
        .run(shutdown_signal())
        .await;

    if let Some(path) = export {
        let body = serde_json::to_string_pretty(&runs.export().await)?;
        fs::write(&path, body).map_err(|source| CliError::Export {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "wrote run export");
    }

    drop(runs);
    let _ = feed_stop_tx.send(true);
    if let Err(err) = feed_task.await {
        warn!("feed server ended abnormally: {err}");
    }
    aggregator_task.abort();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_tracing(directive: Option<&str>) {
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::WARN.into());
    let env_filter = match directive {
        Some(directive) => builder.parse_lossy(directive),
        None => builder.from_env_lossy(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
