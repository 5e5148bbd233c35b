use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use webplayer_tools::{
    adapter::{MediaTool, ytdlp::YtDlpTool},
    api::{self, AppState},
    config::{DEFAULT_CONFIG_PATH, load_runtime_config_from},
    orchestrator::Orchestrator,
    security::ensure_not_root,
    store::ContentStore,
};

const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the web player download and streaming API.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the env-style config file")]
    config: PathBuf,
    #[arg(
        long = "media-root",
        value_name = "PATH",
        help = "Override the directory holding shared/ and users/"
    )]
    media_root: Option<PathBuf>,
    #[arg(long = "host", value_name = "ADDR", help = "Override the listen address")]
    host: Option<String>,
    #[arg(long = "port", value_name = "PORT", help = "Override the listen port")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().compact().with_target(false))
        .init();

    let cli = Cli::parse();
    ensure_not_root("backend")?;

    let mut config = load_runtime_config_from(&cli.config)?;
    if let Some(root) = cli.media_root {
        config.media_root = root;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let store = ContentStore::open(&config.media_root)
        .with_context(|| format!("opening media root {}", config.media_root.display()))?;
    let tool: Arc<dyn MediaTool> = Arc::new(YtDlpTool::new(config.tools.clone()));
    let orchestrator = Orchestrator::new(store.clone(), tool.clone(), config.jobs.clone());

    let janitor = tokio::spawn(run_janitor(orchestrator.clone()));

    let app = api::router(AppState {
        store,
        orchestrator,
        tool,
        search_limit: config.tools.search_limit,
    });

    let addr = SocketAddr::new(
        config
            .host
            .parse()
            .with_context(|| format!("parsing listen address {}", config.host))?,
        config.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        %addr,
        media_root = %config.media_root.display(),
        "API server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    janitor.abort();
    Ok(())
}

/// Evicts finished jobs nobody polled so the job map stays bounded.
async fn run_janitor(orchestrator: Orchestrator) {
    let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
    loop {
        ticker.tick().await;
        let removed = orchestrator.prune_expired();
        debug!(removed, tracked = orchestrator.tracked_jobs(), "janitor pass");
    }
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
    info!("shutting down");
}
