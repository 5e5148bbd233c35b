use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures_util::StreamExt;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use webplayer_tools::{
    adapter::{JobStatus, MediaTool, ytdlp::YtDlpTool},
    config::{DEFAULT_CONFIG_PATH, load_runtime_config_from},
    metadata::TargetType,
    orchestrator::Orchestrator,
    security::ensure_not_root,
    store::{ContentStore, Namespace},
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Download a single URL into the media store without the HTTP server."
)]
struct Cli {
    #[arg(value_name = "URL", help = "Page or media URL understood by yt-dlp")]
    url: String,
    #[arg(long = "audio", help = "Keep only the audio track, transcoded to mp3")]
    audio: bool,
    #[arg(
        long = "namespace",
        value_name = "NAME",
        help = "Store into users/<NAME> instead of shared/"
    )]
    namespace: Option<String>,
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the env-style config file")]
    config: PathBuf,
    #[arg(
        long = "media-root",
        value_name = "PATH",
        help = "Override the directory holding shared/ and users/"
    )]
    media_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().compact().with_target(false))
        .init();

    let cli = Cli::parse();
    ensure_not_root("fetch_media")?;

    let mut config = load_runtime_config_from(&cli.config)?;
    if let Some(root) = cli.media_root {
        config.media_root = root;
    }
    let store = ContentStore::open(&config.media_root)
        .with_context(|| format!("opening media root {}", config.media_root.display()))?;
    let tool: Arc<dyn MediaTool> = Arc::new(YtDlpTool::new(config.tools.clone()));
    let orchestrator = Orchestrator::new(store, tool, config.jobs.clone());

    let target = if cli.audio {
        TargetType::Audio
    } else {
        TargetType::Video
    };
    let namespace = Namespace::parse(cli.namespace.as_deref())?;
    let job_id = orchestrator.start(&cli.url, target, namespace)?;
    info!(job_id, url = %cli.url, "download started");

    let events = orchestrator.subscribe(&job_id)?;
    tokio::pin!(events);
    let mut last = None;
    let mut interrupted = false;
    loop {
        tokio::select! {
            next = events.next() => match next {
                Some(event) => {
                    println!("[{:>9}] {:5.1}% {}", event.stage.as_str(), event.percent, event.message);
                    last = Some(event);
                }
                None => break,
            },
            result = signal::ctrl_c(), if !interrupted => {
                if let Err(err) = result {
                    warn!("failed to listen for Ctrl+C: {err}");
                }
                interrupted = true;
                if !orchestrator.cancel(&job_id)? {
                    warn!(job_id, "download is already committing; waiting for it to finish");
                }
            }
        }
    }

    match last {
        Some(event) if event.stage == JobStatus::Done => {
            match event.entry {
                Some(entry) => println!("saved {}", entry.path),
                None => println!("saved"),
            }
            Ok(())
        }
        Some(event) if event.stage == JobStatus::Canceled => bail!("download canceled"),
        Some(event) if event.stage == JobStatus::Failed => {
            bail!("download failed: {}", event.message)
        }
        _ => bail!("download ended without a final status"),
    }
}
