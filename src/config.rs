use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/webplayer-env";
pub const DEFAULT_MEDIA_ROOT: &str = "downloads";
pub const DEFAULT_WEBPLAYER_PORT: u16 = 5000;
pub const DEFAULT_WEBPLAYER_HOST: &str = "127.0.0.1";
pub const DEFAULT_RETRIEVER_BIN: &str = "yt-dlp";
pub const DEFAULT_TRANSCODER_BIN: &str = "ffmpeg";
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_TRACKED_JOBS: usize = 64;
pub const DEFAULT_JOB_RETENTION_SECS: u64 = 600;
pub const DEFAULT_MIN_FREE_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_SEARCH_LIMIT: usize = 25;

/// Raw values found in the env file. Every field stays optional so callers can
/// layer CLI flags and process environment on top.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub media_root: Option<PathBuf>,
    pub webplayer_host: Option<String>,
    pub webplayer_port: Option<u16>,
    pub retriever_bin: Option<PathBuf>,
    pub transcoder_bin: Option<PathBuf>,
    pub download_timeout_secs: Option<u64>,
    pub probe_timeout_secs: Option<u64>,
    pub max_tracked_jobs: Option<usize>,
    pub job_retention_secs: Option<u64>,
    pub min_free_bytes: Option<u64>,
    pub search_limit: Option<usize>,
}

/// Fully resolved settings used by the binaries.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub media_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub tools: ToolSettings,
    pub jobs: JobSettings,
}

/// Where the external tools live and how long they may run.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub retriever_bin: PathBuf,
    pub transcoder_bin: PathBuf,
    pub download_timeout: Duration,
    pub probe_timeout: Duration,
    pub search_limit: usize,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            retriever_bin: PathBuf::from(DEFAULT_RETRIEVER_BIN),
            transcoder_bin: PathBuf::from(DEFAULT_TRANSCODER_BIN),
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

/// Bounds on the in-memory job map.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub max_tracked_jobs: usize,
    pub retention: Duration,
    pub download_timeout: Duration,
    pub min_free_bytes: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_tracked_jobs: DEFAULT_MAX_TRACKED_JOBS,
            retention: Duration::from_secs(DEFAULT_JOB_RETENTION_SECS),
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str, path: &Path) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Parsing {key} from {}", path.display()))
}

fn apply_pair(cfg: &mut EnvConfig, key: &str, value: &str, origin: &Path) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    match key {
        "MEDIA_ROOT" => cfg.media_root = Some(PathBuf::from(value)),
        "WEBPLAYER_HOST" => cfg.webplayer_host = Some(value.to_string()),
        "WEBPLAYER_PORT" => cfg.webplayer_port = Some(parse_value(key, value, origin)?),
        "RETRIEVER_BIN" => cfg.retriever_bin = Some(PathBuf::from(value)),
        "TRANSCODER_BIN" => cfg.transcoder_bin = Some(PathBuf::from(value)),
        "DOWNLOAD_TIMEOUT_SECS" => {
            cfg.download_timeout_secs = Some(parse_value(key, value, origin)?)
        }
        "PROBE_TIMEOUT_SECS" => cfg.probe_timeout_secs = Some(parse_value(key, value, origin)?),
        "MAX_TRACKED_JOBS" => cfg.max_tracked_jobs = Some(parse_value(key, value, origin)?),
        "JOB_RETENTION_SECS" => cfg.job_retention_secs = Some(parse_value(key, value, origin)?),
        "MIN_FREE_BYTES" => cfg.min_free_bytes = Some(parse_value(key, value, origin)?),
        "SEARCH_LIMIT" => cfg.search_limit = Some(parse_value(key, value, origin)?),
        _ => {}
    }
    Ok(())
}

const KNOWN_KEYS: &[&str] = &[
    "MEDIA_ROOT",
    "WEBPLAYER_HOST",
    "WEBPLAYER_PORT",
    "RETRIEVER_BIN",
    "TRANSCODER_BIN",
    "DOWNLOAD_TIMEOUT_SECS",
    "PROBE_TIMEOUT_SECS",
    "MAX_TRACKED_JOBS",
    "JOB_RETENTION_SECS",
    "MIN_FREE_BYTES",
    "SEARCH_LIMIT",
];

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            apply_pair(&mut cfg, key.trim(), value, path)?;
        }
    }
    Ok(Some(cfg))
}

/// Overlays process environment variables (same key names as the file).
pub fn apply_process_env(cfg: &mut EnvConfig) -> Result<()> {
    let origin = Path::new("<environment>");
    for key in KNOWN_KEYS {
        if let Ok(value) = std::env::var(key) {
            apply_pair(cfg, key, value.trim(), origin)?;
        }
    }
    Ok(())
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    load_runtime_config_from(Path::new(DEFAULT_CONFIG_PATH))
}

/// Missing files are not an error: every key has a default.
pub fn load_runtime_config_from(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let mut cfg = read_env_config(path)?.unwrap_or_default();
    apply_process_env(&mut cfg)?;
    Ok(resolve(cfg))
}

pub fn resolve(cfg: EnvConfig) -> RuntimeConfig {
    let download_timeout = Duration::from_secs(
        cfg.download_timeout_secs
            .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
    );
    RuntimeConfig {
        media_root: cfg
            .media_root
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_ROOT)),
        host: cfg
            .webplayer_host
            .unwrap_or_else(|| DEFAULT_WEBPLAYER_HOST.to_string()),
        port: cfg.webplayer_port.unwrap_or(DEFAULT_WEBPLAYER_PORT),
        tools: ToolSettings {
            retriever_bin: cfg
                .retriever_bin
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RETRIEVER_BIN)),
            transcoder_bin: cfg
                .transcoder_bin
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TRANSCODER_BIN)),
            download_timeout,
            probe_timeout: Duration::from_secs(
                cfg.probe_timeout_secs.unwrap_or(DEFAULT_PROBE_TIMEOUT_SECS),
            ),
            search_limit: cfg.search_limit.unwrap_or(DEFAULT_SEARCH_LIMIT).max(1),
        },
        jobs: JobSettings {
            max_tracked_jobs: cfg.max_tracked_jobs.unwrap_or(DEFAULT_MAX_TRACKED_JOBS).max(1),
            retention: Duration::from_secs(
                cfg.job_retention_secs.unwrap_or(DEFAULT_JOB_RETENTION_SECS),
            ),
            download_timeout,
            min_free_bytes: cfg.min_free_bytes.unwrap_or(DEFAULT_MIN_FREE_BYTES),
        },
    }
}
