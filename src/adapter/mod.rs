//! External tool adapter.
//!
//! The orchestrator only talks to a [`MediaTool`]: something that can fetch a
//! source into a staging directory, turn a container into audio and search the
//! provider. [`ytdlp::YtDlpTool`] is the subprocess implementation; tests plug
//! in deterministic fakes.

pub mod ytdlp;

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{MediaError, MediaResult},
    metadata::{MediaEntry, TargetType},
    store::StagedMedia,
};

/// Job lifecycle states. Only the last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Converting,
    Committing,
    Done,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    pub fn is_cancelable(self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Converting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Converting => "converting",
            Self::Committing => "committing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// One step of a job as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub percent: f32,
    pub stage: JobStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<MediaEntry>,
}

impl ProgressEvent {
    pub fn new(stage: JobStatus, percent: f32, message: impl Into<String>) -> Self {
        Self {
            percent,
            stage,
            message: message.into(),
            entry: None,
        }
    }
}

pub type ProgressSink = mpsc::UnboundedSender<ProgressEvent>;

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub source_url: String,
    pub target: TargetType,
    pub staging_dir: PathBuf,
}

/// Staged output plus the untouched title reported by the provider.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub title: String,
    pub staged: StagedMedia,
    /// The video download failed and only the audio stream was retrieved.
    pub audio_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    #[serde(rename = "sourceURL")]
    pub source_url: String,
    #[serde(rename = "thumbnailURL")]
    pub thumbnail_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Retrieves `request.source_url` into `request.staging_dir`, reporting
    /// download progress on `progress`.
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> MediaResult<FetchedMedia>;

    /// Extracts the audio stream of `input` into a sibling `.mp3` file and
    /// returns its path. The input is left in place.
    async fn transcode_audio(&self, input: &Path, cancel: &CancellationToken)
    -> MediaResult<PathBuf>;

    async fn search(&self, term: &str, limit: usize) -> MediaResult<Vec<SearchResult>>;
}

/// Full adapter contract: fetch, then for audio targets (or an audio-only
/// fallback) transcode and drop the intermediate container, all under a single
/// wall-clock limit.
pub async fn retrieve(
    tool: &dyn MediaTool,
    request: &FetchRequest,
    progress: &ProgressSink,
    cancel: &CancellationToken,
    limit: Duration,
) -> MediaResult<FetchedMedia> {
    let run = async {
        let mut fetched = tool.fetch(request, progress, cancel).await?;
        let wants_audio = request.target == TargetType::Audio || fetched.audio_only;
        if wants_audio && !is_mp3(&fetched.staged.primary) {
            let _ = progress.send(ProgressEvent::new(
                JobStatus::Converting,
                99.0,
                "Extracting audio",
            ));
            let audio = tool.transcode_audio(&fetched.staged.primary, cancel).await?;
            if let Err(err) = tokio::fs::remove_file(&fetched.staged.primary).await {
                warn!(
                    path = %fetched.staged.primary.display(),
                    "could not remove intermediate container: {err}"
                );
            }
            fetched.staged.primary = audio;
        }
        Ok(fetched)
    };

    match tokio::time::timeout(limit, run).await {
        Ok(result) => result,
        Err(_) => {
            debug!(url = %request.source_url, "retrieval hit the wall-clock limit");
            Err(MediaError::Timeout(limit.as_secs()))
        }
    }
}

fn is_mp3(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mp3"))
}

/// Percentage from a progress line, either our `[progress] 42.1%` template or
/// the tool's default `[download]  42.1% of ...` output.
pub fn parse_progress_line(line: &str) -> Option<f32> {
    let rest = line
        .trim()
        .strip_prefix("[progress]")
        .or_else(|| line.trim().strip_prefix("[download]"))?;
    let token = rest.split_whitespace().next()?;
    let number = token.strip_suffix('%')?;
    let value: f32 = number.trim().parse().ok()?;
    value.is_finite().then(|| value.clamp(0.0, 100.0))
}

/// Maps a failed run onto the adapter error taxonomy using the tool's stderr.
pub fn classify_failure(stderr: &str, saw_progress: bool) -> MediaError {
    let lowered = stderr.to_lowercase();
    let summary = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("no diagnostic output")
        .trim()
        .to_string();

    if lowered.contains("unsupported url") {
        MediaError::UnsupportedSource(summary)
    } else if lowered.contains("video unavailable")
        || lowered.contains("http error 404")
        || lowered.contains("private video")
        || lowered.contains("does not exist")
    {
        MediaError::NotFound(summary)
    } else if lowered.contains("http error")
        || lowered.contains("unable to download")
        || lowered.contains("timed out")
        || lowered.contains("connection")
        || lowered.contains("network")
        || lowered.contains("name resolution")
    {
        MediaError::NetworkError(summary)
    } else if saw_progress {
        MediaError::NetworkError(format!("transfer interrupted: {summary}"))
    } else {
        MediaError::ToolCrashed(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use tempfile::tempdir;

    #[test]
    fn progress_lines_are_parsed() {
        assert_eq!(parse_progress_line("[progress]  42.5%"), Some(42.5));
        assert_eq!(
            parse_progress_line("[download]  12.0% of 10.00MiB at 1.00MiB/s ETA 00:09"),
            Some(12.0)
        );
        assert_eq!(parse_progress_line("[progress] 120%"), Some(100.0));
        assert_eq!(parse_progress_line("[download] Destination: a.mp4"), None);
        assert_eq!(parse_progress_line("[progress] N/A%"), None);
        assert_eq!(parse_progress_line("random"), None);
    }

    #[test]
    fn failures_are_classified() {
        assert!(matches!(
            classify_failure("ERROR: Unsupported URL: https://x", false),
            MediaError::UnsupportedSource(_)
        ));
        assert!(matches!(
            classify_failure("ERROR: [youtube] abc: Video unavailable", false),
            MediaError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("ERROR: Unable to download webpage: HTTP Error 503", false),
            MediaError::NetworkError(_)
        ));
        assert!(matches!(
            classify_failure("Segmentation fault", false),
            MediaError::ToolCrashed(_)
        ));
        assert!(matches!(
            classify_failure("Killed", true),
            MediaError::NetworkError(_)
        ));
        assert_eq!(
            classify_failure("", false),
            MediaError::ToolCrashed("no diagnostic output".into())
        );
    }

    #[test]
    fn terminal_and_cancelable_statuses() {
        assert!(JobStatus::Done.is_terminal());
        assert!(!JobStatus::Committing.is_terminal());
        assert!(JobStatus::Converting.is_cancelable());
        assert!(!JobStatus::Committing.is_cancelable());
        assert_eq!(
            serde_json::to_value(JobStatus::Canceled).unwrap(),
            serde_json::json!("canceled")
        );
    }

    struct ScriptedTool {
        container_ext: &'static str,
        delay: Duration,
        transcodes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MediaTool for ScriptedTool {
        async fn fetch(
            &self,
            request: &FetchRequest,
            progress: &ProgressSink,
            _cancel: &CancellationToken,
        ) -> MediaResult<FetchedMedia> {
            tokio::time::sleep(self.delay).await;
            let primary = request
                .staging_dir
                .join(format!("Clip.{}", self.container_ext));
            fs::write(&primary, b"container").map_err(|err| MediaError::io("stage", err))?;
            let _ = progress.send(ProgressEvent::new(JobStatus::Running, 100.0, "done"));
            Ok(FetchedMedia {
                title: "Clip".into(),
                staged: StagedMedia {
                    stem: "Clip".into(),
                    primary,
                    thumbnail: None,
                    description: None,
                },
                audio_only: false,
            })
        }

        async fn transcode_audio(
            &self,
            input: &Path,
            _cancel: &CancellationToken,
        ) -> MediaResult<PathBuf> {
            self.transcodes.fetch_add(1, Ordering::SeqCst);
            let output = input.with_extension("mp3");
            fs::write(&output, b"audio").map_err(|err| MediaError::io("transcode", err))?;
            Ok(output)
        }

        async fn search(&self, _term: &str, _limit: usize) -> MediaResult<Vec<SearchResult>> {
            Ok(Vec::new())
        }
    }

    fn request(dir: &Path, target: TargetType) -> FetchRequest {
        FetchRequest {
            source_url: "https://example.com/v".into(),
            target,
            staging_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn audio_target_transcodes_and_drops_container() -> Result<()> {
        let dir = tempdir()?;
        let transcodes = Arc::new(AtomicUsize::new(0));
        let tool = ScriptedTool {
            container_ext: "webm",
            delay: Duration::ZERO,
            transcodes: transcodes.clone(),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fetched = retrieve(
            &tool,
            &request(dir.path(), TargetType::Audio),
            &tx,
            &CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await?;

        assert_eq!(fetched.staged.primary, dir.path().join("Clip.mp3"));
        assert!(!dir.path().join("Clip.webm").exists());
        assert_eq!(transcodes.load(Ordering::SeqCst), 1);

        let mut stages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            stages.push(event.stage);
        }
        assert_eq!(stages, vec![JobStatus::Running, JobStatus::Converting]);
        Ok(())
    }

    #[tokio::test]
    async fn mp3_download_skips_transcode() -> Result<()> {
        let dir = tempdir()?;
        let transcodes = Arc::new(AtomicUsize::new(0));
        let tool = ScriptedTool {
            container_ext: "mp3",
            delay: Duration::ZERO,
            transcodes: transcodes.clone(),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let fetched = retrieve(
            &tool,
            &request(dir.path(), TargetType::Audio),
            &tx,
            &CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await?;
        assert_eq!(fetched.staged.primary, dir.path().join("Clip.mp3"));
        assert_eq!(transcodes.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn video_target_keeps_container() -> Result<()> {
        let dir = tempdir()?;
        let tool = ScriptedTool {
            container_ext: "mp4",
            delay: Duration::ZERO,
            transcodes: Arc::new(AtomicUsize::new(0)),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let fetched = retrieve(
            &tool,
            &request(dir.path(), TargetType::Video),
            &tx,
            &CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await?;
        assert_eq!(fetched.staged.primary, dir.path().join("Clip.mp4"));
        Ok(())
    }

    #[tokio::test]
    async fn wall_clock_limit_yields_timeout() -> Result<()> {
        let dir = tempdir()?;
        let tool = ScriptedTool {
            container_ext: "mp4",
            delay: Duration::from_secs(10),
            transcodes: Arc::new(AtomicUsize::new(0)),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = retrieve(
            &tool,
            &request(dir.path(), TargetType::Video),
            &tx,
            &CancellationToken::new(),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert_eq!(err, MediaError::Timeout(0));
        Ok(())
    }
}
