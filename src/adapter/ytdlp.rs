//! Subprocess implementation of [`MediaTool`] on top of yt-dlp and ffmpeg.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    FetchRequest, FetchedMedia, JobStatus, MediaTool, ProgressEvent, ProgressSink, SearchResult,
    classify_failure, parse_progress_line,
};
use crate::{
    config::ToolSettings,
    error::{MediaError, MediaResult},
    metadata::{DESCRIPTION_EXTENSION, IMAGE_EXTENSIONS, MediaType, TargetType},
    store::{StagedMedia, sanitize_filename},
};

const VIDEO_FORMAT: &str = "best[height<=720]/best";
const AUDIO_FORMAT: &str = "bestaudio/best";
const PROGRESS_TEMPLATE: &str = "download:[progress]%(progress._percent_str)s";
const FILE_MARKER: &str = "[file]";
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const STDERR_TAIL_LINES: usize = 20;
const MIN_AUDIO_BYTES: u64 = 1024;

#[derive(Debug, Deserialize)]
struct ProbeInfo {
    id: Option<String>,
    title: Option<String>,
    fulltitle: Option<String>,
    description: Option<String>,
}

impl ProbeInfo {
    fn display_title(&self) -> String {
        [&self.fulltitle, &self.title, &self.id]
            .into_iter()
            .flatten()
            .map(|value| value.trim())
            .find(|value| !value.is_empty())
            .unwrap_or("untitled")
            .to_string()
    }
}

#[derive(Debug, Deserialize)]
struct SearchListing {
    #[serde(default)]
    entries: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: Option<String>,
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

impl SearchItem {
    fn into_result(self) -> Option<SearchResult> {
        let id = self.id?;
        let source_url = self
            .webpage_url
            .or(self.url)
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={id}"));
        let thumbnail_url = self
            .thumbnails
            .into_iter()
            .last()
            .map(|thumb| thumb.url)
            .unwrap_or_else(|| format!("https://i.ytimg.com/vi/{id}/hqdefault.jpg"));
        Some(SearchResult {
            title: self.title.unwrap_or_else(|| id.clone()),
            id,
            source_url,
            thumbnail_url,
            duration: self.duration,
        })
    }
}

#[derive(Debug, Clone)]
pub struct YtDlpTool {
    settings: ToolSettings,
}

impl YtDlpTool {
    pub fn new(settings: ToolSettings) -> Self {
        Self { settings }
    }

    fn retriever(&self) -> Command {
        let mut command = Command::new(&self.settings.retriever_bin);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Runs a short retriever invocation to completion and returns its stdout.
    async fn run_to_completion(
        &self,
        mut command: Command,
        cancel: Option<&CancellationToken>,
    ) -> MediaResult<Vec<u8>> {
        let child = command
            .spawn()
            .map_err(|err| spawn_failure(&self.settings.retriever_bin, err))?;
        let limit = self.settings.probe_timeout;
        let waiting = timeout(limit, child.wait_with_output());

        let output = match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(MediaError::Canceled),
                result = waiting => result,
            },
            None => waiting.await,
        };
        let output = output
            .map_err(|_| MediaError::Timeout(limit.as_secs()))?
            .map_err(|err| MediaError::ToolCrashed(format!("waiting for retriever: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr, false));
        }
        Ok(output.stdout)
    }

    async fn probe(&self, url: &str, cancel: &CancellationToken) -> MediaResult<ProbeInfo> {
        let mut command = self.retriever();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-playlist")
            .arg(url);
        let stdout = self.run_to_completion(command, Some(cancel)).await?;
        serde_json::from_slice(&stdout)
            .map_err(|err| MediaError::ToolCrashed(format!("unreadable metadata: {err}")))
    }

    async fn write_description(
        &self,
        dir: &Path,
        stem: &str,
        text: Option<&str>,
    ) -> Option<PathBuf> {
        let text = text.map(str::trim).filter(|text| !text.is_empty())?;
        let path = dir.join(format!("{stem}.{DESCRIPTION_EXTENSION}"));
        match tokio::fs::write(&path, text).await {
            Ok(()) => Some(path),
            Err(err) => {
                warn!(path = %path.display(), "could not stage description: {err}");
                None
            }
        }
    }

    /// One download run with the given format selector. Returns the staged
    /// primary file.
    async fn download(
        &self,
        request: &FetchRequest,
        stem: &str,
        format: &str,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> MediaResult<PathBuf> {
        // The output option is itself a template, so literal percent signs in
        // the title have to be doubled.
        let template = request
            .staging_dir
            .join(format!("{}.%(ext)s", stem.replace('%', "%%")));

        let mut command = self.retriever();
        command
            .arg("--newline")
            .arg("--progress")
            .arg("--progress-template")
            .arg(PROGRESS_TEMPLATE)
            .arg("--format")
            .arg(format)
            .arg("--output")
            .arg(&template)
            .arg("--write-thumbnail")
            .arg("--convert-thumbnails")
            .arg("jpg")
            .arg("--print")
            .arg(format!("after_move:{FILE_MARKER}%(filepath)s"))
            .arg("--no-simulate")
            .arg("--retries")
            .arg("3")
            .arg("--fragment-retries")
            .arg("3")
            .arg("--no-playlist")
            .arg(&request.source_url);

        info!(url = %request.source_url, format, "starting retriever");
        let mut child = command
            .spawn()
            .map_err(|err| spawn_failure(&self.settings.retriever_bin, err))?;
        let stderr_tail = collect_tail(child.stderr.take());
        let Some(stdout) = child.stdout.take() else {
            return Err(MediaError::ToolCrashed("retriever stdout unavailable".into()));
        };
        let mut lines = BufReader::new(stdout).lines();

        let mut saw_progress = false;
        let mut reported_path: Option<PathBuf> = None;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    terminate_child(&mut child).await;
                    return Err(MediaError::Canceled);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(percent) = parse_progress_line(&line) {
                            saw_progress = true;
                            let _ = progress.send(ProgressEvent::new(
                                JobStatus::Running,
                                percent,
                                format!("Downloading: {percent:.1}%"),
                            ));
                        } else if let Some(path) = line.trim().strip_prefix(FILE_MARKER) {
                            reported_path = Some(PathBuf::from(path.trim()));
                        } else {
                            debug!(line = %line, "retriever output");
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("reading retriever output failed: {err}");
                        break;
                    }
                },
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminate_child(&mut child).await;
                return Err(MediaError::Canceled);
            }
            status = child.wait() => status
                .map_err(|err| MediaError::ToolCrashed(format!("waiting for retriever: {err}")))?,
        };
        let stderr = stderr_tail.await.unwrap_or_default();
        if !status.success() {
            info!(url = %request.source_url, %status, "retriever failed");
            return Err(classify_failure(&stderr, saw_progress));
        }

        reported_path
            .filter(|path| path.is_file())
            .or_else(|| find_primary(&request.staging_dir, stem))
            .ok_or_else(|| MediaError::ToolCrashed("retriever produced no media file".into()))
    }
}

#[async_trait]
impl MediaTool for YtDlpTool {
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> MediaResult<FetchedMedia> {
        let info = self.probe(&request.source_url, cancel).await?;
        let title = info.display_title();
        let stem = sanitize_filename(&title);
        let description = self
            .write_description(&request.staging_dir, &stem, info.description.as_deref())
            .await;

        let format = match request.target {
            TargetType::Video => VIDEO_FORMAT,
            TargetType::Audio => AUDIO_FORMAT,
        };
        let mut audio_only = false;
        let primary = match self.download(request, &stem, format, progress, cancel).await {
            Err(err) if request.target == TargetType::Video && retry_as_audio(&err) => {
                warn!(url = %request.source_url, "video download failed, retrying audio only: {err}");
                let _ = progress.send(ProgressEvent::new(
                    JobStatus::Running,
                    0.0,
                    "Video download failed, retrying audio only",
                ));
                discard_partial_media(&request.staging_dir, &stem).await;
                audio_only = true;
                match self.download(request, &stem, AUDIO_FORMAT, progress, cancel).await {
                    Ok(primary) => primary,
                    Err(MediaError::Canceled) => return Err(MediaError::Canceled),
                    Err(audio_err) => {
                        info!(url = %request.source_url, "audio-only retry failed too: {audio_err}");
                        return Err(err);
                    }
                }
            }
            result => result?,
        };
        let thumbnail = find_thumbnail(&request.staging_dir, &stem);

        Ok(FetchedMedia {
            title,
            staged: StagedMedia {
                stem,
                primary,
                thumbnail,
                description,
            },
            audio_only,
        })
    }

    async fn transcode_audio(
        &self,
        input: &Path,
        cancel: &CancellationToken,
    ) -> MediaResult<PathBuf> {
        let output = input.with_extension("mp3");
        let mut command = Command::new(&self.settings.transcoder_bin);
        command
            .arg("-nostdin")
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-vn")
            .arg("-acodec")
            .arg("libmp3lame")
            .arg("-ab")
            .arg("192k")
            .arg("-ar")
            .arg("44100")
            .arg(&output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(input = %input.display(), "extracting audio");
        let mut child = command
            .spawn()
            .map_err(|err| spawn_failure(&self.settings.transcoder_bin, err))?;
        let stderr_tail = collect_tail(child.stderr.take());

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminate_child(&mut child).await;
                return Err(MediaError::Canceled);
            }
            status = child.wait() => status
                .map_err(|err| MediaError::ToolCrashed(format!("waiting for transcoder: {err}")))?,
        };
        let stderr = stderr_tail.await.unwrap_or_default();
        if !status.success() {
            return Err(MediaError::ToolCrashed(format!(
                "transcoder exited with {status}: {}",
                stderr.lines().last().unwrap_or("no diagnostic output")
            )));
        }

        let size = tokio::fs::metadata(&output)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        if size < MIN_AUDIO_BYTES {
            let _ = tokio::fs::remove_file(&output).await;
            return Err(MediaError::ToolCrashed(format!(
                "transcoder produced only {size} bytes"
            )));
        }
        Ok(output)
    }

    async fn search(&self, term: &str, limit: usize) -> MediaResult<Vec<SearchResult>> {
        let term = term.trim();
        if term.is_empty() {
            return Err(MediaError::InvalidRequest("search term is empty".into()));
        }
        let limit = limit.clamp(1, self.settings.search_limit.max(1));

        let mut command = self.retriever();
        command
            .arg("--dump-single-json")
            .arg("--flat-playlist")
            .arg("--no-warnings")
            .arg(format!("ytsearch{limit}:{term}"));
        let stdout = self.run_to_completion(command, None).await?;
        let listing: SearchListing = serde_json::from_slice(&stdout)
            .map_err(|err| MediaError::ToolCrashed(format!("unreadable search results: {err}")))?;

        Ok(listing
            .entries
            .into_iter()
            .filter_map(SearchItem::into_result)
            .take(limit)
            .collect())
    }
}

fn spawn_failure(bin: &Path, err: std::io::Error) -> MediaError {
    MediaError::ToolCrashed(format!("could not start {}: {err}", bin.display()))
}

/// Keeps the last few stderr lines for error classification.
fn collect_tail<R>(stream: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(stream) = stream else {
            return String::new();
        };
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail).join("\n")
    })
}

/// SIGTERM first so the tool can clean up its fragments, SIGKILL after a grace
/// period.
async fn terminate_child(child: &mut Child) {
    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(pid, "SIGTERM failed: {err}");
        } else if timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    if let Err(err) = child.kill().await {
        warn!("could not kill tool process: {err}");
    }
}

/// Transport and tool failures of a video run may still leave the audio
/// stream reachable; missing or unsupported sources will not.
fn retry_as_audio(err: &MediaError) -> bool {
    matches!(err, MediaError::NetworkError(_) | MediaError::ToolCrashed(_))
}

/// Removes media and `.part` files a failed run left under `stem`. Thumbnail
/// and description sidecars stay.
async fn discard_partial_media(dir: &Path, stem: &str) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    let partial_prefix = format!("{stem}.");
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let leftover = name.starts_with(&partial_prefix)
            && (name.ends_with(".part")
                || (path.file_stem().is_some_and(|s| s.to_string_lossy() == stem)
                    && MediaType::from_path(&path).is_some()));
        if leftover && let Err(err) = tokio::fs::remove_file(&path).await {
            debug!(path = %path.display(), "could not discard partial download: {err}");
        }
    }
}

fn find_primary(dir: &Path, stem: &str) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_stem()
                .is_some_and(|candidate| candidate.to_string_lossy() == stem)
        })
        .filter(|path| MediaType::from_path(path).is_some())
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

fn find_thumbnail(dir: &Path, stem: &str) -> Option<PathBuf> {
    IMAGE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{stem}.{ext}")))
        .find(|path| path.is_file())
}
