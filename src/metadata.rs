//! Catalog records and the sidecar files stored next to each primary file.
//!
//! Everything the library knows about an item lives on disk beside it:
//!
//! * `<stem>.<media ext>` is the primary file (audio or video container).
//! * `<stem>.<image ext>` is the optional thumbnail.
//! * `<stem>.txt` is the optional description.
//! * `<stem>.meta` is a small JSON record written at commit time holding the
//!   download date and the untouched title.
//!
//! The structs below mirror what the API returns so handlers can serialize
//! them directly.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "flac", "aac", "m4a", "opus"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "avi", "mov", "mkv"];
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];
pub const DESCRIPTION_EXTENSION: &str = "txt";
pub const META_EXTENSION: &str = "meta";

pub const AUDIO_PLACEHOLDER: &str = "default_audio_thumbnail.svg";
pub const VIDEO_PLACEHOLDER: &str = "default_video_thumbnail.svg";

/// Audio or video, decided purely by the container extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
}

impl MediaType {
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Audio)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else {
            None
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    pub fn placeholder(self) -> &'static str {
        match self {
            Self::Audio => AUDIO_PLACEHOLDER,
            Self::Video => VIDEO_PLACEHOLDER,
        }
    }
}

/// What a download job asks the tools to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    /// Audio-only: the retrieved container is transcoded and discarded.
    Audio,
    /// Video with its audio track.
    Video,
}

impl TargetType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl std::str::FromStr for TargetType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "audio" | "audio-only" | "mp3" => Ok(Self::Audio),
            "video" | "video+audio" | "mp4" => Ok(Self::Video),
            other => Err(format!("unknown target type `{other}`")),
        }
    }
}

/// One catalog entry as returned by `/media`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaEntry {
    pub id: String,
    pub path: String,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    pub name: String,
    pub size: u64,
    /// Store-relative thumbnail path, or a placeholder name served from the
    /// store root.
    pub thumbnail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description_path: Option<String>,
    pub date_downloaded: DateTime<Utc>,
}

/// Stable identifier for a store-relative path.
pub fn entry_id(relative_path: &str) -> String {
    let hash = blake3::hash(relative_path.as_bytes());
    hash.to_hex()[..16].to_string()
}

/// Contents of the `.meta` sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarMeta {
    pub download_date: DateTime<Utc>,
    pub original_title: String,
    pub source_url: String,
    pub target_type: TargetType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl SidecarMeta {
    pub fn write(&self, path: &Path) -> Result<()> {
        let payload = serde_json::to_vec_pretty(self).context("serializing sidecar metadata")?;
        fs::write(path, payload).with_context(|| format!("writing {}", path.display()))
    }

    /// Unreadable or malformed sidecars are treated as absent.
    pub fn read(path: &Path) -> Option<Self> {
        let raw = fs::read(path).ok()?;
        serde_json::from_slice(&raw).ok()
    }
}
