//! Media Library Index.
//!
//! There is no persistent catalog: every listing walks the partition and
//! re-stats the files, so a delete or commit is visible to the very next call.

use std::{
    cmp::Ordering,
    fs,
    path::Path,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::{
    error::{MediaError, MediaResult},
    metadata::{MediaEntry, MediaType, SidecarMeta, entry_id},
    store::{ContentStore, Namespace},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TypeFilter {
    #[default]
    All,
    Audio,
    Video,
}

impl TypeFilter {
    fn admits(self, media_type: MediaType) -> bool {
        match self {
            Self::All => true,
            Self::Audio => media_type == MediaType::Audio,
            Self::Video => media_type == MediaType::Video,
        }
    }
}

impl FromStr for TypeFilter {
    type Err = MediaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(Self::All),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(MediaError::InvalidRequest(format!("unknown type filter `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortKey {
    #[default]
    DateDownloaded,
    Name,
    Size,
    Type,
}

impl FromStr for SortKey {
    type Err = MediaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "date" | "datedownloaded" | "date_downloaded" => Ok(Self::DateDownloaded),
            "name" => Ok(Self::Name),
            "size" => Ok(Self::Size),
            "type" => Ok(Self::Type),
            other => Err(MediaError::InvalidRequest(format!("unknown sort key `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = MediaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Self::Asc),
            "" | "desc" | "descending" => Ok(Self::Desc),
            other => Err(MediaError::InvalidRequest(format!("unknown sort order `{other}`"))),
        }
    }
}

/// Listing parameters. The default is every entry, newest first.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub type_filter: TypeFilter,
    pub search: Option<String>,
    pub sort: SortKey,
    pub order: SortOrder,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

/// Lists the partition's entries, filtered and ordered per `query`.
pub fn list(
    store: &ContentStore,
    namespace: &Namespace,
    query: &ListQuery,
) -> MediaResult<Vec<MediaEntry>> {
    let dir = store.namespace_dir(namespace);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let needle = query
        .search
        .as_deref()
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .map(str::to_lowercase);

    let mut entries = Vec::new();
    for item in WalkDir::new(&dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry))
    {
        let item = match item {
            Ok(item) => item,
            Err(err) => {
                warn!(namespace = %namespace, "skipping unreadable entry: {err}");
                continue;
            }
        };
        if !item.file_type().is_file() {
            continue;
        }
        let Some(media_type) = MediaType::from_path(item.path()) else {
            continue;
        };
        if !query.type_filter.admits(media_type) {
            continue;
        }
        let Some(relative) = store.relative_path(namespace, item.path()) else {
            continue;
        };

        // A file deleted between the walk and the stat simply drops out.
        let entry = match build_entry(store, namespace, item.path(), &relative) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(path = %relative, "entry vanished during listing: {err}");
                continue;
            }
        };
        if let Some(needle) = &needle
            && !entry.name.to_lowercase().contains(needle)
        {
            continue;
        }
        entries.push(entry);
    }

    sort_entries(&mut entries, query.sort, query.order);
    Ok(entries)
}

/// Builds the catalog entry for one store-relative primary file.
pub fn entry_for(
    store: &ContentStore,
    namespace: &Namespace,
    relative: &str,
) -> MediaResult<MediaEntry> {
    let path = store.resolve(namespace, relative)?;
    let relative = store
        .relative_path(namespace, &path)
        .ok_or_else(|| MediaError::Forbidden(format!("{relative} escapes the namespace")))?;
    build_entry(store, namespace, &path, &relative)
}

fn build_entry(
    store: &ContentStore,
    namespace: &Namespace,
    path: &Path,
    relative: &str,
) -> MediaResult<MediaEntry> {
    let media_type = MediaType::from_path(path)
        .ok_or_else(|| MediaError::InvalidRequest(format!("{relative} is not a media file")))?;
    let metadata = fs::metadata(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => MediaError::NotFound(relative.to_string()),
        _ => MediaError::io(relative, err),
    })?;
    if !metadata.is_file() {
        return Err(MediaError::NotFound(relative.to_string()));
    }

    let sidecars = ContentStore::sidecars_for(path);
    let meta = sidecars.meta.as_deref().and_then(SidecarMeta::read);

    let name = meta
        .as_ref()
        .map(|meta| meta.original_title.trim())
        .filter(|title| !title.is_empty())
        .map(str::to_string)
        .or_else(|| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| relative.to_string());

    let date_downloaded = meta
        .as_ref()
        .map(|meta| meta.download_date)
        .or_else(|| metadata.modified().ok().map(DateTime::<Utc>::from))
        .unwrap_or_else(|| DateTime::<Utc>::from(std::time::UNIX_EPOCH));

    let thumbnail = sidecars
        .thumbnail
        .as_deref()
        .and_then(|thumb| store.relative_path(namespace, thumb))
        .unwrap_or_else(|| media_type.placeholder().to_string());
    let description_path = sidecars
        .description
        .as_deref()
        .and_then(|desc| store.relative_path(namespace, desc));

    Ok(MediaEntry {
        id: entry_id(relative),
        path: relative.to_string(),
        media_type,
        name,
        size: metadata.len(),
        thumbnail,
        description_path,
        date_downloaded,
    })
}

/// Orders by `key` in the requested direction; ties always fall back to the
/// path in ascending order.
pub fn sort_entries(entries: &mut [MediaEntry], key: SortKey, order: SortOrder) {
    entries.sort_by(|a, b| {
        let primary = match key {
            SortKey::DateDownloaded => a.date_downloaded.cmp(&b.date_downloaded),
            SortKey::Name => a.name.cmp(&b.name),
            SortKey::Size => a.size.cmp(&b.size),
            SortKey::Type => a.media_type.cmp(&b.media_type),
        };
        let primary = match order {
            SortOrder::Asc => primary,
            SortOrder::Desc => primary.reverse(),
        };
        match primary {
            Ordering::Equal => a.path.cmp(&b.path),
            other => other,
        }
    });
}
