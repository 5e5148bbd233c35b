//! Content Store: the on-disk layout every other component reads or writes.
//!
//! ```text
//! <root>/
//!   default_audio_thumbnail.svg
//!   default_video_thumbnail.svg
//!   shared/                      default partition
//!   users/<namespace>/           one partition per namespace
//!     Title.mp4  Title.jpg  Title.txt  Title.meta
//!     .staging-XXXXXX/           in-flight downloads, invisible to readers
//! ```
//!
//! Files only become visible through `rename` out of a staging directory that
//! lives inside the same partition, so readers never see half-written media.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::{
    error::{MediaError, MediaResult},
    metadata::{
        AUDIO_PLACEHOLDER, DESCRIPTION_EXTENSION, IMAGE_EXTENSIONS, META_EXTENSION,
        SidecarMeta, VIDEO_PLACEHOLDER,
    },
    security::resolve_within,
};

const SHARED_DIR: &str = "shared";
const USERS_DIR: &str = "users";
const STAGING_PREFIX: &str = ".staging-";
const MAX_STEM_LEN: usize = 200;
const MAX_NAMESPACE_LEN: usize = 64;
const INVALID_FILENAME_CHARS: &[char] = &['\\', '/', '*', '?', ':', '"', '<', '>', '|', '#'];

const AUDIO_PLACEHOLDER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200"><rect width="200" height="200" fill="#496d89"/><circle cx="100" cy="100" r="40" fill="#ffffff" opacity="0.6"/></svg>
"##;
const VIDEO_PLACEHOLDER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200"><rect width="200" height="200" fill="#785064"/><polygon points="80,60 80,140 145,100" fill="#ffffff" opacity="0.6"/></svg>
"##;

/// Removes characters that are unsafe in file names, trims surrounding spaces
/// and dots and caps the length while keeping a short extension intact.
/// Returns `None` when nothing usable is left.
pub fn sanitize_component(name: &str, max_length: usize) -> Option<String> {
    let cleaned: String = name
        .chars()
        .filter(|c| !INVALID_FILENAME_CHARS.contains(c) && !c.is_control())
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.chars().count() <= max_length {
        return Some(trimmed.to_string());
    }

    if let Some((base, ext)) = trimmed.rsplit_once('.')
        && ext.chars().count() <= 10
    {
        let ext_len = ext.chars().count() + 1;
        if max_length > ext_len {
            let base: String = base.chars().take(max_length - ext_len).collect();
            return Some(format!("{base}.{ext}"));
        }
    }
    Some(trimmed.chars().take(max_length).collect())
}

/// File-name flavour of [`sanitize_component`] that never returns an empty
/// name.
pub fn sanitize_filename(name: &str) -> String {
    sanitize_component(name, MAX_STEM_LEN).unwrap_or_else(|| "untitled".to_string())
}

/// Storage partition key. `None` is the shared partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace(Option<String>);

impl Namespace {
    pub fn shared() -> Self {
        Self(None)
    }

    /// Normalizes a client supplied namespace: trimmed, lowercased and made
    /// file-name safe. Missing or blank input selects the shared partition.
    pub fn parse(raw: Option<&str>) -> MediaResult<Self> {
        let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
            return Ok(Self::shared());
        };
        let lowered = raw.to_lowercase();
        sanitize_component(&lowered, MAX_NAMESPACE_LEN)
            .map(|name| Self(Some(name)))
            .ok_or_else(|| MediaError::InvalidRequest(format!("invalid namespace `{raw}`")))
    }

    pub fn is_shared(&self) -> bool {
        self.0.is_none()
    }

    pub fn as_str(&self) -> &str {
        self.0.as_deref().unwrap_or(SHARED_DIR)
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of a successful tool run, still sitting in a staging directory.
#[derive(Debug, Clone)]
pub struct StagedMedia {
    /// Sanitized stem the committed files should carry.
    pub stem: String,
    pub primary: PathBuf,
    pub thumbnail: Option<PathBuf>,
    pub description: Option<PathBuf>,
}

/// A private directory inside a partition. Dropping it discards whatever is
/// still inside, which is how partial or abandoned output gets cleaned up.
#[derive(Debug)]
pub struct StagingArea {
    dir: TempDir,
}

impl StagingArea {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Sidecar files that share a primary file's stem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sidecars {
    pub thumbnail: Option<PathBuf>,
    pub description: Option<PathBuf>,
    pub meta: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
    commit_lock: Arc<Mutex<()>>,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Creates the root layout and the placeholder thumbnails.
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let store = Self::new(root);
        for dir in [store.root.join(SHARED_DIR), store.root.join(USERS_DIR)] {
            fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        store.ensure_placeholders()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_placeholders(&self) -> anyhow::Result<()> {
        for (name, svg) in [
            (AUDIO_PLACEHOLDER, AUDIO_PLACEHOLDER_SVG),
            (VIDEO_PLACEHOLDER, VIDEO_PLACEHOLDER_SVG),
        ] {
            let path = self.root.join(name);
            if !path.exists() {
                fs::write(&path, svg).with_context(|| format!("writing {}", path.display()))?;
            }
        }
        Ok(())
    }

    /// Placeholder thumbnails live at the root and are shared by every
    /// partition.
    pub fn placeholder_path(&self, name: &str) -> Option<PathBuf> {
        [AUDIO_PLACEHOLDER, VIDEO_PLACEHOLDER]
            .contains(&name)
            .then(|| self.root.join(name))
    }

    pub fn namespace_dir(&self, namespace: &Namespace) -> PathBuf {
        match &namespace.0 {
            None => self.root.join(SHARED_DIR),
            Some(name) => self.root.join(USERS_DIR).join(name),
        }
    }

    pub fn ensure_namespace_dir(&self, namespace: &Namespace) -> MediaResult<PathBuf> {
        let dir = self.namespace_dir(namespace);
        fs::create_dir_all(&dir).map_err(|err| MediaError::io(dir.display(), err))?;
        Ok(dir)
    }

    /// Resolves a client path strictly inside the partition.
    pub fn resolve(&self, namespace: &Namespace, relative: &str) -> MediaResult<PathBuf> {
        resolve_within(&self.namespace_dir(namespace), relative)
    }

    /// [`resolve`](Self::resolve) for async callers; the symlink check
    /// canonicalizes on a blocking thread.
    pub async fn resolve_async(&self, namespace: &Namespace, relative: &str) -> MediaResult<PathBuf> {
        let base = self.namespace_dir(namespace);
        let relative = relative.to_string();
        tokio::task::spawn_blocking(move || resolve_within(&base, &relative))
            .await
            .map_err(|err| MediaError::Io(format!("path resolution task failed: {err}")))?
    }

    /// Store-relative form of `path` with `/` separators.
    pub fn relative_path(&self, namespace: &Namespace, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(self.namespace_dir(namespace)).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect();
        (!parts.is_empty()).then(|| parts.join("/"))
    }

    pub fn create_staging(&self, namespace: &Namespace) -> MediaResult<StagingArea> {
        let dir = self.ensure_namespace_dir(namespace)?;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&dir)
            .map_err(|err| MediaError::io(format!("creating staging area in {}", dir.display()), err))?;
        debug!(namespace = %namespace, path = %staging.path().display(), "created staging area");
        Ok(StagingArea { dir: staging })
    }

    /// Free bytes on the filesystem holding the partition, when the platform
    /// can tell.
    pub fn free_bytes(&self, namespace: &Namespace) -> Option<u64> {
        let stat = nix::sys::statvfs::statvfs(&self.namespace_dir(namespace)).ok()?;
        #[allow(clippy::unnecessary_cast)]
        let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        Some(free)
    }

    /// Locates the sidecars that belong to a primary file.
    pub fn sidecars_for(primary: &Path) -> Sidecars {
        let Some(stem) = primary.file_stem().map(|stem| stem.to_string_lossy().into_owned())
        else {
            return Sidecars::default();
        };
        let sibling = |ext: &str| primary.with_file_name(format!("{stem}.{ext}"));

        let thumbnail = IMAGE_EXTENSIONS
            .iter()
            .map(|ext| sibling(ext))
            .find(|path| path.is_file());
        let description = Some(sibling(DESCRIPTION_EXTENSION)).filter(|path| path.is_file());
        let meta = Some(sibling(META_EXTENSION)).filter(|path| path.is_file());

        Sidecars {
            thumbnail,
            description,
            meta,
        }
    }

    /// Promotes staged output into the partition.
    ///
    /// Sidecars move first and are best-effort; the primary file moves last so
    /// an entry appears with its sidecars already in place. If the primary move
    /// fails, sidecars that already moved are removed again and the partition
    /// is left as it was. Returns the store-relative path of the primary file.
    pub fn commit(
        &self,
        namespace: &Namespace,
        staged: &StagedMedia,
        meta: &SidecarMeta,
    ) -> MediaResult<String> {
        let _guard = self.commit_lock.lock();
        let dir = self.ensure_namespace_dir(namespace)?;

        if !staged.primary.is_file() {
            return Err(MediaError::CommitFailed(format!(
                "staged file {} is missing",
                staged.primary.display()
            )));
        }
        let primary_ext = extension_of(&staged.primary).ok_or_else(|| {
            MediaError::CommitFailed(format!(
                "staged file {} has no extension",
                staged.primary.display()
            ))
        })?;

        let stem = unique_stem(&dir, &staged.stem)
            .map_err(|err| MediaError::CommitFailed(format!("listing {}: {err}", dir.display())))?;

        let mut sidecars: Vec<(PathBuf, PathBuf)> = Vec::new();
        if let Some(thumbnail) = &staged.thumbnail
            && let Some(ext) = extension_of(thumbnail)
        {
            sidecars.push((thumbnail.clone(), dir.join(format!("{stem}.{ext}"))));
        }
        if let Some(description) = &staged.description {
            sidecars.push((
                description.clone(),
                dir.join(format!("{stem}.{DESCRIPTION_EXTENSION}")),
            ));
        }
        if let Some(staging_dir) = staged.primary.parent() {
            let meta_path = staging_dir.join(format!("{}.{META_EXTENSION}", staged.stem));
            match meta.write(&meta_path) {
                Ok(()) => sidecars.push((meta_path, dir.join(format!("{stem}.{META_EXTENSION}")))),
                Err(err) => warn!(namespace = %namespace, "could not write metadata sidecar: {err:#}"),
            }
        }

        let mut moved = Vec::new();
        for (from, to) in sidecars {
            match fs::rename(&from, &to) {
                Ok(()) => moved.push(to),
                Err(err) => warn!(
                    namespace = %namespace,
                    from = %from.display(),
                    "sidecar move failed: {err}"
                ),
            }
        }

        let final_path = dir.join(format!("{stem}.{primary_ext}"));
        if let Err(err) = fs::rename(&staged.primary, &final_path) {
            for path in moved {
                if let Err(cleanup) = fs::remove_file(&path) {
                    warn!(path = %path.display(), "could not roll back sidecar: {cleanup}");
                }
            }
            return Err(MediaError::CommitFailed(format!(
                "moving {} into place: {err}",
                staged.primary.display()
            )));
        }

        let relative = self
            .relative_path(namespace, &final_path)
            .ok_or_else(|| MediaError::CommitFailed("committed file left the partition".into()))?;
        info!(namespace = %namespace, path = %relative, "committed media");
        Ok(relative)
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

/// Picks `base`, `base (2)`, `base (3)`, ... so no existing file in `dir`
/// already uses the stem.
fn unique_stem(dir: &Path, base: &str) -> std::io::Result<String> {
    let mut taken = HashSet::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(stem) = Path::new(&entry.file_name()).file_stem() {
            taken.insert(stem.to_string_lossy().into_owned());
        }
    }

    if !taken.contains(base) {
        return Ok(base.to_string());
    }
    let mut counter = 2;
    loop {
        let candidate = format!("{base} ({counter})");
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
        counter += 1;
    }
}
