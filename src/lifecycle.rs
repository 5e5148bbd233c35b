//! Lifecycle Manager: batch deletion of entries and their sidecars.

use std::{
    collections::HashSet,
    fs,
    path::Path,
};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    error::{MediaError, MediaResult},
    metadata::MediaType,
    store::{ContentStore, Namespace},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOutcome {
    pub path: String,
    #[serde(flatten)]
    pub outcome: DeleteOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub results: Vec<FileOutcome>,
}

impl DeleteReport {
    pub fn deleted(&self) -> usize {
        self.results
            .iter()
            .filter(|result| result.outcome == DeleteOutcome::Deleted)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.deleted()
    }

    pub fn success(&self) -> bool {
        !self.results.is_empty() && self.failed() == 0
    }

    pub fn message(&self) -> String {
        if self.results.is_empty() {
            "No files selected".to_string()
        } else if self.failed() == 0 {
            format!("Successfully deleted {} files", self.deleted())
        } else {
            format!(
                "Deleted {} files with {} errors",
                self.deleted(),
                self.failed()
            )
        }
    }
}

/// Deletes every path independently; one failure never stops the rest.
/// Duplicate paths in the request are handled once.
pub fn delete(store: &ContentStore, namespace: &Namespace, paths: &[String]) -> DeleteReport {
    let mut seen = HashSet::new();
    let mut report = DeleteReport::default();

    for path in paths {
        if !seen.insert(path.as_str()) {
            continue;
        }
        let outcome = match delete_one(store, namespace, path) {
            Ok(()) => DeleteOutcome::Deleted,
            Err(MediaError::NotFound(_)) => DeleteOutcome::NotFound,
            Err(err) => DeleteOutcome::Error {
                message: err.to_string(),
            },
        };
        info!(namespace = %namespace, path = %path, ?outcome, "delete");
        report.results.push(FileOutcome {
            path: path.clone(),
            outcome,
        });
    }
    report
}

fn delete_one(store: &ContentStore, namespace: &Namespace, relative: &str) -> MediaResult<()> {
    let path = store.resolve(namespace, relative)?;
    let metadata = fs::symlink_metadata(&path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => MediaError::NotFound(relative.to_string()),
        _ => MediaError::io(relative, err),
    })?;
    if metadata.is_dir() {
        return Err(MediaError::InvalidRequest(format!("{relative} is a directory")));
    }
    if MediaType::from_path(&path).is_none() {
        return Err(MediaError::InvalidRequest(format!(
            "{relative} is not a media file"
        )));
    }

    let sidecars = ContentStore::sidecars_for(&path);
    fs::remove_file(&path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => MediaError::NotFound(relative.to_string()),
        _ => MediaError::io(relative, err),
    })?;

    // Another primary with the same stem (say an .mp3 next to an .mp4) still
    // owns the sidecars.
    if shares_stem_with_other_primary(&path) {
        return Ok(());
    }
    for sidecar in [sidecars.thumbnail, sidecars.description, sidecars.meta]
        .into_iter()
        .flatten()
    {
        if let Err(err) = fs::remove_file(&sidecar) {
            warn!(path = %sidecar.display(), "could not remove sidecar: {err}");
        }
    }
    Ok(())
}

fn shares_stem_with_other_primary(removed: &Path) -> bool {
    let (Some(dir), Some(stem)) = (removed.parent(), removed.file_stem()) else {
        return false;
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|candidate| candidate != removed)
        .any(|candidate| {
            candidate.file_stem() == Some(stem) && MediaType::from_path(&candidate).is_some()
        })
}
