#![forbid(unsafe_code)]

//! Shared security helpers: the root guard used by the binaries and the path
//! resolution every store reader and writer goes through.

use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use nix::unistd::Uid;

use crate::error::MediaError;

/// Fails fast when a binary is started as root. The server writes into the
/// media root on behalf of anonymous clients, so it must run under an
/// unprivileged account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; please use an unprivileged account");
    }
    Ok(())
}

/// Validates a client supplied, store-relative path and joins it onto `base`.
///
/// Only plain segments are accepted: `..`, absolute roots and `.` are
/// rejected, as are hidden segments (staging areas live in dot-directories and
/// must never be reachable by readers).
pub fn resolve_within(base: &Path, relative: &str) -> Result<PathBuf, MediaError> {
    let trimmed = relative.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(MediaError::InvalidRequest("empty path".into()));
    }
    if trimmed.contains('\\') || trimmed.contains('\0') {
        return Err(MediaError::Forbidden(format!("{relative} escapes the namespace")));
    }

    let candidate = Path::new(trimmed);
    for component in candidate.components() {
        match component {
            Component::Normal(segment) => {
                if segment.to_string_lossy().starts_with('.') {
                    return Err(MediaError::Forbidden(format!(
                        "{relative} references a hidden entry"
                    )));
                }
            }
            _ => {
                return Err(MediaError::Forbidden(format!(
                    "{relative} escapes the namespace"
                )));
            }
        }
    }

    let joined = base.join(candidate);

    // Symlinks inside the store could still point elsewhere; when the target
    // exists, its canonical form must stay under the canonical base.
    if let (Ok(real_base), Ok(real_target)) = (base.canonicalize(), joined.canonicalize())
        && !real_target.starts_with(&real_base)
    {
        return Err(MediaError::Forbidden(format!(
            "{relative} resolves outside the namespace"
        )));
    }

    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn plain_paths_are_joined() {
        let base = Path::new("/store/users/alice");
        let path = resolve_within(base, "clips/song.mp3").unwrap();
        assert_eq!(path, PathBuf::from("/store/users/alice/clips/song.mp3"));
    }

    #[test]
    fn leading_slash_is_relative() {
        let base = Path::new("/store/shared");
        let path = resolve_within(base, "/a.mp4").unwrap();
        assert_eq!(path, PathBuf::from("/store/shared/a.mp4"));
    }

    #[test]
    fn traversal_is_forbidden() {
        let base = Path::new("/store/users/alice");
        for bad in ["../bob/a.mp3", "clips/../../x", "./a.mp3", "a\\..\\b"] {
            let err = resolve_within(base, bad).unwrap_err();
            assert!(matches!(err, MediaError::Forbidden(_)), "{bad}: {err:?}");
        }
    }

    #[test]
    fn hidden_segments_are_forbidden() {
        let base = Path::new("/store/shared");
        let err = resolve_within(base, ".staging-abc/a.mp4").unwrap_err();
        assert!(matches!(err, MediaError::Forbidden(_)));
    }

    #[test]
    fn empty_path_is_invalid() {
        let err = resolve_within(Path::new("/s"), "/").unwrap_err();
        assert!(matches!(err, MediaError::InvalidRequest(_)));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_forbidden() -> anyhow::Result<()> {
        let root = tempdir()?;
        let base = root.path().join("ns");
        let outside = root.path().join("outside");
        std::fs::create_dir_all(&base)?;
        std::fs::create_dir_all(&outside)?;
        std::fs::write(outside.join("secret.mp3"), b"x")?;
        std::os::unix::fs::symlink(outside.join("secret.mp3"), base.join("link.mp3"))?;

        let err = resolve_within(&base, "link.mp3").unwrap_err();
        assert!(matches!(err, MediaError::Forbidden(_)));
        Ok(())
    }
}
