//! Range-aware file responses for `/stream` and `/thumbnail`.

use std::{io::SeekFrom, path::Path};

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use mime_guess::MimeGuess;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::{
    error::{MediaError, MediaResult},
    metadata::MediaType,
    store::{ContentStore, Namespace},
};

/// A single `bytes=` range as written by the client, before it is checked
/// against the file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=a-b`
    Bounded(u64, u64),
    /// `bytes=a-`
    From(u64),
    /// `bytes=-n`, the last `n` bytes.
    Suffix(u64),
}

impl ByteRange {
    /// Parses a `Range` header. Only the first range of a multi-range request
    /// is kept; anything malformed yields `None` and is treated as if no range
    /// had been sent.
    pub fn parse(value: &str) -> Option<Self> {
        let (unit, ranges) = value.trim().split_once('=')?;
        if !unit.trim().eq_ignore_ascii_case("bytes") {
            return None;
        }
        let first = ranges.split(',').next()?.trim();
        let (start, end) = first.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());

        match (start.is_empty(), end.is_empty()) {
            (true, true) => None,
            (true, false) => end.parse().ok().map(Self::Suffix),
            (false, true) => start.parse().ok().map(Self::From),
            (false, false) => {
                let start: u64 = start.parse().ok()?;
                let end: u64 = end.parse().ok()?;
                (end >= start).then_some(Self::Bounded(start, end))
            }
        }
    }

    /// Inclusive byte bounds inside a file of `size` bytes, or `None` when
    /// the range cannot be satisfied.
    pub fn resolve(self, size: u64) -> Option<(u64, u64)> {
        if size == 0 {
            return None;
        }
        let last = size - 1;
        match self {
            Self::Bounded(start, end) => (start < size).then(|| (start, end.min(last))),
            Self::From(start) => (start < size).then_some((start, last)),
            Self::Suffix(0) => None,
            Self::Suffix(len) => Some((size - len.min(size), last)),
        }
    }
}

fn header_value(value: String) -> MediaResult<HeaderValue> {
    HeaderValue::try_from(value).map_err(|err| MediaError::Io(format!("invalid header: {err}")))
}

/// Streams a media file out of a partition.
pub async fn stream(
    store: &ContentStore,
    namespace: &Namespace,
    relative: &str,
    range: Option<&HeaderValue>,
) -> MediaResult<Response> {
    let path = store.resolve_async(namespace, relative).await?;
    if MediaType::from_path(&path).is_none() {
        return Err(MediaError::NotFound(format!("{relative} is not a media file")));
    }
    serve_file(&path, range).await
}

/// Serves `path` whole (200) or sliced (206) depending on `range`.
pub async fn serve_file(path: &Path, range: Option<&HeaderValue>) -> MediaResult<Response> {
    let mut file = File::open(path).await.map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => MediaError::NotFound("file not found".into()),
        _ => MediaError::io(path.display(), err),
    })?;
    let metadata = file
        .metadata()
        .await
        .map_err(|err| MediaError::io(path.display(), err))?;
    if !metadata.is_file() {
        return Err(MediaError::NotFound("file not found".into()));
    }
    let size = metadata.len();

    let requested = range
        .and_then(|value| value.to_str().ok())
        .and_then(ByteRange::parse);

    let mut response = match requested {
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
        Some(requested) => match requested.resolve(size) {
            None => {
                debug!(path = %path.display(), ?requested, size, "unsatisfiable range");
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
                response
                    .headers_mut()
                    .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
                response
            }
            Some((start, end)) => {
                let length = end - start + 1;
                file.seek(SeekFrom::Start(start))
                    .await
                    .map_err(|err| MediaError::io(path.display(), err))?;
                let body = Body::from_stream(ReaderStream::new(file.take(length)));
                let mut response = body.into_response();
                *response.status_mut() = StatusCode::PARTIAL_CONTENT;
                let headers = response.headers_mut();
                headers.insert(
                    header::CONTENT_RANGE,
                    header_value(format!("bytes {start}-{end}/{size}"))?,
                );
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
                response
            }
        },
    };

    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = MimeGuess::from_path(path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use axum::body::to_bytes;
    use std::fs;
    use tempfile::tempdir;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn fixture(len: usize) -> Result<(tempfile::TempDir, ContentStore, Namespace)> {
        let root = tempdir()?;
        let store = ContentStore::open(root.path())?;
        let ns = Namespace::parse(Some("carol"))?;
        let dir = store.ensure_namespace_dir(&ns)?;
        fs::write(dir.join("clip.mp4"), sample(len))?;
        fs::write(dir.join("empty.mp3"), b"")?;
        Ok((root, store, ns))
    }

    fn range(value: &str) -> HeaderValue {
        HeaderValue::from_str(value).unwrap()
    }

    fn header<'a>(response: &'a Response, name: header::HeaderName) -> Option<&'a str> {
        response.headers().get(name).and_then(|value| value.to_str().ok())
    }

    #[test]
    fn parse_handles_all_forms() {
        assert_eq!(ByteRange::parse("bytes=100-199"), Some(ByteRange::Bounded(100, 199)));
        assert_eq!(ByteRange::parse("bytes=5-"), Some(ByteRange::From(5)));
        assert_eq!(ByteRange::parse("bytes=-20"), Some(ByteRange::Suffix(20)));
        assert_eq!(
            ByteRange::parse("bytes=0-9, 20-29"),
            Some(ByteRange::Bounded(0, 9))
        );
        assert_eq!(ByteRange::parse("bytes=9-1"), None);
        assert_eq!(ByteRange::parse("items=0-1"), None);
        assert_eq!(ByteRange::parse("bytes=-"), None);
        assert_eq!(ByteRange::parse("bytes=a-b"), None);
    }

    #[test]
    fn resolve_clamps_and_rejects() {
        assert_eq!(ByteRange::Bounded(0, 999).resolve(100), Some((0, 99)));
        assert_eq!(ByteRange::Bounded(100, 120).resolve(100), None);
        assert_eq!(ByteRange::From(99).resolve(100), Some((99, 99)));
        assert_eq!(ByteRange::Suffix(500).resolve(100), Some((0, 99)));
        assert_eq!(ByteRange::Suffix(0).resolve(100), None);
        assert_eq!(ByteRange::From(0).resolve(0), None);
    }

    #[tokio::test]
    async fn full_file_without_range() -> Result<()> {
        let (_root, store, ns) = fixture(1000)?;
        let response = stream(&store, &ns, "clip.mp4", None).await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, header::CONTENT_LENGTH), Some("1000"));
        assert_eq!(header(&response, header::CONTENT_TYPE), Some("video/mp4"));
        assert_eq!(header(&response, header::ACCEPT_RANGES), Some("bytes"));
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        assert_eq!(body.as_ref(), sample(1000).as_slice());
        Ok(())
    }

    #[tokio::test]
    async fn bounded_range_returns_exact_slice() -> Result<()> {
        let (_root, store, ns) = fixture(1000)?;
        let value = range("bytes=100-199");
        let response = stream(&store, &ns, "clip.mp4", Some(&value)).await?;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            header(&response, header::CONTENT_RANGE),
            Some("bytes 100-199/1000")
        );
        assert_eq!(header(&response, header::CONTENT_LENGTH), Some("100"));
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        assert_eq!(body.len(), 100);
        assert_eq!(body.as_ref(), &sample(1000)[100..200]);
        Ok(())
    }

    #[tokio::test]
    async fn suffix_range_serves_tail() -> Result<()> {
        let (_root, store, ns) = fixture(1000)?;
        let value = range("bytes=-10");
        let response = stream(&store, &ns, "clip.mp4", Some(&value)).await?;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            header(&response, header::CONTENT_RANGE),
            Some("bytes 990-999/1000")
        );
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        assert_eq!(body.as_ref(), &sample(1000)[990..]);
        Ok(())
    }

    #[tokio::test]
    async fn range_beyond_size_is_416() -> Result<()> {
        let (_root, store, ns) = fixture(1000)?;
        let value = range("bytes=5000-6000");
        let response = stream(&store, &ns, "clip.mp4", Some(&value)).await?;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(header(&response, header::CONTENT_RANGE), Some("bytes */1000"));

        let value = range("bytes=0-");
        let response = stream(&store, &ns, "empty.mp3", Some(&value)).await?;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_range_falls_back_to_full_file() -> Result<()> {
        let (_root, store, ns) = fixture(50)?;
        let value = range("bytes=oops");
        let response = stream(&store, &ns, "clip.mp4", Some(&value)).await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        assert_eq!(body.len(), 50);
        Ok(())
    }

    #[tokio::test]
    async fn traversal_and_missing_files_fail() -> Result<()> {
        let (_root, store, ns) = fixture(10)?;
        let err = stream(&store, &ns, "../../shared/clip.mp4", None).await.unwrap_err();
        assert!(matches!(err, MediaError::Forbidden(_)));
        let err = stream(&store, &ns, "nope.mp4", None).await.unwrap_err();
        assert!(matches!(err, MediaError::NotFound(_)));
        let err = stream(&store, &ns, "clip.meta", None).await.unwrap_err();
        assert!(matches!(err, MediaError::NotFound(_)));
        Ok(())
    }
}
