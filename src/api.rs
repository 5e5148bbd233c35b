//! HTTP surface of the engine.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path as AxumPath, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task;
use tracing::warn;

use crate::{
    adapter::{MediaTool, SearchResult},
    error::MediaError,
    library::{self, ListQuery},
    lifecycle::{self, FileOutcome},
    metadata::{DESCRIPTION_EXTENSION, IMAGE_EXTENSIONS, MediaEntry, MediaType, TargetType},
    orchestrator::{DownloadJob, Orchestrator},
    store::{ContentStore, Namespace},
    streaming,
};

#[derive(Clone)]
pub struct AppState {
    pub store: ContentStore,
    pub orchestrator: Orchestrator,
    pub tool: Arc<dyn MediaTool>,
    pub search_limit: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("{status}: {message}")]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<MediaError> for ApiError {
    fn from(err: MediaError) -> Self {
        Self {
            status: err.status(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<task::JoinError> for ApiError {
    fn from(err: task::JoinError) -> Self {
        Self::internal(format!("worker task failed: {err}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, "request failed: {}", self.message);
        }
        let body = json!({
            "success": false,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/download", post(start_download))
        .route("/download/progress/{job_id}", get(download_progress))
        .route("/download/{job_id}", get(download_status))
        .route("/download/{job_id}/cancel", post(cancel_download))
        .route("/media", get(list_media))
        .route("/stream/{*path}", get(stream_media))
        .route("/thumbnail/{*path}", get(thumbnail))
        .route("/description/{*path}", get(description))
        .route("/delete", post(delete_media))
        .route("/search", get(search))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceQuery {
    #[serde(default, alias = "user")]
    pub namespace: Option<String>,
}

impl NamespaceQuery {
    fn resolve(query: Result<Query<Self>, QueryRejection>) -> ApiResult<Namespace> {
        let Query(query) = query?;
        Ok(Namespace::parse(query.namespace.as_deref())?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default, alias = "type", alias = "format")]
    pub target_type: Option<String>,
    #[serde(default, alias = "user")]
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadAccepted {
    pub success: bool,
    pub job_id: String,
}

pub async fn start_download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<Json<DownloadAccepted>> {
    let Json(request) = payload?;
    let target = match request.target_type.as_deref().map(str::trim) {
        None | Some("") => TargetType::Video,
        Some(raw) => raw.parse::<TargetType>().map_err(ApiError::bad_request)?,
    };
    let namespace = Namespace::parse(request.namespace.as_deref())?;
    let job_id = state.orchestrator.start(&request.url, target, namespace)?;
    Ok(Json(DownloadAccepted {
        success: true,
        job_id,
    }))
}

pub async fn download_progress(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let events = state.orchestrator.subscribe(&job_id)?;
    let stream = events.map(|event| {
        Event::default()
            .event(event.stage.as_str())
            .json_data(&event)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn download_status(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> ApiResult<Json<DownloadJob>> {
    Ok(Json(state.orchestrator.snapshot(&job_id)?))
}

pub async fn cancel_download(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let canceled = state.orchestrator.cancel(&job_id)?;
    Ok(Json(json!({ "success": true, "canceled": canceled })))
}

#[derive(Debug, Default, Deserialize)]
pub struct MediaQuery {
    #[serde(default, alias = "user")]
    pub namespace: Option<String>,
    #[serde(default, rename = "type")]
    pub type_filter: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
}

impl MediaQuery {
    fn to_list_query(&self) -> ApiResult<ListQuery> {
        Ok(ListQuery {
            type_filter: self.type_filter.as_deref().unwrap_or_default().parse()?,
            search: self.search.clone(),
            sort: self.sort.as_deref().unwrap_or_default().parse()?,
            order: self.order.as_deref().unwrap_or_default().parse()?,
        })
    }
}

pub async fn list_media(
    State(state): State<AppState>,
    query: Result<Query<MediaQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<MediaEntry>>> {
    let Query(query) = query?;
    let namespace = Namespace::parse(query.namespace.as_deref())?;
    let list_query = query.to_list_query()?;
    let store = state.store.clone();
    let entries =
        task::spawn_blocking(move || library::list(&store, &namespace, &list_query)).await??;
    Ok(Json(entries))
}

pub async fn stream_media(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
    query: Result<Query<NamespaceQuery>, QueryRejection>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let namespace = NamespaceQuery::resolve(query)?;
    let response =
        streaming::stream(&state.store, &namespace, &path, headers.get(header::RANGE)).await?;
    Ok(response)
}

pub async fn thumbnail(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
    query: Result<Query<NamespaceQuery>, QueryRejection>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if let Some(placeholder) = state.store.placeholder_path(path.trim_start_matches('/')) {
        return Ok(streaming::serve_file(&placeholder, headers.get(header::RANGE)).await?);
    }

    let namespace = NamespaceQuery::resolve(query)?;
    let resolved = state.store.resolve_async(&namespace, &path).await?;
    let is_image = resolved
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
    if !is_image {
        return Err(MediaError::NotFound(format!("{path} is not a thumbnail")).into());
    }
    Ok(streaming::serve_file(&resolved, headers.get(header::RANGE)).await?)
}

/// Accepts either the description sidecar itself or the media file it
/// belongs to.
pub async fn description(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
    query: Result<Query<NamespaceQuery>, QueryRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let namespace = NamespaceQuery::resolve(query)?;
    let resolved = state.store.resolve_async(&namespace, &path).await?;
    let target = if MediaType::from_path(&resolved).is_some() {
        ContentStore::sidecars_for(&resolved)
            .description
            .ok_or_else(|| MediaError::NotFound(format!("no description for {path}")))?
    } else if resolved
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(DESCRIPTION_EXTENSION))
    {
        resolved
    } else {
        return Err(MediaError::NotFound(format!("{path} is not a description")).into());
    };

    let text = tokio::fs::read_to_string(&target)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => MediaError::NotFound(format!("no description for {path}")),
            _ => MediaError::io(&path, err),
        })?;
    Ok(Json(json!({ "success": true, "description": text })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default, alias = "user")]
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub per_file: Vec<FileOutcome>,
}

pub async fn delete_media(
    State(state): State<AppState>,
    payload: Result<Json<DeleteRequest>, JsonRejection>,
) -> ApiResult<Json<DeleteResponse>> {
    let Json(request) = payload?;
    let namespace = Namespace::parse(request.namespace.as_deref())?;
    let store = state.store.clone();
    let report =
        task::spawn_blocking(move || lifecycle::delete(&store, &namespace, &request.files))
            .await?;
    Ok(Json(DeleteResponse {
        success: report.success(),
        message: report.message(),
        per_file: report.results,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub term: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub success: bool,
    pub results: Vec<SearchResult>,
}

pub async fn search(
    State(state): State<AppState>,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> ApiResult<Json<SearchResponse>> {
    let Query(query) = query?;
    let term = query.term.trim();
    if term.is_empty() {
        return Err(MediaError::InvalidRequest("search term is required".into()).into());
    }
    let limit = query.limit.unwrap_or(state.search_limit).min(state.search_limit);
    let results = state.tool.search(term, limit).await?;
    Ok(Json(SearchResponse {
        success: true,
        results,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapter::{FetchRequest, FetchedMedia, ProgressSink},
        config::JobSettings,
        error::MediaResult,
        metadata::AUDIO_PLACEHOLDER,
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::Request,
    };
    use std::{
        fs,
        path::{Path, PathBuf},
    };
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct IdleTool;

    #[async_trait]
    impl MediaTool for IdleTool {
        async fn fetch(
            &self,
            _request: &FetchRequest,
            _progress: &ProgressSink,
            cancel: &CancellationToken,
        ) -> MediaResult<FetchedMedia> {
            cancel.cancelled().await;
            Err(MediaError::Canceled)
        }

        async fn transcode_audio(
            &self,
            _input: &Path,
            _cancel: &CancellationToken,
        ) -> MediaResult<PathBuf> {
            Err(MediaError::ToolCrashed("not used".into()))
        }

        async fn search(&self, term: &str, limit: usize) -> MediaResult<Vec<SearchResult>> {
            Ok((0..limit.min(2))
                .map(|i| SearchResult {
                    id: format!("{term}-{i}"),
                    title: format!("{term} #{i}"),
                    source_url: format!("https://example.com/{term}/{i}"),
                    thumbnail_url: format!("https://img.example.com/{i}.jpg"),
                    duration: None,
                })
                .collect())
        }
    }

    fn state() -> Result<(tempfile::TempDir, AppState)> {
        let root = tempdir()?;
        let store = ContentStore::open(root.path())?;
        let tool: Arc<dyn MediaTool> = Arc::new(IdleTool);
        let orchestrator = Orchestrator::new(
            store.clone(),
            tool.clone(),
            JobSettings {
                min_free_bytes: 0,
                ..JobSettings::default()
            },
        );
        Ok((
            root,
            AppState {
                store,
                orchestrator,
                tool,
                search_limit: 5,
            },
        ))
    }

    fn seed(state: &AppState, namespace: &str, files: &[(&str, &[u8])]) -> Result<()> {
        let dir = state
            .store
            .ensure_namespace_dir(&Namespace::parse(Some(namespace))?)?;
        for (name, bytes) in files {
            fs::write(dir.join(name), bytes)?;
        }
        Ok(())
    }

    async fn body_json(response: Response) -> Result<serde_json::Value> {
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn namespace(name: &str) -> Result<Query<NamespaceQuery>, QueryRejection> {
        Ok(Query(NamespaceQuery {
            namespace: Some(name.to_string()),
        }))
    }

    #[tokio::test]
    async fn invalid_download_request_renders_structured_error() -> Result<()> {
        let (_root, state) = state()?;
        let err = start_download(
            State(state),
            Ok(Json(DownloadRequest {
                url: "   ".into(),
                target_type: None,
                namespace: None,
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await?;
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("source URL"));
        Ok(())
    }

    #[tokio::test]
    async fn download_then_status_then_cancel() -> Result<()> {
        let (_root, state) = state()?;
        let Json(accepted) = start_download(
            State(state.clone()),
            Ok(Json(DownloadRequest {
                url: "https://example.com/watch?v=1".into(),
                target_type: Some("audio".into()),
                namespace: Some("Erin".into()),
            })),
        )
        .await?;
        assert!(accepted.success);

        let Json(job) =
            download_status(State(state.clone()), AxumPath(accepted.job_id.clone())).await?;
        assert_eq!(job.namespace, "erin");
        assert_eq!(job.target_type, TargetType::Audio);

        let Json(body) =
            cancel_download(State(state.clone()), AxumPath(accepted.job_id.clone())).await?;
        assert_eq!(body["canceled"], true);

        let err = download_status(State(state), AxumPath("download-404".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_target_type_is_bad_request() -> Result<()> {
        let (_root, state) = state()?;
        let err = start_download(
            State(state),
            Ok(Json(DownloadRequest {
                url: "https://example.com/v".into(),
                target_type: Some("hologram".into()),
                namespace: None,
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn media_listing_respects_query() -> Result<()> {
        let (_root, state) = state()?;
        seed(
            &state,
            "frank",
            &[("a.mp3", b"aaaa"), ("b.mp4", b"bbbbbbbb"), ("c.txt", b"c")],
        )?;

        let Json(entries) = list_media(
            State(state.clone()),
            Ok(Query(MediaQuery {
                namespace: Some("frank".into()),
                sort: Some("size".into()),
                order: Some("desc".into()),
                ..MediaQuery::default()
            })),
        )
        .await?;
        let paths: Vec<_> = entries.iter().map(|entry| entry.path.as_str()).collect();
        assert_eq!(paths, vec!["b.mp4", "a.mp3"]);

        let Json(audio) = list_media(
            State(state.clone()),
            Ok(Query(MediaQuery {
                namespace: Some("frank".into()),
                type_filter: Some("audio".into()),
                ..MediaQuery::default()
            })),
        )
        .await?;
        assert_eq!(audio.len(), 1);

        let err = list_media(
            State(state),
            Ok(Query(MediaQuery {
                sort: Some("color".into()),
                ..MediaQuery::default()
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn stream_honors_range_header() -> Result<()> {
        let (_root, state) = state()?;
        seed(&state, "gina", &[("clip.webm", b"0123456789")])?;
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, "bytes=2-4".parse()?);

        let response = stream_media(
            State(state.clone()),
            AxumPath("clip.webm".into()),
            namespace("gina"),
            headers,
        )
        .await?;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        assert_eq!(bytes.as_ref(), b"234");

        let err = stream_media(
            State(state),
            AxumPath("../shared/clip.webm".into()),
            namespace("gina"),
            HeaderMap::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        Ok(())
    }

    #[tokio::test]
    async fn thumbnails_fall_back_to_placeholders() -> Result<()> {
        let (_root, state) = state()?;
        seed(&state, "hal", &[("song.mp3", b"x"), ("song.png", b"png")])?;

        let response = thumbnail(
            State(state.clone()),
            AxumPath(AUDIO_PLACEHOLDER.into()),
            namespace("hal"),
            HeaderMap::new(),
        )
        .await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/svg+xml"
        );

        let response = thumbnail(
            State(state.clone()),
            AxumPath("song.png".into()),
            namespace("hal"),
            HeaderMap::new(),
        )
        .await?;
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        assert_eq!(bytes.as_ref(), b"png");

        let err = thumbnail(
            State(state),
            AxumPath("song.mp3".into()),
            namespace("hal"),
            HeaderMap::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn description_reads_sidecar_from_either_path() -> Result<()> {
        let (_root, state) = state()?;
        seed(
            &state,
            "ivy",
            &[("talk.mp4", b"v"), ("talk.txt", b"A talk about Rust"), ("quiet.mp3", b"a")],
        )?;

        for path in ["talk.txt", "talk.mp4"] {
            let Json(body) =
                description(State(state.clone()), AxumPath(path.into()), namespace("ivy")).await?;
            assert_eq!(body["success"], true);
            assert_eq!(body["description"], "A talk about Rust");
        }

        let err = description(State(state), AxumPath("quiet.mp3".into()), namespace("ivy"))
            .await
            .unwrap_err();
        let body = body_json(err.into_response()).await?;
        assert_eq!(body["success"], false);
        Ok(())
    }

    #[tokio::test]
    async fn delete_reports_per_file_outcomes() -> Result<()> {
        let (_root, state) = state()?;
        seed(&state, "jay", &[("one.mp3", b"1"), ("one.jpg", b"j")])?;

        let Json(response) = delete_media(
            State(state.clone()),
            Ok(Json(DeleteRequest {
                files: vec!["one.mp3".into(), "two.mp3".into()],
                namespace: Some("jay".into()),
            })),
        )
        .await?;
        assert!(!response.success);
        assert_eq!(response.message, "Deleted 1 files with 1 errors");
        let value = serde_json::to_value(&response)?;
        assert_eq!(value["perFile"][0]["outcome"], "deleted");
        assert_eq!(value["perFile"][1]["outcome"], "notFound");

        let Json(empty) = delete_media(
            State(state),
            Ok(Json(DeleteRequest {
                files: Vec::new(),
                namespace: None,
            })),
        )
        .await?;
        assert!(!empty.success);
        assert_eq!(empty.message, "No files selected");
        Ok(())
    }

    #[tokio::test]
    async fn search_requires_term_and_caps_limit() -> Result<()> {
        let (_root, state) = state()?;
        let Json(found) = search(
            State(state.clone()),
            Ok(Query(SearchQuery {
                term: " lofi ".into(),
                limit: Some(50),
            })),
        )
        .await?;
        assert!(found.success);
        assert_eq!(found.results.len(), 2);
        assert_eq!(found.results[0].id, "lofi-0");

        let err = search(State(state), Ok(Query(SearchQuery::default())))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_query_strings_get_structured_errors() -> Result<()> {
        let (_root, state) = state()?;
        let app = router(state);

        for uri in [
            "/search?term=x&limit=abc",
            "/media?sort=name&sort=size",
            "/stream/clip.mp4?namespace=a&namespace=b",
        ] {
            let request = Request::builder().uri(uri).body(Body::empty())?;
            let response = app.clone().oneshot(request).await?;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            let body = body_json(response).await?;
            assert_eq!(body["success"], false, "{uri}");
            assert!(
                body["message"]
                    .as_str()
                    .is_some_and(|message| message.contains("query string")),
                "{uri}: {body}"
            );
        }
        Ok(())
    }

    #[test]
    fn request_bodies_accept_aliases() -> Result<()> {
        let request: DownloadRequest = serde_json::from_str(
            r#"{"url": "https://example.com", "type": "audio", "user": "kim"}"#,
        )?;
        assert_eq!(request.target_type.as_deref(), Some("audio"));
        assert_eq!(request.namespace.as_deref(), Some("kim"));

        let request: DownloadRequest =
            serde_json::from_str(r#"{"url": "https://example.com", "targetType": "video"}"#)?;
        assert_eq!(request.target_type.as_deref(), Some("video"));
        Ok(())
    }
}
