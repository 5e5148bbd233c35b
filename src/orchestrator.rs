//! Download Orchestrator.
//!
//! Every accepted request becomes a [`DownloadJob`] held in a bounded map and
//! driven by its own tokio task. Progress fans out to any number of
//! subscribers through a per-job broadcast channel; the job record itself is
//! only ever mutated by the orchestrator and handed out as snapshots.
//!
//! Requests for the same canonical URL in the same namespace are collapsed:
//! the first becomes the leader and runs the tool, later ones follow it and
//! reuse its committed entry.

use std::{
    collections::HashMap,
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use chrono::Utc;
use futures_util::{Stream, stream};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    adapter::{self, FetchRequest, JobStatus, MediaTool, ProgressEvent},
    config::JobSettings,
    error::{MediaError, MediaResult},
    library,
    metadata::{MediaEntry, SidecarMeta, TargetType},
    store::{ContentStore, Namespace},
};

const EVENT_BUFFER: usize = 64;

/// Public view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJob {
    pub job_id: String,
    #[serde(rename = "sourceURL")]
    pub source_url: String,
    pub target_type: TargetType,
    pub namespace: String,
    pub status: JobStatus,
    pub progress_percent: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Jobs only collapse when they would produce the same file: same partition,
/// same canonical URL and same target type.
type DedupKey = (Namespace, String, TargetType);

struct JobState {
    job: DownloadJob,
    last_event: ProgressEvent,
    finished_at: Option<Instant>,
    observed: bool,
}

struct JobSlot {
    id: String,
    namespace: Namespace,
    key: DedupKey,
    state: Mutex<JobState>,
    events: broadcast::Sender<ProgressEvent>,
    cancel: CancellationToken,
}

impl JobSlot {
    fn snapshot(&self) -> DownloadJob {
        self.state.lock().job.clone()
    }

    fn current_event(&self) -> ProgressEvent {
        self.state.lock().last_event.clone()
    }

    /// Applies an event to the job and broadcasts it. Percent never moves
    /// backwards and nothing is applied after a terminal status.
    fn publish(&self, event: ProgressEvent) {
        let mut state = self.state.lock();
        self.apply(&mut state, event);
    }

    fn apply(&self, state: &mut JobState, mut event: ProgressEvent) {
        if state.job.status.is_terminal() {
            return;
        }
        event.percent = event.percent.clamp(0.0, 100.0).max(state.job.progress_percent);
        if event.stage == JobStatus::Done {
            event.percent = 100.0;
        }

        state.job.status = event.stage;
        state.job.progress_percent = event.percent;
        if event.stage == JobStatus::Failed {
            state.job.error_message = Some(event.message.clone());
        }
        if event.stage.is_terminal() {
            state.finished_at = Some(Instant::now());
        }
        state.last_event = event.clone();
        // Sent under the lock so the snapshot handed to a new subscriber and
        // the channel never disagree.
        let _ = self.events.send(event);
    }

    /// Moves to `committing` unless a cancel got there first.
    fn begin_commit(&self) -> bool {
        let mut state = self.state.lock();
        if self.cancel.is_cancelled() || state.job.status.is_terminal() {
            return false;
        }
        self.apply(
            &mut state,
            ProgressEvent::new(JobStatus::Committing, 100.0, "Saving to library"),
        );
        true
    }

    fn mark_observed(&self) {
        let mut state = self.state.lock();
        if state.job.status.is_terminal() {
            state.observed = true;
        }
    }

    fn is_collectable(&self, now: Instant, settings: &JobSettings) -> bool {
        let state = self.state.lock();
        match state.finished_at {
            Some(finished) => {
                state.observed || now.duration_since(finished) >= settings.retention
            }
            None => false,
        }
    }
}

enum Role {
    Leader,
    Follower(Arc<JobSlot>),
}

enum FollowOutcome {
    Reused(MediaEntry),
    Canceled,
    LeaderGone,
}

struct Inner {
    store: ContentStore,
    tool: Arc<dyn MediaTool>,
    settings: JobSettings,
    jobs: RwLock<HashMap<String, Arc<JobSlot>>>,
    in_flight: Mutex<HashMap<DedupKey, Arc<JobSlot>>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(store: ContentStore, tool: Arc<dyn MediaTool>, settings: JobSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                tool,
                settings,
                jobs: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &ContentStore {
        &self.inner.store
    }

    /// Accepts a download and schedules it. Returns as soon as the job is
    /// registered; the work happens on a spawned task.
    pub fn start(
        &self,
        source_url: &str,
        target: TargetType,
        namespace: Namespace,
    ) -> MediaResult<String> {
        let canonical = canonical_url(source_url)?;
        self.prune_expired();

        let job_id = format!(
            "download-{}",
            self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
        );
        let initial = ProgressEvent::new(JobStatus::Queued, 0.0, "Queued");
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let slot = Arc::new(JobSlot {
            id: job_id.clone(),
            namespace: namespace.clone(),
            key: (namespace.clone(), canonical, target),
            state: Mutex::new(JobState {
                job: DownloadJob {
                    job_id: job_id.clone(),
                    source_url: source_url.trim().to_string(),
                    target_type: target,
                    namespace: namespace.to_string(),
                    status: JobStatus::Queued,
                    progress_percent: 0.0,
                    error_message: None,
                },
                last_event: initial,
                finished_at: None,
                observed: false,
            }),
            events,
            cancel: CancellationToken::new(),
        });

        {
            let mut jobs = self.inner.jobs.write();
            if jobs.len() >= self.inner.settings.max_tracked_jobs {
                warn!(tracked = jobs.len(), "rejecting download, job map is full");
                return Err(MediaError::Busy);
            }
            jobs.insert(job_id.clone(), slot.clone());
        }

        let role = self.admit(&slot);
        info!(
            job_id = %job_id,
            namespace = %namespace,
            url = %source_url.trim(),
            kind = target.as_str(),
            follower = matches!(role, Role::Follower(_)),
            "download accepted"
        );

        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.drive(slot, role).await });
        Ok(job_id)
    }

    /// Current state of a job. Reading a finished job counts as observing it.
    pub fn snapshot(&self, job_id: &str) -> MediaResult<DownloadJob> {
        let slot = self.slot(job_id)?;
        slot.mark_observed();
        Ok(slot.snapshot())
    }

    /// Progress stream for a job: the current state first, then every later
    /// event, ending after the terminal one. Dropping the stream does not
    /// affect the job.
    pub fn subscribe(&self, job_id: &str) -> MediaResult<impl Stream<Item = ProgressEvent> + use<>> {
        let slot = self.slot(job_id)?;
        let (first, receiver) = {
            let state = slot.state.lock();
            (state.last_event.clone(), slot.events.subscribe())
        };

        struct Cursor {
            slot: Arc<JobSlot>,
            pending: Option<ProgressEvent>,
            receiver: broadcast::Receiver<ProgressEvent>,
            finished: bool,
        }

        let cursor = Cursor {
            slot,
            pending: Some(first),
            receiver,
            finished: false,
        };

        Ok(stream::unfold(cursor, |mut cursor| async move {
            if cursor.finished {
                return None;
            }
            let event = match cursor.pending.take() {
                Some(event) => event,
                None => match cursor.receiver.recv().await {
                    Ok(event) => event,
                    // Lagging subscribers skip ahead to the latest state.
                    Err(broadcast::error::RecvError::Lagged(_)) => cursor.slot.current_event(),
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            };
            if event.stage.is_terminal() {
                cursor.finished = true;
                cursor.slot.mark_observed();
            }
            Some((event, cursor))
        }))
    }

    /// Requests cancellation. Returns `false` when the job is already past the
    /// point where it can be stopped.
    pub fn cancel(&self, job_id: &str) -> MediaResult<bool> {
        let slot = self.slot(job_id)?;
        let state = slot.state.lock();
        if !state.job.status.is_cancelable() {
            debug!(job_id, status = ?state.job.status, "cancel ignored");
            return Ok(false);
        }
        slot.cancel.cancel();
        info!(job_id, "cancel requested");
        Ok(true)
    }

    /// Drops finished jobs that were observed or outlived the retention
    /// window. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut jobs = self.inner.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, slot| !slot.is_collectable(now, &self.inner.settings));
        let removed = before - jobs.len();
        if removed > 0 {
            debug!(removed, remaining = jobs.len(), "pruned finished jobs");
        }
        removed
    }

    pub fn tracked_jobs(&self) -> usize {
        self.inner.jobs.read().len()
    }

    fn slot(&self, job_id: &str) -> MediaResult<Arc<JobSlot>> {
        self.inner
            .jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| MediaError::NotFound(format!("unknown job {job_id}")))
    }

    /// Claims the dedup key, or returns the in-flight job that holds it.
    fn admit(&self, slot: &Arc<JobSlot>) -> Role {
        let mut in_flight = self.inner.in_flight.lock();
        if let Some(leader) = in_flight.get(&slot.key)
            && !Arc::ptr_eq(leader, slot)
            && !leader.snapshot().status.is_terminal()
        {
            return Role::Follower(leader.clone());
        }
        in_flight.insert(slot.key.clone(), slot.clone());
        Role::Leader
    }

    fn release(&self, slot: &Arc<JobSlot>) {
        let mut in_flight = self.inner.in_flight.lock();
        if in_flight
            .get(&slot.key)
            .is_some_and(|holder| Arc::ptr_eq(holder, slot))
        {
            in_flight.remove(&slot.key);
        }
    }

    async fn drive(&self, slot: Arc<JobSlot>, mut role: Role) {
        loop {
            match role {
                Role::Leader => {
                    let outcome = self.lead(&slot).await;
                    self.finish(&slot, outcome);
                    return;
                }
                Role::Follower(leader) => match follow(&slot, &leader).await {
                    FollowOutcome::Reused(entry) => {
                        info!(job_id = %slot.id, leader = %leader.id, "reused identical download");
                        self.finish(&slot, Ok(entry));
                        return;
                    }
                    FollowOutcome::Canceled => {
                        self.finish(&slot, Err(MediaError::Canceled));
                        return;
                    }
                    FollowOutcome::LeaderGone => {
                        debug!(job_id = %slot.id, leader = %leader.id, "leader did not finish, retrying admission");
                        role = self.admit(&slot);
                    }
                },
            }
        }
    }

    fn finish(&self, slot: &Arc<JobSlot>, outcome: MediaResult<MediaEntry>) {
        self.release(slot);
        let event = match outcome {
            Ok(entry) => {
                info!(job_id = %slot.id, path = %entry.path, "download finished");
                ProgressEvent {
                    percent: 100.0,
                    stage: JobStatus::Done,
                    message: format!("Saved {}", entry.name),
                    entry: Some(entry),
                }
            }
            Err(MediaError::Canceled) => {
                info!(job_id = %slot.id, "download canceled");
                ProgressEvent::new(JobStatus::Canceled, 0.0, "Download canceled")
            }
            Err(err) => {
                warn!(job_id = %slot.id, "download failed: {err}");
                ProgressEvent::new(JobStatus::Failed, 0.0, err.to_string())
            }
        };
        slot.publish(event);
    }

    async fn lead(&self, slot: &Arc<JobSlot>) -> MediaResult<MediaEntry> {
        if slot.cancel.is_cancelled() {
            return Err(MediaError::Canceled);
        }
        slot.publish(ProgressEvent::new(
            JobStatus::Running,
            0.0,
            "Starting download",
        ));

        let store = &self.inner.store;
        let staging = store.create_staging(&slot.namespace)?;
        if let Some(free) = store.free_bytes(&slot.namespace)
            && free < self.inner.settings.min_free_bytes
        {
            return Err(MediaError::InsufficientStorage(format!(
                "{free} bytes free, {} required",
                self.inner.settings.min_free_bytes
            )));
        }

        let (source_url, target) = {
            let job = slot.snapshot();
            (job.source_url, job.target_type)
        };
        let request = FetchRequest {
            source_url: source_url.clone(),
            target,
            staging_dir: staging.path().to_path_buf(),
        };

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let fetched = {
            let mut fetch = pin!(adapter::retrieve(
                self.inner.tool.as_ref(),
                &request,
                &sender,
                &slot.cancel,
                self.inner.settings.download_timeout,
            ));
            loop {
                tokio::select! {
                    biased;
                    Some(event) = receiver.recv() => slot.publish(event),
                    result = &mut fetch => break result,
                }
            }
        };
        while let Ok(event) = receiver.try_recv() {
            slot.publish(event);
        }
        let fetched = fetched?;

        if !slot.begin_commit() {
            return Err(MediaError::Canceled);
        }

        let meta = SidecarMeta {
            download_date: Utc::now(),
            original_title: fetched.title,
            source_url,
            target_type: if fetched.audio_only { TargetType::Audio } else { target },
            job_id: Some(slot.id.clone()),
        };
        let store = store.clone();
        let namespace = slot.namespace.clone();
        let staged = fetched.staged;
        let entry = tokio::task::spawn_blocking(move || {
            let relative = store.commit(&namespace, &staged, &meta)?;
            library::entry_for(&store, &namespace, &relative)
        })
        .await
        .map_err(|err| MediaError::CommitFailed(format!("commit task failed: {err}")))??;

        drop(staging);
        Ok(entry)
    }
}

/// Mirrors the leader until it finishes. Only the follower's own cancel or the
/// leader's terminal event ends the wait.
async fn follow(slot: &Arc<JobSlot>, leader: &Arc<JobSlot>) -> FollowOutcome {
    let (current, mut receiver) = {
        let state = leader.state.lock();
        (state.last_event.clone(), leader.events.subscribe())
    };
    let mut pending = Some(current);

    loop {
        let event = match pending.take() {
            Some(event) => event,
            None => tokio::select! {
                biased;
                _ = slot.cancel.cancelled() => return FollowOutcome::Canceled,
                received = receiver.recv() => match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => leader.current_event(),
                    Err(broadcast::error::RecvError::Closed) => return FollowOutcome::LeaderGone,
                },
            },
        };
        if slot.cancel.is_cancelled() {
            return FollowOutcome::Canceled;
        }

        match event.stage {
            JobStatus::Done => {
                return match event.entry {
                    Some(entry) => FollowOutcome::Reused(entry),
                    None => FollowOutcome::LeaderGone,
                };
            }
            JobStatus::Failed | JobStatus::Canceled => return FollowOutcome::LeaderGone,
            _ => slot.publish(ProgressEvent::new(
                JobStatus::Queued,
                event.percent,
                format!("Waiting for {} ({})", leader.id, event.message),
            )),
        }
    }
}

/// Dedup key form of a source URL: scheme and host lowercased, fragment and
/// trailing slash dropped. Also the validation gate for `start`.
pub fn canonical_url(raw: &str) -> MediaResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(MediaError::InvalidRequest("source URL is required".into()));
    }
    let mut url = Url::parse(trimmed)
        .map_err(|err| MediaError::InvalidRequest(format!("malformed source URL: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(MediaError::InvalidRequest(format!(
            "unsupported URL scheme `{}`",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(MediaError::InvalidRequest("source URL has no host".into()));
    }
    url.set_fragment(None);

    let mut canonical = url.to_string();
    if url.query().is_none() {
        while canonical.ends_with('/') {
            canonical.pop();
        }
    }
    Ok(canonical)
}
