//! One (content, quality) transcoding session.
//!
//! A session owns a work directory, the synthesized full-length playlist,
//! and at most one running encoder. Seeks outside what the running encoder
//! covers start a new generation at the target instead of waiting for the
//! old one to catch up; earlier generations' finished segments stay on disk
//! and keep being served.
//!
//! Lock order is `control` (async) before `phase` before the store's lock.
//! The control lock serializes generation changes: launching, seeking,
//! crash handling and teardown.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use mq_av::{EncoderEvent, EncoderHandle, ExitOutcome, LaunchSpec, ProcessSupervisor};
use mq_core::config::{QualityProfile, TranscodeConfig};
use mq_core::events::{EventBus, EventPayload, TerminationReason};
use mq_core::{EncoderFailure, Error, Result, SessionId, SessionKey};
use mq_media::manifest::Manifest;
use mq_media::timeline::{Generation, GenerationId, SEGMENT_FILE_PATTERN};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, OnceCell};

use crate::source::SourceMedia;
use crate::store::{GenerationStatus, ReadableSegment, SegmentLookup, SegmentStore};

/// Name segments are served under in the session playlist.
pub fn segment_uri(index: u64) -> String {
    format!("segment/{index}.ts")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// First encoder launched, no segment yet.
    Starting,
    Encoding,
    /// Encoding, but no request for at least the idle timeout.
    Idle,
    /// A seek replaced the encoder and the new one has not produced yet.
    SeekPending,
    Terminating,
    Terminated,
}

/// What a seek did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SeekOutcome {
    /// The target is served, or will be soon, by what already exists.
    Reused { index: u64 },
    /// A new encoder generation was started.
    Restarted {
        generation: GenerationId,
        start_index: u64,
    },
}

#[derive(Debug, Clone)]
enum SessionFailure {
    LaunchFailed(EncoderFailure),
    Crashed(EncoderFailure),
}

impl SessionFailure {
    fn to_error(&self) -> Error {
        match self {
            SessionFailure::LaunchFailed(failure) => Error::EncoderLaunchFailed {
                failure: failure.clone(),
            },
            SessionFailure::Crashed(failure) => Error::EncoderCrashed {
                failure: failure.clone(),
            },
        }
    }
}

fn launch_failure(err: &Error) -> EncoderFailure {
    match err {
        Error::EncoderLaunchFailed { failure } | Error::EncoderCrashed { failure } => {
            failure.clone()
        }
        other => EncoderFailure::Generic {
            exit_code: None,
            detail: other.to_string(),
        },
    }
}

/// Shared services a session needs.
#[derive(Clone)]
pub struct SessionDeps {
    pub supervisor: Arc<ProcessSupervisor>,
    pub events: Arc<EventBus>,
    pub settings: Arc<TranscodeConfig>,
}

struct ActiveEncoder {
    generation: GenerationId,
    handle: EncoderHandle,
}

#[derive(Default)]
struct Control {
    encoder: Option<ActiveEncoder>,
    crash_restarts: u32,
}

/// Point-in-time view of a session for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub key: SessionKey,
    pub state: SessionState,
    pub source: PathBuf,
    pub duration_secs: f64,
    pub segments: u64,
    pub ready_segments: usize,
    pub offset_secs: f64,
    pub generation: Option<GenerationId>,
    pub generations: usize,
    pub encoder_pid: Option<u32>,
    pub idle_secs: f64,
    pub error: Option<String>,
}

pub struct TranscodeSession {
    id: SessionId,
    key: SessionKey,
    source: SourceMedia,
    quality: QualityProfile,
    work_dir: PathBuf,
    manifest: Manifest,
    playlist: String,
    store: SegmentStore,
    deps: SessionDeps,
    phase: RwLock<SessionState>,
    last_access: Mutex<Instant>,
    encoder_pid: Mutex<Option<u32>>,
    failure: Mutex<Option<SessionFailure>>,
    terminating: AtomicBool,
    control: tokio::sync::Mutex<Control>,
    teardown: OnceCell<()>,
}

impl std::fmt::Debug for TranscodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

impl TranscodeSession {
    /// Create the work directory and launch the first generation at 0.
    pub async fn start(
        id: SessionId,
        key: SessionKey,
        source: SourceMedia,
        quality: QualityProfile,
        work_dir: PathBuf,
        deps: SessionDeps,
    ) -> Result<Arc<Self>> {
        let segment_secs = deps.settings.segment_secs();
        let manifest = Manifest::synthesize(source.duration_secs, segment_secs)?;
        let playlist = manifest.to_playlist(segment_uri).to_string();

        tokio::fs::create_dir_all(&work_dir).await?;

        let session = Arc::new(Self {
            id,
            key,
            source,
            quality,
            store: SegmentStore::new(work_dir.clone(), segment_secs),
            work_dir,
            manifest,
            playlist,
            deps,
            phase: RwLock::new(SessionState::Starting),
            last_access: Mutex::new(Instant::now()),
            encoder_pid: Mutex::new(None),
            failure: Mutex::new(None),
            terminating: AtomicBool::new(false),
            control: tokio::sync::Mutex::new(Control::default()),
            teardown: OnceCell::new(),
        });

        {
            let mut control = session.control.lock().await;
            if let Err(e) = session.launch_generation(&mut control, 0.0).await {
                drop(control);
                if let Err(io) = tokio::fs::remove_dir_all(&session.work_dir).await {
                    tracing::warn!(dir = %session.work_dir.display(), error = %io, "failed to remove work dir");
                }
                return Err(Error::EncoderLaunchFailed {
                    failure: launch_failure(&e),
                });
            }
        }

        tracing::info!(
            session = %session.id.short(),
            key = %session.key,
            duration_secs = session.manifest.total_duration_secs(),
            segments = session.manifest.len(),
            "session started"
        );
        session.deps.events.broadcast(EventPayload::SessionCreated {
            session_id: session.id,
            key: session.key.clone(),
            duration_secs: session.manifest.total_duration_secs(),
            segments: session.manifest.len(),
        });

        Ok(session)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn source(&self) -> &SourceMedia {
        &self.source
    }

    pub fn quality(&self) -> &QualityProfile {
        &self.quality
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The full-length VOD media playlist.
    pub fn playlist(&self) -> &str {
        &self.playlist
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    pub fn encoder_pid(&self) -> Option<u32> {
        *self.encoder_pid.lock()
    }

    /// Offset the latest generation was requested at.
    pub fn offset_secs(&self) -> f64 {
        self.store
            .latest_generation()
            .map_or(0.0, |g| g.offset_secs)
    }

    pub fn current_generation(&self) -> Option<GenerationId> {
        self.store.active_generation().map(|g| g.id)
    }

    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access())
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        self.state_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> SessionState {
        let phase = *self.phase.read();
        if phase == SessionState::Encoding && self.idle_for(now) >= self.deps.settings.idle_timeout()
        {
            return SessionState::Idle;
        }
        phase
    }

    /// The terminal error, if the encoder failed for good.
    pub fn failure(&self) -> Option<Error> {
        self.failure.lock().as_ref().map(SessionFailure::to_error)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let now = Instant::now();
        SessionSnapshot {
            id: self.id,
            key: self.key.clone(),
            state: self.state_at(now),
            source: self.source.path.clone(),
            duration_secs: self.manifest.total_duration_secs(),
            segments: self.manifest.len(),
            ready_segments: self.store.ready_count(),
            offset_secs: self.offset_secs(),
            generation: self.current_generation(),
            generations: self.store.generation_count(),
            encoder_pid: self.encoder_pid(),
            idle_secs: self.idle_for(now).as_secs_f64(),
            error: self.failure().map(|e| e.to_string()),
        }
    }

    // -----------------------------------------------------------------------
    // Generations
    // -----------------------------------------------------------------------

    async fn launch_generation(
        self: &Arc<Self>,
        control: &mut Control,
        offset_secs: f64,
    ) -> Result<Generation> {
        let generation = self.store.begin_generation(offset_secs);
        let spec = LaunchSpec {
            source: self.source.path.clone(),
            seek_secs: self.manifest.start_of(generation.start_index),
            segment_duration_secs: self.deps.settings.segment_duration_secs.max(1),
            output_dir: self.work_dir.join(generation.id.dir_name()),
            segment_pattern: SEGMENT_FILE_PATTERN.to_string(),
            quality: self.quality.clone(),
            hw_accel: self.deps.settings.hw_accel.clone(),
            video_preset: self.deps.settings.video_preset.clone(),
        };

        let (handle, events) = match self.deps.supervisor.launch(&spec).await {
            Ok(launched) => launched,
            Err(e) => {
                self.store
                    .finish_generation(generation.id, GenerationStatus::Failed);
                return Err(e);
            }
        };

        *self.encoder_pid.lock() = handle.pid();
        tracing::info!(
            session = %self.id.short(),
            generation = %generation.id,
            offset_secs,
            start_index = generation.start_index,
            pid = ?handle.pid(),
            "generation started"
        );
        self.deps.events.broadcast(EventPayload::GenerationStarted {
            session_id: self.id,
            generation: generation.id.as_u32(),
            offset_secs,
            start_index: generation.start_index,
            pid: handle.pid(),
        });

        tokio::spawn(pump(Arc::downgrade(self), generation.id, events));
        control.encoder = Some(ActiveEncoder {
            generation: generation.id,
            handle,
        });
        Ok(generation)
    }

    async fn complete_segment(&self, generation: GenerationId, local: u64) {
        let Some(record) = self.store.record(generation, local) else {
            return;
        };
        match tokio::fs::metadata(&record.path).await {
            Ok(meta) => {
                self.store.mark_ready(generation, local, meta.len());
            }
            Err(e) => {
                tracing::warn!(
                    session = %self.id.short(),
                    path = %record.path.display(),
                    error = %e,
                    "finished segment is missing on disk"
                );
            }
        }
    }

    async fn on_segment_started(&self, generation: GenerationId, local: u64, path: PathBuf) {
        if local > 0 {
            self.complete_segment(generation, local - 1).await;
        }
        let mut phase = self.phase.write();
        if self.store.mark_writing(generation, local, path)
            && matches!(*phase, SessionState::Starting | SessionState::SeekPending)
        {
            *phase = SessionState::Encoding;
        }
    }

    async fn on_exit(self: &Arc<Self>, generation: GenerationId, outcome: ExitOutcome) {
        let mut control = self.control.lock().await;
        let current = control.encoder.as_ref().map(|e| e.generation) == Some(generation);
        if !current || self.is_terminating() || outcome.requested {
            return;
        }
        control.encoder = None;
        *self.encoder_pid.lock() = None;

        if outcome.success {
            if let Some(last) = self.store.frontier_local(generation) {
                self.complete_segment(generation, last).await;
            }
            self.store
                .finish_generation(generation, GenerationStatus::Exhausted);
            {
                let mut phase = self.phase.write();
                if matches!(*phase, SessionState::Starting | SessionState::SeekPending) {
                    *phase = SessionState::Encoding;
                }
            }
            tracing::info!(session = %self.id.short(), generation = %generation, "encoder reached end of source");
            return;
        }

        self.store
            .finish_generation(generation, GenerationStatus::Failed);
        let mut failure = outcome.failure.unwrap_or(EncoderFailure::Generic {
            exit_code: outcome.code,
            detail: "encoder exited unsuccessfully".into(),
        });

        let never_encoded = matches!(
            *self.phase.read(),
            SessionState::Starting | SessionState::SeekPending
        );
        if never_encoded && !self.store.has_output(generation) {
            drop(control);
            self.fail(SessionFailure::LaunchFailed(failure)).await;
            return;
        }

        if control.crash_restarts < self.deps.settings.crash_restart_limit {
            control.crash_restarts += 1;
            let resume = match self.store.last_ready(generation) {
                Some(index) => index + 1,
                None => self
                    .store
                    .generation(generation)
                    .map_or(0, |g| g.start_index),
            };
            tracing::warn!(
                session = %self.id.short(),
                generation = %generation,
                %failure,
                resume,
                "encoder crashed; restarting"
            );
            self.deps.events.broadcast(EventPayload::EncoderCrashed {
                session_id: self.id,
                generation: generation.as_u32(),
                failure: failure.clone(),
                restarting: true,
            });
            if resume >= self.manifest.len() {
                return;
            }
            match self
                .launch_generation(&mut control, self.manifest.start_of(resume))
                .await
            {
                Ok(_) => return,
                Err(e) => failure = launch_failure(&e),
            }
        }

        self.deps.events.broadcast(EventPayload::EncoderCrashed {
            session_id: self.id,
            generation: generation.as_u32(),
            failure: failure.clone(),
            restarting: false,
        });
        drop(control);
        self.fail(SessionFailure::Crashed(failure)).await;
    }

    async fn fail(&self, failure: SessionFailure) {
        tracing::error!(session = %self.id.short(), key = %self.key, error = %failure.to_error(), "session failed");
        *self.failure.lock() = Some(failure);
        self.terminate(TerminationReason::Failed).await;
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Make `target_secs` playable as soon as possible.
    ///
    /// Reuses existing output when the target is ready or within the
    /// running encoder's reach; otherwise starts a new generation there.
    pub async fn request_seek(self: &Arc<Self>, target_secs: f64) -> Result<SeekOutcome> {
        if !target_secs.is_finite() || target_secs < 0.0 {
            return Err(Error::Validation(format!(
                "seek offset must be a non-negative number, got {target_secs}"
            )));
        }
        self.touch();
        if let Some(err) = self.failure() {
            return Err(err);
        }

        let target_secs = target_secs.min(self.manifest.total_duration_secs());
        let index = self.manifest.index_for_offset(target_secs);

        let mut control = self.control.lock().await;
        if self.is_terminating() {
            return Err(self
                .failure()
                .unwrap_or_else(|| Error::Conflict(format!("session {} is shutting down", self.id))));
        }

        let window = self.deps.settings.seek_window_segments;
        if self.store.covers(index, window) {
            tracing::debug!(session = %self.id.short(), target_secs, index, "seek served by existing output");
            self.deps.events.broadcast(EventPayload::SeekReused {
                session_id: self.id,
                offset_secs: target_secs,
                index,
            });
            return Ok(SeekOutcome::Reused { index });
        }

        {
            let mut phase = self.phase.write();
            self.store.supersede_active();
            *phase = SessionState::SeekPending;
        }
        if let Some(old) = control.encoder.take() {
            old.handle.kill().await;
        }
        control.crash_restarts = 0;

        match self.launch_generation(&mut control, target_secs).await {
            Ok(generation) => Ok(SeekOutcome::Restarted {
                generation: generation.id,
                start_index: generation.start_index,
            }),
            Err(e) => {
                drop(control);
                let failure = launch_failure(&e);
                self.fail(SessionFailure::LaunchFailed(failure.clone()))
                    .await;
                Err(Error::EncoderLaunchFailed { failure })
            }
        }
    }

    /// Fetch timeline segment `index`, waiting up to the configured bound.
    ///
    /// With `auto_seek`, a segment the running encoder will not reach soon
    /// triggers a seek to it; without, such requests fail with
    /// [`Error::NeverWillExist`].
    pub async fn segment(self: &Arc<Self>, index: u64, auto_seek: bool) -> Result<ReadableSegment> {
        if !self.manifest.contains(index) {
            return Err(Error::not_found("segment", index));
        }
        self.touch();
        if let Some(err) = self.failure() {
            return Err(err);
        }

        let window = self.deps.settings.seek_window_segments;
        match self.store.get(index) {
            SegmentLookup::Ready(segment) => return Ok(segment),
            SegmentLookup::NotYetAvailable => {
                if auto_seek && !self.store.covers(index, window) {
                    self.request_seek(self.manifest.start_of(index)).await?;
                }
            }
            SegmentLookup::NeverWillExist => {
                if !auto_seek {
                    return Err(Error::NeverWillExist { index });
                }
                self.request_seek(self.manifest.start_of(index)).await?;
            }
        }

        let deadline = tokio::time::Instant::now() + self.deps.settings.segment_wait();
        match self.store.wait_for(index, deadline).await {
            SegmentLookup::Ready(segment) => Ok(segment),
            SegmentLookup::NotYetAvailable => {
                Err(self.failure().unwrap_or(Error::NotYetAvailable { index }))
            }
            SegmentLookup::NeverWillExist => {
                if let Some(err) = self.failure() {
                    Err(err)
                } else if self.is_terminating() {
                    Err(Error::NotYetAvailable { index })
                } else {
                    Err(Error::NeverWillExist { index })
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Stop the encoder, delete the work directory and mark the session
    /// terminated. Concurrent and repeated calls all wait for the one
    /// teardown; the first caller's reason is the one recorded.
    pub async fn terminate(&self, reason: TerminationReason) {
        self.teardown
            .get_or_init(|| self.teardown_once(reason))
            .await;
    }

    async fn teardown_once(&self, reason: TerminationReason) {
        self.terminating.store(true, Ordering::Release);
        {
            let mut phase = self.phase.write();
            *phase = SessionState::Terminating;
            self.store.close();
        }

        let encoder = self.control.lock().await.encoder.take();
        if let Some(active) = encoder {
            active.handle.kill().await;
        }
        *self.encoder_pid.lock() = None;

        match tokio::fs::remove_dir_all(&self.work_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(dir = %self.work_dir.display(), error = %e, "failed to remove work dir")
            }
        }

        *self.phase.write() = SessionState::Terminated;
        tracing::info!(session = %self.id.short(), key = %self.key, ?reason, "session terminated");
        self.deps.events.broadcast(EventPayload::SessionTerminated {
            session_id: self.id,
            key: self.key.clone(),
            reason,
        });
    }
}

/// Forward one generation's encoder events into the session.
///
/// Boxed because a crash restart spawns the next generation's pump from
/// inside this one.
fn pump(
    session: Weak<TranscodeSession>,
    generation: GenerationId,
    mut events: mpsc::UnboundedReceiver<EncoderEvent>,
) -> BoxFuture<'static, ()> {
    async move {
        while let Some(event) = events.recv().await {
            let Some(session) = session.upgrade() else {
                return;
            };
            match event {
                EncoderEvent::SegmentStarted { local_index, path } => {
                    session
                        .on_segment_started(generation, local_index, path)
                        .await;
                }
                EncoderEvent::Exited(outcome) => {
                    session.on_exit(generation, outcome).await;
                    return;
                }
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playlist_uris_are_relative() {
        assert_eq!(segment_uri(0), "segment/0.ts");
        assert_eq!(segment_uri(48), "segment/48.ts");
    }

    #[test]
    fn seek_outcome_is_tagged_by_action() {
        let json = serde_json::to_value(SeekOutcome::Reused { index: 3 }).unwrap();
        assert_eq!(json, serde_json::json!({ "action": "reused", "index": 3 }));
    }

    #[test]
    fn failures_map_to_errors() {
        let launch = SessionFailure::LaunchFailed(EncoderFailure::DiskFull);
        assert!(matches!(launch.to_error(), Error::EncoderLaunchFailed { .. }));

        let crashed = SessionFailure::Crashed(EncoderFailure::Killed { signal: Some(9) });
        assert!(matches!(crashed.to_error(), Error::EncoderCrashed { .. }));
    }

    #[test]
    fn launch_failure_passes_classification_through() {
        let err = Error::EncoderLaunchFailed {
            failure: EncoderFailure::MissingBinary {
                detail: "ffmpeg".into(),
            },
        };
        assert!(matches!(
            launch_failure(&err),
            EncoderFailure::MissingBinary { .. }
        ));
        assert!(matches!(
            launch_failure(&Error::Internal("x".into())),
            EncoderFailure::Generic { .. }
        ));
    }
}
