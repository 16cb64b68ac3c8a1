//! Process-wide table of live transcoding sessions.
//!
//! At most one session exists per (content, quality). Concurrent requests
//! for a missing session are coalesced: one caller creates it while the
//! others wait on a [`Notify`] and then pick up the result.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mq_av::ProcessSupervisor;
use mq_core::config::{QualityProfile, TranscodeConfig};
use mq_core::events::{EventBus, TerminationReason};
use mq_core::{ContentId, Error, QualityId, Result, SessionId, SessionKey};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::session::{SeekOutcome, SessionDeps, SessionSnapshot, TranscodeSession};
use crate::source::{SourceMedia, SourceResolver};
use crate::store::ReadableSegment;

pub struct SessionRegistry {
    sessions: DashMap<SessionKey, Arc<TranscodeSession>>,
    loading: DashMap<SessionKey, Arc<Notify>>,
    resolver: Arc<dyn SourceResolver>,
    qualities: Vec<QualityProfile>,
    deps: SessionDeps,
}

/// Clears the loading entry and wakes waiters however creation ends.
struct LoadingGuard<'a> {
    loading: &'a DashMap<SessionKey, Arc<Notify>>,
    key: &'a SessionKey,
    notify: Arc<Notify>,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.loading
            .remove_if(self.key, |_, n| Arc::ptr_eq(n, &self.notify));
        self.notify.notify_waiters();
    }
}

/// Whether a directory name has the `{content}_{quality}_{short id}` shape
/// of a session work directory.
fn is_session_dir_name(name: &str) -> bool {
    match name.rsplit_once('_') {
        Some((rest, suffix)) => {
            rest.contains('_')
                && suffix.len() == 8
                && suffix.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

impl SessionRegistry {
    pub fn new(
        settings: TranscodeConfig,
        qualities: Vec<QualityProfile>,
        resolver: Arc<dyn SourceResolver>,
        supervisor: Arc<ProcessSupervisor>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            loading: DashMap::new(),
            resolver,
            qualities,
            deps: SessionDeps {
                supervisor,
                events,
                settings: Arc::new(settings),
            },
        }
    }

    pub fn settings(&self) -> &TranscodeConfig {
        &self.deps.settings
    }

    pub fn qualities(&self) -> &[QualityProfile] {
        &self.qualities
    }

    pub fn quality(&self, id: &QualityId) -> Result<&QualityProfile> {
        self.qualities
            .iter()
            .find(|q| &q.id == id)
            .ok_or_else(|| Error::not_found("quality", id))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Resolve a content id without creating a session.
    pub async fn source(&self, content: &ContentId) -> Result<SourceMedia> {
        self.resolver.resolve(content).await
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<TranscodeSession>> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    /// Remove stale session directories left by a previous process and make
    /// sure the work root exists. Returns how many directories were removed.
    pub async fn prepare_work_root(&self) -> Result<usize> {
        let root: &Path = &self.deps.settings.work_dir;
        tokio::fs::create_dir_all(root).await?;

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let is_stale = entry.file_type().await?.is_dir()
                && name.to_str().is_some_and(is_session_dir_name);
            if is_stale {
                tokio::fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(root = %root.display(), removed, "removed stale session directories");
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Lookup and creation
    // -----------------------------------------------------------------------

    /// Return the live session for `key`, creating it if needed.
    ///
    /// A session that failed reports its error to exactly one caller and is
    /// then dropped, so the next call starts fresh.
    pub async fn get_or_create(&self, key: &SessionKey) -> Result<Arc<TranscodeSession>> {
        loop {
            if let Some(session) = self.live(key).await? {
                return Ok(session);
            }

            let notify = match self.loading.entry(key.clone()) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    let notify = Arc::new(Notify::new());
                    entry.insert(notify.clone());
                    let _guard = LoadingGuard {
                        loading: &self.loading,
                        key,
                        notify,
                    };

                    // Someone may have finished creating it since `live`.
                    if let Some(session) = self.live(key).await? {
                        return Ok(session);
                    }
                    let session = self.create(key).await?;
                    self.sessions.insert(key.clone(), session.clone());
                    return Ok(session);
                }
            };

            // Another task is creating it; wait, then look again.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let still_loading = self
                .loading
                .get(key)
                .is_some_and(|n| Arc::ptr_eq(n.value(), &notify));
            if still_loading {
                notified.await;
            }
        }
    }

    /// The usable session for `key`, evicting a failed or dying one.
    async fn live(&self, key: &SessionKey) -> Result<Option<Arc<TranscodeSession>>> {
        let Some(session) = self.get(key) else {
            return Ok(None);
        };

        if let Some(err) = session.failure() {
            if self.evict(key, &session) {
                return Err(err);
            }
            return Ok(None);
        }

        if session.is_terminating() {
            // Let the old teardown finish before a replacement starts.
            session.terminate(TerminationReason::Stopped).await;
            self.evict(key, &session);
            return Ok(None);
        }

        session.touch();
        Ok(Some(session))
    }

    fn evict(&self, key: &SessionKey, session: &Arc<TranscodeSession>) -> bool {
        self.sessions
            .remove_if(key, |_, s| Arc::ptr_eq(s, session))
            .is_some()
    }

    async fn create(&self, key: &SessionKey) -> Result<Arc<TranscodeSession>> {
        let quality = self.quality(&key.quality)?.clone();
        let source = self
            .resolver
            .resolve(&key.content)
            .await
            .map_err(|e| match e {
                Error::NotFound { .. } | Error::SourceUnavailable { .. } => e,
                other => Error::source_unavailable(&key.content, other.to_string()),
            })?;

        let id = SessionId::new();
        let work_dir = self
            .deps
            .settings
            .work_dir
            .join(format!("{}_{}_{}", key.content, key.quality, id.short()));

        TranscodeSession::start(id, key.clone(), source, quality, work_dir, self.deps.clone()).await
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Seek the session for `key`, creating it if needed.
    pub async fn request_seek(
        &self,
        key: &SessionKey,
        target_secs: f64,
    ) -> Result<(Arc<TranscodeSession>, SeekOutcome)> {
        let mut retried = false;
        loop {
            let session = self.get_or_create(key).await?;
            match session.request_seek(target_secs).await {
                Ok(outcome) => return Ok((session, outcome)),
                Err(e) => {
                    if session.failure().is_some() {
                        self.evict(key, &session);
                        return Err(e);
                    }
                    // Swept while we held it; one retry gets a fresh session.
                    if session.is_terminating() && !retried {
                        retried = true;
                        self.evict(key, &session);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Serve timeline segment `index` of `key`.
    pub async fn fetch_segment(&self, key: &SessionKey, index: u64) -> Result<ReadableSegment> {
        let session = self.get_or_create(key).await?;
        match session.segment(index, self.deps.settings.auto_seek).await {
            Ok(segment) => Ok(segment),
            Err(e) => {
                if session.failure().is_some() {
                    self.evict(key, &session);
                }
                Err(e)
            }
        }
    }

    /// Terminate and remove the session for `key`.
    ///
    /// The teardown runs on its own task, so it completes even if the
    /// caller stops waiting.
    pub async fn stop(&self, key: &SessionKey) -> Result<()> {
        let (_, session) = self
            .sessions
            .remove(key)
            .ok_or_else(|| Error::not_found("session", key))?;
        let teardown = tokio::spawn(async move {
            session.terminate(TerminationReason::Stopped).await;
        });
        teardown
            .await
            .map_err(|e| Error::Internal(format!("session teardown failed: {e}")))
    }

    // -----------------------------------------------------------------------
    // Eviction
    // -----------------------------------------------------------------------

    pub async fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now()).await
    }

    /// Terminate every session idle for at least the idle timeout as of
    /// `now`, plus any that already terminated on their own.
    pub async fn sweep_idle_at(&self, now: Instant) -> usize {
        let idle_timeout = self.deps.settings.idle_timeout();
        let expired: Vec<(SessionKey, Arc<TranscodeSession>)> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                session.idle_for(now) >= idle_timeout
                    || (session.is_terminating() && session.failure().is_none())
            })
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut evicted = 0;
        for (key, session) in expired {
            if self.evict(&key, &session) {
                session.terminate(TerminationReason::Idle).await;
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::info!(evicted, remaining = self.sessions.len(), "idle sessions evicted");
        }
        evicted
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every sweep interval until
    /// `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.deps.settings.sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep_idle().await;
                    }
                    _ = cancel.cancelled() => {
                        tracing::debug!("idle sweeper stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Terminate every session concurrently.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<TranscodeSession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.sessions.clear();
        if sessions.is_empty() {
            return;
        }

        tracing::info!(count = sessions.len(), "shutting down sessions");
        futures::future::join_all(
            sessions
                .iter()
                .map(|s| s.terminate(TerminationReason::Shutdown)),
        )
        .await;
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticResolver;
    use std::time::Duration;

    fn registry(work_dir: &Path) -> SessionRegistry {
        let settings = TranscodeConfig {
            work_dir: work_dir.to_path_buf(),
            ..Default::default()
        };
        let resolver = StaticResolver::new()
            .with("movie", "/media/movie.mkv", 300.0)
            .unwrap();
        SessionRegistry::new(
            settings,
            QualityProfile::defaults(),
            Arc::new(resolver),
            Arc::new(ProcessSupervisor::new("/nonexistent/ffmpeg", Duration::from_secs(1))),
            Arc::new(EventBus::default()),
        )
    }

    #[test]
    fn session_dir_names() {
        assert!(is_session_dir_name("movie_720p_0a1b2c3d"));
        assert!(is_session_dir_name("my_movie_720p_deadbeef"));
        assert!(!is_session_dir_name("movie_0a1b2c3d"));
        assert!(!is_session_dir_name("movie_720p_xyz"));
        assert!(!is_session_dir_name("library"));
    }

    #[tokio::test]
    async fn prepare_work_root_removes_only_session_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("movie_720p_0a1b2c3d/g0000")).unwrap();
        std::fs::create_dir_all(dir.path().join("keep-me")).unwrap();
        std::fs::write(dir.path().join("notes_a_0a1b2c3d"), b"file").unwrap();

        let registry = registry(dir.path());
        assert_eq!(registry.prepare_work_root().await.unwrap(), 1);
        assert!(!dir.path().join("movie_720p_0a1b2c3d").exists());
        assert!(dir.path().join("keep-me").exists());
        assert!(dir.path().join("notes_a_0a1b2c3d").exists());
    }

    #[tokio::test]
    async fn unknown_quality_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let key = SessionKey::parse("movie", "4k").unwrap();
        let err = registry.get_or_create(&key).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { ref entity, .. } if entity == "quality"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unknown_content_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let key = SessionKey::parse("nope", "720p").unwrap();
        let err = registry.get_or_create(&key).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { ref entity, .. } if entity == "content"));
    }

    #[tokio::test]
    async fn launch_failure_leaves_no_session_or_directory() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let key = SessionKey::parse("movie", "720p").unwrap();

        let err = registry.get_or_create(&key).await.unwrap_err();
        assert!(matches!(err, Error::EncoderLaunchFailed { .. }));
        assert!(registry.is_empty());
        assert!(registry.loading.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn stop_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let key = SessionKey::parse("movie", "720p").unwrap();
        assert!(matches!(
            registry.stop(&key).await,
            Err(Error::NotFound { .. })
        ));
    }
}
