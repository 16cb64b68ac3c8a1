//! Per-session segment bookkeeping.
//!
//! The store owns the session's [`TimelineMapper`] and one record per
//! segment an encoder generation has opened. Records only move forward
//! (`Writing` to `Ready`) and only the active generation may add them, so a
//! superseded encoder that is still winding down cannot publish anything.
//! Every mutation bumps a watch counter that [`SegmentStore::wait_for`]
//! sleeps on.

use std::collections::BTreeMap;
use std::path::PathBuf;

use mq_media::timeline::{Generation, GenerationId, TimelineMapper};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    Pending,
    Writing,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    /// Its encoder is (or is about to be) running.
    Active,
    /// Encoder reached end of stream.
    Exhausted,
    /// Replaced by a seek.
    Superseded,
    /// Encoder died.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentRecord {
    pub timeline_index: u64,
    pub local_index: u64,
    pub generation: GenerationId,
    pub state: SegmentState,
    pub path: PathBuf,
    pub byte_size: Option<u64>,
}

/// A complete segment file that can be served.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadableSegment {
    pub timeline_index: u64,
    pub generation: GenerationId,
    pub path: PathBuf,
    pub byte_size: u64,
}

/// Answer to "can timeline segment N be served".
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentLookup {
    Ready(ReadableSegment),
    /// The active generation will produce it.
    NotYetAvailable,
    /// Nothing running will ever produce it.
    NeverWillExist,
}

#[derive(Debug)]
struct GenerationEntry {
    status: GenerationStatus,
    records: BTreeMap<u64, SegmentRecord>,
}

impl GenerationEntry {
    fn frontier_local(&self) -> Option<u64> {
        self.records.keys().next_back().copied()
    }

    fn last_ready_local(&self) -> Option<u64> {
        self.records
            .values()
            .rev()
            .find(|r| r.state == SegmentState::Ready)
            .map(|r| r.local_index)
    }
}

#[derive(Debug)]
struct StoreInner {
    mapper: TimelineMapper,
    generations: Vec<GenerationEntry>,
    closed: bool,
}

impl StoreInner {
    fn entry(&self, id: GenerationId) -> Option<&GenerationEntry> {
        self.generations.get(id.as_u32() as usize)
    }

    fn active(&self) -> Option<(&Generation, &GenerationEntry)> {
        self.mapper
            .generations()
            .iter()
            .zip(&self.generations)
            .rev()
            .find(|(_, e)| e.status == GenerationStatus::Active)
    }

    fn active_entry_mut(&mut self, id: GenerationId) -> Option<&mut GenerationEntry> {
        self.generations
            .get_mut(id.as_u32() as usize)
            .filter(|e| e.status == GenerationStatus::Active)
    }
}

/// Segment records for every generation of one session.
#[derive(Debug)]
pub struct SegmentStore {
    root: PathBuf,
    inner: RwLock<StoreInner>,
    changes: watch::Sender<u64>,
}

impl SegmentStore {
    /// `root` is the session work directory; generation directories live
    /// directly beneath it.
    pub fn new(root: impl Into<PathBuf>, segment_duration_secs: f64) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            root: root.into(),
            inner: RwLock::new(StoreInner {
                mapper: TimelineMapper::new(segment_duration_secs),
                generations: Vec::new(),
                closed: false,
            }),
            changes,
        }
    }

    fn bump(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Start a generation at `offset_secs`, superseding the active one.
    pub fn begin_generation(&self, offset_secs: f64) -> Generation {
        let generation = {
            let mut inner = self.inner.write();
            for entry in &mut inner.generations {
                if entry.status == GenerationStatus::Active {
                    entry.status = GenerationStatus::Superseded;
                }
            }
            let generation = inner.mapper.begin(offset_secs);
            inner.generations.push(GenerationEntry {
                status: GenerationStatus::Active,
                records: BTreeMap::new(),
            });
            generation
        };
        self.bump();
        generation
    }

    /// Mark the active generation superseded. Returns its id.
    pub fn supersede_active(&self) -> Option<GenerationId> {
        let superseded = {
            let mut inner = self.inner.write();
            let id = inner.active().map(|(g, _)| g.id)?;
            if let Some(entry) = inner.active_entry_mut(id) {
                entry.status = GenerationStatus::Superseded;
            }
            id
        };
        self.bump();
        Some(superseded)
    }

    /// Retire an active generation. No-op for generations already retired.
    pub fn finish_generation(&self, id: GenerationId, status: GenerationStatus) {
        {
            let mut inner = self.inner.write();
            if let Some(entry) = inner.active_entry_mut(id) {
                entry.status = status;
            }
        }
        self.bump();
    }

    /// Record that the encoder opened local segment `local`.
    ///
    /// Ignored (returns false) unless the generation is active and `local`
    /// is beyond everything it has produced so far.
    pub fn mark_writing(&self, id: GenerationId, local: u64, path: PathBuf) -> bool {
        let accepted = {
            let mut inner = self.inner.write();
            let Some(generation) = inner.mapper.generation(id).copied() else {
                return false;
            };
            match inner.active_entry_mut(id) {
                Some(entry) if entry.frontier_local().map_or(true, |f| local > f) => {
                    entry.records.insert(
                        local,
                        SegmentRecord {
                            timeline_index: generation.timeline_index(local),
                            local_index: local,
                            generation: id,
                            state: SegmentState::Writing,
                            path,
                            byte_size: None,
                        },
                    );
                    true
                }
                _ => false,
            }
        };
        if accepted {
            self.bump();
        }
        accepted
    }

    /// Record that local segment `local` is complete on disk.
    pub fn mark_ready(&self, id: GenerationId, local: u64, byte_size: u64) -> bool {
        let accepted = {
            let mut inner = self.inner.write();
            match inner
                .active_entry_mut(id)
                .and_then(|entry| entry.records.get_mut(&local))
            {
                Some(record) if record.state == SegmentState::Writing => {
                    record.state = SegmentState::Ready;
                    record.byte_size = Some(byte_size);
                    true
                }
                _ => false,
            }
        };
        if accepted {
            self.bump();
        }
        accepted
    }

    /// Look up a timeline index. Ready segments from any generation win,
    /// newest generation first.
    pub fn get(&self, timeline: u64) -> SegmentLookup {
        let inner = self.inner.read();

        let ready = inner.mapper.resolve(timeline, |id, local| {
            inner
                .entry(id)
                .and_then(|e| e.records.get(&local))
                .is_some_and(|r| r.state == SegmentState::Ready)
        });
        if let Some(record) = ready.and_then(|(id, local)| inner.entry(id)?.records.get(&local)) {
            return SegmentLookup::Ready(ReadableSegment {
                timeline_index: timeline,
                generation: record.generation,
                path: record.path.clone(),
                byte_size: record.byte_size.unwrap_or(0),
            });
        }

        if inner.closed {
            return SegmentLookup::NeverWillExist;
        }
        match inner.active() {
            Some((g, _)) if g.start_index <= timeline => SegmentLookup::NotYetAvailable,
            _ => SegmentLookup::NeverWillExist,
        }
    }

    /// Per-generation state of one local segment.
    pub fn state(&self, id: GenerationId, local: u64) -> SegmentState {
        self.inner
            .read()
            .entry(id)
            .and_then(|e| e.records.get(&local))
            .map_or(SegmentState::Pending, |r| r.state)
    }

    pub fn record(&self, id: GenerationId, local: u64) -> Option<SegmentRecord> {
        self.inner.read().entry(id)?.records.get(&local).cloned()
    }

    pub fn is_ready(&self, timeline: u64) -> bool {
        matches!(self.get(timeline), SegmentLookup::Ready(_))
    }

    /// Whether `timeline` is ready, or the active encoder will reach it
    /// within `window` segments of where it is now.
    pub fn covers(&self, timeline: u64, window: u64) -> bool {
        if self.is_ready(timeline) {
            return true;
        }
        let inner = self.inner.read();
        if inner.closed {
            return false;
        }
        match inner.active() {
            Some((g, entry)) => {
                let frontier = entry
                    .frontier_local()
                    .map_or(g.start_index, |l| g.timeline_index(l));
                g.start_index <= timeline && timeline <= frontier.saturating_add(window)
            }
            None => false,
        }
    }

    pub fn active_generation(&self) -> Option<Generation> {
        self.inner.read().active().map(|(g, _)| *g)
    }

    pub fn latest_generation(&self) -> Option<Generation> {
        self.inner.read().mapper.latest().copied()
    }

    pub fn generation(&self, id: GenerationId) -> Option<Generation> {
        self.inner.read().mapper.generation(id).copied()
    }

    pub fn status(&self, id: GenerationId) -> Option<GenerationStatus> {
        self.inner.read().entry(id).map(|e| e.status)
    }

    pub fn generation_count(&self) -> usize {
        self.inner.read().generations.len()
    }

    /// Highest local index the generation has opened.
    pub fn frontier_local(&self, id: GenerationId) -> Option<u64> {
        self.inner.read().entry(id)?.frontier_local()
    }

    /// Timeline index of the generation's newest opened segment.
    pub fn frontier(&self, id: GenerationId) -> Option<u64> {
        let inner = self.inner.read();
        let local = inner.entry(id)?.frontier_local()?;
        Some(inner.mapper.generation(id)?.timeline_index(local))
    }

    /// Timeline index of the generation's newest complete segment.
    pub fn last_ready(&self, id: GenerationId) -> Option<u64> {
        let inner = self.inner.read();
        let local = inner.entry(id)?.last_ready_local()?;
        Some(inner.mapper.generation(id)?.timeline_index(local))
    }

    pub fn has_output(&self, id: GenerationId) -> bool {
        self.inner
            .read()
            .entry(id)
            .is_some_and(|e| !e.records.is_empty())
    }

    /// Distinct timeline indices with a ready segment.
    pub fn ready_count(&self) -> usize {
        let inner = self.inner.read();
        let mut indices: Vec<u64> = inner
            .generations
            .iter()
            .flat_map(|e| e.records.values())
            .filter(|r| r.state == SegmentState::Ready)
            .map(|r| r.timeline_index)
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices.len()
    }

    /// Absolute path of a local segment in a generation.
    pub fn segment_path(&self, generation: &Generation, local: u64) -> PathBuf {
        self.root.join(generation.relative_path(local))
    }

    /// Stop accepting work; pending waiters see `NeverWillExist` unless the
    /// segment is already ready.
    pub fn close(&self) {
        {
            let mut inner = self.inner.write();
            inner.closed = true;
            for entry in &mut inner.generations {
                if entry.status == GenerationStatus::Active {
                    entry.status = GenerationStatus::Superseded;
                }
            }
        }
        self.bump();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// Wait until `timeline` is no longer `NotYetAvailable` or `deadline`
    /// passes, whichever comes first.
    pub async fn wait_for(&self, timeline: u64, deadline: Instant) -> SegmentLookup {
        let mut changes = self.changes.subscribe();
        loop {
            let lookup = self.get(timeline);
            if lookup != SegmentLookup::NotYetAvailable {
                return lookup;
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => return self.get(timeline),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn store() -> SegmentStore {
        SegmentStore::new("/work/session", 6.0)
    }

    fn produce(store: &SegmentStore, generation: &Generation, locals: std::ops::Range<u64>) {
        for local in locals {
            let path = store.segment_path(generation, local);
            assert!(store.mark_writing(generation.id, local, path));
            assert!(store.mark_ready(generation.id, local, 1000 + local));
        }
    }

    #[test]
    fn fresh_generation_reports_not_yet_available() {
        let store = store();
        store.begin_generation(0.0);
        assert_eq!(store.get(0), SegmentLookup::NotYetAvailable);
        assert_eq!(store.get(49), SegmentLookup::NotYetAvailable);
    }

    #[test]
    fn writing_is_not_readable() {
        let store = store();
        let g = store.begin_generation(0.0);
        store.mark_writing(g.id, 0, store.segment_path(&g, 0));
        assert_eq!(store.state(g.id, 0), SegmentState::Writing);
        assert_eq!(store.get(0), SegmentLookup::NotYetAvailable);

        assert!(store.mark_ready(g.id, 0, 4096));
        match store.get(0) {
            SegmentLookup::Ready(seg) => {
                assert_eq!(seg.path, PathBuf::from("/work/session/g0000/seg00000.ts"));
                assert_eq!(seg.byte_size, 4096);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn records_only_move_forward() {
        let store = store();
        let g = store.begin_generation(0.0);
        produce(&store, &g, 0..3);
        assert!(!store.mark_writing(g.id, 1, store.segment_path(&g, 1)));
        assert!(!store.mark_ready(g.id, 2, 1));
        assert!(!store.mark_ready(g.id, 7, 1));
        assert_eq!(store.state(g.id, 1), SegmentState::Ready);
        assert_eq!(store.frontier(g.id), Some(2));
        assert_eq!(store.last_ready(g.id), Some(2));
    }

    #[test]
    fn superseded_generation_cannot_publish() {
        let store = store();
        let first = store.begin_generation(0.0);
        store.mark_writing(first.id, 0, store.segment_path(&first, 0));

        let second = store.begin_generation(290.0);
        assert_eq!(second.start_index, 48);
        assert_eq!(store.status(first.id), Some(GenerationStatus::Superseded));
        assert!(!store.mark_ready(first.id, 0, 1));
        assert!(!store.mark_writing(first.id, 1, store.segment_path(&first, 1)));
        assert_eq!(store.active_generation().map(|g| g.id), Some(second.id));
    }

    #[test]
    fn segments_before_active_start_never_exist() {
        let store = store();
        let first = store.begin_generation(0.0);
        produce(&store, &first, 0..4);
        store.begin_generation(290.0);

        assert!(store.is_ready(3));
        assert_eq!(store.get(10), SegmentLookup::NeverWillExist);
        assert_eq!(store.get(48), SegmentLookup::NotYetAvailable);
    }

    #[test]
    fn newest_generation_wins_on_overlap() {
        let store = store();
        let first = store.begin_generation(0.0);
        produce(&store, &first, 0..10);
        let second = store.begin_generation(30.0);
        produce(&store, &second, 0..2);

        match store.get(5) {
            SegmentLookup::Ready(seg) => {
                assert_eq!(seg.generation, second.id);
                assert_eq!(seg.path, PathBuf::from("/work/session/g0001/seg00000.ts"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        match store.get(8) {
            SegmentLookup::Ready(seg) => assert_eq!(seg.generation, first.id),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(store.ready_count(), 10);
    }

    #[test]
    fn exhausted_generation_keeps_serving() {
        let store = store();
        let g = store.begin_generation(0.0);
        produce(&store, &g, 0..5);
        store.finish_generation(g.id, GenerationStatus::Exhausted);
        assert!(store.is_ready(4));
        assert_eq!(store.get(5), SegmentLookup::NeverWillExist);
        assert_eq!(store.active_generation(), None);
    }

    #[test]
    fn coverage_window() {
        let store = store();
        let g = store.begin_generation(0.0);
        assert!(store.covers(0, 5));
        assert!(store.covers(5, 5));
        assert!(!store.covers(6, 5));

        produce(&store, &g, 0..10);
        assert!(store.covers(3, 0));
        assert!(store.covers(14, 5));
        assert!(!store.covers(15, 5));
    }

    #[test]
    fn close_ends_pending_lookups() {
        let store = store();
        let g = store.begin_generation(0.0);
        produce(&store, &g, 0..2);
        store.close();
        assert!(store.is_closed());
        assert!(store.is_ready(1));
        assert_eq!(store.get(2), SegmentLookup::NeverWillExist);
        assert!(!store.mark_writing(g.id, 2, store.segment_path(&g, 2)));
    }

    #[tokio::test]
    async fn wait_for_wakes_on_ready() {
        let store = Arc::new(store());
        let g = store.begin_generation(0.0);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .wait_for(1, Instant::now() + Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        produce(&store, &g, 0..2);

        match waiter.await.unwrap() {
            SegmentLookup::Ready(seg) => assert_eq!(seg.timeline_index, 1),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let store = store();
        store.begin_generation(0.0);
        let started = std::time::Instant::now();
        let lookup = store
            .wait_for(3, Instant::now() + Duration::from_millis(50))
            .await;
        assert_eq!(lookup, SegmentLookup::NotYetAvailable);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn wait_for_returns_on_close() {
        let store = Arc::new(store());
        store.begin_generation(0.0);
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .wait_for(0, Instant::now() + Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.close();
        assert_eq!(waiter.await.unwrap(), SegmentLookup::NeverWillExist);
    }
}
