//! Mapping between encoder-local segment numbers and timeline indices.
//!
//! Every encoder run (a *generation*) numbers its segments from zero no
//! matter where in the source it started. The mapper keeps an append-only
//! arena of generations, each with a fixed affine mapping
//! `timeline = start_index + local`, and answers "which generation could
//! hold timeline index N" newest first. It performs no I/O.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// ffmpeg `-hls_segment_filename` pattern used inside a generation directory.
pub const SEGMENT_FILE_PATTERN: &str = "seg%05d.ts";

/// Same tolerance as manifest synthesis, so both agree on index boundaries.
const EPSILON: f64 = 1e-6;

/// Monotonically increasing generation counter within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(u32);

impl GenerationId {
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Directory the generation writes into, relative to the session root.
    pub fn dir_name(self) -> String {
        format!("g{:04}", self.0)
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File name ffmpeg gives local segment `local` under [`SEGMENT_FILE_PATTERN`].
pub fn segment_file_name(local: u64) -> String {
    format!("seg{local:05}.ts")
}

/// One encoder run. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub id: GenerationId,
    /// Position the generation was requested at.
    pub offset_secs: f64,
    /// Timeline index of the generation's local segment 0.
    pub start_index: u64,
}

impl Generation {
    pub fn timeline_index(&self, local: u64) -> u64 {
        self.start_index + local
    }

    /// Local index of `timeline` in this generation, if it starts at or
    /// before it.
    pub fn local_index(&self, timeline: u64) -> Option<u64> {
        timeline.checked_sub(self.start_index)
    }

    pub fn relative_path(&self, local: u64) -> PathBuf {
        PathBuf::from(self.id.dir_name()).join(segment_file_name(local))
    }
}

/// Append-only arena of generations for one session.
#[derive(Debug, Clone)]
pub struct TimelineMapper {
    segment_duration_secs: f64,
    generations: Vec<Generation>,
}

impl TimelineMapper {
    pub fn new(segment_duration_secs: f64) -> Self {
        Self {
            segment_duration_secs,
            generations: Vec::new(),
        }
    }

    /// Register a generation requested at `offset_secs`.
    ///
    /// Its mapping starts at the segment boundary containing the offset.
    pub fn begin(&mut self, offset_secs: f64) -> Generation {
        let offset_secs = offset_secs.max(0.0);
        let start_index = (offset_secs / self.segment_duration_secs + EPSILON).floor() as u64;
        let generation = Generation {
            id: GenerationId(self.generations.len() as u32),
            offset_secs,
            start_index,
        };
        self.generations.push(generation);
        generation
    }

    pub fn generation(&self, id: GenerationId) -> Option<&Generation> {
        self.generations.get(id.0 as usize)
    }

    pub fn latest(&self) -> Option<&Generation> {
        self.generations.last()
    }

    pub fn generations(&self) -> &[Generation] {
        &self.generations
    }

    pub fn len(&self) -> usize {
        self.generations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    /// Every generation that could hold `timeline`, newest first, with the
    /// local index it would have there.
    pub fn candidates(&self, timeline: u64) -> impl Iterator<Item = (&Generation, u64)> + '_ {
        self.generations
            .iter()
            .rev()
            .filter_map(move |g| g.local_index(timeline).map(|local| (g, local)))
    }

    /// First candidate (newest first) for which `produced` holds.
    pub fn resolve(
        &self,
        timeline: u64,
        mut produced: impl FnMut(GenerationId, u64) -> bool,
    ) -> Option<(GenerationId, u64)> {
        self.candidates(timeline)
            .find(|(g, local)| produced(g.id, *local))
            .map(|(g, local)| (g.id, local))
    }
}
