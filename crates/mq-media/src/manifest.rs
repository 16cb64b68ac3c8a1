//! Full-duration manifest synthesis.
//!
//! The manifest is computed from the source duration alone, before any
//! segment exists, so the player's seek bar spans the whole title on the
//! first response. It never changes afterwards; only the readiness of the
//! segments it references does.

use mq_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::hls::{MediaPlaylist, PlaylistSegment};

/// Tolerance for float noise in probed durations (e.g. `300.0000001`), so
/// such sources do not grow a microscopic trailing segment.
const EPSILON: f64 = 1e-6;

/// One timeline slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub index: u64,
    pub start_secs: f64,
    pub duration_secs: f64,
}

impl ManifestEntry {
    pub fn end_secs(&self) -> f64 {
        self.start_secs + self.duration_secs
    }
}

/// Immutable list of timeline segments for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    total_duration_secs: f64,
    segment_duration_secs: f64,
    entries: Vec<ManifestEntry>,
}

/// Number of segments needed to cover `total` seconds.
pub fn segment_count(total: f64, segment: f64) -> u64 {
    ((total / segment) - EPSILON).ceil().max(1.0) as u64
}

impl Manifest {
    /// Build the manifest for a source of `total_duration_secs`.
    ///
    /// Every entry lasts `segment_duration_secs` except the last, which
    /// covers only the remainder.
    pub fn synthesize(total_duration_secs: f64, segment_duration_secs: f64) -> Result<Self> {
        if !total_duration_secs.is_finite() || total_duration_secs <= 0.0 {
            return Err(Error::Validation(format!(
                "total duration must be positive, got {total_duration_secs}"
            )));
        }
        if !segment_duration_secs.is_finite() || segment_duration_secs <= 0.0 {
            return Err(Error::Validation(format!(
                "segment duration must be positive, got {segment_duration_secs}"
            )));
        }

        let count = segment_count(total_duration_secs, segment_duration_secs);
        let entries = (0..count)
            .map(|index| {
                let start_secs = index as f64 * segment_duration_secs;
                let duration_secs = if index + 1 == count {
                    total_duration_secs - start_secs
                } else {
                    segment_duration_secs
                };
                ManifestEntry {
                    index,
                    start_secs,
                    duration_secs,
                }
            })
            .collect();

        Ok(Self {
            total_duration_secs,
            segment_duration_secs,
            entries,
        })
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_duration_secs(&self) -> f64 {
        self.total_duration_secs
    }

    pub fn segment_duration_secs(&self) -> f64 {
        self.segment_duration_secs
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn entry(&self, index: u64) -> Option<&ManifestEntry> {
        self.entries.get(usize::try_from(index).ok()?)
    }

    pub fn contains(&self, index: u64) -> bool {
        index < self.len()
    }

    /// Timeline index of the segment containing `offset_secs`.
    ///
    /// Offsets past the end resolve to the last segment; negative offsets to
    /// the first.
    pub fn index_for_offset(&self, offset_secs: f64) -> u64 {
        let last = self.len().saturating_sub(1);
        if offset_secs.is_nan() || offset_secs <= 0.0 {
            return 0;
        }
        let raw = (offset_secs / self.segment_duration_secs + EPSILON).floor();
        (raw as u64).min(last)
    }

    /// Nominal start of a timeline segment.
    pub fn start_of(&self, index: u64) -> f64 {
        index as f64 * self.segment_duration_secs
    }

    /// Render as a VOD media playlist; `uri` names each segment.
    pub fn to_playlist(&self, uri: impl Fn(u64) -> String) -> MediaPlaylist {
        let longest = self
            .entries
            .iter()
            .map(|e| e.duration_secs)
            .fold(self.segment_duration_secs, f64::max);

        MediaPlaylist {
            target_duration: longest.round().max(1.0) as u32,
            media_sequence: 0,
            vod: true,
            segments: self
                .entries
                .iter()
                .map(|e| PlaylistSegment {
                    duration: e.duration_secs,
                    uri: uri(e.index),
                })
                .collect(),
            ended: true,
        }
    }
}
