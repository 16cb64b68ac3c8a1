//! mq-media: playlist synthesis and timeline bookkeeping.
//!
//! - [`manifest`] computes the full-duration segment list for a source.
//! - [`hls`] renders master and media playlists as M3U8.
//! - [`timeline`] maps encoder-local segment numbers onto the timeline.

pub mod hls;
pub mod manifest;
pub mod timeline;

pub use hls::{MasterPlaylist, MediaPlaylist, PlaylistSegment, Variant};
pub use manifest::{Manifest, ManifestEntry};
pub use timeline::{Generation, GenerationId, TimelineMapper};
