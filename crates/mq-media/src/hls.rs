//! HLS playlist types and M3U8 rendering.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stream variant in a master playlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    /// Peak bandwidth in bits per second.
    pub bandwidth: u64,
    /// Codec string (e.g. "avc1.640028,mp4a.40.2").
    pub codecs: String,
    /// Display name for player quality menus.
    pub name: Option<String>,
    /// URI of the media playlist for this variant.
    pub uri: String,
}

/// A master playlist listing one variant per quality.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterPlaylist {
    pub variants: Vec<Variant>,
}

/// A single entry in a media playlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistSegment {
    /// Segment duration in seconds.
    pub duration: f64,
    pub uri: String,
}

/// An HLS media playlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPlaylist {
    /// Longest segment duration rounded to whole seconds.
    pub target_duration: u32,
    /// Sequence number of the first segment.
    pub media_sequence: u64,
    /// Emit `#EXT-X-PLAYLIST-TYPE:VOD`.
    pub vod: bool,
    pub segments: Vec<PlaylistSegment>,
    /// Emit `#EXT-X-ENDLIST`.
    pub ended: bool,
}

impl fmt::Display for MasterPlaylist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "#EXTM3U")?;
        for variant in &self.variants {
            write!(f, "#EXT-X-STREAM-INF:BANDWIDTH={}", variant.bandwidth)?;
            if !variant.codecs.is_empty() {
                write!(f, ",CODECS=\"{}\"", variant.codecs)?;
            }
            if let Some(ref name) = variant.name {
                write!(f, ",NAME=\"{name}\"")?;
            }
            writeln!(f)?;
            writeln!(f, "{}", variant.uri)?;
        }
        Ok(())
    }
}

/// Renders MPEG-TS flavoured M3U8 (version 3, no `#EXT-X-MAP`).
impl fmt::Display for MediaPlaylist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "#EXTM3U")?;
        writeln!(f, "#EXT-X-VERSION:3")?;
        writeln!(f, "#EXT-X-TARGETDURATION:{}", self.target_duration)?;
        writeln!(f, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence)?;
        if self.vod {
            writeln!(f, "#EXT-X-PLAYLIST-TYPE:VOD")?;
        }
        for segment in &self.segments {
            writeln!(f, "#EXTINF:{:.6},", segment.duration)?;
            writeln!(f, "{}", segment.uri)?;
        }
        if self.ended {
            writeln!(f, "#EXT-X-ENDLIST")?;
        }
        Ok(())
    }
}
