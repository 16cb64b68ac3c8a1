//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries the
//! server, tool, library and transcode sections plus the list of quality
//! profiles. Every section defaults sensibly so an empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::ids::QualityId;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub tools: ToolsConfig,
    pub library: LibraryConfig,
    pub transcode: TranscodeConfig,
    pub qualities: Vec<QualityProfile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tools: ToolsConfig::default(),
            library: LibraryConfig::default(),
            transcode: TranscodeConfig::default(),
            qualities: QualityProfile::defaults(),
        }
    }
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Look up a quality profile by id.
    pub fn quality(&self, id: &QualityId) -> Option<&QualityProfile> {
        self.qualities.iter().find(|q| &q.id == id)
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }

        let t = &self.transcode;
        if t.segment_duration_secs == 0 {
            warnings.push("transcode.segment_duration_secs is 0; using 1".into());
        }
        if t.idle_timeout_secs < t.sweep_interval_secs {
            warnings.push(format!(
                "transcode.idle_timeout_secs ({}) is shorter than sweep_interval_secs ({}); \
                 idle sessions will linger up to one sweep interval",
                t.idle_timeout_secs, t.sweep_interval_secs
            ));
        }
        if t.segment_wait_secs == 0 {
            warnings.push(
                "transcode.segment_wait_secs is 0; segment requests never wait for the encoder"
                    .into(),
            );
        }

        if let Some(ref hw) = t.hw_accel {
            let valid = ["none", "videotoolbox", "nvenc", "vaapi", "qsv"];
            if !valid.contains(&hw.as_str()) {
                warnings.push(format!(
                    "transcode.hw_accel '{}' is not a recognized method (valid: {})",
                    hw,
                    valid.join(", ")
                ));
            }
        }

        if self.qualities.is_empty() {
            warnings.push("no quality profiles configured; every stream request will 404".into());
        }
        let mut seen = HashSet::new();
        for (i, q) in self.qualities.iter().enumerate() {
            if !seen.insert(q.id.clone()) {
                warnings.push(format!("qualities[{i}].id '{}' is duplicated", q.id));
            }
            if q.video_bitrate_kbps == 0 {
                warnings.push(format!("qualities[{i}].video_bitrate_kbps is 0"));
            }
        }

        if !self.library.media_root.exists() {
            warnings.push(format!(
                "library.media_root {} does not exist",
                self.library.media_root.display()
            ));
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8090,
        }
    }
}

/// External tool path overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

/// Where source media lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub media_root: PathBuf,
    /// File extensions (lowercase, no dot) considered playable.
    pub extensions: Vec<String>,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            media_root: PathBuf::from("/media"),
            extensions: ["mkv", "mp4", "m4v", "avi", "mov", "webm", "ts", "wmv"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Session, encoder and segment-serving tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Root directory for per-session work directories.
    pub work_dir: PathBuf,
    /// Fixed HLS segment length.
    pub segment_duration_secs: u32,
    /// Sessions with no request for this long are evicted.
    pub idle_timeout_secs: u64,
    /// Period of the idle sweeper.
    pub sweep_interval_secs: u64,
    /// Upper bound on how long one segment request waits for the encoder.
    pub segment_wait_secs: u64,
    /// How many segments past the encoder's frontier still count as
    /// "covered" when deciding whether a seek needs a new generation.
    pub seek_window_segments: u64,
    /// Whether segment requests the running encoder will never reach trigger
    /// a seek instead of a 409.
    pub auto_seek: bool,
    /// Grace period between SIGTERM and SIGKILL.
    pub shutdown_grace_secs: u64,
    /// Automatic restarts after an encoder crash before the session fails.
    pub crash_restart_limit: u32,
    /// Hardware acceleration method (videotoolbox, nvenc, vaapi, qsv).
    pub hw_accel: Option<String>,
    /// x264 preset for software encodes.
    pub video_preset: String,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("marquee"),
            segment_duration_secs: 6,
            idle_timeout_secs: 90,
            sweep_interval_secs: 15,
            segment_wait_secs: 10,
            seek_window_segments: 5,
            auto_seek: true,
            shutdown_grace_secs: 5,
            crash_restart_limit: 1,
            hw_accel: None,
            video_preset: "veryfast".into(),
        }
    }
}

impl TranscodeConfig {
    /// Segment length as seconds, never below one.
    pub fn segment_secs(&self) -> f64 {
        f64::from(self.segment_duration_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn segment_wait(&self) -> Duration {
        Duration::from_secs(self.segment_wait_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Encoder target parameters for one selectable quality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityProfile {
    pub id: QualityId,
    /// Output height ceiling; sources smaller than this are not upscaled.
    pub max_height: u32,
    pub video_bitrate_kbps: u32,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate_kbps: u32,
}

fn default_audio_bitrate() -> u32 {
    128
}

impl QualityProfile {
    fn preset(id: &str, max_height: u32, video_bitrate_kbps: u32) -> Option<Self> {
        Some(Self {
            id: QualityId::parse(id).ok()?,
            max_height,
            video_bitrate_kbps,
            audio_bitrate_kbps: default_audio_bitrate(),
        })
    }

    /// The built-in ladder used when the config file lists none.
    pub fn defaults() -> Vec<Self> {
        [
            Self::preset("1080p", 1080, 8000),
            Self::preset("720p", 720, 4000),
            Self::preset("480p", 480, 1500),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let cfg = Config::from_json("{}").unwrap();
        assert_eq!(cfg.server.port, 8090);
        assert_eq!(cfg.transcode.segment_duration_secs, 6);
        assert_eq!(cfg.transcode.idle_timeout_secs, 90);
        assert_eq!(cfg.transcode.sweep_interval_secs, 15);
        assert_eq!(cfg.transcode.segment_wait_secs, 10);
        assert_eq!(cfg.transcode.crash_restart_limit, 1);
        assert_eq!(cfg.qualities.len(), 3);
    }

    #[test]
    fn partial_transcode_section() {
        let cfg = Config::from_json(
            r#"{"transcode": {"segment_duration_secs": 4, "seek_window_segments": 10}}"#,
        )
        .unwrap();
        assert_eq!(cfg.transcode.segment_duration_secs, 4);
        assert_eq!(cfg.transcode.seek_window_segments, 10);
        assert_eq!(cfg.transcode.idle_timeout_secs, 90);
    }

    #[test]
    fn qualities_override_the_ladder() {
        let cfg = Config::from_json(
            r#"{"qualities": [{"id": "360p", "max_height": 360, "video_bitrate_kbps": 800}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.qualities.len(), 1);
        assert_eq!(cfg.qualities[0].audio_bitrate_kbps, 128);
        let id = QualityId::parse("360p").unwrap();
        assert_eq!(cfg.quality(&id).unwrap().max_height, 360);
        assert!(cfg.quality(&QualityId::parse("1080p").unwrap()).is_none());
    }

    #[test]
    fn invalid_quality_id_is_a_parse_error() {
        let result = Config::from_json(
            r#"{"qualities": [{"id": "../x", "max_height": 360, "video_bitrate_kbps": 800}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let cfg = Config::load_or_default(Some(Path::new("/definitely/not/here.json")));
        assert_eq!(cfg.transcode.segment_duration_secs, 6);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marquee.json");
        std::fs::write(&path, r#"{"server": {"port": 9000}}"#).unwrap();
        let cfg = Config::load_or_default(Some(&path));
        assert_eq!(cfg.server.port, 9000);
    }

    #[test]
    fn validate_flags_problems() {
        let mut cfg = Config::default();
        cfg.transcode.hw_accel = Some("magic".into());
        cfg.transcode.idle_timeout_secs = 5;
        cfg.qualities.push(cfg.qualities[0].clone());
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.contains("hw_accel")));
        assert!(warnings.iter().any(|w| w.contains("idle_timeout_secs")));
        assert!(warnings.iter().any(|w| w.contains("duplicated")));
    }

    #[test]
    fn segment_secs_never_zero() {
        let mut t = TranscodeConfig::default();
        t.segment_duration_secs = 0;
        assert_eq!(t.segment_secs(), 1.0);
    }
}
