//! ffmpeg invocation for one HLS encoder generation.
//!
//! The encoder seeks to a segment boundary, scales to the quality's height
//! ceiling, caps the bitrate and forces a key frame at every segment
//! boundary so its segments line up with the synthesized manifest. Output
//! timestamps are shifted with `-output_ts_offset` so segments from
//! different generations share one timeline.

use std::path::PathBuf;

use mq_core::config::QualityProfile;

/// Name of the encoder's own playlist inside the generation directory.
/// Clients never see it; the session serves its synthesized manifest.
pub const ENCODER_PLAYLIST: &str = "encoder.m3u8";

/// Everything needed to start one encoder generation.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub source: PathBuf,
    /// Input seek position; always a segment boundary.
    pub seek_secs: f64,
    pub segment_duration_secs: u32,
    /// Directory the generation owns. Created by the supervisor.
    pub output_dir: PathBuf,
    /// `-hls_segment_filename` pattern relative to `output_dir`.
    pub segment_pattern: String,
    pub quality: QualityProfile,
    pub hw_accel: Option<String>,
    pub video_preset: String,
}

/// Hardware acceleration input flags, encoder name, and whether the
/// encoder is software (takes `-preset`).
fn resolve_hw_accel(hw_accel: Option<&str>) -> (Vec<&'static str>, &'static str, bool) {
    match hw_accel {
        Some("videotoolbox") => (vec!["-hwaccel", "videotoolbox"], "h264_videotoolbox", false),
        Some("nvenc") => (vec!["-hwaccel", "cuda"], "h264_nvenc", false),
        Some("vaapi") => (
            vec!["-hwaccel", "vaapi", "-hwaccel_output_format", "vaapi"],
            "h264_vaapi",
            false,
        ),
        Some("qsv") => (vec!["-hwaccel", "qsv"], "h264_qsv", false),
        _ => (vec![], "libx264", true),
    }
}

/// Build the full ffmpeg argument list (without the program name).
pub fn build_hls_args(spec: &LaunchSpec) -> Vec<String> {
    let (hwaccel_args, encoder, software) = resolve_hw_accel(spec.hw_accel.as_deref());
    let seg = spec.segment_duration_secs.max(1);
    let q = &spec.quality;

    let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-y", "-loglevel", "info"]
        .into_iter()
        .map(String::from)
        .collect();

    args.extend(hwaccel_args.iter().map(|s| s.to_string()));

    // Input seeking: fast, and lands on the preceding key frame.
    if spec.seek_secs > 0.0 {
        args.push("-ss".into());
        args.push(format!("{:.3}", spec.seek_secs));
    }
    args.push("-i".into());
    args.push(spec.source.to_string_lossy().into_owned());

    args.extend(["-map", "0:v:0", "-map", "0:a:0?"].map(String::from));

    let scale = if spec.hw_accel.as_deref() == Some("vaapi") {
        format!("scale_vaapi=w=-2:h='min({},ih)'", q.max_height)
    } else {
        format!("scale=-2:'min({},ih)'", q.max_height)
    };
    args.push("-vf".into());
    args.push(scale);

    args.push("-c:v".into());
    args.push(encoder.into());
    if software {
        args.extend(["-preset".to_string(), spec.video_preset.clone()]);
        args.extend(["-pix_fmt", "yuv420p", "-sc_threshold", "0"].map(String::from));
    }
    args.extend([
        "-b:v".to_string(),
        format!("{}k", q.video_bitrate_kbps),
        "-maxrate".to_string(),
        format!("{}k", q.video_bitrate_kbps),
        "-bufsize".to_string(),
        format!("{}k", q.video_bitrate_kbps * 2),
    ]);
    args.push("-force_key_frames".into());
    args.push(format!("expr:gte(t,n_forced*{seg})"));

    args.extend([
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        format!("{}k", q.audio_bitrate_kbps),
        "-ac".to_string(),
        "2".to_string(),
    ]);

    args.push("-output_ts_offset".into());
    args.push(format!("{:.3}", spec.seek_secs));

    args.extend(["-f", "hls", "-hls_time"].map(String::from));
    args.push(seg.to_string());
    args.extend(
        [
            "-hls_list_size",
            "0",
            "-hls_segment_type",
            "mpegts",
            "-start_number",
            "0",
            "-hls_segment_filename",
        ]
        .map(String::from),
    );
    args.push(
        spec.output_dir
            .join(&spec.segment_pattern)
            .to_string_lossy()
            .into_owned(),
    );
    args.push(
        spec.output_dir
            .join(ENCODER_PLAYLIST)
            .to_string_lossy()
            .into_owned(),
    );

    args
}
