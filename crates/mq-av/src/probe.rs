//! Source duration probing via `ffprobe`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::command::ToolCommand;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Container duration of `source` in seconds.
pub async fn probe_duration(ffprobe: &Path, source: &Path) -> mq_core::Result<f64> {
    let output = ToolCommand::new(ffprobe)
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
        .arg(source.to_string_lossy())
        .timeout(PROBE_TIMEOUT)
        .execute()
        .await?;

    parse_duration_json(&output.stdout)
}

/// Extract `format.duration` from ffprobe JSON output.
pub fn parse_duration_json(json: &str) -> mq_core::Result<f64> {
    let parsed: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| mq_core::Error::tool("ffprobe", format!("unparseable output: {e}")))?;

    let raw = parsed
        .format
        .and_then(|f| f.duration)
        .ok_or_else(|| mq_core::Error::tool("ffprobe", "no duration in format section"))?;

    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| mq_core::Error::tool("ffprobe", format!("bad duration '{raw}'")))?;

    if !secs.is_finite() || secs <= 0.0 {
        return Err(mq_core::Error::tool(
            "ffprobe",
            format!("non-positive duration {secs}"),
        ));
    }
    Ok(secs)
}
