//! Shared fixtures for session tests.
//!
//! [`FakeEncoder`] installs a small shell script that behaves like ffmpeg
//! from the session's point of view: it reads `-ss` and
//! `-hls_segment_filename` from its arguments, writes one file per segment
//! and prints ffmpeg's `Opening '...' for writing` line for each. It runs as
//! `sh <script>` so no executable bit or exec of a freshly written file is
//! involved.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mq_av::ProcessSupervisor;
use mq_core::config::{QualityProfile, TranscodeConfig};
use mq_core::events::EventBus;
use mq_core::SessionKey;
use mq_transcode::{SessionRegistry, StaticResolver};
use tempfile::TempDir;

const SCRIPT: &str = r#"#!/bin/sh
state="@STATE@"
launch=$(cat "$state/launches" 2>/dev/null || echo 0)
launch=$((launch + 1))
echo "$launch" > "$state/launches"

ss=0
pattern=""
prev=""
for arg in "$@"; do
  case "$prev" in
    -ss) ss="$arg" ;;
    -hls_segment_filename) pattern="$arg" ;;
  esac
  prev="$arg"
done
echo "$ss" >> "$state/seeks"

case " @FAIL@ " in
  *" $launch "*) echo "Conversion failed!" >&2; exit 1 ;;
esac

start=${ss%.*}
count=$(( (@TOTAL@ - start + @SEG@ - 1) / @SEG@ ))
i=0
while [ "$i" -lt "$count" ]; do
  file=$(printf "$pattern" "$i")
  echo "[hls @ 0x1] Opening '$file' for writing" >&2
  printf 'launch %s segment %s\n' "$launch" "$i" > "$file"
  sleep @DELAY@
  i=$((i + 1))
done
exit 0
"#;

pub struct FakeEncoder {
    state: TempDir,
    script: PathBuf,
}

pub struct FakeEncoderBuilder {
    total_secs: u32,
    segment_secs: u32,
    delay: String,
    fail_launches: Vec<u32>,
}

impl FakeEncoderBuilder {
    /// Seconds slept after opening each segment.
    pub fn delay(mut self, secs: &str) -> Self {
        self.delay = secs.to_string();
        self
    }

    /// Make the n-th launch (1-based) exit 1 before producing anything.
    pub fn fail_launch(mut self, n: u32) -> Self {
        self.fail_launches.push(n);
        self
    }

    pub fn install(self) -> FakeEncoder {
        let state = tempfile::tempdir().unwrap();
        let fail = self
            .fail_launches
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        let body = SCRIPT
            .replace("@STATE@", &state.path().to_string_lossy())
            .replace("@FAIL@", &fail)
            .replace("@TOTAL@", &self.total_secs.to_string())
            .replace("@SEG@", &self.segment_secs.to_string())
            .replace("@DELAY@", &self.delay);
        let script = state.path().join("fake-ffmpeg.sh");
        std::fs::write(&script, body).unwrap();
        FakeEncoder { state, script }
    }
}

impl FakeEncoder {
    pub fn builder(total_secs: u32, segment_secs: u32) -> FakeEncoderBuilder {
        FakeEncoderBuilder {
            total_secs,
            segment_secs,
            delay: "0.05".into(),
            fail_launches: Vec::new(),
        }
    }

    pub fn supervisor(&self) -> ProcessSupervisor {
        ProcessSupervisor::new("sh", Duration::from_millis(500))
            .with_leading_args([self.script.to_string_lossy().into_owned()])
    }

    /// How many times the encoder has been started.
    pub fn launches(&self) -> u32 {
        std::fs::read_to_string(self.state.path().join("launches"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// `-ss` value of every launch, in order.
    pub fn seeks(&self) -> Vec<String> {
        std::fs::read_to_string(self.state.path().join("seeks"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

pub fn settings(work_dir: &Path) -> TranscodeConfig {
    TranscodeConfig {
        work_dir: work_dir.to_path_buf(),
        segment_duration_secs: 6,
        idle_timeout_secs: 90,
        segment_wait_secs: 10,
        seek_window_segments: 5,
        auto_seek: true,
        shutdown_grace_secs: 1,
        crash_restart_limit: 1,
        ..Default::default()
    }
}

pub struct Fixture {
    pub work: TempDir,
    pub encoder: FakeEncoder,
    pub events: Arc<EventBus>,
    pub registry: Arc<SessionRegistry>,
}

impl Fixture {
    pub fn new(encoder: FakeEncoder, duration_secs: f64) -> Self {
        Self::with_settings(encoder, duration_secs, |_| {})
    }

    pub fn with_settings(
        encoder: FakeEncoder,
        duration_secs: f64,
        tweak: impl FnOnce(&mut TranscodeConfig),
    ) -> Self {
        let work = tempfile::tempdir().unwrap();
        let mut config = settings(work.path());
        tweak(&mut config);

        let resolver = StaticResolver::new()
            .with("movie", "/media/movie.mkv", duration_secs)
            .unwrap()
            .with("other", "/media/other.mkv", duration_secs)
            .unwrap();
        let events = Arc::new(EventBus::default());
        let registry = Arc::new(SessionRegistry::new(
            config,
            QualityProfile::defaults(),
            Arc::new(resolver),
            Arc::new(encoder.supervisor()),
            events.clone(),
        ));

        Self {
            work,
            encoder,
            events,
            registry,
        }
    }
}

pub fn key(content: &str, quality: &str) -> SessionKey {
    SessionKey::parse(content, quality).unwrap()
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
