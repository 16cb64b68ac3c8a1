//! Encoder process supervision.
//!
//! [`ProcessSupervisor::launch`] spawns one ffmpeg per generation and hands
//! back an [`EncoderHandle`] plus a stream of [`EncoderEvent`]s. A monitor
//! task owns the child: it turns ffmpeg's `Opening '...segNNNNN.ts' for
//! writing` lines into `SegmentStarted` events, keeps a stderr tail for
//! crash classification, and reports exactly one `Exited` event.
//!
//! Stopping is cooperative first: SIGTERM to the encoder's process group,
//! then SIGKILL once the grace period runs out.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use mq_core::{EncoderFailure, Error, Result};
use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::diagnostics::{classify, classify_spawn_error, StderrTail};
use crate::encoder::{build_hls_args, LaunchSpec};

/// How long to keep reading stderr after the process exits. Orphaned
/// grandchildren can hold the pipe open indefinitely.
const STDERR_DRAIN: Duration = Duration::from_secs(2);

fn segment_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Opening '(?P<path>[^']*?(?P<num>\d+)\.ts)' for writing")
            .unwrap_or_else(|e| panic!("segment regex is valid: {e}"))
    })
}

/// Extract `(local_index, path)` from an ffmpeg stderr line.
pub fn parse_segment_line(line: &str) -> Option<(u64, PathBuf)> {
    let caps = segment_line_regex().captures(line)?;
    let local = caps.name("num")?.as_str().parse().ok()?;
    Some((local, PathBuf::from(caps.name("path")?.as_str())))
}

// ---------------------------------------------------------------------------
// Events and outcomes
// ---------------------------------------------------------------------------

/// How an encoder process ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitOutcome {
    pub success: bool,
    pub code: Option<i32>,
    /// The process was stopped through [`EncoderHandle::kill`].
    pub requested: bool,
    /// Set for unrequested, unsuccessful exits.
    pub failure: Option<EncoderFailure>,
}

impl ExitOutcome {
    fn lost() -> Self {
        Self {
            success: false,
            code: None,
            requested: false,
            failure: Some(EncoderFailure::Generic {
                exit_code: None,
                detail: "encoder monitor went away".into(),
            }),
        }
    }
}

/// Progress reported by a running encoder.
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    /// The encoder opened local segment `local_index`, which means every
    /// earlier local segment is complete.
    SegmentStarted { local_index: u64, path: PathBuf },
    /// Always the last event.
    Exited(ExitOutcome),
}

// ---------------------------------------------------------------------------
// EncoderHandle
// ---------------------------------------------------------------------------

/// Control handle for one encoder process.
///
/// Dropping the handle does not stop the process; call [`kill`](Self::kill).
#[derive(Debug, Clone)]
pub struct EncoderHandle {
    pid: Option<u32>,
    cancel: CancellationToken,
    exit: watch::Receiver<Option<ExitOutcome>>,
}

impl EncoderHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Exit outcome, if the process has ended.
    pub fn outcome(&self) -> Option<ExitOutcome> {
        self.exit.borrow().clone()
    }

    /// Wait for the process to end on its own.
    pub async fn wait(&self) -> ExitOutcome {
        let mut rx = self.exit.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or_else(ExitOutcome::lost),
            Err(_) => ExitOutcome::lost(),
        };
        outcome
    }

    /// Stop the process (SIGTERM, then SIGKILL after the grace period) and
    /// wait until it is gone. Safe to call repeatedly or after exit.
    pub async fn kill(&self) -> ExitOutcome {
        self.cancel.cancel();
        self.wait().await
    }
}

// ---------------------------------------------------------------------------
// ProcessSupervisor
// ---------------------------------------------------------------------------

/// Spawns and stops encoder processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    program: PathBuf,
    leading_args: Vec<String>,
    grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(program: impl AsRef<Path>, grace: Duration) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            leading_args: Vec::new(),
            grace,
        }
    }

    /// Arguments placed before the encoder arguments, for running the
    /// encoder through a wrapper such as `nice` or an interpreter.
    pub fn with_leading_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Start an encoder for `spec`.
    ///
    /// Fails with [`Error::EncoderLaunchFailed`] if the output directory
    /// cannot be created or the process cannot be spawned.
    pub async fn launch(
        &self,
        spec: &LaunchSpec,
    ) -> Result<(EncoderHandle, mpsc::UnboundedReceiver<EncoderEvent>)> {
        tokio::fs::create_dir_all(&spec.output_dir)
            .await
            .map_err(|e| Error::EncoderLaunchFailed {
                failure: classify_spawn_error(&e),
            })?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .args(build_hls_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            tracing::warn!(program = %self.program.display(), error = %e, "encoder spawn failed");
            Error::EncoderLaunchFailed {
                failure: classify_spawn_error(&e),
            }
        })?;

        let pid = child.id();
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("encoder stderr was not captured".into()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        tracing::info!(
            pid = ?pid,
            source = %spec.source.display(),
            seek_secs = spec.seek_secs,
            quality = %spec.quality.id,
            output = %spec.output_dir.display(),
            "encoder launched"
        );

        tokio::spawn(monitor(
            child,
            stderr,
            events_tx,
            exit_tx,
            cancel.clone(),
            self.grace,
        ));

        Ok((
            EncoderHandle {
                pid,
                cancel,
                exit: exit_rx,
            },
            events_rx,
        ))
    }

    pub async fn kill(&self, handle: &EncoderHandle) -> ExitOutcome {
        handle.kill().await
    }

    pub fn is_alive(&self, handle: &EncoderHandle) -> bool {
        handle.is_alive()
    }
}

async fn monitor(
    mut child: Child,
    stderr: ChildStderr,
    events: mpsc::UnboundedSender<EncoderEvent>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
    cancel: CancellationToken,
    grace: Duration,
) {
    let pid = child.id();
    let tail = Arc::new(Mutex::new(StderrTail::default()));
    let mut reader = tokio::spawn(read_stderr(stderr, events.clone(), tail.clone()));

    let (status, requested) = tokio::select! {
        status = child.wait() => (status, false),
        _ = cancel.cancelled() => (terminate(&mut child, grace).await, true),
    };

    if tokio::time::timeout(STDERR_DRAIN, &mut reader).await.is_err() {
        reader.abort();
    }

    let outcome = match status {
        Ok(status) => outcome_from_status(status, requested, &tail.lock()),
        Err(e) => ExitOutcome {
            success: false,
            code: None,
            requested,
            failure: (!requested).then(|| EncoderFailure::Generic {
                exit_code: None,
                detail: format!("wait failed: {e}"),
            }),
        },
    };

    if outcome.success || outcome.requested {
        tracing::debug!(pid = ?pid, code = ?outcome.code, requested, "encoder exited");
    } else {
        tracing::warn!(pid = ?pid, code = ?outcome.code, failure = ?outcome.failure, "encoder failed");
    }

    let _ = events.send(EncoderEvent::Exited(outcome.clone()));
    let _ = exit_tx.send(Some(outcome));
}

async fn read_stderr(
    stderr: ChildStderr,
    events: mpsc::UnboundedSender<EncoderEvent>,
    tail: Arc<Mutex<StderrTail>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::trace!(target: "mq_av::encoder_stderr", "{line}");
        if let Some((local_index, path)) = parse_segment_line(&line) {
            let _ = events.send(EncoderEvent::SegmentStarted { local_index, path });
        } else {
            tail.lock().push(&line);
        }
    }
}

fn outcome_from_status(status: ExitStatus, requested: bool, tail: &StderrTail) -> ExitOutcome {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal: Option<i32> = None;

    let success = status.success();
    ExitOutcome {
        success,
        code: status.code(),
        requested,
        failure: (!success && !requested).then(|| classify(tail, status.code(), signal)),
    }
}

/// SIGTERM the process group, escalate to SIGKILL after `grace`.
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let group = Pid::from_raw(pid as i32);
            let _ = killpg(group, Signal::SIGTERM);
            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                // Take down anything the encoder left behind in its group.
                let _ = killpg(group, Signal::SIGKILL);
                return status;
            }
            tracing::warn!(pid, ?grace, "encoder ignored SIGTERM; killing");
            let _ = killpg(group, Signal::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.start_kill();
    child.wait().await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use mq_core::config::QualityProfile;
    use mq_core::QualityId;

    #[test]
    fn parses_ffmpeg_segment_lines() {
        let line = "[hls @ 0x55d5c8] Opening '/tmp/work/g0001/seg00012.ts' for writing";
        assert_eq!(
            parse_segment_line(line),
            Some((12, PathBuf::from("/tmp/work/g0001/seg00012.ts")))
        );
        assert_eq!(
            parse_segment_line("[hls @ 0x1] Opening '/tmp/work/g0001/encoder.m3u8.tmp' for writing"),
            None
        );
        assert_eq!(parse_segment_line("frame=  240 fps= 60 q=28.0"), None);
    }

    fn spec(dir: &Path) -> LaunchSpec {
        LaunchSpec {
            source: PathBuf::from("/media/movie.mkv"),
            seek_secs: 0.0,
            segment_duration_secs: 6,
            output_dir: dir.join("g0000"),
            segment_pattern: "seg%05d.ts".into(),
            quality: QualityProfile {
                id: QualityId::parse("480p").unwrap(),
                max_height: 480,
                video_bitrate_kbps: 1500,
                audio_bitrate_kbps: 128,
            },
            hw_accel: None,
            video_preset: "veryfast".into(),
        }
    }

    /// `sh -c SCRIPT` ignores the encoder arguments, which land in `$0..$n`.
    fn shell(script: &str) -> ProcessSupervisor {
        ProcessSupervisor::new("sh", Duration::from_millis(500)).with_leading_args(["-c", script])
    }

    async fn drain(mut rx: mpsc::UnboundedReceiver<EncoderEvent>) -> Vec<EncoderEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            let done = matches!(ev, EncoderEvent::Exited(_));
            events.push(ev);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn reports_segments_then_exit() {
        let dir = tempfile::tempdir().unwrap();
        let sup = shell(
            "for i in 00000 00001 00002; do echo \"[hls @ 0x1] Opening '/x/seg$i.ts' for writing\" >&2; done",
        );
        let (handle, rx) = sup.launch(&spec(dir.path())).await.unwrap();
        let events = drain(rx).await;

        let locals: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                EncoderEvent::SegmentStarted { local_index, .. } => Some(*local_index),
                _ => None,
            })
            .collect();
        assert_eq!(locals, vec![0, 1, 2]);
        match events.last() {
            Some(EncoderEvent::Exited(outcome)) => {
                assert!(outcome.success);
                assert!(outcome.failure.is_none());
            }
            other => panic!("unexpected last event: {other:?}"),
        }
        assert!(!handle.is_alive());
        assert!(dir.path().join("g0000").is_dir());
    }

    #[tokio::test]
    async fn classifies_failures() {
        let dir = tempfile::tempdir().unwrap();
        let sup = shell("echo 'No space left on device' >&2; exit 1");
        let (handle, _rx) = sup.launch(&spec(dir.path())).await.unwrap();
        let outcome = handle.wait().await;
        assert!(!outcome.success);
        assert!(!outcome.requested);
        assert_eq!(outcome.code, Some(1));
        assert_eq!(outcome.failure, Some(EncoderFailure::DiskFull));
    }

    #[tokio::test]
    async fn kill_is_requested_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sup = shell("sleep 30");
        let (handle, _rx) = sup.launch(&spec(dir.path())).await.unwrap();
        assert!(sup.is_alive(&handle));
        assert!(handle.pid().is_some());

        let outcome = sup.kill(&handle).await;
        assert!(outcome.requested);
        assert!(outcome.failure.is_none());
        assert!(!handle.is_alive());

        let again = handle.kill().await;
        assert_eq!(again, outcome);
    }

    #[tokio::test]
    async fn stubborn_process_is_force_killed() {
        let dir = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new("sh", Duration::from_millis(200))
            .with_leading_args(["-c", "trap '' TERM; while :; do sleep 1; done"]);
        let (handle, _rx) = sup.launch(&spec(dir.path())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.kill())
            .await
            .expect("kill must finish after the grace period");
        assert!(outcome.requested);
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new("/nonexistent/ffmpeg", Duration::from_secs(1));
        let err = sup.launch(&spec(dir.path())).await.unwrap_err();
        assert!(matches!(
            err,
            Error::EncoderLaunchFailed {
                failure: EncoderFailure::MissingBinary { .. }
            }
        ));
    }
}
