//! Shared test harness for HTTP integration tests.
//!
//! [`TestHarness`] builds a full [`AppContext`] around a shell-script stand-in
//! for ffmpeg and serves it on a random port. The script writes one small
//! file per segment and prints ffmpeg's `Opening '...' for writing` line, so
//! sessions see the same progress signal they get from the real encoder.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mq_av::{ProcessSupervisor, ToolRegistry};
use mq_core::config::Config;
use mq_server::context::AppContext;
use mq_transcode::StaticResolver;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Source length registered for the `movie` content id.
pub const MOVIE_SECS: f64 = 300.0;

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

start=${ss%.*}
count=$(( (@TOTAL@ - start + 5) / 6 ))
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

pub struct TestHarness {
    pub ctx: AppContext,
    pub addr: SocketAddr,
    pub work: TempDir,
    state: TempDir,
    cancel: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl TestHarness {
    /// Serve with an encoder that sleeps `delay` seconds per segment.
    pub async fn with_server(delay: &str) -> Self {
        let state = tempfile::tempdir().expect("state dir");
        let work = tempfile::tempdir().expect("work dir");

        let script = state.path().join("fake-ffmpeg.sh");
        let body = SCRIPT
            .replace("@STATE@", &state.path().to_string_lossy())
            .replace("@TOTAL@", &(MOVIE_SECS as u32).to_string())
            .replace("@DELAY@", delay);
        std::fs::write(&script, body).expect("write fake encoder");

        let mut config = Config::default();
        config.transcode.work_dir = work.path().to_path_buf();
        config.transcode.segment_duration_secs = 6;
        config.transcode.segment_wait_secs = 5;
        config.transcode.shutdown_grace_secs = 1;

        let resolver = StaticResolver::new()
            .with("movie", "/media/movie.mkv", MOVIE_SECS)
            .expect("register movie");
        let supervisor = ProcessSupervisor::new("sh", Duration::from_millis(500))
            .with_leading_args([script.to_string_lossy().into_owned()]);

        let ctx = AppContext::with_supervisor(
            config,
            ToolRegistry::default(),
            Arc::new(resolver),
            supervisor,
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        let cancel = CancellationToken::new();
        let server_ctx = ctx.clone();
        let server_cancel = cancel.clone();
        let server = tokio::spawn(async move {
            mq_server::serve(listener, server_ctx, server_cancel).await.ok();
        });

        Self {
            ctx,
            addr,
            work,
            state,
            cancel,
            server,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// `-ss` value of every encoder launch, in order.
    pub fn seeks(&self) -> Vec<String> {
        std::fs::read_to_string(self.state.path().join("seeks"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn session_dirs(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.work.path())
            .map(|rd| rd.flatten().map(|e| e.path()).collect())
            .unwrap_or_default()
    }

    /// Stop the server and wait for every session to be torn down.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        (&mut self.server).await.ok();
    }

    pub async fn shutdown(mut self) {
        self.stop().await;
    }
}

/// GET `url` until it stops answering 202, up to `timeout`.
pub async fn get_when_ready(url: &str, timeout: Duration) -> reqwest::Response {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let resp = reqwest::get(url).await.expect("request failed");
        if resp.status() != 202 || tokio::time::Instant::now() >= deadline {
            return resp;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
