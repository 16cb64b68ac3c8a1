//! Encoder crash classification from stderr.

use std::collections::VecDeque;

use mq_core::EncoderFailure;

/// Lines of stderr retained per encoder process.
const TAIL_LINES: usize = 32;

/// Bounded buffer of the most recent stderr lines.
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    pub fn push(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if self.lines.len() >= TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }
}

const DISK_FULL: &[&str] = &["no space left on device", "disk quota exceeded"];

const UNSUPPORTED: &[&str] = &[
    "decoder not found",
    "not found for input stream",
    "unknown decoder",
    "unsupported codec",
    "could not find codec parameters",
    "error while opening decoder",
    "invalid data found when processing input",
    "does not contain any stream",
];

const SOURCE_MISSING: &[&str] = &[
    "no such file or directory",
    "permission denied",
    "input/output error",
];

/// Classify a failed exit.
///
/// `signal` is the terminating signal on unix. Disk exhaustion wins over
/// everything else because it also produces secondary I/O errors.
pub fn classify(tail: &StderrTail, exit_code: Option<i32>, signal: Option<i32>) -> EncoderFailure {
    let find = |needles: &[&str]| {
        tail.lines()
            .find(|line| {
                let lower = line.to_ascii_lowercase();
                needles.iter().any(|n| lower.contains(n))
            })
            .map(str::to_string)
    };

    if find(DISK_FULL).is_some() {
        return EncoderFailure::DiskFull;
    }
    if let Some(detail) = find(UNSUPPORTED) {
        return EncoderFailure::UnsupportedCodec { detail };
    }
    if let Some(detail) = find(SOURCE_MISSING) {
        return EncoderFailure::SourceMissing { detail };
    }
    if exit_code.is_none() {
        return EncoderFailure::Killed { signal };
    }
    EncoderFailure::Generic {
        exit_code,
        detail: tail.last().unwrap_or("no diagnostic output").to_string(),
    }
}

/// Classify a failure to spawn the process at all.
pub fn classify_spawn_error(err: &std::io::Error) -> EncoderFailure {
    match err.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            EncoderFailure::MissingBinary {
                detail: err.to_string(),
            }
        }
        _ if err.raw_os_error() == Some(28) => EncoderFailure::DiskFull,
        _ => EncoderFailure::Generic {
            exit_code: None,
            detail: format!("spawn failed: {err}"),
        },
    }
}
