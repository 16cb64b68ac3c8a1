//! Unified error type for marquee.
//!
//! Every crate in the workspace reports failures through [`Error`]. The HTTP
//! layer derives its status codes from [`Error::http_status`], which keeps
//! "still buffering" (202) distinct from terminal session failures.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EncoderFailure
// ---------------------------------------------------------------------------

/// Classified reason an encoder process could not start or stopped early.
///
/// Produced from the process's diagnostic output so callers never have to
/// pattern-match raw stderr text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncoderFailure {
    /// The source uses a codec or container the encoder cannot decode.
    UnsupportedCodec { detail: String },
    /// The output volume ran out of space.
    DiskFull,
    /// The source file vanished or could not be opened.
    SourceMissing { detail: String },
    /// The encoder executable could not be found or executed.
    MissingBinary { detail: String },
    /// The process was terminated by a signal it did not ask for.
    Killed { signal: Option<i32> },
    /// Anything else; carries the exit code and the last diagnostic line.
    Generic {
        exit_code: Option<i32>,
        detail: String,
    },
}

impl fmt::Display for EncoderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderFailure::UnsupportedCodec { detail } => {
                write!(f, "unsupported source codec: {detail}")
            }
            EncoderFailure::DiskFull => write!(f, "no space left on device"),
            EncoderFailure::SourceMissing { detail } => write!(f, "source unreadable: {detail}"),
            EncoderFailure::MissingBinary { detail } => write!(f, "encoder not runnable: {detail}"),
            EncoderFailure::Killed { signal: Some(sig) } => write!(f, "killed by signal {sig}"),
            EncoderFailure::Killed { signal: None } => write!(f, "killed"),
            EncoderFailure::Generic { exit_code, detail } => match exit_code {
                Some(code) => write!(f, "exit code {code}: {detail}"),
                None => write!(f, "{detail}"),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Unified error type covering all failure modes in marquee.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "content", "quality", "segment").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A conflicting resource already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// An external tool (ffmpeg, ffprobe) returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// The content resolver could not supply a source path or duration.
    #[error("Source unavailable for {content}: {reason}")]
    SourceUnavailable { content: String, reason: String },

    /// The encoder process could not be started (or died before producing
    /// its first segment).
    #[error("Encoder launch failed: {failure}")]
    EncoderLaunchFailed { failure: EncoderFailure },

    /// The encoder exited unexpectedly and the automatic restart also failed.
    #[error("Encoder crashed: {failure}")]
    EncoderCrashed { failure: EncoderFailure },

    /// No live or past generation has produced, or will produce, the segment.
    #[error("Segment {index} will not be produced without a seek")]
    NeverWillExist { index: u64 },

    /// The segment is still being produced; retry shortly.
    #[error("Segment {index} is not ready yet")]
    NotYetAvailable { index: u64 },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::Validation(_) => 400,
            Error::Conflict(_) => 409,
            Error::Io { .. } => 500,
            Error::Tool { .. } => 502,
            Error::SourceUnavailable { .. } => 502,
            Error::EncoderLaunchFailed { .. } => 500,
            Error::EncoderCrashed { .. } => 500,
            Error::NeverWillExist { .. } => 409,
            Error::NotYetAvailable { .. } => 202,
            Error::Internal(_) => 500,
        }
    }

    /// Whether the caller should simply retry the same request later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::NotYetAvailable { .. })
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::SourceUnavailable`].
    pub fn source_unavailable(content: impl fmt::Display, reason: impl Into<String>) -> Self {
        Error::SourceUnavailable {
            content: content.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
