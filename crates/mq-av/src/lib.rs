//! # mq-av
//!
//! External tool handling for marquee:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- locate ffmpeg and ffprobe.
//! - **Command execution** ([`ToolCommand`]) -- one-shot commands with a
//!   timeout.
//! - **Probing** ([`probe::probe_duration`]) -- source duration via ffprobe.
//! - **Encoder invocation** ([`encoder`]) -- ffmpeg HLS arguments for a
//!   quality profile and seek position.
//! - **Supervision** ([`ProcessSupervisor`]) -- spawn, watch and stop
//!   encoder processes, with typed crash diagnostics.

pub mod command;
pub mod diagnostics;
pub mod encoder;
pub mod probe;
pub mod supervisor;
pub mod tools;

// ---- Re-exports for convenience ----

pub use command::{ToolCommand, ToolOutput};
pub use encoder::LaunchSpec;
pub use supervisor::{EncoderEvent, EncoderHandle, ExitOutcome, ProcessSupervisor};
pub use tools::{ToolInfo, ToolRegistry};
