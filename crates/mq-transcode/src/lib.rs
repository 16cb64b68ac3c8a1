//! mq-transcode: on-demand HLS transcoding sessions.
//!
//! - [`source`] resolves content ids to source files and durations.
//! - [`store`] tracks which segments each encoder generation has finished.
//! - [`session`] drives one (content, quality) session: encoder
//!   generations, seeks, crash restarts and teardown.
//! - [`registry`] owns every live session, coalesces creation and evicts
//!   idle ones.

pub mod registry;
pub mod session;
pub mod source;
pub mod store;

pub use registry::SessionRegistry;
pub use session::{SeekOutcome, SessionSnapshot, SessionState, TranscodeSession};
pub use source::{LibraryResolver, SourceMedia, SourceResolver, StaticResolver};
pub use store::{ReadableSegment, SegmentLookup, SegmentState, SegmentStore};
