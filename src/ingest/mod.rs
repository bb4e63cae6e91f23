//! Frame sources.
//!
//! Camera device access lives outside this crate; what arrives here is
//! either a replay directory of raw RGBA frames (field captures) or the
//! synthetic generator. Sources produce [`Frame`]s that the capture loop
//! pushes into the ingest queue; they never block on the consumer.

mod replay;
mod synthetic;

pub use replay::{ReplayConfig, ReplaySource};
pub use synthetic::{SyntheticConfig, SyntheticSource};

use anyhow::Result;

use crate::frame::Frame;

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// A producer of frames for the capture context.
pub trait FrameSource: Send {
    /// Prepare the source. Idempotent.
    fn connect(&mut self) -> Result<()>;

    /// Produce the next frame. A per-frame error means that frame is
    /// dropped; the source stays usable.
    fn next_frame(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}
