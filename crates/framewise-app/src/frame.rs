//! Per-frame context for updates.

use framewise_core::{Extent, FrameSlot};

/// The frame being prepared.
///
/// Handed to [`FramewiseApp::update`](crate::FramewiseApp::update) after the
/// frame's slot fence was waited on, so resource writes and texture uploads
/// are safe.
#[derive(Clone, Copy, Debug)]
pub struct FrameContext {
    /// Seconds since the previous frame.
    pub dt: f32,
    /// Monotonic frame counter.
    pub frame_number: u64,
    /// Frame-in-flight slot of this frame.
    pub slot: FrameSlot,
    /// Size of the image being rendered.
    pub extent: Extent,
}
