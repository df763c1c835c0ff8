//! Core types for the Framewise rendering engine.
//!
//! This crate provides the foundational types shared by the GPU layer and the
//! renderer:
//! - Frame-in-flight slots
//! - Render target extents
//! - Pipeline kind tags
//! - The engine-wide error type

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Extent, FrameSlot, PipelineKind};

/// Engine-wide constants
pub mod constants {
    /// Default number of frames the CPU may prepare ahead of the GPU.
    pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;
    /// Upper bound on frames in flight accepted by the renderer.
    pub const MAX_FRAMES_IN_FLIGHT: usize = 4;
}
