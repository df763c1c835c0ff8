//! Render error types.

use framewise_core::PipelineKind;
use framewise_gpu::GpuError;
use thiserror::Error;

use crate::buffer_manager::ResourceId;
use crate::texture::TextureId;

/// Rendering errors.
#[derive(Error, Debug)]
pub enum RenderError {
    /// GPU layer error.
    #[error(transparent)]
    Gpu(#[from] GpuError),

    /// Core type error.
    #[error(transparent)]
    Core(#[from] framewise_core::Error),

    /// Handle does not name a live resource.
    #[error("Unknown resource {0}")]
    UnknownResource(ResourceId),

    /// Handle does not name a live texture.
    #[error("Unknown texture {0}")]
    UnknownTexture(TextureId),

    /// Payload does not match the declared layout.
    #[error("Invalid resource data: {0}")]
    InvalidData(String),

    /// Two pipeline descriptions share a kind.
    #[error("Duplicate pipeline for {0}")]
    DuplicatePipeline(PipelineKind),

    /// Pipeline description is inconsistent.
    #[error("Invalid pipeline description: {0}")]
    InvalidPipeline(String),

    /// Operation needs a prepared frame.
    #[error("No frame prepared; call prep_next_frame first")]
    NoFramePrepared,

    /// Objects were already recorded into the prepared frame.
    #[error("Frame {0} already recorded; call swap before recording again")]
    AlreadyRecorded(u64),

    /// A recording worker stopped responding.
    #[error("Recording worker {0} disconnected")]
    WorkerDisconnected(usize),

    /// A recording worker could not be started.
    #[error("Failed to spawn recording worker: {0}")]
    WorkerSpawn(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RenderError>;
