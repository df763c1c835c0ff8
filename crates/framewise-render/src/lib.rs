//! Per-frame rendering for the Framewise engine.
//!
//! This crate provides:
//! - Frame resources with one GPU copy per frame in flight
//! - The resource arena and its once-per-frame sweep
//! - Mipmapped textures uploaded through the frame's one-off buffer
//! - Render objects and the pipeline directory
//! - Parallel secondary command buffer recording
//! - The [`Renderer`] tying them to the swapchain frame cycle

pub mod buffer_manager;
pub mod dispatcher;
pub mod error;
pub mod object;
pub mod pipeline_directory;
pub mod recorder;
pub mod renderer;
pub mod resource;
pub mod texture;
pub mod view;

pub use buffer_manager::{BufferManager, ResourceId, UpdateStats};
pub use dispatcher::{partition, CommandDispatcher, FrameTarget, RecordTask, SecondaryRecorder};
pub use error::{RenderError, Result};
pub use object::{
    DrawCall, MissingBinding, ObjectRegistry, RenderObject, RenderObjectDesc, VertexBinding,
};
pub use pipeline_directory::{
    PipelineDescription, PipelineDirectory, PipelineEntry, TextureDecl, UniformDecl,
    VertexAttribute,
};
pub use recorder::VulkanRecorder;
pub use renderer::{Renderer, RendererConfig};
pub use resource::{DirtyMarker, FrameResource, ResourceKind};
pub use texture::{mip_levels, Texture, TextureId, TextureManager, TEXTURE_FORMAT};
pub use view::{BufferBinding, ResourceView, TextureBinding};
