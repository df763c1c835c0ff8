//! Vulkan abstraction layer for the Framewise engine.
//!
//! This crate provides:
//! - Vulkan instance, surface and device management
//! - GPU capability detection
//! - Memory allocation via gpu-allocator
//! - Command buffer, descriptor and synchronization helpers
//! - Render pass, attachments and graphics pipelines
//! - The swapchain frame cycle and its Vulkan presenter

pub mod capabilities;
pub mod command;
pub mod context;
pub mod deferred;
pub mod descriptors;
pub mod error;
pub mod frame_cycle;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod presenter;
pub mod render_pass;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use context::{GpuContext, GpuContextBuilder};
pub use deferred::DeferredDeletionQueue;
pub use descriptors::{
    write_combined_image_sampler, write_uniform_buffer, DescriptorAllocator, DescriptorPool,
    DescriptorSetLayoutBuilder,
};
pub use error::{GpuError, Result};
pub use frame_cycle::{
    AcquireOutcome, FencedSlot, FrameCycle, FramePhase, FramePlatform,
    PreparedFrame, PresentOutcome, SwapchainInfo,
};
pub use memory::{BufferBackend, GpuAllocator, GpuBuffer, GpuImage};
pub use pipeline::{GraphicsPipeline, GraphicsPipelineConfig, ShaderStage};
pub use presenter::{PresenterConfig, RenderTarget, VulkanPresenter};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use sync::{create_fence, create_semaphore, FrameSync, FrameSyncSet};

/// Re-export of the Vulkan bindings the public API is expressed in.
pub use ash::vk;
