//! Vulkan implementation of [`FramePlatform`].
//!
//! Owns the swapchain and everything sized by it: the render pass, the
//! MSAA/depth attachments, one framebuffer per image, and the per-image upload
//! and primary command buffers. Per-slot semaphores and fences live in a
//! [`FrameSyncSet`].

use crate::command::{begin_command_buffer, end_command_buffer, submit_command_buffers, CommandPool};
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::frame_cycle::{AcquireOutcome, FramePlatform, PresentOutcome, SwapchainInfo};
use crate::render_pass::{begin_render_pass, create_framebuffers, create_render_pass, AttachmentImages};
use crate::swapchain::{calculate_extent, ensure_same_format, find_depth_format, Swapchain};
use crate::sync::FrameSyncSet;
use ash::vk;
use framewise_core::{Extent, FrameSlot};
use std::sync::Arc;

/// Presentation settings.
#[derive(Clone, Copy, Debug)]
pub struct PresenterConfig {
    /// Number of frames in flight.
    pub frames_in_flight: usize,
    /// Use FIFO presentation.
    pub vsync: bool,
    /// Requested MSAA sample count; clamped to what the device supports.
    pub samples: vk::SampleCountFlags,
    /// Color the render pass clears to.
    pub clear_color: [f32; 4],
}

/// Render target handed to command recording.
#[derive(Clone, Copy, Debug)]
pub struct RenderTarget {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    /// Swapchain generation the framebuffer belongs to.
    pub generation: u64,
}

/// Swapchain presenter.
pub struct VulkanPresenter {
    gpu: Arc<GpuContext>,
    config: PresenterConfig,
    samples: vk::SampleCountFlags,
    depth_format: vk::Format,
    swapchain: Swapchain,
    render_pass: vk::RenderPass,
    attachments: AttachmentImages,
    framebuffers: Vec<vk::Framebuffer>,
    sync: FrameSyncSet,
    command_pool: CommandPool,
    upload_buffers: Vec<vk::CommandBuffer>,
    primary_buffers: Vec<vk::CommandBuffer>,
    generation: u64,
}

impl VulkanPresenter {
    /// Create the swapchain and all image-dependent resources for `extent`.
    pub fn new(gpu: Arc<GpuContext>, config: PresenterConfig, extent: Extent) -> Result<Self> {
        let device = gpu.device();
        let samples = gpu.capabilities().clamp_samples(config.samples);
        let depth_format = unsafe { find_depth_format(gpu.instance(), gpu.physical_device()) }?;

        let swapchain = unsafe { create_swapchain(&gpu, extent, config.vsync, None) }?;
        let render_pass =
            unsafe { create_render_pass(device, swapchain.format, depth_format, samples) }?;
        let attachments = unsafe {
            AttachmentImages::new(
                device,
                &mut gpu.allocator().lock(),
                swapchain.extent,
                swapchain.format,
                depth_format,
                samples,
            )
        }?;
        let framebuffers = unsafe {
            create_framebuffers(
                device,
                render_pass,
                &swapchain.image_views,
                &attachments,
                swapchain.extent,
            )
        }?;

        let sync = unsafe { FrameSyncSet::new(device, config.frames_in_flight) }?;
        let command_pool = unsafe {
            CommandPool::new(
                device,
                gpu.graphics_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
        }?;
        let image_count = swapchain.image_count() as u32;
        let upload_buffers = unsafe {
            command_pool.allocate_command_buffers(
                device,
                vk::CommandBufferLevel::PRIMARY,
                image_count,
            )
        }?;
        let primary_buffers = unsafe {
            command_pool.allocate_command_buffers(
                device,
                vk::CommandBufferLevel::PRIMARY,
                image_count,
            )
        }?;

        tracing::info!(
            "Presenter ready: {} frames in flight, {:?} MSAA, depth {:?}",
            config.frames_in_flight,
            samples,
            depth_format
        );

        Ok(Self {
            gpu,
            config,
            samples,
            depth_format,
            swapchain,
            render_pass,
            attachments,
            framebuffers,
            sync,
            command_pool,
            upload_buffers,
            primary_buffers,
            generation: 0,
        })
    }

    /// Sample count the render pass and pipelines use.
    pub const fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    /// The engine's render pass.
    pub const fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Render target for a swapchain image.
    pub fn target(&self, image: u32) -> Result<RenderTarget> {
        let framebuffer = *self
            .framebuffers
            .get(image as usize)
            .ok_or_else(|| GpuError::InvalidState(format!("No framebuffer for image {image}")))?;
        Ok(RenderTarget {
            render_pass: self.render_pass,
            framebuffer,
            extent: self.swapchain.extent,
            generation: self.generation,
        })
    }

    /// Upload command buffer for an image. Open between prep and swap.
    pub fn upload_buffer(&self, image: u32) -> Result<vk::CommandBuffer> {
        self.upload_buffers
            .get(image as usize)
            .copied()
            .ok_or_else(|| GpuError::InvalidState(format!("No upload buffer for image {image}")))
    }

    /// Record the image's primary buffer: one render pass executing
    /// `secondaries` in order.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn record_primary(&self, image: u32, secondaries: &[vk::CommandBuffer]) -> Result<()> {
        let device = self.gpu.device();
        let cmd = *self
            .primary_buffers
            .get(image as usize)
            .ok_or_else(|| GpuError::InvalidState(format!("No primary buffer for image {image}")))?;
        let target = self.target(image)?;

        unsafe {
            begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
            begin_render_pass(
                device,
                cmd,
                target.render_pass,
                target.framebuffer,
                target.extent,
                self.config.clear_color,
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            );
            if !secondaries.is_empty() {
                device.cmd_execute_commands(cmd, secondaries);
            }
            device.cmd_end_render_pass(cmd);
            end_command_buffer(device, cmd)?;
        }
        Ok(())
    }

    unsafe fn destroy_image_dependent(&mut self) -> Result<()> {
        let device = self.gpu.device();
        for framebuffer in self.framebuffers.drain(..) {
            device.destroy_framebuffer(framebuffer, None);
        }
        self.attachments
            .destroy(device, &mut self.gpu.allocator().lock())
    }

    unsafe fn rebuild_command_buffers(&mut self, image_count: usize) -> Result<()> {
        if image_count == self.upload_buffers.len() {
            return Ok(());
        }
        let device = self.gpu.device();
        device.free_command_buffers(self.command_pool.handle(), &self.upload_buffers);
        device.free_command_buffers(self.command_pool.handle(), &self.primary_buffers);
        self.upload_buffers = self.command_pool.allocate_command_buffers(
            device,
            vk::CommandBufferLevel::PRIMARY,
            image_count as u32,
        )?;
        self.primary_buffers = self.command_pool.allocate_command_buffers(
            device,
            vk::CommandBufferLevel::PRIMARY,
            image_count as u32,
        )?;
        Ok(())
    }
}

unsafe fn create_swapchain(
    gpu: &GpuContext,
    extent: Extent,
    vsync: bool,
    old_swapchain: Option<vk::SwapchainKHR>,
) -> Result<Swapchain> {
    let caps = gpu.surface().capabilities(gpu.physical_device())?;
    let surface_format = caps.recommended_format()?;
    let present_mode = caps.recommended_present_mode(vsync);
    let extent = calculate_extent(&caps.capabilities, extent.width, extent.height);

    Swapchain::new(
        gpu.device(),
        gpu.swapchain_loader(),
        gpu.surface().surface,
        &caps.capabilities,
        surface_format,
        present_mode,
        extent,
        old_swapchain,
    )
}

impl FramePlatform for VulkanPresenter {
    fn swapchain_info(&self) -> SwapchainInfo {
        SwapchainInfo {
            extent: Extent::new(self.swapchain.extent.width, self.swapchain.extent.height),
            image_count: self.swapchain.image_count(),
        }
    }

    fn wait_slot(&mut self, slot: FrameSlot) -> Result<()> {
        unsafe { self.sync.get(slot.index()).wait(self.gpu.device()) }
    }

    fn reset_slot(&mut self, slot: FrameSlot) -> Result<()> {
        unsafe { self.sync.get(slot.index()).reset(self.gpu.device()) }
    }

    fn acquire(&mut self, slot: FrameSlot) -> Result<AcquireOutcome> {
        let semaphore = self.sync.get(slot.index()).image_available;
        let acquired = unsafe {
            self.swapchain
                .acquire_next_image(self.gpu.swapchain_loader(), semaphore, u64::MAX)
        }?;
        Ok(match acquired {
            Some((index, suboptimal)) => AcquireOutcome::Image { index, suboptimal },
            None => AcquireOutcome::OutOfDate,
        })
    }

    fn begin_upload(&mut self, image: u32) -> Result<()> {
        let cmd = self.upload_buffer(image)?;
        unsafe {
            begin_command_buffer(
                self.gpu.device(),
                cmd,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )
        }
    }

    fn end_upload(&mut self, image: u32) -> Result<()> {
        let cmd = self.upload_buffer(image)?;
        unsafe { end_command_buffer(self.gpu.device(), cmd) }
    }

    fn submit(&mut self, slot: FrameSlot, image: u32) -> Result<()> {
        let sync = self.sync.get(slot.index());
        let command_buffers = [
            self.upload_buffer(image)?,
            self.primary_buffers[image as usize],
        ];
        unsafe {
            submit_command_buffers(
                self.gpu.device(),
                self.gpu.graphics_queue(),
                &command_buffers,
                &[sync.image_available],
                &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                &[sync.render_finished],
                sync.in_flight,
            )
        }
    }

    fn present(&mut self, slot: FrameSlot, image: u32) -> Result<PresentOutcome> {
        let render_finished = self.sync.get(slot.index()).render_finished;
        let stale = unsafe {
            self.swapchain.present(
                self.gpu.swapchain_loader(),
                self.gpu.graphics_queue(),
                image,
                &[render_finished],
            )
        }?;
        Ok(if stale {
            PresentOutcome::Stale
        } else {
            PresentOutcome::Presented
        })
    }

    fn recreate(&mut self, extent: Extent) -> Result<SwapchainInfo> {
        self.gpu.wait_idle()?;

        unsafe {
            let swapchain = create_swapchain(
                &self.gpu,
                extent,
                self.config.vsync,
                Some(self.swapchain.swapchain),
            )?;
            // Pipelines are bound to the render pass, which is bound to the format
            if let Err(e) = ensure_same_format(self.swapchain.format, swapchain.format) {
                swapchain.destroy(self.gpu.device(), self.gpu.swapchain_loader());
                return Err(e);
            }

            self.destroy_image_dependent()?;
            self.swapchain.destroy(self.gpu.device(), self.gpu.swapchain_loader());
            self.swapchain = swapchain;

            self.attachments = AttachmentImages::new(
                self.gpu.device(),
                &mut self.gpu.allocator().lock(),
                self.swapchain.extent,
                self.swapchain.format,
                self.depth_format,
                self.samples,
            )?;
            self.framebuffers = create_framebuffers(
                self.gpu.device(),
                self.render_pass,
                &self.swapchain.image_views,
                &self.attachments,
                self.swapchain.extent,
            )?;
            self.rebuild_command_buffers(self.swapchain.image_count())?;
        }

        self.generation += 1;
        Ok(self.swapchain_info())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.gpu.wait_idle()
    }
}

impl Drop for VulkanPresenter {
    fn drop(&mut self) {
        let _ = self.gpu.wait_idle();
        unsafe {
            if let Err(e) = self.destroy_image_dependent() {
                tracing::error!("Failed to free render targets: {}", e);
            }
            let device = self.gpu.device();
            self.command_pool.destroy(device);
            self.sync.destroy(device);
            device.destroy_render_pass(self.render_pass, None);
            self.swapchain.destroy(device, self.gpu.swapchain_loader());
        }
    }
}
