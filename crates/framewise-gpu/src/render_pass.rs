//! Render pass, attachment images and framebuffers.
//!
//! The engine renders into a single subpass. With multisampling enabled the
//! subpass draws into a transient MSAA color image and resolves into the
//! swapchain image; otherwise it draws into the swapchain image directly.
//! Both variants carry a depth attachment.

use crate::error::{GpuError, Result};
use crate::memory::{GpuAllocator, GpuImage};
use ash::vk;
use gpu_allocator::MemoryLocation;

/// Create the engine's render pass.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
    samples: vk::SampleCountFlags,
) -> Result<vk::RenderPass> {
    let multisampled = samples != vk::SampleCountFlags::TYPE_1;

    let color_attachment = vk::AttachmentDescription::default()
        .format(color_format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(if multisampled {
            vk::AttachmentStoreOp::DONT_CARE
        } else {
            vk::AttachmentStoreOp::STORE
        })
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(if multisampled {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::PRESENT_SRC_KHR
        });

    let depth_attachment = vk::AttachmentDescription::default()
        .format(depth_format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

    let resolve_attachment = vk::AttachmentDescription::default()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::DONT_CARE)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

    let color_refs = [vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
    let depth_ref = vk::AttachmentReference::default()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    let resolve_refs = [vk::AttachmentReference::default()
        .attachment(2)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref);
    if multisampled {
        subpass = subpass.resolve_attachments(&resolve_refs);
    }

    // Wait for the presentation engine to release the image and for the
    // previous frame's depth writes before clearing
    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(stages)
        .dst_stage_mask(stages)
        .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );

    let attachments_msaa = [color_attachment, depth_attachment, resolve_attachment];
    let attachments_single = [color_attachment, depth_attachment];
    let attachments: &[vk::AttachmentDescription] = if multisampled {
        &attachments_msaa
    } else {
        &attachments_single
    };

    let subpasses = [subpass];
    let dependencies = [dependency];
    let info = vk::RenderPassCreateInfo::default()
        .attachments(attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let render_pass = device.create_render_pass(&info, None)?;
    tracing::debug!(
        "Render pass created ({:?}, depth {:?}, {:?})",
        color_format,
        depth_format,
        samples
    );
    Ok(render_pass)
}

/// Image-dependent attachments shared by every framebuffer.
pub struct AttachmentImages {
    /// Multisampled color target, absent when rendering single-sampled.
    color: Option<(GpuImage, vk::ImageView)>,
    depth: GpuImage,
    depth_view: vk::ImageView,
}

impl AttachmentImages {
    /// Allocate color (when multisampled) and depth targets for `extent`.
    ///
    /// # Safety
    /// The device must be valid and own the allocator.
    pub unsafe fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        extent: vk::Extent2D,
        color_format: vk::Format,
        depth_format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> Result<Self> {
        let color = if samples == vk::SampleCountFlags::TYPE_1 {
            None
        } else {
            let image = allocator.create_image(
                &attachment_image_info(
                    extent,
                    color_format,
                    samples,
                    vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
                        | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                ),
                MemoryLocation::GpuOnly,
                "msaa color target",
            )?;
            let view = create_image_view(
                device,
                image.image,
                color_format,
                vk::ImageAspectFlags::COLOR,
                1,
            )?;
            Some((image, view))
        };

        let depth = allocator.create_image(
            &attachment_image_info(
                extent,
                depth_format,
                samples,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            ),
            MemoryLocation::GpuOnly,
            "depth target",
        )?;
        let depth_view = create_image_view(
            device,
            depth.image,
            depth_format,
            vk::ImageAspectFlags::DEPTH,
            1,
        )?;

        Ok(Self {
            color,
            depth,
            depth_view,
        })
    }

    /// Attachment views for one framebuffer, in render pass order.
    pub fn framebuffer_views(&self, swapchain_view: vk::ImageView) -> Vec<vk::ImageView> {
        match &self.color {
            Some((_, color_view)) => vec![*color_view, self.depth_view, swapchain_view],
            None => vec![swapchain_view, self.depth_view],
        }
    }

    /// Destroy the attachments.
    ///
    /// # Safety
    /// The device must be idle with respect to these images.
    pub unsafe fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) -> Result<()> {
        if let Some((mut image, view)) = self.color.take() {
            device.destroy_image_view(view, None);
            allocator.free_image(&mut image)?;
        }
        device.destroy_image_view(self.depth_view, None);
        allocator.free_image(&mut self.depth)
    }
}

fn attachment_image_info(
    extent: vk::Extent2D,
    format: vk::Format,
    samples: vk::SampleCountFlags,
    usage: vk::ImageUsageFlags,
) -> vk::ImageCreateInfo<'static> {
    vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(samples)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
}

/// Create a 2D image view.
///
/// # Safety
/// The device and image must be valid.
pub unsafe fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .base_mip_level(0)
                .level_count(mip_levels)
                .base_array_layer(0)
                .layer_count(1),
        );

    Ok(device.create_image_view(&view_info, None)?)
}

/// Create one framebuffer per swapchain image view.
///
/// # Safety
/// All handles must be valid and compatible with `render_pass`.
pub unsafe fn create_framebuffers(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    swapchain_views: &[vk::ImageView],
    attachments: &AttachmentImages,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    let mut framebuffers = Vec::with_capacity(swapchain_views.len());
    for &view in swapchain_views {
        let views = attachments.framebuffer_views(view);
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        match device.create_framebuffer(&info, None) {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(e) => {
                for framebuffer in framebuffers {
                    device.destroy_framebuffer(framebuffer, None);
                }
                return Err(GpuError::from(e));
            }
        }
    }
    Ok(framebuffers)
}

/// Begin the render pass on a primary command buffer.
///
/// # Safety
/// All handles must be valid and `cmd` must be recording.
pub unsafe fn begin_render_pass(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    clear_color: [f32; 4],
    contents: vk::SubpassContents,
) {
    let clear_values = [
        vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ];

    let begin_info = vk::RenderPassBeginInfo::default()
        .render_pass(render_pass)
        .framebuffer(framebuffer)
        .render_area(vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        })
        .clear_values(&clear_values);

    device.cmd_begin_render_pass(cmd, &begin_info, contents);
}
