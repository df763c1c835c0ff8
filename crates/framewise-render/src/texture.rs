//! Sampled RGBA textures uploaded through the frame's one-off command buffer.
//!
//! Creation records a staging copy, layout transitions and blit-generated
//! mipmaps into the upload buffer of the prepared frame. The staging buffer is
//! freed once the slot that submitted the upload comes round again.

use std::fmt;

use ash::vk;
use framewise_gpu::render_pass::create_image_view;
use framewise_gpu::{DeferredDeletionQueue, GpuAllocator, GpuBuffer, GpuContext, GpuImage};
use gpu_allocator::MemoryLocation;

use crate::error::{RenderError, Result};
use crate::view::{ResourceView, TextureBinding};

/// Format every texture is stored in.
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Handle to a texture in a [`TextureManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId {
    index: u32,
    generation: u32,
}

impl TextureId {
    #[cfg(test)]
    pub(crate) const fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for TextureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Number of mip levels in a full chain for a `width`×`height` image.
pub const fn mip_levels(width: u32, height: u32) -> u32 {
    let largest = if width > height { width } else { height };
    if largest == 0 {
        1
    } else {
        u32::BITS - largest.leading_zeros()
    }
}

/// Image, view and sampler of one texture.
pub struct Texture {
    image: GpuImage,
    view: vk::ImageView,
    sampler: vk::Sampler,
}

impl Texture {
    /// Image view covering every mip level.
    pub const fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Sampler matching the mip chain.
    pub const fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Number of mip levels.
    pub const fn mip_levels(&self) -> u32 {
        self.image.mip_levels
    }

    /// Size of mip level 0.
    pub const fn extent(&self) -> vk::Extent3D {
        self.image.extent
    }

    unsafe fn destroy(mut self, device: &ash::Device, allocator: &mut GpuAllocator) -> Result<()> {
        unsafe {
            device.destroy_sampler(self.sampler, None);
            device.destroy_image_view(self.view, None);
        }
        allocator.free_image(&mut self.image)?;
        Ok(())
    }
}

/// Layout change of a mip range.
#[derive(Clone, Copy)]
struct Transition {
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
}

impl Transition {
    const UNDEFINED_TO_TRANSFER_DST: Self = Self {
        old_layout: vk::ImageLayout::UNDEFINED,
        new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        src_access: vk::AccessFlags::empty(),
        dst_access: vk::AccessFlags::TRANSFER_WRITE,
        src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
        dst_stage: vk::PipelineStageFlags::TRANSFER,
    };

    const TRANSFER_DST_TO_SRC: Self = Self {
        old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        src_access: vk::AccessFlags::TRANSFER_WRITE,
        dst_access: vk::AccessFlags::TRANSFER_READ,
        src_stage: vk::PipelineStageFlags::TRANSFER,
        dst_stage: vk::PipelineStageFlags::TRANSFER,
    };

    const TRANSFER_SRC_TO_SHADER: Self = Self {
        old_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        src_access: vk::AccessFlags::TRANSFER_READ,
        dst_access: vk::AccessFlags::SHADER_READ,
        src_stage: vk::PipelineStageFlags::TRANSFER,
        dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
    };

    const TRANSFER_DST_TO_SHADER: Self = Self {
        old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        src_access: vk::AccessFlags::TRANSFER_WRITE,
        dst_access: vk::AccessFlags::SHADER_READ,
        src_stage: vk::PipelineStageFlags::TRANSFER,
        dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
    };

    unsafe fn record(
        self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        base_mip: u32,
        levels: u32,
    ) {
        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(base_mip)
                    .level_count(levels)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                self.src_stage,
                self.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

fn color_layer(mip: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(mip)
        .base_array_layer(0)
        .layer_count(1)
}

const fn mip_size(size: u32, mip: u32) -> i32 {
    let scaled = size >> mip;
    if scaled == 0 {
        1
    } else {
        scaled as i32
    }
}

unsafe fn record_mip_chain(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
    levels: u32,
) {
    for mip in 1..levels {
        let src_offsets = [
            vk::Offset3D::default(),
            vk::Offset3D {
                x: mip_size(width, mip - 1),
                y: mip_size(height, mip - 1),
                z: 1,
            },
        ];
        let dst_offsets = [
            vk::Offset3D::default(),
            vk::Offset3D {
                x: mip_size(width, mip),
                y: mip_size(height, mip),
                z: 1,
            },
        ];
        let blit = vk::ImageBlit::default()
            .src_subresource(color_layer(mip - 1))
            .src_offsets(src_offsets)
            .dst_subresource(color_layer(mip))
            .dst_offsets(dst_offsets);

        unsafe {
            Transition::TRANSFER_DST_TO_SRC.record(device, cmd, image, mip - 1, 1);
            device.cmd_blit_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );
            Transition::TRANSFER_SRC_TO_SHADER.record(device, cmd, image, mip - 1, 1);
        }
    }
    unsafe {
        Transition::TRANSFER_DST_TO_SHADER.record(device, cmd, image, levels - 1, 1);
    }
}

struct TextureSlot {
    generation: u32,
    texture: Option<Texture>,
}

/// Owner of every texture plus the staging buffers still read by the GPU.
pub struct TextureManager {
    slots: Vec<TextureSlot>,
    free: Vec<u32>,
    staging: DeferredDeletionQueue<GpuBuffer>,
    retired: DeferredDeletionQueue<Texture>,
}

impl TextureManager {
    /// Create an empty manager.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            staging: DeferredDeletionQueue::new(frames_in_flight),
            retired: DeferredDeletionQueue::new(frames_in_flight),
        }
    }

    /// Create a texture from tightly packed RGBA8 `pixels`, recording the
    /// upload into `cmd`.
    ///
    /// # Safety
    /// `cmd` must be the prepared frame's open upload buffer, and
    /// `frame_number` the frame it will be submitted with.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn create(
        &mut self,
        gpu: &GpuContext,
        cmd: vk::CommandBuffer,
        frame_number: u64,
        pixels: &[u8],
        (width, height): (u32, u32),
        name: &str,
    ) -> Result<TextureId> {
        let expected = (width as usize) * (height as usize) * 4;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(RenderError::InvalidData(format!(
                "'{name}': {} bytes for a {width}x{height} RGBA image",
                pixels.len()
            )));
        }

        let device = gpu.device();
        let format_properties = unsafe {
            gpu.instance()
                .get_physical_device_format_properties(gpu.physical_device(), TEXTURE_FORMAT)
        };
        let blittable = format_properties.optimal_tiling_features.contains(
            vk::FormatFeatureFlags::BLIT_SRC
                | vk::FormatFeatureFlags::BLIT_DST
                | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
        );
        let levels = if blittable {
            mip_levels(width, height)
        } else {
            tracing::warn!("{TEXTURE_FORMAT:?} does not support linear blits; '{name}' gets no mipmaps");
            1
        };

        let mut allocator = gpu.allocator().lock();
        let mut staging = allocator.create_buffer(
            pixels.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            &format!("{name} staging"),
        )?;
        if let Err(e) = staging.write_bytes(0, pixels) {
            allocator.free_buffer(&mut staging)?;
            return Err(e.into());
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(TEXTURE_FORMAT)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let mut image = match allocator.create_image(&image_info, MemoryLocation::GpuOnly, name) {
            Ok(image) => image,
            Err(e) => {
                allocator.free_buffer(&mut staging)?;
                return Err(e.into());
            }
        };

        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(color_layer(0))
            .image_offset(vk::Offset3D::default())
            .image_extent(image_info.extent);

        unsafe {
            Transition::UNDEFINED_TO_TRANSFER_DST.record(device, cmd, image.image, 0, levels);
            device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            record_mip_chain(device, cmd, image.image, width, height, levels);
        }
        self.staging.queue(staging, frame_number);

        let view = match unsafe {
            create_image_view(
                device,
                image.image,
                TEXTURE_FORMAT,
                vk::ImageAspectFlags::COLOR,
                levels,
            )
        } {
            Ok(view) => view,
            Err(e) => {
                allocator.free_image(&mut image)?;
                return Err(e.into());
            }
        };

        let capabilities = gpu.capabilities();
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(capabilities.supports_sampler_anisotropy)
            .max_anisotropy(capabilities.max_sampler_anisotropy.max(1.0))
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .compare_enable(false)
            .min_lod(0.0)
            .max_lod(levels as f32);
        let sampler = match unsafe { device.create_sampler(&sampler_info, None) } {
            Ok(sampler) => sampler,
            Err(e) => {
                unsafe { device.destroy_image_view(view, None) };
                allocator.free_image(&mut image)?;
                return Err(RenderError::Gpu(e.into()));
            }
        };

        tracing::debug!("Created texture '{}' ({}x{}, {} mips)", name, width, height, levels);
        Ok(self.insert(Texture {
            image,
            view,
            sampler,
        }))
    }

    fn insert(&mut self, texture: Texture) -> TextureId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.texture = Some(texture);
            TextureId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(TextureSlot {
                generation: 0,
                texture: Some(texture),
            });
            TextureId {
                index,
                generation: 0,
            }
        }
    }

    /// Look up a texture.
    pub fn texture(&self, id: TextureId) -> Result<&Texture> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.texture.as_ref())
            .ok_or(RenderError::UnknownTexture(id))
    }

    /// Retire a texture; it is destroyed once no frame in flight can sample it.
    pub fn destroy(&mut self, id: TextureId, frame_number: u64) -> Result<()> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(RenderError::UnknownTexture(id))?;
        let texture = slot.texture.take().ok_or(RenderError::UnknownTexture(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.retired.queue(texture, frame_number);
        Ok(())
    }

    /// Free staging buffers and retired textures whose frames have completed.
    ///
    /// # Safety
    /// `frame_number` must be the frame just prepared, after its slot fence
    /// was waited on.
    pub unsafe fn update(&mut self, gpu: &GpuContext, frame_number: u64) -> Result<()> {
        let mut allocator = gpu.allocator().lock();
        self.staging.process(frame_number, |mut buffer| {
            allocator.free_buffer(&mut buffer)
        })?;
        self.retired.process(frame_number, |texture| unsafe {
            texture.destroy(gpu.device(), &mut allocator)
        })?;
        Ok(())
    }

    /// Add every live texture to `view`.
    pub fn extend_view(&self, view: &mut ResourceView) {
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(texture) = slot.texture.as_ref() {
                view.insert_texture(
                    TextureId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    TextureBinding {
                        view: texture.view,
                        sampler: texture.sampler,
                    },
                );
            }
        }
    }

    /// Number of staging buffers still awaiting release.
    pub fn pending_staging(&self) -> usize {
        self.staging.pending_count()
    }

    /// Destroy everything.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn flush(&mut self, gpu: &GpuContext) -> Result<()> {
        let mut allocator = gpu.allocator().lock();
        self.staging
            .flush(|mut buffer| allocator.free_buffer(&mut buffer))?;
        self.retired
            .flush(|texture| unsafe { texture.destroy(gpu.device(), &mut allocator) })?;
        for slot in &mut self.slots {
            if let Some(texture) = slot.texture.take() {
                unsafe { texture.destroy(gpu.device(), &mut allocator) }?;
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.free = (0..self.slots.len() as u32).collect();
        Ok(())
    }
}
