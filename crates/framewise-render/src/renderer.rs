//! Frame orchestration over the swapchain cycle, resources and recording pool.

use std::sync::Arc;

use ash::vk;
use framewise_core::constants::{DEFAULT_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT};
use framewise_core::Extent;
use framewise_gpu::{
    DeferredDeletionQueue, DescriptorAllocator, FrameCycle, GpuAllocator, GpuContext,
    PreparedFrame, PresenterConfig, VulkanPresenter,
};

use crate::buffer_manager::BufferManager;
use crate::dispatcher::{CommandDispatcher, FrameTarget};
use crate::error::{RenderError, Result};
use crate::object::{ObjectDescriptors, ObjectRegistry, RenderObject, RenderObjectDesc};
use crate::pipeline_directory::{PipelineDescription, PipelineDirectory};
use crate::recorder::VulkanRecorder;
use crate::texture::{TextureId, TextureManager};

/// Descriptor sets allocated per pool.
const SETS_PER_POOL: u32 = 256;

/// Renderer settings.
#[derive(Clone, Copy, Debug)]
pub struct RendererConfig {
    /// Frames the CPU may prepare ahead of the GPU.
    pub frames_in_flight: usize,
    /// Recording worker threads.
    pub worker_threads: usize,
    /// Use FIFO presentation.
    pub vsync: bool,
    /// MSAA sample count; `None` picks the highest the device supports.
    pub msaa: Option<vk::SampleCountFlags>,
    /// Render pass clear color.
    pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            worker_threads: std::thread::available_parallelism().map_or(1, usize::from),
            vsync: true,
            msaa: None,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl RendererConfig {
    /// Set frames in flight.
    #[must_use]
    pub const fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the number of recording workers (at least 1).
    #[must_use]
    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers.max(1);
        self
    }

    /// Enable or disable vsync.
    #[must_use]
    pub const fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Request an MSAA sample count.
    #[must_use]
    pub const fn with_msaa(mut self, samples: vk::SampleCountFlags) -> Self {
        self.msaa = Some(samples);
        self
    }

    /// Set the clear color.
    #[must_use]
    pub const fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Check the settings are usable.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&self.frames_in_flight) {
            return Err(framewise_core::Error::InvalidConfig(format!(
                "frames_in_flight must be in 1..={MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            ))
            .into());
        }
        if self.worker_threads == 0 {
            return Err(framewise_core::Error::InvalidConfig(
                "worker_threads must be at least 1".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

/// Owns everything needed to turn render objects into presented frames.
///
/// Each frame is bracketed by [`Renderer::prep_next_frame`] and
/// [`Renderer::swap`]; resource writes, texture uploads and
/// [`Renderer::process_objects`] happen in between.
pub struct Renderer {
    dispatcher: CommandDispatcher<VulkanRecorder>,
    cycle: FrameCycle<VulkanPresenter>,
    buffers: BufferManager<GpuAllocator>,
    textures: TextureManager,
    directory: Arc<PipelineDirectory>,
    descriptors: DescriptorAllocator,
    retired_descriptors: DeferredDeletionQueue<ObjectDescriptors>,
    objects: ObjectRegistry,
    frame: Option<PreparedFrame>,
    buffers_ready: bool,
    recorded: bool,
    gpu: Arc<GpuContext>,
}

impl Renderer {
    /// Create the swapchain, compile `pipelines` and start the workers.
    pub fn new(
        gpu: Arc<GpuContext>,
        config: RendererConfig,
        extent: Extent,
        pipelines: &[PipelineDescription],
    ) -> Result<Self> {
        config.validate()?;

        let samples = config
            .msaa
            .unwrap_or(gpu.capabilities().max_usable_sample_count);
        let presenter = VulkanPresenter::new(
            Arc::clone(&gpu),
            PresenterConfig {
                frames_in_flight: config.frames_in_flight,
                vsync: config.vsync,
                samples,
                clear_color: config.clear_color,
            },
            extent,
        )?;

        let mut directory = unsafe {
            PipelineDirectory::build(
                gpu.device(),
                presenter.render_pass(),
                presenter.samples(),
                pipelines,
            )
        }?;

        let frames_in_flight = config.frames_in_flight;
        let dispatcher = match CommandDispatcher::new(config.worker_threads, |_| unsafe {
            VulkanRecorder::new(gpu.device_arc(), gpu.graphics_queue_family(), frames_in_flight)
        }) {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                unsafe { directory.destroy(gpu.device()) };
                return Err(e);
            }
        };

        let cycle = FrameCycle::new(presenter, frames_in_flight)?;

        tracing::info!(
            "Renderer ready: {} workers, {} frames in flight, {} pipelines",
            dispatcher.worker_count(),
            frames_in_flight,
            directory.len()
        );

        Ok(Self {
            dispatcher,
            cycle,
            buffers: BufferManager::new(frames_in_flight),
            textures: TextureManager::new(frames_in_flight),
            directory: Arc::new(directory),
            descriptors: DescriptorAllocator::new(SETS_PER_POOL),
            retired_descriptors: DeferredDeletionQueue::new(frames_in_flight),
            objects: ObjectRegistry::new(),
            frame: None,
            buffers_ready: false,
            recorded: false,
            gpu,
        })
    }

    /// GPU context.
    pub const fn gpu(&self) -> &Arc<GpuContext> {
        &self.gpu
    }

    /// Resource arena.
    pub const fn buffers(&self) -> &BufferManager<GpuAllocator> {
        &self.buffers
    }

    /// Resource arena for creating and writing resources.
    pub fn buffers_mut(&mut self) -> &mut BufferManager<GpuAllocator> {
        &mut self.buffers
    }

    /// Texture store.
    pub const fn textures(&self) -> &TextureManager {
        &self.textures
    }

    /// Compiled pipelines.
    pub fn directory(&self) -> &PipelineDirectory {
        &self.directory
    }

    /// Frame cycle state.
    pub const fn cycle(&self) -> &FrameCycle<VulkanPresenter> {
        &self.cycle
    }

    /// The prepared frame, if any.
    pub const fn current_frame(&self) -> Option<PreparedFrame> {
        self.frame
    }

    fn prepared(&self) -> Result<PreparedFrame> {
        self.frame.ok_or(RenderError::NoFramePrepared)
    }

    /// Wait for the next slot and acquire an image.
    ///
    /// The slot's buffer copies are refreshed later, by
    /// [`Renderer::process_objects`] or [`Renderer::swap`], so writes made
    /// after this call reach this frame. Returns `None` while `extent` is
    /// empty; callers skip the frame.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn prep_next_frame(&mut self, extent: Extent) -> Result<Option<PreparedFrame>> {
        if let Some(frame) = self.frame {
            return Ok(Some(frame));
        }
        let Some(frame) = self.cycle.prep_next_frame(extent)? else {
            return Ok(None);
        };

        unsafe { self.textures.update(&self.gpu, frame.frame_number) }?;

        let device = self.gpu.device();
        let descriptors = &self.descriptors;
        self.retired_descriptors
            .process(frame.frame_number, |retired| unsafe {
                descriptors.free(device, retired.pool, &retired.sets)
            })?;

        self.frame = Some(frame);
        self.buffers_ready = false;
        self.recorded = false;
        Ok(Some(frame))
    }

    /// Upload a texture from RGBA8 pixels through the prepared frame.
    pub fn create_texture(&mut self, pixels: &[u8], size: (u32, u32), name: &str) -> Result<TextureId> {
        let frame = self.prepared()?;
        let cmd = self.cycle.platform().upload_buffer(frame.image_index)?;
        unsafe {
            self.textures
                .create(&self.gpu, cmd, frame.frame_number, pixels, size, name)
        }
    }

    /// Retire a texture once in-flight frames are done with it.
    pub fn destroy_texture(&mut self, id: TextureId) -> Result<()> {
        self.textures.destroy(id, self.cycle.frame_number())
    }

    /// Build a drawable, allocating one descriptor set per slot if its
    /// pipeline reads uniforms or textures.
    pub fn create_object(&mut self, desc: RenderObjectDesc) -> Result<Arc<RenderObject>> {
        let set_layout = self
            .directory
            .pipeline_for(desc.kind())
            .and_then(|entry| entry.set_layout);

        let object = Arc::new(match set_layout {
            Some(layout) => {
                let layouts = vec![layout; self.cycle.frames_in_flight()];
                let (pool, sets) =
                    unsafe { self.descriptors.allocate(self.gpu.device(), &layouts) }?;
                RenderObject::new(desc).with_descriptors(ObjectDescriptors { pool, sets })
            }
            None => {
                if desc.has_descriptors() {
                    tracing::warn!(
                        "Object binds resources but {} has no descriptor layout",
                        desc.kind()
                    );
                }
                RenderObject::new(desc)
            }
        });
        self.objects.register(&object);
        Ok(object)
    }

    /// Release an object's descriptor sets once in-flight frames are done.
    ///
    /// The caller must hold the last reference.
    pub fn destroy_object(&mut self, object: Arc<RenderObject>) -> Result<()> {
        let object = Arc::try_unwrap(object).map_err(|_| {
            RenderError::InvalidData("object is still shared and cannot be destroyed".to_string())
        })?;
        if let Some(descriptors) = object.descriptors() {
            self.retired_descriptors
                .queue(descriptors.clone(), self.cycle.frame_number());
        }
        Ok(())
    }

    /// Refresh the slot's resources and record `objects` into the prepared
    /// frame.
    ///
    /// Viewport and scissor come from `extent`, clamped to the framebuffer.
    /// Resources no longer held by any live object are retired. Call at most
    /// once per frame.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn process_objects(&mut self, objects: &[Arc<RenderObject>], extent: Extent) -> Result<()> {
        let frame = self.prepared()?;
        if self.buffers_ready {
            return Err(RenderError::AlreadyRecorded(frame.frame_number));
        }
        let slot = frame.slot.slot();

        // Objects drawn without going through create_object count as held too
        let mut referenced = self.objects.resource_ids();
        referenced.extend(objects.iter().flat_map(|o| o.resource_ids()));
        let mut view = {
            let mut allocator = self.gpu.allocator().lock();
            self.buffers
                .prepare(frame.slot, referenced, frame.frame_number, &mut allocator)?
        };
        self.buffers_ready = true;
        self.textures.extend_view(&mut view);
        let view = Arc::new(view);

        let mut render = self.cycle.platform().target(frame.image_index)?;
        render.extent = vk::Extent2D {
            width: extent.width.min(render.extent.width),
            height: extent.height.min(render.extent.height),
        };
        let target = FrameTarget {
            slot,
            image_index: frame.image_index,
            render,
        };

        let objects: Arc<[Arc<RenderObject>]> = objects.iter().cloned().collect();
        let secondaries = self
            .dispatcher
            .dispatch(target, &objects, &view, &self.directory)?;

        self.cycle
            .platform()
            .record_primary(frame.image_index, &secondaries)?;
        self.recorded = true;
        tracing::trace!(
            "Recorded {} objects into {} secondaries for frame {}",
            objects.len(),
            secondaries.len(),
            frame.frame_number
        );
        Ok(())
    }

    /// Submit and present the prepared frame.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn swap(&mut self, extent: Extent) -> Result<()> {
        let frame = self.prepared()?;
        if !self.buffers_ready {
            // Keep every slot's catch-up going
            let mut allocator = self.gpu.allocator().lock();
            self.buffers.update(frame.slot, &mut allocator)?;
        }
        if !self.recorded {
            // Still clear and present the image
            self.cycle.platform().record_primary(frame.image_index, &[])?;
        }
        self.cycle.swap(extent)?;
        self.frame = None;
        self.buffers_ready = false;
        self.recorded = false;
        Ok(())
    }

    /// Block until the GPU is idle.
    pub fn wait_idle(&mut self) -> Result<()> {
        self.cycle.wait_idle()?;
        Ok(())
    }

    fn release_all(&mut self) -> Result<()> {
        self.gpu.wait_idle()?;
        self.dispatcher.shutdown();

        {
            let mut allocator = self.gpu.allocator().lock();
            self.buffers.flush(&mut allocator)?;
        }
        unsafe { self.textures.flush(&self.gpu) }?;

        let device = self.gpu.device();
        unsafe {
            self.descriptors.destroy(device);
            if let Some(directory) = Arc::get_mut(&mut self.directory) {
                directory.destroy(device);
            }
        }
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.release_all() {
            tracing::error!("Renderer shutdown failed: {}", e);
        }
    }
}
