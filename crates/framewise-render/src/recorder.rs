//! Vulkan secondary command buffer recorder run by each worker thread.

use std::sync::Arc;

use ash::vk;
use framewise_gpu::command::{begin_secondary_command_buffer, end_command_buffer, CommandPool};
use framewise_gpu::{write_combined_image_sampler, write_uniform_buffer};

use crate::dispatcher::{RecordTask, SecondaryRecorder};
use crate::error::Result;
use crate::object::RenderObject;
use crate::pipeline_directory::PipelineEntry;

/// Worker-owned command pool with one secondary buffer per frame slot.
pub struct VulkanRecorder {
    device: Arc<ash::Device>,
    pool: CommandPool,
    buffers: Vec<vk::CommandBuffer>,
}

impl VulkanRecorder {
    /// Create a pool on `queue_family` with `frames_in_flight` secondaries.
    ///
    /// # Safety
    /// The device must be valid and outlive the recorder.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        queue_family: u32,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let pool = unsafe {
            CommandPool::new(
                &device,
                queue_family,
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
        }?;
        let buffers = match unsafe {
            pool.allocate_command_buffers(
                &device,
                vk::CommandBufferLevel::SECONDARY,
                frames_in_flight as u32,
            )
        } {
            Ok(buffers) => buffers,
            Err(e) => {
                unsafe { pool.destroy(&device) };
                return Err(e.into());
            }
        };
        Ok(Self {
            device,
            pool,
            buffers,
        })
    }

    /// Point the object's descriptor set for this slot at the view's handles.
    ///
    /// Every binding is present; objects with a missing one are not drawn.
    unsafe fn refresh_descriptors(&self, task: &RecordTask, object: &RenderObject, set: vk::DescriptorSet) {
        for &(binding, id) in object.uniforms() {
            if let Some(buffer) = task.view.buffer(id) {
                unsafe {
                    write_uniform_buffer(&self.device, set, binding, buffer.buffer, 0, buffer.size);
                }
            }
        }
        for &(binding, id) in object.textures() {
            if let Some(texture) = task.view.texture(id) {
                unsafe {
                    write_combined_image_sampler(
                        &self.device,
                        set,
                        binding,
                        texture.view,
                        texture.sampler,
                    );
                }
            }
        }
    }

    unsafe fn record_object(
        &self,
        cmd: vk::CommandBuffer,
        task: &RecordTask,
        object: &RenderObject,
        entry: &PipelineEntry,
    ) {
        let device = &self.device;
        let slot = task.target.slot;

        if let Some(missing) = object.missing_binding(&task.view) {
            tracing::trace!("Skipping object: {} has no handle for {}", missing, slot);
            return;
        }

        let vertex_buffers: Vec<(u32, vk::Buffer)> = object
            .vertex_buffers()
            .iter()
            .filter_map(|binding| {
                task.view
                    .buffer(binding.resource)
                    .map(|buffer| (binding.binding, buffer.buffer))
            })
            .collect();

        let descriptor_set = object
            .descriptor_set(slot)
            .filter(|_| entry.set_layout.is_some());
        if let Some(set) = descriptor_set {
            unsafe { self.refresh_descriptors(task, object, set) };
        }

        let extent = task.target.render.extent;
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, entry.pipeline);

            for &(binding, buffer) in &vertex_buffers {
                device.cmd_bind_vertex_buffers(cmd, binding, &[buffer], &[0]);
            }

            if let (Some(range), Some(data)) = (entry.push_constants, object.push_constants()) {
                // Push constant updates must be a multiple of 4 bytes
                let len = data.len().min(range.size as usize) & !3;
                if len > 0 {
                    device.cmd_push_constants(cmd, entry.layout, range.stage_flags, 0, &data[..len]);
                }
            }

            if let Some(set) = descriptor_set {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    entry.layout,
                    0,
                    &[set],
                    &[],
                );
            }

            for draw in object.draws() {
                device.cmd_set_viewport(cmd, 0, &[viewport]);
                device.cmd_set_scissor(cmd, 0, &[scissor]);

                match draw.index {
                    Some(id) => {
                        let Some(buffer) = task.view.buffer(id) else {
                            tracing::trace!("Skipping draw: index resource {} has no copy for {}", id, slot);
                            continue;
                        };
                        let Some(index_type) = buffer.index_type() else {
                            tracing::warn!("Index resource {} has {}-byte elements", id, buffer.stride);
                            continue;
                        };
                        device.cmd_bind_index_buffer(cmd, buffer.buffer, 0, index_type);
                        device.cmd_draw_indexed(cmd, draw.count, 1, draw.offset, 0, 0);
                    }
                    None => device.cmd_draw(cmd, draw.count, 1, draw.offset, 0),
                }
            }
        }
    }
}

impl SecondaryRecorder for VulkanRecorder {
    type Output = vk::CommandBuffer;

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn record(&mut self, task: &RecordTask) -> Result<Option<vk::CommandBuffer>> {
        let objects = task.objects();
        if objects.is_empty() {
            return Ok(None);
        }

        let cmd = *self
            .buffers
            .get(task.target.slot.index())
            .ok_or(framewise_core::Error::SlotOutOfRange {
                slot: task.target.slot.index(),
                frames_in_flight: self.buffers.len(),
            })?;
        let render = task.target.render;

        // The slot fence was waited on before dispatch, so this slot's
        // secondary is no longer pending.
        unsafe {
            begin_secondary_command_buffer(&self.device, cmd, render.render_pass, render.framebuffer)?;
            for object in objects {
                match task.directory.pipeline_for(object.kind()) {
                    Some(entry) => self.record_object(cmd, task, object, entry),
                    None => tracing::warn!("No pipeline registered for {}; object skipped", object.kind()),
                }
            }
            end_command_buffer(&self.device, cmd)?;
        }
        Ok(Some(cmd))
    }
}

impl Drop for VulkanRecorder {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.pool.destroy(&self.device);
        }
    }
}
