//! Arena of frame resources addressed by small integer handles.
//!
//! The manager owns every [`FrameResource`]. Drawable objects refer to them by
//! [`ResourceId`]; once per frame [`BufferManager::prepare`] retires
//! resources no live object references any more, refreshes the fenced slot's
//! copies and snapshots them for recording.

use std::fmt;

use bytemuck::Pod;
use framewise_core::FrameSlot;
use framewise_gpu::{BufferBackend, DeferredDeletionQueue, FencedSlot};
use hashbrown::HashSet;

use crate::error::{RenderError, Result};
use crate::resource::{FrameResource, ResourceKind};
use crate::view::{BufferBinding, ResourceView};

/// Handle to a resource in a [`BufferManager`].
///
/// Carries a generation so a handle outliving its resource never aliases a
/// later one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    index: u32,
    generation: u32,
}

impl ResourceId {
    /// Arena index.
    pub const fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

struct Entry<B: BufferBackend> {
    resource: FrameResource<B>,
    /// Referenced by a live object in some earlier sweep.
    attached: bool,
    released: bool,
}

struct ArenaSlot<B: BufferBackend> {
    generation: u32,
    entry: Option<Entry<B>>,
}

/// Counters from one [`BufferManager::update`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateStats {
    /// Resources whose copies were written.
    pub uploaded: usize,
}

/// Owner of all frame resources.
pub struct BufferManager<B: BufferBackend> {
    slots: Vec<ArenaSlot<B>>,
    free: Vec<u32>,
    frames_in_flight: usize,
    retired: DeferredDeletionQueue<FrameResource<B>>,
}

impl<B: BufferBackend> BufferManager<B> {
    /// Create an empty manager.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            frames_in_flight,
            retired: DeferredDeletionQueue::new(frames_in_flight),
        }
    }

    /// Create an empty resource.
    pub fn create(&mut self, kind: ResourceKind, name: impl Into<String>) -> ResourceId {
        let entry = Entry {
            resource: FrameResource::new(kind, self.frames_in_flight, name),
            attached: false,
            released: false,
        };

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            ResourceId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(ArenaSlot {
                generation: 0,
                entry: Some(entry),
            });
            ResourceId {
                index,
                generation: 0,
            }
        }
    }

    /// Create a vertex resource holding `data`.
    pub fn create_vertex<T: Pod>(&mut self, name: impl Into<String>, data: &[T]) -> ResourceId {
        let id = self.create(ResourceKind::Vertex, name);
        if let Ok(entry) = self.entry_mut(id) {
            entry.resource.set_data(data);
        }
        id
    }

    /// Create an index resource holding `indices` (`u16` or `u32`).
    pub fn create_index<T: Pod>(
        &mut self,
        name: impl Into<String>,
        indices: &[T],
    ) -> Result<ResourceId> {
        let stride = std::mem::size_of::<T>();
        if stride != 2 && stride != 4 {
            return Err(RenderError::InvalidData(format!(
                "Index elements must be 2 or 4 bytes, got {stride}"
            )));
        }
        let id = self.create(ResourceKind::Index, name);
        self.set_data(id, indices)?;
        Ok(id)
    }

    /// Create a uniform resource holding `value`.
    pub fn create_uniform<T: Pod>(&mut self, name: impl Into<String>, value: &T) -> ResourceId {
        let id = self.create(ResourceKind::Uniform, name);
        if let Ok(entry) = self.entry_mut(id) {
            entry.resource.set_data(std::slice::from_ref(value));
        }
        id
    }

    fn entry(&self, id: ResourceId) -> Result<&Entry<B>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(RenderError::UnknownResource(id))
    }

    fn entry_mut(&mut self, id: ResourceId) -> Result<&mut Entry<B>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(RenderError::UnknownResource(id))
    }

    /// Replace a resource's payload; copies follow over the next frames.
    pub fn set_data<T: Pod>(&mut self, id: ResourceId, data: &[T]) -> Result<()> {
        self.entry_mut(id)?.resource.set_data(data);
        Ok(())
    }

    /// Replace a resource's payload; every copy is refreshed on the next update.
    pub fn set_data_immediate<T: Pod>(&mut self, id: ResourceId, data: &[T]) -> Result<()> {
        self.entry_mut(id)?.resource.set_data_immediate(data);
        Ok(())
    }

    /// Look up a resource.
    pub fn resource(&self, id: ResourceId) -> Result<&FrameResource<B>> {
        Ok(&self.entry(id)?.resource)
    }

    /// Whether `id` names a live resource.
    pub fn contains(&self, id: ResourceId) -> bool {
        self.entry(id).is_ok()
    }

    /// Number of live resources.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    /// Whether no resources are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of retired resources waiting for their frames to finish.
    pub fn retired_count(&self) -> usize {
        self.retired.pending_count()
    }

    /// Mark a resource for retirement at the next sweep, referenced or not.
    pub fn release(&mut self, id: ResourceId) -> Result<()> {
        self.entry_mut(id)?.released = true;
        Ok(())
    }

    /// Refresh every live resource's copy for `slot`.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn update(&mut self, slot: FencedSlot, backend: &mut B) -> Result<UpdateStats> {
        let mut stats = UpdateStats::default();
        for entry in self.slots.iter_mut().filter_map(|s| s.entry.as_mut()) {
            if entry.resource.update(slot, backend)? {
                stats.uploaded += 1;
            }
        }
        Ok(stats)
    }

    /// Retire resources that are no longer referenced and destroy the ones
    /// whose frames have all completed.
    ///
    /// `referenced` lists every handle held by a live object, drawn this
    /// frame or not.
    /// A resource is retired if it was referenced in an earlier sweep and is
    /// not now, or if it was released. Resources never attached to an object
    /// are kept.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn sweep<I>(&mut self, referenced: I, frame_number: u64, backend: &mut B) -> Result<usize>
    where
        I: IntoIterator<Item = ResourceId>,
    {
        let live: HashSet<ResourceId> = referenced.into_iter().collect();
        let mut retired = 0;

        for (index, slot) in self.slots.iter_mut().enumerate() {
            let id = ResourceId {
                index: index as u32,
                generation: slot.generation,
            };
            let Some(entry) = slot.entry.as_mut() else {
                continue;
            };

            let referenced = live.contains(&id);
            if entry.released || (entry.attached && !referenced) {
                if let Some(entry) = slot.entry.take() {
                    tracing::debug!("Retiring '{}' at frame {}", entry.resource.name(), frame_number);
                    self.retired.queue(entry.resource, frame_number);
                }
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                retired += 1;
            } else if referenced {
                entry.attached = true;
            }
        }

        self.retired
            .process(frame_number, |resource| resource.destroy(backend))?;
        Ok(retired)
    }

    /// Sweep, refresh the fenced slot's copies and snapshot them.
    ///
    /// Run once per frame after the frame's writes, so the frame draws the
    /// data written for it.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn prepare<I>(
        &mut self,
        slot: FencedSlot,
        referenced: I,
        frame_number: u64,
        backend: &mut B,
    ) -> Result<ResourceView>
    where
        I: IntoIterator<Item = ResourceId>,
    {
        self.sweep(referenced, frame_number, backend)?;
        self.update(slot, backend)?;
        Ok(self.view(slot.slot()))
    }

    /// Snapshot of the buffers valid for `slot`.
    pub fn view(&self, slot: FrameSlot) -> ResourceView {
        let mut view = ResourceView::new();
        self.extend_view(slot, &mut view);
        view
    }

    /// Add the buffers valid for `slot` to `view`.
    pub fn extend_view(&self, slot: FrameSlot, view: &mut ResourceView) {
        for (index, arena_slot) in self.slots.iter().enumerate() {
            let Some(entry) = arena_slot.entry.as_ref() else {
                continue;
            };
            let resource = &entry.resource;
            if let (Some(buffer), Some(size)) = (resource.buffer(slot), resource.copy_size(slot)) {
                view.insert_buffer(
                    ResourceId {
                        index: index as u32,
                        generation: arena_slot.generation,
                    },
                    BufferBinding {
                        buffer,
                        stride: resource.stride(),
                        count: resource.count(),
                        size,
                    },
                );
            }
        }
    }

    /// Destroy every resource, live or retired.
    ///
    /// Only valid after the device is idle.
    pub fn flush(&mut self, backend: &mut B) -> Result<()> {
        self.retired.flush(|resource| resource.destroy(backend))?;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot.entry.take() {
                entry.resource.destroy(backend)?;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::tests::{fenced, MemoryBackend};
    use crate::resource::DirtyMarker;

    #[test]
    fn every_slot_holds_latest_data_after_frames_in_flight_updates() {
        let mut backend = MemoryBackend::default();
        let mut manager = BufferManager::new(3);
        let id = manager.create_uniform("params", &[1.0f32, 2.0, 3.0, 4.0]);

        for slot in 0..3 {
            manager.update(fenced(slot), &mut backend).unwrap();
        }

        let expected: Vec<u8> = bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]).to_vec();
        for slot in 0..3 {
            let binding = *manager.view(fenced(slot).slot()).buffer(id).unwrap();
            assert_eq!(backend.live[&ash::vk::Handle::as_raw(binding.buffer)], expected);
        }
        manager.update(fenced(0), &mut backend).unwrap();
        assert_eq!(manager.resource(id).unwrap().dirty(), DirtyMarker::Clean);
    }

    #[test]
    fn view_omits_slots_without_copies() {
        let mut backend = MemoryBackend::default();
        let mut manager = BufferManager::new(2);
        let id = manager.create_vertex("tri", &[0u8; 36]);
        manager.update(fenced(0), &mut backend).unwrap();

        assert!(manager.view(fenced(0).slot()).buffer(id).is_some());
        assert!(manager.view(fenced(1).slot()).buffer(id).is_none());
        assert_eq!(manager.view(fenced(1).slot()).buffer_count(), 0);
    }

    #[test]
    fn index_elements_must_be_two_or_four_bytes() {
        let mut manager: BufferManager<MemoryBackend> = BufferManager::new(2);
        assert!(manager.create_index("u16", &[0u16, 1, 2]).is_ok());
        assert!(manager.create_index("u32", &[0u32, 1, 2]).is_ok());
        assert!(manager.create_index("u8", &[0u8, 1, 2]).is_err());
    }

    #[test]
    fn sweep_keeps_never_attached_resources() {
        let mut backend = MemoryBackend::default();
        let mut manager = BufferManager::new(2);
        let id = manager.create_vertex("loose", &[1u32]);
        assert_eq!(manager.sweep([], 0, &mut backend).unwrap(), 0);
        assert!(manager.contains(id));
    }

    #[test]
    fn sweep_retires_detached_resources_after_frames_in_flight() {
        let mut backend = MemoryBackend::default();
        let mut manager = BufferManager::new(2);
        let id = manager.create_vertex("mesh", &[1u32, 2]);
        manager.update(fenced(0), &mut backend).unwrap();
        manager.update(fenced(1), &mut backend).unwrap();

        manager.sweep([id], 10, &mut backend).unwrap();
        assert_eq!(manager.sweep([], 11, &mut backend).unwrap(), 1);
        assert!(!manager.contains(id));
        assert_eq!(manager.retired_count(), 1);
        assert_eq!(backend.live.len(), 2);

        manager.sweep([], 12, &mut backend).unwrap();
        assert_eq!(backend.live.len(), 2);
        manager.sweep([], 13, &mut backend).unwrap();
        assert!(backend.live.is_empty());
        assert_eq!(manager.retired_count(), 0);
    }

    #[test]
    fn released_resource_retires_even_if_never_attached() {
        let mut backend = MemoryBackend::default();
        let mut manager = BufferManager::new(1);
        let id = manager.create_uniform("tmp", &7u32);
        manager.release(id).unwrap();
        assert_eq!(manager.sweep([], 0, &mut backend).unwrap(), 1);
        assert!(manager.set_data(id, &[1u32]).is_err());
    }

    #[test]
    fn stale_handle_does_not_alias_reused_slot() {
        let mut backend = MemoryBackend::default();
        let mut manager = BufferManager::new(1);
        let old = manager.create_uniform("a", &1u32);
        manager.release(old).unwrap();
        manager.sweep([], 0, &mut backend).unwrap();

        let new = manager.create_uniform("b", &2u32);
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert!(matches!(
            manager.resource(old),
            Err(RenderError::UnknownResource(_))
        ));
        assert!(manager.resource(new).is_ok());
    }

    #[test]
    fn flush_destroys_everything() {
        let mut backend = MemoryBackend::default();
        let mut manager = BufferManager::new(2);
        let a = manager.create_vertex("a", &[1u32]);
        manager.create_vertex("b", &[2u32]);
        manager.update(fenced(0), &mut backend).unwrap();
        manager.release(a).unwrap();
        manager.sweep([], 0, &mut backend).unwrap();

        manager.flush(&mut backend).unwrap();
        assert!(backend.live.is_empty());
        assert!(manager.is_empty());
    }

    #[test]
    fn live_object_left_out_of_a_frame_keeps_its_resources() {
        use std::sync::Arc;

        use framewise_core::PipelineKind;

        use crate::object::{DrawCall, ObjectRegistry, RenderObject, RenderObjectDesc};

        let mut backend = MemoryBackend::default();
        let mut manager = BufferManager::new(2);
        let mesh = manager.create_vertex("mesh", &[0.0f32; 9]);
        let object = Arc::new(RenderObject::new(
            RenderObjectDesc::new(PipelineKind(0))
                .vertex_buffer(0, mesh)
                .draw(DrawCall::vertices(3, 0)),
        ));
        let mut registry = ObjectRegistry::new();
        registry.register(&object);

        // Drawn once, then hidden for several frames
        for frame in 0..6u64 {
            let drawn: Vec<ResourceId> = if frame == 0 {
                object.resource_ids().collect()
            } else {
                Vec::new()
            };
            let referenced = registry.resource_ids().into_iter().chain(drawn);
            manager
                .prepare(fenced(frame as usize % 2), referenced, frame, &mut backend)
                .unwrap();
        }
        assert!(manager.contains(mesh));
        assert!(manager.set_data(mesh, &[1.0f32; 9]).is_ok());
        assert_eq!(manager.retired_count(), 0);
        assert_eq!(backend.live.len(), 2);

        drop(object);
        for frame in 6..9u64 {
            manager
                .prepare(fenced(frame as usize % 2), registry.resource_ids(), frame, &mut backend)
                .unwrap();
        }
        assert!(!manager.contains(mesh));
        assert!(backend.live.is_empty());
    }
}
