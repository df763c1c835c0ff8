//! Per-frame GPU resources.
//!
//! A [`FrameResource`] keeps its logical payload on the CPU and one physical,
//! persistently mapped copy per frame in flight. Writes from the CPU land in
//! the payload immediately; each slot's copy is brought up to date by
//! [`FrameResource::update`] only once that slot's fence has been observed, so
//! the GPU never reads a copy while it is rewritten.

use ash::vk;
use bytemuck::Pod;
use framewise_core::FrameSlot;
use framewise_gpu::{BufferBackend, FencedSlot};

use crate::error::{RenderError, Result};

/// Pending-upload state of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirtyMarker {
    /// Every copy matches the payload.
    Clean,
    /// Copies are stale. `origin` is the first slot refreshed since the last
    /// write; reaching it again means every slot has been refreshed.
    Pending { origin: Option<FrameSlot> },
    /// Refresh every copy on the next update after waiting for device idle.
    PendingImmediate,
}

/// How the GPU consumes a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Vertex,
    Index,
    Uniform,
}

impl ResourceKind {
    /// Buffer usage for this kind.
    pub const fn usage(self) -> vk::BufferUsageFlags {
        match self {
            Self::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            Self::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        }
    }
}

struct SlotCopy<T> {
    buffer: T,
    size: u64,
}

/// CPU payload plus per-slot GPU copies.
pub struct FrameResource<B: BufferBackend> {
    name: String,
    kind: ResourceKind,
    stride: usize,
    count: usize,
    data: Vec<u8>,
    copies: Vec<Option<SlotCopy<B::Buffer>>>,
    dirty: DirtyMarker,
}

impl<B: BufferBackend> FrameResource<B> {
    /// Create an empty resource with one copy slot per frame in flight.
    pub fn new(kind: ResourceKind, frames_in_flight: usize, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            stride: 0,
            count: 0,
            data: Vec::new(),
            copies: (0..frames_in_flight).map(|_| None).collect(),
            dirty: DirtyMarker::Clean,
        }
    }

    /// Replace the payload with `data`; copies follow over the next
    /// `frames_in_flight` updates.
    pub fn set_data<T: Pod>(&mut self, data: &[T]) {
        self.store(std::mem::size_of::<T>(), data.len(), bytemuck::cast_slice(data));
        self.dirty = DirtyMarker::Pending { origin: None };
    }

    /// Replace the payload with `data`; the next update waits for device idle
    /// and refreshes every copy at once.
    pub fn set_data_immediate<T: Pod>(&mut self, data: &[T]) {
        self.store(std::mem::size_of::<T>(), data.len(), bytemuck::cast_slice(data));
        self.dirty = DirtyMarker::PendingImmediate;
    }

    /// Replace the payload with raw bytes laid out as `count` elements of
    /// `stride` bytes.
    pub fn set_bytes(&mut self, stride: usize, count: usize, bytes: &[u8]) -> Result<()> {
        if stride.checked_mul(count) != Some(bytes.len()) {
            return Err(RenderError::InvalidData(format!(
                "'{}': {} bytes is not {count} elements of {stride} bytes",
                self.name,
                bytes.len()
            )));
        }
        self.store(stride, count, bytes);
        self.dirty = DirtyMarker::Pending { origin: None };
        Ok(())
    }

    fn store(&mut self, stride: usize, count: usize, bytes: &[u8]) {
        self.stride = stride;
        self.count = count;
        self.data.clear();
        self.data.extend_from_slice(bytes);
    }

    /// Bring the copy for `slot` up to date.
    ///
    /// Returns true if any copy was written.
    pub fn update(&mut self, slot: FencedSlot, backend: &mut B) -> Result<bool> {
        match self.dirty {
            DirtyMarker::Clean => Ok(false),
            DirtyMarker::PendingImmediate => {
                backend.wait_idle()?;
                for index in 0..self.copies.len() {
                    self.upload(index, backend)?;
                }
                self.dirty = DirtyMarker::Clean;
                Ok(true)
            }
            DirtyMarker::Pending { origin: Some(origin) } if origin == slot.slot() => {
                self.dirty = DirtyMarker::Clean;
                Ok(false)
            }
            DirtyMarker::Pending { origin } => {
                if origin.is_none() {
                    self.dirty = DirtyMarker::Pending {
                        origin: Some(slot.slot()),
                    };
                }
                self.upload(slot.index(), backend)?;
                Ok(true)
            }
        }
    }

    fn upload(&mut self, index: usize, backend: &mut B) -> Result<()> {
        let size = self.byte_size();
        let frames_in_flight = self.copies.len();
        let entry = self.copies.get_mut(index).ok_or(RenderError::Core(
            framewise_core::Error::SlotOutOfRange {
                slot: index,
                frames_in_flight,
            },
        ))?;

        if entry.as_ref().is_some_and(|copy| copy.size != size) {
            if let Some(copy) = entry.take() {
                backend.destroy_buffer(copy.buffer)?;
            }
        }

        if self.count == 0 {
            return Ok(());
        }

        if entry.is_none() {
            let buffer = backend.create_host_buffer(
                size,
                self.kind.usage(),
                &format!("{} [slot {index}]", self.name),
            )?;
            tracing::debug!("Allocated '{}' slot {} ({} bytes)", self.name, index, size);
            *entry = Some(SlotCopy { buffer, size });
        }

        if let Some(copy) = entry.as_mut() {
            backend.write_buffer(&mut copy.buffer, &self.data)?;
        }
        Ok(())
    }

    /// Destroy every physical copy.
    ///
    /// Only valid once no frame that could read them is in flight.
    pub fn destroy(self, backend: &mut B) -> Result<()> {
        for copy in self.copies.into_iter().flatten() {
            backend.destroy_buffer(copy.buffer)?;
        }
        Ok(())
    }

    /// Vulkan buffer holding `slot`'s copy, if one exists.
    pub fn buffer(&self, slot: FrameSlot) -> Option<vk::Buffer> {
        self.copies
            .get(slot.index())
            .and_then(Option::as_ref)
            .map(|copy| B::raw_buffer(&copy.buffer))
    }

    /// Byte size of `slot`'s copy, if one exists.
    pub fn copy_size(&self, slot: FrameSlot) -> Option<u64> {
        self.copies
            .get(slot.index())
            .and_then(Option::as_ref)
            .map(|copy| copy.size)
    }

    /// Debug name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Usage kind.
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Element size in bytes.
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// Number of elements in the payload.
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Payload size in bytes.
    pub const fn byte_size(&self) -> u64 {
        (self.stride * self.count) as u64
    }

    /// Current dirty marker.
    pub const fn dirty(&self) -> DirtyMarker {
        self.dirty
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use framewise_gpu::Result as GpuResult;
    use hashbrown::HashMap;

    /// Buffer backend that tracks live allocations in memory.
    #[derive(Default)]
    pub(crate) struct MemoryBackend {
        pub(crate) next_id: u64,
        pub(crate) live: HashMap<u64, Vec<u8>>,
        pub(crate) created: usize,
        pub(crate) destroyed: usize,
        pub(crate) writes: usize,
        pub(crate) idle_waits: usize,
    }

    pub(crate) struct MemoryBuffer {
        pub(crate) id: u64,
    }

    impl BufferBackend for MemoryBackend {
        type Buffer = MemoryBuffer;

        fn create_host_buffer(
            &mut self,
            size: u64,
            _usage: vk::BufferUsageFlags,
            _name: &str,
        ) -> GpuResult<MemoryBuffer> {
            self.next_id += 1;
            self.created += 1;
            self.live.insert(self.next_id, vec![0; size as usize]);
            Ok(MemoryBuffer { id: self.next_id })
        }

        fn destroy_buffer(&mut self, buffer: MemoryBuffer) -> GpuResult<()> {
            assert!(self.live.remove(&buffer.id).is_some(), "double free");
            self.destroyed += 1;
            Ok(())
        }

        fn write_buffer(&mut self, buffer: &mut MemoryBuffer, data: &[u8]) -> GpuResult<()> {
            let memory = self.live.get_mut(&buffer.id).expect("write to freed buffer");
            memory[..data.len()].copy_from_slice(data);
            self.writes += 1;
            Ok(())
        }

        fn raw_buffer(buffer: &MemoryBuffer) -> vk::Buffer {
            vk::Handle::from_raw(buffer.id)
        }

        fn wait_idle(&mut self) -> GpuResult<()> {
            self.idle_waits += 1;
            Ok(())
        }
    }

    pub(crate) fn fenced(index: usize) -> FencedSlot {
        unsafe { FencedSlot::assume_signaled(FrameSlot::new(index, 4).unwrap()) }
    }

    fn contents(
        resource: &FrameResource<MemoryBackend>,
        backend: &MemoryBackend,
        slot: usize,
    ) -> Vec<u8> {
        let handle = resource.buffer(fenced(slot).slot()).expect("copy exists");
        backend.live[&vk::Handle::as_raw(handle)].clone()
    }

    #[test]
    fn pending_write_reaches_every_slot_then_cleans() {
        let mut backend = MemoryBackend::default();
        let mut resource = FrameResource::new(ResourceKind::Uniform, 2, "camera");
        resource.set_data(&[1u32, 2, 3]);

        assert!(resource.update(fenced(0), &mut backend).unwrap());
        assert_eq!(
            resource.dirty(),
            DirtyMarker::Pending {
                origin: Some(fenced(0).slot())
            }
        );
        assert!(resource.update(fenced(1), &mut backend).unwrap());
        assert!(!resource.update(fenced(0), &mut backend).unwrap());
        assert_eq!(resource.dirty(), DirtyMarker::Clean);

        let expected: Vec<u8> = bytemuck::cast_slice(&[1u32, 2, 3]).to_vec();
        assert_eq!(contents(&resource, &backend, 0), expected);
        assert_eq!(contents(&resource, &backend, 1), expected);
    }

    #[test]
    fn clean_update_touches_nothing() {
        let mut backend = MemoryBackend::default();
        let mut resource = FrameResource::new(ResourceKind::Vertex, 2, "quad");
        resource.set_data(&[0.5f32; 4]);
        for slot in [0, 1, 0] {
            resource.update(fenced(slot), &mut backend).unwrap();
        }
        let (created, destroyed, writes) = (backend.created, backend.destroyed, backend.writes);

        for slot in [1, 0, 1, 0] {
            assert!(!resource.update(fenced(slot), &mut backend).unwrap());
        }
        assert_eq!(
            (backend.created, backend.destroyed, backend.writes),
            (created, destroyed, writes)
        );
    }

    #[test]
    fn write_while_pending_restarts_cycle() {
        let mut backend = MemoryBackend::default();
        let mut resource = FrameResource::new(ResourceKind::Uniform, 2, "light");
        resource.set_data(&[1u32]);
        resource.update(fenced(0), &mut backend).unwrap();

        resource.set_data(&[2u32]);
        resource.update(fenced(1), &mut backend).unwrap();
        // Origin is now slot 1, so slot 0 must still be refreshed
        assert!(resource.update(fenced(0), &mut backend).unwrap());
        assert!(!resource.update(fenced(1), &mut backend).unwrap());
        assert_eq!(contents(&resource, &backend, 0), 2u32.to_ne_bytes().to_vec());
    }

    #[test]
    fn immediate_write_waits_idle_and_fills_all_slots() {
        let mut backend = MemoryBackend::default();
        let mut resource = FrameResource::new(ResourceKind::Vertex, 3, "mesh");
        resource.set_data_immediate(&[7u16, 8]);

        assert!(resource.update(fenced(1), &mut backend).unwrap());
        assert_eq!(backend.idle_waits, 1);
        assert_eq!(backend.created, 3);
        assert_eq!(resource.dirty(), DirtyMarker::Clean);
        for slot in 0..3 {
            assert_eq!(contents(&resource, &backend, slot), vec![7, 0, 8, 0]);
        }
    }

    #[test]
    fn size_change_reallocates_copy() {
        let mut backend = MemoryBackend::default();
        let mut resource = FrameResource::new(ResourceKind::Index, 1, "indices");
        resource.set_data(&[0u32, 1, 2]);
        resource.update(fenced(0), &mut backend).unwrap();
        resource.set_data(&[0u32, 1, 2, 2, 3, 0]);
        resource.update(fenced(0), &mut backend).unwrap();

        assert_eq!(backend.created, 2);
        assert_eq!(backend.destroyed, 1);
        assert_eq!(resource.copy_size(fenced(0).slot()), Some(24));
    }

    #[test]
    fn empty_resource_never_allocates() {
        let mut backend = MemoryBackend::default();
        let mut resource = FrameResource::new(ResourceKind::Vertex, 2, "empty");
        resource.set_data::<f32>(&[]);
        for slot in [0, 1, 0, 1] {
            resource.update(fenced(slot), &mut backend).unwrap();
        }
        assert_eq!(backend.created, 0);
        assert!(resource.buffer(fenced(0).slot()).is_none());

        resource.set_data(&[1.0f32]);
        resource.update(fenced(1), &mut backend).unwrap();
        assert_eq!(backend.created, 1);
        assert!(resource.buffer(fenced(1).slot()).is_some());
    }

    #[test]
    fn shrinking_to_zero_releases_copies() {
        let mut backend = MemoryBackend::default();
        let mut resource = FrameResource::new(ResourceKind::Vertex, 2, "shrink");
        resource.set_data(&[1u8, 2]);
        resource.update(fenced(0), &mut backend).unwrap();
        resource.update(fenced(1), &mut backend).unwrap();

        resource.set_data::<u8>(&[]);
        resource.update(fenced(0), &mut backend).unwrap();
        resource.update(fenced(1), &mut backend).unwrap();
        assert!(backend.live.is_empty());
    }

    #[test]
    fn set_bytes_validates_layout() {
        let mut resource: FrameResource<MemoryBackend> =
            FrameResource::new(ResourceKind::Vertex, 2, "raw");
        assert!(resource.set_bytes(12, 2, &[0; 24]).is_ok());
        assert!(matches!(
            resource.set_bytes(12, 2, &[0; 20]),
            Err(RenderError::InvalidData(_))
        ));
    }

    #[test]
    fn destroy_frees_all_copies() {
        let mut backend = MemoryBackend::default();
        let mut resource = FrameResource::new(ResourceKind::Uniform, 2, "gone");
        resource.set_data_immediate(&[3u32]);
        resource.update(fenced(0), &mut backend).unwrap();
        resource.destroy(&mut backend).unwrap();
        assert!(backend.live.is_empty());
        assert_eq!(backend.destroyed, 2);
    }
}
