//! Read-only snapshot of resolved resource handles for one frame slot.

use ash::vk;
use hashbrown::HashMap;

use crate::buffer_manager::ResourceId;
use crate::texture::TextureId;

/// A buffer copy as seen by command recording.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBinding {
    pub buffer: vk::Buffer,
    /// Element size in bytes.
    pub stride: usize,
    /// Number of elements.
    pub count: usize,
    /// Byte size of the copy.
    pub size: u64,
}

impl BufferBinding {
    /// Index type implied by the element size, if it is a valid one.
    pub const fn index_type(&self) -> Option<vk::IndexType> {
        match self.stride {
            2 => Some(vk::IndexType::UINT16),
            4 => Some(vk::IndexType::UINT32),
            _ => None,
        }
    }
}

/// A sampled texture as seen by command recording.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureBinding {
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

/// Handles valid for one slot, shared with every recording worker.
///
/// Resources without a copy for the slot are absent, so lookups double as the
/// validity check.
#[derive(Default, Debug)]
pub struct ResourceView {
    buffers: HashMap<ResourceId, BufferBinding>,
    textures: HashMap<TextureId, TextureBinding>,
}

impl ResourceView {
    /// Empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a buffer binding.
    pub fn insert_buffer(&mut self, id: ResourceId, binding: BufferBinding) {
        self.buffers.insert(id, binding);
    }

    /// Record a texture binding.
    pub fn insert_texture(&mut self, id: TextureId, binding: TextureBinding) {
        self.textures.insert(id, binding);
    }

    /// Buffer bound to `id`, if valid for this slot.
    pub fn buffer(&self, id: ResourceId) -> Option<&BufferBinding> {
        self.buffers.get(&id)
    }

    /// Texture bound to `id`, if valid.
    pub fn texture(&self, id: TextureId) -> Option<&TextureBinding> {
        self.textures.get(&id)
    }

    /// Number of buffers in the view.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_type_follows_stride() {
        let binding = |stride| BufferBinding {
            buffer: vk::Buffer::null(),
            stride,
            count: 3,
            size: (stride * 3) as u64,
        };
        assert_eq!(binding(2).index_type(), Some(vk::IndexType::UINT16));
        assert_eq!(binding(4).index_type(), Some(vk::IndexType::UINT32));
        assert_eq!(binding(12).index_type(), None);
    }
}
