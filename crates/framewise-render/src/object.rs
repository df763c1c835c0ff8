//! Drawable objects.

use std::fmt;
use std::sync::{Arc, Weak};

use ash::vk;
use bytemuck::Pod;
use framewise_core::{FrameSlot, PipelineKind};
use parking_lot::Mutex;

use crate::buffer_manager::ResourceId;
use crate::texture::TextureId;
use crate::view::ResourceView;

/// A vertex buffer bound to a pipeline input binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBinding {
    pub binding: u32,
    pub resource: ResourceId,
}

/// One draw of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawCall {
    /// Index resource, or `None` for a non-indexed draw.
    pub index: Option<ResourceId>,
    /// Vertex or index count.
    pub count: u32,
    /// First vertex or first index.
    pub offset: u32,
}

impl DrawCall {
    /// Non-indexed draw of `count` vertices starting at `offset`.
    pub const fn vertices(count: u32, offset: u32) -> Self {
        Self {
            index: None,
            count,
            offset,
        }
    }

    /// Indexed draw of `count` indices starting at `offset`.
    pub const fn indexed(index: ResourceId, count: u32, offset: u32) -> Self {
        Self {
            index: Some(index),
            count,
            offset,
        }
    }
}

/// Builder for a [`RenderObject`].
#[derive(Clone, Debug)]
pub struct RenderObjectDesc {
    kind: PipelineKind,
    vertex_buffers: Vec<VertexBinding>,
    uniforms: Vec<(u32, ResourceId)>,
    textures: Vec<(u32, TextureId)>,
    draws: Vec<DrawCall>,
    push_constants: Option<Vec<u8>>,
}

impl RenderObjectDesc {
    /// Start describing an object drawn with pipeline `kind`.
    pub const fn new(kind: PipelineKind) -> Self {
        Self {
            kind,
            vertex_buffers: Vec::new(),
            uniforms: Vec::new(),
            textures: Vec::new(),
            draws: Vec::new(),
            push_constants: None,
        }
    }

    /// Bind a vertex resource to input `binding`.
    #[must_use]
    pub fn vertex_buffer(mut self, binding: u32, resource: ResourceId) -> Self {
        self.vertex_buffers.push(VertexBinding { binding, resource });
        self
    }

    /// Bind a uniform resource to descriptor `binding`.
    #[must_use]
    pub fn uniform(mut self, binding: u32, resource: ResourceId) -> Self {
        self.uniforms.push((binding, resource));
        self
    }

    /// Bind a texture to descriptor `binding`.
    #[must_use]
    pub fn texture(mut self, binding: u32, texture: TextureId) -> Self {
        self.textures.push((binding, texture));
        self
    }

    /// Add a draw call.
    #[must_use]
    pub fn draw(mut self, draw: DrawCall) -> Self {
        self.draws.push(draw);
        self
    }

    /// Initial push constant payload.
    #[must_use]
    pub fn push_constants<T: Pod>(mut self, value: &T) -> Self {
        self.push_constants = Some(bytemuck::bytes_of(value).to_vec());
        self
    }

    /// Whether the object needs a descriptor set.
    pub fn has_descriptors(&self) -> bool {
        !self.uniforms.is_empty() || !self.textures.is_empty()
    }

    /// Pipeline the object is drawn with.
    pub const fn kind(&self) -> PipelineKind {
        self.kind
    }
}

/// Descriptor sets of an object, one per frame slot.
#[derive(Clone, Debug, Default)]
pub(crate) struct ObjectDescriptors {
    pub(crate) pool: usize,
    pub(crate) sets: Vec<vk::DescriptorSet>,
}

/// A drawable: pipeline tag, resource bindings and draw calls.
///
/// Shared with recording workers behind an `Arc`; only the push constant
/// payload is mutable after creation.
#[derive(Debug)]
pub struct RenderObject {
    kind: PipelineKind,
    vertex_buffers: Vec<VertexBinding>,
    uniforms: Vec<(u32, ResourceId)>,
    textures: Vec<(u32, TextureId)>,
    draws: Vec<DrawCall>,
    push_constants: Mutex<Option<Vec<u8>>>,
    descriptors: Option<ObjectDescriptors>,
}

impl RenderObject {
    /// Create an object without descriptor sets.
    pub fn new(desc: RenderObjectDesc) -> Self {
        Self {
            kind: desc.kind,
            vertex_buffers: desc.vertex_buffers,
            uniforms: desc.uniforms,
            textures: desc.textures,
            draws: desc.draws,
            push_constants: Mutex::new(desc.push_constants),
            descriptors: None,
        }
    }

    pub(crate) fn with_descriptors(mut self, descriptors: ObjectDescriptors) -> Self {
        self.descriptors = Some(descriptors);
        self
    }

    pub(crate) const fn descriptors(&self) -> Option<&ObjectDescriptors> {
        self.descriptors.as_ref()
    }

    /// Pipeline the object is drawn with.
    pub const fn kind(&self) -> PipelineKind {
        self.kind
    }

    /// Vertex buffer bindings.
    pub fn vertex_buffers(&self) -> &[VertexBinding] {
        &self.vertex_buffers
    }

    /// Uniform bindings as `(binding, resource)`.
    pub fn uniforms(&self) -> &[(u32, ResourceId)] {
        &self.uniforms
    }

    /// Texture bindings as `(binding, texture)`.
    pub fn textures(&self) -> &[(u32, TextureId)] {
        &self.textures
    }

    /// Draw calls in submission order.
    pub fn draws(&self) -> &[DrawCall] {
        &self.draws
    }

    /// Descriptor set for `slot`, if the object has one.
    pub fn descriptor_set(&self, slot: FrameSlot) -> Option<vk::DescriptorSet> {
        self.descriptors
            .as_ref()
            .and_then(|d| d.sets.get(slot.index()).copied())
    }

    /// Replace the push constant payload.
    pub fn set_push_constants<T: Pod>(&self, value: &T) {
        *self.push_constants.lock() = Some(bytemuck::bytes_of(value).to_vec());
    }

    /// Copy of the current push constant payload.
    pub fn push_constants(&self) -> Option<Vec<u8>> {
        self.push_constants.lock().clone()
    }

    /// First vertex, uniform or texture binding without a handle in `view`.
    ///
    /// Such an object cannot be drawn from `view`: its descriptor set would
    /// still point at whatever the binding held before.
    pub fn missing_binding(&self, view: &ResourceView) -> Option<MissingBinding> {
        if let Some(v) = self
            .vertex_buffers
            .iter()
            .find(|v| view.buffer(v.resource).is_none())
        {
            return Some(MissingBinding::Vertex(v.resource));
        }
        if let Some(&(_, id)) = self.uniforms.iter().find(|(_, id)| view.buffer(*id).is_none()) {
            return Some(MissingBinding::Uniform(id));
        }
        self.textures
            .iter()
            .find(|(_, id)| view.texture(*id).is_none())
            .map(|&(_, id)| MissingBinding::Texture(id))
    }

    /// Every buffer resource the object references.
    pub fn resource_ids(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.vertex_buffers
            .iter()
            .map(|v| v.resource)
            .chain(self.uniforms.iter().map(|&(_, id)| id))
            .chain(self.draws.iter().filter_map(|d| d.index))
    }
}

/// A binding whose resource is absent from a frame's view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissingBinding {
    Vertex(ResourceId),
    Uniform(ResourceId),
    Texture(TextureId),
}

impl fmt::Display for MissingBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vertex(id) => write!(f, "vertex resource {id}"),
            Self::Uniform(id) => write!(f, "uniform resource {id}"),
            Self::Texture(id) => write!(f, "texture {id}"),
        }
    }
}

/// Weak handles to every object the renderer created.
///
/// Resources held by a registered object stay alive for as long as the
/// object does, whether or not it is drawn in a given frame.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: Vec<Weak<RenderObject>>,
}

impl ObjectRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `object` until its last strong reference is dropped.
    pub fn register(&mut self, object: &Arc<RenderObject>) {
        self.objects.push(Arc::downgrade(object));
    }

    /// Forget dropped objects; returns how many are still alive.
    pub fn prune(&mut self) -> usize {
        self.objects.retain(|object| object.strong_count() > 0);
        self.objects.len()
    }

    /// Resources referenced by the objects still alive.
    pub fn resource_ids(&mut self) -> Vec<ResourceId> {
        self.prune();
        self.objects
            .iter()
            .filter_map(Weak::upgrade)
            .flat_map(|object| object.resource_ids().collect::<Vec<_>>())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_manager::BufferManager;
    use crate::resource::tests::{fenced, MemoryBackend};
    use crate::resource::ResourceKind;
    use crate::view::TextureBinding;

    #[test]
    fn resource_ids_cover_every_binding() {
        let mut manager: BufferManager<MemoryBackend> = BufferManager::new(2);
        let vertices = manager.create(ResourceKind::Vertex, "v");
        let indices = manager.create(ResourceKind::Index, "i");
        let camera = manager.create(ResourceKind::Uniform, "camera");

        let object = RenderObject::new(
            RenderObjectDesc::new(PipelineKind(1))
                .vertex_buffer(0, vertices)
                .uniform(0, camera)
                .draw(DrawCall::indexed(indices, 6, 0))
                .draw(DrawCall::vertices(3, 0)),
        );

        let ids: Vec<_> = object.resource_ids().collect();
        assert_eq!(ids, vec![vertices, camera, indices]);
    }

    #[test]
    fn push_constants_are_replaceable_through_shared_reference() {
        let object = RenderObject::new(
            RenderObjectDesc::new(PipelineKind(0)).push_constants(&glam::Mat4::IDENTITY),
        );
        assert_eq!(object.push_constants().map(|p| p.len()), Some(64));

        object.set_push_constants(&[1.0f32, 2.0]);
        assert_eq!(
            object.push_constants(),
            Some(bytemuck::cast_slice(&[1.0f32, 2.0]).to_vec())
        );
    }

    #[test]
    fn object_without_descriptors_has_no_sets() {
        let object = RenderObject::new(RenderObjectDesc::new(PipelineKind(0)));
        assert!(object.descriptor_set(FrameSlot::ZERO).is_none());
    }

    #[test]
    fn registry_forgets_dropped_objects() {
        let mut manager: BufferManager<MemoryBackend> = BufferManager::new(2);
        let mesh = manager.create(ResourceKind::Vertex, "mesh");
        let kept = Arc::new(RenderObject::new(
            RenderObjectDesc::new(PipelineKind(0)).vertex_buffer(0, mesh),
        ));
        let dropped = Arc::new(RenderObject::new(
            RenderObjectDesc::new(PipelineKind(0)).uniform(0, mesh),
        ));

        let mut registry = ObjectRegistry::new();
        registry.register(&kept);
        registry.register(&dropped);
        assert_eq!(registry.resource_ids(), vec![mesh, mesh]);

        drop(dropped);
        assert_eq!(registry.resource_ids(), vec![mesh]);
        assert_eq!(registry.prune(), 1);
    }

    #[test]
    fn missing_binding_reports_each_kind() {
        let mut backend = MemoryBackend::default();
        let mut manager: BufferManager<MemoryBackend> = BufferManager::new(2);
        let mesh = manager.create_vertex("mesh", &[0.0f32; 9]);
        let camera = manager.create(ResourceKind::Uniform, "camera");
        manager.update(fenced(0), &mut backend).unwrap();
        let albedo = TextureId::from_parts(0, 0);

        let object = RenderObject::new(
            RenderObjectDesc::new(PipelineKind(0))
                .vertex_buffer(0, mesh)
                .uniform(0, camera)
                .texture(1, albedo),
        );

        let mut view = manager.view(fenced(0).slot());
        assert_eq!(
            object.missing_binding(&view),
            Some(MissingBinding::Uniform(camera))
        );
        assert_eq!(
            object.missing_binding(&manager.view(fenced(1).slot())),
            Some(MissingBinding::Vertex(mesh))
        );

        manager.set_data(camera, &[1.0f32; 16]).unwrap();
        manager.update(fenced(0), &mut backend).unwrap();
        view = manager.view(fenced(0).slot());
        assert_eq!(
            object.missing_binding(&view),
            Some(MissingBinding::Texture(albedo))
        );

        view.insert_texture(
            albedo,
            TextureBinding {
                view: vk::ImageView::null(),
                sampler: vk::Sampler::null(),
            },
        );
        assert_eq!(object.missing_binding(&view), None);
    }
}
