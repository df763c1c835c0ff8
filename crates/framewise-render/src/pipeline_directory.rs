//! Pipeline descriptions and the table mapping [`PipelineKind`] to compiled
//! pipelines.
//!
//! The directory is built once at startup and read-only afterwards, so
//! recording workers share it through an `Arc` without locking.

use ash::vk;
use framewise_core::PipelineKind;
use framewise_gpu::{DescriptorSetLayoutBuilder, GraphicsPipeline, GraphicsPipelineConfig, ShaderStage};
use hashbrown::HashMap;

use crate::error::{RenderError, Result};

/// One vertex attribute and the binding it is read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    pub binding: u32,
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
    /// Stride of the binding; every attribute of a binding must agree.
    pub stride: u32,
}

/// A uniform buffer the pipeline reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformDecl {
    pub binding: u32,
    pub stages: vk::ShaderStageFlags,
}

/// A combined image sampler the pipeline reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDecl {
    pub binding: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Everything needed to compile one pipeline.
#[derive(Clone, Debug)]
pub struct PipelineDescription {
    pub kind: PipelineKind,
    pub name: String,
    pub stages: Vec<ShaderStage>,
    pub attributes: Vec<VertexAttribute>,
    pub uniforms: Vec<UniformDecl>,
    pub textures: Vec<TextureDecl>,
    /// Push constant block size in bytes; zero for none.
    pub push_constant_size: u32,
    pub push_constant_stages: vk::ShaderStageFlags,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub depth_test: bool,
}

impl PipelineDescription {
    /// A triangle-list pipeline with depth testing and back-face culling.
    pub fn new(kind: PipelineKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            stages: Vec::new(),
            attributes: Vec::new(),
            uniforms: Vec::new(),
            textures: Vec::new(),
            push_constant_size: 0,
            push_constant_stages: vk::ShaderStageFlags::VERTEX,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::BACK,
            depth_test: true,
        }
    }

    /// Add a shader stage from SPIR-V words.
    #[must_use]
    pub fn stage(mut self, stage: vk::ShaderStageFlags, code: Vec<u32>) -> Self {
        self.stages.push(ShaderStage { stage, code });
        self
    }

    /// Add a vertex attribute.
    #[must_use]
    pub fn attribute(mut self, attribute: VertexAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Declare a uniform buffer.
    #[must_use]
    pub fn uniform(mut self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.uniforms.push(UniformDecl { binding, stages });
        self
    }

    /// Declare a sampled texture.
    #[must_use]
    pub fn texture(mut self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.textures.push(TextureDecl { binding, stages });
        self
    }

    /// Declare a push constant block.
    #[must_use]
    pub const fn push_constants(mut self, size: u32, stages: vk::ShaderStageFlags) -> Self {
        self.push_constant_size = size;
        self.push_constant_stages = stages;
        self
    }

    /// Primitive topology.
    #[must_use]
    pub const fn topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Face culling.
    #[must_use]
    pub const fn cull_mode(mut self, cull_mode: vk::CullModeFlags) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    /// Enable or disable depth testing and writes.
    #[must_use]
    pub const fn depth_test(mut self, enabled: bool) -> Self {
        self.depth_test = enabled;
        self
    }

    /// Vertex input bindings, one per distinct attribute binding, in binding
    /// order.
    pub fn vertex_bindings(&self) -> Result<Vec<vk::VertexInputBindingDescription>> {
        let mut bindings: Vec<vk::VertexInputBindingDescription> = Vec::new();
        for attribute in &self.attributes {
            match bindings.iter().find(|b| b.binding == attribute.binding) {
                Some(existing) if existing.stride != attribute.stride => {
                    return Err(RenderError::InvalidPipeline(format!(
                        "'{}': binding {} has strides {} and {}",
                        self.name, attribute.binding, existing.stride, attribute.stride
                    )));
                }
                Some(_) => {}
                None => bindings.push(
                    vk::VertexInputBindingDescription::default()
                        .binding(attribute.binding)
                        .stride(attribute.stride)
                        .input_rate(vk::VertexInputRate::VERTEX),
                ),
            }
        }
        bindings.sort_by_key(|b| b.binding);
        Ok(bindings)
    }

    /// Vertex input attributes.
    pub fn vertex_attributes(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .map(|a| {
                vk::VertexInputAttributeDescription::default()
                    .binding(a.binding)
                    .location(a.location)
                    .format(a.format)
                    .offset(a.offset)
            })
            .collect()
    }

    /// Push constant range, if a block is declared.
    pub fn push_constant_range(&self) -> Option<vk::PushConstantRange> {
        (self.push_constant_size > 0).then(|| {
            vk::PushConstantRange::default()
                .stage_flags(self.push_constant_stages)
                .offset(0)
                .size(self.push_constant_size)
        })
    }

    fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(RenderError::InvalidPipeline(format!(
                "'{}' has no shader stages",
                self.name
            )));
        }
        let mut descriptor_bindings: Vec<u32> = self
            .uniforms
            .iter()
            .map(|u| u.binding)
            .chain(self.textures.iter().map(|t| t.binding))
            .collect();
        descriptor_bindings.sort_unstable();
        if let Some(pair) = descriptor_bindings.windows(2).find(|w| w[0] == w[1]) {
            return Err(RenderError::InvalidPipeline(format!(
                "'{}' declares descriptor binding {} twice",
                self.name, pair[0]
            )));
        }
        if self.push_constant_size % 4 != 0 {
            return Err(RenderError::InvalidPipeline(format!(
                "'{}': push constant size {} is not a multiple of 4",
                self.name, self.push_constant_size
            )));
        }
        Ok(())
    }
}

/// A compiled pipeline and the layouts objects bind against.
#[derive(Debug)]
pub struct PipelineEntry {
    pub name: String,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    /// Descriptor set layout for set 0, if the pipeline reads uniforms or
    /// textures.
    pub set_layout: Option<vk::DescriptorSetLayout>,
    pub push_constants: Option<vk::PushConstantRange>,
}

impl PipelineEntry {
    unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            if let Some(set_layout) = self.set_layout {
                device.destroy_descriptor_set_layout(set_layout, None);
            }
        }
    }
}

/// Table of compiled pipelines keyed by kind.
#[derive(Debug, Default)]
pub struct PipelineDirectory {
    entries: HashMap<PipelineKind, PipelineEntry>,
}

impl PipelineDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile every description against `render_pass`.
    ///
    /// # Safety
    /// The device and render pass must be valid.
    pub unsafe fn build(
        device: &ash::Device,
        render_pass: vk::RenderPass,
        samples: vk::SampleCountFlags,
        descriptions: &[PipelineDescription],
    ) -> Result<Self> {
        let mut directory = Self::new();
        for description in descriptions {
            if directory.entries.contains_key(&description.kind) {
                unsafe { directory.destroy(device) };
                return Err(RenderError::DuplicatePipeline(description.kind));
            }
            match unsafe { compile(device, render_pass, samples, description) } {
                Ok(entry) => directory.insert(description.kind, entry)?,
                Err(e) => {
                    unsafe { directory.destroy(device) };
                    return Err(e);
                }
            }
        }
        tracing::info!("Built {} pipelines", directory.len());
        Ok(directory)
    }

    /// Register a compiled pipeline.
    pub fn insert(&mut self, kind: PipelineKind, entry: PipelineEntry) -> Result<()> {
        if self.entries.contains_key(&kind) {
            return Err(RenderError::DuplicatePipeline(kind));
        }
        tracing::debug!("Registered pipeline '{}' as {}", entry.name, kind);
        self.entries.insert(kind, entry);
        Ok(())
    }

    /// Pipeline registered for `kind`.
    pub fn pipeline_for(&self, kind: PipelineKind) -> Option<&PipelineEntry> {
        self.entries.get(&kind)
    }

    /// Number of pipelines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destroy every pipeline and layout.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for (_, entry) in self.entries.drain() {
            unsafe { entry.destroy(device) };
        }
    }
}

unsafe fn compile(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    samples: vk::SampleCountFlags,
    description: &PipelineDescription,
) -> Result<PipelineEntry> {
    description.validate()?;

    let config = GraphicsPipelineConfig {
        stages: description.stages.clone(),
        vertex_bindings: description.vertex_bindings()?,
        vertex_attributes: description.vertex_attributes(),
        topology: description.topology,
        cull_mode: description.cull_mode,
        depth_test: description.depth_test,
        depth_write: description.depth_test,
        samples,
        ..Default::default()
    };

    let set_layout = if description.uniforms.is_empty() && description.textures.is_empty() {
        None
    } else {
        let mut builder = DescriptorSetLayoutBuilder::new();
        for uniform in &description.uniforms {
            builder = builder.uniform_buffer(uniform.binding, uniform.stages);
        }
        for texture in &description.textures {
            builder = builder.sampled_image(texture.binding, texture.stages);
        }
        Some(unsafe { builder.build(device) }?)
    };

    let push_constants = description.push_constant_range();
    let set_layouts: Vec<_> = set_layout.into_iter().collect();
    let push_ranges: Vec<_> = push_constants.into_iter().collect();

    let pipeline =
        match unsafe { GraphicsPipeline::new(device, &config, render_pass, &set_layouts, &push_ranges) } {
            Ok(pipeline) => pipeline,
            Err(e) => {
                if let Some(layout) = set_layout {
                    unsafe { device.destroy_descriptor_set_layout(layout, None) };
                }
                return Err(e.into());
            }
        };

    Ok(PipelineEntry {
        name: description.name.clone(),
        pipeline: pipeline.pipeline,
        layout: pipeline.layout,
        set_layout,
        push_constants,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position_color(kind: u32) -> PipelineDescription {
        PipelineDescription::new(PipelineKind(kind), "colored")
            .stage(vk::ShaderStageFlags::VERTEX, vec![0x0723_0203])
            .attribute(VertexAttribute {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
                stride: 24,
            })
            .attribute(VertexAttribute {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 12,
                stride: 24,
            })
    }

    #[test]
    fn attributes_group_into_bindings_by_stride() {
        let description = position_color(0).attribute(VertexAttribute {
            binding: 1,
            location: 2,
            format: vk::Format::R32G32_SFLOAT,
            offset: 0,
            stride: 8,
        });

        let bindings = description.vertex_bindings().unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!((bindings[0].binding, bindings[0].stride), (0, 24));
        assert_eq!((bindings[1].binding, bindings[1].stride), (1, 8));
        assert_eq!(description.vertex_attributes().len(), 3);
    }

    #[test]
    fn conflicting_strides_are_rejected() {
        let description = position_color(0).attribute(VertexAttribute {
            binding: 0,
            location: 2,
            format: vk::Format::R32_SFLOAT,
            offset: 24,
            stride: 28,
        });
        assert!(matches!(
            description.vertex_bindings(),
            Err(RenderError::InvalidPipeline(_))
        ));
    }

    #[test]
    fn push_constant_range_only_when_declared() {
        assert!(position_color(0).push_constant_range().is_none());
        let range = position_color(0)
            .push_constants(64, vk::ShaderStageFlags::VERTEX)
            .push_constant_range()
            .unwrap();
        assert_eq!((range.offset, range.size), (0, 64));
    }

    #[test]
    fn validation_catches_inconsistent_descriptions() {
        assert!(position_color(0).validate().is_ok());
        assert!(PipelineDescription::new(PipelineKind(0), "empty")
            .validate()
            .is_err());
        assert!(position_color(0)
            .uniform(0, vk::ShaderStageFlags::VERTEX)
            .texture(0, vk::ShaderStageFlags::FRAGMENT)
            .validate()
            .is_err());
        assert!(position_color(0)
            .push_constants(10, vk::ShaderStageFlags::VERTEX)
            .validate()
            .is_err());
    }

    #[test]
    fn lookup_by_kind() {
        let mut directory = PipelineDirectory::new();
        let entry = || PipelineEntry {
            name: "null".to_string(),
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            set_layout: None,
            push_constants: None,
        };
        directory.insert(PipelineKind(3), entry()).unwrap();

        assert!(directory.pipeline_for(PipelineKind(3)).is_some());
        assert!(directory.pipeline_for(PipelineKind(4)).is_none());
        assert!(matches!(
            directory.insert(PipelineKind(3), entry()),
            Err(RenderError::DuplicatePipeline(PipelineKind(3)))
        ));
    }
}
