//! Descriptor set management.

use crate::error::{GpuError, Result};
use ash::vk;

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl DescriptorSetLayoutBuilder<'_> {
    /// Create a new builder.
    pub const fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Add a binding.
    #[must_use]
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    /// Add a uniform buffer binding.
    #[must_use]
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Add a combined image sampler binding.
    #[must_use]
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);

        let layout = device.create_descriptor_set_layout(&layout_info, None)?;
        Ok(layout)
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor pool for allocating descriptor sets.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create a new descriptor pool.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        let pool = device.create_descriptor_pool(&create_info, None)?;
        Ok(Self { pool })
    }

    /// Get the raw pool handle.
    pub const fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Allocate descriptor sets.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &self,
        device: &ash::Device,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        let sets = device.allocate_descriptor_sets(&alloc_info)?;
        Ok(sets)
    }

    /// Return descriptor sets to the pool.
    ///
    /// # Safety
    /// The device must be valid and the sets must not be in use.
    pub unsafe fn free(&self, device: &ash::Device, sets: &[vk::DescriptorSet]) -> Result<()> {
        device.free_descriptor_sets(self.pool, sets)?;
        Ok(())
    }

    /// Destroy the pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
    }
}

/// Growable descriptor allocator.
///
/// Opens a new [`DescriptorPool`] whenever the current one runs out.
pub struct DescriptorAllocator {
    pools: Vec<DescriptorPool>,
    sets_per_pool: u32,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
}

impl DescriptorAllocator {
    /// Create an allocator whose pools hold `sets_per_pool` sets each.
    pub fn new(sets_per_pool: u32) -> Self {
        // Per-set descriptor budget across the types render objects use
        let pool_sizes = vec![
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(sets_per_pool * 4),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(sets_per_pool * 4),
        ];
        Self {
            pools: Vec::new(),
            sets_per_pool,
            pool_sizes,
        }
    }

    /// Allocate one set per layout, returning the owning pool index with the sets.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &mut self,
        device: &ash::Device,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<(usize, Vec<vk::DescriptorSet>)> {
        if let Some(pool) = self.pools.last() {
            match pool.allocate(device, layouts) {
                Ok(sets) => return Ok((self.pools.len() - 1, sets)),
                Err(GpuError::Vulkan(
                    vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL,
                )) => {}
                Err(e) => return Err(e),
            }
        }

        let pool = DescriptorPool::new(device, self.sets_per_pool, &self.pool_sizes)?;
        tracing::debug!("Opened descriptor pool #{}", self.pools.len());
        let sets = pool.allocate(device, layouts)?;
        self.pools.push(pool);
        Ok((self.pools.len() - 1, sets))
    }

    /// Free sets previously allocated from pool `pool_index`.
    ///
    /// # Safety
    /// The device must be valid and the sets must not be in use.
    pub unsafe fn free(
        &self,
        device: &ash::Device,
        pool_index: usize,
        sets: &[vk::DescriptorSet],
    ) -> Result<()> {
        let pool = self
            .pools
            .get(pool_index)
            .ok_or_else(|| GpuError::InvalidState(format!("No descriptor pool #{pool_index}")))?;
        pool.free(device, sets)
    }

    /// Destroy every pool.
    ///
    /// # Safety
    /// The device must be valid and no set may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for pool in self.pools.drain(..) {
            pool.destroy(device);
        }
    }
}

/// Write a uniform buffer descriptor.
///
/// # Safety
/// Device and buffer must be valid, and the set must not be in use by the GPU.
pub unsafe fn write_uniform_buffer(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    offset: u64,
    range: u64,
) {
    let buffer_info = vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(offset)
        .range(range);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .buffer_info(std::slice::from_ref(&buffer_info));

    device.update_descriptor_sets(&[write], &[]);
}

/// Write a combined image sampler descriptor.
///
/// # Safety
/// Device, image view and sampler must be valid, and the set must not be in use by the GPU.
pub unsafe fn write_combined_image_sampler(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    image_view: vk::ImageView,
    sampler: vk::Sampler,
) {
    let image_info = vk::DescriptorImageInfo::default()
        .image_view(image_view)
        .sampler(sampler)
        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .image_info(std::slice::from_ref(&image_info));

    device.update_descriptor_sets(&[write], &[]);
}
