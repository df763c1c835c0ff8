//! GPU capability detection.

use ash::vk;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum memory allocation count
    pub max_memory_allocation_count: u32,

    /// Highest sample count usable for both color and depth framebuffer attachments
    pub max_usable_sample_count: vk::SampleCountFlags,
    /// Anisotropic filtering support
    pub supports_sampler_anisotropy: bool,
    /// Maximum sampler anisotropy
    pub max_sampler_anisotropy: f32,
    /// Maximum push constant block size in bytes
    pub max_push_constants_size: u32,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let features = instance.get_physical_device_features(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let limits = properties.limits;

        Self {
            vendor,
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            device_local_memory_mb,
            max_memory_allocation_count: limits.max_memory_allocation_count,

            max_usable_sample_count: max_usable_sample_count(
                limits.framebuffer_color_sample_counts,
                limits.framebuffer_depth_sample_counts,
            ),
            supports_sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            max_sampler_anisotropy: limits.max_sampler_anisotropy,
            max_push_constants_size: limits.max_push_constants_size,
        }
    }

    /// Check if the GPU meets minimum requirements for the engine.
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);

        api_major > 1 || (api_major == 1 && api_minor >= 2)
    }

    /// Clamp a requested sample count to what the device supports.
    pub fn clamp_samples(&self, requested: vk::SampleCountFlags) -> vk::SampleCountFlags {
        if requested.as_raw() > self.max_usable_sample_count.as_raw() {
            self.max_usable_sample_count
        } else {
            requested
        }
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - {:?} MSAA",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            self.max_usable_sample_count,
        )
    }
}

/// Highest single sample count present in both color and depth masks.
pub fn max_usable_sample_count(
    color: vk::SampleCountFlags,
    depth: vk::SampleCountFlags,
) -> vk::SampleCountFlags {
    let counts = color & depth;
    [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .find(|&c| counts.contains(c))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn usable_samples_intersect_color_and_depth() {
        let color = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4
            | vk::SampleCountFlags::TYPE_8;
        let depth = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4;
        assert_eq!(
            max_usable_sample_count(color, depth),
            vk::SampleCountFlags::TYPE_4
        );
        assert_eq!(
            max_usable_sample_count(vk::SampleCountFlags::TYPE_1, depth),
            vk::SampleCountFlags::TYPE_1
        );
    }
}
