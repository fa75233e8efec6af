//! Owning wrappers for device objects.
//!
//! Each wrapper keeps a clone of the logical device and releases its handles
//! on drop. Dropping while the GPU still references the object is a bug, so
//! owners wait for device idle first.

use anyhow::Result;
use glam::UVec2;
use vulkanalia::prelude::v1_3::*;

use crate::device::{get_memory_type, Gpu};

unsafe fn allocate_memory(
    gpu: &Gpu,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type = get_memory_type(&gpu.memory_properties, requirements, properties)?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type);

    Ok(gpu.device.allocate_memory(&alloc_info, None)?)
}

pub struct Buffer {
    device: Device,
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    pub size: u64,
}

impl Buffer {
    pub unsafe fn new(
        gpu: &Gpu,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let device = &gpu.device;
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = device.create_buffer(&buffer_info, None)?;

        let requirements = device.get_buffer_memory_requirements(buffer);
        let memory = match allocate_memory(gpu, requirements, properties) {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_buffer(buffer, None);
                return Err(e);
            }
        };

        let buffer = Self {
            device: device.clone(),
            buffer,
            memory,
            size,
        };
        device.bind_buffer_memory(buffer.buffer, buffer.memory, 0)?;

        Ok(buffer)
    }

    /// Host-visible, coherent transfer source.
    pub unsafe fn staging(gpu: &Gpu, size: u64) -> Result<Self> {
        Self::new(
            gpu,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Copies `bytes` to the start of the buffer. Memory must be host visible
    /// and coherent.
    pub unsafe fn write(&self, bytes: &[u8]) -> Result<()> {
        anyhow::ensure!(
            bytes.len() as u64 <= self.size,
            "write of {} bytes overflows a {} byte buffer",
            bytes.len(),
            self.size
        );

        let memory = self.device.map_memory(
            self.memory,
            0,
            bytes.len() as u64,
            vk::MemoryMapFlags::empty(),
        )?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), memory.cast(), bytes.len());
        self.device.unmap_memory(self.memory);

        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ImageInfo {
    pub name: &'static str,
    pub extent: UVec2,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub layers: u32,
    pub mip_levels: u32,
    pub flags: vk::ImageCreateFlags,
    pub view_type: vk::ImageViewType,
}

impl ImageInfo {
    pub fn new_2d(name: &'static str, extent: UVec2, format: vk::Format) -> Self {
        Self {
            name,
            extent,
            format,
            usage: vk::ImageUsageFlags::SAMPLED,
            layers: 1,
            mip_levels: 1,
            flags: vk::ImageCreateFlags::empty(),
            view_type: vk::ImageViewType::_2D,
        }
    }

    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn cubemap(mut self) -> Self {
        self.layers = 6;
        self.flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        self.view_type = vk::ImageViewType::CUBE;
        self
    }

    pub fn extent_3d(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.extent.x,
            height: self.extent.y,
            depth: 1,
        }
    }
}

pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Bytes per texel for the uncompressed formats this renderer uploads.
pub fn block_size(format: vk::Format) -> Option<u64> {
    match format {
        vk::Format::R8G8B8A8_SRGB
        | vk::Format::R8G8B8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM => Some(4),
        vk::Format::R16G16B16A16_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

/// Device-local image with its memory and a view over every level and layer.
pub struct GpuImage {
    device: Device,
    pub image: vk::Image,
    memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub info: ImageInfo,
}

impl GpuImage {
    pub unsafe fn new(gpu: &Gpu, info: ImageInfo) -> Result<Self> {
        let device = &gpu.device;
        let image_info = vk::ImageCreateInfo::builder()
            .flags(info.flags)
            .image_type(vk::ImageType::_2D)
            .extent(info.extent_3d())
            .mip_levels(info.mip_levels)
            .array_layers(info.layers)
            .format(info.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::_1);

        let image = device.create_image(&image_info, None)?;

        let requirements = device.get_image_memory_requirements(image);
        let memory = match allocate_memory(gpu, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_image(image, None);
                return Err(e);
            }
        };

        let mut owned = Self {
            device: device.clone(),
            image,
            memory,
            view: vk::ImageView::null(),
            info,
        };
        device.bind_image_memory(image, memory, 0)?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(info.view_type)
            .format(info.format)
            .subresource_range(owned.full_range());
        owned.view = device.create_image_view(&view_info, None)?;

        log::debug!(
            "Created image `{}` {}x{} ({} layers, {} mips)",
            info.name,
            info.extent.x,
            info.extent.y,
            info.layers,
            info.mip_levels
        );

        Ok(owned)
    }

    pub fn aspect_mask(&self) -> vk::ImageAspectFlags {
        aspect_mask(self.info.format)
    }

    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::builder()
            .aspect_mask(self.aspect_mask())
            .base_mip_level(0)
            .level_count(self.info.mip_levels)
            .base_array_layer(0)
            .layer_count(self.info.layers)
            .build()
    }

    pub fn binding(&self, sampler: &Sampler) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::builder()
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image_view(self.view)
            .sampler(sampler.sampler)
            .build()
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            // A null view (creation failed part way) is a no-op.
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

pub struct Sampler {
    device: Device,
    pub sampler: vk::Sampler,
}

impl Sampler {
    pub unsafe fn new(
        device: &Device,
        filter: vk::Filter,
        address_mode: vk::SamplerAddressMode,
    ) -> Result<Self> {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter)
            .min_filter(filter)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .anisotropy_enable(false)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);

        Ok(Self {
            device: device.clone(),
            sampler: device.create_sampler(&info, None)?,
        })
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.device.destroy_sampler(self.sampler, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cubemap_info_has_six_cube_compatible_layers() {
        let info = ImageInfo::new_2d("sky", UVec2::new(64, 64), vk::Format::R8G8B8A8_SRGB)
            .cubemap();

        assert_eq!(info.layers, 6);
        assert!(info.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE));
        assert_eq!(info.view_type, vk::ImageViewType::CUBE);
    }

    #[test]
    fn aspect_mask_follows_format() {
        assert_eq!(
            aspect_mask(vk::Format::B8G8R8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(aspect_mask(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn block_size_of_rgba8_is_four() {
        assert_eq!(block_size(vk::Format::R8G8B8A8_SRGB), Some(4));
        assert_eq!(block_size(vk::Format::BC1_RGB_UNORM_BLOCK), None);
    }
}
