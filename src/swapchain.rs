use anyhow::{anyhow, ensure, Result};
use glam::UVec2;
use vulkanalia::prelude::v1_3::*;
use vulkanalia::vk::KhrSwapchainExtension;

use crate::config::{extent, DesiredProperties};
use crate::device::{Gpu, QueueFamilyIndices, SwapchainSupport};
use crate::tracker::ResourceTracker;

/// A swapchain image acquired for one frame.
///
/// Consumed by exactly one submit and present.
#[derive(Debug)]
pub struct FrameHandle {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub image_index: u32,
    pub available: vk::Semaphore,
}

pub struct Swapchain {
    instance: Instance,
    device: Device,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    queue_families: QueueFamilyIndices,
    present_queue: vk::Queue,
    pub swapchain: vk::SwapchainKHR,
    pub format: vk::Format,
    pub resolution: UVec2,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    // One per image: a present may still wait on it when the slot comes round again.
    rendering_done: Vec<vk::Semaphore>,
    stale: bool,
}

impl Swapchain {
    pub unsafe fn create(gpu: &Gpu, desired: DesiredProperties) -> Result<Self> {
        let mut swapchain = Self {
            instance: gpu.instance.clone(),
            device: gpu.device.clone(),
            surface: gpu.surface,
            physical_device: gpu.physical_device,
            queue_families: gpu.queue_families,
            present_queue: gpu.present_queue,
            swapchain: vk::SwapchainKHR::null(),
            format: vk::Format::UNDEFINED,
            resolution: UVec2::ZERO,
            images: Vec::new(),
            views: Vec::new(),
            rendering_done: Vec::new(),
            stale: true,
        };
        ensure!(
            swapchain.build(desired, None)?,
            "cannot create a swapchain for a zero-sized surface"
        );
        Ok(swapchain)
    }

    /// Rebuilds the swapchain and returns the resolution actually granted, or
    /// `None` while the surface is zero-sized. The swapchain then stays stale
    /// and the caller retries on a later tick.
    ///
    /// Waits for the device to go idle; images of a replaced swapchain are no
    /// longer tracked.
    pub unsafe fn recreate(
        &mut self,
        desired: DesiredProperties,
        tracker: &mut ResourceTracker,
    ) -> Result<Option<UVec2>> {
        self.device.device_wait_idle()?;

        let previous = self.images.clone();
        if !self.build(desired, Some(self.format))? {
            log::debug!("Surface is zero-sized, swapchain left stale");
            return Ok(None);
        }
        for image in previous {
            tracker.forget(image);
        }

        log::debug!(
            "Recreated swapchain at {}x{} (vsync {})",
            self.resolution.x,
            self.resolution.y,
            desired.vsync
        );

        Ok(Some(self.resolution))
    }

    /// Returns `false` without touching the current swapchain when the
    /// surface is zero-sized. `format` pins the image format pipelines were
    /// built for.
    unsafe fn build(
        &mut self,
        desired: DesiredProperties,
        format: Option<vk::Format>,
    ) -> Result<bool> {
        let support = SwapchainSupport::get(&self.instance, self.surface, self.physical_device)?;

        let resolution = choose_resolution(&support.capabilities, desired.resolution);
        if resolution.x == 0 || resolution.y == 0 {
            return Ok(false);
        }

        let surface_format = match format {
            Some(format) => surface_format_matching(&support.formats, format)?,
            None => choose_surface_format(&support.formats)?,
        };
        let present_mode = choose_present_mode(&support.present_modes, desired.vsync);

        let mut image_count = support.capabilities.min_image_count + 1;
        if support.capabilities.max_image_count != 0
            && image_count > support.capabilities.max_image_count
        {
            image_count = support.capabilities.max_image_count;
        }

        let indices = self.queue_families;
        let mut queue_family_indices = vec![];
        let image_sharing_mode = if indices.graphics != indices.present {
            queue_family_indices.push(indices.graphics);
            queue_family_indices.push(indices.present);
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let old_swapchain = self.swapchain;
        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent(resolution))
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(image_sharing_mode)
            .queue_family_indices(&queue_family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = self.device.create_swapchain_khr(&info, None)?;

        self.destroy_images();
        self.device.destroy_swapchain_khr(old_swapchain, None);

        self.swapchain = swapchain;
        self.images = self.device.get_swapchain_images_khr(swapchain)?;
        self.format = surface_format.format;
        self.resolution = resolution;
        self.create_image_views()?;

        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        for _ in 0..self.images.len() {
            self.rendering_done
                .push(self.device.create_semaphore(&semaphore_info, None)?);
        }

        self.stale = false;

        log::info!(
            "Swapchain ready: {} images, {}x{}, {:?}, {:?}",
            self.images.len(),
            resolution.x,
            resolution.y,
            surface_format.format,
            present_mode
        );

        Ok(true)
    }

    unsafe fn create_image_views(&mut self) -> Result<()> {
        for image in &self.images {
            let info = vk::ImageViewCreateInfo::builder()
                .image(*image)
                .view_type(vk::ImageViewType::_2D)
                .format(self.format)
                .subresource_range(
                    vk::ImageSubresourceRange::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1)
                        .build(),
                );

            self.views.push(self.device.create_image_view(&info, None)?);
        }

        Ok(())
    }

    unsafe fn destroy_images(&mut self) {
        for view in self.views.drain(..) {
            self.device.destroy_image_view(view, None);
        }
        for semaphore in self.rendering_done.drain(..) {
            self.device.destroy_semaphore(semaphore, None);
        }
        self.images.clear();
    }

    /// Acquires the next image, or `None` when the swapchain no longer matches
    /// the surface and has to be recreated first.
    pub unsafe fn acquire(&mut self, available: vk::Semaphore) -> Result<Option<FrameHandle>> {
        if self.stale {
            return Ok(None);
        }

        let result = self.device.acquire_next_image_khr(
            self.swapchain,
            u64::MAX,
            available,
            vk::Fence::null(),
        );

        match result {
            Ok((image_index, _)) => Ok(Some(FrameHandle {
                image: self.images[image_index as usize],
                view: self.views[image_index as usize],
                image_index,
                available,
            })),
            Err(vk::ErrorCode::OUT_OF_DATE_KHR) => {
                self.stale = true;
                Ok(None)
            }
            Err(e) => Err(anyhow!("{}", e)),
        }
    }

    pub fn rendering_done(&self, frame: &FrameHandle) -> vk::Semaphore {
        self.rendering_done[frame.image_index as usize]
    }

    /// Queues `frame` for presentation once `rendering_done` is signalled.
    ///
    /// Returns `false` if the swapchain turned out to be stale.
    pub unsafe fn present(&mut self, frame: FrameHandle, rendering_done: vk::Semaphore) -> Result<bool> {
        let swapchains = &[self.swapchain];
        let image_indices = &[frame.image_index];
        let wait_semaphores = &[rendering_done];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(swapchains)
            .image_indices(image_indices);

        match self
            .device
            .queue_present_khr(self.present_queue, &present_info)
        {
            Ok(vk::SuccessCode::SUBOPTIMAL_KHR) | Err(vk::ErrorCode::OUT_OF_DATE_KHR) => {
                self.stale = true;
                Ok(false)
            }
            Ok(_) => Ok(true),
            Err(e) => Err(anyhow!("{}", e)),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            self.destroy_images();
            self.device.destroy_swapchain_khr(self.swapchain, None);
        }
    }
}

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .cloned()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().cloned())
        .ok_or_else(|| anyhow!("Surface reports no formats."))
}

/// The surface format with exactly `format`, preferring the sRGB color space.
fn surface_format_matching(
    formats: &[vk::SurfaceFormatKHR],
    format: vk::Format,
) -> Result<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .filter(|f| f.format == format)
        .min_by_key(|f| f.color_space != vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .cloned()
        .ok_or_else(|| anyhow!("Surface no longer supports {:?}.", format))
}

fn choose_present_mode(present_modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }

    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|m| present_modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface decides the size when it reports one; otherwise the request is
/// clamped to what the surface allows.
fn choose_resolution(capabilities: &vk::SurfaceCapabilitiesKHR, desired: UVec2) -> UVec2 {
    if capabilities.current_extent.width != u32::MAX {
        UVec2::new(
            capabilities.current_extent.width,
            capabilities.current_extent.height,
        )
    } else {
        let min = UVec2::new(
            capabilities.min_image_extent.width,
            capabilities.min_image_extent.height,
        );
        let max = UVec2::new(
            capabilities.max_image_extent.width,
            capabilities.max_image_extent.height,
        );
        desired.clamp(min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.current_extent = vk::Extent2D {
            width: current.0,
            height: current.1,
        };
        caps.min_image_extent = vk::Extent2D {
            width: 1,
            height: 1,
        };
        caps.max_image_extent = vk::Extent2D {
            width: 4096,
            height: 4096,
        };
        caps
    }

    #[test]
    fn requested_resolution_is_granted_when_surface_defers() {
        let caps = capabilities((u32::MAX, u32::MAX));
        let desired = UVec2::new(1280, 720);

        let first = choose_resolution(&caps, desired);
        let second = choose_resolution(&caps, desired);

        assert_eq!(first, desired);
        assert_eq!(first, second);
    }

    #[test]
    fn surface_extent_overrides_request() {
        let caps = capabilities((1920, 1080));
        assert_eq!(
            choose_resolution(&caps, UVec2::new(1280, 720)),
            UVec2::new(1920, 1080)
        );
    }

    #[test]
    fn oversized_request_is_clamped() {
        let caps = capabilities((u32::MAX, u32::MAX));
        assert_eq!(
            choose_resolution(&caps, UVec2::new(10_000, 0)),
            UVec2::new(4096, 1)
        );
    }

    #[test]
    fn vsync_always_uses_fifo() {
        let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn srgb_bgra_is_preferred() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );
        assert!(choose_surface_format(&[]).is_err());
    }

    #[test]
    fn recreation_keeps_the_pipeline_format() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            surface_format_matching(&formats, vk::Format::B8G8R8A8_UNORM)
                .unwrap()
                .format,
            vk::Format::B8G8R8A8_UNORM
        );
        assert!(surface_format_matching(&formats, vk::Format::B8G8R8A8_SRGB).is_err());
    }

    #[test]
    fn minimized_surface_grants_nothing() {
        let caps = capabilities((0, 0));
        assert_eq!(
            choose_resolution(&caps, UVec2::new(1280, 720)),
            UVec2::ZERO
        );
    }
}
