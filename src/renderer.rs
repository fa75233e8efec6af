use std::path::Path;

use anyhow::{ensure, Result};
use glam::UVec2;
use vulkanalia::prelude::v1_3::*;

use crate::commands::{one_time_submit, VkRecorder};
use crate::config::{
    skybox_face, DesiredProperties, CHECKER_TEXTURE, FRAMES_IN_FLIGHT, RENDER_TARGET_FORMAT,
    SKYBOX_FACE_COUNT, TEXTURES_ROOT, TEXTURE_FORMAT,
};
use crate::device::Gpu;
use crate::frame::{FrameBackend, FrameInputs, FrameSlots};
use crate::passes::{record_passes, PassTargets};
use crate::program::{DescriptorPools, GraphicsPipeline, ProgramLayout, ProgramRegistry};
use crate::resources::{GpuImage, ImageInfo, Sampler};
use crate::swapchain::{FrameHandle, Swapchain};
use crate::texture::{create_cubemap, create_image_from_bytes, decode_rgba8, mip_level_count};
use crate::tracker::ResourceTracker;

const PROCEDURAL_PROGRAM: &str = "toy_procedural";
const COMPOSITE_PROGRAM: &str = "toy_fragment";

/// Owns every per-frame GPU object. Must be dropped before the [`Gpu`] it
/// was created from, with the device idle.
pub struct Renderer {
    device: Device,
    swapchain: Swapchain,
    slots: FrameSlots,
    descriptors: DescriptorPools,
    tracker: ResourceTracker,
    programs: ProgramRegistry,
    procedural: GraphicsPipeline,
    composite: GraphicsPipeline,
    offscreen: GpuImage,
    checker: GpuImage,
    skybox: GpuImage,
    default_sampler: Sampler,
    checker_sampler: Sampler,
    skybox_sampler: Sampler,
}

impl Renderer {
    pub unsafe fn create(gpu: &Gpu, desired: DesiredProperties) -> Result<Self> {
        let swapchain = Swapchain::create(gpu, desired)?;
        ensure!(
            swapchain.resolution == desired.resolution,
            "surface granted {}x{} instead of the requested {}x{}",
            swapchain.resolution.x,
            swapchain.resolution.y,
            desired.resolution.x,
            desired.resolution.y
        );

        let slots = FrameSlots::new(
            &gpu.device,
            gpu.queue_families.graphics,
            gpu.graphics_queue,
            FRAMES_IN_FLIGHT,
        )?;
        let descriptors = DescriptorPools::new(&gpu.device, FRAMES_IN_FLIGHT)?;

        let mut programs = ProgramRegistry::new(&gpu.device);
        programs.create_program(
            PROCEDURAL_PROGRAM,
            &["toy.vert", "procedural.frag"],
            ProgramLayout {
                sampled_images: 0,
                push_constant_size: 12,
            },
        )?;
        programs.create_program(
            COMPOSITE_PROGRAM,
            &["toy.vert", "toy.frag"],
            ProgramLayout {
                sampled_images: 3,
                push_constant_size: 20,
            },
        )?;
        let procedural = programs.create_graphics_pipeline(PROCEDURAL_PROGRAM, RENDER_TARGET_FORMAT)?;
        let composite = programs.create_graphics_pipeline(COMPOSITE_PROGRAM, swapchain.format)?;

        let mut tracker = ResourceTracker::new();

        let offscreen = GpuImage::new(
            gpu,
            ImageInfo::new_2d("offscreen", desired.resolution, RENDER_TARGET_FORMAT).usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            ),
        )?;

        let checker = load_checker(gpu, &mut tracker)?;
        let skybox = load_skybox(gpu, &mut tracker)?;

        // Only ever sampled from here on.
        let skybox_image = skybox.image;
        one_time_submit(&gpu.device, gpu.upload_pool, gpu.graphics_queue, |recorder| {
            tracker.set_state(
                skybox_image,
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageAspectFlags::COLOR,
            );
            tracker.flush_barriers(recorder);
            Ok(())
        })?;

        let default_sampler = Sampler::new(
            &gpu.device,
            vk::Filter::NEAREST,
            vk::SamplerAddressMode::CLAMP_TO_EDGE,
        )?;
        let checker_sampler =
            Sampler::new(&gpu.device, vk::Filter::NEAREST, vk::SamplerAddressMode::REPEAT)?;
        let skybox_sampler = Sampler::new(
            &gpu.device,
            vk::Filter::LINEAR,
            vk::SamplerAddressMode::CLAMP_TO_EDGE,
        )?;

        Ok(Self {
            device: gpu.device.clone(),
            swapchain,
            slots,
            descriptors,
            tracker,
            programs,
            procedural,
            composite,
            offscreen,
            checker,
            skybox,
            default_sampler,
            checker_sampler,
            skybox_sampler,
        })
    }

    pub fn resolution(&self) -> UVec2 {
        self.swapchain.resolution
    }

    unsafe fn record_frame(
        &mut self,
        command_buffer: vk::CommandBuffer,
        frame: &FrameHandle,
        inputs: &FrameInputs,
    ) -> Result<()> {
        let images = [
            self.offscreen.binding(&self.default_sampler),
            self.checker.binding(&self.checker_sampler),
            self.skybox.binding(&self.skybox_sampler),
        ];
        let composite_set = self
            .descriptors
            .create_descriptor_set(self.programs.get(COMPOSITE_PROGRAM)?, &images)?;

        let targets = PassTargets {
            offscreen: self.offscreen.image,
            offscreen_view: self.offscreen.view,
            checker: self.checker.image,
            backbuffer: frame.image,
            backbuffer_view: frame.view,
            procedural: self.procedural,
            composite: self.composite,
            composite_set,
        };

        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.device.begin_command_buffer(command_buffer, &info)?;

        let mut recorder = VkRecorder::new(&self.device, command_buffer);
        record_passes(&mut recorder, &mut self.tracker, &targets, inputs);

        self.device.end_command_buffer(command_buffer)?;
        Ok(())
    }
}

unsafe fn load_checker(gpu: &Gpu, tracker: &mut ResourceTracker) -> Result<GpuImage> {
    let pixels = decode_rgba8(&Path::new(TEXTURES_ROOT).join(CHECKER_TEXTURE))?;
    let info = ImageInfo::new_2d("checker", pixels.extent, TEXTURE_FORMAT)
        .mip_levels(mip_level_count(pixels.extent));
    create_image_from_bytes(gpu, tracker, info, &pixels.bytes)
}

unsafe fn load_skybox(gpu: &Gpu, tracker: &mut ResourceTracker) -> Result<GpuImage> {
    let faces = (0..SKYBOX_FACE_COUNT)
        .map(|i| decode_rgba8(&Path::new(TEXTURES_ROOT).join(skybox_face(i))))
        .collect::<Result<Vec<_>>>()?;
    let info = ImageInfo::new_2d("skybox", faces[0].extent, TEXTURE_FORMAT);
    create_cubemap(gpu, tracker, info, &faces)
}

impl FrameBackend for Renderer {
    type CommandBuffer = vk::CommandBuffer;

    fn acquire_command_buffer(&mut self) -> Result<vk::CommandBuffer> {
        unsafe {
            let command_buffer = self.slots.acquire_next()?;
            self.descriptors.begin_frame(self.slots.current())?;
            Ok(command_buffer)
        }
    }

    fn acquire_image(&mut self) -> Result<Option<FrameHandle>> {
        unsafe { self.swapchain.acquire(self.slots.image_available()) }
    }

    fn record(
        &mut self,
        command_buffer: vk::CommandBuffer,
        frame: &FrameHandle,
        inputs: &FrameInputs,
    ) -> Result<()> {
        unsafe { self.record_frame(command_buffer, frame, inputs) }
    }

    fn submit(
        &mut self,
        command_buffer: vk::CommandBuffer,
        frame: &FrameHandle,
    ) -> Result<vk::Semaphore> {
        let rendering_done = self.swapchain.rendering_done(frame);
        unsafe {
            self.slots
                .submit(command_buffer, frame.available, rendering_done)?
        };
        Ok(rendering_done)
    }

    fn present(&mut self, frame: FrameHandle, rendering_done: vk::Semaphore) -> Result<bool> {
        unsafe { self.swapchain.present(frame, rendering_done) }
    }

    fn recreate_swapchain(&mut self, desired: DesiredProperties) -> Result<Option<UVec2>> {
        unsafe { self.swapchain.recreate(desired, &mut self.tracker) }
    }
}
