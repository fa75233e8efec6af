//! The frame loop.
//!
//! Every tick walks `Acquiring -> Recording -> Submitted -> Presenting ->
//! Idle`. A tick without a swapchain image (minimized window, stale
//! swapchain) goes straight to `Idle` and recreates the swapchain once the
//! window has a non-zero size again.

use anyhow::{ensure, Result};
use glam::{UVec2, Vec2};
use vulkanalia::prelude::v1_3::*;

use crate::config::DesiredProperties;
use crate::swapchain::FrameHandle;

/// Per-frame inputs, rebuilt every tick and handed to the recording step.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FrameInputs {
    pub resolution: UVec2,
    pub cursor: Vec2,
    pub time: f32,
}

/// What the frame loop needs from the window.
pub trait WindowState {
    /// Current framebuffer size, zero while minimized.
    fn extent(&self) -> UVec2;
    fn cursor_position(&self) -> Vec2;
    fn elapsed_seconds(&self) -> f32;
}

/// What the frame loop needs from the GPU.
pub trait FrameBackend {
    type CommandBuffer: Copy;

    /// Returns the command buffer of the current in-flight slot once its
    /// previous submission has finished.
    fn acquire_command_buffer(&mut self) -> Result<Self::CommandBuffer>;

    /// Returns `None` when no image can be acquired this tick.
    fn acquire_image(&mut self) -> Result<Option<FrameHandle>>;

    fn record(
        &mut self,
        command_buffer: Self::CommandBuffer,
        frame: &FrameHandle,
        inputs: &FrameInputs,
    ) -> Result<()>;

    /// Submits the recording and returns the rendering-done semaphore.
    fn submit(
        &mut self,
        command_buffer: Self::CommandBuffer,
        frame: &FrameHandle,
    ) -> Result<vk::Semaphore>;

    /// Returns `false` if the swapchain went stale.
    fn present(&mut self, frame: FrameHandle, rendering_done: vk::Semaphore) -> Result<bool>;

    /// Returns the resolution actually granted, or `None` if the surface
    /// turned out to be zero-sized and nothing was recreated.
    fn recreate_swapchain(&mut self, desired: DesiredProperties) -> Result<Option<UVec2>>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameState {
    Acquiring,
    Recording,
    Submitted,
    Presenting,
    Idle,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    Skipped,
    /// Skipped, and the swapchain was rebuilt for the next tick.
    Recreated,
}

pub struct FrameOrchestrator {
    resolution: UVec2,
    vsync: bool,
    state: FrameState,
    skipped: u64,
}

impl FrameOrchestrator {
    /// `resolution` is what the swapchain granted at creation.
    pub fn new(resolution: UVec2, vsync: bool) -> Self {
        Self {
            resolution,
            vsync,
            state: FrameState::Idle,
            skipped: 0,
        }
    }

    pub fn resolution(&self) -> UVec2 {
        self.resolution
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    fn enter(&mut self, state: FrameState) {
        log::trace!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    pub fn tick<B: FrameBackend>(
        &mut self,
        backend: &mut B,
        window: &impl WindowState,
    ) -> Result<FrameOutcome> {
        self.enter(FrameState::Acquiring);
        let command_buffer = backend.acquire_command_buffer()?;

        let presented = match backend.acquire_image()? {
            Some(frame) => {
                self.enter(FrameState::Recording);
                let inputs = FrameInputs {
                    resolution: self.resolution,
                    cursor: window.cursor_position(),
                    time: window.elapsed_seconds(),
                };
                backend.record(command_buffer, &frame, &inputs)?;

                self.enter(FrameState::Submitted);
                let rendering_done = backend.submit(command_buffer, &frame)?;

                self.enter(FrameState::Presenting);
                backend.present(frame, rendering_done)?
            }
            None => false,
        };

        self.enter(FrameState::Idle);

        if presented {
            if self.skipped > 0 {
                log::debug!("Resumed presenting after {} skipped frames", self.skipped);
                self.skipped = 0;
            }
            return Ok(FrameOutcome::Presented);
        }

        self.skipped += 1;
        if window.extent() == UVec2::ZERO {
            return Ok(FrameOutcome::Skipped);
        }

        // The cached extent can lag behind the surface, so a zero grant is
        // still possible here.
        let Some(granted) = backend.recreate_swapchain(DesiredProperties {
            resolution: self.resolution,
            vsync: self.vsync,
        })?
        else {
            return Ok(FrameOutcome::Skipped);
        };
        ensure!(
            granted == self.resolution,
            "swapchain granted {}x{} instead of the requested {}x{}",
            granted.x,
            granted.y,
            self.resolution.x,
            self.resolution.y
        );

        Ok(FrameOutcome::Recreated)
    }
}

/// Per-slot command buffers, fences and image-available semaphores.
pub struct FrameSlots {
    device: Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    in_flight: Vec<vk::Fence>,
    image_available: Vec<vk::Semaphore>,
    current: usize,
}

impl FrameSlots {
    pub unsafe fn new(
        device: &Device,
        queue_family: u32,
        queue: vk::Queue,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let mut slots = Self {
            device: device.clone(),
            queue,
            command_pool: crate::device::create_command_pool(device, queue_family)?,
            command_buffers: Vec::new(),
            in_flight: Vec::new(),
            image_available: Vec::new(),
            current: 0,
        };

        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(slots.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_in_flight as u32);
        slots.command_buffers = device.allocate_command_buffers(&allocate_info)?;

        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        for _ in 0..frames_in_flight {
            slots
                .image_available
                .push(device.create_semaphore(&semaphore_info, None)?);
            slots
                .in_flight
                .push(device.create_fence(&fence_info, None)?);
        }

        Ok(slots)
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn image_available(&self) -> vk::Semaphore {
        self.image_available[self.current]
    }

    /// Waits for the current slot's previous submission and hands out its
    /// command buffer, reset and ready to record.
    pub unsafe fn acquire_next(&mut self) -> Result<vk::CommandBuffer> {
        let fence = self.in_flight[self.current];
        self.device.wait_for_fences(&[fence], true, u64::MAX)?;

        let command_buffer = self.command_buffers[self.current];
        self.device
            .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;

        Ok(command_buffer)
    }

    /// Submits `command_buffer` for the current slot and moves on to the next.
    pub unsafe fn submit(
        &mut self,
        command_buffer: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
    ) -> Result<()> {
        let fence = self.in_flight[self.current];
        // Only reset once work is guaranteed to signal it again.
        self.device.reset_fences(&[fence])?;

        let wait_semaphore_submit_info = vk::SemaphoreSubmitInfo::builder()
            .semaphore(wait)
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);

        let command_buffer_submit_info =
            vk::CommandBufferSubmitInfo::builder().command_buffer(command_buffer);

        let signal_semaphore_submit_info = vk::SemaphoreSubmitInfo::builder()
            .semaphore(signal)
            .stage_mask(vk::PipelineStageFlags2::ALL_GRAPHICS);

        let submit_info = vk::SubmitInfo2::builder()
            .wait_semaphore_infos(std::slice::from_ref(&wait_semaphore_submit_info))
            .command_buffer_infos(std::slice::from_ref(&command_buffer_submit_info))
            .signal_semaphore_infos(std::slice::from_ref(&signal_semaphore_submit_info));

        self.device.queue_submit2(self.queue, &[submit_info], fence)?;

        self.current = (self.current + 1) % self.command_buffers.len();

        Ok(())
    }
}

impl Drop for FrameSlots {
    fn drop(&mut self) {
        unsafe {
            for semaphore in &self.image_available {
                self.device.destroy_semaphore(*semaphore, None);
            }
            for fence in &self.in_flight {
                self.device.destroy_fence(*fence, None);
            }
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}
