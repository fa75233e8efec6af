use anyhow::Result;
use vulkanalia::prelude::v1_3::*;

/// The subset of command-buffer recording the renderer relies on.
///
/// Everything that inserts barriers or records passes goes through this trait
/// so the recorded sequence can be inspected without a GPU.
pub trait CommandRecorder {
    fn pipeline_barrier(&mut self, barriers: &[vk::ImageMemoryBarrier2]);

    fn copy_buffer_to_image(
        &mut self,
        buffer: vk::Buffer,
        image: vk::Image,
        regions: &[vk::BufferImageCopy],
    );

    fn blit_image(&mut self, image: vk::Image, region: vk::ImageBlit);

    fn begin_rendering(&mut self, view: vk::ImageView, extent: vk::Extent2D);

    fn end_rendering(&mut self);

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline);

    fn bind_descriptor_set(&mut self, layout: vk::PipelineLayout, set: vk::DescriptorSet);

    fn push_constants(&mut self, layout: vk::PipelineLayout, bytes: &[u8]);

    fn draw(&mut self, vertex_count: u32, instance_count: u32);
}

/// Records straight into a Vulkan command buffer.
pub struct VkRecorder<'a> {
    device: &'a Device,
    command_buffer: vk::CommandBuffer,
}

impl<'a> VkRecorder<'a> {
    pub fn new(device: &'a Device, command_buffer: vk::CommandBuffer) -> Self {
        Self {
            device,
            command_buffer,
        }
    }
}

impl CommandRecorder for VkRecorder<'_> {
    fn pipeline_barrier(&mut self, barriers: &[vk::ImageMemoryBarrier2]) {
        let dependency_info = vk::DependencyInfo::builder()
            .dependency_flags(vk::DependencyFlags::BY_REGION)
            .image_memory_barriers(barriers);

        unsafe {
            self.device
                .cmd_pipeline_barrier2(self.command_buffer, &dependency_info)
        };
    }

    fn copy_buffer_to_image(
        &mut self,
        buffer: vk::Buffer,
        image: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                self.command_buffer,
                buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            )
        };
    }

    fn blit_image(&mut self, image: vk::Image, region: vk::ImageBlit) {
        unsafe {
            self.device.cmd_blit_image(
                self.command_buffer,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::LINEAR,
            )
        };
    }

    fn begin_rendering(&mut self, view: vk::ImageView, extent: vk::Extent2D) {
        let render_area = vk::Rect2D::builder()
            .offset(vk::Offset2D::default())
            .extent(extent);

        let color_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::DONT_CARE)
            .store_op(vk::AttachmentStoreOp::STORE);

        let color_attachments = &[color_attachment];
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(color_attachments);

        let viewport = vk::Viewport::builder()
            .x(0.0)
            .y(0.0)
            .width(extent.width as f32)
            .height(extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0);

        unsafe {
            self.device
                .cmd_begin_rendering(self.command_buffer, &rendering_info);
            self.device
                .cmd_set_viewport(self.command_buffer, 0, &[viewport]);
            self.device
                .cmd_set_scissor(self.command_buffer, 0, &[render_area]);
        }
    }

    fn end_rendering(&mut self) {
        unsafe { self.device.cmd_end_rendering(self.command_buffer) };
    }

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe {
            self.device.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            )
        };
    }

    fn bind_descriptor_set(&mut self, layout: vk::PipelineLayout, set: vk::DescriptorSet) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &[set],
                &[],
            )
        };
    }

    fn push_constants(&mut self, layout: vk::PipelineLayout, bytes: &[u8]) {
        unsafe {
            self.device.cmd_push_constants(
                self.command_buffer,
                layout,
                vk::ShaderStageFlags::FRAGMENT,
                0,
                bytes,
            )
        };
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        unsafe {
            self.device
                .cmd_draw(self.command_buffer, vertex_count, instance_count, 0, 0)
        };
    }
}

/// Records a throwaway command buffer, submits it and blocks until the queue
/// is idle.
pub unsafe fn one_time_submit<F>(
    device: &Device,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    record: F,
) -> Result<()>
where
    F: FnOnce(&mut VkRecorder) -> Result<()>,
{
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_pool(command_pool)
        .command_buffer_count(1);

    let command_buffer = device.allocate_command_buffers(&alloc_info)?[0];

    let result = record_and_wait(device, command_buffer, queue, record);

    // Freed on the error path too; the queue is idle or never saw the buffer.
    device.free_command_buffers(command_pool, &[command_buffer]);

    result
}

unsafe fn record_and_wait<F>(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    queue: vk::Queue,
    record: F,
) -> Result<()>
where
    F: FnOnce(&mut VkRecorder) -> Result<()>,
{
    let info =
        vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    device.begin_command_buffer(command_buffer, &info)?;

    record(&mut VkRecorder::new(device, command_buffer))?;

    device.end_command_buffer(command_buffer)?;

    let command_buffers = &[command_buffer];
    let info = vk::SubmitInfo::builder().command_buffers(command_buffers);

    device.queue_submit(queue, &[info], vk::Fence::null())?;
    device.queue_wait_idle(queue)?;

    Ok(())
}
