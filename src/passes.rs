//! The two full-screen passes recorded every frame.

use bytemuck::{Pod, Zeroable};
use vulkanalia::prelude::v1_3::*;

use crate::commands::CommandRecorder;
use crate::config::extent;
use crate::frame::FrameInputs;
use crate::program::GraphicsPipeline;
use crate::tracker::{ImageState, ResourceTracker};

/// Push constants of `procedural.frag`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ProceduralConstants {
    pub resolution: [f32; 2],
    pub time: f32,
}

/// Push constants of `toy.frag`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct CompositeConstants {
    pub resolution: [f32; 2],
    pub mouse: [f32; 2],
    pub time: f32,
}

impl ProceduralConstants {
    pub fn new(inputs: &FrameInputs) -> Self {
        Self {
            resolution: inputs.resolution.as_vec2().to_array(),
            time: inputs.time,
        }
    }
}

impl CompositeConstants {
    pub fn new(inputs: &FrameInputs) -> Self {
        Self {
            resolution: inputs.resolution.as_vec2().to_array(),
            mouse: inputs.cursor.to_array(),
            time: inputs.time,
        }
    }
}

/// Everything one frame's passes draw from and into.
#[derive(Copy, Clone, Debug)]
pub struct PassTargets {
    pub offscreen: vk::Image,
    pub offscreen_view: vk::ImageView,
    pub checker: vk::Image,
    pub backbuffer: vk::Image,
    pub backbuffer_view: vk::ImageView,
    pub procedural: GraphicsPipeline,
    pub composite: GraphicsPipeline,
    /// Offscreen result, checker and skybox at bindings 0, 1 and 2.
    pub composite_set: vk::DescriptorSet,
}

/// Records the offscreen pass, the composite pass and the final transition
/// of the backbuffer to the presentable layout.
pub fn record_passes(
    recorder: &mut impl CommandRecorder,
    tracker: &mut ResourceTracker,
    targets: &PassTargets,
    inputs: &FrameInputs,
) {
    let area = extent(inputs.resolution);

    tracker.request(targets.offscreen, ImageState::color_attachment());
    tracker.flush_barriers(recorder);

    recorder.begin_rendering(targets.offscreen_view, area);
    recorder.bind_pipeline(targets.procedural.pipeline);
    recorder.push_constants(
        targets.procedural.layout,
        bytemuck::bytes_of(&ProceduralConstants::new(inputs)),
    );
    recorder.draw(3, 1);
    recorder.end_rendering();

    tracker.request(targets.offscreen, ImageState::fragment_sampled());
    tracker.request(targets.checker, ImageState::fragment_sampled());
    tracker.request(targets.backbuffer, ImageState::color_attachment());
    tracker.flush_barriers(recorder);

    recorder.begin_rendering(targets.backbuffer_view, area);
    recorder.bind_pipeline(targets.composite.pipeline);
    recorder.bind_descriptor_set(targets.composite.layout, targets.composite_set);
    recorder.push_constants(
        targets.composite.layout,
        bytemuck::bytes_of(&CompositeConstants::new(inputs)),
    );
    recorder.draw(3, 1);
    recorder.end_rendering();

    tracker.request(targets.backbuffer, ImageState::present());
    tracker.flush_barriers(recorder);
    debug_assert!(!tracker.has_pending());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::mock::{Command, MockRecorder};
    use glam::{UVec2, Vec2};
    use vulkanalia::vk::Handle;

    fn targets() -> PassTargets {
        PassTargets {
            offscreen: vk::Image::from_raw(1),
            offscreen_view: vk::ImageView::from_raw(2),
            checker: vk::Image::from_raw(3),
            backbuffer: vk::Image::from_raw(4),
            backbuffer_view: vk::ImageView::from_raw(5),
            procedural: GraphicsPipeline {
                pipeline: vk::Pipeline::from_raw(6),
                layout: vk::PipelineLayout::from_raw(7),
            },
            composite: GraphicsPipeline {
                pipeline: vk::Pipeline::from_raw(8),
                layout: vk::PipelineLayout::from_raw(9),
            },
            composite_set: vk::DescriptorSet::from_raw(10),
        }
    }

    fn inputs() -> FrameInputs {
        FrameInputs {
            resolution: UVec2::new(1280, 720),
            cursor: Vec2::new(64.0, 32.0),
            time: 2.5,
        }
    }

    #[test]
    fn constant_blocks_match_shader_layouts() {
        assert_eq!(std::mem::size_of::<ProceduralConstants>(), 12);
        assert_eq!(std::mem::size_of::<CompositeConstants>(), 20);

        let constants = CompositeConstants::new(&inputs());
        let floats: &[f32] = bytemuck::cast_slice(bytemuck::bytes_of(&constants));
        assert_eq!(floats, &[1280.0, 720.0, 64.0, 32.0, 2.5]);
    }

    #[test]
    fn frame_records_both_passes_in_order() {
        let mut recorder = MockRecorder::default();
        let mut tracker = ResourceTracker::new();
        let targets = targets();

        record_passes(&mut recorder, &mut tracker, &targets, &inputs());

        let kinds = recorder
            .commands
            .iter()
            .map(|c| match c {
                Command::Barrier(_) => "barrier",
                Command::BeginRendering { .. } => "begin",
                Command::EndRendering => "end",
                Command::BindPipeline(_) => "pipeline",
                Command::BindDescriptorSet(_) => "set",
                Command::PushConstants(_) => "push",
                Command::Draw { .. } => "draw",
                _ => "other",
            })
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                "barrier", "begin", "pipeline", "push", "draw", "end", //
                "barrier", "begin", "pipeline", "set", "push", "draw", "end", //
                "barrier",
            ]
        );

        assert_eq!(recorder.draws(), 2);
        assert!(recorder.commands.contains(&Command::BeginRendering {
            view: targets.backbuffer_view,
            extent: [1280, 720],
        }));
        assert!(recorder.commands.contains(&Command::Draw {
            vertex_count: 3,
            instance_count: 1,
        }));
    }

    #[test]
    fn composite_barrier_covers_all_inputs_in_one_batch() {
        let mut recorder = MockRecorder::default();
        let mut tracker = ResourceTracker::new();
        let targets = targets();

        record_passes(&mut recorder, &mut tracker, &targets, &inputs());

        let batches = recorder.barriers().collect::<Vec<_>>();
        assert_eq!(batches.len(), 3);

        let offscreen = &batches[0][0];
        assert_eq!(offscreen.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(offscreen.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        let composite = batches[1];
        assert_eq!(composite.len(), 3);
        let sampled = composite
            .iter()
            .find(|b| b.image == targets.offscreen)
            .unwrap();
        assert_eq!(sampled.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(sampled.src_access, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
        assert_eq!(sampled.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(sampled.dst_stage, vk::PipelineStageFlags2::FRAGMENT_SHADER);

        let present = &batches[2][0];
        assert_eq!(present.image, targets.backbuffer);
        assert_eq!(present.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(present.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert!(!tracker.has_pending());
    }

    #[test]
    fn second_frame_starts_from_previous_frame_state() {
        let mut recorder = MockRecorder::default();
        let mut tracker = ResourceTracker::new();
        let targets = targets();

        record_passes(&mut recorder, &mut tracker, &targets, &inputs());
        recorder.commands.clear();
        record_passes(&mut recorder, &mut tracker, &targets, &inputs());

        let batches = recorder.barriers().collect::<Vec<_>>();
        assert_eq!(
            batches[0][0].old_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        let backbuffer = batches[1]
            .iter()
            .find(|b| b.image == targets.backbuffer)
            .unwrap();
        assert_eq!(backbuffer.old_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(
            tracker.state(targets.checker),
            Some(ImageState::fragment_sampled())
        );
    }
}
