//! Per-image synchronization state tracking.
//!
//! Callers describe how an image is about to be used with
//! [`ResourceTracker::set_state`]; [`ResourceTracker::flush_barriers`] then
//! turns every pending request into a single batched `vkCmdPipelineBarrier2`
//! from the last recorded state to the requested one.
//!
//! The tracker is the only source of truth for image layouts: every command
//! that touches a tracked image must be preceded by a flush covering it, and
//! code that transitions an image on its own must report the result through
//! [`ResourceTracker::set_external_state`].

use std::collections::HashMap;

use vulkanalia::prelude::v1_3::*;

use crate::commands::CommandRecorder;

/// How an image was last used on the GPU timeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
    pub aspect: vk::ImageAspectFlags,
}

impl ImageState {
    pub const fn new(
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
        aspect: vk::ImageAspectFlags,
    ) -> Self {
        Self {
            stage,
            access,
            layout,
            aspect,
        }
    }

    /// State of an image nothing has touched yet.
    pub const fn undefined(aspect: vk::ImageAspectFlags) -> Self {
        Self::new(
            vk::PipelineStageFlags2::NONE,
            vk::AccessFlags2::NONE,
            vk::ImageLayout::UNDEFINED,
            aspect,
        )
    }

    pub const fn transfer_dst() -> Self {
        Self::new(
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        )
    }

    pub const fn color_attachment() -> Self {
        Self::new(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        )
    }

    pub const fn fragment_sampled() -> Self {
        Self::new(
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        )
    }

    /// Presentation is ordered by the rendering-done semaphore, so the barrier
    /// only has to wait on attachment output and carries no access.
    pub const fn present() -> Self {
        Self::new(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::NONE,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageAspectFlags::COLOR,
        )
    }
}

#[derive(Default)]
pub struct ResourceTracker {
    current: HashMap<vk::Image, ImageState>,
    pending: Vec<(vk::Image, ImageState)>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that `image` be in the given state at the next flush.
    ///
    /// A later request for the same image replaces the earlier one.
    pub fn set_state(
        &mut self,
        image: vk::Image,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
        aspect: vk::ImageAspectFlags,
    ) {
        self.request(image, ImageState::new(stage, access, layout, aspect));
    }

    pub fn request(&mut self, image: vk::Image, state: ImageState) {
        match self.pending.iter_mut().find(|(i, _)| *i == image) {
            Some((_, pending)) => *pending = state,
            None => self.pending.push((image, state)),
        }
    }

    /// Records the barriers for every pending request in one batch and
    /// commits the requested states.
    pub fn flush_barriers(&mut self, recorder: &mut impl CommandRecorder) {
        let barriers = self.take_barriers();
        if barriers.is_empty() {
            return;
        }

        log::trace!("Flushing {} image barriers", barriers.len());
        recorder.pipeline_barrier(&barriers);
    }

    fn take_barriers(&mut self) -> Vec<vk::ImageMemoryBarrier2> {
        let pending = std::mem::take(&mut self.pending);

        pending
            .into_iter()
            .map(|(image, target)| {
                let previous = self
                    .current
                    .insert(image, target)
                    .unwrap_or_else(|| ImageState::undefined(target.aspect));
                image_barrier(image, previous, target)
            })
            .collect()
    }

    /// Overrides the recorded state of an image that was transitioned outside
    /// of the tracker. No barrier is recorded.
    pub fn set_external_state(&mut self, image: vk::Image, state: ImageState) {
        debug_assert!(
            self.pending.iter().all(|(i, _)| *i != image),
            "external state set for {image:?} while a transition is pending"
        );
        self.current.insert(image, state);
    }

    /// Stops tracking an image that is about to be destroyed.
    pub fn forget(&mut self, image: vk::Image) {
        self.current.remove(&image);
        self.pending.retain(|(i, _)| *i != image);
    }

    pub fn state(&self, image: vk::Image) -> Option<ImageState> {
        self.current.get(&image).copied()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Debug-only check that the next command sees the layout it expects.
    pub fn debug_assert_layout(&self, image: vk::Image, layout: vk::ImageLayout) {
        debug_assert!(
            !self.pending.iter().any(|(i, _)| *i == image),
            "{image:?} has an unflushed transition"
        );
        debug_assert_eq!(
            self.state(image).map(|s| s.layout),
            Some(layout),
            "{image:?} is not in the expected layout"
        );
    }
}

fn image_barrier(
    image: vk::Image,
    from: ImageState,
    to: ImageState,
) -> vk::ImageMemoryBarrier2 {
    vk::ImageMemoryBarrier2::builder()
        .src_stage_mask(from.stage)
        .src_access_mask(from.access)
        .dst_stage_mask(to.stage)
        .dst_access_mask(to.access)
        .old_layout(from.layout)
        .new_layout(to.layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::builder()
                .aspect_mask(to.aspect)
                .base_mip_level(0)
                .level_count(vk::REMAINING_MIP_LEVELS)
                .base_array_layer(0)
                .layer_count(vk::REMAINING_ARRAY_LAYERS)
                .build(),
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::mock::MockRecorder;
    use vulkanalia::vk::Handle;

    fn image(raw: u64) -> vk::Image {
        vk::Image::from_raw(raw)
    }

    #[test]
    fn upload_writes_wait_on_every_transfer_stage() {
        let mut tracker = ResourceTracker::new();
        let mut recorder = MockRecorder::default();

        tracker.request(image(1), ImageState::transfer_dst());
        tracker.flush_barriers(&mut recorder);

        let barrier = &recorder.barriers().next().unwrap()[0];
        assert_eq!(barrier.dst_stage, vk::PipelineStageFlags2::ALL_TRANSFER);
        assert_eq!(barrier.dst_access, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }

    #[test]
    fn first_transition_starts_from_undefined() {
        let mut tracker = ResourceTracker::new();
        let mut recorder = MockRecorder::default();

        tracker.request(image(1), ImageState::color_attachment());
        tracker.flush_barriers(&mut recorder);

        let batches = recorder.barriers().collect::<Vec<_>>();
        assert_eq!(batches.len(), 1);
        let barrier = &batches[0][0];
        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(barrier.src_stage, vk::PipelineStageFlags2::NONE);
        assert_eq!(barrier.dst_access, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
        assert_eq!(barrier.level_count, vk::REMAINING_MIP_LEVELS);
    }

    #[test]
    fn transition_uses_previous_state_as_source() {
        let mut tracker = ResourceTracker::new();
        let mut recorder = MockRecorder::default();

        tracker.request(image(1), ImageState::color_attachment());
        tracker.flush_barriers(&mut recorder);
        tracker.request(image(1), ImageState::fragment_sampled());
        tracker.flush_barriers(&mut recorder);

        let batches = recorder.barriers().collect::<Vec<_>>();
        let barrier = &batches[1][0];
        assert_eq!(barrier.src_stage, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(barrier.src_access, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
        assert_eq!(barrier.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(barrier.dst_stage, vk::PipelineStageFlags2::FRAGMENT_SHADER);
        assert_eq!(barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn last_request_wins_within_a_flush() {
        let mut tracker = ResourceTracker::new();
        let mut recorder = MockRecorder::default();

        tracker.request(image(7), ImageState::transfer_dst());
        tracker.request(image(7), ImageState::fragment_sampled());
        tracker.flush_barriers(&mut recorder);

        let batches = recorder.barriers().collect::<Vec<_>>();
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(tracker.state(image(7)), Some(ImageState::fragment_sampled()));
    }

    #[test]
    fn independent_images_share_one_batch() {
        let mut tracker = ResourceTracker::new();
        let mut recorder = MockRecorder::default();

        tracker.request(image(1), ImageState::fragment_sampled());
        tracker.request(image(2), ImageState::fragment_sampled());
        tracker.request(image(3), ImageState::color_attachment());
        tracker.flush_barriers(&mut recorder);

        assert_eq!(recorder.commands.len(), 1);
        assert_eq!(recorder.barriers().next().map(Vec::len), Some(3));
        assert!(!tracker.has_pending());
    }

    #[test]
    fn empty_flush_records_nothing() {
        let mut tracker = ResourceTracker::new();
        let mut recorder = MockRecorder::default();

        tracker.request(image(1), ImageState::color_attachment());
        tracker.flush_barriers(&mut recorder);
        tracker.flush_barriers(&mut recorder);

        assert_eq!(recorder.commands.len(), 1);
    }

    #[test]
    fn equal_state_transition_still_emits_barrier() {
        let mut tracker = ResourceTracker::new();
        let mut recorder = MockRecorder::default();

        tracker.request(image(1), ImageState::fragment_sampled());
        tracker.flush_barriers(&mut recorder);
        tracker.request(image(1), ImageState::fragment_sampled());
        tracker.flush_barriers(&mut recorder);

        assert_eq!(recorder.barriers().count(), 2);
        assert_eq!(tracker.state(image(1)), Some(ImageState::fragment_sampled()));
    }

    #[test]
    fn external_state_becomes_barrier_source() {
        let mut tracker = ResourceTracker::new();
        let mut recorder = MockRecorder::default();

        tracker.set_external_state(image(4), ImageState::transfer_dst());
        tracker.request(image(4), ImageState::fragment_sampled());
        tracker.flush_barriers(&mut recorder);

        let batches = recorder.barriers().collect::<Vec<_>>();
        assert_eq!(batches[0][0].old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(batches[0][0].src_access, vk::AccessFlags2::TRANSFER_WRITE);
    }

    #[test]
    fn forgotten_image_starts_over() {
        let mut tracker = ResourceTracker::new();
        let mut recorder = MockRecorder::default();

        tracker.request(image(5), ImageState::present());
        tracker.flush_barriers(&mut recorder);
        tracker.forget(image(5));
        assert_eq!(tracker.state(image(5)), None);

        tracker.request(image(5), ImageState::color_attachment());
        tracker.flush_barriers(&mut recorder);
        let batches = recorder.barriers().collect::<Vec<_>>();
        assert_eq!(batches[1][0].old_layout, vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn random_sequences_commit_last_request() {
        let states = [
            ImageState::transfer_dst(),
            ImageState::color_attachment(),
            ImageState::fragment_sampled(),
            ImageState::present(),
        ];
        let mut rng = fastrand::Rng::with_seed(0x5eed);

        for _ in 0..200 {
            let mut tracker = ResourceTracker::new();
            let mut recorder = MockRecorder::default();
            let mut expected = HashMap::new();

            for _ in 0..rng.usize(1..24) {
                let target = image(rng.u64(1..6));
                let state = states[rng.usize(..states.len())];
                tracker.request(target, state);
                expected.insert(target, state);
            }
            tracker.flush_barriers(&mut recorder);

            for (target, state) in &expected {
                assert_eq!(tracker.state(*target), Some(*state));
            }
            let emitted = recorder.barriers().map(Vec::len).sum::<usize>();
            assert_eq!(emitted, expected.len());

            tracker.flush_barriers(&mut recorder);
            assert_eq!(recorder.barriers().count(), 1);
        }
    }
}
