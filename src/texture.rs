//! Startup texture uploads.
//!
//! Pixel data goes through a host-visible staging buffer, is copied into
//! mip 0 of a device-local image and the remaining levels are produced by
//! blitting. The whole upload is submitted at once and the calling thread
//! waits for the queue to go idle before the staging buffer is released, so
//! these helpers must stay out of the per-frame path.

use std::path::Path;

use anyhow::{anyhow, ensure, Context, Result};
use glam::UVec2;
use vulkanalia::prelude::v1_3::*;

use crate::commands::{one_time_submit, CommandRecorder};
use crate::device::Gpu;
use crate::resources::{block_size, Buffer, GpuImage, ImageInfo};
use crate::tracker::{ImageState, ResourceTracker};

/// Decoded RGBA8 pixels.
pub struct Pixels {
    pub extent: UVec2,
    pub bytes: Vec<u8>,
}

pub fn decode_rgba8(path: &Path) -> Result<Pixels> {
    let img = image::open(path)
        .with_context(|| format!("Failed to load texture {}", path.display()))?
        .to_rgba8();

    Ok(Pixels {
        extent: UVec2::new(img.width(), img.height()),
        bytes: img.into_raw(),
    })
}

/// `floor(log2(max(width, height))) + 1`
pub fn mip_level_count(extent: UVec2) -> u32 {
    let largest = extent.max_element().max(1);
    u32::BITS - largest.leading_zeros()
}

/// Size of `level` along one axis, never below one texel.
pub fn mip_extent(size: u32, level: u32) -> u32 {
    size.checked_shr(level).unwrap_or(0).max(1)
}

/// Blit regions for levels `1..mip_levels`, as `(level, source, destination)`.
pub fn mip_chain(extent: UVec2, mip_levels: u32) -> Vec<(u32, UVec2, UVec2)> {
    (1..mip_levels)
        .map(|level| {
            let src = UVec2::new(
                mip_extent(extent.x, level - 1),
                mip_extent(extent.y, level - 1),
            );
            let dst = UVec2::new(mip_extent(extent.x, level), mip_extent(extent.y, level));
            (level, src, dst)
        })
        .collect()
}

/// Packs equally sized layers back to back: layer `i` starts at
/// `i * layer_size`.
pub fn pack_layers(layers: &[&[u8]], layer_size: usize) -> Result<Vec<u8>> {
    let mut packed = Vec::with_capacity(layer_size * layers.len());
    for (index, layer) in layers.iter().enumerate() {
        ensure!(
            layer.len() == layer_size,
            "layer {index} has {} bytes, expected {layer_size}",
            layer.len()
        );
        packed.extend_from_slice(layer);
    }
    Ok(packed)
}

fn layer_size(info: &ImageInfo) -> Result<u64> {
    let bytes_per_pixel = block_size(info.format)
        .ok_or_else(|| anyhow!("unsupported upload format {:?}", info.format))?;
    Ok(bytes_per_pixel * info.extent.x as u64 * info.extent.y as u64)
}

fn subresource(level: u32, layers: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(level)
        .base_array_layer(0)
        .layer_count(layers)
        .build()
}

fn level_barrier(
    image: vk::Image,
    level: u32,
    layers: u32,
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
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(level)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(layers)
                .build(),
        )
        .build()
}

const TRANSFER_SRC: ImageState = ImageState::new(
    vk::PipelineStageFlags2::ALL_TRANSFER,
    vk::AccessFlags2::TRANSFER_READ,
    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    vk::ImageAspectFlags::COLOR,
);

/// Fills levels `1..mip_levels` by repeatedly downsampling the previous level.
///
/// Every level must be in the tracker's transfer-destination state on entry.
/// The per-level barriers bypass the tracker; every level ends up back in
/// that state and is reported as such.
pub fn record_mip_chain(
    recorder: &mut impl CommandRecorder,
    tracker: &mut ResourceTracker,
    image: vk::Image,
    info: &ImageInfo,
) {
    tracker.debug_assert_layout(image, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

    for (level, src, dst) in mip_chain(info.extent, info.mip_levels) {
        recorder.pipeline_barrier(&[level_barrier(
            image,
            level - 1,
            info.layers,
            ImageState::transfer_dst(),
            TRANSFER_SRC,
        )]);

        let region = vk::ImageBlit::builder()
            .src_subresource(subresource(level - 1, info.layers))
            .src_offsets([
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: src.x as i32,
                    y: src.y as i32,
                    z: 1,
                },
            ])
            .dst_subresource(subresource(level, info.layers))
            .dst_offsets([
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: dst.x as i32,
                    y: dst.y as i32,
                    z: 1,
                },
            ])
            .build();
        recorder.blit_image(image, region);

        recorder.pipeline_barrier(&[level_barrier(
            image,
            level - 1,
            info.layers,
            TRANSFER_SRC,
            ImageState::transfer_dst(),
        )]);
    }

    tracker.set_external_state(image, ImageState::transfer_dst());
}

/// Records the staging copy of every layer of mip 0 followed by the mip chain.
pub fn record_upload(
    recorder: &mut impl CommandRecorder,
    tracker: &mut ResourceTracker,
    staging: vk::Buffer,
    image: vk::Image,
    info: &ImageInfo,
) {
    tracker.request(image, ImageState::transfer_dst());
    tracker.flush_barriers(recorder);

    let region = vk::BufferImageCopy::builder()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(subresource(0, info.layers))
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(info.extent_3d())
        .build();
    recorder.copy_buffer_to_image(staging, image, &[region]);

    record_mip_chain(recorder, tracker, image, info);
}

unsafe fn upload(
    gpu: &Gpu,
    tracker: &mut ResourceTracker,
    info: ImageInfo,
    bytes: &[u8],
) -> Result<GpuImage> {
    if info.mip_levels > 1 {
        let features = gpu.format_features(info.format);
        ensure!(
            features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
                && features.contains(vk::FormatFeatureFlags::BLIT_SRC | vk::FormatFeatureFlags::BLIT_DST),
            "{:?} does not support linear blits for mip generation",
            info.format
        );
    }

    let staging = Buffer::staging(gpu, bytes.len() as u64)?;
    staging.write(bytes)?;

    let image = GpuImage::new(gpu, info)?;

    one_time_submit(&gpu.device, gpu.upload_pool, gpu.graphics_queue, |recorder| {
        record_upload(recorder, tracker, staging.buffer, image.image, &info);
        Ok(())
    })?;

    // The queue is idle, nothing references the staging memory any more.
    drop(staging);

    log::info!(
        "Uploaded `{}` ({}x{}, {} layers, {} mips)",
        info.name,
        info.extent.x,
        info.extent.y,
        info.layers,
        info.mip_levels
    );

    Ok(image)
}

/// Creates a single-layer image from tightly packed pixels.
///
/// On return the image is tracked in the transfer-destination state.
pub unsafe fn create_image_from_bytes(
    gpu: &Gpu,
    tracker: &mut ResourceTracker,
    info: ImageInfo,
    bytes: &[u8],
) -> Result<GpuImage> {
    ensure!(info.layers == 1, "`{}` is not a single-layer image", info.name);
    ensure!(
        bytes.len() as u64 == layer_size(&info)?,
        "`{}` expects {} bytes, got {}",
        info.name,
        layer_size(&info)?,
        bytes.len()
    );

    let info = info.usage(info.usage | upload_usage(&info));
    upload(gpu, tracker, info, bytes)
}

/// Creates a cubemap from six equally sized faces in +X, -X, +Y, -Y, +Z, -Z
/// order, copied with a single command.
pub unsafe fn create_cubemap(
    gpu: &Gpu,
    tracker: &mut ResourceTracker,
    info: ImageInfo,
    faces: &[Pixels],
) -> Result<GpuImage> {
    let info = info.cubemap();
    ensure!(
        faces.len() == info.layers as usize,
        "cubemap `{}` needs {} faces, got {}",
        info.name,
        info.layers,
        faces.len()
    );
    ensure!(
        faces.iter().all(|f| f.extent == info.extent),
        "cubemap `{}` faces differ in size",
        info.name
    );

    let layers = faces.iter().map(|f| f.bytes.as_slice()).collect::<Vec<_>>();
    let packed = pack_layers(&layers, layer_size(&info)? as usize)?;

    let info = info.usage(info.usage | upload_usage(&info));
    upload(gpu, tracker, info, &packed)
}

fn upload_usage(info: &ImageInfo) -> vk::ImageUsageFlags {
    if info.mip_levels > 1 {
        vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC
    } else {
        vk::ImageUsageFlags::TRANSFER_DST
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::mock::{Command, MockRecorder};
    use vulkanalia::vk::Handle;

    #[test]
    fn checker_sized_texture_gets_nine_levels() {
        assert_eq!(mip_level_count(UVec2::new(256, 256)), 9);
        assert_eq!(mip_level_count(UVec2::new(1, 1)), 1);
        assert_eq!(mip_level_count(UVec2::new(300, 17)), 9);
        assert_eq!(mip_level_count(UVec2::new(512, 1024)), 11);
    }

    #[test]
    fn mip_extent_clamps_to_one() {
        assert_eq!(mip_extent(256, 0), 256);
        assert_eq!(mip_extent(256, 8), 1);
        assert_eq!(mip_extent(5, 3), 1);
        assert_eq!(mip_extent(5, 40), 1);
    }

    #[test]
    fn mip_chain_never_grows_or_hits_zero() {
        for extent in [
            UVec2::new(256, 256),
            UVec2::new(300, 17),
            UVec2::new(1, 640),
            UVec2::new(1023, 3),
        ] {
            let levels = mip_level_count(extent);
            let chain = mip_chain(extent, levels);
            assert_eq!(chain.len() as u32, levels - 1);

            for (level, src, dst) in chain {
                assert!(dst.x >= 1 && dst.y >= 1, "zero extent at level {level}");
                assert!(dst.x <= src.x && dst.y <= src.y);
            }
        }
    }

    #[test]
    fn layers_are_packed_without_gaps() {
        let width = 4;
        let height = 2;
        let layer_size = 4 * width * height;
        let faces = (0..6u8)
            .map(|i| vec![i; layer_size])
            .collect::<Vec<_>>();
        let layers = faces.iter().map(Vec::as_slice).collect::<Vec<_>>();

        let packed = pack_layers(&layers, layer_size).unwrap();

        assert_eq!(packed.len(), 6 * layer_size);
        for i in 0..6 {
            let layer = &packed[i * layer_size..(i + 1) * layer_size];
            assert!(layer.iter().all(|b| *b == i as u8));
        }
    }

    #[test]
    fn packing_rejects_mismatched_layer() {
        let a = vec![0u8; 16];
        let b = vec![0u8; 12];
        assert!(pack_layers(&[&a, &b], 16).is_err());
    }

    #[test]
    fn cubemap_layer_size_matches_format() {
        let info = ImageInfo::new_2d("sky", UVec2::new(128, 64), vk::Format::R8G8B8A8_SRGB)
            .cubemap();
        assert_eq!(layer_size(&info).unwrap() * 6, 6 * 4 * 128 * 64);
    }

    #[test]
    fn upload_copies_every_layer_in_one_command() {
        let mut tracker = ResourceTracker::new();
        let mut recorder = MockRecorder::default();
        let image = vk::Image::from_raw(3);
        let info = ImageInfo::new_2d("sky", UVec2::new(64, 64), vk::Format::R8G8B8A8_SRGB)
            .cubemap();

        record_upload(
            &mut recorder,
            &mut tracker,
            vk::Buffer::from_raw(9),
            image,
            &info,
        );

        assert_eq!(
            recorder.commands[1],
            Command::CopyBufferToImage {
                image,
                layer_count: 6,
                buffer_offset: 0,
            }
        );
        assert_eq!(recorder.commands.len(), 2);
        assert_eq!(tracker.state(image), Some(ImageState::transfer_dst()));
    }

    #[test]
    fn mip_chain_is_bracketed_by_level_barriers() {
        let mut tracker = ResourceTracker::new();
        let mut recorder = MockRecorder::default();
        let image = vk::Image::from_raw(1);
        let info = ImageInfo::new_2d("checker", UVec2::new(256, 256), vk::Format::R8G8B8A8_SRGB)
            .mip_levels(9);

        record_upload(
            &mut recorder,
            &mut tracker,
            vk::Buffer::from_raw(2),
            image,
            &info,
        );

        // transition + copy, then barrier/blit/barrier per level
        let mip_commands = &recorder.commands[2..];
        assert_eq!(mip_commands.len(), 3 * 8);

        for (i, triple) in mip_commands.chunks(3).enumerate() {
            let level = i as u32 + 1;
            match (&triple[0], &triple[1], &triple[2]) {
                (Command::Barrier(before), Command::Blit { src_level, dst_level, dst_extent, .. }, Command::Barrier(after)) => {
                    assert_eq!(before[0].base_mip_level, level - 1);
                    assert_eq!(before[0].new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
                    assert_eq!((*src_level, *dst_level), (level - 1, level));
                    assert_eq!(dst_extent[0], (256 >> level).max(1) as i32);
                    assert_eq!(after[0].base_mip_level, level - 1);
                    assert_eq!(after[0].new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                }
                other => panic!("unexpected commands for level {level}: {other:?}"),
            }
        }
        assert_eq!(tracker.state(image), Some(ImageState::transfer_dst()));
    }
}
