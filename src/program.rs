//! Named shader programs built from precompiled SPIR-V.
//!
//! A program is registered once under a name with its stage binaries and the
//! resources its shaders declare; pipelines and descriptor sets are then
//! created by name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, ensure, Context, Result};
use vulkanalia::prelude::v1_3::*;

use crate::config::SHADERS_ROOT;

/// Resources a program's shaders declare, in set 0.
#[derive(Copy, Clone, Debug)]
pub struct ProgramLayout {
    /// Combined image samplers at bindings `0..sampled_images`, fragment stage.
    pub sampled_images: u32,
    /// Fragment-stage push constant block size in bytes.
    pub push_constant_size: u32,
}

pub struct ShaderProgram {
    pub set_layout: Option<vk::DescriptorSetLayout>,
    pub pipeline_layout: vk::PipelineLayout,
    stages: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
}

#[derive(Copy, Clone, Debug)]
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

pub struct ProgramRegistry {
    device: Device,
    programs: HashMap<&'static str, ShaderProgram>,
    pipelines: Vec<vk::Pipeline>,
}

pub fn shader_path(file: &str) -> PathBuf {
    Path::new(SHADERS_ROOT).join(format!("{file}.spv"))
}

fn stage_for(file: &str) -> Result<vk::ShaderStageFlags> {
    match Path::new(file).extension().and_then(|e| e.to_str()) {
        Some("vert") => Ok(vk::ShaderStageFlags::VERTEX),
        Some("frag") => Ok(vk::ShaderStageFlags::FRAGMENT),
        Some("comp") => Ok(vk::ShaderStageFlags::COMPUTE),
        _ => Err(anyhow!("Cannot infer shader stage of `{file}`")),
    }
}

/// Reinterprets SPIR-V bytes as words regardless of the buffer's alignment.
fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    ensure!(
        !bytes.is_empty() && bytes.len() % 4 == 0,
        "SPIR-V length {} is not a multiple of 4",
        bytes.len()
    );
    let words: Vec<u32> = bytemuck::pod_collect_to_vec(bytes);
    ensure!(words[0] == 0x0723_0203, "missing SPIR-V magic number");
    Ok(words)
}

impl ProgramRegistry {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            programs: HashMap::new(),
            pipelines: Vec::new(),
        }
    }

    /// Registers `name` from shader files (e.g. `toy.frag`) under the shader root.
    pub unsafe fn create_program(
        &mut self,
        name: &'static str,
        files: &[&str],
        layout: ProgramLayout,
    ) -> Result<()> {
        ensure!(
            !self.programs.contains_key(name),
            "program `{name}` already registered"
        );

        let mut program = ShaderProgram {
            set_layout: None,
            pipeline_layout: vk::PipelineLayout::null(),
            stages: Vec::new(),
        };
        // Registered first so a failure below still releases what was created.
        let result = self.build_program(&mut program, files, layout);
        self.programs.insert(name, program);
        result.with_context(|| format!("Failed to create program `{name}`"))?;

        log::info!("Registered shader program `{name}` ({})", files.join(", "));
        Ok(())
    }

    unsafe fn build_program(
        &self,
        program: &mut ShaderProgram,
        files: &[&str],
        layout: ProgramLayout,
    ) -> Result<()> {
        for file in files {
            let path = shader_path(file);
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let words = spirv_words(&bytes)?;

            let info = vk::ShaderModuleCreateInfo::builder()
                .code_size(bytes.len())
                .code(&words);
            let module = self.device.create_shader_module(&info, None)?;
            program.stages.push((stage_for(file)?, module));
        }

        if layout.sampled_images > 0 {
            let bindings = (0..layout.sampled_images)
                .map(|binding| {
                    vk::DescriptorSetLayoutBinding::builder()
                        .binding(binding)
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .descriptor_count(1)
                        .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                        .build()
                })
                .collect::<Vec<_>>();
            let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
            program.set_layout = Some(self.device.create_descriptor_set_layout(&info, None)?);
        }

        let set_layouts = program.set_layout.iter().copied().collect::<Vec<_>>();
        let push_constant_ranges = if layout.push_constant_size > 0 {
            vec![vk::PushConstantRange::builder()
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .offset(0)
                .size(layout.push_constant_size)
                .build()]
        } else {
            vec![]
        };

        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        program.pipeline_layout = self.device.create_pipeline_layout(&info, None)?;

        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&ShaderProgram> {
        self.programs
            .get(name)
            .ok_or_else(|| anyhow!("Unknown shader program `{name}`"))
    }

    /// Full-screen pipeline rendering into a single color attachment of
    /// `color_format`; viewport and scissor are dynamic.
    pub unsafe fn create_graphics_pipeline(
        &mut self,
        name: &str,
        color_format: vk::Format,
    ) -> Result<GraphicsPipeline> {
        let program = self.get(name)?;

        let stages = program
            .stages
            .iter()
            .map(|(stage, module)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(*stage)
                    .module(*module)
                    .name(b"main\0")
            })
            .collect::<Vec<_>>();

        // Vertices come from gl_VertexIndex.
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::builder();

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::_1);

        let attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::all())
            .blend_enable(false);

        let attachments = &[attachment];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(attachments)
            .blend_constants([0.0, 0.0, 0.0, 0.0]);

        let dynamic_states = &[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(dynamic_states);

        let color_attachment_formats = &[color_format];
        let mut pipeline_rendering_create_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(color_attachment_formats);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(program.pipeline_layout)
            .push_next(&mut pipeline_rendering_create_info);

        let layout = program.pipeline_layout;
        let pipeline = self
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)?
            .0[0];
        self.pipelines.push(pipeline);

        Ok(GraphicsPipeline { pipeline, layout })
    }
}

impl Drop for ProgramRegistry {
    fn drop(&mut self) {
        unsafe {
            for pipeline in self.pipelines.drain(..) {
                self.device.destroy_pipeline(pipeline, None);
            }
            for (_, program) in self.programs.drain() {
                for (_, module) in program.stages {
                    self.device.destroy_shader_module(module, None);
                }
                self.device
                    .destroy_pipeline_layout(program.pipeline_layout, None);
                if let Some(set_layout) = program.set_layout {
                    self.device.destroy_descriptor_set_layout(set_layout, None);
                }
            }
        }
    }
}

/// One descriptor pool per in-flight slot, reset when the slot is reused.
pub struct DescriptorPools {
    device: Device,
    pools: Vec<vk::DescriptorPool>,
    current: usize,
}

const SETS_PER_FRAME: u32 = 16;

impl DescriptorPools {
    pub unsafe fn new(device: &Device, frames_in_flight: usize) -> Result<Self> {
        let mut pools = Self {
            device: device.clone(),
            pools: Vec::new(),
            current: 0,
        };

        let sizes = &[vk::DescriptorPoolSize::builder()
            .type_(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(SETS_PER_FRAME * 4)
            .build()];
        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(sizes)
            .max_sets(SETS_PER_FRAME);

        for _ in 0..frames_in_flight {
            pools.pools.push(device.create_descriptor_pool(&info, None)?);
        }

        Ok(pools)
    }

    /// Recycles every set allocated the last time `slot` was recorded. The
    /// slot's previous submission must have completed.
    pub unsafe fn begin_frame(&mut self, slot: usize) -> Result<()> {
        self.current = slot;
        self.device
            .reset_descriptor_pool(self.pools[slot], vk::DescriptorPoolResetFlags::empty())?;
        Ok(())
    }

    /// Allocates a set for `program` and writes `images` to bindings
    /// `0..images.len()`.
    pub unsafe fn create_descriptor_set(
        &mut self,
        program: &ShaderProgram,
        images: &[vk::DescriptorImageInfo],
    ) -> Result<vk::DescriptorSet> {
        let set_layout = program
            .set_layout
            .ok_or_else(|| anyhow!("program has no descriptor set layout"))?;

        let set_layouts = &[set_layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pools[self.current])
            .set_layouts(set_layouts);
        let set = self.device.allocate_descriptor_sets(&info)?[0];

        let writes = images
            .iter()
            .enumerate()
            .map(|(binding, image)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding as u32)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(std::slice::from_ref(image))
            })
            .collect::<Vec<_>>();
        self.device
            .update_descriptor_sets(&writes, &[] as &[vk::CopyDescriptorSet]);

        Ok(set)
    }
}

impl Drop for DescriptorPools {
    fn drop(&mut self) {
        unsafe {
            for pool in &self.pools {
                self.device.destroy_descriptor_pool(*pool, None);
            }
        }
    }
}
