#![allow(dead_code)]

use super::device::{Device, SamplerDesc};
use crate::chunky_list::TempList;
use anyhow::{anyhow, bail, Result};
use ash::vk;
use byte_slice_cast::AsSliceOf as _;
use derive_builder::Builder;
use std::{collections::HashMap, ffi::CString, path::PathBuf};

pub const MAX_DESCRIPTOR_SETS: usize = 4;

type DescriptorSetLayout = HashMap<u32, rspirv_reflect::DescriptorInfo>;
type StageDescriptorSetLayouts = HashMap<u32, DescriptorSetLayout>;

pub struct ShaderPipelineCommon {
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub set_layout_info: Vec<HashMap<u32, vk::DescriptorType>>,
    pub descriptor_pool_sizes: Vec<vk::DescriptorPoolSize>,
    pub descriptor_set_layouts: Vec<vk::DescriptorSetLayout>,
    pub pipeline_bind_point: vk::PipelineBindPoint,
}

pub struct ComputePipeline {
    pub common: ShaderPipelineCommon,
    pub group_size: [u32; 3],
}

impl std::ops::Deref for ComputePipeline {
    type Target = ShaderPipelineCommon;

    fn deref(&self) -> &Self::Target {
        &self.common
    }
}

pub fn create_descriptor_set_layouts(
    device: &Device,
    descriptor_sets: &StageDescriptorSetLayouts,
    stage_flags: vk::ShaderStageFlags,
    set_opts: &[Option<(u32, DescriptorSetLayoutOpts)>; MAX_DESCRIPTOR_SETS],
) -> (
    Vec<vk::DescriptorSetLayout>,
    Vec<HashMap<u32, vk::DescriptorType>>,
) {
    // Make a vector of Option<ref> to the original entries
    let mut set_opts = set_opts
        .iter()
        .map(|item| item.as_ref())
        .collect::<Vec<_>>();

    let samplers = TempList::new();

    // Find the number of sets in `descriptor_sets`
    let set_count = descriptor_sets
        .iter()
        .map(|(set_index, _)| *set_index + 1)
        .max()
        .unwrap_or(0u32);

    // Max that with the highest set in `set_opts`
    let set_count = set_count.max(
        set_opts
            .iter()
            .filter_map(|opt| opt.as_ref())
            .map(|(set_index, _)| *set_index + 1)
            .max()
            .unwrap_or(0u32),
    );

    let mut set_layouts: Vec<vk::DescriptorSetLayout> = Vec::with_capacity(set_count as usize);
    let mut set_layout_info: Vec<HashMap<u32, vk::DescriptorType>> =
        Vec::with_capacity(set_count as usize);

    for set_index in 0..set_count {
        let stage_flags = if 0 == set_index {
            stage_flags
        } else {
            // Set 0 is for pass-local bindings,
            // further sets are for the bindless registry and frame bindings,
            // and use all stage flags.
            vk::ShaderStageFlags::ALL
        };

        let _set_opts_default = Default::default();
        // Find the descriptor set opts corresponding to the set index, and remove them from the opts list
        let set_opts = {
            let mut resolved_set_opts: &DescriptorSetLayoutOpts = &_set_opts_default;

            for maybe_opt in set_opts.iter_mut() {
                if let Some(opt) = maybe_opt.as_mut() {
                    if opt.0 == set_index {
                        resolved_set_opts = &std::mem::take(maybe_opt).unwrap().1;
                    }
                }
            }
            resolved_set_opts
        };

        // Use the specified override, or the layout parsed from the shader if no override was provided
        let set = set_opts
            .replace
            .as_ref()
            .or_else(|| descriptor_sets.get(&set_index));

        if let Some(set) = set {
            let mut bindings: Vec<vk::DescriptorSetLayoutBinding> = Vec::with_capacity(set.len());
            let mut binding_flags: Vec<vk::DescriptorBindingFlags> =
                vec![vk::DescriptorBindingFlags::PARTIALLY_BOUND; set.len()];

            let mut set_layout_create_flags = vk::DescriptorSetLayoutCreateFlags::empty();

            for (binding_index, binding) in set.iter() {
                match binding.ty {
                    rspirv_reflect::DescriptorType::UNIFORM_BUFFER
                    | rspirv_reflect::DescriptorType::UNIFORM_TEXEL_BUFFER
                    | rspirv_reflect::DescriptorType::STORAGE_IMAGE
                    | rspirv_reflect::DescriptorType::STORAGE_BUFFER
                    | rspirv_reflect::DescriptorType::STORAGE_BUFFER_DYNAMIC => bindings.push(
                        vk::DescriptorSetLayoutBinding::builder()
                            .binding(*binding_index)
                            .descriptor_count(1)
                            .descriptor_type(match binding.ty {
                                rspirv_reflect::DescriptorType::UNIFORM_BUFFER => {
                                    vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                                }
                                rspirv_reflect::DescriptorType::UNIFORM_TEXEL_BUFFER => {
                                    vk::DescriptorType::UNIFORM_TEXEL_BUFFER
                                }
                                rspirv_reflect::DescriptorType::STORAGE_IMAGE => {
                                    vk::DescriptorType::STORAGE_IMAGE
                                }
                                rspirv_reflect::DescriptorType::STORAGE_BUFFER => {
                                    if binding.name.ends_with("_dyn") {
                                        vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
                                    } else {
                                        vk::DescriptorType::STORAGE_BUFFER
                                    }
                                }
                                rspirv_reflect::DescriptorType::STORAGE_BUFFER_DYNAMIC => {
                                    vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
                                }
                                _ => unimplemented!("{:?}", binding),
                            })
                            .stage_flags(stage_flags)
                            .build(),
                    ),
                    rspirv_reflect::DescriptorType::SAMPLED_IMAGE => {
                        if matches!(
                            binding.dimensionality,
                            rspirv_reflect::DescriptorDimensionality::RuntimeArray
                        ) {
                            // Bindless

                            binding_flags[bindings.len()] =
                                vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                                    | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
                                    | vk::DescriptorBindingFlags::PARTIALLY_BOUND
                                    | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT;

                            set_layout_create_flags |=
                                vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL;
                        }

                        let descriptor_count = match binding.dimensionality {
                            rspirv_reflect::DescriptorDimensionality::Single => 1,
                            rspirv_reflect::DescriptorDimensionality::Array(size) => size,
                            rspirv_reflect::DescriptorDimensionality::RuntimeArray => {
                                device.max_bindless_descriptor_count()
                            }
                        };

                        bindings.push(
                            vk::DescriptorSetLayoutBinding::builder()
                                .binding(*binding_index)
                                .descriptor_count(descriptor_count)
                                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                                .stage_flags(stage_flags)
                                .build(),
                        );
                    }
                    rspirv_reflect::DescriptorType::SAMPLER => {
                        let name_prefix = "sampler_";
                        if let Some(mut spec) = binding.name.strip_prefix(name_prefix) {
                            let texel_filter = match &spec[..1] {
                                "n" => vk::Filter::NEAREST,
                                "l" => vk::Filter::LINEAR,
                                _ => panic!("{}", &spec[..1]),
                            };
                            spec = &spec[1..];

                            let mipmap_mode = match &spec[..1] {
                                "n" => vk::SamplerMipmapMode::NEAREST,
                                "l" => vk::SamplerMipmapMode::LINEAR,
                                _ => panic!("{}", &spec[..1]),
                            };
                            spec = &spec[1..];

                            let address_modes = match spec {
                                "r" => vk::SamplerAddressMode::REPEAT,
                                "mr" => vk::SamplerAddressMode::MIRRORED_REPEAT,
                                "c" => vk::SamplerAddressMode::CLAMP_TO_EDGE,
                                "cb" => vk::SamplerAddressMode::CLAMP_TO_BORDER,
                                _ => panic!("{}", spec),
                            };

                            bindings.push(
                                vk::DescriptorSetLayoutBinding::builder()
                                    .descriptor_count(1)
                                    .descriptor_type(vk::DescriptorType::SAMPLER)
                                    .stage_flags(stage_flags)
                                    .binding(*binding_index)
                                    .immutable_samplers(std::slice::from_ref(samplers.add(
                                        device.get_sampler(SamplerDesc {
                                            texel_filter,
                                            mipmap_mode,
                                            address_modes,
                                        }),
                                    )))
                                    .build(),
                            );
                        } else {
                            panic!("{}", binding.name);
                        }
                    }
                    rspirv_reflect::DescriptorType::ACCELERATION_STRUCTURE_KHR => bindings.push(
                        vk::DescriptorSetLayoutBinding::builder()
                            .binding(*binding_index)
                            .descriptor_count(1)
                            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                            .stage_flags(stage_flags)
                            .build(),
                    ),

                    _ => unimplemented!("{:?}", binding),
                }
            }

            let mut binding_flags_create_info =
                vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
                    .binding_flags(&binding_flags);

            let set_layout = unsafe {
                device
                    .raw
                    .create_descriptor_set_layout(
                        &vk::DescriptorSetLayoutCreateInfo::builder()
                            .flags(set_opts.flags.unwrap_or_default() | set_layout_create_flags)
                            .bindings(&bindings)
                            .push_next(&mut binding_flags_create_info)
                            .build(),
                        None,
                    )
                    .expect("create_descriptor_set_layout")
            };

            set_layouts.push(set_layout);
            set_layout_info.push(
                bindings
                    .iter()
                    .map(|binding| (binding.binding, binding.descriptor_type))
                    .collect(),
            );
        } else {
            let set_layout = unsafe {
                device
                    .raw
                    .create_descriptor_set_layout(
                        &vk::DescriptorSetLayoutCreateInfo::builder().build(),
                        None,
                    )
                    .expect("create_descriptor_set_layout")
            };

            set_layouts.push(set_layout);
            set_layout_info.push(Default::default());
        }
    }

    (set_layouts, set_layout_info)
}

#[derive(Builder, Default, Debug, Clone)]
#[builder(pattern = "owned", derive(Clone))]
pub struct DescriptorSetLayoutOpts {
    #[builder(setter(strip_option), default)]
    pub flags: Option<vk::DescriptorSetLayoutCreateFlags>,
    #[builder(setter(strip_option), default)]
    pub replace: Option<DescriptorSetLayout>,
}

impl DescriptorSetLayoutOpts {
    pub fn builder() -> DescriptorSetLayoutOptsBuilder {
        DescriptorSetLayoutOptsBuilder::default()
    }
}

/// A prebuilt SPIR-V module on disk, relative to the shader root.
#[derive(Clone, Hash, PartialEq, Eq, Debug)]
pub struct ShaderSource {
    pub path: PathBuf,
}

impl ShaderSource {
    pub fn spv(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn entry(&self) -> &str {
        "main"
    }
}

#[derive(Builder, Clone)]
#[builder(pattern = "owned", derive(Clone))]
pub struct ComputePipelineDesc {
    #[builder(default, setter(name = "descriptor_set_opts_impl"))]
    pub descriptor_set_opts: [Option<(u32, DescriptorSetLayoutOpts)>; MAX_DESCRIPTOR_SETS],
    pub source: ShaderSource,
}

impl ComputePipelineDescBuilder {
    pub fn descriptor_set_opts(mut self, opts: &[(u32, DescriptorSetLayoutOptsBuilder)]) -> Self {
        assert!(opts.len() <= MAX_DESCRIPTOR_SETS);
        let mut descriptor_set_opts: [Option<(u32, DescriptorSetLayoutOpts)>; MAX_DESCRIPTOR_SETS] =
            Default::default();
        for (i, (opt_set, opt)) in opts.iter().cloned().enumerate() {
            descriptor_set_opts[i] = Some((opt_set, opt.build().unwrap()));
        }
        self.descriptor_set_opts = Some(descriptor_set_opts);
        self
    }

    pub fn compute_spv(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(ShaderSource::spv(path));
        self
    }
}

impl ComputePipelineDesc {
    pub fn builder() -> ComputePipelineDescBuilder {
        ComputePipelineDescBuilder::default()
    }
}

pub fn create_compute_pipeline(
    device: &Device,
    spirv: &[u8],
    desc: &ComputePipelineDesc,
) -> Result<ComputePipeline> {
    let spirv_words = spirv.as_slice_of::<u32>()?;
    let group_size = get_cs_local_size_from_spirv(spirv_words)?;

    let (descriptor_set_layouts, set_layout_info) = create_descriptor_set_layouts(
        device,
        &rspirv_reflect::Reflection::new_from_spirv(spirv)
            .map_err(|err| anyhow!("SPIR-V reflection failed: {:?}", err))?
            .get_descriptor_sets()
            .map_err(|err| anyhow!("SPIR-V reflection failed: {:?}", err))?,
        vk::ShaderStageFlags::COMPUTE,
        &desc.descriptor_set_opts,
    );

    let layout_create_info =
        vk::PipelineLayoutCreateInfo::builder().set_layouts(&descriptor_set_layouts);

    unsafe {
        let shader_module = device.raw.create_shader_module(
            &vk::ShaderModuleCreateInfo::builder().code(spirv_words),
            None,
        )?;

        let entry_name = CString::new(desc.source.entry())?;
        let stage_create_info = vk::PipelineShaderStageCreateInfo::builder()
            .module(shader_module)
            .stage(vk::ShaderStageFlags::COMPUTE)
            .name(&entry_name);

        let pipeline_layout = device.raw.create_pipeline_layout(&layout_create_info, None)?;

        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage_create_info.build())
            .layout(pipeline_layout);

        let pipeline = device
            .raw
            .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info.build()], None)
            .map_err(|(_, err)| anyhow!("create_compute_pipelines: {:?}", err))?[0];

        let mut descriptor_pool_sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for bindings in set_layout_info.iter() {
            for ty in bindings.values() {
                if let Some(mut dps) = descriptor_pool_sizes.iter_mut().find(|item| item.ty == *ty)
                {
                    dps.descriptor_count += 1;
                } else {
                    descriptor_pool_sizes.push(vk::DescriptorPoolSize {
                        ty: *ty,
                        descriptor_count: 1,
                    })
                }
            }
        }

        Ok(ComputePipeline {
            common: ShaderPipelineCommon {
                pipeline_layout,
                pipeline,
                set_layout_info,
                descriptor_pool_sizes,
                descriptor_set_layouts,
                pipeline_bind_point: vk::PipelineBindPoint::COMPUTE,
            },
            group_size,
        })
    }
}

const SPIRV_HEADER_WORDS: usize = 5;
const OP_EXECUTION_MODE: u32 = 16;
const EXECUTION_MODE_LOCAL_SIZE: u32 = 17;

/// Scans the module's instruction stream for `OpExecutionMode ... LocalSize x y z`.
pub fn get_cs_local_size_from_spirv(spirv: &[u32]) -> Result<[u32; 3]> {
    let mut offset = SPIRV_HEADER_WORDS;

    while offset < spirv.len() {
        let word = spirv[offset];
        let opcode = word & 0xffff;
        let word_count = (word >> 16) as usize;

        if word_count == 0 {
            bail!("Malformed SPIR-V instruction stream");
        }

        if opcode == OP_EXECUTION_MODE
            && word_count >= 6
            && spirv.get(offset + 2) == Some(&EXECUTION_MODE_LOCAL_SIZE)
        {
            return Ok([
                spirv[offset + 3],
                spirv[offset + 4],
                spirv[offset + 5],
            ]);
        }

        offset += word_count;
    }

    Err(anyhow!("Could not find a LocalSize ExecutionMode op"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(opcode: u32, operands: &[u32]) -> Vec<u32> {
        let mut words = vec![opcode | ((operands.len() as u32 + 1) << 16)];
        words.extend_from_slice(operands);
        words
    }

    #[test]
    fn finds_local_size() {
        let mut module = vec![0x0723_0203, 0x0001_0000, 0, 8, 0];
        module.extend(inst(17, &[1])); // OpCapability Shader
        module.extend(inst(
            OP_EXECUTION_MODE,
            &[4, EXECUTION_MODE_LOCAL_SIZE, 8, 8, 1],
        ));

        assert_eq!(get_cs_local_size_from_spirv(&module).unwrap(), [8, 8, 1]);
    }

    #[test]
    fn missing_local_size_is_an_error() {
        let mut module = vec![0x0723_0203, 0x0001_0000, 0, 8, 0];
        module.extend(inst(17, &[1]));

        assert!(get_cs_local_size_from_spirv(&module).is_err());
    }
}
