//! Acceleration structures, root signatures, ray tracing pipelines and
//! descriptor heaps on top of `VK_KHR_acceleration_structure` and
//! `VK_KHR_ray_tracing_pipeline`.
//!
//! A root signature becomes a pipeline layout with up to two sets. Descriptor
//! tables live in set 0 and are backed by a descriptor set per heap. Root
//! constant buffers live in set 1, a push descriptor set, so binding one is
//! as cheap as setting a root parameter.

use std::ffi::CString;

use ash::vk;

use crate::backend::traits::*;
use crate::backend::types::*;

use super::conversion::*;
use super::VulkanBackend;

pub const TABLE_SET: u32 = 0;
pub const CONSTANTS_SET: u32 = 1;

/// Where a root parameter lands in the pipeline layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterBinding {
    Table,
    Constants { binding: u32 },
}

pub struct VkRootSignature {
    pub table_layout: vk::DescriptorSetLayout,
    pub constants_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub parameters: Vec<ParameterBinding>,
    /// Flattened table ranges as (binding, type)
    pub table_bindings: Vec<(u32, vk::DescriptorType)>,
}

pub struct VkPipeline {
    pub pipeline: vk::Pipeline,
    /// Export names in shader group order
    pub groups: Vec<String>,
    pub handles: Vec<u8>,
}

pub struct VkAccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub address: vk::DeviceAddress,
}

pub struct VkDescriptorHeap {
    pub set: vk::DescriptorSet,
}

/// Geometry of one build plus its per-geometry primitive counts
pub struct BuildGeometry {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub geometries: Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    pub primitive_counts: Vec<u32>,
}

impl BuildGeometry {
    pub fn ranges(&self) -> Vec<vk::AccelerationStructureBuildRangeInfoKHR> {
        self.primitive_counts
            .iter()
            .map(|&count| vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(count))
            .collect()
    }

    pub fn build_info(&self) -> vk::AccelerationStructureBuildGeometryInfoKHR<'_> {
        vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(self.ty)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&self.geometries)
    }
}

impl VulkanBackend {
    pub(super) fn build_geometry(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> BackendResult<BuildGeometry> {
        match inputs {
            AccelerationStructureInputs::BottomLevel { geometries } => {
                let mut built = Vec::with_capacity(geometries.len());
                for geometry in geometries {
                    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                        .vertex_format(convert_vertex_format(geometry.vertex_format))
                        .vertex_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: self.vk_buffer(geometry.vertex_buffer)?.address,
                        })
                        .vertex_stride(geometry.vertex_stride)
                        .max_vertex(geometry.vertex_count.saturating_sub(1))
                        .index_type(convert_index_format(geometry.index_format))
                        .index_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: self.vk_buffer(geometry.index_buffer)?.address,
                        });
                    let flags = if geometry.opaque {
                        vk::GeometryFlagsKHR::OPAQUE
                    } else {
                        vk::GeometryFlagsKHR::empty()
                    };
                    built.push(
                        vk::AccelerationStructureGeometryKHR::default()
                            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                            .flags(flags),
                    );
                }
                Ok(BuildGeometry {
                    ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                    geometries: built,
                    primitive_counts: geometries.iter().map(TriangleGeometry::triangle_count).collect(),
                })
            }
            AccelerationStructureInputs::TopLevel {
                instance_buffer,
                instance_count,
            } => {
                let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: self.vk_buffer(*instance_buffer)?.address,
                    });
                Ok(BuildGeometry {
                    ty: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                    geometries: vec![vk::AccelerationStructureGeometryKHR::default()
                        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                        .geometry(vk::AccelerationStructureGeometryDataKHR { instances })],
                    primitive_counts: vec![*instance_count],
                })
            }
        }
    }

    pub(super) fn query_build_sizes(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> BackendResult<PrebuildInfo> {
        if inputs.primitive_count() == 0 {
            return Err(BackendError::AccelerationStructureCreationFailed(
                "no primitives".to_string(),
            ));
        }
        let geometry = self.build_geometry(inputs)?;
        let build_info = geometry.build_info();
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            (self.acceleration_fn.fp().get_acceleration_structure_build_sizes_khr)(
                self.device.handle(),
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                geometry.primitive_counts.as_ptr(),
                &mut sizes,
            );
        }
        Ok(PrebuildInfo {
            result_size: sizes.acceleration_structure_size,
            scratch_size: sizes.build_scratch_size,
        })
    }

    pub(super) fn create_vk_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        buffer: BufferHandle,
        size: u64,
    ) -> BackendResult<VkAccelerationStructure> {
        let storage = self.vk_buffer(buffer)?;
        if storage.size < size {
            return Err(BackendError::AccelerationStructureCreationFailed(format!(
                "buffer {:?} cannot hold a {} byte structure",
                buffer, size
            )));
        }
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(storage.buffer)
            .size(size)
            .ty(convert_acceleration_structure_kind(kind));
        let handle = unsafe { self.acceleration_fn.create_acceleration_structure(&create_info, None) }
            .map_err(|e| BackendError::AccelerationStructureCreationFailed(e.to_string()))?;
        let address = unsafe {
            self.acceleration_fn.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle),
            )
        };
        Ok(VkAccelerationStructure { handle, address })
    }

    pub(super) fn create_vk_root_signature(
        &self,
        desc: &RootSignatureDescriptor,
    ) -> BackendResult<VkRootSignature> {
        let stages = vk::ShaderStageFlags::RAYGEN_KHR
            | vk::ShaderStageFlags::MISS_KHR
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR;

        let mut parameters = Vec::with_capacity(desc.parameters.len());
        let mut table_bindings = Vec::new();
        let mut constant_bindings = Vec::new();
        for parameter in &desc.parameters {
            match parameter {
                RootParameter::DescriptorTable(ranges) => {
                    if parameters.contains(&ParameterBinding::Table) {
                        return Err(BackendError::PipelineCreationFailed(
                            "only one descriptor table per root signature".to_string(),
                        ));
                    }
                    for range in ranges {
                        for i in 0..range.count {
                            table_bindings.push((range.register + i, convert_descriptor_kind(range.kind)));
                        }
                    }
                    parameters.push(ParameterBinding::Table);
                }
                RootParameter::ConstantBuffer { register } => {
                    constant_bindings.push(*register);
                    parameters.push(ParameterBinding::Constants { binding: *register });
                }
            }
        }

        let table_layout_bindings: Vec<_> = table_bindings
            .iter()
            .map(|&(binding, ty)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(ty)
                    .descriptor_count(1)
                    .stage_flags(stages)
            })
            .collect();
        let constants_layout_bindings: Vec<_> = constant_bindings
            .iter()
            .map(|&binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(stages)
            })
            .collect();

        unsafe {
            let table_layout = self
                .device
                .create_descriptor_set_layout(
                    &vk::DescriptorSetLayoutCreateInfo::default().bindings(&table_layout_bindings),
                    None,
                )
                .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?;
            let constants_layout = match self.device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default()
                    .flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR)
                    .bindings(&constants_layout_bindings),
                None,
            ) {
                Ok(layout) => layout,
                Err(e) => {
                    self.device.destroy_descriptor_set_layout(table_layout, None);
                    return Err(BackendError::PipelineCreationFailed(e.to_string()));
                }
            };
            let set_layouts = [table_layout, constants_layout];
            let pipeline_layout = match self.device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts),
                None,
            ) {
                Ok(layout) => layout,
                Err(e) => {
                    self.device.destroy_descriptor_set_layout(table_layout, None);
                    self.device.destroy_descriptor_set_layout(constants_layout, None);
                    return Err(BackendError::PipelineCreationFailed(e.to_string()));
                }
            };

            Ok(VkRootSignature {
                table_layout,
                constants_layout,
                pipeline_layout,
                parameters,
                table_bindings,
            })
        }
    }

    pub(super) fn create_vk_pipeline(
        &self,
        desc: &RayTracingPipelineDescriptor,
        layout: vk::PipelineLayout,
    ) -> BackendResult<VkPipeline> {
        let mut modules = Vec::with_capacity(desc.shaders.len());
        let result = self.create_vk_pipeline_with_modules(desc, layout, &mut modules);
        for module in modules {
            unsafe { self.device.destroy_shader_module(module, None) };
        }
        result
    }

    fn create_vk_pipeline_with_modules(
        &self,
        desc: &RayTracingPipelineDescriptor,
        layout: vk::PipelineLayout,
        modules: &mut Vec<vk::ShaderModule>,
    ) -> BackendResult<VkPipeline> {
        if desc.max_recursion_depth > self.capabilities.max_recursion_depth {
            return Err(BackendError::PipelineCreationFailed(
                "recursion depth above device limit".to_string(),
            ));
        }

        let entry_points = desc
            .shaders
            .iter()
            .map(|s| CString::new(s.entry_point.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?;

        let mut stages = Vec::with_capacity(desc.shaders.len());
        for (shader, entry_point) in desc.shaders.iter().zip(&entry_points) {
            let module = unsafe {
                self.device.create_shader_module(
                    &vk::ShaderModuleCreateInfo::default().code(&shader.spirv),
                    None,
                )
            }
            .map_err(|e| BackendError::ShaderCompileFailed(format!("{}: {}", shader.export_name, e)))?;
            modules.push(module);
            stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(convert_shader_stage(shader.stage))
                    .module(module)
                    .name(entry_point),
            );
        }

        // Ray generation and miss shaders are general groups, closest hit
        // shaders are only reachable through triangle hit groups
        let mut groups = Vec::new();
        let mut group_names = Vec::new();
        for (index, shader) in desc.shaders.iter().enumerate() {
            if shader.stage == ShaderStage::ClosestHit {
                continue;
            }
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                    .general_shader(index as u32)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR),
            );
            group_names.push(shader.export_name.clone());
        }
        for hit_group in &desc.hit_groups {
            let closest_hit = desc
                .shaders
                .iter()
                .position(|s| s.export_name == hit_group.closest_hit && s.stage == ShaderStage::ClosestHit)
                .ok_or_else(|| {
                    BackendError::PipelineCreationFailed(format!(
                        "hit group {} references unknown closest hit {}",
                        hit_group.export_name, hit_group.closest_hit
                    ))
                })?;
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(closest_hit as u32)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR),
            );
            group_names.push(hit_group.export_name.clone());
        }

        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
            .layout(layout);

        let mut pipeline = vk::Pipeline::null();
        unsafe {
            (self.ray_tracing_fn.fp().create_ray_tracing_pipelines_khr)(
                self.device.handle(),
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                1,
                &create_info,
                std::ptr::null(),
                &mut pipeline,
            )
            .result()
            .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?;
        }

        let handle_size = self.capabilities.shader_identifier_size as usize;
        let handles = match unsafe {
            self.ray_tracing_fn.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                groups.len() as u32,
                groups.len() * handle_size,
            )
        } {
            Ok(handles) => handles,
            Err(e) => {
                unsafe { self.device.destroy_pipeline(pipeline, None) };
                return Err(BackendError::PipelineCreationFailed(e.to_string()));
            }
        };

        log::debug!(
            "Created ray tracing pipeline {:?} with {} groups",
            desc.label,
            groups.len()
        );
        Ok(VkPipeline {
            pipeline,
            groups: group_names,
            handles,
        })
    }

    pub(super) fn shader_group_handle(&self, pipeline: &VkPipeline, export: &str) -> BackendResult<Vec<u8>> {
        let size = self.capabilities.shader_identifier_size as usize;
        let index = pipeline
            .groups
            .iter()
            .position(|g| g == export)
            .ok_or_else(|| BackendError::InvalidHandle(format!("unknown export {}", export)))?;
        pipeline
            .handles
            .get(index * size..(index + 1) * size)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| BackendError::InvalidHandle(format!("no handle for export {}", export)))
    }

    pub(super) fn create_vk_descriptor_heap(
        &self,
        root_signature: &VkRootSignature,
        entries: &[DescriptorEntry],
    ) -> BackendResult<VkDescriptorHeap> {
        if entries.len() != root_signature.table_bindings.len() {
            return Err(BackendError::DescriptorCreationFailed(format!(
                "{} entries for a table of {} slots",
                entries.len(),
                root_signature.table_bindings.len()
            )));
        }

        let set_layouts = [root_signature.table_layout];
        let set = unsafe {
            self.device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(self.descriptor_pool)
                    .set_layouts(&set_layouts),
            )
        }
        .map_err(|e| BackendError::DescriptorCreationFailed(e.to_string()))?[0];

        for (entry, &(binding, ty)) in entries.iter().zip(&root_signature.table_bindings) {
            match *entry {
                DescriptorEntry::AccelerationStructure(accel) => {
                    if ty != vk::DescriptorType::ACCELERATION_STRUCTURE_KHR {
                        return Err(BackendError::DescriptorCreationFailed(format!(
                            "slot {} expects {:?}",
                            binding, ty
                        )));
                    }
                    let structures = [self.vk_accel(accel)?.handle];
                    let mut accel_write = vk::WriteDescriptorSetAccelerationStructureKHR::default()
                        .acceleration_structures(&structures);
                    let mut write = vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding)
                        .descriptor_type(ty)
                        .push_next(&mut accel_write);
                    write.descriptor_count = 1;
                    unsafe { self.device.update_descriptor_sets(&[write], &[]) };
                }
                DescriptorEntry::StorageTexture(texture) => {
                    if ty != vk::DescriptorType::STORAGE_IMAGE {
                        return Err(BackendError::DescriptorCreationFailed(format!(
                            "slot {} expects {:?}",
                            binding, ty
                        )));
                    }
                    let view = self.vk_texture(texture)?.view.ok_or_else(|| {
                        BackendError::DescriptorCreationFailed(format!(
                            "texture {:?} has no storage usage",
                            texture
                        ))
                    })?;
                    let image_info = [vk::DescriptorImageInfo::default()
                        .image_view(view)
                        .image_layout(vk::ImageLayout::GENERAL)];
                    let write = vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding)
                        .descriptor_type(ty)
                        .image_info(&image_info);
                    unsafe { self.device.update_descriptor_sets(&[write], &[]) };
                }
            }
        }

        Ok(VkDescriptorHeap { set })
    }
}
