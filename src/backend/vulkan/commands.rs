//! Translation of a recorded [`CommandList`] into a Vulkan command buffer

use ash::vk;

use crate::backend::commands::{Command, CommandList, ResourceBarrier, ResourceId};
use crate::backend::traits::*;
use crate::backend::types::*;

use super::conversion::*;
use super::ray_tracing::{ParameterBinding, CONSTANTS_SET, TABLE_SET};
use super::VulkanBackend;

/// What the recorded list needs from the submit around it
#[derive(Debug, Default)]
pub struct RecordSummary {
    /// A presentation surface is written, so the acquire must be waited on
    pub touches_back_buffer: bool,
}

#[derive(Default)]
struct Bindings {
    pipeline_layout: Option<vk::PipelineLayout>,
    parameters: Vec<ParameterBinding>,
}

impl VulkanBackend {
    pub(super) fn record_commands(
        &mut self,
        cmd: vk::CommandBuffer,
        list: &CommandList,
    ) -> BackendResult<RecordSummary> {
        let mut summary = RecordSummary::default();
        let mut bindings = Bindings::default();
        for command in list.commands() {
            self.record_command(cmd, command, &mut bindings, &mut summary)?;
        }
        Ok(summary)
    }

    fn note_texture(&self, texture: TextureHandle, summary: &mut RecordSummary) {
        if self.back_buffers.contains(&texture) {
            summary.touches_back_buffer = true;
        }
    }

    fn record_barriers(
        &mut self,
        cmd: vk::CommandBuffer,
        barriers: &[ResourceBarrier],
        summary: &mut RecordSummary,
    ) -> BackendResult<()> {
        let mut src_stages = vk::PipelineStageFlags::empty();
        let mut dst_stages = vk::PipelineStageFlags::empty();
        let mut memory_barriers = Vec::new();
        let mut image_barriers = Vec::new();

        for barrier in barriers {
            let (src, dst, texture) = match *barrier {
                ResourceBarrier::Transition {
                    resource,
                    before,
                    after,
                } => {
                    let texture = match resource {
                        ResourceId::Texture(texture) => Some(texture),
                        _ => None,
                    };
                    (state_scope(before), state_scope(after), texture)
                }
                ResourceBarrier::Uav { .. } => (unordered_access_scope(), unordered_access_scope(), None),
            };
            src_stages |= src.stages;
            dst_stages |= dst.stages;

            match texture {
                Some(handle) => {
                    self.note_texture(handle, summary);
                    let queue_family = self.queue_family;
                    let new_layout = self.resolve_layout(dst.layout);
                    let texture = self.vk_texture_mut(handle)?;
                    // Surfaces have undefined contents until their first transition
                    let old_layout = if texture.initialized {
                        texture.layout
                    } else {
                        vk::ImageLayout::UNDEFINED
                    };
                    texture.initialized = true;
                    texture.layout = new_layout;
                    image_barriers.push(
                        vk::ImageMemoryBarrier::default()
                            .src_access_mask(src.access)
                            .dst_access_mask(dst.access)
                            .old_layout(old_layout)
                            .new_layout(new_layout)
                            .src_queue_family_index(queue_family)
                            .dst_queue_family_index(queue_family)
                            .image(texture.image)
                            .subresource_range(color_subresource_range()),
                    );
                }
                // Buffers have no layout, a global barrier orders their accesses
                None => memory_barriers.push(
                    vk::MemoryBarrier::default()
                        .src_access_mask(src.access)
                        .dst_access_mask(dst.access),
                ),
            }
        }

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &memory_barriers,
                &[],
                &image_barriers,
            );
        }
        Ok(())
    }

    fn record_build(
        &self,
        cmd: vk::CommandBuffer,
        desc: &BuildAccelerationStructureDesc,
    ) -> BackendResult<()> {
        let geometry = self.build_geometry(&desc.inputs)?;
        let scratch = self.vk_buffer(desc.scratch)?;
        if scratch.address % self.capabilities.scratch_alignment as u64 != 0 {
            return Err(BackendError::Validation("misaligned scratch address".to_string()));
        }
        let destination = self.vk_accel(desc.destination)?.handle;

        let build_info = geometry
            .build_info()
            .dst_acceleration_structure(destination)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.address,
            });
        let ranges = geometry.ranges();
        let range_pointers = [ranges.as_ptr()];

        unsafe {
            (self.acceleration_fn.fp().cmd_build_acceleration_structures_khr)(
                cmd,
                1,
                &build_info,
                range_pointers.as_ptr(),
            );
        }
        Ok(())
    }

    fn strided_region(&self, region: &ShaderTableRegion) -> BackendResult<vk::StridedDeviceAddressRegionKHR> {
        let buffer = self.vk_buffer(region.buffer)?;
        if region.offset + region.size > buffer.size {
            return Err(BackendError::Validation(
                "shader table region exceeds its buffer".to_string(),
            ));
        }
        Ok(vk::StridedDeviceAddressRegionKHR::default()
            .device_address(buffer.address + region.offset)
            .stride(region.stride)
            .size(region.size))
    }

    fn record_command(
        &mut self,
        cmd: vk::CommandBuffer,
        command: &Command,
        bindings: &mut Bindings,
        summary: &mut RecordSummary,
    ) -> BackendResult<()> {
        match command {
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let region = vk::BufferCopy::default()
                    .src_offset(*src_offset)
                    .dst_offset(*dst_offset)
                    .size(*size);
                let (src, dst) = (self.vk_buffer(*src)?.buffer, self.vk_buffer(*dst)?.buffer);
                unsafe { self.device.cmd_copy_buffer(cmd, src, dst, &[region]) };
            }
            Command::Barriers(barriers) => self.record_barriers(cmd, barriers, summary)?,
            Command::BuildAccelerationStructure(desc) => self.record_build(cmd, desc)?,
            Command::SetDescriptorHeap(heap) => {
                // Descriptor sets are bound per table; only check the heap exists
                self.vk_heap(*heap)?;
            }
            Command::SetRootSignature(root_signature) => {
                let signature = self.vk_root_signature(*root_signature)?;
                bindings.pipeline_layout = Some(signature.pipeline_layout);
                bindings.parameters = signature.parameters.clone();
            }
            Command::SetDescriptorTable {
                parameter,
                heap,
                offset,
            } => {
                let layout = bindings.pipeline_layout.ok_or_else(|| {
                    BackendError::Validation("descriptor table before root signature".to_string())
                })?;
                if bindings.parameters.get(*parameter as usize) != Some(&ParameterBinding::Table) {
                    return Err(BackendError::Validation(format!(
                        "parameter {} is not a descriptor table",
                        parameter
                    )));
                }
                if *offset != 0 {
                    return Err(BackendError::Validation(
                        "descriptor tables must start at slot 0".to_string(),
                    ));
                }
                let set = self.vk_heap(*heap)?.set;
                unsafe {
                    self.device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::RAY_TRACING_KHR,
                        layout,
                        TABLE_SET,
                        &[set],
                        &[],
                    );
                }
            }
            Command::SetConstantBuffer { parameter, buffer } => {
                let layout = bindings.pipeline_layout.ok_or_else(|| {
                    BackendError::Validation("constant buffer before root signature".to_string())
                })?;
                let binding = match bindings.parameters.get(*parameter as usize) {
                    Some(ParameterBinding::Constants { binding }) => *binding,
                    _ => {
                        return Err(BackendError::Validation(format!(
                            "parameter {} is not a constant buffer",
                            parameter
                        )))
                    }
                };
                let buffer_info = [vk::DescriptorBufferInfo::default()
                    .buffer(self.vk_buffer(*buffer)?.buffer)
                    .offset(0)
                    .range(vk::WHOLE_SIZE)];
                let write = vk::WriteDescriptorSet::default()
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info);
                unsafe {
                    self.push_descriptor_fn.cmd_push_descriptor_set(
                        cmd,
                        vk::PipelineBindPoint::RAY_TRACING_KHR,
                        layout,
                        CONSTANTS_SET,
                        &[write],
                    );
                }
            }
            Command::SetPipeline(pipeline) => {
                let pipeline = self.vk_pipeline(*pipeline)?.pipeline;
                unsafe {
                    self.device
                        .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline)
                };
            }
            Command::ClearTexture { texture, color } => {
                self.note_texture(*texture, summary);
                let target = self.vk_texture(*texture)?;
                let clear = vk::ClearColorValue { float32: *color };
                unsafe {
                    self.device.cmd_clear_color_image(
                        cmd,
                        target.image,
                        target.layout,
                        &clear,
                        &[color_subresource_range()],
                    );
                }
            }
            Command::DispatchRays(desc) => {
                let raygen = self.strided_region(&desc.ray_generation)?;
                let miss = self.strided_region(&desc.miss)?;
                let hit = self.strided_region(&desc.hit_group)?;
                let callable = vk::StridedDeviceAddressRegionKHR::default();
                unsafe {
                    self.ray_tracing_fn.cmd_trace_rays(
                        cmd,
                        &raygen,
                        &miss,
                        &hit,
                        &callable,
                        desc.width,
                        desc.height,
                        desc.depth,
                    );
                }
            }
            Command::CopyTexture { src, dst } => {
                self.note_texture(*src, summary);
                self.note_texture(*dst, summary);
                let source = self.vk_texture(*src)?;
                let target = self.vk_texture(*dst)?;
                if source.extent != target.extent {
                    return Err(BackendError::Validation(format!(
                        "texture copy between {:?} and {:?} extents",
                        source.extent, target.extent
                    )));
                }
                let extent = vk::Extent3D {
                    width: source.extent.width,
                    height: source.extent.height,
                    depth: 1,
                };
                if source.format == target.format {
                    let region = vk::ImageCopy::default()
                        .src_subresource(color_subresource_layers())
                        .dst_subresource(color_subresource_layers())
                        .extent(extent);
                    unsafe {
                        self.device.cmd_copy_image(
                            cmd,
                            source.image,
                            source.layout,
                            target.image,
                            target.layout,
                            &[region],
                        );
                    }
                } else {
                    // Blits swizzle between RGBA and BGRA surfaces
                    let corner = vk::Offset3D {
                        x: extent.width as i32,
                        y: extent.height as i32,
                        z: 1,
                    };
                    let region = vk::ImageBlit::default()
                        .src_subresource(color_subresource_layers())
                        .src_offsets([vk::Offset3D::default(), corner])
                        .dst_subresource(color_subresource_layers())
                        .dst_offsets([vk::Offset3D::default(), corner]);
                    unsafe {
                        self.device.cmd_blit_image(
                            cmd,
                            source.image,
                            source.layout,
                            target.image,
                            target.layout,
                            &[region],
                            vk::Filter::NEAREST,
                        );
                    }
                }
            }
            Command::CopyTextureToBuffer {
                src,
                dst,
                row_pitch,
            } => {
                let source = self.vk_texture(*src)?;
                let texel_size = convert_format_back(source.format)
                    .map(|f| f.bytes_per_pixel())
                    .unwrap_or(4);
                if row_pitch % texel_size != 0 {
                    return Err(BackendError::Validation(format!(
                        "row pitch {} is not a whole number of texels",
                        row_pitch
                    )));
                }
                let region = vk::BufferImageCopy::default()
                    .buffer_offset(0)
                    .buffer_row_length(row_pitch / texel_size)
                    .buffer_image_height(0)
                    .image_subresource(color_subresource_layers())
                    .image_extent(vk::Extent3D {
                        width: source.extent.width,
                        height: source.extent.height,
                        depth: 1,
                    });
                let buffer = self.vk_buffer(*dst)?.buffer;
                unsafe {
                    self.device.cmd_copy_image_to_buffer(
                        cmd,
                        source.image,
                        source.layout,
                        buffer,
                        &[region],
                    );
                }
            }
        }
        Ok(())
    }
}
