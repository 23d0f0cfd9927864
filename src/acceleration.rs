//! Acceleration structure builder
//!
//! One bottom-level structure is built per mesh and one top-level structure
//! over instances referencing them. Every build is followed by a UAV barrier
//! on the structure it wrote, so the top-level build never reads a
//! bottom-level structure whose build is still in flight.

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::backend::*;
use crate::context::GpuContext;
use crate::error::{RendererError, RendererResult};
use crate::resources::GpuBuffer;
use crate::upload::{GpuMesh, Uploader};

/// Disable back-face culling for the instance
pub const INSTANCE_FLAG_TRIANGLE_CULL_DISABLE: u8 = 0x1;
/// Treat all geometry of the instance as opaque
pub const INSTANCE_FLAG_FORCE_OPAQUE: u8 = 0x4;

/// One instance as consumed by a top-level build.
///
/// The layout is shared by D3D12 and Vulkan: a row-major 3x4 transform, a
/// 24-bit id packed with an 8-bit mask, a 24-bit hit group offset packed with
/// 8 bits of flags, and the bottom-level structure address.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    pub transform: [[f32; 4]; 3],
    pub instance_id_and_mask: u32,
    pub hit_group_offset_and_flags: u32,
    pub blas_address: u64,
}

impl InstanceRecord {
    pub fn new(blas_address: GpuAddress, transform: Mat4, instance_id: u32, mask: u8, flags: u8) -> Self {
        let rows = transform.transpose();
        Self {
            transform: [
                rows.x_axis.to_array(),
                rows.y_axis.to_array(),
                rows.z_axis.to_array(),
            ],
            instance_id_and_mask: (instance_id & 0x00ff_ffff) | ((mask as u32) << 24),
            hit_group_offset_and_flags: (flags as u32) << 24,
            blas_address,
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id_and_mask & 0x00ff_ffff
    }

    pub fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    pub fn flags(&self) -> u8 {
        (self.hit_group_offset_and_flags >> 24) as u8
    }

    /// Transform as a column-major matrix
    pub fn transform(&self) -> Mat4 {
        let [r0, r1, r2] = self.transform;
        Mat4::from_cols_array_2d(&[r0, r1, r2, [0.0, 0.0, 0.0, 1.0]]).transpose()
    }
}

/// Instance of a mesh placed into the top-level structure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshInstance {
    pub mesh_index: usize,
    pub transform: Mat4,
    pub mask: u8,
}

impl MeshInstance {
    pub fn identity(mesh_index: usize) -> Self {
        Self {
            mesh_index,
            transform: Mat4::IDENTITY,
            mask: 0xff,
        }
    }
}

/// A built acceleration structure and the buffer it lives in
#[derive(Debug)]
pub struct AccelerationStructure {
    pub handle: AccelerationStructureHandle,
    pub address: GpuAddress,
    pub result: GpuBuffer,
    pub primitive_count: u32,
}

impl AccelerationStructure {
    pub fn release<B: RayTracingBackend>(self, ctx: &mut GpuContext<B>) {
        ctx.backend_mut().destroy_acceleration_structure(self.handle);
        ctx.release_buffer(self.result);
    }
}

/// Every structure built for a scene
#[derive(Debug)]
pub struct SceneAccelerationStructures {
    pub bottom_level: Vec<AccelerationStructure>,
    pub top_level: AccelerationStructure,
    pub instance_buffer: GpuBuffer,
    pub instances: Vec<InstanceRecord>,
}

impl SceneAccelerationStructures {
    pub fn release<B: RayTracingBackend>(self, ctx: &mut GpuContext<B>) {
        self.top_level.release(ctx);
        for blas in self.bottom_level {
            blas.release(ctx);
        }
        ctx.release_buffer(self.instance_buffer);
    }
}

/// Query sizes, allocate result and scratch memory and record one build.
///
/// The scratch buffer is retired under the fence value of the next submit.
fn record_build<B: RayTracingBackend>(
    ctx: &mut GpuContext<B>,
    list: &mut CommandList,
    inputs: AccelerationStructureInputs,
    label: &str,
) -> RendererResult<AccelerationStructure> {
    let kind = inputs.kind();
    let primitive_count = inputs.primitive_count();
    let sizes = ctx
        .backend()
        .acceleration_structure_prebuild_info(&inputs)
        .map_err(|e| RendererError::AsBuildFailed(format!("{}: {}", label, e)))?;
    if sizes.result_size == 0 {
        return Err(RendererError::AsBuildFailed(format!(
            "{}: device reported an empty result size",
            label
        )));
    }
    log::debug!(
        "{} prebuild: result {} bytes, scratch {} bytes",
        label,
        sizes.result_size,
        sizes.scratch_size
    );

    let result = ctx.create_buffer(&BufferDescriptor {
        label: Some(label.to_string()),
        size: sizes.result_size,
        usage: BufferUsage::ACCELERATION_STRUCTURE_STORAGE,
        location: MemoryLocation::Default,
        initial_state: ResourceState::AccelerationStructure,
    })?;
    let scratch = ctx.create_buffer(&BufferDescriptor {
        label: Some(format!("{} (scratch)", label)),
        size: sizes.scratch_size.max(1),
        usage: BufferUsage::SCRATCH | BufferUsage::STORAGE,
        location: MemoryLocation::Default,
        initial_state: ResourceState::UnorderedAccess,
    })?;

    let handle = ctx
        .backend_mut()
        .create_acceleration_structure(kind, result.handle(), sizes.result_size)
        .map_err(|e| RendererError::AsBuildFailed(format!("{}: {}", label, e)))?;
    let address = ctx.backend().acceleration_structure_address(handle)?;

    list.build_acceleration_structure(BuildAccelerationStructureDesc {
        inputs,
        destination: handle,
        scratch: scratch.handle(),
    });
    list.uav_barrier(Some(ResourceId::AccelerationStructure(handle)));

    ctx.retire_buffer(scratch);
    Ok(AccelerationStructure {
        handle,
        address,
        result,
        primitive_count,
    })
}

/// Record the bottom-level build for one mesh
pub fn build_bottom_level<B: RayTracingBackend>(
    ctx: &mut GpuContext<B>,
    list: &mut CommandList,
    mesh: &GpuMesh,
    label: &str,
) -> RendererResult<AccelerationStructure> {
    let inputs = AccelerationStructureInputs::BottomLevel {
        geometries: vec![mesh.geometry()],
    };
    record_build(ctx, list, inputs, label)
}

/// Record the instance upload and top-level build over `bottom_level`
pub fn build_top_level<B: RayTracingBackend>(
    ctx: &mut GpuContext<B>,
    list: &mut CommandList,
    uploader: &mut Uploader,
    bottom_level: &[AccelerationStructure],
    instances: &[MeshInstance],
) -> RendererResult<(AccelerationStructure, GpuBuffer, Vec<InstanceRecord>)> {
    if instances.is_empty() {
        return Err(RendererError::InvalidScene("scene has no instances".to_string()));
    }

    let records = instances
        .iter()
        .enumerate()
        .map(|(id, instance)| {
            let blas = bottom_level.get(instance.mesh_index).ok_or_else(|| {
                RendererError::InvalidScene(format!(
                    "instance {} references missing mesh {}",
                    id, instance.mesh_index
                ))
            })?;
            Ok(InstanceRecord::new(
                blas.address,
                instance.transform,
                id as u32,
                instance.mask,
                INSTANCE_FLAG_TRIANGLE_CULL_DISABLE,
            ))
        })
        .collect::<RendererResult<Vec<_>>>()?;

    let instance_buffer = uploader.upload_buffer(
        ctx,
        list,
        bytemuck::cast_slice(&records),
        BufferUsage::ACCELERATION_STRUCTURE_INPUT,
        ResourceState::ShaderResource,
        "instances",
    )?;

    let inputs = AccelerationStructureInputs::TopLevel {
        instance_buffer: instance_buffer.handle(),
        instance_count: records.len() as u32,
    };
    let tlas = record_build(ctx, list, inputs, "top-level")?;
    Ok((tlas, instance_buffer, records))
}

/// Record every build for a scene: one structure per mesh, then the top level
pub fn build_scene<B: RayTracingBackend>(
    ctx: &mut GpuContext<B>,
    list: &mut CommandList,
    uploader: &mut Uploader,
    meshes: &[GpuMesh],
    instances: &[MeshInstance],
) -> RendererResult<SceneAccelerationStructures> {
    if meshes.is_empty() {
        return Err(RendererError::InvalidScene("scene has no meshes".to_string()));
    }

    let mut bottom_level = Vec::with_capacity(meshes.len());
    for (i, mesh) in meshes.iter().enumerate() {
        bottom_level.push(build_bottom_level(ctx, list, mesh, &format!("bottom-level {}", i))?);
    }

    let (top_level, instance_buffer, instances) =
        build_top_level(ctx, list, uploader, &bottom_level, instances)?;

    log::info!(
        "Recorded {} bottom-level builds and 1 top-level build over {} instances",
        bottom_level.len(),
        instances.len()
    );

    Ok(SceneAccelerationStructures {
        bottom_level,
        top_level,
        instance_buffer,
        instances,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_instance_record_layout() {
        assert_eq!(std::mem::size_of::<InstanceRecord>(), 64);
        assert_eq!(std::mem::offset_of!(InstanceRecord, instance_id_and_mask), 48);
        assert_eq!(std::mem::offset_of!(InstanceRecord, blas_address), 56);
    }

    #[test]
    fn test_instance_record_packing() {
        let transform = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let record = InstanceRecord::new(0xdead_0000, transform, 7, 0xff, INSTANCE_FLAG_TRIANGLE_CULL_DISABLE);

        assert_eq!(record.instance_id(), 7);
        assert_eq!(record.mask(), 0xff);
        assert_eq!(record.flags(), INSTANCE_FLAG_TRIANGLE_CULL_DISABLE);
        assert_eq!(record.transform[0], [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(record.transform[2], [0.0, 0.0, 1.0, 3.0]);
        assert_eq!(record.transform(), transform);
    }

    #[test]
    fn test_instance_id_is_truncated_to_24_bits() {
        let record = InstanceRecord::new(0, Mat4::IDENTITY, 0x0123_4567, 0x0f, 0);
        assert_eq!(record.instance_id(), 0x23_4567);
        assert_eq!(record.mask(), 0x0f);
    }
}
