//! Ray tracing pipeline state: global root signature, pipeline and descriptor heap

use crate::backend::*;
use crate::context::GpuContext;
use crate::error::RendererResult;
use crate::shader_table::ShaderTableEntries;
use crate::shaders::ShaderLibrary;

pub const RAY_GENERATION_EXPORT: &str = "RayGen";
pub const MISS_EXPORT: &str = "Miss";
pub const CLOSEST_HIT_EXPORT: &str = "ClosestHit";
pub const HIT_GROUP_EXPORT: &str = "HitGroup";

/// Color plus hit flag
pub const MAX_PAYLOAD_SIZE: u32 = 16;
/// Two barycentric coordinates
pub const MAX_ATTRIBUTE_SIZE: u32 = 8;
/// Primary rays only
pub const MAX_RECURSION_DEPTH: u32 = 1;

/// Root parameter slots, in binding order
pub const DESCRIPTOR_TABLE_PARAMETER: u32 = 0;
pub const CAMERA_PARAMETER: u32 = 1;
pub const DEBUG_PARAMETER: u32 = 2;

/// Slot 0 holds the top-level structure, slot 1 the ray output
pub fn global_root_signature() -> RootSignatureDescriptor {
    RootSignatureDescriptor {
        label: Some("global root signature".to_string()),
        parameters: vec![
            RootParameter::DescriptorTable(vec![
                DescriptorRange {
                    kind: DescriptorKind::AccelerationStructure,
                    register: 0,
                    count: 1,
                },
                DescriptorRange {
                    kind: DescriptorKind::StorageTexture,
                    register: 1,
                    count: 1,
                },
            ]),
            RootParameter::ConstantBuffer { register: 0 },
            RootParameter::ConstantBuffer { register: 1 },
        ],
    }
}

/// Records in shader table order
pub fn shader_table_entries() -> ShaderTableEntries {
    ShaderTableEntries {
        ray_generation: RAY_GENERATION_EXPORT.to_string(),
        miss: vec![MISS_EXPORT.to_string()],
        hit_groups: vec![HIT_GROUP_EXPORT.to_string()],
    }
}

pub fn pipeline_descriptor(
    root_signature: RootSignatureHandle,
    shaders: &ShaderLibrary,
) -> RayTracingPipelineDescriptor {
    let module = |export: &str, stage, spirv: &Vec<u32>| ShaderModuleDescriptor {
        export_name: export.to_string(),
        stage,
        entry_point: "main".to_string(),
        spirv: spirv.clone(),
    };
    RayTracingPipelineDescriptor {
        label: Some("ray tracing pipeline".to_string()),
        root_signature,
        shaders: vec![
            module(RAY_GENERATION_EXPORT, ShaderStage::RayGeneration, &shaders.ray_generation),
            module(MISS_EXPORT, ShaderStage::Miss, &shaders.miss),
            module(CLOSEST_HIT_EXPORT, ShaderStage::ClosestHit, &shaders.closest_hit),
        ],
        hit_groups: vec![HitGroupDescriptor {
            export_name: HIT_GROUP_EXPORT.to_string(),
            closest_hit: CLOSEST_HIT_EXPORT.to_string(),
        }],
        max_payload_size: MAX_PAYLOAD_SIZE,
        max_attribute_size: MAX_ATTRIBUTE_SIZE,
        max_recursion_depth: MAX_RECURSION_DEPTH,
    }
}

/// The compiled pipeline and the objects bound with it every frame
#[derive(Debug)]
pub struct RayTracingPipeline {
    pub root_signature: RootSignatureHandle,
    pub pipeline: PipelineHandle,
    pub descriptor_heap: DescriptorHeapHandle,
}

impl RayTracingPipeline {
    pub fn new<B: RayTracingBackend>(
        ctx: &mut GpuContext<B>,
        shaders: &ShaderLibrary,
        top_level: AccelerationStructureHandle,
        ray_output: TextureHandle,
    ) -> RendererResult<Self> {
        let backend = ctx.backend_mut();
        let root_signature = backend.create_root_signature(&global_root_signature())?;
        let pipeline = match backend.create_ray_tracing_pipeline(&pipeline_descriptor(root_signature, shaders)) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                backend.destroy_root_signature(root_signature);
                return Err(e.into());
            }
        };
        let descriptor_heap = match backend.create_descriptor_heap(
            root_signature,
            &[
                DescriptorEntry::AccelerationStructure(top_level),
                DescriptorEntry::StorageTexture(ray_output),
            ],
        ) {
            Ok(heap) => heap,
            Err(e) => {
                backend.destroy_pipeline(pipeline);
                backend.destroy_root_signature(root_signature);
                return Err(e.into());
            }
        };
        log::info!("Created ray tracing pipeline");

        Ok(Self {
            root_signature,
            pipeline,
            descriptor_heap,
        })
    }

    pub fn release<B: RayTracingBackend>(self, ctx: &mut GpuContext<B>) {
        let backend = ctx.backend_mut();
        backend.destroy_descriptor_heap(self.descriptor_heap);
        backend.destroy_pipeline(self.pipeline);
        backend.destroy_root_signature(self.root_signature);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> ShaderLibrary {
        ShaderLibrary::placeholder()
    }

    #[test]
    fn test_root_signature_layout() {
        let desc = global_root_signature();
        assert_eq!(desc.parameters.len(), 3);
        assert!(matches!(
            desc.parameters[DESCRIPTOR_TABLE_PARAMETER as usize],
            RootParameter::DescriptorTable(ref ranges) if ranges.len() == 2
        ));
        assert_eq!(
            desc.parameters[DEBUG_PARAMETER as usize],
            RootParameter::ConstantBuffer { register: 1 }
        );
    }

    #[test]
    fn test_every_export_has_an_identifier() {
        let mut ctx = GpuContext::new(DummyBackend::new(4, 4));
        let backend = ctx.backend_mut();
        let root_signature = backend.create_root_signature(&global_root_signature()).unwrap();
        let pipeline = backend
            .create_ray_tracing_pipeline(&pipeline_descriptor(root_signature, &library()))
            .unwrap();

        let entries = shader_table_entries();
        for export in std::iter::once(&entries.ray_generation)
            .chain(&entries.miss)
            .chain(&entries.hit_groups)
        {
            assert!(ctx.backend().shader_identifier(pipeline, export).is_ok(), "{}", export);
        }
    }
}
