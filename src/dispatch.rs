//! Dispatch driver: binds everything the ray tracing pipeline reads and
//! records one dispatch over the whole output.

use crate::backend::*;
use crate::pipeline::{RayTracingPipeline, CAMERA_PARAMETER, DEBUG_PARAMETER, DESCRIPTOR_TABLE_PARAMETER};
use crate::shader_table::ShaderBindingTable;

/// Per-frame inputs of a dispatch
#[derive(Debug, Clone, Copy)]
pub struct DispatchBindings<'a> {
    pub pipeline: &'a RayTracingPipeline,
    pub shader_table: &'a ShaderBindingTable,
    pub camera_constants: BufferHandle,
    pub debug_constants: Option<BufferHandle>,
    pub ray_output: TextureHandle,
}

#[derive(Debug, Clone)]
pub struct DispatchDriver {
    width: u32,
    height: u32,
    background: [f32; 4],
}

impl DispatchDriver {
    pub fn new(width: u32, height: u32, background: [f32; 4]) -> Self {
        Self {
            width,
            height,
            background,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn background(&self) -> [f32; 4] {
        self.background
    }

    /// Record the binds, the background clear and the dispatch.
    ///
    /// The ray output must already be in the unordered-access state.
    pub fn record(&self, list: &mut CommandList, bindings: &DispatchBindings<'_>) {
        let heap = bindings.pipeline.descriptor_heap;
        list.set_descriptor_heap(heap);
        list.set_root_signature(bindings.pipeline.root_signature);
        list.set_descriptor_table(DESCRIPTOR_TABLE_PARAMETER, heap, 0);
        list.set_constant_buffer(CAMERA_PARAMETER, bindings.camera_constants);
        if let Some(debug) = bindings.debug_constants {
            list.set_constant_buffer(DEBUG_PARAMETER, debug);
        }
        list.set_pipeline(bindings.pipeline.pipeline);

        list.clear_texture(bindings.ray_output, self.background);
        // The clear and the dispatch both write the output
        list.uav_barrier(Some(ResourceId::Texture(bindings.ray_output)));

        let table = bindings.shader_table;
        list.dispatch_rays(DispatchRaysDesc {
            ray_generation: table.ray_generation_region(),
            miss: table.miss_region(),
            hit_group: table.hit_group_region(),
            width: self.width,
            height: self.height,
            depth: 1,
        });
    }
}
