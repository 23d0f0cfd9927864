//! Shader binding table layout and construction.
//!
//! The table holds one ray generation record followed by the miss records and
//! then the hit group records. All records share one size, and every table
//! starts on the device's shader table alignment:
//!
//! ```text
//! | raygen | pad | miss 0 .. miss n | pad | hit 0 .. hit m |
//! 0        ^ record_size            ^ miss_offset + n * record_size, aligned
//! ```

use crate::backend::*;
use crate::context::GpuContext;
use crate::error::{RendererError, RendererResult};
use crate::resources::GpuBuffer;
use crate::upload::Uploader;

/// Size of the descriptor table pointer that may follow an identifier
pub const DESCRIPTOR_POINTER_SIZE: u64 = 8;

/// Round `value` up to a multiple of `alignment` (a power of two)
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Byte layout of a shader binding table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderTableLayout {
    pub identifier_size: u64,
    pub alignment: u64,
    pub record_size: u64,
    pub ray_generation_offset: u64,
    pub miss_offset: u64,
    pub miss_count: u64,
    pub hit_group_offset: u64,
    pub hit_group_count: u64,
    pub size: u64,
    /// Whether each record embeds the descriptor heap pointer
    pub descriptor_pointer: bool,
}

impl ShaderTableLayout {
    pub fn new(
        identifier_size: u64,
        alignment: u64,
        miss_count: u64,
        hit_group_count: u64,
        descriptor_pointer: bool,
    ) -> RendererResult<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(RendererError::ShaderBindingTable(format!(
                "table alignment {} is not a power of two",
                alignment
            )));
        }
        if identifier_size == 0 {
            return Err(RendererError::ShaderBindingTable(
                "shader identifier size is zero".to_string(),
            ));
        }
        if miss_count == 0 || hit_group_count == 0 {
            return Err(RendererError::ShaderBindingTable(
                "at least one miss and one hit group record are required".to_string(),
            ));
        }

        let payload = identifier_size + if descriptor_pointer { DESCRIPTOR_POINTER_SIZE } else { 0 };
        let record_size = align_up(payload, alignment);
        let ray_generation_offset = 0;
        let miss_offset = align_up(ray_generation_offset + record_size, alignment);
        let hit_group_offset = align_up(miss_offset + miss_count * record_size, alignment);
        let size = hit_group_offset + hit_group_count * record_size;

        Ok(Self {
            identifier_size,
            alignment,
            record_size,
            ray_generation_offset,
            miss_offset,
            miss_count,
            hit_group_offset,
            hit_group_count,
            size,
            descriptor_pointer,
        })
    }

    /// Layout with one ray generation, one miss and one hit group record
    pub fn single(capabilities: &DeviceCapabilities, descriptor_pointer: bool) -> RendererResult<Self> {
        Self::new(
            capabilities.shader_identifier_size as u64,
            capabilities.shader_table_alignment as u64,
            1,
            1,
            descriptor_pointer,
        )
    }

    /// Offsets of every record in table order
    pub fn record_offsets(&self) -> Vec<u64> {
        let mut offsets = vec![self.ray_generation_offset];
        offsets.extend((0..self.miss_count).map(|i| self.miss_offset + i * self.record_size));
        offsets.extend((0..self.hit_group_count).map(|i| self.hit_group_offset + i * self.record_size));
        offsets
    }
}

/// Shader exports referenced by the table, in table order
#[derive(Debug, Clone)]
pub struct ShaderTableEntries {
    pub ray_generation: String,
    pub miss: Vec<String>,
    pub hit_groups: Vec<String>,
}

/// Fill the table bytes from identifiers and an optional heap pointer
pub fn write_records(
    layout: &ShaderTableLayout,
    identifiers: &[Vec<u8>],
    descriptor_heap_base: Option<GpuAddress>,
) -> RendererResult<Vec<u8>> {
    let offsets = layout.record_offsets();
    if identifiers.len() != offsets.len() {
        return Err(RendererError::ShaderBindingTable(format!(
            "{} identifiers for {} records",
            identifiers.len(),
            offsets.len()
        )));
    }

    let mut bytes = vec![0u8; layout.size as usize];
    for (identifier, offset) in identifiers.iter().zip(offsets) {
        if identifier.len() as u64 != layout.identifier_size {
            return Err(RendererError::ShaderBindingTable(format!(
                "identifier of {} bytes, expected {}",
                identifier.len(),
                layout.identifier_size
            )));
        }
        let at = offset as usize;
        bytes[at..at + identifier.len()].copy_from_slice(identifier);
        if let (true, Some(base)) = (layout.descriptor_pointer, descriptor_heap_base) {
            let at = at + identifier.len();
            bytes[at..at + DESCRIPTOR_POINTER_SIZE as usize].copy_from_slice(&base.to_le_bytes());
        }
    }
    Ok(bytes)
}

/// A shader binding table resident in GPU memory
#[derive(Debug)]
pub struct ShaderBindingTable {
    layout: ShaderTableLayout,
    buffer: GpuBuffer,
}

impl ShaderBindingTable {
    /// Record the upload of a table for `pipeline`.
    ///
    /// Records embed the descriptor heap pointer when the device supports
    /// local descriptor tables.
    pub fn build<B: RayTracingBackend>(
        ctx: &mut GpuContext<B>,
        list: &mut CommandList,
        uploader: &mut Uploader,
        pipeline: PipelineHandle,
        entries: &ShaderTableEntries,
        heap: DescriptorHeapHandle,
    ) -> RendererResult<Self> {
        let capabilities = ctx.capabilities().clone();
        let layout = ShaderTableLayout::new(
            capabilities.shader_identifier_size as u64,
            capabilities.shader_table_alignment as u64,
            entries.miss.len() as u64,
            entries.hit_groups.len() as u64,
            capabilities.local_descriptor_tables,
        )?;

        let identifiers = std::iter::once(&entries.ray_generation)
            .chain(&entries.miss)
            .chain(&entries.hit_groups)
            .map(|export| ctx.backend().shader_identifier(pipeline, export))
            .collect::<BackendResult<Vec<_>>>()?;
        let heap_base = if layout.descriptor_pointer {
            Some(ctx.backend().descriptor_heap_gpu_base(heap)?)
        } else {
            None
        };
        let bytes = write_records(&layout, &identifiers, heap_base)?;

        let buffer = uploader.upload_buffer(
            ctx,
            list,
            &bytes,
            BufferUsage::SHADER_BINDING_TABLE,
            ResourceState::ShaderResource,
            "shader binding table",
        )?;
        log::debug!(
            "Shader binding table: record {} bytes, miss at {}, hit groups at {}, {} bytes total",
            layout.record_size,
            layout.miss_offset,
            layout.hit_group_offset,
            layout.size
        );
        Ok(Self { layout, buffer })
    }

    pub fn layout(&self) -> &ShaderTableLayout {
        &self.layout
    }

    pub fn handle(&self) -> BufferHandle {
        self.buffer.handle()
    }

    pub fn ray_generation_region(&self) -> ShaderTableRegion {
        ShaderTableRegion {
            buffer: self.buffer.handle(),
            offset: self.layout.ray_generation_offset,
            size: self.layout.record_size,
            stride: self.layout.record_size,
        }
    }

    pub fn miss_region(&self) -> ShaderTableRegion {
        ShaderTableRegion {
            buffer: self.buffer.handle(),
            offset: self.layout.miss_offset,
            size: self.layout.miss_count * self.layout.record_size,
            stride: self.layout.record_size,
        }
    }

    pub fn hit_group_region(&self) -> ShaderTableRegion {
        ShaderTableRegion {
            buffer: self.buffer.handle(),
            offset: self.layout.hit_group_offset,
            size: self.layout.hit_group_count * self.layout.record_size,
            stride: self.layout.record_size,
        }
    }

    pub fn release<B: RayTracingBackend>(self, ctx: &mut GpuContext<B>) {
        ctx.release_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 32), 96);
    }

    #[rstest]
    #[case::d3d12(32, 64, false)]
    #[case::d3d12_with_pointer(32, 64, true)]
    #[case::nvidia_vulkan(32, 64, false)]
    #[case::amd_vulkan(32, 32, false)]
    #[case::wide_identifier(48, 32, true)]
    fn test_offsets_are_aligned(#[case] identifier: u64, #[case] alignment: u64, #[case] pointer: bool) {
        let layout = ShaderTableLayout::new(identifier, alignment, 1, 1, pointer).unwrap();
        for offset in layout.record_offsets() {
            assert_eq!(offset % alignment, 0, "offset {} in {:?}", offset, layout);
        }
        assert!(layout.record_size >= identifier);
        assert_eq!(layout.size, layout.hit_group_offset + layout.record_size);
    }

    #[test]
    fn test_single_record_layout() {
        let layout = ShaderTableLayout::new(32, 64, 1, 1, false).unwrap();
        assert_eq!(layout.record_size, 64);
        assert_eq!(layout.ray_generation_offset, 0);
        assert_eq!(layout.miss_offset, 64);
        assert_eq!(layout.hit_group_offset, 128);
        assert_eq!(layout.size, align_up(layout.record_size * 3, 64));
    }

    #[test]
    fn test_multiple_miss_records() {
        let layout = ShaderTableLayout::new(32, 64, 2, 3, true).unwrap();
        assert_eq!(layout.record_size, 64);
        assert_eq!(layout.hit_group_offset, 64 + 2 * 64);
        assert_eq!(layout.size, layout.hit_group_offset + 3 * 64);
        assert_eq!(layout.record_offsets().len(), 6);
    }

    #[test]
    fn test_invalid_alignment_rejected() {
        assert!(ShaderTableLayout::new(32, 48, 1, 1, false).is_err());
        assert!(ShaderTableLayout::new(32, 0, 1, 1, false).is_err());
        assert!(ShaderTableLayout::new(0, 64, 1, 1, false).is_err());
    }

    #[test]
    fn test_write_records_embeds_pointer() {
        let layout = ShaderTableLayout::new(4, 16, 1, 1, true).unwrap();
        let identifiers = vec![vec![1u8; 4], vec![2u8; 4], vec![3u8; 4]];
        let bytes = write_records(&layout, &identifiers, Some(0x1122_3344)).unwrap();

        assert_eq!(bytes.len(), layout.size as usize);
        assert_eq!(&bytes[0..4], &[1, 1, 1, 1]);
        assert_eq!(&bytes[4..12], &0x1122_3344u64.to_le_bytes());
        let miss = layout.miss_offset as usize;
        assert_eq!(&bytes[miss..miss + 4], &[2, 2, 2, 2]);
        let hit = layout.hit_group_offset as usize;
        assert_eq!(&bytes[hit..hit + 4], &[3, 3, 3, 3]);
    }

    #[test]
    fn test_write_records_checks_identifier_size() {
        let layout = ShaderTableLayout::new(4, 16, 1, 1, false).unwrap();
        let identifiers = vec![vec![1u8; 4], vec![2u8; 3], vec![3u8; 4]];
        assert!(write_records(&layout, &identifiers, None).is_err());
    }
}
