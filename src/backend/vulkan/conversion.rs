//! Conversions from backend-neutral types to Vulkan enums and flags

use ash::vk;
use gpu_allocator::MemoryLocation as AllocatorLocation;

use crate::backend::types::*;

pub fn convert_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
    }
}

pub fn convert_format_back(format: vk::Format) -> Option<TextureFormat> {
    match format {
        vk::Format::R8G8B8A8_UNORM => Some(TextureFormat::Rgba8Unorm),
        vk::Format::B8G8R8A8_UNORM => Some(TextureFormat::Bgra8Unorm),
        _ => None,
    }
}

pub fn convert_memory_location(location: MemoryLocation) -> AllocatorLocation {
    match location {
        MemoryLocation::Upload => AllocatorLocation::CpuToGpu,
        MemoryLocation::Default => AllocatorLocation::GpuOnly,
        MemoryLocation::Readback => AllocatorLocation::GpuToCpu,
    }
}

/// Every buffer gets a device address; acceleration structure builds,
/// shader tables and dispatches all address buffers directly.
pub fn convert_buffer_usage(usage: BufferUsage, location: MemoryLocation) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    if usage.contains(BufferUsage::COPY_SRC) || location == MemoryLocation::Upload {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) || location == MemoryLocation::Readback {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) || usage.contains(BufferUsage::SCRATCH) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_INPUT) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_STORAGE) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
    }
    if usage.contains(BufferUsage::SHADER_BINDING_TABLE) {
        flags |= vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR;
    }
    flags
}

pub fn convert_texture_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::COPY_SRC) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(TextureUsage::STORAGE) {
        // Clears of storage images go through the transfer path
        flags |= vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    flags
}

pub fn convert_shader_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
        ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
        ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
    }
}

pub fn convert_descriptor_kind(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        DescriptorKind::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
    }
}

pub fn convert_acceleration_structure_kind(
    kind: AccelerationStructureKind,
) -> vk::AccelerationStructureTypeKHR {
    match kind {
        AccelerationStructureKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationStructureKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

pub fn convert_vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
    }
}

pub fn convert_index_format(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::Uint32 => vk::IndexType::UINT32,
    }
}

/// Synchronization scope of a resource state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateScope {
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags,
    pub stages: vk::PipelineStageFlags,
}

pub fn state_scope(state: ResourceState) -> StateScope {
    let (layout, access, stages) = match state {
        ResourceState::Common => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        // The acquire semaphore is waited on at ALL_COMMANDS, which the
        // barrier leaving this state chains with.
        ResourceState::Present => (
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        ResourceState::CopyDestination => (
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ResourceState::CopySource => (
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ResourceState::RenderTarget => (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        ResourceState::UnorderedAccess => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::SHADER_WRITE
                | vk::AccessFlags::TRANSFER_WRITE
                | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
                | vk::PipelineStageFlags::TRANSFER
                | vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        ),
        ResourceState::ShaderResource => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::UNIFORM_READ,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
                | vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        ),
        ResourceState::GenericRead => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::MEMORY_READ,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        ResourceState::AccelerationStructure => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
    };
    StateScope {
        layout,
        access,
        stages,
    }
}

/// Scope covering every unordered write the renderer issues
pub fn unordered_access_scope() -> StateScope {
    StateScope {
        layout: vk::ImageLayout::GENERAL,
        access: vk::AccessFlags::SHADER_READ
            | vk::AccessFlags::SHADER_WRITE
            | vk::AccessFlags::TRANSFER_READ
            | vk::AccessFlags::TRANSFER_WRITE
            | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
            | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
        stages: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
            | vk::PipelineStageFlags::TRANSFER
            | vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
    }
}

pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

pub fn color_subresource_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_present_and_copy_layouts() {
        assert_eq!(
            state_scope(ResourceState::Present).layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
        assert_eq!(
            state_scope(ResourceState::CopyDestination).layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        assert_eq!(
            state_scope(ResourceState::UnorderedAccess).layout,
            vk::ImageLayout::GENERAL
        );
    }

    #[test]
    fn test_every_buffer_is_addressable() {
        let flags = convert_buffer_usage(BufferUsage::UNIFORM, MemoryLocation::Upload);
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_SRC));

        let scratch = convert_buffer_usage(BufferUsage::SCRATCH, MemoryLocation::Default);
        assert!(scratch.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }

    #[test]
    fn test_format_round_trip() {
        for format in [TextureFormat::Rgba8Unorm, TextureFormat::Bgra8Unorm] {
            assert_eq!(convert_format_back(convert_format(format)), Some(format));
        }
        assert_eq!(convert_format_back(vk::Format::B8G8R8A8_SRGB), None);
    }
}
