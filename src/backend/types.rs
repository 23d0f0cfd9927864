//! Common types shared between backends

use crate::backend::traits::{
    AccelerationStructureHandle, BufferHandle, RootSignatureHandle, TextureHandle,
};

/// GPU virtual address
pub type GpuAddress = u64;

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
}

impl TextureFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm | TextureFormat::Bgra8Unorm => 4,
        }
    }

    /// Pack a normalized color into one texel of this format
    pub fn encode(&self, color: [f32; 4]) -> [u8; 4] {
        let q = |c: f32| (c.clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
        match self {
            TextureFormat::Rgba8Unorm => [q(color[0]), q(color[1]), q(color[2]), q(color[3])],
            TextureFormat::Bgra8Unorm => [q(color[2]), q(color[1]), q(color[0]), q(color[3])],
        }
    }
}

/// Texture usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureUsage(u32);

impl TextureUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const STORAGE: Self = Self(1 << 2);
    pub const RENDER_ATTACHMENT: Self = Self(1 << 3);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for TextureUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Buffer usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const UNIFORM: Self = Self(1 << 2);
    pub const STORAGE: Self = Self(1 << 3);
    /// Vertex, index or instance data read by an acceleration structure build
    pub const ACCELERATION_STRUCTURE_INPUT: Self = Self(1 << 4);
    pub const ACCELERATION_STRUCTURE_STORAGE: Self = Self(1 << 5);
    pub const SCRATCH: Self = Self(1 << 6);
    pub const SHADER_BINDING_TABLE: Self = Self(1 << 7);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Which heap a buffer lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// CPU-writable, GPU-readable staging memory
    Upload,
    /// GPU-only memory
    Default,
    /// GPU-writable, CPU-readable memory
    Readback,
}

impl MemoryLocation {
    pub fn is_cpu_visible(&self) -> bool {
        !matches!(self, MemoryLocation::Default)
    }

    /// State a buffer in this heap starts in
    pub fn initial_state(&self) -> ResourceState {
        match self {
            MemoryLocation::Upload => ResourceState::GenericRead,
            MemoryLocation::Readback => ResourceState::CopyDestination,
            MemoryLocation::Default => ResourceState::Common,
        }
    }
}

/// Access state of a GPU resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    Present,
    CopyDestination,
    CopySource,
    RenderTarget,
    UnorderedAccess,
    ShaderResource,
    GenericRead,
    AccelerationStructure,
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
    /// Only honoured for `MemoryLocation::Default`
    pub initial_state: ResourceState,
}

impl Default for BufferDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            size: 0,
            usage: BufferUsage::empty(),
            location: MemoryLocation::Default,
            initial_state: ResourceState::Common,
        }
    }
}

impl BufferDescriptor {
    /// State the buffer is in right after creation
    pub fn effective_initial_state(&self) -> ResourceState {
        match self.location {
            MemoryLocation::Default => self.initial_state,
            other => other.initial_state(),
        }
    }
}

/// Texture descriptor
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub initial_state: ResourceState,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::STORAGE | TextureUsage::COPY_SRC,
            initial_state: ResourceState::Common,
        }
    }
}

/// Limits the core needs to lay out shader tables and scratch memory
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub adapter_name: String,
    /// Size in bytes of one opaque shader identifier
    pub shader_identifier_size: u32,
    /// Required alignment of every shader table start and record
    pub shader_table_alignment: u32,
    /// Required alignment of scratch buffer addresses
    pub scratch_alignment: u32,
    pub max_recursion_depth: u32,
    /// Whether shader records may carry a descriptor table pointer
    pub local_descriptor_tables: bool,
}

/// Properties used to pick an adapter
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub device_local_memory: u64,
    pub is_software: bool,
    pub supports_ray_tracing: bool,
}

/// Pick the hardware adapter with the most dedicated memory.
///
/// Software adapters and adapters without ray tracing support are skipped.
pub fn select_adapter(adapters: &[AdapterInfo]) -> Option<usize> {
    adapters
        .iter()
        .enumerate()
        .filter(|(_, a)| !a.is_software && a.supports_ray_tracing)
        .max_by_key(|(_, a)| a.device_local_memory)
        .map(|(i, _)| i)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationStructureKind {
    BottomLevel,
    TopLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32x3,
}

impl VertexFormat {
    pub fn size(&self) -> u64 {
        match self {
            VertexFormat::Float32x3 => 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint32,
}

impl IndexFormat {
    pub fn size(&self) -> u64 {
        match self {
            IndexFormat::Uint32 => 4,
        }
    }
}

/// Triangle geometry consumed by a bottom-level build
#[derive(Debug, Clone)]
pub struct TriangleGeometry {
    pub vertex_buffer: BufferHandle,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub vertex_format: VertexFormat,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
    pub index_format: IndexFormat,
    /// Opaque geometry never invokes any-hit shaders
    pub opaque: bool,
}

impl TriangleGeometry {
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

/// Inputs of an acceleration structure build
#[derive(Debug, Clone)]
pub enum AccelerationStructureInputs {
    BottomLevel {
        geometries: Vec<TriangleGeometry>,
    },
    TopLevel {
        instance_buffer: BufferHandle,
        instance_count: u32,
    },
}

impl AccelerationStructureInputs {
    pub fn kind(&self) -> AccelerationStructureKind {
        match self {
            AccelerationStructureInputs::BottomLevel { .. } => {
                AccelerationStructureKind::BottomLevel
            }
            AccelerationStructureInputs::TopLevel { .. } => AccelerationStructureKind::TopLevel,
        }
    }

    /// Triangles for bottom-level inputs, instances for top-level inputs
    pub fn primitive_count(&self) -> u32 {
        match self {
            AccelerationStructureInputs::BottomLevel { geometries } => {
                geometries.iter().map(TriangleGeometry::triangle_count).sum()
            }
            AccelerationStructureInputs::TopLevel { instance_count, .. } => *instance_count,
        }
    }
}

/// Sizes returned by the device for a build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrebuildInfo {
    pub result_size: u64,
    pub scratch_size: u64,
}

/// A recorded acceleration structure build
#[derive(Debug, Clone)]
pub struct BuildAccelerationStructureDesc {
    pub inputs: AccelerationStructureInputs,
    pub destination: AccelerationStructureHandle,
    pub scratch: BufferHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    RayGeneration,
    Miss,
    ClosestHit,
}

/// One compiled shader exported under a name
#[derive(Debug, Clone)]
pub struct ShaderModuleDescriptor {
    pub export_name: String,
    pub stage: ShaderStage,
    pub entry_point: String,
    pub spirv: Vec<u32>,
}

/// Hit group grouping a closest-hit shader
#[derive(Debug, Clone)]
pub struct HitGroupDescriptor {
    pub export_name: String,
    pub closest_hit: String,
}

/// Ray tracing pipeline state object descriptor
#[derive(Debug, Clone)]
pub struct RayTracingPipelineDescriptor {
    pub label: Option<String>,
    pub root_signature: RootSignatureHandle,
    pub shaders: Vec<ShaderModuleDescriptor>,
    pub hit_groups: Vec<HitGroupDescriptor>,
    pub max_payload_size: u32,
    pub max_attribute_size: u32,
    pub max_recursion_depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    AccelerationStructure,
    StorageTexture,
}

/// Contiguous range of a descriptor table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorRange {
    pub kind: DescriptorKind,
    pub register: u32,
    pub count: u32,
}

/// Parameter slot of a root signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootParameter {
    DescriptorTable(Vec<DescriptorRange>),
    ConstantBuffer { register: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct RootSignatureDescriptor {
    pub label: Option<String>,
    pub parameters: Vec<RootParameter>,
}

/// A view written into a descriptor heap slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorEntry {
    AccelerationStructure(AccelerationStructureHandle),
    StorageTexture(TextureHandle),
}

/// A region of a shader table buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderTableRegion {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
    pub stride: u64,
}

/// Arguments of a ray dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRaysDesc {
    pub ray_generation: ShaderTableRegion,
    pub miss: ShaderTableRegion,
    pub hit_group: ShaderTableRegion,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(name: &str, memory: u64, software: bool, rt: bool) -> AdapterInfo {
        AdapterInfo {
            name: name.to_string(),
            device_local_memory: memory,
            is_software: software,
            supports_ray_tracing: rt,
        }
    }

    #[test]
    fn test_select_adapter_prefers_most_memory() {
        let adapters = [
            adapter("integrated", 512 << 20, false, true),
            adapter("discrete", 8 << 30, false, true),
            adapter("warp", 16 << 30, true, true),
        ];
        assert_eq!(select_adapter(&adapters), Some(1));
    }

    #[test]
    fn test_select_adapter_skips_unsupported() {
        let adapters = [
            adapter("old", 8 << 30, false, false),
            adapter("software", 1 << 30, true, true),
        ];
        assert_eq!(select_adapter(&adapters), None);
    }

    #[test]
    fn test_format_encode() {
        let red = [1.0, 0.0, 0.0, 1.0];
        assert_eq!(TextureFormat::Rgba8Unorm.encode(red), [255, 0, 0, 255]);
        assert_eq!(TextureFormat::Bgra8Unorm.encode(red), [0, 0, 255, 255]);
    }

    #[test]
    fn test_buffer_initial_state() {
        let desc = BufferDescriptor {
            location: MemoryLocation::Upload,
            initial_state: ResourceState::CopyDestination,
            ..Default::default()
        };
        assert_eq!(desc.effective_initial_state(), ResourceState::GenericRead);

        let desc = BufferDescriptor {
            initial_state: ResourceState::AccelerationStructure,
            ..Default::default()
        };
        assert_eq!(
            desc.effective_initial_state(),
            ResourceState::AccelerationStructure
        );
    }

    #[test]
    fn test_primitive_count() {
        let inputs = AccelerationStructureInputs::TopLevel {
            instance_buffer: BufferHandle(1),
            instance_count: 4,
        };
        assert_eq!(inputs.primitive_count(), 4);
        assert_eq!(inputs.kind(), AccelerationStructureKind::TopLevel);
    }
}
