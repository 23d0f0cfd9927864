//! Core backend abstraction traits
//!
//! The [`RayTracingBackend`] trait is the GPU context every renderer component
//! talks to. Both the Vulkan backend and the dummy backend implement it.

use crate::backend::commands::CommandList;
use crate::backend::types::*;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("No suitable GPU adapter: {0}")]
    NoSuitableAdapter(String),
    #[error("Ray tracing is not supported: {0}")]
    RayTracingUnsupported(String),
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create acceleration structure: {0}")]
    AccelerationStructureCreationFailed(String),
    #[error("Failed to compile shader: {0}")]
    ShaderCompileFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create descriptor heap: {0}")]
    DescriptorCreationFailed(String),
    #[error("Failed to submit command list: {0}")]
    SubmitFailed(String),
    #[error("Failed to wait for fence: {0}")]
    FenceWaitFailed(String),
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to an acceleration structure placed in a result buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccelerationStructureHandle(pub(crate) u64);

/// Handle to a root signature (pipeline layout)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootSignatureHandle(pub(crate) u64);

/// Handle to a compiled ray tracing pipeline state object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub(crate) u64);

/// Handle to a shader-visible descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHeapHandle(pub(crate) u64);

impl BufferHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl TextureHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl AccelerationStructureHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// GPU context used by every renderer component.
///
/// Commands are recorded into a backend-neutral [`CommandList`] and handed
/// over at [`submit`](RayTracingBackend::submit). Completion is observed
/// through a single monotonically increasing fence.
pub trait RayTracingBackend {
    /// Short backend name for logging
    fn name(&self) -> &'static str;

    /// Device limits relevant to acceleration structures and shader tables
    fn capabilities(&self) -> &DeviceCapabilities;

    // Resources

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Write into a CPU-visible buffer
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()>;

    /// Read from a CPU-visible buffer (upload or readback heap)
    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>>;

    fn buffer_address(&self, buffer: BufferHandle) -> BackendResult<GpuAddress>;

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    fn destroy_texture(&mut self, texture: TextureHandle);

    // Acceleration structures

    /// Query result and scratch sizes for a build
    fn acceleration_structure_prebuild_info(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> BackendResult<PrebuildInfo>;

    /// Place an acceleration structure of `size` bytes at the start of `buffer`
    fn create_acceleration_structure(
        &mut self,
        kind: AccelerationStructureKind,
        buffer: BufferHandle,
        size: u64,
    ) -> BackendResult<AccelerationStructureHandle>;

    fn acceleration_structure_address(
        &self,
        accel: AccelerationStructureHandle,
    ) -> BackendResult<GpuAddress>;

    fn destroy_acceleration_structure(&mut self, accel: AccelerationStructureHandle);

    // Pipeline

    fn create_root_signature(
        &mut self,
        desc: &RootSignatureDescriptor,
    ) -> BackendResult<RootSignatureHandle>;

    fn create_ray_tracing_pipeline(
        &mut self,
        desc: &RayTracingPipelineDescriptor,
    ) -> BackendResult<PipelineHandle>;

    /// Opaque shader identifier for an exported shader or hit group
    fn shader_identifier(&self, pipeline: PipelineHandle, export: &str) -> BackendResult<Vec<u8>>;

    fn create_descriptor_heap(
        &mut self,
        root_signature: RootSignatureHandle,
        entries: &[DescriptorEntry],
    ) -> BackendResult<DescriptorHeapHandle>;

    /// GPU pointer to slot 0 of the heap, embedded in shader records
    fn descriptor_heap_gpu_base(&self, heap: DescriptorHeapHandle) -> BackendResult<GpuAddress>;

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);

    fn destroy_root_signature(&mut self, root_signature: RootSignatureHandle);

    fn destroy_descriptor_heap(&mut self, heap: DescriptorHeapHandle);

    // Submission

    /// Execute a closed command list on the single queue
    fn submit(&mut self, commands: &CommandList) -> BackendResult<()>;

    /// Ask the queue to set the fence to `value` once prior work completes
    fn signal(&mut self, value: u64) -> BackendResult<()>;

    /// Last fence value the GPU has reached
    fn completed_value(&self) -> u64;

    /// Block until the fence reaches `value`
    fn wait_for_value(&mut self, value: u64) -> BackendResult<()>;

    // Presentation surface

    /// The fixed pool of surfaces the frame is copied into
    fn back_buffers(&self) -> &[TextureHandle];

    /// Index of the pooled surface to target next
    fn current_back_buffer_index(&mut self) -> BackendResult<u32>;

    fn present(&mut self) -> BackendResult<()>;

    fn surface_size(&self) -> (u32, u32);

    /// Validation messages collected since the last call
    fn drain_debug_messages(&mut self) -> Vec<String> {
        Vec::new()
    }
}
