//! Backend abstraction layer
//!
//! Provides the GPU context trait, the recorded command stream and the
//! backends implementing them.

pub mod commands;
pub mod dummy;
pub mod traits;
pub mod types;

// Vulkan backend is only available on native platforms
#[cfg(not(target_arch = "wasm32"))]
pub mod vulkan;

pub use commands::*;
pub use dummy::DummyBackend;
pub use traits::*;
pub use types::*;

use std::sync::Arc;

#[cfg(not(target_arch = "wasm32"))]
use vulkan::VulkanBackend;
use winit::window::Window as WinitWindow;

use crate::{BackendType, RendererConfig};

/// Backend wrapper to abstract over different backends
pub enum Backend {
    #[cfg(not(target_arch = "wasm32"))]
    Vulkan(VulkanBackend),
    Dummy(DummyBackend),
}

macro_rules! delegate {
    ($self:ident, $b:ident => $body:expr) => {
        match $self {
            #[cfg(not(target_arch = "wasm32"))]
            Backend::Vulkan($b) => $body,
            Backend::Dummy($b) => $body,
        }
    };
}

impl Backend {
    /// Create the backend selected in the config.
    ///
    /// Without a window the Vulkan backend renders into offscreen surfaces.
    pub fn new(window: Option<Arc<WinitWindow>>, config: &RendererConfig) -> BackendResult<Self> {
        match config.backend {
            #[cfg(not(target_arch = "wasm32"))]
            BackendType::Vulkan => Ok(Backend::Vulkan(VulkanBackend::new(window, config)?)),
            #[cfg(target_arch = "wasm32")]
            BackendType::Vulkan => Err(BackendError::InitializationFailed(
                "Vulkan backend not available".into(),
            )),
            BackendType::Dummy => {
                drop(window);
                Ok(Backend::Dummy(DummyBackend::with_back_buffers(
                    config.width,
                    config.height,
                    config.back_buffer_count.max(1),
                )))
            }
        }
    }

    pub fn backend_type(&self) -> BackendType {
        match self {
            #[cfg(not(target_arch = "wasm32"))]
            Backend::Vulkan(_) => BackendType::Vulkan,
            Backend::Dummy(_) => BackendType::Dummy,
        }
    }

    /// Get the Vulkan backend (if using Vulkan)
    #[cfg(not(target_arch = "wasm32"))]
    pub fn as_vulkan(&self) -> Option<&VulkanBackend> {
        match self {
            Backend::Vulkan(b) => Some(b),
            _ => None,
        }
    }

    /// Get the dummy backend (if using it)
    pub fn as_dummy(&self) -> Option<&DummyBackend> {
        match self {
            Backend::Dummy(b) => Some(b),
            #[cfg(not(target_arch = "wasm32"))]
            _ => None,
        }
    }
}

impl RayTracingBackend for Backend {
    fn name(&self) -> &'static str {
        delegate!(self, b => b.name())
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        delegate!(self, b => b.capabilities())
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        delegate!(self, b => b.create_buffer(desc))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        delegate!(self, b => b.write_buffer(buffer, offset, data))
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        delegate!(self, b => b.read_buffer(buffer, offset, size))
    }

    fn buffer_address(&self, buffer: BufferHandle) -> BackendResult<GpuAddress> {
        delegate!(self, b => b.buffer_address(buffer))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        delegate!(self, b => b.destroy_buffer(buffer))
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        delegate!(self, b => b.create_texture(desc))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        delegate!(self, b => b.destroy_texture(texture))
    }

    fn acceleration_structure_prebuild_info(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> BackendResult<PrebuildInfo> {
        delegate!(self, b => b.acceleration_structure_prebuild_info(inputs))
    }

    fn create_acceleration_structure(
        &mut self,
        kind: AccelerationStructureKind,
        buffer: BufferHandle,
        size: u64,
    ) -> BackendResult<AccelerationStructureHandle> {
        delegate!(self, b => b.create_acceleration_structure(kind, buffer, size))
    }

    fn acceleration_structure_address(
        &self,
        accel: AccelerationStructureHandle,
    ) -> BackendResult<GpuAddress> {
        delegate!(self, b => b.acceleration_structure_address(accel))
    }

    fn destroy_acceleration_structure(&mut self, accel: AccelerationStructureHandle) {
        delegate!(self, b => b.destroy_acceleration_structure(accel))
    }

    fn create_root_signature(
        &mut self,
        desc: &RootSignatureDescriptor,
    ) -> BackendResult<RootSignatureHandle> {
        delegate!(self, b => b.create_root_signature(desc))
    }

    fn create_ray_tracing_pipeline(
        &mut self,
        desc: &RayTracingPipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        delegate!(self, b => b.create_ray_tracing_pipeline(desc))
    }

    fn shader_identifier(&self, pipeline: PipelineHandle, export: &str) -> BackendResult<Vec<u8>> {
        delegate!(self, b => b.shader_identifier(pipeline, export))
    }

    fn create_descriptor_heap(
        &mut self,
        root_signature: RootSignatureHandle,
        entries: &[DescriptorEntry],
    ) -> BackendResult<DescriptorHeapHandle> {
        delegate!(self, b => b.create_descriptor_heap(root_signature, entries))
    }

    fn descriptor_heap_gpu_base(&self, heap: DescriptorHeapHandle) -> BackendResult<GpuAddress> {
        delegate!(self, b => b.descriptor_heap_gpu_base(heap))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        delegate!(self, b => b.destroy_pipeline(pipeline))
    }

    fn destroy_root_signature(&mut self, root_signature: RootSignatureHandle) {
        delegate!(self, b => b.destroy_root_signature(root_signature))
    }

    fn destroy_descriptor_heap(&mut self, heap: DescriptorHeapHandle) {
        delegate!(self, b => b.destroy_descriptor_heap(heap))
    }

    fn submit(&mut self, commands: &CommandList) -> BackendResult<()> {
        delegate!(self, b => b.submit(commands))
    }

    fn signal(&mut self, value: u64) -> BackendResult<()> {
        delegate!(self, b => b.signal(value))
    }

    fn completed_value(&self) -> u64 {
        delegate!(self, b => b.completed_value())
    }

    fn wait_for_value(&mut self, value: u64) -> BackendResult<()> {
        delegate!(self, b => b.wait_for_value(value))
    }

    fn back_buffers(&self) -> &[TextureHandle] {
        delegate!(self, b => b.back_buffers())
    }

    fn current_back_buffer_index(&mut self) -> BackendResult<u32> {
        delegate!(self, b => b.current_back_buffer_index())
    }

    fn present(&mut self) -> BackendResult<()> {
        delegate!(self, b => b.present())
    }

    fn surface_size(&self) -> (u32, u32) {
        delegate!(self, b => b.surface_size())
    }

    fn drain_debug_messages(&mut self) -> Vec<String> {
        delegate!(self, b => b.drain_debug_messages())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_backend_selection() {
        let config = RendererConfig {
            backend: BackendType::Dummy,
            width: 64,
            height: 32,
            back_buffer_count: 3,
            ..Default::default()
        };
        let backend = Backend::new(None, &config).unwrap();
        assert_eq!(backend.backend_type(), BackendType::Dummy);
        assert_eq!(backend.back_buffers().len(), 3);
        assert_eq!(backend.surface_size(), (64, 32));
        assert!(backend.as_dummy().is_some());
    }
}
