//! Exclusive-ownership wrappers around backend handles
//!
//! A [`GpuBuffer`] or [`GpuTexture`] is owned by exactly one component and is
//! neither `Clone` nor `Copy`. Releasing it consumes the wrapper, so a handle
//! cannot be destroyed twice or used after release.

use std::collections::HashMap;

use crate::backend::*;
use crate::error::RendererResult;

/// A GPU buffer together with its software-tracked state
#[derive(Debug)]
pub struct GpuBuffer {
    handle: BufferHandle,
    size: u64,
    location: MemoryLocation,
    pub(crate) state: ResourceState,
}

impl GpuBuffer {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }
}

/// A GPU texture together with its software-tracked state
#[derive(Debug)]
pub struct GpuTexture {
    handle: TextureHandle,
    width: u32,
    height: u32,
    format: TextureFormat,
    pub(crate) state: ResourceState,
}

impl GpuTexture {
    pub fn handle(&self) -> TextureHandle {
        self.handle
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }
}

#[derive(Debug, Clone)]
struct Allocation {
    label: String,
    size: u64,
}

/// Registry of every live buffer and texture created through it
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    buffers: HashMap<BufferHandle, Allocation>,
    textures: HashMap<TextureHandle, Allocation>,
    allocated_bytes: u64,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_buffer<B: RayTracingBackend>(
        &mut self,
        backend: &mut B,
        desc: &BufferDescriptor,
    ) -> RendererResult<GpuBuffer> {
        let handle = backend.create_buffer(desc)?;
        self.buffers.insert(
            handle,
            Allocation {
                label: desc.label.clone().unwrap_or_default(),
                size: desc.size,
            },
        );
        self.allocated_bytes += desc.size;
        Ok(GpuBuffer {
            handle,
            size: desc.size,
            location: desc.location,
            state: desc.effective_initial_state(),
        })
    }

    pub fn create_texture<B: RayTracingBackend>(
        &mut self,
        backend: &mut B,
        desc: &TextureDescriptor,
    ) -> RendererResult<GpuTexture> {
        let handle = backend.create_texture(desc)?;
        let size = desc.width as u64 * desc.height as u64 * desc.format.bytes_per_pixel() as u64;
        self.textures.insert(
            handle,
            Allocation {
                label: desc.label.clone().unwrap_or_default(),
                size,
            },
        );
        self.allocated_bytes += size;
        Ok(GpuTexture {
            handle,
            width: desc.width,
            height: desc.height,
            format: desc.format,
            state: desc.initial_state,
        })
    }

    pub fn release_buffer<B: RayTracingBackend>(&mut self, backend: &mut B, buffer: GpuBuffer) {
        if let Some(allocation) = self.buffers.remove(&buffer.handle) {
            self.allocated_bytes -= allocation.size;
            log::trace!("Releasing buffer '{}' ({} bytes)", allocation.label, allocation.size);
        }
        backend.destroy_buffer(buffer.handle);
    }

    pub fn release_texture<B: RayTracingBackend>(&mut self, backend: &mut B, texture: GpuTexture) {
        if let Some(allocation) = self.textures.remove(&texture.handle) {
            self.allocated_bytes -= allocation.size;
            log::trace!("Releasing texture '{}'", allocation.label);
        }
        backend.destroy_texture(texture.handle);
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    /// Bytes held by live buffers and textures
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    /// Labels of everything still alive, for leak reports at teardown
    pub fn live_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .buffers
            .values()
            .chain(self.textures.values())
            .map(|a| a.label.clone())
            .collect();
        labels.sort();
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_tracks_allocations() {
        let mut backend = DummyBackend::new(8, 8);
        let mut registry = ResourceRegistry::new();

        let buffer = registry
            .create_buffer(
                &mut backend,
                &BufferDescriptor {
                    label: Some("vertices".into()),
                    size: 96,
                    usage: BufferUsage::STORAGE,
                    initial_state: ResourceState::CopyDestination,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(buffer.state(), ResourceState::CopyDestination);
        assert_eq!(registry.allocated_bytes(), 96);

        let texture = registry
            .create_texture(
                &mut backend,
                &TextureDescriptor {
                    label: Some("output".into()),
                    width: 8,
                    height: 8,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(registry.allocated_bytes(), 96 + 256);
        assert_eq!(registry.live_labels(), vec!["output", "vertices"]);

        registry.release_buffer(&mut backend, buffer);
        registry.release_texture(&mut backend, texture);
        assert_eq!(registry.allocated_bytes(), 0);
        assert_eq!(backend.live_buffer_count(), 0);
        assert_eq!(backend.live_texture_count(), 0);
    }

    #[test]
    fn test_creation_failure_leaves_registry_untouched() {
        let mut backend = DummyBackend::new(8, 8);
        let mut registry = ResourceRegistry::new();
        let result = registry.create_buffer(&mut backend, &BufferDescriptor::default());
        assert!(result.is_err());
        assert_eq!(registry.live_buffers(), 0);
    }
}
