//! Upload pipeline
//!
//! CPU data reaches GPU-only buffers through a staging buffer, a recorded
//! copy and a transition into the state its consumer reads it in. Staging
//! buffers are retired under the fence value of the submit that copies them.

use std::marker::PhantomData;

use bytemuck::Pod;

use crate::backend::*;
use crate::context::GpuContext;
use crate::error::{RendererError, RendererResult};
use crate::resources::{GpuBuffer, Mesh};
use crate::shader_table::align_up;
use crate::tracking::BarrierBatch;

/// Constant buffer views must be sized in multiples of this
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// Row pitch alignment for texture readback
pub const READBACK_ROW_PITCH_ALIGNMENT: u32 = 256;

/// Records staging copies into a command list
#[derive(Debug, Default)]
pub struct Uploader {
    uploads: usize,
    bytes: u64,
}

impl Uploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `data` into a new GPU-only buffer left in `final_state`.
    ///
    /// The copy is only recorded; the buffer is usable once `list` is
    /// submitted and its fence value reached.
    pub fn upload_buffer<B: RayTracingBackend>(
        &mut self,
        ctx: &mut GpuContext<B>,
        list: &mut CommandList,
        data: &[u8],
        usage: BufferUsage,
        final_state: ResourceState,
        label: &str,
    ) -> RendererResult<GpuBuffer> {
        if data.is_empty() {
            return Err(RendererError::InvalidScene(format!("'{}' has no data", label)));
        }
        let size = data.len() as u64;

        let staging = ctx.create_buffer(&BufferDescriptor {
            label: Some(format!("{} (staging)", label)),
            size,
            usage: BufferUsage::COPY_SRC,
            location: MemoryLocation::Upload,
            ..Default::default()
        })?;
        ctx.backend_mut().write_buffer(staging.handle(), 0, data)?;

        let mut buffer = ctx.create_buffer(&BufferDescriptor {
            label: Some(label.to_string()),
            size,
            usage: usage | BufferUsage::COPY_DST | BufferUsage::COPY_SRC,
            location: MemoryLocation::Default,
            initial_state: ResourceState::CopyDestination,
        })?;

        list.copy_buffer(staging.handle(), buffer.handle(), size);
        let mut batch = BarrierBatch::new();
        batch.transition(&mut buffer, final_state);
        batch.flush(list);

        ctx.retire_buffer(staging);
        self.uploads += 1;
        self.bytes += size;
        log::debug!("Recorded upload of '{}' ({} bytes)", label, size);
        Ok(buffer)
    }

    /// Number of uploads recorded so far
    pub fn upload_count(&self) -> usize {
        self.uploads
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.bytes
    }
}

/// Vertex and index buffers of one uploaded mesh
#[derive(Debug)]
pub struct GpuMesh {
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub vertex_count: u32,
    pub index_count: u32,
}

impl GpuMesh {
    /// Geometry description for a bottom-level build
    pub fn geometry(&self) -> TriangleGeometry {
        TriangleGeometry {
            vertex_buffer: self.vertex_buffer.handle(),
            vertex_stride: VertexFormat::Float32x3.size(),
            vertex_count: self.vertex_count,
            vertex_format: VertexFormat::Float32x3,
            index_buffer: self.index_buffer.handle(),
            index_count: self.index_count,
            index_format: IndexFormat::Uint32,
            opaque: true,
        }
    }

    pub fn release<B: RayTracingBackend>(self, ctx: &mut GpuContext<B>) {
        ctx.release_buffer(self.vertex_buffer);
        ctx.release_buffer(self.index_buffer);
    }
}

/// Record the upload of a mesh's vertices and indices
pub fn upload_mesh<B: RayTracingBackend>(
    ctx: &mut GpuContext<B>,
    list: &mut CommandList,
    uploader: &mut Uploader,
    mesh: &Mesh,
) -> RendererResult<GpuMesh> {
    mesh.validate()?;
    let usage = BufferUsage::ACCELERATION_STRUCTURE_INPUT | BufferUsage::STORAGE;
    let vertex_buffer = uploader.upload_buffer(
        ctx,
        list,
        mesh.vertex_bytes(),
        usage,
        ResourceState::ShaderResource,
        &format!("{} vertices", mesh.name),
    )?;
    let index_buffer = uploader.upload_buffer(
        ctx,
        list,
        mesh.index_bytes(),
        usage,
        ResourceState::ShaderResource,
        &format!("{} indices", mesh.name),
    )?;
    Ok(GpuMesh {
        vertex_buffer,
        index_buffer,
        vertex_count: mesh.vertex_count() as u32,
        index_count: mesh.index_count() as u32,
    })
}

/// Copy a GPU-only buffer into a readback buffer and return its bytes.
///
/// Submits its own command list and blocks until the copy completes.
pub fn read_back_buffer<B: RayTracingBackend>(
    ctx: &mut GpuContext<B>,
    buffer: &mut GpuBuffer,
) -> RendererResult<Vec<u8>> {
    let readback = ctx.create_buffer(&BufferDescriptor {
        label: Some("readback".to_string()),
        size: buffer.size(),
        usage: BufferUsage::COPY_DST,
        location: MemoryLocation::Readback,
        ..Default::default()
    })?;

    let restore = buffer.state();
    let mut list = CommandList::new("readback");
    let mut batch = BarrierBatch::new();
    batch.transition(buffer, ResourceState::CopySource);
    batch.flush(&mut list);
    list.copy_buffer(buffer.handle(), readback.handle(), buffer.size());
    let mut batch = BarrierBatch::new();
    batch.transition(buffer, restore);
    batch.flush(&mut list);

    ctx.submit_and_wait(&mut list)?;
    let bytes = ctx.backend().read_buffer(readback.handle(), 0, buffer.size());
    ctx.release_buffer(readback);
    Ok(bytes?)
}

/// A CPU-visible constant buffer holding one `T`
#[derive(Debug)]
pub struct ConstantBuffer<T: Pod> {
    buffer: GpuBuffer,
    _marker: PhantomData<T>,
}

impl<T: Pod> ConstantBuffer<T> {
    pub fn new<B: RayTracingBackend>(
        ctx: &mut GpuContext<B>,
        label: &str,
        initial: &T,
    ) -> RendererResult<Self> {
        let size = align_up(std::mem::size_of::<T>() as u64, CONSTANT_BUFFER_ALIGNMENT);
        let buffer = ctx.create_buffer(&BufferDescriptor {
            label: Some(label.to_string()),
            size,
            usage: BufferUsage::UNIFORM,
            location: MemoryLocation::Upload,
            ..Default::default()
        })?;
        let constants = Self {
            buffer,
            _marker: PhantomData,
        };
        constants.write(ctx, initial)?;
        Ok(constants)
    }

    /// Overwrite the contents. The GPU must not be reading the buffer.
    pub fn write<B: RayTracingBackend>(&self, ctx: &mut GpuContext<B>, value: &T) -> RendererResult<()> {
        ctx.backend_mut()
            .write_buffer(self.buffer.handle(), 0, bytemuck::bytes_of(value))?;
        Ok(())
    }

    pub fn handle(&self) -> BufferHandle {
        self.buffer.handle()
    }

    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    pub fn release<B: RayTracingBackend>(self, ctx: &mut GpuContext<B>) {
        ctx.release_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_records_copy_then_transition() {
        let mut ctx = GpuContext::new(DummyBackend::new(4, 4));
        let mut list = CommandList::new("upload");
        let mut uploader = Uploader::new();

        let buffer = uploader
            .upload_buffer(
                &mut ctx,
                &mut list,
                &[1, 2, 3, 4, 5, 6, 7, 8],
                BufferUsage::STORAGE,
                ResourceState::ShaderResource,
                "data",
            )
            .unwrap();

        assert_eq!(buffer.state(), ResourceState::ShaderResource);
        assert!(matches!(list.commands()[0], Command::CopyBuffer { size: 8, .. }));
        assert_eq!(list.transition_count(), 1);
        assert_eq!(ctx.pending_retirements(), 1);

        ctx.submit_and_wait(&mut list).unwrap();
        assert_eq!(
            ctx.backend().buffer_data(buffer.handle()),
            Some(&[1u8, 2, 3, 4, 5, 6, 7, 8][..])
        );
        assert_eq!(ctx.pending_retirements(), 0);
    }

    #[test]
    fn test_empty_upload_rejected() {
        let mut ctx = GpuContext::new(DummyBackend::new(4, 4));
        let mut list = CommandList::new("upload");
        let result = Uploader::new().upload_buffer(
            &mut ctx,
            &mut list,
            &[],
            BufferUsage::STORAGE,
            ResourceState::ShaderResource,
            "empty",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_constant_buffer_is_padded() {
        let mut ctx = GpuContext::new(DummyBackend::new(4, 4));
        let constants = ConstantBuffer::new(&mut ctx, "mode", &3u32).unwrap();
        assert_eq!(constants.size(), CONSTANT_BUFFER_ALIGNMENT);

        constants.write(&mut ctx, &5u32).unwrap();
        let bytes = ctx.backend().read_buffer(constants.handle(), 0, 4).unwrap();
        assert_eq!(bytes, 5u32.to_le_bytes());
    }
}
