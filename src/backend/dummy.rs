//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't talk to a GPU. Buffers and textures live in host
//! memory, copies and clears are executed in software and every barrier is
//! checked against the real state of its resource, so mismatched or no-op
//! transitions fail the submit the way a validation layer would. It does not
//! trace rays: a dispatch is validated and counted, nothing more.

use std::collections::{HashMap, HashSet};

use crate::backend::commands::{Command, CommandList, ResourceBarrier, ResourceId};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::shader_table::align_up;

/// Size of one instance record in an instance buffer
const INSTANCE_RECORD_SIZE: u64 = 64;
/// Offset of the bottom-level address inside an instance record
const INSTANCE_ADDRESS_OFFSET: usize = 56;

/// Counters describing what the dummy device executed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DummyStats {
    pub submits: u64,
    pub transitions: u64,
    pub uav_barriers: u64,
    pub buffer_copies: u64,
    pub texture_copies: u64,
    pub acceleration_structure_builds: u64,
    pub dispatches: u64,
    pub clears: u64,
    pub signals: u64,
    pub waits: u64,
    pub presents: u64,
}

struct DummyBuffer {
    label: Option<String>,
    data: Vec<u8>,
    usage: BufferUsage,
    location: MemoryLocation,
    state: ResourceState,
    address: GpuAddress,
}

struct DummyTexture {
    width: u32,
    height: u32,
    format: TextureFormat,
    state: ResourceState,
    data: Vec<u8>,
}

struct DummyAccel {
    kind: AccelerationStructureKind,
    buffer: BufferHandle,
    size: u64,
    address: GpuAddress,
    built: bool,
}

struct DummyPipeline {
    exports: Vec<String>,
}

/// Bindings observed while executing one command list
#[derive(Default)]
struct ExecutionState {
    heap: Option<DescriptorHeapHandle>,
    root_signature: Option<RootSignatureHandle>,
    pipeline: Option<PipelineHandle>,
    /// Structures written by a build and not yet ordered by a UAV barrier
    unordered_builds: HashSet<AccelerationStructureHandle>,
}

/// Dummy GPU backend.
pub struct DummyBackend {
    capabilities: DeviceCapabilities,
    width: u32,
    height: u32,
    buffers: HashMap<u64, DummyBuffer>,
    textures: HashMap<u64, DummyTexture>,
    accels: HashMap<u64, DummyAccel>,
    root_signatures: HashMap<u64, RootSignatureDescriptor>,
    pipelines: HashMap<u64, DummyPipeline>,
    heaps: HashMap<u64, (Vec<DescriptorEntry>, GpuAddress)>,
    back_buffers: Vec<TextureHandle>,
    back_buffer_index: u32,
    signaled: u64,
    completed: u64,
    next_id: u64,
    next_address: GpuAddress,
    stats: DummyStats,
    messages: Vec<String>,
    /// The next present reports the surface as lost
    surface_out_of_date: bool,
    /// A present failed; the surfaces can no longer be written or presented
    surface_lost: bool,
}

impl DummyBackend {
    /// Create a dummy device with a pool of two presentation surfaces
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_back_buffers(width, height, 2)
    }

    /// Create a dummy device with `count` presentation surfaces. A count of
    /// zero still creates one, since a swap chain never has fewer.
    pub fn with_back_buffers(width: u32, height: u32, count: u32) -> Self {
        let mut backend = Self {
            capabilities: DeviceCapabilities {
                adapter_name: "Dummy Adapter".to_string(),
                shader_identifier_size: 32,
                shader_table_alignment: 64,
                scratch_alignment: 256,
                max_recursion_depth: 31,
                local_descriptor_tables: true,
            },
            width,
            height,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            accels: HashMap::new(),
            root_signatures: HashMap::new(),
            pipelines: HashMap::new(),
            heaps: HashMap::new(),
            back_buffers: Vec::new(),
            back_buffer_index: 0,
            signaled: 0,
            completed: 0,
            next_id: 1,
            next_address: 0x1000_0000,
            stats: DummyStats::default(),
            messages: Vec::new(),
            surface_out_of_date: false,
            surface_lost: false,
        };

        for i in 0..count.max(1) {
            let id = backend.alloc_id();
            backend.textures.insert(
                id,
                DummyTexture {
                    width,
                    height,
                    format: TextureFormat::Rgba8Unorm,
                    state: ResourceState::Present,
                    data: vec![0; (width * height * 4) as usize],
                },
            );
            log::trace!("DummyBackend: created back buffer {} ({}x{})", i, width, height);
            backend.back_buffers.push(TextureHandle(id));
        }

        backend
    }

    /// Override the reported device limits
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Make the surface behave like an out-of-date swapchain: the next
    /// present fails, and from then on so does every present or submit that
    /// touches a back buffer.
    pub fn lose_surface(&mut self) {
        self.surface_out_of_date = true;
    }

    fn references_back_buffer(&self, commands: &CommandList) -> bool {
        let is_back_buffer = |texture: &TextureHandle| self.back_buffers.contains(texture);
        commands.commands().iter().any(|command| match command {
            Command::ClearTexture { texture, .. } => is_back_buffer(texture),
            Command::CopyTexture { src, dst } => is_back_buffer(src) || is_back_buffer(dst),
            Command::CopyTextureToBuffer { src, .. } => is_back_buffer(src),
            Command::Barriers(barriers) => barriers.iter().any(|barrier| match barrier {
                ResourceBarrier::Transition {
                    resource: ResourceId::Texture(texture),
                    ..
                } => is_back_buffer(texture),
                _ => false,
            }),
            _ => false,
        })
    }

    pub fn stats(&self) -> &DummyStats {
        &self.stats
    }

    pub fn buffer_state(&self, buffer: BufferHandle) -> Option<ResourceState> {
        self.buffers.get(&buffer.0).map(|b| b.state)
    }

    pub fn texture_state(&self, texture: TextureHandle) -> Option<ResourceState> {
        self.textures.get(&texture.0).map(|t| t.state)
    }

    /// Raw texel contents of a texture
    pub fn texture_data(&self, texture: TextureHandle) -> Option<&[u8]> {
        self.textures.get(&texture.0).map(|t| t.data.as_slice())
    }

    /// Raw contents of any buffer, including GPU-only ones
    pub fn buffer_data(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|b| b.data.as_slice())
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Live textures excluding the presentation pool
    pub fn live_texture_count(&self) -> usize {
        self.textures.len() - self.back_buffers.len()
    }

    pub fn live_acceleration_structure_count(&self) -> usize {
        self.accels.len()
    }

    pub fn is_built(&self, accel: AccelerationStructureHandle) -> bool {
        self.accels.get(&accel.0).is_some_and(|a| a.built)
    }

    /// Let the simulated GPU catch up with everything signaled so far
    pub fn complete_all(&mut self) {
        self.completed = self.signaled;
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn alloc_address(&mut self, size: u64) -> GpuAddress {
        let address = self.next_address;
        self.next_address = align_up(address + size.max(1), 256);
        address
    }

    fn validation(&mut self, message: String) -> BackendError {
        log::warn!("DummyBackend validation: {}", message);
        self.messages.push(message.clone());
        BackendError::Validation(message)
    }

    fn buffer(&self, handle: BufferHandle) -> BackendResult<&DummyBuffer> {
        self.buffers
            .get(&handle.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", handle)))
    }

    fn texture(&self, handle: TextureHandle) -> BackendResult<&DummyTexture> {
        self.textures
            .get(&handle.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", handle)))
    }

    fn prebuild_sizes(inputs: &AccelerationStructureInputs) -> PrebuildInfo {
        let count = inputs.primitive_count() as u64;
        match inputs.kind() {
            AccelerationStructureKind::BottomLevel => PrebuildInfo {
                result_size: align_up(256 + count * 64, 256),
                scratch_size: align_up(128 + count * 32, 256),
            },
            AccelerationStructureKind::TopLevel => PrebuildInfo {
                result_size: align_up(256 + count * 128, 256),
                scratch_size: align_up(128 + count * 64, 256),
            },
        }
    }

    fn expect_buffer_state(
        &mut self,
        buffer: BufferHandle,
        allowed: &[ResourceState],
        what: &str,
    ) -> BackendResult<()> {
        let state = self.buffer(buffer)?.state;
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(self.validation(format!(
                "{}: buffer {:?} is in {:?}, expected one of {:?}",
                what, buffer, state, allowed
            )))
        }
    }

    fn expect_texture_state(
        &mut self,
        texture: TextureHandle,
        expected: ResourceState,
        what: &str,
    ) -> BackendResult<()> {
        let state = self.texture(texture)?.state;
        if state == expected {
            Ok(())
        } else {
            Err(self.validation(format!(
                "{}: texture {:?} is in {:?}, expected {:?}",
                what, texture, state, expected
            )))
        }
    }

    fn apply_barrier(
        &mut self,
        barrier: &ResourceBarrier,
        exec: &mut ExecutionState,
    ) -> BackendResult<()> {
        match *barrier {
            ResourceBarrier::Transition {
                resource,
                before,
                after,
            } => {
                if before == after {
                    return Err(self.validation(format!(
                        "no-op transition {:?} -> {:?} on {:?}",
                        before, after, resource
                    )));
                }
                let current = match resource {
                    ResourceId::Buffer(h) => self.buffer(h)?.state,
                    ResourceId::Texture(h) => self.texture(h)?.state,
                    ResourceId::AccelerationStructure(_) => {
                        return Err(self.validation(format!(
                            "acceleration structure {:?} cannot change state",
                            resource
                        )));
                    }
                };
                if current != before {
                    return Err(self.validation(format!(
                        "transition of {:?} declares {:?} but resource is in {:?}",
                        resource, before, current
                    )));
                }
                match resource {
                    ResourceId::Buffer(h) => {
                        if let Some(b) = self.buffers.get_mut(&h.0) {
                            b.state = after;
                        }
                    }
                    ResourceId::Texture(h) => {
                        if let Some(t) = self.textures.get_mut(&h.0) {
                            t.state = after;
                        }
                    }
                    ResourceId::AccelerationStructure(_) => {}
                }
                self.stats.transitions += 1;
            }
            ResourceBarrier::Uav { resource } => {
                match resource {
                    None => exec.unordered_builds.clear(),
                    Some(ResourceId::AccelerationStructure(h)) => {
                        exec.unordered_builds.remove(&h);
                    }
                    Some(ResourceId::Buffer(b)) => {
                        let accels = &self.accels;
                        exec.unordered_builds
                            .retain(|h| accels.get(&h.0).map(|a| a.buffer) != Some(b));
                    }
                    Some(ResourceId::Texture(_)) => {}
                }
                self.stats.uav_barriers += 1;
            }
        }
        Ok(())
    }

    fn execute_build(
        &mut self,
        desc: &BuildAccelerationStructureDesc,
        exec: &mut ExecutionState,
    ) -> BackendResult<()> {
        let required = Self::prebuild_sizes(&desc.inputs);

        let (kind, size) = match self.accels.get(&desc.destination.0) {
            Some(a) => (a.kind, a.size),
            None => return Err(BackendError::InvalidHandle(format!("{:?}", desc.destination))),
        };
        if kind != desc.inputs.kind() {
            return Err(self.validation(format!(
                "build of {:?} inputs into {:?} structure",
                desc.inputs.kind(),
                kind
            )));
        }
        if size < required.result_size {
            return Err(self.validation(format!(
                "result size {} below required {}",
                size, required.result_size
            )));
        }

        let scratch = self.buffer(desc.scratch)?;
        let (scratch_len, scratch_usage, scratch_address) =
            (scratch.data.len() as u64, scratch.usage, scratch.address);
        if scratch_len < required.scratch_size || !scratch_usage.contains(BufferUsage::SCRATCH) {
            return Err(self.validation(format!(
                "scratch buffer {:?} too small or missing scratch usage",
                desc.scratch
            )));
        }
        if scratch_address % self.capabilities.scratch_alignment as u64 != 0 {
            return Err(self.validation("misaligned scratch address".to_string()));
        }
        self.expect_buffer_state(
            desc.scratch,
            &[ResourceState::UnorderedAccess],
            "acceleration structure scratch",
        )?;

        let readable = [ResourceState::ShaderResource, ResourceState::GenericRead];
        match &desc.inputs {
            AccelerationStructureInputs::BottomLevel { geometries } => {
                for geometry in geometries {
                    self.expect_buffer_state(geometry.vertex_buffer, &readable, "vertex input")?;
                    self.expect_buffer_state(geometry.index_buffer, &readable, "index input")?;
                    let vertex_bytes = geometry.vertex_stride * geometry.vertex_count as u64;
                    let index_bytes = geometry.index_format.size() * geometry.index_count as u64;
                    if (self.buffer(geometry.vertex_buffer)?.data.len() as u64) < vertex_bytes
                        || (self.buffer(geometry.index_buffer)?.data.len() as u64) < index_bytes
                    {
                        return Err(self.validation("geometry exceeds its buffers".to_string()));
                    }
                }
            }
            AccelerationStructureInputs::TopLevel {
                instance_buffer,
                instance_count,
            } => {
                self.expect_buffer_state(*instance_buffer, &readable, "instance input")?;
                let data = self.buffer(*instance_buffer)?.data.clone();
                if (data.len() as u64) < *instance_count as u64 * INSTANCE_RECORD_SIZE {
                    return Err(self.validation("instance buffer too small".to_string()));
                }
                for i in 0..*instance_count as usize {
                    let at = i * INSTANCE_RECORD_SIZE as usize + INSTANCE_ADDRESS_OFFSET;
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&data[at..at + 8]);
                    let address = u64::from_le_bytes(raw);
                    let referenced = self
                        .accels
                        .iter()
                        .find(|(_, a)| {
                            a.address == address
                                && a.kind == AccelerationStructureKind::BottomLevel
                                && a.built
                        })
                        .map(|(id, _)| AccelerationStructureHandle(*id));
                    let Some(handle) = referenced else {
                        return Err(self.validation(format!(
                            "instance {} references unbuilt structure at {:#x}",
                            i, address
                        )));
                    };
                    if exec.unordered_builds.contains(&handle) {
                        return Err(self.validation(format!(
                            "instance {} reads {:?} before a UAV barrier ordered its build",
                            i, handle
                        )));
                    }
                }
            }
        }

        if let Some(accel) = self.accels.get_mut(&desc.destination.0) {
            accel.built = true;
        }
        exec.unordered_builds.insert(desc.destination);
        self.stats.acceleration_structure_builds += 1;
        log::trace!(
            "DummyBackend: built {:?} {:?} ({} primitives)",
            desc.inputs.kind(),
            desc.destination,
            desc.inputs.primitive_count()
        );
        Ok(())
    }

    fn check_region(&mut self, region: &ShaderTableRegion, what: &str) -> BackendResult<()> {
        let alignment = self.capabilities.shader_table_alignment as u64;
        let identifier = self.capabilities.shader_identifier_size as u64;
        let len = self.buffer(region.buffer)?.data.len() as u64;
        if region.offset % alignment != 0 {
            return Err(self.validation(format!("{} table offset {} misaligned", what, region.offset)));
        }
        if region.offset + region.size > len {
            return Err(self.validation(format!("{} table exceeds shader table buffer", what)));
        }
        if region.size > 0 && region.stride < identifier {
            return Err(self.validation(format!("{} record stride below identifier size", what)));
        }
        self.expect_buffer_state(
            region.buffer,
            &[ResourceState::ShaderResource, ResourceState::GenericRead],
            "shader table",
        )
    }

    fn execute_dispatch(
        &mut self,
        desc: &DispatchRaysDesc,
        exec: &ExecutionState,
    ) -> BackendResult<()> {
        if exec.pipeline.is_none() || exec.root_signature.is_none() {
            return Err(self.validation("dispatch without pipeline or root signature".to_string()));
        }
        let heap = match exec.heap {
            Some(heap) => heap,
            None => return Err(self.validation("dispatch without descriptor heap".to_string())),
        };
        let entries = self
            .heaps
            .get(&heap.0)
            .map(|(entries, _)| entries.clone())
            .unwrap_or_default();
        for entry in entries {
            match entry {
                DescriptorEntry::StorageTexture(texture) => {
                    self.expect_texture_state(
                        texture,
                        ResourceState::UnorderedAccess,
                        "ray output",
                    )?;
                }
                DescriptorEntry::AccelerationStructure(accel) => {
                    if !self.is_built(accel) || exec.unordered_builds.contains(&accel) {
                        return Err(self.validation(format!(
                            "dispatch reads {:?} before its build is ordered",
                            accel
                        )));
                    }
                }
            }
        }
        self.check_region(&desc.ray_generation, "ray generation")?;
        self.check_region(&desc.miss, "miss")?;
        self.check_region(&desc.hit_group, "hit group")?;
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
            return Err(self.validation("empty dispatch".to_string()));
        }
        self.stats.dispatches += 1;
        log::trace!(
            "DummyBackend: dispatch rays {}x{}x{}",
            desc.width,
            desc.height,
            desc.depth
        );
        Ok(())
    }

    fn execute(&mut self, command: &Command, exec: &mut ExecutionState) -> BackendResult<()> {
        match command {
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                self.expect_buffer_state(
                    *src,
                    &[ResourceState::GenericRead, ResourceState::CopySource],
                    "copy source",
                )?;
                self.expect_buffer_state(*dst, &[ResourceState::CopyDestination], "copy destination")?;
                let src_end = (src_offset + size) as usize;
                let dst_end = (dst_offset + size) as usize;
                let bytes = {
                    let src_buf = self.buffer(*src)?;
                    if src_end > src_buf.data.len() {
                        return Err(self.validation("copy reads past source".to_string()));
                    }
                    src_buf.data[*src_offset as usize..src_end].to_vec()
                };
                let dst_len = self.buffer(*dst)?.data.len();
                if dst_end > dst_len {
                    return Err(self.validation("copy writes past destination".to_string()));
                }
                if let Some(d) = self.buffers.get_mut(&dst.0) {
                    d.data[*dst_offset as usize..dst_end].copy_from_slice(&bytes);
                }
                self.stats.buffer_copies += 1;
            }
            Command::Barriers(barriers) => {
                for barrier in barriers {
                    self.apply_barrier(barrier, exec)?;
                }
            }
            Command::BuildAccelerationStructure(desc) => self.execute_build(desc, exec)?,
            Command::SetDescriptorHeap(heap) => {
                if !self.heaps.contains_key(&heap.0) {
                    return Err(BackendError::InvalidHandle(format!("{:?}", heap)));
                }
                exec.heap = Some(*heap);
            }
            Command::SetRootSignature(root_signature) => {
                exec.root_signature = Some(*root_signature);
            }
            Command::SetDescriptorTable { heap, .. } => {
                if exec.heap != Some(*heap) {
                    return Err(self.validation("descriptor table from unbound heap".to_string()));
                }
            }
            Command::SetConstantBuffer { buffer, .. } => {
                self.buffer(*buffer)?;
            }
            Command::SetPipeline(pipeline) => {
                if !self.pipelines.contains_key(&pipeline.0) {
                    return Err(BackendError::InvalidHandle(format!("{:?}", pipeline)));
                }
                exec.pipeline = Some(*pipeline);
            }
            Command::ClearTexture { texture, color } => {
                self.expect_texture_state(*texture, ResourceState::UnorderedAccess, "clear")?;
                if let Some(t) = self.textures.get_mut(&texture.0) {
                    let texel = t.format.encode(*color);
                    for chunk in t.data.chunks_exact_mut(4) {
                        chunk.copy_from_slice(&texel);
                    }
                }
                self.stats.clears += 1;
            }
            Command::DispatchRays(desc) => self.execute_dispatch(desc, exec)?,
            Command::CopyTexture { src, dst } => {
                self.expect_texture_state(*src, ResourceState::CopySource, "texture copy source")?;
                self.expect_texture_state(*dst, ResourceState::CopyDestination, "texture copy destination")?;
                let (src_format, src_dims, bytes) = {
                    let s = self.texture(*src)?;
                    (s.format, (s.width, s.height), s.data.clone())
                };
                let (dst_format, dst_dims) = {
                    let d = self.texture(*dst)?;
                    (d.format, (d.width, d.height))
                };
                if src_dims != dst_dims {
                    return Err(self.validation(format!(
                        "texture copy between {:?} and {:?} extents",
                        src_dims, dst_dims
                    )));
                }
                if let Some(d) = self.textures.get_mut(&dst.0) {
                    d.data.copy_from_slice(&bytes);
                    if src_format != dst_format {
                        for texel in d.data.chunks_exact_mut(4) {
                            texel.swap(0, 2);
                        }
                    }
                }
                self.stats.texture_copies += 1;
            }
            Command::CopyTextureToBuffer {
                src,
                dst,
                row_pitch,
            } => {
                self.expect_texture_state(*src, ResourceState::CopySource, "readback source")?;
                self.expect_buffer_state(*dst, &[ResourceState::CopyDestination], "readback destination")?;
                let (width, height, bytes) = {
                    let s = self.texture(*src)?;
                    (s.width, s.height, s.data.clone())
                };
                let row_bytes = (width * 4) as usize;
                let pitch = *row_pitch as usize;
                let needed = pitch * (height as usize).saturating_sub(1) + row_bytes;
                if pitch < row_bytes || self.buffer(*dst)?.data.len() < needed {
                    return Err(self.validation("readback buffer too small".to_string()));
                }
                if let Some(d) = self.buffers.get_mut(&dst.0) {
                    for (row, texels) in bytes.chunks_exact(row_bytes).enumerate() {
                        let at = row * pitch;
                        d.data[at..at + row_bytes].copy_from_slice(texels);
                    }
                }
                self.stats.texture_copies += 1;
            }
        }
        Ok(())
    }
}

impl RayTracingBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        if desc.size == 0 {
            return Err(BackendError::BufferCreationFailed(format!(
                "{:?}: zero-sized buffer",
                desc.label
            )));
        }
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {}, {:?})",
            desc.label,
            desc.size,
            desc.location
        );
        let id = self.alloc_id();
        let address = self.alloc_address(desc.size);
        self.buffers.insert(
            id,
            DummyBuffer {
                label: desc.label.clone(),
                data: vec![0; desc.size as usize],
                usage: desc.usage,
                location: desc.location,
                state: desc.effective_initial_state(),
                address,
            },
        );
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let target = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", buffer)))?;
        if !target.location.is_cpu_visible() {
            return Err(BackendError::Validation(format!(
                "buffer {:?} is not CPU-visible",
                target.label
            )));
        }
        let end = offset as usize + data.len();
        if end > target.data.len() {
            return Err(BackendError::Validation("write past end of buffer".to_string()));
        }
        target.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        let source = self.buffer(buffer)?;
        if !source.location.is_cpu_visible() {
            return Err(BackendError::Validation(format!(
                "buffer {:?} is not CPU-visible",
                source.label
            )));
        }
        let end = (offset + size) as usize;
        if end > source.data.len() {
            return Err(BackendError::Validation("read past end of buffer".to_string()));
        }
        Ok(source.data[offset as usize..end].to_vec())
    }

    fn buffer_address(&self, buffer: BufferHandle) -> BackendResult<GpuAddress> {
        Ok(self.buffer(buffer)?.address)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        log::trace!("DummyBackend: destroying buffer {:?}", buffer);
        self.buffers.remove(&buffer.0);
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?}: zero extent",
                desc.label
            )));
        }
        log::trace!(
            "DummyBackend: creating texture {:?} ({}x{})",
            desc.label,
            desc.width,
            desc.height
        );
        let id = self.alloc_id();
        self.textures.insert(
            id,
            DummyTexture {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                state: desc.initial_state,
                data: vec![0; (desc.width * desc.height * desc.format.bytes_per_pixel()) as usize],
            },
        );
        Ok(TextureHandle(id))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if !self.back_buffers.contains(&texture) {
            self.textures.remove(&texture.0);
        }
    }

    fn acceleration_structure_prebuild_info(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> BackendResult<PrebuildInfo> {
        if inputs.primitive_count() == 0 {
            return Err(BackendError::AccelerationStructureCreationFailed(
                "no primitives".to_string(),
            ));
        }
        Ok(Self::prebuild_sizes(inputs))
    }

    fn create_acceleration_structure(
        &mut self,
        kind: AccelerationStructureKind,
        buffer: BufferHandle,
        size: u64,
    ) -> BackendResult<AccelerationStructureHandle> {
        let (address, len, usage) = {
            let b = self.buffer(buffer)?;
            (b.address, b.data.len() as u64, b.usage)
        };
        if len < size || !usage.contains(BufferUsage::ACCELERATION_STRUCTURE_STORAGE) {
            return Err(BackendError::AccelerationStructureCreationFailed(format!(
                "buffer {:?} cannot hold a {} byte structure",
                buffer, size
            )));
        }
        let id = self.alloc_id();
        self.accels.insert(
            id,
            DummyAccel {
                kind,
                buffer,
                size,
                address,
                built: false,
            },
        );
        Ok(AccelerationStructureHandle(id))
    }

    fn acceleration_structure_address(
        &self,
        accel: AccelerationStructureHandle,
    ) -> BackendResult<GpuAddress> {
        self.accels
            .get(&accel.0)
            .map(|a| a.address)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", accel)))
    }

    fn destroy_acceleration_structure(&mut self, accel: AccelerationStructureHandle) {
        self.accels.remove(&accel.0);
    }

    fn create_root_signature(
        &mut self,
        desc: &RootSignatureDescriptor,
    ) -> BackendResult<RootSignatureHandle> {
        let id = self.alloc_id();
        self.root_signatures.insert(id, desc.clone());
        Ok(RootSignatureHandle(id))
    }

    fn create_ray_tracing_pipeline(
        &mut self,
        desc: &RayTracingPipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        if !self.root_signatures.contains_key(&desc.root_signature.0) {
            return Err(BackendError::InvalidHandle(format!("{:?}", desc.root_signature)));
        }
        for shader in &desc.shaders {
            if shader.spirv.first() != Some(&crate::shaders::SPIRV_MAGIC) {
                return Err(BackendError::ShaderCompileFailed(format!(
                    "{}: not a SPIR-V module",
                    shader.export_name
                )));
            }
        }
        for group in &desc.hit_groups {
            let found = desc
                .shaders
                .iter()
                .any(|s| s.export_name == group.closest_hit && s.stage == ShaderStage::ClosestHit);
            if !found {
                return Err(BackendError::PipelineCreationFailed(format!(
                    "hit group {} references unknown closest hit {}",
                    group.export_name, group.closest_hit
                )));
            }
        }
        if desc.max_recursion_depth > self.capabilities.max_recursion_depth {
            return Err(BackendError::PipelineCreationFailed(
                "recursion depth above device limit".to_string(),
            ));
        }

        let exports = desc
            .shaders
            .iter()
            .map(|s| s.export_name.clone())
            .chain(desc.hit_groups.iter().map(|g| g.export_name.clone()))
            .collect();
        let id = self.alloc_id();
        self.pipelines.insert(id, DummyPipeline { exports });
        log::trace!("DummyBackend: created ray tracing pipeline {:?}", desc.label);
        Ok(PipelineHandle(id))
    }

    fn shader_identifier(&self, pipeline: PipelineHandle, export: &str) -> BackendResult<Vec<u8>> {
        let state = self
            .pipelines
            .get(&pipeline.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", pipeline)))?;
        let index = state
            .exports
            .iter()
            .position(|e| e == export)
            .ok_or_else(|| BackendError::InvalidHandle(format!("unknown export {}", export)))?;

        let mut identifier = vec![0u8; self.capabilities.shader_identifier_size as usize];
        let token = (pipeline.0 << 16) | (index as u64 + 1);
        let bytes = token.to_le_bytes();
        let n = bytes.len().min(identifier.len());
        identifier[..n].copy_from_slice(&bytes[..n]);
        Ok(identifier)
    }

    fn create_descriptor_heap(
        &mut self,
        root_signature: RootSignatureHandle,
        entries: &[DescriptorEntry],
    ) -> BackendResult<DescriptorHeapHandle> {
        if !self.root_signatures.contains_key(&root_signature.0) {
            return Err(BackendError::InvalidHandle(format!("{:?}", root_signature)));
        }
        for entry in entries {
            let known = match entry {
                DescriptorEntry::AccelerationStructure(a) => self.accels.contains_key(&a.0),
                DescriptorEntry::StorageTexture(t) => self.textures.contains_key(&t.0),
            };
            if !known {
                return Err(BackendError::DescriptorCreationFailed(format!(
                    "unknown resource in {:?}",
                    entry
                )));
            }
        }
        let id = self.alloc_id();
        let base = self.alloc_address(entries.len() as u64 * 32);
        self.heaps.insert(id, (entries.to_vec(), base));
        Ok(DescriptorHeapHandle(id))
    }

    fn descriptor_heap_gpu_base(&self, heap: DescriptorHeapHandle) -> BackendResult<GpuAddress> {
        self.heaps
            .get(&heap.0)
            .map(|(_, base)| *base)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", heap)))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        self.pipelines.remove(&pipeline.0);
    }

    fn destroy_root_signature(&mut self, root_signature: RootSignatureHandle) {
        self.root_signatures.remove(&root_signature.0);
    }

    fn destroy_descriptor_heap(&mut self, heap: DescriptorHeapHandle) {
        self.heaps.remove(&heap.0);
    }

    fn submit(&mut self, commands: &CommandList) -> BackendResult<()> {
        if !commands.is_closed() {
            return Err(BackendError::SubmitFailed(format!(
                "command list '{}' is still recording",
                commands.label()
            )));
        }
        if self.surface_lost && self.references_back_buffer(commands) {
            return Err(BackendError::SurfaceLost);
        }
        log::trace!(
            "DummyBackend: executing '{}' ({} commands)",
            commands.label(),
            commands.len()
        );

        // A rejected list must leave every resource in the state it was in
        let buffer_states: Vec<(u64, ResourceState)> =
            self.buffers.iter().map(|(id, b)| (*id, b.state)).collect();
        let texture_states: Vec<(u64, ResourceState)> =
            self.textures.iter().map(|(id, t)| (*id, t.state)).collect();
        let built: Vec<(u64, bool)> = self.accels.iter().map(|(id, a)| (*id, a.built)).collect();

        let mut exec = ExecutionState::default();
        for command in commands.commands() {
            if let Err(e) = self.execute(command, &mut exec) {
                for (id, state) in buffer_states {
                    if let Some(buffer) = self.buffers.get_mut(&id) {
                        buffer.state = state;
                    }
                }
                for (id, state) in texture_states {
                    if let Some(texture) = self.textures.get_mut(&id) {
                        texture.state = state;
                    }
                }
                for (id, was_built) in built {
                    if let Some(accel) = self.accels.get_mut(&id) {
                        accel.built = was_built;
                    }
                }
                return Err(e);
            }
        }
        self.stats.submits += 1;
        Ok(())
    }

    fn signal(&mut self, value: u64) -> BackendResult<()> {
        if value <= self.signaled {
            return Err(self.validation(format!(
                "fence signal {} does not exceed {}",
                value, self.signaled
            )));
        }
        self.signaled = value;
        self.stats.signals += 1;
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        self.completed
    }

    fn wait_for_value(&mut self, value: u64) -> BackendResult<()> {
        if value > self.signaled {
            return Err(BackendError::FenceWaitFailed(format!(
                "value {} was never signaled (last {})",
                value, self.signaled
            )));
        }
        self.completed = self.completed.max(value);
        self.stats.waits += 1;
        Ok(())
    }

    fn back_buffers(&self) -> &[TextureHandle] {
        &self.back_buffers
    }

    fn current_back_buffer_index(&mut self) -> BackendResult<u32> {
        Ok(self.back_buffer_index)
    }

    fn present(&mut self) -> BackendResult<()> {
        if self.surface_out_of_date || self.surface_lost {
            self.surface_lost = true;
            return Err(BackendError::SurfaceLost);
        }
        let current = *self
            .back_buffers
            .get(self.back_buffer_index as usize)
            .ok_or_else(|| BackendError::InvalidHandle(format!("back buffer {}", self.back_buffer_index)))?;
        self.expect_texture_state(current, ResourceState::Present, "present")?;
        self.back_buffer_index = (self.back_buffer_index + 1) % self.back_buffers.len() as u32;
        self.stats.presents += 1;
        Ok(())
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn drain_debug_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(backend: &mut DummyBackend, data: &[u8]) -> BufferHandle {
        let buffer = backend
            .create_buffer(&BufferDescriptor {
                label: Some("upload".into()),
                size: data.len() as u64,
                usage: BufferUsage::COPY_SRC,
                location: MemoryLocation::Upload,
                ..Default::default()
            })
            .unwrap();
        backend.write_buffer(buffer, 0, data).unwrap();
        buffer
    }

    #[test]
    fn test_copy_requires_destination_state() {
        let mut backend = DummyBackend::new(4, 4);
        let src = upload(&mut backend, &[1, 2, 3, 4]);
        let dst = backend
            .create_buffer(&BufferDescriptor {
                size: 4,
                usage: BufferUsage::COPY_DST,
                initial_state: ResourceState::ShaderResource,
                ..Default::default()
            })
            .unwrap();

        let mut list = CommandList::new("copy");
        list.copy_buffer(src, dst, 4);
        list.close();
        assert!(matches!(backend.submit(&list), Err(BackendError::Validation(_))));
        assert_eq!(backend.drain_debug_messages().len(), 1);
    }

    #[test]
    fn test_noop_transition_rejected() {
        let mut backend = DummyBackend::new(4, 4);
        let back_buffer = backend.back_buffers()[0];
        let mut list = CommandList::new("noop");
        list.barriers(vec![ResourceBarrier::Transition {
            resource: ResourceId::Texture(back_buffer),
            before: ResourceState::Present,
            after: ResourceState::Present,
        }]);
        list.close();
        assert!(backend.submit(&list).is_err());
        assert_eq!(backend.stats().transitions, 0);
    }

    #[test]
    fn test_mismatched_transition_rejected() {
        let mut backend = DummyBackend::new(4, 4);
        let back_buffer = backend.back_buffers()[1];
        let mut list = CommandList::new("mismatch");
        list.barriers(vec![ResourceBarrier::Transition {
            resource: ResourceId::Texture(back_buffer),
            before: ResourceState::CopyDestination,
            after: ResourceState::Present,
        }]);
        list.close();
        assert!(backend.submit(&list).is_err());
    }

    #[test]
    fn test_unclosed_list_rejected() {
        let mut backend = DummyBackend::new(4, 4);
        let list = CommandList::new("open");
        assert!(matches!(backend.submit(&list), Err(BackendError::SubmitFailed(_))));
    }

    #[test]
    fn test_fence_completes_on_wait() {
        let mut backend = DummyBackend::new(4, 4);
        backend.signal(1).unwrap();
        assert_eq!(backend.completed_value(), 0);
        backend.wait_for_value(1).unwrap();
        assert_eq!(backend.completed_value(), 1);
        assert!(backend.signal(1).is_err());
        assert!(backend.wait_for_value(5).is_err());
    }

    #[test]
    fn test_present_cycles_back_buffers() {
        let mut backend = DummyBackend::new(4, 4);
        assert_eq!(backend.current_back_buffer_index().unwrap(), 0);
        backend.present().unwrap();
        assert_eq!(backend.current_back_buffer_index().unwrap(), 1);
        backend.present().unwrap();
        assert_eq!(backend.current_back_buffer_index().unwrap(), 0);
    }

    #[test]
    fn test_zero_back_buffers_still_presents() {
        let mut backend = DummyBackend::with_back_buffers(4, 4, 0);
        assert_eq!(backend.back_buffers().len(), 1);
        backend.present().unwrap();
        backend.present().unwrap();
        assert_eq!(backend.current_back_buffer_index().unwrap(), 0);
    }

    #[test]
    fn test_rejected_submit_keeps_states() {
        let mut backend = DummyBackend::new(4, 4);
        let back_buffer = backend.back_buffers()[0];
        let mut list = CommandList::new("rejected");
        list.barriers(vec![ResourceBarrier::Transition {
            resource: ResourceId::Texture(back_buffer),
            before: ResourceState::Present,
            after: ResourceState::CopyDestination,
        }]);
        list.copy_buffer(BufferHandle(9999), BufferHandle(9998), 4);
        list.close();
        assert!(backend.submit(&list).is_err());
        assert_eq!(backend.texture_state(back_buffer), Some(ResourceState::Present));
        assert_eq!(backend.stats().submits, 0);
    }

    #[test]
    fn test_lost_surface_refuses_present_and_surface_writes() {
        let mut backend = DummyBackend::new(4, 4);
        backend.lose_surface();
        assert!(matches!(backend.present(), Err(BackendError::SurfaceLost)));
        assert_eq!(backend.current_back_buffer_index().unwrap(), 0);

        let back_buffer = backend.back_buffers()[0];
        let mut list = CommandList::new("surface");
        list.barriers(vec![ResourceBarrier::Transition {
            resource: ResourceId::Texture(back_buffer),
            before: ResourceState::Present,
            after: ResourceState::CopyDestination,
        }]);
        list.close();
        assert!(matches!(backend.submit(&list), Err(BackendError::SurfaceLost)));

        // Work that never touches a surface still runs
        let mut list = CommandList::new("offscreen");
        list.close();
        backend.submit(&list).unwrap();
    }

    #[test]
    fn test_shader_identifiers_are_distinct() {
        let mut backend = DummyBackend::new(4, 4);
        let root = backend
            .create_root_signature(&RootSignatureDescriptor::default())
            .unwrap();
        let module = |name: &str, stage| ShaderModuleDescriptor {
            export_name: name.to_string(),
            stage,
            entry_point: "main".to_string(),
            spirv: vec![crate::shaders::SPIRV_MAGIC, 0x0001_0500],
        };
        let pipeline = backend
            .create_ray_tracing_pipeline(&RayTracingPipelineDescriptor {
                label: None,
                root_signature: root,
                shaders: vec![
                    module("RayGen", ShaderStage::RayGeneration),
                    module("ClosestHit", ShaderStage::ClosestHit),
                ],
                hit_groups: vec![HitGroupDescriptor {
                    export_name: "HitGroup".into(),
                    closest_hit: "ClosestHit".into(),
                }],
                max_payload_size: 16,
                max_attribute_size: 8,
                max_recursion_depth: 1,
            })
            .unwrap();

        let raygen = backend.shader_identifier(pipeline, "RayGen").unwrap();
        let hit = backend.shader_identifier(pipeline, "HitGroup").unwrap();
        assert_eq!(raygen.len(), 32);
        assert_ne!(raygen, hit);
        assert!(backend.shader_identifier(pipeline, "Missing").is_err());
    }
}
