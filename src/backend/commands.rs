//! Backend-neutral command recording
//!
//! The core records work into a [`CommandList`]; the backend translates the
//! recorded stream into API calls when the list is submitted.

use crate::backend::traits::*;
use crate::backend::types::*;

/// Any resource a barrier can refer to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Buffer(BufferHandle),
    Texture(TextureHandle),
    AccelerationStructure(AccelerationStructureHandle),
}

/// Explicit resource barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceBarrier {
    /// State transition; `before` must match the resource's current state
    Transition {
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    },
    /// Orders unordered writes against subsequent accesses. `None` covers all resources.
    Uav { resource: Option<ResourceId> },
}

impl ResourceBarrier {
    pub fn is_transition(&self) -> bool {
        matches!(self, ResourceBarrier::Transition { .. })
    }
}

/// Recorded command
#[derive(Debug, Clone)]
pub enum Command {
    CopyBuffer {
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    },
    Barriers(Vec<ResourceBarrier>),
    BuildAccelerationStructure(BuildAccelerationStructureDesc),
    SetDescriptorHeap(DescriptorHeapHandle),
    SetRootSignature(RootSignatureHandle),
    SetDescriptorTable {
        parameter: u32,
        heap: DescriptorHeapHandle,
        offset: u32,
    },
    SetConstantBuffer {
        parameter: u32,
        buffer: BufferHandle,
    },
    SetPipeline(PipelineHandle),
    ClearTexture {
        texture: TextureHandle,
        color: [f32; 4],
    },
    DispatchRays(DispatchRaysDesc),
    CopyTexture {
        src: TextureHandle,
        dst: TextureHandle,
    },
    CopyTextureToBuffer {
        src: TextureHandle,
        dst: BufferHandle,
        row_pitch: u32,
    },
}

/// A recorded list of commands for the single queue
#[derive(Debug, Clone, Default)]
pub struct CommandList {
    label: String,
    commands: Vec<Command>,
    closed: bool,
}

impl CommandList {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            commands: Vec::new(),
            closed: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Drop recorded commands and reopen the list
    pub fn reset(&mut self) {
        self.commands.clear();
        self.closed = false;
    }

    /// Finish recording; the list can then be submitted
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn push(&mut self, command: Command) {
        debug_assert!(!self.closed, "recording into closed list '{}'", self.label);
        self.commands.push(command);
    }

    pub fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, size: u64) {
        self.copy_buffer_region(src, 0, dst, 0, size);
    }

    pub fn copy_buffer_region(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) {
        self.push(Command::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    /// Record a batch of barriers. Empty batches are dropped.
    pub fn barriers(&mut self, barriers: Vec<ResourceBarrier>) {
        if !barriers.is_empty() {
            self.push(Command::Barriers(barriers));
        }
    }

    pub fn uav_barrier(&mut self, resource: Option<ResourceId>) {
        self.push(Command::Barriers(vec![ResourceBarrier::Uav { resource }]));
    }

    pub fn build_acceleration_structure(&mut self, desc: BuildAccelerationStructureDesc) {
        self.push(Command::BuildAccelerationStructure(desc));
    }

    pub fn set_descriptor_heap(&mut self, heap: DescriptorHeapHandle) {
        self.push(Command::SetDescriptorHeap(heap));
    }

    pub fn set_root_signature(&mut self, root_signature: RootSignatureHandle) {
        self.push(Command::SetRootSignature(root_signature));
    }

    pub fn set_descriptor_table(&mut self, parameter: u32, heap: DescriptorHeapHandle, offset: u32) {
        self.push(Command::SetDescriptorTable {
            parameter,
            heap,
            offset,
        });
    }

    pub fn set_constant_buffer(&mut self, parameter: u32, buffer: BufferHandle) {
        self.push(Command::SetConstantBuffer { parameter, buffer });
    }

    pub fn set_pipeline(&mut self, pipeline: PipelineHandle) {
        self.push(Command::SetPipeline(pipeline));
    }

    pub fn clear_texture(&mut self, texture: TextureHandle, color: [f32; 4]) {
        self.push(Command::ClearTexture { texture, color });
    }

    pub fn dispatch_rays(&mut self, desc: DispatchRaysDesc) {
        self.push(Command::DispatchRays(desc));
    }

    pub fn copy_texture(&mut self, src: TextureHandle, dst: TextureHandle) {
        self.push(Command::CopyTexture { src, dst });
    }

    pub fn copy_texture_to_buffer(&mut self, src: TextureHandle, dst: BufferHandle, row_pitch: u32) {
        self.push(Command::CopyTextureToBuffer {
            src,
            dst,
            row_pitch,
        });
    }

    /// Iterate every recorded barrier in order
    pub fn iter_barriers(&self) -> impl Iterator<Item = &ResourceBarrier> {
        self.commands.iter().flat_map(|c| match c {
            Command::Barriers(b) => b.as_slice(),
            _ => &[],
        })
    }

    pub fn transition_count(&self) -> usize {
        self.iter_barriers().filter(|b| b.is_transition()).count()
    }

    pub fn uav_barrier_count(&self) -> usize {
        self.iter_barriers().filter(|b| !b.is_transition()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_barrier_batch_not_recorded() {
        let mut list = CommandList::new("test");
        list.barriers(Vec::new());
        assert!(list.is_empty());
    }

    #[test]
    fn test_barrier_counts() {
        let mut list = CommandList::new("test");
        let texture = ResourceId::Texture(TextureHandle(1));
        list.barriers(vec![
            ResourceBarrier::Transition {
                resource: texture,
                before: ResourceState::Present,
                after: ResourceState::CopyDestination,
            },
            ResourceBarrier::Uav { resource: None },
        ]);
        list.uav_barrier(Some(texture));

        assert_eq!(list.len(), 2);
        assert_eq!(list.transition_count(), 1);
        assert_eq!(list.uav_barrier_count(), 2);
    }

    #[test]
    fn test_reset_reopens() {
        let mut list = CommandList::new("frame");
        list.set_pipeline(PipelineHandle(3));
        list.close();
        assert!(list.is_closed());

        list.reset();
        assert!(!list.is_closed());
        assert!(list.is_empty());
        assert_eq!(list.label(), "frame");
    }
}
