//! Software resource-state tracking and barrier batching.
//!
//! Every tracked resource carries the state the GPU will observe it in once
//! all recorded work has executed. Requests to move a resource into the state
//! it already holds are dropped and counted instead of being recorded.

use crate::backend::{CommandList, ResourceBarrier, ResourceId, ResourceState, TextureHandle};
use crate::resources::{GpuBuffer, GpuTexture};

/// A resource whose access state is tracked on the CPU
pub trait Tracked {
    fn resource_id(&self) -> ResourceId;
    fn tracked_state(&self) -> ResourceState;
    fn set_tracked_state(&mut self, state: ResourceState);
}

impl Tracked for GpuBuffer {
    fn resource_id(&self) -> ResourceId {
        ResourceId::Buffer(self.handle())
    }

    fn tracked_state(&self) -> ResourceState {
        self.state
    }

    fn set_tracked_state(&mut self, state: ResourceState) {
        self.state = state;
    }
}

impl Tracked for GpuTexture {
    fn resource_id(&self) -> ResourceId {
        ResourceId::Texture(self.handle())
    }

    fn tracked_state(&self) -> ResourceState {
        self.state
    }

    fn set_tracked_state(&mut self, state: ResourceState) {
        self.state = state;
    }
}

/// A pooled presentation surface owned by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceSlot {
    pub handle: TextureHandle,
    pub state: ResourceState,
}

impl SurfaceSlot {
    /// Presentation surfaces start out ready to present
    pub fn new(handle: TextureHandle) -> Self {
        Self {
            handle,
            state: ResourceState::Present,
        }
    }
}

impl Tracked for SurfaceSlot {
    fn resource_id(&self) -> ResourceId {
        ResourceId::Texture(self.handle)
    }

    fn tracked_state(&self) -> ResourceState {
        self.state
    }

    fn set_tracked_state(&mut self, state: ResourceState) {
        self.state = state;
    }
}

/// Barriers collected for one point in the command stream
#[derive(Debug, Default)]
pub struct BarrierBatch {
    barriers: Vec<ResourceBarrier>,
    skipped: u64,
}

impl BarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transition of `resource` into `after`.
    ///
    /// Returns `false` and counts a skip when the resource is already there.
    pub fn transition(&mut self, resource: &mut impl Tracked, after: ResourceState) -> bool {
        let before = resource.tracked_state();
        if before == after {
            self.skipped += 1;
            return false;
        }

        self.barriers.push(ResourceBarrier::Transition {
            resource: resource.resource_id(),
            before,
            after,
        });
        resource.set_tracked_state(after);
        true
    }

    /// Queue a UAV barrier ordering writes to `resource`
    pub fn uav(&mut self, resource: Option<ResourceId>) {
        self.barriers.push(ResourceBarrier::Uav { resource });
    }

    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    /// Transitions dropped because the state already matched
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Record the batch as one command. Returns the skip count.
    pub fn flush(self, list: &mut CommandList) -> u64 {
        list.barriers(self.barriers);
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_batch_skip_same_state() {
        let mut slot = SurfaceSlot::new(TextureHandle(1));
        let mut batch = BarrierBatch::new();

        assert!(!batch.transition(&mut slot, ResourceState::Present));
        assert!(batch.is_empty());
        assert_eq!(batch.skipped(), 1);
    }

    #[test]
    fn test_barrier_batch_records_transition() {
        let mut slot = SurfaceSlot::new(TextureHandle(7));
        let mut batch = BarrierBatch::new();

        assert!(batch.transition(&mut slot, ResourceState::CopyDestination));
        assert_eq!(slot.state, ResourceState::CopyDestination);
        assert_eq!(batch.len(), 1);

        let mut list = CommandList::new("test");
        assert_eq!(batch.flush(&mut list), 0);
        assert_eq!(list.transition_count(), 1);
        let barrier = list.iter_barriers().next().copied();
        assert_eq!(
            barrier,
            Some(ResourceBarrier::Transition {
                resource: ResourceId::Texture(TextureHandle(7)),
                before: ResourceState::Present,
                after: ResourceState::CopyDestination,
            })
        );
    }

    #[test]
    fn test_empty_flush_records_nothing() {
        let mut list = CommandList::new("test");
        BarrierBatch::new().flush(&mut list);
        assert!(list.is_empty());
    }
}
