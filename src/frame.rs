//! Per-frame state machine around the ray dispatch.
//!
//! One command list is reused every frame. `begin` resets it and moves the
//! current swap surface into copy-destination and the ray output into
//! unordered-access, skipping either transition when the state already
//! matches. `end` copies the ray output into the surface, returns both to the
//! states the next frame expects, submits, presents and waits on the fence
//! value it just signaled. Only one frame is ever in flight.

use crate::backend::*;
use crate::context::GpuContext;
use crate::error::{RendererError, RendererResult};
use crate::resources::GpuTexture;
use crate::tracking::{BarrierBatch, SurfaceSlot, Tracked};

/// What happened during one `begin`/`end` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub frame_index: u64,
    /// Fence value signaled and waited on for this frame
    pub fence_value: u64,
    /// Surface the frame was copied into
    pub back_buffer_index: u32,
    /// Surface the next frame will target
    pub next_back_buffer_index: u32,
    /// Whether the CPU blocked on the fence
    pub waited: bool,
    pub transitions: usize,
    pub skipped_transitions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Recording,
}

pub struct FrameStateMachine {
    list: CommandList,
    surfaces: Vec<SurfaceSlot>,
    back_buffer_index: u32,
    phase: Phase,
    /// Tracked states at `begin`, restored when the frame's submit is rejected
    surface_states_at_begin: Vec<ResourceState>,
    output_state_at_begin: ResourceState,
    frame_index: u64,
    last_fence_value: u64,
    frame_transitions: usize,
    frame_skipped: u64,
    total_skipped: u64,
}

impl FrameStateMachine {
    pub fn new<B: RayTracingBackend>(ctx: &mut GpuContext<B>) -> RendererResult<Self> {
        let surfaces: Vec<SurfaceSlot> = ctx
            .backend()
            .back_buffers()
            .iter()
            .copied()
            .map(SurfaceSlot::new)
            .collect();
        if surfaces.is_empty() {
            return Err(RendererError::FrameState(
                "presentation surface has no back buffers".to_string(),
            ));
        }
        let back_buffer_index = ctx.backend_mut().current_back_buffer_index()?;
        log::debug!(
            "Frame state machine over {} surfaces, starting at {}",
            surfaces.len(),
            back_buffer_index
        );

        Ok(Self {
            list: CommandList::new("frame"),
            surfaces,
            back_buffer_index,
            phase: Phase::Idle,
            surface_states_at_begin: Vec::new(),
            output_state_at_begin: ResourceState::Common,
            frame_index: 0,
            last_fence_value: 0,
            frame_transitions: 0,
            frame_skipped: 0,
            total_skipped: 0,
        })
    }

    fn current_surface(&mut self) -> RendererResult<&mut SurfaceSlot> {
        let index = self.back_buffer_index as usize;
        let count = self.surfaces.len();
        self.surfaces.get_mut(index).ok_or_else(|| {
            RendererError::FrameState(format!("back buffer index {} out of {} surfaces", index, count))
        })
    }

    fn record(&mut self, batch: BarrierBatch) {
        self.frame_transitions += batch.len();
        let skipped = batch.flush(&mut self.list);
        self.frame_skipped += skipped;
        self.total_skipped += skipped;
    }

    /// Reset the command list and bring both surfaces into their write states
    pub fn begin<B: RayTracingBackend>(
        &mut self,
        ctx: &mut GpuContext<B>,
        ray_output: &mut GpuTexture,
    ) -> RendererResult<()> {
        if self.phase == Phase::Recording {
            return Err(RendererError::FrameState(format!(
                "frame {} began twice",
                self.frame_index
            )));
        }
        // The list may only be reset once the GPU is done with it.
        if self.last_fence_value > 0 {
            ctx.wait(self.last_fence_value)?;
        }
        self.list.reset();
        self.frame_transitions = 0;
        self.frame_skipped = 0;
        self.surface_states_at_begin = self.surface_states();
        self.output_state_at_begin = ray_output.tracked_state();

        let mut batch = BarrierBatch::new();
        batch.transition(self.current_surface()?, ResourceState::CopyDestination);
        batch.transition(ray_output, ResourceState::UnorderedAccess);
        self.record(batch);

        self.phase = Phase::Recording;
        Ok(())
    }

    /// The list commands for this frame are recorded into
    pub fn list_mut(&mut self) -> &mut CommandList {
        &mut self.list
    }

    pub fn list(&self) -> &CommandList {
        &self.list
    }

    /// Copy the ray output to the surface, submit, present and wait
    pub fn end<B: RayTracingBackend>(
        &mut self,
        ctx: &mut GpuContext<B>,
        ray_output: &mut GpuTexture,
    ) -> RendererResult<FrameReport> {
        if self.phase != Phase::Recording {
            return Err(RendererError::FrameState(
                "frame ended without begin".to_string(),
            ));
        }
        let surface_handle = self.current_surface()?.handle;

        let mut batch = BarrierBatch::new();
        batch.transition(ray_output, ResourceState::CopySource);
        self.record(batch);

        self.list.copy_texture(ray_output.handle(), surface_handle);

        let mut batch = BarrierBatch::new();
        batch.transition(ray_output, ResourceState::UnorderedAccess);
        batch.transition(self.current_surface()?, ResourceState::Present);
        self.record(batch);

        let fence_value = match ctx.submit(&mut self.list) {
            Ok(value) => value,
            Err(e) => {
                self.abandon(ray_output);
                return Err(e);
            }
        };
        self.phase = Phase::Idle;
        self.last_fence_value = fence_value;

        ctx.backend_mut().present()?;
        let waited = ctx.wait(fence_value)?;

        let back_buffer_index = self.back_buffer_index;
        self.back_buffer_index = ctx.backend_mut().current_back_buffer_index()?;

        let report = FrameReport {
            frame_index: self.frame_index,
            fence_value,
            back_buffer_index,
            next_back_buffer_index: self.back_buffer_index,
            waited,
            transitions: self.frame_transitions,
            skipped_transitions: self.frame_skipped,
        };
        self.frame_index += 1;
        log::trace!("Frame {:?}", report);
        Ok(report)
    }

    /// Drop the recorded frame. Nothing of it reached the GPU, so the tracked
    /// states go back to what they were at `begin`.
    fn abandon(&mut self, ray_output: &mut GpuTexture) {
        log::warn!("Frame {} rejected; dropping its commands", self.frame_index);
        for (slot, state) in self.surfaces.iter_mut().zip(&self.surface_states_at_begin) {
            slot.set_tracked_state(*state);
        }
        ray_output.set_tracked_state(self.output_state_at_begin);
        self.list.reset();
        self.phase = Phase::Idle;
    }

    pub fn is_recording(&self) -> bool {
        self.phase == Phase::Recording
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn back_buffer_index(&self) -> u32 {
        self.back_buffer_index
    }

    /// Tracked state of every pooled surface
    pub fn surface_states(&self) -> Vec<ResourceState> {
        self.surfaces.iter().map(|s| s.tracked_state()).collect()
    }

    /// Transitions skipped since creation because the state already matched
    pub fn skipped_transitions(&self) -> u64 {
        self.total_skipped
    }

    pub fn last_fence_value(&self) -> u64 {
        self.last_fence_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(initial: ResourceState) -> (GpuContext<DummyBackend>, GpuTexture, FrameStateMachine) {
        let mut ctx = GpuContext::new(DummyBackend::new(8, 8));
        let output = ctx
            .create_texture(&TextureDescriptor {
                label: Some("ray output".into()),
                width: 8,
                height: 8,
                initial_state: initial,
                ..Default::default()
            })
            .unwrap();
        let frames = FrameStateMachine::new(&mut ctx).unwrap();
        (ctx, output, frames)
    }

    #[test]
    fn test_frame_cycle_leaves_output_unordered() {
        let (mut ctx, mut output, mut frames) = setup(ResourceState::CopySource);

        frames.begin(&mut ctx, &mut output).unwrap();
        assert_eq!(output.state(), ResourceState::UnorderedAccess);
        let report = frames.end(&mut ctx, &mut output).unwrap();

        assert_eq!(output.state(), ResourceState::UnorderedAccess);
        assert_eq!(report.fence_value, 1);
        assert_eq!(report.back_buffer_index, 0);
        assert_eq!(report.next_back_buffer_index, 1);
        assert!(report.waited);
        assert!(frames
            .surface_states()
            .iter()
            .all(|s| *s == ResourceState::Present));
    }

    #[test]
    fn test_second_frame_skips_output_barrier() {
        let (mut ctx, mut output, mut frames) = setup(ResourceState::CopySource);

        frames.begin(&mut ctx, &mut output).unwrap();
        let first = frames.end(&mut ctx, &mut output).unwrap();
        assert_eq!(first.skipped_transitions, 0);

        frames.begin(&mut ctx, &mut output).unwrap();
        let second = frames.end(&mut ctx, &mut output).unwrap();
        assert_eq!(second.skipped_transitions, 1);
        assert_eq!(second.transitions, first.transitions - 1);
        assert_eq!(frames.skipped_transitions(), 1);
    }

    #[test]
    fn test_begin_twice_rejected() {
        let (mut ctx, mut output, mut frames) = setup(ResourceState::UnorderedAccess);
        frames.begin(&mut ctx, &mut output).unwrap();
        assert!(matches!(
            frames.begin(&mut ctx, &mut output),
            Err(RendererError::FrameState(_))
        ));
    }

    #[test]
    fn test_rejected_frame_restores_states() {
        let (mut ctx, mut output, mut frames) = setup(ResourceState::CopySource);

        frames.begin(&mut ctx, &mut output).unwrap();
        frames
            .list_mut()
            .copy_buffer(BufferHandle(9999), BufferHandle(9998), 4);
        assert!(frames.end(&mut ctx, &mut output).is_err());

        assert!(!frames.is_recording());
        assert_eq!(output.state(), ResourceState::CopySource);
        assert_eq!(
            frames.surface_states(),
            vec![ResourceState::Present, ResourceState::Present]
        );
        assert_eq!(ctx.fence().last_signaled(), 0);

        // The next frame starts from the real device states
        frames.begin(&mut ctx, &mut output).unwrap();
        let report = frames.end(&mut ctx, &mut output).unwrap();
        assert_eq!(report.fence_value, 1);
        assert_eq!(report.frame_index, 0);
        assert_eq!(report.skipped_transitions, 0);
        assert_eq!(output.state(), ResourceState::UnorderedAccess);
    }

    #[test]
    fn test_lost_surface_fails_frames_without_wedging() {
        let (mut ctx, mut output, mut frames) = setup(ResourceState::UnorderedAccess);
        frames.begin(&mut ctx, &mut output).unwrap();
        frames.end(&mut ctx, &mut output).unwrap();

        // The frame is submitted but its present fails
        ctx.backend_mut().lose_surface();
        frames.begin(&mut ctx, &mut output).unwrap();
        assert!(matches!(
            frames.end(&mut ctx, &mut output),
            Err(RendererError::Backend(BackendError::SurfaceLost))
        ));
        assert!(!frames.is_recording());
        assert_eq!(frames.last_fence_value(), 2);
        assert_eq!(frames.back_buffer_index(), 1);

        // Later frames are refused at submit and leave the tracked states alone
        frames.begin(&mut ctx, &mut output).unwrap();
        assert!(matches!(
            frames.end(&mut ctx, &mut output),
            Err(RendererError::Backend(BackendError::SurfaceLost))
        ));
        assert!(!frames.is_recording());
        assert_eq!(ctx.fence().last_signaled(), 2);
        assert_eq!(
            frames.surface_states(),
            vec![ResourceState::Present, ResourceState::Present]
        );
        assert_eq!(output.state(), ResourceState::UnorderedAccess);
    }

    #[test]
    fn test_end_without_begin_rejected() {
        let (mut ctx, mut output, mut frames) = setup(ResourceState::UnorderedAccess);
        assert!(frames.end(&mut ctx, &mut output).is_err());
    }
}
