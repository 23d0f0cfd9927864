//! The GPU context passed to every renderer component

use crate::backend::*;
use crate::error::RendererResult;
use crate::resources::{GpuBuffer, GpuTexture, ResourceRegistry};
use crate::sync::{FenceCounter, RetirementQueue};

/// Owns the backend, the resource registry, the queue fence and the
/// retirement queue for transient buffers.
pub struct GpuContext<B: RayTracingBackend> {
    backend: B,
    registry: ResourceRegistry,
    fence: FenceCounter,
    retired: RetirementQueue<GpuBuffer>,
    validation: bool,
}

impl<B: RayTracingBackend> GpuContext<B> {
    pub fn new(backend: B) -> Self {
        log::info!(
            "GPU context on {} ({})",
            backend.capabilities().adapter_name,
            backend.name()
        );
        Self {
            backend,
            registry: ResourceRegistry::new(),
            fence: FenceCounter::new(),
            retired: RetirementQueue::new(),
            validation: cfg!(debug_assertions),
        }
    }

    /// Forward backend validation messages to the log after each submit
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validation = enabled;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        self.backend.capabilities()
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn fence(&self) -> &FenceCounter {
        &self.fence
    }

    pub fn create_buffer(&mut self, desc: &BufferDescriptor) -> RendererResult<GpuBuffer> {
        self.registry.create_buffer(&mut self.backend, desc)
    }

    pub fn create_texture(&mut self, desc: &TextureDescriptor) -> RendererResult<GpuTexture> {
        self.registry.create_texture(&mut self.backend, desc)
    }

    /// Destroy a buffer right away. The GPU must no longer reference it.
    pub fn release_buffer(&mut self, buffer: GpuBuffer) {
        self.registry.release_buffer(&mut self.backend, buffer);
    }

    pub fn release_texture(&mut self, texture: GpuTexture) {
        self.registry.release_texture(&mut self.backend, texture);
    }

    /// Release `buffer` once the next signaled fence value is reached.
    ///
    /// Call before submitting the last command list that uses it.
    pub fn retire_buffer(&mut self, buffer: GpuBuffer) {
        self.retired.retire(self.fence.next_value(), buffer);
    }

    pub fn pending_retirements(&self) -> usize {
        self.retired.len()
    }

    /// Close and submit `list`, then signal the fence. Returns the signaled value.
    pub fn submit(&mut self, list: &mut CommandList) -> RendererResult<u64> {
        list.close();
        let result = self.backend.submit(list);
        self.flush_debug_messages();
        result?;
        Ok(self.fence.signal(&mut self.backend)?)
    }

    /// Block until `value` is reached, then release retired buffers.
    ///
    /// Returns whether the CPU had to wait.
    pub fn wait(&mut self, value: u64) -> RendererResult<bool> {
        let waited = self.fence.wait(&mut self.backend, value)?;
        self.collect_retired();
        Ok(waited)
    }

    pub fn submit_and_wait(&mut self, list: &mut CommandList) -> RendererResult<u64> {
        let value = self.submit(list)?;
        self.wait(value)?;
        Ok(value)
    }

    /// Release every retired buffer whose fence value has been reached
    pub fn collect_retired(&mut self) -> usize {
        let completed = self.backend.completed_value();
        let done = self.retired.collect(completed);
        let count = done.len();
        for buffer in done {
            self.registry.release_buffer(&mut self.backend, buffer);
        }
        if count > 0 {
            log::debug!("Released {} transient buffers at fence {}", count, completed);
        }
        count
    }

    /// Wait for the last signaled value and release everything retired
    pub fn drain(&mut self) -> RendererResult<()> {
        self.fence.drain(&mut self.backend)?;
        self.collect_retired();
        for buffer in self.retired.take_all() {
            self.registry.release_buffer(&mut self.backend, buffer);
        }
        Ok(())
    }

    pub fn flush_debug_messages(&mut self) {
        if !self.validation {
            return;
        }
        for message in self.backend.drain_debug_messages() {
            log::warn!("[{}] {}", self.backend.name(), message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staging(ctx: &mut GpuContext<DummyBackend>) -> GpuBuffer {
        ctx.create_buffer(&BufferDescriptor {
            label: Some("staging".into()),
            size: 64,
            usage: BufferUsage::COPY_SRC,
            location: MemoryLocation::Upload,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_retired_buffer_released_after_fence() {
        let mut ctx = GpuContext::new(DummyBackend::new(4, 4));
        let buffer = staging(&mut ctx);
        ctx.retire_buffer(buffer);
        assert_eq!(ctx.pending_retirements(), 1);

        let mut list = CommandList::new("empty");
        let value = ctx.submit(&mut list).unwrap();
        assert_eq!(ctx.collect_retired(), 0);

        ctx.wait(value).unwrap();
        assert_eq!(ctx.pending_retirements(), 0);
        assert_eq!(ctx.backend().live_buffer_count(), 0);
        assert_eq!(ctx.registry().live_buffers(), 0);
    }

    #[test]
    fn test_submit_signals_consecutive_values() {
        let mut ctx = GpuContext::new(DummyBackend::new(4, 4));
        let mut list = CommandList::new("empty");
        assert_eq!(ctx.submit_and_wait(&mut list).unwrap(), 1);
        list.reset();
        assert_eq!(ctx.submit_and_wait(&mut list).unwrap(), 2);
        assert_eq!(ctx.backend().stats().submits, 2);
    }

    #[test]
    fn test_drain_releases_everything() {
        let mut ctx = GpuContext::new(DummyBackend::new(4, 4));
        let buffer = staging(&mut ctx);
        ctx.retire_buffer(buffer);
        let mut list = CommandList::new("empty");
        ctx.submit(&mut list).unwrap();

        ctx.drain().unwrap();
        assert_eq!(ctx.backend().completed_value(), 1);
        assert_eq!(ctx.registry().live_buffers(), 0);
    }
}
