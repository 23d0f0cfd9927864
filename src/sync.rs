//! CPU/GPU synchronization.
//!
//! [`FenceCounter`] owns the monotonically increasing fence value the CPU
//! signals on the queue. [`RetirementQueue`] holds resources the GPU may still
//! reference until the fence value they were last used under is reached.

use std::collections::BTreeMap;

use crate::backend::{BackendResult, RayTracingBackend};

/// The CPU side of the single queue fence
#[derive(Debug)]
pub struct FenceCounter {
    /// Value the next `signal` will use
    next_value: u64,
    last_signaled: u64,
    blocking_waits: u64,
}

impl Default for FenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceCounter {
    /// Fence values start at 1; 0 means nothing was ever signaled
    pub fn new() -> Self {
        Self {
            next_value: 1,
            last_signaled: 0,
            blocking_waits: 0,
        }
    }

    /// Signal the next value on the queue and return it
    pub fn signal<B: RayTracingBackend>(&mut self, backend: &mut B) -> BackendResult<u64> {
        let value = self.next_value;
        backend.signal(value)?;
        self.last_signaled = value;
        self.next_value += 1;
        Ok(value)
    }

    /// Block until the GPU reaches `value`.
    ///
    /// Returns whether the CPU actually had to wait.
    pub fn wait<B: RayTracingBackend>(&mut self, backend: &mut B, value: u64) -> BackendResult<bool> {
        if backend.completed_value() >= value {
            return Ok(false);
        }
        backend.wait_for_value(value)?;
        self.blocking_waits += 1;
        Ok(true)
    }

    /// Wait for everything signaled so far
    pub fn drain<B: RayTracingBackend>(&mut self, backend: &mut B) -> BackendResult<()> {
        if self.last_signaled > 0 {
            self.wait(backend, self.last_signaled)?;
        }
        Ok(())
    }

    pub fn is_reached<B: RayTracingBackend>(&self, backend: &B, value: u64) -> bool {
        backend.completed_value() >= value
    }

    pub fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    /// Value the next submission will be tagged with
    pub fn next_value(&self) -> u64 {
        self.next_value
    }

    pub fn blocking_waits(&self) -> u64 {
        self.blocking_waits
    }
}

/// Resources kept alive until a fence value is reached
#[derive(Debug)]
pub struct RetirementQueue<T> {
    pending: BTreeMap<u64, Vec<T>>,
}

impl<T> Default for RetirementQueue<T> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }
}

impl<T> RetirementQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `item` until the fence reaches `fence_value`
    pub fn retire(&mut self, fence_value: u64, item: T) {
        self.pending.entry(fence_value).or_default().push(item);
    }

    /// Take every item whose fence value has been reached
    pub fn collect(&mut self, completed: u64) -> Vec<T> {
        let still_pending = match completed.checked_add(1) {
            Some(bound) => self.pending.split_off(&bound),
            None => BTreeMap::new(),
        };
        let done = std::mem::replace(&mut self.pending, still_pending);
        done.into_values().flatten().collect()
    }

    /// Take everything regardless of fence value. Only valid once the queue is drained.
    pub fn take_all(&mut self) -> Vec<T> {
        std::mem::take(&mut self.pending)
            .into_values()
            .flatten()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    #[test]
    fn test_fence_values_increase_by_one() {
        let mut backend = DummyBackend::new(4, 4);
        let mut fence = FenceCounter::new();

        let first = fence.signal(&mut backend).unwrap();
        let second = fence.signal(&mut backend).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(fence.last_signaled(), 2);
        assert_eq!(fence.next_value(), 3);
    }

    #[test]
    fn test_wait_only_when_behind() {
        let mut backend = DummyBackend::new(4, 4);
        let mut fence = FenceCounter::new();

        let value = fence.signal(&mut backend).unwrap();
        assert!(fence.wait(&mut backend, value).unwrap());
        assert!(!fence.wait(&mut backend, value).unwrap());
        assert_eq!(fence.blocking_waits(), 1);
        assert!(fence.is_reached(&backend, value));
    }

    #[test]
    fn test_drain_without_signal_is_noop() {
        let mut backend = DummyBackend::new(4, 4);
        let mut fence = FenceCounter::new();
        fence.drain(&mut backend).unwrap();
        assert_eq!(backend.stats().waits, 0);
    }

    #[test]
    fn test_retirement_releases_reached_values() {
        let mut queue = RetirementQueue::new();
        queue.retire(1, "scratch-a");
        queue.retire(2, "scratch-b");
        queue.retire(2, "staging");
        queue.retire(5, "later");

        assert!(queue.collect(0).is_empty());
        assert_eq!(queue.collect(2), vec!["scratch-a", "scratch-b", "staging"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take_all(), vec!["later"]);
        assert!(queue.is_empty());
    }
}
