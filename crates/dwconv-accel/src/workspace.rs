//! Shared scratch memory for all streams.
//!
//! One device allocation of `streams × per_stream` bytes is split into
//! `streams` disjoint byte ranges, one per execution stream. The allocation
//! only ever grows. If growing fails, every plan is forced onto its
//! zero-scratch baseline and the workspace collapses to empty: slower, never
//! wrong.
//!
//! Slices borrow the workspace mutably, so a view cannot outlive the next
//! [`Workspace::ensure_capacity`] call that might move the buffer.

use crate::backend::DeviceAllocator;
use crate::plan::ExecutionPlan;
use std::ops::Range;
use tracing::{debug, warn};

/// Result of [`Workspace::ensure_capacity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityOutcome {
    /// The current allocation already covers the request.
    Unchanged,
    /// A new, larger allocation was made.
    Grown { capacity: usize },
    /// Allocation failed; plans were degraded and the workspace emptied.
    Degraded { requested: usize },
}

/// Byte-range sliced scratch buffer shared by a fixed number of streams.
pub struct Workspace<A: DeviceAllocator> {
    stream_count: usize,
    buffer: Option<A::Buffer>,
    capacity: usize,
    slices: Vec<Range<usize>>,
    degraded: bool,
}

impl<A: DeviceAllocator> Workspace<A> {
    pub fn new(stream_count: usize) -> Self {
        Self { stream_count, buffer: None, capacity: 0, slices: Vec::new(), degraded: false }
    }

    /// Make sure every stream has `required_per_stream` bytes of scratch.
    ///
    /// On allocation failure `plans` are degraded in place; the failure is
    /// not reported as an error.
    pub fn ensure_capacity(
        &mut self,
        allocator: &mut A,
        required_per_stream: usize,
        plans: &mut [ExecutionPlan],
    ) -> CapacityOutcome {
        let total = required_per_stream.saturating_mul(self.stream_count);
        if total <= self.capacity {
            self.degraded = false;
            return CapacityOutcome::Unchanged;
        }

        debug!(total, previous = self.capacity, "reallocating workspace");
        if let Some(old) = self.buffer.take() {
            allocator.release(old);
        }

        match allocator.allocate(total) {
            Ok(buffer) => {
                self.buffer = Some(buffer);
                self.capacity = total;
                self.slices = (0..self.stream_count)
                    .map(|k| k * required_per_stream..(k + 1) * required_per_stream)
                    .collect();
                self.degraded = false;
                CapacityOutcome::Grown { capacity: total }
            }
            Err(e) => {
                warn!(
                    requested = total,
                    error = %e,
                    "workspace allocation failed; falling back to zero-scratch algorithms"
                );
                for plan in plans.iter_mut() {
                    plan.degrade();
                }
                self.slices.clear();
                self.capacity = 0;
                self.degraded = true;
                CapacityOutcome::Degraded { requested: total }
            }
        }
    }

    /// Total allocated bytes across all streams.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stream_count(&self) -> usize {
        self.stream_count
    }

    /// Byte ranges assigned to each stream; empty when no scratch exists.
    pub fn slices(&self) -> &[Range<usize>] {
        &self.slices
    }

    /// Whether the last capacity request fell back to zero scratch.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Scratch for `stream`; empty when there is no allocation.
    pub fn stream_slice(&mut self, stream: usize) -> &mut [u8] {
        match (self.buffer.as_mut(), self.slices.get(stream)) {
            (Some(buffer), Some(range)) => &mut buffer.as_mut()[range.clone()],
            _ => &mut [],
        }
    }

    /// Return the allocation to the device.
    pub fn release(&mut self, allocator: &mut A) {
        if let Some(buffer) = self.buffer.take() {
            debug!(capacity = self.capacity, "releasing workspace");
            allocator.release(buffer);
        }
        self.capacity = 0;
        self.slices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AllocError;

    /// Allocator that fails whenever the request exceeds `limit`.
    struct Capped {
        limit: usize,
        live: usize,
    }

    impl DeviceAllocator for Capped {
        type Buffer = Vec<u8>;

        fn allocate(&mut self, bytes: usize) -> Result<Vec<u8>, AllocError> {
            if self.live + bytes > self.limit {
                return Err(AllocError { requested: bytes, available: self.limit - self.live });
            }
            self.live += bytes;
            Ok(vec![0; bytes])
        }

        fn release(&mut self, buffer: Vec<u8>) {
            self.live -= buffer.len();
        }
    }

    #[test]
    fn grows_and_slices() {
        let mut alloc = Capped { limit: 1 << 20, live: 0 };
        let mut ws = Workspace::<Capped>::new(3);
        assert_eq!(ws.ensure_capacity(&mut alloc, 100, &mut []), CapacityOutcome::Grown { capacity: 300 });
        assert_eq!(ws.slices(), &[0..100, 100..200, 200..300]);
        assert_eq!(ws.stream_slice(2).len(), 100);
        assert_eq!(ws.ensure_capacity(&mut alloc, 50, &mut []), CapacityOutcome::Unchanged);
        assert_eq!(ws.capacity(), 300);
    }

    #[test]
    fn old_buffer_released_before_growing() {
        // Only room for one 300-byte buffer at a time.
        let mut alloc = Capped { limit: 600, live: 0 };
        let mut ws = Workspace::<Capped>::new(3);
        ws.ensure_capacity(&mut alloc, 100, &mut []);
        assert_eq!(ws.ensure_capacity(&mut alloc, 200, &mut []), CapacityOutcome::Grown { capacity: 600 });
        assert_eq!(alloc.live, 600);
    }

    #[test]
    fn zero_request_never_allocates() {
        let mut alloc = Capped { limit: 0, live: 0 };
        let mut ws = Workspace::<Capped>::new(3);
        assert_eq!(ws.ensure_capacity(&mut alloc, 0, &mut []), CapacityOutcome::Unchanged);
        assert!(ws.stream_slice(0).is_empty());
    }

    #[test]
    fn release_empties_workspace() {
        let mut alloc = Capped { limit: 1 << 20, live: 0 };
        let mut ws = Workspace::<Capped>::new(3);
        ws.ensure_capacity(&mut alloc, 64, &mut []);
        ws.release(&mut alloc);
        assert_eq!(alloc.live, 0);
        assert_eq!(ws.capacity(), 0);
        assert!(ws.slices().is_empty());
    }
}
