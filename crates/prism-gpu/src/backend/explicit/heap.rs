//! Bump allocation over the fixed-capacity descriptor heaps.

use prism_native::modern::HeapId;

use crate::error::GpuError;

/// Bump-pointer allocator over one native descriptor heap.
///
/// The cursor only ever advances; there is no deallocation. View lifetimes
/// are session-scoped and each (kind, slice) view is created once, so slots
/// are never wasted by churn. Exhaustion means the startup heap sizes were
/// configured too small and is fatal.
#[derive(Debug)]
pub(crate) struct DescriptorAllocator {
    heap: HeapId,
    kind: &'static str,
    capacity: u32,
    cursor: u32,
}

impl DescriptorAllocator {
    pub fn new(heap: HeapId, kind: &'static str, capacity: u32) -> Self {
        Self {
            heap,
            kind,
            capacity,
            cursor: 0,
        }
    }

    pub fn heap(&self) -> HeapId {
        self.heap
    }

    pub fn allocate(&mut self) -> Result<u32, GpuError> {
        if self.cursor == self.capacity {
            return Err(GpuError::HeapExhausted {
                kind: self.kind,
                capacity: self.capacity,
            });
        }
        let index = self.cursor;
        self.cursor += 1;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_strictly_monotonic() {
        let mut alloc = DescriptorAllocator::new(HeapId(0), "resource", 8);
        let mut last = alloc.allocate().unwrap();
        for _ in 1..8 {
            let next = alloc.allocate().unwrap();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn exhaustion_is_fatal_and_names_the_heap() {
        let mut alloc = DescriptorAllocator::new(HeapId(0), "render target", 2);
        alloc.allocate().unwrap();
        alloc.allocate().unwrap();
        match alloc.allocate() {
            Err(GpuError::HeapExhausted { kind, capacity }) => {
                assert_eq!(kind, "render target");
                assert_eq!(capacity, 2);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
