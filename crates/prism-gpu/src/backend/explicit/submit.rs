//! Round-robin multi-buffered command submission.

use prism_native::modern::{CommandList, ModernDevice};
use prism_native::NativeError;
use tracing::debug;

/// Command lists kept in flight. Sized to absorb typical frame pipelining
/// plus one profiling pass, so the list being reset for reuse can never
/// still be executing.
pub(crate) const SUBMIT_RING_DEPTH: usize = 4;

/// Cycles `SUBMIT_RING_DEPTH` command lists: one active for recording, the
/// rest submitted or idle. Each submission signals the next value of a
/// monotonic timeline fence.
#[derive(Debug)]
pub(crate) struct SubmitRing {
    lists: Vec<CommandList>,
    active: usize,
    next_signal: u64,
}

impl SubmitRing {
    pub fn new() -> Self {
        Self {
            lists: (0..SUBMIT_RING_DEPTH).map(|_| CommandList::new()).collect(),
            active: 0,
            next_signal: 1,
        }
    }

    pub fn active_mut(&mut self) -> &mut CommandList {
        &mut self.lists[self.active]
    }

    /// Close and submit the active list, advance to the next one, and
    /// optionally block on the signaled fence value.
    pub fn submit(
        &mut self,
        native: &mut ModernDevice,
        blocking: bool,
    ) -> Result<u64, NativeError> {
        let signal = self.next_signal;
        let list = &mut self.lists[self.active];
        list.close();
        native.submit(list, signal)?;
        self.next_signal += 1;
        self.active = (self.active + 1) % self.lists.len();
        self.lists[self.active].reset();
        if blocking {
            native.wait_fence(signal)?;
        }
        debug!(signal, blocking, "explicit: context flushed");
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_advance_monotonically() {
        let mut native = ModernDevice::new();
        let mut ring = SubmitRing::new();
        let first = ring.submit(&mut native, false).unwrap();
        let second = ring.submit(&mut native, true).unwrap();
        assert!(second > first);
        assert_eq!(native.fence_completed(), second);
    }

    #[test]
    fn ring_wraps_back_to_a_reset_list() {
        let mut native = ModernDevice::new();
        let mut ring = SubmitRing::new();
        for _ in 0..SUBMIT_RING_DEPTH + 1 {
            ring.active_mut().write_timestamp(0);
            ring.submit(&mut native, false).unwrap();
        }
        // The wrapped-around list was reset, so it records from empty.
        assert!(ring.active_mut().is_empty());
    }
}
