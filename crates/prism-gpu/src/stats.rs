/// Cumulative device counters, readable at any time.
///
/// These exist for instrumentation and tests; none of them feed back into
/// device behavior.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DeviceStats {
    /// Deferred pipelines resolved so far (explicit backend only).
    pub pipelines_resolved: u64,
    /// Descriptor-heap slots handed out so far (explicit backend only).
    pub descriptors_allocated: u64,
    /// Dispatches and quad draws issued through the bind/dispatch protocol.
    pub dispatches: u64,
    /// Context flushes.
    pub flushes: u64,
}
