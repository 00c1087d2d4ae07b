//! Deferred pipeline state.
//!
//! The explicit native API needs the complete binding layout before a
//! pipeline object can exist, but callers bind then dispatch symmetrically
//! on both backends. Until first dispatch a shader's bindings are recorded
//! into an accumulator; the first dispatch builds the pipeline, replays the
//! recorded bindings in order, and the shader stays resolved for the rest of
//! the session. The sum type makes "no layout mutation after resolution"
//! structural: a resolved shader has no accumulator to mutate.

use prism_native::modern::{BindKind, BindingSource, LayoutEntry, ModernPipelineId};

#[derive(Debug)]
pub(crate) enum PipelineState {
    Unresolved(LayoutAccumulator),
    Resolved(ResolvedPipeline),
}

impl PipelineState {
    pub fn new() -> Self {
        PipelineState::Unresolved(LayoutAccumulator::default())
    }

    #[cfg(test)]
    pub fn is_resolved(&self) -> bool {
        matches!(self, PipelineState::Resolved(_))
    }
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct ResolvedPipeline {
    pub pipeline: ModernPipelineId,
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct RecordedBind {
    pub kind: BindKind,
    pub slot: u32,
    pub source: BindingSource,
}

/// Ordered (slot-kind, slot) layout plus the bindings recorded against it.
#[derive(Debug, Default)]
pub(crate) struct LayoutAccumulator {
    entries: Vec<LayoutEntry>,
    recorded: Vec<RecordedBind>,
}

impl LayoutAccumulator {
    /// Record a binding. Rebinding a (kind, slot) pair keeps a single layout
    /// entry but preserves every recorded bind, replayed in call order.
    pub fn record(&mut self, kind: BindKind, slot: u32, source: BindingSource) {
        let entry = LayoutEntry { kind, slot };
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
        self.recorded.push(RecordedBind { kind, slot, source });
    }

    pub fn layout(&self) -> &[LayoutEntry] {
        &self.entries
    }

    pub fn recorded(&self) -> &[RecordedBind] {
        &self.recorded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_native::modern::{HeapId, ModernBufferId};

    fn descriptor(index: u32) -> BindingSource {
        BindingSource::Descriptor {
            heap: HeapId(0),
            index,
        }
    }

    #[test]
    fn rebinding_a_slot_keeps_one_layout_entry() {
        let mut acc = LayoutAccumulator::default();
        acc.record(BindKind::Input, 0, descriptor(1));
        acc.record(BindKind::Input, 0, descriptor(2));
        acc.record(BindKind::Constant, 0, BindingSource::Buffer(ModernBufferId(0)));
        assert_eq!(acc.layout().len(), 2);
        assert_eq!(acc.recorded().len(), 3);
    }

    #[test]
    fn recorded_binds_preserve_call_order() {
        let mut acc = LayoutAccumulator::default();
        acc.record(BindKind::Output, 1, descriptor(5));
        acc.record(BindKind::Input, 0, descriptor(3));
        let slots: Vec<u32> = acc.recorded().iter().map(|b| b.slot).collect();
        assert_eq!(slots, vec![1, 0]);
    }
}
