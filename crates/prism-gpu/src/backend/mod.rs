pub(crate) mod explicit;
pub(crate) mod immediate;

use crate::error::GpuError;
use crate::types::{ShaderDesc, ShaderKind};

/// Shadow binding state: per-slot-kind high-water marks, so dispatch can
/// unbind exactly the slots a pass touched, plus the output extent compute
/// grids are derived from.
#[derive(Debug, Default)]
pub(crate) struct BindTracker {
    pub input_hwm: u32,
    pub output_hwm: u32,
    pub constant_hwm: u32,
    pub output0_extent: Option<(u32, u32)>,
}

/// Assemble shader source into a kernel blob, mapping assembler diagnostics
/// into the compile-error taxonomy.
pub(crate) fn assemble_shader(
    desc: &ShaderDesc<'_>,
    kind: ShaderKind,
) -> Result<Vec<u8>, GpuError> {
    let stage = match kind {
        ShaderKind::Compute => prism_shade::KernelStage::Compute,
        ShaderKind::Quad => prism_shade::KernelStage::Quad,
    };
    prism_shade::assemble(desc.source, desc.entry, stage, desc.defines).map_err(|err| {
        GpuError::Compile {
            name: desc.name.to_string(),
            diagnostics: err.to_string(),
        }
    })
}

pub(crate) fn ceil_div(value: u32, divisor: u32) -> u32 {
    (value + divisor - 1) / divisor
}

/// Convert a raw timestamp delta to microseconds.
pub(crate) fn ticks_to_micros(ticks: u64) -> f64 {
    ticks as f64 * 1_000_000.0 / prism_native::TIMESTAMP_HZ as f64
}
