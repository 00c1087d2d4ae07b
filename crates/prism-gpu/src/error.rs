use prism_native::NativeError;
use thiserror::Error;

use crate::types::BackendKind;

/// Errors surfaced by the unified device layer.
///
/// All of these are fatal to the call that produced them; there is no
/// transient-failure or retry model at this level. The only non-error
/// "empty" state in the API is `GpuTimer::query` returning 0.
#[derive(Debug, Error)]
pub enum GpuError {
    /// A view or operation was requested beyond a resource's declared
    /// capabilities.
    #[error("capability error: {message}")]
    Capability { message: String },

    /// Shader source failed to compile; carries the assembler diagnostics.
    #[error("shader '{name}' failed to compile: {diagnostics}")]
    Compile { name: String, diagnostics: String },

    /// A fixed-capacity descriptor or query heap ran out of slots. Heap
    /// sizes are a startup configuration parameter, so this is fatal.
    #[error("{kind} heap exhausted at capacity {capacity}")]
    HeapExhausted { kind: &'static str, capacity: u32 },

    /// A resource created on one backend was used against a device of the
    /// other backend.
    #[error("resource belongs to the {actual:?} backend, device is {expected:?}")]
    BackendMismatch {
        expected: BackendKind,
        actual: BackendKind,
    },

    /// `create_buffer` was asked for an immutable buffer without data to
    /// seal into it.
    #[error("immutable buffer requires initial data")]
    ImmutableWithoutData,

    /// The device was shut down; every subsequent operation fails.
    #[error("device has been shut down")]
    DeviceShutDown,

    /// A native device call failed.
    #[error("native device call failed: {0}")]
    Native(#[from] NativeError),
}
