use prism_shade::ShadeError;

/// Errors surfaced by the native device surfaces.
///
/// There is no transient-failure model at this level: every error is a hard
/// failure of the issuing call.
#[derive(Debug, thiserror::Error)]
pub enum NativeError {
    #[error("invalid {what} handle {id}")]
    InvalidHandle { what: &'static str, id: u32 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("kernel bytecode rejected: {0}")]
    Kernel(#[from] ShadeError),

    #[error("descriptor index {index} out of range for heap of capacity {capacity}")]
    DescriptorOutOfRange { index: u32, capacity: u32 },

    #[error("fence wait on unsignaled value {value} (completed {completed})")]
    WaitUnsignaled { value: u64, completed: u64 },
}
