//! Umbrella crate for the compositor GPU stack.
//!
//! Re-exports the unified device abstraction; the member crates remain
//! importable directly when only one layer is needed.

pub use prism_gpu::*;

pub use prism_native;
pub use prism_shade;
