//! Capability traits implemented by both backends.
//!
//! Clients hold resources as `Rc<dyn Trait>` and never see backend types;
//! the device rejects an instance from the other backend with a
//! [`GpuError::BackendMismatch`](crate::GpuError::BackendMismatch) before
//! touching it.

use std::any::Any;

use bytemuck::{Pod, Zeroable};

use crate::error::GpuError;
use crate::types::{ShaderKind, TextureDesc, ViewKind};
use crate::view::TextureView;

/// A 2D texture, either created by this layer or imported from the host
/// swapchain. Imported and internal textures behave identically.
pub trait Texture {
    fn desc(&self) -> &TextureDesc;

    /// View of slice 0. Views are created lazily and cached per
    /// (kind, slice) for the texture's lifetime.
    fn view(&self, kind: ViewKind) -> Result<TextureView, GpuError> {
        self.view_for_slice(kind, 0)
    }

    /// View of one array slice. Fails with a capability error when `kind`
    /// is outside the texture's declared usage, without touching any
    /// descriptor heap.
    fn view_for_slice(&self, kind: ViewKind, slice: u32) -> Result<TextureView, GpuError>;

    fn as_any(&self) -> &dyn Any;
}

/// Shader-constant storage.
pub trait ConstantBuffer {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_immutable(&self) -> bool;

    /// Re-upload contents. Immutable buffers reject this with a capability
    /// error.
    fn update(&self, data: &[u8]) -> Result<(), GpuError>;

    fn as_any(&self) -> &dyn Any;
}

/// Immutable bytecode plus dispatch parameters. On the explicit backend the
/// shader additionally owns its deferred pipeline state, resolved on first
/// dispatch.
pub trait Shader {
    fn name(&self) -> &str;

    fn kind(&self) -> ShaderKind;

    /// Thread-group extent; `[1, 1, 1]` for quad shaders.
    fn thread_group_size(&self) -> [u32; 3];

    fn as_any(&self) -> &dyn Any;
}

/// Overlay vertex layout: clip-space position plus straight-alpha color.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 2],
    pub color: [f32; 4],
}

/// An immutable 16-bit-indexed triangle list for the fixed-function overlay
/// path.
pub trait Mesh {
    fn index_count(&self) -> u32;

    fn as_any(&self) -> &dyn Any;
}

/// A start/stop GPU timestamp pair.
///
/// `query` never blocks: it reads the last resolved pair and returns 0 when
/// no resolved result exists yet. Results become available a fixed number of
/// end-of-frame flushes after `stop`.
pub trait GpuTimer {
    fn start(&self) -> Result<(), GpuError>;

    fn stop(&self) -> Result<(), GpuError>;

    /// Last resolved duration in microseconds, consuming the value: the
    /// timer reads 0 again until the next start/stop pair resolves.
    fn query(&self) -> f64 {
        self.query_opts(true)
    }

    /// `reset = false` allows repeated reads of the same resolved value.
    fn query_opts(&self, reset: bool) -> f64;
}
