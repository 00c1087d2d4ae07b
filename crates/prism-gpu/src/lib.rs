//! Unified GPU resource and command abstraction for the compositor.
//!
//! One set of capability traits (`Device`, `Texture`, `ConstantBuffer`,
//! `Shader`, `Mesh`, `GpuTimer`) over two structurally different native
//! backends: a legacy immediate-mode API with implicit pipeline state, and a
//! modern explicit-mode API with descriptor heaps, pipeline objects and
//! command lists. Post-processing passes written against the traits run
//! unmodified on either backend.
//!
//! The backend is chosen once, at [`open_device`], from the native handle
//! the host supplies. Instances never mix across backends; the device
//! detects and rejects a resource from the other backend before touching it.
//!
//! Single-threaded by contract: one submitting thread drives a device and
//! everything created on it. Types here are deliberately `!Send`/`!Sync`.

mod backend;
mod device;
mod error;
mod hooks;
mod resource;
mod stats;
mod types;
mod view;

pub use backend::explicit::TIMER_RESOLVE_LATENCY;
pub use device::{open_device, Device, ImportedTexture, NativeHandle};
pub use error::GpuError;
pub use hooks::EventHooks;
pub use resource::{ConstantBuffer, GpuTimer, Mesh, MeshVertex, Shader, Texture};
pub use stats::DeviceStats;
pub use types::{
    BackendKind, ShaderDesc, ShaderKind, TextureDesc, TextureFormat, TextureUsage, ViewKind,
};
pub use view::TextureView;
