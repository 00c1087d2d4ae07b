//! The device facade: resource factories plus the bind/dispatch protocol.

use std::rc::Rc;

use crate::backend::{explicit::ExplicitDevice, immediate::ImmediateDevice};
use crate::error::GpuError;
use crate::hooks::EventHooks;
use crate::resource::{ConstantBuffer, GpuTimer, Mesh, MeshVertex, Shader, Texture};
use crate::stats::DeviceStats;
use crate::types::{BackendKind, ShaderDesc, TextureDesc};
use crate::view::TextureView;

/// An already-created native device handle supplied by the host. This layer
/// never creates the native device itself; the handle's variant selects the
/// backend for the whole session.
pub enum NativeHandle {
    Legacy(prism_native::legacy::LegacyDevice),
    Modern(prism_native::modern::ModernDevice),
}

/// A host-owned native image to wrap as a texture, with its declared
/// dimensions, format and usage. The variant must match the device backend.
pub enum ImportedTexture {
    Legacy {
        image: prism_native::legacy::LegacyImageId,
        desc: TextureDesc,
    },
    Modern {
        image: prism_native::modern::ModernImageId,
        desc: TextureDesc,
    },
}

/// The unified device. One instance per session, driven by a single
/// submitting thread; it spawns no threads of its own.
///
/// Binding protocol: `set_shader` begins a bind sequence and clears prior
/// bindings, `set_shader_input`/`set_shader_output`/`set_shader_constants`
/// record bindings by slot, `dispatch_shader` executes. On the explicit
/// backend the first dispatch of a shader also resolves its pipeline from
/// the accumulated binding layout; later dispatches reuse it.
pub trait Device {
    fn backend(&self) -> BackendKind;

    // --- factories ---------------------------------------------------------

    /// Allocate a texture. With `initial_data` the top-level subresource is
    /// uploaded before return; on the explicit backend this goes through a
    /// staging buffer and forces a blocking flush.
    fn create_texture(
        &self,
        desc: &TextureDesc,
        initial_data: Option<&[u8]>,
    ) -> Result<Rc<dyn Texture>, GpuError>;

    /// Wrap a host-owned swapchain image. Behaves identically to an
    /// internally created texture.
    fn import_texture(&self, imported: ImportedTexture) -> Result<Rc<dyn Texture>, GpuError>;

    /// Allocate constant storage. `immutable` without `initial_data` is
    /// rejected.
    fn create_buffer(
        &self,
        size: usize,
        initial_data: Option<&[u8]>,
        immutable: bool,
    ) -> Result<Rc<dyn ConstantBuffer>, GpuError>;

    fn create_compute_shader(
        &self,
        desc: &ShaderDesc<'_>,
        thread_group_size: [u32; 3],
    ) -> Result<Rc<dyn Shader>, GpuError>;

    fn create_quad_shader(&self, desc: &ShaderDesc<'_>) -> Result<Rc<dyn Shader>, GpuError>;

    fn create_mesh(
        &self,
        vertices: &[MeshVertex],
        indices: &[u16],
    ) -> Result<Rc<dyn Mesh>, GpuError>;

    fn create_timer(&self) -> Result<Rc<dyn GpuTimer>, GpuError>;

    // --- bind/dispatch protocol --------------------------------------------

    /// Begin a new bind sequence: clears prior slot bindings and the slot
    /// high-water marks.
    fn set_shader(&self, shader: &Rc<dyn Shader>) -> Result<(), GpuError>;

    fn set_shader_input(&self, slot: u32, view: &TextureView) -> Result<(), GpuError>;

    fn set_shader_output(&self, slot: u32, view: &TextureView) -> Result<(), GpuError>;

    fn set_shader_constants(
        &self,
        slot: u32,
        buffer: &Rc<dyn ConstantBuffer>,
    ) -> Result<(), GpuError>;

    /// Dispatch the bound shader, then unbind every slot touched since
    /// `set_shader` so no state leaks into the next pass. Compute grids are
    /// derived from the output bound at slot 0; quad shaders cover the bound
    /// render target.
    fn dispatch_shader(&self) -> Result<(), GpuError> {
        self.dispatch_shader_opts(true)
    }

    /// Dispatch but keep the current bindings, for re-dispatching the same
    /// pass.
    fn dispatch_shader_no_clear(&self) -> Result<(), GpuError> {
        self.dispatch_shader_opts(false)
    }

    fn dispatch_shader_opts(&self, clear_bindings: bool) -> Result<(), GpuError>;

    // --- render targets and fixed-function paths ---------------------------

    fn set_render_target(
        &self,
        color: Option<&TextureView>,
        depth: Option<&TextureView>,
    ) -> Result<(), GpuError>;

    fn clear_render_target(&self, view: &TextureView, color: [f32; 4])
        -> Result<(), GpuError>;

    /// Draw an overlay mesh into the bound render target.
    fn draw_mesh(&self, mesh: &Rc<dyn Mesh>) -> Result<(), GpuError>;

    /// Full copy between same-size, same-format textures; fires the
    /// texture-copied hook.
    fn copy_texture(
        &self,
        src: &Rc<dyn Texture>,
        dst: &Rc<dyn Texture>,
    ) -> Result<(), GpuError>;

    // --- per-frame driving -------------------------------------------------

    /// Push the ambient native state so host rendering is undisturbed.
    fn save_context(&self) -> Result<(), GpuError>;

    fn restore_context(&self) -> Result<(), GpuError>;

    /// Submit recorded work. `end_of_frame` additionally resolves pending
    /// timestamp queries; `blocking` waits for the GPU to finish the
    /// submission before returning.
    fn flush(&self, blocking: bool, end_of_frame: bool) -> Result<(), GpuError>;

    // --- debug readback (blocking) -----------------------------------------

    fn read_texture(&self, texture: &Rc<dyn Texture>, slice: u32) -> Result<Vec<u8>, GpuError>;

    fn read_buffer(&self, buffer: &Rc<dyn ConstantBuffer>) -> Result<Vec<u8>, GpuError>;

    // --- observability and teardown ----------------------------------------

    fn hooks(&self) -> &EventHooks;

    fn stats(&self) -> DeviceStats;

    /// Tear the device down. Every operation afterwards fails with
    /// [`GpuError::DeviceShutDown`].
    fn shutdown(&self);
}

/// Wrap a native handle in the matching backend implementation.
pub fn open_device(handle: NativeHandle) -> Result<Rc<dyn Device>, GpuError> {
    match handle {
        NativeHandle::Legacy(native) => Ok(Rc::new(ImmediateDevice::new(native))),
        NativeHandle::Modern(native) => Ok(Rc::new(ExplicitDevice::new(native)?)),
    }
}
