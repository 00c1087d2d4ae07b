//! Device implementation over the legacy immediate-mode native API.
//!
//! The native device already holds implicit pipeline state and executes at
//! call time, so bindings are issued as they arrive and dispatch only draws.
//! The layer's own work here is the shadow state: slot high-water marks so
//! dispatch can unbind what a pass touched, the grid-extent record for
//! compute dispatch, and the save/restore stack.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use prism_native::legacy::{
    LegacyBufferId, LegacyDevice, LegacyImageId, LegacyKernelId, LegacyQueryId,
    LegacyStateBlock, LegacyViewKind,
};
use tracing::debug;

use crate::backend::{assemble_shader, ceil_div, ticks_to_micros, BindTracker};
use crate::device::{Device, ImportedTexture};
use crate::error::GpuError;
use crate::hooks::EventHooks;
use crate::resource::{ConstantBuffer, GpuTimer, Mesh, MeshVertex, Shader, Texture};
use crate::stats::DeviceStats;
use crate::types::{BackendKind, ShaderDesc, ShaderKind, TextureDesc, ViewKind};
use crate::view::{TextureView, ViewCache, ViewData};

#[derive(Debug, Copy, Clone)]
struct CurrentShader {
    kind: ShaderKind,
    group_size: [u32; 3],
}

struct ImmediateShared {
    native: LegacyDevice,
    saved: Vec<LegacyStateBlock>,
    bind: BindTracker,
    current: Option<CurrentShader>,
    stats: DeviceStats,
    shut_down: bool,
}

impl ImmediateShared {
    fn ensure_live(&self) -> Result<(), GpuError> {
        if self.shut_down {
            Err(GpuError::DeviceShutDown)
        } else {
            Ok(())
        }
    }

    /// Unbind every slot touched since the last clear and reset the marks.
    fn clear_bindings(&mut self) -> Result<(), GpuError> {
        for slot in 0..self.bind.input_hwm {
            self.native.set_input(slot, None)?;
        }
        for slot in 0..self.bind.output_hwm {
            self.native.set_output(slot, None)?;
        }
        for slot in 0..self.bind.constant_hwm {
            self.native.set_constants(slot, None)?;
        }
        self.bind = BindTracker::default();
        Ok(())
    }
}

pub(crate) struct ImmediateDevice {
    shared: Rc<RefCell<ImmediateShared>>,
    hooks: EventHooks,
}

impl ImmediateDevice {
    pub fn new(native: LegacyDevice) -> Self {
        Self {
            shared: Rc::new(RefCell::new(ImmediateShared {
                native,
                saved: Vec::new(),
                bind: BindTracker::default(),
                current: None,
                stats: DeviceStats::default(),
                shut_down: false,
            })),
            hooks: EventHooks::default(),
        }
    }
}

fn mismatch() -> GpuError {
    GpuError::BackendMismatch {
        expected: BackendKind::Immediate,
        actual: BackendKind::Explicit,
    }
}

fn downcast_texture(texture: &Rc<dyn Texture>) -> Result<&ImmediateTexture, GpuError> {
    texture.as_any().downcast_ref().ok_or_else(mismatch)
}

fn downcast_buffer(buffer: &Rc<dyn ConstantBuffer>) -> Result<&ImmediateBuffer, GpuError> {
    buffer.as_any().downcast_ref().ok_or_else(mismatch)
}

/// Check a view's backend and kind, returning its native id.
fn expect_view(
    view: &TextureView,
    kind: ViewKind,
) -> Result<prism_native::legacy::LegacyViewId, GpuError> {
    if view.backend != BackendKind::Immediate {
        return Err(mismatch());
    }
    if view.kind != kind {
        return Err(GpuError::Capability {
            message: format!("{:?} view passed where {kind:?} was expected", view.kind),
        });
    }
    match view.data {
        ViewData::Legacy(id) => Ok(id),
        ViewData::Modern { .. } => Err(mismatch()),
    }
}

fn legacy_view_kind(kind: ViewKind) -> LegacyViewKind {
    match kind {
        ViewKind::ShaderInput => LegacyViewKind::ShaderResource,
        ViewKind::ComputeOutput => LegacyViewKind::Storage,
        ViewKind::RenderTarget => LegacyViewKind::RenderTarget,
        ViewKind::DepthStencil => LegacyViewKind::DepthStencil,
    }
}

impl Device for ImmediateDevice {
    fn backend(&self) -> BackendKind {
        BackendKind::Immediate
    }

    fn create_texture(
        &self,
        desc: &TextureDesc,
        initial_data: Option<&[u8]>,
    ) -> Result<Rc<dyn Texture>, GpuError> {
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        let image = shared.native.create_image(desc.to_native())?;
        if let Some(data) = initial_data {
            if data.len() != desc.top_level_len() {
                return Err(GpuError::Capability {
                    message: format!(
                        "initial data of {} bytes for a {} byte subresource",
                        data.len(),
                        desc.top_level_len()
                    ),
                });
            }
            shared.native.update_image(image, 0, 0, data)?;
        }
        drop(shared);
        Ok(Rc::new(ImmediateTexture {
            shared: self.shared.clone(),
            image,
            desc: *desc,
            views: ViewCache::default(),
        }))
    }

    fn import_texture(&self, imported: ImportedTexture) -> Result<Rc<dyn Texture>, GpuError> {
        let ImportedTexture::Legacy { image, desc } = imported else {
            return Err(mismatch());
        };
        let shared = self.shared.borrow();
        shared.ensure_live()?;
        let native_desc = shared.native.image_desc(image)?;
        if native_desc.width != desc.width
            || native_desc.height != desc.height
            || native_desc.format != desc.format.to_native()
        {
            return Err(GpuError::Capability {
                message: "imported texture declaration does not match the native image".into(),
            });
        }
        if !native_desc.bind.contains(desc.to_native().bind) {
            return Err(GpuError::Capability {
                message: format!(
                    "imported texture declares usage {:?} beyond the native bind flags {:?}",
                    desc.usage, native_desc.bind
                ),
            });
        }
        drop(shared);
        Ok(Rc::new(ImmediateTexture {
            shared: self.shared.clone(),
            image,
            desc,
            views: ViewCache::default(),
        }))
    }

    fn create_buffer(
        &self,
        size: usize,
        initial_data: Option<&[u8]>,
        immutable: bool,
    ) -> Result<Rc<dyn ConstantBuffer>, GpuError> {
        if immutable && initial_data.is_none() {
            return Err(GpuError::ImmutableWithoutData);
        }
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        let id = shared.native.create_buffer(size);
        if let Some(data) = initial_data {
            shared.native.update_buffer(id, 0, data)?;
        }
        drop(shared);
        Ok(Rc::new(ImmediateBuffer {
            shared: self.shared.clone(),
            id,
            len: size,
            immutable,
        }))
    }

    fn create_compute_shader(
        &self,
        desc: &ShaderDesc<'_>,
        thread_group_size: [u32; 3],
    ) -> Result<Rc<dyn Shader>, GpuError> {
        if thread_group_size.contains(&0) {
            return Err(GpuError::Capability {
                message: format!("thread group size {thread_group_size:?} contains zero"),
            });
        }
        let blob = assemble_shader(desc, ShaderKind::Compute)?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        let kernel = shared.native.create_kernel(&blob)?;
        Ok(Rc::new(ImmediateShader {
            kernel,
            kind: ShaderKind::Compute,
            group_size: thread_group_size,
            name: desc.name.to_string(),
        }))
    }

    fn create_quad_shader(&self, desc: &ShaderDesc<'_>) -> Result<Rc<dyn Shader>, GpuError> {
        let blob = assemble_shader(desc, ShaderKind::Quad)?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        let kernel = shared.native.create_kernel(&blob)?;
        Ok(Rc::new(ImmediateShader {
            kernel,
            kind: ShaderKind::Quad,
            group_size: [1, 1, 1],
            name: desc.name.to_string(),
        }))
    }

    fn create_mesh(
        &self,
        vertices: &[MeshVertex],
        indices: &[u16],
    ) -> Result<Rc<dyn Mesh>, GpuError> {
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(indices);
        let vertex_buffer = shared.native.create_buffer(vertex_bytes.len());
        shared.native.update_buffer(vertex_buffer, 0, vertex_bytes)?;
        let index_buffer = shared.native.create_buffer(index_bytes.len());
        shared.native.update_buffer(index_buffer, 0, index_bytes)?;
        Ok(Rc::new(ImmediateMesh {
            vertex_buffer,
            index_buffer,
            stride: std::mem::size_of::<MeshVertex>() as u32,
            index_count: indices.len() as u32,
        }))
    }

    fn create_timer(&self) -> Result<Rc<dyn GpuTimer>, GpuError> {
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        let start = shared.native.create_timestamp_query();
        let stop = shared.native.create_timestamp_query();
        Ok(Rc::new(ImmediateTimer {
            shared: self.shared.clone(),
            start,
            stop,
            consumed: Cell::new(true),
        }))
    }

    fn set_shader(&self, shader: &Rc<dyn Shader>) -> Result<(), GpuError> {
        let shader: &ImmediateShader = shader.as_any().downcast_ref().ok_or_else(mismatch)?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.clear_bindings()?;
        shared.native.set_kernel(Some(shader.kernel))?;
        shared.current = Some(CurrentShader {
            kind: shader.kind,
            group_size: shader.group_size,
        });
        debug!(name = %shader.name, "immediate: shader bound");
        Ok(())
    }

    fn set_shader_input(&self, slot: u32, view: &TextureView) -> Result<(), GpuError> {
        let id = expect_view(view, ViewKind::ShaderInput)?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.native.set_input(slot, Some(id))?;
        shared.bind.input_hwm = shared.bind.input_hwm.max(slot + 1);
        Ok(())
    }

    fn set_shader_output(&self, slot: u32, view: &TextureView) -> Result<(), GpuError> {
        let id = expect_view(view, ViewKind::ComputeOutput)?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.native.set_output(slot, Some(id))?;
        shared.bind.output_hwm = shared.bind.output_hwm.max(slot + 1);
        if slot == 0 {
            shared.bind.output0_extent = Some(view.extent());
        }
        Ok(())
    }

    fn set_shader_constants(
        &self,
        slot: u32,
        buffer: &Rc<dyn ConstantBuffer>,
    ) -> Result<(), GpuError> {
        let buffer = downcast_buffer(buffer)?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.native.set_constants(slot, Some(buffer.id))?;
        shared.bind.constant_hwm = shared.bind.constant_hwm.max(slot + 1);
        Ok(())
    }

    fn dispatch_shader_opts(&self, clear_bindings: bool) -> Result<(), GpuError> {
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        let current = shared.current.ok_or_else(|| GpuError::Capability {
            message: "dispatch with no shader set".into(),
        })?;
        match current.kind {
            ShaderKind::Compute => {
                let (width, height) =
                    shared.bind.output0_extent.ok_or_else(|| GpuError::Capability {
                        message: "compute dispatch requires an output bound at slot 0".into(),
                    })?;
                let groups = [
                    ceil_div(width, current.group_size[0]),
                    ceil_div(height, current.group_size[1]),
                    1,
                ];
                shared.native.dispatch(groups, current.group_size)?;
            }
            ShaderKind::Quad => shared.native.draw_quad()?,
        }
        shared.stats.dispatches += 1;
        if clear_bindings {
            shared.clear_bindings()?;
        }
        Ok(())
    }

    fn set_render_target(
        &self,
        color: Option<&TextureView>,
        depth: Option<&TextureView>,
    ) -> Result<(), GpuError> {
        let color_id = color
            .map(|view| expect_view(view, ViewKind::RenderTarget))
            .transpose()?;
        let depth_id = depth
            .map(|view| expect_view(view, ViewKind::DepthStencil))
            .transpose()?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.native.set_render_target(color_id, depth_id)?;
        drop(shared);
        if let Some(view) = color {
            self.hooks.emit_render_target_bound(view);
        }
        Ok(())
    }

    fn clear_render_target(
        &self,
        view: &TextureView,
        color: [f32; 4],
    ) -> Result<(), GpuError> {
        let id = expect_view(view, ViewKind::RenderTarget)?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.native.clear_render_target(id, color)?;
        Ok(())
    }

    fn draw_mesh(&self, mesh: &Rc<dyn Mesh>) -> Result<(), GpuError> {
        let mesh: &ImmediateMesh = mesh.as_any().downcast_ref().ok_or_else(mismatch)?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.native.draw_mesh(
            mesh.vertex_buffer,
            mesh.stride,
            mesh.index_buffer,
            mesh.index_count,
        )?;
        Ok(())
    }

    fn copy_texture(
        &self,
        src: &Rc<dyn Texture>,
        dst: &Rc<dyn Texture>,
    ) -> Result<(), GpuError> {
        let src = downcast_texture(src)?;
        let dst = downcast_texture(dst)?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.native.copy_image(src.image, dst.image)?;
        drop(shared);
        self.hooks.emit_texture_copied();
        Ok(())
    }

    fn save_context(&self) -> Result<(), GpuError> {
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        let block = shared.native.save_state();
        shared.saved.push(block);
        Ok(())
    }

    fn restore_context(&self) -> Result<(), GpuError> {
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        let block = shared.saved.pop().ok_or_else(|| GpuError::Capability {
            message: "restore_context without a matching save_context".into(),
        })?;
        shared.native.restore_state(&block);
        // Shadow state no longer describes the native state.
        shared.bind = BindTracker::default();
        shared.current = None;
        Ok(())
    }

    fn flush(&self, _blocking: bool, _end_of_frame: bool) -> Result<(), GpuError> {
        // The immediate backend executes at call time; flush only advances
        // the query-readability epoch.
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.native.flush();
        shared.stats.flushes += 1;
        Ok(())
    }

    fn read_texture(
        &self,
        texture: &Rc<dyn Texture>,
        slice: u32,
    ) -> Result<Vec<u8>, GpuError> {
        let texture = downcast_texture(texture)?;
        let shared = self.shared.borrow();
        shared.ensure_live()?;
        Ok(shared.native.read_image(texture.image, slice, 0)?)
    }

    fn read_buffer(&self, buffer: &Rc<dyn ConstantBuffer>) -> Result<Vec<u8>, GpuError> {
        let buffer = downcast_buffer(buffer)?;
        let shared = self.shared.borrow();
        shared.ensure_live()?;
        Ok(shared.native.read_buffer(buffer.id)?)
    }

    fn hooks(&self) -> &EventHooks {
        &self.hooks
    }

    fn stats(&self) -> DeviceStats {
        self.shared.borrow().stats
    }

    fn shutdown(&self) {
        let mut shared = self.shared.borrow_mut();
        shared.shut_down = true;
        debug!("immediate: device shut down");
    }
}

struct ImmediateTexture {
    shared: Rc<RefCell<ImmediateShared>>,
    image: LegacyImageId,
    desc: TextureDesc,
    views: ViewCache,
}

impl Texture for ImmediateTexture {
    fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    fn view_for_slice(&self, kind: ViewKind, slice: u32) -> Result<TextureView, GpuError> {
        if !self.desc.usage.contains(kind.required_usage()) {
            return Err(GpuError::Capability {
                message: format!(
                    "{kind:?} view requested on a texture without {:?} usage",
                    kind.required_usage()
                ),
            });
        }
        if let Some(view) = self.views.get(kind, slice) {
            return Ok(view);
        }
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        let id = shared
            .native
            .create_view(self.image, legacy_view_kind(kind), slice)?;
        drop(shared);
        let view = TextureView {
            backend: BackendKind::Immediate,
            kind,
            width: self.desc.width,
            height: self.desc.height,
            data: ViewData::Legacy(id),
        };
        self.views.insert(kind, slice, view.clone());
        Ok(view)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ImmediateBuffer {
    shared: Rc<RefCell<ImmediateShared>>,
    id: LegacyBufferId,
    len: usize,
    immutable: bool,
}

impl ConstantBuffer for ImmediateBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn is_immutable(&self) -> bool {
        self.immutable
    }

    fn update(&self, data: &[u8]) -> Result<(), GpuError> {
        if self.immutable {
            return Err(GpuError::Capability {
                message: "update of an immutable buffer".into(),
            });
        }
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.native.update_buffer(self.id, 0, data)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ImmediateShader {
    kernel: LegacyKernelId,
    kind: ShaderKind,
    group_size: [u32; 3],
    name: String,
}

impl Shader for ImmediateShader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ShaderKind {
        self.kind
    }

    fn thread_group_size(&self) -> [u32; 3] {
        self.group_size
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ImmediateMesh {
    vertex_buffer: LegacyBufferId,
    index_buffer: LegacyBufferId,
    stride: u32,
    index_count: u32,
}

impl Mesh for ImmediateMesh {
    fn index_count(&self) -> u32 {
        self.index_count
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ImmediateTimer {
    shared: Rc<RefCell<ImmediateShared>>,
    start: LegacyQueryId,
    stop: LegacyQueryId,
    /// True once the value has been taken (or before the first pair).
    consumed: Cell<bool>,
}

impl GpuTimer for ImmediateTimer {
    fn start(&self) -> Result<(), GpuError> {
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.native.write_timestamp(self.start)?;
        self.consumed.set(false);
        Ok(())
    }

    fn stop(&self) -> Result<(), GpuError> {
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.native.write_timestamp(self.stop)?;
        Ok(())
    }

    fn query_opts(&self, reset: bool) -> f64 {
        if self.consumed.get() {
            return 0.0;
        }
        let shared = self.shared.borrow();
        let (Ok(Some(start)), Ok(Some(stop))) = (
            shared.native.query_result(self.start),
            shared.native.query_result(self.stop),
        ) else {
            return 0.0;
        };
        if reset {
            self.consumed.set(true);
        }
        ticks_to_micros(stop.saturating_sub(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TextureFormat, TextureUsage};
    use prism_native::{BindFlags, ImageDesc, NativeFormat};

    fn device() -> ImmediateDevice {
        ImmediateDevice::new(LegacyDevice::new())
    }

    fn host_image(dev: &ImmediateDevice, bind: BindFlags) -> LegacyImageId {
        dev.shared
            .borrow_mut()
            .native
            .create_image(ImageDesc {
                width: 4,
                height: 4,
                array_layers: 1,
                mip_levels: 1,
                sample_count: 1,
                format: NativeFormat::Rgba8Unorm,
                bind,
            })
            .unwrap()
    }

    #[test]
    fn imported_images_behave_like_created_textures() {
        let dev = device();
        let image = host_image(&dev, BindFlags::SHADER_RESOURCE | BindFlags::TRANSFER);
        let data: Vec<u8> = (0..64).map(|i| i as u8).collect();
        dev.shared
            .borrow_mut()
            .native
            .update_image(image, 0, 0, &data)
            .unwrap();

        let desc = TextureDesc::new(
            4,
            4,
            TextureFormat::Rgba8Unorm,
            TextureUsage::SAMPLED | TextureUsage::TRANSFER,
        );
        let imported = dev
            .import_texture(ImportedTexture::Legacy { image, desc })
            .unwrap();
        assert_eq!(dev.read_texture(&imported, 0).unwrap(), data);
        imported.view(ViewKind::ShaderInput).unwrap();
    }

    #[test]
    fn import_rejects_usage_beyond_native_bind_flags() {
        let dev = device();
        let image = host_image(&dev, BindFlags::SHADER_RESOURCE);
        let desc = TextureDesc::new(
            4,
            4,
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_TARGET,
        );
        assert!(matches!(
            dev.import_texture(ImportedTexture::Legacy { image, desc }),
            Err(GpuError::Capability { .. })
        ));
    }

    #[test]
    fn restore_without_save_is_rejected() {
        let dev = device();
        assert!(matches!(
            dev.restore_context(),
            Err(GpuError::Capability { .. })
        ));
    }

    #[test]
    fn immutable_buffer_rejects_update() {
        let dev = device();
        let buffer = dev.create_buffer(16, Some(&[1u8; 16]), true).unwrap();
        assert!(matches!(
            buffer.update(&[2u8; 16]),
            Err(GpuError::Capability { .. })
        ));
    }

    #[test]
    fn compile_diagnostics_carry_the_shader_name() {
        let dev = device();
        let result = dev.create_quad_shader(&ShaderDesc {
            source: "kernel main\n    bogus r0, r1\nend\n",
            entry: "main",
            name: "sharpen",
            defines: &[],
        });
        match result {
            Err(GpuError::Compile { name, diagnostics }) => {
                assert_eq!(name, "sharpen");
                assert!(diagnostics.contains("line"));
            }
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("bogus opcode compiled"),
        }
    }

    #[test]
    fn shutdown_poisons_every_operation() {
        let dev = device();
        dev.shutdown();
        let desc = TextureDesc::new(4, 4, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED);
        assert!(matches!(
            dev.create_texture(&desc, None),
            Err(GpuError::DeviceShutDown)
        ));
        assert!(matches!(dev.flush(true, true), Err(GpuError::DeviceShutDown)));
    }
}
