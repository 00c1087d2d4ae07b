//! The legacy immediate-mode device surface.
//!
//! Calls execute when issued against an implicit current-state block: bound
//! kernel, input/output/constant slots and render target all persist until
//! reassigned or nulled. Timestamp query results become readable only after
//! the flush following the write, mirroring how immediate-mode drivers defer
//! query readback.

use tracing::debug;

use crate::error::NativeError;
use crate::exec::{self, KernelIo, SurfaceRef};
use crate::resource::{BufferStorage, Image, ImageDesc};

/// Maximum input slots in the implicit state block.
pub const LEGACY_INPUT_SLOTS: usize = 8;
/// Maximum output slots in the implicit state block.
pub const LEGACY_OUTPUT_SLOTS: usize = 4;
/// Maximum constant-buffer slots in the implicit state block.
pub const LEGACY_CONSTANT_SLOTS: usize = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LegacyImageId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LegacyBufferId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LegacyViewId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LegacyKernelId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LegacyQueryId(pub u32);

/// What a view object exposes its image as.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LegacyViewKind {
    ShaderResource,
    Storage,
    RenderTarget,
    DepthStencil,
}

#[derive(Debug, Copy, Clone)]
struct LegacyViewDesc {
    image: LegacyImageId,
    kind: LegacyViewKind,
    layer: u32,
}

/// The implicit pipeline state. Cloned wholesale for save/restore.
#[derive(Debug, Clone, Default)]
struct LegacyState {
    kernel: Option<LegacyKernelId>,
    inputs: [Option<LegacyViewId>; LEGACY_INPUT_SLOTS],
    outputs: [Option<LegacyViewId>; LEGACY_OUTPUT_SLOTS],
    constants: [Option<LegacyBufferId>; LEGACY_CONSTANT_SLOTS],
    render_target: Option<LegacyViewId>,
    depth_target: Option<LegacyViewId>,
}

/// Opaque saved copy of the implicit state.
#[derive(Debug, Clone)]
pub struct LegacyStateBlock(LegacyState);

#[derive(Debug)]
struct QuerySlot {
    value: Option<u64>,
    /// Flush count at write time; readable once the device has flushed past it.
    written_at_flush: Option<u64>,
}

/// An immediate-mode native device.
#[derive(Debug, Default)]
pub struct LegacyDevice {
    images: Vec<Image>,
    buffers: Vec<BufferStorage>,
    views: Vec<LegacyViewDesc>,
    kernels: Vec<prism_shade::Program>,
    queries: Vec<QuerySlot>,
    state: LegacyState,
    flushes: u64,
    clock: u64,
}

impl LegacyDevice {
    pub fn new() -> Self {
        Self::default()
    }

    // --- resources ---------------------------------------------------------

    pub fn create_image(&mut self, desc: ImageDesc) -> Result<LegacyImageId, NativeError> {
        let image = Image::new(desc)?;
        let id = LegacyImageId(self.images.len() as u32);
        debug!(?desc, id = id.0, "legacy: created image");
        self.images.push(image);
        Ok(id)
    }

    pub fn update_image(
        &mut self,
        id: LegacyImageId,
        layer: u32,
        mip: u32,
        data: &[u8],
    ) -> Result<(), NativeError> {
        self.image(id)?.write(layer, mip, data)
    }

    pub fn read_image(
        &self,
        id: LegacyImageId,
        layer: u32,
        mip: u32,
    ) -> Result<Vec<u8>, NativeError> {
        self.image(id)?.read(layer, mip)
    }

    pub fn image_desc(&self, id: LegacyImageId) -> Result<&ImageDesc, NativeError> {
        Ok(&self.image(id)?.desc)
    }

    pub fn create_buffer(&mut self, len: usize) -> LegacyBufferId {
        let id = LegacyBufferId(self.buffers.len() as u32);
        self.buffers.push(BufferStorage::new(len));
        id
    }

    pub fn update_buffer(
        &mut self,
        id: LegacyBufferId,
        offset: usize,
        data: &[u8],
    ) -> Result<(), NativeError> {
        self.buffer(id)?.write(offset, data)
    }

    pub fn read_buffer(&self, id: LegacyBufferId) -> Result<Vec<u8>, NativeError> {
        Ok(self.buffer(id)?.bytes.borrow().clone())
    }

    pub fn create_view(
        &mut self,
        image: LegacyImageId,
        kind: LegacyViewKind,
        layer: u32,
    ) -> Result<LegacyViewId, NativeError> {
        let img = self.image(image)?;
        if layer >= img.desc.array_layers {
            return Err(NativeError::Validation(format!(
                "view layer {layer} out of range ({} layers)",
                img.desc.array_layers
            )));
        }
        use crate::resource::BindFlags;
        let required = match kind {
            LegacyViewKind::ShaderResource => BindFlags::SHADER_RESOURCE,
            LegacyViewKind::Storage => BindFlags::STORAGE,
            LegacyViewKind::RenderTarget => BindFlags::RENDER_TARGET,
            LegacyViewKind::DepthStencil => BindFlags::DEPTH_STENCIL,
        };
        if !img.desc.bind.contains(required) {
            return Err(NativeError::Validation(format!(
                "image was not created with {required:?}"
            )));
        }
        let id = LegacyViewId(self.views.len() as u32);
        self.views.push(LegacyViewDesc { image, kind, layer });
        Ok(id)
    }

    pub fn create_kernel(&mut self, blob: &[u8]) -> Result<LegacyKernelId, NativeError> {
        let program = prism_shade::decode(blob)?;
        let id = LegacyKernelId(self.kernels.len() as u32);
        debug!(entry = %program.entry, id = id.0, "legacy: created kernel");
        self.kernels.push(program);
        Ok(id)
    }

    // --- implicit state ----------------------------------------------------

    pub fn set_kernel(&mut self, kernel: Option<LegacyKernelId>) -> Result<(), NativeError> {
        if let Some(id) = kernel {
            self.kernel(id)?;
        }
        self.state.kernel = kernel;
        Ok(())
    }

    pub fn set_input(
        &mut self,
        slot: u32,
        view: Option<LegacyViewId>,
    ) -> Result<(), NativeError> {
        let slot = check_slot(slot, LEGACY_INPUT_SLOTS, "input")?;
        if let Some(id) = view {
            self.expect_view_kind(id, LegacyViewKind::ShaderResource)?;
        }
        self.state.inputs[slot] = view;
        Ok(())
    }

    pub fn set_output(
        &mut self,
        slot: u32,
        view: Option<LegacyViewId>,
    ) -> Result<(), NativeError> {
        let slot = check_slot(slot, LEGACY_OUTPUT_SLOTS, "output")?;
        if let Some(id) = view {
            self.expect_view_kind(id, LegacyViewKind::Storage)?;
        }
        self.state.outputs[slot] = view;
        Ok(())
    }

    pub fn set_constants(
        &mut self,
        slot: u32,
        buffer: Option<LegacyBufferId>,
    ) -> Result<(), NativeError> {
        let slot = check_slot(slot, LEGACY_CONSTANT_SLOTS, "constant")?;
        if let Some(id) = buffer {
            self.buffer(id)?;
        }
        self.state.constants[slot] = buffer;
        Ok(())
    }

    pub fn set_render_target(
        &mut self,
        color: Option<LegacyViewId>,
        depth: Option<LegacyViewId>,
    ) -> Result<(), NativeError> {
        if let Some(id) = color {
            self.expect_view_kind(id, LegacyViewKind::RenderTarget)?;
        }
        if let Some(id) = depth {
            self.expect_view_kind(id, LegacyViewKind::DepthStencil)?;
        }
        self.state.render_target = color;
        self.state.depth_target = depth;
        Ok(())
    }

    pub fn save_state(&self) -> LegacyStateBlock {
        LegacyStateBlock(self.state.clone())
    }

    pub fn restore_state(&mut self, block: &LegacyStateBlock) {
        self.state = block.0.clone();
    }

    // --- execution ---------------------------------------------------------

    pub fn clear_render_target(
        &mut self,
        view: LegacyViewId,
        color: [f32; 4],
    ) -> Result<(), NativeError> {
        let desc = self.expect_view_kind(view, LegacyViewKind::RenderTarget)?;
        let surface = self.surface(desc)?;
        exec::clear_surface(&surface, color);
        self.clock += 1;
        Ok(())
    }

    /// Run the bound compute kernel over `groups * group_size` invocations.
    pub fn dispatch(
        &mut self,
        groups: [u32; 3],
        group_size: [u32; 3],
    ) -> Result<(), NativeError> {
        let kernel = self
            .state
            .kernel
            .ok_or_else(|| NativeError::Validation("dispatch with no kernel bound".into()))?;
        let program = self.kernel(kernel)?;
        if program.stage != prism_shade::KernelStage::Compute {
            return Err(NativeError::Validation(format!(
                "kernel '{}' is not a compute kernel",
                program.entry
            )));
        }
        let width = groups[0].saturating_mul(group_size[0]);
        let height = groups[1].saturating_mul(group_size[1]);
        let program = program.clone();
        let io = self.kernel_io(None)?;
        exec::run_kernel(&program, &io, width, height)?;
        self.clock += 1;
        Ok(())
    }

    /// Run the bound quad kernel over every pixel of the bound render target.
    pub fn draw_quad(&mut self) -> Result<(), NativeError> {
        let kernel = self
            .state
            .kernel
            .ok_or_else(|| NativeError::Validation("draw_quad with no kernel bound".into()))?;
        let program = self.kernel(kernel)?;
        if program.stage != prism_shade::KernelStage::Quad {
            return Err(NativeError::Validation(format!(
                "kernel '{}' is not a quad kernel",
                program.entry
            )));
        }
        let target_id = self.state.render_target.ok_or_else(|| {
            NativeError::Validation("draw_quad with no render target bound".into())
        })?;
        let target_desc = *self.view(target_id)?;
        let target = self.surface(target_desc)?;
        let (width, height) = (target.width, target.height);
        let program = program.clone();
        let io = self.kernel_io(Some(target))?;
        exec::run_kernel(&program, &io, width, height)?;
        self.clock += 1;
        Ok(())
    }

    /// Fixed-function overlay draw into the bound render target.
    pub fn draw_mesh(
        &mut self,
        vertex_buffer: LegacyBufferId,
        stride: u32,
        index_buffer: LegacyBufferId,
        index_count: u32,
    ) -> Result<(), NativeError> {
        let target_id = self.state.render_target.ok_or_else(|| {
            NativeError::Validation("draw_mesh with no render target bound".into())
        })?;
        let target_desc = *self.view(target_id)?;
        let target = self.surface(target_desc)?;

        let vertices = self.buffer(vertex_buffer)?.bytes.borrow().clone();
        let indices = read_indices(&self.buffer(index_buffer)?.bytes.borrow(), index_count)?;
        exec::draw_mesh(&target, &vertices, stride, &indices)?;
        self.clock += 1;
        Ok(())
    }

    /// Full copy of every subresource from `src` to `dst`.
    pub fn copy_image(
        &mut self,
        src: LegacyImageId,
        dst: LegacyImageId,
    ) -> Result<(), NativeError> {
        let (src_img, dst_img) = (self.image(src)?, self.image(dst)?);
        if src_img.desc.array_layers != dst_img.desc.array_layers
            || src_img.desc.mip_levels != dst_img.desc.mip_levels
        {
            return Err(NativeError::Validation(
                "copy between images with different subresource counts".into(),
            ));
        }
        for layer in 0..src_img.desc.array_layers {
            for mip in 0..src_img.desc.mip_levels {
                let from = surface_of(src_img, layer, mip)?;
                let to = surface_of(dst_img, layer, mip)?;
                exec::copy_surface(&from, &to)?;
            }
        }
        self.clock += 1;
        Ok(())
    }

    // --- queries and synchronization ---------------------------------------

    pub fn create_timestamp_query(&mut self) -> LegacyQueryId {
        let id = LegacyQueryId(self.queries.len() as u32);
        self.queries.push(QuerySlot {
            value: None,
            written_at_flush: None,
        });
        id
    }

    /// Record the current GPU clock into `query`. The result only becomes
    /// readable after the next flush.
    pub fn write_timestamp(&mut self, query: LegacyQueryId) -> Result<(), NativeError> {
        self.clock += 1;
        let flushes = self.flushes;
        let clock = self.clock;
        let slot = self.query_mut(query)?;
        slot.value = Some(clock);
        slot.written_at_flush = Some(flushes);
        Ok(())
    }

    /// Read a timestamp query; `None` until the device has flushed past the
    /// write.
    pub fn query_result(&self, query: LegacyQueryId) -> Result<Option<u64>, NativeError> {
        let slot = self
            .queries
            .get(query.0 as usize)
            .ok_or(NativeError::InvalidHandle {
                what: "query",
                id: query.0,
            })?;
        match (slot.value, slot.written_at_flush) {
            (Some(value), Some(written)) if self.flushes > written => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    pub fn flush(&mut self) {
        self.flushes += 1;
        self.clock += 1;
        debug!(flushes = self.flushes, "legacy: flush");
    }

    // --- lookups -----------------------------------------------------------

    fn image(&self, id: LegacyImageId) -> Result<&Image, NativeError> {
        self.images.get(id.0 as usize).ok_or(NativeError::InvalidHandle {
            what: "image",
            id: id.0,
        })
    }

    fn buffer(&self, id: LegacyBufferId) -> Result<&BufferStorage, NativeError> {
        self.buffers
            .get(id.0 as usize)
            .ok_or(NativeError::InvalidHandle {
                what: "buffer",
                id: id.0,
            })
    }

    fn view(&self, id: LegacyViewId) -> Result<&LegacyViewDesc, NativeError> {
        self.views.get(id.0 as usize).ok_or(NativeError::InvalidHandle {
            what: "view",
            id: id.0,
        })
    }

    fn kernel(&self, id: LegacyKernelId) -> Result<&prism_shade::Program, NativeError> {
        self.kernels
            .get(id.0 as usize)
            .ok_or(NativeError::InvalidHandle {
                what: "kernel",
                id: id.0,
            })
    }

    fn query_mut(&mut self, id: LegacyQueryId) -> Result<&mut QuerySlot, NativeError> {
        self.queries
            .get_mut(id.0 as usize)
            .ok_or(NativeError::InvalidHandle {
                what: "query",
                id: id.0,
            })
    }

    fn expect_view_kind(
        &self,
        id: LegacyViewId,
        kind: LegacyViewKind,
    ) -> Result<LegacyViewDesc, NativeError> {
        let desc = *self.view(id)?;
        if desc.kind != kind {
            return Err(NativeError::Validation(format!(
                "view is a {:?} view, expected {kind:?}",
                desc.kind
            )));
        }
        Ok(desc)
    }

    fn surface(&self, desc: LegacyViewDesc) -> Result<SurfaceRef, NativeError> {
        surface_of(self.image(desc.image)?, desc.layer, 0)
    }

    /// Build the engine bindings from the implicit state; `quad_target`
    /// substitutes the render target as output slot 0 for quad draws.
    fn kernel_io(&self, quad_target: Option<SurfaceRef>) -> Result<KernelIo, NativeError> {
        let mut io = KernelIo::default();
        for slot in self.state.inputs.iter() {
            io.inputs.push(match slot {
                Some(id) => Some(self.surface(*self.view(*id)?)?),
                None => None,
            });
        }
        match quad_target {
            Some(target) => io.outputs.push(Some(target)),
            None => {
                for slot in self.state.outputs.iter() {
                    io.outputs.push(match slot {
                        Some(id) => Some(self.surface(*self.view(*id)?)?),
                        None => None,
                    });
                }
            }
        }
        for slot in self.state.constants.iter() {
            io.constants.push(match slot {
                Some(id) => Some(self.buffer(*id)?.bytes.clone()),
                None => None,
            });
        }
        Ok(io)
    }
}

fn check_slot(slot: u32, limit: usize, what: &str) -> Result<usize, NativeError> {
    if (slot as usize) < limit {
        Ok(slot as usize)
    } else {
        Err(NativeError::Validation(format!(
            "{what} slot {slot} out of range (limit {limit})"
        )))
    }
}

fn surface_of(image: &Image, layer: u32, mip: u32) -> Result<SurfaceRef, NativeError> {
    let (width, height) = image.desc.mip_extent(mip);
    Ok(SurfaceRef {
        data: image.subresource(layer, mip)?.clone(),
        width,
        height,
        format: image.desc.format,
    })
}

fn read_indices(bytes: &[u8], index_count: u32) -> Result<Vec<u16>, NativeError> {
    let needed = index_count as usize * 2;
    let slice = bytes.get(..needed).ok_or_else(|| {
        NativeError::Validation(format!(
            "index buffer of {} bytes cannot hold {index_count} 16-bit indices",
            bytes.len()
        ))
    })?;
    Ok(slice
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::BindFlags;
    use crate::NativeFormat;
    use prism_shade::{assemble, KernelStage};

    fn rgba(width: u32, height: u32, bind: BindFlags) -> ImageDesc {
        ImageDesc {
            width,
            height,
            array_layers: 1,
            mip_levels: 1,
            sample_count: 1,
            format: NativeFormat::Rgba8Unorm,
            bind,
        }
    }

    fn copy_blob() -> Vec<u8> {
        assemble(
            "kernel main\n    ld r0, t0\n    st u0, r0\nend\n",
            "main",
            KernelStage::Compute,
            &[],
        )
        .unwrap()
    }

    #[test]
    fn immediate_dispatch_executes_at_call_time() {
        let mut dev = LegacyDevice::new();
        let src = dev
            .create_image(rgba(4, 4, BindFlags::SHADER_RESOURCE | BindFlags::TRANSFER))
            .unwrap();
        let dst = dev
            .create_image(rgba(4, 4, BindFlags::STORAGE | BindFlags::TRANSFER))
            .unwrap();
        dev.update_image(src, 0, 0, &[0xAB; 64]).unwrap();

        let kernel = dev.create_kernel(&copy_blob()).unwrap();
        let srv = dev.create_view(src, LegacyViewKind::ShaderResource, 0).unwrap();
        let uav = dev.create_view(dst, LegacyViewKind::Storage, 0).unwrap();

        dev.set_kernel(Some(kernel)).unwrap();
        dev.set_input(0, Some(srv)).unwrap();
        dev.set_output(0, Some(uav)).unwrap();
        dev.dispatch([1, 1, 1], [4, 4, 1]).unwrap();

        assert_eq!(dev.read_image(dst, 0, 0).unwrap(), vec![0xAB; 64]);
    }

    #[test]
    fn view_kind_must_match_bind_flags() {
        let mut dev = LegacyDevice::new();
        let image = dev.create_image(rgba(4, 4, BindFlags::SHADER_RESOURCE)).unwrap();
        assert!(dev.create_view(image, LegacyViewKind::RenderTarget, 0).is_err());
    }

    #[test]
    fn state_save_restore_round_trips() {
        let mut dev = LegacyDevice::new();
        let image = dev.create_image(rgba(4, 4, BindFlags::SHADER_RESOURCE)).unwrap();
        let srv = dev.create_view(image, LegacyViewKind::ShaderResource, 0).unwrap();

        let clean = dev.save_state();
        dev.set_input(0, Some(srv)).unwrap();
        dev.restore_state(&clean);
        assert!(dev.state.inputs[0].is_none());
    }

    #[test]
    fn timestamp_readable_only_after_flush() {
        let mut dev = LegacyDevice::new();
        let query = dev.create_timestamp_query();
        dev.write_timestamp(query).unwrap();
        assert_eq!(dev.query_result(query).unwrap(), None);
        dev.flush();
        assert!(dev.query_result(query).unwrap().is_some());
    }

    #[test]
    fn dispatch_without_kernel_is_rejected() {
        let mut dev = LegacyDevice::new();
        assert!(matches!(
            dev.dispatch([1, 1, 1], [8, 8, 1]),
            Err(NativeError::Validation(_))
        ));
    }
}
