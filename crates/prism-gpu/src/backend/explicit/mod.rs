//! Device implementation over the modern explicit-mode native API.
//!
//! Everything the legacy backend gets for free has to be managed here: views
//! live in descriptor heaps carved out at startup, shaders carry deferred
//! pipeline state resolved on first dispatch, commands are recorded into a
//! ring of command lists, and synchronization goes through a timeline fence.

mod heap;
mod pipeline;
mod submit;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use prism_native::modern::{
    BindKind, BindingSource, Descriptor, DescriptorHeapKind, HeapId, ModernBufferId,
    ModernDevice, ModernImageId, PipelineDesc, PipelineKind, SamplerFilter, QUERY_SLOTS,
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

use heap::DescriptorAllocator;
use pipeline::{PipelineState, ResolvedPipeline};
use submit::SubmitRing;

pub(crate) const RTV_HEAP_CAPACITY: u32 = 256;
pub(crate) const DSV_HEAP_CAPACITY: u32 = 64;
pub(crate) const RESOURCE_HEAP_CAPACITY: u32 = 4096;
pub(crate) const SAMPLER_HEAP_CAPACITY: u32 = 16;

/// End-of-frame flushes between a timer's `stop` and its result becoming
/// readable: queries are resolved once per end-of-frame flush, one cycle
/// behind the writes they cover.
pub const TIMER_RESOLVE_LATENCY: u64 = 2;

struct HeapSet {
    render_target: DescriptorAllocator,
    depth_stencil: DescriptorAllocator,
    resource: DescriptorAllocator,
    sampler: DescriptorAllocator,
}

struct ExplicitShared {
    native: ModernDevice,
    heaps: HeapSet,
    ring: SubmitRing,
    bind: BindTracker,
    current: Option<Rc<dyn Shader>>,
    mesh_pipeline: Option<prism_native::modern::ModernPipelineId>,
    timer_cursor: u32,
    eof_flushes: u64,
    save_depth: u32,
    stats: DeviceStats,
    shut_down: bool,
}

impl ExplicitShared {
    fn ensure_live(&self) -> Result<(), GpuError> {
        if self.shut_down {
            Err(GpuError::DeviceShutDown)
        } else {
            Ok(())
        }
    }

    /// Record unbinds for every slot touched since the last clear.
    fn clear_bindings(&mut self) {
        let bind = std::mem::take(&mut self.bind);
        let list = self.ring.active_mut();
        for slot in 0..bind.input_hwm {
            list.set_binding(BindKind::Input, slot, None);
        }
        for slot in 0..bind.output_hwm {
            list.set_binding(BindKind::Output, slot, None);
        }
        for slot in 0..bind.constant_hwm {
            list.set_binding(BindKind::Constant, slot, None);
        }
    }

    fn flush(&mut self, blocking: bool, end_of_frame: bool) -> Result<(), GpuError> {
        if end_of_frame {
            if self.timer_cursor > 0 {
                self.ring.active_mut().resolve_timestamps(0, self.timer_cursor);
            }
            self.eof_flushes += 1;
        }
        self.ring.submit(&mut self.native, blocking)?;
        self.stats.flushes += 1;
        Ok(())
    }
}

pub(crate) struct ExplicitDevice {
    shared: Rc<RefCell<ExplicitShared>>,
    hooks: EventHooks,
}

impl ExplicitDevice {
    pub fn new(mut native: ModernDevice) -> Result<Self, GpuError> {
        let rtv = native.create_descriptor_heap(DescriptorHeapKind::RenderTarget, RTV_HEAP_CAPACITY);
        let dsv = native.create_descriptor_heap(DescriptorHeapKind::DepthStencil, DSV_HEAP_CAPACITY);
        let resource =
            native.create_descriptor_heap(DescriptorHeapKind::Resource, RESOURCE_HEAP_CAPACITY);
        let sampler =
            native.create_descriptor_heap(DescriptorHeapKind::Sampler, SAMPLER_HEAP_CAPACITY);

        let mut heaps = HeapSet {
            render_target: DescriptorAllocator::new(rtv, "render target", RTV_HEAP_CAPACITY),
            depth_stencil: DescriptorAllocator::new(dsv, "depth stencil", DSV_HEAP_CAPACITY),
            resource: DescriptorAllocator::new(resource, "resource", RESOURCE_HEAP_CAPACITY),
            sampler: DescriptorAllocator::new(sampler, "sampler", SAMPLER_HEAP_CAPACITY),
        };

        // The one sampler every full-screen pass shares.
        let slot = heaps.sampler.allocate()?;
        native.write_descriptor(
            sampler,
            slot,
            Descriptor::Sampler {
                filter: SamplerFilter::Linear,
            },
        )?;

        Ok(Self {
            shared: Rc::new(RefCell::new(ExplicitShared {
                native,
                heaps,
                ring: SubmitRing::new(),
                bind: BindTracker::default(),
                current: None,
                mesh_pipeline: None,
                timer_cursor: 0,
                eof_flushes: 0,
                save_depth: 0,
                stats: DeviceStats::default(),
                shut_down: false,
            })),
            hooks: EventHooks::default(),
        })
    }
}

fn mismatch() -> GpuError {
    GpuError::BackendMismatch {
        expected: BackendKind::Explicit,
        actual: BackendKind::Immediate,
    }
}

fn downcast_texture(texture: &Rc<dyn Texture>) -> Result<&ExplicitTexture, GpuError> {
    texture.as_any().downcast_ref().ok_or_else(mismatch)
}

fn downcast_buffer(buffer: &Rc<dyn ConstantBuffer>) -> Result<&ExplicitBuffer, GpuError> {
    buffer.as_any().downcast_ref().ok_or_else(mismatch)
}

/// Check a view's backend and kind, returning its descriptor location.
fn expect_view(view: &TextureView, kind: ViewKind) -> Result<(HeapId, u32), GpuError> {
    if view.backend != BackendKind::Explicit {
        return Err(mismatch());
    }
    if view.kind != kind {
        return Err(GpuError::Capability {
            message: format!("{:?} view passed where {kind:?} was expected", view.kind),
        });
    }
    match view.data {
        ViewData::Modern { heap, index } => Ok((heap, index)),
        ViewData::Legacy(_) => Err(mismatch()),
    }
}

impl Device for ExplicitDevice {
    fn backend(&self) -> BackendKind {
        BackendKind::Explicit
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
            // Stage, record the copy, and block so the texture is valid
            // before first use.
            let staging = shared.native.create_buffer(data.len());
            shared.native.upload_buffer(staging, 0, data)?;
            shared.ring.active_mut().copy_buffer_to_image(staging, image, 0, 0);
            shared.flush(true, false)?;
        }
        drop(shared);
        Ok(Rc::new(ExplicitTexture {
            shared: self.shared.clone(),
            image,
            desc: *desc,
            views: ViewCache::default(),
        }))
    }

    fn import_texture(&self, imported: ImportedTexture) -> Result<Rc<dyn Texture>, GpuError> {
        let ImportedTexture::Modern { image, desc } = imported else {
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
        Ok(Rc::new(ExplicitTexture {
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
            shared.native.upload_buffer(id, 0, data)?;
        }
        drop(shared);
        Ok(Rc::new(ExplicitBuffer {
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
        Ok(Rc::new(ExplicitShader {
            blob,
            kind: ShaderKind::Compute,
            group_size: thread_group_size,
            name: desc.name.to_string(),
            state: RefCell::new(PipelineState::new()),
        }))
    }

    fn create_quad_shader(&self, desc: &ShaderDesc<'_>) -> Result<Rc<dyn Shader>, GpuError> {
        let blob = assemble_shader(desc, ShaderKind::Quad)?;
        Ok(Rc::new(ExplicitShader {
            blob,
            kind: ShaderKind::Quad,
            group_size: [1, 1, 1],
            name: desc.name.to_string(),
            state: RefCell::new(PipelineState::new()),
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
        shared.native.upload_buffer(vertex_buffer, 0, vertex_bytes)?;
        let index_buffer = shared.native.create_buffer(index_bytes.len());
        shared.native.upload_buffer(index_buffer, 0, index_bytes)?;
        Ok(Rc::new(ExplicitMesh {
            vertex_buffer,
            index_buffer,
            stride: std::mem::size_of::<MeshVertex>() as u32,
            index_count: indices.len() as u32,
        }))
    }

    fn create_timer(&self) -> Result<Rc<dyn GpuTimer>, GpuError> {
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        if shared.timer_cursor + 2 > QUERY_SLOTS {
            return Err(GpuError::HeapExhausted {
                kind: "timestamp query",
                capacity: QUERY_SLOTS,
            });
        }
        let first_slot = shared.timer_cursor;
        shared.timer_cursor += 2;
        Ok(Rc::new(ExplicitTimer {
            shared: self.shared.clone(),
            first_slot,
            stop_eof: Cell::new(None),
            consumed: Cell::new(true),
        }))
    }

    fn set_shader(&self, shader: &Rc<dyn Shader>) -> Result<(), GpuError> {
        let concrete: &ExplicitShader = shader.as_any().downcast_ref().ok_or_else(mismatch)?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.clear_bindings();
        shared.current = Some(shader.clone());
        debug!(name = %concrete.name, "explicit: shader bound");
        Ok(())
    }

    fn set_shader_input(&self, slot: u32, view: &TextureView) -> Result<(), GpuError> {
        let (heap, index) = expect_view(view, ViewKind::ShaderInput)?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        let shader = current_shader(&shared)?;
        let source = BindingSource::Descriptor { heap, index };
        record_or_issue(&mut shared, &shader, BindKind::Input, slot, source)?;
        shared.bind.input_hwm = shared.bind.input_hwm.max(slot + 1);
        Ok(())
    }

    fn set_shader_output(&self, slot: u32, view: &TextureView) -> Result<(), GpuError> {
        let (heap, index) = expect_view(view, ViewKind::ComputeOutput)?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        let shader = current_shader(&shared)?;
        let source = BindingSource::Descriptor { heap, index };
        record_or_issue(&mut shared, &shader, BindKind::Output, slot, source)?;
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
        let source = BindingSource::Buffer(buffer.id);
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        let shader = current_shader(&shared)?;
        record_or_issue(&mut shared, &shader, BindKind::Constant, slot, source)?;
        shared.bind.constant_hwm = shared.bind.constant_hwm.max(slot + 1);
        Ok(())
    }

    fn dispatch_shader_opts(&self, clear_bindings: bool) -> Result<(), GpuError> {
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        let shader_rc = current_shader(&shared)?;
        let shader: &ExplicitShader = shader_rc.as_any().downcast_ref().ok_or_else(mismatch)?;

        let mut state = shader.state.borrow_mut();
        match &*state {
            PipelineState::Unresolved(accumulator) => {
                let kind = match shader.kind {
                    ShaderKind::Compute => PipelineKind::Compute,
                    ShaderKind::Quad => PipelineKind::Quad,
                };
                let pipeline = shared.native.create_pipeline(&PipelineDesc {
                    kind,
                    bytecode: Some(&shader.blob),
                    layout: accumulator.layout(),
                    group_size: shader.group_size,
                })?;
                shared.stats.pipelines_resolved += 1;
                debug!(name = %shader.name, id = pipeline.0, "explicit: pipeline resolved");
                let list = shared.ring.active_mut();
                list.set_pipeline(pipeline);
                for bind in accumulator.recorded() {
                    list.set_binding(bind.kind, bind.slot, Some(bind.source));
                }
                *state = PipelineState::Resolved(ResolvedPipeline { pipeline });
            }
            PipelineState::Resolved(resolved) => {
                let pipeline = resolved.pipeline;
                shared.ring.active_mut().set_pipeline(pipeline);
            }
        }
        drop(state);

        match shader.kind {
            ShaderKind::Compute => {
                let (width, height) =
                    shared.bind.output0_extent.ok_or_else(|| GpuError::Capability {
                        message: "compute dispatch requires an output bound at slot 0".into(),
                    })?;
                let groups = [
                    ceil_div(width, shader.group_size[0]),
                    ceil_div(height, shader.group_size[1]),
                    1,
                ];
                shared.ring.active_mut().dispatch(groups);
            }
            ShaderKind::Quad => shared.ring.active_mut().draw_quad(),
        }
        shared.stats.dispatches += 1;
        if clear_bindings {
            shared.clear_bindings();
        }
        Ok(())
    }

    fn set_render_target(
        &self,
        color: Option<&TextureView>,
        depth: Option<&TextureView>,
    ) -> Result<(), GpuError> {
        let color_loc = color
            .map(|view| expect_view(view, ViewKind::RenderTarget))
            .transpose()?;
        let depth_loc = depth
            .map(|view| expect_view(view, ViewKind::DepthStencil))
            .transpose()?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.ring.active_mut().set_render_target(color_loc, depth_loc);
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
        let (heap, index) = expect_view(view, ViewKind::RenderTarget)?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.ring.active_mut().clear_render_target(heap, index, color);
        Ok(())
    }

    fn draw_mesh(&self, mesh: &Rc<dyn Mesh>) -> Result<(), GpuError> {
        let mesh: &ExplicitMesh = mesh.as_any().downcast_ref().ok_or_else(mismatch)?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        let pipeline = match shared.mesh_pipeline {
            Some(pipeline) => pipeline,
            None => {
                let pipeline = shared.native.create_pipeline(&PipelineDesc {
                    kind: PipelineKind::Mesh,
                    bytecode: None,
                    layout: &[],
                    group_size: [1, 1, 1],
                })?;
                debug!(id = pipeline.0, "explicit: overlay pipeline created");
                shared.mesh_pipeline = Some(pipeline);
                pipeline
            }
        };
        let list = shared.ring.active_mut();
        list.set_pipeline(pipeline);
        list.draw_mesh(
            mesh.vertex_buffer,
            mesh.stride,
            mesh.index_buffer,
            mesh.index_count,
        );
        Ok(())
    }

    fn copy_texture(
        &self,
        src: &Rc<dyn Texture>,
        dst: &Rc<dyn Texture>,
    ) -> Result<(), GpuError> {
        let src = downcast_texture(src)?;
        let dst = downcast_texture(dst)?;
        if src.desc.width != dst.desc.width
            || src.desc.height != dst.desc.height
            || src.desc.format != dst.desc.format
        {
            return Err(GpuError::Capability {
                message: "copy between textures of different size or format".into(),
            });
        }
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.ring.active_mut().copy_image(src.image, dst.image);
        drop(shared);
        self.hooks.emit_texture_copied();
        Ok(())
    }

    fn save_context(&self) -> Result<(), GpuError> {
        // No implicit native state exists on this backend; pairing is still
        // tracked so the shadow state resets at the same points.
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.save_depth += 1;
        Ok(())
    }

    fn restore_context(&self) -> Result<(), GpuError> {
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        if shared.save_depth == 0 {
            return Err(GpuError::Capability {
                message: "restore_context without a matching save_context".into(),
            });
        }
        shared.save_depth -= 1;
        shared.clear_bindings();
        shared.current = None;
        Ok(())
    }

    fn flush(&self, blocking: bool, end_of_frame: bool) -> Result<(), GpuError> {
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.flush(blocking, end_of_frame)
    }

    fn read_texture(
        &self,
        texture: &Rc<dyn Texture>,
        slice: u32,
    ) -> Result<Vec<u8>, GpuError> {
        let texture = downcast_texture(texture)?;
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        // Recorded work may still target this texture; submit it first.
        shared.flush(true, false)?;
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
        debug!("explicit: device shut down");
    }
}

fn current_shader(shared: &ExplicitShared) -> Result<Rc<dyn Shader>, GpuError> {
    shared.current.clone().ok_or_else(|| GpuError::Capability {
        message: "binding or dispatch with no shader set".into(),
    })
}

/// Route a binding: unresolved shaders accumulate, resolved shaders issue
/// straight into the active command list.
fn record_or_issue(
    shared: &mut ExplicitShared,
    shader: &Rc<dyn Shader>,
    kind: BindKind,
    slot: u32,
    source: BindingSource,
) -> Result<(), GpuError> {
    let shader: &ExplicitShader = shader.as_any().downcast_ref().ok_or_else(mismatch)?;
    match &mut *shader.state.borrow_mut() {
        PipelineState::Unresolved(accumulator) => accumulator.record(kind, slot, source),
        PipelineState::Resolved(_) => {
            shared.ring.active_mut().set_binding(kind, slot, Some(source));
        }
    }
    Ok(())
}

struct ExplicitTexture {
    shared: Rc<RefCell<ExplicitShared>>,
    image: ModernImageId,
    desc: TextureDesc,
    views: ViewCache,
}

impl Texture for ExplicitTexture {
    fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    fn view_for_slice(&self, kind: ViewKind, slice: u32) -> Result<TextureView, GpuError> {
        // Capability check comes first so an unsupported request never
        // consumes a descriptor slot.
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
        let descriptor = match kind {
            ViewKind::ShaderInput => Descriptor::ShaderResource {
                image: self.image,
                layer: slice,
            },
            ViewKind::ComputeOutput => Descriptor::Storage {
                image: self.image,
                layer: slice,
            },
            ViewKind::RenderTarget => Descriptor::RenderTarget {
                image: self.image,
                layer: slice,
            },
            ViewKind::DepthStencil => Descriptor::DepthStencil {
                image: self.image,
                layer: slice,
            },
        };
        let allocator = match kind {
            ViewKind::ShaderInput | ViewKind::ComputeOutput => &mut shared.heaps.resource,
            ViewKind::RenderTarget => &mut shared.heaps.render_target,
            ViewKind::DepthStencil => &mut shared.heaps.depth_stencil,
        };
        let index = allocator.allocate()?;
        let heap = allocator.heap();
        shared.native.write_descriptor(heap, index, descriptor)?;
        shared.stats.descriptors_allocated += 1;
        drop(shared);
        let view = TextureView {
            backend: BackendKind::Explicit,
            kind,
            width: self.desc.width,
            height: self.desc.height,
            data: ViewData::Modern { heap, index },
        };
        self.views.insert(kind, slice, view.clone());
        Ok(view)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ExplicitBuffer {
    shared: Rc<RefCell<ExplicitShared>>,
    id: ModernBufferId,
    len: usize,
    immutable: bool,
}

impl ConstantBuffer for ExplicitBuffer {
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
        shared.native.upload_buffer(self.id, 0, data)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ExplicitShader {
    blob: Vec<u8>,
    kind: ShaderKind,
    group_size: [u32; 3],
    name: String,
    state: RefCell<PipelineState>,
}

impl Shader for ExplicitShader {
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

struct ExplicitMesh {
    vertex_buffer: ModernBufferId,
    index_buffer: ModernBufferId,
    stride: u32,
    index_count: u32,
}

impl Mesh for ExplicitMesh {
    fn index_count(&self) -> u32 {
        self.index_count
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ExplicitTimer {
    shared: Rc<RefCell<ExplicitShared>>,
    /// Start slot in the query heap; the stop slot is `first_slot + 1`.
    first_slot: u32,
    /// End-of-frame flush count at `stop` time.
    stop_eof: Cell<Option<u64>>,
    consumed: Cell<bool>,
}

impl GpuTimer for ExplicitTimer {
    fn start(&self) -> Result<(), GpuError> {
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.ring.active_mut().write_timestamp(self.first_slot);
        self.stop_eof.set(None);
        self.consumed.set(false);
        Ok(())
    }

    fn stop(&self) -> Result<(), GpuError> {
        let mut shared = self.shared.borrow_mut();
        shared.ensure_live()?;
        shared.ring.active_mut().write_timestamp(self.first_slot + 1);
        self.stop_eof.set(Some(shared.eof_flushes));
        Ok(())
    }

    fn query_opts(&self, reset: bool) -> f64 {
        if self.consumed.get() {
            return 0.0;
        }
        let Some(stop_eof) = self.stop_eof.get() else {
            return 0.0;
        };
        let shared = self.shared.borrow();
        if shared.eof_flushes < stop_eof + TIMER_RESOLVE_LATENCY {
            return 0.0;
        }
        let (Ok(start), Ok(stop)) = (
            shared.native.read_resolved_timestamp(self.first_slot),
            shared.native.read_resolved_timestamp(self.first_slot + 1),
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

    fn device() -> ExplicitDevice {
        ExplicitDevice::new(ModernDevice::new()).unwrap()
    }

    #[test]
    fn capability_rejection_does_not_touch_the_heap() {
        let dev = device();
        let desc = TextureDesc::new(8, 8, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED);
        let texture = dev.create_texture(&desc, None).unwrap();
        assert!(matches!(
            texture.view(ViewKind::RenderTarget),
            Err(GpuError::Capability { .. })
        ));
        assert_eq!(dev.stats().descriptors_allocated, 0);
    }

    #[test]
    fn views_are_cached_per_kind_and_slice() {
        let dev = device();
        let desc = TextureDesc::new(
            8,
            8,
            TextureFormat::Rgba8Unorm,
            TextureUsage::SAMPLED | TextureUsage::UNORDERED_ACCESS,
        );
        let texture = dev.create_texture(&desc, None).unwrap();
        texture.view(ViewKind::ShaderInput).unwrap();
        texture.view(ViewKind::ShaderInput).unwrap();
        texture.view(ViewKind::ComputeOutput).unwrap();
        assert_eq!(dev.stats().descriptors_allocated, 2);
    }

    #[test]
    fn binding_before_set_shader_is_rejected() {
        let dev = device();
        let desc = TextureDesc::new(8, 8, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED);
        let texture = dev.create_texture(&desc, None).unwrap();
        let view = texture.view(ViewKind::ShaderInput).unwrap();
        assert!(matches!(
            dev.set_shader_input(0, &view),
            Err(GpuError::Capability { .. })
        ));
    }

    #[test]
    fn timer_reads_zero_before_the_resolve_latency_elapses() {
        let dev = device();
        let timer = dev.create_timer().unwrap();
        timer.start().unwrap();
        timer.stop().unwrap();
        assert_eq!(timer.query_opts(false), 0.0);
        dev.flush(true, true).unwrap();
        assert_eq!(timer.query_opts(false), 0.0);
        dev.flush(true, true).unwrap();
        assert!(timer.query_opts(false) > 0.0);
    }

    fn host_image(dev: &ExplicitDevice, bind: BindFlags) -> ModernImageId {
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
        let desc = TextureDesc::new(
            4,
            4,
            TextureFormat::Rgba8Unorm,
            TextureUsage::SAMPLED | TextureUsage::TRANSFER,
        );
        let imported = dev
            .import_texture(ImportedTexture::Modern { image, desc })
            .unwrap();

        let data: Vec<u8> = (0..64).map(|i| i as u8).collect();
        let src = dev
            .create_texture(
                &TextureDesc::new(4, 4, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED),
                Some(&data),
            )
            .unwrap();
        dev.copy_texture(&src, &imported).unwrap();
        assert_eq!(dev.read_texture(&imported, 0).unwrap(), data);
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
            dev.import_texture(ImportedTexture::Modern { image, desc }),
            Err(GpuError::Capability { .. })
        ));
    }
}
