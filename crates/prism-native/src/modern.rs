//! The modern explicit-mode device surface.
//!
//! Nothing executes at call time: work is recorded into a [`CommandList`]
//! and runs at [`ModernDevice::submit`]. Views live in fixed-capacity
//! descriptor heaps written via [`ModernDevice::write_descriptor`], pipelines
//! are immutable objects built from bytecode plus an ordered binding layout,
//! and synchronization is a single monotonic timeline fence.

use std::collections::HashMap;

use tracing::debug;

use crate::error::NativeError;
use crate::exec::{self, KernelIo, SurfaceRef};
use crate::resource::{BufferStorage, Image, ImageDesc};

/// Number of timestamp slots in the device query heap.
pub const QUERY_SLOTS: u32 = 256;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ModernImageId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ModernBufferId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ModernPipelineId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HeapId(pub u32);

/// Descriptor heap categories. Each heap stores only its own category
/// (shader-visible resource descriptors cover both inputs and outputs).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    RenderTarget,
    DepthStencil,
    Resource,
    Sampler,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SamplerFilter {
    Nearest,
    Linear,
}

/// A single descriptor-heap entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Descriptor {
    ShaderResource { image: ModernImageId, layer: u32 },
    Storage { image: ModernImageId, layer: u32 },
    RenderTarget { image: ModernImageId, layer: u32 },
    DepthStencil { image: ModernImageId, layer: u32 },
    Sampler { filter: SamplerFilter },
}

impl Descriptor {
    fn heap_kind(&self) -> DescriptorHeapKind {
        match self {
            Descriptor::ShaderResource { .. } | Descriptor::Storage { .. } => {
                DescriptorHeapKind::Resource
            }
            Descriptor::RenderTarget { .. } => DescriptorHeapKind::RenderTarget,
            Descriptor::DepthStencil { .. } => DescriptorHeapKind::DepthStencil,
            Descriptor::Sampler { .. } => DescriptorHeapKind::Sampler,
        }
    }
}

/// Binding categories in a pipeline layout.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BindKind {
    Input,
    Output,
    Constant,
}

/// One (category, slot) entry of a pipeline's binding layout.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LayoutEntry {
    pub kind: BindKind,
    pub slot: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PipelineKind {
    Compute,
    Quad,
    /// Fixed-function overlay pipeline; carries no bytecode.
    Mesh,
}

/// Creation parameters for an immutable pipeline object.
#[derive(Debug, Clone)]
pub struct PipelineDesc<'a> {
    pub kind: PipelineKind,
    pub bytecode: Option<&'a [u8]>,
    pub layout: &'a [LayoutEntry],
    /// Thread-group extent; meaningful for compute pipelines only.
    pub group_size: [u32; 3],
}

#[derive(Debug)]
struct PipelineObject {
    kind: PipelineKind,
    program: Option<prism_shade::Program>,
    layout: Vec<LayoutEntry>,
    group_size: [u32; 3],
}

/// Where a binding slot points.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BindingSource {
    Descriptor { heap: HeapId, index: u32 },
    Buffer(ModernBufferId),
}

#[derive(Debug, Clone)]
enum Cmd {
    SetPipeline(ModernPipelineId),
    SetBinding {
        kind: BindKind,
        slot: u32,
        source: Option<BindingSource>,
    },
    SetRenderTarget {
        color: Option<(HeapId, u32)>,
        depth: Option<(HeapId, u32)>,
    },
    ClearRenderTarget {
        heap: HeapId,
        index: u32,
        color: [f32; 4],
    },
    Dispatch {
        groups: [u32; 3],
    },
    DrawQuad,
    DrawMesh {
        vertex_buffer: ModernBufferId,
        stride: u32,
        index_buffer: ModernBufferId,
        index_count: u32,
    },
    CopyImage {
        src: ModernImageId,
        dst: ModernImageId,
    },
    CopyBufferToImage {
        src: ModernBufferId,
        dst: ModernImageId,
        layer: u32,
        mip: u32,
    },
    WriteTimestamp {
        index: u32,
    },
    ResolveTimestamps {
        first: u32,
        count: u32,
    },
}

/// A recorded command sequence. Lists start open, must be closed before
/// submission, and are recycled with [`CommandList::reset`].
#[derive(Debug, Default)]
pub struct CommandList {
    cmds: Vec<Cmd>,
    closed: bool,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn reset(&mut self) {
        self.cmds.clear();
        self.closed = false;
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    pub fn set_pipeline(&mut self, pipeline: ModernPipelineId) {
        self.cmds.push(Cmd::SetPipeline(pipeline));
    }

    pub fn set_binding(&mut self, kind: BindKind, slot: u32, source: Option<BindingSource>) {
        self.cmds.push(Cmd::SetBinding { kind, slot, source });
    }

    pub fn set_render_target(
        &mut self,
        color: Option<(HeapId, u32)>,
        depth: Option<(HeapId, u32)>,
    ) {
        self.cmds.push(Cmd::SetRenderTarget { color, depth });
    }

    pub fn clear_render_target(&mut self, heap: HeapId, index: u32, color: [f32; 4]) {
        self.cmds.push(Cmd::ClearRenderTarget { heap, index, color });
    }

    pub fn dispatch(&mut self, groups: [u32; 3]) {
        self.cmds.push(Cmd::Dispatch { groups });
    }

    pub fn draw_quad(&mut self) {
        self.cmds.push(Cmd::DrawQuad);
    }

    pub fn draw_mesh(
        &mut self,
        vertex_buffer: ModernBufferId,
        stride: u32,
        index_buffer: ModernBufferId,
        index_count: u32,
    ) {
        self.cmds.push(Cmd::DrawMesh {
            vertex_buffer,
            stride,
            index_buffer,
            index_count,
        });
    }

    pub fn copy_image(&mut self, src: ModernImageId, dst: ModernImageId) {
        self.cmds.push(Cmd::CopyImage { src, dst });
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: ModernBufferId,
        dst: ModernImageId,
        layer: u32,
        mip: u32,
    ) {
        self.cmds.push(Cmd::CopyBufferToImage { src, dst, layer, mip });
    }

    pub fn write_timestamp(&mut self, index: u32) {
        self.cmds.push(Cmd::WriteTimestamp { index });
    }

    pub fn resolve_timestamps(&mut self, first: u32, count: u32) {
        self.cmds.push(Cmd::ResolveTimestamps { first, count });
    }
}

struct Heap {
    kind: DescriptorHeapKind,
    slots: Vec<Option<Descriptor>>,
}

/// Per-submission execution state; lists start with a clean slate.
#[derive(Default)]
struct ExecState {
    pipeline: Option<ModernPipelineId>,
    bindings: HashMap<(BindKind, u32), BindingSource>,
    render_target: Option<(HeapId, u32)>,
    depth_target: Option<(HeapId, u32)>,
}

/// An explicit-mode native device.
#[derive(Default)]
pub struct ModernDevice {
    images: Vec<Image>,
    buffers: Vec<BufferStorage>,
    heaps: Vec<Heap>,
    pipelines: Vec<PipelineObject>,
    query_values: Vec<u64>,
    resolve_buffer: Vec<u64>,
    fence_completed: u64,
    clock: u64,
}

impl ModernDevice {
    pub fn new() -> Self {
        Self {
            query_values: vec![0; QUERY_SLOTS as usize],
            resolve_buffer: vec![0; QUERY_SLOTS as usize],
            ..Self::default()
        }
    }

    // --- resources ---------------------------------------------------------

    pub fn create_image(&mut self, desc: ImageDesc) -> Result<ModernImageId, NativeError> {
        let image = Image::new(desc)?;
        let id = ModernImageId(self.images.len() as u32);
        debug!(?desc, id = id.0, "modern: created image");
        self.images.push(image);
        Ok(id)
    }

    pub fn image_desc(&self, id: ModernImageId) -> Result<&ImageDesc, NativeError> {
        Ok(&self.image(id)?.desc)
    }

    /// CPU-side readback. The caller is responsible for having synchronized
    /// with the fence first.
    pub fn read_image(
        &self,
        id: ModernImageId,
        layer: u32,
        mip: u32,
    ) -> Result<Vec<u8>, NativeError> {
        self.image(id)?.read(layer, mip)
    }

    pub fn create_buffer(&mut self, len: usize) -> ModernBufferId {
        let id = ModernBufferId(self.buffers.len() as u32);
        self.buffers.push(BufferStorage::new(len));
        id
    }

    /// CPU-side staging write; visible to subsequently submitted commands.
    pub fn upload_buffer(
        &mut self,
        id: ModernBufferId,
        offset: usize,
        data: &[u8],
    ) -> Result<(), NativeError> {
        self.buffer(id)?.write(offset, data)
    }

    pub fn read_buffer(&self, id: ModernBufferId) -> Result<Vec<u8>, NativeError> {
        Ok(self.buffer(id)?.bytes.borrow().clone())
    }

    // --- descriptor heaps --------------------------------------------------

    pub fn create_descriptor_heap(
        &mut self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> HeapId {
        let id = HeapId(self.heaps.len() as u32);
        debug!(?kind, capacity, id = id.0, "modern: created descriptor heap");
        self.heaps.push(Heap {
            kind,
            slots: vec![None; capacity as usize],
        });
        id
    }

    pub fn write_descriptor(
        &mut self,
        heap: HeapId,
        index: u32,
        descriptor: Descriptor,
    ) -> Result<(), NativeError> {
        match &descriptor {
            Descriptor::ShaderResource { image, layer }
            | Descriptor::Storage { image, layer }
            | Descriptor::RenderTarget { image, layer }
            | Descriptor::DepthStencil { image, layer } => {
                let img = self.image(*image)?;
                if *layer >= img.desc.array_layers {
                    return Err(NativeError::Validation(format!(
                        "descriptor layer {layer} out of range"
                    )));
                }
            }
            Descriptor::Sampler { .. } => {}
        }
        let heap = self.heap_mut(heap)?;
        if heap.kind != descriptor.heap_kind() {
            return Err(NativeError::Validation(format!(
                "{:?} descriptor written to {:?} heap",
                descriptor.heap_kind(),
                heap.kind
            )));
        }
        let capacity = heap.slots.len() as u32;
        let slot = heap
            .slots
            .get_mut(index as usize)
            .ok_or(NativeError::DescriptorOutOfRange { index, capacity })?;
        *slot = Some(descriptor);
        Ok(())
    }

    // --- pipelines ---------------------------------------------------------

    pub fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> Result<ModernPipelineId, NativeError> {
        let program = match (desc.kind, desc.bytecode) {
            (PipelineKind::Mesh, None) => None,
            (PipelineKind::Mesh, Some(_)) => {
                return Err(NativeError::Validation(
                    "mesh pipelines are fixed-function and take no bytecode".into(),
                ))
            }
            (_, None) => {
                return Err(NativeError::Validation(format!(
                    "{:?} pipeline requires bytecode",
                    desc.kind
                )))
            }
            (kind, Some(blob)) => {
                let program = prism_shade::decode(blob)?;
                let expected = match kind {
                    PipelineKind::Compute => prism_shade::KernelStage::Compute,
                    PipelineKind::Quad => prism_shade::KernelStage::Quad,
                    PipelineKind::Mesh => unreachable!(),
                };
                if program.stage != expected {
                    return Err(NativeError::Validation(format!(
                        "kernel '{}' targets {:?}, pipeline is {:?}",
                        program.entry, program.stage, kind
                    )));
                }
                Some(program)
            }
        };
        if desc.kind == PipelineKind::Compute && desc.group_size.contains(&0) {
            return Err(NativeError::Validation(format!(
                "compute pipeline group size {:?} contains zero",
                desc.group_size
            )));
        }

        let id = ModernPipelineId(self.pipelines.len() as u32);
        debug!(kind = ?desc.kind, id = id.0, "modern: created pipeline");
        self.pipelines.push(PipelineObject {
            kind: desc.kind,
            program,
            layout: desc.layout.to_vec(),
            group_size: desc.group_size,
        });
        Ok(id)
    }

    // --- submission and synchronization ------------------------------------

    /// Execute a closed command list and advance the fence to `signal`.
    ///
    /// The engine completes work synchronously, so the fence is observable as
    /// completed when `submit` returns; callers still treat
    /// [`wait_fence`](Self::wait_fence) as the synchronization point.
    pub fn submit(&mut self, list: &CommandList, signal: u64) -> Result<(), NativeError> {
        if !list.closed {
            return Err(NativeError::Validation(
                "submit of a command list that was not closed".into(),
            ));
        }
        let mut state = ExecState::default();
        for cmd in &list.cmds {
            self.execute(cmd, &mut state)?;
            self.clock += 1;
        }
        if signal > self.fence_completed {
            self.fence_completed = signal;
        }
        debug!(signal, cmds = list.cmds.len(), "modern: submitted command list");
        Ok(())
    }

    pub fn fence_completed(&self) -> u64 {
        self.fence_completed
    }

    /// Block until the fence reaches `value`. A wait on a value that was
    /// never signaled models a stuck GPU and is surfaced as an error rather
    /// than deadlocking.
    pub fn wait_fence(&self, value: u64) -> Result<(), NativeError> {
        if value > self.fence_completed {
            return Err(NativeError::WaitUnsignaled {
                value,
                completed: self.fence_completed,
            });
        }
        Ok(())
    }

    /// CPU read of the query resolve buffer.
    pub fn read_resolved_timestamp(&self, index: u32) -> Result<u64, NativeError> {
        self.resolve_buffer
            .get(index as usize)
            .copied()
            .ok_or(NativeError::DescriptorOutOfRange {
                index,
                capacity: QUERY_SLOTS,
            })
    }

    // --- command execution -------------------------------------------------

    fn execute(&mut self, cmd: &Cmd, state: &mut ExecState) -> Result<(), NativeError> {
        match *cmd {
            Cmd::SetPipeline(id) => {
                self.pipeline(id)?;
                state.pipeline = Some(id);
            }
            Cmd::SetBinding { kind, slot, source } => match source {
                Some(source) => {
                    state.bindings.insert((kind, slot), source);
                }
                None => {
                    state.bindings.remove(&(kind, slot));
                }
            },
            Cmd::SetRenderTarget { color, depth } => {
                if let Some((heap, index)) = color {
                    self.expect_descriptor(heap, index, DescriptorHeapKind::RenderTarget)?;
                }
                if let Some((heap, index)) = depth {
                    self.expect_descriptor(heap, index, DescriptorHeapKind::DepthStencil)?;
                }
                state.render_target = color;
                state.depth_target = depth;
            }
            Cmd::ClearRenderTarget { heap, index, color } => {
                let descriptor = self.expect_descriptor(heap, index, DescriptorHeapKind::RenderTarget)?;
                let surface = self.descriptor_surface(descriptor)?;
                exec::clear_surface(&surface, color);
            }
            Cmd::Dispatch { groups } => {
                let pipeline = self.bound_pipeline(state, PipelineKind::Compute)?;
                check_layout(pipeline, state, false)?;
                let program = pipeline.program.clone().ok_or_else(|| {
                    NativeError::Validation("compute pipeline carries no program".into())
                })?;
                let group_size = pipeline.group_size;
                let io = self.bindings_io(state, None)?;
                let width = groups[0].saturating_mul(group_size[0]);
                let height = groups[1].saturating_mul(group_size[1]);
                exec::run_kernel(&program, &io, width, height)?;
            }
            Cmd::DrawQuad => {
                let pipeline = self.bound_pipeline(state, PipelineKind::Quad)?;
                check_layout(pipeline, state, true)?;
                let program = pipeline.program.clone().ok_or_else(|| {
                    NativeError::Validation("quad pipeline carries no program".into())
                })?;
                let target = self.bound_render_target(state)?;
                let (width, height) = (target.width, target.height);
                let io = self.bindings_io(state, Some(target))?;
                exec::run_kernel(&program, &io, width, height)?;
            }
            Cmd::DrawMesh {
                vertex_buffer,
                stride,
                index_buffer,
                index_count,
            } => {
                self.bound_pipeline(state, PipelineKind::Mesh)?;
                let target = self.bound_render_target(state)?;
                let vertices = self.buffer(vertex_buffer)?.bytes.borrow().clone();
                let index_bytes = self.buffer(index_buffer)?.bytes.borrow().clone();
                let needed = index_count as usize * 2;
                let slice = index_bytes.get(..needed).ok_or_else(|| {
                    NativeError::Validation(format!(
                        "index buffer of {} bytes cannot hold {index_count} 16-bit indices",
                        index_bytes.len()
                    ))
                })?;
                let indices: Vec<u16> = slice
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                exec::draw_mesh(&target, &vertices, stride, &indices)?;
            }
            Cmd::CopyImage { src, dst } => {
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
                        exec::copy_surface(
                            &surface_of(src_img, layer, mip)?,
                            &surface_of(dst_img, layer, mip)?,
                        )?;
                    }
                }
            }
            Cmd::CopyBufferToImage { src, dst, layer, mip } => {
                let data = self.buffer(src)?.bytes.borrow().clone();
                let image = self.image(dst)?;
                let len = image.desc.subresource_len(mip);
                let slice = data.get(..len).ok_or_else(|| {
                    NativeError::Validation(format!(
                        "staging buffer of {} bytes cannot fill subresource of {len}",
                        data.len()
                    ))
                })?;
                image.write(layer, mip, slice)?;
            }
            Cmd::WriteTimestamp { index } => {
                let capacity = QUERY_SLOTS;
                let slot = self
                    .query_values
                    .get_mut(index as usize)
                    .ok_or(NativeError::DescriptorOutOfRange { index, capacity })?;
                *slot = self.clock;
            }
            Cmd::ResolveTimestamps { first, count } => {
                let first = first as usize;
                let end = first.checked_add(count as usize).filter(|&end| {
                    end <= self.query_values.len()
                });
                let end = end.ok_or(NativeError::DescriptorOutOfRange {
                    index: first as u32 + count,
                    capacity: QUERY_SLOTS,
                })?;
                self.resolve_buffer[first..end].copy_from_slice(&self.query_values[first..end]);
            }
        }
        Ok(())
    }

    // --- lookups -----------------------------------------------------------

    fn image(&self, id: ModernImageId) -> Result<&Image, NativeError> {
        self.images.get(id.0 as usize).ok_or(NativeError::InvalidHandle {
            what: "image",
            id: id.0,
        })
    }

    fn buffer(&self, id: ModernBufferId) -> Result<&BufferStorage, NativeError> {
        self.buffers
            .get(id.0 as usize)
            .ok_or(NativeError::InvalidHandle {
                what: "buffer",
                id: id.0,
            })
    }

    fn heap(&self, id: HeapId) -> Result<&Heap, NativeError> {
        self.heaps.get(id.0 as usize).ok_or(NativeError::InvalidHandle {
            what: "descriptor heap",
            id: id.0,
        })
    }

    fn heap_mut(&mut self, id: HeapId) -> Result<&mut Heap, NativeError> {
        self.heaps
            .get_mut(id.0 as usize)
            .ok_or(NativeError::InvalidHandle {
                what: "descriptor heap",
                id: id.0,
            })
    }

    fn pipeline(&self, id: ModernPipelineId) -> Result<&PipelineObject, NativeError> {
        self.pipelines
            .get(id.0 as usize)
            .ok_or(NativeError::InvalidHandle {
                what: "pipeline",
                id: id.0,
            })
    }

    fn bound_pipeline(
        &self,
        state: &ExecState,
        expected: PipelineKind,
    ) -> Result<&PipelineObject, NativeError> {
        let id = state.pipeline.ok_or_else(|| {
            NativeError::Validation("draw/dispatch with no pipeline bound".into())
        })?;
        let pipeline = self.pipeline(id)?;
        if pipeline.kind != expected {
            return Err(NativeError::Validation(format!(
                "bound pipeline is {:?}, command needs {:?}",
                pipeline.kind, expected
            )));
        }
        Ok(pipeline)
    }

    fn descriptor(&self, heap: HeapId, index: u32) -> Result<Descriptor, NativeError> {
        let heap = self.heap(heap)?;
        let capacity = heap.slots.len() as u32;
        heap.slots
            .get(index as usize)
            .copied()
            .ok_or(NativeError::DescriptorOutOfRange { index, capacity })?
            .ok_or_else(|| {
                NativeError::Validation(format!("descriptor slot {index} was never written"))
            })
    }

    fn expect_descriptor(
        &self,
        heap: HeapId,
        index: u32,
        kind: DescriptorHeapKind,
    ) -> Result<Descriptor, NativeError> {
        let descriptor = self.descriptor(heap, index)?;
        if descriptor.heap_kind() != kind {
            return Err(NativeError::Validation(format!(
                "descriptor at slot {index} is {:?}, expected {kind:?}",
                descriptor.heap_kind()
            )));
        }
        Ok(descriptor)
    }

    fn descriptor_surface(&self, descriptor: Descriptor) -> Result<SurfaceRef, NativeError> {
        match descriptor {
            Descriptor::ShaderResource { image, layer }
            | Descriptor::Storage { image, layer }
            | Descriptor::RenderTarget { image, layer }
            | Descriptor::DepthStencil { image, layer } => {
                surface_of(self.image(image)?, layer, 0)
            }
            Descriptor::Sampler { .. } => Err(NativeError::Validation(
                "sampler descriptor where an image view was expected".into(),
            )),
        }
    }

    fn bound_render_target(&self, state: &ExecState) -> Result<SurfaceRef, NativeError> {
        let (heap, index) = state.render_target.ok_or_else(|| {
            NativeError::Validation("draw with no render target bound".into())
        })?;
        let descriptor = self.expect_descriptor(heap, index, DescriptorHeapKind::RenderTarget)?;
        self.descriptor_surface(descriptor)
    }

    /// Build engine bindings from recorded state; `quad_target` substitutes
    /// the render target as output slot 0 for quad draws.
    fn bindings_io(
        &self,
        state: &ExecState,
        quad_target: Option<SurfaceRef>,
    ) -> Result<KernelIo, NativeError> {
        let mut io = KernelIo::default();
        for (&(kind, slot), &source) in &state.bindings {
            match kind {
                BindKind::Input => {
                    let surface = self.binding_surface(source, false)?;
                    place(&mut io.inputs, slot, surface);
                }
                BindKind::Output => {
                    if quad_target.is_some() {
                        continue; // quad passes write the render target only
                    }
                    let surface = self.binding_surface(source, true)?;
                    place(&mut io.outputs, slot, surface);
                }
                BindKind::Constant => {
                    let BindingSource::Buffer(id) = source else {
                        return Err(NativeError::Validation(
                            "constant slot bound to a descriptor, expected a buffer".into(),
                        ));
                    };
                    place(&mut io.constants, slot, self.buffer(id)?.bytes.clone());
                }
            }
        }
        if let Some(target) = quad_target {
            place(&mut io.outputs, 0, target);
        }
        Ok(io)
    }

    fn binding_surface(
        &self,
        source: BindingSource,
        storage: bool,
    ) -> Result<SurfaceRef, NativeError> {
        let BindingSource::Descriptor { heap, index } = source else {
            return Err(NativeError::Validation(
                "image slot bound to a buffer, expected a descriptor".into(),
            ));
        };
        let descriptor = self.descriptor(heap, index)?;
        let ok = match descriptor {
            Descriptor::ShaderResource { .. } => !storage,
            Descriptor::Storage { .. } => storage,
            _ => false,
        };
        if !ok {
            return Err(NativeError::Validation(format!(
                "descriptor {descriptor:?} cannot be bound as {}",
                if storage { "an output" } else { "an input" }
            )));
        }
        self.descriptor_surface(descriptor)
    }
}

/// Every layout entry must have a live binding at draw/dispatch time. Quad
/// pipelines take their output from the bound render target instead.
fn check_layout(
    pipeline: &PipelineObject,
    state: &ExecState,
    quad: bool,
) -> Result<(), NativeError> {
    for entry in &pipeline.layout {
        if quad && entry.kind == BindKind::Output {
            continue;
        }
        if !state.bindings.contains_key(&(entry.kind, entry.slot)) {
            return Err(NativeError::Validation(format!(
                "pipeline layout {:?} slot {} has no binding",
                entry.kind, entry.slot
            )));
        }
    }
    Ok(())
}

fn place<T>(slots: &mut Vec<Option<T>>, index: u32, value: T) {
    let index = index as usize;
    if slots.len() <= index {
        slots.resize_with(index + 1, || None);
    }
    slots[index] = Some(value);
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
    fn nothing_executes_until_submit() {
        let mut dev = ModernDevice::new();
        let src = dev
            .create_image(rgba(4, 4, BindFlags::SHADER_RESOURCE | BindFlags::TRANSFER))
            .unwrap();
        let dst = dev
            .create_image(rgba(4, 4, BindFlags::STORAGE | BindFlags::TRANSFER))
            .unwrap();
        let staging = dev.create_buffer(64);
        dev.upload_buffer(staging, 0, &[0xCD; 64]).unwrap();

        let heap = dev.create_descriptor_heap(DescriptorHeapKind::Resource, 8);
        dev.write_descriptor(heap, 0, Descriptor::ShaderResource { image: src, layer: 0 })
            .unwrap();
        dev.write_descriptor(heap, 1, Descriptor::Storage { image: dst, layer: 0 })
            .unwrap();

        let layout = [
            LayoutEntry { kind: BindKind::Input, slot: 0 },
            LayoutEntry { kind: BindKind::Output, slot: 0 },
        ];
        let blob = copy_blob();
        let pipeline = dev
            .create_pipeline(&PipelineDesc {
                kind: PipelineKind::Compute,
                bytecode: Some(&blob),
                layout: &layout,
                group_size: [4, 4, 1],
            })
            .unwrap();

        let mut list = CommandList::new();
        list.copy_buffer_to_image(staging, src, 0, 0);
        list.set_pipeline(pipeline);
        list.set_binding(
            BindKind::Input,
            0,
            Some(BindingSource::Descriptor { heap, index: 0 }),
        );
        list.set_binding(
            BindKind::Output,
            0,
            Some(BindingSource::Descriptor { heap, index: 1 }),
        );
        list.dispatch([1, 1, 1]);

        // Not submitted yet: destination untouched.
        assert_eq!(dev.read_image(dst, 0, 0).unwrap(), vec![0u8; 64]);

        list.close();
        dev.submit(&list, 1).unwrap();
        assert_eq!(dev.read_image(dst, 0, 0).unwrap(), vec![0xCD; 64]);
        assert_eq!(dev.fence_completed(), 1);
    }

    #[test]
    fn submit_requires_a_closed_list() {
        let mut dev = ModernDevice::new();
        let list = CommandList::new();
        assert!(matches!(
            dev.submit(&list, 1),
            Err(NativeError::Validation(_))
        ));
    }

    #[test]
    fn wait_on_unsignaled_fence_is_an_error() {
        let dev = ModernDevice::new();
        assert!(matches!(
            dev.wait_fence(1),
            Err(NativeError::WaitUnsignaled { value: 1, completed: 0 })
        ));
    }

    #[test]
    fn descriptor_heap_rejects_wrong_category() {
        let mut dev = ModernDevice::new();
        let image = dev
            .create_image(rgba(4, 4, BindFlags::RENDER_TARGET))
            .unwrap();
        let heap = dev.create_descriptor_heap(DescriptorHeapKind::Resource, 4);
        assert!(dev
            .write_descriptor(heap, 0, Descriptor::RenderTarget { image, layer: 0 })
            .is_err());
    }

    #[test]
    fn timestamps_resolve_into_the_readback_buffer() {
        let mut dev = ModernDevice::new();
        let mut list = CommandList::new();
        list.write_timestamp(0);
        list.write_timestamp(1);
        list.resolve_timestamps(0, 2);
        list.close();
        dev.submit(&list, 1).unwrap();

        let start = dev.read_resolved_timestamp(0).unwrap();
        let stop = dev.read_resolved_timestamp(1).unwrap();
        assert!(stop > start);
    }
}
