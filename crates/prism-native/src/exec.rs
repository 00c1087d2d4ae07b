//! The deterministic execution engine behind both device surfaces: kernel
//! interpretation, the fixed-function overlay rasterizer, clears and copies.
//!
//! Correctness and determinism are the goals here, not throughput; the
//! compositor above only pushes full-screen passes and small overlay meshes
//! through this path.

use std::cell::RefCell;
use std::rc::Rc;

use prism_shade::{Opcode, Operand, Program};

use crate::error::NativeError;
use crate::format::{decode_texel, encode_texel, NativeFormat};
use crate::resource::SubresourceData;

/// A bound (layer, mip) surface handed to the engine.
#[derive(Clone)]
pub(crate) struct SurfaceRef {
    pub data: SubresourceData,
    pub width: u32,
    pub height: u32,
    pub format: NativeFormat,
}

impl SurfaceRef {
    fn texel_offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * self.format.bytes_per_texel() as usize
    }

    fn load(&self, x: u32, y: u32) -> [f32; 4] {
        let x = x.min(self.width - 1);
        let y = y.min(self.height - 1);
        let offset = self.texel_offset(x, y);
        let bytes = self.data.borrow();
        decode_texel(self.format, &bytes[offset..offset + self.format.bytes_per_texel() as usize])
    }

    fn store(&self, x: u32, y: u32, value: [f32; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let offset = self.texel_offset(x, y);
        let mut bytes = self.data.borrow_mut();
        let size = self.format.bytes_per_texel() as usize;
        encode_texel(self.format, value, &mut bytes[offset..offset + size]);
    }
}

/// Slot bindings for one kernel execution.
#[derive(Default)]
pub(crate) struct KernelIo {
    pub inputs: Vec<Option<SurfaceRef>>,
    pub outputs: Vec<Option<SurfaceRef>>,
    pub constants: Vec<Option<Rc<RefCell<Vec<u8>>>>>,
}

impl KernelIo {
    fn input(&self, slot: u8) -> Option<&SurfaceRef> {
        self.inputs.get(slot as usize).and_then(Option::as_ref)
    }

    fn output(&self, slot: u8) -> Option<&SurfaceRef> {
        self.outputs.get(slot as usize).and_then(Option::as_ref)
    }

    fn constant(&self, slot: u8) -> Option<&Rc<RefCell<Vec<u8>>>> {
        self.constants.get(slot as usize).and_then(Option::as_ref)
    }
}

/// Validate bindings against the program, then run it over a `width` x
/// `height` invocation grid.
pub(crate) fn run_kernel(
    program: &Program,
    io: &KernelIo,
    width: u32,
    height: u32,
) -> Result<(), NativeError> {
    validate_bindings(program, io)?;

    for y in 0..height {
        for x in 0..width {
            run_invocation(program, io, x, y);
        }
    }
    Ok(())
}

fn validate_bindings(program: &Program, io: &KernelIo) -> Result<(), NativeError> {
    for instr in &program.instrs {
        for operand in std::iter::once(instr.dst).chain(instr.src) {
            match operand {
                Operand::Input(slot) => {
                    let surface = io.input(slot).ok_or_else(|| {
                        NativeError::Validation(format!(
                            "kernel '{}' reads input slot t{slot} which is not bound",
                            program.entry
                        ))
                    })?;
                    for output in io.outputs.iter().flatten() {
                        if Rc::ptr_eq(&surface.data, &output.data) {
                            return Err(NativeError::Validation(format!(
                                "input slot t{slot} aliases a bound output"
                            )));
                        }
                    }
                }
                Operand::Output(slot) => {
                    io.output(slot).ok_or_else(|| {
                        NativeError::Validation(format!(
                            "kernel '{}' writes output slot u{slot} which is not bound",
                            program.entry
                        ))
                    })?;
                }
                Operand::Const { slot, elem } => {
                    let buffer = io.constant(slot).ok_or_else(|| {
                        NativeError::Validation(format!(
                            "kernel '{}' reads constant slot c{slot} which is not bound",
                            program.entry
                        ))
                    })?;
                    let needed = (usize::from(elem) + 1) * 16;
                    let len = buffer.borrow().len();
                    if len < needed {
                        return Err(NativeError::Validation(format!(
                            "constant slot c{slot} needs {needed} bytes, buffer holds {len}"
                        )));
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn run_invocation(program: &Program, io: &KernelIo, x: u32, y: u32) {
    let mut regs = [[0.0f32; 4]; prism_shade::REGISTER_COUNT as usize];

    // All operand indices were validated at decode time and all slot
    // bindings in `validate_bindings`, so lookups here cannot fail.
    let read = |regs: &[[f32; 4]; 8], operand: Operand| -> [f32; 4] {
        match operand {
            Operand::Reg(i) => regs[i as usize],
            Operand::Input(slot) => io.input(slot).map(|s| s.load(x, y)).unwrap_or_default(),
            Operand::Imm(i) => program.imm[usize::from(i)],
            Operand::Const { slot, elem } => io
                .constant(slot)
                .map(|b| {
                    let bytes = b.borrow();
                    let base = usize::from(elem) * 16;
                    let mut v = [0.0f32; 4];
                    for (i, c) in v.iter_mut().enumerate() {
                        let at = base + i * 4;
                        *c = f32::from_le_bytes([
                            bytes[at],
                            bytes[at + 1],
                            bytes[at + 2],
                            bytes[at + 3],
                        ]);
                    }
                    v
                })
                .unwrap_or_default(),
            Operand::Output(_) | Operand::None => [0.0; 4],
        }
    };

    for instr in &program.instrs {
        let a = read(&regs, instr.src[0]);
        let b = read(&regs, instr.src[1]);
        let c = read(&regs, instr.src[2]);

        let result = match instr.op {
            Opcode::Mov | Opcode::Movi | Opcode::Ld | Opcode::Ldc | Opcode::St => a,
            Opcode::Add => map2(a, b, |a, b| a + b),
            Opcode::Sub => map2(a, b, |a, b| a - b),
            Opcode::Mul => map2(a, b, |a, b| a * b),
            Opcode::Mad => {
                let mut out = [0.0; 4];
                for i in 0..4 {
                    out[i] = a[i] * b[i] + c[i];
                }
                out
            }
            Opcode::Min => map2(a, b, f32::min),
            Opcode::Max => map2(a, b, f32::max),
            Opcode::Sat => a.map(|v| v.clamp(0.0, 1.0)),
        };

        match instr.dst {
            Operand::Reg(i) => regs[i as usize] = result,
            Operand::Output(slot) => {
                if let Some(surface) = io.output(slot) {
                    surface.store(x, y, result);
                }
            }
            _ => {}
        }
    }
}

fn map2(a: [f32; 4], b: [f32; 4], f: impl Fn(f32, f32) -> f32) -> [f32; 4] {
    [f(a[0], b[0]), f(a[1], b[1]), f(a[2], b[2]), f(a[3], b[3])]
}

/// Fill a surface with a constant color.
pub(crate) fn clear_surface(target: &SurfaceRef, color: [f32; 4]) {
    for y in 0..target.height {
        for x in 0..target.width {
            target.store(x, y, color);
        }
    }
}

/// Byte-copy between two surfaces of identical extent and format.
pub(crate) fn copy_surface(src: &SurfaceRef, dst: &SurfaceRef) -> Result<(), NativeError> {
    if src.width != dst.width || src.height != dst.height || src.format != dst.format {
        return Err(NativeError::Validation(format!(
            "copy between incompatible surfaces ({}x{} {:?} -> {}x{} {:?})",
            src.width, src.height, src.format, dst.width, dst.height, dst.format
        )));
    }
    if Rc::ptr_eq(&src.data, &dst.data) {
        return Err(NativeError::Validation("copy source aliases destination".into()));
    }
    dst.data.borrow_mut().copy_from_slice(&src.data.borrow());
    Ok(())
}

/// Bytes per overlay vertex: clip-space x, y plus RGBA color, all f32.
pub(crate) const MESH_VERTEX_SIZE: u32 = 24;

/// Fixed-function overlay path: 16-bit indexed triangle list, vertices are
/// `[x, y, r, g, b, a]` f32 in clip space, colors interpolated and blended
/// src-over onto the target.
pub(crate) fn draw_mesh(
    target: &SurfaceRef,
    vertices: &[u8],
    stride: u32,
    indices: &[u16],
) -> Result<(), NativeError> {
    if stride < MESH_VERTEX_SIZE {
        return Err(NativeError::Validation(format!(
            "vertex stride {stride} below the fixed-function layout size {MESH_VERTEX_SIZE}"
        )));
    }
    if indices.len() % 3 != 0 {
        return Err(NativeError::Validation(format!(
            "index count {} is not a multiple of 3",
            indices.len()
        )));
    }

    let fetch = |index: u16| -> Result<([f32; 2], [f32; 4]), NativeError> {
        let base = index as usize * stride as usize;
        let bytes = vertices.get(base..base + MESH_VERTEX_SIZE as usize).ok_or_else(|| {
            NativeError::Validation(format!("vertex index {index} out of range"))
        })?;
        let f = |at: usize| {
            f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        Ok(([f(0), f(4)], [f(8), f(12), f(16), f(20)]))
    };

    let to_pixel = |pos: [f32; 2]| -> [f32; 2] {
        [
            (pos[0] + 1.0) * 0.5 * target.width as f32,
            (1.0 - pos[1]) * 0.5 * target.height as f32,
        ]
    };

    for triangle in indices.chunks_exact(3) {
        let (c0, col0) = fetch(triangle[0])?;
        let (c1, col1) = fetch(triangle[1])?;
        let (c2, col2) = fetch(triangle[2])?;
        let p0 = to_pixel(c0);
        let p1 = to_pixel(c1);
        let p2 = to_pixel(c2);

        let area = edge(p0, p1, p2);
        if area.abs() < f32::EPSILON {
            continue; // degenerate
        }

        let min_x = p0[0].min(p1[0]).min(p2[0]).floor().max(0.0) as u32;
        let min_y = p0[1].min(p1[1]).min(p2[1]).floor().max(0.0) as u32;
        let max_x = (p0[0].max(p1[0]).max(p2[0]).ceil() as u32).min(target.width);
        let max_y = (p0[1].max(p1[1]).max(p2[1]).ceil() as u32).min(target.height);

        for y in min_y..max_y {
            for x in min_x..max_x {
                let sample = [x as f32 + 0.5, y as f32 + 0.5];
                let w0 = edge(p1, p2, sample) / area;
                let w1 = edge(p2, p0, sample) / area;
                let w2 = edge(p0, p1, sample) / area;
                if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                    continue;
                }
                let mut color = [0.0f32; 4];
                for i in 0..4 {
                    color[i] = col0[i] * w0 + col1[i] * w1 + col2[i] * w2;
                }
                let dst = target.load(x, y);
                let alpha = color[3].clamp(0.0, 1.0);
                let blended = [
                    color[0] * alpha + dst[0] * (1.0 - alpha),
                    color[1] * alpha + dst[1] * (1.0 - alpha),
                    color[2] * alpha + dst[2] * (1.0 - alpha),
                    (alpha + dst[3] * (1.0 - alpha)).clamp(0.0, 1.0),
                ];
                target.store(x, y, blended);
            }
        }
    }
    Ok(())
}

fn edge(a: [f32; 2], b: [f32; 2], p: [f32; 2]) -> f32 {
    (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_shade::{assemble, decode, KernelStage};

    fn surface(width: u32, height: u32) -> SurfaceRef {
        SurfaceRef {
            data: Rc::new(RefCell::new(vec![
                0u8;
                (width * height * 4) as usize
            ])),
            width,
            height,
            format: NativeFormat::Rgba8Unorm,
        }
    }

    fn program(source: &str) -> Program {
        decode(&assemble(source, "main", KernelStage::Compute, &[]).unwrap()).unwrap()
    }

    #[test]
    fn copy_kernel_moves_texels() {
        let input = surface(4, 4);
        let output = surface(4, 4);
        input.store(2, 1, [1.0, 0.0, 0.0, 1.0]);

        let io = KernelIo {
            inputs: vec![Some(input)],
            outputs: vec![Some(output.clone())],
            constants: Vec::new(),
        };
        run_kernel(
            &program("kernel main\n    ld r0, t0\n    st u0, r0\nend\n"),
            &io,
            4,
            4,
        )
        .unwrap();
        assert_eq!(output.load(2, 1), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(output.load(0, 0), [0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn unbound_input_slot_is_a_validation_error() {
        let io = KernelIo {
            inputs: Vec::new(),
            outputs: vec![Some(surface(2, 2))],
            constants: Vec::new(),
        };
        let err = run_kernel(
            &program("kernel main\n    ld r0, t0\n    st u0, r0\nend\n"),
            &io,
            2,
            2,
        )
        .unwrap_err();
        assert!(matches!(err, NativeError::Validation(_)));
    }

    #[test]
    fn output_aliasing_an_input_is_rejected() {
        let shared = surface(2, 2);
        let io = KernelIo {
            inputs: vec![Some(shared.clone())],
            outputs: vec![Some(shared)],
            constants: Vec::new(),
        };
        assert!(run_kernel(
            &program("kernel main\n    ld r0, t0\n    st u0, r0\nend\n"),
            &io,
            2,
            2
        )
        .is_err());
    }

    #[test]
    fn constant_buffer_too_small_is_rejected() {
        let io = KernelIo {
            inputs: Vec::new(),
            outputs: vec![Some(surface(2, 2))],
            constants: vec![Some(Rc::new(RefCell::new(vec![0u8; 16])))],
        };
        let err = run_kernel(
            &program("kernel main\n    ldc r0, c0[1]\n    st u0, r0\nend\n"),
            &io,
            2,
            2,
        )
        .unwrap_err();
        assert!(matches!(err, NativeError::Validation(_)));
    }

    #[test]
    fn full_screen_triangle_pair_covers_target() {
        let target = surface(8, 8);
        // Two triangles spanning the whole clip square, opaque green.
        let quad = [
            [-1.0f32, -1.0, 0.0, 1.0, 0.0, 1.0],
            [1.0, -1.0, 0.0, 1.0, 0.0, 1.0],
            [1.0, 1.0, 0.0, 1.0, 0.0, 1.0],
            [-1.0, 1.0, 0.0, 1.0, 0.0, 1.0],
        ];
        let mut vertices = Vec::new();
        for v in quad {
            for f in v {
                vertices.extend_from_slice(&f.to_le_bytes());
            }
        }
        draw_mesh(
            &target,
            &vertices,
            MESH_VERTEX_SIZE,
            &[0, 1, 2, 0, 2, 3],
        )
        .unwrap();
        assert_eq!(target.load(0, 0), [0.0, 1.0, 0.0, 1.0]);
        assert_eq!(target.load(7, 7), [0.0, 1.0, 0.0, 1.0]);
        assert_eq!(target.load(4, 4), [0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn clear_fills_every_texel() {
        let target = surface(3, 2);
        clear_surface(&target, [1.0, 1.0, 1.0, 1.0]);
        for y in 0..2 {
            for x in 0..3 {
                assert_eq!(target.load(x, y), [1.0; 4]);
            }
        }
    }

    #[test]
    fn copy_surface_rejects_mismatched_extent() {
        assert!(copy_surface(&surface(2, 2), &surface(4, 4)).is_err());
        assert!(copy_surface(&surface(2, 2), &surface(2, 2)).is_ok());
    }
}
