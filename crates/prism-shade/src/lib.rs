//! Kernel bytecode for the prism post-processing layer (`KBC1` containers).
//!
//! The compositor's image-processing shaders are written in a small
//! assembly-style kernel language, compiled once per session into a
//! fixed-width word stream that both native backends consume. This crate
//! provides:
//!
//! - An assembler ([`assemble`]): preprocessor define substitution,
//!   entry-point selection and line-numbered diagnostics.
//! - A bounds-checked decoder ([`decode`]) intended for **untrusted** blobs:
//!   it never panics or reads out of bounds on malformed input.
//!
//! Execution of decoded programs lives in the native layer, not here.

#![forbid(unsafe_code)]

mod assemble;
mod decode;
mod error;

pub use assemble::assemble;
pub use decode::decode;
pub use error::ShadeError;

/// Container magic: `b"KBC1"` as a little-endian word.
pub const KBC_MAGIC: u32 = u32::from_le_bytes(*b"KBC1");

/// Current container version.
pub const KBC_VERSION: u32 = 1;

/// Number of addressable vec4 registers (`r0..r7`).
pub const REGISTER_COUNT: u8 = 8;

/// Maximum input slot index + 1 (`t0..t7`).
pub const MAX_INPUT_SLOTS: u8 = 8;

/// Maximum output slot index + 1 (`u0..u3`).
pub const MAX_OUTPUT_SLOTS: u8 = 4;

/// Maximum constant-buffer slot index + 1 (`c0..c3`).
pub const MAX_CONST_SLOTS: u8 = 4;

/// Maximum vec4 elements addressable within one constant-buffer slot.
pub const MAX_CONST_ELEMS: u16 = 4096;

/// Pipeline stage a kernel targets.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum KernelStage {
    /// Thread-grid compute kernel; invocation coordinate is the global
    /// thread id.
    Compute = 1,
    /// Full-screen pass; invocation coordinate is the render-target pixel.
    Quad = 2,
}

impl KernelStage {
    pub fn from_word(word: u32) -> Option<Self> {
        Some(match word {
            x if x == Self::Compute as u32 => Self::Compute,
            x if x == Self::Quad as u32 => Self::Quad,
            _ => return None,
        })
    }
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Opcode {
    Mov = 0x01,
    Movi = 0x02,
    Add = 0x03,
    Sub = 0x04,
    Mul = 0x05,
    Mad = 0x06,
    Min = 0x07,
    Max = 0x08,
    Sat = 0x09,
    /// Load the texel at the invocation coordinate from an input slot.
    Ld = 0x10,
    /// Store a register to the invocation coordinate of an output slot.
    St = 0x11,
    /// Load a vec4 element from a constant-buffer slot.
    Ldc = 0x12,
}

impl Opcode {
    pub fn from_word(word: u32) -> Option<Self> {
        Some(match word {
            x if x == Self::Mov as u32 => Self::Mov,
            x if x == Self::Movi as u32 => Self::Movi,
            x if x == Self::Add as u32 => Self::Add,
            x if x == Self::Sub as u32 => Self::Sub,
            x if x == Self::Mul as u32 => Self::Mul,
            x if x == Self::Mad as u32 => Self::Mad,
            x if x == Self::Min as u32 => Self::Min,
            x if x == Self::Max as u32 => Self::Max,
            x if x == Self::Sat as u32 => Self::Sat,
            x if x == Self::Ld as u32 => Self::Ld,
            x if x == Self::St as u32 => Self::St,
            x if x == Self::Ldc as u32 => Self::Ldc,
            _ => return None,
        })
    }

    /// Number of source operands (the destination is separate).
    pub fn source_arity(self) -> usize {
        match self {
            Opcode::Mov | Opcode::Sat | Opcode::Ld | Opcode::St | Opcode::Movi | Opcode::Ldc => 1,
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Min | Opcode::Max => 2,
            Opcode::Mad => 3,
        }
    }
}

/// A decoded instruction operand.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operand {
    None,
    /// vec4 register `rN`.
    Reg(u8),
    /// Input (texture) slot `tN`.
    Input(u8),
    /// Output (storage image / render target) slot `uN`.
    Output(u8),
    /// Constant-buffer element `cN[idx]`.
    Const { slot: u8, elem: u16 },
    /// Entry in the immediate pool.
    Imm(u16),
}

// Operand word encoding: kind in bits 31..28, payload in bits 27..0.
// `Const` packs slot into bits 27..16 and elem into bits 15..0.
const OPERAND_NONE: u32 = 0xFFFF_FFFF;
const KIND_REG: u32 = 0x1;
const KIND_INPUT: u32 = 0x2;
const KIND_OUTPUT: u32 = 0x3;
const KIND_CONST: u32 = 0x4;
const KIND_IMM: u32 = 0x5;

impl Operand {
    pub(crate) fn to_word(self) -> u32 {
        match self {
            Operand::None => OPERAND_NONE,
            Operand::Reg(i) => (KIND_REG << 28) | u32::from(i),
            Operand::Input(i) => (KIND_INPUT << 28) | u32::from(i),
            Operand::Output(i) => (KIND_OUTPUT << 28) | u32::from(i),
            Operand::Const { slot, elem } => {
                (KIND_CONST << 28) | (u32::from(slot) << 16) | u32::from(elem)
            }
            Operand::Imm(i) => (KIND_IMM << 28) | u32::from(i),
        }
    }

    pub(crate) fn from_word(word: u32) -> Option<Self> {
        if word == OPERAND_NONE {
            return Some(Operand::None);
        }
        let payload = word & 0x0FFF_FFFF;
        Some(match word >> 28 {
            KIND_REG => Operand::Reg(u8::try_from(payload).ok()?),
            KIND_INPUT => Operand::Input(u8::try_from(payload).ok()?),
            KIND_OUTPUT => Operand::Output(u8::try_from(payload).ok()?),
            KIND_CONST => Operand::Const {
                slot: u8::try_from(payload >> 16).ok()?,
                elem: (payload & 0xFFFF) as u16,
            },
            KIND_IMM => Operand::Imm(u16::try_from(payload).ok()?),
            _ => return None,
        })
    }
}

/// One decoded instruction: `op dst, src[0..arity]`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Instr {
    pub op: Opcode,
    pub dst: Operand,
    pub src: [Operand; 3],
}

/// Words per encoded instruction: opcode, dst, three sources.
pub(crate) const INSTR_WORDS: usize = 5;

/// A fully decoded, validated kernel program.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub stage: KernelStage,
    pub entry: String,
    pub instrs: Vec<Instr>,
    /// Immediate vec4 pool referenced by [`Operand::Imm`].
    pub imm: Vec<[f32; 4]>,
}

impl Program {
    /// Highest input slot referenced, if any.
    pub fn max_input_slot(&self) -> Option<u8> {
        self.operands()
            .filter_map(|op| match op {
                Operand::Input(i) => Some(i),
                _ => None,
            })
            .max()
    }

    /// Highest output slot referenced, if any.
    pub fn max_output_slot(&self) -> Option<u8> {
        self.operands()
            .filter_map(|op| match op {
                Operand::Output(i) => Some(i),
                _ => None,
            })
            .max()
    }

    fn operands(&self) -> impl Iterator<Item = Operand> + '_ {
        self.instrs
            .iter()
            .flat_map(|i| std::iter::once(i.dst).chain(i.src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_words_round_trip() {
        let operands = [
            Operand::None,
            Operand::Reg(7),
            Operand::Input(3),
            Operand::Output(1),
            Operand::Const { slot: 2, elem: 513 },
            Operand::Imm(9),
        ];
        for op in operands {
            assert_eq!(Operand::from_word(op.to_word()), Some(op));
        }
    }

    #[test]
    fn unknown_operand_kind_is_rejected() {
        assert_eq!(Operand::from_word(0x9000_0000), None);
    }
}
