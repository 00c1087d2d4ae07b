//! Bounds-checked decoder for `KBC1` containers.
//!
//! Blobs may come from files on disk or from a host process; the decoder
//! treats them as untrusted and validates every slot/register reference, so
//! the native interpreters can index unchecked-by-construction.

use crate::error::ShadeError;
use crate::{
    Instr, KernelStage, Opcode, Operand, Program, INSTR_WORDS, KBC_MAGIC, KBC_VERSION,
    MAX_CONST_ELEMS, MAX_CONST_SLOTS, MAX_INPUT_SLOTS, MAX_OUTPUT_SLOTS, REGISTER_COUNT,
};

struct WordReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> WordReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn next(&mut self) -> Result<u32, ShadeError> {
        let slice = self
            .bytes
            .get(self.offset..self.offset + 4)
            .ok_or(ShadeError::Truncated)?;
        self.offset += 4;
        // Slice length is checked above.
        Ok(u32::from_le_bytes(slice.try_into().unwrap()))
    }
}

/// Decode and validate a `KBC1` blob.
pub fn decode(bytes: &[u8]) -> Result<Program, ShadeError> {
    let mut reader = WordReader::new(bytes);

    let magic = reader.next()?;
    if magic != KBC_MAGIC {
        return Err(ShadeError::BadMagic { found: magic });
    }
    let version = reader.next()?;
    if version != KBC_VERSION {
        return Err(ShadeError::UnsupportedVersion { found: version });
    }
    let stage_word = reader.next()?;
    let stage = KernelStage::from_word(stage_word).ok_or_else(|| ShadeError::Malformed {
        message: format!("unknown stage {stage_word}"),
    })?;

    let name_len = reader.next()? as usize;
    if name_len > 256 {
        return Err(ShadeError::Malformed {
            message: format!("entry name length {name_len} exceeds limit"),
        });
    }
    let mut name_bytes = Vec::with_capacity(name_len);
    for _ in 0..name_len.div_ceil(4) {
        name_bytes.extend_from_slice(&reader.next()?.to_le_bytes());
    }
    name_bytes.truncate(name_len);
    let entry = String::from_utf8(name_bytes).map_err(|_| ShadeError::Malformed {
        message: "entry name is not valid UTF-8".to_owned(),
    })?;

    let instr_count = reader.next()? as usize;
    // An instruction is INSTR_WORDS words; reject counts the blob cannot hold
    // before allocating.
    if instr_count > bytes.len() / (INSTR_WORDS * 4) {
        return Err(ShadeError::Truncated);
    }
    let mut instrs = Vec::with_capacity(instr_count);
    for _ in 0..instr_count {
        let op_word = reader.next()?;
        let op = Opcode::from_word(op_word).ok_or_else(|| ShadeError::Malformed {
            message: format!("unknown opcode word 0x{op_word:08X}"),
        })?;
        let dst = decode_operand(reader.next()?)?;
        let src = [
            decode_operand(reader.next()?)?,
            decode_operand(reader.next()?)?,
            decode_operand(reader.next()?)?,
        ];
        instrs.push(Instr { op, dst, src });
    }

    let imm_count = reader.next()? as usize;
    if imm_count > bytes.len() / 16 {
        return Err(ShadeError::Truncated);
    }
    let mut imm = Vec::with_capacity(imm_count);
    for _ in 0..imm_count {
        let mut value = [0.0f32; 4];
        for component in &mut value {
            *component = f32::from_bits(reader.next()?);
        }
        imm.push(value);
    }

    let program = Program {
        stage,
        entry,
        instrs,
        imm,
    };
    validate(&program)?;
    Ok(program)
}

fn decode_operand(word: u32) -> Result<Operand, ShadeError> {
    Operand::from_word(word).ok_or_else(|| ShadeError::Malformed {
        message: format!("unknown operand word 0x{word:08X}"),
    })
}

/// Structural validation so interpreters never see an out-of-range index.
fn validate(program: &Program) -> Result<(), ShadeError> {
    for (index, instr) in program.instrs.iter().enumerate() {
        let malformed = |message: String| ShadeError::Malformed {
            message: format!("instr {index}: {message}"),
        };

        match instr.op {
            Opcode::St => {
                if !matches!(instr.dst, Operand::Output(_)) {
                    return Err(malformed("st destination must be an output slot".into()));
                }
            }
            _ => {
                if !matches!(instr.dst, Operand::Reg(_)) {
                    return Err(malformed("destination must be a register".into()));
                }
            }
        }

        for (position, operand) in std::iter::once(instr.dst)
            .chain(instr.src)
            .enumerate()
        {
            let in_range = match operand {
                Operand::None => true,
                Operand::Reg(i) => i < REGISTER_COUNT,
                Operand::Input(i) => i < MAX_INPUT_SLOTS,
                Operand::Output(i) => i < MAX_OUTPUT_SLOTS,
                Operand::Const { slot, elem } => slot < MAX_CONST_SLOTS && elem < MAX_CONST_ELEMS,
                Operand::Imm(i) => usize::from(i) < program.imm.len(),
            };
            if !in_range {
                return Err(malformed(format!(
                    "operand {position} out of range: {operand:?}"
                )));
            }
        }

        let arity = instr.op.source_arity();
        for (i, operand) in instr.src.iter().enumerate() {
            let expect_some = i < arity;
            if expect_some == matches!(operand, Operand::None) {
                return Err(malformed(format!(
                    "source {i} {} for arity {arity}",
                    if expect_some { "missing" } else { "unexpected" },
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble;

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
    fn rejects_truncated_blob() {
        let blob = copy_blob();
        for len in [0, 3, 7, blob.len() - 4] {
            assert!(decode(&blob[..len]).is_err(), "len {len} should fail");
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut blob = copy_blob();
        blob[0] ^= 0xFF;
        assert!(matches!(decode(&blob), Err(ShadeError::BadMagic { .. })));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut blob = copy_blob();
        blob[4] = 99;
        assert!(matches!(
            decode(&blob),
            Err(ShadeError::UnsupportedVersion { found: 99 })
        ));
    }

    #[test]
    fn rejects_oversized_instruction_count() {
        let mut blob = copy_blob();
        // instr_count sits after magic, version, stage, name_len and one name word.
        let instr_count_offset = 5 * 4;
        blob[instr_count_offset..instr_count_offset + 4]
            .copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(decode(&blob), Err(ShadeError::Truncated)));
    }

    #[test]
    fn decode_never_panics_on_random_mutations() {
        let blob = copy_blob();
        for position in 0..blob.len() {
            for bit in 0..8 {
                let mut mutated = blob.clone();
                mutated[position] ^= 1 << bit;
                // Any result is fine; the decoder just must not panic.
                let _ = decode(&mutated);
            }
        }
    }
}
