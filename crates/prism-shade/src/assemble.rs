//! Line-based assembler for the kernel language.
//!
//! Source layout:
//!
//! ```text
//! ; sharpen pass
//! kernel main
//!     ld   r0, t0
//!     movi r1, $STRENGTH, $STRENGTH, $STRENGTH, 1.0
//!     mul  r0, r0, r1
//!     st   u0, r0
//! end
//! ```
//!
//! `$NAME` tokens are substituted from the caller-supplied define table before
//! tokenization; referencing an undefined macro is a compile error. A source
//! file may contain several kernels; the caller selects one by entry name.

use crate::error::ShadeError;
use crate::{
    Instr, KernelStage, Opcode, Operand, INSTR_WORDS, KBC_MAGIC, KBC_VERSION, MAX_CONST_ELEMS,
    MAX_CONST_SLOTS, MAX_INPUT_SLOTS, MAX_OUTPUT_SLOTS, REGISTER_COUNT,
};

struct KernelBody {
    name: String,
    instrs: Vec<Instr>,
    imm: Vec<[f32; 4]>,
}

/// Assemble `source` into a `KBC1` blob for the kernel named `entry`.
pub fn assemble(
    source: &str,
    entry: &str,
    stage: KernelStage,
    defines: &[(&str, &str)],
) -> Result<Vec<u8>, ShadeError> {
    let mut kernels: Vec<KernelBody> = Vec::new();
    let mut current: Option<KernelBody> = None;

    for (index, raw_line) in source.lines().enumerate() {
        let line = index as u32 + 1;
        let substituted = substitute_defines(raw_line, defines, line)?;
        let text = match substituted.split(';').next() {
            Some(t) => t.trim(),
            None => "",
        };
        if text.is_empty() {
            continue;
        }

        let mut parts = text.splitn(2, char::is_whitespace);
        let head = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("").trim();

        match head {
            "kernel" => {
                if current.is_some() {
                    return Err(syntax(line, "nested 'kernel' block"));
                }
                if rest.is_empty() || !rest.chars().all(|c| c.is_alphanumeric() || c == '_') {
                    return Err(syntax(line, "expected 'kernel <name>'"));
                }
                current = Some(KernelBody {
                    name: rest.to_owned(),
                    instrs: Vec::new(),
                    imm: Vec::new(),
                });
            }
            "end" => {
                let body = current
                    .take()
                    .ok_or_else(|| syntax(line, "'end' outside a kernel block"))?;
                kernels.push(body);
            }
            mnemonic => {
                let body = current
                    .as_mut()
                    .ok_or_else(|| syntax(line, "instruction outside a kernel block"))?;
                let instr = parse_instruction(mnemonic, rest, line, &mut body.imm)?;
                body.instrs.push(instr);
            }
        }
    }

    if current.is_some() {
        return Err(ShadeError::Syntax {
            line: source.lines().count() as u32,
            message: "unterminated kernel block (missing 'end')".to_owned(),
        });
    }

    let body = kernels
        .into_iter()
        .find(|k| k.name == entry)
        .ok_or_else(|| ShadeError::EntryNotFound {
            entry: entry.to_owned(),
        })?;

    Ok(encode(stage, &body))
}

fn syntax(line: u32, message: &str) -> ShadeError {
    ShadeError::Syntax {
        line,
        message: message.to_owned(),
    }
}

fn substitute_defines(
    line: &str,
    defines: &[(&str, &str)],
    line_no: u32,
) -> Result<String, ShadeError> {
    if !line.contains('$') {
        return Ok(line.to_owned());
    }

    let mut out = String::with_capacity(line.len());
    let mut chars = line.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        while let Some(&(_, n)) = chars.peek() {
            if n.is_alphanumeric() || n == '_' {
                name.push(n);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(syntax(line_no, "'$' without a macro name"));
        }
        match defines.iter().find(|(k, _)| *k == name) {
            Some((_, value)) => out.push_str(value),
            None => {
                return Err(ShadeError::UndefinedMacro {
                    line: line_no,
                    name,
                })
            }
        }
    }
    Ok(out)
}

fn parse_instruction(
    mnemonic: &str,
    operands: &str,
    line: u32,
    imm_pool: &mut Vec<[f32; 4]>,
) -> Result<Instr, ShadeError> {
    let op = match mnemonic {
        "mov" => Opcode::Mov,
        "movi" => Opcode::Movi,
        "add" => Opcode::Add,
        "sub" => Opcode::Sub,
        "mul" => Opcode::Mul,
        "mad" => Opcode::Mad,
        "min" => Opcode::Min,
        "max" => Opcode::Max,
        "sat" => Opcode::Sat,
        "ld" => Opcode::Ld,
        "st" => Opcode::St,
        "ldc" => Opcode::Ldc,
        other => return Err(syntax(line, &format!("unknown opcode '{other}'"))),
    };

    let fields: Vec<&str> = operands
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .collect();

    // `movi` takes a register plus four literals folded into the pool.
    if op == Opcode::Movi {
        if fields.len() != 5 {
            return Err(syntax(line, "movi expects 'rN, x, y, z, w'"));
        }
        let dst = parse_register(fields[0], line)?;
        let mut value = [0.0f32; 4];
        for (i, field) in fields[1..].iter().enumerate() {
            value[i] = field
                .parse::<f32>()
                .map_err(|_| syntax(line, &format!("bad float literal '{field}'")))?;
        }
        let pool_index = u16::try_from(imm_pool.len())
            .map_err(|_| syntax(line, "immediate pool overflow"))?;
        imm_pool.push(value);
        return Ok(Instr {
            op,
            dst,
            src: [Operand::Imm(pool_index), Operand::None, Operand::None],
        });
    }

    let expected = op.source_arity() + 1;
    if fields.len() != expected {
        return Err(syntax(
            line,
            &format!("'{mnemonic}' expects {expected} operands, found {}", fields.len()),
        ));
    }

    let dst = parse_operand(fields[0], line)?;
    match op {
        Opcode::St => {
            if !matches!(dst, Operand::Output(_)) {
                return Err(syntax(line, "st destination must be an output slot 'uN'"));
            }
        }
        _ => {
            if !matches!(dst, Operand::Reg(_)) {
                return Err(syntax(line, "destination must be a register 'rN'"));
            }
        }
    }

    let mut src = [Operand::None; 3];
    for (i, field) in fields[1..].iter().enumerate() {
        let operand = parse_operand(field, line)?;
        let valid = match op {
            Opcode::Ld => matches!(operand, Operand::Input(_)),
            Opcode::Ldc => matches!(operand, Operand::Const { .. }),
            _ => matches!(operand, Operand::Reg(_)),
        };
        if !valid {
            return Err(syntax(line, &format!("operand '{field}' not valid for '{mnemonic}'")));
        }
        src[i] = operand;
    }

    Ok(Instr { op, dst, src })
}

fn parse_register(field: &str, line: u32) -> Result<Operand, ShadeError> {
    match parse_operand(field, line)? {
        r @ Operand::Reg(_) => Ok(r),
        _ => Err(syntax(line, &format!("expected register, found '{field}'"))),
    }
}

fn parse_operand(field: &str, line: u32) -> Result<Operand, ShadeError> {
    // Split on char boundaries; operands may contain arbitrary input.
    let mut chars = field.chars();
    let prefix = chars
        .next()
        .ok_or_else(|| syntax(line, "empty operand"))?;
    let rest = chars.as_str();
    match prefix {
        'r' => {
            let index = parse_index(rest, line, field)?;
            if index >= REGISTER_COUNT {
                return Err(syntax(line, &format!("register r{index} out of range")));
            }
            Ok(Operand::Reg(index))
        }
        't' => {
            let index = parse_index(rest, line, field)?;
            if index >= MAX_INPUT_SLOTS {
                return Err(syntax(line, &format!("input slot t{index} out of range")));
            }
            Ok(Operand::Input(index))
        }
        'u' => {
            let index = parse_index(rest, line, field)?;
            if index >= MAX_OUTPUT_SLOTS {
                return Err(syntax(line, &format!("output slot u{index} out of range")));
            }
            Ok(Operand::Output(index))
        }
        'c' => {
            let open = rest
                .find('[')
                .ok_or_else(|| syntax(line, &format!("expected 'cN[idx]', found '{field}'")))?;
            if !rest.ends_with(']') {
                return Err(syntax(line, &format!("expected 'cN[idx]', found '{field}'")));
            }
            let slot = parse_index(&rest[..open], line, field)?;
            if slot >= MAX_CONST_SLOTS {
                return Err(syntax(line, &format!("constant slot c{slot} out of range")));
            }
            let elem_text = &rest[open + 1..rest.len() - 1];
            let elem: u16 = elem_text
                .parse()
                .map_err(|_| syntax(line, &format!("bad constant index '{elem_text}'")))?;
            if elem >= MAX_CONST_ELEMS {
                return Err(syntax(line, &format!("constant element {elem} out of range")));
            }
            Ok(Operand::Const { slot, elem })
        }
        _ => Err(syntax(line, &format!("unrecognized operand '{field}'"))),
    }
}

fn parse_index(text: &str, line: u32, field: &str) -> Result<u8, ShadeError> {
    text.parse::<u8>()
        .map_err(|_| syntax(line, &format!("bad slot index in '{field}'")))
}

fn encode(stage: KernelStage, body: &KernelBody) -> Vec<u8> {
    let name_bytes = body.name.as_bytes();
    let name_words = name_bytes.len().div_ceil(4);
    let mut words: Vec<u32> =
        Vec::with_capacity(5 + name_words + body.instrs.len() * INSTR_WORDS + body.imm.len() * 4);

    words.push(KBC_MAGIC);
    words.push(KBC_VERSION);
    words.push(stage as u32);
    words.push(name_bytes.len() as u32);
    for chunk_start in (0..name_bytes.len()).step_by(4) {
        let mut word_bytes = [0u8; 4];
        let end = (chunk_start + 4).min(name_bytes.len());
        word_bytes[..end - chunk_start].copy_from_slice(&name_bytes[chunk_start..end]);
        words.push(u32::from_le_bytes(word_bytes));
    }

    words.push(body.instrs.len() as u32);
    for instr in &body.instrs {
        words.push(instr.op as u32);
        words.push(instr.dst.to_word());
        for s in instr.src {
            words.push(s.to_word());
        }
    }

    words.push(body.imm.len() as u32);
    for value in &body.imm {
        for component in value {
            words.push(component.to_bits());
        }
    }

    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}
