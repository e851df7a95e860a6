//! Binary stream decoder and listing printer.
//!
//! The decoder mirrors the encoder: one instruction per table entry, the
//! operand read back with the same width the encoder wrote it. The textual
//! listing uses the surface syntax the assembler accepts (data bytes become
//! one `byte` entry each, offsets are printed as trailing comments), so a
//! listing can be reassembled into the identical stream.

use crate::asm;
use crate::isa::{self, Op, Width};

/// Error type for decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisasmError {
    BadHeader,
    IllegalOpcode { offset: usize, byte: u8 },
    /// The stream ends inside an operand.
    Truncated { offset: usize },
}

impl std::fmt::Display for DisasmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisasmError::BadHeader => write!(f, "not a valid program image"),
            DisasmError::IllegalOpcode { offset, byte } => {
                write!(f, "illegal opcode {:#04x} at offset {}", byte, offset)
            }
            DisasmError::Truncated { offset } => {
                write!(f, "stream truncated inside instruction at offset {}", offset)
            }
        }
    }
}

impl std::error::Error for DisasmError {}

/// A decoded operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    None,
    Int(i32),
    Float(f32),
    Char(u8),
    Reg(u8, Width),
    Mem(u32, Width),
    /// A jump/call target, an absolute stream offset.
    Pos(u32),
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub offset: u32,
    pub op: Op,
    pub operand: Operand,
}

/// Decode a full image into its entry point, data bytes, and instruction
/// sequence.
pub fn decode(bytes: &[u8]) -> Result<(u32, Vec<Inst>), DisasmError> {
    let entry = asm::read_header(bytes).ok_or(DisasmError::BadHeader)?;
    let mut insts = Vec::new();
    let mut offset = entry as usize;

    while offset < bytes.len() {
        let byte = bytes[offset];
        let op = match Op::from_u8(byte) {
            Some(Op::Push) | Some(Op::Pop) | None => {
                return Err(DisasmError::IllegalOpcode { offset, byte });
            }
            Some(op) => op,
        };
        let len = op.operand_len();
        if offset + 1 + len > bytes.len() {
            return Err(DisasmError::Truncated { offset });
        }
        let operand = read_operand(op, &bytes[offset + 1..offset + 1 + len]);
        insts.push(Inst {
            offset: offset as u32,
            op,
            operand,
        });
        offset += 1 + len;
    }

    Ok((entry, insts))
}

fn read_operand(op: Op, raw: &[u8]) -> Operand {
    let u32_of = |raw: &[u8]| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    match op {
        Op::PushInt => Operand::Int(u32_of(raw) as i32),
        Op::PushFloat => Operand::Float(f32::from_bits(u32_of(raw))),
        Op::PushChar => Operand::Char(raw[0]),
        Op::PushRegByte | Op::PopRegByte => Operand::Reg(raw[0], Width::Byte),
        Op::PushRegWord | Op::PopRegWord => Operand::Reg(raw[0], Width::Word),
        Op::PushRegDword | Op::PopRegDword => Operand::Reg(raw[0], Width::Dword),
        Op::PushMemByte | Op::PopMemByte => Operand::Mem(u32_of(raw), Width::Byte),
        Op::PushMemWord | Op::PopMemWord => Operand::Mem(u32_of(raw), Width::Word),
        Op::PushMemDword | Op::PopMemDword => Operand::Mem(u32_of(raw), Width::Dword),
        Op::Ja | Op::Jae | Op::Jb | Op::Jbe | Op::Je | Op::Jne | Op::Jmp | Op::Call => {
            Operand::Pos(u32_of(raw))
        }
        _ => Operand::None,
    }
}

/// Render a reassemblable listing of an image.
pub fn disassemble(bytes: &[u8]) -> Result<String, DisasmError> {
    use std::fmt::Write;

    let (entry, insts) = decode(bytes)?;
    let mut text = String::new();
    let _ = writeln!(text, "; entry at {}", entry);

    if entry as usize > isa::HEADER_SIZE {
        let _ = writeln!(text, ".data");
        for (i, b) in bytes[isa::HEADER_SIZE..entry as usize].iter().enumerate() {
            let offset = isa::HEADER_SIZE + i;
            let _ = writeln!(text, "m{}: byte {}", offset, b);
        }
    }

    // The assembler appends a sentinel stop to whatever it emits; leaving
    // it out of the listing keeps reassembly from growing the stream.
    let mut insts = &insts[..];
    if let [rest @ .., last] = insts {
        if last.op == Op::Stop && last.offset as usize == bytes.len() - 1 {
            insts = rest;
        }
    }

    let _ = writeln!(text, ".code");
    for inst in insts {
        let _ = writeln!(text, "{:<24}; {:#06x}", render(inst), inst.offset);
    }
    Ok(text)
}

fn render(inst: &Inst) -> String {
    let name = inst.op.name();
    match inst.operand {
        Operand::None => name.to_string(),
        Operand::Int(v) => format!("{} {}", name, v),
        Operand::Float(v) => format!("{} {}", name, v),
        Operand::Char(c) => format!("{} {}", name, render_char(c)),
        Operand::Reg(addr, width) => match isa::register_name(addr, width) {
            Some(reg) => format!("{} {}", name, reg),
            None => format!("{} reg:{}", name, addr),
        },
        Operand::Mem(addr, _) => format!("{} [{}]", name, addr),
        Operand::Pos(pos) => format!("{} {}", name, pos),
    }
}

fn render_char(c: u8) -> String {
    match c {
        b'\n' => "'\\n'".to_string(),
        b'\t' => "'\\t'".to_string(),
        0 => "'\\0'".to_string(),
        b'\\' => "'\\\\'".to_string(),
        b'\'' => "'\\''".to_string(),
        c if c.is_ascii_graphic() || c == b' ' => format!("'{}'", c as char),
        c => format!("'\\{}'", c),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;

    #[test]
    fn test_decode_mirrors_encoder() {
        let program =
            assemble(".code\npush 2\npush eax\npush word [9]\ncmp\nje 5\nstop\n").unwrap();
        let (entry, insts) = decode(&program.bytes).unwrap();
        assert_eq!(entry, 5);
        let ops: Vec<Op> = insts.iter().map(|i| i.op).collect();
        assert_eq!(
            ops,
            vec![
                Op::PushInt,
                Op::PushRegDword,
                Op::PushMemWord,
                Op::Cmp,
                Op::Je,
                Op::Stop,
                // the appended sentinel
                Op::Stop,
            ]
        );
        assert_eq!(insts[0].operand, Operand::Int(2));
        assert_eq!(insts[1].operand, Operand::Reg(0, Width::Dword));
        assert_eq!(insts[2].operand, Operand::Mem(9, Width::Word));
        assert_eq!(insts[4].operand, Operand::Pos(5));
    }

    #[test]
    fn test_roundtrip_through_listing() {
        let source = "\
.data
greeting: byte 'h'
count: dword 1000
.code
push [count]
top: push -1
add
dworddup
push 0
cmp
jne top
push byte [greeting]
cout
stop
";
        let first = assemble(source).unwrap();
        let listing = disassemble(&first.bytes).unwrap();
        let second = assemble(&listing).unwrap();
        assert_eq!(first.bytes, second.bytes);
    }

    #[test]
    fn test_char_operands_render_escaped() {
        let program = assemble(".code\npush '\\n'\ncout\nstop\n").unwrap();
        let listing = disassemble(&program.bytes).unwrap();
        assert!(listing.contains("push_char '\\n'"));
        let again = assemble(&listing).unwrap();
        assert_eq!(program.bytes, again.bytes);
    }

    #[test]
    fn test_illegal_opcode() {
        let mut bytes = assemble(".code\nstop\n").unwrap().bytes;
        bytes[5] = 0xEE;
        assert_eq!(
            decode(&bytes),
            Err(DisasmError::IllegalOpcode {
                offset: 5,
                byte: 0xEE
            })
        );
    }

    #[test]
    fn test_truncated_operand() {
        let mut bytes = assemble(".code\npush 1\nstop\n").unwrap().bytes;
        bytes.truncate(7);
        assert_eq!(decode(&bytes), Err(DisasmError::Truncated { offset: 5 }));
    }

    #[test]
    fn test_bad_header() {
        assert_eq!(decode(&[1, 2, 3]), Err(DisasmError::BadHeader));
        assert_eq!(disassemble(&[0; 8]).unwrap_err(), DisasmError::BadHeader);
    }
}
