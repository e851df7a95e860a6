//! Line-oriented encoding shared by both assembler passes.

use super::labels::{Define, LabelTable};
use super::{AsmError, AsmErrorKind, Program};
use crate::isa::{self, Op, Width, class};

/// Which pass is running. Discovery suppresses label-resolution failures
/// (forward references are still blank) and its result is thrown away;
/// emission is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Pass {
    Discover,
    Emit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Data,
    Code,
}

/// A literal classified by shape: a dot makes a float, single quotes make
/// a char, anything else must parse as a signed integer.
#[derive(Debug, Clone, Copy)]
enum Literal {
    Int(i32),
    Float(f32),
    Char(u8),
}

impl Literal {
    fn parse(text: &str) -> Option<Literal> {
        if let Some(inner) = text.strip_prefix('\'') {
            let inner = inner.strip_suffix('\'')?;
            let c = match inner {
                "\\n" => b'\n',
                "\\t" => b'\t',
                "\\0" => 0,
                "\\\\" => b'\\',
                "\\'" => b'\'',
                " " => b' ',
                _ => {
                    let mut chars = inner.chars();
                    let c = chars.next()?;
                    if chars.next().is_some() || !c.is_ascii() {
                        return None;
                    }
                    c as u8
                }
            };
            Some(Literal::Char(c))
        } else if text.contains('.') {
            text.parse::<f32>().ok().map(Literal::Float)
        } else {
            text.parse::<i32>().ok().map(Literal::Int)
        }
    }

    /// Natural width: floats are always a dword, ints take the smallest
    /// width that holds the value.
    fn width(&self) -> usize {
        match *self {
            Literal::Char(_) => 1,
            Literal::Float(_) => 4,
            Literal::Int(v) if (-128..=255).contains(&v) => 1,
            Literal::Int(v) if (-32768..=65535).contains(&v) => 2,
            Literal::Int(_) => 4,
        }
    }
}

struct Encoder<'a> {
    table: &'a mut LabelTable,
    pass: Pass,
    out: Vec<u8>,
    entry: Option<u32>,
    section: Section,
    seen_data: bool,
    line: u32,
}

pub(super) fn run_pass(
    source: &str,
    table: &mut LabelTable,
    pass: Pass,
) -> Result<Program, AsmError> {
    let mut enc = Encoder {
        table,
        pass,
        out: vec![0; isa::HEADER_SIZE],
        entry: None,
        section: Section::None,
        seen_data: false,
        line: 0,
    };

    for (index, raw) in source.lines().enumerate() {
        enc.line = index as u32 + 1;
        if let Err(kind) = enc.statement(raw) {
            enc.out.push(Op::Err as u8);
            return Err(AsmError {
                line: enc.line,
                kind,
                partial: enc.out,
            });
        }
    }

    let Some(entry) = enc.entry else {
        enc.out.push(Op::Err as u8);
        return Err(AsmError {
            line: enc.line.max(1),
            kind: AsmErrorKind::MissingCodeSection,
            partial: enc.out,
        });
    };

    enc.out.push(Op::Stop as u8);
    enc.out[0] = Op::Jmp as u8;
    enc.out[1..isa::HEADER_SIZE].copy_from_slice(&entry.to_le_bytes());

    let labels = enc
        .table
        .iter()
        .filter(|l| l.counter == 2)
        .filter_map(|l| l.offset.map(|o| (l.name.clone(), o)))
        .collect();

    Ok(Program {
        bytes: enc.out,
        entry,
        labels,
    })
}

impl Encoder<'_> {
    fn statement(&mut self, raw: &str) -> Result<(), AsmErrorKind> {
        let text = match raw.find(';') {
            Some(i) => &raw[..i],
            None => raw,
        };
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(());
        }

        match tokens[0] {
            ".data" => {
                if tokens.len() > 1 {
                    return Err(AsmErrorKind::OperandMismatch(
                        "tokens after .data marker".to_string(),
                    ));
                }
                if self.entry.is_some() {
                    return Err(AsmErrorKind::DataAfterCode);
                }
                if self.seen_data {
                    return Err(AsmErrorKind::DuplicateSection(".data"));
                }
                self.seen_data = true;
                self.section = Section::Data;
                Ok(())
            }
            ".code" => {
                if tokens.len() > 1 {
                    return Err(AsmErrorKind::OperandMismatch(
                        "tokens after .code marker".to_string(),
                    ));
                }
                if self.entry.is_some() {
                    return Err(AsmErrorKind::DuplicateSection(".code"));
                }
                self.entry = Some(self.out.len() as u32);
                self.section = Section::Code;
                Ok(())
            }
            _ => match self.section {
                Section::None => Err(AsmErrorKind::InstructionOutsideSection),
                Section::Data => self.data_entry(&tokens),
                Section::Code => self.code_line(&tokens),
            },
        }
    }

    /// `name: <byte|word|dword> <literal|raw>`
    fn data_entry(&mut self, tokens: &[&str]) -> Result<(), AsmErrorKind> {
        let Some(name) = tokens[0].strip_suffix(':').filter(|n| !n.is_empty()) else {
            return Err(AsmErrorKind::OperandMismatch(
                "data entry must start with `name:`".to_string(),
            ));
        };
        self.define_label(name)?;

        let (Some(size), 3) = (
            tokens.get(1).and_then(|t| Width::from_keyword(t)),
            tokens.len(),
        ) else {
            return Err(AsmErrorKind::OperandMismatch(
                "expected `name: <size> <value|raw>`".to_string(),
            ));
        };

        if tokens[2] == "raw" {
            self.out.extend(std::iter::repeat_n(0u8, size.bytes()));
            return Ok(());
        }

        let Some(literal) = Literal::parse(tokens[2]) else {
            return Err(AsmErrorKind::BadLiteral(tokens[2].to_string()));
        };
        if literal.width() > size.bytes() {
            return Err(AsmErrorKind::LiteralTooWide(name.to_string()));
        }
        let bytes = match literal {
            Literal::Int(v) => v.to_le_bytes(),
            Literal::Float(v) => v.to_bits().to_le_bytes(),
            Literal::Char(c) => [c, 0, 0, 0],
        };
        self.out.extend_from_slice(&bytes[..size.bytes()]);
        Ok(())
    }

    fn code_line(&mut self, tokens: &[&str]) -> Result<(), AsmErrorKind> {
        let mut idx = 0;
        while idx < tokens.len() {
            let Some(name) = tokens[idx].strip_suffix(':').filter(|n| !n.is_empty()) else {
                break;
            };
            self.define_label(name)?;
            idx += 1;
        }
        if idx == tokens.len() {
            return Ok(());
        }

        let Some(insn) = isa::lookup_name(tokens[idx]) else {
            return Err(AsmErrorKind::UnknownInstruction(tokens[idx].to_string()));
        };
        let operands = &tokens[idx + 1..];

        match insn.op {
            Op::Push => self.push_overload(operands),
            Op::Pop => self.pop_overload(operands),
            _ if insn.classes & class::LABEL != 0 => {
                let [target] = operands else {
                    return Err(AsmErrorKind::OperandMismatch(format!(
                        "{} takes one label or offset",
                        insn.name
                    )));
                };
                let offset = self.target(target)?;
                self.out.push(insn.code);
                self.out.extend_from_slice(&offset.to_le_bytes());
                Ok(())
            }
            _ if insn.classes & class::OVERLOAD != 0 => self.concrete(insn.op, operands),
            _ => {
                if !operands.is_empty() {
                    return Err(AsmErrorKind::OperandMismatch(format!(
                        "{} takes no operand",
                        insn.name
                    )));
                }
                self.out.push(insn.code);
                Ok(())
            }
        }
    }

    fn define_label(&mut self, name: &str) -> Result<(), AsmErrorKind> {
        match self.table.define(name, self.out.len() as u32) {
            Define::Ok => Ok(()),
            Define::Redefined => Err(AsmErrorKind::RedefinedLabel(name.to_string())),
        }
    }

    /// A jump/call target: a decimal byte offset or a label.
    fn target(&mut self, token: &str) -> Result<u32, AsmErrorKind> {
        if let Ok(offset) = token.parse::<u32>() {
            return Ok(offset);
        }
        match self.table.reference(token) {
            Some(offset) => Ok(offset),
            // Forward references are blanks in the discovery pass; the
            // emission pass sees the discovered offset or a real error.
            None if self.pass == Pass::Discover => Ok(u32::MAX),
            None => Err(AsmErrorKind::UnresolvedLabel(token.to_string())),
        }
    }

    /// `[decimal-offset]` or `[label]`.
    fn mem_operand(&mut self, token: &str) -> Result<Option<u32>, AsmErrorKind> {
        let Some(inner) = token
            .strip_prefix('[')
            .and_then(|t| t.strip_suffix(']'))
            .filter(|t| !t.is_empty())
        else {
            return Ok(None);
        };
        Ok(Some(self.target(inner)?))
    }

    fn push_overload(&mut self, operands: &[&str]) -> Result<(), AsmErrorKind> {
        match operands {
            [one] => {
                if let Some(reg) = isa::register(one) {
                    return self.emit_reg(push_reg(reg.width), reg.addr);
                }
                if let Some(addr) = self.mem_operand(one)? {
                    return self.emit_mem(push_mem(Width::Dword), addr);
                }
                if let Some(literal) = Literal::parse(one) {
                    return self.emit_literal(literal);
                }
                // Bare identifier: push the label's byte offset.
                let offset = self.target(one)?;
                self.out.push(Op::PushInt as u8);
                self.out.extend_from_slice(&offset.to_le_bytes());
                Ok(())
            }
            [size, mem] => {
                let (Some(width), Some(addr)) =
                    (Width::from_keyword(size), self.mem_operand(mem)?)
                else {
                    return Err(AsmErrorKind::OperandMismatch(
                        "push with two operands needs `<size> [addr]`".to_string(),
                    ));
                };
                self.emit_mem(push_mem(width), addr)
            }
            _ => Err(AsmErrorKind::OperandMismatch(
                "push needs an operand".to_string(),
            )),
        }
    }

    fn pop_overload(&mut self, operands: &[&str]) -> Result<(), AsmErrorKind> {
        match operands {
            [one] => {
                if let Some(reg) = isa::register(one) {
                    return self.emit_reg(pop_reg(reg.width), reg.addr);
                }
                if let Some(addr) = self.mem_operand(one)? {
                    return self.emit_mem(pop_mem(Width::Dword), addr);
                }
                Err(AsmErrorKind::OperandMismatch(
                    "pop needs a register or memory operand".to_string(),
                ))
            }
            [size, mem] => {
                let (Some(width), Some(addr)) =
                    (Width::from_keyword(size), self.mem_operand(mem)?)
                else {
                    return Err(AsmErrorKind::OperandMismatch(
                        "pop with two operands needs `<size> [addr]`".to_string(),
                    ));
                };
                self.emit_mem(pop_mem(width), addr)
            }
            _ => Err(AsmErrorKind::OperandMismatch(
                "pop needs an operand".to_string(),
            )),
        }
    }

    /// Concrete overload mnemonics, accepted so a disassembly listing can
    /// be reassembled verbatim.
    fn concrete(&mut self, op: Op, operands: &[&str]) -> Result<(), AsmErrorKind> {
        let mismatch = |what: &str| AsmErrorKind::OperandMismatch(format!("expected {}", what));
        match (op, operands) {
            (Op::PushInt, [one]) => {
                let offset = match Literal::parse(one) {
                    Some(Literal::Int(v)) => v as u32,
                    Some(_) => return Err(mismatch("an integer literal")),
                    None => self.target(one)?,
                };
                self.out.push(op as u8);
                self.out.extend_from_slice(&offset.to_le_bytes());
                Ok(())
            }
            (Op::PushFloat, [one]) => match one.parse::<f32>() {
                Ok(v) => {
                    self.out.push(op as u8);
                    self.out.extend_from_slice(&v.to_bits().to_le_bytes());
                    Ok(())
                }
                Err(_) => Err(AsmErrorKind::BadLiteral(one.to_string())),
            },
            (Op::PushChar, [one]) => match Literal::parse(one) {
                Some(Literal::Char(c)) => {
                    self.out.push(op as u8);
                    self.out.push(c);
                    Ok(())
                }
                _ => Err(mismatch("a char literal")),
            },
            (
                Op::PushRegByte | Op::PushRegWord | Op::PushRegDword | Op::PopRegByte
                | Op::PopRegWord | Op::PopRegDword,
                [one],
            ) => match isa::register(one) {
                Some(reg) if Some(op) == reg_variant(op, reg.width) => {
                    self.emit_reg(op, reg.addr)
                }
                _ => Err(mismatch("a register of the matching width")),
            },
            (
                Op::PushMemByte | Op::PushMemWord | Op::PushMemDword | Op::PopMemByte
                | Op::PopMemWord | Op::PopMemDword,
                [one],
            ) => match self.mem_operand(one)? {
                Some(addr) => self.emit_mem(op, addr),
                None => Err(mismatch("a memory operand")),
            },
            _ => Err(mismatch("a single operand")),
        }
    }

    fn emit_reg(&mut self, op: Op, addr: u8) -> Result<(), AsmErrorKind> {
        self.out.push(op as u8);
        self.out.push(addr);
        Ok(())
    }

    fn emit_mem(&mut self, op: Op, addr: u32) -> Result<(), AsmErrorKind> {
        self.out.push(op as u8);
        self.out.extend_from_slice(&addr.to_le_bytes());
        Ok(())
    }

    fn emit_literal(&mut self, literal: Literal) -> Result<(), AsmErrorKind> {
        match literal {
            Literal::Int(v) => {
                self.out.push(Op::PushInt as u8);
                self.out.extend_from_slice(&v.to_le_bytes());
            }
            Literal::Float(v) => {
                self.out.push(Op::PushFloat as u8);
                self.out.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Literal::Char(c) => {
                self.out.push(Op::PushChar as u8);
                self.out.push(c);
            }
        }
        Ok(())
    }
}

fn push_reg(width: Width) -> Op {
    match width {
        Width::Byte => Op::PushRegByte,
        Width::Word => Op::PushRegWord,
        Width::Dword => Op::PushRegDword,
    }
}

fn pop_reg(width: Width) -> Op {
    match width {
        Width::Byte => Op::PopRegByte,
        Width::Word => Op::PopRegWord,
        Width::Dword => Op::PopRegDword,
    }
}

fn push_mem(width: Width) -> Op {
    match width {
        Width::Byte => Op::PushMemByte,
        Width::Word => Op::PushMemWord,
        Width::Dword => Op::PushMemDword,
    }
}

fn pop_mem(width: Width) -> Op {
    match width {
        Width::Byte => Op::PopMemByte,
        Width::Word => Op::PopMemWord,
        Width::Dword => Op::PopMemDword,
    }
}

/// The register-operand variant of `op`'s family for the given width.
fn reg_variant(op: Op, width: Width) -> Option<Op> {
    match op {
        Op::PushRegByte | Op::PushRegWord | Op::PushRegDword => Some(push_reg(width)),
        Op::PopRegByte | Op::PopRegWord | Op::PopRegDword => Some(pop_reg(width)),
        _ => None,
    }
}
