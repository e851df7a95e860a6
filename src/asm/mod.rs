//! Two-pass assembler: text source in, binary instruction stream out.
//!
//! The first pass walks the whole source with diagnostics suppressed to
//! discover label offsets; the second pass re-runs the identical encoding
//! and is the authoritative one, so every error it reports carries the
//! line number a user can act on. Both passes produce byte-identical
//! output for already-resolvable programs because every encoding has a
//! fixed width regardless of operand values.

mod encoder;
mod labels;

pub use labels::{Label, LabelTable};

use crate::isa;

/// A successfully assembled program.
#[derive(Debug, Clone)]
pub struct Program {
    /// The full stream: header, data section, code, sentinel `stop`.
    pub bytes: Vec<u8>,
    /// Byte offset of the first code instruction.
    pub entry: u32,
    /// Resolved labels, in definition order.
    pub labels: Vec<(String, u32)>,
}

/// What went wrong, without position information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsmErrorKind {
    UnknownInstruction(String),
    BadLiteral(String),
    /// Operand shape does not fit the mnemonic.
    OperandMismatch(String),
    /// Data entry declares a size smaller than its literal's type.
    LiteralTooWide(String),
    RedefinedLabel(String),
    UnresolvedLabel(String),
    MissingCodeSection,
    InstructionOutsideSection,
    DataAfterCode,
    DuplicateSection(&'static str),
}

/// An assembly failure. The partial output ends with an error-opcode byte
/// at the failure point, so inspecting the truncated stream locates the
/// fault even without the message.
#[derive(Debug, Clone)]
pub struct AsmError {
    pub line: u32,
    pub kind: AsmErrorKind,
    pub partial: Vec<u8>,
}

impl std::fmt::Display for AsmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: ", self.line)?;
        match &self.kind {
            AsmErrorKind::UnknownInstruction(name) => {
                write!(f, "unknown instruction `{}`", name)
            }
            AsmErrorKind::BadLiteral(text) => write!(f, "malformed literal `{}`", text),
            AsmErrorKind::OperandMismatch(msg) => write!(f, "{}", msg),
            AsmErrorKind::LiteralTooWide(name) => {
                write!(f, "literal does not fit declared size of `{}`", name)
            }
            AsmErrorKind::RedefinedLabel(name) => {
                write!(f, "label `{}` redefined at a different offset", name)
            }
            AsmErrorKind::UnresolvedLabel(name) => write!(f, "unresolved label `{}`", name),
            AsmErrorKind::MissingCodeSection => write!(f, "program has no .code section"),
            AsmErrorKind::InstructionOutsideSection => {
                write!(f, "statement before any section marker")
            }
            AsmErrorKind::DataAfterCode => write!(f, ".data must precede .code"),
            AsmErrorKind::DuplicateSection(name) => write!(f, "duplicate {} section", name),
        }
    }
}

impl std::error::Error for AsmError {}

/// Assemble a source text into a binary program.
pub fn assemble(source: &str) -> Result<Program, AsmError> {
    let mut table = LabelTable::new();
    // Discovery pass. Its failure is irrelevant: the emission pass hits
    // the same fault first and reports it with proper diagnostics.
    let _ = encoder::run_pass(source, &mut table, encoder::Pass::Discover);
    encoder::run_pass(source, &mut table, encoder::Pass::Emit)
}

/// Render the header of an assembled stream, used by the interpreter and
/// the translator to validate input before touching the body.
pub fn read_header(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < isa::HEADER_SIZE {
        return None;
    }
    if bytes[0] != isa::Op::Jmp as u8 {
        return None;
    }
    let entry = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    if (entry as usize) < isa::HEADER_SIZE || entry as usize >= bytes.len() {
        return None;
    }
    Some(entry)
}
