//! The instruction set shared by the assembler, the interpreter, and the
//! JIT translator.
//!
//! Everything that must agree across the three consumers lives here: the
//! opcode numbering, the operand-class masks, the register file layout and
//! the flags constants. Adding an instruction means adding one line to the
//! `instructions!` invocation below; the encoder, decoder and both
//! execution engines pick it up through the same table.

/// Operand-class bits carried by each instruction descriptor.
pub mod class {
    /// Takes no operand.
    pub const NONE: u8 = 0x01;
    /// Numeric immediate (int, float or char literal).
    pub const NUM: u8 = 0x02;
    /// Register operand (one address byte follows the opcode).
    pub const REG: u8 = 0x04;
    /// Memory operand (`[offset-or-label]`, 4-byte address follows).
    pub const MEM: u8 = 0x08;
    /// Label or absolute byte position (4-byte offset follows).
    pub const LABEL: u8 = 0x10;
    /// Accepts a `byte`/`word`/`dword` size keyword.
    pub const SIZE: u8 = 0x20;
    /// Concrete variant of an overloaded mnemonic; never written by hand
    /// and never produced except through overload resolution.
    pub const OVERLOAD: u8 = 0x40;
}

/// Flags register bits. Comparison instructions rewrite the low two bits;
/// integer arithmetic sets [`flags::OVF`] on wrap.
pub mod flags {
    pub const ZERO: u8 = 0x1;
    pub const NEG: u8 = 0x2;
    pub const OVF: u8 = 0x4;
    /// The bits conditional jumps look at.
    pub const CMP_MASK: u8 = 0x3;
}

/// Static instruction descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Insn {
    pub op: Op,
    pub name: &'static str,
    pub code: u8,
    pub classes: u8,
}

macro_rules! instructions {
    ($($variant:ident = $code:literal, $name:literal, $($cls:ident)|+;)*) => {
        /// Every opcode in the instruction set. The discriminant is the
        /// encoded byte value; `stop` doubles as the stream sentinel.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Op {
            $($variant = $code,)*
        }

        impl Op {
            /// Decode an opcode byte.
            pub fn from_u8(byte: u8) -> Option<Op> {
                match byte {
                    $($code => Some(Op::$variant),)*
                    _ => None,
                }
            }

            /// The assembly mnemonic.
            pub fn name(self) -> &'static str {
                match self {
                    $(Op::$variant => $name,)*
                }
            }
        }

        /// The full descriptor table, in opcode order.
        pub static INSTRUCTIONS: &[Insn] = &[
            $(Insn {
                op: Op::$variant,
                name: $name,
                code: $code,
                classes: $(class::$cls)|+,
            },)*
        ];
    };
}

instructions! {
    Stop        = 0x00, "stop",           NONE;
    Err         = 0x01, "err",            NONE;
    Nop         = 0x02, "nop",            NONE;
    Out         = 0x03, "out",            NONE;
    Fout        = 0x04, "fout",           NONE;
    Cout        = 0x05, "cout",           NONE;
    In          = 0x06, "in",             NONE;
    Fin         = 0x07, "fin",            NONE;
    Cin         = 0x08, "cin",            NONE;
    Add         = 0x09, "add",            NONE;
    Sub         = 0x0A, "sub",            NONE;
    Mul         = 0x0B, "mul",            NONE;
    Div         = 0x0C, "div",            NONE;
    Mod         = 0x0D, "mod",            NONE;
    Pow         = 0x0E, "pow",            NONE;
    Fadd        = 0x0F, "fadd",           NONE;
    Fsub        = 0x10, "fsub",           NONE;
    Fmul        = 0x11, "fmul",           NONE;
    Fdiv        = 0x12, "fdiv",           NONE;
    Abs         = 0x13, "abs",            NONE;
    Fabs        = 0x14, "fabs",           NONE;
    Cmp         = 0x15, "cmp",            NONE;
    Fcmp        = 0x16, "fcmp",           NONE;
    Ccmp        = 0x17, "ccmp",           NONE;
    Ret         = 0x18, "ret",            NONE;
    ByteDup     = 0x19, "bytedup",        NONE;
    WordDup     = 0x1A, "worddup",        NONE;
    DwordDup    = 0x1B, "dworddup",       NONE;
    ByteDupd    = 0x1C, "bytedupd",       NONE;
    WordDupd    = 0x1D, "worddupd",       NONE;
    DwordDupd   = 0x1E, "dworddupd",      NONE;
    Push        = 0x20, "push",           NUM | REG | MEM | SIZE | LABEL;
    PushMemByte = 0x21, "push_mem_byte",  OVERLOAD;
    PushMemWord = 0x22, "push_mem_word",  OVERLOAD;
    PushMemDword = 0x23, "push_mem_dword", OVERLOAD;
    PushRegByte = 0x24, "push_reg_byte",  OVERLOAD;
    PushRegWord = 0x25, "push_reg_word",  OVERLOAD;
    PushRegDword = 0x26, "push_reg_dword", OVERLOAD;
    PushInt     = 0x27, "push_int",       OVERLOAD;
    PushFloat   = 0x28, "push_float",     OVERLOAD;
    PushChar    = 0x29, "push_char",      OVERLOAD;
    Pop         = 0x2A, "pop",            REG | MEM | SIZE;
    PopMemByte  = 0x2B, "pop_mem_byte",   OVERLOAD;
    PopMemWord  = 0x2C, "pop_mem_word",   OVERLOAD;
    PopMemDword = 0x2D, "pop_mem_dword",  OVERLOAD;
    PopRegByte  = 0x2E, "pop_reg_byte",   OVERLOAD;
    PopRegWord  = 0x2F, "pop_reg_word",   OVERLOAD;
    PopRegDword = 0x30, "pop_reg_dword",  OVERLOAD;
    Ja          = 0x31, "ja",             LABEL;
    Jae         = 0x32, "jae",            LABEL;
    Jb          = 0x33, "jb",             LABEL;
    Jbe         = 0x34, "jbe",            LABEL;
    Je          = 0x35, "je",             LABEL;
    Jne         = 0x36, "jne",            LABEL;
    Jmp         = 0x37, "jmp",            LABEL;
    Call        = 0x38, "call",           LABEL;
}

impl Op {
    /// Number of operand bytes following the opcode in the stream.
    pub fn operand_len(self) -> usize {
        match self {
            Op::PushMemByte
            | Op::PushMemWord
            | Op::PushMemDword
            | Op::PopMemByte
            | Op::PopMemWord
            | Op::PopMemDword
            | Op::PushInt
            | Op::PushFloat
            | Op::Ja
            | Op::Jae
            | Op::Jb
            | Op::Jbe
            | Op::Je
            | Op::Jne
            | Op::Jmp
            | Op::Call => 4,
            Op::PushRegByte
            | Op::PushRegWord
            | Op::PushRegDword
            | Op::PopRegByte
            | Op::PopRegWord
            | Op::PopRegDword
            | Op::PushChar => 1,
            _ => 0,
        }
    }
}

/// Look up a descriptor by opcode byte.
pub fn lookup(code: u8) -> Option<&'static Insn> {
    INSTRUCTIONS.iter().find(|i| i.code == code)
}

/// Look up a descriptor by mnemonic. Overloaded variants resolve too, so
/// binary listings can be fed back through the assembler.
pub fn lookup_name(name: &str) -> Option<&'static Insn> {
    INSTRUCTIONS.iter().find(|i| i.name == name)
}

/// Program image header: `jmp` opcode plus a 4-byte entry-point offset.
pub const HEADER_SIZE: usize = 5;

/// Operand width selected by a size keyword or a register name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte = 1,
    Word = 2,
    Dword = 4,
}

impl Width {
    pub fn bytes(self) -> usize {
        self as usize
    }

    /// Parse a `byte`/`word`/`dword` size keyword.
    pub fn from_keyword(word: &str) -> Option<Width> {
        match word {
            "byte" => Some(Width::Byte),
            "word" => Some(Width::Word),
            "dword" => Some(Width::Dword),
            _ => None,
        }
    }
}

/// Number of general-purpose registers.
pub const REG_COUNT: usize = 8;
/// Width of one register in bytes.
pub const REG_WIDTH: usize = 4;
/// Total size of the register file in bytes.
pub const REG_FILE_SIZE: usize = REG_COUNT * REG_WIDTH;
/// Byte address of `esp` within the register file. The VM mirrors the
/// operand stack pointer here.
pub const ESP: u8 = 4 * REG_WIDTH as u8;

/// A named view into the register file.
#[derive(Debug, Clone, Copy)]
pub struct RegDef {
    pub name: &'static str,
    /// Byte address within the 32-byte register file.
    pub addr: u8,
    pub width: Width,
}

macro_rules! registers {
    ($($name:literal : $index:literal, $width:ident;)*) => {
        /// All addressable register views, dword first, then word and byte
        /// sub-registers of the same file.
        pub static REGISTERS: &[RegDef] = &[
            $(RegDef {
                name: $name,
                addr: $index * REG_WIDTH as u8,
                width: Width::$width,
            },)*
        ];
    };
}

registers! {
    "eax": 0, Dword;  "ecx": 1, Dword;  "edx": 2, Dword;  "ebx": 3, Dword;
    "esp": 4, Dword;  "ebp": 5, Dword;  "esi": 6, Dword;  "edi": 7, Dword;
    "ax": 0, Word;    "cx": 1, Word;    "dx": 2, Word;    "bx": 3, Word;
    "sp": 4, Word;    "bp": 5, Word;    "si": 6, Word;    "di": 7, Word;
    "al": 0, Byte;    "cl": 1, Byte;    "dl": 2, Byte;    "bl": 3, Byte;
    "spl": 4, Byte;   "bpl": 5, Byte;   "sil": 6, Byte;   "dil": 7, Byte;
}

/// Look up a register by name.
pub fn register(name: &str) -> Option<&'static RegDef> {
    REGISTERS.iter().find(|r| r.name == name)
}

/// Reverse lookup for the disassembler: register name from address + width.
pub fn register_name(addr: u8, width: Width) -> Option<&'static str> {
    REGISTERS
        .iter()
        .find(|r| r.addr == addr && r.width == width)
        .map(|r| r.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcodes_are_unique() {
        for (i, a) in INSTRUCTIONS.iter().enumerate() {
            for b in &INSTRUCTIONS[i + 1..] {
                assert_ne!(a.code, b.code, "{} and {} share a code", a.name, b.name);
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn test_roundtrip_through_table() {
        for insn in INSTRUCTIONS {
            assert_eq!(Op::from_u8(insn.code), Some(insn.op));
            assert_eq!(lookup_name(insn.name).unwrap().code, insn.code);
            assert_eq!(insn.op.name(), insn.name);
        }
    }

    #[test]
    fn test_stop_is_sentinel() {
        assert_eq!(Op::Stop as u8, 0);
    }

    #[test]
    fn test_operand_lengths_match_classes() {
        // Only operand-class instructions carry bytes after the opcode.
        for insn in INSTRUCTIONS {
            if insn.classes == class::NONE {
                assert_eq!(insn.op.operand_len(), 0, "{}", insn.name);
            }
        }
    }

    #[test]
    fn test_register_lookup() {
        let eax = register("eax").unwrap();
        assert_eq!(eax.addr, 0);
        assert_eq!(eax.width, Width::Dword);
        let bpl = register("bpl").unwrap();
        assert_eq!(bpl.addr, 20);
        assert_eq!(bpl.width, Width::Byte);
        assert_eq!(register_name(20, Width::Byte), Some("bpl"));
        assert!(register("rax").is_none());
    }
}
