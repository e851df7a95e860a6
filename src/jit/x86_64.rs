//! x86-64 sequences for every opcode.
//!
//! Register conventions for generated code:
//! - `rsp` is the operand stack; pushes and pops move it by the operand
//!   width, byte-granular just like the interpreter's stack.
//! - `r14` holds the executable region's base address; every jump, call
//!   and memory operand goes through `lea r13, [r14 + disp32]`.
//! - `r12d` holds the last comparison's materialized result (-1/0/1),
//!   standing in for the interpreter's flags register. It starts at 1
//!   ("greater", no flag set) to match the interpreter's zeroed flags.
//! - `r13`, `r15`, `r11` are scratch, dead across instruction boundaries.
//! - `r10` keeps the host's `rsp` for the epilogue, since the guest owns
//!   `rsp` meanwhile.
//! - Guest registers eax..edi live in the host registers of the same name.
//!
//! Every sequence has a fixed length for a given opcode and operand width,
//! which is what lets the first translation pass compute the offset map
//! with blank targets.

use super::codebuf::{CodeBuf, RelocKind};
use crate::isa::Width;

/// Conditional-jump kinds over the materialized compare result.
#[derive(Debug, Clone, Copy)]
pub(super) enum Cond {
    /// taken when r12d > 0 (no flag set)
    Above,
    /// taken when r12d >= 0 (NEG clear)
    AboveEqual,
    /// taken when r12d < 0 (NEG set)
    Below,
    /// taken when r12d <= 0 (some flag set)
    BelowEqual,
    /// taken when r12d == 0 (ZERO set)
    Equal,
    /// taken when r12d != 0 (ZERO clear)
    NotEqual,
}

impl Cond {
    /// The jcc opcode that *skips* the jump block when the condition does
    /// not hold.
    fn inverted_jcc(self) -> u8 {
        match self {
            Cond::Above => 0x7E,      // jle
            Cond::AboveEqual => 0x7C, // jl
            Cond::Below => 0x7D,      // jge
            Cond::BelowEqual => 0x7F, // jg
            Cond::Equal => 0x75,      // jne
            Cond::NotEqual => 0x74,   // je
        }
    }
}

/// Integer binary ops sharing the pop/pop/op/store template.
#[derive(Debug, Clone, Copy)]
pub(super) enum IntOp {
    Add,
    Sub,
    Mul,
}

/// Float binary ops, by their scalar-single opcode byte.
#[derive(Debug, Clone, Copy)]
pub(super) enum FloatOp {
    Add = 0x58,
    Sub = 0x5C,
    Mul = 0x59,
    Div = 0x5E,
}

pub(super) struct Asm<'a> {
    buf: &'a mut CodeBuf,
}

impl Asm<'_> {
    pub fn new(buf: &mut CodeBuf) -> Asm<'_> {
        Asm { buf }
    }

    /// Current emission offset.
    pub fn offset(&self) -> u32 {
        self.buf.len() as u32
    }

    /// Raw bytes, for the data section copied into the image verbatim.
    pub fn emit_raw(&mut self, bytes: &[u8]) {
        self.buf.emit_bytes(bytes);
    }

    /// Save callee-saved registers, stash the host stack pointer, zero the
    /// guest registers, seed the compare result, and load the region base.
    pub fn prologue(&mut self) {
        self.buf.emit_u8(0x55); // push rbp
        self.buf.emit_u8(0x53); // push rbx
        self.buf.emit_bytes(&[0x41, 0x54]); // push r12
        self.buf.emit_bytes(&[0x41, 0x55]); // push r13
        self.buf.emit_bytes(&[0x41, 0x56]); // push r14
        self.buf.emit_bytes(&[0x41, 0x57]); // push r15
        self.buf.emit_bytes(&[0x49, 0x89, 0xE2]); // mov r10, rsp
        // The interpreter starts from a zeroed register file; so does the
        // guest (rsp excluded, it carries the operand stack).
        self.buf.emit_bytes(&[0x31, 0xC0]); // xor eax, eax
        self.buf.emit_bytes(&[0x31, 0xC9]); // xor ecx, ecx
        self.buf.emit_bytes(&[0x31, 0xD2]); // xor edx, edx
        self.buf.emit_bytes(&[0x31, 0xDB]); // xor ebx, ebx
        self.buf.emit_bytes(&[0x31, 0xED]); // xor ebp, ebp
        self.buf.emit_bytes(&[0x31, 0xF6]); // xor esi, esi
        self.buf.emit_bytes(&[0x31, 0xFF]); // xor edi, edi
        self.buf.emit_bytes(&[0x41, 0xBC, 1, 0, 0, 0]); // mov r12d, 1
        self.buf.emit_bytes(&[0x49, 0xBE]); // movabs r14, <base>
        self.buf.reloc_u64(RelocKind::Base);
    }

    /// Restore the host stack and callee-saved registers, return.
    pub fn epilogue(&mut self) {
        self.buf.emit_bytes(&[0x4C, 0x89, 0xD4]); // mov rsp, r10
        self.buf.emit_bytes(&[0x41, 0x5F]); // pop r15
        self.buf.emit_bytes(&[0x41, 0x5E]); // pop r14
        self.buf.emit_bytes(&[0x41, 0x5D]); // pop r13
        self.buf.emit_bytes(&[0x41, 0x5C]); // pop r12
        self.buf.emit_u8(0x5B); // pop rbx
        self.buf.emit_u8(0x5D); // pop rbp
        self.buf.emit_u8(0xC3); // ret
    }

    /// Unconditional transfer to a native offset. 10 bytes.
    pub fn jump_to(&mut self, native: u32) {
        self.buf.emit_bytes(&[0x4D, 0x8D, 0xAE]); // lea r13, [r14 + disp32]
        self.buf.emit_u32(native);
        self.buf.emit_bytes(&[0x41, 0xFF, 0xE5]); // jmp r13
    }

    /// Conditional transfer testing the materialized compare result.
    pub fn cond_jump_to(&mut self, cond: Cond, native: u32) {
        self.buf.emit_bytes(&[0x41, 0x83, 0xFC, 0x00]); // cmp r12d, 0
        self.buf.emit_bytes(&[cond.inverted_jcc(), 0x0A]); // skip the jump block
        self.jump_to(native);
    }

    pub fn push_imm32(&mut self, value: u32) {
        self.sub_rsp(4);
        self.buf.emit_bytes(&[0xC7, 0x04, 0x24]); // mov dword [rsp], imm32
        self.buf.emit_u32(value);
    }

    pub fn push_imm8(&mut self, value: u8) {
        self.sub_rsp(1);
        self.buf.emit_bytes(&[0xC6, 0x04, 0x24, value]); // mov byte [rsp], imm8
    }

    /// Push a guest register. `idx` is the register number 0..8.
    pub fn push_reg(&mut self, idx: u8, width: Width) {
        self.sub_rsp(width.bytes() as u8);
        let modrm = 0x04 | (idx << 3); // [rsp] via SIB
        match width {
            Width::Dword => self.buf.emit_bytes(&[0x89, modrm, 0x24]),
            Width::Word => self.buf.emit_bytes(&[0x66, 0x89, modrm, 0x24]),
            Width::Byte => {
                if idx >= 4 {
                    self.buf.emit_u8(0x40); // REX for spl/bpl/sil/dil
                }
                self.buf.emit_bytes(&[0x88, modrm, 0x24]);
            }
        }
    }

    /// Pop into a guest register.
    pub fn pop_reg(&mut self, idx: u8, width: Width) {
        let modrm = 0x04 | (idx << 3); // [rsp] via SIB
        match width {
            Width::Dword => self.buf.emit_bytes(&[0x8B, modrm, 0x24]),
            Width::Word => self.buf.emit_bytes(&[0x66, 0x8B, modrm, 0x24]),
            Width::Byte => {
                if idx >= 4 {
                    self.buf.emit_u8(0x40); // REX for spl/bpl/sil/dil
                }
                self.buf.emit_bytes(&[0x8A, modrm, 0x24]);
            }
        }
        self.add_rsp(width.bytes() as u8);
    }

    /// Push from `[r14 + native]`.
    pub fn push_mem(&mut self, width: Width, native: u32) {
        match width {
            Width::Dword => self.buf.emit_bytes(&[0x45, 0x8B, 0xAE]), // mov r13d, [r14+d32]
            Width::Word => self.buf.emit_bytes(&[0x66, 0x45, 0x8B, 0xAE]),
            Width::Byte => self.buf.emit_bytes(&[0x45, 0x8A, 0xAE]),
        }
        self.buf.emit_u32(native);
        self.sub_rsp(width.bytes() as u8);
        self.store_r13_to_rsp(width);
    }

    /// Pop to `[r14 + native]`.
    pub fn pop_mem(&mut self, width: Width, native: u32) {
        self.load_r13_from_rsp(width);
        self.add_rsp(width.bytes() as u8);
        match width {
            Width::Dword => self.buf.emit_bytes(&[0x45, 0x89, 0xAE]), // mov [r14+d32], r13d
            Width::Word => self.buf.emit_bytes(&[0x66, 0x45, 0x89, 0xAE]),
            Width::Byte => self.buf.emit_bytes(&[0x45, 0x88, 0xAE]),
        }
        self.buf.emit_u32(native);
    }

    /// top `op` prev, the result replacing prev's slot.
    pub fn int_binary(&mut self, op: IntOp) {
        self.load_r13_from_rsp(Width::Dword); // t
        self.add_rsp(4);
        self.buf.emit_bytes(&[0x44, 0x8B, 0x3C, 0x24]); // mov r15d, [rsp] ; p
        match op {
            IntOp::Add => self.buf.emit_bytes(&[0x45, 0x01, 0xFD]), // add r13d, r15d
            IntOp::Sub => self.buf.emit_bytes(&[0x45, 0x29, 0xFD]), // sub r13d, r15d
            IntOp::Mul => self.buf.emit_bytes(&[0x45, 0x0F, 0xAF, 0xEF]), // imul r13d, r15d
        }
        self.store_r13_to_rsp(Width::Dword);
    }

    /// idiv needs eax/edx, which belong to the guest; both are preserved.
    /// A zero divisor diverts to the fault stub instead of raising SIGFPE,
    /// and INT_MIN / -1 (which idiv also traps on) short-circuits to the
    /// wrapped result: the dividend for div, zero for mod.
    pub fn int_divide(&mut self, remainder: bool, fault_stub: u32) {
        self.load_r13_from_rsp(Width::Dword); // t
        self.add_rsp(4);
        self.buf.emit_bytes(&[0x44, 0x8B, 0x3C, 0x24]); // mov r15d, [rsp] ; p
        self.buf.emit_bytes(&[0x45, 0x85, 0xFF]); // test r15d, r15d
        self.buf.emit_bytes(&[0x75, 0x0A]); // jne past the stub jump
        self.jump_to(fault_stub);
        let to_div: u8 = if remainder { 0x0E } else { 0x0B };
        self.buf.emit_bytes(&[0x41, 0x83, 0xFF, 0xFF]); // cmp r15d, -1
        self.buf.emit_bytes(&[0x75, to_div]); // jne divide
        self.buf.emit_bytes(&[0x41, 0x81, 0xFD]); // cmp r13d, INT_MIN
        self.buf.emit_u32(0x8000_0000);
        self.buf.emit_bytes(&[0x75, if remainder { 0x05 } else { 0x02 }]); // jne divide
        if remainder {
            self.buf.emit_bytes(&[0x45, 0x31, 0xED]); // xor r13d, r13d
        }
        self.buf.emit_bytes(&[0xEB, 0x12]); // jmp store; r13d keeps t for div
        self.buf.emit_bytes(&[0x49, 0x89, 0xC3]); // divide: mov r11, rax
        self.buf.emit_u8(0x52); // push rdx
        self.buf.emit_bytes(&[0x44, 0x89, 0xE8]); // mov eax, r13d
        self.buf.emit_u8(0x99); // cdq
        self.buf.emit_bytes(&[0x41, 0xF7, 0xFF]); // idiv r15d
        if remainder {
            self.buf.emit_bytes(&[0x41, 0x89, 0xD5]); // mov r13d, edx
        } else {
            self.buf.emit_bytes(&[0x41, 0x89, 0xC5]); // mov r13d, eax
        }
        self.buf.emit_u8(0x5A); // pop rdx
        self.buf.emit_bytes(&[0x4C, 0x89, 0xD8]); // mov rax, r11
        self.store_r13_to_rsp(Width::Dword); // store:
    }

    /// t ** max(p, 0) by iterated multiply; wraps like the interpreter.
    pub fn int_pow(&mut self) {
        self.load_r13_from_rsp(Width::Dword); // t, the base
        self.add_rsp(4);
        self.buf.emit_bytes(&[0x44, 0x8B, 0x3C, 0x24]); // mov r15d, [rsp] ; exponent
        self.buf.emit_bytes(&[0x41, 0xBB, 1, 0, 0, 0]); // mov r11d, 1
        self.buf.emit_bytes(&[0x45, 0x85, 0xFF]); // loop: test r15d, r15d
        self.buf.emit_bytes(&[0x7E, 0x09]); // jle done
        self.buf.emit_bytes(&[0x45, 0x0F, 0xAF, 0xDD]); // imul r11d, r13d
        self.buf.emit_bytes(&[0x41, 0xFF, 0xCF]); // dec r15d
        self.buf.emit_bytes(&[0xEB, 0xF2]); // jmp loop
        self.buf.emit_bytes(&[0x44, 0x89, 0x1C, 0x24]); // done: mov [rsp], r11d
    }

    pub fn int_abs(&mut self) {
        self.load_r13_from_rsp(Width::Dword);
        self.buf.emit_bytes(&[0x45, 0x85, 0xED]); // test r13d, r13d
        self.buf.emit_bytes(&[0x79, 0x03]); // jns past the neg
        self.buf.emit_bytes(&[0x41, 0xF7, 0xDD]); // neg r13d
        self.store_r13_to_rsp(Width::Dword);
    }

    pub fn float_binary(&mut self, op: FloatOp) {
        self.buf.emit_bytes(&[0xF3, 0x0F, 0x10, 0x04, 0x24]); // movss xmm0, [rsp] ; t
        self.add_rsp(4);
        self.buf.emit_bytes(&[0xF3, 0x0F, 0x10, 0x0C, 0x24]); // movss xmm1, [rsp] ; p
        self.buf.emit_bytes(&[0xF3, 0x0F, op as u8, 0xC1]); // opss xmm0, xmm1
        self.buf.emit_bytes(&[0xF3, 0x0F, 0x11, 0x04, 0x24]); // movss [rsp], xmm0
    }

    pub fn float_abs(&mut self) {
        self.buf.emit_bytes(&[0x41, 0xBD]); // mov r13d, 0x7FFFFFFF
        self.buf.emit_u32(0x7FFF_FFFF);
        self.buf.emit_bytes(&[0x44, 0x21, 0x2C, 0x24]); // and [rsp], r13d
    }

    /// Pop t and p, set r12d to sign(t - p): setg/setl for signed ints.
    pub fn compare_int(&mut self) {
        self.buf.emit_bytes(&[0x44, 0x8B, 0x2C, 0x24]); // mov r13d, [rsp] ; t
        self.buf.emit_bytes(&[0x44, 0x8B, 0x7C, 0x24, 0x04]); // mov r15d, [rsp+4] ; p
        self.add_rsp(8);
        self.compare_materialize(
            &[0x45, 0x39, 0xFD], // cmp r13d, r15d
            0x9F,                // setg
            0x9C,                // setl
        );
    }

    /// Float compare via ucomiss; unordered lands in the "below" leg.
    pub fn compare_float(&mut self) {
        self.buf.emit_bytes(&[0xF3, 0x0F, 0x10, 0x04, 0x24]); // movss xmm0, [rsp] ; t
        self.buf.emit_bytes(&[0xF3, 0x0F, 0x10, 0x4C, 0x24, 0x04]); // movss xmm1, [rsp+4] ; p
        self.add_rsp(8);
        self.compare_materialize(
            &[0x0F, 0x2E, 0xC1], // ucomiss xmm0, xmm1
            0x97,                // seta
            0x92,                // setb
        );
    }

    /// Chars compare unsigned.
    pub fn compare_char(&mut self) {
        self.buf.emit_bytes(&[0x44, 0x8A, 0x2C, 0x24]); // mov r13b, [rsp] ; t
        self.buf.emit_bytes(&[0x44, 0x8A, 0x7C, 0x24, 0x01]); // mov r15b, [rsp+1] ; p
        self.add_rsp(2);
        self.compare_materialize(
            &[0x45, 0x38, 0xFD], // cmp r13b, r15b
            0x97,                // seta
            0x92,                // setb
        );
    }

    fn compare_materialize(&mut self, cmp: &[u8], set_above: u8, set_below: u8) {
        self.buf.emit_bytes(&[0x45, 0x31, 0xE4]); // xor r12d, r12d
        self.buf.emit_bytes(&[0x45, 0x31, 0xDB]); // xor r11d, r11d
        self.buf.emit_bytes(cmp);
        self.buf.emit_bytes(&[0x41, 0x0F, set_above, 0xC4]); // setcc r12b
        self.buf.emit_bytes(&[0x41, 0x0F, set_below, 0xC3]); // setcc r11b
        self.buf.emit_bytes(&[0x45, 0x29, 0xDC]); // sub r12d, r11d
    }

    /// Duplicate the top element, or with `deep` the top two elements as
    /// one block. Block widths 2/4/8 are a single wider move.
    pub fn dup(&mut self, width: Width, deep: bool) {
        let n = if deep { width.bytes() * 2 } else { width.bytes() };
        match n {
            1 => self.buf.emit_bytes(&[0x44, 0x8A, 0x2C, 0x24]), // mov r13b, [rsp]
            2 => self.buf.emit_bytes(&[0x66, 0x44, 0x8B, 0x2C, 0x24]),
            4 => self.buf.emit_bytes(&[0x44, 0x8B, 0x2C, 0x24]),
            _ => self.buf.emit_bytes(&[0x4C, 0x8B, 0x2C, 0x24]), // mov r13, [rsp]
        }
        self.sub_rsp(n as u8);
        match n {
            1 => self.buf.emit_bytes(&[0x44, 0x88, 0x2C, 0x24]), // mov [rsp], r13b
            2 => self.buf.emit_bytes(&[0x66, 0x44, 0x89, 0x2C, 0x24]),
            4 => self.buf.emit_bytes(&[0x44, 0x89, 0x2C, 0x24]),
            _ => self.buf.emit_bytes(&[0x4C, 0x89, 0x2C, 0x24]), // mov [rsp], r13
        }
    }

    /// Transfer to `target`, leaving the *native* return offset on the
    /// operand stack for `ret_op` to consume.
    pub fn call_op(&mut self, target: u32, return_native: u32) {
        self.buf.emit_bytes(&[0x4D, 0x8D, 0xAE]); // lea r13, [r14 + target]
        self.buf.emit_u32(target);
        self.sub_rsp(4);
        self.buf.emit_bytes(&[0xC7, 0x04, 0x24]); // mov dword [rsp], return
        self.buf.emit_u32(return_native);
        self.buf.emit_bytes(&[0x41, 0xFF, 0xE5]); // jmp r13
    }

    pub fn ret_op(&mut self) {
        self.buf.emit_bytes(&[0x4D, 0x31, 0xED]); // xor r13, r13
        self.buf.emit_bytes(&[0x44, 0x8B, 0x2C, 0x24]); // mov r13d, [rsp]
        self.add_rsp(4);
        self.buf.emit_bytes(&[0x4F, 0x8D, 0x6C, 0x35, 0x00]); // lea r13, [r13 + r14]
        self.buf.emit_bytes(&[0x41, 0xFF, 0xE5]); // jmp r13
    }

    /// Pop a value of `width`, write `[signal, type, payload]` into the
    /// out stream, and call the host.
    pub fn signal_out(&mut self, signal: u8, ty: u8, width: Width) {
        match width {
            Width::Dword => self.buf.emit_bytes(&[0x44, 0x8B, 0x3C, 0x24]), // mov r15d, [rsp]
            Width::Byte => self.buf.emit_bytes(&[0x44, 0x8A, 0x3C, 0x24]),  // mov r15b, [rsp]
            Width::Word => self.buf.emit_bytes(&[0x66, 0x44, 0x8B, 0x3C, 0x24]),
        }
        self.add_rsp(width.bytes() as u8);
        self.load_out_stream();
        self.buf.emit_bytes(&[0x41, 0xC6, 0x45, 0x00, signal]); // mov byte [r13], signal
        self.buf.emit_bytes(&[0x41, 0xC6, 0x45, 0x01, ty]); // mov byte [r13+1], type
        match width {
            Width::Dword => self.buf.emit_bytes(&[0x45, 0x89, 0x7D, 0x02]), // mov [r13+2], r15d
            Width::Byte => self.buf.emit_bytes(&[0x45, 0x88, 0x7D, 0x02]),  // mov [r13+2], r15b
            Width::Word => self.buf.emit_bytes(&[0x66, 0x45, 0x89, 0x7D, 0x02]),
        }
        self.call_host();
    }

    /// Request input from the host and push the payload it wrote back.
    pub fn signal_in(&mut self, signal: u8, ty: u8, width: Width) {
        self.load_out_stream();
        self.buf.emit_bytes(&[0x41, 0xC6, 0x45, 0x00, signal]); // mov byte [r13], signal
        self.buf.emit_bytes(&[0x41, 0xC6, 0x45, 0x01, ty]); // mov byte [r13+1], type
        self.call_host();
        self.buf.emit_bytes(&[0x49, 0xBD]); // movabs r13, <in_stream>
        self.buf.reloc_u64(RelocKind::InStream);
        match width {
            Width::Dword => self.buf.emit_bytes(&[0x45, 0x8B, 0x7D, 0x00]), // mov r15d, [r13]
            Width::Byte => self.buf.emit_bytes(&[0x45, 0x8A, 0x7D, 0x00]),  // mov r15b, [r13]
            Width::Word => self.buf.emit_bytes(&[0x66, 0x45, 0x8B, 0x7D, 0x00]),
        }
        self.sub_rsp(width.bytes() as u8);
        match width {
            Width::Dword => self.buf.emit_bytes(&[0x44, 0x89, 0x3C, 0x24]), // mov [rsp], r15d
            Width::Byte => self.buf.emit_bytes(&[0x44, 0x88, 0x3C, 0x24]),  // mov [rsp], r15b
            Width::Word => self.buf.emit_bytes(&[0x66, 0x44, 0x89, 0x3C, 0x24]),
        }
    }

    /// Signal a payload-less condition (halt or fault) to the host.
    pub fn signal_plain(&mut self, signal: u8) {
        self.load_out_stream();
        self.buf.emit_bytes(&[0x41, 0xC6, 0x45, 0x00, signal]); // mov byte [r13], signal
        self.call_host();
    }

    fn load_out_stream(&mut self) {
        self.buf.emit_bytes(&[0x49, 0xBD]); // movabs r13, <out_stream>
        self.buf.reloc_u64(RelocKind::OutStream);
    }

    /// Save everything the guest may care about, align, call the host
    /// callback with the image pointer, restore.
    fn call_host(&mut self) {
        self.buf.emit_bytes(&[0x50, 0x51, 0x52, 0x53, 0x56, 0x57]); // push rax..rdi
        self.buf.emit_bytes(&[0x41, 0x50, 0x41, 0x51, 0x41, 0x52, 0x41, 0x53]); // push r8..r11
        self.buf.emit_u8(0x9C); // pushfq
        self.buf.emit_bytes(&[0x48, 0xBF]); // movabs rdi, <image>
        self.buf.reloc_u64(RelocKind::ImagePtr);
        self.buf.emit_bytes(&[0x49, 0xBD]); // movabs r13, <handler>
        self.buf.reloc_u64(RelocKind::Handler);
        self.buf.emit_bytes(&[0x49, 0x89, 0xE7]); // mov r15, rsp
        self.buf.emit_bytes(&[0x48, 0x83, 0xE4, 0xF0]); // and rsp, -16
        self.buf.emit_bytes(&[0x41, 0xFF, 0xD5]); // call r13
        self.buf.emit_bytes(&[0x4C, 0x89, 0xFC]); // mov rsp, r15
        self.buf.emit_u8(0x9D); // popfq
        self.buf.emit_bytes(&[0x41, 0x5B, 0x41, 0x5A, 0x41, 0x59, 0x41, 0x58]); // pop r11..r8
        self.buf.emit_bytes(&[0x5F, 0x5E, 0x5B, 0x5A, 0x59, 0x58]); // pop rdi..rax
    }

    fn sub_rsp(&mut self, n: u8) {
        self.buf.emit_bytes(&[0x48, 0x83, 0xEC, n]);
    }

    fn add_rsp(&mut self, n: u8) {
        self.buf.emit_bytes(&[0x48, 0x83, 0xC4, n]);
    }

    fn load_r13_from_rsp(&mut self, width: Width) {
        match width {
            Width::Dword => self.buf.emit_bytes(&[0x44, 0x8B, 0x2C, 0x24]),
            Width::Word => self.buf.emit_bytes(&[0x66, 0x44, 0x8B, 0x2C, 0x24]),
            Width::Byte => self.buf.emit_bytes(&[0x44, 0x8A, 0x2C, 0x24]),
        }
    }

    fn store_r13_to_rsp(&mut self, width: Width) {
        match width {
            Width::Dword => self.buf.emit_bytes(&[0x44, 0x89, 0x2C, 0x24]), // mov [rsp], r13d
            Width::Word => self.buf.emit_bytes(&[0x66, 0x44, 0x89, 0x2C, 0x24]),
            Width::Byte => self.buf.emit_bytes(&[0x44, 0x88, 0x2C, 0x24]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of(f: impl FnOnce(&mut Asm<'_>)) -> Vec<u8> {
        let mut buf = CodeBuf::new();
        let mut asm = Asm::new(&mut buf);
        f(&mut asm);
        buf.into_parts().0
    }

    #[test]
    fn test_jump_block_is_ten_bytes() {
        let bytes = bytes_of(|a| a.jump_to(0x1234));
        assert_eq!(bytes.len(), 10);
        assert_eq!(&bytes[..3], &[0x4D, 0x8D, 0xAE]);
        assert_eq!(&bytes[3..7], &0x1234u32.to_le_bytes());
        assert_eq!(&bytes[7..], &[0x41, 0xFF, 0xE5]);
    }

    #[test]
    fn test_cond_jump_skip_distance_covers_jump_block() {
        let bytes = bytes_of(|a| a.cond_jump_to(Cond::Equal, 7));
        // cmp(4) + jcc(2) + jump block(10)
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[4], 0x75); // inverted: jne skips when not equal
        assert_eq!(bytes[5] as usize, bytes.len() - 6);
    }

    #[test]
    fn test_sequences_have_value_independent_length() {
        // The offset map computed in pass one only holds if operand values
        // never change a sequence's length.
        assert_eq!(
            bytes_of(|a| a.push_imm32(0)).len(),
            bytes_of(|a| a.push_imm32(u32::MAX)).len()
        );
        assert_eq!(
            bytes_of(|a| a.call_op(0, 0)).len(),
            bytes_of(|a| a.call_op(u32::MAX, u32::MAX)).len()
        );
        assert_eq!(
            bytes_of(|a| a.push_mem(Width::Word, 0)).len(),
            bytes_of(|a| a.push_mem(Width::Word, 9999)).len()
        );
    }

    #[test]
    fn test_byte_reg_rex_prefix() {
        // bpl (idx 5) needs a REX prefix, bl (idx 3) must not get one.
        let bpl = bytes_of(|a| a.push_reg(5, Width::Byte));
        let bl = bytes_of(|a| a.push_reg(3, Width::Byte));
        assert_eq!(bpl.len(), bl.len() + 1);
        assert_eq!(bpl[4], 0x40);
    }

    #[test]
    fn test_pow_loop_branch_distances() {
        let bytes = bytes_of(|a| a.int_pow());
        // jle +9 lands on the final store; jmp -14 lands back on the test.
        let jle = bytes.iter().position(|&b| b == 0x7E).unwrap();
        assert_eq!(bytes[jle + 1], 0x09);
        assert_eq!(
            bytes[jle + 2 + 9..jle + 2 + 9 + 4],
            [0x44, 0x89, 0x1C, 0x24]
        );
        let jmp = jle + 2 + 4 + 3; // imul and dec sit between
        assert_eq!(bytes[jmp], 0xEB);
        assert_eq!(bytes[jmp + 1], 0xF2);
    }

    #[test]
    fn test_deep_dup_copies_a_double_width_block() {
        // dworddupd moves an 8-byte block: 64-bit load, sub rsp 8, store.
        let bytes = bytes_of(|a| a.dup(Width::Dword, true));
        assert_eq!(
            bytes,
            [
                0x4C, 0x8B, 0x2C, 0x24, // mov r13, [rsp]
                0x48, 0x83, 0xEC, 0x08, // sub rsp, 8
                0x4C, 0x89, 0x2C, 0x24, // mov [rsp], r13
            ]
        );
        // bytedupd copies two bytes as one word.
        let bytes = bytes_of(|a| a.dup(Width::Byte, true));
        assert_eq!(bytes[..5], [0x66, 0x44, 0x8B, 0x2C, 0x24]);
        assert_eq!(bytes[7], 0x02); // sub rsp, 2
    }

    #[test]
    fn test_divide_overflow_guard_distances() {
        for remainder in [false, true] {
            let bytes = bytes_of(|a| a.int_divide(remainder, 0));
            let cmp = bytes
                .windows(4)
                .position(|w| w == [0x41, 0x83, 0xFF, 0xFF]) // cmp r15d, -1
                .unwrap();
            assert_eq!(bytes[cmp + 6..cmp + 9], [0x41, 0x81, 0xFD]); // cmp r13d, imm32
            assert_eq!(bytes[cmp + 9..cmp + 13], 0x8000_0000u32.to_le_bytes());
            // Both jne legs land on the same spot: mov r11, rax.
            assert_eq!(bytes[cmp + 4], 0x75);
            assert_eq!(bytes[cmp + 13], 0x75);
            let first = cmp + 6 + bytes[cmp + 5] as usize;
            let second = cmp + 15 + bytes[cmp + 14] as usize;
            assert_eq!(first, second);
            assert_eq!(bytes[first..first + 3], [0x49, 0x89, 0xC3]);
            // The short-circuit jmp lands on the final store.
            let jmp = first - 2;
            assert_eq!(bytes[jmp], 0xEB);
            let store = jmp + 2 + bytes[jmp + 1] as usize;
            assert_eq!(bytes[store..store + 4], [0x44, 0x89, 0x2C, 0x24]);
            assert_eq!(store + 4, bytes.len());
        }
    }

    #[test]
    fn test_prologue_pairs_with_epilogue() {
        let prologue = bytes_of(|a| a.prologue());
        let epilogue = bytes_of(|a| a.epilogue());
        // Six saves, six restores plus ret.
        assert_eq!(prologue[0], 0x55);
        assert_eq!(epilogue[epilogue.len() - 1], 0xC3);
        assert_eq!(&epilogue[..3], &[0x4C, 0x89, 0xD4]); // mov rsp, r10
    }
}
