//! Whole-program translation and in-process execution.
//!
//! Native image layout: prologue, a jump to the translated entry point,
//! the shared fault stub, the data section plus zero-filled scratch
//! (memory operands are rebased onto it), then the translated code. The
//! fault stub signals the host and unwinds through the epilogue, so both
//! `err` and a zero divisor exit the same way.
//!
//! The host side of the bridge is `stream_handler`, an `extern "C"`
//! function the generated code calls with the image pointer whenever it
//! needs I/O or wants to halt. Requests travel through the fixed
//! `out_stream` buffer as `[signal, type, payload]`; input comes back
//! through `in_stream`.

use std::io::{BufRead, BufReader, Write};

use super::codebuf::{CodeBuf, Reloc, RelocKind};
use super::x86_64::{Asm, Cond, FloatOp, IntOp};
use crate::asm;
use crate::isa::{self, Op, Width};
use crate::vm::console;

const SIG_OUT: u8 = 1;
const SIG_IN: u8 = 2;
const SIG_STOP: u8 = 3;
const SIG_ERR: u8 = 4;

const TY_INT: u8 = 1;
const TY_FLOAT: u8 = 2;
const TY_CHAR: u8 = 3;

/// Error type for translation and native execution.
#[derive(Debug)]
pub enum JitError {
    /// The image has no valid header.
    BadImage,
    IllegalOpcode { offset: usize, byte: u8 },
    /// The stream ends inside an operand.
    Truncated { offset: usize },
    /// A jump or call target is not an instruction boundary.
    BadTarget { offset: usize, target: u32 },
    /// A memory operand points outside the addressable region.
    BadAddress { offset: usize, addr: u32 },
    BadRegister { offset: usize, addr: u8 },
    /// Native execution is unavailable on this platform.
    Unsupported,
    /// Mapping or protecting the executable region failed.
    Map(String),
    /// The program faulted at run time.
    Fault(String),
}

impl std::fmt::Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitError::BadImage => write!(f, "not a valid program image"),
            JitError::IllegalOpcode { offset, byte } => {
                write!(f, "illegal opcode {:#04x} at offset {}", byte, offset)
            }
            JitError::Truncated { offset } => {
                write!(f, "stream truncated inside instruction at offset {}", offset)
            }
            JitError::BadTarget { offset, target } => {
                write!(f, "jump at offset {} to {} which is not an instruction", offset, target)
            }
            JitError::BadAddress { offset, addr } => {
                write!(f, "memory operand at offset {} addresses {} out of range", offset, addr)
            }
            JitError::BadRegister { offset, addr } => {
                write!(f, "bad register address {} at offset {}", addr, offset)
            }
            JitError::Unsupported => {
                write!(f, "native execution requires unix on x86-64")
            }
            JitError::Map(msg) => write!(f, "executable mapping failed: {}", msg),
            JitError::Fault(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for JitError {}

#[cfg(unix)]
impl From<super::memory::MapError> for JitError {
    fn from(e: super::memory::MapError) -> Self {
        JitError::Map(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExitState {
    Running,
    Stopped,
    Fault(String),
}

/// A translated program, ready to execute.
pub struct Image {
    code: Vec<u8>,
    relocs: Vec<Reloc>,
    /// bytecode offset -> native offset; `u32::MAX` marks non-boundaries.
    map: Vec<u32>,
    out_stream: [u8; 8],
    in_stream: [u8; 8],
    state: ExitState,
    input: Box<dyn BufRead>,
    output: Box<dyn Write>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("code_len", &self.code.len())
            .field("relocs", &self.relocs.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Image {
    /// Translate against stdin/stdout.
    pub fn translate(bytes: &[u8]) -> Result<Self, JitError> {
        Self::translate_with_io(
            bytes,
            Box::new(BufReader::new(std::io::stdin())),
            Box::new(std::io::stdout()),
        )
    }

    /// Translate with injected streams; tests capture output this way.
    pub fn translate_with_io(
        bytes: &[u8],
        input: Box<dyn BufRead>,
        output: Box<dyn Write>,
    ) -> Result<Self, JitError> {
        let entry = asm::read_header(bytes).ok_or(JitError::BadImage)? as usize;

        // Pass one with blank targets computes the offset map; pass two
        // re-emits resolving through it. Every sequence's length is
        // operand-value independent, so the two walks line up exactly.
        let (_, map) = emit(bytes, entry, None)?;
        let (buf, _) = emit(bytes, entry, Some(&map))?;
        let (code, relocs) = buf.into_parts();

        Ok(Self {
            code,
            relocs,
            map,
            out_stream: [0; 8],
            in_stream: [0; 8],
            state: ExitState::Running,
            input,
            output,
        })
    }

    /// The generated machine code, before relocation patching.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Native offset of a bytecode instruction boundary.
    pub fn native_offset(&self, bytecode: u32) -> Option<u32> {
        self.map
            .get(bytecode as usize)
            .copied()
            .filter(|&n| n != u32::MAX)
    }

    /// Map the code executable, patch relocations against the mapping
    /// address, and run it to completion. The mapping is released before
    /// returning on every path.
    #[cfg(all(unix, target_arch = "x86_64"))]
    pub fn execute(&mut self) -> Result<(), JitError> {
        use super::memory::ExecutableMemory;

        let mut mem = ExecutableMemory::new(self.code.len())?;
        let base = mem.as_ptr() as u64;
        let image_ptr = std::ptr::from_mut(self) as u64;
        let mut patched = self.code.clone();
        for reloc in &self.relocs {
            let value = match reloc.kind {
                RelocKind::Base => base,
                RelocKind::OutStream => self.out_stream.as_ptr() as u64,
                RelocKind::InStream => self.in_stream.as_ptr() as u64,
                RelocKind::ImagePtr => image_ptr,
                RelocKind::Handler => stream_handler as usize as u64,
            };
            patched[reloc.at..reloc.at + 8].copy_from_slice(&value.to_le_bytes());
        }
        mem.write(0, &patched)?;
        mem.make_executable()?;

        self.state = ExitState::Running;
        let entry = unsafe { mem.entry() }?;
        entry();
        drop(mem);

        self.output.flush().map_err(|e| JitError::Fault(e.to_string()))?;
        match std::mem::replace(&mut self.state, ExitState::Running) {
            ExitState::Stopped => Ok(()),
            ExitState::Fault(msg) => Err(JitError::Fault(msg)),
            ExitState::Running => Err(JitError::Fault(
                "generated code returned without halting".to_string(),
            )),
        }
    }

    #[cfg(not(all(unix, target_arch = "x86_64")))]
    pub fn execute(&mut self) -> Result<(), JitError> {
        Err(JitError::Unsupported)
    }

    fn handle_signal(&mut self) {
        let signal = self.out_stream[0];
        let ty = self.out_stream[1];
        let mut payload = [0u8; 4];
        payload.copy_from_slice(&self.out_stream[2..6]);

        let result = match signal {
            SIG_OUT => match ty {
                TY_INT => console::write_int(&mut self.output, i32::from_le_bytes(payload))
                    .map_err(|e| e.to_string()),
                TY_FLOAT => console::write_float(&mut self.output, f32::from_le_bytes(payload))
                    .map_err(|e| e.to_string()),
                TY_CHAR => {
                    console::write_char(&mut self.output, payload[0]).map_err(|e| e.to_string())
                }
                _ => Err(format!("unknown output type {}", ty)),
            },
            SIG_IN => self.handle_input(ty),
            SIG_STOP => {
                self.state = ExitState::Stopped;
                Ok(())
            }
            SIG_ERR => {
                self.state = ExitState::Fault("program raised err".to_string());
                Ok(())
            }
            _ => Err(format!("unknown signal {}", signal)),
        };

        if let Err(msg) = result {
            // First fault wins; the code keeps running until its next exit.
            if !matches!(self.state, ExitState::Fault(_)) {
                self.state = ExitState::Fault(msg);
            }
        }
    }

    fn handle_input(&mut self, ty: u8) -> Result<(), String> {
        if let Err(e) = self.output.flush() {
            return Err(e.to_string());
        }
        self.in_stream = [0; 8];
        let read = match ty {
            TY_INT => console::read_int(&mut self.input).map(|v| v.to_le_bytes()),
            TY_FLOAT => console::read_float(&mut self.input).map(|v| v.to_le_bytes()),
            TY_CHAR => console::read_char(&mut self.input).map(|c| [c, 0, 0, 0]),
            _ => return Err(format!("unknown input type {}", ty)),
        };
        match read {
            Ok(bytes) => {
                self.in_stream[..4].copy_from_slice(&bytes);
                Ok(())
            }
            Err(console::ReadError::Io(e)) => Err(e.to_string()),
            Err(console::ReadError::Malformed(line)) => {
                Err(format!("malformed input `{}`", line))
            }
        }
    }
}

/// The host callback embedded into generated code.
extern "C" fn stream_handler(image: *mut Image) {
    // The pointer is patched in by execute() and outlives the call.
    let image = unsafe { &mut *image };
    image.handle_signal();
}

/// One translation walk. With `resolved` absent all targets emit as zero
/// and the returned map records where each bytecode instruction landed;
/// with it present, targets resolve for real.
fn emit(
    bytes: &[u8],
    entry: usize,
    resolved: Option<&[u32]>,
) -> Result<(CodeBuf, Vec<u32>), JitError> {
    let mem_limit = crate::vm::DEFAULT_MEMORY_SIZE.max(bytes.len());
    let mut buf = CodeBuf::new();
    let mut map = vec![u32::MAX; bytes.len()];
    let mut asm = Asm::new(&mut buf);

    let resolve = |target: u32, at: usize| -> Result<u32, JitError> {
        match resolved {
            None => Ok(0),
            Some(map) => map
                .get(target as usize)
                .copied()
                .filter(|&n| n != u32::MAX)
                .ok_or(JitError::BadTarget { offset: at, target }),
        }
    };

    asm.prologue();
    asm.jump_to(resolve(entry as u32, 0)?);

    let fault_stub = asm.offset();
    asm.signal_plain(SIG_ERR);
    asm.epilogue();

    // Image copy (data and code sections), then scratch, mirroring the
    // interpreter's zero-filled region so every memory operand reads and
    // writes the same bytes under both engines.
    let data_base = asm.offset();
    asm.emit_raw(&bytes[isa::HEADER_SIZE..]);
    asm.emit_raw(&vec![0u8; mem_limit - bytes.len()]);

    let rebase = |addr: u32, width: Width, at: usize| -> Result<u32, JitError> {
        let end = addr as usize + width.bytes();
        if (addr as usize) < isa::HEADER_SIZE || end > mem_limit {
            return Err(JitError::BadAddress { offset: at, addr });
        }
        Ok(data_base + addr - isa::HEADER_SIZE as u32)
    };

    let mut offset = entry;
    while offset < bytes.len() {
        map[offset] = asm.offset();
        let byte = bytes[offset];
        let op = match Op::from_u8(byte) {
            Some(Op::Push) | Some(Op::Pop) | None => {
                return Err(JitError::IllegalOpcode { offset, byte });
            }
            Some(op) => op,
        };
        let len = op.operand_len();
        if offset + 1 + len > bytes.len() {
            return Err(JitError::Truncated { offset });
        }
        let imm8 = || bytes[offset + 1];
        let imm32 = || {
            u32::from_le_bytes([
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
                bytes[offset + 4],
            ])
        };
        // esp is rejected outright: the guest stack pointer lives in the
        // host rsp, so a register operand on it would read or clobber the
        // operand stack itself.
        let reg_idx = |addr: u8| -> Result<u8, JitError> {
            if addr % isa::REG_WIDTH as u8 != 0
                || addr as usize >= isa::REG_FILE_SIZE
                || addr == isa::ESP
            {
                return Err(JitError::BadRegister { offset, addr });
            }
            Ok(addr / isa::REG_WIDTH as u8)
        };

        match op {
            Op::Stop => {
                asm.signal_plain(SIG_STOP);
                asm.epilogue();
            }
            Op::Err => asm.jump_to(fault_stub),
            Op::Nop => {}

            Op::Out => asm.signal_out(SIG_OUT, TY_INT, Width::Dword),
            Op::Fout => asm.signal_out(SIG_OUT, TY_FLOAT, Width::Dword),
            Op::Cout => asm.signal_out(SIG_OUT, TY_CHAR, Width::Byte),
            Op::In => asm.signal_in(SIG_IN, TY_INT, Width::Dword),
            Op::Fin => asm.signal_in(SIG_IN, TY_FLOAT, Width::Dword),
            Op::Cin => asm.signal_in(SIG_IN, TY_CHAR, Width::Byte),

            Op::Add => asm.int_binary(IntOp::Add),
            Op::Sub => asm.int_binary(IntOp::Sub),
            Op::Mul => asm.int_binary(IntOp::Mul),
            Op::Div => asm.int_divide(false, fault_stub),
            Op::Mod => asm.int_divide(true, fault_stub),
            Op::Pow => asm.int_pow(),
            Op::Abs => asm.int_abs(),

            Op::Fadd => asm.float_binary(FloatOp::Add),
            Op::Fsub => asm.float_binary(FloatOp::Sub),
            Op::Fmul => asm.float_binary(FloatOp::Mul),
            Op::Fdiv => asm.float_binary(FloatOp::Div),
            Op::Fabs => asm.float_abs(),

            Op::Cmp => asm.compare_int(),
            Op::Fcmp => asm.compare_float(),
            Op::Ccmp => asm.compare_char(),

            Op::ByteDup => asm.dup(Width::Byte, false),
            Op::WordDup => asm.dup(Width::Word, false),
            Op::DwordDup => asm.dup(Width::Dword, false),
            Op::ByteDupd => asm.dup(Width::Byte, true),
            Op::WordDupd => asm.dup(Width::Word, true),
            Op::DwordDupd => asm.dup(Width::Dword, true),

            Op::PushInt | Op::PushFloat => asm.push_imm32(imm32()),
            Op::PushChar => asm.push_imm8(imm8()),
            Op::PushRegByte => {
                let idx = reg_idx(imm8())?;
                asm.push_reg(idx, Width::Byte);
            }
            Op::PushRegWord => {
                let idx = reg_idx(imm8())?;
                asm.push_reg(idx, Width::Word);
            }
            Op::PushRegDword => {
                let idx = reg_idx(imm8())?;
                asm.push_reg(idx, Width::Dword);
            }
            Op::PopRegByte => {
                let idx = reg_idx(imm8())?;
                asm.pop_reg(idx, Width::Byte);
            }
            Op::PopRegWord => {
                let idx = reg_idx(imm8())?;
                asm.pop_reg(idx, Width::Word);
            }
            Op::PopRegDword => {
                let idx = reg_idx(imm8())?;
                asm.pop_reg(idx, Width::Dword);
            }
            Op::PushMemByte => asm.push_mem(Width::Byte, rebase(imm32(), Width::Byte, offset)?),
            Op::PushMemWord => asm.push_mem(Width::Word, rebase(imm32(), Width::Word, offset)?),
            Op::PushMemDword => {
                asm.push_mem(Width::Dword, rebase(imm32(), Width::Dword, offset)?)
            }
            Op::PopMemByte => asm.pop_mem(Width::Byte, rebase(imm32(), Width::Byte, offset)?),
            Op::PopMemWord => asm.pop_mem(Width::Word, rebase(imm32(), Width::Word, offset)?),
            Op::PopMemDword => asm.pop_mem(Width::Dword, rebase(imm32(), Width::Dword, offset)?),

            Op::Ja => asm.cond_jump_to(Cond::Above, resolve(imm32(), offset)?),
            Op::Jae => asm.cond_jump_to(Cond::AboveEqual, resolve(imm32(), offset)?),
            Op::Jb => asm.cond_jump_to(Cond::Below, resolve(imm32(), offset)?),
            Op::Jbe => asm.cond_jump_to(Cond::BelowEqual, resolve(imm32(), offset)?),
            Op::Je => asm.cond_jump_to(Cond::Equal, resolve(imm32(), offset)?),
            Op::Jne => asm.cond_jump_to(Cond::NotEqual, resolve(imm32(), offset)?),
            Op::Jmp => asm.jump_to(resolve(imm32(), offset)?),
            Op::Call => {
                let target = resolve(imm32(), offset)?;
                let ret = resolve((offset + 1 + len) as u32, offset)?;
                asm.call_op(target, ret);
            }
            Op::Ret => asm.ret_op(),

            Op::Push | Op::Pop => {}
        }

        offset += 1 + len;
    }

    Ok((buf, map))
}
