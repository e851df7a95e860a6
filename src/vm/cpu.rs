//! The fetch/decode/execute loop.
//!
//! Execution is fail-stop: the first stack, memory, opcode or input fault
//! aborts the run with a [`VmFault`] describing it. The program image is
//! loaded at offset zero of the memory region, so the instruction pointer
//! and memory operands share one address space, exactly as encoded.

use std::io::{BufRead, BufReader, Write};

use super::console::{self, ReadError};
use super::memory::{Memory, MemoryError};
use super::stack::{OperandStack, StackError};
use crate::asm;
use crate::isa::{self, Op, flags};

/// A fatal execution fault.
#[derive(Debug)]
pub enum VmFault {
    /// The image has no valid header.
    BadImage,
    IllegalOpcode { offset: usize, byte: u8 },
    IllegalRegister(u8),
    Stack(StackError),
    Memory(MemoryError),
    DivideByZero,
    /// The program executed an `err` instruction.
    ErrInstruction,
    MalformedInput(String),
    Io(std::io::Error),
}

impl std::fmt::Display for VmFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmFault::BadImage => write!(f, "not a valid program image"),
            VmFault::IllegalOpcode { offset, byte } => {
                write!(f, "illegal opcode {:#04x} at offset {}", byte, offset)
            }
            VmFault::IllegalRegister(addr) => write!(f, "illegal register address {}", addr),
            VmFault::Stack(e) => write!(f, "{}", e),
            VmFault::Memory(e) => write!(f, "{}", e),
            VmFault::DivideByZero => write!(f, "division by zero"),
            VmFault::ErrInstruction => write!(f, "program raised err"),
            VmFault::MalformedInput(line) => write!(f, "malformed input `{}`", line),
            VmFault::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for VmFault {}

impl From<StackError> for VmFault {
    fn from(e: StackError) -> Self {
        VmFault::Stack(e)
    }
}

impl From<MemoryError> for VmFault {
    fn from(e: MemoryError) -> Self {
        VmFault::Memory(e)
    }
}

impl From<std::io::Error> for VmFault {
    fn from(e: std::io::Error) -> Self {
        VmFault::Io(e)
    }
}

impl From<ReadError> for VmFault {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::Io(e) => VmFault::Io(e),
            ReadError::Malformed(line) => VmFault::MalformedInput(line),
        }
    }
}

/// The interpreter.
pub struct Vm {
    stack: OperandStack,
    registers: [u8; isa::REG_FILE_SIZE],
    flags: u8,
    ip: usize,
    memory: Memory,
    input: Box<dyn BufRead>,
    output: Box<dyn Write>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("ip", &self.ip)
            .field("flags", &self.flags)
            .field("registers", &self.registers)
            .finish_non_exhaustive()
    }
}

impl Vm {
    /// Run against stdin/stdout with default limits.
    pub fn new(image: &[u8]) -> Result<Self, VmFault> {
        Self::with_io(
            image,
            Box::new(BufReader::new(std::io::stdin())),
            Box::new(std::io::stdout()),
        )
    }

    /// Inject input and output streams; tests capture output this way.
    pub fn with_io(
        image: &[u8],
        input: Box<dyn BufRead>,
        output: Box<dyn Write>,
    ) -> Result<Self, VmFault> {
        Self::with_limits(
            image,
            super::DEFAULT_MEMORY_SIZE,
            super::DEFAULT_STACK_SIZE,
            input,
            output,
        )
    }

    pub fn with_limits(
        image: &[u8],
        memory_size: usize,
        stack_size: usize,
        input: Box<dyn BufRead>,
        output: Box<dyn Write>,
    ) -> Result<Self, VmFault> {
        let entry = asm::read_header(image).ok_or(VmFault::BadImage)?;
        Ok(Self {
            stack: OperandStack::new(stack_size),
            registers: [0; isa::REG_FILE_SIZE],
            flags: 0,
            ip: entry as usize,
            memory: Memory::with_image(image, memory_size),
            input,
            output,
        })
    }

    /// Execute until the sentinel `stop` byte or a fault.
    pub fn run(&mut self) -> Result<(), VmFault> {
        loop {
            let byte = self.memory.load::<1>(self.ip)?[0];
            if byte == Op::Stop as u8 {
                self.output.flush()?;
                return Ok(());
            }
            let op = match Op::from_u8(byte) {
                // The overloaded base opcodes never appear in a valid stream.
                Some(Op::Push) | Some(Op::Pop) | None => {
                    return Err(VmFault::IllegalOpcode {
                        offset: self.ip,
                        byte,
                    });
                }
                Some(op) => op,
            };
            self.step(op)?;
            self.sync_esp();
        }
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.depth()
    }

    fn step(&mut self, op: Op) -> Result<(), VmFault> {
        let mut next = self.ip + 1 + op.operand_len();
        match op {
            Op::Stop | Op::Push | Op::Pop => unreachable!("filtered in run()"),
            Op::Err => return Err(VmFault::ErrInstruction),
            Op::Nop => {}

            Op::Out => {
                let v = self.pop_i32()?;
                console::write_int(&mut self.output, v)?;
            }
            Op::Fout => {
                let v = self.pop_f32()?;
                console::write_float(&mut self.output, v)?;
            }
            Op::Cout => {
                let [c] = self.stack.pop::<1>()?;
                console::write_char(&mut self.output, c)?;
            }
            Op::In => {
                self.output.flush()?;
                let v = console::read_int(&mut self.input)?;
                self.push_i32(v)?;
            }
            Op::Fin => {
                self.output.flush()?;
                let v = console::read_float(&mut self.input)?;
                self.push_f32(v)?;
            }
            Op::Cin => {
                self.output.flush()?;
                let c = console::read_char(&mut self.input)?;
                self.stack.push([c])?;
            }

            Op::Add => self.int_arith(|t, p| t.overflowing_add(p))?,
            Op::Sub => self.int_arith(|t, p| t.overflowing_sub(p))?,
            Op::Mul => self.int_arith(|t, p| t.overflowing_mul(p))?,
            Op::Div => {
                let t = self.pop_i32()?;
                let p = self.pop_i32()?;
                if p == 0 {
                    return Err(VmFault::DivideByZero);
                }
                self.push_i32(t.wrapping_div(p))?;
            }
            Op::Mod => {
                let t = self.pop_i32()?;
                let p = self.pop_i32()?;
                if p == 0 {
                    return Err(VmFault::DivideByZero);
                }
                self.push_i32(t.wrapping_rem(p))?;
            }
            Op::Pow => {
                let t = self.pop_i32()?;
                let p = self.pop_i32()?;
                self.push_i32(t.wrapping_pow(p.max(0) as u32))?;
            }
            Op::Abs => {
                let t = self.pop_i32()?;
                self.push_i32(t.wrapping_abs())?;
            }

            Op::Fadd => self.float_arith(|t, p| t + p)?,
            Op::Fsub => self.float_arith(|t, p| t - p)?,
            Op::Fmul => self.float_arith(|t, p| t * p)?,
            Op::Fdiv => self.float_arith(|t, p| t / p)?,
            Op::Fabs => {
                let t = self.pop_f32()?;
                self.push_f32(t.abs())?;
            }

            Op::Cmp => {
                let t = self.pop_i32()?;
                let p = self.pop_i32()?;
                self.set_compare(t == p, t < p);
            }
            Op::Fcmp => {
                let t = self.pop_f32()?;
                let p = self.pop_f32()?;
                // Unordered compares as below, matching the native
                // seta/setb sequence the translator emits.
                self.set_compare(t == p, !(t >= p));
            }
            Op::Ccmp => {
                let [t] = self.stack.pop::<1>()?;
                let [p] = self.stack.pop::<1>()?;
                self.set_compare(t == p, t < p);
            }

            Op::ByteDup => {
                let v = self.stack.peek::<1>(0)?;
                self.stack.push(v)?;
            }
            Op::WordDup => {
                let v = self.stack.peek::<2>(0)?;
                self.stack.push(v)?;
            }
            Op::DwordDup => {
                let v = self.stack.peek::<4>(0)?;
                self.stack.push(v)?;
            }
            // dupd duplicates the top two elements as one block.
            Op::ByteDupd => {
                let v = self.stack.peek::<2>(0)?;
                self.stack.push(v)?;
            }
            Op::WordDupd => {
                let v = self.stack.peek::<4>(0)?;
                self.stack.push(v)?;
            }
            Op::DwordDupd => {
                let v = self.stack.peek::<8>(0)?;
                self.stack.push(v)?;
            }

            Op::PushInt | Op::PushFloat => {
                let v = self.operand_u32()?;
                self.stack.push(v.to_le_bytes())?;
            }
            Op::PushChar => {
                let c = self.operand_u8()?;
                self.stack.push([c])?;
            }
            Op::PushRegByte => {
                let addr = self.operand_u8()?;
                let v = self.reg_load::<1>(addr)?;
                self.stack.push(v)?;
            }
            Op::PushRegWord => {
                let addr = self.operand_u8()?;
                let v = self.reg_load::<2>(addr)?;
                self.stack.push(v)?;
            }
            Op::PushRegDword => {
                let addr = self.operand_u8()?;
                let v = self.reg_load::<4>(addr)?;
                self.stack.push(v)?;
            }
            Op::PopRegByte => {
                let addr = self.operand_u8()?;
                let v = self.stack.pop::<1>()?;
                self.reg_store(addr, v)?;
            }
            Op::PopRegWord => {
                let addr = self.operand_u8()?;
                let v = self.stack.pop::<2>()?;
                self.reg_store(addr, v)?;
            }
            Op::PopRegDword => {
                let addr = self.operand_u8()?;
                let v = self.stack.pop::<4>()?;
                self.reg_store(addr, v)?;
            }
            Op::PushMemByte => {
                let addr = self.operand_u32()? as usize;
                let v = self.memory.load::<1>(addr)?;
                self.stack.push(v)?;
            }
            Op::PushMemWord => {
                let addr = self.operand_u32()? as usize;
                let v = self.memory.load::<2>(addr)?;
                self.stack.push(v)?;
            }
            Op::PushMemDword => {
                let addr = self.operand_u32()? as usize;
                let v = self.memory.load::<4>(addr)?;
                self.stack.push(v)?;
            }
            Op::PopMemByte => {
                let addr = self.operand_u32()? as usize;
                let v = self.stack.pop::<1>()?;
                self.memory.store(addr, v)?;
            }
            Op::PopMemWord => {
                let addr = self.operand_u32()? as usize;
                let v = self.stack.pop::<2>()?;
                self.memory.store(addr, v)?;
            }
            Op::PopMemDword => {
                let addr = self.operand_u32()? as usize;
                let v = self.stack.pop::<4>()?;
                self.memory.store(addr, v)?;
            }

            Op::Ja | Op::Jae | Op::Jb | Op::Jbe | Op::Je | Op::Jne => {
                let target = self.operand_u32()? as usize;
                let c = self.flags & flags::CMP_MASK;
                let taken = match op {
                    Op::Ja => c == 0,
                    Op::Jae => c & flags::NEG == 0,
                    Op::Jb => c & flags::NEG != 0,
                    Op::Jbe => c != 0,
                    Op::Je => c & flags::ZERO != 0,
                    _ => c & flags::ZERO == 0,
                };
                if taken {
                    next = target;
                }
            }
            Op::Jmp => {
                next = self.operand_u32()? as usize;
            }
            Op::Call => {
                let target = self.operand_u32()? as usize;
                self.stack.push((next as u32).to_le_bytes())?;
                next = target;
            }
            Op::Ret => {
                next = u32::from_le_bytes(self.stack.pop::<4>()?) as usize;
            }
        }
        self.ip = next;
        Ok(())
    }

    fn int_arith(&mut self, f: impl Fn(i32, i32) -> (i32, bool)) -> Result<(), VmFault> {
        let t = self.pop_i32()?;
        let p = self.pop_i32()?;
        let (res, overflow) = f(t, p);
        if overflow {
            self.flags |= flags::OVF;
        }
        self.push_i32(res)
    }

    fn float_arith(&mut self, f: impl Fn(f32, f32) -> f32) -> Result<(), VmFault> {
        let t = self.pop_f32()?;
        let p = self.pop_f32()?;
        self.push_f32(f(t, p))
    }

    fn set_compare(&mut self, equal: bool, below: bool) {
        self.flags &= !flags::CMP_MASK;
        if equal {
            self.flags |= flags::ZERO;
        } else if below {
            self.flags |= flags::NEG;
        }
    }

    fn pop_i32(&mut self) -> Result<i32, VmFault> {
        Ok(i32::from_le_bytes(self.stack.pop::<4>()?))
    }

    fn push_i32(&mut self, v: i32) -> Result<(), VmFault> {
        Ok(self.stack.push(v.to_le_bytes())?)
    }

    fn pop_f32(&mut self) -> Result<f32, VmFault> {
        Ok(f32::from_le_bytes(self.stack.pop::<4>()?))
    }

    fn push_f32(&mut self, v: f32) -> Result<(), VmFault> {
        Ok(self.stack.push(v.to_le_bytes())?)
    }

    fn operand_u8(&self) -> Result<u8, VmFault> {
        Ok(self.memory.load::<1>(self.ip + 1)?[0])
    }

    fn operand_u32(&self) -> Result<u32, VmFault> {
        Ok(u32::from_le_bytes(self.memory.load::<4>(self.ip + 1)?))
    }

    fn reg_load<const N: usize>(&self, addr: u8) -> Result<[u8; N], VmFault> {
        let addr = addr as usize;
        if addr + N > isa::REG_FILE_SIZE {
            return Err(VmFault::IllegalRegister(addr as u8));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.registers[addr..addr + N]);
        Ok(out)
    }

    fn reg_store<const N: usize>(&mut self, addr: u8, v: [u8; N]) -> Result<(), VmFault> {
        let addr = addr as usize;
        if addr + N > isa::REG_FILE_SIZE {
            return Err(VmFault::IllegalRegister(addr as u8));
        }
        self.registers[addr..addr + N].copy_from_slice(&v);
        Ok(())
    }

    /// `esp` tracks the operand stack depth.
    fn sync_esp(&mut self) {
        let esp = isa::ESP as usize;
        self.registers[esp..esp + 4].copy_from_slice(&(self.stack.depth() as u32).to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;

    /// A clonable writer so captured output survives handing the VM an
    /// owned `Box<dyn Write>`.
    #[derive(Clone, Default)]
    struct Sink(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Sink {
        fn contents(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }
    }

    fn run_capture(source: &str) -> Result<String, VmFault> {
        run_capture_with(source, "")
    }

    fn run_capture_with(source: &str, input: &str) -> Result<String, VmFault> {
        let program = assemble(source).unwrap();
        let sink = Sink::default();
        let input = std::io::Cursor::new(input.as_bytes().to_vec());
        let mut vm = Vm::with_io(&program.bytes, Box::new(input), Box::new(sink.clone()))?;
        vm.run()?;
        Ok(sink.contents())
    }

    #[test]
    fn test_add_prints_five() {
        assert_eq!(run_capture(".code\npush 2\npush 3\nadd\nout\nstop\n").unwrap(), "5\n");
    }

    #[test]
    fn test_arith_operand_order() {
        // top `op` previous: push 10, push 3 leaves 3 on top, so sub is 3 - 10.
        assert_eq!(run_capture(".code\npush 10\npush 3\nsub\nout\nstop\n").unwrap(), "-7\n");
        assert_eq!(run_capture(".code\npush 3\npush 10\ndiv\nout\nstop\n").unwrap(), "3\n");
        assert_eq!(run_capture(".code\npush 3\npush 10\nmod\nout\nstop\n").unwrap(), "1\n");
        assert_eq!(run_capture(".code\npush 3\npush 2\npow\nout\nstop\n").unwrap(), "8\n");
    }

    #[test]
    fn test_divide_overflow_wraps() {
        assert_eq!(
            run_capture(".code\npush -1\npush -2147483648\ndiv\nout\nstop\n").unwrap(),
            "-2147483648\n"
        );
        assert_eq!(
            run_capture(".code\npush -1\npush -2147483648\nmod\nout\nstop\n").unwrap(),
            "0\n"
        );
    }

    #[test]
    fn test_pow_non_positive_exponent() {
        assert_eq!(run_capture(".code\npush -2\npush 5\npow\nout\nstop\n").unwrap(), "1\n");
        assert_eq!(run_capture(".code\npush 0\npush 5\npow\nout\nstop\n").unwrap(), "1\n");
    }

    #[test]
    fn test_float_pipeline() {
        assert_eq!(
            run_capture(".code\npush 1.5\npush 2.25\nfadd\nfout\nstop\n").unwrap(),
            "3.75\n"
        );
        assert_eq!(run_capture(".code\npush -1.5\nfabs\nfout\nstop\n").unwrap(), "1.5\n");
    }

    #[test]
    fn test_char_output_is_raw() {
        assert_eq!(run_capture(".code\npush 'h'\npush 'i'\ncout\ncout\nstop\n").unwrap(), "ih");
    }

    #[test]
    fn test_compare_and_jumps() {
        // 3 < 7: push 7, push 3 -> t=3, p=7 -> NEG set -> jb taken
        let source = ".code\npush 7\npush 3\ncmp\njb less\npush 0\nout\nstop\nless: push 1\nout\nstop\n";
        assert_eq!(run_capture(source).unwrap(), "1\n");
        let source = ".code\npush 4\npush 4\ncmp\nje eq\npush 0\nout\nstop\neq: push 1\nout\nstop\n";
        assert_eq!(run_capture(source).unwrap(), "1\n");
        // 9 > 2: no flag set -> ja taken
        let source = ".code\npush 2\npush 9\ncmp\nja gt\npush 0\nout\nstop\ngt: push 1\nout\nstop\n";
        assert_eq!(run_capture(source).unwrap(), "1\n");
    }

    #[test]
    fn test_signed_compare() {
        // -1 < 1 must take jb despite the unsigned bit patterns.
        let source = ".code\npush 1\npush -1\ncmp\njb less\npush 0\nout\nstop\nless: push 1\nout\nstop\n";
        assert_eq!(run_capture(source).unwrap(), "1\n");
    }

    #[test]
    fn test_loop_counts_down() {
        // add with -1 instead of sub: arithmetic computes top `op` prev,
        // so `push 1 / sub` would give 1 - counter.
        let source = "\
.code
push 3
loop: dworddup
out
push -1
add
dworddup
push 0
cmp
jne loop
stop
";
        assert_eq!(run_capture(source).unwrap(), "3\n2\n1\n");
    }

    #[test]
    fn test_call_ret() {
        let source = "\
.code
push 2
call double
out
stop
double: pop eax
dworddup
add
push eax
ret
";
        // call pushes the return address on top of the argument; the callee
        // saves it in eax, doubles the argument, restores and returns.
        assert_eq!(run_capture(source).unwrap(), "4\n");
    }

    #[test]
    fn test_registers_and_memory() {
        let source = "\
.data
slot: dword 0
.code
push 41
pop eax
push eax
push 1
add
pop [slot]
push [slot]
out
stop
";
        assert_eq!(run_capture(source).unwrap(), "42\n");
    }

    #[test]
    fn test_subregister_views() {
        // 258 = 0x102; cl sees the low byte of ecx.
        let source = ".code\npush 258\npop ecx\npush cl\ncout\nstop\n";
        assert_eq!(run_capture(source).unwrap(), "\u{2}");
    }

    #[test]
    fn test_dup_variants() {
        assert_eq!(run_capture(".code\npush 6\ndworddup\nadd\nout\nstop\n").unwrap(), "12\n");
        // dupd doubles the top two elements: 5,9 becomes 5,9,5,9.
        assert_eq!(
            run_capture(".code\npush 5\npush 9\ndworddupd\nout\nout\nout\nout\nstop\n").unwrap(),
            "9\n5\n9\n5\n"
        );
    }

    #[test]
    fn test_input() {
        assert_eq!(
            run_capture_with(".code\nin\nin\nadd\nout\nstop\n", "20\n22\n").unwrap(),
            "42\n"
        );
        assert_eq!(
            run_capture_with(".code\ncin\ncout\nstop\n", "x\n").unwrap(),
            "x"
        );
    }

    #[test]
    fn test_divide_by_zero_faults() {
        let err = run_capture(".code\npush 0\npush 1\ndiv\nstop\n").unwrap_err();
        assert!(matches!(err, VmFault::DivideByZero));
    }

    #[test]
    fn test_pop_empty_faults_cleanly() {
        let err = run_capture(".code\npop eax\nstop\n").unwrap_err();
        assert!(matches!(err, VmFault::Stack(StackError::Underflow)));
    }

    #[test]
    fn test_err_instruction_faults() {
        let err = run_capture(".code\nerr\nstop\n").unwrap_err();
        assert!(matches!(err, VmFault::ErrInstruction));
    }

    #[test]
    fn test_malformed_input_faults() {
        let err = run_capture_with(".code\nin\nstop\n", "notanumber\n").unwrap_err();
        assert!(matches!(err, VmFault::MalformedInput(_)));
    }

    #[test]
    fn test_bad_image_rejected() {
        let err = Vm::new(&[0xFF, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, VmFault::BadImage));
    }

    #[test]
    fn test_overflow_flag_set_on_wrap() {
        let program = assemble(".code\npush 2147483647\npush 1\nadd\nstop\n").unwrap();
        let mut vm = Vm::with_io(
            &program.bytes,
            Box::new(std::io::Cursor::new(Vec::new())),
            Box::new(Vec::new()),
        )
        .unwrap();
        vm.run().unwrap();
        assert_eq!(vm.flags() & flags::OVF, flags::OVF);
    }

    #[test]
    fn test_esp_mirror() {
        let program = assemble(".code\npush 1\npush 2\nstop\n").unwrap();
        let mut vm = Vm::with_io(
            &program.bytes,
            Box::new(std::io::Cursor::new(Vec::new())),
            Box::new(Vec::new()),
        )
        .unwrap();
        vm.run().unwrap();
        assert_eq!(vm.stack_depth(), 8);
        assert_eq!(vm.reg_load::<4>(crate::isa::ESP).unwrap(), 8u32.to_le_bytes());
    }
}
