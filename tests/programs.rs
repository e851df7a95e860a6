//! End-to-end tests: assemble source, interpret it, check the output.

use std::cell::RefCell;
use std::io::{Cursor, Write};
use std::process::Command;
use std::rc::Rc;

use stax::asm;
use stax::vm::{Vm, VmFault};

#[derive(Clone, Default)]
struct Sink(Rc<RefCell<Vec<u8>>>);

impl Sink {
    fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).unwrap()
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run(source: &str, input: &str) -> (Result<(), VmFault>, String) {
    let program = asm::assemble(source).unwrap();
    let sink = Sink::default();
    let mut vm = Vm::with_io(
        &program.bytes,
        Box::new(Cursor::new(input.as_bytes().to_vec())),
        Box::new(sink.clone()),
    )
    .unwrap();
    let result = vm.run();
    (result, sink.contents())
}

#[test]
fn test_arithmetic_chain() {
    // (10 - 4) * 3 = 18; sub computes top - prev
    let source = "
.code
    push 4
    push 10
    sub
    push 3
    mul
    out
    stop
";
    let (result, out) = run(source, "");
    assert!(result.is_ok());
    assert_eq!(out, "18\n");
}

#[test]
fn test_countdown_loop() {
    let source = "
.code
    push 3
again:
    dworddup
    out
    push -1
    add
    dworddup
    push 0
    cmp
    jne again
    stop
";
    let (result, out) = run(source, "");
    assert!(result.is_ok());
    assert_eq!(out, "3\n2\n1\n");
}

#[test]
fn test_data_and_memory_traffic() {
    let source = "
.data
    total: dword raw
.code
    push 19
    push 23
    add
    pop [total]
    push [total]
    out
    stop
";
    let (result, out) = run(source, "");
    assert!(result.is_ok());
    assert_eq!(out, "42\n");
}

#[test]
fn test_call_and_ret() {
    // `call` leaves the return address on top of the argument; the callee
    // parks it in eax and restores it before `ret`.
    let source = "
.code
    push 5
    call square
    out
    stop
square:
    pop eax
    dworddup
    mul
    push eax
    ret
";
    let (result, out) = run(source, "");
    assert!(result.is_ok());
    assert_eq!(out, "25\n");
}

#[test]
fn test_float_pipeline() {
    let source = "
.code
    push 2.0
    push 7.0
    fdiv
    fout
    stop
";
    let (result, out) = run(source, "");
    assert!(result.is_ok());
    assert_eq!(out, "3.5\n");
}

#[test]
fn test_char_output_is_raw() {
    let source = "
.code
    push 'h'
    cout
    push 'i'
    cout
    push '\\n'
    cout
    stop
";
    let (result, out) = run(source, "");
    assert!(result.is_ok());
    assert_eq!(out, "hi\n");
}

#[test]
fn test_echo_doubled_input() {
    let source = "
.code
    in
    dworddup
    add
    out
    stop
";
    let (result, out) = run(source, "21\n");
    assert!(result.is_ok());
    assert_eq!(out, "42\n");
}

#[test]
fn test_pow_and_abs() {
    let source = "
.code
    push 3
    push 2
    pow
    out
    push -9
    abs
    out
    stop
";
    let (result, out) = run(source, "");
    assert!(result.is_ok());
    assert_eq!(out, "8\n9\n");
}

#[test]
fn test_divide_by_zero_faults() {
    let source = "
.code
    push 0
    push 1
    div
    stop
";
    let (result, _) = run(source, "");
    assert!(matches!(result, Err(VmFault::DivideByZero)));
}

#[test]
fn test_err_instruction_faults() {
    let (result, _) = run(".code\nerr\nstop\n", "");
    assert!(matches!(result, Err(VmFault::ErrInstruction)));
}

#[test]
fn test_disassembly_reassembles_identically() {
    let source = "
.data
    x: dword 1234
    c: byte 'Q'
.code
    push [x]
    out
    push byte [c]
    cout
loop:
    push -1
    add
    dworddup
    push 0
    cmp
    jne loop
    stop
";
    let program = asm::assemble(source).unwrap();
    let listing = stax::disasm::disassemble(&program.bytes).unwrap();
    let again = asm::assemble(&listing).unwrap();
    assert_eq!(program.bytes, again.bytes);
}

// CLI coverage: assemble to a file, run the binary, decode it.

#[test]
fn test_cli_asm_run_dasm() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("answer.sm");
    std::fs::write(&src, ".code\npush 42\nout\nstop\n").unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_stax"))
        .current_dir(dir.path())
        .args(["asm", "answer.sm"])
        .status()
        .unwrap();
    assert!(status.success());
    let bin = dir.path().join("answer.bin");
    assert!(bin.exists());

    let output = Command::new(env!("CARGO_BIN_EXE_stax"))
        .current_dir(dir.path())
        .args(["run", "answer.bin"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "42\n");

    let output = Command::new(env!("CARGO_BIN_EXE_stax"))
        .current_dir(dir.path())
        .args(["dasm", "answer.bin"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let listing = String::from_utf8_lossy(&output.stdout);
    assert!(listing.contains(".code"));
    assert!(listing.contains("push_int 42"));
}

#[test]
fn test_cli_run_assembles_source_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("hello.sm");
    std::fs::write(&src, ".code\npush 'h'\ncout\npush '\\n'\ncout\nstop\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_stax"))
        .current_dir(dir.path())
        .args(["run", "hello.sm"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "h\n");
}

#[test]
fn test_cli_reports_assembly_error() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("bad.sm");
    std::fs::write(&src, ".code\nfrobnicate\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_stax"))
        .current_dir(dir.path())
        .args(["asm", "bad.sm"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("line 2"));
    assert!(stderr.contains("frobnicate"));
}

#[test]
fn test_cli_honors_manifest_limits() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("stax.toml"), "[runtime]\nstack_size = 8\n").unwrap();
    let src = dir.path().join("deep.sm");
    // Ten dword pushes overflow an 8-byte stack.
    let body: String = std::iter::repeat_n("push 1\n", 10).collect();
    std::fs::write(&src, format!(".code\n{}stop\n", body)).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_stax"))
        .current_dir(dir.path())
        .args(["run", "deep.sm"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}
