//! stax: a stack-machine toolchain.
//!
//! One opcode table, three consumers:
//! - [`asm`] assembles textual source into a binary instruction stream,
//! - [`vm`] interprets that stream,
//! - [`jit`] translates it to x86-64 and runs it in-process,
//! with [`disasm`] decoding streams back into listings.

pub mod asm;
pub mod config;
pub mod disasm;
pub mod isa;
#[cfg(feature = "jit")]
pub mod jit;
pub mod vm;
