//! The x86-64 JIT translator.
//!
//! The same binary stream the interpreter runs is translated, whole-program
//! and two-pass, into native code executed in-process:
//! - Pass one walks the code section with blank targets to learn the native
//!   offset of every bytecode instruction.
//! - Pass two re-emits with real targets resolved through that map.
//! Addresses that depend on where the code lands (the region base, the
//! marshalling buffers, the host callback) are recorded as relocations and
//! patched in `execute()` once the mapping exists.
//!
//! This module is only compiled when the `jit` feature is enabled; actual
//! native execution additionally requires unix and x86-64.

mod codebuf;
mod image;
#[cfg(unix)]
mod memory;
mod x86_64;

pub use image::{Image, JitError};
#[cfg(unix)]
pub use memory::{ExecutableMemory, MapError};
