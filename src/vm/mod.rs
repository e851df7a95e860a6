//! The stack-machine interpreter.

pub(crate) mod console;
mod cpu;
mod memory;
mod stack;

pub use cpu::{Vm, VmFault};
pub use memory::{Memory, MemoryError};
pub use stack::{OperandStack, StackError};

/// Default size of the flat memory region in bytes.
pub const DEFAULT_MEMORY_SIZE: usize = 4096;
/// Default operand stack capacity in bytes.
pub const DEFAULT_STACK_SIZE: usize = 1024;
