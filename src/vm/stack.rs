//! The byte-granular operand stack.
//!
//! Pushes and pops move the stack by exactly the width of the value, so a
//! dword pushed as four bytes can be popped back as four single bytes.
//! Capacity is fixed at construction; overflow and underflow are reported,
//! never silently wrapped.

/// Error type for stack operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    Overflow,
    Underflow,
}

impl std::fmt::Display for StackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackError::Overflow => write!(f, "operand stack overflow"),
            StackError::Underflow => write!(f, "operand stack underflow"),
        }
    }
}

impl std::error::Error for StackError {}

/// A bounded stack of raw bytes.
#[derive(Debug)]
pub struct OperandStack {
    bytes: Vec<u8>,
    capacity: usize,
}

impl OperandStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Current depth in bytes.
    pub fn depth(&self) -> usize {
        self.bytes.len()
    }

    pub fn push<const N: usize>(&mut self, value: [u8; N]) -> Result<(), StackError> {
        if self.bytes.len() + N > self.capacity {
            return Err(StackError::Overflow);
        }
        self.bytes.extend_from_slice(&value);
        Ok(())
    }

    pub fn pop<const N: usize>(&mut self) -> Result<[u8; N], StackError> {
        if self.bytes.len() < N {
            return Err(StackError::Underflow);
        }
        let split = self.bytes.len() - N;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[split..]);
        self.bytes.truncate(split);
        Ok(out)
    }

    /// Read `N` bytes starting `below` bytes under the top, without popping.
    pub fn peek<const N: usize>(&self, below: usize) -> Result<[u8; N], StackError> {
        if self.bytes.len() < below + N {
            return Err(StackError::Underflow);
        }
        let start = self.bytes.len() - below - N;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[start..start + N]);
        Ok(out)
    }
}
