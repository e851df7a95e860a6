//! The VM's flat memory region.
//!
//! The program image is loaded at offset zero, so memory operands (which
//! encode absolute stream offsets) address their data-section bytes
//! directly; the remainder of the region is zero-filled scratch space.

/// Error type for memory accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    OutOfBounds { addr: usize, len: usize },
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::OutOfBounds { addr, len } => {
                write!(f, "memory access of {} bytes at {} out of bounds", len, addr)
            }
        }
    }
}

impl std::error::Error for MemoryError {}

/// Bounds-checked byte memory.
#[derive(Debug)]
pub struct Memory {
    bytes: Vec<u8>,
}

impl Memory {
    /// A zeroed region of at least `size` bytes with `image` at offset 0.
    pub fn with_image(image: &[u8], size: usize) -> Self {
        let mut bytes = vec![0u8; size.max(image.len())];
        bytes[..image.len()].copy_from_slice(image);
        Self { bytes }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    fn check(&self, addr: usize, len: usize) -> Result<(), MemoryError> {
        if addr.checked_add(len).is_none_or(|end| end > self.bytes.len()) {
            return Err(MemoryError::OutOfBounds { addr, len });
        }
        Ok(())
    }

    pub fn load<const N: usize>(&self, addr: usize) -> Result<[u8; N], MemoryError> {
        self.check(addr, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[addr..addr + N]);
        Ok(out)
    }

    pub fn store<const N: usize>(&mut self, addr: usize, value: [u8; N]) -> Result<(), MemoryError> {
        self.check(addr, N)?;
        self.bytes[addr..addr + N].copy_from_slice(&value);
        Ok(())
    }
}
