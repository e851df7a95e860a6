//! Executable memory management using mmap.
//!
//! The region is mapped read/write for code placement and flipped to
//! read/write/execute before the entry call. It stays writable while
//! executing because the translated image keeps its data section inside
//! the region and stores to it through `pop` memory operands.

use std::ptr::NonNull;

/// Error type for mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    ZeroSize,
    AllocationFailed,
    ProtectionFailed,
    OutOfRange,
    NotExecutable,
}

impl std::fmt::Display for MapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapError::ZeroSize => write!(f, "cannot map an empty region"),
            MapError::AllocationFailed => write!(f, "mmap failed"),
            MapError::ProtectionFailed => write!(f, "mprotect failed"),
            MapError::OutOfRange => write!(f, "write outside the mapped region"),
            MapError::NotExecutable => write!(f, "region has not been made executable"),
        }
    }
}

impl std::error::Error for MapError {}

/// An anonymous private mapping holding generated code.
#[derive(Debug)]
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Map at least `size` bytes, rounded up to the page size.
    pub fn new(size: usize) -> Result<Self, MapError> {
        if size == 0 {
            return Err(MapError::ZeroSize);
        }
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let size = (size + page - 1) & !(page - 1);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MapError::AllocationFailed);
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(MapError::AllocationFailed)?;
        Ok(Self {
            ptr,
            size,
            executable: false,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MapError> {
        if self.executable {
            return Err(MapError::ProtectionFailed);
        }
        if offset + data.len() > self.size {
            return Err(MapError::OutOfRange);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Flip the region to read/write/execute.
    pub fn make_executable(&mut self) -> Result<(), MapError> {
        if self.executable {
            return Ok(());
        }
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(MapError::ProtectionFailed);
        }
        self.executable = true;
        Ok(())
    }

    /// The region's start as an `extern "C"` entry point.
    ///
    /// # Safety
    /// The caller must have placed valid x86-64 code at offset zero that
    /// follows the C ABI and returns.
    pub unsafe fn entry(&self) -> Result<extern "C" fn(), MapError> {
        if !self.executable {
            return Err(MapError::NotExecutable);
        }
        Ok(unsafe { std::mem::transmute::<*const u8, extern "C" fn()>(self.ptr.as_ptr()) })
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

unsafe impl Send for ExecutableMemory {}
