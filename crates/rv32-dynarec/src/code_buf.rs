//! Executable memory behind the narrowest possible boundary: map a fresh
//! anonymous region read-write, copy the emitted bytes in, flip it to
//! read-execute, and never write through it again. All jump patching
//! happens in the plain `Vec<u8>` before the bytes get here.

use crate::{CompileError, RegionFn};

pub struct CodeBuf {
    ptr: *mut u8,
    len: usize,
}

impl CodeBuf {
    pub fn new(code: &[u8]) -> Result<Self, CompileError> {
        let page = 4096usize;
        let len = code.len().max(1).div_ceil(page) * page;
        // SAFETY: fresh private anonymous mapping, no aliasing.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CompileError::Backend {
                message: "mmap failed".into(),
            });
        }
        let ptr = ptr.cast::<u8>();
        // SAFETY: ptr is a valid mapping of at least code.len() bytes.
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len()) };
        // SAFETY: remapping our own fresh mapping.
        let rc = unsafe { libc::mprotect(ptr.cast(), len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            // SAFETY: unmapping the mapping created above.
            unsafe { libc::munmap(ptr.cast(), len) };
            return Err(CompileError::Backend {
                message: "mprotect(PROT_EXEC) failed".into(),
            });
        }
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Entry point at `offset` into the buffer.
    pub fn entry(&self, offset: usize) -> RegionFn {
        debug_assert!(offset < self.len);
        // SAFETY: the emitter generated code with exactly the RegionFn
        // signature at this offset.
        unsafe { std::mem::transmute::<*mut u8, RegionFn>(self.ptr.add(offset)) }
    }
}

impl Drop for CodeBuf {
    fn drop(&mut self) {
        // SAFETY: unmapping the mapping created in `new`.
        unsafe { libc::munmap(self.ptr.cast(), self.len) };
    }
}
