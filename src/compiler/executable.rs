//! CompiledKernel: mmap'd executable code for a generated kernel.
//!
//! Wraps a block of JIT-compiled machine code (a reduction driver or an
//! activation kernel). The code is stored in an executable memory region
//! (via mmap) and called through a function pointer taking up to six
//! integer arguments.

use crate::types::{JitError, JitResult};

/// Signature of a compiled kernel: six integer-class arguments, no return.
///
/// Unused trailing arguments are passed as zero.
pub type CompiledKernelFn = unsafe extern "C" fn(u64, u64, u64, u64, u64, u64);

/// A JIT-compiled kernel.
pub struct CompiledKernel {
    code: ExecutableBuffer,
    /// Bytes of actual code (before page rounding).
    code_len: usize,
}

impl CompiledKernel {
    /// Create a kernel from raw machine code bytes.
    pub fn from_code(code_bytes: &[u8]) -> JitResult<Self> {
        if code_bytes.is_empty() {
            return Err(JitError::Assembler("empty code buffer".into()));
        }
        let code = ExecutableBuffer::new(code_bytes)?;
        Ok(CompiledKernel {
            code,
            code_len: code_bytes.len(),
        })
    }

    /// Get the entry point function pointer.
    ///
    /// # Safety
    /// The caller must ensure the compiled code is valid.
    #[inline]
    pub unsafe fn entry_point(&self) -> CompiledKernelFn {
        std::mem::transmute(self.code.ptr)
    }

    /// Size of the mapped region in bytes (page-rounded).
    pub fn mapped_size(&self) -> usize {
        self.code.len
    }

    /// Size of the emitted code in bytes.
    pub fn code_size(&self) -> usize {
        self.code_len
    }

    /// Call the kernel with up to six integer arguments.
    ///
    /// # Safety
    /// Every pointer passed in `args` must be valid for the accesses the
    /// generated code performs.
    #[inline]
    pub unsafe fn invoke(&self, args: &[u64]) {
        assert!(args.len() <= 6, "too many arguments");
        let mut a = [0u64; 6];
        a[..args.len()].copy_from_slice(args);
        let f = self.entry_point();
        f(a[0], a[1], a[2], a[3], a[4], a[5]);
    }
}

impl std::fmt::Debug for CompiledKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("code_len", &self.code_len)
            .field("mapped", &self.code.len)
            .finish()
    }
}

/// An executable memory buffer backed by mmap.
struct ExecutableBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: ExecutableBuffer owns its mmap'd memory exclusively. The pointer is
// never aliased and the buffer is immutable (PROT_READ|PROT_EXEC) after construction.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    /// Allocate an executable memory region and copy code into it.
    fn new(code: &[u8]) -> JitResult<Self> {
        // Round up to page size
        let page_size = page_size();
        let len = (code.len() + page_size - 1) & !(page_size - 1);

        // SAFETY: mmap with MAP_PRIVATE|MAP_ANONYMOUS creates a new anonymous mapping.
        // No file descriptor is used (-1). Return value is checked for MAP_FAILED.
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
            return Err(JitError::Mmap(format!(
                "mmap of {len} bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let ptr = ptr as *mut u8;

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }

        // Make executable (and read-only)
        let ret = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::munmap(ptr as *mut _, len);
            }
            return Err(JitError::Mmap(format!("mprotect failed: {err}")));
        }

        Ok(ExecutableBuffer { ptr, len })
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() && self.len > 0 {
            unsafe {
                libc::munmap(self.ptr as *mut _, self.len);
            }
        }
    }
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}
