use std::io;
use std::os::raw::c_void;
use std::ptr;

use crate::error::HookError;

/// An executable copy of a trampoline, resident until dropped.
///
/// The mapping is created writable, filled, then flipped to read+execute.
/// A blob installed as a live entry point must not be dropped while any
/// thread may still be executing through it; the hook engine ties blob
/// ownership to the unload of the hooked method's declaring class.
pub struct CodeBlob {
    addr: *mut u8,
    len: usize,
}

// The mapping is process-global and never aliased mutably after `map`.
unsafe impl Send for CodeBlob {}
unsafe impl Sync for CodeBlob {}

impl CodeBlob {
    /// Maps `code` into fresh anonymous executable memory.
    pub fn map(code: &[u8]) -> Result<CodeBlob, HookError> {
        let page = page_size();
        let len = code.len().div_ceil(page) * page;

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(HookError::CodeAlloc(io::Error::last_os_error()));
        }
        let addr = addr as *mut u8;

        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), addr, code.len());
            if libc::mprotect(addr as *mut c_void, len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                let err = io::Error::last_os_error();
                libc::munmap(addr as *mut c_void, len);
                return Err(HookError::CodeAlloc(err));
            }
            flush_icache(addr, code.len());
        }

        Ok(CodeBlob { addr, len })
    }

    pub fn addr(&self) -> u64 {
        self.addr as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for CodeBlob {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr as *mut c_void, self.len);
        }
    }
}

fn page_size() -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        4096
    } else {
        page as usize
    }
}

#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
unsafe fn flush_icache(addr: *mut u8, len: usize) {
    extern "C" {
        fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
    }
    __clear_cache(addr as *mut libc::c_char, addr.add(len) as *mut libc::c_char);
}

#[cfg(not(any(target_arch = "arm", target_arch = "aarch64")))]
unsafe fn flush_icache(_addr: *mut u8, _len: usize) {}
