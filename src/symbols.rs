//! Resolution of libart internals the engine binds at run time.
//!
//! The suspension and quickening entry points are not part of any public
//! ABI; they are mangled C++ symbols inside libart.so. `dlsym` finds them
//! on builds that still export them dynamically; otherwise the mapped
//! library's ELF tables are searched directly and the address recombined
//! from the module load base.

use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::os::raw::c_char;

use goblin::elf::Elf;

use crate::maps::{find_module_base, find_module_path};
use crate::vm::{QuickenIndexSource, RuntimeDebugState, ThreadSuspender};

pub const SUSPEND_ALL: &str = "_ZN3art16ScopedSuspendAllC2EPKcb";
pub const RESUME_ALL: &str = "_ZN3art16ScopedSuspendAllD2Ev";
pub const GET_INDEX_FROM_QUICKENING: &str = "_ZN3art9ArtMethod22GetIndexFromQuickeningEj";
pub const SET_RUNTIME_DEBUG_STATE: &str =
    "_ZN3art7Runtime20SetRuntimeDebugStateENS0_17RuntimeDebugStateE";
pub const SET_JAVA_DEBUGGABLE: &str = "_ZN3art7Runtime17SetJavaDebuggableEb";

/// Looks a symbol up through the dynamic linker.
pub fn dlsym_addr(symbol: &str) -> Option<u64> {
    let name = CString::new(symbol).ok()?;
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    if addr.is_null() {
        None
    } else {
        Some(addr as u64)
    }
}

/// Finds `symbol` in the on-disk ELF at `path` and rebases its value
/// against the module's load address in this process.
pub fn resolve_in_module(path: &str, symbol: &str) -> io::Result<Option<u64>> {
    let buffer = fs::read(path)?;
    let elf = match Elf::parse(&buffer) {
        Ok(elf) => elf,
        Err(_) => return Ok(None),
    };

    let mut value = None;
    for sym in elf.syms.iter() {
        if elf.strtab.get_at(sym.st_name) == Some(symbol) {
            value = Some(sym.st_value);
            break;
        }
    }
    if value.is_none() {
        for sym in elf.dynsyms.iter() {
            if elf.dynstrtab.get_at(sym.st_name) == Some(symbol) {
                value = Some(sym.st_value);
                break;
            }
        }
    }

    let Some(value) = value else { return Ok(None) };
    Ok(find_module_base(path)?.map(|base| base + value))
}

/// Resolves a libart symbol: dynamic lookup first, ELF table scan second.
pub fn resolve_art_symbol(symbol: &str) -> io::Result<Option<u64>> {
    if let Some(addr) = dlsym_addr(symbol) {
        return Ok(Some(addr));
    }
    match find_module_path("libart.so")? {
        Some(path) => resolve_in_module(&path, symbol),
        None => Ok(None),
    }
}

type SuspendAllFn = unsafe extern "C" fn(usize, *const c_char, bool);
type ResumeAllFn = unsafe extern "C" fn(usize);
type GetIndexFn = unsafe extern "C" fn(u64, u32) -> u16;

/// [`ThreadSuspender`] backed by libart's `ScopedSuspendAll`.
pub struct ArtThreadSuspender {
    suspend: SuspendAllFn,
    resume: ResumeAllFn,
    cause: &'static CStr,
}

impl ArtThreadSuspender {
    /// Binds the suspension entry points.
    ///
    /// # Safety
    /// The resolved addresses must be the libart symbols named by
    /// [`SUSPEND_ALL`] and [`RESUME_ALL`] in this process.
    pub unsafe fn resolve() -> io::Result<Option<ArtThreadSuspender>> {
        let (Some(suspend), Some(resume)) = (
            resolve_art_symbol(SUSPEND_ALL)?,
            resolve_art_symbol(RESUME_ALL)?,
        ) else {
            return Ok(None);
        };
        Ok(Some(ArtThreadSuspender {
            suspend: std::mem::transmute::<u64, SuspendAllFn>(suspend),
            resume: std::mem::transmute::<u64, ResumeAllFn>(resume),
            cause: c"Hook",
        }))
    }
}

impl ThreadSuspender for ArtThreadSuspender {
    fn suspend_all(&self, _cause: &str) {
        unsafe { (self.suspend)(0, self.cause.as_ptr(), false) }
    }

    fn resume_all(&self) {
        unsafe { (self.resume)(0) }
    }
}

type SetDebugStateFn = unsafe extern "C" fn(usize, i32);

/// Writes the runtime's debuggability state through libart. The setter was
/// renamed in SDK 34; both spellings take the runtime instance and a small
/// integer, 0 meaning non-debuggable.
pub struct ArtDebugStateWriter {
    set_state: SetDebugStateFn,
    runtime: usize,
}

impl ArtDebugStateWriter {
    /// # Safety
    /// `runtime` must be this process's `art::Runtime` instance, and the
    /// resolved address the matching libart setter for `sdk`.
    pub unsafe fn resolve(sdk: u32, runtime: usize) -> io::Result<Option<ArtDebugStateWriter>> {
        let symbol = if sdk >= 34 {
            SET_RUNTIME_DEBUG_STATE
        } else {
            SET_JAVA_DEBUGGABLE
        };
        Ok(resolve_art_symbol(symbol)?.map(|addr| ArtDebugStateWriter {
            set_state: std::mem::transmute::<u64, SetDebugStateFn>(addr),
            runtime,
        }))
    }

    pub fn write(&self, state: RuntimeDebugState) {
        let value = match state {
            RuntimeDebugState::NonJavaDebuggable => 0,
            RuntimeDebugState::JavaDebuggable => 1,
        };
        unsafe { (self.set_state)(self.runtime, value) }
    }
}

/// [`QuickenIndexSource`] backed by `ArtMethod::GetIndexFromQuickening`.
pub struct ArtQuickenIndexSource {
    get_index: GetIndexFn,
}

impl ArtQuickenIndexSource {
    /// # Safety
    /// The resolved address must be the libart symbol named by
    /// [`GET_INDEX_FROM_QUICKENING`] in this process.
    pub unsafe fn resolve() -> io::Result<Option<ArtQuickenIndexSource>> {
        Ok(resolve_art_symbol(GET_INDEX_FROM_QUICKENING)?.map(|addr| {
            ArtQuickenIndexSource {
                get_index: std::mem::transmute::<u64, GetIndexFn>(addr),
            }
        }))
    }
}

impl QuickenIndexSource for ArtQuickenIndexSource {
    fn index_at(&self, art_method: u64, dex_pc: u32) -> Option<u16> {
        let index = unsafe { (self.get_index)(art_method, dex_pc) };
        // 0xffff marks "no mapping" in the quickening table
        if index == 0xffff {
            None
        } else {
            Some(index)
        }
    }
}
