//! Locates and repairs in-memory dex data for an already-loaded class.
//!
//! Three physical layouts are handled: a monolithic image, one entry inside
//! a multi-header container, and compact dex split into a main section plus
//! a shared data section living elsewhere. Protected images (magic or size
//! fields zeroed) are repaired in place before any bytes are copied out, so
//! the result satisfies the format's own self-consistency checks.

use std::io;
use std::ptr;

use log::debug;
use sha1::{Digest, Sha1};

use super::offsets::{
    is_container_version, is_standard_version, BASE_HEADER_SIZE, CHECKSUM_DATA_START,
    CHECKSUM_OFFSET, DATA_OFF_OFFSET, DATA_SIZE_OFFSET, ENDIAN_CONSTANT, ENDIAN_TAG_OFFSET,
    FILE_SIZE_OFFSET, HEADER_OFF_OFFSET, HEADER_SIZE_OFFSET, MAGIC, SIGNATURE_DATA_START,
    SIGNATURE_OFFSET, SIGNATURE_SIZE, VERSION_OFFSET,
};
use super::DexError;
use crate::maps::{maps, MapEntry};

/// Where a loaded class's dex data lives, as reported by the host runtime.
///
/// For standard and container layouts the data section spans the whole
/// image; for compact dex it is the shared data section only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DexFileInfo {
    pub header: u64,
    pub data_begin: u64,
    pub data_size: u64,
    pub compact: bool,
}

/// Byte-addressed access to the image's resident memory.
pub trait Memory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), DexError>;
    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), DexError>;

    fn read_u32(&self, addr: u64) -> Result<u32, DexError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), DexError> {
        self.write(addr, &value.to_le_bytes())
    }
}

/// Process-local memory, with reads filtered through the readable ranges of
/// `/proc/self/maps`: unreadable stretches inside a requested span come back
/// zeroed rather than faulting.
pub struct ProcessMemory {
    readable: Vec<(u64, u64)>,
}

impl ProcessMemory {
    pub fn current() -> io::Result<ProcessMemory> {
        Ok(ProcessMemory::from_entries(&maps("self")?))
    }

    pub fn from_entries(entries: &[MapEntry]) -> ProcessMemory {
        ProcessMemory {
            readable: entries
                .iter()
                .filter(|e| e.is_readable())
                .map(|e| (e.start, e.end))
                .collect(),
        }
    }
}

impl Memory for ProcessMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), DexError> {
        buf.fill(0);
        let end = addr + buf.len() as u64;
        for &(start, stop) in &self.readable {
            if stop <= addr || start >= end {
                continue;
            }
            let copy_begin = addr.max(start);
            let copy_end = end.min(stop);
            let offset = (copy_begin - addr) as usize;
            let len = (copy_end - copy_begin) as usize;
            unsafe {
                ptr::copy_nonoverlapping(
                    copy_begin as *const u8,
                    buf.as_mut_ptr().add(offset),
                    len,
                );
            }
        }
        Ok(())
    }

    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), DexError> {
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        Ok(())
    }
}

/// Rolling 32-bit additive checksum mandated by the format.
pub fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65_521;
    let mut a = 1u32;
    let mut b = 0u32;
    for &byte in data {
        a = (a + u32::from(byte)) % MOD;
        b = (b + a) % MOD;
    }
    (b << 16) | a
}

fn stored_file_size(mem: &dyn Memory, info: &DexFileInfo) -> Result<u32, DexError> {
    mem.read_u32(info.header + FILE_SIZE_OFFSET as u64)
}

/// A protected image has its magic word or size field cleared.
pub fn is_protected(mem: &dyn Memory, info: &DexFileInfo) -> Result<bool, DexError> {
    Ok(mem.read_u32(info.header)? == 0 || stored_file_size(mem, info)? == 0)
}

/// Reconstructs a stripped header in place: magic, total size recomputed
/// from the data-start and data-size fields, header size, endianness tag,
/// and (unless `skip_digests`) the checksum and signature recomputed over
/// the repaired body at their fixed offsets.
pub fn repair_header(
    mem: &mut dyn Memory,
    info: &DexFileInfo,
    skip_digests: bool,
) -> Result<(), DexError> {
    if info.compact {
        return Err(DexError::CompactUnsupported);
    }
    let version = mem.read_u32(info.header + VERSION_OFFSET as u64)?;
    if !is_standard_version(version) {
        return Err(DexError::UnsupportedVersion(version));
    }

    let file_size = mem.read_u32(info.header + DATA_OFF_OFFSET as u64)?
        + mem.read_u32(info.header + DATA_SIZE_OFFSET as u64)?;
    debug!("repairing protected dex header at {:#x}, size {file_size:#x}", info.header);

    mem.write(info.header, &MAGIC)?;
    mem.write_u32(info.header + FILE_SIZE_OFFSET as u64, file_size)?;
    mem.write_u32(info.header + HEADER_SIZE_OFFSET as u64, BASE_HEADER_SIZE)?;
    mem.write_u32(info.header + ENDIAN_TAG_OFFSET as u64, ENDIAN_CONSTANT)?;

    if skip_digests {
        return Ok(());
    }

    let mut body = vec![0u8; file_size as usize];
    mem.read(info.header, &mut body)?;
    if body.len() < SIGNATURE_DATA_START {
        return Err(DexError::Truncated("image smaller than its header"));
    }

    let digest = Sha1::digest(&body[SIGNATURE_DATA_START..]);
    body[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE].copy_from_slice(&digest);
    mem.write(info.header + SIGNATURE_OFFSET as u64, &digest)?;

    let checksum = adler32(&body[CHECKSUM_DATA_START..]);
    mem.write_u32(info.header + CHECKSUM_OFFSET as u64, checksum)?;
    Ok(())
}

/// Copies the class's complete container bytes out of memory, repairing a
/// protected header first and recombining compact main/data sections into
/// one contiguous buffer.
pub fn content(mem: &mut dyn Memory, info: &DexFileInfo) -> Result<Vec<u8>, DexError> {
    if is_protected(mem, info)? {
        repair_header(mem, info, false)?;
    }
    if info.compact {
        let main_size = stored_file_size(mem, info)? as usize;
        let data_off = mem.read_u32(info.header + DATA_OFF_OFFSET as u64)? as usize;
        let mut out = vec![0u8; data_off + info.data_size as usize];
        mem.read(info.header, &mut out[..main_size])?;
        mem.read(info.data_begin, &mut out[data_off..])?;
        return Ok(out);
    }
    let mut out = vec![0u8; info.data_size as usize];
    mem.read(info.data_begin, &mut out)?;
    Ok(out)
}

/// Offset of this image's logical header within the copied bytes: zero for
/// standard and compact layouts, the header-offset field for containers.
pub fn header_offset(mem: &dyn Memory, info: &DexFileInfo) -> Result<u32, DexError> {
    if info.compact {
        return Ok(0);
    }
    let version = mem.read_u32(info.header + VERSION_OFFSET as u64)?;
    if is_standard_version(version) {
        return Ok(0);
    }
    if is_container_version(version) {
        return mem.read_u32(info.header + HEADER_OFF_OFFSET as u64);
    }
    Err(DexError::UnsupportedVersion(version))
}

/// Vector-backed memory for tests elsewhere in the crate.
#[cfg(test)]
pub(crate) struct VecMemory {
    pub base: u64,
    pub bytes: Vec<u8>,
}

#[cfg(test)]
impl Memory for VecMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), DexError> {
        let offset = addr.checked_sub(self.base).ok_or(DexError::OutOfRange {
            addr,
            len: buf.len() as u64,
        })? as usize;
        let end = offset + buf.len();
        if end > self.bytes.len() {
            return Err(DexError::OutOfRange {
                addr,
                len: buf.len() as u64,
            });
        }
        buf.copy_from_slice(&self.bytes[offset..end]);
        Ok(())
    }

    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), DexError> {
        let offset = addr.checked_sub(self.base).ok_or(DexError::OutOfRange {
            addr,
            len: bytes.len() as u64,
        })? as usize;
        let end = offset + bytes.len();
        if end > self.bytes.len() {
            return Err(DexError::OutOfRange {
                addr,
                len: bytes.len() as u64,
            });
        }
        self.bytes[offset..end].copy_from_slice(bytes);
        Ok(())
    }
}
