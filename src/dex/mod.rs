//! In-memory dex image access: IR model, codec contract, memory reader and
//! the dequickening pass.

pub mod codec;
pub mod image;
pub mod ir;
pub mod offsets;
pub mod quicken;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DexError {
    #[error("unsupported dex version {0:#010x}")]
    UnsupportedVersion(u32),

    #[error("compact dex headers cannot be repaired")]
    CompactUnsupported,

    #[error("memory access outside mapped range: {addr:#x}+{len:#x}")]
    OutOfRange { addr: u64, len: u64 },

    #[error("dex image truncated: {0}")]
    Truncated(&'static str),

    #[error("unknown class-def index {0}")]
    BadClassIndex(u32),

    #[error("unknown method index {0}")]
    BadMethodIndex(u32),

    #[error("unknown field index {0}")]
    BadFieldIndex(u32),

    #[error("malformed dex image: {0}")]
    Malformed(&'static str),
}
