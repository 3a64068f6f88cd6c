//! Byte-level container reader/writer contract.
//!
//! The engines never parse or serialize dex bytes themselves; a host-provided
//! codec maps between raw images and the immutable IR. The reader cache
//! additionally resolves symbolic references by pool index, which is what the
//! dequickening pass consumes.

use super::ir::{ClassDef, FieldId, MethodId};
use super::DexError;

/// By-index access into one decoded image's pools.
pub trait DexReaderCache {
    fn class_def(&self, index: u32) -> Result<ClassDef, DexError>;
    fn method_id(&self, index: u32) -> Result<MethodId, DexError>;
    fn field_id(&self, index: u32) -> Result<FieldId, DexError>;
}

/// Immutable-IR reader/writer over raw container bytes.
pub trait DexCodec {
    /// Decodes the image whose logical header is at `header_offset` within
    /// `bytes`.
    fn open(&self, bytes: &[u8], header_offset: u32) -> Result<Box<dyn DexReaderCache>, DexError>;

    /// Serializes the given classes into one standard dex image.
    fn write(&self, classes: &[ClassDef]) -> Result<Vec<u8>, DexError>;
}
