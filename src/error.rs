use std::io;

use thiserror::Error;

use crate::arch::InstructionSet;
use crate::dex::DexError;
use crate::ti::TiError;

/// Errors produced by the hooking engines.
///
/// Precondition violations (`UnsupportedTarget`, `DuplicateTarget`) are
/// reported before any VM state is touched. Protocol failures carry the
/// host's own error code through [`TiError`]. Nothing is retried here;
/// retries are a caller concern.
#[derive(Debug, Error)]
pub enum HookError {
    /// The requested target kind cannot be hooked (constructor, native
    /// or abstract method in a batched redefinition).
    #[error("unsupported hook target: {0}")]
    UnsupportedTarget(&'static str),

    /// The same method appeared twice in one batch.
    #[error("method hooked twice in one batch")]
    DuplicateTarget,

    /// No trampoline encoding exists for this instruction set.
    #[error("instruction set {0} is not supported")]
    UnsupportedInstructionSet(InstructionSet),

    /// Mapping an executable code blob failed.
    #[error("code blob allocation failed")]
    CodeAlloc(#[source] io::Error),

    /// The quickening table has no entry for a quickened instruction.
    #[error("no quickening table index for pc {pc:#x}")]
    QuickenIndex { pc: u32 },

    /// The class is not backed by a dex class-def entry.
    #[error("class has no dex class-def index")]
    MissingClassDefIndex,

    /// A method selected for redefinition has no code item.
    #[error("method has no code item")]
    MissingCode,

    /// A host VM operation failed (class loading, initialization,
    /// method resolution).
    #[error("vm operation failed: {0}")]
    Vm(String),

    #[error(transparent)]
    Ti(#[from] TiError),

    #[error(transparent)]
    Dex(#[from] DexError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
