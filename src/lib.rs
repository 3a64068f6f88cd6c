//! Runtime method hooking for an Android-style managed VM: per-arch
//! entry-point trampolines, transformer callbacks over late-bound handles,
//! and batched atomic class redefinition.

pub mod arch;
pub mod blob;
pub mod dex;
pub mod entry_points;
pub mod error;
pub mod hooks;
pub mod maps;
pub mod redefine;
pub mod symbols;
pub mod ti;
pub mod transformer;
pub mod vm;

#[cfg(test)]
mod testutil;

pub use error::HookError;
pub use hooks::{EntryPointType, HookEngine};
pub use redefine::RedefineEngine;
pub use transformer::{FrameValue, HookTransformer, StackFrame, TransformerAdapter};
