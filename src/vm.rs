//! Typed surface of the host VM's introspection/control protocol.
//!
//! Everything here is an external collaborator: the engines consume these
//! traits and never reach into runtime internals directly. Handles are
//! opaque words whose validity the host manages.

use bitflags::bitflags;

use crate::arch::InstructionSet;
use crate::dex::image::DexFileInfo;
use crate::dex::ir::{AccessFlags, ProtoId, TypeId};
use crate::error::HookError;
use crate::transformer::TransformerAdapter;

/// Opaque reference to a loaded class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassRef(pub u64);

/// Opaque reference to a resolved method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodRef(pub u64);

/// Opaque reference to a class loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoaderRef(pub u64);

/// Opaque reference to a late-bound callable handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleRef(pub u64);

bitflags! {
    /// Runtime-private method flags layered over the dex access flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ArtFlags: u32 {
        const SKIP_ACCESS_CHECKS = 0x0008_0000;
        const PRE_COMPILED = 0x0080_0000;
        const COMPILE_DONT_BOTHER = 0x0200_0000;
        const FAST_INTERPRETER_TO_INTERPRETER_INVOKE = 0x4000_0000;
    }
}

/// Link/initialization states the engines care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassStatus {
    Resolved,
    Verified,
    Initialized,
}

/// Debuggability states of the host runtime. A debuggable runtime keeps
/// re-resolving method entry points behind installed patches, so the hook
/// engine pins the non-debuggable state before touching anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeDebugState {
    NonJavaDebuggable,
    JavaDebuggable,
}

/// Identity of a hookable unit, immutable once captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub class: ClassRef,
    pub name: String,
    pub proto: ProtoId,
    pub access: AccessFlags,
}

impl TargetDescriptor {
    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }

    pub fn is_native(&self) -> bool {
        self.access.contains(AccessFlags::NATIVE)
    }

    pub fn is_abstract(&self) -> bool {
        self.access.contains(AccessFlags::ABSTRACT)
    }

    pub fn is_constructor(&self) -> bool {
        self.access.contains(AccessFlags::CONSTRUCTOR)
    }

    pub fn is_static_constructor(&self) -> bool {
        self.access
            .contains(AccessFlags::CONSTRUCTOR | AccessFlags::STATIC)
    }

    /// The signature a detached callable for this method carries: instance
    /// methods take their declaring class as leading parameter.
    pub fn raw_call_proto(&self, class_type: &TypeId) -> ProtoId {
        let mut parameters = Vec::with_capacity(self.proto.parameters.len() + 1);
        if !self.is_static() {
            parameters.push(class_type.clone());
        }
        parameters.extend(self.proto.parameters.iter().cloned());
        ProtoId::new(self.proto.return_type.clone(), parameters)
    }
}

/// Live view of a class's method table, for the redefinition engine's
/// version-specific method-count compensation.
#[derive(Debug, Clone, Copy)]
pub struct MethodTableWindow {
    pub table: u64,
    pub count: u32,
    pub copied_offset: u32,
}

/// Introspection and control operations the hooking engines need from the
/// host runtime.
pub trait VmRuntime {
    fn sdk_version(&self) -> u32;
    fn instruction_set(&self) -> InstructionSet;

    fn describe(&self, method: MethodRef) -> TargetDescriptor;
    /// Runtime identity passed in the hidden self-identity slot.
    fn art_method(&self, method: MethodRef) -> u64;
    fn entry_point(&self, method: MethodRef) -> u64;
    fn set_entry_point(&self, method: MethodRef, entry: u64);
    fn update_method_flags(&self, method: MethodRef, set: ArtFlags, clear: ArtFlags);
    /// Prevents an optimizing compiler from bypassing an interpreter-level
    /// patch later.
    fn make_non_compilable(&self, method: MethodRef);
    fn set_runtime_debug_state(&self, state: RuntimeDebugState);

    fn class_type(&self, class: ClassRef) -> TypeId;
    fn loader_of(&self, class: ClassRef) -> LoaderRef;
    fn superclass_of(&self, class: ClassRef) -> Option<ClassRef>;
    fn make_class_public(&self, class: ClassRef);
    fn make_fields_public(&self, class: ClassRef);
    fn ensure_visibly_initialized(&self, class: ClassRef) -> Result<(), HookError>;
    fn set_class_status(&self, class: ClassRef, status: ClassStatus);

    fn class_exists(&self, loader: LoaderRef, name: &str) -> bool;
    fn load_class(
        &self,
        dex: &[u8],
        name: &str,
        loader: LoaderRef,
        trusted: bool,
    ) -> Result<ClassRef, HookError>;
    /// A fresh loader with no classpath of its own.
    fn isolated_loader(&self) -> LoaderRef;
    fn find_method(
        &self,
        class: ClassRef,
        name: &str,
        proto: &ProtoId,
    ) -> Result<MethodRef, HookError>;

    fn unreflect(&self, method: MethodRef) -> HandleRef;
    fn reinterpret_handle(&self, handle: HandleRef, proto: &ProtoId) -> HandleRef;
    fn make_transformer(&self, proto: &ProtoId, adapter: TransformerAdapter) -> HandleRef;
    fn bind_static_handle(&self, class: ClassRef, field: &str, handle: HandleRef);

    /// Runs `finalizer` once `class` becomes unreachable.
    fn on_class_unloaded(&self, class: ClassRef, finalizer: Box<dyn FnOnce() + Send>);
    /// Keeps `dependent` reachable at least as long as `owner`.
    fn pin_lifetime(&self, owner: ClassRef, dependent: ClassRef);

    fn dex_file_info(&self, class: ClassRef) -> DexFileInfo;
    fn class_def_index(&self, class: ClassRef) -> Option<u32>;
    /// Runtime method identities in dex order (direct table, then virtual).
    fn art_methods(&self, class: ClassRef) -> Vec<u64>;

    fn method_table_window(&self, class: ClassRef) -> Option<MethodTableWindow>;
    fn set_method_count(&self, table: u64, count: u32);
}

/// Stops and restarts every other thread in the process.
pub trait ThreadSuspender {
    fn suspend_all(&self, cause: &str);
    fn resume_all(&self);
}

/// Scoped "stop the world" bracket; resumption happens on every exit path,
/// including panics.
pub struct SuspendScope<'a> {
    suspender: &'a dyn ThreadSuspender,
}

impl<'a> SuspendScope<'a> {
    pub fn new(suspender: &'a dyn ThreadSuspender, cause: &str) -> SuspendScope<'a> {
        suspender.suspend_all(cause);
        SuspendScope { suspender }
    }
}

impl Drop for SuspendScope<'_> {
    fn drop(&mut self) {
        self.suspender.resume_all();
    }
}

/// Recovers the quickening-table index a rewritten instruction refers to.
pub trait QuickenIndexSource {
    fn index_at(&self, art_method: u64, dex_pc: u32) -> Option<u16>;
}
