//! Direct entry-point hooking: replaces a method's entry point with a
//! freshly mapped trampoline that carries the replacement's identity.
//!
//! Every redirection is installed under a stop-the-world bracket so no
//! thread observes a half-written entry point. Trampoline blobs stay
//! resident until the hooked method's declaring class unloads.

use log::debug;

use crate::arch::trampoline;
use crate::blob::CodeBlob;
use crate::dex::codec::DexCodec;
use crate::entry_points::EntryPoints;
use crate::error::HookError;
use crate::vm::{
    ArtFlags, MethodRef, RuntimeDebugState, SuspendScope, TargetDescriptor, ThreadSuspender,
    VmRuntime,
};

/// Which address of the replacement a trampoline transfers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPointType {
    /// The runtime's shared bridge for the replacement: the generic JNI
    /// trampoline if it is native, the to-interpreter bridge otherwise.
    /// Ignores whatever compiled code the replacement carries.
    Direct,
    /// Whatever entry point the replacement carries right now. Required
    /// when the replacement is itself already redirected.
    Current,
}

// The bridges never move once resolved, so one probe serves every engine
// in the process.
static PROCESS_ENTRY_POINTS: EntryPoints = EntryPoints::new();

pub struct HookEngine<'a> {
    vm: &'a dyn VmRuntime,
    suspender: &'a dyn ThreadSuspender,
    codec: &'a dyn DexCodec,
    entry_points: &'a EntryPoints,
}

/// A fully prepared redirection, not yet visible to any thread.
struct Redirect {
    target: MethodRef,
    descriptor: TargetDescriptor,
    blob: CodeBlob,
}

impl<'a> HookEngine<'a> {
    pub fn new(
        vm: &'a dyn VmRuntime,
        suspender: &'a dyn ThreadSuspender,
        codec: &'a dyn DexCodec,
    ) -> HookEngine<'a> {
        HookEngine::with_entry_points(vm, suspender, codec, &PROCESS_ENTRY_POINTS)
    }

    /// Same as [`HookEngine::new`] with a caller-owned bridge cache instead
    /// of the process-wide one.
    pub fn with_entry_points(
        vm: &'a dyn VmRuntime,
        suspender: &'a dyn ThreadSuspender,
        codec: &'a dyn DexCodec,
        entry_points: &'a EntryPoints,
    ) -> HookEngine<'a> {
        // A debuggable runtime re-resolves entry points behind installed
        // patches; pin the non-debuggable state before any patching.
        vm.set_runtime_debug_state(RuntimeDebugState::NonJavaDebuggable);
        HookEngine {
            vm,
            suspender,
            codec,
            entry_points,
        }
    }

    pub(crate) fn vm(&self) -> &'a dyn VmRuntime {
        self.vm
    }

    pub(crate) fn codec(&self) -> &'a dyn DexCodec {
        self.codec
    }

    /// Routes calls of `target` into `hooker`. The original body becomes
    /// unreachable; pair with [`HookEngine::hook_backup`] to keep it
    /// callable.
    pub fn hook(
        &self,
        target: MethodRef,
        hooker: MethodRef,
        entry: EntryPointType,
    ) -> Result<(), HookError> {
        let route = self.prepare(target, hooker, entry)?;
        self.commit(vec![route], "hook")
    }

    /// Exchanges the entry points of two methods, so each is reached
    /// through the other's former address. Swapping the same pair again
    /// restores both effective destinations.
    pub fn hook_swap(
        &self,
        first: MethodRef,
        second: MethodRef,
        entry: EntryPointType,
    ) -> Result<(), HookError> {
        // Both destinations are captured before either trampoline exists,
        // otherwise the second capture would observe the first redirect.
        let forward = self.prepare(first, second, entry)?;
        let backward = self.prepare(second, first, entry)?;
        self.commit(vec![forward, backward], "hook_swap")
    }

    /// Routes `target` into `hooker` while repointing `backup` at the
    /// target's former entry, keeping the original body callable.
    pub fn hook_backup(
        &self,
        target: MethodRef,
        hooker: MethodRef,
        backup: MethodRef,
        entry: EntryPointType,
    ) -> Result<(), HookError> {
        let saved = self.prepare(backup, target, EntryPointType::Current)?;
        let route = self.prepare(target, hooker, entry)?;
        self.commit(vec![saved, route], "hook_backup")
    }

    /// Forces `target` back through the runtime's shared bridge, undoing
    /// any compiled fast path: the generic JNI trampoline for native
    /// methods, the to-interpreter bridge otherwise.
    pub fn deoptimize(&self, target: MethodRef) -> Result<(), HookError> {
        let descriptor = self.vm.describe(target);
        if descriptor.is_abstract() {
            return Err(HookError::UnsupportedTarget("abstract method"));
        }
        let bridge = if descriptor.is_native() {
            self.entry_points.generic_jni_trampoline(self.vm, self.codec)?
        } else {
            self.entry_points.to_interpreter_bridge(self.vm, self.codec)?
        };
        {
            let _world = SuspendScope::new(self.suspender, "deoptimize");
            self.vm.make_non_compilable(target);
            self.vm.update_method_flags(
                target,
                ArtFlags::empty(),
                ArtFlags::FAST_INTERPRETER_TO_INTERPRETER_INVOKE,
            );
            self.vm.set_entry_point(target, bridge);
        }
        debug!("deoptimized {} to {bridge:#x}", descriptor.name);
        Ok(())
    }

    /// Waits for a class to become visibly initialized before any of its
    /// entry points are captured. A static constructor cannot wait for its
    /// own class to finish initializing.
    fn ensure_initialized(&self, descriptor: &TargetDescriptor) -> Result<(), HookError> {
        if !descriptor.is_static_constructor() {
            self.vm.ensure_visibly_initialized(descriptor.class)?;
        }
        Ok(())
    }

    /// Builds the trampoline for one target/replacement pair, without
    /// touching either method yet.
    fn prepare(
        &self,
        target: MethodRef,
        hooker: MethodRef,
        entry: EntryPointType,
    ) -> Result<Redirect, HookError> {
        let descriptor = self.vm.describe(target);
        if descriptor.is_abstract() {
            return Err(HookError::UnsupportedTarget("abstract method"));
        }
        let hooker_descriptor = self.vm.describe(hooker);
        self.ensure_initialized(&descriptor)?;
        self.ensure_initialized(&hooker_descriptor)?;

        let destination = match entry {
            EntryPointType::Direct if hooker_descriptor.is_native() => {
                self.entry_points.generic_jni_trampoline(self.vm, self.codec)?
            }
            EntryPointType::Direct => {
                self.entry_points.to_interpreter_bridge(self.vm, self.codec)?
            }
            EntryPointType::Current => self.vm.entry_point(hooker),
        };

        let code = trampoline(
            self.vm.instruction_set(),
            self.vm.art_method(hooker),
            destination,
        )?;
        let blob = CodeBlob::map(&code)?;

        Ok(Redirect {
            target,
            descriptor,
            blob,
        })
    }

    /// Flags every target and flips all prepared entry points inside one
    /// stop-the-world bracket, then parks each blob on its target's class
    /// unload.
    fn commit(&self, routes: Vec<Redirect>, cause: &str) -> Result<(), HookError> {
        {
            let _world = SuspendScope::new(self.suspender, cause);
            for route in &routes {
                self.vm.make_non_compilable(route.target);
                self.vm.update_method_flags(
                    route.target,
                    ArtFlags::FAST_INTERPRETER_TO_INTERPRETER_INVOKE,
                    ArtFlags::empty(),
                );
                self.vm.set_entry_point(route.target, route.blob.addr());
            }
        }
        for route in routes {
            debug!(
                "{cause}: {} now enters at {:#x}",
                route.descriptor.name,
                route.blob.addr()
            );
            self.vm
                .on_class_unloaded(route.descriptor.class, Box::new(move || drop(route.blob)));
        }
        Ok(())
    }
}
