//! Batched, callback-style hooking through atomic class redefinition.
//!
//! Rather than patching entry points, this engine rewrites each hooked
//! method's bytecode into a stub that forwards to a late-bound handle, and
//! moves the verbatim original body into a per-class "backup" companion
//! class. All touched classes are submitted in a single redefinition call,
//! so a batch either fully lands or leaves the VM untouched.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use crate::dex::codec::{DexCodec, DexReaderCache};
use crate::dex::image::{content, header_offset, Memory};
use crate::dex::ir::{
    AccessFlags, ClassDef, FieldDef, FieldId, MethodDef, MethodId, ProtoId, TypeId,
};
use crate::dex::quicken::{dequicken_class, needs_dequicken};
use crate::error::HookError;
use crate::ti::{ClassDefinition, TiEnv};
use crate::transformer::{handle_stub, HookTransformer, TransformerAdapter};
use crate::vm::{
    ArtFlags, ClassRef, ClassStatus, MethodRef, QuickenIndexSource, TargetDescriptor, VmRuntime,
};

/// One method of a batch, with everything resolved before any VM mutation.
struct ExecutableRequest {
    /// Position within the declaring class's batch; names the backup
    /// method/field pair.
    ordinal: usize,
    descriptor: TargetDescriptor,
    /// Call signature of the detached body, receiver included.
    raw: ProtoId,
    hooker: Arc<dyn HookTransformer>,
}

/// All batch entries sharing one declaring class, which map onto one
/// redefinition entry and one backup class.
struct ClassRequest {
    class: ClassRef,
    executables: Vec<ExecutableRequest>,
}

/// Restores truncated live method counts on every exit path.
struct MethodCountGuard<'a> {
    vm: &'a dyn VmRuntime,
    restores: Vec<(u64, u32)>,
}

impl Drop for MethodCountGuard<'_> {
    fn drop(&mut self) {
        for &(table, count) in &self.restores {
            self.vm.set_method_count(table, count);
        }
    }
}

pub struct RedefineEngine<'a> {
    vm: &'a dyn VmRuntime,
    ti: &'a dyn TiEnv,
    codec: &'a dyn DexCodec,
    quicken: &'a dyn QuickenIndexSource,
}

impl<'a> RedefineEngine<'a> {
    pub fn new(
        vm: &'a dyn VmRuntime,
        ti: &'a dyn TiEnv,
        codec: &'a dyn DexCodec,
        quicken: &'a dyn QuickenIndexSource,
    ) -> RedefineEngine<'a> {
        RedefineEngine {
            vm,
            ti,
            codec,
            quicken,
        }
    }

    /// Installs every `(target, callback)` pair of the batch atomically.
    ///
    /// Constructors, native and abstract methods are rejected, as is any
    /// method listed twice, before a single byte of VM state changes.
    pub fn hook(
        &self,
        mem: &mut dyn Memory,
        requests: Vec<(MethodRef, Arc<dyn HookTransformer>)>,
    ) -> Result<(), HookError> {
        let groups = self.validate(requests)?;
        if groups.is_empty() {
            return Ok(());
        }

        let mut readers: HashMap<u64, Box<dyn DexReaderCache>> = HashMap::new();
        let mut definitions = Vec::with_capacity(groups.len());
        for group in &groups {
            let rebuilt = self.process_class(mem, &mut readers, group)?;
            definitions.push(ClassDefinition {
                class: group.class,
                bytes: self.codec.write(&[rebuilt])?,
            });
        }

        let _counts = self.narrow_method_tables(&groups);
        debug!(
            "redefining {} classes for {} hooked methods",
            definitions.len(),
            groups.iter().map(|g| g.executables.len()).sum::<usize>()
        );
        self.ti.redefine_classes(&definitions)?;
        Ok(())
    }

    fn validate(
        &self,
        requests: Vec<(MethodRef, Arc<dyn HookTransformer>)>,
    ) -> Result<Vec<ClassRequest>, HookError> {
        let mut groups: Vec<ClassRequest> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for (method, hooker) in requests {
            if !seen.insert(method) {
                return Err(HookError::DuplicateTarget);
            }
            let descriptor = self.vm.describe(method);
            if descriptor.is_constructor() {
                return Err(HookError::UnsupportedTarget("constructor"));
            }
            if descriptor.is_native() {
                return Err(HookError::UnsupportedTarget("native method"));
            }
            if descriptor.is_abstract() {
                return Err(HookError::UnsupportedTarget("abstract method"));
            }

            let class = descriptor.class;
            let raw = descriptor.raw_call_proto(&self.vm.class_type(class));
            let index = match groups.iter().position(|g| g.class == class) {
                Some(index) => index,
                None => {
                    groups.push(ClassRequest {
                        class,
                        executables: Vec::new(),
                    });
                    groups.len() - 1
                }
            };
            let ordinal = groups[index].executables.len();
            groups[index].executables.push(ExecutableRequest {
                ordinal,
                descriptor,
                raw,
                hooker,
            });
        }

        Ok(groups)
    }

    /// Decodes the declaring class, builds and installs its backup class,
    /// and returns the stub-rewritten definition.
    fn process_class(
        &self,
        mem: &mut dyn Memory,
        readers: &mut HashMap<u64, Box<dyn DexReaderCache>>,
        group: &ClassRequest,
    ) -> Result<ClassDef, HookError> {
        let class = group.class;
        let index = self
            .vm
            .class_def_index(class)
            .ok_or(HookError::MissingClassDefIndex)?;

        // one decode per distinct resident image, however many classes of
        // the batch live in it
        let info = self.vm.dex_file_info(class);
        let reader = match readers.entry(info.header) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let bytes = content(mem, &info)?;
                let offset = header_offset(mem, &info)?;
                e.insert(self.codec.open(&bytes, offset)?)
            }
        };

        let mut def = reader.class_def(index)?;
        if needs_dequicken(self.vm.sdk_version()) {
            let table = self.vm.art_methods(class);
            def = dequicken_class(reader.as_ref(), self.quicken, &table, &def)?;
        }

        let backup_class = self.install_backup(&def, group)?;

        // The declaring class's hidden members stay reachable from the
        // relocated bodies; below SDK 29 skip-access-checks alone does not
        // cover field access from another class.
        if self.vm.sdk_version() <= 28 {
            self.vm.make_fields_public(class);
        }
        self.vm.pin_lifetime(class, backup_class);

        // rewrite every hooked body into its forwarding stub
        let backup_type = self.vm.class_type(backup_class);
        for request in &group.executables {
            let target = def
                .direct_methods
                .iter_mut()
                .chain(def.virtual_methods.iter_mut())
                .find(|m| {
                    m.id.name == request.descriptor.name && m.id.proto == request.descriptor.proto
                })
                .ok_or_else(|| {
                    HookError::Vm(format!(
                        "{} missing from decoded class",
                        request.descriptor.name
                    ))
                })?;
            target.code = Some(handle_stub(
                &request.raw,
                handle_field(&backup_type, request.ordinal),
            ));
        }
        Ok(def)
    }

    /// Synthesizes, loads and wires the backup class: verbatim bodies as
    /// static executables, one late-bound handle field per hooked method.
    fn install_backup(
        &self,
        def: &ClassDef,
        group: &ClassRequest,
    ) -> Result<ClassRef, HookError> {
        let loader = self.vm.loader_of(group.class);
        let name = self.backup_name(group.class);
        let backup_type = TypeId::of_name(&name);

        // Relocated bodies may invoke-super; the chain stays resolvable
        // only if the backup shares the original superclass and can see it.
        let superclass = def.superclass.clone().unwrap_or_else(TypeId::object);
        if let Some(sup) = self.vm.superclass_of(group.class) {
            self.vm.make_class_public(sup);
        }

        let mut fields = Vec::with_capacity(group.executables.len());
        let mut methods = Vec::with_capacity(group.executables.len());
        for request in &group.executables {
            let body = def
                .methods()
                .find(|m| {
                    m.id.name == request.descriptor.name && m.id.proto == request.descriptor.proto
                })
                .and_then(|m| m.code.clone())
                .ok_or(HookError::MissingCode)?;
            fields.push(FieldDef {
                id: handle_field(&backup_type, request.ordinal),
                access: AccessFlags::PUBLIC | AccessFlags::STATIC,
            });
            methods.push(MethodDef {
                id: MethodId {
                    class: backup_type.clone(),
                    name: executable_name(request.ordinal),
                    proto: request.raw.clone(),
                },
                access: AccessFlags::PUBLIC | AccessFlags::STATIC,
                code: Some(body),
            });
        }

        let backup = ClassDef {
            type_id: backup_type,
            access: AccessFlags::PUBLIC,
            superclass: Some(superclass),
            interfaces: vec![],
            fields,
            direct_methods: methods,
            virtual_methods: vec![],
        };
        let bytes = self.codec.write(&[backup])?;
        let backup_class = self.vm.load_class(&bytes, &name, loader, true)?;
        // never re-verified, never recompiled: the bodies were already
        // verified in their original home
        self.vm.set_class_status(backup_class, ClassStatus::Verified);

        for request in &group.executables {
            let backup_method = self.vm.find_method(
                backup_class,
                &executable_name(request.ordinal),
                &request.raw,
            )?;
            self.vm.update_method_flags(
                backup_method,
                ArtFlags::PRE_COMPILED
                    | ArtFlags::COMPILE_DONT_BOTHER
                    | ArtFlags::SKIP_ACCESS_CHECKS,
                ArtFlags::empty(),
            );
            let original = self.vm.unreflect(backup_method);
            let transformer = self.vm.make_transformer(
                &request.raw,
                TransformerAdapter {
                    original,
                    hooker: Arc::clone(&request.hooker),
                },
            );
            self.vm.bind_static_handle(
                backup_class,
                &handle_name(request.ordinal),
                transformer,
            );
        }
        Ok(backup_class)
    }

    fn backup_name(&self, class: ClassRef) -> String {
        let descriptor = self.vm.class_type(class);
        let dotted = descriptor
            .descriptor()
            .trim_start_matches('L')
            .trim_end_matches(';')
            .replace('/', ".");
        let loader = self.vm.loader_of(class);
        (0..)
            .map(|n| format!("{dotted}_Backup{n}"))
            .find(|candidate| !self.vm.class_exists(loader, candidate))
            .unwrap_or_else(|| unreachable!())
    }

    /// On the one release whose redefinition path re-copies method tables
    /// by their live count, shrink each count to the copied-methods offset
    /// for the duration of the call.
    fn narrow_method_tables(&self, groups: &[ClassRequest]) -> MethodCountGuard<'a> {
        let mut guard = MethodCountGuard {
            vm: self.vm,
            restores: Vec::new(),
        };
        if self.vm.sdk_version() != 26 {
            return guard;
        }
        for group in groups {
            match self.vm.method_table_window(group.class) {
                Some(window) => {
                    self.vm.set_method_count(window.table, window.copied_offset);
                    guard.restores.push((window.table, window.count));
                }
                None => warn!(
                    "no method table window for class {:#x}, skipping count fix",
                    group.class.0
                ),
            }
        }
        guard
    }
}

fn executable_name(ordinal: usize) -> String {
    format!("executable_{ordinal}")
}

fn handle_name(ordinal: usize) -> String {
    format!("handle_{ordinal}")
}

fn handle_field(backup_type: &TypeId, ordinal: usize) -> FieldId {
    FieldId {
        class: backup_type.clone(),
        name: handle_name(ordinal),
        field_type: TypeId::method_handle(),
    }
}
