//! Mock collaborators shared by the engine test modules.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::arch::InstructionSet;
use crate::dex::codec::{DexCodec, DexReaderCache};
use crate::dex::image::DexFileInfo;
use crate::dex::ir::{AccessFlags, ClassDef, FieldId, MethodId, ProtoId, TypeId};
use crate::dex::DexError;
use crate::error::HookError;
use crate::transformer::TransformerAdapter;
use crate::vm::{
    ArtFlags, ClassRef, ClassStatus, HandleRef, LoaderRef, MethodRef, MethodTableWindow,
    RuntimeDebugState, TargetDescriptor, ThreadSuspender, VmRuntime,
};

/// Counts suspend/resume brackets and checks they stay balanced.
#[derive(Default)]
pub struct RecordingSuspender {
    depth: AtomicU32,
    completed: AtomicU32,
}

impl RecordingSuspender {
    /// Completed suspend-all/resume-all cycles.
    pub fn cycles(&self) -> u32 {
        assert_eq!(self.depth.load(Ordering::SeqCst), 0, "unbalanced suspend");
        self.completed.load(Ordering::SeqCst)
    }
}

impl ThreadSuspender for RecordingSuspender {
    fn suspend_all(&self, _cause: &str) {
        self.depth.fetch_add(1, Ordering::SeqCst);
    }
    fn resume_all(&self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Serializer stand-in for tests that never decode what it wrote.
pub struct NullCodec;

impl DexCodec for NullCodec {
    fn open(&self, _bytes: &[u8], _header_offset: u32) -> Result<Box<dyn DexReaderCache>, DexError> {
        Err(DexError::Malformed("null codec has no reader"))
    }

    fn write(&self, classes: &[ClassDef]) -> Result<Vec<u8>, DexError> {
        Ok(vec![classes.len() as u8])
    }
}

/// Pool-backed reader plus a write log, for exercising the redefinition
/// pipeline end to end.
#[derive(Default)]
pub struct PoolCodec {
    pub class_defs: HashMap<u32, ClassDef>,
    pub method_ids: HashMap<u32, MethodId>,
    pub field_ids: HashMap<u32, FieldId>,
    pub writes: Mutex<Vec<Vec<ClassDef>>>,
}

struct PoolReader {
    class_defs: HashMap<u32, ClassDef>,
    method_ids: HashMap<u32, MethodId>,
    field_ids: HashMap<u32, FieldId>,
}

impl DexReaderCache for PoolReader {
    fn class_def(&self, index: u32) -> Result<ClassDef, DexError> {
        self.class_defs
            .get(&index)
            .cloned()
            .ok_or(DexError::BadClassIndex(index))
    }
    fn method_id(&self, index: u32) -> Result<MethodId, DexError> {
        self.method_ids
            .get(&index)
            .cloned()
            .ok_or(DexError::BadMethodIndex(index))
    }
    fn field_id(&self, index: u32) -> Result<FieldId, DexError> {
        self.field_ids
            .get(&index)
            .cloned()
            .ok_or(DexError::BadFieldIndex(index))
    }
}

impl DexCodec for PoolCodec {
    fn open(&self, _bytes: &[u8], _header_offset: u32) -> Result<Box<dyn DexReaderCache>, DexError> {
        Ok(Box::new(PoolReader {
            class_defs: self.class_defs.clone(),
            method_ids: self.method_ids.clone(),
            field_ids: self.field_ids.clone(),
        }))
    }

    fn write(&self, classes: &[ClassDef]) -> Result<Vec<u8>, DexError> {
        let mut writes = self.writes.lock().unwrap();
        writes.push(classes.to_vec());
        Ok(vec![writes.len() as u8])
    }
}

struct MethodState {
    descriptor: TargetDescriptor,
    entry: u64,
    non_compilable: bool,
    set_flags: ArtFlags,
    cleared_flags: ArtFlags,
}

struct ClassState {
    type_id: TypeId,
    loader: LoaderRef,
    superclass: Option<ClassRef>,
    status: Option<ClassStatus>,
    init_requests: u32,
    made_public: bool,
    fields_public: bool,
    dex_info: Option<DexFileInfo>,
    class_def_index: Option<u32>,
    art_methods: Vec<u64>,
    window: Option<MethodTableWindow>,
    bound: Vec<(String, HandleRef)>,
    finalizers: Vec<Box<dyn FnOnce() + Send>>,
}

struct VmState {
    classes: HashMap<u64, ClassState>,
    methods: HashMap<u64, MethodState>,
    names: HashSet<(u64, String)>,
    raw_entries: HashSet<u64>,
    transformers: Vec<TransformerAdapter>,
    pins: Vec<(ClassRef, ClassRef)>,
    count_log: Vec<(u64, u32)>,
    loaded: Vec<(String, LoaderRef, bool)>,
    debug_state: Option<RuntimeDebugState>,
    next_class: u64,
    next_method: u64,
    next_loader: u64,
    next_handle: u64,
    next_entry: u64,
}

/// Scriptable in-memory runtime. Classes and methods are registered up
/// front; classes loaded through [`VmRuntime::load_class`] resolve any
/// method name on demand with a fresh synthetic entry point.
pub struct MockVm {
    sdk: u32,
    iset: InstructionSet,
    pub loads: AtomicU32,
    state: Mutex<VmState>,
}

impl MockVm {
    pub fn new() -> MockVm {
        MockVm {
            sdk: 30,
            iset: InstructionSet::X86_64,
            loads: AtomicU32::new(0),
            state: Mutex::new(VmState {
                classes: HashMap::new(),
                methods: HashMap::new(),
                names: HashSet::new(),
                raw_entries: HashSet::new(),
                transformers: Vec::new(),
                pins: Vec::new(),
                count_log: Vec::new(),
                loaded: Vec::new(),
                debug_state: None,
                next_class: 1,
                next_method: 1,
                next_loader: 100,
                next_handle: 1000,
                next_entry: 0x7000_0000,
            }),
        }
    }

    pub fn with_instruction_set(mut self, iset: InstructionSet) -> MockVm {
        self.iset = iset;
        self
    }

    pub fn with_sdk(mut self, sdk: u32) -> MockVm {
        self.sdk = sdk;
        self
    }

    pub fn add_class(&self, descriptor: &str) -> ClassRef {
        let mut state = self.state.lock().unwrap();
        let id = state.next_class;
        state.next_class += 1;
        let type_id = TypeId::new(descriptor);
        let dotted = descriptor
            .trim_start_matches('L')
            .trim_end_matches(';')
            .replace('/', ".");
        state.names.insert((1, dotted));
        state.classes.insert(
            id,
            ClassState {
                type_id,
                loader: LoaderRef(1),
                superclass: None,
                status: None,
                init_requests: 0,
                made_public: false,
                fields_public: false,
                dex_info: None,
                class_def_index: None,
                art_methods: Vec::new(),
                window: None,
                bound: Vec::new(),
                finalizers: Vec::new(),
            },
        );
        ClassRef(id)
    }

    pub fn add_method(
        &self,
        class: ClassRef,
        name: &str,
        proto: ProtoId,
        access: AccessFlags,
        entry: u64,
    ) -> MethodRef {
        let mut state = self.state.lock().unwrap();
        let id = state.next_method;
        state.next_method += 1;
        state.raw_entries.insert(entry);
        state.methods.insert(
            id,
            MethodState {
                descriptor: TargetDescriptor {
                    class,
                    name: name.to_owned(),
                    proto,
                    access,
                },
                entry,
                non_compilable: false,
                set_flags: ArtFlags::empty(),
                cleared_flags: ArtFlags::empty(),
            },
        );
        MethodRef(id)
    }

    pub fn add_static_method(&self, class: ClassRef, name: &str, entry: u64) -> MethodRef {
        self.add_method(
            class,
            name,
            ProtoId::new(TypeId::new("V"), vec![]),
            AccessFlags::PUBLIC | AccessFlags::STATIC,
            entry,
        )
    }

    pub fn add_abstract_method(&self, class: ClassRef, name: &str) -> MethodRef {
        self.add_method(
            class,
            name,
            ProtoId::new(TypeId::new("V"), vec![]),
            AccessFlags::PUBLIC | AccessFlags::ABSTRACT,
            0,
        )
    }

    pub fn add_static_constructor(&self, class: ClassRef, entry: u64) -> MethodRef {
        self.add_method(
            class,
            "<clinit>",
            ProtoId::new(TypeId::new("V"), vec![]),
            AccessFlags::STATIC | AccessFlags::CONSTRUCTOR,
            entry,
        )
    }

    pub fn set_superclass(&self, class: ClassRef, superclass: ClassRef) {
        self.class_mut(class, |c| c.superclass = Some(superclass));
    }

    pub fn set_dex_info(&self, class: ClassRef, info: DexFileInfo) {
        self.class_mut(class, |c| c.dex_info = Some(info));
    }

    pub fn set_class_def_index(&self, class: ClassRef, index: u32) {
        self.class_mut(class, |c| c.class_def_index = Some(index));
    }

    pub fn set_art_methods_table(&self, class: ClassRef, methods: Vec<u64>) {
        self.class_mut(class, |c| c.art_methods = methods);
    }

    pub fn set_window(&self, class: ClassRef, window: MethodTableWindow) {
        self.class_mut(class, |c| c.window = Some(window));
    }

    pub fn is_raw_entry(&self, entry: u64) -> bool {
        self.state.lock().unwrap().raw_entries.contains(&entry)
    }

    pub fn is_non_compilable(&self, method: MethodRef) -> bool {
        self.state.lock().unwrap().methods[&method.0].non_compilable
    }

    pub fn set_flags(&self, method: MethodRef) -> ArtFlags {
        self.state.lock().unwrap().methods[&method.0].set_flags
    }

    pub fn cleared_flags(&self, method: MethodRef) -> ArtFlags {
        self.state.lock().unwrap().methods[&method.0].cleared_flags
    }

    pub fn initialization_requests(&self, class: ClassRef) -> u32 {
        self.state.lock().unwrap().classes[&class.0].init_requests
    }

    pub fn pending_finalizers(&self, class: ClassRef) -> usize {
        self.state.lock().unwrap().classes[&class.0].finalizers.len()
    }

    pub fn class_status(&self, class: ClassRef) -> Option<ClassStatus> {
        self.state.lock().unwrap().classes[&class.0].status
    }

    pub fn is_class_public(&self, class: ClassRef) -> bool {
        self.state.lock().unwrap().classes[&class.0].made_public
    }

    pub fn are_fields_public(&self, class: ClassRef) -> bool {
        self.state.lock().unwrap().classes[&class.0].fields_public
    }

    pub fn bound_handles(&self, class: ClassRef) -> Vec<(String, HandleRef)> {
        self.state.lock().unwrap().classes[&class.0].bound.clone()
    }

    pub fn transformer_count(&self) -> usize {
        self.state.lock().unwrap().transformers.len()
    }

    pub fn pins(&self) -> Vec<(ClassRef, ClassRef)> {
        self.state.lock().unwrap().pins.clone()
    }

    pub fn method_count_log(&self) -> Vec<(u64, u32)> {
        self.state.lock().unwrap().count_log.clone()
    }

    pub fn loaded_classes(&self) -> Vec<(String, LoaderRef, bool)> {
        self.state.lock().unwrap().loaded.clone()
    }

    pub fn debug_state(&self) -> Option<RuntimeDebugState> {
        self.state.lock().unwrap().debug_state
    }

    fn class_mut(&self, class: ClassRef, f: impl FnOnce(&mut ClassState)) {
        let mut state = self.state.lock().unwrap();
        f(state.classes.get_mut(&class.0).expect("unknown class"));
    }
}

impl Default for MockVm {
    fn default() -> MockVm {
        MockVm::new()
    }
}

impl VmRuntime for MockVm {
    fn sdk_version(&self) -> u32 {
        self.sdk
    }

    fn instruction_set(&self) -> InstructionSet {
        self.iset
    }

    fn describe(&self, method: MethodRef) -> TargetDescriptor {
        self.state.lock().unwrap().methods[&method.0].descriptor.clone()
    }

    fn art_method(&self, method: MethodRef) -> u64 {
        0xa000_0000 + method.0
    }

    fn entry_point(&self, method: MethodRef) -> u64 {
        self.state.lock().unwrap().methods[&method.0].entry
    }

    fn set_entry_point(&self, method: MethodRef, entry: u64) {
        let mut state = self.state.lock().unwrap();
        state.methods.get_mut(&method.0).expect("unknown method").entry = entry;
    }

    fn update_method_flags(&self, method: MethodRef, set: ArtFlags, clear: ArtFlags) {
        let mut state = self.state.lock().unwrap();
        let m = state.methods.get_mut(&method.0).expect("unknown method");
        m.set_flags |= set;
        m.cleared_flags |= clear;
    }

    fn make_non_compilable(&self, method: MethodRef) {
        let mut state = self.state.lock().unwrap();
        state
            .methods
            .get_mut(&method.0)
            .expect("unknown method")
            .non_compilable = true;
    }

    fn set_runtime_debug_state(&self, state: RuntimeDebugState) {
        self.state.lock().unwrap().debug_state = Some(state);
    }

    fn class_type(&self, class: ClassRef) -> TypeId {
        self.state.lock().unwrap().classes[&class.0].type_id.clone()
    }

    fn loader_of(&self, class: ClassRef) -> LoaderRef {
        self.state.lock().unwrap().classes[&class.0].loader
    }

    fn superclass_of(&self, class: ClassRef) -> Option<ClassRef> {
        self.state.lock().unwrap().classes[&class.0].superclass
    }

    fn make_class_public(&self, class: ClassRef) {
        self.class_mut(class, |c| c.made_public = true);
    }

    fn make_fields_public(&self, class: ClassRef) {
        self.class_mut(class, |c| c.fields_public = true);
    }

    fn ensure_visibly_initialized(&self, class: ClassRef) -> Result<(), HookError> {
        self.class_mut(class, |c| c.init_requests += 1);
        Ok(())
    }

    fn set_class_status(&self, class: ClassRef, status: ClassStatus) {
        self.class_mut(class, |c| c.status = Some(status));
    }

    fn class_exists(&self, loader: LoaderRef, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .names
            .contains(&(loader.0, name.to_owned()))
    }

    fn load_class(
        &self,
        _dex: &[u8],
        name: &str,
        loader: LoaderRef,
        trusted: bool,
    ) -> Result<ClassRef, HookError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let id = state.next_class;
        state.next_class += 1;
        state.names.insert((loader.0, name.to_owned()));
        state.loaded.push((name.to_owned(), loader, trusted));
        state.classes.insert(
            id,
            ClassState {
                type_id: TypeId::of_name(name),
                loader,
                superclass: None,
                status: None,
                init_requests: 0,
                made_public: false,
                fields_public: false,
                dex_info: None,
                class_def_index: None,
                art_methods: Vec::new(),
                window: None,
                bound: Vec::new(),
                finalizers: Vec::new(),
            },
        );
        Ok(ClassRef(id))
    }

    fn isolated_loader(&self) -> LoaderRef {
        let mut state = self.state.lock().unwrap();
        let id = state.next_loader;
        state.next_loader += 1;
        LoaderRef(id)
    }

    fn find_method(
        &self,
        class: ClassRef,
        name: &str,
        proto: &ProtoId,
    ) -> Result<MethodRef, HookError> {
        {
            let state = self.state.lock().unwrap();
            if let Some((id, _)) = state.methods.iter().find(|(_, m)| {
                m.descriptor.class == class
                    && m.descriptor.name == name
                    && &m.descriptor.proto == proto
            }) {
                return Ok(MethodRef(*id));
            }
            if !state.classes.contains_key(&class.0) {
                return Err(HookError::Vm(format!("unknown class {:#x}", class.0)));
            }
        }
        // loaded classes resolve anything by name
        let entry = {
            let mut state = self.state.lock().unwrap();
            state.next_entry += 0x100;
            state.next_entry
        };
        Ok(self.add_method(
            class,
            name,
            proto.clone(),
            AccessFlags::PUBLIC | AccessFlags::STATIC,
            entry,
        ))
    }

    fn unreflect(&self, _method: MethodRef) -> HandleRef {
        let mut state = self.state.lock().unwrap();
        state.next_handle += 1;
        HandleRef(state.next_handle)
    }

    fn reinterpret_handle(&self, _handle: HandleRef, _proto: &ProtoId) -> HandleRef {
        let mut state = self.state.lock().unwrap();
        state.next_handle += 1;
        HandleRef(state.next_handle)
    }

    fn make_transformer(&self, _proto: &ProtoId, adapter: TransformerAdapter) -> HandleRef {
        let mut state = self.state.lock().unwrap();
        state.transformers.push(adapter);
        state.next_handle += 1;
        HandleRef(state.next_handle)
    }

    fn bind_static_handle(&self, class: ClassRef, field: &str, handle: HandleRef) {
        self.class_mut(class, |c| c.bound.push((field.to_owned(), handle)));
    }

    fn on_class_unloaded(&self, class: ClassRef, finalizer: Box<dyn FnOnce() + Send>) {
        self.class_mut(class, |c| c.finalizers.push(finalizer));
    }

    fn pin_lifetime(&self, owner: ClassRef, dependent: ClassRef) {
        self.state.lock().unwrap().pins.push((owner, dependent));
    }

    fn dex_file_info(&self, class: ClassRef) -> DexFileInfo {
        self.state.lock().unwrap().classes[&class.0]
            .dex_info
            .expect("dex info not scripted")
    }

    fn class_def_index(&self, class: ClassRef) -> Option<u32> {
        self.state.lock().unwrap().classes[&class.0].class_def_index
    }

    fn art_methods(&self, class: ClassRef) -> Vec<u64> {
        self.state.lock().unwrap().classes[&class.0].art_methods.clone()
    }

    fn method_table_window(&self, class: ClassRef) -> Option<MethodTableWindow> {
        self.state.lock().unwrap().classes[&class.0].window
    }

    fn set_method_count(&self, table: u64, count: u32) {
        self.state.lock().unwrap().count_log.push((table, count));
    }
}
