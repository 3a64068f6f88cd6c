//! Callback-style hooking over late-bound callables.
//!
//! A transformer hook routes calls of the target through a synthesized
//! "invoker" method whose only job is to tail-call a method handle stored
//! in a static field. The field is bound after class load to an adapter
//! that pairs the still-original callable with the user callback, so the
//! callback can both observe the frame and re-enter the unhooked body.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;
use once_cell::sync::Lazy;

use crate::dex::codec::DexCodec;
use crate::dex::ir::{
    AccessFlags, ClassDef, CodeItem, FieldDef, FieldId, Instruction, MethodDef, MethodId, Opcode,
    ProtoId, ShortyKind, TypeId,
};
use crate::error::HookError;
use crate::hooks::{EntryPointType, HookEngine};
use crate::vm::{HandleRef, MethodRef};

/// One value slot of an emulated call frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameValue {
    Void,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Reference(u64),
}

/// Host-materialized view of one intercepted call. Argument slots follow
/// the raw signature of the hooked method, receiver first for instance
/// methods.
pub trait StackFrame {
    fn argument_count(&self) -> usize;
    fn argument(&self, index: usize) -> FrameValue;
    fn set_argument(&mut self, index: usize, value: FrameValue);
    fn set_return(&mut self, value: FrameValue);
    /// Invokes `handle` with this frame's current arguments and stores its
    /// result as the frame's return value.
    fn call(&mut self, handle: HandleRef) -> Result<(), HookError>;
}

/// User callback run in place of the hooked method.
pub trait HookTransformer: Send + Sync {
    /// `original` reproduces the pre-hook behavior when passed to
    /// [`StackFrame::call`]. Not calling it suppresses the original body.
    fn transform(&self, original: HandleRef, frame: &mut dyn StackFrame) -> Result<(), HookError>;
}

/// What the host binds into an invoker's static handle field: the original
/// callable plus the callback that wraps it.
pub struct TransformerAdapter {
    pub original: HandleRef,
    pub hooker: Arc<dyn HookTransformer>,
}

impl TransformerAdapter {
    pub fn transform(&self, frame: &mut dyn StackFrame) -> Result<(), HookError> {
        self.hooker.transform(self.original, frame)
    }
}

pub(crate) const INVOKER_METHOD: &str = "invoke";
pub(crate) const INVOKER_FIELD: &str = "handle";

/// Loaded invoker images, one per erased signature. Signatures repeat
/// heavily across targets, so the dex bytes are worth keeping.
static INVOKER_CACHE: Lazy<Mutex<HashMap<String, Arc<Vec<u8>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn cache_key(proto: &ProtoId) -> String {
    let mut key = proto.shorty();
    for p in &proto.parameters {
        key.push_str(p.descriptor());
    }
    key.push_str(proto.return_type.descriptor());
    key
}

fn invoker_name(proto: &ProtoId) -> String {
    format!("hookrt.invoker.I{}", proto.shorty())
}

fn invoker_type(proto: &ProtoId) -> TypeId {
    TypeId::of_name(&invoker_name(proto))
}

/// Emits the body of a handle-forwarding stub for `proto`: load the bound
/// handle, hand every incoming register to `invokeExact`, return the result
/// by shorty kind. Shared with the redefinition stubs, where `field` names
/// the per-method backup slot instead.
pub(crate) fn handle_stub(proto: &ProtoId, field: FieldId) -> CodeItem {
    let ins = proto.input_registers();
    let wide_return = proto.return_type.is_wide();
    let locals: u16 = if wide_return { 2 } else { 1 };
    let handle_reg = locals - 1;

    let mut instructions = vec![
        Instruction::FieldOp21c {
            op: Opcode::SgetObject,
            reg: handle_reg as u8,
            field,
        },
        Instruction::InvokePolymorphicRange {
            count: (ins + 1) as u8,
            first: handle_reg,
            method: MethodId::method_handle_invoke_exact(),
            proto: proto.clone(),
        },
    ];
    match proto.return_type.kind() {
        ShortyKind::Void => instructions.push(Instruction::Nullary(Opcode::ReturnVoid)),
        ShortyKind::Narrow => {
            instructions.push(Instruction::Unary(Opcode::MoveResult, 0));
            instructions.push(Instruction::Unary(Opcode::Return, 0));
        }
        ShortyKind::Wide => {
            instructions.push(Instruction::Unary(Opcode::MoveResultWide, 0));
            instructions.push(Instruction::Unary(Opcode::ReturnWide, 0));
        }
        ShortyKind::Reference => {
            instructions.push(Instruction::Unary(Opcode::MoveResultObject, 0));
            instructions.push(Instruction::Unary(Opcode::ReturnObject, 0));
        }
    }

    CodeItem {
        registers: locals + ins,
        ins,
        outs: ins + 1,
        instructions,
        tries: vec![],
    }
}

/// One static-method class per erased signature.
fn invoker_class(proto: &ProtoId) -> ClassDef {
    let type_id = invoker_type(proto);
    let field = FieldId {
        class: type_id.clone(),
        name: INVOKER_FIELD.to_owned(),
        field_type: TypeId::method_handle(),
    };
    ClassDef {
        type_id: type_id.clone(),
        access: AccessFlags::PUBLIC,
        superclass: Some(TypeId::object()),
        interfaces: vec![],
        fields: vec![FieldDef {
            id: field.clone(),
            access: AccessFlags::PUBLIC | AccessFlags::STATIC,
        }],
        direct_methods: vec![MethodDef {
            id: MethodId {
                class: type_id,
                name: INVOKER_METHOD.to_owned(),
                proto: proto.clone(),
            },
            access: AccessFlags::PUBLIC | AccessFlags::STATIC,
            code: Some(handle_stub(proto, field)),
        }],
        virtual_methods: vec![],
    }
}

fn invoker_image(codec: &dyn DexCodec, proto: &ProtoId) -> Result<Arc<Vec<u8>>, HookError> {
    let mut cache = INVOKER_CACHE.lock().unwrap();
    if let Some(bytes) = cache.get(&cache_key(proto)) {
        return Ok(Arc::clone(bytes));
    }
    let bytes = Arc::new(codec.write(&[invoker_class(proto)])?);
    cache.insert(cache_key(proto), Arc::clone(&bytes));
    Ok(bytes)
}

impl<'a> HookEngine<'a> {
    /// Replaces `target` with `hooker`, leaving the original body callable
    /// through the handle the callback receives.
    ///
    /// Installations for the same target must be serialized by the caller;
    /// distinct targets may race freely against the invoker cache.
    pub fn hook_transform(
        &self,
        target: MethodRef,
        hooker: Arc<dyn HookTransformer>,
    ) -> Result<(), HookError> {
        let vm = self.vm();
        let descriptor = vm.describe(target);
        if descriptor.is_abstract() {
            return Err(HookError::UnsupportedTarget("abstract method"));
        }
        let raw = descriptor.raw_call_proto(&vm.class_type(descriptor.class));
        let erased = raw.erased();

        let image = invoker_image(self.codec(), &erased)?;
        let name = invoker_name(&erased);
        let class = vm.load_class(&image, &name, vm.isolated_loader(), true)?;
        let invoker = vm.find_method(class, INVOKER_METHOD, &erased)?;

        // After the swap below, the invoker method's entry runs the original
        // body; unreflecting it now yields the "call the unhooked target"
        // handle the callback is given.
        let original = vm.reinterpret_handle(vm.unreflect(invoker), &raw);
        let adapter = TransformerAdapter {
            original,
            hooker,
        };
        let transformer = vm.make_transformer(&raw, adapter);
        let bound = vm.reinterpret_handle(transformer, &erased);
        vm.bind_static_handle(class, INVOKER_FIELD, bound);

        // The invoker class (and everything bound into it) must outlive the
        // hooked class; a collected invoker under a live hook would leave a
        // dangling entry point.
        vm.pin_lifetime(descriptor.class, class);

        debug!(
            "transformer hook: {}.{} via {}",
            vm.class_type(descriptor.class).descriptor(),
            descriptor.name,
            name
        );
        self.hook_swap(target, invoker, EntryPointType::Current)
    }
}
