//! Immutable class/method/field/instruction IR, the product of the
//! byte-level reader and the input of the writer.
//!
//! Only the instruction shapes the engines inspect or emit are structured;
//! everything else round-trips through [`Instruction::Other`] untouched.

use bitflags::bitflags;

bitflags! {
    /// Dex access flags, including the synthetic constructor marker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const VOLATILE = 0x0040;
        const BRIDGE = 0x0040;
        const TRANSIENT = 0x0080;
        const VARARGS = 0x0080;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const CONSTRUCTOR = 0x0001_0000;
        const DECLARED_SYNCHRONIZED = 0x0002_0000;
    }
}

impl AccessFlags {
    pub const VISIBILITY_MASK: AccessFlags = AccessFlags::PUBLIC
        .union(AccessFlags::PRIVATE)
        .union(AccessFlags::PROTECTED);

    /// Methods stored in the direct table of a class.
    pub fn is_direct(self) -> bool {
        self.intersects(
            AccessFlags::STATIC
                .union(AccessFlags::PRIVATE)
                .union(AccessFlags::CONSTRUCTOR),
        )
    }
}

/// Return/value category implied by a type's shorty character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortyKind {
    Void,
    Narrow,
    Wide,
    Reference,
}

/// A type descriptor in dex form (`Ljava/lang/Object;`, `I`, `[B`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeId {
    descriptor: String,
}

impl TypeId {
    pub const OBJECT_DESCRIPTOR: &'static str = "Ljava/lang/Object;";
    pub const METHOD_HANDLE_DESCRIPTOR: &'static str = "Ljava/lang/invoke/MethodHandle;";

    pub fn new(descriptor: impl Into<String>) -> TypeId {
        TypeId {
            descriptor: descriptor.into(),
        }
    }

    pub fn object() -> TypeId {
        TypeId::new(Self::OBJECT_DESCRIPTOR)
    }

    pub fn method_handle() -> TypeId {
        TypeId::new(Self::METHOD_HANDLE_DESCRIPTOR)
    }

    pub fn object_array() -> TypeId {
        TypeId::new("[Ljava/lang/Object;")
    }

    /// Builds a descriptor from a dotted class name (`a.b.C` -> `La/b/C;`).
    pub fn of_name(name: &str) -> TypeId {
        TypeId {
            descriptor: format!("L{};", name.replace('.', "/")),
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn shorty(&self) -> char {
        match self.descriptor.as_bytes().first() {
            Some(b'L') | Some(b'[') => 'L',
            Some(&c) => c as char,
            None => 'V',
        }
    }

    pub fn kind(&self) -> ShortyKind {
        match self.shorty() {
            'V' => ShortyKind::Void,
            'J' | 'D' => ShortyKind::Wide,
            'L' => ShortyKind::Reference,
            _ => ShortyKind::Narrow,
        }
    }

    pub fn is_wide(&self) -> bool {
        self.kind() == ShortyKind::Wide
    }

    /// Erases reference types to `java.lang.Object`; primitives keep their
    /// width.
    pub fn erased(&self) -> TypeId {
        if self.kind() == ShortyKind::Reference {
            TypeId::object()
        } else {
            self.clone()
        }
    }
}

/// An erased or concrete call signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtoId {
    pub return_type: TypeId,
    pub parameters: Vec<TypeId>,
}

impl ProtoId {
    pub fn new(return_type: TypeId, parameters: Vec<TypeId>) -> ProtoId {
        ProtoId {
            return_type,
            parameters,
        }
    }

    pub fn shorty(&self) -> String {
        let mut out = String::with_capacity(self.parameters.len() + 1);
        out.push(self.return_type.shorty());
        for p in &self.parameters {
            out.push(p.shorty());
        }
        out
    }

    /// Registers consumed by the parameter list (wide values take two).
    pub fn input_registers(&self) -> u16 {
        self.parameters
            .iter()
            .map(|p| if p.is_wide() { 2u16 } else { 1 })
            .sum()
    }

    pub fn erased(&self) -> ProtoId {
        ProtoId {
            return_type: self.return_type.erased(),
            parameters: self.parameters.iter().map(TypeId::erased).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldId {
    pub class: TypeId,
    pub name: String,
    pub field_type: TypeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodId {
    pub class: TypeId,
    pub name: String,
    pub proto: ProtoId,
}

impl MethodId {
    /// `MethodHandle.invokeExact(Object[]) -> Object`, the polymorphic
    /// dispatch target of every generated stub.
    pub fn method_handle_invoke_exact() -> MethodId {
        MethodId {
            class: TypeId::method_handle(),
            name: "invokeExact".to_owned(),
            proto: ProtoId::new(TypeId::object(), vec![TypeId::object_array()]),
        }
    }
}

/// Dex opcodes the engines structure. Values are the real encoding bytes;
/// the `*_QUICK` group and `RETURN_VOID_NO_BARRIER` are only valid inside a
/// loaded class instance, never in generic bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0x00,
    MoveResult = 0x0a,
    MoveResultWide = 0x0b,
    MoveResultObject = 0x0c,
    ReturnVoid = 0x0e,
    Return = 0x0f,
    ReturnWide = 0x10,
    ReturnObject = 0x11,
    Iget = 0x52,
    IgetWide = 0x53,
    IgetObject = 0x54,
    IgetBoolean = 0x55,
    IgetByte = 0x56,
    IgetChar = 0x57,
    IgetShort = 0x58,
    Iput = 0x59,
    IputWide = 0x5a,
    IputObject = 0x5b,
    IputBoolean = 0x5c,
    IputByte = 0x5d,
    IputChar = 0x5e,
    IputShort = 0x5f,
    SgetObject = 0x62,
    InvokeVirtual = 0x6e,
    InvokeSuper = 0x6f,
    InvokeDirect = 0x70,
    InvokeStatic = 0x71,
    InvokeInterface = 0x72,
    ReturnVoidNoBarrier = 0x73,
    InvokeVirtualRange = 0x74,
    IgetQuick = 0xe3,
    IgetWideQuick = 0xe4,
    IgetObjectQuick = 0xe5,
    IputQuick = 0xe6,
    IputWideQuick = 0xe7,
    IputObjectQuick = 0xe8,
    InvokeVirtualQuick = 0xe9,
    InvokeVirtualRangeQuick = 0xea,
    IputBooleanQuick = 0xeb,
    IputByteQuick = 0xec,
    IputCharQuick = 0xed,
    IputShortQuick = 0xee,
    IgetBooleanQuick = 0xef,
    IgetByteQuick = 0xf0,
    IgetCharQuick = 0xf1,
    IgetShortQuick = 0xf2,
    InvokePolymorphic = 0xfa,
    InvokePolymorphicRange = 0xfb,
}

impl Opcode {
    /// True for opcodes that are only meaningful after quickening.
    pub fn quickened(self) -> bool {
        matches!(
            self,
            Opcode::ReturnVoidNoBarrier
                | Opcode::InvokeVirtualQuick
                | Opcode::InvokeVirtualRangeQuick
        ) || (Opcode::IgetQuick as u8..=Opcode::IgetShortQuick as u8).contains(&(self as u8))
    }

    /// Generic counterpart of a quickened field opcode.
    pub fn unquickened_field(self) -> Option<Opcode> {
        Some(match self {
            Opcode::IgetQuick => Opcode::Iget,
            Opcode::IgetWideQuick => Opcode::IgetWide,
            Opcode::IgetObjectQuick => Opcode::IgetObject,
            Opcode::IgetBooleanQuick => Opcode::IgetBoolean,
            Opcode::IgetByteQuick => Opcode::IgetByte,
            Opcode::IgetCharQuick => Opcode::IgetChar,
            Opcode::IgetShortQuick => Opcode::IgetShort,
            Opcode::IputQuick => Opcode::Iput,
            Opcode::IputWideQuick => Opcode::IputWide,
            Opcode::IputObjectQuick => Opcode::IputObject,
            Opcode::IputBooleanQuick => Opcode::IputBoolean,
            Opcode::IputByteQuick => Opcode::IputByte,
            Opcode::IputCharQuick => Opcode::IputChar,
            Opcode::IputShortQuick => Opcode::IputShort,
            _ => return None,
        })
    }
}

/// Structured view of one instruction. Formats that no pass touches are
/// carried as [`Instruction::Other`] with their full code-unit payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Format 10x.
    Nullary(Opcode),
    /// Format 11x.
    Unary(Opcode, u8),
    /// Format 21c static field access.
    FieldOp21c {
        op: Opcode,
        reg: u8,
        field: FieldId,
    },
    /// Format 22c instance field access.
    FieldOp22c {
        op: Opcode,
        value: u8,
        object: u8,
        field: FieldId,
    },
    /// Format 22cs: quickened instance field access by table index.
    FieldOpQuick {
        op: Opcode,
        value: u8,
        object: u8,
        index: u16,
    },
    /// Format 35c invoke with up to five argument registers.
    Invoke {
        op: Opcode,
        registers: Vec<u8>,
        method: MethodId,
    },
    /// Format 35ms: quickened virtual invoke by table index.
    InvokeQuick {
        op: Opcode,
        registers: Vec<u8>,
        index: u16,
    },
    /// Format 3rc range invoke.
    InvokeRange {
        op: Opcode,
        count: u8,
        first: u16,
        method: MethodId,
    },
    /// Format 3rms: quickened virtual range invoke by table index.
    InvokeRangeQuick {
        op: Opcode,
        count: u8,
        first: u16,
        index: u16,
    },
    /// Format 4rcc polymorphic range invoke carrying the call-site proto.
    InvokePolymorphicRange {
        count: u8,
        first: u16,
        method: MethodId,
        proto: ProtoId,
    },
    /// Anything else, as raw code units (opcode unit included).
    Other { op: u8, units: Vec<u16> },
}

impl Instruction {
    /// Width in 16-bit code units; every rewrite in this crate preserves it.
    pub fn unit_count(&self) -> u32 {
        match self {
            Instruction::Nullary(_) | Instruction::Unary(..) => 1,
            Instruction::FieldOp21c { .. }
            | Instruction::FieldOp22c { .. }
            | Instruction::FieldOpQuick { .. } => 2,
            Instruction::Invoke { .. }
            | Instruction::InvokeQuick { .. }
            | Instruction::InvokeRange { .. }
            | Instruction::InvokeRangeQuick { .. } => 3,
            Instruction::InvokePolymorphicRange { .. } => 4,
            Instruction::Other { units, .. } => units.len() as u32,
        }
    }
}

/// Exception handler coverage, round-tripped verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryBlock {
    pub start_unit: u32,
    pub unit_count: u32,
    pub handlers: Vec<Handler>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handler {
    /// `None` is the catch-all handler.
    pub exception: Option<TypeId>,
    pub target: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeItem {
    pub registers: u16,
    pub ins: u16,
    pub outs: u16,
    pub instructions: Vec<Instruction>,
    pub tries: Vec<TryBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub id: FieldId,
    pub access: AccessFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    pub id: MethodId,
    pub access: AccessFlags,
    pub code: Option<CodeItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    pub type_id: TypeId,
    pub access: AccessFlags,
    pub superclass: Option<TypeId>,
    pub interfaces: Vec<TypeId>,
    pub fields: Vec<FieldDef>,
    pub direct_methods: Vec<MethodDef>,
    pub virtual_methods: Vec<MethodDef>,
}

impl ClassDef {
    /// Methods in dex order: direct table first, then virtual.
    pub fn methods(&self) -> impl Iterator<Item = &MethodDef> {
        self.direct_methods.iter().chain(self.virtual_methods.iter())
    }

    pub fn find_direct_method(&self, id: &MethodId) -> Option<&MethodDef> {
        self.direct_methods.iter().find(|m| &m.id == id)
    }

    pub fn find_virtual_method(&self, id: &MethodId) -> Option<&MethodDef> {
        self.virtual_methods.iter().find(|m| &m.id == id)
    }
}
