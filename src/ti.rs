//! The host control protocol's redefinition primitive and its error
//! surface. Consumed, not implemented, here; the engines only rely on the
//! atomicity contract: one call redefines the whole batch or none of it.

use bitflags::bitflags;
use thiserror::Error;

use crate::vm::ClassRef;

/// A protocol failure carrying the raw status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{}", self.name())]
pub struct TiError {
    pub raw: i32,
}

impl TiError {
    pub fn name(&self) -> &'static str {
        TiErrorCode::from_raw(self.raw).map_or("JVMTI_ERROR_UNKNOWN", TiErrorCode::name)
    }

    pub fn code(&self) -> Option<TiErrorCode> {
        TiErrorCode::from_raw(self.raw)
    }
}

/// Maps a raw protocol status to `Ok(())` or a typed error.
pub fn check_status(raw: i32) -> Result<(), TiError> {
    if raw == TiErrorCode::None as i32 {
        Ok(())
    } else {
        Err(TiError { raw })
    }
}

macro_rules! ti_error_codes {
    ($($variant:ident = $value:expr, $name:literal;)*) => {
        /// Named status codes of the control protocol.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(i32)]
        pub enum TiErrorCode {
            $($variant = $value,)*
        }

        impl TiErrorCode {
            pub fn from_raw(raw: i32) -> Option<TiErrorCode> {
                match raw {
                    $($value => Some(TiErrorCode::$variant),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(TiErrorCode::$variant => $name,)*
                }
            }
        }
    };
}

ti_error_codes! {
    None = 0, "JVMTI_ERROR_NONE";
    InvalidThread = 10, "JVMTI_ERROR_INVALID_THREAD";
    InvalidThreadGroup = 11, "JVMTI_ERROR_INVALID_THREAD_GROUP";
    InvalidPriority = 12, "JVMTI_ERROR_INVALID_PRIORITY";
    ThreadNotSuspended = 13, "JVMTI_ERROR_THREAD_NOT_SUSPENDED";
    ThreadSuspended = 14, "JVMTI_ERROR_THREAD_SUSPENDED";
    ThreadNotAlive = 15, "JVMTI_ERROR_THREAD_NOT_ALIVE";
    InvalidObject = 20, "JVMTI_ERROR_INVALID_OBJECT";
    InvalidClass = 21, "JVMTI_ERROR_INVALID_CLASS";
    ClassNotPrepared = 22, "JVMTI_ERROR_CLASS_NOT_PREPARED";
    InvalidMethodId = 23, "JVMTI_ERROR_INVALID_METHODID";
    InvalidLocation = 24, "JVMTI_ERROR_INVALID_LOCATION";
    InvalidFieldId = 25, "JVMTI_ERROR_INVALID_FIELDID";
    NoMoreFrames = 31, "JVMTI_ERROR_NO_MORE_FRAMES";
    OpaqueFrame = 32, "JVMTI_ERROR_OPAQUE_FRAME";
    TypeMismatch = 34, "JVMTI_ERROR_TYPE_MISMATCH";
    InvalidSlot = 35, "JVMTI_ERROR_INVALID_SLOT";
    Duplicate = 40, "JVMTI_ERROR_DUPLICATE";
    NotFound = 41, "JVMTI_ERROR_NOT_FOUND";
    InvalidMonitor = 50, "JVMTI_ERROR_INVALID_MONITOR";
    NotMonitorOwner = 51, "JVMTI_ERROR_NOT_MONITOR_OWNER";
    Interrupt = 52, "JVMTI_ERROR_INTERRUPT";
    InvalidClassFormat = 60, "JVMTI_ERROR_INVALID_CLASS_FORMAT";
    CircularClassDefinition = 61, "JVMTI_ERROR_CIRCULAR_CLASS_DEFINITION";
    FailsVerification = 62, "JVMTI_ERROR_FAILS_VERIFICATION";
    UnsupportedRedefinitionMethodAdded = 63, "JVMTI_ERROR_UNSUPPORTED_REDEFINITION_METHOD_ADDED";
    UnsupportedRedefinitionSchemaChanged = 64, "JVMTI_ERROR_UNSUPPORTED_REDEFINITION_SCHEMA_CHANGED";
    InvalidTypestate = 65, "JVMTI_ERROR_INVALID_TYPESTATE";
    UnsupportedRedefinitionHierarchyChanged = 66, "JVMTI_ERROR_UNSUPPORTED_REDEFINITION_HIERARCHY_CHANGED";
    UnsupportedRedefinitionMethodDeleted = 67, "JVMTI_ERROR_UNSUPPORTED_REDEFINITION_METHOD_DELETED";
    UnsupportedVersion = 68, "JVMTI_ERROR_UNSUPPORTED_VERSION";
    NamesDontMatch = 69, "JVMTI_ERROR_NAMES_DONT_MATCH";
    UnsupportedRedefinitionClassModifiersChanged = 70, "JVMTI_ERROR_UNSUPPORTED_REDEFINITION_CLASS_MODIFIERS_CHANGED";
    UnsupportedRedefinitionMethodModifiersChanged = 71, "JVMTI_ERROR_UNSUPPORTED_REDEFINITION_METHOD_MODIFIERS_CHANGED";
    UnmodifiableClass = 79, "JVMTI_ERROR_UNMODIFIABLE_CLASS";
    NotAvailable = 98, "JVMTI_ERROR_NOT_AVAILABLE";
    MustPossessCapability = 99, "JVMTI_ERROR_MUST_POSSESS_CAPABILITY";
    NullPointer = 100, "JVMTI_ERROR_NULL_POINTER";
    AbsentInformation = 101, "JVMTI_ERROR_ABSENT_INFORMATION";
    InvalidEventType = 102, "JVMTI_ERROR_INVALID_EVENT_TYPE";
    IllegalArgument = 103, "JVMTI_ERROR_ILLEGAL_ARGUMENT";
    NativeMethod = 104, "JVMTI_ERROR_NATIVE_METHOD";
    ClassLoaderUnsupported = 106, "JVMTI_ERROR_CLASS_LOADER_UNSUPPORTED";
    OutOfMemory = 110, "JVMTI_ERROR_OUT_OF_MEMORY";
    AccessDenied = 111, "JVMTI_ERROR_ACCESS_DENIED";
    WrongPhase = 112, "JVMTI_ERROR_WRONG_PHASE";
    Internal = 113, "JVMTI_ERROR_INTERNAL";
    UnattachedThread = 115, "JVMTI_ERROR_UNATTACHED_THREAD";
    InvalidEnvironment = 116, "JVMTI_ERROR_INVALID_ENVIRONMENT";
}

bitflags! {
    /// Capability bits the engine requests at startup.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TiCapabilities: u64 {
        const CAN_TAG_OBJECTS = 1 << 0;
        const CAN_GENERATE_FIELD_MODIFICATION_EVENTS = 1 << 1;
        const CAN_GENERATE_FIELD_ACCESS_EVENTS = 1 << 2;
        const CAN_GET_BYTECODES = 1 << 3;
        const CAN_GET_SYNTHETIC_ATTRIBUTE = 1 << 4;
        const CAN_GET_OWNED_MONITOR_INFO = 1 << 5;
        const CAN_GET_CURRENT_CONTENDED_MONITOR = 1 << 6;
        const CAN_GET_MONITOR_INFO = 1 << 7;
        const CAN_POP_FRAME = 1 << 8;
        const CAN_REDEFINE_CLASSES = 1 << 9;
        const CAN_SIGNAL_THREAD = 1 << 10;
        const CAN_GET_SOURCE_FILE_NAME = 1 << 11;
        const CAN_GET_LINE_NUMBERS = 1 << 12;
        const CAN_GET_SOURCE_DEBUG_EXTENSION = 1 << 13;
        const CAN_ACCESS_LOCAL_VARIABLES = 1 << 14;
        const CAN_MAINTAIN_ORIGINAL_METHOD_ORDER = 1 << 15;
        const CAN_GENERATE_SINGLE_STEP_EVENTS = 1 << 16;
        const CAN_GENERATE_EXCEPTION_EVENTS = 1 << 17;
        const CAN_GENERATE_FRAME_POP_EVENTS = 1 << 18;
        const CAN_GENERATE_BREAKPOINT_EVENTS = 1 << 19;
        const CAN_SUSPEND = 1 << 20;
        const CAN_REDEFINE_ANY_CLASS = 1 << 21;
        const CAN_GET_CURRENT_THREAD_CPU_TIME = 1 << 22;
        const CAN_GET_THREAD_CPU_TIME = 1 << 23;
        const CAN_GENERATE_METHOD_ENTRY_EVENTS = 1 << 24;
        const CAN_GENERATE_METHOD_EXIT_EVENTS = 1 << 25;
        const CAN_GENERATE_ALL_CLASS_HOOK_EVENTS = 1 << 26;
        const CAN_GENERATE_COMPILED_METHOD_LOAD_EVENTS = 1 << 27;
        const CAN_GENERATE_MONITOR_EVENTS = 1 << 28;
        const CAN_GENERATE_VM_OBJECT_ALLOC_EVENTS = 1 << 29;
        const CAN_GENERATE_NATIVE_METHOD_BIND_EVENTS = 1 << 30;
        const CAN_GENERATE_GARBAGE_COLLECTION_EVENTS = 1 << 31;
        const CAN_GENERATE_OBJECT_FREE_EVENTS = 1 << 32;
        const CAN_FORCE_EARLY_RETURN = 1 << 33;
        const CAN_GET_OWNED_MONITOR_STACK_DEPTH_INFO = 1 << 34;
        const CAN_GET_CONSTANT_POOL = 1 << 35;
        const CAN_SET_NATIVE_METHOD_PREFIX = 1 << 36;
        const CAN_RETRANSFORM_CLASSES = 1 << 37;
        const CAN_RETRANSFORM_ANY_CLASS = 1 << 38;
        const CAN_GENERATE_RESOURCE_EXHAUSTION_HEAP_EVENTS = 1 << 39;
        const CAN_GENERATE_RESOURCE_EXHAUSTION_THREADS_EVENTS = 1 << 40;
    }
}

/// One entry of a redefinition batch.
#[derive(Debug, Clone)]
pub struct ClassDefinition {
    pub class: ClassRef,
    pub bytes: Vec<u8>,
}

/// Control environment operations the engines call.
pub trait TiEnv {
    fn potential_capabilities(&self) -> Result<TiCapabilities, TiError>;
    fn add_capabilities(&self, capabilities: TiCapabilities) -> Result<(), TiError>;

    /// Atomically replaces the bytecode of every listed class; all entries
    /// succeed or the whole call fails with a typed status.
    fn redefine_classes(&self, definitions: &[ClassDefinition]) -> Result<(), TiError>;
}

/// Startup capability grab. Some hosts under-report their potential
/// capability set, so every bit is requested outright rather than only the
/// reported ones.
pub fn force_full_capabilities(env: &dyn TiEnv) -> Result<TiCapabilities, TiError> {
    let reported = env.potential_capabilities()?;
    env.add_capabilities(TiCapabilities::all())?;
    Ok(reported | TiCapabilities::all())
}
