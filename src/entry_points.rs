//! Recovers the runtime's shared bridge entry points by observation.
//!
//! The runtime does not export its generic JNI trampoline or its
//! to-interpreter bridge, but it assigns them to any freshly loaded method
//! it has no compiled code for. Loading a throwaway probe class and reading
//! the assigned entry points back yields both addresses without touching a
//! single internal symbol.

use log::debug;
use once_cell::sync::OnceCell;

use crate::dex::codec::DexCodec;
use crate::dex::ir::{AccessFlags, ClassDef, MethodDef, MethodId, ProtoId, TypeId};
use crate::error::HookError;
use crate::vm::VmRuntime;

const PROBE_NAME: &str = "hookrt.probe.EntryProbe";
const NATIVE_PROBE: &str = "nativeProbe";
const INTERPRETED_PROBE: &str = "interpretedProbe";

/// Lazily resolved bridge addresses, memoized only on success. A failed
/// probe is retried on the next query.
#[derive(Default)]
pub struct EntryPoints {
    resolved: OnceCell<(u64, u64)>,
}

impl EntryPoints {
    pub const fn new() -> EntryPoints {
        EntryPoints {
            resolved: OnceCell::new(),
        }
    }

    /// Address every native method without compiled stubs enters through.
    pub fn generic_jni_trampoline(
        &self,
        vm: &dyn VmRuntime,
        codec: &dyn DexCodec,
    ) -> Result<u64, HookError> {
        Ok(self.probe(vm, codec)?.0)
    }

    /// Address interpreted methods enter through.
    pub fn to_interpreter_bridge(
        &self,
        vm: &dyn VmRuntime,
        codec: &dyn DexCodec,
    ) -> Result<u64, HookError> {
        Ok(self.probe(vm, codec)?.1)
    }

    fn probe(&self, vm: &dyn VmRuntime, codec: &dyn DexCodec) -> Result<(u64, u64), HookError> {
        self.resolved
            .get_or_try_init(|| {
                let bytes = codec.write(&[probe_class()])?;
                let loader = vm.isolated_loader();
                let class = vm.load_class(&bytes, PROBE_NAME, loader, true)?;

                let native = vm.find_method(class, NATIVE_PROBE, &native_probe_proto())?;
                let interpreted =
                    vm.find_method(class, INTERPRETED_PROBE, &interpreted_probe_proto())?;
                let jni = vm.entry_point(native);
                let bridge = vm.entry_point(interpreted);
                debug!("resolved bridge entry points: jni={jni:#x} interpreter={bridge:#x}");
                Ok((jni, bridge))
            })
            .copied()
    }
}

/// A signature no ahead-of-time stub cache covers, so the runtime has to
/// fall back to its generic trampoline.
fn native_probe_proto() -> ProtoId {
    let parameters = (0..30)
        .map(|i| {
            if i % 2 == 0 {
                TypeId::new("I")
            } else {
                TypeId::new("J")
            }
        })
        .collect();
    ProtoId::new(TypeId::new("V"), parameters)
}

fn interpreted_probe_proto() -> ProtoId {
    ProtoId::new(TypeId::new("V"), vec![])
}

fn probe_class() -> ClassDef {
    let type_id = TypeId::of_name(PROBE_NAME);
    ClassDef {
        type_id: type_id.clone(),
        access: AccessFlags::PUBLIC | AccessFlags::ABSTRACT,
        superclass: Some(TypeId::object()),
        interfaces: vec![],
        fields: vec![],
        direct_methods: vec![MethodDef {
            id: MethodId {
                class: type_id.clone(),
                name: NATIVE_PROBE.to_owned(),
                proto: native_probe_proto(),
            },
            access: AccessFlags::PUBLIC | AccessFlags::STATIC | AccessFlags::NATIVE,
            code: None,
        }],
        virtual_methods: vec![MethodDef {
            id: MethodId {
                class: type_id,
                name: INTERPRETED_PROBE.to_owned(),
                proto: interpreted_probe_proto(),
            },
            access: AccessFlags::PUBLIC | AccessFlags::ABSTRACT,
            code: None,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::codec::DexReaderCache;
    use crate::dex::DexError;
    use crate::testutil::{MockVm, NullCodec};
    use std::sync::atomic::Ordering;

    struct FailingCodec;

    impl DexCodec for FailingCodec {
        fn open(
            &self,
            _bytes: &[u8],
            _header_offset: u32,
        ) -> Result<Box<dyn DexReaderCache>, DexError> {
            Err(DexError::Malformed("unused"))
        }
        fn write(&self, _classes: &[ClassDef]) -> Result<Vec<u8>, DexError> {
            Err(DexError::Truncated("serializer offline"))
        }
    }

    #[test]
    fn both_probes_share_one_class_load() {
        let vm = MockVm::new();
        let points = EntryPoints::new();
        let jni = points.generic_jni_trampoline(&vm, &NullCodec).unwrap();
        let bridge = points.to_interpreter_bridge(&vm, &NullCodec).unwrap();
        assert_ne!(jni, bridge);
        assert_eq!(jni, points.generic_jni_trampoline(&vm, &NullCodec).unwrap());
        assert_eq!(vm.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_probe_is_not_memoized() {
        let vm = MockVm::new();
        let points = EntryPoints::new();
        assert!(points.generic_jni_trampoline(&vm, &FailingCodec).is_err());
        assert!(points.generic_jni_trampoline(&vm, &NullCodec).is_ok());
        assert_eq!(vm.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn probe_signature_is_uncommon() {
        let proto = native_probe_proto();
        assert_eq!(proto.parameters.len(), 30);
        assert_eq!(proto.input_registers(), 45);
    }
}
