//! Reverses the verifier-time "quickening" rewrite, restoring generic
//! bytecode from resolved-index instruction variants.
//!
//! Every substitution is same-width, so program-counter offsets, branch
//! targets and try-block coverage survive untouched. A method with no
//! quickened instructions is passed through unchanged.

use log::trace;

use super::codec::DexReaderCache;
use super::ir::{ClassDef, CodeItem, Instruction, MethodDef, Opcode};
use crate::error::HookError;
use crate::vm::QuickenIndexSource;

/// Only these host versions quicken: earlier ones verify differently,
/// later ones dropped the quick opcodes entirely.
pub fn needs_dequicken(sdk_version: u32) -> bool {
    (28..=30).contains(&sdk_version)
}

fn recover_index(
    source: &dyn QuickenIndexSource,
    art_method: u64,
    pc: u32,
) -> Result<u32, HookError> {
    source
        .index_at(art_method, pc)
        .map(u32::from)
        .ok_or(HookError::QuickenIndex { pc })
}

/// Rewrites one method body back to generic form. Returns `None` when the
/// body contained nothing quickened.
pub fn dequicken_method(
    cache: &dyn DexReaderCache,
    source: &dyn QuickenIndexSource,
    art_method: u64,
    code: &CodeItem,
) -> Result<Option<CodeItem>, HookError> {
    let mut instructions = code.instructions.clone();
    let mut modified = false;
    let mut pc = 0u32;

    for insn in instructions.iter_mut() {
        let width = insn.unit_count();
        match insn {
            Instruction::InvokeQuick {
                op: Opcode::InvokeVirtualQuick,
                registers,
                ..
            } => {
                let method = cache.method_id(recover_index(source, art_method, pc)?)?;
                *insn = Instruction::Invoke {
                    op: Opcode::InvokeVirtual,
                    registers: std::mem::take(registers),
                    method,
                };
                modified = true;
            }
            Instruction::InvokeRangeQuick {
                op: Opcode::InvokeVirtualRangeQuick,
                count,
                first,
                ..
            } => {
                let method = cache.method_id(recover_index(source, art_method, pc)?)?;
                *insn = Instruction::InvokeRange {
                    op: Opcode::InvokeVirtualRange,
                    count: *count,
                    first: *first,
                    method,
                };
                modified = true;
            }
            Instruction::FieldOpQuick {
                op,
                value,
                object,
                ..
            } => {
                let generic = op
                    .unquickened_field()
                    .ok_or(HookError::QuickenIndex { pc })?;
                let field = cache.field_id(recover_index(source, art_method, pc)?)?;
                *insn = Instruction::FieldOp22c {
                    op: generic,
                    value: *value,
                    object: *object,
                    field,
                };
                modified = true;
            }
            Instruction::Nullary(op @ Opcode::ReturnVoidNoBarrier) => {
                *op = Opcode::ReturnVoid;
                modified = true;
            }
            _ => {}
        }
        debug_assert_eq!(insn.unit_count(), width);
        pc += width;
    }

    if !modified {
        return Ok(None);
    }
    trace!("dequickened method body at pc range 0..{pc}");
    Ok(Some(CodeItem {
        instructions,
        ..code.clone()
    }))
}

/// Rewrites every method of a class, pairing each definition with its
/// runtime identity in dex order.
pub fn dequicken_class(
    cache: &dyn DexReaderCache,
    source: &dyn QuickenIndexSource,
    art_methods: &[u64],
    def: &ClassDef,
) -> Result<ClassDef, HookError> {
    let total = def.direct_methods.len() + def.virtual_methods.len();
    if art_methods.len() != total {
        return Err(HookError::Vm(format!(
            "method table length mismatch: {} runtime vs {} dex",
            art_methods.len(),
            total
        )));
    }

    let mut out = def.clone();
    let all = out
        .direct_methods
        .iter_mut()
        .chain(out.virtual_methods.iter_mut());
    for (i, method) in all.enumerate() {
        if let Some(code) = &method.code {
            if let Some(rewritten) = dequicken_method(cache, source, art_methods[i], code)? {
                *method = MethodDef {
                    code: Some(rewritten),
                    ..method.clone()
                };
            }
        }
    }
    Ok(out)
}
