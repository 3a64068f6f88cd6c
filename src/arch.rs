use std::fmt;

use crate::error::HookError;

/// Instruction sets the VM's optimized call path may run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionSet {
    X86,
    X86_64,
    Arm,
    Arm64,
    Riscv64,
}

impl fmt::Display for InstructionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstructionSet::X86 => "x86",
            InstructionSet::X86_64 => "x86_64",
            InstructionSet::Arm => "arm",
            InstructionSet::Arm64 => "arm64",
            InstructionSet::Riscv64 => "riscv64",
        };
        f.write_str(name)
    }
}

impl InstructionSet {
    /// Instruction set this process was compiled for, if it is one the
    /// assembler knows about.
    pub fn current() -> Option<Self> {
        if cfg!(target_arch = "x86") {
            Some(InstructionSet::X86)
        } else if cfg!(target_arch = "x86_64") {
            Some(InstructionSet::X86_64)
        } else if cfg!(target_arch = "arm") {
            Some(InstructionSet::Arm)
        } else if cfg!(target_arch = "aarch64") {
            Some(InstructionSet::Arm64)
        } else if cfg!(target_arch = "riscv64") {
            Some(InstructionSet::Riscv64)
        } else {
            None
        }
    }

    /// Word width of method pointers on this set.
    pub fn is_64bit(self) -> bool {
        matches!(
            self,
            InstructionSet::X86_64 | InstructionSet::Arm64 | InstructionSet::Riscv64
        )
    }
}

/// Emits the machine code for a substitute entry point: load `art_method`
/// into the slot the calling convention reserves for the callee's own
/// identity, then transfer control to `entry_point`. All other argument
/// registers are left untouched.
///
/// Each encoding is a fixed byte layout matching the hidden-argument
/// convention of the VM's optimized call path for that architecture, which
/// is too narrow to justify a general instruction-selection layer.
pub fn trampoline(
    iset: InstructionSet,
    art_method: u64,
    entry_point: u64,
) -> Result<Vec<u8>, HookError> {
    let m = art_method.to_le_bytes();
    let e = entry_point.to_le_bytes();
    Ok(match iset {
        InstructionSet::X86 => vec![
            // b8 <m0 m1 m2 m3> ; mov eax, art_method
            // 68 <e0 e1 e2 e3> ; push entry_point
            // c3               ; ret
            0xb8, m[0], m[1], m[2], m[3], //
            0x68, e[0], e[1], e[2], e[3], //
            0xc3,
        ],
        InstructionSet::X86_64 => vec![
            // 48 bf <e0..e7> ; movabs rdi, entry_point
            // 57             ; push rdi
            // 48 bf <m0..m7> ; movabs rdi, art_method
            // c3             ; ret
            0x48, 0xbf, e[0], e[1], e[2], e[3], e[4], e[5], e[6], e[7], //
            0x57, //
            0x48, 0xbf, m[0], m[1], m[2], m[3], m[4], m[5], m[6], m[7], //
            0xc3,
        ],
        InstructionSet::Arm => vec![
            // 0C 00 9F E5 ; ldr r0, [pc, #12]
            // 01 00 2D E9 ; push {r0}
            // 00 00 9F E5 ; ldr r0, [pc, #0]
            // 00 80 BD E8 ; pop {pc}
            // <m0..m3>    ; art_method
            // <e0..e3>    ; entry_point
            0x0c, 0x00, 0x9f, 0xe5, //
            0x01, 0x00, 0x2d, 0xe9, //
            0x00, 0x00, 0x9f, 0xe5, //
            0x00, 0x80, 0xbd, 0xe8, //
            m[0], m[1], m[2], m[3], //
            e[0], e[1], e[2], e[3],
        ],
        InstructionSet::Arm64 => vec![
            // 60 00 00 58 ; ldr x0, #12
            // 90 00 00 58 ; ldr x16, #16
            // 00 02 1f d6 ; br x16
            // <m0..m7>    ; art_method
            // <e0..e7>    ; entry_point
            0x60, 0x00, 0x00, 0x58, //
            0x90, 0x00, 0x00, 0x58, //
            0x00, 0x02, 0x1f, 0xd6, //
            m[0], m[1], m[2], m[3], m[4], m[5], m[6], m[7], //
            e[0], e[1], e[2], e[3], e[4], e[5], e[6], e[7],
        ],
        InstructionSet::Riscv64 => {
            return Err(HookError::UnsupportedInstructionSet(iset));
        }
    })
}
