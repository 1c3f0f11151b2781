//! Target Specification System
//!
//! This module describes the properties of the machine the layout pass is
//! shaping code for: whether jumps may be rewritten at all, how far its
//! direct branches reach, and how long instructions are.

use serde::{Deserialize, Serialize};

use crate::cfg::insn::{Insn, InsnKind};

/// Target architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetArch {
    /// x86_64 (default)
    X86_64,
    /// ARM64
    Arm64,
    /// ARM
    Arm,
    /// PowerPC
    PowerPC,
}

/// Target specification consumed by the layout pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Target architecture
    pub arch: TargetArch,
    /// The back end forbids rewriting jumps (layout must not run).
    pub cannot_modify_jumps: bool,
    /// Conditional branches can reach anywhere in the address space.
    pub has_long_cond_branch: bool,
    /// Unconditional branches can reach anywhere in the address space.
    pub has_long_uncond_branch: bool,
}

impl TargetSpec {
    pub fn for_arch(arch: TargetArch) -> Self {
        match arch {
            TargetArch::X86_64 => Self {
                arch,
                cannot_modify_jumps: false,
                has_long_cond_branch: true,
                has_long_uncond_branch: true,
            },
            // PowerPC conditional branches reach ±32KB; unconditional
            // branches reach ±32MB.
            TargetArch::PowerPC => Self {
                arch,
                cannot_modify_jumps: false,
                has_long_cond_branch: false,
                has_long_uncond_branch: true,
            },
            TargetArch::Arm | TargetArch::Arm64 => Self {
                arch,
                cannot_modify_jumps: false,
                has_long_cond_branch: false,
                has_long_uncond_branch: false,
            },
        }
    }

    /// Encoded length of one instruction in bytes. Labels, notes and
    /// barriers occupy no space.
    pub fn insn_length(&self, insn: &Insn) -> u32 {
        if !insn.is_executable() {
            return 0;
        }
        match self.arch {
            // Fixed-width encodings.
            TargetArch::PowerPC | TargetArch::Arm | TargetArch::Arm64 => match insn.kind {
                InsnKind::Body { len } => len,
                _ => 4,
            },
            TargetArch::X86_64 => match insn.kind {
                InsnKind::Body { len } => len,
                InsnKind::Jump(_) => 5,
                InsnKind::CondJump { .. } => 6,
                InsnKind::IndirectJump(_) => 3,
                InsnKind::TableJump { .. } => 7,
                InsnKind::Move { .. } => 7,
                InsnKind::Return => 1,
                InsnKind::Label(_) | InsnKind::Note(_) | InsnKind::Barrier => 0,
            },
        }
    }
}

impl Default for TargetSpec {
    fn default() -> Self {
        TargetSpec::for_arch(TargetArch::X86_64)
    }
}
