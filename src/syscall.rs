// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Syscall opcode decoding.
//!
//! An opcode carries the `0x6642` signature in bits 63..48, flags in bits
//! 47..32 (ignored), the operation family in bits 31..16 and the index of
//! the operation within its family in bits 15..0.

/// The signature every opcode must carry.
pub const SYSCALL_SIG_VAL: u64 = 0x6642_0000_0000_0000;
/// Selects the signature.
pub const SYSCALL_SIG_MASK: u64 = 0xFFFF_0000_0000_0000;
/// Selects the family, without the signature.
pub const SYSCALL_FAMILY_MASK: u64 = 0x0000_0000_FFFF_0000;
/// Selects the index.
pub const SYSCALL_INDEX_MASK: u64 = 0x0000_0000_0000_FFFF;

/// The debug family.
pub const DEBUG_OP_VAL: u64 = 0x6642_0000_0002_0000;
/// The VM family.
pub const VM_OP_VAL: u64 = 0x6642_0000_0004_0000;
/// The VP family.
pub const VP_OP_VAL: u64 = 0x6642_0000_0005_0000;
/// The VS family.
pub const VS_OP_VAL: u64 = 0x6642_0000_0006_0000;

/// Operations of the debug family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebugOp {
    /// Print `reg1` and `reg2`.
    Out = 0,
    /// Dump the VM in `reg1`.
    DumpVm = 1,
    /// Dump the VP in `reg1`.
    DumpVp = 2,
    /// Dump the VS in `reg1`.
    DumpVs = 3,
}

/// Operations of the VM family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmOp {
    /// Create a VM.
    CreateVm = 0,
    /// Destroy the VM in `reg1`.
    DestroyVm = 1,
    /// Flush the TLBs of the VM in `reg1` on this core.
    TlbFlush = 5,
}

/// Operations of the VP family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VpOp {
    /// Create a VP under the VM in `reg1`.
    CreateVp = 0,
    /// Destroy the VP in `reg1`.
    DestroyVp = 1,
}

/// Operations of the VS family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VsOp {
    /// Create a VS for the VP in `reg1`, homed on the core in `reg2`.
    CreateVs = 0,
    /// Destroy the VS in `reg1`.
    DestroyVs = 1,
    /// Make the VS in `reg1` the root VS of this core.
    InitAsRoot = 2,
    /// Read register `reg2` of the VS in `reg1`.
    Read = 3,
    /// Write `reg3` to register `reg2` of the VS in `reg1`.
    Write = 4,
    /// Run the triple in `reg1..reg3`.
    Run = 5,
    /// Run the active triple.
    RunCurrent = 6,
    /// Advance the IP of and run the triple in `reg1..reg3`.
    AdvanceIpAndRun = 7,
    /// Advance the IP of and run the active triple.
    AdvanceIpAndRunCurrent = 8,
    /// Promote the VS in `reg1`.
    Promote = 9,
    /// Clear the VS in `reg1`.
    Clear = 10,
    /// Migrate the VS in `reg1` to the core in `reg2`.
    Migrate = 11,
    /// Make the triple in `reg1..reg3` active.
    SetActive = 12,
    /// Advance the IP of and activate the triple in `reg1..reg3`.
    AdvanceIpAndSetActive = 13,
    /// Flush the TLB of the VS in `reg1` for the address in `reg2`.
    TlbFlush = 14,
}

/// A decoded syscall opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    /// A debug operation.
    Debug(DebugOp),
    /// A VM operation.
    Vm(VmOp),
    /// A VP operation.
    Vp(VpOp),
    /// A VS operation.
    Vs(VsOp),
}

impl Syscall {
    /// Decode a raw opcode, `None` if it names nothing known.
    pub fn decode(raw: u64) -> Option<Self> {
        if raw & SYSCALL_SIG_MASK != SYSCALL_SIG_VAL {
            return None;
        }
        let index = raw & SYSCALL_INDEX_MASK;
        match (raw & SYSCALL_FAMILY_MASK) | SYSCALL_SIG_VAL {
            DEBUG_OP_VAL => DebugOp::from_index(index).map(Self::Debug),
            VM_OP_VAL => VmOp::from_index(index).map(Self::Vm),
            VP_OP_VAL => VpOp::from_index(index).map(Self::Vp),
            VS_OP_VAL => VsOp::from_index(index).map(Self::Vs),
            _ => None,
        }
    }

    /// The raw opcode, with no flags.
    pub const fn opcode(self) -> u64 {
        match self {
            Self::Debug(op) => DEBUG_OP_VAL | op as u64,
            Self::Vm(op) => VM_OP_VAL | op as u64,
            Self::Vp(op) => VP_OP_VAL | op as u64,
            Self::Vs(op) => VS_OP_VAL | op as u64,
        }
    }
}

impl DebugOp {
    const fn from_index(index: u64) -> Option<Self> {
        Some(match index {
            0 => Self::Out,
            1 => Self::DumpVm,
            2 => Self::DumpVp,
            3 => Self::DumpVs,
            _ => return None,
        })
    }
}

impl VmOp {
    const fn from_index(index: u64) -> Option<Self> {
        Some(match index {
            0 => Self::CreateVm,
            1 => Self::DestroyVm,
            5 => Self::TlbFlush,
            _ => return None,
        })
    }
}

impl VpOp {
    const fn from_index(index: u64) -> Option<Self> {
        Some(match index {
            0 => Self::CreateVp,
            1 => Self::DestroyVp,
            _ => return None,
        })
    }
}

impl VsOp {
    const fn from_index(index: u64) -> Option<Self> {
        Some(match index {
            0 => Self::CreateVs,
            1 => Self::DestroyVs,
            2 => Self::InitAsRoot,
            3 => Self::Read,
            4 => Self::Write,
            5 => Self::Run,
            6 => Self::RunCurrent,
            7 => Self::AdvanceIpAndRun,
            8 => Self::AdvanceIpAndRunCurrent,
            9 => Self::Promote,
            10 => Self::Clear,
            11 => Self::Migrate,
            12 => Self::SetActive,
            13 => Self::AdvanceIpAndSetActive,
            14 => Self::TlbFlush,
            _ => return None,
        })
    }
}
