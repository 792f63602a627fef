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

//! The failure taxonomy of the syscall layer and its stable status codes.

use core::fmt;

use axerrno::AxError;

/// Status codes observed by extensions.
///
/// The layout follows the microkernel ABI: the upper 32 bits carry the
/// `0xDEAD` failure signature, the low 16 bits the class and bits 16..32 a
/// one-hot reason within the class.
pub mod status {
    /// The syscall succeeded.
    pub const SUCCESS: u64 = 0x0000_0000_0000_0000;

    /// The extension's handle is not open.
    pub const FAILURE_INVALID_HANDLE: u64 = 0xDEAD_0000_0002_0001;
    /// The opcode is not recognized.
    pub const FAILURE_UNSUPPORTED: u64 = 0xDEAD_0000_0004_0001;
    /// A hardware primitive failed.
    pub const FAILURE_HARDWARE: u64 = 0xDEAD_0000_0008_0001;

    /// The caller is not the extension registered for VM-exits on this core.
    pub const INVALID_PERM_DENIED: u64 = 0xDEAD_0000_0001_0002;

    /// An id argument is the sentinel, too wide or beyond the table.
    pub const INVALID_ID: u64 = 0xDEAD_0000_0001_0003;
    /// An id argument names an object that does not exist.
    pub const INVALID_UNALLOCATED: u64 = 0xDEAD_0000_0002_0003;
    /// A physical processor id is not online.
    pub const INVALID_OUT_OF_RANGE: u64 = 0xDEAD_0000_0004_0003;
    /// A register selector is outside the enumeration.
    pub const INVALID_REGISTER: u64 = 0xDEAD_0000_0008_0003;
    /// A register selector is the reserved unsupported value.
    pub const INVALID_UNSUPPORTED_REGISTER: u64 = 0xDEAD_0000_0010_0003;
    /// An address argument is null or misaligned.
    pub const INVALID_ADDRESS: u64 = 0xDEAD_0000_0020_0003;

    /// The pool is full.
    pub const STATE_RESOURCE_EXHAUSTED: u64 = 0xDEAD_0000_0001_0004;
    /// The object is active and cannot be destroyed.
    pub const STATE_STILL_ACTIVE: u64 = 0xDEAD_0000_0002_0004;
    /// The object still owns children and cannot be destroyed.
    pub const STATE_STILL_ASSIGNED: u64 = 0xDEAD_0000_0004_0004;
    /// The object is active on a core where it must not be.
    pub const STATE_ACTIVE_ELSEWHERE: u64 = 0xDEAD_0000_0008_0004;
    /// The VS is homed on a different core.
    pub const STATE_NON_LOCAL: u64 = 0xDEAD_0000_0010_0004;
    /// The VS is not this core's root VS.
    pub const STATE_NOT_ROOT: u64 = 0xDEAD_0000_0020_0004;
    /// Nothing (or not the expected object) is active on this core.
    pub const STATE_NOT_ACTIVE: u64 = 0xDEAD_0000_0040_0004;
    /// The ownership chain does not match.
    pub const STATE_WRONG_OWNER: u64 = 0xDEAD_0000_0080_0004;
}

/// Why a syscall or pool operation was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MkError {
    /// The calling extension has no valid open handle.
    InvalidHandle,
    /// The opcode does not name a known operation.
    UnknownSyscall,
    /// The caller is not the VM-exit extension of this core.
    WrongExtension,
    /// The id is the sentinel, too wide, or beyond the table.
    InvalidId,
    /// The id is well formed but names no allocated object.
    Unallocated,
    /// The physical processor id is not online.
    OutOfRange,
    /// The pool has no free slot.
    ResourceExhausted,
    /// The object is active on some core.
    StillActive,
    /// The object is still referenced by a child object.
    StillAssigned,
    /// The object is active on another core (or the core has another object active).
    ActiveElsewhere,
    /// The VS is homed on another core.
    NonLocal,
    /// The VS is not a root VS of the calling core.
    NotRoot,
    /// The object (or triple) is not active on this core.
    NotActive,
    /// The ownership chain VM → VP → VS does not match the request.
    WrongOwner,
    /// The register selector is outside the enumeration.
    InvalidRegister,
    /// The register selector is the reserved unsupported value.
    UnsupportedRegister,
    /// The address is null or not page aligned.
    InvalidAddress,
    /// The hardware primitive failed.
    HardwareFailure,
}

impl MkError {
    /// The status code reported to the extension for this error.
    pub const fn status(self) -> u64 {
        match self {
            Self::InvalidHandle => status::FAILURE_INVALID_HANDLE,
            Self::UnknownSyscall => status::FAILURE_UNSUPPORTED,
            Self::WrongExtension => status::INVALID_PERM_DENIED,
            Self::InvalidId => status::INVALID_ID,
            Self::Unallocated => status::INVALID_UNALLOCATED,
            Self::OutOfRange => status::INVALID_OUT_OF_RANGE,
            Self::ResourceExhausted => status::STATE_RESOURCE_EXHAUSTED,
            Self::StillActive => status::STATE_STILL_ACTIVE,
            Self::StillAssigned => status::STATE_STILL_ASSIGNED,
            Self::ActiveElsewhere => status::STATE_ACTIVE_ELSEWHERE,
            Self::NonLocal => status::STATE_NON_LOCAL,
            Self::NotRoot => status::STATE_NOT_ROOT,
            Self::NotActive => status::STATE_NOT_ACTIVE,
            Self::WrongOwner => status::STATE_WRONG_OWNER,
            Self::InvalidRegister => status::INVALID_REGISTER,
            Self::UnsupportedRegister => status::INVALID_UNSUPPORTED_REGISTER,
            Self::InvalidAddress => status::INVALID_ADDRESS,
            Self::HardwareFailure => status::FAILURE_HARDWARE,
        }
    }

    /// Whether the error is about a malformed or dangling id.
    pub const fn is_id_class(self) -> bool {
        matches!(self, Self::InvalidId | Self::Unallocated | Self::OutOfRange)
    }

    /// A short description.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidHandle => "invalid handle",
            Self::UnknownSyscall => "unknown syscall",
            Self::WrongExtension => "wrong extension",
            Self::InvalidId => "invalid id",
            Self::Unallocated => "unallocated",
            Self::OutOfRange => "out of range",
            Self::ResourceExhausted => "resource exhausted",
            Self::StillActive => "still active",
            Self::StillAssigned => "still assigned",
            Self::ActiveElsewhere => "active elsewhere",
            Self::NonLocal => "non local",
            Self::NotRoot => "not root",
            Self::NotActive => "not active",
            Self::WrongOwner => "wrong owner",
            Self::InvalidRegister => "invalid register",
            Self::UnsupportedRegister => "unsupported register",
            Self::InvalidAddress => "invalid address",
            Self::HardwareFailure => "hardware failure",
        }
    }
}

impl fmt::Display for MkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<AxError> for MkError {
    fn from(err: AxError) -> Self {
        warn!("hardware primitive failed: {:?}", err);
        Self::HardwareFailure
    }
}

/// The result type of pool and syscall operations.
pub type MkResult<T = ()> = Result<T, MkError>;
