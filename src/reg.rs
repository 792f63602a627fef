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

//! The register selector enumeration of the VS read/write syscalls (Intel VMX flavour).

use crate::error::{MkError, MkResult};

macro_rules! define_vs_regs {
    ($($name:ident = $value:literal,)*) => {
        /// A register of a VS, as selected by the `reg` argument of `vs_op_read`/`vs_op_write`.
        ///
        /// `Unsupported` and `Invalid` bracket the usable selectors and are always rejected.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(u64)]
        pub enum VsReg {
            /// Reserved: the register exists in the ABI but is not supported here.
            Unsupported = 0,
            $(
                #[allow(missing_docs)]
                $name = $value,
            )*
            /// One past the last valid selector.
            Invalid = VS_REG_MAX,
        }

        impl VsReg {
            /// Every usable selector, in ABI order.
            pub const ALL: &'static [VsReg] = &[$(VsReg::$name,)*];

            /// Map a raw selector to its register, `None` if it is out of the enumeration.
            pub const fn from_raw(raw: u64) -> Option<Self> {
                match raw {
                    0 => Some(Self::Unsupported),
                    $($value => Some(Self::$name),)*
                    VS_REG_MAX => Some(Self::Invalid),
                    _ => None,
                }
            }

            /// The ABI name of the register.
            pub const fn name(self) -> &'static str {
                match self {
                    Self::Unsupported => "unsupported",
                    $(Self::$name => stringify!($name),)*
                    Self::Invalid => "invalid",
                }
            }
        }
    };
}

/// The value of [`VsReg::Invalid`].
pub const VS_REG_MAX: u64 = 157;

define_vs_regs! {
    Rax = 1,
    Rbx = 2,
    Rcx = 3,
    Rdx = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
    GuestCr2 = 16,
    GuestDr6 = 17,
    GuestStar = 18,
    GuestLstar = 19,
    GuestCstar = 20,
    GuestFmask = 21,
    GuestKernelGsBase = 22,
    VirtualProcessorIdentifier = 23,
    PostedInterruptNotificationVector = 24,
    EptpIndex = 25,
    GuestEsSelector = 26,
    GuestCsSelector = 27,
    GuestSsSelector = 28,
    GuestDsSelector = 29,
    GuestFsSelector = 30,
    GuestGsSelector = 31,
    GuestLdtrSelector = 32,
    GuestTrSelector = 33,
    GuestInterruptStatus = 34,
    PmlIndex = 35,
    AddressOfIoBitmapA = 36,
    AddressOfIoBitmapB = 37,
    AddressOfMsrBitmaps = 38,
    VmexitMsrStoreAddress = 39,
    VmexitMsrLoadAddress = 40,
    VmentryMsrLoadAddress = 41,
    ExecutiveVmcsPointer = 42,
    PmlAddress = 43,
    TscOffset = 44,
    VirtualApicAddress = 45,
    ApicAccessAddress = 46,
    PostedInterruptDescriptorAddress = 47,
    VmFunctionControls = 48,
    EptPointer = 49,
    EoiExitBitmap0 = 50,
    EoiExitBitmap1 = 51,
    EoiExitBitmap2 = 52,
    EoiExitBitmap3 = 53,
    EptpListAddress = 54,
    VmreadBitmapAddress = 55,
    VmwriteBitmapAddress = 56,
    VirtExceptionInformationAddress = 57,
    XssExitingBitmap = 58,
    EnclsExitingBitmap = 59,
    SubPagePermissionTablePointer = 60,
    TlsMultiplier = 61,
    GuestPhysicalAddress = 62,
    VmcsLinkPointer = 63,
    GuestDebugctl = 64,
    GuestPat = 65,
    GuestEfer = 66,
    GuestPerfGlobalCtrl = 67,
    GuestPdpte0 = 68,
    GuestPdpte1 = 69,
    GuestPdpte2 = 70,
    GuestPdpte3 = 71,
    GuestBndcfgs = 72,
    GuestRtitCtl = 73,
    PinBasedVmExecutionCtls = 74,
    PrimaryProcBasedVmExecutionCtls = 75,
    ExceptionBitmap = 76,
    PageFaultErrorCodeMask = 77,
    PageFaultErrorCodeMatch = 78,
    Cr3TargetCount = 79,
    VmexitCtls = 80,
    VmexitMsrStoreCount = 81,
    VmexitMsrLoadCount = 82,
    VmentryCtls = 83,
    VmentryMsrLoadCount = 84,
    VmentryInterruptInformationField = 85,
    VmentryExceptionErrorCode = 86,
    VmentryInstructionLength = 87,
    TprThreshold = 88,
    SecondaryProcBasedVmExecutionCtls = 89,
    PleGap = 90,
    PleWindow = 91,
    VmInstructionError = 92,
    ExitReason = 93,
    VmexitInterruptionInformation = 94,
    VmexitInterruptionErrorCode = 95,
    IdtVectoringInformationField = 96,
    IdtVectoringErrorCode = 97,
    VmexitInstructionLength = 98,
    VmexitInstructionInformation = 99,
    GuestEsLimit = 100,
    GuestCsLimit = 101,
    GuestSsLimit = 102,
    GuestDsLimit = 103,
    GuestFsLimit = 104,
    GuestGsLimit = 105,
    GuestLdtrLimit = 106,
    GuestTrLimit = 107,
    GuestGdtrLimit = 108,
    GuestIdtrLimit = 109,
    GuestEsAccessRights = 110,
    GuestCsAccessRights = 111,
    GuestSsAccessRights = 112,
    GuestDsAccessRights = 113,
    GuestFsAccessRights = 114,
    GuestGsAccessRights = 115,
    GuestLdtrAccessRights = 116,
    GuestTrAccessRights = 117,
    GuestInterruptibilityState = 118,
    GuestActivityState = 119,
    GuestSmbase = 120,
    GuestSysenterCs = 121,
    VmxPreemptionTimerValue = 122,
    Cr0GuestHostMask = 123,
    Cr4GuestHostMask = 124,
    Cr0ReadShadow = 125,
    Cr4ReadShadow = 126,
    Cr3TargetValue0 = 127,
    Cr3TargetValue1 = 128,
    Cr3TargetValue2 = 129,
    Cr3TargetValue3 = 130,
    ExitQualification = 131,
    IoRcx = 132,
    IoRsi = 133,
    IoRdi = 134,
    IoRip = 135,
    GuestLinearAddress = 136,
    GuestCr0 = 137,
    GuestCr3 = 138,
    GuestCr4 = 139,
    GuestEsBase = 140,
    GuestCsBase = 141,
    GuestSsBase = 142,
    GuestDsBase = 143,
    GuestFsBase = 144,
    GuestGsBase = 145,
    GuestLdtrBase = 146,
    GuestTrBase = 147,
    GuestGdtrBase = 148,
    GuestIdtrBase = 149,
    GuestDr7 = 150,
    GuestRsp = 151,
    GuestRip = 152,
    GuestRflags = 153,
    GuestPendingDebugExceptions = 154,
    GuestSysenterEsp = 155,
    GuestSysenterEip = 156,
}

impl VsReg {
    /// Decode and vet a raw selector from a syscall register.
    ///
    /// Anything at or beyond [`VsReg::Invalid`] is an invalid register, the reserved
    /// [`VsReg::Unsupported`] selector is refused separately.
    pub fn decode(raw: u64) -> MkResult<Self> {
        match Self::from_raw(raw) {
            None | Some(Self::Invalid) => {
                error!("register {:#x} is out of range", raw);
                Err(MkError::InvalidRegister)
            }
            Some(Self::Unsupported) => {
                error!("register {:#x} is unsupported", raw);
                Err(MkError::UnsupportedRegister)
            }
            Some(reg) => Ok(reg),
        }
    }

    /// The raw selector.
    pub const fn raw(self) -> u64 {
        self as u64
    }
}
