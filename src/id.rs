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

//! Fixed-width object identifiers shared by all pools.

use core::fmt;

/// The raw value reserved to mean "no object".
pub const INVALID_ID: u16 = 0xFFFF;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u16);

        impl $name {
            /// The sentinel id.
            pub const INVALID: Self = Self(INVALID_ID);

            /// Wraps a raw id. The sentinel is accepted and reported by [`Self::is_invalid`].
            pub const fn new(raw: u16) -> Self {
                Self(raw)
            }

            /// Decodes an id from a 64-bit syscall argument register.
            ///
            /// Returns `None` if the value does not fit in 16 bits.
            pub fn from_reg(reg: u64) -> Option<Self> {
                u16::try_from(reg).ok().map(Self)
            }

            /// Returns the raw id.
            pub const fn get(self) -> u16 {
                self.0
            }

            /// Returns the id as a table index.
            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }

            /// Whether this is the sentinel id.
            pub const fn is_invalid(self) -> bool {
                self.0 == INVALID_ID
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::INVALID
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> u64 {
                id.0 as u64
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($what, " {:#06x}"), self.0)
            }
        }
    };
}

define_id!(
    /// The id of a virtual machine.
    VmId,
    "vm"
);
define_id!(
    /// The id of a virtual processor.
    VpId,
    "vp"
);
define_id!(
    /// The id of a virtual CPU state.
    VsId,
    "vs"
);
define_id!(
    /// The id of a physical processor (core).
    PpId,
    "pp"
);

/// The VM that represents the host itself. It exists from boot and can never be destroyed.
pub const ROOT_VMID: VmId = VmId::new(0);

/// The identity of an extension, as far as this crate cares.
pub type ExtId = u16;
