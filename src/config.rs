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

use axerrno::{AxResult, ax_err};

use crate::id::INVALID_ID;

/// Default number of VM slots, the root VM included.
pub const DEFAULT_MAX_VMS: usize = 16;
/// Default number of VP slots.
pub const DEFAULT_MAX_VPS: usize = 64;
/// Default number of VS slots.
pub const DEFAULT_MAX_VSS: usize = 64;
/// Default number of physical processors.
pub const DEFAULT_MAX_PPS: usize = 16;

/// Capacities of the object pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MkConfig {
    /// The number of VM slots.
    pub max_vms: usize,
    /// The number of VP slots.
    pub max_vps: usize,
    /// The number of VS slots.
    pub max_vss: usize,
    /// The number of physical processors the pools track activity for.
    pub max_pps: usize,
}

impl Default for MkConfig {
    fn default() -> Self {
        Self {
            max_vms: DEFAULT_MAX_VMS,
            max_vps: DEFAULT_MAX_VPS,
            max_vss: DEFAULT_MAX_VSS,
            max_pps: DEFAULT_MAX_PPS,
        }
    }
}

impl MkConfig {
    /// Set the number of VM slots.
    pub const fn with_max_vms(mut self, n: usize) -> Self {
        self.max_vms = n;
        self
    }

    /// Set the number of VP slots.
    pub const fn with_max_vps(mut self, n: usize) -> Self {
        self.max_vps = n;
        self
    }

    /// Set the number of VS slots.
    pub const fn with_max_vss(mut self, n: usize) -> Self {
        self.max_vss = n;
        self
    }

    /// Set the number of physical processors.
    pub const fn with_max_pps(mut self, n: usize) -> Self {
        self.max_pps = n;
        self
    }

    /// Check that every capacity is non-zero and addressable without hitting the sentinel id.
    pub fn validate(&self) -> AxResult {
        let limit = INVALID_ID as usize;
        for (name, n) in [
            ("max_vms", self.max_vms),
            ("max_vps", self.max_vps),
            ("max_vss", self.max_vss),
            ("max_pps", self.max_pps),
        ] {
            if n == 0 {
                return ax_err!(InvalidInput, format!("{name} must not be zero"));
            }
            if n > limit {
                return ax_err!(InvalidInput, format!("{name} {n} exceeds {limit}"));
            }
        }
        Ok(())
    }
}
