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

use axerrno::AxResult;
use memory_addr::VirtAddr;

use crate::id::{PpId, VsId};
use crate::reg::VsReg;

/// Architecture-specific virtual CPU state.
///
/// This trait is the seam between the VS pool and the instructions that
/// actually touch VMCS/VMCB state. The pool only calls into it after every
/// id, ownership and locality check has passed, and always on the VS's home
/// core, so implementations may assume they run where the state lives.
///
/// Every primitive is fallible. Failures are reported to the caller as a
/// hardware failure and never retried.
pub trait AxArchVs: Sized + Send {
    /// Architecture-specific configuration for VS creation.
    type CreateConfig: Clone + Send + Sync;

    /// Creates the architecture state of VS `vsid`, homed on core `ppid`.
    fn new(vsid: VsId, ppid: PpId, config: Self::CreateConfig) -> AxResult<Self>;

    /// Reads a register of the VS.
    fn read(&self, reg: VsReg) -> AxResult<u64>;

    /// Writes a register of the VS.
    fn write(&mut self, reg: VsReg, val: u64) -> AxResult;

    /// Makes this VS the one the current core enters on VM-entry.
    fn load(&mut self) -> AxResult;

    /// Detaches this VS from the current core after another one took its place.
    fn unload(&mut self) -> AxResult;

    /// Enters the guest until the next VM-exit and returns the exit reason.
    fn run(&mut self) -> AxResult<u64>;

    /// Advances the guest instruction pointer past the instruction that caused the last VM-exit.
    fn advance_ip(&mut self) -> AxResult;

    /// Loads the VS state onto the real hardware of the current core, leaving the hypervisor.
    fn promote(&mut self) -> AxResult;

    /// Flushes any copy of the VS cached by the hardware back to memory.
    fn clear(&mut self) -> AxResult;

    /// Initializes the VS from the state of the current core, making it a root VS.
    fn init_as_root(&mut self) -> AxResult;

    /// Flushes the TLB entries of the VS, for one guest linear address or for all of them.
    fn tlb_flush(&mut self, addr: Option<VirtAddr>) -> AxResult;
}
