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

use crate::error::status;
use crate::ext::AxExtension;
use crate::id::{PpId, VmId, VpId, VsId};

/// The VM, VP and VS that are active together on one core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveTriple {
    /// The active VM.
    pub vmid: VmId,
    /// The active VP.
    pub vpid: VpId,
    /// The active VS.
    pub vsid: VsId,
}

impl ActiveTriple {
    /// Bundle three ids.
    pub const fn new(vmid: VmId, vpid: VpId, vsid: VsId) -> Self {
        Self { vmid, vpid, vsid }
    }
}

/// The execution context of one physical processor.
///
/// Each core owns exactly one context and passes it by `&mut` into every
/// pool and dispatcher call, so nothing here is shared between cores.
///
/// Recommended usage:
///
/// ```ignore
/// let mut ctx = PerCpuCtx::new(PpId::new(cpu_id as u16), online_cpus)?;
/// ctx.set_vmexit_ext(Some(&vmexit_ext));
/// // on each syscall trap:
/// ctx.set_syscall(Some(&caller), rax, [rdi, rsi, rdx, r10]);
/// dispatch_syscall(&mut ctx, &vm_pool, &vp_pool, &vs_pool);
/// ```
pub struct PerCpuCtx<'e, E: AxExtension> {
    ppid: PpId,
    online_pps: u16,

    /// The extension currently executing a syscall on this core.
    pub ext: Option<&'e E>,
    /// The extension registered to handle VM-exits on this core.
    pub ext_vmexit: Option<&'e E>,

    // Written only by the pools, together with the slot flags.
    pub(crate) active_vmid: VmId,
    pub(crate) active_vpid: VpId,
    pub(crate) active_vsid: VsId,

    /// The raw opcode of the pending syscall.
    pub ext_syscall: u64,
    /// Syscall argument register 0. Carries the handle on entry and the result on return.
    pub reg0: u64,
    /// Syscall argument register 1.
    pub reg1: u64,
    /// Syscall argument register 2.
    pub reg2: u64,
    /// Syscall argument register 3.
    pub reg3: u64,

    /// The status code of the last dispatched syscall.
    pub status: u64,
    /// The exit reason reported by the last VM-entry on this core.
    pub exit_reason: u64,
}

impl<'e, E: AxExtension> PerCpuCtx<'e, E> {
    /// Create the context of core `ppid` in a system of `online_pps` cores.
    pub fn new(ppid: PpId, online_pps: u16) -> AxResult<Self> {
        if ppid.is_invalid() || ppid.get() >= online_pps {
            return ax_err!(
                InvalidInput,
                format!("{} is not one of {} online cores", ppid, online_pps)
            );
        }
        Ok(Self {
            ppid,
            online_pps,
            ext: None,
            ext_vmexit: None,
            active_vmid: VmId::INVALID,
            active_vpid: VpId::INVALID,
            active_vsid: VsId::INVALID,
            ext_syscall: 0,
            reg0: 0,
            reg1: 0,
            reg2: 0,
            reg3: 0,
            status: status::SUCCESS,
            exit_reason: 0,
        })
    }

    /// The id of this core.
    pub const fn ppid(&self) -> PpId {
        self.ppid
    }

    /// The number of online cores.
    pub const fn online_pps(&self) -> u16 {
        self.online_pps
    }

    /// The VM active on this core, or the sentinel.
    pub const fn active_vmid(&self) -> VmId {
        self.active_vmid
    }

    /// The VP active on this core, or the sentinel.
    pub const fn active_vpid(&self) -> VpId {
        self.active_vpid
    }

    /// The VS active on this core, or the sentinel.
    pub const fn active_vsid(&self) -> VsId {
        self.active_vsid
    }

    /// Register the extension that handles VM-exits on this core.
    pub fn set_vmexit_ext(&mut self, ext: Option<&'e E>) {
        self.ext_vmexit = ext;
    }

    /// Load a pending syscall: the caller, its opcode and its four argument registers.
    pub fn set_syscall(&mut self, ext: Option<&'e E>, opcode: u64, regs: [u64; 4]) {
        self.ext = ext;
        self.ext_syscall = opcode;
        [self.reg0, self.reg1, self.reg2, self.reg3] = regs;
    }

    /// The active triple of this core, if all three ids are set.
    pub fn active_triple(&self) -> Option<ActiveTriple> {
        if self.active_vmid.is_invalid()
            || self.active_vpid.is_invalid()
            || self.active_vsid.is_invalid()
        {
            None
        } else {
            Some(ActiveTriple::new(
                self.active_vmid,
                self.active_vpid,
                self.active_vsid,
            ))
        }
    }

    /// Whether the executing extension is the registered VM-exit extension.
    pub fn is_vmexit_ext(&self) -> bool {
        match (self.ext, self.ext_vmexit) {
            (Some(ext), Some(vmexit)) => ext.id() == vmexit.id(),
            _ => false,
        }
    }

    pub(crate) fn set_active_triple(&mut self, triple: ActiveTriple) {
        self.active_vmid = triple.vmid;
        self.active_vpid = triple.vpid;
        self.active_vsid = triple.vsid;
    }
}
