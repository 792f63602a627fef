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

//! The VM pool.

use alloc::vec;
use alloc::vec::Vec;

use crate::config::MkConfig;
use crate::error::{MkError, MkResult};
use crate::ext::AxExtension;
use crate::id::{PpId, ROOT_VMID, VmId};
use crate::percpu::PerCpuCtx;
use crate::slot::Slots;
use crate::vp::VpPool;

/// The bookkeeping of one VM slot.
pub(crate) struct VmSlot {
    pub allocated: bool,
    /// One flag per physical processor.
    pub active: Vec<bool>,
}

impl VmSlot {
    fn first_active(&self) -> Option<PpId> {
        self.active
            .iter()
            .position(|&a| a)
            .map(|pp| PpId::new(pp as u16))
    }

    pub fn set_active_on(&mut self, ppid: PpId, active: bool) {
        if let Some(flag) = self.active.get_mut(ppid.as_usize()) {
            *flag = active;
        }
    }

    pub fn is_active_on(&self, ppid: PpId) -> bool {
        self.active.get(ppid.as_usize()).copied().unwrap_or(false)
    }
}

/// The pool of virtual machines.
///
/// A VM may be active on several cores at once, one flag per core, since its
/// VPs may run in parallel. VM [`ROOT_VMID`] is the host itself; it is
/// allocated when the pool is created and can never be destroyed.
pub struct VmPool {
    slots: Slots<VmSlot>,
    max_pps: usize,
}

impl VmPool {
    /// Create a pool with `config.max_vms` slots, the root VM already allocated.
    pub fn new(config: &MkConfig) -> Self {
        let max_pps = config.max_pps;
        Self {
            slots: Slots::new(config.max_vms, |i| VmSlot {
                allocated: i == ROOT_VMID.as_usize(),
                active: vec![false; max_pps],
            }),
            max_pps,
        }
    }

    /// The number of VM slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The number of cores the pool tracks.
    pub fn max_pps(&self) -> usize {
        self.max_pps
    }

    pub(crate) fn slots(&self) -> &Slots<VmSlot> {
        &self.slots
    }

    /// Reject the sentinel and ids beyond the table.
    pub(crate) fn check_id(&self, id: VmId) -> MkResult {
        if id.is_invalid() || id.as_usize() >= self.slots.len() {
            error!("{} is invalid or out of range", id);
            Err(MkError::InvalidId)
        } else {
            Ok(())
        }
    }

    pub(crate) fn check_pp(&self, ppid: PpId) -> MkResult {
        if ppid.as_usize() >= self.max_pps {
            error!("{} is beyond the {} tracked cores", ppid, self.max_pps);
            Err(MkError::OutOfRange)
        } else {
            Ok(())
        }
    }

    fn with_allocated<R>(&self, id: VmId, f: impl FnOnce(&mut VmSlot) -> MkResult<R>) -> MkResult<R> {
        self.check_id(id)?;
        let mut slot = self.slots.lock(id.as_usize()).ok_or(MkError::InvalidId)?;
        if !slot.allocated {
            error!("{} is not allocated", id);
            return Err(MkError::Unallocated);
        }
        f(&mut *slot)
    }

    /// Allocate a VM.
    pub fn allocate(&self) -> MkResult<VmId> {
        let id = self
            .slots
            .find_map(|idx, slot| {
                if slot.allocated {
                    return None;
                }
                slot.allocated = true;
                slot.active.iter_mut().for_each(|a| *a = false);
                Some(VmId::new(idx as u16))
            })
            .ok_or_else(|| {
                error!("vm pool is out of slots");
                MkError::ResourceExhausted
            })?;
        debug!("{} allocated", id);
        Ok(id)
    }

    /// Free a VM that is neither active on any core nor owns a VP.
    pub fn deallocate(&self, vp_pool: &VpPool, id: VmId) -> MkResult {
        self.with_allocated(id, |slot| {
            if id == ROOT_VMID {
                error!("the root vm cannot be destroyed");
                return Err(MkError::InvalidId);
            }
            if let Some(pp) = slot.first_active() {
                error!("{} cannot be destroyed as it is still active on {}", id, pp);
                return Err(MkError::StillActive);
            }
            if let Some(vpid) = vp_pool.vp_assigned_to_vm(id) {
                error!("{} cannot be destroyed as {} is still assigned to it", id, vpid);
                return Err(MkError::StillAssigned);
            }
            slot.allocated = false;
            debug!("{} deallocated", id);
            Ok(())
        })
    }

    /// Mark a VM as the active VM of the calling core.
    pub fn set_active<E: AxExtension>(&self, ctx: &mut PerCpuCtx<'_, E>, id: VmId) -> MkResult {
        self.check_pp(ctx.ppid())?;
        self.with_allocated(id, |slot| {
            if slot.is_active_on(ctx.ppid()) {
                error!("{} is already active on {}", id, ctx.ppid());
                return Err(MkError::ActiveElsewhere);
            }
            if !ctx.active_vmid.is_invalid() {
                error!("{} is still active on {}", ctx.active_vmid, ctx.ppid());
                return Err(MkError::ActiveElsewhere);
            }
            slot.set_active_on(ctx.ppid(), true);
            ctx.active_vmid = id;
            trace!("{} active on {}", id, ctx.ppid());
            Ok(())
        })
    }

    /// Clear the active VM of the calling core.
    pub fn set_inactive<E: AxExtension>(&self, ctx: &mut PerCpuCtx<'_, E>, id: VmId) -> MkResult {
        self.with_allocated(id, |slot| {
            if ctx.active_vmid != id || !slot.is_active_on(ctx.ppid()) {
                error!("{} is not active on {}", id, ctx.ppid());
                return Err(MkError::NotActive);
            }
            if !ctx.active_vpid.is_invalid() {
                error!("{} of {} is still active on {}", ctx.active_vpid, id, ctx.ppid());
                return Err(MkError::StillActive);
            }
            slot.set_active_on(ctx.ppid(), false);
            ctx.active_vmid = VmId::INVALID;
            trace!("{} inactive on {}", id, ctx.ppid());
            Ok(())
        })
    }

    /// The first core the VM is active on, if any.
    pub fn is_active(&self, id: VmId) -> MkResult<Option<PpId>> {
        self.with_allocated(id, |slot| Ok(slot.first_active()))
    }

    /// Whether the VM is active on the calling core.
    pub fn is_active_on_this_pp<E: AxExtension>(&self, ctx: &PerCpuCtx<'_, E>, id: VmId) -> MkResult<bool> {
        self.with_allocated(id, |slot| Ok(slot.is_active_on(ctx.ppid())))
    }

    /// Whether `id` names an allocated VM. Malformed ids are simply not allocated.
    pub fn is_allocated(&self, id: VmId) -> bool {
        !id.is_invalid()
            && self
                .slots
                .lock(id.as_usize())
                .is_some_and(|slot| slot.allocated)
    }

    /// Log the state of a VM.
    pub fn dump(&self, id: VmId) -> MkResult {
        self.with_allocated(id, |slot| {
            info!("{}{}", id, if id == ROOT_VMID { " (root)" } else { "" });
            info!("  allocated: yes");
            for (pp, _) in slot.active.iter().enumerate().filter(|(_, a)| **a) {
                info!("  active on: {}", PpId::new(pp as u16));
            }
            Ok(())
        })
    }
}
