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

//! The VP pool.

use crate::arch_vs::AxArchVs;
use crate::config::MkConfig;
use crate::error::{MkError, MkResult};
use crate::ext::AxExtension;
use crate::id::{PpId, VmId, VpId};
use crate::percpu::PerCpuCtx;
use crate::slot::Slots;
use crate::vm::VmPool;
use crate::vs::VsPool;

/// The bookkeeping of one VP slot.
pub(crate) struct VpSlot {
    pub allocated: bool,
    pub vmid: VmId,
    pub active: Option<PpId>,
}

/// The pool of virtual processors.
///
/// A VP belongs to the VM it was created under for its whole life and runs
/// on at most one core at a time.
pub struct VpPool {
    slots: Slots<VpSlot>,
}

impl VpPool {
    /// Create a pool with `config.max_vps` free slots.
    pub fn new(config: &MkConfig) -> Self {
        Self {
            slots: Slots::new(config.max_vps, |_| VpSlot {
                allocated: false,
                vmid: VmId::INVALID,
                active: None,
            }),
        }
    }

    /// The number of VP slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slots(&self) -> &Slots<VpSlot> {
        &self.slots
    }

    pub(crate) fn check_id(&self, id: VpId) -> MkResult {
        if id.is_invalid() || id.as_usize() >= self.slots.len() {
            error!("{} is invalid or out of range", id);
            Err(MkError::InvalidId)
        } else {
            Ok(())
        }
    }

    fn with_allocated<R>(
        &self,
        id: VpId,
        f: impl FnOnce(&mut VpSlot) -> MkResult<R>,
    ) -> MkResult<R> {
        self.check_id(id)?;
        let mut slot = self.slots.lock(id.as_usize()).ok_or(MkError::InvalidId)?;
        if !slot.allocated {
            error!("{} is not allocated", id);
            return Err(MkError::Unallocated);
        }
        f(&mut *slot)
    }

    /// Allocate a VP owned by `vmid`.
    pub fn allocate(&self, vm_pool: &VmPool, vmid: VmId) -> MkResult<VpId> {
        vm_pool.check_id(vmid)?;
        // The VM slot stays locked until the VP is bound so the VM cannot go away meanwhile.
        let vm = vm_pool
            .slots()
            .lock(vmid.as_usize())
            .ok_or(MkError::InvalidId)?;
        if !vm.allocated {
            error!("{} is not allocated", vmid);
            return Err(MkError::Unallocated);
        }
        let id = self
            .slots
            .find_map(|idx, slot| {
                if slot.allocated {
                    return None;
                }
                slot.allocated = true;
                slot.vmid = vmid;
                slot.active = None;
                Some(VpId::new(idx as u16))
            })
            .ok_or_else(|| {
                error!("vp pool is out of slots");
                MkError::ResourceExhausted
            })?;
        drop(vm);
        debug!("{} allocated for {}", id, vmid);
        Ok(id)
    }

    /// Free a VP that is not active and owns no VS.
    pub fn deallocate<A: AxArchVs>(&self, vs_pool: &VsPool<A>, id: VpId) -> MkResult {
        self.with_allocated(id, |slot| {
            if let Some(pp) = slot.active {
                error!("{} cannot be destroyed as it is still active on {}", id, pp);
                return Err(MkError::StillActive);
            }
            if let Some(vsid) = vs_pool.vs_assigned_to_vp(id) {
                error!("{} cannot be destroyed as {} is still assigned to it", id, vsid);
                return Err(MkError::StillAssigned);
            }
            slot.allocated = false;
            slot.vmid = VmId::INVALID;
            debug!("{} deallocated", id);
            Ok(())
        })
    }

    /// Mark a VP as the active VP of the calling core. Its VM must already be the active VM there.
    pub fn set_active<E: AxExtension>(&self, ctx: &mut PerCpuCtx<'_, E>, id: VpId) -> MkResult {
        self.with_allocated(id, |slot| {
            if ctx.active_vmid != slot.vmid {
                error!("{} of {} is not active on {}", id, slot.vmid, ctx.ppid());
                return Err(MkError::NotActive);
            }
            if let Some(pp) = slot.active {
                error!("{} is already active on {}", id, pp);
                return Err(MkError::ActiveElsewhere);
            }
            if !ctx.active_vpid.is_invalid() {
                error!("{} is still active on {}", ctx.active_vpid, ctx.ppid());
                return Err(MkError::ActiveElsewhere);
            }
            slot.active = Some(ctx.ppid());
            ctx.active_vpid = id;
            trace!("{} active on {}", id, ctx.ppid());
            Ok(())
        })
    }

    /// Clear the active VP of the calling core.
    pub fn set_inactive<E: AxExtension>(&self, ctx: &mut PerCpuCtx<'_, E>, id: VpId) -> MkResult {
        self.with_allocated(id, |slot| {
            if ctx.active_vpid != id || slot.active != Some(ctx.ppid()) {
                error!("{} is not active on {}", id, ctx.ppid());
                return Err(MkError::NotActive);
            }
            if !ctx.active_vsid.is_invalid() {
                error!("{} of {} is still active on {}", ctx.active_vsid, id, ctx.ppid());
                return Err(MkError::StillActive);
            }
            slot.active = None;
            ctx.active_vpid = VpId::INVALID;
            trace!("{} inactive on {}", id, ctx.ppid());
            Ok(())
        })
    }

    /// The core the VP is active on, if any.
    pub fn is_active(&self, id: VpId) -> MkResult<Option<PpId>> {
        self.with_allocated(id, |slot| Ok(slot.active))
    }

    /// Whether the VP is active on the calling core.
    pub fn is_active_on_this_pp<E: AxExtension>(&self, ctx: &PerCpuCtx<'_, E>, id: VpId) -> MkResult<bool> {
        self.with_allocated(id, |slot| Ok(slot.active == Some(ctx.ppid())))
    }

    /// Whether `id` names an allocated VP.
    pub fn is_allocated(&self, id: VpId) -> bool {
        !id.is_invalid()
            && self
                .slots
                .lock(id.as_usize())
                .is_some_and(|slot| slot.allocated)
    }

    /// The VM a VP belongs to.
    pub fn vm_id(&self, id: VpId) -> MkResult<VmId> {
        self.with_allocated(id, |slot| Ok(slot.vmid))
    }

    /// Some VP still owned by `vmid`, if there is one.
    pub fn vp_assigned_to_vm(&self, vmid: VmId) -> Option<VpId> {
        self.slots.find_map(|idx, slot| {
            (slot.allocated && slot.vmid == vmid).then(|| VpId::new(idx as u16))
        })
    }

    /// Log the state of a VP.
    pub fn dump(&self, id: VpId) -> MkResult {
        self.with_allocated(id, |slot| {
            info!("{}", id);
            info!("  owner: {}", slot.vmid);
            match slot.active {
                Some(pp) => info!("  active on: {}", pp),
                None => info!("  active on: none"),
            }
            Ok(())
        })
    }
}
