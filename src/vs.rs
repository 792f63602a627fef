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

//! The VS pool and the active-triple transaction.

use axerrno::AxError;
use memory_addr::{MemoryAddr, VirtAddr};
use spin::MutexGuard;

use crate::arch_vs::AxArchVs;
use crate::config::MkConfig;
use crate::error::{MkError, MkResult};
use crate::ext::AxExtension;
use crate::id::{PpId, VmId, VpId, VsId};
use crate::percpu::{ActiveTriple, PerCpuCtx};
use crate::reg::VsReg;
use crate::slot::Slots;
use crate::vm::VmPool;
use crate::vp::VpPool;

/// The `addr` argument of a VS TLB flush that selects every address.
pub const TLB_FLUSH_ALL: u64 = u64::MAX;

/// The bookkeeping and architecture state of one VS slot.
pub(crate) struct VsSlot<A: AxArchVs> {
    allocated: bool,
    vpid: VpId,
    vmid: VmId,
    home: PpId,
    active: Option<PpId>,
    arch: Option<A>,
}

impl<A: AxArchVs> VsSlot<A> {
    const fn free() -> Self {
        Self {
            allocated: false,
            vpid: VpId::INVALID,
            vmid: VmId::INVALID,
            home: PpId::INVALID,
            active: None,
            arch: None,
        }
    }

    fn arch(&mut self) -> MkResult<&mut A> {
        self.arch.as_mut().ok_or(MkError::Unallocated)
    }
}

type VsGuard<'a, A> = MutexGuard<'a, VsSlot<A>>;

/// Reload the VS that was active before a failed switch.
fn reload<A: AxArchVs>(old: Option<&mut VsGuard<'_, A>>) {
    if let Some(arch) = old.and_then(|slot| slot.arch.as_mut()) {
        if let Err(err) = arch.load() {
            error!("failed to reload the previous vs: {:?}", err);
        }
    }
}

/// What a core had active before a switch. Any id may be the sentinel.
#[derive(Clone, Copy)]
struct Replaced {
    vmid: VmId,
    vpid: VpId,
    vsid: VsId,
}

impl Replaced {
    fn of<E: AxExtension>(ctx: &PerCpuCtx<'_, E>) -> Self {
        Self {
            vmid: ctx.active_vmid,
            vpid: ctx.active_vpid,
            vsid: ctx.active_vsid,
        }
    }

    fn vm_slot(&self) -> Option<usize> {
        (!self.vmid.is_invalid()).then(|| self.vmid.as_usize())
    }

    fn vp_slot(&self) -> Option<usize> {
        (!self.vpid.is_invalid()).then(|| self.vpid.as_usize())
    }

    fn vs_slot(&self) -> Option<usize> {
        (!self.vsid.is_invalid()).then(|| self.vsid.as_usize())
    }
}

fn hardware(what: &str, id: VsId, err: AxError) -> MkError {
    error!("{} of {} failed: {:?}", what, id, err);
    MkError::HardwareFailure
}

/// The pool of virtual CPU states.
///
/// A VS belongs to one VP (and through it one VM), is homed on one core and
/// may only be touched from there. It is active on at most one core, always
/// its home, and can only change home while inactive.
pub struct VsPool<A: AxArchVs> {
    slots: Slots<VsSlot<A>>,
    arch_config: A::CreateConfig,
}

impl<A: AxArchVs> VsPool<A> {
    /// Create a pool with `config.max_vss` free slots. `arch_config` is handed
    /// to [`AxArchVs::new`] for every VS created.
    pub fn new(config: &MkConfig, arch_config: A::CreateConfig) -> Self {
        Self {
            slots: Slots::new(config.max_vss, |_| VsSlot::free()),
            arch_config,
        }
    }

    /// The number of VS slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn check_id(&self, id: VsId) -> MkResult {
        if id.is_invalid() || id.as_usize() >= self.slots.len() {
            error!("{} is invalid or out of range", id);
            Err(MkError::InvalidId)
        } else {
            Ok(())
        }
    }

    fn lock_allocated(&self, id: VsId) -> MkResult<VsGuard<'_, A>> {
        self.check_id(id)?;
        let slot = self.slots.lock(id.as_usize()).ok_or(MkError::InvalidId)?;
        if !slot.allocated {
            error!("{} is not allocated", id);
            return Err(MkError::Unallocated);
        }
        Ok(slot)
    }

    fn check_local<E: AxExtension>(ctx: &PerCpuCtx<'_, E>, id: VsId, slot: &VsSlot<A>) -> MkResult {
        if slot.home != ctx.ppid() {
            error!("{} is homed on {} and cannot be used from {}", id, slot.home, ctx.ppid());
            return Err(MkError::NonLocal);
        }
        Ok(())
    }

    fn lock_local<E: AxExtension>(&self, ctx: &PerCpuCtx<'_, E>, id: VsId) -> MkResult<VsGuard<'_, A>> {
        let slot = self.lock_allocated(id)?;
        Self::check_local(ctx, id, &slot)?;
        Ok(slot)
    }

    fn check_pp<E: AxExtension>(ctx: &PerCpuCtx<'_, E>, ppid: PpId) -> MkResult {
        if ppid.is_invalid() {
            error!("the pp id is the sentinel");
            return Err(MkError::InvalidId);
        }
        if ppid.get() >= ctx.online_pps() {
            error!("{} is not online ({} cores)", ppid, ctx.online_pps());
            return Err(MkError::OutOfRange);
        }
        Ok(())
    }

    /// Allocate a VS for `vpid`, homed on `home`.
    pub fn allocate<E: AxExtension>(
        &self,
        ctx: &PerCpuCtx<'_, E>,
        vp_pool: &VpPool,
        vpid: VpId,
        home: PpId,
    ) -> MkResult<VsId> {
        vp_pool.check_id(vpid)?;
        Self::check_pp(ctx, home)?;
        // Keep the VP locked so it cannot be destroyed before the VS is bound to it.
        let vp = vp_pool
            .slots()
            .lock(vpid.as_usize())
            .ok_or(MkError::InvalidId)?;
        if !vp.allocated {
            error!("{} is not allocated", vpid);
            return Err(MkError::Unallocated);
        }
        let vmid = vp.vmid;

        let created = self.slots.find_map(|idx, slot| {
            if slot.allocated {
                return None;
            }
            let id = VsId::new(idx as u16);
            Some(A::new(id, home, self.arch_config.clone()).map(|arch| {
                *slot = VsSlot {
                    allocated: true,
                    vpid,
                    vmid,
                    home,
                    active: None,
                    arch: Some(arch),
                };
                id
            }))
        });
        drop(vp);

        match created {
            None => {
                error!("vs pool is out of slots");
                Err(MkError::ResourceExhausted)
            }
            Some(Err(err)) => {
                error!("failed to create the state of a vs for {}: {:?}", vpid, err);
                Err(MkError::HardwareFailure)
            }
            Some(Ok(id)) => {
                debug!("{} allocated for {} of {} on {}", id, vpid, vmid, home);
                Ok(id)
            }
        }
    }

    /// Free an inactive VS.
    pub fn deallocate(&self, id: VsId) -> MkResult {
        let mut slot = self.lock_allocated(id)?;
        if let Some(pp) = slot.active {
            error!("{} cannot be destroyed as it is still active on {}", id, pp);
            return Err(MkError::StillActive);
        }
        *slot = VsSlot::free();
        debug!("{} deallocated", id);
        Ok(())
    }

    /// Read a register of a local VS.
    pub fn read<E: AxExtension>(&self, ctx: &PerCpuCtx<'_, E>, id: VsId, reg: u64) -> MkResult<u64> {
        let mut slot = self.lock_allocated(id)?;
        let reg = VsReg::decode(reg)?;
        self.check_accessible(ctx, id, &slot)?;
        slot.arch()?
            .read(reg)
            .map_err(|err| hardware("read", id, err))
    }

    /// Write a register of a local VS.
    pub fn write<E: AxExtension>(
        &self,
        ctx: &PerCpuCtx<'_, E>,
        id: VsId,
        reg: u64,
        val: u64,
    ) -> MkResult {
        let mut slot = self.lock_allocated(id)?;
        let reg = VsReg::decode(reg)?;
        self.check_accessible(ctx, id, &slot)?;
        slot.arch()?
            .write(reg, val)
            .map_err(|err| hardware("write", id, err))
    }

    fn check_accessible<E: AxExtension>(
        &self,
        ctx: &PerCpuCtx<'_, E>,
        id: VsId,
        slot: &VsSlot<A>,
    ) -> MkResult {
        Self::check_local(ctx, id, slot)?;
        match slot.active {
            Some(pp) if pp != ctx.ppid() => {
                error!("{} is active on {}", id, pp);
                Err(MkError::ActiveElsewhere)
            }
            _ => Ok(()),
        }
    }

    /// Make `req` the active triple of the calling core.
    ///
    /// Everything is validated with the new and the previously active
    /// objects locked (VMs, then VPs, then VSs). The hardware switch comes
    /// next and is undone if any primitive fails. The bookkeeping is only
    /// committed once the hardware agrees.
    ///
    /// Returns what the switch replaced, or `None` if `req` was already active.
    fn activate<E: AxExtension>(
        &self,
        ctx: &mut PerCpuCtx<'_, E>,
        vm_pool: &VmPool,
        vp_pool: &VpPool,
        req: ActiveTriple,
        advance_ip: bool,
    ) -> MkResult<Option<Replaced>> {
        if ctx.active_triple() == Some(req) {
            if advance_ip {
                let mut slot = self.lock_allocated(req.vsid)?;
                slot.arch()?
                    .advance_ip()
                    .map_err(|err| hardware("advance_ip", req.vsid, err))?;
            }
            return Ok(None);
        }

        let pp = ctx.ppid();
        vm_pool.check_pp(pp)?;
        vm_pool.check_id(req.vmid)?;
        vp_pool.check_id(req.vpid)?;
        self.check_id(req.vsid)?;

        let replaced = Replaced::of(ctx);
        let mut vms = vm_pool
            .slots()
            .lock_pair(req.vmid.as_usize(), replaced.vm_slot())
            .ok_or(MkError::InvalidId)?;
        let mut vps = vp_pool
            .slots()
            .lock_pair(req.vpid.as_usize(), replaced.vp_slot())
            .ok_or(MkError::InvalidId)?;
        let mut vss = self
            .slots
            .lock_pair(req.vsid.as_usize(), replaced.vs_slot())
            .ok_or(MkError::InvalidId)?;

        if !vms.new.allocated {
            error!("{} is not allocated", req.vmid);
            return Err(MkError::Unallocated);
        }
        if !vps.new.allocated {
            error!("{} is not allocated", req.vpid);
            return Err(MkError::Unallocated);
        }
        if !vss.new.allocated {
            error!("{} is not allocated", req.vsid);
            return Err(MkError::Unallocated);
        }
        if vps.new.vmid != req.vmid {
            error!("{} belongs to {}, not {}", req.vpid, vps.new.vmid, req.vmid);
            return Err(MkError::WrongOwner);
        }
        if vss.new.vpid != req.vpid {
            error!("{} belongs to {}, not {}", req.vsid, vss.new.vpid, req.vpid);
            return Err(MkError::WrongOwner);
        }
        Self::check_local(ctx, req.vsid, &vss.new)?;
        if let Some(other) = vps.new.active.filter(|&p| p != pp) {
            error!("{} is already active on {}", req.vpid, other);
            return Err(MkError::ActiveElsewhere);
        }
        if let Some(other) = vss.new.active.filter(|&p| p != pp) {
            error!("{} is already active on {}", req.vsid, other);
            return Err(MkError::ActiveElsewhere);
        }

        if let Some(old) = vss.old.as_mut() {
            old.arch()?
                .unload()
                .map_err(|err| hardware("unload", ctx.active_vsid, err))?;
        }
        let loaded = vss.new.active != Some(pp);
        if loaded {
            let res = vss.new.arch()?.load();
            if let Err(err) = res {
                reload(vss.old.as_mut());
                return Err(hardware("load", req.vsid, err));
            }
        }
        if advance_ip {
            let res = vss.new.arch()?.advance_ip();
            if let Err(err) = res {
                if loaded {
                    if let Err(err) = vss.new.arch()?.unload() {
                        error!("failed to unload {}: {:?}", req.vsid, err);
                    }
                    reload(vss.old.as_mut());
                }
                return Err(hardware("advance_ip", req.vsid, err));
            }
        }

        if let Some(old) = vms.old.as_mut() {
            old.set_active_on(pp, false);
        }
        vms.new.set_active_on(pp, true);
        if let Some(old) = vps.old.as_mut() {
            old.active = None;
        }
        vps.new.active = Some(pp);
        if let Some(old) = vss.old.as_mut() {
            old.active = None;
        }
        vss.new.active = Some(pp);
        ctx.set_active_triple(req);

        debug!(
            "{} is now active on {} with {} of {}",
            req.vsid, pp, req.vpid, req.vmid
        );
        Ok(Some(replaced))
    }

    /// Give the calling core back to what a switch replaced, after the
    /// guest it switched to could not be entered.
    fn revert<E: AxExtension>(
        &self,
        ctx: &mut PerCpuCtx<'_, E>,
        vm_pool: &VmPool,
        vp_pool: &VpPool,
        replaced: Replaced,
    ) {
        let pp = ctx.ppid();
        let failed = Replaced::of(ctx);
        let (Some(mut vms), Some(mut vps), Some(mut vss)) = (
            vm_pool
                .slots()
                .lock_pair(failed.vmid.as_usize(), replaced.vm_slot()),
            vp_pool
                .slots()
                .lock_pair(failed.vpid.as_usize(), replaced.vp_slot()),
            self.slots
                .lock_pair(failed.vsid.as_usize(), replaced.vs_slot()),
        ) else {
            error!("cannot revert {} on {}", failed.vsid, pp);
            return;
        };

        if replaced.vsid != failed.vsid {
            if let Some(arch) = vss.new.arch.as_mut() {
                if let Err(err) = arch.unload() {
                    error!("failed to unload {}: {:?}", failed.vsid, err);
                }
            }
            reload(vss.old.as_mut());
            vss.new.active = None;
            if let Some(old) = vss.old.as_mut() {
                old.active = Some(pp);
            }
        }
        if replaced.vpid != failed.vpid {
            vps.new.active = None;
            if let Some(old) = vps.old.as_mut() {
                old.active = Some(pp);
            }
        }
        if replaced.vmid != failed.vmid {
            vms.new.set_active_on(pp, false);
            if let Some(old) = vms.old.as_mut() {
                old.set_active_on(pp, true);
            }
        }
        ctx.active_vmid = replaced.vmid;
        ctx.active_vpid = replaced.vpid;
        ctx.active_vsid = replaced.vsid;
        debug!("{} is no longer active on {}, {} is back", failed.vsid, pp, replaced.vsid);
    }

    /// Clear the active triple of the calling core, unloading its VS.
    pub fn deactivate<E: AxExtension>(
        &self,
        ctx: &mut PerCpuCtx<'_, E>,
        vm_pool: &VmPool,
        vp_pool: &VpPool,
    ) -> MkResult {
        let triple = Self::current(ctx)?;
        let pp = ctx.ppid();
        let mut vm = vm_pool
            .slots()
            .lock(triple.vmid.as_usize())
            .ok_or(MkError::InvalidId)?;
        let mut vp = vp_pool
            .slots()
            .lock(triple.vpid.as_usize())
            .ok_or(MkError::InvalidId)?;
        let mut vs = self.lock_allocated(triple.vsid)?;
        vs.arch()?
            .unload()
            .map_err(|err| hardware("unload", triple.vsid, err))?;
        vm.set_active_on(pp, false);
        vp.active = None;
        vs.active = None;
        ctx.active_vmid = VmId::INVALID;
        ctx.active_vpid = VpId::INVALID;
        ctx.active_vsid = VsId::INVALID;
        debug!("{} is no longer active on {}", triple.vsid, pp);
        Ok(())
    }

    fn current<E: AxExtension>(ctx: &PerCpuCtx<'_, E>) -> MkResult<ActiveTriple> {
        ctx.active_triple().ok_or_else(|| {
            error!("nothing is active on {}", ctx.ppid());
            MkError::NotActive
        })
    }

    /// Enter the guest with the active VS of the calling core.
    ///
    /// The architecture state is taken out of the slot for the duration of
    /// the run, so no lock is held while the guest executes. Being active
    /// on this core keeps the VS from being destroyed or migrated meanwhile.
    fn enter<E: AxExtension>(&self, ctx: &mut PerCpuCtx<'_, E>, advance_ip: bool) -> MkResult<u64> {
        let id = Self::current(ctx)?.vsid;
        let mut arch = {
            let mut slot = self.lock_allocated(id)?;
            slot.arch.take().ok_or(MkError::Unallocated)?
        };
        let res = Self::advance_and_run(&mut arch, id, advance_ip);
        if let Some(mut slot) = self.slots.lock(id.as_usize()) {
            slot.arch = Some(arch);
        }
        let reason = res?;
        ctx.exit_reason = reason;
        trace!("{} exited with reason {:#x}", id, reason);
        Ok(reason)
    }

    /// The guest IP is restored if VM-entry fails after advancing it.
    fn advance_and_run(arch: &mut A, id: VsId, advance_ip: bool) -> MkResult<u64> {
        if !advance_ip {
            return arch.run().map_err(|err| hardware("run", id, err));
        }
        let rip = arch
            .read(VsReg::GuestRip)
            .map_err(|err| hardware("read", id, err))?;
        arch.advance_ip()
            .map_err(|err| hardware("advance_ip", id, err))?;
        arch.run().map_err(|err| {
            if let Err(err) = arch.write(VsReg::GuestRip, rip) {
                error!("failed to restore the ip of {}: {:?}", id, err);
            }
            hardware("run", id, err)
        })
    }

    /// Switch to `req` and enter it, handing the core back to the replaced
    /// objects if VM-entry fails.
    fn switch_and_enter<E: AxExtension>(
        &self,
        ctx: &mut PerCpuCtx<'_, E>,
        vm_pool: &VmPool,
        vp_pool: &VpPool,
        req: ActiveTriple,
        advance_ip: bool,
    ) -> MkResult<u64> {
        let replaced = self.activate(ctx, vm_pool, vp_pool, req, false)?;
        let res = self.enter(ctx, advance_ip);
        if let (Err(_), Some(replaced)) = (&res, replaced) {
            self.revert(ctx, vm_pool, vp_pool, replaced);
        }
        res
    }

    /// Make the triple active on the calling core and enter the guest.
    ///
    /// Returns the exit reason of the VM-exit that ended the run.
    pub fn run<E: AxExtension>(
        &self,
        ctx: &mut PerCpuCtx<'_, E>,
        vm_pool: &VmPool,
        vp_pool: &VpPool,
        vmid: VmId,
        vpid: VpId,
        vsid: VsId,
    ) -> MkResult<u64> {
        self.switch_and_enter(ctx, vm_pool, vp_pool, ActiveTriple::new(vmid, vpid, vsid), false)
    }

    /// Enter the guest with the active triple of the calling core.
    pub fn run_current<E: AxExtension>(&self, ctx: &mut PerCpuCtx<'_, E>) -> MkResult<u64> {
        self.enter(ctx, false)
    }

    /// Like [`VsPool::run`], advancing the new VS past its last exiting instruction first.
    pub fn advance_ip_and_run<E: AxExtension>(
        &self,
        ctx: &mut PerCpuCtx<'_, E>,
        vm_pool: &VmPool,
        vp_pool: &VpPool,
        vmid: VmId,
        vpid: VpId,
        vsid: VsId,
    ) -> MkResult<u64> {
        self.switch_and_enter(ctx, vm_pool, vp_pool, ActiveTriple::new(vmid, vpid, vsid), true)
    }

    /// Like [`VsPool::run_current`], advancing the active VS past its last exiting instruction first.
    pub fn advance_ip_and_run_current<E: AxExtension>(&self, ctx: &mut PerCpuCtx<'_, E>) -> MkResult<u64> {
        self.enter(ctx, true)
    }

    /// Make the triple active on the calling core without entering the guest.
    pub fn set_active<E: AxExtension>(
        &self,
        ctx: &mut PerCpuCtx<'_, E>,
        vm_pool: &VmPool,
        vp_pool: &VpPool,
        vmid: VmId,
        vpid: VpId,
        vsid: VsId,
    ) -> MkResult {
        self.activate(ctx, vm_pool, vp_pool, ActiveTriple::new(vmid, vpid, vsid), false)
            .map(|_| ())
    }

    /// Like [`VsPool::set_active`], advancing the new VS past its last exiting instruction.
    pub fn advance_ip_and_set_active<E: AxExtension>(
        &self,
        ctx: &mut PerCpuCtx<'_, E>,
        vm_pool: &VmPool,
        vp_pool: &VpPool,
        vmid: VmId,
        vpid: VpId,
        vsid: VsId,
    ) -> MkResult {
        self.activate(ctx, vm_pool, vp_pool, ActiveTriple::new(vmid, vpid, vsid), true)
            .map(|_| ())
    }

    /// Load a local VS onto the real hardware, handing the core over to it.
    pub fn promote<E: AxExtension>(&self, ctx: &PerCpuCtx<'_, E>, id: VsId) -> MkResult {
        let mut slot = self.lock_local(ctx, id)?;
        slot.arch()?
            .promote()
            .map_err(|err| hardware("promote", id, err))?;
        info!("{} promoted on {}", id, ctx.ppid());
        Ok(())
    }

    /// Flush any hardware cached copy of a local VS.
    pub fn clear<E: AxExtension>(&self, ctx: &PerCpuCtx<'_, E>, id: VsId) -> MkResult {
        let mut slot = self.lock_local(ctx, id)?;
        slot.arch()?
            .clear()
            .map_err(|err| hardware("clear", id, err))
    }

    /// Initialize the root VS of the calling core from the core's own state.
    pub fn init_as_root<E: AxExtension>(&self, ctx: &PerCpuCtx<'_, E>, id: VsId) -> MkResult {
        let mut slot = self.lock_local(ctx, id)?;
        if id.get() != ctx.ppid().get() {
            error!("{} is not the root vs of {}", id, ctx.ppid());
            return Err(MkError::NotRoot);
        }
        slot.arch()?
            .init_as_root()
            .map_err(|err| hardware("init_as_root", id, err))?;
        debug!("{} initialized as the root vs of {}", id, ctx.ppid());
        Ok(())
    }

    /// Move an inactive VS to another core. Migrating to the current home
    /// does nothing, unless the VS is active there and the caller is another core.
    pub fn migrate<E: AxExtension>(&self, ctx: &PerCpuCtx<'_, E>, id: VsId, ppid: PpId) -> MkResult {
        self.check_id(id)?;
        Self::check_pp(ctx, ppid)?;
        let mut slot = self.lock_allocated(id)?;
        if slot.home == ppid && (slot.active.is_none() || slot.home == ctx.ppid()) {
            return Ok(());
        }
        if let Some(pp) = slot.active {
            error!("{} cannot migrate while active on {}", id, pp);
            return Err(MkError::ActiveElsewhere);
        }
        slot.arch()?
            .clear()
            .map_err(|err| hardware("clear", id, err))?;
        debug!("{} migrated from {} to {}", id, slot.home, ppid);
        slot.home = ppid;
        Ok(())
    }

    /// Flush the TLB of a local VS for one page, or for everything with [`TLB_FLUSH_ALL`].
    pub fn tlb_flush<E: AxExtension>(&self, ctx: &PerCpuCtx<'_, E>, id: VsId, addr: u64) -> MkResult {
        let mut slot = self.lock_local(ctx, id)?;
        let addr = decode_gla(addr)?;
        slot.arch()?
            .tlb_flush(addr)
            .map_err(|err| hardware("tlb_flush", id, err))
    }

    /// Flush the TLB of every VS of `vmid` homed on the calling core.
    pub fn tlb_flush_vm<E: AxExtension>(
        &self,
        ctx: &PerCpuCtx<'_, E>,
        vm_pool: &VmPool,
        vmid: VmId,
    ) -> MkResult {
        if !vm_pool.is_allocated(vmid) {
            vm_pool.check_id(vmid)?;
            error!("{} is not allocated", vmid);
            return Err(MkError::Unallocated);
        }
        let failed = self.slots.find_map(|idx, slot| {
            if !slot.allocated || slot.vmid != vmid || slot.home != ctx.ppid() {
                return None;
            }
            let arch = slot.arch.as_mut()?;
            arch.tlb_flush(None)
                .err()
                .map(|err| hardware("tlb_flush", VsId::new(idx as u16), err))
        });
        failed.map_or(Ok(()), Err)
    }

    /// The core a VS is active on, if any.
    pub fn is_active(&self, id: VsId) -> MkResult<Option<PpId>> {
        Ok(self.lock_allocated(id)?.active)
    }

    /// Whether a VS is active on the calling core.
    pub fn is_active_on_this_pp<E: AxExtension>(&self, ctx: &PerCpuCtx<'_, E>, id: VsId) -> MkResult<bool> {
        Ok(self.lock_allocated(id)?.active == Some(ctx.ppid()))
    }

    /// Whether `id` names an allocated VS.
    pub fn is_allocated(&self, id: VsId) -> bool {
        !id.is_invalid()
            && self
                .slots
                .lock(id.as_usize())
                .is_some_and(|slot| slot.allocated)
    }

    /// The VP a VS belongs to.
    pub fn vp_id(&self, id: VsId) -> MkResult<VpId> {
        Ok(self.lock_allocated(id)?.vpid)
    }

    /// The VM a VS belongs to.
    pub fn vm_id(&self, id: VsId) -> MkResult<VmId> {
        Ok(self.lock_allocated(id)?.vmid)
    }

    /// The home core of a VS.
    pub fn home(&self, id: VsId) -> MkResult<PpId> {
        Ok(self.lock_allocated(id)?.home)
    }

    /// Some VS still owned by `vpid`, if there is one.
    pub fn vs_assigned_to_vp(&self, vpid: VpId) -> Option<VsId> {
        self.slots.find_map(|idx, slot| {
            (slot.allocated && slot.vpid == vpid).then(|| VsId::new(idx as u16))
        })
    }

    /// Log the bookkeeping of a VS, and its registers when it is local.
    pub fn dump<E: AxExtension>(&self, ctx: &PerCpuCtx<'_, E>, id: VsId) -> MkResult {
        let slot = self.lock_allocated(id)?;
        info!("{}", id);
        info!("  owner: {} of {}", slot.vpid, slot.vmid);
        info!("  home: {}", slot.home);
        match slot.active {
            Some(pp) => info!("  active on: {}", pp),
            None => info!("  active on: none"),
        }
        if slot.home != ctx.ppid() {
            return Ok(());
        }
        let Some(arch) = slot.arch.as_ref() else {
            info!("  registers: in use by the guest");
            return Ok(());
        };
        for &reg in VsReg::ALL {
            match arch.read(reg) {
                Ok(val) => info!("  {:<45} {:#018x}", reg.name(), val),
                Err(err) => info!("  {:<45} <{:?}>", reg.name(), err),
            }
        }
        Ok(())
    }
}

/// Decode the address argument of a TLB flush: `None` for everything, else a page-aligned GLA.
fn decode_gla(addr: u64) -> MkResult<Option<VirtAddr>> {
    if addr == TLB_FLUSH_ALL {
        return Ok(None);
    }
    let gla = usize::try_from(addr)
        .map(VirtAddr::from_usize)
        .map_err(|_| MkError::InvalidAddress)?;
    if gla.as_usize() == 0 || !gla.is_aligned_4k() {
        error!("{:#x} is not a valid page address", addr);
        return Err(MkError::InvalidAddress);
    }
    Ok(Some(gla))
}
