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

//! The syscall dispatcher.

use crate::arch_vs::AxArchVs;
use crate::debug;
use crate::error::{MkError, MkResult, status};
use crate::ext::AxExtension;
use crate::id::{PpId, VmId, VpId, VsId};
use crate::percpu::PerCpuCtx;
use crate::syscall::{DebugOp, Syscall, VmOp, VpOp, VsOp};
use crate::vm::VmPool;
use crate::vp::VpPool;
use crate::vs::VsPool;

/// Handle the syscall pending in `ctx` and write its status code back.
///
/// The caller must hold an open handle (in `reg0`), the opcode must be
/// known, and VS operations are reserved to the extension registered for
/// VM-exits on this core. Results are returned in `reg0`; the exit reason of
/// a run is left in `ctx.exit_reason`. Nothing happens unless the status is
/// [`status::SUCCESS`].
pub fn dispatch_syscall<E: AxExtension, A: AxArchVs>(
    ctx: &mut PerCpuCtx<'_, E>,
    vm_pool: &VmPool,
    vp_pool: &VpPool,
    vs_pool: &VsPool<A>,
) -> u64 {
    let status = match dispatch(ctx, vm_pool, vp_pool, vs_pool) {
        Ok(()) => status::SUCCESS,
        Err(err) => {
            debug!(
                "syscall {:#018x} on {} failed: {}",
                ctx.ext_syscall,
                ctx.ppid(),
                err
            );
            err.status()
        }
    };
    ctx.status = status;
    status
}

fn dispatch<E: AxExtension, A: AxArchVs>(
    ctx: &mut PerCpuCtx<'_, E>,
    vm_pool: &VmPool,
    vp_pool: &VpPool,
    vs_pool: &VsPool<A>,
) -> MkResult {
    match ctx.ext {
        Some(ext) if ext.is_handle_valid(ctx.reg0) => {}
        Some(ext) => {
            error!("invalid handle {:#x} from extension {}", ctx.reg0, ext.id());
            return Err(MkError::InvalidHandle);
        }
        None => {
            error!("syscall on {} without a calling extension", ctx.ppid());
            return Err(MkError::InvalidHandle);
        }
    }

    let Some(syscall) = Syscall::decode(ctx.ext_syscall) else {
        error!("unknown syscall {:#018x}", ctx.ext_syscall);
        return Err(MkError::UnknownSyscall);
    };
    trace!("{:?} on {}", syscall, ctx.ppid());

    match syscall {
        Syscall::Debug(op) => dispatch_debug(ctx, vm_pool, vp_pool, vs_pool, op),
        Syscall::Vm(op) => dispatch_vm(ctx, vm_pool, vp_pool, vs_pool, op),
        Syscall::Vp(op) => dispatch_vp(ctx, vm_pool, vp_pool, vs_pool, op),
        Syscall::Vs(op) => {
            if !ctx.is_vmexit_ext() {
                error!("{:?} is reserved to the vmexit extension of {}", op, ctx.ppid());
                return Err(MkError::WrongExtension);
            }
            dispatch_vs(ctx, vm_pool, vp_pool, vs_pool, op)
        }
    }
}

fn vmid(reg: u64) -> MkResult<VmId> {
    VmId::from_reg(reg).ok_or_else(|| {
        error!("vm id {:#x} is malformed", reg);
        MkError::InvalidId
    })
}

fn vpid(reg: u64) -> MkResult<VpId> {
    VpId::from_reg(reg).ok_or_else(|| {
        error!("vp id {:#x} is malformed", reg);
        MkError::InvalidId
    })
}

fn vsid(reg: u64) -> MkResult<VsId> {
    VsId::from_reg(reg).ok_or_else(|| {
        error!("vs id {:#x} is malformed", reg);
        MkError::InvalidId
    })
}

fn ppid(reg: u64) -> MkResult<PpId> {
    PpId::from_reg(reg).ok_or_else(|| {
        error!("pp id {:#x} is malformed", reg);
        MkError::InvalidId
    })
}

fn dispatch_debug<E: AxExtension, A: AxArchVs>(
    ctx: &mut PerCpuCtx<'_, E>,
    vm_pool: &VmPool,
    vp_pool: &VpPool,
    vs_pool: &VsPool<A>,
    op: DebugOp,
) -> MkResult {
    match op {
        DebugOp::Out => {
            debug::out(ctx.reg1, ctx.reg2);
            Ok(())
        }
        DebugOp::DumpVm => vm_pool.dump(vmid(ctx.reg1)?),
        DebugOp::DumpVp => vp_pool.dump(vpid(ctx.reg1)?),
        DebugOp::DumpVs => vs_pool.dump(ctx, vsid(ctx.reg1)?),
    }
}

fn dispatch_vm<E: AxExtension, A: AxArchVs>(
    ctx: &mut PerCpuCtx<'_, E>,
    vm_pool: &VmPool,
    vp_pool: &VpPool,
    vs_pool: &VsPool<A>,
    op: VmOp,
) -> MkResult {
    match op {
        VmOp::CreateVm => {
            ctx.reg0 = vm_pool.allocate()?.into();
            Ok(())
        }
        VmOp::DestroyVm => vm_pool.deallocate(vp_pool, vmid(ctx.reg1)?),
        VmOp::TlbFlush => vs_pool.tlb_flush_vm(ctx, vm_pool, vmid(ctx.reg1)?),
    }
}

fn dispatch_vp<E: AxExtension, A: AxArchVs>(
    ctx: &mut PerCpuCtx<'_, E>,
    vm_pool: &VmPool,
    vp_pool: &VpPool,
    vs_pool: &VsPool<A>,
    op: VpOp,
) -> MkResult {
    match op {
        VpOp::CreateVp => {
            ctx.reg0 = vp_pool.allocate(vm_pool, vmid(ctx.reg1)?)?.into();
            Ok(())
        }
        VpOp::DestroyVp => vp_pool.deallocate(vs_pool, vpid(ctx.reg1)?),
    }
}

fn dispatch_vs<E: AxExtension, A: AxArchVs>(
    ctx: &mut PerCpuCtx<'_, E>,
    vm_pool: &VmPool,
    vp_pool: &VpPool,
    vs_pool: &VsPool<A>,
    op: VsOp,
) -> MkResult {
    match op {
        VsOp::CreateVs => {
            let id = vs_pool.allocate(ctx, vp_pool, vpid(ctx.reg1)?, ppid(ctx.reg2)?)?;
            ctx.reg0 = id.into();
            Ok(())
        }
        VsOp::DestroyVs => vs_pool.deallocate(vsid(ctx.reg1)?),
        VsOp::InitAsRoot => vs_pool.init_as_root(ctx, vsid(ctx.reg1)?),
        VsOp::Read => {
            ctx.reg0 = vs_pool.read(ctx, vsid(ctx.reg1)?, ctx.reg2)?;
            Ok(())
        }
        VsOp::Write => vs_pool.write(ctx, vsid(ctx.reg1)?, ctx.reg2, ctx.reg3),
        VsOp::Run => {
            let (vm, vp, vs) = (vmid(ctx.reg1)?, vpid(ctx.reg2)?, vsid(ctx.reg3)?);
            vs_pool.run(ctx, vm_pool, vp_pool, vm, vp, vs).map(drop)
        }
        VsOp::RunCurrent => vs_pool.run_current(ctx).map(drop),
        VsOp::AdvanceIpAndRun => {
            let (vm, vp, vs) = (vmid(ctx.reg1)?, vpid(ctx.reg2)?, vsid(ctx.reg3)?);
            vs_pool
                .advance_ip_and_run(ctx, vm_pool, vp_pool, vm, vp, vs)
                .map(drop)
        }
        VsOp::AdvanceIpAndRunCurrent => vs_pool.advance_ip_and_run_current(ctx).map(drop),
        VsOp::Promote => vs_pool.promote(ctx, vsid(ctx.reg1)?),
        VsOp::Clear => vs_pool.clear(ctx, vsid(ctx.reg1)?),
        VsOp::Migrate => vs_pool.migrate(ctx, vsid(ctx.reg1)?, ppid(ctx.reg2)?),
        VsOp::SetActive => {
            let (vm, vp, vs) = (vmid(ctx.reg1)?, vpid(ctx.reg2)?, vsid(ctx.reg3)?);
            vs_pool.set_active(ctx, vm_pool, vp_pool, vm, vp, vs)
        }
        VsOp::AdvanceIpAndSetActive => {
            let (vm, vp, vs) = (vmid(ctx.reg1)?, vpid(ctx.reg2)?, vsid(ctx.reg3)?);
            vs_pool.advance_ip_and_set_active(ctx, vm_pool, vp_pool, vm, vp, vs)
        }
        VsOp::TlbFlush => vs_pool.tlb_flush(ctx, vsid(ctx.reg1)?, ctx.reg2),
    }
}
