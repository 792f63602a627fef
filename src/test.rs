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

#[cfg(test)]
mod tests {
    use crate::debug::{UNDEFINED_VMCS_FIELD, vmcs_field_name};
    use crate::syscall::{DebugOp, Syscall, VmOp, VpOp, VsOp};
    use crate::{
        AxArchVs, AxExtension, DEFAULT_MAX_PPS, DEFAULT_MAX_VMS, DEFAULT_MAX_VPS, DEFAULT_MAX_VSS,
        ExtId, MkConfig, MkError, PerCpuCtx, PpId, ROOT_VMID,
        TLB_FLUSH_ALL, VmId, VmPool, VpId, VpPool, VsId, VsPool, VsReg, dispatch_syscall, status,
    };
    use alloc::{
        collections::BTreeMap,
        format,
        string::{String, ToString},
        sync::Arc,
        vec::Vec,
    };
    use axerrno::{AxError, AxResult};
    use core::sync::atomic::{AtomicBool, Ordering};
    use memory_addr::VirtAddr;
    use spin::Mutex;

    const EXIT_REASON_VMCALL: u64 = 18;
    const INSTR_LEN: u64 = 3;
    const HNDL: u64 = 0x4242;

    // Shared state of the mock hardware: the call log, the primitives made to
    // fail, and a gate that keeps guests running until it is lowered.
    #[derive(Clone, Default)]
    struct MockHw {
        call_log: Arc<Mutex<Vec<String>>>,
        failing: Arc<Mutex<Vec<(&'static str, u16)>>>,
        hold: Arc<AtomicBool>,
        in_guest: Arc<AtomicBool>,
    }

    impl MockHw {
        fn record(&self, op: &'static str, id: VsId) -> AxResult {
            self.call_log.lock().push(format!("{}({})", op, id.get()));
            if self.failing.lock().contains(&(op, id.get())) {
                Err(AxError::BadState)
            } else {
                Ok(())
            }
        }

        fn fail(&self, op: &'static str, id: VsId) {
            self.failing.lock().push((op, id.get()));
        }

        fn heal(&self) {
            self.failing.lock().clear();
        }

        fn calls(&self) -> Vec<String> {
            self.call_log.lock().clone()
        }

        fn clear_log(&self) {
            self.call_log.lock().clear();
        }

        fn wait_for_exit(&self) {
            if !self.hold.load(Ordering::SeqCst) {
                return;
            }
            self.in_guest.store(true, Ordering::SeqCst);
            while self.hold.load(Ordering::SeqCst) {
                core::hint::spin_loop();
            }
            self.in_guest.store(false, Ordering::SeqCst);
        }
    }

    // Mock architecture implementation for testing
    struct MockArchVs {
        id: VsId,
        regs: BTreeMap<u64, u64>,
        hw: MockHw,
    }

    impl AxArchVs for MockArchVs {
        type CreateConfig = MockHw;

        fn new(vsid: VsId, _ppid: PpId, hw: Self::CreateConfig) -> AxResult<Self> {
            hw.record("new", vsid)?;
            Ok(Self {
                id: vsid,
                regs: BTreeMap::new(),
                hw,
            })
        }

        fn read(&self, reg: VsReg) -> AxResult<u64> {
            self.hw.record("read", self.id)?;
            Ok(self.regs.get(&reg.raw()).copied().unwrap_or(0))
        }

        fn write(&mut self, reg: VsReg, val: u64) -> AxResult {
            self.hw.record("write", self.id)?;
            self.regs.insert(reg.raw(), val);
            Ok(())
        }

        fn load(&mut self) -> AxResult {
            self.hw.record("load", self.id)
        }

        fn unload(&mut self) -> AxResult {
            self.hw.record("unload", self.id)
        }

        fn run(&mut self) -> AxResult<u64> {
            self.hw.record("run", self.id)?;
            self.hw.wait_for_exit();
            Ok(EXIT_REASON_VMCALL)
        }

        fn advance_ip(&mut self) -> AxResult {
            self.hw.record("advance_ip", self.id)?;
            *self.regs.entry(VsReg::GuestRip.raw()).or_insert(0) += INSTR_LEN;
            Ok(())
        }

        fn promote(&mut self) -> AxResult {
            self.hw.record("promote", self.id)
        }

        fn clear(&mut self) -> AxResult {
            self.hw.record("clear", self.id)
        }

        fn init_as_root(&mut self) -> AxResult {
            self.hw.record("init_as_root", self.id)
        }

        fn tlb_flush(&mut self, _addr: Option<VirtAddr>) -> AxResult {
            self.hw.record("tlb_flush", self.id)
        }
    }

    struct MockExt {
        id: ExtId,
    }

    impl AxExtension for MockExt {
        fn id(&self) -> ExtId {
            self.id
        }

        fn is_handle_valid(&self, hndl: u64) -> bool {
            hndl == HNDL
        }
    }

    static VMEXIT_EXT: MockExt = MockExt { id: 0 };
    static OTHER_EXT: MockExt = MockExt { id: 1 };

    struct Fixture {
        vm_pool: VmPool,
        vp_pool: VpPool,
        vs_pool: VsPool<MockArchVs>,
        hw: MockHw,
    }

    fn create_fixture(config: MkConfig) -> Fixture {
        config.validate().unwrap();
        let hw = MockHw::default();
        Fixture {
            vm_pool: VmPool::new(&config),
            vp_pool: VpPool::new(&config),
            vs_pool: VsPool::new(&config, hw.clone()),
            hw,
        }
    }

    fn create_ctx(pp: u16, online: u16) -> PerCpuCtx<'static, MockExt> {
        let mut ctx = PerCpuCtx::new(PpId::new(pp), online).unwrap();
        ctx.set_vmexit_ext(Some(&VMEXIT_EXT));
        ctx
    }

    // Creates a VM, a VP and a VS homed on `home`.
    fn create_guest(
        f: &Fixture,
        ctx: &PerCpuCtx<'_, MockExt>,
        home: u16,
    ) -> (VmId, VpId, VsId) {
        let vm = f.vm_pool.allocate().unwrap();
        let vp = f.vp_pool.allocate(&f.vm_pool, vm).unwrap();
        let vs = f
            .vs_pool
            .allocate(ctx, &f.vp_pool, vp, PpId::new(home))
            .unwrap();
        (vm, vp, vs)
    }

    fn run(
        f: &Fixture,
        ctx: &mut PerCpuCtx<'_, MockExt>,
        (vm, vp, vs): (VmId, VpId, VsId),
    ) -> Result<u64, MkError> {
        f.vs_pool.run(ctx, &f.vm_pool, &f.vp_pool, vm, vp, vs)
    }

    fn syscall(
        f: &Fixture,
        ctx: &mut PerCpuCtx<'static, MockExt>,
        ext: &'static MockExt,
        op: Syscall,
        args: [u64; 3],
    ) -> u64 {
        ctx.set_syscall(Some(ext), op.opcode(), [HNDL, args[0], args[1], args[2]]);
        dispatch_syscall(ctx, &f.vm_pool, &f.vp_pool, &f.vs_pool)
    }

    #[test]
    fn test_config_validation() {
        assert!(MkConfig::default().validate().is_ok());
        assert!(MkConfig::default().with_max_vss(0).validate().is_err());
        assert!(MkConfig::default().with_max_vps(0x1_0000).validate().is_err());
        assert!(MkConfig::default().with_max_vms(0xFFFF).validate().is_ok());

        assert!(PerCpuCtx::<MockExt>::new(PpId::new(1), 2).is_ok());
        assert!(PerCpuCtx::<MockExt>::new(PpId::new(2), 2).is_err());
        assert!(PerCpuCtx::<MockExt>::new(PpId::INVALID, 2).is_err());
    }

    #[test]
    fn test_root_vm_is_preallocated() {
        let f = create_fixture(MkConfig::default());
        assert_eq!(f.vm_pool.capacity(), DEFAULT_MAX_VMS);
        assert_eq!(f.vm_pool.max_pps(), DEFAULT_MAX_PPS);
        assert_eq!(f.vp_pool.capacity(), DEFAULT_MAX_VPS);
        assert_eq!(f.vs_pool.capacity(), DEFAULT_MAX_VSS);
        assert!(f.vm_pool.is_allocated(ROOT_VMID));
        assert_eq!(f.vm_pool.allocate().unwrap(), VmId::new(1));
        assert_eq!(
            f.vm_pool.deallocate(&f.vp_pool, ROOT_VMID),
            Err(MkError::InvalidId)
        );
        assert!(f.vm_pool.is_allocated(ROOT_VMID));
    }

    #[test]
    fn test_run_twice_takes_fast_path() {
        let f = create_fixture(MkConfig::default());
        let mut ctx = create_ctx(0, 1);
        let guest = create_guest(&f, &ctx, 0);

        assert_eq!(run(&f, &mut ctx, guest), Ok(EXIT_REASON_VMCALL));
        assert_eq!(ctx.exit_reason, EXIT_REASON_VMCALL);
        assert_eq!(f.hw.calls(), ["new(0)", "load(0)", "run(0)"]);

        // Same triple again: no validation, no reload
        f.hw.clear_log();
        assert_eq!(run(&f, &mut ctx, guest), Ok(EXIT_REASON_VMCALL));
        assert_eq!(f.hw.calls(), ["run(0)"]);

        let triple = ctx.active_triple().unwrap();
        assert_eq!((triple.vmid, triple.vpid, triple.vsid), guest);
        assert_eq!(f.vm_pool.is_active(guest.0), Ok(Some(PpId::new(0))));
        assert_eq!(f.vp_pool.is_active(guest.1), Ok(Some(PpId::new(0))));
        assert_eq!(f.vs_pool.is_active(guest.2), Ok(Some(PpId::new(0))));
        assert_eq!(f.vs_pool.is_active_on_this_pp(&ctx, guest.2), Ok(true));
    }

    #[test]
    fn test_invalid_ids_are_rejected() {
        let f = create_fixture(MkConfig::default().with_max_vms(4).with_max_vps(4).with_max_vss(4));
        let ctx = create_ctx(0, 1);

        for vm in [VmId::INVALID, VmId::new(4), VmId::new(3)] {
            assert!(f.vm_pool.deallocate(&f.vp_pool, vm).unwrap_err().is_id_class());
            assert!(f.vm_pool.is_active(vm).unwrap_err().is_id_class());
            assert!(f.vm_pool.dump(vm).unwrap_err().is_id_class());
            assert!(f.vp_pool.allocate(&f.vm_pool, vm).unwrap_err().is_id_class());
            assert!(!f.vm_pool.is_allocated(vm));
        }
        assert_eq!(f.vm_pool.is_active(VmId::new(3)), Err(MkError::Unallocated));

        for vp in [VpId::INVALID, VpId::new(4), VpId::new(0)] {
            assert!(f.vp_pool.deallocate(&f.vs_pool, vp).unwrap_err().is_id_class());
            assert!(f.vp_pool.vm_id(vp).unwrap_err().is_id_class());
            assert!(
                f.vs_pool
                    .allocate(&ctx, &f.vp_pool, vp, PpId::new(0))
                    .unwrap_err()
                    .is_id_class()
            );
        }

        for vs in [VsId::INVALID, VsId::new(4), VsId::new(0)] {
            assert!(f.vs_pool.deallocate(vs).unwrap_err().is_id_class());
            assert!(f.vs_pool.read(&ctx, vs, VsReg::Rax.raw()).unwrap_err().is_id_class());
            assert!(f.vs_pool.write(&ctx, vs, VsReg::Rax.raw(), 1).unwrap_err().is_id_class());
            assert!(f.vs_pool.promote(&ctx, vs).unwrap_err().is_id_class());
            assert!(f.vs_pool.clear(&ctx, vs).unwrap_err().is_id_class());
            assert!(f.vs_pool.init_as_root(&ctx, vs).unwrap_err().is_id_class());
            assert!(f.vs_pool.migrate(&ctx, vs, PpId::new(0)).unwrap_err().is_id_class());
            assert!(f.vs_pool.tlb_flush(&ctx, vs, TLB_FLUSH_ALL).unwrap_err().is_id_class());
            assert!(f.vs_pool.is_active(vs).unwrap_err().is_id_class());
        }
        assert_eq!(f.vs_pool.deallocate(VsId::INVALID), Err(MkError::InvalidId));
        assert_eq!(f.vs_pool.deallocate(VsId::new(0)), Err(MkError::Unallocated));
        assert!(f.hw.calls().is_empty());
    }

    #[test]
    fn test_run_with_invalid_ids() {
        let f = create_fixture(MkConfig::default().with_max_vss(4));
        let mut ctx = create_ctx(0, 1);
        let (vm, vp, vs) = create_guest(&f, &ctx, 0);

        assert_eq!(run(&f, &mut ctx, (VmId::INVALID, vp, vs)), Err(MkError::InvalidId));
        assert_eq!(run(&f, &mut ctx, (vm, VpId::INVALID, vs)), Err(MkError::InvalidId));
        assert_eq!(run(&f, &mut ctx, (vm, vp, VsId::new(4))), Err(MkError::InvalidId));
        assert_eq!(run(&f, &mut ctx, (vm, vp, VsId::new(3))), Err(MkError::Unallocated));
        assert!(ctx.active_triple().is_none());
    }

    #[test]
    fn test_vs_pool_exhaustion() {
        let f = create_fixture(MkConfig::default().with_max_vss(2));
        let ctx = create_ctx(0, 1);
        let vm = f.vm_pool.allocate().unwrap();
        let vp = f.vp_pool.allocate(&f.vm_pool, vm).unwrap();

        assert_eq!(f.vs_pool.allocate(&ctx, &f.vp_pool, vp, PpId::new(0)), Ok(VsId::new(0)));
        assert_eq!(f.vs_pool.allocate(&ctx, &f.vp_pool, vp, PpId::new(0)), Ok(VsId::new(1)));
        assert_eq!(
            f.vs_pool.allocate(&ctx, &f.vp_pool, vp, PpId::new(0)),
            Err(MkError::ResourceExhausted)
        );

        // A freed slot is handed out again
        f.vs_pool.deallocate(VsId::new(0)).unwrap();
        assert_eq!(f.vs_pool.allocate(&ctx, &f.vp_pool, vp, PpId::new(0)), Ok(VsId::new(0)));
    }

    #[test]
    fn test_vs_allocation_checks_home() {
        let f = create_fixture(MkConfig::default());
        let ctx = create_ctx(0, 2);
        let vm = f.vm_pool.allocate().unwrap();
        let vp = f.vp_pool.allocate(&f.vm_pool, vm).unwrap();

        assert_eq!(
            f.vs_pool.allocate(&ctx, &f.vp_pool, vp, PpId::INVALID),
            Err(MkError::InvalidId)
        );
        assert_eq!(
            f.vs_pool.allocate(&ctx, &f.vp_pool, vp, PpId::new(2)),
            Err(MkError::OutOfRange)
        );

        // Creation failure in hardware leaves the slot free
        f.hw.fail("new", VsId::new(0));
        assert_eq!(
            f.vs_pool.allocate(&ctx, &f.vp_pool, vp, PpId::new(1)),
            Err(MkError::HardwareFailure)
        );
        assert!(!f.vs_pool.is_allocated(VsId::new(0)));
        f.hw.heal();

        let vs = f.vs_pool.allocate(&ctx, &f.vp_pool, vp, PpId::new(1)).unwrap();
        assert_eq!(f.vs_pool.home(vs), Ok(PpId::new(1)));
        assert_eq!(f.vs_pool.vp_id(vs), Ok(vp));
        assert_eq!(f.vs_pool.vm_id(vs), Ok(vm));
    }

    #[test]
    fn test_deallocate_while_active() {
        let f = create_fixture(MkConfig::default());
        let mut ctx = create_ctx(0, 1);
        let (vm, vp, vs) = create_guest(&f, &ctx, 0);
        run(&f, &mut ctx, (vm, vp, vs)).unwrap();

        assert_eq!(f.vs_pool.deallocate(vs), Err(MkError::StillActive));
        assert_eq!(f.vp_pool.deallocate(&f.vs_pool, vp), Err(MkError::StillActive));
        assert_eq!(f.vm_pool.deallocate(&f.vp_pool, vm), Err(MkError::StillActive));

        f.vs_pool.deactivate(&mut ctx, &f.vm_pool, &f.vp_pool).unwrap();
        assert!(ctx.active_triple().is_none());
        assert_eq!(f.vs_pool.is_active(vs), Ok(None));

        // Children must go first
        assert_eq!(f.vm_pool.deallocate(&f.vp_pool, vm), Err(MkError::StillAssigned));
        assert_eq!(f.vp_pool.deallocate(&f.vs_pool, vp), Err(MkError::StillAssigned));

        assert_eq!(f.vs_pool.deallocate(vs), Ok(()));
        assert_eq!(f.vp_pool.deallocate(&f.vs_pool, vp), Ok(()));
        assert_eq!(f.vm_pool.deallocate(&f.vp_pool, vm), Ok(()));
        assert!(!f.vm_pool.is_allocated(vm));
    }

    #[test]
    fn test_deallocate_while_active_remotely() {
        let f = create_fixture(MkConfig::default());
        let mut ctx0 = create_ctx(0, 2);
        let ctx1 = create_ctx(1, 2);
        let (vm, vp, vs) = create_guest(&f, &ctx0, 0);
        run(&f, &mut ctx0, (vm, vp, vs)).unwrap();

        assert_eq!(f.vs_pool.is_active_on_this_pp(&ctx1, vs), Ok(false));
        assert_eq!(f.vs_pool.deallocate(vs), Err(MkError::StillActive));
    }

    #[test]
    fn test_migrate() {
        let f = create_fixture(MkConfig::default());
        let mut ctx0 = create_ctx(0, 2);
        let mut ctx1 = create_ctx(1, 2);
        let guest = create_guest(&f, &ctx0, 0);
        let vs = guest.2;
        run(&f, &mut ctx0, guest).unwrap();

        // Migrating to the current home is a no-op, even while active
        assert_eq!(f.vs_pool.migrate(&ctx0, vs, PpId::new(0)), Ok(()));
        // but not when asked from another core while active there
        assert_eq!(f.vs_pool.migrate(&ctx1, vs, PpId::new(0)), Err(MkError::ActiveElsewhere));

        assert_eq!(f.vs_pool.migrate(&ctx1, vs, PpId::new(1)), Err(MkError::ActiveElsewhere));
        assert_eq!(f.vs_pool.migrate(&ctx0, vs, PpId::new(1)), Err(MkError::ActiveElsewhere));
        assert_eq!(f.vs_pool.migrate(&ctx1, vs, PpId::new(2)), Err(MkError::OutOfRange));
        assert_eq!(f.vs_pool.migrate(&ctx1, vs, PpId::INVALID), Err(MkError::InvalidId));

        f.vs_pool.deactivate(&mut ctx0, &f.vm_pool, &f.vp_pool).unwrap();
        f.hw.clear_log();
        assert_eq!(f.vs_pool.migrate(&ctx1, vs, PpId::new(1)), Ok(()));
        assert_eq!(f.hw.calls(), ["clear(0)"]);
        assert_eq!(f.vs_pool.home(vs), Ok(PpId::new(1)));

        assert_eq!(run(&f, &mut ctx1, guest), Ok(EXIT_REASON_VMCALL));
        assert_eq!(run(&f, &mut ctx0, guest), Err(MkError::NonLocal));
        assert!(ctx0.active_triple().is_none());
    }

    #[test]
    fn test_run_on_non_home_core() {
        let f = create_fixture(MkConfig::default());
        let mut ctx0 = create_ctx(0, 2);
        let mut ctx1 = create_ctx(1, 2);
        let guest = create_guest(&f, &ctx0, 0);

        assert_eq!(run(&f, &mut ctx1, guest), Err(MkError::NonLocal));
        assert!(ctx1.active_triple().is_none());
        assert_eq!(f.vm_pool.is_active(guest.0), Ok(None));

        assert_eq!(run(&f, &mut ctx0, guest), Ok(EXIT_REASON_VMCALL));
    }

    #[test]
    fn test_run_with_wrong_owner() {
        let f = create_fixture(MkConfig::default());
        let mut ctx = create_ctx(0, 1);
        let (vm_a, vp_a, vs_a) = create_guest(&f, &ctx, 0);
        let (vm_b, vp_b, vs_b) = create_guest(&f, &ctx, 0);

        assert_eq!(run(&f, &mut ctx, (vm_b, vp_a, vs_a)), Err(MkError::WrongOwner));
        assert_eq!(run(&f, &mut ctx, (vm_a, vp_a, vs_b)), Err(MkError::WrongOwner));
        assert_eq!(f.vp_pool.vm_id(vp_b), Ok(vm_b));
        assert!(ctx.active_triple().is_none());
        assert_eq!(f.hw.calls(), ["new(0)", "new(1)"]);
    }

    #[test]
    fn test_vp_active_on_another_core() {
        let f = create_fixture(MkConfig::default());
        let mut ctx0 = create_ctx(0, 2);
        let mut ctx1 = create_ctx(1, 2);
        let (vm, vp, vs0) = create_guest(&f, &ctx0, 0);
        let vs1 = f.vs_pool.allocate(&ctx1, &f.vp_pool, vp, PpId::new(1)).unwrap();

        run(&f, &mut ctx0, (vm, vp, vs0)).unwrap();
        assert_eq!(run(&f, &mut ctx1, (vm, vp, vs1)), Err(MkError::ActiveElsewhere));

        // A VM may be active on several cores
        let vp1 = f.vp_pool.allocate(&f.vm_pool, vm).unwrap();
        let vs2 = f.vs_pool.allocate(&ctx1, &f.vp_pool, vp1, PpId::new(1)).unwrap();
        run(&f, &mut ctx1, (vm, vp1, vs2)).unwrap();
        assert!(f.vm_pool.is_active_on_this_pp(&ctx0, vm).unwrap());
        assert!(f.vm_pool.is_active_on_this_pp(&ctx1, vm).unwrap());
    }

    #[test]
    fn test_switching_triples() {
        let f = create_fixture(MkConfig::default());
        let mut ctx = create_ctx(0, 1);
        let a = create_guest(&f, &ctx, 0);
        let b = create_guest(&f, &ctx, 0);

        run(&f, &mut ctx, a).unwrap();
        f.hw.clear_log();
        run(&f, &mut ctx, b).unwrap();
        assert_eq!(f.hw.calls(), ["unload(0)", "load(1)", "run(1)"]);

        assert_eq!(f.vm_pool.is_active(a.0), Ok(None));
        assert_eq!(f.vp_pool.is_active(a.1), Ok(None));
        assert_eq!(f.vs_pool.is_active(a.2), Ok(None));
        assert_eq!(f.vs_pool.is_active(b.2), Ok(Some(PpId::new(0))));
    }

    #[test]
    fn test_failed_switch_rolls_back() {
        let f = create_fixture(MkConfig::default());
        let mut ctx = create_ctx(0, 1);
        let a = create_guest(&f, &ctx, 0);
        let b = create_guest(&f, &ctx, 0);
        run(&f, &mut ctx, a).unwrap();

        f.hw.fail("load", b.2);
        f.hw.clear_log();
        assert_eq!(run(&f, &mut ctx, b), Err(MkError::HardwareFailure));
        assert_eq!(f.hw.calls(), ["unload(0)", "load(1)", "load(0)"]);

        let triple = ctx.active_triple().unwrap();
        assert_eq!((triple.vmid, triple.vpid, triple.vsid), a);
        assert_eq!(f.vs_pool.is_active(a.2), Ok(Some(PpId::new(0))));
        assert_eq!(f.vs_pool.is_active(b.2), Ok(None));
        assert_eq!(f.vp_pool.is_active(b.1), Ok(None));
        assert_eq!(f.vm_pool.is_active(b.0), Ok(None));

        // Advancing the IP fails after the new VS was loaded
        f.hw.heal();
        f.hw.fail("advance_ip", b.2);
        f.hw.clear_log();
        assert_eq!(
            f.vs_pool
                .advance_ip_and_set_active(&mut ctx, &f.vm_pool, &f.vp_pool, b.0, b.1, b.2),
            Err(MkError::HardwareFailure)
        );
        assert_eq!(
            f.hw.calls(),
            ["unload(0)", "load(1)", "advance_ip(1)", "unload(1)", "load(0)"]
        );
        assert_eq!(ctx.active_vsid(), a.2);
    }

    #[test]
    fn test_run_current() {
        let f = create_fixture(MkConfig::default());
        let mut ctx = create_ctx(0, 1);
        let (vm, vp, vs) = create_guest(&f, &ctx, 0);

        assert_eq!(f.vs_pool.run_current(&mut ctx), Err(MkError::NotActive));
        assert_eq!(
            f.vs_pool.advance_ip_and_run_current(&mut ctx),
            Err(MkError::NotActive)
        );

        f.vs_pool
            .set_active(&mut ctx, &f.vm_pool, &f.vp_pool, vm, vp, vs)
            .unwrap();
        assert_eq!(f.hw.calls(), ["new(0)", "load(0)"]);

        assert_eq!(f.vs_pool.run_current(&mut ctx), Ok(EXIT_REASON_VMCALL));
        assert_eq!(f.vs_pool.advance_ip_and_run_current(&mut ctx), Ok(EXIT_REASON_VMCALL));
        assert_eq!(
            f.vs_pool
                .advance_ip_and_run(&mut ctx, &f.vm_pool, &f.vp_pool, vm, vp, vs),
            Ok(EXIT_REASON_VMCALL)
        );
        assert_eq!(
            f.vs_pool.read(&ctx, vs, VsReg::GuestRip.raw()),
            Ok(2 * INSTR_LEN)
        );
    }

    #[test]
    fn test_failed_vm_entry() {
        let f = create_fixture(MkConfig::default());
        let mut ctx = create_ctx(0, 1);
        let a = create_guest(&f, &ctx, 0);
        let b = create_guest(&f, &ctx, 0);

        // Nothing was active before, so the core is left idle
        f.hw.fail("run", a.2);
        assert_eq!(run(&f, &mut ctx, a), Err(MkError::HardwareFailure));
        assert!(ctx.active_triple().is_none());
        assert_eq!(f.vm_pool.is_active(a.0), Ok(None));
        assert_eq!(f.vp_pool.is_active(a.1), Ok(None));
        assert_eq!(f.vs_pool.is_active(a.2), Ok(None));

        f.hw.heal();
        run(&f, &mut ctx, a).unwrap();
        f.vs_pool
            .write(&ctx, a.2, VsReg::GuestRip.raw(), 0x1000)
            .unwrap();

        // The replaced triple is switched back in and the IP is restored
        f.hw.fail("run", b.2);
        f.hw.clear_log();
        assert_eq!(
            f.vs_pool
                .advance_ip_and_run(&mut ctx, &f.vm_pool, &f.vp_pool, b.0, b.1, b.2),
            Err(MkError::HardwareFailure)
        );
        assert_eq!(
            f.hw.calls(),
            [
                "unload(0)",
                "load(1)",
                "read(1)",
                "advance_ip(1)",
                "run(1)",
                "write(1)",
                "unload(1)",
                "load(0)"
            ]
        );
        let triple = ctx.active_triple().unwrap();
        assert_eq!((triple.vmid, triple.vpid, triple.vsid), a);
        assert_eq!(f.vm_pool.is_active(a.0), Ok(Some(PpId::new(0))));
        assert_eq!(f.vp_pool.is_active(a.1), Ok(Some(PpId::new(0))));
        assert_eq!(f.vs_pool.is_active(a.2), Ok(Some(PpId::new(0))));
        assert_eq!(f.vm_pool.is_active(b.0), Ok(None));
        assert_eq!(f.vp_pool.is_active(b.1), Ok(None));
        assert_eq!(f.vs_pool.is_active(b.2), Ok(None));
        assert_eq!(f.vs_pool.read(&ctx, b.2, VsReg::GuestRip.raw()), Ok(0));

        // Already active: only the IP has to be put back
        f.hw.heal();
        f.hw.fail("run", a.2);
        assert_eq!(
            f.vs_pool.advance_ip_and_run_current(&mut ctx),
            Err(MkError::HardwareFailure)
        );
        assert_eq!(ctx.active_vsid(), a.2);
        assert_eq!(f.vs_pool.read(&ctx, a.2, VsReg::GuestRip.raw()), Ok(0x1000));

        f.hw.heal();
        assert_eq!(f.vs_pool.run_current(&mut ctx), Ok(EXIT_REASON_VMCALL));
    }

    #[test]
    fn test_guest_runs_unlocked() {
        let f = create_fixture(MkConfig::default());
        let ctx0 = create_ctx(0, 2);
        let ctx1 = create_ctx(1, 2);
        let guest = create_guest(&f, &ctx0, 0);
        let idle_vp = f.vp_pool.allocate(&f.vm_pool, guest.0).unwrap();
        f.hw.hold.store(true, Ordering::SeqCst);

        std::thread::scope(|s| {
            let f = &f;
            let core0 = s.spawn(move || {
                let mut ctx0 = ctx0;
                run(f, &mut ctx0, guest)
            });
            while !f.hw.in_guest.load(Ordering::SeqCst) {
                core::hint::spin_loop();
            }

            // Core 1 works on the tables while core 0 is in the guest
            let destroyed = f.vp_pool.deallocate(&f.vs_pool, idle_vp);
            let assigned = f.vs_pool.vs_assigned_to_vp(guest.1);
            let destroy_running = f.vs_pool.deallocate(guest.2);
            let migrate_running = f.vs_pool.migrate(&ctx1, guest.2, PpId::new(1));
            let remote_read = f.vs_pool.read(&ctx1, guest.2, VsReg::GuestRip.raw());
            let dumped = f.vs_pool.dump(&ctx1, guest.2);
            let flushed = f.vs_pool.tlb_flush_vm(&ctx1, &f.vm_pool, guest.0);
            let still_in_guest = f.hw.in_guest.load(Ordering::SeqCst);
            f.hw.hold.store(false, Ordering::SeqCst);

            assert_eq!(core0.join().unwrap(), Ok(EXIT_REASON_VMCALL));
            assert!(still_in_guest);
            assert_eq!(destroyed, Ok(()));
            assert_eq!(assigned, Some(guest.2));
            assert_eq!(destroy_running, Err(MkError::StillActive));
            assert_eq!(migrate_running, Err(MkError::ActiveElsewhere));
            assert_eq!(remote_read, Err(MkError::NonLocal));
            assert_eq!(dumped, Ok(()));
            assert_eq!(flushed, Ok(()));
        });

        assert!(!f.vp_pool.is_allocated(idle_vp));
        assert_eq!(f.vs_pool.is_active(guest.2), Ok(Some(PpId::new(0))));
        let ctx0 = create_ctx(0, 2);
        assert_eq!(f.vs_pool.dump(&ctx0, guest.2), Ok(()));
    }

    #[test]
    fn test_init_as_root() {
        let f = create_fixture(MkConfig::default());
        let ctx0 = create_ctx(0, 2);
        let ctx1 = create_ctx(1, 2);
        let (_, vp, vs0) = create_guest(&f, &ctx0, 0);
        let vs1 = f.vs_pool.allocate(&ctx0, &f.vp_pool, vp, PpId::new(0)).unwrap();
        assert_eq!((vs0, vs1), (VsId::new(0), VsId::new(1)));

        assert_eq!(f.vs_pool.init_as_root(&ctx1, vs0), Err(MkError::NonLocal));
        assert_eq!(f.vs_pool.init_as_root(&ctx0, vs1), Err(MkError::NotRoot));
        assert_eq!(f.vs_pool.init_as_root(&ctx0, vs0), Ok(()));
        assert_eq!(f.hw.calls().last().map(String::as_str), Some("init_as_root(0)"));
    }

    #[test]
    fn test_promote_and_clear_are_local() {
        let f = create_fixture(MkConfig::default());
        let ctx0 = create_ctx(0, 2);
        let ctx1 = create_ctx(1, 2);
        let (_, _, vs) = create_guest(&f, &ctx0, 0);

        assert_eq!(f.vs_pool.promote(&ctx1, vs), Err(MkError::NonLocal));
        assert_eq!(f.vs_pool.clear(&ctx1, vs), Err(MkError::NonLocal));
        assert_eq!(f.vs_pool.clear(&ctx0, vs), Ok(()));
        assert_eq!(f.vs_pool.promote(&ctx0, vs), Ok(()));
        assert_eq!(f.hw.calls(), ["new(0)", "clear(0)", "promote(0)"]);
    }

    #[test]
    fn test_register_access() {
        let f = create_fixture(MkConfig::default());
        let ctx0 = create_ctx(0, 2);
        let ctx1 = create_ctx(1, 2);
        let (_, _, vs) = create_guest(&f, &ctx0, 0);

        for raw in [VsReg::Invalid.raw(), 1000, u64::MAX] {
            assert_eq!(f.vs_pool.read(&ctx0, vs, raw), Err(MkError::InvalidRegister));
            assert_eq!(f.vs_pool.write(&ctx0, vs, raw, 1), Err(MkError::InvalidRegister));
        }
        assert_eq!(
            f.vs_pool.read(&ctx0, vs, VsReg::Unsupported.raw()),
            Err(MkError::UnsupportedRegister)
        );
        assert_eq!(
            f.vs_pool.write(&ctx0, vs, VsReg::Unsupported.raw(), 1),
            Err(MkError::UnsupportedRegister)
        );

        assert_eq!(f.vs_pool.write(&ctx0, vs, VsReg::Rax.raw(), 0xdead_beef), Ok(()));
        assert_eq!(f.vs_pool.read(&ctx0, vs, VsReg::Rax.raw()), Ok(0xdead_beef));
        assert_eq!(f.vs_pool.read(&ctx1, vs, VsReg::Rax.raw()), Err(MkError::NonLocal));

        f.hw.fail("read", vs);
        assert_eq!(
            f.vs_pool.read(&ctx0, vs, VsReg::Rax.raw()),
            Err(MkError::HardwareFailure)
        );
        f.hw.fail("write", vs);
        assert_eq!(
            f.vs_pool.write(&ctx0, vs, VsReg::Rax.raw(), 1),
            Err(MkError::HardwareFailure)
        );
    }

    #[test]
    fn test_register_selectors() {
        assert_eq!(VsReg::decode(1), Ok(VsReg::Rax));
        assert_eq!(VsReg::decode(152), Ok(VsReg::GuestRip));
        assert_eq!(VsReg::decode(156), Ok(VsReg::GuestSysenterEip));
        assert_eq!(VsReg::decode(157), Err(MkError::InvalidRegister));
        assert_eq!(VsReg::decode(0), Err(MkError::UnsupportedRegister));
        assert_eq!(VsReg::ALL.len(), 156);
        assert_eq!(VsReg::GuestRip.name(), "GuestRip");
    }

    #[test]
    fn test_tlb_flush() {
        let f = create_fixture(MkConfig::default());
        let ctx0 = create_ctx(0, 2);
        let ctx1 = create_ctx(1, 2);
        let (vm, vp, vs) = create_guest(&f, &ctx0, 0);
        let remote = f.vs_pool.allocate(&ctx0, &f.vp_pool, vp, PpId::new(1)).unwrap();

        assert_eq!(f.vs_pool.tlb_flush(&ctx0, vs, TLB_FLUSH_ALL), Ok(()));
        assert_eq!(f.vs_pool.tlb_flush(&ctx0, vs, 0x2000), Ok(()));
        assert_eq!(f.vs_pool.tlb_flush(&ctx0, vs, 0), Err(MkError::InvalidAddress));
        assert_eq!(f.vs_pool.tlb_flush(&ctx0, vs, 0x2001), Err(MkError::InvalidAddress));
        assert_eq!(f.vs_pool.tlb_flush(&ctx1, vs, 0x2000), Err(MkError::NonLocal));

        f.hw.clear_log();
        assert_eq!(f.vs_pool.tlb_flush_vm(&ctx1, &f.vm_pool, vm), Ok(()));
        assert_eq!(f.hw.calls(), [format!("tlb_flush({})", remote.get())]);
        assert_eq!(
            f.vs_pool.tlb_flush_vm(&ctx1, &f.vm_pool, VmId::new(7)),
            Err(MkError::Unallocated)
        );
    }

    #[test]
    fn test_vm_and_vp_activation() {
        let f = create_fixture(MkConfig::default());
        let mut ctx = create_ctx(0, 1);
        let (vm, vp, _) = create_guest(&f, &ctx, 0);
        let other = f.vm_pool.allocate().unwrap();

        // Created -> active -> inactive
        assert_eq!(f.vp_pool.set_active(&mut ctx, vp), Err(MkError::NotActive));
        assert_eq!(f.vm_pool.set_active(&mut ctx, vm), Ok(()));
        assert_eq!(f.vm_pool.set_active(&mut ctx, vm), Err(MkError::ActiveElsewhere));
        assert_eq!(f.vm_pool.set_active(&mut ctx, other), Err(MkError::ActiveElsewhere));
        assert_eq!(f.vp_pool.set_active(&mut ctx, vp), Ok(()));
        assert_eq!(f.vp_pool.is_active_on_this_pp(&ctx, vp), Ok(true));

        assert_eq!(f.vm_pool.set_inactive(&mut ctx, other), Err(MkError::NotActive));
        // The VM stays active while its VP is
        assert_eq!(f.vm_pool.set_inactive(&mut ctx, vm), Err(MkError::StillActive));
        assert_eq!(f.vm_pool.is_active(vm), Ok(Some(PpId::new(0))));
        assert_eq!(f.vp_pool.set_inactive(&mut ctx, vp), Ok(()));
        assert_eq!(f.vp_pool.set_inactive(&mut ctx, vp), Err(MkError::NotActive));
        assert_eq!(f.vm_pool.set_inactive(&mut ctx, vm), Ok(()));
        assert_eq!(f.vm_pool.is_active(vm), Ok(None));
        assert_eq!(ctx.active_vmid(), VmId::INVALID);
    }

    #[test]
    fn test_deactivation_follows_ownership() {
        let f = create_fixture(MkConfig::default());
        let mut ctx = create_ctx(0, 1);
        let (vm, vp, vs) = create_guest(&f, &ctx, 0);
        f.vs_pool
            .set_active(&mut ctx, &f.vm_pool, &f.vp_pool, vm, vp, vs)
            .unwrap();

        // Neither the VM nor the VP can go while the VS is active
        assert_eq!(f.vp_pool.set_inactive(&mut ctx, vp), Err(MkError::StillActive));
        assert_eq!(f.vm_pool.set_inactive(&mut ctx, vm), Err(MkError::StillActive));
        assert_eq!(f.vp_pool.is_active(vp), Ok(Some(PpId::new(0))));
        assert_eq!(f.vm_pool.is_active(vm), Ok(Some(PpId::new(0))));
        assert_eq!(ctx.active_vpid(), vp);

        f.vs_pool.deactivate(&mut ctx, &f.vm_pool, &f.vp_pool).unwrap();
        assert_eq!(f.vp_pool.set_inactive(&mut ctx, vp), Err(MkError::NotActive));
        assert_eq!(f.vm_pool.set_inactive(&mut ctx, vm), Err(MkError::NotActive));
        assert!(ctx.active_triple().is_none());
    }

    #[test]
    fn test_dispatch_rejects_bad_callers() {
        let f = create_fixture(MkConfig::default());
        let mut ctx = create_ctx(0, 1);
        let create_vm = Syscall::Vm(VmOp::CreateVm);

        ctx.set_syscall(Some(&VMEXIT_EXT), create_vm.opcode(), [0, 0, 0, 0]);
        let ret = dispatch_syscall(&mut ctx, &f.vm_pool, &f.vp_pool, &f.vs_pool);
        assert_eq!(ret, status::FAILURE_INVALID_HANDLE);
        assert_eq!(ctx.status, status::FAILURE_INVALID_HANDLE);

        ctx.set_syscall(None, create_vm.opcode(), [HNDL, 0, 0, 0]);
        let ret = dispatch_syscall(&mut ctx, &f.vm_pool, &f.vp_pool, &f.vs_pool);
        assert_eq!(ret, status::FAILURE_INVALID_HANDLE);

        // The handle is checked before the opcode
        ctx.set_syscall(Some(&VMEXIT_EXT), 0x1234, [0, 0, 0, 0]);
        let ret = dispatch_syscall(&mut ctx, &f.vm_pool, &f.vp_pool, &f.vs_pool);
        assert_eq!(ret, status::FAILURE_INVALID_HANDLE);

        for opcode in [0x1234, 0x6642_0000_0004_0002, 0x6642_0000_0006_000F, 0x6642_0000_0009_0000] {
            ctx.set_syscall(Some(&VMEXIT_EXT), opcode, [HNDL, 0, 0, 0]);
            let ret = dispatch_syscall(&mut ctx, &f.vm_pool, &f.vp_pool, &f.vs_pool);
            assert_eq!(ret, status::FAILURE_UNSUPPORTED);
        }

        let ret = syscall(&f, &mut ctx, &OTHER_EXT, Syscall::Vs(VsOp::RunCurrent), [0; 3]);
        assert_eq!(ret, status::INVALID_PERM_DENIED);

        // Non-VS operations are open to every extension
        let ret = syscall(&f, &mut ctx, &OTHER_EXT, create_vm, [0; 3]);
        assert_eq!(ret, status::SUCCESS);
        assert_eq!(ctx.reg0, 1);
    }

    #[test]
    fn test_dispatch_guest_lifecycle() {
        let f = create_fixture(MkConfig::default());
        let mut ctx = create_ctx(0, 1);
        let ext = &VMEXIT_EXT;

        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vm(VmOp::CreateVm), [0; 3]), status::SUCCESS);
        let vm = ctx.reg0;
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vp(VpOp::CreateVp), [vm, 0, 0]), status::SUCCESS);
        let vp = ctx.reg0;
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vs(VsOp::CreateVs), [vp, 0, 0]), status::SUCCESS);
        let vs = ctx.reg0;

        let rip = VsReg::GuestRip.raw();
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vs(VsOp::Write), [vs, rip, 0x1000]), status::SUCCESS);
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vs(VsOp::AdvanceIpAndRun), [vm, vp, vs]), status::SUCCESS);
        assert_eq!(ctx.exit_reason, EXIT_REASON_VMCALL);
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vs(VsOp::Read), [vs, rip, 0]), status::SUCCESS);
        assert_eq!(ctx.reg0, 0x1000 + INSTR_LEN);

        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vs(VsOp::Read), [vs, 0, 0]), status::INVALID_UNSUPPORTED_REGISTER);
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vs(VsOp::Read), [vs, 157, 0]), status::INVALID_REGISTER);
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vs(VsOp::TlbFlush), [vs, TLB_FLUSH_ALL, 0]), status::SUCCESS);
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vs(VsOp::TlbFlush), [vs, 0x10, 0]), status::INVALID_ADDRESS);
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vm(VmOp::TlbFlush), [vm, 0, 0]), status::SUCCESS);
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vs(VsOp::DestroyVs), [vs, 0, 0]), status::STATE_STILL_ACTIVE);
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vs(VsOp::Migrate), [vs, 1, 0]), status::INVALID_OUT_OF_RANGE);
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vs(VsOp::InitAsRoot), [vs, 0, 0]), status::SUCCESS);

        // Ids wider than 16 bits are malformed
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vs(VsOp::Run), [vm, vp, 0x1_0000]), status::INVALID_ID);
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vs(VsOp::Run), [vm, vp, vs]), status::SUCCESS);
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Vs(VsOp::RunCurrent), [0; 3]), status::SUCCESS);

        for op in [DebugOp::Out, DebugOp::DumpVm] {
            assert_eq!(syscall(&f, &mut ctx, &OTHER_EXT, Syscall::Debug(op), [vm, 0, 0]), status::SUCCESS);
        }
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Debug(DebugOp::DumpVs), [vs, 0, 0]), status::SUCCESS);
        assert_eq!(syscall(&f, &mut ctx, ext, Syscall::Debug(DebugOp::DumpVp), [0xFFFF, 0, 0]), status::INVALID_ID);
    }

    #[test]
    fn test_syscall_decoding() {
        assert_eq!(Syscall::decode(0x6642_0000_0006_0005), Some(Syscall::Vs(VsOp::Run)));
        // Flags are ignored
        assert_eq!(Syscall::decode(0x6642_00FF_0004_0001), Some(Syscall::Vm(VmOp::DestroyVm)));
        assert_eq!(Syscall::decode(0x6643_0000_0004_0001), None);
        assert_eq!(Syscall::decode(0x6642_0000_0005_0002), None);
        assert_eq!(Syscall::Vs(VsOp::TlbFlush).opcode(), 0x6642_0000_0006_000E);
    }

    #[test]
    fn test_status_codes_are_distinct() {
        let all = [
            MkError::InvalidHandle,
            MkError::UnknownSyscall,
            MkError::WrongExtension,
            MkError::InvalidId,
            MkError::Unallocated,
            MkError::OutOfRange,
            MkError::ResourceExhausted,
            MkError::StillActive,
            MkError::StillAssigned,
            MkError::ActiveElsewhere,
            MkError::NonLocal,
            MkError::NotRoot,
            MkError::NotActive,
            MkError::WrongOwner,
            MkError::InvalidRegister,
            MkError::UnsupportedRegister,
            MkError::InvalidAddress,
            MkError::HardwareFailure,
        ];
        let mut codes: Vec<u64> = all.iter().map(|err| err.status()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert!(!codes.contains(&status::SUCCESS));
        assert_eq!(MkError::NonLocal.to_string(), "non local");
    }

    #[test]
    fn test_vmcs_field_names() {
        assert_eq!(vmcs_field_name(0x681E), "VMCS_GUEST_RIP");
        assert_eq!(vmcs_field_name(0x4402), "VMCS_EXIT_REASON");
        assert_eq!(vmcs_field_name(0x0000), "VMCS_VIRTUAL_PROCESSOR_IDENTIFIER");
        assert_eq!(vmcs_field_name(0x1234), UNDEFINED_VMCS_FIELD);
    }

    #[test]
    fn test_concurrent_cores() {
        const ROUNDS: usize = 200;
        let f = create_fixture(MkConfig::default());
        let ctx = create_ctx(0, 2);
        // One VM shared by both cores, each core owning two VPs
        let vm = f.vm_pool.allocate().unwrap();
        let mut triples = Vec::new();
        for pp in 0..2u16 {
            for _ in 0..2 {
                let vp = f.vp_pool.allocate(&f.vm_pool, vm).unwrap();
                let vs = f.vs_pool.allocate(&ctx, &f.vp_pool, vp, PpId::new(pp)).unwrap();
                triples.push((vm, vp, vs));
            }
        }

        std::thread::scope(|s| {
            for pp in 0..2u16 {
                let (f, triples) = (&f, &triples);
                s.spawn(move || {
                    let mut ctx = create_ctx(pp, 2);
                    let mine = &triples[pp as usize * 2..pp as usize * 2 + 2];
                    let theirs = &triples[(1 - pp as usize) * 2];
                    for round in 0..ROUNDS {
                        assert_eq!(run(f, &mut ctx, mine[round % 2]), Ok(EXIT_REASON_VMCALL));
                        assert_eq!(run(f, &mut ctx, *theirs), Err(MkError::NonLocal));
                    }
                    f.vs_pool.deactivate(&mut ctx, &f.vm_pool, &f.vp_pool).unwrap();
                });
            }
        });

        assert_eq!(f.vm_pool.is_active(vm), Ok(None));
        for &(_, vp, vs) in &triples {
            assert_eq!(f.vp_pool.is_active(vp), Ok(None));
            f.vs_pool.deallocate(vs).unwrap();
            f.vp_pool.deallocate(&f.vs_pool, vp).unwrap();
        }
        f.vm_pool.deallocate(&f.vp_pool, vm).unwrap();
    }
}
