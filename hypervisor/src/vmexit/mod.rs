//! The module containing the [`ExitHandler`] contract and handler
//! composition.
//!
//! Every VM exit lands in [`dispatch`], which indexes a 65-entry table by
//! the basic exit-reason number and invokes the matching `handle_*` method
//! on the active handler. The trait defaults implement full pass-through
//! emulation (see the [`passthrough`] module), so the unit
//! [`PassthroughHandler`] already runs a guest indistinguishably from bare
//! metal; layered handlers override individual reasons or wrap the whole
//! dispatch via [`CompositeHandler`].

pub mod dbgbreak;
pub mod passthrough;
pub mod shadow;
pub mod stats;

use crate::{
    vcpu::VCpu,
    vmx::EXIT_REASON_COUNT,
    x86_instructions::vmcall,
};

pub use passthrough::PassthroughHandler;

/// The well-known VMCALL selector requesting vCPU termination. Honored only
/// from CPL 0.
pub const VMCALL_TERMINATE_ID: u64 = 0xdead;

/// The well-known VMCALL selector triggering a host-side debugger break.
/// Honored from any CPL.
pub const VMCALL_BREAKPOINT_ID: u64 = 0xaabb;

/// The default exit handler instance wired into every fresh vCPU.
pub static PASSTHROUGH_HANDLER: PassthroughHandler = PassthroughHandler;

/// A VM-exit handler: one overridable method per basic exit reason, plus
/// lifecycle hooks. Defaults emulate the intercepted operation so the guest
/// observes native behavior; reasons that cannot legitimately occur fall
/// back to a no-op, and VMX instructions reflect #UD (no nested
/// virtualization).
#[allow(missing_docs)]
pub trait ExitHandler: Sync {
    /// Mirrors the current processor state into the guest VMCS at
    /// activation time and applies this handler's interception policy.
    fn setup(&self, vp: &mut VCpu) {
        vp.capture_current_state_into_guest();
    }

    /// Releases per-vCPU state on teardown.
    fn teardown(&self, _vp: &mut VCpu) {}

    /// Handles one VM exit. Concrete handlers route this through
    /// [`dispatch`]; wrappers fan out to their children.
    fn handle(&self, vp: &mut VCpu);

    /// Issues the hypercall that makes `handle_execute_vmcall` terminate
    /// the calling vCPU. Runs in non-root mode.
    fn invoke_termination(&self) {
        let _ = vmcall(VMCALL_TERMINATE_ID, 0, 0, 0);
    }

    fn handle_exception_or_nmi(&self, vp: &mut VCpu) {
        passthrough::exception_or_nmi(vp);
    }

    fn handle_external_interrupt(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_triple_fault(&self, vp: &mut VCpu) {
        passthrough::triple_fault(vp);
    }

    fn handle_init_signal(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_startup_ipi(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_io_smi(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_smi(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_interrupt_window(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_nmi_window(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_task_switch(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_execute_cpuid(&self, vp: &mut VCpu) {
        passthrough::cpuid(vp);
    }

    fn handle_execute_getsec(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_execute_hlt(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_execute_invd(&self, vp: &mut VCpu) {
        passthrough::invd(vp);
    }

    fn handle_execute_invlpg(&self, vp: &mut VCpu) {
        passthrough::invlpg(vp);
    }

    fn handle_execute_rdpmc(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_execute_rdtsc(&self, vp: &mut VCpu) {
        passthrough::rdtsc(vp);
    }

    fn handle_execute_rsm_in_smm(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_execute_vmcall(&self, vp: &mut VCpu) {
        passthrough::vmcall_exit(vp);
    }

    fn handle_execute_vmclear(&self, vp: &mut VCpu) {
        self.handle_vm_fallback(vp);
    }

    fn handle_execute_vmlaunch(&self, vp: &mut VCpu) {
        self.handle_vm_fallback(vp);
    }

    fn handle_execute_vmptrld(&self, vp: &mut VCpu) {
        self.handle_vm_fallback(vp);
    }

    fn handle_execute_vmptrst(&self, vp: &mut VCpu) {
        self.handle_vm_fallback(vp);
    }

    fn handle_execute_vmread(&self, vp: &mut VCpu) {
        self.handle_vm_fallback(vp);
    }

    fn handle_execute_vmresume(&self, vp: &mut VCpu) {
        self.handle_vm_fallback(vp);
    }

    fn handle_execute_vmwrite(&self, vp: &mut VCpu) {
        self.handle_vm_fallback(vp);
    }

    fn handle_execute_vmxoff(&self, vp: &mut VCpu) {
        self.handle_vm_fallback(vp);
    }

    fn handle_execute_vmxon(&self, vp: &mut VCpu) {
        self.handle_vm_fallback(vp);
    }

    fn handle_mov_cr(&self, vp: &mut VCpu) {
        passthrough::mov_cr(vp);
    }

    fn handle_mov_dr(&self, vp: &mut VCpu) {
        passthrough::mov_dr(vp);
    }

    fn handle_execute_io_instruction(&self, vp: &mut VCpu) {
        passthrough::io_instruction(vp);
    }

    fn handle_execute_rdmsr(&self, vp: &mut VCpu) {
        passthrough::rdmsr_exit(vp);
    }

    fn handle_execute_wrmsr(&self, vp: &mut VCpu) {
        passthrough::wrmsr_exit(vp);
    }

    fn handle_error_invalid_guest_state(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_error_msr_load(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_execute_mwait(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_monitor_trap_flag(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_execute_monitor(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_execute_pause(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_error_machine_check(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_tpr_below_threshold(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_apic_access(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_virtualized_eoi(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_gdtr_idtr_access(&self, vp: &mut VCpu) {
        passthrough::gdtr_idtr_access(vp);
    }

    fn handle_ldtr_tr_access(&self, vp: &mut VCpu) {
        passthrough::ldtr_tr_access(vp);
    }

    fn handle_ept_violation(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_ept_misconfiguration(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_execute_invept(&self, vp: &mut VCpu) {
        self.handle_vm_fallback(vp);
    }

    fn handle_execute_rdtscp(&self, vp: &mut VCpu) {
        passthrough::rdtscp(vp);
    }

    fn handle_vmx_preemption_timer_expired(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_execute_invvpid(&self, vp: &mut VCpu) {
        self.handle_vm_fallback(vp);
    }

    fn handle_execute_wbinvd(&self, vp: &mut VCpu) {
        passthrough::wbinvd_exit(vp);
    }

    fn handle_execute_xsetbv(&self, vp: &mut VCpu) {
        passthrough::xsetbv_exit(vp);
    }

    fn handle_apic_write(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_execute_rdrand(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_execute_invpcid(&self, vp: &mut VCpu) {
        passthrough::invpcid(vp);
    }

    fn handle_execute_vmfunc(&self, vp: &mut VCpu) {
        self.handle_vm_fallback(vp);
    }

    fn handle_execute_encls(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_execute_rdseed(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_page_modification_log_full(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_execute_xsaves(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    fn handle_execute_xrstors(&self, vp: &mut VCpu) {
        self.handle_fallback(vp);
    }

    /// The default for exits no pass-through guest can trigger.
    fn handle_fallback(&self, _vp: &mut VCpu) {}

    /// The default for VMX instructions: this instruction is not allowed
    /// from the guest.
    fn handle_vm_fallback(&self, vp: &mut VCpu) {
        passthrough::inject_ud(vp);
    }
}

/// A thunk selecting one trait method.
type HandlerThunk = fn(&dyn ExitHandler, &mut VCpu);

/// The virtualized exit-reason table: basic exit reason number to handler
/// method, one entry per reason 0..=64.
static EXIT_REASON_TABLE: [HandlerThunk; EXIT_REASON_COUNT] = [
    |h, vp| h.handle_exception_or_nmi(vp),            // 0
    |h, vp| h.handle_external_interrupt(vp),          // 1
    |h, vp| h.handle_triple_fault(vp),                // 2
    |h, vp| h.handle_init_signal(vp),                 // 3
    |h, vp| h.handle_startup_ipi(vp),                 // 4
    |h, vp| h.handle_io_smi(vp),                      // 5
    |h, vp| h.handle_smi(vp),                         // 6
    |h, vp| h.handle_interrupt_window(vp),            // 7
    |h, vp| h.handle_nmi_window(vp),                  // 8
    |h, vp| h.handle_task_switch(vp),                 // 9
    |h, vp| h.handle_execute_cpuid(vp),               // 10
    |h, vp| h.handle_execute_getsec(vp),              // 11
    |h, vp| h.handle_execute_hlt(vp),                 // 12
    |h, vp| h.handle_execute_invd(vp),                // 13
    |h, vp| h.handle_execute_invlpg(vp),              // 14
    |h, vp| h.handle_execute_rdpmc(vp),               // 15
    |h, vp| h.handle_execute_rdtsc(vp),               // 16
    |h, vp| h.handle_execute_rsm_in_smm(vp),          // 17
    |h, vp| h.handle_execute_vmcall(vp),              // 18
    |h, vp| h.handle_execute_vmclear(vp),             // 19
    |h, vp| h.handle_execute_vmlaunch(vp),            // 20
    |h, vp| h.handle_execute_vmptrld(vp),             // 21
    |h, vp| h.handle_execute_vmptrst(vp),             // 22
    |h, vp| h.handle_execute_vmread(vp),              // 23
    |h, vp| h.handle_execute_vmresume(vp),            // 24
    |h, vp| h.handle_execute_vmwrite(vp),             // 25
    |h, vp| h.handle_execute_vmxoff(vp),              // 26
    |h, vp| h.handle_execute_vmxon(vp),               // 27
    |h, vp| h.handle_mov_cr(vp),                      // 28
    |h, vp| h.handle_mov_dr(vp),                      // 29
    |h, vp| h.handle_execute_io_instruction(vp),      // 30
    |h, vp| h.handle_execute_rdmsr(vp),               // 31
    |h, vp| h.handle_execute_wrmsr(vp),               // 32
    |h, vp| h.handle_error_invalid_guest_state(vp),   // 33
    |h, vp| h.handle_error_msr_load(vp),              // 34
    |h, vp| h.handle_fallback(vp),                    // 35 (reserved)
    |h, vp| h.handle_execute_mwait(vp),               // 36
    |h, vp| h.handle_monitor_trap_flag(vp),           // 37
    |h, vp| h.handle_fallback(vp),                    // 38 (reserved)
    |h, vp| h.handle_execute_monitor(vp),             // 39
    |h, vp| h.handle_execute_pause(vp),               // 40
    |h, vp| h.handle_error_machine_check(vp),         // 41
    |h, vp| h.handle_fallback(vp),                    // 42 (reserved)
    |h, vp| h.handle_tpr_below_threshold(vp),         // 43
    |h, vp| h.handle_apic_access(vp),                 // 44
    |h, vp| h.handle_virtualized_eoi(vp),             // 45
    |h, vp| h.handle_gdtr_idtr_access(vp),            // 46
    |h, vp| h.handle_ldtr_tr_access(vp),              // 47
    |h, vp| h.handle_ept_violation(vp),               // 48
    |h, vp| h.handle_ept_misconfiguration(vp),        // 49
    |h, vp| h.handle_execute_invept(vp),              // 50
    |h, vp| h.handle_execute_rdtscp(vp),              // 51
    |h, vp| h.handle_vmx_preemption_timer_expired(vp),// 52
    |h, vp| h.handle_execute_invvpid(vp),             // 53
    |h, vp| h.handle_execute_wbinvd(vp),              // 54
    |h, vp| h.handle_execute_xsetbv(vp),              // 55
    |h, vp| h.handle_apic_write(vp),                  // 56
    |h, vp| h.handle_execute_rdrand(vp),              // 57
    |h, vp| h.handle_execute_invpcid(vp),             // 58
    |h, vp| h.handle_execute_vmfunc(vp),              // 59
    |h, vp| h.handle_execute_encls(vp),               // 60
    |h, vp| h.handle_execute_rdseed(vp),              // 61
    |h, vp| h.handle_page_modification_log_full(vp),  // 62
    |h, vp| h.handle_execute_xsaves(vp),              // 63
    |h, vp| h.handle_execute_xrstors(vp),             // 64
];

/// Routes the current VM exit of `vp` to the matching `handler` method.
pub fn dispatch(handler: &dyn ExitHandler, vp: &mut VCpu) {
    let index = usize::from(vp.exit_reason_raw());
    match EXIT_REASON_TABLE.get(index) {
        Some(thunk) => thunk(handler, vp),
        None => handler.handle_fallback(vp),
    }
}

/// Composes two handlers: both see every lifecycle event and every exit, in
/// order. Nest instances to stack more than two layers, eg,
/// `CompositeHandler::new(stats, CompositeHandler::new(dbgbreak, passthrough))`.
pub struct CompositeHandler<A, B> {
    first: A,
    second: B,
}

impl<A: ExitHandler, B: ExitHandler> CompositeHandler<A, B> {
    /// Composes `first` and `second`, invoked in that order.
    pub const fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A: ExitHandler, B: ExitHandler> ExitHandler for CompositeHandler<A, B> {
    fn setup(&self, vp: &mut VCpu) {
        self.first.setup(vp);
        self.second.setup(vp);
    }

    fn teardown(&self, vp: &mut VCpu) {
        self.first.teardown(vp);
        self.second.teardown(vp);
    }

    fn handle(&self, vp: &mut VCpu) {
        self.first.handle(vp);
        self.second.handle(vp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        cpuid: AtomicUsize,
        vmcall: AtomicUsize,
        mov_cr: AtomicUsize,
        ept_violation: AtomicUsize,
    }

    impl ExitHandler for Recorder {
        fn handle(&self, _vp: &mut VCpu) {}

        fn handle_execute_cpuid(&self, _vp: &mut VCpu) {
            let _ = self.cpuid.fetch_add(1, Ordering::Relaxed);
        }

        fn handle_execute_vmcall(&self, _vp: &mut VCpu) {
            let _ = self.vmcall.fetch_add(1, Ordering::Relaxed);
        }

        fn handle_mov_cr(&self, _vp: &mut VCpu) {
            let _ = self.mov_cr.fetch_add(1, Ordering::Relaxed);
        }

        fn handle_ept_violation(&self, _vp: &mut VCpu) {
            let _ = self.ept_violation.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn table_routes_reasons_to_their_methods() {
        let recorder = Recorder::default();
        let mut vcpu = VCpu::new().unwrap();

        EXIT_REASON_TABLE[10](&recorder, &mut vcpu);
        EXIT_REASON_TABLE[18](&recorder, &mut vcpu);
        EXIT_REASON_TABLE[28](&recorder, &mut vcpu);
        EXIT_REASON_TABLE[48](&recorder, &mut vcpu);

        assert_eq!(recorder.cpuid.load(Ordering::Relaxed), 1);
        assert_eq!(recorder.vmcall.load(Ordering::Relaxed), 1);
        assert_eq!(recorder.mov_cr.load(Ordering::Relaxed), 1);
        assert_eq!(recorder.ept_violation.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn composite_runs_children_in_order() {
        static SEQUENCE: AtomicUsize = AtomicUsize::new(0);

        struct Tagger(usize);
        impl ExitHandler for Tagger {
            fn handle(&self, _vp: &mut VCpu) {
                // Record "my tag at my turn".
                let turn = SEQUENCE.fetch_add(1, Ordering::Relaxed);
                assert_eq!(turn, self.0);
            }
        }

        let composite = CompositeHandler::new(Tagger(0), CompositeHandler::new(Tagger(1), Tagger(2)));
        let mut vcpu = VCpu::new().unwrap();
        composite.handle(&mut vcpu);
        assert_eq!(SEQUENCE.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn vmcall_protocol_ids() {
        assert_eq!(VMCALL_TERMINATE_ID, 0xdead);
        assert_eq!(VMCALL_BREAKPOINT_ID, 0xaabb);
    }
}
