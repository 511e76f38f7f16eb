//! The module containing the [`Hypervisor`] type, the lifecycle façade.
//!
//! The façade verifies processor capabilities, owns one [`VCpu`] per
//! logical processor, and fans start/stop out to every processor with the
//! host bridge's broadcast IPI. All of it runs on a management thread in
//! non-root mode; the per-processor callbacks are the only code that
//! crosses into VMX operation.

use crate::{
    error::ErrorCode,
    platform,
    vcpu::VCpu,
    vmexit::ExitHandler,
    vmx::{VmxBasic, VmxEptVpidCap},
    x86_instructions::{cr4, rdmsr},
};
use alloc::{boxed::Box, vec::Vec};
use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, Ordering};
use log::info;
use x86::controlregs::Cr4;

/// The lifecycle façade: capability check, per-CPU fan-out of start and
/// stop, orderly teardown.
pub struct Hypervisor {
    vcpus: Vec<Box<VCpu>>,
}

impl Hypervisor {
    /// Verifies VMX/EPT capabilities on every processor and allocates a
    /// vCPU for each. Fails with [`ErrorCode::FeatureUnavailable`] when any
    /// processor cannot host this hypervisor, and with
    /// [`ErrorCode::NotEnoughMemory`] when the page pool cannot back every
    /// vCPU; already-allocated vCPUs are released on the way out.
    pub fn new() -> Result<Self, ErrorCode> {
        if !Self::check() {
            return Err(ErrorCode::FeatureUnavailable);
        }

        let count = (platform::ops().cpu_count)() as usize;
        let mut vcpus = Vec::with_capacity(count);
        for _ in 0..count {
            vcpus.push(VCpu::new().ok_or(ErrorCode::NotEnoughMemory)?);
        }
        info!("hypervisor created for {count} processors");
        Ok(Self { vcpus })
    }

    /// Runs the capability predicate on every logical processor and
    /// returns whether all of them passed.
    pub fn check() -> bool {
        extern "C" fn check_callback(context: *mut c_void) {
            // Safety: the caller passes an &AtomicBool that outlives the
            // blocking broadcast.
            let passed = unsafe { &*context.cast::<AtomicBool>() };
            if !check_current_processor() {
                passed.store(false, Ordering::SeqCst);
            }
        }

        let passed = AtomicBool::new(true);
        (platform::ops().ipi_call)(
            check_callback,
            core::ptr::from_ref(&passed).cast_mut().cast::<c_void>(),
        );
        passed.load(Ordering::SeqCst)
    }

    /// Subverts every logical processor with `handler` driving its exits.
    pub fn start(&mut self, handler: &'static dyn ExitHandler) {
        info!("starting the hypervisor on all processors");

        let vcpus: Vec<*mut VCpu> = self
            .vcpus
            .iter_mut()
            .map(|vcpu| core::ptr::from_mut::<VCpu>(&mut **vcpu))
            .collect();
        let context = StartStopContext {
            vcpus: vcpus.as_ptr(),
            handler: Some(handler),
        };

        extern "C" fn start_callback(context: *mut c_void) {
            // Safety: the context and the vCPU array outlive the blocking
            // broadcast; each processor touches only its own vCPU.
            let context = unsafe { &*context.cast::<StartStopContext>() };
            let index = (platform::ops().cpu_index)() as usize;
            let vcpu = unsafe { &mut **context.vcpus.add(index) };
            vcpu.initialize();
            vcpu.set_exit_handler(context.handler.unwrap());
            vcpu.launch();
        }

        (platform::ops().ipi_call)(
            start_callback,
            core::ptr::from_ref(&context).cast_mut().cast::<c_void>(),
        );
        info!("the hypervisor started");
    }

    /// Winds the hypervisor out of every processor via the terminate
    /// hypercall.
    pub fn stop(&mut self) {
        info!("stopping the hypervisor on all processors");

        let vcpus: Vec<*mut VCpu> = self
            .vcpus
            .iter_mut()
            .map(|vcpu| core::ptr::from_mut::<VCpu>(&mut **vcpu))
            .collect();
        let context = StartStopContext {
            vcpus: vcpus.as_ptr(),
            handler: None,
        };

        extern "C" fn stop_callback(context: *mut c_void) {
            // Safety: as in `start`.
            let context = unsafe { &*context.cast::<StartStopContext>() };
            let index = (platform::ops().cpu_index)() as usize;
            let vcpu = unsafe { &mut **context.vcpus.add(index) };
            vcpu.destroy();
        }

        (platform::ops().ipi_call)(
            stop_callback,
            core::ptr::from_ref(&context).cast_mut().cast::<c_void>(),
        );
        info!("the hypervisor stopped");
    }
}

struct StartStopContext {
    vcpus: *const *mut VCpu,
    handler: Option<&'static dyn ExitHandler>,
}

/// The per-processor capability predicate.
fn check_current_processor() -> bool {
    const MEMORY_TYPE_WRITE_BACK: u64 = 6;

    // Refuse to nest under another VMX user (or ourselves).
    if cr4().contains(Cr4::CR4_ENABLE_VMX) {
        return false;
    }

    let vmx_basic = VmxBasic(rdmsr(x86::msr::IA32_VMX_BASIC));
    if vmx_basic.vmcs_size() > 0x1000
        || vmx_basic.memory_type() != MEMORY_TYPE_WRITE_BACK
        || !vmx_basic.true_controls()
    {
        return false;
    }

    let ept_vpid_cap = VmxEptVpidCap(rdmsr(x86::msr::IA32_VMX_EPT_VPID_CAP));
    ept_vpid_cap.page_walk_length_4()
        && ept_vpid_cap.memory_type_write_back()
        && ept_vpid_cap.invept()
        && ept_vpid_cap.invept_all_contexts()
        && ept_vpid_cap.execute_only_pages()
        && ept_vpid_cap.pde_2mb_pages()
}
