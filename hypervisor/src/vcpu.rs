//! The module containing the [`VCpu`] type, one instance per logical
//! processor.
//!
//! A vCPU owns everything its processor needs to run the host OS as a guest:
//! the VMXON and VMCS regions, the MSR and I/O bitmaps, the EPT identity
//! map, a dedicated host stack, and the two register contexts the assembly
//! trampoline reads and writes. [`VCpu::launch`] captures the current thread
//! state and re-enters it as guest state, so the call appears to simply
//! return while everything after it executes in VMX non-root operation.
//!
//! All references to external resources (denoted with "See:") refers to
//! "Intel 64 and IA-32 Architectures Software Developer's Manual Volume 3"
//! unless otherwise stated.

use crate::{
    ept::EptTable,
    mtrr::MtrrDescriptor,
    platform,
    vmexit::{ExitHandler, PASSTHROUGH_HANDLER},
    vmx::{
        adjust_cr0, adjust_cr4, adjust_vmx_control, segment_access_rights, segment_base,
        segment_limit, Event, InstructionError, InterruptInfo, VmxBasic, VmxControl,
    },
    x86_instructions::{
        cr0, cr0_write, cr3, cr3_write, cr4, cr4_write, invept, invvpid_all_contexts, lgdt, lidt,
        rdmsr, read_dr, read_segment_selector, rflags, sgdt, sidt, vmclear, vmlaunch, vmptrld,
        vmread, vmwrite, vmxoff, vmxon, wrmsr, InveptType,
    },
    Page,
};
use alloc::boxed::Box;
use core::alloc::Layout;
use core::arch::global_asm;
use core::mem::offset_of;
use x86::controlregs::{Cr0, Cr4};
use x86::vmx::vmcs;

pub use crate::x86_instructions::SegmentRegister;

/// The size of the per-vCPU host stack. Root-mode code must never exceed
/// this for total stack usage; overflow silently corrupts the launch and
/// exit contexts placed above it.
pub const HOST_STACK_SIZE: usize = 0x8000;

/// The VPID every vCPU runs with. One guest, one address-space tag.
pub const VPID: u16 = 1;

/// The collection of guest register values not managed by the VMCS, in the
/// register-encoding order VM-exit qualifications use (RSP at index 4).
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
#[allow(missing_docs)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl GuestRegisters {
    /// Reads the general purpose register selected by a VM-exit
    /// qualification encoding (0 = RAX .. 15 = R15).
    pub fn gp(&self, index: u64) -> u64 {
        match index & 0xf {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    /// Writes the general purpose register selected by a VM-exit
    /// qualification encoding.
    pub fn set_gp(&mut self, index: u64, value: u64) {
        match index & 0xf {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            4 => self.rsp = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            _ => self.r15 = value,
        }
    }
}

// The assembly in vcpu_switch.S hardcodes these offsets.
const _: () = assert!(size_of::<GuestRegisters>() == 0x90);
const _: () = assert!(offset_of!(GuestRegisters, rax) == 0x00);
const _: () = assert!(offset_of!(GuestRegisters, rcx) == 0x08);
const _: () = assert!(offset_of!(GuestRegisters, rsp) == 0x20);
const _: () = assert!(offset_of!(GuestRegisters, r15) == 0x78);
const _: () = assert!(offset_of!(GuestRegisters, rip) == 0x80);
const _: () = assert!(offset_of!(GuestRegisters, rflags) == 0x88);

/// The lifecycle states of a vCPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum VcpuState {
    /// Not initialized.
    Off = 0,
    /// In VMX root mode; host and guest VMCS being initialized.
    Initializing = 1,
    /// The initial VM entry is in flight.
    Launching = 2,
    /// The guest is running.
    Running = 3,
    /// Termination has been requested.
    Terminating = 4,
    /// VMX root mode has been left.
    Terminated = 5,
}

/// The region of memory the processor uses for VMX operation: the VMXON
/// region and VMCSes share this layout.
///
/// See: 25.2 FORMAT OF THE VMCS REGION
#[derive(derivative::Derivative)]
#[derivative(Default)]
#[repr(C, align(4096))]
struct Vmcs {
    revision_id: u32,
    abort_indicator: u32,
    #[derivative(Default(value = "[0; 4088]"))]
    data: [u8; 4088],
}
const _: () = assert!(size_of::<Vmcs>() == 0x1000);

/// One virtual processor. Always heap-allocated; the assembly trampoline
/// relies on the leading stack/context layout asserted below.
#[repr(C, align(4096))]
pub struct VCpu {
    stack: [u8; HOST_STACK_SIZE],
    launch_context: GuestRegisters,
    exit_context: GuestRegisters,
    state: VcpuState,
    last_instruction_error: InstructionError,
    suppress_rip_adjust: bool,
    exit_handler: *const dyn ExitHandler,
    ept: EptTable,
    vmcs_host: Vmcs,
    vmcs_guest: Vmcs,
    msr_bitmap: Page,
    io_bitmap_a: Page,
    io_bitmap_b: Page,
}

static_assertions::const_assert_eq!(offset_of!(VCpu, stack), 0);
static_assertions::const_assert_eq!(offset_of!(VCpu, launch_context), HOST_STACK_SIZE);
static_assertions::const_assert_eq!(offset_of!(VCpu, exit_context), HOST_STACK_SIZE + 0x90);

// Safety: a vCPU is only ever touched by the logical processor it belongs
// to; the container is built and torn down by the management thread while
// the vCPU is not running.
unsafe impl Send for VCpu {}
unsafe impl Sync for VCpu {}

global_asm!(include_str!("vcpu_switch.S"));

extern "efiapi" {
    fn hv_capture_context(ctx: *mut GuestRegisters) -> u64;
    fn hv_vmentry_point();
    fn hv_vmexit_entry();
    fn hv_vmx_resume();
}

/// Called by the VM-exit trampoline with the owning vCPU.
#[no_mangle]
unsafe extern "efiapi" fn hv_vcpu_on_host_entry(vcpu: *mut VCpu) {
    // Safety: the trampoline derives the pointer from the host RSP, which
    // the VMCS ties to this vCPU.
    unsafe { (*vcpu).on_host_entry() };
}

/// Called when VMRESUME falls through, which must not happen.
#[no_mangle]
unsafe extern "efiapi" fn hv_vcpu_vmentry_failure(vcpu: *mut VCpu) -> ! {
    // Safety: as for `hv_vcpu_on_host_entry`.
    unsafe { (*vcpu).error() };
    loop {
        crate::x86_instructions::pause();
        crate::x86_instructions::hlt();
    }
}

impl VCpu {
    /// Allocates a new vCPU in the `Off` state with the pass-through handler
    /// wired, or `None` when the page pool cannot back it.
    pub fn new() -> Option<Box<Self>> {
        // The raw allocation path reports pool exhaustion as null instead
        // of aborting through the global OOM handler. Zero is a valid bit
        // pattern for every field; the handler pointer is given a real
        // referent before the box takes over.
        // Safety: the layout is non-zero sized.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(Layout::new::<Self>()) }.cast::<Self>();
        if ptr.is_null() {
            return None;
        }
        // Safety: `ptr` is a live allocation with the layout of `Self`.
        unsafe {
            let handler: &'static dyn ExitHandler = &PASSTHROUGH_HANDLER;
            core::ptr::addr_of_mut!((*ptr).exit_handler).write(handler);
            Some(Box::from_raw(ptr))
        }
    }

    /// Resets the vCPU to its pre-launch state.
    pub fn initialize(&mut self) {
        self.state = VcpuState::Off;
        self.last_instruction_error = InstructionError(0);
        self.suppress_rip_adjust = false;
        self.exit_handler = &PASSTHROUGH_HANDLER;
    }

    /// Replaces the exit handler. Must happen before [`VCpu::launch`].
    pub fn set_exit_handler(&mut self, handler: &'static dyn ExitHandler) {
        self.exit_handler = handler;
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> VcpuState {
        self.state
    }

    /// Returns the last VMX instruction error recorded by [`VCpu::error`].
    pub fn last_instruction_error(&self) -> InstructionError {
        self.last_instruction_error
    }

    /// Subverts the current processor. On success this returns twice over
    /// its lifetime: once immediately (now in VMX non-root operation, ie, as
    /// the guest), and conceptually once more when [`VCpu::terminate`] winds
    /// the processor back out.
    pub fn launch(&mut self) {
        // Safety: the launch context lives in this heap allocation and
        // stays valid until the second return.
        let captured = unsafe { hv_capture_context(&mut self.launch_context) };
        match captured {
            // First pass; build VMX state and enter the guest.
            0 => self.setup(),

            // Second pass, entered via the VM entry point: this thread is
            // now the guest.
            c if c == VcpuState::Launching as u64 => {
                self.state = VcpuState::Running;
            }

            _ => debug_assert!(false, "unexpected capture value {captured:#x}"),
        }
    }

    /// Requests termination from non-root mode by issuing the terminate
    /// hypercall, then tears down the EPT.
    pub fn destroy(&mut self) {
        if self.state == VcpuState::Running {
            self.state = VcpuState::Terminating;
            // Safety: dereferences the registered handler, which outlives
            // the vCPU by contract.
            let handler = unsafe { &*self.exit_handler };
            handler.invoke_termination();
        }
        self.ept.destroy();
    }

    /// Leaves VMX operation on this processor. Must be called from root mode
    /// (ie, from the VMCALL handler).
    pub fn terminate(&mut self) {
        debug_assert!(self.state != VcpuState::Off && self.state != VcpuState::Terminated);

        // Advance RIP past the VMCALL before leaving root mode.
        self.exit_context.rip += self.exit_instruction_length();

        // In VMX root operation the processor runs with GDT/IDT limits
        // forced to 0xffff. PatchGuard takes a modified descriptor table
        // register as an attack and bugchecks, so restore the guest values
        // before VMXOFF.
        let gdtr = x86::dtables::DescriptorTablePointer::<u64> {
            limit: self.guest_gdtr_limit() as u16,
            base: self.guest_gdtr_base() as *const u64,
        };
        let idtr = x86::dtables::DescriptorTablePointer::<u64> {
            limit: self.guest_idtr_limit() as u16,
            base: self.guest_idtr_base() as *const u64,
        };
        lgdt(&gdtr);
        lidt(&idtr);

        // The VMCALL may have interrupted an arbitrary process. Returning
        // with the host CR3 (the system address space) would leave that
        // thread on the wrong page tables, so restore the guest CR3.
        cr3_write(self.guest_cr3());

        let _ = vmxoff();
        self.state = VcpuState::Terminated;
    }

    fn setup(&mut self) {
        // The pool may not be able to back the EPT; unwind without ever
        // entering VMX operation.
        if self.ept.initialize(MtrrDescriptor::read()).is_err()
            || self.ept.identity_map(&platform::info().memory).is_err()
        {
            self.state = VcpuState::Terminated;
            self.error();
            return;
        }

        if !self.load_vmcs_host() {
            return;
        }
        if !self.load_vmcs_guest() {
            return;
        }

        self.setup_vmcs_host();
        self.setup_vmcs_guest();

        invept(InveptType::AllContexts, 0);
        invvpid_all_contexts();

        self.state = VcpuState::Launching;
        let _ = vmlaunch();

        // VMLAUNCH only falls through on failure.
        self.error();
    }

    /// Enters VMX root operation with the host VMCS region as the VMXON
    /// region.
    fn load_vmcs_host(&mut self) -> bool {
        adjust_feature_control_msr();
        cr0_write(Cr0::from_bits_truncate(adjust_cr0(cr0().bits() as u64) as usize));
        cr4_write(Cr4::from_bits_truncate(adjust_cr4(cr4().bits() as u64) as usize));

        let vmx_basic = VmxBasic(rdmsr(x86::msr::IA32_VMX_BASIC));
        self.vmcs_host.revision_id = vmx_basic.revision_id();

        if vmxon(platform::Pa::from_va(&self.vmcs_host).0).is_ok() {
            self.state = VcpuState::Initializing;
            true
        } else {
            self.state = VcpuState::Terminated;
            self.error();
            false
        }
    }

    /// Makes the guest VMCS clear, active and current.
    fn load_vmcs_guest(&mut self) -> bool {
        debug_assert!(self.state == VcpuState::Initializing);

        let vmx_basic = VmxBasic(rdmsr(x86::msr::IA32_VMX_BASIC));
        self.vmcs_guest.revision_id = vmx_basic.revision_id();

        let pa = platform::Pa::from_va(&self.vmcs_guest).0;
        if vmclear(pa).is_ok() && vmptrld(pa).is_ok() {
            true
        } else {
            self.error();
            false
        }
    }

    /// Populates the host-state fields from the current processor state.
    /// Host RIP/RSP point at the exit trampoline on this vCPU's own stack.
    fn setup_vmcs_host(&mut self) {
        let mut gdtr = x86::dtables::DescriptorTablePointer::<u64>::default();
        let mut idtr = x86::dtables::DescriptorTablePointer::<u64>::default();
        sgdt(&mut gdtr);
        sidt(&mut idtr);
        let gdt_base = gdtr.base as u64;

        // Host selector fields require RPL == 0 and TI == 0.
        // See: 27.2.3 Checks on Host Segment and Descriptor-Table Registers
        let selector = |reg| read_segment_selector(reg).bits() & !0x7;
        vmwrite(vmcs::host::ES_SELECTOR, selector(SegmentRegister::Es));
        vmwrite(vmcs::host::CS_SELECTOR, selector(SegmentRegister::Cs));
        vmwrite(vmcs::host::SS_SELECTOR, selector(SegmentRegister::Ss));
        vmwrite(vmcs::host::DS_SELECTOR, selector(SegmentRegister::Ds));
        vmwrite(vmcs::host::FS_SELECTOR, selector(SegmentRegister::Fs));
        vmwrite(vmcs::host::GS_SELECTOR, selector(SegmentRegister::Gs));
        vmwrite(vmcs::host::TR_SELECTOR, selector(SegmentRegister::Tr));

        vmwrite(vmcs::host::FS_BASE, rdmsr(x86::msr::IA32_FS_BASE));
        vmwrite(vmcs::host::GS_BASE, rdmsr(x86::msr::IA32_GS_BASE));
        vmwrite(
            vmcs::host::TR_BASE,
            segment_base(gdt_base, read_segment_selector(SegmentRegister::Tr).bits()),
        );
        vmwrite(vmcs::host::GDTR_BASE, gdt_base);
        vmwrite(vmcs::host::IDTR_BASE, idtr.base as u64);

        vmwrite(vmcs::host::CR0, cr0().bits() as u64);
        vmwrite(vmcs::host::CR3, cr3());
        vmwrite(vmcs::host::CR4, cr4().bits() as u64);

        vmwrite(vmcs::host::RSP, self.stack_top());
        vmwrite(vmcs::host::RIP, hv_vmexit_entry as usize as u64);
    }

    /// Populates the control and guest-state fields so that the guest
    /// resumes the current thread right behind VMLAUNCH, with the state the
    /// processor has at this very moment.
    fn setup_vmcs_guest(&mut self) {
        const PROCBASED_ACTIVATE_SECONDARY: u64 = 1 << 31;
        const PROCBASED_USE_MSR_BITMAPS: u64 = 1 << 28;
        const PROCBASED_USE_IO_BITMAPS: u64 = 1 << 25;
        const PROCBASED_RDTSC_EXITING: u64 = 1 << 12;
        const PROCBASED2_ENABLE_EPT: u64 = 1 << 1;
        const PROCBASED2_ENABLE_VPID: u64 = 1 << 5;
        const ENTRY_IA32E_MODE_GUEST: u64 = 1 << 9;
        const EXIT_HOST_ADDRESS_SPACE_SIZE: u64 = 1 << 9;

        vmwrite(vmcs::control::VPID, VPID);
        vmwrite(vmcs::control::EPTP_FULL, self.ept.ept_pointer());

        // Intel advises -1 here whenever VMCS shadowing is off.
        vmwrite(vmcs::guest::LINK_PTR_FULL, u64::MAX);

        vmwrite(
            vmcs::control::PINBASED_EXEC_CONTROLS,
            adjust_vmx_control(VmxControl::PinBased, 0),
        );
        let mut procbased = PROCBASED_ACTIVATE_SECONDARY
            | PROCBASED_USE_MSR_BITMAPS
            | PROCBASED_USE_IO_BITMAPS;
        if crate::config::INTERCEPT_RDTSC {
            procbased |= PROCBASED_RDTSC_EXITING;
        }
        vmwrite(
            vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
            adjust_vmx_control(VmxControl::ProcessorBased, procbased),
        );
        vmwrite(
            vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS,
            adjust_vmx_control(
                VmxControl::ProcessorBased2,
                PROCBASED2_ENABLE_EPT | PROCBASED2_ENABLE_VPID,
            ),
        );
        vmwrite(
            vmcs::control::VMENTRY_CONTROLS,
            adjust_vmx_control(VmxControl::VmEntry, ENTRY_IA32E_MODE_GUEST),
        );
        vmwrite(
            vmcs::control::VMEXIT_CONTROLS,
            adjust_vmx_control(VmxControl::VmExit, EXIT_HOST_ADDRESS_SPACE_SIZE),
        );

        // All-zero MSR bitmap: no MSR exits beyond the architectural set.
        self.msr_bitmap.0.fill(0);
        vmwrite(
            vmcs::control::MSR_BITMAPS_ADDR_FULL,
            platform::Pa::from_va(&self.msr_bitmap).0,
        );

        let io_fill = if crate::config::INTERCEPT_ALL_IO { 0xff } else { 0x00 };
        self.io_bitmap_a.0.fill(io_fill);
        self.io_bitmap_b.0.fill(io_fill);
        vmwrite(
            vmcs::control::IO_BITMAP_A_ADDR_FULL,
            platform::Pa::from_va(&self.io_bitmap_a).0,
        );
        vmwrite(
            vmcs::control::IO_BITMAP_B_ADDR_FULL,
            platform::Pa::from_va(&self.io_bitmap_b).0,
        );

        // Guest state mirrors the processor state of this moment; the exit
        // handler gets the same chance and may add interception policy
        // (exception bitmap bits and the like).
        self.capture_current_state_into_guest();

        vmwrite(vmcs::guest::RSP, self.stack_top());
        vmwrite(vmcs::guest::RIP, hv_vmentry_point as usize as u64);

        // Safety: dereferences the registered handler, which outlives the
        // vCPU by contract.
        let handler = unsafe { &*self.exit_handler };
        handler.setup(self);
    }

    /// Copies the live processor state (control registers, segmentation,
    /// descriptor tables, debug state, RFLAGS) into the guest VMCS fields.
    pub fn capture_current_state_into_guest(&mut self) {
        let mut gdtr = x86::dtables::DescriptorTablePointer::<u64>::default();
        let mut idtr = x86::dtables::DescriptorTablePointer::<u64>::default();
        sgdt(&mut gdtr);
        sidt(&mut idtr);
        let gdt_base = gdtr.base as u64;

        self.set_guest_cr0(cr0().bits() as u64);
        self.set_cr0_shadow(cr0().bits() as u64);
        self.set_guest_cr3(cr3());
        self.set_guest_cr4(cr4().bits() as u64);
        self.set_cr4_shadow(cr4().bits() as u64);

        self.set_guest_dr7(read_dr(7));
        self.set_guest_debugctl(rdmsr(x86::msr::IA32_DEBUGCTL));
        vmwrite(vmcs::guest::RFLAGS, rflags().bits());

        vmwrite(vmcs::guest::GDTR_BASE, gdt_base);
        vmwrite(vmcs::guest::GDTR_LIMIT, u32::from(gdtr.limit));
        vmwrite(vmcs::guest::IDTR_BASE, idtr.base as u64);
        vmwrite(vmcs::guest::IDTR_LIMIT, u32::from(idtr.limit));

        for seg in [
            SegmentRegister::Es,
            SegmentRegister::Cs,
            SegmentRegister::Ss,
            SegmentRegister::Ds,
            SegmentRegister::Fs,
            SegmentRegister::Gs,
            SegmentRegister::Ldtr,
            SegmentRegister::Tr,
        ] {
            let selector = read_segment_selector(seg);
            self.set_guest_segment_selector(seg, selector.bits());
            vmwrite(limit_field(seg), segment_limit(gdt_base, selector.bits()));
            vmwrite(access_field(seg), segment_access_rights(gdt_base, selector.bits()));
            let base = match seg {
                // In long mode FS/GS bases live in MSRs, not descriptors.
                SegmentRegister::Fs => rdmsr(x86::msr::IA32_FS_BASE),
                SegmentRegister::Gs => rdmsr(x86::msr::IA32_GS_BASE),
                _ => segment_base(gdt_base, selector.bits()),
            };
            vmwrite(base_field(seg), base);
        }
    }

    /// The VM-exit entry point on the Rust side; see §"Control flow" in the
    /// crate docs. Runs on this vCPU's own stack with interrupts disabled.
    fn on_host_entry(&mut self) {
        self.suppress_rip_adjust = false;

        // The trampoline stored the host RSP/RFLAGS; stash them while the
        // context holds guest values for the handler.
        let saved_rsp = self.exit_context.rsp;
        let saved_rflags = self.exit_context.rflags;

        self.exit_context.rsp = vmread(vmcs::guest::RSP);
        self.exit_context.rip = vmread(vmcs::guest::RIP);
        self.exit_context.rflags = vmread(vmcs::guest::RFLAGS);

        // Safety: dereferences the registered handler, which outlives the
        // vCPU by contract.
        let handler = unsafe { &*self.exit_handler };
        handler.handle(self);

        if self.state == VcpuState::Terminated {
            // VMX is already off; the trampoline restores the guest context
            // and execution continues behind the terminating VMCALL.
            return;
        }

        if !self.suppress_rip_adjust {
            self.exit_context.rip += self.exit_instruction_length();
        }

        vmwrite(vmcs::guest::RSP, self.exit_context.rsp);
        vmwrite(vmcs::guest::RIP, self.exit_context.rip);
        vmwrite(vmcs::guest::RFLAGS, self.exit_context.rflags);

        self.exit_context.rsp = saved_rsp;
        self.exit_context.rflags = saved_rflags;
        self.exit_context.rip = hv_vmx_resume as usize as u64;
    }

    /// Records the VM-instruction error and traps to the debugger.
    fn error(&mut self) {
        self.last_instruction_error = self.exit_instruction_error();
        self.state = VcpuState::Terminated;
        crate::x86_instructions::debug_break();
    }

    fn stack_top(&self) -> u64 {
        core::ptr::from_ref(self) as u64 + HOST_STACK_SIZE as u64
    }

    //
    // Exit information.
    //

    /// The raw basic exit reason.
    pub fn exit_reason_raw(&self) -> u16 {
        vmread(vmcs::ro::EXIT_REASON) as u16
    }

    /// The exit qualification.
    pub fn exit_qualification(&self) -> u64 {
        vmread(vmcs::ro::EXIT_QUALIFICATION)
    }

    /// The length of the instruction that caused the exit.
    pub fn exit_instruction_length(&self) -> u64 {
        vmread(vmcs::ro::VMEXIT_INSTRUCTION_LEN)
    }

    /// The VM-exit instruction-information field.
    pub fn exit_instruction_info(&self) -> u32 {
        vmread(vmcs::ro::VMEXIT_INSTRUCTION_INFO) as u32
    }

    /// The VM-exit interruption information.
    pub fn exit_interruption_info(&self) -> InterruptInfo {
        InterruptInfo(vmread(vmcs::ro::VMEXIT_INTERRUPTION_INFO) as u32)
    }

    /// The VM-exit interruption error code.
    pub fn exit_interruption_error_code(&self) -> u32 {
        vmread(vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE) as u32
    }

    /// The VM-instruction error of the most recent VMX instruction.
    pub fn exit_instruction_error(&self) -> InstructionError {
        InstructionError(vmread(vmcs::ro::VM_INSTRUCTION_ERROR) as u32)
    }

    /// The guest-physical address of an EPT violation.
    pub fn exit_guest_physical_address(&self) -> platform::Pa {
        platform::Pa(vmread(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL))
    }

    /// The guest-linear address associated with the exit, when valid.
    pub fn exit_guest_linear_address(&self) -> u64 {
        vmread(vmcs::ro::GUEST_LINEAR_ADDR)
    }

    /// Computes the guest virtual address of the memory operand of the
    /// exiting instruction from the instruction-information field and the
    /// displacement in the exit qualification.
    pub fn exit_instruction_guest_va(&self) -> *mut u8 {
        let info = crate::vmx::InfoInvalidate(self.exit_instruction_info());
        let mut addr = self.exit_qualification();
        if !info.base_register_invalid() {
            addr = addr.wrapping_add(self.exit_context.gp(u64::from(info.base_register())));
        }
        if !info.index_register_invalid() {
            addr = addr
                .wrapping_add(self.exit_context.gp(u64::from(info.index_register())) << info.scaling());
        }
        match info.address_size() {
            0 => addr &= 0xffff,
            1 => addr &= 0xffff_ffff,
            _ => {}
        }
        addr as *mut u8
    }

    /// The register context the handlers read and mutate.
    pub fn exit_context(&self) -> &GuestRegisters {
        &self.exit_context
    }

    /// The mutable register context the handlers read and mutate.
    pub fn exit_context_mut(&mut self) -> &mut GuestRegisters {
        &mut self.exit_context
    }

    /// The EPT of this vCPU.
    pub fn ept_mut(&mut self) -> &mut EptTable {
        &mut self.ept
    }

    //
    // Entry (injection) control.
    //

    /// Queues `event` for delivery on the next VM entry. Software-delivered
    /// kinds also need the instruction length, which is taken from the
    /// current exit.
    ///
    /// See: 27.6 EVENT INJECTION
    pub fn inject(&mut self, event: Event) {
        // Bit 12 is NMI-unblocking information on exit but reserved on
        // entry; sanitize events rebuilt from exit information.
        let mut info = event.info;
        info.set_nmi_unblocking(false);
        vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, info.0);
        if let Some(error_code) = event.error_code {
            vmwrite(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE, error_code);
        }
        if event.info.interrupt_type().is_software() {
            vmwrite(
                vmcs::control::VMENTRY_INSTRUCTION_LEN,
                self.exit_instruction_length(),
            );
        }
    }

    /// Keeps the guest RIP where it is for this exit; injection or explicit
    /// RIP manipulation controls it instead.
    pub fn suppress_rip_adjust(&mut self) {
        self.suppress_rip_adjust = true;
    }

    //
    // Guest state.
    //

    /// The guest CPL, from the DPL of the guest SS access rights.
    pub fn guest_cpl(&self) -> u64 {
        (vmread(vmcs::guest::SS_ACCESS_RIGHTS) >> 5) & 0b11
    }

    /// Whether the guest CS is a long-mode code segment.
    pub fn guest_cs_long_mode(&self) -> bool {
        (vmread(vmcs::guest::CS_ACCESS_RIGHTS) & (1 << 13)) != 0
    }

    #[allow(missing_docs)]
    pub fn guest_cr0(&self) -> u64 {
        vmread(vmcs::guest::CR0)
    }

    #[allow(missing_docs)]
    pub fn set_guest_cr0(&mut self, value: u64) {
        vmwrite(vmcs::guest::CR0, value);
    }

    #[allow(missing_docs)]
    pub fn cr0_shadow(&self) -> u64 {
        vmread(vmcs::control::CR0_READ_SHADOW)
    }

    #[allow(missing_docs)]
    pub fn set_cr0_shadow(&mut self, value: u64) {
        vmwrite(vmcs::control::CR0_READ_SHADOW, value);
    }

    #[allow(missing_docs)]
    pub fn guest_cr3(&self) -> u64 {
        vmread(vmcs::guest::CR3)
    }

    #[allow(missing_docs)]
    pub fn set_guest_cr3(&mut self, value: u64) {
        vmwrite(vmcs::guest::CR3, value);
    }

    #[allow(missing_docs)]
    pub fn guest_cr4(&self) -> u64 {
        vmread(vmcs::guest::CR4)
    }

    #[allow(missing_docs)]
    pub fn set_guest_cr4(&mut self, value: u64) {
        vmwrite(vmcs::guest::CR4, value);
    }

    #[allow(missing_docs)]
    pub fn cr4_shadow(&self) -> u64 {
        vmread(vmcs::control::CR4_READ_SHADOW)
    }

    #[allow(missing_docs)]
    pub fn set_cr4_shadow(&mut self, value: u64) {
        vmwrite(vmcs::control::CR4_READ_SHADOW, value);
    }

    #[allow(missing_docs)]
    pub fn guest_dr7(&self) -> u64 {
        vmread(vmcs::guest::DR7)
    }

    #[allow(missing_docs)]
    pub fn set_guest_dr7(&mut self, value: u64) {
        vmwrite(vmcs::guest::DR7, value);
    }

    #[allow(missing_docs)]
    pub fn guest_debugctl(&self) -> u64 {
        vmread(vmcs::guest::IA32_DEBUGCTL_FULL)
    }

    #[allow(missing_docs)]
    pub fn set_guest_debugctl(&mut self, value: u64) {
        vmwrite(vmcs::guest::IA32_DEBUGCTL_FULL, value);
    }

    #[allow(missing_docs)]
    pub fn guest_gdtr_base(&self) -> u64 {
        vmread(vmcs::guest::GDTR_BASE)
    }

    #[allow(missing_docs)]
    pub fn guest_gdtr_limit(&self) -> u32 {
        vmread(vmcs::guest::GDTR_LIMIT) as u32
    }

    #[allow(missing_docs)]
    pub fn set_guest_gdtr(&mut self, base: u64, limit: u32) {
        vmwrite(vmcs::guest::GDTR_BASE, base);
        vmwrite(vmcs::guest::GDTR_LIMIT, limit);
    }

    #[allow(missing_docs)]
    pub fn guest_idtr_base(&self) -> u64 {
        vmread(vmcs::guest::IDTR_BASE)
    }

    #[allow(missing_docs)]
    pub fn guest_idtr_limit(&self) -> u32 {
        vmread(vmcs::guest::IDTR_LIMIT) as u32
    }

    #[allow(missing_docs)]
    pub fn set_guest_idtr(&mut self, base: u64, limit: u32) {
        vmwrite(vmcs::guest::IDTR_BASE, base);
        vmwrite(vmcs::guest::IDTR_LIMIT, limit);
    }

    /// Reads a guest segment selector.
    pub fn guest_segment_selector(&self, seg: SegmentRegister) -> u16 {
        vmread(selector_field(seg)) as u16
    }

    /// Writes a guest segment selector.
    pub fn set_guest_segment_selector(&mut self, seg: SegmentRegister, selector: u16) {
        vmwrite(selector_field(seg), selector);
    }

    /// Reads a guest segment base.
    pub fn guest_segment_base(&self, seg: SegmentRegister) -> u64 {
        vmread(base_field(seg))
    }

    /// Writes a guest segment base.
    pub fn set_guest_segment_base(&mut self, seg: SegmentRegister, base: u64) {
        vmwrite(base_field(seg), base);
    }

    //
    // Interception policy knobs for exit handlers.
    //

    #[allow(missing_docs)]
    pub fn exception_bitmap(&self) -> u32 {
        vmread(vmcs::control::EXCEPTION_BITMAP) as u32
    }

    #[allow(missing_docs)]
    pub fn set_exception_bitmap(&mut self, bitmap: u32) {
        vmwrite(vmcs::control::EXCEPTION_BITMAP, bitmap);
    }

    #[allow(missing_docs)]
    pub fn set_pagefault_error_code_mask(&mut self, mask: u32) {
        vmwrite(vmcs::control::PAGE_FAULT_ERR_CODE_MASK, mask);
    }

    #[allow(missing_docs)]
    pub fn set_pagefault_error_code_match(&mut self, mask: u32) {
        vmwrite(vmcs::control::PAGE_FAULT_ERR_CODE_MATCH, mask);
    }
}

/// Ensures the lock bit and the VMXON-outside-SMX bit of
/// IA32_FEATURE_CONTROL are set; VMXON fails without them.
fn adjust_feature_control_msr() {
    const IA32_FEATURE_CONTROL_LOCK_BIT_FLAG: u64 = 1 << 0;
    const IA32_FEATURE_CONTROL_ENABLE_VMX_OUTSIDE_SMX_FLAG: u64 = 1 << 2;

    let feature_control = rdmsr(x86::msr::IA32_FEATURE_CONTROL);
    if (feature_control & IA32_FEATURE_CONTROL_LOCK_BIT_FLAG) == 0 {
        wrmsr(
            x86::msr::IA32_FEATURE_CONTROL,
            feature_control
                | IA32_FEATURE_CONTROL_ENABLE_VMX_OUTSIDE_SMX_FLAG
                | IA32_FEATURE_CONTROL_LOCK_BIT_FLAG,
        );
    }
}

const fn selector_field(seg: SegmentRegister) -> u32 {
    match seg {
        SegmentRegister::Es => vmcs::guest::ES_SELECTOR,
        SegmentRegister::Cs => vmcs::guest::CS_SELECTOR,
        SegmentRegister::Ss => vmcs::guest::SS_SELECTOR,
        SegmentRegister::Ds => vmcs::guest::DS_SELECTOR,
        SegmentRegister::Fs => vmcs::guest::FS_SELECTOR,
        SegmentRegister::Gs => vmcs::guest::GS_SELECTOR,
        SegmentRegister::Ldtr => vmcs::guest::LDTR_SELECTOR,
        SegmentRegister::Tr => vmcs::guest::TR_SELECTOR,
    }
}

const fn base_field(seg: SegmentRegister) -> u32 {
    match seg {
        SegmentRegister::Es => vmcs::guest::ES_BASE,
        SegmentRegister::Cs => vmcs::guest::CS_BASE,
        SegmentRegister::Ss => vmcs::guest::SS_BASE,
        SegmentRegister::Ds => vmcs::guest::DS_BASE,
        SegmentRegister::Fs => vmcs::guest::FS_BASE,
        SegmentRegister::Gs => vmcs::guest::GS_BASE,
        SegmentRegister::Ldtr => vmcs::guest::LDTR_BASE,
        SegmentRegister::Tr => vmcs::guest::TR_BASE,
    }
}

const fn limit_field(seg: SegmentRegister) -> u32 {
    match seg {
        SegmentRegister::Es => vmcs::guest::ES_LIMIT,
        SegmentRegister::Cs => vmcs::guest::CS_LIMIT,
        SegmentRegister::Ss => vmcs::guest::SS_LIMIT,
        SegmentRegister::Ds => vmcs::guest::DS_LIMIT,
        SegmentRegister::Fs => vmcs::guest::FS_LIMIT,
        SegmentRegister::Gs => vmcs::guest::GS_LIMIT,
        SegmentRegister::Ldtr => vmcs::guest::LDTR_LIMIT,
        SegmentRegister::Tr => vmcs::guest::TR_LIMIT,
    }
}

const fn access_field(seg: SegmentRegister) -> u32 {
    match seg {
        SegmentRegister::Es => vmcs::guest::ES_ACCESS_RIGHTS,
        SegmentRegister::Cs => vmcs::guest::CS_ACCESS_RIGHTS,
        SegmentRegister::Ss => vmcs::guest::SS_ACCESS_RIGHTS,
        SegmentRegister::Ds => vmcs::guest::DS_ACCESS_RIGHTS,
        SegmentRegister::Fs => vmcs::guest::FS_ACCESS_RIGHTS,
        SegmentRegister::Gs => vmcs::guest::GS_ACCESS_RIGHTS,
        SegmentRegister::Ldtr => vmcs::guest::LDTR_ACCESS_RIGHTS,
        SegmentRegister::Tr => vmcs::guest::TR_ACCESS_RIGHTS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gp_register_encoding_covers_all_sixteen() {
        let mut regs = GuestRegisters::default();
        for index in 0..16u64 {
            regs.set_gp(index, 0x1000 + index);
        }
        assert_eq!(regs.rax, 0x1000);
        assert_eq!(regs.rcx, 0x1001);
        assert_eq!(regs.rdx, 0x1002);
        assert_eq!(regs.rbx, 0x1003);
        assert_eq!(regs.rsp, 0x1004);
        assert_eq!(regs.rbp, 0x1005);
        assert_eq!(regs.rsi, 0x1006);
        assert_eq!(regs.rdi, 0x1007);
        assert_eq!(regs.r15, 0x100f);
        for index in 0..16u64 {
            assert_eq!(regs.gp(index), 0x1000 + index);
        }
    }

    #[test]
    fn vcpu_starts_off_with_the_default_handler() {
        let vcpu = VCpu::new().unwrap();
        assert_eq!(vcpu.state(), VcpuState::Off);
        assert_eq!(vcpu.last_instruction_error(), InstructionError(0));
    }

    #[test]
    fn stack_top_is_the_launch_context() {
        let vcpu = VCpu::new().unwrap();
        let base = core::ptr::from_ref(&*vcpu) as u64;
        assert_eq!(vcpu.stack_top(), base + HOST_STACK_SIZE as u64);
        assert_eq!(
            core::ptr::from_ref(&vcpu.launch_context) as u64,
            vcpu.stack_top()
        );
        assert_eq!(
            core::ptr::from_ref(&vcpu.exit_context) as u64,
            vcpu.stack_top() + 0x90
        );
    }
}
