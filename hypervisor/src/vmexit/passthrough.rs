//! The pass-through emulation core.
//!
//! Every function here emulates one intercepted operation such that the
//! guest observes exactly what bare metal would have produced: results land
//! in the guest register context or guest VMCS fields, TLB maintenance is
//! mirrored onto the guest's VPID, and illegal guest requests are answered
//! with the architectural exception instead of being performed.
//!
//! All references to external resources (denoted with "See:") refers to
//! "Intel 64 and IA-32 Architectures Software Developer's Manual" unless
//! otherwise stated.

use super::{dispatch, ExitHandler, VMCALL_BREAKPOINT_ID, VMCALL_TERMINATE_ID};
use crate::{
    vcpu::{VCpu, VPID},
    vmx::{
        adjust_dr6, adjust_dr7, gdtr_idtr_instruction, ldtr_tr_instruction, mov_cr_access, Event,
        ExceptionVector, InfoGdtrIdtrAccess, InfoInvalidate, InfoLdtrTrAccess, InterruptType,
        QualificationIo, QualificationMovCr, QualificationMovDr,
    },
    x86_instructions::{
        cpuid as cpuid_instruction, cr2_write, cr3, cr3_write, debug_break, hlt, inb, inl, ins,
        invvpid_individual_address, invvpid_single_context,
        invvpid_single_context_retaining_globals, inw, outb, outl, outs, outw, pause, rdmsr,
        rdtsc as rdtsc_instruction, rdtscp as rdtscp_instruction, read_dr, wbinvd, write_dr,
        wrmsr, xsetbv, SegmentRegister,
    },
};

/// The handler that takes every [`ExitHandler`] default: a guest under it
/// behaves as if it ran on bare metal.
pub struct PassthroughHandler;

impl ExitHandler for PassthroughHandler {
    fn handle(&self, vp: &mut VCpu) {
        dispatch(self, vp);
    }
}

/// Temporarily runs on the guest's page tables so guest virtual addresses
/// resolve; restores the previous CR3 on every exit path.
struct Cr3Guard {
    saved: u64,
}

impl Cr3Guard {
    fn new(guest_cr3: u64) -> Self {
        let saved = cr3();
        cr3_write(guest_cr3);
        Self { saved }
    }
}

impl Drop for Cr3Guard {
    fn drop(&mut self) {
        cr3_write(self.saved);
    }
}

/// Injects #UD and leaves the guest RIP at the faulting instruction.
pub(crate) fn inject_ud(vp: &mut VCpu) {
    vp.inject(Event::exception(ExceptionVector::InvalidOpcode));
    vp.suppress_rip_adjust();
}

/// Injects #GP(0) and leaves the guest RIP at the faulting instruction.
pub(crate) fn inject_gp(vp: &mut VCpu) {
    vp.inject(Event::exception_with_code(ExceptionVector::GeneralProtection, 0));
    vp.suppress_rip_adjust();
}

/// Reflects an intercepted exception or NMI back into the guest.
///
/// #PF additionally latches the faulting address into the real CR2 (the
/// guest's handler reads the register directly), and #GP gets a chance to
/// be recognized as a VMware backdoor port access first.
pub(crate) fn exception_or_nmi(vp: &mut VCpu) {
    const GENERAL_PROTECTION: u32 = 13;
    const PAGE_FAULT: u32 = 14;

    let interrupt = vp.exit_interruption_info();
    let error_code = vp.exit_interruption_error_code();

    if interrupt.interrupt_type() == InterruptType::HardwareException {
        match interrupt.vector() {
            GENERAL_PROTECTION => {
                #[cfg(feature = "vmware")]
                if vmware::try_emulate_io(vp) {
                    return;
                }
            }
            PAGE_FAULT => cr2_write(vp.exit_qualification()),
            _ => {}
        }
    }

    // Reinject the exact same event. The entry instruction length controls
    // the reported RIP, so the regular adjustment must not run.
    vp.inject(Event::from_exit(interrupt, error_code));
    vp.suppress_rip_adjust();
}

/// Triple faults are unrecoverable; park the processor.
pub(crate) fn triple_fault(vp: &mut VCpu) {
    let _ = vp;
    loop {
        pause();
        hlt();
    }
}

/// Executes CPUID on the host with the guest's leaf/subleaf.
pub(crate) fn cpuid(vp: &mut VCpu) {
    let ctx = vp.exit_context_mut();
    let result = cpuid_instruction(ctx.rax as u32, ctx.rcx as u32);
    ctx.rax = u64::from(result.eax);
    ctx.rbx = u64::from(result.ebx);
    ctx.rcx = u64::from(result.ecx);
    ctx.rdx = u64::from(result.edx);
}

/// INVD without the write-back would throw away dirty cache lines of the
/// running host OS. WBINVD is the superset every other hypervisor settles
/// on, and the kernel never executes INVD on this path anyway.
pub(crate) fn invd(vp: &mut VCpu) {
    let _ = vp;
    wbinvd();
}

/// Emulates INVLPG as a VPID-tagged single-address invalidation. Running
/// the real INVLPG would needlessly drop host TLB entries.
pub(crate) fn invlpg(vp: &mut VCpu) {
    invvpid_individual_address(VPID, vp.exit_qualification());
}

/// Executes RDTSC on the host and routes the result to EDX:EAX.
pub(crate) fn rdtsc(vp: &mut VCpu) {
    let tsc = rdtsc_instruction();
    let ctx = vp.exit_context_mut();
    ctx.rax = tsc & 0xffff_ffff;
    ctx.rdx = tsc >> 32;
}

/// Executes RDTSCP on the host; IA32_TSC_AUX lands in ECX.
pub(crate) fn rdtscp(vp: &mut VCpu) {
    let (tsc, aux) = rdtscp_instruction();
    let ctx = vp.exit_context_mut();
    ctx.rax = tsc & 0xffff_ffff;
    ctx.rdx = tsc >> 32;
    ctx.rcx = u64::from(aux);
}

/// The hypercall surface: terminate (CPL 0 only) and debugger break.
/// Anything else is answered with #UD exactly like on a machine without
/// this hypervisor.
pub(crate) fn vmcall_exit(vp: &mut VCpu) {
    let selector = vp.exit_context().rcx;
    if selector == VMCALL_TERMINATE_ID && vp.guest_cpl() == 0 {
        vp.terminate();
    } else if selector == VMCALL_BREAKPOINT_ID {
        debug_break();
    } else {
        inject_ud(vp);
    }
}

/// Emulates MOV to/from control registers, CLTS and LMSW.
pub(crate) fn mov_cr(vp: &mut VCpu) {
    const CR0_TASK_SWITCHED: u64 = 1 << 3;
    const CR4_PAGE_GLOBAL_ENABLE: u64 = 1 << 7;
    const CR4_PCID_ENABLE: u64 = 1 << 17;
    const CR3_PCID_INVALIDATE: u64 = 1 << 63;

    let qualification = QualificationMovCr(vp.exit_qualification());
    let register = qualification.gp_register();

    match qualification.access_type() {
        mov_cr_access::MOV_TO_CR => {
            let value = vp.exit_context().gp(register);
            match qualification.cr_number() {
                0 => {
                    vp.set_guest_cr0(value);
                    vp.set_cr0_shadow(value);
                }
                3 => {
                    // Bit 63 selects whether TLB entries survive; it is not
                    // part of the register value itself.
                    // See: Vol2B[MOV-Move to/from Control Registers]
                    let mut value = value;
                    if vp.guest_cr4() & CR4_PCID_ENABLE != 0 {
                        value &= !CR3_PCID_INVALIDATE;
                    }
                    vp.set_guest_cr3(value);

                    // MOV to CR3 flushes non-global translations; mirror it
                    // onto the guest's VPID.
                    // See: 28.3.3.3 Guidelines for Use of the INVVPID
                    //      Instruction
                    invvpid_single_context_retaining_globals(VPID);
                }
                4 => {
                    // Flipping PGE flushes everything including globals.
                    let pge_changed =
                        (value ^ vp.guest_cr4()) & CR4_PAGE_GLOBAL_ENABLE != 0;
                    if pge_changed {
                        invvpid_single_context(VPID);
                    }
                    vp.set_guest_cr4(value);
                    vp.set_cr4_shadow(value);
                }
                8 => { /* TPR virtualization not provided */ }
                _ => {}
            }
        }

        mov_cr_access::MOV_FROM_CR => match qualification.cr_number() {
            3 => {
                let value = vp.guest_cr3();
                vp.exit_context_mut().set_gp(register, value);
            }
            8 => { /* TPR virtualization not provided */ }
            _ => {}
        },

        mov_cr_access::CLTS => {
            let cr0 = vp.guest_cr0() & !CR0_TASK_SWITCHED;
            vp.set_guest_cr0(cr0);
            vp.set_cr0_shadow(cr0);
        }

        mov_cr_access::LMSW => {
            // Only CR0[3:0] is written, and LMSW can never clear CR0.PE once
            // protected mode is entered.
            // See: Vol2A[LMSW-Load Machine Status Word]
            let msw = qualification.lmsw_source_data();
            let mut cr0 = vp.guest_cr0();
            cr0 &= !0b1110;
            cr0 |= msw & 0b1111;
            vp.set_guest_cr0(cr0);
            vp.set_cr0_shadow(cr0);
        }

        _ => {}
    }
}

/// Emulates MOV to/from debug registers.
///
/// MOV DR exits take priority over the #GP and #UD the instruction would
/// normally raise, so those checks have to be replayed here first.
/// See: 26.1.3 Instructions That Cause VM Exits Conditionally
pub(crate) fn mov_dr(vp: &mut VCpu) {
    const CR4_DEBUGGING_EXTENSIONS: u64 = 1 << 3;
    const DR6_DEBUG_REGISTER_ACCESS_DETECTED: u64 = 1 << 13;
    const DR7_GENERAL_DETECT: u64 = 1 << 13;

    let qualification = QualificationMovDr(vp.exit_qualification());
    let register = qualification.gp_register();
    let mut dr_number = qualification.dr_number();

    // Writes to debug registers are CPL 0 only.
    if vp.guest_cpl() != 0 {
        inject_gp(vp);
        return;
    }

    // DR4/DR5 raise #UD with CR4.DE set and alias DR6/DR7 otherwise.
    // See: Vol3B[17.2.2 Debug Registers DR4 and DR5]
    if dr_number == 4 || dr_number == 5 {
        if vp.guest_cr4() & CR4_DEBUGGING_EXTENSIONS != 0 {
            vp.inject(Event::exception(ExceptionVector::InvalidOpcode));
            vp.suppress_rip_adjust();
            return;
        }
        dr_number += 2;
    }

    // DR7.GD arms a #DB on any debug-register access, with DR6.BD set and
    // GD cleared on delivery.
    // See: Vol3B[17.2.4 Debug Control Register (DR7)]
    if vp.guest_dr7() & DR7_GENERAL_DETECT != 0 {
        let mut dr6 = read_dr(6);
        dr6 &= !0b1111;
        dr6 |= DR6_DEBUG_REGISTER_ACCESS_DETECTED;
        write_dr(6, adjust_dr6(dr6));

        vp.set_guest_dr7(vp.guest_dr7() & !DR7_GENERAL_DETECT);
        vp.inject(Event::exception(ExceptionVector::Debug));
        vp.suppress_rip_adjust();
        return;
    }

    if !qualification.direction_from_dr() {
        let value = vp.exit_context().gp(register);

        // The upper 32 bits of DR6/DR7 must be written as zero.
        // See: Vol3B[17.2.6 Debug Registers and Intel 64 Processors]
        if (dr_number == 6 || dr_number == 7) && (value >> 32) != 0 {
            inject_gp(vp);
            return;
        }

        match dr_number {
            0..=3 => write_dr(dr_number, value),
            6 => write_dr(6, adjust_dr6(value)),
            7 => vp.set_guest_dr7(adjust_dr7(value)),
            _ => {}
        }
    } else {
        let value = match dr_number {
            0..=3 | 6 => read_dr(dr_number),
            7 => vp.guest_dr7(),
            _ => return,
        };
        vp.exit_context_mut().set_gp(register, value);
    }
}

/// Emulates IN/OUT in all forms: scalar and string, REP-prefixed or not.
///
/// The CPL and IOPL checks are not replayed here: a disallowed access
/// raises #GP instead of this exit in the first place.
/// See: Vol3C[26.1.1 Relative Priority of Faults and VM Exits]
pub(crate) fn io_instruction(vp: &mut VCpu) {
    let qualification = QualificationIo(vp.exit_qualification());

    #[cfg(feature = "vmware")]
    {
        // The outer VMware hypervisor inspects the full register file at
        // the moment of the port access, so the transaction must run with
        // every guest GPR live, not just RAX.
        io_transact(&qualification, vp.exit_context_mut());
    }

    #[cfg(not(feature = "vmware"))]
    {
        let port = qualification.port_number() as u16;
        let size = qualification.size_of_access() as u32 + 1;
        let count = if qualification.rep_prefixed() {
            vp.exit_context().rcx & 0xffff_ffff
        } else {
            1
        };

        let ctx = vp.exit_context_mut();
        if qualification.access_in() {
            if qualification.string_instruction() {
                // String input always targets [RDI].
                // Safety: the guest supplied the buffer; a bad pointer
                // faults in the guest's context exactly like on hardware.
                unsafe { ins(port, ctx.rdi as *mut u8, count, size) };
            } else {
                match size {
                    1 => ctx.rax = (ctx.rax & !0xff) | u64::from(inb(port)),
                    2 => ctx.rax = (ctx.rax & !0xffff) | u64::from(inw(port)),
                    _ => ctx.rax = u64::from(inl(port)),
                }
            }
        } else if qualification.string_instruction() {
            // String output always reads from [RSI].
            // Safety: as above.
            unsafe { outs(port, ctx.rsi as *const u8, count, size) };
        } else {
            match size {
                1 => outb(port, ctx.rax as u8),
                2 => outw(port, ctx.rax as u16),
                _ => outl(port, ctx.rax as u32),
            }
        }

        string_epilogue(&qualification, ctx, count, size);
    }
}

/// Advances RDI/RSI by the transferred bytes according to RFLAGS.DF and
/// clears ECX for REP forms.
fn string_epilogue(qualification: &QualificationIo, ctx: &mut crate::vcpu::GuestRegisters, count: u64, size: u32) {
    const RFLAGS_DIRECTION: u64 = 1 << 10;

    if !qualification.string_instruction() {
        return;
    }

    let delta = count * u64::from(size);
    let backwards = ctx.rflags & RFLAGS_DIRECTION != 0;
    let register = if qualification.access_in() {
        &mut ctx.rdi
    } else {
        &mut ctx.rsi
    };
    if backwards {
        *register = register.wrapping_sub(delta);
    } else {
        *register = register.wrapping_add(delta);
    }

    if qualification.rep_prefixed() {
        ctx.rcx = 0;
    }
}

/// Performs a port transaction with the guest's general purpose registers
/// live in the hardware registers, so an outer hypervisor watching the port
/// (the VMware backdoor) sees the state the guest set up.
#[cfg(feature = "vmware")]
pub(crate) fn io_transact(qualification: &QualificationIo, ctx: &mut crate::vcpu::GuestRegisters) {
    use core::arch::asm;

    let size = qualification.size_of_access() as u32 + 1;
    let count = if qualification.rep_prefixed() {
        ctx.rcx & 0xffff_ffff
    } else {
        1
    };

    if qualification.string_instruction() {
        let port = qualification.port_number() as u16;
        if qualification.access_in() {
            // Safety: guest-supplied buffer, as in `io_instruction`.
            unsafe { ins(port, ctx.rdi as *mut u8, count, size) };
        } else {
            // Safety: as above.
            unsafe { outs(port, ctx.rsi as *const u8, count, size) };
        }
    } else {
        // RBX is reserved by the compiler, so it is swapped in and out
        // around the port access by hand.
        macro_rules! transact {
            ($instruction:literal) => {
                // Safety: this crate runs at CPL0.
                unsafe {
                    asm!(
                        "xchg rbx, {guest_rbx}",
                        $instruction,
                        "xchg rbx, {guest_rbx}",
                        guest_rbx = inout(reg) ctx.rbx,
                        inout("rax") ctx.rax,
                        inout("rcx") ctx.rcx,
                        inout("rdx") ctx.rdx,
                        inout("rsi") ctx.rsi,
                        inout("rdi") ctx.rdi,
                    )
                }
            };
        }
        match (qualification.access_in(), size) {
            (true, 1) => transact!("in al, dx"),
            (true, 2) => transact!("in ax, dx"),
            (true, _) => transact!("in eax, dx"),
            (false, 1) => transact!("out dx, al"),
            (false, 2) => transact!("out dx, ax"),
            (false, _) => transact!("out dx, eax"),
        }
    }

    string_epilogue(qualification, ctx, count, size);
}

/// Emulates RDMSR. DEBUGCTL and the FS/GS bases live in the guest VMCS
/// while the guest runs; everything else reads the physical MSR.
pub(crate) fn rdmsr_exit(vp: &mut VCpu) {
    let msr = vp.exit_context().rcx as u32;
    let value = match msr {
        x86::msr::IA32_DEBUGCTL => vp.guest_debugctl(),
        x86::msr::IA32_FS_BASE => vp.guest_segment_base(SegmentRegister::Fs),
        x86::msr::IA32_GS_BASE => vp.guest_segment_base(SegmentRegister::Gs),
        _ => rdmsr(msr),
    };
    let ctx = vp.exit_context_mut();
    ctx.rax = value & 0xffff_ffff;
    ctx.rdx = value >> 32;
}

/// Emulates WRMSR, the counterpart of [`rdmsr_exit`].
pub(crate) fn wrmsr_exit(vp: &mut VCpu) {
    let ctx = vp.exit_context();
    let msr = ctx.rcx as u32;
    let value = (ctx.rax & 0xffff_ffff) | (ctx.rdx << 32);
    match msr {
        x86::msr::IA32_DEBUGCTL => vp.set_guest_debugctl(value),
        x86::msr::IA32_FS_BASE => vp.set_guest_segment_base(SegmentRegister::Fs, value),
        x86::msr::IA32_GS_BASE => vp.set_guest_segment_base(SegmentRegister::Gs, value),
        _ => wrmsr(msr, value),
    }
}

/// Emulates SGDT/SIDT/LGDT/LIDT against the guest VMCS descriptor-table
/// fields.
///
/// Stores use the 10-byte long-mode layout when the guest CS is 64-bit and
/// the 6-byte legacy layout otherwise (SGDT/SIDT are unprivileged and WoW64
/// processes do execute them). Loads only happen from 64-bit kernel code.
pub(crate) fn gdtr_idtr_access(vp: &mut VCpu) {
    let info = InfoGdtrIdtrAccess(vp.exit_instruction_info());
    let operand = vp.exit_instruction_guest_va();
    let long_mode = vp.guest_cs_long_mode();

    let _guard = Cr3Guard::new(vp.guest_cr3());

    match info.instruction() {
        gdtr_idtr_instruction::SGDT | gdtr_idtr_instruction::SIDT => {
            let (base, limit) = if info.instruction() == gdtr_idtr_instruction::SGDT {
                (vp.guest_gdtr_base(), vp.guest_gdtr_limit())
            } else {
                (vp.guest_idtr_base(), vp.guest_idtr_limit())
            };
            // Safety: the guest supplied the operand; a bad pointer faults
            // in the guest's context exactly like on hardware.
            unsafe {
                core::ptr::write_unaligned(operand.cast::<u16>(), limit as u16);
                if long_mode {
                    core::ptr::write_unaligned(operand.add(2).cast::<u64>(), base);
                } else {
                    core::ptr::write_unaligned(operand.add(2).cast::<u32>(), base as u32);
                }
            }
        }
        lgdt_or_lidt => {
            // Safety: as above.
            let (limit, base) = unsafe {
                (
                    core::ptr::read_unaligned(operand.cast::<u16>()),
                    core::ptr::read_unaligned(operand.add(2).cast::<u64>()),
                )
            };
            if lgdt_or_lidt == gdtr_idtr_instruction::LGDT {
                vp.set_guest_gdtr(base, u32::from(limit));
            } else {
                vp.set_guest_idtr(base, u32::from(limit));
            }
        }
    }
}

/// Emulates SLDT/STR/LLDT/LTR against the guest VMCS selector fields. The
/// operand is a general purpose register or a 16-bit memory location.
pub(crate) fn ldtr_tr_access(vp: &mut VCpu) {
    const TSS_BUSY_FLAG: u8 = 0b10;

    let info = InfoLdtrTrAccess(vp.exit_instruction_info());

    match info.instruction() {
        ldtr_tr_instruction::SLDT => {
            let selector = vp.guest_segment_selector(SegmentRegister::Ldtr);
            write_selector_operand(vp, &info, selector);
        }
        ldtr_tr_instruction::STR => {
            let selector = vp.guest_segment_selector(SegmentRegister::Tr);
            write_selector_operand(vp, &info, selector);
        }
        ldtr_tr_instruction::LLDT => {
            let selector = read_selector_operand(vp, &info);
            vp.set_guest_segment_selector(SegmentRegister::Ldtr, selector);
        }
        _ => {
            // LTR also marks the referenced TSS descriptor busy without
            // switching to it.
            // See: Vol2A[LTR-Load Task Register]
            let selector = read_selector_operand(vp, &info);
            vp.set_guest_segment_selector(SegmentRegister::Tr, selector);

            let descriptor =
                (vp.guest_gdtr_base() + u64::from(selector >> 3) * 8) as *mut u8;
            let _guard = Cr3Guard::new(vp.guest_cr3());
            // Safety: the selector was accepted by the guest kernel; the
            // descriptor lies within its GDT.
            unsafe { *descriptor.add(5) |= TSS_BUSY_FLAG };
        }
    }
}

fn read_selector_operand(vp: &mut VCpu, info: &InfoLdtrTrAccess) -> u16 {
    if info.register_access() {
        vp.exit_context().gp(u64::from(info.register_1())) as u16
    } else {
        let operand = vp.exit_instruction_guest_va();
        let _guard = Cr3Guard::new(vp.guest_cr3());
        // Safety: guest-supplied operand, as elsewhere in this module.
        unsafe { core::ptr::read_unaligned(operand.cast::<u16>()) }
    }
}

fn write_selector_operand(vp: &mut VCpu, info: &InfoLdtrTrAccess, selector: u16) {
    if info.register_access() {
        // Stores to a register only replace the low word.
        let register = u64::from(info.register_1());
        let ctx = vp.exit_context_mut();
        let merged = (ctx.gp(register) & !0xffff) | u64::from(selector);
        ctx.set_gp(register, merged);
    } else {
        let operand = vp.exit_instruction_guest_va();
        let _guard = Cr3Guard::new(vp.guest_cr3());
        // Safety: guest-supplied operand, as elsewhere in this module.
        unsafe { core::ptr::write_unaligned(operand.cast::<u16>(), selector) };
    }
}

/// Emulates INVPCID by replaying its #GP checks and mirroring the requested
/// invalidation onto the guest's VPID. Type 1 over-invalidates (there is no
/// per-[PCID, VPID] invalidation), which costs performance, not
/// correctness.
pub(crate) fn invpcid(vp: &mut VCpu) {
    const CR4_PCID_ENABLE: u64 = 1 << 17;
    const TYPE_INDIVIDUAL_ADDRESS: u64 = 0;
    const TYPE_SINGLE_CONTEXT: u64 = 1;
    const TYPE_ALL_CONTEXTS: u64 = 2;
    const TYPE_ALL_CONTEXTS_RETAINING_GLOBALS: u64 = 3;

    let info = InfoInvalidate(vp.exit_instruction_info());
    let invalidation_type = vp.exit_context().gp(u64::from(info.register_2()));

    // #GP(0) for INVPCID_TYPE > 3.
    // See: Vol2A[INVPCID-Invalidate Process-Context Identifier]
    if invalidation_type > TYPE_ALL_CONTEXTS_RETAINING_GLOBALS {
        inject_gp(vp);
        return;
    }

    let operand = vp.exit_instruction_guest_va();
    let (low, linear_address) = {
        let _guard = Cr3Guard::new(vp.guest_cr3());
        // Safety: guest-supplied operand, as elsewhere in this module.
        unsafe {
            (
                core::ptr::read_unaligned(operand.cast::<u64>()),
                core::ptr::read_unaligned(operand.add(8).cast::<u64>()),
            )
        }
    };
    let pcid = low & 0xfff;

    // #GP(0) when descriptor bits 63:12 are not zero.
    if low & !0xfff != 0 {
        inject_gp(vp);
        return;
    }

    // #GP(0) when a PCID is given while CR4.PCIDE is clear.
    if (invalidation_type == TYPE_INDIVIDUAL_ADDRESS || invalidation_type == TYPE_SINGLE_CONTEXT)
        && pcid != 0
        && vp.guest_cr4() & CR4_PCID_ENABLE == 0
    {
        inject_gp(vp);
        return;
    }

    match invalidation_type {
        TYPE_INDIVIDUAL_ADDRESS => invvpid_individual_address(VPID, linear_address),
        TYPE_SINGLE_CONTEXT | TYPE_ALL_CONTEXTS => invvpid_single_context(VPID),
        _ => invvpid_single_context_retaining_globals(VPID),
    }
}

/// Executes WBINVD on the host.
pub(crate) fn wbinvd_exit(vp: &mut VCpu) {
    let _ = vp;
    wbinvd();
}

/// Executes XSETBV on the host with the guest-provided XCR index and value.
pub(crate) fn xsetbv_exit(vp: &mut VCpu) {
    let ctx = vp.exit_context();
    xsetbv(ctx.rcx as u32, (ctx.rdx << 32) | (ctx.rax & 0xffff_ffff));
}

#[cfg(feature = "vmware")]
pub(crate) mod vmware {
    //! The VMware I/O backdoor workaround.
    //!
    //! VMware Tools talks to its host through IN/OUT on ports 0x5658/0x5659
    //! from user mode. Under this hypervisor the access raises #GP (the TSS
    //! I/O permission map does not reach the handler); recognizing the
    //! instruction and performing the access from root mode keeps the
    //! tooling alive.

    use super::{io_transact, Cr3Guard};
    use crate::{vcpu::VCpu, vmx::QualificationIo};

    /// Decodes the instruction at the guest RIP; when it is an I/O
    /// instruction, performs it and reports true.
    ///
    /// The guest page tables stay live for the whole transaction: both the
    /// instruction bytes and any string operand are guest virtual
    /// addresses.
    pub(crate) fn try_emulate_io(vp: &mut VCpu) -> bool {
        let _guard = Cr3Guard::new(vp.guest_cr3());
        let Some(qualification) =
            decode_io_instruction(vp.exit_context().rip as *const u8, vp.exit_context().rdx)
        else {
            return false;
        };
        io_transact(&qualification, vp.exit_context_mut());
        true
    }

    /// Rebuilds an I/O exit qualification from the instruction bytes. Only
    /// the DX-addressed and string forms exist at this opcode range.
    fn decode_io_instruction(rip: *const u8, rdx: u64) -> Option<QualificationIo> {
        const OP_PREFIX_SIZE: u8 = 0x66;
        const OP_PREFIX_REP: u8 = 0xf3;
        const OP_INSB: u8 = 0x6c;
        const OP_INSD: u8 = 0x6d;
        const OP_OUTSB: u8 = 0x6e;
        const OP_OUTSD: u8 = 0x6f;
        const OP_IN_AL_DX: u8 = 0xec;
        const OP_IN_EAX_DX: u8 = 0xed;
        const OP_OUT_DX_AL: u8 = 0xee;
        const OP_OUT_DX_EAX: u8 = 0xef;

        let mut rep_prefixed = false;
        let mut size_adjust = 0u64;
        let mut cursor = rip;
        // Safety: the CR3 guard installed by the caller makes the guest RIP
        // readable; the #GP was synchronous so the code page is resident.
        let opcode = loop {
            match unsafe { *cursor } {
                OP_PREFIX_REP => rep_prefixed = true,
                OP_PREFIX_SIZE => size_adjust = 2,
                other => break other,
            }
            cursor = unsafe { cursor.add(1) };
        };

        let (input, string, size) = match opcode {
            OP_INSB => (true, true, 1),
            OP_INSD => (true, true, 4 - size_adjust),
            OP_OUTSB => (false, true, 1),
            OP_OUTSD => (false, true, 4 - size_adjust),
            OP_IN_AL_DX => (true, false, 1),
            OP_IN_EAX_DX => (true, false, 4 - size_adjust),
            OP_OUT_DX_AL => (false, false, 1),
            OP_OUT_DX_EAX => (false, false, 4 - size_adjust),
            _ => return None,
        };

        let mut raw = size - 1;
        if input {
            raw |= 1 << 3;
        }
        if string {
            raw |= 1 << 4;
        }
        if rep_prefixed {
            raw |= 1 << 5;
        }
        raw |= (rdx & 0xffff) << 16;
        Some(QualificationIo(raw))
    }
}
