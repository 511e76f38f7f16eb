//! The module containing wrapper functions for x86 instructions.
//!
//! Those instructions provided by the `x86` crate as `unsafe` functions, due
//! to the fact that those require certain preconditions. The wrappers provided
//! by this module encapsulate those `unsafe`-ness since this crate always runs
//! at CPL0 and satisfies the preconditions. Instructions the `x86` crate does
//! not expose (string I/O, INVEPT/INVVPID, XSETBV, debug registers) are
//! implemented with inline assembly in the same spirit.

use core::arch::asm;
use x86::{
    controlregs::{Cr0, Cr4},
    current::rflags::RFlags,
    dtables::DescriptorTablePointer,
    segmentation::SegmentSelector,
    vmx::VmFail,
};

/// Returns the timestamp counter value.
pub(crate) fn rdtsc() -> u64 {
    // Safety: this crate runs at CPL0.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Returns the timestamp counter value and the contents of `IA32_TSC_AUX`.
pub(crate) fn rdtscp() -> (u64, u32) {
    let (high, low, aux): (u32, u32, u32);
    // Safety: this crate runs at CPL0.
    unsafe {
        asm!("rdtscp", out("edx") high, out("eax") low, out("ecx") aux, options(nomem, nostack));
    }
    ((u64::from(high) << 32) | u64::from(low), aux)
}

/// Reads an MSR.
pub(crate) fn rdmsr(msr: u32) -> u64 {
    // Safety: this crate runs at CPL0.
    unsafe { x86::msr::rdmsr(msr) }
}

/// Writes a value to an MSR.
pub(crate) fn wrmsr(msr: u32, value: u64) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::msr::wrmsr(msr, value) };
}

/// Reads the CR0 register.
pub(crate) fn cr0() -> Cr0 {
    // Safety: this crate runs at CPL0.
    unsafe { x86::controlregs::cr0() }
}

/// Writes a value to the CR0 register.
pub(crate) fn cr0_write(val: Cr0) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::controlregs::cr0_write(val) };
}

/// Writes a value to the CR2 register.
pub(crate) fn cr2_write(val: u64) {
    // Safety: this crate runs at CPL0.
    unsafe { asm!("mov cr2, {}", in(reg) val, options(nomem, nostack)) };
}

/// Reads the CR3 register.
pub(crate) fn cr3() -> u64 {
    // Safety: this crate runs at CPL0.
    unsafe { x86::controlregs::cr3() }
}

/// Writes a value to the CR3 register.
pub(crate) fn cr3_write(val: u64) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::controlregs::cr3_write(val) };
}

/// Reads the CR4 register.
pub(crate) fn cr4() -> Cr4 {
    // Safety: this crate runs at CPL0.
    unsafe { x86::controlregs::cr4() }
}

/// Writes a value to the CR4 register.
pub(crate) fn cr4_write(val: Cr4) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::controlregs::cr4_write(val) };
}

/// Reads the debug register `n` (0..=7).
pub(crate) fn read_dr(n: u64) -> u64 {
    let value: u64;
    // Safety: this crate runs at CPL0.
    unsafe {
        match n {
            0 => asm!("mov {}, dr0", out(reg) value, options(nomem, nostack)),
            1 => asm!("mov {}, dr1", out(reg) value, options(nomem, nostack)),
            2 => asm!("mov {}, dr2", out(reg) value, options(nomem, nostack)),
            3 => asm!("mov {}, dr3", out(reg) value, options(nomem, nostack)),
            6 => asm!("mov {}, dr6", out(reg) value, options(nomem, nostack)),
            _ => asm!("mov {}, dr7", out(reg) value, options(nomem, nostack)),
        }
    }
    value
}

/// Writes the debug register `n` (0..=7).
pub(crate) fn write_dr(n: u64, value: u64) {
    // Safety: this crate runs at CPL0.
    unsafe {
        match n {
            0 => asm!("mov dr0, {}", in(reg) value, options(nomem, nostack)),
            1 => asm!("mov dr1, {}", in(reg) value, options(nomem, nostack)),
            2 => asm!("mov dr2, {}", in(reg) value, options(nomem, nostack)),
            3 => asm!("mov dr3, {}", in(reg) value, options(nomem, nostack)),
            6 => asm!("mov dr6, {}", in(reg) value, options(nomem, nostack)),
            _ => asm!("mov dr7, {}", in(reg) value, options(nomem, nostack)),
        }
    }
}

/// Reads the RFLAGS register.
pub(crate) fn rflags() -> RFlags {
    x86::bits64::rflags::read()
}

/// Executes CPUID with the given leaf and subleaf.
pub(crate) fn cpuid(eax: u32, ecx: u32) -> x86::cpuid::CpuIdResult {
    x86::cpuid::cpuid!(eax, ecx)
}

/// Traps to the attached kernel debugger. Without one this is caught by the
/// host IDT like any other breakpoint.
pub(crate) fn debug_break() {
    // Safety: int3 is always executable at CPL0.
    unsafe { asm!("int3", options(nomem, nostack)) };
}

/// Halts execution of the processor.
pub(crate) fn hlt() {
    // Safety: this crate runs at CPL0.
    unsafe { x86::halt() };
}

/// Hints a spin-wait loop to the processor.
pub(crate) fn pause() {
    core::hint::spin_loop();
}

/// Writes back and invalidates internal caches.
pub(crate) fn wbinvd() {
    // Safety: this crate runs at CPL0.
    unsafe { asm!("wbinvd", options(nostack)) };
}

/// Writes `value` into the extended control register `xcr`.
pub(crate) fn xsetbv(xcr: u32, value: u64) {
    // Safety: this crate runs at CPL0. The guest already validated the
    // register number and value, or it would have received #GP natively.
    unsafe {
        asm!(
            "xsetbv",
            in("ecx") xcr,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
            options(nomem, nostack),
        );
    }
}

/// Reads 8-bits from an IO port.
pub(crate) fn inb(port: u16) -> u8 {
    // Safety: this crate runs at CPL0.
    unsafe { x86::io::inb(port) }
}

/// Writes 8-bits to an IO port.
pub(crate) fn outb(port: u16, val: u8) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::io::outb(port, val) };
}

/// Reads 16-bits from an IO port.
pub(crate) fn inw(port: u16) -> u16 {
    // Safety: this crate runs at CPL0.
    unsafe { x86::io::inw(port) }
}

/// Writes 16-bits to an IO port.
pub(crate) fn outw(port: u16, val: u16) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::io::outw(port, val) };
}

/// Reads 32-bits from an IO port.
pub(crate) fn inl(port: u16) -> u32 {
    // Safety: this crate runs at CPL0.
    unsafe { x86::io::inl(port) }
}

/// Writes 32-bits to an IO port.
pub(crate) fn outl(port: u16, val: u32) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::io::outl(port, val) };
}

/// Reads `count` items of `size` bytes (1, 2 or 4) from `port` into `buffer`.
///
/// # Safety
///
/// `buffer` must be writable for `count * size` bytes.
pub(crate) unsafe fn ins(port: u16, buffer: *mut u8, count: u64, size: u32) {
    unsafe {
        match size {
            1 => asm!("cld", "rep insb", in("dx") port, inout("rdi") buffer => _, inout("rcx") count => _),
            2 => asm!("cld", "rep insw", in("dx") port, inout("rdi") buffer => _, inout("rcx") count => _),
            _ => asm!("cld", "rep insd", in("dx") port, inout("rdi") buffer => _, inout("rcx") count => _),
        }
    }
}

/// Writes `count` items of `size` bytes (1, 2 or 4) from `buffer` to `port`.
///
/// # Safety
///
/// `buffer` must be readable for `count * size` bytes.
pub(crate) unsafe fn outs(port: u16, buffer: *const u8, count: u64, size: u32) {
    unsafe {
        match size {
            1 => asm!("cld", "rep outsb", in("dx") port, inout("rsi") buffer => _, inout("rcx") count => _),
            2 => asm!("cld", "rep outsw", in("dx") port, inout("rsi") buffer => _, inout("rcx") count => _),
            _ => asm!("cld", "rep outsd", in("dx") port, inout("rsi") buffer => _, inout("rcx") count => _),
        }
    }
}

/// Reads the GDTR.
pub(crate) fn sgdt(gdtr: &mut DescriptorTablePointer<u64>) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::dtables::sgdt(gdtr) };
}

/// Reads the IDTR register.
pub(crate) fn sidt(idtr: &mut DescriptorTablePointer<u64>) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::dtables::sidt(idtr) };
}

/// Loads the GDTR.
pub(crate) fn lgdt(gdtr: &DescriptorTablePointer<u64>) {
    // Safety: this crate runs at CPL0 and `gdtr` describes a live table.
    unsafe { x86::dtables::lgdt(gdtr) };
}

/// Loads the IDTR.
pub(crate) fn lidt(idtr: &DescriptorTablePointer<u64>) {
    // Safety: this crate runs at CPL0 and `idtr` describes a live table.
    unsafe { x86::dtables::lidt(idtr) };
}

/// Reads a segment register selected by `reg` (sreg order: ES, CS, SS, DS,
/// FS, GS, LDTR, TR).
pub(crate) fn read_segment_selector(reg: SegmentRegister) -> SegmentSelector {
    let raw: u16;
    // Safety: reading segment registers has no preconditions.
    unsafe {
        match reg {
            SegmentRegister::Es => asm!("mov {0:x}, es", out(reg) raw, options(nomem, nostack)),
            SegmentRegister::Cs => asm!("mov {0:x}, cs", out(reg) raw, options(nomem, nostack)),
            SegmentRegister::Ss => asm!("mov {0:x}, ss", out(reg) raw, options(nomem, nostack)),
            SegmentRegister::Ds => asm!("mov {0:x}, ds", out(reg) raw, options(nomem, nostack)),
            SegmentRegister::Fs => asm!("mov {0:x}, fs", out(reg) raw, options(nomem, nostack)),
            SegmentRegister::Gs => asm!("mov {0:x}, gs", out(reg) raw, options(nomem, nostack)),
            SegmentRegister::Ldtr => asm!("sldt {0:x}", out(reg) raw, options(nomem, nostack)),
            SegmentRegister::Tr => asm!("str {0:x}", out(reg) raw, options(nomem, nostack)),
        }
    }
    SegmentSelector::from_raw(raw)
}

/// The eight segment registers in the order VMCS fields are laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentRegister {
    /// ES
    Es,
    /// CS
    Cs,
    /// SS
    Ss,
    /// DS
    Ds,
    /// FS
    Fs,
    /// GS
    Gs,
    /// LDTR
    Ldtr,
    /// TR
    Tr,
}

/// The wrapper of the VMXON instruction.
pub(crate) fn vmxon(pa: u64) -> Result<(), VmFail> {
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmxon(pa) }
}

/// The wrapper of the VMXOFF instruction.
pub(crate) fn vmxoff() -> Result<(), VmFail> {
    // Safety: this crate runs at CPL0 in VMX root operation.
    unsafe { x86::bits64::vmx::vmxoff() }
}

/// The wrapper of the VMCLEAR instruction.
pub(crate) fn vmclear(pa: u64) -> Result<(), VmFail> {
    // Safety: this crate runs at CPL0 in VMX root operation.
    unsafe { x86::bits64::vmx::vmclear(pa) }
}

/// The wrapper of the VMPTRLD instruction.
pub(crate) fn vmptrld(pa: u64) -> Result<(), VmFail> {
    // Safety: this crate runs at CPL0 in VMX root operation.
    unsafe { x86::bits64::vmx::vmptrld(pa) }
}

/// The wrapper of the VMPTRST instruction.
pub(crate) fn vmptrst() -> u64 {
    // Safety: this crate runs at CPL0 in VMX root operation.
    unsafe { x86::bits64::vmx::vmptrst() }.map_or(0, |pa| pa as u64)
}

/// The wrapper of the VMREAD instruction. Returns zero on error.
pub(crate) fn vmread(field: u32) -> u64 {
    // Safety: this crate runs at CPL0 in VMX root operation.
    unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0)
}

/// The wrapper of the VMWRITE instruction.
pub(crate) fn vmwrite<T: Into<u64>>(field: u32, val: T)
where
    u64: From<T>,
{
    // Safety: this crate runs at CPL0 in VMX root operation.
    let result = unsafe { x86::bits64::vmx::vmwrite(field, u64::from(val)) };
    debug_assert!(result.is_ok(), "VMWRITE({field:#x}) failed");
}

/// The wrapper of the VMLAUNCH instruction. Returning at all means failure.
pub(crate) fn vmlaunch() -> Result<(), VmFail> {
    // Safety: this crate runs at CPL0 in VMX root operation.
    unsafe { x86::bits64::vmx::vmlaunch() }
}

/// The wrapper of the VMCALL instruction, the guest side of the hypercall
/// protocol.
pub(crate) fn vmcall(rcx: u64, rdx: u64, r8: u64, r9: u64) -> u64 {
    let result: u64;
    // Safety: causes VM-exit from non-root operation; raises #UD without a
    // hypervisor, which callers accept.
    unsafe {
        asm!(
            "vmcall",
            inout("rcx") rcx => _,
            in("rdx") rdx,
            in("r8") r8,
            in("r9") r9,
            lateout("rax") result,
        );
    }
    result
}

/// The type of invalidation the INVEPT instruction performs.
///
/// See: 28.4.3.1 Operations that Invalidate Cached Mappings
#[derive(Clone, Copy)]
#[repr(u64)]
pub(crate) enum InveptType {
    /// Invalidates mappings associated with a single EPTP.
    SingleContext = 1,
    /// Invalidates mappings associated with all EPTPs.
    AllContexts = 2,
}

/// The structure to specify the effect of the INVEPT instruction.
///
/// See: Figure 31-1. INVEPT Descriptor
#[repr(C)]
struct InveptDescriptor {
    eptp: u64,
    _reserved: u64,
}
const _: () = assert!(size_of::<InveptDescriptor>() == 16);

/// The wrapper of the INVEPT instruction.
pub(crate) fn invept(invalidation: InveptType, eptp: u64) {
    let descriptor = InveptDescriptor { eptp, _reserved: 0 };
    // Safety: this crate runs at CPL0 in VMX root operation.
    unsafe {
        asm!(
            "invept {}, [{}]",
            in(reg) invalidation as u64,
            in(reg) &descriptor,
            options(nostack),
        );
    }
}

/// The type of invalidation the INVVPID instruction performs.
///
/// See: 28.4.3.3 Guidelines for Use of the INVVPID Instruction
#[derive(Clone, Copy)]
#[repr(u64)]
enum InvvpidType {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContexts = 2,
    SingleContextRetainingGlobals = 3,
}

/// The structure to specify the effect of the INVVPID instruction.
///
/// See: Figure 31-2. INVVPID Descriptor
#[repr(C)]
struct InvvpidDescriptor {
    vpid: u16,
    _reserved: [u16; 3],
    linear_address: u64,
}
const _: () = assert!(size_of::<InvvpidDescriptor>() == 16);

fn invvpid(invalidation: InvvpidType, vpid: u16, linear_address: u64) {
    let descriptor = InvvpidDescriptor {
        vpid,
        _reserved: [0; 3],
        linear_address,
    };
    // Safety: this crate runs at CPL0 in VMX root operation.
    unsafe {
        asm!(
            "invvpid {}, [{}]",
            in(reg) invalidation as u64,
            in(reg) &descriptor,
            options(nostack),
        );
    }
}

/// Invalidates mappings for a single linear address tagged with `vpid`.
pub(crate) fn invvpid_individual_address(vpid: u16, linear_address: u64) {
    invvpid(InvvpidType::IndividualAddress, vpid, linear_address);
}

/// Invalidates all mappings tagged with `vpid`.
pub(crate) fn invvpid_single_context(vpid: u16) {
    invvpid(InvvpidType::SingleContext, vpid, 0);
}

/// Invalidates all mappings regardless of VPID.
pub(crate) fn invvpid_all_contexts() {
    invvpid(InvvpidType::AllContexts, 0, 0);
}

/// Invalidates mappings tagged with `vpid` except global translations.
pub(crate) fn invvpid_single_context_retaining_globals(vpid: u16) {
    invvpid(InvvpidType::SingleContextRetainingGlobals, vpid, 0);
}
