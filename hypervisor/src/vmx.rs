//! The module containing strongly-typed wrappers for VMX architectural
//! structures: exit reasons, exit qualifications, instruction information,
//! event (interrupt) information, capability MSR layouts, and the `adjust`
//! family that masks desired register values against what the processor
//! actually supports.
//!
//! All references to external resources (denoted with "See:") refers to
//! "Intel 64 and IA-32 Architectures Software Developer's Manual Volume 3"
//! unless otherwise stated.

use crate::x86_instructions::rdmsr;
use bitfield::bitfield;

/// The number of basic VM-exit reasons.
///
/// See: Table C-1. Basic Exit Reasons
pub const EXIT_REASON_COUNT: usize = 65;

/// Basic VM-exit reasons 0..=64.
///
/// See: Table C-1. Basic Exit Reasons
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum ExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    IoSmi = 5,
    Smi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    ExecuteCpuid = 10,
    ExecuteGetsec = 11,
    ExecuteHlt = 12,
    ExecuteInvd = 13,
    ExecuteInvlpg = 14,
    ExecuteRdpmc = 15,
    ExecuteRdtsc = 16,
    ExecuteRsmInSmm = 17,
    ExecuteVmcall = 18,
    ExecuteVmclear = 19,
    ExecuteVmlaunch = 20,
    ExecuteVmptrld = 21,
    ExecuteVmptrst = 22,
    ExecuteVmread = 23,
    ExecuteVmresume = 24,
    ExecuteVmwrite = 25,
    ExecuteVmxoff = 26,
    ExecuteVmxon = 27,
    MovCr = 28,
    MovDr = 29,
    ExecuteIoInstruction = 30,
    ExecuteRdmsr = 31,
    ExecuteWrmsr = 32,
    ErrorInvalidGuestState = 33,
    ErrorMsrLoad = 34,
    Reserved35 = 35,
    ExecuteMwait = 36,
    MonitorTrapFlag = 37,
    Reserved38 = 38,
    ExecuteMonitor = 39,
    ExecutePause = 40,
    ErrorMachineCheck = 41,
    Reserved42 = 42,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    GdtrIdtrAccess = 46,
    LdtrTrAccess = 47,
    EptViolation = 48,
    EptMisconfiguration = 49,
    ExecuteInvept = 50,
    ExecuteRdtscp = 51,
    VmxPreemptionTimerExpired = 52,
    ExecuteInvvpid = 53,
    ExecuteWbinvd = 54,
    ExecuteXsetbv = 55,
    ApicWrite = 56,
    ExecuteRdrand = 57,
    ExecuteInvpcid = 58,
    ExecuteVmfunc = 59,
    ExecuteEncls = 60,
    ExecuteRdseed = 61,
    PageModificationLogFull = 62,
    ExecuteXsaves = 63,
    ExecuteXrstors = 64,
}

impl ExitReason {
    /// Decodes the low 16 bits of the exit-reason VMCS field.
    pub fn from_u16(value: u16) -> Option<Self> {
        if usize::from(value) < EXIT_REASON_COUNT {
            // Safety: repr(u16) with contiguous discriminants 0..=64.
            Some(unsafe { core::mem::transmute::<u16, Self>(value) })
        } else {
            None
        }
    }

    /// Returns the table index of this reason.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Event delivery types as used in the interruption-information fields.
///
/// See: Table 25-17. Format of the VM-Entry Interruption-Information Field
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum InterruptType {
    /// External interrupt.
    External = 0,
    /// Reserved.
    Reserved = 1,
    /// Non-maskable interrupt.
    Nmi = 2,
    /// Hardware exception (#PF, #GP, ...).
    HardwareException = 3,
    /// INT n.
    SoftwareInterrupt = 4,
    /// INT1.
    PrivilegedSoftwareException = 5,
    /// INT3 / INTO.
    SoftwareException = 6,
    /// Other (MTF).
    OtherEvent = 7,
}

impl InterruptType {
    fn from_bits(bits: u32) -> Self {
        // Safety: repr(u32) with contiguous discriminants 0..=7.
        unsafe { core::mem::transmute::<u32, Self>(bits & 0b111) }
    }

    /// Whether VM entry needs the instruction-length field for this type.
    pub fn is_software(self) -> bool {
        matches!(
            self,
            Self::SoftwareInterrupt | Self::PrivilegedSoftwareException | Self::SoftwareException
        )
    }
}

/// Exception vectors of the IA-32 architecture.
///
/// See: Table 6-1. Exceptions and Interrupts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ExceptionVector {
    DivideError = 0,
    Debug = 1,
    Nmi = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRangeExceeded = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackSegmentFault = 12,
    GeneralProtection = 13,
    PageFault = 14,
    X87FloatingPoint = 16,
    AlignmentCheck = 17,
    MachineCheck = 18,
    SimdFloatingPoint = 19,
}

bitfield! {
    /// The VM-exit/VM-entry interruption-information field.
    ///
    /// See: Table 25-17. Format of the VM-Entry Interruption-Information Field
    #[derive(Clone, Copy)]
    pub struct InterruptInfo(u32);
    impl Debug;
    pub vector, set_vector: 7, 0;
    pub interruption_type, set_interruption_type: 10, 8;
    pub error_code_valid, set_error_code_valid: 11;
    pub nmi_unblocking, set_nmi_unblocking: 12;
    pub valid, set_valid: 31;
}

impl InterruptInfo {
    /// Returns the typed delivery kind.
    pub fn interrupt_type(&self) -> InterruptType {
        InterruptType::from_bits(self.interruption_type())
    }
}

/// An event to be injected into the guest on the next VM entry.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    /// The interruption-information word.
    pub info: InterruptInfo,
    /// The associated error code, when the vector delivers one.
    pub error_code: Option<u32>,
}

impl Event {
    /// A hardware exception without an error code.
    pub fn exception(vector: ExceptionVector) -> Self {
        Self::new(InterruptType::HardwareException, vector, None)
    }

    /// A hardware exception with an error code.
    pub fn exception_with_code(vector: ExceptionVector, error_code: u32) -> Self {
        Self::new(InterruptType::HardwareException, vector, Some(error_code))
    }

    /// An arbitrary event, used to reflect an intercepted one unchanged.
    pub fn new(
        interrupt_type: InterruptType,
        vector: ExceptionVector,
        error_code: Option<u32>,
    ) -> Self {
        let mut info = InterruptInfo(0);
        info.set_vector(u32::from(vector as u8));
        info.set_interruption_type(interrupt_type as u32);
        info.set_error_code_valid(error_code.is_some());
        info.set_valid(true);
        Self { info, error_code }
    }

    /// Rebuilds the event that caused the current VM exit from the exit
    /// interruption-information and error-code fields.
    pub fn from_exit(info: InterruptInfo, error_code: u32) -> Self {
        Self {
            info,
            error_code: info.error_code_valid().then_some(error_code),
        }
    }
}

bitfield! {
    /// Exit qualification for MOV CR accesses.
    ///
    /// See: Table 28-3. Exit Qualification for Control-Register Accesses
    #[derive(Clone, Copy)]
    pub struct QualificationMovCr(u64);
    impl Debug;
    pub cr_number, _: 3, 0;
    pub access_type, _: 5, 4;
    pub lmsw_operand_type, _: 6;
    pub gp_register, _: 11, 8;
    pub lmsw_source_data, _: 31, 16;
}

/// MOV CR access kinds.
#[allow(missing_docs)]
pub mod mov_cr_access {
    pub const MOV_TO_CR: u64 = 0;
    pub const MOV_FROM_CR: u64 = 1;
    pub const CLTS: u64 = 2;
    pub const LMSW: u64 = 3;
}

bitfield! {
    /// Exit qualification for MOV DR accesses.
    ///
    /// See: Table 28-5. Exit Qualification for MOV DR
    #[derive(Clone, Copy)]
    pub struct QualificationMovDr(u64);
    impl Debug;
    pub dr_number, _: 2, 0;
    pub direction_from_dr, _: 4;
    pub gp_register, _: 11, 8;
}

bitfield! {
    /// Exit qualification for I/O instructions.
    ///
    /// See: Table 28-5. Exit Qualification for I/O Instructions
    #[derive(Clone, Copy)]
    pub struct QualificationIo(u64);
    impl Debug;
    pub size_of_access, _: 2, 0;
    pub access_in, _: 3;
    pub string_instruction, _: 4;
    pub rep_prefixed, _: 5;
    pub operand_encoding_immediate, _: 6;
    pub port_number, _: 31, 16;
}

bitfield! {
    /// Exit qualification for EPT violations.
    ///
    /// See: Table 28-7. Exit Qualification for EPT Violations
    #[derive(Clone, Copy)]
    pub struct QualificationEptViolation(u64);
    impl Debug;
    pub data_read, _: 0;
    pub data_write, _: 1;
    pub data_execute, _: 2;
    pub entry_read, _: 3;
    pub entry_write, _: 4;
    pub entry_execute, _: 5;
    pub entry_execute_for_user_mode, _: 6;
    pub valid_guest_linear_address, _: 7;
    pub ept_translated_access, _: 8;
    pub nmi_unblocking, _: 12;
}

bitfield! {
    /// Exit qualification for debug exceptions.
    ///
    /// See: Table 28-1. Exit Qualification for Debug Exceptions
    #[derive(Clone, Copy)]
    pub struct QualificationDebugException(u64);
    impl Debug;
    pub breakpoint_condition, _: 3, 0;
    pub debug_register_access_detected, _: 13;
    pub single_instruction, _: 14;
}

bitfield! {
    /// Exit qualification for task switches.
    ///
    /// See: Table 28-2. Exit Qualification for Task Switch
    #[derive(Clone, Copy)]
    pub struct QualificationTaskSwitch(u64);
    impl Debug;
    pub selector, _: 15, 0;
    pub source, _: 31, 30;
}

bitfield! {
    /// VM-exit instruction information for SGDT/SIDT/LGDT/LIDT.
    ///
    /// See: Table 28-10. Format of the VM-Exit Instruction-Information Field
    ///      as Used for LIDT, LGDT, SIDT, or SGDT
    #[derive(Clone, Copy)]
    pub struct InfoGdtrIdtrAccess(u32);
    impl Debug;
    pub scaling, _: 1, 0;
    pub address_size, _: 9, 7;
    pub operand_size, _: 11;
    pub segment_register, _: 17, 15;
    pub index_register, _: 21, 18;
    pub index_register_invalid, _: 22;
    pub base_register, _: 26, 23;
    pub base_register_invalid, _: 27;
    pub instruction, _: 29, 28;
}

/// The four instructions reported by [`InfoGdtrIdtrAccess::instruction`].
#[allow(missing_docs)]
pub mod gdtr_idtr_instruction {
    pub const SGDT: u32 = 0;
    pub const SIDT: u32 = 1;
    pub const LGDT: u32 = 2;
    pub const LIDT: u32 = 3;
}

bitfield! {
    /// VM-exit instruction information for SLDT/STR/LLDT/LTR.
    ///
    /// See: Table 28-11. Format of the VM-Exit Instruction-Information Field
    ///      as Used for LLDT, LTR, SLDT, and STR
    #[derive(Clone, Copy)]
    pub struct InfoLdtrTrAccess(u32);
    impl Debug;
    pub scaling, _: 1, 0;
    pub register_1, _: 6, 3;
    pub address_size, _: 9, 7;
    pub register_access, _: 10;
    pub segment_register, _: 17, 15;
    pub index_register, _: 21, 18;
    pub index_register_invalid, _: 22;
    pub base_register, _: 26, 23;
    pub base_register_invalid, _: 27;
    pub instruction, _: 29, 28;
}

/// The four instructions reported by [`InfoLdtrTrAccess::instruction`].
#[allow(missing_docs)]
pub mod ldtr_tr_instruction {
    pub const SLDT: u32 = 0;
    pub const STR: u32 = 1;
    pub const LLDT: u32 = 2;
    pub const LTR: u32 = 3;
}

bitfield! {
    /// VM-exit instruction information for INVEPT, INVPCID and INVVPID.
    ///
    /// See: Table 28-9. Format of the VM-Exit Instruction-Information Field
    ///      as Used for INVEPT, INVPCID, and INVVPID
    #[derive(Clone, Copy)]
    pub struct InfoInvalidate(u32);
    impl Debug;
    pub scaling, _: 1, 0;
    pub address_size, _: 9, 7;
    pub segment_register, _: 17, 15;
    pub index_register, _: 21, 18;
    pub index_register_invalid, _: 22;
    pub base_register, _: 26, 23;
    pub base_register_invalid, _: 27;
    pub register_2, _: 31, 28;
}

/// A VM-instruction error number.
///
/// See: 31.4 VM INSTRUCTION ERROR NUMBERS
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstructionError(pub u32);

bitfield! {
    /// Layout of the IA32_VMX_BASIC MSR.
    ///
    /// See: A.1 BASIC VMX INFORMATION
    #[derive(Clone, Copy)]
    pub struct VmxBasic(u64);
    impl Debug;
    pub u32, revision_id, _: 30, 0;
    pub vmcs_size, _: 44, 32;
    pub memory_type, _: 53, 50;
    pub true_controls, _: 55;
}

bitfield! {
    /// Layout of the IA32_VMX_EPT_VPID_CAP MSR.
    ///
    /// See: A.10 VPID AND EPT CAPABILITIES
    #[derive(Clone, Copy)]
    pub struct VmxEptVpidCap(u64);
    impl Debug;
    pub execute_only_pages, _: 0;
    pub page_walk_length_4, _: 6;
    pub memory_type_uncacheable, _: 8;
    pub memory_type_write_back, _: 14;
    pub pde_2mb_pages, _: 16;
    pub pdpte_1gb_pages, _: 17;
    pub invept, _: 20;
    pub accessed_dirty_flags, _: 21;
    pub invept_single_context, _: 25;
    pub invept_all_contexts, _: 26;
    pub invvpid, _: 32;
    pub invvpid_individual_address, _: 40;
    pub invvpid_single_context, _: 41;
    pub invvpid_all_contexts, _: 42;
    pub invvpid_single_context_retaining_globals, _: 43;
}

bitfield! {
    /// The page-fault error code pushed by #PF and mirrored in the VMCS
    /// mask/match fields.
    ///
    /// See: Figure 4-12. Page-Fault Error Code
    #[derive(Clone, Copy)]
    pub struct PagefaultErrorCode(u32);
    impl Debug;
    pub present, set_present: 0;
    pub write, set_write: 1;
    pub user_mode_access, set_user_mode_access: 2;
    pub reserved_bit_violation, set_reserved_bit_violation: 3;
    pub execute, set_execute: 4;
}

/// The types of the VMX control fields.
#[derive(Clone, Copy)]
pub enum VmxControl {
    /// Pin-based VM-execution controls.
    PinBased,
    /// Primary processor-based VM-execution controls.
    ProcessorBased,
    /// Secondary processor-based VM-execution controls.
    ProcessorBased2,
    /// Primary VM-exit controls.
    VmExit,
    /// VM-entry controls.
    VmEntry,
}

/// Returns an adjusted value for the control field according to the
/// capability MSR: bits the processor requires are forced on, bits it does
/// not support are forced off.
///
/// See: A.3.1 Pin-Based VM-Execution Controls (and A.3.2, A.3.3, A.4, A.5)
pub fn adjust_vmx_control(control: VmxControl, requested_value: u64) -> u64 {
    const IA32_VMX_BASIC_VMX_CONTROLS_FLAG: u64 = 1 << 55;

    // When bit 55 of IA32_VMX_BASIC is set, the TRUE capability MSRs report
    // the real constraints and the non-TRUE ones are to be ignored.
    let vmx_basic = rdmsr(x86::msr::IA32_VMX_BASIC);
    let true_cap_msr_supported = (vmx_basic & IA32_VMX_BASIC_VMX_CONTROLS_FLAG) != 0;

    let cap_msr = match (control, true_cap_msr_supported) {
        (VmxControl::PinBased, true) => x86::msr::IA32_VMX_TRUE_PINBASED_CTLS,
        (VmxControl::PinBased, false) => x86::msr::IA32_VMX_PINBASED_CTLS,
        (VmxControl::ProcessorBased, true) => x86::msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        (VmxControl::ProcessorBased, false) => x86::msr::IA32_VMX_PROCBASED_CTLS,
        (VmxControl::VmExit, true) => x86::msr::IA32_VMX_TRUE_EXIT_CTLS,
        (VmxControl::VmExit, false) => x86::msr::IA32_VMX_EXIT_CTLS,
        (VmxControl::VmEntry, true) => x86::msr::IA32_VMX_TRUE_ENTRY_CTLS,
        (VmxControl::VmEntry, false) => x86::msr::IA32_VMX_ENTRY_CTLS,
        // There is no TRUE MSR for IA32_VMX_PROCBASED_CTLS2.
        (VmxControl::ProcessorBased2, _) => x86::msr::IA32_VMX_PROCBASED_CTLS2,
    };

    // The lower 32 bits indicate bits allowed to be 0, the upper 32 bits
    // indicate bits allowed to be 1.
    let capabilities = rdmsr(cap_msr);
    let allowed0 = capabilities as u32;
    let allowed1 = (capabilities >> 32) as u32;
    let mut effective_value = requested_value as u32;
    effective_value |= allowed0;
    effective_value &= allowed1;
    u64::from(effective_value)
}

/// Returns `desired` CR0 masked against the VMX fixed-bit MSRs.
///
/// See: A.7 VMX-FIXED BITS IN CR0
pub fn adjust_cr0(desired: u64) -> u64 {
    let fixed0 = rdmsr(x86::msr::IA32_VMX_CR0_FIXED0);
    let fixed1 = rdmsr(x86::msr::IA32_VMX_CR0_FIXED1);
    (desired | fixed0) & fixed1
}

/// Returns `desired` CR4 masked against the VMX fixed-bit MSRs.
///
/// See: A.8 VMX-FIXED BITS IN CR4
pub fn adjust_cr4(desired: u64) -> u64 {
    let fixed0 = rdmsr(x86::msr::IA32_VMX_CR4_FIXED0);
    let fixed1 = rdmsr(x86::msr::IA32_VMX_CR4_FIXED1);
    (desired | fixed0) & fixed1
}

/// Returns `desired` DR6 with the reserved bits forced to their mandatory
/// values.
///
/// See: 17.2.3 Debug Status Register (DR6)
pub fn adjust_dr6(desired: u64) -> u64 {
    ((desired | 0xffff_0ff0) & !(1 << 12)) & 0xffff_ffff
}

/// Returns `desired` DR7 with the reserved bits forced to their mandatory
/// values.
///
/// See: 17.2.4 Debug Control Register (DR7)
pub fn adjust_dr7(desired: u64) -> u64 {
    ((desired | (1 << 10)) & !((1 << 12) | (1 << 14) | (1 << 15))) & 0xffff_ffff
}

/// Returns the segment descriptor casted as a 64bit integer for the given
/// selector.
pub(crate) fn segment_descriptor_value(table_base: u64, selector: u16) -> u64 {
    let sel = x86::segmentation::SegmentSelector::from_raw(selector);
    let descriptor_addr = table_base + u64::from(sel.index() * 8);
    let ptr = descriptor_addr as *const u64;
    // Safety: the descriptor table the selector refers to is live.
    unsafe { *ptr }
}

/// Returns the access rights of the given segment for VMX.
///
/// See: 25.4.1 Guest Register State (access-rights format)
pub(crate) fn segment_access_rights(table_base: u64, selector: u16) -> u32 {
    const VMX_SEGMENT_ACCESS_RIGHTS_UNUSABLE_FLAG: u32 = 1 << 16;

    let sel = x86::segmentation::SegmentSelector::from_raw(selector);
    if sel.index() == 0 && (sel.bits() >> 2) == 0 {
        return VMX_SEGMENT_ACCESS_RIGHTS_UNUSABLE_FLAG;
    }
    let descriptor_value = segment_descriptor_value(table_base, selector);

    // Get the Type, S, DPL, P, AVL, L, D/B and G bits from the descriptor.
    // See: Figure 3-8. Segment Descriptor
    let ar = (descriptor_value >> 40) as u32;
    ar & 0b1111_0000_1111_1111
}

/// Returns the limit of the given segment.
pub(crate) fn segment_limit(table_base: u64, selector: u16) -> u32 {
    let sel = x86::segmentation::SegmentSelector::from_raw(selector);
    if sel.index() == 0 && (sel.bits() >> 2) == 0 {
        return 0; // unusable
    }
    let descriptor_value = segment_descriptor_value(table_base, selector);
    let limit_low = descriptor_value & 0xffff;
    let limit_high = (descriptor_value >> (32 + 16)) & 0xf;
    let mut limit = limit_low | (limit_high << 16);
    if ((descriptor_value >> (32 + 23)) & 0x01) != 0 {
        limit = ((limit + 1) << 12) - 1;
    }
    limit as u32
}

/// Returns the base address of the given segment. System descriptors (TSS,
/// LDT) are 16 bytes in long mode and carry the upper 32 base bits in the
/// second quadword.
///
/// See: Figure 8-4. Format of TSS and LDT Descriptors in 64-bit Mode
pub(crate) fn segment_base(table_base: u64, selector: u16) -> u64 {
    let sel = x86::segmentation::SegmentSelector::from_raw(selector);
    if sel.index() == 0 && (sel.bits() >> 2) == 0 {
        return 0;
    }
    let descriptor_value = segment_descriptor_value(table_base, selector);

    let mut base = ((descriptor_value >> 16) & 0xff_ffff) | ((descriptor_value >> 32) & 0xff00_0000);

    // S flag clear means a system descriptor.
    if (descriptor_value & (1 << 44)) == 0 {
        let upper_addr = table_base + u64::from(sel.index() * 8) + 8;
        // Safety: the descriptor table the selector refers to is live.
        let upper = unsafe { *(upper_addr as *const u64) };
        base |= (upper & 0xffff_ffff) << 32;
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reason_round_trips() {
        assert_eq!(ExitReason::from_u16(0), Some(ExitReason::ExceptionOrNmi));
        assert_eq!(ExitReason::from_u16(18), Some(ExitReason::ExecuteVmcall));
        assert_eq!(ExitReason::from_u16(28), Some(ExitReason::MovCr));
        assert_eq!(ExitReason::from_u16(48), Some(ExitReason::EptViolation));
        assert_eq!(ExitReason::from_u16(64), Some(ExitReason::ExecuteXrstors));
        assert_eq!(ExitReason::from_u16(65), None);
    }

    #[test]
    fn interrupt_info_layout() {
        // #GP (vector 13), hardware exception (type 3), with error code.
        let event = Event::exception_with_code(ExceptionVector::GeneralProtection, 0);
        assert_eq!(event.info.0, (1 << 31) | (1 << 11) | (3 << 8) | 13);
        assert_eq!(event.error_code, Some(0));

        // #UD carries no error code.
        let event = Event::exception(ExceptionVector::InvalidOpcode);
        assert_eq!(event.info.0, (1 << 31) | (3 << 8) | 6);
        assert_eq!(event.error_code, None);
    }

    #[test]
    fn mov_cr_qualification_layout() {
        // mov cr3, r8: CR 3, access 0 (to CR), register 8.
        let qualification = QualificationMovCr(3 | (8 << 8));
        assert_eq!(qualification.cr_number(), 3);
        assert_eq!(qualification.access_type(), mov_cr_access::MOV_TO_CR);
        assert_eq!(qualification.gp_register(), 8);

        // lmsw with source data 0xfff1.
        let qualification = QualificationMovCr((3 << 4) | (0xfff1 << 16));
        assert_eq!(qualification.access_type(), mov_cr_access::LMSW);
        assert_eq!(qualification.lmsw_source_data(), 0xfff1);
    }

    #[test]
    fn io_qualification_layout() {
        // rep outsw to port 0x64: size 1 (word), out, string, rep.
        let qualification = QualificationIo(1 | (1 << 4) | (1 << 5) | (0x64 << 16));
        assert_eq!(qualification.size_of_access(), 1);
        assert!(!qualification.access_in());
        assert!(qualification.string_instruction());
        assert!(qualification.rep_prefixed());
        assert_eq!(qualification.port_number(), 0x64);
    }

    #[test]
    fn ept_violation_qualification_layout() {
        // Write access to a present, read-only translation.
        let qualification = QualificationEptViolation(0b10_1010);
        assert!(!qualification.data_read());
        assert!(qualification.data_write());
        assert!(qualification.entry_read());
        assert!(!qualification.entry_write());
        assert!(qualification.entry_execute());
    }

    #[test]
    fn dr6_dr7_adjust_forces_reserved_bits() {
        assert_eq!(adjust_dr6(0), 0xffff_0ff0);
        assert_eq!(adjust_dr6(0x1000), 0xffff_0ff0);
        assert_eq!(adjust_dr7(0), 1 << 10);
        assert_eq!(adjust_dr7(0xffff_ffff), 0xffff_ffff & !((1 << 12) | (1 << 14) | (1 << 15)));
    }

    #[test]
    fn vmx_basic_layout() {
        let basic = VmxBasic((1 << 55) | (6 << 50) | (0x1000 << 32) | 0x12);
        assert_eq!(basic.revision_id(), 0x12);
        assert_eq!(basic.vmcs_size(), 0x1000);
        assert_eq!(basic.memory_type(), 6);
        assert!(basic.true_controls());
    }
}
