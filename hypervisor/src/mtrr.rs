//! The module containing the [`MtrrDescriptor`] type.
//!
//! Memory Type Range Registers define the cache type of physical address
//! ranges. The EPT identity map has to reproduce them exactly: mapping MMIO
//! as write-back, for example, turns device accesses into cache hits and
//! hangs the machine. The descriptor is captured once from the MSRs and then
//! answers [`MtrrDescriptor::memory_type_for`] queries during EPT
//! construction.
//!
//! All references to external resources (denoted with "See:") refers to
//! "Intel 64 and IA-32 Architectures Software Developer's Manual Volume 3"
//! unless otherwise stated.

use crate::platform::{MemoryRange, MemoryType, Pa};
use bitfield::bitfield;

const IA32_MTRRCAP: u32 = 0xfe;
const IA32_MTRR_DEF_TYPE: u32 = 0x2ff;
const IA32_MTRR_PHYSBASE0: u32 = 0x200;
const IA32_MTRR_PHYSMASK0: u32 = 0x201;

const IA32_MTRR_FIX64K_00000: u32 = 0x250;
const IA32_MTRR_FIX16K_80000: u32 = 0x258;
const IA32_MTRR_FIX16K_A0000: u32 = 0x259;
const IA32_MTRR_FIX4K_C0000: u32 = 0x268;

/// The number of fixed-range entries: 11 MSRs, 8 subranges each.
pub const FIXED_RANGE_COUNT: usize = (1 + 2 + 8) * 8;

/// The maximum number of variable-range entries.
pub const MAX_VARIABLE_RANGE_COUNT: usize = 255;

bitfield! {
    /// See: 11.11.1 MTRR Feature Identification
    struct MtrrCapabilities(u64);
    impl Debug;
    variable_range_count, _: 7, 0;
    fixed_range_supported, _: 8;
}

bitfield! {
    /// See: 11.11.2.1 IA32_MTRR_DEF_TYPE MSR
    struct MtrrDefType(u64);
    impl Debug;
    default_memory_type, _: 2, 0;
    fixed_range_mtrr_enable, _: 10;
    mtrr_enable, _: 11;
}

bitfield! {
    /// See: 11.11.2.3 Variable Range MTRRs
    struct MtrrPhysBase(u64);
    impl Debug;
    memory_type, _: 7, 0;
    pfn, _: 47, 12;
}

bitfield! {
    /// See: 11.11.2.3 Variable Range MTRRs
    struct MtrrPhysMask(u64);
    impl Debug;
    valid, _: 11;
    pfn, _: 47, 12;
}

/// One MTRR-described range with its memory type.
#[derive(Clone, Copy, Debug)]
struct MtrrRange {
    range: MemoryRange,
    memory_type: MemoryType,
}

impl Default for MtrrRange {
    fn default() -> Self {
        Self {
            range: MemoryRange::default(),
            memory_type: MemoryType::Uncacheable,
        }
    }
}

/// The captured MTRR state of the processor.
#[derive(Clone)]
pub struct MtrrDescriptor {
    fixed: [MtrrRange; FIXED_RANGE_COUNT],
    fixed_count: usize,
    variable: [MtrrRange; MAX_VARIABLE_RANGE_COUNT],
    variable_count: usize,
    default_type: MemoryType,
    enabled: bool,
}

impl MtrrDescriptor {
    /// A descriptor with MTRRs disabled: every query answers UC. This is the
    /// all-zero state, which zero-initialized containers rely on.
    pub(crate) const fn disabled() -> Self {
        const EMPTY: MtrrRange = MtrrRange {
            range: MemoryRange {
                begin: Pa(0),
                end: Pa(0),
            },
            memory_type: MemoryType::Uncacheable,
        };
        Self {
            fixed: [EMPTY; FIXED_RANGE_COUNT],
            fixed_count: 0,
            variable: [EMPTY; MAX_VARIABLE_RANGE_COUNT],
            variable_count: 0,
            default_type: MemoryType::Uncacheable,
            enabled: false,
        }
    }

    /// Captures the MTRR state of the current processor.
    pub fn read() -> Self {
        Self::read_with(crate::x86_instructions::rdmsr)
    }

    /// Captures MTRR state through `rdmsr`, allowing callers to substitute a
    /// synthetic register image.
    pub fn read_with(rdmsr: impl Fn(u32) -> u64) -> Self {
        let capabilities = MtrrCapabilities(rdmsr(IA32_MTRRCAP));
        let def_type = MtrrDefType(rdmsr(IA32_MTRR_DEF_TYPE));

        let mut descriptor = Self {
            fixed: [MtrrRange::default(); FIXED_RANGE_COUNT],
            fixed_count: 0,
            variable: [MtrrRange::default(); MAX_VARIABLE_RANGE_COUNT],
            variable_count: 0,
            default_type: MemoryType::from_bits(def_type.default_memory_type() as u8),
            enabled: def_type.mtrr_enable(),
        };

        if capabilities.fixed_range_supported() && def_type.fixed_range_mtrr_enable() {
            descriptor.capture_fixed(&rdmsr);
        }
        descriptor.capture_variable(&rdmsr, capabilities.variable_range_count() as usize);
        descriptor
    }

    /// Returns the memory type of `pa`.
    ///
    /// Precedence per 11.11.4.1 MTRR Precedences:
    /// 1. a fixed range containing `pa` (first 1 MiB only);
    /// 2. variable ranges: any UC match wins; WT dominates WB; identical
    ///    types agree; any other overlap is undefined and resolves to UC;
    /// 3. the default type.
    ///
    /// With MTRRs disabled every access is UC.
    pub fn memory_type_for(&self, pa: Pa) -> MemoryType {
        if !self.enabled {
            return MemoryType::Uncacheable;
        }

        for entry in &self.fixed[..self.fixed_count] {
            if entry.range.contains(pa) {
                return entry.memory_type;
            }
        }

        let mut result = None;
        for entry in &self.variable[..self.variable_count] {
            if !entry.range.contains(pa) {
                continue;
            }
            if entry.memory_type == MemoryType::Uncacheable {
                return MemoryType::Uncacheable;
            }
            result = match (result, entry.memory_type) {
                (None, t) => Some(t),
                (Some(r), t) if r == t => Some(r),
                (Some(MemoryType::WriteBack), MemoryType::WriteThrough)
                | (Some(MemoryType::WriteThrough), MemoryType::WriteBack) => {
                    Some(MemoryType::WriteThrough)
                }
                // Overlap not defined by the rules above.
                _ => return MemoryType::Uncacheable,
            };
        }
        result.unwrap_or(self.default_type)
    }

    /// Returns the default memory type.
    pub fn default_type(&self) -> MemoryType {
        self.default_type
    }

    fn capture_fixed(&mut self, rdmsr: &impl Fn(u32) -> u64) {
        // Fixed-range layout per Table 11-9: one 64 KiB MSR covering
        // 0x00000-0x7ffff, two 16 KiB MSRs covering 0x80000-0xbffff, and
        // eight 4 KiB MSRs covering 0xc0000-0xfffff. Each MSR holds eight
        // subrange types, one per byte.
        let mut emit = |msr: u32, base: u64, size: u64| {
            let value = rdmsr(msr);
            for subrange in 0..8 {
                let begin = base + subrange * size;
                self.fixed[self.fixed_count] = MtrrRange {
                    range: MemoryRange::new(Pa(begin), Pa(begin + size)),
                    memory_type: MemoryType::from_bits((value >> (subrange * 8)) as u8),
                };
                self.fixed_count += 1;
            }
        };

        emit(IA32_MTRR_FIX64K_00000, 0x0, 0x1_0000);
        emit(IA32_MTRR_FIX16K_80000, 0x8_0000, 0x4000);
        emit(IA32_MTRR_FIX16K_A0000, 0xa_0000, 0x4000);
        for index in 0..8 {
            emit(IA32_MTRR_FIX4K_C0000 + index, 0xc_0000 + u64::from(index) * 0x8000, 0x1000);
        }
    }

    fn capture_variable(&mut self, rdmsr: &impl Fn(u32) -> u64, count: usize) {
        for index in 0..count.min(MAX_VARIABLE_RANGE_COUNT) {
            let base = MtrrPhysBase(rdmsr(IA32_MTRR_PHYSBASE0 + index as u32 * 2));
            let mask = MtrrPhysMask(rdmsr(IA32_MTRR_PHYSMASK0 + index as u32 * 2));
            if !mask.valid() || mask.pfn() == 0 {
                continue;
            }

            // The range size follows from the lowest set bit of the PFN mask.
            // See: 11.11.3 Example Base and Mask Calculations
            let size_in_pages = 1u64 << mask.pfn().trailing_zeros();
            self.variable[self.variable_count] = MtrrRange {
                range: MemoryRange::new(
                    Pa::from_pfn(base.pfn()),
                    Pa::from_pfn(base.pfn() + size_in_pages),
                ),
                memory_type: MemoryType::from_bits(base.memory_type() as u8),
            };
            self.variable_count += 1;
        }
    }

    /// A descriptor with no ranges and a write-back default, for hosted unit
    /// tests that do not care about cacheability.
    #[cfg(test)]
    pub(crate) fn for_tests_write_back() -> Self {
        Self {
            default_type: MemoryType::WriteBack,
            enabled: true,
            ..Self::disabled()
        }
    }
}

impl core::fmt::Debug for MtrrDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MtrrDescriptor")
            .field("fixed_count", &self.fixed_count)
            .field("variable_count", &self.variable_count)
            .field("default_type", &self.default_type)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A synthetic MSR image: default WB, MTRRs and fixed ranges enabled,
    /// two variable ranges (one UC at 1 GiB, one WT at 2 GiB), and the
    /// 0xc0000 fixed MSR marking its first 4 KiB subrange WP.
    fn synthetic(msr: u32) -> u64 {
        match msr {
            IA32_MTRRCAP => (1 << 8) | 2,
            IA32_MTRR_DEF_TYPE => (1 << 11) | (1 << 10) | 6,
            IA32_MTRR_FIX4K_C0000 => 0x05, // first byte = WP, the rest UC
            IA32_MTRR_PHYSBASE0 => 0x4000_0000,
            IA32_MTRR_PHYSMASK0 => (1 << 11) | 0x0000_000f_fff0_0000, // 1 MiB at 1 GiB, UC
            IA32_MTRR_PHYSBASE2 => 0x8000_0000 | 4,
            IA32_MTRR_PHYSMASK2 => (1 << 11) | 0x0000_000f_fff0_0000, // 1 MiB at 2 GiB, WT
            _ => 0,
        }
    }

    const IA32_MTRR_PHYSBASE2: u32 = IA32_MTRR_PHYSBASE0 + 2;
    const IA32_MTRR_PHYSMASK2: u32 = IA32_MTRR_PHYSMASK0 + 2;

    #[test]
    fn fixed_range_wins_in_first_megabyte() {
        let mtrr = MtrrDescriptor::read_with(synthetic);
        assert_eq!(mtrr.memory_type_for(Pa(0xc0000)), MemoryType::WriteProtected);
        assert_eq!(mtrr.memory_type_for(Pa(0xc1000)), MemoryType::Uncacheable);
        // The 64 KiB fixed MSR reads as zero, so low memory is UC too.
        assert_eq!(mtrr.memory_type_for(Pa(0x1000)), MemoryType::Uncacheable);
    }

    #[test]
    fn variable_ranges_apply_beyond_fixed() {
        let mtrr = MtrrDescriptor::read_with(synthetic);
        assert_eq!(mtrr.memory_type_for(Pa(0x4000_0000)), MemoryType::Uncacheable);
        assert_eq!(mtrr.memory_type_for(Pa(0x4000_0000 + 0xf_ffff)), MemoryType::Uncacheable);
        assert_eq!(mtrr.memory_type_for(Pa(0x8000_0000)), MemoryType::WriteThrough);
    }

    #[test]
    fn unmatched_addresses_take_the_default() {
        let mtrr = MtrrDescriptor::read_with(synthetic);
        assert_eq!(mtrr.memory_type_for(Pa(0x1_0000_0000)), MemoryType::WriteBack);
    }

    #[test]
    fn disabled_mtrrs_mean_uncacheable() {
        let mtrr = MtrrDescriptor::read_with(|msr| match msr {
            IA32_MTRR_DEF_TYPE => 6, // default WB but enable bit clear
            other => synthetic(other),
        });
        assert_eq!(mtrr.memory_type_for(Pa(0x1_0000_0000)), MemoryType::Uncacheable);
    }

    #[test]
    fn write_through_dominates_write_back_on_overlap() {
        // Two overlapping variable ranges, WB then WT.
        let mtrr = MtrrDescriptor::read_with(|msr| match msr {
            IA32_MTRRCAP => 2,
            IA32_MTRR_DEF_TYPE => (1 << 11) | 0,
            IA32_MTRR_PHYSBASE0 => 0x4000_0000 | 6,
            IA32_MTRR_PHYSMASK0 => (1 << 11) | 0x0000_000f_fff0_0000,
            IA32_MTRR_PHYSBASE2 => 0x4000_0000 | 4,
            IA32_MTRR_PHYSMASK2 => (1 << 11) | 0x0000_000f_fff0_0000,
            _ => 0,
        });
        assert_eq!(mtrr.memory_type_for(Pa(0x4000_0000)), MemoryType::WriteThrough);
    }
}
