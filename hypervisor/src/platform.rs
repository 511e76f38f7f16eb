//! The module containing the host-OS bridge and the process-wide platform
//! snapshot.
//!
//! The hypervisor core cannot call host-OS services directly; everything it
//! needs from the outside world is captured here, once, at driver
//! initialization. [`HostOps`] is the minimal function table the host driver
//! must supply, and [`PlatformInfo`] is the immutable description of the
//! machine (physical memory ranges, MTRR state, kernel self-map roots) that
//! the rest of the crate reads.

use crate::{error::ErrorCode, mtrr::MtrrDescriptor};
use core::ffi::c_void;
use spin::Once;
use x86::current::paging::BASE_PAGE_SHIFT;

/// A 64-bit physical address.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pa(pub u64);

impl Pa {
    /// Builds a physical address from a page frame number.
    pub const fn from_pfn(pfn: u64) -> Self {
        Self(pfn << BASE_PAGE_SHIFT)
    }

    /// Returns the page frame number of this address.
    pub const fn pfn(self) -> u64 {
        self.0 >> BASE_PAGE_SHIFT
    }

    /// Returns the offset of this address within its page.
    pub const fn offset(self) -> u64 {
        self.0 & 0xfff
    }

    /// Returns the page-table index selecting this address at `level`.
    pub const fn index(self, level: PageTableLevel) -> usize {
        ((self.0 >> (BASE_PAGE_SHIFT + 9 * (level as usize - 1))) & 0x1ff) as usize
    }

    /// Translates this physical address to a virtual address through the host
    /// bridge.
    pub fn va(self) -> *mut u8 {
        (ops().va_from_pa)(self.0)
    }

    /// Translates the virtual address `va` to a physical address through the
    /// host bridge.
    pub fn from_va<T>(va: *const T) -> Self {
        Self((ops().pa_from_va)(va.cast::<u8>()))
    }
}

impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa({:#x})", self.0)
    }
}

/// A 64-bit virtual address.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Va(pub u64);

impl Va {
    /// Returns the page frame number of this address.
    pub const fn pfn(self) -> u64 {
        self.0 >> BASE_PAGE_SHIFT
    }

    /// Returns the offset of this address within its page.
    pub const fn offset(self) -> u64 {
        self.0 & 0xfff
    }

    /// Returns the page-table index selecting this address at `level`.
    pub const fn index(self, level: PageTableLevel) -> usize {
        ((self.0 >> (BASE_PAGE_SHIFT + 9 * (level as usize - 1))) & 0x1ff) as usize
    }

    /// Reinterprets this address as a pointer.
    pub const fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va({:#x})", self.0)
    }
}

/// The four levels of a 4-level page-table walk, EPT included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum PageTableLevel {
    /// Page table; a leaf here maps 4 KiB.
    Pt = 1,
    /// Page directory; a leaf here maps 2 MiB.
    Pd = 2,
    /// Page directory pointer table; a leaf here maps 1 GiB.
    Pdpt = 3,
    /// Page map level 4. Never a leaf.
    Pml4 = 4,
}

impl PageTableLevel {
    /// Returns the level one step closer to the leaves.
    pub const fn next_down(self) -> Self {
        match self {
            Self::Pml4 => Self::Pdpt,
            Self::Pdpt => Self::Pd,
            Self::Pd | Self::Pt => Self::Pt,
        }
    }

    /// Returns how many bytes one entry at this level covers.
    pub const fn page_size(self) -> u64 {
        1 << (BASE_PAGE_SHIFT + 9 * (self as usize - 1))
    }
}

/// The memory (cache) type of a physical address range.
///
/// See: Table 11-8. Memory Types That Can Be Encoded in MTRRs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryType {
    /// UC
    Uncacheable = 0,
    /// WC
    WriteCombining = 1,
    /// WT
    WriteThrough = 4,
    /// WP
    WriteProtected = 5,
    /// WB
    WriteBack = 6,
}

impl MemoryType {
    /// Decodes the 3-bit MTRR/EPT memory-type encoding. Reserved encodings
    /// collapse to UC, the safe type for anything undefined.
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::WriteCombining,
            4 => Self::WriteThrough,
            5 => Self::WriteProtected,
            6 => Self::WriteBack,
            _ => Self::Uncacheable,
        }
    }
}

/// A `[begin, end)` physical address range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryRange {
    /// The first byte of the range.
    pub begin: Pa,
    /// One past the last byte of the range.
    pub end: Pa,
}

impl MemoryRange {
    /// Builds a range; `begin` must be below `end`.
    pub const fn new(begin: Pa, end: Pa) -> Self {
        Self { begin, end }
    }

    /// Returns whether `pa` falls within the range.
    pub const fn contains(&self, pa: Pa) -> bool {
        pa.0 >= self.begin.0 && pa.0 < self.end.0
    }

    /// Returns the size of the range in bytes.
    pub const fn size(&self) -> u64 {
        self.end.0 - self.begin.0
    }
}

/// The maximum number of physical memory ranges [`PhysicalMemoryDescriptor`]
/// can carry.
pub const MAX_MEMORY_RANGE_COUNT: usize = 32;

/// The ordered list of physical memory ranges present on the machine, as
/// enumerated by the host OS.
#[derive(Clone, Debug)]
pub struct PhysicalMemoryDescriptor {
    ranges: [MemoryRange; MAX_MEMORY_RANGE_COUNT],
    count: usize,
}

impl PhysicalMemoryDescriptor {
    /// Builds the descriptor from `ranges`. Fails with
    /// [`ErrorCode::InvalidArgument`] when more than
    /// [`MAX_MEMORY_RANGE_COUNT`] ranges are given or any range is empty or
    /// not page aligned.
    pub fn new(ranges: &[MemoryRange]) -> Result<Self, ErrorCode> {
        if ranges.len() > MAX_MEMORY_RANGE_COUNT {
            return Err(ErrorCode::InvalidArgument);
        }
        for range in ranges {
            if range.begin.0 >= range.end.0
                || range.begin.offset() != 0
                || range.end.offset() != 0
            {
                return Err(ErrorCode::InvalidArgument);
            }
        }

        let mut descriptor = Self {
            ranges: [MemoryRange::default(); MAX_MEMORY_RANGE_COUNT],
            count: ranges.len(),
        };
        descriptor.ranges[..ranges.len()].copy_from_slice(ranges);
        Ok(descriptor)
    }

    /// Returns the populated ranges.
    pub fn ranges(&self) -> &[MemoryRange] {
        &self.ranges[..self.count]
    }

    /// Returns the number of 4 KiB pages covered by all ranges.
    pub fn page_count(&self) -> u64 {
        self.ranges()
            .iter()
            .map(|range| range.size() >> BASE_PAGE_SHIFT)
            .sum()
    }
}

/// Virtual addresses of the host kernel's self-mapped paging structures, used
/// for software page-table walks, plus the system address-space CR3.
#[derive(Clone, Copy, Debug, Default)]
pub struct PagingDescriptor {
    /// The base of the self-mapped PML4 entries.
    pub pml4_base: Va,
    /// The base of the self-mapped PDPT entries.
    pub pdpt_base: Va,
    /// The base of the self-mapped PD entries.
    pub pd_base: Va,
    /// The base of the self-mapped PT entries.
    pub pt_base: Va,
    /// CR3 of the system (kernel) address space.
    pub system_cr3: u64,
}

/// The function table the host driver must supply. Every function here is
/// callable from VMX root mode except `sleep` and `ipi_call`, which are only
/// used by the management thread.
#[derive(Clone, Copy)]
pub struct HostOps {
    /// Returns the number of logical processors.
    pub cpu_count: fn() -> u32,
    /// Returns the index of the current logical processor.
    pub cpu_index: fn() -> u32,
    /// Runs `callback(context)` on every logical processor and blocks until
    /// all of them returned.
    pub ipi_call: fn(callback: extern "C" fn(*mut c_void), context: *mut c_void),
    /// Delays the calling thread. Never called inside root mode.
    pub sleep: fn(ms: u64),
    /// Translates a physical address to a virtual address. Reads only
    /// architectural tables, so it is root-mode safe.
    pub va_from_pa: fn(pa: u64) -> *mut u8,
    /// Translates a virtual address to a physical address. Reads only
    /// architectural tables, so it is root-mode safe.
    pub pa_from_va: fn(va: *const u8) -> u64,
    /// Reserves a virtual-address window without backing pages, whose PTEs
    /// the root-mode mapper may repoint at arbitrary PFNs.
    pub mapper_reserve: fn(size: usize) -> *mut u8,
    /// Emits one log line. Only called from non-root paths.
    pub log: fn(level: log::Level, message: &str),
}

/// The process-wide platform snapshot. Built once during driver
/// initialization, immutable afterwards.
pub struct PlatformInfo {
    /// Physical memory present on the machine.
    pub memory: PhysicalMemoryDescriptor,
    /// MTRR state captured at initialization.
    pub mtrr: MtrrDescriptor,
    /// Kernel self-map roots and the system CR3.
    pub paging: PagingDescriptor,
}

struct Platform {
    ops: HostOps,
    info: PlatformInfo,
}

static PLATFORM: Once<Platform> = Once::new();

/// Installs the host bridge and the platform snapshot. Must be called exactly
/// once before anything else in this crate; later calls are ignored.
pub fn init(ops: HostOps, info: PlatformInfo) {
    let _ = PLATFORM.call_once(|| Platform { ops, info });
}

/// Returns the host bridge.
///
/// # Panics
///
/// Panics when [`init`] has not run.
pub fn ops() -> &'static HostOps {
    &PLATFORM.get().expect("platform::init not called").ops
}

/// Returns the platform snapshot.
///
/// # Panics
///
/// Panics when [`init`] has not run.
pub fn info() -> &'static PlatformInfo {
    &PLATFORM.get().expect("platform::init not called").info
}

#[cfg(test)]
pub(crate) mod testing {
    //! Identity host bridge for unit tests: VA == PA, one processor, log to
    //! nothing.

    use super::{
        HostOps, MemoryRange, PagingDescriptor, PhysicalMemoryDescriptor, PlatformInfo,
    };
    use crate::mtrr::MtrrDescriptor;
    use core::ffi::c_void;

    fn cpu_count() -> u32 {
        1
    }

    fn cpu_index() -> u32 {
        0
    }

    fn ipi_call(callback: extern "C" fn(*mut c_void), context: *mut c_void) {
        callback(context);
    }

    fn sleep(_ms: u64) {}

    fn va_from_pa(pa: u64) -> *mut u8 {
        pa as *mut u8
    }

    fn pa_from_va(va: *const u8) -> u64 {
        va as u64
    }

    fn mapper_reserve(_size: usize) -> *mut u8 {
        core::ptr::null_mut()
    }

    fn log(_level: log::Level, _message: &str) {}

    pub(crate) const IDENTITY_OPS: HostOps = HostOps {
        cpu_count,
        cpu_index,
        ipi_call,
        sleep,
        va_from_pa,
        pa_from_va,
        mapper_reserve,
        log,
    };

    /// Installs the identity bridge. Idempotent so every test can call it.
    pub(crate) fn init_identity() {
        super::init(
            IDENTITY_OPS,
            PlatformInfo {
                memory: PhysicalMemoryDescriptor::new(&[]).unwrap(),
                mtrr: MtrrDescriptor::for_tests_write_back(),
                paging: PagingDescriptor::default(),
            },
        );
    }

    /// Convenience constructor used by EPT tests.
    pub(crate) fn memory_of(ranges: &[MemoryRange]) -> PhysicalMemoryDescriptor {
        PhysicalMemoryDescriptor::new(ranges).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pa_page_arithmetic() {
        let pa = Pa(0x1234_5678);
        assert_eq!(pa.pfn(), 0x12345);
        assert_eq!(pa.offset(), 0x678);
        assert_eq!(Pa::from_pfn(0x12345).0, 0x1234_5000);
    }

    #[test]
    fn pa_table_indices() {
        // 0xDEAD_BEEF_CAFE decomposes into the four 9-bit walk indices.
        let pa = Pa(0x0000_dead_beef_cafe);
        assert_eq!(pa.index(PageTableLevel::Pml4), (0xdead_beef_cafe >> 39) & 0x1ff);
        assert_eq!(pa.index(PageTableLevel::Pdpt), (0xdead_beef_cafe >> 30) & 0x1ff);
        assert_eq!(pa.index(PageTableLevel::Pd), (0xdead_beef_cafe >> 21) & 0x1ff);
        assert_eq!(pa.index(PageTableLevel::Pt), (0xdead_beef_cafe >> 12) & 0x1ff);
    }

    #[test]
    fn level_page_sizes() {
        assert_eq!(PageTableLevel::Pt.page_size(), 0x1000);
        assert_eq!(PageTableLevel::Pd.page_size(), 0x20_0000);
        assert_eq!(PageTableLevel::Pdpt.page_size(), 0x4000_0000);
    }

    #[test]
    fn memory_range_bounds() {
        let range = MemoryRange::new(Pa(0x1000), Pa(0x3000));
        assert!(range.contains(Pa(0x1000)));
        assert!(range.contains(Pa(0x2fff)));
        assert!(!range.contains(Pa(0x3000)));
        assert_eq!(range.size(), 0x2000);
    }

    #[test]
    fn descriptor_rejects_malformed_ranges() {
        // Unaligned.
        assert_eq!(
            PhysicalMemoryDescriptor::new(&[MemoryRange::new(Pa(0x100), Pa(0x2000))]).unwrap_err(),
            ErrorCode::InvalidArgument
        );
        // Empty.
        assert_eq!(
            PhysicalMemoryDescriptor::new(&[MemoryRange::new(Pa(0x2000), Pa(0x2000))]).unwrap_err(),
            ErrorCode::InvalidArgument
        );
        // Too many.
        let many = [MemoryRange::new(Pa(0x0), Pa(0x1000)); MAX_MEMORY_RANGE_COUNT + 1];
        assert_eq!(
            PhysicalMemoryDescriptor::new(&many).unwrap_err(),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn descriptor_page_count() {
        let descriptor = PhysicalMemoryDescriptor::new(&[
            MemoryRange::new(Pa(0x0), Pa(0x4000)),
            MemoryRange::new(Pa(0x10000), Pa(0x12000)),
        ])
        .unwrap();
        assert_eq!(descriptor.page_count(), 6);
        assert_eq!(descriptor.ranges().len(), 2);
    }

    #[test]
    fn identity_bridge_round_trips() {
        testing::init_identity();
        let value = 42u64;
        let pa = Pa::from_va(&value);
        assert_eq!(pa.va() as u64, &value as *const _ as u64);
    }
}
