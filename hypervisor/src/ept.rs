//! The module containing the [`EptTable`] type, the 4-level extended page
//! table that maps guest physical addresses to host physical addresses.
//!
//! The table identity-maps every address the host OS can legitimately touch,
//! with the memory type each address really has according to the MTRRs.
//! Features that need a non-identity view (shadow pages) repoint individual
//! leaves with [`EptTable::map_4kb`] after breaking large pages apart with
//! the split operations.
//!
//! All references to external resources (denoted with "See:") refers to
//! "Intel 64 and IA-32 Architectures Software Developer's Manual Volume 3"
//! unless otherwise stated.

use crate::{
    error::ErrorCode,
    mtrr::MtrrDescriptor,
    platform::{MemoryType, Pa, PageTableLevel, PhysicalMemoryDescriptor},
    x86_instructions::{invept, InveptType},
};
use alloc::boxed::Box;
use bit_vec::BitVec;
use bitfield::bitfield;
use bitflags::bitflags;
use core::alloc::Layout;
use x86::current::paging::PAGE_SIZE_ENTRIES;

bitflags! {
    /// Access permissions of an EPT entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EptAccess: u8 {
        /// Data reads are allowed.
        const READ = 1 << 0;
        /// Data writes are allowed.
        const WRITE = 1 << 1;
        /// Instruction fetches are allowed.
        const EXECUTE = 1 << 2;
        /// The conventional full-access leaf.
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
        /// Read and write, no fetch. One half of a shadow-page pair.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Fetch only. The other half of a shadow-page pair; requires the
        /// execute-only EPT capability.
        const EXECUTE_ONLY = Self::EXECUTE.bits();
    }
}

bitfield! {
    /// An entry of any of the four EPT table levels. The common fields below
    /// are valid at every level; `memory_type`, `ignore_pat` and
    /// `large_page` are meaningful for leaves only.
    ///
    /// See: Table 29-6. Format of an EPT Page-Table Entry that Maps a
    ///      4-KByte Page (and Tables 29-2 .. 29-5)
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EptEntry(u64);
    impl Debug;
    pub read_access, set_read_access: 0;
    pub write_access, set_write_access: 1;
    pub execute_access, set_execute_access: 2;
    pub u8, memory_type_bits, set_memory_type_bits: 5, 3;
    pub ignore_pat, set_ignore_pat: 6;
    pub large_page, set_large_page: 7;
    pub accessed, set_accessed: 8;
    pub dirty, set_dirty: 9;
    pub user_execute, set_user_execute: 10;
    pub pfn, set_pfn: 47, 12;
    pub suppress_ve, set_suppress_ve: 63;
}

impl EptEntry {
    /// An entry is present iff any of read/write/execute is granted.
    pub fn is_present(&self) -> bool {
        self.read_access() || self.write_access() || self.execute_access()
    }

    /// Returns the access permissions.
    pub fn access(&self) -> EptAccess {
        EptAccess::from_bits_truncate((self.0 & 0b111) as u8)
    }

    /// Replaces the access permissions.
    pub fn set_access(&mut self, access: EptAccess) {
        self.0 = (self.0 & !0b111) | u64::from(access.bits());
    }

    /// Returns the leaf memory type.
    pub fn memory_type(&self) -> MemoryType {
        MemoryType::from_bits(self.memory_type_bits())
    }

    /// Rewrites the entry as a leaf mapping `pa`.
    pub fn update_leaf(&mut self, pa: Pa, memory_type: MemoryType, access: EptAccess, large: bool) {
        self.0 = 0;
        self.set_pfn(pa.pfn());
        self.set_memory_type_bits(memory_type as u8);
        self.set_large_page(large);
        self.set_access(access);
    }

    /// Rewrites the entry to point at a subtable.
    fn update_subtable(&mut self, pa: Pa) {
        self.0 = 0;
        self.set_pfn(pa.pfn());
        self.set_access(EptAccess::READ_WRITE_EXECUTE);
    }
}

bitfield! {
    /// The EPT pointer loaded into the VMCS.
    ///
    /// See: 25.6.11 Extended-Page-Table Pointer (EPTP)
    #[derive(Clone, Copy)]
    pub struct EptPointer(u64);
    impl Debug;
    pub u8, memory_type_bits, set_memory_type_bits: 2, 0;
    pub page_walk_length, set_page_walk_length: 5, 3;
    pub enable_access_dirty, set_enable_access_dirty: 6;
    pub pfn, set_pfn: 47, 12;
}

/// A 512-entry EPT table page.
#[derive(Clone, Copy)]
#[repr(C, align(4096))]
pub struct EptPageTable {
    /// The entries of this table.
    pub entries: [EptEntry; PAGE_SIZE_ENTRIES],
}
const _: () = assert!(size_of::<EptPageTable>() == 0x1000);

/// A 4-level EPT: one PML4 page plus dynamically allocated subtables, each
/// exclusively owned by the entry pointing at it.
pub struct EptTable {
    pml4: *mut EptPageTable,
    eptp: EptPointer,
    mtrr: MtrrDescriptor,
}

// Safety: the table is owned by exactly one vCPU; cross-CPU access never
// happens (each vCPU owns its EPT exclusively per the concurrency model).
unsafe impl Send for EptTable {}

impl EptTable {
    /// An empty, uninitialized table. Valid as all-zero, which the vCPU
    /// container relies on.
    pub const fn empty() -> Self {
        Self {
            pml4: core::ptr::null_mut(),
            eptp: EptPointer(0),
            mtrr: MtrrDescriptor::disabled(),
        }
    }

    /// Allocates the PML4 and programs the EPT pointer: write-back access to
    /// the paging structures, 4-level walk. Fails with
    /// [`ErrorCode::NotEnoughMemory`] when the page pool is exhausted.
    pub fn initialize(&mut self, mtrr: MtrrDescriptor) -> Result<(), ErrorCode> {
        const EPT_PAGE_WALK_LENGTH_4: u64 = 3;

        debug_assert!(self.pml4.is_null());
        self.mtrr = mtrr;
        self.pml4 = allocate_table().ok_or(ErrorCode::NotEnoughMemory)?;

        let pml4_pa = Pa::from_va(self.pml4);
        let mut eptp = EptPointer(0);
        eptp.set_memory_type_bits(MemoryType::WriteBack as u8);
        eptp.set_page_walk_length(EPT_PAGE_WALK_LENGTH_4);
        eptp.set_pfn(pml4_pa.pfn());
        self.eptp = eptp;
        Ok(())
    }

    /// Returns the value for the VMCS EPT-pointer field.
    pub fn ept_pointer(&self) -> u64 {
        self.eptp.0
    }

    /// Builds the identity map: every page reported by `memory` is mapped
    /// 4 KiB guest_pa == host_pa with its MTRR memory type, aligned fully
    /// populated 512-page runs are then coalesced into 2 MiB leaves, and
    /// unreported holes in the first 4 GiB (MMIO and friends) are covered
    /// with 2 MiB or residual 4 KiB leaves so every legitimately touchable
    /// address stays reachable.
    pub fn identity_map(&mut self, memory: &PhysicalMemoryDescriptor) -> Result<(), ErrorCode> {
        /// 4 GiB in 4 KiB pages; 1 bit each.
        const FOUR_GB_PFN_COUNT: usize = 1 << 20;
        const CHUNK: usize = PAGE_SIZE_ENTRIES;

        let mut pfn_map = BitVec::from_elem(FOUR_GB_PFN_COUNT, false);

        log::debug!("mapping reported ranges with 4kb pages...");
        for range in memory.ranges() {
            for pfn in range.begin.pfn()..range.end.pfn() {
                let pa = Pa::from_pfn(pfn);
                self.map(pa, pa, PageTableLevel::Pt)?;
                if (pfn as usize) < FOUR_GB_PFN_COUNT {
                    pfn_map.set(pfn as usize, true);
                }
            }
        }

        log::debug!("coalescing populated 2mb runs...");
        for chunk in (0..FOUR_GB_PFN_COUNT).step_by(CHUNK) {
            if (chunk..chunk + CHUNK).all(|pfn| pfn_map.get(pfn) == Some(true)) {
                // A run with mixed memory types stays at 4 KiB granularity.
                let _ = self.join_4kb_to_2mb(Pa::from_pfn(chunk as u64));
            }
        }

        log::debug!("covering holes below 4gb...");
        for chunk in (0..FOUR_GB_PFN_COUNT).step_by(CHUNK) {
            if (chunk..chunk + CHUNK).all(|pfn| pfn_map.get(pfn) == Some(false)) {
                let pa = Pa::from_pfn(chunk as u64);
                self.map(pa, pa, PageTableLevel::Pd)?;
                for pfn in chunk..chunk + CHUNK {
                    pfn_map.set(pfn, true);
                }
            } else {
                for pfn in chunk..chunk + CHUNK {
                    if pfn_map.get(pfn) == Some(false) {
                        let pa = Pa::from_pfn(pfn as u64);
                        self.map(pa, pa, PageTableLevel::Pt)?;
                        pfn_map.set(pfn, true);
                    }
                }
            }
        }
        debug_assert!(pfn_map.all());

        log::debug!("identity map done");
        Ok(())
    }

    /// Maps `guest_pa` to `host_pa` with a leaf at `level`, full RWX access
    /// and the MTRR-derived memory type. Subtables are created on demand;
    /// pool exhaustion fails with [`ErrorCode::NotEnoughMemory`].
    pub fn map(
        &mut self,
        guest_pa: Pa,
        host_pa: Pa,
        level: PageTableLevel,
    ) -> Result<&mut EptEntry, ErrorCode> {
        self.map_with(guest_pa, host_pa, level, EptAccess::READ_WRITE_EXECUTE)
    }

    /// Maps a 4 KiB leaf with explicit access bits.
    pub fn map_4kb(
        &mut self,
        guest_pa: Pa,
        host_pa: Pa,
        access: EptAccess,
    ) -> Result<&mut EptEntry, ErrorCode> {
        self.map_with(guest_pa, host_pa, PageTableLevel::Pt, access)
    }

    /// Maps a 2 MiB leaf with explicit access bits.
    pub fn map_2mb(
        &mut self,
        guest_pa: Pa,
        host_pa: Pa,
        access: EptAccess,
    ) -> Result<&mut EptEntry, ErrorCode> {
        self.map_with(guest_pa, host_pa, PageTableLevel::Pd, access)
    }

    /// Maps a 1 GiB leaf with explicit access bits.
    pub fn map_1gb(
        &mut self,
        guest_pa: Pa,
        host_pa: Pa,
        access: EptAccess,
    ) -> Result<&mut EptEntry, ErrorCode> {
        self.map_with(guest_pa, host_pa, PageTableLevel::Pdpt, access)
    }

    fn map_with(
        &mut self,
        guest_pa: Pa,
        host_pa: Pa,
        level: PageTableLevel,
        access: EptAccess,
    ) -> Result<&mut EptEntry, ErrorCode> {
        if self.pml4.is_null() || level == PageTableLevel::Pml4 {
            return Err(ErrorCode::InvalidArgument);
        }

        let memory_type = self.mtrr.memory_type_for(guest_pa);
        let mut table = self.pml4;
        let mut current = PageTableLevel::Pml4;
        while current != level {
            // Safety: `table` is a live table page owned by this EPT.
            let entry = unsafe { &mut (*table).entries[guest_pa.index(current)] };
            table = subtable_or_create(entry).ok_or(ErrorCode::NotEnoughMemory)?;
            current = current.next_down();
        }

        // Safety: as above; `current == level` selects the leaf slot.
        let entry = unsafe { &mut (*table).entries[guest_pa.index(level)] };
        entry.update_leaf(host_pa, memory_type, access, level != PageTableLevel::Pt);
        Ok(entry)
    }

    /// Replaces the 1 GiB leaf covering `pa` with a table of 512 2 MiB
    /// leaves reproducing the same coverage. Fails with
    /// [`ErrorCode::NotEnoughMemory`] when no page backs the new table.
    pub fn split_1gb_to_2mb(&mut self, pa: Pa) -> Result<(), ErrorCode> {
        self.split(pa, PageTableLevel::Pdpt)
    }

    /// Replaces the 2 MiB leaf covering `pa` with a table of 512 4 KiB
    /// leaves reproducing the same coverage. Fails with
    /// [`ErrorCode::NotEnoughMemory`] when no page backs the new table.
    pub fn split_2mb_to_4kb(&mut self, pa: Pa) -> Result<(), ErrorCode> {
        self.split(pa, PageTableLevel::Pd)
    }

    fn split(&mut self, pa: Pa, level: PageTableLevel) -> Result<(), ErrorCode> {
        let entry = self.entry_at(pa, level).ok_or(ErrorCode::InvalidArgument)?;
        // Safety: the entry pointer is derived from live tables above.
        let entry = unsafe { &mut *entry };
        if !entry.is_present() || !entry.large_page() {
            return Err(ErrorCode::InvalidArgument);
        }

        let access = entry.access();
        let memory_type = entry.memory_type();
        let base_pfn = entry.pfn();
        let child_large = level.next_down() != PageTableLevel::Pt;
        let pfn_stride = level.next_down().page_size() >> 12;

        let table = allocate_table().ok_or(ErrorCode::NotEnoughMemory)?;
        for (i, child) in
            // Safety: freshly allocated table page.
            unsafe { &mut (*table).entries }.iter_mut().enumerate()
        {
            child.update_leaf(
                Pa::from_pfn(base_pfn + i as u64 * pfn_stride),
                memory_type,
                access,
                child_large,
            );
        }
        entry.update_subtable(Pa::from_va(table));
        Ok(())
    }

    /// Collapses 512 contiguous identity 2 MiB leaves back into one 1 GiB
    /// leaf. Fails unless all children agree on access and memory type and
    /// exactly reproduce the covered range.
    pub fn join_2mb_to_1gb(&mut self, pa: Pa) -> Result<(), ErrorCode> {
        self.join(pa, PageTableLevel::Pdpt)
    }

    /// Collapses 512 contiguous identity 4 KiB leaves back into one 2 MiB
    /// leaf. Fails unless all children agree on access and memory type and
    /// exactly reproduce the covered range.
    pub fn join_4kb_to_2mb(&mut self, pa: Pa) -> Result<(), ErrorCode> {
        self.join(pa, PageTableLevel::Pd)
    }

    fn join(&mut self, pa: Pa, level: PageTableLevel) -> Result<(), ErrorCode> {
        let entry = self.entry_at(pa, level).ok_or(ErrorCode::InvalidArgument)?;
        // Safety: the entry pointer is derived from live tables above.
        let entry = unsafe { &mut *entry };
        if !entry.is_present() || entry.large_page() {
            return Err(ErrorCode::InvalidArgument);
        }

        let table = Pa::from_pfn(entry.pfn()).va().cast::<EptPageTable>();
        // Safety: present non-leaf entries own their subtable page.
        let children = unsafe { &(*table).entries };

        let first = children[0];
        let pfn_stride = level.next_down().page_size() >> 12;
        let expected_base = (pa.0 & !(level.page_size() - 1)) >> 12;
        if !first.is_present() || first.pfn() != expected_base {
            return Err(ErrorCode::InvalidArgument);
        }
        for (i, child) in children.iter().enumerate() {
            if !child.is_present()
                || child.pfn() != first.pfn() + i as u64 * pfn_stride
                || child.access() != first.access()
                || child.memory_type() != first.memory_type()
                || (child.large_page() != (level.next_down() != PageTableLevel::Pt))
            {
                return Err(ErrorCode::InvalidArgument);
            }
        }

        let access = first.access();
        let memory_type = first.memory_type();
        let base = Pa::from_pfn(first.pfn());
        entry.update_leaf(base, memory_type, access, true);
        free_table(table);
        Ok(())
    }

    /// Walks the table and returns the host physical address, memory type
    /// and mapping level for `guest_pa`, or `None` without a present leaf.
    pub fn translate(&self, guest_pa: Pa) -> Option<(Pa, MemoryType, PageTableLevel)> {
        let mut table = self.pml4;
        if table.is_null() {
            return None;
        }
        let mut current = PageTableLevel::Pml4;
        loop {
            // Safety: live table pages owned by this EPT.
            let entry = unsafe { &(*table).entries[guest_pa.index(current)] };
            if !entry.is_present() {
                return None;
            }
            let leaf = current == PageTableLevel::Pt
                || (current != PageTableLevel::Pml4 && entry.large_page());
            if leaf {
                let offset = guest_pa.0 & (current.page_size() - 1);
                return Some((
                    Pa((entry.pfn() << 12) + offset),
                    entry.memory_type(),
                    current,
                ));
            }
            table = Pa::from_pfn(entry.pfn()).va().cast::<EptPageTable>();
            current = current.next_down();
        }
    }

    /// Invalidates guest-physical mappings derived from this EPT.
    pub fn invalidate(&self) {
        invept(InveptType::SingleContext, self.eptp.0);
    }

    /// Frees every subtable depth-first, then the PML4. Idempotent.
    pub fn destroy(&mut self) {
        if self.pml4.is_null() {
            return;
        }
        destroy_table(self.pml4, PageTableLevel::Pml4);
        self.pml4 = core::ptr::null_mut();
        self.eptp = EptPointer(0);
    }

    /// Returns a pointer to the entry at `level` covering `pa`, walking but
    /// not creating subtables.
    fn entry_at(&self, pa: Pa, level: PageTableLevel) -> Option<*mut EptEntry> {
        let mut table = self.pml4;
        if table.is_null() {
            return None;
        }
        let mut current = PageTableLevel::Pml4;
        while current != level {
            // Safety: live table pages owned by this EPT.
            let entry = unsafe { &(*table).entries[pa.index(current)] };
            if !entry.is_present() || entry.large_page() {
                return None;
            }
            table = Pa::from_pfn(entry.pfn()).va().cast::<EptPageTable>();
            current = current.next_down();
        }
        // Safety: as above.
        Some(unsafe { &mut (*table).entries[pa.index(level)] } as *mut _)
    }
}

impl Drop for EptTable {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl core::fmt::Debug for EptTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EptTable")
            .field("pml4", &self.pml4)
            .field("eptp", &self.eptp.0)
            .finish_non_exhaustive()
    }
}

fn subtable_or_create(entry: &mut EptEntry) -> Option<*mut EptPageTable> {
    if entry.is_present() {
        debug_assert!(!entry.large_page(), "mapping under an existing large leaf");
        Some(Pa::from_pfn(entry.pfn()).va().cast::<EptPageTable>())
    } else {
        let table = allocate_table()?;
        entry.update_subtable(Pa::from_va(table));
        Some(table)
    }
}

/// Allocates one zeroed table page, or `None` when the page pool is
/// exhausted. Zeroed entries are non-present, so a fresh table maps
/// nothing.
fn allocate_table() -> Option<*mut EptPageTable> {
    // The raw allocation path reports exhaustion as null instead of
    // aborting through the global OOM handler.
    // Safety: the layout is non-zero sized.
    let table = unsafe { alloc::alloc::alloc_zeroed(Layout::new::<EptPageTable>()) };
    if table.is_null() {
        None
    } else {
        Some(table.cast::<EptPageTable>())
    }
}

fn free_table(table: *mut EptPageTable) {
    // Safety: tables are exclusively owned by the entry that pointed at
    // them, which the caller just rewrote.
    drop(unsafe { Box::from_raw(table) });
}

fn destroy_table(table: *mut EptPageTable, level: PageTableLevel) {
    if level != PageTableLevel::Pt {
        // Safety: live table page owned by this EPT.
        for entry in unsafe { &(*table).entries } {
            if entry.is_present() && !entry.large_page() && level != PageTableLevel::Pd {
                destroy_table(
                    Pa::from_pfn(entry.pfn()).va().cast::<EptPageTable>(),
                    level.next_down(),
                );
            } else if entry.is_present() && !entry.large_page() {
                // A PD entry points at a PT, which holds no subtables.
                free_table(Pa::from_pfn(entry.pfn()).va().cast::<EptPageTable>());
            }
        }
    }
    free_table(table);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{testing, MemoryRange};

    fn table_with_wb() -> EptTable {
        testing::init_identity();
        let mut table = EptTable::empty();
        table.initialize(MtrrDescriptor::for_tests_write_back()).unwrap();
        table
    }

    #[test]
    fn entry_layout_matches_hardware() {
        let mut entry = EptEntry(0);
        entry.update_leaf(Pa(0x1234_5000), MemoryType::WriteBack, EptAccess::READ_WRITE_EXECUTE, false);
        // R/W/X = bits 0..2, WB (6) at bits 3..5, pfn at bit 12.
        assert_eq!(entry.0, 0b111 | (6 << 3) | 0x1234_5000);

        entry.update_leaf(Pa(0x20_0000), MemoryType::Uncacheable, EptAccess::EXECUTE_ONLY, true);
        assert_eq!(entry.0, 0b100 | (1 << 7) | 0x20_0000);
        assert!(entry.large_page());
        assert!(entry.is_present());

        entry.set_access(EptAccess::empty());
        assert!(!entry.is_present());
    }

    #[test]
    fn map_and_translate_4kb() {
        let mut ept = table_with_wb();
        ept.map(Pa(0x1000), Pa(0x1000), PageTableLevel::Pt).unwrap();
        let (pa, memory_type, level) = ept.translate(Pa(0x1234)).unwrap();
        assert_eq!(pa, Pa(0x1234));
        assert_eq!(memory_type, MemoryType::WriteBack);
        assert_eq!(level, PageTableLevel::Pt);
        assert!(ept.translate(Pa(0x2000)).is_none());
    }

    #[test]
    fn map_2mb_leaf_covers_the_whole_range() {
        let mut ept = table_with_wb();
        ept.map(Pa(0x20_0000), Pa(0x20_0000), PageTableLevel::Pd).unwrap();
        let (pa, _, level) = ept.translate(Pa(0x3f_ffff)).unwrap();
        assert_eq!(pa, Pa(0x3f_ffff));
        assert_eq!(level, PageTableLevel::Pd);
    }

    #[test]
    fn split_then_join_restores_the_leaf_exactly() {
        let mut ept = table_with_wb();
        ept.map(Pa(0x20_0000), Pa(0x20_0000), PageTableLevel::Pd).unwrap();
        let original = unsafe { *ept.entry_at(Pa(0x20_0000), PageTableLevel::Pd).unwrap() };

        ept.split_2mb_to_4kb(Pa(0x20_0000)).unwrap();
        let (pa, _, level) = ept.translate(Pa(0x21_1234)).unwrap();
        assert_eq!(pa, Pa(0x21_1234));
        assert_eq!(level, PageTableLevel::Pt);

        ept.join_4kb_to_2mb(Pa(0x20_0000)).unwrap();
        let restored = unsafe { *ept.entry_at(Pa(0x20_0000), PageTableLevel::Pd).unwrap() };
        assert_eq!(original, restored);
    }

    #[test]
    fn join_rejects_non_contiguous_children() {
        let mut ept = table_with_wb();
        ept.map(Pa(0x20_0000), Pa(0x20_0000), PageTableLevel::Pd).unwrap();
        ept.split_2mb_to_4kb(Pa(0x20_0000)).unwrap();
        // Repoint one child elsewhere; the run is no longer contiguous.
        ept.map_4kb(Pa(0x21_0000), Pa(0x5000_0000), EptAccess::READ_WRITE_EXECUTE).unwrap();
        assert_eq!(
            ept.join_4kb_to_2mb(Pa(0x20_0000)).unwrap_err(),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn join_rejects_mixed_access() {
        let mut ept = table_with_wb();
        ept.map(Pa(0x20_0000), Pa(0x20_0000), PageTableLevel::Pd).unwrap();
        ept.split_2mb_to_4kb(Pa(0x20_0000)).unwrap();
        ept.map_4kb(Pa(0x21_0000), Pa(0x21_0000), EptAccess::READ_WRITE).unwrap();
        assert!(ept.join_4kb_to_2mb(Pa(0x20_0000)).is_err());
    }

    #[test]
    fn split_1gb_produces_2mb_leaves() {
        let mut ept = table_with_wb();
        ept.map(Pa(0x4000_0000), Pa(0x4000_0000), PageTableLevel::Pdpt).unwrap();
        ept.split_1gb_to_2mb(Pa(0x4000_0000)).unwrap();
        let (pa, _, level) = ept.translate(Pa(0x5234_5678)).unwrap();
        assert_eq!(pa, Pa(0x5234_5678));
        assert_eq!(level, PageTableLevel::Pd);
        ept.join_2mb_to_1gb(Pa(0x4000_0000)).unwrap();
        let (_, _, level) = ept.translate(Pa(0x5234_5678)).unwrap();
        assert_eq!(level, PageTableLevel::Pdpt);
    }

    #[test]
    fn shadow_style_remap_changes_translation() {
        let mut ept = table_with_wb();
        ept.map(Pa(0x20_0000), Pa(0x20_0000), PageTableLevel::Pd).unwrap();
        ept.split_2mb_to_4kb(Pa(0x20_0000)).unwrap();
        ept.map_4kb(Pa(0x25_0000), Pa(0x7000_0000), EptAccess::EXECUTE_ONLY).unwrap();
        let (pa, _, _) = ept.translate(Pa(0x25_0123)).unwrap();
        assert_eq!(pa, Pa(0x7000_0123));
    }

    #[test]
    fn identity_map_covers_reported_pages_and_holes() {
        testing::init_identity();
        let mut ept = EptTable::empty();
        ept.initialize(MtrrDescriptor::for_tests_write_back()).unwrap();
        // 8 MiB of "RAM" plus a page straddling nothing above 4 GiB.
        let memory = testing::memory_of(&[
            MemoryRange::new(Pa(0x0), Pa(0x80_0000)),
            MemoryRange::new(Pa(0x1_0000_0000), Pa(0x1_0000_2000)),
        ]);
        ept.identity_map(&memory).unwrap();

        // Reported pages resolve identically; fully populated runs merged.
        let (pa, _, level) = ept.translate(Pa(0x12_3456)).unwrap();
        assert_eq!(pa, Pa(0x12_3456));
        assert_eq!(level, PageTableLevel::Pd);

        // Pages above 4 GiB stay 4 KiB.
        let (pa, _, level) = ept.translate(Pa(0x1_0000_1abc)).unwrap();
        assert_eq!(pa, Pa(0x1_0000_1abc));
        assert_eq!(level, PageTableLevel::Pt);

        // A hole below 4 GiB (MMIO space) is still reachable.
        let (pa, _, level) = ept.translate(Pa(0xfee0_0000)).unwrap();
        assert_eq!(pa, Pa(0xfee0_0000));
        assert_eq!(level, PageTableLevel::Pd);

        // Nothing above 4 GiB other than reported ranges is mapped.
        assert!(ept.translate(Pa(0x2_0000_0000)).is_none());
    }

    #[test]
    fn destroy_unmaps_everything() {
        let mut ept = table_with_wb();
        ept.map(Pa(0x1000), Pa(0x1000), PageTableLevel::Pt).unwrap();
        ept.destroy();
        assert!(ept.translate(Pa(0x1000)).is_none());
        // Idempotent.
        ept.destroy();
    }
}
