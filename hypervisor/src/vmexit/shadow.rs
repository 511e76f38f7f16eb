//! The module containing the [`ShadowPageHandler`] type.
//!
//! A shadow page is a pair of host physical pages aliasing one guest
//! physical page: the guest reads and writes one bit pattern and fetches
//! another. The split view is driven entirely by EPT: the active leaf is
//! either the read/write page without execute access or the execute page
//! without read/write access, and every access of the "wrong" kind raises
//! an EPT violation that flips the leaf.

use super::{passthrough, dispatch, ExitHandler};
use crate::{
    ept::EptAccess,
    error::ErrorCode,
    platform::{self, Pa},
    vcpu::VCpu,
    vmx::QualificationEptViolation,
};
use spin::Mutex;

/// The VMCALL selector that installs the configured shadow pages into the
/// calling vCPU's EPT. Issued by the management driver, so CPL 0 is
/// guaranteed architecture-side but checked anyway.
pub const VMCALL_APPLY_SHADOW_PAGES_ID: u64 = 0x01;

/// The maximum number of shadow pages one handler instance can hold.
pub const MAX_SHADOW_PAGE_COUNT: usize = 64;

const MAX_VCPU_COUNT: usize = 64;

/// One read-write/execute page pair aliasing the guest physical page that
/// currently contains `rw_pa`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShadowPage {
    /// The page the guest sees on data reads and writes; its PFN is also
    /// the guest physical page being shadowed.
    pub rw_pa: Pa,
    /// The page the guest executes from.
    pub x_pa: Pa,
    /// Offset of the patched bytes within the page, kept for bookkeeping.
    pub offset: u64,
}

struct ShadowPageList {
    pages: [ShadowPage; MAX_SHADOW_PAGE_COUNT],
    count: usize,
}

/// Pass-through handling plus EPT-driven split views for registered shadow
/// pages.
pub struct ShadowPageHandler {
    pages: Mutex<ShadowPageList>,
    /// Whether each vCPU currently exposes the execute view. All views
    /// start on the read/write side after `apply`.
    exec_view: [Mutex<bool>; MAX_VCPU_COUNT],
}

impl ShadowPageHandler {
    /// A handler with no shadow pages registered.
    pub const fn new() -> Self {
        Self {
            pages: Mutex::new(ShadowPageList {
                pages: [ShadowPage {
                    rw_pa: Pa(0),
                    x_pa: Pa(0),
                    offset: 0,
                }; MAX_SHADOW_PAGE_COUNT],
                count: 0,
            }),
            exec_view: [const { Mutex::new(false) }; MAX_VCPU_COUNT],
        }
    }

    /// Registers a shadow page. Takes effect at the next
    /// [`VMCALL_APPLY_SHADOW_PAGES_ID`] hypercall.
    pub fn add_page(&self, page: ShadowPage) -> Result<(), ErrorCode> {
        if page.rw_pa.offset() != 0 || page.x_pa.offset() != 0 {
            return Err(ErrorCode::InvalidArgument);
        }
        let mut list = self.pages.lock();
        if list.count == MAX_SHADOW_PAGE_COUNT {
            return Err(ErrorCode::NotEnoughMemory);
        }
        let index = list.count;
        list.pages[index] = page;
        list.count += 1;
        Ok(())
    }

    /// Drops all registered pages. Already-applied EPT views stay until the
    /// identity mapping is rebuilt or overwritten.
    pub fn clear(&self) {
        self.pages.lock().count = 0;
    }

    /// Installs the split view for every registered page into this vCPU's
    /// EPT: the 2 MiB leaf covering the target is broken into 4 KiB pages
    /// and the execute page goes live fetch-only, so the very first data
    /// access faults over to the read/write side.
    fn apply(&self, vp: &mut VCpu) {
        let list = self.pages.lock();
        for page in &list.pages[..list.count] {
            let guest_pa = Pa::from_pfn(page.rw_pa.pfn());
            let _ = vp.ept_mut().split_2mb_to_4kb(guest_pa);
            if vp
                .ept_mut()
                .map_4kb(guest_pa, page.x_pa, EptAccess::EXECUTE_ONLY)
                .is_err()
            {
                log::error!("shadow view installation failed at {guest_pa:?}");
                continue;
            }
            *self.exec_view[cpu_index()].lock() = true;
            log::debug!("shadow page live: {guest_pa:?} -> x {:?}", page.x_pa);
        }
        vp.ept_mut().invalidate();
    }

    /// Finds the registered page shadowing `guest_pa`.
    fn find(&self, guest_pa: Pa) -> Option<ShadowPage> {
        let list = self.pages.lock();
        list.pages[..list.count]
            .iter()
            .copied()
            .find(|page| page.rw_pa.pfn() == guest_pa.pfn())
    }
}

impl Default for ShadowPageHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitHandler for ShadowPageHandler {
    fn setup(&self, vp: &mut VCpu) {
        vp.capture_current_state_into_guest();
        *self.exec_view[cpu_index()].lock() = false;
    }

    fn handle(&self, vp: &mut VCpu) {
        dispatch(self, vp);
    }

    fn handle_execute_vmcall(&self, vp: &mut VCpu) {
        if vp.exit_context().rcx == VMCALL_APPLY_SHADOW_PAGES_ID && vp.guest_cpl() == 0 {
            self.apply(vp);
        } else {
            passthrough::vmcall_exit(vp);
        }
    }

    fn handle_ept_violation(&self, vp: &mut VCpu) {
        let qualification = QualificationEptViolation(vp.exit_qualification());
        let guest_pa = vp.exit_guest_physical_address();

        // The faulting instruction is re-executed against the new view.
        vp.suppress_rip_adjust();

        let Some(page) = self.find(guest_pa) else {
            // Not ours. An identity-mapped guest cannot legitimately get
            // here; surfacing the address is all that can be done.
            log::error!("unexpected EPT violation at {guest_pa:?}");
            return;
        };

        let guest_base = Pa::from_pfn(guest_pa.pfn());
        let mut exec_view = self.exec_view[cpu_index()].lock();
        if qualification.data_read() || qualification.data_write() {
            // Data access while the execute page is visible: show the
            // read/write page, revoke fetch.
            let _ = vp
                .ept_mut()
                .map_4kb(guest_base, page.rw_pa, EptAccess::READ_WRITE);
            *exec_view = false;
        } else if qualification.data_execute() {
            // Fetch while the read/write page is visible: swap back.
            let _ = vp
                .ept_mut()
                .map_4kb(guest_base, page.x_pa, EptAccess::EXECUTE_ONLY);
            *exec_view = true;
        }
        drop(exec_view);
        vp.ept_mut().invalidate();
    }
}

fn cpu_index() -> usize {
    (platform::ops().cpu_index)() as usize % MAX_VCPU_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_list_is_bounded() {
        let handler = ShadowPageHandler::new();
        for index in 0..MAX_SHADOW_PAGE_COUNT {
            handler
                .add_page(ShadowPage {
                    rw_pa: Pa(index as u64 * 0x1000),
                    x_pa: Pa(0x1000_0000 + index as u64 * 0x1000),
                    offset: 0x10,
                })
                .unwrap();
        }
        let overflow = handler.add_page(ShadowPage::default());
        assert_eq!(overflow.unwrap_err(), ErrorCode::NotEnoughMemory);
        handler.clear();
        assert!(handler.add_page(ShadowPage::default()).is_ok());
    }

    #[test]
    fn unaligned_pages_are_rejected(){
        let handler = ShadowPageHandler::new();
        let status = handler.add_page(ShadowPage {
            rw_pa: Pa(0x1234),
            x_pa: Pa(0x2000),
            offset: 0,
        });
        assert_eq!(status.unwrap_err(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn find_matches_by_guest_frame() {
        let handler = ShadowPageHandler::new();
        handler
            .add_page(ShadowPage {
                rw_pa: Pa(0x7000),
                x_pa: Pa(0x9000),
                offset: 0x80,
            })
            .unwrap();
        let hit = handler.find(Pa(0x7abc)).unwrap();
        assert_eq!(hit.x_pa, Pa(0x9000));
        assert!(handler.find(Pa(0x8000)).is_none());
    }
}
