//! The module containing the [`DbgbreakHandler`] type, a composable layer
//! that fires one-shot debugger breakpoints on selected guest events.
//!
//! Each predicate is an atomic flag consumed on first match, so a single
//! arming produces a single break even with every processor exiting
//! concurrently.

use super::ExitHandler;
use crate::{
    vcpu::VCpu,
    vmx::{
        mov_cr_access, ExitReason, QualificationIo, QualificationMovCr, QualificationMovDr,
        EXIT_REASON_COUNT,
    },
    x86_instructions::debug_break,
};
use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, Ordering};

/// Breaks into the debugger when an armed event fires. Compose it in front
/// of the pass-through handler; it never modifies guest state.
pub struct DbgbreakHandler {
    vmexit: [AtomicBool; EXIT_REASON_COUNT],
    exception_vector: [AtomicBool; 32],
    mov_to_cr: [AtomicBool; 16],
    mov_from_cr: [AtomicBool; 16],
    clts: AtomicBool,
    lmsw: AtomicBool,
    mov_to_dr: [AtomicBool; 8],
    mov_from_dr: [AtomicBool; 8],
    io_in: Box<[AtomicBool]>,
    io_out: Box<[AtomicBool]>,
}

impl DbgbreakHandler {
    /// A handler with nothing armed.
    pub fn new() -> Self {
        Self {
            vmexit: [const { AtomicBool::new(false) }; EXIT_REASON_COUNT],
            exception_vector: [const { AtomicBool::new(false) }; 32],
            mov_to_cr: [const { AtomicBool::new(false) }; 16],
            mov_from_cr: [const { AtomicBool::new(false) }; 16],
            clts: AtomicBool::new(false),
            lmsw: AtomicBool::new(false),
            mov_to_dr: [const { AtomicBool::new(false) }; 8],
            mov_from_dr: [const { AtomicBool::new(false) }; 8],
            io_in: boxed_flags(0x10000),
            io_out: boxed_flags(0x10000),
        }
    }

    /// Arms a break on the next exit with `reason`.
    pub fn break_on_reason(&self, reason: ExitReason) {
        self.vmexit[reason.index()].store(true, Ordering::SeqCst);
    }

    /// Arms a break on the next intercepted exception with `vector`.
    pub fn break_on_exception(&self, vector: u8) {
        if let Some(flag) = self.exception_vector.get(vector as usize) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Arms a break on the next IN from `port`.
    pub fn break_on_io_in(&self, port: u16) {
        self.io_in[usize::from(port)].store(true, Ordering::SeqCst);
    }

    /// Arms a break on the next OUT to `port`.
    pub fn break_on_io_out(&self, port: u16) {
        self.io_out[usize::from(port)].store(true, Ordering::SeqCst);
    }

    /// Arms a break on the next write to control register `cr`.
    pub fn break_on_mov_to_cr(&self, cr: u8) {
        if let Some(flag) = self.mov_to_cr.get(cr as usize) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Arms a break on the next write to debug register `dr`.
    pub fn break_on_mov_to_dr(&self, dr: u8) {
        if let Some(flag) = self.mov_to_dr.get(dr as usize) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Fires at most once per arming.
    fn break_if(flag: &AtomicBool) {
        if flag
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            debug_break();
        }
    }

    fn check(&self, vp: &mut VCpu) {
        let raw = vp.exit_reason_raw();
        let Some(reason) = ExitReason::from_u16(raw) else {
            return;
        };
        Self::break_if(&self.vmexit[reason.index()]);

        match reason {
            ExitReason::ExceptionOrNmi => {
                let vector = vp.exit_interruption_info().vector() as usize;
                if let Some(flag) = self.exception_vector.get(vector) {
                    Self::break_if(flag);
                }
            }
            ExitReason::MovCr => {
                let qualification = QualificationMovCr(vp.exit_qualification());
                let cr = qualification.cr_number() as usize;
                match qualification.access_type() {
                    mov_cr_access::MOV_TO_CR => Self::break_if(&self.mov_to_cr[cr & 0xf]),
                    mov_cr_access::MOV_FROM_CR => Self::break_if(&self.mov_from_cr[cr & 0xf]),
                    mov_cr_access::CLTS => Self::break_if(&self.clts),
                    _ => Self::break_if(&self.lmsw),
                }
            }
            ExitReason::MovDr => {
                let qualification = QualificationMovDr(vp.exit_qualification());
                let dr = qualification.dr_number() as usize & 0x7;
                if qualification.direction_from_dr() {
                    Self::break_if(&self.mov_from_dr[dr]);
                } else {
                    Self::break_if(&self.mov_to_dr[dr]);
                }
            }
            ExitReason::ExecuteIoInstruction => {
                let qualification = QualificationIo(vp.exit_qualification());
                let port = qualification.port_number() as usize;
                if qualification.access_in() {
                    Self::break_if(&self.io_in[port]);
                } else {
                    Self::break_if(&self.io_out[port]);
                }
            }
            _ => {}
        }
    }
}

impl Default for DbgbreakHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitHandler for DbgbreakHandler {
    /// Observes the exit; emulation belongs to the layer composed after
    /// this one.
    fn handle(&self, vp: &mut VCpu) {
        self.check(vp);
    }
}

fn boxed_flags(count: usize) -> Box<[AtomicBool]> {
    let mut flags = alloc::vec::Vec::with_capacity(count);
    flags.resize_with(count, || AtomicBool::new(false));
    flags.into_boxed_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn break_if_consumes_the_flag() {
        let flag = AtomicBool::new(false);
        // Unarmed: nothing happens (debug_break would SIGTRAP the test).
        DbgbreakHandler::break_if(&flag);
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn arming_is_per_event() {
        let handler = DbgbreakHandler::new();
        handler.break_on_reason(ExitReason::ExecuteCpuid);
        assert!(handler.vmexit[ExitReason::ExecuteCpuid.index()].load(Ordering::SeqCst));
        assert!(!handler.vmexit[ExitReason::MovCr.index()].load(Ordering::SeqCst));

        handler.break_on_io_in(0x64);
        assert!(handler.io_in[0x64].load(Ordering::SeqCst));
        assert!(!handler.io_out[0x64].load(Ordering::SeqCst));
    }
}
