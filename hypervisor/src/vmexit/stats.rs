//! The module containing the [`StatsHandler`] type, a composable layer that
//! counts VM exits without altering their handling.

use super::ExitHandler;
use crate::{
    vcpu::VCpu,
    vmx::{ExitReason, EXIT_REASON_COUNT},
};
use core::sync::atomic::{AtomicU64, Ordering};

const CPUID_BUCKET_COUNT: usize = 32;

/// Counts exits per reason, with extra buckets for the noisy ones: exception
/// vectors, CPUID leaves in the basic and extended ranges, I/O direction and
/// MSR direction. One instance is shared by every vCPU, hence the atomics.
pub struct StatsHandler {
    vmexit: [AtomicU64; EXIT_REASON_COUNT],
    exception_vector: [AtomicU64; 32],
    cpuid_basic: [AtomicU64; CPUID_BUCKET_COUNT],
    cpuid_extended: [AtomicU64; CPUID_BUCKET_COUNT],
    io_in: AtomicU64,
    io_out: AtomicU64,
    msr_read: AtomicU64,
    msr_write: AtomicU64,
}

impl StatsHandler {
    /// A handler with all counters at zero.
    pub const fn new() -> Self {
        Self {
            vmexit: [const { AtomicU64::new(0) }; EXIT_REASON_COUNT],
            exception_vector: [const { AtomicU64::new(0) }; 32],
            cpuid_basic: [const { AtomicU64::new(0) }; CPUID_BUCKET_COUNT],
            cpuid_extended: [const { AtomicU64::new(0) }; CPUID_BUCKET_COUNT],
            io_in: AtomicU64::new(0),
            io_out: AtomicU64::new(0),
            msr_read: AtomicU64::new(0),
            msr_write: AtomicU64::new(0),
        }
    }

    /// Returns how often `reason` has exited so far.
    pub fn count(&self, reason: ExitReason) -> u64 {
        self.vmexit[reason.index()].load(Ordering::Relaxed)
    }

    /// Logs every non-zero counter. Call from non-root mode only.
    pub fn dump(&self) {
        for (index, counter) in self.vmexit.iter().enumerate() {
            let count = counter.load(Ordering::Relaxed);
            if count != 0 {
                let reason = ExitReason::from_u16(index as u16).expect("table-sized index");
                log::info!("{count:>10} {reason:?}");
            }
        }
        for (vector, counter) in self.exception_vector.iter().enumerate() {
            let count = counter.load(Ordering::Relaxed);
            if count != 0 {
                log::info!("{count:>10} exception vector {vector}");
            }
        }
        log::info!(
            "io in/out {}/{}, msr read/write {}/{}",
            self.io_in.load(Ordering::Relaxed),
            self.io_out.load(Ordering::Relaxed),
            self.msr_read.load(Ordering::Relaxed),
            self.msr_write.load(Ordering::Relaxed),
        );
    }

    fn record(&self, vp: &mut VCpu) {
        let raw = vp.exit_reason_raw();
        let Some(reason) = ExitReason::from_u16(raw) else {
            return;
        };
        let _ = self.vmexit[reason.index()].fetch_add(1, Ordering::Relaxed);

        match reason {
            ExitReason::ExceptionOrNmi => {
                let vector = vp.exit_interruption_info().vector() as usize;
                if let Some(counter) = self.exception_vector.get(vector) {
                    let _ = counter.fetch_add(1, Ordering::Relaxed);
                }
            }
            ExitReason::ExecuteCpuid => {
                let leaf = vp.exit_context().rax as u32;
                let bucket = (leaf & 0x7fff_ffff) as usize;
                let counters = if leaf < 0x8000_0000 {
                    &self.cpuid_basic
                } else {
                    &self.cpuid_extended
                };
                if let Some(counter) = counters.get(bucket) {
                    let _ = counter.fetch_add(1, Ordering::Relaxed);
                }
            }
            ExitReason::ExecuteIoInstruction => {
                let qualification = crate::vmx::QualificationIo(vp.exit_qualification());
                let counter = if qualification.access_in() {
                    &self.io_in
                } else {
                    &self.io_out
                };
                let _ = counter.fetch_add(1, Ordering::Relaxed);
            }
            ExitReason::ExecuteRdmsr => {
                let _ = self.msr_read.fetch_add(1, Ordering::Relaxed);
            }
            ExitReason::ExecuteWrmsr => {
                let _ = self.msr_write.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

impl Default for StatsHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitHandler for StatsHandler {
    /// Observes the exit; emulation belongs to the layer composed after
    /// this one.
    fn handle(&self, vp: &mut VCpu) {
        self.record(vp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = StatsHandler::new();
        assert_eq!(stats.count(ExitReason::ExecuteCpuid), 0);
        assert_eq!(stats.count(ExitReason::EptViolation), 0);
    }

    #[test]
    fn per_reason_counters_are_independent() {
        let stats = StatsHandler::new();
        let _ = stats.vmexit[ExitReason::ExecuteCpuid.index()].fetch_add(3, Ordering::Relaxed);
        let _ = stats.vmexit[ExitReason::MovCr.index()].fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.count(ExitReason::ExecuteCpuid), 3);
        assert_eq!(stats.count(ExitReason::MovCr), 1);
        assert_eq!(stats.count(ExitReason::ExecuteRdtsc), 0);
    }
}
