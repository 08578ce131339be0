//! Shared test utilities: a mock register block and recovery targets.
//!
//! Kept in the crate (not behind `#[cfg(test)]`) so integration tests and
//! benches can drive the control plane without hardware.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::ChipGen;
use crate::regs::{DoorbellRegs, FifoLayout};
use crate::registry::RecoveryTarget;

/// In-memory stand-in for the doorbell register block.
pub struct MockRegs {
    layout: FifoLayout,
    raw_fifo: AtomicU32,
    fail_reads: AtomicBool,
    /// Every `(nq_id, watermark)` programmed into the throttling register.
    pub throttle_writes: Mutex<Vec<(u16, u32)>>,
    /// Every `(nq_id, threshold)` the pacing interrupt was armed with.
    pub arm_calls: Mutex<Vec<(u16, u32)>>,
}

impl MockRegs {
    pub fn new(gen: ChipGen) -> Self {
        let layout = FifoLayout::for_gen(gen);
        Self {
            layout,
            raw_fifo: AtomicU32::new(layout.encode_occupancy(0)),
            fail_reads: AtomicBool::new(false),
            throttle_writes: Mutex::new(Vec::new()),
            arm_calls: Mutex::new(Vec::new()),
        }
    }

    /// Make subsequent FIFO reads report `occupancy` entries in use.
    pub fn set_occupancy(&self, occupancy: u32) {
        self.raw_fifo
            .store(self.layout.encode_occupancy(occupancy), Ordering::Release);
    }

    /// Make FIFO reads fail until called again with `false`.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }

    /// Watermark most recently programmed, if any.
    pub fn last_watermark(&self) -> Option<u32> {
        self.throttle_writes.lock().unwrap().last().map(|&(_, wm)| wm)
    }

    /// Number of throttling register writes so far.
    pub fn throttle_write_count(&self) -> usize {
        self.throttle_writes.lock().unwrap().len()
    }
}

impl DoorbellRegs for MockRegs {
    fn read_db_fifo(&self) -> io::Result<u32> {
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "fifo query timeout"));
        }
        Ok(self.raw_fifo.load(Ordering::Acquire))
    }

    fn write_throttling(&self, nq_id: u16, watermark: u32) {
        self.throttle_writes.lock().unwrap().push((nq_id, watermark));
    }

    fn arm_pacing_interrupt(&self, nq_id: u16, threshold: u32) {
        self.arm_calls.lock().unwrap().push((nq_id, threshold));
    }
}

/// A recovery target backed by atomics.
///
/// With `auto_ack` the target acknowledges the epoch the moment it is
/// notified; without it the target stays stuck until `ack` is called.
pub struct TestTarget {
    notified_epoch: AtomicU32,
    synced_epoch: AtomicU32,
    auto_ack: bool,
}

impl TestTarget {
    pub fn new(auto_ack: bool) -> Self {
        Self {
            notified_epoch: AtomicU32::new(0),
            synced_epoch: AtomicU32::new(0),
            auto_ack,
        }
    }

    /// Epoch this target was last told to resync to.
    pub fn notified_epoch(&self) -> u32 {
        self.notified_epoch.load(Ordering::Acquire)
    }

    /// Complete the resync to the last notified epoch.
    pub fn ack(&self) {
        self.synced_epoch
            .store(self.notified_epoch(), Ordering::Release);
    }
}

impl RecoveryTarget for TestTarget {
    fn begin_resync(&self, epoch: u32) {
        self.notified_epoch.store(epoch, Ordering::Release);
        if self.auto_ack {
            self.synced_epoch.store(epoch, Ordering::Release);
        }
    }

    fn synced_epoch(&self) -> u32 {
        self.synced_epoch.load(Ordering::Acquire)
    }
}

/// Spin until `pred` holds, panicking after two seconds.
pub fn wait_until<F: FnMut() -> bool>(mut pred: F) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !pred() {
        if Instant::now() >= deadline {
            panic!("condition not reached within 2s");
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
