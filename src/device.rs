//! Device context: the ownership root of the control plane.
//!
//! One `DeviceContext` per adapter holds the resource registry, the pacing
//! and recovery engines, and the statistics blocks. A process-wide list of
//! live contexts backs the validity check that guards query accessors
//! against use during teardown. Nothing here is persisted; everything is
//! rebuilt from the capability query when a context is created.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bitflags::bitflags;
use tracing::debug;

use crate::config::{DeviceCaps, PacingConfig};
use crate::error::{Error, Result};
use crate::events::{AsyncEventCmpl, EventKind};
use crate::pacing::{PacingData, PacingEngine, PacingSnapshot};
use crate::recovery::RecoveryEngine;
use crate::registry::{RecoveryTarget, ResType, ResourceRegistry};
use crate::regs::DoorbellRegs;
use crate::stats::{
    DbqStats, DbqStatsSnapshot, DbrSwStats, DbrSwStatsSnapshot, SpPerfStats, RECOV_LAT_SLABS,
};

bitflags! {
    /// Device lifecycle flag bits. Bit positions are stable; inspection
    /// tooling reads them numerically.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        const IBDEV_REGISTERED = 1 << 1;
        const ERR_DEVICE_DETACHED = 1 << 17;
        const STOP_IN_PROGRESS = 1 << 20;
    }
}

/// Device flag bits shared across threads without a lock.
#[derive(Debug, Default)]
pub struct AtomicDeviceFlags {
    bits: AtomicU32,
}

impl AtomicDeviceFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, flags: DeviceFlags) {
        self.bits.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear(&self, flags: DeviceFlags) {
        self.bits.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn test(&self, flags: DeviceFlags) -> bool {
        self.bits.load(Ordering::Acquire) & flags.bits() != 0
    }

    pub fn load(&self) -> DeviceFlags {
        DeviceFlags::from_bits_retain(self.bits.load(Ordering::Acquire))
    }
}

// Process-wide list of live device contexts. A handle is valid only while
// its context is still on this list.
static DEVICE_LIST: Mutex<Vec<Weak<DeviceContext>>> = Mutex::new(Vec::new());

/// True while `dev` is tracked in the process-wide device list.
///
/// Pointer comparison only: upgrading a `Weak` here could drop the last
/// reference of another context while the list lock is held.
pub fn is_device_valid(dev: &Arc<DeviceContext>) -> bool {
    DEVICE_LIST
        .lock()
        .unwrap()
        .iter()
        .any(|w| w.strong_count() > 0 && w.as_ptr() == Arc::as_ptr(dev))
}

/// Control-plane state for one adapter.
pub struct DeviceContext {
    caps: DeviceCaps,
    flags: Arc<AtomicDeviceFlags>,
    registry: Arc<ResourceRegistry>,
    pacing: Arc<PacingEngine>,
    recovery: Arc<RecoveryEngine>,
    dbg_stats: Arc<DbqStats>,
    sw_stats: Arc<DbrSwStats>,
    perf_stats: Arc<SpPerfStats>,
}

impl DeviceContext {
    /// Build the control plane for a device from its capability query.
    ///
    /// Registers the context in the process-wide device list and arms the
    /// pacing interrupt when the device supports pacing.
    pub fn new(
        caps: DeviceCaps,
        config: PacingConfig,
        regs: Arc<dyn DoorbellRegs>,
    ) -> Result<Arc<Self>> {
        config.validate(&caps)?;

        let flags = Arc::new(AtomicDeviceFlags::new());
        let registry = Arc::new(ResourceRegistry::new());
        let dbg_stats = Arc::new(DbqStats::new());
        let sw_stats = Arc::new(DbrSwStats::new());
        let perf_stats = Arc::new(SpPerfStats::new());

        let pacing = PacingEngine::new(caps, &config, regs, dbg_stats.clone(), sw_stats.clone())?;
        let recovery = RecoveryEngine::new(
            caps,
            &config,
            registry.clone(),
            flags.clone(),
            sw_stats.clone(),
            perf_stats.clone(),
        )?;

        let dev = Arc::new(Self {
            caps,
            flags,
            registry,
            pacing,
            recovery,
            dbg_stats,
            sw_stats,
            perf_stats,
        });
        dev.flags.set(DeviceFlags::IBDEV_REGISTERED);
        DEVICE_LIST.lock().unwrap().push(Arc::downgrade(&dev));
        dev.pacing.arm_interrupt();
        Ok(dev)
    }

    /// Device capabilities this context was built from.
    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// Shared pacing state for the doorbell-issuing fast path.
    pub fn pacing_data(&self) -> &Arc<PacingData> {
        self.pacing.data()
    }

    // =========================================================================
    // Async event dispatch
    // =========================================================================

    /// Dispatch one async completion event.
    ///
    /// Runs on the notification path: classification and a queue push only,
    /// never controller logic inline, never a blocking wait. Unknown
    /// subtypes are counted and discarded.
    pub fn on_async_event(&self, cmpl: &AsyncEventCmpl) {
        self.sw_stats.dbq_int_recv.fetch_add(1, Ordering::Relaxed);
        match cmpl.kind() {
            EventKind::PacingThreshold => self.pacing.queue_alert(),
            EventKind::DoorbellDrop { epoch } => self.recovery.queue_cycle(epoch),
            EventKind::NqPacingNotification { nq_id } => {
                self.pacing.queue_nq_notification(nq_id)
            }
            EventKind::Unknown => {
                debug!(event_id = cmpl.event_id, "unknown async event, discarding");
                self.sw_stats.dbq_event_unknown.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // =========================================================================
    // Resource registration (verbs layer)
    // =========================================================================

    /// Track a resource for drop-recovery notification.
    pub fn register_resource(&self, ty: ResType, handle: Arc<dyn RecoveryTarget>) {
        self.registry.register(ty, handle);
    }

    /// Stop tracking a resource. A no-op when the handle was never
    /// registered or already deregistered.
    pub fn deregister_resource(&self, ty: ResType, handle: &Arc<dyn RecoveryTarget>) {
        self.registry.deregister(ty, handle);
    }

    /// Number of tracked resources of one type.
    pub fn resource_count(&self, ty: ResType) -> usize {
        self.registry.len(ty)
    }

    /// Wake the recovery coordinator after a resource finished its resync.
    pub fn ack_recovery(&self) {
        self.recovery.notify();
    }

    // =========================================================================
    // Pacing entry points (doorbell slow path)
    // =========================================================================

    /// Sample the FIFO and start pacing when occupancy crossed the
    /// threshold.
    pub fn check_fifo_occupancy(&self) {
        self.pacing.check_fifo_occupancy();
    }

    /// Force pacing to its maximum immediately.
    pub fn pacing_alert(&self) {
        self.pacing.pacing_alert();
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Mark the device detached or re-attached.
    ///
    /// Detached is a standing condition, not an error: controllers keep
    /// their bookkeeping running but skip every hardware register write, and
    /// an outstanding recovery wait terminates early.
    pub fn set_detached(&self, detached: bool) {
        if detached {
            self.flags.set(DeviceFlags::ERR_DEVICE_DETACHED);
        } else {
            self.flags.clear(DeviceFlags::ERR_DEVICE_DETACHED);
        }
        self.pacing.set_dev_err_state(detached);
        self.recovery.notify();
    }

    /// True while the device is marked detached.
    pub fn is_detached(&self) -> bool {
        self.flags.test(DeviceFlags::ERR_DEVICE_DETACHED)
    }

    /// Current lifecycle flag bits.
    pub fn flags(&self) -> DeviceFlags {
        self.flags.load()
    }

    /// Remove the context from the process-wide device list.
    ///
    /// Query accessors fail with [`Error::InvalidDevice`] from this point
    /// on; background work already queued drains on its own.
    pub fn remove(self: &Arc<Self>) {
        self.flags.set(DeviceFlags::STOP_IN_PROGRESS);
        DEVICE_LIST
            .lock()
            .unwrap()
            .retain(|w| w.strong_count() > 0 && w.as_ptr() != Arc::as_ptr(self));
    }

    fn check_valid(self: &Arc<Self>) -> Result<()> {
        if is_device_valid(self) {
            Ok(())
        } else {
            Err(Error::InvalidDevice)
        }
    }

    // =========================================================================
    // Read-only reporting surface
    // =========================================================================

    /// Snapshot of the shared pacing state.
    pub fn pacing_snapshot(self: &Arc<Self>) -> Result<PacingSnapshot> {
        self.check_valid()?;
        Ok(self.pacing.data().snapshot())
    }

    /// Snapshot of the pacing/recovery software counters.
    pub fn sw_stats_snapshot(self: &Arc<Self>) -> Result<DbrSwStatsSnapshot> {
        self.check_valid()?;
        Ok(self.sw_stats.snapshot())
    }

    /// Snapshot of the slab-bucketed debug statistics.
    pub fn dbg_stats_snapshot(self: &Arc<Self>) -> Result<DbqStatsSnapshot> {
        self.check_valid()?;
        Ok(self.dbg_stats.snapshot())
    }

    /// Snapshot of the recovery latency histogram.
    pub fn perf_stats_snapshot(self: &Arc<Self>) -> Result<[u64; RECOV_LAT_SLABS]> {
        self.check_valid()?;
        Ok(self.perf_stats.snapshot())
    }

    /// Current drop-recovery epoch.
    pub fn current_epoch(self: &Arc<Self>) -> Result<u32> {
        self.check_valid()?;
        Ok(self.recovery.current_epoch())
    }

    /// True while a drop-recovery cycle is in flight.
    pub fn recovery_in_progress(self: &Arc<Self>) -> Result<bool> {
        self.check_valid()?;
        Ok(self.recovery.recovery_in_progress())
    }

    // =========================================================================
    // Administrative clears
    // =========================================================================

    /// Clear the driver statistics group. Also resets the stored recovery
    /// epoch; the next drop event with any hardware epoch re-arms recovery.
    pub fn clear_driver_stats(&self) {
        self.sw_stats.clear();
        self.recovery.reset_epoch();
    }

    /// Clear the slab-bucketed debug statistics group.
    pub fn clear_dbg_stats(&self) {
        self.dbg_stats.clear();
    }

    /// Clear the performance-latency statistics group.
    pub fn clear_perf_stats(&self) {
        self.perf_stats.clear();
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        DEVICE_LIST
            .lock()
            .unwrap()
            .retain(|w| w.strong_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChipGen;
    use crate::test_utils::MockRegs;

    fn new_device() -> Arc<DeviceContext> {
        let regs = Arc::new(MockRegs::new(ChipGen::P5));
        DeviceContext::new(
            DeviceCaps::new(ChipGen::P5),
            PacingConfig::default(),
            regs,
        )
        .unwrap()
    }

    #[test]
    fn test_new_device_is_valid_until_removed() {
        let dev = new_device();
        assert!(is_device_valid(&dev));
        assert!(dev.flags().contains(DeviceFlags::IBDEV_REGISTERED));
        assert!(dev.pacing_snapshot().is_ok());

        dev.remove();
        assert!(!is_device_valid(&dev));
        assert!(dev.flags().contains(DeviceFlags::STOP_IN_PROGRESS));
        assert!(matches!(
            dev.pacing_snapshot(),
            Err(Error::InvalidDevice)
        ));
        assert!(matches!(dev.current_epoch(), Err(Error::InvalidDevice)));
    }

    #[test]
    fn test_initial_pacing_state_is_default() {
        let dev = new_device();
        let snap = dev.pacing_snapshot().unwrap();
        assert_eq!(snap.do_pacing, crate::config::DBR_DO_PACING_NO_CONGESTION);
        assert_eq!(snap.pacing_th, 250);
        assert_eq!(snap.alarm_th, 500);
        assert_eq!(snap.dbq_watermark, 0);
        assert!(!snap.dev_err_state);
        dev.remove();
    }

    #[test]
    fn test_unknown_event_counted_and_discarded() {
        let dev = new_device();
        dev.on_async_event(&AsyncEventCmpl {
            event_id: 0x99,
            event_data1: 0,
            event_data2: 0,
        });
        let sw = dev.sw_stats_snapshot().unwrap();
        assert_eq!(sw.dbq_int_recv, 1);
        assert_eq!(sw.dbq_event_unknown, 1);
        dev.remove();
    }

    #[test]
    fn test_detached_flag_mirrors_into_pacing_state() {
        let dev = new_device();
        dev.set_detached(true);
        assert!(dev.is_detached());
        assert!(dev.pacing_snapshot().unwrap().dev_err_state);
        dev.set_detached(false);
        assert!(!dev.pacing_snapshot().unwrap().dev_err_state);
        dev.remove();
    }

    #[test]
    fn test_clear_driver_stats_resets_epoch() {
        let dev = new_device();
        dev.on_async_event(&AsyncEventCmpl::doorbell_drop(4));
        crate::test_utils::wait_until(|| dev.current_epoch().unwrap() == 4);
        dev.clear_driver_stats();
        assert_eq!(dev.current_epoch().unwrap(), 0);
        assert_eq!(dev.sw_stats_snapshot().unwrap().dbr_drop_recov_events, 0);
        dev.remove();
    }
}
