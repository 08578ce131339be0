//! Doorbell-drop recovery coordinator.
//!
//! When the FIFO crosses the hardware drop threshold the device discards
//! doorbells and reports a new epoch. Every tracked resource must then
//! resynchronize its doorbell state before it can trust the hardware again.
//! The coordinator advances the device epoch, walks the resource registry in
//! a fixed type order, and waits a bounded time for every resource to
//! acknowledge. Recovery is best-effort: a stuck application is counted, not
//! waited on forever.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::{DeviceCaps, PacingConfig};
use crate::device::{AtomicDeviceFlags, DeviceFlags};
use crate::registry::{RecoveryTarget, ResType, ResourceRegistry};
use crate::stats::{DbrSwStats, SpPerfStats};
use crate::workqueue::WorkQueue;

/// Epoch state guarded by the coordinator lock.
struct RecovState {
    /// Highest epoch the device has recovered (or is recovering) to.
    curr_epoch: u32,
    /// True while a recovery cycle is in flight.
    recovery_on: bool,
}

/// The drop-recovery coordinator for one device.
pub struct RecoveryEngine {
    caps: DeviceCaps,
    user_timeout: Duration,
    poll_cadence: Duration,
    registry: Arc<ResourceRegistry>,
    state: Mutex<RecovState>,
    /// Woken by `ack` and by device detach so a waiting cycle re-checks
    /// early instead of sleeping out its poll cadence.
    ack_cv: Condvar,
    flags: Arc<AtomicDeviceFlags>,
    sw: Arc<DbrSwStats>,
    perf: Arc<SpPerfStats>,
    wq: WorkQueue,
    weak_self: Weak<RecoveryEngine>,
}

impl RecoveryEngine {
    pub(crate) fn new(
        caps: DeviceCaps,
        config: &PacingConfig,
        registry: Arc<ResourceRegistry>,
        flags: Arc<AtomicDeviceFlags>,
        sw: Arc<DbrSwStats>,
        perf: Arc<SpPerfStats>,
    ) -> std::io::Result<Arc<Self>> {
        let wq = WorkQueue::new("dbr-drop-recov")?;
        Ok(Arc::new_cyclic(|weak| Self {
            caps,
            user_timeout: Duration::from_millis(config.user_recov_timeout_ms),
            poll_cadence: Duration::from_millis(config.recov_poll_ms),
            registry,
            state: Mutex::new(RecovState {
                curr_epoch: 0,
                recovery_on: false,
            }),
            ack_cv: Condvar::new(),
            flags,
            sw,
            perf,
            wq,
            weak_self: weak.clone(),
        }))
    }

    /// Highest epoch seen so far.
    pub fn current_epoch(&self) -> u32 {
        self.state.lock().unwrap().curr_epoch
    }

    /// True while a recovery cycle is in flight.
    pub fn recovery_in_progress(&self) -> bool {
        self.state.lock().unwrap().recovery_on
    }

    /// Reset the stored epoch. Part of the driver-stats administrative
    /// clear; the next drop event with any hardware epoch re-arms recovery.
    pub(crate) fn reset_epoch(&self) {
        self.state.lock().unwrap().curr_epoch = 0;
    }

    /// Wake a waiting cycle; called when an application acknowledges and on
    /// device detach.
    pub(crate) fn notify(&self) {
        self.ack_cv.notify_all();
    }

    /// Queue a recovery cycle for `reported_epoch` on the coordinator's own
    /// background task. Non-blocking; safe from the notification path.
    pub(crate) fn queue_cycle(&self, reported_epoch: u32) {
        if !self.caps.dbr_drop_recov {
            return;
        }
        let weak = self.weak_self.clone();
        self.wq.queue(move || {
            if let Some(engine) = weak.upgrade() {
                engine.run_cycle(reported_epoch);
            }
        });
    }

    /// One recovery cycle: advance the epoch, notify every tracked resource,
    /// wait (bounded) for acknowledgments.
    ///
    /// Stale epochs (≤ current) are counted as skipped and change nothing;
    /// duplicate delivery of an epoch is therefore harmless. Epoch
    /// advancement and the registry walk happen under the coordinator lock,
    /// so concurrent advancement cannot interleave with them.
    pub(crate) fn run_cycle(&self, reported_epoch: u32) {
        let mut state = self.state.lock().unwrap();
        if reported_epoch <= state.curr_epoch {
            debug!(
                reported_epoch,
                curr_epoch = state.curr_epoch,
                "stale drop-recovery epoch, skipping"
            );
            self.sw
                .dbr_drop_recov_event_skips
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        state.curr_epoch = reported_epoch;
        state.recovery_on = true;
        self.sw
            .dbr_drop_recov_events
            .fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        // Fixed notification order; the per-type list lock makes each step
        // of the walk see only fully constructed entries.
        let mut pending: Vec<Arc<dyn RecoveryTarget>> = Vec::new();
        for ty in ResType::ALL {
            self.registry.for_each(ty, |target| {
                target.begin_resync(reported_epoch);
                pending.push(target.clone());
            });
        }

        let deadline = started + self.user_timeout;
        let timed_out = loop {
            pending.retain(|t| t.synced_epoch() < reported_epoch);
            if pending.is_empty() {
                break false;
            }
            if self.flags.test(DeviceFlags::ERR_DEVICE_DETACHED) {
                debug!("device detached, abandoning recovery wait");
                break true;
            }
            let now = Instant::now();
            if now >= deadline {
                break true;
            }
            let wait = (deadline - now).min(self.poll_cadence);
            state = self.ack_cv.wait_timeout(state, wait).unwrap().0;
        };

        if timed_out {
            warn!(
                epoch = reported_epoch,
                stuck_users = pending.len(),
                "doorbell-drop recovery timed out"
            );
            self.sw
                .dbr_drop_recov_timeouts
                .fetch_add(1, Ordering::Relaxed);
            self.sw
                .dbr_drop_recov_timeout_users
                .fetch_add(pending.len() as u64, Ordering::Relaxed);
        } else {
            self.perf.record_recov_latency(started.elapsed());
        }
        state.recovery_on = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChipGen;
    use std::sync::atomic::AtomicU32;

    struct App {
        synced: AtomicU32,
        auto_ack: bool,
    }

    impl App {
        fn new(auto_ack: bool) -> Arc<Self> {
            Arc::new(Self {
                synced: AtomicU32::new(0),
                auto_ack,
            })
        }
    }

    impl RecoveryTarget for App {
        fn begin_resync(&self, epoch: u32) {
            if self.auto_ack {
                self.synced.store(epoch, Ordering::Release);
            }
        }

        fn synced_epoch(&self) -> u32 {
            self.synced.load(Ordering::Acquire)
        }
    }

    fn engine_with(registry: Arc<ResourceRegistry>) -> Arc<RecoveryEngine> {
        let config = PacingConfig::default()
            .with_user_recov_timeout_ms(10)
            .with_recov_poll_ms(2);
        RecoveryEngine::new(
            DeviceCaps::new(ChipGen::P5),
            &config,
            registry,
            Arc::new(AtomicDeviceFlags::new()),
            Arc::new(DbrSwStats::new()),
            Arc::new(SpPerfStats::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_epoch_advances_to_max_applied_once() {
        let engine = engine_with(Arc::new(ResourceRegistry::new()));
        for epoch in [3, 1, 3, 5, 2] {
            engine.run_cycle(epoch);
        }
        assert_eq!(engine.current_epoch(), 5);
        assert_eq!(engine.sw.dbr_drop_recov_events.load(Ordering::Relaxed), 2);
        assert_eq!(
            engine.sw.dbr_drop_recov_event_skips.load(Ordering::Relaxed),
            3
        );
    }

    #[test]
    fn test_stale_epoch_does_not_rewalk() {
        let registry = Arc::new(ResourceRegistry::new());
        let app = App::new(true);
        registry.register(ResType::Qp, app.clone());
        let engine = engine_with(registry);

        engine.run_cycle(5);
        assert_eq!(app.synced_epoch(), 5);

        app.synced.store(0, Ordering::Release);
        engine.run_cycle(5);
        // The stale delivery must not re-notify the application.
        assert_eq!(app.synced_epoch(), 0);
        assert_eq!(
            engine.sw.dbr_drop_recov_event_skips.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_all_acked_completes_without_timeout() {
        let registry = Arc::new(ResourceRegistry::new());
        registry.register(ResType::Cq, App::new(true));
        registry.register(ResType::Srq, App::new(true));
        let engine = engine_with(registry);

        engine.run_cycle(1);
        assert!(!engine.recovery_in_progress());
        assert_eq!(engine.sw.dbr_drop_recov_timeouts.load(Ordering::Relaxed), 0);
        let lat: u64 = engine.perf.snapshot().iter().sum();
        assert_eq!(lat, 1);
    }

    #[test]
    fn test_stuck_user_counted_then_back_to_normal() {
        let registry = Arc::new(ResourceRegistry::new());
        registry.register(ResType::Uctx, App::new(true));
        registry.register(ResType::Qp, App::new(false));
        let engine = engine_with(registry);

        let started = Instant::now();
        engine.run_cycle(6);
        assert!(started.elapsed() >= Duration::from_millis(10));
        assert!(!engine.recovery_in_progress());
        assert_eq!(engine.current_epoch(), 6);
        assert_eq!(engine.sw.dbr_drop_recov_timeouts.load(Ordering::Relaxed), 1);
        assert_eq!(
            engine
                .sw
                .dbr_drop_recov_timeout_users
                .load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_detach_terminates_wait_early() {
        let registry = Arc::new(ResourceRegistry::new());
        registry.register(ResType::Qp, App::new(false));

        let config = PacingConfig::default()
            .with_user_recov_timeout_ms(5_000)
            .with_recov_poll_ms(2);
        let flags = Arc::new(AtomicDeviceFlags::new());
        let engine = RecoveryEngine::new(
            DeviceCaps::new(ChipGen::P5),
            &config,
            registry,
            flags.clone(),
            Arc::new(DbrSwStats::new()),
            Arc::new(SpPerfStats::new()),
        )
        .unwrap();

        let started = Instant::now();
        flags.set(DeviceFlags::ERR_DEVICE_DETACHED);
        engine.run_cycle(1);
        // Far below the 5 s timeout: the wait saw the detach and bailed.
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(engine.sw.dbr_drop_recov_timeouts.load(Ordering::Relaxed), 1);
    }
}
