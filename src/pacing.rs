//! Doorbell pacing controller.
//!
//! A closed feedback loop that keeps the on-chip doorbell FIFO from
//! overflowing. Occupancy is sampled from the FIFO register, classified into
//! severity slabs, and turned into a "do-pacing" probability value that the
//! doorbell-issuing fast path applies when deciding whether to delay a
//! doorbell write. The controller has two states:
//!
//! - **Idle**: no pacing pressure; do-pacing sits at its uncongested default.
//! - **Active**: a fixed-period tick re-samples occupancy and recomputes
//!   do-pacing until a tick finds the FIFO back below the threshold, at which
//!   point the defaults are restored and the tick stops.
//!
//! Escalation: the alarm threshold (a generation-dependent multiple of the
//! pacing threshold; zero on generations where auto-tuning stays off) jumps
//! do-pacing straight to its maximum. An explicit pacing event from the
//! device does the same.
//!
//! All mutation happens under the pacing lock; the fast path reads the
//! atomic mirror without taking it and tolerates a stale value.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{DeviceCaps, PacingConfig, MAX_DBR_DO_PACING};
use crate::regs::{DoorbellRegs, FifoLayout, DB_THROTTLING_MAX};
use crate::stats::{DbqStats, DbrSwStats};
use crate::workqueue::WorkQueue;

/// Device-wide pacing state shared with the doorbell-issuing fast path.
///
/// Mutated only by the pacing controller under its lock; readers take no
/// lock and tolerate best-effort staleness.
#[derive(Debug)]
pub struct PacingData {
    do_pacing: AtomicU32,
    pacing_th: AtomicU32,
    alarm_th: AtomicU32,
    dbq_watermark: AtomicU32,
    dev_err_state: AtomicBool,
}

impl PacingData {
    fn new() -> Self {
        Self {
            do_pacing: AtomicU32::new(0),
            pacing_th: AtomicU32::new(0),
            alarm_th: AtomicU32::new(0),
            dbq_watermark: AtomicU32::new(0),
            dev_err_state: AtomicBool::new(false),
        }
    }

    /// Current do-pacing probability value.
    #[inline]
    pub fn do_pacing(&self) -> u32 {
        self.do_pacing.load(Ordering::Relaxed)
    }

    /// Current pacing threshold in FIFO entries.
    #[inline]
    pub fn pacing_th(&self) -> u32 {
        self.pacing_th.load(Ordering::Relaxed)
    }

    /// Current alarm threshold in FIFO entries; zero when disabled.
    #[inline]
    pub fn alarm_th(&self) -> u32 {
        self.alarm_th.load(Ordering::Relaxed)
    }

    /// Watermark currently programmed into the throttling register.
    #[inline]
    pub fn dbq_watermark(&self) -> u32 {
        self.dbq_watermark.load(Ordering::Relaxed)
    }

    /// True while the device is detached; the fast path must not write
    /// doorbells through a dead BAR.
    #[inline]
    pub fn dev_err_state(&self) -> bool {
        self.dev_err_state.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PacingSnapshot {
        PacingSnapshot {
            do_pacing: self.do_pacing(),
            pacing_th: self.pacing_th(),
            alarm_th: self.alarm_th(),
            dbq_watermark: self.dbq_watermark(),
            dev_err_state: self.dev_err_state(),
        }
    }
}

/// Point-in-time copy of [`PacingData`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingSnapshot {
    pub do_pacing: u32,
    pub pacing_th: u32,
    pub alarm_th: u32,
    pub dbq_watermark: u32,
    pub dev_err_state: bool,
}

/// do-pacing as a function of FIFO occupancy.
///
/// At or below `pacing_th` the uncongested default applies. Above it the
/// value rises linearly with the overshoot, reaching `MAX_DBR_DO_PACING` at
/// a full FIFO. A non-zero `alarm_th` is an escalation tier: occupancy at or
/// beyond it saturates immediately. Monotonically non-decreasing in
/// `occupancy` by construction.
pub fn do_pacing_curve(
    occupancy: u32,
    pacing_th: u32,
    alarm_th: u32,
    def_do_pacing: u32,
    max_depth: u32,
) -> u32 {
    if occupancy <= pacing_th {
        return def_do_pacing;
    }
    if alarm_th > 0 && occupancy >= alarm_th {
        return MAX_DBR_DO_PACING;
    }
    let span = max_depth.saturating_sub(pacing_th).max(1) as u64;
    let overshoot = (occupancy - pacing_th).min(max_depth) as u64;
    let range = (MAX_DBR_DO_PACING - def_do_pacing) as u64;
    let raised = def_do_pacing as u64 + range * overshoot / span;
    raised.min(MAX_DBR_DO_PACING as u64) as u32
}

/// Controller state guarded by the pacing lock.
struct PacingCtl {
    /// True while the periodic re-evaluation tick is running.
    active: bool,
    /// Last successfully sampled occupancy; reused when a register read
    /// fails transiently.
    last_fifo_occup: u32,
    /// NQ the throttling register is currently programmed for.
    cur_nq: u16,
}

/// The doorbell pacing controller for one device.
pub struct PacingEngine {
    caps: DeviceCaps,
    layout: FifoLayout,
    /// Effective algorithm threshold for this device.
    algo_th: u32,
    def_do_pacing: u32,
    /// Watermark programmed while pacing is active.
    active_watermark: u32,
    pacing_en_int_th: u32,
    tick_period: Duration,
    regs: Arc<dyn DoorbellRegs>,
    data: Arc<PacingData>,
    ctl: Mutex<PacingCtl>,
    /// Single-instance guard: at most one tick may be pending.
    tick_pending: AtomicBool,
    /// Single-instance guard for the deferred alert handler.
    alert_pending: AtomicBool,
    wq: WorkQueue,
    dbg: Arc<DbqStats>,
    sw: Arc<DbrSwStats>,
    weak_self: Weak<PacingEngine>,
}

impl PacingEngine {
    pub(crate) fn new(
        caps: DeviceCaps,
        config: &PacingConfig,
        regs: Arc<dyn DoorbellRegs>,
        dbg: Arc<DbqStats>,
        sw: Arc<DbrSwStats>,
    ) -> std::io::Result<Arc<Self>> {
        let layout = FifoLayout::for_gen(caps.chip_gen);
        let algo_th = config.effective_algo_th(&caps);
        let active_watermark =
            (layout.max_depth * config.dbq_watermark_pct / 100).min(DB_THROTTLING_MAX);
        let wq = WorkQueue::new("dbq-pacing")?;

        let engine = Arc::new_cyclic(|weak| Self {
            caps,
            layout,
            algo_th,
            def_do_pacing: config.def_do_pacing,
            active_watermark,
            pacing_en_int_th: config.pacing_en_int_th,
            tick_period: Duration::from_millis(config.dbq_pacing_time_ms),
            regs,
            data: Arc::new(PacingData::new()),
            ctl: Mutex::new(PacingCtl {
                active: false,
                last_fifo_occup: 0,
                cur_nq: 0,
            }),
            tick_pending: AtomicBool::new(false),
            alert_pending: AtomicBool::new(false),
            wq,
            dbg,
            sw,
            weak_self: weak.clone(),
        });

        {
            let mut ctl = engine.ctl.lock().unwrap();
            engine.set_default_pacing(&mut ctl);
        }
        Ok(engine)
    }

    /// Shared pacing state read by the doorbell fast path.
    pub fn data(&self) -> &Arc<PacingData> {
        &self.data
    }

    /// Effective pacing algorithm threshold for this device.
    pub fn algo_th(&self) -> u32 {
        self.algo_th
    }

    fn detached(&self) -> bool {
        self.data.dev_err_state()
    }

    /// Mirror the device detach state into the shared pacing page.
    pub(crate) fn set_dev_err_state(&self, detached: bool) {
        self.data.dev_err_state.store(detached, Ordering::Relaxed);
    }

    /// Arm the pacing interrupt at the configured enable threshold.
    pub(crate) fn arm_interrupt(&self) {
        if !self.caps.dbr_pacing {
            return;
        }
        let ctl = self.ctl.lock().unwrap();
        if self.detached() {
            debug!("device detached, skipping pacing interrupt arm");
            return;
        }
        self.regs
            .arm_pacing_interrupt(ctl.cur_nq, self.pacing_en_int_th);
        self.sw.dbq_int_en.fetch_add(1, Ordering::Relaxed);
    }

    /// Switch the pacing interrupt to another notification queue and re-arm.
    fn set_current_nq(&self, nq_id: u16) {
        let mut ctl = self.ctl.lock().unwrap();
        ctl.cur_nq = nq_id;
        if self.detached() {
            debug!(nq_id, "device detached, skipping NQ re-arm");
            return;
        }
        self.regs.arm_pacing_interrupt(nq_id, self.pacing_en_int_th);
        self.sw.dbq_int_en.fetch_add(1, Ordering::Relaxed);
        if ctl.active {
            self.regs.write_throttling(nq_id, self.data.dbq_watermark());
        }
    }

    /// Read and account one FIFO occupancy sample.
    ///
    /// A failed register read is transient: it is logged and the previous
    /// sample is reused.
    fn sample(&self, ctl: &mut PacingCtl) -> u32 {
        let occup = match self.regs.read_db_fifo() {
            Ok(raw) => self.layout.occupancy(raw),
            Err(e) => {
                warn!(error = %e, "DB FIFO read failed, reusing cached occupancy");
                ctl.last_fifo_occup
            }
        };
        ctl.last_fifo_occup = occup;
        self.dbg.record_fifo_occup(occup, self.algo_th);
        occup
    }

    /// Restore the uncongested defaults in the shared state and hardware.
    fn set_default_pacing(&self, ctl: &mut PacingCtl) {
        self.data
            .do_pacing
            .store(self.def_do_pacing, Ordering::Relaxed);
        self.data.pacing_th.store(self.algo_th, Ordering::Relaxed);
        self.data.alarm_th.store(
            self.algo_th * self.caps.chip_gen.alarm_th_multiple(),
            Ordering::Relaxed,
        );
        self.data.dbq_watermark.store(0, Ordering::Relaxed);
        if !self.detached() {
            self.regs.write_throttling(ctl.cur_nq, 0);
        }
    }

    /// Push a new do-pacing value and enter (or stay in) the active state.
    fn apply_pacing(self: &Arc<Self>, ctl: &mut PacingCtl, do_pacing: u32) {
        self.data.do_pacing.store(do_pacing, Ordering::Relaxed);
        self.dbg.record_do_pacing(do_pacing, self.def_do_pacing);
        self.data
            .dbq_watermark
            .store(self.active_watermark, Ordering::Relaxed);
        if self.detached() {
            debug!("device detached, skipping throttling register write");
        } else {
            self.regs
                .write_throttling(ctl.cur_nq, self.active_watermark);
        }
        ctl.active = true;
    }

    /// Sample occupancy and activate pacing when it crosses the threshold.
    ///
    /// Collaborators call this from the doorbell slow path; it is also the
    /// idle-state half of the feedback loop.
    pub fn check_fifo_occupancy(self: &Arc<Self>) {
        if !self.caps.dbr_pacing {
            return;
        }
        let mut ctl = self.ctl.lock().unwrap();
        let occup = self.sample(&mut ctl);
        if occup <= self.data.pacing_th() {
            return;
        }
        let dp = do_pacing_curve(
            occup,
            self.data.pacing_th(),
            self.data.alarm_th(),
            self.def_do_pacing,
            self.layout.max_depth,
        );
        self.apply_pacing(&mut ctl, dp);
        drop(ctl);
        self.schedule_tick();
    }

    /// Explicit pacing request from the device: saturate immediately.
    pub fn pacing_alert(self: &Arc<Self>) {
        if !self.caps.dbr_pacing {
            return;
        }
        let mut ctl = self.ctl.lock().unwrap();
        self.sw.dbq_pacing_alerts.fetch_add(1, Ordering::Relaxed);
        self.data.alarm_th.store(
            self.algo_th * self.caps.chip_gen.alarm_th_multiple(),
            Ordering::Relaxed,
        );
        self.apply_pacing(&mut ctl, MAX_DBR_DO_PACING);
        drop(ctl);
        self.schedule_tick();
    }

    /// Queue the alert handler on the pacing task. Idempotent: a request
    /// while one is already pending is a no-op, bounding the notification
    /// path to one outstanding alert.
    pub(crate) fn queue_alert(&self) {
        if self
            .alert_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let weak = self.weak_self.clone();
        self.wq.queue(move || {
            if let Some(engine) = weak.upgrade() {
                engine.alert_pending.store(false, Ordering::Release);
                engine.pacing_alert();
            }
        });
    }

    /// Queue an NQ switch followed by the alert handler. The notification
    /// carries a payload, so it is queued as its own task.
    pub(crate) fn queue_nq_notification(&self, nq_id: u16) {
        let weak = self.weak_self.clone();
        self.wq.queue(move || {
            if let Some(engine) = weak.upgrade() {
                engine.set_current_nq(nq_id);
                engine.pacing_alert();
            }
        });
    }

    /// Schedule the next re-evaluation tick. Idempotent: a request while one
    /// is already pending is a no-op.
    fn schedule_tick(self: &Arc<Self>) {
        if self
            .tick_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let weak = self.weak_self.clone();
        self.wq.queue_delayed(self.tick_period, move || {
            if let Some(engine) = weak.upgrade() {
                engine.tick_pending.store(false, Ordering::Release);
                engine.tick();
            }
        });
    }

    /// One period of the active-state feedback loop.
    fn tick(self: &Arc<Self>) {
        let mut ctl = self.ctl.lock().unwrap();
        if !ctl.active {
            return;
        }
        let occup = self.sample(&mut ctl);

        if self.detached() {
            // Degraded mode: keep the loop and the books running, leave the
            // shared state and hardware untouched.
            self.sw.dbq_pacing_resched.fetch_add(1, Ordering::Relaxed);
            drop(ctl);
            self.schedule_tick();
            return;
        }

        if occup > self.data.pacing_th() {
            let dp = do_pacing_curve(
                occup,
                self.data.pacing_th(),
                self.data.alarm_th(),
                self.def_do_pacing,
                self.layout.max_depth,
            );
            self.apply_pacing(&mut ctl, dp);
            self.sw.dbq_pacing_resched.fetch_add(1, Ordering::Relaxed);
            drop(ctl);
            self.schedule_tick();
        } else {
            self.set_default_pacing(&mut ctl);
            ctl.active = false;
            self.sw.dbq_pacing_complete.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// True while the controller is in its active state.
    pub fn is_active(&self) -> bool {
        self.ctl.lock().unwrap().active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEF: u32 = 0x7F;
    const DEPTH: u32 = 0x2c00;

    #[test]
    fn test_curve_default_below_threshold() {
        assert_eq!(do_pacing_curve(0, 250, 500, DEF, DEPTH), DEF);
        assert_eq!(do_pacing_curve(250, 250, 500, DEF, DEPTH), DEF);
    }

    #[test]
    fn test_curve_monotonic() {
        let mut prev = 0;
        for occup in 251..DEPTH {
            let dp = do_pacing_curve(occup, 250, 500, DEF, DEPTH);
            assert!(dp >= prev, "curve regressed at occupancy {}", occup);
            prev = dp;
        }
    }

    #[test]
    fn test_curve_saturates_at_full_fifo() {
        assert_eq!(
            do_pacing_curve(DEPTH, 250, 0, DEF, DEPTH),
            MAX_DBR_DO_PACING
        );
    }

    #[test]
    fn test_alarm_tier_escalates() {
        assert_eq!(
            do_pacing_curve(500, 250, 500, DEF, DEPTH),
            MAX_DBR_DO_PACING
        );
        // With the alarm tier disabled the same sample stays on the curve.
        assert!(do_pacing_curve(500, 250, 0, DEF, DEPTH) < MAX_DBR_DO_PACING);
    }

    #[test]
    fn test_curve_above_default_just_over_threshold() {
        let dp = do_pacing_curve(300, 250, 500, DEF, DEPTH);
        assert!(dp > DEF);
        assert!(dp < MAX_DBR_DO_PACING);
    }
}
