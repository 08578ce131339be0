//! Pacing and recovery statistics.
//!
//! All counters are monotonically increasing and incremented lock-free with
//! relaxed atomics; the only writes that go backwards are the administrative
//! clears, which the caller serializes. Water marks use `fetch_max`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Number of FIFO-occupancy severity slabs. Slab 0 is at-or-below the
/// pacing threshold; the breakpoints above it sit at 1x, 2x, 4x and 8x the
/// threshold.
pub const FIFO_OCCUP_SLABS: usize = 5;

/// Number of do-pacing severity slabs. The breakpoints sit at 1x, 2x, 4x,
/// 8x and 16x the uncongested default.
pub const DO_PACING_SLABS: usize = 5;

/// Number of per-millisecond recovery latency slabs; the last slab collects
/// everything at or beyond its boundary.
pub const RECOV_LAT_SLABS: usize = 32;

/// Slab index for a FIFO occupancy sample.
#[inline]
pub fn fifo_occup_slab(occupancy: u32, algo_th: u32) -> usize {
    let th = algo_th as u64;
    let occ = occupancy as u64;
    if occ <= th {
        0
    } else if occ <= 2 * th {
        1
    } else if occ <= 4 * th {
        2
    } else if occ <= 8 * th {
        3
    } else {
        4
    }
}

/// Slab index for a do-pacing value, or `None` when it sits at or below the
/// uncongested default.
#[inline]
pub fn do_pacing_slab(do_pacing: u32, def_do_pacing: u32) -> Option<usize> {
    let def = def_do_pacing as u64;
    let dp = do_pacing as u64;
    if dp <= def {
        None
    } else if dp <= 2 * def {
        Some(0)
    } else if dp <= 4 * def {
        Some(1)
    } else if dp <= 8 * def {
        Some(2)
    } else if dp <= 16 * def {
        Some(3)
    } else {
        Some(4)
    }
}

/// Doorbell-queue debug statistics: slab-bucketed occupancy and do-pacing
/// samples with high-water marks.
#[derive(Debug, Default)]
pub struct DbqStats {
    pub fifo_occup_slab: [AtomicU64; FIFO_OCCUP_SLABS],
    pub fifo_occup_water_mark: AtomicU64,
    pub do_pacing_slab: [AtomicU64; DO_PACING_SLABS],
    pub do_pacing_water_mark: AtomicU64,
}

impl DbqStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one FIFO occupancy sample.
    pub fn record_fifo_occup(&self, occupancy: u32, algo_th: u32) {
        self.fifo_occup_slab[fifo_occup_slab(occupancy, algo_th)]
            .fetch_add(1, Ordering::Relaxed);
        self.fifo_occup_water_mark
            .fetch_max(occupancy as u64, Ordering::Relaxed);
    }

    /// Account one recomputed do-pacing value.
    pub fn record_do_pacing(&self, do_pacing: u32, def_do_pacing: u32) {
        if let Some(slab) = do_pacing_slab(do_pacing, def_do_pacing) {
            self.do_pacing_slab[slab].fetch_add(1, Ordering::Relaxed);
        }
        self.do_pacing_water_mark
            .fetch_max(do_pacing as u64, Ordering::Relaxed);
    }

    /// Administrative clear of the debug statistics group.
    pub fn clear(&self) {
        for slab in &self.fifo_occup_slab {
            slab.store(0, Ordering::Relaxed);
        }
        self.fifo_occup_water_mark.store(0, Ordering::Relaxed);
        for slab in &self.do_pacing_slab {
            slab.store(0, Ordering::Relaxed);
        }
        self.do_pacing_water_mark.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DbqStatsSnapshot {
        DbqStatsSnapshot {
            fifo_occup_slab: std::array::from_fn(|i| {
                self.fifo_occup_slab[i].load(Ordering::Relaxed)
            }),
            fifo_occup_water_mark: self.fifo_occup_water_mark.load(Ordering::Relaxed),
            do_pacing_slab: std::array::from_fn(|i| {
                self.do_pacing_slab[i].load(Ordering::Relaxed)
            }),
            do_pacing_water_mark: self.do_pacing_water_mark.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DbqStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbqStatsSnapshot {
    pub fifo_occup_slab: [u64; FIFO_OCCUP_SLABS],
    pub fifo_occup_water_mark: u64,
    pub do_pacing_slab: [u64; DO_PACING_SLABS],
    pub do_pacing_water_mark: u64,
}

/// Doorbell pacing and drop-recovery software counters.
#[derive(Debug, Default)]
pub struct DbrSwStats {
    /// Pacing interrupts received (async events dispatched).
    pub dbq_int_recv: AtomicU64,
    /// Pacing interrupt (re-)arms.
    pub dbq_int_en: AtomicU64,
    /// Pacing ticks that re-scheduled themselves.
    pub dbq_pacing_resched: AtomicU64,
    /// Pacing episodes that completed and returned to idle.
    pub dbq_pacing_complete: AtomicU64,
    /// Pacing alerts (explicit pacing events acted on).
    pub dbq_pacing_alerts: AtomicU64,
    /// Async events with an unrecognized subtype, counted and discarded.
    pub dbq_event_unknown: AtomicU64,
    /// Drop-recovery cycles started.
    pub dbr_drop_recov_events: AtomicU64,
    /// Drop-recovery cycles that hit the acknowledgment timeout.
    pub dbr_drop_recov_timeouts: AtomicU64,
    /// Applications that had not acknowledged when their cycle timed out.
    pub dbr_drop_recov_timeout_users: AtomicU64,
    /// Drop events skipped because the reported epoch was stale.
    pub dbr_drop_recov_event_skips: AtomicU64,
}

impl DbrSwStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Administrative clear of the driver statistics group.
    pub fn clear(&self) {
        self.dbq_int_recv.store(0, Ordering::Relaxed);
        self.dbq_int_en.store(0, Ordering::Relaxed);
        self.dbq_pacing_resched.store(0, Ordering::Relaxed);
        self.dbq_pacing_complete.store(0, Ordering::Relaxed);
        self.dbq_pacing_alerts.store(0, Ordering::Relaxed);
        self.dbq_event_unknown.store(0, Ordering::Relaxed);
        self.dbr_drop_recov_events.store(0, Ordering::Relaxed);
        self.dbr_drop_recov_timeouts.store(0, Ordering::Relaxed);
        self.dbr_drop_recov_timeout_users.store(0, Ordering::Relaxed);
        self.dbr_drop_recov_event_skips.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DbrSwStatsSnapshot {
        DbrSwStatsSnapshot {
            dbq_int_recv: self.dbq_int_recv.load(Ordering::Relaxed),
            dbq_int_en: self.dbq_int_en.load(Ordering::Relaxed),
            dbq_pacing_resched: self.dbq_pacing_resched.load(Ordering::Relaxed),
            dbq_pacing_complete: self.dbq_pacing_complete.load(Ordering::Relaxed),
            dbq_pacing_alerts: self.dbq_pacing_alerts.load(Ordering::Relaxed),
            dbq_event_unknown: self.dbq_event_unknown.load(Ordering::Relaxed),
            dbr_drop_recov_events: self.dbr_drop_recov_events.load(Ordering::Relaxed),
            dbr_drop_recov_timeouts: self.dbr_drop_recov_timeouts.load(Ordering::Relaxed),
            dbr_drop_recov_timeout_users: self
                .dbr_drop_recov_timeout_users
                .load(Ordering::Relaxed),
            dbr_drop_recov_event_skips: self
                .dbr_drop_recov_event_skips
                .load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DbrSwStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbrSwStatsSnapshot {
    pub dbq_int_recv: u64,
    pub dbq_int_en: u64,
    pub dbq_pacing_resched: u64,
    pub dbq_pacing_complete: u64,
    pub dbq_pacing_alerts: u64,
    pub dbq_event_unknown: u64,
    pub dbr_drop_recov_events: u64,
    pub dbr_drop_recov_timeouts: u64,
    pub dbr_drop_recov_timeout_users: u64,
    pub dbr_drop_recov_event_skips: u64,
}

/// Performance-latency statistics: how long completed drop-recovery cycles
/// took, bucketed per millisecond.
#[derive(Debug, Default)]
pub struct SpPerfStats {
    pub recov_lat_slab_ms: [AtomicU64; RECOV_LAT_SLABS],
}

impl SpPerfStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one completed recovery cycle.
    pub fn record_recov_latency(&self, elapsed: Duration) {
        let slab = (elapsed.as_millis() as usize).min(RECOV_LAT_SLABS - 1);
        self.recov_lat_slab_ms[slab].fetch_add(1, Ordering::Relaxed);
    }

    /// Administrative clear of the performance-latency group.
    pub fn clear(&self) {
        for slab in &self.recov_lat_slab_ms {
            slab.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> [u64; RECOV_LAT_SLABS] {
        std::array::from_fn(|i| self.recov_lat_slab_ms[i].load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_occup_slab_breakpoints() {
        let th = 250;
        assert_eq!(fifo_occup_slab(0, th), 0);
        assert_eq!(fifo_occup_slab(250, th), 0);
        assert_eq!(fifo_occup_slab(251, th), 1);
        assert_eq!(fifo_occup_slab(500, th), 1);
        assert_eq!(fifo_occup_slab(501, th), 2);
        assert_eq!(fifo_occup_slab(1000, th), 2);
        assert_eq!(fifo_occup_slab(2000, th), 3);
        assert_eq!(fifo_occup_slab(2001, th), 4);
        assert_eq!(fifo_occup_slab(11264, th), 4);
    }

    #[test]
    fn test_do_pacing_slab_breakpoints() {
        let def = 0x7F;
        assert_eq!(do_pacing_slab(0, def), None);
        assert_eq!(do_pacing_slab(0x7F, def), None);
        assert_eq!(do_pacing_slab(0x80, def), Some(0));
        assert_eq!(do_pacing_slab(0x100, def), Some(1));
        assert_eq!(do_pacing_slab(0x400, def), Some(3));
        assert_eq!(do_pacing_slab(0xFFFF, def), Some(4));
    }

    #[test]
    fn test_water_marks_only_rise() {
        let stats = DbqStats::new();
        stats.record_fifo_occup(300, 250);
        stats.record_fifo_occup(100, 250);
        let snap = stats.snapshot();
        assert_eq!(snap.fifo_occup_water_mark, 300);
        assert_eq!(snap.fifo_occup_slab[1], 1);
        assert_eq!(snap.fifo_occup_slab[0], 1);
    }

    #[test]
    fn test_clear_resets_all_counters() {
        let stats = DbqStats::new();
        stats.record_fifo_occup(3000, 250);
        stats.record_do_pacing(0xFFFF, 0x7F);
        stats.clear();
        assert_eq!(stats.snapshot(), DbqStatsSnapshot::default());
    }

    #[test]
    fn test_recov_latency_slabs() {
        let perf = SpPerfStats::new();
        perf.record_recov_latency(Duration::from_micros(800));
        perf.record_recov_latency(Duration::from_millis(5));
        perf.record_recov_latency(Duration::from_millis(500));
        let snap = perf.snapshot();
        assert_eq!(snap[0], 1);
        assert_eq!(snap[5], 1);
        assert_eq!(snap[RECOV_LAT_SLABS - 1], 1);
    }
}
