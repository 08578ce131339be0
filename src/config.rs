//! Configuration for doorbell pacing and drop recovery.
//!
//! `DeviceCaps` carries what the device-capability query reports; everything
//! the pacing and recovery engines tune at runtime lives in `PacingConfig`.

use crate::error::{Error, Result};

/// Maximum do-pacing value used when congestion is at its worst.
pub const MAX_DBR_DO_PACING: u32 = 0xFFFF;

/// Default do-pacing value when there is no congestion (1 in 512 probability).
pub const DBR_DO_PACING_NO_CONGESTION: u32 = 0x7F;

/// Default pacing algorithm threshold, in DB FIFO entries.
pub const PACING_ALGO_THRESHOLD: u32 = 250;

/// Default pacing algorithm threshold as a percentage of FIFO depth, used
/// when the device reports service-type support.
pub const PACING_ALGO_THRESHOLD_PCT: u32 = 5;

/// FIFO occupancy at which the pacing interrupt is armed, in entries.
pub const PACING_EN_INT_THRESHOLD: u32 = 50;

/// Percentage of DB FIFO depth programmed as the throttling watermark.
///
/// The throttling register holds only 12 bits, so on the deeper FIFO the
/// watermark saturates at the register limit.
pub const PACING_DBQ_HIGH_WATERMARK_PCT: u32 = 36;

/// Userland doorbell-drop recovery timeout, in milliseconds.
pub const DBR_RECOV_USERLAND_TIMEOUT_MS: u64 = 20;

/// Driver-internal recovery poll cadence, in milliseconds.
pub const DBR_INT_TIME_MS: u64 = 5;

/// Chip generation of the HCA.
///
/// The two generations differ in DB FIFO depth and in whether the alarm
/// escalation tier of the pacing algorithm is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipGen {
    /// First generation with doorbell pacing support.
    P5,
    /// Later generation with a deeper FIFO; alarm auto-tuning stays off.
    P7,
}

impl ChipGen {
    /// Maximum depth of the hardware doorbell FIFO, in entries.
    #[inline]
    pub fn max_fifo_depth(self) -> u32 {
        match self {
            ChipGen::P5 => 0x2c00,
            ChipGen::P7 => 0x8000,
        }
    }

    /// Alarm threshold multiple: the alarm threshold is this many times the
    /// pacing algorithm threshold. Zero disables the alarm tier.
    #[inline]
    pub fn alarm_th_multiple(self) -> u32 {
        match self {
            ChipGen::P5 => 2,
            ChipGen::P7 => 0,
        }
    }
}

/// Device capabilities relevant to the control plane, as reported by the
/// capability query at initialization. Nothing here is persisted; the state
/// is rebuilt from a fresh query every time a device context is created.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCaps {
    /// Chip generation.
    pub chip_gen: ChipGen,
    /// Doorbell pacing is supported and enabled in firmware.
    pub dbr_pacing: bool,
    /// Doorbell-drop recovery is supported and enabled in firmware.
    pub dbr_drop_recov: bool,
    /// Service-type queue profiles are supported; changes how the pacing
    /// threshold knob is interpreted (percentage of depth vs. entries).
    pub service_type_supported: bool,
}

impl DeviceCaps {
    /// Capabilities with every pacing/recovery feature enabled.
    pub fn new(chip_gen: ChipGen) -> Self {
        Self {
            chip_gen,
            dbr_pacing: true,
            dbr_drop_recov: true,
            service_type_supported: false,
        }
    }
}

/// Control-plane tuning knobs.
///
/// Defaults come from the hardware reference values; most deployments only
/// ever touch the recovery timeout.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    /// Pacing algorithm threshold in DB FIFO entries.
    /// Default: 250
    pub pacing_algo_th: u32,
    /// Pacing algorithm threshold as a percentage of FIFO depth; used
    /// instead of `pacing_algo_th` when the device reports service-type
    /// support.
    /// Default: 5
    pub pacing_algo_th_pct: u32,
    /// FIFO occupancy at which the pacing interrupt is armed.
    /// Default: 50
    pub pacing_en_int_th: u32,
    /// Period of the pacing re-evaluation tick, in milliseconds.
    /// Default: 5
    pub dbq_pacing_time_ms: u64,
    /// do-pacing value restored when congestion clears.
    /// Default: 0x7F
    pub def_do_pacing: u32,
    /// Throttling watermark as a percentage of FIFO depth.
    /// Default: 36
    pub dbq_watermark_pct: u32,
    /// How long a notified application has to acknowledge a drop-recovery
    /// epoch, in milliseconds.
    /// Default: 20
    pub user_recov_timeout_ms: u64,
    /// Cadence at which the recovery wait re-checks acknowledgments, in
    /// milliseconds.
    /// Default: 5
    pub recov_poll_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            pacing_algo_th: PACING_ALGO_THRESHOLD,
            pacing_algo_th_pct: PACING_ALGO_THRESHOLD_PCT,
            pacing_en_int_th: PACING_EN_INT_THRESHOLD,
            dbq_pacing_time_ms: DBR_INT_TIME_MS,
            def_do_pacing: DBR_DO_PACING_NO_CONGESTION,
            dbq_watermark_pct: PACING_DBQ_HIGH_WATERMARK_PCT,
            user_recov_timeout_ms: DBR_RECOV_USERLAND_TIMEOUT_MS,
            recov_poll_ms: DBR_INT_TIME_MS,
        }
    }
}

impl PacingConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pacing algorithm threshold in FIFO entries.
    pub fn with_pacing_algo_th(mut self, th: u32) -> Self {
        self.pacing_algo_th = th;
        self
    }

    /// Set the percentage-of-depth pacing threshold.
    pub fn with_pacing_algo_th_pct(mut self, pct: u32) -> Self {
        self.pacing_algo_th_pct = pct;
        self
    }

    /// Set the pacing tick period.
    pub fn with_dbq_pacing_time_ms(mut self, ms: u64) -> Self {
        self.dbq_pacing_time_ms = ms;
        self
    }

    /// Set the uncongested do-pacing value.
    pub fn with_def_do_pacing(mut self, v: u32) -> Self {
        self.def_do_pacing = v;
        self
    }

    /// Set the throttling watermark percentage.
    pub fn with_dbq_watermark_pct(mut self, pct: u32) -> Self {
        self.dbq_watermark_pct = pct;
        self
    }

    /// Set the recovery acknowledgment timeout.
    pub fn with_user_recov_timeout_ms(mut self, ms: u64) -> Self {
        self.user_recov_timeout_ms = ms;
        self
    }

    /// Set the recovery poll cadence.
    pub fn with_recov_poll_ms(mut self, ms: u64) -> Self {
        self.recov_poll_ms = ms;
        self
    }

    /// Validate the configuration against the device capabilities.
    pub fn validate(&self, caps: &DeviceCaps) -> Result<()> {
        let depth = caps.chip_gen.max_fifo_depth();
        if self.def_do_pacing > MAX_DBR_DO_PACING {
            return Err(Error::InvalidConfig(format!(
                "def_do_pacing {:#x} exceeds {:#x}",
                self.def_do_pacing, MAX_DBR_DO_PACING
            )));
        }
        if self.pacing_algo_th == 0 || self.pacing_algo_th >= depth {
            return Err(Error::InvalidConfig(format!(
                "pacing_algo_th {} out of range for FIFO depth {}",
                self.pacing_algo_th, depth
            )));
        }
        if self.pacing_algo_th_pct == 0 || self.pacing_algo_th_pct >= 100 {
            return Err(Error::InvalidConfig(format!(
                "pacing_algo_th_pct {} out of range",
                self.pacing_algo_th_pct
            )));
        }
        if self.dbq_watermark_pct > 100 {
            return Err(Error::InvalidConfig(format!(
                "dbq_watermark_pct {} out of range",
                self.dbq_watermark_pct
            )));
        }
        if self.dbq_pacing_time_ms == 0 || self.recov_poll_ms == 0 {
            return Err(Error::InvalidConfig(
                "tick period and poll cadence must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective pacing algorithm threshold for a device.
    ///
    /// With service-type support the threshold knob is a percentage of the
    /// FIFO depth; otherwise it is an absolute entry count.
    pub fn effective_algo_th(&self, caps: &DeviceCaps) -> u32 {
        let depth = caps.chip_gen.max_fifo_depth();
        let th = if caps.service_type_supported {
            depth * self.pacing_algo_th_pct / 100
        } else {
            self.pacing_algo_th
        };
        th.clamp(1, depth - 1)
    }
}
