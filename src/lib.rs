//! # dbrctl - Doorbell-rate control plane for a RoCE HCA
//!
//! This crate implements the control-plane core of a RoCE host channel
//! adapter driver: it tracks device resources across their lifecycle and
//! runs the feedback loop that keeps the on-chip doorbell FIFO from
//! overflowing, paired with an epoch-based recovery protocol for doorbells
//! the hardware silently dropped.
//!
//! ## Features
//!
//! - **Resource registry**: per-type (CQ, user context, QP, SRQ) tracked
//!   lists with independent locking, walked in a fixed order when the device
//!   reports a doorbell drop
//! - **Doorbell pacing**: FIFO occupancy sampling, a monotonic saturating
//!   do-pacing curve, watermark programming, and an alarm escalation tier
//! - **Drop recovery**: monotonic epochs, bounded per-application
//!   acknowledgment waits, best-effort timeout accounting
//! - **Async event dispatch**: non-blocking classification of firmware
//!   events into deferred background work
//! - **Statistics**: slab-bucketed occupancy/do-pacing counters, recovery
//!   counters, and a recovery-latency histogram with administrative clears
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use dbrctl::{ChipGen, DeviceCaps, DeviceContext, PacingConfig, ResType};
//!
//! // Build the control plane from the device capability query.
//! let caps = DeviceCaps::new(ChipGen::P5);
//! let dev = DeviceContext::new(caps, PacingConfig::default(), bar_regs)?;
//!
//! // The verbs layer tracks each doorbell-issuing resource.
//! dev.register_resource(ResType::Qp, qp.clone());
//!
//! // The interrupt path hands async completions straight in.
//! dev.on_async_event(&cmpl);
//!
//! // The doorbell fast path reads the shared pacing state lock-free.
//! let do_pacing = dev.pacing_data().do_pacing();
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: chip generations, capability query, tuning knobs
//! - [`regs`]: the hardware register seam (`DoorbellRegs`)
//! - [`registry`]: per-type resource lists (`ResourceRegistry`)
//! - [`pacing`]: the pacing controller (`PacingEngine`, `PacingData`)
//! - [`recovery`]: the drop-recovery coordinator (`RecoveryEngine`)
//! - [`events`]: async event decode (`AsyncEventCmpl`)
//! - [`device`]: the per-adapter ownership root (`DeviceContext`)
//! - [`stats`]: counters and snapshots
//! - [`workqueue`]: the deferred background executor

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod pacing;
pub mod recovery;
pub mod registry;
pub mod regs;
pub mod stats;
pub mod test_utils;
pub mod workqueue;

// Re-export main types
pub use config::{ChipGen, DeviceCaps, PacingConfig};
pub use device::{is_device_valid, DeviceContext, DeviceFlags};
pub use error::{Error, Result};
pub use events::{AsyncEventCmpl, EventKind};
pub use pacing::{PacingData, PacingSnapshot};
pub use registry::{RecoveryTarget, ResType};
pub use regs::DoorbellRegs;
pub use stats::{DbqStatsSnapshot, DbrSwStatsSnapshot};
