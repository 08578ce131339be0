//! Hardware register access for the doorbell control plane.
//!
//! Three doorbell-related registers matter here: the DB FIFO register (its
//! room field tells how many entries are still free), the throttling register
//! (the programmed watermark), and the pacing interrupt arm register. The
//! `DoorbellRegs` trait is the seam between the control plane and the BAR;
//! the production implementation maps the device BAR, tests use
//! [`crate::test_utils::MockRegs`].

use std::io;

use crate::config::ChipGen;

/// The throttling register watermark field is 12 bits wide.
pub const DB_THROTTLING_MAX: u32 = 0xFFF;

/// Layout of the free-room field of the DB FIFO register. The field starts
/// at the same bit on both generations but is wider where the FIFO is deeper.
#[derive(Debug, Clone, Copy)]
pub struct FifoLayout {
    /// Maximum FIFO depth in entries.
    pub max_depth: u32,
    /// Mask of the free-room field.
    pub room_mask: u32,
    /// Shift of the free-room field.
    pub room_shift: u32,
}

impl FifoLayout {
    /// FIFO layout for a chip generation.
    pub fn for_gen(gen: ChipGen) -> Self {
        match gen {
            ChipGen::P5 => Self {
                max_depth: gen.max_fifo_depth(),
                room_mask: 0x1FFF_8000,
                room_shift: 15,
            },
            ChipGen::P7 => Self {
                max_depth: gen.max_fifo_depth(),
                room_mask: 0x7FFF_8000,
                room_shift: 15,
            },
        }
    }

    /// Decode FIFO occupancy from a raw DB FIFO register value.
    ///
    /// The register reports free room; occupancy is the distance from the
    /// generation's maximum depth, clamped to that depth.
    #[inline]
    pub fn occupancy(&self, raw: u32) -> u32 {
        let room = (raw & self.room_mask) >> self.room_shift;
        self.max_depth.saturating_sub(room)
    }

    /// Encode a FIFO occupancy into a raw register value. The inverse of
    /// [`FifoLayout::occupancy`]; used by the mock register block.
    #[inline]
    pub fn encode_occupancy(&self, occupancy: u32) -> u32 {
        let room = self.max_depth.saturating_sub(occupancy.min(self.max_depth));
        (room << self.room_shift) & self.room_mask
    }
}

/// Access to the doorbell-related hardware registers.
///
/// Implementations must be cheap and non-blocking; the pacing tick calls
/// into this on every period.
pub trait DoorbellRegs: Send + Sync {
    /// Read the raw DB FIFO register.
    ///
    /// # Errors
    /// Fails when the underlying query fails (for example a firmware stats
    /// query timing out). Callers treat this as transient and reuse the
    /// previous sample.
    fn read_db_fifo(&self) -> io::Result<u32>;

    /// Program the throttling watermark for the given notification queue.
    fn write_throttling(&self, nq_id: u16, watermark: u32);

    /// Arm the pacing interrupt to fire at the given FIFO occupancy.
    fn arm_pacing_interrupt(&self, nq_id: u16, threshold: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_occupancy_round_trip() {
        for gen in [ChipGen::P5, ChipGen::P7] {
            let layout = FifoLayout::for_gen(gen);
            for occup in [0, 300, layout.max_depth / 2, layout.max_depth] {
                assert_eq!(layout.occupancy(layout.encode_occupancy(occup)), occup);
            }
        }
    }

    #[test]
    fn test_room_field_holds_full_depth() {
        for gen in [ChipGen::P5, ChipGen::P7] {
            let layout = FifoLayout::for_gen(gen);
            assert!(layout.max_depth <= layout.room_mask >> layout.room_shift);
        }
    }

    #[test]
    fn test_occupancy_clamped_to_depth() {
        // A raw value reporting more room than the FIFO holds decodes to 0.
        let layout = FifoLayout::for_gen(ChipGen::P5);
        let raw = layout.room_mask;
        assert_eq!(layout.occupancy(raw), 0);
    }
}
