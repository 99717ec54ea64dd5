//! ARM Generic Interrupt Controller (GICv2/v3) backend.
//!
//! Not wired into the default x86_64 build (see `DESIGN.md`'s architecture
//! scope decision); kept as a real, testable module so the
//! [`InterruptController`] trait has an aarch64 implementor and the
//! distributor's pending-bit bookkeeping is exercised without needing
//! `/dev/kvm`'s `KVM_DEV_TYPE_ARM_VGIC_V3` device.
//!
//! This models only the piece relevant to GSI delivery: the distributor's
//! per-SPI enable and pending bitmaps. The redistributor, ITS (for GICv3
//! LPIs) and CPU-interface register emulation are KVM in-kernel concerns on
//! real hardware and are not reimplemented here.

use super::{InterruptController, IrqError};
use std::sync::Mutex;

/// SPIs (Shared Peripheral Interrupts) start at GIC INTID 32; IDs below that
/// are SGIs/PPIs, private to a core and not used for device GSIs.
pub const SPI_BASE: u32 = 32;
/// GICv2 architectural limit; GICv3 extends this but the shallow model here
/// doesn't need more.
pub const MAX_SPIS: u32 = 480;

pub struct Gic {
    enabled: Mutex<Vec<bool>>,
    pending: Mutex<Vec<bool>>,
}

impl Gic {
    pub fn new() -> Self {
        Self {
            enabled: Mutex::new(vec![false; MAX_SPIS as usize]),
            pending: Mutex::new(vec![false; MAX_SPIS as usize]),
        }
    }

    fn spi_index(gsi: u32) -> Result<usize, IrqError> {
        let intid = gsi.checked_add(SPI_BASE).ok_or(IrqError::UnknownGsi(gsi))?;
        let idx = (intid - SPI_BASE) as usize;
        if idx >= MAX_SPIS as usize {
            return Err(IrqError::UnknownGsi(gsi));
        }
        Ok(idx)
    }

    pub fn set_enabled(&self, gsi: u32, enabled: bool) -> Result<(), IrqError> {
        let idx = Self::spi_index(gsi)?;
        self.enabled.lock().unwrap()[idx] = enabled;
        Ok(())
    }
}

impl Default for Gic {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptController for Gic {
    fn raise(&self, gsi: u32) -> Result<(), IrqError> {
        let idx = Self::spi_index(gsi)?;
        self.pending.lock().unwrap()[idx] = true;
        Ok(())
    }

    fn lower(&self, gsi: u32) -> Result<(), IrqError> {
        let idx = Self::spi_index(gsi)?;
        self.pending.lock().unwrap()[idx] = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_sets_pending_bit() {
        let gic = Gic::new();
        gic.set_enabled(0, true).unwrap();
        gic.raise(0).unwrap();
        assert!(gic.pending.lock().unwrap()[0]);
        gic.lower(0).unwrap();
        assert!(!gic.pending.lock().unwrap()[0]);
    }

    #[test]
    fn out_of_range_gsi_is_an_error() {
        let gic = Gic::new();
        assert!(gic.raise(MAX_SPIS + 1).is_err());
    }
}
