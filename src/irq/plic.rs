//! RISC-V Platform-Level Interrupt Controller (PLIC) backend.
//!
//! Not wired into the default x86_64 build (see `DESIGN.md`). Models the
//! piece needed for GSI delivery: per-source priority/pending/enable state
//! and a single target context's threshold, matching the PLIC spec's
//! memory-mapped register groups closely enough to unit-test the claim
//! logic without emulating the MMIO surface itself.

use super::{InterruptController, IrqError};
use std::sync::Mutex;

pub const MAX_SOURCES: u32 = 1024;

struct Source {
    priority: u32,
    enabled: bool,
    pending: bool,
}

pub struct Plic {
    sources: Mutex<Vec<Source>>,
    threshold: Mutex<u32>,
}

impl Plic {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new((0..MAX_SOURCES).map(|_| Source { priority: 1, enabled: false, pending: false }).collect()),
            threshold: Mutex::new(0),
        }
    }

    pub fn set_priority(&self, gsi: u32, priority: u32) -> Result<(), IrqError> {
        let mut sources = self.sources.lock().unwrap();
        let src = sources.get_mut(gsi as usize).ok_or(IrqError::UnknownGsi(gsi))?;
        src.priority = priority;
        Ok(())
    }

    pub fn set_enabled(&self, gsi: u32, enabled: bool) -> Result<(), IrqError> {
        let mut sources = self.sources.lock().unwrap();
        let src = sources.get_mut(gsi as usize).ok_or(IrqError::UnknownGsi(gsi))?;
        src.enabled = enabled;
        Ok(())
    }

    pub fn set_threshold(&self, threshold: u32) {
        *self.threshold.lock().unwrap() = threshold;
    }

    /// The highest-priority pending, enabled source above the current
    /// threshold, if any (what a target's `claim` register would return).
    pub fn claim(&self) -> Option<u32> {
        let sources = self.sources.lock().unwrap();
        let threshold = *self.threshold.lock().unwrap();
        sources
            .iter()
            .enumerate()
            .filter(|(_, s)| s.pending && s.enabled && s.priority > threshold)
            .max_by_key(|(_, s)| s.priority)
            .map(|(i, _)| i as u32)
    }
}

impl Default for Plic {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptController for Plic {
    fn raise(&self, gsi: u32) -> Result<(), IrqError> {
        let mut sources = self.sources.lock().unwrap();
        let src = sources.get_mut(gsi as usize).ok_or(IrqError::UnknownGsi(gsi))?;
        src.pending = true;
        Ok(())
    }

    fn lower(&self, gsi: u32) -> Result<(), IrqError> {
        let mut sources = self.sources.lock().unwrap();
        let src = sources.get_mut(gsi as usize).ok_or(IrqError::UnknownGsi(gsi))?;
        src.pending = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_picks_highest_priority_pending_source() {
        let plic = Plic::new();
        plic.set_enabled(1, true).unwrap();
        plic.set_priority(1, 2).unwrap();
        plic.set_enabled(2, true).unwrap();
        plic.set_priority(2, 5).unwrap();
        plic.raise(1).unwrap();
        plic.raise(2).unwrap();
        assert_eq!(plic.claim(), Some(2));
    }

    #[test]
    fn threshold_masks_low_priority_sources() {
        let plic = Plic::new();
        plic.set_enabled(1, true).unwrap();
        plic.set_priority(1, 2).unwrap();
        plic.raise(1).unwrap();
        plic.set_threshold(3);
        assert_eq!(plic.claim(), None);
    }
}
