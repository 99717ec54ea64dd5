//! RISC-V Advanced Interrupt Architecture (AIA) backend.
//!
//! The AIA's IMSIC delivers MSIs directly to a hart rather than routing
//! through a PLIC-style claim/complete dance; this module models just that
//! queue. Not wired into the default x86_64 build (see `DESIGN.md`).

use super::{InterruptController, IrqError};
use std::collections::VecDeque;
use std::sync::Mutex;

/// One hart's IMSIC: a FIFO of pending interrupt identities, matching the
/// "write any value, EEID becomes pending" semantics of the real MMIO page.
pub struct Imsic {
    pending: Mutex<VecDeque<u32>>,
}

impl Imsic {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Pop the next pending interrupt identity, if any (what reading the
    /// `topei` CSR would return).
    pub fn pop(&self) -> Option<u32> {
        self.pending.lock().unwrap().pop_front()
    }
}

impl Default for Imsic {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptController for Imsic {
    fn raise(&self, gsi: u32) -> Result<(), IrqError> {
        self.pending.lock().unwrap().push_back(gsi);
        Ok(())
    }

    fn lower(&self, _gsi: u32) -> Result<(), IrqError> {
        // MSI delivery has no level to deassert; a lower() is a no-op once
        // the identity has been popped by `pop`.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupts_are_delivered_in_order() {
        let imsic = Imsic::new();
        imsic.raise(3).unwrap();
        imsic.raise(7).unwrap();
        assert_eq!(imsic.pop(), Some(3));
        assert_eq!(imsic.pop(), Some(7));
        assert_eq!(imsic.pop(), None);
    }
}
