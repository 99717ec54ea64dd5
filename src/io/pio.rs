//! Flat port-I/O (PIO) dispatch table (x86 only).
//!
//! Port space is 64 K slots wide. Each registered handler occupies a
//! contiguous run of slots; overlapping registration is rejected (spec
//! §4.3). Dispatch is a single array index, no locking beyond the bus's
//! own reader/writer lock (the "brlock" of spec §5): registration takes
//! the write side, dispatch the read side, so a region cannot disappear
//! mid-dispatch.

use std::sync::RwLock;
use thiserror::Error;

/// Fixed-size I/O data buffer (x86 IN/OUT supports 1, 2 or 4 bytes).
pub const MAX_IO_SIZE: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct IoData {
    data: [u8; MAX_IO_SIZE],
    len: u8,
}

impl IoData {
    pub fn new(len: usize) -> Self {
        debug_assert!(len <= MAX_IO_SIZE);
        Self {
            data: [0; MAX_IO_SIZE],
            len: len as u8,
        }
    }

    pub fn from_slice(slice: &[u8]) -> Self {
        let len = slice.len().min(MAX_IO_SIZE);
        let mut data = [0u8; MAX_IO_SIZE];
        data[..len].copy_from_slice(&slice[..len]);
        Self {
            data,
            len: len as u8,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&mut self, index: usize, value: u8) {
        if index < self.len as usize {
            self.data[index] = value;
        }
    }
}

impl Default for IoData {
    fn default() -> Self {
        Self::new(0)
    }
}

/// A device that responds to port I/O.
pub trait PioDevice: Send {
    fn pio_read(&mut self, port: u16, data: &mut IoData);
    fn pio_write(&mut self, port: u16, data: &IoData);
}

#[derive(Error, Debug)]
pub enum PioError {
    #[error("port range {port:#x}..{end:#x} overlaps an existing registration")]
    Overlap { port: u16, end: u32 },
}

struct Slot {
    device: *mut dyn PioDevice,
}

// Safety: slots are only ever dereferenced while holding the bus's
// reader/writer lock, and devices are boxed and owned by `PioBus` for its
// whole lifetime.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

/// 64 K-slot flat port table.
pub struct PioBus {
    slots: RwLock<Vec<Option<Slot>>>,
    // Keeps registered devices alive; indexed by registration order.
    devices: RwLock<Vec<Box<dyn PioDevice>>>,
}

impl PioBus {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; 1 << 16]),
            devices: RwLock::new(Vec::new()),
        }
    }

    /// Register `device` to handle `[port, port+len)`. `len` is the number
    /// of consecutive one-byte slots the device answers for, not an
    /// individual access size.
    pub fn register(
        &self,
        port: u16,
        len: u16,
        device: Box<dyn PioDevice>,
    ) -> Result<(), PioError> {
        let end = port as u32 + len as u32;
        if end > 1 << 16 {
            return Err(PioError::Overlap { port, end });
        }

        let mut slots = self.slots.write().unwrap();
        for p in port..(port as u32 + len as u32) as u16 {
            if slots[p as usize].is_some() {
                return Err(PioError::Overlap { port, end });
            }
        }

        let mut devices = self.devices.write().unwrap();
        devices.push(device);
        let raw: *mut dyn PioDevice = devices.last_mut().unwrap().as_mut();

        for p in port..(port as u32 + len as u32) as u16 {
            slots[p as usize] = Some(Slot { device: raw });
        }
        Ok(())
    }

    /// Dispatch an IN instruction. Returns `false` if no handler is
    /// registered for `port` (caller falls back to the debug dump per
    /// spec §4.1).
    pub fn read(&self, port: u16, data: &mut IoData) -> bool {
        let slots = self.slots.read().unwrap();
        match &slots[port as usize] {
            Some(slot) => {
                // Safety: the device outlives `self` and is never moved
                // once boxed; dispatch holds the read lock so no
                // concurrent `register` can invalidate the pointer.
                unsafe { (*slot.device).pio_read(port, data) };
                true
            }
            None => false,
        }
    }

    /// Dispatch an OUT instruction.
    pub fn write(&self, port: u16, data: &IoData) -> bool {
        let slots = self.slots.read().unwrap();
        match &slots[port as usize] {
            Some(slot) => {
                unsafe { (*slot.device).pio_write(port, data) };
                true
            }
            None => false,
        }
    }
}

impl Default for PioBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(u8);
    impl PioDevice for Echo {
        fn pio_read(&mut self, _port: u16, data: &mut IoData) {
            for i in 0..data.len() {
                data.set(i, self.0);
            }
        }
        fn pio_write(&mut self, _port: u16, data: &IoData) {
            if let Some(&b) = data.as_slice().first() {
                self.0 = b;
            }
        }
    }

    #[test]
    fn pio_echo_roundtrip() {
        let bus = PioBus::new();
        bus.register(0x80, 1, Box::new(Echo(0))).unwrap();

        let mut out = IoData::new(1);
        out.set(0, 0xA5);
        assert!(bus.write(0x80, &out));

        let mut data = IoData::new(1);
        assert!(bus.read(0x80, &mut data));
        assert_eq!(data.as_slice(), &[0xA5]);
    }

    #[test]
    fn unregistered_port_returns_false() {
        let bus = PioBus::new();
        let mut data = IoData::new(1);
        assert!(!bus.read(0x1234, &mut data));
    }

    #[test]
    fn overlapping_registration_is_rejected() {
        let bus = PioBus::new();
        bus.register(0x3f8, 8, Box::new(Echo(0))).unwrap();
        let err = bus.register(0x3fa, 2, Box::new(Echo(0)));
        assert!(err.is_err());
    }
}
