//! virtio-pci "modern" transport (virtio spec 4.1.4, `VIRTIO_F_VERSION_1`).
//!
//! The full spec lets the common-config, notify, ISR and device-config
//! structures live in separate PCI capabilities, each possibly in its own
//! BAR. This transport places all four in one MMIO BAR at fixed offsets —
//! a simplification real modern drivers tolerate fine (they discover each
//! structure's location from its capability entry, not by assuming a
//! layout), and one several lightweight VMMs in the ecosystem make for the
//! same reason: one BAR to register with `io::mmio::MmioBus` instead of
//! four.

use crate::io::mmio::MmioDevice;
use crate::virtio::device::{DeviceStatus, VirtioDeviceOps};
use crate::virtio::ring::Virtqueue;

/// Common configuration structure, spec 4.1.4.3.
mod common_cfg {
    pub const DEVICE_FEATURE_SELECT: u64 = 0x00;
    pub const DEVICE_FEATURE: u64 = 0x04;
    pub const DRIVER_FEATURE_SELECT: u64 = 0x08;
    pub const DRIVER_FEATURE: u64 = 0x0c;
    pub const NUM_QUEUES: u64 = 0x10; // u16, read-only
    pub const DEVICE_STATUS: u64 = 0x14; // u8
    pub const QUEUE_SELECT: u64 = 0x16; // u16
    pub const QUEUE_SIZE: u64 = 0x18; // u16
    pub const QUEUE_ENABLE: u64 = 0x1c; // u16
    pub const QUEUE_DESC: u64 = 0x20; // u64
    pub const QUEUE_DRIVER: u64 = 0x28; // u64 (avail ring)
    pub const QUEUE_DEVICE: u64 = 0x30; // u64 (used ring)
    pub const END: u64 = 0x38;
}

const NOTIFY_OFFSET: u64 = common_cfg::END;
const ISR_OFFSET: u64 = NOTIFY_OFFSET + 0x8;
const DEVICE_CONFIG_OFFSET: u64 = ISR_OFFSET + 0x8;

pub struct VirtioPciModernTransport {
    device: Box<dyn VirtioDeviceOps>,
    queues: Vec<Virtqueue>,
    queue_sel: u16,
    device_feature_sel: u32,
    driver_feature_sel: u32,
    driver_features: u64,
    status: DeviceStatus,
    isr: u8,
    raise_irq: Box<dyn Fn() + Send>,
}

impl VirtioPciModernTransport {
    pub fn new(device: Box<dyn VirtioDeviceOps>, raise_irq: Box<dyn Fn() + Send>) -> Self {
        let num_queues = device.num_queues();
        Self {
            queues: (0..num_queues).map(|_| Virtqueue::new()).collect(),
            device,
            queue_sel: 0,
            device_feature_sel: 0,
            driver_feature_sel: 0,
            driver_features: 0,
            status: DeviceStatus::default(),
            isr: 0,
            raise_irq,
        }
    }

    fn queue_mut(&mut self) -> Option<&mut Virtqueue> {
        self.queues.get_mut(self.queue_sel as usize)
    }

    fn handle_notify(&mut self) {
        let idx = self.queue_sel;
        let Some(queue) = self.queues.get_mut(idx as usize) else {
            eprintln!("[virtio-pci-modern] notify for unknown queue {idx}");
            return;
        };
        match self.device.process_queue(idx, queue) {
            Ok(true) => {
                self.isr |= 1;
                (self.raise_irq)();
            }
            Ok(false) => {}
            Err(e) => eprintln!("[virtio-pci-modern] queue {idx} processing failed: {e}"),
        }
    }
}

impl MmioDevice for VirtioPciModernTransport {
    fn mmio_read(&mut self, offset: u64, data: &mut [u8]) {
        use common_cfg::*;
        match offset {
            DEVICE_FEATURE => {
                let features = self.device.device_features();
                let word = if self.device_feature_sel == 0 {
                    features as u32
                } else {
                    (features >> 32) as u32
                };
                data[..data.len().min(4)].copy_from_slice(&word.to_le_bytes()[..data.len().min(4)]);
            }
            NUM_QUEUES => {
                let n = (self.device.num_queues()).to_le_bytes();
                data[..data.len().min(2)].copy_from_slice(&n[..data.len().min(2)]);
            }
            DEVICE_STATUS => data[0] = self.status.bits(),
            QUEUE_SIZE => {
                let size = self.queues.get(self.queue_sel as usize).map_or(0, |q| q.size);
                data[..2].copy_from_slice(&size.to_le_bytes());
            }
            QUEUE_ENABLE => {
                let enabled = self.queues.get(self.queue_sel as usize).is_some_and(|q| q.ready);
                data[..2].copy_from_slice(&(enabled as u16).to_le_bytes());
            }
            offset if offset == ISR_OFFSET => {
                data[0] = self.isr;
                self.isr = 0;
            }
            offset if offset >= DEVICE_CONFIG_OFFSET => {
                self.device.read_config(offset - DEVICE_CONFIG_OFFSET, data);
            }
            _ => data.fill(0),
        }
    }

    fn mmio_write(&mut self, offset: u64, data: &[u8]) {
        use common_cfg::*;
        match offset {
            DEVICE_FEATURE_SELECT if data.len() >= 4 => {
                self.device_feature_sel = u32::from_le_bytes(data[..4].try_into().unwrap());
            }
            DRIVER_FEATURE_SELECT if data.len() >= 4 => {
                self.driver_feature_sel = u32::from_le_bytes(data[..4].try_into().unwrap());
            }
            DRIVER_FEATURE if data.len() >= 4 => {
                let word = u32::from_le_bytes(data[..4].try_into().unwrap());
                if self.driver_feature_sel == 0 {
                    self.driver_features = (self.driver_features & !0xffff_ffff) | word as u64;
                } else {
                    self.driver_features =
                        (self.driver_features & 0xffff_ffff) | ((word as u64) << 32);
                }
                self.device.ack_features(self.driver_features);
            }
            QUEUE_SELECT if data.len() >= 2 => {
                self.queue_sel = u16::from_le_bytes(data[..2].try_into().unwrap());
            }
            QUEUE_SIZE if data.len() >= 2 => {
                let size = u16::from_le_bytes(data[..2].try_into().unwrap());
                if let Some(q) = self.queue_mut() {
                    q.size = size;
                }
            }
            QUEUE_ENABLE if data.len() >= 2 => {
                let enable = u16::from_le_bytes(data[..2].try_into().unwrap()) != 0;
                let sel = self.queue_sel;
                if let Some(q) = self.queue_mut() {
                    q.ready = enable;
                }
                if enable {
                    if let Some(q) = self.queues.get(sel as usize) {
                        if let Err(e) = self.device.queue_ready(sel, q) {
                            eprintln!("[virtio-pci-modern] queue {sel} ready failed: {e}");
                        }
                    }
                }
            }
            QUEUE_DESC if data.len() >= 8 => {
                if let Some(q) = self.queue_mut() {
                    q.desc_table = u64::from_le_bytes(data[..8].try_into().unwrap());
                }
            }
            QUEUE_DRIVER if data.len() >= 8 => {
                if let Some(q) = self.queue_mut() {
                    q.avail_ring = u64::from_le_bytes(data[..8].try_into().unwrap());
                }
            }
            QUEUE_DEVICE if data.len() >= 8 => {
                if let Some(q) = self.queue_mut() {
                    q.used_ring = u64::from_le_bytes(data[..8].try_into().unwrap());
                }
            }
            DEVICE_STATUS if !data.is_empty() => {
                if self.status.write(data[0]) {
                    self.queues = (0..self.device.num_queues()).map(|_| Virtqueue::new()).collect();
                    self.isr = 0;
                }
            }
            offset if offset == NOTIFY_OFFSET => self.handle_notify(),
            offset if offset >= DEVICE_CONFIG_OFFSET => {
                self.device.write_config(offset - DEVICE_CONFIG_OFFSET, data);
            }
            _ => {}
        }
    }
}
