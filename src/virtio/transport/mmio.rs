//! virtio-mmio v2 transport, generalized from the teacher's `VirtioBlk`
//! register handling to drive any [`VirtioDeviceOps`] implementor.

use super::MAX_QUEUE_SIZE;
use crate::io::mmio::MmioDevice;
use crate::virtio::device::{DeviceStatus, VirtioDeviceOps};
use crate::virtio::ring::Virtqueue;

pub const MMIO_MAGIC_VALUE: u64 = 0x000;
pub const MMIO_VERSION: u64 = 0x004;
pub const MMIO_DEVICE_ID: u64 = 0x008;
pub const MMIO_VENDOR_ID: u64 = 0x00c;
pub const MMIO_DEVICE_FEATURES: u64 = 0x010;
pub const MMIO_DEVICE_FEATURES_SEL: u64 = 0x014;
pub const MMIO_DRIVER_FEATURES: u64 = 0x020;
pub const MMIO_DRIVER_FEATURES_SEL: u64 = 0x024;
pub const MMIO_QUEUE_SEL: u64 = 0x030;
pub const MMIO_QUEUE_NUM_MAX: u64 = 0x034;
pub const MMIO_QUEUE_NUM: u64 = 0x038;
pub const MMIO_QUEUE_READY: u64 = 0x044;
pub const MMIO_QUEUE_NOTIFY: u64 = 0x050;
pub const MMIO_INTERRUPT_STATUS: u64 = 0x060;
pub const MMIO_INTERRUPT_ACK: u64 = 0x064;
pub const MMIO_STATUS: u64 = 0x070;
pub const MMIO_QUEUE_DESC_LOW: u64 = 0x080;
pub const MMIO_QUEUE_DESC_HIGH: u64 = 0x084;
pub const MMIO_QUEUE_DRIVER_LOW: u64 = 0x090;
pub const MMIO_QUEUE_DRIVER_HIGH: u64 = 0x094;
pub const MMIO_QUEUE_DEVICE_LOW: u64 = 0x0a0;
pub const MMIO_QUEUE_DEVICE_HIGH: u64 = 0x0a4;
/// Start of device-specific configuration space.
pub const MMIO_CONFIG: u64 = 0x100;

pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;
pub const VIRTIO_MMIO_VERSION: u32 = 2;
pub const VIRTIO_VENDOR_ID: u32 = 0x0;

/// Drives any `VirtioDeviceOps` through the virtio-mmio v2 register layout.
pub struct VirtioMmioTransport {
    device: Box<dyn VirtioDeviceOps>,
    queues: Vec<Virtqueue>,
    queue_sel: u32,
    features_sel: u32,
    driver_features: u64,
    status: DeviceStatus,
    interrupt_status: u32,
    /// Raises the device's assigned GSI; wired up by the caller once the
    /// IRQ router has allocated a line for this device.
    raise_irq: Box<dyn Fn() + Send>,
}

impl VirtioMmioTransport {
    pub fn new(device: Box<dyn VirtioDeviceOps>, raise_irq: Box<dyn Fn() + Send>) -> Self {
        let num_queues = device.num_queues();
        Self {
            queues: (0..num_queues).map(|_| Virtqueue::new()).collect(),
            device,
            queue_sel: 0,
            features_sel: 0,
            driver_features: 0,
            status: DeviceStatus::default(),
            interrupt_status: 0,
            raise_irq,
        }
    }

    fn selected_queue_mut(&mut self) -> Option<&mut Virtqueue> {
        self.queues.get_mut(self.queue_sel as usize)
    }

    fn process_notify(&mut self) {
        let idx = self.queue_sel as u16;
        let Some(queue) = self.queues.get_mut(idx as usize) else {
            eprintln!("[virtio-mmio] notify for unknown queue {idx}");
            return;
        };
        match self.device.process_queue(idx, queue) {
            Ok(should_kick) => {
                if should_kick {
                    self.interrupt_status |= 1;
                    (self.raise_irq)();
                }
            }
            Err(e) => eprintln!("[virtio-mmio] queue {idx} processing failed: {e}"),
        }
    }

    fn read_register(&mut self, offset: u64) -> u32 {
        match offset {
            MMIO_MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            MMIO_VERSION => VIRTIO_MMIO_VERSION,
            MMIO_DEVICE_ID => self.device.device_id(),
            MMIO_VENDOR_ID => VIRTIO_VENDOR_ID,
            MMIO_DEVICE_FEATURES => {
                let features = self.device.device_features();
                if self.features_sel == 0 {
                    features as u32
                } else {
                    (features >> 32) as u32
                }
            }
            MMIO_QUEUE_NUM_MAX => MAX_QUEUE_SIZE as u32,
            MMIO_QUEUE_READY => self
                .queues
                .get(self.queue_sel as usize)
                .is_some_and(|q| q.ready) as u32,
            MMIO_INTERRUPT_STATUS => self.interrupt_status,
            MMIO_STATUS => self.status.bits() as u32,
            offset if offset >= MMIO_CONFIG => {
                let mut buf = [0u8; 4];
                self.device.read_config(offset - MMIO_CONFIG, &mut buf);
                u32::from_le_bytes(buf)
            }
            _ => 0,
        }
    }

    fn write_register(&mut self, offset: u64, value: u32) {
        match offset {
            MMIO_DEVICE_FEATURES_SEL | MMIO_DRIVER_FEATURES_SEL => {
                self.features_sel = value;
            }
            MMIO_DRIVER_FEATURES => {
                if self.features_sel == 0 {
                    self.driver_features = (self.driver_features & !0xffff_ffff) | value as u64;
                } else {
                    self.driver_features =
                        (self.driver_features & 0xffff_ffff) | ((value as u64) << 32);
                }
                self.device.ack_features(self.driver_features);
            }
            MMIO_QUEUE_SEL => self.queue_sel = value,
            MMIO_QUEUE_NUM => {
                if value <= MAX_QUEUE_SIZE as u32 {
                    if let Some(q) = self.selected_queue_mut() {
                        q.size = value as u16;
                    }
                }
            }
            MMIO_QUEUE_READY => {
                let sel = self.queue_sel as u16;
                let ready = value != 0;
                if let Some(q) = self.selected_queue_mut() {
                    q.ready = ready;
                }
                if ready {
                    if let Some(q) = self.queues.get(sel as usize) {
                        if let Err(e) = self.device.queue_ready(sel, q) {
                            eprintln!("[virtio-mmio] queue {sel} ready callback failed: {e}");
                        }
                    }
                }
            }
            MMIO_QUEUE_NOTIFY => self.process_notify(),
            MMIO_INTERRUPT_ACK => self.interrupt_status &= !value,
            MMIO_STATUS => {
                if self.status.write(value as u8) {
                    self.queues = (0..self.device.num_queues()).map(|_| Virtqueue::new()).collect();
                    self.interrupt_status = 0;
                }
            }
            MMIO_QUEUE_DESC_LOW => {
                if let Some(q) = self.selected_queue_mut() {
                    q.desc_table = (q.desc_table & 0xffff_ffff_0000_0000) | value as u64;
                }
            }
            MMIO_QUEUE_DESC_HIGH => {
                if let Some(q) = self.selected_queue_mut() {
                    q.desc_table = (q.desc_table & 0xffff_ffff) | ((value as u64) << 32);
                }
            }
            MMIO_QUEUE_DRIVER_LOW => {
                if let Some(q) = self.selected_queue_mut() {
                    q.avail_ring = (q.avail_ring & 0xffff_ffff_0000_0000) | value as u64;
                }
            }
            MMIO_QUEUE_DRIVER_HIGH => {
                if let Some(q) = self.selected_queue_mut() {
                    q.avail_ring = (q.avail_ring & 0xffff_ffff) | ((value as u64) << 32);
                }
            }
            MMIO_QUEUE_DEVICE_LOW => {
                if let Some(q) = self.selected_queue_mut() {
                    q.used_ring = (q.used_ring & 0xffff_ffff_0000_0000) | value as u64;
                }
            }
            MMIO_QUEUE_DEVICE_HIGH => {
                if let Some(q) = self.selected_queue_mut() {
                    q.used_ring = (q.used_ring & 0xffff_ffff) | ((value as u64) << 32);
                }
            }
            offset if offset >= MMIO_CONFIG => {
                self.device
                    .write_config(offset - MMIO_CONFIG, &value.to_le_bytes());
            }
            _ => {}
        }
    }
}

impl MmioDevice for VirtioMmioTransport {
    fn mmio_read(&mut self, offset: u64, data: &mut [u8]) {
        let value = self.read_register(offset & !0x3);
        let bytes = value.to_le_bytes();
        let start = (offset & 0x3) as usize;
        let len = data.len().min(4 - start);
        data[..len].copy_from_slice(&bytes[start..start + len]);
    }

    fn mmio_write(&mut self, offset: u64, data: &[u8]) {
        if data.len() != 4 || offset & 0x3 != 0 {
            eprintln!(
                "[virtio-mmio] non-aligned write: offset={:#x} len={}",
                offset,
                data.len()
            );
            return;
        }
        let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        self.write_register(offset, value);
    }
}
