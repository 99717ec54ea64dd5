//! virtio-pci "legacy" transport (virtio spec 4.1.4): an I/O-port BAR with
//! the pre-1.0 register layout. Kept alongside the modern transport because
//! some guest drivers (older kernels, some firmware) only speak legacy.

use crate::io::pio::{IoData, PioDevice};
use crate::virtio::device::{DeviceStatus, VirtioDeviceOps};
use crate::virtio::ring::Virtqueue;

const REG_DEVICE_FEATURES: u16 = 0x00;
const REG_GUEST_FEATURES: u16 = 0x04;
const REG_QUEUE_ADDRESS: u16 = 0x08; // page frame number, page size 4096
const REG_QUEUE_SIZE: u16 = 0x0c;
const REG_QUEUE_SELECT: u16 = 0x0e;
const REG_QUEUE_NOTIFY: u16 = 0x10;
const REG_STATUS: u16 = 0x12;
const REG_ISR: u16 = 0x13;
/// Device-specific config space starts here (no MSI-X negotiated).
const REG_CONFIG: u16 = 0x14;

const VIRTIO_PCI_QUEUE_ADDR_SHIFT: u32 = 12; // 4K pages

/// Drives a `VirtioDeviceOps` through the legacy virtio-pci I/O BAR.
/// Legacy virtio only negotiates a 32-bit feature word (bits 32+ of a
/// modern device's features are simply unreachable through this BAR).
pub struct VirtioPciLegacyTransport {
    device: Box<dyn VirtioDeviceOps>,
    queues: Vec<Virtqueue>,
    queue_sel: u16,
    status: DeviceStatus,
    isr: u8,
    raise_irq: Box<dyn Fn() + Send>,
}

impl VirtioPciLegacyTransport {
    pub fn new(device: Box<dyn VirtioDeviceOps>, raise_irq: Box<dyn Fn() + Send>) -> Self {
        let num_queues = device.num_queues();
        Self {
            queues: (0..num_queues).map(|_| Virtqueue::new()).collect(),
            device,
            queue_sel: 0,
            status: DeviceStatus::default(),
            isr: 0,
            raise_irq,
        }
    }

    fn current_queue_mut(&mut self) -> Option<&mut Virtqueue> {
        self.queues.get_mut(self.queue_sel as usize)
    }
}

impl PioDevice for VirtioPciLegacyTransport {
    fn pio_read(&mut self, _port: u16, data: &mut IoData) {
        // `_port` has already been translated to a BAR-relative offset by
        // the caller (the PCI BAR dispatch layer in `devices::pci`).
        let offset = _port;
        match offset {
            REG_DEVICE_FEATURES => {
                let bytes = (self.device.device_features() as u32).to_le_bytes();
                for i in 0..data.len().min(4) {
                    data.set(i, bytes[i]);
                }
            }
            REG_QUEUE_SIZE => {
                let size = self.queues.get(self.queue_sel as usize).map_or(0, |q| q.size);
                let bytes = size.to_le_bytes();
                for i in 0..data.len().min(2) {
                    data.set(i, bytes[i]);
                }
            }
            REG_STATUS => data.set(0, self.status.bits()),
            REG_ISR => {
                data.set(0, self.isr);
                self.isr = 0; // reading ISR acks it, per spec 4.1.4.5
            }
            offset if offset >= REG_CONFIG => {
                let mut buf = [0u8; 4];
                self.device.read_config((offset - REG_CONFIG) as u64, &mut buf[..data.len().min(4)]);
                for i in 0..data.len().min(4) {
                    data.set(i, buf[i]);
                }
            }
            _ => {}
        }
    }

    fn pio_write(&mut self, _port: u16, data: &IoData) {
        let offset = _port;
        let bytes = data.as_slice();
        match offset {
            REG_GUEST_FEATURES if bytes.len() >= 4 => {
                let features = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                self.device.ack_features(features as u64);
            }
            REG_QUEUE_ADDRESS if bytes.len() >= 4 => {
                let pfn = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                let desc_table = (pfn as u64) << VIRTIO_PCI_QUEUE_ADDR_SHIFT;
                let sel = self.queue_sel;
                if let Some(q) = self.current_queue_mut() {
                    // Legacy virtio-pci lays the avail/used rings out
                    // immediately after the descriptor table within the
                    // same allocation; the guest driver computed that
                    // layout, we just need the base.
                    q.desc_table = desc_table;
                    let desc_bytes = q.size as u64 * 16;
                    q.avail_ring = desc_table + desc_bytes;
                    let avail_bytes = 6 + q.size as u64 * 2;
                    let used_base = (q.avail_ring + avail_bytes + 4095) & !4095;
                    q.used_ring = used_base;
                    q.ready = pfn != 0;
                    if q.ready {
                        if let Err(e) = self.device.queue_ready(sel, q) {
                            eprintln!("[virtio-pci-legacy] queue {sel} ready failed: {e}");
                        }
                    }
                }
            }
            REG_QUEUE_SELECT if bytes.len() >= 2 => {
                self.queue_sel = u16::from_le_bytes([bytes[0], bytes[1]]);
            }
            REG_QUEUE_NOTIFY if bytes.len() >= 2 => {
                let idx = u16::from_le_bytes([bytes[0], bytes[1]]);
                let Some(queue) = self.queues.get_mut(idx as usize) else {
                    eprintln!("[virtio-pci-legacy] notify for unknown queue {idx}");
                    return;
                };
                match self.device.process_queue(idx, queue) {
                    Ok(true) => {
                        self.isr |= 1;
                        (self.raise_irq)();
                    }
                    Ok(false) => {}
                    Err(e) => eprintln!("[virtio-pci-legacy] queue {idx} processing failed: {e}"),
                }
            }
            REG_STATUS if !bytes.is_empty() => {
                if self.status.write(bytes[0]) {
                    self.queues = (0..self.device.num_queues()).map(|_| Virtqueue::new()).collect();
                    self.isr = 0;
                }
            }
            offset if offset >= REG_CONFIG => {
                self.device.write_config((offset - REG_CONFIG) as u64, bytes);
            }
            _ => {}
        }
    }
}
