//! virtio-blk device engine, generalized from the teacher's `VirtioBlk` to
//! the transport-agnostic [`VirtioDeviceOps`] seam so it can be plugged into
//! any of `transport::{mmio, pci_legacy, pci_modern}`.

use crate::disk::DiskImage;
use crate::memory::GuestMemory;
use crate::virtio::device::{VirtioDeviceOps, VirtioError};
use crate::virtio::ring::Virtqueue;

const VIRTIO_BLK_DEVICE_ID: u32 = 2;
const SECTOR_SIZE: u64 = 512;
const BLK_SIZE: u32 = 512;

const VIRTIO_BLK_F_SIZE_MAX: u64 = 1 << 1;
const VIRTIO_BLK_F_SEG_MAX: u64 = 1 << 2;
const VIRTIO_BLK_F_BLK_SIZE: u64 = 1 << 6;
const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;
const VIRTIO_F_EVENT_IDX: u64 = 1 << 29;
const VIRTIO_F_VERSION_1: u64 = 1 << 32;

const SIZE_MAX: u32 = 1024 * 1024;
const SEG_MAX: u32 = 126;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;

const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

const CONFIG_CAPACITY: u64 = 0x00;
const CONFIG_SIZE_MAX: u64 = 0x08;
const CONFIG_SEG_MAX: u64 = 0x0c;
const CONFIG_BLK_SIZE: u64 = 0x14;

pub struct VirtioBlk {
    disk: Box<dyn DiskImage>,
    capacity: u64,
    memory: *const GuestMemory,
    driver_features: u64,
    request_count: u64,
}

// `memory` is only ever dereferenced on the vcpu thread driving MMIO/PIO
// exits, which is also the thread that constructed this device.
unsafe impl Send for VirtioBlk {}

impl VirtioBlk {
    /// # Safety
    /// `memory` must outlive this device; devices are always torn down
    /// before the guest memory backing the VM they belong to.
    pub fn new(disk: Box<dyn DiskImage>, memory: &GuestMemory) -> Self {
        let capacity = disk.num_sectors();
        eprintln!(
            "[virtio-blk] opened disk: {capacity} sectors, read_only={}",
            disk.read_only()
        );

        Self {
            disk,
            capacity,
            memory: memory as *const GuestMemory,
            driver_features: 0,
            request_count: 0,
        }
    }

    fn memory(&self) -> &GuestMemory {
        unsafe { &*self.memory }
    }

    fn event_idx_negotiated(&self) -> bool {
        self.driver_features & VIRTIO_F_EVENT_IDX != 0
    }

    fn process_request(&mut self, head: u16, queue: &mut Virtqueue) -> u32 {
        let memory = self.memory();
        let Some(chain) = queue.read_chain(memory, head) else {
            eprintln!("[virtio-blk] malformed descriptor chain at {head}");
            return 0;
        };
        if chain.len() < 2 {
            eprintln!("[virtio-blk] request too short: {} buffers", chain.len());
            return 0;
        }

        let header = &chain[0];
        let mut header_buf = [0u8; 16];
        if memory.read(header.addr, &mut header_buf).is_err() {
            eprintln!("[virtio-blk] failed to read request header");
            return 0;
        }
        let req_type = u32::from_le_bytes(header_buf[0..4].try_into().unwrap());
        let sector = u64::from_le_bytes(header_buf[8..16].try_into().unwrap());

        let status_elem = &chain[chain.len() - 1];
        if !status_elem.write {
            eprintln!("[virtio-blk] status descriptor not device-writable");
            return 0;
        }

        let data = &chain[1..chain.len() - 1];
        let mut written = 0u32;
        let status = match req_type {
            VIRTIO_BLK_T_IN => self.handle_read(sector, data, &mut written),
            VIRTIO_BLK_T_OUT => self.handle_write(sector, data),
            VIRTIO_BLK_T_FLUSH => self.handle_flush(),
            other => {
                eprintln!("[virtio-blk] unsupported request type {other}");
                VIRTIO_BLK_S_UNSUPP
            }
        };

        if self.memory().write(status_elem.addr, &[status]).is_err() {
            eprintln!("[virtio-blk] failed to write status byte");
        }
        written += 1;

        if self.request_count < 10 {
            eprintln!(
                "[virtio-blk] request #{}: type={req_type} sector={sector} status={status} written={written}",
                self.request_count
            );
        }
        written
    }

    fn handle_read(
        &mut self,
        mut sector: u64,
        data: &[crate::virtio::ring::ChainElement],
        written: &mut u32,
    ) -> u8 {
        // Copy the raw pointer out of `self` by value first rather than
        // going through `self.memory()`: that helper's elided `&self ->
        // &GuestMemory` signature would tie the borrow to all of `self` for
        // as long as `memory` is alive, which conflicts with the `&mut
        // self.disk` borrow each loop iteration needs below.
        let memory = unsafe { &*self.memory };
        for elem in data {
            if !elem.write {
                continue;
            }
            let mut buf = vec![0u8; elem.len as usize];
            if let Err(e) = self.disk.read_at(sector, &mut buf) {
                eprintln!("[virtio-blk] read error at sector {sector}: {e}");
                return VIRTIO_BLK_S_IOERR;
            }
            if memory.write(elem.addr, &buf).is_err() {
                eprintln!("[virtio-blk] failed to write to guest memory");
                return VIRTIO_BLK_S_IOERR;
            }
            *written += buf.len() as u32;
            sector += buf.len() as u64 / SECTOR_SIZE;
        }
        VIRTIO_BLK_S_OK
    }

    fn handle_write(&mut self, mut sector: u64, data: &[crate::virtio::ring::ChainElement]) -> u8 {
        let memory = unsafe { &*self.memory };
        for elem in data {
            if elem.write {
                continue;
            }
            let mut buf = vec![0u8; elem.len as usize];
            if memory.read(elem.addr, &mut buf).is_err() {
                eprintln!("[virtio-blk] failed to read from guest memory");
                return VIRTIO_BLK_S_IOERR;
            }
            if let Err(e) = self.disk.write_at(sector, &buf) {
                eprintln!("[virtio-blk] write error at sector {sector}: {e}");
                return VIRTIO_BLK_S_IOERR;
            }
            sector += buf.len() as u64 / SECTOR_SIZE;
        }
        VIRTIO_BLK_S_OK
    }

    fn handle_flush(&mut self) -> u8 {
        match self.disk.flush() {
            Ok(()) => VIRTIO_BLK_S_OK,
            Err(e) => {
                eprintln!("[virtio-blk] flush error: {e}");
                VIRTIO_BLK_S_IOERR
            }
        }
    }
}

impl VirtioDeviceOps for VirtioBlk {
    fn device_id(&self) -> u32 {
        VIRTIO_BLK_DEVICE_ID
    }

    fn num_queues(&self) -> u16 {
        1
    }

    fn device_features(&self) -> u64 {
        VIRTIO_BLK_F_SIZE_MAX
            | VIRTIO_BLK_F_SEG_MAX
            | VIRTIO_BLK_F_BLK_SIZE
            | VIRTIO_BLK_F_FLUSH
            | VIRTIO_F_EVENT_IDX
            | VIRTIO_F_VERSION_1
    }

    fn ack_features(&mut self, features: u64) {
        self.driver_features = features;
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let value: u32 = match offset {
            CONFIG_CAPACITY => (self.capacity & 0xffff_ffff) as u32,
            0x04 => (self.capacity >> 32) as u32,
            CONFIG_SIZE_MAX => SIZE_MAX,
            CONFIG_SEG_MAX => SEG_MAX,
            CONFIG_BLK_SIZE => BLK_SIZE,
            _ => 0,
        };
        let bytes = value.to_le_bytes();
        let len = data.len().min(4);
        data[..len].copy_from_slice(&bytes[..len]);
    }

    fn queue_ready(&mut self, idx: u16, queue: &Virtqueue) -> Result<(), VirtioError> {
        eprintln!(
            "[virtio-blk] queue {idx} ready: desc={:#x} avail={:#x} used={:#x}",
            queue.desc_table, queue.avail_ring, queue.used_ring
        );
        Ok(())
    }

    fn process_queue(&mut self, idx: u16, queue: &mut Virtqueue) -> Result<bool, VirtioError> {
        if idx != 0 {
            return Err(VirtioError::QueueNotReady(idx));
        }

        // `self.memory()`'s elided lifetime would tie the borrow to all of
        // `self` for as long as `memory` stays live, which conflicts with
        // the `&mut self` taken by `self.process_request` each iteration.
        let memory = unsafe { &*self.memory };
        let old_used_idx = queue.last_used_idx;
        queue.event_idx = self.event_idx_negotiated();

        while queue.has_pending(memory) {
            if let Some(head) = queue.pop_avail(memory) {
                let len = self.process_request(head, queue);
                if queue.push_used(memory, head, len).is_err() {
                    eprintln!("[virtio-blk] failed to push used ring entry");
                }
                self.request_count += 1;
            }
        }

        Ok(queue.should_notify(memory, old_used_idx, queue.last_used_idx))
    }
}
