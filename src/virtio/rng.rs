//! virtio-rng device engine: fills guest-writable buffers from the host's
//! `/dev/urandom`, mirroring `virtio/rng.c`'s single-queue, fd-backed
//! `rng_dev`.

use crate::memory::GuestMemory;
use crate::virtio::device::{VirtioDeviceOps, VirtioError};
use crate::virtio::ring::Virtqueue;
use std::fs::File;
use std::io::Read;

const VIRTIO_RNG_DEVICE_ID: u32 = 4;

pub struct VirtioRng {
    source: File,
    memory: *const GuestMemory,
}

unsafe impl Send for VirtioRng {}

impl VirtioRng {
    /// # Safety
    /// `memory` must outlive this device.
    pub fn new(memory: &GuestMemory) -> std::io::Result<Self> {
        Ok(Self {
            source: File::open("/dev/urandom")?,
            memory: memory as *const GuestMemory,
        })
    }

}

impl VirtioDeviceOps for VirtioRng {
    fn device_id(&self) -> u32 {
        VIRTIO_RNG_DEVICE_ID
    }

    fn num_queues(&self) -> u16 {
        1
    }

    fn device_features(&self) -> u64 {
        0
    }

    fn ack_features(&mut self, _features: u64) {}

    fn read_config(&self, _offset: u64, data: &mut [u8]) {
        data.fill(0);
    }

    fn queue_ready(&mut self, _idx: u16, _queue: &Virtqueue) -> Result<(), VirtioError> {
        Ok(())
    }

    fn process_queue(&mut self, idx: u16, queue: &mut Virtqueue) -> Result<bool, VirtioError> {
        if idx != 0 {
            return Err(VirtioError::QueueNotReady(idx));
        }
        // `self.source.read_exact` below needs `&mut self`, so take the
        // memory pointer directly rather than through a `&self` method.
        let memory = unsafe { &*self.memory };
        let mut processed = false;
        while queue.has_pending(memory) {
            let Some(head) = queue.pop_avail(memory) else {
                break;
            };
            let Some(chain) = queue.read_chain(memory, head) else {
                continue;
            };
            let mut total = 0u32;
            for elem in &chain {
                if !elem.write {
                    continue;
                }
                let mut buf = vec![0u8; elem.len as usize];
                if self.source.read_exact(&mut buf).is_err() {
                    eprintln!("[virtio-rng] failed to read from /dev/urandom");
                    continue;
                }
                if memory.write(elem.addr, &buf).is_err() {
                    continue;
                }
                total += buf.len() as u32;
            }
            if queue.push_used(memory, head, total).is_err() {
                eprintln!("[virtio-rng] failed to push used entry");
            }
            processed = true;
        }
        Ok(processed)
    }
}
