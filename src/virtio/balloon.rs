//! virtio-balloon device engine: inflate/deflate/stats queues, grounded on
//! `virtio/balloon.c`'s `bln_dev`. Inflating hands pages back to the host
//! with `MADV_DONTNEED`; deflating just decrements the accounting counter,
//! since the guest is free to touch those pages again and fault them back
//! in. The stats queue is accepted (so the driver's feature negotiation
//! doesn't stall) but its payload is not surfaced anywhere yet.

use crate::memory::GuestMemory;
use crate::virtio::device::{VirtioDeviceOps, VirtioError};
use crate::virtio::ring::Virtqueue;

const VIRTIO_BALLOON_DEVICE_ID: u32 = 5;
const INFLATE_QUEUE: u16 = 0;
const DEFLATE_QUEUE: u16 = 1;
const STATS_QUEUE: u16 = 2;

const VIRTIO_BALLOON_F_STATS_VQ: u64 = 1 << 1;
const VIRTIO_BALLOON_PFN_SHIFT: u32 = 12;

pub struct VirtioBalloon {
    memory: *const GuestMemory,
    num_pages: u32,
    actual: u32,
}

unsafe impl Send for VirtioBalloon {}

impl VirtioBalloon {
    /// # Safety
    /// `memory` must outlive this device.
    pub fn new(memory: &GuestMemory) -> Self {
        Self {
            memory: memory as *const GuestMemory,
            num_pages: 0,
            actual: 0,
        }
    }

    /// Request the guest balloon to a target page count by writing
    /// `num_pages` into config space; the driver notices on its own poll
    /// and starts pushing PFNs into the inflate/deflate queues.
    pub fn set_target_pages(&mut self, pages: u32) {
        self.num_pages = pages;
    }

    fn handle_pfns(&mut self, queue: &mut Virtqueue, inflate: bool) -> u32 {
        // `self.actual += 1` below mutates a field directly, so take the
        // pointer itself rather than going through a `&self` method.
        let memory = unsafe { &*self.memory };
        let mut processed = 0;
        while queue.has_pending(memory) {
            let Some(head) = queue.pop_avail(memory) else {
                break;
            };
            let Some(chain) = queue.read_chain(memory, head) else {
                continue;
            };
            let mut count = 0u32;
            for elem in &chain {
                if elem.write {
                    continue;
                }
                let n = elem.len as usize / 4;
                let mut buf = vec![0u8; n * 4];
                if memory.read(elem.addr, &mut buf).is_err() {
                    continue;
                }
                for i in 0..n {
                    let pfn = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
                    let guest_addr = (pfn as u64) << VIRTIO_BALLOON_PFN_SHIFT;
                    if inflate {
                        if let Ok(host_ptr) = memory.host_ptr(guest_addr) {
                            unsafe {
                                libc::madvise(
                                    host_ptr as *mut libc::c_void,
                                    1 << VIRTIO_BALLOON_PFN_SHIFT,
                                    libc::MADV_DONTNEED,
                                )
                            };
                        }
                        self.actual += 1;
                    } else {
                        self.actual = self.actual.saturating_sub(1);
                    }
                    count += 1;
                }
            }
            if queue.push_used(memory, head, count).is_err() {
                eprintln!("[virtio-balloon] failed to push used entry");
            }
            processed += 1;
        }
        processed
    }
}

impl VirtioDeviceOps for VirtioBalloon {
    fn device_id(&self) -> u32 {
        VIRTIO_BALLOON_DEVICE_ID
    }

    fn num_queues(&self) -> u16 {
        3
    }

    fn device_features(&self) -> u64 {
        VIRTIO_BALLOON_F_STATS_VQ
    }

    fn ack_features(&mut self, _features: u64) {}

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let config: [u8; 8] = {
            let mut c = [0u8; 8];
            c[0..4].copy_from_slice(&self.num_pages.to_le_bytes());
            c[4..8].copy_from_slice(&self.actual.to_le_bytes());
            c
        };
        if (offset as usize) < config.len() {
            let start = offset as usize;
            let len = data.len().min(config.len() - start);
            data[..len].copy_from_slice(&config[start..start + len]);
        } else {
            data.fill(0);
        }
    }

    fn queue_ready(&mut self, _idx: u16, _queue: &Virtqueue) -> Result<(), VirtioError> {
        Ok(())
    }

    fn process_queue(&mut self, idx: u16, queue: &mut Virtqueue) -> Result<bool, VirtioError> {
        match idx {
            INFLATE_QUEUE => Ok(self.handle_pfns(queue, true) > 0),
            DEFLATE_QUEUE => Ok(self.handle_pfns(queue, false) > 0),
            STATS_QUEUE => {
                // Drain and discard: acking keeps the driver from stalling
                // on a full stats queue, even though we don't consume the
                // payload yet.
                let memory = unsafe { &*self.memory };
                let mut drained = false;
                while queue.has_pending(memory) {
                    let Some(head) = queue.pop_avail(memory) else { break };
                    let _ = queue.push_used(memory, head, 0);
                    drained = true;
                }
                Ok(drained)
            }
            other => Err(VirtioError::QueueNotReady(other)),
        }
    }
}
