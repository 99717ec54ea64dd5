//! virtio-console device engine: a single hvc0 port backed by the host's
//! stdin/stdout, grounded on `virtio/console.c`'s `con_dev` (its
//! RX-queue/TX-queue split, one thread-pool job per queue, carries over
//! directly — TX drains eagerly on notify since "the current Linux
//! implementation polls for the buffer to be used, rather than waiting for
//! an interrupt", RX is host-driven same as virtio-net).

use crate::memory::GuestMemory;
use crate::virtio::device::{VirtioDeviceOps, VirtioError};
use crate::virtio::ring::Virtqueue;
use std::io::{Read, Write};

const VIRTIO_CONSOLE_DEVICE_ID: u32 = 3;
const RX_QUEUE: u16 = 0;
const TX_QUEUE: u16 = 1;

pub struct VirtioConsole {
    memory: *const GuestMemory,
}

unsafe impl Send for VirtioConsole {}

impl VirtioConsole {
    /// # Safety
    /// `memory` must outlive this device.
    pub fn new(memory: &GuestMemory) -> Self {
        Self {
            memory: memory as *const GuestMemory,
        }
    }

    fn memory(&self) -> &GuestMemory {
        unsafe { &*self.memory }
    }

    fn drain_tx(&self, queue: &mut Virtqueue) -> u32 {
        let memory = self.memory();
        let mut processed = 0;
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        while queue.has_pending(memory) {
            let Some(head) = queue.pop_avail(memory) else {
                break;
            };
            let Some(chain) = queue.read_chain(memory, head) else {
                continue;
            };
            let mut len = 0u32;
            for elem in &chain {
                if elem.write {
                    continue;
                }
                let mut buf = vec![0u8; elem.len as usize];
                if memory.read(elem.addr, &mut buf).is_err() {
                    continue;
                }
                let _ = out.write_all(&buf);
                len += buf.len() as u32;
            }
            let _ = out.flush();
            if queue.push_used(memory, head, len).is_err() {
                eprintln!("[virtio-console] failed to push tx used entry");
            }
            processed += 1;
        }
        processed
    }

    /// Pull whatever is waiting on stdin into the next available RX
    /// descriptor. Returns `true` if a buffer was filled.
    pub fn poll_rx(&self, queue: &mut Virtqueue) -> bool {
        let memory = self.memory();
        if !queue.has_pending(memory) {
            return false;
        }
        let Some(head) = queue.pop_avail(memory) else {
            return false;
        };
        let Some(chain) = queue.read_chain(memory, head) else {
            return false;
        };
        let Some(elem) = chain.iter().find(|e| e.write) else {
            return false;
        };

        let mut buf = vec![0u8; elem.len as usize];
        let n = match std::io::stdin().lock().read(&mut buf) {
            Ok(n) if n > 0 => n,
            _ => return false,
        };
        if memory.write(elem.addr, &buf[..n]).is_err() {
            return false;
        }
        let _ = queue.push_used(memory, head, n as u32);
        true
    }
}

impl VirtioDeviceOps for VirtioConsole {
    fn device_id(&self) -> u32 {
        VIRTIO_CONSOLE_DEVICE_ID
    }

    fn num_queues(&self) -> u16 {
        2
    }

    fn device_features(&self) -> u64 {
        0
    }

    fn ack_features(&mut self, _features: u64) {}

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        // cols(u16), rows(u16), max_nr_ports(u32); a single 80x24 port.
        let config: [u8; 8] = [80, 0, 24, 0, 1, 0, 0, 0];
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
            TX_QUEUE => Ok(self.drain_tx(queue) > 0),
            RX_QUEUE => Ok(false),
            other => Err(VirtioError::QueueNotReady(other)),
        }
    }
}
