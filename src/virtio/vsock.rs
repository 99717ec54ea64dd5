//! virtio-vsock device engine: a handshake-only vhost-vsock device, the
//! same split as [`super::scsi`] but simpler — vhost-vsock only needs the
//! guest's context id before it starts accepting connections, no
//! target/endpoint descriptor.

use crate::memory::GuestMemory;
use crate::virtio::device::{VirtioDeviceOps, VirtioError};
use crate::virtio::ring::Virtqueue;
use crate::virtio::vhost_backend::VhostBackend;
use vmm_sys_util::eventfd::EventFd;

const VIRTIO_ID_VSOCK: u32 = 19;
const VHOST_VSOCK_PATH: &str = "/dev/vhost-vsock";
const VHOST_VSOCK_SET_GUEST_CID_NR: u8 = 0x60;
const VHOST_VSOCK_SET_RUNNING_NR: u8 = 0x61;

const RX_QUEUE: u16 = 0;
const TX_QUEUE: u16 = 1;
const EVENT_QUEUE: u16 = 2;

pub struct VirtioVsock {
    memory: *const GuestMemory,
    backend: Option<VhostBackend>,
    guest_cid: u64,
}

unsafe impl Send for VirtioVsock {}

impl VirtioVsock {
    /// # Safety
    /// `memory` must outlive this device.
    pub fn new(memory: &GuestMemory, guest_cid: u64) -> Self {
        Self {
            memory: memory as *const GuestMemory,
            backend: None,
            guest_cid,
        }
    }

    fn memory(&self) -> &GuestMemory {
        unsafe { &*self.memory }
    }
}

impl VirtioDeviceOps for VirtioVsock {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_VSOCK
    }

    fn num_queues(&self) -> u16 {
        3
    }

    fn device_features(&self) -> u64 {
        0
    }

    fn ack_features(&mut self, _features: u64) {}

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let config = self.guest_cid.to_le_bytes();
        if (offset as usize) < config.len() {
            let start = offset as usize;
            let len = data.len().min(config.len() - start);
            data[..len].copy_from_slice(&config[start..start + len]);
        } else {
            data.fill(0);
        }
    }

    fn queue_ready(&mut self, idx: u16, queue: &Virtqueue) -> Result<(), VirtioError> {
        let memory = self.memory();
        if self.backend.is_none() {
            let backend = VhostBackend::open(VHOST_VSOCK_PATH, self.device_features(), memory)
                .map_err(VirtioError::Io)?;
            backend
                .set_endpoint(VHOST_VSOCK_SET_GUEST_CID_NR, &self.guest_cid)
                .map_err(VirtioError::Io)?;
            self.backend = Some(backend);
        }
        let backend = self.backend.as_ref().unwrap();

        let (desc, avail, used) = queue.ring_addresses();
        let kick = EventFd::new(0).map_err(VirtioError::Io)?;
        let call = EventFd::new(0).map_err(VirtioError::Io)?;
        backend
            .set_vring(idx as u32, queue.size as u32, desc, avail, used, 0, &kick, &call)
            .map_err(VirtioError::Io)?;

        if idx == EVENT_QUEUE {
            let running: i32 = 1;
            backend
                .set_endpoint(VHOST_VSOCK_SET_RUNNING_NR, &running)
                .map_err(VirtioError::Io)?;
        }
        Ok(())
    }

    /// No-op: vhost-vsock's in-kernel worker owns the rx/tx/event rings.
    fn process_queue(&mut self, idx: u16, _queue: &mut Virtqueue) -> Result<bool, VirtioError> {
        match idx {
            RX_QUEUE | TX_QUEUE | EVENT_QUEUE => Ok(false),
            other => Err(VirtioError::QueueNotReady(other)),
        }
    }
}
