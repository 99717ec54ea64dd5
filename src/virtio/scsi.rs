//! virtio-scsi device engine, grounded on `virtio/scsi.c`'s vhost-scsi path
//! (`kvm_scsi__init` / the `VHOST_SCSI_SET_ENDPOINT` sequence) and
//! `include/kvm/virtio-scsi.h`'s config layout. Command processing is
//! delegated entirely to the in-kernel vhost-scsi target once the
//! handshake completes: this engine negotiates features/config over the
//! transport like any other virtio device, then hands the rings to the
//! kernel and never walks them itself.

use crate::memory::GuestMemory;
use crate::virtio::device::{VirtioDeviceOps, VirtioError};
use crate::virtio::ring::Virtqueue;
use crate::virtio::vhost_backend::VhostBackend;
use std::os::unix::io::RawFd;
use vmm_sys_util::eventfd::EventFd;

const VIRTIO_SCSI_DEVICE_ID: u32 = 8;
const VIRTIO_SCSI_F_HOTPLUG: u64 = 1 << 0;

const VHOST_SCSI_PATH: &str = "/dev/vhost-scsi";

#[repr(C)]
struct VhostScsiTarget {
    abi_version: u32,
    vhost_wwpn: [u8; 224],
    vhost_tpgt: u16,
    reserved: u16,
}

const VHOST_SCSI_SET_ENDPOINT_NR: u8 = 0x40;

pub struct VirtioScsi {
    memory: *const GuestMemory,
    backend: Option<VhostBackend>,
    wwpn: String,
    num_queues: u16,
    max_sectors: u32,
    max_lun: u32,
}

unsafe impl Send for VirtioScsi {}

impl VirtioScsi {
    /// `wwpn` names the vhost-scsi target previously configured under
    /// `/sys/kernel/config/target/vhost` (target setup itself is out of
    /// scope here, same as the handshake-only split in `virtio/scsi.c`).
    /// # Safety
    /// `memory` must outlive this device.
    pub fn new(memory: &GuestMemory, wwpn: String, num_queues: u16) -> Self {
        Self {
            memory: memory as *const GuestMemory,
            backend: None,
            wwpn,
            num_queues: num_queues.max(1),
            max_sectors: 0xffff,
            max_lun: 16383,
        }
    }

    fn memory(&self) -> &GuestMemory {
        unsafe { &*self.memory }
    }

    fn set_endpoint(&self, backend: &VhostBackend) -> std::io::Result<()> {
        let mut wwpn = [0u8; 224];
        let bytes = self.wwpn.as_bytes();
        let len = bytes.len().min(wwpn.len() - 1);
        wwpn[..len].copy_from_slice(&bytes[..len]);
        let target = VhostScsiTarget {
            abi_version: 1,
            vhost_wwpn: wwpn,
            vhost_tpgt: 0,
            reserved: 0,
        };
        backend.set_endpoint(VHOST_SCSI_SET_ENDPOINT_NR, &target)
    }
}

impl VirtioDeviceOps for VirtioScsi {
    fn device_id(&self) -> u32 {
        VIRTIO_SCSI_DEVICE_ID
    }

    fn num_queues(&self) -> u16 {
        // control + event + N request queues, mirroring virtio-scsi.h.
        self.num_queues + 2
    }

    fn device_features(&self) -> u64 {
        VIRTIO_SCSI_F_HOTPLUG
    }

    fn ack_features(&mut self, _features: u64) {}

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let mut config = [0u8; 24];
        config[0..4].copy_from_slice(&(self.num_queues as u32).to_le_bytes());
        config[4..8].copy_from_slice(&self.max_sectors.to_le_bytes());
        config[8..12].copy_from_slice(&128u32.to_le_bytes()); // cmd_per_lun
        config[12..16].copy_from_slice(&(65536u32).to_le_bytes()); // event_info_size
        config[16..20].copy_from_slice(&96u32.to_le_bytes()); // sense_size
        config[20..24].copy_from_slice(&self.max_lun.to_le_bytes());
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
            let backend = VhostBackend::open(VHOST_SCSI_PATH, self.device_features(), memory)
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

        if idx == self.num_queues() - 1 {
            self.set_endpoint(backend).map_err(VirtioError::Io)?;
        }
        Ok(())
    }

    /// No-op: the kernel's vhost-scsi worker thread drains these rings
    /// directly, without a userspace round-trip through this method.
    fn process_queue(&mut self, _idx: u16, _queue: &mut Virtqueue) -> Result<bool, VirtioError> {
        Ok(false)
    }
}
