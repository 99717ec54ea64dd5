//! Shared vhost-kernel handshake plumbing for [`super::vsock`] and
//! [`super::scsi`]: both devices only negotiate ownership, memory table and
//! per-ring fds with an in-kernel vhost backend (`/dev/vhost-vsock`,
//! `/dev/vhost-scsi`) and never touch the virtqueues themselves — the
//! kernel's own vhost worker thread drains them directly, which is the
//! entire point of vhost acceleration. Grounded on `virtio/vhost.c`'s
//! `virtio_vhost_init` (owner + memory table) and `virtio/scsi.c`'s
//! per-vring `VHOST_SET_VRING_*` sequence.

use crate::memory::GuestMemory;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use vmm_sys_util::eventfd::EventFd;

const VHOST_VIRTIO: u8 = 0xaf;

const fn iow(nr: u8, size: usize) -> u64 {
    (1u64 << 30) | ((size as u64) << 16) | ((VHOST_VIRTIO as u64) << 8) | nr as u64
}

const fn io(nr: u8) -> u64 {
    ((VHOST_VIRTIO as u64) << 8) | nr as u64
}

const VHOST_SET_OWNER: u64 = io(0x01);
const VHOST_SET_FEATURES: u64 = iow(0x00, 8);
const VHOST_SET_MEM_TABLE_NR: u8 = 0x03;
const VHOST_SET_VRING_NUM: u64 = iow(0x10, std::mem::size_of::<VringState>());
const VHOST_SET_VRING_ADDR: u64 = iow(0x11, std::mem::size_of::<VringAddr>());
const VHOST_SET_VRING_BASE: u64 = iow(0x12, std::mem::size_of::<VringState>());
const VHOST_SET_VRING_KICK: u64 = iow(0x20, std::mem::size_of::<VringFile>());
const VHOST_SET_VRING_CALL: u64 = iow(0x21, std::mem::size_of::<VringFile>());

#[repr(C)]
struct MemoryRegion {
    guest_phys_addr: u64,
    memory_size: u64,
    userspace_addr: u64,
    flags_padding: u64,
}

#[repr(C)]
struct VringState {
    index: u32,
    num: u32,
}

#[repr(C)]
struct VringAddr {
    index: u32,
    flags: u32,
    desc_user_addr: u64,
    used_user_addr: u64,
    avail_user_addr: u64,
    log_guest_addr: u64,
}

#[repr(C)]
struct VringFile {
    index: u32,
    fd: i32,
}

/// An open vhost character device, past `VHOST_SET_OWNER`/`VHOST_SET_MEM_TABLE`.
pub struct VhostBackend {
    file: File,
}

impl VhostBackend {
    pub fn open(path: &str, features: u64, memory: &GuestMemory) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let backend = Self { file };

        backend.ioctl_none(VHOST_SET_OWNER)?;
        backend.ioctl_ref(VHOST_SET_FEATURES, &features)?;
        backend.set_mem_table(memory)?;
        Ok(backend)
    }

    fn set_mem_table(&self, memory: &GuestMemory) -> std::io::Result<()> {
        let (base_gpa, size) = memory.as_raw_parts();
        let region = MemoryRegion {
            guest_phys_addr: base_gpa,
            memory_size: size,
            userspace_addr: memory.host_ptr(base_gpa).map(|p| p as u64).unwrap_or(0),
            flags_padding: 0,
        };

        #[repr(C)]
        struct VhostMemory {
            nregions: u32,
            padding: u32,
            regions: [MemoryRegion; 1],
        }
        let table = VhostMemory {
            nregions: 1,
            padding: 0,
            regions: [region],
        };
        let req = iow(VHOST_SET_MEM_TABLE_NR, std::mem::size_of::<VhostMemory>());
        self.ioctl_ref(req, &table)
    }

    pub fn set_vring(
        &self,
        index: u32,
        num: u32,
        desc: u64,
        avail: u64,
        used: u64,
        base: u32,
        kick: &EventFd,
        call: &EventFd,
    ) -> std::io::Result<()> {
        self.ioctl_ref(VHOST_SET_VRING_NUM, &VringState { index, num })?;
        self.ioctl_ref(
            VHOST_SET_VRING_BASE,
            &VringState { index, num: base },
        )?;
        self.ioctl_ref(
            VHOST_SET_VRING_ADDR,
            &VringAddr {
                index,
                flags: 0,
                desc_user_addr: desc,
                used_user_addr: used,
                avail_user_addr: avail,
                log_guest_addr: 0,
            },
        )?;
        self.ioctl_ref(
            VHOST_SET_VRING_KICK,
            &VringFile {
                index,
                fd: kick.as_raw_fd(),
            },
        )?;
        self.ioctl_ref(
            VHOST_SET_VRING_CALL,
            &VringFile {
                index,
                fd: call.as_raw_fd(),
            },
        )
    }

    /// Issue a backend-specific "set endpoint" ioctl (`VHOST_SCSI_SET_ENDPOINT`,
    /// `VHOST_VSOCK_SET_GUEST_CID`, ...); `nr` is the ioctl number, `value`
    /// the backend's own request struct.
    pub fn set_endpoint<T>(&self, nr: u8, value: &T) -> std::io::Result<()> {
        let req = iow(nr, std::mem::size_of::<T>());
        self.ioctl_ref(req, value)
    }

    fn ioctl_none(&self, req: u64) -> std::io::Result<()> {
        let ret = unsafe { libc::ioctl(self.raw_fd(), req as libc::c_ulong, 0) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn ioctl_ref<T>(&self, req: u64, value: &T) -> std::io::Result<()> {
        let ret = unsafe { libc::ioctl(self.raw_fd(), req as libc::c_ulong, value as *const T) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
