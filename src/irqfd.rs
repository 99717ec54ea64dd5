//! irqfd: kernel-side interrupt injection without a VMM round-trip.
//!
//! The mirror image of [`crate::ioeventfd`]: instead of the guest kicking
//! the host, the host kicks the guest. A device thread finishes processing
//! a virtqueue and writes to an `Irqfd`'s eventfd; KVM notices and injects
//! the bound GSI into the guest directly, with no vCPU exit and no
//! userspace wakeup required on the guest side.

use crate::kvm::{KvmError, VmFd};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

#[derive(Error, Debug)]
pub enum IrqfdError {
    #[error("failed to create eventfd: {0}")]
    Create(#[source] io::Error),

    #[error(transparent)]
    Kvm(#[from] KvmError),
}

/// One GSI's doorbell: writing to it raises the bound interrupt.
pub struct Irqfd {
    fd: EventFd,
    gsi: u32,
}

impl Irqfd {
    pub fn register(vm: &VmFd, gsi: u32) -> Result<Self, IrqfdError> {
        let fd = EventFd::new(0).map_err(IrqfdError::Create)?;
        vm.register_irqfd(&fd, gsi)?;
        Ok(Self { fd, gsi })
    }

    pub fn unregister(&self, vm: &VmFd) -> Result<(), IrqfdError> {
        vm.unregister_irqfd(&self.fd, self.gsi)?;
        Ok(())
    }

    /// Raise the bound interrupt. Any nonzero value works; the count isn't
    /// otherwise meaningful to KVM's irqfd consumer.
    pub fn trigger(&self) -> Result<(), io::Error> {
        self.fd.write(1)
    }

    pub fn gsi(&self) -> u32 {
        self.gsi
    }
}

impl AsRawFd for Irqfd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
