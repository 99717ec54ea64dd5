//! ioeventfd doorbells: kernel-consumed virtqueue "kick" notifications.
//!
//! A virtio device registers one `EventFd` per queue with KVM
//! (`register_ioeventfd`, spec §4.9). From then on, a guest write to that
//! queue's notify register never causes a VM exit — KVM itself increments
//! the eventfd and returns control to the guest. The only remaining job for
//! userspace is to notice the eventfd became readable and process the ring;
//! that's what [`IoeventfdPoller`] does, epoll-driven in the style of
//! `EpollContext` (one registration per fd, `EPOLLIN` edge, read-to-drain
//! before re-servicing — the non-blocking contract `epoll::wait` demands).

use crate::kvm::{KvmError, VmFd};
use kvm_ioctls::IoEventAddress;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

#[derive(Error, Debug)]
pub enum IoeventfdError {
    #[error("failed to create eventfd: {0}")]
    Create(#[source] io::Error),

    #[error(transparent)]
    Kvm(#[from] KvmError),

    #[error("epoll error: {0}")]
    Epoll(#[source] io::Error),
}

/// One doorbell bound to a guest-visible address (PIO port or MMIO byte
/// offset within a device's BAR/window).
pub struct Ioeventfd {
    fd: EventFd,
    addr: IoEventAddress,
}

impl Ioeventfd {
    pub fn register(vm: &VmFd, addr: IoEventAddress) -> Result<Self, IoeventfdError> {
        let fd = EventFd::new(0).map_err(IoeventfdError::Create)?;
        vm.register_ioeventfd(&fd, addr, None)?;
        Ok(Self { fd, addr })
    }

    pub fn unregister(&self, vm: &VmFd) -> Result<(), IoeventfdError> {
        vm.unregister_ioeventfd(&self.fd, self.addr)?;
        Ok(())
    }

    /// Clear the counter after servicing a kick; `EventFd::read` blocks if
    /// the count is already zero, so callers should only invoke this after
    /// `epoll` reports the fd readable.
    pub fn drain(&self) -> Result<u64, io::Error> {
        self.fd.read()
    }
}

impl AsRawFd for Ioeventfd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A single callback invoked whenever its doorbell fires.
type Callback = Box<dyn Fn() + Send + Sync>;

struct Registration {
    doorbell: Arc<Ioeventfd>,
    callback: Callback,
}

/// Epoll loop that turns doorbell fd readiness into queue-processing calls.
/// One instance typically backs every virtqueue kick in the VMM; devices
/// register through [`IoeventfdPoller::add`] and the loop runs on its own
/// thread via [`IoeventfdPoller::spawn`].
pub struct IoeventfdPoller {
    epoll_fd: RawFd,
    registrations: Vec<Registration>,
}

impl IoeventfdPoller {
    pub fn new() -> Result<Self, IoeventfdError> {
        let epoll_fd = epoll::create(true).map_err(IoeventfdError::Epoll)?;
        Ok(Self {
            epoll_fd,
            registrations: Vec::new(),
        })
    }

    /// Register a doorbell; `token` must be a dense index assigned by the
    /// caller (used to recover which registration fired from epoll's `u64`
    /// event data).
    pub fn add(
        &mut self,
        doorbell: Arc<Ioeventfd>,
        token: u64,
        callback: Callback,
    ) -> Result<(), IoeventfdError> {
        epoll::ctl(
            self.epoll_fd,
            epoll::ControlOptions::EPOLL_CTL_ADD,
            doorbell.as_raw_fd(),
            epoll::Event::new(epoll::Events::EPOLLIN, token),
        )
        .map_err(IoeventfdError::Epoll)?;
        self.registrations.push(Registration { doorbell, callback });
        Ok(())
    }

    /// Block until at least one doorbell fires, drain it, and invoke its
    /// callback. Intended to run in a loop on a dedicated thread.
    pub fn poll_once(&self) -> Result<(), IoeventfdError> {
        let mut events = vec![epoll::Event::new(epoll::Events::empty(), 0); 16];
        let n = epoll::wait(self.epoll_fd, -1, &mut events).map_err(IoeventfdError::Epoll)?;
        for event in &events[..n] {
            let token = event.data as usize;
            if let Some(reg) = self.registrations.get(token) {
                reg.doorbell.drain().ok();
                (reg.callback)();
            }
        }
        Ok(())
    }
}

impl AsRawFd for IoeventfdPoller {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll_fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn poll_once_invokes_callback_on_write() {
        let mut poller = IoeventfdPoller::new().unwrap();
        let fd = EventFd::new(0).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();

        // Register the raw EventFd directly (bypassing KVM, which isn't
        // available in a unit test) to exercise the epoll plumbing alone.
        epoll::ctl(
            poller.epoll_fd,
            epoll::ControlOptions::EPOLL_CTL_ADD,
            fd.as_raw_fd(),
            epoll::Event::new(epoll::Events::EPOLLIN, 0),
        )
        .unwrap();
        poller.registrations.push(Registration {
            doorbell: Arc::new(Ioeventfd {
                fd: fd.try_clone().unwrap(),
                addr: IoEventAddress::Pio(0),
            }),
            callback: Box::new(move || {
                counter2.fetch_add(1, Ordering::SeqCst);
            }),
        });

        fd.write(1).unwrap();
        poller.poll_once().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
