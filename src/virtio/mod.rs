//! Virtio core: the ring format, the device-status state machine, the
//! transport-agnostic device trait, and the three transports and device
//! engines built on top of them.

pub mod balloon;
pub mod block;
pub mod console;
pub mod device;
pub mod net;
pub mod ninep;
pub mod rng;
pub mod ring;
pub mod scsi;
pub mod transport;
mod vhost_backend;
pub mod vsock;

pub use device::{VirtioDeviceOps, VirtioError};
pub use ring::{ChainElement, VirtqDesc, Virtqueue};
