//! Device emulation for the VMM.

mod cmos;
mod serial;

pub use cmos::{Cmos, CMOS_PORT_DATA, CMOS_PORT_INDEX};
pub use serial::Serial;
