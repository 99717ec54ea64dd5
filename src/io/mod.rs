//! Guest-visible I/O dispatch: the flat PIO table and the MMIO interval
//! tree (spec §2.4/§2.5).

pub mod mmio;
pub mod pio;

pub use mmio::{MmioBus, MmioDevice, MmioError};
pub use pio::{IoData, PioBus, PioDevice, PioError, MAX_IO_SIZE};
