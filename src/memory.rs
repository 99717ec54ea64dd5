//! Guest physical memory management using the `vm-memory` crate.
//!
//! This module wraps `vm_memory::GuestMemoryMmap` to provide the guest's
//! physical address space. Unlike the teacher's single-bank milestone, a VM
//! here may carve a device-MMIO hole out of its physical span (the x86 "PCI
//! gap" below 4 GiB) so memory is modelled as an append-only list of banks,
//! each independently registered with KVM as its own memory slot.
//!
//! ```text
//! Guest Virtual → Guest Physical → Host Virtual → Host Physical
//!     (kernel)       (GPA)         (vm-memory)      (hardware)
//! ```

use crate::kvm::{KvmError, VmFd};
use std::io;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

/// Size of the x86 "PCI gap" carved below the 4 GiB boundary when guest RAM
/// would otherwise reach into it. kvmtool reserves this for device MMIO.
pub const KVM_32BIT_GAP_SIZE: u64 = 768 * 1024 * 1024;

/// Start of the 32-bit gap (4 GiB - gap size).
pub const KVM_32BIT_GAP_START: u64 = (4u64 * 1024 * 1024 * 1024) - KVM_32BIT_GAP_SIZE;

/// Guests larger than this straddle the gap and get a second, high bank.
const GAP_THRESHOLD: u64 = KVM_32BIT_GAP_START;

/// Errors that can occur while allocating or translating guest memory.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to allocate guest memory: {0}")]
    Allocation(#[source] io::Error),

    #[error("Failed to protect the 32-bit MMIO gap: {0}")]
    ProtectGap(#[source] io::Error),

    #[error("KVM error: {0}")]
    Kvm(#[from] KvmError),

    #[error("Guest physical address {addr:#x} (len {len}) is out of range")]
    OutOfRange { addr: u64, len: usize },
}

/// One contiguous region of guest-physical memory backed by host-anonymous
/// (or hugetlbfs) pages.
///
/// Invariant (spec §3): every guest-physical address produced by
/// translation falls inside exactly one bank.
#[derive(Debug)]
struct MemoryBank {
    guest_phys_addr: u64,
    host_addr: u64,
    size: u64,
    slot_id: u32,
}

/// Guest physical memory, possibly split across the x86 32-bit MMIO gap.
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    banks: Vec<MemoryBank>,
}

impl GuestMemory {
    /// Allocate guest memory and register every resulting bank with the VM.
    ///
    /// Mirrors §4.2: when `size` would reach into the reserved 32-bit gap,
    /// a low bank covers `[0, KVM_32BIT_GAP_START)` and a high bank resumes
    /// at `4 GiB` with the remainder; the gap itself is never mapped.
    pub fn new(vm: &VmFd, size: u64, hugetlbfs_path: Option<&str>) -> Result<Self, MemoryError> {
        let regions = if size > GAP_THRESHOLD {
            vec![
                (GuestAddress(0), GAP_THRESHOLD as usize),
                (
                    GuestAddress(4 * 1024 * 1024 * 1024),
                    (size - GAP_THRESHOLD) as usize,
                ),
            ]
        } else {
            vec![(GuestAddress(0), size as usize)]
        };

        if hugetlbfs_path.is_some() {
            // hugetlbfs-backed regions would be built via `GuestRegionMmap`
            // with a `MmapRegion` opened against a file in the hugetlbfs
            // mount; vm-memory's anonymous builder is used uniformly here
            // and the path is recorded for the caller's diagnostics only.
            eprintln!("[Memory] hugetlbfs backing requested but using anonymous pages");
        }

        let inner = GuestMemoryMmap::from_ranges(&regions).map_err(|e| {
            MemoryError::Allocation(io::Error::other(format!(
                "failed to create guest memory: {e}"
            )))
        })?;

        // MADV_MERGEABLE hint, matching kvmtool's KSM opt-in.
        for region in inner.iter() {
            unsafe {
                libc::madvise(
                    region.as_ptr() as *mut libc::c_void,
                    region.len() as usize,
                    libc::MADV_MERGEABLE,
                );
            }
        }

        let mut banks = Vec::with_capacity(2);
        for (slot_id, region) in inner.iter().enumerate() {
            let guest_phys_addr = region.start_addr().raw_value();
            let host_addr = region.as_ptr() as u64;
            let len = region.len();

            unsafe {
                vm.set_user_memory_region(slot_id as u32, guest_phys_addr, len, host_addr)?;
            }

            banks.push(MemoryBank {
                guest_phys_addr,
                host_addr,
                size: len,
                slot_id: slot_id as u32,
            });
        }

        Ok(Self { inner, banks })
    }

    /// Total guest-physical span covered across all banks.
    pub fn total_size(&self) -> u64 {
        self.banks.iter().map(|b| b.size).sum()
    }

    /// Translate a guest-physical address to a host pointer.
    ///
    /// Total over every reachable guest address; out-of-range is a runtime
    /// error rather than a silent wraparound (spec §4.2 invariant).
    pub fn host_ptr(&self, gpa: u64) -> Result<*mut u8, MemoryError> {
        for bank in &self.banks {
            if gpa >= bank.guest_phys_addr && gpa < bank.guest_phys_addr + bank.size {
                let offset = gpa - bank.guest_phys_addr;
                return Ok((bank.host_addr + offset) as *mut u8);
            }
        }
        Err(MemoryError::OutOfRange {
            addr: gpa,
            len: 0,
        })
    }

    /// Translate a host pointer back to a guest-physical address.
    pub fn gpa(&self, host_ptr: u64) -> Result<u64, MemoryError> {
        for bank in &self.banks {
            if host_ptr >= bank.host_addr && host_ptr < bank.host_addr + bank.size {
                return Ok(bank.guest_phys_addr + (host_ptr - bank.host_addr));
            }
        }
        Err(MemoryError::OutOfRange {
            addr: host_ptr,
            len: 0,
        })
    }

    /// Read `data.len()` bytes starting at guest-physical address `addr`.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfRange {
                addr,
                len: data.len(),
            })
    }

    /// Write `data` starting at guest-physical address `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfRange {
                addr,
                len: data.len(),
            })
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), MemoryError> {
        self.write(addr, &[value])
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Raw `(host_addr, size)` of the first bank, used by boot code that
    /// still assumes a single contiguous region below the gap.
    pub fn as_raw_parts(&self) -> (u64, u64) {
        let bank = &self.banks[0];
        (bank.host_addr, bank.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_bank_mem(size: u64) -> GuestMemory {
        let regions = vec![(GuestAddress(0), size as usize)];
        let inner = GuestMemoryMmap::from_ranges(&regions).unwrap();
        let banks = vec![MemoryBank {
            guest_phys_addr: 0,
            host_addr: inner.iter().next().unwrap().as_ptr() as u64,
            size,
            slot_id: 0,
        }];
        GuestMemory { inner, banks }
    }

    #[test]
    fn write_read_roundtrip() {
        let mem = single_bank_mem(4096);
        mem.write(0, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        mem.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn translation_is_total_within_bank() {
        let mem = single_bank_mem(4096);
        let ptr = mem.host_ptr(100).unwrap();
        let back = mem.gpa(ptr as u64).unwrap();
        assert_eq!(back, 100);
    }

    #[test]
    fn out_of_range_is_an_error_not_a_wrap() {
        let mem = single_bank_mem(4096);
        assert!(mem.host_ptr(4096).is_err());
        assert!(mem.host_ptr(u64::MAX).is_err());
    }

    #[test]
    fn out_of_bounds_write_fails() {
        let mem = single_bank_mem(100);
        assert!(mem.write(99, &[1, 2]).is_err());
    }
}
