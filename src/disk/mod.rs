//! Disk image backends: raw sector I/O and the QCOW1/QCOW2 sparse formats
//! (spec §4.14/§4.15), behind one polymorphic `DiskImage` trait so the
//! block device engine (`virtio::block`) never needs to know which backing
//! format it's talking to.

pub mod qcow;
pub mod raw;

use std::path::Path;
use thiserror::Error;

pub const SECTOR_SIZE: u64 = 512;

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("i/o error: {0}")]
    Io(#[source] std::io::Error),

    #[error("malformed qcow header: {0}")]
    MalformedHeader(String),

    #[error("sector {sector} out of range (disk has {total} sectors)")]
    OutOfRange { sector: u64, total: u64 },

    #[error("disk is read-only")]
    ReadOnly,
}

impl From<std::io::Error> for DiskError {
    fn from(e: std::io::Error) -> Self {
        DiskError::Io(e)
    }
}

/// Backing format a disk image implements, dispatched on by positional
/// sector I/O rather than a byte-stream `Read`/`Write`, since every caller
/// (virtio-blk) already works in whole sectors.
pub trait DiskImage: Send {
    /// Read `buf.len()` bytes starting at `sector`. Returns the number of
    /// bytes actually read (normally `buf.len()`, short only at EOF).
    fn read_at(&mut self, sector: u64, buf: &mut [u8]) -> Result<usize, DiskError>;

    /// Write `buf` starting at `sector`. QCOW2 images are mounted
    /// read-only (spec §4.15); writing one returns `DiskError::ReadOnly`.
    fn write_at(&mut self, sector: u64, buf: &[u8]) -> Result<usize, DiskError>;

    fn flush(&mut self) -> Result<(), DiskError>;

    /// Total capacity in 512-byte sectors, reported as virtio-blk's
    /// `capacity` config field.
    fn num_sectors(&self) -> u64;

    fn read_only(&self) -> bool;
}

/// Open `path`, probing for a QCOW magic before falling back to a raw
/// image — the same sniff-then-dispatch `*_probe` chain `disk-image.c`
/// runs over its backend list.
pub fn open(path: &Path, readonly: bool) -> Result<Box<dyn DiskImage>, DiskError> {
    if let Some(qcow) = qcow::QcowImage::probe(path, readonly)? {
        return Ok(Box::new(qcow));
    }
    Ok(Box::new(raw::RawImage::open(path, readonly)?))
}
