//! Raw disk image: sectors map 1:1 onto file offsets. Grounded on
//! `disk-image.c`'s `raw_image_ops`, using positional `pread`/`pwrite` so
//! the block device's worker threads never need a shared file-offset
//! cursor (spec §9, "Disk image is shared between worker threads").

use super::{DiskError, DiskImage, SECTOR_SIZE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

pub struct RawImage {
    file: File,
    num_sectors: u64,
    readonly: bool,
}

impl RawImage {
    pub fn open(path: &Path, readonly: bool) -> Result<Self, DiskError> {
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            num_sectors: len / SECTOR_SIZE,
            readonly,
        })
    }
}

impl DiskImage for RawImage {
    fn read_at(&mut self, sector: u64, buf: &mut [u8]) -> Result<usize, DiskError> {
        let offset = sector * SECTOR_SIZE;
        self.file.read_at(buf, offset)?;
        Ok(buf.len())
    }

    fn write_at(&mut self, sector: u64, buf: &[u8]) -> Result<usize, DiskError> {
        if self.readonly {
            return Err(DiskError::ReadOnly);
        }
        let offset = sector * SECTOR_SIZE;
        self.file.write_at(buf, offset)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), DiskError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn num_sectors(&self) -> u64 {
        self.num_sectors
    }

    fn read_only(&self) -> bool {
        self.readonly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_disk(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn reads_and_writes_disjoint_ranges_round_trip() {
        let f = temp_disk(&vec![0u8; 4096]);
        let mut disk = RawImage::open(f.path(), false).unwrap();

        let a = vec![0xAAu8; 512];
        let b = vec![0xBBu8; 512];
        disk.write_at(0, &a).unwrap();
        disk.write_at(2, &b).unwrap();

        let mut readback = vec![0u8; 1536];
        disk.read_at(0, &mut readback).unwrap();
        assert_eq!(&readback[0..512], &a[..]);
        assert_eq!(&readback[1024..1536], &b[..]);
    }

    #[test]
    fn readonly_rejects_writes() {
        let f = temp_disk(&vec![0u8; 512]);
        let mut disk = RawImage::open(f.path(), true).unwrap();
        assert!(matches!(
            disk.write_at(0, &[0u8; 512]),
            Err(DiskError::ReadOnly)
        ));
    }
}
