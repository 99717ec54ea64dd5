//! QCOW1/QCOW2 sparse disk images (spec §4.14/§4.15), grounded on
//! `disk/qcow.c`. Guest sector offsets resolve through a two-level
//! sparse table: L1 indexes L2 tables, L2 indexes clusters, and a missing
//! L1 or L2 entry means "all zero" without ever touching the data area
//! (spec edge case E4).
//!
//! The original keys its L2 cache with a red-black tree plus an LRU list.
//! Exact-offset lookup doesn't need a tree's ordering, only its O(log n)
//! search, so this keeps a `HashMap` for the lookup and a `VecDeque` for
//! LRU order instead of hand-rolling a red-black tree — the same
//! plain-data-structure trade `io::mmio` documents for its own tree.

use super::{DiskError, DiskImage, SECTOR_SIZE};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;

const QCOW_MAGIC: u32 = 0x5146_49fb; // 'Q' 'F' 'I' 0xfb
const QCOW1_VERSION: u32 = 1;
const QCOW2_VERSION: u32 = 2;

/// Only the compressed-cluster flag exists in QCOW1; clusters are never
/// compressed here, so this is used purely to mask the flag bit off a
/// stored offset, not to detect it.
const QCOW1_OFLAG_MASK: u64 = 1 << 63;
/// QCOW2 adds a "zero cluster" flag bit alongside "compressed"; masked off
/// the same way since this engine never writes either.
const QCOW2_OFLAG_MASK: u64 = (1 << 63) | (1 << 62);

/// Cap on cached L2 tables, carried over from the original's
/// `MAX_CACHE_NODES`.
const MAX_CACHE_NODES: usize = 32;

struct QcowHeader {
    size: u64,
    l1_table_offset: u64,
    l1_size: u32,
    cluster_bits: u32,
    l2_bits: u32,
    oflag_mask: u64,
}

impl QcowHeader {
    fn cluster_size(&self) -> u64 {
        1 << self.cluster_bits
    }

    fn l2_entries(&self) -> u64 {
        1 << self.l2_bits
    }

    fn l1_index(&self, offset: u64) -> u64 {
        offset >> (self.l2_bits + self.cluster_bits)
    }

    fn l2_index(&self, offset: u64) -> u64 {
        (offset >> self.cluster_bits) & (self.l2_entries() - 1)
    }

    fn cluster_offset(&self, offset: u64) -> u64 {
        offset & (self.cluster_size() - 1)
    }
}

fn read_qcow1_header(file: &mut File) -> Result<QcowHeader, DiskError> {
    let mut buf = [0u8; 48];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;

    let size = u64::from_be_bytes(buf[24..32].try_into().unwrap());
    let cluster_bits = buf[32] as u32;
    let l2_bits = buf[33] as u32;
    let l1_table_offset = u64::from_be_bytes(buf[40..48].try_into().unwrap());
    if cluster_bits == 0 || l2_bits == 0 {
        return Err(DiskError::MalformedHeader(
            "qcow1 cluster_bits/l2_bits is zero".into(),
        ));
    }
    let l1_size = size / ((1u64 << l2_bits) * (1u64 << cluster_bits));

    Ok(QcowHeader {
        size,
        l1_table_offset,
        l1_size: l1_size as u32,
        cluster_bits,
        l2_bits,
        oflag_mask: QCOW1_OFLAG_MASK,
    })
}

fn read_qcow2_header(file: &mut File) -> Result<QcowHeader, DiskError> {
    let mut buf = [0u8; 72];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;

    let cluster_bits = u32::from_be_bytes(buf[20..24].try_into().unwrap());
    let size = u64::from_be_bytes(buf[24..32].try_into().unwrap());
    let l1_size = u32::from_be_bytes(buf[36..40].try_into().unwrap());
    let l1_table_offset = u64::from_be_bytes(buf[40..48].try_into().unwrap());
    if cluster_bits < 3 {
        return Err(DiskError::MalformedHeader(
            "qcow2 cluster_bits too small".into(),
        ));
    }

    Ok(QcowHeader {
        size,
        l1_table_offset,
        l1_size,
        cluster_bits,
        l2_bits: cluster_bits - 3,
        oflag_mask: QCOW2_OFLAG_MASK,
    })
}

pub struct QcowImage {
    file: File,
    header: QcowHeader,
    l1_table: Vec<u64>,
    l2_cache: HashMap<u64, Vec<u64>>,
    lru: VecDeque<u64>,
    readonly: bool,
}

impl QcowImage {
    /// Sniff `path` for a QCOW magic; returns `Ok(None)` (not an error) for
    /// any file that isn't QCOW1/QCOW2, so callers fall through to the raw
    /// backend.
    pub fn probe(path: &Path, readonly: bool) -> Result<Option<Self>, DiskError> {
        let mut file = OpenOptions::new().read(true).write(!readonly).open(path)?;
        let mut magic_version = [0u8; 8];
        if file.read_exact(&mut magic_version).is_err() {
            return Ok(None);
        }
        let magic = u32::from_be_bytes(magic_version[0..4].try_into().unwrap());
        let version = u32::from_be_bytes(magic_version[4..8].try_into().unwrap());
        if magic != QCOW_MAGIC {
            return Ok(None);
        }

        let (header, readonly) = match version {
            QCOW1_VERSION => (read_qcow1_header(&mut file)?, readonly),
            // QCOW2 is mounted read-only regardless of what the caller asked
            // for (spec §4.15) — this engine never implements qcow2's
            // refcount/snapshot metadata updates a real write path needs.
            QCOW2_VERSION => (read_qcow2_header(&mut file)?, true),
            _ => return Ok(None),
        };

        let mut l1_raw = vec![0u8; header.l1_size as usize * 8];
        file.read_at(&mut l1_raw, header.l1_table_offset)?;
        let l1_table = l1_raw
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect();

        Ok(Some(Self {
            file,
            header,
            l1_table,
            l2_cache: HashMap::new(),
            lru: VecDeque::new(),
            readonly,
        }))
    }

    fn touch_lru(&mut self, offset: u64) {
        self.lru.retain(|&o| o != offset);
        self.lru.push_back(offset);
    }

    /// Fetch L2 entry `idx` of the table stored at `l2_offset`, reading and
    /// caching the whole table on a miss, evicting the least-recently-used
    /// table first if the cache is full.
    fn l2_entry(&mut self, l2_offset: u64, idx: usize) -> Result<u64, DiskError> {
        if !self.l2_cache.contains_key(&l2_offset) {
            if self.l2_cache.len() >= MAX_CACHE_NODES {
                if let Some(victim) = self.lru.pop_front() {
                    self.l2_cache.remove(&victim);
                }
            }
            let mut raw = vec![0u8; self.header.l2_entries() as usize * 8];
            self.file.read_at(&mut raw, l2_offset)?;
            let table: Vec<u64> = raw
                .chunks_exact(8)
                .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
                .collect();
            self.l2_cache.insert(l2_offset, table);
        }
        self.touch_lru(l2_offset);
        Ok(self.l2_cache[&l2_offset][idx])
    }

    fn read_cluster(&mut self, offset: u64, dst: &mut [u8]) -> Result<usize, DiskError> {
        let cluster_size = self.header.cluster_size();
        let l1_idx = self.header.l1_index(offset) as usize;
        if l1_idx >= self.l1_table.len() {
            return Err(DiskError::OutOfRange {
                sector: offset / SECTOR_SIZE,
                total: self.num_sectors(),
            });
        }

        let clust_offset = self.header.cluster_offset(offset);
        let length = ((cluster_size - clust_offset) as usize).min(dst.len());

        let l2_table_offset = self.l1_table[l1_idx] & !self.header.oflag_mask;
        if l2_table_offset == 0 {
            dst[..length].fill(0);
            return Ok(length);
        }

        let l2_idx = self.header.l2_index(offset) as usize;
        let clust_start = self.l2_entry(l2_table_offset, l2_idx)? & !self.header.oflag_mask;
        if clust_start == 0 {
            dst[..length].fill(0);
            return Ok(length);
        }

        self.file
            .read_at(&mut dst[..length], clust_start + clust_offset)?;
        Ok(length)
    }

    /// Allocate a zeroed L2 table at end-of-file, `fdatasync`, and record
    /// it in the L1 table both on disk and in core. Rolls the file back to
    /// its prior length (best-effort) if the L1 update fails partway.
    fn allocate_l2_table(&mut self, l1_idx: usize) -> Result<u64, DiskError> {
        let pre_size = self.file.metadata()?.len();
        let cluster_size = self.header.cluster_size();
        let l2_off = pre_size.div_ceil(cluster_size) * cluster_size;

        let zeros = vec![0u8; self.header.l2_entries() as usize * 8];
        if let Err(e) = self.write_sync(l2_off, &zeros) {
            let _ = self.file.set_len(pre_size);
            return Err(e);
        }

        let entry = (l2_off).to_be_bytes();
        let l1_entry_addr = self.header.l1_table_offset + l1_idx as u64 * 8;
        if let Err(e) = self.write_sync(l1_entry_addr, &entry) {
            let _ = self.file.set_len(pre_size);
            return Err(e);
        }

        self.l1_table[l1_idx] = l2_off;
        self.l2_cache.insert(l2_off, vec![0u64; self.header.l2_entries() as usize]);
        self.touch_lru(l2_off);
        Ok(l2_off)
    }

    fn write_sync(&mut self, offset: u64, buf: &[u8]) -> Result<(), DiskError> {
        self.file.write_at(buf, offset)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn write_cluster(&mut self, offset: u64, src: &[u8]) -> Result<usize, DiskError> {
        let cluster_size = self.header.cluster_size();
        let l1_idx = self.header.l1_index(offset) as usize;
        if l1_idx >= self.l1_table.len() {
            return Err(DiskError::OutOfRange {
                sector: offset / SECTOR_SIZE,
                total: self.num_sectors(),
            });
        }
        let l2_idx = self.header.l2_index(offset) as usize;
        let clust_offset = self.header.cluster_offset(offset);
        let length = ((cluster_size - clust_offset) as usize).min(src.len());

        let mut l2_table_offset = self.l1_table[l1_idx] & !self.header.oflag_mask;
        if l2_table_offset == 0 {
            l2_table_offset = self.allocate_l2_table(l1_idx)?;
        }

        let mut clust_start = self.l2_entry(l2_table_offset, l2_idx)? & !self.header.oflag_mask;
        let pre_size = self.file.metadata()?.len();
        let allocating = clust_start == 0;
        if allocating {
            clust_start = pre_size.div_ceil(cluster_size) * cluster_size;
        }

        if let Err(e) = self.file.write_at(&src[..length], clust_start + clust_offset) {
            if allocating {
                let _ = self.file.set_len(pre_size);
            }
            return Err(e.into());
        }

        if allocating {
            let entry = clust_start.to_be_bytes();
            let l2_entry_addr = l2_table_offset + l2_idx as u64 * 8;
            if let Err(e) = self.write_sync(l2_entry_addr, &entry) {
                let _ = self.file.set_len(pre_size);
                return Err(e);
            }
            if let Some(table) = self.l2_cache.get_mut(&l2_table_offset) {
                table[l2_idx] = clust_start;
            }
        }

        Ok(length)
    }
}

impl DiskImage for QcowImage {
    fn read_at(&mut self, sector: u64, buf: &mut [u8]) -> Result<usize, DiskError> {
        let mut offset = sector * SECTOR_SIZE;
        let mut done = 0;
        while done < buf.len() {
            if offset >= self.header.size {
                return Err(DiskError::OutOfRange {
                    sector: offset / SECTOR_SIZE,
                    total: self.num_sectors(),
                });
            }
            let n = self.read_cluster(offset, &mut buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
            offset += n as u64;
        }
        Ok(done)
    }

    fn write_at(&mut self, sector: u64, buf: &[u8]) -> Result<usize, DiskError> {
        if self.readonly {
            return Err(DiskError::ReadOnly);
        }
        let mut offset = sector * SECTOR_SIZE;
        let mut done = 0;
        while done < buf.len() {
            if offset >= self.header.size {
                return Err(DiskError::OutOfRange {
                    sector: offset / SECTOR_SIZE,
                    total: self.num_sectors(),
                });
            }
            let n = self.write_cluster(offset, &buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
            offset += n as u64;
        }
        Ok(done)
    }

    fn flush(&mut self) -> Result<(), DiskError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn num_sectors(&self) -> u64 {
        self.header.size / SECTOR_SIZE
    }

    fn read_only(&self) -> bool {
        self.readonly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Build a minimal QCOW1 image: header + empty L1 table, no L2 tables
    /// allocated, so every cluster reads as a zero-hole (edge case E4).
    fn build_qcow1(num_clusters: u64, cluster_bits: u32, l2_bits: u32) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let cluster_size = 1u64 << cluster_bits;
        let l2_entries = 1u64 << l2_bits;
        let size = num_clusters * cluster_size * l2_entries;

        let mut header = vec![0u8; 48];
        header[0..4].copy_from_slice(&QCOW_MAGIC.to_be_bytes());
        header[4..8].copy_from_slice(&QCOW1_VERSION.to_be_bytes());
        header[24..32].copy_from_slice(&size.to_be_bytes());
        header[32] = cluster_bits as u8;
        header[33] = l2_bits as u8;
        header[40..48].copy_from_slice(&48u64.to_be_bytes()); // l1_table_offset

        f.write_all(&header).unwrap();
        let l1_table = vec![0u8; num_clusters as usize * 8];
        f.write_all(&l1_table).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn probe_rejects_non_qcow_files() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 32]).unwrap();
        f.flush().unwrap();
        assert!(QcowImage::probe(f.path(), true).unwrap().is_none());
    }

    #[test]
    fn zero_hole_reads_as_zero_without_touching_data_area() {
        let f = build_qcow1(4, 12, 9);
        let mut disk = QcowImage::probe(f.path(), false).unwrap().unwrap();

        let mut buf = vec![0xFFu8; 4096];
        let n = disk.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 4096);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read_back_allocates_and_round_trips() {
        let f = build_qcow1(4, 12, 9);
        let mut disk = QcowImage::probe(f.path(), false).unwrap().unwrap();

        let data = vec![0x5Au8; 512];
        disk.write_at(10, &data).unwrap();

        let mut readback = vec![0u8; 512];
        disk.read_at(10, &mut readback).unwrap();
        assert_eq!(readback, data);
    }

    #[test]
    fn qcow2_header_forces_read_only() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let mut header = vec![0u8; 72];
        header[0..4].copy_from_slice(&QCOW_MAGIC.to_be_bytes());
        header[4..8].copy_from_slice(&QCOW2_VERSION.to_be_bytes());
        header[20..24].copy_from_slice(&16u32.to_be_bytes()); // cluster_bits
        header[24..32].copy_from_slice(&(16u64 * 512 * 8).to_be_bytes()); // size
        header[36..40].copy_from_slice(&8u32.to_be_bytes()); // l1_size
        header[40..48].copy_from_slice(&72u64.to_be_bytes()); // l1_table_offset
        f.write_all(&header).unwrap();
        f.write_all(&vec![0u8; 8 * 8]).unwrap();
        f.flush().unwrap();

        let disk = QcowImage::probe(f.path(), false).unwrap().unwrap();
        assert!(disk.read_only());
    }
}
