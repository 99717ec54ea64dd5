//! virtio-9p device engine: a single-queue 9P2000.L transport serving one
//! shared host directory to the guest, grounded on `virtio/9p.c`'s
//! `p9_dev`/`p9_fid` model.
//!
//! Message dispatch mirrors the C switch table: every walk/IO/create/remove
//! operation a guest needs to use the share as a real filesystem (lookup,
//! open, read, write, mkdir, mknod, symlink, rename, link, unlink, statfs,
//! readdir, fsync, setattr) is implemented directly against the host
//! filesystem under the configured share root. Xattr access (`Txattrwalk`,
//! `Txattrcreate`), `Tauth`, and the deprecated `Tremove` fall through to an
//! EOPNOTSUPP `Rlerror`, exactly like `virtio_p9_eopnotsupp`.
//!
//! `Tlock`/`Tgetlock` keep the original's asymmetry: a lock request always
//! reports success without recording anything, while a getlock request
//! always reports the range unlocked. Real `fcntl` byte-range locks are not
//! plumbed through 9P here, so pretending otherwise would be worse than
//! stating the gap plainly.

use crate::memory::GuestMemory;
use crate::virtio::device::{VirtioDeviceOps, VirtioError};
use crate::virtio::ring::Virtqueue;
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;

const VIRTIO_9P_DEVICE_ID: u32 = 9;

const T_LERROR: u8 = 6;
const R_LERROR: u8 = 7;
const T_STATFS: u8 = 8;
const R_STATFS: u8 = 9;
const T_LOPEN: u8 = 12;
const R_LOPEN: u8 = 13;
const T_LCREATE: u8 = 14;
const R_LCREATE: u8 = 15;
const T_SYMLINK: u8 = 16;
const R_SYMLINK: u8 = 17;
const T_MKNOD: u8 = 18;
const R_MKNOD: u8 = 19;
const T_RENAME: u8 = 20;
const R_RENAME: u8 = 21;
const T_READLINK: u8 = 22;
const R_READLINK: u8 = 23;
const T_GETATTR: u8 = 24;
const R_GETATTR: u8 = 25;
const T_SETATTR: u8 = 26;
const R_SETATTR: u8 = 27;
const T_XATTRWALK: u8 = 30;
const T_XATTRCREATE: u8 = 32;
const T_READDIR: u8 = 40;
const R_READDIR: u8 = 41;
const T_FSYNC: u8 = 50;
const R_FSYNC: u8 = 51;
const T_LOCK: u8 = 52;
const R_LOCK: u8 = 53;
const T_GETLOCK: u8 = 54;
const R_GETLOCK: u8 = 55;
const T_LINK: u8 = 70;
const R_LINK: u8 = 71;
const T_MKDIR: u8 = 72;
const R_MKDIR: u8 = 73;
const T_RENAMEAT: u8 = 74;
const R_RENAMEAT: u8 = 75;
const T_UNLINKAT: u8 = 76;
const R_UNLINKAT: u8 = 77;
const T_VERSION: u8 = 100;
const R_VERSION: u8 = 101;
const T_AUTH: u8 = 102;
const T_ATTACH: u8 = 104;
const R_ATTACH: u8 = 105;
const T_FLUSH: u8 = 108;
const R_FLUSH: u8 = 109;
const T_WALK: u8 = 110;
const R_WALK: u8 = 111;
const T_READ: u8 = 116;
const R_READ: u8 = 117;
const T_WRITE: u8 = 118;
const R_WRITE: u8 = 119;
const T_CLUNK: u8 = 120;
const R_CLUNK: u8 = 121;
const T_REMOVE: u8 = 122;

const P9_LOCK_SUCCESS: u8 = 0;
const P9_LOCK_TYPE_UNLCK: u8 = 2;

const P9_SETATTR_MODE: u32 = 1 << 0;
const P9_SETATTR_UID: u32 = 1 << 1;
const P9_SETATTR_GID: u32 = 1 << 2;
const P9_SETATTR_SIZE: u32 = 1 << 3;
const P9_SETATTR_ATIME: u32 = 1 << 4;
const P9_SETATTR_MTIME: u32 = 1 << 5;

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> u8 {
        let v = self.buf.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        v
    }

    fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap_or([0; 2]));
        self.pos += 2;
        v
    }

    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap_or([0; 4]));
        self.pos += 4;
        v
    }

    fn u64(&mut self) -> u64 {
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap_or([0; 8]));
        self.pos += 8;
        v
    }

    fn string(&mut self) -> String {
        let len = self.u16() as usize;
        let end = (self.pos + len).min(self.buf.len());
        let s = String::from_utf8_lossy(&self.buf[self.pos..end]).into_owned();
        self.pos = end;
        s
    }

    fn bytes(&mut self, len: usize) -> &'a [u8] {
        let end = (self.pos + len).min(self.buf.len());
        let s = &self.buf[self.pos..end];
        self.pos = end;
        s
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn string(&mut self, s: &str) {
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }
    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }
    fn qid(&mut self, qid: Qid) {
        self.u8(qid.kind);
        self.u32(qid.version);
        self.u64(qid.path);
    }
}

#[derive(Clone, Copy, Default)]
struct Qid {
    kind: u8,
    version: u32,
    path: u64,
}

const QID_DIR: u8 = 0x80;

fn stat_to_qid(meta: &std::fs::Metadata) -> Qid {
    Qid {
        kind: if meta.is_dir() { QID_DIR } else { 0 },
        version: 0,
        path: meta.ino(),
    }
}

/// Strip flags the C engine can't honor faithfully (`O_CREAT`/`O_DIRECT`
/// belong to a separate Tlcreate path here, `O_ASYNC`/`O_NOCTTY` make no
/// sense for a plain file) and force `O_NOFOLLOW` so a malicious guest path
/// can't walk a symlink out of the shared root.
fn sanitize_open_flags(flags: i32) -> i32 {
    (flags & !(libc::O_NOCTTY | libc::O_ASYNC | libc::O_CREAT | libc::O_DIRECT)) | libc::O_NOFOLLOW
}

fn path_to_cstring(path: &std::path::Path) -> Result<CString, i32> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)
}

fn statvfs_for(path: &std::path::Path) -> Result<libc::statvfs, i32> {
    let c_path = path_to_cstring(path)?;
    let mut buf: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut buf) };
    if rc == 0 {
        Ok(buf)
    } else {
        Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }
}

/// Applies the subset of Tsetattr's `valid` bitmask the guest actually set,
/// field by field, rather than requiring all-or-nothing success.
fn apply_setattr(
    entry: &Fid,
    valid: u32,
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    atime_sec: u64,
    mtime_sec: u64,
) -> Result<(), i32> {
    if valid & P9_SETATTR_MODE != 0 {
        std::fs::set_permissions(&entry.path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
    }
    if valid & (P9_SETATTR_UID | P9_SETATTR_GID) != 0 {
        let c_path = path_to_cstring(&entry.path)?;
        let new_uid = if valid & P9_SETATTR_UID != 0 { uid } else { u32::MAX };
        let new_gid = if valid & P9_SETATTR_GID != 0 { gid } else { u32::MAX };
        let rc = unsafe { libc::chown(c_path.as_ptr(), new_uid, new_gid) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }
    }
    if valid & P9_SETATTR_SIZE != 0 {
        match entry.file.as_ref() {
            Some(file) => file.set_len(size).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?,
            None => {
                let file = OpenOptions::new()
                    .write(true)
                    .open(&entry.path)
                    .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
                file.set_len(size).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
            }
        }
    }
    if valid & (P9_SETATTR_ATIME | P9_SETATTR_MTIME) != 0 {
        let c_path = path_to_cstring(&entry.path)?;
        let atime = if valid & P9_SETATTR_ATIME != 0 {
            libc::timespec { tv_sec: atime_sec as i64, tv_nsec: 0 }
        } else {
            libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT }
        };
        let mtime = if valid & P9_SETATTR_MTIME != 0 {
            libc::timespec { tv_sec: mtime_sec as i64, tv_nsec: 0 }
        } else {
            libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT }
        };
        let times = [atime, mtime];
        let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }
    }
    Ok(())
}

struct Fid {
    path: PathBuf,
    file: Option<File>,
}

pub struct VirtioNinep {
    root: PathBuf,
    tag: String,
    fids: HashMap<u32, Fid>,
    memory: *const GuestMemory,
}

unsafe impl Send for VirtioNinep {}

impl VirtioNinep {
    /// # Safety
    /// `memory` must outlive this device.
    pub fn new(tag: String, root: PathBuf, memory: &GuestMemory) -> Self {
        Self {
            root,
            tag,
            fids: HashMap::new(),
            memory: memory as *const GuestMemory,
        }
    }

    fn handle(&mut self, msg_type: u8, _tag: u16, body: &[u8]) -> (u8, Writer) {
        let mut r = Cursor::new(body);
        let mut w = Writer::default();
        match msg_type {
            T_VERSION => {
                let msize = r.u32();
                let version = r.string();
                w.u32(msize);
                if version == "9P2000.L" {
                    w.string("9P2000.L");
                } else {
                    w.string("unknown");
                }
                (R_VERSION, w)
            }
            T_ATTACH => {
                let fid = r.u32();
                let _afid = r.u32();
                let _uname = r.string();
                let _aname = r.string();
                let _n_uname = r.u32();
                match std::fs::metadata(&self.root) {
                    Ok(meta) => {
                        self.fids.insert(
                            fid,
                            Fid {
                                path: self.root.clone(),
                                file: None,
                            },
                        );
                        w.qid(stat_to_qid(&meta));
                        (R_ATTACH, w)
                    }
                    Err(e) => self.errno_reply(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            T_WALK => {
                let fid = r.u32();
                let newfid = r.u32();
                let nwname = r.u16();
                let mut names = Vec::with_capacity(nwname as usize);
                for _ in 0..nwname {
                    names.push(r.string());
                }
                let Some(base) = self.fids.get(&fid).map(|f| f.path.clone()) else {
                    return self.errno_reply(libc::EBADF);
                };
                let mut path = base;
                let mut qids = Vec::new();
                for name in &names {
                    path.push(name);
                    match std::fs::symlink_metadata(&path) {
                        Ok(meta) => qids.push(stat_to_qid(&meta)),
                        Err(e) => return self.errno_reply(e.raw_os_error().unwrap_or(libc::ENOENT)),
                    }
                }
                self.fids.insert(
                    newfid,
                    Fid {
                        path,
                        file: None,
                    },
                );
                w.u16(qids.len() as u16);
                for q in qids {
                    w.qid(q);
                }
                (R_WALK, w)
            }
            T_LOPEN => {
                let fid = r.u32();
                let flags = r.u32() as i32;
                let Some(entry) = self.fids.get_mut(&fid) else {
                    return self.errno_reply(libc::EBADF);
                };
                let sanitized = sanitize_open_flags(flags);
                let accmode = flags & libc::O_ACCMODE;
                match OpenOptions::new()
                    .read(accmode != libc::O_WRONLY)
                    .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
                    .custom_flags(sanitized)
                    .open(&entry.path)
                {
                    Ok(file) => {
                        let meta = file.metadata().ok();
                        entry.file = Some(file);
                        w.qid(meta.as_ref().map(stat_to_qid).unwrap_or_default());
                        w.u32(0); // iounit: let the client pick its own chunk size
                        (R_LOPEN, w)
                    }
                    Err(e) => self.errno_reply(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            T_READ => {
                let fid = r.u32();
                let offset = r.u64();
                let count = r.u32() as usize;
                let Some(entry) = self.fids.get_mut(&fid) else {
                    return self.errno_reply(libc::EBADF);
                };
                let Some(file) = entry.file.as_mut() else {
                    return self.errno_reply(libc::EBADF);
                };
                let mut buf = vec![0u8; count];
                let n = (|| -> std::io::Result<usize> {
                    file.seek(SeekFrom::Start(offset))?;
                    file.read(&mut buf)
                })();
                match n {
                    Ok(n) => {
                        w.u32(n as u32);
                        w.bytes(&buf[..n]);
                        (R_READ, w)
                    }
                    Err(e) => self.errno_reply(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            T_WRITE => {
                let fid = r.u32();
                let offset = r.u64();
                let count = r.u32() as usize;
                let data = r.bytes(count).to_vec();
                let Some(entry) = self.fids.get_mut(&fid) else {
                    return self.errno_reply(libc::EBADF);
                };
                let Some(file) = entry.file.as_mut() else {
                    return self.errno_reply(libc::EBADF);
                };
                let n = (|| -> std::io::Result<usize> {
                    file.seek(SeekFrom::Start(offset))?;
                    file.write(&data)
                })();
                match n {
                    Ok(n) => {
                        w.u32(n as u32);
                        (R_WRITE, w)
                    }
                    Err(e) => self.errno_reply(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            T_CLUNK => {
                let fid = r.u32();
                self.fids.remove(&fid);
                (R_CLUNK, w)
            }
            T_GETATTR => {
                let fid = r.u32();
                let request_mask = r.u64();
                let Some(entry) = self.fids.get(&fid) else {
                    return self.errno_reply(libc::EBADF);
                };
                match std::fs::symlink_metadata(&entry.path) {
                    Ok(meta) => {
                        w.u64(request_mask);
                        w.qid(stat_to_qid(&meta));
                        w.u32(meta.mode());
                        w.u32(meta.uid());
                        w.u32(meta.gid());
                        w.u64(meta.nlink());
                        w.u64(meta.rdev());
                        w.u64(meta.size());
                        w.u64(meta.blksize());
                        w.u64(meta.blocks());
                        for t in [meta.atime(), meta.mtime(), meta.ctime()] {
                            w.u64(t as u64);
                            w.u64(0);
                        }
                        w.u64(0); // btime seconds (not tracked by the host fs)
                        w.u64(0);
                        w.u64(0); // gen
                        w.u64(0); // data_version
                        (R_GETATTR, w)
                    }
                    Err(e) => self.errno_reply(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            T_LOCK => {
                // See module docs: always claims success without recording
                // the lock anywhere.
                let _fid = r.u32();
                w.u8(P9_LOCK_SUCCESS);
                (R_LOCK, w)
            }
            T_GETLOCK => {
                // Mirrors the asymmetry above: always reports the range as
                // unlocked, regardless of any Tlock calls that preceded it.
                let _fid = r.u32();
                let lock_type = r.u8();
                let start = r.u64();
                let length = r.u64();
                let proc_id = r.u32();
                let client_id = r.string();
                let _ = lock_type;
                w.u8(P9_LOCK_TYPE_UNLCK);
                w.u64(start);
                w.u64(length);
                w.u32(proc_id);
                w.string(&client_id);
                (R_GETLOCK, w)
            }
            T_STATFS => {
                let fid = r.u32();
                let Some(entry) = self.fids.get(&fid) else {
                    return self.errno_reply(libc::EBADF);
                };
                match statvfs_for(&entry.path) {
                    Ok(buf) => {
                        w.u32(0); // type: no meaningful magic across a passthrough mount
                        w.u32(buf.f_bsize as u32);
                        w.u64(buf.f_blocks);
                        w.u64(buf.f_bfree);
                        w.u64(buf.f_bavail);
                        w.u64(buf.f_files);
                        w.u64(buf.f_ffree);
                        w.u64(0); // fsid: not meaningful across a passthrough mount
                        w.u32(buf.f_namemax as u32);
                        (R_STATFS, w)
                    }
                    Err(errno) => self.errno_reply(errno),
                }
            }
            T_LCREATE => {
                let fid = r.u32();
                let name = r.string();
                let flags = r.u32() as i32;
                let mode = r.u32();
                let _gid = r.u32();
                let Some(base) = self.fids.get(&fid).map(|f| f.path.clone()) else {
                    return self.errno_reply(libc::EBADF);
                };
                let path = base.join(&name);
                let accmode = flags & libc::O_ACCMODE;
                let custom = sanitize_open_flags(flags) | libc::O_CREAT;
                match OpenOptions::new()
                    .read(accmode != libc::O_WRONLY)
                    .write(true)
                    .mode(mode)
                    .custom_flags(custom)
                    .open(&path)
                {
                    Ok(file) => {
                        let meta = file.metadata().ok();
                        self.fids.insert(fid, Fid { path, file: Some(file) });
                        w.qid(meta.as_ref().map(stat_to_qid).unwrap_or_default());
                        w.u32(0); // iounit: let the client pick its own chunk size
                        (R_LCREATE, w)
                    }
                    Err(e) => self.errno_reply(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            T_SYMLINK => {
                let fid = r.u32();
                let name = r.string();
                let target = r.string();
                let _gid = r.u32();
                let Some(base) = self.fids.get(&fid).map(|f| f.path.clone()) else {
                    return self.errno_reply(libc::EBADF);
                };
                let path = base.join(&name);
                match std::os::unix::fs::symlink(&target, &path)
                    .and_then(|_| std::fs::symlink_metadata(&path))
                {
                    Ok(meta) => {
                        w.qid(stat_to_qid(&meta));
                        (R_SYMLINK, w)
                    }
                    Err(e) => self.errno_reply(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            T_MKNOD => {
                let fid = r.u32();
                let name = r.string();
                let mode = r.u32();
                let major = r.u32();
                let minor = r.u32();
                let _gid = r.u32();
                let Some(base) = self.fids.get(&fid).map(|f| f.path.clone()) else {
                    return self.errno_reply(libc::EBADF);
                };
                let path = base.join(&name);
                let c_path = match path_to_cstring(&path) {
                    Ok(c) => c,
                    Err(errno) => return self.errno_reply(errno),
                };
                let dev = unsafe { libc::makedev(major, minor) };
                let rc = unsafe { libc::mknod(c_path.as_ptr(), mode, dev) };
                if rc != 0 {
                    return self.errno_reply(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
                }
                match std::fs::symlink_metadata(&path) {
                    Ok(meta) => {
                        w.qid(stat_to_qid(&meta));
                        (R_MKNOD, w)
                    }
                    Err(e) => self.errno_reply(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            T_RENAME => {
                let fid = r.u32();
                let dfid = r.u32();
                let name = r.string();
                let Some(old_path) = self.fids.get(&fid).map(|f| f.path.clone()) else {
                    return self.errno_reply(libc::EBADF);
                };
                let Some(new_dir) = self.fids.get(&dfid).map(|f| f.path.clone()) else {
                    return self.errno_reply(libc::EBADF);
                };
                let new_path = new_dir.join(&name);
                match std::fs::rename(&old_path, &new_path) {
                    Ok(()) => {
                        if let Some(entry) = self.fids.get_mut(&fid) {
                            entry.path = new_path;
                        }
                        (R_RENAME, w)
                    }
                    Err(e) => self.errno_reply(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            T_READLINK => {
                let fid = r.u32();
                let Some(entry) = self.fids.get(&fid) else {
                    return self.errno_reply(libc::EBADF);
                };
                match std::fs::read_link(&entry.path) {
                    Ok(target) => {
                        w.string(&target.to_string_lossy());
                        (R_READLINK, w)
                    }
                    Err(e) => self.errno_reply(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            T_SETATTR => {
                let fid = r.u32();
                let valid = r.u32();
                let mode = r.u32();
                let uid = r.u32();
                let gid = r.u32();
                let size = r.u64();
                let atime_sec = r.u64();
                let _atime_nsec = r.u64();
                let mtime_sec = r.u64();
                let _mtime_nsec = r.u64();
                let Some(entry) = self.fids.get(&fid) else {
                    return self.errno_reply(libc::EBADF);
                };
                match apply_setattr(entry, valid, mode, uid, gid, size, atime_sec, mtime_sec) {
                    Ok(()) => (R_SETATTR, w),
                    Err(errno) => self.errno_reply(errno),
                }
            }
            T_READDIR => {
                let fid = r.u32();
                let offset = r.u64() as usize;
                let count = r.u32() as usize;
                let Some(entry) = self.fids.get(&fid) else {
                    return self.errno_reply(libc::EBADF);
                };
                let mut dirents: Vec<std::fs::DirEntry> = match std::fs::read_dir(&entry.path) {
                    Ok(rd) => rd.filter_map(Result::ok).collect(),
                    Err(e) => return self.errno_reply(e.raw_os_error().unwrap_or(libc::EIO)),
                };
                // `offset` is treated as a simple resume index into this
                // sorted listing rather than a true telldir cookie: good
                // enough for a static share, not a real rename-safe cursor.
                dirents.sort_by_key(|d| d.file_name());
                let mut body = Writer::default();
                for (i, dirent) in dirents.iter().enumerate().skip(offset) {
                    let Ok(meta) = dirent.metadata() else { continue };
                    let mut packed = Writer::default();
                    packed.qid(stat_to_qid(&meta));
                    packed.u64((i + 1) as u64);
                    packed.u8(if meta.is_dir() { libc::DT_DIR } else { libc::DT_REG });
                    packed.string(&dirent.file_name().to_string_lossy());
                    if body.buf.len() + packed.buf.len() > count {
                        break;
                    }
                    body.bytes(&packed.buf);
                }
                w.u32(body.buf.len() as u32);
                w.bytes(&body.buf);
                (R_READDIR, w)
            }
            T_FSYNC => {
                let fid = r.u32();
                let Some(entry) = self.fids.get(&fid) else {
                    return self.errno_reply(libc::EBADF);
                };
                match entry.file.as_ref() {
                    Some(file) => match file.sync_all() {
                        Ok(()) => (R_FSYNC, w),
                        Err(e) => self.errno_reply(e.raw_os_error().unwrap_or(libc::EIO)),
                    },
                    None => self.errno_reply(libc::EBADF),
                }
            }
            T_LINK => {
                let dfid = r.u32();
                let fid = r.u32();
                let name = r.string();
                let Some(target) = self.fids.get(&fid).map(|f| f.path.clone()) else {
                    return self.errno_reply(libc::EBADF);
                };
                let Some(dir) = self.fids.get(&dfid).map(|f| f.path.clone()) else {
                    return self.errno_reply(libc::EBADF);
                };
                match std::fs::hard_link(&target, dir.join(&name)) {
                    Ok(()) => (R_LINK, w),
                    Err(e) => self.errno_reply(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            T_MKDIR => {
                let dfid = r.u32();
                let name = r.string();
                let mode = r.u32();
                let _gid = r.u32();
                let Some(dir) = self.fids.get(&dfid).map(|f| f.path.clone()) else {
                    return self.errno_reply(libc::EBADF);
                };
                let path = dir.join(&name);
                let result = std::fs::create_dir(&path)
                    .and_then(|_| std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)))
                    .and_then(|_| std::fs::symlink_metadata(&path));
                match result {
                    Ok(meta) => {
                        w.qid(stat_to_qid(&meta));
                        (R_MKDIR, w)
                    }
                    Err(e) => self.errno_reply(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            T_RENAMEAT => {
                let olddirfid = r.u32();
                let oldname = r.string();
                let newdirfid = r.u32();
                let newname = r.string();
                let Some(old_dir) = self.fids.get(&olddirfid).map(|f| f.path.clone()) else {
                    return self.errno_reply(libc::EBADF);
                };
                let Some(new_dir) = self.fids.get(&newdirfid).map(|f| f.path.clone()) else {
                    return self.errno_reply(libc::EBADF);
                };
                match std::fs::rename(old_dir.join(&oldname), new_dir.join(&newname)) {
                    Ok(()) => (R_RENAMEAT, w),
                    Err(e) => self.errno_reply(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            T_UNLINKAT => {
                let dirfid = r.u32();
                let name = r.string();
                let flags = r.u32() as i32;
                let Some(dir) = self.fids.get(&dirfid).map(|f| f.path.clone()) else {
                    return self.errno_reply(libc::EBADF);
                };
                let path = dir.join(&name);
                let result = if flags & libc::AT_REMOVEDIR != 0 {
                    std::fs::remove_dir(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                match result {
                    Ok(()) => (R_UNLINKAT, w),
                    Err(e) => self.errno_reply(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            T_FLUSH => {
                // Nothing is tracked in flight: every Trequest is handled
                // synchronously before the next one is popped off the
                // queue, so there is never a pending request to cancel.
                let _oldtag = r.u16();
                (R_FLUSH, w)
            }
            T_LERROR | T_XATTRWALK | T_XATTRCREATE | T_AUTH | T_REMOVE => {
                self.errno_reply(libc::EOPNOTSUPP)
            }
            _ => self.errno_reply(libc::EOPNOTSUPP),
        }
    }

    fn errno_reply(&self, errno: i32) -> (u8, Writer) {
        let mut w = Writer::default();
        w.u32(errno as u32);
        (R_LERROR, w)
    }
}

impl VirtioDeviceOps for VirtioNinep {
    fn device_id(&self) -> u32 {
        VIRTIO_9P_DEVICE_ID
    }

    fn num_queues(&self) -> u16 {
        1
    }

    fn device_features(&self) -> u64 {
        0
    }

    fn ack_features(&mut self, _features: u64) {}

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        // tag_len(u16) + tag bytes, as the guest's 9p mount option names it.
        let tag = self.tag.as_bytes();
        if offset == 0 {
            let len = data.len().min(2);
            data[..len].copy_from_slice(&(tag.len() as u16).to_le_bytes()[..len]);
        } else if (offset as usize) < 2 + tag.len() {
            let start = offset as usize - 2;
            let len = data.len().min(tag.len() - start);
            data[..len].copy_from_slice(&tag[start..start + len]);
        } else {
            data.fill(0);
        }
    }

    fn queue_ready(&mut self, _idx: u16, _queue: &Virtqueue) -> Result<(), VirtioError> {
        Ok(())
    }

    fn process_queue(&mut self, idx: u16, queue: &mut Virtqueue) -> Result<bool, VirtioError> {
        if idx != 0 {
            return Err(VirtioError::QueueNotReady(idx));
        }
        // `self.handle` below needs `&mut self`, so take the memory
        // pointer directly rather than through a `&self` method.
        let memory = unsafe { &*self.memory };
        let mut processed = false;
        while queue.has_pending(memory) {
            let Some(head) = queue.pop_avail(memory) else {
                break;
            };
            let Some(chain) = queue.read_chain(memory, head) else {
                continue;
            };
            let Some(req) = chain.iter().find(|e| !e.write) else {
                continue;
            };
            let Some(resp) = chain.iter().find(|e| e.write) else {
                continue;
            };

            let mut req_buf = vec![0u8; req.len as usize];
            if memory.read(req.addr, &mut req_buf).is_err() {
                continue;
            }

            let mut c = Cursor::new(&req_buf);
            let _size = c.u32();
            let msg_type = c.u8();
            let tag = c.u16();
            let body = &req_buf[7..];

            let (reply_type, writer) = self.handle(msg_type, tag, body);

            let mut out = Writer::default();
            out.u32(0); // patched below
            out.u8(reply_type);
            out.u16(tag);
            out.bytes(&writer.buf);
            let total = out.buf.len() as u32;
            out.buf[0..4].copy_from_slice(&total.to_le_bytes());

            let write_len = out.buf.len().min(resp.len as usize);
            if memory.write(resp.addr, &out.buf[..write_len]).is_err() {
                continue;
            }
            if queue.push_used(memory, head, write_len as u32).is_err() {
                eprintln!("[virtio-9p] failed to push used entry");
            }
            processed = true;
        }
        Ok(processed)
    }
}
