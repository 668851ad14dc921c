//! Reply encoding.
//!
//! Every reply is a `fuse_out_header` followed by an opcode-typed body,
//! written sequentially into the request's output descriptors. The error
//! field carries the negated errno, zero on success.

use log::warn;
use nix::errno::Errno;
use smallvec::SmallVec;
use zerocopy::{FromZeros, IntoBytes};

use super::fuse_abi::*;
use crate::iov::OutRegion;

pub(crate) const OUT_HEADER_SIZE: usize = size_of::<fuse_out_header>();

/// Split a validity timeout in floating-point seconds into the whole-second
/// and nanosecond parts the wire format wants.
pub(crate) fn timeout_secs(t: f64) -> u64 {
    if t > 0.0 { t.trunc() as u64 } else { 0 }
}

pub(crate) fn timeout_nanos(t: f64) -> u32 {
    if t > 0.0 {
        ((t.fract() * 1e9) as u32).min(999_999_999)
    } else {
        0
    }
}

/// What a successful lookup resolved to: the protocol id, its generation
/// and the host attributes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryParam {
    pub(crate) ino: u64,
    pub(crate) generation: u64,
    pub(crate) attr: libc::stat,
}

#[allow(clippy::unnecessary_cast)] // field widths vary across architectures
pub(crate) fn attr_from_stat(st: &libc::stat) -> fuse_attr {
    fuse_attr {
        ino: st.st_ino as u64,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: st.st_atime as i64,
        mtime: st.st_mtime as i64,
        ctime: st.st_ctime as i64,
        atimensec: st.st_atime_nsec as u32,
        mtimensec: st.st_mtime_nsec as u32,
        ctimensec: st.st_ctime_nsec as u32,
        mode: st.st_mode as u32,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        padding: 0,
    }
}

pub(crate) fn entry_out(e: &EntryParam, timeout: f64) -> fuse_entry_out {
    fuse_entry_out {
        nodeid: e.ino,
        generation: e.generation,
        entry_valid: timeout_secs(timeout),
        attr_valid: timeout_secs(timeout),
        entry_valid_nsec: timeout_nanos(timeout),
        attr_valid_nsec: timeout_nanos(timeout),
        attr: attr_from_stat(&e.attr),
    }
}

/// A lookup miss: node id zero lets the guest cache the negative entry for
/// the entry timeout instead of treating ENOENT as an error.
pub(crate) fn negative_entry_out(timeout: f64) -> fuse_entry_out {
    fuse_entry_out {
        nodeid: 0,
        generation: 0,
        entry_valid: timeout_secs(timeout),
        attr_valid: timeout_secs(timeout),
        entry_valid_nsec: timeout_nanos(timeout),
        attr_valid_nsec: timeout_nanos(timeout),
        attr: fuse_attr::new_zeroed(),
    }
}

pub(crate) fn attr_out(st: &libc::stat, timeout: f64) -> fuse_attr_out {
    fuse_attr_out {
        attr_valid: timeout_secs(timeout),
        attr_valid_nsec: timeout_nanos(timeout),
        dummy: 0,
        attr: attr_from_stat(st),
    }
}

#[allow(clippy::unnecessary_cast)]
pub(crate) fn statfs_out(sv: &libc::statvfs) -> fuse_statfs_out {
    fuse_statfs_out {
        st: fuse_kstatfs {
            blocks: sv.f_blocks as u64,
            bfree: sv.f_bfree as u64,
            bavail: sv.f_bavail as u64,
            files: sv.f_files as u64,
            ffree: sv.f_ffree as u64,
            bsize: sv.f_bsize as u32,
            namelen: sv.f_namemax as u32,
            frsize: sv.f_frsize as u32,
            padding: 0,
            spare: [0; 6],
        },
    }
}

type ReplyBuf = SmallVec<[u8; 32]>;

/// Accumulates directory entries, each 8-byte aligned, up to a size limit.
#[derive(Debug)]
struct EntListBuf {
    max_size: usize,
    buf: ReplyBuf,
}

impl EntListBuf {
    fn new(max_size: usize) -> Self {
        EntListBuf {
            max_size,
            buf: ReplyBuf::new(),
        }
    }

    /// Append one entry (fixed header + name). Returns true if it did not
    /// fit; the buffer is left unchanged in that case.
    fn push(&mut self, ent: [&[u8]; 2]) -> bool {
        debug_assert!(self.buf.len() % size_of::<u64>() == 0);
        let entlen = ent[0].len() + ent[1].len();
        let entsize = entlen.next_multiple_of(size_of::<u64>());
        if self.buf.len() + entsize > self.max_size {
            return true;
        }
        self.buf.extend_from_slice(ent[0]);
        self.buf.extend_from_slice(ent[1]);
        self.buf.resize(self.buf.len() + (entsize - entlen), 0);
        false
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Reply body for READDIR.
#[derive(Debug)]
pub(crate) struct DirEntList(EntListBuf);

impl DirEntList {
    pub(crate) fn new(max_size: usize) -> Self {
        DirEntList(EntListBuf::new(max_size))
    }

    /// Returns true (buffer full) without adding the entry if it does not fit.
    #[must_use]
    pub(crate) fn push(&mut self, ino: u64, off: i64, typ: u32, name: &[u8]) -> bool {
        let header = fuse_dirent {
            ino,
            off,
            namelen: name.len() as u32,
            typ,
        };
        self.0.push([header.as_bytes(), name])
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Reply body for READDIRPLUS: every entry carries a full entry-out struct,
/// so the guest gets the lookup it would otherwise issue per name.
#[derive(Debug)]
pub(crate) struct DirEntPlusList(EntListBuf);

impl DirEntPlusList {
    pub(crate) fn new(max_size: usize) -> Self {
        DirEntPlusList(EntListBuf::new(max_size))
    }

    /// Returns true (buffer full) without adding the entry if it does not fit.
    #[must_use]
    pub(crate) fn push(&mut self, entry: &fuse_entry_out, off: i64, name: &[u8]) -> bool {
        let header = fuse_direntplus {
            entry_out: *entry,
            dirent: fuse_dirent {
                ino: entry.attr.ino,
                off,
                namelen: name.len() as u32,
                typ: entry.attr.mode >> 12,
            },
        };
        self.0.push([header.as_bytes(), name])
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A fully-formed successful reply body.
#[derive(Debug)]
pub(crate) enum Reply {
    Empty,
    Entry(fuse_entry_out),
    Attr(fuse_attr_out),
    Open(fuse_open_out),
    Create(fuse_create_out),
    Write(fuse_write_out),
    Statfs(fuse_statfs_out),
    Init(fuse_init_out),
    Dirents(DirEntList),
    DirentsPlus(DirEntPlusList),
}

impl Reply {
    fn body(&self) -> &[u8] {
        match self {
            Reply::Empty => &[],
            Reply::Entry(x) => x.as_bytes(),
            Reply::Attr(x) => x.as_bytes(),
            Reply::Open(x) => x.as_bytes(),
            Reply::Create(x) => x.as_bytes(),
            Reply::Write(x) => x.as_bytes(),
            Reply::Statfs(x) => x.as_bytes(),
            Reply::Init(x) => x.as_bytes(),
            Reply::Dirents(x) => &x.0.buf,
            Reply::DirentsPlus(x) => &x.0.buf,
        }
    }
}

/// Write the response header and body into the output descriptors.
/// Returns the number of bytes written.
pub(crate) fn send(out: &OutRegion, unique: u64, result: Result<Reply, Errno>) -> usize {
    let (error, body): (i32, &[u8]) = match &result {
        Ok(reply) => (0, reply.body()),
        Err(errno) => (-(*errno as i32), &[]),
    };
    let len = OUT_HEADER_SIZE + body.len();
    if len > out.len() {
        warn!("response of {len} bytes truncated to {} byte region", out.len());
    }
    let header = fuse_out_header {
        len: len as u32,
        error,
        unique,
    };
    let mut written = out.write_at(0, header.as_bytes());
    written += out.write_at(OUT_HEADER_SIZE, body);
    written
}
