//! FUSE kernel wire interface.
//!
//! Types and definitions shared between the guest kernel driver and this
//! server. Requests and replies are fixed-size little-endian structures; the
//! numbers match `fuse_kernel.h` in libfuse and the Linux kernel:
//! <https://github.com/libfuse/libfuse/blob/master/include/fuse_kernel.h>
//!
//! The ABI level is pinned at 7.36, which every virtio-fs capable guest
//! kernel speaks and which covers the full operation set of this server
//! (READDIRPLUS, BATCH_FORGET, FALLOCATE, FOPEN_NOFLUSH). Requests and
//! replies of guests negotiating a lower minor are prefix-compatible.
//!
//! All structs derive both `FromBytes` and `IntoBytes`: the server parses
//! the `_in` side and formats the `_out` side, and the integration tests do
//! the opposite.

#![allow(missing_docs)]
#![allow(non_camel_case_types)]

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const FUSE_KERNEL_VERSION: u32 = 7;
pub const FUSE_KERNEL_MINOR_VERSION: u32 = 36;

/// The node id of the root inode. Reserved; never allocated to a child.
pub const FUSE_ROOT_ID: u64 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    // Defined as u64 in fuse_kernel.h but treated as signed to match
    // stat.st_atime, and likewise for mtime/ctime below.
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_kstatfs {
    pub blocks: u64,  // Total blocks (in units of frsize)
    pub bfree: u64,   // Free blocks
    pub bavail: u64,  // Free blocks for unprivileged users
    pub files: u64,   // Total inodes
    pub ffree: u64,   // Free inodes
    pub bsize: u32,   // Filesystem block size
    pub namelen: u32, // Maximum filename length
    pub frsize: u32,  // Fundamental file system block size
    pub padding: u32,
    pub spare: [u32; 6],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_file_lock {
    pub start: u64,
    pub end: u64,
    // Defined as u32 in fuse_kernel.h but carries F_RDLCK/F_WRLCK/F_UNLCK
    pub typ: i32,
    pub pid: u32,
}

bitflags! {
    /// Flags returned in the open response.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FopenFlags: u32 {
        /// bypass the page cache for this open file
        const DIRECT_IO = 1 << 0;
        /// don't invalidate the data cache on open
        const KEEP_CACHE = 1 << 1;
        /// the file is not seekable
        const NONSEEKABLE = 1 << 2;
        /// allow caching this directory
        const CACHE_DIR = 1 << 3;
        /// the file is stream-like (no file position at all)
        const STREAM = 1 << 4;
        /// kernel skips sending FUSE_FLUSH on close
        const NOFLUSH = 1 << 5;
    }
}

bitflags! {
    /// Init request/reply capability flags (the first 32-bit flags word).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InitFlags: u32 {
        /// asynchronous read requests
        const ASYNC_READ = 1 << 0;
        /// remote locking for POSIX file locks
        const POSIX_LOCKS = 1 << 1;
        /// filesystem handles lookups of "." and ".."
        const EXPORT_SUPPORT = 1 << 4;
        /// don't apply umask to file mode on create operations
        const DONT_MASK = 1 << 6;
        /// kernel supports splice write on the device
        const SPLICE_WRITE = 1 << 7;
        /// kernel supports splice move on the device
        const SPLICE_MOVE = 1 << 8;
        /// kernel supports splice read on the device
        const SPLICE_READ = 1 << 9;
        /// remote locking for BSD style file locks
        const FLOCK_LOCKS = 1 << 10;
        /// do READDIRPLUS (READDIR+LOOKUP in one)
        const DO_READDIRPLUS = 1 << 13;
        /// adaptive readdirplus
        const READDIRPLUS_AUTO = 1 << 14;
        /// use writeback cache for buffered writes
        const WRITEBACK_CACHE = 1 << 16;
        /// allow parallel lookups and readdir
        const PARALLEL_DIROPS = 1 << 18;
        /// init_out.max_pages contains the max number of request pages
        const MAX_PAGES = 1 << 22;
        /// extended fuse_init_in request
        const INIT_EXT = 1 << 30;
    }
}

pub mod consts {
    // Bitmasks for fuse_setattr_in.valid
    pub const FATTR_MODE: u32 = 1 << 0;
    pub const FATTR_UID: u32 = 1 << 1;
    pub const FATTR_GID: u32 = 1 << 2;
    pub const FATTR_SIZE: u32 = 1 << 3;
    pub const FATTR_ATIME: u32 = 1 << 4;
    pub const FATTR_MTIME: u32 = 1 << 5;
    pub const FATTR_FH: u32 = 1 << 6;
    pub const FATTR_ATIME_NOW: u32 = 1 << 7;
    pub const FATTR_MTIME_NOW: u32 = 1 << 8;
    pub const FATTR_LOCKOWNER: u32 = 1 << 9;
    pub const FATTR_CTIME: u32 = 1 << 10;

    // Getattr flags
    pub const FUSE_GETATTR_FH: u32 = 1 << 0;

    // Lock flags: the request is a BSD flock, not a POSIX lock
    pub const FUSE_LK_FLOCK: u32 = 1 << 0;

    // fsync flags: sync data only, not metadata
    pub const FUSE_FSYNC_FDATASYNC: u32 = 1 << 0;
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_in_header {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_out_header {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_entry_out {
    pub nodeid: u64,
    pub generation: u64,
    pub entry_valid: u64,
    pub attr_valid: u64,
    pub entry_valid_nsec: u32,
    pub attr_valid_nsec: u32,
    pub attr: fuse_attr,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_forget_in {
    pub nlookup: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_forget_one {
    pub nodeid: u64,
    pub nlookup: u64,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_batch_forget_in {
    pub count: u32,
    pub dummy: u32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_getattr_in {
    pub getattr_flags: u32,
    pub dummy: u32,
    pub fh: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_attr_out {
    pub attr_valid: u64,
    pub attr_valid_nsec: u32,
    pub dummy: u32,
    pub attr: fuse_attr,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_mknod_in {
    pub mode: u32,
    pub rdev: u32,
    pub umask: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_mkdir_in {
    pub mode: u32,
    pub umask: u32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_rename_in {
    pub newdir: u64,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_setattr_in {
    pub valid: u32,
    pub padding: u32,
    pub fh: u64,
    pub size: u64,
    pub lock_owner: u64,
    // Defined as u64 in fuse_kernel.h but treated as signed to match
    // stat.st_atime, and likewise for mtime/ctime below.
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub unused4: u32,
    pub uid: u32,
    pub gid: u32,
    pub unused5: u32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_open_in {
    // Defined as u32 in fuse_kernel.h but carries open(2) flags
    pub flags: i32,
    pub open_flags: u32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_create_in {
    // Defined as u32 in fuse_kernel.h but carries open(2) flags
    pub flags: i32,
    pub mode: u32,
    pub umask: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_open_out {
    pub fh: u64,
    pub open_flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_create_out(pub fuse_entry_out, pub fuse_open_out);

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_release_in {
    pub fh: u64,
    pub flags: i32,
    pub release_flags: u32,
    pub lock_owner: u64,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_flush_in {
    pub fh: u64,
    pub unused: u32,
    pub padding: u32,
    pub lock_owner: u64,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_read_in {
    pub fh: u64,
    // Defined as u64 in fuse_kernel.h but passed to preadv(2), which takes
    // a signed offset, and likewise for fuse_write_in
    pub offset: i64,
    pub size: u32,
    pub read_flags: u32,
    pub lock_owner: u64,
    pub flags: i32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_write_in {
    pub fh: u64,
    pub offset: i64,
    pub size: u32,
    pub write_flags: u32,
    pub lock_owner: u64,
    pub flags: i32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_write_out {
    pub size: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_statfs_out {
    pub st: fuse_kstatfs,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_fsync_in {
    pub fh: u64,
    pub fsync_flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_lk_in {
    pub fh: u64,
    pub owner: u64,
    pub lk: fuse_file_lock,
    pub lk_flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_fallocate_in {
    pub fh: u64,
    // Defined as u64 in fuse_kernel.h but passed to fallocate(2), which
    // takes signed offset and length
    pub offset: i64,
    pub length: i64,
    pub mode: i32,
    pub padding: u32,
}

/// The prefix every kernel sends regardless of minor version. Guests at
/// 7.36 or later append flags2 and padding, which this server ignores: no
/// capability it negotiates lives in the extended word.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_init_in {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_init_out {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
    pub time_gran: u32,
    pub max_pages: u16,
    pub map_alignment: u16,
    pub flags2: u32,
    pub reserved: [u32; 7],
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_dirent {
    pub ino: u64,
    // Defined as u64 in fuse_kernel.h but carries the signed d_off cookie
    pub off: i64,
    pub namelen: u32,
    pub typ: u32,
    // followed by name of namelen bytes, zero-padded to 8-byte alignment
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_direntplus {
    pub entry_out: fuse_entry_out,
    pub dirent: fuse_dirent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_match_kernel() {
        assert_eq!(size_of::<fuse_in_header>(), 40);
        assert_eq!(size_of::<fuse_out_header>(), 16);
        assert_eq!(size_of::<fuse_attr>(), 88);
        assert_eq!(size_of::<fuse_entry_out>(), 128);
        assert_eq!(size_of::<fuse_attr_out>(), 104);
        assert_eq!(size_of::<fuse_setattr_in>(), 88);
        assert_eq!(size_of::<fuse_init_out>(), 64);
        assert_eq!(size_of::<fuse_kstatfs>(), 80);
        assert_eq!(size_of::<fuse_write_in>(), 40);
        assert_eq!(size_of::<fuse_read_in>(), 40);
        assert_eq!(size_of::<fuse_dirent>(), 24);
        assert_eq!(size_of::<fuse_direntplus>(), 152);
        assert_eq!(size_of::<fuse_lk_in>(), 48);
    }
}
