//! Request decoding.
//!
//! A request arrives as a scatter-gather list of input descriptors; the
//! first descriptor carries a `fuse_in_header` followed by the opcode-typed
//! body (and zero-terminated names where the opcode takes them). This module
//! parses that first descriptor into a typed [`Operation`]. Write payload
//! lives in the remaining descriptors and never passes through here; the
//! read/write handlers hand those descriptors to the async engine untouched.

use std::convert::TryFrom;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::{error, fmt};

use num_enum::TryFromPrimitive;
use zerocopy::error::ConvertError;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use super::fuse_abi::*;

/// Error that may occur while parsing a request frame.
#[derive(Debug)]
pub(crate) enum RequestError {
    /// Not enough data for the fixed header.
    ShortHeader(usize),
    /// The guest sent an opcode this server does not implement. The unique
    /// id is preserved so the dispatcher can answer ENOSYS.
    UnknownOpcode { opcode: u32, unique: u64 },
    /// The typed body or a required name is truncated or unterminated.
    InsufficientData,
    /// A descriptor base was not aligned for the header it carries.
    Misaligned,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::ShortHeader(len) => write!(
                f,
                "short request header ({} < {})",
                len,
                size_of::<fuse_in_header>()
            ),
            RequestError::UnknownOpcode { opcode, .. } => {
                write!(f, "unknown FUSE opcode ({opcode})")
            }
            RequestError::InsufficientData => write!(f, "insufficient argument data"),
            RequestError::Misaligned => write!(f, "misaligned request descriptor"),
        }
    }
}

impl error::Error for RequestError {}

/// The opcodes this server implements. Anything else is answered ENOSYS.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub(crate) enum Opcode {
    Lookup = 1,
    Forget = 2, // no reply
    Getattr = 3,
    Setattr = 4,
    Symlink = 6,
    Mknod = 8,
    Mkdir = 9,
    Unlink = 10,
    Rmdir = 11,
    Rename = 12,
    Open = 14,
    Read = 15,
    Write = 16,
    Statfs = 17,
    Release = 18,
    Fsync = 20,
    Flush = 25,
    Init = 26,
    Opendir = 27,
    Readdir = 28,
    Releasedir = 29,
    Fsyncdir = 30,
    Setlk = 32,
    Setlkw = 33,
    Create = 35,
    Destroy = 38,
    BatchForget = 42, // no reply
    Fallocate = 43,
    Readdirplus = 44,
}

/// Cursor that decomposes the request body into typed arguments.
struct ArgCursor<'a> {
    data: &'a [u8],
}

impl<'a> ArgCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        ArgCursor { data }
    }

    fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Fetch a typed argument from the front of the remaining data.
    fn fetch<T: FromBytes + KnownLayout + Immutable>(&mut self) -> Result<&'a T, RequestError> {
        match zerocopy::Ref::<_, T>::from_prefix(self.data) {
            Ok((r, rest)) => {
                self.data = rest;
                Ok(zerocopy::Ref::into_ref(r))
            }
            Err(ConvertError::Alignment(_)) => Err(RequestError::Misaligned),
            Err(ConvertError::Size(_)) => Err(RequestError::InsufficientData),
            Err(ConvertError::Validity(infallible)) => match infallible {},
        }
    }

    /// Fetch `count` consecutive typed arguments.
    fn fetch_slice<T: FromBytes + Immutable>(
        &mut self,
        count: usize,
    ) -> Result<&'a [T], RequestError> {
        match zerocopy::Ref::<_, [T]>::from_prefix_with_elems(self.data, count) {
            Ok((r, rest)) => {
                self.data = rest;
                Ok(zerocopy::Ref::into_ref(r))
            }
            Err(ConvertError::Alignment(_)) => Err(RequestError::Misaligned),
            Err(ConvertError::Size(_)) => Err(RequestError::InsufficientData),
            Err(ConvertError::Validity(infallible)) => match infallible {},
        }
    }

    /// Fetch a zero-terminated name (may be non-UTF-8).
    fn fetch_str(&mut self) -> Result<&'a OsStr, RequestError> {
        let len = memchr::memchr(0, self.data).ok_or(RequestError::InsufficientData)?;
        let (name, rest) = self.data.split_at(len);
        self.data = &rest[1..];
        Ok(OsStr::from_bytes(name))
    }
}

/// A filesystem operation the guest wants performed, with its arguments.
#[derive(Debug)]
pub(crate) enum Operation<'a> {
    Lookup { name: &'a OsStr },
    Forget { arg: &'a fuse_forget_in },
    Getattr { arg: &'a fuse_getattr_in },
    Setattr { arg: &'a fuse_setattr_in },
    Symlink { name: &'a OsStr, link: &'a OsStr },
    Mknod { arg: &'a fuse_mknod_in, name: &'a OsStr },
    Mkdir { arg: &'a fuse_mkdir_in, name: &'a OsStr },
    Unlink { name: &'a OsStr },
    Rmdir { name: &'a OsStr },
    Rename { arg: &'a fuse_rename_in, name: &'a OsStr, newname: &'a OsStr },
    Open { arg: &'a fuse_open_in },
    Read { arg: &'a fuse_read_in },
    Write { arg: &'a fuse_write_in },
    Statfs,
    Release { arg: &'a fuse_release_in },
    Fsync { arg: &'a fuse_fsync_in },
    Flush { arg: &'a fuse_flush_in },
    Init { arg: &'a fuse_init_in },
    Opendir { arg: &'a fuse_open_in },
    Readdir { arg: &'a fuse_read_in },
    Releasedir { arg: &'a fuse_release_in },
    Fsyncdir { arg: &'a fuse_fsync_in },
    Setlk { arg: &'a fuse_lk_in, sleep: bool },
    Create { arg: &'a fuse_create_in, name: &'a OsStr },
    Destroy,
    BatchForget { nodes: &'a [fuse_forget_one] },
    Fallocate { arg: &'a fuse_fallocate_in },
    Readdirplus { arg: &'a fuse_read_in },
}

impl<'a> Operation<'a> {
    fn parse(opcode: Opcode, data: &mut ArgCursor<'a>) -> Result<Self, RequestError> {
        Ok(match opcode {
            Opcode::Lookup => Operation::Lookup {
                name: data.fetch_str()?,
            },
            Opcode::Forget => Operation::Forget { arg: data.fetch()? },
            Opcode::Getattr => Operation::Getattr { arg: data.fetch()? },
            Opcode::Setattr => Operation::Setattr { arg: data.fetch()? },
            Opcode::Symlink => Operation::Symlink {
                name: data.fetch_str()?,
                link: data.fetch_str()?,
            },
            Opcode::Mknod => Operation::Mknod {
                arg: data.fetch()?,
                name: data.fetch_str()?,
            },
            Opcode::Mkdir => Operation::Mkdir {
                arg: data.fetch()?,
                name: data.fetch_str()?,
            },
            Opcode::Unlink => Operation::Unlink {
                name: data.fetch_str()?,
            },
            Opcode::Rmdir => Operation::Rmdir {
                name: data.fetch_str()?,
            },
            Opcode::Rename => Operation::Rename {
                arg: data.fetch()?,
                name: data.fetch_str()?,
                newname: data.fetch_str()?,
            },
            Opcode::Open => Operation::Open { arg: data.fetch()? },
            Opcode::Read => Operation::Read { arg: data.fetch()? },
            Opcode::Write => Operation::Write { arg: data.fetch()? },
            Opcode::Statfs => Operation::Statfs,
            Opcode::Release => Operation::Release { arg: data.fetch()? },
            Opcode::Fsync => Operation::Fsync { arg: data.fetch()? },
            Opcode::Flush => Operation::Flush { arg: data.fetch()? },
            Opcode::Init => Operation::Init { arg: data.fetch()? },
            Opcode::Opendir => Operation::Opendir { arg: data.fetch()? },
            Opcode::Readdir => Operation::Readdir { arg: data.fetch()? },
            Opcode::Releasedir => Operation::Releasedir { arg: data.fetch()? },
            Opcode::Fsyncdir => Operation::Fsyncdir { arg: data.fetch()? },
            Opcode::Setlk => Operation::Setlk {
                arg: data.fetch()?,
                sleep: false,
            },
            Opcode::Setlkw => Operation::Setlk {
                arg: data.fetch()?,
                sleep: true,
            },
            Opcode::Create => Operation::Create {
                arg: data.fetch()?,
                name: data.fetch_str()?,
            },
            Opcode::Destroy => Operation::Destroy,
            Opcode::BatchForget => {
                let arg: &fuse_batch_forget_in = data.fetch()?;
                Operation::BatchForget {
                    nodes: data.fetch_slice(arg.count as usize)?,
                }
            }
            Opcode::Fallocate => Operation::Fallocate { arg: data.fetch()? },
            Opcode::Readdirplus => Operation::Readdirplus { arg: data.fetch()? },
        })
    }
}

impl fmt::Display for Operation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Lookup { name } => write!(f, "LOOKUP name {name:?}"),
            Operation::Forget { arg } => write!(f, "FORGET nlookup {}", arg.nlookup),
            Operation::Getattr { arg } => write!(f, "GETATTR flags {:#x}", arg.getattr_flags),
            Operation::Setattr { arg } => write!(f, "SETATTR valid {:#x}", arg.valid),
            Operation::Symlink { name, link } => {
                write!(f, "SYMLINK name {name:?}, link {link:?}")
            }
            Operation::Mknod { arg, name } => {
                write!(f, "MKNOD name {name:?}, mode {:#05o}, rdev {}", arg.mode, arg.rdev)
            }
            Operation::Mkdir { arg, name } => {
                write!(f, "MKDIR name {name:?}, mode {:#05o}", arg.mode)
            }
            Operation::Unlink { name } => write!(f, "UNLINK name {name:?}"),
            Operation::Rmdir { name } => write!(f, "RMDIR name {name:?}"),
            Operation::Rename { arg, name, newname } => {
                write!(f, "RENAME name {name:?}, newdir {:#x}, newname {newname:?}", arg.newdir)
            }
            Operation::Open { arg } => write!(f, "OPEN flags {:#x}", arg.flags),
            Operation::Read { arg } => {
                write!(f, "READ fh {}, offset {}, size {}", arg.fh, arg.offset, arg.size)
            }
            Operation::Write { arg } => {
                write!(f, "WRITE fh {}, offset {}, size {}", arg.fh, arg.offset, arg.size)
            }
            Operation::Statfs => write!(f, "STATFS"),
            Operation::Release { arg } => write!(f, "RELEASE fh {}", arg.fh),
            Operation::Fsync { arg } => {
                write!(f, "FSYNC fh {}, flags {:#x}", arg.fh, arg.fsync_flags)
            }
            Operation::Flush { arg } => write!(f, "FLUSH fh {}", arg.fh),
            Operation::Init { arg } => {
                write!(f, "INIT kernel ABI {}.{}, flags {:#x}", arg.major, arg.minor, arg.flags)
            }
            Operation::Opendir { arg } => write!(f, "OPENDIR flags {:#x}", arg.flags),
            Operation::Readdir { arg } => {
                write!(f, "READDIR fh {}, offset {}, size {}", arg.fh, arg.offset, arg.size)
            }
            Operation::Releasedir { arg } => write!(f, "RELEASEDIR fh {}", arg.fh),
            Operation::Fsyncdir { arg } => {
                write!(f, "FSYNCDIR fh {}, flags {:#x}", arg.fh, arg.fsync_flags)
            }
            Operation::Setlk { arg, sleep } => {
                write!(f, "SETLK fh {}, type {}, sleep {}", arg.fh, arg.lk.typ, sleep)
            }
            Operation::Create { arg, name } => {
                write!(f, "CREATE name {name:?}, mode {:#05o}, flags {:#x}", arg.mode, arg.flags)
            }
            Operation::Destroy => write!(f, "DESTROY"),
            Operation::BatchForget { nodes } => {
                write!(f, "BATCH_FORGET nodes {}", nodes.len())
            }
            Operation::Fallocate { arg } => {
                write!(f, "FALLOCATE fh {}, offset {}, length {}", arg.fh, arg.offset, arg.length)
            }
            Operation::Readdirplus { arg } => {
                write!(f, "READDIRPLUS fh {}, offset {}, size {}", arg.fh, arg.offset, arg.size)
            }
        }
    }
}

/// A parsed request: fixed header plus typed operation.
#[derive(Debug)]
pub(crate) struct Request<'a> {
    header: &'a fuse_in_header,
    operation: Operation<'a>,
    /// Bytes of the first descriptor consumed by the header, typed body and
    /// names. For WRITE this is where the payload starts.
    body_offset: usize,
}

impl fmt::Display for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FUSE({:3}) ino {:#x}: {}",
            self.header.unique, self.header.nodeid, self.operation
        )
    }
}

impl<'a> Request<'a> {
    pub(crate) fn parse(data: &'a [u8]) -> Result<Self, RequestError> {
        let total = data.len();
        let mut cursor = ArgCursor::new(data);
        let header: &fuse_in_header = cursor
            .fetch()
            .map_err(|e| match e {
                RequestError::InsufficientData => RequestError::ShortHeader(total),
                other => other,
            })?;
        let opcode = Opcode::try_from(header.opcode).map_err(|_| RequestError::UnknownOpcode {
            opcode: header.opcode,
            unique: header.unique,
        })?;
        let operation = Operation::parse(opcode, &mut cursor)?;
        Ok(Request {
            header,
            operation,
            body_offset: total - cursor.remaining(),
        })
    }

    pub(crate) fn unique(&self) -> u64 {
        self.header.unique
    }

    pub(crate) fn nodeid(&self) -> u64 {
        self.header.nodeid
    }

    pub(crate) fn uid(&self) -> u32 {
        self.header.uid
    }

    pub(crate) fn gid(&self) -> u32 {
        self.header.gid
    }

    pub(crate) fn operation(&self) -> &Operation<'a> {
        &self.operation
    }

    pub(crate) fn body_offset(&self) -> usize {
        self.body_offset
    }
}
