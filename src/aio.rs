//! Async I/O submitter and completion reaper.
//!
//! Read and write handlers do not block the polling thread: they bind the
//! request's reply region and completion context into a record, submit one
//! vectored op against the guest-supplied file handle through Linux native
//! AIO, and tell the dispatcher the reply is deferred. The poll loop ticks
//! [`AioEngine::reap`], which matches completions back to their records,
//! finishes the response header in descriptor memory and fires the
//! completion context.
//!
//! One engine exists per polling thread and is never shared across threads,
//! so submission needs no locking discipline beyond the per-thread mutex
//! the owner wraps it in.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;

use log::warn;
use nix::errno::Errno;
use zerocopy::IntoBytes;

use crate::iov::{IovList, OutRegion};
use crate::ll::fuse_abi::{fuse_out_header, fuse_write_out};
use crate::ll::reply::OUT_HEADER_SIZE;
use crate::transport::{CompletionCtx, CompletionStatus};

// Linux AIO ABI from linux/aio_abi.h; libc carries the syscall numbers but
// not the structures.
#[allow(non_camel_case_types)]
type aio_context_t = libc::c_ulong;

const IOCB_CMD_PREADV: u16 = 7;
const IOCB_CMD_PWRITEV: u16 = 8;

#[repr(C)]
#[allow(non_camel_case_types)]
struct iocb {
    aio_data: u64,
    #[cfg(target_endian = "little")]
    aio_key: u32,
    #[cfg(target_endian = "little")]
    aio_rw_flags: u32,
    #[cfg(target_endian = "big")]
    aio_rw_flags: u32,
    #[cfg(target_endian = "big")]
    aio_key: u32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(non_camel_case_types)]
struct io_event {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AioOp {
    Read,
    Write,
}

/// Everything needed to finish one deferred request.
struct PendingIo {
    op: AioOp,
    unique: u64,
    out: OutRegion,
    /// The iovec array the op was submitted with; the submission points at
    /// it, so it must not move until io_submit returns. The targeted
    /// descriptor memory itself is owned by the transport.
    iovs: IovList,
    ctx: CompletionCtx,
}

// Raw descriptor pointers; validity until completion is the transport's
// contract, and the record never crosses threads anyway (engines are
// thread-confined).
unsafe impl Send for PendingIo {}

impl PendingIo {
    /// Fill the response header from the kernel's result and fire the
    /// completion. A negative result is the negated errno, which goes into
    /// the header verbatim; the transport additionally learns ERROR.
    fn finish(self: Box<Self>, res: i64) {
        let (len, error, status) = if res < 0 {
            (OUT_HEADER_SIZE, res as i32, CompletionStatus::Error)
        } else {
            match self.op {
                AioOp::Read => (OUT_HEADER_SIZE + res as usize, 0, CompletionStatus::Success),
                AioOp::Write => {
                    let body = fuse_write_out {
                        size: res as u32,
                        padding: 0,
                    };
                    self.out.write_at(OUT_HEADER_SIZE, body.as_bytes());
                    (
                        OUT_HEADER_SIZE + size_of::<fuse_write_out>(),
                        0,
                        CompletionStatus::Success,
                    )
                }
            }
        };
        let header = fuse_out_header {
            len: len as u32,
            error,
            unique: self.unique,
        };
        self.out.write_at(0, header.as_bytes());
        self.ctx.complete(status);
    }
}

/// One thread's AIO context and its in-flight records.
pub(crate) struct AioEngine {
    ctx: aio_context_t,
    pending: HashMap<u64, Box<PendingIo>>,
    next_token: u64,
}

impl std::fmt::Debug for AioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AioEngine {{ ctx: {:#x}, pending: {} }}",
            self.ctx,
            self.pending.len()
        )
    }
}

impl AioEngine {
    pub(crate) fn new(depth: u32) -> io::Result<Self> {
        let mut ctx: aio_context_t = 0;
        let res = unsafe {
            libc::syscall(
                libc::SYS_io_setup,
                depth as libc::c_long,
                &mut ctx as *mut aio_context_t,
            )
        };
        Errno::result(res).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        Ok(AioEngine {
            ctx,
            pending: HashMap::new(),
            next_token: 1,
        })
    }

    /// Submit one vectored op. On success the reply is owed to the
    /// completion context; on failure the record is dropped and the caller
    /// replies synchronously with the errno.
    pub(crate) fn submit(
        &mut self,
        fd: RawFd,
        offset: i64,
        op: AioOp,
        iovs: IovList,
        unique: u64,
        out: OutRegion,
        ctx: CompletionCtx,
    ) -> Result<(), Errno> {
        let token = self.next_token;
        self.next_token += 1;
        let record = Box::new(PendingIo {
            op,
            unique,
            out,
            iovs,
            ctx,
        });
        let cb = iocb {
            aio_data: token,
            aio_key: 0,
            aio_rw_flags: 0,
            aio_lio_opcode: match op {
                AioOp::Read => IOCB_CMD_PREADV,
                AioOp::Write => IOCB_CMD_PWRITEV,
            },
            aio_reqprio: 0,
            aio_fildes: fd as u32,
            aio_buf: record.iovs.as_ptr() as u64,
            aio_nbytes: record.iovs.len() as u64,
            aio_offset: offset,
            aio_reserved2: 0,
            aio_flags: 0,
            aio_resfd: 0,
        };
        self.pending.insert(token, record);
        let mut cbp = &cb as *const iocb as *mut iocb;
        let res = unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                self.ctx,
                1 as libc::c_long,
                &mut cbp as *mut *mut iocb,
            )
        };
        match Errno::result(res) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.pending.remove(&token);
                Err(err)
            }
        }
    }

    /// Drain available completions without blocking. Returns how many were
    /// reaped.
    pub(crate) fn reap(&mut self) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        let mut events: [io_event; 64] = unsafe { std::mem::zeroed() };
        let res = unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                self.ctx,
                0 as libc::c_long,
                events.len() as libc::c_long,
                events.as_mut_ptr(),
                std::ptr::null_mut::<libc::timespec>(),
            )
        };
        let n = match Errno::result(res) {
            Ok(n) => n as usize,
            Err(Errno::EINTR) => 0,
            Err(err) => {
                warn!("io_getevents failed: {err}");
                0
            }
        };
        for event in &events[..n] {
            match self.pending.remove(&event.data) {
                Some(record) => record.finish(event.res),
                None => warn!("completion for unknown token {}", event.data),
            }
        }
        n
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for AioEngine {
    fn drop(&mut self) {
        unsafe { libc::syscall(libc::SYS_io_destroy, self.ctx) };
    }
}
