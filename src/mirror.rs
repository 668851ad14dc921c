//! The mirror engine: request dispatch and per-opcode handlers.
//!
//! Every handler operates on the host tree through the inode's `O_PATH`
//! anchor, either as the directory argument of an `*at` syscall or reopened
//! through `/proc/self/fd` when actual read/write access is needed. The
//! host's errno is reflected to the guest verbatim; nothing is retried.

use std::ffi::{CString, OsStr};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use libc::iovec;
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::unistd::{Gid, Uid, getegid, geteuid, setegid, seteuid};
use parking_lot::Mutex;

use crate::aio::{AioEngine, AioOp};
use crate::config::Config;
use crate::dir::DirTable;
use crate::iov::{self, OutRegion};
use crate::ll::fuse_abi::{self as abi, FUSE_ROOT_ID, FopenFlags, InitFlags, consts::*};
use crate::ll::reply::{self, DirEntList, DirEntPlusList, EntryParam, OUT_HEADER_SIZE, Reply};
use crate::ll::request::{Operation, Request, RequestError};
use crate::poll;
use crate::registry::{Inode, InodeTable, PathFd};
use crate::session::{CONGESTION_THRESHOLD, MAX_BACKGROUND, MAX_WRITE_SIZE, Session};
use crate::transport::{CompletionCtx, Dispatch};

fn into_io(err: Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

/// Stat a descriptor itself via the empty-path variant, without following
/// a final symlink.
fn stat_fd(fd: RawFd) -> Result<libc::stat, Errno> {
    let mut st = MaybeUninit::<libc::stat>::uninit();
    Errno::result(unsafe {
        libc::fstatat(
            fd,
            c"".as_ptr(),
            st.as_mut_ptr(),
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    })?;
    Ok(unsafe { st.assume_init() })
}

fn cstr(name: &OsStr) -> Result<CString, Errno> {
    CString::new(name.as_bytes()).map_err(|_| Errno::EINVAL)
}

fn proc_self_fd(fd: RawFd) -> CString {
    CString::new(format!("/proc/self/fd/{fd}")).expect("no interior NUL")
}

/// The stateful mirror of one host directory tree.
#[derive(Debug)]
pub struct Mirror {
    session: Session,
    inodes: InodeTable,
    dirs: DirTable,
    /// One async engine per polling thread, routed by thread index.
    aio: Vec<Mutex<AioEngine>>,
}

impl Mirror {
    /// Open the mirror root and set up per-thread async contexts.
    pub fn new(config: &Config) -> io::Result<Mirror> {
        let dir = CString::new(config.mirror.dir.as_os_str().as_bytes())
            .map_err(|_| into_io(Errno::EINVAL))?;
        let fd = Errno::result(unsafe { libc::open(dir.as_ptr(), libc::O_PATH | libc::O_CLOEXEC) })
            .map_err(into_io)?;
        let root_fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let st = stat_fd(root_fd.as_raw_fd()).map_err(into_io)?;
        if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
            return Err(into_io(Errno::ENOTDIR));
        }
        let threads = config.transport.threads.max(1);
        let mut aio = Vec::with_capacity(threads);
        for _ in 0..threads {
            aio.push(Mutex::new(AioEngine::new(config.transport.queue_depth)?));
        }
        info!(
            "mirroring {} (host device {})",
            config.mirror.dir.display(),
            st.st_dev
        );
        Ok(Mirror {
            session: Session::new(config.mirror.metadata_timeout, st.st_dev),
            inodes: InodeTable::new(root_fd, st.st_ino, st.st_dev),
            dirs: DirTable::new(),
            aio,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Reap async completions for one polling thread. Called by the poll
    /// loop on every iteration.
    pub fn poll_completions(&self, thread_index: usize) -> usize {
        match self.aio.get(thread_index) {
            Some(engine) => engine.lock().reap(),
            None => 0,
        }
    }

    /// Transport-facing entry point: decode the request in the input
    /// descriptors, perform it, and either write the reply into the output
    /// descriptors (`Sync`) or owe it to the completion context
    /// (`Deferred`).
    ///
    /// # Safety
    ///
    /// Both descriptor arrays must describe memory that is valid (and
    /// writable, for the output side) until this call returns or, for a
    /// deferred request, until the completion context has been invoked.
    pub unsafe fn handle_request(
        &self,
        in_iov: &[iovec],
        out_iov: &[iovec],
        ctx: CompletionCtx,
    ) -> Dispatch {
        let Some(first) = in_iov.first() else {
            return Dispatch::Failed(Errno::EINVAL);
        };
        let data = unsafe { std::slice::from_raw_parts(first.iov_base as *const u8, first.iov_len) };
        let out = unsafe { OutRegion::new(out_iov) };
        let request = match Request::parse(data) {
            Ok(request) => request,
            Err(RequestError::UnknownOpcode { opcode, unique }) => {
                debug!("unimplemented opcode {opcode}");
                return Dispatch::Sync(reply::send(&out, unique, Err(Errno::ENOSYS)));
            }
            Err(err) => {
                warn!("dropping unparseable request: {err}");
                return Dispatch::Failed(Errno::EINVAL);
            }
        };
        debug!("{request}");
        self.dispatch(&request, in_iov, out, ctx)
    }

    fn dispatch(
        &self,
        request: &Request<'_>,
        in_iov: &[iovec],
        out: OutRegion,
        ctx: CompletionCtx,
    ) -> Dispatch {
        let unique = request.unique();
        match request.operation() {
            Operation::Init { arg } => {
                let result = self.op_init(request.uid(), request.gid(), arg);
                Dispatch::Sync(reply::send(&out, unique, result))
            }
            _ if !self.session.is_initialized() || self.session.is_destroyed() => {
                warn!("request outside session lifetime: {request}");
                Dispatch::Sync(reply::send(&out, unique, Err(Errno::EIO)))
            }
            Operation::Destroy => {
                self.session.set_destroyed();
                Dispatch::Sync(reply::send(&out, unique, Ok(Reply::Empty)))
            }
            // Forgets carry no reply; the descriptor chain completes empty.
            Operation::Forget { arg } => {
                self.op_forget(request.nodeid(), arg.nlookup);
                Dispatch::Sync(0)
            }
            Operation::BatchForget { nodes } => {
                for node in *nodes {
                    self.op_forget(node.nodeid, node.nlookup);
                }
                Dispatch::Sync(0)
            }
            Operation::Read { arg } => self.op_read(unique, arg, out, ctx),
            Operation::Write { arg } => {
                self.op_write(unique, arg, in_iov, request.body_offset(), out, ctx)
            }
            op => {
                let result = self.op_sync(request, op, &out);
                if let Err(err) = &result {
                    if matches!(err, Errno::ENFILE | Errno::EMFILE) {
                        error!("reached maximum number of file descriptors");
                    }
                }
                Dispatch::Sync(reply::send(&out, unique, result))
            }
        }
    }

    fn op_sync(
        &self,
        request: &Request<'_>,
        op: &Operation<'_>,
        out: &OutRegion,
    ) -> Result<Reply, Errno> {
        let nodeid = request.nodeid();
        match op {
            Operation::Lookup { name } => self.op_lookup(nodeid, name),
            Operation::Getattr { .. } => self.op_getattr(nodeid),
            Operation::Setattr { arg } => self.op_setattr(nodeid, arg),
            Operation::Symlink { name, link } => self.op_symlink(nodeid, name, link),
            Operation::Mknod { arg, name } => self.op_mknod(nodeid, arg, name),
            Operation::Mkdir { arg, name } => self.op_mkdir(nodeid, arg, name),
            Operation::Unlink { name } => self.op_unlink(nodeid, name),
            Operation::Rmdir { name } => self.op_rmdir(nodeid, name),
            Operation::Rename { arg, name, newname } => {
                self.op_rename(nodeid, name, arg.newdir, newname)
            }
            Operation::Open { arg } => self.op_open(nodeid, arg),
            Operation::Statfs => self.op_statfs(nodeid),
            Operation::Release { arg } => self.op_release(nodeid, arg),
            Operation::Fsync { arg } => self.op_fsync(arg),
            Operation::Flush { arg } => self.op_flush(arg),
            Operation::Opendir { .. } => self.op_opendir(nodeid),
            Operation::Readdir { arg } => self.op_readdir(nodeid, arg, false, out),
            Operation::Releasedir { arg } => self.op_releasedir(arg),
            Operation::Fsyncdir { arg } => self.op_fsyncdir(arg),
            Operation::Setlk { arg, sleep } => self.op_setlk(arg, *sleep),
            Operation::Create { arg, name } => self.op_create(nodeid, arg, name),
            Operation::Fallocate { arg } => self.op_fallocate(arg),
            Operation::Readdirplus { arg } => self.op_readdir(nodeid, arg, true, out),
            Operation::Init { .. }
            | Operation::Forget { .. }
            | Operation::BatchForget { .. }
            | Operation::Read { .. }
            | Operation::Write { .. }
            | Operation::Destroy => unreachable!("handled in dispatch"),
        }
    }

    fn inode(&self, nodeid: u64) -> Result<Arc<Inode>, Errno> {
        if nodeid == FUSE_ROOT_ID {
            return Ok(self.inodes.root().clone());
        }
        self.inodes.get(nodeid).ok_or(Errno::EINVAL)
    }

    /// Resolve `name` under an open parent descriptor and register one
    /// lookup reference for the result.
    fn do_lookup_at(&self, parent_fd: RawFd, name: &OsStr) -> Result<EntryParam, Errno> {
        let cname = cstr(name)?;
        let fd = Errno::result(unsafe {
            libc::openat(
                parent_fd,
                cname.as_ptr(),
                libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            )
        })?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let st = stat_fd(fd.as_raw_fd())?;
        if st.st_dev != self.session.src_dev() {
            warn!("hiding {name:?}: mount points in the source tree are not mirrored");
            return Err(Errno::ENOTSUP);
        }
        if st.st_ino == FUSE_ROOT_ID {
            error!("source tree must not contain inode number {FUSE_ROOT_ID}");
            return Err(Errno::EIO);
        }
        let (inode, generation) = self.inodes.adopt(st.st_ino, st.st_dev, fd);
        Ok(EntryParam {
            ino: inode.id(),
            generation,
            attr: st,
        })
    }

    fn do_lookup(&self, parent: &Inode, name: &OsStr) -> Result<EntryParam, Errno> {
        self.do_lookup_at(parent.raw_fd()?, name)
    }

    fn forget_ino(&self, nodeid: u64, nlookup: u64) {
        self.op_forget(nodeid, nlookup);
    }

    fn op_forget(&self, nodeid: u64, nlookup: u64) {
        match self.inodes.get(nodeid) {
            Some(inode) => self.inodes.forget(&inode, nlookup),
            None => {
                // The guest forgot something we never handed out; lookup
                // counts are corrupt and no later reply can be trusted.
                error!("forget for unknown inode id {nodeid}");
                std::process::abort();
            }
        }
    }

    fn op_init(&self, uid: u32, gid: u32, arg: &abi::fuse_init_in) -> Result<Reply, Errno> {
        if arg.major < 7 || (arg.major == 7 && arg.minor < 27) {
            error!("unsupported FUSE ABI version {}.{}", arg.major, arg.minor);
            return Err(Errno::EPROTO);
        }
        let capable = InitFlags::from_bits_truncate(arg.flags);
        let mut want = InitFlags::empty();
        if capable.contains(InitFlags::ASYNC_READ) {
            want |= InitFlags::ASYNC_READ;
        }
        if capable.contains(InitFlags::EXPORT_SUPPORT) {
            want |= InitFlags::EXPORT_SUPPORT;
        }
        if self.session.writeback() && capable.contains(InitFlags::WRITEBACK_CACHE) {
            want |= InitFlags::WRITEBACK_CACHE;
        }
        if capable.contains(InitFlags::FLOCK_LOCKS) {
            want |= InitFlags::FLOCK_LOCKS;
        }
        if capable.contains(InitFlags::DO_READDIRPLUS) {
            want |= InitFlags::DO_READDIRPLUS;
            if capable.contains(InitFlags::READDIRPLUS_AUTO) {
                want |= InitFlags::READDIRPLUS_AUTO;
            }
        }
        if capable.contains(InitFlags::PARALLEL_DIROPS) {
            want |= InitFlags::PARALLEL_DIROPS;
        }
        if capable.contains(InitFlags::MAX_PAGES) {
            want |= InitFlags::MAX_PAGES;
        }
        // Splice is never requested: there is no pipe to splice through on
        // a shared-memory transport.

        if uid != 0 && gid != 0 {
            // gid first; dropping the uid first would cost the privilege
            // needed to change the gid.
            setegid(Gid::from_raw(gid)).inspect_err(|e| {
                warn!("could not set egid of mirror to {gid}: {e}");
            })?;
            seteuid(Uid::from_raw(uid)).inspect_err(|e| {
                warn!("could not set euid of mirror to {uid}: {e}");
            })?;
        } else {
            info!(
                "init carried no credentials; all operations run as uid {} gid {}",
                geteuid(),
                getegid()
            );
        }

        self.session.set_negotiated(want);
        debug!("init: negotiated {want:?}");
        let max_pages = (MAX_WRITE_SIZE / page_size::get()).min(256) as u16;
        Ok(Reply::Init(abi::fuse_init_out {
            major: abi::FUSE_KERNEL_VERSION,
            minor: abi::FUSE_KERNEL_MINOR_VERSION,
            max_readahead: arg.max_readahead,
            flags: want.bits(),
            max_background: MAX_BACKGROUND,
            congestion_threshold: CONGESTION_THRESHOLD,
            max_write: MAX_WRITE_SIZE as u32,
            time_gran: 1,
            max_pages,
            map_alignment: 0,
            flags2: 0,
            reserved: [0; 7],
        }))
    }

    fn op_lookup(&self, parent: u64, name: &OsStr) -> Result<Reply, Errno> {
        let parent = self.inode(parent)?;
        match self.do_lookup(&parent, name) {
            Ok(entry) => Ok(Reply::Entry(reply::entry_out(&entry, self.session.timeout()))),
            // A miss is not an error: replying with node id 0 lets the
            // guest cache the negative entry.
            Err(Errno::ENOENT) => Ok(Reply::Entry(reply::negative_entry_out(
                self.session.timeout(),
            ))),
            Err(err) => Err(err),
        }
    }

    fn op_getattr(&self, nodeid: u64) -> Result<Reply, Errno> {
        let inode = self.inode(nodeid)?;
        let st = stat_fd(inode.raw_fd()?)?;
        Ok(Reply::Attr(reply::attr_out(&st, self.session.timeout())))
    }

    fn op_setattr(&self, nodeid: u64, arg: &abi::fuse_setattr_in) -> Result<Reply, Errno> {
        let inode = self.inode(nodeid)?;
        let ifd = inode.raw_fd()?;
        let fh = (arg.valid & FATTR_FH != 0).then_some(arg.fh as RawFd);

        if arg.valid & FATTR_MODE != 0 {
            match fh {
                Some(fd) => {
                    Errno::result(unsafe { libc::fchmod(fd, arg.mode as libc::mode_t) })?;
                }
                None => {
                    let path = proc_self_fd(ifd);
                    Errno::result(unsafe { libc::chmod(path.as_ptr(), arg.mode as libc::mode_t) })?;
                }
            }
        }
        if arg.valid & (FATTR_UID | FATTR_GID) != 0 {
            let uid = if arg.valid & FATTR_UID != 0 { arg.uid } else { u32::MAX };
            let gid = if arg.valid & FATTR_GID != 0 { arg.gid } else { u32::MAX };
            Errno::result(unsafe {
                libc::fchownat(
                    ifd,
                    c"".as_ptr(),
                    uid,
                    gid,
                    libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
                )
            })?;
        }
        if arg.valid & FATTR_SIZE != 0 {
            match fh {
                Some(fd) => {
                    Errno::result(unsafe { libc::ftruncate(fd, arg.size as libc::off_t) })?;
                }
                None => {
                    let path = proc_self_fd(ifd);
                    Errno::result(unsafe {
                        libc::truncate(path.as_ptr(), arg.size as libc::off_t)
                    })?;
                }
            }
        }
        if arg.valid & (FATTR_ATIME | FATTR_MTIME | FATTR_ATIME_NOW | FATTR_MTIME_NOW) != 0 {
            let mut tv = [libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            }; 2];
            if arg.valid & FATTR_ATIME_NOW != 0 {
                tv[0].tv_nsec = libc::UTIME_NOW;
            } else if arg.valid & FATTR_ATIME != 0 {
                tv[0] = libc::timespec {
                    tv_sec: arg.atime as libc::time_t,
                    tv_nsec: arg.atimensec as libc::c_long,
                };
            }
            if arg.valid & FATTR_MTIME_NOW != 0 {
                tv[1].tv_nsec = libc::UTIME_NOW;
            } else if arg.valid & FATTR_MTIME != 0 {
                tv[1] = libc::timespec {
                    tv_sec: arg.mtime as libc::time_t,
                    tv_nsec: arg.mtimensec as libc::c_long,
                };
            }
            match fh {
                Some(fd) => {
                    Errno::result(unsafe { libc::futimens(fd, tv.as_ptr()) })?;
                }
                None => {
                    let path = proc_self_fd(ifd);
                    Errno::result(unsafe {
                        libc::utimensat(libc::AT_FDCWD, path.as_ptr(), tv.as_ptr(), 0)
                    })?;
                }
            }
        }

        let st = stat_fd(ifd)?;
        Ok(Reply::Attr(reply::attr_out(&st, self.session.timeout())))
    }

    fn op_open(&self, nodeid: u64, arg: &abi::fuse_open_in) -> Result<Reply, Errno> {
        let inode = self.inode(nodeid)?;
        // The handle feeds the async engine, and io_submit completes a
        // buffered transfer synchronously inside the submitting syscall.
        // Reopen with O_DIRECT instead of the client's access mode so the
        // data plane never blocks the poll thread.
        let mut flags = libc::O_RDWR | libc::O_DIRECT;
        debug!("open: client flags {:#x}, reopening O_RDWR|O_DIRECT", arg.flags);
        if self.session.writeback() {
            // With writeback caching the kernel may issue reads even for a
            // write-only open, and handles O_APPEND itself.
            if flags & libc::O_ACCMODE == libc::O_WRONLY {
                flags = (flags & !libc::O_ACCMODE) | libc::O_RDWR;
            }
            flags &= !libc::O_APPEND;
        }
        // The anchor was opened O_PATH, so reopen through the per-process
        // fd namespace to gain data access.
        let path = proc_self_fd(inode.raw_fd()?);
        let fd = Errno::result(unsafe { libc::open(path.as_ptr(), flags & !libc::O_NOFOLLOW) })?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        inode.state.lock().nopen += 1;

        let mut open_flags = FopenFlags::empty();
        if self.session.timeout() != 0.0 {
            open_flags |= FopenFlags::KEEP_CACHE;
        }
        if self.session.timeout() == 0.0 && flags & libc::O_ACCMODE == libc::O_RDONLY {
            open_flags |= FopenFlags::NOFLUSH;
        }
        Ok(Reply::Open(abi::fuse_open_out {
            fh: fd.into_raw_fd() as u64,
            open_flags: open_flags.bits(),
            padding: 0,
        }))
    }

    fn op_release(&self, nodeid: u64, arg: &abi::fuse_release_in) -> Result<Reply, Errno> {
        let inode = self.inode(nodeid)?;
        {
            let mut st = inode.state.lock();
            st.nopen = st.nopen.saturating_sub(1);
        }
        // The handle value is the raw descriptor we echoed at open time.
        drop(unsafe { OwnedFd::from_raw_fd(arg.fh as RawFd) });
        Ok(Reply::Empty)
    }

    fn op_create(&self, nodeid: u64, arg: &abi::fuse_create_in, name: &OsStr) -> Result<Reply, Errno> {
        let parent = self.inode(nodeid)?;
        let parent_fd = parent.raw_fd()?;
        let cname = cstr(name)?;
        let flags = (arg.flags | libc::O_CREAT) & !libc::O_NOFOLLOW;
        let fd = Errno::result(unsafe {
            libc::openat(parent_fd, cname.as_ptr(), flags, arg.mode as libc::c_uint)
        })?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let entry = self.do_lookup_at(parent_fd, name)?;
        if let Some(inode) = self.inodes.get(entry.ino) {
            inode.state.lock().nopen += 1;
        }
        Ok(Reply::Create(abi::fuse_create_out(
            reply::entry_out(&entry, self.session.timeout()),
            abi::fuse_open_out {
                fh: fd.into_raw_fd() as u64,
                open_flags: 0,
                padding: 0,
            },
        )))
    }

    fn op_unlink(&self, nodeid: u64, name: &OsStr) -> Result<Reply, Errno> {
        let parent = self.inode(nodeid)?;
        let parent_fd = parent.raw_fd()?;
        if !self.session.writeback() {
            // Release the anchor before the last unlink, like nfsd's
            // CLOSE_BEFORE_UNLINK, so a recycled inode number is
            // recognizable by its bumped generation. Skipped while a handle
            // is open or another link remains.
            let entry = self.do_lookup_at(parent_fd, name)?;
            if entry.attr.st_nlink == 1 {
                let inode = self.inodes.get(entry.ino).ok_or(Errno::EINVAL)?;
                let mut st = inode.state.lock();
                if st.nopen == 0 {
                    if let PathFd::Open(_) = st.fd {
                        debug!("unlink: releasing anchor of inode {}", inode.src_ino());
                        st.fd = PathFd::Unlinked;
                        st.generation += 1;
                    }
                }
            }
            // Drop the reference the pre-check lookup added.
            self.forget_ino(entry.ino, 1);
        }
        let cname = cstr(name)?;
        Errno::result(unsafe { libc::unlinkat(parent_fd, cname.as_ptr(), 0) })?;
        Ok(Reply::Empty)
    }

    fn op_rmdir(&self, nodeid: u64, name: &OsStr) -> Result<Reply, Errno> {
        let parent = self.inode(nodeid)?;
        let parent_fd = parent.raw_fd()?;
        let cname = cstr(name)?;
        let _guard = parent.state.lock();
        Errno::result(unsafe { libc::unlinkat(parent_fd, cname.as_ptr(), libc::AT_REMOVEDIR) })?;
        Ok(Reply::Empty)
    }

    fn op_rename(
        &self,
        nodeid: u64,
        name: &OsStr,
        new_parent: u64,
        newname: &OsStr,
    ) -> Result<Reply, Errno> {
        let old_parent = self.inode(nodeid)?;
        let new_parent = self.inode(new_parent)?;
        let old_name = cstr(name)?;
        let new_name = cstr(newname)?;
        Errno::result(unsafe {
            libc::renameat(
                old_parent.raw_fd()?,
                old_name.as_ptr(),
                new_parent.raw_fd()?,
                new_name.as_ptr(),
            )
        })?;
        Ok(Reply::Empty)
    }

    fn make_node(
        &self,
        nodeid: u64,
        name: &OsStr,
        create: impl FnOnce(RawFd, &CString) -> Result<(), Errno>,
    ) -> Result<Reply, Errno> {
        let parent = self.inode(nodeid)?;
        let parent_fd = parent.raw_fd()?;
        let cname = cstr(name)?;
        create(parent_fd, &cname)?;
        let entry = self.do_lookup_at(parent_fd, name)?;
        Ok(Reply::Entry(reply::entry_out(&entry, self.session.timeout())))
    }

    fn op_mkdir(&self, nodeid: u64, arg: &abi::fuse_mkdir_in, name: &OsStr) -> Result<Reply, Errno> {
        self.make_node(nodeid, name, |fd, cname| {
            Errno::result(unsafe { libc::mkdirat(fd, cname.as_ptr(), arg.mode as libc::mode_t) })
                .map(drop)
        })
    }

    fn op_symlink(&self, nodeid: u64, name: &OsStr, link: &OsStr) -> Result<Reply, Errno> {
        let target = cstr(link)?;
        self.make_node(nodeid, name, |fd, cname| {
            Errno::result(unsafe { libc::symlinkat(target.as_ptr(), fd, cname.as_ptr()) }).map(drop)
        })
    }

    fn op_mknod(&self, nodeid: u64, arg: &abi::fuse_mknod_in, name: &OsStr) -> Result<Reply, Errno> {
        self.make_node(nodeid, name, |fd, cname| {
            Errno::result(unsafe {
                libc::mknodat(
                    fd,
                    cname.as_ptr(),
                    arg.mode as libc::mode_t,
                    arg.rdev as libc::dev_t,
                )
            })
            .map(drop)
        })
    }

    fn op_statfs(&self, nodeid: u64) -> Result<Reply, Errno> {
        let inode = self.inode(nodeid)?;
        let fd = inode.raw_fd()?;
        let mut sv = MaybeUninit::<libc::statvfs>::uninit();
        Errno::result(unsafe { libc::fstatvfs(fd, sv.as_mut_ptr()) })?;
        let sv = unsafe { sv.assume_init() };
        Ok(Reply::Statfs(reply::statfs_out(&sv)))
    }

    fn op_opendir(&self, nodeid: u64) -> Result<Reply, Errno> {
        let inode = self.inode(nodeid)?;
        let fh = self.dirs.open(inode.raw_fd()?)?;
        let mut open_flags = FopenFlags::empty();
        if self.session.timeout() != 0.0 {
            open_flags |= FopenFlags::KEEP_CACHE | FopenFlags::CACHE_DIR;
        }
        Ok(Reply::Open(abi::fuse_open_out {
            fh,
            open_flags: open_flags.bits(),
            padding: 0,
        }))
    }

    fn op_releasedir(&self, arg: &abi::fuse_release_in) -> Result<Reply, Errno> {
        self.dirs.close(arg.fh)?;
        Ok(Reply::Empty)
    }

    fn op_readdir(
        &self,
        nodeid: u64,
        arg: &abi::fuse_read_in,
        plus: bool,
        out: &OutRegion,
    ) -> Result<Reply, Errno> {
        let inode = self.inode(nodeid)?;
        let parent_fd = inode.raw_fd()?;
        let handle = self.dirs.get(arg.fh).ok_or(Errno::EBADF)?;
        let max = (arg.size as usize).min(out.len().saturating_sub(OUT_HEADER_SIZE));
        let mut plain = DirEntList::new(max);
        let mut with_entries = DirEntPlusList::new(max);

        // The offset cache is guarded by the inode lock, like the counts.
        let _guard = inode.state.lock();
        let mut stream = handle.stream.lock();
        if arg.offset != stream.offset {
            debug!("readdir: seeking to {}", arg.offset);
            stream.seek(arg.offset);
        }

        let mut failure = None;
        loop {
            let entry = match stream.next() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            if entry.is_dot_or_dotdot() {
                continue;
            }
            if plus {
                let ep = match self.do_lookup_at(parent_fd, OsStr::from_bytes(&entry.name)) {
                    Ok(ep) => ep,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                };
                let eo = reply::entry_out(&ep, self.session.timeout());
                if with_entries.push(&eo, entry.off, &entry.name) {
                    // Buffer full: roll back the lookup just performed so
                    // the guest's count matches the entries it received.
                    self.forget_ino(ep.ino, 1);
                    break;
                }
            } else if plain.push(entry.ino, entry.off, entry.typ as u32, &entry.name) {
                break;
            }
        }

        if let Some(err) = failure {
            let empty = if plus { with_entries.is_empty() } else { plain.is_empty() };
            if empty {
                return Err(err);
            }
            // An error can only be signaled before any entry is buffered;
            // afterwards it would desync the guest's lookup counts, so
            // return what was collected.
            debug!("readdir: suppressing {err} after partial progress");
        }
        Ok(if plus {
            Reply::DirentsPlus(with_entries)
        } else {
            Reply::Dirents(plain)
        })
    }

    fn op_fsync(&self, arg: &abi::fuse_fsync_in) -> Result<Reply, Errno> {
        let fd = arg.fh as RawFd;
        if arg.fsync_flags & FUSE_FSYNC_FDATASYNC != 0 {
            Errno::result(unsafe { libc::fdatasync(fd) })?;
        } else {
            Errno::result(unsafe { libc::fsync(fd) })?;
        }
        Ok(Reply::Empty)
    }

    fn op_fsyncdir(&self, arg: &abi::fuse_fsync_in) -> Result<Reply, Errno> {
        let handle = self.dirs.get(arg.fh).ok_or(Errno::EBADF)?;
        let fd = handle.stream.lock().dir_fd();
        if arg.fsync_flags & FUSE_FSYNC_FDATASYNC != 0 {
            Errno::result(unsafe { libc::fdatasync(fd) })?;
        } else {
            Errno::result(unsafe { libc::fsync(fd) })?;
        }
        Ok(Reply::Empty)
    }

    fn op_flush(&self, arg: &abi::fuse_flush_in) -> Result<Reply, Errno> {
        // Closing a duplicate releases the caller's POSIX locks without
        // giving up the descriptor itself.
        Errno::result(unsafe { libc::close(libc::dup(arg.fh as RawFd)) })?;
        Ok(Reply::Empty)
    }

    fn op_setlk(&self, arg: &abi::fuse_lk_in, sleep: bool) -> Result<Reply, Errno> {
        if arg.lk_flags & FUSE_LK_FLOCK == 0 {
            // Only flock passthrough is negotiated, not POSIX locks.
            return Err(Errno::ENOSYS);
        }
        let mut op = match arg.lk.typ {
            t if t == libc::F_RDLCK => libc::LOCK_SH,
            t if t == libc::F_WRLCK => libc::LOCK_EX,
            t if t == libc::F_UNLCK => libc::LOCK_UN,
            _ => return Err(Errno::EINVAL),
        };
        if !sleep {
            op |= libc::LOCK_NB;
        }
        Errno::result(unsafe { libc::flock(arg.fh as RawFd, op) })?;
        Ok(Reply::Empty)
    }

    fn op_fallocate(&self, arg: &abi::fuse_fallocate_in) -> Result<Reply, Errno> {
        Errno::result(unsafe {
            libc::fallocate(
                arg.fh as RawFd,
                arg.mode,
                arg.offset as libc::off_t,
                arg.length as libc::off_t,
            )
        })?;
        Ok(Reply::Empty)
    }

    fn engine(&self) -> &Mutex<AioEngine> {
        let index = poll::thread_index();
        &self.aio[index.min(self.aio.len() - 1)]
    }

    fn op_read(
        &self,
        unique: u64,
        arg: &abi::fuse_read_in,
        out: OutRegion,
        ctx: CompletionCtx,
    ) -> Dispatch {
        // The kernel transfers straight into descriptor memory, after the
        // space reserved for the response header.
        let iovs = out.tail(OUT_HEADER_SIZE, arg.size as usize);
        let result = self.engine().lock().submit(
            arg.fh as RawFd,
            arg.offset,
            AioOp::Read,
            iovs,
            unique,
            out.clone(),
            ctx,
        );
        match result {
            Ok(()) => Dispatch::Deferred,
            Err(err) => Dispatch::Sync(reply::send(&out, unique, Err(err))),
        }
    }

    fn op_write(
        &self,
        unique: u64,
        arg: &abi::fuse_write_in,
        in_iov: &[iovec],
        body_offset: usize,
        out: OutRegion,
        ctx: CompletionCtx,
    ) -> Dispatch {
        // Payload starts right after the typed body in the input
        // descriptors, possibly spanning several of them.
        let iovs = iov::tail(in_iov, body_offset, arg.size as usize);
        let result = self.engine().lock().submit(
            arg.fh as RawFd,
            arg.offset,
            AioOp::Write,
            iovs,
            unique,
            out.clone(),
            ctx,
        );
        match result {
            Ok(()) => Dispatch::Deferred,
            Err(err) => Dispatch::Sync(reply::send(&out, unique, Err(err))),
        }
    }
}
