//! Directory handle table.
//!
//! An opened directory wraps a host dir stream obtained by opening "."
//! under the inode's path anchor, plus the `d_off` cookie of the last entry
//! returned. The handle's table key is what the guest echoes back as the
//! file-handle value on readdir/fsyncdir/releasedir.

use std::collections::HashMap;
use std::ffi::CStr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::errno::Errno;
use parking_lot::Mutex;

/// One entry as read from the host stream.
#[derive(Debug)]
pub(crate) struct HostDirent {
    pub(crate) ino: u64,
    pub(crate) off: i64,
    pub(crate) typ: u8,
    pub(crate) name: Vec<u8>,
}

impl HostDirent {
    pub(crate) fn is_dot_or_dotdot(&self) -> bool {
        self.name == b"." || self.name == b".."
    }
}

/// The host dir stream with its cached read position.
#[derive(Debug)]
pub(crate) struct DirStream {
    dp: *mut libc::DIR,
    /// `d_off` of the last entry handed out; readdir seeks only when the
    /// guest-supplied offset differs.
    pub(crate) offset: i64,
}

// The stream pointer is only touched under the handle's mutex.
unsafe impl Send for DirStream {}

impl DirStream {
    pub(crate) fn dir_fd(&self) -> RawFd {
        unsafe { libc::dirfd(self.dp) }
    }

    pub(crate) fn seek(&mut self, off: i64) {
        unsafe { libc::seekdir(self.dp, off) };
        self.offset = off;
    }

    /// Next entry, or `None` at end of stream. Advances the cached offset.
    pub(crate) fn next(&mut self) -> Result<Option<HostDirent>, Errno> {
        Errno::clear();
        let entry = unsafe { libc::readdir(self.dp) };
        if entry.is_null() {
            return match Errno::last_raw() {
                0 => Ok(None),
                e => Err(Errno::from_raw(e)),
            };
        }
        let entry = unsafe { &*entry };
        self.offset = entry.d_off;
        let name = unsafe { CStr::from_ptr(entry.d_name.as_ptr()) };
        Ok(Some(HostDirent {
            ino: entry.d_ino,
            off: entry.d_off,
            typ: entry.d_type,
            name: name.to_bytes().to_vec(),
        }))
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dp) };
    }
}

#[derive(Debug)]
pub(crate) struct DirHandle {
    pub(crate) stream: Mutex<DirStream>,
}

#[derive(Debug, Default)]
pub(crate) struct DirTable {
    map: Mutex<HashMap<u64, Arc<DirHandle>>>,
    next: AtomicU64,
}

impl DirTable {
    pub(crate) fn new() -> Self {
        DirTable {
            map: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    /// Open a stream on the directory behind `dir_fd` and allocate a handle
    /// for it.
    pub(crate) fn open(&self, dir_fd: RawFd) -> Result<u64, Errno> {
        let fd = Errno::result(unsafe {
            libc::openat(dir_fd, c".".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC)
        })?;
        let dp = unsafe { libc::fdopendir(fd) };
        if dp.is_null() {
            let err = Errno::last();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        // On success the stream owns fd and closes it with closedir.
        let handle = Arc::new(DirHandle {
            stream: Mutex::new(DirStream { dp, offset: 0 }),
        });
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.map.lock().insert(fh, handle);
        Ok(fh)
    }

    pub(crate) fn get(&self, fh: u64) -> Option<Arc<DirHandle>> {
        self.map.lock().get(&fh).cloned()
    }

    pub(crate) fn close(&self, fh: u64) -> Result<(), Errno> {
        self.map.lock().remove(&fh).map(|_| ()).ok_or(Errno::EBADF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::fd::AsRawFd;

    #[test]
    fn stream_lists_and_seeks() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a"), b"").unwrap();
        std::fs::write(tmp.path().join("b"), b"").unwrap();

        let dir = File::open(tmp.path()).unwrap();
        let table = DirTable::new();
        let fh = table.open(dir.as_raw_fd()).unwrap();
        let handle = table.get(fh).unwrap();

        let mut stream = handle.stream.lock();
        let mut names = Vec::new();
        let mut offsets = Vec::new();
        while let Some(ent) = stream.next().unwrap() {
            if !ent.is_dot_or_dotdot() {
                names.push(ent.name.clone());
                offsets.push(ent.off);
            }
        }
        names.sort();
        assert_eq!(names, vec![b"a".to_vec(), b"b".to_vec()]);

        // Seeking back to the first real entry's cookie replays from there.
        stream.seek(offsets[0]);
        let mut replay = 0;
        while let Some(ent) = stream.next().unwrap() {
            if !ent.is_dot_or_dotdot() {
                replay += 1;
            }
        }
        assert_eq!(replay, 1);
        drop(stream);

        table.close(fh).unwrap();
        assert!(table.get(fh).is_none());
        assert_eq!(table.close(fh), Err(Errno::EBADF));
    }
}
