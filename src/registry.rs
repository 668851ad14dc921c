//! Inode registry.
//!
//! Maps protocol inode ids to `O_PATH` anchors on the host tree, with the
//! reference counting the guest kernel drives through lookup and forget.
//! Ids are handles from a monotonically increasing counter, resolved through
//! an indirection table; `Arc` pins each entry so a handle stays valid
//! across table mutation.
//!
//! Lock order: an inode's state lock is acquired before the table lock.
//! There is no path that nests them the other way around: adoption clones
//! the `Arc` out of the table and releases the table lock before touching
//! inode state, and a fresh inode is fully constructed before it is
//! published under the table lock.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::abort;
use std::sync::Arc;

use log::{debug, error};
use nix::errno::Errno;
use parking_lot::Mutex;

use crate::ll::fuse_abi::FUSE_ROOT_ID;

/// The path anchor of an inode.
///
/// `Unlinked` is the "released before last unlink" sentinel: the entry is
/// still referenced by the guest, but its descriptor has been closed so the
/// host may recycle the inode number. A syscall through it fails with the
/// errno a closed descriptor would produce.
#[derive(Debug)]
pub(crate) enum PathFd {
    Open(OwnedFd),
    Unlinked,
}

#[derive(Debug)]
pub(crate) struct InodeState {
    pub(crate) fd: PathFd,
    /// Outstanding lookup references held by the guest kernel.
    pub(crate) nlookup: u64,
    /// Currently-open regular-file handles derived from this inode.
    pub(crate) nopen: u64,
    /// Bumped whenever `fd` transitions to `Unlinked`; paired with the host
    /// inode number it distinguishes a recycled number from the old file.
    pub(crate) generation: u64,
}

#[derive(Debug)]
pub(crate) struct Inode {
    id: u64,
    src_ino: u64,
    src_dev: u64,
    pub(crate) state: Mutex<InodeState>,
}

impl Inode {
    /// Protocol inode id.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn src_ino(&self) -> u64 {
        self.src_ino
    }

    pub(crate) fn src_dev(&self) -> u64 {
        self.src_dev
    }

    /// The raw path-anchor descriptor, for use as the directory argument of
    /// `*at` syscalls or through `/proc/self/fd`. Fails like a closed
    /// descriptor would once the inode has been unlinked.
    pub(crate) fn raw_fd(&self) -> Result<RawFd, Errno> {
        match &self.state.lock().fd {
            PathFd::Open(fd) => Ok(fd.as_raw_fd()),
            PathFd::Unlinked => Err(Errno::EBADF),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}

#[derive(Debug)]
struct TableInner {
    by_id: HashMap<u64, Arc<Inode>>,
    /// Host inode number to protocol id; implements get-or-insert by key.
    by_src: HashMap<u64, u64>,
    next_id: u64,
}

/// The registry: all live inodes plus the pinned root.
#[derive(Debug)]
pub(crate) struct InodeTable {
    inner: Mutex<TableInner>,
    root: Arc<Inode>,
}

impl InodeTable {
    /// Build a registry around the mirror root. The root is pre-registered
    /// under `FUSE_ROOT_ID` with one pinned lookup reference, so it survives
    /// any forget traffic.
    pub(crate) fn new(root_fd: OwnedFd, root_ino: u64, root_dev: u64) -> Self {
        let root = Arc::new(Inode {
            id: FUSE_ROOT_ID,
            src_ino: root_ino,
            src_dev: root_dev,
            state: Mutex::new(InodeState {
                fd: PathFd::Open(root_fd),
                nlookup: 1,
                nopen: 0,
                generation: 0,
            }),
        });
        let mut by_id = HashMap::new();
        let mut by_src = HashMap::new();
        by_id.insert(FUSE_ROOT_ID, root.clone());
        by_src.insert(root_ino, FUSE_ROOT_ID);
        InodeTable {
            inner: Mutex::new(TableInner {
                by_id,
                by_src,
                next_id: FUSE_ROOT_ID + 1,
            }),
            root,
        }
    }

    pub(crate) fn root(&self) -> &Arc<Inode> {
        &self.root
    }

    /// Resolve a protocol inode id to a live entry.
    pub(crate) fn get(&self, id: u64) -> Option<Arc<Inode>> {
        self.inner.lock().by_id.get(&id).cloned()
    }

    /// Register one lookup reference for the host inode `src_ino`, adopting
    /// `fd` as its path anchor if it has none.
    ///
    /// Three cases: a live entry keeps its own anchor and `fd` is closed; an
    /// entry in the unlinked-sentinel state re-adopts `fd` while keeping the
    /// generation bumped at unlink time; an unknown inode number gets a
    /// fresh entry. Returns the entry and the generation to reply with.
    pub(crate) fn adopt(&self, src_ino: u64, src_dev: u64, fd: OwnedFd) -> (Arc<Inode>, u64) {
        let mut fd = Some(fd);
        loop {
            let existing = {
                let inner = self.inner.lock();
                inner
                    .by_src
                    .get(&src_ino)
                    .and_then(|id| inner.by_id.get(id))
                    .cloned()
            };
            match existing {
                Some(inode) => {
                    debug_assert_eq!(inode.src_dev(), src_dev);
                    let mut st = inode.state.lock();
                    if st.nlookup == 0 {
                        // Raced with the final forget; the entry is already
                        // out of the table, so retry and insert fresh.
                        continue;
                    }
                    st.nlookup += 1;
                    if let PathFd::Unlinked = st.fd {
                        debug!(
                            "adopt: inode {} recycled, generation {}",
                            src_ino, st.generation
                        );
                        st.fd = PathFd::Open(fd.take().expect("anchor consumed twice"));
                    }
                    let generation = st.generation;
                    debug!("adopt: inode {} lookup count {}", src_ino, st.nlookup);
                    drop(st);
                    return (inode, generation);
                }
                None => {
                    let mut inner = self.inner.lock();
                    if inner.by_src.contains_key(&src_ino) {
                        // Lost an insertion race; take the existing entry.
                        continue;
                    }
                    let id = inner.next_id;
                    inner.next_id += 1;
                    let inode = Arc::new(Inode {
                        id,
                        src_ino,
                        src_dev,
                        state: Mutex::new(InodeState {
                            fd: PathFd::Open(fd.take().expect("anchor consumed twice")),
                            nlookup: 1,
                            nopen: 0,
                            generation: 0,
                        }),
                    });
                    inner.by_src.insert(src_ino, id);
                    inner.by_id.insert(id, inode.clone());
                    debug!("adopt: created inode {} as id {}", src_ino, id);
                    return (inode, 0);
                }
            }
        }
    }

    /// Drop `n` lookup references. When the count reaches zero the entry is
    /// erased under both locks; the path anchor closes when the last `Arc`
    /// goes away.
    ///
    /// A count underflow means our bookkeeping and the guest's have
    /// diverged; continuing would corrupt every later lookup count, so it
    /// is fatal.
    pub(crate) fn forget(&self, inode: &Arc<Inode>, n: u64) {
        let mut st = inode.state.lock();
        if n > st.nlookup {
            error!(
                "negative lookup count for inode {} ({} - {})",
                inode.src_ino, st.nlookup, n
            );
            abort();
        }
        st.nlookup -= n;
        debug!("forget: inode {} lookup count {}", inode.src_ino, st.nlookup);
        if st.nlookup == 0 {
            let mut inner = self.inner.lock();
            inner.by_id.remove(&inode.id);
            if inner.by_src.get(&inode.src_ino) == Some(&inode.id) {
                inner.by_src.remove(&inode.src_ino);
            }
            debug!("forget: erased inode {}", inode.src_ino);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::thread;

    fn table() -> InodeTable {
        let root = File::open("/").unwrap();
        InodeTable::new(OwnedFd::from(root), 100, 1)
    }

    fn anchor() -> OwnedFd {
        OwnedFd::from(File::open("/dev/null").unwrap())
    }

    #[test]
    fn root_is_pinned() {
        let t = table();
        assert_eq!(t.root().id(), FUSE_ROOT_ID);
        assert_eq!(t.get(FUSE_ROOT_ID).unwrap().src_ino(), 100);
    }

    #[test]
    fn adopt_then_forget_erases_once() {
        let t = table();
        let (a, generation) = t.adopt(555, 1, anchor());
        assert_eq!(generation, 0);
        let (b, _) = t.adopt(555, 1, anchor());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.state.lock().nlookup, 2);
        assert_eq!(t.len(), 2);

        t.forget(&a, 2);
        assert_eq!(t.len(), 1);
        assert!(t.get(a.id()).is_none());
    }

    #[test]
    fn fresh_entry_after_erase_gets_new_id() {
        let t = table();
        let (a, _) = t.adopt(555, 1, anchor());
        let first_id = a.id();
        t.forget(&a, 1);
        let (b, _) = t.adopt(555, 1, anchor());
        assert!(b.id() > first_id);
    }

    #[test]
    fn unlinked_readoption_preserves_bumped_generation() {
        let t = table();
        let (a, generation) = t.adopt(555, 1, anchor());
        assert_eq!(generation, 0);

        // What the unlink handler does when the last link goes away with no
        // open handles: drop the anchor, raise the generation.
        {
            let mut st = a.state.lock();
            st.fd = PathFd::Unlinked;
            st.generation += 1;
        }
        assert_eq!(a.raw_fd().unwrap_err(), Errno::EBADF);

        // The host recycled the inode number; lookup re-adopts.
        let (b, generation) = t.adopt(555, 1, anchor());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(generation, 1);
        assert_eq!(b.generation(), 1);
        assert!(b.raw_fd().is_ok());
        assert_eq!(b.state.lock().nlookup, 2);
    }

    #[test]
    fn concurrent_adopt_forget_settles() {
        let t = Arc::new(table());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = t.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let (inode, _) = t.adopt(777, 1, anchor());
                    t.forget(&inode, 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Every reference was dropped, so only the root remains.
        assert_eq!(t.len(), 1);
    }
}
