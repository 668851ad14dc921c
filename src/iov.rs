//! Scatter-gather views over the transport's descriptor arrays.
//!
//! The transport hands every request a list of input descriptors (request
//! bytes) and output descriptors (writable reply space) as `libc::iovec`
//! arrays. Replies are written sequentially across the output segments;
//! the async read/write path needs sub-ranges of either side expressed as
//! iovec arrays again, so the kernel can transfer straight into descriptor
//! memory. This module is the only place that dereferences the raw
//! pointers; everything above it works with byte offsets.

use std::fmt;

use libc::iovec;
use smallvec::SmallVec;

pub(crate) type IovList = SmallVec<[iovec; 4]>;

/// Total byte length of a descriptor array.
pub(crate) fn region_len(segs: &[iovec]) -> usize {
    segs.iter().map(|s| s.iov_len).sum()
}

/// The sub-region starting `skip` bytes in, clamped to `limit` bytes,
/// expressed as a fresh iovec array over the same memory.
pub(crate) fn tail(segs: &[iovec], mut skip: usize, mut limit: usize) -> IovList {
    let mut out = IovList::new();
    for seg in segs {
        if limit == 0 {
            break;
        }
        if skip >= seg.iov_len {
            skip -= seg.iov_len;
            continue;
        }
        let take = (seg.iov_len - skip).min(limit);
        out.push(iovec {
            iov_base: unsafe { seg.iov_base.cast::<u8>().add(skip) }.cast(),
            iov_len: take,
        });
        limit -= take;
        skip = 0;
    }
    out
}

/// Writable reply region of one request.
///
/// Holds copies of the output descriptor entries, so it can outlive the
/// dispatch call when a request defers; the transport keeps the memory
/// itself valid until the completion callback runs.
#[derive(Clone)]
pub(crate) struct OutRegion {
    segs: IovList,
    len: usize,
}

// The raw segment pointers target transport descriptor memory, which the
// transport contract keeps valid and unaliased for the lifetime of the
// request on whichever thread finishes it.
unsafe impl Send for OutRegion {}

impl OutRegion {
    /// # Safety
    ///
    /// Every segment must point to writable memory that remains valid until
    /// the request completes, either synchronously or through the deferred
    /// completion callback.
    pub(crate) unsafe fn new(segs: &[iovec]) -> Self {
        OutRegion {
            segs: SmallVec::from_slice(segs),
            len: region_len(segs),
        }
    }

    /// Total writable capacity in bytes.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Scatter `bytes` into the region starting at byte offset `off`.
    /// Returns how many bytes fit.
    pub(crate) fn write_at(&self, off: usize, bytes: &[u8]) -> usize {
        let mut skip = off;
        let mut src = bytes;
        let mut written = 0;
        for seg in &self.segs {
            if src.is_empty() {
                break;
            }
            if skip >= seg.iov_len {
                skip -= seg.iov_len;
                continue;
            }
            let take = (seg.iov_len - skip).min(src.len());
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    seg.iov_base.cast::<u8>().add(skip),
                    take,
                );
            }
            src = &src[take..];
            written += take;
            skip = 0;
        }
        written
    }

    /// The writable sub-region after `skip` bytes, clamped to `limit`.
    pub(crate) fn tail(&self, skip: usize, limit: usize) -> IovList {
        tail(&self.segs, skip, limit)
    }
}

impl fmt::Debug for OutRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutRegion {{ segs: {}, len: {} }}", self.segs.len(), self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iov_of(buf: &mut [u8]) -> iovec {
        iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        }
    }

    #[test]
    fn write_spans_segments() {
        let mut a = vec![0u8; 4];
        let mut b = vec![0u8; 8];
        let segs = [iov_of(&mut a), iov_of(&mut b)];
        let region = unsafe { OutRegion::new(&segs) };
        assert_eq!(region.len(), 12);

        let n = region.write_at(2, b"hello");
        assert_eq!(n, 5);
        assert_eq!(&a, &[0, 0, b'h', b'e']);
        assert_eq!(&b[..3], b"llo");
    }

    #[test]
    fn write_truncates_at_capacity() {
        let mut a = vec![0u8; 3];
        let segs = [iov_of(&mut a)];
        let region = unsafe { OutRegion::new(&segs) };
        assert_eq!(region.write_at(1, b"abcdef"), 2);
        assert_eq!(&a, b"\0ab");
    }

    #[test]
    fn tail_skips_and_clamps() {
        let mut a = vec![1u8; 4];
        let mut b = vec![2u8; 8];
        let segs = [iov_of(&mut a), iov_of(&mut b)];

        let t = tail(&segs, 6, 4);
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].iov_len, 4);
        assert_eq!(t[0].iov_base, unsafe { segs[1].iov_base.cast::<u8>().add(2) }.cast());

        let t = tail(&segs, 2, 100);
        assert_eq!(region_len(&t), 10);

        let t = tail(&segs, 12, 100);
        assert!(t.is_empty());
    }
}
