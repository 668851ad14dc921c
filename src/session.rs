//! Per-device session state.
//!
//! Written once when the guest's INIT arrives, read-only afterwards: the
//! negotiated capability word, the attribute/entry validity timeout and the
//! device id of the mirror root that every child must share.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::ll::fuse_abi::InitFlags;

/// The max size of write requests advertised at init. 256 pages on a 4k
/// page system, the most a virtio-fs request comfortably carries.
pub(crate) const MAX_WRITE_SIZE: usize = 1024 * 1024;

pub(crate) const MAX_BACKGROUND: u16 = 12;
pub(crate) const CONGESTION_THRESHOLD: u16 = 9;

#[derive(Debug)]
pub struct Session {
    timeout: f64,
    src_dev: u64,
    negotiated: AtomicU32,
    initialized: AtomicBool,
    destroyed: AtomicBool,
}

impl Session {
    pub(crate) fn new(timeout: f64, src_dev: u64) -> Self {
        Session {
            timeout,
            src_dev,
            negotiated: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Attribute/entry validity in seconds. Zero disables guest caching and
    /// switches the unlink path to eager anchor release.
    pub fn timeout(&self) -> f64 {
        self.timeout
    }

    /// Device id of the mirror root; children on other devices are hidden.
    pub(crate) fn src_dev(&self) -> u64 {
        self.src_dev
    }

    /// Whether writes may be cached guest-side. Keyed off the timeout: a
    /// zero timeout never requests the writeback capability.
    pub(crate) fn writeback(&self) -> bool {
        self.timeout != 0.0
    }

    pub(crate) fn set_negotiated(&self, flags: InitFlags) {
        self.negotiated.store(flags.bits(), Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn negotiated(&self) -> InitFlags {
        InitFlags::from_bits_truncate(self.negotiated.load(Ordering::SeqCst))
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn set_destroyed(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}
