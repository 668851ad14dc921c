//! Transport contract.
//!
//! The device transport (virtio rings, a DPU emulation layer, or the
//! in-memory harness used by the tests) delivers each request as a pair of
//! descriptor arrays and polls the server from its queue threads. Requests
//! complete either synchronously — the dispatcher's return value says how
//! many reply bytes were written — or deferred, in which case the server
//! invokes the request's completion context exactly once, from whatever
//! thread reaps the async result.

use std::fmt;

use nix::errno::Errno;

/// Outcome reported through a deferred completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Error,
}

/// Per-request completion callback handed in by the transport.
///
/// Consumed on use, so a deferred request cannot be completed twice. Safe
/// to invoke from any thread.
pub struct CompletionCtx(Box<dyn FnOnce(CompletionStatus) + Send>);

impl CompletionCtx {
    pub fn new(f: impl FnOnce(CompletionStatus) + Send + 'static) -> Self {
        CompletionCtx(Box::new(f))
    }

    /// Deliver the final status to the transport.
    pub fn complete(self, status: CompletionStatus) {
        (self.0)(status)
    }
}

impl fmt::Debug for CompletionCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompletionCtx")
    }
}

/// What the dispatcher tells the transport about a request it was handed.
#[derive(Debug)]
pub enum Dispatch {
    /// Completed synchronously; the output descriptors hold this many reply
    /// bytes (zero for operations that send no reply, like forget).
    Sync(usize),
    /// The reply is pending; the completion context will be invoked later.
    Deferred,
    /// The request could not be decoded far enough to form a reply; the
    /// transport should fail the descriptor chain with this errno.
    Failed(Errno),
}

/// The polling surface of the device transport.
///
/// `poll_io` drains one queue's submission ring, invoking the server's
/// request handler inline, and returns how many requests it picked up.
/// `poll_mgmt` services the management plane (config space, device state).
/// After `suspend` is requested the transport finishes in-flight requests
/// and then reports itself suspended.
pub trait Transport: Sync {
    fn poll_io(&self, thread_index: usize) -> usize;

    fn poll_mgmt(&self) {}

    fn suspend(&self);

    fn is_suspended(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn completion_runs_exactly_once() {
        let hits = Arc::new(AtomicU32::new(0));
        let ctx = {
            let hits = hits.clone();
            CompletionCtx::new(move |status| {
                assert_eq!(status, CompletionStatus::Success);
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        ctx.complete(CompletionStatus::Success);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
