//! Poll loops, signal handling and per-thread routing.
//!
//! The transport is polled, never woken: in single-threaded mode one loop
//! alternates between submission-queue polling and management polling, the
//! latter only every [`MGMT_POLL_PERIOD`] iterations or once per configured
//! sleep interval. In multi-threaded mode one thread per queue polls
//! submission only, while the main thread additionally polls management and
//! owns signal handling. Each polling thread records its index in TLS so
//! the read/write handlers can reach their thread's async engine.
//!
//! SIGINT, SIGTERM and SIGPIPE set a stop flag; the main thread then asks
//! the transport to suspend and every loop exits once it reports suspended,
//! letting in-flight requests finish naturally.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::mirror::Mirror;
use crate::transport::Transport;

static STOP: AtomicBool = AtomicBool::new(false);

thread_local! {
    static THREAD_INDEX: Cell<usize> = const { Cell::new(0) };
}

/// Index of the current polling thread; 0 outside the poll loops.
pub(crate) fn thread_index() -> usize {
    THREAD_INDEX.get()
}

/// Ask every poll loop to suspend the transport and exit. What the signal
/// handler does, callable directly by an embedding program.
pub fn request_stop() {
    STOP.store(true, Ordering::SeqCst);
}

extern "C" fn on_signal(_signum: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

/// Route SIGINT, SIGTERM and SIGPIPE to the stop flag.
pub fn install_signal_handlers() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGPIPE] {
        unsafe {
            signal::sigaction(sig, &action)?;
        }
    }
    Ok(())
}

/// How many io-poll iterations between management polls when spinning.
const MGMT_POLL_PERIOD: u32 = 10_000;

#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Number of polling threads, one per transport queue.
    pub threads: usize,
    /// Sleep between iterations; `None` polls as fast as possible.
    pub interval: Option<Duration>,
}

/// Drive the transport until a stop is requested and the transport has
/// suspended. Blocks the calling thread, which doubles as queue 0's poller.
pub fn run<T: Transport>(mirror: &Mirror, transport: &T, options: &PollOptions) {
    if options.threads <= 1 {
        main_loop(mirror, transport, options.interval, 0);
    } else {
        thread::scope(|scope| {
            for index in 1..options.threads {
                scope.spawn(move || worker_loop(mirror, transport, index));
            }
            // The main thread also polls management and reacts to signals.
            main_loop(mirror, transport, options.interval, 0);
        });
    }
}

fn main_loop<T: Transport>(
    mirror: &Mirror,
    transport: &T,
    interval: Option<Duration>,
    index: usize,
) {
    THREAD_INDEX.set(index);
    let mut suspending = false;
    let mut count: u32 = 0;
    while !STOP.load(Ordering::SeqCst) || !transport.is_suspended() {
        if let Some(interval) = interval {
            thread::sleep(interval);
            transport.poll_io(index);
            mirror.poll_completions(index);
            transport.poll_mgmt();
        } else {
            // Poll submission as fast as we can, but don't spend resources
            // on management polling.
            transport.poll_io(index);
            mirror.poll_completions(index);
            count = count.wrapping_add(1);
            if count % MGMT_POLL_PERIOD == 0 {
                transport.poll_mgmt();
            }
        }
        if STOP.load(Ordering::SeqCst) && !suspending {
            transport.suspend();
            suspending = true;
        }
    }
}

fn worker_loop<T: Transport>(mirror: &Mirror, transport: &T, index: usize) {
    THREAD_INDEX.set(index);
    // Someone else (the main thread) polls management.
    while !STOP.load(Ordering::SeqCst) || !transport.is_suspended() {
        transport.poll_io(index);
        mirror.poll_completions(index);
    }
}
