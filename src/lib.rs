//! User-space FUSE mirror server for virtio-fs style transports.
//!
//! `fusemirror` presents a host directory tree to a guest over the FUSE
//! wire protocol, carried by a shared-memory descriptor transport rather
//! than a local kernel mount. The transport delivers each request as a pair
//! of scatter-gather descriptor arrays; [`Mirror::handle_request`] decodes
//! the opcode, performs the matching host-filesystem operation and writes
//! the reply back into the output descriptors — synchronously for metadata
//! operations, deferred through per-thread Linux AIO for read and write.
//!
//! The pieces an embedding program wires together:
//!
//! * [`Config`] — mirror directory, metadata timeout, transport knobs,
//!   loadable from TOML.
//! * [`Mirror`] — the engine: inode registry, directory handles, operation
//!   handlers, async completion.
//! * [`Transport`] — the polling surface of the concrete device transport.
//! * [`run`] — the poll loop, single- or multi-threaded, with cooperative
//!   shutdown on SIGINT/SIGTERM/SIGPIPE.
//!
//! Linux only: the design leans on `O_PATH` anchors, `/proc/self/fd`
//! reopening and native AIO.

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

mod aio;
mod config;
mod dir;
mod iov;
pub mod ll;
mod mirror;
mod poll;
mod registry;
mod session;
mod transport;

pub use crate::config::{Config, MirrorSection, TransportSection};
pub use crate::ll::fuse_abi::FUSE_ROOT_ID;
pub use crate::mirror::Mirror;
pub use crate::poll::{PollOptions, install_signal_handlers, request_stop, run};
pub use crate::session::Session;
pub use crate::transport::{CompletionCtx, CompletionStatus, Dispatch, Transport};
