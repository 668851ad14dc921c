//! Configuration consumed by the embedding program.
//!
//! ```toml
//! [mirror]
//! dir = "/srv/export"
//! metadata_timeout = 86400.0
//!
//! [transport]
//! threads = 2
//! queue_depth = 64
//! polling_interval_usec = 0
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::poll::PollOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mirror: MirrorSection,
    #[serde(default)]
    pub transport: TransportSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorSection {
    /// Host directory to mirror.
    pub dir: PathBuf,
    /// Attribute/entry validity in seconds. Zero disables guest caching
    /// and enables eager unlink-before-last-close.
    #[serde(default)]
    pub metadata_timeout: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    /// Polling threads, one per transport queue.
    pub threads: usize,
    /// Depth of each per-thread async I/O context.
    pub queue_depth: u32,
    /// Sleep between poll iterations in microseconds; 0 spins.
    pub polling_interval_usec: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        TransportSection {
            threads: 1,
            queue_depth: 64,
            polling_interval_usec: 0,
        }
    }
}

impl Config {
    /// A config with defaults for everything but the mirror directory.
    pub fn for_dir(dir: impl Into<PathBuf>) -> Self {
        Config {
            mirror: MirrorSection {
                dir: dir.into(),
                metadata_timeout: 0.0,
            },
            transport: TransportSection::default(),
        }
    }

    pub fn from_toml_file(path: &Path) -> io::Result<Self> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    pub fn from_toml(text: &str) -> io::Result<Self> {
        toml::from_str(text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn poll_options(&self) -> PollOptions {
        let interval = match self.transport.polling_interval_usec {
            0 => None,
            usec => Some(Duration::from_micros(usec)),
        };
        PollOptions {
            threads: self.transport.threads.max(1),
            interval,
        }
    }
}
