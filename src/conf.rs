//! This module defines types used to configure the engine and its parts.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

/// The fingerprint prepended to generated peer ids, in the Azureus style of
/// BEP 20. The remaining 12 bytes are filled with random data.
pub const CLIENT_ID_PREFIX: &str = "-PW0001-";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::new(data_dir),
            torrent: TorrentConf::default(),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The fingerprint with which generated peer ids start.
    pub client_id_prefix: String,

    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub data_dir: PathBuf,

    /// The address to accept inbound peer connections on. `None` disables the
    /// listener; the engine then only dials out.
    pub listen_addr: Option<SocketAddr>,

    /// The upper bound on connections that have been initiated but have not
    /// completed their handshake. Caps the SYN flood a large tracker response
    /// could otherwise cause.
    pub half_open_limit: usize,
}

impl EngineConf {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            client_id_prefix: CLIENT_ID_PREFIX.to_string(),
            data_dir: data_dir.into(),
            listen_addr: None,
            half_open_limit: 10,
        }
    }
}

/// Configuration for a torrent.
///
/// The engine applies one instance of this to all torrents.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The maximum number of block requests kept outstanding per connection.
    pub max_outstanding_requests: usize,

    /// Frames longer than this are treated as a protocol violation. Needs to
    /// comfortably exceed a block message (16 KiB payload).
    pub max_frame_len: usize,

    /// How long a connection attempt may take before it is abandoned.
    pub dial_timeout: Duration,

    /// A zero-length keepalive frame is sent whenever a connection's outgoing
    /// queue has been idle this long.
    pub keepalive_interval: Duration,
}

impl Default for TorrentConf {
    fn default() -> Self {
        Self {
            max_outstanding_requests: 250,
            max_frame_len: 256 * 1024,
            dial_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(120),
        }
    }
}
