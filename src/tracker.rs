//! The peer discovery seam.
//!
//! The engine does not speak any tracker wire protocol itself. Whatever
//! supplies peers — an HTTP or UDP tracker client, DHT, a static list —
//! implements [`PeerSource`] and is handed to the engine per torrent, tiered
//! as in BEP 12. The engine's announce driver calls it periodically and feeds
//! the results into the swarm; peers can also be injected directly through
//! `Client::add_peers`.

use std::time::Duration;

use async_trait::async_trait;

use crate::{error::*, InfoHash, Peer, PeerId};

/// What the engine tells a discovery source about itself when asking for
/// peers.
#[derive(Clone, Debug)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    /// The port we accept inbound connections on, or 0 when not listening.
    pub port: u16,
}

/// A batch of peers and the source's requested revisit interval.
#[derive(Clone, Debug)]
pub struct AnnounceResponse {
    pub peers: Vec<Peer>,
    /// How long the engine should wait before announcing to this source
    /// again.
    pub interval: Duration,
}

/// A source of peer endpoints for one or more swarms.
#[async_trait]
pub trait PeerSource: Send + Sync {
    async fn announce(&self, req: &AnnounceRequest) -> Result<AnnounceResponse>;
}
