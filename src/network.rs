//! Capability trait abstracting the network layer. The engine never
//! depends on a concrete transport; tests substitute an in-memory
//! `Network` implementation instead of real sockets.

use async_trait::async_trait;
use libp2p::PeerId;

use crate::message::BitswapMessage;

#[async_trait]
pub trait Network: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Serialize and transmit `msg` to `peer`. Failure is reported, not
    /// retried, by the engine: the remote will re-ask via its own wantlist
    /// maintenance.
    async fn send_message(&self, peer: PeerId, msg: BitswapMessage) -> Result<(), Self::Error>;
}
