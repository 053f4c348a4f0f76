//! Capability trait abstracting the block store. Read-only from the
//! processor's perspective; writes arrive from outside the engine via
//! whatever calls `Engine::received_blocks`.

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;

use crate::block::Block;

#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the bytes for `cid`, if present.
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, Self::Error>;

    /// Cheaper existence check than `get`, preferred for Have-resolution.
    async fn has(&self, cid: &Cid) -> Result<bool, Self::Error>;

    /// Store freshly-received blocks; callers invoke this before
    /// notifying the engine via `received_blocks`.
    async fn put_many(&self, blocks: Vec<Block>) -> Result<(), Self::Error>;
}
