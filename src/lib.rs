//! Decision engine for the Bitswap block-exchange protocol: the subsystem
//! that decides which locally held blocks to send to which remote peer,
//! in what order, under a bounded per-message byte budget.
//!
//! The Network, Want Manager, Block Store and Message codec are external
//! collaborators reached only through the [`Network`] and [`BlockStore`]
//! traits; this crate owns the [`Ledger`], the [`PeerTaskQueue`], the
//! merge policy in [`task_merger`], and the [`Engine`] that ties them
//! together.

mod block;
mod config;
mod engine;
mod error;
mod ledger;
mod message;
mod network;
mod peer_task_queue;
mod store;
mod task_merger;

pub use block::Block;
pub use config::EngineConfig;
pub use engine::{Engine, EngineEvent};
pub use error::EngineError;
pub use ledger::{Ledger, WantEntry};
pub use message::{
    BitswapMessage, BlockPresence, BlockPresenceType, Priority, Wantlist, WantlistEntry, WantType,
};
pub use network::Network;
pub use peer_task_queue::{PeerTaskQueue, Task};
pub use store::BlockStore;

pub use libp2p::PeerId;
