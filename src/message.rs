//! The wire-level Bitswap 1.2.0-compatible message record. Encoding to
//! and from bytes is the message codec's job, an external collaborator;
//! this module only carries the in-memory shape the network hands to and
//! takes from the engine.

use std::collections::HashMap;

use bytes::Bytes;
use cid::Cid;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::block::Block;

/// Higher numbers are served first. Plain `i32`: callers that want a
/// descending priority derived from an index compute it themselves;
/// overflow on `priority.max(other)` saturates rather than panics (see
/// `TaskMerger`).
pub type Priority = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum WantType {
    Block = 0,
    Have = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum BlockPresenceType {
    Have = 0,
    DontHave = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPresence {
    pub cid: Cid,
    pub kind: BlockPresenceType,
}

impl BlockPresence {
    pub fn have(cid: Cid) -> Self {
        BlockPresence {
            cid,
            kind: BlockPresenceType::Have,
        }
    }

    pub fn dont_have(cid: Cid) -> Self {
        BlockPresence {
            cid,
            kind: BlockPresenceType::DontHave,
        }
    }

    pub fn is_have(&self) -> bool {
        matches!(self.kind, BlockPresenceType::Have)
    }

    pub fn is_dont_have(&self) -> bool {
        matches!(self.kind, BlockPresenceType::DontHave)
    }
}

/// A single entry of an inbound or outbound wantlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WantlistEntry {
    pub cid: Cid,
    pub priority: Priority,
    pub want_type: WantType,
    pub cancel: bool,
    pub send_dont_have: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Wantlist {
    pub full: bool,
    pub entries: Vec<WantlistEntry>,
}

impl Wantlist {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn want_block(&mut self, cid: Cid, priority: Priority, send_dont_have: bool) {
        self.entries.push(WantlistEntry {
            cid,
            priority,
            want_type: WantType::Block,
            cancel: false,
            send_dont_have,
        });
    }

    pub fn want_have(&mut self, cid: Cid, priority: Priority, send_dont_have: bool) {
        self.entries.push(WantlistEntry {
            cid,
            priority,
            want_type: WantType::Have,
            cancel: false,
            send_dont_have,
        });
    }

    pub fn cancel(&mut self, cid: Cid) {
        self.entries.push(WantlistEntry {
            cid,
            priority: 0,
            want_type: WantType::Block,
            cancel: true,
            send_dont_have: false,
        });
    }
}

/// The message record exchanged between two Bitswap peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitswapMessage {
    pub wantlist: Wantlist,
    pub blocks: HashMap<Cid, Bytes>,
    pub block_presences: HashMap<Cid, BlockPresenceType>,
    pub pending_bytes: i32,
}

impl BitswapMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.wantlist.is_empty() && self.blocks.is_empty() && self.block_presences.is_empty()
    }

    pub fn add_block(&mut self, block: Block) {
        self.blocks.insert(block.cid, block.data);
    }

    pub fn add_block_presence(&mut self, presence: BlockPresence) {
        self.block_presences.insert(presence.cid, presence.kind);
    }

    /// Total bytes of block payload carried in this message; used against
    /// `max_message_size` when assembling an outbound batch.
    pub fn blocks_len_bytes(&self) -> usize {
        self.blocks.values().map(|b| b.len()).sum()
    }
}
