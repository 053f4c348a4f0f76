//! Per-peer bookkeeping: transfer accounting plus the live wantlist
//! entries currently pending for that peer.

use ahash::AHashMap;
use cid::Cid;

use crate::message::{Priority, WantType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WantEntry {
    pub priority: Priority,
    pub want_type: WantType,
    pub send_dont_have: bool,
}

/// The history of transactions with one remote peer.
#[derive(Debug, Default)]
pub struct Ledger {
    bytes_sent: u64,
    bytes_received: u64,
    blocks_sent: u64,
    blocks_received: u64,
    exchange_count: u64,
    wants: AHashMap<Cid, WantEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or update a want. A repeated want for the same `cid`
    /// overwrites the existing entry; the task merger decides separately
    /// whether the corresponding queued task should change to match, since
    /// the ledger itself has no notion of "merge", only "last write wins".
    pub fn wants(&mut self, cid: Cid, priority: Priority, want_type: WantType, send_dont_have: bool) {
        self.wants.insert(
            cid,
            WantEntry {
                priority,
                want_type,
                send_dont_have,
            },
        );
    }

    /// Idempotent: removing an absent want is a no-op.
    pub fn cancel_want(&mut self, cid: &Cid) {
        self.wants.remove(cid);
    }

    pub fn peer_wants(&self, cid: &Cid) -> Option<WantEntry> {
        self.wants.get(cid).copied()
    }

    pub fn wantlist(&self) -> impl Iterator<Item = (&Cid, &WantEntry)> {
        self.wants.iter()
    }

    pub fn clear_wantlist(&mut self) {
        self.wants.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.wants.is_empty()
    }

    pub fn account_sent(&mut self, bytes: u64) {
        self.bytes_sent += bytes;
    }

    pub fn account_received(&mut self, bytes: u64) {
        self.bytes_received += bytes;
    }

    pub fn account_block_sent(&mut self) {
        self.blocks_sent += 1;
    }

    pub fn account_block_received(&mut self) {
        self.blocks_received += 1;
    }

    pub fn account_exchange(&mut self) {
        self.exchange_count += 1;
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent
    }

    pub fn blocks_received(&self) -> u64 {
        self.blocks_received
    }

    pub fn exchange_count(&self) -> u64 {
        self.exchange_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::tests::create_block;

    #[test]
    fn wants_then_cancel_is_idempotent() {
        let mut ledger = Ledger::new();
        let cid = create_block(b"a").cid;
        ledger.wants(cid, 1, WantType::Block, false);
        assert!(ledger.peer_wants(&cid).is_some());
        ledger.cancel_want(&cid);
        ledger.cancel_want(&cid);
        assert!(ledger.peer_wants(&cid).is_none());
    }

    #[test]
    fn repeated_want_overwrites_single_entry() {
        let mut ledger = Ledger::new();
        let cid = create_block(b"a").cid;
        ledger.wants(cid, 1, WantType::Have, false);
        ledger.wants(cid, 5, WantType::Block, true);
        assert_eq!(ledger.wantlist().count(), 1);
        let entry = ledger.peer_wants(&cid).unwrap();
        assert_eq!(entry.priority, 5);
        assert_eq!(entry.want_type, WantType::Block);
    }

    #[test]
    fn counters_are_monotonic() {
        let mut ledger = Ledger::new();
        ledger.account_sent(10);
        ledger.account_sent(5);
        assert_eq!(ledger.bytes_sent(), 15);
        ledger.account_received(3);
        assert_eq!(ledger.bytes_received(), 3);
    }
}
