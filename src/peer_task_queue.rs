//! A two-level priority structure for scheduling outbound work: an outer
//! round-robin rotation across peers with pending work, and an inner
//! per-peer ordered set keyed by CID, priority-descending with FIFO
//! tie-breaking. Built on `keyed_priority_queue` for exactly this "order
//! by priority, remove by key" shape.

use std::cmp::Reverse;
use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use cid::Cid;
use keyed_priority_queue::KeyedPriorityQueue;
use libp2p::PeerId;

use crate::message::{Priority, WantType};
use crate::task_merger::{self, MergeDecision};

/// The unit of work scheduled by the queue: one pending response for one
/// CID to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub peer: PeerId,
    pub cid: Cid,
    pub priority: Priority,
    pub want_type: WantType,
    pub send_dont_have: bool,
    /// Byte cost this task will consume in an outbound message: the
    /// block size for `Block`, a small constant for `Have`/`DontHave`.
    pub size_hint: u64,
}

/// Priority + insertion order used to sort the inner per-peer queue.
/// Larger `Priority` sorts first; for equal priority, the task inserted
/// earlier (smaller `seq`) sorts first. `Reverse` makes a *smaller* seq
/// compare as *larger*, which is what a max-heap needs for FIFO order.
type OrderKey = (Priority, Reverse<u64>);

#[derive(Default)]
struct PeerQueue {
    order: KeyedPriorityQueue<Cid, OrderKey>,
    pending: AHashMap<Cid, Task>,
    active: AHashMap<Cid, Task>,
}

impl PeerQueue {
    fn is_fully_empty(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }
}

#[derive(Default)]
pub struct PeerTaskQueue {
    peers: AHashMap<PeerId, PeerQueue>,
    rotation: VecDeque<PeerId>,
    in_rotation: AHashSet<PeerId>,
    next_seq: u64,
}

impl PeerTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_in_rotation(&mut self, peer: PeerId) {
        if self.in_rotation.insert(peer) {
            self.rotation.push_back(peer);
        }
    }

    /// Insert tasks for `peer`, applying the Task Merger to each one
    /// against whatever is already pending or active for that CID.
    pub fn push_tasks(&mut self, peer: PeerId, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        let seq_base = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(tasks.len() as u64);

        let pq = self.peers.entry(peer).or_default();
        let mut inserted = false;

        for (i, task) in tasks.into_iter().enumerate() {
            let existing_pending = pq.pending.get(&task.cid).map(|t| t.want_type);
            let existing_active = pq.active.contains_key(&task.cid);

            match task_merger::resolve(existing_pending, existing_active, task.want_type) {
                MergeDecision::Insert => {
                    let seq = seq_base.wrapping_add(i as u64);
                    pq.order.push(task.cid, (task.priority, Reverse(seq)));
                    pq.pending.insert(task.cid, task);
                    inserted = true;
                }
                MergeDecision::Upgrade => {
                    let existing = pq.pending.get_mut(&task.cid).expect("pending entry checked above");
                    existing.priority = existing.priority.max(task.priority);
                    existing.send_dont_have = existing.send_dont_have || task.send_dont_have;
                    existing.want_type = WantType::Block;
                    existing.size_hint = task.size_hint;
                    let key = (existing.priority, Reverse(seq_base.wrapping_add(i as u64)));
                    let _ = pq.order.set_priority(&task.cid, key);
                    inserted = true;
                }
                MergeDecision::Ignore => {}
            }
        }

        if inserted {
            self.ensure_in_rotation(peer);
        }
    }

    /// Remove a pending (not yet active) task. Used when a cancel
    /// arrives; active tasks are left to complete rather than yanked
    /// mid-render.
    pub fn cancel_task(&mut self, peer: &PeerId, cid: &Cid) -> bool {
        let Some(pq) = self.peers.get_mut(peer) else {
            return false;
        };
        let removed = pq.pending.remove(cid).is_some();
        if removed {
            let _ = pq.order.remove(cid);
        }
        removed
    }

    /// Drop every pending (not active) task for `peer`. Used when a `full`
    /// wantlist replaces everything the peer previously asked for: active
    /// renders are left to complete, but stale pending work for CIDs no
    /// longer in the new wantlist must not ship.
    pub fn clear_pending(&mut self, peer: &PeerId) {
        let Some(pq) = self.peers.get_mut(peer) else {
            return;
        };
        pq.pending.clear();
        pq.order = KeyedPriorityQueue::new();
        if pq.is_fully_empty() {
            self.drop_peer(peer);
        }
    }

    /// Select the next peer in rotation with non-empty pending tasks and
    /// pop tasks in priority order until cumulative `size_hint` would
    /// exceed `max_bytes`. Always returns at least one task if any are
    /// pending for the chosen peer, even if that one task overshoots the
    /// cap. Selected tasks move from `pending` to `active`.
    pub fn pop_tasks(&mut self, max_bytes: u64) -> Option<(PeerId, Vec<Task>)> {
        let rounds = self.rotation.len();
        for _ in 0..rounds {
            let peer = self.rotation.pop_front()?;
            let Some(pq) = self.peers.get_mut(&peer) else {
                self.in_rotation.remove(&peer);
                continue;
            };

            if pq.order.is_empty() {
                // No pending work right now; keep the peer's place in
                // rotation (it may have active tasks, or be refilled
                // shortly) and move on to the next candidate.
                self.rotation.push_back(peer);
                continue;
            }

            let mut batch = Vec::new();
            let mut total: u64 = 0;
            while let Some((cid, _)) = pq.order.peek() {
                let cid = *cid;
                let size_hint = pq.pending[&cid].size_hint;
                if !batch.is_empty() && total + size_hint > max_bytes {
                    break;
                }
                pq.order.pop();
                let task = pq.pending.remove(&cid).expect("order and pending stay in sync");
                total += task.size_hint;
                pq.active.insert(cid, task.clone());
                batch.push(task);
            }

            // Moves to the tail regardless of whether pending drained to
            // empty, keeping the round-robin rotation fair.
            self.rotation.push_back(peer);
            return Some((peer, batch));
        }
        None
    }

    /// Mark active tasks complete, whether or not they were actually
    /// shipped. A send failure still consumes them; the caller is
    /// responsible for deciding whether to re-request.
    pub fn tasks_done(&mut self, peer: &PeerId, cids: &[Cid]) {
        let Some(pq) = self.peers.get_mut(peer) else {
            return;
        };
        for cid in cids {
            pq.active.remove(cid);
        }
        if pq.is_fully_empty() {
            self.drop_peer(peer);
        }
    }

    /// Drop all tasks for a peer; used on disconnect.
    pub fn remove(&mut self, peer: &PeerId) {
        self.drop_peer(peer);
    }

    fn drop_peer(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        if self.in_rotation.remove(peer) {
            self.rotation.retain(|p| p != peer);
        }
    }

    /// Sum of `size_hint` for a peer's remaining pending tasks: the
    /// `pending_bytes` hint the Processor attaches to outbound messages.
    pub fn pending_bytes(&self, peer: &PeerId) -> u64 {
        self.peers
            .get(peer)
            .map(|pq| pq.pending.values().map(|t| t.size_hint).sum())
            .unwrap_or(0)
    }

    pub fn has_peer(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }
}
