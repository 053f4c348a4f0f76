//! The Processor and the Engine facade: the single-owner actor that turns
//! queued tasks into outbound messages, and the narrow API surface the
//! rest of a Bitswap agent drives it through.
//!
//! One actor owns `Ledger` + `PeerTaskQueue` behind a `tokio::sync::Mutex`;
//! the Processor is a companion task woken through a debounced scheduler
//! built from `tokio_util::time::DelayQueue`: a single pending timer per
//! peer, reset on each enqueue, always firing immediately the first time a
//! peer goes from idle to having work. Once a peer's timer expires it
//! moves onto a `deadqueue::unlimited::Queue`, the ready-to-render pool
//! `process_peer` drains and re-feeds directly when a peer still has
//! pending bytes after a cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use async_broadcast::{broadcast, InactiveReceiver, Receiver, Sender as EventSender};
use cid::Cid;
use futures::StreamExt;
use libp2p::PeerId;
use tokio::sync::Mutex;
use deadqueue::unlimited::Queue as ReadyQueue;
use tokio_context::context::{Context as CancelContext, Handle as CancelHandle};
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{instrument, trace, warn};

use crate::block::Block;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::ledger::Ledger;
use crate::message::{BitswapMessage, BlockPresence, WantType, WantlistEntry};
use crate::network::Network;
use crate::peer_task_queue::{PeerTaskQueue, Task};
use crate::store::BlockStore;

/// Telemetry emitted on the `EngineEvent` broadcast stream, the engine's
/// lightweight substitute for wiring up a full metrics backend.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    MessageSent { peer: PeerId, bytes: u64, blocks: u64 },
    MessageReceived { peer: PeerId },
    Error { peer: Option<PeerId>, message: String },
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct Inner {
    ledgers: AHashMap<PeerId, Ledger>,
    queue: PeerTaskQueue,
}

impl Inner {
    fn new() -> Self {
        Inner {
            ledgers: AHashMap::new(),
            queue: PeerTaskQueue::new(),
        }
    }

    fn ledger_mut(&mut self, peer: PeerId, max_ledgers: usize) -> &mut Ledger {
        if !self.ledgers.contains_key(&peer) && self.ledgers.len() >= max_ledgers {
            warn!(%peer, "max_ledgers reached, evicting is not implemented; tracking anyway");
        }
        self.ledgers.entry(peer).or_insert_with(Ledger::new)
    }
}

/// A running Processor plus the means to stop it.
struct RunningProcessor {
    join: tokio::task::JoinHandle<()>,
    cancel: CancelHandle,
}

/// The decision engine. Generic over the block store and network
/// collaborators so tests can substitute in-memory fakes for both.
pub struct Engine<S, N>
where
    S: BlockStore,
    N: Network,
{
    inner: Arc<Mutex<Inner>>,
    store: Arc<S>,
    network: Arc<N>,
    config: EngineConfig,
    schedule_tx: async_channel::Sender<PeerId>,
    schedule_rx: async_channel::Receiver<PeerId>,
    events_tx: EventSender<EngineEvent>,
    /// Kept alive so `try_broadcast` never fails for lack of a receiver;
    /// real subscribers come from `subscribe()`.
    _events_keepalive: InactiveReceiver<EngineEvent>,
    running: Mutex<Option<RunningProcessor>>,
    started: AtomicBool,
}

impl<S, N> Engine<S, N>
where
    S: BlockStore,
    N: Network,
{
    pub fn new(store: S, network: N, config: EngineConfig) -> Self {
        let (events_tx, events_rx) = broadcast(EVENT_CHANNEL_CAPACITY);
        let (schedule_tx, schedule_rx) = async_channel::unbounded();
        Engine {
            inner: Arc::new(Mutex::new(Inner::new())),
            store: Arc::new(store),
            network: Arc::new(network),
            config,
            schedule_tx,
            schedule_rx,
            events_tx,
            _events_keepalive: events_rx.deactivate(),
            running: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Subscribe to the telemetry stream. May be called before or after
    /// `start`.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.events_tx.new_receiver()
    }

    /// Idempotent: a second `start()` while already running is a no-op.
    #[instrument(skip(self))]
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }
        let (cancel_ctx, cancel_handle) = CancelContext::new();
        let join = tokio::spawn(processor_loop(
            self.inner.clone(),
            self.store.clone(),
            self.network.clone(),
            self.config.clone(),
            self.schedule_rx.clone(),
            self.events_tx.clone(),
            cancel_ctx,
        ));
        *running = Some(RunningProcessor {
            join,
            cancel: cancel_handle,
        });
        self.started.store(true, Ordering::SeqCst);
    }

    /// Cancels any in-flight send, discards pending tasks, and empties
    /// ledgers. A second `stop()` is a no-op.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(mut proc) = running.take() {
            proc.cancel.cancel();
            let _ = proc.join.await;
        }
        self.started.store(false, Ordering::SeqCst);
        let mut inner = self.inner.lock().await;
        inner.ledgers.clear();
        inner.queue = PeerTaskQueue::new();
    }

    fn require_started(&self) -> Result<(), EngineError> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::NotStarted)
        }
    }

    /// Fold an inbound message into the sender's ledger and enqueue
    /// whatever tasks follow. Accounts the receive-side counters for any
    /// blocks carried on `msg` as part of the same ledger update; actually
    /// persisting those blocks is the caller's job, via the block store
    /// and a follow-up call to `received_blocks`, since this method only
    /// knows about bookkeeping, not storage.
    #[instrument(skip(self, msg), fields(peer = %from_peer, entries = msg.wantlist.entries.len()))]
    pub async fn message_received(&self, from_peer: PeerId, msg: BitswapMessage) {
        if self.require_started().is_err() {
            warn!(peer = %from_peer, "message_received before start");
            return;
        }

        // Ledger mutation happens up front, under the lock, with no
        // suspension points: cancels remove queued tasks immediately,
        // non-cancel entries are recorded so their task decision (which
        // needs a block store lookup, and so must suspend) can happen
        // after the lock is released.
        let mut candidates: Vec<WantlistEntry> = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let max_ledgers = self.config.max_ledgers;
            let ledger = inner.ledger_mut(from_peer, max_ledgers);
            let received_bytes: u64 = msg.blocks.values().map(|b| b.len() as u64).sum();
            if received_bytes > 0 {
                ledger.account_received(received_bytes);
            }
            for _ in 0..msg.blocks.len() {
                ledger.account_block_received();
            }
            if !msg.is_empty() {
                ledger.account_exchange();
            }

            if msg.wantlist.full {
                inner.ledger_mut(from_peer, max_ledgers).clear_wantlist();
                // A `full` wantlist replaces everything the peer previously
                // asked for, so stale pending work for this peer is purged
                // too. Tasks already in flight are left to finish.
                inner.queue.clear_pending(&from_peer);
            }

            for entry in &msg.wantlist.entries {
                if entry.cancel {
                    inner.ledger_mut(from_peer, max_ledgers).cancel_want(&entry.cid);
                    inner.queue.cancel_task(&from_peer, &entry.cid);
                    continue;
                }

                inner
                    .ledger_mut(from_peer, max_ledgers)
                    .wants(entry.cid, entry.priority, entry.want_type, entry.send_dont_have);
                candidates.push(*entry);
            }
        }

        let mut tasks = Vec::with_capacity(candidates.len());
        for entry in &candidates {
            if let Some(task) = self.task_for_entry(from_peer, entry).await {
                tasks.push(task);
            }
        }

        if !tasks.is_empty() {
            let mut inner = self.inner.lock().await;
            inner.queue.push_tasks(from_peer, tasks);
        }

        let _ = self
            .events_tx
            .try_broadcast(EngineEvent::MessageReceived { peer: from_peer });
        self.wake(from_peer).await;
    }

    /// Decide whether an entry should become a queued task right away.
    /// An absent `Block` want is only queued eagerly when `send_dont_have`
    /// is set; otherwise the engine stays silent about blocks it doesn't
    /// have rather than answering unasked.
    async fn task_for_entry(&self, peer: PeerId, entry: &WantlistEntry) -> Option<Task> {
        let present = self.store.has(&entry.cid).await.unwrap_or(false);
        if !present && !entry.send_dont_have {
            return None;
        }
        let size_hint = self.size_hint(entry.cid, entry.want_type, present).await;
        Some(Task {
            peer,
            cid: entry.cid,
            priority: entry.priority,
            want_type: entry.want_type,
            send_dont_have: entry.send_dont_have,
            size_hint,
        })
    }

    /// `Have`/`DontHave` tasks cost a small constant; a `Block` task
    /// costs its real payload size, looked up eagerly so the queue's
    /// byte-budget accounting (`pop_tasks`, `pending_bytes`) is
    /// meaningful before the Processor ever renders the message.
    async fn size_hint(&self, cid: Cid, want_type: WantType, present: bool) -> u64 {
        if want_type == WantType::Block && present {
            match self.store.get(&cid).await {
                Ok(Some(data)) => return data.len() as u64,
                _ => return PRESENCE_SIZE_HINT,
            }
        }
        PRESENCE_SIZE_HINT
    }

    /// Called by the wrapping agent after blocks land in the block
    /// store. Scans every peer's ledger for an outstanding want on each
    /// CID and enqueues the corresponding task.
    #[instrument(skip(self, blocks), fields(count = blocks.len()))]
    pub async fn received_blocks(&self, blocks: Vec<Block>) {
        if self.require_started().is_err() {
            return;
        }

        let mut woken = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            for block in &blocks {
                let peers: Vec<PeerId> = inner
                    .ledgers
                    .iter()
                    .filter(|(_, l)| l.peer_wants(&block.cid).is_some())
                    .map(|(p, _)| *p)
                    .collect();

                for peer in peers {
                    let entry = inner.ledgers[&peer].peer_wants(&block.cid).expect("filtered above");
                    let size_hint = match entry.want_type {
                        WantType::Block => block.len() as u64,
                        WantType::Have => PRESENCE_SIZE_HINT,
                    };
                    let task = Task {
                        peer,
                        cid: block.cid,
                        priority: entry.priority,
                        want_type: entry.want_type,
                        send_dont_have: entry.send_dont_have,
                        size_hint,
                    };
                    inner.queue.push_tasks(peer, vec![task]);
                    woken.push(peer);
                }
            }
        }

        for peer in woken {
            self.wake(peer).await;
        }
    }

    /// An external confirmation hook. This engine's own Processor already
    /// accounts `bytes_sent`/`blocks_sent` as soon as `Network::send_message`
    /// returns `Ok`, so a Network implementation that wires this up too
    /// would double-count; it exists for transports that only learn the
    /// true wire byte count out of band and choose not to rely on the
    /// Processor's optimistic accounting.
    #[instrument(skip(self))]
    pub async fn message_sent(&self, peer: PeerId, _cid: Cid, bytes: u64) -> Result<(), EngineError> {
        self.require_started()?;
        let mut inner = self.inner.lock().await;
        let ledger = inner.ledger_mut(peer, self.config.max_ledgers);
        ledger.account_sent(bytes);
        ledger.account_block_sent();
        Ok(())
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        self.inner.lock().await.ledgers.keys().copied().collect()
    }

    pub async fn num_bytes_sent_to(&self, peer: &PeerId) -> u64 {
        self.inner
            .lock()
            .await
            .ledgers
            .get(peer)
            .map(|l| l.bytes_sent())
            .unwrap_or(0)
    }

    pub async fn num_bytes_received_from(&self, peer: &PeerId) -> u64 {
        self.inner
            .lock()
            .await
            .ledgers
            .get(peer)
            .map(|l| l.bytes_received())
            .unwrap_or(0)
    }

    /// Called when the network layer reports a new inbound byte count
    /// for `peer`, for transports whose framing layer learns the true
    /// wire size independently of the decoded `BitswapMessage` (padding,
    /// compression, and the like). Kept here rather than in `network.rs`
    /// since accounting is the ledger's job.
    pub async fn account_received(&self, peer: PeerId, bytes: u64) {
        let mut inner = self.inner.lock().await;
        inner
            .ledger_mut(peer, self.config.max_ledgers)
            .account_received(bytes);
    }

    async fn wake(&self, peer: PeerId) {
        if self.schedule_tx.send(peer).await.is_err() {
            trace!(%peer, "schedule channel closed, engine likely stopped");
        }
    }
}

/// Cost assigned to a `Have`/`DontHave` task, and the fallback for a
/// `Block` task whose size can't be determined up front.
const PRESENCE_SIZE_HINT: u64 = 8;

#[allow(clippy::too_many_arguments)]
async fn processor_loop<S, N>(
    inner: Arc<Mutex<Inner>>,
    store: Arc<S>,
    network: Arc<N>,
    config: EngineConfig,
    schedule_rx: async_channel::Receiver<PeerId>,
    events_tx: EventSender<EngineEvent>,
    mut cancel_ctx: CancelContext,
) where
    S: BlockStore,
    N: Network,
{
    let mut delay_queue: DelayQueue<PeerId> = DelayQueue::new();
    let mut scheduled: AHashMap<PeerId, delay_queue::Key> = AHashMap::new();
    // Peers whose debounce timer has already expired and are waiting to be
    // rendered. Kept separate from `delay_queue` so a burst of timers
    // expiring at once doesn't have to be drained one `select!` turn at a
    // time, and so `process_peer`'s own "still has pending bytes" requeue
    // can skip the debounce window entirely.
    let ready: Arc<ReadyQueue<PeerId>> = Arc::new(ReadyQueue::new());

    loop {
        tokio::select! {
            biased;

            _ = cancel_ctx.done() => {
                trace!("processor cancelled");
                break;
            }

            incoming = schedule_rx.recv() => {
                match incoming {
                    Ok(peer) => schedule_peer(&mut delay_queue, &mut scheduled, peer, config.task_coalesce_delay),
                    Err(_) => break,
                }
            }

            Some(expired) = delay_queue.next(), if !delay_queue.is_empty() => {
                let peer = expired.into_inner();
                scheduled.remove(&peer);
                ready.push(peer);
            }

            peer = ready.pop() => {
                process_peer(
                    peer,
                    &inner,
                    &store,
                    &network,
                    &config,
                    &events_tx,
                    &ready,
                )
                .await;
            }
        }
    }
}

/// Debounce: fire immediately the first time a peer is scheduled while
/// idle; coalesce further bursts by resetting the same timer entry,
/// never adding a second one.
fn schedule_peer(
    delay_queue: &mut DelayQueue<PeerId>,
    scheduled: &mut AHashMap<PeerId, delay_queue::Key>,
    peer: PeerId,
    coalesce: Duration,
) {
    match scheduled.get(&peer) {
        Some(key) => {
            delay_queue.reset(key, coalesce);
        }
        None => {
            let key = delay_queue.insert(peer, Duration::ZERO);
            scheduled.insert(peer, key);
        }
    }
}

async fn process_peer<S, N>(
    peer: PeerId,
    inner: &Arc<Mutex<Inner>>,
    store: &Arc<S>,
    network: &Arc<N>,
    config: &EngineConfig,
    events_tx: &EventSender<EngineEvent>,
    ready: &Arc<ReadyQueue<PeerId>>,
) where
    S: BlockStore,
    N: Network,
{
    // Aim for `target_message_size`, the soft batch-size goal, but never
    // ask the queue for more than `max_message_size` even if the two are
    // misconfigured relative to each other.
    let batch_cap = config.target_message_size.min(config.max_message_size) as u64;
    let popped = {
        let mut guard = inner.lock().await;
        guard.queue.pop_tasks(batch_cap)
    };
    let Some((peer, tasks)) = popped else {
        return;
    };

    let pending_bytes = {
        let guard = inner.lock().await;
        guard.queue.pending_bytes(&peer)
    };

    let mut msg = BitswapMessage::new();
    msg.pending_bytes = pending_bytes.min(i32::MAX as u64) as i32;
    let mut cids_done = Vec::with_capacity(tasks.len());
    let mut block_wants_satisfied = Vec::new();
    for task in &tasks {
        match render_task(task, store.as_ref(), config, &mut msg).await {
            Ok(true) if task.want_type == WantType::Block => block_wants_satisfied.push(task.cid),
            Ok(_) => {}
            Err(err) => {
                let _ = events_tx.try_broadcast(EngineEvent::Error {
                    peer: Some(peer),
                    message: err.to_string(),
                });
            }
        }
        cids_done.push(task.cid);
    }

    let blocks_in_msg = msg.blocks.len() as u64;
    let bytes_in_msg = msg.blocks_len_bytes() as u64;

    if !msg.is_empty() {
        match network.send_message(peer, msg).await {
            Ok(()) => {
                let mut guard = inner.lock().await;
                let ledger = guard.ledger_mut(peer, config.max_ledgers);
                ledger.account_sent(bytes_in_msg);
                for _ in 0..blocks_in_msg {
                    ledger.account_block_sent();
                }
                ledger.account_exchange();
                drop(guard);
                let _ = events_tx.try_broadcast(EngineEvent::MessageSent {
                    peer,
                    bytes: bytes_in_msg,
                    blocks: blocks_in_msg,
                });
            }
            Err(err) => {
                let err = EngineError::network_send(err);
                warn!(%peer, error = %err, "network send failed, tasks still marked done");
                let _ = events_tx.try_broadcast(EngineEvent::Error {
                    peer: Some(peer),
                    message: err.to_string(),
                });
            }
        }
    }

    let mut guard = inner.lock().await;
    guard.queue.tasks_done(&peer, &cids_done);
    // A satisfied Want-Block is done for good; a Want-Have survives so a
    // later Want-Block for the same CID still has something to upgrade.
    if !block_wants_satisfied.is_empty() {
        let ledger = guard.ledger_mut(peer, config.max_ledgers);
        for cid in &block_wants_satisfied {
            ledger.cancel_want(cid);
        }
    }
    let has_more = guard.queue.has_peer(&peer) && guard.queue.pending_bytes(&peer) > 0;
    drop(guard);

    if has_more {
        ready.push(peer);
    }
}

/// Render one task into the outbound message. A `Want-Have` over a small
/// enough present block is promoted to an actual `Block` attachment
/// instead of a `Have` presence, rather than sending both for the same
/// CID. Returns `Ok(true)` when an actual block payload (not just a
/// presence) was attached for `task.cid`, so the caller can retire a
/// satisfied `Want-Block` entry from the ledger; `Err` when the block
/// store read itself failed.
async fn render_task<S: BlockStore>(
    task: &Task,
    store: &S,
    config: &EngineConfig,
    msg: &mut BitswapMessage,
) -> Result<bool, EngineError> {
    let fetched = match store.get(&task.cid).await {
        Ok(data) => data,
        Err(err) => {
            warn!(cid = %task.cid, error = %err, "block store read failed, dropping task");
            return Err(EngineError::block_store(err));
        }
    };

    Ok(match (task.want_type, fetched) {
        (WantType::Block, Some(data)) => {
            msg.add_block(Block::new(task.cid, data));
            true
        }
        (WantType::Have, Some(data))
            if config.max_size_replace_has_with_block > 0
                && data.len() as u64 <= config.max_size_replace_has_with_block =>
        {
            msg.add_block(Block::new(task.cid, data));
            true
        }
        (WantType::Have, Some(_)) => {
            msg.add_block_presence(BlockPresence::have(task.cid));
            false
        }
        (_, None) => {
            if task.send_dont_have {
                msg.add_block_presence(BlockPresence::dont_have(task.cid));
            }
            false
        }
    })
}
