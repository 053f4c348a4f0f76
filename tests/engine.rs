//! End-to-end scenarios driving a real `Engine` against in-memory
//! `Network`/`BlockStore` fakes. No sockets, no real transport: both
//! collaborators are swapped in through the capability traits in
//! `network.rs`/`store.rs`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use bytes::Bytes;
use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use iroh_bitswap_engine::{
    BitswapMessage, Block, BlockStore, Engine, EngineConfig, Network, PeerId, Wantlist,
};

const RAW_CODEC: u64 = 0x55;

fn block_from(data: &[u8]) -> Block {
    let hash = Code::Sha2_256.digest(data);
    Block::new(Cid::new_v1(RAW_CODEC, hash), Bytes::copy_from_slice(data))
}

#[derive(Clone, Default)]
struct MockBlockStore {
    blocks: Arc<std::sync::Mutex<AHashMap<Cid, Bytes>>>,
}

impl MockBlockStore {
    fn with_blocks(blocks: &[Block]) -> Self {
        let store = Self::default();
        {
            let mut guard = store.blocks.lock().unwrap();
            for b in blocks {
                guard.insert(b.cid, b.data.clone());
            }
        }
        store
    }

    fn insert(&self, block: &Block) {
        self.blocks.lock().unwrap().insert(block.cid, block.data.clone());
    }
}

#[async_trait]
impl BlockStore for MockBlockStore {
    type Error = std::convert::Infallible;

    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, Self::Error> {
        Ok(self.blocks.lock().unwrap().get(cid).cloned())
    }

    async fn has(&self, cid: &Cid) -> Result<bool, Self::Error> {
        Ok(self.blocks.lock().unwrap().contains_key(cid))
    }

    async fn put_many(&self, blocks: Vec<Block>) -> Result<(), Self::Error> {
        let mut guard = self.blocks.lock().unwrap();
        for block in blocks {
            guard.insert(block.cid, block.data);
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MockNetwork {
    sent: Arc<std::sync::Mutex<Vec<(PeerId, BitswapMessage)>>>,
    fail_remaining: Arc<AtomicUsize>,
}

impl MockNetwork {
    fn failing_first(n: usize) -> Self {
        let net = Self::default();
        net.fail_remaining.store(n, Ordering::SeqCst);
        net
    }

    fn sent_messages(&self) -> Vec<(PeerId, BitswapMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("mock network send failure")]
struct MockSendError;

#[async_trait]
impl Network for MockNetwork {
    type Error = MockSendError;

    async fn send_message(&self, peer: PeerId, msg: BitswapMessage) -> Result<(), Self::Error> {
        if self.fail_remaining.load(Ordering::SeqCst) > 0 {
            self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(MockSendError);
        }
        self.sent.lock().unwrap().push((peer, msg));
        Ok(())
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

static TRACING_INIT: Once = Once::new();

/// Installs a `tracing_subscriber` once per test binary run, enabled via
/// `RUST_LOG` the same way `behaviour.rs`'s own (normally commented-out)
/// test init does; cheap to call unconditionally.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[tokio::test]
async fn consistent_accounting_across_many_small_messages() {
    init_tracing();
    let blocks: Vec<Block> = (0..1000u32)
        .map(|i| block_from(format!("payload-{i}").as_bytes()))
        .collect();
    let store = MockBlockStore::with_blocks(&blocks);
    let network = MockNetwork::default();
    let engine = Engine::new(store, network.clone(), EngineConfig::default());
    engine.start().await;

    let peer = PeerId::random();
    for block in &blocks {
        let mut wl = Wantlist::default();
        wl.want_block(block.cid, 1, false);
        engine
            .message_received(peer, BitswapMessage { wantlist: wl, ..BitswapMessage::new() })
            .await;
    }
    settle().await;

    let total_bytes: u64 = blocks.iter().map(|b| b.len() as u64).sum();
    assert_eq!(engine.num_bytes_sent_to(&peer).await, total_bytes);
    assert_eq!(engine.num_bytes_received_from(&peer).await, 0);

    // Simulate the receiving side observing the same bytes over the wire.
    let receiver_store = MockBlockStore::default();
    let receiver = Engine::new(receiver_store, MockNetwork::default(), EngineConfig::default());
    receiver.start().await;
    for (_, msg) in network.sent_messages() {
        receiver.account_received(peer, msg.blocks_len_bytes() as u64).await;
    }
    assert_eq!(
        receiver.num_bytes_received_from(&peer).await,
        engine.num_bytes_sent_to(&peer).await
    );
}

#[tokio::test]
async fn cancelled_wants_never_ship_once_blocks_arrive() {
    init_tracing();
    let letters: Vec<char> = ('a'..='z').collect();
    let blocks: AHashMap<char, Block> = letters
        .iter()
        .map(|c| (*c, block_from(c.to_string().as_bytes())))
        .collect();

    let store = MockBlockStore::default();
    let network = MockNetwork::default();
    let engine = Engine::new(store.clone(), network.clone(), EngineConfig::default());
    engine.start().await;
    let peer = PeerId::random();

    let mut wants = Wantlist::default();
    for c in &letters {
        wants.want_block(blocks[c].cid, 1, false);
    }
    engine
        .message_received(peer, BitswapMessage { wantlist: wants, ..BitswapMessage::new() })
        .await;

    let vowels = ['a', 'e', 'i', 'o', 'u'];
    let mut cancels = Wantlist::default();
    for v in vowels {
        cancels.cancel(blocks[&v].cid);
    }
    engine
        .message_received(peer, BitswapMessage { wantlist: cancels, ..BitswapMessage::new() })
        .await;

    let all_blocks: Vec<Block> = blocks.values().cloned().collect();
    for b in &all_blocks {
        store.insert(b);
    }
    engine.received_blocks(all_blocks).await;
    settle().await;

    let shipped: HashSet<Cid> = network
        .sent_messages()
        .into_iter()
        .flat_map(|(_, msg)| msg.blocks.into_keys())
        .collect();
    let expected: HashSet<Cid> = letters
        .iter()
        .filter(|c| !vowels.contains(c))
        .map(|c| blocks[c].cid)
        .collect();
    assert_eq!(shipped, expected);
}

#[tokio::test]
async fn round_robin_keeps_peers_within_fairness_bound() {
    init_tracing();
    let blocks: Vec<Block> = (0..20u32)
        .map(|i| block_from(vec![i as u8; 256 * 1024].as_slice()))
        .collect();
    let store = MockBlockStore::with_blocks(&blocks);
    let network = MockNetwork::default();
    let engine = Engine::new(store, network.clone(), EngineConfig::default());
    engine.start().await;

    let peers: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
    for peer in &peers {
        let mut wl = Wantlist::default();
        for (i, block) in blocks.iter().enumerate() {
            wl.want_block(block.cid, (blocks.len() - i) as i32, false);
        }
        engine
            .message_received(*peer, BitswapMessage { wantlist: wl, ..BitswapMessage::new() })
            .await;
    }
    settle().await;

    let mut served: AHashMap<PeerId, usize> = peers.iter().map(|p| (*p, 0)).collect();
    for (peer, msg) in network.sent_messages() {
        *served.get_mut(&peer).unwrap() += msg.blocks.len();
        let max = served.values().max().copied().unwrap_or(0);
        let min = served.values().min().copied().unwrap_or(0);
        assert!(max - min < 16, "fairness bound violated: {served:?}");
    }
    for peer in &peers {
        assert_eq!(served[peer], blocks.len());
    }
}

#[tokio::test]
async fn have_vs_block_without_dont_have() {
    init_tracing();
    let b0 = block_from(&[0u8; 2048]); // large: Have stays a presence, not promoted
    let b1 = block_from(&[1u8; 2048]);
    let b2 = block_from(&[2u8; 8]);
    let b3 = block_from(&[3u8; 8]);

    let store = MockBlockStore::with_blocks(&[b0.clone(), b2.clone()]);
    let network = MockNetwork::default();
    let engine = Engine::new(store, network.clone(), EngineConfig::default());
    engine.start().await;
    let peer = PeerId::random();

    let mut wl = Wantlist::default();
    wl.want_have(b0.cid, 4, false);
    wl.want_have(b1.cid, 3, false);
    wl.want_block(b2.cid, 2, false);
    wl.want_block(b3.cid, 1, false);
    engine
        .message_received(peer, BitswapMessage { wantlist: wl, ..BitswapMessage::new() })
        .await;
    settle().await;

    let sent = network.sent_messages();
    assert_eq!(sent.len(), 1);
    let (_, msg) = &sent[0];
    assert_eq!(msg.blocks.keys().copied().collect::<HashSet<_>>(), HashSet::from([b2.cid]));
    assert_eq!(
        msg.block_presences.get(&b0.cid),
        Some(&iroh_bitswap_engine::BlockPresenceType::Have)
    );
    assert!(!msg.block_presences.contains_key(&b1.cid));
    assert!(!msg.block_presences.contains_key(&b3.cid));
}

#[tokio::test]
async fn dont_have_then_promoted_on_arrival() {
    init_tracing();
    let b0 = block_from(&[10u8; 16]); // small: promoted once it arrives
    let b1 = block_from(&[11u8; 16]);
    let b2 = block_from(&[12u8; 8]);
    let b3 = block_from(&[13u8; 8]);

    let store = MockBlockStore::with_blocks(&[b0.clone(), b2.clone()]);
    let network = MockNetwork::default();
    let engine = Engine::new(store.clone(), network.clone(), EngineConfig::default());
    engine.start().await;
    let peer = PeerId::random();

    let mut wl = Wantlist::default();
    wl.want_have(b0.cid, 4, true);
    wl.want_have(b1.cid, 3, true);
    wl.want_block(b2.cid, 2, true);
    wl.want_block(b3.cid, 1, true);
    engine
        .message_received(peer, BitswapMessage { wantlist: wl, ..BitswapMessage::new() })
        .await;
    settle().await;

    let first = network.sent_messages();
    let (_, first_msg) = first.last().expect("first batch sent");
    assert_eq!(
        first_msg.block_presences.get(&b1.cid),
        Some(&iroh_bitswap_engine::BlockPresenceType::DontHave)
    );
    assert_eq!(
        first_msg.block_presences.get(&b3.cid),
        Some(&iroh_bitswap_engine::BlockPresenceType::DontHave)
    );

    store.insert(&b1);
    store.insert(&b3);
    engine.received_blocks(vec![b0.clone(), b1.clone(), b2.clone(), b3.clone()]).await;
    settle().await;

    let all_blocks_sent: HashSet<Cid> = network
        .sent_messages()
        .into_iter()
        .flat_map(|(_, msg)| msg.blocks.into_keys())
        .collect();
    // b0 and b1 promoted from Have to Block because they are small; b3
    // ships as a Block because it was always a Want-Block.
    assert!(all_blocks_sent.contains(&b0.cid));
    assert!(all_blocks_sent.contains(&b1.cid));
    assert!(all_blocks_sent.contains(&b3.cid));
}

#[tokio::test]
async fn send_failure_does_not_strand_tasks() {
    init_tracing();
    let block = block_from(b"resilience");
    let store = MockBlockStore::with_blocks(&[block.clone()]);
    let network = MockNetwork::failing_first(1);
    let engine = Engine::new(store, network.clone(), EngineConfig::default());
    engine.start().await;
    let peer = PeerId::random();

    let mut wl = Wantlist::default();
    wl.want_block(block.cid, 1, false);
    engine
        .message_received(peer, BitswapMessage { wantlist: wl, ..BitswapMessage::new() })
        .await;
    settle().await;

    // The first send failed, so nothing shipped yet, but the engine must
    // keep accepting work rather than getting stuck.
    assert!(network.sent_messages().is_empty());

    let second = block_from(b"still alive");
    engine.received_blocks(vec![second.clone()]).await;
    let mut wl2 = Wantlist::default();
    wl2.want_block(second.cid, 1, false);
    engine
        .message_received(peer, BitswapMessage { wantlist: wl2, ..BitswapMessage::new() })
        .await;
    settle().await;

    let shipped: HashSet<Cid> = network
        .sent_messages()
        .into_iter()
        .flat_map(|(_, msg)| msg.blocks.into_keys())
        .collect();
    assert!(shipped.contains(&second.cid));
    assert_eq!(engine.peers().await, vec![peer]);
}

#[tokio::test]
async fn full_wantlist_purges_stale_pending_tasks() {
    init_tracing();
    let stale = block_from(b"no longer wanted");
    let fresh = block_from(b"still wanted");
    let store = MockBlockStore::with_blocks(&[stale.clone(), fresh.clone()]);
    let network = MockNetwork::default();
    let engine = Engine::new(store, network.clone(), EngineConfig::default());
    engine.start().await;
    let peer = PeerId::random();

    // Neither call below actually suspends (no real I/O or timers), so the
    // Processor, woken only at the end of `message_received`, never gets
    // a chance to run between these two calls: the stale task is purged
    // from `pending` before it can ever be rendered.
    let mut first = Wantlist::default();
    first.want_block(stale.cid, 1, false);
    engine
        .message_received(peer, BitswapMessage { wantlist: first, ..BitswapMessage::new() })
        .await;

    let mut replacement = Wantlist::default();
    replacement.full = true;
    replacement.want_block(fresh.cid, 1, false);
    engine
        .message_received(peer, BitswapMessage { wantlist: replacement, ..BitswapMessage::new() })
        .await;

    settle().await;

    let shipped: HashSet<Cid> = network
        .sent_messages()
        .into_iter()
        .flat_map(|(_, msg)| msg.blocks.into_keys())
        .collect();
    assert!(!shipped.contains(&stale.cid), "stale pending task must not ship after a full wantlist replaces it");
    assert!(shipped.contains(&fresh.cid));
}

#[tokio::test]
async fn batches_split_at_the_soft_target_not_the_hard_cap() {
    init_tracing();
    let blocks: Vec<Block> = (0..6u32).map(|i| block_from(vec![i as u8; 1024].as_slice())).collect();
    let store = MockBlockStore::with_blocks(&blocks);
    let network = MockNetwork::default();
    // Each block is 1 KiB; a target of 2 KiB should group them roughly two
    // at a time even though max_message_size is far larger.
    let config = EngineConfig {
        target_message_size: 2048,
        max_message_size: 512 * 1024,
        ..EngineConfig::default()
    };
    let engine = Engine::new(store, network.clone(), config);
    engine.start().await;
    let peer = PeerId::random();

    let mut wl = Wantlist::default();
    for block in &blocks {
        wl.want_block(block.cid, 1, false);
    }
    engine
        .message_received(peer, BitswapMessage { wantlist: wl, ..BitswapMessage::new() })
        .await;
    settle().await;

    let sent = network.sent_messages();
    assert!(sent.len() > 1, "expected multiple batches under a small target, got {}", sent.len());
    for (_, msg) in &sent {
        assert!(msg.blocks_len_bytes() <= 512 * 1024);
    }
    let shipped: HashSet<Cid> = sent.into_iter().flat_map(|(_, msg)| msg.blocks.into_keys()).collect();
    assert_eq!(shipped, blocks.iter().map(|b| b.cid).collect());
}
