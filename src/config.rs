use std::time::Duration;

/// Recognized engine options. Mirrors `BitswapConfig` in the original
/// `iroh-bitswap::behaviour` module, minus the libp2p/transport specific
/// fields (`max_cached_peers`, `idle_timeout`, `protocol_config`) that
/// belong to the network layer, not the decision engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Cap per outbound message, in bytes.
    pub max_message_size: usize,
    /// Soft target below `max_message_size` the Processor aims for when
    /// it has a choice of how much to batch.
    pub target_message_size: usize,
    /// Promote a Have response to a full Block response when the block
    /// fits under this many bytes. `0` disables the promotion.
    pub max_size_replace_has_with_block: u64,
    /// Debounce window for coalescing bursts of newly pushed tasks into
    /// a single Processor cycle.
    pub task_coalesce_delay: Duration,
    /// Upper bound on the number of peer ledgers tracked at once, the
    /// way `BitswapConfig::max_ledgers` bounds `iroh-bitswap`'s LRU of
    /// per-peer state.
    pub max_ledgers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_message_size: 512 * 1024,
            target_message_size: 256 * 1024,
            // Production default; some test suites run with 0 to disable
            // the promotion entirely and assert on plain Have/DontHave.
            max_size_replace_has_with_block: 1024,
            task_coalesce_delay: Duration::from_millis(10),
            max_ledgers: 1024,
        }
    }
}
