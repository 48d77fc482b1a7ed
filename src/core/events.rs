//! Typed event streams connecting the chain, mempool, and miner.
//!
//! Each subsystem owns a broadcast channel and publishes strongly-typed
//! events; subscribers receive them in publish order. Causality is enforced
//! by the publishers: a block's `BlockAdded` precedes the `HeadChanged` it
//! triggers, the mempool emits `TransactionsReady` only after its
//! head-change sweep finishes, and the miner restarts only after that.

use crate::types::hash::Hash;
use tokio::sync::broadcast;

/// Buffered events per channel before slow subscribers start lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a broadcast channel with the standard capacity.
pub fn channel<T: Clone>() -> broadcast::Sender<T> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// Events published by the blockchain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
    /// A block was stored, on either chain.
    BlockAdded(Hash),
    /// The main-chain head moved. `rebranch_depth` is the number of blocks
    /// reverted to reach the new head; zero for a plain extension.
    HeadChanged { hash: Hash, rebranch_depth: u32 },
}

/// Events published by the mempool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MempoolEvent {
    /// A transaction was accepted; events are ordered by acceptance.
    TransactionAdded(Hash),
    /// The head-change revalidation sweep finished; the pending set is
    /// consistent with the new head.
    TransactionsReady,
}

/// Events published by the miner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MinerEvent {
    /// A proof-of-work solution was found for the given block hash.
    BlockMined(Hash),
    /// Updated hashes-per-second estimate, published once per second while
    /// mining.
    HashrateChanged(u64),
}
