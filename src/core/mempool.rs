//! Pending-transaction pool, kept consistent with the chain head.
//!
//! Transactions are indexed by id for duplicate detection and per sender in
//! nonce order for block assembly. Admission enforces joint validity: per
//! sender, nonces are contiguous starting at the account nonce and the
//! cumulative cost stays within the account balance.
//!
//! On every head change the pool is re-validated in one sweep; entries that
//! were included, went stale, or no longer fit the sender's balance are
//! dropped, and `TransactionsReady` is emitted exactly once when the sweep
//! completes. That event is the miner's signal that restarting work is safe.

use crate::core::chain::Blockchain;
use crate::core::events::{self, ChainEvent, MempoolEvent};
use crate::core::policy::MIN_TX_FEE;
use crate::core::transaction::Transaction;
use crate::storage::kv::StoreError;
use crate::types::address::Address;
use crate::types::hash::Hash;
use crate::{error, warn};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Outcome of offering a transaction to the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxResult {
    /// The transaction was accepted and indexed.
    Added,
    /// The transaction is already pending.
    Known,
    /// The transaction failed validation against the current head state.
    Invalid,
}

/// The pool of unconfirmed transactions.
pub struct Mempool {
    chain: Arc<Blockchain>,
    /// Primary index by transaction id.
    by_hash: DashMap<Hash, Arc<Transaction>>,
    /// Nonce-ordered pending queue per sender; guarded for single-writer
    /// admission and sweeps.
    by_sender: RwLock<HashMap<Address, BTreeMap<u32, Arc<Transaction>>>>,
    events: broadcast::Sender<MempoolEvent>,
}

impl Mempool {
    /// Creates an empty pool validating against the given chain.
    pub fn new(chain: Arc<Blockchain>) -> Arc<Self> {
        Arc::new(Self {
            chain,
            by_hash: DashMap::new(),
            by_sender: RwLock::new(HashMap::new()),
            events: events::channel(),
        })
    }

    /// Subscribes to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<MempoolEvent> {
        self.events.subscribe()
    }

    /// Returns true if a transaction with the given id is pending.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Number of pending transactions.
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// Returns true if no transactions are pending.
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Offers a transaction to the pool.
    ///
    /// Admission requires a valid signature, a nonzero value, the policy
    /// minimum fee, the next contiguous nonce for the sender (accounting for
    /// already-pending transactions), and cumulative affordability.
    pub fn push_transaction(&self, transaction: Transaction) -> Result<TxResult, StoreError> {
        let hash = transaction.id();
        if self.by_hash.contains_key(&hash) {
            return Ok(TxResult::Known);
        }

        if !transaction.verify_signature() {
            warn!("rejecting transaction {hash}: invalid signature");
            return Ok(TxResult::Invalid);
        }
        if transaction.value == 0 {
            warn!("rejecting transaction {hash}: zero value");
            return Ok(TxResult::Invalid);
        }
        if transaction.fee < MIN_TX_FEE {
            warn!("rejecting transaction {hash}: fee below minimum");
            return Ok(TxResult::Invalid);
        }
        let sender = transaction.sender();
        if sender == transaction.recipient {
            warn!("rejecting transaction {hash}: sender pays itself");
            return Ok(TxResult::Invalid);
        }

        let mut by_sender = self.by_sender.write().unwrap();
        let account = self.chain.accounts().get(&sender)?;
        let pending = by_sender.get(&sender);

        let pending_count = pending.map_or(0, |p| p.len()) as u32;
        let expected_nonce = account.nonce + pending_count;
        if transaction.nonce != expected_nonce {
            warn!(
                "rejecting transaction {hash}: nonce {} but {expected_nonce} is next for sender",
                transaction.nonce
            );
            return Ok(TxResult::Invalid);
        }

        let pending_cost: u64 = pending.map_or(0, |p| {
            p.values()
                .map(|tx| tx.value.saturating_add(tx.fee))
                .fold(0u64, u64::saturating_add)
        });
        let cost = transaction.value.saturating_add(transaction.fee);
        if pending_cost.saturating_add(cost) > account.balance {
            warn!("rejecting transaction {hash}: cumulative cost exceeds sender balance");
            return Ok(TxResult::Invalid);
        }

        let transaction = Arc::new(transaction);
        by_sender
            .entry(sender)
            .or_default()
            .insert(transaction.nonce, Arc::clone(&transaction));
        self.by_hash.insert(hash, transaction);
        drop(by_sender);

        let _ = self.events.send(MempoolEvent::TransactionAdded(hash));
        Ok(TxResult::Added)
    }

    /// Returns up to `max` transactions forming a jointly valid set.
    ///
    /// Selection is deterministic: repeatedly take the best next-in-nonce
    /// candidate across senders, ordered by fee (descending; transactions
    /// have a fixed wire size, so this is fee-per-byte order) and then by
    /// sender address and nonce. Per-sender nonce contiguity and cumulative
    /// balance are preserved.
    pub fn get_transactions(&self, max: usize) -> Result<Vec<Arc<Transaction>>, StoreError> {
        let by_sender = self.by_sender.read().unwrap();

        struct SenderQueue {
            sender: Address,
            pending: Vec<Arc<Transaction>>,
            position: usize,
            budget: u64,
        }

        let mut queues = Vec::with_capacity(by_sender.len());
        let mut senders: Vec<&Address> = by_sender.keys().collect();
        senders.sort_unstable();
        for sender in senders {
            let account = self.chain.accounts().get(sender)?;
            queues.push(SenderQueue {
                sender: *sender,
                pending: by_sender[sender].values().cloned().collect(),
                position: 0,
                budget: account.balance,
            });
        }
        drop(by_sender);

        let mut selected = Vec::new();
        while selected.len() < max {
            let mut best: Option<usize> = None;
            for (i, queue) in queues.iter().enumerate() {
                let Some(candidate) = queue.pending.get(queue.position) else {
                    continue;
                };
                if candidate.value.saturating_add(candidate.fee) > queue.budget {
                    continue;
                }
                best = match best {
                    None => Some(i),
                    Some(j) => {
                        let current = &queues[j].pending[queues[j].position];
                        // Higher fee wins; ties break on sender address,
                        // which also fixes the nonce order.
                        if candidate.fee > current.fee
                            || (candidate.fee == current.fee && queue.sender < queues[j].sender)
                        {
                            Some(i)
                        } else {
                            Some(j)
                        }
                    }
                };
            }

            let Some(i) = best else { break };
            let queue = &mut queues[i];
            let transaction = Arc::clone(&queue.pending[queue.position]);
            queue.budget -= transaction.value.saturating_add(transaction.fee);
            queue.position += 1;
            selected.push(transaction);
        }

        Ok(selected)
    }

    /// Re-validates every pending transaction against the current head
    /// state, dropping entries that no longer apply, then signals
    /// `TransactionsReady`.
    pub fn on_head_changed(&self) -> Result<(), StoreError> {
        let mut by_sender = self.by_sender.write().unwrap();
        let mut dropped: Vec<Hash> = Vec::new();

        for (sender, pending) in by_sender.iter_mut() {
            let account = self.chain.accounts().get(sender)?;
            let mut expected_nonce = account.nonce;
            let mut budget = account.balance;

            pending.retain(|nonce, transaction| {
                let cost = transaction.value.saturating_add(transaction.fee);
                if *nonce != expected_nonce || cost > budget {
                    dropped.push(transaction.id());
                    return false;
                }
                expected_nonce += 1;
                budget -= cost;
                true
            });
        }
        by_sender.retain(|_, pending| !pending.is_empty());
        drop(by_sender);

        for hash in &dropped {
            self.by_hash.remove(hash);
        }
        if !dropped.is_empty() {
            warn!("dropped {} transactions during head-change sweep", dropped.len());
        }

        let _ = self.events.send(MempoolEvent::TransactionsReady);
        Ok(())
    }

    /// Spawns the task that reacts to chain head changes with a
    /// re-validation sweep.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mempool = Arc::clone(self);
        let mut chain_events = mempool.chain.subscribe();

        tokio::spawn(async move {
            loop {
                match chain_events.recv().await {
                    Ok(ChainEvent::HeadChanged { .. }) => {
                        if let Err(err) = mempool.on_head_changed() {
                            error!("mempool sweep failed: {err}");
                        }
                    }
                    Ok(_) => {}
                    // Missed events still mean the head moved; sweep anyway.
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Err(err) = mempool.on_head_changed() {
                            error!("mempool sweep failed: {err}");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
