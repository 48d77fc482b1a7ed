//! Accounts façade: applies and reverts block bodies against the tree.

use crate::core::account::{Account, AccountError};
use crate::core::block::BlockBody;
use crate::core::policy::block_reward;
use crate::core::transaction::Transaction;
use crate::storage::accounts_tree::{AccountsTree, AccountsTreeTx, TreeTxError};
use crate::storage::kv::{KeyValueStore, StoreError};
use crate::types::address::Address;
use crate::types::hash::Hash;
use aurum_derive::Error;
use std::sync::Arc;

/// Errors applying or reverting a block body.
#[derive(Debug, Error)]
pub enum AccountsError {
    /// A transaction violates an account invariant (balance, nonce).
    #[error("invalid transaction: {0}")]
    InvalidTransaction(AccountError),

    /// Transactions must move a nonzero amount.
    #[error("transaction value must be nonzero")]
    ZeroValue,

    /// Self-transfers are rejected; they only burn fees and bloat blocks.
    #[error("sender and recipient are the same account")]
    SelfTransfer,

    /// The coinbase credit would overflow the miner's balance.
    #[error("coinbase amount overflows")]
    CoinbaseOverflow,

    /// The backing store failed.
    #[error("{0}")]
    Store(StoreError),
}

impl From<AccountError> for AccountsError {
    fn from(value: AccountError) -> Self {
        AccountsError::InvalidTransaction(value)
    }
}

impl From<StoreError> for AccountsError {
    fn from(value: StoreError) -> Self {
        AccountsError::Store(value)
    }
}

/// Account state access for the chain: block-body application, reversion,
/// and read-only lookups.
///
/// Every body application runs inside one tree transaction; the chain folds
/// its own metadata writes into the same commit for atomicity.
pub struct Accounts {
    tree: AccountsTree,
}

impl Accounts {
    /// Opens the account state over the given store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Result<Self, StoreError> {
        Ok(Self {
            tree: AccountsTree::new(store)?,
        })
    }

    /// Current state commitment.
    pub fn root_hash(&self) -> Hash {
        self.tree.root_hash()
    }

    /// Looks up an account; absent addresses yield the zero account.
    pub fn get(&self, addr: &Address) -> Result<Account, StoreError> {
        self.tree.get(addr)
    }

    /// Opens a tree transaction, waiting for any open one to close.
    pub fn begin(&self) -> AccountsTreeTx<'_> {
        self.tree.transaction()
    }

    /// Opens a tree transaction without waiting.
    pub fn try_begin(&self) -> Result<AccountsTreeTx<'_>, TreeTxError> {
        self.tree.try_transaction()
    }

    /// Writes the genesis allocations. Only valid on an empty tree.
    pub fn populate(&self, allocations: &[(Address, Account)]) -> Result<(), StoreError> {
        let mut tx = self.tree.transaction();
        for (address, account) in allocations {
            tx.put(address, *account)?;
        }
        tx.commit()
    }

    /// Applies a body in its own transaction and returns the new root.
    ///
    /// The caller compares the returned root against the block header's
    /// accounts hash and rejects the block on mismatch.
    pub fn commit_block_body(&self, body: &BlockBody, height: u32) -> Result<Hash, AccountsError> {
        let mut tx = self.begin();
        Self::apply_body(&mut tx, body, height)?;
        let root = tx.root_hash();
        tx.commit()?;
        Ok(root)
    }

    /// Reverts a previously applied body in its own transaction.
    pub fn revert_block_body(&self, body: &BlockBody, height: u32) -> Result<Hash, AccountsError> {
        let mut tx = self.begin();
        Self::revert_body(&mut tx, body, height)?;
        let root = tx.root_hash();
        tx.commit()?;
        Ok(root)
    }

    /// Applies a body into an already-open transaction: every transaction in
    /// canonical order, then the coinbase credit.
    pub fn apply_body(
        tx: &mut AccountsTreeTx<'_>,
        body: &BlockBody,
        height: u32,
    ) -> Result<(), AccountsError> {
        let mut fees: u64 = 0;
        for transaction in &body.transactions {
            Self::apply_transaction(tx, transaction)?;
            fees = fees
                .checked_add(transaction.fee)
                .ok_or(AccountsError::CoinbaseOverflow)?;
        }
        Self::apply_coinbase(tx, &body.miner, height, fees)
    }

    /// Exact inverse of [`apply_body`](Self::apply_body): coinbase first,
    /// then the transactions in reverse order.
    pub fn revert_body(
        tx: &mut AccountsTreeTx<'_>,
        body: &BlockBody,
        height: u32,
    ) -> Result<(), AccountsError> {
        let mut fees: u64 = 0;
        for transaction in &body.transactions {
            fees = fees
                .checked_add(transaction.fee)
                .ok_or(AccountsError::CoinbaseOverflow)?;
        }
        Self::revert_coinbase(tx, &body.miner, height, fees)?;

        for transaction in body.transactions.iter().rev() {
            Self::revert_transaction(tx, transaction)?;
        }
        Ok(())
    }

    /// Debits the sender (value + fee, nonce check) and credits the recipient.
    pub(crate) fn apply_transaction(
        tx: &mut AccountsTreeTx<'_>,
        transaction: &Transaction,
    ) -> Result<(), AccountsError> {
        if transaction.value == 0 {
            return Err(AccountsError::ZeroValue);
        }
        let sender_addr = transaction.sender();
        if sender_addr == transaction.recipient {
            return Err(AccountsError::SelfTransfer);
        }

        let mut sender = tx.get(&sender_addr)?;
        sender.debit_outgoing(transaction.value, transaction.fee, transaction.nonce)?;
        tx.put(&sender_addr, sender)?;

        let mut recipient = tx.get(&transaction.recipient)?;
        recipient.credit(transaction.value)?;
        tx.put(&transaction.recipient, recipient)?;

        Ok(())
    }

    fn revert_transaction(
        tx: &mut AccountsTreeTx<'_>,
        transaction: &Transaction,
    ) -> Result<(), AccountsError> {
        let mut recipient = tx.get(&transaction.recipient)?;
        recipient.revert_credit(transaction.value)?;
        tx.put(&transaction.recipient, recipient)?;

        let sender_addr = transaction.sender();
        let mut sender = tx.get(&sender_addr)?;
        sender.revert_outgoing(transaction.value, transaction.fee, transaction.nonce)?;
        tx.put(&sender_addr, sender)?;

        Ok(())
    }

    /// Credits the miner with the block reward plus all fees.
    pub(crate) fn apply_coinbase(
        tx: &mut AccountsTreeTx<'_>,
        miner: &Address,
        height: u32,
        fees: u64,
    ) -> Result<(), AccountsError> {
        let amount = block_reward(height)
            .checked_add(fees)
            .ok_or(AccountsError::CoinbaseOverflow)?;

        let mut account = tx.get(miner)?;
        account.credit(amount)?;
        tx.put(miner, account)?;
        Ok(())
    }

    fn revert_coinbase(
        tx: &mut AccountsTreeTx<'_>,
        miner: &Address,
        height: u32,
        fees: u64,
    ) -> Result<(), AccountsError> {
        let amount = block_reward(height)
            .checked_add(fees)
            .ok_or(AccountsError::CoinbaseOverflow)?;

        let mut account = tx.get(miner)?;
        account.revert_credit(amount)?;
        tx.put(miner, account)?;
        Ok(())
    }
}
