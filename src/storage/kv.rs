//! Key/value store contract shared by the accounts tree and chain store.
//!
//! Both subsystems persist into one backing store, each under its own key
//! prefix. Atomicity across subsystems comes from folding all writes of a
//! chain transition into a single [`WriteBatch`] and committing it with one
//! [`KeyValueStore::write`] call; dropping an uncommitted batch is an abort.

use crate::types::encoding::DecodeError;
use aurum_derive::Error;

/// Key prefixes partitioning the backing store between subsystems.
pub mod keyspace {
    /// Accounts tree nodes, content-addressed by node hash.
    pub const ACCOUNTS_TREE: &[u8] = b"accountstree/";
    /// Pointer to the current accounts tree root node.
    pub const ACCOUNTS_ROOT: &[u8] = b"accountstree/root";
    /// Per-block chain data records.
    pub const CHAIN_DATA: &[u8] = b"chaindata/";
    /// Pointer to the current main-chain head block.
    pub const HEAD: &[u8] = b"head";

    /// Concatenates a prefix and a key suffix.
    pub fn key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(prefix.len() + suffix.len());
        out.extend_from_slice(prefix);
        out.extend_from_slice(suffix);
        out
    }
}

/// Errors surfaced by storage backends and by decoding persisted records.
///
/// Storage failures are fatal for the operation that hit them: callers
/// propagate rather than retry, and open tree transactions are abandoned.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store failed to read or write.
    #[error("storage backend failure: {0}")]
    Backend(String),

    /// A persisted record failed to decode.
    #[error("corrupted store entry: {0}")]
    Corrupted(String),
}

impl From<DecodeError> for StoreError {
    fn from(value: DecodeError) -> Self {
        StoreError::Corrupted(value.to_string())
    }
}

/// An atomically-committable set of writes.
///
/// `None` values are deletions. Order is preserved; later writes to the same
/// key win, which the backends guarantee by applying ops in sequence.
#[derive(Default)]
pub struct WriteBatch {
    pub(crate) ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Queues an insert or overwrite.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push((key, Some(value)));
    }

    /// Queues a deletion.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push((key, None));
    }

    /// Appends all operations from another batch.
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if no operations are queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Storage backend contract.
///
/// Implementations must be thread-safe; concurrent readers may observe the
/// store while a writer assembles a batch, but a committed batch becomes
/// visible atomically.
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Writes a single key/value pair.
    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError>;

    /// Deletes a single key.
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Atomically applies all operations in the batch.
    fn write(&self, batch: WriteBatch) -> Result<(), StoreError>;
}
