//! Persistent per-block chain metadata and the main-chain head pointer.

use crate::core::block::Block;
use crate::storage::kv::{KeyValueStore, StoreError, WriteBatch, keyspace};
use crate::types::encoding::{Decode, Encode};
use crate::types::hash::Hash;
use aurum_derive::BinaryCodec;
use std::sync::Arc;

/// Fork-choice metadata tracked for every stored block.
///
/// Records are created when a block is stored and flipped during
/// rebranching; they are never deleted. The store is an incrementally
/// maintained index over the block set, rebuildable from the blocks alone.
#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub struct ChainData {
    /// The block itself.
    pub block: Block,
    /// Cumulative difficulty along this branch, the fork-choice metric.
    pub total_work: u128,
    /// True while this block lies on the main chain.
    pub on_main_chain: bool,
    /// The next main-chain block, when this block is on the main chain and
    /// not the head.
    pub main_chain_successor: Option<Hash>,
}

impl ChainData {
    /// Creates chain data for a newly stored block, not yet on the main chain.
    pub fn new(block: Block, total_work: u128) -> Self {
        Self {
            block,
            total_work,
            on_main_chain: false,
            main_chain_successor: None,
        }
    }
}

/// Keyed access to [`ChainData`] records plus the head pointer, in the
/// `chaindata/` key range.
pub struct ChainStore {
    store: Arc<dyn KeyValueStore>,
}

impl ChainStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn data_key(hash: &Hash) -> Vec<u8> {
        keyspace::key(keyspace::CHAIN_DATA, hash.as_slice())
    }

    /// Loads the chain data for a block hash.
    pub fn get(&self, hash: &Hash) -> Result<Option<ChainData>, StoreError> {
        match self.store.get(&Self::data_key(hash))? {
            Some(bytes) => Ok(Some(ChainData::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns true if a block with the given hash is stored.
    pub fn contains(&self, hash: &Hash) -> Result<bool, StoreError> {
        Ok(self.store.get(&Self::data_key(hash))?.is_some())
    }

    /// Writes a single chain data record immediately.
    pub fn put(&self, hash: &Hash, data: &ChainData) -> Result<(), StoreError> {
        self.store.put(&Self::data_key(hash), data.to_bytes())
    }

    /// Queues a chain data write into a caller-owned batch.
    pub fn put_batched(&self, batch: &mut WriteBatch, hash: &Hash, data: &ChainData) {
        batch.put(Self::data_key(hash), data.to_bytes());
    }

    /// Removes a chain data record immediately.
    pub fn delete(&self, hash: &Hash) -> Result<(), StoreError> {
        self.store.delete(&Self::data_key(hash))
    }

    /// Reads the head pointer, if one has been set.
    pub fn head_hash(&self) -> Result<Option<Hash>, StoreError> {
        match self.store.get(keyspace::HEAD)? {
            Some(bytes) => Ok(Some(Hash::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Queues a head pointer update into a caller-owned batch.
    pub fn set_head_batched(&self, batch: &mut WriteBatch, hash: &Hash) {
        batch.put(keyspace::HEAD.to_vec(), hash.to_bytes());
    }

    /// Applies a batch assembled by the caller.
    pub fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.store.write(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_store::MemoryStore;
    use crate::utils::test_utils::utils::block_at;

    fn chain_store() -> ChainStore {
        ChainStore::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn get_missing_returns_none() {
        let store = chain_store();
        assert_eq!(store.get(&Hash::digest(b"nope")).unwrap(), None);
        assert!(!store.contains(&Hash::digest(b"nope")).unwrap());
    }

    #[test]
    fn put_then_get_roundtrip() {
        let store = chain_store();
        let block = block_at(1, Hash::zero());
        let hash = block.hash();

        let mut data = ChainData::new(block, 42);
        data.on_main_chain = true;
        data.main_chain_successor = Some(Hash::digest(b"next"));

        store.put(&hash, &data).unwrap();

        let loaded = store.get(&hash).unwrap().expect("stored");
        assert_eq!(loaded, data);
        assert!(store.contains(&hash).unwrap());
    }

    #[test]
    fn head_pointer_roundtrip() {
        let store = chain_store();
        assert_eq!(store.head_hash().unwrap(), None);

        let head = Hash::digest(b"head");
        let mut batch = WriteBatch::new();
        store.set_head_batched(&mut batch, &head);
        store.write(batch).unwrap();

        assert_eq!(store.head_hash().unwrap(), Some(head));
    }

    #[test]
    fn batched_writes_land_together() {
        let store = chain_store();
        let block = block_at(1, Hash::zero());
        let hash = block.hash();
        let data = ChainData::new(block, 1);

        let mut batch = WriteBatch::new();
        store.put_batched(&mut batch, &hash, &data);
        store.set_head_batched(&mut batch, &hash);
        store.write(batch).unwrap();

        assert_eq!(store.get(&hash).unwrap(), Some(data));
        assert_eq!(store.head_hash().unwrap(), Some(hash));
    }
}
