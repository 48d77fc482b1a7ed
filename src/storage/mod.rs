//! Persistence: the key/value contract, its backends, and the authenticated
//! account state built on top.

pub mod accounts;
pub mod accounts_tree;
pub mod chain_store;
pub mod kv;
pub mod memory_store;
pub mod rocksdb_store;
