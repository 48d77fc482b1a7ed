//! Fundamental value types: hashes, addresses, serialization, Merkle roots.

pub mod address;
pub mod encoding;
pub mod hash;
pub mod merkle_tree;
pub mod serializable_signature;
