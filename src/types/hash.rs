//! 32-byte SHA3-256 hash type with zero-allocation operations.

use crate::types::encoding::{Decode, DecodeError, EncodeSink};
use aurum_derive::BinaryCodec;
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::sync::Mutex;

/// SHA3-256 hash length in bytes.
pub const HASH_LEN: usize = 32;

/// Fixed-size 32-byte hash used throughout the node.
///
/// This type is `Copy` for performance - hashes are passed frequently during
/// block validation and should live on the stack to avoid heap allocations.
///
/// `Ord` compares bytes lexicographically, which for a fixed-width big-endian
/// encoding is identical to comparing the hashes as 256-bit integers. The
/// proof-of-work check relies on this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BinaryCodec, Default, Hash, Ord, PartialOrd)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    /// Creates a zero-valued hash (all bytes are 0x00).
    ///
    /// Used as a sentinel value for the genesis predecessor and unset roots.
    pub const fn zero() -> Hash {
        Hash([0u8; HASH_LEN])
    }

    /// Returns the hash as a byte slice.
    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Creates a hash from a byte slice.
    ///
    /// Returns `None` if the slice length is not exactly [`HASH_LEN`] bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Hash> {
        if slice.len() != HASH_LEN {
            return None;
        }
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(slice);
        Some(Hash(bytes))
    }

    /// Creates a new SHA3-256 hash builder for incremental hashing.
    ///
    /// Use this for streaming data or when computing hashes over multiple inputs
    /// without intermediate allocations.
    pub fn sha3() -> HashBuilder {
        HashBuilder::new()
    }

    /// Hashes a single byte slice.
    pub fn digest(data: &[u8]) -> Hash {
        Hash::sha3().chain(data).finalize()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Incremental SHA3-256 hash builder.
///
/// Allows feeding data in chunks and finalizing to produce a [`Hash`].
/// Implements [`EncodeSink`] so encodable types can be hashed directly
/// without intermediate byte buffers.
pub struct HashBuilder {
    hasher: Sha3_256,
}

impl HashBuilder {
    /// Creates a new empty hash builder.
    pub fn new() -> Self {
        Self {
            hasher: Sha3_256::new(),
        }
    }

    /// Feeds data into the hash computation.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn chain(mut self, data: &[u8]) -> Self {
        self.hasher.update(data);
        self
    }

    /// Consumes the builder and returns the final hash.
    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

impl Default for HashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EncodeSink for HashBuilder {
    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }
}

/// Lazily-computed hash cache for immutable structures.
///
/// Blocks and transactions never change after construction, so their
/// canonical hash is computed at most once and reused.
#[derive(Debug, Default)]
pub struct HashCache {
    cached: Mutex<Option<Hash>>,
}

impl HashCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            cached: Mutex::new(None),
        }
    }

    /// Returns the cached hash, computing it via `f` on first call.
    pub fn get_or_compute(&self, f: impl FnOnce() -> Hash) -> Hash {
        let mut guard = self.cached.lock().unwrap();
        match *guard {
            Some(hash) => hash,
            None => {
                let hash = f();
                *guard = Some(hash);
                hash
            }
        }
    }
}

impl Clone for HashCache {
    fn clone(&self) -> Self {
        let cached = *self.cached.lock().unwrap();
        HashCache {
            cached: Mutex::new(cached),
        }
    }
}

// The cache never participates in the wire format: encoding writes nothing
// and decoding yields a fresh empty cache.
impl crate::types::encoding::Encode for HashCache {
    fn encode<S: EncodeSink>(&self, _out: &mut S) {}
}

impl Decode for HashCache {
    fn decode(_input: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(HashCache::new())
    }
}
