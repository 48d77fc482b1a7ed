//! Blocks: header, interlink, and transaction body.

use crate::core::policy::{MAX_BLOCK_TXS, MAX_INTERLINK_DEPTH, MAX_TIMESTAMP_DRIFT_SECS, Target};
use crate::core::transaction::Transaction;
use crate::types::address::Address;
use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink};
use crate::types::hash::{Hash, HashCache};
use crate::types::merkle_tree::MerkleTree;
use aurum_derive::{BinaryCodec, Error};
use std::collections::HashSet;

/// Serialized header size in bytes: four 32-byte commitments followed by
/// four big-endian u32 fields.
pub const HEADER_SIZE: usize = 4 * 32 + 4 * 4;

/// Errors produced by intrinsic (stateless) block validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("interlink hash does not match interlink")]
    InterlinkHashMismatch,

    #[error("body hash does not match body")]
    BodyHashMismatch,

    #[error("timestamp {timestamp} exceeds allowed drift past {now}")]
    TimestampTooFarInFuture { timestamp: u32, now: u32 },

    #[error("header does not satisfy its own proof-of-work target")]
    InvalidProofOfWork,

    #[error("compact target encoding is invalid: {0:#010x}")]
    InvalidCompactTarget(u32),

    #[error("body holds {0} transactions, more than the block limit")]
    TooManyTransactions(usize),

    #[error("transaction signature verification failed")]
    InvalidTransactionSignature,

    #[error("body contains duplicate sender/nonce pair")]
    DuplicateTransaction,
}

/// Fixed-size block header carrying all chain commitments.
///
/// `accounts_hash` commits to the full account state after applying the
/// block; `interlink_hash` and `body_hash` commit to the interlink and body
/// so both can travel separately from the header.
#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub struct BlockHeader {
    /// Hash of the predecessor block's header.
    pub prev_hash: Hash,
    /// Commitment to the block's interlink.
    pub interlink_hash: Hash,
    /// Commitment to the block body.
    pub body_hash: Hash,
    /// Root hash of the accounts tree after applying this block.
    pub accounts_hash: Hash,
    /// Compact encoding of the proof-of-work target.
    pub n_bits: u32,
    /// Block height; genesis is 0.
    pub height: u32,
    /// Unix timestamp in seconds.
    pub timestamp: u32,
    /// Proof-of-work search nonce.
    pub nonce: u32,
}

impl BlockHeader {
    /// Hashes the serialized header; this is both the block identifier and
    /// the proof-of-work value.
    pub fn pow_hash(&self) -> Hash {
        let mut h = Hash::sha3();
        self.encode(&mut h);
        h.finalize()
    }

    /// Returns true if the header hash satisfies the target encoded in
    /// `n_bits`. An undecodable target never verifies.
    pub fn verify_proof_of_work(&self) -> bool {
        match Target::from_compact(self.n_bits) {
            Some(target) => target.is_met_by(self.pow_hash()),
            None => false,
        }
    }
}

/// Ordered list of ancestor hashes at exponentially increasing difficulty
/// levels, enabling succinct chain proofs. Entry `i` holds the most recent
/// ancestor whose proof-of-work satisfied the target halved `i + 1` times.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BlockInterlink(pub Vec<Hash>);

impl BlockInterlink {
    /// The genesis interlink carries no entries.
    pub fn empty() -> Self {
        BlockInterlink(Vec::new())
    }

    /// Commitment hash over the canonical serialization.
    pub fn hash(&self) -> Hash {
        let mut h = Hash::sha3();
        self.encode(&mut h);
        h.finalize()
    }

    /// Derives the interlink for the successor of the block this interlink
    /// belongs to.
    ///
    /// The parent replaces every level its own proof reaches under the
    /// successor's target; deeper levels carry over unchanged.
    pub fn next(&self, parent_pow: Hash, parent_hash: Hash, next_target: &Target) -> BlockInterlink {
        let mut depth = 0usize;
        while depth < MAX_INTERLINK_DEPTH
            && next_target.shr(depth as u32 + 1).is_met_by(parent_pow)
        {
            depth += 1;
        }

        let len = depth.max(self.0.len()).min(MAX_INTERLINK_DEPTH);
        let mut hashes = Vec::with_capacity(len);
        for i in 0..len {
            if i < depth {
                hashes.push(parent_hash);
            } else {
                hashes.push(self.0[i]);
            }
        }

        BlockInterlink(hashes)
    }
}

impl Encode for BlockInterlink {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        debug_assert!(self.0.len() <= MAX_INTERLINK_DEPTH);
        (self.0.len() as u8).encode(out);
        for hash in &self.0 {
            hash.encode(out);
        }
    }
}

impl Decode for BlockInterlink {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let count = u8::decode(input)? as usize;
        if count > MAX_INTERLINK_DEPTH {
            return Err(DecodeError::LengthOverflow);
        }

        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            hashes.push(Hash::decode(input)?);
        }
        Ok(BlockInterlink(hashes))
    }
}

/// Block body: the beneficiary address and the included transactions in
/// canonical (serialized) order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockBody {
    /// Address credited with the block reward and all fees.
    pub miner: Address,
    /// Included transactions; application order is this order.
    pub transactions: Vec<Transaction>,
}

impl BlockBody {
    /// Commitment hash: a Merkle root over the miner address followed by the
    /// transaction ids.
    pub fn hash(&self) -> Hash {
        let mut leaves = Vec::with_capacity(1 + self.transactions.len());
        leaves.push(Hash::digest(self.miner.as_slice()));
        for tx in &self.transactions {
            leaves.push(tx.id());
        }
        MerkleTree::from_raw(leaves)
    }

    /// Sum of all transaction fees in the body.
    pub fn total_fees(&self) -> u64 {
        self.transactions
            .iter()
            .fold(0u64, |acc, tx| acc.saturating_add(tx.fee))
    }

    /// Intrinsic validity: transaction count within the block limit, every
    /// signature valid, and no duplicate sender/nonce pair.
    pub fn verify(&self) -> Result<(), BlockError> {
        if self.transactions.len() > MAX_BLOCK_TXS {
            return Err(BlockError::TooManyTransactions(self.transactions.len()));
        }

        let mut seen = HashSet::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            if !tx.verify_signature() {
                return Err(BlockError::InvalidTransactionSignature);
            }
            if !seen.insert((tx.sender(), tx.nonce)) {
                return Err(BlockError::DuplicateTransaction);
            }
        }

        Ok(())
    }
}

// Wire layout: 1-byte transaction count || transactions || miner address.
impl Encode for BlockBody {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        debug_assert!(self.transactions.len() <= MAX_BLOCK_TXS);
        (self.transactions.len() as u8).encode(out);
        for tx in &self.transactions {
            tx.encode(out);
        }
        self.miner.encode(out);
    }
}

impl Decode for BlockBody {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let count = u8::decode(input)? as usize;
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(Transaction::decode(input)?);
        }
        let miner = Address::decode(input)?;
        Ok(BlockBody {
            miner,
            transactions,
        })
    }
}

/// Immutable block: header, interlink, and an optional body.
///
/// The body is optional to support header-only propagation; a block can
/// only extend the main chain once its body is available.
#[derive(Clone, Debug, BinaryCodec)]
pub struct Block {
    pub header: BlockHeader,
    pub interlink: BlockInterlink,
    pub body: Option<BlockBody>,

    /// Lazily computed header hash; do not use directly.
    cached_hash: HashCache,
}

impl Block {
    /// Assembles a block from its parts.
    pub fn new(header: BlockHeader, interlink: BlockInterlink, body: Option<BlockBody>) -> Self {
        Self {
            header,
            interlink,
            body,
            cached_hash: HashCache::new(),
        }
    }

    /// Returns the block hash (the header's proof-of-work hash), computing
    /// and caching it on first call.
    pub fn hash(&self) -> Hash {
        self.cached_hash.get_or_compute(|| self.header.pow_hash())
    }

    /// Returns true if the block carries its body.
    pub fn is_full(&self) -> bool {
        self.body.is_some()
    }

    /// Intrinsic validation: everything checkable without chain context.
    ///
    /// Checks the interlink and body commitments, the timestamp drift
    /// against `now`, the proof-of-work, and the body's own validity.
    pub fn verify_intrinsic(&self, now: u32) -> Result<(), BlockError> {
        if Target::from_compact(self.header.n_bits).is_none() {
            return Err(BlockError::InvalidCompactTarget(self.header.n_bits));
        }

        if self.interlink.hash() != self.header.interlink_hash {
            return Err(BlockError::InterlinkHashMismatch);
        }

        if let Some(body) = &self.body {
            if body.hash() != self.header.body_hash {
                return Err(BlockError::BodyHashMismatch);
            }
            body.verify()?;
        }

        if self.header.timestamp > now.saturating_add(MAX_TIMESTAMP_DRIFT_SECS) {
            return Err(BlockError::TimestampTooFarInFuture {
                timestamp: self.header.timestamp,
                now,
            });
        }

        if !self.header.verify_proof_of_work() {
            return Err(BlockError::InvalidProofOfWork);
        }

        Ok(())
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
            && self.interlink == other.interlink
            && self.body == other.body
    }
}

impl Eq for Block {}
