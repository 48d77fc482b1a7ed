//! Signed value transfers between accounts.

use crate::crypto::key_pair::{PrivateKey, PublicKey, SerializableSignature};
use crate::types::address::{ADDRESS_SIZE, Address};
use crate::types::encoding::Encode;
use crate::types::hash::{Hash, HashCache};
use crate::types::serializable_signature::SIGNATURE_SIZE;
use aurum_derive::BinaryCodec;

/// Serialized transaction size in bytes:
/// pubkey (32) || recipient (20) || value (8) || fee (8) || nonce (4) || signature (64).
pub const TRANSACTION_SIZE: usize = 32 + ADDRESS_SIZE + 8 + 8 + 4 + SIGNATURE_SIZE;

/// A signed transfer of `value` from the sender to `recipient`, paying `fee`
/// to the miner that includes it.
///
/// Field order is the wire order; the signature covers the canonical
/// serialization of everything before it.
#[derive(Clone, Debug, BinaryCodec)]
pub struct Transaction {
    /// Sender's public key; the sender address is derived from it.
    pub sender_pub_key: PublicKey,
    /// Receiving account.
    pub recipient: Address,
    /// Amount transferred to the recipient.
    pub value: u64,
    /// Amount paid to the including miner.
    pub fee: u64,
    /// Sender's account nonce at application time.
    pub nonce: u32,
    /// Schnorr signature over the serialized content.
    pub signature: SerializableSignature,

    /// Cached transaction id, computed lazily on first access.
    cached_id: HashCache,
}

impl Transaction {
    /// Creates and signs a new transaction.
    pub fn new(recipient: Address, value: u64, fee: u64, nonce: u32, key: &PrivateKey) -> Self {
        let sender_pub_key = key.public_key();
        let content = signing_content(&sender_pub_key, &recipient, value, fee, nonce);

        Transaction {
            sender_pub_key,
            recipient,
            value,
            fee,
            nonce,
            signature: key.sign(&content),
            cached_id: HashCache::new(),
        }
    }

    /// Returns the sender's address, derived from the public key.
    pub fn sender(&self) -> Address {
        self.sender_pub_key.address
    }

    /// Returns the unique transaction identifier.
    ///
    /// Computed as the hash of the full serialization including the
    /// signature, so identical payloads signed by different keys stay
    /// distinct. The result is cached.
    pub fn id(&self) -> Hash {
        self.cached_id.get_or_compute(|| {
            let mut h = Hash::sha3();
            self.encode(&mut h);
            h.finalize()
        })
    }

    /// Verifies the signature against the sender's public key.
    pub fn verify_signature(&self) -> bool {
        let content = signing_content(
            &self.sender_pub_key,
            &self.recipient,
            self.value,
            self.fee,
            self.nonce,
        );
        self.sender_pub_key.verify(&content, self.signature)
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        // The lazily-computed id cache is not part of transaction identity.
        self.sender_pub_key == other.sender_pub_key
            && self.recipient == other.recipient
            && self.value == other.value
            && self.fee == other.fee
            && self.nonce == other.nonce
            && self.signature == other.signature
    }
}

impl Eq for Transaction {}

/// Serializes the signed portion of a transaction: every wire field before
/// the signature, in wire order.
fn signing_content(
    sender_pub_key: &PublicKey,
    recipient: &Address,
    value: u64,
    fee: u64,
    nonce: u32,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TRANSACTION_SIZE - SIGNATURE_SIZE);
    sender_pub_key.encode(&mut buf);
    recipient.encode(&mut buf);
    value.encode(&mut buf);
    fee.encode(&mut buf);
    nonce.encode(&mut buf);
    buf
}
