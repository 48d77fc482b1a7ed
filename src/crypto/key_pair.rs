//! Schnorr signature key pairs on secp256k1.

use crate::types::address::{ADDRESS_SIZE, Address};
use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink};
pub use crate::types::serializable_signature::SerializableSignature;
use k256::schnorr::signature::{Signer, Verifier};
use k256::schnorr::{SigningKey, VerifyingKey};
use rand_core::OsRng;
use sha3::{Digest, Sha3_256};

/// Private key for signing transactions.
///
/// Generated using cryptographically secure randomness from the OS.
/// Never serialized or transmitted over the network.
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

/// Public key for signature verification and address derivation.
///
/// The address is derived by hashing the verifying key with SHA3-256 and
/// taking the last 20 bytes. It is computed eagerly so transaction
/// validation never re-hashes the key.
///
/// This type is `Copy` (52 bytes total) for performance: public keys are
/// passed frequently during transaction validation, and stack allocation
/// avoids heap overhead.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    pub key: VerifyingKey,
    pub address: Address,
}

impl PrivateKey {
    /// Generates a new random private key using OS-provided entropy.
    pub fn new() -> Self {
        let mut rng = OsRng;
        Self {
            key: SigningKey::random(&mut rng),
        }
    }

    /// Creates a private key from raw bytes.
    ///
    /// Returns `None` if the bytes do not represent a valid scalar for secp256k1.
    pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
        SigningKey::from_bytes(bytes).ok().map(|key| Self { key })
    }

    /// Derives the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::new(self)
    }

    /// Returns the address of the corresponding public key.
    pub fn address(&self) -> Address {
        self.public_key().address
    }

    /// Signs arbitrary data, producing a Schnorr signature.
    pub fn sign(&self, data: &[u8]) -> SerializableSignature {
        SerializableSignature(self.key.sign(data))
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

impl PublicKey {
    /// Derives a public key from a private key and computes its address.
    pub(crate) fn new(private: &PrivateKey) -> Self {
        let vk = private.key.verifying_key();

        PublicKey {
            key: *vk,
            address: derive_address(vk),
        }
    }

    /// Verifies a Schnorr signature against the given data.
    ///
    /// Returns `true` if the signature is valid, `false` otherwise.
    pub fn verify(&self, data: &[u8], signature: SerializableSignature) -> bool {
        self.key.verify(data, &signature.0).is_ok()
    }
}

/// Address derivation: SHA3-256(verifying_key_bytes)[12..32].
fn derive_address(key: &VerifyingKey) -> Address {
    let mut hasher = Sha3_256::new();
    hasher.update(key.to_bytes());
    let full: [u8; 32] = hasher.finalize().into();

    let mut addr = [0u8; ADDRESS_SIZE];
    addr.copy_from_slice(&full[12..]);
    Address(addr)
}

impl Encode for PublicKey {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&self.key.to_bytes());
    }
}

impl Decode for PublicKey {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let key_bytes = <[u8; 32]>::decode(input)?;
        let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| DecodeError::InvalidValue)?;

        // Re-derive the address so the invariant address == H(key)[12..] holds
        // for keys received off the wire.
        Ok(PublicKey {
            address: derive_address(&key),
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let key = PrivateKey::new();
        let public = key.public_key();
        let signature = key.sign(b"payload");

        assert!(public.verify(b"payload", signature));
        assert!(!public.verify(b"tampered", signature));
    }

    #[test]
    fn verify_fails_with_wrong_key() {
        let key1 = PrivateKey::new();
        let key2 = PrivateKey::new();
        let signature = key1.sign(b"data");

        assert!(!key2.public_key().verify(b"data", signature));
    }

    #[test]
    fn from_bytes_is_deterministic() {
        let key1 = PrivateKey::from_bytes(&[7u8; 32]).expect("valid scalar");
        let key2 = PrivateKey::from_bytes(&[7u8; 32]).expect("valid scalar");

        assert_eq!(key1.public_key(), key2.public_key());
    }

    #[test]
    fn from_bytes_rejects_zero_scalar() {
        assert!(PrivateKey::from_bytes(&[0u8; 32]).is_none());
    }

    #[test]
    fn address_is_stable_across_derivations() {
        let key = PrivateKey::new();
        assert_eq!(key.address(), key.public_key().address);
    }

    #[test]
    fn public_key_decode_rederives_address() {
        let key = PrivateKey::new();
        let public = key.public_key();

        let encoded = public.to_bytes();
        assert_eq!(encoded.len(), 32);

        let decoded = PublicKey::from_bytes(&encoded).expect("decode");
        assert_eq!(decoded, public);
        assert_eq!(decoded.address, public.address);
    }
}
