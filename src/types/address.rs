//! 20-byte account addresses derived from public keys.

use aurum_derive::BinaryCodec;
use std::fmt;

/// Address length in bytes.
pub const ADDRESS_SIZE: usize = 20;

/// Fixed-size 20-byte address identifying accounts.
///
/// Derived from public keys via SHA3-256 hashing, taking the last 20 bytes.
/// This type is `Copy` for efficient passing in validation and lookup
/// operations; `Ord` gives deterministic iteration wherever addresses key a
/// sorted structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ord, PartialOrd, Default, BinaryCodec)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    /// The all-zero address, used as the burn/placeholder miner address.
    pub const fn zero() -> Address {
        Address([0u8; ADDRESS_SIZE])
    }

    /// Returns the address as a byte slice.
    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Creates an address from a byte slice.
    ///
    /// Returns `None` if the slice length is not exactly [`ADDRESS_SIZE`] bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Address> {
        if slice.len() != ADDRESS_SIZE {
            return None;
        }
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes.copy_from_slice(slice);
        Some(Address(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
