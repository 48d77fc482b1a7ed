//! Wire-serializable wrapper around Schnorr signatures.

use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink};
use k256::schnorr::Signature;

/// Schnorr signature length in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Newtype wrapper giving `k256` Schnorr signatures a fixed 64-byte wire
/// encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerializableSignature(pub Signature);

impl Encode for SerializableSignature {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&self.0.to_bytes());
    }
}

impl Decode for SerializableSignature {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let bytes = <[u8; SIGNATURE_SIZE]>::decode(input)?;
        let signature = Signature::try_from(bytes.as_slice()).map_err(|_| DecodeError::InvalidValue)?;
        Ok(SerializableSignature(signature))
    }
}
