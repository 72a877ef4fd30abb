// Canonical encoding for hashing, persistence, and the wire.
// Fixed-int configuration pins every integer to its full width, so the same
// value always encodes to the same bytes: field order fixed, numbers
// fixed-width, strings length-prefixed.
use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};

fn canonical_config() -> bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
> {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Encode data with the canonical configuration
pub fn serialize<T: Serialize + bincode::Encode>(data: &T) -> Result<Vec<u8>> {
    bincode::encode_to_vec(data, canonical_config())
        .map_err(|e| NodeError::Serialization(format!("Serialization failed: {e}")))
}

/// Decode data encoded with the canonical configuration
pub fn deserialize<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'de> Deserialize<'de> + bincode::Decode<()>,
{
    let (data, _) = bincode::decode_from_slice(bytes, canonical_config())
        .map_err(|e| NodeError::Serialization(format!("Deserialization failed: {e}")))?;
    Ok(data)
}
