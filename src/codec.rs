//! Fixed-width element codec shared by all engine layers.
//!
//! Elements cross the task boundary as the deterministic fixed-width
//! `bincode` encoding of the underlying `halo2curves` type: `n8` bytes for a
//! field element, `2·n8` for an affine point, `3·n8` for a projective point.
use crate::errors::TaskError;
use serde::{Serialize, de::DeserializeOwned};

/// Encoded size in bytes of one element.
pub(crate) fn byte_len<T: Serialize>(v: &T) -> Result<usize, TaskError> {
  bincode::serialized_size(v)
    .map(|n| n as usize)
    .map_err(|_| TaskError::BadEncoding)
}

/// Encodes an element into a fresh buffer.
pub(crate) fn to_bytes<T: Serialize>(v: &T) -> Result<Vec<u8>, TaskError> {
  bincode::serialize(v).map_err(|_| TaskError::BadEncoding)
}

/// Encodes an element into an exactly-sized slice.
pub(crate) fn write_into<T: Serialize>(v: &T, out: &mut [u8]) -> Result<(), TaskError> {
  bincode::serialize_into(out, v).map_err(|_| TaskError::BadEncoding)
}

/// Decodes an element from an exactly-sized slice.
pub(crate) fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TaskError> {
  bincode::deserialize(bytes).map_err(|_| TaskError::BadEncoding)
}
