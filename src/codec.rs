//! Canonical CBOR encoding helpers (spec §6).
//!
//! Wraps `serde_cbor` so every wire-facing type in the crate goes through
//! the same pair of functions rather than calling `serde_cbor` directly.

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("cbor encode failed: {0}")]
    Encode(serde_cbor::Error),
    #[error("cbor decode failed: {0}")]
    Decode(serde_cbor::Error),
}

pub fn to_canonical<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_cbor::to_vec(value).map_err(CodecError::Encode)
}

pub fn from_canonical<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_cbor::from_slice(bytes).map_err(CodecError::Decode)
}

/// Best-effort decode used at trust boundaries where a malformed or
/// unrecognized payload must be dropped, not propagated (spec §4.5, §7
/// `SchemaRejected`). Logs at `warn` and returns `None` on failure.
pub fn try_decode<T: DeserializeOwned>(bytes: &[u8]) -> Option<T> {
    match serde_cbor::from_slice(bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("dropping payload that failed schema validation: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn round_trip() {
        let value = Sample { a: 1, b: "x".into() };
        let bytes = to_canonical(&value).unwrap();
        let back: Sample = from_canonical(&bytes).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn try_decode_drops_garbage() {
        let garbage = vec![0xff, 0x00, 0x01];
        let decoded: Option<Sample> = try_decode(&garbage);
        assert!(decoded.is_none());
    }
}
