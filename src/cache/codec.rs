//! Payload framing for cached values.
//!
//! Every stored payload starts with a one-byte flag so readers never guess
//! whether a value was compressed:
//!
//! | flag | body                    |
//! |------|-------------------------|
//! | `0`  | JSON bytes              |
//! | `1`  | gzip-compressed JSON    |

use super::errors::{CacheError, CacheResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

const FLAG_PLAIN: u8 = 0;
const FLAG_GZIP: u8 = 1;

/// When to compress payloads
#[derive(Debug, Clone, Copy)]
pub struct CompressionPolicy {
    pub enabled: bool,
    /// Serialized size at or above which compression applies
    pub threshold_bytes: usize,
}

impl CompressionPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            threshold_bytes: usize::MAX,
        }
    }

    fn applies_to(&self, len: usize) -> bool {
        self.enabled && len >= self.threshold_bytes
    }
}

pub fn encode<T: Serialize + ?Sized>(value: &T, policy: CompressionPolicy) -> CacheResult<Vec<u8>> {
    let json =
        serde_json::to_vec(value).map_err(|e| CacheError::SerializationError(e.to_string()))?;

    if !policy.applies_to(json.len()) {
        let mut framed = Vec::with_capacity(json.len() + 1);
        framed.push(FLAG_PLAIN);
        framed.extend_from_slice(&json);
        return Ok(framed);
    }

    let mut encoder = GzEncoder::new(vec![FLAG_GZIP], Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| CacheError::CompressionError(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CacheError::CompressionError(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> CacheResult<T> {
    let (flag, body) = payload
        .split_first()
        .ok_or_else(|| CacheError::SerializationError("empty cache payload".to_string()))?;

    match *flag {
        FLAG_PLAIN => serde_json::from_slice(body)
            .map_err(|e| CacheError::SerializationError(e.to_string())),
        FLAG_GZIP => {
            let mut json = Vec::new();
            GzDecoder::new(body)
                .read_to_end(&mut json)
                .map_err(|e| CacheError::CompressionError(e.to_string()))?;
            serde_json::from_slice(&json).map_err(|e| CacheError::SerializationError(e.to_string()))
        }
        other => Err(CacheError::SerializationError(format!(
            "unknown cache payload flag {other}"
        ))),
    }
}
