//! Cached response records and their on-disk binary encoding.
//!
//! A [`CachedResponse`] is what the proxy hands back on a hit: the buffered
//! body, the upstream `Content-Type`, and the absolute expiry stamped at
//! admission time. The same record round-trips through the disk tier as a
//! self-describing bincode blob.

use std::time::SystemTime;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A cached HTTP response body with its metadata.
///
/// Bodies are held as [`Bytes`] so hits can be served with a cheap
/// reference-counted clone.
#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub body: Bytes,
    pub content_type: String,
    pub expires_at: SystemTime,
}

impl CachedResponse {
    /// Returns true once `expires_at` is in the past.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    /// Body length in bytes, the unit of capacity accounting.
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

/// Serialized form of a disk object. Decode is total on anything
/// `encode` produced; everything else is treated as an invalid file.
#[derive(Serialize, Deserialize)]
struct Blob {
    #[serde(with = "serde_bytes")]
    body: Vec<u8>,
    content_type: String,
    expires_at: SystemTime,
}

/// Encodes a response into the disk blob format.
pub fn encode(response: &CachedResponse) -> Result<Vec<u8>> {
    let blob = Blob {
        body: response.body.to_vec(),
        content_type: response.content_type.clone(),
        expires_at: response.expires_at,
    };
    bincode::serialize(&blob).context("encoding cache entry")
}

/// Decodes a disk blob back into a response.
pub fn decode(bytes: &[u8]) -> Result<CachedResponse> {
    let blob: Blob = bincode::deserialize(bytes).context("decoding cache entry")?;
    Ok(CachedResponse {
        body: Bytes::from(blob.body),
        content_type: blob.content_type,
        expires_at: blob.expires_at,
    })
}
