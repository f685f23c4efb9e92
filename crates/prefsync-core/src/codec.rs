//! Wire encoding of item payloads.
//!
//! A payload is a JSON object mapping each key to a tagged value or `null`:
//!
//! ```text
//! {
//!   "volume":    {"t": "int", "v": 5},
//!   "theme":     {"t": "string", "v": "dark"},
//!   "tags":      {"t": "string_set", "v": ["a", "b"]},
//!   "old_key":   null,
//!   "timestamp": {"t": "long", "v": 81723400}
//! }
//! ```
//!
//! Decoding is lenient per entry: an entry whose type tag is unknown or whose
//! value does not match its tag is dropped, and the rest of the payload
//! survives.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::types::PrefValue;

/// Key → value map carried by one remote item. `None` marks a removed key.
pub type Payload = BTreeMap<String, Option<PrefValue>>;

/// Encode a payload for the wire
pub fn encode_payload(payload: &Payload) -> SyncResult<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

/// A decoded payload together with the number of entries dropped on the way
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedPayload {
    pub payload: Payload,
    pub skipped: usize,
}

/// Decode a payload, skipping malformed entries.
///
/// Fails only when the bytes are not a JSON object at all.
pub fn decode_payload(bytes: &[u8]) -> SyncResult<Payload> {
    Ok(decode_entries(bytes)?.payload)
}

/// Like [`decode_payload`], but also reports how many entries were skipped,
/// so an object of nothing but bad entries is not mistaken for an empty one.
pub fn decode_entries(bytes: &[u8]) -> SyncResult<DecodedPayload> {
    if bytes.is_empty() {
        return Ok(DecodedPayload::default());
    }

    let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(bytes)
        .map_err(|e| SyncError::Transport(format!("payload is not a JSON object: {}", e)))?;

    let mut decoded = DecodedPayload::default();
    for (key, value) in raw {
        match serde_json::from_value::<Option<PrefValue>>(value) {
            Ok(entry) => {
                decoded.payload.insert(key, entry);
            }
            Err(e) => {
                debug!(%key, error = %e, "Skipping malformed payload entry");
                decoded.skipped += 1;
            }
        }
    }
    Ok(decoded)
}
