//! Wire protocol: RPC request/response types and the length-prefixed
//! bincode framing shared by client and server.

pub mod transport;

use std::collections::HashMap;

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::poset::{Block, BlockSignature, Frame, WireEvent};

/// RPC requests carried over the transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    /// Known-events exchange: the initiator reports what it has; the
    /// responder answers with the diff.
    Sync {
        from_id: u64,
        known: HashMap<u64, i64>,
    },
    /// Push events the responder is missing.
    EagerSync {
        from_id: u64,
        events: Vec<WireEvent>,
    },
    /// Request the responder's latest decided frame and block.
    FastForward { from_id: u64 },
    /// Bulk fetch of historical block signatures.
    BlockSignatures { from_id: u64, from_index: u64 },
}

/// RPC responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Sync {
        from_id: u64,
        /// Set when the diff exceeds the responder's sync limit; `events` is
        /// empty and the initiator must fast-forward instead.
        sync_limit: bool,
        events: Vec<WireEvent>,
        known: HashMap<u64, i64>,
    },
    EagerSync {
        from_id: u64,
        success: bool,
    },
    FastForward {
        from_id: u64,
        block: Box<Block>,
        frame: Box<Frame>,
    },
    BlockSignatures {
        from_id: u64,
        signatures: Vec<BlockSignature>,
    },
    /// Machine-readable failure from the responder.
    Error { from_id: u64, message: String },
}

/// Network codec errors.
#[derive(Clone, Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("message serialization failed: {0}")]
    SerializationFailed(String),
    #[error(
        "message exceeds maximum size ({} bytes)",
        crate::constants::MAX_NETWORK_MESSAGE_BYTES
    )]
    MessageTooLarge,
}

/// Size-limited bincode config used for both serialization and
/// deserialization. Prevents allocation-based DoS from crafted length
/// prefixes within payloads.
fn bincode_config() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(crate::constants::MAX_NETWORK_MESSAGE_BYTES as u64)
}

/// Serialize a message with a 4-byte LE length prefix.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, NetworkError> {
    let payload = bincode_config()
        .serialize(msg)
        .map_err(|e| NetworkError::SerializationFailed(e.to_string()))?;
    if payload.len() > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(NetworkError::MessageTooLarge);
    }
    let len = (payload.len() as u32).to_le_bytes();
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Deserialize a message from a length-prefixed buffer. Rejects declared
/// lengths beyond [`MAX_NETWORK_MESSAGE_BYTES`](crate::constants).
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Option<T> {
    if data.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes(data[..4].try_into().ok()?) as usize;
    if len > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return None;
    }
    if data.len() < 4 + len {
        return None;
    }
    bincode_config().deserialize(&data[4..4 + len]).ok()
}

/// Deserialize a bare (unprefixed) payload.
pub fn decode_payload<T: DeserializeOwned>(data: &[u8]) -> Option<T> {
    bincode_config().deserialize(data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let mut known = HashMap::new();
        known.insert(1u64, 4i64);
        known.insert(2u64, -1i64);
        let req = Request::Sync {
            from_id: 7,
            known: known.clone(),
        };

        let bytes = encode(&req).unwrap();
        let decoded: Request = decode(&bytes).unwrap();
        match decoded {
            Request::Sync {
                from_id,
                known: got,
            } => {
                assert_eq!(from_id, 7);
                assert_eq!(got, known);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn response_roundtrip() {
        let resp = Response::Sync {
            from_id: 3,
            sync_limit: true,
            events: vec![],
            known: HashMap::new(),
        };
        let bytes = encode(&resp).unwrap();
        let decoded: Response = decode(&bytes).unwrap();
        assert!(matches!(
            decoded,
            Response::Sync {
                from_id: 3,
                sync_limit: true,
                ..
            }
        ));
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let req = Request::FastForward { from_id: 1 };
        let mut bytes = encode(&req).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(decode::<Request>(&bytes).is_none());
        assert!(decode::<Request>(&[0u8; 3]).is_none());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut data = vec![0u8; 8];
        data[..4].copy_from_slice(&(u32::MAX).to_le_bytes());
        assert!(decode::<Request>(&data).is_none());
    }
}
