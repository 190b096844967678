//! Events: the vertices of the poset.
//!
//! An event is immutable once signed. Its identity is the BLAKE3 hash of the
//! body; the creator's ECDSA signature covers that hash. Consensus
//! decorations (round, witness flag, round received, ...) are derived locally
//! after insertion and are never part of the signed body.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::{Keypair, PublicKey, Signature};
use crate::poset::PosetError;
use crate::Hash;

/// Unix-millisecond timestamp carried in event bodies.
pub type Timestamp = u64;

/// Participant id for raw creator key bytes, without validating the point.
/// Matches [`PublicKey::participant_id`] for any valid key.
pub fn creator_id_of(creator: &[u8]) -> u64 {
    let fp = crate::hash_domain("braid.peer.id", creator);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&fp[..8]);
    u64::from_le_bytes(raw)
}

/// Flag table: witness ancestors per round, keyed by witness hash.
pub type FlagTable = BTreeMap<EventHash, u64>;

/// Unique identifier for an event (hash of its body).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventHash(pub Hash);

impl EventHash {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for EventHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventHash({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for EventHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// A creator's signature over a block it has observed, carried in events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignature {
    /// SEC1 public key of the signer.
    pub validator: Vec<u8>,
    /// Index of the signed block.
    pub index: u64,
    pub signature: Signature,
}

/// The signed portion of an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBody {
    /// Opaque application payloads included by the creator.
    pub transactions: Vec<Vec<u8>>,
    /// Signatures over recently observed blocks.
    pub block_signatures: Vec<BlockSignature>,
    /// Hash of the creator's previous event; `None` only at index 0.
    pub self_parent: Option<EventHash>,
    /// Hash of an event by another creator; `None` only at index 0.
    pub other_parent: Option<EventHash>,
    /// SEC1-compressed public key of the creator.
    pub creator: Vec<u8>,
    /// Per-creator sequence number, strictly +1 per event.
    pub index: u64,
    /// Creator-local creation time (unix millis, advisory until consensus).
    pub timestamp: Timestamp,
}

impl EventBody {
    /// Compute the event hash from the body fields.
    pub fn hash(&self) -> EventHash {
        let mut hasher = blake3::Hasher::new_derive_key("braid.event");
        hasher.update(&(self.transactions.len() as u64).to_le_bytes());
        for tx in &self.transactions {
            hasher.update(&(tx.len() as u64).to_le_bytes());
            hasher.update(tx);
        }
        hasher.update(&(self.block_signatures.len() as u64).to_le_bytes());
        for bs in &self.block_signatures {
            hasher.update(&bs.index.to_le_bytes());
            hasher.update(&(bs.validator.len() as u64).to_le_bytes());
            hasher.update(&bs.validator);
            hasher.update(&bs.signature.to_bytes());
        }
        match &self.self_parent {
            Some(h) => {
                hasher.update(&[1]);
                hasher.update(&h.0);
            }
            None => {
                hasher.update(&[0]);
            }
        }
        match &self.other_parent {
            Some(h) => {
                hasher.update(&[1]);
                hasher.update(&h.0);
            }
            None => {
                hasher.update(&[0]);
            }
        }
        hasher.update(&(self.creator.len() as u64).to_le_bytes());
        hasher.update(&self.creator);
        hasher.update(&self.index.to_le_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        EventHash(*hasher.finalize().as_bytes())
    }
}

/// A signed event plus its locally derived consensus decorations.
///
/// Only `body` and `signature` travel between nodes; the remaining fields are
/// recomputed deterministically by each poset and persisted with the event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub body: EventBody,
    pub signature: Signature,

    /// Round derived at insertion.
    #[serde(default)]
    pub round: Option<u64>,
    /// True if this event is a witness of its round.
    #[serde(default)]
    pub witness: bool,
    /// Earliest decided round whose famous witnesses all descend from this
    /// event.
    #[serde(default)]
    pub round_received: Option<u64>,
    /// Median famous-witness timestamp, set together with `round_received`.
    #[serde(default)]
    pub consensus_timestamp: Option<Timestamp>,
    /// Local insertion order.
    #[serde(default)]
    pub topological_index: u64,
    /// Witness ancestors by round, pruned to recent rounds.
    #[serde(default)]
    pub flag_table: FlagTable,
}

impl Event {
    /// Build an unsigned event and sign it with the creator's keypair.
    pub fn new_signed(
        body: EventBody,
        keypair: &Keypair,
    ) -> Result<Event, PosetError> {
        let digest = body.hash();
        let signature = keypair
            .sign(&digest.0)
            .map_err(|e| PosetError::Key(e.to_string()))?;
        Ok(Event {
            body,
            signature,
            round: None,
            witness: false,
            round_received: None,
            consensus_timestamp: None,
            topological_index: 0,
            flag_table: FlagTable::new(),
        })
    }

    /// Wrap a received body and signature, with empty decorations.
    pub fn from_parts(body: EventBody, signature: Signature) -> Event {
        Event {
            body,
            signature,
            round: None,
            witness: false,
            round_received: None,
            consensus_timestamp: None,
            topological_index: 0,
            flag_table: FlagTable::new(),
        }
    }

    pub fn hash(&self) -> EventHash {
        self.body.hash()
    }

    /// Verify the creator's signature over the body hash.
    pub fn verify(&self) -> bool {
        let Ok(key) = PublicKey::from_bytes(&self.body.creator) else {
            return false;
        };
        key.verify(&self.body.hash().0, &self.signature)
    }

    pub fn creator_key(&self) -> Result<PublicKey, PosetError> {
        PublicKey::from_bytes(&self.body.creator).map_err(|e| PosetError::Key(e.to_string()))
    }

    /// True for a creator's first event (no self-parent).
    pub fn is_leaf(&self) -> bool {
        self.body.self_parent.is_none()
    }
}

// ── Wire representation ──

/// Event body with parent hashes replaced by `(creator id, index)` pairs.
///
/// `-1` encodes a nil parent reference. The receiver resolves references
/// against its own store and recomputes the body hash before verifying the
/// signature, so a wire event cannot smuggle a different parentage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireBody {
    pub transactions: Vec<Vec<u8>>,
    pub block_signatures: Vec<BlockSignature>,
    pub self_parent_index: i64,
    pub other_parent_creator_id: i64,
    pub other_parent_index: i64,
    pub creator_id: u64,
    pub index: u64,
    pub timestamp: Timestamp,
}

/// A wire event: compact body plus the `(r, s)` signature scalars.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    pub body: WireBody,
    pub signature: Signature,
}
