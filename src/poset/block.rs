//! Blocks: the totally ordered output of consensus.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::{Keypair, PublicKey, Signature};
use crate::peers::PeerSet;
use crate::poset::event::BlockSignature;
use crate::poset::PosetError;
use crate::Hash;

/// The deterministic portion of a block; identical on every honest node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    /// Monotonic block index, starting at 0.
    pub index: u64,
    /// The decided round this block was derived from.
    pub round_received: u64,
    /// Application state hash, backfilled after commit; empty until then.
    pub state_hash: Vec<u8>,
    /// Hash of the frame snapshot for `round_received`.
    pub frame_hash: Hash,
    /// Transactions in consensus order.
    pub transactions: Vec<Vec<u8>>,
}

impl BlockBody {
    pub fn hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new_derive_key("braid.block");
        hasher.update(&self.index.to_le_bytes());
        hasher.update(&self.round_received.to_le_bytes());
        hasher.update(&(self.state_hash.len() as u64).to_le_bytes());
        hasher.update(&self.state_hash);
        hasher.update(&self.frame_hash);
        hasher.update(&(self.transactions.len() as u64).to_le_bytes());
        for tx in &self.transactions {
            hasher.update(&(tx.len() as u64).to_le_bytes());
            hasher.update(tx);
        }
        *hasher.finalize().as_bytes()
    }
}

/// A block plus the participant signatures gossiped for it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub body: BlockBody,
    /// Signer SEC1 key bytes → signature over the body hash.
    pub signatures: BTreeMap<Vec<u8>, Signature>,
}

impl Block {
    pub fn new(
        index: u64,
        round_received: u64,
        frame_hash: Hash,
        transactions: Vec<Vec<u8>>,
    ) -> Block {
        Block {
            body: BlockBody {
                index,
                round_received,
                state_hash: Vec::new(),
                frame_hash,
                transactions,
            },
            signatures: BTreeMap::new(),
        }
    }

    pub fn index(&self) -> u64 {
        self.body.index
    }

    /// Sign the body hash, producing a gossipable block signature.
    pub fn sign(&self, keypair: &Keypair) -> Result<BlockSignature, PosetError> {
        let signature = keypair
            .sign(&self.body.hash())
            .map_err(|e| PosetError::Key(e.to_string()))?;
        Ok(BlockSignature {
            validator: keypair.public.as_bytes().to_vec(),
            index: self.body.index,
            signature,
        })
    }

    /// Verify one block signature against the participant set.
    pub fn verify_signature(&self, bs: &BlockSignature, peers: &PeerSet) -> bool {
        if bs.index != self.body.index {
            return false;
        }
        let Ok(key) = PublicKey::from_bytes(&bs.validator) else {
            return false;
        };
        if peers.by_public_key(&key).is_none() {
            return false;
        }
        key.verify(&self.body.hash(), &bs.signature)
    }

    /// Attach a verified signature; returns false if it did not verify.
    pub fn attach_signature(&mut self, bs: &BlockSignature, peers: &PeerSet) -> bool {
        if !self.verify_signature(bs, peers) {
            return false;
        }
        self.signatures
            .insert(bs.validator.clone(), bs.signature);
        true
    }
}
