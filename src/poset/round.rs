//! Round bookkeeping: witness fame state and frame snapshots.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::poset::event::{Event, EventHash};
use crate::Hash;

/// Fame of a witness: undecided until the virtual vote resolves it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fame {
    Undecided,
    Yes,
    No,
}

/// Per-round record of witnesses and their fame, plus all round events.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundInfo {
    /// Witness hash → fame. BTreeMap keeps iteration deterministic.
    pub witnesses: BTreeMap<EventHash, Fame>,
    /// Every event assigned to this round, witnesses included.
    pub events: BTreeSet<EventHash>,
}

impl RoundInfo {
    pub fn add_event(&mut self, hash: EventHash, witness: bool) {
        self.events.insert(hash);
        if witness {
            self.witnesses.entry(hash).or_insert(Fame::Undecided);
        }
    }

    pub fn set_fame(&mut self, hash: EventHash, fame: Fame) {
        if let Some(entry) = self.witnesses.get_mut(&hash) {
            *entry = fame;
        }
    }

    /// True once every witness's fame is resolved.
    pub fn decided(&self) -> bool {
        !self.witnesses.is_empty()
            && self.witnesses.values().all(|f| *f != Fame::Undecided)
    }

    pub fn famous_witnesses(&self) -> Vec<EventHash> {
        self.witnesses
            .iter()
            .filter(|(_, f)| **f == Fame::Yes)
            .map(|(h, _)| *h)
            .collect()
    }

    pub fn witness_hashes(&self) -> Vec<EventHash> {
        self.witnesses.keys().copied().collect()
    }
}

/// Per-participant anchor of a frame: the participant's latest event that
/// every famous witness of the frame round descends from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub creator_id: u64,
    pub hash: EventHash,
    pub index: u64,
    pub round: u64,
}

/// Snapshot sufficient to bootstrap a node at a given round: one root per
/// participant plus the full events received in that round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    pub round: u64,
    pub roots: Vec<Root>,
    pub events: Vec<Event>,
}

impl Frame {
    /// Deterministic frame hash committed into the block of this round.
    pub fn hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new_derive_key("braid.frame");
        hasher.update(&self.round.to_le_bytes());
        hasher.update(&(self.roots.len() as u64).to_le_bytes());
        for root in &self.roots {
            hasher.update(&root.creator_id.to_le_bytes());
            hasher.update(&root.hash.0);
            hasher.update(&root.index.to_le_bytes());
            hasher.update(&root.round.to_le_bytes());
        }
        hasher.update(&(self.events.len() as u64).to_le_bytes());
        for event in &self.events {
            hasher.update(&event.hash().0);
        }
        *hasher.finalize().as_bytes()
    }

    pub fn root_of(&self, creator_id: u64) -> Option<&Root> {
        self.roots.iter().find(|r| r.creator_id == creator_id)
    }
}
