//! The fixed participant set.
//!
//! Participants are loaded once from a JSON peers file at init and never
//! change afterwards. Each participant has a stable 64-bit id derived from
//! its public key; the set is kept sorted by id so that every node iterates
//! participants in the same order.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crypto::{KeyError, PublicKey};

/// Errors from loading or querying the participant set.
#[derive(Debug, thiserror::Error)]
pub enum PeersError {
    #[error("peers file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peers file parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid participant key: {0}")]
    Key(#[from] KeyError),
    #[error("peers file must define at least two participants, found {0}")]
    TooFew(usize),
    #[error("duplicate participant id {0}")]
    Duplicate(u64),
}

/// One entry of the peers file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerRecord {
    pub pub_key_hex: String,
    pub net_addr: String,
}

/// A consensus participant.
#[derive(Clone, Debug)]
pub struct Participant {
    pub public_key: PublicKey,
    pub id: u64,
    pub net_addr: String,
}

impl Participant {
    pub fn new(public_key: PublicKey, net_addr: impl Into<String>) -> Self {
        let id = public_key.participant_id();
        Participant {
            public_key,
            id,
            net_addr: net_addr.into(),
        }
    }
}

/// The participant set, ordered by ascending id.
#[derive(Clone, Debug)]
pub struct PeerSet {
    participants: Vec<Participant>,
    by_id: HashMap<u64, usize>,
}

impl PeerSet {
    /// Build a set from participants, sorting by id.
    pub fn new(mut participants: Vec<Participant>) -> Result<Self, PeersError> {
        participants.sort_by_key(|p| p.id);
        let mut by_id = HashMap::with_capacity(participants.len());
        for (idx, p) in participants.iter().enumerate() {
            if by_id.insert(p.id, idx).is_some() {
                return Err(PeersError::Duplicate(p.id));
            }
        }
        Ok(PeerSet {
            participants,
            by_id,
        })
    }

    /// Load from a JSON peers file; at least two entries are required.
    pub fn from_json_file(path: &Path) -> Result<Self, PeersError> {
        let data = std::fs::read_to_string(path)?;
        let records: Vec<PeerRecord> = serde_json::from_str(&data)?;
        if records.len() < 2 {
            return Err(PeersError::TooFew(records.len()));
        }
        let mut participants = Vec::with_capacity(records.len());
        for rec in records {
            let key = PublicKey::from_hex(&rec.pub_key_hex)?;
            participants.push(Participant::new(key, rec.net_addr));
        }
        Self::new(participants)
    }

    /// Serialize the set back into peers-file records.
    pub fn to_records(&self) -> Vec<PeerRecord> {
        self.participants
            .iter()
            .map(|p| PeerRecord {
                pub_key_hex: p.public_key.to_hex(),
                net_addr: p.net_addr.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Smallest count strictly greater than two thirds of the set.
    pub fn super_majority(&self) -> usize {
        (self.participants.len() * 2) / 3 + 1
    }

    /// All participants, ascending by id.
    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter()
    }

    pub fn by_id(&self, id: u64) -> Option<&Participant> {
        self.by_id.get(&id).map(|&idx| &self.participants[idx])
    }

    pub fn by_public_key(&self, key: &PublicKey) -> Option<&Participant> {
        self.by_id(key.participant_id())
            .filter(|p| &p.public_key == key)
    }

    /// Every participant except `self_id`, ascending by id.
    pub fn others(&self, self_id: u64) -> Vec<Participant> {
        self.participants
            .iter()
            .filter(|p| p.id != self_id)
            .cloned()
            .collect()
    }

    /// Replace a participant's network address (init-time only).
    pub fn set_net_addr(&mut self, id: u64, net_addr: impl Into<String>) {
        if let Some(&idx) = self.by_id.get(&id) {
            self.participants[idx].net_addr = net_addr.into();
        }
    }
}
