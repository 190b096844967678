//! Gossip partner selection.
//!
//! The smart selector prefers the peer synced with least recently; among
//! equals it picks the peer whose witnesses are under-represented in the
//! local head's flag table (most information to gain), and finally the
//! lowest participant id. Recency is a monotone tick counter rather than
//! wall-clock time, so selection is fully deterministic for equal inputs.

use std::collections::HashMap;

use crate::peers::Participant;

/// Chooses a gossip partner each heartbeat.
pub trait PeerSelector: Send {
    /// Pick a peer given how many of each participant's witnesses appear in
    /// the local head's flag table. `None` when no peer is eligible.
    fn next(&mut self, representation: &HashMap<u64, usize>) -> Option<Participant>;

    /// Record a completed sync with `peer_id`.
    fn record_sync(&mut self, peer_id: u64);
}

/// Recency- and flag-table-driven selector.
pub struct SmartPeerSelector {
    others: Vec<Participant>,
    last_sync: HashMap<u64, u64>,
    tick: u64,
}

impl SmartPeerSelector {
    /// `others` must exclude the local participant.
    pub fn new(others: Vec<Participant>) -> SmartPeerSelector {
        SmartPeerSelector {
            others,
            last_sync: HashMap::new(),
            tick: 0,
        }
    }

    pub fn peers(&self) -> &[Participant] {
        &self.others
    }
}

impl PeerSelector for SmartPeerSelector {
    fn next(&mut self, representation: &HashMap<u64, usize>) -> Option<Participant> {
        self.others
            .iter()
            .min_by_key(|p| {
                (
                    self.last_sync.get(&p.id).copied().unwrap_or(0),
                    representation.get(&p.id).copied().unwrap_or(0),
                    p.id,
                )
            })
            .cloned()
    }

    fn record_sync(&mut self, peer_id: u64) {
        self.tick += 1;
        self.last_sync.insert(peer_id, self.tick);
    }
}
