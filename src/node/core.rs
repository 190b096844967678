//! Per-node head management: creating self events, translating events to and
//! from wire form, and feeding synced events into the poset.
//!
//! The transaction and block-signature pools are guarded by their own
//! mutexes so intake can run under a shared reference while the gossip
//! driver holds the core; `add_self_event` drains both pools atomically and
//! restores them if insertion fails.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::crypto::{KeyError, Keypair};
use crate::peers::PeerSet;
use crate::poset::event::creator_id_of;
use crate::poset::{
    Block, BlockSignature, Event, EventBody, EventHash, Frame, Poset, PosetError, StoreError,
    WireBody, WireEvent,
};

/// Errors from core operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Poset(#[from] PosetError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("wire event names unknown participant {0}")]
    UnknownParticipant(u64),
    #[error("cannot resolve event {index} from participant {creator_id}")]
    UnresolvedParent { creator_id: u64, index: u64 },
    #[error("frame does not match block")]
    FrameMismatch,
    #[error("frame carries no root for our own chain yet")]
    FrameLacksSelfRoot,
    #[error("fast-forward block carries no valid participant signature")]
    UnsignedBlock,
    #[error("core lock poisoned")]
    Poisoned,
}

impl CoreError {
    /// True when a peer shipped events whose parents we do not have; the
    /// sync must be aborted and reported.
    pub fn is_parent_missing(&self) -> bool {
        match self {
            CoreError::Poset(err) => err.is_parent_missing(),
            CoreError::UnresolvedParent { .. } => true,
            _ => false,
        }
    }
}

/// The node's private view of the poset.
pub struct Core {
    pub id: u64,
    keypair: Keypair,
    participants: Arc<PeerSet>,
    pub poset: Poset,
    head: Option<EventHash>,
    transaction_pool: Mutex<Vec<Vec<u8>>>,
    block_signature_pool: Mutex<Vec<BlockSignature>>,
}

impl Core {
    pub fn new(keypair: Keypair, participants: Arc<PeerSet>, poset: Poset) -> Core {
        let id = keypair.public.participant_id();
        Core {
            id,
            keypair,
            participants,
            poset,
            head: None,
            transaction_pool: Mutex::new(Vec::new()),
            block_signature_pool: Mutex::new(Vec::new()),
        }
    }

    /// Adopt the stored head, or create the index-0 leaf event.
    pub fn init(&mut self) -> Result<(), CoreError> {
        match self.poset.store().last_event_from(self.id) {
            Ok((hash, _)) => {
                self.head = Some(hash);
                Ok(())
            }
            Err(err) if err.is_not_found() => self.add_self_event(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn head(&self) -> Option<EventHash> {
        self.head
    }

    pub fn head_event(&self) -> Result<Event, CoreError> {
        let hash = self
            .head
            .ok_or_else(|| StoreError::NotFound("head".into()))?;
        Ok(self.poset.store().get_event(&hash)?)
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn participants(&self) -> &Arc<PeerSet> {
        &self.participants
    }

    // ── Pools ──

    pub fn add_transaction(&self, tx: Vec<u8>) -> Result<(), CoreError> {
        self.transaction_pool
            .lock()
            .map_err(|_| CoreError::Poisoned)?
            .push(tx);
        Ok(())
    }

    pub fn add_block_signature(&self, bs: BlockSignature) -> Result<(), CoreError> {
        self.block_signature_pool
            .lock()
            .map_err(|_| CoreError::Poisoned)?
            .push(bs);
        Ok(())
    }

    pub fn transaction_pool_len(&self) -> usize {
        self.transaction_pool.lock().map(|p| p.len()).unwrap_or(0)
    }

    // ── Event creation ──

    /// Build, sign and insert a new head event, draining both pools into it.
    /// Pools are restored untouched if insertion fails.
    pub fn add_self_event(&mut self, other_parent: Option<EventHash>) -> Result<(), CoreError> {
        let (index, self_parent) = match self.head {
            Some(head) => {
                let last = self
                    .poset
                    .store()
                    .known_events()
                    .get(&self.id)
                    .copied()
                    .unwrap_or(-1);
                ((last + 1) as u64, Some(head))
            }
            None => (0, None),
        };

        let transactions = std::mem::take(
            &mut *self
                .transaction_pool
                .lock()
                .map_err(|_| CoreError::Poisoned)?,
        );
        let block_signatures = std::mem::take(
            &mut *self
                .block_signature_pool
                .lock()
                .map_err(|_| CoreError::Poisoned)?,
        );

        let body = EventBody {
            transactions: transactions.clone(),
            block_signatures: block_signatures.clone(),
            self_parent,
            other_parent,
            creator: self.keypair.public.as_bytes().to_vec(),
            index,
            timestamp: crate::now_millis(),
        };
        let event = Event::new_signed(body, &self.keypair)?;
        let hash = event.hash();

        match self.poset.insert_event(event, false) {
            Ok(()) => {
                self.head = Some(hash);
                Ok(())
            }
            Err(err) => {
                // Put the drained payloads back at the front of the pools.
                if let Ok(mut pool) = self.transaction_pool.lock() {
                    let rest = std::mem::take(&mut *pool);
                    *pool = transactions;
                    pool.extend(rest);
                }
                if let Ok(mut pool) = self.block_signature_pool.lock() {
                    let rest = std::mem::take(&mut *pool);
                    *pool = block_signatures;
                    pool.extend(rest);
                }
                Err(err.into())
            }
        }
    }

    // ── Sync ──

    pub fn known_events(&self) -> HashMap<u64, i64> {
        self.poset.store().known_events()
    }

    pub fn last_block_index(&self) -> i64 {
        self.poset.store().last_block_index()
    }

    pub fn get_block(&self, index: u64) -> Result<Block, CoreError> {
        Ok(self.poset.store().get_block(index)?)
    }

    /// Events the requester is missing, in topological order.
    pub fn event_diff(&self, known: &HashMap<u64, i64>) -> Result<Vec<Event>, CoreError> {
        let mut events = Vec::new();
        for p in self.participants.iter() {
            let skip = known.get(&p.id).copied().unwrap_or(-1);
            for hash in self.poset.store().participant_events(p.id, skip)? {
                events.push(self.poset.store().get_event(&hash)?);
            }
        }
        events.sort_by_key(|e| e.topological_index);
        Ok(events)
    }

    /// Insert a batch of wire events, in order. A missing parent aborts the
    /// batch: the peer is ahead of us in a way a single sync cannot fix.
    pub fn sync(&mut self, wire_events: &[WireEvent]) -> Result<(), CoreError> {
        for wire in wire_events {
            let event = self.from_wire(wire)?;
            match self.poset.insert_event(event, true) {
                Ok(()) => {}
                Err(PosetError::Fork(creator)) => {
                    // Recorded and muted; the batch continues.
                    tracing::warn!(creator, "fork in sync batch");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    // ── Wire conversion ──

    pub fn to_wire(&self, events: &[Event]) -> Result<Vec<WireEvent>, CoreError> {
        events.iter().map(|e| self.event_to_wire(e)).collect()
    }

    fn event_to_wire(&self, event: &Event) -> Result<WireEvent, CoreError> {
        let self_parent_index = match event.body.self_parent {
            Some(_) => event.body.index as i64 - 1,
            None => -1,
        };
        let (other_parent_creator_id, other_parent_index) = match &event.body.other_parent {
            None => (-1, -1),
            Some(op) => self.locate(op)?,
        };
        Ok(WireEvent {
            body: WireBody {
                transactions: event.body.transactions.clone(),
                block_signatures: event.body.block_signatures.clone(),
                self_parent_index,
                other_parent_creator_id,
                other_parent_index,
                creator_id: creator_id_of(&event.body.creator),
                index: event.body.index,
                timestamp: event.body.timestamp,
            },
            signature: event.signature,
        })
    }

    /// `(creator id, index)` of a stored event or reset root.
    fn locate(&self, hash: &EventHash) -> Result<(i64, i64), CoreError> {
        if let Ok(event) = self.poset.store().get_event(hash) {
            return Ok((
                creator_id_of(&event.body.creator) as i64,
                event.body.index as i64,
            ));
        }
        for p in self.participants.iter() {
            if let Some(root) = self.poset.store().root_of(p.id) {
                if root.hash == *hash {
                    return Ok((p.id as i64, root.index as i64));
                }
            }
        }
        Err(CoreError::Poset(PosetError::OtherParentMissing(*hash)))
    }

    /// Rebuild a full event from its wire form by resolving parent
    /// references against the local store.
    pub fn from_wire(&self, wire: &WireEvent) -> Result<Event, CoreError> {
        let creator = self
            .participants
            .by_id(wire.body.creator_id)
            .ok_or(CoreError::UnknownParticipant(wire.body.creator_id))?;

        let self_parent = if wire.body.self_parent_index < 0 {
            None
        } else {
            Some(self.resolve(wire.body.creator_id, wire.body.self_parent_index as u64)?)
        };
        let other_parent = if wire.body.other_parent_index < 0 {
            None
        } else {
            let creator_id = u64::try_from(wire.body.other_parent_creator_id)
                .map_err(|_| CoreError::UnknownParticipant(0))?;
            Some(self.resolve(creator_id, wire.body.other_parent_index as u64)?)
        };

        let body = EventBody {
            transactions: wire.body.transactions.clone(),
            block_signatures: wire.body.block_signatures.clone(),
            self_parent,
            other_parent,
            creator: creator.public_key.as_bytes().to_vec(),
            index: wire.body.index,
            timestamp: wire.body.timestamp,
        };
        Ok(Event::from_parts(body, wire.signature))
    }

    fn resolve(&self, creator_id: u64, index: u64) -> Result<EventHash, CoreError> {
        self.poset
            .store()
            .participant_event(creator_id, index)
            .map_err(|err| {
                if err.is_not_found() {
                    CoreError::UnresolvedParent { creator_id, index }
                } else {
                    err.into()
                }
            })
    }

    // ── Fast-forward ──

    /// Adopt a peer's frame and block: reset the poset, seed the head from
    /// our root, and clear both pools.
    ///
    /// A frame without a root for our own chain is refused while we already
    /// have events: adopting it would restart our chain at index 0 and fork
    /// us in everyone else's eyes. The caller retries; once our events are
    /// consensus-final a fresher frame carries our root.
    pub fn fast_forward(&mut self, block: &Block, frame: &Frame) -> Result<(), CoreError> {
        if frame.hash() != block.body.frame_hash || frame.round != block.body.round_received {
            return Err(CoreError::FrameMismatch);
        }
        if self.head.is_some() && frame.root_of(self.id).is_none() {
            return Err(CoreError::FrameLacksSelfRoot);
        }
        let signed = block
            .signatures
            .iter()
            .any(|(validator, signature)| {
                block.verify_signature(
                    &BlockSignature {
                        validator: validator.clone(),
                        index: block.index(),
                        signature: *signature,
                    },
                    &self.participants,
                )
            });
        if !signed {
            return Err(CoreError::UnsignedBlock);
        }

        self.poset.reset(frame)?;
        self.poset.store().set_block(block)?;
        self.head = match self.poset.store().last_event_from(self.id) {
            Ok((hash, _)) => Some(hash),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };
        if let Ok(mut pool) = self.transaction_pool.lock() {
            pool.clear();
        }
        if let Ok(mut pool) = self.block_signature_pool.lock() {
            pool.clear();
        }
        Ok(())
    }

    /// How many of each participant's witnesses appear in the head's flag
    /// table; the peer selector favors under-represented peers.
    pub fn head_flag_representation(&self) -> HashMap<u64, usize> {
        let mut rep: HashMap<u64, usize> =
            self.participants.iter().map(|p| (p.id, 0)).collect();
        let Some(head) = self.head else {
            return rep;
        };
        let Ok(event) = self.poset.store().get_event(&head) else {
            return rep;
        };
        for witness in event.flag_table.keys() {
            if let Ok(w) = self.poset.store().get_event(witness) {
                *rep.entry(creator_id_of(&w.body.creator)).or_insert(0) += 1;
            }
        }
        rep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::Participant;
    use crate::poset::InmemStore;
    use tokio::sync::mpsc;

    fn make_cores(n: usize) -> Vec<Core> {
        let mut keys: Vec<Keypair> = (0..n).map(|_| Keypair::generate()).collect();
        keys.sort_by_key(|k| k.public.participant_id());
        let participants: Vec<Participant> = keys
            .iter()
            .map(|k| Participant::new(k.public.clone(), "127.0.0.1:0"))
            .collect();
        let peers = Arc::new(PeerSet::new(participants).unwrap());

        keys.into_iter()
            .map(|key| {
                let store = Box::new(InmemStore::new(&peers, 10_000));
                let (tx, _rx) = mpsc::channel(256);
                let poset = Poset::new(peers.clone(), store, tx);
                let mut core = Core::new(key, peers.clone(), poset);
                core.init().unwrap();
                core
            })
            .collect()
    }

    /// Pull everything `from` has that `into` lacks, in wire form.
    fn pull(into: &mut Core, from: &Core) {
        let known = into.known_events();
        let diff = from.event_diff(&known).unwrap();
        let wire = from.to_wire(&diff).unwrap();
        into.sync(&wire).unwrap();
    }

    #[test]
    fn init_creates_leaf_head() {
        let cores = make_cores(2);
        let head = cores[0].head_event().unwrap();
        assert_eq!(head.body.index, 0);
        assert!(head.body.self_parent.is_none());
        assert_eq!(cores[0].known_events()[&cores[0].id], 0);
    }

    #[test]
    fn add_self_event_drains_pool_into_head() {
        let mut cores = make_cores(2);
        let (a, b) = cores.split_at_mut(1);
        let a = &mut a[0];
        let b = &b[0];

        pull(a, b);
        a.add_transaction(b"Hello World!".to_vec()).unwrap();
        assert_eq!(a.transaction_pool_len(), 1);

        let other = b.head().unwrap();
        a.add_self_event(Some(other)).unwrap();

        assert_eq!(a.transaction_pool_len(), 0);
        let head = a.head_event().unwrap();
        assert_eq!(head.body.transactions, vec![b"Hello World!".to_vec()]);
        assert_eq!(head.body.index, 1);
    }

    #[test]
    fn event_diff_reports_missing_events() {
        let mut cores = make_cores(2);
        let (a, b) = cores.split_at_mut(1);
        let a = &mut a[0];
        let b = &mut b[0];

        // b has only its own leaf; a's diff against b's knowledge is a's leaf.
        let diff = a.event_diff(&b.known_events()).unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].body.index, 0);

        pull(b, a);
        assert!(b.event_diff(&b.known_events()).unwrap().is_empty());
    }

    #[test]
    fn wire_roundtrip_is_identity() {
        let mut cores = make_cores(2);
        let (a, b) = cores.split_at_mut(1);
        let a = &mut a[0];
        let b = &mut b[0];

        pull(a, b);
        a.add_self_event(Some(b.head().unwrap())).unwrap();
        let head = a.head_event().unwrap();

        let wire = a.to_wire(std::slice::from_ref(&head)).unwrap();
        // b needs a's history to resolve the references.
        pull(b, a);
        let rebuilt = b.from_wire(&wire[0]).unwrap();
        assert_eq!(rebuilt.body, head.body);
        assert_eq!(rebuilt.hash(), head.hash());
        assert!(rebuilt.verify());
    }

    #[test]
    fn sync_aborts_on_unresolvable_parent() {
        let mut cores = make_cores(3);
        let (a, rest) = cores.split_at_mut(1);
        let a = &mut a[0];
        let (b, c) = rest.split_at_mut(1);
        let b = &mut b[0];
        let c = &c[0];

        // b builds on top of c's events; a knows neither.
        pull(b, c);
        b.add_self_event(Some(c.head().unwrap())).unwrap();
        let head = b.head_event().unwrap();
        let wire = b.to_wire(std::slice::from_ref(&head)).unwrap();

        let err = a.sync(&wire).unwrap_err();
        assert!(err.is_parent_missing());
    }

    #[test]
    fn failed_self_event_restores_pools() {
        let mut cores = make_cores(2);
        let a = &mut cores[0];
        a.add_transaction(b"keep me".to_vec()).unwrap();

        // Unknown other-parent makes insertion fail.
        let err = a.add_self_event(Some(EventHash([0xEE; 32]))).unwrap_err();
        assert!(err.is_parent_missing());
        assert_eq!(a.transaction_pool_len(), 1);
        // Head unchanged.
        assert_eq!(a.head_event().unwrap().body.index, 0);
    }
}
