//! Event, round, block and frame persistence.
//!
//! Two backends sit behind the [`Store`] trait: a pure in-memory store whose
//! event map is a bounded LRU, and a sled-backed store that writes through
//! the same in-memory structures. Reads always hit the cache first, so a
//! value written in-process is immediately readable (read-your-writes).
//!
//! Missing keys surface as [`StoreError::NotFound`]; a hash that resolves to
//! a different body is [`StoreError::Corruption`] and fatal to the node.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use bincode::Options;
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::peers::{PeerRecord, PeerSet};
use crate::poset::block::Block;
use crate::poset::event::{Event, EventHash};
use crate::poset::round::{Frame, Root, RoundInfo};

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("store corruption: {0}")]
    Corruption(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage I/O error: {0}")]
    Io(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Narrow persistence contract shared by both backends.
pub trait Store: Send + Sync {
    fn cache_size(&self) -> usize;

    fn get_event(&self, hash: &EventHash) -> Result<Event, StoreError>;
    /// Append-only: re-setting an identical body is a decoration update;
    /// a different body under the same hash is corruption.
    fn set_event(&self, event: &Event) -> Result<(), StoreError>;

    /// Hashes of a participant's events with index strictly above
    /// `skip_index`, ascending.
    fn participant_events(
        &self,
        creator_id: u64,
        skip_index: i64,
    ) -> Result<Vec<EventHash>, StoreError>;
    fn participant_event(&self, creator_id: u64, index: u64) -> Result<EventHash, StoreError>;
    /// Latest event hash for a participant; `true` if it is a reset root.
    fn last_event_from(&self, creator_id: u64) -> Result<(EventHash, bool), StoreError>;
    fn root_of(&self, creator_id: u64) -> Option<Root>;
    /// Last known index per participant id; `-1` when none.
    fn known_events(&self) -> HashMap<u64, i64>;

    fn get_round(&self, round: u64) -> Result<RoundInfo, StoreError>;
    fn set_round(&self, round: u64, info: &RoundInfo) -> Result<(), StoreError>;
    fn last_round(&self) -> i64;
    fn round_witnesses(&self, round: u64) -> Vec<EventHash>;
    fn round_events(&self, round: u64) -> Vec<EventHash>;

    fn get_block(&self, index: u64) -> Result<Block, StoreError>;
    fn set_block(&self, block: &Block) -> Result<(), StoreError>;
    fn last_block_index(&self) -> i64;

    fn get_frame(&self, round: u64) -> Result<Frame, StoreError>;
    fn set_frame(&self, frame: &Frame) -> Result<(), StoreError>;

    fn add_consensus_event(&self, hash: EventHash) -> Result<(), StoreError>;
    fn consensus_events(&self) -> Vec<EventHash>;
    fn consensus_events_count(&self) -> u64;

    /// First round consensus may decide after the latest reset, if any.
    fn first_consensus_round(&self) -> Result<Option<u64>, StoreError>;
    fn set_first_consensus_round(&self, round: u64) -> Result<(), StoreError>;

    /// Events in local insertion order, for bootstrap and diffs.
    fn topological_events(&self) -> Result<Vec<Event>, StoreError>;

    /// Rewind to a fast-forwarded frame: participant chains restart at the
    /// frame roots and the frame events become the entire known history.
    /// Blocks and frames survive the reset.
    fn reset(&self, frame: &Frame) -> Result<(), StoreError>;

    fn need_bootstrap(&self) -> bool;
    fn store_path(&self) -> Option<PathBuf>;
    fn close(&self) -> Result<(), StoreError>;
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::DefaultOptions::new()
        .with_limit(crate::constants::MAX_NETWORK_MESSAGE_BYTES as u64)
        .serialize(value)
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::DefaultOptions::new()
        .with_limit(crate::constants::MAX_NETWORK_MESSAGE_BYTES as u64)
        .deserialize(bytes)
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

// ── In-memory backend ──

/// One participant's self-parent chain, optionally anchored at a reset root.
///
/// Events at or below the root index (frame history after a fast-forward)
/// live in `historical`; the live chain grows in `hashes` from
/// `root.index + 1` upward.
#[derive(Clone, Debug, Default)]
struct ParticipantLog {
    root: Option<Root>,
    historical: BTreeMap<u64, EventHash>,
    /// `hashes[i]` holds the event at index `first_index() + i`.
    hashes: Vec<EventHash>,
}

impl ParticipantLog {
    fn first_index(&self) -> u64 {
        self.root.as_ref().map(|r| r.index + 1).unwrap_or(0)
    }

    fn next_index(&self) -> u64 {
        self.first_index() + self.hashes.len() as u64
    }

    fn last_index(&self) -> i64 {
        if self.hashes.is_empty() {
            self.root.as_ref().map(|r| r.index as i64).unwrap_or(-1)
        } else {
            (self.next_index() - 1) as i64
        }
    }

    fn hash_at(&self, index: u64) -> Option<EventHash> {
        if let Some(root) = &self.root {
            if root.index == index {
                return Some(root.hash);
            }
        }
        if index < self.first_index() {
            return self.historical.get(&index).copied();
        }
        self.hashes.get((index - self.first_index()) as usize).copied()
    }
}

/// In-memory store: bounded LRU for event bodies, unbounded maps for rounds,
/// blocks and frames.
pub struct InmemStore {
    cache_size: usize,
    ids: Vec<u64>,
    events: Mutex<LruCache<EventHash, Event>>,
    logs: RwLock<HashMap<u64, ParticipantLog>>,
    rounds: RwLock<BTreeMap<u64, RoundInfo>>,
    blocks: RwLock<BTreeMap<u64, Block>>,
    frames: RwLock<BTreeMap<u64, Frame>>,
    consensus: RwLock<Vec<EventHash>>,
    topo: RwLock<Vec<EventHash>>,
    first_consensus_round: RwLock<Option<u64>>,
}

impl InmemStore {
    pub fn new(participants: &PeerSet, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        let ids: Vec<u64> = participants.iter().map(|p| p.id).collect();
        let logs = ids
            .iter()
            .map(|&id| (id, ParticipantLog::default()))
            .collect();
        InmemStore {
            cache_size,
            ids,
            events: Mutex::new(LruCache::new(capacity)),
            logs: RwLock::new(logs),
            rounds: RwLock::new(BTreeMap::new()),
            blocks: RwLock::new(BTreeMap::new()),
            frames: RwLock::new(BTreeMap::new()),
            consensus: RwLock::new(Vec::new()),
            topo: RwLock::new(Vec::new()),
            first_consensus_round: RwLock::new(None),
        }
    }

    /// Poisoned locks only happen after a panic while holding them; treat as
    /// corruption rather than propagating the panic.
    fn lock_err() -> StoreError {
        StoreError::Corruption("store lock poisoned".into())
    }

    fn set_event_inner(&self, event: &Event, append_topo: bool) -> Result<bool, StoreError> {
        let hash = event.hash();
        let mut events = self.events.lock().map_err(|_| Self::lock_err())?;
        if let Some(existing) = events.peek(&hash) {
            if existing.body != event.body {
                return Err(StoreError::Corruption(format!(
                    "event {hash} re-set with a different body"
                )));
            }
            // Same body: decoration update only.
            events.put(hash, event.clone());
            return Ok(false);
        }
        events.put(hash, event.clone());
        drop(events);

        let creator_id = crate::poset::event::creator_id_of(&event.body.creator);
        let mut logs = self.logs.write().map_err(|_| Self::lock_err())?;
        let log = logs.entry(creator_id).or_default();
        let below_root = log
            .root
            .as_ref()
            .map(|r| event.body.index <= r.index)
            .unwrap_or(false);
        if below_root {
            log.historical.insert(event.body.index, hash);
        } else if event.body.index == log.next_index() {
            log.hashes.push(hash);
        }
        drop(logs);

        if append_topo {
            self.topo.write().map_err(|_| Self::lock_err())?.push(hash);
        }
        Ok(true)
    }
}

impl Store for InmemStore {
    fn cache_size(&self) -> usize {
        self.cache_size
    }

    fn get_event(&self, hash: &EventHash) -> Result<Event, StoreError> {
        let mut events = self.events.lock().map_err(|_| Self::lock_err())?;
        events
            .get(hash)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("event {hash}")))
    }

    fn set_event(&self, event: &Event) -> Result<(), StoreError> {
        self.set_event_inner(event, true).map(|_| ())
    }

    fn participant_events(
        &self,
        creator_id: u64,
        skip_index: i64,
    ) -> Result<Vec<EventHash>, StoreError> {
        let logs = self.logs.read().map_err(|_| Self::lock_err())?;
        let log = logs
            .get(&creator_id)
            .ok_or_else(|| StoreError::NotFound(format!("participant {creator_id}")))?;
        let first = log.first_index() as i64;
        let start = ((skip_index + 1).max(first) - first) as usize;
        Ok(log.hashes.iter().skip(start).copied().collect())
    }

    fn participant_event(&self, creator_id: u64, index: u64) -> Result<EventHash, StoreError> {
        let logs = self.logs.read().map_err(|_| Self::lock_err())?;
        logs.get(&creator_id)
            .and_then(|log| log.hash_at(index))
            .ok_or_else(|| {
                StoreError::NotFound(format!("event {index} from participant {creator_id}"))
            })
    }

    fn last_event_from(&self, creator_id: u64) -> Result<(EventHash, bool), StoreError> {
        let logs = self.logs.read().map_err(|_| Self::lock_err())?;
        let log = logs
            .get(&creator_id)
            .ok_or_else(|| StoreError::NotFound(format!("participant {creator_id}")))?;
        if let Some(last) = log.hashes.last() {
            return Ok((*last, false));
        }
        if let Some(root) = &log.root {
            return Ok((root.hash, true));
        }
        Err(StoreError::NotFound(format!(
            "no events from participant {creator_id}"
        )))
    }

    fn root_of(&self, creator_id: u64) -> Option<Root> {
        self.logs
            .read()
            .ok()
            .and_then(|logs| logs.get(&creator_id).and_then(|l| l.root.clone()))
    }

    fn known_events(&self) -> HashMap<u64, i64> {
        let logs = match self.logs.read() {
            Ok(logs) => logs,
            Err(_) => return HashMap::new(),
        };
        self.ids
            .iter()
            .map(|&id| (id, logs.get(&id).map(|l| l.last_index()).unwrap_or(-1)))
            .collect()
    }

    fn get_round(&self, round: u64) -> Result<RoundInfo, StoreError> {
        self.rounds
            .read()
            .map_err(|_| Self::lock_err())?
            .get(&round)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("round {round}")))
    }

    fn set_round(&self, round: u64, info: &RoundInfo) -> Result<(), StoreError> {
        self.rounds
            .write()
            .map_err(|_| Self::lock_err())?
            .insert(round, info.clone());
        Ok(())
    }

    fn last_round(&self) -> i64 {
        self.rounds
            .read()
            .ok()
            .and_then(|r| r.keys().next_back().map(|&k| k as i64))
            .unwrap_or(-1)
    }

    fn round_witnesses(&self, round: u64) -> Vec<EventHash> {
        self.rounds
            .read()
            .ok()
            .and_then(|r| r.get(&round).map(|info| info.witness_hashes()))
            .unwrap_or_default()
    }

    fn round_events(&self, round: u64) -> Vec<EventHash> {
        self.rounds
            .read()
            .ok()
            .and_then(|r| r.get(&round).map(|info| info.events.iter().copied().collect()))
            .unwrap_or_default()
    }

    fn get_block(&self, index: u64) -> Result<Block, StoreError> {
        self.blocks
            .read()
            .map_err(|_| Self::lock_err())?
            .get(&index)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("block {index}")))
    }

    fn set_block(&self, block: &Block) -> Result<(), StoreError> {
        self.blocks
            .write()
            .map_err(|_| Self::lock_err())?
            .insert(block.index(), block.clone());
        Ok(())
    }

    fn last_block_index(&self) -> i64 {
        self.blocks
            .read()
            .ok()
            .and_then(|b| b.keys().next_back().map(|&k| k as i64))
            .unwrap_or(-1)
    }

    fn get_frame(&self, round: u64) -> Result<Frame, StoreError> {
        self.frames
            .read()
            .map_err(|_| Self::lock_err())?
            .get(&round)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("frame {round}")))
    }

    fn set_frame(&self, frame: &Frame) -> Result<(), StoreError> {
        self.frames
            .write()
            .map_err(|_| Self::lock_err())?
            .insert(frame.round, frame.clone());
        Ok(())
    }

    fn add_consensus_event(&self, hash: EventHash) -> Result<(), StoreError> {
        self.consensus
            .write()
            .map_err(|_| Self::lock_err())?
            .push(hash);
        Ok(())
    }

    fn consensus_events(&self) -> Vec<EventHash> {
        self.consensus
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn consensus_events_count(&self) -> u64 {
        self.consensus.read().map(|c| c.len() as u64).unwrap_or(0)
    }

    fn first_consensus_round(&self) -> Result<Option<u64>, StoreError> {
        Ok(*self
            .first_consensus_round
            .read()
            .map_err(|_| Self::lock_err())?)
    }

    fn set_first_consensus_round(&self, round: u64) -> Result<(), StoreError> {
        *self
            .first_consensus_round
            .write()
            .map_err(|_| Self::lock_err())? = Some(round);
        Ok(())
    }

    fn topological_events(&self) -> Result<Vec<Event>, StoreError> {
        let hashes = self.topo.read().map_err(|_| Self::lock_err())?.clone();
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            out.push(self.get_event(&hash)?);
        }
        Ok(out)
    }

    fn reset(&self, frame: &Frame) -> Result<(), StoreError> {
        {
            let mut events = self.events.lock().map_err(|_| Self::lock_err())?;
            events.clear();
        }
        {
            let mut logs = self.logs.write().map_err(|_| Self::lock_err())?;
            logs.clear();
            for &id in &self.ids {
                logs.insert(
                    id,
                    ParticipantLog {
                        root: frame.root_of(id).cloned(),
                        ..ParticipantLog::default()
                    },
                );
            }
        }
        self.rounds.write().map_err(|_| Self::lock_err())?.clear();
        self.consensus.write().map_err(|_| Self::lock_err())?.clear();
        self.topo.write().map_err(|_| Self::lock_err())?.clear();

        // Frame events become the entire known history, appended per creator
        // in index order so the chains stay contiguous.
        let mut ordered = frame.events.clone();
        ordered.sort_by_key(|e| (crate::poset::event::creator_id_of(&e.body.creator), e.body.index));
        let mut rounds = BTreeMap::<u64, RoundInfo>::new();
        for event in &ordered {
            self.set_event_inner(event, true)?;
            self.consensus
                .write()
                .map_err(|_| Self::lock_err())?
                .push(event.hash());
            if let Some(round) = event.round {
                rounds
                    .entry(round)
                    .or_default()
                    .add_event(event.hash(), event.witness);
            }
        }
        let mut stored_rounds = self.rounds.write().map_err(|_| Self::lock_err())?;
        *stored_rounds = rounds;
        Ok(())
    }

    fn need_bootstrap(&self) -> bool {
        false
    }

    fn store_path(&self) -> Option<PathBuf> {
        None
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ── Sled backend ──

mod tree {
    pub const EVENTS: &str = "events";
    pub const PARTICIPANT_EVENTS: &str = "participant_events";
    pub const ROOTS: &str = "roots";
    pub const ROUNDS: &str = "rounds";
    pub const BLOCKS: &str = "blocks";
    pub const FRAMES: &str = "frames";
    pub const CONSENSUS: &str = "consensus";
    pub const TOPO: &str = "topo";
    pub const PARTICIPANTS: &str = "participants";
    pub const META: &str = "meta";
}

/// Key of the first-consensus-round marker in the meta tree.
const META_FIRST_ROUND: &[u8] = b"first_consensus_round";

fn chain_key(creator_id: u64, index: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&creator_id.to_be_bytes());
    key[8..].copy_from_slice(&index.to_be_bytes());
    key
}

/// Sled-backed store: writes go through the in-memory structures and to disk
/// in the same call; event reads fall back to sled on LRU misses.
pub struct SledStore {
    inmem: InmemStore,
    participants: PeerSet,
    db: sled::Db,
    events: sled::Tree,
    participant_events: sled::Tree,
    roots: sled::Tree,
    rounds: sled::Tree,
    blocks: sled::Tree,
    frames: sled::Tree,
    consensus: sled::Tree,
    topo: sled::Tree,
    meta: sled::Tree,
    path: PathBuf,
    bootstrapped: AtomicBool,
}

impl SledStore {
    /// Open or create the database at `path` for a known participant set.
    pub fn new(
        participants: &PeerSet,
        cache_size: usize,
        path: &Path,
    ) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let store = Self::from_db(participants.clone(), cache_size, db, path.to_path_buf())?;
        // Persist the participant set so the store can be reloaded alone.
        let tree = store.db.open_tree(tree::PARTICIPANTS)?;
        for p in participants.iter() {
            let record = PeerRecord {
                pub_key_hex: p.public_key.to_hex(),
                net_addr: p.net_addr.clone(),
            };
            tree.insert(p.id.to_be_bytes(), encode(&record)?)?;
        }
        store.load_existing()?;
        Ok(store)
    }

    /// Reload a previously created database; the participant set is read
    /// back from disk.
    pub fn load(cache_size: usize, path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let tree = db.open_tree(tree::PARTICIPANTS)?;
        let mut records = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            records.push(decode::<PeerRecord>(&value)?);
        }
        if records.is_empty() {
            return Err(StoreError::NotFound(format!(
                "no participants recorded in {}",
                path.display()
            )));
        }
        let mut participants = Vec::with_capacity(records.len());
        for rec in &records {
            let key = crate::crypto::PublicKey::from_hex(&rec.pub_key_hex)
                .map_err(|e| StoreError::Corruption(e.to_string()))?;
            participants.push(crate::peers::Participant::new(key, rec.net_addr.clone()));
        }
        let peer_set = PeerSet::new(participants)
            .map_err(|e| StoreError::Corruption(e.to_string()))?;

        let store = Self::from_db(peer_set, cache_size, db, path.to_path_buf())?;
        store.load_existing()?;
        Ok(store)
    }

    fn from_db(
        participants: PeerSet,
        cache_size: usize,
        db: sled::Db,
        path: PathBuf,
    ) -> Result<Self, StoreError> {
        Ok(SledStore {
            inmem: InmemStore::new(&participants, cache_size),
            events: db.open_tree(tree::EVENTS)?,
            participant_events: db.open_tree(tree::PARTICIPANT_EVENTS)?,
            roots: db.open_tree(tree::ROOTS)?,
            rounds: db.open_tree(tree::ROUNDS)?,
            blocks: db.open_tree(tree::BLOCKS)?,
            frames: db.open_tree(tree::FRAMES)?,
            consensus: db.open_tree(tree::CONSENSUS)?,
            topo: db.open_tree(tree::TOPO)?,
            meta: db.open_tree(tree::META)?,
            participants,
            db,
            path,
            bootstrapped: AtomicBool::new(false),
        })
    }

    /// Rebuild the in-memory indexes from disk after (re)opening.
    fn load_existing(&self) -> Result<(), StoreError> {
        let had_events = !self.topo.is_empty();
        self.bootstrapped.store(had_events, Ordering::Relaxed);

        for entry in self.roots.iter() {
            let (_, value) = entry?;
            let root: Root = decode(&value)?;
            let mut logs = self
                .inmem
                .logs
                .write()
                .map_err(|_| InmemStore::lock_err())?;
            let creator_id = root.creator_id;
            logs.entry(creator_id).or_default().root = Some(root);
        }
        // Replaying the topo log re-populates the event cache, chains and
        // topological index in original insertion order.
        for entry in self.topo.iter() {
            let (_, value) = entry?;
            let hash: EventHash = decode(&value)?;
            let event = self.fetch_event(&hash)?;
            self.inmem.set_event_inner(&event, true)?;
        }
        for entry in self.rounds.iter() {
            let (key, value) = entry?;
            let round = be_u64(&key)?;
            let info: RoundInfo = decode(&value)?;
            self.inmem.set_round(round, &info)?;
        }
        for entry in self.blocks.iter() {
            let (_, value) = entry?;
            let block: Block = decode(&value)?;
            self.inmem.set_block(&block)?;
        }
        for entry in self.frames.iter() {
            let (_, value) = entry?;
            let frame: Frame = decode(&value)?;
            self.inmem.set_frame(&frame)?;
        }
        for entry in self.consensus.iter() {
            let (_, value) = entry?;
            let hash: EventHash = decode(&value)?;
            self.inmem.add_consensus_event(hash)?;
        }
        if let Some(value) = self.meta.get(META_FIRST_ROUND)? {
            self.inmem.set_first_consensus_round(be_u64(&value)?)?;
        }
        Ok(())
    }

    pub fn peer_set(&self) -> &PeerSet {
        &self.participants
    }

    fn fetch_event(&self, hash: &EventHash) -> Result<Event, StoreError> {
        let value = self
            .events
            .get(hash.0)?
            .ok_or_else(|| StoreError::NotFound(format!("event {hash}")))?;
        let event: Event = decode(&value)?;
        if event.hash() != *hash {
            return Err(StoreError::Corruption(format!(
                "event {hash} hashes to {} on read-back",
                event.hash()
            )));
        }
        if !event.verify() {
            return Err(StoreError::Corruption(format!(
                "event {hash} signature invalid on read-back"
            )));
        }
        Ok(event)
    }
}

fn be_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corruption("malformed u64 key".into()))?;
    Ok(u64::from_be_bytes(raw))
}

impl Store for SledStore {
    fn cache_size(&self) -> usize {
        self.inmem.cache_size()
    }

    fn get_event(&self, hash: &EventHash) -> Result<Event, StoreError> {
        match self.inmem.get_event(hash) {
            Ok(event) => Ok(event),
            Err(err) if err.is_not_found() => {
                let event = self.fetch_event(hash)?;
                // Promote into the LRU without touching chains or topo.
                if let Ok(mut cache) = self.inmem.events.lock() {
                    cache.put(*hash, event.clone());
                }
                Ok(event)
            }
            Err(err) => Err(err),
        }
    }

    fn set_event(&self, event: &Event) -> Result<(), StoreError> {
        let newly_added = self.inmem.set_event_inner(event, true)?;
        let hash = event.hash();
        self.events.insert(hash.0, encode(event)?)?;
        if newly_added {
            let creator_id = crate::poset::event::creator_id_of(&event.body.creator);
            self.participant_events
                .insert(chain_key(creator_id, event.body.index), encode(&hash)?)?;
            // The in-memory topo log was just extended; mirror its position.
            let seq = self
                .inmem
                .topo
                .read()
                .map_err(|_| InmemStore::lock_err())?
                .len() as u64
                - 1;
            self.topo.insert(seq.to_be_bytes(), encode(&hash)?)?;
        }
        Ok(())
    }

    fn participant_events(
        &self,
        creator_id: u64,
        skip_index: i64,
    ) -> Result<Vec<EventHash>, StoreError> {
        self.inmem.participant_events(creator_id, skip_index)
    }

    fn participant_event(&self, creator_id: u64, index: u64) -> Result<EventHash, StoreError> {
        self.inmem.participant_event(creator_id, index)
    }

    fn last_event_from(&self, creator_id: u64) -> Result<(EventHash, bool), StoreError> {
        self.inmem.last_event_from(creator_id)
    }

    fn root_of(&self, creator_id: u64) -> Option<Root> {
        self.inmem.root_of(creator_id)
    }

    fn known_events(&self) -> HashMap<u64, i64> {
        self.inmem.known_events()
    }

    fn get_round(&self, round: u64) -> Result<RoundInfo, StoreError> {
        self.inmem.get_round(round)
    }

    fn set_round(&self, round: u64, info: &RoundInfo) -> Result<(), StoreError> {
        self.inmem.set_round(round, info)?;
        self.rounds.insert(round.to_be_bytes(), encode(info)?)?;
        Ok(())
    }

    fn last_round(&self) -> i64 {
        self.inmem.last_round()
    }

    fn round_witnesses(&self, round: u64) -> Vec<EventHash> {
        self.inmem.round_witnesses(round)
    }

    fn round_events(&self, round: u64) -> Vec<EventHash> {
        self.inmem.round_events(round)
    }

    fn get_block(&self, index: u64) -> Result<Block, StoreError> {
        self.inmem.get_block(index)
    }

    fn set_block(&self, block: &Block) -> Result<(), StoreError> {
        self.inmem.set_block(block)?;
        self.blocks
            .insert(block.index().to_be_bytes(), encode(block)?)?;
        Ok(())
    }

    fn last_block_index(&self) -> i64 {
        self.inmem.last_block_index()
    }

    fn get_frame(&self, round: u64) -> Result<Frame, StoreError> {
        self.inmem.get_frame(round)
    }

    fn set_frame(&self, frame: &Frame) -> Result<(), StoreError> {
        self.inmem.set_frame(frame)?;
        self.frames
            .insert(frame.round.to_be_bytes(), encode(frame)?)?;
        Ok(())
    }

    fn add_consensus_event(&self, hash: EventHash) -> Result<(), StoreError> {
        self.inmem.add_consensus_event(hash)?;
        let seq = self.inmem.consensus_events_count() - 1;
        self.consensus.insert(seq.to_be_bytes(), encode(&hash)?)?;
        Ok(())
    }

    fn consensus_events(&self) -> Vec<EventHash> {
        self.inmem.consensus_events()
    }

    fn consensus_events_count(&self) -> u64 {
        self.inmem.consensus_events_count()
    }

    fn first_consensus_round(&self) -> Result<Option<u64>, StoreError> {
        self.inmem.first_consensus_round()
    }

    fn set_first_consensus_round(&self, round: u64) -> Result<(), StoreError> {
        self.inmem.set_first_consensus_round(round)?;
        self.meta
            .insert(META_FIRST_ROUND, round.to_be_bytes().to_vec())?;
        Ok(())
    }

    fn topological_events(&self) -> Result<Vec<Event>, StoreError> {
        let hashes = self
            .inmem
            .topo
            .read()
            .map_err(|_| InmemStore::lock_err())?
            .clone();
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            out.push(self.get_event(&hash)?);
        }
        Ok(out)
    }

    fn reset(&self, frame: &Frame) -> Result<(), StoreError> {
        self.inmem.reset(frame)?;

        self.events.clear()?;
        self.participant_events.clear()?;
        self.roots.clear()?;
        self.rounds.clear()?;
        self.consensus.clear()?;
        self.topo.clear()?;

        for root in &frame.roots {
            self.roots
                .insert(root.creator_id.to_be_bytes(), encode(root)?)?;
        }
        let mut ordered = frame.events.clone();
        ordered.sort_by_key(|e| {
            (
                crate::poset::event::creator_id_of(&e.body.creator),
                e.body.index,
            )
        });
        for (seq, event) in ordered.iter().enumerate() {
            let hash = event.hash();
            self.events.insert(hash.0, encode(event)?)?;
            let creator_id = crate::poset::event::creator_id_of(&event.body.creator);
            self.participant_events
                .insert(chain_key(creator_id, event.body.index), encode(&hash)?)?;
            self.topo
                .insert((seq as u64).to_be_bytes(), encode(&hash)?)?;
            self.consensus
                .insert((seq as u64).to_be_bytes(), encode(&hash)?)?;
        }
        for (round, info) in self
            .inmem
            .rounds
            .read()
            .map_err(|_| InmemStore::lock_err())?
            .iter()
        {
            self.rounds.insert(round.to_be_bytes(), encode(info)?)?;
        }
        self.db.flush()?;
        Ok(())
    }

    fn need_bootstrap(&self) -> bool {
        self.bootstrapped.load(Ordering::Relaxed)
    }

    fn store_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::peers::Participant;
    use crate::poset::event::EventBody;

    fn test_peers(n: usize) -> (Vec<Keypair>, PeerSet) {
        let keys: Vec<Keypair> = (0..n).map(|_| Keypair::generate()).collect();
        let participants = keys
            .iter()
            .map(|k| Participant::new(k.public.clone(), "127.0.0.1:0"))
            .collect();
        (keys, PeerSet::new(participants).unwrap())
    }

    fn make_event(kp: &Keypair, index: u64, self_parent: Option<EventHash>) -> Event {
        Event::new_signed(
            EventBody {
                transactions: vec![],
                block_signatures: vec![],
                self_parent,
                other_parent: None,
                creator: kp.public.as_bytes().to_vec(),
                index,
                timestamp: index,
            },
            kp,
        )
        .unwrap()
    }

    #[test]
    fn event_roundtrip_and_not_found() {
        let (keys, peers) = test_peers(2);
        let store = InmemStore::new(&peers, 16);
        let event = make_event(&keys[0], 0, None);
        let hash = event.hash();

        assert!(store.get_event(&hash).unwrap_err().is_not_found());
        store.set_event(&event).unwrap();
        assert_eq!(store.get_event(&hash).unwrap().body, event.body);

        let id = keys[0].public.participant_id();
        assert_eq!(store.last_event_from(id).unwrap(), (hash, false));
        assert_eq!(store.known_events()[&id], 0);
    }

    #[test]
    fn decoration_update_keeps_single_chain_entry() {
        let (keys, peers) = test_peers(2);
        let store = InmemStore::new(&peers, 16);
        let mut event = make_event(&keys[0], 0, None);
        store.set_event(&event).unwrap();

        event.round = Some(1);
        event.witness = true;
        store.set_event(&event).unwrap();

        let id = keys[0].public.participant_id();
        assert_eq!(store.participant_events(id, -1).unwrap().len(), 1);
        assert_eq!(store.get_event(&event.hash()).unwrap().round, Some(1));
    }

    #[test]
    fn participant_events_respects_skip() {
        let (keys, peers) = test_peers(2);
        let store = InmemStore::new(&peers, 16);
        let id = keys[0].public.participant_id();

        let mut parent = None;
        let mut hashes = Vec::new();
        for i in 0..4 {
            let e = make_event(&keys[0], i, parent);
            parent = Some(e.hash());
            hashes.push(e.hash());
            store.set_event(&e).unwrap();
        }

        assert_eq!(store.participant_events(id, -1).unwrap(), hashes);
        assert_eq!(store.participant_events(id, 1).unwrap(), &hashes[2..]);
        assert_eq!(store.participant_event(id, 2).unwrap(), hashes[2]);
        assert!(store.participant_event(id, 9).is_err());
    }

    #[test]
    fn duplicate_set_event_is_noop() {
        let (keys, peers) = test_peers(2);
        let store = InmemStore::new(&peers, 16);
        let event = make_event(&keys[0], 0, None);
        store.set_event(&event).unwrap();
        store.set_event(&event).unwrap();

        let id = keys[0].public.participant_id();
        assert_eq!(store.participant_events(id, -1).unwrap().len(), 1);
        assert_eq!(store.topological_events().unwrap().len(), 1);
    }

    #[test]
    fn blocks_and_rounds() {
        let (_keys, peers) = test_peers(2);
        let store = InmemStore::new(&peers, 16);
        assert_eq!(store.last_block_index(), -1);
        assert_eq!(store.last_round(), -1);

        let block = Block::new(0, 1, [0u8; 32], vec![]);
        store.set_block(&block).unwrap();
        assert_eq!(store.last_block_index(), 0);
        assert_eq!(store.get_block(0).unwrap(), block);

        let mut info = RoundInfo::default();
        info.add_event(EventHash([1u8; 32]), true);
        store.set_round(2, &info).unwrap();
        assert_eq!(store.last_round(), 2);
        assert_eq!(store.round_witnesses(2).len(), 1);
        assert!(store.round_witnesses(7).is_empty());
    }

    #[test]
    fn sled_store_persists_across_reload() {
        let (keys, peers) = test_peers(2);
        let dir = std::env::temp_dir().join(format!(
            "braid-sled-{}-{}",
            std::process::id(),
            crate::now_millis()
        ));

        let hash;
        {
            let store = SledStore::new(&peers, 16, &dir).unwrap();
            assert!(!store.need_bootstrap());
            let event = make_event(&keys[0], 0, None);
            hash = event.hash();
            store.set_event(&event).unwrap();
            store.set_block(&Block::new(0, 1, [0u8; 32], vec![])).unwrap();
            store.close().unwrap();
        }

        let store = SledStore::load(16, &dir).unwrap();
        assert!(store.need_bootstrap());
        assert_eq!(store.get_event(&hash).unwrap().hash(), hash);
        assert_eq!(store.last_block_index(), 0);
        assert_eq!(store.peer_set().len(), 2);
        let id = keys[0].public.participant_id();
        assert_eq!(store.known_events()[&id], 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reset_seeds_roots_and_frame_events() {
        let (keys, peers) = test_peers(2);
        let store = InmemStore::new(&peers, 16);
        let id0 = keys[0].public.participant_id();
        let id1 = keys[1].public.participant_id();

        let mut anchor = make_event(&keys[0], 4, None);
        anchor.round = Some(3);
        anchor.witness = true;

        let frame = Frame {
            round: 3,
            roots: vec![
                Root {
                    creator_id: id0,
                    hash: anchor.hash(),
                    index: 4,
                    round: 3,
                },
                Root {
                    creator_id: id1,
                    hash: EventHash([9u8; 32]),
                    index: 7,
                    round: 3,
                },
            ],
            events: vec![anchor.clone()],
        };

        store.set_block(&Block::new(2, 3, frame.hash(), vec![])).unwrap();
        store.reset(&frame).unwrap();

        // Blocks survive, chains restart at the roots.
        assert_eq!(store.last_block_index(), 2);
        let known = store.known_events();
        assert_eq!(known[&id0], 4);
        assert_eq!(known[&id1], 7);
        let (h, is_root) = store.last_event_from(id1).unwrap();
        assert_eq!(h, EventHash([9u8; 32]));
        assert!(is_root);
        // The frame event is retrievable and counted as consensus.
        assert_eq!(store.get_event(&anchor.hash()).unwrap().round, Some(3));
        assert_eq!(store.consensus_events_count(), 1);
        assert_eq!(store.round_witnesses(3).len(), 1);
    }
}
