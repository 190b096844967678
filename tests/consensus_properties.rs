//! Consensus property tests over the public API: determinism, ordering,
//! fork immunity and boundary behaviors, driven by a simulated gossip
//! schedule with no networking involved.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use braid::crypto::Keypair;
use braid::node::Core;
use braid::peers::{Participant, PeerSet};
use braid::poset::{Block, InmemStore, Poset};

// ── Helpers ─────────────────────────────────────────────────────────────

/// Keys (ordered by participant id) and the shared participant set.
fn make_net(n: usize) -> (Vec<Keypair>, Arc<PeerSet>) {
    let mut keys: Vec<Keypair> = (0..n).map(|_| Keypair::generate()).collect();
    keys.sort_by_key(|k| k.public.participant_id());
    let participants: Vec<Participant> = keys
        .iter()
        .map(|k| Participant::new(k.public.clone(), "127.0.0.1:0"))
        .collect();
    let peers = Arc::new(PeerSet::new(participants).unwrap());
    (keys, peers)
}

fn make_core(key: &Keypair, peers: &Arc<PeerSet>) -> Core {
    let store = Box::new(InmemStore::new(peers, 50_000));
    let (tx, _rx) = mpsc::channel(1024);
    let poset = Poset::new(peers.clone(), store, tx);
    let mut core = Core::new(key.clone(), peers.clone(), poset);
    core.init().unwrap();
    core
}

/// Build `n` cores over one participant set; `cores[i]` is the i-th
/// participant by ascending id.
fn make_cores(n: usize) -> (Vec<Core>, Arc<PeerSet>) {
    let (keys, peers) = make_net(n);
    let cores = keys.iter().map(|k| make_core(k, &peers)).collect();
    (cores, peers)
}

/// One gossip exchange: `into` pulls everything it is missing from `from`
/// and weaves a new self event on top of `from`'s head.
fn pull(cores: &mut [Core], into: usize, from: usize) {
    let known = cores[into].known_events();
    let diff = cores[from].event_diff(&known).unwrap();
    let wire = cores[from].to_wire(&diff).unwrap();
    let other_parent = cores[from].head().unwrap();
    cores[into].sync(&wire).unwrap();
    cores[into].add_self_event(Some(other_parent)).unwrap();
}

/// Round-robin gossip among `active` core indexes, submitting a transaction
/// before each exchange.
fn run_gossip(cores: &mut [Core], active: &[usize], steps: usize) {
    let mut seq = 0u64;
    for s in 0..steps {
        let into = active[s % active.len()];
        let from = active[(s + 1) % active.len()];
        seq += 1;
        cores[into]
            .add_transaction(format!("core{into} tx{seq}").into_bytes())
            .unwrap();
        pull(cores, into, from);
    }
}

fn blocks_of(core: &Core) -> Vec<Block> {
    (0..=core.last_block_index())
        .map(|i| core.get_block(i as u64).unwrap())
        .collect()
}

fn assert_same_blocks(a: &[Block], b: &[Block]) {
    let common = a.len().min(b.len());
    assert!(common > 0, "no common blocks to compare");
    for i in 0..common {
        assert_eq!(a[i].body.index, b[i].body.index);
        assert_eq!(a[i].body.round_received, b[i].body.round_received, "block {i}");
        assert_eq!(a[i].body.frame_hash, b[i].body.frame_hash, "block {i}");
        assert_eq!(a[i].body.transactions, b[i].body.transactions, "block {i}");
    }
}

// ── Determinism ─────────────────────────────────────────────────────────

#[test]
fn all_nodes_derive_identical_blocks() {
    let (mut cores, _) = make_cores(4);
    run_gossip(&mut cores, &[0, 1, 2, 3], 80);

    // Everyone pulls from everyone once more so event sets converge.
    for into in 0..4 {
        for from in 0..4 {
            if into != from {
                pull(&mut cores, into, from);
            }
        }
    }

    let reference = blocks_of(&cores[0]);
    assert!(
        !reference.is_empty(),
        "expected consensus blocks after 80 gossip steps"
    );
    for core in &cores[1..] {
        assert_same_blocks(&reference, &blocks_of(core));
    }
}

#[test]
fn transactions_commit_exactly_once_in_order() {
    let (mut cores, _) = make_cores(4);
    run_gossip(&mut cores, &[0, 1, 2, 3], 80);

    let mut seen = HashMap::new();
    for block in blocks_of(&cores[0]) {
        for tx in &block.body.transactions {
            *seen.entry(tx.clone()).or_insert(0usize) += 1;
        }
    }
    assert!(!seen.is_empty());
    for (tx, count) in seen {
        assert_eq!(count, 1, "transaction {:?} committed {count} times", String::from_utf8_lossy(&tx));
    }
}

// ── Liveness & boundaries ───────────────────────────────────────────────

#[test]
fn three_of_four_keep_deciding() {
    // One of four participants offline: the remaining three are exactly a
    // super-majority and must keep reaching consensus.
    let (mut cores, peers) = make_cores(4);
    assert_eq!(peers.super_majority(), 3);

    run_gossip(&mut cores, &[0, 1, 2], 90);
    assert!(
        cores[0].last_block_index() >= 0,
        "three active participants should still decide rounds"
    );
    assert_eq!(cores[3].last_block_index(), -1);
}

#[test]
fn two_of_four_cannot_decide() {
    let (mut cores, _) = make_cores(4);
    run_gossip(&mut cores, &[0, 1], 60);
    assert_eq!(cores[0].last_block_index(), -1);
}

#[test]
fn empty_sync_is_a_valid_noop() {
    let (mut cores, _) = make_cores(2);
    // Share state fully, then diff again: nothing to exchange.
    pull(&mut cores, 0, 1);
    pull(&mut cores, 1, 0);

    let known = cores[1].known_events();
    let diff = cores[1].event_diff(&known).unwrap();
    assert!(diff.is_empty());

    let before = cores[1].known_events();
    cores[1].sync(&[]).unwrap();
    assert_eq!(cores[1].known_events(), before);
}

// ── Round-trip laws ─────────────────────────────────────────────────────

#[test]
fn wire_event_roundtrip_is_identity() {
    let (mut cores, _) = make_cores(3);
    run_gossip(&mut cores, &[0, 1, 2], 12);

    // Fully share, then round-trip every event core 0 knows through the
    // wire encoding of core 1.
    for from in [0usize, 2] {
        pull(&mut cores, 1, from);
    }
    let known_nothing: HashMap<u64, i64> =
        cores[1].known_events().keys().map(|&id| (id, -1)).collect();
    let all_events = cores[1].event_diff(&known_nothing).unwrap();
    assert!(!all_events.is_empty());

    let wire = cores[1].to_wire(&all_events).unwrap();
    let wire_again = cores[1]
        .to_wire(
            &wire
                .iter()
                .map(|w| cores[1].from_wire(w).unwrap())
                .collect::<Vec<_>>(),
        )
        .unwrap();
    assert_eq!(wire, wire_again);

    for (event, w) in all_events.iter().zip(wire.iter()) {
        let rebuilt = cores[1].from_wire(w).unwrap();
        assert_eq!(rebuilt.body, event.body);
        assert!(rebuilt.verify());
    }
}

#[test]
fn reinserting_known_events_changes_nothing() {
    let (mut cores, _) = make_cores(2);
    pull(&mut cores, 0, 1);

    let known_nothing: HashMap<u64, i64> =
        cores[0].known_events().keys().map(|&id| (id, -1)).collect();
    let all = cores[0].event_diff(&known_nothing).unwrap();
    let wire = cores[0].to_wire(&all).unwrap();

    let before = cores[0].known_events();
    cores[0].sync(&wire).unwrap();
    assert_eq!(cores[0].known_events(), before);
}

// ── Fork immunity ───────────────────────────────────────────────────────

#[test]
fn forked_creator_is_muted_and_consensus_survives() {
    let (keys, peers) = make_net(4);
    let mut cores: Vec<Core> = keys.iter().map(|k| make_core(k, &peers)).collect();

    // A second core wielding participant 3's key builds a diverging chain:
    // its leaf carries a transaction, so it is a different index-0 event
    // with a valid signature.
    let store = Box::new(InmemStore::new(&peers, 50_000));
    let (tx, _rx) = mpsc::channel(1024);
    let evil = {
        let mut evil = Core::new(keys[3].clone(), peers.clone(), Poset::new(peers.clone(), store, tx));
        evil.add_transaction(b"equivocation".to_vec()).unwrap();
        evil.init().unwrap();
        evil
    };

    // Core 0 first learns participant 3's honest leaf, then the forked one.
    pull(&mut cores, 0, 3);
    let fork_leaf = evil.head_event().unwrap();
    let wire = evil.to_wire(std::slice::from_ref(&fork_leaf)).unwrap();
    cores[0].sync(&wire).unwrap();

    let id3 = keys[3].public.participant_id();
    assert!(cores[0].poset.muted_creators().contains(&id3));
    assert_eq!(cores[0].poset.forks().len(), 1);
    // The honest chain entry is untouched.
    assert_eq!(cores[0].known_events()[&id3], 0);

    // Consensus among the three honest participants continues regardless.
    run_gossip(&mut cores, &[0, 1, 2], 90);
    assert!(cores[0].last_block_index() >= 0);
}

// ── Monotonicity ────────────────────────────────────────────────────────

#[test]
fn block_indexes_are_gapless_and_rounds_monotone() {
    let (mut cores, _) = make_cores(4);
    run_gossip(&mut cores, &[0, 1, 2, 3], 80);

    let blocks = blocks_of(&cores[0]);
    assert!(!blocks.is_empty());
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.body.index, i as u64);
        if i > 0 {
            assert!(block.body.round_received >= blocks[i - 1].body.round_received);
        }
    }
}
