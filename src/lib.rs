//! # Braid
//!
//! A leaderless, asynchronous BFT consensus engine:
//! - **Event DAG** — every participant weaves signed events into a shared
//!   graph (the *poset*) by gossiping with random-ish partners
//! - **Virtual voting** — rounds, witnesses and famous witnesses are derived
//!   locally from the graph; no voting messages ever cross the wire
//! - **Deterministic total order** — decided rounds yield blocks that are
//!   bit-identical on every honest node
//! - **Fast-forward** — a lagging node adopts a frame snapshot instead of
//!   replaying the whole history
//!
//! The participant set is fixed at genesis and loaded from a JSON peers file.
//! Application payloads are opaque byte strings exchanged over the proxy
//! bridge in [`proxy`].

pub mod crypto;
pub mod network;
pub mod node;
pub mod peers;
pub mod poset;
pub mod proxy;

/// Protocol constants
pub mod constants {
    /// Gossip heartbeat period in milliseconds.
    pub const HEARTBEAT_MS: u64 = 5;
    /// Per-call RPC timeout in milliseconds.
    pub const TCP_TIMEOUT_MS: u64 = 1_000;
    /// Default bounded LRU capacity for event caches.
    pub const CACHE_SIZE: usize = 5_000;
    /// Maximum number of events a single Sync response may carry before the
    /// responder signals `sync_limit` and the initiator must fast-forward.
    pub const SYNC_LIMIT: i64 = 1_000;
    /// Capacity of the bounded commit channel between poset and node.
    pub const COMMIT_CHANNEL_CAPACITY: usize = 400;
    /// Capacity of the bounded transaction submit channel.
    pub const SUBMIT_CHANNEL_CAPACITY: usize = 128;
    /// Shutdown drain window in milliseconds.
    pub const DRAIN_TIMEOUT_MS: u64 = 3_000;
    /// Maximum network message size (16 MiB).
    pub const MAX_NETWORK_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
    /// Virtual-voting coin-round period: every c-th voting round without a
    /// super-majority falls back to a pseudorandom bit.
    pub const COIN_ROUND_PERIOD: u64 = 10;
    /// A frame for round R carries the events received in rounds
    /// `[R - FRAME_HORIZON, R]`, enough history for a fast-forwarded node to
    /// recompute rounds of everything that follows.
    pub const FRAME_HORIZON: u64 = 6;
    /// Entries older than `round - FLAG_TABLE_DEPTH` are pruned from event
    /// flag tables.
    pub const FLAG_TABLE_DEPTH: u64 = 1;
    /// Default P2P listen port.
    pub const DEFAULT_LISTEN_PORT: u16 = 9610;
    /// Subdirectory of the data dir holding the sled database.
    pub const DB_DIR: &str = "braid_db";
    /// File name of the PEM-encoded private key inside the data dir.
    pub const KEY_FILE: &str = "priv_key.pem";
    /// File name of the participants file inside the data dir.
    pub const PEERS_FILE: &str = "peers.json";
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// Domains are static protocol strings, so the separator is taken as
/// `&'static str` and feeds straight into the keyed hasher.
pub fn hash_domain(domain: &'static str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute BLAKE3 hash of length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
