//! Node orchestration: the gossip driver, commit dispatcher and transaction
//! intake around one [`Core`].
//!
//! The node is a small state machine: `Babbling` (normal gossip),
//! `CatchingUp` (a peer signalled `sync_limit`; a frame must be adopted) and
//! `Shutdown` (terminal). The gossip driver owns the heartbeat; incoming
//! RPC requests are dispatched on their own tasks; the commit dispatcher
//! and transaction intake run as separate cooperative tasks. All poset
//! access serializes on the core's lock.

pub mod core;
pub mod peer_selector;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

pub use self::core::{Core, CoreError};
pub use peer_selector::{PeerSelector, SmartPeerSelector};

use crate::crypto::Keypair;
use crate::network::transport::{self, IncomingRequest, TransportError};
use crate::network::{Request, Response};
use crate::peers::PeerSet;
use crate::poset::{Block, BlockSignature, Poset, Store, StoreError};
use crate::proxy::{AppBridge, AppRequest};

/// Errors from node operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("our key is not in the participant set")]
    NotAParticipant,
    #[error("application disconnected")]
    AppGone,
    #[error("no peer could serve the request")]
    NoResponsivePeer,
    #[error("peer answered with an error: {0}")]
    PeerError(String),
}

/// Node lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Normal operation: gossip, insert, commit.
    Babbling,
    /// A sync exceeded the limit; a frame must be fast-forwarded.
    CatchingUp,
    /// Terminal.
    Shutdown,
}

/// Integrity errors stop the node; everything else is retried or skipped.
fn is_fatal(err: &NodeError) -> bool {
    matches!(
        err,
        NodeError::Store(StoreError::Corruption(_))
            | NodeError::Core(CoreError::Store(StoreError::Corruption(_)))
    )
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: NodeState) -> Self {
        StateCell(AtomicU8::new(state as u8))
    }

    fn get(&self) -> NodeState {
        match self.0.load(Ordering::Acquire) {
            0 => NodeState::Babbling,
            1 => NodeState::CatchingUp,
            _ => NodeState::Shutdown,
        }
    }

    fn set(&self, state: NodeState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn swap(&self, state: NodeState) -> NodeState {
        match self.0.swap(state as u8, Ordering::AcqRel) {
            0 => NodeState::Babbling,
            1 => NodeState::CatchingUp,
            _ => NodeState::Shutdown,
        }
    }
}

/// Node configuration.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Gossip heartbeat period.
    pub heartbeat: Duration,
    /// Per-RPC timeout.
    pub tcp_timeout: Duration,
    /// Event cache capacity for the store.
    pub cache_size: usize,
    /// Maximum events per Sync response before `sync_limit` is signalled.
    pub sync_limit: i64,
    /// Commit channel capacity.
    pub commit_capacity: usize,
    /// Submit channel capacity.
    pub submit_capacity: usize,
    /// Shutdown drain window for the commit dispatcher.
    pub drain_timeout: Duration,
    /// Pause after a failed catch-up attempt.
    pub catchup_backoff: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        use crate::constants::*;
        NodeConfig {
            heartbeat: Duration::from_millis(HEARTBEAT_MS),
            tcp_timeout: Duration::from_millis(TCP_TIMEOUT_MS),
            cache_size: CACHE_SIZE,
            sync_limit: SYNC_LIMIT,
            commit_capacity: COMMIT_CHANNEL_CAPACITY,
            submit_capacity: SUBMIT_CHANNEL_CAPACITY,
            drain_timeout: Duration::from_millis(DRAIN_TIMEOUT_MS),
            catchup_backoff: Duration::from_millis(200),
        }
    }
}

/// Point-in-time node statistics.
#[derive(Clone, Debug)]
pub struct Stats {
    pub state: NodeState,
    pub last_block_index: i64,
    pub last_consensus_round: Option<u64>,
    pub consensus_events: u64,
    pub consensus_transactions: u64,
    pub pending_events: usize,
    pub num_peers: usize,
    pub sync_rounds: u64,
}

/// Loop-owned resources, taken once by `run`.
struct NodeTasks {
    requests_rx: mpsc::Receiver<IncomingRequest>,
    commit_rx: mpsc::Receiver<Block>,
    submissions: mpsc::Receiver<Vec<u8>>,
    selector: SmartPeerSelector,
}

/// A consensus node.
pub struct Node {
    pub id: u64,
    config: NodeConfig,
    core: Arc<RwLock<Core>>,
    participants: Arc<PeerSet>,
    state: StateCell,
    shutdown: CancellationToken,
    local_addr: SocketAddr,
    app_requests: mpsc::Sender<AppRequest>,
    tasks: std::sync::Mutex<Option<NodeTasks>>,
    sync_rounds: AtomicU64,
}

impl Node {
    /// Wire up a node over an already-bound listener and app bridge. Must be
    /// called from within a tokio runtime; the transport listener task
    /// starts immediately.
    pub fn new(
        config: NodeConfig,
        keypair: Keypair,
        participants: Arc<PeerSet>,
        store: Box<dyn Store>,
        listener: TcpListener,
        bridge: AppBridge,
    ) -> Result<Node, NodeError> {
        let id = keypair.public.participant_id();
        if participants.by_id(id).is_none() {
            return Err(NodeError::NotAParticipant);
        }
        let local_addr = listener.local_addr()?;

        let (commit_tx, commit_rx) = mpsc::channel(config.commit_capacity);
        let poset = Poset::new(participants.clone(), store, commit_tx);
        let core = Core::new(keypair, participants.clone(), poset);

        let (requests_tx, requests_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        tokio::spawn(transport::serve(listener, requests_tx, shutdown.clone()));

        let selector = SmartPeerSelector::new(participants.others(id));
        Ok(Node {
            id,
            config,
            core: Arc::new(RwLock::new(core)),
            participants,
            state: StateCell::new(NodeState::Babbling),
            shutdown,
            local_addr,
            app_requests: bridge.requests,
            tasks: std::sync::Mutex::new(Some(NodeTasks {
                requests_rx,
                commit_rx,
                submissions: bridge.submissions,
                selector,
            })),
            sync_rounds: AtomicU64::new(0),
        })
    }

    /// Bootstrap the poset if the store carries history, then adopt or
    /// create our head event.
    pub async fn init(&self) -> Result<(), NodeError> {
        let mut core = self.core.write().await;
        if core.poset.store().need_bootstrap() {
            core.poset.bootstrap().map_err(CoreError::from)?;
        }
        core.init()?;
        Ok(())
    }

    pub fn state(&self) -> NodeState {
        self.state.get()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared access to the core, for stats readers and tests. Readers see a
    /// consistent but possibly stale snapshot.
    pub fn core(&self) -> &Arc<RwLock<Core>> {
        &self.core
    }

    pub async fn get_block(&self, index: u64) -> Result<Block, NodeError> {
        Ok(self.core.read().await.get_block(index)?)
    }

    pub async fn stats(&self) -> Stats {
        let core = self.core.read().await;
        Stats {
            state: self.state.get(),
            last_block_index: core.last_block_index(),
            last_consensus_round: core.poset.last_consensus_round,
            consensus_events: core.poset.store().consensus_events_count(),
            consensus_transactions: core.poset.consensus_transactions(),
            pending_events: core.poset.pending_events(),
            num_peers: self.participants.len(),
            sync_rounds: self.sync_rounds.load(Ordering::Relaxed),
        }
    }

    /// Spawn `run` in the background.
    pub fn run_async(self: Arc<Self>, gossip: bool) {
        tokio::spawn(self.run(gossip));
    }

    /// Main event loop. `gossip = false` serves requests but initiates
    /// nothing (used by tests that drive syncs manually).
    ///
    /// Incoming RPC requests are dispatched on their own tasks so two nodes
    /// mid-exchange never wait on each other's gossip tick; all poset access
    /// still serializes on the core lock.
    pub async fn run(self: Arc<Self>, gossip: bool) {
        let Some(tasks) = self.tasks.lock().ok().and_then(|mut t| t.take()) else {
            return;
        };
        let NodeTasks {
            mut requests_rx,
            commit_rx,
            submissions,
            mut selector,
        } = tasks;

        let commit_node = self.clone();
        tokio::spawn(async move { commit_node.commit_loop(commit_rx).await });

        let intake_node = self.clone();
        tokio::spawn(async move { intake_node.intake_loop(submissions).await });

        let request_node = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = request_node.shutdown.cancelled() => break,
                    incoming = requests_rx.recv() => match incoming {
                        Some(incoming) => {
                            let node = request_node.clone();
                            tokio::spawn(async move { node.handle_request(incoming).await });
                        }
                        None => break,
                    },
                }
            }
        });

        let mut interval = tokio::time::interval(self.config.heartbeat);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick(), if gossip => {
                    match self.state.get() {
                        NodeState::Babbling => self.gossip_tick(&mut selector).await,
                        NodeState::CatchingUp => {
                            match self.fast_forward().await {
                                Ok(()) => {
                                    tracing::info!(id = self.id, "caught up, back to babbling");
                                    self.state.set(NodeState::Babbling);
                                }
                                Err(err) => {
                                    tracing::debug!(id = self.id, error = %err, "catch-up attempt failed");
                                    tokio::time::sleep(self.config.catchup_backoff).await;
                                }
                            }
                        }
                        NodeState::Shutdown => break,
                    }
                }
            }
        }
        self.state.set(NodeState::Shutdown);
    }

    // ── Gossip ──

    /// One pull/push gossip exchange with the selected peer. Network errors
    /// are logged and skipped; the next tick picks another peer.
    async fn gossip_tick(&self, selector: &mut SmartPeerSelector) {
        let (representation, known) = {
            let core = self.core.read().await;
            (core.head_flag_representation(), core.known_events())
        };
        let Some(peer) = selector.next(&representation) else {
            return;
        };
        // Recorded up front so a dead peer does not pin the selector.
        selector.record_sync(peer.id);

        let request = Request::Sync {
            from_id: self.id,
            known,
        };
        let response = match transport::call(&peer.net_addr, &request, self.config.tcp_timeout).await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(peer = peer.id, error = %err, "sync failed");
                return;
            }
        };

        match response {
            Response::Sync {
                sync_limit: true, ..
            } => {
                tracing::info!(id = self.id, peer = peer.id, "sync limit hit, catching up");
                self.state.set(NodeState::CatchingUp);
            }
            Response::Sync {
                events,
                known: their_known,
                ..
            } => {
                if let Err(err) = self.absorb_sync(peer.id, &events).await {
                    if is_fatal(&err) {
                        tracing::error!(error = %err, "integrity failure, stopping node");
                        self.shutdown().await;
                        return;
                    }
                    tracing::warn!(peer = peer.id, error = %err, "could not absorb sync");
                    return;
                }
                self.push_diff(&peer.net_addr, &their_known).await;
                self.sync_rounds.fetch_add(1, Ordering::Relaxed);
            }
            Response::Error { message, .. } => {
                tracing::debug!(peer = peer.id, message, "peer rejected sync");
            }
            other => {
                tracing::debug!(peer = peer.id, ?other, "unexpected sync response");
            }
        }
    }

    /// Insert a batch of pulled events and weave a new self event on top,
    /// with the peer's latest event as other-parent.
    pub async fn absorb_sync(
        &self,
        peer_id: u64,
        events: &[crate::poset::WireEvent],
    ) -> Result<(), NodeError> {
        let mut core = self.core.write().await;
        core.sync(events)?;
        match core.poset.store().last_event_from(peer_id) {
            Ok((other_parent, _)) => core.add_self_event(Some(other_parent))?,
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Eager-push everything the peer is missing.
    async fn push_diff(&self, peer_addr: &str, their_known: &HashMap<u64, i64>) {
        let wire = {
            let core = self.core.read().await;
            match core
                .event_diff(their_known)
                .and_then(|diff| core.to_wire(&diff))
            {
                Ok(wire) => wire,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to build push diff");
                    return;
                }
            }
        };
        if wire.is_empty() {
            return;
        }
        let request = Request::EagerSync {
            from_id: self.id,
            events: wire,
        };
        match transport::call(peer_addr, &request, self.config.tcp_timeout).await {
            Ok(Response::EagerSync { success: true, .. }) => {}
            Ok(other) => tracing::debug!(?other, "eager sync not accepted"),
            Err(err) => tracing::debug!(error = %err, "eager sync failed"),
        }
    }

    // ── RPC handling ──

    async fn handle_request(&self, incoming: IncomingRequest) {
        let response = match incoming.request {
            Request::Sync { from_id, known } => self.respond_sync(from_id, &known).await,
            Request::EagerSync { from_id, events } => {
                let success = {
                    let mut core = self.core.write().await;
                    match core.sync(&events) {
                        Ok(()) => true,
                        Err(err) => {
                            tracing::warn!(peer = from_id, error = %err, "eager sync rejected");
                            false
                        }
                    }
                };
                Response::EagerSync {
                    from_id: self.id,
                    success,
                }
            }
            Request::FastForward { from_id } => self.respond_fast_forward(from_id).await,
            Request::BlockSignatures { from_index, .. } => {
                self.respond_block_signatures(from_index).await
            }
        };
        let _ = incoming.reply.send(response);
    }

    async fn respond_sync(&self, from_id: u64, known: &HashMap<u64, i64>) -> Response {
        let core = self.core.read().await;
        let diff = match core.event_diff(known) {
            Ok(diff) => diff,
            Err(err) => {
                return Response::Error {
                    from_id: self.id,
                    message: err.to_string(),
                }
            }
        };
        if diff.len() as i64 > self.config.sync_limit {
            tracing::debug!(peer = from_id, diff = diff.len(), "diff exceeds sync limit");
            return Response::Sync {
                from_id: self.id,
                sync_limit: true,
                events: vec![],
                known: core.known_events(),
            };
        }
        match core.to_wire(&diff) {
            Ok(events) => Response::Sync {
                from_id: self.id,
                sync_limit: false,
                events,
                known: core.known_events(),
            },
            Err(err) => Response::Error {
                from_id: self.id,
                message: err.to_string(),
            },
        }
    }

    async fn respond_fast_forward(&self, from_id: u64) -> Response {
        let core = self.core.read().await;
        let last_block = core.last_block_index();
        if last_block < 0 {
            return Response::Error {
                from_id: self.id,
                message: "no decided blocks yet".into(),
            };
        }
        // Serve the newest block the commit dispatcher has finished: a block
        // without its state hash is not yet signed and cannot anchor a peer.
        let result = (|| {
            let mut index = last_block as u64;
            loop {
                let block = core.get_block(index)?;
                if !block.body.state_hash.is_empty() {
                    let frame = core.poset.store().get_frame(block.body.round_received)?;
                    return Ok((block, frame));
                }
                if index == 0 {
                    return Err(CoreError::Store(StoreError::NotFound(
                        "no committed blocks yet".into(),
                    )));
                }
                index -= 1;
            }
        })();
        match result {
            Ok((block, frame)) => {
                tracing::debug!(peer = from_id, block = block.index(), "serving fast-forward");
                Response::FastForward {
                    from_id: self.id,
                    block: Box::new(block),
                    frame: Box::new(frame),
                }
            }
            Err(err) => Response::Error {
                from_id: self.id,
                message: err.to_string(),
            },
        }
    }

    async fn respond_block_signatures(&self, from_index: u64) -> Response {
        let core = self.core.read().await;
        let mut signatures = Vec::new();
        let last = core.last_block_index();
        if last >= 0 {
            for index in from_index..=(last as u64) {
                if let Ok(block) = core.get_block(index) {
                    for (validator, signature) in &block.signatures {
                        signatures.push(BlockSignature {
                            validator: validator.clone(),
                            index,
                            signature: *signature,
                        });
                    }
                }
            }
        }
        Response::BlockSignatures {
            from_id: self.id,
            signatures,
        }
    }

    // ── Catch-up ──

    /// Pull the latest frame and block from the first responsive peer,
    /// adopt them, and restore the application from the block's state hash.
    pub async fn fast_forward(&self) -> Result<(), NodeError> {
        let mut last_err = NodeError::NoResponsivePeer;
        for peer in self.participants.others(self.id) {
            match self.fast_forward_from(&peer.net_addr).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::debug!(peer = peer.id, error = %err, "fast-forward source failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    async fn fast_forward_from(&self, peer_addr: &str) -> Result<(), NodeError> {
        let request = Request::FastForward { from_id: self.id };
        let response = transport::call(peer_addr, &request, self.config.tcp_timeout).await?;
        let (block, frame) = match response {
            Response::FastForward { block, frame, .. } => (*block, *frame),
            Response::Error { message, .. } => return Err(NodeError::PeerError(message)),
            other => {
                return Err(NodeError::PeerError(format!(
                    "unexpected fast-forward response: {other:?}"
                )))
            }
        };

        {
            let mut core = self.core.write().await;
            core.fast_forward(&block, &frame)?;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.app_requests
            .send(AppRequest::Restore {
                snapshot: block.body.state_hash.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| NodeError::AppGone)?;
        reply_rx.await.map_err(|_| NodeError::AppGone)?;

        tracing::info!(
            id = self.id,
            block = block.index(),
            round = frame.round,
            "fast-forwarded"
        );
        Ok(())
    }

    // ── Commit dispatcher ──

    async fn commit_loop(self: Arc<Self>, mut commit_rx: mpsc::Receiver<Block>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    // Bounded drain: deliver blocks already buffered in the
                    // channel, then stop. Waiting for new ones would keep the
                    // node alive past the drain window.
                    let drain = async {
                        while let Ok(block) = commit_rx.try_recv() {
                            if self.commit(block).await.is_err() {
                                break;
                            }
                        }
                    };
                    let _ = tokio::time::timeout(self.config.drain_timeout, drain).await;
                    break;
                }
                block = commit_rx.recv() => match block {
                    Some(block) => {
                        if let Err(err) = self.commit(block).await {
                            tracing::error!(error = %err, "commit failed");
                            if matches!(err, NodeError::Store(StoreError::Corruption(_))) {
                                self.shutdown().await;
                                break;
                            }
                        }
                    }
                    None => break,
                },
            }
        }
    }

    /// Deliver one block to the application, backfill the state hash, sign
    /// the finished body and pool the signature for the next self event.
    async fn commit(&self, block: Block) -> Result<(), NodeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.app_requests
            .send(AppRequest::CommitBlock {
                block: Box::new(block.clone()),
                reply: reply_tx,
            })
            .await
            .map_err(|_| NodeError::AppGone)?;
        let state_hash = reply_rx.await.map_err(|_| NodeError::AppGone)?;

        let core = self.core.write().await;
        let mut block = block;
        block.body.state_hash = state_hash;
        let signature = block
            .sign(core.keypair())
            .map_err(CoreError::from)?;
        block
            .signatures
            .insert(signature.validator.clone(), signature.signature);
        core.poset.store().set_block(&block)?;
        core.add_block_signature(signature)?;
        tracing::debug!(id = self.id, block = block.index(), "block committed");
        Ok(())
    }

    // ── Transaction intake ──

    async fn intake_loop(self: Arc<Self>, mut submissions: mpsc::Receiver<Vec<u8>>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                payload = submissions.recv() => match payload {
                    Some(payload) => {
                        let core = self.core.read().await;
                        if let Err(err) = core.add_transaction(payload) {
                            tracing::warn!(error = %err, "dropping submitted transaction");
                        }
                    }
                    None => break,
                },
            }
        }
    }

    // ── Shutdown ──

    /// Signal all loops, flush the store. Idempotent.
    pub async fn shutdown(&self) {
        if self.state.swap(NodeState::Shutdown) == NodeState::Shutdown {
            return;
        }
        tracing::info!(id = self.id, "shutting down");
        self.shutdown.cancel();
        let core = self.core.read().await;
        if let Err(err) = core.poset.store().close() {
            tracing::warn!(error = %err, "store close failed");
        }
    }
}
