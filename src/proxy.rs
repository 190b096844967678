//! The application proxy bridge.
//!
//! The engine and the application talk over two bounded channels: downstream
//! requests (block commits, snapshot queries, state restores) each carry a
//! oneshot reply slot; upstream the application submits opaque transaction
//! payloads. [`InmemApp`] is the in-process reference application used by
//! the binary's standalone mode and by every end-to-end test: it chains a
//! state hash over committed transactions so two instances fed the same
//! blocks agree on every state hash.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::poset::Block;
use crate::Hash;

/// Errors from the bridge.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("application is gone")]
    Disconnected,
    #[error("submit buffer is full")]
    SubmitOverflow,
}

/// Downstream requests from engine to application.
#[derive(Debug)]
pub enum AppRequest {
    /// Commit a block; the application answers with its state hash.
    CommitBlock {
        block: Box<Block>,
        reply: oneshot::Sender<Vec<u8>>,
    },
    /// Fetch the state snapshot taken at a block index.
    GetSnapshot {
        index: u64,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    /// Restore application state from a snapshot (fast-forward).
    Restore {
        snapshot: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    },
}

/// Engine-side endpoints of the bridge.
pub struct AppBridge {
    pub requests: mpsc::Sender<AppRequest>,
    pub submissions: mpsc::Receiver<Vec<u8>>,
}

/// Application-side endpoints of the bridge.
pub struct AppConnection {
    pub requests: mpsc::Receiver<AppRequest>,
    pub submissions: mpsc::Sender<Vec<u8>>,
}

/// Create a connected bridge pair with bounded buffers.
pub fn bridge(commit_capacity: usize, submit_capacity: usize) -> (AppBridge, AppConnection) {
    let (request_tx, request_rx) = mpsc::channel(commit_capacity);
    let (submit_tx, submit_rx) = mpsc::channel(submit_capacity);
    (
        AppBridge {
            requests: request_tx,
            submissions: submit_rx,
        },
        AppConnection {
            requests: request_rx,
            submissions: submit_tx,
        },
    )
}

/// Clonable handle for submitting transactions to the engine.
#[derive(Clone)]
pub struct SubmitHandle {
    tx: mpsc::Sender<Vec<u8>>,
}

impl SubmitHandle {
    /// Drop-with-error on overflow: gossip must not block on a slow app.
    pub fn submit(&self, payload: Vec<u8>) -> Result<(), ProxyError> {
        self.tx.try_send(payload).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ProxyError::SubmitOverflow,
            mpsc::error::TrySendError::Closed(_) => ProxyError::Disconnected,
        })
    }
}

#[derive(Default)]
struct InmemState {
    state_hash: Vec<u8>,
    committed: Vec<Block>,
    snapshots: Vec<(u64, Vec<u8>)>,
}

/// In-memory reference application.
///
/// The state hash evolves as `blake3(previous_state ‖ tx₀ ‖ tx₁ ‖ …)` per
/// committed block, so it is a pure function of the block sequence.
#[derive(Clone)]
pub struct InmemApp {
    submit: SubmitHandle,
    state: Arc<Mutex<InmemState>>,
}

impl InmemApp {
    /// Start the application task over a fresh bridge; returns the app
    /// handle and the engine-side bridge endpoints.
    pub fn start(commit_capacity: usize, submit_capacity: usize) -> (InmemApp, AppBridge) {
        let (engine_side, mut conn) = bridge(commit_capacity, submit_capacity);
        let state = Arc::new(Mutex::new(InmemState::default()));
        let app = InmemApp {
            submit: SubmitHandle {
                tx: conn.submissions.clone(),
            },
            state: state.clone(),
        };

        tokio::spawn(async move {
            while let Some(request) = conn.requests.recv().await {
                match request {
                    AppRequest::CommitBlock { block, reply } => {
                        let hash = Self::apply(&state, *block);
                        let _ = reply.send(hash);
                    }
                    AppRequest::GetSnapshot { index, reply } => {
                        let snapshot = state.lock().ok().and_then(|s| {
                            s.snapshots
                                .iter()
                                .find(|(i, _)| *i == index)
                                .map(|(_, snap)| snap.clone())
                        });
                        let _ = reply.send(snapshot);
                    }
                    AppRequest::Restore { snapshot, reply } => {
                        if let Ok(mut s) = state.lock() {
                            s.state_hash = snapshot.clone();
                            s.committed.clear();
                        }
                        let _ = reply.send(snapshot);
                    }
                }
            }
        });

        (app, engine_side)
    }

    fn apply(state: &Arc<Mutex<InmemState>>, block: Block) -> Vec<u8> {
        let Ok(mut s) = state.lock() else {
            return Vec::new();
        };
        let mut parts: Vec<&[u8]> = Vec::with_capacity(block.body.transactions.len() + 1);
        parts.push(&s.state_hash);
        for tx in &block.body.transactions {
            parts.push(tx);
        }
        let next: Hash = crate::hash_concat(&parts);
        s.state_hash = next.to_vec();
        let snapshot_hash = s.state_hash.clone();
        s.snapshots.push((block.index(), snapshot_hash));
        s.committed.push(block);
        s.state_hash.clone()
    }

    pub fn submit_handle(&self) -> SubmitHandle {
        self.submit.clone()
    }

    pub fn submit(&self, payload: Vec<u8>) -> Result<(), ProxyError> {
        self.submit.submit(payload)
    }

    pub fn committed_blocks(&self) -> Vec<Block> {
        self.state
            .lock()
            .map(|s| s.committed.clone())
            .unwrap_or_default()
    }

    pub fn state_hash(&self) -> Vec<u8> {
        self.state
            .lock()
            .map(|s| s.state_hash.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_with(index: u64, txs: Vec<Vec<u8>>) -> Block {
        Block::new(index, index + 1, [0u8; 32], txs)
    }

    #[tokio::test]
    async fn commit_returns_chained_state_hash() {
        let (app, bridge) = InmemApp::start(8, 8);

        let (tx1, rx1) = oneshot::channel();
        bridge
            .requests
            .send(AppRequest::CommitBlock {
                block: Box::new(block_with(0, vec![b"a".to_vec()])),
                reply: tx1,
            })
            .await
            .unwrap();
        let h1 = rx1.await.unwrap();
        assert!(!h1.is_empty());

        let (tx2, rx2) = oneshot::channel();
        bridge
            .requests
            .send(AppRequest::CommitBlock {
                block: Box::new(block_with(1, vec![b"b".to_vec()])),
                reply: tx2,
            })
            .await
            .unwrap();
        let h2 = rx2.await.unwrap();
        assert_ne!(h1, h2);
        assert_eq!(app.committed_blocks().len(), 2);
        assert_eq!(app.state_hash(), h2);
    }

    #[tokio::test]
    async fn identical_block_sequences_agree_on_state() {
        let (_app_a, bridge_a) = InmemApp::start(8, 8);
        let (_app_b, bridge_b) = InmemApp::start(8, 8);

        let mut last = (Vec::new(), Vec::new());
        for i in 0..3u64 {
            let block = block_with(i, vec![format!("tx{i}").into_bytes()]);
            let (tx_a, rx_a) = oneshot::channel();
            bridge_a
                .requests
                .send(AppRequest::CommitBlock {
                    block: Box::new(block.clone()),
                    reply: tx_a,
                })
                .await
                .unwrap();
            let (tx_b, rx_b) = oneshot::channel();
            bridge_b
                .requests
                .send(AppRequest::CommitBlock {
                    block: Box::new(block),
                    reply: tx_b,
                })
                .await
                .unwrap();
            last = (rx_a.await.unwrap(), rx_b.await.unwrap());
        }
        assert_eq!(last.0, last.1);
    }

    #[tokio::test]
    async fn snapshot_and_restore() {
        let (app, bridge) = InmemApp::start(8, 8);

        let (tx, rx) = oneshot::channel();
        bridge
            .requests
            .send(AppRequest::CommitBlock {
                block: Box::new(block_with(0, vec![b"x".to_vec()])),
                reply: tx,
            })
            .await
            .unwrap();
        let committed_hash = rx.await.unwrap();

        let (tx, rx) = oneshot::channel();
        bridge
            .requests
            .send(AppRequest::GetSnapshot { index: 0, reply: tx })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), Some(committed_hash.clone()));

        let (_other, other_bridge) = InmemApp::start(8, 8);
        let (tx, rx) = oneshot::channel();
        other_bridge
            .requests
            .send(AppRequest::Restore {
                snapshot: committed_hash.clone(),
                reply: tx,
            })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), committed_hash);
        drop(app);
    }

    #[tokio::test]
    async fn submit_overflow_is_an_error() {
        let (app, mut bridge) = InmemApp::start(8, 2);
        app.submit(b"one".to_vec()).unwrap();
        app.submit(b"two".to_vec()).unwrap();
        assert!(matches!(
            app.submit(b"three".to_vec()),
            Err(ProxyError::SubmitOverflow)
        ));

        assert_eq!(bridge.submissions.recv().await.unwrap(), b"one".to_vec());
    }
}
