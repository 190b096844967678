//! TCP RPC transport: a listener task that forwards decoded requests into
//! the node loop, and a one-shot client with a per-call timeout.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::network::{decode_payload, encode, NetworkError, Request, Response};

/// How long the listener waits for the node loop to answer a request.
const HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {0} failed: {1}")]
    Connect(String, String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("call timed out")]
    Timeout,
    #[error("malformed frame")]
    Decode,
    #[error(transparent)]
    Codec(#[from] NetworkError),
    #[error("transport is shut down")]
    Shutdown,
}

/// A decoded request paired with its reply slot.
pub struct IncomingRequest {
    pub peer_addr: SocketAddr,
    pub request: Request,
    pub reply: oneshot::Sender<Response>,
}

/// Read one length-prefixed frame.
async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(TransportError::Decode);
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Serve RPC requests until shutdown. Each connection carries exactly one
/// request/response pair.
pub async fn serve(
    listener: TcpListener,
    requests: mpsc::Sender<IncomingRequest>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::debug!(error = %err, "accept failed");
                    continue;
                }
            },
        };

        let requests = requests.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer_addr, requests, shutdown).await {
                tracing::debug!(peer = %peer_addr, error = %err, "connection failed");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    requests: mpsc::Sender<IncomingRequest>,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let payload = read_frame(&mut stream).await?;
    let request: Request = decode_payload(&payload).ok_or(TransportError::Decode)?;

    let (reply_tx, reply_rx) = oneshot::channel();
    requests
        .send(IncomingRequest {
            peer_addr,
            request,
            reply: reply_tx,
        })
        .await
        .map_err(|_| TransportError::Shutdown)?;

    let response = tokio::select! {
        _ = shutdown.cancelled() => return Err(TransportError::Shutdown),
        reply = tokio::time::timeout(HANDLER_TIMEOUT, reply_rx) => match reply {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(TransportError::Shutdown),
            Err(_) => return Err(TransportError::Timeout),
        },
    };

    let frame = encode(&response)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Issue one RPC with a per-call timeout covering connect, send and receive.
pub async fn call(
    addr: &str,
    request: &Request,
    timeout: Duration,
) -> Result<Response, TransportError> {
    let frame = encode(request)?;
    let fut = async move {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect(addr.to_string(), e.to_string()))?;
        stream.write_all(&frame).await?;
        stream.flush().await?;
        let payload = read_frame(&mut stream).await?;
        decode_payload::<Response>(&payload).ok_or(TransportError::Decode)
    };
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| TransportError::Timeout)?
}
