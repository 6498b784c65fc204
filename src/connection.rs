//! Per-connection state machine and socket task.
//!
//! ```text
//!   CONNECTING ──handshake──▶ OPEN ──close/timeout/lag/send error──▶ CLOSED
//!
//!   inbound frame ──decode──▶ SYNC      ──▶ SharedDoc::handle_sync
//!                        └──▶ AWARENESS ──▶ SharedDoc::apply_awareness
//! ```
//!
//! One task per socket. Decode and apply errors are logged and surfaced on
//! the document event channel; they never close the connection. What does
//! close it: the peer's close frame, a transport error, a failed send, a
//! heartbeat timeout, falling behind the broadcast stream, or server
//! shutdown. `CLOSED` is terminal; a peer that wants back in reconnects
//! and re-runs the handshake.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::doc::SharedDoc;
use crate::protocol::{Message, ProtocolError};
use crate::storage::StoreError;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique connection id.
pub fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Connecting => write!(f, "connecting"),
            ConnState::Open => write!(f, "open"),
            ConnState::Closed => write!(f, "closed"),
        }
    }
}

/// Per-connection options supplied by the embedding layer, not the wire.
#[derive(Debug, Clone, Copy)]
pub struct ConnOptions {
    /// Drop STEP2/UPDATE payloads from this connection without applying.
    pub read_only: bool,
    /// Replica garbage collection for documents this connection creates.
    pub gc_enabled: bool,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            gc_enabled: true,
        }
    }
}

/// Errors that terminate a connection or server task.
#[derive(Debug)]
pub enum SyncError {
    WebSocket(tokio_tungstenite::tungstenite::Error),
    Storage(StoreError),
    Io(std::io::Error),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::WebSocket(e) => write!(f, "websocket error: {e}"),
            SyncError::Storage(e) => write!(f, "storage error: {e}"),
            SyncError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::WebSocket(e)
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Storage(e)
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Io(e)
    }
}

/// Traffic counters shared across connection tasks.
#[derive(Debug, Default)]
pub struct ConnCounters {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
}

/// Decode one inbound frame and apply it to the document. Returns the
/// direct reply for the origin connection, if the message calls for one.
async fn dispatch(
    doc: &SharedDoc,
    conn_id: u64,
    read_only: bool,
    frame: &[u8],
) -> Result<Option<Message>, ProtocolError> {
    match Message::decode(frame)? {
        Message::Sync(sync) => doc.handle_sync(sync, read_only).await,
        Message::Awareness(delta) => {
            doc.apply_awareness(&delta, conn_id).await?;
            Ok(None)
        }
    }
}

/// Drive one WebSocket connection against its document until it closes.
///
/// Registers with the document, sends the handshake (STEP1 plus awareness
/// snapshot), then multiplexes inbound frames, broadcast fan-out, and the
/// heartbeat. Always unregisters on the way out, whatever the exit path.
pub async fn serve_connection(
    ws: WebSocketStream<TcpStream>,
    doc: Arc<SharedDoc>,
    options: ConnOptions,
    heartbeat_interval: Duration,
    counters: Arc<ConnCounters>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SyncError> {
    let conn_id = next_conn_id();
    counters.total_connections.fetch_add(1, Ordering::Relaxed);
    counters.active_connections.fetch_add(1, Ordering::Relaxed);

    let mut state = ConnState::Connecting;
    log::debug!("connection {conn_id} {state} on '{}'", doc.name());

    let (mut sink, mut stream) = ws.split();
    let mut frames = doc.register_connection(conn_id).await;

    let result: Result<(), SyncError> = async {
        // Handshake: the server speaks first.
        let step1 = Message::sync_step1(doc.state_vector().await);
        sink.send(WsMessage::Binary(step1.encode().into())).await?;
        if let Some(snapshot) = doc.awareness_snapshot().await {
            let frame = Message::awareness(snapshot).encode();
            sink.send(WsMessage::Binary(frame.into())).await?;
        }

        state = ConnState::Open;
        log::info!(
            "connection {conn_id} {state} on '{}'{}",
            doc.name(),
            if options.read_only { " (read-only)" } else { "" }
        );

        let mut ping = tokio::time::interval(heartbeat_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_seen = true;

        loop {
            tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(WsMessage::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        counters.messages_received.fetch_add(1, Ordering::Relaxed);
                        counters.bytes_received.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                        match dispatch(&doc, conn_id, options.read_only, &bytes).await {
                            Ok(Some(reply)) => {
                                sink.send(WsMessage::Binary(reply.encode().into())).await?;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                log::warn!("connection {conn_id}: bad frame: {e}");
                                doc.notify_error(e.to_string());
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        sink.send(WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        pong_seen = true;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        log::debug!("connection {conn_id}: peer closed");
                        break;
                    }
                    // Text and raw frames are not part of the protocol.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("connection {conn_id}: transport error: {e}");
                        break;
                    }
                },
                frame = frames.recv() => match frame {
                    Ok(data) => {
                        sink.send(WsMessage::Binary(data.to_vec().into())).await?;
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("connection {conn_id}: {n} frames behind, closing");
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ping.tick() => {
                    if !pong_seen {
                        log::info!("connection {conn_id}: heartbeat timeout");
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                    pong_seen = false;
                    sink.send(WsMessage::Ping(Vec::new().into())).await?;
                }
                _ = shutdown.changed() => {
                    log::debug!("connection {conn_id}: server shutting down");
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
        Ok(())
    }
    .await;

    state = ConnState::Closed;
    doc.unregister_connection(conn_id).await;
    counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    log::info!("connection {conn_id} {state} on '{}'", doc.name());

    if let Err(ref e) = result {
        log::debug!("connection {conn_id}: send failed: {e}");
    }
    result
}
