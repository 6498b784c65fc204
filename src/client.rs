//! Programmatic sync peer.
//!
//! Maintains a local replica and awareness table, drives the client half
//! of the handshake, publishes local edits and presence. Powers the
//! integration tests and anything embedding a headless peer.
//!
//! There is no offline queue: the replica itself is the queue. Edits made
//! while disconnected are merged locally and the next handshake's STEP2
//! carries everything the server lacks.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::awareness::{AwarenessDelta, AwarenessTable};
use crate::connection::SyncError;
use crate::protocol::{Message, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted toward the embedding application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// The server's STEP2 answer was merged; local replica is caught up.
    Synced,
    /// A remote incremental op was merged into the local replica.
    RemoteUpdate(Vec<u8>),
    /// A presence delta was applied to the local awareness table.
    AwarenessChanged(AwarenessDelta),
}

struct LocalState {
    doc: Doc,
    awareness: AwarenessTable,
}

/// A headless peer: one replica, one awareness table, one connection.
pub struct SyncClient {
    url: String,
    actor_id: u64,
    shared: Arc<Mutex<LocalState>>,
    state: Arc<RwLock<ClientState>>,
    outgoing: Option<mpsc::Sender<WsMessage>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl SyncClient {
    /// Create a disconnected client for the given endpoint, e.g.
    /// `ws://127.0.0.1:8765/my-doc`.
    pub fn new(url: impl Into<String>) -> Self {
        let doc = Doc::new();
        let actor_id = doc.client_id();
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            url: url.into(),
            actor_id,
            shared: Arc::new(Mutex::new(LocalState {
                doc,
                awareness: AwarenessTable::new(),
            })),
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            outgoing: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver. Can only be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// The actor id this client publishes awareness under (its replica's
    /// client id).
    pub fn actor_id(&self) -> u64 {
        self.actor_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn connection_state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Connect and spawn the writer and reader tasks. The server speaks
    /// first; the reader answers its STEP1 with STEP2 plus our own STEP1.
    pub async fn connect(&mut self) -> Result<(), SyncError> {
        *self.state.write().await = ClientState::Connecting;

        let (ws, _) = match tokio_tungstenite::connect_async(&self.url).await {
            Ok(ok) => ok,
            Err(e) => {
                *self.state.write().await = ClientState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(256);
        self.outgoing = Some(out_tx.clone());

        // Writer: forward the outgoing channel into the socket.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Reader: dispatch server frames until the stream ends.
        let shared = self.shared.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(WsMessage::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        if let Err(e) =
                            handle_server_frame(&shared, &out_tx, &event_tx, &bytes).await
                        {
                            log::warn!("client: bad server frame: {e}");
                        }
                    }
                    Ok(WsMessage::Ping(data)) => {
                        if out_tx.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *state.write().await = ClientState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        *self.state.write().await = ClientState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;
        log::debug!("client {} connected to {}", self.actor_id, self.url);
        Ok(())
    }

    /// Close the connection. Local state stays; a later `connect` resyncs.
    pub async fn close(&mut self) {
        if let Some(tx) = self.outgoing.take() {
            let _ = tx.send(WsMessage::Close(None)).await;
        }
        *self.state.write().await = ClientState::Disconnected;
    }

    /// Apply a local edit and publish the resulting incremental op. While
    /// disconnected the edit still merges locally; the next handshake
    /// carries it.
    pub async fn edit<F>(&self, edit: F)
    where
        F: FnOnce(&mut TransactionMut),
    {
        let update = {
            let guard = self.shared.lock().await;
            let before = {
                let txn = guard.doc.transact();
                txn.state_vector()
            };
            {
                let mut txn = guard.doc.transact_mut();
                edit(&mut txn);
            }
            let txn = guard.doc.transact();
            if txn.state_vector() == before {
                return;
            }
            txn.encode_diff_v1(&before)
        };
        self.send_frame(Message::update(update)).await;
    }

    /// Publish this client's awareness state; `None` clears it. Bumps the
    /// actor's clock either way.
    pub async fn set_awareness(&self, state: Option<&str>) {
        let blob = {
            let mut guard = self.shared.lock().await;
            let delta = guard.awareness.set_state(self.actor_id, state);
            guard.awareness.encode_actors(&delta.changed())
        };
        self.send_frame(Message::awareness(blob)).await;
    }

    /// Another actor's awareness state as seen by this client.
    pub async fn awareness_state(&self, actor: u64) -> Option<String> {
        let guard = self.shared.lock().await;
        guard.awareness.state(actor).map(str::to_owned)
    }

    /// Full local replica state, encoded as one update.
    pub async fn encode_state(&self) -> Vec<u8> {
        let guard = self.shared.lock().await;
        let txn = guard.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Contents of the named text root, for assertions and demos.
    pub async fn text_contents(&self, name: &str) -> String {
        let guard = self.shared.lock().await;
        let txn = guard.doc.transact();
        match txn.get_text(name) {
            Some(t) => t.get_string(&txn),
            None => String::new(),
        }
    }

    async fn send_frame(&self, msg: Message) {
        let Some(ref tx) = self.outgoing else { return };
        if tx.send(WsMessage::Binary(msg.encode().into())).await.is_err() {
            log::debug!("client {}: outgoing channel closed", self.actor_id);
        }
    }
}

/// Apply one server frame to the local state, replying through `out`.
async fn handle_server_frame(
    shared: &Mutex<LocalState>,
    out: &mpsc::Sender<WsMessage>,
    events: &mpsc::Sender<ClientEvent>,
    frame: &[u8],
) -> Result<(), ProtocolError> {
    match Message::decode(frame)? {
        Message::Sync(SyncMessage::Step1(sv)) => {
            let (step2, own_sv) = {
                let guard = shared.lock().await;
                let remote = StateVector::decode_v1(&sv)
                    .map_err(|e| ProtocolError::BadStateVector(e.to_string()))?;
                let txn = guard.doc.transact();
                (txn.encode_diff_v1(&remote), txn.state_vector().encode_v1())
            };
            let _ = out
                .send(WsMessage::Binary(Message::sync_step2(step2).encode().into()))
                .await;
            let _ = out
                .send(WsMessage::Binary(Message::sync_step1(own_sv).encode().into()))
                .await;
        }
        Message::Sync(SyncMessage::Step2(update)) => {
            apply_to_local(shared, &update).await?;
            let _ = events.send(ClientEvent::Synced).await;
        }
        Message::Sync(SyncMessage::Update(update)) => {
            apply_to_local(shared, &update).await?;
            let _ = events.send(ClientEvent::RemoteUpdate(update)).await;
        }
        Message::Awareness(delta) => {
            let applied = {
                let mut guard = shared.lock().await;
                guard.awareness.apply_update(&delta)?
            };
            if !applied.is_empty() {
                let _ = events.send(ClientEvent::AwarenessChanged(applied)).await;
            }
        }
    }
    Ok(())
}

async fn apply_to_local(shared: &Mutex<LocalState>, update: &[u8]) -> Result<(), ProtocolError> {
    let guard = shared.lock().await;
    let decoded =
        Update::decode_v1(update).map_err(|e| ProtocolError::BadUpdate(e.to_string()))?;
    let mut txn = guard.doc.transact_mut();
    txn.apply_update(decoded)
        .map_err(|e| ProtocolError::BadUpdate(e.to_string()))?;
    Ok(())
}
