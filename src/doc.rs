//! Shared document: one replica, one awareness table, one connection set.
//!
//! Composition over inheritance: the replica (`yrs::Doc`) is a field, and
//! only the operations the sync core needs are exposed. All mutable state
//! sits behind one per-document lock, the serialization boundary the
//! concurrency model requires — one writer at a time per document, nothing
//! shared across documents. Replica transactions are scoped inside the
//! lock and never held across an await.
//!
//! Observers are explicit: the broadcast channel fans encoded frames out
//! to connection tasks, and the event channel carries "replica changed,
//! here is the full state" to the persistence layer. Both are supplied at
//! construction; there are no implicit listeners.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, RwLock};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Options, ReadTxn, StateVector, Transact, Update};

use crate::awareness::AwarenessTable;
use crate::protocol::{Message, ProtocolError, SyncMessage};

/// Events a document emits toward its registered observer.
#[derive(Debug, Clone)]
pub enum DocEvent {
    /// The replica merged an operation; carries the full re-encoded state.
    Updated { name: String, state: Vec<u8> },
    /// An inbound payload was rejected. The connection survives; this is
    /// the document-level surface for monitoring.
    Error { name: String, detail: String },
}

struct DocState {
    doc: Doc,
    awareness: AwarenessTable,
    /// connection id → actor ids that connection currently controls
    conns: HashMap<u64, HashSet<u64>>,
    last_active: Instant,
}

/// One synchronized document and everything subscribed to it.
pub struct SharedDoc {
    name: String,
    state: RwLock<DocState>,
    broadcast: broadcast::Sender<Arc<Vec<u8>>>,
    events: mpsc::UnboundedSender<DocEvent>,
}

impl SharedDoc {
    /// Create an empty document.
    ///
    /// `gc_enabled` controls whether the replica may discard tombstoned
    /// history; it is fixed at creation. `broadcast_capacity` bounds the
    /// per-connection frame buffer.
    pub fn new(
        name: impl Into<String>,
        gc_enabled: bool,
        broadcast_capacity: usize,
        events: mpsc::UnboundedSender<DocEvent>,
    ) -> Self {
        let mut options = Options::default();
        options.skip_gc = !gc_enabled;
        let (broadcast, _) = broadcast::channel(broadcast_capacity);
        Self {
            name: name.into(),
            state: RwLock::new(DocState {
                doc: Doc::with_options(options),
                awareness: AwarenessTable::new(),
                conns: HashMap::new(),
                last_active: Instant::now(),
            }),
            broadcast,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Merge a previously persisted state into the replica. Used when the
    /// registry materializes a document from the cache; does not
    /// broadcast and does not re-notify the persistence layer.
    pub async fn load_state(&self, blob: &[u8]) -> Result<(), ProtocolError> {
        let state = self.state.write().await;
        let update =
            Update::decode_v1(blob).map_err(|e| ProtocolError::BadUpdate(e.to_string()))?;
        let mut txn = state.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ProtocolError::BadUpdate(e.to_string()))?;
        Ok(())
    }

    /// Add a connection with an empty controlled-actor set and subscribe
    /// it to the document's frames. The handshake is the caller's job.
    pub async fn register_connection(&self, conn_id: u64) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut state = self.state.write().await;
        state.conns.insert(conn_id, HashSet::new());
        state.last_active = Instant::now();
        self.broadcast.subscribe()
    }

    /// Remove a connection, drop the awareness entries it controlled, and
    /// broadcast the removal delta to the remaining connections.
    pub async fn unregister_connection(&self, conn_id: u64) {
        let removal = {
            let mut state = self.state.write().await;
            let actors: Vec<u64> = state
                .conns
                .remove(&conn_id)
                .unwrap_or_default()
                .into_iter()
                .collect();
            state.last_active = Instant::now();
            let delta = state.awareness.remove_actors(&actors);
            if delta.is_empty() {
                None
            } else {
                Some(state.awareness.encode_actors(&delta.removed))
            }
        };
        if let Some(blob) = removal {
            self.send_frame(Message::awareness(blob).encode());
        }
    }

    /// Merge one operation into the replica, broadcast it to every
    /// connection on the document (the origin included — the echo doubles
    /// as an implicit ack), and notify the persistence observer with the
    /// full re-encoded state.
    pub async fn apply_update(&self, payload: &[u8]) -> Result<(), ProtocolError> {
        let full_state = {
            let mut state = self.state.write().await;
            let update =
                Update::decode_v1(payload).map_err(|e| ProtocolError::BadUpdate(e.to_string()))?;
            let mut txn = state.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| ProtocolError::BadUpdate(e.to_string()))?;
            let full = txn.encode_state_as_update_v1(&StateVector::default());
            drop(txn);
            state.last_active = Instant::now();
            full
        };
        self.send_frame(Message::update(payload.to_vec()).encode());
        let _ = self.events.send(DocEvent::Updated {
            name: self.name.clone(),
            state: full_state,
        });
        Ok(())
    }

    /// Merge a presence delta, track which actor ids the origin
    /// connection controls, and rebroadcast the combined
    /// added ∪ updated ∪ removed delta to all connections.
    pub async fn apply_awareness(&self, payload: &[u8], origin: u64) -> Result<(), ProtocolError> {
        let blob = {
            let mut state = self.state.write().await;
            let delta = state.awareness.apply_update(payload)?;
            if let Some(controlled) = state.conns.get_mut(&origin) {
                for id in &delta.added {
                    controlled.insert(*id);
                }
                for id in &delta.removed {
                    controlled.remove(id);
                }
            }
            state.last_active = Instant::now();
            if delta.is_empty() {
                None
            } else {
                Some(state.awareness.encode_actors(&delta.changed()))
            }
        };
        if let Some(blob) = blob {
            self.send_frame(Message::awareness(blob).encode());
        }
        Ok(())
    }

    /// Dispatch one SYNC sub-message. Returns the direct reply for the
    /// origin connection, if any; `None` sends nothing.
    ///
    /// Read-only connections still get STEP1 answered so the peer can
    /// learn what the server has, but their STEP2/UPDATE payloads are
    /// dropped without application.
    pub async fn handle_sync(
        &self,
        msg: SyncMessage,
        read_only: bool,
    ) -> Result<Option<Message>, ProtocolError> {
        match msg {
            SyncMessage::Step1(sv) => {
                let diff = self.diff_for(&sv).await?;
                Ok(Some(Message::sync_step2(diff)))
            }
            SyncMessage::Step2(update) | SyncMessage::Update(update) => {
                if !read_only {
                    self.apply_update(&update).await?;
                }
                Ok(None)
            }
        }
    }

    /// The replica's current state vector, the first half of the
    /// handshake.
    pub async fn state_vector(&self) -> Vec<u8> {
        let state = self.state.read().await;
        let txn = state.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Operations the peer is missing given its state vector, the second
    /// half of the handshake.
    pub async fn diff_for(&self, peer_state_vector: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let sv = StateVector::decode_v1(peer_state_vector)
            .map_err(|e| ProtocolError::BadStateVector(e.to_string()))?;
        let state = self.state.read().await;
        let txn = state.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Full replica state, encoded as one update. The persistence blob.
    pub async fn encode_state(&self) -> Vec<u8> {
        let state = self.state.read().await;
        let txn = state.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Snapshot of all present actors for the connect handshake, `None`
    /// when the table is empty.
    pub async fn awareness_snapshot(&self) -> Option<Vec<u8>> {
        let state = self.state.read().await;
        if state.awareness.is_empty() {
            None
        } else {
            Some(state.awareness.encode_full())
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.conns.len()
    }

    /// Time since the last register, unregister, or applied payload.
    pub async fn idle_for(&self) -> Duration {
        self.state.read().await.last_active.elapsed()
    }

    /// Surface a rejected payload as a document-level error event.
    pub fn notify_error(&self, detail: String) {
        let _ = self.events.send(DocEvent::Error {
            name: self.name.clone(),
            detail,
        });
    }

    fn send_frame(&self, frame: Vec<u8>) {
        // No receivers is fine; broadcast is fire-and-forget.
        let _ = self.broadcast.send(Arc::new(frame));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;
    use yrs::{GetString, Text, WriteTxn};

    fn make_doc(name: &str) -> (Arc<SharedDoc>, UnboundedReceiver<DocEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(SharedDoc::new(name, true, 16, tx)), rx)
    }

    /// Full-state update bytes for a fresh doc containing `text`.
    fn text_update(text: &str) -> Vec<u8> {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let t = txn.get_or_insert_text("t");
            t.insert(&mut txn, 0, text);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn materialize(state: &[u8]) -> String {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
        }
        let txn = doc.transact();
        match txn.get_text("t") {
            Some(t) => t.get_string(&txn),
            None => String::new(),
        }
    }

    #[tokio::test]
    async fn test_update_broadcast_reaches_all_including_origin() {
        let (doc, mut events) = make_doc("x");
        let mut rx1 = doc.register_connection(1).await;
        let mut rx2 = doc.register_connection(2).await;

        let payload = text_update("hello");
        doc.apply_update(&payload).await.unwrap();

        for rx in [&mut rx1, &mut rx2] {
            let frame = rx.recv().await.unwrap();
            match Message::decode(&frame).unwrap() {
                Message::Sync(SyncMessage::Update(op)) => assert_eq!(op, payload),
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        match events.recv().await.unwrap() {
            DocEvent::Updated { name, state } => {
                assert_eq!(name, "x");
                assert_eq!(materialize(&state), "hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_updated_event_carries_merged_state() {
        let (doc, mut events) = make_doc("x");

        doc.apply_update(&text_update("hello ")).await.unwrap();
        let _ = events.recv().await;

        // A second, concurrent-origin edit merges rather than replaces.
        doc.apply_update(&text_update("world")).await.unwrap();
        match events.recv().await.unwrap() {
            DocEvent::Updated { state, .. } => {
                let merged = materialize(&state);
                assert!(merged.contains("hello "));
                assert!(merged.contains("world"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_apply_same_update_twice_is_idempotent() {
        let (doc, _events) = make_doc("x");
        let payload = text_update("once");

        doc.apply_update(&payload).await.unwrap();
        let after_first = doc.encode_state().await;
        doc.apply_update(&payload).await.unwrap();
        let after_second = doc.encode_state().await;

        assert_eq!(materialize(&after_first), materialize(&after_second));
        assert_eq!(materialize(&after_second), "once");
    }

    #[tokio::test]
    async fn test_bad_update_is_rejected_quietly() {
        let (doc, mut events) = make_doc("x");
        let mut rx = doc.register_connection(1).await;

        let err = doc.apply_update(&[0xff, 0xfe, 0xfd]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::BadUpdate(_)));
        assert!(rx.try_recv().is_err());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handshake_step1_yields_missing_ops() {
        let (doc, _events) = make_doc("x");
        doc.apply_update(&text_update("server side")).await.unwrap();

        // Empty peer: its state vector is the empty doc's.
        let peer = Doc::new();
        let peer_sv = peer.transact().state_vector().encode_v1();

        let reply = doc
            .handle_sync(SyncMessage::Step1(peer_sv), false)
            .await
            .unwrap();
        match reply {
            Some(Message::Sync(SyncMessage::Step2(diff))) => {
                assert_eq!(materialize(&diff), "server side");
            }
            other => panic!("expected STEP2, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_step2_and_update_apply_without_reply() {
        let (doc, _events) = make_doc("x");

        let reply = doc
            .handle_sync(SyncMessage::Step2(text_update("via step2")), false)
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(materialize(&doc.encode_state().await), "via step2");
    }

    #[tokio::test]
    async fn test_read_only_drops_mutations_but_answers_step1() {
        let (doc, mut events) = make_doc("x");

        let reply = doc
            .handle_sync(SyncMessage::Update(text_update("nope")), true)
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(materialize(&doc.encode_state().await), "");
        assert!(events.try_recv().is_err());

        let peer_sv = Doc::new().transact().state_vector().encode_v1();
        let reply = doc
            .handle_sync(SyncMessage::Step1(peer_sv), true)
            .await
            .unwrap();
        assert!(matches!(reply, Some(Message::Sync(SyncMessage::Step2(_)))));
    }

    #[tokio::test]
    async fn test_awareness_controls_actor_and_cleanup_broadcasts_removal() {
        let (doc, _events) = make_doc("x");
        let _rx1 = doc.register_connection(1).await;
        let mut rx2 = doc.register_connection(2).await;

        // Connection 1 declares actor 42.
        let mut publisher = AwarenessTable::new();
        let delta = publisher.set_state(42, Some(r#"{"cursor":1}"#));
        let blob = publisher.encode_actors(&delta.changed());
        doc.apply_awareness(&blob, 1).await.unwrap();

        // Everyone hears the addition.
        let frame = rx2.recv().await.unwrap();
        let mut observer = AwarenessTable::new();
        match Message::decode(&frame).unwrap() {
            Message::Awareness(delta) => {
                let applied = observer.apply_update(&delta).unwrap();
                assert_eq!(applied.added, vec![42]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        // Closing connection 1 removes actor 42 for everyone else.
        doc.unregister_connection(1).await;
        let frame = rx2.recv().await.unwrap();
        match Message::decode(&frame).unwrap() {
            Message::Awareness(delta) => {
                let applied = observer.apply_update(&delta).unwrap();
                assert_eq!(applied.removed, vec![42]);
                assert!(!observer.contains(42));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(doc.awareness_snapshot().await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_without_actors_is_silent() {
        let (doc, _events) = make_doc("x");
        let _rx1 = doc.register_connection(1).await;
        let mut rx2 = doc.register_connection(2).await;

        doc.unregister_connection(1).await;
        assert!(rx2.try_recv().is_err());
        assert_eq!(doc.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_awareness_snapshot_after_updates() {
        let (doc, _events) = make_doc("x");
        assert!(doc.awareness_snapshot().await.is_none());

        let mut publisher = AwarenessTable::new();
        let delta = publisher.set_state(7, Some(r#"{"here":true}"#));
        doc.apply_awareness(&publisher.encode_actors(&delta.changed()), 1)
            .await
            .unwrap();

        let snapshot = doc.awareness_snapshot().await.unwrap();
        let mut table = AwarenessTable::new();
        table.apply_update(&snapshot).unwrap();
        assert_eq!(table.state(7), Some(r#"{"here":true}"#));
    }

    #[tokio::test]
    async fn test_load_state_does_not_notify() {
        let (doc, mut events) = make_doc("x");
        doc.load_state(&text_update("restored")).await.unwrap();
        assert!(events.try_recv().is_err());
        assert_eq!(materialize(&doc.encode_state().await), "restored");
    }
}
