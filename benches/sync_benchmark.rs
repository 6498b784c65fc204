use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use tandem_sync::{
    AwarenessTable, BlobStore, CacheConfig, DocCache, Flusher, MemoryStore, Message, RocksStore,
    SharedDoc, StoreConfig,
};
use tempfile::tempdir;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Text, Transact, WriteTxn};

/// Encoded state of a document whose text root holds `len` bytes.
fn text_state(len: usize) -> Vec<u8> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        let t = txn.get_or_insert_text("t");
        t.insert(&mut txn, 0, &"x".repeat(len));
    }
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

fn shared_doc() -> (Arc<SharedDoc>, tokio::sync::mpsc::UnboundedReceiver<tandem_sync::DocEvent>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (Arc::new(SharedDoc::new("bench", true, 2048, tx)), rx)
}

// ─── Protocol ────────────────────────────────────────────────────────────────

fn bench_frame_encode(c: &mut Criterion) {
    let payload = text_state(1024);

    c.bench_function("frame_encode_1KB_update", |b| {
        b.iter(|| {
            let msg = Message::update(black_box(payload.clone()));
            black_box(msg.encode());
        })
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let encoded = Message::update(text_state(1024)).encode();

    c.bench_function("frame_decode_1KB_update", |b| {
        b.iter(|| {
            black_box(Message::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_step1_encode(c: &mut Criterion) {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        let t = txn.get_or_insert_text("t");
        t.insert(&mut txn, 0, "handshake");
    }
    let sv = doc.transact().state_vector().encode_v1();

    c.bench_function("frame_encode_step1", |b| {
        b.iter(|| {
            let msg = Message::sync_step1(black_box(sv.clone()));
            black_box(msg.encode());
        })
    });
}

// ─── Awareness ───────────────────────────────────────────────────────────────

fn bench_awareness_apply_32_actors(c: &mut Criterion) {
    let mut publisher = AwarenessTable::new();
    let actors: Vec<u64> = (1..=32).collect();
    for actor in &actors {
        publisher.set_state(*actor, Some(r#"{"cursor":{"line":10,"col":4}}"#));
    }
    let update = publisher.encode_actors(&actors);

    c.bench_function("awareness_apply_32_actors", |b| {
        b.iter(|| {
            let mut table = AwarenessTable::new();
            black_box(table.apply_update(black_box(&update)).unwrap());
        })
    });
}

fn bench_awareness_encode_full(c: &mut Criterion) {
    let mut table = AwarenessTable::new();
    for actor in 1..=32u64 {
        table.set_state(actor, Some(r#"{"cursor":{"line":10,"col":4}}"#));
    }

    c.bench_function("awareness_encode_full_32_actors", |b| {
        b.iter(|| {
            black_box(black_box(&table).encode_full());
        })
    });
}

// ─── Fan-out ─────────────────────────────────────────────────────────────────

fn bench_broadcast_100_connections(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let update = text_state(64);

    c.bench_function("broadcast_update_100_conns", |b| {
        b.iter(|| {
            rt.block_on(async {
                let (doc, _events) = shared_doc();
                let mut receivers = Vec::new();
                for conn_id in 1..=100 {
                    receivers.push(doc.register_connection(conn_id).await);
                }
                doc.apply_update(black_box(&update)).await.unwrap();
                black_box(&receivers);
            });
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_awareness_100_conns", |b| {
        b.iter(|| {
            rt.block_on(async {
                let (doc, _events) = shared_doc();
                let mut receivers = Vec::new();
                for conn_id in 1..=100 {
                    receivers.push(doc.register_connection(conn_id).await);
                }
                let mut publisher = AwarenessTable::new();
                for actor in 1..=1000u64 {
                    let delta = publisher.set_state(actor, Some("{}"));
                    let blob = publisher.encode_actors(&delta.changed());
                    doc.apply_awareness(black_box(&blob), 1).await.unwrap();
                }
                black_box(&receivers);
            });
        })
    });
}

// ─── Storage ─────────────────────────────────────────────────────────────────

fn bench_store_put_4kb(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let blob = text_state(4096);

    c.bench_function("store_put_4KB", |b| {
        b.iter(|| {
            store.put(black_box("bench"), black_box(&blob)).unwrap();
        })
    });
}

fn bench_store_get_4kb(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    store.put("bench", &text_state(4096)).unwrap();

    c.bench_function("store_get_4KB", |b| {
        b.iter(|| {
            black_box(store.get(black_box("bench")).unwrap());
        })
    });
}

fn bench_flush_cycle_100_docs(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let blob = text_state(512);

    c.bench_function("flush_cycle_100_dirty_docs", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = Arc::new(MemoryStore::new());
                let cache = Arc::new(DocCache::new(store, CacheConfig::default()));
                for i in 0..100 {
                    cache.write(&format!("doc-{i}"), blob.clone()).await.unwrap();
                }
                let flusher = Flusher::new(cache, Duration::from_secs(10));
                black_box(flusher.run_cycle().await);
            });
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_step1_encode,
    bench_awareness_apply_32_actors,
    bench_awareness_encode_full,
    bench_broadcast_100_connections,
    bench_broadcast_1000_messages,
    bench_store_put_4kb,
    bench_store_get_4kb,
    bench_flush_cycle_100_docs,
);
criterion_main!(benches);
