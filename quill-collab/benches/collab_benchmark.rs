use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use quill_collab::auth::{ConnectionContext, Identity};
use quill_collab::broadcast::BroadcastGroup;
use quill_collab::protocol::{PeerInfo, SyncMessage};
use quill_collab::storage::{DocumentStore, RocksStore, StoreConfig};
use quill_core::DocNode;
use uuid::Uuid;

fn bench_update_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let fragment = vec![0u8; 64]; // Typical keystroke update

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(peer), black_box("doc-1"), black_box(fragment.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = SyncMessage::update(Uuid::new_v4(), "doc-1", vec![0u8; 64])
        .encode()
        .unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_peer_joined_encode(c: &mut Criterion) {
    let info = PeerInfo::new(Uuid::new_v4(), "user-1", "Ada Lovelace");

    c.bench_function("peer_joined_encode", |b| {
        b.iter(|| black_box(SyncMessage::peer_joined("doc-1", black_box(&info)).unwrap()))
    });
}

fn bench_fan_out_100_peers(c: &mut Criterion) {
    let group = BroadcastGroup::new(1024);
    let receivers: Vec<_> = (0..100).map(|_| group.subscribe(Uuid::new_v4())).collect();
    let origin = Uuid::new_v4();
    let data = Arc::new(vec![0u8; 64]);

    c.bench_function("fan_out_raw_100_peers", |b| {
        b.iter(|| black_box(group.fan_out_raw(origin, black_box(data.clone()))))
    });
    drop(receivers);
}

fn bench_fan_out_1000_messages(c: &mut Criterion) {
    c.bench_function("fan_out_1000_msgs_100_peers", |b| {
        b.iter(|| {
            let group = BroadcastGroup::new(2048);
            let _receivers: Vec<_> = (0..100).map(|_| group.subscribe(Uuid::new_v4())).collect();
            let origin = Uuid::new_v4();
            for i in 0..1000u64 {
                group.fan_out_raw(origin, black_box(Arc::new(vec![i as u8; 64])));
            }
        })
    });
}

fn bench_rocks_save(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let ctx = ConnectionContext::new(Identity::new("bench", "Bench"), "token");
    let paragraphs = (0..200).map(|i| DocNode::paragraph(format!("Paragraph {i} of the benchmark document."))).collect();
    let doc = DocNode::doc(paragraphs).to_value();

    c.bench_function("rocks_save_200_paragraphs", |b| {
        b.iter(|| {
            rt.block_on(async {
                store.save("bench-doc", &ctx, black_box(&doc)).await.unwrap();
            })
        })
    });

    c.bench_function("rocks_fetch_200_paragraphs", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(store.fetch("bench-doc", &ctx).await.unwrap());
            })
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_peer_joined_encode,
    bench_fan_out_100_peers,
    bench_fan_out_1000_messages,
    bench_rocks_save,
);
criterion_main!(benches);
