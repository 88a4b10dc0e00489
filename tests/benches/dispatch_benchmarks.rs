//! # Dispatch Path Benchmarks
//!
//! Hot structures on every forwarded request:
//!
//! | Structure | Operation |
//! |-----------|-----------|
//! | PendingRequestTable | create + fulfill |
//! | ConnectionRegistry | pick_available across N workers |
//! | FrameCodec | encode / decode a forward_request |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;

use tunnel_broker::domain::WorkerHandle;
use tunnel_broker::{
    ChannelId, ConnectionRegistry, Frame, FrameCodec, PendingRequestTable, RequestId,
    TargetSelector, WorkerId, WorkerMetadata, WorkerReply,
};

fn bench_pending_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("pending-table");
    let table = PendingRequestTable::new(1_000_000);
    let worker = WorkerId::from("w1");

    group.bench_function("create_fulfill", |b| {
        b.iter(|| {
            let deadline = Instant::now() + Duration::from_secs(30);
            let (request_id, rx) = table.create(worker.clone(), deadline).unwrap();
            black_box(table.fulfill(&request_id, WorkerReply::Payload(json!({"ok": true}))));
            drop(rx);
        })
    });

    group.bench_function("fulfill_unknown", |b| {
        let unknown = RequestId::new();
        b.iter(|| black_box(table.fulfill(&unknown, WorkerReply::Failed("late".into()))))
    });

    group.finish();
}

fn bench_registry_pick(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    for size in [1usize, 16, 256] {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (handle, rx, closed) = WorkerHandle::channel(16);
            registry
                .register(ChannelId::next(), handle, WorkerMetadata::new())
                .unwrap();
            receivers.push((rx, closed));
        }
        let last = WorkerId::from(format!("w{size}"));

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("pick_any", size), &size, |b, _| {
            b.iter(|| black_box(registry.pick_available(&TargetSelector::Any).is_ok()))
        });
        group.bench_with_input(BenchmarkId::new("pick_worker", size), &size, |b, _| {
            let selector = TargetSelector::Worker(last.clone());
            b.iter(|| black_box(registry.pick_available(&selector).is_ok()))
        });
    }

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let codec = FrameCodec::default();
    let frame = Frame::ForwardRequest {
        request_id: RequestId::new(),
        payload: json!({
            "method": "POST",
            "path": "/hooks/feishu",
            "query": {"token": "abc"},
            "headers": {"content-type": "application/json"},
            "body": {"event": "message", "text": "x".repeat(512)},
        }),
    };
    let encoded = codec.encode(&frame).unwrap();

    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode_forward_request", |b| {
        b.iter(|| black_box(codec.encode(&frame).unwrap()))
    });
    group.bench_function("decode_forward_request", |b| {
        b.iter(|| black_box(codec.decode(&encoded).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_pending_table, bench_registry_pick, bench_codec);
criterion_main!(benches);
