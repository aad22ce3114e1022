//! Router and frame codec throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::io::Cursor;
use switchyard::envelope::Envelope;
use switchyard::ipc::codec::{self, Frame};
use switchyard::kernel::{ProcessRole, RateLimitConfig, RoleProfiles};
use switchyard::router::Router;
use switchyard::types::{ProcessId, RouterConfig};

const MAX_FRAME: u32 = 16 * 1024 * 1024;
const WORKER: ProcessId = ProcessId::new(1);

fn envelope(payload_bytes: usize) -> Envelope {
    Envelope::notify(
        ProcessId::HOST,
        WORKER,
        "model.classify",
        json!({ "text": "x".repeat(payload_bytes) }),
    )
}

fn bench_router_send(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let rate_limit = RateLimitConfig {
        default_limit: u32::MAX,
        ..RateLimitConfig::default()
    };
    let router = rt.block_on(async {
        Router::new(RouterConfig::default(), rate_limit, RoleProfiles::default()).unwrap()
    });
    router.register_process(WORKER, ProcessRole::ModelExec).unwrap();
    let mut mailbox = router.take_mailbox(WORKER).unwrap();

    c.bench_function("router_send_notify", |b| {
        let template = envelope(64);
        b.iter(|| {
            router.send(black_box(template.clone())).unwrap();
            mailbox.try_recv().unwrap()
        });
    });
}

fn bench_frame_codec(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let payload_sizes: &[usize] = &[0, 1024, 65536];

    let mut group = c.benchmark_group("envelope_frame_round_trip");
    for &size in payload_sizes {
        let frame = Frame::Envelope(Box::new(envelope(size)));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, f| {
            b.iter(|| {
                rt.block_on(async {
                    let mut buf = Vec::with_capacity(size + 256);
                    codec::write(&mut buf, black_box(f)).await.unwrap();
                    codec::read(&mut Cursor::new(buf), MAX_FRAME).await.unwrap()
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_router_send, bench_frame_codec);
criterion_main!(benches);
