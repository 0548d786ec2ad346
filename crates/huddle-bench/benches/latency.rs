//! Delivery latency benchmarks for Huddle.
//!
//! Times an event from `Hub::broadcast` until its frame comes out of a
//! session's event stream body.

use criterion::{criterion_group, criterion_main, Criterion};
use futures_util::StreamExt;
use huddle_core::{EventPayload, Hub};
use huddle_transport::{sse, Session, SessionConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime")
}

/// Open `streams` sessions on one team and return their bodies.
async fn open_streams(hub: &Hub, streams: usize) -> Vec<sse::SseBody> {
    let mut bodies = Vec::with_capacity(streams);
    for _ in 0..streams {
        let (conn, mut body) = sse::channel(64);
        let session = Session::open(hub, "team-bench", conn, SessionConfig::default())
            .await
            .expect("open session");
        // Handshake.
        body.next().await;
        tokio::spawn(session.run());
        bodies.push(body);
    }
    bodies
}

fn bench_stream_delivery(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("stream_delivery");

    for streams in [1usize, 10] {
        group.bench_function(format!("{streams}_streams"), |b| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let hub = Arc::new(Hub::new());
                    let mut bodies = open_streams(&hub, streams).await;
                    let payload = EventPayload::MeetingDeleted { id: "m1".into() };

                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        let start = Instant::now();
                        let _ = hub.broadcast("team-bench", payload.clone());
                        for body in &mut bodies {
                            body.next().await;
                        }
                        total += start.elapsed();
                    }

                    hub.shutdown();
                    total
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_stream_delivery);
criterion_main!(benches);
