//! Codec benchmarks for huddle-protocol.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use huddle_protocol::{codec, Frame};

fn meeting_json() -> String {
    format!(
        r#"{{"id":"m1","teamId":"team-demo-123","title":"Standup","description":"{}"}}"#,
        "x".repeat(200)
    )
}

fn bench_encode_event(c: &mut Criterion) {
    let frame = Frame::event("meeting.updated", meeting_json()).with_id(1);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(meeting_json().len() as u64));
    group.bench_function("meeting_event", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.bench_function("keep_alive", |b| {
        b.iter(|| codec::encode(black_box(&Frame::keep_alive())))
    });
    group.finish();
}

fn bench_decode_stream(c: &mut Criterion) {
    let mut stream = BytesMut::new();
    for id in 0..64 {
        let frame = Frame::event("meeting.updated", meeting_json()).with_id(id);
        codec::encode_into(&frame, &mut stream).unwrap();
    }
    let stream = stream.freeze();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("64_events", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&stream[..]);
            while let Some(frame) = codec::decode_from(&mut buf).unwrap() {
                black_box(frame);
            }
        })
    });
    group.finish();
}

criterion_group!(benches, bench_encode_event, bench_decode_stream);
criterion_main!(benches);
