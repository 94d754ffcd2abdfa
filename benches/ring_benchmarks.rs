//! Ring buffer throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use weir::codec::{decode_tuple, encode_tuple};
use weir::ring::RingBuf;
use weir::schema::{ExprType, TupleSchema};
use weir::value::{ScalarType, Value};

fn bench_enqueue_dequeue(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let ring = RingBuf::create(&dir.path().join("bench.ring"), 64 * 1024).expect("create");
    let msg: Vec<u32> = (0..16).collect();

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Elements(1));
    group.bench_function("enqueue_dequeue_16w", |b| {
        b.iter(|| {
            ring.enqueue(black_box(&msg)).expect("enqueue");
            black_box(ring.dequeue().expect("dequeue"));
        });
    });
    group.finish();
}

fn bench_tuple_codec(c: &mut Criterion) {
    let mut schema = TupleSchema::new();
    schema
        .push("time", ExprType::typed("time", ScalarType::Float, false))
        .expect("push");
    schema
        .push("host", ExprType::typed("host", ScalarType::Str, false))
        .expect("push");
    schema
        .push("value", ExprType::typed("value", ScalarType::U64, true))
        .expect("push");
    schema.set_finished();
    let tuple = vec![
        Value::Float(1234.5),
        Value::Str("db-01.example.net".to_string()),
        Value::U64(987_654_321),
    ];

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(1));
    group.bench_function("encode_decode_3f", |b| {
        b.iter(|| {
            let words = encode_tuple(black_box(&schema), black_box(&tuple)).expect("encode");
            black_box(decode_tuple(&schema, &words).expect("decode"));
        });
    });
    group.finish();
}

criterion_group!(benches, bench_enqueue_dequeue, bench_tuple_codec);
criterion_main!(benches);
