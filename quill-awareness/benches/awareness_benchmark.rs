use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use quill_awareness::{decode_update, encode_remove_update, modify_update, Any, Awareness};

fn cursor_state(i: i64) -> Any {
    Any::object([
        (
            "user",
            Any::object([("name", Any::from("Alice")), ("color", Any::from("#30bced"))]),
        ),
        (
            "cursor",
            Any::object([("anchor", Any::Integer(i)), ("head", Any::Integer(i + 8))]),
        ),
    ])
}

fn populated(clients: u64) -> Awareness {
    let mut awareness = Awareness::new(0);
    for id in 0..clients {
        awareness.set_state(id, Some(cursor_state(id as i64)));
    }
    awareness
}

fn bench_encode_single(c: &mut Criterion) {
    let awareness = populated(1);

    c.bench_function("awareness_encode_1_client", |b| {
        b.iter(|| black_box(awareness.encode_update(black_box(&[0]))))
    });
}

fn bench_decode_hundred(c: &mut Criterion) {
    let awareness = populated(100);
    let ids: Vec<u64> = (0..100).collect();
    let update = awareness.encode_update(&ids);

    c.bench_function("awareness_decode_100_clients", |b| {
        b.iter(|| black_box(decode_update(black_box(&update)).unwrap()))
    });
}

fn bench_apply(c: &mut Criterion) {
    let sender = populated(100);
    let ids: Vec<u64> = (0..100).collect();
    let update = sender.encode_update(&ids);

    c.bench_function("awareness_apply_100_clients", |b| {
        b.iter(|| {
            let mut receiver = Awareness::new(1_000);
            black_box(receiver.apply_update(black_box(&update)).unwrap());
        })
    });
}

fn bench_offline_rewrite(c: &mut Criterion) {
    let awareness = populated(1);
    let update = awareness.encode_update(&[0]);

    c.bench_function("awareness_modify_to_offline", |b| {
        b.iter(|| black_box(modify_update(black_box(&update), |_| Any::Null).unwrap()))
    });

    c.bench_function("awareness_remove_update", |b| {
        b.iter(|| black_box(encode_remove_update(black_box(42), black_box(7))))
    });
}

criterion_group!(
    benches,
    bench_encode_single,
    bench_decode_hundred,
    bench_apply,
    bench_offline_rewrite,
);
criterion_main!(benches);
