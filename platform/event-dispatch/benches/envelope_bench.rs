use criterion::{black_box, criterion_group, criterion_main, Criterion};
use event_dispatch::EventEnvelope;
use serde_json::json;

fn lifecycle_envelope() -> EventEnvelope {
    let payload = json!({
        "sample_id": 999999901,
        "creator_id": 999999902,
        "metadata": {"tags": ["ambient", "guitar"], "bpm": 125}
    });

    EventEnvelope::new(
        "sample.lifecycle.created",
        "event_sim",
        payload.as_object().cloned().unwrap_or_default(),
    )
    .expect("non-empty event name")
}

fn bench_encode(c: &mut Criterion) {
    let envelope = lifecycle_envelope();
    c.bench_function("envelope_encode", |b| {
        b.iter(|| black_box(&envelope).to_json_bytes().unwrap())
    });
}

fn bench_decode(c: &mut Criterion) {
    let bytes = lifecycle_envelope().to_json_bytes().unwrap();
    c.bench_function("envelope_decode", |b| {
        b.iter(|| EventEnvelope::from_json_slice(black_box(&bytes)).unwrap())
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
