//! Criterion micro-benchmarks for the bitmap version store.
//!
//! Benchmarks:
//! - Sparse and dense encode/decode at the reference bitmap width
//! - Two-stage insert throughput (fresh store per batch)
//! - Snapshot lookup against a populated store

use std::hint::black_box;

use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};

use hexbit_mvcc::{BITMAP_BYTES, BitmapVersionStore, decode, encode};

fn criterion_config() -> Criterion {
    Criterion::default().configure_from_args()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn zero_bitmap() -> Box<[u8; BITMAP_BYTES]> {
    Box::new([0u8; BITMAP_BYTES])
}

/// A bitmap with one bit set every `stride` bytes.
fn strided_bitmap(stride: usize) -> Box<[u8; BITMAP_BYTES]> {
    let mut out = zero_bitmap();
    let mut index = 0;
    while index < BITMAP_BYTES {
        out[index] = 0x80;
        index += stride;
    }
    out
}

/// Monotone version history: version `i` sets bit `i`.
fn version_history(versions: usize) -> Vec<Box<[u8; BITMAP_BYTES]>> {
    let mut history = Vec::with_capacity(versions);
    let mut current = zero_bitmap();
    for csn in 0..versions {
        current[(csn / 8) % BITMAP_BYTES] |= 1u8 << (7 - (csn % 8));
        history.push(current.clone());
    }
    history
}

// ---------------------------------------------------------------------------
// Codec benchmarks
// ---------------------------------------------------------------------------

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Bytes(BITMAP_BYTES as u64));

    let reference = zero_bitmap();
    let sparse_original = strided_bitmap(512);
    let dense_original = strided_bitmap(4);

    group.bench_function("encode_sparse", |b| {
        b.iter(|| encode(black_box(&sparse_original), black_box(&reference)));
    });
    group.bench_function("encode_dense", |b| {
        b.iter(|| encode(black_box(&dense_original), black_box(&reference)));
    });

    let sparse_delta = encode(&sparse_original, &reference);
    let dense_delta = encode(&dense_original, &reference);
    assert!(sparse_delta.is_sparse());
    assert!(!dense_delta.is_sparse());

    let mut out = zero_bitmap();
    group.bench_function("decode_sparse", |b| {
        b.iter(|| decode(black_box(&reference), black_box(&sparse_delta), &mut out));
    });
    group.bench_function("decode_dense", |b| {
        b.iter(|| decode(black_box(&reference), black_box(&dense_delta), &mut out));
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Store benchmarks
// ---------------------------------------------------------------------------

fn bench_insert(c: &mut Criterion) {
    const BATCH: usize = 64;

    let history = version_history(BATCH);
    let mut group = c.benchmark_group("store");
    group.throughput(Throughput::Elements(BATCH as u64));
    group.bench_function("insert_batch", |b| {
        b.iter_batched(
            BitmapVersionStore::<BITMAP_BYTES, 9>::new,
            |store| {
                for (csn, bitmap) in history.iter().enumerate() {
                    store.insert(csn as u64, bitmap);
                }
                store
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    const VERSIONS: usize = 256;

    let store = BitmapVersionStore::<BITMAP_BYTES, 9>::new();
    for (csn, bitmap) in version_history(VERSIONS).iter().enumerate() {
        store.insert(csn as u64, bitmap);
    }

    let mut out = zero_bitmap();
    let mut csn = 0u64;
    let mut group = c.benchmark_group("store");
    group.throughput(Throughput::Elements(1));
    group.bench_function("lookup", |b| {
        b.iter(|| {
            csn = (csn + 97) % VERSIONS as u64;
            black_box(store.lookup(csn, &mut out))
        });
    });
    group.finish();
}

criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_codec, bench_insert, bench_lookup
}
criterion_main!(benches);
