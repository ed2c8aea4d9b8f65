//! Criterion benchmarks for the bag-of-cells codec
//!
//! - serialize a random tree in several modes
//! - eager and lazy decoding

use std::hint::black_box;
use std::sync::Arc;

use boc_db::boc::{std_boc_serialize, BagOfCells, BufferBlobView, LazyBoc, Mode, StaticBagOfCellsDb};
use boc_db::cell::{Cell, CellBuilder};
use boc_db::LazyOptions;
use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_tree(seed: u64, cells: usize) -> Cell {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut made: Vec<Cell> = Vec::with_capacity(cells);
    for _ in 0..cells {
        let mut b = CellBuilder::new();
        b.store_u64(rng.gen(), 64).unwrap();
        b.store_u64(rng.gen(), 64).unwrap();
        let n = rng.gen_range(0..=made.len().min(4));
        for _ in 0..n {
            b.store_ref(made[rng.gen_range(0..made.len())].clone()).unwrap();
        }
        made.push(b.finalize_cell(false).unwrap());
    }
    made.pop().unwrap()
}

fn bench_serialize(c: &mut Criterion) {
    let root = random_tree(1, 5000);
    let mut group = c.benchmark_group("serialize");
    for (name, mode) in [
        ("none", Mode::NONE),
        ("index_crc", Mode::WITH_INDEX | Mode::WITH_CRC32C),
        ("all", Mode::ALL),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &mode, |b, &mode| {
            b.iter(|| std_boc_serialize(black_box(root.clone()), mode).unwrap())
        });
    }
    group.finish();
}

fn bench_deserialize(c: &mut Criterion) {
    let root = random_tree(2, 5000);
    let data = std_boc_serialize(root, Mode::WITH_INDEX | Mode::WITH_CRC32C).unwrap();
    let shared = Bytes::from(data.clone());

    let mut group = c.benchmark_group("deserialize");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("eager", |b| {
        b.iter(|| {
            let mut boc = BagOfCells::new();
            boc.deserialize(black_box(&data), 1).unwrap();
            boc.root_cell(0).unwrap()
        })
    });
    group.bench_function("lazy_root", |b| {
        b.iter(|| {
            let boc: Arc<LazyBoc> = LazyBoc::create(
                Box::new(BufferBlobView::new(shared.clone())),
                LazyOptions::default(),
            );
            boc.root_cell(0).unwrap()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_serialize, bench_deserialize);
criterion_main!(benches);
