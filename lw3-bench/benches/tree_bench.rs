//! Node tree benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lw3_tree::{Property, Tree};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn build_tree(width: usize) -> Tree {
    let tree = Tree::new();
    for i in 0..width {
        let node = tree.node(&format!("/MEDIA/VIDEO/I{}", i)).unwrap();
        node.set("SignalPresent", false).unwrap();
        node.define_property("Name", Property::new(format!("Input {}", i)))
            .unwrap();
    }
    tree
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_resolve");
    group.throughput(Throughput::Elements(1));

    let tree = build_tree(64);
    group.bench_function("hit", |b| {
        b.iter(|| black_box(tree.resolve(black_box("/MEDIA/VIDEO/I42"))))
    });
    group.bench_function("miss", |b| {
        b.iter(|| black_box(tree.resolve(black_box("/MEDIA/AUDIO/I42"))))
    });

    group.finish();
}

fn bench_write_property(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_write_property");
    group.throughput(Throughput::Elements(1));

    for listeners in [0, 1, 16] {
        let tree = build_tree(1);
        let node = tree.resolve("/MEDIA/VIDEO/I0").unwrap();
        let fired = Arc::new(AtomicU64::new(0));
        for _ in 0..listeners {
            let fired = fired.clone();
            node.on("Name", move |_, _, _| {
                fired.fetch_add(1, Ordering::Relaxed);
            });
        }

        let mut n = 0u64;
        group.bench_with_input(
            BenchmarkId::from_parameter(listeners),
            &node,
            |b, node| {
                b.iter(|| {
                    n += 1;
                    black_box(node.write_property("Name", &n.to_string()).unwrap())
                })
            },
        );
    }

    group.finish();
}

fn bench_json(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_json");

    for width in [8, 64, 512] {
        let tree = build_tree(width);
        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::new("export", width), &tree, |b, tree| {
            b.iter(|| black_box(tree.root().to_json()))
        });

        let json = tree.root().to_json();
        group.bench_with_input(BenchmarkId::new("import", width), &json, |b, json| {
            b.iter(|| {
                let fresh = Tree::new();
                fresh.root().merge_json(json).unwrap();
                black_box(fresh)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_resolve, bench_write_property, bench_json);

criterion_main!(benches);
