use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

use espalier::{
    context::{Context, Node},
    simplex::{BuildSettings, Region, SimplexTree},
};
use nalgebra::SVector;

fn sphere(ctx: &mut Context) -> Node {
    let (x, y, z) = ctx.axes();
    let x2 = ctx.square(x).unwrap();
    let y2 = ctx.square(y).unwrap();
    let z2 = ctx.square(z).unwrap();
    let s = ctx.add(x2, y2).unwrap();
    let s = ctx.add(s, z2).unwrap();
    ctx.sub(s, 0.25).unwrap()
}

pub fn simplex_tree_sphere(c: &mut Criterion) {
    let mut ctx = Context::new();
    let f = sphere(&mut ctx);
    let region = Region::<3>::new(
        SVector::from([-1.0, -1.0, -1.0]),
        SVector::from([1.0, 1.0, 1.0]),
        5,
    );

    let mut group = c.benchmark_group("sphere_simplex_tree");
    for threads in [0, 4, 8] {
        let settings = BuildSettings {
            threads,
            ..Default::default()
        };
        group.bench_function(
            BenchmarkId::new("build", threads),
            |b| {
                b.iter(|| {
                    let tree = SimplexTree::build(
                        black_box(&ctx),
                        black_box(f),
                        region,
                        &settings,
                    )
                    .unwrap();
                    black_box(tree.assign_indices())
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, simplex_tree_sphere);
criterion_main!(benches);
