//! # Submap Benchmark

use criterion::{criterion_group, criterion_main, Criterion};

use comms_if::map::SubmapRequest;
use elev_lib::{
    map::{BinningEngine, BinningEngineParams, MapEngine},
    submap,
};
use nalgebra::{Point3, Rotation3, Vector3};

fn submap_benchmark(c: &mut Criterion) {
    // ---- Build a populated map ----

    let mut engine = BinningEngine::new(BinningEngineParams {
        resolution_m: 0.05,
        map_length_m: 10.0,
        ..Default::default()
    })
    .unwrap();

    // Gently sloping plane covering most of the map
    let points: Vec<Point3<f64>> = (0..190)
        .flat_map(|i| (0..190).map(move |j| (i, j)))
        .map(|(i, j)| {
            let x = -4.75 + i as f64 * 0.05;
            let y = -4.75 + j as f64 * 0.05;
            Point3::new(x, y, 0.1 * x + 0.05 * y)
        })
        .collect();

    engine
        .input(&points, &Rotation3::identity(), &Vector3::zeros(), 0.01, 0.001)
        .unwrap();

    let map = engine.snapshot("map");

    // ---- Benchmark ----

    let all_layers = SubmapRequest {
        position_m: (1.0, -0.5),
        length_m: (4.0, 4.0),
        layers: vec![],
    };

    let elevation_only = SubmapRequest {
        layers: vec!["elevation".into()],
        ..all_layers.clone()
    };

    let partly_outside = SubmapRequest {
        position_m: (4.0, 4.0),
        ..all_layers.clone()
    };

    c.bench_function("submap_all_layers", |b| {
        b.iter(|| submap::extract(&map, &all_layers))
    });
    c.bench_function("submap_elevation_only", |b| {
        b.iter(|| submap::extract(&map, &elevation_only))
    });
    c.bench_function("submap_partly_outside", |b| {
        b.iter(|| submap::extract(&map, &partly_outside))
    });
    c.bench_function("map_to_msg", |b| b.iter(|| map.to_msg(map.timestamp)));
}

criterion_group!(benches, submap_benchmark);
criterion_main!(benches);
