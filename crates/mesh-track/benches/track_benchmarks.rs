//! Benchmarks for the hot paths: broad-phase queries and full tracker steps.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nalgebra::{Point3, Vector3};

use mesh_track::{Aabb, SurfaceTracker, TrackerParams};

fn grid_queries(c: &mut Criterion) {
    use mesh_track::BroadPhase;

    let mut broad_phase = BroadPhase::new();
    for i in 0..1000 {
        let x = (i % 10) as f64;
        let y = ((i / 10) % 10) as f64;
        let z = (i / 100) as f64;
        let aabb = Aabb::new(
            Point3::new(x, y, z),
            Point3::new(x + 1.2, y + 1.2, z + 1.2),
        );
        broad_phase.add_triangle(i, aabb, false);
    }

    c.bench_function("broad_phase_query_1000", |b| {
        let query = Aabb::new(Point3::new(3.0, 3.0, 3.0), Point3::new(6.0, 6.0, 6.0));
        b.iter(|| black_box(broad_phase.potential_triangle_collisions(&query, true, true)))
    });
}

fn integrate_step(c: &mut Criterion) {
    // A flat sheet of triangles drifting downward with nothing to hit.
    let n = 16usize;
    let mut vertices = Vec::new();
    for j in 0..=n {
        for i in 0..=n {
            vertices.push(Point3::new(i as f64, j as f64, 0.0));
        }
    }
    let mut triangles = Vec::new();
    for j in 0..n {
        for i in 0..n {
            let v = |x: usize, y: usize| y * (n + 1) + x;
            triangles.push([v(i, j), v(i + 1, j), v(i + 1, j + 1)]);
            triangles.push([v(i, j), v(i + 1, j + 1), v(i, j + 1)]);
        }
    }
    let masses = vec![1.0; vertices.len()];

    c.bench_function("integrate_sheet_512_triangles", |b| {
        b.iter(|| {
            let mut tracker = SurfaceTracker::new(
                vertices.clone(),
                &triangles,
                masses.clone(),
                TrackerParams {
                    perform_improvement: false,
                    ..TrackerParams::default()
                },
            )
            .unwrap();
            let velocities = vec![Vector3::new(0.0, 0.0, -1.0); tracker.num_vertices()];
            tracker.advect(&velocities, 0.01).unwrap();
            black_box(tracker.integrate(0.01).unwrap())
        })
    });
}

criterion_group!(benches, grid_queries, integrate_step);
criterion_main!(benches);
