//! Triangle quality and curvature measures.
//!
//! Used by the remeshing operators to pick candidates: angle extrema and
//! aspect ratios rate triangle shape, and the mean-curvature estimate scales
//! the edge-length targets so high-curvature regions stay finely resolved.

use nalgebra::{Point3, Vector3};

use crate::surface::DynamicSurface;

/// Aspect ratio of 1.0 for an equilateral triangle.
const ASPECT_NORMALIZATION: f64 = 3.4641016151377544; // 6 / sqrt(3)

/// The three interior angles, in radians, at `a`, `b`, `c` respectively.
pub fn triangle_angles(a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>) -> [f64; 3] {
    let angle = |at: &Point3<f64>, p: &Point3<f64>, q: &Point3<f64>| -> f64 {
        let u = p - at;
        let v = q - at;
        let denom = u.norm() * v.norm();
        if denom < 1e-30 {
            return 0.0;
        }
        (u.dot(&v) / denom).clamp(-1.0, 1.0).acos()
    };
    [angle(a, b, c), angle(b, c, a), angle(c, a, b)]
}

pub fn min_triangle_angle(a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>) -> f64 {
    let angles = triangle_angles(a, b, c);
    angles[0].min(angles[1]).min(angles[2])
}

pub fn max_triangle_angle(a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>) -> f64 {
    let angles = triangle_angles(a, b, c);
    angles[0].max(angles[1]).max(angles[2])
}

pub fn triangle_area(a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>) -> f64 {
    0.5 * (b - a).cross(&(c - a)).norm()
}

/// Normalized aspect ratio: 1.0 for equilateral, toward 0 for slivers.
pub fn triangle_aspect_ratio(a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>) -> f64 {
    let len_ab = (b - a).norm();
    let len_bc = (c - b).norm();
    let len_ca = (a - c).norm();
    let max_edge = len_ab.max(len_bc).max(len_ca);
    let semiperimeter = 0.5 * (len_ab + len_bc + len_ca);
    let denom = semiperimeter * max_edge;
    if denom < 1e-30 {
        return 0.0;
    }
    ASPECT_NORMALIZATION * triangle_area(a, b, c) / denom
}

/// Smallest interior angle over all live triangles, in radians.
pub fn min_mesh_angle(surface: &DynamicSurface) -> f64 {
    let mut min_angle = f64::INFINITY;
    for (_, tri) in surface.mesh.live_triangles() {
        let angle = min_triangle_angle(
            &surface.position(tri[0]),
            &surface.position(tri[1]),
            &surface.position(tri[2]),
        );
        min_angle = min_angle.min(angle);
    }
    min_angle
}

/// Mixed Voronoi area of `v` inside triangle `t` (Meyer et al.): the Voronoi
/// cell area for acute triangles, half the triangle area when the angle at
/// `v` is obtuse, a quarter when another angle is.
pub fn mixed_area(surface: &DynamicSurface, v: usize, t: usize) -> f64 {
    let tri = surface.mesh.triangle(t);
    let slot = tri.iter().position(|&x| x == v).expect("vertex on triangle");
    let p = surface.position(tri[slot]);
    let q = surface.position(tri[(slot + 1) % 3]);
    let r = surface.position(tri[(slot + 2) % 3]);

    let angles = triangle_angles(&p, &q, &r);
    let half_pi = std::f64::consts::FRAC_PI_2;

    if angles[0] >= half_pi {
        return 0.5 * triangle_area(&p, &q, &r);
    }
    if angles[1] >= half_pi || angles[2] >= half_pi {
        return 0.25 * triangle_area(&p, &q, &r);
    }

    // Acute: 1/8 (|pr|^2 cot(q) + |pq|^2 cot(r)).
    let cot_q = 1.0 / angles[1].tan().max(1e-12);
    let cot_r = 1.0 / angles[2].tan().max(1e-12);
    0.125 * ((r - p).norm_squared() * cot_q + (q - p).norm_squared() * cot_r)
}

/// Cotangent-weighted mean-curvature normal at `v`, with the accumulated
/// mixed-area weight. The unsigned mean curvature is
/// `|normal| / (2 * weight)`.
pub fn vertex_mean_curvature_normal(
    surface: &DynamicSurface,
    v: usize,
) -> (Vector3<f64>, f64) {
    let mut sum = Vector3::zeros();
    let mut weight = 0.0;

    for &t in surface.mesh.triangles_incident_to_vertex(v) {
        let tri = surface.mesh.triangle(t);
        let slot = tri.iter().position(|&x| x == v).expect("vertex on triangle");
        let p = surface.position(tri[slot]);
        let q = surface.position(tri[(slot + 1) % 3]);
        let r = surface.position(tri[(slot + 2) % 3]);

        let angles = triangle_angles(&p, &q, &r);
        // Angle at r is opposite edge (v, q); angle at q opposite (v, r).
        // Obtuse angles carry negative cotangents, so only the sine is
        // guarded against degeneracy.
        let cot = |angle: f64| angle.cos() / angle.sin().max(1e-12);
        let cot_r = cot(angles[2]);
        let cot_q = cot(angles[1]);

        sum += cot_r * (p - q) + cot_q * (p - r);
        weight += mixed_area(surface, v, t);
    }

    (sum, weight)
}

/// Unsigned mean curvature at `v` (1 / radius for a sphere).
pub fn unsigned_vertex_mean_curvature(surface: &DynamicSurface, v: usize) -> f64 {
    let (normal, weight) = vertex_mean_curvature_normal(surface, v);
    if weight < 1e-30 {
        return 0.0;
    }
    0.5 * normal.norm() / weight
}

/// Edge length rescaled by the local curvature: edges in high-curvature
/// regions measure longer than their Euclidean length so the splitter
/// refines them sooner. With both multipliers at 1 the scale is exactly 1.
pub fn curvature_scaled_length(
    surface: &DynamicSurface,
    a: usize,
    b: usize,
    min_curvature_multiplier: f64,
    max_curvature_multiplier: f64,
    rest_curvature: f64,
) -> f64 {
    let length = (surface.position(b) - surface.position(a)).norm();
    let curvature = unsigned_vertex_mean_curvature(surface, a)
        .max(unsigned_vertex_mean_curvature(surface, b));
    let scale = (curvature / rest_curvature)
        .clamp(min_curvature_multiplier, max_curvature_multiplier);
    length * scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    fn surface_from(
        vertices: Vec<Point3<f64>>,
        triangles: &[[usize; 3]],
    ) -> DynamicSurface {
        let masses = vec![1.0; vertices.len()];
        DynamicSurface::new(vertices, triangles, masses, 1e-4, 1e-4).unwrap()
    }

    #[test]
    fn test_right_triangle_angles() {
        let angles = triangle_angles(
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
        );
        assert!((angles[0] - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
        assert!((angles[1] - std::f64::consts::FRAC_PI_4).abs() < 1e-12);
        assert!((angles[2] - std::f64::consts::FRAC_PI_4).abs() < 1e-12);
    }

    #[test]
    fn test_equilateral_aspect_ratio() {
        let ratio = triangle_aspect_ratio(
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.5, 3.0_f64.sqrt() / 2.0, 0.0),
        );
        assert!((ratio - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_sliver_aspect_ratio() {
        let ratio = triangle_aspect_ratio(
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(100.0, 0.0, 0.0),
            &Point3::new(50.0, 0.01, 0.0),
        );
        assert!(ratio < 0.01);
    }

    #[test]
    fn test_flat_patch_has_zero_curvature() {
        // Planar fan: mean curvature at the hub must vanish.
        let surface = surface_from(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(-1.0, 0.0, 0.0),
                Point3::new(0.0, -1.0, 0.0),
            ],
            &[[0, 1, 2], [0, 2, 3], [0, 3, 4], [0, 4, 1]],
        );
        assert!(unsigned_vertex_mean_curvature(&surface, 0) < 1e-10);
    }

    #[test]
    fn test_mixed_areas_tile_the_triangle() {
        // For a single acute triangle the three mixed areas sum to its area.
        let surface = surface_from(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.5, 0.8, 0.0),
            ],
            &[[0, 1, 2]],
        );
        let total = mixed_area(&surface, 0, 0)
            + mixed_area(&surface, 1, 0)
            + mixed_area(&surface, 2, 0);
        assert!((total - surface.triangle_area(0)).abs() < 1e-10);
    }

    #[test]
    fn test_unit_curvature_scale_is_identity() {
        let surface = surface_from(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(2.0, 0.0, 0.0),
                Point3::new(1.0, 1.5, 0.3),
            ],
            &[[0, 1, 2]],
        );
        let scaled = curvature_scaled_length(&surface, 0, 1, 1.0, 1.0, 2.0);
        assert!((scaled - 2.0).abs() < 1e-12);
    }
}
