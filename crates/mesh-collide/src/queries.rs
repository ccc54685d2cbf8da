//! Static proximity and intersection queries.
//!
//! Distances come back with barycentric weights and a contact normal so the
//! collision pipeline can distribute impulses directly from the query result.

use nalgebra::{Point3, Vector3};

use crate::predicates::{orient3d, Orientation};

/// Result of a point-triangle distance query.
#[derive(Debug, Clone, Copy)]
pub struct PointTriangleDistance {
    /// Unsigned distance from the point to the closest point on the triangle.
    pub distance: f64,
    /// Barycentric weights of the closest point with respect to the triangle.
    pub weights: [f64; 3],
    /// Unit normal pointing from the triangle toward the query point.
    pub normal: Vector3<f64>,
}

/// Result of an edge-edge distance query.
#[derive(Debug, Clone, Copy)]
pub struct EdgeEdgeDistance {
    /// Unsigned distance between the closest points.
    pub distance: f64,
    /// Weight of the first endpoint of the first edge (closest point is
    /// `w_a * a + (1 - w_a) * b`).
    pub w_a: f64,
    /// Weight of the first endpoint of the second edge.
    pub w_c: f64,
    /// Unit normal pointing from the second edge toward the first.
    pub normal: Vector3<f64>,
}

/// Distance from point `p` to triangle `(a, b, c)`, with the barycentric
/// weights of the closest point and a normal oriented toward `p`.
pub fn point_triangle_distance(
    p: &Point3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
) -> PointTriangleDistance {
    let ab = b - a;
    let ac = c - a;
    let tri_normal = ab.cross(&ac);

    // Near-zero area: the barycentric solve below is unreliable, fall back to
    // the closest of the three edges.
    if tri_normal.norm_squared() < 1e-30 {
        let (d_ab, s_ab) = point_segment(p, a, b);
        let (d_bc, s_bc) = point_segment(p, b, c);
        let (d_ca, s_ca) = point_segment(p, c, a);
        let (distance, weights) = if d_ab <= d_bc && d_ab <= d_ca {
            (d_ab, [1.0 - s_ab, s_ab, 0.0])
        } else if d_bc <= d_ca {
            (d_bc, [0.0, 1.0 - s_bc, s_bc])
        } else {
            (d_ca, [s_ca, 0.0, 1.0 - s_ca])
        };
        let closest = Point3::from(
            a.coords * weights[0] + b.coords * weights[1] + c.coords * weights[2],
        );
        return PointTriangleDistance {
            distance,
            weights,
            normal: safe_direction(p - closest, distance, &Vector3::z()),
        };
    }

    let (weights, closest) = closest_point_on_triangle(p, a, b, c, &ab, &ac);
    let diff = p - closest;
    let distance = diff.norm();
    let normal = safe_direction(diff, distance, &tri_normal.normalize());

    PointTriangleDistance {
        distance,
        weights,
        normal,
    }
}

/// Distance between segments `(a, b)` and `(c, d)` with the weights of the
/// closest points and a normal oriented from the second edge to the first.
pub fn edge_edge_distance(
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
    d: &Point3<f64>,
) -> EdgeEdgeDistance {
    let d1 = b - a;
    let d2 = d - c;
    let r = a - c;

    let aa = d1.norm_squared();
    let ee = d2.norm_squared();
    let ff = d2.dot(&r);

    let (s, t) = if aa < 1e-30 && ee < 1e-30 {
        (0.0, 0.0)
    } else if aa < 1e-30 {
        (0.0, (ff / ee).clamp(0.0, 1.0))
    } else {
        let cc = d1.dot(&r);
        if ee < 1e-30 {
            ((-cc / aa).clamp(0.0, 1.0), 0.0)
        } else {
            let bb = d1.dot(&d2);
            let denom = aa * ee - bb * bb;
            let mut s = if denom.abs() > 1e-30 {
                ((bb * ff - cc * ee) / denom).clamp(0.0, 1.0)
            } else {
                // Parallel segments: any point does, pick the start.
                0.0
            };
            let mut t = (bb * s + ff) / ee;
            if t < 0.0 {
                t = 0.0;
                s = (-cc / aa).clamp(0.0, 1.0);
            } else if t > 1.0 {
                t = 1.0;
                s = ((bb - cc) / aa).clamp(0.0, 1.0);
            }
            (s, t)
        }
    };

    let p_on_first = a + d1 * s;
    let p_on_second = c + d2 * t;
    let diff = p_on_first - p_on_second;
    let distance = diff.norm();

    let fallback = {
        let cross = d1.cross(&d2);
        if cross.norm_squared() > 1e-30 {
            cross.normalize()
        } else {
            any_perpendicular(&d1)
        }
    };

    EdgeEdgeDistance {
        distance,
        w_a: 1.0 - s,
        w_c: 1.0 - t,
        normal: safe_direction(diff, distance, &fallback),
    }
}

/// Does segment `(e0, e1)` cross triangle `(t0, t1, t2)`?
///
/// Orientation-parity test: the segment endpoints must straddle the triangle
/// plane and the segment must see all three triangle edges with a consistent
/// sign. Any degenerate orientation resolves to
/// `degenerate_counts_as_intersection`.
pub fn segment_triangle_intersection(
    e0: &Point3<f64>,
    e1: &Point3<f64>,
    t0: &Point3<f64>,
    t1: &Point3<f64>,
    t2: &Point3<f64>,
    degenerate_counts_as_intersection: bool,
) -> bool {
    let side0 = orient3d(t0, t1, t2, e0);
    let side1 = orient3d(t0, t1, t2, e1);

    if side0 == Orientation::Degenerate || side1 == Orientation::Degenerate {
        return degenerate_counts_as_intersection;
    }
    if side0 == side1 {
        return false;
    }

    let o01 = orient3d(e0, e1, t0, t1);
    let o12 = orient3d(e0, e1, t1, t2);
    let o20 = orient3d(e0, e1, t2, t0);

    if o01 == Orientation::Degenerate
        || o12 == Orientation::Degenerate
        || o20 == Orientation::Degenerate
    {
        return degenerate_counts_as_intersection;
    }

    o01 == o12 && o12 == o20
}

/// Closest point on segment `(a, b)` to `p`: returns (distance, parameter).
fn point_segment(p: &Point3<f64>, a: &Point3<f64>, b: &Point3<f64>) -> (f64, f64) {
    let ab = b - a;
    let len_sq = ab.norm_squared();
    let t = if len_sq < 1e-30 {
        0.0
    } else {
        (ab.dot(&(p - a)) / len_sq).clamp(0.0, 1.0)
    };
    ((p - (a + ab * t)).norm(), t)
}

fn closest_point_on_triangle(
    p: &Point3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
    ab: &Vector3<f64>,
    ac: &Vector3<f64>,
) -> ([f64; 3], Point3<f64>) {
    let ap = p - a;
    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return ([1.0, 0.0, 0.0], *a);
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return ([0.0, 1.0, 0.0], *b);
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return ([1.0 - v, v, 0.0], a + ab * v);
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return ([0.0, 0.0, 1.0], *c);
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return ([1.0 - w, 0.0, w], a + ac * w);
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return ([0.0, 1.0 - w, w], b + (c - b) * w);
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    ([1.0 - v - w, v, w], a + ab * v + ac * w)
}

/// Normalize `v` when `len` is meaningful, otherwise use the fallback.
#[inline]
fn safe_direction(v: Vector3<f64>, len: f64, fallback: &Vector3<f64>) -> Vector3<f64> {
    if len > 1e-12 {
        v / len
    } else {
        *fallback
    }
}

fn any_perpendicular(v: &Vector3<f64>) -> Vector3<f64> {
    let candidate = if v.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    let perp = v.cross(&candidate);
    if perp.norm_squared() > 1e-30 {
        perp.normalize()
    } else {
        Vector3::x()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-10
    }

    #[test]
    fn test_point_above_triangle_interior() {
        let result = point_triangle_distance(
            &Point3::new(0.25, 0.25, 2.0),
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
        );
        assert!(approx_eq(result.distance, 2.0));
        assert!(approx_eq(result.weights[0], 0.5));
        assert!(approx_eq(result.weights[1], 0.25));
        assert!(approx_eq(result.weights[2], 0.25));
        assert!(approx_eq(result.normal.z, 1.0));
    }

    #[test]
    fn test_point_closest_to_vertex() {
        let result = point_triangle_distance(
            &Point3::new(-1.0, -1.0, 0.0),
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
        );
        assert!(approx_eq(result.distance, 2.0_f64.sqrt()));
        assert!(approx_eq(result.weights[0], 1.0));
    }

    #[test]
    fn test_point_closest_to_edge() {
        let result = point_triangle_distance(
            &Point3::new(0.5, -1.0, 0.0),
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
        );
        assert!(approx_eq(result.distance, 1.0));
        assert!(approx_eq(result.weights[0], 0.5));
        assert!(approx_eq(result.weights[1], 0.5));
        assert!(approx_eq(result.weights[2], 0.0));
    }

    #[test]
    fn test_degenerate_triangle_distance() {
        // Collinear triangle: distance must still be finite and sensible.
        let result = point_triangle_distance(
            &Point3::new(0.5, 1.0, 0.0),
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(2.0, 0.0, 0.0),
        );
        assert!(approx_eq(result.distance, 1.0));
    }

    #[test]
    fn test_crossing_edges() {
        let result = edge_edge_distance(
            &Point3::new(-1.0, 0.0, 1.0),
            &Point3::new(1.0, 0.0, 1.0),
            &Point3::new(0.0, -1.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
        );
        assert!(approx_eq(result.distance, 1.0));
        assert!(approx_eq(result.w_a, 0.5));
        assert!(approx_eq(result.w_c, 0.5));
        // Normal points from the second edge toward the first (+z).
        assert!(approx_eq(result.normal.z, 1.0));
    }

    #[test]
    fn test_parallel_edges() {
        let result = edge_edge_distance(
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
            &Point3::new(1.0, 1.0, 0.0),
        );
        assert!(approx_eq(result.distance, 1.0));
    }

    #[test]
    fn test_endpoint_closest() {
        let result = edge_edge_distance(
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(2.0, 0.0, 0.0),
            &Point3::new(3.0, 0.0, 0.0),
        );
        assert!(approx_eq(result.distance, 1.0));
        assert!(approx_eq(result.w_a, 0.0));
        assert!(approx_eq(result.w_c, 1.0));
    }

    #[test]
    fn test_segment_pierces_triangle() {
        assert!(segment_triangle_intersection(
            &Point3::new(0.25, 0.25, -1.0),
            &Point3::new(0.25, 0.25, 1.0),
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
            false,
        ));
    }

    #[test]
    fn test_segment_misses_triangle() {
        assert!(!segment_triangle_intersection(
            &Point3::new(2.0, 2.0, -1.0),
            &Point3::new(2.0, 2.0, 1.0),
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
            false,
        ));
    }

    #[test]
    fn test_segment_on_one_side() {
        assert!(!segment_triangle_intersection(
            &Point3::new(0.25, 0.25, 1.0),
            &Point3::new(0.25, 0.25, 2.0),
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
            false,
        ));
    }

    #[test]
    fn test_coplanar_segment_follows_flag() {
        let e0 = Point3::new(0.1, 0.1, 0.0);
        let e1 = Point3::new(0.5, 0.5, 0.0);
        let t0 = Point3::new(0.0, 0.0, 0.0);
        let t1 = Point3::new(1.0, 0.0, 0.0);
        let t2 = Point3::new(0.0, 1.0, 0.0);
        assert!(segment_triangle_intersection(&e0, &e1, &t0, &t1, &t2, true));
        assert!(!segment_triangle_intersection(&e0, &e1, &t0, &t1, &t2, false));
    }
}
