//! Continuous collision detection over one linear step.
//!
//! Both tests answer the same question: with every vertex moving on a straight
//! line from its start to its end position over `t ∈ [0, 1]`, do the two
//! primitives touch? The four vertices are coplanar at any contact time, so
//! contact times are roots of the cubic coplanarity polynomial; each root in
//! range is then checked for actual contact by a static proximity query at
//! that instant. Coplanar sweeps (vanishing cubic) are resolved conservatively by
//! sampling, so a degenerate configuration is reported as a collision rather
//! than missed.

use nalgebra::{Point3, Vector3};

use crate::queries::{edge_edge_distance, point_triangle_distance};

/// Barycentric slack when validating a contact at a coplanarity root.
const CONTACT_TOLERANCE: f64 = 1e-6;

/// A continuous collision, reported at the earliest contact time.
#[derive(Debug, Clone, Copy)]
pub struct CcdHit {
    /// Normalized time of impact in [0, 1].
    pub time: f64,
    /// Contact normal, oriented so the pre-impact relative displacement along
    /// it is non-positive (the primitives approach along `-normal`).
    pub normal: Vector3<f64>,
    /// Contact weights for the four simplex vertices. Point-triangle:
    /// `[1, s0, s1, s2]`. Edge-edge: `[w_a, 1 - w_a, w_c, 1 - w_c]`.
    pub weights: [f64; 4],
    /// Relative displacement along `normal` over the whole step (approach
    /// velocity times dt). Non-positive by construction.
    pub relative_displacement: f64,
}

/// Does moving point `p` strike moving triangle `(a, b, c)` during the step?
///
/// `*0` are positions at the start of the step, `*1` at the end.
#[allow(clippy::too_many_arguments)]
pub fn point_triangle_collision(
    p0: &Point3<f64>,
    p1: &Point3<f64>,
    a0: &Point3<f64>,
    a1: &Point3<f64>,
    b0: &Point3<f64>,
    b1: &Point3<f64>,
    c0: &Point3<f64>,
    c1: &Point3<f64>,
) -> Option<CcdHit> {
    let scale = configuration_scale(&[p0, p1, a0, a1, b0, b1, c0, c1]);
    let distance_tol = CONTACT_TOLERANCE * (1.0 + scale);

    let check = |t: f64| -> Option<([f64; 4], Vector3<f64>)> {
        let p = lerp(p0, p1, t);
        let a = lerp(a0, a1, t);
        let b = lerp(b0, b1, t);
        let c = lerp(c0, c1, t);
        let q = point_triangle_distance(&p, &a, &b, &c);
        if q.distance <= distance_tol {
            let tri_normal = (b - a).cross(&(c - a));
            let normal = if tri_normal.norm_squared() > 1e-30 {
                tri_normal.normalize()
            } else {
                q.normal
            };
            Some(([1.0, q.weights[0], q.weights[1], q.weights[2]], normal))
        } else {
            None
        }
    };

    let roots = coplanarity_roots(
        &(b0 - a0),
        &(b1 - a1),
        &(c0 - a0),
        &(c1 - a1),
        &(p0 - a0),
        &(p1 - a1),
        scale,
    );

    for t in candidate_times(&roots) {
        if let Some((weights, normal)) = check(t) {
            let displacement = (p1 - p0)
                - ((a1 - a0) * weights[1] + (b1 - b0) * weights[2] + (c1 - c0) * weights[3]);
            return Some(orient_hit(t, normal, weights, displacement));
        }
    }

    None
}

/// Does moving segment `(a, b)` strike moving segment `(c, d)` during the step?
#[allow(clippy::too_many_arguments)]
pub fn segment_segment_collision(
    a0: &Point3<f64>,
    a1: &Point3<f64>,
    b0: &Point3<f64>,
    b1: &Point3<f64>,
    c0: &Point3<f64>,
    c1: &Point3<f64>,
    d0: &Point3<f64>,
    d1: &Point3<f64>,
) -> Option<CcdHit> {
    let scale = configuration_scale(&[a0, a1, b0, b1, c0, c1, d0, d1]);
    let distance_tol = CONTACT_TOLERANCE * (1.0 + scale);

    let check = |t: f64| -> Option<([f64; 4], Vector3<f64>)> {
        let a = lerp(a0, a1, t);
        let b = lerp(b0, b1, t);
        let c = lerp(c0, c1, t);
        let d = lerp(d0, d1, t);
        let q = edge_edge_distance(&a, &b, &c, &d);
        if q.distance <= distance_tol {
            let cross = (b - a).cross(&(d - c));
            let normal = if cross.norm_squared() > 1e-30 {
                cross.normalize()
            } else {
                q.normal
            };
            Some(([q.w_a, 1.0 - q.w_a, q.w_c, 1.0 - q.w_c], normal))
        } else {
            None
        }
    };

    let roots = coplanarity_roots(
        &(b0 - a0),
        &(b1 - a1),
        &(c0 - a0),
        &(c1 - a1),
        &(d0 - a0),
        &(d1 - a1),
        scale,
    );

    for t in candidate_times(&roots) {
        if let Some((weights, normal)) = check(t) {
            let displacement = ((a1 - a0) * weights[0] + (b1 - b0) * weights[1])
                - ((c1 - c0) * weights[2] + (d1 - d0) * weights[3]);
            return Some(orient_hit(t, normal, weights, displacement));
        }
    }

    None
}

/// Orient the normal so the relative displacement along it is non-positive.
fn orient_hit(
    time: f64,
    normal: Vector3<f64>,
    weights: [f64; 4],
    displacement: Vector3<f64>,
) -> CcdHit {
    let rel = normal.dot(&displacement);
    let (normal, relative_displacement) = if rel > 0.0 { (-normal, -rel) } else { (normal, rel) };
    CcdHit {
        time,
        normal,
        weights,
        relative_displacement,
    }
}

/// Times at which the three spanning vectors become coplanar, in [0, 1].
///
/// The vectors are linear in `t`, so the scalar triple product is cubic. An
/// empty polynomial (coplanar throughout) returns the conservative sample set.
fn coplanarity_roots(
    u0: &Vector3<f64>,
    u1: &Vector3<f64>,
    v0: &Vector3<f64>,
    v1: &Vector3<f64>,
    w0: &Vector3<f64>,
    w1: &Vector3<f64>,
    scale: f64,
) -> Vec<f64> {
    let du = u1 - u0;
    let dv = v1 - v0;
    let dw = w1 - w0;

    let uv0 = u0.cross(v0);
    let uv1 = u0.cross(&dv) + du.cross(v0);
    let uv2 = du.cross(&dv);

    let c0 = uv0.dot(w0);
    let c1 = uv0.dot(&dw) + uv1.dot(w0);
    let c2 = uv1.dot(&dw) + uv2.dot(w0);
    let c3 = uv2.dot(&dw);

    let magnitude = c0.abs().max(c1.abs()).max(c2.abs()).max(c3.abs());
    let vanishing = 1e-14 * (1.0 + scale * scale * scale);
    if magnitude <= vanishing {
        // Coplanar for the whole step. Sample; every sample gets contact-checked.
        return vec![0.0, 0.5, 1.0];
    }

    polynomial_roots_in_unit_interval(c3, c2, c1, c0)
}

/// Real roots of `c3 t^3 + c2 t^2 + c1 t + c0` in [0, 1], ascending.
///
/// Splits [0, 1] at the critical points of the cubic and bisects each
/// monotonic piece; robust against every coefficient degeneracy.
fn polynomial_roots_in_unit_interval(c3: f64, c2: f64, c1: f64, c0: f64) -> Vec<f64> {
    let f = |t: f64| ((c3 * t + c2) * t + c1) * t + c0;

    // Breakpoints: interval ends plus the real critical points of f.
    let mut breaks = vec![0.0];
    let da = 3.0 * c3;
    let db = 2.0 * c2;
    let dc = c1;
    if da.abs() > 1e-300 {
        let disc = db * db - 4.0 * da * dc;
        if disc >= 0.0 {
            let sq = disc.sqrt();
            for root in [(-db - sq) / (2.0 * da), (-db + sq) / (2.0 * da)] {
                if root > 0.0 && root < 1.0 {
                    breaks.push(root);
                }
            }
        }
    } else if db.abs() > 1e-300 {
        let root = -dc / db;
        if root > 0.0 && root < 1.0 {
            breaks.push(root);
        }
    }
    breaks.push(1.0);
    breaks.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let mut roots = Vec::new();
    let near_zero = 1e-14 * (c0.abs().max(c1.abs()).max(c2.abs()).max(c3.abs()) + 1.0);

    for pair in breaks.windows(2) {
        let (mut lo, mut hi) = (pair[0], pair[1]);
        let (flo, fhi) = (f(lo), f(hi));

        if flo.abs() <= near_zero {
            push_root(&mut roots, lo);
            continue;
        }
        if fhi.abs() <= near_zero {
            push_root(&mut roots, hi);
            continue;
        }
        if flo.signum() == fhi.signum() {
            continue;
        }

        for _ in 0..80 {
            let mid = 0.5 * (lo + hi);
            let fmid = f(mid);
            if fmid == 0.0 {
                lo = mid;
                hi = mid;
                break;
            }
            if fmid.signum() == flo.signum() {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        push_root(&mut roots, 0.5 * (lo + hi));
    }

    roots
}

fn push_root(roots: &mut Vec<f64>, t: f64) {
    let t = t.clamp(0.0, 1.0);
    if !roots.iter().any(|&r| (r - t).abs() < 1e-12) {
        roots.push(t);
    }
}

/// Contact times to test: each coplanarity root, earliest first, and the end
/// of the step (a contact exactly at `t = 1` must not be missed).
fn candidate_times(roots: &[f64]) -> Vec<f64> {
    let mut times = roots.to_vec();
    if !times.iter().any(|&t| (t - 1.0).abs() < 1e-12) {
        times.push(1.0);
    }
    times.sort_by(|a, b| a.partial_cmp(b).unwrap());
    times
}

#[inline]
fn lerp(p0: &Point3<f64>, p1: &Point3<f64>, t: f64) -> Point3<f64> {
    p0 + (p1 - p0) * t
}

fn configuration_scale(points: &[&Point3<f64>; 8]) -> f64 {
    let mut scale: f64 = 0.0;
    for p in points {
        scale = scale
            .max(p.x.abs())
            .max(p.y.abs())
            .max(p.z.abs());
    }
    scale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_through_triangle() {
        let tri = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let hit = point_triangle_collision(
            &Point3::new(0.25, 0.25, 1.0),
            &Point3::new(0.25, 0.25, -1.0),
            &tri[0],
            &tri[0],
            &tri[1],
            &tri[1],
            &tri[2],
            &tri[2],
        )
        .expect("head-on crossing must collide");

        assert!((hit.time - 0.5).abs() < 1e-6);
        assert!(hit.relative_displacement <= 0.0);
        assert!((hit.relative_displacement.abs() - 2.0).abs() < 1e-6);
        // Approach is along -normal.
        assert!(hit.normal.z > 0.9);
    }

    #[test]
    fn test_point_passes_outside_triangle() {
        let tri = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let hit = point_triangle_collision(
            &Point3::new(2.0, 2.0, 1.0),
            &Point3::new(2.0, 2.0, -1.0),
            &tri[0],
            &tri[0],
            &tri[1],
            &tri[1],
            &tri[2],
            &tri[2],
        );
        assert!(hit.is_none());
    }

    #[test]
    fn test_point_moving_away() {
        let tri = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let hit = point_triangle_collision(
            &Point3::new(0.25, 0.25, 0.5),
            &Point3::new(0.25, 0.25, 2.0),
            &tri[0],
            &tri[0],
            &tri[1],
            &tri[1],
            &tri[2],
            &tri[2],
        );
        assert!(hit.is_none());
    }

    #[test]
    fn test_point_resting_on_triangle_is_conservative() {
        // No motion and already touching: the sweep is degenerate, so the
        // query must report contact rather than miss it.
        let tri = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let p = Point3::new(0.25, 0.25, 0.0);
        let hit = point_triangle_collision(
            &p, &p, &tri[0], &tri[0], &tri[1], &tri[1], &tri[2], &tri[2],
        );
        assert!(hit.is_some());
    }

    #[test]
    fn test_crossing_edges_collide() {
        let hit = segment_segment_collision(
            &Point3::new(-1.0, 0.0, 1.0),
            &Point3::new(-1.0, 0.0, -1.0),
            &Point3::new(1.0, 0.0, 1.0),
            &Point3::new(1.0, 0.0, -1.0),
            &Point3::new(0.0, -1.0, 0.0),
            &Point3::new(0.0, -1.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
        )
        .expect("edge sweeping over a crossing edge must collide");

        assert!((hit.time - 0.5).abs() < 1e-6);
        assert!((hit.weights[0] - 0.5).abs() < 1e-6);
        assert!(hit.relative_displacement <= 0.0);
    }

    #[test]
    fn test_parallel_edges_missing() {
        let hit = segment_segment_collision(
            &Point3::new(0.0, 0.0, 1.0),
            &Point3::new(0.0, 0.0, 2.0),
            &Point3::new(1.0, 0.0, 1.0),
            &Point3::new(1.0, 0.0, 2.0),
            &Point3::new(0.0, 1.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
            &Point3::new(1.0, 1.0, 0.0),
            &Point3::new(1.0, 1.0, 0.0),
        );
        assert!(hit.is_none());
    }

    #[test]
    fn test_contact_exactly_at_step_end() {
        let tri = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let hit = point_triangle_collision(
            &Point3::new(0.25, 0.25, 1.0),
            &Point3::new(0.25, 0.25, 0.0),
            &tri[0],
            &tri[0],
            &tri[1],
            &tri[1],
            &tri[2],
            &tri[2],
        );
        assert!(hit.is_some());
    }

    #[test]
    fn test_cubic_roots() {
        // (t - 0.25)(t - 0.5)(t - 0.75) = t^3 - 1.5 t^2 + 0.6875 t - 0.09375
        let roots = polynomial_roots_in_unit_interval(1.0, -1.5, 0.6875, -0.09375);
        assert_eq!(roots.len(), 3);
        assert!((roots[0] - 0.25).abs() < 1e-9);
        assert!((roots[1] - 0.5).abs() < 1e-9);
        assert!((roots[2] - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_linear_roots() {
        let roots = polynomial_roots_in_unit_interval(0.0, 0.0, 2.0, -1.0);
        assert_eq!(roots.len(), 1);
        assert!((roots[0] - 0.5).abs() < 1e-9);
    }
}
