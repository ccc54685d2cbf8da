//! Orientation predicates.
//!
//! Sign-of-determinant tests with a conservative floating-point error bound.
//! When the determinant magnitude falls inside the bound the result is
//! [`Orientation::Degenerate`], and callers must treat that outcome as "maybe
//! intersecting". This keeps the tracker safe in the presence of coplanar and
//! collinear configurations without an exact-arithmetic dependency.

use nalgebra::Point3;

/// Relative error bound on the 3x3 determinant. Each of the six terms carries
/// a handful of rounding errors; 16 ulps of headroom covers them all.
const ORIENT3D_ERR: f64 = 16.0 * f64::EPSILON;

/// Outcome of an orientation test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// `d` lies on the positive side of the plane through `a`, `b`, `c`.
    Positive,
    /// `d` lies on the negative side.
    Negative,
    /// Too close to the plane to decide in floating point.
    Degenerate,
}

/// Which side of the plane through `a`, `b`, `c` does `d` lie on?
///
/// Positive means `d` sees `a`, `b`, `c` in counter-clockwise order (the
/// tetrahedron `a b c d` has positive signed volume).
pub fn orient3d(
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
    d: &Point3<f64>,
) -> Orientation {
    let u = b - a;
    let v = c - a;
    let w = d - a;

    // Expanded determinant, with the sum of term magnitudes as the error scale.
    let t0 = u.x * (v.y * w.z - v.z * w.y);
    let t1 = u.y * (v.z * w.x - v.x * w.z);
    let t2 = u.z * (v.x * w.y - v.y * w.x);

    let det = t0 + t1 + t2;
    let scale = (u.x.abs() * (v.y.abs() * w.z.abs() + v.z.abs() * w.y.abs()))
        + (u.y.abs() * (v.z.abs() * w.x.abs() + v.x.abs() * w.z.abs()))
        + (u.z.abs() * (v.x.abs() * w.y.abs() + v.y.abs() * w.x.abs()));

    if det.abs() <= ORIENT3D_ERR * scale {
        Orientation::Degenerate
    } else if det > 0.0 {
        Orientation::Positive
    } else {
        Orientation::Negative
    }
}

/// Signed volume of the tetrahedron `a b c d`.
#[inline]
pub fn signed_tet_volume(
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
    d: &Point3<f64>,
) -> f64 {
    let u = b - a;
    let v = c - a;
    let w = d - a;
    u.cross(&v).dot(&w) / 6.0
}
