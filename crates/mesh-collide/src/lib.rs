//! Geometry kernel for robust surface tracking.
//!
//! This crate provides the low-level geometric machinery used by `mesh-track`:
//!
//! - **Bounding boxes**: axis-aligned boxes with union/expand/overlap
//! - **Predicates**: sign-of-determinant orientation tests with an explicit
//!   degenerate outcome, so callers can treat uncertainty conservatively
//! - **Proximity queries**: point-triangle and edge-edge distance with
//!   barycentric weights and contact normals
//! - **Continuous collision**: does a moving point hit a moving triangle (or a
//!   moving edge another moving edge) during one linear step?
//! - **Acceleration grid**: a uniform hash grid over element bounding boxes
//!
//! All geometry is `f64` throughout. Degenerate configurations (coplanar
//! sweeps, collinear segments, zero-area triangles) are resolved in favour of
//! reporting a collision, never against it.

mod aabb;
mod ccd;
mod grid;
mod predicates;
mod queries;

pub use aabb::Aabb;
pub use ccd::{point_triangle_collision, segment_segment_collision, CcdHit};
pub use grid::{AccelerationGrid, MismatchedLengths};
pub use predicates::{orient3d, signed_tet_volume, Orientation};
pub use queries::{
    edge_edge_distance, point_triangle_distance, segment_triangle_intersection,
    EdgeEdgeDistance, PointTriangleDistance,
};
