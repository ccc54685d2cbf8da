//! Edge flipping.
//!
//! Flips the diagonal of a triangle pair when doing so brings vertex valences
//! closer to six and does not worsen the worst angle. Flips never move
//! geometry, so the safety check is purely static: the new diagonal and the
//! two replacement triangles must not cut the surrounding mesh.

use tracing::debug;

use crate::events::RemeshEvent;
use crate::pipeline::CollisionPipeline;
use crate::quality::min_triangle_angle;
use crate::surface::DynamicSurface;

/// Flips edges to improve valence regularity.
#[derive(Debug, Clone, Default)]
pub struct EdgeFlipper;

impl EdgeFlipper {
    /// Flip every edge that improves the valence deviation without hurting
    /// the minimum angle. Returns the number of flips committed.
    pub fn process(
        &self,
        surf: &mut DynamicSurface,
        pipeline: &mut CollisionPipeline,
        events: &mut Vec<RemeshEvent>,
    ) -> usize {
        let candidates: Vec<usize> = surf.mesh.live_edges().map(|(e, _)| e).collect();

        let mut flips = 0;
        for e in candidates {
            if !surf.mesh.edge_is_live(e) {
                continue;
            }
            if !self.flip_improves_mesh(surf, e) {
                continue;
            }
            if self.flip_edge(surf, pipeline, e, events).is_some() {
                flips += 1;
            }
        }

        if flips > 0 {
            debug!(flips, "edge flip pass");
        }
        flips
    }

    /// Would flipping `e` reduce the total deviation of the four involved
    /// valences from six, without making the local minimum angle worse?
    fn flip_improves_mesh(&self, surf: &DynamicSurface, e: usize) -> bool {
        let Some(quad) = FlipQuad::around(surf, e) else {
            return false;
        };

        let valence = |v: usize| surf.mesh.edges_incident_to_vertex(v).len() as i32;
        let deviation_now = (valence(quad.a) - 6).abs()
            + (valence(quad.b) - 6).abs()
            + (valence(quad.c) - 6).abs()
            + (valence(quad.d) - 6).abs();
        // The flip takes an edge from (a, b) and gives one to (c, d).
        let deviation_after = (valence(quad.a) - 1 - 6).abs()
            + (valence(quad.b) - 1 - 6).abs()
            + (valence(quad.c) + 1 - 6).abs()
            + (valence(quad.d) + 1 - 6).abs();
        if deviation_after >= deviation_now {
            return false;
        }

        quad.new_min_angle(surf) > quad.old_min_angle(surf)
    }

    /// Flip one edge unconditionally (subject to validity and collision
    /// safety). Returns the new edge's endpoints, or `None` when rejected.
    pub fn flip_edge(
        &self,
        surf: &mut DynamicSurface,
        pipeline: &mut CollisionPipeline,
        e: usize,
        events: &mut Vec<RemeshEvent>,
    ) -> Option<[usize; 2]> {
        let quad = FlipQuad::around(surf, e)?;
        if surf.edge_is_solid(e) {
            return None;
        }
        // The new diagonal must not already exist (would create a duplicate
        // edge) and the quad must be geometrically flippable.
        if surf.mesh.get_edge_index(quad.c, quad.d).is_some() {
            return None;
        }
        if !quad.is_convex(surf) {
            return None;
        }

        let new_triangles = quad.flipped_triangles();
        if surf.collision_safety
            && new_triangles
                .iter()
                .any(|&tri| pipeline.triangle_introduces_intersection(surf, tri))
        {
            return None;
        }

        surf.remove_triangle(quad.t0);
        surf.remove_triangle(quad.t1);
        for tri in new_triangles {
            surf.add_triangle(tri);
        }

        events.push(RemeshEvent::EdgeFlip {
            old_edge: [quad.a, quad.b],
            new_edge: [quad.c, quad.d],
        });
        Some([quad.c, quad.d])
    }
}

/// The two triangles around a flippable edge, oriented so `t0` lists the edge
/// as `a -> b` and `t1` as `b -> a`; `c` and `d` are their opposite vertices.
struct FlipQuad {
    a: usize,
    b: usize,
    c: usize,
    d: usize,
    t0: usize,
    t1: usize,
}

impl FlipQuad {
    fn around(surf: &DynamicSurface, e: usize) -> Option<Self> {
        if !surf.mesh.edge_is_live(e) {
            return None;
        }
        let incident = surf.mesh.triangles_incident_to_edge(e);
        if incident.len() != 2 {
            return None;
        }
        let edge = surf.mesh.edge(e);
        let (mut a, mut b) = (edge[0], edge[1]);
        let (mut t0, mut t1) = (incident[0], incident[1]);
        if !surf.mesh.triangle_contains_oriented_edge(t0, a, b) {
            std::mem::swap(&mut t0, &mut t1);
        }
        if !surf.mesh.triangle_contains_oriented_edge(t0, a, b) {
            // Inconsistent winding across the edge; leave it alone.
            std::mem::swap(&mut a, &mut b);
            if !surf.mesh.triangle_contains_oriented_edge(t0, a, b) {
                return None;
            }
        }
        if !surf.mesh.triangle_contains_oriented_edge(t1, b, a) {
            return None;
        }

        let third = |t: usize| -> Option<usize> {
            surf.mesh
                .triangle(t)
                .into_iter()
                .find(|&v| v != a && v != b)
        };
        let c = third(t0)?;
        let d = third(t1)?;
        if c == d {
            return None;
        }
        Some(Self { a, b, c, d, t0, t1 })
    }

    /// Replacement triangles; winding chosen so every boundary directed edge
    /// of the quad is preserved.
    fn flipped_triangles(&self) -> [[usize; 3]; 2] {
        [[self.a, self.d, self.c], [self.d, self.b, self.c]]
    }

    /// The new diagonal is only valid when `a` and `b` fall on opposite sides
    /// of it, i.e. the quad is convex at the diagonal.
    fn is_convex(&self, surf: &DynamicSurface) -> bool {
        let pa = surf.position(self.a);
        let pb = surf.position(self.b);
        let pc = surf.position(self.c);
        let pd = surf.position(self.d);

        let diagonal = pd - pc;
        let n1 = diagonal.cross(&(pa - pc));
        let n2 = diagonal.cross(&(pb - pc));
        n1.dot(&n2) < 0.0
    }

    fn old_min_angle(&self, surf: &DynamicSurface) -> f64 {
        let tri = |x: usize, y: usize, z: usize| {
            min_triangle_angle(&surf.position(x), &surf.position(y), &surf.position(z))
        };
        tri(self.a, self.b, self.c).min(tri(self.b, self.a, self.d))
    }

    fn new_min_angle(&self, surf: &DynamicSurface) -> f64 {
        let tri = |x: usize, y: usize, z: usize| {
            min_triangle_angle(&surf.position(x), &surf.position(y), &surf.position(z))
        };
        tri(self.a, self.d, self.c).min(tri(self.d, self.b, self.c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    /// A planar quad whose diagonal runs between the two far corners, so the
    /// flip yields the short diagonal.
    fn skewed_quad() -> DynamicSurface {
        DynamicSurface::new(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(2.0, 2.0, 0.0),
                Point3::new(2.5, 0.5, 0.0),
                Point3::new(-0.5, 1.5, 0.0),
            ],
            &[[0, 1, 2], [1, 0, 3]],
            vec![1.0; 4],
            1e-4,
            1e-4,
        )
        .unwrap()
    }

    #[test]
    fn test_flip_replaces_diagonal() {
        let mut surf = skewed_quad();
        let mut pipeline = CollisionPipeline::new(0.0, 1);
        let mut events = Vec::new();

        let diagonal = surf.mesh.get_edge_index(0, 1).unwrap();
        let new_edge = EdgeFlipper
            .flip_edge(&mut surf, &mut pipeline, diagonal, &mut events)
            .expect("flip must succeed");

        let mut sorted = new_edge;
        sorted.sort_unstable();
        assert_eq!(sorted, [2, 3]);
        assert!(surf.mesh.get_edge_index(0, 1).is_none());
        assert!(surf.mesh.get_edge_index(2, 3).is_some());
        assert_eq!(surf.num_triangles(), 2);
        surf.mesh.audit_connectivity(false).unwrap();
        pipeline
            .assert_mesh_is_intersection_free(&surf, false)
            .unwrap();
    }

    #[test]
    fn test_flip_twice_restores_edge_set() {
        let mut surf = skewed_quad();
        let mut pipeline = CollisionPipeline::new(0.0, 1);
        let mut events = Vec::new();

        let edges_before: Vec<[usize; 2]> = {
            let mut edges: Vec<[usize; 2]> = surf
                .mesh
                .live_edges()
                .map(|(_, mut edge)| {
                    edge.sort_unstable();
                    edge
                })
                .collect();
            edges.sort_unstable();
            edges
        };

        let diagonal = surf.mesh.get_edge_index(0, 1).unwrap();
        EdgeFlipper
            .flip_edge(&mut surf, &mut pipeline, diagonal, &mut events)
            .unwrap();
        let new_diagonal = surf.mesh.get_edge_index(2, 3).unwrap();
        EdgeFlipper
            .flip_edge(&mut surf, &mut pipeline, new_diagonal, &mut events)
            .unwrap();

        let mut edges_after: Vec<[usize; 2]> = surf
            .mesh
            .live_edges()
            .map(|(_, mut edge)| {
                edge.sort_unstable();
                edge
            })
            .collect();
        edges_after.sort_unstable();
        assert_eq!(edges_before, edges_after);
        surf.mesh.audit_connectivity(false).unwrap();
    }

    #[test]
    fn test_boundary_edge_not_flippable() {
        let mut surf = skewed_quad();
        let mut pipeline = CollisionPipeline::new(0.0, 1);
        let mut events = Vec::new();
        let boundary = surf.mesh.get_edge_index(0, 2).unwrap();
        assert!(EdgeFlipper
            .flip_edge(&mut surf, &mut pipeline, boundary, &mut events)
            .is_none());
    }

    #[test]
    fn test_nonconvex_quad_rejected() {
        // Dart-shaped quad: both edge endpoints lie on the same side of the
        // would-be diagonal, so flipping would fold the surface over itself.
        let mut surf = DynamicSurface::new(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(2.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
                Point3::new(1.8, 0.9, 0.0),
            ],
            &[[0, 1, 2], [1, 0, 3]],
            vec![1.0; 4],
            1e-4,
            1e-4,
        )
        .unwrap();
        surf.rebuild_broad_phase(false).unwrap();
        let mut pipeline = CollisionPipeline::new(0.0, 1);
        let mut events = Vec::new();
        let diagonal = surf.mesh.get_edge_index(0, 1).unwrap();
        assert!(EdgeFlipper
            .flip_edge(&mut surf, &mut pipeline, diagonal, &mut events)
            .is_none());
    }
}
