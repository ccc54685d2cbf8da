//! Edge collapsing.
//!
//! Edges shorter than the lower bound collapse onto one endpoint (or the
//! midpoint). A collapse is rejected when it would invert a surviving
//! triangle, change the local volume too much, fuse regions of the mesh that
//! only touch at the edge's one-ring, or sweep a primitive through another
//! during the pseudo-motion of the two endpoints onto their merged position.

use nalgebra::Point3;
use tracing::debug;

use mesh_collide::signed_tet_volume;

use crate::events::RemeshEvent;
use crate::pipeline::CollisionPipeline;
use crate::quality::curvature_scaled_length;
use crate::surface::DynamicSurface;

/// Surviving triangles flatter than this area are treated as inverted.
const MIN_TRIANGLE_AREA: f64 = 1e-14;

/// Collapses under-short edges.
#[derive(Debug, Clone)]
pub struct EdgeCollapser {
    pub min_edge_length: f64,
    pub max_volume_change: f64,
    pub min_curvature_multiplier: f64,
    pub max_curvature_multiplier: f64,
}

impl EdgeCollapser {
    /// Collapse every edge whose scaled length is under the bound, shortest
    /// first. Returns the number of collapses committed.
    pub fn process(
        &self,
        surf: &mut DynamicSurface,
        pipeline: &mut CollisionPipeline,
        events: &mut Vec<RemeshEvent>,
    ) -> usize {
        let mut candidates: Vec<(usize, f64)> = surf
            .mesh
            .live_edges()
            .map(|(e, edge)| {
                let length = curvature_scaled_length(
                    surf,
                    edge[0],
                    edge[1],
                    self.min_curvature_multiplier,
                    self.max_curvature_multiplier,
                    2.0,
                );
                (e, length)
            })
            .filter(|&(_, length)| length < self.min_edge_length)
            .collect();
        candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut collapses = 0;
        for (e, _) in candidates {
            if !surf.mesh.edge_is_live(e) {
                continue;
            }
            let edge = surf.mesh.edge(e);
            let length = curvature_scaled_length(
                surf,
                edge[0],
                edge[1],
                self.min_curvature_multiplier,
                self.max_curvature_multiplier,
                2.0,
            );
            if length >= self.min_edge_length {
                continue;
            }
            if self.collapse_edge(surf, pipeline, e, events) {
                collapses += 1;
            }
        }

        if collapses > 0 {
            debug!(collapses, "edge collapse pass");
        }
        collapses
    }

    /// Collapse one edge. Returns whether the collapse was committed.
    pub fn collapse_edge(
        &self,
        surf: &mut DynamicSurface,
        pipeline: &mut CollisionPipeline,
        e: usize,
        events: &mut Vec<RemeshEvent>,
    ) -> bool {
        let edge = surf.mesh.edge(e);
        let [a, b] = edge;
        if surf.mesh.triangles_incident_to_edge(e).len() > 2 {
            return false;
        }
        if surf.vertex_is_solid(a) && surf.vertex_is_solid(b) {
            return false;
        }

        // A solid endpoint anchors the collapse; otherwise meet in the middle.
        let (kept, removed, target) = if surf.vertex_is_solid(a) {
            (a, b, surf.position(a))
        } else if surf.vertex_is_solid(b) {
            (b, a, surf.position(b))
        } else {
            let midpoint = Point3::from(
                0.5 * (surf.position(a).coords + surf.position(b).coords),
            );
            (a, b, midpoint)
        };

        if self.would_fuse_distinct_regions(surf, a, b, e) {
            return false;
        }
        if self.would_invert_triangles(surf, kept, removed, e, &target) {
            return false;
        }
        if self.volume_change(surf, kept, removed, &target) > self.max_volume_change {
            return false;
        }

        // Pseudo-motion safety: both endpoints travel to the merged position
        // with the rest of the mesh at rest. Contacts between the two merging
        // fans themselves are the point of the operation and are not counted.
        if surf.collision_safety {
            surf.set_newposition(kept, target);
            surf.set_newposition(removed, target);
            let collides = pipeline.motion_introduces_collision_excluding(
                surf,
                &[kept, removed],
                &[kept, removed],
            );
            surf.set_newposition(kept, surf.position(kept));
            surf.set_newposition(removed, surf.position(removed));
            if collides {
                return false;
            }
        }

        // Commit: drop the edge's triangles, re-point the removed vertex's
        // remaining fan at the kept vertex, then move the kept vertex.
        let edge_triangles: Vec<usize> =
            surf.mesh.triangles_incident_to_edge(e).to_vec();
        for t in edge_triangles {
            surf.remove_triangle(t);
        }

        let moved: Vec<[usize; 3]> = surf
            .mesh
            .triangles_incident_to_vertex(removed)
            .iter()
            .map(|&t| surf.mesh.triangle(t))
            .collect();
        surf.remove_vertex(removed);
        for tri in moved {
            let replacement = tri.map(|v| if v == removed { kept } else { v });
            surf.add_triangle(replacement);
        }

        surf.set_position(kept, target);
        surf.set_newposition(kept, target);
        surf.update_broad_phase_for_vertex(kept, true);

        events.push(RemeshEvent::EdgeCollapse {
            edge: [a, b],
            kept_vertex: kept,
            removed_vertex: removed,
        });
        true
    }

    /// Link condition: collapsing may only merge the two one-rings across the
    /// edge's opposite vertices. Any further shared neighbour means the edge
    /// bridges two regions that would be fused into a non-manifold junction.
    fn would_fuse_distinct_regions(
        &self,
        surf: &DynamicSurface,
        a: usize,
        b: usize,
        e: usize,
    ) -> bool {
        let neighbours = |v: usize| -> Vec<usize> {
            surf.mesh
                .edges_incident_to_vertex(v)
                .iter()
                .map(|&edge_index| {
                    let edge = surf.mesh.edge(edge_index);
                    if edge[0] == v {
                        edge[1]
                    } else {
                        edge[0]
                    }
                })
                .collect()
        };

        let from_a = neighbours(a);
        let from_b = neighbours(b);
        let shared = from_a.iter().filter(|v| from_b.contains(v)).count();

        let expected = surf.mesh.triangles_incident_to_edge(e).len();
        shared > expected
    }

    /// Would any surviving triangle flip its normal (or collapse to zero
    /// area) when its endpoint moves to `target`?
    fn would_invert_triangles(
        &self,
        surf: &DynamicSurface,
        kept: usize,
        removed: usize,
        e: usize,
        target: &Point3<f64>,
    ) -> bool {
        let edge_triangles = surf.mesh.triangles_incident_to_edge(e);

        for &moving in &[kept, removed] {
            for &t in surf.mesh.triangles_incident_to_vertex(moving) {
                if edge_triangles.contains(&t) {
                    continue;
                }
                let tri = surf.mesh.triangle(t);
                let old = [
                    surf.position(tri[0]),
                    surf.position(tri[1]),
                    surf.position(tri[2]),
                ];
                let new = [0, 1, 2].map(|i| {
                    if tri[i] == moving {
                        *target
                    } else {
                        old[i]
                    }
                });

                let old_normal = (old[1] - old[0]).cross(&(old[2] - old[0]));
                let new_normal = (new[1] - new[0]).cross(&(new[2] - new[0]));
                if new_normal.norm() * 0.5 < MIN_TRIANGLE_AREA {
                    return true;
                }
                if old_normal.dot(&new_normal) <= 0.0 {
                    return true;
                }
            }
        }
        false
    }

    /// Unsigned volume swept by the surviving triangles of both endpoints as
    /// they move onto `target`.
    fn volume_change(
        &self,
        surf: &DynamicSurface,
        kept: usize,
        removed: usize,
        target: &Point3<f64>,
    ) -> f64 {
        let mut total = 0.0;
        for &moving in &[kept, removed] {
            for &t in surf.mesh.triangles_incident_to_vertex(moving) {
                let tri = surf.mesh.triangle(t);
                total += signed_tet_volume(
                    &surf.position(tri[0]),
                    &surf.position(tri[1]),
                    &surf.position(tri[2]),
                    target,
                )
                .abs();
            }
        }
        total
    }
}
