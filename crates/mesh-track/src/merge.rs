//! Sheet merging.
//!
//! When two facing sheets drift within `merge_proximity_epsilon` of each
//! other, a pair of nearby edges is zipped: the four triangles around the two
//! edges are removed, leaving two quad holes, and a tube of eight triangles
//! bridges them. The tube is only committed when none of its triangles would
//! intersect the mesh, so the merged surface stays intersection-free.

use nalgebra::Vector3;
use tracing::debug;

use mesh_collide::edge_edge_distance;

use crate::events::RemeshEvent;
use crate::pinch::proposed_triangles_intersect;
use crate::pipeline::CollisionPipeline;
use crate::surface::DynamicSurface;

/// Zips together nearby sheets.
#[derive(Debug, Clone)]
pub struct MeshMerger {
    pub merge_proximity_epsilon: f64,
}

impl MeshMerger {
    /// Merge every edge pair closer than the threshold, nearest first.
    /// Returns the number of zips committed.
    pub fn process(
        &self,
        surf: &mut DynamicSurface,
        pipeline: &mut CollisionPipeline,
        events: &mut Vec<RemeshEvent>,
    ) -> usize {
        let mut candidates: Vec<(usize, usize, f64)> = Vec::new();
        for (e, edge) in surf.mesh.live_edges() {
            if surf.edge_is_solid(e) {
                continue;
            }
            let bounds = surf
                .edge_static_bounds(e)
                .expanded(self.merge_proximity_epsilon);
            for other in surf
                .broad_phase
                .potential_edge_collisions(&bounds, true, true)
            {
                if other <= e || !surf.mesh.edge_is_live(other) {
                    continue;
                }
                let other_edge = surf.mesh.edge(other);
                if edge.contains(&other_edge[0]) || edge.contains(&other_edge[1]) {
                    continue;
                }
                let q = edge_edge_distance(
                    &surf.position(edge[0]),
                    &surf.position(edge[1]),
                    &surf.position(other_edge[0]),
                    &surf.position(other_edge[1]),
                );
                if q.distance < self.merge_proximity_epsilon {
                    candidates.push((e, other, q.distance));
                }
            }
        }
        candidates.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut merges = 0;
        for (e0, e1, _) in candidates {
            if !surf.mesh.edge_is_live(e0) || !surf.mesh.edge_is_live(e1) {
                continue;
            }
            if self.zip_edge_pair(surf, pipeline, e0, e1, events) {
                merges += 1;
            }
        }

        if merges > 0 {
            debug!(merges, "merge pass");
        }
        merges
    }

    /// Zip one edge pair. Returns whether the merge was committed.
    pub fn zip_edge_pair(
        &self,
        surf: &mut DynamicSurface,
        pipeline: &mut CollisionPipeline,
        e0: usize,
        e1: usize,
        events: &mut Vec<RemeshEvent>,
    ) -> bool {
        let Some(hole0) = HoleLoop::around(surf, e0) else {
            return false;
        };
        let Some(hole1) = HoleLoop::around(surf, e1) else {
            return false;
        };

        // The neighbourhoods must be disjoint: shared vertices would make the
        // tube degenerate.
        if hole0.cycle.iter().any(|v| hole1.cycle.contains(v)) {
            return false;
        }

        // The sheets must face each other: opposed normals, each pointing
        // toward the other edge.
        let n0 = hole0.average_normal(surf);
        let n1 = hole1.average_normal(surf);
        let offset = hole1.midpoint(surf) - hole0.midpoint(surf);
        if n0.dot(&n1) > 0.0 || n0.dot(&offset) < 0.0 || n1.dot(&offset) > 0.0 {
            return false;
        }

        let tube = hole0.tube_to(&hole1, surf);

        // Prove the tube clean against the mesh and against itself before
        // touching anything.
        if surf.collision_safety {
            for (i, &tri) in tube.iter().enumerate() {
                if pipeline.triangle_introduces_intersection(surf, tri) {
                    return false;
                }
                for &other in &tube[(i + 1)..] {
                    if proposed_triangles_intersect(surf, tri, other) {
                        return false;
                    }
                }
            }
        }

        for t in hole0.triangles.iter().chain(&hole1.triangles) {
            surf.remove_triangle(*t);
        }
        for &tri in &tube {
            surf.add_triangle(tri);
        }

        events.push(RemeshEvent::SheetsMerged {
            edge0: hole0.edge,
            edge1: hole1.edge,
        });
        true
    }
}

/// The quad hole left by removing the two triangles around an interior edge.
///
/// `cycle` is the hole boundary `[a, u, b, w]` in the orientation induced by
/// the surviving surface, where `(a, b)` is the edge and `u`, `w` are the
/// opposite vertices of its two triangles.
struct HoleLoop {
    edge: [usize; 2],
    cycle: [usize; 4],
    triangles: [usize; 2],
}

impl HoleLoop {
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
        let u = third(t0)?;
        let w = third(t1)?;
        if u == w {
            return None;
        }

        Some(Self {
            edge: [a, b],
            cycle: [a, u, b, w],
            triangles: [t0, t1],
        })
    }

    fn average_normal(&self, surf: &DynamicSurface) -> Vector3<f64> {
        let n = surf.triangle_normal_scaled(self.triangles[0])
            + surf.triangle_normal_scaled(self.triangles[1]);
        let len = n.norm();
        if len > 1e-30 {
            n / len
        } else {
            Vector3::zeros()
        }
    }

    fn midpoint(&self, surf: &DynamicSurface) -> Vector3<f64> {
        0.5 * (surf.position(self.edge[0]).coords + surf.position(self.edge[1]).coords)
    }

    /// The eight bridging triangles between this hole and `other`.
    ///
    /// The near rim runs along this hole's cycle reversed (so every directed
    /// tube edge pairs with the surviving surface), the far rim along
    /// `other`'s cycle forward, and the two rims are aligned by the rotation
    /// minimizing total corner distance.
    fn tube_to(&self, other: &HoleLoop, surf: &DynamicSurface) -> Vec<[usize; 3]> {
        let rim0 = [self.cycle[0], self.cycle[3], self.cycle[2], self.cycle[1]];
        let rim1 = other.cycle;

        let mut best_offset = 0usize;
        let mut best_cost = f64::INFINITY;
        for offset in 0..4 {
            let cost: f64 = (0..4)
                .map(|k| {
                    let p0 = surf.position(rim0[k]);
                    let p1 = surf.position(rim1[(offset + k) % 4]);
                    (p1 - p0).norm()
                })
                .sum();
            if cost < best_cost {
                best_cost = cost;
                best_offset = offset;
            }
        }

        let far = |k: usize| rim1[(best_offset + k) % 4];
        let mut tube = Vec::with_capacity(8);
        for k in 0..4 {
            let r0 = rim0[k];
            let r1 = rim0[(k + 1) % 4];
            let s0 = far(k);
            let s1 = far(k + 1);
            tube.push([r0, r1, s0]);
            tube.push([r1, s1, s0]);
        }
        tube
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    /// Two quad patches facing each other across a small gap. Each carries a
    /// little per-vertex relief so no configuration is exactly coplanar (the
    /// conservative degeneracy rule would otherwise veto the zip).
    fn facing_patches(gap: f64) -> DynamicSurface {
        let mut vertices = Vec::new();
        // Lower patch near z = 0, wound so normals point up (+z).
        vertices.push(Point3::new(0.0, 0.0, 0.0)); // 0
        vertices.push(Point3::new(1.0, 0.0, 0.0015)); // 1
        vertices.push(Point3::new(1.0, 1.0, -0.001)); // 2
        vertices.push(Point3::new(0.0, 1.0, 0.002)); // 3
        // Upper patch near z = gap, shifted slightly in the plane, wound so
        // normals point down (-z).
        vertices.push(Point3::new(0.007, 0.011, gap + 0.001)); // 4
        vertices.push(Point3::new(1.007, 0.011, gap - 0.0005)); // 5
        vertices.push(Point3::new(1.007, 1.011, gap + 0.0015)); // 6
        vertices.push(Point3::new(0.007, 1.011, gap + 0.002)); // 7

        DynamicSurface::new(
            vertices,
            &[[0, 1, 2], [0, 2, 3], [4, 6, 5], [4, 7, 6]],
            vec![1.0; 8],
            1e-4,
            1e-2,
        )
        .unwrap()
    }

    #[test]
    fn test_zip_connects_sheets() {
        let mut surf = facing_patches(5e-3);
        surf.rebuild_broad_phase(false).unwrap();
        let mut pipeline = CollisionPipeline::new(0.0, 1);
        let mut events = Vec::new();

        assert_eq!(surf.mesh.num_connected_components(), 2);

        let merger = MeshMerger {
            merge_proximity_epsilon: 1e-2,
        };
        let merges = merger.process(&mut surf, &mut pipeline, &mut events);

        assert_eq!(merges, 1);
        assert_eq!(surf.mesh.num_connected_components(), 1);
        // Four triangles replaced by eight.
        assert_eq!(surf.num_triangles(), 8);
        surf.mesh.audit_connectivity(false).unwrap();
        pipeline
            .assert_mesh_is_intersection_free(&surf, false)
            .unwrap();
        assert!(matches!(events[0], RemeshEvent::SheetsMerged { .. }));
    }

    #[test]
    fn test_distant_sheets_not_merged() {
        let mut surf = facing_patches(0.5);
        surf.rebuild_broad_phase(false).unwrap();
        let mut pipeline = CollisionPipeline::new(0.0, 1);
        let mut events = Vec::new();

        let merger = MeshMerger {
            merge_proximity_epsilon: 1e-2,
        };
        assert_eq!(merger.process(&mut surf, &mut pipeline, &mut events), 0);
        assert_eq!(surf.mesh.num_connected_components(), 2);
    }

    #[test]
    fn test_back_to_back_sheets_not_merged() {
        // Same geometry but the upper patch faces away (+z): normals are not
        // opposed, so zipping must refuse.
        let mut surf = DynamicSurface::new(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(0.0, 0.0, 5e-3),
                Point3::new(1.0, 0.0, 5e-3),
                Point3::new(1.0, 1.0, 5e-3),
                Point3::new(0.0, 1.0, 5e-3),
            ],
            &[[0, 1, 2], [0, 2, 3], [4, 5, 6], [4, 6, 7]],
            vec![1.0; 8],
            1e-4,
            1e-2,
        )
        .unwrap();
        surf.rebuild_broad_phase(false).unwrap();
        let mut pipeline = CollisionPipeline::new(0.0, 1);
        let mut events = Vec::new();

        let merger = MeshMerger {
            merge_proximity_epsilon: 1e-2,
        };
        assert_eq!(merger.process(&mut surf, &mut pipeline, &mut events), 0);
    }
}
