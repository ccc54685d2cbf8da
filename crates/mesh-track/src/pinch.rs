//! Vertex pinching.
//!
//! A vertex whose incident triangles split into several face-connected
//! components is a pinch point: the surface touches itself there without
//! sharing area. Pinching duplicates the vertex once per component and nudges
//! each copy toward its component's centroid, turning the junction into
//! properly separated sheets. The duplication is undone wholesale if any
//! re-homed triangle would intersect the mesh.

use nalgebra::{Point3, Vector3};
use tracing::debug;

use mesh_collide::segment_triangle_intersection;

use crate::events::RemeshEvent;
use crate::pipeline::CollisionPipeline;
use crate::surface::DynamicSurface;

/// Separates vertices with disconnected triangle neighbourhoods.
#[derive(Debug, Clone, Default)]
pub struct MeshPincher;

impl MeshPincher {
    /// Pinch every multi-component vertex. Returns the number of vertices
    /// pulled apart.
    pub fn process(
        &self,
        surf: &mut DynamicSurface,
        pipeline: &mut CollisionPipeline,
        events: &mut Vec<RemeshEvent>,
    ) -> usize {
        let mut pinched = 0;
        for v in 0..surf.num_vertices() {
            let components = surf.mesh.vertex_neighbourhood_components(v);
            if components.len() > 1
                && self.pull_apart_vertex(surf, pipeline, v, &components, events)
            {
                pinched += 1;
            }
        }
        if pinched > 0 {
            debug!(pinched, "pinch pass");
        }
        pinched
    }

    /// Duplicate `v` once per neighbourhood component (except the last, which
    /// keeps the original) and move each copy slightly toward its component's
    /// centroid. Returns whether the separation was committed.
    pub fn pull_apart_vertex(
        &self,
        surf: &mut DynamicSurface,
        pipeline: &mut CollisionPipeline,
        v: usize,
        components: &[Vec<usize>],
        events: &mut Vec<RemeshEvent>,
    ) -> bool {
        if components.len() < 2 {
            return false;
        }
        let pull = 10.0 * surf.proximity_epsilon;

        let mut triangles_to_delete: Vec<usize> = Vec::new();
        let mut triangles_to_add: Vec<[usize; 3]> = Vec::new();
        let mut vertices_added: Vec<usize> = Vec::new();

        for component in &components[..components.len() - 1] {
            let duplicate = surf.add_vertex(surf.position(v), surf.mass(v));
            vertices_added.push(duplicate);

            let mut centroid = Vector3::zeros();
            for &t in component.iter() {
                let tri = surf.mesh.triangle(t);
                let rehomed = tri.map(|x| if x == v { duplicate } else { x });
                for &corner in &tri {
                    if corner != v {
                        centroid += surf.position(corner).coords;
                    }
                }
                triangles_to_add.push(rehomed);
                triangles_to_delete.push(t);
            }
            centroid /= (component.len() * 2) as f64;

            let pulled = Point3::from(
                (1.0 - pull) * surf.position(duplicate).coords + pull * centroid,
            );
            surf.set_position(duplicate, pulled);
            surf.set_newposition(duplicate, pulled);
            surf.update_broad_phase_for_vertex(duplicate, false);
        }

        if surf.collision_safety {
            let mut collision = triangles_to_add
                .iter()
                .any(|&tri| pipeline.triangle_introduces_intersection(surf, tri));
            if !collision {
                // The re-homed triangles against each other as well.
                'outer: for i in 0..triangles_to_add.len() {
                    for j in (i + 1)..triangles_to_add.len() {
                        if proposed_triangles_intersect(
                            surf,
                            triangles_to_add[i],
                            triangles_to_add[j],
                        ) {
                            collision = true;
                            break 'outer;
                        }
                    }
                }
            }
            if collision {
                for &added in &vertices_added {
                    surf.remove_vertex(added);
                }
                return false;
            }
        }

        for &tri in &triangles_to_add {
            surf.add_triangle(tri);
        }
        for &t in &triangles_to_delete {
            surf.remove_triangle(t);
        }

        events.push(RemeshEvent::VertexPinch {
            vertex: v,
            duplicates: vertices_added,
        });
        true
    }
}

/// Static intersection test between two proposed triangles (vertex triples
/// that need not be in the mesh). Pairs sharing a vertex do not count.
pub(crate) fn proposed_triangles_intersect(
    surf: &DynamicSurface,
    t0: [usize; 3],
    t1: [usize; 3],
) -> bool {
    if t0.iter().any(|v| t1.contains(v)) {
        return false;
    }
    let edges = |t: [usize; 3]| [[t[0], t[1]], [t[1], t[2]], [t[2], t[0]]];
    for [a, b] in edges(t0) {
        if segment_triangle_intersection(
            &surf.position(a),
            &surf.position(b),
            &surf.position(t1[0]),
            &surf.position(t1[1]),
            &surf.position(t1[2]),
            true,
        ) {
            return true;
        }
    }
    for [a, b] in edges(t1) {
        if segment_triangle_intersection(
            &surf.position(a),
            &surf.position(b),
            &surf.position(t0[0]),
            &surf.position(t0[1]),
            &surf.position(t0[2]),
            true,
        ) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two triangle fans meeting only at a shared waist vertex (index 0):
    /// a minimal dumbbell.
    fn dumbbell() -> DynamicSurface {
        DynamicSurface::new(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                // Upper fan.
                Point3::new(1.0, 0.0, 1.0),
                Point3::new(-1.0, 0.0, 1.0),
                Point3::new(0.0, 1.0, 1.0),
                // Lower fan.
                Point3::new(1.0, 0.0, -1.0),
                Point3::new(-1.0, 0.0, -1.0),
                Point3::new(0.0, 1.0, -1.0),
            ],
            &[
                [0, 1, 3],
                [0, 3, 2],
                [0, 2, 1],
                [0, 4, 6],
                [0, 6, 5],
                [0, 5, 4],
            ],
            vec![1.0; 7],
            1e-3,
            1e-3,
        )
        .unwrap()
    }

    #[test]
    fn test_pinch_separates_dumbbell() {
        let mut surf = dumbbell();
        surf.rebuild_broad_phase(false).unwrap();
        let mut pipeline = CollisionPipeline::new(0.0, 1);
        let mut events = Vec::new();

        assert_eq!(surf.mesh.num_connected_components(), 1);
        let pinched = MeshPincher.process(&mut surf, &mut pipeline, &mut events);

        assert_eq!(pinched, 1);
        assert_eq!(surf.mesh.num_connected_components(), 2);
        surf.mesh.audit_connectivity(false).unwrap();
        pipeline
            .assert_mesh_is_intersection_free(&surf, false)
            .unwrap();

        match &events[0] {
            RemeshEvent::VertexPinch { vertex, duplicates } => {
                assert_eq!(*vertex, 0);
                assert_eq!(duplicates.len(), 1);
                // The duplicate moved toward its component's centroid.
                let duplicate = duplicates[0];
                assert!(surf.position(duplicate) != surf.position(0));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_regular_vertices_untouched() {
        let mut surf = DynamicSurface::new(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            &[[0, 1, 2], [0, 2, 3]],
            vec![1.0; 4],
            1e-3,
            1e-3,
        )
        .unwrap();
        surf.rebuild_broad_phase(false).unwrap();
        let mut pipeline = CollisionPipeline::new(0.0, 1);
        let mut events = Vec::new();

        let pinched = MeshPincher.process(&mut surf, &mut pipeline, &mut events);
        assert_eq!(pinched, 0);
        assert!(events.is_empty());
        assert_eq!(surf.num_vertices(), 4);
    }
}
