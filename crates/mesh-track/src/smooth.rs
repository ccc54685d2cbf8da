//! Tangential mesh smoothing.
//!
//! Each free vertex relaxes toward the centroid of its edge neighbours, with
//! the displacement projected onto the local tangent plane so the surface
//! shape is preserved (the normal component is the null space the smoother
//! must not touch). Every move is individually proven collision-free and
//! skipped otherwise.

use nalgebra::Vector3;
use tracing::debug;

use crate::events::RemeshEvent;
use crate::pipeline::CollisionPipeline;
use crate::surface::DynamicSurface;

/// Displacements below this length are not worth applying.
const MIN_DISPLACEMENT: f64 = 1e-12;

/// Null-space-projected Laplacian smoother.
#[derive(Debug, Clone)]
pub struct MeshSmoother {
    /// Relaxation factor in (0, 1]: 0 leaves the mesh alone, 1 moves each
    /// vertex all the way to its projected centroid.
    pub smoothing_factor: f64,
}

impl MeshSmoother {
    /// Run one smoothing sweep. Returns the number of vertices moved.
    pub fn process(
        &self,
        surf: &mut DynamicSurface,
        pipeline: &mut CollisionPipeline,
        events: &mut Vec<RemeshEvent>,
    ) -> usize {
        if self.smoothing_factor <= 0.0 {
            return 0;
        }

        let mut moved = 0;
        for v in 0..surf.num_vertices() {
            if surf.vertex_is_solid(v) {
                continue;
            }
            if surf.mesh.triangles_incident_to_vertex(v).is_empty() {
                continue;
            }
            // Boundary vertices stay put: relaxing them shrinks the rim.
            if surf
                .mesh
                .edges_incident_to_vertex(v)
                .iter()
                .any(|&e| surf.mesh.triangles_incident_to_edge(e).len() < 2)
            {
                continue;
            }
            let Some(displacement) = self.tangential_displacement(surf, v) else {
                continue;
            };
            if displacement.norm() < MIN_DISPLACEMENT {
                continue;
            }

            let proposed = surf.position(v) + displacement;
            if surf.collision_safety {
                surf.set_newposition(v, proposed);
                let collides = pipeline.motion_introduces_collision(surf, &[v]);
                if collides {
                    surf.set_newposition(v, surf.position(v));
                    continue;
                }
            }

            surf.set_position(v, proposed);
            surf.set_newposition(v, proposed);
            surf.update_broad_phase_for_vertex(v, true);
            moved += 1;
        }

        if moved > 0 {
            debug!(moved, "smoothing pass");
            events.push(RemeshEvent::SmoothingPass {
                vertices_moved: moved,
            });
        }
        moved
    }

    /// Laplacian displacement with its normal component projected out.
    fn tangential_displacement(
        &self,
        surf: &DynamicSurface,
        v: usize,
    ) -> Option<Vector3<f64>> {
        let mut centroid = Vector3::zeros();
        let mut count = 0usize;
        for &e in surf.mesh.edges_incident_to_vertex(v) {
            let edge = surf.mesh.edge(e);
            let neighbour = if edge[0] == v { edge[1] } else { edge[0] };
            centroid += surf.position(neighbour).coords;
            count += 1;
        }
        if count == 0 {
            return None;
        }
        centroid /= count as f64;

        let laplacian = centroid - surf.position(v).coords;
        let normal = surf.vertex_normal(v)?;
        let tangential = laplacian - normal.dot(&laplacian) * normal;
        Some(self.smoothing_factor * tangential)
    }
}
