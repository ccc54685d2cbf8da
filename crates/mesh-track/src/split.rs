//! Edge splitting.
//!
//! Edges longer than the (optionally curvature-scaled) upper bound are split
//! at a position proposed by the subdivision scheme. A split is committed only
//! when the new vertex can reach its proposed position without colliding and
//! none of the replacement triangles intersects the mesh.

use tracing::debug;

use crate::events::RemeshEvent;
use crate::pipeline::CollisionPipeline;
use crate::quality::{curvature_scaled_length, min_triangle_angle};
use crate::subdivision::SubdivisionScheme;
use crate::surface::DynamicSurface;

/// Replacement triangles sharper than this are not worth creating.
const MIN_NEW_ANGLE: f64 = 0.05;

/// Splits over-long edges.
#[derive(Debug, Clone)]
pub struct EdgeSplitter {
    pub max_edge_length: f64,
    pub min_curvature_multiplier: f64,
    pub max_curvature_multiplier: f64,
    pub subdivision_scheme: SubdivisionScheme,
}

impl EdgeSplitter {
    /// Split every edge whose scaled length exceeds the bound, longest first.
    /// Returns the number of splits committed.
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
            .filter(|&(_, length)| length > self.max_edge_length)
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut splits = 0;
        for (e, _) in candidates {
            if !surf.mesh.edge_is_live(e) {
                continue;
            }
            // Re-measure: earlier splits may have shortened this edge's
            // neighbourhood.
            let edge = surf.mesh.edge(e);
            let length = curvature_scaled_length(
                surf,
                edge[0],
                edge[1],
                self.min_curvature_multiplier,
                self.max_curvature_multiplier,
                2.0,
            );
            if length <= self.max_edge_length {
                continue;
            }
            if self.split_edge(surf, pipeline, e, events).is_some() {
                splits += 1;
            }
        }

        if splits > 0 {
            debug!(splits, "edge split pass");
        }
        splits
    }

    /// Split one edge. Returns the index of the inserted vertex, or `None`
    /// when the split was rejected.
    pub fn split_edge(
        &self,
        surf: &mut DynamicSurface,
        pipeline: &mut CollisionPipeline,
        e: usize,
        events: &mut Vec<RemeshEvent>,
    ) -> Option<usize> {
        let edge = surf.mesh.edge(e);
        let incident: Vec<usize> = surf.mesh.triangles_incident_to_edge(e).to_vec();
        if incident.is_empty() || incident.len() > 2 {
            return None;
        }
        if surf.edge_is_solid(e) {
            return None;
        }

        let [a, b] = edge;
        let midpoint = nalgebra::Point3::from(
            0.5 * (surf.position(a).coords + surf.position(b).coords),
        );
        let proposed = self.subdivision_scheme.propose_vertex_position(surf, e);

        // Replacement triangles, winding preserved: a triangle listing the
        // edge as a->b becomes (a, m, c) and (m, b, c).
        let mut removed = Vec::with_capacity(incident.len());
        let mut proposals: Vec<[usize; 3]> = Vec::with_capacity(2 * incident.len());
        for &t in &incident {
            let tri = surf.mesh.triangle(t);
            let c = *tri.iter().find(|&&v| v != a && v != b)?;
            let (first, second) = if surf.mesh.triangle_contains_oriented_edge(t, a, b) {
                (a, b)
            } else {
                (b, a)
            };
            removed.push(t);
            // Placeholder for the new vertex; patched once it exists.
            proposals.push([first, usize::MAX, c]);
            proposals.push([usize::MAX, second, c]);
        }

        // Shape gate: none of the replacement triangles may be a sliver.
        for proposal in &proposals {
            let point_of = |v: usize| {
                if v == usize::MAX {
                    proposed
                } else {
                    surf.position(v)
                }
            };
            let angle = min_triangle_angle(
                &point_of(proposal[0]),
                &point_of(proposal[1]),
                &point_of(proposal[2]),
            );
            if angle < MIN_NEW_ANGLE {
                return None;
            }
        }

        // Stage the new vertex at the midpoint and prove the move to its
        // proposed position collision-free, then prove the replacement
        // triangles clean in the proposed state.
        // A vertex inserted on a half-solid edge stays dynamic.
        let mass = if surf.vertex_is_solid(a) {
            surf.mass(b)
        } else if surf.vertex_is_solid(b) {
            surf.mass(a)
        } else {
            0.5 * (surf.mass(a) + surf.mass(b))
        };
        let new_vertex = surf.add_vertex(midpoint, mass);
        let patched: Vec<[usize; 3]> = proposals
            .iter()
            .map(|tri| tri.map(|v| if v == usize::MAX { new_vertex } else { v }))
            .collect();

        if surf.collision_safety {
            // The new vertex is born on the surface, so pairs against the
            // triangles it subdivides (anything touching the split edge) are
            // contacts by construction and excluded from the sweep.
            surf.set_newposition(new_vertex, proposed);
            let collides = pipeline.motion_introduces_collision_excluding(
                surf,
                &[new_vertex],
                &[a, b, new_vertex],
            );
            surf.set_newposition(new_vertex, midpoint);
            if collides {
                surf.remove_vertex(new_vertex);
                return None;
            }

            // Static gate in the proposed state, with the parent fan's
            // vertices treated as incident.
            let mut fan: Vec<usize> = vec![a, b];
            for proposal in &patched {
                fan.push(proposal[2]);
            }
            surf.set_position(new_vertex, proposed);
            surf.set_newposition(new_vertex, proposed);
            surf.update_broad_phase_for_vertex(new_vertex, true);
            let intersects = patched.iter().any(|&tri| {
                pipeline.triangle_introduces_intersection_excluding(surf, tri, &fan)
            });
            if intersects {
                surf.remove_vertex(new_vertex);
                return None;
            }
        } else {
            surf.set_position(new_vertex, proposed);
            surf.set_newposition(new_vertex, proposed);
            surf.update_broad_phase_for_vertex(new_vertex, true);
        }

        for &t in &removed {
            surf.remove_triangle(t);
        }
        let added: Vec<usize> = patched.iter().map(|&tri| surf.add_triangle(tri)).collect();

        events.push(RemeshEvent::EdgeSplit {
            edge: [a, b],
            new_vertex,
            added_triangles: added,
        });
        Some(new_vertex)
    }
}
