//! Impact zones: simultaneous treatment of clustered collisions.
//!
//! When sequential impulses fail to untangle a region, its collisions are
//! grouped into zones (connected components over shared vertices) and each
//! zone is solved as one constrained system: find the smallest mass-weighted
//! velocity change such that every contact's normal relative velocity is
//! zero. If the zone keeps producing new collisions after a bounded number of
//! re-solves, its vertices are frozen for the step, which trivially cannot
//! create an intersection.

use hashbrown::{HashMap, HashSet};
use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

use crate::pipeline::{Collision, CollisionPipeline};
use crate::surface::DynamicSurface;

/// A set of collisions connected through shared vertices.
#[derive(Debug, Clone)]
pub struct ImpactZone {
    pub collisions: Vec<Collision>,
}

impl ImpactZone {
    /// Every vertex participating in the zone, ascending.
    pub fn vertices(&self) -> Vec<usize> {
        let mut vertices: Vec<usize> = self
            .collisions
            .iter()
            .flat_map(|c| c.vertex_indices)
            .collect();
        vertices.sort_unstable();
        vertices.dedup();
        vertices
    }
}

/// Result of an impact-zone solve.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZoneOutcome {
    /// True when the step ended collision-free.
    pub resolved: bool,
    /// Number of vertices rigidly frozen by the fallback.
    pub frozen_vertices: usize,
}

/// Groups collisions into zones and solves them.
#[derive(Debug, Clone)]
pub struct ImpactZoneSolver {
    /// Bound on solve / re-detect rounds before the rigid fallback.
    pub max_iterations: usize,
}

impl ImpactZoneSolver {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
        }
    }

    /// Partition collisions into zones: two collisions belong to the same
    /// zone iff their vertex sets are connected through shared vertices.
    pub fn group_into_zones(collisions: &[Collision]) -> Vec<ImpactZone> {
        let mut zones: Vec<Vec<Collision>> = Vec::new();
        let mut zone_vertices: Vec<HashSet<usize>> = Vec::new();

        for collision in collisions {
            let mut touching: Vec<usize> = zone_vertices
                .iter()
                .enumerate()
                .filter(|(_, set)| collision.vertex_indices.iter().any(|v| set.contains(v)))
                .map(|(i, _)| i)
                .collect();

            match touching.len() {
                0 => {
                    zones.push(vec![*collision]);
                    zone_vertices.push(collision.vertex_indices.iter().copied().collect());
                }
                _ => {
                    // Merge every touched zone into the first.
                    let target = touching[0];
                    zones[target].push(*collision);
                    for &v in &collision.vertex_indices {
                        zone_vertices[target].insert(v);
                    }
                    while let Some(other) = touching.pop() {
                        if other == target {
                            continue;
                        }
                        let moved = std::mem::take(&mut zones[other]);
                        zones[target].extend(moved);
                        let moved_vertices = std::mem::take(&mut zone_vertices[other]);
                        zone_vertices[target].extend(moved_vertices);
                    }
                }
            }
        }

        zones
            .into_iter()
            .filter(|z| !z.is_empty())
            .map(|collisions| ImpactZone { collisions })
            .collect()
    }

    /// Resolve the given collisions. On success the predicted positions are
    /// collision-free; otherwise every involved free vertex has been frozen
    /// at its current position.
    pub fn solve(
        &self,
        surf: &mut DynamicSurface,
        pipeline: &mut CollisionPipeline,
        initial_collisions: Vec<Collision>,
        dt: f64,
    ) -> ZoneOutcome {
        if initial_collisions.is_empty() {
            return ZoneOutcome {
                resolved: true,
                frozen_vertices: 0,
            };
        }

        let mut collisions = initial_collisions;

        for iteration in 0..self.max_iterations {
            let zones = Self::group_into_zones(&collisions);
            debug!(iteration, zones = zones.len(), "impact zone solve");

            for zone in &zones {
                self.inelastic_projection(surf, zone, dt);
            }

            // Re-examine the neighbourhood of every zone for collisions the
            // projection may have introduced.
            let mut all_vertices: Vec<usize> =
                zones.iter().flat_map(|z| z.vertices()).collect();
            all_vertices.sort_unstable();
            all_vertices.dedup();

            let mut found = Vec::new();
            let complete =
                pipeline.detect_collisions_near_vertices(surf, &all_vertices, &mut found);
            if !complete {
                warn!("zone re-detection overflowed, escalating to rigid freeze");
                let frozen = self.rigid_freeze(surf, &all_vertices);
                return self.post_freeze_outcome(surf, pipeline, &all_vertices, frozen);
            }
            if found.is_empty() {
                return ZoneOutcome {
                    resolved: true,
                    frozen_vertices: 0,
                };
            }

            // Grow the zones with the new collisions and go again.
            collisions.extend(found);
        }

        // Iteration budget exhausted: rigid fallback.
        let zones = Self::group_into_zones(&collisions);
        let mut all_vertices: Vec<usize> = zones.iter().flat_map(|z| z.vertices()).collect();
        all_vertices.sort_unstable();
        all_vertices.dedup();
        let frozen = self.rigid_freeze(surf, &all_vertices);
        self.post_freeze_outcome(surf, pipeline, &all_vertices, frozen)
    }

    /// One Newton step of the quadratic impulse problem: minimize
    /// `1/2 sum m_v |u_v - u_v_in|^2` subject to every contact constraint
    /// `n . (sum alpha_i u_i) = 0`. Solid vertices have infinite inertia and
    /// stay out of the unknown vector; their prescribed velocities move into
    /// the right-hand side.
    fn inelastic_projection(&self, surf: &mut DynamicSurface, zone: &ImpactZone, dt: f64) {
        let free_vertices: Vec<usize> = zone
            .vertices()
            .into_iter()
            .filter(|&v| !surf.vertex_is_solid(v))
            .collect();
        if free_vertices.is_empty() {
            return;
        }
        let column_of: HashMap<usize, usize> = free_vertices
            .iter()
            .enumerate()
            .map(|(i, &v)| (v, i))
            .collect();

        let num_constraints = zone.collisions.len();
        let num_unknowns = 3 * free_vertices.len();

        let mut constraint_matrix = DMatrix::<f64>::zeros(num_constraints, num_unknowns);
        let mut rhs = DVector::<f64>::zeros(num_constraints);
        let mut velocity_in = DVector::<f64>::zeros(num_unknowns);
        let mut inv_mass = DVector::<f64>::zeros(num_unknowns);

        for (i, &v) in free_vertices.iter().enumerate() {
            let u = surf.velocity(v);
            let m = surf.mass(v);
            for axis in 0..3 {
                velocity_in[3 * i + axis] = u[axis];
                inv_mass[3 * i + axis] = 1.0 / m;
            }
        }

        for (row, collision) in zone.collisions.iter().enumerate() {
            let alphas = collision.alphas();
            for (slot, &v) in collision.vertex_indices.iter().enumerate() {
                if let Some(&col) = column_of.get(&v) {
                    for axis in 0..3 {
                        constraint_matrix[(row, 3 * col + axis)] +=
                            alphas[slot] * collision.normal[axis];
                    }
                } else {
                    // Solid vertex: its prescribed velocity is a constant.
                    rhs[row] -= alphas[slot] * collision.normal.dot(&surf.velocity(v));
                }
            }
        }

        // KKT through the dual: (A M^-1 A^T) lambda = A u_in - b,
        //                        u = u_in - M^-1 A^T lambda.
        let mut a_minv = constraint_matrix.clone();
        for j in 0..num_unknowns {
            let w = inv_mass[j];
            for i in 0..num_constraints {
                a_minv[(i, j)] *= w;
            }
        }
        let dual_matrix = &a_minv * constraint_matrix.transpose();
        let dual_rhs = &constraint_matrix * &velocity_in - &rhs;

        let lambda = match dual_matrix.clone().cholesky() {
            Some(factor) => factor.solve(&dual_rhs),
            None => {
                // Redundant constraints make the dual singular; fall back to
                // a least-squares solve.
                match dual_matrix.svd(true, true).solve(&dual_rhs, 1e-12) {
                    Ok(solution) => solution,
                    Err(details) => {
                        warn!(error = details, "impact zone dual solve failed, skipping zone");
                        return;
                    }
                }
            }
        };

        let correction = constraint_matrix.transpose() * lambda;
        for (i, &v) in free_vertices.iter().enumerate() {
            let mut u = surf.velocity(v);
            for axis in 0..3 {
                u[axis] = velocity_in[3 * i + axis]
                    - inv_mass[3 * i + axis] * correction[3 * i + axis];
            }
            surf.set_velocity(v, u);
            let predicted = surf.position(v) + dt * u;
            surf.set_newposition(v, predicted);
        }
    }

    /// Freeze every free vertex at its current position for this step.
    /// Returns the number of vertices frozen.
    fn rigid_freeze(&self, surf: &mut DynamicSurface, vertices: &[usize]) -> usize {
        let mut frozen = 0;
        for &v in vertices {
            if surf.vertex_is_solid(v) {
                continue;
            }
            surf.set_velocity(v, nalgebra::Vector3::zeros());
            let position = surf.position(v);
            surf.set_newposition(v, position);
            frozen += 1;
        }
        frozen
    }

    /// After a freeze, verify nothing still collides (a solid primitive can
    /// still be driving into the frozen region).
    fn post_freeze_outcome(
        &self,
        surf: &DynamicSurface,
        pipeline: &mut CollisionPipeline,
        vertices: &[usize],
        frozen: usize,
    ) -> ZoneOutcome {
        let mut residual = Vec::new();
        let complete = pipeline.detect_collisions_near_vertices(surf, vertices, &mut residual);
        ZoneOutcome {
            resolved: complete && residual.is_empty(),
            frozen_vertices: frozen,
        }
    }
}
