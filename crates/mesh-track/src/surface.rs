//! The dynamic surface: geometry arrays over the mesh connectivity.
//!
//! Owns current positions `x`, predicted positions `x'`, per-step velocities,
//! and masses, all index-aligned with the mesh vertex slots, plus the broad
//! phase built over them. A vertex with infinite mass is *solid*: it is
//! kinematically driven and the collision pipeline never moves it.

use nalgebra::{Point3, Vector3};
use tracing::debug;

use mesh_collide::Aabb;

use crate::broadphase::BroadPhase;
use crate::error::{TrackError, TrackResult};
use crate::mesh::TriMesh;

/// A triangle surface with positions, predicted positions, and masses.
#[derive(Debug, Clone)]
pub struct DynamicSurface {
    pub mesh: TriMesh,
    pub broad_phase: BroadPhase,

    positions: Vec<Point3<f64>>,
    new_positions: Vec<Point3<f64>>,
    velocities: Vec<Vector3<f64>>,
    masses: Vec<f64>,

    /// Distance below which primitives are considered touching.
    pub proximity_epsilon: f64,
    /// Padding added to every broad-phase box.
    pub aabb_padding: f64,
    /// Gate every operation through intersection audits.
    pub collision_safety: bool,
    /// Permit edges with more than two incident triangles.
    pub allow_non_manifold: bool,
}

impl DynamicSurface {
    /// Build a surface from raw geometry. Validates indices, coordinate
    /// finiteness, and masses (positive; infinity marks a solid vertex).
    pub fn new(
        vertices: Vec<Point3<f64>>,
        triangles: &[[usize; 3]],
        masses: Vec<f64>,
        proximity_epsilon: f64,
        aabb_padding: f64,
    ) -> TrackResult<Self> {
        if vertices.len() != masses.len() {
            return Err(TrackError::InvalidGeometry {
                details: format!(
                    "{} vertices but {} masses",
                    vertices.len(),
                    masses.len()
                ),
            });
        }
        for (i, p) in vertices.iter().enumerate() {
            if !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()) {
                return Err(TrackError::InvalidGeometry {
                    details: format!("vertex {i} has non-finite coordinates"),
                });
            }
        }
        for (i, &m) in masses.iter().enumerate() {
            if !(m > 0.0) {
                return Err(TrackError::InvalidGeometry {
                    details: format!("vertex {i} has non-positive mass {m}"),
                });
            }
        }
        for (t, tri) in triangles.iter().enumerate() {
            if tri[0] == tri[1] || tri[1] == tri[2] || tri[2] == tri[0] {
                return Err(TrackError::InvalidGeometry {
                    details: format!("triangle {t} repeats a vertex: {tri:?}"),
                });
            }
            if tri.iter().any(|&v| v >= vertices.len()) {
                return Err(TrackError::InvalidGeometry {
                    details: format!("triangle {t} references a missing vertex: {tri:?}"),
                });
            }
        }

        let mesh = TriMesh::from_triangles(vertices.len(), triangles);
        let new_positions = vertices.clone();
        let velocities = vec![Vector3::zeros(); vertices.len()];

        let mut surface = Self {
            mesh,
            broad_phase: BroadPhase::new(),
            positions: vertices,
            new_positions,
            velocities,
            masses,
            proximity_epsilon,
            aabb_padding,
            collision_safety: true,
            allow_non_manifold: false,
        };
        surface.rebuild_broad_phase(false)?;
        Ok(surface)
    }

    // ------------------------------------------------------------------
    // Positions and masses
    // ------------------------------------------------------------------

    #[inline]
    pub fn num_vertices(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    pub fn num_triangles(&self) -> usize {
        self.mesh.num_live_triangles()
    }

    #[inline]
    pub fn position(&self, v: usize) -> Point3<f64> {
        self.positions[v]
    }

    #[inline]
    pub fn positions(&self) -> &[Point3<f64>] {
        &self.positions
    }

    #[inline]
    pub fn predicted_position(&self, v: usize) -> Point3<f64> {
        self.new_positions[v]
    }

    #[inline]
    pub fn velocity(&self, v: usize) -> Vector3<f64> {
        self.velocities[v]
    }

    #[inline]
    pub fn set_velocity(&mut self, v: usize, velocity: Vector3<f64>) {
        self.velocities[v] = velocity;
    }

    #[inline]
    pub fn mass(&self, v: usize) -> f64 {
        self.masses[v]
    }

    /// Kinematic position setter. The only way a solid vertex moves.
    #[inline]
    pub fn set_position(&mut self, v: usize, p: Point3<f64>) {
        self.positions[v] = p;
    }

    #[inline]
    pub fn set_newposition(&mut self, v: usize, p: Point3<f64>) {
        self.new_positions[v] = p;
    }

    /// Set every predicted position at once. The slice must cover every
    /// vertex slot.
    pub fn set_all_newpositions(&mut self, predicted: &[Point3<f64>]) -> TrackResult<()> {
        if predicted.len() != self.new_positions.len() {
            return Err(TrackError::InvalidGeometry {
                details: format!(
                    "{} predicted positions for {} vertices",
                    predicted.len(),
                    self.new_positions.len()
                ),
            });
        }
        self.new_positions.copy_from_slice(predicted);
        Ok(())
    }

    /// Commit the step: `x = x'`.
    pub fn set_positions_to_newpositions(&mut self) {
        self.positions.copy_from_slice(&self.new_positions);
    }

    /// Derive per-step velocities from the predicted positions.
    pub fn compute_velocities(&mut self, dt: f64) {
        let inv_dt = 1.0 / dt;
        for v in 0..self.num_vertices() {
            self.velocities[v] = (self.new_positions[v] - self.positions[v]) * inv_dt;
        }
    }

    // ------------------------------------------------------------------
    // Solidity
    // ------------------------------------------------------------------

    #[inline]
    pub fn vertex_is_solid(&self, v: usize) -> bool {
        self.masses[v] == f64::INFINITY
    }

    /// An edge is solid iff both endpoints are solid.
    pub fn edge_is_solid(&self, e: usize) -> bool {
        let edge = self.mesh.edge(e);
        self.vertex_is_solid(edge[0]) && self.vertex_is_solid(edge[1])
    }

    /// A triangle is solid iff all three vertices are solid.
    pub fn triangle_is_solid(&self, t: usize) -> bool {
        let tri = self.mesh.triangle(t);
        tri.iter().all(|&v| self.vertex_is_solid(v))
    }

    // ------------------------------------------------------------------
    // Bounds
    // ------------------------------------------------------------------

    /// Box around the vertex at its current position, padded.
    pub fn vertex_static_bounds(&self, v: usize) -> Aabb {
        Aabb::from_points(&[self.positions[v]]).expanded(self.aabb_padding)
    }

    /// Box around the vertex sweep from current to predicted, padded.
    pub fn vertex_continuous_bounds(&self, v: usize) -> Aabb {
        Aabb::from_points(&[self.positions[v], self.new_positions[v]])
            .expanded(self.aabb_padding)
    }

    pub fn edge_static_bounds(&self, e: usize) -> Aabb {
        let edge = self.mesh.edge(e);
        Aabb::from_points(&[self.positions[edge[0]], self.positions[edge[1]]])
            .expanded(self.aabb_padding)
    }

    pub fn edge_continuous_bounds(&self, e: usize) -> Aabb {
        let edge = self.mesh.edge(e);
        Aabb::from_points(&[
            self.positions[edge[0]],
            self.positions[edge[1]],
            self.new_positions[edge[0]],
            self.new_positions[edge[1]],
        ])
        .expanded(self.aabb_padding)
    }

    pub fn triangle_static_bounds(&self, t: usize) -> Aabb {
        let tri = self.mesh.triangle(t);
        Aabb::from_points(&[
            self.positions[tri[0]],
            self.positions[tri[1]],
            self.positions[tri[2]],
        ])
        .expanded(self.aabb_padding)
    }

    pub fn triangle_continuous_bounds(&self, t: usize) -> Aabb {
        let tri = self.mesh.triangle(t);
        Aabb::from_points(&[
            self.positions[tri[0]],
            self.positions[tri[1]],
            self.positions[tri[2]],
            self.new_positions[tri[0]],
            self.new_positions[tri[1]],
            self.new_positions[tri[2]],
        ])
        .expanded(self.aabb_padding)
    }

    // ------------------------------------------------------------------
    // Broad phase maintenance
    // ------------------------------------------------------------------

    /// Rebuild all six grids from scratch. Static mode boxes the current
    /// positions; continuous mode boxes the sweep to the predicted positions.
    pub fn rebuild_broad_phase(&mut self, continuous: bool) -> TrackResult<()> {
        let length_scale = self.average_edge_length().max(1e-12);
        let padding = self.aabb_padding;

        let mut solid_v = (Vec::new(), Vec::new());
        let mut dynamic_v = (Vec::new(), Vec::new());
        for v in 0..self.num_vertices() {
            let aabb = if continuous {
                self.vertex_continuous_bounds(v)
            } else {
                self.vertex_static_bounds(v)
            };
            let set = if self.vertex_is_solid(v) {
                &mut solid_v
            } else {
                &mut dynamic_v
            };
            set.0.push(v);
            set.1.push(aabb);
        }

        let mut solid_e = (Vec::new(), Vec::new());
        let mut dynamic_e = (Vec::new(), Vec::new());
        for (e, _) in self.mesh.live_edges() {
            let aabb = if continuous {
                self.edge_continuous_bounds(e)
            } else {
                self.edge_static_bounds(e)
            };
            let set = if self.edge_is_solid(e) {
                &mut solid_e
            } else {
                &mut dynamic_e
            };
            set.0.push(e);
            set.1.push(aabb);
        }

        let mut solid_t = (Vec::new(), Vec::new());
        let mut dynamic_t = (Vec::new(), Vec::new());
        for (t, _) in self.mesh.live_triangles() {
            let aabb = if continuous {
                self.triangle_continuous_bounds(t)
            } else {
                self.triangle_static_bounds(t)
            };
            let set = if self.triangle_is_solid(t) {
                &mut solid_t
            } else {
                &mut dynamic_t
            };
            set.0.push(t);
            set.1.push(aabb);
        }

        self.broad_phase.build_vertex_grids(
            (&solid_v.0, &solid_v.1),
            (&dynamic_v.0, &dynamic_v.1),
            length_scale,
            padding,
        )?;
        self.broad_phase.build_edge_grids(
            (&solid_e.0, &solid_e.1),
            (&dynamic_e.0, &dynamic_e.1),
            length_scale,
            padding,
        )?;
        self.broad_phase.build_triangle_grids(
            (&solid_t.0, &solid_t.1),
            (&dynamic_t.0, &dynamic_t.1),
            length_scale,
            padding,
        )?;

        debug!(
            continuous,
            vertices = self.num_vertices(),
            triangles = self.num_triangles(),
            "rebuilt broad phase"
        );
        Ok(())
    }

    /// Refresh the broad-phase boxes for a vertex and everything incident to
    /// it, after a local edit moved it.
    pub fn update_broad_phase_for_vertex(&mut self, v: usize, continuous: bool) {
        let aabb = if continuous {
            self.vertex_continuous_bounds(v)
        } else {
            self.vertex_static_bounds(v)
        };
        let solid = self.vertex_is_solid(v);
        self.broad_phase.update_vertex(v, aabb, solid);

        let incident_edges: Vec<usize> = self.mesh.edges_incident_to_vertex(v).to_vec();
        for e in incident_edges {
            let aabb = if continuous {
                self.edge_continuous_bounds(e)
            } else {
                self.edge_static_bounds(e)
            };
            let solid = self.edge_is_solid(e);
            self.broad_phase.update_edge(e, aabb, solid);
        }

        let incident_triangles: Vec<usize> = self.mesh.triangles_incident_to_vertex(v).to_vec();
        for t in incident_triangles {
            let aabb = if continuous {
                self.triangle_continuous_bounds(t)
            } else {
                self.triangle_static_bounds(t)
            };
            let solid = self.triangle_is_solid(t);
            self.broad_phase.update_triangle(t, aabb, solid);
        }
    }

    // ------------------------------------------------------------------
    // Entity lifecycle (kept in lockstep with the broad phase)
    // ------------------------------------------------------------------

    /// Add a vertex with the given position and mass; the predicted position
    /// starts equal to the position.
    pub fn add_vertex(&mut self, position: Point3<f64>, mass: f64) -> usize {
        let v = self.mesh.add_vertex();
        debug_assert_eq!(v, self.positions.len());
        self.positions.push(position);
        self.new_positions.push(position);
        self.velocities.push(Vector3::zeros());
        self.masses.push(mass);
        let aabb = self.vertex_continuous_bounds(v);
        self.broad_phase.add_vertex(v, aabb, self.vertex_is_solid(v));
        v
    }

    /// Remove a vertex and its incident triangles from the mesh and the broad
    /// phase. The position slot remains so indices stay aligned.
    pub fn remove_vertex(&mut self, v: usize) {
        let incident: Vec<usize> = self.mesh.triangles_incident_to_vertex(v).to_vec();
        for t in incident {
            self.remove_triangle(t);
        }
        self.broad_phase.remove_vertex(v);
    }

    /// Add a triangle, registering it and any newly created edges with the
    /// broad phase.
    pub fn add_triangle(&mut self, tri: [usize; 3]) -> usize {
        let t = self.mesh.add_triangle(tri);
        let aabb = self.triangle_continuous_bounds(t);
        self.broad_phase
            .add_triangle(t, aabb, self.triangle_is_solid(t));
        for e in self.mesh.triangle_edges(t) {
            let aabb = self.edge_continuous_bounds(e);
            let solid = self.edge_is_solid(e);
            self.broad_phase.update_edge(e, aabb, solid);
        }
        t
    }

    /// Remove a triangle, dropping it and any orphaned edges from the broad
    /// phase.
    pub fn remove_triangle(&mut self, t: usize) {
        if !self.mesh.triangle_is_live(t) {
            return;
        }
        let edges = self.mesh.triangle_edges(t);
        self.mesh.remove_triangle(t);
        self.broad_phase.remove_triangle(t);
        for e in edges {
            if !self.mesh.edge_is_live(e) {
                self.broad_phase.remove_edge(e);
            }
        }
    }

    /// Compact the mesh tables, drop unreferenced vertices, realign the
    /// geometry arrays, and rebuild the broad phase. Returns the remap that
    /// external code must apply to any held indices.
    pub fn defrag(&mut self) -> TrackResult<crate::mesh::MeshRemap> {
        let remap = self.mesh.defrag();

        let compact = self.mesh.num_vertex_slots();
        let mut positions = vec![Point3::origin(); compact];
        let mut new_positions = vec![Point3::origin(); compact];
        let mut velocities = vec![Vector3::zeros(); compact];
        let mut masses = vec![0.0; compact];
        for (old, mapped) in remap.vertex_map.iter().enumerate() {
            if let Some(new) = *mapped {
                positions[new] = self.positions[old];
                new_positions[new] = self.new_positions[old];
                velocities[new] = self.velocities[old];
                masses[new] = self.masses[old];
            }
        }
        self.positions = positions;
        self.new_positions = new_positions;
        self.velocities = velocities;
        self.masses = masses;

        self.rebuild_broad_phase(false)?;
        Ok(remap)
    }

    // ------------------------------------------------------------------
    // Measures
    // ------------------------------------------------------------------

    /// Mean live edge length at current positions.
    pub fn average_edge_length(&self) -> f64 {
        let mut total = 0.0;
        let mut count = 0usize;
        for (_, edge) in self.mesh.live_edges() {
            total += (self.positions[edge[1]] - self.positions[edge[0]]).norm();
            count += 1;
        }
        if count == 0 {
            0.0
        } else {
            total / count as f64
        }
    }

    /// Area-scaled triangle normal (right-hand rule over the vertex order).
    pub fn triangle_normal_scaled(&self, t: usize) -> Vector3<f64> {
        let tri = self.mesh.triangle(t);
        let e1 = self.positions[tri[1]] - self.positions[tri[0]];
        let e2 = self.positions[tri[2]] - self.positions[tri[0]];
        e1.cross(&e2)
    }

    /// Unit triangle normal, `None` for degenerate triangles.
    pub fn triangle_normal(&self, t: usize) -> Option<Vector3<f64>> {
        let n = self.triangle_normal_scaled(t);
        let len_sq = n.norm_squared();
        if len_sq > 1e-30 {
            Some(n / len_sq.sqrt())
        } else {
            None
        }
    }

    pub fn triangle_area(&self, t: usize) -> f64 {
        self.triangle_normal_scaled(t).norm() * 0.5
    }

    /// Area-weighted unit vertex normal.
    pub fn vertex_normal(&self, v: usize) -> Option<Vector3<f64>> {
        let mut sum = Vector3::zeros();
        for &t in self.mesh.triangles_incident_to_vertex(v) {
            sum += self.triangle_normal_scaled(t);
        }
        let len_sq = sum.norm_squared();
        if len_sq > 1e-30 {
            Some(sum / len_sq.sqrt())
        } else {
            None
        }
    }

    /// Total area of live triangles.
    pub fn surface_area(&self) -> f64 {
        self.mesh
            .live_triangles()
            .map(|(t, _)| self.triangle_area(t))
            .sum()
    }

    /// Signed enclosed volume by the divergence theorem. Meaningful for
    /// closed surfaces with outward winding.
    pub fn enclosed_volume(&self) -> f64 {
        let mut volume = 0.0;
        for (_, tri) in self.mesh.live_triangles() {
            let a = &self.positions[tri[0]].coords;
            let b = &self.positions[tri[1]].coords;
            let c = &self.positions[tri[2]].coords;
            volume += a.dot(&b.cross(c));
        }
        volume / 6.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_surface() -> DynamicSurface {
        DynamicSurface::new(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            &[[0, 1, 2], [0, 2, 3]],
            vec![1.0; 4],
            1e-4,
            1e-4,
        )
        .unwrap()
    }

    #[test]
    fn test_construction_validates() {
        assert!(DynamicSurface::new(
            vec![Point3::new(0.0, 0.0, f64::NAN)],
            &[],
            vec![1.0],
            1e-4,
            1e-4,
        )
        .is_err());

        assert!(DynamicSurface::new(
            vec![Point3::origin(); 3],
            &[[0, 1, 5]],
            vec![1.0; 3],
            1e-4,
            1e-4,
        )
        .is_err());

        assert!(DynamicSurface::new(
            vec![Point3::origin(); 3],
            &[[0, 1, 2]],
            vec![1.0, 0.0, 1.0],
            1e-4,
            1e-4,
        )
        .is_err());
    }

    #[test]
    fn test_solidity_is_derived_from_mass() {
        let mut surface = quad_surface();
        assert!(!surface.vertex_is_solid(0));
        surface.masses[0] = f64::INFINITY;
        surface.masses[1] = f64::INFINITY;
        assert!(surface.vertex_is_solid(0));
        let e = surface.mesh.get_edge_index(0, 1).unwrap();
        assert!(surface.edge_is_solid(e));
        assert!(!surface.triangle_is_solid(0));
    }

    #[test]
    fn test_continuous_bounds_cover_sweep() {
        let mut surface = quad_surface();
        surface.set_newposition(0, Point3::new(0.0, 0.0, 2.0));
        let bounds = surface.vertex_continuous_bounds(0);
        assert!(bounds.min.z < 0.0 + 1e-12);
        assert!(bounds.max.z >= 2.0);
        let static_bounds = surface.vertex_static_bounds(0);
        assert!(static_bounds.max.z < 1.0);
    }

    #[test]
    fn test_commit_positions() {
        let mut surface = quad_surface();
        surface.set_newposition(0, Point3::new(0.5, 0.5, 0.5));
        surface.set_positions_to_newpositions();
        assert_eq!(surface.position(0), Point3::new(0.5, 0.5, 0.5));
    }

    #[test]
    fn test_broad_phase_follows_edits() {
        let mut surface = quad_surface();
        let v = surface.add_vertex(Point3::new(5.0, 5.0, 0.0), 1.0);
        let t = surface.add_triangle([1, 2, v]);

        let query = Aabb::new(Point3::new(4.0, 4.0, -1.0), Point3::new(6.0, 6.0, 1.0));
        let found = surface
            .broad_phase
            .potential_vertex_collisions(&query, true, true);
        assert!(found.contains(&v));

        surface.remove_triangle(t);
        surface.remove_vertex(v);
        let found = surface
            .broad_phase
            .potential_vertex_collisions(&query, true, true);
        assert!(!found.contains(&v));
    }

    #[test]
    fn test_measures() {
        let surface = quad_surface();
        assert!((surface.surface_area() - 1.0).abs() < 1e-12);
        // Four unit edges plus the diagonal: (4 + sqrt(2)) / 5.
        assert!((surface.average_edge_length() - 1.0828427124746192).abs() < 1e-9);
    }

    #[test]
    fn test_velocities_from_predictions() {
        let mut surface = quad_surface();
        surface.set_newposition(0, Point3::new(0.0, 0.0, 1.0));
        surface.compute_velocities(0.5);
        assert!((surface.velocity(0) - Vector3::new(0.0, 0.0, 2.0)).norm() < 1e-12);
    }
}
