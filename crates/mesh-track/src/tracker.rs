//! The surface tracker: top-level orchestration of advection, collision
//! resolution, mesh improvement, and topology changes.
//!
//! A step looks like:
//!
//! ```no_run
//! use nalgebra::Vector3;
//! use mesh_track::{SurfaceTracker, TrackerParams};
//!
//! # fn demo(vertices: Vec<nalgebra::Point3<f64>>, triangles: Vec<[usize; 3]>,
//! #         masses: Vec<f64>, velocities: Vec<Vector3<f64>>) -> mesh_track::TrackResult<()> {
//! let mut tracker = SurfaceTracker::new(vertices, &triangles, masses, TrackerParams::default())?;
//!
//! let dt = 0.01;
//! tracker.advect(&velocities, dt)?;
//! let outcome = tracker.integrate(dt)?;
//! assert!(outcome.actual_dt > 0.0, "step was rejected");
//!
//! tracker.improve_mesh()?;
//! tracker.topology_changes()?;
//! tracker.defrag_mesh()?;
//! # Ok(())
//! # }
//! ```

use nalgebra::{Point3, Vector3};
use tracing::{debug, info, warn};

use crate::collapse::EdgeCollapser;
use crate::error::{TrackError, TrackResult};
use crate::events::RemeshEvent;
use crate::flip::EdgeFlipper;
use crate::merge::MeshMerger;
use crate::mesh::MeshRemap;
use crate::pinch::MeshPincher;
use crate::pipeline::CollisionPipeline;
use crate::smooth::MeshSmoother;
use crate::split::EdgeSplitter;
use crate::subdivision::SubdivisionScheme;
use crate::surface::DynamicSurface;
use crate::tracing_ext::OperationTimer;
use crate::zones::ImpactZoneSolver;

/// Bound on dt-halving retries inside [`SurfaceTracker::integrate`].
const MAX_SUBSTEP_HALVINGS: usize = 4;

/// Configuration for a [`SurfaceTracker`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "config-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackerParams {
    /// Interpret the edge-length bounds as multiples of the initial average
    /// edge length.
    pub use_fraction: bool,
    /// Collapse threshold (absolute, or a fraction when `use_fraction`).
    pub min_edge_length: f64,
    /// Split threshold (absolute, or a fraction when `use_fraction`).
    pub max_edge_length: f64,
    /// Reject a collapse whose local volume change exceeds this.
    pub max_volume_change: f64,
    /// Lower clamp on the curvature scaling of edge lengths.
    pub min_curvature_multiplier: f64,
    /// Upper clamp on the curvature scaling of edge lengths.
    pub max_curvature_multiplier: f64,
    /// Distance below which proximity impulses fire.
    pub proximity_epsilon: f64,
    /// Distance below which two sheets are merged.
    pub merge_proximity_epsilon: f64,
    /// Coulomb friction cap applied by the proximity impulse.
    pub friction_coefficient: f64,
    /// Run the remeshing operators in `improve_mesh`.
    pub perform_improvement: bool,
    /// Run the pincher and merger in `topology_changes`.
    pub allow_topology_changes: bool,
    /// Permit edges with more than two incident triangles.
    pub allow_non_manifold: bool,
    /// Gate every operation through intersection audits.
    pub collision_safety: bool,
    /// Positioning rule for vertices inserted by splits.
    pub subdivision_scheme: SubdivisionScheme,
    /// Padding added to every broad-phase box. Defaults to
    /// `proximity_epsilon` so proximity pairs stay visible to the grids.
    pub aabb_padding: Option<f64>,
    /// Number of full CCD sweeps before the wind-down phase.
    pub ccd_passes: usize,
    /// Tangential smoothing relaxation factor.
    pub smoothing_factor: f64,
    /// Impact-zone solve / re-detect rounds before the rigid fallback.
    pub max_impact_zone_iterations: usize,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            use_fraction: true,
            min_edge_length: 0.5,
            max_edge_length: 1.5,
            max_volume_change: 0.1,
            min_curvature_multiplier: 1.0,
            max_curvature_multiplier: 1.0,
            proximity_epsilon: 1e-4,
            merge_proximity_epsilon: 1e-3,
            friction_coefficient: 0.0,
            perform_improvement: true,
            allow_topology_changes: false,
            allow_non_manifold: false,
            collision_safety: true,
            subdivision_scheme: SubdivisionScheme::Butterfly,
            aabb_padding: None,
            ccd_passes: 1,
            smoothing_factor: 0.5,
            max_impact_zone_iterations: 5,
        }
    }
}

/// Result of one `integrate` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// The time actually advanced; 0.0 means the step was rejected and
    /// nothing changed.
    pub actual_dt: f64,
    /// Vertices rigidly frozen by the impact-zone fallback this step.
    pub frozen_vertices: usize,
}

/// Tracks a dynamic triangle surface through advection, keeping it
/// intersection-free, well shaped, and topologically current.
pub struct SurfaceTracker {
    surf: DynamicSurface,
    pipeline: CollisionPipeline,
    zone_solver: ImpactZoneSolver,
    params: TrackerParams,
    /// Edge-length bounds after `use_fraction` resolution.
    min_edge_length: f64,
    max_edge_length: f64,
    callbacks: Vec<Box<dyn FnMut(&RemeshEvent)>>,
}

impl SurfaceTracker {
    /// Build a tracker over the given geometry. With collision safety on, the
    /// input mesh must already be intersection-free.
    pub fn new(
        vertices: Vec<Point3<f64>>,
        triangles: &[[usize; 3]],
        masses: Vec<f64>,
        params: TrackerParams,
    ) -> TrackResult<Self> {
        let padding = params.aabb_padding.unwrap_or(params.proximity_epsilon);
        let mut surf = DynamicSurface::new(
            vertices,
            triangles,
            masses,
            params.proximity_epsilon,
            padding,
        )?;
        surf.collision_safety = params.collision_safety;
        surf.allow_non_manifold = params.allow_non_manifold;

        let (min_edge_length, max_edge_length) = if params.use_fraction {
            let average = surf.average_edge_length();
            (
                params.min_edge_length * average,
                params.max_edge_length * average,
            )
        } else {
            (params.min_edge_length, params.max_edge_length)
        };

        let pipeline =
            CollisionPipeline::new(params.friction_coefficient, params.ccd_passes);
        let zone_solver = ImpactZoneSolver::new(params.max_impact_zone_iterations);

        let tracker = Self {
            surf,
            pipeline,
            zone_solver,
            params,
            min_edge_length,
            max_edge_length,
            callbacks: Vec::new(),
        };

        tracker
            .surf
            .mesh
            .audit_connectivity(tracker.params.allow_non_manifold)
            .map_err(|details| TrackError::InvariantViolation { details })?;
        if tracker.params.collision_safety {
            tracker
                .pipeline
                .assert_mesh_is_intersection_free(&tracker.surf, false)?;
        }

        info!(
            vertices = tracker.surf.num_vertices(),
            triangles = tracker.surf.num_triangles(),
            "surface tracker created"
        );
        Ok(tracker)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[inline]
    pub fn num_vertices(&self) -> usize {
        self.surf.num_vertices()
    }

    #[inline]
    pub fn num_triangles(&self) -> usize {
        self.surf.num_triangles()
    }

    #[inline]
    pub fn position(&self, v: usize) -> Point3<f64> {
        self.surf.position(v)
    }

    #[inline]
    pub fn triangle(&self, t: usize) -> [usize; 3] {
        self.surf.mesh.triangle(t)
    }

    /// The underlying surface, read-only.
    #[inline]
    pub fn surface(&self) -> &DynamicSurface {
        &self.surf
    }

    /// Live triangles as vertex triples, in index order.
    pub fn triangles(&self) -> Vec<[usize; 3]> {
        self.surf.mesh.live_triangles().map(|(_, tri)| tri).collect()
    }

    /// Register a callback for committed remeshing operations.
    pub fn on_remesh_event(&mut self, callback: impl FnMut(&RemeshEvent) + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    // ------------------------------------------------------------------
    // Kinematic input
    // ------------------------------------------------------------------

    /// Set every predicted position directly. The slice must cover every
    /// vertex slot.
    pub fn set_all_predicted_positions(&mut self, predicted: &[Point3<f64>]) -> TrackResult<()> {
        self.surf.set_all_newpositions(predicted)
    }

    /// Set predicted positions from per-vertex velocities: `x' = x + dt u`.
    /// The slice must cover every vertex slot (remeshing and defragmentation
    /// change the count, so refresh stale buffers first).
    pub fn advect(&mut self, velocities: &[Vector3<f64>], dt: f64) -> TrackResult<()> {
        if velocities.len() != self.surf.num_vertices() {
            return Err(TrackError::InvalidGeometry {
                details: format!(
                    "{} velocities for {} vertices",
                    velocities.len(),
                    self.surf.num_vertices()
                ),
            });
        }
        for (v, velocity) in velocities.iter().enumerate() {
            let predicted = self.surf.position(v) + dt * velocity;
            self.surf.set_newposition(v, predicted);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Integration
    // ------------------------------------------------------------------

    /// Advance the surface toward the predicted positions set beforehand,
    /// resolving collisions on the way. Returns the time actually advanced
    /// (halved sub-steps may shorten it; 0.0 means the step was rejected and
    /// the surface is unchanged).
    pub fn integrate(&mut self, dt: f64) -> TrackResult<StepOutcome> {
        if !(dt > 0.0 && dt.is_finite()) {
            return Err(TrackError::InvalidGeometry {
                details: format!("non-positive step size {dt}"),
            });
        }
        let _timer = OperationTimer::new("integrate");

        // Per-step velocities from the caller's prediction; sub-steps rescale
        // the prediction along these.
        let velocities: Vec<Vector3<f64>> = (0..self.surf.num_vertices())
            .map(|v| (self.surf.predicted_position(v) - self.surf.position(v)) / dt)
            .collect();

        if !self.params.collision_safety {
            for (v, velocity) in velocities.iter().enumerate() {
                self.surf.set_velocity(v, *velocity);
            }
            self.surf.set_positions_to_newpositions();
            return Ok(StepOutcome {
                actual_dt: dt,
                frozen_vertices: 0,
            });
        }

        let mut current_dt = dt;
        for halving in 0..=MAX_SUBSTEP_HALVINGS {
            for (v, velocity) in velocities.iter().enumerate() {
                let predicted = self.surf.position(v) + current_dt * velocity;
                self.surf.set_newposition(v, predicted);
                self.surf.set_velocity(v, *velocity);
            }

            match self.attempt_step(current_dt)? {
                Some(frozen_vertices) => {
                    self.surf.set_positions_to_newpositions();
                    self.pipeline
                        .assert_mesh_is_intersection_free(&self.surf, false)?;
                    debug!(
                        actual_dt = current_dt,
                        halving, frozen_vertices, "step accepted"
                    );
                    return Ok(StepOutcome {
                        actual_dt: current_dt,
                        frozen_vertices,
                    });
                }
                None => {
                    warn!(current_dt, "step rejected, halving dt");
                    current_dt *= 0.5;
                }
            }
        }

        // Leave the surface exactly where it was.
        for v in 0..self.surf.num_vertices() {
            let position = self.surf.position(v);
            self.surf.set_newposition(v, position);
            self.surf.set_velocity(v, Vector3::zeros());
        }
        Ok(StepOutcome {
            actual_dt: 0.0,
            frozen_vertices: 0,
        })
    }

    /// One collision-resolution attempt at the given step size. `Ok(Some(n))`
    /// means the predicted positions are safe with `n` frozen vertices;
    /// `Ok(None)` means the attempt failed and the caller should shrink dt.
    fn attempt_step(&mut self, dt: f64) -> TrackResult<Option<usize>> {
        self.surf.rebuild_broad_phase(true)?;
        self.pipeline.handle_proximities(&mut self.surf, dt);

        let resolved = self.pipeline.handle_collisions(&mut self.surf, dt);

        let mut frozen_vertices = 0;
        if !resolved {
            let mut collisions = Vec::new();
            let complete = self.pipeline.detect_collisions(&self.surf, &mut collisions);
            if !complete {
                // Overflowed sweep: the step is too violent, shrink it.
                warn!("collision sweep overflowed, rejecting step");
                return Ok(None);
            }
            let outcome =
                self.zone_solver
                    .solve(&mut self.surf, &mut self.pipeline, collisions, dt);
            frozen_vertices = outcome.frozen_vertices;
            if !outcome.resolved {
                return Ok(None);
            }
        }

        // Final gate: the predicted configuration itself must be clean.
        if self
            .pipeline
            .assert_predicted_mesh_is_intersection_free(&self.surf, false)
            .is_err()
        {
            return Ok(None);
        }
        Ok(Some(frozen_vertices))
    }

    // ------------------------------------------------------------------
    // Remeshing
    // ------------------------------------------------------------------

    /// One pass of splits, collapses, flips, and smoothing.
    pub fn improve_mesh(&mut self) -> TrackResult<()> {
        if !self.params.perform_improvement {
            return Ok(());
        }
        let _timer = OperationTimer::new("improve_mesh");
        self.prepare_for_remeshing()?;

        let mut events = Vec::new();

        let splitter = EdgeSplitter {
            max_edge_length: self.max_edge_length,
            min_curvature_multiplier: self.params.min_curvature_multiplier,
            max_curvature_multiplier: self.params.max_curvature_multiplier,
            subdivision_scheme: self.params.subdivision_scheme,
        };
        let splits = splitter.process(&mut self.surf, &mut self.pipeline, &mut events);

        let collapser = EdgeCollapser {
            min_edge_length: self.min_edge_length,
            max_volume_change: self.params.max_volume_change,
            min_curvature_multiplier: self.params.min_curvature_multiplier,
            max_curvature_multiplier: self.params.max_curvature_multiplier,
        };
        let collapses = collapser.process(&mut self.surf, &mut self.pipeline, &mut events);

        let flips = EdgeFlipper.process(&mut self.surf, &mut self.pipeline, &mut events);

        let smoother = MeshSmoother {
            smoothing_factor: self.params.smoothing_factor,
        };
        let smoothed = smoother.process(&mut self.surf, &mut self.pipeline, &mut events);

        debug!(splits, collapses, flips, smoothed, "improvement pass");
        self.fire_events(events);
        self.post_remeshing_audit()
    }

    /// One pass of pinching and merging.
    pub fn topology_changes(&mut self) -> TrackResult<()> {
        if !self.params.allow_topology_changes {
            return Ok(());
        }
        let _timer = OperationTimer::new("topology_changes");
        self.prepare_for_remeshing()?;

        let mut events = Vec::new();

        let pinched = MeshPincher.process(&mut self.surf, &mut self.pipeline, &mut events);

        let merger = MeshMerger {
            merge_proximity_epsilon: self.params.merge_proximity_epsilon,
        };
        let merges = merger.process(&mut self.surf, &mut self.pipeline, &mut events);

        debug!(pinched, merges, "topology pass");
        self.fire_events(events);
        self.post_remeshing_audit()
    }

    /// Compact entity tables and remap the geometry arrays. Any indices held
    /// by the caller must be translated through the returned remap.
    pub fn defrag_mesh(&mut self) -> TrackResult<MeshRemap> {
        let remap = self.surf.defrag()?;
        self.surf
            .mesh
            .audit_connectivity(self.params.allow_non_manifold)
            .map_err(|details| TrackError::InvariantViolation { details })?;
        Ok(remap)
    }

    /// The remeshing operators work on committed positions: align the
    /// predicted positions and refresh the static broad phase.
    fn prepare_for_remeshing(&mut self) -> TrackResult<()> {
        for v in 0..self.surf.num_vertices() {
            let position = self.surf.position(v);
            self.surf.set_newposition(v, position);
            self.surf.set_velocity(v, Vector3::zeros());
        }
        self.surf.rebuild_broad_phase(false)
    }

    fn post_remeshing_audit(&self) -> TrackResult<()> {
        self.surf
            .mesh
            .audit_connectivity(self.params.allow_non_manifold)
            .map_err(|details| TrackError::InvariantViolation { details })?;
        if self.params.collision_safety {
            self.pipeline
                .assert_mesh_is_intersection_free(&self.surf, false)?;
        }
        Ok(())
    }

    fn fire_events(&mut self, events: Vec<RemeshEvent>) {
        for event in &events {
            for callback in &mut self.callbacks {
                callback(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tetrahedron() -> (Vec<Point3<f64>>, Vec<[usize; 3]>) {
        (
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.5, 0.866, 0.0),
                Point3::new(0.5, 0.289, 0.816),
            ],
            vec![[0, 2, 1], [0, 1, 3], [1, 2, 3], [2, 0, 3]],
        )
    }

    fn tracker_with(params: TrackerParams) -> SurfaceTracker {
        let (vertices, triangles) = tetrahedron();
        let masses = vec![1.0; vertices.len()];
        SurfaceTracker::new(vertices, &triangles, masses, params).unwrap()
    }

    #[test]
    fn test_free_flight_integration() {
        let mut tracker = tracker_with(TrackerParams::default());
        let velocities = vec![Vector3::new(0.0, 0.0, 1.0); 4];

        let before = tracker.position(0);
        tracker.advect(&velocities, 0.5).unwrap();
        let outcome = tracker.integrate(0.5).unwrap();

        assert_eq!(outcome.actual_dt, 0.5);
        assert_eq!(outcome.frozen_vertices, 0);
        assert!((tracker.position(0) - (before + Vector3::new(0.0, 0.0, 0.5))).norm() < 1e-12);
    }

    #[test]
    fn test_integrate_rejects_bad_dt() {
        let mut tracker = tracker_with(TrackerParams::default());
        assert!(tracker.integrate(0.0).is_err());
        assert!(tracker.integrate(-1.0).is_err());
        assert!(tracker.integrate(f64::NAN).is_err());
    }

    #[test]
    fn test_constructor_rejects_intersecting_input() {
        // Two triangles stabbed through each other.
        let vertices = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.25, 0.25, -0.5),
            Point3::new(0.25, 0.25, 0.5),
            Point3::new(2.0, 2.0, 0.0),
        ];
        let triangles = vec![[0, 1, 2], [3, 4, 5]];
        let result = SurfaceTracker::new(
            vertices,
            &triangles,
            vec![1.0; 6],
            TrackerParams::default(),
        );
        assert!(matches!(
            result,
            Err(TrackError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn test_improvement_splits_against_absolute_bound() {
        let params = TrackerParams {
            use_fraction: false,
            min_edge_length: 0.05,
            max_edge_length: 0.6,
            smoothing_factor: 0.0,
            ..TrackerParams::default()
        };
        let mut tracker = tracker_with(params);
        let before = tracker.num_triangles();
        tracker.improve_mesh().unwrap();
        assert!(tracker.num_triangles() > before);
    }

    #[test]
    fn test_events_are_delivered() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let params = TrackerParams {
            use_fraction: false,
            min_edge_length: 0.05,
            max_edge_length: 0.6,
            smoothing_factor: 0.0,
            ..TrackerParams::default()
        };
        let mut tracker = tracker_with(params);

        let seen = Rc::new(RefCell::new(0usize));
        let sink = Rc::clone(&seen);
        tracker.on_remesh_event(move |event| {
            if matches!(event, RemeshEvent::EdgeSplit { .. }) {
                *sink.borrow_mut() += 1;
            }
        });

        tracker.improve_mesh().unwrap();
        assert!(*seen.borrow() > 0);
    }

    #[test]
    fn test_defrag_returns_remap() {
        let mut tracker = tracker_with(TrackerParams::default());
        let remap = tracker.defrag_mesh().unwrap();
        assert_eq!(remap.vertex_map.len(), 4);
        assert!(remap.vertex_map.iter().all(|m| m.is_some()));
        assert_eq!(tracker.num_triangles(), 4);
    }

    #[test]
    fn test_deterministic_reintegration() {
        let run = || {
            let mut tracker = tracker_with(TrackerParams::default());
            let velocities = vec![Vector3::new(0.1, -0.05, 0.2); 4];
            tracker.advect(&velocities, 0.25).unwrap();
            tracker.integrate(0.25).unwrap();
            (0..tracker.num_vertices())
                .map(|v| tracker.position(v))
                .collect::<Vec<_>>()
        };
        let first = run();
        let second = run();
        // Bitwise identical.
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a, b);
        }
    }
}
