//! Collision detection and resolution over one step.
//!
//! Three layers, invoked in order by the tracker:
//!
//! 1. **Proximity pass**: spring-like repulsion impulses (plus Coulomb
//!    friction) between primitives closer than `proximity_epsilon` at the
//!    current positions.
//! 2. **CCD impulse pass**: continuous collisions between current and
//!    predicted positions are cancelled by inelastic impulses; primitives
//!    touched by an impulse are re-examined so secondary contacts are caught.
//! 3. **Intersection audit**: an edge-vs-triangle sweep over the whole mesh
//!    that must come back empty after every public operation.
//!
//! The remeshing operators use the same machinery through
//! [`CollisionPipeline::triangle_introduces_intersection`] and
//! [`CollisionPipeline::motion_introduces_collision`] to prove an edit safe
//! before committing it.

use nalgebra::Vector3;
use tracing::{debug, warn};

use mesh_collide::{
    point_triangle_collision, point_triangle_distance, segment_segment_collision,
    segment_triangle_intersection, Aabb,
};

use crate::error::{TrackError, TrackResult};
use crate::surface::DynamicSurface;

/// Hard bound on the candidate list; exceeding it aborts the pass.
pub const MAX_CANDIDATES: usize = 1_000_000;
/// Hard bound on collisions gathered by a detection sweep.
const MAX_COLLISIONS: usize = 5_000;
/// Spring constant of the proximity repulsion impulse.
const PROXIMITY_SPRING_K: f64 = 10.0;

/// What a candidate pair is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CandidateKind {
    /// `(triangle index, vertex index)`.
    PointTriangle,
    /// `(edge index, edge index)`.
    EdgeEdge,
}

/// A broad-phase candidate pair.
pub type Candidate = (usize, usize, CandidateKind);

/// A narrow-phase collision between four vertices.
#[derive(Debug, Clone, Copy)]
pub struct Collision {
    pub is_edge_edge: bool,
    /// Point-triangle: `[v, t0, t1, t2]`. Edge-edge: `[a, b, c, d]`.
    pub vertex_indices: [usize; 4],
    /// Contact normal; the primitives approach along `-normal`.
    pub normal: Vector3<f64>,
    /// Unsigned contact weights, aligned with `vertex_indices`.
    pub weights: [f64; 4],
    /// Pre-impact approach along `normal` over the step (non-positive).
    pub relative_displacement: f64,
}

impl Collision {
    /// Signed simplex weights: relative contact motion is `sum alphas[i] * u_i`.
    pub fn alphas(&self) -> [f64; 4] {
        if self.is_edge_edge {
            [
                self.weights[0],
                self.weights[1],
                -self.weights[2],
                -self.weights[3],
            ]
        } else {
            [
                self.weights[0],
                -self.weights[1],
                -self.weights[2],
                -self.weights[3],
            ]
        }
    }
}

/// An edge-triangle intersection reported by the audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intersection {
    pub edge_index: usize,
    pub triangle_index: usize,
}

/// Outcome flags of a candidate-processing sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessStatus {
    pub collision_found: bool,
    pub overflow: bool,
    pub all_candidates_processed: bool,
}

/// Per-pipeline counters; replaces process-wide statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineDiagnostics {
    pub ccd_tests: usize,
    pub proximity_impulses: usize,
    pub collision_impulses: usize,
}

/// Where newly spawned candidates go during a sweep.
enum CandidateSink<'a> {
    /// Drop them (non-final passes).
    Discard,
    /// Append them to a separate list (final pass).
    Collect(&'a mut Vec<Candidate>),
    /// Append them to the list being drained (wind-down).
    Requeue,
}

/// Collision detection and resolution. Holds configuration and counters only;
/// the surface is passed by reference to each call.
#[derive(Debug, Clone)]
pub struct CollisionPipeline {
    pub friction_coefficient: f64,
    pub impulse_multiplier: f64,
    /// Number of full CCD sweeps before the wind-down phase.
    pub ccd_passes: usize,
    pub diagnostics: PipelineDiagnostics,
}

impl CollisionPipeline {
    pub fn new(friction_coefficient: f64, ccd_passes: usize) -> Self {
        Self {
            friction_coefficient,
            impulse_multiplier: 1.0,
            ccd_passes: ccd_passes.max(1),
            diagnostics: PipelineDiagnostics::default(),
        }
    }

    // ==================================================================
    // Impulse kernel
    // ==================================================================

    /// Distribute an impulse of the given magnitude along `normal` over four
    /// vertices with signed weights `alphas`, inverse-mass weighted, then cap
    /// a tangential friction impulse by the normal velocity change and the
    /// pre-impact tangential speed. Predicted positions are refreshed from
    /// the updated velocities so subsequent CCD sees the post-impulse step.
    fn apply_impulse(
        &mut self,
        surf: &mut DynamicSurface,
        alphas: [f64; 4],
        vertices: [usize; 4],
        impulse_magnitude: f64,
        normal: Vector3<f64>,
        dt: f64,
    ) {
        let inv_masses = vertices.map(|v| 1.0 / surf.mass(v));
        let denom: f64 = (0..4).map(|i| alphas[i] * alphas[i] * inv_masses[i]).sum();
        if denom < 1e-300 {
            // Every participant is solid; nothing can move.
            return;
        }
        let scaled = impulse_magnitude / denom;

        let pre_relative: Vector3<f64> = (0..4)
            .map(|i| alphas[i] * surf.velocity(vertices[i]))
            .sum();
        let pre_normal = normal.dot(&pre_relative) * normal;
        let pre_tangential = pre_relative - pre_normal;

        for i in 0..4 {
            let dv = scaled * alphas[i] * inv_masses[i] * normal;
            let v = surf.velocity(vertices[i]) + dv;
            surf.set_velocity(vertices[i], v);
        }

        // Coulomb friction: capped by mu * |dv_n| and by the tangential speed.
        let post_relative: Vector3<f64> = (0..4)
            .map(|i| alphas[i] * surf.velocity(vertices[i]))
            .sum();
        let post_normal = normal.dot(&post_relative) * normal;
        let delta_normal = (post_normal - pre_normal).norm();
        let friction_magnitude =
            (self.friction_coefficient * delta_normal).min(pre_tangential.norm());
        if friction_magnitude > 0.0 {
            let tangent_len = pre_tangential.norm();
            if tangent_len > 1e-8 {
                let tangent = -pre_tangential / tangent_len;
                let friction_scaled = friction_magnitude / denom;
                for i in 0..4 {
                    let dv = friction_scaled * alphas[i] * inv_masses[i] * tangent;
                    let v = surf.velocity(vertices[i]) + dv;
                    surf.set_velocity(vertices[i], v);
                }
            }
        }

        for &v in &vertices {
            let predicted = surf.position(v) + dt * surf.velocity(v);
            surf.set_newposition(v, predicted);
        }
    }

    fn apply_collision_impulse(
        &mut self,
        surf: &mut DynamicSurface,
        collision: &Collision,
        impulse_magnitude: f64,
        dt: f64,
    ) {
        self.apply_impulse(
            surf,
            collision.alphas(),
            collision.vertex_indices,
            impulse_magnitude,
            collision.normal,
            dt,
        );
    }

    // ==================================================================
    // Candidate generation
    // ==================================================================

    /// Point-triangle candidates for every vertex near triangle `t`.
    fn add_triangle_candidates(
        &self,
        surf: &DynamicSurface,
        t: usize,
        return_solid: bool,
        return_dynamic: bool,
        candidates: &mut Vec<Candidate>,
    ) {
        let bounds = surf.triangle_continuous_bounds(t);
        for v in
            surf.broad_phase
                .potential_vertex_collisions(&bounds, return_solid, return_dynamic)
        {
            candidates.push((t, v, CandidateKind::PointTriangle));
        }
    }

    /// Edge-edge candidates for every edge near edge `e`.
    fn add_edge_candidates(
        &self,
        surf: &DynamicSurface,
        e: usize,
        return_solid: bool,
        return_dynamic: bool,
        candidates: &mut Vec<Candidate>,
    ) {
        let bounds = surf.edge_continuous_bounds(e);
        for other in
            surf.broad_phase
                .potential_edge_collisions(&bounds, return_solid, return_dynamic)
        {
            candidates.push((e, other, CandidateKind::EdgeEdge));
        }
    }

    /// Point-triangle candidates for every triangle near vertex `v`.
    fn add_point_candidates(
        &self,
        surf: &DynamicSurface,
        v: usize,
        return_solid: bool,
        return_dynamic: bool,
        candidates: &mut Vec<Candidate>,
    ) {
        let bounds = surf.vertex_continuous_bounds(v);
        for t in
            surf.broad_phase
                .potential_triangle_collisions(&bounds, return_solid, return_dynamic)
        {
            candidates.push((t, v, CandidateKind::PointTriangle));
        }
    }

    /// Everything that could newly collide after vertex `v` received an
    /// impulse: the vertex against triangles, plus its incident triangles and
    /// edges against their surroundings. Solid vertices spawn nothing.
    fn add_point_update_candidates(
        &self,
        surf: &DynamicSurface,
        v: usize,
        candidates: &mut Vec<Candidate>,
    ) {
        if surf.vertex_is_solid(v) {
            return;
        }
        self.add_point_candidates(surf, v, true, true, candidates);
        for &t in surf.mesh.triangles_incident_to_vertex(v) {
            self.add_triangle_candidates(surf, t, true, true, candidates);
        }
        for &e in surf.mesh.edges_incident_to_vertex(v) {
            self.add_edge_candidates(surf, e, true, true, candidates);
        }
    }

    // ==================================================================
    // Narrow phase
    // ==================================================================

    /// CCD a point-triangle candidate. Incident pairs, dead entities, and
    /// solid-vs-solid pairs never collide.
    fn detect_point_triangle_collision(
        &mut self,
        surf: &DynamicSurface,
        candidate: &Candidate,
    ) -> Option<Collision> {
        debug_assert_eq!(candidate.2, CandidateKind::PointTriangle);
        let t = candidate.0;
        let v = candidate.1;
        if !surf.mesh.triangle_is_live(t) {
            return None;
        }
        let tri = surf.mesh.triangle(t);
        if tri.contains(&v) {
            return None;
        }
        if surf.triangle_is_solid(t) && surf.vertex_is_solid(v) {
            return None;
        }

        self.diagnostics.ccd_tests += 1;
        let hit = point_triangle_collision(
            &surf.position(v),
            &surf.predicted_position(v),
            &surf.position(tri[0]),
            &surf.predicted_position(tri[0]),
            &surf.position(tri[1]),
            &surf.predicted_position(tri[1]),
            &surf.position(tri[2]),
            &surf.predicted_position(tri[2]),
        )?;

        Some(Collision {
            is_edge_edge: false,
            vertex_indices: [v, tri[0], tri[1], tri[2]],
            normal: hit.normal,
            weights: hit.weights,
            relative_displacement: hit.relative_displacement,
        })
    }

    /// CCD an edge-edge candidate.
    fn detect_segment_segment_collision(
        &mut self,
        surf: &DynamicSurface,
        candidate: &Candidate,
    ) -> Option<Collision> {
        debug_assert_eq!(candidate.2, CandidateKind::EdgeEdge);
        if !surf.mesh.edge_is_live(candidate.0) || !surf.mesh.edge_is_live(candidate.1) {
            return None;
        }
        let mut e0 = surf.mesh.edge(candidate.0);
        let mut e1 = surf.mesh.edge(candidate.1);
        if e0.contains(&e1[0]) || e0.contains(&e1[1]) {
            return None;
        }
        if surf.edge_is_solid(candidate.0) && surf.edge_is_solid(candidate.1) {
            return None;
        }
        // Ascending endpoint order keeps the test independent of edge storage.
        if e0[1] < e0[0] {
            e0.swap(0, 1);
        }
        if e1[1] < e1[0] {
            e1.swap(0, 1);
        }

        self.diagnostics.ccd_tests += 1;
        let hit = segment_segment_collision(
            &surf.position(e0[0]),
            &surf.predicted_position(e0[0]),
            &surf.position(e0[1]),
            &surf.predicted_position(e0[1]),
            &surf.position(e1[0]),
            &surf.predicted_position(e1[0]),
            &surf.position(e1[1]),
            &surf.predicted_position(e1[1]),
        )?;

        Some(Collision {
            is_edge_edge: true,
            vertex_indices: [e0[0], e0[1], e1[0], e1[1]],
            normal: hit.normal,
            weights: hit.weights,
            relative_displacement: hit.relative_displacement,
        })
    }

    fn detect_candidate(
        &mut self,
        surf: &DynamicSurface,
        candidate: &Candidate,
    ) -> Option<Collision> {
        match candidate.2 {
            CandidateKind::PointTriangle => self.detect_point_triangle_collision(surf, candidate),
            CandidateKind::EdgeEdge => self.detect_segment_segment_collision(surf, candidate),
        }
    }

    // ==================================================================
    // Proximity pass
    // ==================================================================

    /// Apply repulsion impulses between everything closer than
    /// `proximity_epsilon` at the current positions.
    ///
    /// The impulse updates velocities and re-derives the predicted positions
    /// from them, so the pass effectively integrates the step a second time;
    /// this mirrors the original formulation and keeps the pass
    /// self-consistent on `x'`.
    pub fn handle_proximities(&mut self, surf: &mut DynamicSurface, dt: f64) {
        // Dynamic point vs solid triangles.
        let mut candidates = Vec::new();
        for v in 0..surf.num_vertices() {
            if !surf.vertex_is_solid(v) {
                self.add_point_candidates(surf, v, true, false, &mut candidates);
            }
        }
        self.process_proximity_candidates(surf, dt, &candidates);

        // Dynamic triangles vs all points.
        let mut candidates = Vec::new();
        let triangles: Vec<usize> = surf.mesh.live_triangles().map(|(t, _)| t).collect();
        for t in triangles {
            if !surf.triangle_is_solid(t) {
                self.add_triangle_candidates(surf, t, true, true, &mut candidates);
            }
        }
        self.process_proximity_candidates(surf, dt, &candidates);

        // Dynamic edges vs all edges.
        let mut candidates = Vec::new();
        let edges: Vec<usize> = surf.mesh.live_edges().map(|(e, _)| e).collect();
        for e in edges {
            if !surf.edge_is_solid(e) {
                self.add_edge_candidates(surf, e, true, true, &mut candidates);
            }
        }
        self.process_proximity_candidates(surf, dt, &candidates);
    }

    fn process_proximity_candidates(
        &mut self,
        surf: &mut DynamicSurface,
        dt: f64,
        candidates: &[Candidate],
    ) {
        let epsilon = surf.proximity_epsilon;
        for candidate in candidates {
            match candidate.2 {
                CandidateKind::EdgeEdge => {
                    if !surf.mesh.edge_is_live(candidate.0)
                        || !surf.mesh.edge_is_live(candidate.1)
                    {
                        continue;
                    }
                    let e0 = surf.mesh.edge(candidate.0);
                    let e1 = surf.mesh.edge(candidate.1);
                    if e0.contains(&e1[0]) || e0.contains(&e1[1]) {
                        continue;
                    }

                    let q = mesh_collide::edge_edge_distance(
                        &surf.position(e0[0]),
                        &surf.position(e0[1]),
                        &surf.position(e1[0]),
                        &surf.position(e1[1]),
                    );
                    if q.distance >= epsilon {
                        continue;
                    }
                    let weights = [q.w_a, 1.0 - q.w_a, q.w_c, 1.0 - q.w_c];
                    let collision = Collision {
                        is_edge_edge: true,
                        vertex_indices: [e0[0], e0[1], e1[0], e1[1]],
                        normal: q.normal,
                        weights,
                        relative_displacement: 0.0,
                    };
                    self.apply_proximity_impulse(surf, &collision, q.distance, dt);
                }
                CandidateKind::PointTriangle => {
                    let t = candidate.0;
                    let v = candidate.1;
                    if !surf.mesh.triangle_is_live(t) {
                        continue;
                    }
                    let tri = surf.mesh.triangle(t);
                    if tri.contains(&v) {
                        continue;
                    }

                    let q = point_triangle_distance(
                        &surf.position(v),
                        &surf.position(tri[0]),
                        &surf.position(tri[1]),
                        &surf.position(tri[2]),
                    );
                    if q.distance >= epsilon {
                        continue;
                    }
                    let weights = [1.0, q.weights[0], q.weights[1], q.weights[2]];
                    let collision = Collision {
                        is_edge_edge: false,
                        vertex_indices: [v, tri[0], tri[1], tri[2]],
                        normal: q.normal,
                        weights,
                        relative_displacement: 0.0,
                    };
                    self.apply_proximity_impulse(surf, &collision, q.distance, dt);
                }
            }
        }
    }

    /// Spring-law repulsion, fired only when the pair keeps approaching.
    fn apply_proximity_impulse(
        &mut self,
        surf: &mut DynamicSurface,
        collision: &Collision,
        distance: f64,
        dt: f64,
    ) {
        let alphas = collision.alphas();
        let relative_velocity: Vector3<f64> = (0..4)
            .map(|i| alphas[i] * surf.velocity(collision.vertex_indices[i]))
            .sum();
        let approach = collision.normal.dot(&relative_velocity);

        let gap = surf.proximity_epsilon - distance;
        // Already separating fast enough: leave it alone.
        if approach > 0.1 * gap / dt {
            return;
        }

        let impulse = (0.1 * gap / dt - approach)
            .max(0.0)
            .min(dt * PROXIMITY_SPRING_K * gap);
        if impulse <= 0.0 {
            return;
        }

        self.diagnostics.proximity_impulses += 1;
        self.apply_collision_impulse(surf, collision, impulse, dt);
    }

    // ==================================================================
    // CCD impulse pass
    // ==================================================================

    /// Iterated CCD resolution. Returns `true` when every detected collision
    /// was cancelled; `false` on candidate overflow or when collisions remain
    /// after the wind-down (the caller escalates to the impact-zone solver).
    pub fn handle_collisions(&mut self, surf: &mut DynamicSurface, dt: f64) -> bool {
        let mut update_candidates: Vec<Candidate> = Vec::new();

        for pass in 0..self.ccd_passes {
            let collect = pass + 1 == self.ccd_passes;
            let mut status = ProcessStatus::default();
            let mut collision_found = false;

            // Dynamic point vs solid triangles.
            for v in 0..surf.num_vertices() {
                if surf.vertex_is_solid(v) {
                    continue;
                }
                let mut candidates = Vec::new();
                self.add_point_candidates(surf, v, true, false, &mut candidates);
                self.drain_candidates(
                    surf,
                    dt,
                    &mut candidates,
                    if collect {
                        CandidateSink::Collect(&mut update_candidates)
                    } else {
                        CandidateSink::Discard
                    },
                    &mut status,
                );
            }
            collision_found |= status.collision_found;

            // Dynamic triangles vs all points.
            let triangles: Vec<usize> = surf.mesh.live_triangles().map(|(t, _)| t).collect();
            for t in triangles {
                if surf.triangle_is_solid(t) {
                    continue;
                }
                let mut candidates = Vec::new();
                self.add_triangle_candidates(surf, t, true, true, &mut candidates);
                self.drain_candidates(
                    surf,
                    dt,
                    &mut candidates,
                    if collect {
                        CandidateSink::Collect(&mut update_candidates)
                    } else {
                        CandidateSink::Discard
                    },
                    &mut status,
                );
            }
            collision_found |= status.collision_found;

            // Dynamic edges vs all edges.
            let edges: Vec<usize> = surf.mesh.live_edges().map(|(e, _)| e).collect();
            for e in edges {
                if surf.edge_is_solid(e) {
                    continue;
                }
                let mut candidates = Vec::new();
                self.add_edge_candidates(surf, e, true, true, &mut candidates);
                self.drain_candidates(
                    surf,
                    dt,
                    &mut candidates,
                    if collect {
                        CandidateSink::Collect(&mut update_candidates)
                    } else {
                        CandidateSink::Discard
                    },
                    &mut status,
                );
            }
            collision_found |= status.collision_found;

            if status.overflow {
                warn!("candidate list overflowed, aborting collision pass");
                return false;
            }
            if !collision_found {
                debug!(pass, "no collisions this pass");
                return true;
            }
        }

        // Wind down the accumulated residual candidates: deduplicate, then
        // drain with requeueing so secondary contacts are chased.
        update_candidates.sort_unstable();
        update_candidates.dedup();

        let mut status = ProcessStatus::default();
        self.drain_candidates(
            surf,
            dt,
            &mut update_candidates,
            CandidateSink::Requeue,
            &mut status,
        );

        let mut ok = status.all_candidates_processed;
        if status.overflow {
            warn!("candidate list overflowed during wind-down");
            ok = false;
        }
        if !ok {
            debug!("collision wind-down did not converge");
        }
        ok
    }

    /// Pop candidates, CCD each, cancel hits with impulses, and feed newly
    /// endangered primitives to the sink. Iteration is capped at five times
    /// the starting list length.
    fn drain_candidates(
        &mut self,
        surf: &mut DynamicSurface,
        dt: f64,
        candidates: &mut Vec<Candidate>,
        mut sink: CandidateSink<'_>,
        status: &mut ProcessStatus,
    ) {
        let max_iterations = 5 * candidates.len();
        let mut cursor = 0usize;
        let mut iterations = 0usize;

        while cursor < candidates.len() && iterations < max_iterations {
            iterations += 1;
            let candidate = candidates[cursor];
            cursor += 1;

            let Some(collision) = self.detect_candidate(surf, &candidate) else {
                continue;
            };

            let approach_velocity = collision.relative_displacement / dt;
            let impulse = self.impulse_multiplier * (0.0 - approach_velocity);
            self.apply_collision_impulse(surf, &collision, impulse, dt);
            self.diagnostics.collision_impulses += 1;
            status.collision_found = true;

            let remaining_capacity = |len: usize| len <= MAX_CANDIDATES;
            match &mut sink {
                CandidateSink::Discard => {}
                CandidateSink::Collect(new_candidates) => {
                    if !remaining_capacity(new_candidates.len()) {
                        status.overflow = true;
                    } else {
                        for &v in &collision.vertex_indices {
                            self.add_point_update_candidates(surf, v, new_candidates);
                        }
                    }
                }
                CandidateSink::Requeue => {
                    if !remaining_capacity(candidates.len()) {
                        status.overflow = true;
                    } else {
                        let mut spawned = Vec::new();
                        for &v in &collision.vertex_indices {
                            self.add_point_update_candidates(surf, v, &mut spawned);
                        }
                        candidates.extend(spawned);
                    }
                }
            }
        }

        status.all_candidates_processed = cursor >= candidates.len();
    }

    // ==================================================================
    // Detection sweeps (no response)
    // ==================================================================

    /// Gather every continuous collision in the mesh. Returns `false` when
    /// the sweep overflowed and the list is incomplete.
    pub fn detect_collisions(
        &mut self,
        surf: &DynamicSurface,
        collisions: &mut Vec<Collision>,
    ) -> bool {
        let mut candidates = Vec::new();
        for v in 0..surf.num_vertices() {
            if !surf.vertex_is_solid(v) {
                self.add_point_candidates(surf, v, true, false, &mut candidates);
            }
        }
        for (t, _) in surf.mesh.live_triangles() {
            if !surf.triangle_is_solid(t) {
                self.add_triangle_candidates(surf, t, true, true, &mut candidates);
            }
        }
        for (e, _) in surf.mesh.live_edges() {
            if !surf.edge_is_solid(e) {
                self.add_edge_candidates(surf, e, true, true, &mut candidates);
            }
        }
        self.test_candidates(surf, &candidates, collisions)
    }

    /// Gather continuous collisions among the given vertices and everything
    /// incident to them. Used by the impact-zone solver to re-examine zones.
    pub fn detect_collisions_near_vertices(
        &mut self,
        surf: &DynamicSurface,
        vertices: &[usize],
        collisions: &mut Vec<Collision>,
    ) -> bool {
        let mut zone_triangles: Vec<usize> = Vec::new();
        let mut zone_edges: Vec<usize> = Vec::new();
        for &v in vertices {
            zone_triangles.extend_from_slice(surf.mesh.triangles_incident_to_vertex(v));
            zone_edges.extend_from_slice(surf.mesh.edges_incident_to_vertex(v));
        }
        zone_triangles.sort_unstable();
        zone_triangles.dedup();
        zone_edges.sort_unstable();
        zone_edges.dedup();

        let mut candidates = Vec::new();
        for &v in vertices {
            self.add_point_candidates(surf, v, true, true, &mut candidates);
        }
        for &t in &zone_triangles {
            self.add_triangle_candidates(surf, t, true, true, &mut candidates);
        }
        for &e in &zone_edges {
            self.add_edge_candidates(surf, e, true, true, &mut candidates);
        }
        self.test_candidates(surf, &candidates, collisions)
    }

    fn test_candidates(
        &mut self,
        surf: &DynamicSurface,
        candidates: &[Candidate],
        collisions: &mut Vec<Collision>,
    ) -> bool {
        let mut deduped = candidates.to_vec();
        deduped.sort_unstable();
        deduped.dedup();

        for candidate in &deduped {
            if let Some(collision) = self.detect_candidate(surf, candidate) {
                collisions.push(collision);
                if collisions.len() > MAX_COLLISIONS {
                    warn!("collision sweep overflowed");
                    return false;
                }
            }
        }
        true
    }

    // ==================================================================
    // Intersection audit
    // ==================================================================

    /// Every intersecting non-incident edge/triangle pair, at either the
    /// current or the predicted positions. Degenerate configurations count as
    /// intersections when `degeneracy_counts_as_intersection` is set.
    pub fn get_intersections(
        &self,
        surf: &DynamicSurface,
        degeneracy_counts_as_intersection: bool,
        use_new_positions: bool,
    ) -> Vec<Intersection> {
        let mut intersections = Vec::new();

        for (t, triangle) in surf.mesh.live_triangles() {
            // Solid-vs-solid pairs cannot be resolved; skip soliciting them.
            let include_solid_edges = !surf.triangle_is_solid(t);

            let bounds = if use_new_positions {
                surf.triangle_continuous_bounds(t)
            } else {
                surf.triangle_static_bounds(t)
            };
            let edge_candidates = surf.broad_phase.potential_edge_collisions(
                &bounds,
                include_solid_edges,
                true,
            );

            for e in edge_candidates {
                if !surf.mesh.edge_is_live(e) {
                    continue;
                }
                let edge = surf.mesh.edge(e);
                if triangle.contains(&edge[0]) || triangle.contains(&edge[1]) {
                    continue;
                }

                let pos = |v: usize| {
                    if use_new_positions {
                        surf.predicted_position(v)
                    } else {
                        surf.position(v)
                    }
                };

                if segment_triangle_intersection(
                    &pos(edge[0]),
                    &pos(edge[1]),
                    &pos(triangle[0]),
                    &pos(triangle[1]),
                    &pos(triangle[2]),
                    degeneracy_counts_as_intersection,
                ) {
                    intersections.push(Intersection {
                        edge_index: e,
                        triangle_index: t,
                    });
                }
            }
        }

        intersections
    }

    /// Audit the current positions; a non-empty result is a broken contract.
    pub fn assert_mesh_is_intersection_free(
        &self,
        surf: &DynamicSurface,
        degeneracy_counts_as_intersection: bool,
    ) -> TrackResult<()> {
        let intersections =
            self.get_intersections(surf, degeneracy_counts_as_intersection, false);
        if let Some(first) = intersections.first() {
            return Err(TrackError::InvariantViolation {
                details: format!(
                    "mesh has {} edge-triangle intersections (first: edge {} vs triangle {})",
                    intersections.len(),
                    first.edge_index,
                    first.triangle_index
                ),
            });
        }
        Ok(())
    }

    /// Audit the predicted positions, catching a missed collision before the
    /// mesh is advected into an intersecting state.
    pub fn assert_predicted_mesh_is_intersection_free(
        &self,
        surf: &DynamicSurface,
        degeneracy_counts_as_intersection: bool,
    ) -> TrackResult<()> {
        let intersections =
            self.get_intersections(surf, degeneracy_counts_as_intersection, true);
        if let Some(first) = intersections.first() {
            return Err(TrackError::InvariantViolation {
                details: format!(
                    "predicted mesh has {} edge-triangle intersections (first: edge {} vs triangle {})",
                    intersections.len(),
                    first.edge_index,
                    first.triangle_index
                ),
            });
        }
        Ok(())
    }

    // ==================================================================
    // Remeshing safety checks
    // ==================================================================

    /// Would the triangle `tri` (at current positions) intersect the mesh?
    ///
    /// Checks the triangle's edges against nearby triangles and nearby edges
    /// against the triangle, skipping vertex-sharing pairs. The triangle need
    /// not be present in the mesh yet.
    pub fn triangle_introduces_intersection(
        &self,
        surf: &DynamicSurface,
        tri: [usize; 3],
    ) -> bool {
        self.triangle_introduces_intersection_excluding(surf, tri, &[])
    }

    /// As [`Self::triangle_introduces_intersection`], but counterpart
    /// primitives touching any vertex in `excluded` are not tested. A
    /// triangle replacing part of a fan inherits the fan's incidences: mesh
    /// edges ending exactly on the old fan's plane are contacts by
    /// construction, not intersections.
    pub fn triangle_introduces_intersection_excluding(
        &self,
        surf: &DynamicSurface,
        tri: [usize; 3],
        excluded: &[usize],
    ) -> bool {
        // The triangle's three edges vs surrounding triangles.
        for (a, b) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
            let bounds = Aabb::from_points(&[surf.position(a), surf.position(b)])
                .expanded(surf.aabb_padding);
            for t in surf
                .broad_phase
                .potential_triangle_collisions(&bounds, true, true)
            {
                if !surf.mesh.triangle_is_live(t) {
                    continue;
                }
                let other = surf.mesh.triangle(t);
                if other.contains(&a) || other.contains(&b) {
                    continue;
                }
                if other.iter().any(|v| excluded.contains(v)) {
                    continue;
                }
                if segment_triangle_intersection(
                    &surf.position(a),
                    &surf.position(b),
                    &surf.position(other[0]),
                    &surf.position(other[1]),
                    &surf.position(other[2]),
                    true,
                ) {
                    return true;
                }
            }
        }

        // Surrounding edges vs the triangle itself.
        let bounds = Aabb::from_points(&[
            surf.position(tri[0]),
            surf.position(tri[1]),
            surf.position(tri[2]),
        ])
        .expanded(surf.aabb_padding);
        for e in surf.broad_phase.potential_edge_collisions(&bounds, true, true) {
            if !surf.mesh.edge_is_live(e) {
                continue;
            }
            let edge = surf.mesh.edge(e);
            if tri.contains(&edge[0]) || tri.contains(&edge[1]) {
                continue;
            }
            if edge.iter().any(|v| excluded.contains(v)) {
                continue;
            }
            if segment_triangle_intersection(
                &surf.position(edge[0]),
                &surf.position(edge[1]),
                &surf.position(tri[0]),
                &surf.position(tri[1]),
                &surf.position(tri[2]),
                true,
            ) {
                return true;
            }
        }

        false
    }

    /// Would moving the given vertices from their current to their predicted
    /// positions (everything else at rest) cause a continuous collision?
    ///
    /// The caller stages the proposal by setting predicted positions for the
    /// moving vertices and leaving every other vertex with `x' = x`; on
    /// rejection it must restore them.
    pub fn motion_introduces_collision(
        &mut self,
        surf: &DynamicSurface,
        moving_vertices: &[usize],
    ) -> bool {
        self.motion_introduces_collision_excluding(surf, moving_vertices, &[])
    }

    /// As [`Self::motion_introduces_collision`], but candidate pairs where
    /// *both* primitives touch a vertex in `merging` are not tested. A
    /// collapse moves two fans onto one point: their mutual contact at the end
    /// of the motion is the intended outcome, not a collision, while contacts
    /// of either fan with the rest of the mesh remain real.
    pub fn motion_introduces_collision_excluding(
        &mut self,
        surf: &DynamicSurface,
        moving_vertices: &[usize],
        merging: &[usize],
    ) -> bool {
        let mut candidates = Vec::new();
        for &v in moving_vertices {
            self.add_point_candidates(surf, v, true, true, &mut candidates);
            for &t in surf.mesh.triangles_incident_to_vertex(v) {
                self.add_triangle_candidates(surf, t, true, true, &mut candidates);
            }
            for &e in surf.mesh.edges_incident_to_vertex(v) {
                self.add_edge_candidates(surf, e, true, true, &mut candidates);
            }
        }
        candidates.sort_unstable();
        candidates.dedup();

        candidates.iter().any(|candidate| {
            if !merging.is_empty() && self.candidate_pair_merges(surf, candidate, merging) {
                return false;
            }
            self.detect_candidate(surf, candidate).is_some()
        })
    }

    /// Do both primitives of the candidate touch the merging vertex set?
    fn candidate_pair_merges(
        &self,
        surf: &DynamicSurface,
        candidate: &Candidate,
        merging: &[usize],
    ) -> bool {
        match candidate.2 {
            CandidateKind::PointTriangle => {
                if !surf.mesh.triangle_is_live(candidate.0) {
                    return false;
                }
                let tri = surf.mesh.triangle(candidate.0);
                merging.contains(&candidate.1)
                    && tri.iter().any(|v| merging.contains(v))
            }
            CandidateKind::EdgeEdge => {
                if !surf.mesh.edge_is_live(candidate.0) || !surf.mesh.edge_is_live(candidate.1)
                {
                    return false;
                }
                let e0 = surf.mesh.edge(candidate.0);
                let e1 = surf.mesh.edge(candidate.1);
                e0.iter().any(|v| merging.contains(v))
                    && e1.iter().any(|v| merging.contains(v))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    fn surface_from(
        vertices: Vec<Point3<f64>>,
        triangles: &[[usize; 3]],
        masses: Vec<f64>,
    ) -> DynamicSurface {
        // Padding matches proximity_epsilon so proximity pairs stay visible
        // to the broad phase.
        DynamicSurface::new(vertices, triangles, masses, 1e-2, 1e-2).unwrap()
    }

    /// A triangle in the plane z = 0 and a vertical edge above it, joined to
    /// a far-away third vertex.
    fn edge_over_triangle(gap: f64) -> DynamicSurface {
        surface_from(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(0.25, 0.25, gap),
                Point3::new(0.25, 0.25, gap + 1.0),
                Point3::new(3.0, 3.0, gap),
            ],
            &[[0, 1, 2], [3, 4, 5]],
            vec![1.0; 6],
        )
    }

    #[test]
    fn test_ccd_pass_stops_piercing_point() {
        let mut surf = edge_over_triangle(0.5);
        // Vertex 3 dives through the triangle.
        surf.set_newposition(3, Point3::new(0.25, 0.25, -0.5));
        surf.compute_velocities(1.0);
        surf.rebuild_broad_phase(true).unwrap();

        let mut pipeline = CollisionPipeline::new(0.0, 1);
        let ok = pipeline.handle_collisions(&mut surf, 1.0);
        assert!(ok);
        assert!(pipeline.diagnostics.collision_impulses > 0);
        // The impulse must keep the predicted position above the plane.
        assert!(surf.predicted_position(3).z > -1e-9);
        pipeline
            .assert_predicted_mesh_is_intersection_free(&surf, false)
            .unwrap();
    }

    #[test]
    fn test_no_collision_is_a_noop() {
        let mut surf = edge_over_triangle(0.5);
        // Vertex 3 moves up, away from the triangle.
        surf.set_newposition(3, Point3::new(0.25, 0.25, 1.0));
        surf.compute_velocities(1.0);
        surf.rebuild_broad_phase(true).unwrap();

        let before: Vec<_> = (0..surf.num_vertices())
            .map(|v| surf.predicted_position(v))
            .collect();
        let mut pipeline = CollisionPipeline::new(0.0, 1);
        assert!(pipeline.handle_collisions(&mut surf, 1.0));
        assert_eq!(pipeline.diagnostics.collision_impulses, 0);
        for v in 0..surf.num_vertices() {
            assert_eq!(surf.predicted_position(v), before[v]);
        }
    }

    #[test]
    fn test_solid_vertices_do_not_move() {
        let mut surf = surface_from(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(0.25, 0.25, 0.5),
                Point3::new(0.25, 0.25, 1.5),
                Point3::new(3.0, 3.0, 0.5),
            ],
            &[[0, 1, 2], [3, 4, 5]],
            vec![f64::INFINITY, f64::INFINITY, f64::INFINITY, 1.0, 1.0, 1.0],
        );
        surf.set_newposition(3, Point3::new(0.25, 0.25, -0.5));
        surf.compute_velocities(1.0);
        surf.rebuild_broad_phase(true).unwrap();

        let mut pipeline = CollisionPipeline::new(0.0, 1);
        assert!(pipeline.handle_collisions(&mut surf, 1.0));
        // Solid triangle stayed exactly put.
        for v in 0..3 {
            assert_eq!(surf.predicted_position(v), surf.position(v));
        }
        // Dynamic vertex absorbed the whole impulse.
        assert!(surf.predicted_position(3).z > -1e-9);
    }

    #[test]
    fn test_proximity_pass_repels_near_contact() {
        let mut surf = edge_over_triangle(5e-3);
        // Drifting slowly downward, within proximity range.
        surf.set_newposition(3, Point3::new(0.25, 0.25, 4e-3));
        surf.compute_velocities(1.0);
        surf.rebuild_broad_phase(true).unwrap();

        let mut pipeline = CollisionPipeline::new(0.0, 1);
        pipeline.handle_proximities(&mut surf, 1.0);
        assert!(pipeline.diagnostics.proximity_impulses > 0);
        // Repulsion pushed the vertex to separate rather than approach.
        assert!(surf.predicted_position(3).z >= 4e-3);
    }

    #[test]
    fn test_proximity_at_exact_epsilon_is_zero() {
        // Gap exactly equal to proximity_epsilon: no impulse may fire.
        let mut surf = edge_over_triangle(1e-2);
        surf.compute_velocities(1.0);
        surf.rebuild_broad_phase(true).unwrap();

        let mut pipeline = CollisionPipeline::new(0.0, 1);
        pipeline.handle_proximities(&mut surf, 1.0);
        assert_eq!(pipeline.diagnostics.proximity_impulses, 0);
    }

    #[test]
    fn test_audit_finds_piercing_edge() {
        let mut surf = surface_from(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(0.25, 0.25, -0.5),
                Point3::new(0.25, 0.25, 0.5),
                Point3::new(3.0, 3.0, 0.0),
            ],
            &[[0, 1, 2], [3, 4, 5]],
            vec![1.0; 6],
        );
        surf.rebuild_broad_phase(false).unwrap();

        let pipeline = CollisionPipeline::new(0.0, 1);
        let intersections = pipeline.get_intersections(&surf, false, false);
        assert!(!intersections.is_empty());
        assert!(pipeline
            .assert_mesh_is_intersection_free(&surf, false)
            .is_err());
    }

    #[test]
    fn test_audit_ignores_incident_pairs() {
        let mut surf = surface_from(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
            ],
            &[[0, 1, 2], [2, 1, 3]],
            vec![1.0; 4],
        );
        surf.rebuild_broad_phase(false).unwrap();

        let pipeline = CollisionPipeline::new(0.0, 1);
        pipeline
            .assert_mesh_is_intersection_free(&surf, true)
            .unwrap();
    }

    #[test]
    fn test_triangle_introduces_intersection() {
        let mut surf = surface_from(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(0.25, 0.25, -0.5),
                Point3::new(0.25, 0.25, 0.5),
                Point3::new(0.5, -1.0, 0.0),
                Point3::new(5.0, 5.0, 5.0),
                Point3::new(6.0, 5.0, 5.0),
                Point3::new(5.0, 6.0, 5.0),
            ],
            &[[0, 1, 2]],
            vec![1.0; 9],
        );
        surf.rebuild_broad_phase(false).unwrap();

        let pipeline = CollisionPipeline::new(0.0, 1);
        // Triangle whose edge (3,4) pierces triangle 0.
        assert!(pipeline.triangle_introduces_intersection(&surf, [3, 4, 5]));
        // Far-away triangle is clean.
        assert!(!pipeline.triangle_introduces_intersection(&surf, [6, 7, 8]));
    }

    #[test]
    fn test_motion_check_catches_tunnelling() {
        let mut surf = edge_over_triangle(0.5);
        surf.rebuild_broad_phase(false).unwrap();
        let mut pipeline = CollisionPipeline::new(0.0, 1);

        // Proposal: vertex 3 tunnels through the triangle.
        surf.set_newposition(3, Point3::new(0.25, 0.25, -0.5));
        assert!(pipeline.motion_introduces_collision(&surf, &[3]));

        // Proposal: vertex 3 moves harmlessly upward.
        surf.set_newposition(3, Point3::new(0.25, 0.25, 0.75));
        assert!(!pipeline.motion_introduces_collision(&surf, &[3]));

        surf.set_newposition(3, surf.position(3));
    }
}
