//! Broad-phase culling over six acceleration grids.
//!
//! Vertices, edges, and triangles are indexed separately, and each is split
//! into a solid grid and a dynamic grid so queries can restrict themselves to
//! the kinematically driven part of the surface, the free part, or both.

use mesh_collide::{Aabb, AccelerationGrid, MismatchedLengths};

use crate::error::{TrackError, TrackResult};

/// Broad-phase collision culling: {vertex, edge, triangle} x {solid, dynamic}.
#[derive(Debug, Clone, Default)]
pub struct BroadPhase {
    solid_vertex: AccelerationGrid,
    solid_edge: AccelerationGrid,
    solid_triangle: AccelerationGrid,
    dynamic_vertex: AccelerationGrid,
    dynamic_edge: AccelerationGrid,
    dynamic_triangle: AccelerationGrid,
}

impl BroadPhase {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Incremental maintenance
    // ------------------------------------------------------------------

    pub fn add_vertex(&mut self, index: usize, aabb: Aabb, is_solid: bool) {
        self.vertex_grid_mut(is_solid).add(index, aabb);
    }

    pub fn add_edge(&mut self, index: usize, aabb: Aabb, is_solid: bool) {
        self.edge_grid_mut(is_solid).add(index, aabb);
    }

    pub fn add_triangle(&mut self, index: usize, aabb: Aabb, is_solid: bool) {
        self.triangle_grid_mut(is_solid).add(index, aabb);
    }

    pub fn update_vertex(&mut self, index: usize, aabb: Aabb, is_solid: bool) {
        self.vertex_grid_mut(is_solid).update(index, aabb);
    }

    pub fn update_edge(&mut self, index: usize, aabb: Aabb, is_solid: bool) {
        self.edge_grid_mut(is_solid).update(index, aabb);
    }

    pub fn update_triangle(&mut self, index: usize, aabb: Aabb, is_solid: bool) {
        self.triangle_grid_mut(is_solid).update(index, aabb);
    }

    /// Remove a vertex from both grids. Safe if absent.
    pub fn remove_vertex(&mut self, index: usize) {
        self.solid_vertex.remove(index);
        self.dynamic_vertex.remove(index);
    }

    pub fn remove_edge(&mut self, index: usize) {
        self.solid_edge.remove(index);
        self.dynamic_edge.remove(index);
    }

    pub fn remove_triangle(&mut self, index: usize) {
        self.solid_triangle.remove(index);
        self.dynamic_triangle.remove(index);
    }

    // ------------------------------------------------------------------
    // Bulk rebuild
    // ------------------------------------------------------------------

    /// Rebuild the two vertex grids from scratch. The id and box slices of
    /// each set must be parallel.
    pub fn build_vertex_grids(
        &mut self,
        solid: (&[usize], &[Aabb]),
        dynamic: (&[usize], &[Aabb]),
        length_scale: f64,
        padding: f64,
    ) -> TrackResult<()> {
        self.solid_vertex
            .build(solid.0, solid.1, length_scale, padding)
            .map_err(mismatch_error)?;
        self.dynamic_vertex
            .build(dynamic.0, dynamic.1, length_scale, padding)
            .map_err(mismatch_error)
    }

    /// Rebuild the two edge grids from scratch.
    pub fn build_edge_grids(
        &mut self,
        solid: (&[usize], &[Aabb]),
        dynamic: (&[usize], &[Aabb]),
        length_scale: f64,
        padding: f64,
    ) -> TrackResult<()> {
        self.solid_edge
            .build(solid.0, solid.1, length_scale, padding)
            .map_err(mismatch_error)?;
        self.dynamic_edge
            .build(dynamic.0, dynamic.1, length_scale, padding)
            .map_err(mismatch_error)
    }

    /// Rebuild the two triangle grids from scratch.
    pub fn build_triangle_grids(
        &mut self,
        solid: (&[usize], &[Aabb]),
        dynamic: (&[usize], &[Aabb]),
        length_scale: f64,
        padding: f64,
    ) -> TrackResult<()> {
        self.solid_triangle
            .build(solid.0, solid.1, length_scale, padding)
            .map_err(mismatch_error)?;
        self.dynamic_triangle
            .build(dynamic.0, dynamic.1, length_scale, padding)
            .map_err(mismatch_error)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Vertices whose boxes overlap the query box, unioned over the requested
    /// grids.
    pub fn potential_vertex_collisions(
        &self,
        query: &Aabb,
        return_solid: bool,
        return_dynamic: bool,
    ) -> Vec<usize> {
        union_query(
            query,
            return_solid.then_some(&self.solid_vertex),
            return_dynamic.then_some(&self.dynamic_vertex),
        )
    }

    /// Edges whose boxes overlap the query box.
    pub fn potential_edge_collisions(
        &self,
        query: &Aabb,
        return_solid: bool,
        return_dynamic: bool,
    ) -> Vec<usize> {
        union_query(
            query,
            return_solid.then_some(&self.solid_edge),
            return_dynamic.then_some(&self.dynamic_edge),
        )
    }

    /// Triangles whose boxes overlap the query box.
    pub fn potential_triangle_collisions(
        &self,
        query: &Aabb,
        return_solid: bool,
        return_dynamic: bool,
    ) -> Vec<usize> {
        union_query(
            query,
            return_solid.then_some(&self.solid_triangle),
            return_dynamic.then_some(&self.dynamic_triangle),
        )
    }

    /// The box a vertex was registered with.
    pub fn vertex_aabb(&self, index: usize, is_solid: bool) -> Option<&Aabb> {
        self.vertex_grid(is_solid).element_aabb(index)
    }

    pub fn edge_aabb(&self, index: usize, is_solid: bool) -> Option<&Aabb> {
        self.edge_grid(is_solid).element_aabb(index)
    }

    pub fn triangle_aabb(&self, index: usize, is_solid: bool) -> Option<&Aabb> {
        self.triangle_grid(is_solid).element_aabb(index)
    }

    fn vertex_grid(&self, is_solid: bool) -> &AccelerationGrid {
        if is_solid {
            &self.solid_vertex
        } else {
            &self.dynamic_vertex
        }
    }

    fn edge_grid(&self, is_solid: bool) -> &AccelerationGrid {
        if is_solid {
            &self.solid_edge
        } else {
            &self.dynamic_edge
        }
    }

    fn triangle_grid(&self, is_solid: bool) -> &AccelerationGrid {
        if is_solid {
            &self.solid_triangle
        } else {
            &self.dynamic_triangle
        }
    }

    fn vertex_grid_mut(&mut self, is_solid: bool) -> &mut AccelerationGrid {
        if is_solid {
            &mut self.solid_vertex
        } else {
            &mut self.dynamic_vertex
        }
    }

    fn edge_grid_mut(&mut self, is_solid: bool) -> &mut AccelerationGrid {
        if is_solid {
            &mut self.solid_edge
        } else {
            &mut self.dynamic_edge
        }
    }

    fn triangle_grid_mut(&mut self, is_solid: bool) -> &mut AccelerationGrid {
        if is_solid {
            &mut self.solid_triangle
        } else {
            &mut self.dynamic_triangle
        }
    }
}

fn mismatch_error(source: MismatchedLengths) -> TrackError {
    TrackError::InvalidGeometry {
        details: format!("broad-phase build given {source}"),
    }
}

fn union_query(
    query: &Aabb,
    first: Option<&AccelerationGrid>,
    second: Option<&AccelerationGrid>,
) -> Vec<usize> {
    let mut found = Vec::new();
    if let Some(grid) = first {
        found.extend(grid.find_overlapping(query));
    }
    if let Some(grid) = second {
        found.extend(grid.find_overlapping(query));
    }
    found.sort_unstable();
    found.dedup();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    fn unit_box(x: f64) -> Aabb {
        Aabb::new(Point3::new(x, 0.0, 0.0), Point3::new(x + 1.0, 1.0, 1.0))
    }

    #[test]
    fn test_solid_dynamic_selection() {
        let mut bp = BroadPhase::new();
        bp.add_vertex(0, unit_box(0.0), true);
        bp.add_vertex(1, unit_box(0.5), false);

        let query = unit_box(0.25);
        assert_eq!(bp.potential_vertex_collisions(&query, true, false), vec![0]);
        assert_eq!(bp.potential_vertex_collisions(&query, false, true), vec![1]);
        assert_eq!(
            bp.potential_vertex_collisions(&query, true, true),
            vec![0, 1]
        );
        assert!(bp
            .potential_vertex_collisions(&query, false, false)
            .is_empty());
    }

    #[test]
    fn test_remove_clears_both_grids() {
        let mut bp = BroadPhase::new();
        bp.add_edge(4, unit_box(0.0), true);
        bp.remove_edge(4);
        assert!(bp
            .potential_edge_collisions(&unit_box(0.0), true, true)
            .is_empty());
    }

    #[test]
    fn test_update_moves_triangle() {
        let mut bp = BroadPhase::new();
        bp.add_triangle(2, unit_box(0.0), false);
        bp.update_triangle(2, unit_box(10.0), false);
        assert!(bp
            .potential_triangle_collisions(&unit_box(0.0), true, true)
            .is_empty());
        assert_eq!(
            bp.potential_triangle_collisions(&unit_box(10.0), true, true),
            vec![2]
        );
    }

    #[test]
    fn test_recorded_aabb_is_returned() {
        let mut bp = BroadPhase::new();
        let aabb = unit_box(3.0);
        bp.add_triangle(9, aabb, true);
        assert_eq!(bp.triangle_aabb(9, true), Some(&aabb));
        assert_eq!(bp.triangle_aabb(9, false), None);
    }
}
