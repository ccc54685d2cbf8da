//! Non-destructive triangle mesh connectivity.
//!
//! Entity indices are stable for the lifetime of the mesh: removal tombstones
//! a slot instead of shifting its neighbours, and slots are never reused until
//! [`TriMesh::defrag`] compacts the tables and hands back a remap. A removed
//! triangle is stored as `[0, 0, 0]` and a removed edge as `[0, 0]`; a live
//! entity can never repeat a vertex, so the sentinel is unambiguous.
//!
//! The mesh stores connectivity only. Positions, masses, and predicted
//! positions live in the owning [`crate::DynamicSurface`].

use hashbrown::HashSet;

/// Sentinel stored in a removed triangle slot.
pub const TRIANGLE_TOMBSTONE: [usize; 3] = [0, 0, 0];
/// Sentinel stored in a removed edge slot.
pub const EDGE_TOMBSTONE: [usize; 2] = [0, 0];

/// Index remap produced by [`TriMesh::defrag`]. `None` means the old slot was
/// a tombstone (or an unreferenced vertex) and has no new index.
#[derive(Debug, Clone)]
pub struct MeshRemap {
    pub vertex_map: Vec<Option<usize>>,
    pub edge_map: Vec<Option<usize>>,
    pub triangle_map: Vec<Option<usize>>,
}

/// Triangle mesh connectivity with stable indices and full incidence maps.
#[derive(Debug, Clone, Default)]
pub struct TriMesh {
    triangles: Vec<[usize; 3]>,
    edges: Vec<[usize; 2]>,
    vertex_to_triangle: Vec<Vec<usize>>,
    vertex_to_edge: Vec<Vec<usize>>,
    triangle_to_edge: Vec<[usize; 3]>,
    edge_to_triangle: Vec<Vec<usize>>,
}

impl TriMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a mesh with `num_vertices` vertex slots and the given triangles.
    pub fn from_triangles(num_vertices: usize, triangles: &[[usize; 3]]) -> Self {
        let mut mesh = Self::new();
        for _ in 0..num_vertices {
            mesh.add_vertex();
        }
        for tri in triangles {
            mesh.add_triangle(*tri);
        }
        mesh
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Number of vertex slots (live and dead).
    #[inline]
    pub fn num_vertex_slots(&self) -> usize {
        self.vertex_to_triangle.len()
    }

    /// Number of triangle slots (live and tombstoned).
    #[inline]
    pub fn num_triangle_slots(&self) -> usize {
        self.triangles.len()
    }

    /// Number of edge slots (live and tombstoned).
    #[inline]
    pub fn num_edge_slots(&self) -> usize {
        self.edges.len()
    }

    /// Number of live triangles.
    pub fn num_live_triangles(&self) -> usize {
        self.triangles.iter().filter(|t| t[0] != t[1]).count()
    }

    #[inline]
    pub fn triangle(&self, t: usize) -> [usize; 3] {
        self.triangles[t]
    }

    #[inline]
    pub fn edge(&self, e: usize) -> [usize; 2] {
        self.edges[e]
    }

    #[inline]
    pub fn triangle_is_live(&self, t: usize) -> bool {
        let tri = self.triangles[t];
        tri[0] != tri[1]
    }

    #[inline]
    pub fn edge_is_live(&self, e: usize) -> bool {
        let edge = self.edges[e];
        edge[0] != edge[1]
    }

    /// The three edge indices of a triangle, aligned with its vertex order:
    /// `[edge(v0,v1), edge(v1,v2), edge(v2,v0)]`.
    #[inline]
    pub fn triangle_edges(&self, t: usize) -> [usize; 3] {
        self.triangle_to_edge[t]
    }

    #[inline]
    pub fn triangles_incident_to_vertex(&self, v: usize) -> &[usize] {
        &self.vertex_to_triangle[v]
    }

    #[inline]
    pub fn edges_incident_to_vertex(&self, v: usize) -> &[usize] {
        &self.vertex_to_edge[v]
    }

    #[inline]
    pub fn triangles_incident_to_edge(&self, e: usize) -> &[usize] {
        &self.edge_to_triangle[e]
    }

    /// Iterate over live triangles as `(index, vertices)`.
    pub fn live_triangles(&self) -> impl Iterator<Item = (usize, [usize; 3])> + '_ {
        self.triangles
            .iter()
            .enumerate()
            .filter(|(_, t)| t[0] != t[1])
            .map(|(i, t)| (i, *t))
    }

    /// Iterate over live edges as `(index, endpoints)`.
    pub fn live_edges(&self) -> impl Iterator<Item = (usize, [usize; 2])> + '_ {
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, e)| e[0] != e[1])
            .map(|(i, e)| (i, *e))
    }

    /// Index of the edge joining `a` and `b`, if one exists.
    pub fn get_edge_index(&self, a: usize, b: usize) -> Option<usize> {
        self.vertex_to_edge[a]
            .iter()
            .copied()
            .find(|&e| {
                let edge = self.edges[e];
                (edge[0] == a && edge[1] == b) || (edge[0] == b && edge[1] == a)
            })
    }

    /// Index of the live triangle with exactly these vertices (any order).
    pub fn get_triangle_index(&self, a: usize, b: usize, c: usize) -> Option<usize> {
        self.vertex_to_triangle[a].iter().copied().find(|&t| {
            let tri = self.triangles[t];
            let mut want = [a, b, c];
            let mut have = tri;
            want.sort_unstable();
            have.sort_unstable();
            want == have
        })
    }

    /// Do two live triangles share an edge?
    pub fn triangles_are_adjacent(&self, t0: usize, t1: usize) -> bool {
        if t0 == t1 {
            return false;
        }
        let e0 = self.triangle_to_edge[t0];
        let e1 = self.triangle_to_edge[t1];
        e0.iter().any(|e| e1.contains(e))
    }

    /// For an edge with exactly two incident triangles, the vertex of each
    /// triangle not on the edge, in incidence order.
    pub fn edge_opposite_vertices(&self, e: usize) -> Option<[usize; 2]> {
        let incident = &self.edge_to_triangle[e];
        if incident.len() != 2 {
            return None;
        }
        let edge = self.edges[e];
        let mut opposite = [usize::MAX; 2];
        for (slot, &t) in incident.iter().enumerate() {
            let tri = self.triangles[t];
            opposite[slot] = *tri
                .iter()
                .find(|v| **v != edge[0] && **v != edge[1])?;
        }
        Some(opposite)
    }

    /// Does triangle `t` contain the directed edge `a -> b` in its cyclic
    /// vertex order? Used to keep winding consistent across edits.
    pub fn triangle_contains_oriented_edge(&self, t: usize, a: usize, b: usize) -> bool {
        let tri = self.triangles[t];
        (tri[0] == a && tri[1] == b)
            || (tri[1] == a && tri[2] == b)
            || (tri[2] == a && tri[0] == b)
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Allocate a new vertex slot and return its index.
    pub fn add_vertex(&mut self) -> usize {
        self.vertex_to_triangle.push(Vec::new());
        self.vertex_to_edge.push(Vec::new());
        self.vertex_to_triangle.len() - 1
    }

    /// Add a triangle, creating or reusing its three edges, and return its
    /// index. The vertices must be distinct and in range.
    pub fn add_triangle(&mut self, tri: [usize; 3]) -> usize {
        assert!(
            tri[0] != tri[1] && tri[1] != tri[2] && tri[2] != tri[0],
            "triangle repeats a vertex: {tri:?}"
        );
        assert!(
            tri.iter().all(|&v| v < self.num_vertex_slots()),
            "triangle references missing vertex: {tri:?}"
        );

        let t = self.triangles.len();
        self.triangles.push(tri);

        let mut edge_indices = [0usize; 3];
        for (slot, (a, b)) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])]
            .into_iter()
            .enumerate()
        {
            let e = match self.get_edge_index(a, b) {
                Some(existing) => existing,
                None => self.add_edge(a, b),
            };
            edge_indices[slot] = e;
            self.edge_to_triangle[e].push(t);
        }
        self.triangle_to_edge.push(edge_indices);

        for &v in &tri {
            self.vertex_to_triangle[v].push(t);
        }

        t
    }

    /// Remove a triangle: tombstone the slot, unlink it everywhere, and
    /// tombstone any edge left with no incident triangles.
    pub fn remove_triangle(&mut self, t: usize) {
        if !self.triangle_is_live(t) {
            return;
        }
        let tri = self.triangles[t];
        for &v in &tri {
            self.vertex_to_triangle[v].retain(|&x| x != t);
        }
        let edges = self.triangle_to_edge[t];
        for e in edges {
            self.edge_to_triangle[e].retain(|&x| x != t);
            if self.edge_to_triangle[e].is_empty() {
                self.remove_edge(e);
            }
        }
        self.triangles[t] = TRIANGLE_TOMBSTONE;
        self.triangle_to_edge[t] = [0, 0, 0];
    }

    /// Remove a vertex by removing every triangle incident to it. The vertex
    /// slot itself remains (positions stay index-aligned) but carries no
    /// incidences afterwards.
    pub fn remove_vertex(&mut self, v: usize) {
        let incident: Vec<usize> = self.vertex_to_triangle[v].clone();
        for t in incident {
            self.remove_triangle(t);
        }
    }

    /// Empty all tables without releasing their storage.
    pub fn nondestructive_clear(&mut self) {
        self.triangles.clear();
        self.edges.clear();
        self.vertex_to_triangle.clear();
        self.vertex_to_edge.clear();
        self.triangle_to_edge.clear();
        self.edge_to_triangle.clear();
    }

    fn add_edge(&mut self, a: usize, b: usize) -> usize {
        debug_assert_ne!(a, b, "edge repeats a vertex");
        let e = self.edges.len();
        self.edges.push([a, b]);
        self.edge_to_triangle.push(Vec::new());
        self.vertex_to_edge[a].push(e);
        self.vertex_to_edge[b].push(e);
        e
    }

    fn remove_edge(&mut self, e: usize) {
        let edge = self.edges[e];
        self.vertex_to_edge[edge[0]].retain(|&x| x != e);
        self.vertex_to_edge[edge[1]].retain(|&x| x != e);
        self.edges[e] = EDGE_TOMBSTONE;
        self.edge_to_triangle[e].clear();
    }

    // ------------------------------------------------------------------
    // Defragmentation
    // ------------------------------------------------------------------

    /// Compact all tables, dropping tombstones and unreferenced vertices, and
    /// rebuild the incidence maps from scratch. Returns the remap external
    /// code must apply to any held indices.
    pub fn defrag(&mut self) -> MeshRemap {
        let mut vertex_map = vec![None; self.num_vertex_slots()];
        let mut next = 0usize;
        for v in 0..self.num_vertex_slots() {
            if !self.vertex_to_triangle[v].is_empty() {
                vertex_map[v] = Some(next);
                next += 1;
            }
        }
        let num_new_vertices = next;

        let mut triangle_map = vec![None; self.num_triangle_slots()];
        let mut new_triangles = Vec::with_capacity(self.num_live_triangles());
        for (t, tri) in self.live_triangles() {
            triangle_map[t] = Some(new_triangles.len());
            new_triangles.push([
                vertex_map[tri[0]].expect("live triangle references live vertex"),
                vertex_map[tri[1]].expect("live triangle references live vertex"),
                vertex_map[tri[2]].expect("live triangle references live vertex"),
            ]);
        }

        // Rebuild from the compacted triangle list; edges are renumbered in
        // first-seen order, which is deterministic given the triangle order.
        let mut edge_map = vec![None; self.num_edge_slots()];
        let old_edges = std::mem::take(&mut self.edges);

        let rebuilt = TriMesh::from_triangles(num_new_vertices, &new_triangles);

        for (e, edge) in old_edges.iter().enumerate() {
            if edge[0] == edge[1] {
                continue;
            }
            if let (Some(a), Some(b)) = (vertex_map[edge[0]], vertex_map[edge[1]]) {
                edge_map[e] = rebuilt.get_edge_index(a, b);
            }
        }

        *self = rebuilt;

        MeshRemap {
            vertex_map,
            edge_map,
            triangle_map,
        }
    }

    // ------------------------------------------------------------------
    // Auditing
    // ------------------------------------------------------------------

    /// Verify the connectivity invariants: mutual consistency of all incidence
    /// maps, no repeated vertices in live entities, and (when `allow_non_manifold`
    /// is false) at most two triangles per edge and at most one shared edge
    /// per triangle pair.
    pub fn audit_connectivity(&self, allow_non_manifold: bool) -> Result<(), String> {
        for (t, tri) in self.live_triangles() {
            if tri[1] == tri[2] || tri[2] == tri[0] {
                return Err(format!("triangle {t} repeats a vertex: {tri:?}"));
            }
            for &v in &tri {
                if v >= self.num_vertex_slots() {
                    return Err(format!("triangle {t} references missing vertex {v}"));
                }
                if !self.vertex_to_triangle[v].contains(&t) {
                    return Err(format!("vertex {v} missing incidence of triangle {t}"));
                }
            }
            for (slot, (a, b)) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])]
                .into_iter()
                .enumerate()
            {
                let e = self.triangle_to_edge[t][slot];
                let edge = self.edges[e];
                let matches =
                    (edge[0] == a && edge[1] == b) || (edge[0] == b && edge[1] == a);
                if !matches {
                    return Err(format!(
                        "triangle {t} edge slot {slot} points at edge {e} = {edge:?}, expected ({a},{b})"
                    ));
                }
                if !self.edge_to_triangle[e].contains(&t) {
                    return Err(format!("edge {e} missing incidence of triangle {t}"));
                }
            }
        }

        for (e, edge) in self.live_edges() {
            for &v in &edge {
                if !self.vertex_to_edge[v].contains(&e) {
                    return Err(format!("vertex {v} missing incidence of edge {e}"));
                }
            }
            for &t in &self.edge_to_triangle[e] {
                if !self.triangle_is_live(t) {
                    return Err(format!("edge {e} lists dead triangle {t}"));
                }
            }
            if !allow_non_manifold && self.edge_to_triangle[e].len() > 2 {
                return Err(format!(
                    "edge {e} has {} incident triangles",
                    self.edge_to_triangle[e].len()
                ));
            }
        }

        for (v, incident) in self.vertex_to_triangle.iter().enumerate() {
            for &t in incident {
                if !self.triangle_is_live(t) || !self.triangles[t].contains(&v) {
                    return Err(format!("vertex {v} lists stale triangle {t}"));
                }
            }
        }
        for (v, incident) in self.vertex_to_edge.iter().enumerate() {
            for &e in incident {
                if !self.edge_is_live(e) || !self.edges[e].contains(&v) {
                    return Err(format!("vertex {v} lists stale edge {e}"));
                }
            }
        }

        if !allow_non_manifold {
            // No two live triangles may share more than one edge.
            for (e, _) in self.live_edges() {
                let incident = &self.edge_to_triangle[e];
                for i in 0..incident.len() {
                    for j in (i + 1)..incident.len() {
                        let shared = self.triangle_to_edge[incident[i]]
                            .iter()
                            .filter(|x| self.triangle_to_edge[incident[j]].contains(x))
                            .count();
                        if shared > 1 {
                            return Err(format!(
                                "triangles {} and {} share {shared} edges",
                                incident[i], incident[j]
                            ));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Partition the triangles incident to `v` into face-connected components
    /// (triangles are connected when they share an edge). More than one
    /// component means the vertex is a non-manifold pinch point.
    pub fn vertex_neighbourhood_components(&self, v: usize) -> Vec<Vec<usize>> {
        let mut remaining: Vec<usize> = self.vertex_to_triangle[v].clone();
        let mut components = Vec::new();

        while let Some(seed) = remaining.pop() {
            let mut component = vec![seed];
            let mut frontier = vec![seed];
            while let Some(current) = frontier.pop() {
                let mut keep = Vec::with_capacity(remaining.len());
                for &other in &remaining {
                    if self.triangles_are_adjacent(current, other) {
                        component.push(other);
                        frontier.push(other);
                    } else {
                        keep.push(other);
                    }
                }
                remaining = keep;
            }
            components.push(component);
        }

        components
    }

    /// Number of face-connected components over the whole mesh.
    pub fn num_connected_components(&self) -> usize {
        let mut visited: HashSet<usize> = HashSet::new();
        let mut components = 0;

        for (seed, _) in self.live_triangles() {
            if visited.contains(&seed) {
                continue;
            }
            components += 1;
            let mut frontier = vec![seed];
            visited.insert(seed);
            while let Some(t) = frontier.pop() {
                for &e in &self.triangle_to_edge[t] {
                    for &other in &self.edge_to_triangle[e] {
                        if visited.insert(other) {
                            frontier.push(other);
                        }
                    }
                }
            }
        }

        components
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_triangle_mesh() -> TriMesh {
        // Two triangles sharing edge (1, 2).
        TriMesh::from_triangles(4, &[[0, 1, 2], [2, 1, 3]])
    }

    #[test]
    fn test_edge_deduplication() {
        let mesh = two_triangle_mesh();
        // 4 vertices, 2 triangles, 5 distinct edges.
        assert_eq!(mesh.num_edge_slots(), 5);
        assert!(mesh.get_edge_index(1, 2).is_some());
        assert_eq!(mesh.get_edge_index(1, 2), mesh.get_edge_index(2, 1));
    }

    #[test]
    fn test_add_triangle_adds_at_most_three_edges() {
        let mut mesh = TriMesh::from_triangles(4, &[[0, 1, 2]]);
        let before = mesh.num_edge_slots();
        mesh.add_triangle([2, 1, 3]);
        assert!(mesh.num_edge_slots() - before <= 3);
        assert_eq!(mesh.num_edge_slots() - before, 2);
    }

    #[test]
    fn test_adjacency() {
        let mesh = two_triangle_mesh();
        assert!(mesh.triangles_are_adjacent(0, 1));
        assert!(!mesh.triangles_are_adjacent(0, 0));
    }

    #[test]
    fn test_remove_triangle_tombstones() {
        let mut mesh = two_triangle_mesh();
        mesh.remove_triangle(0);

        assert!(!mesh.triangle_is_live(0));
        assert!(mesh.triangle_is_live(1));
        assert_eq!(mesh.num_live_triangles(), 1);
        // Indices are stable: triangle 1 is untouched.
        assert_eq!(mesh.triangle(1), [2, 1, 3]);
        // Edges only used by triangle 0 are tombstoned, the shared edge lives.
        assert!(mesh.get_edge_index(0, 1).is_none());
        assert!(mesh.get_edge_index(1, 2).is_some());
        mesh.audit_connectivity(false).unwrap();
    }

    #[test]
    fn test_removed_indices_not_reused() {
        let mut mesh = two_triangle_mesh();
        mesh.remove_triangle(0);
        let t = mesh.add_triangle([0, 1, 2]);
        assert_eq!(t, 2);
        assert!(!mesh.triangle_is_live(0));
        mesh.audit_connectivity(false).unwrap();
    }

    #[test]
    fn test_remove_vertex_removes_incident_triangles() {
        let mut mesh = two_triangle_mesh();
        mesh.remove_vertex(1);
        assert_eq!(mesh.num_live_triangles(), 0);
        assert!(mesh.triangles_incident_to_vertex(1).is_empty());
        assert!(mesh.edges_incident_to_vertex(1).is_empty());
        mesh.audit_connectivity(false).unwrap();
    }

    #[test]
    fn test_get_triangle_index() {
        let mesh = two_triangle_mesh();
        assert_eq!(mesh.get_triangle_index(0, 1, 2), Some(0));
        assert_eq!(mesh.get_triangle_index(2, 0, 1), Some(0));
        assert_eq!(mesh.get_triangle_index(1, 3, 2), Some(1));
        assert_eq!(mesh.get_triangle_index(0, 1, 3), None);
    }

    #[test]
    fn test_edge_opposite_vertices() {
        let mesh = two_triangle_mesh();
        let e = mesh.get_edge_index(1, 2).unwrap();
        let opposite = mesh.edge_opposite_vertices(e).unwrap();
        assert!(opposite.contains(&0));
        assert!(opposite.contains(&3));
    }

    #[test]
    fn test_oriented_edge() {
        let mesh = two_triangle_mesh();
        assert!(mesh.triangle_contains_oriented_edge(0, 1, 2));
        assert!(!mesh.triangle_contains_oriented_edge(0, 2, 1));
        assert!(mesh.triangle_contains_oriented_edge(1, 2, 1));
    }

    #[test]
    fn test_defrag_compacts_and_remaps() {
        let mut mesh = two_triangle_mesh();
        mesh.remove_triangle(0);

        let remap = mesh.defrag();

        assert_eq!(mesh.num_live_triangles(), 1);
        assert_eq!(mesh.num_triangle_slots(), 1);
        // Vertex 0 became unreferenced and was dropped.
        assert_eq!(remap.vertex_map[0], None);
        assert_eq!(mesh.num_vertex_slots(), 3);
        assert_eq!(remap.triangle_map[0], None);
        assert_eq!(remap.triangle_map[1], Some(0));

        let new_tri = mesh.triangle(0);
        let v1 = remap.vertex_map[1].unwrap();
        let v2 = remap.vertex_map[2].unwrap();
        let v3 = remap.vertex_map[3].unwrap();
        assert_eq!(new_tri, [v2, v1, v3]);
        mesh.audit_connectivity(false).unwrap();
    }

    #[test]
    fn test_defrag_is_idempotent() {
        let mut mesh = TriMesh::from_triangles(5, &[[0, 1, 2], [2, 1, 3], [3, 1, 4]]);
        mesh.remove_triangle(1);

        let mut other = mesh.clone();
        mesh.defrag();
        let first_tris: Vec<_> = mesh.live_triangles().collect();
        let first_edges: Vec<_> = mesh.live_edges().collect();

        other.defrag();
        other.defrag();
        let second_tris: Vec<_> = other.live_triangles().collect();
        let second_edges: Vec<_> = other.live_edges().collect();

        assert_eq!(first_tris, second_tris);
        assert_eq!(first_edges, second_edges);
    }

    #[test]
    fn test_vertex_neighbourhood_components() {
        // Two fans meeting only at vertex 0: a pinch point.
        let mesh = TriMesh::from_triangles(5, &[[0, 1, 2], [0, 3, 4]]);
        let components = mesh.vertex_neighbourhood_components(0);
        assert_eq!(components.len(), 2);

        let mesh = two_triangle_mesh();
        assert_eq!(mesh.vertex_neighbourhood_components(1).len(), 1);
    }

    #[test]
    fn test_connected_components() {
        let mesh = TriMesh::from_triangles(6, &[[0, 1, 2], [3, 4, 5]]);
        assert_eq!(mesh.num_connected_components(), 2);
        let mesh = two_triangle_mesh();
        assert_eq!(mesh.num_connected_components(), 1);
    }

    #[test]
    fn test_audit_catches_non_manifold_edge() {
        let mut mesh = TriMesh::from_triangles(5, &[[0, 1, 2], [2, 1, 3]]);
        mesh.add_triangle([1, 2, 4]);
        assert!(mesh.audit_connectivity(false).is_err());
        assert!(mesh.audit_connectivity(true).is_ok());
    }

    #[test]
    #[should_panic(expected = "repeats a vertex")]
    fn test_degenerate_triangle_rejected() {
        let mut mesh = TriMesh::new();
        mesh.add_vertex();
        mesh.add_vertex();
        mesh.add_triangle([0, 1, 1]);
    }
}
