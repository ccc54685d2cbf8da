//! Remeshing event kinds.
//!
//! Operators report what they committed through these records; the tracker
//! forwards them to registered callbacks. Indices are valid at the moment the
//! event fires and may be invalidated by later edits or defragmentation.

/// A committed remeshing operation.
#[derive(Debug, Clone)]
pub enum RemeshEvent {
    /// An edge was split: two (or one, on the boundary) triangles became four
    /// (or two), with `new_vertex` inserted on the edge.
    EdgeSplit {
        edge: [usize; 2],
        new_vertex: usize,
        added_triangles: Vec<usize>,
    },
    /// An edge was collapsed: `removed_vertex` was merged into `kept_vertex`.
    EdgeCollapse {
        edge: [usize; 2],
        kept_vertex: usize,
        removed_vertex: usize,
    },
    /// The diagonal of a triangle pair was flipped.
    EdgeFlip {
        old_edge: [usize; 2],
        new_edge: [usize; 2],
    },
    /// A smoothing pass moved this many vertices.
    SmoothingPass { vertices_moved: usize },
    /// A pinch vertex was duplicated into one copy per neighbourhood
    /// component, separating the surface locally.
    VertexPinch {
        vertex: usize,
        duplicates: Vec<usize>,
    },
    /// Two nearby sheets were zipped together across a pair of edges.
    SheetsMerged {
        edge0: [usize; 2],
        edge1: [usize; 2],
    },
}
