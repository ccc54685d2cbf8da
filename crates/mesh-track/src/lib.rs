//! Robust dynamic triangle-mesh surface tracking.
//!
//! This crate advects a triangle surface through an externally supplied
//! velocity field while upholding three guarantees:
//!
//! - **Intersection-free**: the mesh never self-intersects, neither at the
//!   current positions nor after a committed step
//! - **Adaptive quality**: local remeshing (split, collapse, flip, smooth)
//!   keeps edge lengths and triangle shapes within configured targets
//! - **Safe topology changes**: nearby sheets merge and thin bridges pinch
//!   apart, each change proven collision-free before it is committed
//!
//! # Architecture
//!
//! [`SurfaceTracker`] owns a [`DynamicSurface`] (positions, predicted
//! positions, masses over a [`TriMesh`] with stable indices), a
//! [`CollisionPipeline`] (proximity impulses, continuous collision response,
//! intersection audits over a six-grid [`BroadPhase`]), an
//! [`ImpactZoneSolver`] for clustered contacts, and the remeshing operators.
//! Velocities are inputs; no physics lives here.
//!
//! Vertices with infinite mass are *solid*: kinematically scripted, never
//! moved by the pipeline.
//!
//! # Quick start
//!
//! ```no_run
//! use nalgebra::{Point3, Vector3};
//! use mesh_track::{SurfaceTracker, TrackerParams};
//!
//! # fn demo(vertices: Vec<Point3<f64>>, triangles: Vec<[usize; 3]>) -> mesh_track::TrackResult<()> {
//! let masses = vec![1.0; vertices.len()];
//! let mut tracker = SurfaceTracker::new(vertices, &triangles, masses, TrackerParams::default())?;
//!
//! for _ in 0..100 {
//!     let velocities: Vec<Vector3<f64>> = (0..tracker.num_vertices())
//!         .map(|v| -0.1 * tracker.position(v).coords)
//!         .collect();
//!     tracker.advect(&velocities, 0.01)?;
//!     tracker.integrate(0.01)?;
//!     tracker.improve_mesh()?;
//!     tracker.topology_changes()?;
//! }
//! # Ok(())
//! # }
//! ```

mod broadphase;
mod collapse;
mod error;
mod events;
mod flip;
mod io;
mod merge;
mod mesh;
mod pinch;
mod pipeline;
mod quality;
mod smooth;
mod split;
mod subdivision;
mod surface;
mod tracker;
mod tracing_ext;
mod zones;

pub use mesh_collide::{segment_triangle_intersection, Aabb};

pub use broadphase::BroadPhase;
pub use collapse::EdgeCollapser;
pub use error::{TrackError, TrackResult};
pub use events::RemeshEvent;
pub use flip::EdgeFlipper;
pub use io::{load_surface, save_surface, SurfaceData};
pub use merge::MeshMerger;
pub use mesh::{MeshRemap, TriMesh, EDGE_TOMBSTONE, TRIANGLE_TOMBSTONE};
pub use pinch::MeshPincher;
pub use pipeline::{
    Collision, CollisionPipeline, Intersection, PipelineDiagnostics, MAX_CANDIDATES,
};
pub use quality::{
    curvature_scaled_length, max_triangle_angle, min_mesh_angle, min_triangle_angle,
    mixed_area, triangle_angles, triangle_aspect_ratio, unsigned_vertex_mean_curvature,
    vertex_mean_curvature_normal,
};
pub use smooth::MeshSmoother;
pub use split::EdgeSplitter;
pub use subdivision::SubdivisionScheme;
pub use surface::DynamicSurface;
pub use tracker::{StepOutcome, SurfaceTracker, TrackerParams};
pub use tracing_ext::OperationTimer;
pub use zones::{ImpactZone, ImpactZoneSolver, ZoneOutcome};
