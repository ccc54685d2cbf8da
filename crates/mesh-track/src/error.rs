//! Error types for surface tracking operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for tracking operations.
pub type TrackResult<T> = Result<T, TrackError>;

/// Errors that can occur during surface tracking.
///
/// Recoverable conditions are not errors: a remeshing operation that fails its
/// safety check silently aborts, candidate overflow and CCD non-convergence
/// escalate internally (impact zones, rigid freeze, smaller sub-steps), and an
/// `integrate` step that cannot be made safe reports an unchanged mesh through
/// its return value. These variants cover data-model breaches and boundary
/// I/O only.
#[derive(Debug, Error)]
pub enum TrackError {
    /// The data-model contract was breached: inconsistent incidence maps or a
    /// self-intersection survived an operation that must not produce one.
    /// Continuing after this is unsafe.
    #[error("invariant violation: {details}")]
    InvariantViolation { details: String },

    /// Caller input was malformed: mismatched parallel arrays, bad indices,
    /// non-finite coordinates, non-positive masses.
    #[error("invalid geometry: {details}")]
    InvalidGeometry { details: String },

    /// Error reading a surface file.
    #[error("failed to read surface from {path}: {source}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error writing a surface file.
    #[error("failed to write surface to {path}: {source}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error parsing a surface file.
    #[error("failed to parse surface from {path}: {details}")]
    ParseError { path: PathBuf, details: String },
}
