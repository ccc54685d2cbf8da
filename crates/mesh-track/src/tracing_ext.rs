//! Tracing helpers for tracker operations.
//!
//! Enable output by installing a `tracing` subscriber in the embedding
//! application; `RUST_LOG=mesh_track=debug` surfaces per-pass details.

use std::time::Instant;
use tracing::{debug, info};

/// A timer that logs the duration of a tracker operation on drop.
pub struct OperationTimer {
    name: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(name: &'static str) -> Self {
        debug!(target: "mesh_track::timing", operation = name, "starting");
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        info!(
            target: "mesh_track::timing",
            operation = self.name,
            elapsed_ms = format!("{:.2}", self.elapsed_ms()),
            "completed"
        );
    }
}
