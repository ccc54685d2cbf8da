//! New-vertex positioning for edge splits.
//!
//! When the splitter divides an edge it asks the configured scheme where the
//! new vertex goes. Midpoint keeps the surface piecewise linear; the butterfly
//! variants interpolate the neighbourhood for a smoother limit surface. Every
//! scheme degrades to the midpoint when its stencil is incomplete (boundary or
//! non-manifold edges).

use nalgebra::Point3;

use crate::surface::DynamicSurface;

/// Positioning rule for a vertex inserted on a split edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "config-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SubdivisionScheme {
    /// Midpoint of the edge.
    LinearMidpoint,
    /// Eight-point butterfly stencil on interior edges.
    #[default]
    Butterfly,
    /// Butterfly with valence-corrected weights at irregular vertices.
    ModifiedButterfly,
}

impl SubdivisionScheme {
    /// Propose a position for the vertex created by splitting `edge`.
    pub fn propose_vertex_position(
        &self,
        surface: &DynamicSurface,
        edge: usize,
    ) -> Point3<f64> {
        let endpoints = surface.mesh.edge(edge);
        let midpoint = Point3::from(
            0.5 * (surface.position(endpoints[0]).coords + surface.position(endpoints[1]).coords),
        );

        match self {
            SubdivisionScheme::LinearMidpoint => midpoint,
            SubdivisionScheme::Butterfly => {
                butterfly_position(surface, edge).unwrap_or(midpoint)
            }
            SubdivisionScheme::ModifiedButterfly => {
                modified_butterfly_position(surface, edge).unwrap_or(midpoint)
            }
        }
    }
}

/// Classic butterfly: 1/2 (a + b) + 1/8 (c + d) - 1/16 (wings).
///
/// `c` and `d` are the vertices opposite the edge in its two incident
/// triangles; the four wings sit opposite the edges `(a,c)`, `(a,d)`, `(b,c)`,
/// `(b,d)`. Returns `None` whenever the stencil is incomplete.
fn butterfly_position(surface: &DynamicSurface, edge: usize) -> Option<Point3<f64>> {
    let [a, b] = surface.mesh.edge(edge);
    let [c, d] = surface.mesh.edge_opposite_vertices(edge)?;

    let mut wings = [0usize; 4];
    for (slot, (u, v, skip)) in [(a, c, b), (a, d, b), (b, c, a), (b, d, a)]
        .into_iter()
        .enumerate()
    {
        let side = surface.mesh.get_edge_index(u, v)?;
        let opposite = surface.mesh.edge_opposite_vertices(side)?;
        wings[slot] = if opposite[0] == skip {
            opposite[1]
        } else if opposite[1] == skip {
            opposite[0]
        } else {
            return None;
        };
    }

    let p = 0.5 * (surface.position(a).coords + surface.position(b).coords)
        + 0.125 * (surface.position(c).coords + surface.position(d).coords)
        - 0.0625
            * (surface.position(wings[0]).coords
                + surface.position(wings[1]).coords
                + surface.position(wings[2]).coords
                + surface.position(wings[3]).coords);
    Some(Point3::from(p))
}

/// Zorin's modified butterfly: regular edges use the classic stencil, an
/// irregular endpoint uses valence-adapted ring weights, and an edge with two
/// irregular endpoints averages the two one-sided proposals.
fn modified_butterfly_position(surface: &DynamicSurface, edge: usize) -> Option<Point3<f64>> {
    let [a, b] = surface.mesh.edge(edge);
    let valence_a = surface.mesh.edges_incident_to_vertex(a).len();
    let valence_b = surface.mesh.edges_incident_to_vertex(b).len();

    match (valence_a == 6, valence_b == 6) {
        (true, true) => butterfly_position(surface, edge),
        (false, true) => irregular_endpoint_position(surface, a, b),
        (true, false) => irregular_endpoint_position(surface, b, a),
        (false, false) => {
            let pa = irregular_endpoint_position(surface, a, b)?;
            let pb = irregular_endpoint_position(surface, b, a)?;
            Some(Point3::from(0.5 * (pa.coords + pb.coords)))
        }
    }
}

/// One-sided stencil around irregular vertex `hub`, with the ring ordered to
/// start at `other` (the far end of the split edge).
fn irregular_endpoint_position(
    surface: &DynamicSurface,
    hub: usize,
    other: usize,
) -> Option<Point3<f64>> {
    let ring = ordered_one_ring(surface, hub, other)?;
    let k = ring.len();
    if k < 3 {
        return None;
    }

    let mut p = 0.75 * surface.position(hub).coords;
    match k {
        3 => {
            p += (5.0 / 12.0) * surface.position(ring[0]).coords;
            p -= (1.0 / 12.0)
                * (surface.position(ring[1]).coords + surface.position(ring[2]).coords);
        }
        4 => {
            p += 0.375 * surface.position(ring[0]).coords;
            p -= 0.125 * surface.position(ring[2]).coords;
        }
        _ => {
            let kf = k as f64;
            for (j, &v) in ring.iter().enumerate() {
                let theta = 2.0 * std::f64::consts::PI * j as f64 / kf;
                let s = (0.25 + theta.cos() + 0.5 * (2.0 * theta).cos()) / kf;
                p += s * surface.position(v).coords;
            }
        }
    }
    Some(Point3::from(p))
}

/// The one-ring neighbours of `hub` in rotational order, starting from
/// `start`. Fails on boundary or non-manifold neighbourhoods.
fn ordered_one_ring(
    surface: &DynamicSurface,
    hub: usize,
    start: usize,
) -> Option<Vec<usize>> {
    let valence = surface.mesh.edges_incident_to_vertex(hub).len();
    let mut ring = vec![start];
    let mut previous_triangle = usize::MAX;

    loop {
        let current = *ring.last().unwrap();
        let spoke = surface.mesh.get_edge_index(hub, current)?;
        let incident = surface.mesh.triangles_incident_to_edge(spoke);
        if incident.len() != 2 {
            return None;
        }
        let next_triangle = if incident[0] == previous_triangle {
            incident[1]
        } else if incident[1] == previous_triangle {
            incident[0]
        } else if previous_triangle == usize::MAX {
            incident[0]
        } else {
            return None;
        };

        let tri = surface.mesh.triangle(next_triangle);
        let next = *tri.iter().find(|&&v| v != hub && v != current)?;
        if next == start {
            break;
        }
        ring.push(next);
        if ring.len() > valence {
            return None;
        }
        previous_triangle = next_triangle;
    }

    if ring.len() == valence {
        Some(ring)
    } else {
        None
    }
}
