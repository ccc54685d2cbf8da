//! Surface serialization at the library boundary.
//!
//! A deliberately plain record format: a header with the vertex and triangle
//! counts, one `x y z mass` line per vertex, one `i j k` line per triangle.
//! Masses may be `inf` for solid vertices. Loading validates counts, index
//! ranges, finiteness, and mass positivity before handing the data back.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use nalgebra::Point3;
use tracing::info;

use crate::error::{TrackError, TrackResult};

const HEADER: &str = "mesh-track 1";

/// Raw surface data as read from a file.
#[derive(Debug, Clone)]
pub struct SurfaceData {
    pub vertices: Vec<Point3<f64>>,
    pub triangles: Vec<[usize; 3]>,
    pub masses: Vec<f64>,
}

/// Write a surface to `path`.
pub fn save_surface(
    path: impl AsRef<Path>,
    positions: &[Point3<f64>],
    triangles: &[[usize; 3]],
    masses: &[f64],
) -> TrackResult<()> {
    let path = path.as_ref();
    if positions.len() != masses.len() {
        return Err(TrackError::InvalidGeometry {
            details: format!(
                "{} vertices but {} masses",
                positions.len(),
                masses.len()
            ),
        });
    }

    let file = File::create(path).map_err(|source| TrackError::IoWrite {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);

    let write = |writer: &mut BufWriter<File>, line: String| -> TrackResult<()> {
        writeln!(writer, "{line}").map_err(|source| TrackError::IoWrite {
            path: path.to_path_buf(),
            source,
        })
    };

    write(&mut writer, HEADER.to_string())?;
    write(
        &mut writer,
        format!("{} {}", positions.len(), triangles.len()),
    )?;
    for (p, m) in positions.iter().zip(masses) {
        write(&mut writer, format!("{} {} {} {}", p.x, p.y, p.z, m))?;
    }
    for tri in triangles {
        write(&mut writer, format!("{} {} {}", tri[0], tri[1], tri[2]))?;
    }
    writer.flush().map_err(|source| TrackError::IoWrite {
        path: path.to_path_buf(),
        source,
    })?;

    info!(
        path = %path.display(),
        vertices = positions.len(),
        triangles = triangles.len(),
        "saved surface"
    );
    Ok(())
}

/// Read a surface from `path`, validating as it goes.
pub fn load_surface(path: impl AsRef<Path>) -> TrackResult<SurfaceData> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| TrackError::IoRead {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);

    let parse_error = |details: String| TrackError::ParseError {
        path: path.to_path_buf(),
        details,
    };

    let mut lines = reader.lines().enumerate();
    let mut next_line = || -> TrackResult<(usize, String)> {
        loop {
            match lines.next() {
                Some((index, Ok(line))) => {
                    if !line.trim().is_empty() {
                        return Ok((index + 1, line));
                    }
                }
                Some((_, Err(source))) => {
                    return Err(TrackError::IoRead {
                        path: path.to_path_buf(),
                        source,
                    })
                }
                None => {
                    return Err(TrackError::ParseError {
                        path: path.to_path_buf(),
                        details: "unexpected end of file".to_string(),
                    })
                }
            }
        }
    };

    let (_, header) = next_line()?;
    if header.trim() != HEADER {
        return Err(parse_error(format!("bad header {header:?}")));
    }

    let (line_no, counts) = next_line()?;
    let mut parts = counts.split_whitespace();
    let num_vertices: usize = parse_field(parts.next(), line_no, "vertex count", &parse_error)?;
    let num_triangles: usize =
        parse_field(parts.next(), line_no, "triangle count", &parse_error)?;

    let mut vertices = Vec::with_capacity(num_vertices);
    let mut masses = Vec::with_capacity(num_vertices);
    for _ in 0..num_vertices {
        let (line_no, line) = next_line()?;
        let mut parts = line.split_whitespace();
        let x: f64 = parse_field(parts.next(), line_no, "x", &parse_error)?;
        let y: f64 = parse_field(parts.next(), line_no, "y", &parse_error)?;
        let z: f64 = parse_field(parts.next(), line_no, "z", &parse_error)?;
        let mass: f64 = parse_field(parts.next(), line_no, "mass", &parse_error)?;
        if !(x.is_finite() && y.is_finite() && z.is_finite()) {
            return Err(parse_error(format!(
                "non-finite coordinate on line {line_no}"
            )));
        }
        if !(mass > 0.0) {
            return Err(parse_error(format!(
                "non-positive mass {mass} on line {line_no}"
            )));
        }
        vertices.push(Point3::new(x, y, z));
        masses.push(mass);
    }

    let mut triangles = Vec::with_capacity(num_triangles);
    for _ in 0..num_triangles {
        let (line_no, line) = next_line()?;
        let mut parts = line.split_whitespace();
        let i: usize = parse_field(parts.next(), line_no, "i", &parse_error)?;
        let j: usize = parse_field(parts.next(), line_no, "j", &parse_error)?;
        let k: usize = parse_field(parts.next(), line_no, "k", &parse_error)?;
        for v in [i, j, k] {
            if v >= num_vertices {
                return Err(parse_error(format!(
                    "triangle references missing vertex {v} on line {line_no}"
                )));
            }
        }
        if i == j || j == k || k == i {
            return Err(parse_error(format!(
                "degenerate triangle on line {line_no}"
            )));
        }
        triangles.push([i, j, k]);
    }

    Ok(SurfaceData {
        vertices,
        triangles,
        masses,
    })
}

fn parse_field<T: std::str::FromStr>(
    field: Option<&str>,
    line_no: usize,
    what: &str,
    parse_error: &impl Fn(String) -> TrackError,
) -> TrackResult<T> {
    let raw = field.ok_or_else(|| parse_error(format!("missing {what} on line {line_no}")))?;
    raw.parse()
        .map_err(|_| parse_error(format!("bad {what} {raw:?} on line {line_no}")))
}
