//! PLY → OBJ mesh conversion
//!
//! The export stage writes `model.ply`; clients download `model.obj`. Vertex
//! colours are carried over as the `v x y z r g b` extension when present.

use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PLY parsing error: {0}")]
    Ply(String),

    #[error("vertex {index}: {reason}")]
    Vertex { index: usize, reason: String },

    #[error("face {index} references vertex {vertex} of {count}")]
    FaceIndex {
        index: usize,
        vertex: i64,
        count: usize,
    },
}

#[derive(Deserialize, Debug)]
struct PlyFace {
    vertex_indices: Vec<i64>,
}

#[derive(Deserialize, Debug)]
struct PlyFile {
    vertex: Vec<HashMap<String, JsonValue>>,
    #[serde(default)]
    face: Vec<PlyFace>,
}

/// In-memory triangle mesh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub positions: Vec<[f64; 3]>,
    /// Per-vertex colour in 0..=1, empty when the source had none
    pub colors: Vec<[f64; 3]>,
    /// Zero-based vertex indices per face
    pub faces: Vec<Vec<usize>>,
}

fn get_f64(prop: Option<&JsonValue>) -> Option<f64> {
    prop.and_then(JsonValue::as_f64)
}

fn get_color(vertex: &HashMap<String, JsonValue>) -> Option<[f64; 3]> {
    let channel = |long: &str, short: &str| get_f64(vertex.get(long).or_else(|| vertex.get(short)));
    let (r, g, b) = (
        channel("red", "r")?,
        channel("green", "g")?,
        channel("blue", "b")?,
    );
    Some([r / 255.0, g / 255.0, b / 255.0])
}

impl Mesh {
    fn from_ply(ply: PlyFile) -> Result<Self, MeshError> {
        let count = ply.vertex.len();
        let mut mesh = Mesh {
            positions: Vec::with_capacity(count),
            colors: Vec::new(),
            faces: Vec::with_capacity(ply.face.len()),
        };

        let mut colors = Vec::with_capacity(count);
        for (index, vertex) in ply.vertex.iter().enumerate() {
            let coord = |name: &str| {
                get_f64(vertex.get(name)).ok_or_else(|| MeshError::Vertex {
                    index,
                    reason: format!("missing '{}'", name),
                })
            };
            mesh.positions.push([coord("x")?, coord("y")?, coord("z")?]);
            colors.push(get_color(vertex));
        }
        // Only keep colours if every vertex has one
        if let Some(colors) = colors.into_iter().collect::<Option<Vec<_>>>() {
            mesh.colors = colors;
        }

        for (index, face) in ply.face.into_iter().enumerate() {
            let indices = face
                .vertex_indices
                .into_iter()
                .map(|vertex| {
                    usize::try_from(vertex)
                        .ok()
                        .filter(|&v| v < count)
                        .ok_or(MeshError::FaceIndex {
                            index,
                            vertex,
                            count,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            mesh.faces.push(indices);
        }

        Ok(mesh)
    }

    /// Read a PLY file (ASCII or binary)
    pub fn read_ply(path: &Path) -> Result<Self, MeshError> {
        debug!("Loading PLY mesh from: {}", path.display());
        let reader = BufReader::new(File::open(path)?);
        let ply: PlyFile =
            serde_ply::from_reader(reader).map_err(|e| MeshError::Ply(e.to_string()))?;
        Self::from_ply(ply)
    }

    /// Write Wavefront OBJ; face indices become one-based
    pub fn write_obj<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        for (i, p) in self.positions.iter().enumerate() {
            match self.colors.get(i) {
                Some(c) => writeln!(
                    out,
                    "v {} {} {} {} {} {}",
                    p[0], p[1], p[2], c[0], c[1], c[2]
                )?,
                None => writeln!(out, "v {} {} {}", p[0], p[1], p[2])?,
            }
        }
        for face in &self.faces {
            write!(out, "f")?;
            for index in face {
                write!(out, " {}", index + 1)?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

/// Convert `ply_path` to `obj_path`, returning the mesh size
pub fn convert_ply_to_obj(ply_path: &Path, obj_path: &Path) -> Result<(usize, usize), MeshError> {
    let mesh = Mesh::read_ply(ply_path)?;

    let mut out = BufWriter::new(File::create(obj_path)?);
    mesh.write_obj(&mut out)?;
    out.flush()?;

    info!(
        vertices = mesh.positions.len(),
        faces = mesh.faces.len(),
        "Wrote {}",
        obj_path.display()
    );
    Ok((mesh.positions.len(), mesh.faces.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vertex(pairs: &[(&str, JsonValue)]) -> HashMap<String, JsonValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_obj_output_with_colors() {
        let ply = PlyFile {
            vertex: vec![
                vertex(&[
                    ("x", json!(0.0)),
                    ("y", json!(0.0)),
                    ("z", json!(0.0)),
                    ("red", json!(255)),
                    ("green", json!(0)),
                    ("blue", json!(0)),
                ]),
                vertex(&[
                    ("x", json!(1.0)),
                    ("y", json!(0.0)),
                    ("z", json!(0.0)),
                    ("red", json!(0)),
                    ("green", json!(255)),
                    ("blue", json!(0)),
                ]),
                vertex(&[
                    ("x", json!(0.0)),
                    ("y", json!(1.5)),
                    ("z", json!(0.0)),
                    ("red", json!(0)),
                    ("green", json!(0)),
                    ("blue", json!(255)),
                ]),
            ],
            face: vec![PlyFace {
                vertex_indices: vec![0, 1, 2],
            }],
        };

        let mesh = Mesh::from_ply(ply).unwrap();
        let mut out = Vec::new();
        mesh.write_obj(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(
            text,
            "v 0 0 0 1 0 0\nv 1 0 0 0 1 0\nv 0 1.5 0 0 0 1\nf 1 2 3\n"
        );
    }

    #[test]
    fn test_colors_dropped_unless_every_vertex_has_one() {
        let ply = PlyFile {
            vertex: vec![
                vertex(&[
                    ("x", json!(0.0)),
                    ("y", json!(0.0)),
                    ("z", json!(0.0)),
                    ("red", json!(10)),
                    ("green", json!(10)),
                    ("blue", json!(10)),
                ]),
                vertex(&[("x", json!(2.0)), ("y", json!(3.0)), ("z", json!(4.0))]),
            ],
            face: vec![],
        };

        let mesh = Mesh::from_ply(ply).unwrap();
        assert!(mesh.colors.is_empty());
        let mut out = Vec::new();
        mesh.write_obj(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "v 0 0 0\nv 2 3 4\n");
    }

    #[test]
    fn test_out_of_range_face_index_rejected() {
        let ply = PlyFile {
            vertex: vec![vertex(&[("x", json!(0.0)), ("y", json!(0.0)), ("z", json!(0.0))])],
            face: vec![PlyFace {
                vertex_indices: vec![0, 0, 3],
            }],
        };

        let err = Mesh::from_ply(ply).unwrap_err();
        assert!(matches!(
            err,
            MeshError::FaceIndex {
                index: 0,
                vertex: 3,
                count: 1
            }
        ));
    }

    #[test]
    fn test_missing_coordinate_rejected() {
        let ply = PlyFile {
            vertex: vec![vertex(&[("x", json!(0.0)), ("y", json!(0.0))])],
            face: vec![],
        };
        assert!(matches!(
            Mesh::from_ply(ply),
            Err(MeshError::Vertex { index: 0, .. })
        ));
    }

    #[test]
    fn test_unreadable_ply_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ply = tmp.path().join("model.ply");
        std::fs::write(&ply, b"not a ply file").unwrap();
        let result = convert_ply_to_obj(&ply, &tmp.path().join("model.obj"));
        assert!(result.is_err());
    }
}
