//! Manifest Builder
//!
//! Turns the reconstruction's text model (`cameras.txt`, `images.txt`) into
//! `transforms.json` for NeRF training.
//!
//! `cameras.txt`: one line per camera, `CAMERA_ID MODEL WIDTH HEIGHT PARAMS...`
//!
//! `images.txt`: two lines per image. The first is
//! `IMAGE_ID QW QX QY QZ TX TY TZ CAMERA_ID NAME`; the second lists feature
//! points and is ignored (it may be empty).
//!
//! Lines starting with `#` are comments in both files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{
    compose_transform, CameraIntrinsics, PoseFrame, Quaternion, SceneManifest, SessionWorkspace,
};

/// Manifest build failure
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("reconstruction output not found: {}", .path.display())]
    MissingFile { path: PathBuf },

    #[error("{}:{line}: {reason}", .file.display())]
    Parse {
        file: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// How a camera model lays out its focal parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FocalLayout {
    /// `f, cx, cy, ...`
    Single,
    /// `fx, fy, cx, cy, ...`
    Separate,
}

/// Parameter count and focal layout per reconstruction camera model
fn camera_model(name: &str) -> Option<(usize, FocalLayout)> {
    use FocalLayout::*;
    let model = match name {
        "SIMPLE_PINHOLE" => (3, Single),
        "PINHOLE" => (4, Separate),
        "SIMPLE_RADIAL" => (4, Single),
        "RADIAL" => (5, Single),
        "OPENCV" => (8, Separate),
        "OPENCV_FISHEYE" => (8, Separate),
        "FULL_OPENCV" => (12, Separate),
        "FOV" => (5, Separate),
        "SIMPLE_RADIAL_FISHEYE" => (4, Single),
        "RADIAL_FISHEYE" => (5, Single),
        "THIN_PRISM_FISHEYE" => (12, Separate),
        _ => return None,
    };
    Some(model)
}

/// Cameras keyed by id, remembering the order they were read in
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraTable {
    order: Vec<u32>,
    by_id: HashMap<u32, CameraIntrinsics>,
}

impl CameraTable {
    pub fn get(&self, id: u32) -> Option<&CameraIntrinsics> {
        self.by_id.get(&id)
    }

    /// First camera in file order
    pub fn first(&self) -> Option<&CameraIntrinsics> {
        self.order.first().and_then(|id| self.by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn parse_error(file: &Path, line: usize, reason: impl Into<String>) -> ManifestError {
    ManifestError::Parse {
        file: file.to_path_buf(),
        line,
        reason: reason.into(),
    }
}

fn parse_number<T: std::str::FromStr>(
    token: &str,
    what: &str,
    file: &Path,
    line: usize,
) -> Result<T, ManifestError> {
    token
        .parse()
        .map_err(|_| parse_error(file, line, format!("invalid {}: {:?}", what, token)))
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// Parse `cameras.txt`
///
/// `file` is only used to attribute errors.
pub fn parse_cameras(text: &str, file: &Path) -> Result<CameraTable, ManifestError> {
    let mut table = CameraTable::default();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        if is_comment(raw) || raw.trim().is_empty() {
            continue;
        }

        let tokens: Vec<&str> = raw.split_whitespace().collect();
        if tokens.len() < 4 {
            return Err(parse_error(
                file,
                line_no,
                format!("expected at least 4 fields, found {}", tokens.len()),
            ));
        }

        let id: u32 = parse_number(tokens[0], "camera id", file, line_no)?;
        let (param_count, layout) = camera_model(tokens[1]).ok_or_else(|| {
            parse_error(file, line_no, format!("unknown camera model {}", tokens[1]))
        })?;
        if tokens.len() != 4 + param_count {
            return Err(parse_error(
                file,
                line_no,
                format!(
                    "{} camera needs {} fields, found {}",
                    tokens[1],
                    4 + param_count,
                    tokens.len()
                ),
            ));
        }

        let w = parse_number(tokens[2], "width", file, line_no)?;
        let h = parse_number(tokens[3], "height", file, line_no)?;
        let params = tokens[4..]
            .iter()
            .map(|t| parse_number::<f64>(t, "camera parameter", file, line_no))
            .collect::<Result<Vec<_>, _>>()?;

        let intrinsics = match layout {
            FocalLayout::Single => CameraIntrinsics {
                w,
                h,
                fl_x: params[0],
                fl_y: params[0],
                cx: params[1],
                cy: params[2],
            },
            FocalLayout::Separate => CameraIntrinsics {
                w,
                h,
                fl_x: params[0],
                fl_y: params[1],
                cx: params[2],
                cy: params[3],
            },
        };

        if table.by_id.insert(id, intrinsics).is_some() {
            return Err(parse_error(
                file,
                line_no,
                format!("duplicate camera id {}", id),
            ));
        }
        table.order.push(id);
    }

    if table.is_empty() {
        return Err(parse_error(file, 0, "no camera records"));
    }
    Ok(table)
}

/// Split off the first `n` whitespace-separated fields and return the rest
/// of the line
fn split_fields(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut rest = line.trim_start();
    let mut fields = Vec::with_capacity(n);
    for _ in 0..n {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields, rest.trim_end()))
}

/// Parse `images.txt` into frames, in file order
///
/// Image names may contain spaces; the name is whatever follows the ninth
/// field.
pub fn parse_images(
    text: &str,
    cameras: &CameraTable,
    file: &Path,
) -> Result<Vec<PoseFrame>, ManifestError> {
    let mut frames = Vec::new();
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !is_comment(line));

    while let Some((idx, pose_line)) = lines.next() {
        let line_no = idx + 1;
        if pose_line.trim().is_empty() {
            continue;
        }
        // Feature point line, possibly empty
        let _ = lines.next();

        let (fields, name) = match split_fields(pose_line, 9) {
            Some((fields, name)) if !name.is_empty() => (fields, name),
            _ => {
                return Err(parse_error(
                    file,
                    line_no,
                    format!(
                        "expected at least 10 fields, found {}",
                        pose_line.split_whitespace().count()
                    ),
                ))
            }
        };

        let mut values = [0.0f64; 7];
        for (slot, token) in values.iter_mut().zip(&fields[1..8]) {
            *slot = parse_number(token, "pose value", file, line_no)?;
        }
        let camera_id: u32 = parse_number(fields[8], "camera id", file, line_no)?;
        let intrinsics = *cameras.get(camera_id).ok_or_else(|| {
            parse_error(file, line_no, format!("unknown camera id {}", camera_id))
        })?;

        let [qw, qx, qy, qz, tx, ty, tz] = values;
        let rotation = Quaternion::new(qw, qx, qy, qz).to_rotation_matrix();

        frames.push(PoseFrame {
            file_path: format!("images/{}", name.replace('\\', "/")),
            transform_matrix: compose_transform(&rotation, [tx, ty, tz]),
            intrinsics,
            camera_id,
        });
    }

    Ok(frames)
}

/// Build a manifest from already-read text files
pub fn build_manifest(
    cameras_text: &str,
    cameras_file: &Path,
    images_text: &str,
    images_file: &Path,
) -> Result<SceneManifest, ManifestError> {
    let cameras = parse_cameras(cameras_text, cameras_file)?;
    let frames = parse_images(images_text, &cameras, images_file)?;

    let representative = *cameras
        .first()
        .ok_or_else(|| parse_error(cameras_file, 0, "no camera records"))?;
    if cameras.len() > 1 {
        warn!(
            cameras = cameras.len(),
            "Multiple cameras reconstructed; using the first as global intrinsics"
        );
    }

    Ok(SceneManifest::new(representative, frames))
}

async fn read_input(path: &Path) -> Result<String, ManifestError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ManifestError::MissingFile {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Writes `transforms.json` for a session
#[derive(Debug, Clone, Default)]
pub struct ManifestBuilder;

impl ManifestBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Parse the session's text model and write its manifest
    ///
    /// Overwrites any previous manifest. Identical inputs give a
    /// byte-identical file.
    pub async fn build(&self, workspace: &SessionWorkspace) -> Result<SceneManifest, ManifestError> {
        let cameras_file = workspace.cameras_txt();
        let images_file = workspace.images_txt();
        let cameras_text = read_input(&cameras_file).await?;
        let images_text = read_input(&images_file).await?;

        let manifest = build_manifest(&cameras_text, &cameras_file, &images_text, &images_file)?;

        let session_dir = workspace.dir();
        for frame in &manifest.frames {
            if !session_dir.join(&frame.file_path).exists() {
                warn!(
                    session_id = %workspace.id(),
                    file_path = %frame.file_path,
                    "Reconstructed image not found in session directory"
                );
            }
        }
        if manifest.frames.is_empty() {
            warn!(session_id = %workspace.id(), "Manifest has no frames");
        }

        let bytes = manifest.to_json_pretty()?;
        tokio::fs::write(workspace.manifest_path(), &bytes).await?;

        info!(
            session_id = %workspace.id(),
            frames = manifest.frames.len(),
            "Wrote scene manifest"
        );
        debug!(camera_angle_x = manifest.camera_angle_x, "Manifest intrinsics");

        Ok(manifest)
    }
}
