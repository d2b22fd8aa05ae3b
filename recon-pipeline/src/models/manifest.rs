//! Scene manifest (`transforms.json`) data model
//!
//! The manifest is the hand-off file between reconstruction and NeRF
//! training. Its JSON layout is consumed by the training script and must not
//! change:
//!
//! ```json
//! {
//!     "camera_angle_x": 0.54,
//!     "w": 1920, "h": 1080,
//!     "fl_x": 1600.0, "fl_y": 1600.0, "cx": 960.0, "cy": 540.0,
//!     "aabb_scale": 4,
//!     "frames": [
//!         {"file_path": "images/0001.jpg", "transform_matrix": [[...], ...],
//!          "w": 1920, "h": 1080, "fl_x": 1600.0, "fl_y": 1600.0, "cx": 960.0, "cy": 540.0}
//!     ]
//! }
//! ```

use serde::{Deserialize, Serialize};

/// Fixed axis-aligned bounding box scale written to every manifest
pub const AABB_SCALE: u32 = 4;

/// Row-major 4x4 rigid transform
pub type TransformMatrix = [[f64; 4]; 4];

/// Row-major 3x3 rotation
pub type RotationMatrix = [[f64; 3]; 3];

/// Pinhole intrinsics of one reconstruction camera
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub w: u32,
    pub h: u32,
    pub fl_x: f64,
    pub fl_y: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    /// Horizontal field-of-view angle as the training script expects it:
    /// `atan(w / (2 * fl_x))`
    pub fn camera_angle_x(&self) -> f64 {
        (self.w as f64 / (2.0 * self.fl_x)).atan()
    }
}

/// Unit quaternion in scalar-first order (qw, qx, qy, qz)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    /// Rotation matrix of this quaternion
    ///
    /// Must stay exactly this formula: any sign or index slip here silently
    /// corrupts every trained model.
    pub fn to_rotation_matrix(&self) -> RotationMatrix {
        let (q0, q1, q2, q3) = (self.w, self.x, self.y, self.z);
        [
            [
                1.0 - 2.0 * (q2 * q2 + q3 * q3),
                2.0 * (q1 * q2 - q3 * q0),
                2.0 * (q1 * q3 + q2 * q0),
            ],
            [
                2.0 * (q1 * q2 + q3 * q0),
                1.0 - 2.0 * (q1 * q1 + q3 * q3),
                2.0 * (q2 * q3 - q1 * q0),
            ],
            [
                2.0 * (q1 * q3 - q2 * q0),
                2.0 * (q2 * q3 + q1 * q0),
                1.0 - 2.0 * (q1 * q1 + q2 * q2),
            ],
        ]
    }
}

/// Assemble `[R | t; 0 0 0 1]`
pub fn compose_transform(rotation: &RotationMatrix, translation: [f64; 3]) -> TransformMatrix {
    let mut m = [[0.0; 4]; 4];
    for row in 0..3 {
        m[row][..3].copy_from_slice(&rotation[row]);
        m[row][3] = translation[row];
    }
    m[3] = [0.0, 0.0, 0.0, 1.0];
    m
}

/// One reconstructed image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseFrame {
    /// Path relative to the session directory, forward slashes only
    pub file_path: String,
    pub transform_matrix: TransformMatrix,
    #[serde(flatten)]
    pub intrinsics: CameraIntrinsics,
    /// Reconstruction camera id; not part of the file format
    #[serde(skip)]
    pub camera_id: u32,
}

/// Contents of `transforms.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneManifest {
    pub camera_angle_x: f64,
    /// Representative (first-seen) camera, flattened into the top level
    #[serde(flatten)]
    pub intrinsics: CameraIntrinsics,
    pub aabb_scale: u32,
    pub frames: Vec<PoseFrame>,
}

impl SceneManifest {
    /// Build a manifest around a representative camera
    pub fn new(representative: CameraIntrinsics, frames: Vec<PoseFrame>) -> Self {
        Self {
            camera_angle_x: representative.camera_angle_x(),
            intrinsics: representative,
            aabb_scale: AABB_SCALE,
            frames,
        }
    }

    /// Serialize as 4-space indented JSON
    pub fn to_json_pretty(&self) -> serde_json::Result<Vec<u8>> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)?;
        out.push(b'\n');
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn normalize(q: Quaternion) -> Quaternion {
        let n = (q.w * q.w + q.x * q.x + q.y * q.y + q.z * q.z).sqrt();
        Quaternion::new(q.w / n, q.x / n, q.y / n, q.z / n)
    }

    fn det3(m: &RotationMatrix) -> f64 {
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// Deterministic spread of quaternions over all sign combinations
    fn sample_quaternions() -> Vec<Quaternion> {
        let mut samples = Vec::new();
        let values = [-0.9, -0.35, 0.0, 0.2, 0.7];
        for &w in &values {
            for &x in &values {
                for &y in &values {
                    for &z in &values {
                        if w == 0.0 && x == 0.0 && y == 0.0 && z == 0.0 {
                            continue;
                        }
                        samples.push(normalize(Quaternion::new(w, x, y, z)));
                    }
                }
            }
        }
        samples
    }

    #[test]
    fn test_identity_quaternion_gives_identity_rotation() {
        let r = Quaternion::new(1.0, 0.0, 0.0, 0.0).to_rotation_matrix();
        assert_eq!(r, [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
    }

    #[test]
    fn test_rotation_about_z_by_90_degrees() {
        let half = std::f64::consts::FRAC_PI_4;
        let r = Quaternion::new(half.cos(), 0.0, 0.0, half.sin()).to_rotation_matrix();
        // x axis maps to y axis
        assert!((r[0][0]).abs() < EPS);
        assert!((r[1][0] - 1.0).abs() < EPS);
        assert!((r[0][1] + 1.0).abs() < EPS);
        assert!((r[2][2] - 1.0).abs() < EPS);
    }

    #[test]
    fn test_unit_quaternions_give_orthonormal_rotations() {
        for q in sample_quaternions() {
            let r = q.to_rotation_matrix();
            for i in 0..3 {
                for j in 0..3 {
                    let dot: f64 = (0..3).map(|k| r[i][k] * r[j][k]).sum();
                    let expected = if i == j { 1.0 } else { 0.0 };
                    assert!(
                        (dot - expected).abs() < 1e-9,
                        "R*R^T[{}][{}] = {} for {:?}",
                        i,
                        j,
                        dot,
                        q
                    );
                }
            }
            assert!((det3(&r) - 1.0).abs() < 1e-9, "det(R) != 1 for {:?}", q);
        }
    }

    #[test]
    fn test_compose_transform_layout() {
        let r = Quaternion::new(1.0, 0.0, 0.0, 0.0).to_rotation_matrix();
        let m = compose_transform(&r, [1.5, -2.0, 3.25]);
        assert_eq!(m[0], [1.0, 0.0, 0.0, 1.5]);
        assert_eq!(m[1], [0.0, 1.0, 0.0, -2.0]);
        assert_eq!(m[2], [0.0, 0.0, 1.0, 3.25]);
        assert_eq!(m[3], [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_camera_angle_x() {
        let intrinsics = CameraIntrinsics {
            w: 1920,
            h: 1080,
            fl_x: 1600.0,
            fl_y: 1600.0,
            cx: 960.0,
            cy: 540.0,
        };
        let expected = (1920.0_f64 / (2.0 * 1600.0)).atan();
        assert!((intrinsics.camera_angle_x() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_json_layout_is_flat() {
        let intrinsics = CameraIntrinsics {
            w: 640,
            h: 480,
            fl_x: 500.0,
            fl_y: 510.0,
            cx: 320.0,
            cy: 240.0,
        };
        let frame = PoseFrame {
            file_path: "images/a.jpg".to_string(),
            transform_matrix: compose_transform(
                &Quaternion::new(1.0, 0.0, 0.0, 0.0).to_rotation_matrix(),
                [0.0, 0.0, 0.0],
            ),
            intrinsics,
            camera_id: 7,
        };
        let manifest = SceneManifest::new(intrinsics, vec![frame]);
        let json: serde_json::Value = serde_json::to_value(&manifest).unwrap();

        assert_eq!(json["w"], 640);
        assert_eq!(json["fl_y"], 510.0);
        assert_eq!(json["aabb_scale"], 4);
        assert_eq!(json["frames"][0]["file_path"], "images/a.jpg");
        assert_eq!(json["frames"][0]["cx"], 320.0);
        assert!(json["frames"][0].get("camera_id").is_none());
        assert_eq!(json["frames"][0]["transform_matrix"][3][3], 1.0);
    }
}
