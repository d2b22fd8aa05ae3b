//! Test Helper Utilities
//!
//! Shared fixtures for recon-pipeline integration tests: sample reconstruction
//! text output, fake external tools written as shell scripts, and event
//! collection.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use recon_common::events::{EventStream, PipelineEvent};
use recon_pipeline::config::PipelineConfig;
use recon_pipeline::models::{SessionStore, SessionWorkspace};
use tokio::task::JoinHandle;

/// One OPENCV camera, 1920x1080, fx = fy = 1600
pub const SAMPLE_CAMERAS: &str = "\
# Camera list with one line of data per camera:
#   CAMERA_ID, MODEL, WIDTH, HEIGHT, PARAMS[]
# Number of cameras: 1
1 OPENCV 1920 1080 1600 1600 960 540 0 0 0 0
";

/// Three posed images, one with an empty points line
pub const SAMPLE_IMAGES: &str = "\
# Image list with two lines of data per image:
#   IMAGE_ID, QW, QX, QY, QZ, TX, TY, TZ, CAMERA_ID, NAME
#   POINTS2D[] as (X, Y, POINT3D_ID)
# Number of images: 3, mean observations per image: 2
1 0.9238795 0 0.3826834 0 0.1 0.2 0.3 1 a.jpg
12.5 30.1 -1 48.0 77.2 3
2 0.7071068 0.7071068 0 0 -1.5 0 2 1 b.jpg

3 0.5 0.5 0.5 0.5 4 5 6 1 c.jpg
1.0 2.0 7
";

/// Names referenced by [`SAMPLE_IMAGES`]
pub const SAMPLE_IMAGE_NAMES: [&str; 3] = ["a.jpg", "b.jpg", "c.jpg"];

/// Create a session with the sample images present
pub fn sample_session(root: &Path) -> (SessionStore, SessionWorkspace) {
    let store = SessionStore::new(root.join("uploads")).unwrap();
    let workspace = store.create().unwrap();
    for name in SAMPLE_IMAGE_NAMES {
        std::fs::write(workspace.images_dir().join(name), b"jpeg").unwrap();
    }
    (store, workspace)
}

/// Write the sample text model into the session's text directory
pub fn write_text_model(workspace: &SessionWorkspace) {
    std::fs::create_dir_all(workspace.text_dir()).unwrap();
    std::fs::write(workspace.cameras_txt(), SAMPLE_CAMERAS).unwrap();
    std::fs::write(workspace.images_txt(), SAMPLE_IMAGES).unwrap();
}

/// Drain a session stream on a separate task
pub fn collect_events(mut stream: EventStream) -> JoinHandle<Vec<PipelineEvent>> {
    tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            events.push(event);
        }
        events
    })
}

/// Log lines of an event sequence
pub fn log_lines(events: &[PipelineEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Log(line) => Some(line.clone()),
            PipelineEvent::Progress(_) => None,
        })
        .collect()
}

/// Behaviour of the fake COLMAP executable
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeColmap {
    /// `mapper` exits 0 but writes no model
    pub empty_reconstruction: bool,
    /// Subcommand that exits with status 2
    pub fail_on: Option<&'static str>,
    /// Every subcommand sleeps for a long time
    pub hang: bool,
}

#[cfg(unix)]
fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(unix)]
impl FakeColmap {
    /// Write the script to `<dir>/colmap` and return its path
    pub fn install(&self, dir: &Path) -> PathBuf {
        let path = dir.join("colmap");
        let fail_on = self.fail_on.unwrap_or("");
        let hang = if self.hang { "exec sleep 30" } else { ":" };
        let mapper = if self.empty_reconstruction {
            "echo 'No good initial image pair found.' 1>&2"
        } else {
            "mkdir -p \"$out/0\" && touch \"$out/0/cameras.bin\""
        };

        let script = format!(
            r#"#!/bin/sh
cmd="$1"
shift
out=""
db=""
while [ $# -gt 0 ]; do
    case "$1" in
        --output_path) out="$2"; shift 2 ;;
        --database_path) db="$2"; shift 2 ;;
        *) shift ;;
    esac
done
{hang}
echo "fake colmap $cmd"
if [ "$cmd" = "{fail_on}" ]; then
    echo "fatal: $cmd failed" 1>&2
    exit 2
fi
case "$cmd" in
    feature_extractor) touch "$db" ;;
    exhaustive_matcher) echo "matching block [1/1]" 1>&2 ;;
    mapper) {mapper} ;;
    model_converter)
        cat > "$out/cameras.txt" <<'CAMERAS'
{cameras}CAMERAS
        cat > "$out/images.txt" <<'IMAGES'
{images}IMAGES
        ;;
esac
exit 0
"#,
            hang = hang,
            fail_on = fail_on,
            mapper = mapper,
            cameras = SAMPLE_CAMERAS,
            images = SAMPLE_IMAGES,
        );
        write_script(&path, &script);
        path
    }
}

/// Behaviour of the fake instant-ngp script
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeNerf {
    /// Training exits 0 without saving the snapshot
    pub skip_snapshot: bool,
    /// Mesh export exits 0 without writing the PLY
    pub skip_mesh: bool,
}

/// Write a fake instant-ngp `run.sh` into `nerf_root`
///
/// Training touches the snapshot and a `training_invoked` marker in
/// `nerf_root`; mesh export touches `mesh_invoked` and writes a one-triangle
/// ASCII PLY.
#[cfg(unix)]
pub fn install_fake_nerf(nerf_root: &Path, nerf: FakeNerf) {
    let save_snapshot = if nerf.skip_snapshot { ":" } else { "touch \"$snapshot\"" };
    let save_mesh = if nerf.skip_mesh { "exit 0" } else { ":" };
    let script = r#"#!/bin/sh
snapshot=""
mesh=""
manifest=""
while [ $# -gt 0 ]; do
    case "$1" in
        --training_data=*) manifest="${1#--training_data=}"; shift ;;
        --save_snapshot) snapshot="$2"; shift 2 ;;
        --save_mesh) mesh="$2"; shift 2 ;;
        *) shift ;;
    esac
done
if [ -n "$snapshot" ]; then
    touch training_invoked
    echo "Training on $manifest"
    echo "step=100 loss=0.0213"
    {save_snapshot}
fi
if [ -n "$mesh" ]; then
    touch mesh_invoked
    echo "Generating mesh"
    {save_mesh}
    cat > "$mesh" <<'PLY'
ply
format ascii 1.0
element vertex 3
property float x
property float y
property float z
element face 1
property list uchar int vertex_indices
end_header
0 0 0
1 0 0
0 1 0
3 0 1 2
PLY
fi
exit 0
"#
    .replace("{save_snapshot}", save_snapshot)
    .replace("{save_mesh}", save_mesh);
    write_script(&nerf_root.join("run.sh"), &script);
}

/// Pipeline configuration pointing at the fake tools under `tools_dir`
#[cfg(unix)]
pub fn fake_tool_config(tools_dir: &Path, colmap: FakeColmap) -> PipelineConfig {
    fake_tool_config_with(tools_dir, colmap, FakeNerf::default())
}

/// [`fake_tool_config`] with a non-default instant-ngp behaviour
#[cfg(unix)]
pub fn fake_tool_config_with(tools_dir: &Path, colmap: FakeColmap, nerf: FakeNerf) -> PipelineConfig {
    let nerf_root = tools_dir.join("instant-ngp");
    install_fake_nerf(&nerf_root, nerf);

    PipelineConfig {
        colmap: colmap.install(&tools_dir.join("bin")),
        python: PathBuf::from("/bin/sh"),
        nerf_root,
        nerf_script: PathBuf::from("run.sh"),
        camera_model: "OPENCV".to_string(),
        training_steps: 100,
        mesh_resolution: 64,
    }
}
