//! Session Store
//!
//! Maps an opaque session id to its working directory. The directory
//! accumulates every stage artifact under fixed relative paths; downstream
//! stages locate their inputs by these names, so they are part of the
//! contract with the external tools:
//!
//! ```text
//! <upload_root>/<session_id>/
//!     images/                  input images (filled by the upload collaborator)
//!     colmap.db                feature/match database
//!     colmap_sparse/0/         binary sparse model
//!     colmap_text/             cameras.txt, images.txt, points3D.txt
//!     transforms.json          scene manifest
//!     nerf_output/model.msgpack
//!     model.ply, model.obj     exported mesh
//! ```
//!
//! No pipeline state is kept here; only the directory lookup.

use recon_common::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

pub const IMAGES_DIR: &str = "images";
pub const DATABASE_FILE: &str = "colmap.db";
pub const SPARSE_DIR: &str = "colmap_sparse";
pub const TEXT_DIR: &str = "colmap_text";
pub const CAMERAS_FILE: &str = "cameras.txt";
pub const IMAGES_FILE: &str = "images.txt";
pub const MANIFEST_FILE: &str = "transforms.json";
pub const NERF_OUTPUT_DIR: &str = "nerf_output";
pub const SNAPSHOT_FILE: &str = "model.msgpack";
pub const MESH_PLY_FILE: &str = "model.ply";
pub const MESH_OBJ_FILE: &str = "model.obj";

/// Image extensions counted as session inputs
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Filesystem-backed session lookup
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Open (creating if needed) the upload root
    ///
    /// The root is canonicalized so that stage arguments are absolute even
    /// for stages that run with a different working directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let root = std::fs::canonicalize(root)?;
        info!("Session store root: {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a new session with an empty `images/` directory
    pub fn create(&self) -> Result<SessionWorkspace> {
        let workspace = SessionWorkspace::new(Uuid::new_v4(), &self.root);
        std::fs::create_dir_all(workspace.images_dir())?;
        info!(session_id = %workspace.id(), "Created session directory");
        Ok(workspace)
    }

    /// Look up an existing session
    pub fn open(&self, id: Uuid) -> Result<SessionWorkspace> {
        let workspace = SessionWorkspace::new(id, &self.root);
        if !workspace.dir().is_dir() {
            debug!(session_id = %id, "Session directory not found");
            return Err(Error::NotFound(format!("Session not found: {}", id)));
        }
        Ok(workspace)
    }
}

/// One session's working directory and its fixed artifact paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionWorkspace {
    id: Uuid,
    dir: PathBuf,
}

impl SessionWorkspace {
    pub fn new(id: Uuid, root: &Path) -> Self {
        Self {
            id,
            dir: root.join(id.to_string()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn images_dir(&self) -> PathBuf {
        self.dir.join(IMAGES_DIR)
    }

    pub fn database_path(&self) -> PathBuf {
        self.dir.join(DATABASE_FILE)
    }

    pub fn sparse_dir(&self) -> PathBuf {
        self.dir.join(SPARSE_DIR)
    }

    /// First sparse model written by the mapper
    pub fn sparse_model_dir(&self) -> PathBuf {
        self.sparse_dir().join("0")
    }

    pub fn text_dir(&self) -> PathBuf {
        self.dir.join(TEXT_DIR)
    }

    pub fn cameras_txt(&self) -> PathBuf {
        self.text_dir().join(CAMERAS_FILE)
    }

    pub fn images_txt(&self) -> PathBuf {
        self.text_dir().join(IMAGES_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn nerf_output_dir(&self) -> PathBuf {
        self.dir.join(NERF_OUTPUT_DIR)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.nerf_output_dir().join(SNAPSHOT_FILE)
    }

    pub fn mesh_ply_path(&self) -> PathBuf {
        self.dir.join(MESH_PLY_FILE)
    }

    pub fn mesh_obj_path(&self) -> PathBuf {
        self.dir.join(MESH_OBJ_FILE)
    }

    /// Number of input images currently in `images/`
    pub fn count_images(&self) -> std::io::Result<usize> {
        let entries = match std::fs::read_dir(self.images_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut count = 0;
        for entry in entries {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_image && path.is_file() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Snapshot of which artifacts exist on disk
    pub fn artifacts(&self) -> std::io::Result<ArtifactStatus> {
        Ok(ArtifactStatus {
            image_count: self.count_images()?,
            sparse_model: self.sparse_model_dir().is_dir(),
            manifest: self.manifest_path().is_file(),
            snapshot: self.snapshot_path().is_file(),
            mesh_ply: self.mesh_ply_path().is_file(),
            mesh_obj: self.mesh_obj_path().is_file(),
        })
    }
}

/// Presence of each session artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactStatus {
    pub image_count: usize,
    pub sparse_model: bool,
    pub manifest: bool,
    pub snapshot: bool,
    pub mesh_ply: bool,
    pub mesh_obj: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_open() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("uploads")).unwrap();

        let created = store.create().unwrap();
        assert!(created.images_dir().is_dir());
        assert!(created.dir().starts_with(store.root()));

        let opened = store.open(created.id()).unwrap();
        assert_eq!(opened, created);
    }

    #[test]
    fn test_open_unknown_session_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path()).unwrap();

        let result = store.open(Uuid::new_v4());
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_layout_paths() {
        let id = Uuid::new_v4();
        let ws = SessionWorkspace::new(id, Path::new("/data/uploads"));
        let base = PathBuf::from("/data/uploads").join(id.to_string());

        assert_eq!(ws.database_path(), base.join("colmap.db"));
        assert_eq!(ws.sparse_model_dir(), base.join("colmap_sparse").join("0"));
        assert_eq!(ws.images_txt(), base.join("colmap_text").join("images.txt"));
        assert_eq!(ws.manifest_path(), base.join("transforms.json"));
        assert_eq!(
            ws.snapshot_path(),
            base.join("nerf_output").join("model.msgpack")
        );
        assert_eq!(ws.mesh_obj_path(), base.join("model.obj"));
    }

    #[test]
    fn test_artifacts_counts_only_images() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path()).unwrap();
        let ws = store.create().unwrap();

        std::fs::write(ws.images_dir().join("a.JPG"), b"x").unwrap();
        std::fs::write(ws.images_dir().join("b.png"), b"x").unwrap();
        std::fs::write(ws.images_dir().join("notes.txt"), b"x").unwrap();
        std::fs::write(ws.manifest_path(), b"{}").unwrap();

        let status = ws.artifacts().unwrap();
        assert_eq!(status.image_count, 2);
        assert!(status.manifest);
        assert!(!status.snapshot);
        assert!(!status.mesh_obj);
    }
}
