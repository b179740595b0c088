//! Work directory layout and the stage artifact cache.
//!
//! Every stage writes its result as a file under the work directory, one
//! per mutation. A later run finds the file, checks that it is not a
//! torn leftover of a killed process, and skips the stage. Artifacts are
//! therefore always written to the scratch directory first and renamed
//! into place, so a crash can never leave a half-written file under a
//! stage directory.
//!
//! Validity checks are deliberately shallow. A TIFF is checked by magic
//! number only (rendered plans run to hundreds of megabytes), JSON and
//! CSV artifacts are small and get a full parse. Anything that fails the
//! check is logged and treated as absent, which makes the stage run
//! again and overwrite it.

use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::warn;

use crate::error::{PipelineError, StageError};

const STAGE_DIRS: [&str; 10] = [
    "text",
    "rendered",
    "thresholded",
    "symbols",
    "bounds",
    "points",
    "georeferenced",
    "not_georeferenced",
    "logs",
    "tmp",
];

/// What shape of file an artifact is expected to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Tiff,
    Json,
    Csv,
    Text,
}

/// Check artifact bytes for structural validity. The error is a short
/// human-readable detail.
pub fn validate(bytes: &[u8], kind: ArtifactKind) -> Result<(), String> {
    match kind {
        ArtifactKind::Tiff => {
            if bytes.len() < 8 {
                return Err("shorter than a TIFF header".into());
            }
            if &bytes[..4] != b"II*\0" && &bytes[..4] != b"MM\0*" {
                return Err("not a TIFF magic number".into());
            }
            Ok(())
        }
        ArtifactKind::Json => serde_json::from_slice::<serde_json::Value>(bytes)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        ArtifactKind::Csv => {
            let mut reader = csv::Reader::from_reader(bytes);
            for record in reader.byte_records() {
                record.map_err(|e| e.to_string())?;
            }
            Ok(())
        }
        ArtifactKind::Text => std::str::from_utf8(bytes)
            .map(|_| ())
            .map_err(|e| e.to_string()),
    }
}

/// The per-run work directory with one subdirectory per stage.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// Open the work directory, creating the stage layout if needed.
    pub async fn create(root: &Path) -> Result<WorkDir, PipelineError> {
        for dir in STAGE_DIRS {
            let path = root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|source| PipelineError::WorkDirCreateFailed { path, source })?;
        }
        Ok(WorkDir {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── Stage artifact paths ────────────────────────────────────────────

    pub fn text_path(&self, id: &str) -> PathBuf {
        self.root.join("text").join(format!("{id}.txt"))
    }

    pub fn rendered_path(&self, id: &str) -> PathBuf {
        self.root.join("rendered").join(format!("{id}.tif"))
    }

    /// Frame geometry sidecar written next to the rendered TIFF.
    pub fn render_info_path(&self, id: &str) -> PathBuf {
        self.root.join("rendered").join(format!("{id}.json"))
    }

    pub fn thresholded_path(&self, id: &str) -> PathBuf {
        self.root.join("thresholded").join(format!("{id}.tif"))
    }

    pub fn symbols_path(&self, id: &str) -> PathBuf {
        self.root.join("symbols").join(format!("{id}.csv"))
    }

    pub fn bounds_path(&self, id: &str) -> PathBuf {
        self.root.join("bounds").join(format!("{id}.geojson"))
    }

    pub fn points_path(&self, id: &str) -> PathBuf {
        self.root.join("points").join(format!("{id}.csv"))
    }

    /// Output path for the nth successful match of a mutation. The first
    /// match keeps the bare id, further ones get a numeric suffix.
    pub fn georeferenced_path(&self, id: &str, match_index: usize) -> PathBuf {
        let name = if match_index == 0 {
            format!("{id}.tif")
        } else {
            format!("{id}_{match_index}.tif")
        };
        self.root.join("georeferenced").join(name)
    }

    pub fn not_georeferenced_path(&self, id: &str) -> PathBuf {
        self.root.join("not_georeferenced").join(format!("{id}.tif"))
    }

    /// JSON-lines record of mutations that ended georeferenced.
    pub fn success_log_path(&self) -> PathBuf {
        self.root.join("logs").join("success")
    }

    /// JSON-lines record of mutations that failed terminally.
    pub fn failed_log_path(&self) -> PathBuf {
        self.root.join("logs").join("failed")
    }

    /// A scratch path for collaborators and in-flight artifacts.
    pub fn scratch_path(&self, file_name: &str) -> PathBuf {
        self.root.join("tmp").join(file_name)
    }

    /// Scratch directory owned by one mutation while it is processed.
    /// Mutations never run concurrently with themselves, so nothing else
    /// writes here.
    pub fn mutation_scratch(&self, id: &str) -> PathBuf {
        self.root.join("tmp").join(id)
    }

    // ── Artifact IO ─────────────────────────────────────────────────────

    fn staging_path(&self, dest: &Path) -> PathBuf {
        let stage = dest
            .parent()
            .and_then(Path::file_name)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_owned());
        let name = dest
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_owned());
        self.scratch_path(&format!("{stage}-{name}.partial"))
    }

    /// Write `bytes` to `dest` atomically (scratch file, then rename).
    pub async fn store(&self, dest: &Path, bytes: &[u8]) -> Result<(), StageError> {
        let staging = self.staging_path(dest);
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(|e| StageError::io(&staging, e))?;
        tokio::fs::rename(&staging, dest)
            .await
            .map_err(|e| StageError::io(dest, e))
    }

    /// Move a finished scratch file into its final place.
    pub async fn promote(&self, scratch: &Path, dest: &Path) -> Result<(), StageError> {
        tokio::fs::rename(scratch, dest)
            .await
            .map_err(|e| StageError::io(dest, e))
    }
}

/// Load a small artifact if it exists and is structurally valid. Corrupt
/// files are logged and reported as absent so the stage runs again.
pub async fn load_artifact(path: &Path, kind: ArtifactKind) -> Option<Vec<u8>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "artifact unreadable, ignoring");
            return None;
        }
    };
    match validate(&bytes, kind) {
        Ok(()) => Some(bytes),
        Err(detail) => {
            warn!(path = %path.display(), detail, "discarding corrupt artifact");
            None
        }
    }
}

/// Cheap validity probe that avoids reading large files whole. TIFFs are
/// checked by header only; small kinds fall back to [`load_artifact`].
pub async fn artifact_ok(path: &Path, kind: ArtifactKind) -> bool {
    if kind != ArtifactKind::Tiff {
        return load_artifact(path, kind).await.is_some();
    }
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "artifact unreadable, ignoring");
            }
            return false;
        }
    };
    let mut header = [0u8; 8];
    match file.read_exact(&mut header).await {
        Ok(_) => {}
        Err(_) => {
            warn!(path = %path.display(), "discarding truncated artifact");
            return false;
        }
    }
    match validate(&header, ArtifactKind::Tiff) {
        Ok(()) => true,
        Err(detail) => {
            warn!(path = %path.display(), detail, "discarding corrupt artifact");
            false
        }
    }
}
