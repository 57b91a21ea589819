use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};

/// Fixed prefix of every capture folder name.
pub const FOLDER_PREFIX: &str = "capture_output";

/// Manages one capture run's output folder.
///
/// Each run gets a fresh `<prefix>_<YYYY-MM-DD_HH-MM-SS>` folder holding the
/// run log, the capture utility's stderr and its capture files.
#[derive(Debug, Clone)]
pub struct CaptureDir {
    root: PathBuf,
}

/// One file found in the capture folder after the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub bytes: u64,
}

#[derive(Debug)]
pub enum CaptureDirError {
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for CaptureDirError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureDirError::Create { path, source } => {
                write!(
                    f,
                    "failed to create capture folder {}: {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for CaptureDirError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureDirError::Create { source, .. } => Some(source),
        }
    }
}

/// Folder name for a run started at `started`, e.g. `capture_output_2025-03-07_12-34-56`.
pub fn folder_name(prefix: &str, started: NaiveDateTime) -> String {
    format!("{prefix}_{}", started.format("%Y-%m-%d_%H-%M-%S"))
}

impl CaptureDir {
    /// Create `<parent>/<FOLDER_PREFIX>_<timestamp>` for a run starting now.
    pub fn create(parent: &Path) -> Result<Self, CaptureDirError> {
        Self::create_at(parent, chrono::Local::now().naive_local())
    }

    /// Create the folder for a run started at `started`.
    ///
    /// The returned root is absolute so paths handed to the capture utility
    /// stay valid regardless of its working directory. An existing folder
    /// with the same name (two runs within one second) is reused.
    pub fn create_at(parent: &Path, started: NaiveDateTime) -> Result<Self, CaptureDirError> {
        let path = parent.join(folder_name(FOLDER_PREFIX, started));
        std::fs::create_dir_all(&path).map_err(|e| CaptureDirError::Create {
            path: path.clone(),
            source: e,
        })?;
        let root = std::fs::canonicalize(&path)
            .map_err(|e| CaptureDirError::Create { path, source: e })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the run log (`capture.log`).
    pub fn log_file(&self) -> PathBuf {
        self.root.join("capture.log")
    }

    /// Path the capture utility's stderr is redirected to.
    pub fn stderr_file(&self) -> PathBuf {
        self.root.join("capture.stderr")
    }

    /// Base path passed to the utility's `-w` flag; it appends `-NN.<ext>` itself.
    pub fn output_base(&self, output_prefix: &str) -> PathBuf {
        self.root.join(output_prefix)
    }

    /// Regular files in the folder, sorted by name.
    pub fn artifacts(&self) -> std::io::Result<Vec<Artifact>> {
        let mut artifacts = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            artifacts.push(Artifact {
                name: entry.file_name().to_string_lossy().into_owned(),
                bytes: meta.len(),
            });
        }
        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(artifacts)
    }
}
