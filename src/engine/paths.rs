//! On-disk layout of an engine project.

use std::path::{Path, PathBuf};

use crate::constants::layout;
use crate::types::ModelNo;

/// Paths inside one engine project directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    store: PathBuf,
    name: String,
}

impl ProjectPaths {
    pub fn new(store: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            name: name.into(),
        }
    }

    /// Rebuild the layout from a stored project path.
    pub fn from_project_path(path: &Path) -> Self {
        let store = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { store, name }
    }

    pub fn store(&self) -> &Path {
        &self.store
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the project root directory
    pub fn root(&self) -> PathBuf {
        self.store.join(&self.name)
    }

    /// Get the encoding written at ingestion
    pub fn encoding(&self) -> PathBuf {
        self.root().join(layout::INGEST_DIR).join(layout::ENCODING_FILE)
    }

    /// Get the directory of one trained model
    pub fn sample_dir(&self, modelno: ModelNo) -> PathBuf {
        self.root()
            .join(layout::SAMPLES_DIR)
            .join(format!("{}{}", layout::SAMPLE_PREFIX, modelno.0))
    }

    /// Get the column-kind structure of one trained model
    pub fn model(&self, modelno: ModelNo) -> PathBuf {
        self.sample_dir(modelno).join(layout::MODEL_FILE)
    }

    /// Get the row-assignment stream of one trained model
    pub fn assignments(&self, modelno: ModelNo) -> PathBuf {
        self.sample_dir(modelno).join(layout::ASSIGN_FILE)
    }
}

/// Make a project name filesystem safe
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => '_',
            c => c,
        })
        .collect()
}
