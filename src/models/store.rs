//! Filesystem layout of downloaded model weights.
//!
//! A model is present iff its final file exists in the models directory.
//! In-flight downloads write to `<file>.part`; a `.part` file is never
//! evidence of presence.

use std::io;
use std::path::{Path, PathBuf};

use crate::models::catalog::ModelDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("model file not found: {0}")]
    NotFound(PathBuf),
    #[error("permission denied removing {0}")]
    PermissionDenied(PathBuf),
    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),
}

/// Handle to the models directory.
#[derive(Debug, Clone)]
pub struct ModelStore {
    models_dir: PathBuf,
}

impl ModelStore {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Final path for a variant's weights.
    pub fn model_path(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.models_dir.join(&descriptor.file_name)
    }

    /// Temp path used while a download is in flight.
    pub fn part_path(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.models_dir
            .join(format!("{}.part", descriptor.file_name))
    }

    /// Whether the completed file is on disk. Ignores `.part` files.
    pub fn exists(&self, descriptor: &ModelDescriptor) -> bool {
        self.model_path(descriptor).is_file()
    }

    /// Size of an abandoned partial download, if one is present.
    pub fn partial_bytes(&self, descriptor: &ModelDescriptor) -> Option<u64> {
        std::fs::metadata(self.part_path(descriptor))
            .ok()
            .map(|m| m.len())
    }

    /// Remove a downloaded model file.
    pub fn delete(&self, descriptor: &ModelDescriptor) -> Result<(), StoreError> {
        let path = self.model_path(descriptor);
        if !path.is_file() {
            return Err(StoreError::NotFound(path));
        }
        std::fs::remove_file(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(path),
            io::ErrorKind::PermissionDenied => StoreError::PermissionDenied(path),
            _ => StoreError::Io(e),
        })
    }

    /// Delete every leftover `.part` file in the models directory.
    /// Returns the paths removed. Run on startup; partial files are only
    /// meaningful while their download is in flight.
    pub fn sweep_partials(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut removed = Vec::new();
        if !self.models_dir.is_dir() {
            return Ok(removed);
        }
        for entry in std::fs::read_dir(&self.models_dir)? {
            let path = entry?.path();
            let is_partial = path
                .extension()
                .map(|ext| ext == "part")
                .unwrap_or(false);
            if is_partial && path.is_file() {
                std::fs::remove_file(&path)?;
                removed.push(path);
            }
        }
        Ok(removed)
    }

    /// Make sure the models directory exists.
    pub fn ensure_dir(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.models_dir)?;
        Ok(())
    }
}
