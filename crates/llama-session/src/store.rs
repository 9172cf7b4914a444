//! Model store collaborators.
//!
//! The session manager never touches model files itself; it asks a [`ModelStore`]
//! whether the files are present and where the text model lives.

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where model files live and whether they are ready to load.
pub trait ModelStore: Send + Sync {
    /// Whether every file needed to load the text model is present.
    fn are_models_available(&self) -> bool;

    /// Path handed to the engine's `load`.
    fn text_model_path(&self) -> PathBuf;
}

impl<S: ModelStore + ?Sized> ModelStore for Arc<S> {
    fn are_models_available(&self) -> bool {
        (**self).are_models_available()
    }

    fn text_model_path(&self) -> PathBuf {
        (**self).text_model_path()
    }
}

impl<S: ModelStore + ?Sized> ModelStore for Box<S> {
    fn are_models_available(&self) -> bool {
        (**self).are_models_available()
    }

    fn text_model_path(&self) -> PathBuf {
        (**self).text_model_path()
    }
}

/// Model files in a local directory.
#[derive(Debug, Clone)]
pub struct DirectoryModelStore {
    dir: PathBuf,
    text_model: String,
    extra_files: Vec<String>,
}

impl DirectoryModelStore {
    pub fn new(dir: impl AsRef<Path>, text_model: impl Into<String>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            text_model: text_model.into(),
            extra_files: Vec::new(),
        }
    }

    /// Require another file in the directory before the models count as available.
    pub fn with_required_file(mut self, file: impl Into<String>) -> Self {
        self.extra_files.push(file.into());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every required file that is not present.
    pub fn missing_files(&self) -> Vec<PathBuf> {
        std::iter::once(&self.text_model)
            .chain(self.extra_files.iter())
            .map(|f| self.dir.join(f))
            .filter(|p| !p.is_file())
            .collect()
    }
}

impl ModelStore for DirectoryModelStore {
    fn are_models_available(&self) -> bool {
        let missing = self.missing_files();
        if !missing.is_empty() {
            tracing::debug!(?missing, "model files missing");
        }
        missing.is_empty()
    }

    fn text_model_path(&self) -> PathBuf {
        self.dir.join(&self.text_model)
    }
}

/// A fixed path with a fixed availability answer.
#[derive(Debug, Clone)]
pub struct StaticModelStore {
    path: PathBuf,
    available: bool,
}

impl StaticModelStore {
    pub fn available(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            available: true,
        }
    }

    pub fn unavailable(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            available: false,
        }
    }
}

impl ModelStore for StaticModelStore {
    fn are_models_available(&self) -> bool {
        self.available
    }

    fn text_model_path(&self) -> PathBuf {
        self.path.clone()
    }
}
