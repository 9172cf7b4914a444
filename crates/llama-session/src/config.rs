//! Configuration for the session manager.

use std::path::{Path, PathBuf};

use llama_engine::{GenerationRequest, SamplingParams};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::store::DirectoryModelStore;

/// Configuration for a [`crate::SessionManager`].
///
/// Every field has a default, so a JSON file only needs the keys it overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sampling parameters used to load the model and as request defaults.
    pub sampling: SamplingParams,

    /// Directory holding the model files.
    pub model_dir: PathBuf,

    /// File name of the text model inside `model_dir`.
    pub text_model_file: String,

    /// Additional files that must exist before loading (e.g. a projector or vocab).
    pub required_files: Vec<String>,

    /// Name of the dedicated inference worker thread.
    pub worker_name: String,

    /// Capacity of the worker's command queue.
    pub command_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingParams::default(),
            model_dir: PathBuf::from("models"),
            text_model_file: "model.gguf".to_string(),
            required_files: Vec::new(),
            worker_name: "inference-worker".to_string(),
            command_queue_depth: 16,
        }
    }
}

impl SessionConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        self.sampling
            .validate()
            .map_err(|e| SessionError::Config(e.to_string()))?;
        if self.text_model_file.is_empty() {
            return Err(SessionError::Config(
                "text_model_file must not be empty".to_string(),
            ));
        }
        if self.command_queue_depth == 0 {
            return Err(SessionError::Config(
                "command_queue_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Build a request for `prompt` using the configured sampling defaults.
    pub fn request(&self, prompt: impl Into<String>) -> GenerationRequest {
        GenerationRequest::with_params(prompt, self.sampling.clone())
    }

    /// A model store over `model_dir`.
    pub fn model_store(&self) -> DirectoryModelStore {
        self.required_files.iter().fold(
            DirectoryModelStore::new(&self.model_dir, &self.text_model_file),
            |store, file| store.with_required_file(file),
        )
    }

    /// Set sampling defaults.
    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Set the model directory.
    pub fn with_model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.model_dir = dir.into();
        self
    }

    /// Set the text model file name.
    pub fn with_text_model_file(mut self, file: impl Into<String>) -> Self {
        self.text_model_file = file.into();
        self
    }

    /// Require an extra file to be present before loading.
    pub fn with_required_file(mut self, file: impl Into<String>) -> Self {
        self.required_files.push(file.into());
        self
    }

    /// Set the worker thread name.
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    /// Set the command queue depth.
    pub fn with_command_queue_depth(mut self, depth: usize) -> Self {
        self.command_queue_depth = depth;
        self
    }
}
