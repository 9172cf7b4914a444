//! # llama-engine
//!
//! The "narrow waist" of the streaming stack. Defines the [`CompletionEngine`] trait
//! and the request/parameter types every other crate depends on. A session manager
//! drives any backend through this trait without knowing how tokens are produced.
//!
//! ## Design Notes
//!
//! ### Exclusive Access
//! `CompletionEngine` methods take `&mut self`, and the [`TokenStream`] returned by
//! [`CompletionEngine::stream_completion`] borrows the engine for its whole lifetime.
//! A second stream cannot be opened while the first is alive; the engine is not
//! reentrant and the type system says so.
//!
//! ### Lazy Streams
//! A `TokenStream` is a forward-only iterator. It is finite and cannot be restarted;
//! callers that want the full response accumulate it themselves.

pub mod stop;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use stop::{StopCriteria, StopWordStream};

pub type Result<T> = std::result::Result<T, LlamaError>;

/// Top-level error type for all engine operations.
#[derive(Debug, thiserror::Error)]
pub enum LlamaError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Model is not loaded")]
    NotLoaded,
    #[error("Engine has been disposed")]
    Disposed,
}

/// Default stop word appended by chat templates of the supported models.
pub const DEFAULT_STOP_WORD: &str = "</s>";

/// Sampling and termination parameters shared by model loading and completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Generation stops once the accumulated text contains any of these.
    pub stop_words: Vec<String>,
    /// Softmax temperature; must be > 0.
    pub temperature: f32,
    /// Upper bound on produced tokens; must be > 0.
    pub max_tokens: usize,
    /// Top-k cutoff (0 disables).
    pub top_k: usize,
    /// Nucleus sampling mass, in (0, 1].
    pub top_p: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            stop_words: vec![DEFAULT_STOP_WORD.to_string()],
            temperature: 1.0,
            max_tokens: 64,
            top_k: 50,
            top_p: 0.9,
        }
    }
}

impl SamplingParams {
    /// Check every parameter against its documented range.
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(LlamaError::InvalidRequest(format!(
                "temperature must be positive (got {})",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(LlamaError::InvalidRequest(
                "max_tokens must be at least 1".to_string(),
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(LlamaError::InvalidRequest(format!(
                "top_p must be in (0, 1] (got {})",
                self.top_p
            )));
        }
        Ok(())
    }
}

/// One completion request. Immutable once handed to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub params: SamplingParams,
}

impl GenerationRequest {
    /// Create a request with default sampling parameters.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self::with_params(prompt, SamplingParams::default())
    }

    /// Create a request with explicit sampling parameters.
    pub fn with_params(prompt: impl Into<String>, params: SamplingParams) -> Self {
        Self {
            prompt: prompt.into(),
            params,
        }
    }

    pub fn with_stop_words<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.stop_words = words.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.params.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.params.max_tokens = max_tokens;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.params.top_k = top_k;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.params.top_p = top_p;
        self
    }

    /// Validate the sampling parameters.
    pub fn validate(&self) -> Result<()> {
        self.params.validate()
    }
}

/// Specification for loading a model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub path: PathBuf,
    /// Parameters the engine is initialized with; requests may override them.
    pub params: SamplingParams,
}

impl ModelSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            params: SamplingParams::default(),
        }
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }
}

/// Lifecycle of an engine handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Unloaded,
    Loading,
    Ready,
    Disposed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Unloaded => write!(f, "unloaded"),
            EngineState::Loading => write!(f, "loading"),
            EngineState::Ready => write!(f, "ready"),
            EngineState::Disposed => write!(f, "disposed"),
        }
    }
}

/// Lazy, forward-only sequence of decoded token text.
///
/// Borrows the engine that produced it. `None` means the engine finished normally;
/// an `Err` item is a fault and no further items should be requested.
pub type TokenStream<'a> = Box<dyn Iterator<Item = Result<String>> + 'a>;

/// The core engine trait: everything else plugs into this.
///
/// Implementations own tokenization, sampling, and decoding. The session layer only
/// consumes the token stream and propagates its failures.
pub trait CompletionEngine: Send {
    /// Load model weights from disk. Called at most once per handle.
    fn load(&mut self, spec: &ModelSpec) -> Result<()>;

    /// Start producing tokens for `request`.
    ///
    /// Implementations are expected to honor `request.params` (stop words and
    /// max tokens in particular); [`StopWordStream`] does this for raw iterators.
    fn stream_completion(&mut self, request: &GenerationRequest) -> Result<TokenStream<'_>>;

    /// Release native resources. The handle must not be used afterwards.
    fn dispose(&mut self);
}

impl<E: CompletionEngine + ?Sized> CompletionEngine for Box<E> {
    fn load(&mut self, spec: &ModelSpec) -> Result<()> {
        (**self).load(spec)
    }

    fn stream_completion(&mut self, request: &GenerationRequest) -> Result<TokenStream<'_>> {
        (**self).stream_completion(request)
    }

    fn dispose(&mut self) {
        (**self).dispose()
    }
}
