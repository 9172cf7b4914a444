//! # llama-cli
//!
//! Drives one streamed completion through a [`SessionManager`] and writes tokens to an
//! output as they arrive. The bundled backend is the mock engine in echo mode, so the
//! binary exercises the full session path without model weights.

use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::pin::pin;

use llama_engine::GenerationRequest;
use llama_runtime::{InferenceMetrics, MockEngine};
use llama_session::{
    channel_sink, ModelStore, SessionConfig, SessionError, SessionManager, SinkEvent,
    StaticModelStore,
};

/// Path reported for the built-in echo backend when no model directory is given.
pub const ECHO_MODEL_PATH: &str = "builtin://echo";

/// Errors from the command line front end.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("generation cancelled")]
    Cancelled,
    #[error("session ended without a result")]
    Incomplete,
}

/// Arguments of `llama-cli generate`.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct GenerateArgs {
    /// Input prompt text.
    #[arg(short, long)]
    pub prompt: String,

    /// Maximum number of tokens to generate.
    #[arg(short, long)]
    pub max_tokens: Option<usize>,

    /// Sampling temperature (must be > 0).
    #[arg(short, long)]
    pub temperature: Option<f32>,

    /// Top-k cutoff.
    #[arg(long)]
    pub top_k: Option<usize>,

    /// Nucleus sampling mass, in (0, 1].
    #[arg(long)]
    pub top_p: Option<f32>,

    /// Stop word; repeat for several. Replaces the configured stop words.
    #[arg(long = "stop")]
    pub stop: Vec<String>,

    /// Directory holding the model files. Without it the built-in echo model is used.
    #[arg(long)]
    pub model_dir: Option<PathBuf>,

    /// JSON session config file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Result of a completed generation.
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub response: String,
    pub metrics: InferenceMetrics,
}

/// Resolve the session config: file (if any), then flag overrides.
pub fn load_config(args: &GenerateArgs) -> Result<SessionConfig, CliError> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_json_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(dir) = &args.model_dir {
        config.model_dir = dir.clone();
    }
    Ok(config)
}

/// Build the request from config defaults and flag overrides.
pub fn build_request(config: &SessionConfig, args: &GenerateArgs) -> GenerationRequest {
    let mut request = config.request(args.prompt.clone());
    if let Some(max_tokens) = args.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }
    if let Some(temperature) = args.temperature {
        request = request.with_temperature(temperature);
    }
    if let Some(top_k) = args.top_k {
        request = request.with_top_k(top_k);
    }
    if let Some(top_p) = args.top_p {
        request = request.with_top_p(top_p);
    }
    if !args.stop.is_empty() {
        request = request.with_stop_words(args.stop.iter().cloned());
    }
    request
}

fn model_store(config: &SessionConfig, args: &GenerateArgs) -> Box<dyn ModelStore> {
    if args.model_dir.is_some() || args.config.is_some() {
        Box::new(config.model_store())
    } else {
        Box::new(StaticModelStore::available(ECHO_MODEL_PATH))
    }
}

/// Run one session, writing tokens to `out` as they arrive.
///
/// When `cancel` resolves the session is cancelled and [`CliError::Cancelled`] is
/// returned once the worker acknowledges it.
pub async fn generate<W, C>(
    args: &GenerateArgs,
    out: &mut W,
    cancel: C,
) -> Result<GenerateOutcome, CliError>
where
    W: Write,
    C: Future<Output = ()>,
{
    let config = load_config(args)?;
    let request = build_request(&config, args);
    let store = model_store(&config, args);

    let manager = SessionManager::spawn(store, config, MockEngine::new)?;
    let path = manager.load_model().await?;
    tracing::info!(path = %path.display(), "model ready");

    let (sink, mut events) = channel_sink();
    let id = manager.start_session(request, sink)?;

    let mut cancel = pin!(cancel);
    let mut cancel_requested = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SinkEvent::Started) => tracing::debug!(session_id = %id, "generation started"),
                Some(SinkEvent::Token(token)) => {
                    write!(out, "{token}")?;
                    out.flush()?;
                }
                Some(SinkEvent::Completed { response, metrics }) => {
                    writeln!(out)?;
                    return Ok(GenerateOutcome { response, metrics });
                }
                Some(SinkEvent::Failed(message)) => return Err(CliError::Generation(message)),
                Some(SinkEvent::Cancelled) => return Err(CliError::Cancelled),
                None => return Err(CliError::Incomplete),
            },
            _ = &mut cancel, if !cancel_requested => {
                cancel_requested = true;
                if !manager.cancel(id) {
                    tracing::debug!(session_id = %id, "session already finished");
                }
            }
        }
    }
}

/// One-line summary of a generation's timing.
pub fn format_metrics(metrics: &InferenceMetrics) -> String {
    format!(
        "{} tokens | ttft {:.1} ms | total {:.1} ms | {:.2} tok/s | decode {:.2} tok/s",
        metrics.token_count,
        metrics.ttft_ms,
        metrics.total_time_ms,
        metrics.tokens_per_sec,
        metrics.decoding_speed,
    )
}
