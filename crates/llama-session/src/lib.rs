//! # llama-session
//!
//! Streams a token-by-token completion from a locally loaded engine to a consumer.
//!
//! - [`SessionManager`] owns the engine handle on a dedicated worker thread, loads it
//!   once, admits one [`StreamingSession`] at a time and exposes cancellation.
//! - [`StreamingSession`] drives a single request: relays tokens in engine order,
//!   accumulates the response, computes metrics, and reports exactly one terminal
//!   outcome through its [`InferenceSink`].
//! - [`ChannelSink`] hands events to an async consumer over an ordered channel.

pub mod config;
pub mod error;
pub mod latch;
pub mod session_manager;
pub mod sink;
pub mod store;
pub mod streaming;

pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use latch::TerminalLatch;
pub use session_manager::SessionManager;
pub use sink::{channel_sink, ChannelSink, InferenceSink, SessionEvents, SinkEvent};
pub use store::{DirectoryModelStore, ModelStore, StaticModelStore};
pub use streaming::{OutcomeKind, SessionId, SessionReport, SessionState, StreamingSession};

pub use llama_engine::{EngineState, GenerationRequest, SamplingParams};
pub use llama_runtime::InferenceMetrics;
