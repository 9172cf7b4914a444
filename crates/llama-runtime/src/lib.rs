//! # llama-runtime
//!
//! Runtime support around the engine contract: telemetry hooks that turn a token
//! arrival timeline into TTFT, tokens/sec and decoding speed, and a deterministic
//! [`MockEngine`] backend for tests and demos.

pub mod mock;
pub mod telemetry;

pub use mock::{MockEngine, MockProbe, StreamGate};
pub use telemetry::{
    compute_metrics, InferenceMetrics, InferenceTimer, LogTelemetry, NoopTelemetry,
    TelemetryHook,
};
