//! Telemetry hooks for inference performance measurement.
//!
//! Provides:
//! - [`InferenceMetrics`]: TTFT, tokens/sec, decoding speed and generation summary
//! - [`compute_metrics`]: pure computation over a token arrival timeline
//! - [`TelemetryHook`] trait: callback interface for real-time metric reporting
//! - [`InferenceTimer`]: records timestamps and computes metrics
//! - [`NoopTelemetry`] / [`LogTelemetry`]: built-in hook implementations

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Aggregate metrics from a generation run.
///
/// Rates that would divide by zero (no tokens, no elapsed time) are reported as `0.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InferenceMetrics {
    /// Time from session start to the first token in milliseconds.
    pub ttft_ms: f64,
    /// Time from the first token to the end of generation in milliseconds.
    pub decoding_time_ms: f64,
    /// Total wall-clock time in milliseconds.
    pub total_time_ms: f64,
    /// Tokens per second over the whole response, including first-token latency.
    pub tokens_per_sec: f64,
    /// Tokens per second after the first token.
    pub decoding_speed: f64,
    /// Number of tokens delivered.
    pub token_count: usize,
}

fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Compute metrics from a token arrival timeline.
///
/// `first_token` is `None` when no token ever arrived. Differences between
/// instants saturate at zero.
pub fn compute_metrics(
    start: Instant,
    first_token: Option<Instant>,
    token_count: usize,
    end: Instant,
) -> InferenceMetrics {
    let total = end.saturating_duration_since(start);
    let (ttft, decoding) = match first_token {
        Some(first) if token_count > 0 => (
            first.saturating_duration_since(start),
            end.saturating_duration_since(first),
        ),
        _ => (Duration::ZERO, Duration::ZERO),
    };

    let total_secs = total.as_secs_f64();
    let tokens_per_sec = if token_count > 0 && total_secs > 0.0 {
        token_count as f64 / total_secs
    } else {
        0.0
    };

    let decoding_secs = decoding.as_secs_f64();
    let decoding_speed = if token_count > 1 && decoding_secs > 0.0 {
        (token_count - 1) as f64 / decoding_secs
    } else {
        0.0
    };

    InferenceMetrics {
        ttft_ms: as_ms(ttft),
        decoding_time_ms: as_ms(decoding),
        total_time_ms: as_ms(total),
        tokens_per_sec,
        decoding_speed,
        token_count,
    }
}

/// Callback trait for real-time inference telemetry.
///
/// Implementations receive events at key points during generation.
/// All methods have default no-op implementations so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called when the first token arrives. `ttft_ms` is time from start to that token.
    fn on_first_token(&self, _ttft_ms: f64) {}

    /// Called after each token arrives.
    fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {}

    /// Called when generation finishes with the full metrics summary.
    fn on_generation_complete(&self, _metrics: &InferenceMetrics) {}
}

/// Telemetry hook that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Logging telemetry hook. Emits reports through `tracing` and keeps the last one.
#[derive(Debug, Clone)]
pub struct LogTelemetry {
    last_report: Arc<Mutex<Option<InferenceMetrics>>>,
}

impl Default for LogTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self {
            last_report: Arc::new(Mutex::new(None)),
        }
    }

    /// Retrieve the last completed generation's metrics.
    pub fn last_metrics(&self) -> Option<InferenceMetrics> {
        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_first_token(&self, ttft_ms: f64) {
        tracing::debug!(ttft_ms, "first token");
    }

    fn on_generation_complete(&self, metrics: &InferenceMetrics) {
        tracing::info!(
            tokens = metrics.token_count,
            ttft_ms = metrics.ttft_ms,
            tokens_per_sec = metrics.tokens_per_sec,
            decoding_speed = metrics.decoding_speed,
            "generation complete"
        );
        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(*metrics);
    }
}

/// Records timestamps during a generation to compute [`InferenceMetrics`].
///
/// Usage:
/// 1. Call [`InferenceTimer::new`] at session start
/// 2. Call [`InferenceTimer::mark_token`] as each token arrives
/// 3. Call [`InferenceTimer::finish`] once, after the terminal token
///
/// `finish` consumes the timer, so metrics are computed at most once.
pub struct InferenceTimer {
    start: Instant,
    first_token: Option<Instant>,
    token_count: usize,
    hook: Box<dyn TelemetryHook>,
}

impl InferenceTimer {
    /// Start a new timer now.
    pub fn new(hook: Box<dyn TelemetryHook>) -> Self {
        Self::started_at(Instant::now(), hook)
    }

    /// Start a timer at an explicit instant.
    pub fn started_at(start: Instant, hook: Box<dyn TelemetryHook>) -> Self {
        Self {
            start,
            first_token: None,
            token_count: 0,
            hook,
        }
    }

    /// Mark a token arrival. The first call records time-to-first-token.
    pub fn mark_token(&mut self) {
        self.mark_token_at(Instant::now());
    }

    /// Mark a token arrival at an explicit instant.
    pub fn mark_token_at(&mut self, at: Instant) {
        if self.first_token.is_none() {
            self.first_token = Some(at);
            self.hook
                .on_first_token(as_ms(at.saturating_duration_since(self.start)));
        }
        self.token_count += 1;
        self.hook
            .on_token_generated(self.token_count, as_ms(at.saturating_duration_since(self.start)));
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn first_token_at(&self) -> Option<Instant> {
        self.first_token
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    /// Finalize now and return metrics. Fires `on_generation_complete`.
    pub fn finish(self) -> InferenceMetrics {
        self.finish_at(Instant::now())
    }

    /// Finalize at an explicit end instant.
    pub fn finish_at(self, end: Instant) -> InferenceMetrics {
        let metrics = compute_metrics(self.start, self.first_token, self.token_count, end);
        self.hook.on_generation_complete(&metrics);
        metrics
    }
}
